use std::sync::Arc;

use crate::producer::domain::frame_producer::FrameProducer;
use crate::producer::domain::source_descriptor::SourceDescriptor;
use crate::scheduler::async_frame_scheduler::{AsyncFrameScheduler, SchedulerStats};
use crate::scheduler::scheduler_config::SchedulerConfig;
use crate::shared::frame::Frame;
use crate::shared::video_metadata::VideoMetadata;
use crate::video::domain::video_reader::VideoReader;

/// [`VideoReader`] backed by an [`AsyncFrameScheduler`].
///
/// `open` evaluates the source and primes the request window. The reported
/// metadata counts the frames this run delivers (after seek and limit), not
/// the length of the whole source. Closing or dropping the reader stops the
/// scheduler.
pub struct ScheduledVideoReader<P: FrameProducer> {
    producer: Arc<P>,
    config: SchedulerConfig,
    scheduler: Option<AsyncFrameScheduler<P>>,
}

impl<P: FrameProducer> ScheduledVideoReader<P> {
    pub fn new(producer: Arc<P>, config: SchedulerConfig) -> Self {
        Self {
            producer,
            config,
            scheduler: None,
        }
    }

    /// Scheduler counters of the current run, if one is open.
    pub fn stats(&self) -> Option<SchedulerStats> {
        self.scheduler.as_ref().map(|s| s.stats())
    }
}

impl<P: FrameProducer> VideoReader for ScheduledVideoReader<P> {
    fn open(
        &mut self,
        descriptor: &SourceDescriptor,
    ) -> Result<VideoMetadata, Box<dyn std::error::Error>> {
        self.close();

        let scheduler = AsyncFrameScheduler::new(
            Arc::clone(&self.producer),
            descriptor.clone(),
            self.config.clone(),
        );
        scheduler.start()?;

        let mut metadata = scheduler
            .metadata()
            .cloned()
            .ok_or("ScheduledVideoReader: scheduler started without metadata")?;
        metadata.total_frames = scheduler.total_frames();
        self.scheduler = Some(scheduler);
        Ok(metadata)
    }

    fn frames(
        &mut self,
    ) -> Box<dyn Iterator<Item = Result<Frame, Box<dyn std::error::Error>>> + '_> {
        let Some(scheduler) = self.scheduler.as_ref() else {
            return Box::new(std::iter::once(Err(
                "ScheduledVideoReader: not opened".into()
            )));
        };

        let mut done = false;
        Box::new(std::iter::from_fn(move || {
            if done {
                return None;
            }
            match scheduler.pull() {
                Ok(Some(frame)) => Some(Ok(frame)),
                Ok(None) => {
                    done = true;
                    None
                }
                Err(e) => {
                    done = true;
                    Some(Err(e.into()))
                }
            }
        }))
    }

    fn peak_in_flight(&self) -> Option<usize> {
        self.stats().map(|s| s.peak_pending)
    }

    fn close(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
            let stats = scheduler.stats();
            log::debug!(
                "Reader closed after {} requests, {} completions, peak {} in flight",
                stats.requested,
                stats.completed,
                stats.peak_pending
            );
        }
    }
}

impl<P: FrameProducer> Drop for ScheduledVideoReader<P> {
    fn drop(&mut self) {
        self.close();
    }
}
