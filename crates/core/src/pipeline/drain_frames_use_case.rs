use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::producer::domain::source_descriptor::SourceDescriptor;
use crate::video::domain::video_reader::VideoReader;
use crate::video::domain::video_writer::VideoWriter;

use super::pipeline_logger::PipelineLogger;

pub type ProgressCallback = Box<dyn Fn(usize, Option<usize>) -> bool + Send>;

/// Outcome of a finished drain run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainReport {
    pub frames_written: usize,
    /// `true` when the run ended early through the cancel flag or the
    /// progress callback.
    pub cancelled: bool,
}

/// Pulls every frame of a source in order and writes it out.
///
/// Single-use: `execute` consumes the reader and writer. The first read or
/// write error ends the run after every earlier frame has been written;
/// both ends are closed either way.
pub struct DrainFramesUseCase {
    reader: Option<Box<dyn VideoReader>>,
    writer: Option<Box<dyn VideoWriter>>,
    logger: Box<dyn PipelineLogger>,
    on_progress: Option<ProgressCallback>,
    cancelled: Arc<AtomicBool>,
}

impl DrainFramesUseCase {
    pub fn new(
        reader: Box<dyn VideoReader>,
        writer: Box<dyn VideoWriter>,
        logger: Box<dyn PipelineLogger>,
        on_progress: Option<ProgressCallback>,
        cancelled: Option<Arc<AtomicBool>>,
    ) -> Self {
        Self {
            reader: Some(reader),
            writer: Some(writer),
            logger,
            on_progress,
            cancelled: cancelled.unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
        }
    }

    pub fn execute(
        &mut self,
        descriptor: &SourceDescriptor,
        output_path: &Path,
    ) -> Result<DrainReport, Box<dyn std::error::Error>> {
        let mut reader = self.reader.take().ok_or("Drain already executed")?;
        let mut writer = self.writer.take().ok_or("Drain already executed")?;

        let metadata = reader.open(descriptor)?;
        self.logger.info(&format!(
            "Reading '{}': {}x{} {} @ {:.3} fps, SAR {}:{}, {} frames",
            descriptor.source(),
            metadata.width,
            metadata.height,
            metadata.format,
            metadata.fps(),
            metadata.sar_num,
            metadata.sar_den,
            metadata
                .total_frames
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string()),
        ));
        if let Err(e) = writer.open(output_path, &metadata) {
            reader.close();
            return Err(e);
        }

        let total = metadata.total_frames;
        let mut written = 0;
        let mut cancelled = false;
        let mut outcome: Result<(), Box<dyn std::error::Error>> = Ok(());
        {
            let mut frames = reader.frames();
            loop {
                if self.cancelled.load(Ordering::Relaxed) {
                    cancelled = true;
                    break;
                }

                let started = Instant::now();
                let Some(next) = frames.next() else { break };
                self.logger.timing("pull", elapsed_ms(started));
                let frame = match next {
                    Ok(frame) => frame,
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                };

                let started = Instant::now();
                if let Err(e) = writer.write(&frame) {
                    outcome = Err(e);
                    break;
                }
                self.logger.timing("write", elapsed_ms(started));

                written += 1;
                self.logger.progress(written, total);
                if let Some(ref callback) = self.on_progress {
                    if !callback(written, total) {
                        cancelled = true;
                        break;
                    }
                }
            }
        }

        if let Some(peak) = reader.peak_in_flight() {
            self.logger.metric("peak_in_flight", peak as f64);
        }
        reader.close();
        let closed = writer.close();

        if cancelled {
            self.logger
                .info(&format!("Drain cancelled after {written} frames"));
        }
        self.logger.summary();

        outcome?;
        closed?;
        Ok(DrainReport {
            frames_written: written,
            cancelled,
        })
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
