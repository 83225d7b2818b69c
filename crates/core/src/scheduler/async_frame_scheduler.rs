use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::producer::domain::frame_producer::{FrameProducer, ProducerError};
use crate::producer::domain::source_descriptor::SourceDescriptor;
use crate::shared::constants::FAILED_DRAIN_TIMEOUT_MS;
use crate::shared::frame::Frame;
use crate::shared::video_metadata::VideoMetadata;

use super::completion_gate::{GateOutcome, OpenError};
use super::error::{ProtocolViolation, PullError, StartupError};
use super::frame_slot::SlotPayload;
use super::lifecycle_guard::{DrainBarrier, DrainToken, LifecycleGuard, LifecycleState};
use super::lock_unpoisoned;
use super::scheduler_config::SchedulerConfig;
use super::slot_registry::SlotRegistry;
use super::window_controller::WindowController;

/// Point-in-time view of the scheduler's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub window_size: usize,
    pub requested: usize,
    pub completed: usize,
    pub next_frame: usize,
    pub pending: usize,
    pub peak_pending: usize,
    pub live_slots: usize,
}

/// Pulls frames from an asynchronous [`FrameProducer`] and hands them to a
/// single consumer in ascending index order.
///
/// A fixed window of requests stays in flight. Completions may arrive in
/// any order on any thread; [`pull`](Self::pull) always waits for exactly
/// the next index. Wrap the scheduler in an `Arc` to call
/// [`stop`](Self::stop) from another thread while the consumer is blocked.
pub struct AsyncFrameScheduler<P: FrameProducer> {
    inner: Arc<Inner<P>>,
}

struct Inner<P: FrameProducer> {
    producer: Arc<P>,
    descriptor: SourceDescriptor,
    config: SchedulerConfig,
    lifecycle: LifecycleGuard,
    barrier: Arc<DrainBarrier>,
    registry: SlotRegistry<P::NativeFrame>,
    session: OnceLock<Session<P>>,
    failure: Mutex<Option<PullError>>,
    startup: Mutex<()>,
    consumer: Mutex<()>,
}

/// Everything that only exists once the source has been evaluated.
struct Session<P: FrameProducer> {
    source: Mutex<Option<P::Source>>,
    node: P::Node,
    metadata: VideoMetadata,
    window: WindowController,
}

impl<P: FrameProducer> AsyncFrameScheduler<P> {
    pub fn new(producer: Arc<P>, descriptor: SourceDescriptor, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                producer,
                descriptor,
                config,
                lifecycle: LifecycleGuard::new(),
                barrier: Arc::new(DrainBarrier::new()),
                registry: SlotRegistry::new(),
                session: OnceLock::new(),
                failure: Mutex::new(None),
                startup: Mutex::new(()),
                consumer: Mutex::new(()),
            }),
        }
    }

    /// Evaluates the source and primes the request window.
    pub fn start(&self) -> Result<(), StartupError> {
        let inner = &self.inner;
        let _startup = lock_unpoisoned(&inner.startup);

        match inner.lifecycle.state() {
            LifecycleState::Created => {}
            LifecycleState::Running => return Err(StartupError::InvalidState("running")),
            LifecycleState::Stopping | LifecycleState::Stopped => {
                return Err(StartupError::InvalidState("stopped"))
            }
        }

        let result = inner.open_session();
        if let Err(e) = &result {
            log::error!("Failed to start frame scheduler: {e}");
            if inner.lifecycle.begin_stop().is_some() {
                inner.lifecycle.finish_stop();
            }
            return result;
        }

        if let Err(state) = inner.lifecycle.mark_running() {
            return Err(StartupError::InvalidState(match state {
                LifecycleState::Running => "running",
                _ => "stopped",
            }));
        }

        let Some(session) = inner.session.get() else {
            return Err(StartupError::InvalidState("created"));
        };
        let initial = session.window.initial_requests();
        let mut issued = 0;
        for _ in 0..initial {
            if inner.issue_next() {
                issued += 1;
            }
        }

        log::info!(
            "Frame scheduler started: {}x{} @ {:.3} fps, frames {}..{}, window {} ({issued} requests primed)",
            session.metadata.width,
            session.metadata.height,
            session.metadata.fps(),
            session.window.first(),
            session
                .window
                .end()
                .map_or_else(|| "open".to_string(), |end| end.to_string()),
            session.window.window_size(),
        );
        Ok(())
    }

    /// Returns the next frame in index order, `Ok(None)` once the range is
    /// exhausted, or the latched error after any failure.
    pub fn pull(&self) -> Result<Option<Frame>, PullError> {
        let inner = &self.inner;
        let _consumer = lock_unpoisoned(&inner.consumer);
        // A start in progress finishes priming before the first wait.
        drop(lock_unpoisoned(&inner.startup));

        match inner.lifecycle.state() {
            LifecycleState::Created => return Err(PullError::NotStarted),
            LifecycleState::Stopping | LifecycleState::Stopped => return Err(PullError::Stopped),
            LifecycleState::Running => {}
        }
        if let Some(err) = inner.latched_failure() {
            return Err(err);
        }
        let session = inner.session.get().ok_or(PullError::NotStarted)?;
        if session.window.is_exhausted() {
            return Ok(None);
        }

        let _token: DrainToken = inner.barrier.enter();
        if inner.lifecycle.is_abandoned() {
            return Err(PullError::Stopped);
        }

        let index = session.window.next_deliver();
        let Some(slot) = inner.registry.get(index) else {
            let err = PullError::from(ProtocolViolation::MissingSlot(index));
            inner.latch(err.clone());
            return Err(err);
        };

        let started = Instant::now();
        match slot.gate().wait(inner.config.wait_timeout) {
            GateOutcome::Opened(SlotPayload::Ready(native)) => {
                inner.registry.remove(index);
                let picture = inner.producer.copy_picture(&native, index);
                inner.producer.release_frame(native);
                match picture {
                    Ok(frame) => {
                        session.window.advance_delivery();
                        inner.issue_next();
                        Ok(Some(frame))
                    }
                    Err(e) => Err(inner.fail(PullError::producer_failure(index, &e))),
                }
            }
            GateOutcome::Opened(SlotPayload::Failed(e)) => {
                inner.registry.remove(index);
                Err(inner.fail(PullError::producer_failure(index, &e)))
            }
            GateOutcome::TimedOut => Err(inner.fail(PullError::Timeout {
                index,
                waited: started.elapsed(),
            })),
            GateOutcome::Cancelled => Err(inner.latched_failure().unwrap_or(PullError::Stopped)),
        }
    }

    /// Stops issuing requests, interrupts a blocked [`pull`](Self::pull),
    /// waits out in-flight callbacks, returns every undelivered frame to the
    /// producer and shuts the producer down. Calling it again is a no-op.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    /// Format of the output node; `None` before a successful start.
    pub fn metadata(&self) -> Option<&VideoMetadata> {
        self.inner.session.get().map(|s| &s.metadata)
    }

    pub fn width(&self) -> u32 {
        self.metadata().map_or(0, |m| m.width)
    }

    pub fn height(&self) -> u32 {
        self.metadata().map_or(0, |m| m.height)
    }

    /// Number of frames this run delivers; `None` for an open-ended source.
    pub fn total_frames(&self) -> Option<usize> {
        let window = &self.inner.session.get()?.window;
        window.end().map(|end| end.saturating_sub(window.first()))
    }

    /// Index of the next frame `pull` will return.
    pub fn next_frame(&self) -> usize {
        self.inner
            .session
            .get()
            .map_or(self.inner.config.first_frame, |s| s.window.next_deliver())
    }

    pub fn is_failed(&self) -> bool {
        self.inner.latched_failure().is_some()
    }

    pub fn stats(&self) -> SchedulerStats {
        let Some(session) = self.inner.session.get() else {
            return SchedulerStats::default();
        };
        let window = &session.window;
        SchedulerStats {
            window_size: window.window_size(),
            requested: window.requested_count(),
            completed: window.completed_count(),
            next_frame: window.next_deliver(),
            pending: window.pending(),
            peak_pending: window.peak_pending(),
            live_slots: self.inner.registry.len(),
        }
    }

    pub fn producer(&self) -> &P {
        &self.inner.producer
    }
}

impl<P: FrameProducer> Drop for AsyncFrameScheduler<P> {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl<P: FrameProducer> Inner<P> {
    fn open_session(&self) -> Result<(), StartupError> {
        let window_size = self.config.resolved_window_size();
        if window_size == 0 {
            return Err(StartupError::InvalidConfig(
                "window size must be at least 1".to_string(),
            ));
        }

        self.producer
            .initialize()
            .map_err(StartupError::ProducerUnavailable)?;

        let source = match self.producer.evaluate_source(&self.descriptor) {
            Ok(source) => source,
            Err(source) => {
                self.producer.finalize();
                return Err(StartupError::SourceEvaluation {
                    name: self.descriptor.source().to_string(),
                    source,
                });
            }
        };

        let output_index = self.config.output_index;
        let opened = self
            .producer
            .output_node(&source, output_index)
            .and_then(|node| Ok((self.producer.node_info(&node)?, node)));
        let (metadata, node) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                self.abort_startup(source);
                return Err(StartupError::OutputNode {
                    index: output_index,
                    source: e,
                });
            }
        };

        let first = self.config.first_frame;
        if let Some(total) = metadata.total_frames {
            if first > total {
                self.abort_startup(source);
                return Err(StartupError::InvalidConfig(format!(
                    "first frame {first} is beyond the end of a {total}-frame source"
                )));
            }
        }

        let end = self.config.range_end(metadata.total_frames);
        let session = Session {
            source: Mutex::new(Some(source)),
            node,
            metadata,
            window: WindowController::new(window_size, first, end),
        };
        if let Err(session) = self.session.set(session) {
            if let Some(source) = lock_unpoisoned(&session.source).take() {
                self.abort_startup(source);
            }
            return Err(StartupError::InvalidState("running"));
        }
        Ok(())
    }

    /// How long `stop` waits for in-flight callbacks. Once a failure is
    /// latched the producer may never answer, so the wait is bounded even
    /// without a configured drain timeout.
    fn drain_bound(&self) -> Option<Duration> {
        self.config.drain_timeout.or_else(|| {
            self.latched_failure().map(|_| {
                self.config
                    .wait_timeout
                    .unwrap_or(Duration::from_millis(FAILED_DRAIN_TIMEOUT_MS))
            })
        })
    }

    fn abort_startup(&self, source: P::Source) {
        self.producer.shutdown_producer(source);
        self.producer.finalize();
    }

    /// Requests the next frame if the window and range allow it.
    fn issue_next(self: &Arc<Self>) -> bool {
        let Some(session) = self.session.get() else {
            return false;
        };
        if self.latched_failure().is_some() {
            return false;
        }

        let reserved = self
            .lifecycle
            .while_running(|| {
                let index = session.window.reserve_next()?;
                if self.registry.allocate(index).is_none() {
                    log::error!("Slot for frame {index} already exists");
                }
                Some((index, self.barrier.enter()))
            })
            .flatten();
        let Some((index, token)) = reserved else {
            return false;
        };

        log::debug!("Requesting frame {index}");
        let request = PendingRequest {
            inner: Arc::clone(self),
            index,
            delivered: false,
            _token: token,
        };
        self.producer.request_frame_async(
            &session.node,
            index,
            Box::new(move |reported, result| request.complete(reported, result)),
        );
        true
    }

    /// Runs on producer threads.
    fn on_completion(&self, index: usize, result: Result<P::NativeFrame, ProducerError>) {
        if let Some(session) = self.session.get() {
            session.window.record_completion();
        }

        if self.lifecycle.is_abandoned() {
            log::debug!("Discarding frame {index}: scheduler is stopping");
            self.release(result);
            return;
        }

        let Some(slot) = self.registry.get(index) else {
            self.release(result);
            if !self.lifecycle.is_abandoned() {
                self.violate(ProtocolViolation::UnknownIndex(index));
            }
            return;
        };

        match slot.gate().open(result.into()) {
            Ok(()) => log::debug!("Frame {index} completed"),
            Err(OpenError::AlreadyOpened(payload)) => {
                self.release_payload(payload);
                self.violate(ProtocolViolation::DuplicateDelivery(index));
            }
            Err(OpenError::Cancelled(payload)) => self.release_payload(payload),
        }
    }

    /// Runs on producer threads when a callback names a different index than
    /// the one it was issued for. The requested slot can never be filled, so
    /// the mismatch is fatal either way.
    fn on_misreported(
        &self,
        requested: usize,
        reported: usize,
        result: Result<P::NativeFrame, ProducerError>,
    ) {
        if let Some(session) = self.session.get() {
            session.window.record_completion();
        }
        self.release(result);
        if self.lifecycle.is_abandoned() {
            return;
        }

        let violation = match self.registry.get(reported) {
            None => ProtocolViolation::UnknownIndex(reported),
            Some(slot) if !slot.is_pending() => ProtocolViolation::DuplicateDelivery(reported),
            Some(_) => ProtocolViolation::MismatchedIndex {
                requested,
                reported,
            },
        };
        self.violate(violation);
    }

    fn violate(&self, violation: ProtocolViolation) {
        log::error!("Frame producer broke the request contract: {violation}");
        self.latch(violation.into());
        self.wake_consumer();
    }

    /// Cancels the slot the consumer waits on so it observes a latched
    /// failure instead of blocking forever.
    fn wake_consumer(&self) {
        let Some(session) = self.session.get() else {
            return;
        };
        if let Some(slot) = self.registry.get(session.window.next_deliver()) {
            if let Some(payload) = slot.gate().cancel() {
                self.release_payload(payload);
            }
        }
    }

    fn fail(&self, err: PullError) -> PullError {
        log::error!("Frame scheduler failed: {err}");
        self.latch(err.clone());
        err
    }

    fn latch(&self, err: PullError) {
        let mut failure = lock_unpoisoned(&self.failure);
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn latched_failure(&self) -> Option<PullError> {
        lock_unpoisoned(&self.failure).clone()
    }

    fn release(&self, result: Result<P::NativeFrame, ProducerError>) {
        if let Ok(frame) = result {
            self.producer.release_frame(frame);
        }
    }

    fn release_payload(&self, payload: SlotPayload<P::NativeFrame>) {
        if let Some(frame) = payload.into_frame() {
            self.producer.release_frame(frame);
        }
    }

    fn stop(&self) {
        let _startup = lock_unpoisoned(&self.startup);
        let Some(previous) = self.lifecycle.begin_stop() else {
            return;
        };

        let Some(session) = self.session.get() else {
            self.lifecycle.finish_stop();
            return;
        };

        log::info!(
            "Stopping frame scheduler at frame {} ({} requests in flight, was {previous:?})",
            session.window.next_deliver(),
            session.window.pending(),
        );

        for slot in self.registry.snapshot() {
            if let Some(payload) = slot.gate().cancel() {
                self.release_payload(payload);
            }
        }

        let bound = self.drain_bound();
        if !self.barrier.wait_idle(bound) {
            log::warn!(
                "{} frame requests still outstanding after {:?}; late completions will be discarded",
                self.barrier.outstanding(),
                bound.unwrap_or_default(),
            );
        }

        for slot in self.registry.drain() {
            if let Some(payload) = slot.gate().cancel() {
                self.release_payload(payload);
            }
        }

        if let Some(source) = lock_unpoisoned(&session.source).take() {
            self.producer.shutdown_producer(source);
        }
        self.producer.finalize();
        self.lifecycle.finish_stop();

        log::info!(
            "Frame scheduler stopped: {} requested, {} completed",
            session.window.requested_count(),
            session.window.completed_count(),
        );
    }
}

/// Owned by the callback handed to the producer. Dropping it without a
/// completion reports a failure for its index so the consumer never waits
/// on a request the producer discarded.
struct PendingRequest<P: FrameProducer> {
    inner: Arc<Inner<P>>,
    index: usize,
    delivered: bool,
    _token: DrainToken,
}

impl<P: FrameProducer> PendingRequest<P> {
    fn complete(mut self, reported: usize, result: Result<P::NativeFrame, ProducerError>) {
        self.delivered = true;
        if reported == self.index {
            self.inner.on_completion(reported, result);
        } else {
            self.inner.on_misreported(self.index, reported, result);
        }
    }
}

impl<P: FrameProducer> Drop for PendingRequest<P> {
    fn drop(&mut self) {
        if !self.delivered {
            log::warn!("Request for frame {} was dropped without completing", self.index);
            self.inner.on_completion(
                self.index,
                Err(ProducerError::new("request dropped before completion")),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::domain::frame_producer::FrameCallback;
    use rstest::rstest;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    // --- Scripted producer ---

    #[derive(Debug, PartialEq)]
    struct Native(usize);

    /// Holds every callback until the test completes it, unless
    /// `auto_complete` is set, in which case requests finish synchronously.
    #[derive(Default)]
    struct ScriptedProducer {
        total: Option<usize>,
        fail_evaluate: bool,
        fail_at: Option<usize>,
        auto_complete: bool,
        requests: Mutex<Vec<usize>>,
        callbacks: Mutex<BTreeMap<usize, FrameCallback<Native>>>,
        released: Mutex<Vec<usize>>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        shutdowns: AtomicUsize,
        finalizes: AtomicUsize,
    }

    impl ScriptedProducer {
        fn manual(total: usize) -> Self {
            Self {
                total: Some(total),
                ..Self::default()
            }
        }

        fn auto(total: usize) -> Self {
            Self {
                total: Some(total),
                auto_complete: true,
                ..Self::default()
            }
        }

        fn result_for(&self, index: usize) -> Result<Native, ProducerError> {
            if self.fail_at == Some(index) {
                Err(ProducerError::new(format!("filter error at {index}")))
            } else {
                Ok(Native(index))
            }
        }

        fn complete(&self, index: usize) {
            self.complete_as(index, index);
        }

        /// Fires the callback for `requested`, reporting `reported` as its index.
        fn complete_as(&self, requested: usize, reported: usize) {
            let callback = self
                .callbacks
                .lock()
                .unwrap()
                .remove(&requested)
                .expect("no outstanding request");
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            callback(reported, self.result_for(reported));
        }

        fn outstanding(&self) -> Vec<usize> {
            self.callbacks.lock().unwrap().keys().copied().collect()
        }

        fn requests(&self) -> Vec<usize> {
            self.requests.lock().unwrap().clone()
        }

        fn released(&self) -> Vec<usize> {
            let mut released = self.released.lock().unwrap().clone();
            released.sort_unstable();
            released
        }

        fn drop_outstanding(&self) {
            let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap());
            self.in_flight.fetch_sub(callbacks.len(), Ordering::SeqCst);
            drop(callbacks);
        }
    }

    impl FrameProducer for ScriptedProducer {
        type Source = ();
        type Node = ();
        type NativeFrame = Native;

        fn initialize(&self) -> Result<(), ProducerError> {
            Ok(())
        }

        fn evaluate_source(&self, _descriptor: &SourceDescriptor) -> Result<(), ProducerError> {
            if self.fail_evaluate {
                Err(ProducerError::new("syntax error on line 3"))
            } else {
                Ok(())
            }
        }

        fn output_node(&self, _source: &(), output_index: usize) -> Result<(), ProducerError> {
            if output_index == 0 {
                Ok(())
            } else {
                Err(ProducerError::new("no such output"))
            }
        }

        fn node_info(&self, _node: &()) -> Result<VideoMetadata, ProducerError> {
            Ok(VideoMetadata {
                width: 4,
                height: 2,
                channels: 3,
                fps_num: 25,
                fps_den: 1,
                sar_num: 1,
                sar_den: 1,
                total_frames: self.total,
                format: "rgb24".to_string(),
            })
        }

        fn request_frame_async(&self, _node: &(), index: usize, on_done: FrameCallback<Native>) {
            self.requests.lock().unwrap().push(index);
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            if self.auto_complete {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                on_done(index, self.result_for(index));
            } else {
                self.callbacks.lock().unwrap().insert(index, on_done);
            }
        }

        fn copy_picture(&self, frame: &Native, index: usize) -> Result<Frame, ProducerError> {
            assert_eq!(frame.0, index, "picture copied for the wrong slot");
            Ok(Frame::new(vec![index as u8; 4 * 2 * 3], 4, 2, 3, index))
        }

        fn release_frame(&self, frame: Native) {
            self.released.lock().unwrap().push(frame.0);
        }

        fn shutdown_producer(&self, _source: ()) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn finalize(&self) {
            self.finalizes.fetch_add(1, Ordering::SeqCst);
        }
    }

    // --- Helpers ---

    fn scheduler(
        producer: &Arc<ScriptedProducer>,
        config: SchedulerConfig,
    ) -> AsyncFrameScheduler<ScriptedProducer> {
        AsyncFrameScheduler::new(
            Arc::clone(producer),
            SourceDescriptor::new("clip.vpy"),
            config,
        )
    }

    /// Bounded drain so tests that leave requests unanswered still tear down.
    fn window(size: usize) -> SchedulerConfig {
        SchedulerConfig {
            drain_timeout: Some(Duration::from_millis(50)),
            ..SchedulerConfig::default()
        }
        .with_window_size(size)
    }

    fn drain_indices(scheduler: &AsyncFrameScheduler<ScriptedProducer>) -> Vec<usize> {
        let mut indices = Vec::new();
        while let Some(frame) = scheduler.pull().unwrap() {
            indices.push(frame.index());
        }
        indices
    }

    // --- Ordering ---

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3, 4])]
    #[case::reversed(vec![4, 3, 2, 1, 0])]
    #[case::interleaved(vec![1, 3, 0, 4, 2])]
    #[case::last_first(vec![4, 0, 1, 2, 3])]
    #[case::first_last(vec![1, 2, 3, 4, 0])]
    fn test_delivers_in_index_order_for_any_completion_order(#[case] order: Vec<usize>) {
        let producer = Arc::new(ScriptedProducer::manual(5));
        let s = scheduler(&producer, window(5));
        s.start().unwrap();
        assert_eq!(producer.outstanding(), vec![0, 1, 2, 3, 4]);

        for index in order {
            producer.complete(index);
        }

        assert_eq!(drain_indices(&s), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_in_order_with_concurrent_reverse_completions() {
        const TOTAL: usize = 40;
        const W: usize = 4;
        let producer = Arc::new(ScriptedProducer::manual(TOTAL));
        let s = scheduler(&producer, window(W));
        s.start().unwrap();

        let completer = {
            let producer = Arc::clone(&producer);
            thread::spawn(move || loop {
                // Always answer the newest request first.
                if let Some(&newest) = producer.outstanding().last() {
                    producer.complete(newest);
                } else if producer.requests().len() == TOTAL {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            })
        };

        assert_eq!(drain_indices(&s), (0..TOTAL).collect::<Vec<_>>());
        completer.join().unwrap();
        assert!(producer.peak_in_flight.load(Ordering::SeqCst) <= W);
    }

    #[test]
    fn test_pull_blocks_until_next_index_even_if_later_ones_are_ready() {
        let producer = Arc::new(ScriptedProducer::manual(3));
        let s = Arc::new(scheduler(&producer, window(3)));
        s.start().unwrap();
        producer.complete(2);
        producer.complete(1);

        let consumer = {
            let s = Arc::clone(&s);
            thread::spawn(move || s.pull().unwrap().map(|f| f.index()))
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!consumer.is_finished());

        producer.complete(0);
        assert_eq!(consumer.join().unwrap(), Some(0));
        assert_eq!(s.pull().unwrap().map(|f| f.index()), Some(1));
    }

    // --- Window ---

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(8)]
    fn test_window_bound_and_single_issuance(#[case] w: usize) {
        let producer = Arc::new(ScriptedProducer::auto(20));
        let s = scheduler(&producer, window(w));
        s.start().unwrap();

        assert_eq!(drain_indices(&s).len(), 20);
        assert_eq!(producer.requests(), (0..20).collect::<Vec<_>>());
        assert!(s.stats().peak_pending <= w);
        assert!(producer.peak_in_flight.load(Ordering::SeqCst) <= w);
    }

    #[test]
    fn test_start_primes_min_of_window_and_total() {
        let producer = Arc::new(ScriptedProducer::manual(2));
        let s = scheduler(&producer, window(6));
        s.start().unwrap();
        assert_eq!(producer.requests(), vec![0, 1]);
    }

    #[test]
    fn test_each_pull_issues_one_request() {
        let producer = Arc::new(ScriptedProducer::manual(10));
        let s = scheduler(&producer, window(2));
        s.start().unwrap();
        assert_eq!(producer.requests(), vec![0, 1]);

        producer.complete(0);
        s.pull().unwrap();
        assert_eq!(producer.requests(), vec![0, 1, 2]);
        assert_eq!(producer.outstanding(), vec![1, 2]);
    }

    #[test]
    fn test_window_of_one_matches_full_window() {
        let collect = |w: usize| {
            let producer = Arc::new(ScriptedProducer::auto(12));
            let s = scheduler(&producer, window(w));
            s.start().unwrap();
            let mut frames = Vec::new();
            while let Some(frame) = s.pull().unwrap() {
                frames.push(frame);
            }
            frames
        };
        assert_eq!(collect(1), collect(12));
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let producer = Arc::new(ScriptedProducer::manual(3));
        let s = scheduler(&producer, window(0));
        assert!(matches!(s.start(), Err(StartupError::InvalidConfig(_))));
        assert!(producer.requests().is_empty());
    }

    // --- Exhaustion and ranges ---

    #[test]
    fn test_exhausted_stream_keeps_returning_none() {
        let producer = Arc::new(ScriptedProducer::auto(3));
        let s = scheduler(&producer, window(2));
        s.start().unwrap();
        assert_eq!(drain_indices(&s), vec![0, 1, 2]);

        for _ in 0..3 {
            assert_eq!(s.pull().unwrap(), None);
        }
        assert_eq!(producer.requests().len(), 3);
        assert_eq!(s.next_frame(), 3);
    }

    #[test]
    fn test_every_frame_released_exactly_once() {
        let producer = Arc::new(ScriptedProducer::auto(6));
        let s = scheduler(&producer, window(3));
        s.start().unwrap();
        drain_indices(&s);
        assert_eq!(producer.released(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_empty_source_ends_immediately() {
        let producer = Arc::new(ScriptedProducer::auto(0));
        let s = scheduler(&producer, window(4));
        s.start().unwrap();
        assert_eq!(s.pull().unwrap(), None);
        assert!(producer.requests().is_empty());
    }

    #[test]
    fn test_seek_and_limit() {
        let producer = Arc::new(ScriptedProducer::auto(10));
        let config = window(4).with_first_frame(3).with_frame_limit(2);
        let s = scheduler(&producer, config);
        s.start().unwrap();
        assert_eq!(s.total_frames(), Some(2));
        assert_eq!(drain_indices(&s), vec![3, 4]);
        assert_eq!(producer.requests(), vec![3, 4]);
    }

    #[test]
    fn test_seek_beyond_end_fails_startup() {
        let producer = Arc::new(ScriptedProducer::auto(10));
        let s = scheduler(&producer, window(2).with_first_frame(11));
        assert!(matches!(s.start(), Err(StartupError::InvalidConfig(_))));
        assert_eq!(producer.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(producer.finalizes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_ended_source_streams_until_stopped() {
        let producer = Arc::new(ScriptedProducer {
            total: None,
            auto_complete: true,
            ..ScriptedProducer::default()
        });
        let s = scheduler(&producer, window(3));
        s.start().unwrap();
        assert_eq!(s.total_frames(), None);
        for expected in 0..50 {
            assert_eq!(s.pull().unwrap().unwrap().index(), expected);
        }
        s.stop();
        assert_eq!(s.pull(), Err(PullError::Stopped));
    }

    // --- Failures ---

    #[test]
    fn test_mid_stream_failure_is_latched() {
        let producer = Arc::new(ScriptedProducer {
            fail_at: Some(3),
            ..ScriptedProducer::auto(5)
        });
        let s = scheduler(&producer, window(2));
        s.start().unwrap();

        for expected in 0..3 {
            assert_eq!(s.pull().unwrap().unwrap().index(), expected);
        }
        let expected_err = PullError::ProducerFailure {
            index: 3,
            message: "filter error at 3".to_string(),
        };
        assert_eq!(s.pull(), Err(expected_err.clone()));
        let requests_after_failure = producer.requests().len();

        assert_eq!(s.pull(), Err(expected_err));
        assert_eq!(producer.requests().len(), requests_after_failure);
        assert!(s.is_failed());
    }

    #[test]
    fn test_failure_stops_new_requests_in_long_stream() {
        let producer = Arc::new(ScriptedProducer {
            fail_at: Some(3),
            ..ScriptedProducer::auto(100)
        });
        let s = scheduler(&producer, window(2));
        s.start().unwrap();
        for _ in 0..3 {
            s.pull().unwrap();
        }
        assert!(s.pull().is_err());
        assert!(s.pull().is_err());
        assert_eq!(producer.requests(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_source_evaluation_failure() {
        let producer = Arc::new(ScriptedProducer {
            fail_evaluate: true,
            ..ScriptedProducer::manual(5)
        });
        let s = scheduler(&producer, window(2));
        let err = s.start().unwrap_err();
        assert!(matches!(err, StartupError::SourceEvaluation { .. }));
        assert!(err.to_string().contains("syntax error"));
        assert_eq!(producer.finalizes.load(Ordering::SeqCst), 1);
        assert!(producer.requests().is_empty());
        assert_eq!(s.pull(), Err(PullError::Stopped));
    }

    #[test]
    fn test_missing_output_node() {
        let producer = Arc::new(ScriptedProducer::manual(5));
        let config = SchedulerConfig {
            output_index: 2,
            ..window(2)
        };
        let s = scheduler(&producer, config);
        assert!(matches!(
            s.start(),
            Err(StartupError::OutputNode { index: 2, .. })
        ));
        assert_eq!(producer.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pull_before_start() {
        let producer = Arc::new(ScriptedProducer::manual(5));
        let s = scheduler(&producer, window(2));
        assert_eq!(s.pull(), Err(PullError::NotStarted));
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let producer = Arc::new(ScriptedProducer::manual(5));
        let s = scheduler(&producer, window(2));
        s.start().unwrap();
        assert!(matches!(s.start(), Err(StartupError::InvalidState(_))));
        assert_eq!(producer.requests(), vec![0, 1]);
    }

    #[test]
    fn test_timeout_is_latched() {
        let producer = Arc::new(ScriptedProducer::manual(5));
        let config = SchedulerConfig {
            drain_timeout: Some(Duration::from_millis(10)),
            ..window(2).with_wait_timeout(Duration::from_millis(20))
        };
        let s = scheduler(&producer, config);
        s.start().unwrap();

        assert!(matches!(s.pull(), Err(PullError::Timeout { index: 0, .. })));
        producer.complete(0);
        assert!(matches!(s.pull(), Err(PullError::Timeout { index: 0, .. })));
    }

    #[test]
    fn test_dropped_request_surfaces_as_failure() {
        let producer = Arc::new(ScriptedProducer::manual(5));
        let s = scheduler(&producer, window(2));
        s.start().unwrap();
        producer.drop_outstanding();
        assert!(matches!(
            s.pull(),
            Err(PullError::ProducerFailure { index: 0, .. })
        ));
    }

    // --- Protocol violations ---

    #[test]
    fn test_completion_for_unknown_index_is_fatal() {
        let producer = Arc::new(ScriptedProducer::manual(5));
        let s = scheduler(&producer, window(2));
        s.start().unwrap();

        producer.complete_as(0, 7);

        assert_eq!(
            s.pull(),
            Err(PullError::ProtocolViolation(ProtocolViolation::UnknownIndex(7)))
        );
        assert_eq!(producer.released(), vec![7]);
    }

    #[test]
    fn test_duplicate_delivery_is_fatal() {
        let producer = Arc::new(ScriptedProducer::manual(5));
        let s = scheduler(&producer, window(2));
        s.start().unwrap();

        producer.complete(0);
        producer.complete_as(1, 0);

        assert_eq!(
            s.pull(),
            Err(PullError::ProtocolViolation(
                ProtocolViolation::DuplicateDelivery(0)
            ))
        );
        s.stop();
        assert_eq!(producer.released(), vec![0, 0]);
    }

    #[test]
    fn test_violation_wakes_blocked_consumer() {
        let producer = Arc::new(ScriptedProducer::manual(5));
        let s = Arc::new(scheduler(&producer, window(2)));
        s.start().unwrap();

        let consumer = {
            let s = Arc::clone(&s);
            thread::spawn(move || s.pull())
        };
        thread::sleep(Duration::from_millis(20));
        producer.complete_as(1, 9);

        assert_eq!(
            consumer.join().unwrap(),
            Err(PullError::ProtocolViolation(ProtocolViolation::UnknownIndex(9)))
        );
    }

    #[test]
    fn test_misreported_index_is_fatal_and_wakes_consumer() {
        let producer = Arc::new(ScriptedProducer::manual(5));
        let s = Arc::new(scheduler(&producer, window(3)));
        s.start().unwrap();

        let consumer = {
            let s = Arc::clone(&s);
            thread::spawn(move || s.pull())
        };
        thread::sleep(Duration::from_millis(20));
        // Request 1 answers as frame 2 while request 2 is still outstanding.
        producer.complete_as(1, 2);

        let expected = PullError::ProtocolViolation(ProtocolViolation::MismatchedIndex {
            requested: 1,
            reported: 2,
        });
        assert_eq!(consumer.join().unwrap(), Err(expected.clone()));
        assert_eq!(producer.released(), vec![2]);

        producer.complete(0);
        assert_eq!(s.pull(), Err(expected));
        assert_eq!(s.stats().completed, 2);
        s.stop();
        assert_eq!(producer.released(), vec![0, 2]);
    }

    // --- Lifecycle ---

    #[test]
    fn test_stop_is_idempotent() {
        let producer = Arc::new(ScriptedProducer::auto(5));
        let s = scheduler(&producer, window(2));
        s.start().unwrap();
        s.stop();
        s.stop();
        drop(s);
        assert_eq!(producer.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(producer.finalizes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_before_start_touches_nothing() {
        let producer = Arc::new(ScriptedProducer::auto(5));
        let s = scheduler(&producer, window(2));
        s.stop();
        assert_eq!(s.state(), LifecycleState::Stopped);
        assert_eq!(producer.shutdowns.load(Ordering::SeqCst), 0);
        assert!(matches!(s.start(), Err(StartupError::InvalidState(_))));
    }

    #[test]
    fn test_stop_releases_ready_but_undelivered_frames() {
        let producer = Arc::new(ScriptedProducer::auto(10));
        let s = scheduler(&producer, window(4));
        s.start().unwrap();
        s.pull().unwrap();
        s.stop();

        assert_eq!(producer.released(), vec![0, 1, 2, 3, 4]);
        assert_eq!(s.stats().live_slots, 0);
        assert_eq!(s.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_stop_waits_for_in_flight_callbacks() {
        let producer = Arc::new(ScriptedProducer::manual(10));
        let config = SchedulerConfig {
            drain_timeout: None,
            ..window(3)
        };
        let s = scheduler(&producer, config);
        s.start().unwrap();

        let completer = {
            let producer = Arc::clone(&producer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                for index in producer.outstanding().into_iter().rev() {
                    producer.complete(index);
                }
            })
        };
        s.stop();

        assert!(producer.outstanding().is_empty());
        assert_eq!(producer.released(), vec![0, 1, 2]);
        assert_eq!(producer.shutdowns.load(Ordering::SeqCst), 1);
        completer.join().unwrap();
    }

    #[test]
    fn test_late_callbacks_after_drain_timeout_are_discarded() {
        let producer = Arc::new(ScriptedProducer::manual(10));
        let config = SchedulerConfig {
            drain_timeout: Some(Duration::from_millis(10)),
            ..window(3)
        };
        let s = scheduler(&producer, config);
        s.start().unwrap();
        s.stop();

        for index in producer.outstanding() {
            producer.complete(index);
        }
        assert_eq!(producer.released(), vec![0, 1, 2]);
        assert!(!s.is_failed());
    }

    #[test]
    fn test_stop_after_timeout_returns_without_pending_answers() {
        let producer = Arc::new(ScriptedProducer::manual(5));
        let config = SchedulerConfig {
            drain_timeout: None,
            ..window(2).with_wait_timeout(Duration::from_millis(20))
        };
        let s = Arc::new(scheduler(&producer, config));
        s.start().unwrap();
        assert!(matches!(s.pull(), Err(PullError::Timeout { index: 0, .. })));

        let (tx, rx) = crossbeam_channel::bounded(1);
        let stopper = {
            let s = Arc::clone(&s);
            thread::spawn(move || {
                s.stop();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        stopper.join().unwrap();
        assert_eq!(s.state(), LifecycleState::Stopped);
        assert_eq!(producer.shutdowns.load(Ordering::SeqCst), 1);

        for index in producer.outstanding() {
            producer.complete(index);
        }
        assert_eq!(producer.released(), vec![0, 1]);
    }

    #[test]
    fn test_pull_racing_start_sees_first_frame_or_not_started() {
        for _ in 0..50 {
            let producer = Arc::new(ScriptedProducer::auto(4));
            let s = Arc::new(scheduler(&producer, window(2)));
            let consumer = {
                let s = Arc::clone(&s);
                thread::spawn(move || loop {
                    match s.pull() {
                        Err(PullError::NotStarted) => thread::yield_now(),
                        other => return other.map(|f| f.map(|f| f.index())),
                    }
                })
            };
            s.start().unwrap();
            assert_eq!(consumer.join().unwrap(), Ok(Some(0)));
            assert!(!s.is_failed());
        }
    }

    #[test]
    fn test_stop_interrupts_blocked_pull() {
        let producer = Arc::new(ScriptedProducer::manual(10));
        let config = SchedulerConfig {
            drain_timeout: Some(Duration::from_millis(10)),
            ..window(2)
        };
        let s = Arc::new(scheduler(&producer, config));
        s.start().unwrap();

        let consumer = {
            let s = Arc::clone(&s);
            thread::spawn(move || s.pull())
        };
        thread::sleep(Duration::from_millis(20));
        s.stop();

        assert_eq!(consumer.join().unwrap(), Err(PullError::Stopped));
        assert_eq!(s.pull(), Err(PullError::Stopped));
    }

    #[test]
    fn test_stats_snapshot() {
        let producer = Arc::new(ScriptedProducer::manual(10));
        let s = scheduler(&producer, window(3));
        assert_eq!(s.stats(), SchedulerStats::default());
        s.start().unwrap();
        producer.complete(0);
        producer.complete(2);

        let stats = s.stats();
        assert_eq!(stats.window_size, 3);
        assert_eq!(stats.requested, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.live_slots, 3);
        assert_eq!(s.width(), 4);
        assert_eq!(s.height(), 2);
        assert_eq!(s.total_frames(), Some(10));
    }
}
