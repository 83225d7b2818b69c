use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use ndarray::Array3;

use crate::producer::domain::frame_producer::{FrameCallback, FrameProducer, ProducerError};
use crate::producer::domain::source_descriptor::SourceDescriptor;
use crate::shared::constants::{
    DEFAULT_FPS, DEFAULT_FRAME_COUNT, DEFAULT_HEIGHT, DEFAULT_SAR, DEFAULT_WIDTH,
    FALLBACK_WINDOW_SIZE, PICTURE_CHANNELS, TEST_PATTERN_SOURCE,
};
use crate::shared::frame::Frame;
use crate::shared::video_metadata::VideoMetadata;

const KNOWN_OPTIONS: &[&str] = &[
    "width", "height", "fps", "sar", "frames", "threads", "jitter_ms", "fail_at", "outputs",
];

/// Parameters of a test pattern source, read from the descriptor options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatternSettings {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub sar_num: u32,
    pub sar_den: u32,
    /// `None` for an endless pattern (`frames=-1`).
    pub frames: Option<usize>,
    pub threads: usize,
    /// Upper bound of the per-frame render delay.
    pub jitter_ms: u64,
    pub fail_at: Option<usize>,
    pub outputs: usize,
}

impl PatternSettings {
    pub fn from_descriptor(descriptor: &SourceDescriptor) -> Result<Self, ProducerError> {
        if descriptor.source() != TEST_PATTERN_SOURCE {
            return Err(ProducerError::new(format!(
                "unknown source '{}': only '{TEST_PATTERN_SOURCE}' is built in",
                descriptor.source()
            )));
        }
        for (name, value) in descriptor.options() {
            if !KNOWN_OPTIONS.contains(&name) {
                log::warn!("Ignoring unknown test pattern option {name}={value}");
            }
        }

        let (fps_num, fps_den) = ratio_option(descriptor, "fps", DEFAULT_FPS)?;
        let (sar_num, sar_den) = ratio_option(descriptor, "sar", DEFAULT_SAR)?;

        let frames = match descriptor.int_option("frames") {
            None => Some(DEFAULT_FRAME_COUNT),
            Some(n) if n < 0 => None,
            Some(n) => Some(n as usize),
        };

        let default_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(FALLBACK_WINDOW_SIZE);

        Ok(Self {
            width: positive_option(descriptor, "width", DEFAULT_WIDTH)?,
            height: positive_option(descriptor, "height", DEFAULT_HEIGHT)?,
            fps_num,
            fps_den,
            sar_num,
            sar_den,
            frames,
            threads: positive_option(descriptor, "threads", default_threads as u32)? as usize,
            jitter_ms: non_negative_option(descriptor, "jitter_ms")?.unwrap_or(0) as u64,
            fail_at: non_negative_option(descriptor, "fail_at")?.map(|n| n as usize),
            outputs: positive_option(descriptor, "outputs", 1)? as usize,
        })
    }

    /// Render delay for `index`: within every group of four frames the later
    /// ones finish first.
    fn delay_for(&self, index: usize) -> Duration {
        Duration::from_millis(self.jitter_ms * (3 - (index % 4) as u64) / 3)
    }
}

fn to_positive(name: &str, value: i64) -> Result<u32, ProducerError> {
    u32::try_from(value)
        .ok()
        .filter(|&v| v > 0)
        .ok_or_else(|| ProducerError::new(format!("{name} must be a positive integer, got {value}")))
}

fn ratio_option(
    descriptor: &SourceDescriptor,
    name: &str,
    default: (u32, u32),
) -> Result<(u32, u32), ProducerError> {
    match descriptor.option(name) {
        None => Ok(default),
        Some(value) => {
            let (num, den) = value
                .as_pair()
                .ok_or_else(|| ProducerError::new(format!("{name} must be given as num/den")))?;
            Ok((
                to_positive(&format!("{name} numerator"), num)?,
                to_positive(&format!("{name} denominator"), den)?,
            ))
        }
    }
}

fn positive_option(
    descriptor: &SourceDescriptor,
    name: &str,
    default: u32,
) -> Result<u32, ProducerError> {
    match descriptor.option(name) {
        None => Ok(default),
        Some(value) => {
            let n = value
                .as_int()
                .ok_or_else(|| ProducerError::new(format!("{name} must be an integer")))?;
            to_positive(name, n)
        }
    }
}

fn non_negative_option(
    descriptor: &SourceDescriptor,
    name: &str,
) -> Result<Option<i64>, ProducerError> {
    match descriptor.option(name) {
        None => Ok(None),
        Some(value) => match value.as_int() {
            Some(n) if n >= 0 => Ok(Some(n)),
            _ => Err(ProducerError::new(format!(
                "{name} must be a non-negative integer, got {value}"
            ))),
        },
    }
}

/// A rendered test pattern frame, owned by the producer until released.
#[derive(Debug)]
pub struct PatternFrame {
    source_id: usize,
    output: usize,
    index: usize,
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PatternFrame {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Producer-side counters, used to check that every frame comes back.
#[derive(Debug, Default)]
pub struct PatternStats {
    requested: AtomicUsize,
    produced: AtomicUsize,
    failed: AtomicUsize,
    released: AtomicUsize,
    double_released: AtomicUsize,
    open_sources: AtomicUsize,
    released_keys: Mutex<HashSet<(usize, usize, usize)>>,
}

impl PatternStats {
    pub fn requested(&self) -> usize {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn double_released(&self) -> usize {
        self.double_released.load(Ordering::SeqCst)
    }

    pub fn open_sources(&self) -> usize {
        self.open_sources.load(Ordering::SeqCst)
    }

    /// Frames handed out and not yet returned.
    pub fn live_frames(&self) -> usize {
        self.produced().saturating_sub(self.released())
    }

    fn record_release(&self, frame: &PatternFrame) {
        let key = (frame.source_id, frame.output, frame.index);
        let first_release = self
            .released_keys
            .lock()
            .map(|mut keys| keys.insert(key))
            .unwrap_or(true);
        if first_release {
            self.released.fetch_add(1, Ordering::SeqCst);
        } else {
            log::error!("Test pattern frame {} released twice", frame.index);
            self.double_released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct Job {
    output: usize,
    index: usize,
    on_done: FrameCallback<PatternFrame>,
}

/// Worker threads rendering frames for one evaluated source.
struct WorkerPool {
    jobs: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn spawn(
        source_id: usize,
        settings: Arc<PatternSettings>,
        stats: Arc<PatternStats>,
    ) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..settings.threads)
            .map(|_| {
                let rx = rx.clone();
                let settings = Arc::clone(&settings);
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for job in rx {
                        std::thread::sleep(settings.delay_for(job.index));
                        let result = render(source_id, &settings, job.output, job.index);
                        match &result {
                            Ok(_) => stats.produced.fetch_add(1, Ordering::SeqCst),
                            Err(_) => stats.failed.fetch_add(1, Ordering::SeqCst),
                        };
                        (job.on_done)(job.index, result);
                    }
                })
            })
            .collect();

        Arc::new(Self {
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    fn submit(&self, job: Job) -> Result<(), Job> {
        let jobs = match self.jobs.lock() {
            Ok(jobs) => jobs,
            Err(poisoned) => poisoned.into_inner(),
        };
        match jobs.as_ref() {
            Some(tx) => tx.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }

    /// Closes the queue, lets workers finish what was already submitted and
    /// joins them.
    fn shutdown(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for worker in workers {
            if worker.join().is_err() {
                log::error!("Test pattern worker panicked");
            }
        }
    }
}

fn render(
    source_id: usize,
    settings: &PatternSettings,
    output: usize,
    index: usize,
) -> Result<PatternFrame, ProducerError> {
    if settings.fail_at == Some(index) {
        return Err(ProducerError::new(format!(
            "test pattern configured to fail at frame {index}"
        )));
    }
    let shape = (
        settings.height as usize,
        settings.width as usize,
        PICTURE_CHANNELS as usize,
    );
    let picture = Array3::from_shape_fn(shape, |(y, x, c)| match c {
        0 => ((x + index) % 256) as u8,
        1 => (y % 256) as u8,
        _ => ((index + output * 64) % 256) as u8,
    });
    let (data, _) = picture.into_raw_vec_and_offset();
    Ok(PatternFrame {
        source_id,
        output,
        index,
        width: settings.width,
        height: settings.height,
        data,
    })
}

pub struct PatternSource {
    id: usize,
    settings: Arc<PatternSettings>,
    pool: Arc<WorkerPool>,
}

pub struct PatternNode {
    output: usize,
    settings: Arc<PatternSettings>,
    pool: Arc<WorkerPool>,
}

/// In-process producer that renders a moving gradient on a worker pool.
///
/// Frames complete out of order when `jitter_ms` is set, which makes it a
/// useful stand-in for a real script runtime.
#[derive(Default)]
pub struct TestPatternProducer {
    initialized: AtomicBool,
    next_source_id: AtomicUsize,
    stats: Arc<PatternStats>,
}

impl TestPatternProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &PatternStats {
        &self.stats
    }
}

impl FrameProducer for TestPatternProducer {
    type Source = PatternSource;
    type Node = PatternNode;
    type NativeFrame = PatternFrame;

    fn initialize(&self) -> Result<(), ProducerError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn evaluate_source(&self, descriptor: &SourceDescriptor) -> Result<PatternSource, ProducerError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(ProducerError::new("producer has not been initialized"));
        }
        let settings = Arc::new(PatternSettings::from_descriptor(descriptor)?);
        let id = self.next_source_id.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "Evaluated test pattern source {id}: {}x{}, {} worker threads",
            settings.width,
            settings.height,
            settings.threads
        );
        let pool = WorkerPool::spawn(id, Arc::clone(&settings), Arc::clone(&self.stats));
        self.stats.open_sources.fetch_add(1, Ordering::SeqCst);
        Ok(PatternSource { id, settings, pool })
    }

    fn output_node(
        &self,
        source: &PatternSource,
        output_index: usize,
    ) -> Result<PatternNode, ProducerError> {
        if output_index >= source.settings.outputs {
            return Err(ProducerError::new(format!(
                "source {} has {} output(s), requested output {output_index}",
                source.id, source.settings.outputs
            )));
        }
        Ok(PatternNode {
            output: output_index,
            settings: Arc::clone(&source.settings),
            pool: Arc::clone(&source.pool),
        })
    }

    fn node_info(&self, node: &PatternNode) -> Result<VideoMetadata, ProducerError> {
        Ok(VideoMetadata {
            width: node.settings.width,
            height: node.settings.height,
            channels: PICTURE_CHANNELS,
            fps_num: node.settings.fps_num,
            fps_den: node.settings.fps_den,
            sar_num: node.settings.sar_num,
            sar_den: node.settings.sar_den,
            total_frames: node.settings.frames,
            format: "rgb24".to_string(),
        })
    }

    fn request_frame_async(
        &self,
        node: &PatternNode,
        index: usize,
        on_done: FrameCallback<PatternFrame>,
    ) {
        self.stats.requested.fetch_add(1, Ordering::SeqCst);
        if node.settings.frames.is_some_and(|total| index >= total) {
            on_done(index, Err(ProducerError::new(format!("frame {index} out of range"))));
            return;
        }
        let job = Job {
            output: node.output,
            index,
            on_done,
        };
        if let Err(job) = node.pool.submit(job) {
            (job.on_done)(index, Err(ProducerError::new("producer has been shut down")));
        }
    }

    fn copy_picture(&self, frame: &PatternFrame, index: usize) -> Result<Frame, ProducerError> {
        if frame.index != index {
            return Err(ProducerError::new(format!(
                "picture for frame {} requested as frame {index}",
                frame.index
            )));
        }
        Ok(Frame::new(
            frame.data.clone(),
            frame.width,
            frame.height,
            PICTURE_CHANNELS,
            index,
        ))
    }

    fn release_frame(&self, frame: PatternFrame) {
        self.stats.record_release(&frame);
    }

    fn shutdown_producer(&self, source: PatternSource) {
        source.pool.shutdown();
        self.stats.open_sources.fetch_sub(1, Ordering::SeqCst);
        log::debug!("Test pattern source {} shut down", source.id);
    }

    fn finalize(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }
}
