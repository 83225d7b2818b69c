use thiserror::Error;

use crate::producer::domain::source_descriptor::SourceDescriptor;
use crate::shared::frame::Frame;
use crate::shared::video_metadata::VideoMetadata;

/// Error reported by the producer, either for a whole call or for one frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProducerError {
    message: String,
}

impl ProducerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ProducerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ProducerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Completion handler passed with every asynchronous frame request.
///
/// Invoked exactly once, on whatever thread the producer chooses, with the
/// index the producer computed and either the frame or the reason it failed.
pub type FrameCallback<F> = Box<dyn FnOnce(usize, Result<F, ProducerError>) + Send + 'static>;

/// The capability set of an external asynchronous frame producer.
///
/// Implementations wrap whatever binding actually computes frames (a
/// scripting runtime loaded at run time, a thread pool, a test double).
/// The scheduler only ever talks to a producer through this trait.
pub trait FrameProducer: Send + Sync + 'static {
    /// Handle to an evaluated source.
    type Source: Send + Sync + 'static;
    /// Handle to one output of an evaluated source.
    type Node: Send + Sync + 'static;
    /// Producer-owned frame; must be handed back via [`release_frame`](Self::release_frame).
    type NativeFrame: Send + 'static;

    fn initialize(&self) -> Result<(), ProducerError>;

    fn evaluate_source(&self, descriptor: &SourceDescriptor)
        -> Result<Self::Source, ProducerError>;

    fn output_node(
        &self,
        source: &Self::Source,
        output_index: usize,
    ) -> Result<Self::Node, ProducerError>;

    /// Format and length of an output node.
    fn node_info(&self, node: &Self::Node) -> Result<VideoMetadata, ProducerError>;

    /// Submits a request without blocking. `on_done` fires exactly once.
    fn request_frame_async(
        &self,
        node: &Self::Node,
        index: usize,
        on_done: FrameCallback<Self::NativeFrame>,
    );

    /// Copies a native frame into the consumer's picture layout.
    fn copy_picture(&self, frame: &Self::NativeFrame, index: usize)
        -> Result<Frame, ProducerError>;

    fn release_frame(&self, frame: Self::NativeFrame);

    fn shutdown_producer(&self, source: Self::Source);

    /// Tears down the binding after every source has been shut down.
    fn finalize(&self);
}
