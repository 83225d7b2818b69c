use crate::producer::domain::source_descriptor::SourceDescriptor;
use crate::shared::frame::Frame;
use crate::shared::video_metadata::VideoMetadata;

/// Reads frames from an evaluated source.
///
/// Implementations hide how frames are produced (a scheduler over an
/// asynchronous producer, a stub in tests) while the pipeline works with the
/// abstract `Frame` and `VideoMetadata` types.
pub trait VideoReader: Send {
    /// Evaluates the source and returns the metadata of the selected output.
    fn open(
        &mut self,
        descriptor: &SourceDescriptor,
    ) -> Result<VideoMetadata, Box<dyn std::error::Error>>;

    /// Returns an iterator over frames in index order. The iterator ends
    /// after the first error.
    fn frames(
        &mut self,
    ) -> Box<dyn Iterator<Item = Result<Frame, Box<dyn std::error::Error>>> + '_>;

    /// Largest number of requests that were in flight at once, for readers
    /// that prefetch.
    fn peak_in_flight(&self) -> Option<usize> {
        None
    }

    /// Releases any resources held by the reader.
    fn close(&mut self);
}
