use std::time::Duration;

use crate::shared::constants::FALLBACK_WINDOW_SIZE;

/// Configuration for one scheduler run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Requests kept in flight. `None` uses one per available core.
    pub window_size: Option<usize>,
    /// Which output of the evaluated source to read.
    pub output_index: usize,
    /// First frame delivered; earlier frames are never requested.
    pub first_frame: usize,
    /// Maximum number of frames delivered after `first_frame`.
    pub frame_limit: Option<usize>,
    /// Bound on a single wait for the next frame.
    pub wait_timeout: Option<Duration>,
    /// Bound on how long `stop` waits for in-flight callbacks. `None` waits
    /// for every callback, unless a failure has been latched; then the wait
    /// is bounded by `wait_timeout`, or a fixed fallback without one.
    pub drain_timeout: Option<Duration>,
}

impl SchedulerConfig {
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = Some(window_size);
        self
    }

    pub fn with_first_frame(mut self, first_frame: usize) -> Self {
        self.first_frame = first_frame;
        self
    }

    pub fn with_frame_limit(mut self, frame_limit: usize) -> Self {
        self.frame_limit = Some(frame_limit);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    pub fn resolved_window_size(&self) -> usize {
        self.window_size.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(FALLBACK_WINDOW_SIZE)
        })
    }

    /// Exclusive end of the delivered range for a source of `total` frames.
    pub fn range_end(&self, total: Option<usize>) -> Option<usize> {
        let limited = self
            .frame_limit
            .map(|limit| self.first_frame.saturating_add(limit));
        match (total, limited) {
            (Some(total), Some(limited)) => Some(total.min(limited)),
            (total, limited) => total.or(limited),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_window_is_at_least_one() {
        assert!(SchedulerConfig::default().resolved_window_size() >= 1);
    }

    #[test]
    fn test_explicit_window_wins() {
        let config = SchedulerConfig::default().with_window_size(3);
        assert_eq!(config.resolved_window_size(), 3);
    }

    #[rstest]
    #[case::whole_source(0, None, Some(100), Some(100))]
    #[case::limit_inside(10, Some(20), Some(100), Some(30))]
    #[case::limit_past_end(90, Some(20), Some(100), Some(100))]
    #[case::open_ended(0, None, None, None)]
    #[case::open_ended_with_limit(5, Some(10), None, Some(15))]
    fn test_range_end(
        #[case] first: usize,
        #[case] limit: Option<usize>,
        #[case] total: Option<usize>,
        #[case] expected: Option<usize>,
    ) {
        let config = SchedulerConfig {
            first_frame: first,
            frame_limit: limit,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.range_end(total), expected);
    }
}
