/// Source identifier understood by the built-in test pattern producer.
pub const TEST_PATTERN_SOURCE: &str = "testsrc";

pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 360;
pub const DEFAULT_FPS: (u32, u32) = (25, 1);
pub const DEFAULT_FRAME_COUNT: usize = 250;
pub const DEFAULT_SAR: (u32, u32) = (1, 1);

/// Interleaved RGB output.
pub const PICTURE_CHANNELS: u8 = 3;

/// Fallback window size when the platform cannot report its parallelism.
pub const FALLBACK_WINDOW_SIZE: usize = 4;

/// Drain bound for `stop` after a failure has been latched and no timeout
/// was configured.
pub const FAILED_DRAIN_TIMEOUT_MS: u64 = 2000;
