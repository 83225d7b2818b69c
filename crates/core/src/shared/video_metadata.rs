/// Format of a producer output node, as reported after source evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub fps_num: u32,
    pub fps_den: u32,
    /// Sample (pixel) aspect ratio; 1/1 for square pixels.
    pub sar_num: u32,
    pub sar_den: u32,
    /// `None` when the producer cannot tell how long the sequence is.
    pub total_frames: Option<usize>,
    pub format: String,
}

impl VideoMetadata {
    pub fn fps(&self) -> f64 {
        if self.fps_den == 0 {
            0.0
        } else {
            f64::from(self.fps_num) / f64::from(self.fps_den)
        }
    }

    /// Display width over stored width of one pixel. An unset ratio
    /// (either term zero) counts as square.
    pub fn sar(&self) -> f64 {
        if self.sar_num == 0 || self.sar_den == 0 {
            1.0
        } else {
            f64::from(self.sar_num) / f64::from(self.sar_den)
        }
    }

    /// Size in bytes of one interleaved picture.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}
