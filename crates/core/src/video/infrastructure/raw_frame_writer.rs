use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::shared::frame::Frame;
use crate::shared::video_metadata::VideoMetadata;
use crate::video::domain::video_writer::VideoWriter;

/// Writes pictures back to back as raw interleaved bytes, with no header.
///
/// Every frame must match the geometry announced in `open`.
#[derive(Default)]
pub struct RawFrameWriter {
    out: Option<BufWriter<File>>,
    geometry: Option<(u32, u32, u8)>,
    frame_size: usize,
    frames_written: usize,
}

impl RawFrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    pub fn bytes_written(&self) -> usize {
        self.frames_written * self.frame_size
    }
}

impl VideoWriter for RawFrameWriter {
    fn open(
        &mut self,
        path: &Path,
        metadata: &VideoMetadata,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let file = File::create(path)
            .map_err(|e| format!("Cannot create output file {}: {e}", path.display()))?;
        self.out = Some(BufWriter::new(file));
        self.geometry = Some((metadata.width, metadata.height, metadata.channels));
        self.frame_size = metadata.frame_size();
        self.frames_written = 0;
        log::debug!(
            "Writing raw {}x{}x{} frames ({} bytes each, SAR {}:{}) to {}",
            metadata.width,
            metadata.height,
            metadata.channels,
            self.frame_size,
            metadata.sar_num,
            metadata.sar_den,
            path.display()
        );
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        let out = self.out.as_mut().ok_or("RawFrameWriter: not opened")?;
        let expected = self.geometry.ok_or("RawFrameWriter: not opened")?;
        let actual = (frame.width(), frame.height(), frame.channels());
        if actual != expected {
            return Err(format!(
                "Frame {} is {}x{}x{}, expected {}x{}x{}",
                frame.index(),
                actual.0,
                actual.1,
                actual.2,
                expected.0,
                expected.1,
                expected.2
            )
            .into());
        }
        out.write_all(frame.data())?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
            log::debug!(
                "Raw output closed: {} frames, {} bytes",
                self.frames_written,
                self.bytes_written()
            );
        }
        Ok(())
    }
}
