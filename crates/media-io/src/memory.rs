use image::{Rgb, RgbImage};

use crate::{FrameSink, FrameSource, MediaError, VideoInfo};

/// Pre-decoded frames held in memory.
pub struct MemorySource {
    frames: Vec<RgbImage>,
    info: VideoInfo,
    pos: u64,
}

impl MemorySource {
    pub fn new(frames: Vec<RgbImage>, fps: f64) -> Self {
        let (width, height) = frames.first().map(|f| f.dimensions()).unwrap_or((0, 0));
        let n = frames.len() as u64;
        let info = VideoInfo { width, height, fps, frame_count: Some(n), duration_secs: (fps > 0.0).then(|| n as f64 / fps) };
        Self { frames, info, pos: 0 }
    }

    /// `n` frames whose red channel encodes the frame index (mod 256).
    pub fn gradient(n: usize, width: u32, height: u32, fps: f64) -> Self {
        let frames = (0..n).map(|i| RgbImage::from_pixel(width, height, Rgb([(i % 256) as u8, 0, 0]))).collect();
        Self::new(frames, fps)
    }

    /// Overrides the nominal frame count, as containers with broken
    /// metadata do.
    pub fn with_reported_count(mut self, count: Option<u64>) -> Self {
        self.info.frame_count = count;
        self
    }
}

impl FrameSource for MemorySource {
    fn info(&self) -> &VideoInfo { &self.info }

    fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        let frame = self.frames.get(self.pos as usize).cloned();
        if frame.is_some() { self.pos += 1; }
        Ok(frame)
    }

    fn seek(&mut self, frame: u64) -> Result<(), MediaError> {
        let len = self.frames.len() as u64;
        if frame > len { return Err(MediaError::SeekOutOfRange { frame, len }); }
        self.pos = frame;
        Ok(())
    }

    fn position(&self) -> u64 { self.pos }
}

#[derive(Default)]
pub struct MemorySink {
    pub frames: Vec<RgbImage>,
    pub finished: bool,
}

impl FrameSink for MemorySink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError> {
        if let Some(first) = self.frames.first() {
            if first.dimensions() != frame.dimensions() {
                return Err(MediaError::Geometry { got_w: frame.width(), got_h: frame.height(), want_w: first.width(), want_h: first.height() });
            }
        }
        self.frames.push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), MediaError> {
        self.finished = true;
        Ok(())
    }
}
