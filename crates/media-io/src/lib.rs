//! Frame-level video access: decode sequentially, seek, write, count.
//!
//! The ffmpeg backend pipes raw RGB24 frames through child processes; the
//! in-memory backend in [`memory`] serves tests and synthetic sequences.

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod ffmpeg;
pub mod memory;

pub use ffmpeg::{read_video_info, FfmpegReader, FfmpegWriter};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} binary not found on PATH")]
    ToolMissing(&'static str),
    #[error("cannot read video metadata of {path}: {reason}")]
    Metadata { path: String, reason: String },
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("video i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame is {got_w}x{got_h}, expected {want_w}x{want_h}")]
    Geometry { got_w: u32, got_h: u32, want_w: u32, want_h: u32 },
    #[error("seek to frame {frame} is past the end ({len} frames)")]
    SeekOutOfRange { frame: u64, len: u64 },
}

/// Container-level properties. `frame_count` and `duration_secs` are the
/// nominal metadata and may be missing or wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: Option<u64>,
    pub duration_secs: Option<f64>,
}

/// Sequential decoder with random-access repositioning.
pub trait FrameSource {
    fn info(&self) -> &VideoInfo;

    /// Next decoded frame, or `None` at end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError>;

    /// The next `read_frame` returns frame `frame`.
    fn seek(&mut self, frame: u64) -> Result<(), MediaError>;

    /// Index of the frame the next `read_frame` returns.
    fn position(&self) -> u64;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn info(&self) -> &VideoInfo { (**self).info() }
    fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError> { (**self).read_frame() }
    fn seek(&mut self, frame: u64) -> Result<(), MediaError> { (**self).seek(frame) }
    fn position(&self) -> u64 { (**self).position() }
}

pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError>;

    /// Flushes and finalizes the output. No frames may follow.
    fn finish(&mut self) -> Result<(), MediaError>;
}

/// Returns `frame` unchanged when it already has the target size, otherwise
/// a bilinear resample of it.
pub fn fit_to(frame: RgbImage, width: u32, height: u32) -> RgbImage {
    if frame.width() == width && frame.height() == height { return frame; }
    imageops::resize(&frame, width, height, FilterType::Triangle)
}

/// Metadata frame count, if it is positive and agrees with
/// `duration * fps` to within one second of video.
pub fn plausible_frame_count(info: &VideoInfo) -> Option<u64> {
    let n = info.frame_count.filter(|&n| n > 0)?;
    match info.duration_secs {
        Some(d) if d > 0.0 && info.fps > 0.0 => {
            let expected = d * info.fps;
            if (n as f64 - expected).abs() <= info.fps.max(1.0) { Some(n) } else { None }
        }
        _ => Some(n),
    }
}

/// Exhaustive decode count. Leaves the source rewound to frame 0.
pub fn count_frames(source: &mut dyn FrameSource) -> Result<u64, MediaError> {
    source.seek(0)?;
    let mut n = 0u64;
    while source.read_frame()?.is_some() { n += 1; }
    source.seek(0)?;
    Ok(n)
}

/// Frame count from metadata when plausible, else by decoding every frame.
pub fn frame_count(source: &mut dyn FrameSource) -> Result<u64, MediaError> {
    if let Some(n) = plausible_frame_count(source.info()) { return Ok(n); }
    tracing::warn!(reported = ?source.info().frame_count, "unreliable frame count metadata, counting frames");
    count_frames(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySource;

    fn info(frame_count: Option<u64>, duration_secs: Option<f64>) -> VideoInfo {
        VideoInfo { width: 4, height: 4, fps: 30.0, frame_count, duration_secs }
    }

    #[test]
    fn test_plausible_frame_count() {
        assert_eq!(plausible_frame_count(&info(Some(300), Some(10.0))), Some(300));
        assert_eq!(plausible_frame_count(&info(Some(310), Some(10.0))), Some(310));
        assert_eq!(plausible_frame_count(&info(Some(900), Some(10.0))), None);
        assert_eq!(plausible_frame_count(&info(Some(0), Some(10.0))), None);
        assert_eq!(plausible_frame_count(&info(None, None)), None);
        assert_eq!(plausible_frame_count(&info(Some(12), None)), Some(12));
    }

    #[test]
    fn test_frame_count_falls_back_to_decoding() {
        let mut src = MemorySource::gradient(7, 4, 4, 30.0).with_reported_count(Some(0));
        assert_eq!(frame_count(&mut src).unwrap(), 7);
        assert_eq!(src.position(), 0);

        let mut trusted = MemorySource::gradient(7, 4, 4, 30.0).with_reported_count(Some(7));
        assert_eq!(frame_count(&mut trusted).unwrap(), 7);
    }

    #[test]
    fn test_fit_to_resizes_only_when_needed() {
        let same = RgbImage::new(8, 6);
        let out = fit_to(same, 8, 6);
        assert_eq!(out.dimensions(), (8, 6));
        let other = RgbImage::from_pixel(16, 12, image::Rgb([200, 10, 10]));
        let out = fit_to(other, 8, 6);
        assert_eq!(out.dimensions(), (8, 6));
        assert_eq!(out.get_pixel(3, 3), &image::Rgb([200, 10, 10]));
    }
}
