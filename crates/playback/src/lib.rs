//! Playback position, sample timing and dispatch.
//!
//! Everything runs on one thread: a [`Scheduler`] calls [`Player::tick`]
//! once per frame period, and each tick (decode one frame, maybe sample,
//! maybe send) finishes before the next starts.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod clock;
pub mod player;
pub mod sampler;
pub mod scheduler;

pub use clock::{Advance, EndOfStreamPolicy, PlayState, PlaybackClock, PlaybackState};
pub use player::{Player, PlayerCommand, Tick};
pub use sampler::{DispatchRecord, SampleOutcome, Sampler};
pub use scheduler::{Control, IntervalScheduler, RunSummary, Scheduler, SchedulerHandle, StepScheduler};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("decode failed: {0}")]
    Decode(#[from] media_io::MediaError),
    #[error("player is closed")]
    Closed,
    #[error("cannot seek to frame {frame}, the video has {len} frames")]
    SeekOutOfRange { frame: u64, len: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub end_of_stream: EndOfStreamPolicy,
    /// Used when the container reports no usable frame rate.
    pub fallback_fps: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self { Self { end_of_stream: EndOfStreamPolicy::Loop, fallback_fps: 30.0 } }
}

/// True once per nominal second of video: `frame_idx % round(fps) == 0`.
/// A rate that rounds to zero makes every frame a boundary.
pub fn should_sample(frame_idx: u64, fps: f64) -> bool {
    let n = fps.round();
    if !(n >= 1.0) { return true; }
    frame_idx % (n as u64) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_sample_cadence() {
        let hits: Vec<u64> = (0..100).filter(|&i| should_sample(i, 30.0)).collect();
        assert_eq!(hits, vec![0, 30, 60, 90]);
        assert!(should_sample(120, 29.97));
        assert!(!should_sample(121, 29.97));
        assert!(should_sample(50, 25.0));
    }

    #[test]
    fn test_should_sample_degenerate_rates() {
        assert!(should_sample(7, 0.2));
        assert!(should_sample(7, f64::NAN));
    }

    #[test]
    fn test_config_defaults_and_serde() {
        let cfg: PlaybackConfig = serde_json::from_str(r#"{"end_of_stream": "stop"}"#).unwrap();
        assert_eq!(cfg.end_of_stream, EndOfStreamPolicy::Stop);
        assert_eq!(cfg.fallback_fps, 30.0);
        assert_eq!(PlaybackConfig::default().end_of_stream, EndOfStreamPolicy::Loop);
    }
}
