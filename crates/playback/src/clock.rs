use std::time::Duration;

use image::RgbImage;
use media_io::FrameSource;
use serde::{Deserialize, Serialize};

use crate::{PlaybackConfig, PlaybackError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PlayState { Stopped, Playing, Paused, Closed }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndOfStreamPolicy {
    #[default]
    Loop,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PlaybackState {
    pub current_frame: u64,
    pub fps: f64,
    pub is_playing: bool,
}

pub enum Advance {
    /// Not playing; nothing decoded.
    Idle,
    Frame { index: u64, image: RgbImage },
    /// End of stream under the loop policy; the next advance decodes frame 0.
    Rewound,
    /// End of stream under the stop policy; the clock is now stopped.
    EndOfStream,
}

/// Owns the frame source and the play position. Only its own operations
/// move `current_frame`.
pub struct PlaybackClock<S: FrameSource> {
    source: S,
    state: PlayState,
    current_frame: u64,
    fps: f64,
    policy: EndOfStreamPolicy,
    /// Frames in the stream once known, from plausible metadata, a full
    /// count or the first end of stream.
    length: Option<u64>,
}

impl<S: FrameSource> PlaybackClock<S> {
    pub fn new(source: S, config: &PlaybackConfig) -> Self {
        let reported = source.info().fps;
        let fps = if reported.is_finite() && reported > 0.0 { reported } else { config.fallback_fps };
        let length = media_io::plausible_frame_count(source.info());
        Self { source, state: PlayState::Stopped, current_frame: 0, fps, policy: config.end_of_stream, length }
    }

    pub fn state(&self) -> PlayState { self.state }

    pub fn fps(&self) -> f64 { self.fps }

    pub fn current_frame(&self) -> u64 { self.current_frame }

    pub fn policy(&self) -> EndOfStreamPolicy { self.policy }

    /// Stream length if already known; never decodes.
    pub fn length(&self) -> Option<u64> { self.length }

    /// Stream length, counting frames by decoding when the container
    /// metadata is not trustworthy. The count is cached and the decode
    /// position is restored.
    pub fn resolve_length(&mut self) -> Result<u64, PlaybackError> {
        if let Some(n) = self.length { return Ok(n); }
        let pos = self.source.position();
        let n = media_io::frame_count(&mut self.source)?;
        self.source.seek(pos.min(n))?;
        self.length = Some(n);
        Ok(n)
    }

    pub fn source(&self) -> &S { &self.source }

    pub fn playback_state(&self) -> PlaybackState {
        PlaybackState { current_frame: self.current_frame, fps: self.fps, is_playing: self.state == PlayState::Playing }
    }

    /// Nominal tick period, one frame at the clock's fps.
    pub fn frame_interval(&self) -> Duration { Duration::from_secs_f64(1.0 / self.fps) }

    pub fn play(&mut self) -> Result<(), PlaybackError> {
        if self.state == PlayState::Closed { return Err(PlaybackError::Closed); }
        self.state = PlayState::Playing;
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state == PlayState::Playing { self.state = PlayState::Paused; }
    }

    pub fn toggle(&mut self) -> Result<(), PlaybackError> {
        match self.state {
            PlayState::Playing => { self.pause(); Ok(()) }
            _ => self.play(),
        }
    }

    pub fn stop(&mut self) -> Result<(), PlaybackError> {
        if self.state == PlayState::Closed { return Err(PlaybackError::Closed); }
        self.source.seek(0)?;
        self.current_frame = 0;
        self.state = PlayState::Stopped;
        Ok(())
    }

    /// Terminal; every later operation fails or idles.
    pub fn close(&mut self) { self.state = PlayState::Closed; }

    /// Repositions the decoder. Never samples.
    pub fn seek(&mut self, frame: u64) -> Result<(), PlaybackError> {
        if self.state == PlayState::Closed { return Err(PlaybackError::Closed); }
        let len = self.resolve_length()?;
        if frame >= len { return Err(PlaybackError::SeekOutOfRange { frame, len }); }
        self.source.seek(frame)?;
        self.current_frame = frame;
        Ok(())
    }

    pub fn advance(&mut self) -> Result<Advance, PlaybackError> {
        if self.state != PlayState::Playing { return Ok(Advance::Idle); }
        let index = self.source.position();
        if let Some(image) = self.source.read_frame()? {
            self.current_frame = index;
            return Ok(Advance::Frame { index, image });
        }
        if index > 0 && self.length != Some(index) {
            tracing::debug!(frames = index, reported = ?self.length, "stream length learned at end of stream");
            self.length = Some(index);
        }
        self.source.seek(0)?;
        self.current_frame = 0;
        // an empty stream cannot loop
        if self.policy == EndOfStreamPolicy::Loop && index > 0 {
            tracing::debug!(frames = index, "end of stream, looping");
            Ok(Advance::Rewound)
        } else {
            tracing::info!(frames = index, "end of stream, stopping");
            self.state = PlayState::Stopped;
            Ok(Advance::EndOfStream)
        }
    }
}
