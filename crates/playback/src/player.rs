use annotations::AnnotationSet;
use device::DeviceChannel;
use media_io::FrameSource;

use crate::clock::{Advance, PlaybackClock};
use crate::sampler::{SampleOutcome, Sampler};
use crate::{should_sample, PlaybackConfig, PlaybackError};

/// Requests applied between ticks, never during one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlayerCommand {
    Play,
    Pause,
    Toggle,
    Stop,
    Seek(u64),
    Reconnect,
    Close,
}

pub struct Tick {
    pub advance: Advance,
    /// Set only on sample boundaries.
    pub sample: Option<SampleOutcome>,
}

/// One video's clock and annotations plus the shared device channel.
pub struct Player<S: FrameSource> {
    clock: PlaybackClock<S>,
    sampler: Sampler,
    device: DeviceChannel,
    config: PlaybackConfig,
}

impl<S: FrameSource> Player<S> {
    pub fn new(source: S, sampler: Sampler, device: DeviceChannel, config: PlaybackConfig) -> Self {
        Self { clock: PlaybackClock::new(source, &config), sampler, device, config }
    }

    pub fn clock(&self) -> &PlaybackClock<S> { &self.clock }

    pub fn sampler(&self) -> &Sampler { &self.sampler }

    pub fn sampler_mut(&mut self) -> &mut Sampler { &mut self.sampler }

    pub fn device(&self) -> &DeviceChannel { &self.device }

    pub fn device_mut(&mut self) -> &mut DeviceChannel { &mut self.device }

    /// Switches video: the clock and annotation set are replaced wholesale,
    /// the device connection is kept. Playback starts immediately.
    pub fn load(&mut self, source: S, annotations: AnnotationSet) -> Result<(), PlaybackError> {
        self.clock = PlaybackClock::new(source, &self.config);
        self.sampler.replace_annotations(annotations);
        self.clock.play()
    }

    pub fn apply(&mut self, command: PlayerCommand) -> Result<(), PlaybackError> {
        tracing::debug!(?command, "player command");
        match command {
            PlayerCommand::Play => self.clock.play(),
            PlayerCommand::Pause => { self.clock.pause(); Ok(()) }
            PlayerCommand::Toggle => self.clock.toggle(),
            PlayerCommand::Stop => self.clock.stop(),
            PlayerCommand::Seek(frame) => self.clock.seek(frame),
            PlayerCommand::Reconnect => {
                if !self.device.reconnect() { tracing::warn!("reconnect failed, continuing without a device"); }
                Ok(())
            }
            PlayerCommand::Close => {
                self.clock.close();
                self.device.close();
                Ok(())
            }
        }
    }

    /// advance -> (on a sample boundary) lookup -> parse -> map -> send.
    /// Device trouble never surfaces here; only decode errors do.
    pub fn tick(&mut self) -> Result<Tick, PlaybackError> {
        let advance = self.clock.advance()?;
        let sample = match &advance {
            Advance::Frame { index, .. } if should_sample(*index, self.clock.fps()) => {
                Some(self.sampler.sample(*index, &mut self.device))
            }
            _ => None,
        };
        Ok(Tick { advance, sample })
    }

    /// Releases the device. The player is unusable afterwards.
    pub fn shutdown(mut self) -> Sampler {
        let _ = self.apply(PlayerCommand::Close);
        self.sampler
    }
}
