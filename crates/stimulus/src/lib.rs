//! Converts parsed annotations into bounded actuator commands.
//!
//! A source string is classified once by its first character into a
//! [`SourceKind`]; each kind resolves to a channel tag plus a linear
//! [`ChannelMapping`] from the table held by [`CommandMapper`].

use std::fmt;
use std::str::FromStr;

use annotations::Annotation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("invalid intensity in command {0:?}")]
    Intensity(String),
    #[error("channel tag {0:?} is not a printable ASCII character")]
    Tag(char),
}

/// One actuator command, sent as `"<tag><intensity>\n"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub tag: char,
    pub intensity: u8,
}

impl DeviceCommand {
    pub const fn new(tag: char, intensity: u8) -> Self { Self { tag, intensity } }

    pub fn wire_line(&self) -> String { format!("{}{}\n", self.tag, self.intensity) }

    pub fn to_bytes(&self) -> Vec<u8> { self.wire_line().into_bytes() }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}{}", self.tag, self.intensity) }
}

impl FromStr for DeviceCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        let tag = chars.next().ok_or(CommandError::Empty)?;
        if !tag.is_ascii_graphic() { return Err(CommandError::Tag(tag)); }
        let intensity = chars.as_str().parse::<u8>().map_err(|_| CommandError::Intensity(s.to_string()))?;
        Ok(Self { tag, intensity })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Heat,
    Cold,
}

impl Channel {
    pub const fn tag(self) -> char {
        match self {
            Channel::Heat => 'h',
            Channel::Cold => 'c',
        }
    }
}

/// Source category resolved from the first character of the model's
/// `source` string ("heat" -> Heat, "cold"/"cool" -> Cold). Only a printable
/// ASCII character can become an unknown tag, since it goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Heat,
    Cold,
    Unknown(char),
}

impl SourceKind {
    pub fn classify(source: &str) -> Option<Self> {
        let first = source.trim().chars().next()?;
        match first.to_ascii_lowercase() {
            'h' => Some(SourceKind::Heat),
            'c' => Some(SourceKind::Cold),
            c if c.is_ascii_graphic() => Some(SourceKind::Unknown(first)),
            _ => None,
        }
    }

    pub fn tag(self) -> char {
        match self {
            SourceKind::Heat => Channel::Heat.tag(),
            SourceKind::Cold => Channel::Cold.tag(),
            SourceKind::Unknown(c) => c,
        }
    }
}

/// `intensity = round(proportion * scale + offset)`, clamped to `0..=255`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelMapping {
    pub scale: f64,
    pub offset: f64,
}

impl ChannelMapping {
    pub const ZERO: ChannelMapping = ChannelMapping { scale: 0.0, offset: 0.0 };

    pub const fn new(scale: f64, offset: f64) -> Self { Self { scale, offset } }

    pub fn intensity(&self, proportion: f64) -> u8 {
        let v = (proportion * self.scale + self.offset).round();
        if v.is_nan() { return 0; }
        v.clamp(0.0, 255.0) as u8
    }
}

/// What to do with a source whose first character is neither heat nor cold.
/// Observed devices disagree, so this is configuration rather than code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownSourcePolicy {
    /// Emit intensity 0 under the observed tag.
    #[default]
    Zero,
    /// Emit nothing.
    Reject,
    /// Drive a known channel instead, with that channel's mapping and tag.
    Route(Channel),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    pub heat: ChannelMapping,
    pub cold: ChannelMapping,
    pub unknown: UnknownSourcePolicy,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            heat: ChannelMapping::new(80.0, 150.0),
            cold: ChannelMapping::new(70.0, 185.0),
            unknown: UnknownSourcePolicy::Zero,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandMapper {
    config: MapperConfig,
}

impl CommandMapper {
    pub fn new(config: MapperConfig) -> Self { Self { config } }

    pub fn config(&self) -> &MapperConfig { &self.config }

    fn channel_mapping(&self, channel: Channel) -> ChannelMapping {
        match channel {
            Channel::Heat => self.config.heat,
            Channel::Cold => self.config.cold,
        }
    }

    /// Tag and mapping for a source kind; `None` when the policy rejects it.
    pub fn resolve(&self, kind: SourceKind) -> Option<(char, ChannelMapping)> {
        match kind {
            SourceKind::Heat => Some((Channel::Heat.tag(), self.config.heat)),
            SourceKind::Cold => Some((Channel::Cold.tag(), self.config.cold)),
            SourceKind::Unknown(tag) => match self.config.unknown {
                UnknownSourcePolicy::Zero => Some((tag, ChannelMapping::ZERO)),
                UnknownSourcePolicy::Reject => None,
                UnknownSourcePolicy::Route(ch) => Some((ch.tag(), self.channel_mapping(ch))),
            },
        }
    }

    pub fn map(&self, source: &str, proportion: f64) -> Option<DeviceCommand> {
        if !proportion.is_finite() { return None; }
        let Some(kind) = SourceKind::classify(source) else {
            tracing::warn!(source, "source has no usable channel tag, nothing sent");
            return None;
        };
        let Some((tag, mapping)) = self.resolve(kind) else {
            tracing::debug!(source, "unknown source rejected");
            return None;
        };
        Some(DeviceCommand::new(tag, mapping.intensity(proportion)))
    }

    /// The sentinel never reaches [`CommandMapper::map`].
    pub fn map_annotation(&self, annotation: &Annotation) -> Option<DeviceCommand> {
        let stimulus = annotation.stimulus()?;
        self.map(&stimulus.source, stimulus.proportion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mapping_values() {
        let m = CommandMapper::default();
        assert_eq!(m.map("heat", 0.5), Some(DeviceCommand::new('h', 190)));
        assert_eq!(m.map("cold", 0.0), Some(DeviceCommand::new('c', 185)));
        assert_eq!(m.map("cool", 1.0), Some(DeviceCommand::new('c', 255)));
        assert_eq!(m.map("Heat", 1.0), Some(DeviceCommand::new('h', 230)));
    }

    #[test]
    fn test_intensity_stays_in_range() {
        let extremes = [
            MapperConfig::default(),
            MapperConfig { heat: ChannelMapping::new(255.0, 255.0), cold: ChannelMapping::new(-400.0, -10.0), unknown: UnknownSourcePolicy::Zero },
        ];
        for cfg in extremes {
            let m = CommandMapper::new(cfg);
            for i in 0..=100 {
                let p = i as f64 / 100.0;
                for src in ["heat", "cold"] {
                    let cmd = m.map(src, p).unwrap();
                    assert!(u16::from(cmd.intensity) <= 255);
                }
            }
            assert_eq!(m.map("heat", 1.0).map(|c| c.intensity), Some(if cfg.heat.offset > 200.0 { 255 } else { 230 }));
        }
        let m = CommandMapper::new(extremes[1]);
        assert_eq!(m.map("cold", 1.0).map(|c| c.intensity), Some(0));
    }

    #[test]
    fn test_unknown_source_policies() {
        let zero = CommandMapper::default();
        assert_eq!(zero.map("wind", 0.8), Some(DeviceCommand::new('w', 0)));

        let reject = CommandMapper::new(MapperConfig { unknown: UnknownSourcePolicy::Reject, ..Default::default() });
        assert_eq!(reject.map("wind", 0.8), None);

        let route = CommandMapper::new(MapperConfig { unknown: UnknownSourcePolicy::Route(Channel::Heat), ..Default::default() });
        assert_eq!(route.map("wind", 0.5), Some(DeviceCommand::new('h', 190)));
    }

    #[test]
    fn test_non_ascii_source_is_unmappable() {
        assert_eq!(SourceKind::classify("热源"), None);
        assert_eq!(SourceKind::classify("\u{7}bell"), None);
        for policy in [UnknownSourcePolicy::Zero, UnknownSourcePolicy::Route(Channel::Cold)] {
            let m = CommandMapper::new(MapperConfig { unknown: policy, ..Default::default() });
            assert_eq!(m.map("热源", 0.5), None);
            assert_eq!(m.map("émission", 0.5), None);
        }
        for src in ["heat", "cold", "wind", "#7"] {
            let cmd = CommandMapper::default().map(src, 0.5).unwrap();
            assert!(cmd.to_bytes().is_ascii());
        }
        assert_eq!("热5".parse::<DeviceCommand>(), Err(CommandError::Tag('热')));
    }

    #[test]
    fn test_sentinel_and_bad_inputs_short_circuit() {
        let m = CommandMapper::default();
        assert_eq!(m.map_annotation(&Annotation::None), None);
        assert_eq!(m.map("", 0.5), None);
        assert_eq!(m.map("heat", f64::NAN), None);
        assert_eq!(m.map("heat", f64::INFINITY), None);
    }

    #[test]
    fn test_wire_format() {
        let cmd = DeviceCommand::new('h', 190);
        assert_eq!(cmd.wire_line(), "h190\n");
        assert_eq!(cmd.to_bytes(), b"h190\n".to_vec());
        assert_eq!("c7\n".parse::<DeviceCommand>(), Ok(DeviceCommand::new('c', 7)));
        assert_eq!("".parse::<DeviceCommand>(), Err(CommandError::Empty));
        assert!("h256".parse::<DeviceCommand>().is_err());
    }

    #[test]
    fn test_policy_config_serde() {
        let cfg: MapperConfig = serde_json::from_str(r#"{"unknown": {"route": "cold"}}"#).unwrap();
        assert_eq!(cfg.unknown, UnknownSourcePolicy::Route(Channel::Cold));
        assert_eq!(cfg.heat, MapperConfig::default().heat);
        let cfg: MapperConfig = serde_json::from_str(r#"{"unknown": "reject"}"#).unwrap();
        assert_eq!(cfg.unknown, UnknownSourcePolicy::Reject);
    }
}
