use std::collections::VecDeque;

use annotations::{AnnotationSet, FrameIdx};
use chrono::{DateTime, Utc};
use device::DeviceChannel;
use serde::Serialize;
use stimulus::{CommandMapper, DeviceCommand};

pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DispatchRecord {
    pub frame_idx: FrameIdx,
    pub source: String,
    pub proportion: f64,
    pub command: DeviceCommand,
    pub delivered: bool,
    pub response: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SampleOutcome {
    /// No record at exactly this frame.
    NoAnnotation,
    /// A record exists but its output parsed to the sentinel.
    NoStimulus,
    /// The mapper's unknown-source policy rejected the label.
    Unmapped,
    Dispatched(DispatchRecord),
}

/// Runs lookup -> parse -> map -> send for one sample tick. Any stage that
/// yields nothing ends the chain; no partial command is ever sent.
pub struct Sampler {
    annotations: AnnotationSet,
    mapper: CommandMapper,
    history: VecDeque<DispatchRecord>,
    history_limit: usize,
}

impl Sampler {
    pub fn new(annotations: AnnotationSet, mapper: CommandMapper) -> Self {
        Self { annotations, mapper, history: VecDeque::new(), history_limit: DEFAULT_HISTORY_LIMIT }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn annotations(&self) -> &AnnotationSet { &self.annotations }

    /// Swaps in a new set wholesale, as happens on a video switch.
    pub fn replace_annotations(&mut self, annotations: AnnotationSet) { self.annotations = annotations; }

    pub fn mapper(&self) -> &CommandMapper { &self.mapper }

    pub fn history(&self) -> impl Iterator<Item = &DispatchRecord> { self.history.iter() }

    pub fn take_history(&mut self) -> Vec<DispatchRecord> { self.history.drain(..).collect() }

    /// Resolves the command for `frame_idx` without sending it.
    pub fn command_at(&self, frame_idx: FrameIdx) -> Option<DeviceCommand> {
        let annotation = self.annotations.annotation_at(frame_idx)?;
        self.mapper.map_annotation(&annotation)
    }

    pub fn sample(&mut self, frame_idx: FrameIdx, device: &mut DeviceChannel) -> SampleOutcome {
        let Some(record) = self.annotations.lookup(frame_idx) else { return SampleOutcome::NoAnnotation; };
        let annotation = record.annotation();
        let Some(stimulus) = annotation.stimulus() else {
            tracing::debug!(frame = frame_idx, "no stimulus in model output");
            return SampleOutcome::NoStimulus;
        };
        let Some(command) = self.mapper.map(&stimulus.source, stimulus.proportion) else {
            return SampleOutcome::Unmapped;
        };
        let dispatch = device.dispatch(&command);
        tracing::info!(frame = frame_idx, source = %stimulus.source, proportion = stimulus.proportion, command = %command, delivered = dispatch.delivered, "sample dispatched");
        let entry = DispatchRecord {
            frame_idx,
            source: stimulus.source.clone(),
            proportion: stimulus.proportion,
            command,
            delivered: dispatch.delivered,
            response: dispatch.response,
            at: Utc::now(),
        };
        if self.history.len() == self.history_limit { self.history.pop_front(); }
        self.history.push_back(entry.clone());
        SampleOutcome::Dispatched(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device::{LoopbackLink, SerialConfig};
    use stimulus::{MapperConfig, UnknownSourcePolicy};

    const SET: &str = r#"[
        {"frame_idx": 0, "output_text": ["{\"source\": \"heat\", \"proportion\": 0.5}"]},
        {"frame_idx": 30, "output_text": ["nothing to see"]},
        {"frame_idx": 60, "output_text": ["{\"source\": \"wind\", \"proportion\": 0.5}"]}
    ]"#;

    fn sampler(policy: UnknownSourcePolicy) -> Sampler {
        let mapper = CommandMapper::new(MapperConfig { unknown: policy, ..Default::default() });
        Sampler::new(AnnotationSet::from_json_str(SET).unwrap(), mapper)
    }

    #[test]
    fn test_chain_short_circuits() {
        let link = LoopbackLink::silent("loop");
        let mut dev = DeviceChannel::new(SerialConfig::default());
        dev.attach(Box::new(link.clone()));
        let mut s = sampler(UnknownSourcePolicy::Reject);

        assert_eq!(s.sample(15, &mut dev), SampleOutcome::NoAnnotation);
        assert_eq!(s.sample(30, &mut dev), SampleOutcome::NoStimulus);
        assert_eq!(s.sample(60, &mut dev), SampleOutcome::Unmapped);
        assert!(link.written().is_empty());

        match s.sample(0, &mut dev) {
            SampleOutcome::Dispatched(r) => {
                assert_eq!(r.command, DeviceCommand::new('h', 190));
                assert!(r.delivered);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(link.written_lines(), vec!["h190".to_string()]);
        assert_eq!(s.history().count(), 1);
    }

    #[test]
    fn test_dispatch_without_device_is_recorded_undelivered() {
        let mut dev = DeviceChannel::new(SerialConfig::default());
        let mut s = sampler(UnknownSourcePolicy::Zero);
        match s.sample(60, &mut dev) {
            SampleOutcome::Dispatched(r) => {
                assert_eq!(r.command, DeviceCommand::new('w', 0));
                assert!(!r.delivered);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut dev = DeviceChannel::new(SerialConfig::default());
        let mut s = sampler(UnknownSourcePolicy::Zero).with_history_limit(2);
        for _ in 0..5 { s.sample(0, &mut dev); }
        assert_eq!(s.history().count(), 2);
        assert_eq!(s.take_history().len(), 2);
        assert_eq!(s.history().count(), 0);
    }

    #[test]
    fn test_command_at_does_not_send() {
        let s = sampler(UnknownSourcePolicy::Zero);
        assert_eq!(s.command_at(0), Some(DeviceCommand::new('h', 190)));
        assert_eq!(s.command_at(30), None);
        assert_eq!(s.command_at(1), None);
    }
}
