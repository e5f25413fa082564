use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod parse;

pub use parse::{object_span, parse, Annotation, Stimulus};

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("annotation file not found: {0}")]
    NotFound(String),
    #[error("malformed annotation file {path}: {reason}")]
    Malformed { path: String, reason: String },
}

pub type FrameIdx = u64; // 0-based index into the (possibly merged) decoded stream

/// One sampled video instant with the model output produced for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub frame_idx: FrameIdx,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ms: Option<i64>,
    #[serde(rename = "output_text", alias = "raw_output", default, skip_serializing_if = "Vec::is_empty")]
    pub raw_output: Vec<String>,
    /// Present on merged timelines, where the completion was decoded eagerly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<serde_json::Value>,
}

impl AnnotationRecord {
    pub fn new(frame_idx: FrameIdx, raw_output: Vec<String>) -> Self {
        Self { frame_idx, second: None, ms: None, raw_output, parsed: None, segment: None, source_video: None, conversation: None }
    }

    /// Eager parse if the record carries one, otherwise decodes `raw_output`.
    pub fn annotation(&self) -> Annotation {
        match &self.parsed {
            Some(a) => a.clone(),
            None => parse(&self.raw_output),
        }
    }
}

/// Annotations for one video or merged timeline, indexed by exact frame.
#[derive(Debug, Clone, Default)]
pub struct AnnotationSet {
    records: Vec<AnnotationRecord>,
    index: HashMap<FrameIdx, usize>,
}

impl AnnotationSet {
    pub fn empty() -> Self { Self::default() }

    pub fn new(records: Vec<AnnotationRecord>) -> Self {
        let mut index = HashMap::with_capacity(records.len());
        for (i, r) in records.iter().enumerate() {
            // first record for a frame wins
            index.entry(r.frame_idx).or_insert(i);
        }
        Self { records, index }
    }

    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        let records: Vec<AnnotationRecord> = serde_json::from_str(text)?;
        Ok(Self::new(records))
    }

    pub fn try_load(path: &Path) -> Result<Self, AnnotationError> {
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AnnotationError::NotFound(path.display().to_string()),
            _ => AnnotationError::Malformed { path: path.display().to_string(), reason: e.to_string() },
        })?;
        Self::from_json_str(&text).map_err(|e| AnnotationError::Malformed { path: path.display().to_string(), reason: e.to_string() })
    }

    /// Lenient load used during playback: a missing or malformed file means
    /// "no stimulus for this video" and yields an empty set.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(set) => {
                tracing::info!(path = %path.display(), records = set.len(), "loaded annotations");
                set
            }
            Err(e) => {
                tracing::warn!(error = %e, "no annotations for video");
                Self::empty()
            }
        }
    }

    pub fn lookup(&self, frame_idx: FrameIdx) -> Option<&AnnotationRecord> {
        self.index.get(&frame_idx).map(|&i| &self.records[i])
    }

    /// Lookup followed by parse. `Some(Annotation::None)` means a record
    /// exists but its output carried no usable label.
    pub fn annotation_at(&self, frame_idx: FrameIdx) -> Option<Annotation> {
        self.lookup(frame_idx).map(AnnotationRecord::annotation)
    }

    pub fn records(&self) -> &[AnnotationRecord] { &self.records }

    pub fn len(&self) -> usize { self.records.len() }

    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    pub fn frame_range(&self) -> Option<(FrameIdx, FrameIdx)> {
        let min = self.records.iter().map(|r| r.frame_idx).min()?;
        let max = self.records.iter().map(|r| r.frame_idx).max()?;
        Some((min, max))
    }
}
