//! Concatenates annotated segments into one video and one annotation file
//! whose frame indices address the concatenated stream.
//!
//! Offsets come from the frames actually decoded from each segment, never
//! from container metadata, so a record always lands on the frame it was
//! produced for.

use std::fs;
use std::path::{Path, PathBuf};

use annotations::AnnotationRecord;
use media_io::{fit_to, FfmpegReader, FfmpegWriter, FrameSink, FrameSource, MediaError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod records;

pub use records::{read_segment_records, rebase};

/// Used when the first segment reports no usable frame rate.
const FALLBACK_FPS: f64 = 30.0;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("{videos} videos but {annotations} annotation files")]
    LengthMismatch { videos: usize, annotations: usize },
    #[error("nothing to merge")]
    Empty,
    #[error("{path}{}: {reason}", .index.map(|i| format!(" record {i}")).unwrap_or_default())]
    Schema { path: String, index: Option<usize>, reason: String },
    #[error("video {path}: {source}")]
    Video {
        path: String,
        #[source]
        source: MediaError,
    },
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeInput {
    pub video: PathBuf,
    pub annotations: PathBuf,
}

/// Pairs the i-th video with the i-th annotation file.
pub fn pair_inputs(videos: Vec<PathBuf>, annotations: Vec<PathBuf>) -> Result<Vec<MergeInput>, MergeError> {
    if videos.len() != annotations.len() {
        return Err(MergeError::LengthMismatch { videos: videos.len(), annotations: annotations.len() });
    }
    if videos.is_empty() { return Err(MergeError::Empty); }
    Ok(videos.into_iter().zip(annotations).map(|(video, annotations)| MergeInput { video, annotations }).collect())
}

/// One decoded input plus its validated records, still on local indices.
pub struct Segment<S> {
    pub name: String,
    pub source: S,
    pub records: Vec<AnnotationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub video: String,
    /// Frames decoded and written.
    pub frames: u64,
    /// First merged index of this segment.
    pub offset: u64,
    pub records: usize,
    /// Frames that had to be resampled to the output size.
    pub resized: u64,
    pub reported_frames: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub total_frames: u64,
    pub total_records: usize,
    pub segments: Vec<SegmentSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MergeEvent {
    SegmentStarted { index: usize, video: String },
    SegmentFinished { index: usize, frames: u64 },
    AnnotationsWritten { records: usize },
}

/// Streams every segment into `sink` in order and rebases each segment's
/// records by the number of frames written before it. Frames whose size
/// differs from `width`x`height` are resampled. Each source is dropped as
/// soon as it is exhausted.
pub fn merge_streams<S, K, F>(
    segments: Vec<Segment<S>>,
    sink: &mut K,
    width: u32,
    height: u32,
    mut on_event: F,
) -> Result<(Vec<AnnotationRecord>, MergeSummary), MergeError>
where
    S: FrameSource,
    K: FrameSink + ?Sized,
    F: FnMut(MergeEvent),
{
    if segments.is_empty() { return Err(MergeError::Empty); }
    let mut summary = MergeSummary::default();
    let mut merged = Vec::new();

    for (index, segment) in segments.into_iter().enumerate() {
        let Segment { name, mut source, records } = segment;
        on_event(MergeEvent::SegmentStarted { index, video: name.clone() });
        let offset = summary.total_frames;
        let reported_frames = source.info().frame_count;
        let mut frames = 0u64;
        let mut resized = 0u64;
        while let Some(frame) = source.read_frame().map_err(|source| MergeError::Video { path: name.clone(), source })? {
            if frame.dimensions() != (width, height) { resized += 1; }
            let frame = fit_to(frame, width, height);
            sink.write_frame(&frame).map_err(|source| MergeError::Video { path: "<output>".into(), source })?;
            frames += 1;
        }
        drop(source);

        if reported_frames.is_some_and(|n| n != frames) {
            tracing::warn!(video = %name, reported = ?reported_frames, decoded = frames, "frame count metadata disagrees with decoded frames");
        }
        if resized > 0 {
            tracing::info!(video = %name, resized, width, height, "resampled mismatched frames");
        }
        let out_of_range = records.iter().filter(|r| r.frame_idx >= frames).count();
        if out_of_range > 0 {
            tracing::warn!(video = %name, out_of_range, frames, "records point past the end of their segment");
        }

        let count = records.len();
        merged.extend(rebase(records, offset, index, &name));
        summary.total_frames += frames;
        summary.total_records += count;
        summary.segments.push(SegmentSummary { video: name, frames, offset, records: count, resized, reported_frames });
        tracing::debug!(segment = index, frames, offset, records = count, "segment merged");
        on_event(MergeEvent::SegmentFinished { index, frames });
    }
    Ok((merged, summary))
}

/// Writes records as a pretty-printed JSON array, creating parent
/// directories as needed.
pub fn write_records(path: &Path, records: &[AnnotationRecord]) -> Result<(), MergeError> {
    let io_err = |source| MergeError::Io { path: path.display().to_string(), source };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(io_err)?;
    }
    let text = serde_json::to_string_pretty(records)?;
    fs::write(path, text).map_err(io_err)
}

/// Merges on-disk segments with ffmpeg. All annotation files are validated
/// and every video is opened before the first frame is written; the output
/// takes the first video's size and frame rate.
pub fn merge<F>(inputs: &[MergeInput], output_video: &Path, output_annotations: &Path, mut on_event: F) -> Result<MergeSummary, MergeError>
where
    F: FnMut(MergeEvent),
{
    if inputs.is_empty() { return Err(MergeError::Empty); }

    let validated = inputs
        .iter()
        .map(|input| read_segment_records(&input.annotations))
        .collect::<Result<Vec<_>, _>>()?;
    let mut segments = Vec::with_capacity(inputs.len());
    for (input, records) in inputs.iter().zip(validated) {
        let name = input.video.display().to_string();
        let source = FfmpegReader::open(&input.video).map_err(|source| MergeError::Video { path: name.clone(), source })?;
        segments.push(Segment { name, source, records });
    }

    let info = segments[0].source.info().clone();
    let fps = if info.fps > 0.0 { info.fps } else { FALLBACK_FPS };
    if let Some(dir) = output_video.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|source| MergeError::Io { path: dir.display().to_string(), source })?;
    }
    let out_name = output_video.display().to_string();
    let mut writer = FfmpegWriter::create(output_video, info.width, info.height, fps)
        .map_err(|source| MergeError::Video { path: out_name.clone(), source })?;
    tracing::info!(segments = segments.len(), width = info.width, height = info.height, fps, output = %out_name, "merging");

    // a failed merge leaves no partial video behind
    let (records, summary) = match merge_streams(segments, &mut writer, info.width, info.height, &mut on_event) {
        Ok(merged) => merged,
        Err(e) => {
            writer.abort();
            return Err(e);
        }
    };
    if let Err(source) = writer.finish() {
        writer.abort();
        return Err(MergeError::Video { path: out_name, source });
    }

    write_records(output_annotations, &records)?;
    on_event(MergeEvent::AnnotationsWritten { records: records.len() });
    tracing::info!(frames = summary.total_frames, records = summary.total_records, "merge complete");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use annotations::AnnotationSet;
    use media_io::memory::{MemorySink, MemorySource};

    fn record(frame_idx: u64, text: &str) -> AnnotationRecord {
        let mut r = AnnotationRecord::new(frame_idx, Vec::new());
        r.parsed = Some(annotations::parse(&[text.to_string()]));
        r
    }

    fn segment(name: &str, source: MemorySource, records: Vec<AnnotationRecord>) -> Segment<MemorySource> {
        Segment { name: name.into(), source, records }
    }

    #[test]
    fn test_offsets_use_decoded_frame_counts() {
        // A's container claims zero frames
        let a = MemorySource::gradient(100, 4, 4, 30.0).with_reported_count(Some(0));
        let b = MemorySource::gradient(50, 4, 4, 30.0);
        let heat = r#"{"source": "heat", "proportion": 0.5}"#;
        let segments = vec![
            segment("a.mp4", a, vec![record(0, heat), record(30, "none")]),
            segment("b.mp4", b, vec![record(10, heat)]),
        ];
        let mut sink = MemorySink::default();
        let mut events = Vec::new();
        let (records, summary) = merge_streams(segments, &mut sink, 4, 4, |e| events.push(e)).unwrap();

        assert_eq!(sink.frames.len(), 150);
        assert_eq!(summary.total_frames, 150);
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.segments[1].offset, 100);
        let frames: Vec<u64> = records.iter().map(|r| r.frame_idx).collect();
        assert_eq!(frames, vec![0, 30, 110]);
        assert_eq!(records[2].segment, Some(1));
        assert_eq!(records[2].source_video.as_deref(), Some("b.mp4"));
        // frame 110 of the merged stream is frame 10 of b
        assert_eq!(sink.frames[110].get_pixel(0, 0)[0], 10);
        assert_eq!(events.first(), Some(&MergeEvent::SegmentStarted { index: 0, video: "a.mp4".into() }));
        assert_eq!(events.last(), Some(&MergeEvent::SegmentFinished { index: 1, frames: 50 }));

        let set = AnnotationSet::new(records);
        assert_eq!(set.annotation_at(110).and_then(|a| a.stimulus().map(|s| s.source.clone())), Some("heat".into()));
    }

    #[test]
    fn test_mismatched_frames_are_resampled() {
        let a = MemorySource::gradient(3, 8, 6, 30.0);
        let b = MemorySource::gradient(2, 16, 12, 30.0);
        let mut sink = MemorySink::default();
        let (_, summary) = merge_streams(vec![segment("a", a, vec![]), segment("b", b, vec![])], &mut sink, 8, 6, |_| {}).unwrap();
        assert_eq!(sink.frames.len(), 5);
        assert!(sink.frames.iter().all(|f| f.dimensions() == (8, 6)));
        assert_eq!(summary.segments[0].resized, 0);
        assert_eq!(summary.segments[1].resized, 2);
    }

    #[test]
    fn test_empty_and_mismatched_inputs() {
        let mut sink = MemorySink::default();
        let none: Vec<Segment<MemorySource>> = Vec::new();
        assert!(matches!(merge_streams(none, &mut sink, 1, 1, |_| {}), Err(MergeError::Empty)));
        assert!(matches!(
            pair_inputs(vec!["a.mp4".into(), "b.mp4".into()], vec!["a.json".into()]),
            Err(MergeError::LengthMismatch { videos: 2, annotations: 1 })
        ));
        assert!(matches!(pair_inputs(vec![], vec![]), Err(MergeError::Empty)));
        let pairs = pair_inputs(vec!["a.mp4".into()], vec!["a.json".into()]).unwrap();
        assert_eq!(pairs[0].annotations, PathBuf::from("a.json"));
    }

    #[test]
    fn test_merge_rejects_bad_annotations_before_touching_video() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("a.json");
        fs::write(&bad, r#"[{"output_text": ["x"]}]"#).unwrap();
        let inputs = vec![MergeInput { video: dir.path().join("missing.mp4"), annotations: bad }];
        let out = dir.path().join("out.mp4");
        let err = merge(&inputs, &out, &dir.path().join("out.json"), |_| {}).unwrap_err();
        assert!(matches!(err, MergeError::Schema { index: Some(0), .. }));
        assert!(!out.exists());
    }

    fn encode(path: &Path, frames: usize, width: u32, height: u32) {
        let mut src = MemorySource::gradient(frames, width, height, 25.0);
        let mut writer = FfmpegWriter::create(path, width, height, 25.0).unwrap();
        while let Some(frame) = src.read_frame().unwrap() { writer.write_frame(&frame).unwrap(); }
        writer.finish().unwrap();
    }

    #[test]
    fn test_merge_encoded_segments() {
        if which::which("ffmpeg").is_err() || which::which("ffprobe").is_err() {
            eprintln!("ffmpeg not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a.mp4"), dir.path().join("b.mp4"));
        encode(&a, 30, 64, 48);
        encode(&b, 20, 32, 24);
        let (a_json, b_json) = (dir.path().join("a.json"), dir.path().join("b.json"));
        let heat = r#"{\"source\": \"heat\", \"proportion\": 0.5}"#;
        fs::write(&a_json, format!(r#"[{{"frame_idx": 0, "output_text": ["{heat}"]}}, {{"frame_idx": 25, "output_text": ["none"]}}]"#)).unwrap();
        fs::write(&b_json, format!(r#"[{{"frame_idx": 10, "output_text": ["{heat}"]}}]"#)).unwrap();

        let inputs = pair_inputs(vec![a, b], vec![a_json, b_json]).unwrap();
        let out = dir.path().join("out").join("merged.mp4");
        let out_json = dir.path().join("out").join("merged.json");
        let mut events = Vec::new();
        let summary = merge(&inputs, &out, &out_json, |e| events.push(e)).unwrap();

        assert_eq!(summary.total_frames, 50);
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.segments[1].offset, 30);
        assert_eq!(summary.segments[1].resized, 20);
        assert_eq!(events.last(), Some(&MergeEvent::AnnotationsWritten { records: 3 }));

        let set = AnnotationSet::try_load(&out_json).unwrap();
        assert_eq!(set.len(), 3);
        let rebased = set.lookup(40).unwrap();
        assert_eq!(rebased.segment, Some(1));
        assert!(rebased.annotation().stimulus().is_some());
        assert!(set.lookup(10).is_none());

        let mut merged = FfmpegReader::open(&out).unwrap();
        assert_eq!((merged.info().width, merged.info().height), (64, 48));
        assert_eq!(media_io::count_frames(&mut merged).unwrap(), 50);
    }

    #[test]
    fn test_written_records_drop_raw_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("merged.json");
        let mut r = record(110, r#"{"source": "cold", "proportion": 1.0}"#);
        r.segment = Some(1);
        write_records(&path, &[r]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("output_text"));
        let set = AnnotationSet::try_load(&path).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.annotation_at(110).is_some_and(|a| !a.is_none()));
    }
}
