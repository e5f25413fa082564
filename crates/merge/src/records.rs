use std::fs;
use std::path::Path;

use annotations::{parse, AnnotationRecord};
use serde_json::{Map, Value};

use crate::MergeError;

fn schema(path: &Path, index: Option<usize>, reason: impl Into<String>) -> MergeError {
    MergeError::Schema { path: path.display().to_string(), index, reason: reason.into() }
}

fn optional_int(path: &Path, index: usize, obj: &Map<String, Value>, key: &str) -> Result<Option<i64>, MergeError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| schema(path, Some(index), format!("`{key}` is not an integer"))),
    }
}

/// Validates one record and decodes its model output eagerly. Requires
/// `frame_idx` and either `output_text` (array of strings) or a previously
/// merged `parsed` object.
fn normalize(path: &Path, index: usize, item: &Value) -> Result<AnnotationRecord, MergeError> {
    let obj = item.as_object().ok_or_else(|| schema(path, Some(index), "record is not an object"))?;
    let frame_idx = match obj.get("frame_idx") {
        None => return Err(schema(path, Some(index), "missing key `frame_idx`")),
        Some(v) => v.as_u64().ok_or_else(|| schema(path, Some(index), "`frame_idx` is not a non-negative integer"))?,
    };
    let annotation = match (obj.get("output_text"), obj.get("parsed")) {
        (Some(Value::Array(items)), _) => {
            let raw = items
                .iter()
                .map(|s| s.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| schema(path, Some(index), "`output_text` must contain only strings"))?;
            parse(&raw)
        }
        (Some(_), _) => return Err(schema(path, Some(index), "`output_text` is not an array")),
        (None, Some(parsed)) => serde_json::from_value(parsed.clone())?,
        (None, None) => return Err(schema(path, Some(index), "missing key `output_text`")),
    };
    let mut record = AnnotationRecord::new(frame_idx, Vec::new());
    record.second = optional_int(path, index, obj, "second")?;
    record.ms = optional_int(path, index, obj, "ms")?;
    record.parsed = Some(annotation);
    Ok(record)
}

/// Strict counterpart of `AnnotationSet::load`: any schema problem is an
/// error naming the file and record.
pub fn read_segment_records(path: &Path) -> Result<Vec<AnnotationRecord>, MergeError> {
    let text = fs::read_to_string(path).map_err(|source| MergeError::Io { path: path.display().to_string(), source })?;
    let value: Value = serde_json::from_str(&text).map_err(|e| schema(path, None, format!("invalid json: {e}")))?;
    let items = value.as_array().ok_or_else(|| schema(path, None, "top level must be an array of records"))?;
    items.iter().enumerate().map(|(i, item)| normalize(path, i, item)).collect()
}

/// Shifts every record onto the merged timeline.
pub fn rebase(records: Vec<AnnotationRecord>, offset: u64, segment: usize, source_video: &str) -> Vec<AnnotationRecord> {
    records
        .into_iter()
        .map(|mut r| {
            r.frame_idx += offset;
            r.segment = Some(segment);
            r.source_video = Some(source_video.to_string());
            r
        })
        .collect()
}
