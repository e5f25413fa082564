use std::fs;
use std::path::{Path, PathBuf};

use crate::ConfigError;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoEntry {
    pub name: String,
    pub video: PathBuf,
    /// `<annotation_dir>/<stem>.json`; may not exist.
    pub annotations: PathBuf,
}

/// Videos available for playback, sorted by file name.
#[derive(Debug, Clone, Default)]
pub struct VideoLibrary {
    entries: Vec<VideoEntry>,
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(e)))
}

impl VideoLibrary {
    pub fn scan(video_dir: &Path, annotation_dir: &Path) -> Result<Self, ConfigError> {
        let read = fs::read_dir(video_dir).map_err(|source| ConfigError::Io { path: video_dir.display().to_string(), source })?;
        let mut entries: Vec<VideoEntry> = read
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_video(p))
            .filter_map(|video| {
                let name = video.file_name()?.to_str()?.to_string();
                let stem = video.file_stem()?.to_str()?.to_string();
                Some(VideoEntry { name, annotations: annotation_dir.join(format!("{stem}.json")), video })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let missing = entries.iter().filter(|e| !e.annotations.exists()).count();
        tracing::info!(dir = %video_dir.display(), videos = entries.len(), missing_annotations = missing, "scanned video library");
        Ok(Self { entries })
    }

    pub fn get(&self, index: usize) -> Option<&VideoEntry> { self.entries.get(index) }

    pub fn entries(&self) -> &[VideoEntry] { &self.entries }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_sorts_and_pairs_annotations() {
        let dir = tempfile::tempdir().unwrap();
        let videos = dir.path().join("videos");
        let notes = dir.path().join("llm_res");
        fs::create_dir_all(&videos).unwrap();
        fs::create_dir_all(&notes).unwrap();
        for f in ["ice_cup.mp4", "fire.MP4", "notes.txt", "clip.mkv"] { fs::write(videos.join(f), b"").unwrap(); }
        fs::create_dir_all(videos.join("sub.mp4")).unwrap();
        fs::write(notes.join("fire.json"), "[]").unwrap();

        let lib = VideoLibrary::scan(&videos, &notes).unwrap();
        assert_eq!(lib.entries().iter().map(|e| e.name.as_str()).collect::<Vec<_>>(), vec!["clip.mkv", "fire.MP4", "ice_cup.mp4"]);
        let fire = lib.get(1).unwrap();
        assert_eq!(fire.annotations, notes.join("fire.json"));
        assert!(fire.annotations.exists());
        assert!(!lib.get(2).unwrap().annotations.exists());
        assert!(lib.get(3).is_none());
    }

    #[test]
    fn test_scan_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(VideoLibrary::scan(&dir.path().join("nope"), dir.path()).is_err());
    }
}
