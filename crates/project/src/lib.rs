use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod library;

pub use library::{VideoEntry, VideoLibrary, VIDEO_EXTENSIONS};

const APP_DIR: &str = "thermal_feedback";

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| std::env::temp_dir());
    base.join(APP_DIR)
}

pub fn config_dir() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| std::env::temp_dir());
    base.join(APP_DIR)
}

pub fn default_config_path() -> PathBuf { config_dir().join("config.json") }

/// Where session dispatch histories are written unless a path is given.
pub fn history_dir() -> PathBuf { app_data_dir().join("sessions") }

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config i/o at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub video_dir: PathBuf,
    /// Holds `<video stem>.json` for every annotated video.
    pub annotation_dir: PathBuf,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self { video_dir: PathBuf::from("assets/videos"), annotation_dir: PathBuf::from("assets/llm_res") }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: device::SerialConfig,
    pub mapping: stimulus::MapperConfig,
    pub playback: playback::PlaybackConfig,
    pub library: LibraryConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
    }

    /// Defaults when the file does not exist; a file that exists but does
    /// not parse is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io { path: path.display().to_string(), source };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) { fs::create_dir_all(dir).map_err(io_err)?; }
        let text = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })?;
        fs::write(path, text).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stimulus::UnknownSourcePolicy;

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"serial": {"port": "/dev/ttyACM0"}, "mapping": {"unknown": "reject"}}"#).unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.serial.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cfg.serial.baud_rate, 9600);
        assert_eq!(cfg.mapping.unknown, UnknownSourcePolicy::Reject);
        assert_eq!(cfg.mapping.heat.scale, 80.0);
        assert_eq!(cfg.library, LibraryConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = AppConfig::default();
        cfg.playback.fallback_fps = 24.0;
        cfg.save(&path).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn test_missing_and_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.json");
        assert_eq!(AppConfig::load_or_default(&missing).unwrap(), AppConfig::default());
        assert!(matches!(AppConfig::load(&missing), Err(ConfigError::Io { .. })));
        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{").unwrap();
        assert!(matches!(AppConfig::load_or_default(&broken), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_default_paths_live_under_app_dir() {
        assert!(default_config_path().ends_with("thermal_feedback/config.json"));
        assert!(history_dir().starts_with(app_data_dir()));
    }
}
