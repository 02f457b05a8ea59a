// src/config.rs - Application configuration
use crate::landmarker::HandLandmarkerOptions;
use crate::recording::RecordingConfig;
use crate::visualizer::VisualizationConfig;
use crate::webcam::CameraConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_ENV_VAR: &str = "HAND_VISUALIZER_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub camera: CameraConfig,
    pub tracker: HandLandmarkerOptions,
    pub visualization: VisualizationConfig,
    pub recording: RecordingConfig,
}

impl AppConfig {
    /// `$HAND_VISUALIZER_CONFIG`, falling back to the per-user config directory.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }
        directories::ProjectDirs::from("com", "handvisualizer", "HandVisualizer")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// A missing config file is not an error.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            Some(path) => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarker::BackendConfig;

    #[test]
    fn empty_object_is_all_defaults() {
        let config = AppConfig::from_json_str("{}").unwrap();
        assert_eq!(config.camera.index, 0);
        assert_eq!(config.tracker.num_hands, 2);
        assert_eq!(config.visualization.right_color, 0xadd8e6);
        assert!(matches!(config.tracker.backend, BackendConfig::Subprocess { .. }));
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let config = AppConfig::from_json_str(
            r#"{
                "camera": {"width": 1280, "height": 720},
                "tracker": {"num_hands": 1, "smoothing": true, "backend": {"kind": "simulated"}},
                "visualization": {"hint_duration_ms": 500},
                "recording": {"output_directory": "/tmp/hands"}
            }"#,
        )
        .unwrap();

        assert_eq!((config.camera.width, config.camera.height, config.camera.fps), (1280, 720, 30));
        assert_eq!(config.tracker.num_hands, 1);
        assert!(config.tracker.smoothing);
        assert_eq!(config.tracker.min_hand_detection_confidence, 0.5);
        assert!(matches!(config.tracker.backend, BackendConfig::Simulated));
        assert_eq!(config.visualization.hint_duration_ms, 500);
        assert_eq!(config.visualization.ring_segments, 64);
        assert_eq!(config.recording.output_directory, PathBuf::from("/tmp/hands"));
    }

    #[test]
    fn file_errors_carry_the_path() {
        let dir = std::env::temp_dir().join(format!("hand_visualizer_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let missing = dir.join("missing.json");
        let err = AppConfig::from_file(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("missing.json"));

        let broken = dir.join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        assert!(matches!(AppConfig::from_file(&broken), Err(ConfigError::Parse { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn config_survives_a_save_and_reload() {
        let mut config = AppConfig::default();
        config.tracker.backend = BackendConfig::Replay {
            path: PathBuf::from("session/landmarks.csv"),
            looping: true,
        };
        let text = serde_json::to_string_pretty(&config).unwrap();
        let reloaded = AppConfig::from_json_str(&text).unwrap();
        assert!(matches!(reloaded.tracker.backend, BackendConfig::Replay { looping: true, .. }));
    }
}
