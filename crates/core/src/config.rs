//! Tunable scan parameters.
//!
//! The window sizes and the GUID distinct-byte threshold are empirical, so they
//! are configuration rather than constants. A config file is optional; every
//! field falls back to its default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to parse YAML config {path}: {source}")]
    Yaml { path: PathBuf, source: serde_yaml::Error },
    #[error("failed to parse JSON config {path}: {source}")]
    Json { path: PathBuf, source: serde_json::Error },
}

/// Optional replacement files for the bundled GUID databases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabasePaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edk2: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edk: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// A GUID candidate needs strictly more distinct byte values than this.
    pub guid_distinct_byte_threshold: usize,
    /// Instructions searched backwards for a `push` on 32-bit modules.
    pub x86_window: usize,
    /// Instructions searched backwards for a `lea` on 64-bit modules.
    pub x64_window: usize,
    /// Instructions searched backwards for the `mov rax, [gBS]` load.
    pub gbs_window: usize,
    /// Segments swept for unreferenced GUIDs.
    pub sweep_segments: Vec<String>,
    pub databases: DatabasePaths,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            guid_distinct_byte_threshold: 8,
            x86_window: 24,
            x64_window: 9,
            gbs_window: 10,
            sweep_segments: vec![".text".to_string(), ".data".to_string()],
            databases: DatabasePaths::default(),
        }
    }
}

impl ScanConfig {
    /// Load a config file; `.json` is parsed as JSON, anything else as YAML.
    ///
    /// Relative database paths are resolved against the config file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let body = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        let mut config: ScanConfig = if is_json {
            serde_json::from_str(&body)
                .map_err(|source| ConfigError::Json { path: path.to_path_buf(), source })?
        } else if body.trim().is_empty() {
            ScanConfig::default()
        } else {
            serde_yaml::from_str(&body)
                .map_err(|source| ConfigError::Yaml { path: path.to_path_buf(), source })?
        };
        if let Some(dir) = path.parent() {
            config.databases.resolve_relative_to(dir);
        }
        Ok(config)
    }

    /// Load `path` if it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

impl DatabasePaths {
    fn resolve_relative_to(&mut self, dir: &Path) {
        for slot in [&mut self.edk2, &mut self.edk, &mut self.ami] {
            if let Some(p) = slot.as_mut() {
                if p.is_relative() {
                    *p = dir.join(&*p);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "x64_window: 12\ndatabases:\n  ami: extra/ami.json\n").unwrap();

        let config = ScanConfig::load(&path).expect("load yaml");
        assert_eq!(config.x64_window, 12);
        assert_eq!(config.x86_window, 24);
        assert_eq!(config.guid_distinct_byte_threshold, 8);
        assert_eq!(config.databases.ami, Some(dir.path().join("extra/ami.json")));
        assert_eq!(config.databases.edk2, None);
    }

    #[test]
    fn json_config_is_selected_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"guid_distinct_byte_threshold": 10}"#).unwrap();
        let config = ScanConfig::load(&path).expect("load json");
        assert_eq!(config.guid_distinct_byte_threshold, 10);
        assert_eq!(config.sweep_segments, vec![".text", ".data"]);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScanConfig::load_or_default(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, ScanConfig::default());
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "x64_window: [not a number").unwrap();
        assert!(matches!(ScanConfig::load(&path), Err(ConfigError::Yaml { .. })));
    }
}
