use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Engine configuration, read from a JSON file. Every field has a default,
/// so a partial file (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Compile with per-statement trace points.
    pub trace: bool,
    /// Behave as if every unit started with `Option Explicit`.
    pub option_explicit: bool,
    pub max_call_depth: usize,
    /// Wall-clock limit for one execution. None = unlimited.
    pub script_timeout_ms: Option<u64>,
    /// Base directory for `virtual=` includes.
    pub include_root: Option<PathBuf>,
    /// Files with these extensions are compiled as pages.
    pub page_extensions: Vec<String>,
    pub cache_pages: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            trace: false,
            option_explicit: false,
            max_call_depth: crate::script::vm::DEFAULT_MAX_DEPTH,
            script_timeout_ms: None,
            include_root: None,
            page_extensions: vec!["asp".into(), "aspx".into(), "inc".into()],
            cache_pages: true,
        }
    }
}

impl EngineSettings {
    /// Whether `path` is compiled as a page rather than a plain script.
    pub fn is_page(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.page_extensions.iter().any(|p| p.eq_ignore_ascii_case(ext)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Load settings from `path`. Returns the defaults if the file does not exist.
pub fn load_settings(path: &Path) -> Result<EngineSettings, SettingsError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(EngineSettings::default());
        }
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Save settings as pretty-printed JSON.
pub fn save_settings(path: &Path, settings: &EngineSettings) -> Result<(), SettingsError> {
    let io = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_string_pretty(settings).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io)?;
    }
    std::fs::write(path, json).map_err(io)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vbscript_test_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = temp_dir("settings");
        let path = dir.join("engine.json");
        let settings = EngineSettings {
            trace: true,
            script_timeout_ms: Some(500),
            include_root: Some(PathBuf::from("/srv/site")),
            ..EngineSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path).unwrap(), settings);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = temp_dir("partial");
        let path = dir.join("engine.json");
        std::fs::write(&path, r#"{ "option_explicit": true }"#).unwrap();
        let loaded = load_settings(&path).unwrap();
        assert!(loaded.option_explicit);
        assert_eq!(loaded.max_call_depth, 256);
        assert!(loaded.cache_pages);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing_returns_defaults() {
        let path = std::env::temp_dir().join("vbscript_test_no_such_settings.json");
        assert_eq!(load_settings(&path).unwrap(), EngineSettings::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = temp_dir("malformed");
        let path = dir.join("engine.json");
        std::fs::write(&path, "{ trace: ").unwrap();
        assert!(matches!(load_settings(&path), Err(SettingsError::Parse { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_page_extensions() {
        let settings = EngineSettings::default();
        assert!(settings.is_page(Path::new("site/index.ASP")));
        assert!(!settings.is_page(Path::new("tool.vbs")));
        assert!(!settings.is_page(Path::new("README")));
    }
}
