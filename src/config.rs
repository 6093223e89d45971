//! Persisted relay settings.
//!
//! A small JSON file keeps the bind host/port between runs; on first run it is
//! created with defaults. Missing fields fall back to their defaults, so old
//! files keep working when new settings appear.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Settings {
    /// Bind host; empty means every address of both families.
    #[serde(default)]
    pub(crate) host: String,

    #[serde(default = "default_port")]
    pub(crate) port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    3123
}

/// Load settings from `path`, creating the file with defaults if it does not
/// exist.
pub(crate) fn load_or_create(path: &Path) -> Result<Settings> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            serde_json::from_str(&raw).with_context(|| format!("parse settings {path:?}"))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let settings = Settings::default();
            let raw =
                serde_json::to_string_pretty(&settings).context("serialize default settings")?;
            fs::write(path, raw).with_context(|| format!("write default settings {path:?}"))?;
            Ok(settings)
        }
        Err(e) => Err(e).with_context(|| format!("read settings {path:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    // Uniqueness without extra crates.
    fn temp_path(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("audio-relay-test-{tag}-{nanos}.json"))
    }

    #[test]
    fn first_run_creates_defaults_and_reloads() {
        let path = temp_path("create");
        let created = load_or_create(&path).unwrap();
        assert_eq!(created, Settings::default());

        let reloaded = load_or_create(&path).unwrap();
        assert_eq!(reloaded, created);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let path = temp_path("partial");
        std::fs::write(&path, r#"{"host": "10.0.0.5"}"#).unwrap();

        let settings = load_or_create(&path).unwrap();
        assert_eq!(settings.host, "10.0.0.5");
        assert_eq!(settings.port, 3123);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = temp_path("bad");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_or_create(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
