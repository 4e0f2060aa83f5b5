// Daemon configuration
//
// A single TOML file covering the catalog, blob storage, the transcriber,
// and the streams to ingest. Every section has sensible defaults so a
// minimal config only needs a [[streams]] entry.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::transcribe::DEFAULT_WHISPER_MODEL;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub transcriber: TranscriberConfig,
    pub streams: Vec<StreamConfig>,
}

/// Catalog settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// "sqlite3" or "postgres".
    pub driver: String,
    /// A file path for sqlite3, a connection URL for postgres.
    pub conn: String,
}

/// Blob storage settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory the blobs live in.
    pub root: PathBuf,
    /// Serve blobs over a local HTTP port instead of handing out file://
    /// links.
    pub serve: bool,
}

/// Speech-to-text settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscriberConfig {
    pub enabled: bool,
    pub model: String,
}

/// One stream to ingest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    /// Unique human-friendly name, used to upsert the catalog entry.
    pub display_name: String,
    /// Anything the decoder accepts as an input.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            driver: "sqlite3".to_string(),
            conn: "radiowatch.sqlite3".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            root: PathBuf::from("blobs"),
            serve: true,
        }
    }
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        TranscriberConfig {
            enabled: true,
            model: DEFAULT_WHISPER_MODEL.to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("unable to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_minimal_config_gets_defaults() {
        let config: Config = toml::from_str(
            r#"
            [[streams]]
            display_name = "Feed"
            url = "https://example.com/feed"
            "#,
        )
        .unwrap();

        assert_eq!(config.database.driver, "sqlite3");
        assert_eq!(config.storage.root, PathBuf::from("blobs"));
        assert!(config.storage.serve);
        assert!(config.transcriber.enabled);
        assert_eq!(config.transcriber.model, DEFAULT_WHISPER_MODEL);
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].display_name, "Feed");
    }

    #[test]
    fn every_section_can_be_overridden() {
        let config: Config = toml::from_str(
            r#"
            [database]
            driver = "postgres"
            conn = "postgres://localhost/radiowatch"

            [storage]
            root = "/var/lib/radiowatch/blobs"
            serve = false

            [transcriber]
            enabled = false
            model = "base.en"
            "#,
        )
        .unwrap();

        assert_eq!(config.database.driver, "postgres");
        assert!(!config.storage.serve);
        assert!(!config.transcriber.enabled);
        assert_eq!(config.transcriber.model, "base.en");
        assert!(config.streams.is_empty());
    }

    #[test]
    fn loading_a_missing_file_is_an_error() {
        assert!(Config::load(Path::new("/no/such/config.toml")).is_err());
    }
}
