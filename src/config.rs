//! `QuiverDB` configuration module.
//!
//! Provides configuration file support via `quiverdb.toml`, environment
//! variables, and programmatic defaults.
//!
//! # Priority (highest to lowest)
//!
//! 1. Environment variables (`QUIVERDB_*`)
//! 2. Configuration file (`quiverdb.toml`)
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Server configuration section.
///
/// The engine itself never reads these; they are part of the recognized
/// schema for the serving layer embedding the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
        }
    }
}

/// Index configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Index kind. Only "hnsw" is supported.
    #[serde(rename = "type")]
    pub kind: String,
    /// Vector dimension. Required; every embedding is checked against it.
    pub dimensions: usize,
    /// Search expansion factor, clamped to `[1, 1000]` at the index.
    pub ef_search: usize,
    /// Seed for the rebuild-order shuffle. Fixed seed gives a
    /// deterministic rebuild order.
    pub rebuild_seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: "hnsw".to_string(),
            dimensions: 0,
            ef_search: 50,
            rebuild_seed: 0x51F0_D1CE_B0A7_2A11,
        }
    }
}

/// Storage configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory owned by the vector store.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./quiverdb_data".to_string(),
        }
    }
}

/// Database limits section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Advisory cap on stored vectors. Not enforced per write; surfaced in
    /// stats for operators.
    pub max_vectors: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_vectors: 1_000_000,
        }
    }
}

/// Logging configuration section.
///
/// Consumed by the embedding application when it installs a `tracing`
/// subscriber; the engine itself only emits events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level: "debug", "info", "warn", or "error".
    pub level: String,
    /// Encoder hint: "json" or "console".
    pub encoding: String,
    /// Enable verbose development output.
    pub dev_mode: bool,
    /// Output destinations (e.g. "stdout" or file paths).
    pub output_paths: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            encoding: "json".to_string(),
            dev_mode: false,
            output_paths: vec!["stdout".to_string()],
        }
    }
}

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server section, consumed by the serving layer.
    pub server: ServerConfig,
    /// Index section.
    pub index: IndexConfig,
    /// Storage section.
    pub storage: StorageConfig,
    /// Database limits section.
    pub database: DatabaseConfig,
    /// Logging section.
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration by layering defaults, a TOML file, and
    /// `QUIVERDB_*` environment variables.
    ///
    /// Missing files are not an error; the remaining layers still apply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a layer fails to parse or the merged
    /// configuration fails validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("QUIVERDB_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a required option is missing or an
    /// option carries an unsupported value.
    pub fn validate(&self) -> Result<()> {
        if self.index.dimensions == 0 {
            return Err(Error::Config(
                "index.dimensions is required and must be greater than 0".to_string(),
            ));
        }
        if self.index.kind != "hnsw" {
            return Err(Error::Config(format!(
                "unsupported index.type '{}' (only \"hnsw\" is supported)",
                self.index.kind
            )));
        }
        if self.storage.data_dir.is_empty() {
            return Err(Error::Config("storage.data_dir must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.index.kind, "hnsw");
        assert_eq!(config.index.ef_search, 50);
        assert_eq!(config.database.max_vectors, 1_000_000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_validate_requires_dimensions() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.index.dimensions = 128;
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_index_kind() {
        let mut config = Config::default();
        config.index.dimensions = 128;
        config.index.kind = "ivf".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quiverdb.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[index]\ndimensions = 384\nef_search = 120\n\n[storage]\ndata_dir = \"/tmp/qvr\""
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.index.dimensions, 384);
        assert_eq!(config.index.ef_search, 120);
        assert_eq!(config.storage.data_dir, "/tmp/qvr");
        // Untouched sections keep their defaults.
        assert_eq!(config.database.max_vectors, 1_000_000);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let result = Config::load("/nonexistent/quiverdb.toml");
        // Defaults alone fail validation (dimensions unset), proving the
        // missing file itself was not the error.
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
