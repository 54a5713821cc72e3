use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Upper bound for a single bulk-write chunk
pub const MAX_BATCH_SIZE: usize = 5000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_file_name")]
    pub file_name: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            file_name: default_file_name(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    pub fn path(&self) -> PathBuf {
        self.data_dir.join(&self.file_name)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_file_name() -> String {
    "optgrid.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusteringConfig {
    /// Number of resource documents written per transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between background reapply passes (0 disables the worker)
    #[serde(default = "default_reapply_interval")]
    pub reapply_interval_secs: u64,
    /// Seconds to wait after startup before the first pass
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            reapply_interval_secs: default_reapply_interval(),
            startup_delay_secs: default_startup_delay(),
        }
    }
}

impl ClusteringConfig {
    /// Chunk size actually used for bulk writes
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_reapply_interval() -> u64 {
    3600
}

fn default_startup_delay() -> u64 {
    30
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse configuration file")
    }

    /// Collect configuration problems that would make the engine misbehave
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.database.file_name.trim().is_empty() {
            problems.push("database.file_name must not be empty".to_string());
        }
        if self.database.max_connections == 0 {
            problems.push("database.max_connections must be at least 1".to_string());
        }
        if self.clustering.batch_size == 0 || self.clustering.batch_size > MAX_BATCH_SIZE {
            problems.push(format!(
                "clustering.batch_size must be between 1 and {} (got {})",
                MAX_BATCH_SIZE, self.clustering.batch_size
            ));
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            problems.push(format!("logging.level '{}' is not a valid filter", self.logging.level));
        }

        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.database.file_name, "optgrid.db");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.clustering.batch_size, 500);
        assert_eq!(config.clustering.reapply_interval_secs, 3600);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_override() {
        let config = Config::parse(
            r#"
            [clustering]
            batch_size = 50
            reapply_interval_secs = 0

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.clustering.batch_size, 50);
        assert_eq!(config.clustering.reapply_interval_secs, 0);
        assert_eq!(config.clustering.startup_delay_secs, 30);
        assert!(config.logging.json);
        assert_eq!(config.database.path(), PathBuf::from("./data/optgrid.db"));
    }

    #[test]
    fn test_validate_reports_bad_batch_size() {
        let mut config = Config::default();
        config.clustering.batch_size = 0;
        let problems = config.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("batch_size"));
        assert_eq!(config.clustering.effective_batch_size(), 1);

        config.clustering.batch_size = 100_000;
        assert_eq!(config.clustering.effective_batch_size(), MAX_BATCH_SIZE);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.clustering.startup_delay_secs, 30);
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optgrid.toml");
        std::fs::write(&path, "[clustering\nbatch_size = ").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
