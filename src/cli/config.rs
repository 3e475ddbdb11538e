// ABOUTME: Configuration management for the trailhead CLI
// ABOUTME: Loads settings from a YAML file and applies environment variable overrides

use anyhow::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::definition::Value;
use crate::engine::EngineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,

    /// Directory for snapshots when `--snapshot` is not given.
    pub snapshot_dir: Option<PathBuf>,

    /// How long an idle workflow waits for a stimulus before the CLI stops.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Complete every external call with its own request as the answer.
    pub complete_operations: bool,

    /// Work items a single pulse may run before the workflow is aborted.
    pub max_pulse_items: usize,

    /// Inputs passed to every workflow; `--var` values take precedence.
    pub inputs: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            snapshot_dir: None,
            idle_timeout: Duration::from_secs(1),
            complete_operations: false,
            max_pulse_items: EngineConfig::default().max_pulse_items,
            inputs: IndexMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file path or default locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => Self::find_config_file(),
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            serde_yaml::from_str(&contents)?
        } else {
            Config::default()
        };
        config.merge_env()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> PathBuf {
        let possible_paths = [
            PathBuf::from("trailhead.yaml"),
            PathBuf::from("trailhead.yml"),
            PathBuf::from(".trailhead.yaml"),
            PathBuf::from(".trailhead.yml"),
        ];

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".trailhead").join("config.yaml");
            if home_config.exists() {
                return home_config;
            }
        }

        for path in possible_paths {
            if path.exists() {
                return path;
            }
        }

        PathBuf::from("trailhead.yaml")
    }

    /// Merge environment variables into configuration
    fn merge_env(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("TRAILHEAD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TRAILHEAD_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(dir) = std::env::var("TRAILHEAD_SNAPSHOT_DIR") {
            self.snapshot_dir = Some(PathBuf::from(dir));
        }
        if let Ok(timeout) = std::env::var("TRAILHEAD_IDLE_TIMEOUT") {
            self.idle_timeout = humantime_serde::re::humantime::parse_duration(&timeout)
                .map_err(|e| anyhow::anyhow!("Invalid TRAILHEAD_IDLE_TIMEOUT '{}': {}", timeout, e))?;
        }
        Ok(())
    }

    /// Merge command line inputs over the configured defaults.
    pub fn merge_inputs(&mut self, inputs: IndexMap<String, Value>) {
        self.inputs.extend(inputs);
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            idle_timeout: self.idle_timeout,
            max_pulse_items: self.max_pulse_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.idle_timeout, Duration::from_secs(1));
        assert!(!config.complete_operations);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("trailhead.yaml");
        fs::write(
            &config_path,
            r#"
idle_timeout: 250ms
complete_operations: true
logging:
  level: debug
  format: compact
inputs:
  region: eu
"#,
        )
        .unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.idle_timeout, Duration::from_millis(250));
        assert!(config.complete_operations);
        assert_eq!(config.logging.format, "compact");
        assert_eq!(config.inputs.get("region"), Some(&json!("eu")));
        assert_eq!(config.engine_config().idle_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let config = Config::load(Some(temp_dir.path().join("absent.yaml"))).unwrap();
        assert_eq!(config.max_pulse_items, EngineConfig::default().max_pulse_items);
    }

    #[test]
    fn test_cli_inputs_override_config() {
        let mut config = Config::default();
        config.inputs.insert("a".to_string(), json!(1));
        let mut overrides = IndexMap::new();
        overrides.insert("a".to_string(), json!(2));
        config.merge_inputs(overrides);
        assert_eq!(config.inputs.get("a"), Some(&json!(2)));
    }
}
