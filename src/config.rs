//! Configuration
//!
//! Layered with the `config` crate, later layers win:
//!
//! 1. built-in defaults
//! 2. TOML file: explicit path, else `OPFLOW_CONFIG_PATH`, else `./opflow.toml` when present
//! 3. environment variables `OPFLOW__<SECTION>__<KEY>`, e.g. `OPFLOW__ENGINE__STEP_CAP_FACTOR=20`
//! 4. programmatic overrides from the builder
//!
//! ```toml
//! [engine]
//! step_cap_factor = 10
//! default_step_timeout_ms = 30000
//!
//! [event_bus]
//! history_capacity = 500
//!
//! [logging]
//! level = "debug"
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "OPFLOW_CONFIG_PATH";
pub const ENV_PREFIX: &str = "OPFLOW";
const DEFAULT_CONFIG_FILE: &str = "opflow.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// A run may execute at most `steps.len() * step_cap_factor` steps
    #[serde(default = "default_step_cap_factor")]
    pub step_cap_factor: usize,
    /// Timeout for steps that set none; 0 disables it
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,
    /// Backoff factor for steps that inherit the workflow retry settings
    #[serde(default = "default_backoff_factor")]
    pub default_backoff_factor: f64,
}

fn default_step_cap_factor() -> usize {
    10
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    1.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_cap_factor: default_step_cap_factor(),
            default_step_timeout_ms: default_step_timeout_ms(),
            default_backoff_factor: default_backoff_factor(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Events kept in the history ring buffer; 0 disables history
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_history_capacity() -> usize {
    100
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Upper bound on events processed by one cascade drain
    #[serde(default = "default_max_cascade_events")]
    pub max_cascade_events: usize,
}

fn default_max_cascade_events() -> usize {
    1000
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            max_cascade_events: default_max_cascade_events(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub with_target: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: false,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load with the default search (no explicit path, no `.env`)
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.step_cap_factor == 0 {
            bail!("engine.step_cap_factor must be at least 1");
        }
        Ok(())
    }
}

/* ===================== Builder ===================== */

#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    load_dotenv: bool,
    env_prefix: String,
    overrides: Vec<(String, String)>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            config_path: None,
            load_dotenv: false,
            env_prefix: ENV_PREFIX.to_string(),
            overrides: Vec::new(),
        }
    }
}

impl ConfigBuilder {
    /// Explicit config file; a missing explicit file is an error
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Read `.env` into the process environment before building
    pub fn load_dotenv(mut self, load: bool) -> Self {
        self.load_dotenv = load;
        self
    }

    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Override a dotted key such as `engine.step_cap_factor`
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    pub fn build(self) -> Result<Config> {
        if self.load_dotenv {
            if let Err(e) = dotenvy::dotenv() {
                tracing::debug!(error = %e, "no .env loaded");
            }
        }

        let defaults = config::Config::try_from(&Config::default())
            .context("Failed to serialize default configuration")?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some((path, required)) = self.resolve_file() {
            tracing::debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(
                config::File::from(path.as_path())
                    .format(config::FileFormat::Toml)
                    .required(required),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in &self.overrides {
            builder = builder
                .set_override(key.as_str(), value.as_str())
                .with_context(|| format!("Invalid override for '{}'", key))?;
        }

        let config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_file(&self) -> Option<(PathBuf, bool)> {
        if let Some(path) = &self.config_path {
            return Some((path.clone(), true));
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Some((PathBuf::from(path), true));
        }
        let fallback = Path::new(DEFAULT_CONFIG_FILE);
        fallback
            .exists()
            .then(|| (fallback.to_path_buf(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::builder().env_prefix("OPFLOW_TEST_DEFAULTS").build().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.engine.step_cap_factor, 10);
        assert_eq!(config.rules.max_cascade_events, 1000);
    }

    #[test]
    fn test_file_then_override() {
        let path = std::env::temp_dir().join(format!("opflow-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[engine]\nstep_cap_factor = 3\n\n[event_bus]\nhistory_capacity = 7\n\n[logging]\nlevel = \"debug\""
        )
        .unwrap();

        let config = Config::builder()
            .env_prefix("OPFLOW_TEST_FILE")
            .config_path(Some(path.clone()))
            .set("event_bus.history_capacity", "9")
            .build()
            .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.engine.step_cap_factor, 3);
        assert_eq!(config.engine.default_step_timeout_ms, 30_000);
        assert_eq!(config.event_bus.history_capacity, 9);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_environment_layer() {
        std::env::set_var("OPFLOW_TEST_ENV__RULES__MAX_CASCADE_EVENTS", "25");
        let config = Config::builder().env_prefix("OPFLOW_TEST_ENV").build().unwrap();
        std::env::remove_var("OPFLOW_TEST_ENV__RULES__MAX_CASCADE_EVENTS");

        assert_eq!(config.rules.max_cascade_events, 25);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = Config::builder()
            .env_prefix("OPFLOW_TEST_MISSING")
            .config_path(Some(PathBuf::from("/nonexistent/opflow.toml")))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_step_cap_factor_is_rejected() {
        let result = Config::builder()
            .env_prefix("OPFLOW_TEST_ZERO_CAP")
            .set("engine.step_cap_factor", "0")
            .build();
        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("step_cap_factor"));
    }
}
