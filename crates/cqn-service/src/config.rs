//! Configuration for the query service
//!
//! Loaded from a YAML file; environment variables always override the file.

use cqn_sql::{BooleanLiteral, CompileOptions, Dialect, QuotingStyle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid model: {0}")]
    Model(#[from] cqn_model::ModelError),

    #[error("Invalid value for {name}: {message}")]
    Invalid { name: String, message: String },

    #[error("No model path configured")]
    MissingModel,
}

/// SQL rendering
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    /// Preset: sqlite, postgres, hana
    pub dialect: Dialect,

    /// Overrides the preset's identifier quoting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quoting: Option<QuotingStyle>,

    /// Identifier delimiter used by the quoted styles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,

    /// Overrides the preset's boolean literals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boolean: Option<BooleanLiteral>,
}

impl SqlConfig {
    pub fn compile_options(&self) -> CompileOptions {
        let mut options = CompileOptions::for_dialect(self.dialect);
        if let Some(quoting) = self.quoting {
            options = options.with_quoting(quoting);
        }
        if let Some(delimiter) = &self.delimiter {
            options.delimiter = delimiter.clone();
        }
        if let Some(boolean) = self.boolean {
            options.boolean = boolean;
        }
        options
    }
}

/// Request translation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ODataConfig {
    /// Upper bound for the rows of one collection read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_page_size: Option<i64>,

    /// Rewrite multi-hop paths into `EXISTS` chains before compiling
    pub lower_navigation: bool,
}

impl Default for ODataConfig {
    fn default() -> Self {
        Self {
            max_page_size: None,
            lower_navigation: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Reflected model as JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stdout, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sql: SqlConfig,
    pub odata: ODataConfig,
    pub model: ModelConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(yaml)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(dialect) = std::env::var("CQN_SQL_DIALECT") {
            self.sql.dialect = dialect.parse().map_err(|message| invalid("CQN_SQL_DIALECT", message))?;
        }
        if let Ok(quoting) = std::env::var("CQN_SQL_QUOTING") {
            let quoting = quoting.parse().map_err(|message| invalid("CQN_SQL_QUOTING", message))?;
            self.sql.quoting = Some(quoting);
        }
        if let Ok(size) = std::env::var("CQN_MAX_PAGE_SIZE") {
            let size = size
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid("CQN_MAX_PAGE_SIZE", e.to_string()))?;
            self.odata.max_page_size = Some(size);
        }
        if let Ok(path) = std::env::var("CQN_MODEL_PATH") {
            self.model.path = Some(PathBuf::from(path));
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.directory = dir;
        }
        Ok(())
    }

    /// Set logging environment variables for the logging module
    pub fn apply_logging_env(&self) {
        std::env::set_var("RUST_LOG", &self.logging.level);
        std::env::set_var("LOG_FORMAT", &self.logging.format);
        std::env::set_var("LOG_OUTPUT", &self.logging.output);
        std::env::set_var("LOG_DIR", &self.logging.directory);
    }
}

fn invalid(name: &str, message: String) -> ConfigError {
    ConfigError::Invalid { name: name.to_string(), message }
}
