use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::selector::process::ReviewIntervals;
use crate::selector::rules::RuleConfig;

const ENV_PREFIX: &str = "SELECTOR_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub metrics_port: u16,
    pub log_dir: Option<String>,
    pub target_active: usize,
    pub base_testing: usize,
    pub replacement_min_improvement_pct: f64,
    pub replacement_min_improvement_points: f64,
    pub review_interval_changed_minutes: i64,
    pub review_interval_unchanged_minutes: i64,
    pub backoff_initial_seconds: u64,
    pub backoff_max_seconds: u64,
    pub review_batch_size: i64,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialSelectorConfig {
    database_url: Option<String>,
    max_connections: Option<u32>,
    metrics_port: Option<u16>,
    log_dir: Option<String>,
    target_active: Option<usize>,
    base_testing: Option<usize>,
    replacement_min_improvement_pct: Option<f64>,
    replacement_min_improvement_points: Option<f64>,
    review_interval_changed_minutes: Option<i64>,
    review_interval_unchanged_minutes: Option<i64>,
    backoff_initial_seconds: Option<u64>,
    backoff_max_seconds: Option<u64>,
    review_batch_size: Option<i64>,
}

fn read_file_layer(config_path: Option<&str>) -> Result<PartialSelectorConfig, ConfigError> {
    let Some(path_str) = config_path else {
        return Ok(PartialSelectorConfig::default());
    };
    let path = Path::new(path_str);
    if !path.exists() {
        return Ok(PartialSelectorConfig::default());
    }

    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path_str.to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path_str.to_string(),
        source,
    })
}

impl SelectorConfig {
    /// Loads the configuration: defaults, then the optional TOML file, then
    /// `SELECTOR_*` environment variables.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::load_from(config_path, std::env::vars())
    }

    pub fn load_from<I>(config_path: Option<&str>, env: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let env: Vec<(String, String)> = env.into_iter().collect();

        // 1. Load from file (optional)
        let file_config = read_file_layer(config_path)?;

        // 2. Load from environment variables
        let env_config: PartialSelectorConfig =
            envy::prefixed(ENV_PREFIX).from_iter(env.iter().cloned())?;
        let plain_database_url = env
            .iter()
            .find(|(key, _)| key == "DATABASE_URL")
            .map(|(_, value)| value.clone());

        // 3. Merge: environment overrides file
        let rules = RuleConfig::default();
        let intervals = ReviewIntervals::default();
        let config = SelectorConfig {
            database_url: env_config
                .database_url
                .or(plain_database_url)
                .or(file_config.database_url)
                .ok_or(ConfigError::Missing("DATABASE_URL"))?,
            max_connections: env_config
                .max_connections
                .or(file_config.max_connections)
                .unwrap_or(5),
            metrics_port: env_config
                .metrics_port
                .or(file_config.metrics_port)
                .unwrap_or(9000),
            log_dir: env_config.log_dir.or(file_config.log_dir),
            target_active: env_config
                .target_active
                .or(file_config.target_active)
                .unwrap_or(rules.target_active),
            base_testing: env_config
                .base_testing
                .or(file_config.base_testing)
                .unwrap_or(rules.base_testing),
            replacement_min_improvement_pct: env_config
                .replacement_min_improvement_pct
                .or(file_config.replacement_min_improvement_pct)
                .unwrap_or(rules.replacement_min_improvement_pct),
            replacement_min_improvement_points: env_config
                .replacement_min_improvement_points
                .or(file_config.replacement_min_improvement_points)
                .unwrap_or(rules.replacement_min_improvement_points),
            review_interval_changed_minutes: env_config
                .review_interval_changed_minutes
                .or(file_config.review_interval_changed_minutes)
                .unwrap_or(intervals.changed.num_minutes()),
            review_interval_unchanged_minutes: env_config
                .review_interval_unchanged_minutes
                .or(file_config.review_interval_unchanged_minutes)
                .unwrap_or(intervals.unchanged.num_minutes()),
            backoff_initial_seconds: env_config
                .backoff_initial_seconds
                .or(file_config.backoff_initial_seconds)
                .unwrap_or(3),
            backoff_max_seconds: env_config
                .backoff_max_seconds
                .or(file_config.backoff_max_seconds)
                .unwrap_or(60),
            review_batch_size: env_config
                .review_batch_size
                .or(file_config.review_batch_size)
                .unwrap_or(10),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_active == 0 {
            return Err(ConfigError::Invalid("target_active must be at least 1".into()));
        }
        if self.replacement_min_improvement_pct <= 0.0
            || self.replacement_min_improvement_points <= 0.0
        {
            return Err(ConfigError::Invalid(
                "replacement thresholds must be positive".into(),
            ));
        }
        if self.review_interval_changed_minutes <= 0 || self.review_interval_unchanged_minutes <= 0
        {
            return Err(ConfigError::Invalid("review intervals must be positive".into()));
        }
        if self.backoff_initial_seconds == 0 || self.backoff_initial_seconds > self.backoff_max_seconds {
            return Err(ConfigError::Invalid(format!(
                "backoff_initial_seconds ({}) must be between 1 and backoff_max_seconds ({})",
                self.backoff_initial_seconds, self.backoff_max_seconds
            )));
        }
        if self.review_batch_size <= 0 || self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "review_batch_size and max_connections must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn rule_config(&self) -> RuleConfig {
        RuleConfig {
            target_active: self.target_active,
            base_testing: self.base_testing,
            replacement_min_improvement_pct: self.replacement_min_improvement_pct,
            replacement_min_improvement_points: self.replacement_min_improvement_points,
        }
    }

    pub fn review_intervals(&self) -> ReviewIntervals {
        ReviewIntervals {
            changed: chrono::Duration::minutes(self.review_interval_changed_minutes),
            unchanged: chrono::Duration::minutes(self.review_interval_unchanged_minutes),
        }
    }
}
