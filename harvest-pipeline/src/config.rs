//! Runtime configuration for harvest-pipeline
//!
//! Resolves every pipeline setting with ENV → TOML → compiled default
//! priority and validates the result once, at startup.

use harvest_common::config::TomlConfig;
use harvest_common::{Error, Result};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::TrackedEntity;

/// Default minimum distinct new snapshot days before retraining
pub const DEFAULT_MIN_NEW_DAYS: u32 = 7;

/// Default absolute quality improvement required for promotion
pub const DEFAULT_IMPROVEMENT_THRESHOLD: f64 = 0.01;

pub const DEFAULT_METRICS_BASE_URL: &str = "https://fncreate.gg";

pub const ENV_METRICS_BASE_URL: &str = "HARVEST_METRICS_BASE_URL";
pub const ENV_MIN_NEW_DAYS: &str = "HARVEST_MIN_NEW_DAYS";
pub const ENV_IMPROVEMENT_THRESHOLD: &str = "HARVEST_IMPROVEMENT_THRESHOLD";
pub const ENV_TRAINER_COMMAND: &str = "HARVEST_TRAINER_COMMAND";

/// Fully resolved pipeline settings
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub min_new_days: u32,
    pub improvement_threshold: f64,
    pub fetch_timeout: Duration,
    pub fetch_concurrency: usize,
    pub requests_per_second: u32,
    pub lease_stale_after: Duration,
    pub lease_wait: Duration,
    pub training_timeout: Duration,
    pub min_training_snapshots: usize,
    pub metrics_base_url: String,
    pub trainer_command: Vec<String>,
    /// Entities listed in the config file (enabled and disabled)
    pub entities: Vec<TrackedEntity>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_new_days: DEFAULT_MIN_NEW_DAYS,
            improvement_threshold: DEFAULT_IMPROVEMENT_THRESHOLD,
            fetch_timeout: Duration::from_secs(30),
            fetch_concurrency: 4,
            requests_per_second: 2,
            lease_stale_after: Duration::from_secs(6 * 60 * 60),
            lease_wait: Duration::ZERO,
            training_timeout: Duration::from_secs(60 * 60),
            min_training_snapshots: 50,
            metrics_base_url: DEFAULT_METRICS_BASE_URL.to_string(),
            trainer_command: Vec::new(),
            entities: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Resolve from the TOML file and the process environment
    pub fn resolve(toml_config: &TomlConfig) -> Result<Self> {
        let defaults = Self::default();
        let section = &toml_config.pipeline;

        let min_new_days = match env_parse::<u32>(ENV_MIN_NEW_DAYS)? {
            Some(v) => v,
            None => section.min_new_days.unwrap_or(defaults.min_new_days),
        };

        let improvement_threshold = match env_parse::<f64>(ENV_IMPROVEMENT_THRESHOLD)? {
            Some(v) => v,
            None => section
                .improvement_threshold
                .unwrap_or(defaults.improvement_threshold),
        };

        let metrics_base_url = match std::env::var(ENV_METRICS_BASE_URL) {
            Ok(url) if !url.trim().is_empty() => {
                info!("Metrics base URL loaded from environment variable");
                url.trim().to_string()
            }
            _ => section
                .metrics_base_url
                .clone()
                .unwrap_or(defaults.metrics_base_url),
        };

        let trainer_command = match std::env::var(ENV_TRAINER_COMMAND) {
            Ok(cmd) if !cmd.trim().is_empty() => {
                cmd.split_whitespace().map(str::to_string).collect()
            }
            _ => toml_config.trainer.command.clone(),
        };

        let entities = toml_config
            .entities
            .iter()
            .map(|e| TrackedEntity {
                entity_id: e.id.trim().to_string(),
                enabled: e.enabled,
            })
            .filter(|e| !e.entity_id.is_empty())
            .collect();

        let config = Self {
            min_new_days,
            improvement_threshold,
            fetch_timeout: secs_or(section.fetch_timeout_secs, defaults.fetch_timeout),
            fetch_concurrency: section
                .fetch_concurrency
                .unwrap_or(defaults.fetch_concurrency),
            requests_per_second: section
                .requests_per_second
                .unwrap_or(defaults.requests_per_second),
            lease_stale_after: secs_or(section.lease_stale_secs, defaults.lease_stale_after),
            lease_wait: section
                .lease_wait_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_wait),
            training_timeout: secs_or(section.training_timeout_secs, defaults.training_timeout),
            min_training_snapshots: section
                .min_training_snapshots
                .unwrap_or(defaults.min_training_snapshots),
            metrics_base_url,
            trainer_command,
            entities,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.improvement_threshold.is_finite() || self.improvement_threshold < 0.0 {
            return Err(Error::Config(format!(
                "improvement_threshold must be a finite value >= 0, got {}",
                self.improvement_threshold
            )));
        }
        if self.fetch_concurrency == 0 {
            return Err(Error::Config("fetch_concurrency must be at least 1".to_string()));
        }
        if self.requests_per_second == 0 {
            return Err(Error::Config("requests_per_second must be at least 1".to_string()));
        }
        for (name, value) in [
            ("fetch_timeout_secs", self.fetch_timeout),
            ("lease_stale_secs", self.lease_stale_after),
            ("training_timeout_secs", self.training_timeout),
        ] {
            if value < Duration::from_secs(1) {
                return Err(Error::Config(format!("{} must be at least 1", name)));
            }
        }
        // Training must finish before its lease can be judged stale
        if self.lease_stale_after <= self.training_timeout {
            return Err(Error::Config(format!(
                "lease_stale_secs ({}) must exceed training_timeout_secs ({})",
                self.lease_stale_after.as_secs(),
                self.training_timeout.as_secs()
            )));
        }
        if self.metrics_base_url.trim().is_empty() {
            return Err(Error::Config("metrics_base_url must not be empty".to_string()));
        }
        if self.trainer_command.is_empty() {
            warn!("No trainer command configured; weekly runs will fail at TRAINING");
        }
        Ok(())
    }

    /// Entity ids explicitly disabled in the config file
    pub fn disabled_entities(&self) -> BTreeSet<String> {
        self.entities
            .iter()
            .filter(|e| !e.enabled)
            .map(|e| e.entity_id.clone())
            .collect()
    }
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}='{}' is invalid: {}", name, raw, e))),
        _ => Ok(None),
    }
}
