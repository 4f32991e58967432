use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::channels::ChannelBalancer;
use crate::orchestrator::OrchestratorConfig;
use crate::session::SessionSettings;
use crate::spawn::SpawnConfig;
use crate::teams::MapRules;
use crate::tick_loop::LoopConfig;

pub const CONFIG_ENV_VAR: &str = "SESSION_CONFIG";
pub const TICK_RATE_ENV_VAR: &str = "SESSION_TICK_RATE";
pub const STRICT_ENV_VAR: &str = "SESSION_STRICT";
pub const CATALOG_ENV_VAR: &str = "SESSION_CATALOG";

/// Channel ids are `u16`.
pub const MAX_CHANNEL_COUNT: u32 = u16::MAX as u32 + 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path} at {location}: {message}")]
    Parse {
        path: PathBuf,
        location: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub tick_rate_hz: u32,
    pub max_ticks_per_step: u32,
    pub max_step_delta_ms: u64,
    pub metrics_log_interval_ms: u64,
    pub channel_count: u32,
    pub channel_capacity: u32,
    pub spawn_timeout_secs: f64,
    pub spawn_point_wait_secs: f64,
    pub load_stall_timeout_secs: f64,
    pub load_retry_limit: u32,
    pub backend_retry_limit: u32,
    pub max_players_for_map: u32,
    pub possible_team_count: u32,
    pub strict_mode: bool,
    pub catalog_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 30,
            max_ticks_per_step: 5,
            max_step_delta_ms: 250,
            metrics_log_interval_ms: 1000,
            channel_count: 4,
            channel_capacity: 15,
            spawn_timeout_secs: 10.0,
            spawn_point_wait_secs: 5.0,
            load_stall_timeout_secs: 30.0,
            load_retry_limit: 1,
            backend_retry_limit: 1,
            max_players_for_map: 16,
            possible_team_count: 2,
            strict_mode: false,
            catalog_path: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut deserializer = serde_json::Deserializer::from_str(raw);
        let config = serde_path_to_error::deserialize::<_, SessionConfig>(&mut deserializer)
            .map_err(|error| {
                let location = error.path().to_string();
                ConfigError::Parse {
                    path: origin.to_path_buf(),
                    location,
                    message: error.into_inner().to_string(),
                }
            })?;
        Ok(config.normalized())
    }

    pub fn load_json(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw, path)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load_with(|var| std::env::var(var).ok())
    }

    /// File named by `SESSION_CONFIG` (if any), then per-field overrides.
    pub fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_ENV_VAR) {
            Some(path) if !path.trim().is_empty() => Self::load_json(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_overrides(&lookup);
        Ok(config.normalized())
    }

    pub fn apply_overrides<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(TICK_RATE_ENV_VAR) {
            match value.trim().parse::<u32>() {
                Ok(rate) => self.tick_rate_hz = rate,
                Err(_) => warn!(
                    env_var = TICK_RATE_ENV_VAR,
                    value = value.as_str(),
                    "invalid tick rate override; keeping configured value"
                ),
            }
        }
        if let Some(value) = lookup(STRICT_ENV_VAR) {
            match parse_flag(&value) {
                Some(strict) => self.strict_mode = strict,
                None => warn!(
                    env_var = STRICT_ENV_VAR,
                    value = value.as_str(),
                    "invalid strict mode override; keeping configured value"
                ),
            }
        }
        if let Some(value) = lookup(CATALOG_ENV_VAR) {
            if !value.trim().is_empty() {
                self.catalog_path = Some(PathBuf::from(value.trim()));
            }
        }
    }

    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.tick_rate_hz == 0 {
            self.tick_rate_hz = defaults.tick_rate_hz;
        }
        if self.max_ticks_per_step == 0 {
            self.max_ticks_per_step = defaults.max_ticks_per_step;
        }
        if self.max_step_delta_ms == 0 {
            self.max_step_delta_ms = defaults.max_step_delta_ms;
        }
        if self.metrics_log_interval_ms == 0 {
            self.metrics_log_interval_ms = defaults.metrics_log_interval_ms;
        }
        if self.channel_count == 0 {
            self.channel_count = defaults.channel_count;
        }
        self.channel_count = self.channel_count.min(MAX_CHANNEL_COUNT);
        if self.channel_capacity == 0 {
            self.channel_capacity = defaults.channel_capacity;
        }
        self.spawn_timeout_secs = positive_or(self.spawn_timeout_secs, defaults.spawn_timeout_secs);
        self.spawn_point_wait_secs =
            positive_or(self.spawn_point_wait_secs, defaults.spawn_point_wait_secs);
        self.load_stall_timeout_secs =
            positive_or(self.load_stall_timeout_secs, defaults.load_stall_timeout_secs);
        if self.possible_team_count == 0 {
            self.possible_team_count = defaults.possible_team_count;
        }
        self
    }

    pub fn map_rules(&self) -> MapRules {
        MapRules {
            max_players_for_map: self.max_players_for_map,
            possible_team_count: self.possible_team_count,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            stall_timeout: Duration::from_secs_f64(self.load_stall_timeout_secs),
            retry_limit: self.load_retry_limit,
        }
    }

    pub fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            timeout: Duration::from_secs_f64(self.spawn_timeout_secs),
            spawn_point_wait: Duration::from_secs_f64(self.spawn_point_wait_secs),
        }
    }

    pub fn balancer(&self) -> ChannelBalancer {
        ChannelBalancer::new(self.channel_capacity, self.strict_mode)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            channel_count: self.channel_count as usize,
            balancer: self.balancer(),
            rules: self.map_rules(),
            orchestrator: self.orchestrator_config(),
            spawn: self.spawn_config(),
            backend_retry_limit: self.backend_retry_limit,
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            tick_rate_hz: self.tick_rate_hz,
            max_ticks_per_step: self.max_ticks_per_step,
            max_step_delta: Duration::from_millis(self.max_step_delta_ms),
            metrics_log_interval: Duration::from_millis(self.metrics_log_interval_ms),
            ..LoopConfig::default()
        }
    }
}

fn positive_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SessionConfig::default();
        assert_eq!(config.channel_capacity, 15);
        assert_eq!(config.spawn_config(), SpawnConfig::default());
        assert_eq!(config.map_rules(), MapRules::default());
        assert_eq!(config.orchestrator_config(), OrchestratorConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("session.json");
        fs::write(&path, r#"{"channel_count": 2, "strict_mode": true}"#).expect("write");
        let config = SessionConfig::load_json(&path).expect("config");
        assert_eq!(config.channel_count, 2);
        assert!(config.strict_mode);
        assert_eq!(config.tick_rate_hz, 30);
    }

    #[test]
    fn parse_error_names_the_field() {
        let error = SessionConfig::from_json_str(
            r#"{"spawn_timeout_secs": "soon"}"#,
            Path::new("inline.json"),
        )
        .expect_err("bad type");
        match error {
            ConfigError::Parse { location, .. } => assert_eq!(location, "spawn_timeout_secs"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn env_overrides_apply_over_file() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("session.json");
        fs::write(&path, r#"{"tick_rate_hz": 20}"#).expect("write");
        let path_str = path.to_string_lossy().to_string();
        let lookup = lookup_from(&[
            (CONFIG_ENV_VAR, path_str.as_str()),
            (TICK_RATE_ENV_VAR, "60"),
            (STRICT_ENV_VAR, "yes"),
            (CATALOG_ENV_VAR, "assets/catalog.json"),
        ]);
        let config = SessionConfig::load_with(lookup).expect("config");
        assert_eq!(config.tick_rate_hz, 60);
        assert!(config.strict_mode);
        assert_eq!(
            config.catalog_path,
            Some(PathBuf::from("assets/catalog.json"))
        );
    }

    #[test]
    fn invalid_override_keeps_configured_value() {
        let config =
            SessionConfig::load_with(lookup_from(&[(TICK_RATE_ENV_VAR, "fast")])).expect("config");
        assert_eq!(config.tick_rate_hz, 30);
    }

    #[test]
    fn non_positive_values_are_normalized() {
        let config = SessionConfig {
            tick_rate_hz: 0,
            spawn_timeout_secs: -1.0,
            load_stall_timeout_secs: f64::NAN,
            channel_count: 0,
            ..SessionConfig::default()
        }
        .normalized();
        assert_eq!(config.tick_rate_hz, 30);
        assert_eq!(config.spawn_timeout_secs, 10.0);
        assert_eq!(config.load_stall_timeout_secs, 30.0);
        assert_eq!(config.channel_count, 4);
    }

    #[test]
    fn channel_count_is_capped_to_the_id_range() {
        let config = SessionConfig {
            channel_count: u32::MAX,
            ..SessionConfig::default()
        }
        .normalized();
        assert_eq!(config.channel_count, 65_536);
        assert_eq!(config.session_settings().channel_count, 65_536);
    }
}
