use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

// ── ChatConfig ──────────────────────────────────────────────────────────────

/// Tunables of one chat node. Every field has a default, so a config file
/// only needs the keys it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatConfig {
    /// Per-attempt budget for reaching the host and receiving `ROOM_STATE`.
    pub connect_timeout_ms: u64,
    /// Additional attempts after the first one.
    pub max_join_retries: u32,
    /// Delay before retrying after a transport error.
    pub retry_delay_ms: u64,
    /// Multiplier applied to the retry delay after each error.
    pub retry_backoff: f64,
    pub keep_alive_interval_ms: u64,
    /// Links silent for longer than this are reaped.
    pub idle_timeout_ms: u64,
    pub reap_interval_ms: u64,
    pub min_room_id_length: usize,
    /// Delay between a successful `start` and resuming a join stashed before it.
    pub resume_join_delay_ms: u64,
    /// Base of shareable room links.
    pub share_origin: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            max_join_retries: 2,
            retry_delay_ms: 2_000,
            retry_backoff: 1.5,
            keep_alive_interval_ms: 60_000,
            idle_timeout_ms: 300_000,
            reap_interval_ms: 60_000,
            min_room_id_length: 5,
            resume_join_delay_ms: 0,
            share_origin: "http://localhost:5173/".to_string(),
        }
    }
}

impl ChatConfig {
    /// Defaults, then `path` if it exists, then `ROOMLINK_*` env overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            log::debug!("Loading config from {}", path.display());
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            log::debug!("Config {} not found, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any `name → value` source. Values that do not
    /// parse or fall outside their range are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = read_u64(&lookup, "ROOMLINK_CONNECT_TIMEOUT_MS", 1, 600_000) {
            self.connect_timeout_ms = v;
        }
        if let Some(v) = read_u64(&lookup, "ROOMLINK_MAX_JOIN_RETRIES", 0, 10) {
            self.max_join_retries = v as u32;
        }
        if let Some(v) = read_u64(&lookup, "ROOMLINK_KEEP_ALIVE_INTERVAL_MS", 1_000, 3_600_000) {
            self.keep_alive_interval_ms = v;
        }
        if let Some(v) = read_u64(&lookup, "ROOMLINK_IDLE_TIMEOUT_MS", 1_000, 86_400_000) {
            self.idle_timeout_ms = v;
        }
        if let Some(v) = lookup("ROOMLINK_SHARE_ORIGIN").filter(|v| !v.is_empty()) {
            self.share_origin = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "connectTimeoutMs must be positive".into(),
            ));
        }
        if self.retry_delay_ms > self.connect_timeout_ms {
            return Err(ConfigError::InvalidValue(format!(
                "retryDelayMs ({}) exceeds connectTimeoutMs ({})",
                self.retry_delay_ms, self.connect_timeout_ms
            )));
        }
        if self.retry_backoff.is_nan() || self.retry_backoff < 1.0 {
            return Err(ConfigError::InvalidValue(
                "retryBackoff must be at least 1.0".into(),
            ));
        }
        if self.keep_alive_interval_ms == 0 || self.reap_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "timer intervals must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn resume_join_delay(&self) -> Duration {
        Duration::from_millis(self.resume_join_delay_ms)
    }
}

fn read_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    min: u64,
    max: u64,
) -> Option<u64> {
    let val = lookup(name)?;
    let parsed = val
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|v| (min..=max).contains(v));
    if parsed.is_none() {
        log::warn!("Invalid value {val:?} for {name}, ignoring");
    }
    parsed
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ChatConfig::default();
        config.validate().unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
        assert_eq!(config.max_join_retries, 2);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roomlink.json");
        std::fs::write(&path, r#"{"connectTimeoutMs": 5000, "shareOrigin": "https://chat.example/"}"#)
            .unwrap();

        let config = ChatConfig::load(&path).unwrap();
        assert_eq!(config.connect_timeout_ms, 5000);
        assert_eq!(config.share_origin, "https://chat.example/");
        assert_eq!(config.keep_alive_interval_ms, 60_000);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.retry_delay_ms, ChatConfig::default().retry_delay_ms);
    }

    #[test]
    fn test_bad_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roomlink.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(ChatConfig::load(&path), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ChatConfig::default();
        config.apply_overrides(env(&[
            ("ROOMLINK_CONNECT_TIMEOUT_MS", "20000"),
            ("ROOMLINK_MAX_JOIN_RETRIES", "3"),
            ("ROOMLINK_SHARE_ORIGIN", "https://rooms.example/"),
        ]));
        assert_eq!(config.connect_timeout_ms, 20_000);
        assert_eq!(config.max_join_retries, 3);
        assert_eq!(config.share_origin, "https://rooms.example/");
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let mut config = ChatConfig::default();
        config.apply_overrides(env(&[
            ("ROOMLINK_CONNECT_TIMEOUT_MS", "soon"),
            ("ROOMLINK_MAX_JOIN_RETRIES", "99"),
        ]));
        assert_eq!(config, ChatConfig::default());
    }

    #[test]
    fn test_validate_rejects_long_retry_delay() {
        let config = ChatConfig {
            connect_timeout_ms: 1_000,
            retry_delay_ms: 2_000,
            ..ChatConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        let config = ChatConfig {
            connect_timeout_ms: 0,
            ..ChatConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        for backoff in [0.5, f64::NAN] {
            let config = ChatConfig {
                retry_backoff: backoff,
                ..ChatConfig::default()
            };
            assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
        }
        let config = ChatConfig {
            retry_backoff: 1.0,
            ..ChatConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
