//! Network configuration for a simulated nest network.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the request engine and the simulated links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// How long a single request attempt waits for its response.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Number of attempts before a request fails with a timeout.
    pub max_attempts: u32,

    /// Lower bound of the per-hop delivery delay.
    #[serde(with = "duration_ms")]
    pub latency_min: Duration,

    /// Upper bound of the per-hop delivery delay.
    #[serde(with = "duration_ms")]
    pub latency_max: Duration,

    /// Probability that a single hop (request or reply) is lost.
    pub loss_rate: f64,

    /// Capacity of each nest's inbox channel.
    pub inbox_capacity: usize,

    /// Re-broadcast interval for connection snapshots. `None` broadcasts once
    /// at startup only.
    #[serde(with = "option_duration_ms")]
    pub connections_interval: Option<Duration>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(250),
            max_attempts: 3,
            latency_min: Duration::from_millis(1),
            latency_max: Duration::from_millis(10),
            loss_rate: 0.0,
            inbox_capacity: 256,
            connections_interval: None,
        }
    }
}

impl NetworkConfig {
    /// A lossy profile, handy for exercising retries.
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Self::default()
        }
    }

    /// Check the config for values the engine cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !(0.0..1.0).contains(&self.loss_rate) {
            return Err(format!("loss_rate must be in [0, 1), got {}", self.loss_rate));
        }
        if self.latency_min > self.latency_max {
            return Err(format!(
                "latency_min ({:?}) exceeds latency_max ({:?})",
                self.latency_min, self.latency_max
            ));
        }
        if self.inbox_capacity == 0 {
            return Err("inbox_capacity must be at least 1".to_string());
        }
        Ok(())
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing
    /// or unusable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => match config.validate() {
                        Ok(()) => return config,
                        Err(e) => tracing::warn!("Invalid config file, using defaults: {e}"),
                    },
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match dur {
            Some(dur) => s.serialize_some(&(dur.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.loss_rate, 0.0);
        assert!(config.connections_interval.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let mut config = NetworkConfig::lossy(0.2);
        config.connections_interval = Some(Duration::from_millis(1500));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"request_timeout\":250"));
        let deserialized: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: NetworkConfig = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = NetworkConfig::default();
        config.max_attempts = 0;
        assert!(config.validate().is_err());

        let config = NetworkConfig::lossy(1.0);
        assert!(config.validate().is_err());

        let mut config = NetworkConfig::default();
        config.latency_min = Duration::from_millis(50);
        config.latency_max = Duration::from_millis(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("network.json");

        let mut original = NetworkConfig::default();
        original.max_attempts = 5;
        original.loss_rate = 0.1;
        original.save_to_file(&path).unwrap();

        let loaded = NetworkConfig::load_or_default(&path);
        assert_eq!(loaded.max_attempts, 5);
        assert_eq!(loaded.loss_rate, 0.1);
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = NetworkConfig::load_or_default(&dir.path().join("missing.json"));
        assert_eq!(config, NetworkConfig::default());
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(NetworkConfig::load_or_default(&path), NetworkConfig::default());
    }
}
