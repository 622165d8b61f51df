use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use runtime::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Tunables for the chunk pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Maximum concurrent fetches.
    pub max_inflight: u32,

    /// Maximum queued (not yet admitted) chunks; new requests beyond this
    /// are rejected.
    pub max_queued: usize,

    /// Total fetch attempts per chunk, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Budget for decoded chunks held in system memory.
    pub system_memory_bytes: usize,

    /// Buffer of each live event subscriber.
    pub event_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_inflight: 32,
            max_queued: 4096,
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            system_memory_bytes: 512 * 1024 * 1024,
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("environment variable {var} has unparseable value {value:?}")]
    Env { var: &'static str, value: String },
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Json(#[from] serde_json::Error),
}

impl StreamingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |field: &'static str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    field,
                    reason: "greater than zero",
                })
            }
        };
        positive("max_inflight", self.max_inflight > 0)?;
        positive("max_queued", self.max_queued > 0)?;
        positive("max_attempts", self.max_attempts > 0)?;
        positive("event_capacity", self.event_capacity > 0)?;
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "base_delay_ms",
                reason: "at most max_delay_ms",
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Defaults overridden by `CHUNK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|var| std::env::var(var).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its
    /// value if set.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        override_from(&lookup, "CHUNK_MAX_INFLIGHT", &mut self.max_inflight)?;
        override_from(&lookup, "CHUNK_MAX_QUEUED", &mut self.max_queued)?;
        override_from(&lookup, "CHUNK_MAX_ATTEMPTS", &mut self.max_attempts)?;
        override_from(&lookup, "CHUNK_BASE_DELAY_MS", &mut self.base_delay_ms)?;
        override_from(&lookup, "CHUNK_MAX_DELAY_MS", &mut self.max_delay_ms)?;
        override_from(&lookup, "CHUNK_SYSTEM_MEMORY_BYTES", &mut self.system_memory_bytes)?;
        override_from(&lookup, "CHUNK_EVENT_CAPACITY", &mut self.event_capacity)?;
        self.validate()?;
        Ok(self)
    }
}

fn override_from<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(());
    };
    *slot = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{ConfigError, StreamingConfig};

    #[test]
    fn defaults_are_valid() {
        let config = StreamingConfig::default();
        config.validate().unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = StreamingConfig::from_json(r#"{ "max_inflight": 4 }"#).unwrap();
        assert_eq!(config.max_inflight, 4);
        assert_eq!(config.max_queued, StreamingConfig::default().max_queued);
    }

    #[test]
    fn zero_bounds_are_rejected() {
        let err = StreamingConfig::from_json(r#"{ "max_inflight": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_inflight", .. }));
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() {
        let vars: HashMap<&str, &str> =
            HashMap::from([("CHUNK_MAX_INFLIGHT", "3"), ("CHUNK_MAX_DELAY_MS", " 500 ")]);
        let config = StreamingConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_inflight, 3);
        assert_eq!(config.max_delay_ms, 500);

        let err = StreamingConfig::default()
            .with_overrides(|k| (k == "CHUNK_MAX_QUEUED").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "CHUNK_MAX_QUEUED", .. }));
    }
}
