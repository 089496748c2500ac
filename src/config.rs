//! Construction parameters for the batch executor.
//!
//! A [`BatchConfig`] is fixed once a [`BatchExecutor`](crate::BatchExecutor)
//! is built from it. It can be assembled with builders, read from the
//! environment, or taken from a JSON provider configuration block.
//!
//! # Environment Variables
//!
//! - `ACCTEST_BATCH_CAPACITY`: maximum concurrently admitted callers
//! - `ACCTEST_BATCH_COOLDOWN_SECS`: pause after a batch drains with callers waiting
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use provider_acctest_gate::BatchConfig;
//!
//! let config = BatchConfig::new()
//!     .with_capacity(2)
//!     .with_cooldown(Duration::from_secs(30));
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::GateError;

/// Default number of concurrently admitted callers.
pub const DEFAULT_CAPACITY: usize = 3;

/// Default pause applied when a batch drains while callers are waiting.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(120);

/// Environment variable overriding the batch capacity.
pub const CAPACITY_ENV: &str = "ACCTEST_BATCH_CAPACITY";

/// Environment variable overriding the cooldown, in whole seconds.
pub const COOLDOWN_ENV: &str = "ACCTEST_BATCH_COOLDOWN_SECS";

/// Parameters a [`BatchExecutor`](crate::BatchExecutor) is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Maximum number of callers admitted at the same time.
    /// Default: 3.
    pub capacity: usize,
    /// Pause taken by the caller whose release drains the batch while
    /// others are waiting.
    /// Default: 120 seconds.
    pub cooldown: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Wire shape of the JSON configuration block.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBatchConfig {
    #[serde(default)]
    capacity: Option<usize>,
    #[serde(default)]
    cooldown_secs: Option<u64>,
}

impl BatchConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of concurrently admitted callers.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the drain cooldown.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Check that the configuration can admit anyone at all.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.capacity == 0 {
            return Err(GateError::Configuration(
                "capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a configuration from the process environment.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, GateError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from a JSON object such as
    /// `{"capacity": 2, "cooldown_secs": 60}`. Both keys are optional;
    /// `null` is treated like an empty object.
    pub fn from_json(value: serde_json::Value) -> Result<Self, GateError> {
        let raw: RawBatchConfig = if value.is_null() {
            RawBatchConfig::default()
        } else {
            serde_json::from_value(value)?
        };

        let mut config = Self::default();
        if let Some(capacity) = raw.capacity {
            config.capacity = capacity;
        }
        if let Some(secs) = raw.cooldown_secs {
            config.cooldown = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, GateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(CAPACITY_ENV) {
            let capacity = parse_number(CAPACITY_ENV, &raw)?;
            config.capacity = usize::try_from(capacity).map_err(|_| {
                GateError::Configuration(format!(
                    "{} is too large for this platform: {}",
                    CAPACITY_ENV, capacity
                ))
            })?;
        }
        if let Some(raw) = lookup(COOLDOWN_ENV) {
            config.cooldown = Duration::from_secs(parse_number(COOLDOWN_ENV, &raw)?);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_number(name: &str, raw: &str) -> Result<u64, GateError> {
    raw.trim().parse::<u64>().map_err(|e| {
        GateError::Configuration(format!(
            "{} must be a non-negative integer, got '{}': {}",
            name, raw, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.capacity, 3);
        assert_eq!(config.cooldown, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = BatchConfig::new()
            .with_capacity(5)
            .with_cooldown(Duration::from_millis(50));
        assert_eq!(config.capacity, 5);
        assert_eq!(config.cooldown, Duration::from_millis(50));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = BatchConfig::new().with_capacity(0).validate().unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)));
    }

    #[test]
    fn test_lookup_overrides() {
        let config =
            BatchConfig::from_lookup(lookup_from(&[(CAPACITY_ENV, "2"), (COOLDOWN_ENV, " 30 ")]))
                .unwrap();
        assert_eq!(config.capacity, 2);
        assert_eq!(config.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_lookup_unset_keeps_defaults() {
        let config = BatchConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, BatchConfig::default());
    }

    #[test]
    fn test_lookup_malformed() {
        let err = BatchConfig::from_lookup(lookup_from(&[(COOLDOWN_ENV, "soon")])).unwrap_err();
        assert!(err.message().contains(COOLDOWN_ENV));

        let err = BatchConfig::from_lookup(lookup_from(&[(CAPACITY_ENV, "0")])).unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)));
    }

    #[test]
    fn test_lookup_capacity_out_of_range() {
        let too_large = (u64::MAX as u128 + 1).to_string();
        let lookup = lookup_from(&[(CAPACITY_ENV, too_large.as_str())]);
        let err = BatchConfig::from_lookup(lookup).unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)));

        let max = u64::MAX.to_string();
        let result = BatchConfig::from_lookup(lookup_from(&[(CAPACITY_ENV, max.as_str())]));
        if usize::BITS < u64::BITS {
            let err = result.unwrap_err();
            assert!(err.message().contains("too large"));
        } else {
            assert_eq!(result.unwrap().capacity, usize::MAX);
        }
    }

    #[test]
    fn test_from_json() {
        let config = BatchConfig::from_json(json!({"capacity": 1, "cooldown_secs": 0})).unwrap();
        assert_eq!(config.capacity, 1);
        assert_eq!(config.cooldown, Duration::ZERO);

        let config = BatchConfig::from_json(json!({"capacity": 4})).unwrap();
        assert_eq!(config.cooldown, DEFAULT_COOLDOWN);

        let config = BatchConfig::from_json(serde_json::Value::Null).unwrap();
        assert_eq!(config, BatchConfig::default());
    }

    #[test]
    fn test_from_json_errors() {
        let err = BatchConfig::from_json(json!({"capacity": "three"})).unwrap_err();
        assert!(matches!(err, GateError::Serialization(_)));

        let err = BatchConfig::from_json(json!({"batch_size": 3})).unwrap_err();
        assert!(matches!(err, GateError::Serialization(_)));

        let err = BatchConfig::from_json(json!({"capacity": 0})).unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)));
    }
}
