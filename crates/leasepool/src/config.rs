//! Manager configuration.
//!
//! Every knob has a default: a pool of two to eight tokens, most recently
//! released token handed out first, a short grace period for the first
//! acknowledgement of a lease and exponential creation backoff.
//!
//! Deployments can override the defaults from the environment:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `LEASEPOOL_MIN` | lower bound of the pool size range |
//! | `LEASEPOOL_MAX` | upper bound, `inf`/`unbounded` for none |
//! | `LEASEPOOL_STRATEGY` | `lifo` or `fifo` |
//! | `LEASEPOOL_FIRST_ACK_TIMEOUT_MS` | grace period before the first acknowledgement, `0` = never expires |
//! | `LEASEPOOL_ACK_TIMEOUT_MS` | period between later acknowledgements, `0` = never expires |
//! | `LEASEPOOL_BACKOFF_BASE_MS` | creation retry backoff base |
//! | `LEASEPOOL_BACKOFF_MAX_MS` | creation retry backoff cap |

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::policy::{BackoffPolicy, ExponentialBackoff, LeaseTimeoutPolicy, TwoTierTimeout};
use crate::storage::StorageStrategy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid pool size range: min {min} exceeds max {max}")]
    InvalidRange { min: usize, max: usize },
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Inclusive `[min, max]` bound on the number of tokens the manager holds,
/// counting both pooled and leased tokens. `max` of `None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSizeRange {
    min: usize,
    max: Option<usize>,
}

impl PoolSizeRange {
    pub fn new(min: usize, max: usize) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvalidRange { min, max });
        }
        Ok(Self {
            min,
            max: Some(max),
        })
    }

    /// Range with no upper bound.
    pub fn at_least(min: usize) -> Self {
        Self { min, max: None }
    }

    pub fn exactly(size: usize) -> Self {
        Self {
            min: size,
            max: Some(size),
        }
    }

    /// The `[0, 0]` range. A manager configured with it never creates a
    /// token and never grants a lease.
    pub fn disabled() -> Self {
        Self::exactly(0)
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> Option<usize> {
        self.max
    }

    pub fn is_disabled(&self) -> bool {
        self.min == 0 && self.max == Some(0)
    }

    /// True if `count` tokens leave room for at least one more.
    pub fn below_max(&self, count: usize) -> bool {
        self.max.is_none_or(|max| count < max)
    }
}

impl Default for PoolSizeRange {
    fn default() -> Self {
        Self {
            min: 2,
            max: Some(8),
        }
    }
}

impl std::fmt::Display for PoolSizeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.max {
            Some(max) => write!(f, "[{}, {}]", self.min, max),
            None => write!(f, "[{}, inf]", self.min),
        }
    }
}

/// Configuration for a pool manager, supplied once at spawn time.
#[derive(Clone)]
pub struct ManagerConfig {
    pub range: PoolSizeRange,
    pub strategy: StorageStrategy,
    pub lease_timeout: Arc<dyn LeaseTimeoutPolicy>,
    pub backoff: Arc<dyn BackoffPolicy>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            range: PoolSizeRange::default(),
            strategy: StorageStrategy::default(),
            lease_timeout: Arc::new(TwoTierTimeout::default()),
            backoff: Arc::new(ExponentialBackoff::default()),
        }
    }
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("range", &self.range)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from `LEASEPOOL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    ///
    /// Unset variables keep their defaults; set but malformed ones are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let default_range = PoolSizeRange::default();
        let min = parse_var(&lookup, "LEASEPOOL_MIN")?.unwrap_or(default_range.min());
        let max = match lookup("LEASEPOOL_MAX") {
            Some(raw) if matches!(raw.trim(), "inf" | "unbounded") => None,
            Some(raw) => Some(parse_value("LEASEPOOL_MAX", &raw)?),
            None => default_range.max(),
        };
        config.range = match max {
            Some(max) => PoolSizeRange::new(min, max)?,
            None => PoolSizeRange::at_least(min),
        };

        if let Some(strategy) = parse_var(&lookup, "LEASEPOOL_STRATEGY")? {
            config.strategy = strategy;
        }

        let default_timeout = TwoTierTimeout::default();
        let first = parse_var::<u64>(&lookup, "LEASEPOOL_FIRST_ACK_TIMEOUT_MS")?;
        let subsequent = parse_var::<u64>(&lookup, "LEASEPOOL_ACK_TIMEOUT_MS")?;
        if first.is_some() || subsequent.is_some() {
            config.lease_timeout = Arc::new(TwoTierTimeout {
                first_ack: first.map_or(default_timeout.first_ack, millis_or_never),
                subsequent: subsequent.map_or(default_timeout.subsequent, millis_or_never),
            });
        }

        let default_backoff = ExponentialBackoff::default();
        let base = parse_var::<u64>(&lookup, "LEASEPOOL_BACKOFF_BASE_MS")?;
        let max_backoff = parse_var::<u64>(&lookup, "LEASEPOOL_BACKOFF_MAX_MS")?;
        if base.is_some() || max_backoff.is_some() {
            config.backoff = Arc::new(ExponentialBackoff {
                base: base.map_or(default_backoff.base, Duration::from_millis),
                max: max_backoff.map_or(default_backoff.max, Duration::from_millis),
            });
        }

        Ok(config)
    }

    pub fn with_range(mut self, range: PoolSizeRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_strategy(mut self, strategy: StorageStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_lease_timeout(mut self, policy: impl LeaseTimeoutPolicy + 'static) -> Self {
        self.lease_timeout = Arc::new(policy);
        self
    }

    pub fn with_backoff(mut self, policy: impl BackoffPolicy + 'static) -> Self {
        self.backoff = Arc::new(policy);
        self
    }
}

fn millis_or_never(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var).map(|raw| parse_value(var, &raw)).transpose()
}

fn parse_value<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn range_rejects_inverted_bounds() {
        assert_eq!(
            PoolSizeRange::new(5, 2),
            Err(ConfigError::InvalidRange { min: 5, max: 2 })
        );
    }

    #[test]
    fn range_default_is_two_to_eight() {
        let range = PoolSizeRange::default();
        assert_eq!(range.min(), 2);
        assert_eq!(range.max(), Some(8));
        assert_eq!(range.to_string(), "[2, 8]");
    }

    #[test]
    fn only_zero_zero_is_disabled() {
        assert!(PoolSizeRange::disabled().is_disabled());
        assert!(!PoolSizeRange::new(0, 1).unwrap().is_disabled());
        assert!(!PoolSizeRange::at_least(0).is_disabled());
    }

    #[test]
    fn below_max_respects_unbounded() {
        let bounded = PoolSizeRange::new(1, 2).unwrap();
        assert!(bounded.below_max(1));
        assert!(!bounded.below_max(2));
        assert!(PoolSizeRange::at_least(1).below_max(usize::MAX - 1));
    }

    #[test]
    fn from_lookup_without_vars_uses_defaults() {
        let config = ManagerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.range, PoolSizeRange::default());
        assert_eq!(config.strategy, StorageStrategy::Lifo);
        assert_eq!(
            config.lease_timeout.timeout(0),
            TwoTierTimeout::default().first_ack
        );
    }

    #[test]
    fn from_lookup_reads_all_vars() {
        let config = ManagerConfig::from_lookup(lookup(&[
            ("LEASEPOOL_MIN", "1"),
            ("LEASEPOOL_MAX", "unbounded"),
            ("LEASEPOOL_STRATEGY", "fifo"),
            ("LEASEPOOL_FIRST_ACK_TIMEOUT_MS", "250"),
            ("LEASEPOOL_ACK_TIMEOUT_MS", "0"),
            ("LEASEPOOL_BACKOFF_BASE_MS", "10"),
            ("LEASEPOOL_BACKOFF_MAX_MS", "50"),
        ]))
        .unwrap();

        assert_eq!(config.range, PoolSizeRange::at_least(1));
        assert_eq!(config.strategy, StorageStrategy::Fifo);
        assert_eq!(
            config.lease_timeout.timeout(0),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.lease_timeout.timeout(3), None);
        assert_eq!(config.backoff.delay(1), Duration::from_millis(20));
        assert_eq!(config.backoff.delay(8), Duration::from_millis(50));
    }

    #[test]
    fn from_lookup_rejects_garbage() {
        let err = ManagerConfig::from_lookup(lookup(&[("LEASEPOOL_MIN", "two")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                var: "LEASEPOOL_MIN",
                value: "two".to_string()
            }
        );
    }

    #[test]
    fn from_lookup_rejects_inverted_range() {
        let err = ManagerConfig::from_lookup(lookup(&[
            ("LEASEPOOL_MIN", "9"),
            ("LEASEPOOL_MAX", "3"),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::InvalidRange { min: 9, max: 3 });
    }

    #[test]
    fn range_serializes() {
        insta::assert_json_snapshot!(PoolSizeRange::at_least(3), @r#"
        {
          "min": 3,
          "max": null
        }
        "#);
    }
}
