//! Workload settings, read from `LEASEPOOL_SIM_*` variables.
//!
//! Pool settings themselves come from `ManagerConfig::from_env`.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimSettings {
    /// Concurrent clients.
    pub clients: usize,
    /// Leases each client takes, one after another.
    pub rounds: usize,
    /// How long a client holds each lease.
    pub hold: Duration,
    /// Latency of one simulated connection attempt.
    pub create_latency: Duration,
    /// Every n-th connection attempt fails; 0 disables failures.
    pub fail_every: u64,
    /// Every n-th lease a client takes is dropped without release; 0
    /// disables.
    pub abandon_every: usize,
    /// How long a client waits for a grant before giving up on a round.
    pub grant_timeout: Duration,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            clients: 8,
            rounds: 5,
            hold: Duration::from_millis(50),
            create_latency: Duration::from_millis(20),
            fail_every: 0,
            abandon_every: 0,
            grant_timeout: Duration::from_secs(30),
        }
    }
}

impl SimSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            clients: parse(&lookup, "LEASEPOOL_SIM_CLIENTS")?.unwrap_or(defaults.clients),
            rounds: parse(&lookup, "LEASEPOOL_SIM_ROUNDS")?.unwrap_or(defaults.rounds),
            hold: parse(&lookup, "LEASEPOOL_SIM_HOLD_MS")?
                .map_or(defaults.hold, Duration::from_millis),
            create_latency: parse(&lookup, "LEASEPOOL_SIM_CREATE_MS")?
                .map_or(defaults.create_latency, Duration::from_millis),
            fail_every: parse(&lookup, "LEASEPOOL_SIM_FAIL_EVERY")?.unwrap_or(defaults.fail_every),
            abandon_every: parse(&lookup, "LEASEPOOL_SIM_ABANDON_EVERY")?
                .unwrap_or(defaults.abandon_every),
            grant_timeout: parse(&lookup, "LEASEPOOL_SIM_GRANT_TIMEOUT_MS")?
                .map_or(defaults.grant_timeout, Duration::from_millis),
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(var)
        .map(|raw| {
            raw.trim()
                .parse()
                .with_context(|| format!("invalid value for {var}: {raw:?}"))
        })
        .transpose()
}
