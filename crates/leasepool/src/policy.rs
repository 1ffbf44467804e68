//! Timing policies: lease expiration and creation retry backoff.

use std::time::Duration;

/// Decides how long a lease may go without an acknowledgement.
///
/// Called with the lease's acknowledgement count each time its expiration
/// timer is (re)armed. `None` means the lease never expires from inactivity.
pub trait LeaseTimeoutPolicy: Send + Sync {
    fn timeout(&self, acks: u64) -> Option<Duration>;
}

impl<F> LeaseTimeoutPolicy for F
where
    F: Fn(u64) -> Option<Duration> + Send + Sync,
{
    fn timeout(&self, acks: u64) -> Option<Duration> {
        self(acks)
    }
}

/// Short grace period until the first acknowledgement, longer afterwards.
///
/// The short first tier catches holders that silently drop a granted lease;
/// the second tier tolerates normal holding time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwoTierTimeout {
    pub first_ack: Option<Duration>,
    pub subsequent: Option<Duration>,
}

impl Default for TwoTierTimeout {
    fn default() -> Self {
        Self {
            first_ack: Some(Duration::from_secs(10)),
            subsequent: Some(Duration::from_secs(60)),
        }
    }
}

impl LeaseTimeoutPolicy for TwoTierTimeout {
    fn timeout(&self, acks: u64) -> Option<Duration> {
        if acks == 0 {
            self.first_ack
        } else {
            self.subsequent
        }
    }
}

/// Leases never expire.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverExpire;

impl LeaseTimeoutPolicy for NeverExpire {
    fn timeout(&self, _acks: u64) -> Option<Duration> {
        None
    }
}

/// Delay before the next token creation attempt, given the number of
/// consecutive failures so far (always at least 1).
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, failures: u32) -> Duration;
}

impl<F> BackoffPolicy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, failures: u32) -> Duration {
        self(failures)
    }
}

/// `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, failures: u32) -> Duration {
        self.base.saturating_mul(1 << failures.min(10)).min(self.max)
    }
}

/// Same delay after every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff(pub Duration);

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _failures: u32) -> Duration {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_tier_switches_after_first_ack() {
        let policy = TwoTierTimeout {
            first_ack: Some(Duration::from_secs(1)),
            subsequent: Some(Duration::from_secs(30)),
        };
        assert_eq!(policy.timeout(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.timeout(1), Some(Duration::from_secs(30)));
        assert_eq!(policy.timeout(500), Some(Duration::from_secs(30)));
    }

    #[test]
    fn exponential_backoff_doubles_then_caps() {
        let backoff = ExponentialBackoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        // Shift is clamped, so huge failure counts cannot overflow.
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_saturates_on_huge_base() {
        let backoff = ExponentialBackoff {
            base: Duration::MAX / 2,
            max: Duration::MAX,
        };
        assert_eq!(backoff.delay(3), Duration::MAX);
    }

    #[test]
    fn closures_are_policies() {
        let timeout = |acks: u64| (acks < 3).then(|| Duration::from_secs(acks + 1));
        assert_eq!(timeout.timeout(2), Some(Duration::from_secs(3)));
        assert_eq!(LeaseTimeoutPolicy::timeout(&timeout, 3), None);

        let backoff = |failures: u32| Duration::from_millis(u64::from(failures));
        assert_eq!(backoff.delay(7), Duration::from_millis(7));
    }

    #[test]
    fn never_expire_has_no_timeout() {
        assert_eq!(NeverExpire.timeout(0), None);
        assert_eq!(NeverExpire.timeout(9), None);
    }
}
