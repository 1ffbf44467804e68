//! Simulated connection source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use leasepool::{FactoryError, TokenFactory};

/// Stand-in for an expensive resource such as a database connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConnection {
    pub id: u64,
}

/// Creates [`SimConnection`]s after a fixed latency, failing every
/// `fail_every`-th attempt (never when zero).
pub struct SimFactory {
    fail_every: u64,
    latency: Duration,
    attempts: AtomicU64,
    created: AtomicU64,
    disposed: AtomicU64,
}

impl SimFactory {
    pub fn new(fail_every: u64, latency: Duration) -> Self {
        Self {
            fail_every,
            latency,
            attempts: AtomicU64::new(0),
            created: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
        }
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn disposed(&self) -> u64 {
        self.disposed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TokenFactory<SimConnection> for SimFactory {
    async fn create(&self) -> Result<SimConnection, FactoryError> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(self.latency).await;

        if self.fail_every > 0 && attempt % self.fail_every == 0 {
            return Err(FactoryError::Unavailable(format!(
                "simulated outage on attempt {attempt}"
            )));
        }

        let id = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(connection = id, attempt, "Opened simulated connection");
        Ok(SimConnection { id })
    }

    async fn dispose(&self, token: SimConnection) {
        self.disposed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection = token.id, "Closed simulated connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn every_nth_attempt_fails() {
        let factory = SimFactory::new(3, Duration::from_millis(5));

        assert_eq!(factory.create().await.unwrap(), SimConnection { id: 1 });
        assert_eq!(factory.create().await.unwrap(), SimConnection { id: 2 });
        let err = factory.create().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "token source unavailable: simulated outage on attempt 3"
        );
        assert_eq!(factory.create().await.unwrap(), SimConnection { id: 3 });
        assert_eq!(factory.created(), 3);
    }

    #[tokio::test]
    async fn zero_never_fails() {
        let factory = SimFactory::new(0, Duration::ZERO);
        for _ in 0..10 {
            factory.create().await.unwrap();
        }
        factory.dispose(SimConnection { id: 1 }).await;
        assert_eq!(factory.created(), 10);
        assert_eq!(factory.disposed(), 1);
    }
}
