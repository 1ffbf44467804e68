//! leasepool-sim: drive a pool manager with simulated clients and report
//! the final pool state.

mod factory;
mod settings;

use std::sync::Arc;

use anyhow::Context;
use leasepool::{FactoryProvider, ManagerConfig, PoolHandle, PoolSnapshot, spawn_manager};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::factory::{SimConnection, SimFactory};
use crate::settings::SimSettings;

/// Initialize tracing on stderr.
///
/// `RUST_LOG` wins when set. Otherwise `LEASEPOOL_LOG` picks the level for
/// both crates (default info). `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("LEASEPOOL_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("leasepool={level},leasepool_sim={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[derive(Debug)]
struct SimReport {
    snapshot: PoolSnapshot,
    served: usize,
    abandoned: usize,
    created: u64,
    disposed: u64,
}

#[derive(Debug, Default)]
struct ClientTally {
    served: usize,
    abandoned: usize,
}

async fn run_client(
    client: usize,
    handle: PoolHandle<SimConnection>,
    settings: SimSettings,
) -> anyhow::Result<ClientTally> {
    let mut tally = ClientTally::default();

    for round in 1..=settings.rounds {
        let lease = match tokio::time::timeout(settings.grant_timeout, handle.request()).await {
            Ok(grant) => grant.with_context(|| format!("client {client} lost its request"))?,
            Err(_) => {
                tracing::warn!(client, round, "Timed out waiting for a lease");
                continue;
            }
        };
        lease.acknowledge();
        tracing::debug!(
            client,
            round,
            lease_id = %lease.id(),
            connection = lease.token().id,
            "Holding lease"
        );

        if settings.abandon_every > 0 && round % settings.abandon_every == 0 {
            tracing::info!(client, round, lease_id = %lease.id(), "Abandoning lease");
            tally.abandoned += 1;
            continue;
        }

        tokio::time::sleep(settings.hold / 2).await;
        lease.acknowledge();
        tokio::time::sleep(settings.hold / 2).await;
        lease.release();
        tally.served += 1;
    }

    Ok(tally)
}

async fn simulate(config: ManagerConfig, settings: SimSettings) -> anyhow::Result<SimReport> {
    let provider = Arc::new(FactoryProvider::new(SimFactory::new(
        settings.fail_every,
        settings.create_latency,
    )));
    let handle = spawn_manager(config, Arc::clone(&provider));

    let clients = (0..settings.clients)
        .map(|client| tokio::spawn(run_client(client, handle.clone(), settings.clone())));
    let mut served = 0;
    let mut abandoned = 0;
    for result in futures::future::join_all(clients).await {
        let tally = result.context("client task panicked")??;
        served += tally.served;
        abandoned += tally.abandoned;
    }

    let snapshot = handle.snapshot().await?;
    Ok(SimReport {
        snapshot,
        served,
        abandoned,
        created: provider.factory().created(),
        disposed: provider.factory().disposed(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ManagerConfig::from_env().context("invalid pool configuration")?;
    let settings = SimSettings::from_env()?;
    tracing::info!(?config, ?settings, "Starting simulation");

    let report = simulate(config, settings).await?;
    tracing::info!(
        served = report.served,
        abandoned = report.abandoned,
        created = report.created,
        disposed = report.disposed,
        "Simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&report.snapshot)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use leasepool::{PoolSizeRange, TwoTierTimeout};

    use super::*;

    fn settings(clients: usize, rounds: usize) -> SimSettings {
        SimSettings {
            clients,
            rounds,
            hold: Duration::from_millis(100),
            create_latency: Duration::from_millis(10),
            grant_timeout: Duration::from_secs(5),
            ..SimSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn every_client_is_served() {
        let config = ManagerConfig::new().with_range(PoolSizeRange::exactly(2));
        let report = simulate(config, settings(4, 3)).await.unwrap();

        assert_eq!(report.served, 12);
        assert_eq!(report.snapshot.leased, 0);
        assert_eq!(report.snapshot.outstanding(), 2);
        assert_eq!(report.snapshot.leases_issued, 12);
        assert_eq!(report.created, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_failures_are_retried() {
        let config = ManagerConfig::new().with_range(PoolSizeRange::exactly(2));
        let report = simulate(
            config,
            SimSettings {
                fail_every: 2,
                ..settings(3, 2)
            },
        )
        .await
        .unwrap();

        assert_eq!(report.served, 6);
        assert_eq!(report.created, 2);
        assert_eq!(report.snapshot.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_leases_are_revoked_and_replaced() {
        let config = ManagerConfig::new()
            .with_range(PoolSizeRange::exactly(2))
            .with_lease_timeout(TwoTierTimeout {
                first_ack: Some(Duration::from_secs(1)),
                subsequent: Some(Duration::from_secs(1)),
            });
        let report = simulate(
            config,
            SimSettings {
                abandon_every: 2,
                ..settings(2, 3)
            },
        )
        .await
        .unwrap();

        assert_eq!(report.served, 4);
        assert_eq!(report.abandoned, 2);
        assert_eq!(report.snapshot.leases_issued, 6);
        assert_eq!(report.created, 4);
    }
}
