//! Pool manager - the single task that owns all pool state.
//!
//! Flow:
//! 1. Requesters join a FIFO wait queue
//! 2. Waiters are matched against pooled tokens, each match issues a lease
//!    with an armed expiration timer
//! 3. Supply is regulated by asking the provider for one token at a time,
//!    retrying with backoff on failure
//! 4. Leases are acknowledged (timer re-armed), released (token back to the
//!    pool) or revoked on timeout (token handed to the provider)
//!
//! Every input, including timer expirations, is a message handled to
//! completion on the event loop, so nothing here needs a lock.
//!
//! Liveness pruning of waiters and pooled tokens is best effort: a requester
//! can go away between the check and the grant, and a token can die between
//! the check and its use. A grant sent to a vanished requester stays tracked
//! until its lease times out.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;
use tracing::Instrument;

use crate::config::{ManagerConfig, PoolSizeRange};
use crate::handle::{Command, CreationPhase, PoolHandle, PoolSnapshot, Waiter};
use crate::lease::{Lease, LeaseId, LeaseSignal, RequesterId};
use crate::policy::{BackoffPolicy, LeaseTimeoutPolicy};
use crate::provider::{CreationOutcome, CreationReply, LifecycleProvider};
use crate::storage::PoolStorage;

/// Longest delay a timer is armed with. The timer wheel rejects deadlines
/// beyond roughly two years, so longer policy delays are clamped to this.
const MAX_TIMER_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Start a pool manager whose grants are plain [`Lease`]s.
///
/// Must be called from within a tokio runtime.
pub fn spawn_manager<T, P>(config: ManagerConfig, provider: P) -> PoolHandle<T>
where
    T: Clone + Send + 'static,
    P: LifecycleProvider<T> + 'static,
{
    spawn_manager_with_transform(config, provider, |lease| lease)
}

/// Start a pool manager that passes every lease through `transform` before
/// handing it to the requester.
pub fn spawn_manager_with_transform<T, M, P, F>(
    config: ManagerConfig,
    provider: P,
    transform: F,
) -> PoolHandle<T, M>
where
    T: Clone + Send + 'static,
    M: Send + 'static,
    P: LifecycleProvider<T> + 'static,
    F: Fn(Lease<T>) -> M + Send + 'static,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (lease_tx, lease_rx) = mpsc::unbounded_channel();
    let (creation_tx, creation_rx) = mpsc::unbounded_channel();

    let range = config.range;
    let manager = PoolManager {
        range,
        lease_timeout: config.lease_timeout,
        backoff: config.backoff,
        provider: Arc::new(provider),
        transform: Box::new(transform),
        waiters: VecDeque::new(),
        pool: config.strategy.build(),
        leases: HashMap::new(),
        creation: CreationState::Idle,
        next_lease_id: 1,
        timers: DelayQueue::new(),
        lease_tx,
        creation_tx,
    };

    tracing::info!(%range, strategy = config.strategy.as_str(), "Starting pool manager");
    tokio::spawn(
        run_event_loop(manager, commands_rx, lease_rx, creation_rx)
            .instrument(tracing::info_span!("lease_pool", %range)),
    );

    PoolHandle::new(commands_tx)
}

/// Manager-side bookkeeping for one active lease.
struct LeaseState<T> {
    /// The manager's copy of the leased token, returned to the pool on
    /// release or handed to the provider on revocation.
    token: T,
    owner: RequesterId,
    acks: u64,
    timer: Option<Key>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreationState {
    Idle,
    Requested { failures: u32 },
    BackingOff { failures: u32 },
}

impl CreationState {
    fn failures(&self) -> u32 {
        match self {
            Self::Idle => 0,
            Self::Requested { failures } | Self::BackingOff { failures } => *failures,
        }
    }

    fn phase(&self) -> CreationPhase {
        match self {
            Self::Idle => CreationPhase::Idle,
            Self::Requested { .. } => CreationPhase::Requested,
            Self::BackingOff { .. } => CreationPhase::BackingOff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerEvent {
    /// Stamped with the acknowledgement count at scheduling time.
    RevocationCheck { lease: LeaseId, acks: u64 },
    RetryCreation,
}

struct PoolManager<T, M> {
    range: PoolSizeRange,
    lease_timeout: Arc<dyn LeaseTimeoutPolicy>,
    backoff: Arc<dyn BackoffPolicy>,
    provider: Arc<dyn LifecycleProvider<T>>,
    transform: Box<dyn Fn(Lease<T>) -> M + Send>,

    waiters: VecDeque<Waiter<M>>,
    pool: Box<dyn PoolStorage<T>>,
    leases: HashMap<LeaseId, LeaseState<T>>,
    creation: CreationState,
    next_lease_id: u64,

    timers: DelayQueue<TimerEvent>,
    lease_tx: mpsc::UnboundedSender<LeaseSignal>,
    creation_tx: mpsc::UnboundedSender<CreationOutcome<T>>,
}

async fn run_event_loop<T, M>(
    mut manager: PoolManager<T, M>,
    mut commands: mpsc::UnboundedReceiver<Command<M>>,
    mut lease_rx: mpsc::UnboundedReceiver<LeaseSignal>,
    mut creation_rx: mpsc::UnboundedReceiver<CreationOutcome<T>>,
) where
    T: Clone + Send + 'static,
    M: Send + 'static,
{
    // Warm the pool up to its minimum before the first request arrives.
    manager.evaluate_supply();

    loop {
        tokio::select! {
            biased;

            Some(signal) = lease_rx.recv() => {
                manager.on_lease_signal(signal);
            }

            Some(outcome) = creation_rx.recv() => {
                manager.on_creation_outcome(outcome);
            }

            Some(expired) = manager.timers.next() => {
                manager.on_timer(expired.into_inner());
            }

            command = commands.recv() => {
                match command {
                    Some(Command::Request(waiter)) => manager.on_request(waiter),
                    Some(Command::Snapshot(tx)) => {
                        let _ = tx.send(manager.snapshot());
                    }
                    None => break,
                }
            }
        }
    }

    tracing::info!(
        leased = manager.leases.len(),
        waiting = manager.waiters.len(),
        "All pool handles dropped, pool manager exiting"
    );
}

impl<T, M> PoolManager<T, M>
where
    T: Clone + Send + 'static,
    M: Send + 'static,
{
    fn on_request(&mut self, waiter: Waiter<M>) {
        if self.range.is_disabled() {
            // A [0, 0] pool never has a token to give.
            tracing::debug!(requester = %waiter.requester, "Pool disabled, dropping request");
            return;
        }
        tracing::debug!(
            requester = %waiter.requester,
            waiting = self.waiters.len() + 1,
            "Lease requested"
        );
        self.waiters.push_back(waiter);
        self.issue_leases();
    }

    fn on_lease_signal(&mut self, signal: LeaseSignal) {
        match signal {
            LeaseSignal::Acknowledge(id) => self.acknowledge(id),
            LeaseSignal::Release(id) => self.release(id),
        }
    }

    fn on_creation_outcome(&mut self, outcome: CreationOutcome<T>) {
        match outcome {
            CreationOutcome::Succeeded(token) => self.creation_succeeded(token),
            CreationOutcome::Failed(reason) => self.creation_failed(reason),
        }
    }

    fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::RevocationCheck { lease, acks } => self.check_revocation(lease, acks),
            TimerEvent::RetryCreation => self.retry_creation(),
        }
    }

    /// Match waiters with pooled tokens until one side runs out, then
    /// re-evaluate supply.
    fn issue_leases(&mut self) {
        loop {
            self.prune_dead_waiters();
            if self.waiters.is_empty() {
                break;
            }

            self.prune_dead_tokens();
            if self.pool.is_empty() {
                break;
            }

            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let Some(token) = self.pool.remove() else {
                self.waiters.push_front(waiter);
                break;
            };
            self.grant(waiter, token);
        }

        self.evaluate_supply();
    }

    fn prune_dead_waiters(&mut self) {
        while let Some(waiter) = self.waiters.front() {
            if waiter.is_alive() {
                break;
            }
            tracing::debug!(requester = %waiter.requester, "Requester gone, dropping from queue");
            self.waiters.pop_front();
        }
    }

    fn prune_dead_tokens(&mut self) {
        while let Some(token) = self.pool.peek() {
            if self.provider.is_alive(token) {
                break;
            }
            if let Some(token) = self.pool.remove() {
                tracing::debug!(available = self.pool.len(), "Discarding dead token");
                self.provider.discarded(token);
            }
        }
    }

    fn grant(&mut self, waiter: Waiter<M>, token: T) {
        let id = LeaseId::new(self.next_lease_id);
        self.next_lease_id += 1;

        let requester = waiter.requester;
        let lease = Lease::new(id, token.clone(), requester, self.lease_tx.clone());
        let timer = arm_expiration(&mut self.timers, self.lease_timeout.as_ref(), id, 0);
        self.leases.insert(
            id,
            LeaseState {
                token,
                owner: requester,
                acks: 0,
                timer,
            },
        );

        tracing::debug!(lease_id = %id, %requester, "Lease issued");
        if waiter.reply.send((self.transform)(lease)).is_err() {
            tracing::debug!(
                lease_id = %id,
                %requester,
                "Requester went away before the grant arrived, lease left to expire"
            );
        }
    }

    fn acknowledge(&mut self, id: LeaseId) {
        let Some(state) = self.leases.get_mut(&id) else {
            tracing::warn!(lease_id = %id, "Acknowledge for unknown lease, ignoring");
            return;
        };

        state.acks += 1;
        if let Some(key) = state.timer.take() {
            self.timers.remove(&key);
        }
        state.timer = arm_expiration(&mut self.timers, self.lease_timeout.as_ref(), id, state.acks);
        tracing::trace!(lease_id = %id, acks = state.acks, "Lease acknowledged");
    }

    fn release(&mut self, id: LeaseId) {
        let Some(state) = self.leases.remove(&id) else {
            tracing::warn!(lease_id = %id, "Release for unknown lease, ignoring");
            return;
        };

        if let Some(key) = state.timer {
            self.timers.remove(&key);
        }
        tracing::debug!(lease_id = %id, requester = %state.owner, acks = state.acks, "Lease released");
        self.pool.add(state.token);
        self.issue_leases();
    }

    fn check_revocation(&mut self, id: LeaseId, acks: u64) {
        let state = match self.leases.entry(id) {
            Entry::Occupied(entry) if entry.get().acks == acks => entry.remove(),
            _ => {
                tracing::trace!(lease_id = %id, acks, "Stale expiration check");
                return;
            }
        };

        // The fired timer was this lease's current one; its key is spent.
        tracing::warn!(
            lease_id = %id,
            requester = %state.owner,
            acks,
            "Lease expired without acknowledgement, revoking"
        );
        self.provider.revoked(state.token);
        self.evaluate_supply();
    }

    fn outstanding(&self) -> usize {
        self.pool.len() + self.leases.len()
    }

    /// Ask for one more token if the pool is below its minimum, or below its
    /// maximum with requesters waiting. Safe to call at any time.
    fn evaluate_supply(&mut self) {
        if self.creation != CreationState::Idle {
            return;
        }

        let outstanding = self.outstanding();
        let needed = outstanding < self.range.min()
            || (self.range.below_max(outstanding) && !self.waiters.is_empty());
        if !needed {
            return;
        }

        tracing::debug!(outstanding, waiting = self.waiters.len(), "Requesting token creation");
        self.creation = CreationState::Requested { failures: 0 };
        self.request_token();
    }

    fn request_token(&self) {
        self.provider
            .request_token(CreationReply::new(self.creation_tx.clone()));
    }

    fn creation_succeeded(&mut self, token: T) {
        if self.creation == CreationState::Idle {
            tracing::warn!("Token created without an outstanding request, ignoring");
            return;
        }
        if !self.provider.is_well_formed(&token) {
            tracing::warn!(
                failures = self.creation.failures(),
                "Provider returned a malformed token, ignoring"
            );
            return;
        }

        self.creation = CreationState::Idle;
        self.pool.add(token);
        tracing::debug!(available = self.pool.len(), leased = self.leases.len(), "Token created");
        self.issue_leases();
    }

    /// Only a failure for the outstanding request counts. A failure that
    /// arrives while backing off is ignored: counting it would arm a second
    /// retry and break the one-request-at-a-time rule.
    fn creation_failed(&mut self, reason: String) {
        let CreationState::Requested { failures } = self.creation else {
            tracing::warn!(%reason, "Creation failure without an outstanding request, ignoring");
            return;
        };

        let failures = failures.saturating_add(1);
        let delay = self.backoff.delay(failures).min(MAX_TIMER_DELAY);
        tracing::warn!(
            %reason,
            failures,
            backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Token creation failed, retrying after backoff"
        );
        self.creation = CreationState::BackingOff { failures };
        self.timers.insert(TimerEvent::RetryCreation, delay);
    }

    fn retry_creation(&mut self) {
        match self.creation {
            CreationState::BackingOff { failures } => {
                tracing::debug!(failures, "Retrying token creation");
                self.creation = CreationState::Requested { failures };
                self.request_token();
            }
            // A token arrived while backing off; decide afresh.
            CreationState::Idle => self.evaluate_supply(),
            CreationState::Requested { .. } => {
                tracing::trace!("Retry timer fired with a request outstanding");
            }
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            range: self.range,
            available: self.pool.len(),
            leased: self.leases.len(),
            waiting: self.waiters.len(),
            creation: self.creation.phase(),
            consecutive_failures: self.creation.failures(),
            leases_issued: self.next_lease_id - 1,
        }
    }
}

fn arm_expiration(
    timers: &mut DelayQueue<TimerEvent>,
    policy: &dyn LeaseTimeoutPolicy,
    lease: LeaseId,
    acks: u64,
) -> Option<Key> {
    let timeout = policy.timeout(acks)?.min(MAX_TIMER_DELAY);
    Some(timers.insert(TimerEvent::RevocationCheck { lease, acks }, timeout))
}
