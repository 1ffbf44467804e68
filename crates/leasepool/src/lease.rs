//! Leases and the identities they carry.

use serde::Serialize;
use tokio::sync::mpsc;

/// Identifier of an issued lease.
///
/// Drawn from a per-manager `u64` sequence starting at 1 and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LeaseId(u64);

impl LeaseId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity of a requester, assigned when it asks for a lease.
///
/// UUID v4 so identities from different managers never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequesterId(uuid::Uuid);

impl RequesterId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for RequesterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequesterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages a lease holder sends back to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaseSignal {
    Acknowledge(LeaseId),
    Release(LeaseId),
}

/// Exclusive, temporary use of one token.
///
/// A lease is immutable. Holders must [`acknowledge`](Lease::acknowledge) it
/// within the configured timeout or the manager revokes it, and must
/// [`release`](Lease::release) it when done. Dropping a lease without
/// releasing it leaves the token checked out until revocation.
#[derive(Clone)]
pub struct Lease<T> {
    id: LeaseId,
    token: T,
    owner: RequesterId,
    manager: mpsc::UnboundedSender<LeaseSignal>,
}

impl<T> Lease<T> {
    pub(crate) fn new(
        id: LeaseId,
        token: T,
        owner: RequesterId,
        manager: mpsc::UnboundedSender<LeaseSignal>,
    ) -> Self {
        Self {
            id,
            token,
            owner,
            manager,
        }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn token(&self) -> &T {
        &self.token
    }

    pub fn owner(&self) -> RequesterId {
        self.owner
    }

    /// Confirm continued use; restarts the expiration clock.
    pub fn acknowledge(&self) {
        self.signal(LeaseSignal::Acknowledge(self.id));
    }

    /// Hand the token back to the pool.
    pub fn release(self) {
        self.signal(LeaseSignal::Release(self.id));
    }

    fn signal(&self, signal: LeaseSignal) {
        if self.manager.send(signal).is_err() {
            tracing::debug!(lease_id = %self.id, ?signal, "Pool manager gone, lease signal dropped");
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("owner", &self.owner)
            .finish()
    }
}
