//! leasepool: actor-style lease manager for pools of reusable tokens.
//!
//! A single manager task owns the wait queue, the pool of idle tokens, the
//! table of active leases and the token-creation conversation. Everything
//! else talks to it through channels:
//!
//! - requesters call [`PoolHandle::request`] and await the [`Grant`]
//! - lease holders [`acknowledge`](Lease::acknowledge) and
//!   [`release`](Lease::release) their [`Lease`]
//! - a [`LifecycleProvider`] creates tokens on demand and disposes of dead or
//!   revoked ones

mod config;
mod handle;
mod lease;
mod manager;
mod policy;
mod provider;
mod storage;

pub use config::{ConfigError, ManagerConfig, PoolSizeRange};
pub use handle::{CreationPhase, Grant, PoolHandle, PoolSnapshot, RequestError};
pub use lease::{Lease, LeaseId, RequesterId};
pub use manager::{spawn_manager, spawn_manager_with_transform};
pub use policy::{
    BackoffPolicy, ExponentialBackoff, FixedBackoff, LeaseTimeoutPolicy, NeverExpire,
    TwoTierTimeout,
};
pub use provider::{
    CreationReply, FactoryError, FactoryProvider, LifecycleProvider, TokenFactory,
};
pub use storage::StorageStrategy;
