//! Client-side handle to a running pool manager.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::PoolSizeRange;
use crate::lease::{Lease, RequesterId};

/// Requests and queries sent to the manager.
pub(crate) enum Command<M> {
    Request(Waiter<M>),
    Snapshot(oneshot::Sender<PoolSnapshot>),
}

/// A queued requester and the channel its grant goes out on.
pub(crate) struct Waiter<M> {
    pub requester: RequesterId,
    pub reply: oneshot::Sender<M>,
}

impl<M> Waiter<M> {
    /// Best effort: the requester may still go away right after this returns.
    pub fn is_alive(&self) -> bool {
        !self.reply.is_closed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The manager dropped the request without granting a lease, either
    /// because the pool is disabled or because the manager stopped.
    #[error("request dropped without a lease")]
    Unserved,
    #[error("pool manager is not running")]
    ManagerClosed,
}

/// Cloneable handle to a pool manager task. The manager stops once every
/// handle is dropped.
pub struct PoolHandle<T, M = Lease<T>> {
    commands: mpsc::UnboundedSender<Command<M>>,
    _token: PhantomData<fn() -> T>,
}

impl<T, M> Clone for PoolHandle<T, M> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            _token: PhantomData,
        }
    }
}

impl<T, M> PoolHandle<T, M> {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command<M>>) -> Self {
        Self {
            commands,
            _token: PhantomData,
        }
    }

    /// Join the wait queue for a lease.
    ///
    /// Returns immediately; the returned [`Grant`] resolves once a token is
    /// leased to this requester. Dropping the grant withdraws the request.
    pub fn request(&self) -> Grant<M> {
        let requester = RequesterId::new();
        let (reply, rx) = oneshot::channel();
        let rx = match self
            .commands
            .send(Command::Request(Waiter { requester, reply }))
        {
            Ok(()) => Some(rx),
            Err(_) => None,
        };
        Grant { requester, rx }
    }

    /// Current counts, as seen from inside the manager.
    pub async fn snapshot(&self) -> Result<PoolSnapshot, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| RequestError::ManagerClosed)?;
        rx.await.map_err(|_| RequestError::ManagerClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Pending lease request.
#[must_use = "dropping a grant withdraws the lease request"]
pub struct Grant<M> {
    requester: RequesterId,
    rx: Option<oneshot::Receiver<M>>,
}

impl<M> Grant<M> {
    pub fn requester_id(&self) -> RequesterId {
        self.requester
    }
}

impl<M> Future for Grant<M> {
    type Output = Result<M, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.as_mut() {
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.map_err(|_| RequestError::Unserved)),
            None => Poll::Ready(Err(RequestError::ManagerClosed)),
        }
    }
}

/// Phase of the manager's single token-creation conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationPhase {
    Idle,
    /// A creation request is outstanding at the provider.
    Requested,
    /// The last attempt failed; a retry is scheduled.
    BackingOff,
}

/// Point-in-time view of a pool manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub range: PoolSizeRange,
    pub available: usize,
    pub leased: usize,
    /// Queued requesters, including ones not yet found to be gone.
    pub waiting: usize,
    pub creation: CreationPhase,
    pub consecutive_failures: u32,
    pub leases_issued: u64,
}

impl PoolSnapshot {
    /// Tokens the manager currently holds, pooled or leased.
    pub fn outstanding(&self) -> usize {
        self.available + self.leased
    }

    /// Every token is leased and requesters are waiting.
    pub fn is_saturated(&self) -> bool {
        self.available == 0 && self.waiting > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn request_on_closed_manager_fails_fast() {
        let (tx, rx) = mpsc::unbounded_channel::<Command<u8>>();
        drop(rx);
        let handle: PoolHandle<u8, u8> = PoolHandle::new(tx);

        assert!(handle.is_closed());
        assert_eq!(
            handle.request().now_or_never(),
            Some(Err(RequestError::ManagerClosed))
        );
    }

    #[test]
    fn grant_resolves_with_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<&str>>();
        let handle: PoolHandle<(), &str> = PoolHandle::new(tx);

        let mut grant = handle.request();
        assert!((&mut grant).now_or_never().is_none());

        let Ok(Command::Request(waiter)) = rx.try_recv() else {
            panic!("expected a queued request");
        };
        assert_eq!(waiter.requester, grant.requester_id());
        assert!(waiter.is_alive());
        waiter.reply.send("lease").unwrap();

        assert_eq!(grant.now_or_never(), Some(Ok("lease")));
    }

    #[test]
    fn dropped_grant_marks_waiter_dead() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<u8>>();
        let handle: PoolHandle<u8, u8> = PoolHandle::new(tx);

        drop(handle.request());

        let Ok(Command::Request(waiter)) = rx.try_recv() else {
            panic!("expected a queued request");
        };
        assert!(!waiter.is_alive());
    }

    #[test]
    fn dropped_waiter_leaves_grant_unserved() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<u8>>();
        let handle: PoolHandle<u8, u8> = PoolHandle::new(tx);
        let grant = handle.request();

        drop(rx.try_recv());

        assert_eq!(grant.now_or_never(), Some(Err(RequestError::Unserved)));
    }

    #[test]
    fn snapshot_serializes() {
        let snapshot = PoolSnapshot {
            range: PoolSizeRange::default(),
            available: 1,
            leased: 3,
            waiting: 0,
            creation: CreationPhase::BackingOff,
            consecutive_failures: 2,
            leases_issued: 9,
        };
        assert_eq!(snapshot.outstanding(), 4);
        assert!(!snapshot.is_saturated());
        insta::assert_json_snapshot!(snapshot, @r#"
        {
          "range": {
            "min": 2,
            "max": 8
          },
          "available": 1,
          "leased": 3,
          "waiting": 0,
          "creation": "backing_off",
          "consecutive_failures": 2,
          "leases_issued": 9
        }
        "#);
    }
}
