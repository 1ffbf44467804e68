//! The token lifecycle provider seam.
//!
//! The manager never creates or destroys tokens itself. It asks a
//! [`LifecycleProvider`] for a new token and later hears back through a
//! [`CreationReply`]; dead and revoked tokens are handed to the provider to
//! dispose of.
//!
//! Provider methods are called from inside the manager's event loop and must
//! not block. Anything slow belongs in a spawned task, which is what
//! [`FactoryProvider`] does for an async [`TokenFactory`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Result of one token creation attempt, as seen by the manager.
#[derive(Debug)]
pub(crate) enum CreationOutcome<T> {
    Succeeded(T),
    Failed(String),
}

/// Return path for a creation request.
///
/// Replying more than once, or replying when nothing was requested, is
/// tolerated: the manager logs the extra reply and ignores it.
pub struct CreationReply<T> {
    tx: mpsc::UnboundedSender<CreationOutcome<T>>,
}

impl<T> Clone for CreationReply<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> CreationReply<T> {
    pub(crate) fn new(tx: mpsc::UnboundedSender<CreationOutcome<T>>) -> Self {
        Self { tx }
    }

    pub fn succeeded(&self, token: T) {
        self.send(CreationOutcome::Succeeded(token));
    }

    /// Report that no token could be created right now. The manager retries
    /// after a backoff.
    pub fn failed(&self, reason: impl Into<String>) {
        self.send(CreationOutcome::Failed(reason.into()));
    }

    fn send(&self, outcome: CreationOutcome<T>) {
        if self.tx.send(outcome).is_err() {
            tracing::debug!("Pool manager gone, creation reply dropped");
        }
    }
}

/// External authority over token creation and destruction.
pub trait LifecycleProvider<T>: Send + Sync {
    /// Start creating one token and reply through `reply` when done.
    fn request_token(&self, reply: CreationReply<T>);

    /// Whether a pooled token is still usable. Checked just before the token
    /// is leased out.
    fn is_alive(&self, _token: &T) -> bool {
        true
    }

    /// Sanity check on a freshly created token. A token failing it is
    /// treated as a provider contract violation: logged and dropped.
    fn is_well_formed(&self, _token: &T) -> bool {
        true
    }

    /// A pooled token failed `is_alive` and was removed from the pool.
    fn discarded(&self, token: T);

    /// A lease on this token expired unacknowledged. The token is presumed
    /// unhealthy and does not go back to the pool.
    fn revoked(&self, token: T);
}

impl<T, P> LifecycleProvider<T> for Arc<P>
where
    P: LifecycleProvider<T> + ?Sized,
{
    fn request_token(&self, reply: CreationReply<T>) {
        (**self).request_token(reply);
    }

    fn is_alive(&self, token: &T) -> bool {
        (**self).is_alive(token)
    }

    fn is_well_formed(&self, token: &T) -> bool {
        (**self).is_well_formed(token)
    }

    fn discarded(&self, token: T) {
        (**self).discarded(token);
    }

    fn revoked(&self, token: T) {
        (**self).revoked(token);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("token source unavailable: {0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async token source, adapted to a [`LifecycleProvider`] by
/// [`FactoryProvider`].
#[async_trait]
pub trait TokenFactory<T: Send + 'static>: Send + Sync + 'static {
    async fn create(&self) -> Result<T, FactoryError>;

    fn is_alive(&self, _token: &T) -> bool {
        true
    }

    /// Tear down a token that left the pool for good.
    async fn dispose(&self, _token: T) {}
}

/// Runs each creation and disposal of a [`TokenFactory`] on its own task.
pub struct FactoryProvider<F> {
    factory: Arc<F>,
}

impl<F> FactoryProvider<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

impl<T, F> LifecycleProvider<T> for FactoryProvider<F>
where
    T: Send + 'static,
    F: TokenFactory<T>,
{
    fn request_token(&self, reply: CreationReply<T>) {
        let factory = Arc::clone(&self.factory);
        tokio::spawn(async move {
            match factory.create().await {
                Ok(token) => reply.succeeded(token),
                Err(e) => {
                    tracing::warn!(error = %e, "Token creation failed");
                    reply.failed(e.to_string());
                }
            }
        });
    }

    fn is_alive(&self, token: &T) -> bool {
        self.factory.is_alive(token)
    }

    fn discarded(&self, token: T) {
        tracing::debug!("Disposing dead token");
        self.dispose(token);
    }

    fn revoked(&self, token: T) {
        tracing::warn!("Disposing token from revoked lease");
        self.dispose(token);
    }
}

impl<F> FactoryProvider<F> {
    fn dispose<T>(&self, token: T)
    where
        T: Send + 'static,
        F: TokenFactory<T>,
    {
        let factory = Arc::clone(&self.factory);
        tokio::spawn(async move {
            factory.dispose(token).await;
        });
    }
}
