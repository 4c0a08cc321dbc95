//! Identity source contract.
//!
//! The current identity is observed through a `watch` channel: the value
//! present when a receiver is created is the startup notification, and every
//! sign-in or sign-out replaces it.

use tokio::sync::watch;
use tracing::info;

use crate::types::OwnerId;

/// Supplies the authenticated identity and notifies on change.
pub trait IdentitySource: Send + Sync {
    /// Receiver of the current identity (`None` when signed out).
    fn watch(&self) -> watch::Receiver<Option<OwnerId>>;
}

/// Identity source driven directly by sign-in and sign-out calls.
pub struct AuthState {
    tx: watch::Sender<Option<OwnerId>>,
}

impl AuthState {
    /// Start signed out.
    pub fn new() -> Self {
        Self::starting_as(None)
    }

    /// Start with an already resolved identity.
    pub fn starting_as(initial: Option<OwnerId>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn sign_in(&self, owner: impl Into<OwnerId>) {
        let owner = owner.into();
        info!(owner = %owner, "signed in");
        self.tx.send_replace(Some(owner));
    }

    pub fn sign_out(&self) {
        info!("signed out");
        self.tx.send_replace(None);
    }

    /// The identity currently signed in.
    pub fn current(&self) -> Option<OwnerId> {
        self.tx.borrow().clone()
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentitySource for AuthState {
    fn watch(&self) -> watch::Receiver<Option<OwnerId>> {
        self.tx.subscribe()
    }
}
