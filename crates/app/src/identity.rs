//! "Who am I" for a session
//!
//! Identity may resolve after a session has already connected (a profile
//! loading after sign-in), so providers expose a watch channel as well as
//! the current value. `None` means anonymous.

use raidroom_core::Identity;
use tokio::sync::watch;
use tracing::debug;

pub trait IdentityProvider: Send + Sync + 'static {
    /// Current identity, `None` when anonymous
    fn current(&self) -> Option<Identity>;

    /// Subscribe to identity changes
    fn watch(&self) -> watch::Receiver<Option<Identity>>;
}

/// Identity held in memory and updated by whoever owns the auth session
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    tx: watch::Sender<Option<Identity>>,
}

impl SessionIdentity {
    pub fn new(identity: Option<Identity>) -> Self {
        let (tx, _) = watch::channel(identity);
        Self { tx }
    }

    pub fn anonymous() -> Self {
        Self::new(None)
    }

    pub fn signed_in(identity: Identity) -> Self {
        Self::new(Some(identity))
    }

    /// Replace the identity. Unchanged values do not wake watchers.
    pub fn set(&self, identity: Option<Identity>) {
        self.tx.send_if_modified(|current| {
            if *current == identity {
                return false;
            }
            debug!(
                user_id = ?identity.as_ref().map(|i| i.id),
                "Identity changed"
            );
            *current = identity;
            true
        });
    }

    pub fn sign_out(&self) {
        self.set(None);
    }
}

impl IdentityProvider for SessionIdentity {
    fn current(&self) -> Option<Identity> {
        self.tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }
}
