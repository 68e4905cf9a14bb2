use parking_lot::RwLock;
use uuid::Uuid;

/// The signed-in actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Wallet address, used as the participant identifier in outposts.
    pub address: String,
    pub uuid: Uuid,
}

/// Read-only view of the auth provider. The session never mutates it.
pub trait IdentityProvider: Send + Sync {
    /// The current actor, or `None` when signed out.
    fn current(&self) -> Option<Identity>;
}

/// Identity held in memory, set from config or by the embedding app after
/// its own login flow.
#[derive(Debug, Default)]
pub struct LocalIdentity {
    identity: RwLock<Option<Identity>>,
}

impl LocalIdentity {
    pub fn new(identity: Option<Identity>) -> Self {
        Self {
            identity: RwLock::new(identity),
        }
    }

    pub fn signed_in(address: impl Into<String>) -> Self {
        Self::new(Some(Identity {
            address: address.into(),
            uuid: Uuid::new_v4(),
        }))
    }

    pub fn sign_in(&self, identity: Identity) {
        *self.identity.write() = Some(identity);
    }

    pub fn sign_out(&self) {
        *self.identity.write() = None;
    }
}

impl IdentityProvider for LocalIdentity {
    fn current(&self) -> Option<Identity> {
        self.identity.read().clone()
    }
}
