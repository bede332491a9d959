//! Ownership of remote identities by custom resources
//!
//! Two custom resources must never drive the same remote object. The first
//! resource to reconcile an identity claims it; any other resource naming the
//! same identity is rejected until the claim is released on deletion.
//! Claims also carry a lock that serializes remote calls per identity. An
//! owner holds at most one claim.
//!
//! Claims live in process memory. When a controller starts, claims recorded
//! as `syncedIdentity` in resource statuses are restored before any resource
//! reconciles, so a synced owner keeps its identity across restarts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::controller::error::{Error, Result};

struct Claim {
    owner: String,
    lock: Arc<AsyncMutex<()>>,
}

/// Registry of identity claims
#[derive(Default)]
pub struct IdentityRegistry {
    claims: Mutex<HashMap<String, Claim>>,
}

/// Held for the duration of remote calls on one identity
pub struct IdentityGuard {
    pub identity: String,
    _guard: OwnedMutexGuard<()>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<String, Claim>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `identity` for `owner`. Re-claiming by the same owner is a no-op.
    pub fn claim(&self, identity: &str, owner: &str) -> Result<()> {
        self.claim_lock(identity, owner).map(|_| ())
    }

    fn claim_lock(&self, identity: &str, owner: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut claims = self.claims();
        match claims.get(identity) {
            Some(claim) if claim.owner != owner => Err(Error::IdentityConflict {
                identity: identity.to_string(),
                owner: claim.owner.clone(),
            }),
            Some(claim) => Ok(claim.lock.clone()),
            None => {
                // The owner's spec now names another identity
                claims.retain(|stale, claim| {
                    let keep = claim.owner != owner;
                    if !keep {
                        debug!(identity = %stale, owner, "dropped superseded claim");
                    }
                    keep
                });
                debug!(identity, owner, "claimed identity");
                let lock = Arc::new(AsyncMutex::new(()));
                claims.insert(
                    identity.to_string(),
                    Claim {
                        owner: owner.to_string(),
                        lock: lock.clone(),
                    },
                );
                Ok(lock)
            }
        }
    }

    /// Restore a claim recorded in a resource's status
    ///
    /// Returns false when another owner already holds the identity.
    pub fn restore(&self, identity: &str, owner: &str) -> bool {
        match self.claim(identity, owner) {
            Ok(()) => true,
            Err(e) => {
                warn!("Not restoring claim for {}: {}", owner, e);
                false
            }
        }
    }

    /// Claim `identity` and wait for exclusive use of it
    pub async fn acquire(&self, identity: &str, owner: &str) -> Result<IdentityGuard> {
        let lock = self.claim_lock(identity, owner)?;
        Ok(IdentityGuard {
            identity: identity.to_string(),
            _guard: lock.lock_owned().await,
        })
    }

    /// Release a claim held by `owner`; claims held by others are untouched
    pub fn release(&self, identity: &str, owner: &str) -> bool {
        let mut claims = self.claims();
        if claims.get(identity).is_some_and(|c| c.owner == owner) {
            claims.remove(identity);
            debug!(identity, owner, "released identity");
            return true;
        }
        false
    }

    /// Current owner of an identity
    pub fn owner(&self, identity: &str) -> Option<String> {
        self.claims().get(identity).map(|c| c.owner.clone())
    }

    pub fn len(&self) -> usize {
        self.claims().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owner key for a namespaced custom resource
pub fn owner_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", kind, namespace, name)
}
