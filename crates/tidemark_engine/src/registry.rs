//! Active replication bookkeeping.
//!
//! Two replication states running against the same identifier would
//! race on the same checkpoint slots, so the identifier is claimed here
//! before any I/O starts. The registry is an explicit, process-owned
//! value, not a hidden singleton; whoever owns the runtime owns it.

use crate::error::{ReplicationError, ReplicationResult};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Tracks which replication identifiers are currently active.
#[derive(Debug, Clone, Default)]
pub struct ReplicationRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl ReplicationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims an identifier for the lifetime of the returned guard.
    ///
    /// Fails with a configuration error if the identifier is already
    /// active in this registry.
    pub fn claim(&self, identifier: &str) -> ReplicationResult<RegistryGuard> {
        let mut active = self.active.lock();
        if !active.insert(identifier.to_owned()) {
            return Err(ReplicationError::Configuration(format!(
                "replication identifier {identifier:?} is already active"
            )));
        }
        Ok(RegistryGuard {
            identifier: identifier.to_owned(),
            active: Arc::clone(&self.active),
        })
    }

    /// Returns true while the identifier is claimed.
    pub fn is_active(&self, identifier: &str) -> bool {
        self.active.lock().contains(identifier)
    }

    /// Returns the number of active replications.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// Releases its identifier when dropped.
#[derive(Debug)]
pub struct RegistryGuard {
    identifier: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl RegistryGuard {
    /// The claimed identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.identifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_release() {
        let registry = ReplicationRegistry::new();

        let guard = registry.claim("users-remote1").unwrap();
        assert!(registry.is_active("users-remote1"));
        assert_eq!(registry.active_count(), 1);

        drop(guard);
        assert!(!registry.is_active("users-remote1"));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn duplicate_claim_is_a_configuration_error() {
        let registry = ReplicationRegistry::new();
        let _guard = registry.claim("users").unwrap();

        let err = registry.claim("users").unwrap_err();
        assert!(matches!(err, ReplicationError::Configuration(_)));
    }

    #[test]
    fn identifier_can_be_reclaimed_after_release() {
        let registry = ReplicationRegistry::new();
        drop(registry.claim("users").unwrap());
        assert!(registry.claim("users").is_ok());
    }

    #[test]
    fn cloned_registries_share_state() {
        let registry = ReplicationRegistry::new();
        let clone = registry.clone();

        let _guard = registry.claim("users").unwrap();
        assert!(clone.is_active("users"));
        assert!(clone.claim("users").is_err());
    }
}
