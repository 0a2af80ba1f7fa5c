//! Client construction and the single-slot client holder.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use stowage_access::GatewayCredential;

use crate::error::{BrowserError, BrowserResult};
use crate::store::ObjectStore;

/// Builds a signed object store client for a credential triple.
///
/// A client's signing key is fixed at construction, so every credential
/// change requires a new client.
pub trait ClientFactory: Send + Sync + fmt::Debug {
    /// Build a client bound to `credential`.
    fn build(&self, credential: &GatewayCredential) -> BrowserResult<Arc<dyn ObjectStore>>;
}

/// Holds the current client of one session.
///
/// Rotation swaps the `Arc`; callers take a snapshot with [`ClientSlot::get`]
/// and keep using it even if the slot is swapped mid-call.
#[derive(Clone, Default)]
pub struct ClientSlot {
    inner: Arc<RwLock<Option<Arc<dyn ObjectStore>>>>,
}

impl fmt::Debug for ClientSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSlot")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl ClientSlot {
    /// An empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current client.
    pub fn get(&self) -> BrowserResult<Arc<dyn ObjectStore>> {
        self.inner
            .read()
            .clone()
            .ok_or(BrowserError::UninitializedClient)
    }

    /// Replace the current client.
    pub fn replace(&self, client: Arc<dyn ObjectStore>) {
        *self.inner.write() = Some(client);
    }

    /// Drop the current client.
    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    /// Whether a client is present.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryGateway;

    #[test]
    fn test_should_report_uninitialized_client() {
        let slot = ClientSlot::new();
        assert!(matches!(slot.get(), Err(BrowserError::UninitializedClient)));
    }

    #[test]
    fn test_should_keep_snapshot_across_rotation() {
        let gateway = MemoryGateway::new();
        let first = gateway.root_store();
        let second = gateway.root_store();

        let slot = ClientSlot::new();
        slot.replace(first.clone());
        let snapshot = slot.get().unwrap();
        slot.replace(second.clone());

        assert!(Arc::ptr_eq(&snapshot, &first));
        assert!(Arc::ptr_eq(&slot.get().unwrap(), &second));

        slot.clear();
        assert!(!slot.is_initialized());
    }
}
