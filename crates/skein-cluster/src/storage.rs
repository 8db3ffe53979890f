//! Storage manager boundary
//!
//! The file store and payload I/O are external. The helper consults the
//! storage manager only to validate partition ownership and to provision
//! backing storage when it builds a local (primary-side) queue.

use skein_protocol::Status;

/// Storage-side view of partition leases and local queue provisioning
pub trait StorageManager: Send + Sync {
    /// Whether this node currently holds storage for `partition_id`
    fn has_partition(&self, partition_id: u32) -> bool;

    /// Provision backing storage for a local queue. Called on the dispatcher
    /// before the queue object is handed out; must be cheap (real file
    /// creation is deferred inside the store).
    fn provision_queue(&self, uri: &str, partition_id: u32, storage_key: u64) -> Result<(), Status>;
}

/// Storage manager that accepts every partition; used by proxies (which
/// never host storage) and by tests.
#[derive(Debug, Default)]
pub struct NullStorageManager;

impl StorageManager for NullStorageManager {
    fn has_partition(&self, _partition_id: u32) -> bool {
        true
    }

    fn provision_queue(
        &self,
        _uri: &str,
        _partition_id: u32,
        _storage_key: u64,
    ) -> Result<(), Status> {
        Ok(())
    }
}
