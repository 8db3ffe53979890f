//! Queue objects
//!
//! A `Queue` is the live object shared with every handle holder. The helper
//! creates it lazily on the first successful open and destroys it when the
//! last handle goes away and the expiration deadline fires. Payload I/O is
//! out of scope here; the queue tracks just enough write-side state (pending
//! PUTs and CONFIRMs, unconfirmed PUSHes) to honor the failover and
//! drain contracts: retransmit on restore, NACK on restore failure, report
//! unconfirmed counts to the shutdown drainer.

use crate::uri::QueueUri;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Queue id reserved for strictly-local queues; never enters the id index
pub const LOCAL_QUEUE_ID: u32 = 0;

/// Where the authoritative copy of the queue lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// This node is the primary; operations are served locally
    Local,
    /// Operations are relayed to an upstream node
    Remote,
}

/// Live queue object, shared with handle holders
#[derive(Debug)]
pub struct Queue {
    uri: QueueUri,
    kind: Mutex<QueueKind>,
    /// Upstream queue id; `LOCAL_QUEUE_ID` for strictly-local queues
    id: AtomicU32,
    partition_id: u32,

    /// PUTs accepted but not yet acknowledged by the upstream
    pending_puts: Mutex<Vec<u64>>,
    /// CONFIRMs accepted but not yet relayed upstream
    pending_confirms: Mutex<Vec<u64>>,
    /// PUSHes delivered to consumers and not yet confirmed
    unconfirmed_pushes: AtomicU64,

    /// Messages retransmitted after a successful upstream restore
    retransmitted: AtomicU64,
    /// PUTs NACKed after a failed upstream restore
    nacked: AtomicU64,
    /// Upstream generation this queue last restored against
    upstream_generation: AtomicU64,
}

impl Queue {
    pub fn new_local(uri: QueueUri, partition_id: u32) -> Self {
        Self::new(uri, QueueKind::Local, LOCAL_QUEUE_ID, partition_id)
    }

    pub fn new_remote(uri: QueueUri, id: u32, partition_id: u32) -> Self {
        Self::new(uri, QueueKind::Remote, id, partition_id)
    }

    fn new(uri: QueueUri, kind: QueueKind, id: u32, partition_id: u32) -> Self {
        Self {
            uri,
            kind: Mutex::new(kind),
            id: AtomicU32::new(id),
            partition_id,
            pending_puts: Mutex::new(Vec::new()),
            pending_confirms: Mutex::new(Vec::new()),
            unconfirmed_pushes: AtomicU64::new(0),
            retransmitted: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
            upstream_generation: AtomicU64::new(0),
        }
    }

    pub fn uri(&self) -> &QueueUri {
        &self.uri
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn is_local(&self) -> bool {
        *self.kind.lock() == QueueKind::Local
    }

    /// Convert a remote queue into a local one (this node became primary)
    pub fn convert_to_local(&self) {
        *self.kind.lock() = QueueKind::Local;
        self.id.store(LOCAL_QUEUE_ID, Ordering::Release);
    }

    // ==================== Write-side state ====================

    /// Record a PUT awaiting upstream acknowledgment
    pub fn pend_put(&self, guid: u64) {
        self.pending_puts.lock().push(guid);
    }

    /// Record a CONFIRM awaiting relay upstream
    pub fn pend_confirm(&self, guid: u64) {
        self.pending_confirms.lock().push(guid);
    }

    /// A PUSH was delivered to a consumer
    pub fn push_delivered(&self) {
        self.unconfirmed_pushes.fetch_add(1, Ordering::AcqRel);
    }

    /// A consumer confirmed a delivered PUSH
    pub fn push_confirmed(&self) {
        let previous = self.unconfirmed_pushes.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "confirm without matching delivery");
    }

    /// Number of delivered-but-unconfirmed PUSHes; the shutdown drainer
    /// waits on this before closing.
    pub fn unconfirmed_messages(&self) -> u64 {
        self.unconfirmed_pushes.load(Ordering::Acquire)
    }

    // ==================== Restore notifications ====================

    /// The upstream was restored at `generation`. Pending PUTs and CONFIRMs
    /// are retransmitted; with `writer_only` the read side had no state to
    /// restore and only the write side resumes.
    pub fn on_upstream_restored(&self, generation: u64, writer_only: bool) {
        self.upstream_generation.store(generation, Ordering::Release);

        let puts = std::mem::take(&mut *self.pending_puts.lock());
        let confirms = if writer_only {
            Vec::new()
        } else {
            std::mem::take(&mut *self.pending_confirms.lock())
        };
        let count = (puts.len() + confirms.len()) as u64;
        if count > 0 {
            self.retransmitted.fetch_add(count, Ordering::AcqRel);
            tracing::debug!(
                uri = %self.uri,
                generation,
                puts = puts.len(),
                confirms = confirms.len(),
                "retransmitting after upstream restore"
            );
        }
    }

    /// The upstream could not be restored; pending PUTs are NACKed back to
    /// their producers.
    pub fn on_upstream_lost(&self) {
        let puts = std::mem::take(&mut *self.pending_puts.lock());
        if !puts.is_empty() {
            self.nacked.fetch_add(puts.len() as u64, Ordering::AcqRel);
            tracing::warn!(uri = %self.uri, count = puts.len(), "NACKing pending PUTs");
        }
    }

    pub fn upstream_generation(&self) -> u64 {
        self.upstream_generation.load(Ordering::Acquire)
    }

    pub fn retransmitted_count(&self) -> u64 {
        self.retransmitted.load(Ordering::Acquire)
    }

    pub fn nacked_count(&self) -> u64 {
        self.nacked.load(Ordering::Acquire)
    }

    /// Pending write-side work (PUTs + CONFIRMs)
    pub fn pending_count(&self) -> usize {
        self.pending_puts.lock().len() + self.pending_confirms.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri() -> QueueUri {
        QueueUri::parse("skein://acme/orders").unwrap()
    }

    #[test]
    fn test_restore_retransmits_pending() {
        let queue = Queue::new_remote(uri(), 7, 3);
        queue.pend_put(1);
        queue.pend_put(2);
        queue.pend_confirm(9);
        assert_eq!(queue.pending_count(), 3);

        queue.on_upstream_restored(4, false);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.retransmitted_count(), 3);
        assert_eq!(queue.upstream_generation(), 4);
        assert_eq!(queue.nacked_count(), 0);
    }

    #[test]
    fn test_writer_only_restore_keeps_confirms() {
        let queue = Queue::new_remote(uri(), 7, 3);
        queue.pend_put(1);
        queue.pend_confirm(9);

        queue.on_upstream_restored(2, true);
        assert_eq!(queue.retransmitted_count(), 1);
        assert_eq!(queue.pending_count(), 1); // the confirm stays
    }

    #[test]
    fn test_restore_failure_nacks_puts() {
        let queue = Queue::new_remote(uri(), 7, 3);
        queue.pend_put(1);
        queue.pend_put(2);

        queue.on_upstream_lost();
        assert_eq!(queue.nacked_count(), 2);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_unconfirmed_push_accounting() {
        let queue = Queue::new_local(uri(), 0);
        queue.push_delivered();
        queue.push_delivered();
        assert_eq!(queue.unconfirmed_messages(), 2);
        queue.push_confirmed();
        assert_eq!(queue.unconfirmed_messages(), 1);
    }

    #[test]
    fn test_convert_to_local() {
        let queue = Queue::new_remote(uri(), 7, 3);
        assert!(!queue.is_local());
        queue.convert_to_local();
        assert!(queue.is_local());
        assert_eq!(queue.id(), LOCAL_QUEUE_ID);
    }
}
