//! Cluster-state observer surface
//!
//! The replication/elector subsystem owns cluster state; the queue helper
//! only observes it. Observers are registered as non-owning capabilities
//! (`Arc<dyn ClusterStateObserver>` in a plain list) so no ownership cycle
//! forms between the state subsystem and the helper.

use crate::topology::{LeaderStatus, NodeStatus, PrimaryStatus};
use crate::uri::QueueUri;
use skein_protocol::NodeId;
use std::collections::HashMap;
use std::sync::Arc;

/// Cluster-state record for an assigned queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAssignmentInfo {
    pub uri: QueueUri,
    pub queue_id: u32,
    pub partition_id: u32,
    pub storage_key: u64,
    /// App id to app key, one entry per registered consumer group
    pub app_keys: HashMap<String, u64>,
}

/// Observer of cluster-state transitions.
///
/// All callbacks are posted onto the observing component's own executor by
/// the implementation; the state subsystem never blocks on an observer.
pub trait ClusterStateObserver: Send + Sync {
    /// A queue was assigned to a partition (leader advisory reached this node)
    fn on_queue_assigned(&self, info: QueueAssignmentInfo);

    /// A queue was unassigned from the cluster
    fn on_queue_unassigned(&self, info: QueueAssignmentInfo);

    /// App ids were added to / removed from a queue, or from a whole domain
    /// when `uri` is `None`.
    fn on_queue_updated(
        &self,
        uri: Option<QueueUri>,
        domain: String,
        added: Vec<String>,
        removed: Vec<String>,
    );

    /// The cluster leader changed; `None` means no leader
    fn on_cluster_leader(&self, node: Option<NodeId>, status: LeaderStatus, term: u64);

    /// The primary for a partition changed; `None` means no primary
    fn after_partition_primary_assignment(
        &self,
        partition_id: u32,
        primary: Option<NodeId>,
        status: PrimaryStatus,
        lease: u64,
    );

    /// This node's own membership status changed
    fn on_self_node_status(&self, status: NodeStatus);
}

/// Registration list for observers; dispatch fans out in registration order
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Vec<Arc<dyn ClusterStateObserver>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn ClusterStateObserver>) {
        self.observers.push(observer);
    }

    pub fn for_each(&self, mut f: impl FnMut(&dyn ClusterStateObserver)) {
        for observer in &self.observers {
            f(observer.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

/// Leader-side publication surface of the cluster-state subsystem.
///
/// The leader decides assignments locally, publishes them here, and then
/// reacts to the resulting `on_queue_assigned` broadcast exactly like a
/// replica would.
pub trait ClusterStatePublisher: Send + Sync {
    fn publish_assignment(&self, info: QueueAssignmentInfo);
    fn publish_unassignment(&self, info: QueueAssignmentInfo);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl ClusterStateObserver for Counting {
        fn on_queue_assigned(&self, _info: QueueAssignmentInfo) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
        fn on_queue_unassigned(&self, _info: QueueAssignmentInfo) {}
        fn on_queue_updated(
            &self,
            _uri: Option<QueueUri>,
            _domain: String,
            _added: Vec<String>,
            _removed: Vec<String>,
        ) {
        }
        fn on_cluster_leader(&self, _node: Option<NodeId>, _status: LeaderStatus, _term: u64) {}
        fn after_partition_primary_assignment(
            &self,
            _partition_id: u32,
            _primary: Option<NodeId>,
            _status: PrimaryStatus,
            _lease: u64,
        ) {
        }
        fn on_self_node_status(&self, _status: NodeStatus) {}
    }

    #[test]
    fn test_registry_fan_out() {
        let mut registry = ObserverRegistry::new();
        let a = Arc::new(Counting(AtomicUsize::new(0)));
        let b = Arc::new(Counting(AtomicUsize::new(0)));
        registry.register(a.clone());
        registry.register(b.clone());
        assert_eq!(registry.len(), 2);

        let info = QueueAssignmentInfo {
            uri: QueueUri::parse("skein://acme/orders").unwrap(),
            queue_id: 7,
            partition_id: 3,
            storage_key: 0xfeed,
            app_keys: HashMap::new(),
        };
        registry.for_each(|observer| observer.on_queue_assigned(info.clone()));

        assert_eq!(a.0.load(Ordering::Relaxed), 1);
        assert_eq!(b.0.load(Ordering::Relaxed), 1);
    }
}
