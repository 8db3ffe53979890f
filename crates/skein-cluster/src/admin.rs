//! Read-only admin snapshots and queue garbage collection
//!
//! All snapshots are produced on the dispatcher, so they are internally
//! consistent point-in-time views.

use crate::helper::ClusterQueueHelper;
use serde::Serialize;
use skein_protocol::NodeId;
use std::time::Instant;
use tracing::{error, info};

/// Snapshot of one substream
#[derive(Debug, Clone, Serialize)]
pub struct SubStreamSnapshot {
    pub app_id: String,
    pub upstream_sub_queue_id: u32,
    pub state: String,
    pub read_count: i32,
    pub write_count: i32,
    pub pending_close_requests: usize,
}

/// Snapshot of one queue and its metadata
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfoSnapshot {
    pub uri: String,
    pub queue_id: u32,
    pub partition_id: Option<u32>,
    pub storage_key: Option<u64>,
    pub is_local: Option<bool>,
    pub num_handles: u32,
    pub in_flight: u32,
    pub pending_opens: usize,
    pub substreams: Vec<SubStreamSnapshot>,
}

/// Snapshot of the helper's own state
#[derive(Debug, Clone, Serialize)]
pub struct HelperStateSnapshot {
    pub node: NodeId,
    pub is_proxy: bool,
    pub is_leader: bool,
    pub num_queues: usize,
    pub pending_reopen_requests: usize,
    pub stop_peers: Vec<NodeId>,
    pub shutdown_v2_enabled: bool,
}

impl ClusterQueueHelper {
    /// Information about every queue currently known
    pub(crate) fn load_queues_info(&self) -> Vec<QueueInfoSnapshot> {
        let mut out = Vec::with_capacity(self.registry.len());
        self.registry.for_each(|context| {
            let substreams = context
                .live
                .substreams
                .values()
                .map(|s| SubStreamSnapshot {
                    app_id: s.app_id.clone(),
                    upstream_sub_queue_id: s.upstream_sub_queue_id,
                    state: format!("{:?}", s.state),
                    read_count: s.parameters.read_count,
                    write_count: s.parameters.write_count,
                    pending_close_requests: s.pending_close_requests.len(),
                })
                .collect();
            out.push(QueueInfoSnapshot {
                uri: context.uri().as_str().to_string(),
                queue_id: context.live.id,
                partition_id: context.partition_id(),
                storage_key: context.storage_key(),
                is_local: context.live.queue.as_ref().map(|q| q.is_local()),
                num_handles: context.live.num_handles,
                in_flight: context.live.in_flight_count(),
                pending_opens: context.live.pending.len(),
                substreams,
            });
        });
        out.sort_by(|a, b| a.uri.cmp(&b.uri));
        out
    }

    /// Internal state dump
    pub(crate) fn load_state(&self) -> HelperStateSnapshot {
        HelperStateSnapshot {
            node: self.topology.self_node.clone(),
            is_proxy: self.topology.role.is_proxy(),
            is_leader: self.topology.is_self_leader(),
            num_queues: self.registry.len(),
            pending_reopen_requests: self.pending_reopens.len(),
            stop_peers: self.stop_contexts.keys().cloned().collect(),
            shutdown_v2_enabled: self
                .shutdown_v2_enabled
                .load(std::sync::atomic::Ordering::Acquire),
        }
    }

    /// Garbage-collect expired queues. With `immediate` the eligible queues
    /// are deleted now; otherwise they are marked and deleted by the next
    /// sweep. Returns the number of queues deleted.
    pub(crate) fn gc_expired_queues(
        &mut self,
        immediate: bool,
        domain_filter: Option<&str>,
    ) -> usize {
        let now = Instant::now();
        let eligible = self.registry.gc_eligible(now, domain_filter);
        let mut deleted = 0;

        for uri in eligible {
            self.maybe_raise_primary_leader_alarm(&uri);

            let marked = self
                .registry
                .get(&uri)
                .map(|c| c.gc_marked)
                .unwrap_or(false);

            if immediate || marked {
                self.delete_queue(&uri);
                deleted += 1;
            } else if let Some(context) = self.registry.get_mut(&uri) {
                context.gc_marked = true;
            }
        }

        if deleted > 0 {
            info!(deleted, "garbage-collected expired queues");
        }
        deleted
    }

    /// When an expired queue's partition shows a primary that is not the
    /// leader this node believes in, something is off in the cluster view;
    /// alarm once.
    fn maybe_raise_primary_leader_alarm(&mut self, uri: &crate::uri::QueueUri) {
        if self.primary_not_leader_alarm_raised || self.topology.role.is_proxy() {
            return;
        }
        let Some(partition) = self.partition_of(uri) else {
            return;
        };
        let Some(info) = self.topology.partition(partition) else {
            return;
        };
        let disagree = match (&info.primary, &self.topology.leader) {
            (Some(primary), Some(leader)) => primary != leader,
            _ => false,
        };
        if disagree {
            self.primary_not_leader_alarm_raised = true;
            error!(
                uri = %uri,
                partition,
                primary = ?info.primary,
                leader = ?self.topology.leader,
                "expired queue with diverging primary and leader view"
            );
        }
    }
}
