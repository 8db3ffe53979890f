//! Queue assignment coordination
//!
//! Obtains a cluster-wide id, partition, and storage key for each queue.
//! A proxy allocates ids locally once it has an active upstream; a replica
//! asks the leader; the leader decides locally, publishes through the
//! cluster-state subsystem, and reacts to the resulting broadcast exactly
//! like a replica does. Pending opens parked on an unassigned queue are
//! drained in arrival order once the assignment lands.

use crate::config::QUEUE_ID_ALARM_THRESHOLDS;
use crate::helper::{fingerprint, ClusterQueueHelper};
use crate::observer::QueueAssignmentInfo;
use crate::request::RequestOutcome;
use crate::topology::{LeaderStatus, NodeStatus, PrimaryStatus};
use crate::uri::QueueUri;
use skein_protocol::{
    ControlMessage, NodeId, ResponseHeader, Status, StatusCategory, DEFAULT_APP_ID,
    UNASSIGNED_QUEUE_ID,
};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

impl ClusterQueueHelper {
    /// Drive `uri` toward assignment. Idempotent: an already-assigned queue
    /// just drains its pending opens.
    pub(crate) fn assign_queue(&mut self, uri: &QueueUri) {
        if self.is_queue_assigned(uri) {
            self.on_queue_context_assigned(uri);
            return;
        }

        if self.topology.role.is_proxy() {
            // assignment for a proxy is having an active upstream; the id is
            // allocated locally
            if self.topology.has_active_leader() || self.topology.active_upstream.is_some() {
                let id = self.allocate_queue_id();
                if let Some(context) = self.registry.get_mut(uri) {
                    context.live.id = id;
                }
                self.registry.register_id(id, uri);
                debug!(uri = %uri, queue_id = id, "proxy queue assigned");
                self.on_queue_context_assigned(uri);
            } else {
                debug!(uri = %uri, "no active upstream, assignment deferred");
            }
            return;
        }

        if self.topology.is_self_leader() {
            self.assign_queue_as_leader(uri.clone());
        } else {
            self.request_queue_assignment(uri.clone());
        }
    }

    /// Replica side: ask the leader. Concurrent opens on the same uri share
    /// one request.
    fn request_queue_assignment(&mut self, uri: QueueUri) {
        if !self.topology.has_active_leader() {
            debug!(uri = %uri, "no active leader, assignment deferred");
            return;
        }
        if !self.pending_assignments.insert(uri.clone()) {
            debug!(uri = %uri, "assignment request already in flight");
            return;
        }
        let Some(leader) = self.topology.leader.clone() else {
            self.pending_assignments.remove(&uri);
            return;
        };

        let transport = self.transport.clone();
        let dispatcher = self.dispatcher.clone();
        let timeout = self.config.assignment_timeout;
        let request_uri = uri.as_str().to_string();
        let response_uri = uri.clone();
        debug!(uri = %uri, %leader, "requesting queue assignment");
        self.requests.send(
            transport.as_ref(),
            &dispatcher,
            leader,
            timeout,
            move |header| ControlMessage::QueueAssignmentRequest {
                header,
                uri: request_uri,
            },
            Box::new(move |helper, outcome| {
                helper.on_queue_assignment_response(response_uri, outcome);
            }),
        );
    }

    fn on_queue_assignment_response(&mut self, uri: QueueUri, outcome: RequestOutcome) {
        self.pending_assignments.remove(&uri);
        let status = outcome.status();

        if status.is_success() {
            // the leader's broadcast reaches us through `on_queue_assigned`;
            // nothing more to do here
            debug!(uri = %uri, "assignment acknowledged by leader");
            return;
        }

        if status.category == StatusCategory::Refused {
            self.process_rejected_queue_assignment(&uri, status);
            return;
        }

        // transient failure: retry while the queue still has interest and a
        // leader is reachable
        let retry = self
            .registry
            .get(&uri)
            .is_some_and(|c| !c.live.pending.is_empty())
            && !self.is_queue_assigned(&uri)
            && self.topology.has_active_leader();
        if retry {
            debug!(uri = %uri, %status, "assignment failed, retrying");
            self.request_queue_assignment(uri);
        } else {
            debug!(uri = %uri, %status, "assignment failed, waiting for leader");
        }
    }

    /// The leader rejected the assignment: fail every pending open with the
    /// returned status and drop the context.
    pub(crate) fn process_rejected_queue_assignment(&mut self, uri: &QueueUri, status: Status) {
        warn!(uri = %uri, %status, "queue assignment rejected");
        let Some(context) = self.registry.get_mut(uri) else {
            return;
        };
        let pending = std::mem::take(&mut context.live.pending);
        for open in pending {
            open.complete(status.clone(), None);
        }
        self.registry.remove_raw(uri);
    }

    /// Leader side: decide locally and publish. Returns the decided record.
    pub(crate) fn assign_queue_as_leader(&mut self, uri: QueueUri) -> QueueAssignmentInfo {
        if let Some(persisted) = self.registry.get(&uri).and_then(|c| c.persisted.clone()) {
            return persisted;
        }

        let queue_id = self.allocate_queue_id();
        let partition_id = self.choose_partition();
        let mut app_keys = HashMap::new();
        app_keys.insert(DEFAULT_APP_ID.to_string(), fingerprint(DEFAULT_APP_ID));
        let info = QueueAssignmentInfo {
            uri: uri.clone(),
            queue_id,
            partition_id,
            storage_key: fingerprint(uri.as_str()),
            app_keys,
        };

        info!(uri = %uri, queue_id, partition_id, "leader assigned queue");
        match &self.publisher {
            Some(publisher) => publisher.publish_assignment(info.clone()),
            // no cluster-state subsystem wired (standalone): loop back
            None => self.on_queue_assigned(info.clone()),
        }
        info
    }

    /// Allocate the next queue id, alarming when the id space fills up
    pub(crate) fn allocate_queue_id(&mut self) -> u32 {
        let id = self.next_queue_id;
        self.next_queue_id = self.next_queue_id.wrapping_add(1);

        for (slot, threshold) in QUEUE_ID_ALARM_THRESHOLDS.iter().enumerate() {
            let limit = (u32::MAX as f64 * threshold) as u32;
            if id >= limit && !self.queue_id_alarmed[slot] {
                self.queue_id_alarmed[slot] = true;
                error!(
                    queue_id = id,
                    threshold = threshold * 100.0,
                    "queue id space crossed alarm threshold"
                );
            }
        }
        id
    }

    /// Least-loaded partition among those with an active primary; falls
    /// back to round-robin when none is available.
    pub(crate) fn choose_partition(&mut self) -> u32 {
        let candidates: Vec<u32> = (0..self.config.partition_count)
            .filter(|p| self.topology.has_active_available_primary(*p, None))
            .collect();

        if let Some(best) = candidates
            .into_iter()
            .min_by_key(|p| (self.registry.count_for_partition(*p), *p))
        {
            return best;
        }

        let partition = self.next_partition_rr % self.config.partition_count.max(1);
        self.next_partition_rr = self.next_partition_rr.wrapping_add(1);
        partition
    }

    /// Serve a replica's assignment request (leader only)
    pub(crate) fn process_peer_assignment_request(
        &mut self,
        peer: NodeId,
        request_id: u64,
        uri_raw: String,
    ) {
        let respond_error = |helper: &mut Self, status: Status| {
            helper.respond(
                &peer,
                ControlMessage::QueueAssignmentResponse {
                    header: ResponseHeader::with_status(request_id, status),
                    uri: uri_raw.clone(),
                    queue_id: UNASSIGNED_QUEUE_ID,
                    partition_id: 0,
                    storage_key: 0,
                    app_ids: vec![],
                },
            );
        };

        if !self.topology.is_self_leader() {
            respond_error(
                self,
                Status::new(StatusCategory::UpstreamUnavailable, 0, "not the leader"),
            );
            return;
        }
        let uri = match QueueUri::parse(&uri_raw) {
            Ok(uri) => uri,
            Err(error) => {
                respond_error(self, error.to_status());
                return;
            }
        };

        let info = self.assign_queue_as_leader(uri);
        let responder = peer;
        self.respond(
            &responder,
            ControlMessage::QueueAssignmentResponse {
                header: ResponseHeader::success(request_id),
                uri: uri_raw,
                queue_id: info.queue_id,
                partition_id: info.partition_id,
                storage_key: info.storage_key,
                app_ids: info.app_keys.keys().cloned().collect(),
            },
        );
    }

    // ==================== Observer reactions ====================

    /// The cluster-state subsystem recorded an assignment (leader advisory)
    pub(crate) fn on_queue_assigned(&mut self, info: QueueAssignmentInfo) {
        let uri = info.uri.clone();
        self.pending_assignments.remove(&uri);
        let partition_id = info.partition_id;
        debug!(uri = %uri, queue_id = info.queue_id, partition_id, "queue assigned");

        let self_primary = self.topology.is_self_available_primary(partition_id);
        let queue_id = info.queue_id;
        let context = self.registry.get_or_create(&uri);
        context.persisted = Some(info);

        if self_primary {
            // strictly-local queues keep id 0 and stay out of the id index
            context.live.id = crate::queue::LOCAL_QUEUE_ID;
        } else {
            context.live.id = queue_id;
            self.registry.register_id(queue_id, &uri);
        }

        self.on_queue_context_assigned(&uri);
    }

    /// Resume every open parked on assignment, preserving arrival order
    pub(crate) fn on_queue_context_assigned(&mut self, uri: &QueueUri) {
        let Some(context) = self.registry.get_mut(uri) else {
            return;
        };
        let pending = std::mem::take(&mut context.live.pending);
        if pending.is_empty() {
            return;
        }
        debug!(uri = %uri, count = pending.len(), "draining pending opens");
        for open in pending {
            self.process_open_queue_context(open);
        }
    }

    pub(crate) fn on_queue_unassigned(&mut self, info: QueueAssignmentInfo) {
        let uri = info.uri;
        debug!(uri = %uri, "queue unassigned");
        let Some(context) = self.registry.get_mut(&uri) else {
            return;
        };
        for substream in context.live.substreams.values_mut() {
            substream.cancel_unconfirmed_timer();
        }
        let old_id = context.live.id;
        context.persisted = None;
        context.live.reset_but_keep_pending();
        self.registry.unregister_id(old_id);

        if self
            .registry
            .get(&uri)
            .is_some_and(|c| c.can_delete())
        {
            self.registry.remove_raw(&uri);
        }
    }

    pub(crate) fn on_cluster_leader(
        &mut self,
        node: Option<NodeId>,
        status: LeaderStatus,
        term: u64,
    ) {
        info!(leader = ?node, ?status, term, "cluster leader changed");
        let is_self = node.as_deref() == Some(self.topology.self_node.as_str());
        self.topology.leader = node;
        self.topology.leader_status = status;
        self.topology.leader_term = term;
        if let crate::topology::ClusterRole::Member { is_leader } = &mut self.topology.role {
            *is_leader = is_self;
        }

        if status != LeaderStatus::Active {
            return;
        }

        if self.topology.role.is_proxy() {
            // the leader is the proxy's upstream; replay everything
            self.restore_state(None);
        } else {
            self.on_leader_available();
        }
    }

    /// Re-drive assignment for every queue still waiting on one
    pub(crate) fn on_leader_available(&mut self) {
        for uri in self.registry.uris() {
            let has_pending = self
                .registry
                .get(&uri)
                .is_some_and(|c| !c.live.pending.is_empty());
            if has_pending && !self.is_queue_assigned(&uri) {
                self.assign_queue(&uri);
            }
        }
    }

    pub(crate) fn after_partition_primary_assignment(
        &mut self,
        partition_id: u32,
        primary: Option<NodeId>,
        status: PrimaryStatus,
        lease: u64,
    ) {
        info!(partition_id, primary = ?primary, ?status, lease, "partition primary changed");
        let became_self =
            primary.as_deref() == Some(self.topology.self_node.as_str()) && status == PrimaryStatus::Active;
        if let Some(info) = self.topology.partitions.get_mut(partition_id as usize) {
            info.primary = primary;
            info.status = status;
            info.lease = lease;
        } else {
            warn!(partition_id, "primary assignment for unknown partition");
            return;
        }

        if became_self {
            self.convert_partition_to_local(partition_id);
        }
        if status == PrimaryStatus::Active {
            self.restore_state(Some(partition_id));
        }
    }

    pub(crate) fn on_self_node_status(&mut self, status: NodeStatus) {
        info!(?status, "self node status changed");
        self.topology.self_status = status;
        if status == NodeStatus::Available {
            self.restore_state(None);
        }
    }

    /// This node became primary for `partition_id`: convert the affected
    /// queues to local and reprocess their pending opens through the local
    /// path.
    pub(crate) fn convert_partition_to_local(&mut self, partition_id: u32) {
        for uri in self.registry.uris() {
            let Some(context) = self.registry.get_mut(&uri) else {
                continue;
            };
            if context.partition_id() != Some(partition_id) {
                continue;
            }

            let old_id = context.live.id;
            context.live.id = crate::queue::LOCAL_QUEUE_ID;
            if let Some(queue) = &context.live.queue {
                queue.convert_to_local();
            }
            self.registry.unregister_id(old_id);
            info!(uri = %uri, "queue converted to local");

            self.on_queue_context_assigned(&uri);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::PartitionInfo;

    // choose_partition and next_queue_id are exercised through the helper in
    // the integration tests; the pure pieces are checked here.

    #[test]
    fn test_alarm_thresholds_are_ordered() {
        assert!(QUEUE_ID_ALARM_THRESHOLDS[0] < QUEUE_ID_ALARM_THRESHOLDS[1]);
    }

    #[test]
    fn test_partition_preference_prefers_active_primary() {
        let mut topology = crate::topology::ClusterTopology::new_member("node-1".to_string(), 3);
        topology.partitions[1] = PartitionInfo {
            primary: Some("node-2".to_string()),
            status: PrimaryStatus::Active,
            lease: 1,
        };
        assert!(topology.has_active_available_primary(1, None));
        assert!(!topology.has_active_available_primary(0, None));
    }
}
