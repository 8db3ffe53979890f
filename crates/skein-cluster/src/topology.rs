//! Cluster topology view
//!
//! The queue helper never runs elections or primary assignment itself; it
//! consumes the results through observer callbacks and keeps this local view
//! of who the leader is, which node is primary for each partition, and what
//! role this node plays. The restorer and the assignment coordinator consult
//! the view instead of scattering role checks.

use serde::{Deserialize, Serialize};
use skein_protocol::NodeId;

/// Role this node plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterRole {
    /// Remote-cluster proxy: every queue is forwarded to the active upstream
    /// node, which is the elected leader of the remote cluster.
    Proxy,
    /// Cluster member: queues live on partitions; requests go to the
    /// partition primary.
    Member { is_leader: bool },
}

impl ClusterRole {
    pub fn is_proxy(&self) -> bool {
        matches!(self, ClusterRole::Proxy)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, ClusterRole::Member { is_leader: true })
    }
}

/// Status of the elected leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LeaderStatus {
    /// No leader, or leader not yet usable
    #[default]
    Undefined,
    /// Leader elected but still syncing cluster state
    Passive,
    /// Leader fully active
    Active,
}

/// Status of a partition primary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PrimaryStatus {
    #[default]
    Passive,
    Active,
}

/// Health of a node as reported by membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeStatus {
    #[default]
    Unknown,
    Starting,
    Available,
    Stopping,
}

/// Per-partition primary information
#[derive(Debug, Clone, Default)]
pub struct PartitionInfo {
    pub primary: Option<NodeId>,
    pub status: PrimaryStatus,
    /// Primary lease id; bumped every time the primary changes. Used as the
    /// generation count for member-cluster requests.
    pub lease: u64,
}

/// Local view of cluster leadership and partition primaries
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    pub role: ClusterRole,
    pub self_node: NodeId,
    pub self_status: NodeStatus,

    pub leader: Option<NodeId>,
    pub leader_status: LeaderStatus,
    /// Elector term; the generation count for proxy-cluster requests
    pub leader_term: u64,

    pub partitions: Vec<PartitionInfo>,

    /// Active upstream node of a proxy; `None` for members (they use the
    /// per-partition primary instead).
    pub active_upstream: Option<NodeId>,
}

impl ClusterTopology {
    pub fn new_member(self_node: NodeId, partition_count: u32) -> Self {
        Self {
            role: ClusterRole::Member { is_leader: false },
            self_node,
            self_status: NodeStatus::Unknown,
            leader: None,
            leader_status: LeaderStatus::Undefined,
            leader_term: 0,
            partitions: vec![PartitionInfo::default(); partition_count as usize],
            active_upstream: None,
        }
    }

    pub fn new_proxy(self_node: NodeId) -> Self {
        Self {
            role: ClusterRole::Proxy,
            self_node,
            self_status: NodeStatus::Unknown,
            leader: None,
            leader_status: LeaderStatus::Undefined,
            leader_term: 0,
            partitions: Vec::new(),
            active_upstream: None,
        }
    }

    /// True when the cluster has a fully active leader
    pub fn has_active_leader(&self) -> bool {
        self.leader.is_some() && self.leader_status == LeaderStatus::Active
    }

    /// True when this node is the leader of a member cluster
    pub fn is_self_leader(&self) -> bool {
        self.role.is_leader()
    }

    pub fn partition(&self, partition_id: u32) -> Option<&PartitionInfo> {
        self.partitions.get(partition_id as usize)
    }

    /// True when the partition has an active primary, optionally excluding
    /// `other_than` (used to skip a stopping peer).
    pub fn has_active_available_primary(
        &self,
        partition_id: u32,
        other_than: Option<&NodeId>,
    ) -> bool {
        let Some(info) = self.partition(partition_id) else {
            return false;
        };
        match &info.primary {
            Some(primary) if Some(primary) != other_than => {
                info.status == PrimaryStatus::Active
            }
            _ => false,
        }
    }

    /// True when this node is the active primary for `partition_id` and is
    /// itself available.
    pub fn is_self_available_primary(&self, partition_id: u32) -> bool {
        if self.self_status != NodeStatus::Available {
            return false;
        }
        self.partition(partition_id).is_some_and(|info| {
            info.primary.as_ref() == Some(&self.self_node) && info.status == PrimaryStatus::Active
        })
    }

    /// Next-hop node and generation count for requests concerning
    /// `partition_id`: the active upstream (with the elector term) for a
    /// proxy, the partition primary (with its lease) for a member.
    pub fn upstream_and_generation(&self, partition_id: u32) -> Option<(NodeId, u64)> {
        if self.role.is_proxy() {
            let upstream = self.active_upstream.clone().or_else(|| {
                self.has_active_leader().then(|| self.leader.clone()).flatten()
            })?;
            return Some((upstream, self.leader_term));
        }

        let info = self.partition(partition_id)?;
        if info.status != PrimaryStatus::Active {
            return None;
        }
        info.primary.clone().map(|primary| (primary, info.lease))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> ClusterTopology {
        let mut topology = ClusterTopology::new_member("node-1".to_string(), 4);
        topology.self_status = NodeStatus::Available;
        topology
    }

    #[test]
    fn test_active_primary_checks() {
        let mut topology = member();
        assert!(!topology.has_active_available_primary(2, None));

        topology.partitions[2] = PartitionInfo {
            primary: Some("node-2".to_string()),
            status: PrimaryStatus::Active,
            lease: 5,
        };
        assert!(topology.has_active_available_primary(2, None));
        assert!(!topology.has_active_available_primary(2, Some(&"node-2".to_string())));

        assert_eq!(
            topology.upstream_and_generation(2),
            Some(("node-2".to_string(), 5))
        );
    }

    #[test]
    fn test_self_available_primary() {
        let mut topology = member();
        topology.partitions[0] = PartitionInfo {
            primary: Some("node-1".to_string()),
            status: PrimaryStatus::Active,
            lease: 1,
        };
        assert!(topology.is_self_available_primary(0));

        topology.self_status = NodeStatus::Stopping;
        assert!(!topology.is_self_available_primary(0));
    }

    #[test]
    fn test_proxy_upstream_is_leader() {
        let mut topology = ClusterTopology::new_proxy("proxy-1".to_string());
        assert_eq!(topology.upstream_and_generation(0), None);

        topology.leader = Some("node-9".to_string());
        topology.leader_status = LeaderStatus::Active;
        topology.leader_term = 12;
        assert_eq!(
            topology.upstream_and_generation(7),
            Some(("node-9".to_string(), 12))
        );
    }

    #[test]
    fn test_passive_primary_has_no_upstream() {
        let mut topology = member();
        topology.partitions[1] = PartitionInfo {
            primary: Some("node-3".to_string()),
            status: PrimaryStatus::Passive,
            lease: 2,
        };
        assert_eq!(topology.upstream_and_generation(1), None);
    }
}
