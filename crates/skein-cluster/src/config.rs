//! Queue helper configuration

use serde::{Deserialize, Serialize};
use skein_protocol::NodeId;
use std::time::Duration;

/// Fraction of the queue-id space at which a monitoring alarm is logged
pub const QUEUE_ID_ALARM_THRESHOLDS: [f64; 2] = [0.6, 0.8];

/// Configuration of the cluster queue helper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    /// This node's identifier
    pub node_id: NodeId,

    /// Number of storage partitions in the cluster
    pub partition_count: u32,

    /// Deadline for open-queue requests
    pub open_timeout: Duration,

    /// Deadline for configure-stream requests
    pub configure_timeout: Duration,

    /// Deadline for close-queue requests
    pub close_timeout: Duration,

    /// Deadline for queue-assignment requests sent to the leader
    pub assignment_timeout: Duration,

    /// Budget for the whole stop handshake with one peer
    pub stop_timeout: Duration,

    /// Tick interval while waiting for consumer confirmations during drain
    pub unconfirmed_tick: Duration,

    /// Maximum reopen attempts per substream after failover
    pub reopen_max_attempts: u32,

    /// Base delay between reopen attempts (multiplied by the attempt number)
    pub reopen_retry_backoff: Duration,

    /// How long an unused queue lingers before it is eligible for gc
    pub queue_expiration: Duration,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            node_id: "standalone".to_string(),
            partition_count: 4,
            open_timeout: Duration::from_secs(30),
            configure_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(30),
            assignment_timeout: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(10),
            unconfirmed_tick: Duration::from_secs(1),
            reopen_max_attempts: 3,
            reopen_retry_backoff: Duration::from_millis(500),
            queue_expiration: Duration::from_secs(60),
        }
    }
}

impl HelperConfig {
    pub fn new(node_id: impl Into<NodeId>, partition_count: u32) -> Self {
        Self {
            node_id: node_id.into(),
            partition_count,
            ..Default::default()
        }
    }

    /// Tight deadlines for tests
    pub fn for_tests(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            partition_count: 4,
            open_timeout: Duration::from_millis(250),
            configure_timeout: Duration::from_millis(250),
            close_timeout: Duration::from_millis(250),
            assignment_timeout: Duration::from_millis(250),
            stop_timeout: Duration::from_millis(200),
            unconfirmed_tick: Duration::from_millis(20),
            reopen_max_attempts: 2,
            reopen_retry_backoff: Duration::from_millis(10),
            queue_expiration: Duration::from_millis(50),
        }
    }
}
