//! Shared control-plane types: status model, handle and stream parameters

use serde::{Deserialize, Serialize};

/// Unique node identifier (human-readable string)
pub type NodeId = String;

/// Queue id value meaning "not yet assigned by the upstream"
pub const UNASSIGNED_QUEUE_ID: u32 = u32::MAX;

/// Substream id value meaning "not yet assigned"
pub const UNASSIGNED_SUB_QUEUE_ID: u32 = u32::MAX;

/// App id used for the default (fan-in) substream of a queue
pub const DEFAULT_APP_ID: &str = "__default";

/// Category of a control-plane status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    /// Operation completed
    #[default]
    Success,
    /// Backpressure: a resource limit was reached upstream
    Limit,
    /// Request was canceled (deadline expired or shutdown)
    Canceled,
    /// The leader rejected the operation; fatal to the requester
    Refused,
    /// Peer does not speak the required protocol revision
    NotSupported,
    /// Queue is not assigned yet; transient
    Unassigned,
    /// No upstream is currently available; transient
    UpstreamUnavailable,
    /// Programming error detected; logged and surfaced as fatal
    Invariant,
    /// Request deadline expired in flight
    Timeout,
    /// Any other failure
    Failed,
}

/// Status carried by every control-plane response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Status {
    pub category: StatusCategory,
    pub code: i32,
    pub message: String,
}

impl Status {
    /// Successful status
    pub fn success() -> Self {
        Self::default()
    }

    pub fn new(category: StatusCategory, code: i32, message: impl Into<String>) -> Self {
        Self {
            category,
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.category == StatusCategory::Success
    }

    /// Whether a retry may succeed without operator intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            StatusCategory::Unassigned
                | StatusCategory::UpstreamUnavailable
                | StatusCategory::Timeout
                | StatusCategory::Canceled
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?} ({})", self.category, self.code)
        } else {
            write!(f, "{:?} ({}): {}", self.category, self.code, self.message)
        }
    }
}

/// Access mode flags requested for a queue handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueueFlags {
    pub reader: bool,
    pub writer: bool,
    pub admin: bool,
}

impl QueueFlags {
    pub fn reader() -> Self {
        Self {
            reader: true,
            ..Default::default()
        }
    }

    pub fn writer() -> Self {
        Self {
            writer: true,
            ..Default::default()
        }
    }
}

/// Identity of a substream: the consumer-group view onto a queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubStreamInfo {
    /// Consumer-group application id
    pub app_id: String,
    /// Substream id assigned by the downstream requester
    pub sub_queue_id: u32,
}

impl Default for SubStreamInfo {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            sub_queue_id: 0,
        }
    }
}

/// Parameters describing one queue handle (counted access to a queue)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHandleParameters {
    /// Canonical queue uri
    pub uri: String,
    pub flags: QueueFlags,
    pub read_count: i32,
    pub write_count: i32,
    pub admin_count: i32,
    /// Substream this handle attaches to; `None` means the default substream
    pub sub_stream: Option<SubStreamInfo>,
}

impl QueueHandleParameters {
    pub fn new(uri: impl Into<String>, flags: QueueFlags) -> Self {
        Self {
            uri: uri.into(),
            flags,
            read_count: i32::from(flags.reader),
            write_count: i32::from(flags.writer),
            admin_count: i32::from(flags.admin),
            sub_stream: None,
        }
    }

    pub fn with_sub_stream(mut self, info: SubStreamInfo) -> Self {
        self.sub_stream = Some(info);
        self
    }

    /// App id of the substream this handle attaches to
    pub fn app_id(&self) -> &str {
        self.sub_stream
            .as_ref()
            .map_or(DEFAULT_APP_ID, |s| s.app_id.as_str())
    }
}

/// Consumer stream parameters negotiated with the upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParameters {
    pub app_id: String,
    pub sub_queue_id: u32,
    pub max_unconfirmed_messages: u64,
    pub max_unconfirmed_bytes: u64,
    pub consumer_priority: i32,
    pub consumer_priority_count: i32,
}

impl StreamParameters {
    pub fn new(app_id: impl Into<String>, sub_queue_id: u32) -> Self {
        Self {
            app_id: app_id.into(),
            sub_queue_id,
            max_unconfirmed_messages: 1024,
            max_unconfirmed_bytes: 32 * 1024 * 1024,
            consumer_priority: 1,
            consumer_priority_count: 1,
        }
    }

    /// The zero-consumer-priority form used to stop the upstream from
    /// pushing to this node during shutdown drainage.
    pub fn deconfigure(app_id: impl Into<String>, sub_queue_id: u32) -> Self {
        Self {
            app_id: app_id.into(),
            sub_queue_id,
            max_unconfirmed_messages: 0,
            max_unconfirmed_bytes: 0,
            consumer_priority: 0,
            consumer_priority_count: 0,
        }
    }

    /// True when these parameters carry no consumer interest
    pub fn is_deconfigured(&self) -> bool {
        self.consumer_priority_count == 0
    }
}

/// Routing behavior of a queue, decided by the primary and validated by
/// every downstream node on (re)open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoutingConfiguration {
    pub flags: u64,
}

impl RoutingConfiguration {
    pub const AT_MOST_ONCE: u64 = 1 << 0;
    pub const DELIVER_CONSUMER_PRIORITY: u64 = 1 << 1;

    pub fn at_most_once(&self) -> bool {
        self.flags & Self::AT_MOST_ONCE != 0
    }

    pub fn deliver_consumer_priority(&self) -> bool {
        self.flags & Self::DELIVER_CONSUMER_PRIORITY != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(Status::success().is_success());
        assert!(Status::new(StatusCategory::Timeout, 0, "").is_transient());
        assert!(Status::new(StatusCategory::Unassigned, 0, "").is_transient());
        assert!(!Status::new(StatusCategory::Refused, -1, "rejected").is_transient());
        assert!(!Status::new(StatusCategory::Limit, 0, "").is_transient());
    }

    #[test]
    fn test_handle_parameters_counts() {
        let params = QueueHandleParameters::new("skein://acme/orders", QueueFlags::reader());
        assert_eq!(params.read_count, 1);
        assert_eq!(params.write_count, 0);
        assert_eq!(params.app_id(), DEFAULT_APP_ID);

        let params = params.with_sub_stream(SubStreamInfo {
            app_id: "billing".into(),
            sub_queue_id: 3,
        });
        assert_eq!(params.app_id(), "billing");
    }

    #[test]
    fn test_deconfigure_parameters() {
        let params = StreamParameters::deconfigure("billing", 3);
        assert!(params.is_deconfigured());
        assert_eq!(params.consumer_priority, 0);
        assert_eq!(params.max_unconfirmed_messages, 0);

        assert!(!StreamParameters::new("billing", 3).is_deconfigured());
    }

    #[test]
    fn test_routing_configuration_flags() {
        let mut cfg = RoutingConfiguration::default();
        assert!(!cfg.at_most_once());
        cfg.flags |= RoutingConfiguration::AT_MOST_ONCE;
        assert!(cfg.at_most_once());
        assert!(!cfg.deliver_consumer_priority());
    }
}
