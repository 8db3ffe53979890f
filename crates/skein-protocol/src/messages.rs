//! Control messages exchanged between cluster nodes

use crate::error::{ProtocolError, Result};
use crate::types::{
    NodeId, QueueHandleParameters, RoutingConfiguration, Status, StreamParameters,
};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum control message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Request header included in all requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Protocol version
    pub version: u16,
    /// Correlation id for matching responses
    pub request_id: u64,
    /// Source node id
    pub source: NodeId,
    /// Request timeout
    pub timeout_ms: u32,
}

impl RequestHeader {
    pub fn new(request_id: u64, source: NodeId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id,
            source,
            timeout_ms: 30_000,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u32;
        self
    }

    /// Validate that the protocol version is supported
    pub fn validate_version(&self) -> Result<()> {
        if self.version == 0 || self.version > PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                actual: self.version,
                supported: PROTOCOL_VERSION,
            });
        }
        Ok(())
    }
}

/// Response header included in all responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Correlation id matching the request
    pub request_id: u64,
    pub status: Status,
}

impl ResponseHeader {
    pub fn success(request_id: u64) -> Self {
        Self {
            request_id,
            status: Status::success(),
        }
    }

    pub fn with_status(request_id: u64, status: Status) -> Self {
        Self { request_id, status }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Revision of the graceful-shutdown handshake a peer speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StopVersion {
    /// Per-substream unconfirmed-wait timers on the draining side
    #[default]
    V1,
    /// Single absolute-deadline drain loop; requires every node to support it
    V2,
}

/// Control messages exchanged between cluster nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)] // protocol enums are short-lived
pub enum ControlMessage {
    // ==================== Queue lifecycle ====================
    /// Open a queue upstream. `is_reopen` marks failover replays, whose
    /// responses are paired with a follow-up configure.
    OpenQueueRequest {
        header: RequestHeader,
        handle_parameters: QueueHandleParameters,
        queue_id: u32,
        is_reopen: bool,
    },

    OpenQueueResponse {
        header: ResponseHeader,
        queue_id: u32,
        routing_configuration: RoutingConfiguration,
        deduplication_time_ms: u32,
    },

    /// (Re)negotiate consumer stream parameters for one substream
    ConfigureQueueStreamRequest {
        header: RequestHeader,
        queue_id: u32,
        stream_parameters: StreamParameters,
    },

    ConfigureQueueStreamResponse {
        header: ResponseHeader,
        queue_id: u32,
        stream_parameters: StreamParameters,
    },

    /// Release counted access to a queue. `is_final` is set when the
    /// releasing node no longer references the substream.
    CloseQueueRequest {
        header: RequestHeader,
        queue_id: u32,
        handle_parameters: QueueHandleParameters,
        is_final: bool,
    },

    CloseQueueResponse {
        header: ResponseHeader,
        queue_id: u32,
    },

    // ==================== Assignment ====================
    /// Replica asking the leader to assign a queue to a partition
    QueueAssignmentRequest {
        header: RequestHeader,
        uri: String,
    },

    QueueAssignmentResponse {
        header: ResponseHeader,
        uri: String,
        queue_id: u32,
        partition_id: u32,
        storage_key: u64,
        app_ids: Vec<String>,
    },

    // ==================== Graceful shutdown ====================
    /// Peer announcing it is stopping; the receiver drains every queue
    /// whose upstream is that peer, then responds.
    StopRequest {
        header: RequestHeader,
        version: StopVersion,
        deadline_ms: u64,
    },

    StopResponse {
        header: ResponseHeader,
        version: StopVersion,
    },
}

impl ControlMessage {
    /// Correlation id of the request or response
    pub fn request_id(&self) -> u64 {
        match self {
            ControlMessage::OpenQueueRequest { header, .. }
            | ControlMessage::ConfigureQueueStreamRequest { header, .. }
            | ControlMessage::CloseQueueRequest { header, .. }
            | ControlMessage::QueueAssignmentRequest { header, .. }
            | ControlMessage::StopRequest { header, .. } => header.request_id,
            ControlMessage::OpenQueueResponse { header, .. }
            | ControlMessage::ConfigureQueueStreamResponse { header, .. }
            | ControlMessage::CloseQueueResponse { header, .. }
            | ControlMessage::QueueAssignmentResponse { header, .. }
            | ControlMessage::StopResponse { header, .. } => header.request_id,
        }
    }

    /// True for the request half of the protocol
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            ControlMessage::OpenQueueRequest { .. }
                | ControlMessage::ConfigureQueueStreamRequest { .. }
                | ControlMessage::CloseQueueRequest { .. }
                | ControlMessage::QueueAssignmentRequest { .. }
                | ControlMessage::StopRequest { .. }
        )
    }

    /// Status of a response message; `None` for requests
    pub fn status(&self) -> Option<&Status> {
        match self {
            ControlMessage::OpenQueueResponse { header, .. }
            | ControlMessage::ConfigureQueueStreamResponse { header, .. }
            | ControlMessage::CloseQueueResponse { header, .. }
            | ControlMessage::QueueAssignmentResponse { header, .. }
            | ControlMessage::StopResponse { header, .. } => Some(&header.status),
            _ => None,
        }
    }
}

/// Encode a control message to bytes
pub fn encode_message(message: &ControlMessage) -> Result<Vec<u8>> {
    postcard::to_allocvec(message).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decode a control message from bytes
pub fn decode_message(bytes: &[u8]) -> Result<ControlMessage> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    postcard::from_bytes(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(data: &[u8]) -> Bytes {
    let mut framed = BytesMut::with_capacity(4 + data.len());
    framed.put_u32(data.len() as u32);
    framed.extend_from_slice(data);
    framed.freeze()
}

/// Extract message length from frame header
pub fn frame_length(header: &[u8; 4]) -> usize {
    u32::from_be_bytes(*header) as usize
}
