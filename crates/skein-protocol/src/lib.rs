//! # Skein Protocol
//!
//! Wire schema for the control plane exchanged between skein cluster nodes:
//!
//! - **Queue lifecycle**: open / configure-stream / close requests and
//!   responses, including the reopen flavor used after failover
//! - **Assignment**: queue-assignment request/response between a replica and
//!   the cluster leader
//! - **Graceful shutdown**: stop request/response (V1 and V2)
//!
//! Messages are `serde` types serialized with `postcard` and framed with a
//! 4-byte big-endian length prefix for TCP transmission. Payload messaging
//! (PUT/PUSH/CONFIRM) is a separate protocol and is not defined here.

pub mod error;
pub mod messages;
pub mod types;

pub use error::{ProtocolError, Result};
pub use messages::{
    decode_message, encode_message, frame_length, frame_message, ControlMessage, RequestHeader,
    ResponseHeader, StopVersion, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use types::{
    NodeId, QueueFlags, QueueHandleParameters, RoutingConfiguration, Status, StatusCategory,
    StreamParameters, SubStreamInfo, DEFAULT_APP_ID, UNASSIGNED_QUEUE_ID, UNASSIGNED_SUB_QUEUE_ID,
};
