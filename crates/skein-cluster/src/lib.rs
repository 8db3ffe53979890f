//! # Skein Cluster
//!
//! Per-node queue coordination for the skein message broker:
//!
//! - **Registry**: owns every queue context, indexed by uri and queue id
//! - **Assignment**: obtains a cluster-wide id + partition per queue, via
//!   leader RPC or local decision
//! - **Open/configure/close engine**: the per-queue and per-substream
//!   protocol state machine against upstream peers
//! - **Failover restorer**: replays reopen + reconfigure for every affected
//!   queue when the leader, a primary, or the active upstream changes
//! - **Shutdown drainer**: the multi-step stop handshake with stopping
//!   peers (deconfigure, wait for confirmations, close, respond)
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    ClusterQueueHelper                      │
//! │                 (single dispatcher task)                   │
//! ├──────────┬────────────┬─────────────┬──────────────────────┤
//! │ Registry │ Assignment │   Engine    │ Restorer │  Drainer  │
//! ├──────────┴────────────┴─────────────┴──────────────────────┤
//! │   RequestManager (correlation ids, deadlines, cancels)     │
//! ├────────────────────────────────────────────────────────────┤
//! │ PeerTransport │ DomainRegistry │ StorageManager │ Observer │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything above the boundary traits is serialized on one dispatcher;
//! the only cross-thread state is a pair of atomic counters. External
//! inputs (client calls, decoded frames, timers, cluster-state callbacks)
//! post onto the dispatcher through [`HelperHandle`].

pub mod admin;
pub mod assignment;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod helper;
pub mod observer;
pub mod queue;
pub mod registry;
pub mod request;
pub mod restore;
pub mod stop;
pub mod storage;
pub mod topology;
pub mod transport;
pub mod uri;

// Re-export main types
pub use admin::{HelperStateSnapshot, QueueInfoSnapshot, SubStreamSnapshot};
pub use config::HelperConfig;
pub use context::{
    ConfiguredCallback, OpenQueueCallback, ReleasedCallback, SubStreamState,
};
pub use domain::{
    ClientContext, ConfirmationCookie, Domain, DomainRegistry, QueueHandle, UnconfirmedHandle,
};
pub use error::{Error, Result};
pub use helper::{ClusterQueueHelper, HelperHandle, VoidCallback};
pub use observer::{
    ClusterStateObserver, ClusterStatePublisher, ObserverRegistry, QueueAssignmentInfo,
};
pub use queue::{Queue, QueueKind, LOCAL_QUEUE_ID};
pub use storage::{NullStorageManager, StorageManager};
pub use topology::{
    ClusterRole, ClusterTopology, LeaderStatus, NodeStatus, PartitionInfo, PrimaryStatus,
};
pub use transport::{ChannelTransport, PeerTransport};
pub use uri::QueueUri;

/// Re-export of the wire protocol for convenience
pub use skein_protocol as protocol;
