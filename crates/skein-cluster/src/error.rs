//! Cluster queue helper error types

use skein_protocol::{Status, StatusCategory};
use thiserror::Error;

/// Result type for queue helper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Queue helper errors
#[derive(Debug, Error)]
pub enum Error {
    // ==================== Request validation ====================
    #[error("invalid queue uri: {0}")]
    InvalidUri(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Transient conditions ====================
    #[error("queue not assigned: {0}")]
    Unassigned(String),

    #[error("no upstream available for partition {partition:?}")]
    UpstreamUnavailable { partition: Option<u32> },

    #[error("request canceled: {0}")]
    Canceled(String),

    #[error("request timeout")]
    Timeout,

    // ==================== Terminal conditions ====================
    #[error("refused: {0}")]
    Refused(String),

    #[error("limit reached: {0}")]
    Limit(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    // ==================== Plumbing ====================
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    /// Whether a retry may succeed without operator intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Unassigned(_)
                | Error::UpstreamUnavailable { .. }
                | Error::Canceled(_)
                | Error::Timeout
                | Error::Transport(_)
        )
    }

    /// Whether this error indicates a programming error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Invariant(_))
    }

    /// Map to the wire status carried in control-plane responses
    pub fn to_status(&self) -> Status {
        let category = match self {
            Error::InvalidUri(_) | Error::InvalidConfig(_) | Error::Refused(_) => {
                StatusCategory::Refused
            }
            Error::Unassigned(_) => StatusCategory::Unassigned,
            Error::UpstreamUnavailable { .. } | Error::Transport(_) => {
                StatusCategory::UpstreamUnavailable
            }
            Error::Canceled(_) | Error::ChannelClosed => StatusCategory::Canceled,
            Error::Timeout => StatusCategory::Timeout,
            Error::Limit(_) => StatusCategory::Limit,
            Error::NotSupported(_) => StatusCategory::NotSupported,
            Error::Invariant(_) => StatusCategory::Invariant,
        };
        Status::new(category, 0, self.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::Unassigned("skein://a/q".into()).is_transient());
        assert!(Error::UpstreamUnavailable { partition: Some(2) }.is_transient());
        assert!(!Error::Refused("domain disabled".into()).is_transient());
        assert!(!Error::Limit("too many handles".into()).is_transient());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::Timeout.to_status().category,
            StatusCategory::Timeout
        );
        assert_eq!(
            Error::Refused("no".into()).to_status().category,
            StatusCategory::Refused
        );
        assert_eq!(
            Error::Invariant("bug".into()).to_status().category,
            StatusCategory::Invariant
        );
        assert!(Error::Invariant("bug".into()).is_fatal());
    }
}
