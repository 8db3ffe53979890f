//! Domain registry boundary and the open-queue confirmation cookie
//!
//! Domains own queue quotas and access control; the helper consumes them
//! through the two traits below. The confirmation cookie is the linear
//! capability guarding handle counts: acquiring it entitles the engine to
//! one counted handle, and dropping it unconfirmed emits a release event
//! that the engine turns into an upstream close.

use crate::queue::Queue;
use crate::uri::QueueUri;
use skein_protocol::{NodeId, QueueHandleParameters, Status};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identity of the requester an open is performed on behalf of
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub client_id: String,
    /// Set when the requester is a cluster peer rather than a direct client
    pub peer: Option<NodeId>,
}

impl ClientContext {
    pub fn local(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            peer: None,
        }
    }

    pub fn peer(node: NodeId) -> Self {
        Self {
            client_id: format!("peer:{node}"),
            peer: Some(node),
        }
    }
}

/// Counted access to a queue, granted by a domain
#[derive(Debug, Clone)]
pub struct QueueHandle {
    pub queue: Arc<Queue>,
    pub parameters: QueueHandleParameters,
    pub client: ClientContext,
}

impl QueueHandle {
    pub fn uri(&self) -> &QueueUri {
        self.queue.uri()
    }
}

/// Callback completing a domain lookup
pub type DomainOpenedCallback =
    Box<dyn FnOnce(std::result::Result<Arc<dyn Domain>, Status>) + Send>;

/// Callback completing a domain open-queue request
pub type HandleGrantedCallback = Box<dyn FnOnce(Status, Option<QueueHandle>) + Send>;

/// Registry resolving domain names to domain objects
pub trait DomainRegistry: Send + Sync {
    /// Resolve `name` asynchronously; the callback fires exactly once.
    fn open_domain(&self, name: &str, callback: DomainOpenedCallback);
}

/// A message domain: grants queue handles against its quotas
pub trait Domain: Send + Sync {
    fn name(&self) -> &str;

    /// Request a counted handle on `queue` for `client`. The callback fires
    /// exactly once with either a handle or a failure status.
    fn open_queue(
        &self,
        queue: Arc<Queue>,
        parameters: QueueHandleParameters,
        client: ClientContext,
        callback: HandleGrantedCallback,
    );
}

/// Release event emitted when a confirmation cookie is dropped unconfirmed
#[derive(Debug)]
pub struct UnconfirmedHandle {
    pub parameters: QueueHandleParameters,
}

/// Linear capability for one counted queue handle.
///
/// Created armed before the handle is requested from the domain. The engine
/// calls [`confirm`](Self::confirm) after the requester's callback has been
/// handed the handle; any path that drops the cookie unconfirmed (error,
/// requester disconnect, panic unwind) emits an [`UnconfirmedHandle`] on the
/// release channel, which the engine turns into an upstream close so the
/// counted handle is not leaked.
#[derive(Debug)]
pub struct ConfirmationCookie {
    armed: bool,
    parameters: QueueHandleParameters,
    releases: mpsc::UnboundedSender<UnconfirmedHandle>,
}

impl ConfirmationCookie {
    pub fn new(
        parameters: QueueHandleParameters,
        releases: mpsc::UnboundedSender<UnconfirmedHandle>,
    ) -> Self {
        Self {
            armed: true,
            parameters,
            releases,
        }
    }

    /// The handle reached its requester; disarm the cookie.
    pub fn confirm(mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Drop for ConfirmationCookie {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.releases.send(UnconfirmedHandle {
                parameters: self.parameters.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_protocol::QueueFlags;

    fn params() -> QueueHandleParameters {
        QueueHandleParameters::new("skein://acme/orders", QueueFlags::reader())
    }

    #[test]
    fn test_cookie_drop_unconfirmed_emits_release() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cookie = ConfirmationCookie::new(params(), tx);
        assert!(cookie.is_armed());
        drop(cookie);

        let released = rx.try_recv().unwrap();
        assert_eq!(released.parameters, params());
    }

    #[test]
    fn test_cookie_confirm_is_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cookie = ConfirmationCookie::new(params(), tx);
        cookie.confirm();
        assert!(rx.try_recv().is_err());
    }
}
