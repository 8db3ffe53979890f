//! Upstream request tracking
//!
//! The request manager owns every in-flight control-plane request this node
//! has sent: it allocates correlation ids, arms per-request deadlines, pairs
//! responses with their continuations, and cancels whole peers when a
//! connection drops. Every continuation fires exactly once, with the
//! response, a timeout, or a cancellation status, whichever comes first.

use crate::dispatcher::DispatcherHandle;
use crate::transport::PeerTransport;
use skein_protocol::{ControlMessage, NodeId, RequestHeader, Status, StatusCategory};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// How an in-flight request ended
pub enum RequestOutcome {
    /// The peer responded
    Response(ControlMessage),
    /// Deadline expired, peer went away, or the helper is tearing down
    Canceled(Status),
}

impl RequestOutcome {
    /// Status of the outcome: the response status, or the cancel status
    pub fn status(&self) -> Status {
        match self {
            RequestOutcome::Response(message) => {
                message.status().cloned().unwrap_or_else(Status::success)
            }
            RequestOutcome::Canceled(status) => status.clone(),
        }
    }
}

/// Continuation invoked on the dispatcher when a request completes
pub type Continuation<S> = Box<dyn FnOnce(&mut S, RequestOutcome) + Send>;

/// State types hosting a request manager
pub trait RequestHost: Sized + Send + 'static {
    fn request_manager(&mut self) -> &mut RequestManager<Self>;
}

/// One tracked in-flight request
pub struct PendingRequest<S> {
    pub peer: NodeId,
    continuation: Continuation<S>,
    deadline: tokio::task::AbortHandle,
}

impl<S> PendingRequest<S> {
    /// Disarm the deadline and run the continuation
    pub fn complete(self, state: &mut S, outcome: RequestOutcome) {
        self.deadline.abort();
        (self.continuation)(state, outcome);
    }
}

/// Tracker of in-flight upstream requests
pub struct RequestManager<S> {
    self_node: NodeId,
    next_request_id: u64,
    pending: HashMap<u64, PendingRequest<S>>,
}

impl<S: RequestHost> RequestManager<S> {
    pub fn new(self_node: NodeId) -> Self {
        Self {
            self_node,
            next_request_id: 1,
            pending: HashMap::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a request to `peer` and track it until completion.
    ///
    /// `build` receives the allocated header and produces the message. On
    /// transport failure nothing is tracked and the continuation is posted
    /// with an `UpstreamUnavailable` cancellation, so callers observe one
    /// uniform completion path. Returns the request id.
    pub fn send(
        &mut self,
        transport: &dyn PeerTransport,
        dispatcher: &DispatcherHandle<S>,
        peer: NodeId,
        timeout: Duration,
        build: impl FnOnce(RequestHeader) -> ControlMessage,
        continuation: Continuation<S>,
    ) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let header = RequestHeader::new(request_id, self.self_node.clone()).with_timeout(timeout);
        let message = build(header);

        if let Err(error) = transport.send(&peer, message) {
            warn!(%peer, request_id, %error, "request send failed");
            dispatcher.post(move |state| {
                continuation(
                    state,
                    RequestOutcome::Canceled(error.to_status()),
                );
            });
            return request_id;
        }

        let deadline_dispatcher = dispatcher.clone();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deadline_dispatcher.post(move |state: &mut S| {
                if let Some(request) = state.request_manager().take(request_id) {
                    debug!(request_id, "request deadline expired");
                    request.complete(
                        state,
                        RequestOutcome::Canceled(Status::new(
                            StatusCategory::Timeout,
                            0,
                            "request deadline expired",
                        )),
                    );
                }
            });
        })
        .abort_handle();

        self.pending.insert(
            request_id,
            PendingRequest {
                peer,
                continuation,
                deadline,
            },
        );
        request_id
    }

    /// Detach the pending request for `request_id`, if any. Late responses
    /// for already-completed requests find nothing and are dropped.
    pub fn take(&mut self, request_id: u64) -> Option<PendingRequest<S>> {
        self.pending.remove(&request_id)
    }

    /// Detach every pending request addressed to `peer`
    pub fn take_peer(&mut self, peer: &NodeId) -> Vec<PendingRequest<S>> {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| &p.peer == peer)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    /// Detach every pending request
    pub fn take_all(&mut self) -> Vec<PendingRequest<S>> {
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }
}
