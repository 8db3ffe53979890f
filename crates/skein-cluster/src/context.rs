//! Per-queue live state
//!
//! One [`QueueContext`] exists per canonical uri the helper has ever heard
//! of, whether the queue is open, being opened, or merely known from a
//! leader advisory. The registry owns every context; everything else
//! references queues by uri or id and looks them up on the dispatcher.

use crate::domain::QueueHandle;
use crate::observer::QueueAssignmentInfo;
use crate::queue::Queue;
use crate::uri::QueueUri;
use skein_protocol::{
    QueueHandleParameters, Status, StatusCategory, StreamParameters, UNASSIGNED_QUEUE_ID,
    UNASSIGNED_SUB_QUEUE_ID,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::domain::ClientContext;

/// Callback completing one open-queue request; fires exactly once
pub type OpenQueueCallback = Box<dyn FnOnce(Status, Option<QueueHandle>) + Send>;

/// Callback completing a configure-stream request
pub type ConfiguredCallback = Box<dyn FnOnce(Status, StreamParameters) + Send>;

/// Callback completing a release (close) request
pub type ReleasedCallback = Box<dyn FnOnce(Status) + Send>;

/// State of the upstream for one substream of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubStreamState {
    /// No upstream state; close requests subtract counts immediately
    Closed,
    /// Reopen response pending: close requests are buffered, configure
    /// requests are answered from the cache
    Reopening,
    /// Requests go upstream
    Open,
    /// Reopen failed; the restorer gave up on this substream
    Failed,
}

impl SubStreamState {
    /// Whether `from -> to` is part of the substream lifecycle
    pub fn can_transition(from: SubStreamState, to: SubStreamState) -> bool {
        use SubStreamState::*;
        matches!(
            (from, to),
            (Closed, Open)          // first open
                | (Closed, Failed)  // open never reached the upstream
                | (Open, Reopening) // failover began
                | (Failed, Reopening)
                | (Reopening, Open)
                | (Reopening, Failed)
        )
    }
}

/// Close request buffered while the substream is reopening
pub struct PendingClose {
    pub handle_parameters: QueueHandleParameters,
    pub callback: ReleasedCallback,
}

/// Context of one substream: the `(queue, app_id)` upstream view
pub struct SubQueueContext {
    pub app_id: String,
    pub upstream_sub_queue_id: u32,
    /// Aggregated handle counts across all local holders of this substream
    pub parameters: QueueHandleParameters,
    /// Last stream parameters the consumers asked for; replayed on reopen
    pub stream_parameters: Option<StreamParameters>,
    pub state: SubStreamState,
    pub pending_close_requests: Vec<PendingClose>,
    /// Armed only while the shutdown drainer waits for consumer confirms
    pub unconfirmed_timer: Option<tokio::task::AbortHandle>,
}

impl SubQueueContext {
    pub fn new(app_id: String, upstream_sub_queue_id: u32, uri: &QueueUri) -> Self {
        let mut parameters =
            QueueHandleParameters::new(uri.as_str(), skein_protocol::QueueFlags::default());
        parameters.read_count = 0;
        parameters.write_count = 0;
        parameters.admin_count = 0;
        parameters.sub_stream = Some(skein_protocol::SubStreamInfo {
            app_id: app_id.clone(),
            sub_queue_id: upstream_sub_queue_id,
        });
        Self {
            app_id,
            upstream_sub_queue_id,
            parameters,
            stream_parameters: None,
            state: SubStreamState::Closed,
            pending_close_requests: Vec::new(),
            unconfirmed_timer: None,
        }
    }

    /// Apply a transition, returning false (and leaving the state untouched)
    /// when the transition is not part of the lifecycle.
    pub fn transition(&mut self, to: SubStreamState) -> bool {
        if self.state == to {
            return true;
        }
        if SubStreamState::can_transition(self.state, to) {
            self.state = to;
            true
        } else {
            false
        }
    }

    /// Add the counts of `params` to the aggregate
    pub fn add_counts(&mut self, params: &QueueHandleParameters) {
        self.parameters.read_count += params.read_count;
        self.parameters.write_count += params.write_count;
        self.parameters.admin_count += params.admin_count;
        self.parameters.flags.reader |= params.flags.reader;
        self.parameters.flags.writer |= params.flags.writer;
        self.parameters.flags.admin |= params.flags.admin;
    }

    /// Subtract the counts of `params`; returns true when no counted access
    /// remains and the substream should be removed.
    pub fn subtract_counts(&mut self, params: &QueueHandleParameters) -> bool {
        self.parameters.read_count = (self.parameters.read_count - params.read_count).max(0);
        self.parameters.write_count = (self.parameters.write_count - params.write_count).max(0);
        self.parameters.admin_count = (self.parameters.admin_count - params.admin_count).max(0);
        self.is_drained()
    }

    pub fn is_drained(&self) -> bool {
        self.parameters.read_count == 0
            && self.parameters.write_count == 0
            && self.parameters.admin_count == 0
    }

    /// A substream with no read interest has nothing to reconfigure
    pub fn is_writer_only(&self) -> bool {
        self.parameters.read_count == 0
    }

    pub fn cancel_unconfirmed_timer(&mut self) {
        if let Some(timer) = self.unconfirmed_timer.take() {
            timer.abort();
        }
    }
}

/// Deferred app-id update, applied once the queue object exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppUpdate {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Context of one outstanding open-queue request.
///
/// The callback fires exactly once: either through [`complete`], or with
/// `Canceled` from `Drop` if the context is destroyed while still pending
/// (e.g. teardown, or the requester disconnecting). The per-queue in-flight
/// counter is decremented at the same moment.
pub struct OpenQueueContext {
    pub uri: QueueUri,
    pub domain_name: String,
    pub handle_parameters: QueueHandleParameters,
    pub upstream_sub_queue_id: u32,
    pub client: ClientContext,
    callback: Option<OpenQueueCallback>,
    in_flight: Arc<AtomicU32>,
}

impl OpenQueueContext {
    /// Create a context and count it in flight
    pub fn new(
        uri: QueueUri,
        domain_name: String,
        handle_parameters: QueueHandleParameters,
        client: ClientContext,
        callback: OpenQueueCallback,
        in_flight: Arc<AtomicU32>,
    ) -> Self {
        in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            uri,
            domain_name,
            handle_parameters,
            upstream_sub_queue_id: UNASSIGNED_SUB_QUEUE_ID,
            client,
            callback: Some(callback),
            in_flight,
        }
    }

    pub fn app_id(&self) -> &str {
        self.handle_parameters.app_id()
    }

    /// Invoke the requester's callback and retire the in-flight count
    pub fn complete(mut self, status: Status, handle: Option<QueueHandle>) {
        self.finish(status, handle);
    }

    fn finish(&mut self, status: Status, handle: Option<QueueHandle>) {
        if let Some(callback) = self.callback.take() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            callback(status, handle);
        }
    }
}

impl Drop for OpenQueueContext {
    fn drop(&mut self) {
        self.finish(
            Status::new(StatusCategory::Canceled, 0, "open canceled"),
            None,
        );
    }
}

/// Live (non-persisted) information of one queue
pub struct QueueLiveState {
    /// Upstream queue id; `UNASSIGNED_QUEUE_ID` until assigned, 0 for
    /// strictly-local queues
    pub id: u32,
    pub substreams: HashMap<String, SubQueueContext>,
    pub next_sub_queue_id: u32,
    pub queue: Option<Arc<Queue>>,
    /// Routing decided by the primary; validated on every (re)open
    pub routing: Option<skein_protocol::RoutingConfiguration>,
    pub num_handles: u32,
    pub num_handle_creations_in_progress: u32,
    /// `None` means the queue cannot expire (it has handles or messages)
    pub expiration_deadline: Option<Instant>,
    /// Opens deferred on assignment, in arrival order
    pub pending: VecDeque<OpenQueueContext>,
    /// App updates deferred on queue creation
    pub pending_updates: VecDeque<AppUpdate>,
    /// Open contexts whose callback has not fired yet; readable off-thread
    pub in_flight: Arc<AtomicU32>,
}

impl Default for QueueLiveState {
    fn default() -> Self {
        Self {
            id: UNASSIGNED_QUEUE_ID,
            substreams: HashMap::new(),
            next_sub_queue_id: 0,
            queue: None,
            routing: None,
            num_handles: 0,
            num_handle_creations_in_progress: 0,
            expiration_deadline: None,
            pending: VecDeque::new(),
            pending_updates: VecDeque::new(),
            in_flight: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl QueueLiveState {
    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Find the substream holding `upstream_sub_queue_id`
    pub fn substream_by_id(&self, upstream_sub_queue_id: u32) -> Option<&SubQueueContext> {
        self.substreams
            .values()
            .find(|s| s.upstream_sub_queue_id == upstream_sub_queue_id)
    }

    pub fn substream_by_id_mut(
        &mut self,
        upstream_sub_queue_id: u32,
    ) -> Option<&mut SubQueueContext> {
        self.substreams
            .values_mut()
            .find(|s| s.upstream_sub_queue_id == upstream_sub_queue_id)
    }

    /// Reset assignment-scoped state after an unassignment, keeping pending
    /// opens so they can be replayed on the next assignment.
    pub fn reset_but_keep_pending(&mut self) {
        self.id = UNASSIGNED_QUEUE_ID;
        self.substreams.clear();
        self.queue = None;
        self.routing = None;
        self.expiration_deadline = None;
    }
}

/// All information the helper tracks for one queue
pub struct QueueContext {
    uri: QueueUri,
    pub live: QueueLiveState,
    /// Cluster-state record; `None` until the queue is assigned
    pub persisted: Option<QueueAssignmentInfo>,
    /// Set by a non-immediate gc pass; the next sweep deletes the queue
    pub gc_marked: bool,
}

impl QueueContext {
    pub fn new(uri: QueueUri) -> Self {
        Self {
            uri,
            live: QueueLiveState::default(),
            persisted: None,
            gc_marked: false,
        }
    }

    pub fn uri(&self) -> &QueueUri {
        &self.uri
    }

    pub fn partition_id(&self) -> Option<u32> {
        self.persisted.as_ref().map(|p| p.partition_id)
    }

    pub fn storage_key(&self) -> Option<u64> {
        self.persisted.as_ref().map(|p| p.storage_key)
    }

    /// A queue may be deleted only when nothing references it any more
    pub fn can_delete(&self) -> bool {
        self.live.num_handles == 0
            && self.live.num_handle_creations_in_progress == 0
            && self.live.in_flight_count() == 0
            && self.live.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_protocol::QueueFlags;
    use std::sync::atomic::AtomicUsize;

    fn uri() -> QueueUri {
        QueueUri::parse("skein://acme/orders").unwrap()
    }

    fn open_context(
        in_flight: &Arc<AtomicU32>,
        fired: &Arc<AtomicUsize>,
    ) -> OpenQueueContext {
        let fired = fired.clone();
        OpenQueueContext::new(
            uri(),
            "acme".to_string(),
            QueueHandleParameters::new("skein://acme/orders", QueueFlags::reader()),
            ClientContext::local("client-1"),
            Box::new(move |_status, _handle| {
                fired.fetch_add(1, Ordering::Relaxed);
            }),
            in_flight.clone(),
        )
    }

    #[test]
    fn test_open_context_counts_in_flight() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let fired = Arc::new(AtomicUsize::new(0));

        let context = open_context(&in_flight, &fired);
        assert_eq!(in_flight.load(Ordering::Acquire), 1);

        context.complete(Status::success(), None);
        assert_eq!(in_flight.load(Ordering::Acquire), 0);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_open_context_drop_fires_canceled_once() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let fired = Arc::new(AtomicUsize::new(0));

        drop(open_context(&in_flight, &fired));
        assert_eq!(in_flight.load(Ordering::Acquire), 0);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_substream_transitions() {
        let mut substream = SubQueueContext::new("billing".to_string(), 1, &uri());
        assert_eq!(substream.state, SubStreamState::Closed);

        assert!(substream.transition(SubStreamState::Open));
        assert!(substream.transition(SubStreamState::Reopening));
        assert!(substream.transition(SubStreamState::Open));
        assert!(substream.transition(SubStreamState::Reopening));
        assert!(substream.transition(SubStreamState::Failed));
        assert!(substream.transition(SubStreamState::Reopening));

        // an open substream cannot fail without a reopen in between
        let mut substream = SubQueueContext::new("billing".to_string(), 1, &uri());
        substream.transition(SubStreamState::Open);
        assert!(!substream.transition(SubStreamState::Failed));
        assert_eq!(substream.state, SubStreamState::Open);
    }

    #[test]
    fn test_substream_count_accounting() {
        let mut substream = SubQueueContext::new("billing".to_string(), 1, &uri());
        let reader = QueueHandleParameters::new("skein://acme/orders", QueueFlags::reader());
        let writer = QueueHandleParameters::new("skein://acme/orders", QueueFlags::writer());

        substream.add_counts(&reader);
        substream.add_counts(&reader);
        substream.add_counts(&writer);
        assert!(!substream.is_drained());
        assert!(!substream.is_writer_only());

        assert!(!substream.subtract_counts(&reader));
        assert!(!substream.subtract_counts(&writer));
        assert!(substream.subtract_counts(&reader));
        assert!(substream.is_drained());
    }

    #[test]
    fn test_can_delete_requires_quiescence() {
        let mut context = QueueContext::new(uri());
        assert!(context.can_delete());

        context.live.num_handles = 1;
        assert!(!context.can_delete());
        context.live.num_handles = 0;

        let fired = Arc::new(AtomicUsize::new(0));
        let open = open_context(&context.live.in_flight.clone(), &fired);
        context.live.pending.push_back(open);
        assert!(!context.can_delete());

        // in_flight >= |pending| while queued
        assert!(context.live.in_flight_count() >= context.live.pending.len() as u32);

        context.live.pending.clear(); // drop completes the context
        assert!(context.can_delete());
    }
}
