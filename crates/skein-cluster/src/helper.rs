//! Cluster queue helper
//!
//! The per-node coordinator owning the lifecycle of every queue known to
//! this cluster member. It runs the open/configure/close protocol with
//! upstream peers, assigns queues through the leader, replays state after
//! failover, and drains queues when a peer shuts down.
//!
//! The entire component is serialized: every method of
//! [`ClusterQueueHelper`] runs on the dispatcher, and [`HelperHandle`] is
//! the cross-thread surface that posts work onto it. The only values read
//! off-thread are the two atomic counters (per-queue in-flight opens and
//! the process-wide pending-reopen count).

use crate::config::HelperConfig;
use crate::context::{
    ConfiguredCallback, OpenQueueCallback, OpenQueueContext, PendingClose, ReleasedCallback,
    SubQueueContext, SubStreamState,
};
use crate::dispatcher::{self, DispatcherHandle};
use crate::domain::{
    ClientContext, ConfirmationCookie, Domain, DomainRegistry, QueueHandle, UnconfirmedHandle,
};
use crate::error::Error;
use crate::observer::{ClusterStatePublisher, QueueAssignmentInfo};
use crate::queue::Queue;
use crate::registry::QueueRegistry;
use crate::request::{RequestHost, RequestManager, RequestOutcome};
use crate::restore::ReopenTicket;
use crate::stop::StopState;
use crate::storage::StorageManager;
use crate::topology::ClusterTopology;
use crate::transport::PeerTransport;
use crate::uri::QueueUri;
use skein_protocol::{
    ControlMessage, NodeId, QueueHandleParameters, ResponseHeader, RoutingConfiguration, Status,
    StatusCategory, StopVersion, StreamParameters, SubStreamInfo, UNASSIGNED_QUEUE_ID,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Callback invoked once an asynchronous sequence completes
pub type VoidCallback = Box<dyn FnOnce() + Send>;

/// Queue handles granted to one requesting peer, keyed by the peer's
/// `(queue_id, sub_queue_id)` pair.
#[derive(Default)]
pub(crate) struct PeerSession {
    pub handles: HashMap<(u32, u32), QueueHandle>,
}

/// The per-node cluster queue coordinator. All methods run on the
/// dispatcher; use [`HelperHandle`] from other threads.
pub struct ClusterQueueHelper {
    pub(crate) config: HelperConfig,
    pub(crate) topology: ClusterTopology,
    pub(crate) registry: QueueRegistry,
    pub(crate) requests: RequestManager<ClusterQueueHelper>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) domains: Arc<dyn DomainRegistry>,
    pub(crate) storage: Arc<dyn StorageManager>,
    pub(crate) publisher: Option<Arc<dyn ClusterStatePublisher>>,
    pub(crate) dispatcher: DispatcherHandle<ClusterQueueHelper>,

    /// Not atomic: only touched on the dispatcher
    pub(crate) next_queue_id: u32,
    pub(crate) queue_id_alarmed: [bool; 2],
    pub(crate) next_partition_rr: u32,
    pub(crate) primary_not_leader_alarm_raised: bool,

    /// Release events from dropped confirmation cookies
    pub(crate) releases_tx: mpsc::UnboundedSender<UnconfirmedHandle>,

    /// Uris with an assignment request in flight to the leader; keeps
    /// concurrent opens from duplicating the request
    pub(crate) pending_assignments: std::collections::HashSet<QueueUri>,

    /// In-flight reopen tickets; the mirror is readable off-thread
    pub(crate) pending_reopens: HashMap<u64, ReopenTicket>,
    pub(crate) next_reopen_ticket: u64,
    pub(crate) pending_reopen_mirror: Arc<AtomicUsize>,

    /// Latest stop handshake per peer; weak so finished contexts drop away
    pub(crate) stop_contexts: HashMap<NodeId, Weak<StopState>>,
    /// True only when every cluster node supports the V2 stop handshake
    pub(crate) shutdown_v2_enabled: Arc<AtomicBool>,

    pub(crate) peer_sessions: HashMap<NodeId, PeerSession>,
}

impl RequestHost for ClusterQueueHelper {
    fn request_manager(&mut self) -> &mut RequestManager<Self> {
        &mut self.requests
    }
}

impl ClusterQueueHelper {
    /// Build the helper and start its dispatcher. Returns the cross-thread
    /// handle.
    pub fn spawn(
        config: HelperConfig,
        topology: ClusterTopology,
        transport: Arc<dyn PeerTransport>,
        domains: Arc<dyn DomainRegistry>,
        storage: Arc<dyn StorageManager>,
        publisher: Option<Arc<dyn ClusterStatePublisher>>,
    ) -> HelperHandle {
        let (handle, receiver) = dispatcher::channel::<Self>();
        let (releases_tx, mut releases_rx) = mpsc::unbounded_channel();
        let pending_reopen_mirror = Arc::new(AtomicUsize::new(0));
        let shutdown_v2_enabled = Arc::new(AtomicBool::new(false));

        let helper = Self {
            requests: RequestManager::new(config.node_id.clone()),
            config,
            topology,
            registry: QueueRegistry::new(),
            transport,
            domains,
            storage,
            publisher,
            dispatcher: handle.clone(),
            next_queue_id: 1,
            queue_id_alarmed: [false; 2],
            next_partition_rr: 0,
            primary_not_leader_alarm_raised: false,
            releases_tx,
            pending_assignments: std::collections::HashSet::new(),
            pending_reopens: HashMap::new(),
            next_reopen_ticket: 1,
            pending_reopen_mirror: pending_reopen_mirror.clone(),
            stop_contexts: HashMap::new(),
            shutdown_v2_enabled: shutdown_v2_enabled.clone(),
            peer_sessions: HashMap::new(),
        };

        // pump unconfirmed-handle releases back onto the dispatcher
        let release_dispatcher = handle.clone();
        tokio::spawn(async move {
            while let Some(release) = releases_rx.recv().await {
                release_dispatcher.post(move |helper| helper.on_handle_release(release));
            }
        });

        dispatcher::run(receiver, helper);

        HelperHandle {
            dispatcher: handle,
            pending_reopens: pending_reopen_mirror,
            shutdown_v2_enabled,
        }
    }

    // ==================== Open pipeline ====================

    /// Initiate the open-queue sequence. The callback fires exactly once.
    pub(crate) fn open_queue(
        &mut self,
        uri_raw: String,
        domain_name: String,
        handle_parameters: QueueHandleParameters,
        client: ClientContext,
        callback: OpenQueueCallback,
    ) {
        let uri = match QueueUri::parse(&uri_raw) {
            Ok(uri) => uri,
            Err(error) => {
                // non-canonical uris are rejected synchronously
                callback(error.to_status(), None);
                return;
            }
        };
        if uri.domain() != domain_name {
            callback(
                Status::new(
                    StatusCategory::Refused,
                    0,
                    format!("uri domain `{}` does not match `{domain_name}`", uri.domain()),
                ),
                None,
            );
            return;
        }

        debug!(uri = %uri, client = %client.client_id, "open queue");
        let context = self.registry.get_or_create(&uri);
        let open = OpenQueueContext::new(
            uri.clone(),
            domain_name,
            handle_parameters,
            client,
            callback,
            context.live.in_flight.clone(),
        );

        if !self.is_queue_assigned(&uri) {
            // defer on assignment; the coordinator resumes us
            if let Some(context) = self.registry.get_mut(&uri) {
                context.live.pending.push_back(open);
            }
            self.assign_queue(&uri);
            return;
        }

        self.process_open_queue_context(open);
    }

    /// Whether `uri` is assigned: a proxy needs a locally allocated id, a
    /// member needs the cluster-state record.
    pub(crate) fn is_queue_assigned(&self, uri: &QueueUri) -> bool {
        let Some(context) = self.registry.get(uri) else {
            return false;
        };
        if self.topology.role.is_proxy() {
            context.live.id != UNASSIGNED_QUEUE_ID
        } else {
            context.persisted.is_some()
        }
    }

    pub(crate) fn partition_of(&self, uri: &QueueUri) -> Option<u32> {
        self.registry.get(uri).and_then(|c| c.partition_id())
    }

    /// Run one open context through the pipeline. The queue must be
    /// assigned.
    pub(crate) fn process_open_queue_context(&mut self, mut open: OpenQueueContext) {
        self.assign_upstream_sub_queue_id(&mut open);

        let dispatcher = self.dispatcher.clone();
        let domain_name = open.domain_name.clone();
        self.domains.open_domain(
            &domain_name,
            Box::new(move |result| {
                dispatcher.post(move |helper| helper.on_domain_opened(open, result));
            }),
        );
    }

    /// Reuse the substream id of an existing `(queue, app_id)` substream,
    /// or allocate a fresh one.
    fn assign_upstream_sub_queue_id(&mut self, open: &mut OpenQueueContext) {
        let uri = open.uri.clone();
        let app_id = open.app_id().to_string();
        let context = self.registry.get_or_create(&uri);

        if let Some(existing) = context.live.substreams.get(&app_id) {
            open.upstream_sub_queue_id = existing.upstream_sub_queue_id;
            return;
        }

        let id = context.live.next_sub_queue_id;
        context.live.next_sub_queue_id += 1;
        context
            .live
            .substreams
            .insert(app_id.clone(), SubQueueContext::new(app_id, id, &uri));
        open.upstream_sub_queue_id = id;
    }

    fn on_domain_opened(
        &mut self,
        open: OpenQueueContext,
        result: std::result::Result<Arc<dyn Domain>, Status>,
    ) {
        let domain = match result {
            Ok(domain) => domain,
            Err(status) => {
                warn!(uri = %open.uri, %status, "domain lookup failed");
                open.complete(status, None);
                return;
            }
        };

        let partition = self.partition_of(&open.uri);
        let self_primary = !self.topology.role.is_proxy()
            && partition.is_some_and(|p| self.topology.is_self_available_primary(p));

        if self_primary {
            self.create_queue_locally(open, domain);
        } else {
            self.send_open_queue_request(open, domain);
        }
    }

    fn send_open_queue_request(&mut self, open: OpenQueueContext, domain: Arc<dyn Domain>) {
        let partition = self.partition_of(&open.uri).unwrap_or(0);
        let Some((upstream, _generation)) = self.topology.upstream_and_generation(partition)
        else {
            // no upstream right now; park the open, the restorer resumes it
            debug!(uri = %open.uri, "no upstream available, parking open");
            if let Some(context) = self.registry.get_mut(&open.uri) {
                context.live.pending.push_back(open);
            }
            return;
        };

        let queue_id = self
            .registry
            .get(&open.uri)
            .map_or(UNASSIGNED_QUEUE_ID, |c| c.live.id);
        let mut handle_parameters = open.handle_parameters.clone();
        handle_parameters.sub_stream = Some(SubStreamInfo {
            app_id: open.app_id().to_string(),
            sub_queue_id: open.upstream_sub_queue_id,
        });

        let transport = self.transport.clone();
        let dispatcher = self.dispatcher.clone();
        let timeout = self.config.open_timeout;
        let response_upstream = upstream.clone();
        self.requests.send(
            transport.as_ref(),
            &dispatcher,
            upstream,
            timeout,
            move |header| ControlMessage::OpenQueueRequest {
                header,
                handle_parameters,
                queue_id,
                is_reopen: false,
            },
            Box::new(move |helper, outcome| {
                helper.on_open_queue_response(open, domain, response_upstream, outcome);
            }),
        );
    }

    fn on_open_queue_response(
        &mut self,
        open: OpenQueueContext,
        domain: Arc<dyn Domain>,
        upstream: NodeId,
        outcome: RequestOutcome,
    ) {
        match outcome {
            RequestOutcome::Canceled(status) => {
                // transport failure or deadline: the restorer owns retries
                warn!(uri = %open.uri, %upstream, %status, "open request canceled");
                self.mark_substream_failed(&open.uri, open.app_id());
                open.complete(status, None);
            }
            RequestOutcome::Response(ControlMessage::OpenQueueResponse {
                header,
                routing_configuration,
                ..
            }) => {
                if !header.is_success() {
                    if header.status.category == StatusCategory::Limit {
                        debug!(uri = %open.uri, "open rejected by upstream backpressure");
                    }
                    open.complete(header.status, None);
                    return;
                }
                self.on_open_queue_success(open, domain, routing_configuration, Some(upstream));
            }
            RequestOutcome::Response(other) => {
                error!(uri = %open.uri, ?other, "mismatched response to open request");
                open.complete(
                    Status::new(
                        StatusCategory::Invariant,
                        0,
                        "mismatched response to open request",
                    ),
                    None,
                );
            }
        }
    }

    fn create_queue_locally(&mut self, open: OpenQueueContext, domain: Arc<dyn Domain>) {
        self.on_open_queue_success(open, domain, RoutingConfiguration::default(), None)
    }

    /// Final part of the open pipeline: build or reuse the queue object,
    /// then ask the domain for a counted handle under a confirmation
    /// cookie.
    fn on_open_queue_success(
        &mut self,
        open: OpenQueueContext,
        domain: Arc<dyn Domain>,
        routing: RoutingConfiguration,
        upstream: Option<NodeId>,
    ) {
        let queue = match self.create_queue_factory(&open, routing, upstream.as_ref()) {
            Ok(queue) => queue,
            Err(status) => {
                open.complete(status, None);
                return;
            }
        };

        let app_id = open.app_id().to_string();
        if let Some(context) = self.registry.get_mut(&open.uri) {
            if let Some(substream) = context.live.substreams.get_mut(&app_id) {
                if !substream.transition(SubStreamState::Open) {
                    debug!(uri = %open.uri, app_id, state = ?substream.state, "substream already tracked");
                }
            }
            context.live.num_handle_creations_in_progress += 1;
        }

        let mut cookie_parameters = open.handle_parameters.clone();
        cookie_parameters.sub_stream = Some(SubStreamInfo {
            app_id: app_id.clone(),
            sub_queue_id: open.upstream_sub_queue_id,
        });
        let cookie = ConfirmationCookie::new(cookie_parameters.clone(), self.releases_tx.clone());

        let dispatcher = self.dispatcher.clone();
        domain.open_queue(
            queue,
            cookie_parameters,
            open.client.clone(),
            Box::new(move |status, handle| {
                dispatcher.post(move |helper| {
                    helper.on_queue_handle_granted(open, status, handle, cookie);
                });
            }),
        );
    }

    /// Factory creating (or reusing) the queue object for an open. Routing
    /// is validated against any existing queue.
    fn create_queue_factory(
        &mut self,
        open: &OpenQueueContext,
        routing: RoutingConfiguration,
        upstream: Option<&NodeId>,
    ) -> std::result::Result<Arc<Queue>, Status> {
        let is_local = upstream.is_none();
        let storage = self.storage.clone();
        let context = self
            .registry
            .get_mut(&open.uri)
            .ok_or_else(|| Error::Invariant(format!("no context for {}", open.uri)).to_status())?;

        if let Some(existing) = &context.live.queue {
            if let Some(known) = context.live.routing {
                if known.at_most_once() != routing.at_most_once() {
                    return Err(Status::new(
                        StatusCategory::Failed,
                        0,
                        "routing configuration mismatch with existing queue",
                    ));
                }
            }
            return Ok(existing.clone());
        }

        let partition = context.partition_id().unwrap_or(0);
        let queue = if is_local {
            let storage_key = context.storage_key().unwrap_or_default();
            storage.provision_queue(open.uri.as_str(), partition, storage_key)?;
            Arc::new(Queue::new_local(open.uri.clone(), partition))
        } else {
            Arc::new(Queue::new_remote(
                open.uri.clone(),
                context.live.id,
                partition,
            ))
        };

        context.live.queue = Some(queue.clone());
        context.live.routing = Some(routing);
        Ok(queue)
    }

    fn on_queue_handle_granted(
        &mut self,
        open: OpenQueueContext,
        status: Status,
        handle: Option<QueueHandle>,
        cookie: ConfirmationCookie,
    ) {
        let uri = open.uri.clone();
        let app_id = open.app_id().to_string();

        if !status.is_success() || handle.is_none() {
            // dropping the armed cookie releases the counted handle upstream
            drop(cookie);
            if let Some(context) = self.registry.get_mut(&uri) {
                context.live.num_handle_creations_in_progress =
                    context.live.num_handle_creations_in_progress.saturating_sub(1);
            }
            warn!(uri = %uri, %status, "domain refused queue handle");
            open.complete(status, None);
            return;
        }

        if let Some(context) = self.registry.get_mut(&uri) {
            if let Some(substream) = context.live.substreams.get_mut(&app_id) {
                substream.add_counts(&open.handle_parameters);
            }
            context.live.num_handle_creations_in_progress =
                context.live.num_handle_creations_in_progress.saturating_sub(1);
            context.live.num_handles += 1;
            context.live.expiration_deadline = None;
        }

        cookie.confirm();
        info!(uri = %uri, app_id, "queue opened");
        open.complete(Status::success(), handle);

        self.apply_pending_updates(&uri);
    }

    /// An armed confirmation cookie was dropped: release the counted handle
    /// back upstream.
    pub(crate) fn on_handle_release(&mut self, release: UnconfirmedHandle) {
        let Ok(uri) = QueueUri::parse(&release.parameters.uri) else {
            return;
        };
        warn!(uri = %uri, "releasing unconfirmed queue handle");

        let Some(context) = self.registry.get(&uri) else {
            return;
        };
        if context.live.queue.as_ref().is_some_and(|q| q.is_local()) {
            // local handle: nothing was counted upstream
            return;
        }
        let queue_id = context.live.id;
        let partition = context.partition_id().unwrap_or(0);
        let Some((upstream, _)) = self.topology.upstream_and_generation(partition) else {
            return;
        };

        let transport = self.transport.clone();
        let dispatcher = self.dispatcher.clone();
        let timeout = self.config.close_timeout;
        let handle_parameters = release.parameters;
        self.requests.send(
            transport.as_ref(),
            &dispatcher,
            upstream,
            timeout,
            move |header| ControlMessage::CloseQueueRequest {
                header,
                queue_id,
                handle_parameters,
                is_final: false,
            },
            Box::new(|_helper, outcome| {
                debug!(status = %outcome.status(), "unconfirmed-handle release completed");
            }),
        );
    }

    pub(crate) fn mark_substream_failed(&mut self, uri: &QueueUri, app_id: &str) {
        if let Some(context) = self.registry.get_mut(uri) {
            if let Some(substream) = context.live.substreams.get_mut(app_id) {
                if !substream.transition(SubStreamState::Failed) {
                    debug!(uri = %uri, app_id, state = ?substream.state, "substream not failable");
                }
            }
        }
    }

    // ==================== Configure / release ====================

    /// (Re)configure one substream. While the substream is closed or
    /// reopening the parameters are cached and acknowledged immediately;
    /// the restorer reconciles them upstream on reopen.
    pub(crate) fn configure_queue(
        &mut self,
        uri: QueueUri,
        stream_parameters: StreamParameters,
        upstream_sub_queue_id: u32,
        callback: ConfiguredCallback,
    ) {
        let Some(context) = self.registry.get_mut(&uri) else {
            callback(
                Status::new(StatusCategory::Refused, 0, "unknown queue"),
                stream_parameters,
            );
            return;
        };
        let is_local = context.live.queue.as_ref().is_some_and(|q| q.is_local());
        let queue_id = context.live.id;
        let Some(substream) = context.live.substream_by_id_mut(upstream_sub_queue_id) else {
            callback(
                Status::new(StatusCategory::Refused, 0, "unknown substream"),
                stream_parameters,
            );
            return;
        };

        substream.stream_parameters = Some(stream_parameters.clone());

        if is_local {
            callback(Status::success(), stream_parameters);
            return;
        }

        match substream.state {
            SubStreamState::Open => {
                let partition = self.partition_of(&uri).unwrap_or(0);
                let Some((upstream, _)) = self.topology.upstream_and_generation(partition)
                else {
                    callback(
                        Error::UpstreamUnavailable {
                            partition: Some(partition),
                        }
                        .to_status(),
                        stream_parameters,
                    );
                    return;
                };
                let transport = self.transport.clone();
                let dispatcher = self.dispatcher.clone();
                let timeout = self.config.configure_timeout;
                let request_parameters = stream_parameters.clone();
                self.requests.send(
                    transport.as_ref(),
                    &dispatcher,
                    upstream,
                    timeout,
                    move |header| ControlMessage::ConfigureQueueStreamRequest {
                        header,
                        queue_id,
                        stream_parameters: request_parameters,
                    },
                    Box::new(move |_helper, outcome| match outcome {
                        RequestOutcome::Response(
                            ControlMessage::ConfigureQueueStreamResponse {
                                header,
                                stream_parameters,
                                ..
                            },
                        ) => callback(header.status, stream_parameters),
                        other => callback(other.status(), stream_parameters),
                    }),
                );
            }
            // cached: answered immediately, reconciled on reopen
            SubStreamState::Closed | SubStreamState::Reopening => {
                callback(Status::success(), stream_parameters);
            }
            SubStreamState::Failed => {
                callback(
                    Error::UpstreamUnavailable { partition: None }.to_status(),
                    stream_parameters,
                );
            }
        }
    }

    /// Release counted access to a substream. When the counts drop to zero
    /// the substream is removed and a final close goes upstream. Releases
    /// arriving while the substream reopens are buffered.
    pub(crate) fn release_queue(
        &mut self,
        handle_parameters: QueueHandleParameters,
        upstream_sub_queue_id: u32,
        callback: ReleasedCallback,
    ) {
        let Ok(uri) = QueueUri::parse(&handle_parameters.uri) else {
            callback(Status::new(StatusCategory::Refused, 0, "invalid uri"));
            return;
        };
        let Some(context) = self.registry.get_mut(&uri) else {
            callback(Status::new(StatusCategory::Refused, 0, "unknown queue"));
            return;
        };
        let is_local = context.live.queue.as_ref().is_some_and(|q| q.is_local());
        let queue_id = context.live.id;
        let Some(substream) = context.live.substream_by_id_mut(upstream_sub_queue_id) else {
            callback(Status::new(StatusCategory::Refused, 0, "unknown substream"));
            return;
        };

        if substream.state == SubStreamState::Reopening {
            substream.pending_close_requests.push(PendingClose {
                handle_parameters,
                callback,
            });
            return;
        }

        let drained = substream.subtract_counts(&handle_parameters);
        let app_id = substream.app_id.clone();
        let state = substream.state;

        if drained {
            context.live.substreams.remove(&app_id);
        }

        if is_local || state != SubStreamState::Open {
            // nothing is counted upstream; answer immediately
            callback(Status::success());
            return;
        }

        let partition = self.partition_of(&uri).unwrap_or(0);
        let Some((upstream, _)) = self.topology.upstream_and_generation(partition) else {
            callback(
                Error::UpstreamUnavailable {
                    partition: Some(partition),
                }
                .to_status(),
            );
            return;
        };
        let transport = self.transport.clone();
        let dispatcher = self.dispatcher.clone();
        let timeout = self.config.close_timeout;
        self.requests.send(
            transport.as_ref(),
            &dispatcher,
            upstream,
            timeout,
            move |header| ControlMessage::CloseQueueRequest {
                header,
                queue_id,
                handle_parameters,
                is_final: drained,
            },
            Box::new(move |_helper, outcome| callback(outcome.status())),
        );
    }

    /// Flush close requests buffered while a substream reopened. On
    /// success the closes are issued; on failure each buffered callback is
    /// failed.
    pub(crate) fn process_pending_closes(&mut self, uri: &QueueUri, app_id: &str, reopened: bool) {
        let Some(context) = self.registry.get_mut(uri) else {
            return;
        };
        let Some(substream) = context.live.substreams.get_mut(app_id) else {
            return;
        };
        let pending = std::mem::take(&mut substream.pending_close_requests);
        if pending.is_empty() {
            return;
        }
        let sub_queue_id = substream.upstream_sub_queue_id;

        for close in pending {
            if reopened {
                self.release_queue(close.handle_parameters, sub_queue_id, close.callback);
            } else {
                (close.callback)(
                    Error::UpstreamUnavailable { partition: None }.to_status(),
                );
            }
        }
    }

    // ==================== Handle lifecycle ====================

    pub(crate) fn on_queue_handle_created(&mut self, uri: &QueueUri, handle_created: bool) {
        if let Some(context) = self.registry.get_mut(uri) {
            context.live.num_handle_creations_in_progress =
                context.live.num_handle_creations_in_progress.saturating_sub(1);
            if handle_created {
                context.live.num_handles += 1;
                context.live.expiration_deadline = None;
            }
        }
    }

    pub(crate) fn on_queue_handle_destroyed(&mut self, uri: &QueueUri) {
        let expiration = self.config.queue_expiration;
        if let Some(context) = self.registry.get_mut(uri) {
            context.live.num_handles = context.live.num_handles.saturating_sub(1);
            if context.live.num_handles == 0
                && context.live.num_handle_creations_in_progress == 0
            {
                context.live.expiration_deadline = Some(Instant::now() + expiration);
            }
        }
    }

    // ==================== App-id updates ====================

    /// Apply an app-id update to one queue or a whole domain. Updates for a
    /// queue whose object does not exist yet are parked and applied after
    /// creation.
    pub(crate) fn on_queue_updated(
        &mut self,
        uri: Option<QueueUri>,
        domain: String,
        added: Vec<String>,
        removed: Vec<String>,
    ) {
        let targets: Vec<QueueUri> = match uri {
            Some(uri) => vec![uri],
            None => self
                .registry
                .uris()
                .into_iter()
                .filter(|u| u.domain() == domain)
                .collect(),
        };

        for target in targets {
            let Some(context) = self.registry.get_mut(&target) else {
                continue;
            };
            if context.live.queue.is_none() {
                context.live.pending_updates.push_back(crate::context::AppUpdate {
                    added: added.clone(),
                    removed: removed.clone(),
                });
                continue;
            }
            Self::apply_app_update(context, &added, &removed);
        }
    }

    fn apply_app_update(
        context: &mut crate::context::QueueContext,
        added: &[String],
        removed: &[String],
    ) {
        if let Some(persisted) = &mut context.persisted {
            for app_id in added {
                let key = fingerprint(app_id);
                persisted.app_keys.insert(app_id.clone(), key);
            }
            for app_id in removed {
                persisted.app_keys.remove(app_id);
            }
        }
        for app_id in removed {
            if let Some(substream) = context.live.substreams.get(app_id) {
                if substream.is_drained() {
                    context.live.substreams.remove(app_id);
                }
            }
        }
        debug!(uri = %context.uri(), added = added.len(), removed = removed.len(), "applied app update");
    }

    pub(crate) fn apply_pending_updates(&mut self, uri: &QueueUri) {
        let Some(context) = self.registry.get_mut(uri) else {
            return;
        };
        if context.live.queue.is_none() {
            return;
        }
        while let Some(update) = context.live.pending_updates.pop_front() {
            Self::apply_app_update(context, &update.added, &update.removed);
        }
    }

    // ==================== Peer requests ====================

    /// Entry point for every frame received from a peer
    pub(crate) fn process_peer_message(&mut self, peer: NodeId, message: ControlMessage) {
        if message.is_request() {
            self.process_peer_request(peer, message);
        } else {
            self.process_peer_response(message);
        }
    }

    pub(crate) fn process_peer_response(&mut self, message: ControlMessage) {
        match self.requests.take(message.request_id()) {
            Some(pending) => pending.complete(self, RequestOutcome::Response(message)),
            None => debug!(
                request_id = message.request_id(),
                "dropping response for unknown request"
            ),
        }
    }

    fn process_peer_request(&mut self, peer: NodeId, message: ControlMessage) {
        match message {
            ControlMessage::OpenQueueRequest {
                header,
                handle_parameters,
                queue_id,
                is_reopen,
            } => {
                if let Err(error) = header.validate_version() {
                    self.respond(
                        &peer,
                        ControlMessage::OpenQueueResponse {
                            header: ResponseHeader::with_status(
                                header.request_id,
                                Status::new(StatusCategory::NotSupported, 0, error.to_string()),
                            ),
                            queue_id,
                            routing_configuration: RoutingConfiguration::default(),
                            deduplication_time_ms: 0,
                        },
                    );
                    return;
                }
                self.process_peer_open_queue_request(
                    peer,
                    header.request_id,
                    handle_parameters,
                    queue_id,
                    is_reopen,
                );
            }
            ControlMessage::ConfigureQueueStreamRequest {
                header,
                queue_id,
                stream_parameters,
            } => {
                self.process_peer_configure_stream_request(
                    peer,
                    header.request_id,
                    queue_id,
                    stream_parameters,
                );
            }
            ControlMessage::CloseQueueRequest {
                header,
                queue_id,
                handle_parameters,
                is_final,
            } => {
                self.process_peer_close_queue_request(
                    peer,
                    header.request_id,
                    queue_id,
                    handle_parameters,
                    is_final,
                );
            }
            ControlMessage::QueueAssignmentRequest { header, uri } => {
                self.process_peer_assignment_request(peer, header.request_id, uri);
            }
            ControlMessage::StopRequest {
                header,
                version,
                deadline_ms,
            } => {
                self.process_node_stopping_notification(
                    peer,
                    Some((header.request_id, version, deadline_ms)),
                    None,
                    None,
                );
            }
            other => {
                debug!(?other, "ignoring unexpected peer request");
            }
        }
    }

    /// Serve a peer's open: run it through the regular open pipeline on
    /// behalf of the peer and answer with the queue's routing.
    pub(crate) fn process_peer_open_queue_request(
        &mut self,
        peer: NodeId,
        request_id: u64,
        handle_parameters: QueueHandleParameters,
        peer_queue_id: u32,
        is_reopen: bool,
    ) {
        let uri_raw = handle_parameters.uri.clone();
        let domain_name = QueueUri::parse(&uri_raw)
            .map(|u| u.domain().to_string())
            .unwrap_or_default();
        let sub_queue_id = handle_parameters
            .sub_stream
            .as_ref()
            .map_or(0, |s| s.sub_queue_id);

        let dispatcher = self.dispatcher.clone();
        let responder = peer.clone();
        let callback: OpenQueueCallback = Box::new(move |status, handle| {
            dispatcher.post(move |helper| {
                let routing = handle
                    .as_ref()
                    .and_then(|h| {
                        helper
                            .registry
                            .get(h.queue.uri())
                            .and_then(|c| c.live.routing)
                    })
                    .unwrap_or_default();
                if let Some(handle) = handle {
                    helper
                        .peer_sessions
                        .entry(responder.clone())
                        .or_default()
                        .handles
                        .insert((peer_queue_id, sub_queue_id), handle);
                }
                helper.respond(
                    &responder,
                    ControlMessage::OpenQueueResponse {
                        header: ResponseHeader::with_status(request_id, status),
                        queue_id: peer_queue_id,
                        routing_configuration: routing,
                        deduplication_time_ms: 0,
                    },
                );
            });
        });

        if is_reopen {
            debug!(%peer, uri = %uri_raw, "processing peer reopen");
        }
        self.open_queue(
            uri_raw,
            domain_name,
            handle_parameters,
            ClientContext::peer(peer),
            callback,
        );
    }

    pub(crate) fn process_peer_configure_stream_request(
        &mut self,
        peer: NodeId,
        request_id: u64,
        queue_id: u32,
        stream_parameters: StreamParameters,
    ) {
        let known = self
            .peer_sessions
            .get(&peer)
            .is_some_and(|s| s.handles.contains_key(&(queue_id, stream_parameters.sub_queue_id)));

        let status = if known {
            Status::success()
        } else {
            Status::new(StatusCategory::Refused, 0, "unknown stream")
        };
        self.respond(
            &peer,
            ControlMessage::ConfigureQueueStreamResponse {
                header: ResponseHeader::with_status(request_id, status),
                queue_id,
                stream_parameters,
            },
        );
    }

    pub(crate) fn process_peer_close_queue_request(
        &mut self,
        peer: NodeId,
        request_id: u64,
        queue_id: u32,
        handle_parameters: QueueHandleParameters,
        is_final: bool,
    ) {
        if is_final {
            let sub_queue_id = handle_parameters
                .sub_stream
                .as_ref()
                .map_or(0, |s| s.sub_queue_id);
            let removed = self
                .peer_sessions
                .get_mut(&peer)
                .and_then(|s| s.handles.remove(&(queue_id, sub_queue_id)));
            if let Some(handle) = removed {
                let uri = handle.queue.uri().clone();
                self.on_queue_handle_destroyed(&uri);
            }
        }
        self.respond(
            &peer,
            ControlMessage::CloseQueueResponse {
                header: ResponseHeader::success(request_id),
                queue_id,
            },
        );
    }

    pub(crate) fn respond(&mut self, peer: &NodeId, message: ControlMessage) {
        if let Err(error) = self.transport.send(peer, message) {
            warn!(%peer, %error, "failed to send response");
        }
    }

    // ==================== Shutdown surface ====================

    /// Self-shutdown housekeeping: cancel timers and delete every queue
    /// with no clients.
    pub(crate) fn process_shutdown_event(&mut self) {
        for uri in self.registry.uris() {
            if let Some(context) = self.registry.get_mut(&uri) {
                for substream in context.live.substreams.values_mut() {
                    substream.cancel_unconfirmed_timer();
                }
            }
            if self
                .registry
                .get(&uri)
                .is_some_and(|c| c.can_delete() && c.live.queue.is_some())
            {
                self.delete_queue(&uri);
            }
        }
    }

    /// Stop receiving PUSHes while continuing CONFIRMs and PUTs: send a
    /// deconfigure for every open substream.
    pub(crate) fn request_to_stop_pushing(&mut self) {
        for uri in self.registry.uris() {
            let Some(context) = self.registry.get(&uri) else {
                continue;
            };
            if context.live.queue.as_ref().is_some_and(|q| q.is_local()) {
                continue;
            }
            let queue_id = context.live.id;
            let partition = context.partition_id().unwrap_or(0);
            let Some((upstream, _)) = self.topology.upstream_and_generation(partition) else {
                continue;
            };
            let substreams: Vec<(String, u32)> = context
                .live
                .substreams
                .values()
                .filter(|s| s.state == SubStreamState::Open && !s.is_writer_only())
                .map(|s| (s.app_id.clone(), s.upstream_sub_queue_id))
                .collect();

            for (app_id, sub_queue_id) in substreams {
                let transport = self.transport.clone();
                let dispatcher = self.dispatcher.clone();
                let timeout = self.config.configure_timeout;
                let upstream = upstream.clone();
                self.requests.send(
                    transport.as_ref(),
                    &dispatcher,
                    upstream,
                    timeout,
                    move |header| ControlMessage::ConfigureQueueStreamRequest {
                        header,
                        queue_id,
                        stream_parameters: StreamParameters::deconfigure(app_id, sub_queue_id),
                    },
                    Box::new(|_helper, outcome| {
                        debug!(status = %outcome.status(), "stop-pushing deconfigure completed");
                    }),
                );
            }
        }
    }

    /// A peer connection dropped: cancel every request in flight to it and
    /// release the handles it was granted. Reopens toward a replacement
    /// upstream are driven by the restorer, not from here.
    pub(crate) fn on_peer_disconnected(&mut self, peer: NodeId) {
        info!(%peer, "peer disconnected");
        if let Some(session) = self.peer_sessions.remove(&peer) {
            for handle in session.handles.into_values() {
                let uri = handle.queue.uri().clone();
                self.on_queue_handle_destroyed(&uri);
            }
        }

        let canceled = self.requests.take_peer(&peer);
        for request in canceled {
            request.complete(
                self,
                RequestOutcome::Canceled(Status::new(
                    StatusCategory::UpstreamUnavailable,
                    0,
                    "peer disconnected",
                )),
            );
        }
    }

    /// Cancel everything in flight and stop the dispatcher
    pub(crate) fn teardown(&mut self) {
        let canceled = self.requests.take_all();
        for request in canceled {
            request.complete(
                self,
                RequestOutcome::Canceled(Status::new(
                    StatusCategory::Canceled,
                    0,
                    "helper teardown",
                )),
            );
        }
        for uri in self.registry.uris() {
            if let Some(context) = self.registry.get_mut(&uri) {
                for substream in context.live.substreams.values_mut() {
                    substream.cancel_unconfirmed_timer();
                }
                // dropping pending contexts completes them with `Canceled`
                context.live.pending.clear();
            }
        }
        self.pending_reopens.clear();
        self.sync_reopen_mirror();
        self.dispatcher.stop();
    }

    // ==================== Queue deletion ====================

    pub(crate) fn delete_queue(&mut self, uri: &QueueUri) {
        if let Some(context) = self.registry.get_mut(uri) {
            for substream in context.live.substreams.values_mut() {
                substream.cancel_unconfirmed_timer();
            }
        }
        if let Some(context) = self.registry.remove(uri) {
            info!(uri = %uri, queue_id = context.live.id, "queue deleted");
        }
    }

    pub(crate) fn sync_reopen_mirror(&self) {
        self.pending_reopen_mirror
            .store(self.pending_reopens.len(), Ordering::Release);
    }
}

/// Deterministic 64-bit fingerprint used for storage and app keys
pub(crate) fn fingerprint(input: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    hasher.finish()
}

// ==================== Cross-thread handle ====================

/// Cross-thread surface of the queue helper. Cheap to clone; every call
/// posts onto the dispatcher and returns immediately unless documented
/// otherwise.
#[derive(Clone)]
pub struct HelperHandle {
    dispatcher: DispatcherHandle<ClusterQueueHelper>,
    pending_reopens: Arc<AtomicUsize>,
    shutdown_v2_enabled: Arc<AtomicBool>,
}

impl HelperHandle {
    /// Initiate the open-queue sequence for `uri` on `domain`. The callback
    /// fires exactly once with either a handle or a failure status.
    pub fn open_queue(
        &self,
        uri: impl Into<String>,
        domain: impl Into<String>,
        handle_parameters: QueueHandleParameters,
        client: ClientContext,
        callback: OpenQueueCallback,
    ) {
        let uri = uri.into();
        let domain = domain.into();
        self.dispatcher.post(move |helper| {
            helper.open_queue(uri, domain, handle_parameters, client, callback);
        });
    }

    pub fn configure_queue(
        &self,
        uri: QueueUri,
        stream_parameters: StreamParameters,
        upstream_sub_queue_id: u32,
        callback: ConfiguredCallback,
    ) {
        self.dispatcher.post(move |helper| {
            helper.configure_queue(uri, stream_parameters, upstream_sub_queue_id, callback);
        });
    }

    pub fn release_queue(
        &self,
        handle_parameters: QueueHandleParameters,
        upstream_sub_queue_id: u32,
        callback: ReleasedCallback,
    ) {
        self.dispatcher.post(move |helper| {
            helper.release_queue(handle_parameters, upstream_sub_queue_id, callback);
        });
    }

    pub fn on_queue_handle_created(&self, uri: QueueUri, handle_created: bool) {
        self.dispatcher
            .post(move |helper| helper.on_queue_handle_created(&uri, handle_created));
    }

    pub fn on_queue_handle_destroyed(&self, uri: QueueUri) {
        self.dispatcher
            .post(move |helper| helper.on_queue_handle_destroyed(&uri));
    }

    /// Deliver a decoded frame received from `peer`
    pub fn process_peer_message(&self, peer: NodeId, message: ControlMessage) {
        self.dispatcher
            .post(move |helper| helper.process_peer_message(peer, message));
    }

    /// Start the multi-step stop sequence for `peer`. `request` carries the
    /// wire request to respond to, if any; `partitions` filters the
    /// affected queues; `callback` fires when the drain completes.
    pub fn process_node_stopping_notification(
        &self,
        peer: NodeId,
        request: Option<(u64, StopVersion, u64)>,
        partitions: Option<Vec<u32>>,
        callback: Option<VoidCallback>,
    ) {
        self.dispatcher.post(move |helper| {
            helper.process_node_stopping_notification(peer, request, partitions, callback);
        });
    }

    /// The upstream connection for `partition` (or all, for a proxy)
    /// changed to `node`.
    pub fn on_upstream_node_change(&self, node: Option<NodeId>, partition: Option<u32>) {
        self.dispatcher
            .post(move |helper| helper.on_upstream_node_change(node, partition));
    }

    /// A peer connection dropped: in-flight requests to it are canceled
    /// with `UpstreamUnavailable` and its granted handles are released.
    pub fn on_peer_disconnected(&self, peer: NodeId) {
        self.dispatcher
            .post(move |helper| helper.on_peer_disconnected(peer));
    }

    pub fn process_shutdown_event(&self) {
        self.dispatcher
            .post(|helper| helper.process_shutdown_event());
    }

    pub fn request_to_stop_pushing(&self) {
        self.dispatcher
            .post(|helper| helper.request_to_stop_pushing());
    }

    /// V2 drain loop: tick until no unconfirmed messages remain or the
    /// absolute deadline passes, then invoke `callback`.
    pub fn check_unconfirmed_v2(&self, deadline: Instant, callback: VoidCallback) {
        self.dispatcher
            .post(move |helper| helper.check_unconfirmed_v2(deadline, callback));
    }

    /// Garbage-collect expired queues. Returns the number of queues
    /// deleted (marked queues count on the sweep that deletes them).
    pub async fn gc_expired_queues(
        &self,
        immediate: bool,
        domain: Option<String>,
    ) -> crate::error::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.dispatcher.post(move |helper| {
            let _ = tx.send(helper.gc_expired_queues(immediate, domain.as_deref()));
        });
        rx.await.map_err(Into::into)
    }

    pub async fn has_active_queue(&self, domain: String) -> crate::error::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.dispatcher.post(move |helper| {
            let _ = tx.send(helper.registry.has_active_queue(&domain));
        });
        rx.await.map_err(Into::into)
    }

    pub async fn load_queues_info(
        &self,
    ) -> crate::error::Result<Vec<crate::admin::QueueInfoSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.dispatcher.post(move |helper| {
            let _ = tx.send(helper.load_queues_info());
        });
        rx.await.map_err(Into::into)
    }

    pub async fn load_state(&self) -> crate::error::Result<crate::admin::HelperStateSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.dispatcher.post(move |helper| {
            let _ = tx.send(helper.load_state());
        });
        rx.await.map_err(Into::into)
    }

    /// Queue object registered under `id`, if any
    pub async fn lookup_queue(&self, id: u32) -> crate::error::Result<Option<Arc<Queue>>> {
        let (tx, rx) = oneshot::channel();
        self.dispatcher.post(move |helper| {
            let _ = tx.send(helper.registry.lookup_by_id(id));
        });
        rx.await.map_err(Into::into)
    }

    /// True while failover reopens are outstanding. Readable off-thread.
    pub fn is_failover_in_progress(&self) -> bool {
        self.num_pending_reopen_requests() != 0
    }

    pub fn num_pending_reopen_requests(&self) -> usize {
        self.pending_reopens.load(Ordering::Acquire)
    }

    /// Whether the V2 stop handshake is in force
    pub fn is_shutdown_logic_on(&self) -> bool {
        self.shutdown_v2_enabled.load(Ordering::Acquire)
    }

    /// Called by the membership layer once every node advertises V2 support
    pub fn set_shutdown_v2_enabled(&self, enabled: bool) {
        self.shutdown_v2_enabled.store(enabled, Ordering::Release);
    }

    /// Observer capability to register with the cluster-state subsystem
    pub fn observer(&self) -> Arc<dyn crate::observer::ClusterStateObserver> {
        Arc::new(HelperObserver {
            dispatcher: self.dispatcher.clone(),
        })
    }

    /// Cancel all in-flight work and stop the dispatcher
    pub fn teardown(&self) {
        self.dispatcher.post(|helper| helper.teardown());
    }
}

/// Observer adapter posting cluster-state callbacks onto the dispatcher
struct HelperObserver {
    dispatcher: DispatcherHandle<ClusterQueueHelper>,
}

impl crate::observer::ClusterStateObserver for HelperObserver {
    fn on_queue_assigned(&self, info: QueueAssignmentInfo) {
        self.dispatcher
            .post(move |helper| helper.on_queue_assigned(info));
    }

    fn on_queue_unassigned(&self, info: QueueAssignmentInfo) {
        self.dispatcher
            .post(move |helper| helper.on_queue_unassigned(info));
    }

    fn on_queue_updated(
        &self,
        uri: Option<QueueUri>,
        domain: String,
        added: Vec<String>,
        removed: Vec<String>,
    ) {
        self.dispatcher
            .post(move |helper| helper.on_queue_updated(uri, domain, added, removed));
    }

    fn on_cluster_leader(
        &self,
        node: Option<NodeId>,
        status: crate::topology::LeaderStatus,
        term: u64,
    ) {
        self.dispatcher
            .post(move |helper| helper.on_cluster_leader(node, status, term));
    }

    fn after_partition_primary_assignment(
        &self,
        partition_id: u32,
        primary: Option<NodeId>,
        status: crate::topology::PrimaryStatus,
        lease: u64,
    ) {
        self.dispatcher.post(move |helper| {
            helper.after_partition_primary_assignment(partition_id, primary, status, lease);
        });
    }

    fn on_self_node_status(&self, status: crate::topology::NodeStatus) {
        self.dispatcher
            .post(move |helper| helper.on_self_node_status(status));
    }
}
