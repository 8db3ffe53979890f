//! Graceful-shutdown drainage
//!
//! When a peer announces it is stopping (StopRequest or a CLOSING
//! advisory), every queue whose upstream is that peer is walked through
//! four steps: deconfigure (stop the PUSHes), wait for outstanding consumer
//! confirmations, close, and finally answer the peer. Multiple stop
//! notifications from one peer are serialized: a newer context back-links
//! to the older one and finishes only after the older has answered.
//!
//! Two codepaths coexist: V1 arms a wait timer per substream, V2 runs one
//! drain loop against the absolute deadline. V2 is used only when every
//! cluster node supports it.

use crate::context::SubStreamState;
use crate::helper::{ClusterQueueHelper, VoidCallback};
use crate::uri::QueueUri;
use parking_lot::Mutex;
use skein_protocol::{
    ControlMessage, NodeId, ResponseHeader, StopVersion, StreamParameters,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info};

/// Work the drainer runs once a barrier empties
type DrainContinuation = Box<dyn FnOnce(&mut ClusterQueueHelper) + Send>;

/// Context of one stop handshake with a peer
pub(crate) struct StopState {
    pub peer: NodeId,
    /// Wire request to answer; `None` for advisories
    pub request_id: Option<u64>,
    pub version: StopVersion,
    pub callback: Mutex<Option<VoidCallback>>,
    /// Absolute point after which the response goes out regardless
    pub deadline: Instant,
    /// Older handshake from the same peer, answered before this one
    pub previous: Option<Arc<StopState>>,

    /// Outstanding steps in the current phase
    remaining: AtomicUsize,
    finished: AtomicBool,
    /// Runs when `remaining` drains; absent means "finish the sequence"
    on_drained: Mutex<Option<DrainContinuation>>,
    /// Finishers of newer contexts waiting on this one
    chained: Mutex<Vec<DrainContinuation>>,
}

impl StopState {
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl ClusterQueueHelper {
    /// Start the multi-step stop processing for `peer`
    pub(crate) fn process_node_stopping_notification(
        &mut self,
        peer: NodeId,
        request: Option<(u64, StopVersion, u64)>,
        partitions: Option<Vec<u32>>,
        callback: Option<VoidCallback>,
    ) {
        let v2_enabled = self.shutdown_v2_enabled.load(Ordering::Acquire);
        let requested_version = request
            .map(|(_, version, _)| version)
            .unwrap_or(if v2_enabled { StopVersion::V2 } else { StopVersion::V1 });
        let version = if requested_version == StopVersion::V2 && v2_enabled {
            StopVersion::V2
        } else {
            StopVersion::V1
        };

        let budget = request
            .map(|(_, _, deadline_ms)| deadline_ms)
            .filter(|ms| *ms > 0)
            .map(std::time::Duration::from_millis)
            .unwrap_or(self.config.stop_timeout);

        let previous = self
            .stop_contexts
            .get(&peer)
            .and_then(Weak::upgrade)
            .filter(|c| !c.is_finished());

        let context = Arc::new(StopState {
            peer: peer.clone(),
            request_id: request.map(|(id, _, _)| id),
            version,
            callback: Mutex::new(callback),
            deadline: Instant::now() + budget,
            previous,
            remaining: AtomicUsize::new(1), // setup guard
            finished: AtomicBool::new(false),
            on_drained: Mutex::new(None),
            chained: Mutex::new(Vec::new()),
        });
        self.stop_contexts
            .insert(peer.clone(), Arc::downgrade(&context));

        let affected = self.queues_with_upstream(&peer, partitions.as_deref());
        info!(
            %peer,
            queues = affected.len(),
            version = ?version,
            "processing node stopping notification"
        );

        match version {
            StopVersion::V2 => self.stop_drain_v2(context, affected),
            StopVersion::V1 => self.stop_drain_v1(context, affected),
        }
    }

    /// Queues whose upstream is `peer`: everything for a proxy whose active
    /// node is stopping, the matching partitions for a member.
    fn queues_with_upstream(&self, peer: &NodeId, partitions: Option<&[u32]>) -> Vec<QueueUri> {
        self.registry
            .uris()
            .into_iter()
            .filter(|uri| {
                let Some(context) = self.registry.get(uri) else {
                    return false;
                };
                if context.live.substreams.is_empty() {
                    return false;
                }
                if self.topology.role.is_proxy() {
                    return self.topology.active_upstream.as_ref() == Some(peer)
                        || self.topology.leader.as_ref() == Some(peer);
                }
                let Some(partition) = context.partition_id() else {
                    return false;
                };
                if let Some(filter) = partitions {
                    if !filter.contains(&partition) {
                        return false;
                    }
                }
                self.topology
                    .partition(partition)
                    .is_some_and(|info| info.primary.as_ref() == Some(peer))
            })
            .collect()
    }

    // ==================== V1: per-substream wait timers ====================

    fn stop_drain_v1(&mut self, context: Arc<StopState>, affected: Vec<QueueUri>) {
        for uri in affected {
            let substreams = self.open_substreams(&uri);
            for (app_id, writer_only) in substreams {
                context.remaining.fetch_add(1, Ordering::AcqRel);
                if writer_only {
                    // nothing is pushed to a writer; skip straight to close
                    self.stop_close_queue(context.clone(), uri.clone(), app_id);
                } else {
                    self.stop_deconfigure(context.clone(), uri.clone(), app_id);
                }
            }
        }
        self.stop_step_done(context); // release the setup guard
    }

    fn open_substreams(&self, uri: &QueueUri) -> Vec<(String, bool)> {
        self.registry
            .get(uri)
            .map(|context| {
                context
                    .live
                    .substreams
                    .values()
                    .filter(|s| s.state == SubStreamState::Open)
                    .map(|s| (s.app_id.clone(), s.is_writer_only()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Step 1: zero consumer priorities upstream so the peer stops pushing
    fn stop_deconfigure(&mut self, context: Arc<StopState>, uri: QueueUri, app_id: String) {
        let Some((queue_id, sub_queue_id)) = self.substream_ids(&uri, &app_id) else {
            self.stop_step_done(context);
            return;
        };

        let transport = self.transport.clone();
        let dispatcher = self.dispatcher.clone();
        let timeout = self.config.configure_timeout;
        let peer = context.peer.clone();
        let request_app_id = app_id.clone();
        debug!(uri = %uri, app_id, %peer, "stop: deconfiguring");
        self.requests.send(
            transport.as_ref(),
            &dispatcher,
            peer,
            timeout,
            move |header| ControlMessage::ConfigureQueueStreamRequest {
                header,
                queue_id,
                stream_parameters: StreamParameters::deconfigure(request_app_id, sub_queue_id),
            },
            Box::new(move |helper, outcome| {
                // any response continues the sequence
                debug!(status = %outcome.status(), "stop: deconfigure answered");
                helper.stop_wait_unconfirmed(context, uri, app_id);
            }),
        );
    }

    /// Step 2: wait for outstanding consumer confirmations, re-checking on a
    /// tick until the deadline.
    fn stop_wait_unconfirmed(&mut self, context: Arc<StopState>, uri: QueueUri, app_id: String) {
        let unconfirmed = self
            .registry
            .get(&uri)
            .and_then(|c| c.live.queue.as_ref().map(|q| q.unconfirmed_messages()))
            .unwrap_or(0);

        if unconfirmed == 0 || Instant::now() >= context.deadline {
            self.stop_close_queue(context, uri, app_id);
            return;
        }

        debug!(uri = %uri, unconfirmed, "stop: waiting for confirmations");
        let dispatcher = self.dispatcher.clone();
        let tick = self.config.unconfirmed_tick;
        let timer_uri = uri.clone();
        let timer_app_id = app_id.clone();
        let abort = tokio::spawn(async move {
            tokio::time::sleep(tick).await;
            dispatcher.post(move |helper| {
                helper.stop_check_unconfirmed(context, timer_uri, timer_app_id);
            });
        })
        .abort_handle();

        // stored so self-shutdown can cancel the wait
        if let Some(queue_context) = self.registry.get_mut(&uri) {
            if let Some(substream) = queue_context.live.substreams.get_mut(&app_id) {
                substream.cancel_unconfirmed_timer();
                substream.unconfirmed_timer = Some(abort);
            }
        }
    }

    fn stop_check_unconfirmed(&mut self, context: Arc<StopState>, uri: QueueUri, app_id: String) {
        if let Some(queue_context) = self.registry.get_mut(&uri) {
            if let Some(substream) = queue_context.live.substreams.get_mut(&app_id) {
                substream.unconfirmed_timer = None;
            }
        }
        self.stop_wait_unconfirmed(context, uri, app_id);
    }

    /// Step 3: close the queue upstream
    fn stop_close_queue(&mut self, context: Arc<StopState>, uri: QueueUri, app_id: String) {
        let snapshot = {
            let Some(queue_context) = self.registry.get(&uri) else {
                self.stop_step_done(context);
                return;
            };
            queue_context
                .live
                .substreams
                .get(&app_id)
                .map(|s| (queue_context.live.id, s.parameters.clone()))
        };
        let Some((queue_id, handle_parameters)) = snapshot else {
            self.stop_step_done(context);
            return;
        };

        let transport = self.transport.clone();
        let dispatcher = self.dispatcher.clone();
        let timeout = self.config.close_timeout;
        let peer = context.peer.clone();
        debug!(uri = %uri, app_id, %peer, "stop: closing");
        self.requests.send(
            transport.as_ref(),
            &dispatcher,
            peer,
            timeout,
            move |header| ControlMessage::CloseQueueRequest {
                header,
                queue_id,
                handle_parameters,
                is_final: true,
            },
            Box::new(move |helper, outcome| {
                debug!(status = %outcome.status(), "stop: close answered");
                helper.stop_step_done(context);
            }),
        );
    }

    /// A step completed; when the barrier drains, run the next phase or
    /// finish the sequence.
    fn stop_step_done(&mut self, context: Arc<StopState>) {
        if context.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let next = context.on_drained.lock().take();
        match next {
            Some(continuation) => continuation(self),
            None => self.finish_stop_sequence(context),
        }
    }

    // ==================== V2: single deadline loop ====================

    fn stop_drain_v2(&mut self, context: Arc<StopState>, affected: Vec<QueueUri>) {
        // once every deconfigure answered: one global wait, then close all
        let phase_context = context.clone();
        let phase_affected = affected.clone();
        *context.on_drained.lock() = Some(Box::new(move |helper| {
            let deadline = phase_context.deadline;
            let dispatcher = helper.dispatcher.clone();
            let close_context = phase_context;
            helper.check_unconfirmed_v2(
                deadline,
                Box::new(move || {
                    dispatcher.post(move |helper| {
                        helper.stop_close_all(close_context, phase_affected);
                    });
                }),
            );
        }));

        for uri in affected {
            for (app_id, writer_only) in self.open_substreams(&uri) {
                if writer_only {
                    continue;
                }
                context.remaining.fetch_add(1, Ordering::AcqRel);
                self.stop_deconfigure_v2(context.clone(), uri.clone(), app_id);
            }
        }
        self.stop_step_done(context);
    }

    fn stop_deconfigure_v2(&mut self, context: Arc<StopState>, uri: QueueUri, app_id: String) {
        let Some((queue_id, sub_queue_id)) = self.substream_ids(&uri, &app_id) else {
            self.stop_step_done(context);
            return;
        };
        let transport = self.transport.clone();
        let dispatcher = self.dispatcher.clone();
        let timeout = self.config.configure_timeout;
        let peer = context.peer.clone();
        self.requests.send(
            transport.as_ref(),
            &dispatcher,
            peer,
            timeout,
            move |header| ControlMessage::ConfigureQueueStreamRequest {
                header,
                queue_id,
                stream_parameters: StreamParameters::deconfigure(app_id, sub_queue_id),
            },
            Box::new(move |helper, outcome| {
                debug!(status = %outcome.status(), "stop: v2 deconfigure answered");
                helper.stop_step_done(context);
            }),
        );
    }

    fn stop_close_all(&mut self, context: Arc<StopState>, affected: Vec<QueueUri>) {
        context.remaining.fetch_add(1, Ordering::AcqRel); // phase guard
        for uri in affected {
            for (app_id, _) in self.open_substreams(&uri) {
                context.remaining.fetch_add(1, Ordering::AcqRel);
                self.stop_close_queue(context.clone(), uri.clone(), app_id);
            }
        }
        self.stop_step_done(context);
    }

    /// Tick until no unconfirmed messages remain anywhere or the deadline
    /// passes, then invoke the completion callback.
    pub(crate) fn check_unconfirmed_v2(&mut self, deadline: Instant, callback: VoidCallback) {
        let mut total: u64 = 0;
        self.registry.for_each(|context| {
            if let Some(queue) = &context.live.queue {
                total += queue.unconfirmed_messages();
            }
        });

        if total == 0 || Instant::now() >= deadline {
            debug!(total, "unconfirmed drain complete");
            callback();
            return;
        }

        debug!(total, "unconfirmed messages outstanding, ticking");
        let dispatcher = self.dispatcher.clone();
        let tick = self.config.unconfirmed_tick;
        tokio::spawn(async move {
            tokio::time::sleep(tick).await;
            dispatcher.post(move |helper| helper.check_unconfirmed_v2(deadline, callback));
        });
    }

    // ==================== Step 4: respond ====================

    /// Answer the peer. If an older handshake from the same peer is still
    /// in flight, this one parks itself until the older answers.
    fn finish_stop_sequence(&mut self, context: Arc<StopState>) {
        if context.is_finished() {
            return;
        }

        if let Some(previous) = &context.previous {
            if !previous.is_finished() {
                debug!(peer = %context.peer, "stop sequence waiting on previous handshake");
                let chained = context.clone();
                previous
                    .chained
                    .lock()
                    .push(Box::new(move |helper| helper.finish_stop_sequence(chained)));
                return;
            }
        }

        context.finished.store(true, Ordering::Release);
        info!(peer = %context.peer, "stop sequence complete");

        if let Some(request_id) = context.request_id {
            self.respond(
                &context.peer,
                ControlMessage::StopResponse {
                    header: ResponseHeader::success(request_id),
                    version: context.version,
                },
            );
        }
        if let Some(callback) = context.callback.lock().take() {
            callback();
        }

        // drop the peer-index entry when it still points at this handshake
        let points_here = self
            .stop_contexts
            .get(&context.peer)
            .and_then(Weak::upgrade)
            .is_some_and(|current| Arc::ptr_eq(&current, &context));
        if points_here {
            self.stop_contexts.remove(&context.peer);
        }

        let chained: Vec<DrainContinuation> = std::mem::take(&mut *context.chained.lock());
        for continuation in chained {
            continuation(self);
        }
    }

    fn substream_ids(&self, uri: &QueueUri, app_id: &str) -> Option<(u32, u32)> {
        let context = self.registry.get(uri)?;
        let substream = context.live.substreams.get(app_id)?;
        Some((context.live.id, substream.upstream_sub_queue_id))
    }
}
