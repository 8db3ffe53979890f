//! Failover state restoration
//!
//! When the leader, a partition primary, or the active upstream changes,
//! every affected queue is replayed against the new upstream: substreams
//! are marked reopening, a reopen request goes out per substream, and a
//! reconfigure follows each successful reopen. Each request carries the
//! `(upstream, generation)` tuple captured at send time; responses whose
//! tuple no longer matches the live topology are discarded as superseded.
//!
//! In-flight reopens are tracked as explicit tickets. The ticket count is
//! mirrored into an atomic so `is_failover_in_progress` stays readable off
//! the dispatcher, and a new restore pass retires the tickets it
//! supersedes, so the count provably returns to zero.

use crate::context::SubStreamState;
use crate::helper::ClusterQueueHelper;
use crate::request::RequestOutcome;
use crate::uri::QueueUri;
use skein_protocol::{ControlMessage, NodeId, StreamParameters};
use tracing::{debug, info, warn};

/// One in-flight reopen: a substream being replayed to a specific upstream
/// generation.
pub(crate) struct ReopenTicket {
    pub uri: QueueUri,
    pub app_id: String,
    /// `None` for proxy queues (all partitions share the one upstream)
    pub partition: Option<u32>,
    pub upstream: NodeId,
    pub generation: u64,
}

impl ClusterQueueHelper {
    /// Replay state for all queues (`partition == None`) or for the queues
    /// of one partition.
    pub(crate) fn restore_state(&mut self, partition: Option<u32>) {
        // retire tickets this pass supersedes; their responses will be
        // discarded on arrival
        let superseded: Vec<u64> = self
            .pending_reopens
            .iter()
            .filter(|(_, t)| partition.is_none() || t.partition == partition)
            .map(|(id, _)| *id)
            .collect();
        if !superseded.is_empty() {
            debug!(count = superseded.len(), "retiring superseded reopen tickets");
            for id in superseded {
                self.pending_reopens.remove(&id);
            }
            self.sync_reopen_mirror();
        }

        info!(partition = ?partition, "restoring queue state");
        for uri in self.registry.uris() {
            let (has_pending, queue_partition, is_local) = match self.registry.get(&uri) {
                Some(context) => (
                    !context.live.pending.is_empty(),
                    context.partition_id(),
                    context.live.queue.as_ref().is_some_and(|q| q.is_local()),
                ),
                None => continue,
            };

            if !self.is_queue_assigned(&uri) {
                if has_pending {
                    self.assign_queue(&uri);
                }
                continue;
            }

            if !self.topology.role.is_proxy() {
                if let Some(filter) = partition {
                    if queue_partition != Some(filter) {
                        continue;
                    }
                }
                // strictly-local queues have no upstream to restore
                if is_local {
                    self.on_queue_context_assigned(&uri);
                    continue;
                }
            }

            self.restore_queue(&uri);
        }
    }

    fn restore_queue(&mut self, uri: &QueueUri) {
        let partition = self.partition_of(uri);
        let Some((upstream, generation)) = self
            .topology
            .upstream_and_generation(partition.unwrap_or(0))
        else {
            debug!(uri = %uri, "no upstream to restore against");
            return;
        };

        let app_ids: Vec<String> = {
            let Some(context) = self.registry.get_mut(uri) else {
                return;
            };
            context
                .live
                .substreams
                .values_mut()
                .filter(|s| s.state != SubStreamState::Closed)
                .filter_map(|s| {
                    if s.transition(SubStreamState::Reopening) {
                        Some(s.app_id.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };

        for app_id in app_ids {
            self.send_reopen_request(uri.clone(), app_id, upstream.clone(), generation, 1);
        }

        // opens parked while no upstream was available can proceed now
        self.on_queue_context_assigned(uri);
    }

    fn send_reopen_request(
        &mut self,
        uri: QueueUri,
        app_id: String,
        upstream: NodeId,
        generation: u64,
        attempt: u32,
    ) {
        let (handle_parameters, queue_id) = {
            let Some(context) = self.registry.get(&uri) else {
                return;
            };
            let Some(substream) = context.live.substreams.get(&app_id) else {
                return;
            };
            (substream.parameters.clone(), context.live.id)
        };

        let ticket_id = self.next_reopen_ticket;
        self.next_reopen_ticket += 1;
        self.pending_reopens.insert(
            ticket_id,
            ReopenTicket {
                uri: uri.clone(),
                app_id: app_id.clone(),
                partition: self.partition_of(&uri),
                upstream: upstream.clone(),
                generation,
            },
        );
        self.sync_reopen_mirror();

        debug!(uri = %uri, app_id, %upstream, generation, attempt, "sending reopen");
        let transport = self.transport.clone();
        let dispatcher = self.dispatcher.clone();
        let timeout = self.config.open_timeout;
        self.requests.send(
            transport.as_ref(),
            &dispatcher,
            upstream,
            timeout,
            move |header| ControlMessage::OpenQueueRequest {
                header,
                handle_parameters,
                queue_id,
                is_reopen: true,
            },
            Box::new(move |helper, outcome| {
                helper.on_reopen_queue_response(ticket_id, attempt, outcome);
            }),
        );
    }

    fn on_reopen_queue_response(
        &mut self,
        ticket_id: u64,
        attempt: u32,
        outcome: RequestOutcome,
    ) {
        let Some(ticket) = self.pending_reopens.get(&ticket_id) else {
            // superseded by a newer restore pass
            return;
        };

        // generation check: accept only if the upstream is still the one the
        // request was sent to
        let current = self
            .topology
            .upstream_and_generation(ticket.partition.unwrap_or(0));
        if current != Some((ticket.upstream.clone(), ticket.generation)) {
            debug!(uri = %ticket.uri, "discarding reopen response from stale generation");
            self.retire_reopen_ticket(ticket_id);
            return;
        }

        let status = outcome.status();
        if status.is_success() {
            if let RequestOutcome::Response(ControlMessage::OpenQueueResponse { .. }) = outcome {
                self.on_reopen_succeeded(ticket_id);
                return;
            }
        }

        // failure or mismatched response: retry with backoff, then give up
        if attempt < self.config.reopen_max_attempts {
            let backoff = self.config.reopen_retry_backoff * attempt;
            debug!(uri = %ticket.uri, attempt, %status, "reopen failed, scheduling retry");
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                dispatcher.post(move |helper| helper.retry_reopen(ticket_id, attempt + 1));
            });
        } else {
            warn!(uri = %ticket.uri, app_id = %ticket.app_id, %status, "reopen attempts exhausted");
            self.on_reopen_failed(ticket_id);
        }
    }

    fn retry_reopen(&mut self, ticket_id: u64, attempt: u32) {
        let Some(ticket) = self.pending_reopens.remove(&ticket_id) else {
            return;
        };
        self.sync_reopen_mirror();

        // re-send only while the captured generation is still current
        let current = self
            .topology
            .upstream_and_generation(ticket.partition.unwrap_or(0));
        if current != Some((ticket.upstream.clone(), ticket.generation)) {
            return;
        }
        self.send_reopen_request(
            ticket.uri,
            ticket.app_id,
            ticket.upstream,
            ticket.generation,
            attempt,
        );
    }

    /// Reopen succeeded: flush buffered closes, then reconcile stream
    /// parameters with a configure. The ticket is retired only once the
    /// configure response arrives.
    fn on_reopen_succeeded(&mut self, ticket_id: u64) {
        let Some(ticket) = self.pending_reopens.get(&ticket_id) else {
            return;
        };
        let uri = ticket.uri.clone();
        let app_id = ticket.app_id.clone();
        let upstream = ticket.upstream.clone();

        let (queue_id, stream_parameters) = {
            let Some(context) = self.registry.get_mut(&uri) else {
                self.retire_reopen_ticket(ticket_id);
                return;
            };
            let queue_id = context.live.id;
            let Some(substream) = context.live.substreams.get_mut(&app_id) else {
                self.retire_reopen_ticket(ticket_id);
                return;
            };
            if !substream.transition(SubStreamState::Open) {
                debug!(uri = %uri, app_id, state = ?substream.state, "reopen response for settled substream");
            }
            let parameters = substream.stream_parameters.clone().unwrap_or_else(|| {
                StreamParameters::new(app_id.clone(), substream.upstream_sub_queue_id)
            });
            (queue_id, parameters)
        };

        debug!(uri = %uri, app_id, "reopen succeeded, reconciling configuration");
        self.process_pending_closes(&uri, &app_id, true);

        let transport = self.transport.clone();
        let dispatcher = self.dispatcher.clone();
        let timeout = self.config.configure_timeout;
        self.requests.send(
            transport.as_ref(),
            &dispatcher,
            upstream,
            timeout,
            move |header| ControlMessage::ConfigureQueueStreamRequest {
                header,
                queue_id,
                stream_parameters,
            },
            Box::new(move |helper, outcome| {
                helper.on_reopen_configure_response(ticket_id, outcome);
            }),
        );
    }

    /// Configure response paired with a reopen: this is the point where the
    /// pending-reopen count drops.
    fn on_reopen_configure_response(&mut self, ticket_id: u64, outcome: RequestOutcome) {
        let Some(ticket) = self.pending_reopens.remove(&ticket_id) else {
            return;
        };
        self.sync_reopen_mirror();

        let status = outcome.status();
        let restored = status.is_success();
        if restored {
            info!(uri = %ticket.uri, app_id = %ticket.app_id, "substream restored");
        } else {
            warn!(uri = %ticket.uri, app_id = %ticket.app_id, %status, "reconfigure after reopen failed");
        }
        self.notify_queue(&ticket.uri, &ticket.app_id, ticket.generation, restored);
    }

    /// Reopen gave up: the substream is failed, buffered closes are failed,
    /// and the queue NACKs its pending PUTs.
    fn on_reopen_failed(&mut self, ticket_id: u64) {
        let Some(ticket) = self.pending_reopens.remove(&ticket_id) else {
            return;
        };
        self.sync_reopen_mirror();

        self.mark_substream_failed(&ticket.uri, &ticket.app_id);
        self.process_pending_closes(&ticket.uri, &ticket.app_id, false);
        self.notify_queue(&ticket.uri, &ticket.app_id, ticket.generation, false);
    }

    /// Tell the queue object the outcome of its restore: retransmit pending
    /// work on success, NACK pending PUTs on failure.
    fn notify_queue(&mut self, uri: &QueueUri, app_id: &str, generation: u64, restored: bool) {
        let Some(context) = self.registry.get(uri) else {
            return;
        };
        let Some(queue) = context.live.queue.clone() else {
            return;
        };
        let writer_only = context
            .live
            .substreams
            .get(app_id)
            .is_some_and(|s| s.is_writer_only());

        if restored {
            queue.on_upstream_restored(generation, writer_only);
        } else {
            queue.on_upstream_lost();
        }
    }

    fn retire_reopen_ticket(&mut self, ticket_id: u64) {
        if self.pending_reopens.remove(&ticket_id).is_some() {
            self.sync_reopen_mirror();
        }
    }

    /// The upstream connection for a partition (or for the whole proxy)
    /// changed availability.
    pub(crate) fn on_upstream_node_change(
        &mut self,
        node: Option<NodeId>,
        partition: Option<u32>,
    ) {
        info!(node = ?node, partition = ?partition, "upstream node changed");
        if self.topology.role.is_proxy() {
            self.topology.active_upstream = node.clone();
            if node.is_some() {
                self.restore_state(None);
            }
            return;
        }
        if node.is_some() {
            self.restore_state(partition);
        }
    }
}
