//! End-to-end queue lifecycle scenarios
//!
//! Drives the queue helper against a scripted in-process transport and a
//! mock domain registry:
//! - open on an unassigned queue (assignment via the leader)
//! - concurrent opens coalescing onto one assignment and one substream
//! - failover reopen with generation-tagged requests
//! - the graceful stop handshake, with and without unconfirmed messages
//! - assignment rejection failing every pending open

use skein_cluster::{
    ChannelTransport, ClientContext, ClusterQueueHelper, ClusterStateObserver, ClusterTopology,
    Domain, DomainRegistry, HelperConfig, HelperHandle, LeaderStatus, NodeStatus, NullStorageManager,
    PrimaryStatus, QueueAssignmentInfo, QueueHandle, QueueUri,
};
use skein_protocol::{
    ControlMessage, NodeId, QueueFlags, QueueHandleParameters, ResponseHeader,
    RoutingConfiguration, Status, StatusCategory, StopVersion,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const URI: &str = "skein://acme/orders";

// ==================== Harness ====================

struct TestDomain {
    name: String,
    refuse_handles: bool,
}

impl Domain for TestDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_queue(
        &self,
        queue: Arc<skein_cluster::Queue>,
        parameters: QueueHandleParameters,
        client: ClientContext,
        callback: skein_cluster::domain::HandleGrantedCallback,
    ) {
        if self.refuse_handles {
            callback(
                Status::new(StatusCategory::Limit, 0, "handle quota exceeded"),
                None,
            );
            return;
        }
        callback(
            Status::success(),
            Some(QueueHandle {
                queue,
                parameters,
                client,
            }),
        );
    }
}

struct TestDomains {
    refuse_handles: bool,
}

impl DomainRegistry for TestDomains {
    fn open_domain(&self, name: &str, callback: skein_cluster::domain::DomainOpenedCallback) {
        callback(Ok(Arc::new(TestDomain {
            name: name.to_string(),
            refuse_handles: self.refuse_handles,
        })));
    }
}

struct Cluster {
    handle: HelperHandle,
    observer: Arc<dyn ClusterStateObserver>,
    sent: mpsc::UnboundedReceiver<(NodeId, ControlMessage)>,
}

fn start(topology: ClusterTopology, refuse_handles: bool) -> Cluster {
    let (transport, sent) = ChannelTransport::new();
    let handle = ClusterQueueHelper::spawn(
        HelperConfig::for_tests(topology.self_node.clone()),
        topology,
        Arc::new(transport),
        Arc::new(TestDomains { refuse_handles }),
        Arc::new(NullStorageManager),
        None,
    );
    let observer = handle.observer();
    Cluster {
        handle,
        observer,
        sent,
    }
}

/// Replica of a 4-partition member cluster, with leader `L` active and
/// `P` the active primary of partition 3.
fn start_replica() -> Cluster {
    let cluster = start(ClusterTopology::new_member("node-1".to_string(), 4), false);
    cluster.observer.on_self_node_status(NodeStatus::Available);
    cluster
        .observer
        .on_cluster_leader(Some("L".to_string()), LeaderStatus::Active, 1);
    cluster
        .observer
        .after_partition_primary_assignment(3, Some("P".to_string()), PrimaryStatus::Active, 1);
    cluster
}

/// Proxy whose active upstream is the remote leader `L1`
fn start_proxy() -> Cluster {
    let cluster = start(ClusterTopology::new_proxy("proxy-1".to_string()), false);
    cluster.observer.on_self_node_status(NodeStatus::Available);
    cluster
        .observer
        .on_cluster_leader(Some("L1".to_string()), LeaderStatus::Active, 1);
    cluster
}

async fn expect_sent(cluster: &mut Cluster) -> (NodeId, ControlMessage) {
    tokio::time::timeout(Duration::from_secs(2), cluster.sent.recv())
        .await
        .expect("no message sent within deadline")
        .expect("transport closed")
}

fn assignment_info(queue_id: u32, partition_id: u32, storage_key: u64) -> QueueAssignmentInfo {
    QueueAssignmentInfo {
        uri: QueueUri::parse(URI).unwrap(),
        queue_id,
        partition_id,
        storage_key,
        app_keys: HashMap::new(),
    }
}

fn reader_params() -> QueueHandleParameters {
    QueueHandleParameters::new(URI, QueueFlags::reader())
}

fn open(
    cluster: &Cluster,
    client: &str,
) -> oneshot::Receiver<(Status, Option<QueueHandle>)> {
    let (tx, rx) = oneshot::channel();
    cluster.handle.open_queue(
        URI,
        "acme",
        reader_params(),
        ClientContext::local(client),
        Box::new(move |status, handle| {
            let _ = tx.send((status, handle));
        }),
    );
    rx
}

fn open_response(request_id: u64, queue_id: u32) -> ControlMessage {
    ControlMessage::OpenQueueResponse {
        header: ResponseHeader::success(request_id),
        queue_id,
        routing_configuration: RoutingConfiguration::default(),
        deduplication_time_ms: 0,
    }
}

fn configure_response(request: &ControlMessage) -> ControlMessage {
    match request {
        ControlMessage::ConfigureQueueStreamRequest {
            header,
            queue_id,
            stream_parameters,
        } => ControlMessage::ConfigureQueueStreamResponse {
            header: ResponseHeader::success(header.request_id),
            queue_id: *queue_id,
            stream_parameters: stream_parameters.clone(),
        },
        other => panic!("expected configure request, got {other:?}"),
    }
}

// ==================== Scenarios ====================

#[tokio::test]
async fn open_on_unassigned_queue_assigns_then_opens() {
    let mut cluster = start_replica();
    let done = open(&cluster, "client-1");

    // one assignment request to the leader
    let (to, request) = expect_sent(&mut cluster).await;
    assert_eq!(to, "L");
    let request_id = request.request_id();
    assert!(matches!(
        request,
        ControlMessage::QueueAssignmentRequest { ref uri, .. } if uri == URI
    ));

    // leader acknowledges, then the assignment broadcast lands
    cluster.handle.process_peer_message(
        "L".to_string(),
        ControlMessage::QueueAssignmentResponse {
            header: ResponseHeader::success(request_id),
            uri: URI.to_string(),
            queue_id: 7,
            partition_id: 3,
            storage_key: 0xfeed,
            app_ids: vec![],
        },
    );
    cluster.observer.on_queue_assigned(assignment_info(7, 3, 0xfeed));

    // one open request to the primary of partition 3
    let (to, request) = expect_sent(&mut cluster).await;
    assert_eq!(to, "P");
    let open_id = request.request_id();
    match &request {
        ControlMessage::OpenQueueRequest {
            queue_id,
            is_reopen,
            handle_parameters,
            ..
        } => {
            assert_eq!(*queue_id, 7);
            assert!(!is_reopen);
            assert_eq!(handle_parameters.uri, URI);
        }
        other => panic!("expected open request, got {other:?}"),
    }

    cluster
        .handle
        .process_peer_message("P".to_string(), open_response(open_id, 7));

    let (status, handle) = done.await.unwrap();
    assert!(status.is_success(), "open failed: {status}");
    let handle = handle.expect("success must carry a handle");
    assert_eq!(handle.queue.uri().as_str(), URI);

    // the queue is reachable through the id index
    let queue = cluster.handle.lookup_queue(7).await.unwrap();
    assert_eq!(queue.expect("queue indexed by id").uri().as_str(), URI);
}

#[tokio::test]
async fn concurrent_opens_coalesce_on_one_assignment() {
    let mut cluster = start_replica();
    let first = open(&cluster, "client-1");
    let second = open(&cluster, "client-2");

    // exactly one assignment request despite two pending opens
    let (_, request) = expect_sent(&mut cluster).await;
    let request_id = request.request_id();
    assert!(matches!(request, ControlMessage::QueueAssignmentRequest { .. }));

    cluster.handle.process_peer_message(
        "L".to_string(),
        ControlMessage::QueueAssignmentResponse {
            header: ResponseHeader::success(request_id),
            uri: URI.to_string(),
            queue_id: 7,
            partition_id: 3,
            storage_key: 1,
            app_ids: vec![],
        },
    );
    cluster.observer.on_queue_assigned(assignment_info(7, 3, 1));

    // both opens go upstream, in arrival order, sharing the substream id
    let mut sub_ids = Vec::new();
    for _ in 0..2 {
        let (to, request) = expect_sent(&mut cluster).await;
        assert_eq!(to, "P");
        match &request {
            ControlMessage::OpenQueueRequest {
                handle_parameters, ..
            } => sub_ids.push(
                handle_parameters
                    .sub_stream
                    .as_ref()
                    .expect("substream info")
                    .sub_queue_id,
            ),
            other => panic!("expected open request, got {other:?}"),
        }
        cluster
            .handle
            .process_peer_message("P".to_string(), open_response(request.request_id(), 7));
    }
    assert_eq!(sub_ids[0], sub_ids[1]);

    let (status, handle) = first.await.unwrap();
    assert!(status.is_success());
    assert!(handle.is_some());
    let (status, handle) = second.await.unwrap();
    assert!(status.is_success());
    assert!(handle.is_some());

    // no assignment request was duplicated
    assert!(cluster.sent.try_recv().is_err());
}

#[tokio::test]
async fn failover_reopens_to_new_upstream() {
    let mut cluster = start_proxy();
    let done = open(&cluster, "client-1");

    // proxy assigns locally and opens straight to the active upstream
    let (to, request) = expect_sent(&mut cluster).await;
    assert_eq!(to, "L1");
    let queue_id = match &request {
        ControlMessage::OpenQueueRequest { queue_id, .. } => *queue_id,
        other => panic!("expected open request, got {other:?}"),
    };
    cluster
        .handle
        .process_peer_message("L1".to_string(), open_response(request.request_id(), queue_id));
    let (status, _) = done.await.unwrap();
    assert!(status.is_success());
    assert!(!cluster.handle.is_failover_in_progress());

    // leader moves to L2: one reopen to the new upstream
    cluster
        .observer
        .on_cluster_leader(Some("L2".to_string()), LeaderStatus::Active, 2);

    let (to, request) = expect_sent(&mut cluster).await;
    assert_eq!(to, "L2");
    match &request {
        ControlMessage::OpenQueueRequest { is_reopen, .. } => assert!(*is_reopen),
        other => panic!("expected reopen request, got {other:?}"),
    }
    assert!(cluster.handle.is_failover_in_progress());
    assert_eq!(cluster.handle.num_pending_reopen_requests(), 1);

    cluster
        .handle
        .process_peer_message("L2".to_string(), open_response(request.request_id(), queue_id));

    // reopen completes only through the paired configure response
    let (to, request) = expect_sent(&mut cluster).await;
    assert_eq!(to, "L2");
    assert!(cluster.handle.is_failover_in_progress());
    let response = configure_response(&request);
    cluster.handle.process_peer_message("L2".to_string(), response);

    // counter drains to zero
    tokio::time::timeout(Duration::from_secs(2), async {
        while cluster.handle.is_failover_in_progress() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("failover did not complete");
    assert_eq!(cluster.handle.num_pending_reopen_requests(), 0);
}

#[tokio::test]
async fn graceful_peer_stop_drains_and_responds_once() {
    let mut cluster = start_replica();
    let done = open(&cluster, "client-1");

    let (_, request) = expect_sent(&mut cluster).await;
    cluster.handle.process_peer_message(
        "L".to_string(),
        ControlMessage::QueueAssignmentResponse {
            header: ResponseHeader::success(request.request_id()),
            uri: URI.to_string(),
            queue_id: 7,
            partition_id: 3,
            storage_key: 1,
            app_ids: vec![],
        },
    );
    cluster.observer.on_queue_assigned(assignment_info(7, 3, 1));
    let (_, request) = expect_sent(&mut cluster).await;
    cluster
        .handle
        .process_peer_message("P".to_string(), open_response(request.request_id(), 7));
    assert!(done.await.unwrap().0.is_success());

    // the primary announces it is stopping
    cluster.handle.process_peer_message(
        "P".to_string(),
        ControlMessage::StopRequest {
            header: skein_protocol::RequestHeader::new(99, "P".to_string()),
            version: StopVersion::V1,
            deadline_ms: 1_000,
        },
    );

    // step 1: deconfigure with zero priorities
    let (to, request) = expect_sent(&mut cluster).await;
    assert_eq!(to, "P");
    match &request {
        ControlMessage::ConfigureQueueStreamRequest {
            stream_parameters, ..
        } => {
            assert!(stream_parameters.is_deconfigured());
            assert_eq!(stream_parameters.consumer_priority, 0);
        }
        other => panic!("expected deconfigure, got {other:?}"),
    }
    let response = configure_response(&request);
    cluster.handle.process_peer_message("P".to_string(), response);

    // step 3 follows immediately (no unconfirmed messages, no timer)
    let (to, request) = expect_sent(&mut cluster).await;
    assert_eq!(to, "P");
    let close_id = match &request {
        ControlMessage::CloseQueueRequest { queue_id, .. } => {
            assert_eq!(*queue_id, 7);
            request.request_id()
        }
        other => panic!("expected close, got {other:?}"),
    };
    cluster.handle.process_peer_message(
        "P".to_string(),
        ControlMessage::CloseQueueResponse {
            header: ResponseHeader::success(close_id),
            queue_id: 7,
        },
    );

    // step 4: exactly one stop response
    let (to, request) = expect_sent(&mut cluster).await;
    assert_eq!(to, "P");
    match request {
        ControlMessage::StopResponse { header, .. } => {
            assert_eq!(header.request_id, 99);
            assert!(header.is_success());
        }
        other => panic!("expected stop response, got {other:?}"),
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(100), cluster.sent.recv())
            .await
            .is_err(),
        "no further messages expected after the stop response"
    );
}

#[tokio::test]
async fn stop_times_out_on_unconfirmed_messages() {
    let mut cluster = start_replica();
    let done = open(&cluster, "client-1");

    let (_, request) = expect_sent(&mut cluster).await;
    cluster.handle.process_peer_message(
        "L".to_string(),
        ControlMessage::QueueAssignmentResponse {
            header: ResponseHeader::success(request.request_id()),
            uri: URI.to_string(),
            queue_id: 7,
            partition_id: 3,
            storage_key: 1,
            app_ids: vec![],
        },
    );
    cluster.observer.on_queue_assigned(assignment_info(7, 3, 1));
    let (_, request) = expect_sent(&mut cluster).await;
    cluster
        .handle
        .process_peer_message("P".to_string(), open_response(request.request_id(), 7));
    assert!(done.await.unwrap().0.is_success());

    // one delivered-but-unconfirmed message holds up the drain
    let queue = cluster.handle.lookup_queue(7).await.unwrap().unwrap();
    queue.push_delivered();

    let started = std::time::Instant::now();
    cluster.handle.process_peer_message(
        "P".to_string(),
        ControlMessage::StopRequest {
            header: skein_protocol::RequestHeader::new(99, "P".to_string()),
            version: StopVersion::V1,
            deadline_ms: 150,
        },
    );

    let (_, request) = expect_sent(&mut cluster).await;
    let response = configure_response(&request);
    cluster.handle.process_peer_message("P".to_string(), response);

    // the close is delayed until the stop deadline despite the missing
    // confirmation
    let (_, request) = expect_sent(&mut cluster).await;
    assert!(matches!(request, ControlMessage::CloseQueueRequest { .. }));
    assert!(
        started.elapsed() >= Duration::from_millis(100),
        "close must wait for the stop deadline"
    );
    cluster.handle.process_peer_message(
        "P".to_string(),
        ControlMessage::CloseQueueResponse {
            header: ResponseHeader::success(request.request_id()),
            queue_id: 7,
        },
    );

    let (_, request) = expect_sent(&mut cluster).await;
    assert!(matches!(request, ControlMessage::StopResponse { .. }));
}

#[tokio::test]
async fn assignment_rejection_fails_all_pending_opens() {
    let mut cluster = start_replica();
    let first = open(&cluster, "client-1");
    let second = open(&cluster, "client-2");

    let (_, request) = expect_sent(&mut cluster).await;
    cluster.handle.process_peer_message(
        "L".to_string(),
        ControlMessage::QueueAssignmentResponse {
            header: ResponseHeader::with_status(
                request.request_id(),
                Status::new(StatusCategory::Refused, -3, "domain disabled"),
            ),
            uri: URI.to_string(),
            queue_id: 0,
            partition_id: 0,
            storage_key: 0,
            app_ids: vec![],
        },
    );

    for rx in [first, second] {
        let (status, handle) = rx.await.unwrap();
        assert_eq!(status.category, StatusCategory::Refused);
        assert!(handle.is_none());
    }

    // the registry no longer knows the uri
    let info = cluster.handle.load_queues_info().await.unwrap();
    assert!(info.is_empty());
    assert!(!cluster
        .handle
        .has_active_queue("acme".to_string())
        .await
        .unwrap());
}

#[tokio::test]
async fn handle_refusal_releases_cookie_upstream() {
    // the domain grants no handles: the armed cookie must release the
    // upstream count with a close
    let mut cluster = start(ClusterTopology::new_member("node-1".to_string(), 4), true);
    cluster.observer.on_self_node_status(NodeStatus::Available);
    cluster
        .observer
        .on_cluster_leader(Some("L".to_string()), LeaderStatus::Active, 1);
    cluster
        .observer
        .after_partition_primary_assignment(3, Some("P".to_string()), PrimaryStatus::Active, 1);

    let done = open(&cluster, "client-1");
    let (_, request) = expect_sent(&mut cluster).await;
    cluster.handle.process_peer_message(
        "L".to_string(),
        ControlMessage::QueueAssignmentResponse {
            header: ResponseHeader::success(request.request_id()),
            uri: URI.to_string(),
            queue_id: 7,
            partition_id: 3,
            storage_key: 1,
            app_ids: vec![],
        },
    );
    cluster.observer.on_queue_assigned(assignment_info(7, 3, 1));

    let (_, request) = expect_sent(&mut cluster).await;
    cluster
        .handle
        .process_peer_message("P".to_string(), open_response(request.request_id(), 7));

    // the requester sees the refusal
    let (status, handle) = done.await.unwrap();
    assert_eq!(status.category, StatusCategory::Limit);
    assert!(handle.is_none());

    // and the counted handle is released upstream
    let (to, request) = expect_sent(&mut cluster).await;
    assert_eq!(to, "P");
    match request {
        ControlMessage::CloseQueueRequest {
            handle_parameters, ..
        } => assert_eq!(handle_parameters.uri, URI),
        other => panic!("expected release close, got {other:?}"),
    }
}
