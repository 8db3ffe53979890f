//! Peer transport boundary
//!
//! The real TCP/TLS stack lives outside this crate. The helper only needs a
//! send capability; inbound frames are delivered by the host through
//! [`crate::helper::HelperHandle::process_peer_message`].

use crate::error::{Error, Result};
use skein_protocol::{ControlMessage, NodeId};
use tokio::sync::mpsc;

/// Send-only capability to reach cluster peers.
///
/// Implementations must not block: a send either enqueues the message for
/// delivery or fails fast with a transport error (peer unknown, channel
/// down). Delivery ordering per peer must match send order.
pub trait PeerTransport: Send + Sync {
    fn send(&self, peer: &NodeId, message: ControlMessage) -> Result<()>;
}

/// In-process transport delivering messages into a channel.
///
/// Used for wiring the helper to a session layer living in the same process,
/// and by the test harness to observe outbound traffic.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<(NodeId, ControlMessage)>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(NodeId, ControlMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PeerTransport for ChannelTransport {
    fn send(&self, peer: &NodeId, message: ControlMessage) -> Result<()> {
        self.tx
            .send((peer.clone(), message))
            .map_err(|_| Error::Transport("transport channel closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_protocol::{RequestHeader, StopVersion};

    #[test]
    fn test_channel_transport_delivers_in_order() {
        let (transport, mut rx) = ChannelTransport::new();
        let peer = "node-2".to_string();

        for id in 0..3u64 {
            transport
                .send(
                    &peer,
                    ControlMessage::StopRequest {
                        header: RequestHeader::new(id, "node-1".to_string()),
                        version: StopVersion::V1,
                        deadline_ms: 0,
                    },
                )
                .unwrap();
        }

        for expected in 0..3u64 {
            let (to, message) = rx.try_recv().unwrap();
            assert_eq!(to, peer);
            assert_eq!(message.request_id(), expected);
        }
    }

    #[test]
    fn test_send_after_receiver_drop_fails() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        let err = transport
            .send(
                &"node-2".to_string(),
                ControlMessage::StopRequest {
                    header: RequestHeader::new(1, "node-1".to_string()),
                    version: StopVersion::V1,
                    deadline_ms: 0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
