//! Typed outbound events.
//!
//! Everything the dispatch core surfaces to the surrounding application and
//! protocol layers travels as one [`MeshEvent`] over a single mpsc channel.
//! Emission never blocks the dispatch path: a full channel drops the event
//! with a warning rather than stalling message handling.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::peer::PeerId;

/// Body of a generic application message: either raw text that failed to
/// parse, or a structured payload that is not protocol-internal.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageBody {
    Text(String),
    Structured(Value),
}

/// Outcome surfaced by the dispatch core.
#[derive(Clone, Debug, PartialEq)]
pub enum MeshEvent {
    /// Generic application message (unstructured text or a structured
    /// payload with no protocol-internal meaning).
    Message { from: PeerId, body: MessageBody },
    /// An application signal delivered to this node, directly, via relay,
    /// or unpacked from a batch. `from` is the originating peer, not the
    /// transport-level sender.
    Signal { from: PeerId, signal: Value },
    /// Gossip traffic for the gossip protocol collaborator. `ack`
    /// distinguishes `gossip_ack` from `gossip`.
    Gossip {
        from: PeerId,
        ack: bool,
        payload: Value,
    },
    /// Internal Kademlia RPC, routed to the DHT collaborator only.
    KademliaRpc { from: PeerId, payload: Value },
    /// A peer refused our connection attempt and suggested alternatives.
    ConnectionRejected {
        rejected_by: PeerId,
        reason: String,
        alternative_peers: Vec<PeerId>,
    },
    /// Raw reconnection data from a peer.
    ReconnectionData {
        from: PeerId,
        reason: String,
        peers: Vec<PeerId>,
    },
    /// We are being evicted by a peer; alternatives to reconnect through.
    PeerEvicted {
        reason: String,
        alternative_peers: Vec<PeerId>,
    },
}

/// Sending half of the event channel. Cheap to clone.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<MeshEvent>,
}

impl EventSink {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<MeshEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event receiver dropped");
            }
        }
    }
}
