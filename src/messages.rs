//! # Wire Protocol Messages
//!
//! Every payload exchanged with a directly-connected peer is a JSON object
//! carrying a `"type"` tag. This module models the protocol as the tagged
//! [`Envelope`] enum, decoded exactly once at the dispatcher boundary;
//! handlers downstream match on variants instead of re-checking field
//! presence.
//!
//! ## Message Types
//!
//! | `type` tag | Variant | Consumer |
//! |------------|---------|----------|
//! | `connection_rejected` | [`Envelope::ConnectionRejected`] | rejection handler |
//! | `optimized_relay_signal` | [`Envelope::OptimizedRelaySignal`] | signaling optimizer |
//! | `optimized_relay_confirmation` | [`Envelope::OptimizedRelayConfirmation`] | consumed |
//! | `batched_signals` | [`Envelope::BatchedSignals`] | unpacked into signal events |
//! | `relay_signal` | [`Envelope::RelaySignal`] | relay router |
//! | `relay_ack` | [`Envelope::RelayAck`] | latency accounting, tracker clear |
//! | `relay_failure` | [`Envelope::RelayFailure`] | diagnostic only |
//! | `reconnection_data` | [`Envelope::ReconnectionData`] | reconnection handler |
//! | `gossip` / `gossip_ack` | [`Envelope::Gossip`] / [`Envelope::GossipAck`] | gossip collaborator |
//! | `kademlia_rpc` | [`Envelope::KademliaRpc`] | DHT collaborator only |
//! | `kademlia_rpc_response` | [`Envelope::KademliaRpcResponse`] | generic message event |
//!
//! Payloads that are not JSON at all, carry no tag, or carry an unknown tag
//! are not errors: they surface as the generic application message event.
//!
//! ## Field Conventions
//!
//! Wire fields are camelCase (`relayPath`, `originalTimestamp`). Identifier
//! and payload fields decode to defaults when absent; validity rules (a
//! relay signal needs non-empty `to`/`from` and a non-null `signal`) are
//! enforced by the router, not the decoder. Timestamps are epoch
//! milliseconds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::peer::PeerId;

/// Maximum accepted inbound payload size. Oversized payloads are dropped
/// before parsing to bound allocation from any single peer.
pub const MAX_INBOUND_BYTES: usize = 256 * 1024;

/// A multi-hop signal being routed toward `to`.
///
/// `signal` is opaque application payload, passed through unmodified.
/// `timestamp` is the origin's send time and is preserved across every hop
/// so latency is measured end to end, never per hop. `relay_path` holds the
/// ids of peers already traversed, empty at the origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySignal {
    #[serde(default)]
    pub to: PeerId,
    #[serde(default)]
    pub from: PeerId,
    #[serde(default)]
    pub signal: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relay_path: Vec<PeerId>,
}

/// A decoded wire message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "connection_rejected", rename_all = "camelCase")]
    ConnectionRejected {
        #[serde(default)]
        from: PeerId,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        alternative_peers: Vec<PeerId>,
    },
    /// Opaque to this layer; handed to the signaling optimizer.
    #[serde(rename = "optimized_relay_signal")]
    OptimizedRelaySignal {
        #[serde(flatten)]
        body: Value,
    },
    /// Internal to the signaling optimizer; consumed without action here.
    #[serde(rename = "optimized_relay_confirmation")]
    OptimizedRelayConfirmation {
        #[serde(flatten)]
        body: Value,
    },
    /// A batch of signals attributed to `from` regardless of which peer
    /// delivered the batch.
    #[serde(rename = "batched_signals")]
    BatchedSignals {
        #[serde(default)]
        from: PeerId,
        #[serde(default)]
        signals: Vec<Value>,
    },
    #[serde(rename = "relay_signal")]
    RelaySignal(RelaySignal),
    /// End-to-end delivery confirmation, sent one hop backward.
    #[serde(rename = "relay_ack", rename_all = "camelCase")]
    RelayAck {
        #[serde(default)]
        to: PeerId,
        #[serde(default)]
        from: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_timestamp: Option<u64>,
        #[serde(default)]
        received_timestamp: u64,
        #[serde(default)]
        relay_path: Vec<PeerId>,
    },
    /// Relay delivery failure, sent one hop backward and never relayed
    /// further.
    #[serde(rename = "relay_failure", rename_all = "camelCase")]
    RelayFailure {
        #[serde(default)]
        to: PeerId,
        #[serde(default)]
        from: PeerId,
        #[serde(default)]
        target_peer: PeerId,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        timestamp: u64,
    },
    #[serde(rename = "reconnection_data")]
    ReconnectionData {
        #[serde(default)]
        reason: String,
        #[serde(default)]
        peers: Vec<PeerId>,
    },
    #[serde(rename = "gossip")]
    Gossip {
        #[serde(flatten)]
        body: Value,
    },
    #[serde(rename = "gossip_ack")]
    GossipAck {
        #[serde(flatten)]
        body: Value,
    },
    /// Internal DHT traffic, never surfaced as a generic message.
    #[serde(rename = "kademlia_rpc")]
    KademliaRpc {
        #[serde(flatten)]
        body: Value,
    },
    #[serde(rename = "kademlia_rpc_response")]
    KademliaRpcResponse {
        #[serde(flatten)]
        body: Value,
    },
}

impl Envelope {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Classification of an inbound payload.
#[derive(Clone, Debug)]
pub(crate) enum Inbound {
    /// A recognized protocol message.
    Envelope(Envelope),
    /// Valid JSON that is not a protocol message (no tag, unknown tag, or
    /// a non-object value).
    Structured(Value),
    /// Not JSON at all; the raw text, lossily decoded.
    Text(String),
}

/// Decode an inbound payload. Never fails: anything unparseable degrades to
/// [`Inbound::Text`], anything unrecognized to [`Inbound::Structured`].
pub(crate) fn decode_inbound(data: &[u8]) -> Inbound {
    let value: Value = match serde_json::from_slice(data) {
        Ok(value) => value,
        Err(_) => return Inbound::Text(String::from_utf8_lossy(data).into_owned()),
    };
    match Envelope::deserialize(&value) {
        Ok(envelope) => Inbound::Envelope(envelope),
        Err(_) => Inbound::Structured(value),
    }
}
