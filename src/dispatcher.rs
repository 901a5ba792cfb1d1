//! # Message Dispatcher
//!
//! The single entry point for every byte received from a directly-connected
//! peer. Payloads are decoded once, classified by their `"type"` tag, and
//! routed to exactly one handler or event:
//!
//! | payload | destination |
//! |---------|-------------|
//! | not JSON | generic message event (raw text) |
//! | `connection_rejected` | rejection handler |
//! | `optimized_relay_signal` | signaling optimizer collaborator |
//! | `optimized_relay_confirmation` | consumed |
//! | `batched_signals` | one signal event per contained signal |
//! | `relay_signal` | relay router |
//! | `relay_ack` | latency accounting + pending-entry clear, consumed |
//! | `relay_failure` | diagnostic, consumed |
//! | `reconnection_data` | reconnection handler |
//! | `gossip` / `gossip_ack` | gossip event |
//! | `kademlia_rpc` | kademlia event only, filtered from the application |
//! | anything else | generic message event (structured) |
//!
//! `handle_peer_data` takes `&self` and is safe to call concurrently from
//! any number of peer connections; shared relay state lives behind the
//! tracker actor.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::events::{EventSink, MeshEvent, MessageBody};
use crate::messages::{decode_inbound, Envelope, Inbound, MAX_INBOUND_BYTES};
use crate::peer::{ConnectionRegistry, PeerDirectory, PeerId};
use crate::relay::{FirstEligible, PathFinder, RelayConfig, RelayRouter, RouteSelector};
use crate::tracker::{RelayKey, RelayTracker};

/// Default capacity of the outbound event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// External collaborator consuming `optimized_relay_signal` messages.
#[async_trait]
pub trait SignalingOptimizer: Send + Sync {
    /// Handle an optimized relay signal. `payload` is the message body
    /// without the type tag; `from` is the delivering peer.
    async fn handle_optimized_signal(&self, payload: Value, from: &PeerId);
}

/// The message-dispatch and relay-routing core. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    local_id: PeerId,
    events: EventSink,
    router: RelayRouter,
    tracker: RelayTracker,
    connections: ConnectionRegistry,
    optimizer: Option<Arc<dyn SignalingOptimizer>>,
}

impl Dispatcher {
    /// Spawn a dispatcher with default collaborators: first-eligible route
    /// selection, no signaling optimizer, fresh connection bookkeeping.
    ///
    /// Returns the dispatcher and the receiving half of the event channel.
    pub fn spawn(
        local_id: PeerId,
        peers: PeerDirectory,
        config: RelayConfig,
    ) -> (Self, mpsc::Receiver<MeshEvent>) {
        Self::spawn_with(
            local_id,
            peers,
            config,
            Arc::new(FirstEligible),
            None,
            ConnectionRegistry::new(),
        )
    }

    /// Spawn a dispatcher with explicit collaborators.
    pub fn spawn_with(
        local_id: PeerId,
        peers: PeerDirectory,
        config: RelayConfig,
        selector: Arc<dyn RouteSelector>,
        optimizer: Option<Arc<dyn SignalingOptimizer>>,
        connections: ConnectionRegistry,
    ) -> (Self, mpsc::Receiver<MeshEvent>) {
        let (events, event_rx) = EventSink::channel(DEFAULT_EVENT_CAPACITY);
        let path_finder = PathFinder::new(local_id.clone(), peers.clone(), selector);
        let tracker = RelayTracker::spawn(
            local_id.clone(),
            peers.clone(),
            path_finder.clone(),
            &config,
        );
        let router = RelayRouter::new(
            local_id.clone(),
            peers,
            events.clone(),
            tracker.clone(),
            path_finder,
            &config,
        );
        (
            Self {
                local_id,
                events,
                router,
                tracker,
                connections,
                optimizer,
            },
            event_rx,
        )
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Number of relays currently tracked as in flight.
    pub async fn pending_relays(&self) -> usize {
        self.tracker.pending_count().await
    }

    /// Tear down relay tracking: cancels every outstanding timer and clears
    /// all tracked state. Call before dropping the surrounding node.
    pub async fn shutdown(&self) {
        self.tracker.shutdown().await;
    }

    /// Handle raw data received from `from`.
    pub async fn handle_peer_data(&self, data: &[u8], from: &PeerId) {
        if data.len() > MAX_INBOUND_BYTES {
            warn!(from = %from, len = data.len(), "dropping oversized payload");
            return;
        }

        match decode_inbound(data) {
            Inbound::Text(text) => {
                warn!(
                    from = %from,
                    preview = %text.chars().take(100).collect::<String>(),
                    "received non-JSON data"
                );
                self.events.emit(MeshEvent::Message {
                    from: from.clone(),
                    body: MessageBody::Text(text),
                });
            }
            Inbound::Structured(value) => {
                self.events.emit(MeshEvent::Message {
                    from: from.clone(),
                    body: MessageBody::Structured(value),
                });
            }
            Inbound::Envelope(envelope) => self.dispatch(envelope, from).await,
        }
    }

    async fn dispatch(&self, envelope: Envelope, from: &PeerId) {
        match envelope {
            Envelope::ConnectionRejected {
                from: rejected_by,
                reason,
                alternative_peers,
            } => self.handle_connection_rejection(rejected_by, reason, alternative_peers),

            Envelope::OptimizedRelaySignal { body } => match &self.optimizer {
                Some(optimizer) => optimizer.handle_optimized_signal(body, from).await,
                None => debug!(from = %from, "no signaling optimizer installed, dropping optimized relay signal"),
            },

            // internal to the optimizer pair; nothing to do here
            Envelope::OptimizedRelayConfirmation { .. } => {
                trace!(from = %from, "optimized relay confirmation consumed");
            }

            Envelope::BatchedSignals { from: origin, signals } => {
                debug!(from = %origin, count = signals.len(), "received signal batch");
                for signal in signals {
                    self.events.emit(MeshEvent::Signal {
                        from: origin.clone(),
                        signal,
                    });
                }
            }

            Envelope::RelaySignal(signal) => {
                self.router.handle_relay_signal(signal, from).await;
            }

            Envelope::RelayAck {
                to,
                from: acknowledged_by,
                original_timestamp,
                received_timestamp,
                ..
            } => {
                match original_timestamp {
                    Some(sent) => debug!(
                        peer = %acknowledged_by,
                        latency_ms = received_timestamp.saturating_sub(sent),
                        "relay acknowledged"
                    ),
                    None => debug!(peer = %acknowledged_by, "relay acknowledged (unknown latency)"),
                }
                // delivery confirmed: the entry armed when we forwarded
                // toward the acknowledging peer is done
                self.tracker
                    .clear(RelayKey {
                        from: to,
                        to: acknowledged_by,
                    })
                    .await;
            }

            Envelope::RelayFailure {
                target_peer,
                reason,
                ..
            } => {
                warn!(target = %target_peer, reason = %reason, "relay failed");
            }

            Envelope::ReconnectionData { reason, peers } => {
                self.handle_reconnection_data(from, reason, peers);
            }

            Envelope::Gossip { body } => self.events.emit(MeshEvent::Gossip {
                from: from.clone(),
                ack: false,
                payload: body,
            }),
            Envelope::GossipAck { body } => self.events.emit(MeshEvent::Gossip {
                from: from.clone(),
                ack: true,
                payload: body,
            }),

            Envelope::KademliaRpc { body } => {
                debug!(from = %from, "filtered internal kademlia rpc from application");
                self.events.emit(MeshEvent::KademliaRpc {
                    from: from.clone(),
                    payload: body,
                });
            }

            Envelope::KademliaRpcResponse { body } => {
                let mut value = body;
                if let Value::Object(map) = &mut value {
                    map.insert("type".to_string(), Value::String("kademlia_rpc_response".to_string()));
                }
                self.events.emit(MeshEvent::Message {
                    from: from.clone(),
                    body: MessageBody::Structured(value),
                });
            }
        }
    }

    fn handle_connection_rejection(
        &self,
        rejected_by: PeerId,
        reason: String,
        alternative_peers: Vec<PeerId>,
    ) {
        debug!(peer = %rejected_by, reason = %reason, "connection rejected");
        self.connections.discard(&rejected_by);

        if !alternative_peers.is_empty() {
            debug!(
                peer = %rejected_by,
                count = alternative_peers.len(),
                "rejection included alternative peers"
            );
            self.events.emit(MeshEvent::ConnectionRejected {
                rejected_by,
                reason,
                alternative_peers,
            });
        }
    }

    /// Two consumers see the same input: the raw reconnection data and the
    /// eviction notice derived from it.
    fn handle_reconnection_data(&self, from: &PeerId, reason: String, peers: Vec<PeerId>) {
        debug!(from = %from, count = peers.len(), "received reconnection data");
        self.events.emit(MeshEvent::ReconnectionData {
            from: from.clone(),
            reason: reason.clone(),
            peers: peers.clone(),
        });
        self.events.emit(MeshEvent::PeerEvicted {
            reason,
            alternative_peers: peers,
        });
    }
}
