//! # Meshwire - Mesh Message Dispatch and Relay Routing
//!
//! Meshwire is the message-dispatch and relay-routing layer of a
//! peer-to-peer mesh overlay. Every byte received from a directly-connected
//! peer passes through the [`Dispatcher`], which classifies it as
//! internal-protocol traffic, application traffic, or a multi-hop relay to
//! forward toward a peer the local node cannot reach directly.
//!
//! The relay subsystem is the core: loop-safe multi-hop forwarding with a
//! bounded path, timeout-based failure detection of in-flight relays, and
//! best-effort alternative-path retry when a direct relay target is
//! unreachable. Forwarding is greedy and local; there is no global topology
//! view and no delivery guarantee beyond bounded retry.
//!
//! ## Quick Start
//!
//! ```ignore
//! // The transport layer owns the peer directory and inserts a PeerLink
//! // handle per connected peer.
//! let peers = PeerDirectory::new();
//!
//! let (dispatcher, mut events) =
//!     Dispatcher::spawn("my-peer-id".into(), peers.clone(), RelayConfig::default());
//!
//! // Feed every inbound payload through the dispatcher.
//! dispatcher.handle_peer_data(&bytes, &sender_id).await;
//!
//! // Consume typed events on the other side.
//! while let Some(event) = events.recv().await {
//!     match event {
//!         MeshEvent::Signal { from, signal } => { /* ... */ }
//!         _ => {}
//!     }
//! }
//!
//! // Cancel all relay timers before tearing the node down.
//! dispatcher.shutdown().await;
//! ```
//!
//! ## Architecture
//!
//! The relay tracker uses the actor pattern: a cheap-to-clone handle sends
//! commands to a private actor that owns the pending-relay table and every
//! timer, so timeout expiry is serialized against registration and clearing
//! for the same key.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `dispatcher` | Decode-once boundary routing each payload to one handler |
//! | `relay` | Relay forwarding decisions and alternative-path retry |
//! | `tracker` | In-flight relay tracking with per-entry timeouts |
//! | `messages` | Tagged wire message types |
//! | `events` | Typed events surfaced to the application |
//! | `peer` | Peer identifiers, peer handles, injected peer-manager state |

mod dispatcher;
mod events;
mod messages;
mod peer;
mod relay;
mod tracker;

pub use dispatcher::{Dispatcher, SignalingOptimizer, DEFAULT_EVENT_CAPACITY};
pub use events::{MeshEvent, MessageBody};
pub use messages::{Envelope, RelaySignal, MAX_INBOUND_BYTES};
pub use peer::{ConnectionRegistry, PeerDirectory, PeerId, PeerLink};
pub use relay::{
    FirstEligible, RelayConfig, RouteSelector, DEFAULT_MAX_PENDING_RELAYS,
    DEFAULT_MAX_RELAY_PATH_LENGTH, DEFAULT_RELAY_TIMEOUT, REASON_LOOP_DETECTED,
    REASON_NOT_CONNECTED, REASON_PATH_TOO_LONG, REASON_TIMEOUT,
};
pub use tracker::{RelayKey, RelayTracker};
