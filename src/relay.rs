//! # Relay Router
//!
//! Multi-hop forwarding decisions for relay signals: loop and path-length
//! guards, direct delivery with acknowledgment when this node is the final
//! recipient, forwarding with in-flight tracking otherwise, and best-effort
//! alternative-path retry when the direct next hop is unreachable.
//!
//! ## Routing a signal
//!
//! For a signal `S` arriving from previous hop `P`:
//!
//! 1. Discard silently if `S` lacks `to`, `from`, or `signal`.
//! 2. Drop with a failure back to `P` if the local id is already on the
//!    path (loop) or the path has reached the length cap. Both checks run
//!    before any state is created, so a rejected signal never leaves
//!    tracking behind.
//! 3. If addressed to this node: clear any pending entry for the pair,
//!    surface the signal, acknowledge one hop backward.
//! 4. Otherwise: append the local id to the path, register the in-flight
//!    entry, and forward to the destination's direct link. Unreachable
//!    destination or failed send turns into a failure back to `P` plus a
//!    retry through the [`PathFinder`].
//!
//! Failure notifications travel exactly one hop backward; the original
//! sender only learns of failure through its own missing acknowledgment.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::events::{EventSink, MeshEvent};
use crate::messages::{Envelope, RelaySignal};
use crate::peer::{PeerDirectory, PeerId};
use crate::tracker::{RelayKey, RelayTracker};

/// Default time a forwarded relay may stay unconfirmed before it is
/// declared failed.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default cap on the number of hops already recorded in a relay path.
/// A signal arriving with a path at or beyond the cap is rejected.
pub const DEFAULT_MAX_RELAY_PATH_LENGTH: usize = 3;

/// Default bound on concurrently tracked in-flight relays.
/// Oldest entries are evicted when the table is full.
pub const DEFAULT_MAX_PENDING_RELAYS: usize = 1024;

/// Failure reason: the local id already appears in the relay path.
pub const REASON_LOOP_DETECTED: &str = "Relay loop detected";
/// Failure reason: the relay path reached the length cap.
pub const REASON_PATH_TOO_LONG: &str = "Relay path too long";
/// Failure reason: the destination has no connected direct link.
pub const REASON_NOT_CONNECTED: &str = "Peer not connected";
/// Failure reason: no confirmation arrived within the relay timeout.
pub const REASON_TIMEOUT: &str = "Relay timeout";

/// Tunables for relay routing and tracking.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub relay_timeout: Duration,
    pub max_relay_path_length: usize,
    pub max_pending_relays: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
            max_relay_path_length: DEFAULT_MAX_RELAY_PATH_LENGTH,
            max_pending_relays: DEFAULT_MAX_PENDING_RELAYS,
        }
    }
}

/// Wall-clock epoch milliseconds, the wire timestamp unit.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Send a `relay_failure` one hop backward to `relay_peer`. Best-effort:
/// a missing handle or failed send is logged, never propagated.
pub(crate) async fn send_relay_failure(
    peers: &PeerDirectory,
    local_id: &PeerId,
    relay_peer: &PeerId,
    original_sender: &PeerId,
    target_peer: &PeerId,
    reason: &str,
) {
    let Some(link) = peers.get(relay_peer).await else {
        debug!(peer = %relay_peer, "cannot notify relay failure: peer unknown");
        return;
    };
    let failure = Envelope::RelayFailure {
        to: original_sender.clone(),
        from: local_id.clone(),
        target_peer: target_peer.clone(),
        reason: reason.to_string(),
        timestamp: now_millis(),
    };
    match failure.to_bytes() {
        Ok(bytes) => {
            if let Err(error) = link.send(bytes).await {
                warn!(peer = %relay_peer, error = %error, "failed to send relay failure notification");
            } else {
                debug!(peer = %relay_peer, reason = %reason, "sent relay failure notification");
            }
        }
        Err(error) => warn!(error = %error, "failed to encode relay failure"),
    }
}

/// Next-hop selection strategy for alternative-path retries.
///
/// Candidates arrive already filtered for eligibility; the strategy only
/// chooses among them. The default takes the first candidate in directory
/// iteration order, which carries no ordering promise.
pub trait RouteSelector: Send + Sync {
    fn pick(&self, candidates: &[PeerId]) -> Option<PeerId>;
}

/// Picks the first eligible candidate.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstEligible;

impl RouteSelector for FirstEligible {
    fn pick(&self, candidates: &[PeerId]) -> Option<PeerId> {
        candidates.first().cloned()
    }
}

/// Best-effort alternative-path retry when a direct relay attempt fails.
///
/// Fire-and-forget: the retried forward is not tracked and a failed send is
/// only logged.
#[derive(Clone)]
pub(crate) struct PathFinder {
    local_id: PeerId,
    peers: PeerDirectory,
    selector: Arc<dyn RouteSelector>,
}

impl PathFinder {
    pub(crate) fn new(local_id: PeerId, peers: PeerDirectory, selector: Arc<dyn RouteSelector>) -> Self {
        Self {
            local_id,
            peers,
            selector,
        }
    }

    /// Try to forward `signal` through some peer other than the one that
    /// just failed. `traversed` is the path as received, without the local
    /// id; the forwarded copy carries it with the local id appended once.
    ///
    /// Excluded from candidacy: the local node, the final destination, the
    /// previous hop that triggered this retry, and every peer already on
    /// the path.
    pub(crate) async fn reroute(
        &self,
        signal: &RelaySignal,
        previous_hop: &PeerId,
        traversed: &[PeerId],
    ) {
        let mut candidates = Vec::new();
        for id in self.peers.peer_ids().await {
            if id == self.local_id
                || id == signal.to
                || id == *previous_hop
                || traversed.contains(&id)
            {
                continue;
            }
            if let Some(link) = self.peers.get(&id).await {
                if link.is_connected() {
                    candidates.push(id);
                }
            }
        }

        let Some(next_hop) = self.selector.pick(&candidates) else {
            warn!(
                from = %signal.from,
                to = %signal.to,
                "no alternative relay path available"
            );
            return;
        };

        let Some(link) = self.peers.get(&next_hop).await else {
            return;
        };

        let mut relay_path = traversed.to_vec();
        relay_path.push(self.local_id.clone());
        let forwarded = RelaySignal {
            relay_path,
            ..signal.clone()
        };

        debug!(
            via = %next_hop,
            from = %signal.from,
            to = %signal.to,
            "trying alternative relay path"
        );

        match Envelope::RelaySignal(forwarded).to_bytes() {
            Ok(bytes) => {
                if let Err(error) = link.send(bytes).await {
                    warn!(via = %next_hop, error = %error, "alternative relay send failed");
                }
            }
            Err(error) => warn!(error = %error, "failed to encode alternative relay signal"),
        }
    }
}

/// The forwarding decision for relay signals.
#[derive(Clone)]
pub(crate) struct RelayRouter {
    local_id: PeerId,
    peers: PeerDirectory,
    events: EventSink,
    tracker: RelayTracker,
    path_finder: PathFinder,
    max_relay_path_length: usize,
}

impl RelayRouter {
    pub(crate) fn new(
        local_id: PeerId,
        peers: PeerDirectory,
        events: EventSink,
        tracker: RelayTracker,
        path_finder: PathFinder,
        config: &RelayConfig,
    ) -> Self {
        Self {
            local_id,
            peers,
            events,
            tracker,
            path_finder,
            max_relay_path_length: config.max_relay_path_length,
        }
    }

    pub(crate) async fn handle_relay_signal(&self, signal: RelaySignal, previous_hop: &PeerId) {
        if signal.to.is_empty() || signal.from.is_empty() || signal.signal.is_null() {
            debug!(from = %previous_hop, "discarding malformed relay signal");
            return;
        }

        // Both guards run before any state is created and both are terminal.
        if signal.relay_path.contains(&self.local_id) {
            warn!(
                from = %signal.from,
                to = %signal.to,
                "relay loop detected, dropping signal"
            );
            send_relay_failure(
                &self.peers,
                &self.local_id,
                previous_hop,
                &signal.from,
                &signal.to,
                REASON_LOOP_DETECTED,
            )
            .await;
            return;
        }
        if signal.relay_path.len() >= self.max_relay_path_length {
            warn!(
                from = %signal.from,
                to = %signal.to,
                path_len = signal.relay_path.len(),
                "relay path too long, dropping signal"
            );
            send_relay_failure(
                &self.peers,
                &self.local_id,
                previous_hop,
                &signal.from,
                &signal.to,
                REASON_PATH_TOO_LONG,
            )
            .await;
            return;
        }

        if signal.to == self.local_id {
            self.deliver(signal, previous_hop).await;
        } else {
            self.forward(signal, previous_hop).await;
        }
    }

    /// This node is the final recipient: surface the signal and confirm one
    /// hop backward.
    async fn deliver(&self, signal: RelaySignal, previous_hop: &PeerId) {
        let received_timestamp = now_millis();
        match signal.timestamp {
            Some(sent) => debug!(
                from = %signal.from,
                via = %previous_hop,
                hops = signal.relay_path.len(),
                latency_ms = received_timestamp.saturating_sub(sent),
                "received relayed signal"
            ),
            None => debug!(
                from = %signal.from,
                via = %previous_hop,
                hops = signal.relay_path.len(),
                "received relayed signal (unknown latency)"
            ),
        }

        self.tracker
            .clear(RelayKey {
                from: signal.from.clone(),
                to: signal.to.clone(),
            })
            .await;

        self.events.emit(MeshEvent::Signal {
            from: signal.from.clone(),
            signal: signal.signal.clone(),
        });

        let ack = Envelope::RelayAck {
            to: signal.from.clone(),
            from: self.local_id.clone(),
            original_timestamp: signal.timestamp,
            received_timestamp,
            relay_path: signal.relay_path.clone(),
        };
        let Some(link) = self.peers.get(previous_hop).await else {
            debug!(peer = %previous_hop, "cannot acknowledge relay: peer unknown");
            return;
        };
        match ack.to_bytes() {
            Ok(bytes) => {
                if let Err(error) = link.send(bytes).await {
                    warn!(peer = %previous_hop, error = %error, "failed to send relay acknowledgment");
                }
            }
            Err(error) => warn!(error = %error, "failed to encode relay acknowledgment"),
        }
    }

    /// Forward toward the destination's direct link, tracking the attempt.
    async fn forward(&self, signal: RelaySignal, previous_hop: &PeerId) {
        let mut new_path = signal.relay_path.clone();
        new_path.push(self.local_id.clone());

        let target = self.peers.get(&signal.to).await;
        let link = match target {
            Some(link) if link.is_connected() => link,
            _ => {
                warn!(to = %signal.to, "cannot relay signal: peer not connected");
                send_relay_failure(
                    &self.peers,
                    &self.local_id,
                    previous_hop,
                    &signal.from,
                    &signal.to,
                    REASON_NOT_CONNECTED,
                )
                .await;
                self.path_finder
                    .reroute(&signal, previous_hop, &signal.relay_path)
                    .await;
                return;
            }
        };

        let key = RelayKey {
            from: signal.from.clone(),
            to: signal.to.clone(),
        };
        self.tracker
            .register(key.clone(), signal.clone(), previous_hop.clone())
            .await;

        let forwarded = RelaySignal {
            relay_path: new_path,
            ..signal.clone()
        };
        let result = match Envelope::RelaySignal(forwarded).to_bytes() {
            Ok(bytes) => link.send(bytes).await,
            Err(error) => Err(error.into()),
        };

        match result {
            Ok(()) => debug!(
                from = %signal.from,
                to = %signal.to,
                "relayed signal to destination"
            ),
            Err(error) => {
                warn!(to = %signal.to, error = %error, "relay send failed");
                // The failed attempt is reported and retried right here;
                // the tracked entry would otherwise fire a second time.
                self.tracker.clear(key).await;
                send_relay_failure(
                    &self.peers,
                    &self.local_id,
                    previous_hop,
                    &signal.from,
                    &signal.to,
                    &error.to_string(),
                )
                .await;
                self.path_finder
                    .reroute(&signal, previous_hop, &signal.relay_path)
                    .await;
            }
        }
    }
}
