//! # Relay Tracker
//!
//! In-flight relay tracking with timeout-based failure detection, built as
//! a handle + actor pair: [`RelayTracker`] is the cheap-to-clone public
//! handle, the private actor owns the pending-entry table and every timer,
//! and processes commands sequentially. Registration, clearing, and timer
//! expiry are the only three ways the table changes, and all three flow
//! through the same command queue, so a timeout can never race a
//! concurrent clear or registration for the same key.
//!
//! ## Keying
//!
//! Entries are keyed by [`RelayKey`], the `(from, to)` pair of the signal
//! being relayed. The pair is deliberately not per-signal unique: at most
//! one entry exists per pair, and a new registration supersedes (cancels
//! and replaces) any pending one.
//!
//! ## Timer discipline
//!
//! Each entry arms exactly one timer task. Every registration carries a
//! fresh generation number and the expiry message echoes it back; an
//! expiry whose generation does not match the live entry is stale (the
//! entry was superseded or cleared and re-created) and is ignored. A timer
//! for a cleared entry finds no entry at all. Either way, a
//! fired-but-obsolete timer is a guaranteed no-op.
//!
//! The entry table is capacity-bounded; when full, the least recently
//! registered entry is evicted and its timer aborted.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::messages::RelaySignal;
use crate::peer::{PeerDirectory, PeerId};
use crate::relay::{send_relay_failure, PathFinder, RelayConfig, REASON_TIMEOUT};

/// Structural key for an in-flight relay: origin and final destination.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RelayKey {
    pub from: PeerId,
    pub to: PeerId,
}

/// Tracked state for a relay this node forwarded.
struct PendingRelay {
    signal: RelaySignal,
    previous_hop: PeerId,
    registered_at: Instant,
    generation: u64,
    timer: JoinHandle<()>,
}

enum TrackerCommand {
    Register {
        key: RelayKey,
        signal: RelaySignal,
        previous_hop: PeerId,
    },
    Clear {
        key: RelayKey,
    },
    /// Sent by a timer task when its entry's timeout elapses.
    Expired {
        key: RelayKey,
        generation: u64,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the relay tracker actor. Cheap to clone.
#[derive(Clone)]
pub struct RelayTracker {
    cmd_tx: mpsc::Sender<TrackerCommand>,
}

impl RelayTracker {
    /// Spawn the tracker actor.
    pub(crate) fn spawn(
        local_id: PeerId,
        peers: PeerDirectory,
        path_finder: PathFinder,
        config: &RelayConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let capacity = NonZeroUsize::new(config.max_pending_relays.max(1))
            .expect("capacity must be non-zero");
        let actor = TrackerActor {
            entries: LruCache::new(capacity),
            next_generation: 0,
            local_id,
            peers,
            path_finder,
            relay_timeout: config.relay_timeout,
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Track a forwarded relay. Supersedes any pending entry for the same
    /// key: the old timer is cancelled before the new one is armed.
    pub async fn register(&self, key: RelayKey, signal: RelaySignal, previous_hop: PeerId) {
        let _ = self
            .cmd_tx
            .send(TrackerCommand::Register {
                key,
                signal,
                previous_hop,
            })
            .await;
    }

    /// Cancel tracking for a key. Idempotent: clearing an absent key does
    /// nothing.
    pub async fn clear(&self, key: RelayKey) {
        let _ = self.cmd_tx.send(TrackerCommand::Clear { key }).await;
    }

    /// Number of currently tracked in-flight relays.
    pub async fn pending_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TrackerCommand::PendingCount { reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Tear down the actor: every outstanding timer is cancelled and all
    /// tracked state dropped. Returns once teardown has completed.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TrackerCommand::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

struct TrackerActor {
    entries: LruCache<RelayKey, PendingRelay>,
    next_generation: u64,
    local_id: PeerId,
    peers: PeerDirectory,
    path_finder: PathFinder,
    relay_timeout: Duration,
    cmd_tx: mpsc::Sender<TrackerCommand>,
}

impl TrackerActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<TrackerCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                TrackerCommand::Register {
                    key,
                    signal,
                    previous_hop,
                } => self.register(key, signal, previous_hop),
                TrackerCommand::Clear { key } => self.clear(&key),
                TrackerCommand::Expired { key, generation } => {
                    self.expired(key, generation).await;
                }
                TrackerCommand::PendingCount { reply } => {
                    let _ = reply.send(self.entries.len());
                }
                TrackerCommand::Shutdown { reply } => {
                    self.teardown();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("relay tracker shut down");
    }

    fn register(&mut self, key: RelayKey, signal: RelaySignal, previous_hop: PeerId) {
        if let Some(old) = self.entries.pop(&key) {
            old.timer.abort();
            trace!(from = %key.from, to = %key.to, "superseding pending relay");
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let timer = tokio::spawn({
            let cmd_tx = self.cmd_tx.clone();
            let key = key.clone();
            let timeout = self.relay_timeout;
            async move {
                tokio::time::sleep(timeout).await;
                let _ = cmd_tx
                    .send(TrackerCommand::Expired { key, generation })
                    .await;
            }
        });

        let entry = PendingRelay {
            signal,
            previous_hop,
            registered_at: Instant::now(),
            generation,
            timer,
        };
        if let Some((evicted_key, evicted)) = self.entries.push(key, entry) {
            // table full: the least recently registered relay loses its slot
            evicted.timer.abort();
            warn!(
                from = %evicted_key.from,
                to = %evicted_key.to,
                "pending relay table full, evicting oldest entry"
            );
        }
    }

    fn clear(&mut self, key: &RelayKey) {
        if let Some(entry) = self.entries.pop(key) {
            entry.timer.abort();
            debug!(
                from = %key.from,
                to = %key.to,
                pending_ms = entry.registered_at.elapsed().as_millis() as u64,
                "cleared pending relay"
            );
        }
    }

    async fn expired(&mut self, key: RelayKey, generation: u64) {
        let live = matches!(
            self.entries.peek(&key),
            Some(entry) if entry.generation == generation
        );
        if !live {
            trace!(from = %key.from, to = %key.to, "stale relay timer, ignoring");
            return;
        }
        let Some(entry) = self.entries.pop(&key) else {
            return;
        };

        warn!(
            from = %key.from,
            to = %key.to,
            timeout_ms = self.relay_timeout.as_millis() as u64,
            "relay timed out"
        );

        send_relay_failure(
            &self.peers,
            &self.local_id,
            &entry.previous_hop,
            &entry.signal.from,
            &entry.signal.to,
            REASON_TIMEOUT,
        )
        .await;

        self.path_finder
            .reroute(&entry.signal, &entry.previous_hop, &entry.signal.relay_path)
            .await;
    }

    fn teardown(&mut self) {
        let mut cancelled = 0usize;
        while let Some((_, entry)) = self.entries.pop_lru() {
            entry.timer.abort();
            cancelled += 1;
        }
        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding relay timers");
        }
    }
}
