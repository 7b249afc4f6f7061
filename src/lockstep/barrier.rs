//! Barrier Synchronizer
//!
//! No peer may apply a batch before every connected peer holds it. The
//! barrier tracks acknowledgements for the one outstanding batch and decides
//! when peers may be released.
//!
//! ```text
//! Idle ──submit_batch──► AwaitingAcks ──all acked──► AllAcked
//!                             │                         ▲
//!                       ack timeout                     │
//!                             ▼                         │
//!                   WaitingForStragglers ───all acked───┘
//! ```
//!
//! A straggler wait never gives up on its own. Eviction is an explicit
//! decision of the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::hash::{short_hex, BatchDigest};
use super::command::{CommandBatch, PeerId, TurnNumber};

/// Barrier progress for the outstanding batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierState {
    /// No batch outstanding
    Idle,
    /// Batch broadcast, acks arriving within the timeout
    AwaitingAcks,
    /// Ack timeout passed; session paused until the rest arrive
    WaitingForStragglers,
    /// Last batch fully acknowledged and released
    AllAcked,
}

/// Errors from barrier misuse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BarrierError {
    /// Only one batch may be unacknowledged at a time
    #[error("batch for turn {0} is still awaiting acknowledgements")]
    BatchOutstanding(TurnNumber),

    /// Batches must be submitted in turn order
    #[error("batch for turn {received} submitted after turn {last_released}")]
    OutOfOrder {
        /// Last released turn
        last_released: TurnNumber,
        /// Turn submitted
        received: TurnNumber,
    },
}

/// Result of recording an acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// Counted; still waiting on `remaining` peers
    Recorded {
        /// Peers yet to acknowledge
        remaining: usize,
    },
    /// That was the last ack; peers may apply
    Released(BarrierRelease),
    /// Peer already acknowledged this batch
    Duplicate,
    /// Ack for a batch that is not outstanding
    Stale,
    /// Peer is not expected to acknowledge
    UnknownPeer,
    /// Peer holds a different batch; it must be sent again
    DigestMismatch,
}

/// Emitted once when the ack timeout passes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarrierTimeout {
    /// Outstanding turn
    pub turn_number: TurnNumber,
    /// Peers that have not acknowledged
    pub missing: Vec<PeerId>,
}

/// A fully acknowledged batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarrierRelease {
    /// Turn peers may now apply
    pub turn_number: TurnNumber,
    /// Broadcast-to-ack time per peer
    pub round_trips: BTreeMap<PeerId, Duration>,
    /// Slowest acknowledgement
    pub slowest_round_trip: Duration,
    /// Whether the barrier had to wait for stragglers
    pub stalled: bool,
    /// Peers dropped to complete the barrier
    pub evicted: Vec<PeerId>,
}

/// Acknowledgement barrier for one batch at a time.
#[derive(Clone, Debug)]
pub struct BarrierSynchronizer {
    state: BarrierState,
    batch: Option<Arc<CommandBatch>>,
    digest: BatchDigest,
    expected: BTreeSet<PeerId>,
    acked: BTreeMap<PeerId, Duration>,
    elapsed: Duration,
    stalled_at: Option<Duration>,
    last_released: TurnNumber,
}

impl Default for BarrierSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BarrierSynchronizer {
    /// Create an idle barrier.
    pub fn new() -> Self {
        Self {
            state: BarrierState::Idle,
            batch: None,
            digest: [0u8; 32],
            expected: BTreeSet::new(),
            acked: BTreeMap::new(),
            elapsed: Duration::ZERO,
            stalled_at: None,
            last_released: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> BarrierState {
        self.state
    }

    /// Batch awaiting acknowledgements.
    pub fn outstanding(&self) -> Option<&Arc<CommandBatch>> {
        self.batch.as_ref()
    }

    /// Digest of the outstanding batch.
    pub fn outstanding_digest(&self) -> Option<BatchDigest> {
        self.batch.as_ref().map(|_| self.digest)
    }

    /// Last turn released to peers.
    pub fn last_released(&self) -> TurnNumber {
        self.last_released
    }

    /// Whether the session is paused on this barrier.
    pub fn is_waiting_for_stragglers(&self) -> bool {
        self.state == BarrierState::WaitingForStragglers
    }

    /// How long the barrier has been past its timeout.
    pub fn stalled_for(&self) -> Option<Duration> {
        self.stalled_at.map(|at| self.elapsed.saturating_sub(at))
    }

    /// Peers that have not acknowledged the outstanding batch.
    pub fn missing(&self) -> Vec<PeerId> {
        self.expected
            .iter()
            .filter(|peer| !self.acked.contains_key(peer))
            .copied()
            .collect()
    }

    /// Start collecting acknowledgements for `batch` from `peers`.
    ///
    /// Returns a release immediately when there is nobody to wait for.
    pub fn submit_batch(
        &mut self,
        batch: Arc<CommandBatch>,
        peers: impl IntoIterator<Item = PeerId>,
    ) -> Result<Option<BarrierRelease>, BarrierError> {
        if let Some(outstanding) = &self.batch {
            return Err(BarrierError::BatchOutstanding(outstanding.turn_number));
        }
        if batch.turn_number <= self.last_released {
            return Err(BarrierError::OutOfOrder {
                last_released: self.last_released,
                received: batch.turn_number,
            });
        }

        self.digest = batch.digest();
        self.expected = peers.into_iter().collect();
        self.acked.clear();
        self.elapsed = Duration::ZERO;
        self.stalled_at = None;
        self.state = BarrierState::AwaitingAcks;
        debug!(
            turn = batch.turn_number,
            digest = %short_hex(&self.digest),
            peers = self.expected.len(),
            "Batch awaiting acknowledgements"
        );
        self.batch = Some(batch);

        Ok(self.release_if_complete(Vec::new()))
    }

    /// Record one peer's acknowledgement.
    pub fn acknowledge(
        &mut self,
        peer_id: PeerId,
        turn_number: TurnNumber,
        digest: &BatchDigest,
    ) -> AckOutcome {
        let Some(batch) = &self.batch else {
            return AckOutcome::Stale;
        };
        if batch.turn_number != turn_number {
            return AckOutcome::Stale;
        }
        if !self.expected.contains(&peer_id) {
            return AckOutcome::UnknownPeer;
        }
        if self.acked.contains_key(&peer_id) {
            return AckOutcome::Duplicate;
        }
        if *digest != self.digest {
            warn!(
                peer = %peer_id,
                turn = turn_number,
                expected = %short_hex(&self.digest),
                received = %short_hex(digest),
                "Acknowledged batch digest mismatch"
            );
            return AckOutcome::DigestMismatch;
        }

        self.acked.insert(peer_id, self.elapsed);
        match self.release_if_complete(Vec::new()) {
            Some(release) => AckOutcome::Released(release),
            None => AckOutcome::Recorded {
                remaining: self.expected.len() - self.acked.len(),
            },
        }
    }

    /// Advance the ack timer. Returns a timeout the first time it passes.
    pub fn advance(&mut self, delta: Duration, ack_timeout: Duration) -> Option<BarrierTimeout> {
        match self.state {
            BarrierState::AwaitingAcks => {
                self.elapsed += delta;
                if self.elapsed <= ack_timeout {
                    return None;
                }
                self.state = BarrierState::WaitingForStragglers;
                self.stalled_at = Some(self.elapsed);
                let timeout = BarrierTimeout {
                    turn_number: self.batch.as_ref().map_or(0, |b| b.turn_number),
                    missing: self.missing(),
                };
                warn!(
                    turn = timeout.turn_number,
                    missing = ?timeout.missing,
                    "Acknowledgements overdue, waiting for stragglers"
                );
                Some(timeout)
            }
            BarrierState::WaitingForStragglers => {
                self.elapsed += delta;
                None
            }
            BarrierState::Idle | BarrierState::AllAcked => None,
        }
    }

    /// Stop expecting a peer (disconnect). May complete the barrier.
    pub fn remove_peer(&mut self, peer_id: PeerId) -> Option<BarrierRelease> {
        self.expected.remove(&peer_id);
        self.acked.remove(&peer_id);
        if self.batch.is_none() {
            return None;
        }
        self.release_if_complete(Vec::new())
    }

    /// Give up on every peer that has not acknowledged and release.
    pub fn evict_stragglers(&mut self) -> Option<BarrierRelease> {
        self.batch.as_ref()?;
        let evicted = self.missing();
        for peer in &evicted {
            self.expected.remove(peer);
        }
        warn!(?evicted, "Evicting stragglers");
        self.release_if_complete(evicted)
    }

    fn release_if_complete(&mut self, evicted: Vec<PeerId>) -> Option<BarrierRelease> {
        if self.acked.len() < self.expected.len() {
            return None;
        }
        let batch = self.batch.take()?;

        let stalled = self.state == BarrierState::WaitingForStragglers;
        let round_trips = std::mem::take(&mut self.acked);
        let slowest_round_trip = round_trips.values().copied().max().unwrap_or(Duration::ZERO);

        self.state = BarrierState::AllAcked;
        self.stalled_at = None;
        self.last_released = batch.turn_number;

        debug!(
            turn = batch.turn_number,
            slowest_ms = slowest_round_trip.as_millis() as u64,
            stalled,
            "Barrier released"
        );

        Some(BarrierRelease {
            turn_number: batch.turn_number,
            round_trips,
            slowest_round_trip,
            stalled,
            evicted,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn batch(turn: TurnNumber) -> Arc<CommandBatch> {
        Arc::new(CommandBatch::empty(turn, 3))
    }

    fn peers() -> Vec<PeerId> {
        vec![PeerId(1), PeerId(2), PeerId(3)]
    }

    #[test]
    fn test_release_only_after_all_acks() {
        let mut barrier = BarrierSynchronizer::new();
        let b = batch(1);
        let digest = b.digest();
        assert!(barrier.submit_batch(b, peers()).unwrap().is_none());

        barrier.advance(ms(10), ms(400));
        assert_eq!(
            barrier.acknowledge(PeerId(1), 1, &digest),
            AckOutcome::Recorded { remaining: 2 }
        );
        barrier.advance(ms(20), ms(400));
        assert_eq!(
            barrier.acknowledge(PeerId(3), 1, &digest),
            AckOutcome::Recorded { remaining: 1 }
        );
        barrier.advance(ms(30), ms(400));

        match barrier.acknowledge(PeerId(2), 1, &digest) {
            AckOutcome::Released(release) => {
                assert_eq!(release.turn_number, 1);
                assert_eq!(release.round_trips[&PeerId(1)], ms(10));
                assert_eq!(release.round_trips[&PeerId(2)], ms(60));
                assert_eq!(release.slowest_round_trip, ms(60));
                assert!(!release.stalled);
            }
            other => panic!("expected release, got {:?}", other),
        }
        assert_eq!(barrier.state(), BarrierState::AllAcked);
        assert!(barrier.outstanding().is_none());
    }

    #[test]
    fn test_one_outstanding_batch() {
        let mut barrier = BarrierSynchronizer::new();
        barrier.submit_batch(batch(1), peers()).unwrap();
        assert_eq!(
            barrier.submit_batch(batch(2), peers()),
            Err(BarrierError::BatchOutstanding(1))
        );
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut barrier = BarrierSynchronizer::new();
        let released = barrier.submit_batch(batch(1), Vec::new()).unwrap();
        assert!(released.is_some());

        assert!(matches!(
            barrier.submit_batch(batch(1), peers()),
            Err(BarrierError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_duplicate_stale_unknown_mismatch() {
        let mut barrier = BarrierSynchronizer::new();
        let b = batch(1);
        let digest = b.digest();
        barrier.submit_batch(b, peers()).unwrap();

        barrier.acknowledge(PeerId(1), 1, &digest);
        assert_eq!(barrier.acknowledge(PeerId(1), 1, &digest), AckOutcome::Duplicate);
        assert_eq!(barrier.acknowledge(PeerId(2), 0, &digest), AckOutcome::Stale);
        assert_eq!(barrier.acknowledge(PeerId(7), 1, &digest), AckOutcome::UnknownPeer);
        assert_eq!(
            barrier.acknowledge(PeerId(2), 1, &[0u8; 32]),
            AckOutcome::DigestMismatch
        );
        assert_eq!(barrier.missing(), vec![PeerId(2), PeerId(3)]);
    }

    #[test]
    fn test_timeout_then_stalled_release() {
        let mut barrier = BarrierSynchronizer::new();
        let b = batch(1);
        let digest = b.digest();
        barrier.submit_batch(b, peers()).unwrap();
        barrier.acknowledge(PeerId(1), 1, &digest);
        barrier.acknowledge(PeerId(2), 1, &digest);

        let timeout = barrier.advance(ms(401), ms(400)).unwrap();
        assert_eq!(timeout.missing, vec![PeerId(3)]);
        assert!(barrier.is_waiting_for_stragglers());

        // Fires once, then waits indefinitely
        assert!(barrier.advance(ms(10_000), ms(400)).is_none());
        assert_eq!(barrier.stalled_for(), Some(ms(10_000)));

        match barrier.acknowledge(PeerId(3), 1, &digest) {
            AckOutcome::Released(release) => assert!(release.stalled),
            other => panic!("expected release, got {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_completes_barrier() {
        let mut barrier = BarrierSynchronizer::new();
        let b = batch(1);
        let digest = b.digest();
        barrier.submit_batch(b, peers()).unwrap();
        barrier.acknowledge(PeerId(1), 1, &digest);
        barrier.acknowledge(PeerId(2), 1, &digest);

        let release = barrier.remove_peer(PeerId(3)).unwrap();
        assert_eq!(release.round_trips.len(), 2);
    }

    #[test]
    fn test_evict_stragglers() {
        let mut barrier = BarrierSynchronizer::new();
        let b = batch(1);
        let digest = b.digest();
        barrier.submit_batch(b, peers()).unwrap();
        barrier.acknowledge(PeerId(2), 1, &digest);
        barrier.advance(ms(500), ms(400));

        let release = barrier.evict_stragglers().unwrap();
        assert_eq!(release.evicted, vec![PeerId(1), PeerId(3)]);
        assert!(release.stalled);
        assert!(barrier.evict_stragglers().is_none());
    }
}
