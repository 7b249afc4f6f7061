//! Turn Scheduler
//!
//! Authoritative partitioning of session time into turns.
//!
//! ## Turn Lifecycle
//!
//! ```text
//! AwaitingTurnStart ──boundary──► CollectingInput ──boundary──► AwaitingAllPeerSubmissions
//!                                      │                               │
//!                                      └──────── all submitted ────────┤
//!                                                                      ▼
//!        Idle ◄──barrier cleared── AwaitingBarrierClearance ◄──── BatchReady
//!         │
//!         └──boundary──► CollectingInput (next turn)
//! ```
//!
//! The turn clock is an accumulator advanced by explicit `advance(delta)`
//! calls. A boundary fires whenever the accumulator exceeds the current turn
//! duration and the overshoot carries into the next turn. Boundaries that
//! fire while a batch is still in flight are consumed and counted as missed.
//! The clock does not move at all while the session is paused for a
//! straggler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::calibrator::CalibrationStats;
use super::command::{coalesce_last_wins, Command, CommandBatch, PeerId, TurnNumber};
use super::peer::PeerState;
use super::session::SessionContext;

// =============================================================================
// TYPES
// =============================================================================

/// Where the scheduler is in the current turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// Session started, first turn not yet opened
    AwaitingTurnStart,
    /// Turn open, within its first turn duration
    CollectingInput,
    /// Turn open past its duration, some submissions missing
    AwaitingAllPeerSubmissions,
    /// Batch assembled, not yet handed to the barrier
    BatchReady,
    /// Batch broadcast, waiting for every acknowledgement
    AwaitingBarrierClearance,
    /// Previous batch released, waiting for the next boundary
    Idle,
}

impl SchedulerState {
    /// Whether submissions for the open turn are being accepted.
    pub fn is_collecting(self) -> bool {
        matches!(
            self,
            SchedulerState::CollectingInput | SchedulerState::AwaitingAllPeerSubmissions
        )
    }
}

/// Something the authority must act on after [`TurnScheduler::advance`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A new turn opened; every peer must be asked to submit.
    TurnOpened {
        /// Turn being collected
        turn_number: TurnNumber,
    },
    /// Submissions did not arrive within the ack timeout.
    SubmissionsOverdue {
        /// Turn being collected
        turn_number: TurnNumber,
        /// Peers that have not submitted
        missing: Vec<PeerId>,
    },
}

/// Result of handing a peer's submission to the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Stored; `remaining` peers still have to submit
    Accepted {
        /// Peers yet to submit
        remaining: usize,
    },
    /// The turn already closed
    Stale,
    /// This peer already submitted for the turn
    Duplicate,
    /// The peer is not part of the session (or was removed)
    UnknownPeer,
    /// No turn with that number is open
    NotCollecting,
}

/// A turn that just closed.
#[derive(Clone, Debug)]
pub struct ClosedTurn {
    /// The assembled batch
    pub batch: Arc<CommandBatch>,
    /// Whether the session paused waiting for submissions
    pub stalled: bool,
}

/// Scheduler misuse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Operation needs a different state
    #[error("scheduler is {actual:?}, expected {expected:?}")]
    WrongState {
        /// State the operation needs
        expected: SchedulerState,
        /// Current state
        actual: SchedulerState,
    },

    /// Barrier clearance reported for a turn that is not in flight
    #[error("turn {received} cleared but turn {in_flight} is in flight")]
    TurnMismatch {
        /// Turn awaiting clearance
        in_flight: TurnNumber,
        /// Turn reported
        received: TurnNumber,
    },
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Authoritative turn clock and batch assembler.
#[derive(Clone, Debug)]
pub struct TurnScheduler {
    state: SchedulerState,
    peers: BTreeMap<PeerId, PeerState>,
    accumulator: Duration,
    open_turn: Option<TurnNumber>,
    last_closed: TurnNumber,
    window_elapsed: Duration,
    submission_stall: bool,
    stall_started_at: Duration,
    barrier_stall: bool,
    ready_batch: Option<Arc<CommandBatch>>,
    missed_boundaries: u64,
}

impl TurnScheduler {
    /// Create a scheduler expecting every peer on the session roster.
    pub fn new(context: &SessionContext) -> Self {
        let peers = context
            .roster
            .iter()
            .map(|&peer_id| (peer_id, PeerState::remote(peer_id)))
            .collect();

        Self {
            state: SchedulerState::AwaitingTurnStart,
            peers,
            accumulator: Duration::ZERO,
            open_turn: None,
            last_closed: 0,
            window_elapsed: Duration::ZERO,
            submission_stall: false,
            stall_started_at: Duration::ZERO,
            barrier_stall: false,
            ready_batch: None,
            missed_boundaries: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Peers
    // -------------------------------------------------------------------------

    /// Set a peer's handshake flag. Returns false for unknown peers.
    pub fn set_ready(&mut self, peer_id: PeerId, ready: bool) -> bool {
        match self.peers.get_mut(&peer_id) {
            Some(peer) => {
                peer.ready = ready;
                true
            }
            None => false,
        }
    }

    /// Whether every connected peer completed the handshake.
    pub fn all_ready(&self) -> bool {
        !self.peers.is_empty() && self.peers.values().all(|peer| peer.ready)
    }

    /// Drop a disconnected or evicted peer. It is no longer waited for.
    pub fn remove_peer(&mut self, peer_id: PeerId) -> bool {
        self.peers.remove(&peer_id).is_some()
    }

    /// Connected peers in ascending order.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// State of one peer.
    pub fn peer(&self, peer_id: PeerId) -> Option<&PeerState> {
        self.peers.get(&peer_id)
    }

    /// Remember a peer's last acknowledgement round trip.
    pub fn record_round_trip(&mut self, peer_id: PeerId, round_trip: Duration) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.last_round_trip = Some(round_trip);
        }
    }

    /// Peers that have not submitted for the open turn.
    pub fn missing_submissions(&self) -> Vec<PeerId> {
        match self.open_turn {
            Some(turn) if self.state.is_collecting() => self
                .peers
                .values()
                .filter(|peer| !peer.has_submitted(turn))
                .map(|peer| peer.peer_id)
                .collect(),
            _ => Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Turn being collected or in flight.
    pub fn open_turn(&self) -> Option<TurnNumber> {
        self.open_turn
    }

    /// Last turn a batch was assembled for.
    pub fn last_closed_turn(&self) -> TurnNumber {
        self.last_closed
    }

    /// Time carried towards the next boundary.
    pub fn accumulator(&self) -> Duration {
        self.accumulator
    }

    /// Boundaries consumed while a turn was still in progress.
    pub fn missed_boundaries(&self) -> u64 {
        self.missed_boundaries
    }

    /// Whether the session is paused waiting for submissions.
    pub fn is_submission_stalled(&self) -> bool {
        self.submission_stall
    }

    /// How long the session has been paused waiting for submissions.
    pub fn submission_stalled_for(&self) -> Option<Duration> {
        self.submission_stall
            .then(|| self.window_elapsed.saturating_sub(self.stall_started_at))
    }

    /// Whether the turn clock is frozen.
    pub fn is_clock_frozen(&self) -> bool {
        self.submission_stall || self.barrier_stall
    }

    /// Freeze or thaw the turn clock for a barrier straggler wait.
    pub fn set_barrier_stall(&mut self, stalled: bool) {
        self.barrier_stall = stalled;
    }

    // -------------------------------------------------------------------------
    // Clock
    // -------------------------------------------------------------------------

    /// Advance the turn clock by `delta` using the current calibrated timing.
    pub fn advance(&mut self, delta: Duration, stats: &CalibrationStats) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();

        // 1. Submission timeout runs on wall time, paused or not
        if let (true, Some(turn)) = (self.state.is_collecting(), self.open_turn) {
            self.window_elapsed += delta;
            if !self.submission_stall && self.window_elapsed > stats.current_ack_timeout {
                self.submission_stall = true;
                self.stall_started_at = self.window_elapsed;
                let missing = self.missing_submissions();
                warn!(turn, ?missing, "Submissions overdue, pausing session");
                events.push(SchedulerEvent::SubmissionsOverdue {
                    turn_number: turn,
                    missing,
                });
            }
        }

        // 2. Frozen clock: no boundaries, no carry
        if self.is_clock_frozen() {
            return events;
        }

        // 3. Fire boundaries, keeping the remainder
        let turn_duration = stats.current_turn_duration;
        self.accumulator += delta;
        while !turn_duration.is_zero() && self.accumulator > turn_duration {
            self.accumulator -= turn_duration;
            match self.state {
                SchedulerState::AwaitingTurnStart | SchedulerState::Idle => {
                    let turn = self.open_next_turn();
                    events.push(SchedulerEvent::TurnOpened { turn_number: turn });
                }
                SchedulerState::CollectingInput => {
                    self.state = SchedulerState::AwaitingAllPeerSubmissions;
                    self.missed_boundaries += 1;
                }
                _ => {
                    self.missed_boundaries += 1;
                }
            }
        }

        events
    }

    fn open_next_turn(&mut self) -> TurnNumber {
        let turn = self.last_closed + 1;
        for peer in self.peers.values_mut() {
            peer.pending_commands.clear();
            peer.submitted_turn = None;
        }
        self.open_turn = Some(turn);
        self.window_elapsed = Duration::ZERO;
        self.submission_stall = false;
        self.state = SchedulerState::CollectingInput;
        debug!(turn, peers = self.peers.len(), "Turn opened");
        turn
    }

    // -------------------------------------------------------------------------
    // Submissions and assembly
    // -------------------------------------------------------------------------

    /// Store a peer's commands for `turn_number`.
    pub fn submit(
        &mut self,
        peer_id: PeerId,
        turn_number: TurnNumber,
        commands: Vec<Command>,
    ) -> SubmissionOutcome {
        let open = match self.open_turn {
            Some(open) if self.state.is_collecting() => open,
            _ if turn_number <= self.last_closed => return SubmissionOutcome::Stale,
            _ => return SubmissionOutcome::NotCollecting,
        };
        if turn_number < open {
            return SubmissionOutcome::Stale;
        }
        if turn_number > open {
            return SubmissionOutcome::NotCollecting;
        }

        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return SubmissionOutcome::UnknownPeer;
        };
        if peer.has_submitted(turn_number) {
            return SubmissionOutcome::Duplicate;
        }

        peer.pending_commands = coalesce_last_wins(commands);
        peer.submitted_turn = Some(turn_number);

        let remaining = self
            .peers
            .values()
            .filter(|peer| !peer.has_submitted(turn_number))
            .count();
        SubmissionOutcome::Accepted { remaining }
    }

    /// Close the open turn if every connected peer has submitted.
    ///
    /// Commands are concatenated by ascending peer id, then by the order the
    /// peer submitted them.
    pub fn try_close_turn(&mut self) -> Option<ClosedTurn> {
        let turn = self.open_turn.filter(|_| self.state.is_collecting())?;
        if self.peers.values().any(|peer| !peer.has_submitted(turn)) {
            return None;
        }

        let mut commands = Vec::new();
        for peer in self.peers.values_mut() {
            commands.extend(peer.drain_pending());
        }
        let batch = Arc::new(CommandBatch::new(turn, commands, self.peers.len() as u32));

        let stalled = self.submission_stall;
        self.submission_stall = false;
        self.last_closed = turn;
        self.state = SchedulerState::BatchReady;
        self.ready_batch = Some(Arc::clone(&batch));

        debug!(turn, commands = batch.len(), stalled, "Turn closed");
        Some(ClosedTurn { batch, stalled })
    }

    /// Hand the ready batch over for broadcast.
    pub fn take_ready_batch(&mut self) -> Result<Arc<CommandBatch>, SchedulerError> {
        match (self.state, self.ready_batch.take()) {
            (SchedulerState::BatchReady, Some(batch)) => {
                self.state = SchedulerState::AwaitingBarrierClearance;
                Ok(batch)
            }
            (actual, _) => Err(SchedulerError::WrongState {
                expected: SchedulerState::BatchReady,
                actual,
            }),
        }
    }

    /// The batch for `turn_number` cleared the barrier.
    pub fn barrier_cleared(&mut self, turn_number: TurnNumber) -> Result<(), SchedulerError> {
        if self.state != SchedulerState::AwaitingBarrierClearance {
            return Err(SchedulerError::WrongState {
                expected: SchedulerState::AwaitingBarrierClearance,
                actual: self.state,
            });
        }
        if turn_number != self.last_closed {
            return Err(SchedulerError::TurnMismatch {
                in_flight: self.last_closed,
                received: turn_number,
            });
        }
        self.state = SchedulerState::Idle;
        self.open_turn = None;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
