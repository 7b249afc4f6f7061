//! Authority Role
//!
//! The one peer (or dedicated host) that owns the turn clock. It wires the
//! scheduler, barrier and calibrator together and turns incoming peer
//! messages and clock ticks into outbound messages. It performs no I/O;
//! transports deliver what it returns.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::lockstep::barrier::{AckOutcome, BarrierRelease, BarrierSynchronizer};
use crate::lockstep::calibrator::LatencyCalibrator;
use crate::lockstep::command::{Command, PeerId, TurnNumber};
use crate::lockstep::scheduler::{SchedulerEvent, SubmissionOutcome, TurnScheduler};
use crate::lockstep::session::SessionContext;
use super::protocol::{AuthorityMessage, PauseReason, PeerMessage, RejectReason, SessionStartInfo};

// =============================================================================
// OUTBOUND
// =============================================================================

/// Who an outbound message goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recipient {
    /// Every connected peer
    All,
    /// One peer
    Peer(PeerId),
}

/// A message the transport must deliver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    /// Destination
    pub recipient: Recipient,
    /// Payload
    pub message: AuthorityMessage,
}

impl Outbound {
    fn all(message: AuthorityMessage) -> Self {
        Self {
            recipient: Recipient::All,
            message,
        }
    }

    fn to(peer_id: PeerId, message: AuthorityMessage) -> Self {
        Self {
            recipient: Recipient::Peer(peer_id),
            message,
        }
    }
}

/// Counters for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthorityStats {
    /// Batches released to peers
    pub turns_released: u64,
    /// Pauses for late submissions or acks
    pub stalls: u64,
    /// Peers evicted for stalling
    pub evictions: u64,
    /// Acks rejected for a wrong batch digest
    pub digest_mismatches: u64,
    /// Submissions for turns that already closed
    pub stale_submissions: u64,
}

// =============================================================================
// AUTHORITY
// =============================================================================

/// Authoritative lockstep state machine.
#[derive(Debug)]
pub struct AuthorityRole {
    context: SessionContext,
    scheduler: TurnScheduler,
    barrier: BarrierSynchronizer,
    calibrator: LatencyCalibrator,
    joined: BTreeSet<PeerId>,
    evicted: BTreeSet<PeerId>,
    started: bool,
    stats: AuthorityStats,
}

impl AuthorityRole {
    /// Create the authority for a session.
    pub fn new(context: SessionContext) -> Self {
        Self {
            scheduler: TurnScheduler::new(&context),
            barrier: BarrierSynchronizer::new(),
            calibrator: LatencyCalibrator::new(context.config.calibration.clone()),
            joined: BTreeSet::new(),
            evicted: BTreeSet::new(),
            started: false,
            stats: AuthorityStats::default(),
            context,
        }
    }

    /// Session context.
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Turn scheduler.
    pub fn scheduler(&self) -> &TurnScheduler {
        &self.scheduler
    }

    /// Acknowledgement barrier.
    pub fn barrier(&self) -> &BarrierSynchronizer {
        &self.barrier
    }

    /// Latency calibrator.
    pub fn calibrator(&self) -> &LatencyCalibrator {
        &self.calibrator
    }

    /// Diagnostics counters.
    pub fn stats(&self) -> &AuthorityStats {
        &self.stats
    }

    /// Whether every peer joined and turns are running.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the session started and has no peers left.
    pub fn is_finished(&self) -> bool {
        self.started && self.scheduler.connected_peers().is_empty()
    }

    /// Whether peers are currently told to pause.
    pub fn is_paused(&self) -> bool {
        self.scheduler.is_clock_frozen()
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Handle one message from a peer.
    pub fn handle(&mut self, message: PeerMessage) -> Vec<Outbound> {
        let mut out = Vec::new();
        match message {
            PeerMessage::Join { peer_id } => self.on_join(peer_id, &mut out),
            PeerMessage::SubmitCommands {
                peer_id,
                turn_number,
                commands,
            } => self.on_submit(peer_id, turn_number, commands, &mut out),
            PeerMessage::Acknowledge {
                peer_id,
                turn_number,
                batch_digest,
            } => self.on_acknowledge(peer_id, turn_number, &batch_digest, &mut out),
            PeerMessage::Leave { peer_id } => self.on_disconnect(peer_id, &mut out),
        }
        out
    }

    /// A peer's connection closed.
    pub fn peer_disconnected(&mut self, peer_id: PeerId) -> Vec<Outbound> {
        let mut out = Vec::new();
        self.on_disconnect(peer_id, &mut out);
        out
    }

    fn on_join(&mut self, peer_id: PeerId, out: &mut Vec<Outbound>) {
        let rejection = if self.evicted.contains(&peer_id) {
            Some(RejectReason::Evicted)
        } else if !self.context.is_member(peer_id) {
            Some(RejectReason::NotInRoster)
        } else if self.started {
            Some(RejectReason::SessionInProgress)
        } else {
            None
        };
        if let Some(reason) = rejection {
            warn!(peer = %peer_id, ?reason, "Rejecting join");
            out.push(Outbound::to(peer_id, AuthorityMessage::Rejected { reason }));
            return;
        }

        self.joined.insert(peer_id);
        self.scheduler.set_ready(peer_id, true);
        info!(
            peer = %peer_id,
            joined = self.joined.len(),
            roster = self.context.roster.len(),
            "Peer joined"
        );

        if self.scheduler.all_ready() {
            self.started = true;
            let info = SessionStartInfo {
                session_id: self.context.session_id,
                roster: self.scheduler.connected_peers(),
                turn_duration_ms: self.calibrator.stats().current_turn_duration.as_millis() as u64,
            };
            info!(session = %info.session_id, peers = info.roster.len(), "Session started");
            out.push(Outbound::all(AuthorityMessage::SessionStarted(info)));
        }
    }

    fn on_submit(
        &mut self,
        peer_id: PeerId,
        turn_number: TurnNumber,
        commands: Vec<Command>,
        out: &mut Vec<Outbound>,
    ) {
        if !self.started {
            debug!(peer = %peer_id, turn = turn_number, "Submission before session start ignored");
            return;
        }
        match self.scheduler.submit(peer_id, turn_number, commands) {
            SubmissionOutcome::Accepted { remaining } => {
                debug!(peer = %peer_id, turn = turn_number, remaining, "Submission accepted");
                self.pump(out);
            }
            SubmissionOutcome::Stale => {
                self.stats.stale_submissions += 1;
                debug!(peer = %peer_id, turn = turn_number, "Discarding stale submission");
            }
            outcome => {
                debug!(peer = %peer_id, turn = turn_number, ?outcome, "Submission ignored");
            }
        }
    }

    fn on_acknowledge(
        &mut self,
        peer_id: PeerId,
        turn_number: TurnNumber,
        digest: &[u8; 32],
        out: &mut Vec<Outbound>,
    ) {
        match self.barrier.acknowledge(peer_id, turn_number, digest) {
            AckOutcome::Released(release) => self.on_release(release, out),
            AckOutcome::Recorded { remaining } => {
                debug!(peer = %peer_id, turn = turn_number, remaining, "Acknowledgement recorded");
            }
            AckOutcome::DigestMismatch => {
                self.stats.digest_mismatches += 1;
                if let Some(batch) = self.barrier.outstanding() {
                    out.push(Outbound::to(
                        peer_id,
                        AuthorityMessage::BroadcastBatch(batch.as_ref().clone()),
                    ));
                }
            }
            outcome => {
                debug!(peer = %peer_id, turn = turn_number, ?outcome, "Acknowledgement ignored");
            }
        }
    }

    fn on_disconnect(&mut self, peer_id: PeerId, out: &mut Vec<Outbound>) {
        if !self.started {
            if self.joined.remove(&peer_id) {
                self.scheduler.set_ready(peer_id, false);
                info!(peer = %peer_id, "Peer left before session start");
            }
            return;
        }
        if !self.scheduler.remove_peer(peer_id) {
            return;
        }
        self.joined.remove(&peer_id);
        info!(peer = %peer_id, remaining = self.scheduler.connected_peers().len(), "Peer left session");

        if let Some(release) = self.barrier.remove_peer(peer_id) {
            self.on_release(release, out);
        }
        self.pump(out);
    }

    // -------------------------------------------------------------------------
    // Clock
    // -------------------------------------------------------------------------

    /// Advance session time by `delta`.
    pub fn advance(&mut self, delta: Duration) -> Vec<Outbound> {
        let mut out = Vec::new();
        if !self.started {
            return out;
        }
        let stats = self.calibrator.stats().clone();

        // 1. Acknowledgement timeout
        if let Some(timeout) = self.barrier.advance(delta, stats.current_ack_timeout) {
            self.scheduler.set_barrier_stall(true);
            out.push(Outbound::all(AuthorityMessage::SimulationPaused {
                reason: PauseReason::AwaitingAcknowledgements {
                    turn_number: timeout.turn_number,
                    missing: timeout.missing,
                },
            }));
        }

        // 2. Turn clock and submission timeout
        for event in self.scheduler.advance(delta, &stats) {
            match event {
                SchedulerEvent::TurnOpened { turn_number } => {
                    out.push(Outbound::all(AuthorityMessage::RequestSubmission { turn_number }));
                }
                SchedulerEvent::SubmissionsOverdue {
                    turn_number,
                    missing,
                } => {
                    out.push(Outbound::all(AuthorityMessage::SimulationPaused {
                        reason: PauseReason::AwaitingSubmissions {
                            turn_number,
                            missing,
                        },
                    }));
                }
            }
        }

        // 3. Eviction policy
        self.enforce_eviction(&mut out);

        // 4. A turn with no peers to wait for closes right away
        self.pump(&mut out);
        out
    }

    fn enforce_eviction(&mut self, out: &mut Vec<Outbound>) {
        let Some(limit) = self.context.config.straggler_eviction_after else {
            return;
        };

        if self.scheduler.submission_stalled_for().is_some_and(|stalled| stalled >= limit) {
            for peer_id in self.scheduler.missing_submissions() {
                self.evict(peer_id, out);
            }
            self.pump(out);
        }

        if self.barrier.stalled_for().is_some_and(|stalled| stalled >= limit) {
            let stragglers = self.barrier.missing();
            if let Some(release) = self.barrier.evict_stragglers() {
                for peer_id in stragglers {
                    self.evict(peer_id, out);
                }
                self.on_release(release, out);
            }
        }
    }

    fn evict(&mut self, peer_id: PeerId, out: &mut Vec<Outbound>) {
        warn!(peer = %peer_id, "Evicting peer that stalled the session");
        self.scheduler.remove_peer(peer_id);
        self.joined.remove(&peer_id);
        self.evicted.insert(peer_id);
        self.stats.evictions += 1;
        out.push(Outbound::all(AuthorityMessage::PeerEvicted { peer_id }));
    }

    // -------------------------------------------------------------------------
    // Turn progression
    // -------------------------------------------------------------------------

    /// Close the open turn if possible and hand its batch to the barrier.
    fn pump(&mut self, out: &mut Vec<Outbound>) {
        let Some(closed) = self.scheduler.try_close_turn() else {
            return;
        };
        if closed.stalled {
            self.stats.stalls += 1;
            self.calibrator.record_stall();
        }

        let batch = match self.scheduler.take_ready_batch() {
            Ok(batch) => batch,
            Err(e) => {
                error!("Closed turn not ready for broadcast: {}", e);
                return;
            }
        };
        out.push(Outbound::all(AuthorityMessage::BroadcastBatch(batch.as_ref().clone())));

        match self.barrier.submit_batch(batch, self.scheduler.connected_peers()) {
            Ok(Some(release)) => self.on_release(release, out),
            Ok(None) => {}
            Err(e) => error!("Barrier refused batch: {}", e),
        }
    }

    fn on_release(&mut self, release: BarrierRelease, out: &mut Vec<Outbound>) {
        self.scheduler.set_barrier_stall(false);
        for (&peer_id, &round_trip) in &release.round_trips {
            self.scheduler.record_round_trip(peer_id, round_trip);
        }

        if release.stalled {
            self.stats.stalls += 1;
            self.calibrator.record_stall();
        }
        if !release.round_trips.is_empty() {
            self.calibrator.record_round_trip(release.slowest_round_trip);
        }

        if let Err(e) = self.scheduler.barrier_cleared(release.turn_number) {
            error!("Barrier released an unexpected turn: {}", e);
        }
        self.stats.turns_released += 1;
        out.push(Outbound::all(AuthorityMessage::ReleaseToApply {
            turn_number: release.turn_number,
        }));
    }
}

// =============================================================================
// TESTS
// =============================================================================
