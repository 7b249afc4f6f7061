//! Peer Role
//!
//! What every participant runs, the authority's own player included. It
//! answers submission requests from its producer, acknowledges batches,
//! applies them on release and freezes its simulation clock while the
//! session is paused.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::core::hash::short_hex;
use crate::lockstep::applier::{ApplyError, ApplyReport, CommandApplier, EntityWorld};
use crate::lockstep::command::{Command, CommandBatch, PeerId, TurnNumber};
use crate::lockstep::producer::{CommandProducer, ProducerError};
use crate::lockstep::session::SessionContext;
use super::protocol::{AuthorityMessage, PauseReason, PeerMessage, RejectReason, SessionStartInfo};

/// Errors that end this peer's participation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    /// Local state diverged from the session
    #[error(transparent)]
    Desync(#[from] ApplyError),

    /// Told to apply a turn this peer never received
    #[error("release for turn {0} arrived without its batch")]
    MissingBatch(TurnNumber),

    /// The authority refused this peer
    #[error("rejected by authority: {0:?}")]
    Rejected(RejectReason),

    /// Removed from the session for stalling it
    #[error("evicted from session")]
    Evicted,

    /// A previous error stopped this peer
    #[error("peer halted")]
    Halted,
}

/// What handling one message produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerReaction {
    /// Messages to send to the authority
    pub replies: Vec<PeerMessage>,
    /// Report of a batch applied to the world
    pub applied: Option<ApplyReport>,
}

impl PeerReaction {
    fn reply(message: PeerMessage) -> Self {
        Self {
            replies: vec![message],
            applied: None,
        }
    }
}

/// Lockstep participant state machine.
#[derive(Debug)]
pub struct PeerRole {
    peer_id: PeerId,
    producer: CommandProducer,
    applier: CommandApplier,
    held: Option<CommandBatch>,
    pause: Option<PauseReason>,
    session: Option<SessionStartInfo>,
    simulation_time: Duration,
    halted: bool,
}

impl PeerRole {
    /// Create the participant `peer_id`.
    pub fn new(peer_id: PeerId, context: &SessionContext) -> Self {
        Self {
            peer_id,
            producer: CommandProducer::new(peer_id, context),
            applier: CommandApplier::new(context),
            held: None,
            pause: None,
            session: None,
            simulation_time: Duration::ZERO,
            halted: false,
        }
    }

    /// This peer's id.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Handshake message to send on connect.
    pub fn join_message(&self) -> PeerMessage {
        PeerMessage::Join { peer_id: self.peer_id }
    }

    /// Queue a local command for the current turn.
    pub fn submit(&mut self, command: Command) -> Result<(), ProducerError> {
        self.producer.submit(command)
    }

    /// Local command buffer.
    pub fn producer(&self) -> &CommandProducer {
        &self.producer
    }

    /// Last turn applied to the world.
    pub fn last_applied_turn(&self) -> TurnNumber {
        self.applier.last_applied()
    }

    /// Session announcement, once received.
    pub fn session(&self) -> Option<&SessionStartInfo> {
        self.session.as_ref()
    }

    /// Why the session is paused, if it is.
    pub fn pause_reason(&self) -> Option<&PauseReason> {
        self.pause.as_ref()
    }

    /// Whether the simulation clock is frozen.
    pub fn is_paused(&self) -> bool {
        self.pause.is_some()
    }

    /// Whether an error stopped this peer.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Simulation time elapsed while unpaused.
    pub fn simulation_time(&self) -> Duration {
        self.simulation_time
    }

    /// Advance the local simulation clock by wall time `delta`.
    ///
    /// Returns the time the game simulation should step by: zero while the
    /// session is paused. Rendering keeps running regardless.
    pub fn advance(&mut self, delta: Duration) -> Duration {
        if self.pause.is_some() || self.halted {
            return Duration::ZERO;
        }
        self.simulation_time += delta;
        delta
    }

    /// Handle one message from the authority.
    pub fn handle<W: EntityWorld>(
        &mut self,
        message: AuthorityMessage,
        world: &mut W,
    ) -> Result<PeerReaction, PeerError> {
        if self.halted {
            return Err(PeerError::Halted);
        }
        let result = self.dispatch(message, world);
        if result.is_err() {
            self.halted = true;
            self.producer.set_ready(false);
        }
        result
    }

    fn dispatch<W: EntityWorld>(
        &mut self,
        message: AuthorityMessage,
        world: &mut W,
    ) -> Result<PeerReaction, PeerError> {
        match message {
            AuthorityMessage::SessionStarted(info) => {
                info!(peer = %self.peer_id, session = %info.session_id, "Session started");
                self.producer.set_ready(true);
                self.session = Some(info);
                Ok(PeerReaction::default())
            }

            AuthorityMessage::RequestSubmission { turn_number } => {
                self.resume();
                let commands = self.producer.flush(turn_number);
                Ok(PeerReaction::reply(PeerMessage::SubmitCommands {
                    peer_id: self.peer_id,
                    turn_number,
                    commands,
                }))
            }

            AuthorityMessage::BroadcastBatch(batch) => {
                // A resend of the held batch goes to this peer alone while
                // the rest of the session may still be paused.
                let newer = self
                    .held
                    .as_ref()
                    .map_or(true, |held| batch.turn_number > held.turn_number);
                if newer {
                    self.resume();
                }
                if batch.turn_number <= self.applier.last_applied() {
                    debug!(turn = batch.turn_number, "Ignoring batch for applied turn");
                    return Ok(PeerReaction::default());
                }
                let digest = batch.digest();
                debug!(
                    peer = %self.peer_id,
                    turn = batch.turn_number,
                    digest = %short_hex(&digest),
                    "Holding batch"
                );
                let turn_number = batch.turn_number;
                self.held = Some(batch);
                Ok(PeerReaction::reply(PeerMessage::Acknowledge {
                    peer_id: self.peer_id,
                    turn_number,
                    batch_digest: digest,
                }))
            }

            AuthorityMessage::ReleaseToApply { turn_number } => {
                self.resume();
                match self.held.take() {
                    Some(batch) if batch.turn_number == turn_number => {
                        let report = self.applier.apply(&batch, world)?;
                        Ok(PeerReaction {
                            replies: Vec::new(),
                            applied: Some(report),
                        })
                    }
                    held => {
                        self.held = held;
                        if turn_number <= self.applier.last_applied() {
                            return Ok(PeerReaction::default());
                        }
                        error!(peer = %self.peer_id, turn = turn_number, "Release without batch");
                        Err(PeerError::MissingBatch(turn_number))
                    }
                }
            }

            AuthorityMessage::SimulationPaused { reason } => {
                warn!(peer = %self.peer_id, ?reason, "Simulation paused");
                self.pause = Some(reason);
                Ok(PeerReaction::default())
            }

            AuthorityMessage::PeerEvicted { peer_id } if peer_id == self.peer_id => {
                Err(PeerError::Evicted)
            }

            AuthorityMessage::PeerEvicted { peer_id } => {
                info!(peer = %peer_id, "Peer evicted from session");
                Ok(PeerReaction::default())
            }

            AuthorityMessage::Rejected { reason } => Err(PeerError::Rejected(reason)),
        }
    }

    fn resume(&mut self) {
        if self.pause.take().is_some() {
            info!(peer = %self.peer_id, "Simulation resumed");
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
