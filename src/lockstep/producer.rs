//! Command Producer
//!
//! Buffers the local player's commands between turn boundaries. Each source
//! entity keeps only its most recent intent; when the authority asks for the
//! turn's submission the whole buffer is drained in one go.

use tracing::debug;

use super::command::{Command, CommandError, PeerId, TurnNumber};
use super::peer::PeerState;
use super::session::SessionContext;

/// Errors returned by [`CommandProducer::submit`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProducerError {
    /// The session handshake has not completed
    #[error("peer is not ready: session has not started")]
    NotReady,

    /// The command is malformed
    #[error("invalid command: {0}")]
    InvalidCommand(#[from] CommandError),

    /// Too many distinct sources pending this turn
    #[error("pending command queue full ({0} sources)")]
    QueueFull(usize),
}

/// Local command buffer for one peer.
#[derive(Clone, Debug)]
pub struct CommandProducer {
    state: PeerState,
    max_pending: usize,
    flushed_turns: u64,
}

impl CommandProducer {
    /// Create a producer for `peer_id`.
    pub fn new(peer_id: PeerId, context: &SessionContext) -> Self {
        Self::with_capacity(peer_id, context.config.max_pending_commands)
    }

    /// Create a producer with an explicit pending cap.
    pub fn with_capacity(peer_id: PeerId, max_pending: usize) -> Self {
        Self {
            state: PeerState::local(peer_id),
            max_pending,
            flushed_turns: 0,
        }
    }

    /// Peer this producer belongs to.
    pub fn peer_id(&self) -> PeerId {
        self.state.peer_id
    }

    /// Whether commands are accepted.
    pub fn is_ready(&self) -> bool {
        self.state.ready
    }

    /// Mark the handshake complete (or undo it when the session ends).
    pub fn set_ready(&mut self, ready: bool) {
        self.state.ready = ready;
    }

    /// Commands waiting for the next flush.
    pub fn pending(&self) -> &[Command] {
        &self.state.pending_commands
    }

    /// Turns flushed so far.
    pub fn flushed_turns(&self) -> u64 {
        self.flushed_turns
    }

    /// Queue a command for the current turn.
    ///
    /// A pending command from the same source is replaced.
    pub fn submit(&mut self, command: Command) -> Result<(), ProducerError> {
        if !self.state.ready {
            return Err(ProducerError::NotReady);
        }
        command.validate()?;

        let replaces = self.state.has_pending_for(&command);
        if !replaces && self.state.pending_commands.len() >= self.max_pending {
            return Err(ProducerError::QueueFull(self.max_pending));
        }
        if replaces {
            debug!(source = %command.source_id, "Superseding pending command");
        }

        self.state.push_last_wins(command);
        Ok(())
    }

    /// Drain the buffer for submission as `turn`.
    ///
    /// Returns an empty list when nothing was issued; empty submissions still
    /// have to be sent.
    pub fn flush(&mut self, turn: TurnNumber) -> Vec<Command> {
        let commands = self.state.drain_pending();
        self.flushed_turns += 1;
        debug!(
            peer = %self.state.peer_id,
            turn,
            count = commands.len(),
            "Flushed pending commands"
        );
        commands
    }
}
