//! Per-peer lockstep state.

use std::time::Duration;

use super::command::{Command, PeerId, TurnNumber};

/// One peer as seen by the component that owns it.
///
/// A producer owns the local peer's state; the scheduler owns one state per
/// remote peer holding that peer's submission for the open turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerState {
    /// Peer identifier
    pub peer_id: PeerId,
    /// Handshake complete
    pub ready: bool,
    /// Commands gathered during the current turn window
    pub pending_commands: Vec<Command>,
    /// Whether this is the peer running in this process
    pub is_local: bool,
    /// Turn the pending commands were submitted for, if any
    pub submitted_turn: Option<TurnNumber>,
    /// Broadcast-to-ack time of the last released batch
    pub last_round_trip: Option<Duration>,
}

impl PeerState {
    /// State for the peer running in this process.
    pub fn local(peer_id: PeerId) -> Self {
        Self::new(peer_id, true)
    }

    /// State for a peer reached over the network.
    pub fn remote(peer_id: PeerId) -> Self {
        Self::new(peer_id, false)
    }

    fn new(peer_id: PeerId, is_local: bool) -> Self {
        Self {
            peer_id,
            ready: false,
            pending_commands: Vec::new(),
            is_local,
            submitted_turn: None,
            last_round_trip: None,
        }
    }

    /// Add a command, replacing any pending command from the same source.
    pub fn push_last_wins(&mut self, command: Command) {
        self.pending_commands
            .retain(|pending| pending.source_id != command.source_id);
        self.pending_commands.push(command);
    }

    /// Whether the source already has a pending command.
    pub fn has_pending_for(&self, command: &Command) -> bool {
        self.pending_commands
            .iter()
            .any(|pending| pending.source_id == command.source_id)
    }

    /// Take every pending command, leaving the list empty.
    pub fn drain_pending(&mut self) -> Vec<Command> {
        self.submitted_turn = None;
        std::mem::take(&mut self.pending_commands)
    }

    /// Whether this peer has submitted for `turn`.
    pub fn has_submitted(&self, turn: TurnNumber) -> bool {
        self.submitted_turn == Some(turn)
    }
}
