//! Protocol Messages
//!
//! Wire format between the authority and the peers. Messages are
//! fire-and-forget and correlated only by turn number and peer id. They are
//! serialized as internally tagged JSON; batches also have a bincode form
//! (see [`CommandBatch::to_bytes`]).

use serde::{Serialize, Deserialize};

use crate::core::hash::BatchDigest;
use crate::lockstep::command::{Command, CommandBatch, PeerId, TurnNumber};
use crate::lockstep::session::SessionId;

// =============================================================================
// PEER -> AUTHORITY MESSAGES
// =============================================================================

/// Messages sent from a peer to the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Handshake: the peer is loaded and ready to start.
    Join {
        /// Sending peer
        peer_id: PeerId,
    },

    /// The peer's commands for a turn (possibly empty).
    SubmitCommands {
        /// Sending peer
        peer_id: PeerId,
        /// Turn the commands belong to
        turn_number: TurnNumber,
        /// Commands in submission order
        commands: Vec<Command>,
    },

    /// The peer holds the batch for a turn.
    Acknowledge {
        /// Sending peer
        peer_id: PeerId,
        /// Acknowledged turn
        turn_number: TurnNumber,
        /// Digest of the batch the peer holds
        batch_digest: BatchDigest,
    },

    /// The peer is leaving the session.
    Leave {
        /// Sending peer
        peer_id: PeerId,
    },
}

impl PeerMessage {
    /// Peer that sent the message.
    pub fn peer_id(&self) -> PeerId {
        match self {
            PeerMessage::Join { peer_id }
            | PeerMessage::SubmitCommands { peer_id, .. }
            | PeerMessage::Acknowledge { peer_id, .. }
            | PeerMessage::Leave { peer_id } => *peer_id,
        }
    }
}

// =============================================================================
// AUTHORITY -> PEER MESSAGES
// =============================================================================

/// Messages sent from the authority to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthorityMessage {
    /// Every peer joined; commands are now accepted.
    SessionStarted(SessionStartInfo),

    /// Flush pending commands for this turn.
    RequestSubmission {
        /// Turn being collected
        turn_number: TurnNumber,
    },

    /// The assembled batch for a turn.
    BroadcastBatch(CommandBatch),

    /// Every peer holds the batch; apply it.
    ReleaseToApply {
        /// Turn to apply
        turn_number: TurnNumber,
    },

    /// Freeze the turn clock until the session makes progress again.
    SimulationPaused {
        /// Why the session is waiting
        reason: PauseReason,
    },

    /// A peer was removed for stalling the session.
    PeerEvicted {
        /// Removed peer
        peer_id: PeerId,
    },

    /// The authority refused a message.
    Rejected {
        /// Why
        reason: RejectReason,
    },
}

/// Session start announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartInfo {
    /// Session identifier
    pub session_id: SessionId,
    /// Participating peers, ascending
    pub roster: Vec<PeerId>,
    /// Initial turn duration in milliseconds
    pub turn_duration_ms: u64,
}

/// Why the session paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseReason {
    /// Some peers have not submitted commands for the open turn.
    AwaitingSubmissions {
        /// Open turn
        turn_number: TurnNumber,
        /// Peers not yet submitted
        missing: Vec<PeerId>,
    },
    /// Some peers have not acknowledged the outstanding batch.
    AwaitingAcknowledgements {
        /// Outstanding turn
        turn_number: TurnNumber,
        /// Peers not yet acknowledged
        missing: Vec<PeerId>,
    },
}

/// Why a message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Peer is not on the session roster.
    NotInRoster,
    /// The session already started.
    SessionInProgress,
    /// The peer was evicted earlier.
    Evicted,
    /// Another open connection already speaks for this peer.
    AlreadyConnected,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl PeerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl AuthorityMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vec2::FixedVec2;
    use crate::lockstep::command::EntityId;
    use uuid::Uuid;

    #[test]
    fn test_peer_message_json() {
        let msg = PeerMessage::SubmitCommands {
            peer_id: PeerId(2),
            turn_number: 5,
            commands: vec![Command::move_to(EntityId(1), FixedVec2::from_ints(5, 5))],
        };

        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"submit_commands\""));
        assert!(json.contains("\"kind\":\"move\""));

        let parsed = PeerMessage::from_json(&json).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.peer_id(), PeerId(2));
    }

    #[test]
    fn test_empty_submission_json() {
        let json = r#"{"type":"submit_commands","peer_id":3,"turn_number":9,"commands":[]}"#;
        match PeerMessage::from_json(json).unwrap() {
            PeerMessage::SubmitCommands { commands, turn_number, .. } => {
                assert!(commands.is_empty());
                assert_eq!(turn_number, 9);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_acknowledge_carries_digest() {
        let batch = CommandBatch::empty(4, 2);
        let msg = PeerMessage::Acknowledge {
            peer_id: PeerId(1),
            turn_number: 4,
            batch_digest: batch.digest(),
        };

        let parsed = PeerMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_authority_message_json() {
        let messages = vec![
            AuthorityMessage::SessionStarted(SessionStartInfo {
                session_id: Uuid::nil(),
                roster: vec![PeerId(1), PeerId(2)],
                turn_duration_ms: 200,
            }),
            AuthorityMessage::RequestSubmission { turn_number: 1 },
            AuthorityMessage::BroadcastBatch(CommandBatch::new(
                1,
                vec![Command::attack(EntityId(2), EntityId(1))],
                2,
            )),
            AuthorityMessage::ReleaseToApply { turn_number: 1 },
            AuthorityMessage::SimulationPaused {
                reason: PauseReason::AwaitingAcknowledgements {
                    turn_number: 1,
                    missing: vec![PeerId(2)],
                },
            },
            AuthorityMessage::PeerEvicted { peer_id: PeerId(2) },
            AuthorityMessage::Rejected { reason: RejectReason::SessionInProgress },
        ];

        for msg in messages {
            let json = msg.to_json().unwrap();
            assert_eq!(AuthorityMessage::from_json(&json).unwrap(), msg);
        }
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(PeerMessage::from_json(r#"{"type":"dance"}"#).is_err());
        assert!(AuthorityMessage::from_json("not json").is_err());
    }
}
