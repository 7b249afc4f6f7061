//! Commands and Command Batches
//!
//! A [`Command`] is one player's intent for one entity. A [`CommandBatch`] is
//! the ordered set of every peer's commands for one turn. Both are immutable
//! once built and encode to the same bytes on every peer.

use std::fmt;
use serde::{Serialize, Deserialize};

use crate::core::fixed::Fixed;
use crate::core::hash::{BatchDigest, DigestInput, LockstepHasher};
use crate::core::vec2::FixedVec2;

/// Monotonic turn counter. Turn 1 is the first batch of a session.
pub type TurnNumber = u64;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Network-wide identifier of a simulated entity (unit, building, resource).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

impl DigestInput for EntityId {
    fn feed(&self, sha: &mut sha2::Sha256) {
        self.0.feed(sha);
    }
}

/// Identifier of a peer (one simulation instance / player).
///
/// Ordering matters: batches list commands by ascending peer id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

// =============================================================================
// COMMAND
// =============================================================================

/// What a command asks its source entity to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Move to `target_position`; `scalar_param` is the stopping distance.
    Move,
    /// Attack `target_id`.
    Attack,
    /// Gather from the resource `target_id`.
    Collect,
    /// Construct the building `target_id`.
    Build,
    /// Heal `target_id`.
    Heal,
    /// Convert `target_id` to the source's faction.
    Convert,
    /// Game-defined action `custom_action_id`.
    CustomAction,
    /// Add `scalar_param` health (negative for damage).
    HealthDelta,
    /// Remove the entity from the world.
    Destroy,
}

impl CommandKind {
    /// Stable wire tag, used for hashing.
    pub fn tag(self) -> u8 {
        match self {
            CommandKind::Move => 0,
            CommandKind::Attack => 1,
            CommandKind::Collect => 2,
            CommandKind::Build => 3,
            CommandKind::Heal => 4,
            CommandKind::Convert => 5,
            CommandKind::CustomAction => 6,
            CommandKind::HealthDelta => 7,
            CommandKind::Destroy => 8,
        }
    }

    /// Whether this kind acts on another entity named by `target_id`.
    pub fn requires_target(self) -> bool {
        matches!(
            self,
            CommandKind::Attack
                | CommandKind::Collect
                | CommandKind::Build
                | CommandKind::Heal
                | CommandKind::Convert
        )
    }
}

/// Errors for malformed commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Move without a destination
    #[error("{kind:?} command for {source_id} has no target position")]
    MissingTargetPosition {
        /// Command kind
        kind: CommandKind,
        /// Source entity
        source_id: EntityId,
    },

    /// Targeted kind without a target entity
    #[error("{kind:?} command for {source_id} has no target entity")]
    MissingTarget {
        /// Command kind
        kind: CommandKind,
        /// Source entity
        source_id: EntityId,
    },

    /// Custom action without an action id
    #[error("custom action for {0} has no action id")]
    MissingCustomActionId(EntityId),
}

/// A single player intent, produced locally and replayed on every peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Entity performing the action
    pub source_id: EntityId,
    /// Entity acted upon, when the kind needs one
    pub target_id: Option<EntityId>,
    /// Destination for movement
    pub target_position: Option<FixedVec2>,
    /// Kind-dependent scalar (stopping distance, health amount)
    pub scalar_param: Fixed,
    /// What to do
    pub kind: CommandKind,
    /// Game-defined action id for [`CommandKind::CustomAction`]
    pub custom_action_id: Option<i32>,
    /// Where the source stood on the issuing peer when the command was made.
    ///
    /// Lets appliers snap an entity that has drifted back onto the agreed
    /// position before acting.
    pub origin_position: Option<FixedVec2>,
}

impl Command {
    fn base(source_id: EntityId, kind: CommandKind) -> Self {
        Self {
            source_id,
            target_id: None,
            target_position: None,
            scalar_param: 0,
            kind,
            custom_action_id: None,
            origin_position: None,
        }
    }

    fn targeting(source_id: EntityId, kind: CommandKind, target_id: EntityId) -> Self {
        Self {
            target_id: Some(target_id),
            ..Self::base(source_id, kind)
        }
    }

    /// Move `source_id` to `destination`.
    pub fn move_to(source_id: EntityId, destination: FixedVec2) -> Self {
        Self {
            target_position: Some(destination),
            ..Self::base(source_id, CommandKind::Move)
        }
    }

    /// Attack `target_id`.
    pub fn attack(source_id: EntityId, target_id: EntityId) -> Self {
        Self::targeting(source_id, CommandKind::Attack, target_id)
    }

    /// Gather from `resource_id`.
    pub fn collect(source_id: EntityId, resource_id: EntityId) -> Self {
        Self::targeting(source_id, CommandKind::Collect, resource_id)
    }

    /// Construct `building_id`.
    pub fn build(source_id: EntityId, building_id: EntityId) -> Self {
        Self::targeting(source_id, CommandKind::Build, building_id)
    }

    /// Heal `target_id`.
    pub fn heal(source_id: EntityId, target_id: EntityId) -> Self {
        Self::targeting(source_id, CommandKind::Heal, target_id)
    }

    /// Convert `target_id`.
    pub fn convert(source_id: EntityId, target_id: EntityId) -> Self {
        Self::targeting(source_id, CommandKind::Convert, target_id)
    }

    /// Run game-defined action `action_id`, optionally against `target_id`.
    pub fn custom(source_id: EntityId, action_id: i32, target_id: Option<EntityId>) -> Self {
        Self {
            target_id,
            custom_action_id: Some(action_id),
            ..Self::base(source_id, CommandKind::CustomAction)
        }
    }

    /// Change the health of `source_id` by `amount`.
    pub fn health_delta(source_id: EntityId, amount: Fixed) -> Self {
        Self {
            scalar_param: amount,
            ..Self::base(source_id, CommandKind::HealthDelta)
        }
    }

    /// Remove `source_id` from the world.
    pub fn destroy(source_id: EntityId) -> Self {
        Self::base(source_id, CommandKind::Destroy)
    }

    /// Set the stopping distance of a move (or any scalar parameter).
    pub fn with_scalar(mut self, scalar_param: Fixed) -> Self {
        self.scalar_param = scalar_param;
        self
    }

    /// Record the source's position at issue time.
    pub fn with_origin(mut self, origin: FixedVec2) -> Self {
        self.origin_position = Some(origin);
        self
    }

    /// Check that the command carries what its kind needs.
    pub fn validate(&self) -> Result<(), CommandError> {
        match self.kind {
            CommandKind::Move if self.target_position.is_none() => {
                Err(CommandError::MissingTargetPosition {
                    kind: self.kind,
                    source_id: self.source_id,
                })
            }
            kind if kind.requires_target() && self.target_id.is_none() => {
                Err(CommandError::MissingTarget {
                    kind,
                    source_id: self.source_id,
                })
            }
            CommandKind::CustomAction if self.custom_action_id.is_none() => {
                Err(CommandError::MissingCustomActionId(self.source_id))
            }
            _ => Ok(()),
        }
    }

    /// Feed every field into the hasher in a fixed order.
    pub fn hash_into(&self, hasher: &mut LockstepHasher) {
        hasher
            .write(&self.source_id)
            .write(&self.target_id)
            .write(&self.target_position)
            .write(&self.scalar_param)
            .write(&self.kind.tag())
            .write(&self.custom_action_id)
            .write(&self.origin_position);
    }
}

/// Collapse a peer's commands so each source keeps only its last intent.
///
/// The surviving command stays at the position it was submitted at, so the
/// result is the submission order with superseded entries removed.
pub fn coalesce_last_wins(commands: Vec<Command>) -> Vec<Command> {
    let mut kept: Vec<Command> = Vec::with_capacity(commands.len());
    for command in commands {
        kept.retain(|existing| existing.source_id != command.source_id);
        kept.push(command);
    }
    kept
}

// =============================================================================
// COMMAND BATCH
// =============================================================================

/// All commands for one turn, in the order every peer applies them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBatch {
    /// Turn this batch belongs to
    pub turn_number: TurnNumber,
    /// Commands ordered by ascending peer id, then submission order
    pub commands: Vec<Command>,
    /// How many peers' submissions (including empty ones) were merged
    pub originating_peer_count: u32,
}

impl CommandBatch {
    /// Create a batch.
    pub fn new(turn_number: TurnNumber, commands: Vec<Command>, originating_peer_count: u32) -> Self {
        Self {
            turn_number,
            commands,
            originating_peer_count,
        }
    }

    /// A batch with no commands.
    pub fn empty(turn_number: TurnNumber, originating_peer_count: u32) -> Self {
        Self::new(turn_number, Vec::new(), originating_peer_count)
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the turn carried no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// SHA-256 digest over the batch contents.
    pub fn digest(&self) -> BatchDigest {
        let mut hasher = LockstepHasher::for_batch();
        hasher
            .write(&self.turn_number)
            .write(&self.originating_peer_count)
            .write(&(self.commands.len() as u32));
        for command in &self.commands {
            command.hash_into(&mut hasher);
        }
        hasher.finalize()
    }

    /// Serialize to compact binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixed::from_int;

    #[test]
    fn test_constructors_validate() {
        let commands = [
            Command::move_to(EntityId(1), FixedVec2::from_ints(5, 5)),
            Command::attack(EntityId(2), EntityId(1)),
            Command::collect(EntityId(3), EntityId(40)),
            Command::build(EntityId(3), EntityId(41)),
            Command::heal(EntityId(4), EntityId(2)),
            Command::convert(EntityId(5), EntityId(9)),
            Command::custom(EntityId(6), 12, None),
            Command::health_delta(EntityId(7), from_int(-10)),
            Command::destroy(EntityId(8)),
        ];

        for command in &commands {
            assert_eq!(command.validate(), Ok(()), "{:?}", command.kind);
        }
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut mv = Command::move_to(EntityId(1), FixedVec2::ZERO);
        mv.target_position = None;
        assert!(matches!(
            mv.validate(),
            Err(CommandError::MissingTargetPosition { .. })
        ));

        let mut attack = Command::attack(EntityId(2), EntityId(1));
        attack.target_id = None;
        assert!(matches!(attack.validate(), Err(CommandError::MissingTarget { .. })));

        let mut custom = Command::custom(EntityId(3), 1, None);
        custom.custom_action_id = None;
        assert_eq!(
            custom.validate(),
            Err(CommandError::MissingCustomActionId(EntityId(3)))
        );
    }

    #[test]
    fn test_coalesce_last_wins() {
        let commands = vec![
            Command::move_to(EntityId(1), FixedVec2::from_ints(1, 1)),
            Command::attack(EntityId(2), EntityId(9)),
            Command::move_to(EntityId(1), FixedVec2::from_ints(2, 2)),
        ];

        let kept = coalesce_last_wins(commands);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].source_id, EntityId(2));
        assert_eq!(kept[1].target_position, Some(FixedVec2::from_ints(2, 2)));
    }

    #[test]
    fn test_digest_deterministic() {
        let batch = CommandBatch::new(
            7,
            vec![
                Command::move_to(EntityId(1), FixedVec2::from_ints(5, 5)),
                Command::attack(EntityId(2), EntityId(1)),
            ],
            3,
        );

        assert_eq!(batch.digest(), batch.clone().digest());
    }

    #[test]
    fn test_digest_sensitive_to_order_and_turn() {
        let a = Command::move_to(EntityId(1), FixedVec2::from_ints(5, 5));
        let b = Command::attack(EntityId(2), EntityId(1));

        let ab = CommandBatch::new(1, vec![a.clone(), b.clone()], 2);
        let ba = CommandBatch::new(1, vec![b, a], 2);
        let later = CommandBatch::new(2, ab.commands.clone(), 2);

        assert_ne!(ab.digest(), ba.digest());
        assert_ne!(ab.digest(), later.digest());
    }

    #[test]
    fn test_batch_bytes_roundtrip() {
        let batch = CommandBatch::new(
            3,
            vec![Command::custom(EntityId(4), 99, Some(EntityId(5)))
                .with_origin(FixedVec2::from_ints(1, 2))],
            1,
        );

        let bytes = batch.to_bytes().unwrap();
        let decoded = CommandBatch::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, batch);
        assert_eq!(decoded.digest(), batch.digest());
    }

    #[test]
    fn test_empty_batch() {
        let batch = CommandBatch::empty(4, 3);
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.originating_peer_count, 3);
    }
}
