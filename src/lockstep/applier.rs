//! Command Applier
//!
//! Replays released batches against the local simulation, strictly in turn
//! order and strictly in batch order within a turn. The simulation itself is
//! reached through the [`EntityWorld`] trait; the applier only resolves ids
//! and dispatches.
//!
//! A batch that does not follow the last applied turn means this peer has
//! diverged from the session. That is fatal: the applier halts and refuses
//! everything afterwards.

use tracing::{error, warn};

use crate::core::fixed::Fixed;
use crate::core::vec2::FixedVec2;
use super::command::{Command, CommandBatch, CommandKind, EntityId, TurnNumber};
use super::session::SessionContext;

// =============================================================================
// ENTITY WORLD
// =============================================================================

/// The simulation as seen by the applier.
///
/// Every method must be deterministic: the same calls in the same order must
/// leave every peer's world in the same state.
pub trait EntityWorld {
    /// Resolved reference to a live entity.
    type Handle: Copy;

    /// Look up a live entity by network id.
    fn resolve(&self, id: EntityId) -> Option<Self::Handle>;

    /// Start moving towards `destination`, stopping within `stopping_distance`.
    fn move_to(&mut self, entity: Self::Handle, destination: FixedVec2, stopping_distance: Fixed);

    /// Start attacking `target`.
    fn apply_attack(&mut self, attacker: Self::Handle, target: Self::Handle);

    /// Start constructing `building`.
    fn begin_construction(&mut self, builder: Self::Handle, building: Self::Handle);

    /// Start gathering from `resource`.
    fn begin_collection(&mut self, collector: Self::Handle, resource: Self::Handle);

    /// Start healing `target`.
    fn heal(&mut self, healer: Self::Handle, target: Self::Handle);

    /// Start converting `target`.
    fn convert(&mut self, converter: Self::Handle, target: Self::Handle);

    /// Add `amount` health (negative for damage).
    fn apply_health_delta(&mut self, entity: Self::Handle, amount: Fixed);

    /// Remove the entity.
    fn destroy(&mut self, entity: Self::Handle);

    /// Run a game-defined action.
    fn dispatch_custom_action(
        &mut self,
        source: Self::Handle,
        target: Option<Self::Handle>,
        action_id: i32,
        command: &Command,
    );

    /// Current position, if the world tracks one for this entity.
    fn position(&self, _entity: Self::Handle) -> Option<FixedVec2> {
        None
    }

    /// Teleport the entity. Only used for origin snapping.
    fn snap_to(&mut self, _entity: Self::Handle, _position: FixedVec2) {}
}

// =============================================================================
// ERRORS AND REPORTS
// =============================================================================

/// Fatal application failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// Batch is not the next turn; this peer has desynchronized
    #[error("desync: expected turn {expected}, received turn {received}")]
    SequenceViolation {
        /// Turn that should have come next
        expected: TurnNumber,
        /// Turn that arrived
        received: TurnNumber,
    },

    /// A previous desync stopped this applier
    #[error("applier halted after desync; last applied turn {last_applied}")]
    Halted {
        /// Last turn applied before the halt
        last_applied: TurnNumber,
    },
}

/// Why a command was left out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The id no longer resolves to a live entity
    NotFound(EntityId),
    /// The command lacks a field its kind needs
    Malformed,
}

/// A command left out of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkippedCommand {
    /// Position in the batch
    pub index: usize,
    /// Command kind
    pub kind: CommandKind,
    /// Why it was skipped
    pub reason: SkipReason,
}

/// Outcome of applying one batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Turn applied
    pub turn_number: TurnNumber,
    /// Commands dispatched to the world
    pub applied: usize,
    /// Commands skipped
    pub skipped: Vec<SkippedCommand>,
    /// Entities snapped back to their command origin
    pub snapped: usize,
}

// =============================================================================
// APPLIER
// =============================================================================

/// Sequential batch replayer for one peer.
#[derive(Clone, Debug)]
pub struct CommandApplier {
    last_applied: TurnNumber,
    halted: bool,
    snap_distance: Option<Fixed>,
}

impl CommandApplier {
    /// Create an applier that expects turn 1 next.
    pub fn new(context: &SessionContext) -> Self {
        Self::with_snap_distance(context.snap_distance())
    }

    /// Create an applier with an explicit snap distance.
    pub fn with_snap_distance(snap_distance: Option<Fixed>) -> Self {
        Self {
            last_applied: 0,
            halted: false,
            snap_distance,
        }
    }

    /// Last turn applied (0 before the first).
    pub fn last_applied(&self) -> TurnNumber {
        self.last_applied
    }

    /// Whether a desync stopped this applier.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Apply `batch` to `world`.
    pub fn apply<W: EntityWorld>(
        &mut self,
        batch: &CommandBatch,
        world: &mut W,
    ) -> Result<ApplyReport, ApplyError> {
        if self.halted {
            return Err(ApplyError::Halted {
                last_applied: self.last_applied,
            });
        }

        let expected = self.last_applied + 1;
        if batch.turn_number != expected {
            self.halted = true;
            error!(
                expected,
                received = batch.turn_number,
                "Batch out of sequence, halting simulation"
            );
            return Err(ApplyError::SequenceViolation {
                expected,
                received: batch.turn_number,
            });
        }

        let mut report = ApplyReport {
            turn_number: batch.turn_number,
            ..ApplyReport::default()
        };

        for (index, command) in batch.commands.iter().enumerate() {
            match self.apply_command(command, world) {
                Ok(snapped) => {
                    report.applied += 1;
                    if snapped {
                        report.snapped += 1;
                    }
                }
                Err(reason) => {
                    match reason {
                        SkipReason::NotFound(missing) => warn!(
                            turn = batch.turn_number,
                            index,
                            kind = ?command.kind,
                            %missing,
                            "Entity not found, skipping command"
                        ),
                        SkipReason::Malformed => warn!(
                            turn = batch.turn_number,
                            index,
                            kind = ?command.kind,
                            source = %command.source_id,
                            "Malformed command, skipping"
                        ),
                    }
                    report.skipped.push(SkippedCommand {
                        index,
                        kind: command.kind,
                        reason,
                    });
                }
            }
        }

        self.last_applied = batch.turn_number;
        Ok(report)
    }

    /// Dispatch one command. `Ok` tells whether the source was snapped.
    fn apply_command<W: EntityWorld>(
        &self,
        command: &Command,
        world: &mut W,
    ) -> Result<bool, SkipReason> {
        let source = world
            .resolve(command.source_id)
            .ok_or(SkipReason::NotFound(command.source_id))?;
        let target = match command.target_id {
            Some(id) => Some(world.resolve(id).ok_or(SkipReason::NotFound(id))?),
            None => None,
        };
        // Targeted kinds are validated on submit; a missing target here means
        // the batch was built by hand.
        let required_target = || target.ok_or(SkipReason::Malformed);

        #[cfg(feature = "debug-tracing")]
        tracing::trace!(kind = ?command.kind, source = %command.source_id, "Applying command");

        let mut snapped = false;
        match command.kind {
            CommandKind::Move => {
                let destination = command.target_position.ok_or(SkipReason::Malformed)?;
                snapped = self.snap_to_origin(command, source, world);
                world.move_to(source, destination, command.scalar_param);
            }
            CommandKind::Attack => world.apply_attack(source, required_target()?),
            CommandKind::Collect => world.begin_collection(source, required_target()?),
            CommandKind::Build => world.begin_construction(source, required_target()?),
            CommandKind::Heal => world.heal(source, required_target()?),
            CommandKind::Convert => world.convert(source, required_target()?),
            CommandKind::CustomAction => {
                let action_id = command.custom_action_id.ok_or(SkipReason::Malformed)?;
                world.dispatch_custom_action(source, target, action_id, command);
            }
            CommandKind::HealthDelta => {
                world.apply_health_delta(target.unwrap_or(source), command.scalar_param)
            }
            CommandKind::Destroy => world.destroy(target.unwrap_or(source)),
        }

        Ok(snapped)
    }

    /// Put a drifted mover back where its command was issued.
    fn snap_to_origin<W: EntityWorld>(&self, command: &Command, source: W::Handle, world: &mut W) -> bool {
        let (Some(limit), Some(origin)) = (self.snap_distance, command.origin_position) else {
            return false;
        };
        match world.position(source) {
            Some(current) if current.exceeds_distance(origin, limit) => {
                world.snap_to(source, origin);
                true
            }
            _ => false,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::core::fixed::from_int;

    #[derive(Default)]
    struct LogWorld {
        positions: BTreeMap<u32, FixedVec2>,
        log: Vec<String>,
    }

    impl LogWorld {
        fn with_entities(ids: &[u32]) -> Self {
            let mut world = Self::default();
            for &id in ids {
                world.positions.insert(id, FixedVec2::ZERO);
            }
            world
        }
    }

    impl EntityWorld for LogWorld {
        type Handle = u32;

        fn resolve(&self, id: EntityId) -> Option<u32> {
            self.positions.contains_key(&id.0).then_some(id.0)
        }
        fn move_to(&mut self, entity: u32, destination: FixedVec2, _stop: Fixed) {
            self.log.push(format!("move {entity} {destination}"));
        }
        fn apply_attack(&mut self, attacker: u32, target: u32) {
            self.log.push(format!("attack {attacker} {target}"));
        }
        fn begin_construction(&mut self, builder: u32, building: u32) {
            self.log.push(format!("build {builder} {building}"));
        }
        fn begin_collection(&mut self, collector: u32, resource: u32) {
            self.log.push(format!("collect {collector} {resource}"));
        }
        fn heal(&mut self, healer: u32, target: u32) {
            self.log.push(format!("heal {healer} {target}"));
        }
        fn convert(&mut self, converter: u32, target: u32) {
            self.log.push(format!("convert {converter} {target}"));
        }
        fn apply_health_delta(&mut self, entity: u32, amount: Fixed) {
            self.log.push(format!("health {entity} {amount}"));
        }
        fn destroy(&mut self, entity: u32) {
            self.positions.remove(&entity);
            self.log.push(format!("destroy {entity}"));
        }
        fn dispatch_custom_action(&mut self, source: u32, target: Option<u32>, action_id: i32, _c: &Command) {
            self.log.push(format!("custom {source} {target:?} {action_id}"));
        }
        fn position(&self, entity: u32) -> Option<FixedVec2> {
            self.positions.get(&entity).copied()
        }
        fn snap_to(&mut self, entity: u32, position: FixedVec2) {
            self.positions.insert(entity, position);
            self.log.push(format!("snap {entity} {position}"));
        }
    }

    #[test]
    fn test_applies_in_batch_order() {
        let mut world = LogWorld::with_entities(&[1, 2]);
        let mut applier = CommandApplier::with_snap_distance(None);
        let batch = CommandBatch::new(
            1,
            vec![
                Command::move_to(EntityId(1), FixedVec2::from_ints(5, 5)),
                Command::attack(EntityId(2), EntityId(1)),
            ],
            3,
        );

        let report = applier.apply(&batch, &mut world).unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(world.log, vec!["move 1 (5.00, 5.00)", "attack 2 1"]);
        assert_eq!(applier.last_applied(), 1);
    }

    #[test]
    fn test_every_kind_dispatches() {
        let mut world = LogWorld::with_entities(&[1, 2, 3]);
        let mut applier = CommandApplier::with_snap_distance(None);
        let batch = CommandBatch::new(
            1,
            vec![
                Command::collect(EntityId(1), EntityId(3)),
                Command::build(EntityId(1), EntityId(3)),
                Command::heal(EntityId(2), EntityId(1)),
                Command::convert(EntityId(2), EntityId(3)),
                Command::custom(EntityId(1), 7, None),
                Command::health_delta(EntityId(2), from_int(-3)),
                Command::destroy(EntityId(3)),
            ],
            1,
        );

        let report = applier.apply(&batch, &mut world).unwrap();
        assert_eq!(report.applied, 7);
        assert_eq!(world.log.len(), 7);
        assert_eq!(world.log[4], "custom 1 None 7");
        assert_eq!(world.log[6], "destroy 3");
    }

    #[test]
    fn test_missing_entity_skipped() {
        let mut world = LogWorld::with_entities(&[1]);
        let mut applier = CommandApplier::with_snap_distance(None);
        let batch = CommandBatch::new(
            1,
            vec![
                Command::attack(EntityId(1), EntityId(42)),
                Command::destroy(EntityId(99)),
                Command::move_to(EntityId(1), FixedVec2::from_ints(1, 1)),
            ],
            1,
        );

        let report = applier.apply(&batch, &mut world).unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.skipped[0].reason, SkipReason::NotFound(EntityId(42)));
        assert_eq!(report.skipped[1].index, 1);
        assert_eq!(world.log, vec!["move 1 (1.00, 1.00)"]);
    }

    #[test]
    fn test_entity_destroyed_earlier_in_batch() {
        let mut world = LogWorld::with_entities(&[1, 3]);
        let mut applier = CommandApplier::with_snap_distance(None);
        let batch = CommandBatch::new(
            1,
            vec![
                Command::destroy(EntityId(3)),
                Command::attack(EntityId(1), EntityId(3)),
                Command::move_to(EntityId(3), FixedVec2::from_ints(4, 4)),
            ],
            2,
        );

        let report = applier.apply(&batch, &mut world).unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(
            report.skipped,
            vec![
                SkippedCommand {
                    index: 1,
                    kind: CommandKind::Attack,
                    reason: SkipReason::NotFound(EntityId(3)),
                },
                SkippedCommand {
                    index: 2,
                    kind: CommandKind::Move,
                    reason: SkipReason::NotFound(EntityId(3)),
                },
            ]
        );
        assert_eq!(world.log, vec!["destroy 3"]);
        assert_eq!(applier.last_applied(), 1);
    }

    #[test]
    fn test_malformed_command_skipped() {
        let mut world = LogWorld::with_entities(&[1]);
        let mut applier = CommandApplier::with_snap_distance(None);
        let mut no_destination = Command::move_to(EntityId(1), FixedVec2::from_ints(2, 2));
        no_destination.target_position = None;
        let mut no_action = Command::custom(EntityId(1), 4, None);
        no_action.custom_action_id = None;
        let batch = CommandBatch::new(
            1,
            vec![no_destination, no_action, Command::destroy(EntityId(1))],
            1,
        );

        let report = applier.apply(&batch, &mut world).unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped.len(), 2);
        assert!(report
            .skipped
            .iter()
            .all(|skipped| skipped.reason == SkipReason::Malformed));
        assert_eq!(world.log, vec!["destroy 1"]);
    }

    #[test]
    fn test_sequence_violation_halts() {
        let mut world = LogWorld::with_entities(&[1]);
        let mut applier = CommandApplier::with_snap_distance(None);

        applier.apply(&CommandBatch::empty(1, 1), &mut world).unwrap();
        let err = applier.apply(&CommandBatch::empty(3, 1), &mut world).unwrap_err();
        assert_eq!(err, ApplyError::SequenceViolation { expected: 2, received: 3 });
        assert!(applier.is_halted());

        let err = applier.apply(&CommandBatch::empty(2, 1), &mut world).unwrap_err();
        assert_eq!(err, ApplyError::Halted { last_applied: 1 });
    }

    #[test]
    fn test_replayed_turn_is_violation() {
        let mut world = LogWorld::with_entities(&[1]);
        let mut applier = CommandApplier::with_snap_distance(None);
        applier.apply(&CommandBatch::empty(1, 1), &mut world).unwrap();

        assert!(matches!(
            applier.apply(&CommandBatch::empty(1, 1), &mut world),
            Err(ApplyError::SequenceViolation { expected: 2, received: 1 })
        ));
    }

    #[test]
    fn test_snap_when_drifted() {
        let mut world = LogWorld::with_entities(&[1, 2]);
        let mut applier = CommandApplier::with_snap_distance(Some(from_int(5)));
        let batch = CommandBatch::new(
            1,
            vec![
                // Entity 1 sits at the origin; (10, 0) is beyond 5 units
                Command::move_to(EntityId(1), FixedVec2::from_ints(20, 0))
                    .with_origin(FixedVec2::from_ints(10, 0)),
                // Entity 2 within range, left alone
                Command::move_to(EntityId(2), FixedVec2::from_ints(20, 0))
                    .with_origin(FixedVec2::from_ints(3, 0)),
            ],
            1,
        );

        let report = applier.apply(&batch, &mut world).unwrap();

        assert_eq!(report.snapped, 1);
        assert_eq!(world.positions[&1], FixedVec2::from_ints(10, 0));
        assert_eq!(world.positions[&2], FixedVec2::ZERO);
    }

    #[test]
    fn test_only_moves_snap() {
        let mut world = LogWorld::with_entities(&[1, 2]);
        let mut applier = CommandApplier::with_snap_distance(Some(from_int(5)));
        let batch = CommandBatch::new(
            1,
            vec![Command::attack(EntityId(1), EntityId(2)).with_origin(FixedVec2::from_ints(10, 0))],
            1,
        );

        let report = applier.apply(&batch, &mut world).unwrap();

        assert_eq!(report.snapped, 0);
        assert_eq!(world.positions[&1], FixedVec2::ZERO);
        assert_eq!(world.log, vec!["attack 1 2"]);
    }
}
