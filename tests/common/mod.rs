//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use rts_lockstep::lockstep::command::{Command, EntityId, PeerId};
use rts_lockstep::lockstep::session::{SessionConfig, SessionContext};
use rts_lockstep::{EntityWorld, Fixed, FixedVec2, LoopbackNetwork};

/// One call the applier made on a world.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Move(u32, FixedVec2),
    Attack(u32, u32),
    Build(u32, u32),
    Collect(u32, u32),
    Heal(u32, u32),
    Convert(u32, u32),
    HealthDelta(u32, Fixed),
    Destroy(u32),
    Custom(u32, Option<u32>, i32),
    Snap(u32, FixedVec2),
}

/// World that records every call and tracks which entities exist.
#[derive(Clone, Debug, Default)]
pub struct RecordingWorld {
    pub calls: Vec<Call>,
    pub positions: BTreeMap<u32, FixedVec2>,
}

impl RecordingWorld {
    /// World with entities `0..count` at the origin.
    pub fn with_entities(count: u32) -> Self {
        Self {
            calls: Vec::new(),
            positions: (0..count).map(|id| (id, FixedVec2::ZERO)).collect(),
        }
    }
}

impl EntityWorld for RecordingWorld {
    type Handle = u32;

    fn resolve(&self, id: EntityId) -> Option<u32> {
        self.positions.contains_key(&id.0).then_some(id.0)
    }

    fn move_to(&mut self, entity: u32, destination: FixedVec2, _stopping_distance: Fixed) {
        self.calls.push(Call::Move(entity, destination));
    }

    fn apply_attack(&mut self, attacker: u32, target: u32) {
        self.calls.push(Call::Attack(attacker, target));
    }

    fn begin_construction(&mut self, builder: u32, building: u32) {
        self.calls.push(Call::Build(builder, building));
    }

    fn begin_collection(&mut self, collector: u32, resource: u32) {
        self.calls.push(Call::Collect(collector, resource));
    }

    fn heal(&mut self, healer: u32, target: u32) {
        self.calls.push(Call::Heal(healer, target));
    }

    fn convert(&mut self, converter: u32, target: u32) {
        self.calls.push(Call::Convert(converter, target));
    }

    fn apply_health_delta(&mut self, entity: u32, amount: Fixed) {
        self.calls.push(Call::HealthDelta(entity, amount));
    }

    fn destroy(&mut self, entity: u32) {
        self.positions.remove(&entity);
        self.calls.push(Call::Destroy(entity));
    }

    fn dispatch_custom_action(
        &mut self,
        source: u32,
        target: Option<u32>,
        action_id: i32,
        _command: &Command,
    ) {
        self.calls.push(Call::Custom(source, target, action_id));
    }

    fn position(&self, entity: u32) -> Option<FixedVec2> {
        self.positions.get(&entity).copied()
    }

    fn snap_to(&mut self, entity: u32, position: FixedVec2) {
        self.positions.insert(entity, position);
        self.calls.push(Call::Snap(entity, position));
    }
}

pub const STEP: Duration = Duration::from_millis(10);

pub fn peers(ids: &[u32]) -> Vec<PeerId> {
    ids.iter().map(|&id| PeerId(id)).collect()
}

pub fn context(ids: &[u32], config: SessionConfig) -> SessionContext {
    SessionContext::new(peers(ids), config).expect("valid session")
}

/// Loopback session with one recording world per peer, joined and started.
pub fn started_network(ids: &[u32], latencies_ms: &[u64]) -> LoopbackNetwork<RecordingWorld> {
    let mut net = LoopbackNetwork::new(
        context(ids, SessionConfig::default()),
        peers(ids)
            .into_iter()
            .map(|peer| (peer, RecordingWorld::with_entities(16))),
    );
    for (&id, &latency) in ids.iter().zip(latencies_ms) {
        net.set_latency(PeerId(id), Duration::from_millis(latency));
    }
    net.join_all();
    let all_started = net.run_until(STEP, Duration::from_secs(5), |n| {
        ids.iter()
            .all(|&id| n.peer(PeerId(id)).is_some_and(|role| role.session().is_some()))
    });
    assert!(all_started, "session did not start");
    net
}
