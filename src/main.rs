//! RTS Lockstep Host
//!
//! `rts-lockstep-host` runs a three-peer demo session on the in-process
//! loopback network and checks that every peer ends in the same state.
//! `rts-lockstep-host serve` hosts a session over WebSocket instead.
//!
//! Set `RTS_LOCKSTEP_CONFIG` to a JSON host config to override defaults and
//! `RUST_LOG` to change the log filter.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rts_lockstep::{
    core::hash::{short_hex, LockstepHasher},
    lockstep::command::Command,
    network::server::{LockstepServer, ServerConfig},
    EntityId, EntityWorld, Fixed, FixedVec2, LoopbackNetwork, PeerId, SessionContext,
    CONFIG_ENV, VERSION,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("RTS Lockstep Host v{}", VERSION);

    let config = match std::env::var(CONFIG_ENV) {
        Ok(path) => ServerConfig::load(&path)
            .with_context(|| format!("loading {} from {}", CONFIG_ENV, path))?,
        Err(_) => ServerConfig::default(),
    };

    match std::env::args().nth(1).as_deref() {
        None | Some("demo") => demo_session(&config),
        Some("serve") => serve(config).await,
        Some(other) => bail!("unknown command {:?} (expected `demo` or `serve`)", other),
    }
}

/// Host one session over WebSocket until every peer leaves or Ctrl-C.
async fn serve(config: ServerConfig) -> Result<()> {
    let server = LockstepServer::bind(config).await?;
    info!(
        session = %server.context().session_id,
        peers = server.context().roster.len(),
        "Waiting for peers on ws://{}",
        server.local_addr()?
    );

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown.send(());
        }
    });

    let stats = server.run().await?;
    info!(
        turns = stats.turns_released,
        stalls = stats.stalls,
        evictions = stats.evictions,
        "Session ended"
    );
    Ok(())
}

/// Demo: three peers with different latencies issuing scripted orders.
fn demo_session(config: &ServerConfig) -> Result<()> {
    info!("=== Starting Demo Session ===");

    let peers = [PeerId(1), PeerId(2), PeerId(3)];
    let context = SessionContext::new(peers, config.session.clone())?;
    info!("Session ID: {}", context.session_id);

    let mut net = LoopbackNetwork::new(
        context,
        peers.iter().map(|&peer| (peer, DemoWorld::with_units(6))),
    );
    net.set_latency(PeerId(1), Duration::from_millis(5));
    net.set_latency(PeerId(2), Duration::from_millis(30));
    net.set_latency(PeerId(3), Duration::from_millis(60));
    net.join_all();

    let step = Duration::from_millis(10);
    if !net.run_until(step, Duration::from_secs(5), |n| n.authority().is_started()) {
        bail!("session did not start");
    }

    const TURNS: u64 = 30;
    let mut next_order_at = Duration::ZERO;
    let mut order = 0u32;
    while !net.run_until_turn(TURNS, step, step) {
        if net.now() >= next_order_at {
            for (i, &peer) in peers.iter().enumerate() {
                let command = scripted_order(order, i as u32);
                if let Err(e) = net.submit(peer, command) {
                    warn!(peer = %peer, "Order dropped: {}", e);
                }
            }
            order += 1;
            next_order_at = net.now() + Duration::from_millis(150);
        }
        if net.now() > Duration::from_secs(60) {
            bail!("session did not reach turn {}", TURNS);
        }
    }

    // Print final results
    info!("=== Session Results ===");
    let stats = net.authority().stats();
    let calibration = net.authority().calibrator().stats();
    info!(
        "Released {} turns, {} stalls, {} messages delivered in {:?} simulated",
        stats.turns_released,
        stats.stalls,
        net.delivered(),
        net.now()
    );
    info!(
        "Calibrated turn {:?}, ack timeout {:?}",
        calibration.current_turn_duration, calibration.current_ack_timeout
    );

    // Verify determinism across peers
    info!("=== Verifying Determinism ===");
    let mut digests = BTreeMap::new();
    for &peer in &peers {
        let world = net.world(peer).context("peer world missing")?;
        let applied = net.peer(peer).map_or(0, |role| role.last_applied_turn());
        let digest = world.state_digest();
        info!("{}: applied {} turns, state {}", peer, applied, short_hex(&digest));
        digests.insert(peer, digest);
    }

    let reference = digests[&peers[0]];
    if digests.values().all(|digest| *digest == reference) {
        info!("DETERMINISM VERIFIED: States match!");
        Ok(())
    } else {
        bail!("DETERMINISM FAILURE: States differ!")
    }
}

/// Order number `n` for the peer at `slot`.
fn scripted_order(n: u32, slot: u32) -> Command {
    let unit = EntityId(slot * 2 + n % 2);
    match n % 4 {
        0 => Command::move_to(unit, FixedVec2::from_ints((n % 20) as i32, slot as i32 * 3)),
        1 => Command::attack(unit, EntityId((slot * 2 + 2) % 6)),
        2 => Command::heal(unit, EntityId((slot * 2 + 3) % 6)),
        _ => Command::move_to(unit, FixedVec2::from_ints(-(n as i32 % 7), n as i32 % 5)),
    }
}

// =============================================================================
// DEMO WORLD
// =============================================================================

#[derive(Clone, Copy, Debug)]
struct DemoUnit {
    position: FixedVec2,
    destination: FixedVec2,
    health: Fixed,
}

/// Minimal world: units with a position, a destination and health.
struct DemoWorld {
    units: BTreeMap<u32, DemoUnit>,
}

impl DemoWorld {
    fn with_units(count: u32) -> Self {
        let units = (0..count)
            .map(|id| {
                let start = FixedVec2::from_ints(id as i32 * 2, 0);
                let unit = DemoUnit {
                    position: start,
                    destination: start,
                    health: rts_lockstep::core::fixed::from_int(100),
                };
                (id, unit)
            })
            .collect();
        Self { units }
    }

    fn state_digest(&self) -> [u8; 32] {
        let mut hasher = LockstepHasher::new(b"RTS_LOCKSTEP_DEMO_WORLD");
        for (&id, unit) in &self.units {
            hasher
                .write(&id)
                .write(&unit.position)
                .write(&unit.destination)
                .write(&unit.health);
        }
        hasher.finalize()
    }

    fn damage(&mut self, target: u32, amount: i32) {
        if let Some(unit) = self.units.get_mut(&target) {
            unit.health = unit.health.saturating_add(rts_lockstep::core::fixed::from_int(amount));
        }
    }
}

impl EntityWorld for DemoWorld {
    type Handle = u32;

    fn resolve(&self, id: EntityId) -> Option<u32> {
        self.units.contains_key(&id.0).then_some(id.0)
    }

    fn move_to(&mut self, entity: u32, destination: FixedVec2, _stopping_distance: Fixed) {
        if let Some(unit) = self.units.get_mut(&entity) {
            unit.destination = destination;
        }
    }

    fn apply_attack(&mut self, _attacker: u32, target: u32) {
        self.damage(target, -10);
    }

    fn begin_construction(&mut self, _builder: u32, _building: u32) {}

    fn begin_collection(&mut self, _collector: u32, _resource: u32) {}

    fn heal(&mut self, _healer: u32, target: u32) {
        self.damage(target, 5);
    }

    fn convert(&mut self, _converter: u32, _target: u32) {}

    fn apply_health_delta(&mut self, entity: u32, amount: Fixed) {
        if let Some(unit) = self.units.get_mut(&entity) {
            unit.health = unit.health.saturating_add(amount);
        }
    }

    fn destroy(&mut self, entity: u32) {
        self.units.remove(&entity);
    }

    fn dispatch_custom_action(&mut self, _: u32, _: Option<u32>, _: i32, _: &Command) {}

    fn position(&self, entity: u32) -> Option<FixedVec2> {
        self.units.get(&entity).map(|unit| unit.position)
    }

    fn snap_to(&mut self, entity: u32, position: FixedVec2) {
        if let Some(unit) = self.units.get_mut(&entity) {
            unit.position = position;
        }
    }
}
