//! Every peer must apply byte-identical batches in the same order, whatever
//! the network does.

mod common;

use std::time::Duration;

use common::{context, started_network, RecordingWorld, STEP};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rts_lockstep::lockstep::calibrator::{CalibrationConfig, LatencyCalibrator};
use rts_lockstep::lockstep::command::coalesce_last_wins;
use rts_lockstep::lockstep::scheduler::TurnScheduler;
use rts_lockstep::lockstep::session::SessionConfig;
use rts_lockstep::{Command, CommandBatch, EntityId, FixedVec2, LoopbackNetwork, PeerId};

fn order_for(peer: u32, round: u32) -> Command {
    let unit = EntityId((peer * 3 + round) % 16);
    match round % 5 {
        0 => Command::move_to(unit, FixedVec2::from_ints(round as i32, peer as i32)),
        1 => Command::attack(unit, EntityId((round + 1) % 16)),
        2 => Command::collect(unit, EntityId(15)),
        3 => Command::heal(unit, EntityId(peer)),
        _ => Command::custom(unit, round as i32, None),
    }
}

/// Drive the network to `turns`, issuing an order on every peer every
/// `every` steps.
fn drive(net: &mut LoopbackNetwork<RecordingWorld>, ids: &[u32], turns: u64, every: u32) {
    let mut round = 0u32;
    while !net.run_until_turn(turns, STEP, STEP) {
        if round % every == 0 {
            for &id in ids {
                net.submit(PeerId(id), order_for(id, round / every)).unwrap();
            }
        }
        round += 1;
        assert!(net.now() < Duration::from_secs(120), "session stalled");
    }
}

/// Shorter call logs must be a prefix of longer ones: peers that are ahead
/// only applied more turns.
fn assert_same_history(net: &LoopbackNetwork<RecordingWorld>, ids: &[u32], turns: usize) {
    let reference = net.reports(PeerId(ids[0]));
    let reference_calls = &net.world(PeerId(ids[0])).unwrap().calls;
    assert!(reference.len() >= turns);

    for (i, report) in reference.iter().enumerate() {
        assert_eq!(report.turn_number, i as u64 + 1, "turns must be consecutive");
    }

    for &id in &ids[1..] {
        let reports = net.reports(PeerId(id));
        assert_eq!(reports[..turns], reference[..turns]);

        let calls = &net.world(PeerId(id)).unwrap().calls;
        let shared = calls.len().min(reference_calls.len());
        assert_eq!(calls[..shared], reference_calls[..shared]);
    }
}

#[test]
fn three_peers_with_uneven_latency_stay_identical() {
    let ids = [1, 2, 3];
    let mut net = started_network(&ids, &[5, 35, 90]);
    drive(&mut net, &ids, 25, 12);

    assert_same_history(&net, &ids, 25);
    assert!(!net.world(PeerId(1)).unwrap().calls.is_empty());
    for id in ids {
        assert!(net.peer_error(PeerId(id)).is_none());
    }
}

#[test]
fn random_latencies_stay_identical_and_calibrate_within_bounds() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let ids = [1, 2, 3, 4];
    let latencies: Vec<u64> = ids.iter().map(|_| rng.gen_range(5..120)).collect();

    let mut net = started_network(&ids, &latencies);
    drive(&mut net, &ids, 15, 7);
    assert_same_history(&net, &ids, 15);

    let config = CalibrationConfig::default();
    let calibrator = net.authority().calibrator();
    assert!(calibrator.adjustments() >= 1);
    assert!(config
        .ack_timeout_bounds
        .contains(calibrator.stats().current_ack_timeout));
    assert!(config
        .turn_duration_bounds
        .contains(calibrator.stats().current_turn_duration));
}

#[test]
fn calibration_converges_then_stays_put() {
    let mut rng = StdRng::seed_from_u64(42);
    let config = CalibrationConfig::default();
    let mut calibrator = LatencyCalibrator::new(config.clone());

    let mut adjustment = None;
    for _ in 0..config.samples_per_adjustment {
        let sample = Duration::from_millis(rng.gen_range(50..1500));
        adjustment = calibrator.record_round_trip(sample);
    }
    let adjustment = adjustment.expect("cycle completes after the configured samples");
    assert!(config.ack_timeout_bounds.contains(adjustment.ack_timeout));
    assert!(config.turn_duration_bounds.contains(adjustment.turn_duration));

    let settled = calibrator.stats().clone();
    for _ in 0..50 {
        let sample = Duration::from_millis(rng.gen_range(50..1500));
        assert!(calibrator.record_round_trip(sample).is_none());
    }
    assert_eq!(calibrator.stats(), &settled);
}

fn arb_command() -> impl Strategy<Value = Command> {
    (0u32..8, 0u8..4, -50i32..50, -50i32..50, 0u32..8).prop_map(|(source, kind, x, y, target)| {
        let source = EntityId(source);
        match kind {
            0 => Command::move_to(source, FixedVec2::from_ints(x, y)),
            1 => Command::attack(source, EntityId(target)),
            2 => Command::heal(source, EntityId(target)),
            _ => Command::destroy(source),
        }
    })
}

fn assemble(submissions: &[Vec<Command>], arrival: &[usize]) -> CommandBatch {
    let ctx = context(&[1, 2, 3], SessionConfig::default());
    let stats = LatencyCalibrator::new(CalibrationConfig::default()).stats().clone();
    let mut scheduler = TurnScheduler::new(&ctx);
    scheduler.advance(stats.current_turn_duration + Duration::from_millis(1), &stats);
    for &i in arrival {
        scheduler.submit(PeerId(i as u32 + 1), 1, submissions[i].clone());
    }
    let closed = scheduler.try_close_turn().expect("every peer submitted");
    (*closed.batch).clone()
}

proptest! {
    #[test]
    fn batch_does_not_depend_on_arrival_order(
        submissions in prop::collection::vec(prop::collection::vec(arb_command(), 0..6), 3),
        arrival in Just(vec![0usize, 1, 2]).prop_shuffle(),
    ) {
        let canonical = assemble(&submissions, &[0, 1, 2]);
        let shuffled = assemble(&submissions, &arrival);
        prop_assert_eq!(canonical.digest(), shuffled.digest());
        prop_assert_eq!(canonical.commands, shuffled.commands);
    }

    #[test]
    fn coalescing_keeps_last_intent_per_source(commands in prop::collection::vec(arb_command(), 0..24)) {
        let kept = coalesce_last_wins(commands.clone());

        for (i, command) in kept.iter().enumerate() {
            prop_assert!(kept[i + 1..].iter().all(|other| other.source_id != command.source_id));
            let last = commands.iter().rev().find(|c| c.source_id == command.source_id);
            prop_assert_eq!(Some(command), last);
        }
        for command in &commands {
            prop_assert!(kept.iter().any(|k| k.source_id == command.source_id));
        }
    }

    #[test]
    fn digest_survives_bincode_transport(commands in prop::collection::vec(arb_command(), 0..12), turn in 1u64..10_000) {
        let batch = CommandBatch::new(turn, commands, 3);
        let decoded = CommandBatch::from_bytes(&batch.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(decoded.digest(), batch.digest());
    }
}
