//! Shared harness: a full rig over simulated boards on in-memory links.
#![allow(dead_code)]

use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tokio::time::Instant;

use lickport_rig::config::TimingConfig;
use lickport_rig::hardware::sim::{LickInjector, SimOptions, SimulatedBoards};
use lickport_rig::hardware::{DynSerial, LinkPair};
use lickport_rig::ingest::EventQueue;
use lickport_rig::schedule::{IntervalSpec, ScheduleRequest};
use lickport_rig::{Phase, RigHandle, RigNotification, TrialStateMachine};

pub const DOOR_TRAVEL_MS: u64 = 100;
pub const STOP_GRACE_MS: u64 = 50;
pub const VERIFY_TIMEOUT_MS: u64 = 200;

pub fn timing() -> TimingConfig {
    TimingConfig {
        door_travel_ms: DOOR_TRAVEL_MS,
        stop_grace_ms: STOP_GRACE_MS,
        drain_period_ms: 10,
        verify_timeout_ms: VERIFY_TIMEOUT_MS,
        engagement_threshold: 3,
    }
}

pub struct SimRig {
    pub rig: RigHandle,
    pub licks: LickInjector,
    pub notifications: broadcast::Receiver<RigNotification>,
}

fn machine(motor: DynSerial, laser: DynSerial, timing: TimingConfig) -> RigHandle {
    let (sender, queue) = EventQueue::new();
    let links = LinkPair::from_streams(motor, laser, sender);
    let (rig, _task) = TrialStateMachine::new(timing, links, queue)
        .with_seed(42)
        .spawn();
    rig
}

/// Rig with both boards simulated.
pub fn sim_rig(options: SimOptions) -> SimRig {
    sim_rig_with_timing(options, timing())
}

/// Rig with both boards simulated and custom machine timing.
pub fn sim_rig_with_timing(options: SimOptions, timing: TimingConfig) -> SimRig {
    let boards = SimulatedBoards::spawn(SimOptions {
        door_travel: Duration::from_millis(50),
        ..options
    });
    let rig = machine(boards.motor, boards.laser, timing);
    let notifications = rig.subscribe();
    SimRig {
        rig,
        licks: boards.licks,
        notifications,
    }
}

/// Rig whose motor board is a bare stream held by the test.
pub fn rig_with_raw_motor() -> (SimRig, DuplexStream) {
    let boards = SimulatedBoards::spawn(SimOptions::default());
    let (motor_board, motor_host) = tokio::io::duplex(1024);
    let rig = machine(Box::new(motor_host), boards.laser, timing());
    let notifications = rig.subscribe();
    (
        SimRig {
            rig,
            licks: boards.licks,
            notifications,
        },
        motor_board,
    )
}

/// Rig whose laser board is a bare stream held by the test.
pub fn rig_with_raw_laser() -> (SimRig, DuplexStream) {
    let boards = SimulatedBoards::spawn(SimOptions::default());
    let (laser_board, laser_host) = tokio::io::duplex(1024);
    let rig = machine(boards.motor, Box::new(laser_host), timing());
    let notifications = rig.subscribe();
    (
        SimRig {
            rig,
            licks: boards.licks,
            notifications,
        },
        laser_board,
    )
}

/// Request with `custom` labels in the first slots and fixed intervals.
pub fn request(custom: &[&str], block_count: u32, iti: u64, ttc: u64, sample: u64) -> ScheduleRequest {
    let defaults: Vec<String> = (1..=8).map(|i| format!("Valve {i}")).collect();
    let mut labels = defaults.clone();
    for (slot, label) in custom.iter().enumerate() {
        labels[slot] = label.to_string();
    }
    ScheduleRequest {
        labels,
        default_labels: defaults,
        block_count,
        iti: IntervalSpec::fixed(iti),
        ttc: IntervalSpec::fixed(ttc),
        sample: IntervalSpec::fixed(sample),
    }
}

/// Next phase change, skipping other notifications.
pub async fn next_change(rx: &mut broadcast::Receiver<RigNotification>) -> (Phase, Phase, Instant) {
    loop {
        let note = tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("timed out waiting for a phase change")
            .expect("notification stream closed");
        if let RigNotification::PhaseChanged { from, to, .. } = note {
            return (from, to, Instant::now());
        }
    }
}

/// Wait until the machine enters `phase`.
pub async fn wait_for(rx: &mut broadcast::Receiver<RigNotification>, phase: Phase) -> Instant {
    loop {
        let (_, to, at) = next_change(rx).await;
        if to == phase {
            return at;
        }
    }
}

/// Wait until a run has gone back to idle.
pub async fn wait_for_idle_after_stop(rx: &mut broadcast::Receiver<RigNotification>) {
    loop {
        let (from, to, _) = next_change(rx).await;
        if from == Phase::Stopping && to == Phase::Idle {
            return;
        }
    }
}
