//! Operator trigger rules: rejections, stop, and reset.

mod common;

use common::{request, rig_with_raw_motor, sim_rig, wait_for, wait_for_idle_after_stop};
use lickport_rig::error::TransitionError;
use lickport_rig::hardware::sim::SimOptions;
use lickport_rig::hardware::LickPort;
use lickport_rig::{Phase, RigError, RigNotification};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn reset_while_running_must_stop_first() {
    let mut sim = sim_rig(SimOptions::default());
    sim.rig
        .generate_schedule(request(&["a", "b"], 1, 1000, 1000, 100))
        .await
        .unwrap();
    sim.rig.start().await.unwrap();

    let err = sim.rig.reset().await.unwrap_err();
    assert!(matches!(
        err,
        RigError::Transition(TransitionError::MustStopBeforeReset)
    ));
    assert_eq!(err.to_string(), "Transition rejected: must stop before reset");
    assert!(!err.is_fatal());

    let snapshot = sim.rig.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Iti);
    assert!(snapshot.schedule.is_some());
}

#[tokio::test(start_paused = true)]
async fn start_and_generate_rejected_while_running() {
    let mut sim = sim_rig(SimOptions::default());
    sim.rig
        .generate_schedule(request(&["a", "b"], 1, 1000, 1000, 100))
        .await
        .unwrap();
    sim.rig.start().await.unwrap();

    assert!(matches!(
        sim.rig.start().await.unwrap_err(),
        RigError::Transition(TransitionError::NotAllowed { phase: Phase::Iti, .. })
    ));
    assert!(matches!(
        sim.rig
            .generate_schedule(request(&["a", "b"], 1, 1, 1, 1))
            .await
            .unwrap_err(),
        RigError::Transition(TransitionError::NotAllowed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_timer_and_returns_to_idle() {
    let mut sim = sim_rig(SimOptions::default());
    sim.rig
        .generate_schedule(request(&["a", "b"], 2, 100, 5000, 100))
        .await
        .unwrap();
    sim.rig.start().await.unwrap();
    wait_for(&mut sim.notifications, Phase::Ttc).await;

    assert_eq!(sim.rig.stop().await.unwrap(), Phase::Stopping);
    wait_for_idle_after_stop(&mut sim.notifications).await;

    // Well past the TTC deadline: nothing fires into the stopped run.
    tokio::time::sleep(Duration::from_millis(6000)).await;
    let snapshot = sim.rig.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Idle);
    assert_eq!(snapshot.trials[0].ttc_actual_ms, None);
    assert!(sim.notifications.try_recv().is_err());

    // Licks after the run are ignored.
    sim.licks.lick(LickPort::A);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sim.rig.snapshot().await.unwrap().event_log.len(), snapshot.event_log.len());
}

#[tokio::test(start_paused = true)]
async fn stopped_run_needs_reset_before_restart() {
    let mut sim = sim_rig(SimOptions::default());
    sim.rig
        .generate_schedule(request(&["a", "b"], 1, 100, 5000, 100))
        .await
        .unwrap();
    sim.rig.start().await.unwrap();
    sim.rig.stop().await.unwrap();
    wait_for_idle_after_stop(&mut sim.notifications).await;

    assert!(matches!(
        sim.rig.start().await.unwrap_err(),
        RigError::Transition(TransitionError::RunRecorded)
    ));
    assert!(matches!(
        sim.rig.stop().await.unwrap_err(),
        RigError::Transition(TransitionError::NotAllowed { phase: Phase::Idle, .. })
    ));

    sim.rig.reset().await.unwrap();
    sim.rig
        .generate_schedule(request(&["a", "b"], 1, 100, 5000, 100))
        .await
        .unwrap();
    assert_eq!(sim.rig.start().await.unwrap(), Phase::Iti);
}

#[tokio::test(start_paused = true)]
async fn second_reset_is_a_noop() {
    let mut sim = sim_rig(SimOptions::default());
    sim.rig
        .generate_schedule(request(&["a", "b", "c", "d"], 1, 50, 100, 50))
        .await
        .unwrap();
    sim.rig.start().await.unwrap();
    wait_for_idle_after_stop(&mut sim.notifications).await;

    sim.rig.reset().await.unwrap();
    let first = sim.rig.snapshot().await.unwrap();
    assert!(first.schedule.is_none());
    assert!(first.trials.is_empty());
    assert!(first.event_log.is_empty());
    while sim.notifications.try_recv().is_ok() {}

    sim.rig.reset().await.unwrap();
    let second = sim.rig.snapshot().await.unwrap();
    assert_eq!(first.trials, second.trials);
    assert_eq!(first.event_log, second.event_log);
    assert_eq!(first.timestamps, second.timestamps);
    assert_eq!(second.current_trial_number, 0);
    assert!(sim.notifications.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn lost_motor_link_stops_the_run() {
    let (mut sim, motor_board) = rig_with_raw_motor();
    sim.rig
        .generate_schedule(request(&["a", "b"], 1, 1000, 1000, 100))
        .await
        .unwrap();
    sim.rig.start().await.unwrap();

    drop(motor_board);
    let mut fault = None;
    loop {
        match sim.notifications.recv().await.unwrap() {
            RigNotification::Fault { reason } => fault = Some(reason),
            RigNotification::PhaseChanged { to: Phase::Stopping, .. } => break,
            _ => {}
        }
    }
    assert!(fault.unwrap().contains("motor link disconnected"));
    wait_for_idle_after_stop(&mut sim.notifications).await;
}
