//! Schedule upload and echo verification on START.

mod common;

use common::{
    next_change, request, rig_with_raw_laser, sim_rig, wait_for_idle_after_stop, VERIFY_TIMEOUT_MS,
};
use lickport_rig::error::ProtocolError;
use lickport_rig::hardware::sim::{EchoMode, SimOptions};
use lickport_rig::hardware::{LickPort, LinkId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use lickport_rig::{Phase, RigError, RigNotification};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn faithful_echo_starts_first_trial() {
    let mut sim = sim_rig(SimOptions::default());
    sim.rig
        .generate_schedule(request(&["a", "b", "c", "d"], 2, 100, 1000, 100))
        .await
        .unwrap();

    assert_eq!(sim.rig.start().await.unwrap(), Phase::Iti);
    let snapshot = sim.rig.snapshot().await.unwrap();
    assert!(snapshot.is_running);
    assert_eq!(snapshot.current_trial_number, 1);
    assert_eq!(snapshot.trials[0].port_a_licks, Some(0));
    assert_eq!(snapshot.trials[1].port_a_licks, None);
}

#[tokio::test(start_paused = true)]
async fn corrupted_echo_forces_stopping() {
    let mut sim = sim_rig(SimOptions {
        echo: EchoMode::Corrupt { index: 3 },
        ..SimOptions::default()
    });
    sim.rig
        .generate_schedule(request(&["a", "b", "c", "d"], 2, 100, 1000, 100))
        .await
        .unwrap();

    let err = sim.rig.start().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(
        matches!(
            err,
            RigError::Protocol(ProtocolError::ScheduleMismatch { index: 3, .. })
        ),
        "{err:?}"
    );

    let snapshot = sim.rig.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Stopping);
    assert!(!snapshot.is_running);
    assert!(snapshot.trials.iter().all(|t| t.port_a_licks.is_none()));

    let mut fault_seen = false;
    while let Ok(note) = sim.notifications.try_recv() {
        fault_seen |= matches!(note, RigNotification::Fault { .. });
    }
    assert!(fault_seen);

    wait_for_idle_after_stop(&mut sim.notifications).await;
}

#[tokio::test(start_paused = true)]
async fn silent_board_times_out() {
    let mut sim = sim_rig(SimOptions {
        echo: EchoMode::Silent,
        ..SimOptions::default()
    });
    sim.rig
        .generate_schedule(request(&["a", "b"], 1, 100, 1000, 100))
        .await
        .unwrap();

    let started = Instant::now();
    let err = sim.rig.start().await.unwrap_err();
    assert_eq!(started.elapsed(), Duration::from_millis(VERIFY_TIMEOUT_MS));
    assert!(matches!(
        err,
        RigError::Protocol(ProtocolError::VerifyTimeout {
            link: LinkId::Laser,
            expected: 2,
            ..
        })
    ));

    wait_for_idle_after_stop(&mut sim.notifications).await;
    let snapshot = sim.rig.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn failed_verification_can_be_retried_after_idle() {
    let mut sim = sim_rig(SimOptions {
        echo: EchoMode::Silent,
        ..SimOptions::default()
    });
    sim.rig
        .generate_schedule(request(&["a", "b"], 1, 100, 1000, 100))
        .await
        .unwrap();
    assert!(sim.rig.start().await.is_err());
    wait_for_idle_after_stop(&mut sim.notifications).await;

    // No trial began, so START is not treated as a finished run.
    let err = sim.rig.start().await.unwrap_err();
    assert!(matches!(err, RigError::Protocol(_)), "{err:?}");
    let (from, to, _) = next_change(&mut sim.notifications).await;
    assert_eq!((from, to), (Phase::Idle, Phase::Iti));
}

#[tokio::test(start_paused = true)]
async fn lick_arriving_before_echo_is_kept_and_echo_verifies() {
    let (sim, mut laser) = rig_with_raw_laser();
    sim.rig
        .generate_schedule(request(&["a", "b"], 1, 100, 1000, 100))
        .await
        .unwrap();

    let board = tokio::spawn(async move {
        // <T,1> + two valve bytes + <V>
        let mut frame = [0u8; 10];
        laser.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[..5], b"<T,1>");
        assert_eq!(&frame[7..], b"<V>");
        laser.write_all(b"LICK,A\n").await.unwrap();
        laser.write_all(&frame[5..7]).await.unwrap();
        laser
    });

    assert_eq!(sim.rig.start().await.unwrap(), Phase::Iti);
    let _laser = board.await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let snapshot = sim.rig.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Iti);
    assert_eq!(snapshot.event_log.len(), 1);
    assert_eq!(snapshot.event_log[0].port, Some(LickPort::A));
    assert_eq!(snapshot.event_log[0].phase_label, "ITI");
}
