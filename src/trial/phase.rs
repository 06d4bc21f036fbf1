//! Phases of a run and the transition table between them.
//!
//! ```text
//!  ┌──────┐ generate ┌────────────────────┐
//!  │ Idle │─────────▶│ GeneratingSchedule │──ready──▶ Idle
//!  └──┬───┘          └────────────────────┘
//!     │ start
//!     ▼
//!  ┌─────┐ elapsed ┌─────────────┐ closed ┌─────┐ engaged ┌────────┐
//!  │ Iti │────────▶│ DoorClosing │───────▶│ Ttc │────────▶│ Sample │
//!  └─────┘         └─────────────┘        └──┬──┘         └───┬────┘
//!     ▲                                      │ elapsed        │ elapsed
//!     │ next trial                           ▼                ▼
//!     └──────────────────────────────── ┌──────────┐ ◀────────┘
//!                                       │ TrialEnd │──complete──▶ Stopping ──grace──▶ Idle
//!                                       └──────────┘
//! ```
//!
//! Every running phase also accepts `Stop` and `Fault`, both leading to `Stopping`.

use serde::{Deserialize, Serialize};

/// Phase of the trial state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Nothing running; accepts operator triggers
    Idle,
    /// Building the schedule
    GeneratingSchedule,
    /// Inter-trial interval
    Iti,
    /// Door closing, waiting out the travel time
    DoorClosing,
    /// Time-to-contact window
    Ttc,
    /// Valve-on-lick active after engagement
    Sample,
    /// Finalising the trial
    TrialEnd,
    /// Resetting peripherals before returning to idle
    Stopping,
}

impl Phase {
    /// Whether a run is in progress in this phase.
    ///
    /// `Stopping` is not: timers armed by a running phase must not act once it is entered.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            Phase::Iti | Phase::DoorClosing | Phase::Ttc | Phase::Sample | Phase::TrialEnd
        )
    }

    /// Tag written to the event log.
    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::GeneratingSchedule => "GENERATING SCHEDULE",
            Phase::Iti => "ITI",
            Phase::DoorClosing => "DOOR CLOSING",
            Phase::Ttc => "TTC",
            Phase::Sample => "SAMPLE",
            Phase::TrialEnd => "TRIAL END",
            Phase::Stopping => "STOPPING",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::GeneratingSchedule => write!(f, "generating schedule"),
            Phase::Iti => write!(f, "iti"),
            Phase::DoorClosing => write!(f, "door closing"),
            Phase::Ttc => write!(f, "ttc"),
            Phase::Sample => write!(f, "sample"),
            Phase::TrialEnd => write!(f, "trial end"),
            Phase::Stopping => write!(f, "stopping"),
        }
    }
}

/// Everything that can move the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Operator: build a schedule
    GenerateSchedule,
    /// Schedule built
    ScheduleReady,
    /// Operator: start the run
    Start,
    /// Operator: stop the run
    Stop,
    /// Operator: clear schedule and records
    Reset,
    /// ITI timer fired
    ItiElapsed,
    /// Door travel timer fired
    DoorClosed,
    /// TTC timer fired without engagement
    TtcElapsed,
    /// Engagement threshold reached during TTC
    Engaged,
    /// Sample timer fired
    SampleElapsed,
    /// Another trial follows
    NextTrial,
    /// Last trial finished
    RunComplete,
    /// Protocol or link failure
    Fault,
    /// Stop grace delay elapsed
    GraceElapsed,
}

impl Trigger {
    /// Name used in rejections and logs.
    pub fn name(self) -> &'static str {
        match self {
            Trigger::GenerateSchedule => "GENERATE_SCHEDULE",
            Trigger::ScheduleReady => "schedule ready",
            Trigger::Start => "START",
            Trigger::Stop => "STOP",
            Trigger::Reset => "RESET",
            Trigger::ItiElapsed => "iti elapsed",
            Trigger::DoorClosed => "door closed",
            Trigger::TtcElapsed => "ttc elapsed",
            Trigger::Engaged => "engaged",
            Trigger::SampleElapsed => "sample elapsed",
            Trigger::NextTrial => "next trial",
            Trigger::RunComplete => "run complete",
            Trigger::Fault => "fault",
            Trigger::GraceElapsed => "grace elapsed",
        }
    }
}

/// Transition table. `None` means the pair is not allowed.
pub fn next_phase(phase: Phase, trigger: Trigger) -> Option<Phase> {
    use Phase::*;
    use Trigger::*;

    match (phase, trigger) {
        (Idle, GenerateSchedule) => Some(GeneratingSchedule),
        (GeneratingSchedule, ScheduleReady) => Some(Idle),
        (Idle, Start) => Some(Iti),
        (Idle, Reset) => Some(Idle),

        (Iti, ItiElapsed) => Some(DoorClosing),
        (DoorClosing, DoorClosed) => Some(Ttc),
        (Ttc, Engaged) => Some(Sample),
        (Ttc, TtcElapsed) => Some(TrialEnd),
        (Sample, SampleElapsed) => Some(TrialEnd),
        (TrialEnd, NextTrial) => Some(Iti),
        (TrialEnd, RunComplete) => Some(Stopping),

        (p, Stop | Fault) if p.is_running() => Some(Stopping),
        (Stopping, GraceElapsed) => Some(Idle),

        _ => None,
    }
}
