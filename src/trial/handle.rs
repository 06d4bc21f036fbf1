//! Message-passing surface of the state machine.
//!
//! The machine owns all run state. Everything outside talks to it through a cloneable
//! [`RigHandle`]: operator triggers and snapshot queries go over an mpsc channel with a
//! oneshot reply, notifications come back over a broadcast channel.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{RigError, RigResult};
use crate::hardware::{DoorPosition, TimeStampRecord};
use crate::records::{EventLogEntry, TrialOutcome, TrialRecord};
use crate::schedule::{Schedule, ScheduleRequest};
use crate::trial::phase::{Phase, Trigger};

/// The only inputs accepted from outside the core.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorTrigger {
    /// Build a schedule from operator input
    GenerateSchedule(ScheduleRequest),
    /// Upload and verify the schedule, then run it
    Start,
    /// Abort the run
    Stop,
    /// Clear schedule and records
    Reset,
}

impl OperatorTrigger {
    /// Table trigger this maps to.
    pub fn trigger(&self) -> Trigger {
        match self {
            OperatorTrigger::GenerateSchedule(_) => Trigger::GenerateSchedule,
            OperatorTrigger::Start => Trigger::Start,
            OperatorTrigger::Stop => Trigger::Stop,
            OperatorTrigger::Reset => Trigger::Reset,
        }
    }
}

/// Broadcast to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RigNotification {
    /// The machine changed phase
    PhaseChanged {
        /// Previous phase
        from: Phase,
        /// New phase
        to: Phase,
        /// Trial in progress
        trial_number: u32,
    },
    /// A trial was finalised
    TrialCompleted {
        /// Which trial
        trial_number: u32,
        /// Final outcome
        outcome: TrialOutcome,
    },
    /// A fatal error forced the run to stop
    Fault {
        /// Error text
        reason: String,
    },
}

/// Read-only copy of the run state.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    /// Current phase
    pub phase: Phase,
    /// Trial in progress, 0 before the first
    pub current_trial_number: u32,
    /// Whether a run is in progress
    pub is_running: bool,
    /// Milliseconds since START, if a run has started
    pub run_elapsed_ms: Option<u64>,
    /// Milliseconds in the current phase
    pub phase_elapsed_ms: u64,
    /// Last door position the motor board reported
    pub door: Option<DoorPosition>,
    /// Live port A counter
    pub port_a_licks: u32,
    /// Live port B counter
    pub port_b_licks: u32,
    /// Generated schedule
    #[serde(skip)]
    pub schedule: Option<Schedule>,
    /// Schedule rows joined with outcomes
    pub trials: Vec<TrialRecord>,
    /// Event log
    pub event_log: Vec<EventLogEntry>,
    /// Peripheral timestamps
    pub timestamps: Vec<TimeStampRecord>,
}

pub(crate) enum Control {
    Trigger {
        trigger: OperatorTrigger,
        reply: oneshot::Sender<RigResult<Phase>>,
    },
    Snapshot {
        reply: oneshot::Sender<RunSnapshot>,
    },
}

/// Cloneable handle to a running state machine.
///
/// The machine exits once every handle is dropped.
#[derive(Debug, Clone)]
pub struct RigHandle {
    control: mpsc::Sender<Control>,
    notifications: broadcast::Sender<RigNotification>,
}

impl RigHandle {
    pub(crate) fn new(
        control: mpsc::Sender<Control>,
        notifications: broadcast::Sender<RigNotification>,
    ) -> Self {
        Self {
            control,
            notifications,
        }
    }

    /// Deliver an operator trigger and wait for the outcome.
    ///
    /// Returns the phase the machine settled in.
    pub async fn trigger(&self, trigger: OperatorTrigger) -> RigResult<Phase> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Trigger { trigger, reply })
            .await
            .map_err(|_| RigError::MachineGone)?;
        rx.await.map_err(|_| RigError::MachineGone)?
    }

    /// `GENERATE_SCHEDULE`.
    pub async fn generate_schedule(&self, request: ScheduleRequest) -> RigResult<Phase> {
        self.trigger(OperatorTrigger::GenerateSchedule(request)).await
    }

    /// `START`.
    pub async fn start(&self) -> RigResult<Phase> {
        self.trigger(OperatorTrigger::Start).await
    }

    /// `STOP`.
    pub async fn stop(&self) -> RigResult<Phase> {
        self.trigger(OperatorTrigger::Stop).await
    }

    /// `RESET`.
    pub async fn reset(&self) -> RigResult<Phase> {
        self.trigger(OperatorTrigger::Reset).await
    }

    /// Current state.
    pub async fn snapshot(&self) -> RigResult<RunSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Snapshot { reply })
            .await
            .map_err(|_| RigError::MachineGone)?;
        rx.await.map_err(|_| RigError::MachineGone)
    }

    /// Subscribe to notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RigNotification> {
        self.notifications.subscribe()
    }
}
