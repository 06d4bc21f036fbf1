//! The trial state machine actor.
//!
//! [`TrialStateMachine`] is the single owner of the run state, the record store and the
//! send side of both hardware links. It runs as one tokio task selecting over three
//! sources:
//!
//! 1. operator control messages from [`RigHandle`]s,
//! 2. fired phase timers,
//! 3. the periodic drain of the event queue.
//!
//! All of them are handled sequentially on the actor task, so lick counting, the
//! engagement check and timer callbacks never race. When a timer fires, the event queue
//! is drained first: a lick that arrived before the deadline always wins over the TTC
//! timeout.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::TimingConfig;
use crate::error::{ConfigurationError, LinkError, RigError, RigResult, TransitionError};
use crate::hardware::protocol::ValveSchedule;
use crate::hardware::{Command, DoorPosition, LickPort, LinkId, LinkPair, PeripheralMessage};
use crate::ingest::{EventQueue, IngestItem, Payload};
use crate::records::{EventLogEntry, RecordStore};
use crate::schedule::{self, Schedule, ScheduleRequest, TrialDefinition};
use crate::timer::{TimerFired, TimerHandle, Timers};
use crate::trial::handle::{Control, OperatorTrigger, RigHandle, RigNotification, RunSnapshot};
use crate::trial::phase::{next_phase, Phase, Trigger};

const CONTROL_CAPACITY: usize = 32;
const NOTIFICATION_CAPACITY: usize = 256;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Default, Clone, Copy)]
struct LickCounts {
    port_a: u32,
    port_b: u32,
}

impl LickCounts {
    fn bump(&mut self, port: LickPort) -> u32 {
        let counter = match port {
            LickPort::A => &mut self.port_a,
            LickPort::B => &mut self.port_b,
        };
        *counter += 1;
        *counter
    }
}

#[derive(Debug)]
struct RunState {
    run_start: Option<Instant>,
    current_trial: u32,
    phase: Phase,
    phase_start: Instant,
    /// ITI entry, replaced by TTC entry
    trial_anchor: Instant,
    ttc_start: Option<Instant>,
    schedule: Option<Schedule>,
    door: Option<DoorPosition>,
    licks: LickCounts,
}

impl RunState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            run_start: None,
            current_trial: 0,
            phase: Phase::Idle,
            phase_start: now,
            trial_anchor: now,
            ttc_start: None,
            schedule: None,
            door: None,
            licks: LickCounts::default(),
        }
    }

    fn is_clear(&self) -> bool {
        self.run_start.is_none() && self.schedule.is_none() && self.current_trial == 0
    }
}

/// Supervisory core of the rig.
///
/// # Example
///
/// ```rust,ignore
/// let (sender, queue) = EventQueue::new();
/// let links = LinkPair::open(&config, sender).await?;
/// let (rig, task) = TrialStateMachine::new(config.timing.clone(), links, queue).spawn();
///
/// rig.generate_schedule(config.schedule.to_request()).await?;
/// rig.start().await?;
/// ```
pub struct TrialStateMachine {
    timing: TimingConfig,
    links: LinkPair,
    events: EventQueue,
    timers: Timers,
    pending: Option<TimerHandle>,
    state: RunState,
    records: RecordStore,
    rng: StdRng,
    notifications: broadcast::Sender<RigNotification>,
}

impl TrialStateMachine {
    /// Create an idle machine over `links`, consuming items from `events`.
    pub fn new(timing: TimingConfig, links: LinkPair, events: EventQueue) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            timing,
            links,
            events,
            timers: Timers::new(),
            pending: None,
            state: RunState::new(),
            records: RecordStore::new(),
            rng: StdRng::from_entropy(),
            notifications,
        }
    }

    /// Use a seeded random source for schedule generation.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Move the machine onto its own task.
    pub fn spawn(self) -> (RigHandle, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let handle = RigHandle::new(control_tx, self.notifications.clone());
        let task = tokio::spawn(self.run(control_rx));
        (handle, task)
    }

    async fn run(mut self, mut control: mpsc::Receiver<Control>) {
        let mut drain = tokio::time::interval(self.timing.drain_period());
        drain.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            drain_period_ms = self.timing.drain_period_ms,
            engagement_threshold = self.timing.engagement_threshold,
            "Trial state machine started"
        );

        loop {
            tokio::select! {
                msg = control.recv() => match msg {
                    Some(msg) => self.handle_control(msg).await,
                    None => break,
                },
                Some(fired) = self.timers.next_fired() => self.on_timer(fired).await,
                _ = drain.tick() => self.drain_events().await,
            }
        }

        self.cancel_pending();
        tracing::info!(phase = %self.state.phase, "Trial state machine shut down");
    }

    async fn handle_control(&mut self, msg: Control) {
        match msg {
            Control::Trigger { trigger, reply } => {
                let result = self.on_operator(trigger).await;
                if let Err(e) = &result {
                    tracing::warn!(phase = %self.state.phase, error = %e, "Operator trigger failed");
                }
                let _ = reply.send(result);
            }
            Control::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn on_operator(&mut self, trigger: OperatorTrigger) -> RigResult<Phase> {
        tracing::info!(
            trigger = trigger.trigger().name(),
            phase = %self.state.phase,
            "Operator trigger"
        );
        match trigger {
            OperatorTrigger::GenerateSchedule(request) => self.generate_schedule(&request)?,
            OperatorTrigger::Start => self.start().await?,
            OperatorTrigger::Stop => self.stop().await?,
            OperatorTrigger::Reset => self.reset()?,
        }
        Ok(self.state.phase)
    }

    fn reject(&self, trigger: Trigger) -> TransitionError {
        TransitionError::NotAllowed {
            phase: self.state.phase,
            trigger: trigger.name(),
        }
    }

    fn generate_schedule(&mut self, request: &ScheduleRequest) -> RigResult<()> {
        if self.state.phase != Phase::Idle {
            return Err(self.reject(Trigger::GenerateSchedule).into());
        }
        if self.state.schedule.is_some() {
            return Err(TransitionError::ScheduleExists.into());
        }
        // Invalid input leaves the machine untouched.
        let trials = schedule::generate(request, &mut self.rng)?;

        self.apply(Trigger::GenerateSchedule)?;
        self.state.schedule = Some(Arc::from(trials));
        self.apply(Trigger::ScheduleReady)?;
        Ok(())
    }

    async fn start(&mut self) -> RigResult<()> {
        if self.state.phase != Phase::Idle {
            return Err(self.reject(Trigger::Start).into());
        }
        match &self.state.schedule {
            Some(schedule) if !schedule.is_empty() => {}
            _ => return Err(ConfigurationError::NoSchedule.into()),
        }
        if !self.records.outcomes().is_empty() {
            return Err(TransitionError::RunRecorded.into());
        }

        self.state.run_start = Some(Instant::now());
        self.state.current_trial = 1;
        self.state.ttc_start = None;
        self.transition(Trigger::Start).await
    }

    async fn stop(&mut self) -> RigResult<()> {
        if !self.state.phase.is_running() {
            return Err(self.reject(Trigger::Stop).into());
        }
        tracing::info!(trial = self.state.current_trial, "Run stopped by operator");
        self.transition(Trigger::Stop).await
    }

    fn reset(&mut self) -> RigResult<()> {
        if self.state.phase.is_running() {
            return Err(TransitionError::MustStopBeforeReset.into());
        }
        if self.state.phase != Phase::Idle {
            return Err(self.reject(Trigger::Reset).into());
        }
        if self.state.is_clear() && self.records.is_empty() {
            tracing::debug!("Reset with nothing to clear");
            return Ok(());
        }

        self.apply(Trigger::Reset)?;
        self.cancel_pending();
        self.state = RunState::new();
        self.records.clear();
        tracing::info!("Schedule and records cleared");
        Ok(())
    }

    /// Move to the next phase without running its entry actions.
    fn apply(&mut self, trigger: Trigger) -> Result<Phase, TransitionError> {
        let from = self.state.phase;
        let to = next_phase(from, trigger).ok_or_else(|| self.reject(trigger))?;
        self.state.phase = to;
        self.state.phase_start = Instant::now();
        tracing::info!(
            trial = self.state.current_trial,
            from = %from,
            to = %to,
            trigger = trigger.name(),
            "Phase transition"
        );
        if from != to {
            let _ = self.notifications.send(RigNotification::PhaseChanged {
                from,
                to,
                trial_number: self.state.current_trial,
            });
        }
        Ok(to)
    }

    /// Apply `trigger` and every transition its entry actions chain into.
    ///
    /// A failing entry action forces `Stopping`; the error is still returned.
    async fn transition(&mut self, trigger: Trigger) -> RigResult<()> {
        let mut next = Some(trigger);
        let mut failure = None;

        while let Some(trigger) = next.take() {
            let phase = self.apply(trigger)?;
            match self.enter(phase).await {
                Ok(follow) => next = follow,
                Err(e) => {
                    tracing::error!(
                        trial = self.state.current_trial,
                        phase = %phase,
                        error = %e,
                        "Phase entry failed, stopping run"
                    );
                    let _ = self.notifications.send(RigNotification::Fault {
                        reason: e.to_string(),
                    });
                    next = Some(Trigger::Fault);
                    failure = Some(e);
                }
            }
        }

        failure.map_or(Ok(()), Err)
    }

    async fn enter(&mut self, phase: Phase) -> RigResult<Option<Trigger>> {
        match phase {
            Phase::Idle | Phase::GeneratingSchedule => Ok(None),
            Phase::Iti => self.enter_iti().await,
            Phase::DoorClosing => {
                self.links.motor.send(&Command::DoorDown).await?;
                self.arm(self.timing.door_travel(), Phase::DoorClosing);
                Ok(None)
            }
            Phase::Ttc => {
                let now = Instant::now();
                self.state.ttc_start = Some(now);
                self.state.trial_anchor = now;
                let ttc = self.current_definition()?.ttc();
                self.arm(ttc, Phase::Ttc);
                Ok(None)
            }
            Phase::Sample => {
                self.links.laser.send(&Command::BeginValveOnLick).await?;
                self.state.licks = LickCounts::default();
                let sample = self.current_definition()?.sample();
                self.arm(sample, Phase::Sample);
                Ok(None)
            }
            Phase::TrialEnd => self.enter_trial_end().await,
            Phase::Stopping => {
                self.enter_stopping().await;
                Ok(None)
            }
        }
    }

    async fn enter_iti(&mut self) -> RigResult<Option<Trigger>> {
        if self.state.current_trial == 1 {
            self.upload_schedule().await?;
        }
        let iti = self.current_definition()?.iti();
        self.state.trial_anchor = Instant::now();
        self.state.ttc_start = None;
        self.state.licks = LickCounts::default();
        self.records.begin_trial(self.state.current_trial);
        self.arm(iti, Phase::Iti);
        tracing::info!(
            trial = self.state.current_trial,
            iti_ms = millis(iti),
            "Trial started"
        );
        Ok(None)
    }

    async fn enter_trial_end(&mut self) -> RigResult<Option<Trigger>> {
        let trial = self.state.current_trial;
        let door = self.links.motor.send(&Command::DoorUp).await;
        let valves = self.links.laser.send(&Command::StopValveOnLick).await;

        let licks = self.state.licks;
        let outcome = {
            let outcome = self.records.begin_trial(trial);
            outcome.port_a_licks = licks.port_a;
            outcome.port_b_licks = licks.port_b;
            outcome.clone()
        };
        tracing::info!(
            trial,
            port_a_licks = outcome.port_a_licks,
            port_b_licks = outcome.port_b_licks,
            ttc_actual_ms = ?outcome.ttc_actual_ms,
            "Trial finished"
        );
        let _ = self.notifications.send(RigNotification::TrialCompleted {
            trial_number: trial,
            outcome,
        });
        door?;
        valves?;

        let total = self.state.schedule.as_ref().map_or(0, |s| s.len());
        if trial as usize >= total {
            tracing::info!(trials = total, "Schedule complete");
            Ok(Some(Trigger::RunComplete))
        } else {
            self.state.current_trial += 1;
            Ok(Some(Trigger::NextTrial))
        }
    }

    async fn enter_stopping(&mut self) {
        self.cancel_pending();
        if let Err(e) = self.links.motor.send(&Command::MotorReset).await {
            tracing::warn!(link = %LinkId::Motor, error = %e, "Hardware reset failed");
        }
        if let Err(e) = self.links.laser.send(&Command::LaserReset).await {
            tracing::warn!(link = %LinkId::Laser, error = %e, "Hardware reset failed");
        }
        self.arm(self.timing.stop_grace(), Phase::Stopping);
    }

    /// Send the valve schedule to the laser board and check its echo.
    async fn upload_schedule(&mut self) -> RigResult<()> {
        let schedule = self
            .state
            .schedule
            .clone()
            .ok_or(ConfigurationError::NoSchedule)?;
        let valves = ValveSchedule::from_trials(&schedule)?;
        let laser = &self.links.laser;

        let pending = laser.capture(valves.echo_len())?;
        laser.send(&Command::ValveSchedule(valves.clone())).await?;
        laser.send(&Command::EchoSchedule).await?;
        let echoed = pending.wait(self.timing.verify_timeout()).await?;
        valves.verify_echo(&echoed)?;

        tracing::info!(
            trials = valves.num_trials(),
            bytes = valves.echo_len(),
            "Valve schedule verified"
        );
        Ok(())
    }

    fn current_definition(&self) -> Result<&TrialDefinition, ConfigurationError> {
        let index = self.state.current_trial.checked_sub(1);
        self.state
            .schedule
            .as_ref()
            .zip(index)
            .and_then(|(schedule, i)| schedule.get(i as usize))
            .ok_or(ConfigurationError::NoSchedule)
    }

    fn arm(&mut self, delay: Duration, phase: Phase) {
        self.cancel_pending();
        self.pending = Some(self.timers.schedule(delay, phase));
    }

    fn cancel_pending(&mut self) {
        if let Some(timer) = self.pending.take() {
            timer.cancel();
        }
    }

    async fn on_timer(&mut self, fired: TimerFired) {
        self.drain_events().await;

        let current = self.pending.as_ref().is_some_and(|t| t.matches(&fired));
        if !current {
            tracing::trace!(?fired, "Ignoring stale timer");
            return;
        }
        self.pending = None;

        // Only the grace timer may act outside a run.
        if fired.armed_in != Phase::Stopping && !self.state.phase.is_running() {
            tracing::debug!(armed_in = %fired.armed_in, "Timer fired after run ended");
            return;
        }
        if fired.armed_in != self.state.phase {
            tracing::debug!(armed_in = %fired.armed_in, phase = %self.state.phase, "Timer outlived its phase");
            return;
        }

        let trigger = match fired.armed_in {
            Phase::Iti => Trigger::ItiElapsed,
            Phase::DoorClosing => Trigger::DoorClosed,
            Phase::Ttc => {
                self.record_ttc_timeout();
                Trigger::TtcElapsed
            }
            Phase::Sample => Trigger::SampleElapsed,
            Phase::Stopping => Trigger::GraceElapsed,
            Phase::Idle | Phase::GeneratingSchedule | Phase::TrialEnd => return,
        };
        if let Err(e) = self.transition(trigger).await {
            tracing::warn!(trigger = trigger.name(), error = %e, "Timed transition failed");
        }
    }

    fn record_ttc_timeout(&mut self) {
        let trial = self.state.current_trial;
        let Ok(ttc_ms) = self.current_definition().map(|d| d.ttc_ms) else {
            return;
        };
        if let Some(outcome) = self.records.outcome_mut(trial) {
            if outcome.ttc_actual_ms.is_none() {
                outcome.ttc_actual_ms = Some(ttc_ms);
            }
        }
        tracing::info!(trial, ttc_ms, "No engagement before TTC deadline");
    }

    async fn drain_events(&mut self) {
        for item in self.events.drain() {
            self.dispatch(item).await;
        }
    }

    async fn dispatch(&mut self, item: IngestItem) {
        let IngestItem {
            source,
            payload,
            received_at,
        } = item;
        let line = match payload {
            Payload::Line(line) => line,
            Payload::Disconnected(reason) => return self.on_disconnect(source, reason).await,
        };

        match PeripheralMessage::parse(&line) {
            Ok(PeripheralMessage::Lick { port, duration_ms }) => {
                self.on_lick(port, duration_ms, received_at).await
            }
            Ok(PeripheralMessage::DoorMoved(position)) => self.on_door(position, received_at),
            Ok(PeripheralMessage::ValveTestComplete(detail)) => {
                tracing::info!(link = %source, detail = %detail, "Valve test complete");
            }
            Ok(PeripheralMessage::TimeStampData(records)) => {
                tracing::debug!(link = %source, count = records.len(), "Peripheral timestamps");
                if self.state.run_start.is_some() {
                    self.records.log_timestamps(records);
                }
            }
            Ok(PeripheralMessage::Unrecognized(text)) => {
                tracing::debug!(link = %source, line = %text, "Unrecognized peripheral line");
            }
            Err(e) => {
                tracing::warn!(link = %source, line = %line, error = %e, "Malformed peripheral line");
            }
        }
    }

    async fn on_lick(&mut self, port: LickPort, duration_ms: Option<u64>, at: Instant) {
        let phase = self.state.phase;
        if !phase.is_running() {
            tracing::debug!(port = %port, phase = %phase, "Lick outside a run");
            return;
        }
        self.log_event(Some(port), duration_ms, phase.label(), at);
        if !matches!(phase, Phase::Ttc | Phase::Sample) {
            return;
        }

        let trial = self.state.current_trial;
        let count = self.state.licks.bump(port);
        tracing::debug!(trial, port = %port, count, phase = %phase, "Lick counted");

        if phase == Phase::Ttc && count >= self.timing.engagement_threshold {
            self.cancel_pending();
            let elapsed = self
                .state
                .ttc_start
                .map(|start| at.saturating_duration_since(start))
                .unwrap_or_default();
            let ttc_actual_ms = millis(elapsed);
            if let Some(outcome) = self.records.outcome_mut(trial) {
                if outcome.ttc_actual_ms.is_none() {
                    outcome.ttc_actual_ms = Some(ttc_actual_ms);
                }
            }
            tracing::info!(trial, port = %port, ttc_actual_ms, "Engagement threshold reached");
            if let Err(e) = self.transition(Trigger::Engaged).await {
                tracing::warn!(trial, error = %e, "Engagement transition failed");
            }
        }
    }

    fn on_door(&mut self, position: DoorPosition, at: Instant) {
        self.state.door = Some(position);
        let label = match position {
            DoorPosition::Up => "MOTOR UP",
            DoorPosition::Down => "MOTOR DOWN",
        };
        tracing::debug!(trial = self.state.current_trial, door = label, "Door acknowledged");
        // Acknowledgements still arriving during the stop grace belong to the run.
        if self.state.phase.is_running() || self.state.phase == Phase::Stopping {
            self.log_event(None, None, label, at);
        }
    }

    async fn on_disconnect(&mut self, link: LinkId, reason: String) {
        let err = RigError::from(LinkError::Disconnected { link, reason });
        if !self.state.phase.is_running() {
            tracing::warn!(link = %link, error = %err, "Link lost outside a run");
            return;
        }
        tracing::error!(link = %link, trial = self.state.current_trial, error = %err, "Link lost during run");
        let _ = self.notifications.send(RigNotification::Fault {
            reason: err.to_string(),
        });
        if let Err(e) = self.transition(Trigger::Fault).await {
            tracing::warn!(error = %e, "Fault transition failed");
        }
    }

    fn log_event(
        &mut self,
        port: Option<LickPort>,
        event_duration: Option<u64>,
        label: &str,
        at: Instant,
    ) {
        let run_start = self.state.run_start.unwrap_or(at);
        self.records.log_event(EventLogEntry {
            trial_number: self.state.current_trial,
            port,
            event_duration,
            time_since_run_start: millis(at.saturating_duration_since(run_start)),
            time_since_trial_start: millis(at.saturating_duration_since(self.state.trial_anchor)),
            phase_label: label.to_string(),
        });
    }

    fn snapshot(&self) -> RunSnapshot {
        let now = Instant::now();
        RunSnapshot {
            phase: self.state.phase,
            current_trial_number: self.state.current_trial,
            is_running: self.state.phase.is_running(),
            run_elapsed_ms: self.state.run_start.map(|s| millis(now - s)),
            phase_elapsed_ms: millis(now - self.state.phase_start),
            door: self.state.door,
            port_a_licks: self.state.licks.port_a,
            port_b_licks: self.state.licks.port_b,
            schedule: self.state.schedule.clone(),
            trials: self
                .state
                .schedule
                .as_deref()
                .map(|s| self.records.trial_records(s))
                .unwrap_or_default(),
            event_log: self.records.event_log().to_vec(),
            timestamps: self.records.timestamps().to_vec(),
        }
    }
}
