//! Trial record store.
//!
//! Append-only tables written by the state machine and read by reporting code through
//! snapshots:
//!
//! - trial outcomes, one per trial that has begun, created lazily at ITI entry;
//! - the event log, one row per lick or door acknowledgement while running;
//! - peripheral timestamps parsed from `Time Stamp Data` trailers.
//!
//! Rows are never edited after insertion, with one exception: the outcome of the
//! trial in progress accumulates until the trial is finalised.

use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::RigResult;
use crate::hardware::{LickPort, TimeStampRecord};
use crate::schedule::TrialDefinition;

/// Per-trial result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrialOutcome {
    /// Licks on port A counted in the current phase window
    pub port_a_licks: u32,
    /// Licks on port B counted in the current phase window
    pub port_b_licks: u32,
    /// Time spent in TTC, set exactly once per trial
    pub ttc_actual_ms: Option<u64>,
}

/// One timestamped event. Times are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventLogEntry {
    /// Trial the event belongs to
    pub trial_number: u32,
    /// Port for licks, empty otherwise
    pub port: Option<LickPort>,
    /// Contact duration when the board reports one
    pub event_duration: Option<u64>,
    /// Milliseconds since START
    pub time_since_run_start: u64,
    /// Milliseconds since the trial anchor
    pub time_since_trial_start: u64,
    /// Free-text state tag, e.g. `TTC`, `SAMPLE`, `MOTOR UP`
    pub phase_label: String,
}

/// Export row: a trial definition joined with its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialRecord {
    /// 1-based block id
    pub trial_block: u32,
    /// 1-based position in the schedule
    pub trial_number: u32,
    /// Stimulus label on port A
    pub port_a_stimulus: String,
    /// Stimulus label on port B
    pub port_b_stimulus: String,
    /// Scheduled ITI
    pub iti_ms: u64,
    /// Scheduled TTC window
    pub ttc_ms: u64,
    /// Scheduled sample length
    pub sample_ms: u64,
    /// Port A licks, empty if the trial never began
    pub port_a_licks: Option<u32>,
    /// Port B licks, empty if the trial never began
    pub port_b_licks: Option<u32>,
    /// Actual TTC, empty until set
    pub ttc_actual_ms: Option<u64>,
}

/// Append-only outcome table, event log and timestamp table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordStore {
    outcomes: Vec<TrialOutcome>,
    event_log: Vec<EventLogEntry>,
    timestamps: Vec<TimeStampRecord>,
}

impl RecordStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the outcome for `trial_number` if it does not exist yet.
    pub fn begin_trial(&mut self, trial_number: u32) -> &mut TrialOutcome {
        let index = trial_number.saturating_sub(1) as usize;
        while self.outcomes.len() <= index {
            self.outcomes.push(TrialOutcome::default());
        }
        &mut self.outcomes[index]
    }

    /// Outcome of a trial that has begun.
    pub fn outcome(&self, trial_number: u32) -> Option<&TrialOutcome> {
        self.outcomes.get(trial_number.checked_sub(1)? as usize)
    }

    /// Mutable outcome of a trial that has begun.
    pub fn outcome_mut(&mut self, trial_number: u32) -> Option<&mut TrialOutcome> {
        self.outcomes.get_mut(trial_number.checked_sub(1)? as usize)
    }

    /// Outcomes of every trial that has begun, in order.
    pub fn outcomes(&self) -> &[TrialOutcome] {
        &self.outcomes
    }

    /// Append an event.
    pub fn log_event(&mut self, entry: EventLogEntry) {
        self.event_log.push(entry);
    }

    /// The event log.
    pub fn event_log(&self) -> &[EventLogEntry] {
        &self.event_log
    }

    /// Append peripheral timestamps.
    pub fn log_timestamps(&mut self, records: impl IntoIterator<Item = TimeStampRecord>) {
        self.timestamps.extend(records);
    }

    /// Peripheral timestamps.
    pub fn timestamps(&self) -> &[TimeStampRecord] {
        &self.timestamps
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.event_log.is_empty() && self.timestamps.is_empty()
    }

    /// Drop every table.
    pub fn clear(&mut self) {
        self.outcomes.clear();
        self.event_log.clear();
        self.timestamps.clear();
    }

    /// One row per trial definition, joined with its outcome if the trial began.
    pub fn trial_records(&self, schedule: &[TrialDefinition]) -> Vec<TrialRecord> {
        schedule
            .iter()
            .map(|def| {
                let outcome = self.outcome(def.trial_number);
                TrialRecord {
                    trial_block: def.trial_block,
                    trial_number: def.trial_number,
                    port_a_stimulus: def.port_a_stimulus.clone(),
                    port_b_stimulus: def.port_b_stimulus.clone(),
                    iti_ms: def.iti_ms,
                    ttc_ms: def.ttc_ms,
                    sample_ms: def.sample_ms,
                    port_a_licks: outcome.map(|o| o.port_a_licks),
                    port_b_licks: outcome.map(|o| o.port_b_licks),
                    ttc_actual_ms: outcome.and_then(|o| o.ttc_actual_ms),
                }
            })
            .collect()
    }
}

/// Write trial records as CSV with a header row.
pub fn write_trials<W: Write>(records: &[TrialRecord], writer: W) -> RigResult<()> {
    let mut csv = csv::Writer::from_writer(writer);
    if records.is_empty() {
        csv.write_record(TRIAL_COLUMNS)?;
    }
    for record in records {
        csv.serialize(record)?;
    }
    csv.flush()?;
    Ok(())
}

/// Write the event log as CSV with a header row.
pub fn write_events<W: Write>(events: &[EventLogEntry], writer: W) -> RigResult<()> {
    let mut csv = csv::Writer::from_writer(writer);
    if events.is_empty() {
        csv.write_record(EVENT_COLUMNS)?;
    }
    for event in events {
        csv.serialize(event)?;
    }
    csv.flush()?;
    Ok(())
}

const TRIAL_COLUMNS: [&str; 10] = [
    "trial_block",
    "trial_number",
    "port_a_stimulus",
    "port_b_stimulus",
    "iti_ms",
    "ttc_ms",
    "sample_ms",
    "port_a_licks",
    "port_b_licks",
    "ttc_actual_ms",
];

const EVENT_COLUMNS: [&str; 6] = [
    "trial_number",
    "port",
    "event_duration",
    "time_since_run_start",
    "time_since_trial_start",
    "phase_label",
];

/// Paths written by [`export_to_dir`].
#[derive(Debug, Clone)]
pub struct ExportPaths {
    /// Trial-outcome table
    pub trials: PathBuf,
    /// Event log
    pub events: PathBuf,
}

/// Write both tables into `dir` as `trials_<stamp>.csv` and `events_<stamp>.csv`.
pub fn export_to_dir(
    dir: &Path,
    records: &[TrialRecord],
    events: &[EventLogEntry],
) -> RigResult<ExportPaths> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let paths = ExportPaths {
        trials: dir.join(format!("trials_{stamp}.csv")),
        events: dir.join(format!("events_{stamp}.csv")),
    };
    write_trials(records, std::fs::File::create(&paths.trials)?)?;
    write_events(events, std::fs::File::create(&paths.events)?)?;
    tracing::info!(
        trials = %paths.trials.display(),
        events = %paths.events.display(),
        "Exported run tables"
    );
    Ok(paths)
}
