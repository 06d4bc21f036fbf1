//! # Lickport Rig Supervisor
//!
//! Supervises a two-port lick choice rig. A "motor" board moves a gating door and pulses
//! valves; a "laser" board senses licks. Both talk to the host over serial links. The
//! supervisor generates a pseudo-randomised trial schedule, uploads and verifies it, and
//! runs each trial through ITI, door closing, time-to-contact and sample phases while
//! recording outcomes and a timestamped event log.
//!
//! ## Crate Structure
//!
//! - **`schedule`**: trial definitions, stimulus pairing and jittered intervals.
//! - **`hardware`**: serial ports, the wire protocol, per-board links with background
//!   readers, and simulated boards.
//! - **`ingest`**: the single event queue fed by the readers.
//! - **`timer`**: cancellable one-shot phase timers.
//! - **`trial`**: the state machine actor and its operator handle.
//! - **`records`**: outcome table, event log and CSV export.
//! - **`config`**: figment-based configuration.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the error taxonomy.

pub mod config;
pub mod error;
pub mod hardware;
pub mod ingest;
pub mod logging;
pub mod records;
pub mod schedule;
pub mod timer;
pub mod trial;

pub use error::{RigError, RigResult};
pub use trial::{OperatorTrigger, Phase, RigHandle, RigNotification, RunSnapshot, TrialStateMachine};
