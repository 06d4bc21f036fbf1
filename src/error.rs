//! Custom error types for the rig supervisor.
//!
//! Errors are split along the lines the supervisor reacts to them:
//!
//! - **`ConfigurationError`**: the operator asked for something that cannot run (no
//!   schedule, unconfigured stimuli, zero blocks). Rejected before any state change.
//! - **`ProtocolError`**: a peripheral answered wrongly or not at all. Fatal to the
//!   current run; the state machine forces `Stopping`.
//! - **`TransitionError`**: the trigger is not allowed in the current phase. No state
//!   change, non-fatal.
//! - **`LinkError`**: opening or writing a serial link failed. Fatal for that link; lost
//!   commands are never retried because a duplicated door or valve command is unsafe.
//!
//! `RigError` consolidates all of them, plus configuration loading and export failures,
//! so callers can use `?` throughout.

use thiserror::Error;

use crate::hardware::LinkId;
use crate::trial::Phase;

/// Convenience alias for results using the crate error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// Operator input that cannot produce a runnable schedule or run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no stimulus label was changed from its default; configure at least one stimulus")]
    NoStimuliConfigured,

    #[error("block count must be at least 1")]
    ZeroBlocks,

    #[error("{0} configured stimuli cannot be paired; configure 2, 4 or 8")]
    UnsupportedStimulusCount(usize),

    #[error("stimulus label '{0}' is configured more than once")]
    DuplicateStimulus(String),

    #[error("no schedule has been generated")]
    NoSchedule,

    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

/// Peripheral misbehaviour detected by the host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("schedule echo mismatch at byte {index}: sent {sent}, echoed {echoed}")]
    ScheduleMismatch { index: usize, sent: i8, echoed: i8 },

    #[error("schedule echo length mismatch: expected {expected} bytes, got {actual}")]
    EchoLength { expected: usize, actual: usize },

    #[error("timed out after {timeout_ms} ms waiting for {expected} echoed bytes from {link}")]
    VerifyTimeout {
        link: LinkId,
        expected: usize,
        timeout_ms: u64,
    },

    #[error("valve slot {0} does not fit a signed schedule byte")]
    ValveOutOfRange(u8),

    #[error("valve index {0} encodes as a text byte and would be mistaken for a message")]
    ValveIsText(i8),

    #[error("malformed timestamp group '{0}'")]
    MalformedTimestamp(String),
}

/// A trigger the current phase does not accept.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("must stop before reset")]
    MustStopBeforeReset,

    #[error("'{trigger}' is not accepted in phase {phase}")]
    NotAllowed { phase: Phase, trigger: &'static str },

    #[error("a schedule already exists; reset first")]
    ScheduleExists,

    #[error("records from a previous run exist; reset before starting again")]
    RunRecorded,
}

/// Serial link failures.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("failed to open {link} link on {port}: {source}")]
    Open {
        link: LinkId,
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("write to {link} link failed: {source}")]
    Write {
        link: LinkId,
        #[source]
        source: std::io::Error,
    },

    #[error("{link} link is closed")]
    Closed { link: LinkId },

    #[error("{link} link disconnected: {reason}")]
    Disconnected { link: LinkId, reason: String },
}

/// Primary error type for the rig supervisor.
#[derive(Error, Debug)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transition rejected: {0}")]
    Transition(#[from] TransitionError),

    #[error("Hardware link error: {0}")]
    Link(#[from] LinkError),

    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    #[error("Export error: {0}")]
    Export(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State machine is no longer running")]
    MachineGone,
}

impl From<figment::Error> for RigError {
    fn from(value: figment::Error) -> Self {
        RigError::ConfigLoad(Box::new(value))
    }
}

impl RigError {
    /// Whether this error ends the current run.
    ///
    /// Configuration and transition errors leave the machine where it was; protocol and
    /// link errors force `Stopping`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RigError::Protocol(_) | RigError::Link(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_follows_taxonomy() {
        assert!(!RigError::from(ConfigurationError::NoSchedule).is_fatal());
        assert!(!RigError::from(TransitionError::MustStopBeforeReset).is_fatal());
        assert!(RigError::from(ProtocolError::ScheduleMismatch {
            index: 0,
            sent: 1,
            echoed: 2
        })
        .is_fatal());
        assert!(RigError::from(LinkError::Closed {
            link: LinkId::Motor
        })
        .is_fatal());
    }

    #[test]
    fn reset_while_running_has_distinct_reason() {
        let err = RigError::from(TransitionError::MustStopBeforeReset);
        assert_eq!(err.to_string(), "Transition rejected: must stop before reset");
    }

    #[test]
    fn restart_with_records_asks_for_reset() {
        let err = RigError::from(TransitionError::RunRecorded);
        assert_eq!(
            err.to_string(),
            "Transition rejected: records from a previous run exist; reset before starting again"
        );
    }

    #[test]
    fn mismatch_message_names_the_byte() {
        let err = ProtocolError::ScheduleMismatch {
            index: 5,
            sent: 3,
            echoed: 0,
        };
        assert_eq!(
            err.to_string(),
            "schedule echo mismatch at byte 5: sent 3, echoed 0"
        );
    }
}
