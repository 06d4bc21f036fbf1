//! Trial state machine.
//!
//! - [`phase`]: the closed set of phases and the `(phase, trigger) -> phase` table
//! - [`machine`]: the actor that owns the run state and drives the peripherals
//! - [`handle`]: operator triggers, snapshots and notifications

pub mod handle;
pub mod machine;
pub mod phase;

pub use handle::{OperatorTrigger, RigHandle, RigNotification, RunSnapshot};
pub use machine::TrialStateMachine;
pub use phase::{next_phase, Phase, Trigger};
