//! Serial peripherals of the rig.
//!
//! - [`serial`]: opening ports and the type-erased async port alias
//! - [`protocol`]: outbound command framing and inbound message parsing
//! - [`link`]: one connection per peripheral with its background reader
//! - [`sim`]: simulated boards over in-memory streams, for tests and dry runs

pub mod link;
pub mod protocol;
pub mod serial;
pub mod sim;

pub use link::{HardwareLink, LinkPair};
pub use protocol::{Command, DoorPosition, LickPort, PeripheralMessage, TimeStampRecord};
pub use serial::{open_serial_async, DynSerial, SerialPortIO};

use serde::{Deserialize, Serialize};

/// Which peripheral a link talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkId {
    /// Door and valve board
    Motor,
    /// Lick-sensing board
    Laser,
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkId::Motor => write!(f, "motor"),
            LinkId::Laser => write!(f, "laser"),
        }
    }
}
