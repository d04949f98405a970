//! The Galil device layer: line protocol, reply scanner, status cache and
//! the session state machine.

pub mod command;
pub mod device;
pub mod line;
pub mod piezo;
pub mod reply;
pub mod status;

pub use command::UserVerb;
pub use device::{CmdError, CmdResult, DeviceSession, SessionHandle};
pub use piezo::{GalilHooks, NoHooks, PiezoHooks};
pub use status::{GalilStatus, MsgLevel, StatusMsg};
