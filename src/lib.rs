//! Position controller for telescope mirrors driven by Galil motor
//! controllers.
//!
//! A large optical mirror rests on a set of adjustable actuators and
//! fixed-length links. This crate models the mirror geometry (orientation
//! to actuator/encoder lengths, in both directions), talks the Galil's
//! line protocol over TCP, and iterates moves against encoder feedback
//! until the mirror reaches the commanded orientation.

pub mod actor;
pub mod config;
pub mod galil;
pub mod mirror;
pub mod units;

pub use config::Config;
pub use galil::{CmdError, CmdResult, DeviceSession, SessionHandle, UserVerb};
pub use mirror::{MirrorModel, Orientation};
