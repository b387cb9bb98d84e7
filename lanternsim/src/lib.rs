//! Lantern Device Simulator (lanternsim)
//!
//! Stands in for the lantern electronics on the bus: it answers every
//! telecommand with the acknowledgments and replies the real device sends,
//! and publishes housekeeping telemetry.
//!
//! | Command                  | Reply                                    |
//! |--------------------------|------------------------------------------|
//! | echo                     | the message                              |
//! | get_version              | firmware version and config name         |
//! | get_temperature/voltage  | fixed readings                           |
//! | get_modulation_sequence  | 200 point fragments, last fragment first |
//! | set/flash sequence       | none, requires flashing mode             |

pub mod device;
pub mod simulator;

pub use device::{Device, Outcome, Sequence};
pub use simulator::Simulator;
