//! Lantern Ground Software Library (lanternlib)
//!
//! This library drives the TM/TC link to the lantern electronics: it frames
//! and sends telecommands, runs the telemetry receive loop and correlates
//! acknowledgments and replies with the commands that caused them.

pub mod config;
pub mod board_config;
pub mod transport;
pub mod ledger;
pub mod reassembly;
pub mod driver;
pub mod client;

pub use config::{load_config, ConnectionConfig, DriverConfig, GeneralConfig, LinkConfig};
pub use transport::{Endpoint, Publisher, Subscriber, TransportContext};
pub use ledger::{CommandRecord, Ledger};
pub use board_config::BoardConfig;
pub use reassembly::{concatenate, reassemble};
pub use driver::{DriverState, TransportDriver, Verbosity};
pub use client::{series_crc, ControlDataset, LanternClient, Version};
pub use lanternlibgs::*;
