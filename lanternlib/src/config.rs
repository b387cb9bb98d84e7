//! Configuration loading for the ground link

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lanternlibgs::{Descriptors, LanternError, LanternResult, DIRECTION_BIT};

use self::constants::*;

/// Complete configuration of a link to one device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkConfig {
    pub general: GeneralConfig,
    pub connection: ConnectionConfig,
    pub descriptors: Descriptors,
    #[serde(default)]
    pub driver: DriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneralConfig {
    /// Device identifier, the low seven bits of every `system_id`
    pub system_id: u8,
}

/// Bus endpoints, `udp://host:port` or `inproc://name`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Telecommands, ground to device
    pub tc_endpoint: String,
    /// Telemetry, device to ground
    pub tm_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// 0 silent, 1 rack, 2 rack/eack/reply, 3 or more everything
    pub verbosity: u8,
    pub poll_interval_ms: u64,
    pub max_commands: usize,
    pub max_telemetry: usize,
}

impl DriverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            max_commands: DEFAULT_MAX_COMMANDS,
            max_telemetry: DEFAULT_MAX_TELEMETRY,
        }
    }
}

impl LinkConfig {
    /// Configuration with the default driver settings
    pub fn new(system_id: u8, connection: ConnectionConfig, descriptors: Descriptors) -> Self {
        Self {
            general: GeneralConfig { system_id },
            connection,
            descriptors,
            driver: DriverConfig::default(),
        }
    }

    pub fn validate(&self) -> LanternResult<()> {
        if self.general.system_id & DIRECTION_BIT != 0 {
            return Err(LanternError::Config(format!(
                "system_id {:#04x} uses the direction bit",
                self.general.system_id
            )));
        }
        if self.driver.max_commands == 0 || self.driver.max_telemetry == 0 {
            return Err(LanternError::Config("retention limits must be positive".to_string()));
        }
        Ok(())
    }
}

/// Load link configuration from a JSON file. A relative descriptor folder is
/// taken relative to the configuration file.
pub fn load_config<P: AsRef<Path>>(path: P) -> LanternResult<LinkConfig> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut config: LinkConfig = serde_json::from_reader(reader)?;

    if config.descriptors.folder.is_relative() {
        if let Some(parent) = path.parent() {
            config.descriptors.folder = parent.join(&config.descriptors.folder);
        }
    }

    config.validate()?;
    Ok(config)
}

/// Configuration constants
pub mod constants {
    use std::time::Duration;

    /// Idle delay between polls of the telemetry subscriber
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Command records kept by the ledger
    pub const DEFAULT_MAX_COMMANDS: usize = 1024;

    /// Telemetry packets kept by the ledger
    pub const DEFAULT_MAX_TELEMETRY: usize = 10_000;

    /// Wait for an execution acknowledgment
    pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);

    /// Wait for a complete multi-packet reply
    pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

    /// Receive buffer for datagram endpoints, one whole packet
    pub const RECV_BUFFER_SIZE: usize = lanternlibgs::MAX_PACKET_SIZE;
}
