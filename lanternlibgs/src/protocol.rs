//! Packet definitions for the lantern link
//!
//! Every packet is a header followed by a payload. The top bit of the first
//! byte (the high bit of `system_id`) tells the direction: clear for telemetry
//! sent by the device, set for telecommands sent by the ground.

use serde::{Deserialize, Serialize};

use crate::error::{LanternError, LanternResult};
use crate::types::{Fields, Value};

/// Direction bit of `system_id`
pub const DIRECTION_BIT: u8 = 0x80;

/// Maximum packet size accepted from the bus
pub const MAX_PACKET_SIZE: usize = 65535;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to ground
    Telemetry,
    /// Ground to device
    Telecommand,
}

impl Direction {
    pub fn from_first_byte(byte: u8) -> Self {
        if byte & DIRECTION_BIT != 0 {
            Direction::Telecommand
        } else {
            Direction::Telemetry
        }
    }

    pub fn from_system_id(system_id: i64) -> Self {
        Self::from_first_byte((system_id & 0xff) as u8)
    }
}

/// A decoded (or to be encoded) packet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub header: Fields,
    pub data: Fields,
}

impl Packet {
    pub fn new(header: Fields, data: Fields) -> Self {
        Self { header, data }
    }

    pub fn direction(&self) -> LanternResult<Direction> {
        self.header_field("system_id").map(Direction::from_system_id)
    }

    /// Integer header field, required
    pub fn header_field(&self, name: &str) -> LanternResult<i64> {
        int_field(&self.header, "header", name)
    }

    /// Integer payload field, required
    pub fn data_field(&self, name: &str) -> LanternResult<i64> {
        int_field(&self.data, "data", name)
    }

    pub fn packet_id(&self) -> Option<i64> {
        self.header.get("packet_id").and_then(Value::as_i64)
    }

    pub fn packet_type(&self) -> Option<i64> {
        self.header.get("packet_type").and_then(Value::as_i64)
    }

    pub fn crc(&self) -> Option<u32> {
        self.header
            .get("crc")
            .and_then(Value::as_i64)
            .map(|crc| crc as u32)
    }

    pub fn set_crc(&mut self, crc: u32) {
        self.header.insert("crc".to_string(), Value::Int(crc as i64));
    }

    pub fn command_id(&self) -> Option<i64> {
        self.data.get("command_id").and_then(Value::as_i64)
    }

    /// Packet id of the telecommand an acknowledgment or reply refers to
    pub fn correlation_id(&self) -> Option<i64> {
        self.data.get("packet_id").and_then(Value::as_i64)
    }

    /// Error name carried by an execution acknowledgment
    pub fn error_name(&self) -> Option<&str> {
        self.data.get("error").and_then(Value::as_str)
    }

    /// Decoded reply sub-payload of a command reply
    pub fn reply_data(&self) -> Option<&Fields> {
        self.data.get("tc_reply_data").and_then(Value::as_map)
    }

    /// Parameters of a telecommand
    pub fn params(&self) -> Option<&Fields> {
        self.data.get("params").and_then(Value::as_map)
    }
}

fn int_field(fields: &Fields, section: &str, name: &str) -> LanternResult<i64> {
    fields
        .get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| LanternError::malformed(format!("{} field '{}' missing or not an integer", section, name)))
}
