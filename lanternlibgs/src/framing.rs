//! Byte stream framing of the serial line
//!
//! On the serial line between the electronics and the bus, every packet is
//! escaped and followed by the end sequence twice. Escaping inserts the
//! escape byte after each occurrence of the end sequence, so the doubled end
//! sequence cannot appear inside an escaped packet.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{LanternError, LanternResult};
use crate::protocol::MAX_PACKET_SIZE;

/// Framing parameters as written in a configuration file, in hex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramingConfig {
    pub end_sequence: String,
    pub escape_character: String,
}

/// Escape based framer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framing {
    end: Vec<u8>,
    escape: Vec<u8>,
}

impl Framing {
    pub fn new(end: &[u8], escape: &[u8]) -> LanternResult<Self> {
        if end.is_empty() || escape.is_empty() {
            return Err(LanternError::Config("empty end sequence or escape".to_string()));
        }
        // An escape starting like the end sequence could form a doubled end
        if escape.starts_with(&end[..1]) {
            return Err(LanternError::Config(format!(
                "escape {} starts like end sequence {}",
                hex::encode(escape),
                hex::encode(end)
            )));
        }
        Ok(Self {
            end: end.to_vec(),
            escape: escape.to_vec(),
        })
    }

    pub fn from_config(config: &FramingConfig) -> LanternResult<Self> {
        let decode = |text: &str| {
            hex::decode(text.replace(' ', ""))
                .map_err(|e| LanternError::Config(format!("'{}' is not hex: {}", text, e)))
        };
        Self::new(&decode(&config.end_sequence)?, &decode(&config.escape_character)?)
    }

    /// Insert the escape after every end sequence of `packet`
    pub fn escape(&self, packet: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(packet.len() + packet.len() / 8);
        let mut rest = packet;
        while let Some(at) = find(rest, &self.end) {
            let cut = at + self.end.len();
            out.extend_from_slice(&rest[..cut]);
            out.extend_from_slice(&self.escape);
            rest = &rest[cut..];
        }
        out.extend_from_slice(rest);
        out
    }

    /// Drop the escape following every end sequence
    pub fn unescape(&self, escaped: &[u8]) -> Vec<u8> {
        let mut marker = self.end.clone();
        marker.extend_from_slice(&self.escape);

        let mut out = Vec::with_capacity(escaped.len());
        let mut rest = escaped;
        while let Some(at) = find(rest, &marker) {
            out.extend_from_slice(&rest[..at + self.end.len()]);
            rest = &rest[at + marker.len()..];
        }
        out.extend_from_slice(rest);
        out
    }

    /// Escaped packet followed by the doubled end sequence
    pub fn encode(&self, packet: &[u8]) -> Vec<u8> {
        let mut out = self.escape(packet);
        out.extend_from_slice(&self.end);
        out.extend_from_slice(&self.end);
        out
    }

    /// Split a stream into unescaped packets
    ///
    /// Returns the complete packets and the bytes after the last doubled end
    /// sequence, which start the next packet. Empty frames are skipped.
    pub fn split<'a>(&self, data: &'a [u8]) -> (Vec<Vec<u8>>, &'a [u8]) {
        let mut terminator = self.end.clone();
        terminator.extend_from_slice(&self.end);

        let mut packets = Vec::new();
        let mut rest = data;
        while let Some(at) = find(rest, &terminator) {
            if at > 0 {
                packets.push(self.unescape(&rest[..at]));
            }
            rest = &rest[at + terminator.len()..];
        }
        (packets, rest)
    }
}

/// Accumulates serial bytes and hands out complete packets
#[derive(Debug, Clone)]
pub struct Deframer {
    framing: Framing,
    buffer: Vec<u8>,
}

impl Deframer {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
        }
    }

    /// Append received bytes and return the packets they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let (packets, rest) = self.framing.split(&self.buffer);
        let rest = rest.to_vec();

        // Twice the largest packet with every byte escaped, and nothing ended it
        if rest.len() > 2 * MAX_PACKET_SIZE * (1 + self.framing.escape.len()) {
            warn!("Dropping {} unterminated bytes", rest.len());
            self.buffer.clear();
        } else {
            self.buffer = rest;
        }
        packets
    }

    /// Bytes waiting for their terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
