//! Lantern Ground/Device Library (lanternlibgs)
//!
//! Definitions shared by the ground software (lanternlib) and the device
//! simulator (lanternsim): the value model, the schema store loaded from the
//! descriptor files, the packet codec, the CRC-32 used by the electronics and
//! the escape framing of the serial line.

pub mod types;
pub mod error;
pub mod format;
pub mod schema;
pub mod protocol;
pub mod crc;
pub mod codec;
pub mod commands;
pub mod framing;

pub use types::*;
pub use error::*;
pub use format::FormatToken;
pub use schema::{Descriptors, ErrorTable, FieldKey, PayloadSchema, SchemaNode, SchemaStore};
pub use protocol::*;
pub use crate::crc::crc32;
pub use codec::Codec;
pub use commands::*;
pub use framing::{Deframer, Framing, FramingConfig};
