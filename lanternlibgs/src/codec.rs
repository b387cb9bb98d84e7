//! Schema driven packet codec
//!
//! `pack` and `unpack` walk the [`SchemaNode`] trees of the [`SchemaStore`]:
//! the envelope of the packet's direction slices the header from the raw
//! payload, and the payload layout is chosen by `packet_type` (telemetry) or by
//! the leading `command_id` byte (telecommands). Command replies carry a nested
//! payload that is decoded a second time with the reply layout of the command
//! that produced it.
//!
//! Packing ignores the `start` offsets and emits fields in declaration order;
//! the schema validation done at load time guarantees both agree.

use std::sync::Arc;

use log::trace;

use crate::crc::crc32;
use crate::error::{LanternError, LanternResult};
use crate::format::FormatToken;
use crate::protocol::{Direction, Packet};
use crate::schema::{FieldKey, SchemaNode, SchemaStore};
use crate::types::{Fields, Value};

/// Field translated through the error table
pub const ERROR_FIELD: &str = "error";
/// Field of a command reply holding the nested reply payload
pub const REPLY_DATA_FIELD: &str = "tc_reply_data";

/// Packs and unpacks packets described by a schema store
#[derive(Debug, Clone)]
pub struct Codec {
    schemas: Arc<SchemaStore>,
}

impl Codec {
    pub fn new(schemas: Arc<SchemaStore>) -> Self {
        Self { schemas }
    }

    pub fn schemas(&self) -> &SchemaStore {
        &self.schemas
    }

    pub fn shared_schemas(&self) -> Arc<SchemaStore> {
        self.schemas.clone()
    }

    /// Encode a packet into its wire form
    pub fn pack(&self, packet: &Packet) -> LanternResult<Vec<u8>> {
        let direction = packet.direction()?;
        let mut out = Vec::new();
        self.pack_group(self.schemas.header(direction)?, &packet.header, &mut out)?;

        let payload = match direction {
            Direction::Telemetry => {
                self.pack_telemetry_payload(packet.header_field("packet_type")?, &packet.data)?
            }
            Direction::Telecommand => self.pack_command_payload(&packet.data)?,
        };
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Encode the payload of a telecommand
    pub fn pack_command_payload(&self, data: &Fields) -> LanternResult<Vec<u8>> {
        let command_id = int_of(data, "command_id")?;
        let schema = self.schemas.command(command_id)?;
        let mut out = Vec::new();
        self.pack_group(&schema.root, data, &mut out)?;
        Ok(out)
    }

    /// Encode the payload of a telemetry packet of the given type
    pub fn pack_telemetry_payload(&self, packet_type: i64, data: &Fields) -> LanternResult<Vec<u8>> {
        let schema = self.schemas.telemetry_type(packet_type)?;
        let mut out = Vec::new();

        if Some(packet_type) != self.schemas.reply_type() {
            self.pack_group(&schema.root, data, &mut out)?;
            return Ok(out);
        }

        let mut data = data.clone();
        if let Some(Value::Map(reply)) = data.get(REPLY_DATA_FIELD) {
            let command_id = int_of(&data, "command_id")?;
            let mut nested = Vec::new();
            self.pack_group(&self.schemas.reply(command_id)?.root, reply, &mut nested)?;
            data.insert(REPLY_DATA_FIELD.to_string(), Value::Bytes(nested));
        }
        self.pack_group(&schema.root, &data, &mut out)?;
        Ok(out)
    }

    /// Decode a packet from its wire form
    pub fn unpack(&self, bytes: &[u8]) -> LanternResult<Packet> {
        let first = *bytes
            .first()
            .ok_or_else(|| LanternError::malformed("empty packet"))?;
        let direction = Direction::from_first_byte(first);

        let mut envelope = Fields::new();
        self.unpack_group(self.schemas.envelope(direction), bytes, &mut envelope)?;

        let header = match envelope.remove("header") {
            Some(Value::Map(header)) => header,
            _ => return Err(LanternError::malformed("envelope without header")),
        };
        let raw = match envelope.remove("data") {
            Some(Value::Bytes(raw)) => raw,
            _ => return Err(LanternError::malformed("envelope without payload")),
        };

        let data = match direction {
            Direction::Telemetry => {
                self.unpack_telemetry_payload(int_of(&header, "packet_type")?, &raw)?
            }
            Direction::Telecommand => self.unpack_command_payload(&raw)?,
        };

        trace!("Unpacked {:?} packet: {:?}", direction, header);
        Ok(Packet::new(header, data))
    }

    fn unpack_command_payload(&self, raw: &[u8]) -> LanternResult<Fields> {
        let command_id = *raw
            .first()
            .ok_or_else(|| LanternError::malformed("empty telecommand payload"))?;
        let schema = self.schemas.command(command_id as i64)?;
        let mut data = Fields::new();
        self.unpack_group(&schema.root, raw, &mut data)?;
        Ok(data)
    }

    fn unpack_telemetry_payload(&self, packet_type: i64, raw: &[u8]) -> LanternResult<Fields> {
        let schema = self.schemas.telemetry_type(packet_type)?;
        let mut data = Fields::new();
        self.unpack_group(&schema.root, raw, &mut data)?;

        if Some(packet_type) == self.schemas.reply_type() {
            let command_id = int_of(&data, "command_id")?;
            let nested = match data.get(REPLY_DATA_FIELD) {
                Some(Value::Bytes(nested)) => nested.clone(),
                _ => return Err(LanternError::malformed("command reply without reply data")),
            };
            let mut reply = Fields::new();
            self.unpack_group(&self.schemas.reply(command_id)?.root, &nested, &mut reply)?;
            data.insert(REPLY_DATA_FIELD.to_string(), Value::Map(reply));
        }
        Ok(data)
    }

    /// Recompute the CRC of `packet` and compare with its header CRC
    pub fn check_crc(&self, packet: &Packet) -> LanternResult<bool> {
        let expected = packet
            .crc()
            .ok_or_else(|| LanternError::malformed("header without crc"))?;
        Ok(self.compute_crc(packet)? == expected)
    }

    /// Like [`Codec::check_crc`] but reports a mismatch as an error
    pub fn verify_crc(&self, packet: &Packet) -> LanternResult<()> {
        let expected = packet
            .crc()
            .ok_or_else(|| LanternError::malformed("header without crc"))?;
        let computed = self.compute_crc(packet)?;
        if computed != expected {
            return Err(LanternError::CrcMismatch { expected, computed });
        }
        Ok(())
    }

    /// CRC of the packet encoded with a zero CRC field
    pub fn compute_crc(&self, packet: &Packet) -> LanternResult<u32> {
        let mut zeroed = packet.clone();
        zeroed.set_crc(0);
        Ok(crc32(&self.pack(&zeroed)?))
    }

    /// Patch the header CRC and return the final wire bytes
    pub fn seal(&self, packet: &mut Packet) -> LanternResult<Vec<u8>> {
        let crc = self.compute_crc(packet)?;
        packet.set_crc(crc);
        self.pack(packet)
    }

    /// Build a complete packet from a header and payload: measure the payload
    /// for `data_length`, then seal it. The header must already carry
    /// `system_id`, `packet_id` and, for telemetry, `packet_type`.
    pub fn frame(&self, mut header: Fields, data: Fields) -> LanternResult<(Packet, Vec<u8>)> {
        let system_id = int_of(&header, "system_id")?;
        let payload = match Direction::from_system_id(system_id) {
            Direction::Telemetry => self.pack_telemetry_payload(int_of(&header, "packet_type")?, &data)?,
            Direction::Telecommand => self.pack_command_payload(&data)?,
        };
        header.insert("data_length".to_string(), Value::from(payload.len()));
        header.insert("crc".to_string(), Value::Int(0));

        let mut packet = Packet::new(header, data);
        let bytes = self.seal(&mut packet)?;
        Ok((packet, bytes))
    }

    fn pack_group(&self, node: &SchemaNode, fields: &Fields, out: &mut Vec<u8>) -> LanternResult<()> {
        let begin = out.len();
        for (key, child) in node.children() {
            match key.single() {
                Some(name) => {
                    let value = fields
                        .get(name)
                        .ok_or_else(|| LanternError::encode(format!("missing field '{}'", name)))?;
                    self.pack_field(name, child, value, out)?;
                }
                None => pack_row(key, child, fields, out)?,
            }
        }
        check_packed_length(node, out.len() - begin)
    }

    fn pack_field(&self, name: &str, node: &SchemaNode, value: &Value, out: &mut Vec<u8>) -> LanternResult<()> {
        let format = match node {
            SchemaNode::Group { .. } => {
                let fields = value
                    .as_map()
                    .ok_or_else(|| LanternError::encode(format!("field '{}' must be a group", name)))?;
                return self.pack_group(node, fields, out);
            }
            SchemaNode::Leaf { format, .. } => format,
        };

        let begin = out.len();
        if name == ERROR_FIELD {
            let coded = self.error_codes(value)?;
            pack_leaf(format, &coded, out)?;
        } else {
            pack_leaf(format, value, out)?;
        }
        check_packed_length(node, out.len() - begin)
    }

    fn error_codes(&self, value: &Value) -> LanternResult<Value> {
        match value {
            Value::Text(name) => Ok(Value::Int(self.schemas.errors().code(name)?)),
            Value::List(items) => items
                .iter()
                .map(|item| self.error_codes(item))
                .collect::<LanternResult<Vec<_>>>()
                .map(Value::List),
            other => Ok(other.clone()),
        }
    }

    fn unpack_group(&self, node: &SchemaNode, bytes: &[u8], out: &mut Fields) -> LanternResult<()> {
        let region = slice(node, bytes)?;
        for (key, child) in node.children() {
            match (key.single(), child) {
                (Some(name), SchemaNode::Group { .. }) => {
                    let mut nested = Fields::new();
                    self.unpack_group(child, region, &mut nested)?;
                    out.insert(name.to_string(), Value::Map(nested));
                }
                (Some(name), SchemaNode::Leaf { format, .. }) => {
                    let value = self.unpack_leaf(name, format, slice(child, region)?)?;
                    out.insert(name.to_string(), value);
                }
                (None, SchemaNode::Leaf { format, .. }) => {
                    let tuples = format.decode(slice(child, region)?)?;
                    for (i, name) in key.names().iter().enumerate() {
                        let series = tuples.iter().map(|t| t[i].clone()).collect();
                        out.insert(name.clone(), Value::List(series));
                    }
                }
                (None, SchemaNode::Group { .. }) => {
                    return Err(LanternError::schema(format!("row field '{}' is a group", key)));
                }
            }
        }
        Ok(())
    }

    fn unpack_leaf(&self, name: &str, format: &FormatToken, raw: &[u8]) -> LanternResult<Value> {
        if format.is_passthrough() {
            return Ok(Value::Bytes(raw.to_vec()));
        }

        let mut values: Vec<Value> = format
            .decode(raw)?
            .into_iter()
            .filter_map(|tuple| tuple.into_iter().next())
            .collect();

        if format.is_byte_run() {
            let joined = values
                .iter()
                .filter_map(Value::as_bytes)
                .flatten()
                .copied()
                .collect();
            return Ok(Value::Bytes(joined));
        }

        if name == ERROR_FIELD {
            values = values
                .iter()
                .map(|v| {
                    let code = v.as_i64().ok_or_else(|| {
                        LanternError::malformed(format!("error code is not an integer: {}", v))
                    })?;
                    self.schemas.errors().name(code).map(Value::from)
                })
                .collect::<LanternResult<_>>()?;
        }

        if values.len() == 1 {
            return Ok(values.remove(0));
        }
        Ok(Value::List(values))
    }
}

fn pack_leaf(format: &FormatToken, value: &Value, out: &mut Vec<u8>) -> LanternResult<()> {
    match value {
        Value::List(items) => {
            for item in items {
                format.encode_tuple(&[item], out)?;
            }
            Ok(())
        }
        Value::Bytes(bytes) if format.is_byte_run() && bytes.len() > format.tuple_size() => {
            if bytes.len() % format.tuple_size() != 0 {
                return Err(LanternError::encode(format!(
                    "{} bytes do not fill whole '{}' strings",
                    bytes.len(),
                    format
                )));
            }
            for chunk in bytes.chunks(format.tuple_size()) {
                format.encode_tuple(&[&Value::Bytes(chunk.to_vec())], out)?;
            }
            Ok(())
        }
        scalar => format.encode_tuple(&[scalar], out),
    }
}

fn pack_row(key: &FieldKey, node: &SchemaNode, fields: &Fields, out: &mut Vec<u8>) -> LanternResult<()> {
    let format = match node {
        SchemaNode::Leaf { format, .. } => format,
        SchemaNode::Group { .. } => {
            return Err(LanternError::schema(format!("row field '{}' is a group", key)))
        }
    };

    let mut series: Vec<Vec<&Value>> = Vec::with_capacity(key.names().len());
    for name in key.names() {
        let value = fields
            .get(name)
            .ok_or_else(|| LanternError::encode(format!("missing field '{}'", name)))?;
        series.push(match value {
            Value::List(items) => items.iter().collect(),
            scalar => vec![scalar],
        });
    }

    let rows = series.first().map(Vec::len).unwrap_or(0);
    if series.iter().any(|s| s.len() != rows) {
        return Err(LanternError::encode(format!("fields '{}' differ in length", key)));
    }

    let begin = out.len();
    for i in 0..rows {
        let tuple: Vec<&Value> = series.iter().map(|s| s[i]).collect();
        format.encode_tuple(&tuple, out)?;
    }
    check_packed_length(node, out.len() - begin)
}

fn check_packed_length(node: &SchemaNode, written: usize) -> LanternResult<()> {
    match node.length() {
        Some(length) if length != written => Err(LanternError::encode(format!(
            "field of {} bytes encoded to {} bytes",
            length, written
        ))),
        _ => Ok(()),
    }
}

fn slice<'a>(node: &SchemaNode, bytes: &'a [u8]) -> LanternResult<&'a [u8]> {
    let start = node.start();
    if start > bytes.len() {
        return Err(LanternError::malformed(format!(
            "field starts at {} past the end of {} bytes",
            start,
            bytes.len()
        )));
    }
    match node.length() {
        None => Ok(&bytes[start..]),
        Some(length) if start + length <= bytes.len() => Ok(&bytes[start..start + length]),
        Some(length) => Err(LanternError::malformed(format!(
            "field needs bytes {}..{} of {}",
            start,
            start + length,
            bytes.len()
        ))),
    }
}

fn int_of(fields: &Fields, name: &str) -> LanternResult<i64> {
    fields
        .get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| LanternError::encode(format!("field '{}' missing or not an integer", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use crate::format::Code;
    use crate::schema::tests::workspace_store;

    fn codec() -> Codec {
        Codec::new(Arc::new(workspace_store()))
    }

    /// Plausible values for every field of a layout
    fn sample_fields(codec: &Codec, node: &SchemaNode) -> Fields {
        let mut fields = Fields::new();
        for (key, child) in node.children() {
            match (key.single(), child) {
                (Some(name), SchemaNode::Group { .. }) => {
                    fields.insert(name.to_string(), Value::Map(sample_fields(codec, child)));
                }
                (Some(name), SchemaNode::Leaf { length, format, .. }) => {
                    let value = if name == ERROR_FIELD {
                        Value::from("ERR_BUSY")
                    } else {
                        let tuples = length.map(|l| l / format.tuple_size()).unwrap_or(3);
                        sample_leaf(format, tuples)
                    };
                    fields.insert(name.to_string(), value);
                }
                (None, SchemaNode::Leaf { format, .. }) => {
                    for (i, name) in key.names().iter().enumerate() {
                        let series = (0..3).map(|n| sample_scalar(format, n + i)).collect();
                        fields.insert(name.clone(), Value::List(series));
                    }
                }
                (None, SchemaNode::Group { .. }) => unreachable!(),
            }
        }
        fields
    }

    fn sample_leaf(format: &FormatToken, tuples: usize) -> Value {
        if format.is_passthrough() {
            return Value::Bytes(vec![1, 2, 3]);
        }
        if format.is_byte_run() {
            return Value::Bytes(vec![b'z'; tuples * format.tuple_size()]);
        }
        match tuples {
            1 => sample_scalar(format, 1),
            n => Value::List((0..n).map(|i| sample_scalar(format, i)).collect()),
        }
    }

    fn sample_scalar(format: &FormatToken, n: usize) -> Value {
        let code = match format {
            FormatToken::Packed { codes, .. } => codes.iter().find(|c| **c != Code::Pad).copied(),
            FormatToken::Passthrough => None,
        };
        match code {
            Some(Code::Bool) => Value::Bool(n % 2 == 1),
            Some(Code::F32) | Some(Code::F64) => Value::Float(n as f64 + 0.5),
            Some(Code::Bytes(size)) => Value::Bytes(vec![b'a'; size]),
            _ => Value::Int(n as i64 + 1),
        }
    }

    fn telecommand(codec: &Codec, command_id: i64) -> (Packet, Vec<u8>) {
        let mut data = sample_fields(codec, &codec.schemas().command(command_id).unwrap().root);
        data.insert("command_id".into(), Value::Int(command_id));
        codec
            .frame(fields! { "system_id" => 0x81, "packet_id" => 0 }, data)
            .unwrap()
    }

    fn telemetry(codec: &Codec, packet_type: i64, reply_to: i64) -> (Packet, Vec<u8>) {
        let mut data = sample_fields(codec, &codec.schemas().telemetry_type(packet_type).unwrap().root);
        if Some(packet_type) == codec.schemas().reply_type() {
            data.insert("command_id".into(), Value::Int(reply_to));
            let reply = sample_fields(codec, &codec.schemas().reply(reply_to).unwrap().root);
            data.insert(REPLY_DATA_FIELD.into(), Value::Map(reply));
        }
        codec
            .frame(
                fields! { "system_id" => 1, "packet_type" => packet_type, "packet_id" => 5 },
                data,
            )
            .unwrap()
    }

    #[test]
    fn test_echo_scenario() {
        let codec = codec();
        let (packet, bytes) = codec
            .frame(
                fields! { "system_id" => 1 | 0x80, "packet_id" => 0 },
                fields! { "command_id" => 1, "params" => fields! { "message" => vec![1, 2, 3] } },
            )
            .unwrap();

        assert_eq!(bytes[0] & 0x80, 0x80);
        assert_eq!(packet.packet_id(), Some(0));
        assert_ne!(packet.crc(), Some(0));
        assert_eq!(packet.header_field("data_length").unwrap(), 4);
        assert_eq!(&bytes[9..], &[1, 1, 2, 3]);

        let unpacked = codec.unpack(&bytes).unwrap();
        assert_eq!(unpacked, packet);
        assert_eq!(
            unpacked.params().unwrap()["message"],
            Value::from(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_round_trip_every_command() {
        let codec = codec();
        for command_id in codec.schemas().command_ids() {
            let (packet, bytes) = telecommand(&codec, command_id);
            let unpacked = codec.unpack(&bytes).unwrap();
            assert_eq!(unpacked, packet, "command {}", command_id);
            assert_eq!(codec.pack(&unpacked).unwrap(), bytes);
        }
    }

    #[test]
    fn test_round_trip_every_telemetry_type() {
        let codec = codec();
        let reply_type = codec.schemas().reply_type().unwrap();
        for packet_type in codec.schemas().packet_types() {
            if packet_type == reply_type {
                continue;
            }
            let (packet, bytes) = telemetry(&codec, packet_type, 0);
            assert_eq!(codec.unpack(&bytes).unwrap(), packet, "type {}", packet_type);
        }
    }

    #[test]
    fn test_round_trip_every_reply() {
        let codec = codec();
        let reply_type = codec.schemas().reply_type().unwrap();
        for command_id in codec.schemas().command_ids() {
            if !codec.schemas().has_reply(command_id) {
                continue;
            }
            let (packet, bytes) = telemetry(&codec, reply_type, command_id);
            let unpacked = codec.unpack(&bytes).unwrap();
            assert_eq!(unpacked, packet, "reply to {}", command_id);
            assert!(unpacked.reply_data().is_some());
            assert!(codec.check_crc(&unpacked).unwrap());
        }
    }

    #[test]
    fn test_crc_detects_flipped_bytes() {
        let codec = codec();
        let (packet, bytes) = codec
            .frame(
                fields! { "system_id" => 0x81, "packet_id" => 3 },
                fields! { "command_id" => 1, "params" => fields! { "message" => vec![9, 8, 7, 6] } },
            )
            .unwrap();
        assert!(codec.check_crc(&packet).unwrap());

        // every byte after the command id still decodes, with a stale crc
        for i in 10..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x5a;
            let unpacked = codec.unpack(&corrupted).unwrap();
            assert!(!codec.check_crc(&unpacked).unwrap(), "byte {}", i);
            assert!(matches!(
                codec.verify_crc(&unpacked),
                Err(LanternError::CrcMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_crc_covers_header() {
        let codec = codec();
        let (mut packet, _) = telecommand(&codec, 4);
        packet.header.insert("packet_id".into(), Value::Int(99));
        assert!(!codec.check_crc(&packet).unwrap());
    }

    #[test]
    fn test_error_field_translation() {
        let codec = codec();
        let (_, bytes) = codec
            .frame(
                fields! { "system_id" => 1, "packet_type" => 2, "packet_id" => 0 },
                fields! { "packet_id" => 12, "command_id" => 1, "error" => "ERR_BUSY" },
            )
            .unwrap();
        // error code 1, little endian, at the end of the payload
        assert_eq!(&bytes[bytes.len() - 2..], &[1, 0]);
        let unpacked = codec.unpack(&bytes).unwrap();
        assert_eq!(unpacked.error_name(), Some("ERR_BUSY"));
        assert_eq!(unpacked.correlation_id(), Some(12));
    }

    #[test]
    fn test_unknown_error_name() {
        let codec = codec();
        let result = codec.frame(
            fields! { "system_id" => 1, "packet_type" => 2, "packet_id" => 0 },
            fields! { "packet_id" => 0, "command_id" => 1, "error" => "ERR_NOPE" },
        );
        assert!(matches!(result, Err(LanternError::UnknownErrorName(_))));
    }

    #[test]
    fn test_unknown_error_code() {
        let codec = codec();
        let (_, mut bytes) = telemetry(&codec, 2, 0);
        let n = bytes.len();
        bytes[n - 2] = 0xee;
        assert!(matches!(codec.unpack(&bytes), Err(LanternError::UnknownErrorCode(0xee))));
    }

    #[test]
    fn test_non_integer_error_code() {
        let tmtc: serde_json::Value =
            serde_json::from_str(include_str!("../../schemas/tmtc.json")).unwrap();
        let errors: serde_json::Value =
            serde_json::from_str(include_str!("../../schemas/errors.json")).unwrap();
        let telemetry = serde_json::json!({
            "eack": {"packet_type": 2, "format": {"start": 0, "length": 4,
                "error": {"start": 0, "length": 4, "format": "<f"}}}
        });
        let empty = serde_json::json!({});
        let store = SchemaStore::from_values(&tmtc, &empty, &telemetry, &empty, &errors).unwrap();
        let codec = Codec::new(Arc::new(store));

        let (_, bytes) = codec
            .frame(
                fields! { "system_id" => 1, "packet_type" => 2, "packet_id" => 0 },
                fields! { "error" => 0.5 },
            )
            .unwrap();
        assert!(matches!(codec.unpack(&bytes), Err(LanternError::Malformed(_))));
    }

    #[test]
    fn test_row_fields_spread() {
        let codec = codec();
        let reply_type = codec.schemas().reply_type().unwrap();
        let reply = fields! {
            "sequence" => 2,
            "npoints" => 500,
            "startpoint" => 200,
            "xmod" => vec![0.5f32, 1.5],
            "ymod" => vec![-0.5f32, -1.5],
        };
        let (_, bytes) = codec
            .frame(
                fields! { "system_id" => 1, "packet_type" => reply_type, "packet_id" => 0 },
                fields! { "packet_id" => 4, "command_id" => 11, "tc_reply_data" => reply.clone() },
            )
            .unwrap();
        let unpacked = codec.unpack(&bytes).unwrap();
        let data = unpacked.reply_data().unwrap();
        assert_eq!(data, &reply);
        assert_eq!(data["xmod"].element_count(), 2);
    }

    #[test]
    fn test_row_length_mismatch() {
        let codec = codec();
        let result = codec.pack_command_payload(&fields! {
            "command_id" => 12,
            "params" => fields! {
                "startpoint" => 0, "npoints" => 2,
                "xmod" => vec![1.0f32, 2.0], "ymod" => vec![1.0f32],
            },
        });
        assert!(matches!(result, Err(LanternError::Encode(_))));
    }

    #[test]
    fn test_byte_string_joined() {
        let codec = codec();
        let reply_type = codec.schemas().reply_type().unwrap();
        let (_, bytes) = codec
            .frame(
                fields! { "system_id" => 1, "packet_type" => reply_type, "packet_id" => 0 },
                fields! {
                    "packet_id" => 0,
                    "command_id" => 5,
                    "tc_reply_data" => fields! { "version" => 3, "name" => "lantern" },
                },
            )
            .unwrap();
        let unpacked = codec.unpack(&bytes).unwrap();
        let mut expected = b"lantern".to_vec();
        expected.resize(16, 0);
        assert_eq!(unpacked.reply_data().unwrap()["name"], Value::Bytes(expected));
    }

    #[test]
    fn test_truncated_is_malformed() {
        let codec = codec();
        let (_, bytes) = telemetry(&codec, 4, 0);
        for len in [1, 5, 9, bytes.len() - 1] {
            assert!(
                matches!(codec.unpack(&bytes[..len]), Err(LanternError::Malformed(_))),
                "length {}",
                len
            );
        }
        assert!(matches!(codec.unpack(&[]), Err(LanternError::Malformed(_))));
    }

    #[test]
    fn test_unknown_packet_type() {
        let codec = codec();
        let (_, mut bytes) = telemetry(&codec, 4, 0);
        bytes[1] = 0x7f;
        assert!(matches!(codec.unpack(&bytes), Err(LanternError::UnknownPacketType(0x7f))));
    }

    #[test]
    fn test_unknown_command() {
        let codec = codec();
        let (_, mut bytes) = telecommand(&codec, 4);
        bytes[9] = 0xfe;
        assert!(matches!(codec.unpack(&bytes), Err(LanternError::UnknownCommand(0xfe))));
        assert!(matches!(
            codec.pack_command_payload(&fields! { "command_id" => 0xfe }),
            Err(LanternError::UnknownCommand(0xfe))
        ));
    }

    #[test]
    fn test_missing_field() {
        let codec = codec();
        let result = codec.pack_command_payload(&fields! { "command_id" => 9, "params" => fields! { "x" => 1.0 } });
        assert!(matches!(result, Err(LanternError::Encode(_))));
    }
}
