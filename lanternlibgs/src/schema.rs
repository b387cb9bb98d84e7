//! Schema store
//!
//! Packet layouts are not compiled in: five JSON descriptor files describe the
//! envelope of each direction, the payload of every telecommand, every
//! telemetry type and every command reply, plus the error code table. They are
//! parsed once into [`SchemaNode`] trees, validated, and then shared read-only
//! by the codec.
//!
//! A node is a JSON object with `start` and `length` (an integer, or `null` /
//! `"none"` for "remainder of the enclosing slice"). A node with a `format` key
//! is a leaf; any other key of a node names a child. A key listing several
//! names (`"xmod,ymod"`) is a row leaf whose tuples spread into one series per
//! name.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{LanternError, LanternResult};
use crate::format::{FormatToken, PASSTHROUGH_NAMES};
use crate::protocol::Direction;

/// Telemetry type carrying the receive acknowledgment
pub const RACK_KIND: &str = "rack";
/// Telemetry type carrying the execution acknowledgment
pub const EACK_KIND: &str = "eack";
/// Telemetry type carrying command reply data
pub const REPLY_KIND: &str = "tc_reply";

/// Header fields every envelope must define
pub const HEADER_FIELDS: [&str; 4] = ["system_id", "packet_id", "data_length", "crc"];

/// Location of the descriptor files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Descriptors {
    pub folder: PathBuf,
    pub tmtc: String,
    pub tc_packet_data: String,
    pub tm_packet_data: String,
    pub tc_reply_data: String,
    pub errors: String,
}

impl Descriptors {
    /// Descriptor set using the conventional file names inside `folder`
    pub fn in_folder<P: AsRef<Path>>(folder: P) -> Self {
        Self {
            folder: folder.as_ref().to_path_buf(),
            tmtc: "tmtc.json".to_string(),
            tc_packet_data: "tc_packet_data.json".to_string(),
            tm_packet_data: "tm_packet_data.json".to_string(),
            tc_reply_data: "tc_reply_data.json".to_string(),
            errors: "errors.json".to_string(),
        }
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.folder.join(file)
    }
}

/// Field name(s) a schema child is stored under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldKey {
    names: Vec<String>,
}

impl FieldKey {
    pub fn parse(key: &str) -> Self {
        Self {
            names: key.split(',').map(|n| n.trim().to_string()).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The name of a single-field key
    pub fn single(&self) -> Option<&str> {
        match self.names.as_slice() {
            [name] => Some(name),
            _ => None,
        }
    }

    pub fn is_row(&self) -> bool {
        self.names.len() > 1
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names.join(","))
    }
}

/// One node of a packet layout
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    Leaf {
        start: usize,
        /// `None` means "to the end of the enclosing slice"
        length: Option<usize>,
        format: FormatToken,
    },
    Group {
        start: usize,
        length: Option<usize>,
        children: Vec<(FieldKey, SchemaNode)>,
    },
}

impl SchemaNode {
    /// Parse and validate a node tree. `path` is only used in error messages.
    pub fn from_json(path: &str, json: &Json) -> LanternResult<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| LanternError::schema(format!("{}: node must be an object", path)))?;

        let start = obj
            .get("start")
            .and_then(Json::as_u64)
            .ok_or_else(|| LanternError::schema(format!("{}: missing or invalid 'start'", path)))?
            as usize;
        let length = parse_length(path, obj.get("length"))?;

        if let Some(format) = obj.get("format") {
            let token = format
                .as_str()
                .ok_or_else(|| LanternError::schema(format!("{}: 'format' must be a string", path)))?;
            let format = FormatToken::parse(token)
                .map_err(|e| LanternError::schema(format!("{}: {}", path, e)))?;
            if let Some(len) = length {
                if len == 0 || len % format.tuple_size() != 0 {
                    return Err(LanternError::schema(format!(
                        "{}: length {} is not a whole number of '{}' tuples",
                        path, len, format
                    )));
                }
            }
            return Ok(SchemaNode::Leaf { start, length, format });
        }

        let mut children = Vec::new();
        for (key, child) in obj {
            if key == "start" || key == "length" {
                continue;
            }
            let child_path = format!("{}.{}", path, key);
            let field = FieldKey::parse(key);
            let node = SchemaNode::from_json(&child_path, child)?;
            check_field_shape(&child_path, &field, &node)?;
            children.push((field, node));
        }
        check_contiguous(path, length, &children)?;

        Ok(SchemaNode::Group { start, length, children })
    }

    pub fn start(&self) -> usize {
        match self {
            SchemaNode::Leaf { start, .. } | SchemaNode::Group { start, .. } => *start,
        }
    }

    pub fn length(&self) -> Option<usize> {
        match self {
            SchemaNode::Leaf { length, .. } | SchemaNode::Group { length, .. } => *length,
        }
    }

    pub fn children(&self) -> &[(FieldKey, SchemaNode)] {
        match self {
            SchemaNode::Group { children, .. } => children,
            SchemaNode::Leaf { .. } => &[],
        }
    }

    /// Child stored under the single-field key `name`
    pub fn child(&self, name: &str) -> Option<&SchemaNode> {
        self.children()
            .iter()
            .find(|(key, _)| key.single() == Some(name))
            .map(|(_, node)| node)
    }

    pub fn is_group(&self) -> bool {
        matches!(self, SchemaNode::Group { .. })
    }
}

fn parse_length(path: &str, length: Option<&Json>) -> LanternResult<Option<usize>> {
    match length {
        None | Some(Json::Null) => Ok(None),
        Some(Json::String(s)) if PASSTHROUGH_NAMES.contains(&s.as_str()) => Ok(None),
        Some(Json::Number(n)) => n
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| LanternError::schema(format!("{}: invalid length {}", path, n))),
        Some(other) => Err(LanternError::schema(format!("{}: invalid length {}", path, other))),
    }
}

fn check_field_shape(path: &str, field: &FieldKey, node: &SchemaNode) -> LanternResult<()> {
    match node {
        SchemaNode::Leaf { format, .. } => {
            if format.is_passthrough() && field.is_row() {
                return Err(LanternError::schema(format!("{}: row fields cannot be passthrough", path)));
            }
            if !format.is_passthrough() && format.value_count() != field.names().len() {
                return Err(LanternError::schema(format!(
                    "{}: format '{}' yields {} values for {} field(s)",
                    path,
                    format,
                    format.value_count(),
                    field.names().len()
                )));
            }
            Ok(())
        }
        SchemaNode::Group { .. } if field.is_row() => {
            Err(LanternError::schema(format!("{}: row fields must be leaves", path)))
        }
        SchemaNode::Group { .. } => Ok(()),
    }
}

fn check_contiguous(
    path: &str,
    length: Option<usize>,
    children: &[(FieldKey, SchemaNode)],
) -> LanternResult<()> {
    let mut offset = 0;
    let mut open_ended = false;
    for (key, node) in children {
        if open_ended {
            return Err(LanternError::schema(format!(
                "{}.{}: follows a field that runs to the end",
                path, key
            )));
        }
        if node.start() != offset {
            return Err(LanternError::schema(format!(
                "{}.{}: starts at {}, expected {}",
                path,
                key,
                node.start(),
                offset
            )));
        }
        match node.length() {
            Some(len) => offset += len,
            None => open_ended = true,
        }
    }

    if let Some(len) = length {
        if offset > len || (!open_ended && !children.is_empty() && offset != len) {
            return Err(LanternError::schema(format!(
                "{}: fields cover {} bytes of {}",
                path, offset, len
            )));
        }
    }
    Ok(())
}

/// Payload layout registered under a numeric key
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadSchema {
    /// Name of the entry in the descriptor file
    pub name: String,
    /// `command_id` or `packet_type`
    pub key: i64,
    pub root: SchemaNode,
}

/// Bidirectional error code table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorTable {
    code_to_name: BTreeMap<i64, String>,
    name_to_code: HashMap<String, i64>,
}

impl ErrorTable {
    pub fn from_json(json: &Json) -> LanternResult<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| LanternError::schema("errors: table must be an object"))?;

        let mut table = ErrorTable::default();
        for (code, name) in obj {
            let code: i64 = code
                .trim()
                .parse()
                .map_err(|_| LanternError::schema(format!("errors: invalid code '{}'", code)))?;
            let name = name
                .as_str()
                .ok_or_else(|| LanternError::schema(format!("errors: name of code {} must be a string", code)))?;
            table.insert(code, name);
        }
        Ok(table)
    }

    pub fn insert(&mut self, code: i64, name: &str) {
        self.code_to_name.insert(code, name.to_string());
        self.name_to_code.insert(name.to_string(), code);
    }

    pub fn name(&self, code: i64) -> LanternResult<&str> {
        self.code_to_name
            .get(&code)
            .map(String::as_str)
            .ok_or(LanternError::UnknownErrorCode(code))
    }

    pub fn code(&self, name: &str) -> LanternResult<i64> {
        self.name_to_code
            .get(name)
            .copied()
            .ok_or_else(|| LanternError::UnknownErrorName(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.code_to_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code_to_name.is_empty()
    }
}

/// All packet layouts of a link, indexed for lookup
#[derive(Debug, Clone)]
pub struct SchemaStore {
    telemetry: SchemaNode,
    telecommand: SchemaNode,
    commands: HashMap<i64, PayloadSchema>,
    telemetry_types: HashMap<i64, PayloadSchema>,
    replies: HashMap<i64, PayloadSchema>,
    errors: ErrorTable,
    rack_type: Option<i64>,
    eack_type: Option<i64>,
    reply_type: Option<i64>,
}

impl SchemaStore {
    /// Load the five descriptor files. A missing file is fatal.
    pub fn load(descriptors: &Descriptors) -> LanternResult<Self> {
        let tmtc = read_descriptor(&descriptors.path(&descriptors.tmtc))?;
        let commands = read_descriptor(&descriptors.path(&descriptors.tc_packet_data))?;
        let telemetry = read_descriptor(&descriptors.path(&descriptors.tm_packet_data))?;
        let replies = read_descriptor(&descriptors.path(&descriptors.tc_reply_data))?;
        let errors = read_descriptor(&descriptors.path(&descriptors.errors))?;

        let store = Self::from_values(&tmtc, &commands, &telemetry, &replies, &errors)?;
        debug!(
            "Loaded schemas from {}: {} commands, {} telemetry types, {} replies, {} error codes",
            descriptors.folder.display(),
            store.commands.len(),
            store.telemetry_types.len(),
            store.replies.len(),
            store.errors.len()
        );
        Ok(store)
    }

    /// Build a store from already parsed descriptor documents
    pub fn from_values(
        tmtc: &Json,
        commands: &Json,
        telemetry: &Json,
        replies: &Json,
        errors: &Json,
    ) -> LanternResult<Self> {
        let telemetry_envelope = parse_envelope(tmtc, "telemetry")?;
        let telecommand_envelope = parse_envelope(tmtc, "telecommand")?;
        if telemetry_envelope.child("header").and_then(|h| h.child("packet_type")).is_none() {
            return Err(LanternError::schema("telemetry.header: missing 'packet_type'"));
        }

        let commands = parse_table("tc_packet_data", commands, "command_id")?;
        for schema in commands.values() {
            check_command_payload(schema)?;
        }
        let telemetry_types = parse_table("tm_packet_data", telemetry, "packet_type")?;
        let replies = parse_table("tc_reply_data", replies, "command_id")?;
        let errors = ErrorTable::from_json(errors)?;

        let sentinel = |kind: &str| {
            telemetry_types
                .values()
                .find(|schema| schema.name == kind)
                .map(|schema| schema.key)
        };
        let rack_type = sentinel(RACK_KIND);
        let eack_type = sentinel(EACK_KIND);
        let reply_type = sentinel(REPLY_KIND);

        Ok(Self {
            telemetry: telemetry_envelope,
            telecommand: telecommand_envelope,
            commands,
            telemetry_types,
            replies,
            errors,
            rack_type,
            eack_type,
            reply_type,
        })
    }

    /// Envelope layout for a direction
    pub fn envelope(&self, direction: Direction) -> &SchemaNode {
        match direction {
            Direction::Telemetry => &self.telemetry,
            Direction::Telecommand => &self.telecommand,
        }
    }

    /// Header group of a direction's envelope
    pub fn header(&self, direction: Direction) -> LanternResult<&SchemaNode> {
        self.envelope(direction)
            .child("header")
            .ok_or_else(|| LanternError::schema("envelope without header"))
    }

    pub fn command(&self, command_id: i64) -> LanternResult<&PayloadSchema> {
        self.commands
            .get(&command_id)
            .ok_or(LanternError::UnknownCommand(command_id))
    }

    pub fn command_by_name(&self, name: &str) -> Option<&PayloadSchema> {
        self.commands.values().find(|schema| schema.name == name)
    }

    pub fn telemetry_type(&self, packet_type: i64) -> LanternResult<&PayloadSchema> {
        self.telemetry_types
            .get(&packet_type)
            .ok_or(LanternError::UnknownPacketType(packet_type))
    }

    pub fn reply(&self, command_id: i64) -> LanternResult<&PayloadSchema> {
        self.replies
            .get(&command_id)
            .ok_or(LanternError::UnknownCommand(command_id))
    }

    pub fn has_reply(&self, command_id: i64) -> bool {
        self.replies.contains_key(&command_id)
    }

    pub fn errors(&self) -> &ErrorTable {
        &self.errors
    }

    /// Registered command ids, ascending
    pub fn command_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.commands.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Registered telemetry packet types, ascending
    pub fn packet_types(&self) -> Vec<i64> {
        let mut types: Vec<i64> = self.telemetry_types.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn rack_type(&self) -> Option<i64> {
        self.rack_type
    }

    pub fn eack_type(&self) -> Option<i64> {
        self.eack_type
    }

    pub fn reply_type(&self) -> Option<i64> {
        self.reply_type
    }

    /// Number of distinct packet ids the telecommand header can carry
    pub fn packet_id_capacity(&self) -> u64 {
        let width = self
            .telecommand
            .child("header")
            .and_then(|h| h.child("packet_id"))
            .and_then(SchemaNode::length)
            .unwrap_or(2);
        if width >= 8 {
            u64::MAX
        } else {
            1u64 << (8 * width)
        }
    }
}

fn read_descriptor(path: &Path) -> LanternResult<Json> {
    if !path.is_file() {
        return Err(LanternError::SchemaNotFound(path.to_path_buf()));
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

fn parse_envelope(tmtc: &Json, direction: &str) -> LanternResult<SchemaNode> {
    let json = tmtc
        .get(direction)
        .ok_or_else(|| LanternError::schema(format!("tmtc: missing '{}' envelope", direction)))?;
    let node = SchemaNode::from_json(direction, json)?;

    let header = node
        .child("header")
        .filter(|h| h.is_group())
        .ok_or_else(|| LanternError::schema(format!("{}: 'header' group required", direction)))?;
    for field in HEADER_FIELDS {
        if header.child(field).is_none() {
            return Err(LanternError::schema(format!("{}.header: missing '{}'", direction, field)));
        }
    }
    let passthrough_data = matches!(
        node.child("data"),
        Some(SchemaNode::Leaf { format: FormatToken::Passthrough, .. })
    );
    if !passthrough_data {
        return Err(LanternError::schema(format!(
            "{}: 'data' must be a passthrough leaf",
            direction
        )));
    }
    Ok(node)
}

fn parse_table(table: &str, json: &Json, key_field: &str) -> LanternResult<HashMap<i64, PayloadSchema>> {
    let obj = json
        .as_object()
        .ok_or_else(|| LanternError::schema(format!("{}: table must be an object", table)))?;

    let mut schemas = HashMap::new();
    for (name, entry) in obj {
        let path = format!("{}.{}", table, name);
        let key = entry
            .get(key_field)
            .and_then(Json::as_i64)
            .ok_or_else(|| LanternError::schema(format!("{}: missing '{}'", path, key_field)))?;
        let format = entry
            .get("format")
            .ok_or_else(|| LanternError::schema(format!("{}: missing 'format'", path)))?;
        let root = SchemaNode::from_json(&path, format)?;
        if !root.is_group() {
            return Err(LanternError::schema(format!("{}: payload must be a group", path)));
        }

        let schema = PayloadSchema { name: name.clone(), key, root };
        if let Some(previous) = schemas.insert(key, schema) {
            return Err(LanternError::schema(format!(
                "{}: {} {} already used by '{}'",
                path, key_field, key, previous.name
            )));
        }
    }
    Ok(schemas)
}

/// A telecommand payload must lead with its one byte command id, which is
/// how the receiving side selects the layout.
fn check_command_payload(schema: &PayloadSchema) -> LanternResult<()> {
    match schema.root.children().first() {
        Some((key, SchemaNode::Leaf { start: 0, format, .. }))
            if key.single() == Some("command_id")
                && !format.is_passthrough()
                && format.tuple_size() == 1 =>
        {
            Ok(())
        }
        _ => Err(LanternError::schema(format!(
            "tc_packet_data.{}: payload must start with a one byte 'command_id'",
            schema.name
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    /// Descriptor folder shipped with the workspace
    pub(crate) fn workspace_descriptors() -> Descriptors {
        Descriptors::in_folder(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../schemas"))
    }

    pub(crate) fn workspace_store() -> SchemaStore {
        SchemaStore::load(&workspace_descriptors()).unwrap()
    }

    #[test]
    fn test_load_workspace_schemas() {
        let store = workspace_store();
        assert_eq!(store.rack_type(), Some(1));
        assert_eq!(store.eack_type(), Some(2));
        assert_eq!(store.reply_type(), Some(3));
        assert_eq!(store.command(1).unwrap().name, "echo");
        assert_eq!(store.reply(11).unwrap().name, "get_modulation_sequence");
        assert_eq!(store.errors().name(1).unwrap(), "ERR_BUSY");
        assert_eq!(store.errors().code("OK").unwrap(), 0);
        assert_eq!(store.packet_id_capacity(), 65536);
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let mut descriptors = workspace_descriptors();
        descriptors.errors = "does_not_exist.json".to_string();
        match SchemaStore::load(&descriptors) {
            Err(LanternError::SchemaNotFound(path)) => {
                assert!(path.ends_with("does_not_exist.json"))
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_load_renamed_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = workspace_descriptors();
        let mut descriptors = Descriptors::in_folder(dir.path());
        descriptors.errors = "error_codes.json".to_string();
        for (from, to) in [
            (&source.tmtc, &descriptors.tmtc),
            (&source.tc_packet_data, &descriptors.tc_packet_data),
            (&source.tm_packet_data, &descriptors.tm_packet_data),
            (&source.tc_reply_data, &descriptors.tc_reply_data),
            (&source.errors, &descriptors.errors),
        ] {
            std::fs::copy(source.path(from), descriptors.path(to)).unwrap();
        }

        let store = SchemaStore::load(&descriptors).unwrap();
        assert_eq!(store.command_ids(), workspace_store().command_ids());
    }

    #[test]
    fn test_unknown_lookups() {
        let store = workspace_store();
        assert!(matches!(store.command(200), Err(LanternError::UnknownCommand(200))));
        assert!(matches!(store.telemetry_type(99), Err(LanternError::UnknownPacketType(99))));
        assert!(matches!(store.errors().name(77), Err(LanternError::UnknownErrorCode(77))));
        assert!(matches!(
            store.errors().code("ERR_NOPE"),
            Err(LanternError::UnknownErrorName(_))
        ));
    }

    #[test]
    fn test_absent_sentinels_tolerated() {
        let tmtc: Json = serde_json::from_str(include_str!("../../schemas/tmtc.json")).unwrap();
        let telemetry = json!({
            "hk": {"packet_type": 4, "format": {"start": 0, "length": 1,
                "counter": {"start": 0, "length": 1, "format": "B"}}}
        });
        let store = SchemaStore::from_values(&tmtc, &json!({}), &telemetry, &json!({}), &json!({})).unwrap();
        assert_eq!(store.rack_type(), None);
        assert_eq!(store.eack_type(), None);
        assert_eq!(store.reply_type(), None);
    }

    #[test]
    fn test_node_parse() {
        let node = SchemaNode::from_json(
            "n",
            &json!({"start": 0, "length": null,
                    "a": {"start": 0, "length": 2, "format": "<H"},
                    "x,y": {"start": 2, "length": "none", "format": "<ff"}}),
        )
        .unwrap();
        let children = node.children();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].0.single(), Some("a"));
        assert!(children[1].0.is_row());
        assert_eq!(children[1].1.length(), None);
    }

    #[test]
    fn test_gap_rejected() {
        let err = SchemaNode::from_json(
            "n",
            &json!({"start": 0, "length": 4,
                    "a": {"start": 0, "length": 1, "format": "B"},
                    "b": {"start": 2, "length": 2, "format": "<H"}}),
        );
        assert!(matches!(err, Err(LanternError::Schema(_))));
    }

    #[test]
    fn test_remainder_must_be_last() {
        let err = SchemaNode::from_json(
            "n",
            &json!({"start": 0, "length": null,
                    "a": {"start": 0, "length": null, "format": "B"},
                    "b": {"start": 0, "length": 1, "format": "B"}}),
        );
        assert!(matches!(err, Err(LanternError::Schema(_))));
    }

    #[test]
    fn test_leaf_length_multiple() {
        let err = SchemaNode::from_json("n", &json!({"start": 0, "length": 3, "format": "<H"}));
        assert!(matches!(err, Err(LanternError::Schema(_))));
    }

    #[test]
    fn test_row_value_count() {
        let err = SchemaNode::from_json(
            "n",
            &json!({"start": 0, "length": null,
                    "x,y": {"start": 0, "length": null, "format": "<f"}}),
        );
        assert!(matches!(err, Err(LanternError::Schema(_))));
    }

    #[test]
    fn test_command_payload_needs_id() {
        let tmtc: Json = serde_json::from_str(include_str!("../../schemas/tmtc.json")).unwrap();
        let commands = json!({
            "bad": {"command_id": 9, "format": {"start": 0, "length": 2,
                "x": {"start": 0, "length": 2, "format": "<H"}}}
        });
        let err = SchemaStore::from_values(&tmtc, &commands, &json!({}), &json!({}), &json!({}));
        assert!(matches!(err, Err(LanternError::Schema(_))));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let tmtc: Json = serde_json::from_str(include_str!("../../schemas/tmtc.json")).unwrap();
        let leaf = json!({"start": 0, "length": null,
            "command_id": {"start": 0, "length": 1, "format": "B"}});
        let commands = json!({
            "a": {"command_id": 1, "format": leaf.clone()},
            "b": {"command_id": 1, "format": leaf}
        });
        let err = SchemaStore::from_values(&tmtc, &commands, &json!({}), &json!({}), &json!({}));
        assert!(matches!(err, Err(LanternError::Schema(_))));
    }
}
