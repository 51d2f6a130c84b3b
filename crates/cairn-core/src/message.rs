//! Message model — typed field schemas and tagged message records.
//!
//! A `MessageType` declares the field schema of one kind of message; it is
//! immutable and process-global. A `Message` is a tagged record whose fields
//! are type-checked against its schema at construction. Filters in the
//! dispatch layer match on the same schema, so a field set with the wrong
//! scalar type is rejected before it can ever reach the wire.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Peer identifier — stable for the lifetime of a peer's keypair.
pub type PeerId = [u8; 32];

/// Short rendering of a peer id for diagnostics.
pub fn short_id(id: &PeerId) -> String {
    hex::encode(&id[..4])
}

// ── Scalars ──────────────────────────────────────────────────────────────────

/// The scalar types a message field may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    Bytes,
    Str,
}

/// A field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Bytes(Bytes),
    Str(String),
}

impl Value {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Value::Bool(_) => ScalarType::Bool,
            Value::I8(_) => ScalarType::I8,
            Value::I16(_) => ScalarType::I16,
            Value::I32(_) => ScalarType::I32,
            Value::I64(_) => ScalarType::I64,
            Value::Bytes(_) => ScalarType::Bytes,
            Value::Str(_) => ScalarType::Str,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::I8(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::I16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

// ── Message types ────────────────────────────────────────────────────────────

/// A named message schema: an ordered set of `(field, scalar type)` pairs.
///
/// Instances are `static` and compared by name, so a type name must be unique
/// within the process.
#[derive(Debug)]
pub struct MessageType {
    name: &'static str,
    fields: &'static [(&'static str, ScalarType)],
}

impl MessageType {
    pub const fn new(
        name: &'static str,
        fields: &'static [(&'static str, ScalarType)],
    ) -> Self {
        Self { name, fields }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The declared type of a field, if the schema has it.
    pub fn field_type(&self, field: &str) -> Option<ScalarType> {
        self.fields
            .iter()
            .find(|(n, _)| *n == field)
            .map(|(_, t)| *t)
    }

    /// The canonical `'static` spelling of a field name.
    pub fn field_name(&self, field: &str) -> Option<&'static str> {
        self.fields.iter().find(|(n, _)| *n == field).map(|(n, _)| *n)
    }

    /// Check a value against the schema. `Ok` carries the canonical field
    /// name so callers can store it without copying.
    pub fn check(&self, field: &str, value: &Value) -> Result<&'static str, MessageError> {
        let Some((name, expected)) = self.fields.iter().find(|(n, _)| *n == field) else {
            return Err(MessageError::UnknownField {
                mtype: self.name,
                field: field.to_string(),
            });
        };
        let got = value.scalar_type();
        if got != *expected {
            return Err(MessageError::IncorrectType {
                mtype: self.name,
                field: field.to_string(),
                expected: *expected,
                got,
            });
        }
        Ok(name)
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for MessageType {}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("{mtype}.{field}: expected {expected:?}, got {got:?}")]
    IncorrectType {
        mtype: &'static str,
        field: String,
        expected: ScalarType,
        got: ScalarType,
    },

    #[error("{mtype} has no field named {field}")]
    UnknownField { mtype: &'static str, field: String },

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("malformed message payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// A tagged record conforming to one `MessageType`.
///
/// The source peer and its boot id are stamped by the link on receipt; a
/// locally constructed message has no source.
#[derive(Debug, Clone)]
pub struct Message {
    mtype: &'static MessageType,
    fields: Vec<(&'static str, Value)>,
    source: Option<PeerId>,
    boot_id: u64,
}

/// The serialized shape of a message. Source and boot id travel with the
/// link, not the payload.
#[derive(Serialize, Deserialize)]
struct WireMessage {
    name: String,
    fields: Vec<(String, Value)>,
}

impl Message {
    pub fn new(mtype: &'static MessageType) -> Self {
        Self {
            mtype,
            fields: Vec::new(),
            source: None,
            boot_id: 0,
        }
    }

    /// Set a field, checking it against the schema. Setting a field twice
    /// overwrites the value in place.
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Result<Self, MessageError> {
        let value = value.into();
        let name = self.mtype.check(field, &value)?;
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        Ok(self)
    }

    /// Schema-exempt append, for constructors that own their schema.
    pub(crate) fn push(mut self, name: &'static str, value: Value) -> Self {
        self.fields.push((name, value));
        self
    }

    pub fn mtype(&self) -> &'static MessageType {
        self.mtype
    }

    pub fn is(&self, t: &MessageType) -> bool {
        self.mtype == t
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| *n == field).map(|(_, v)| v)
    }

    pub fn is_set(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn u64_field(&self, field: &str) -> Option<u64> {
        match self.get(field) {
            Some(Value::I64(v)) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn u32_field(&self, field: &str) -> Option<u32> {
        match self.get(field) {
            Some(Value::I32(v)) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn bytes_field(&self, field: &str) -> Option<&Bytes> {
        match self.get(field) {
            Some(Value::Bytes(v)) => Some(v),
            _ => None,
        }
    }

    pub fn source(&self) -> Option<PeerId> {
        self.source
    }

    /// Boot id of the source peer at the moment of receipt.
    pub fn source_boot_id(&self) -> u64 {
        self.boot_id
    }

    /// Stamp the origin of a received message. Called by the link layer.
    pub fn received_from(mut self, source: PeerId, boot_id: u64) -> Self {
        self.source = Some(source);
        self.boot_id = boot_id;
        self
    }

    /// Serialize for transmission. The source stamp is not carried.
    pub fn to_wire(&self) -> Result<Bytes, MessageError> {
        let wire = WireMessage {
            name: self.mtype.name.to_string(),
            fields: self
                .fields
                .iter()
                .map(|(n, v)| (n.to_string(), v.clone()))
                .collect(),
        };
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    /// Decode a message, resolving the type name through `lookup`.
    pub fn from_wire(
        raw: &[u8],
        lookup: impl Fn(&str) -> Option<&'static MessageType>,
    ) -> Result<Message, MessageError> {
        let wire: WireMessage = serde_json::from_slice(raw)?;
        let Some(mtype) = lookup(&wire.name) else {
            return Err(MessageError::UnknownType(wire.name));
        };
        let mut msg = Message::new(mtype);
        for (name, value) in wire.fields {
            msg = msg.set(&name, value)?;
        }
        Ok(msg)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{} from {}", self.mtype, short_id(src)),
            None => write!(f, "{} (local)", self.mtype),
        }
    }
}
