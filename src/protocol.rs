//! Wire protocol between instrument managers and instrument servers.
//!
//! Every message is one bincode-encoded [`Request`] or [`Response`] carried in
//! a length-delimited frame (4-byte big-endian length prefix, at most
//! [`MAX_FRAME_BYTES`]). A connection carries strictly alternating
//! request/response pairs; the client never pipelines.
//!
//! Decoding is bounded twice: no message may claim more than
//! [`MAX_FRAME_BYTES`] of payload, and [`Value::List`] nesting stops at
//! [`MAX_VALUE_DEPTH`] levels, so a hostile frame cannot exhaust memory or the
//! stack.
//!
//! Quantities travel as `(magnitude, unit string)` in [`Value::Quantity`] and
//! carry no unit-registry binding. The receiving side rebuilds them in its own
//! registry (see [`crate::value::AttrValue::from_wire`]).

use std::fmt;

use bincode::Options;
use bytes::Bytes;
use serde::de::{self, DeserializeOwned, DeserializeSeed, EnumAccess, SeqAccess, VariantAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

/// Upper bound for a single encoded message.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Deepest accepted nesting of [`Value::List`].
pub const MAX_VALUE_DEPTH: usize = 32;

/// Protocol-level failures (encoding, decoding, unexpected replies).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("Unexpected response to {request}: {response}")]
    UnexpectedResponse {
        request: &'static str,
        response: String,
    },
}

/// Attribute value as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Quantity { magnitude: f64, unit: String },
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Quantity { magnitude, unit } => write!(f, "{magnitude} {unit}"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ValueSeed { depth: 0 }.deserialize(deserializer)
    }
}

const VALUE_VARIANTS: &[&str] = &["Null", "Bool", "Int", "Float", "Text", "Quantity", "List"];

#[derive(Deserialize)]
#[serde(variant_identifier)]
enum ValueTag {
    Null,
    Bool,
    Int,
    Float,
    Text,
    Quantity,
    List,
}

/// Deserializes one [`Value`] found `depth` lists deep.
struct ValueSeed {
    depth: usize,
}

impl<'de> DeserializeSeed<'de> for ValueSeed {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        if self.depth > MAX_VALUE_DEPTH {
            return Err(de::Error::custom(format!(
                "value nested deeper than {MAX_VALUE_DEPTH} levels"
            )));
        }
        deserializer.deserialize_enum("Value", VALUE_VARIANTS, self)
    }
}

impl<'de> Visitor<'de> for ValueSeed {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an attribute value")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<Value, A::Error> {
        let (tag, variant) = data.variant::<ValueTag>()?;
        match tag {
            ValueTag::Null => variant.unit_variant().map(|()| Value::Null),
            ValueTag::Bool => variant.newtype_variant().map(Value::Bool),
            ValueTag::Int => variant.newtype_variant().map(Value::Int),
            ValueTag::Float => variant.newtype_variant().map(Value::Float),
            ValueTag::Text => variant.newtype_variant().map(Value::Text),
            ValueTag::Quantity => variant.struct_variant(&["magnitude", "unit"], QuantityVisitor),
            ValueTag::List => variant
                .newtype_variant_seed(ListSeed {
                    depth: self.depth + 1,
                })
                .map(Value::List),
        }
    }
}

struct QuantityVisitor;

impl<'de> Visitor<'de> for QuantityVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a quantity")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let magnitude = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let unit = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        Ok(Value::Quantity { magnitude, unit })
    }
}

/// Items of a [`Value::List`] sitting `depth` lists deep.
struct ListSeed {
    depth: usize,
}

impl<'de> DeserializeSeed<'de> for ListSeed {
    type Value = Vec<Value>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Vec<Value>, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ListSeed {
    type Value = Vec<Value>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a list of values")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<Value>, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(item) = seq.next_element_seed(ValueSeed { depth: self.depth })? {
            items.push(item);
        }
        Ok(items)
    }
}

/// Static description of one device attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeInfo {
    /// Attribute name.
    pub name: String,
    /// Whether `set` is accepted.
    pub writable: bool,
    /// Canonical unit of quantity-valued attributes.
    pub unit: Option<String>,
}

impl AttributeInfo {
    /// Read-only attribute.
    pub fn read_only(name: &str, unit: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            writable: false,
            unit: unit.map(str::to_string),
        }
    }

    /// Read/write attribute.
    pub fn read_write(name: &str, unit: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            writable: true,
            unit: unit.map(str::to_string),
        }
    }
}

/// Client → server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    ListDevices,
    ListAttributes {
        device: String,
    },
    GetAttribute {
        device: String,
        attribute: String,
    },
    SetAttribute {
        device: String,
        attribute: String,
        value: Value,
    },
}

impl Request {
    /// Short operation name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::ListDevices => "list_devices",
            Request::ListAttributes { .. } => "list_attributes",
            Request::GetAttribute { .. } => "get_attribute",
            Request::SetAttribute { .. } => "set_attribute",
        }
    }

    /// Device addressed by the request, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            Request::Ping | Request::ListDevices => None,
            Request::ListAttributes { device }
            | Request::GetAttribute { device, .. }
            | Request::SetAttribute { device, .. } => Some(device),
        }
    }
}

/// Server → client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Handshake reply carrying the server's name.
    Pong { server: String },
    Devices(Vec<String>),
    Attributes(Vec<AttributeInfo>),
    Value(Value),
    Done,
    Error(RemoteError),
}

/// Classification of a failure reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    DeviceNotFound,
    AttributeNotFound,
    ReadOnly,
    InvalidValue,
    Driver,
    Internal,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteErrorKind::DeviceNotFound => "device not found",
            RemoteErrorKind::AttributeNotFound => "attribute not found",
            RemoteErrorKind::ReadOnly => "read only",
            RemoteErrorKind::InvalidValue => "invalid value",
            RemoteErrorKind::Driver => "driver error",
            RemoteErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Error payload of [`Response::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Frame codec shared by both ends of a connection.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// bincode settings shared by both ends; the limit caps what any length
/// prefix inside a message may make the decoder allocate.
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_BYTES as u64)
}

/// Encode one message into a frame payload.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    wire_options()
        .serialize(message)
        .map(Bytes::from)
        .map_err(ProtocolError::Encode)
}

/// Decode one frame payload.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ProtocolError> {
    wire_options()
        .deserialize(frame)
        .map_err(ProtocolError::Decode)
}
