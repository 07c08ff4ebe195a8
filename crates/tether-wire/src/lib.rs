#![deny(unsafe_code)]

//! Wire-level types for the tether RFC protocol.
//!
//! Every frame on the wire is UTF-8 JSON text. There are four frame shapes:
//!
//! - an [`Invoke`]: a JSON object carrying either a call (`listener`
//!   present) or a return (`success` present),
//! - a lifecycle sentinel: one of the five bare state-name strings
//!   (`"OPENING"`, …), which can never collide with an object-shaped
//!   [`Invoke`] encoding,
//! - a [`HeaderEnvelope`], `{"header":...}`, only legal during handshake,
//! - a confirmation: an object with none of the discriminator fields
//!   (canonically `{}`), only legal as a handshake acceptance reply.
//!
//! Unknown fields are ignored on decode for forward compatibility.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle state of a connector, server, or communicator.
///
/// The wire sentinels are the upper-case state names, so this enum doubles
/// as the sentinel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    None,
    Opening,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    /// The wire spelling of this state.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::None => "NONE",
            SessionState::Opening => "OPENING",
            SessionState::Open => "OPEN",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        Some(match s {
            "NONE" => SessionState::None,
            "OPENING" => SessionState::Opening,
            "OPEN" => SessionState::Open,
            "CLOSING" => SessionState::Closing,
            "CLOSED" => SessionState::Closed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A serialised error description, carried in a failed return's `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDesc {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorDesc {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Best-effort conversion from an arbitrary return `value`.
    ///
    /// A peer that does not follow the `{name, message}` convention still
    /// surfaces as a readable error rather than a decode failure.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<ErrorDesc>(value.clone()) {
            Ok(desc) => desc,
            Err(_) => ErrorDesc::new("Error", value.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// A positional call parameter: an opaque JSON value, or a reference to a
/// callable the sender exported under a handle uid.
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    Value(Value),
    Handle { uid: u64, retain: bool },
}

impl Parameter {
    fn from_value(value: Value) -> Self {
        if let Value::Object(map) = &value {
            if map.get("handle").and_then(Value::as_bool) == Some(true) {
                if let Some(uid) = map.get("uid").and_then(Value::as_u64) {
                    let retain = map.get("retain").and_then(Value::as_bool).unwrap_or(false);
                    return Parameter::Handle { uid, retain };
                }
            }
        }
        Parameter::Value(value)
    }
}

impl Serialize for Parameter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Parameter::Value(value) => value.serialize(serializer),
            Parameter::Handle { uid, retain } => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("handle", &true)?;
                map.serialize_entry("uid", uid)?;
                map.serialize_entry("retain", retain)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Parameter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Parameter::from_value(Value::deserialize(deserializer)?))
    }
}

/// The invocation message: a call travelling to a provider, or the return
/// travelling back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Invoke {
    Call {
        uid: u64,
        listener: String,
        parameters: Vec<Parameter>,
    },
    Return {
        uid: u64,
        success: bool,
        value: Value,
    },
}

impl Invoke {
    pub fn uid(&self) -> u64 {
        match self {
            Invoke::Call { uid, .. } | Invoke::Return { uid, .. } => *uid,
        }
    }
}

/// The handshake header envelope: `{"header":H}` with user-defined `H`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderEnvelope {
    pub header: Value,
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A lifecycle sentinel (bare state-name string).
    Sentinel(SessionState),
    /// A call or return.
    Invoke(Invoke),
    /// A handshake header envelope.
    Header(HeaderEnvelope),
    /// A handshake acceptance reply (empty-object frame).
    Confirm,
}

/// Error decoding a wire frame.
#[derive(Debug)]
pub enum CodecError {
    /// The text is not valid JSON.
    Json(serde_json::Error),
    /// A string frame that is not one of the five sentinels.
    UnknownSentinel(String),
    /// A JSON value of a shape that is not a frame (array, number, …).
    InvalidFrame(String),
    /// An object frame with a discriminator field of the wrong type or with
    /// required fields missing.
    MalformedInvoke(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Json(e) => write!(f, "invalid frame JSON: {e}"),
            CodecError::UnknownSentinel(s) => write!(f, "unknown sentinel: {s:?}"),
            CodecError::InvalidFrame(context) => write!(f, "invalid frame: {context}"),
            CodecError::MalformedInvoke(context) => write!(f, "malformed invoke: {context}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Json(e)
    }
}

/// Encode a frame as one line of UTF-8 JSON text.
pub fn encode_frame(frame: &Frame) -> String {
    let encoded = match frame {
        Frame::Sentinel(state) => serde_json::to_string(state),
        Frame::Invoke(invoke) => serde_json::to_string(invoke),
        Frame::Header(envelope) => serde_json::to_string(envelope),
        Frame::Confirm => Ok("{}".to_string()),
    };
    // All frame shapes serialise infallibly: they are built from Value,
    // strings, and integers.
    encoded.unwrap_or_else(|_| "{}".to_string())
}

/// Decode one frame of UTF-8 JSON text.
pub fn decode_frame(text: &str) -> Result<Frame, CodecError> {
    decode_value(serde_json::from_str(text)?)
}

/// Decode a frame from an already-parsed JSON value.
pub fn decode_value(value: Value) -> Result<Frame, CodecError> {
    match value {
        Value::String(s) => match SessionState::from_wire(&s) {
            Some(state) => Ok(Frame::Sentinel(state)),
            None => Err(CodecError::UnknownSentinel(s)),
        },
        Value::Object(map) => decode_object(map),
        other => Err(CodecError::InvalidFrame(format!(
            "expected object or sentinel string, got {other}"
        ))),
    }
}

fn decode_object(mut map: Map<String, Value>) -> Result<Frame, CodecError> {
    if map.contains_key("listener") {
        let uid = require_uid(&map)?;
        let listener = match map.remove("listener") {
            Some(Value::String(s)) => s,
            _ => {
                return Err(CodecError::MalformedInvoke("listener must be a string".into()));
            }
        };
        let parameters = match map.remove("parameters") {
            Some(Value::Array(values)) => {
                values.into_iter().map(Parameter::from_value).collect()
            }
            Some(_) => {
                return Err(CodecError::MalformedInvoke("parameters must be an array".into()));
            }
            None => return Err(CodecError::MalformedInvoke("call without parameters".into())),
        };
        return Ok(Frame::Invoke(Invoke::Call {
            uid,
            listener,
            parameters,
        }));
    }

    if map.contains_key("success") {
        let uid = require_uid(&map)?;
        let success = match map.remove("success") {
            Some(Value::Bool(b)) => b,
            _ => return Err(CodecError::MalformedInvoke("success must be a bool".into())),
        };
        let value = map.remove("value").unwrap_or(Value::Null);
        return Ok(Frame::Invoke(Invoke::Return { uid, success, value }));
    }

    if let Some(header) = map.remove("header") {
        return Ok(Frame::Header(HeaderEnvelope { header }));
    }

    // No discriminator field at all: the handshake acceptance reply.
    Ok(Frame::Confirm)
}

fn require_uid(map: &Map<String, Value>) -> Result<u64, CodecError> {
    map.get("uid")
        .and_then(Value::as_u64)
        .ok_or_else(|| CodecError::MalformedInvoke("uid must be an unsigned integer".into()))
}
