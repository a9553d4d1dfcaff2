//! Ably wire protocol types, constants, and MessagePack encode/decode.

use std::collections::HashMap;
use std::fmt;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::types::{PresenceAction, PresenceMessage};

// ---------------------------------------------------------------------------
// Protocol action constants
// ---------------------------------------------------------------------------

pub mod action {
    pub const HEARTBEAT: i32 = 0;
    pub const ACK: i32 = 1;
    pub const NACK: i32 = 2;
    pub const CONNECTED: i32 = 4;
    pub const DISCONNECTED: i32 = 6;
    pub const CLOSE: i32 = 7;
    pub const CLOSED: i32 = 8;
    pub const ERROR: i32 = 9;
    pub const ATTACH: i32 = 10;
    pub const ATTACHED: i32 = 11;
    pub const DETACH: i32 = 12;
    pub const DETACHED: i32 = 13;
    pub const PRESENCE: i32 = 14;
    pub const MESSAGE: i32 = 15;
    pub const SYNC: i32 = 16;
}

/// Wire values of `PresenceMessage.action`.
pub mod presence_action {
    pub const ABSENT: i32 = 0;
    pub const PRESENT: i32 = 1;
    pub const ENTER: i32 = 2;
    pub const LEAVE: i32 = 3;
    pub const UPDATE: i32 = 4;
}

pub mod error_code {
    pub const BAD_REQUEST: i32 = 40000;
    pub const MISSING_CLIENT_ID: i32 = 40012;
    pub const FAILED: i32 = 80000;
    pub const SUSPENDED: i32 = 80002;
    pub const DISCONNECTED: i32 = 80003;
    pub const TIMEOUT: i32 = 80014;
    pub const CLOSED: i32 = 80017;
    pub const CHANNEL_OPERATION_FAILED: i32 = 90000;
    pub const INVALID_CHANNEL_STATE: i32 = 90001;
    pub const ATTACH_TIMEOUT: i32 = 90007;
    pub const PRESENCE_SYNC_SUSPENDED: i32 = 91005;
}

pub mod flags {
    // Flags read from ATTACHED responses. Only ATTACH_RESUME is ever sent.
    pub const HAS_PRESENCE: i32 = 1;
    pub const HAS_BACKLOG: i32 = 2;
    pub const RESUMED: i32 = 4;
    pub const ATTACH_RESUME: i32 = 1 << 5; // 32
}

// ---------------------------------------------------------------------------
// Wire protocol types (MessagePack)
// ---------------------------------------------------------------------------

// NOTE: We intentionally omit `skip_serializing_if = "Option::is_none"` on
// these structs. rmp_serde has a long-standing bug where skipped Option fields
// cause deserialization failures: https://github.com/3Hren/msgpack-rust/issues/86
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: i32,
    pub id: Option<String>,
    pub channel: Option<String>,
    pub channel_serial: Option<String>,
    pub connection_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_details: Option<ConnectionDetails>,
    pub msg_serial: Option<i64>,
    pub count: Option<i64>,
    pub flags: Option<i32>,
    pub error: Option<ErrorInfo>,
    pub presence: Option<Vec<WirePresenceMessage>>,
    pub timestamp: Option<i64>,
    pub params: Option<HashMap<String, String>>,
}

impl ProtocolMessage {
    pub fn has_flag(&self, flag: i32) -> bool {
        self.flags.unwrap_or(0) & flag != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub client_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_state_ttl: Option<i64>,
    pub max_idle_interval: Option<i64>,
    pub max_message_size: Option<i64>,
    pub server_id: Option<String>,
}

/// Error payload carried by ERROR, DISCONNECTED, DETACHED and NACK messages,
/// and by every failed operation.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: i32,
    pub status_code: Option<i32>,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: i32, status_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "[{} {}] {}", self.code, status, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ErrorInfo {}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WirePresenceMessage {
    pub id: Option<String>,
    pub action: i32,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub data: Option<serde_json::Value>,
    pub encoding: Option<String>,
    pub timestamp: Option<i64>,
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

pub fn encode_msg(msg: &ProtocolMessage) -> Result<Vec<u8>, Error> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

pub fn decode_msg(data: &[u8]) -> Result<ProtocolMessage, Error> {
    // Three-step decode: msgpack → rmpv::Value → serde_json::Value → ProtocolMessage.
    //
    // 1. rmpv::Value handles msgpack binary data (which serde_json::Value cannot).
    // 2. serde_json::Value deduplicates map keys (Ably may send "presence" twice,
    //    which rmp_serde's struct deserializer rejects).
    let mut cursor = std::io::Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor).map_err(|e| Error::Protocol {
        code: error_code::BAD_REQUEST,
        message: format!("msgpack decode error: {e}"),
    })?;
    let json = rmpv_to_json(value);
    serde_json::from_value(json).map_err(|e| Error::Protocol {
        code: error_code::BAD_REQUEST,
        message: format!("message decode error: {e}"),
    })
}

/// Convert an rmpv::Value to serde_json::Value, encoding binary data as base64 strings.
fn rmpv_to_json(value: rmpv::Value) -> serde_json::Value {
    match value {
        rmpv::Value::Nil => serde_json::Value::Null,
        rmpv::Value::Boolean(b) => serde_json::Value::Bool(b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                serde_json::Value::Number(n.into())
            } else if let Some(n) = i.as_u64() {
                serde_json::Value::Number(n.into())
            } else {
                serde_json::Value::Null
            }
        }
        rmpv::Value::F32(f) => serde_json::Number::from_f64(f64::from(f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::F64(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::String(s) => serde_json::Value::String(utf8_or_empty(s)),
        rmpv::Value::Binary(bytes) | rmpv::Value::Ext(_, bytes) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(&bytes))
        }
        rmpv::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(rmpv_to_json).collect())
        }
        rmpv::Value::Map(map) => {
            let obj = map
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        rmpv::Value::String(s) => utf8_or_empty(s),
                        other => format!("{other}"),
                    };
                    (key, rmpv_to_json(v))
                })
                .collect();
            serde_json::Value::Object(obj)
        }
    }
}

fn utf8_or_empty(s: rmpv::Utf8String) -> String {
    if s.is_str() {
        s.into_str().unwrap_or_default()
    } else {
        tracing::warn!("msgpack string contains invalid UTF-8, substituting empty string");
        String::new()
    }
}

// ---------------------------------------------------------------------------
// Payload encoding layers
// ---------------------------------------------------------------------------

/// Undo the `encoding` layers of a payload, outermost (rightmost) first.
pub(crate) fn decode_data(data: serde_json::Value, encoding: Option<&str>) -> serde_json::Value {
    let Some(encoding) = encoding else {
        return data;
    };
    if encoding.is_empty() {
        return data;
    }
    let mut result = data;
    for layer in encoding.rsplit('/') {
        match layer {
            "json" => {
                if let serde_json::Value::String(ref s) = result {
                    match serde_json::from_str(s) {
                        Ok(parsed) => result = parsed,
                        Err(e) => {
                            tracing::warn!("Failed to decode JSON encoding layer: {e}");
                            return result;
                        }
                    }
                }
            }
            "base64" => {
                // serde_json::Value has no binary type; decoded bytes become an
                // array of numbers.
                if let serde_json::Value::String(ref s) = result {
                    match base64::engine::general_purpose::STANDARD.decode(s) {
                        Ok(bytes) => {
                            result = serde_json::Value::Array(
                                bytes.into_iter().map(|b| b.into()).collect(),
                            );
                        }
                        Err(e) => {
                            tracing::warn!("Failed to decode base64 encoding layer: {e}");
                            return result;
                        }
                    }
                }
            }
            "utf-8" => {
                // No-op: MessagePack strings are already UTF-8
            }
            other => {
                tracing::warn!(
                    encoding = other,
                    "Unsupported encoding layer, returning raw data"
                );
                return result;
            }
        }
    }
    result
}

/// Prepare a payload for the wire. Strings travel as-is, `Null` as no data,
/// everything else as a JSON string tagged with the `json` encoding.
pub(crate) fn encode_data(data: serde_json::Value) -> (Option<serde_json::Value>, Option<String>) {
    match data {
        serde_json::Value::Null => (None, None),
        serde_json::Value::String(s) => (Some(serde_json::Value::String(s)), None),
        other => (
            Some(serde_json::Value::String(other.to_string())),
            Some("json".to_string()),
        ),
    }
}

// ---------------------------------------------------------------------------
// Presence conversion
// ---------------------------------------------------------------------------

/// Decode the `index`-th presence entry of `msg`, filling in the id,
/// connection id and timestamp from the enclosing protocol message when the
/// entry omits them. Returns `None` for entries without a client id or
/// connection id, or with an unknown action.
pub(crate) fn presence_from_wire(
    msg: &ProtocolMessage,
    index: usize,
    wire: WirePresenceMessage,
) -> Option<PresenceMessage> {
    let Some(action) = PresenceAction::from_wire(wire.action) else {
        tracing::warn!(action = wire.action, "Ignoring presence message with unknown action");
        return None;
    };
    let connection_id = wire.connection_id.or_else(|| msg.connection_id.clone());
    let (Some(client_id), Some(connection_id)) = (wire.client_id, connection_id) else {
        tracing::warn!("Ignoring presence message without clientId/connectionId");
        return None;
    };
    let raw = wire.data.unwrap_or(serde_json::Value::Null);
    Some(PresenceMessage {
        id: wire
            .id
            .or_else(|| msg.id.as_ref().map(|pid| format!("{pid}:{index}"))),
        action,
        client_id,
        connection_id,
        data: decode_data(raw, wire.encoding.as_deref()),
        timestamp: wire.timestamp.or(msg.timestamp),
    })
}

// ---------------------------------------------------------------------------
// Message builders
// ---------------------------------------------------------------------------

pub fn build_attach_msg(
    channel: &str,
    params: Option<&HashMap<String, String>>,
    channel_serial: Option<&str>,
) -> ProtocolMessage {
    let (cs, f) = match channel_serial {
        Some(s) => (Some(s.to_string()), Some(flags::ATTACH_RESUME)),
        None => (None, None),
    };
    ProtocolMessage {
        action: action::ATTACH,
        channel: Some(channel.to_string()),
        channel_serial: cs,
        flags: f,
        params: params.cloned(),
        ..Default::default()
    }
}

pub fn build_detach_msg(channel: &str) -> ProtocolMessage {
    ProtocolMessage {
        action: action::DETACH,
        channel: Some(channel.to_string()),
        ..Default::default()
    }
}

/// SYNC request resuming an interrupted presence sync from `sync_serial`.
pub fn build_sync_msg(channel: &str, sync_serial: &str) -> ProtocolMessage {
    ProtocolMessage {
        action: action::SYNC,
        channel: Some(channel.to_string()),
        channel_serial: Some(sync_serial.to_string()),
        ..Default::default()
    }
}

pub fn build_presence_msg(
    channel: &str,
    action: PresenceAction,
    client_id: &str,
    data: serde_json::Value,
) -> ProtocolMessage {
    let (data, encoding) = encode_data(data);
    ProtocolMessage {
        action: action::PRESENCE,
        channel: Some(channel.to_string()),
        presence: Some(vec![WirePresenceMessage {
            action: action.as_wire(),
            client_id: Some(client_id.to_string()),
            data,
            encoding,
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub fn build_close_msg() -> ProtocolMessage {
    ProtocolMessage {
        action: action::CLOSE,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Sync cursor
// ---------------------------------------------------------------------------

/// A SYNC channel serial has the form `<sequence id>:<cursor>`. The sync is
/// complete when the cursor is empty or the serial is absent.
pub fn is_sync_complete(channel_serial: Option<&str>) -> bool {
    match channel_serial {
        None => true,
        Some(serial) => match serial.split_once(':') {
            Some((_, cursor)) => cursor.is_empty(),
            None => true,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
