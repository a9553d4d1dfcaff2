//! Public types for the ably-presence crate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

use crate::protocol::{ErrorInfo, presence_action};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Suspended => "suspended",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::Detaching => "detaching",
            Self::Detached => "detached",
            Self::Suspended => "suspended",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Emitted by the connection on every state transition.
#[derive(Debug, Clone)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    /// The error that caused the transition, if any. Shared with every
    /// operation failed by the same transition.
    pub reason: Option<Arc<ErrorInfo>>,
    /// Delay before the next automatic reconnect attempt.
    pub retry_in: Option<Duration>,
}

/// Emitted by a channel on every state transition.
#[derive(Debug, Clone)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub reason: Option<Arc<ErrorInfo>>,
    /// Set on ATTACHED when the server resumed the channel's continuity.
    pub resumed: bool,
}

/// Presence actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceAction {
    Absent,
    Present,
    Enter,
    Leave,
    Update,
}

impl PresenceAction {
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            presence_action::ABSENT => Some(Self::Absent),
            presence_action::PRESENT => Some(Self::Present),
            presence_action::ENTER => Some(Self::Enter),
            presence_action::LEAVE => Some(Self::Leave),
            presence_action::UPDATE => Some(Self::Update),
            _ => None,
        }
    }

    pub fn as_wire(self) -> i32 {
        match self {
            Self::Absent => presence_action::ABSENT,
            Self::Present => presence_action::PRESENT,
            Self::Enter => presence_action::ENTER,
            Self::Leave => presence_action::LEAVE,
            Self::Update => presence_action::UPDATE,
        }
    }
}

/// Identity of a presence member: a client id is present once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberKey {
    pub client_id: String,
    pub connection_id: String,
}

/// A decoded presence event or member record.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMessage {
    /// `<connectionId>:<msgSerial>:<index>` for messages published by a
    /// client; anything else marks a server-synthesized message.
    pub id: Option<String>,
    pub action: PresenceAction,
    pub client_id: String,
    pub connection_id: String,
    /// `Null` when the member carries no data.
    pub data: serde_json::Value,
    /// Server timestamp (milliseconds since epoch).
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    pub fn member_key(&self) -> MemberKey {
        MemberKey {
            client_id: self.client_id.clone(),
            connection_id: self.connection_id.clone(),
        }
    }

    /// A message is synthesized when its id does not start with its
    /// connection id (e.g. a LEAVE generated by the server).
    pub fn is_synthesized(&self) -> bool {
        !self
            .id
            .as_deref()
            .is_some_and(|id| id.starts_with(self.connection_id.as_str()))
    }

    /// `(msgSerial, index)` parsed from the id.
    pub(crate) fn ordering(&self) -> Option<(i64, i64)> {
        let mut parts = self.id.as_deref()?.rsplitn(3, ':');
        let index = parts.next()?.parse().ok()?;
        let serial = parts.next()?.parse().ok()?;
        Some((serial, index))
    }

    /// Whether `self` supersedes `existing` for the same member key.
    pub fn is_newer_than(&self, existing: &PresenceMessage) -> bool {
        if !self.is_synthesized() && !existing.is_synthesized()
            && let (Some(a), Some(b)) = (self.ordering(), existing.ordering())
        {
            return a > b;
        }
        self.timestamp.unwrap_or(0) >= existing.timestamp.unwrap_or(0)
    }
}

/// Parameters for [`RealtimePresence::get`](crate::RealtimePresence::get).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceQuery {
    /// Wait for an in-progress SYNC to finish before returning members.
    pub wait_for_sync: bool,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
}

impl Default for PresenceQuery {
    fn default() -> Self {
        Self {
            wait_for_sync: true,
            client_id: None,
            connection_id: None,
        }
    }
}

impl PresenceQuery {
    pub(crate) fn matches(&self, member: &PresenceMessage) -> bool {
        self.client_id
            .as_deref()
            .is_none_or(|id| id == member.client_id)
            && self
                .connection_id
                .as_deref()
                .is_none_or(|id| id == member.connection_id)
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error reported by the service or synthesized by a state
    /// transition. The `Arc` is shared with every operation, listener and
    /// state change affected by the same event.
    #[error("Ably error {0}")]
    Ably(Arc<ErrorInfo>),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("Ably protocol error: code={code}, {message}")]
    Protocol { code: i32, message: String },

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("client is closed")]
    ClientClosed,
}

impl Error {
    pub(crate) fn ably(code: i32, status_code: Option<i32>, message: impl Into<String>) -> Self {
        Error::Ably(Arc::new(ErrorInfo::new(code, status_code, message)))
    }

    /// The shared error info, for errors raised by the service or by a
    /// state transition.
    pub fn info(&self) -> Option<&Arc<ErrorInfo>> {
        match self {
            Error::Ably(info) => Some(info),
            _ => None,
        }
    }

    /// The numeric Ably error code, when there is one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Ably(info) => Some(info.code),
            Error::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

impl From<Arc<ErrorInfo>> for Error {
    fn from(info: Arc<ErrorInfo>) -> Self {
        Error::Ably(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: Option<&str>, connection_id: &str, timestamp: Option<i64>) -> PresenceMessage {
        PresenceMessage {
            id: id.map(str::to_string),
            action: PresenceAction::Present,
            client_id: "john".to_string(),
            connection_id: connection_id.to_string(),
            data: serde_json::Value::Null,
            timestamp,
        }
    }

    #[test]
    fn presence_action_wire_values() {
        for action in [
            PresenceAction::Absent,
            PresenceAction::Present,
            PresenceAction::Enter,
            PresenceAction::Leave,
            PresenceAction::Update,
        ] {
            assert_eq!(PresenceAction::from_wire(action.as_wire()), Some(action));
        }
        assert_eq!(PresenceAction::from_wire(5), None);
    }

    #[test]
    fn synthesized_detection() {
        assert!(!member(Some("conn1:3:0"), "conn1", None).is_synthesized());
        assert!(member(Some("other:3:0"), "conn1", None).is_synthesized());
        assert!(member(None, "conn1", None).is_synthesized());
    }

    #[test]
    fn newer_by_serial_then_index() {
        let older = member(Some("conn1:3:0"), "conn1", Some(500));
        let newer_index = member(Some("conn1:3:1"), "conn1", Some(100));
        let newer_serial = member(Some("conn1:10:0"), "conn1", Some(100));
        assert!(newer_index.is_newer_than(&older));
        assert!(newer_serial.is_newer_than(&newer_index));
        assert!(!older.is_newer_than(&newer_serial));
        // The same message is never newer than itself.
        assert!(!older.is_newer_than(&older));
    }

    #[test]
    fn synthesized_messages_compare_by_timestamp() {
        let real = member(Some("conn1:3:0"), "conn1", Some(100));
        let synthesized = member(Some("server:1:0"), "conn1", Some(200));
        assert!(synthesized.is_newer_than(&real));
        assert!(!real.is_newer_than(&synthesized));
    }

    #[test]
    fn query_filters() {
        let m = member(Some("conn1:1:0"), "conn1", None);
        assert!(PresenceQuery::default().matches(&m));
        let by_client = PresenceQuery {
            client_id: Some("john".to_string()),
            ..Default::default()
        };
        assert!(by_client.matches(&m));
        let by_conn = PresenceQuery {
            connection_id: Some("conn2".to_string()),
            ..Default::default()
        };
        assert!(!by_conn.matches(&m));
        assert!(PresenceQuery::default().wait_for_sync);
    }

    #[test]
    fn error_accessors() {
        let err = Error::ably(90001, Some(400), "invalid channel state");
        assert_eq!(err.code(), Some(90001));
        assert!(err.info().is_some());
        assert!(Error::ClientClosed.info().is_none());
    }
}
