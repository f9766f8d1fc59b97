#![expect(
    clippy::module_name_repetitions,
    reason = "ProtocolMessage is the established name for a wire frame"
)]

//! Decoded protocol frames exchanged with the realtime service.
//!
//! A [`ProtocolMessage`] is one unit on the wire: connection lifecycle
//! (connect/connected/close), channel lifecycle (attach/attached/detach),
//! payload delivery (message/presence) and publish acknowledgement
//! (ack/nack). Action tags are numeric on the wire.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use strum_macros::Display;

/// Lower bound (inclusive) of the token-expiry error code range.
const TOKEN_ERROR_CODE_START: u32 = 40140;
/// Upper bound (exclusive) of the token-expiry error code range.
const TOKEN_ERROR_CODE_END: u32 = 40150;

/// Action tag of a protocol frame. Serialized as its numeric wire value.
#[non_exhaustive]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr, Display,
)]
#[repr(u8)]
pub enum Action {
    #[default]
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connect = 3,
    Connected = 4,
    Disconnect = 5,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
}

/// Error details carried by `error`, `nack`, `disconnected` and `detached`
/// frames.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: u32,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    #[must_use]
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }

    /// Whether this error signals an expired auth token.
    ///
    /// Token expiry is reported as HTTP 401 with a code in the
    /// 40140..40150 range and is recoverable via renewal, unlike other
    /// protocol errors.
    #[must_use]
    pub fn is_token_error(&self) -> bool {
        self.status_code == 401
            && (TOKEN_ERROR_CODE_START..TOKEN_ERROR_CODE_END).contains(&self.code)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "server error (code {}, status {}): {}",
            self.code, self.status_code, self.message
        )
    }
}

impl StdError for ErrorInfo {}

/// A single application message carried by a `message` frame.
#[non_exhaustive]
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Connection that originated the message. Stamped by the server and
    /// used for subscriber echo suppression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Message {
    #[must_use]
    pub fn new(name: impl Into<String>, data: impl Into<serde_json::Value>) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data.into()),
            ..Self::default()
        }
    }
}

/// Presence event kind, layered on the channel attach lifecycle.
#[non_exhaustive]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr, Display,
)]
#[repr(u8)]
pub enum PresenceAction {
    #[default]
    Absent = 0,
    Present = 1,
    Enter = 2,
    Leave = 3,
    Update = 4,
}

/// A channel-scoped member-state message carried by a `presence` frame.
#[non_exhaustive]
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceMessage {
    pub action: PresenceAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// One decoded protocol frame.
///
/// Optional fields are omitted from the wire encoding when absent; which
/// fields are meaningful depends on [`Action`].
#[non_exhaustive]
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Server-assigned connection identity (on `connected` frames).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Opaque resume key; with `connection_serial` it forms the recovery key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// Monotonic serial of the last delivered frame on this connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    /// Publish serial (on outbound `message` frames and `ack`/`nack`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    /// Number of serials covered by an `ack`/`nack`, starting at `msg_serial`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// Credential presented on `connect` frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub presence: Vec<PresenceMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ProtocolMessage {
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn for_channel(action: Action, channel: impl Into<String>) -> Self {
        Self {
            action,
            channel: Some(channel.into()),
            ..Self::default()
        }
    }

    /// Build an outbound publish frame for `channel`. The publish serial is
    /// assigned later, on the serialized write path.
    #[must_use]
    pub fn publish(channel: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            action: Action::Message,
            channel: Some(channel.into()),
            messages,
            ..Self::default()
        }
    }
}
