//! Message types and their wire representation
//!
//! Frames on the broker are flat JSON objects:
//!
//! ```json
//! {"id": "m-1", "senderName": "alice", "receiverName": "Chat chung",
//!  "message": "hi", "status": "MESSAGE", "fileType": "text",
//!  "fileUrl": "", "time": "2024-05-01T09:30:00.000Z"}
//! ```
//!
//! Inbound frames are normalised on the way in: missing attachment fields
//! fall back to empty values, a missing status means a regular message and
//! a missing time means "now".

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ChannelConfig;
use crate::error::{RealtimeError, RealtimeResult};

/// Identifier of a logical conversation or group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Create a channel key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ChannelKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Server-assigned message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create a message id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a chat frame
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// A member announced itself
    Join,
    /// A regular chat message
    Message,
    /// A notice generated by the system
    System,
    /// Anything else the server sent; dropped on receipt
    Other(String),
}

impl MessageStatus {
    /// Parse the wire form, case-insensitively
    pub fn from_wire(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "JOIN" => MessageStatus::Join,
            "MESSAGE" => MessageStatus::Message,
            "SYSTEM" => MessageStatus::System,
            _ => MessageStatus::Other(status.to_string()),
        }
    }

    /// Upper-case wire form
    pub fn as_wire(&self) -> &str {
        match self {
            MessageStatus::Join => "JOIN",
            MessageStatus::Message => "MESSAGE",
            MessageStatus::System => "SYSTEM",
            MessageStatus::Other(other) => other,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// File attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Where the file can be downloaded
    pub url: String,
    /// Original file name; may be empty
    pub name: String,
    /// MIME type or coarse kind (`"text"`, `"image"`, ...)
    pub mime_type: String,
}

impl Attachment {
    /// Attachment with an unknown name and type
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: String::new(),
            mime_type: DEFAULT_FILE_TYPE.to_string(),
        }
    }

    /// Set the file name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the MIME type
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

const DEFAULT_FILE_TYPE: &str = "text";

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Server id; dedup is skipped when absent
    pub id: Option<MessageId>,
    /// Who sent the message
    pub sender_id: String,
    /// Conversation or member the message is addressed to
    pub receiver_key: String,
    /// Text body
    pub body: String,
    /// Attached file, if any
    pub attachment: Option<Attachment>,
    /// When the message was sent
    pub timestamp: DateTime<Utc>,
    /// Kind of the message
    pub status: MessageStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    id: Option<serde_json::Value>,
    sender_name: Option<String>,
    receiver_name: Option<String>,
    message: Option<String>,
    status: Option<String>,
    file_url: Option<String>,
    file_name: Option<String>,
    file_type: Option<String>,
    time: Option<String>,
}

impl InboundMessage {
    /// Decode and normalise a raw frame body
    ///
    /// `received_at` stands in for a missing `time` field.
    pub fn from_frame(body: &str, received_at: DateTime<Utc>) -> RealtimeResult<Self> {
        let frame: InboundFrame = serde_json::from_str(body)?;

        let sender_id = frame
            .sender_name
            .ok_or_else(|| RealtimeError::malformed("missing senderName"))?;

        let id = match frame.id {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) if s.is_empty() => None,
            Some(serde_json::Value::String(s)) => Some(MessageId(s)),
            Some(serde_json::Value::Number(n)) => Some(MessageId(n.to_string())),
            Some(other) => {
                return Err(RealtimeError::malformed(format!(
                    "unsupported id value {}",
                    other
                )));
            }
        };

        let timestamp = match frame.time.as_deref() {
            None | Some("") => received_at,
            Some(raw) => parse_timestamp(raw)?,
        };

        let attachment = match frame.file_url.unwrap_or_default() {
            url if url.is_empty() => None,
            url => Some(Attachment {
                url,
                name: frame.file_name.unwrap_or_default(),
                mime_type: frame
                    .file_type
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| DEFAULT_FILE_TYPE.to_string()),
            }),
        };

        let status = frame
            .status
            .as_deref()
            .map(MessageStatus::from_wire)
            .unwrap_or(MessageStatus::Message);

        Ok(Self {
            id,
            sender_id,
            receiver_key: frame.receiver_name.unwrap_or_default(),
            body: frame.message.unwrap_or_default(),
            attachment,
            timestamp,
            status,
        })
    }
}

/// Accepts RFC 3339 and offset-less ISO timestamps (taken as UTC)
fn parse_timestamp(raw: &str) -> RealtimeResult<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| RealtimeError::malformed(format!("invalid time {:?}: {}", raw, e)))
}

/// A message to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Name of the local user
    pub sender_name: String,
    /// Conversation, member or broadcast receiver
    pub receiver_name: String,
    /// Text body
    pub message: String,
    /// Kind of the message
    pub status: MessageStatus,
    /// Attached file, if any
    pub attachment: Option<Attachment>,
    /// Send time
    pub time: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundFrame<'a> {
    sender_name: &'a str,
    receiver_name: &'a str,
    message: &'a str,
    status: &'a str,
    file_type: &'a str,
    file_url: &'a str,
    time: String,
}

impl OutboundMessage {
    /// A chat message stamped with the current time
    pub fn new(
        sender_name: impl Into<String>,
        receiver_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            sender_name: sender_name.into(),
            receiver_name: receiver_name.into(),
            message: message.into(),
            status: MessageStatus::Message,
            attachment: None,
            time: Utc::now(),
        }
    }

    /// A join announcement
    pub fn join(sender_name: impl Into<String>, receiver_name: impl Into<String>) -> Self {
        Self::new(sender_name, receiver_name, "").with_status(MessageStatus::Join)
    }

    /// Override the status
    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    /// Attach a file
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Override the send time
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Broker destination implied by status and receiver
    pub fn destination<'a>(&self, config: &'a ChannelConfig) -> &'a str {
        match self.status {
            MessageStatus::Message | MessageStatus::System => {
                if self.receiver_name == config.broadcast_receiver {
                    &config.public_destination
                } else {
                    &config.private_destination
                }
            }
            MessageStatus::Join | MessageStatus::Other(_) => &config.join_destination,
        }
    }

    /// Serialize to the flat wire object
    pub fn to_wire(&self) -> RealtimeResult<String> {
        let (file_type, file_url) = match &self.attachment {
            Some(attachment) => (attachment.mime_type.as_str(), attachment.url.as_str()),
            None => (DEFAULT_FILE_TYPE, ""),
        };
        let frame = OutboundFrame {
            sender_name: &self.sender_name,
            receiver_name: &self.receiver_name,
            message: &self.message,
            status: self.status.as_wire(),
            file_type,
            file_url,
            time: self.time.to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_inbound_defaults() {
        let msg = InboundMessage::from_frame(r#"{"senderName":"alice"}"#, received()).unwrap();
        assert_eq!(msg.id, None);
        assert_eq!(msg.sender_id, "alice");
        assert_eq!(msg.receiver_key, "");
        assert_eq!(msg.status, MessageStatus::Message);
        assert_eq!(msg.attachment, None);
        assert_eq!(msg.timestamp, received());
    }

    #[test]
    fn test_inbound_full_frame() {
        let body = r#"{"id":42,"senderName":"bob","receiverName":"Chat chung","message":"hi",
            "status":"join","fileUrl":"https://files/x.png","fileName":"x.png","fileType":"image",
            "time":"2024-05-01T09:30:00.250Z"}"#;
        let msg = InboundMessage::from_frame(body, received()).unwrap();
        assert_eq!(msg.id, Some(MessageId::new("42")));
        assert_eq!(msg.status, MessageStatus::Join);
        assert_eq!(
            msg.attachment,
            Some(Attachment::new("https://files/x.png").with_name("x.png").with_mime_type("image"))
        );
        assert_eq!(
            msg.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap() + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_offsetless_time_is_utc() {
        let body = r#"{"senderName":"a","time":"2024-05-01T09:30:00"}"#;
        let msg = InboundMessage::from_frame(body, received()).unwrap();
        assert_eq!(msg.timestamp, Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap());
    }

    #[test]
    fn test_malformed_frames() {
        for body in [
            "not json",
            r#"{"message":"no sender"}"#,
            r#"{"senderName":"a","time":"yesterday"}"#,
            r#"{"senderName":"a","id":{"nested":true}}"#,
        ] {
            let err = InboundMessage::from_frame(body, received()).unwrap_err();
            assert_eq!(err.category(), "payload", "body: {}", body);
        }
    }

    #[test]
    fn test_outbound_wire_shape() {
        let msg = OutboundMessage::new("alice", "Chat chung", "hello")
            .with_time(Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap());
        let wire: serde_json::Value = serde_json::from_str(&msg.to_wire().unwrap()).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({
                "senderName": "alice",
                "receiverName": "Chat chung",
                "message": "hello",
                "status": "MESSAGE",
                "fileType": "text",
                "fileUrl": "",
                "time": "2024-05-01T09:30:00.000Z"
            })
        );
    }

    #[test]
    fn test_destination_routing() {
        let config = ChannelConfig::default();
        assert_eq!(
            OutboundMessage::new("a", "Chat chung", "x").destination(&config),
            "/app/message/public"
        );
        assert_eq!(
            OutboundMessage::new("a", "bob", "x").destination(&config),
            "/app/private-message"
        );
        assert_eq!(OutboundMessage::join("a", "Chat chung").destination(&config), "/app/message");
    }
}
