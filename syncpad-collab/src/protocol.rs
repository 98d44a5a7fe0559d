//! JSON wire protocol for note sessions.
//!
//! Every frame is a text WebSocket message holding one JSON object whose
//! `type` field selects the shape:
//!
//! ```text
//! get_content   client → server   {}
//! content       server → client   {content}
//! edit          both directions   {operation, position, content?, length?}
//!                                 (+ user_id, username, seq from the server)
//! cursor        both directions   {position, selection_end}
//!                                 (+ user_id, username from the server)
//! user_joined   server → client   {user_id, username}
//! user_left     server → client   {user_id, username}
//! user_list     server → client   {users: [{user_id, username}]}
//! error         server → client   {message, code?}
//! ping / pong   keepalive
//! ```
//!
//! Unknown `type` values decode to an `Unknown` variant so that newer peers
//! can add message kinds without breaking older ones. Extra fields are
//! ignored.

use serde::{Deserialize, Serialize};

use crate::edit::{EditKind, EditOperation};

/// Error code sent with `error` when real-time features need premium.
pub const CODE_PREMIUM_REQUIRED: &str = "premium_required";
/// Error code sent with `error` when an edit arrives without write access.
pub const CODE_WRITE_REQUIRED: &str = "write_permission_required";
/// Error code sent with `error` when a session refuses more participants.
pub const CODE_SESSION_FULL: &str = "session_full";

pub const PREMIUM_REQUIRED_MESSAGE: &str = "Real-time collaboration requires premium subscription";
pub const WRITE_REQUIRED_MESSAGE: &str = "Write permission required";

/// Edit fields as they appear inside an `edit` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPayload {
    pub operation: EditKind,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

impl EditPayload {
    pub fn to_operation(&self) -> EditOperation {
        EditOperation::from_parts(self.operation, self.position, self.content.clone(), self.length)
    }
}

impl From<&EditOperation> for EditPayload {
    fn from(op: &EditOperation) -> Self {
        Self {
            operation: op.kind(),
            position: op.position(),
            content: op.content().map(str::to_owned),
            length: op.length(),
        }
    }
}

/// Identity of one participant as listed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: String,
    pub username: String,
}

impl ParticipantInfo {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), username: username.into() }
    }
}

/// An edit relayed by the server from another participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEdit {
    pub operation: EditKind,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Per-session sequence number stamped by the server, starting at 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl RemoteEdit {
    pub fn new(op: &EditOperation, author: &ParticipantInfo, seq: u64) -> Self {
        let payload = EditPayload::from(op);
        Self {
            operation: payload.operation,
            position: payload.position,
            content: payload.content,
            length: payload.length,
            user_id: Some(author.user_id.clone()),
            username: Some(author.username.clone()),
            seq: Some(seq),
        }
    }

    pub fn to_operation(&self) -> EditOperation {
        EditOperation::from_parts(self.operation, self.position, self.content.clone(), self.length)
    }
}

/// A caret/selection relayed by the server from another participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCursor {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    pub position: usize,
    pub selection_end: usize,
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    GetContent,
    Edit(EditPayload),
    Cursor { position: usize, selection_end: usize },
    Ping,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn edit(op: &EditOperation) -> Self {
        Self::Edit(EditPayload::from(op))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::GetContent => "get_content",
            Self::Edit(_) => "edit",
            Self::Cursor { .. } => "cursor",
            Self::Ping => "ping",
            Self::Unknown => "unknown",
        }
    }

    pub fn to_json(&self) -> Result<String, CollabError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(text: &str) -> Result<Self, CollabError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Content {
        content: String,
        /// Session sequence number the snapshot reflects.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    Edit(RemoteEdit),
    Cursor(RemoteCursor),
    UserJoined(ParticipantInfo),
    UserLeft(ParticipantInfo),
    UserList {
        users: Vec<ParticipantInfo>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, code: &str) -> Self {
        Self::Error { message: message.into(), code: Some(code.to_string()) }
    }

    pub fn premium_required() -> Self {
        Self::error(PREMIUM_REQUIRED_MESSAGE, CODE_PREMIUM_REQUIRED)
    }

    pub fn write_required() -> Self {
        Self::error(WRITE_REQUIRED_MESSAGE, CODE_WRITE_REQUIRED)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Content { .. } => "content",
            Self::Edit(_) => "edit",
            Self::Cursor(_) => "cursor",
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft(_) => "user_left",
            Self::UserList { .. } => "user_list",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
            Self::Unknown => "unknown",
        }
    }

    pub fn to_json(&self) -> Result<String, CollabError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(text: &str) -> Result<Self, CollabError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Whether a server error should become an upgrade prompt rather than a
/// generic failure.
pub fn is_upgrade_prompt(message: &str, code: Option<&str>) -> bool {
    code == Some(CODE_PREMIUM_REQUIRED)
        || message.contains("premium")
        || message.contains("subscription")
}

/// Errors raised by the collaboration layer. None of them are fatal to the
/// process; the worst case is a session that stops reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollabError {
    /// Connection failed or dropped.
    #[error("Transport error: {0}")]
    Transport(String),
    /// Malformed or unparseable message.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Edit without write rights, or a premium feature on the free tier.
    #[error("Permission denied: {0}")]
    Permission(String),
    /// Error signaled by the server with an `error` message.
    #[error("{message}")]
    Server { message: String, code: Option<String> },
    #[error("Session for note {note_id} is full ({limit} participants)")]
    SessionFull { note_id: String, limit: usize },
    #[error("Storage error: {0}")]
    Storage(String),
}

impl CollabError {
    pub fn is_upgrade_prompt(&self) -> bool {
        match self {
            Self::Server { message, code } => is_upgrade_prompt(message, code.as_deref()),
            Self::Permission(message) => is_upgrade_prompt(message, None),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        CollabError::Protocol(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CollabError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for CollabError {
    fn from(e: std::io::Error) -> Self {
        CollabError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn as_value(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_get_content_envelope() {
        let text = ClientMessage::GetContent.to_json().unwrap();
        assert_eq!(as_value(&text), json!({"type": "get_content"}));
    }

    #[test]
    fn test_insert_edit_envelope_omits_length() {
        let text = ClientMessage::edit(&EditOperation::insert(4, "l")).to_json().unwrap();
        assert_eq!(
            as_value(&text),
            json!({"type": "edit", "operation": "insert", "position": 4, "content": "l"})
        );
    }

    #[test]
    fn test_delete_edit_envelope_omits_content() {
        let text = ClientMessage::edit(&EditOperation::delete(5, 6)).to_json().unwrap();
        assert_eq!(
            as_value(&text),
            json!({"type": "edit", "operation": "delete", "position": 5, "length": 6})
        );
    }

    #[test]
    fn test_cursor_envelope() {
        let msg = ClientMessage::Cursor { position: 3, selection_end: 7 };
        assert_eq!(
            as_value(&msg.to_json().unwrap()),
            json!({"type": "cursor", "position": 3, "selection_end": 7})
        );
    }

    #[test]
    fn test_parse_remote_edit_from_server() {
        let text = r#"{"type":"edit","user_id":"u1","username":"Ann","operation":"replace",
            "position":2,"content":"xy","length":1,"timestamp":"2024-01-01T00:00:00","seq":9}"#;
        match ServerMessage::parse(text).unwrap() {
            ServerMessage::Edit(edit) => {
                assert_eq!(edit.to_operation(), EditOperation::replace(2, "xy", 1));
                assert_eq!(edit.user_id.as_deref(), Some("u1"));
                assert_eq!(edit.seq, Some(9));
            }
            other => panic!("expected edit, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_edit_with_null_content() {
        let text = r#"{"type":"edit","operation":"delete","position":1,"content":null,"length":2}"#;
        match ServerMessage::parse(text).unwrap() {
            ServerMessage::Edit(edit) => assert_eq!(edit.to_operation(), EditOperation::delete(1, 2)),
            other => panic!("expected edit, got {other:?}"),
        }
    }

    #[test]
    fn test_content_carries_snapshot_seq() {
        let msg = ServerMessage::Content { content: "hi".into(), seq: Some(4) };
        assert_eq!(
            as_value(&msg.to_json().unwrap()),
            json!({"type": "content", "content": "hi", "seq": 4})
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"content","content":"hi"}"#).unwrap(),
            ServerMessage::Content { content: "hi".into(), seq: None }
        );
    }

    #[test]
    fn test_parse_user_list() {
        let text = r#"{"type":"user_list","users":[{"user_id":"a","username":"Ann"},{"user_id":"b","username":"Bo"}]}"#;
        assert_eq!(
            ServerMessage::parse(text).unwrap(),
            ServerMessage::UserList {
                users: vec![ParticipantInfo::new("a", "Ann"), ParticipantInfo::new("b", "Bo")],
            }
        );
    }

    #[test]
    fn test_parse_user_joined_and_left() {
        let joined = ServerMessage::parse(r#"{"type":"user_joined","user_id":"a","username":"Ann"}"#).unwrap();
        assert_eq!(joined, ServerMessage::UserJoined(ParticipantInfo::new("a", "Ann")));
        let left = ServerMessage::parse(r#"{"type":"user_left","user_id":"a","username":"Ann"}"#).unwrap();
        assert_eq!(left, ServerMessage::UserLeft(ParticipantInfo::new("a", "Ann")));
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let msg = ServerMessage::parse(r#"{"type":"presence_v2","whatever":1}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unknown);
        let msg = ClientMessage::parse(r#"{"type":"subscribe"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown);
    }

    #[test]
    fn test_malformed_is_protocol_error() {
        for text in ["not json", "{}", r#"{"type":"edit","operation":"insert","position":-1}"#] {
            match ServerMessage::parse(text) {
                Err(CollabError::Protocol(_)) => {}
                other => panic!("expected protocol error for {text:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_error_envelope_with_code() {
        let text = ServerMessage::premium_required().to_json().unwrap();
        assert_eq!(
            as_value(&text),
            json!({
                "type": "error",
                "message": "Real-time collaboration requires premium subscription",
                "code": "premium_required"
            })
        );
    }

    #[test]
    fn test_upgrade_prompt_classification() {
        assert!(is_upgrade_prompt("Real-time collaboration requires premium subscription", None));
        assert!(is_upgrade_prompt("Your subscription lapsed", None));
        assert!(is_upgrade_prompt("nope", Some(CODE_PREMIUM_REQUIRED)));
        assert!(!is_upgrade_prompt(WRITE_REQUIRED_MESSAGE, Some(CODE_WRITE_REQUIRED)));

        let err = CollabError::Server { message: "Write permission required".into(), code: None };
        assert!(!err.is_upgrade_prompt());
        let err = CollabError::Server { message: "x".into(), code: Some(CODE_PREMIUM_REQUIRED.into()) };
        assert!(err.is_upgrade_prompt());
    }
}
