use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ConversationId, MessageId, ParticipantId};
use crate::models::{FileRef, MessageKind, Role};

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the store client. Tokens are
/// minted by the authentication collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: ParticipantId,
    pub name: String,
    pub role: Role,
    pub exp: usize,
}

// -- Store errors --

/// Failures of the collaborator store contracts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Sender suspended/inactive, recipient unavailable, or caller not allowed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    /// Transport or storage failure; the call may be retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// -- Messages --

/// What the client wants persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub message: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRef>,
}

impl Draft {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            message_type: MessageKind::Text,
            file: None,
        }
    }

    pub fn attachment(kind: MessageKind, file: FileRef) -> Self {
        Self {
            message: file.name.clone(),
            message_type: kind,
            file: Some(file),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: ParticipantId,
    #[serde(flatten)]
    pub draft: Draft,
}

/// A message as the store of record holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub sender_name: String,
    pub receiver_id: ParticipantId,
    pub receiver_name: String,
    pub message: String,
    pub message_type: MessageKind,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub is_read: bool,
    pub timestamp: DateTime<Utc>,
}

// -- Conversations --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub peer_id: ParticipantId,
    pub peer_name: String,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadResponse {
    pub modified_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountResponse {
    pub unread_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationIdResponse {
    pub conversation_id: ConversationId,
}

// -- Admin --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminActionResponse {
    pub message: String,
    /// Live connections the control signal reached.
    pub connections: usize,
}

/// Error body of every failed REST call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}
