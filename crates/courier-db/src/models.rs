//! Database row types. These map directly to SQLite rows and stay distinct
//! from the courier-types API models to keep the DB layer independent.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use courier_types::api::{ConversationSummary, StoredMessage};
use courier_types::models::{Participant, Role};
use courier_types::{ConversationId, MessageId, ParticipantId};

pub struct UserRow {
    pub id: String,
    pub display_name: String,
    pub role: String,
    pub suspended: bool,
    pub active: bool,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub receiver_id: String,
    pub receiver_name: String,
    pub message: String,
    pub message_type: String,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub is_read: bool,
    pub created_at: String,
}

pub struct ConversationRow {
    pub conversation_id: String,
    pub peer_id: String,
    pub peer_name: String,
    pub last_message: String,
    pub last_message_time: String,
    pub unread: i64,
}

/// Timestamps are stored as fixed-width RFC 3339 strings so that text
/// ordering matches time ordering.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("corrupt timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

impl UserRow {
    pub fn into_participant(self) -> Result<Participant> {
        Ok(Participant {
            id: ParticipantId::new(&self.id)
                .with_context(|| format!("corrupt user id {:?}", self.id))?,
            display_name: self.display_name,
            role: self.role.parse::<Role>().map_err(anyhow::Error::msg)?,
            suspended: self.suspended,
            active: self.active,
        })
    }
}

impl MessageRow {
    pub fn into_message(self) -> Result<StoredMessage> {
        let context = || format!("corrupt message {:?}", self.id);
        Ok(StoredMessage {
            id: MessageId::new(self.id.clone()).with_context(context)?,
            conversation_id: ConversationId::parse(self.conversation_id.clone())
                .with_context(context)?,
            sender_id: ParticipantId::new(self.sender_id.clone()).with_context(context)?,
            sender_name: self.sender_name,
            receiver_id: ParticipantId::new(self.receiver_id.clone()).with_context(context)?,
            receiver_name: self.receiver_name,
            message: self.message,
            message_type: self.message_type.parse().map_err(anyhow::Error::msg)?,
            file_url: self.file_url,
            file_name: self.file_name,
            file_type: self.file_type,
            is_read: self.is_read,
            timestamp: parse_timestamp(&self.created_at)?,
        })
    }
}

impl ConversationRow {
    pub fn into_summary(self) -> Result<ConversationSummary> {
        Ok(ConversationSummary {
            conversation_id: ConversationId::parse(self.conversation_id.clone())
                .with_context(|| format!("corrupt conversation id {:?}", self.conversation_id))?,
            peer_id: ParticipantId::new(self.peer_id.clone())
                .with_context(|| format!("corrupt peer id {:?}", self.peer_id))?,
            peer_name: self.peer_name,
            last_message: Some(self.last_message),
            last_message_time: Some(parse_timestamp(&self.last_message_time)?),
            unread_count: u32::try_from(self.unread).unwrap_or(u32::MAX),
        })
    }
}
