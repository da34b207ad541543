use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::StoredMessage;
use crate::ids::{ConversationId, MessageId, ParticipantId, resolve};
use crate::models::{FileRef, MessageKind, Role};

/// One persisted chat message, broadcast to every interested connection.
///
/// Built by the sender only after the store confirmed persistence, and never
/// modified afterwards. Receivers may see it more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEvent {
    pub conversation_id: ConversationId,
    pub id: MessageId,
    pub sender_id: ParticipantId,
    pub sender_name: String,
    pub receiver_id: ParticipantId,
    pub message: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryEvent {
    /// True when the conversation id is the one both parties would derive.
    pub fn is_well_addressed(&self) -> bool {
        self.conversation_id == resolve(&self.sender_id, &self.receiver_id)
    }

    /// Sender and receiver, deduplicated.
    pub fn participants(&self) -> Vec<ParticipantId> {
        if self.sender_id == self.receiver_id {
            vec![self.sender_id.clone()]
        } else {
            vec![self.sender_id.clone(), self.receiver_id.clone()]
        }
    }

    /// The other party from `me`'s point of view.
    pub fn peer_of(&self, me: &ParticipantId) -> Option<&ParticipantId> {
        if self.sender_id == *me {
            Some(&self.receiver_id)
        } else if self.receiver_id == *me {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    pub fn file(&self) -> Option<FileRef> {
        let url = self.file_url.clone()?;
        Some(FileRef {
            url,
            name: self.file_name.clone().unwrap_or_default(),
            mime: self.file_type.clone(),
        })
    }
}

impl From<StoredMessage> for DeliveryEvent {
    fn from(m: StoredMessage) -> Self {
        Self {
            conversation_id: m.conversation_id,
            id: m.id,
            sender_id: m.sender_id,
            sender_name: m.sender_name,
            receiver_id: m.receiver_id,
            message: m.message,
            message_type: m.message_type,
            file_url: m.file_url,
            file_name: m.file_name,
            file_type: m.file_type,
            timestamp: m.timestamp,
        }
    }
}

/// Privileged, session-ending notices pushed to an identity channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    Suspended { message: String },
    ForceLogout { message: String },
}

impl ControlSignal {
    pub fn message(&self) -> &str {
        match self {
            Self::Suspended { message } | Self::ForceLogout { message } => message,
        }
    }
}

/// Events sent FROM server TO client over the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Identify accepted; `online` lists identities with a live connection
    Ready {
        id: ParticipantId,
        online: Vec<ParticipantId>,
    },

    /// An identity came online or went offline
    Presence { id: ParticipantId, online: bool },

    /// A persisted message
    NewMessage(DeliveryEvent),

    /// The account was suspended by an administrator
    UserSuspended { message: String },

    /// An administrator ended every session of this account
    ForceLogout { message: String },
}

impl ServerEvent {
    pub fn control(&self) -> Option<ControlSignal> {
        match self {
            Self::UserSuspended { message } => Some(ControlSignal::Suspended {
                message: message.clone(),
            }),
            Self::ForceLogout { message } => Some(ControlSignal::ForceLogout {
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

impl From<ControlSignal> for ServerEvent {
    fn from(signal: ControlSignal) -> Self {
        match signal {
            ControlSignal::Suspended { message } => Self::UserSuspended { message },
            ControlSignal::ForceLogout { message } => Self::ForceLogout { message },
        }
    }
}

/// Commands sent FROM client TO server over the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Bind this connection to an identity
    Identify {
        id: ParticipantId,
        #[serde(rename = "type", default)]
        role: Role,
    },

    /// Join a conversation channel (the conversation currently on screen)
    Join { room: ConversationId },

    /// Leave a conversation channel
    Leave { room: ConversationId },

    /// Publish a message the store already persisted
    NewMessage(DeliveryEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeliveryEvent {
        let a = ParticipantId::new("A").unwrap();
        let b = ParticipantId::new("B").unwrap();
        DeliveryEvent {
            conversation_id: resolve(&a, &b),
            id: MessageId::new("m1").unwrap(),
            sender_id: a,
            sender_name: "alice".into(),
            receiver_id: b,
            message: "hi".into(),
            message_type: MessageKind::Text,
            file_url: None,
            file_name: None,
            file_type: None,
            timestamp: DateTime::parse_from_rfc3339("2025-01-02T03:04:05Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn new_message_wire_shape() {
        let json = serde_json::to_value(ClientCommand::NewMessage(sample())).unwrap();
        assert_eq!(json["type"], "new_message");
        assert_eq!(json["data"]["conversationId"], "A-B");
        assert_eq!(json["data"]["senderId"], "A");
        assert_eq!(json["data"]["messageType"], "text");
        assert!(json["data"].get("fileUrl").is_none());
    }

    #[test]
    fn identify_accepts_type_field() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"identify","data":{"id":"U1","type":"admin"}}"#)
                .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Identify {
                id: ParticipantId::new("U1").unwrap(),
                role: Role::Admin,
            }
        );
    }

    #[test]
    fn malformed_ids_fail_at_decode() {
        let bad = r#"{"type":"join","data":{"room":"temp_U2"}}"#;
        assert!(serde_json::from_str::<ClientCommand>(bad).is_err());
    }

    #[test]
    fn control_events_map_to_signals() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"force_logout","data":{"message":"bye"}}"#).unwrap();
        assert_eq!(
            event.control(),
            Some(ControlSignal::ForceLogout {
                message: "bye".into()
            })
        );
        assert_eq!(ServerEvent::NewMessage(sample()).control(), None);
    }

    #[test]
    fn addressing_checks() {
        let mut event = sample();
        assert!(event.is_well_addressed());
        assert_eq!(
            event.peer_of(&ParticipantId::new("B").unwrap()).map(|p| p.as_str()),
            Some("A")
        );
        event.receiver_id = ParticipantId::new("C").unwrap();
        assert!(!event.is_well_addressed());
    }
}
