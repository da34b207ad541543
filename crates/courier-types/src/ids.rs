use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Joins the two participant ids of a conversation. Participant ids can never
/// contain it, so a conversation id always splits back unambiguously.
pub const CONVERSATION_SEPARATOR: char = '-';

const MAX_PARTICIPANT_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier is longer than 128 bytes")]
    TooLong,
    #[error("identifier contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("malformed conversation id {0:?}")]
    MalformedConversation(String),
}

/// Identifier of a chat participant (end user or administrator).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(raw: impl Into<String>) -> Result<Self, IdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(IdError::Empty);
        }
        if raw.len() > MAX_PARTICIPANT_ID_LEN {
            return Err(IdError::TooLong);
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(IdError::InvalidChar(bad));
        }
        Ok(Self(raw))
    }

    /// Fresh random id (UUID v4 without hyphens).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical, order-independent key of a two-party conversation.
///
/// Doubles as the broker's conversation channel name and the store's
/// partition key. Nobody allocates it: any party derives it with [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId(String);

/// Derive the conversation id shared by `a` and `b`.
///
/// `resolve(a, b) == resolve(b, a)` for every pair.
pub fn resolve(a: &ParticipantId, b: &ParticipantId) -> ConversationId {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    ConversationId(format!("{}{}{}", lo.0, CONVERSATION_SEPARATOR, hi.0))
}

impl ConversationId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdError> {
        let raw = raw.into();
        let Some((left, right)) = raw.split_once(CONVERSATION_SEPARATOR) else {
            return Err(IdError::MalformedConversation(raw));
        };
        let (Ok(a), Ok(b)) = (ParticipantId::new(left), ParticipantId::new(right)) else {
            return Err(IdError::MalformedConversation(raw));
        };
        if a > b {
            // Only the sorted form is canonical.
            return Err(IdError::MalformedConversation(raw));
        }
        Ok(resolve(&a, &b))
    }

    /// Both participants, in canonical (sorted) order.
    pub fn participants(&self) -> (ParticipantId, ParticipantId) {
        // Construction guarantees exactly one separator between two valid ids.
        let (a, b) = self
            .0
            .split_once(CONVERSATION_SEPARATOR)
            .unwrap_or((self.0.as_str(), ""));
        (ParticipantId(a.to_string()), ParticipantId(b.to_string()))
    }

    pub fn involves(&self, who: &ParticipantId) -> bool {
        let (a, b) = self.participants();
        a == *who || b == *who
    }

    /// The participant that is not `me`, if `me` takes part at all.
    pub fn peer_of(&self, me: &ParticipantId) -> Option<ParticipantId> {
        let (a, b) = self.participants();
        if a == *me {
            Some(b)
        } else if b == *me {
            Some(a)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ConversationId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned message identifier. Opaque to everyone else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

impl MessageId {
    pub fn new(raw: impl Into<String>) -> Result<Self, IdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(raw))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MessageId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
