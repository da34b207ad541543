pub mod api;
pub mod events;
pub mod ids;
pub mod models;

pub use ids::{ConversationId, IdError, MessageId, ParticipantId, resolve};
