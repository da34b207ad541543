//! Client side of courier: the conversation reconciliation state machine and
//! the async runner that connects it to the gateway and the store.

pub mod conversations;
pub mod dedup;
pub mod runtime;
pub mod session;
pub mod store;
pub mod transport;

pub use conversations::{ConversationEntry, ConversationList, EntryKey};
pub use dedup::RecentIds;
pub use runtime::{ClientConfig, Exit, SessionRunner, Termination, UiEvent, UserAction};
pub use session::{ChatMessage, ChatSession, Effect, MessageSlot, OpenConversation, SendToken, SessionError};
pub use store::{ChatStore, HttpStore};
pub use transport::{GatewayLink, LinkError};
