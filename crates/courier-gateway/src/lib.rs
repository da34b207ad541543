//! Real-time delivery for courier: who is connected where, and how a
//! published message reaches every socket that should see it.

pub mod broker;
pub mod connection;
pub mod registry;

pub use broker::{Broker, PublishReport};
pub use registry::{BindOutcome, Channel, ConnectionId, ConnectionRegistry};
