use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use courier_types::events::{ControlSignal, DeliveryEvent, ServerEvent};
use courier_types::models::Role;
use courier_types::{ConversationId, ParticipantId};

use crate::registry::{BindOutcome, Channel, ConnectionId, ConnectionRegistry};

/// How one publish was fanned out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections reached through the conversation channel
    pub via_conversation: usize,
    /// Connections reached only through a participant's identity channel
    pub via_identity: usize,
    /// Targets whose queue was already closed
    pub missed: usize,
}

/// Routes events to connections. Cheap to clone; every clone shares one registry.
#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    registry: ConnectionRegistry,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Register a fresh, unbound connection.
    pub async fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        self.inner.registry.register().await
    }

    /// Bind a connection to `identity`, greet it with `Ready`, and announce the
    /// identity to everyone else if this is its first live connection.
    pub async fn identify(&self, conn_id: ConnectionId, identity: ParticipantId, role: Role) -> BindOutcome {
        let outcome = self
            .inner
            .registry
            .bind(conn_id, identity.clone(), role)
            .await;

        match &outcome {
            BindOutcome::Bound { first_for_identity } => {
                info!("Connection {} identified as {} ({})", conn_id, identity, role);
                if *first_for_identity {
                    let mut others = self.inner.registry.bound_connections().await;
                    others.remove(&conn_id);
                    self.inner
                        .registry
                        .send_to(
                            &others,
                            &ServerEvent::Presence {
                                id: identity.clone(),
                                online: true,
                            },
                        )
                        .await;
                }
                self.greet(conn_id, identity).await;
            }
            BindOutcome::AlreadyBound => {
                debug!("Connection {} re-identified as {}", conn_id, identity);
                self.greet(conn_id, identity).await;
            }
            BindOutcome::Rejected { current } => {
                warn!(
                    "Connection {} bound to {} tried to identify as {}, ignored",
                    conn_id, current, identity
                );
            }
            BindOutcome::UnknownConnection => {}
        }
        outcome
    }

    async fn greet(&self, conn_id: ConnectionId, identity: ParticipantId) {
        let online = self.inner.registry.online_identities().await;
        self.inner
            .registry
            .send_to([&conn_id], &ServerEvent::Ready { id: identity, online })
            .await;
    }

    pub async fn join(&self, conn_id: ConnectionId, conversation: &ConversationId) {
        if self
            .inner
            .registry
            .join_conversation(conn_id, conversation)
            .await
        {
            debug!("Connection {} joined {}", conn_id, conversation);
        }
    }

    pub async fn leave(&self, conn_id: ConnectionId, conversation: &ConversationId) {
        if self
            .inner
            .registry
            .leave_conversation(conn_id, conversation)
            .await
        {
            debug!("Connection {} left {}", conn_id, conversation);
        }
    }

    /// Deliver a message to every connection that should see it, at most once each.
    ///
    /// Connections in the conversation channel get it first. Connections bound
    /// to the sender or receiver get it too unless they were already reached
    /// through the conversation channel.
    pub async fn publish(&self, event: DeliveryEvent) -> PublishReport {
        let registry = &self.inner.registry;
        let in_room = registry
            .members_of(&Channel::Conversation(event.conversation_id.clone()))
            .await;

        let mut by_identity: HashSet<ConnectionId> = HashSet::new();
        for participant in event.participants() {
            for conn_id in registry.members_of(&Channel::Identity(participant)).await {
                if !in_room.contains(&conn_id) {
                    by_identity.insert(conn_id);
                }
            }
        }

        let conversation_id = event.conversation_id.clone();
        let message_id = event.id.clone();
        let wire = ServerEvent::NewMessage(event);
        let (room_delivered, room_missed) = registry.send_to(&in_room, &wire).await;
        let (identity_delivered, identity_missed) = registry.send_to(&by_identity, &wire).await;

        let report = PublishReport {
            via_conversation: room_delivered,
            via_identity: identity_delivered,
            missed: room_missed + identity_missed,
        };
        debug!(
            "Published {} in {}: {} via room, {} via identity, {} missed",
            message_id, conversation_id, report.via_conversation, report.via_identity, report.missed
        );
        report
    }

    /// Push a control signal to every live connection of `identity`.
    /// The payload is not interpreted. Returns how many connections it reached.
    pub async fn send_control(&self, identity: &ParticipantId, signal: ControlSignal) -> usize {
        let targets = self
            .inner
            .registry
            .members_of(&Channel::Identity(identity.clone()))
            .await;
        let (delivered, _) = self
            .inner
            .registry
            .send_to(&targets, &ServerEvent::from(signal))
            .await;
        info!("Control signal for {} reached {} connection(s)", identity, delivered);
        delivered
    }

    /// Tear down a connection. Announces the identity as offline when this was
    /// its last connection.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        if let Some(identity) = self.inner.registry.on_disconnect(conn_id).await {
            let others = self.inner.registry.bound_connections().await;
            self.inner
                .registry
                .send_to(
                    &others,
                    &ServerEvent::Presence {
                        id: identity,
                        online: false,
                    },
                )
                .await;
        }
    }
}
