use std::collections::{HashMap, HashSet};

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace};
use uuid::Uuid;

use courier_types::events::ServerEvent;
use courier_types::models::Role;
use courier_types::{ConversationId, ParticipantId};

/// Identifies one transport session. Never reused.
pub type ConnectionId = Uuid;

/// A broadcast group. Identity and conversation names live in separate
/// namespaces, so a participant id can never collide with a room name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Every connection bound to this participant
    Identity(ParticipantId),
    /// Every connection that joined this conversation
    Conversation(ConversationId),
}

/// Result of a bind attempt. First bind wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// Newly bound. `first_for_identity` is true when no other live
    /// connection was bound to the same participant.
    Bound { first_for_identity: bool },
    /// Already bound to the same participant; nothing changed.
    AlreadyBound,
    /// Already bound to someone else; the request was ignored.
    Rejected { current: ParticipantId },
    /// The connection is gone.
    UnknownConnection,
}

struct ConnectionState {
    identity: Option<(ParticipantId, Role)>,
    joined: HashSet<ConversationId>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionState>,
    channels: HashMap<Channel, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn add_member(&mut self, channel: Channel, conn_id: ConnectionId) {
        self.channels.entry(channel).or_default().insert(conn_id);
    }

    fn remove_member(&mut self, channel: &Channel, conn_id: ConnectionId) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.channels.remove(channel);
            }
        }
    }
}

/// In-memory table of live connections and their channel memberships.
///
/// Owned by one [`Broker`](crate::Broker); nothing here survives a restart.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection. The receiver yields every event routed to it.
    pub async fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().await.connections.insert(
            conn_id,
            ConnectionState {
                identity: None,
                joined: HashSet::new(),
                tx,
            },
        );
        (conn_id, rx)
    }

    pub async fn bind(&self, conn_id: ConnectionId, identity: ParticipantId, role: Role) -> BindOutcome {
        let mut inner = self.inner.write().await;
        let Some(state) = inner.connections.get_mut(&conn_id) else {
            return BindOutcome::UnknownConnection;
        };
        match &state.identity {
            Some((current, _)) if *current == identity => return BindOutcome::AlreadyBound,
            Some((current, _)) => {
                return BindOutcome::Rejected {
                    current: current.clone(),
                };
            }
            None => {}
        }
        state.identity = Some((identity.clone(), role));

        let channel = Channel::Identity(identity);
        let first_for_identity = inner.channels.get(&channel).is_none_or(|m| m.is_empty());
        inner.add_member(channel, conn_id);
        BindOutcome::Bound { first_for_identity }
    }

    /// Returns true if the membership changed. Joining twice is a no-op.
    pub async fn join_conversation(&self, conn_id: ConnectionId, conversation: &ConversationId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(state) = inner.connections.get_mut(&conn_id) else {
            return false;
        };
        if !state.joined.insert(conversation.clone()) {
            return false;
        }
        inner.add_member(Channel::Conversation(conversation.clone()), conn_id);
        true
    }

    /// Returns true if the membership changed. Leaving a room never joined is a no-op.
    pub async fn leave_conversation(&self, conn_id: ConnectionId, conversation: &ConversationId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(state) = inner.connections.get_mut(&conn_id) else {
            return false;
        };
        if !state.joined.remove(conversation) {
            return false;
        }
        inner.remove_member(&Channel::Conversation(conversation.clone()), conn_id);
        true
    }

    pub async fn members_of(&self, channel: &Channel) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .await
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn identity_of(&self, conn_id: ConnectionId) -> Option<(ParticipantId, Role)> {
        self.inner
            .read()
            .await
            .connections
            .get(&conn_id)
            .and_then(|state| state.identity.clone())
    }

    /// Participants with at least one bound connection.
    pub async fn online_identities(&self) -> Vec<ParticipantId> {
        let inner = self.inner.read().await;
        let mut online: Vec<ParticipantId> = inner
            .channels
            .keys()
            .filter_map(|channel| match channel {
                Channel::Identity(id) => Some(id.clone()),
                Channel::Conversation(_) => None,
            })
            .collect();
        online.sort();
        online
    }

    /// Every connection that has identified.
    pub async fn bound_connections(&self) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .await
            .connections
            .iter()
            .filter(|(_, state)| state.identity.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Hand `event` to each target's outbound queue. Never blocks: queues are
    /// unbounded and a closed queue only counts as a miss.
    /// Returns (delivered, missed).
    pub async fn send_to<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a ConnectionId>,
        event: &ServerEvent,
    ) -> (usize, usize) {
        let inner = self.inner.read().await;
        let (mut delivered, mut missed) = (0, 0);
        for conn_id in targets {
            match inner.connections.get(conn_id) {
                Some(state) if state.tx.send(event.clone()).is_ok() => delivered += 1,
                _ => {
                    trace!("Delivery miss for connection {}", conn_id);
                    missed += 1;
                }
            }
        }
        (delivered, missed)
    }

    /// Forget a connection and every membership it held. Returns the
    /// participant whose last connection this was, if any.
    pub async fn on_disconnect(&self, conn_id: ConnectionId) -> Option<ParticipantId> {
        let mut inner = self.inner.write().await;
        let state = inner.connections.remove(&conn_id)?;

        for conversation in state.joined {
            inner.remove_member(&Channel::Conversation(conversation), conn_id);
        }

        let (identity, _) = state.identity?;
        let channel = Channel::Identity(identity.clone());
        inner.remove_member(&channel, conn_id);
        let went_offline = !inner.channels.contains_key(&channel);
        debug!(
            "Connection {} of {} removed (offline: {})",
            conn_id, identity, went_offline
        );
        went_offline.then_some(identity)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn room(s: &str) -> ConversationId {
        ConversationId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn first_bind_wins() {
        let registry = ConnectionRegistry::new();
        let (c1, _rx1) = registry.register().await;
        let (c2, _rx2) = registry.register().await;

        assert_eq!(
            registry.bind(c1, pid("A"), Role::User).await,
            BindOutcome::Bound { first_for_identity: true }
        );
        assert_eq!(registry.bind(c1, pid("A"), Role::User).await, BindOutcome::AlreadyBound);
        assert_eq!(
            registry.bind(c1, pid("B"), Role::User).await,
            BindOutcome::Rejected { current: pid("A") }
        );
        assert_eq!(
            registry.bind(c2, pid("A"), Role::User).await,
            BindOutcome::Bound { first_for_identity: false }
        );
        assert_eq!(
            registry.members_of(&Channel::Identity(pid("A"))).await,
            HashSet::from([c1, c2])
        );
        assert!(registry.members_of(&Channel::Identity(pid("B"))).await.is_empty());
    }

    #[tokio::test]
    async fn join_and_leave_are_idempotent() {
        let registry = ConnectionRegistry::new();
        let (c1, _rx) = registry.register().await;

        assert!(registry.join_conversation(c1, &room("A-B")).await);
        assert!(!registry.join_conversation(c1, &room("A-B")).await);
        assert_eq!(
            registry.members_of(&Channel::Conversation(room("A-B"))).await,
            HashSet::from([c1])
        );

        assert!(registry.leave_conversation(c1, &room("A-B")).await);
        assert!(!registry.leave_conversation(c1, &room("A-B")).await);
        assert!(!registry.leave_conversation(c1, &room("C-D")).await);
        assert!(registry.members_of(&Channel::Conversation(room("A-B"))).await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_drops_every_membership() {
        let registry = ConnectionRegistry::new();
        let (c1, _rx1) = registry.register().await;
        let (c2, _rx2) = registry.register().await;
        registry.bind(c1, pid("A"), Role::User).await;
        registry.bind(c2, pid("A"), Role::User).await;
        registry.join_conversation(c1, &room("A-B")).await;

        assert_eq!(registry.on_disconnect(c1).await, None);
        assert!(registry.members_of(&Channel::Conversation(room("A-B"))).await.is_empty());
        assert_eq!(registry.online_identities().await, vec![pid("A")]);

        assert_eq!(registry.on_disconnect(c2).await, Some(pid("A")));
        assert!(registry.online_identities().await.is_empty());
        assert_eq!(registry.on_disconnect(c2).await, None);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn send_counts_misses_without_failing() {
        let registry = ConnectionRegistry::new();
        let (c1, mut rx1) = registry.register().await;
        let (c2, rx2) = registry.register().await;
        drop(rx2);
        let gone = Uuid::new_v4();

        let event = ServerEvent::ForceLogout { message: "bye".into() };
        let (delivered, missed) = registry.send_to([c1, c2, gone].iter(), &event).await;
        assert_eq!((delivered, missed), (1, 2));
        assert_eq!(rx1.recv().await, Some(event));
    }
}
