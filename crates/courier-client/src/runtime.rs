use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use courier_types::api::{ConversationSummary, Draft, StoreError, StoredMessage};
use courier_types::events::{ClientCommand, ControlSignal, ServerEvent};
use courier_types::models::Role;
use courier_types::{ConversationId, MessageId, ParticipantId};

use crate::session::{ChatSession, Effect, SendToken, SessionError};
use crate::store::ChatStore;
use crate::transport::{GatewayLink, LinkError};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://127.0.0.1:3000/gateway`
    pub gateway_url: String,
    pub identity: ParticipantId,
    pub display_name: String,
    pub role: Role,
    pub reconnect_attempts: u32,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl ClientConfig {
    pub fn new(
        gateway_url: impl Into<String>,
        identity: ParticipantId,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            identity,
            display_name: display_name.into(),
            role: Role::User,
            reconnect_attempts: 5,
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(5),
        }
    }
}

/// Input from the user interface.
#[derive(Debug, Clone)]
pub enum UserAction {
    OpenPeer { peer: ParticipantId, name: String },
    OpenConversation(ConversationId),
    CloseConversation,
    Send(Draft),
    /// Disconnect and hand back the session
    Quit,
}

/// Output for the user interface.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Identify was accepted by the gateway
    Ready { online: Vec<ParticipantId> },
    Reconnecting { attempt: u32 },
    Notified {
        message_id: MessageId,
        sender_name: String,
        preview: String,
    },
    SendQueued(SendToken),
    MessageSent(MessageId),
    SendFailed { token: SendToken, error: StoreError },
    ConversationsUpdated,
    HistoryLoaded(ConversationId),
    Rejected(SessionError),
}

/// A session ended by a control signal.
#[derive(Debug)]
pub struct Termination {
    pub signal: ControlSignal,
    pub session: ChatSession,
}

#[derive(Debug)]
pub enum Exit {
    /// The user quit
    Closed(ChatSession),
    Terminated(Termination),
    /// The gateway stayed unreachable after every reconnect attempt
    Unreachable { session: ChatSession, error: LinkError },
}

enum Completion {
    Sent(SendToken, Result<StoredMessage, StoreError>),
    Conversations(Result<Vec<ConversationSummary>, StoreError>),
    History(ConversationId, Result<Vec<StoredMessage>, StoreError>),
    MarkedRead(ConversationId, Result<u64, StoreError>),
}

/// Drives a [`ChatSession`]: feeds it user actions, gateway events and store
/// completions, and carries out the effects it returns.
pub struct SessionRunner<S> {
    config: ClientConfig,
    session: ChatSession,
    store: Arc<S>,
    tasks: JoinSet<Completion>,
    ui: mpsc::UnboundedSender<UiEvent>,
}

impl<S: ChatStore> SessionRunner<S> {
    pub fn new(config: ClientConfig, store: S, ui: mpsc::UnboundedSender<UiEvent>) -> Self {
        let session = ChatSession::new(config.identity.clone(), config.display_name.clone());
        Self {
            config,
            session,
            store: Arc::new(store),
            tasks: JoinSet::new(),
            ui,
        }
    }

    pub async fn run(mut self, mut actions: mpsc::UnboundedReceiver<UserAction>) -> Exit {
        let mut link = match self.establish().await {
            Ok(link) => link,
            Err(e) => {
                warn!("Gateway connection failed: {}", e);
                match self.reconnect().await {
                    Ok(link) => link,
                    Err(error) => return self.unreachable(error),
                }
            }
        };

        loop {
            let effects = tokio::select! {
                action = actions.recv() => match action {
                    Some(UserAction::Quit) | None => {
                        self.tasks.abort_all();
                        link.close().await;
                        info!("{} left the gateway", self.config.identity);
                        return Exit::Closed(self.session);
                    }
                    Some(action) => self.on_action(action),
                },
                event = link.next_event() => match event {
                    Some(Ok(event)) => self.on_event(event),
                    lost => {
                        match lost {
                            Some(Err(e)) => warn!("Gateway link failed: {}", e),
                            _ => info!("Gateway closed the connection"),
                        }
                        match self.reconnect().await {
                            Ok(new_link) => link = new_link,
                            Err(error) => return self.unreachable(error),
                        }
                        Vec::new()
                    }
                },
                Some(done) = self.tasks.join_next(), if !self.tasks.is_empty() => self.on_completion(done),
            };

            if let Some(signal) = self.execute(&mut link, effects).await {
                self.tasks.abort_all();
                link.close().await;
                info!("{} terminated: {}", self.config.identity, signal.message());
                return Exit::Terminated(Termination {
                    signal,
                    session: self.session,
                });
            }
        }
    }

    fn unreachable(mut self, error: LinkError) -> Exit {
        self.tasks.abort_all();
        Exit::Unreachable {
            session: self.session,
            error,
        }
    }

    /// Connect, identify, rejoin the open conversation and refetch the list.
    async fn establish(&mut self) -> Result<GatewayLink, LinkError> {
        let mut link = GatewayLink::connect(&self.config.gateway_url).await?;
        link.send(&ClientCommand::Identify {
            id: self.config.identity.clone(),
            role: self.config.role,
        })
        .await?;
        if let Some(room) = self.session.open().conversation_id().cloned() {
            link.send(&ClientCommand::Join { room }).await?;
        }
        self.spawn_refetch();
        Ok(link)
    }

    async fn reconnect(&mut self) -> Result<GatewayLink, LinkError> {
        let mut delay = self.config.reconnect_initial_delay;
        let mut last_error = LinkError::Closed;
        for attempt in 1..=self.config.reconnect_attempts {
            let _ = self.ui.send(UiEvent::Reconnecting { attempt });
            tokio::time::sleep(with_jitter(delay)).await;
            match self.establish().await {
                Ok(link) => {
                    info!("Reconnected to gateway after {} attempt(s)", attempt);
                    return Ok(link);
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    last_error = e;
                }
            }
            delay = (delay * 2).min(self.config.reconnect_max_delay);
        }
        Err(last_error)
    }

    fn on_action(&mut self, action: UserAction) -> Vec<Effect> {
        let result = match action {
            UserAction::OpenPeer { peer, name } => self.session.open_peer(peer, name),
            UserAction::OpenConversation(id) => self.session.open_conversation(id),
            UserAction::CloseConversation => Ok(self.session.close_conversation()),
            UserAction::Send(draft) => self.session.begin_send(draft).map(|out| {
                let store = self.store.clone();
                self.tasks.spawn(async move {
                    let result = store.persist_message(&out.receiver_id, &out.draft).await;
                    Completion::Sent(out.token, result)
                });
                let _ = self.ui.send(UiEvent::SendQueued(out.token));
                Vec::new()
            }),
            UserAction::Quit => Ok(Vec::new()),
        };
        result.unwrap_or_else(|e| {
            debug!("Action rejected: {}", e);
            let _ = self.ui.send(UiEvent::Rejected(e));
            Vec::new()
        })
    }

    fn on_event(&mut self, event: ServerEvent) -> Vec<Effect> {
        if let ServerEvent::Ready { online, .. } = &event {
            let _ = self.ui.send(UiEvent::Ready {
                online: online.clone(),
            });
        }
        self.session.handle(event)
    }

    fn on_completion(&mut self, done: Result<Completion, JoinError>) -> Vec<Effect> {
        let completion = match done {
            Ok(completion) => completion,
            Err(e) => {
                if !e.is_cancelled() {
                    warn!("Store task failed: {}", e);
                }
                return Vec::new();
            }
        };
        match completion {
            Completion::Sent(token, result) => self.session.complete_send(token, result),
            Completion::Conversations(Ok(list)) => {
                let effects = self.session.replace_conversations(list);
                let _ = self.ui.send(UiEvent::ConversationsUpdated);
                effects
            }
            Completion::Conversations(Err(e)) => {
                warn!("Conversation refetch failed: {}", e);
                Vec::new()
            }
            Completion::History(id, Ok(history)) => {
                self.session.load_messages(&id, history);
                let _ = self.ui.send(UiEvent::HistoryLoaded(id));
                Vec::new()
            }
            Completion::History(id, Err(e)) => {
                warn!("History of {} failed to load: {}", id, e);
                Vec::new()
            }
            Completion::MarkedRead(id, result) => {
                match result {
                    Ok(count) => debug!("Marked {} message(s) read in {}", count, id),
                    Err(e) => warn!("Mark-read of {} failed: {}", id, e),
                }
                Vec::new()
            }
        }
    }

    /// Carry out effects in order. Returns the control signal if one of them
    /// ends the session; nothing after it runs.
    async fn execute(&mut self, link: &mut GatewayLink, effects: Vec<Effect>) -> Option<ControlSignal> {
        for effect in effects {
            match effect {
                Effect::Join(room) => self.send(link, ClientCommand::Join { room }).await,
                Effect::Leave(room) => self.send(link, ClientCommand::Leave { room }).await,
                Effect::Publish(event) => {
                    let id = event.id.clone();
                    self.send(link, ClientCommand::NewMessage(event)).await;
                    let _ = self.ui.send(UiEvent::MessageSent(id));
                }
                Effect::RefetchConversations => self.spawn_refetch(),
                Effect::FetchMessages(id) => {
                    let store = self.store.clone();
                    self.tasks.spawn(async move {
                        let result = store.fetch_messages(&id).await;
                        Completion::History(id, result)
                    });
                }
                Effect::MarkRead(id) => {
                    let store = self.store.clone();
                    self.tasks.spawn(async move {
                        let result = store.mark_read(&id).await;
                        Completion::MarkedRead(id, result)
                    });
                }
                Effect::Notify {
                    message_id,
                    sender_name,
                    preview,
                } => {
                    let _ = self.ui.send(UiEvent::Notified {
                        message_id,
                        sender_name,
                        preview,
                    });
                }
                Effect::SendFailed { token, error } => {
                    let _ = self.ui.send(UiEvent::SendFailed { token, error });
                }
                Effect::Terminate(signal) => return Some(signal),
            }
        }
        None
    }

    /// A lost command is a delivery miss; recipients recover on refetch.
    async fn send(&self, link: &mut GatewayLink, command: ClientCommand) {
        if let Err(e) = link.send(&command).await {
            warn!("Gateway send failed: {}", e);
        }
    }

    fn spawn_refetch(&mut self) {
        let store = self.store.clone();
        self.tasks.spawn(async move { Completion::Conversations(store.list_conversations().await) });
    }
}

/// Add up to 50% random jitter to a backoff delay.
fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = (delay.as_millis() / 2) as u64;
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_half_the_delay() {
        let base = Duration::from_secs(1);
        for _ in 0..100 {
            let jittered = with_jitter(base);
            assert!(jittered >= base);
            assert!(jittered <= base + base / 2);
        }
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn default_config_matches_reconnect_policy() {
        let config = ClientConfig::new("ws://localhost/gateway", ParticipantId::new("U1").unwrap(), "u1");
        assert_eq!(config.reconnect_attempts, 5);
        assert_eq!(config.reconnect_initial_delay, Duration::from_secs(1));
        assert_eq!(config.reconnect_max_delay, Duration::from_secs(5));
        assert_eq!(config.role, Role::User);
    }
}
