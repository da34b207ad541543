//! Client-side conversation reconciliation.
//!
//! [`ChatSession`] is a single-threaded state machine. Every input (user
//! intent, gateway event, store completion) mutates local state and returns
//! the [`Effect`]s an executor must carry out. Local send completions and
//! broker events may arrive in either order; whichever lands first decides
//! the final state and the other is inert.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use courier_types::api::{ConversationSummary, Draft, StoreError, StoredMessage};
use courier_types::events::{ControlSignal, DeliveryEvent, ServerEvent};
use courier_types::models::{FileRef, MessageKind};
use courier_types::{ConversationId, MessageId, ParticipantId, resolve};

use crate::conversations::ConversationList;
use crate::dedup::RecentIds;

/// Local handle for an optimistic send, valid until the store answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendToken(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSlot {
    /// Echoed locally, not yet confirmed by the store
    Pending(SendToken),
    Confirmed(MessageId),
}

/// A message in the open conversation view.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub slot: MessageSlot,
    pub sender_id: ParticipantId,
    pub sender_name: String,
    pub receiver_id: ParticipantId,
    pub message: String,
    pub message_type: MessageKind,
    pub file: Option<FileRef>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn is_pending(&self) -> bool {
        matches!(self.slot, MessageSlot::Pending(_))
    }

    pub fn id(&self) -> Option<&MessageId> {
        match &self.slot {
            MessageSlot::Confirmed(id) => Some(id),
            MessageSlot::Pending(_) => None,
        }
    }
}

impl From<DeliveryEvent> for ChatMessage {
    fn from(event: DeliveryEvent) -> Self {
        let file = event.file();
        Self {
            slot: MessageSlot::Confirmed(event.id),
            sender_id: event.sender_id,
            sender_name: event.sender_name,
            receiver_id: event.receiver_id,
            message: event.message,
            message_type: event.message_type,
            file,
            timestamp: event.timestamp,
        }
    }
}

impl From<StoredMessage> for ChatMessage {
    fn from(stored: StoredMessage) -> Self {
        DeliveryEvent::from(stored).into()
    }
}

/// What is on screen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OpenConversation {
    #[default]
    None,
    /// Peer chosen, nothing persisted yet
    Provisional { peer: ParticipantId },
    Canonical { id: ConversationId, peer: ParticipantId },
}

impl OpenConversation {
    pub fn peer(&self) -> Option<&ParticipantId> {
        match self {
            Self::None => None,
            Self::Provisional { peer } | Self::Canonical { peer, .. } => Some(peer),
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Canonical { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// A send accepted by the session, to be handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub token: SendToken,
    pub receiver_id: ParticipantId,
    pub draft: Draft,
}

/// Work the session asks its executor to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Join a conversation channel on the gateway
    Join(ConversationId),
    Leave(ConversationId),
    /// Publish a persisted message through the gateway
    Publish(DeliveryEvent),
    RefetchConversations,
    FetchMessages(ConversationId),
    MarkRead(ConversationId),
    /// Fires at most once per message id
    Notify {
        message_id: MessageId,
        sender_name: String,
        preview: String,
    },
    SendFailed { token: SendToken, error: StoreError },
    /// The session is over; drop the connection and re-authenticate
    Terminate(ControlSignal),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no conversation is open")]
    NoOpenConversation,
    #[error("cannot open a conversation with yourself")]
    SelfAddressed,
    #[error("conversation {0} does not involve this participant")]
    NotAParticipant(ConversationId),
    #[error("session was terminated")]
    Terminated,
}

#[derive(Debug, Clone)]
pub struct ChatSession {
    me: ParticipantId,
    my_name: String,
    conversations: ConversationList,
    open: OpenConversation,
    messages: Vec<ChatMessage>,
    recent: RecentIds,
    in_flight: HashMap<SendToken, ParticipantId>,
    next_token: u64,
    online: HashSet<ParticipantId>,
    terminated: Option<ControlSignal>,
}

impl ChatSession {
    pub fn new(me: ParticipantId, my_name: impl Into<String>) -> Self {
        Self {
            me,
            my_name: my_name.into(),
            conversations: ConversationList::new(),
            open: OpenConversation::None,
            messages: Vec::new(),
            recent: RecentIds::new(),
            in_flight: HashMap::new(),
            next_token: 0,
            online: HashSet::new(),
            terminated: None,
        }
    }

    pub fn identity(&self) -> &ParticipantId {
        &self.me
    }

    pub fn conversations(&self) -> &ConversationList {
        &self.conversations
    }

    pub fn open(&self) -> &OpenConversation {
        &self.open
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_online(&self, peer: &ParticipantId) -> bool {
        self.online.contains(peer)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn termination(&self) -> Option<&ControlSignal> {
        self.terminated.as_ref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_some()
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        match self.terminated {
            Some(_) => Err(SessionError::Terminated),
            None => Ok(()),
        }
    }

    // -- User intents --

    /// Open a chat with `peer`. Uses the existing conversation if the list
    /// has one, otherwise synthesizes a provisional entry.
    pub fn open_peer(
        &mut self,
        peer: ParticipantId,
        peer_name: impl Into<String>,
    ) -> Result<Vec<Effect>, SessionError> {
        self.ensure_live()?;
        if peer == self.me {
            return Err(SessionError::SelfAddressed);
        }
        let canonical = resolve(&self.me, &peer);
        if self.conversations.canonical(&canonical).is_some() {
            return self.open_conversation(canonical);
        }
        if matches!(&self.open, OpenConversation::Provisional { peer: p } if *p == peer) {
            return Ok(Vec::new());
        }

        let effects = self.leave_current();
        let online = self.online.contains(&peer);
        self.conversations
            .insert_provisional(peer.clone(), peer_name.into(), online);
        debug!("{} opened provisional conversation with {}", self.me, peer);
        self.open = OpenConversation::Provisional { peer };
        self.messages.clear();
        Ok(effects)
    }

    pub fn open_conversation(&mut self, id: ConversationId) -> Result<Vec<Effect>, SessionError> {
        self.ensure_live()?;
        let peer = id
            .peer_of(&self.me)
            .ok_or_else(|| SessionError::NotAParticipant(id.clone()))?;
        if peer == self.me {
            return Err(SessionError::SelfAddressed);
        }

        if self.open.conversation_id() == Some(&id) {
            self.conversations.reset_unread(&id);
            return Ok(vec![Effect::MarkRead(id)]);
        }

        let mut effects = self.leave_current();
        self.conversations.promote(&peer, &id);
        self.conversations.reset_unread(&id);
        self.open = OpenConversation::Canonical {
            id: id.clone(),
            peer,
        };
        self.messages.clear();
        effects.push(Effect::Join(id.clone()));
        effects.push(Effect::FetchMessages(id.clone()));
        effects.push(Effect::MarkRead(id));
        Ok(effects)
    }

    /// Close whatever is open.
    pub fn close_conversation(&mut self) -> Vec<Effect> {
        self.messages.clear();
        self.leave_current()
    }

    fn leave_current(&mut self) -> Vec<Effect> {
        match std::mem::take(&mut self.open) {
            OpenConversation::Canonical { id, .. } => vec![Effect::Leave(id)],
            _ => Vec::new(),
        }
    }

    /// First phase of a send: echo the draft as a pending message in the open
    /// view. The caller persists it and reports back through
    /// [`complete_send`](Self::complete_send).
    pub fn begin_send(&mut self, draft: Draft) -> Result<OutgoingMessage, SessionError> {
        self.ensure_live()?;
        let peer = self
            .open
            .peer()
            .cloned()
            .ok_or(SessionError::NoOpenConversation)?;

        let token = SendToken(self.next_token);
        self.next_token += 1;
        self.messages.push(ChatMessage {
            slot: MessageSlot::Pending(token),
            sender_id: self.me.clone(),
            sender_name: self.my_name.clone(),
            receiver_id: peer.clone(),
            message: draft.message.clone(),
            message_type: draft.message_type,
            file: draft.file.clone(),
            timestamp: Utc::now(),
        });
        self.in_flight.insert(token, peer.clone());

        Ok(OutgoingMessage {
            token,
            receiver_id: peer,
            draft,
        })
    }

    /// Second phase of a send. Results arriving after termination are discarded.
    pub fn complete_send(
        &mut self,
        token: SendToken,
        result: Result<StoredMessage, StoreError>,
    ) -> Vec<Effect> {
        if self.terminated.is_some() {
            debug!("Discarding send result {:?} after termination", token);
            return Vec::new();
        }
        if self.in_flight.remove(&token).is_none() {
            return Vec::new();
        }

        let stored = match result {
            Ok(stored) => stored,
            Err(error) => {
                warn!("Send {:?} failed: {}", token, error);
                self.messages
                    .retain(|m| m.slot != MessageSlot::Pending(token));
                return vec![Effect::SendFailed { token, error }];
            }
        };

        let peer = stored.receiver_id.clone();
        let id = stored.conversation_id.clone();
        let mut effects = self.promote(&peer, &id);

        // A send started here always reaches the gateway. The id may already
        // be on screen from history or another device's echo; then the
        // pending copy goes.
        self.recent.insert(stored.id.clone());
        let pending = self
            .messages
            .iter()
            .position(|m| m.slot == MessageSlot::Pending(token));
        let shown = self
            .messages
            .iter()
            .any(|m| m.id() == Some(&stored.id));
        match pending {
            Some(idx) if shown => {
                self.messages.remove(idx);
            }
            Some(idx) => {
                let message = &mut self.messages[idx];
                message.slot = MessageSlot::Confirmed(stored.id.clone());
                message.timestamp = stored.timestamp;
            }
            None => {}
        }

        let online = self.online.contains(&peer);
        self.conversations
            .ensure_canonical(&id, &peer, &stored.receiver_name, online);
        let stale_preview = self
            .conversations
            .canonical(&id)
            .is_some_and(|e| e.last_message_time.is_none_or(|t| t <= stored.timestamp));
        if stale_preview {
            self.conversations
                .record_message(&id, &stored.message, stored.timestamp, false);
        }

        effects.push(Effect::Publish(DeliveryEvent::from(stored)));
        effects
    }

    // -- Inbound --

    /// Dispatch one gateway event.
    pub fn handle(&mut self, event: ServerEvent) -> Vec<Effect> {
        match event {
            ServerEvent::Ready { online, .. } => {
                self.online = online.into_iter().collect();
                self.conversations.refresh_online(&self.online);
                Vec::new()
            }
            ServerEvent::Presence { id, online } => {
                self.set_presence(id, online);
                Vec::new()
            }
            ServerEvent::NewMessage(event) => self.apply_event(event),
            ServerEvent::UserSuspended { message } => {
                self.handle_control(ControlSignal::Suspended { message })
            }
            ServerEvent::ForceLogout { message } => {
                self.handle_control(ControlSignal::ForceLogout { message })
            }
        }
    }

    /// Apply one delivery event. Applying the same event again changes nothing.
    pub fn apply_event(&mut self, event: DeliveryEvent) -> Vec<Effect> {
        if self.terminated.is_some() {
            return Vec::new();
        }
        let Some(peer) = event.peer_of(&self.me).cloned() else {
            warn!("Ignoring message {} not addressed to {}", event.id, self.me);
            return Vec::new();
        };
        if peer == self.me || !event.is_well_addressed() {
            warn!(
                "Ignoring misaddressed message {} in {}",
                event.id, event.conversation_id
            );
            return Vec::new();
        }
        if !self.recent.insert(event.id.clone()) {
            trace!("Duplicate delivery of {}", event.id);
            return Vec::new();
        }

        let mine = event.sender_id == self.me;
        let mut effects = Vec::new();
        if !mine {
            effects.push(Effect::Notify {
                message_id: event.id.clone(),
                sender_name: event.sender_name.clone(),
                preview: event.message.clone(),
            });
        }

        effects.extend(self.promote(&peer, &event.conversation_id));

        let conversation_id = event.conversation_id.clone();
        let is_open = self.open.conversation_id() == Some(&conversation_id);
        let known = self.conversations.record_message(
            &conversation_id,
            &event.message,
            event.timestamp,
            !is_open && !mine,
        );
        if !known {
            debug!(
                "Message {} references unknown conversation {}, refetching",
                event.id, conversation_id
            );
            effects.push(Effect::RefetchConversations);
        }

        if is_open {
            self.messages.push(ChatMessage::from(event));
            if !mine {
                effects.push(Effect::MarkRead(conversation_id));
            }
        }
        effects
    }

    /// Install the canonical id for `peer`, re-keying a provisional list
    /// entry and, if it is on screen, the open view.
    fn promote(&mut self, peer: &ParticipantId, id: &ConversationId) -> Vec<Effect> {
        if *id != resolve(&self.me, peer) {
            return Vec::new();
        }
        if self.conversations.promote(peer, id) {
            debug!("Promoted provisional conversation with {} to {}", peer, id);
        }
        match &self.open {
            OpenConversation::Provisional { peer: open_peer } if open_peer == peer => {
                self.open = OpenConversation::Canonical {
                    id: id.clone(),
                    peer: peer.clone(),
                };
                vec![Effect::Join(id.clone())]
            }
            _ => Vec::new(),
        }
    }

    pub fn set_presence(&mut self, peer: ParticipantId, online: bool) {
        self.conversations.set_online(&peer, online);
        if online {
            self.online.insert(peer);
        } else {
            self.online.remove(&peer);
        }
    }

    // -- Store completions --

    /// Adopt the store's conversation list.
    pub fn replace_conversations(&mut self, summaries: Vec<ConversationSummary>) -> Vec<Effect> {
        if self.terminated.is_some() {
            return Vec::new();
        }
        self.conversations.replace_all(summaries, &self.online);

        let mut effects = Vec::new();
        if let OpenConversation::Provisional { peer } = &self.open {
            let peer = peer.clone();
            let id = resolve(&self.me, &peer);
            if self.conversations.canonical(&id).is_some() {
                effects.extend(self.promote(&peer, &id));
                effects.push(Effect::FetchMessages(id));
            }
        }
        if let Some(id) = self.open.conversation_id().cloned() {
            let unread = self.conversations.canonical(&id).map_or(0, |e| e.unread);
            if unread > 0 {
                self.conversations.reset_unread(&id);
                effects.push(Effect::MarkRead(id));
            }
        }
        effects
    }

    /// Replace the open view with fetched history. Messages that arrived
    /// meanwhile and pending sends are kept after it.
    pub fn load_messages(&mut self, id: &ConversationId, history: Vec<StoredMessage>) {
        if self.terminated.is_some() || self.open.conversation_id() != Some(id) {
            return;
        }

        let known: HashSet<MessageId> = history.iter().map(|m| m.id.clone()).collect();
        let mut merged = Vec::with_capacity(history.len() + self.messages.len());
        for stored in history {
            self.recent.insert(stored.id.clone());
            merged.push(ChatMessage::from(stored));
        }

        let mut pending = Vec::new();
        for message in self.messages.drain(..) {
            match &message.slot {
                MessageSlot::Confirmed(mid) if known.contains(mid) => {}
                MessageSlot::Confirmed(_) => merged.push(message),
                MessageSlot::Pending(_) => pending.push(message),
            }
        }
        merged.extend(pending);
        self.messages = merged;
    }

    // -- Control --

    /// End the session. Local state is invalidated and every later input,
    /// including in-flight send results, is ignored.
    pub fn handle_control(&mut self, signal: ControlSignal) -> Vec<Effect> {
        if self.terminated.is_some() {
            return Vec::new();
        }
        info!("Session of {} terminated: {}", self.me, signal.message());
        self.in_flight.clear();
        self.open = OpenConversation::None;
        self.messages.clear();
        self.conversations.clear();
        self.recent.clear();
        self.online.clear();
        self.terminated = Some(signal.clone());
        vec![Effect::Terminate(signal)]
    }
}
