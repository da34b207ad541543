use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};

use courier_types::api::ConversationSummary;
use courier_types::{ConversationId, ParticipantId};

/// How a list entry is addressed. A provisional entry exists only on this
/// client, before any message with the peer was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Provisional(ParticipantId),
    Canonical(ConversationId),
}

impl EntryKey {
    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Canonical(id) => Some(id),
            Self::Provisional(_) => None,
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(peer) => write!(f, "temp_{peer}"),
            Self::Canonical(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    pub key: EntryKey,
    pub peer_id: ParticipantId,
    pub peer_name: String,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread: u32,
    pub online: bool,
}

impl ConversationEntry {
    fn from_summary(summary: ConversationSummary, online: bool) -> Self {
        Self {
            key: EntryKey::Canonical(summary.conversation_id),
            peer_id: summary.peer_id,
            peer_name: summary.peer_name,
            last_message: summary.last_message,
            last_message_time: summary.last_message_time,
            unread: summary.unread_count,
            online,
        }
    }
}

/// The client's conversation list, most recent activity first.
///
/// At most one entry exists per peer: a provisional entry is swapped for the
/// canonical one in place, never duplicated.
#[derive(Debug, Clone, Default)]
pub struct ConversationList {
    entries: Vec<ConversationEntry>,
}

impl ConversationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &EntryKey) -> Option<&ConversationEntry> {
        self.entries.iter().find(|e| e.key == *key)
    }

    pub fn canonical(&self, id: &ConversationId) -> Option<&ConversationEntry> {
        self.entries
            .iter()
            .find(|e| e.key.conversation_id() == Some(id))
    }

    /// The entry for `peer`, provisional or canonical.
    pub fn for_peer(&self, peer: &ParticipantId) -> Option<&ConversationEntry> {
        self.entries.iter().find(|e| e.peer_id == *peer)
    }

    pub fn total_unread(&self) -> u32 {
        self.entries.iter().map(|e| e.unread).sum()
    }

    fn position_canonical(&self, id: &ConversationId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.key.conversation_id() == Some(id))
    }

    fn position_provisional(&self, peer: &ParticipantId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| matches!(&e.key, EntryKey::Provisional(p) if p == peer))
    }

    /// Synthesize an empty entry for `peer` unless one already exists.
    /// Returns the key of the entry that now represents the peer.
    pub fn insert_provisional(&mut self, peer: ParticipantId, peer_name: String, online: bool) -> EntryKey {
        if let Some(existing) = self.for_peer(&peer) {
            return existing.key.clone();
        }
        let key = EntryKey::Provisional(peer.clone());
        self.entries.insert(
            0,
            ConversationEntry {
                key: key.clone(),
                peer_id: peer,
                peer_name,
                last_message: None,
                last_message_time: None,
                unread: 0,
                online,
            },
        );
        key
    }

    /// Install the canonical id for `peer`. A provisional entry is re-keyed in
    /// place, or dropped when a canonical entry is already present. Returns
    /// true if the list changed.
    pub fn promote(&mut self, peer: &ParticipantId, canonical: &ConversationId) -> bool {
        let Some(idx) = self.position_provisional(peer) else {
            return false;
        };
        if self.position_canonical(canonical).is_some() {
            self.entries.remove(idx);
        } else {
            self.entries[idx].key = EntryKey::Canonical(canonical.clone());
        }
        true
    }

    /// Make sure a canonical entry for `id` exists, promoting the peer's
    /// provisional entry or creating an empty one at the front.
    pub fn ensure_canonical(&mut self, id: &ConversationId, peer: &ParticipantId, peer_name: &str, online: bool) {
        if self.position_canonical(id).is_some() || self.promote(peer, id) {
            return;
        }
        self.entries.insert(
            0,
            ConversationEntry {
                key: EntryKey::Canonical(id.clone()),
                peer_id: peer.clone(),
                peer_name: peer_name.to_string(),
                last_message: None,
                last_message_time: None,
                unread: 0,
                online,
            },
        );
    }

    /// Update preview and time, optionally count one unread message, and move
    /// the entry to the front. Returns false if the conversation is unknown.
    pub fn record_message(
        &mut self,
        id: &ConversationId,
        preview: &str,
        at: DateTime<Utc>,
        count_unread: bool,
    ) -> bool {
        let Some(idx) = self.position_canonical(id) else {
            return false;
        };
        let mut entry = self.entries.remove(idx);
        entry.last_message = Some(preview.to_string());
        entry.last_message_time = Some(at);
        if count_unread {
            entry.unread = entry.unread.saturating_add(1);
        }
        self.entries.insert(0, entry);
        true
    }

    pub fn reset_unread(&mut self, id: &ConversationId) {
        if let Some(idx) = self.position_canonical(id) {
            self.entries[idx].unread = 0;
        }
    }

    pub fn set_online(&mut self, peer: &ParticipantId, online: bool) {
        for entry in self.entries.iter_mut().filter(|e| e.peer_id == *peer) {
            entry.online = online;
        }
    }

    pub fn refresh_online(&mut self, online: &HashSet<ParticipantId>) {
        for entry in &mut self.entries {
            entry.online = online.contains(&entry.peer_id);
        }
    }

    /// Merge the store's view into the list. Provisional entries survive
    /// unless the store now knows their conversation. A local canonical entry
    /// the fetch lacks, or holds an older message for, was updated after the
    /// fetch was issued and is kept as is.
    pub fn replace_all(
        &mut self,
        summaries: Vec<ConversationSummary>,
        online: &HashSet<ParticipantId>,
    ) {
        let mut local = std::mem::take(&mut self.entries);
        let mut merged: Vec<ConversationEntry> = Vec::with_capacity(summaries.len() + local.len());

        for summary in summaries {
            let is_online = online.contains(&summary.peer_id);
            let fetched = ConversationEntry::from_summary(summary, is_online);
            let newer_local = local.iter().position(|e| {
                e.key == fetched.key && e.last_message_time > fetched.last_message_time
            });
            match newer_local {
                Some(idx) => {
                    let mut entry = local.remove(idx);
                    entry.online = is_online;
                    merged.push(entry);
                }
                None => merged.push(fetched),
            }
        }

        local.retain(|e| !merged.iter().any(|m| m.peer_id == e.peer_id));
        let (mut entries, kept): (Vec<_>, Vec<_>) =
            local.into_iter().partition(|e| e.key.is_provisional());
        merged.extend(kept);
        merged.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
        entries.extend(merged);
        self.entries = entries;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
