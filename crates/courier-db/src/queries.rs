use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use courier_types::api::{ConversationSummary, Draft, StoreError, StoredMessage};
use courier_types::models::{MessageKind, Participant, Role};
use courier_types::{ConversationId, MessageId, ParticipantId, resolve};

use crate::Database;
use crate::models::{ConversationRow, MessageRow, UserRow, format_timestamp};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, sender_name, receiver_id, \
     receiver_name, message, message_type, file_url, file_name, file_type, is_read, created_at";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &ParticipantId, display_name: &str, role: Role) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, display_name, role) VALUES (?1, ?2, ?3)",
                (id.as_str(), display_name, role.as_str()),
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &ParticipantId) -> Result<Option<Participant>> {
        self.with_conn(|conn| query_user(conn, id.as_str()))?
            .map(UserRow::into_participant)
            .transpose()
    }

    /// Returns false when the user does not exist.
    pub fn set_suspended(&self, id: &ParticipantId, suspended: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET suspended = ?2 WHERE id = ?1",
                params![id.as_str(), suspended],
            )?;
            Ok(changed > 0)
        })
    }

    /// Returns false when the user does not exist.
    pub fn record_force_logout(&self, id: &ParticipantId, at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET force_logout_at = ?2 WHERE id = ?1",
                params![id.as_str(), format_timestamp(at)],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Messages --

    /// Persist one message from `sender_id` to `receiver_id`.
    ///
    /// Contract failures surface as a [`StoreError`] inside the returned
    /// `anyhow::Error`; callers recover it with `downcast_ref`.
    pub fn persist_message(
        &self,
        sender_id: &ParticipantId,
        receiver_id: &ParticipantId,
        draft: &Draft,
    ) -> Result<StoredMessage> {
        if sender_id == receiver_id {
            return Err(StoreError::Invalid("cannot message yourself".into()).into());
        }
        if draft.message_type == MessageKind::Text && draft.message.trim().is_empty() {
            return Err(StoreError::Invalid("message is required".into()).into());
        }
        if draft.message_type != MessageKind::Text && draft.file.is_none() {
            return Err(StoreError::Invalid("attachment is required".into()).into());
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let sender = match query_user(&tx, sender_id.as_str())? {
                Some(row) => row.into_participant()?,
                None => return Err(StoreError::Unauthorized("sender not found".into()).into()),
            };
            if !sender.can_chat() {
                return Err(StoreError::Unauthorized(
                    "your account is suspended and cannot send messages".into(),
                )
                .into());
            }

            let receiver = match query_user(&tx, receiver_id.as_str())? {
                Some(row) => row.into_participant()?,
                None => return Err(StoreError::NotFound("receiver not found".into()).into()),
            };
            if !receiver.can_chat() {
                return Err(StoreError::Unauthorized(
                    "recipient account is suspended or inactive".into(),
                )
                .into());
            }

            let stored = StoredMessage {
                id: MessageId::generate(),
                conversation_id: resolve(sender_id, receiver_id),
                sender_id: sender.id,
                sender_name: sender.display_name,
                receiver_id: receiver.id,
                receiver_name: receiver.display_name,
                message: draft.message.clone(),
                message_type: draft.message_type,
                file_url: draft.file.as_ref().map(|f| f.url.clone()),
                file_name: draft.file.as_ref().map(|f| f.name.clone()),
                file_type: draft.file.as_ref().and_then(|f| f.mime.clone()),
                is_read: false,
                timestamp: Utc::now(),
            };

            tx.execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    stored.id.as_str(),
                    stored.conversation_id.as_str(),
                    stored.sender_id.as_str(),
                    stored.sender_name,
                    stored.receiver_id.as_str(),
                    stored.receiver_name,
                    stored.message,
                    stored.message_type.as_str(),
                    stored.file_url,
                    stored.file_name,
                    stored.file_type,
                    stored.is_read,
                    format_timestamp(stored.timestamp),
                ],
            )?;
            tx.commit()?;

            debug!(
                "Persisted message {} in {}",
                stored.id, stored.conversation_id
            );
            Ok(stored)
        })
    }

    /// Message history of one conversation, oldest first. `before` pages
    /// backwards from the oldest message of a previous page.
    pub fn get_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE conversation_id = ?1 AND (?2 IS NULL OR created_at < ?2) \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(
                    params![conversation_id.as_str(), before.map(format_timestamp), limit],
                    map_message_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut messages = rows
            .into_iter()
            .map(MessageRow::into_message)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// One summary per conversation `identity` took part in, newest first.
    pub fn list_conversations(&self, identity: &ParticipantId) -> Result<Vec<ConversationSummary>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "WITH ranked AS (
                    SELECT m.*, ROW_NUMBER() OVER (
                        PARTITION BY m.conversation_id
                        ORDER BY m.created_at DESC, m.rowid DESC
                    ) AS rn
                    FROM messages m
                    WHERE m.sender_id = ?1 OR m.receiver_id = ?1
                )
                SELECT
                    r.conversation_id,
                    CASE WHEN r.sender_id = ?1 THEN r.receiver_id ELSE r.sender_id END,
                    CASE WHEN r.sender_id = ?1 THEN r.receiver_name ELSE r.sender_name END,
                    r.message,
                    r.created_at,
                    (SELECT COUNT(*) FROM messages u
                        WHERE u.conversation_id = r.conversation_id
                          AND u.receiver_id = ?1
                          AND u.is_read = 0)
                FROM ranked r
                WHERE r.rn = 1
                ORDER BY r.created_at DESC",
            )?;
            let rows = stmt
                .query_map([identity.as_str()], |row| {
                    Ok(ConversationRow {
                        conversation_id: row.get(0)?,
                        peer_id: row.get(1)?,
                        peer_name: row.get(2)?,
                        last_message: row.get(3)?,
                        last_message_time: row.get(4)?,
                        unread: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(ConversationRow::into_summary).collect()
    }

    /// Mark every message addressed to `identity` in the conversation as read.
    pub fn mark_read(&self, conversation_id: &ConversationId, identity: &ParticipantId) -> Result<u64> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ?1 AND receiver_id = ?2 AND is_read = 0",
                (conversation_id.as_str(), identity.as_str()),
            )?;
            Ok(changed as u64)
        })
    }

    pub fn unread_count(&self, identity: &ParticipantId) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                [identity.as_str()],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
    }
}

fn query_user(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let row = conn
        .query_row(
            "SELECT id, display_name, role, suspended, active FROM users WHERE id = ?1",
            [id],
            |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    role: row.get(2)?,
                    suspended: row.get(3)?,
                    active: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        receiver_id: row.get(4)?,
        receiver_name: row.get(5)?,
        message: row.get(6)?,
        message_type: row.get(7)?,
        file_url: row.get(8)?,
        file_name: row.get(9)?,
        file_type: row.get(10)?,
        is_read: row.get(11)?,
        created_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user(&pid("U1"), "alice", Role::User).unwrap();
        db.create_user(&pid("U2"), "bob", Role::User).unwrap();
        db.create_user(&pid("ADM"), "root@example.com", Role::Admin).unwrap();
        db
    }

    fn store_error(err: &anyhow::Error) -> StoreError {
        err.downcast_ref::<StoreError>().cloned().expect("store error")
    }

    #[test]
    fn persist_derives_canonical_conversation() {
        let db = seeded();
        let stored = db.persist_message(&pid("U2"), &pid("U1"), &Draft::text("hi")).unwrap();
        assert_eq!(stored.conversation_id.as_str(), "U1-U2");
        assert_eq!(stored.sender_name, "bob");
        assert_eq!(stored.receiver_name, "alice");
        assert!(!stored.is_read);
    }

    #[test]
    fn persist_rejects_suspended_and_unknown_parties() {
        let db = seeded();
        let err = db.persist_message(&pid("U1"), &pid("GHOST"), &Draft::text("hi")).unwrap_err();
        assert!(matches!(store_error(&err), StoreError::NotFound(_)));

        db.set_suspended(&pid("U1"), true).unwrap();
        let err = db.persist_message(&pid("U1"), &pid("U2"), &Draft::text("hi")).unwrap_err();
        assert!(matches!(store_error(&err), StoreError::Unauthorized(_)));
        let err = db.persist_message(&pid("U2"), &pid("U1"), &Draft::text("hi")).unwrap_err();
        assert!(matches!(store_error(&err), StoreError::Unauthorized(_)));

        let err = db.persist_message(&pid("U2"), &pid("U2"), &Draft::text("hi")).unwrap_err();
        assert!(matches!(store_error(&err), StoreError::Invalid(_)));
        let err = db.persist_message(&pid("U2"), &pid("ADM"), &Draft::text("  ")).unwrap_err();
        assert!(matches!(store_error(&err), StoreError::Invalid(_)));
    }

    #[test]
    fn conversations_report_latest_message_and_unread() {
        let db = seeded();
        db.persist_message(&pid("U1"), &pid("U2"), &Draft::text("one")).unwrap();
        db.persist_message(&pid("U1"), &pid("U2"), &Draft::text("two")).unwrap();
        db.persist_message(&pid("ADM"), &pid("U2"), &Draft::text("notice")).unwrap();

        let list = db.list_conversations(&pid("U2")).unwrap();
        assert_eq!(list.len(), 2);
        let with_u1 = list.iter().find(|c| c.peer_id == pid("U1")).unwrap();
        assert_eq!(with_u1.conversation_id.as_str(), "U1-U2");
        assert_eq!(with_u1.peer_name, "alice");
        assert_eq!(with_u1.last_message.as_deref(), Some("two"));
        assert_eq!(with_u1.unread_count, 2);

        // The sender has nothing unread.
        let list = db.list_conversations(&pid("U1")).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].unread_count, 0);
        assert_eq!(list[0].peer_name, "bob");

        assert_eq!(db.unread_count(&pid("U2")).unwrap(), 3);
        let conv = resolve(&pid("U1"), &pid("U2"));
        assert_eq!(db.mark_read(&conv, &pid("U2")).unwrap(), 2);
        assert_eq!(db.mark_read(&conv, &pid("U2")).unwrap(), 0);
        assert_eq!(db.unread_count(&pid("U2")).unwrap(), 1);
    }

    #[test]
    fn history_is_oldest_first_and_pages_backwards() {
        let db = seeded();
        for body in ["a", "b", "c"] {
            db.persist_message(&pid("U1"), &pid("U2"), &Draft::text(body)).unwrap();
        }
        let conv = resolve(&pid("U1"), &pid("U2"));
        let all = db.get_messages(&conv, 50, None).unwrap();
        let bodies: Vec<_> = all.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, ["a", "b", "c"]);

        let last_two = db.get_messages(&conv, 2, None).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].message, "c");
    }

    #[test]
    fn admin_flags_report_missing_users() {
        let db = seeded();
        assert!(db.set_suspended(&pid("U1"), true).unwrap());
        assert!(db.get_user(&pid("U1")).unwrap().unwrap().suspended);
        assert!(!db.set_suspended(&pid("NOBODY"), true).unwrap());
        assert!(db.record_force_logout(&pid("U2"), Utc::now()).unwrap());
        assert!(!db.record_force_logout(&pid("NOBODY"), Utc::now()).unwrap());
    }
}
