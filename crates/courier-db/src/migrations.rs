use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            display_name    TEXT NOT NULL,
            role            TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('user', 'admin')),
            suspended       INTEGER NOT NULL DEFAULT 0,
            active          INTEGER NOT NULL DEFAULT 1,
            force_logout_at TEXT,
            created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            sender_id       TEXT NOT NULL REFERENCES users(id),
            sender_name     TEXT NOT NULL,
            receiver_id     TEXT NOT NULL REFERENCES users(id),
            receiver_name   TEXT NOT NULL,
            message         TEXT NOT NULL DEFAULT '',
            message_type    TEXT NOT NULL DEFAULT 'text',
            file_url        TEXT,
            file_name       TEXT,
            file_type       TEXT,
            is_read         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_receiver_unread
            ON messages(receiver_id, is_read);

        CREATE INDEX IF NOT EXISTS idx_messages_sender
            ON messages(sender_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
