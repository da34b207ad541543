//! SQLite-backed store of record for participants and their messages.

pub mod migrations;
pub mod models;
pub mod queries;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::info;

/// One shared connection. Every query holds the lock for its whole
/// statement sequence, so a send's sender/receiver checks and its insert
/// see the same rows.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the message store at `path` and bring its schema up
    /// to date.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open message store at {}", path.display()))?;
        // Readers (history, unread counts) must not block on a writer
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self::prepare(conn)?;
        info!("Message store ready at {}", path.display());
        Ok(db)
    }

    /// Private in-memory store for tests and throwaway servers.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("message store lock poisoned by a panicked query"))
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        f(&*self.lock()?)
    }

    /// Like [`with_conn`](Self::with_conn), for work that opens a transaction.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        f(&mut *self.lock()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::ParticipantId;
    use courier_types::models::Role;

    #[test]
    fn reopening_a_store_keeps_its_participants() {
        let path = std::env::temp_dir().join(format!("courier-db-{}.db", std::process::id()));
        let cleanup = |path: &Path| {
            for suffix in ["", "-wal", "-shm"] {
                let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
            }
        };
        cleanup(&path);

        let uma = ParticipantId::new("U1").unwrap();
        let db = Database::open(&path).unwrap();
        db.create_user(&uma, "Uma", Role::Admin).unwrap();
        drop(db);

        let db = Database::open(&path).unwrap();
        let user = db.get_user(&uma).unwrap().unwrap();
        assert_eq!(user.display_name, "Uma");
        assert_eq!(user.role, Role::Admin);
        drop(db);
        cleanup(&path);
    }
}
