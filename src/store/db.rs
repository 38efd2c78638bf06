//! SQLite database handle — connection wrapper and migrations.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

/// Shared database handle wrapping a SQLite connection behind a Mutex.
///
/// Using `Mutex` (not `RwLock`) because rusqlite `Connection` is `!Sync`.
/// All DB access is serialized; WAL keeps file readers and the writer from
/// blocking each other.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path and run
    /// migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(format!(
                            "failed to create directory {}: {}",
                            parent.display(),
                            e
                        )),
                    )
                })?;
            }
        }

        let conn = Connection::open(path)?;
        let db = Self::configure(conn)?;
        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, StoreError> {
        // WAL for reader/writer concurrency; the pragma returns the new mode.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a lock on the underlying connection.
    ///
    /// Callers hold the lock for the duration of their DB operation.
    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("Database mutex poisoned")
    }

    /// Run all schema migrations. Additive-only, idempotent.
    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS emails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT UNIQUE,
                from_addr TEXT NOT NULL,
                to_addrs TEXT NOT NULL,
                cc_addrs TEXT,
                subject TEXT,
                text_body TEXT,
                html_body TEXT,
                raw_message BLOB,
                headers TEXT,
                attachments TEXT,
                received_at TEXT NOT NULL,
                processed_at TEXT,
                mailbox_name TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
            );
            CREATE INDEX IF NOT EXISTS idx_emails_status ON emails(status);
            CREATE INDEX IF NOT EXISTS idx_emails_mailbox ON emails(mailbox_name);
            CREATE INDEX IF NOT EXISTS idx_emails_received ON emails(received_at);

            CREATE TABLE IF NOT EXISTS processing_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email_id INTEGER NOT NULL,
                step TEXT NOT NULL,
                input TEXT,
                output TEXT,
                error TEXT,
                duration_ms INTEGER,
                created_at TEXT NOT NULL,
                FOREIGN KEY (email_id) REFERENCES emails(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_logs_email ON processing_logs(email_id);

            CREATE TABLE IF NOT EXISTS tool_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email_id INTEGER NOT NULL,
                tool_name TEXT NOT NULL,
                arguments TEXT,
                result TEXT,
                error TEXT,
                duration_ms INTEGER,
                called_at TEXT NOT NULL,
                FOREIGN KEY (email_id) REFERENCES emails(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_tool_calls_email ON tool_calls(email_id);

            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email_id INTEGER NOT NULL,
                filename TEXT NOT NULL,
                content_type TEXT,
                size INTEGER,
                content_id TEXT,
                data BLOB,
                FOREIGN KEY (email_id) REFERENCES emails(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_attachments_email ON attachments(email_id);",
        )?;

        Ok(())
    }
}
