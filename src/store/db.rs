// SPDX-License-Identifier: MPL-2.0

use crate::store::StoreError;
use crate::store::schema::SCHEMA;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Handle to the engine database for a specific user
#[derive(Clone)]
pub struct StoreDb {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    user_did: String,
}

impl StoreDb {
    /// Open or create the engine database for a user
    /// Path: ~/.local/share/skylimit/{user_did}/engine.db
    pub fn open(user_did: &str) -> Result<Self, StoreError> {
        let path = Self::db_path(user_did)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Path(format!("failed to create data dir: {}", e)))?;
        }

        let conn = Connection::open(&path)?;
        Self::migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            user_did: user_did.to_string(),
        })
    }

    /// In-memory database, used by tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            user_did: "did:plc:test".to_string(),
        })
    }

    /// Open at an explicit path (reload tests, non-XDG deployments)
    pub fn open_at(path: &std::path::Path, user_did: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Path(format!("failed to create data dir: {}", e)))?;
        }

        let conn = Connection::open(path)?;
        Self::migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            user_did: user_did.to_string(),
        })
    }

    /// Run schema migrations
    fn migrate(conn: &Connection) -> Result<(), StoreError> {
        // Execute the schema (all CREATE IF NOT EXISTS)
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Get XDG data directory path for the database
    fn db_path(user_did: &str) -> Result<PathBuf, StoreError> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| StoreError::Path("could not find data directory".to_string()))?;

        // Sanitize DID for filesystem (replace : with _)
        let safe_did = user_did.replace(':', "_");

        Ok(data_dir.join("skylimit").join(safe_did).join("engine.db"))
    }

    /// Access connection for operations
    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    /// Get current unix timestamp in milliseconds
    pub fn now_ms() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Prune entries older than the retention horizon, together with their
    /// decisions. Decisions for entries still in the log are kept whatever
    /// their age, so redisplay stays stable.
    pub fn cleanup_stale(&self, retention_ms: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        let cutoff = Self::now_ms() - retention_ms;

        conn.execute("DELETE FROM entries WHERE post_timestamp_ms < ?", [cutoff])?;

        conn.execute(
            r#"
            DELETE FROM decisions
            WHERE computed_at_ms < ?
            AND unique_id NOT IN (SELECT unique_id FROM entries)
            "#,
            [cutoff],
        )?;

        Ok(())
    }
}
