// SPDX-License-Identifier: MPL-2.0

use crate::source::Account;
use crate::store::{StoreDb, StoreError};
use rusqlite::params;

/// User action on a followee's amp factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmpDirection {
    Up,
    Down,
}

/// Per-followee record driving the admission policy.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowState {
    pub did: String,
    pub handle: String,
    /// Exposure multiplier, default 1. Doubled or halved by user action,
    /// clamped to [MIN_AMP, MAX_AMP].
    pub amp_factor: f64,
    /// Posts per day over the statistics window, absent until the first
    /// aggregation pass.
    pub observed_post_rate: Option<f64>,
}

pub const MIN_AMP: f64 = 1.0 / 16.0;
pub const MAX_AMP: f64 = 16.0;

/// Cache operations for the follow list
pub struct FollowStore<'a> {
    db: &'a StoreDb,
}

impl<'a> FollowStore<'a> {
    pub fn new(db: &'a StoreDb) -> Self {
        Self { db }
    }

    /// Upsert a page of follows. Amp factors and observed rates survive
    /// re-syncs; only the handle is refreshed.
    pub fn upsert(&self, accounts: &[Account]) -> Result<(), StoreError> {
        if accounts.is_empty() {
            return Ok(());
        }

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let now = StoreDb::now_ms();

        for account in accounts {
            tx.execute(
                r#"
                INSERT INTO follows (did, handle, amp_factor, fetched_at)
                VALUES (?1, ?2, 1.0, ?3)
                ON CONFLICT(did) DO UPDATE SET
                    handle = excluded.handle,
                    fetched_at = excluded.fetched_at
                "#,
                params![account.did, account.handle, now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, did: &str) -> Result<Option<FollowState>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT did, handle, amp_factor, observed_post_rate FROM follows WHERE did = ?",
        )?;

        match stmt.query_row([did], Self::row_to_state) {
            Ok(state) => Ok(Some(state)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn all(&self) -> Result<Vec<FollowState>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT did, handle, amp_factor, observed_post_rate FROM follows ORDER BY handle",
        )?;

        let mut rows = stmt.query([])?;
        let mut follows = Vec::new();
        while let Some(row) = rows.next()? {
            follows.push(Self::row_to_state(row)?);
        }
        Ok(follows)
    }

    /// Double or halve a followee's amp factor, clamped. Returns the new
    /// state, or NotFound for an unknown account.
    pub fn bump_amp(&self, did: &str, direction: AmpDirection) -> Result<FollowState, StoreError> {
        let current = self.get(did)?.ok_or(StoreError::NotFound)?;

        let factor = match direction {
            AmpDirection::Up => current.amp_factor * 2.0,
            AmpDirection::Down => current.amp_factor / 2.0,
        }
        .clamp(MIN_AMP, MAX_AMP);

        let conn = self.db.conn();
        conn.execute(
            "UPDATE follows SET amp_factor = ? WHERE did = ?",
            params![factor, did],
        )?;

        Ok(FollowState {
            amp_factor: factor,
            ..current
        })
    }

    /// Write the observed post rates produced by an aggregation pass.
    pub fn set_rates(&self, rates: &[(String, f64)]) -> Result<(), StoreError> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        for (did, rate) in rates {
            tx.execute(
                "UPDATE follows SET observed_post_rate = ? WHERE did = ?",
                params![rate, did],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn row_to_state(row: &rusqlite::Row) -> Result<FollowState, rusqlite::Error> {
        Ok(FollowState {
            did: row.get(0)?,
            handle: row.get(1)?,
            amp_factor: row.get(2)?,
            observed_post_rate: row.get(3)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(did: &str, handle: &str) -> Account {
        Account::minimal(did.to_string(), handle.to_string(), None)
    }

    #[test]
    fn upsert_preserves_amp_and_rate() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = FollowStore::new(&db);

        store.upsert(&[account("did:plc:a", "a.test")]).unwrap();
        store.bump_amp("did:plc:a", AmpDirection::Up).unwrap();
        store.set_rates(&[("did:plc:a".to_string(), 12.5)]).unwrap();

        // Re-sync with a renamed handle
        store.upsert(&[account("did:plc:a", "a.example")]).unwrap();

        let state = store.get("did:plc:a").unwrap().unwrap();
        assert_eq!(state.handle, "a.example");
        assert_eq!(state.amp_factor, 2.0);
        assert_eq!(state.observed_post_rate, Some(12.5));
    }

    #[test]
    fn amp_doubles_halves_and_clamps() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = FollowStore::new(&db);
        store.upsert(&[account("did:plc:a", "a.test")]).unwrap();

        for _ in 0..10 {
            store.bump_amp("did:plc:a", AmpDirection::Up).unwrap();
        }
        assert_eq!(store.get("did:plc:a").unwrap().unwrap().amp_factor, MAX_AMP);

        for _ in 0..20 {
            store.bump_amp("did:plc:a", AmpDirection::Down).unwrap();
        }
        assert_eq!(store.get("did:plc:a").unwrap().unwrap().amp_factor, MIN_AMP);
    }

    #[test]
    fn bump_unknown_account_is_not_found() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = FollowStore::new(&db);
        assert!(matches!(
            store.bump_amp("did:plc:ghost", AmpDirection::Up),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn all_is_sorted_by_handle() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = FollowStore::new(&db);
        store
            .upsert(&[account("did:plc:z", "zed.test"), account("did:plc:a", "abe.test")])
            .unwrap();

        let handles: Vec<String> = store.all().unwrap().into_iter().map(|f| f.handle).collect();
        assert_eq!(handles, vec!["abe.test", "zed.test"]);
    }
}
