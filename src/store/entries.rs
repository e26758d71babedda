// SPDX-License-Identifier: MPL-2.0

use crate::source::{FeedEntry, FeedItem};
use crate::store::{StoreDb, StoreError};
use rusqlite::params;

/// Singleton fetch metadata: pagination cursor and cached-window boundaries.
/// Created on first append, widened monotonically, cleared only by `clear`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchMetadata {
    pub last_cursor: Option<String>,
    pub newest_ms: Option<i64>,
    pub oldest_ms: Option<i64>,
    pub last_lookback_ms: Option<i64>,
}

/// The Feed Store: persisted, timestamp-ordered log of fetched entries.
pub struct EntryStore<'a> {
    db: &'a StoreDb,
}

impl<'a> EntryStore<'a> {
    pub fn new(db: &'a StoreDb) -> Self {
        Self { db }
    }

    /// Append a batch of entries in one transaction. Idempotent on
    /// `unique_id`: re-appending a stored entry is a no-op. Widens the
    /// newest/oldest boundaries, never narrows them. Returns the number
    /// of entries actually inserted.
    pub fn append(
        &self,
        entries: &[FeedEntry],
        cursor: Option<&str>,
    ) -> Result<usize, StoreError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let now = StoreDb::now_ms();

        let mut inserted = 0;
        for entry in entries {
            let item_json = serde_json::to_string(&entry.item)?;
            inserted += tx.execute(
                r#"
                INSERT OR IGNORE INTO entries (
                    unique_id, post_timestamp_ms, author_id, item_json, fetch_cursor, fetched_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    entry.unique_id,
                    entry.post_timestamp_ms,
                    entry.author_id,
                    item_json,
                    entry.fetch_cursor,
                    now,
                ],
            )?;
        }

        let batch_newest = entries.iter().map(|e| e.post_timestamp_ms).max();
        let batch_oldest = entries.iter().map(|e| e.post_timestamp_ms).min();

        tx.execute(
            r#"
            INSERT INTO fetch_meta (id, last_cursor, newest_ms, oldest_ms)
            VALUES (0, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                last_cursor = excluded.last_cursor,
                newest_ms = MAX(COALESCE(fetch_meta.newest_ms, excluded.newest_ms), excluded.newest_ms),
                oldest_ms = MIN(COALESCE(fetch_meta.oldest_ms, excluded.oldest_ms), excluded.oldest_ms)
            "#,
            params![cursor, batch_newest, batch_oldest],
        )?;

        tx.commit()?;
        Ok(inserted)
    }

    /// The `n` newest entries, newest first, from cache only.
    pub fn get_recent(&self, n: usize) -> Result<Vec<FeedEntry>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT unique_id, post_timestamp_ms, author_id, item_json, fetch_cursor
            FROM entries
            ORDER BY post_timestamp_ms DESC
            LIMIT ?
            "#,
        )?;

        let mut rows = stmt.query([n as i64])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(Self::row_to_entry(row)?);
        }
        Ok(entries)
    }

    /// Up to `n` entries strictly older than `timestamp_ms`, newest first.
    pub fn get_before(&self, timestamp_ms: i64, n: usize) -> Result<Vec<FeedEntry>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT unique_id, post_timestamp_ms, author_id, item_json, fetch_cursor
            FROM entries
            WHERE post_timestamp_ms < ?
            ORDER BY post_timestamp_ms DESC
            LIMIT ?
            "#,
        )?;

        let mut rows = stmt.query(params![timestamp_ms, n as i64])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(Self::row_to_entry(row)?);
        }
        Ok(entries)
    }

    /// Up to `n` entries strictly newer than `timestamp_ms` — the adjacent
    /// ones, not the global newest — returned newest first.
    pub fn get_after(&self, timestamp_ms: i64, n: usize) -> Result<Vec<FeedEntry>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT unique_id, post_timestamp_ms, author_id, item_json, fetch_cursor
            FROM entries
            WHERE post_timestamp_ms > ?
            ORDER BY post_timestamp_ms ASC
            LIMIT ?
            "#,
        )?;

        let mut rows = stmt.query(params![timestamp_ms, n as i64])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(Self::row_to_entry(row)?);
        }
        entries.reverse();
        Ok(entries)
    }

    /// Entries in the window `[since_ms, now]`, for the statistics scan.
    pub fn get_since(&self, since_ms: i64) -> Result<Vec<FeedEntry>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT unique_id, post_timestamp_ms, author_id, item_json, fetch_cursor
            FROM entries
            WHERE post_timestamp_ms >= ?
            ORDER BY post_timestamp_ms DESC
            "#,
        )?;

        let mut rows = stmt.query([since_ms])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(Self::row_to_entry(row)?);
        }
        Ok(entries)
    }

    pub fn metadata(&self) -> Result<FetchMetadata, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT last_cursor, newest_ms, oldest_ms, last_lookback_ms FROM fetch_meta WHERE id = 0",
        )?;

        match stmt.query_row([], |row| {
            Ok(FetchMetadata {
                last_cursor: row.get(0)?,
                newest_ms: row.get(1)?,
                oldest_ms: row.get(2)?,
                last_lookback_ms: row.get(3)?,
            })
        }) {
            Ok(meta) => Ok(meta),
            // The singleton row does not exist until the first append
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(FetchMetadata::default()),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Widen the oldest boundary downward (lookback reached a time bound
    /// that is older than anything actually stored).
    pub fn update_oldest_boundary(&self, timestamp_ms: i64) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            r#"
            INSERT INTO fetch_meta (id, oldest_ms) VALUES (0, ?1)
            ON CONFLICT(id) DO UPDATE SET
                oldest_ms = MIN(COALESCE(fetch_meta.oldest_ms, excluded.oldest_ms), excluded.oldest_ms)
            "#,
            [timestamp_ms],
        )?;
        Ok(())
    }

    /// Record that a lookback backfill ran to completion.
    pub fn set_lookback_completed(&self, timestamp_ms: i64) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            r#"
            INSERT INTO fetch_meta (id, last_lookback_ms) VALUES (0, ?1)
            ON CONFLICT(id) DO UPDATE SET last_lookback_ms = excluded.last_lookback_ms
            "#,
            [timestamp_ms],
        )?;
        Ok(())
    }

    /// Forget lookback completion: a fetch left an unfilled region below
    /// the head, so the next qualifying load must backfill again.
    pub fn invalidate_lookback(&self) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute("UPDATE fetch_meta SET last_lookback_ms = NULL WHERE id = 0", [])?;
        Ok(())
    }

    /// Drop all entries and fetch metadata. Decisions are left alone:
    /// they stay authoritative for any re-fetched post.
    pub fn clear(&self) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM entries", [])?;
        conn.execute("DELETE FROM fetch_meta", [])?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Startup integrity check: every stored entry must have a decision.
    /// A store that could render un-curated content as curated is worse
    /// than an empty one, so any miss clears the log. Returns whether the
    /// store was cleared.
    pub fn validate_against_decisions(&self) -> Result<bool, StoreError> {
        let undecided: i64 = {
            let conn = self.db.conn();
            conn.query_row(
                r#"
                SELECT COUNT(*) FROM entries e
                LEFT JOIN decisions d ON e.unique_id = d.unique_id
                WHERE d.unique_id IS NULL
                "#,
                [],
                |row| row.get(0),
            )?
        };

        if undecided > 0 {
            tracing::warn!(undecided, "entries without decisions, clearing feed store");
            self.clear()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Convert a database row to a FeedEntry
    fn row_to_entry(row: &rusqlite::Row) -> Result<FeedEntry, StoreError> {
        let item_json: String = row.get(3)?;
        let item: FeedItem = serde_json::from_str(&item_json)?;

        Ok(FeedEntry {
            unique_id: row.get(0)?,
            post_timestamp_ms: row.get(1)?,
            author_id: row.get(2)?,
            item,
            fetch_cursor: row.get(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Account, ItemKind};
    use crate::store::{Decision, DecisionStore};

    fn entry(id: &str, ts: i64) -> FeedEntry {
        let item = FeedItem {
            uri: format!("at://did:plc:alice/app.bsky.feed.post/{id}"),
            cid: format!("cid-{id}"),
            author: Account::minimal("did:plc:alice".into(), "alice.test".into(), None),
            text: format!("post {id}"),
            created_at: None,
            indexed_at: "2026-01-01T00:00:00Z".to_string(),
            like_count: 0,
            repost_count: 0,
            reply_count: 0,
            reply_parent: None,
            kind: ItemKind::Original,
        };
        FeedEntry {
            unique_id: item.unique_id(),
            post_timestamp_ms: ts,
            author_id: item.curated_account().did.clone(),
            item,
            fetch_cursor: None,
        }
    }

    #[test]
    fn append_is_idempotent_on_unique_id() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = EntryStore::new(&db);

        let batch: Vec<FeedEntry> = (0..25).map(|i| entry(&format!("a{i}"), 1000 + i)).collect();
        assert_eq!(store.append(&batch, Some("c1")).unwrap(), 25);
        // Second batch of 25 with 10 ids overlapping the first
        let batch2: Vec<FeedEntry> = (15..40).map(|i| entry(&format!("a{i}"), 1000 + i)).collect();
        assert_eq!(store.append(&batch2, Some("c2")).unwrap(), 15);

        assert_eq!(store.count().unwrap(), 40);
    }

    #[test]
    fn overlapping_appends_keep_unique_entries() {
        // 50 entries via two appends of 25 with 10 duplicates -> 40 unique;
        // a third disjoint batch brings the log to 65.
        let db = StoreDb::open_in_memory().unwrap();
        let store = EntryStore::new(&db);

        let first: Vec<FeedEntry> = (0..25).map(|i| entry(&format!("p{i}"), i)).collect();
        let second: Vec<FeedEntry> = (15..40).map(|i| entry(&format!("p{i}"), i)).collect();
        let third: Vec<FeedEntry> = (40..65).map(|i| entry(&format!("p{i}"), i)).collect();
        store.append(&first, None).unwrap();
        store.append(&second, None).unwrap();
        store.append(&third, None).unwrap();

        assert_eq!(store.count().unwrap(), 65);
    }

    #[test]
    fn boundaries_widen_monotonically() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = EntryStore::new(&db);

        store.append(&[entry("m", 5000)], Some("c1")).unwrap();
        store
            .append(&[entry("old", 1000), entry("new", 9000)], Some("c2"))
            .unwrap();
        // A narrower batch must not narrow the boundaries
        store.append(&[entry("mid", 4000)], Some("c3")).unwrap();

        let meta = store.metadata().unwrap();
        assert_eq!(meta.newest_ms, Some(9000));
        assert_eq!(meta.oldest_ms, Some(1000));
        assert_eq!(meta.last_cursor.as_deref(), Some("c3"));

        for e in store.get_recent(100).unwrap() {
            assert!(meta.oldest_ms.unwrap() <= e.post_timestamp_ms);
            assert!(meta.newest_ms.unwrap() >= e.post_timestamp_ms);
        }
    }

    #[test]
    fn before_and_after_windows() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = EntryStore::new(&db);
        let batch: Vec<FeedEntry> = (0..10).map(|i| entry(&format!("w{i}"), i * 100)).collect();
        store.append(&batch, None).unwrap();

        let before = store.get_before(500, 3).unwrap();
        assert_eq!(
            before.iter().map(|e| e.post_timestamp_ms).collect::<Vec<_>>(),
            vec![400, 300, 200]
        );

        // Adjacent newer entries, newest-first
        let after = store.get_after(500, 2).unwrap();
        assert_eq!(
            after.iter().map(|e| e.post_timestamp_ms).collect::<Vec<_>>(),
            vec![700, 600]
        );
    }

    #[test]
    fn oldest_boundary_only_widens() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = EntryStore::new(&db);
        store.append(&[entry("x", 5000)], None).unwrap();

        store.update_oldest_boundary(2000).unwrap();
        assert_eq!(store.metadata().unwrap().oldest_ms, Some(2000));
        // Narrowing attempt is ignored
        store.update_oldest_boundary(4000).unwrap();
        assert_eq!(store.metadata().unwrap().oldest_ms, Some(2000));
    }

    #[test]
    fn metadata_is_default_before_first_append() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = EntryStore::new(&db);
        assert_eq!(store.metadata().unwrap(), FetchMetadata::default());
    }

    #[test]
    fn invalidated_lookback_reads_as_never_run() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = EntryStore::new(&db);
        store.append(&[entry("x", 5000)], None).unwrap();

        store.set_lookback_completed(4000).unwrap();
        assert_eq!(store.metadata().unwrap().last_lookback_ms, Some(4000));

        store.invalidate_lookback().unwrap();
        assert_eq!(store.metadata().unwrap().last_lookback_ms, None);
        // The rest of the singleton survives
        assert_eq!(store.metadata().unwrap().newest_ms, Some(5000));
    }

    #[test]
    fn clear_resets_metadata() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = EntryStore::new(&db);
        store.append(&[entry("x", 5000)], Some("cur")).unwrap();
        store.clear().unwrap();

        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(store.metadata().unwrap(), FetchMetadata::default());
    }

    #[test]
    fn undecided_entry_clears_the_store() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = EntryStore::new(&db);
        let decisions = DecisionStore::new(&db);

        let a = entry("a", 100);
        let b = entry("b", 200);
        store.append(&[a.clone(), b.clone()], None).unwrap();
        decisions
            .put_many(&[Decision::keep(a.unique_id.clone(), 0)])
            .unwrap();

        // b has no decision: fail safe, clear everything
        assert!(store.validate_against_decisions().unwrap());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn fully_decided_store_survives_validation() {
        let db = StoreDb::open_in_memory().unwrap();
        let store = EntryStore::new(&db);
        let decisions = DecisionStore::new(&db);

        let a = entry("a", 100);
        store.append(&[a.clone()], None).unwrap();
        decisions
            .put_many(&[Decision::keep(a.unique_id.clone(), 0)])
            .unwrap();

        assert!(!store.validate_against_decisions().unwrap());
        assert_eq!(store.count().unwrap(), 1);
    }
}
