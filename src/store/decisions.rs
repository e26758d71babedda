// SPDX-License-Identifier: MPL-2.0

use crate::store::{StoreDb, StoreError};
use rusqlite::params;

/// One curation outcome. Authoritative once persisted: ordinary re-display
/// never recomputes it, only an explicit refilter or reset replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub unique_id: String,
    pub dropped: bool,
    /// Human-readable rationale, may be empty.
    pub message: String,
    pub high_boost: bool,
    pub computed_at_ms: i64,
}

impl Decision {
    pub fn keep(unique_id: String, computed_at_ms: i64) -> Self {
        Self {
            unique_id,
            dropped: false,
            message: String::new(),
            high_boost: false,
            computed_at_ms,
        }
    }
}

/// Aggregate over a bounded recent window of decisions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionCacheStats {
    pub total: usize,
    pub dropped_count: usize,
    pub oldest_ms: Option<i64>,
    pub newest_ms: Option<i64>,
}

/// The Decision Cache. `get` never computes; absence means "not yet
/// curated" and callers must decide and persist before treating the post
/// as decided.
pub struct DecisionStore<'a> {
    db: &'a StoreDb,
}

impl<'a> DecisionStore<'a> {
    pub fn new(db: &'a StoreDb) -> Self {
        Self { db }
    }

    pub fn get(&self, unique_id: &str) -> Result<Option<Decision>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT unique_id, dropped, message, high_boost, computed_at_ms
            FROM decisions
            WHERE unique_id = ?
            "#,
        )?;

        match stmt.query_row([unique_id], Self::row_to_decision) {
            Ok(decision) => Ok(Some(decision)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Fetch decisions for a batch of ids. Missing ids are simply absent
    /// from the result.
    pub fn get_many(
        &self,
        unique_ids: &[String],
    ) -> Result<std::collections::HashMap<String, Decision>, StoreError> {
        if unique_ids.is_empty() {
            return Ok(Default::default());
        }

        let conn = self.db.conn();
        let placeholders: Vec<_> = (1..=unique_ids.len()).map(|i| format!("?{}", i)).collect();
        let query = format!(
            r#"
            SELECT unique_id, dropped, message, high_boost, computed_at_ms
            FROM decisions
            WHERE unique_id IN ({})
            "#,
            placeholders.join(", ")
        );

        let mut stmt = conn.prepare(&query)?;
        let query_params: Vec<&dyn rusqlite::ToSql> = unique_ids
            .iter()
            .map(|s| s as &dyn rusqlite::ToSql)
            .collect();

        let mut rows = stmt.query(query_params.as_slice())?;
        let mut decisions = std::collections::HashMap::new();
        while let Some(row) = rows.next()? {
            let decision = Self::row_to_decision(row)?;
            decisions.insert(decision.unique_id.clone(), decision);
        }
        Ok(decisions)
    }

    /// Idempotent upsert of a batch, in one transaction.
    pub fn put_many(&self, decisions: &[Decision]) -> Result<(), StoreError> {
        if decisions.is_empty() {
            return Ok(());
        }

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        for decision in decisions {
            tx.execute(
                r#"
                INSERT INTO decisions (unique_id, dropped, message, high_boost, computed_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(unique_id) DO UPDATE SET
                    dropped = excluded.dropped,
                    message = excluded.message,
                    high_boost = excluded.high_boost,
                    computed_at_ms = excluded.computed_at_ms
                "#,
                params![
                    decision.unique_id,
                    decision.dropped as i32,
                    decision.message,
                    decision.high_boost as i32,
                    decision.computed_at_ms,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// First-run detection: no decisions have ever been written.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM decisions", [], |row| row.get(0))?;
        Ok(count == 0)
    }

    /// Aggregate over decisions computed in the last `window_ms`.
    pub fn stats(&self, window_ms: i64) -> Result<DecisionCacheStats, StoreError> {
        let conn = self.db.conn();
        let since = StoreDb::now_ms() - window_ms;

        conn.query_row(
            r#"
            SELECT COUNT(*), COALESCE(SUM(dropped), 0), MIN(computed_at_ms), MAX(computed_at_ms)
            FROM decisions
            WHERE computed_at_ms >= ?
            "#,
            [since],
            |row| {
                Ok(DecisionCacheStats {
                    total: row.get::<_, i64>(0)? as usize,
                    dropped_count: row.get::<_, i64>(1)? as usize,
                    oldest_ms: row.get(2)?,
                    newest_ms: row.get(3)?,
                })
            },
        )
        .map_err(StoreError::Database)
    }

    /// Drop every decision. Only the explicit reset path calls this.
    pub fn clear(&self) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM decisions", [])?;
        Ok(())
    }

    fn row_to_decision(row: &rusqlite::Row) -> Result<Decision, rusqlite::Error> {
        Ok(Decision {
            unique_id: row.get(0)?,
            dropped: row.get::<_, i32>(1)? != 0,
            message: row.get(2)?,
            high_boost: row.get::<_, i32>(3)? != 0,
            computed_at_ms: row.get(4)?,
        })
    }
}
