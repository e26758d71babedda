// SPDX-License-Identifier: MPL-2.0

mod assembler;
mod gate;
mod pager;
mod probe;

pub use assembler::{EngineStats, FeedAssembler};
pub use gate::RateGate;
pub use pager::{FeedPager, LookbackOutcome};
pub use probe::{DeliveryMode, ProbeController, ProbeOutcome, ProbeReport};

use crate::config::EngineConfig;
use crate::engine::{GlobalStats, decide};
use crate::source::FeedEntry;
use crate::store::{DecisionStore, FollowStore, StoreDb, StoreError};
use std::collections::HashMap;

/// Decide every entry in the batch that has no persisted decision yet, and
/// persist the new decisions. Entries already decided are left untouched —
/// that is the stability contract that keeps redisplay identical. Returns
/// the number of new decisions written.
pub(crate) fn curate_missing(
    db: &StoreDb,
    config: &EngineConfig,
    stats: &GlobalStats,
    entries: &[FeedEntry],
) -> Result<usize, StoreError> {
    let ids: Vec<String> = entries.iter().map(|e| e.unique_id.clone()).collect();
    let existing = DecisionStore::new(db).get_many(&ids)?;

    let follows = FollowStore::new(db);
    let mut follow_cache = HashMap::new();
    let now = StoreDb::now_ms();

    let mut fresh = Vec::new();
    for entry in entries {
        if existing.contains_key(&entry.unique_id) {
            continue;
        }

        let follow = follow_cache
            .entry(entry.author_id.clone())
            .or_insert_with(|| match follows.get(&entry.author_id) {
                Ok(state) => state,
                Err(e) => {
                    // Fail open: a statistics bug must never hide content
                    tracing::warn!(author = %entry.author_id, error = %e, "follow lookup failed, keeping post");
                    None
                }
            });

        fresh.push(decide(&entry.item, follow.as_ref(), stats, config, now));
    }

    let written = fresh.len();
    DecisionStore::new(db).put_many(&fresh)?;
    Ok(written)
}

/// Explicit invalidation pass: recompute every stored entry's decision
/// from current statistics and settings. This is the only path besides
/// `reset` that may change a persisted decision.
pub(crate) fn recompute_all(
    db: &StoreDb,
    config: &EngineConfig,
    stats: &GlobalStats,
) -> Result<usize, StoreError> {
    let entries = crate::store::EntryStore::new(db).get_since(0)?;

    let follows = FollowStore::new(db);
    let mut follow_cache = HashMap::new();
    let now = StoreDb::now_ms();

    let decisions: Vec<_> = entries
        .iter()
        .map(|entry| {
            let follow = follow_cache
                .entry(entry.author_id.clone())
                .or_insert_with(|| follows.get(&entry.author_id).ok().flatten());
            decide(&entry.item, follow.as_ref(), stats, config, now)
        })
        .collect();

    DecisionStore::new(db).put_many(&decisions)?;
    Ok(decisions.len())
}
