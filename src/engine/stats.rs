// SPDX-License-Identifier: MPL-2.0

use crate::config::SharedConfig;
use crate::store::{DecisionStore, EntryStore, FollowStore, StoreDb, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Aggregate snapshot consumed by the decision engine. Stale-but-available:
/// reads never wait for a recompute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalStats {
    pub received_per_day: f64,
    pub shown_per_day: f64,
    pub target_views_per_day: f64,
    pub computed_at_ms: i64,
}

impl GlobalStats {
    /// Long-run fraction of received posts that survive curation, used to
    /// size probe fetches. Clamped so the raw probe size stays bounded
    /// even when the ratio is tiny or the stats are empty.
    pub fn estimated_keep_fraction(&self) -> f64 {
        if self.received_per_day <= 0.0 {
            return 1.0;
        }
        (self.shown_per_day / self.received_per_day).clamp(0.05, 1.0)
    }

    /// Whether a recompute has ever run.
    pub fn is_primed(&self) -> bool {
        self.computed_at_ms > 0
    }
}

/// Scans the Feed Store over the last `days_of_data` days, producing
/// per-followee post rates and the global snapshot. Runs on its own
/// schedule; failures are logged and retried on the next tick.
pub struct StatsAggregator {
    db: StoreDb,
    config: SharedConfig,
    snapshot: RwLock<GlobalStats>,
}

impl StatsAggregator {
    pub fn new(db: StoreDb, config: SharedConfig) -> Self {
        let target = config.read().expect("config lock poisoned").target_views_per_day;
        Self {
            db,
            config,
            snapshot: RwLock::new(GlobalStats {
                target_views_per_day: target,
                ..Default::default()
            }),
        }
    }

    /// The last-computed snapshot. Never blocks on a scan.
    pub fn snapshot(&self) -> GlobalStats {
        self.snapshot.read().expect("stats lock poisoned").clone()
    }

    /// Scan the store and refresh both the per-followee rates and the
    /// global snapshot.
    pub fn recompute(&self) -> Result<GlobalStats, StoreError> {
        let (days, target) = {
            let config = self.config.read().expect("config lock poisoned");
            (config.days_of_data.max(1) as f64, config.target_views_per_day)
        };

        let now = StoreDb::now_ms();
        let since = now - (days * DAY_MS as f64) as i64;

        let entries = EntryStore::new(&self.db).get_since(since)?;

        let mut per_author: HashMap<String, u64> = HashMap::new();
        let mut ids = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.item.is_edition() {
                continue;
            }
            *per_author.entry(entry.author_id.clone()).or_default() += 1;
            ids.push(entry.unique_id.clone());
        }

        let rates: Vec<(String, f64)> = per_author
            .iter()
            .map(|(did, count)| (did.clone(), *count as f64 / days))
            .collect();
        FollowStore::new(&self.db).set_rates(&rates)?;

        let received = ids.len() as f64 / days;
        let decisions = DecisionStore::new(&self.db).get_many(&ids)?;
        let shown = ids
            .iter()
            .filter(|id| decisions.get(*id).is_some_and(|d| !d.dropped))
            .count() as f64
            / days;

        let stats = GlobalStats {
            received_per_day: received,
            shown_per_day: shown,
            target_views_per_day: target,
            computed_at_ms: now,
        };

        *self.snapshot.write().expect("stats lock poisoned") = stats.clone();
        tracing::debug!(
            received_per_day = stats.received_per_day,
            shown_per_day = stats.shown_per_day,
            "statistics recomputed"
        );
        Ok(stats)
    }

    /// Periodic recompute, decoupled from reads. Errors never reach the
    /// foreground path.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let aggregator = self.clone();
                let result =
                    tokio::task::spawn_blocking(move || aggregator.recompute()).await;
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "statistics recompute failed"),
                    Err(e) => tracing::warn!(error = %e, "statistics task panicked"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::source::{Account, FeedEntry, FeedItem, ItemKind};
    use crate::store::Decision;

    fn shared(config: EngineConfig) -> SharedConfig {
        Arc::new(RwLock::new(config))
    }

    fn entry(author: &str, id: &str, ts: i64) -> FeedEntry {
        let item = FeedItem {
            uri: format!("at://{author}/app.bsky.feed.post/{id}"),
            cid: format!("cid-{id}"),
            author: Account::minimal(author.to_string(), format!("{id}.test"), None),
            text: String::new(),
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
            author_id: author.to_string(),
            item,
            fetch_cursor: None,
        }
    }

    #[test]
    fn recompute_produces_per_author_rates() {
        let db = StoreDb::open_in_memory().unwrap();
        let config = shared(EngineConfig {
            days_of_data: 2,
            target_views_per_day: 100.0,
            ..Default::default()
        });

        let follows = FollowStore::new(&db);
        follows
            .upsert(&[
                Account::minimal("did:plc:busy".into(), "busy.test".into(), None),
                Account::minimal("did:plc:quiet".into(), "quiet.test".into(), None),
            ])
            .unwrap();

        let now = StoreDb::now_ms();
        let entries = EntryStore::new(&db);
        let mut batch = Vec::new();
        for i in 0..8 {
            batch.push(entry("did:plc:busy", &format!("b{i}"), now - i * 1000));
        }
        batch.push(entry("did:plc:quiet", "q0", now - 500));
        entries.append(&batch, None).unwrap();

        // Decide 6 of the 9: 4 kept, 2 dropped
        let decisions = DecisionStore::new(&db);
        let mut decided = Vec::new();
        for (i, e) in batch.iter().take(6).enumerate() {
            decided.push(Decision {
                unique_id: e.unique_id.clone(),
                dropped: i % 3 == 0,
                message: String::new(),
                high_boost: false,
                computed_at_ms: now,
            });
        }
        decisions.put_many(&decided).unwrap();

        let aggregator = StatsAggregator::new(db.clone(), config);
        let stats = aggregator.recompute().unwrap();

        assert_eq!(stats.received_per_day, 4.5); // 9 posts / 2 days
        assert_eq!(stats.shown_per_day, 2.0); // 4 kept / 2 days
        assert_eq!(stats.target_views_per_day, 100.0);

        let busy = follows.get("did:plc:busy").unwrap().unwrap();
        assert_eq!(busy.observed_post_rate, Some(4.0));
        let quiet = follows.get("did:plc:quiet").unwrap().unwrap();
        assert_eq!(quiet.observed_post_rate, Some(0.5));

        // snapshot serves the last-computed values
        assert_eq!(aggregator.snapshot(), stats);
    }

    #[test]
    fn keep_fraction_is_clamped() {
        let mut stats = GlobalStats {
            received_per_day: 1000.0,
            shown_per_day: 1.0,
            target_views_per_day: 100.0,
            computed_at_ms: 1,
        };
        assert_eq!(stats.estimated_keep_fraction(), 0.05);

        stats.shown_per_day = 500.0;
        assert_eq!(stats.estimated_keep_fraction(), 0.5);

        stats.received_per_day = 0.0;
        assert_eq!(stats.estimated_keep_fraction(), 1.0);
    }

    #[test]
    fn snapshot_before_first_recompute_is_unprimed() {
        let db = StoreDb::open_in_memory().unwrap();
        let aggregator = StatsAggregator::new(db, shared(EngineConfig::default()));
        let stats = aggregator.snapshot();
        assert!(!stats.is_primed());
        assert_eq!(stats.target_views_per_day, 200.0);
    }
}
