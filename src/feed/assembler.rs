// SPDX-License-Identifier: MPL-2.0

use crate::EngineError;
use crate::config::SharedConfig;
use crate::engine::{GlobalStats, StatsAggregator};
use crate::feed::pager::FeedPager;
use crate::feed::probe::{DeliveryMode, ProbeController, ProbeOutcome};
use crate::feed::{RateGate, recompute_all};
use crate::source::{FeedEntry, FeedSource};
use crate::store::{
    AmpDirection, Decision, DecisionCacheStats, DecisionStore, EntryStore, FollowState,
    FollowStore, StoreDb,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
/// Retention horizon for stale-entry cleanup, relative to `days_of_data`.
const RETENTION_FLOOR_DAYS: i64 = 28;

/// Combined statistics surface for the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    pub global: GlobalStats,
    pub cache: DecisionCacheStats,
}

/// The orchestration layer the UI talks to: merges the feed store, the
/// decision cache, and the controllers into "what to show now". Owns the
/// displayed window; the UI never writes the stores directly.
pub struct FeedAssembler {
    db: StoreDb,
    source: Arc<dyn FeedSource>,
    config: SharedConfig,
    stats: Arc<StatsAggregator>,
    pager: Arc<FeedPager>,
    probe: Arc<ProbeController>,
    /// Raw entries (kept and dropped) currently backing the display,
    /// newest first. Filtering happens at read time so a refilter never
    /// needs a re-fetch.
    window: Mutex<Vec<FeedEntry>>,
}

impl FeedAssembler {
    pub fn new(db: StoreDb, source: Arc<dyn FeedSource>, config: SharedConfig) -> Self {
        let stats = Arc::new(StatsAggregator::new(db.clone(), config.clone()));
        let gate = Arc::new(RateGate::new());
        let pager = Arc::new(FeedPager::new(
            db.clone(),
            source.clone(),
            config.clone(),
            stats.clone(),
            gate.clone(),
        ));
        let probe = Arc::new(ProbeController::new(
            db.clone(),
            source.clone(),
            config.clone(),
            stats.clone(),
            gate,
        ));

        Self {
            db,
            source,
            config,
            stats,
            pager,
            probe,
            window: Mutex::new(Vec::new()),
        }
    }

    pub fn pager(&self) -> &Arc<FeedPager> {
        &self.pager
    }

    pub fn probe_controller(&self) -> &Arc<ProbeController> {
        &self.probe
    }

    pub fn stats_aggregator(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    fn cfg(&self) -> crate::config::EngineConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// First read after startup: validate cache integrity, then serve the
    /// cached window. This is the only call that blocks the render path;
    /// everything afterwards happens behind the display.
    pub fn initial_load(&self) -> Result<Vec<FeedEntry>, EngineError> {
        let entries = EntryStore::new(&self.db);
        if entries.validate_against_decisions()? {
            tracing::warn!("feed store failed integrity validation, starting empty");
        }

        let window = self.pager.load_cached_window()?;
        *self.window.lock().expect("window lock poisoned") = window;
        self.display_page()
    }

    /// The list to render, newest first: drop-filtered unless `show_all`
    /// or curation is disabled, self-thread parents deduplicated, capped
    /// at the maximum displayed window.
    pub fn display_page(&self) -> Result<Vec<FeedEntry>, EngineError> {
        let mut window = self.window.lock().expect("window lock poisoned");
        self.pager.trim_window(&mut window);

        let config = self.cfg();
        let ids: Vec<String> = window.iter().map(|e| e.unique_id.clone()).collect();
        let decisions = DecisionStore::new(&self.db).get_many(&ids)?;

        Ok(assemble(&window, &decisions, config.show_all || config.disabled))
    }

    /// Serve the next page from the prefetch buffer (or the store, on a
    /// cold buffer), then immediately re-arm the prefetch.
    pub async fn load_more(&self) -> Result<Vec<FeedEntry>, EngineError> {
        let oldest = {
            let window = self.window.lock().expect("window lock poisoned");
            window.last().map(|e| e.post_timestamp_ms)
        };

        let mut page = self.pager.take_prefetch();
        if page.is_empty() {
            page = self
                .pager
                .load_older(oldest.unwrap_or_else(StoreDb::now_ms))
                .await?;
        }

        let next_oldest = {
            let mut window = self.window.lock().expect("window lock poisoned");
            extend_window(&mut window, page);
            self.pager.trim_window(&mut window);
            window.last().map(|e| e.post_timestamp_ms)
        };

        if let Some(ts) = next_oldest {
            if let Err(e) = self.pager.arm_prefetch(ts).await {
                tracing::debug!(error = %e, "prefetch re-arm failed");
            }
        }

        self.display_page()
    }

    /// Fetch posts newer than the window and prepend them.
    pub async fn load_newest(&self) -> Result<Vec<FeedEntry>, EngineError> {
        let fresh = self.pager.refresh_newest().await?;
        {
            let mut window = self.window.lock().expect("window lock poisoned");
            extend_window(&mut window, fresh);
            self.pager.trim_window(&mut window);
        }
        self.display_page()
    }

    /// One probe pass against the window's newest timestamp.
    pub async fn probe_tick(&self) -> Result<ProbeOutcome, EngineError> {
        let newest = {
            let window = self.window.lock().expect("window lock poisoned");
            window.first().map(|e| e.post_timestamp_ms).unwrap_or(0)
        };
        self.probe.probe(newest).await
    }

    /// Deliver a ready probe: persist the previewed posts, then either
    /// prepend them or rebuild the whole window (gap / multi-page case).
    pub async fn deliver_probe(&self) -> Result<Vec<FeedEntry>, EngineError> {
        match self.probe.deliver(&self.pager).await? {
            DeliveryMode::Prepend(fresh) => {
                let mut window = self.window.lock().expect("window lock poisoned");
                extend_window(&mut window, fresh);
                self.pager.trim_window(&mut window);
            }
            DeliveryMode::FullReload => {
                let reloaded = self.pager.load_cached_window()?;
                *self.window.lock().expect("window lock poisoned") = reloaded;
            }
        }
        self.display_page()
    }

    /// Double or halve a followee's exposure, then re-filter the store so
    /// the change is visible without a re-fetch.
    pub async fn on_amp_change(
        &self,
        did: &str,
        direction: AmpDirection,
    ) -> Result<FollowState, EngineError> {
        let state = FollowStore::new(&self.db).bump_amp(did, direction)?;
        self.refilter()?;
        Ok(state)
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let config = self.cfg();
        let window_ms = config.days_of_data.max(1) as i64 * DAY_MS;
        Ok(EngineStats {
            global: self.stats.snapshot(),
            cache: DecisionStore::new(&self.db).stats(window_ms)?,
        })
    }

    /// Explicit invalidation pass: recompute every stored decision from
    /// current statistics and settings, and rebuild the window. Required
    /// after any filtering-relevant configuration change.
    pub fn refilter(&self) -> Result<Vec<FeedEntry>, EngineError> {
        let config = self.cfg();
        recompute_all(&self.db, &config, &self.stats.snapshot())?;

        let mut window = self.window.lock().expect("window lock poisoned");
        let size = window.len().max(config.page_length * 2);
        *window = EntryStore::new(&self.db).get_recent(size)?;
        drop(window);

        self.display_page()
    }

    /// Apply a configuration change and run the refilter it mandates.
    pub fn update_config(
        &self,
        apply: impl FnOnce(&mut crate::config::EngineConfig),
    ) -> Result<Vec<FeedEntry>, EngineError> {
        apply(&mut self.config.write().expect("config lock poisoned"));
        self.refilter()
    }

    /// Explicit full reset: drop entries, decisions, and metadata. The
    /// next load starts from an empty cache.
    pub fn reset(&self) -> Result<(), EngineError> {
        EntryStore::new(&self.db).clear()?;
        DecisionStore::new(&self.db).clear()?;
        self.window.lock().expect("window lock poisoned").clear();
        Ok(())
    }

    /// Everything that happens behind the display after the initial read:
    /// follow sync, statistics, the first-run recompute, newest refresh,
    /// lookback, and stale-entry cleanup. Failures are logged, never
    /// surfaced to the read path.
    pub async fn background_refresh(&self) {
        if let Err(e) = self.sync_follows().await {
            tracing::warn!(error = %e, "follow sync failed");
        }

        let first_run = !self.stats.snapshot().is_primed();
        if let Err(e) = self.stats.recompute() {
            tracing::warn!(error = %e, "statistics recompute failed");
        } else if first_run {
            // Everything decided before stats existed went through the
            // fail-open default; re-curate it now that rates are known.
            if let Err(e) = self.refilter() {
                tracing::warn!(error = %e, "first-run refilter failed");
            }
        }

        match self.pager.refresh_newest().await {
            Ok(fresh) => {
                let mut window = self.window.lock().expect("window lock poisoned");
                extend_window(&mut window, fresh);
                self.pager.trim_window(&mut window);
            }
            Err(e) => tracing::debug!(error = %e, "newest refresh failed"),
        }

        match self.pager.needs_lookback() {
            Ok(true) => {
                if let Err(e) = self.pager.lookback(|_| {}).await {
                    tracing::warn!(error = %e, "lookback backfill failed");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::debug!(error = %e, "lookback check failed"),
        }

        let retention_days =
            (self.cfg().days_of_data as i64 * 4).max(RETENTION_FLOOR_DAYS);
        if let Err(e) = self.db.cleanup_stale(retention_days * DAY_MS) {
            tracing::debug!(error = %e, "stale cleanup failed");
        }
    }

    /// Page through the viewer's follow list into the follow store.
    async fn sync_follows(&self) -> Result<(), EngineError> {
        let follows = FollowStore::new(&self.db);
        let mut cursor: Option<String> = None;
        loop {
            let (accounts, next) = self.source.fetch_follows(cursor.as_deref()).await?;
            follows.upsert(&accounts)?;
            match next {
                Some(c) if !accounts.is_empty() => cursor = Some(c),
                _ => return Ok(()),
            }
        }
    }

    /// Spawn the periodic background tasks: statistics on `stats_period`,
    /// probes on `probe_period`. Probe outcomes are delivered to `on_probe`.
    pub fn spawn_background(
        self: &Arc<Self>,
        stats_period: Duration,
        probe_period: Duration,
        on_probe: impl Fn(ProbeOutcome) + Send + Sync + 'static,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let stats_task = self.stats.clone().spawn_periodic(stats_period);

        let assembler = self.clone();
        let probe_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match assembler.probe_tick().await {
                    Ok(outcome) => on_probe(outcome),
                    Err(e) => tracing::debug!(error = %e, "probe failed"),
                }
            }
        });

        vec![stats_task, probe_task]
    }
}

/// Merge a batch into the window without duplicates, keeping newest-first
/// order.
fn extend_window(window: &mut Vec<FeedEntry>, batch: Vec<FeedEntry>) {
    let seen: HashSet<String> = window.iter().map(|e| e.unique_id.clone()).collect();
    window.extend(batch.into_iter().filter(|e| !seen.contains(&e.unique_id)));
    window.sort_by(|a, b| b.post_timestamp_ms.cmp(&a.post_timestamp_ms));
}

/// Pure assembly: filter dropped entries (unless showing all), sort newest
/// first, and suppress replies whose direct parent by the same author is
/// already in the window.
fn assemble(
    window: &[FeedEntry],
    decisions: &HashMap<String, Decision>,
    show_everything: bool,
) -> Vec<FeedEntry> {
    let mut list: Vec<FeedEntry> = window
        .iter()
        .filter(|e| {
            show_everything
                || decisions
                    .get(&e.unique_id)
                    // Missing decision means "not yet curated": fail open
                    .is_none_or(|d| !d.dropped)
        })
        .cloned()
        .collect();

    list.sort_by(|a, b| b.post_timestamp_ms.cmp(&a.post_timestamp_ms));

    let present: HashSet<String> = list.iter().map(|e| e.item.uri.clone()).collect();
    list.retain(|e| match &e.item.reply_parent {
        Some(parent) => {
            !(parent.author_did == e.item.author.did && present.contains(&parent.uri))
        }
        None => true,
    });

    list
}
