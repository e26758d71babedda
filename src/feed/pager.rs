// SPDX-License-Identifier: MPL-2.0

use crate::EngineError;
use crate::config::SharedConfig;
use crate::engine::{StatsAggregator, sequence_batch};
use crate::feed::{RateGate, curate_missing};
use crate::source::{FeedEntry, FeedSource, SourceError, with_retry};
use crate::store::{EntryStore, StoreDb};
use chrono::{Duration as ChronoDuration, Local, TimeZone};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

const MAX_FETCH_ATTEMPTS: u32 = 3;
/// Hard stop for one backfill run, whatever the boundary says.
const LOOKBACK_MAX_PAGES: usize = 40;
/// How many head pages a refresh will walk looking for overlap with cache.
const REFRESH_MAX_PAGES: usize = 5;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Terminal state of one lookback backfill run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookbackOutcome {
    /// Cache reaches the boundary; `last_lookback` recorded.
    Completed,
    /// The cache was refreshed recently enough, nothing fetched.
    AlreadyFresh,
    /// Cancelled between batches; appended batches are kept, not recorded
    /// as complete.
    Cancelled,
}

/// Pagination & lookback controller: cache-first reads, backward backfill
/// to a time boundary, and the one-page-ahead prefetch buffer. Every fetch
/// through here is store-then-curate as one unit.
pub struct FeedPager {
    db: StoreDb,
    source: Arc<dyn FeedSource>,
    config: SharedConfig,
    stats: Arc<StatsAggregator>,
    gate: Arc<RateGate>,
    prefetch: Mutex<Vec<FeedEntry>>,
    lookback_cancelled: AtomicBool,
}

impl FeedPager {
    pub fn new(
        db: StoreDb,
        source: Arc<dyn FeedSource>,
        config: SharedConfig,
        stats: Arc<StatsAggregator>,
        gate: Arc<RateGate>,
    ) -> Self {
        Self {
            db,
            source,
            config,
            stats,
            gate,
            prefetch: Mutex::new(Vec::new()),
            lookback_cancelled: AtomicBool::new(false),
        }
    }

    fn cfg(&self) -> crate::config::EngineConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Cache-first read: two pages of the newest cached entries, decisions
    /// guaranteed present. Never touches the network.
    pub fn load_cached_window(&self) -> Result<Vec<FeedEntry>, EngineError> {
        let config = self.cfg();
        let entries = EntryStore::new(&self.db).get_recent(config.page_length * 2)?;
        curate_missing(&self.db, &config, &self.stats.snapshot(), &entries)?;
        Ok(entries)
    }

    /// One remote page through the full pipeline: gate check, bounded
    /// retries, timestamp sequencing, idempotent append, then curation of
    /// whatever was new. Throttling arms the shared gate.
    pub async fn fetch_and_store(
        &self,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<FeedEntry>, Option<String>), EngineError> {
        self.gate.check().map_err(EngineError::RateLimited)?;

        let page = match with_retry(MAX_FETCH_ATTEMPTS, || self.source.fetch_page(limit, cursor))
            .await
        {
            Ok(page) => page,
            Err(SourceError::Throttled { retry_after }) => {
                self.gate.arm(retry_after);
                return Err(SourceError::Throttled { retry_after }.into());
            }
            Err(e) => return Err(e.into()),
        };

        let entries = sequence_batch(page.items, StoreDb::now_ms(), page.cursor.as_deref());

        let config = self.cfg();
        EntryStore::new(&self.db).append(&entries, page.cursor.as_deref())?;
        curate_missing(&self.db, &config, &self.stats.snapshot(), &entries)?;

        Ok((entries, page.cursor))
    }

    /// Fetch everything newer than the cached window, walking head pages
    /// until one overlaps the cache. Returns only the genuinely new
    /// entries, newest first. Hitting the page cap before the overlap
    /// leaves a hole below the head, so lookback completion is forgotten
    /// and the next qualifying load backfills the region.
    pub async fn refresh_newest(&self) -> Result<Vec<FeedEntry>, EngineError> {
        let newest = EntryStore::new(&self.db).metadata()?.newest_ms;
        let page_length = self.cfg().page_length;

        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        let mut contiguous = false;
        for _ in 0..REFRESH_MAX_PAGES {
            let (entries, next) = self.fetch_and_store(page_length, cursor.as_deref()).await?;
            let reached_cache = match newest {
                Some(n) => entries.iter().any(|e| e.post_timestamp_ms <= n),
                None => true,
            };
            collected.extend(
                entries
                    .into_iter()
                    .filter(|e| newest.is_none_or(|n| e.post_timestamp_ms > n)),
            );
            // Overlap with the cache or an exhausted feed: nothing between
            // the head pages and the stored window.
            if reached_cache || next.is_none() {
                contiguous = true;
                break;
            }
            cursor = next;
        }

        if !contiguous {
            tracing::warn!(
                max_pages = REFRESH_MAX_PAGES,
                "refresh hit page cap before reaching the cache, scheduling backfill"
            );
            EntryStore::new(&self.db).invalidate_lookback()?;
        }
        Ok(collected)
    }

    /// One page of entries older than `older_than_ms`: cache first, then
    /// one cache-extending remote fetch from the stored cursor.
    pub async fn load_older(&self, older_than_ms: i64) -> Result<Vec<FeedEntry>, EngineError> {
        let config = self.cfg();
        let entries = EntryStore::new(&self.db);

        let mut page = entries.get_before(older_than_ms, config.page_length)?;
        if page.len() < config.page_length {
            if let Some(cursor) = entries.metadata()?.last_cursor {
                match self.fetch_and_store(config.page_length, Some(&cursor)).await {
                    Ok(_) => page = entries.get_before(older_than_ms, config.page_length)?,
                    // Pagination exhaustion and throttling are not fatal
                    // here; the cached partial page is still valid.
                    Err(e) => tracing::debug!(error = %e, "cache extension fetch failed"),
                }
            }
        }

        curate_missing(&self.db, &config, &self.stats.snapshot(), &page)?;
        Ok(page)
    }

    /// Hand over the prefetched page, leaving the buffer empty until
    /// `arm_prefetch` re-arms it.
    pub fn take_prefetch(&self) -> Vec<FeedEntry> {
        std::mem::take(&mut *self.prefetch.lock().expect("prefetch lock poisoned"))
    }

    /// Load the page adjacent to `older_than_ms` into the prefetch buffer
    /// so the next load-more is served from memory.
    pub async fn arm_prefetch(&self, older_than_ms: i64) -> Result<usize, EngineError> {
        let page = self.load_older(older_than_ms).await?;
        let len = page.len();
        *self.prefetch.lock().expect("prefetch lock poisoned") = page;
        Ok(len)
    }

    /// Enforce the maximum displayed window: drop the oldest excess from
    /// the display (never from the store) and keep exactly one adjacent
    /// page as the new prefetch buffer. Returns whether a trim happened.
    pub fn trim_window(&self, window: &mut Vec<FeedEntry>) -> bool {
        let config = self.cfg();
        if window.len() <= config.max_displayed_window {
            return false;
        }

        let removed = window.split_off(config.max_displayed_window);
        let buffer: Vec<FeedEntry> = removed.into_iter().take(config.page_length).collect();
        *self.prefetch.lock().expect("prefetch lock poisoned") = buffer;
        true
    }

    /// Whether the lookback window has gone stale enough to backfill.
    pub fn needs_lookback(&self) -> Result<bool, EngineError> {
        let meta = EntryStore::new(&self.db).metadata()?;
        let boundary = self.lookback_boundary_ms();
        Ok(meta.last_lookback_ms.is_none_or(|last| last < boundary))
    }

    /// Start of the local day, `lookback_days - 1` days back.
    fn lookback_boundary_ms(&self) -> i64 {
        let days = self.cfg().lookback_days.max(1);
        let midnight = Local::now().date_naive().and_hms_opt(0, 0, 0).expect("valid midnight");
        let boundary = midnight - ChronoDuration::days(days as i64 - 1);
        Local
            .from_local_datetime(&boundary)
            .earliest()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|| StoreDb::now_ms() - days as i64 * DAY_MS)
    }

    /// Request that an in-flight (or the next) backfill stop after its
    /// current batch. The batch already appended stays appended.
    pub fn cancel_lookback(&self) {
        self.lookback_cancelled.store(true, Ordering::SeqCst);
    }

    /// Backfill backward in page-sized batches until the day boundary,
    /// reporting fractional progress after each batch. A failed fetch
    /// stops the run and leaves it incomplete for the next qualifying
    /// load; already-appended batches are untouched.
    pub async fn lookback(
        &self,
        mut progress: impl FnMut(f64),
    ) -> Result<LookbackOutcome, EngineError> {
        if !self.needs_lookback()? {
            return Ok(LookbackOutcome::AlreadyFresh);
        }

        let boundary = self.lookback_boundary_ms();
        let started = StoreDb::now_ms();
        let span = (started - boundary).max(1) as f64;
        let page_length = self.cfg().page_length;

        let mut cursor = EntryStore::new(&self.db).metadata()?.last_cursor;
        for _ in 0..LOOKBACK_MAX_PAGES {
            let (entries, next) = self.fetch_and_store(page_length, cursor.as_deref()).await?;

            let oldest = entries
                .iter()
                .map(|e| e.post_timestamp_ms)
                .min()
                .unwrap_or(boundary);
            progress(((started - oldest) as f64 / span).clamp(0.0, 1.0));

            // Boundary reached, or the feed is exhausted: both are normal
            // terminal states.
            if oldest <= boundary || next.is_none() {
                let store = EntryStore::new(&self.db);
                store.update_oldest_boundary(boundary.min(oldest))?;
                store.set_lookback_completed(started)?;
                progress(1.0);
                return Ok(LookbackOutcome::Completed);
            }

            if self.lookback_cancelled.swap(false, Ordering::SeqCst) {
                return Ok(LookbackOutcome::Cancelled);
            }

            cursor = next;
        }

        tracing::warn!(max_pages = LOOKBACK_MAX_PAGES, "lookback hit page cap before boundary");
        Ok(LookbackOutcome::Cancelled)
    }
}
