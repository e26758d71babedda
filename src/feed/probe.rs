// SPDX-License-Identifier: MPL-2.0

use crate::EngineError;
use crate::config::SharedConfig;
use crate::engine::{StatsAggregator, decide, sequence_batch};
use crate::feed::pager::FeedPager;
use crate::feed::RateGate;
use crate::source::{FeedEntry, FeedSource, SourceError};
use crate::store::{EntryStore, FollowStore, StoreDb};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Remote page size is capped by the service.
const MAX_RAW_LIMIT: usize = 100;
/// Prompt suppression window after a delivery, to avoid flicker.
const DELIVERY_COOLDOWN: Duration = Duration::from_secs(60);

/// What one probe pass learned about posts newer than the display.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    /// How many examined posts curation would keep.
    pub would_keep: usize,
    /// A full display page's worth survives curation.
    pub full_page_available: bool,
    /// The raw fetch filled up without reaching the display: more pages
    /// are likely waiting.
    pub multi_page: bool,
    /// Posts exist between the cache's newest entry and the probe's oldest
    /// examined entry that the probe did not see.
    pub has_gap: bool,
    pub oldest_examined_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Nothing new, or still inside the post-delivery cooldown.
    Quiet,
    /// New posts seen, page not ready yet.
    Pending(ProbeReport),
    /// Full page available, or the max-wait timer elapsed on a partial one.
    Ready(ProbeReport),
}

/// How a delivery should reach the display.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryMode {
    /// Prepend the new entries to the current window.
    Prepend(Vec<FeedEntry>),
    /// Gap or multiple pages upstream: rebuild the window from the store.
    FullReload,
}

/// Polls the remote source for posts newer than the display, without
/// persisting anything, to preview how many curation would keep and to
/// detect timeline gaps. Persistence happens only at delivery, through the
/// normal store-then-curate path.
pub struct ProbeController {
    db: StoreDb,
    source: Arc<dyn FeedSource>,
    config: SharedConfig,
    stats: Arc<StatsAggregator>,
    gate: Arc<RateGate>,
    /// When the first undelivered post was seen, for the max-wait timer.
    pending_since: Mutex<Option<Instant>>,
    last_report: Mutex<Option<ProbeReport>>,
    cooldown_until: Mutex<Option<Instant>>,
}

impl ProbeController {
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
            pending_since: Mutex::new(None),
            last_report: Mutex::new(None),
            cooldown_until: Mutex::new(None),
        }
    }

    fn cfg(&self) -> crate::config::EngineConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Raw posts to request: a display page, oversampled by the variance
    /// factor and the long-run keep fraction.
    fn raw_limit(&self) -> usize {
        let config = self.cfg();
        let fraction = self.stats.snapshot().estimated_keep_fraction();
        let raw = (config.page_length as f64 * config.variance_factor / fraction).ceil() as usize;
        raw.clamp(config.page_length, MAX_RAW_LIMIT)
    }

    fn in_cooldown(&self) -> bool {
        let mut until = self.cooldown_until.lock().expect("probe lock poisoned");
        match *until {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                *until = None;
                false
            }
            None => false,
        }
    }

    /// One probe pass over posts newer than `newest_displayed_ms`.
    /// Side-effect-free with respect to persisted state.
    pub async fn probe(&self, newest_displayed_ms: i64) -> Result<ProbeOutcome, EngineError> {
        if self.in_cooldown() {
            return Ok(ProbeOutcome::Quiet);
        }
        self.gate.check().map_err(EngineError::RateLimited)?;

        let raw_limit = self.raw_limit();
        let page = match self.source.fetch_page(raw_limit, None).await {
            Ok(page) => page,
            Err(SourceError::Throttled { retry_after }) => {
                self.gate.arm(retry_after);
                return Err(SourceError::Throttled { retry_after }.into());
            }
            Err(e) => return Err(e.into()),
        };

        let fetched = page.items.len();
        let entries = sequence_batch(page.items, StoreDb::now_ms(), None);
        let examined: Vec<&FeedEntry> = entries
            .iter()
            .filter(|e| e.post_timestamp_ms > newest_displayed_ms)
            .collect();

        let config = self.cfg();
        let stats = self.stats.snapshot();
        let follows = FollowStore::new(&self.db);
        let mut follow_cache = HashMap::new();
        let now = StoreDb::now_ms();

        let would_keep = examined
            .iter()
            .filter(|e| {
                let follow = follow_cache
                    .entry(e.author_id.clone())
                    .or_insert_with(|| follows.get(&e.author_id).ok().flatten());
                !decide(&e.item, follow.as_ref(), &stats, &config, now).dropped
            })
            .count();

        // Gap detection looks at everything the probe fetched, not just
        // what is newer than the display: a batch that reaches down into
        // cached territory leaves nothing unexamined.
        let oldest_examined_ms = entries.iter().map(|e| e.post_timestamp_ms).min();
        let newest_cached_ms = EntryStore::new(&self.db).metadata()?.newest_ms;
        let has_gap = match (oldest_examined_ms, newest_cached_ms) {
            (Some(oldest), Some(cached)) => oldest > cached,
            _ => false,
        };
        let multi_page = fetched >= raw_limit && examined.len() == fetched;

        let report = ProbeReport {
            would_keep,
            full_page_available: would_keep >= config.page_length,
            multi_page,
            has_gap,
            oldest_examined_ms,
        };

        if would_keep == 0 {
            *self.pending_since.lock().expect("probe lock poisoned") = None;
            *self.last_report.lock().expect("probe lock poisoned") = None;
            return Ok(ProbeOutcome::Quiet);
        }

        let waited = {
            let mut pending = self.pending_since.lock().expect("probe lock poisoned");
            *pending.get_or_insert_with(Instant::now)
        };
        *self.last_report.lock().expect("probe lock poisoned") = Some(report.clone());

        let max_wait = Duration::from_secs(config.max_wait_minutes as u64 * 60);
        let ready = report.full_page_available || waited.elapsed() >= max_wait;

        Ok(if ready {
            ProbeOutcome::Ready(report)
        } else {
            ProbeOutcome::Pending(report)
        })
    }

    /// Deliver the previewed posts: re-fetch them through the normal
    /// store-then-curate path so they become persisted, clear the probe's
    /// working state, and start the prompt cooldown. A gap or multi-page
    /// backlog forces a full reload instead of a prepend.
    pub async fn deliver(&self, pager: &FeedPager) -> Result<DeliveryMode, EngineError> {
        let report = self.last_report.lock().expect("probe lock poisoned").clone();

        let fresh = pager.refresh_newest().await?;

        *self.pending_since.lock().expect("probe lock poisoned") = None;
        *self.last_report.lock().expect("probe lock poisoned") = None;
        *self.cooldown_until.lock().expect("probe lock poisoned") =
            Some(Instant::now() + DELIVERY_COOLDOWN);

        let full_reload = report.is_some_and(|r| r.has_gap || r.multi_page);
        Ok(if full_reload {
            DeliveryMode::FullReload
        } else {
            DeliveryMode::Prepend(fresh)
        })
    }
}
