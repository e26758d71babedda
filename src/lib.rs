// SPDX-License-Identifier: MPL-2.0

//! Skylimit: the feed curation and caching engine of a Bluesky client.
//!
//! Decides, deterministically and reproducibly, which posts of an unbounded
//! incoming stream the user is shown, bounded per followee by a daily
//! exposure budget. A persisted decision cache is the single source of
//! truth for previously rendered curation, so reloads and re-filters never
//! contradict what was already shown. Three post sources — local cache,
//! lookback backfill, and live probes — are merged without duplication,
//! gaps, or re-ordering.

pub mod config;
pub mod engine;
pub mod feed;
pub mod source;
pub mod store;

pub use config::{EngineConfig, SharedConfig};
pub use feed::{EngineStats, FeedAssembler, ProbeOutcome, ProbeReport};
pub use source::{Account, FeedEntry, FeedItem, FeedSource, ItemKind};
pub use store::{AmpDirection, Decision, FollowState};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Source(#[from] source::SourceError),
    #[error("rate limited for {0:?}")]
    RateLimited(std::time::Duration),
}
