// SPDX-License-Identifier: MPL-2.0

mod client;
mod types;

pub use client::BskySource;
pub use types::{Account, FeedEntry, FeedItem, ItemKind, ReplyTarget};

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("not authenticated")]
    NotAuthenticated,
}

impl SourceError {
    /// Transient errors are retried with backoff; the rest abort the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// One page from the remote feed, newest first, with the cursor for the
/// next (older) page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub items: Vec<FeedItem>,
    pub cursor: Option<String>,
}

/// The remote feed/social-graph collaborator. Paged, rate-limited reads
/// only; no ordering guarantee beyond "newest requested first".
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_page(
        &self,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<FetchedPage, SourceError>;

    /// One page of the viewer's follow list.
    async fn fetch_follows(
        &self,
        cursor: Option<&str>,
    ) -> Result<(Vec<Account>, Option<String>), SourceError>;
}

/// Bounded attempts with doubling backoff for transient failures.
/// Throttling is not retried here; the caller arms the rate gate instead.
pub async fn with_retry<T, F, Fut>(max_attempts: u32, mut call: F) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut delay = Duration::from_millis(500);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                tracing::debug!(attempt, %err, "transient fetch error, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
