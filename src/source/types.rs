// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

/// Decoupled from atrium's internal representation so the engine owns the
/// API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub did: String,
    pub handle: String,
    pub display_name: Option<String>,
}

impl Account {
    pub fn minimal(did: String, handle: String, display_name: Option<String>) -> Self {
        Self {
            did,
            handle,
            display_name,
        }
    }
}

/// How a post arrived in the feed. Reposts carry the reposting account
/// (that account's rate governs curation, not the original author's).
/// Edition markers are synthesized digest separators, never real posts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Original,
    Repost { by: Account },
    EditionMarker { title: String },
}

/// Direct parent of a reply, enough to detect self-threads in a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub uri: String,
    pub author_did: String,
}

/// One post as fetched from the remote feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub uri: String,
    pub cid: String,
    pub author: Account,
    pub text: String,
    /// Authored time as given by the record (RFC 3339), absent or garbage
    /// for some lexicons.
    pub created_at: Option<String>,
    /// When the relay indexed the post (RFC 3339); reposts use the repost's
    /// own indexed time here.
    pub indexed_at: String,
    pub like_count: u32,
    pub repost_count: u32,
    pub reply_count: u32,
    pub reply_parent: Option<ReplyTarget>,
    pub kind: ItemKind,
}

impl FeedItem {
    /// Identity within the Feed Store. Reposts of the same post by
    /// different accounts are distinct entries.
    pub fn unique_id(&self) -> String {
        match &self.kind {
            ItemKind::Repost { by } => format!("{}:{}", by.did, self.uri),
            _ => self.uri.clone(),
        }
    }

    /// The account whose follow state governs this item's curation:
    /// the reposter for reposts, the author otherwise.
    pub fn curated_account(&self) -> &Account {
        match &self.kind {
            ItemKind::Repost { by } => by,
            _ => &self.author,
        }
    }

    pub fn engagement(&self) -> u32 {
        self.like_count.saturating_add(self.repost_count)
    }

    pub fn is_edition(&self) -> bool {
        matches!(self.kind, ItemKind::EditionMarker { .. })
    }
}

/// One stored occurrence of a fetched post: the item plus the derived sort
/// timestamp and the cursor that was valid when it was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub unique_id: String,
    /// Epoch millis; derived from authored time with a fetch-time fallback,
    /// strictly decreasing within one fetch batch.
    pub post_timestamp_ms: i64,
    /// DID of the curated account (reposter for reposts).
    pub author_id: String,
    pub item: FeedItem,
    pub fetch_cursor: Option<String>,
}
