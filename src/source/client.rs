// SPDX-License-Identifier: MPL-2.0

use crate::source::types::{Account, FeedItem, ItemKind, ReplyTarget};
use crate::source::{FeedSource, FetchedPage, SourceError};
use async_trait::async_trait;
use atrium_api::agent::atp_agent::{AtpAgent, store::MemorySessionStore};
use atrium_xrpc_client::reqwest::ReqwestClient;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const DEFAULT_PDS: &str = "https://bsky.social";

/// Retry-after when the server throttles without a usable header.
const THROTTLE_FALLBACK: Duration = Duration::from_secs(60);

type Agent = AtpAgent<MemorySessionStore, ReqwestClient>;

/// Wraps atrium so the rest of the engine only sees our own types.
pub struct BskySource {
    agent: RwLock<Option<Arc<Agent>>>,
    viewer_did: RwLock<Option<String>>,
    service_url: String,
}

impl BskySource {
    pub fn new() -> Self {
        Self::with_service(DEFAULT_PDS)
    }

    pub fn with_service(service_url: &str) -> Self {
        Self {
            agent: RwLock::new(None),
            viewer_did: RwLock::new(None),
            service_url: service_url.to_string(),
        }
    }

    pub async fn login(&self, handle: &str, password: &str) -> Result<(), SourceError> {
        let client = ReqwestClient::new(&self.service_url);
        let agent = AtpAgent::new(client, MemorySessionStore::default());

        let result = agent
            .login(handle, password)
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        *self.viewer_did.write().expect("source lock poisoned") =
            Some(result.data.did.to_string());
        *self.agent.write().expect("source lock poisoned") = Some(Arc::new(agent));

        Ok(())
    }

    /// Session handle, held outside the lock so fetches can await on it.
    fn agent(&self) -> Result<Arc<Agent>, SourceError> {
        self.agent
            .read()
            .expect("source lock poisoned")
            .clone()
            .ok_or(SourceError::NotAuthenticated)
    }

    /// Map an atrium error, picking out server-side throttling so the
    /// rate gate can arm a cooldown instead of hammering the PDS.
    fn map_error(err: impl std::fmt::Display) -> SourceError {
        let msg = err.to_string();
        if msg.contains("RateLimitExceeded") || msg.contains("429") {
            SourceError::Throttled {
                retry_after: THROTTLE_FALLBACK,
            }
        } else {
            SourceError::Network(msg)
        }
    }

    fn convert_feed_view_post(
        feed_view: atrium_api::app::bsky::feed::defs::FeedViewPost,
    ) -> FeedItem {
        let post_view = feed_view.data.post;
        let author = post_view.data.author;

        let (text, created_at) = Self::extract_post_record(&post_view.data.record);

        // A repost is keyed to the reposting account and sorted by the
        // repost's own indexed time.
        let (kind, indexed_at) = match Self::extract_repost(&feed_view.data.reason) {
            Some((by, reposted_at)) => (ItemKind::Repost { by }, reposted_at),
            None => (
                ItemKind::Original,
                post_view.data.indexed_at.as_str().to_string(),
            ),
        };

        let reply_parent = Self::extract_reply_parent(&feed_view.data.reply);

        FeedItem {
            uri: post_view.data.uri,
            cid: post_view.data.cid.as_ref().to_string(),
            author: Account::minimal(
                author.data.did.to_string(),
                author.data.handle.to_string(),
                author.data.display_name.clone(),
            ),
            text,
            created_at: if created_at.is_empty() {
                None
            } else {
                Some(created_at)
            },
            indexed_at,
            like_count: post_view.data.like_count.unwrap_or(0) as u32,
            repost_count: post_view.data.repost_count.unwrap_or(0) as u32,
            reply_count: post_view.data.reply_count.unwrap_or(0) as u32,
            reply_parent,
            kind,
        }
    }

    fn extract_post_record(record: &atrium_api::types::Unknown) -> (String, String) {
        use atrium_api::types::Unknown;

        match record {
            Unknown::Object(map) => {
                let text = map
                    .get("text")
                    .and_then(|dm| serde_json::to_value(dm).ok())
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();

                let created_at = map
                    .get("createdAt")
                    .and_then(|dm| serde_json::to_value(dm).ok())
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();

                (text, created_at)
            }
            _ => (String::new(), String::new()),
        }
    }

    /// Who reposted this into the feed, and when.
    fn extract_repost(
        reason: &Option<
            atrium_api::types::Union<atrium_api::app::bsky::feed::defs::FeedViewPostReasonRefs>,
        >,
    ) -> Option<(Account, String)> {
        use atrium_api::app::bsky::feed::defs::FeedViewPostReasonRefs;
        use atrium_api::types::Union;

        let Union::Refs(FeedViewPostReasonRefs::ReasonRepost(repost)) = reason.as_ref()? else {
            return None;
        };

        Some((
            Account::minimal(
                repost.data.by.data.did.to_string(),
                repost.data.by.data.handle.to_string(),
                repost.data.by.data.display_name.clone(),
            ),
            repost.data.indexed_at.as_str().to_string(),
        ))
    }

    fn extract_reply_parent(
        reply: &Option<atrium_api::app::bsky::feed::defs::ReplyRef>,
    ) -> Option<ReplyTarget> {
        use atrium_api::app::bsky::feed::defs::ReplyRefParentRefs;
        use atrium_api::types::Union;

        let reply = reply.as_ref()?;
        match &reply.data.parent {
            Union::Refs(ReplyRefParentRefs::PostView(pv)) => Some(ReplyTarget {
                uri: pv.data.uri.clone(),
                author_did: pv.data.author.data.did.to_string(),
            }),
            _ => None,
        }
    }
}

impl Default for BskySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedSource for BskySource {
    async fn fetch_page(
        &self,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<FetchedPage, SourceError> {
        let agent = self.agent()?;

        let limit = limit.clamp(1, 100) as u8;
        let params = atrium_api::app::bsky::feed::get_timeline::ParametersData {
            algorithm: None,
            cursor: cursor.map(String::from),
            limit: Some(
                limit
                    .try_into()
                    .map_err(|e| SourceError::InvalidResponse(format!("invalid limit: {e}")))?,
            ),
        };

        let output = agent
            .api
            .app
            .bsky
            .feed
            .get_timeline(params.into())
            .await
            .map_err(Self::map_error)?;

        let items: Vec<FeedItem> = output
            .data
            .feed
            .into_iter()
            .map(Self::convert_feed_view_post)
            .collect();

        Ok(FetchedPage {
            items,
            cursor: output.data.cursor,
        })
    }

    async fn fetch_follows(
        &self,
        cursor: Option<&str>,
    ) -> Result<(Vec<Account>, Option<String>), SourceError> {
        let viewer = self
            .viewer_did
            .read()
            .expect("source lock poisoned")
            .clone()
            .ok_or(SourceError::NotAuthenticated)?;

        let agent = self.agent()?;

        let params = atrium_api::app::bsky::graph::get_follows::ParametersData {
            actor: viewer
                .parse()
                .map_err(|e| SourceError::InvalidResponse(format!("invalid actor: {e}")))?,
            cursor: cursor.map(String::from),
            limit: None,
        };

        let output = agent
            .api
            .app
            .bsky
            .graph
            .get_follows(params.into())
            .await
            .map_err(Self::map_error)?;

        let follows = output
            .data
            .follows
            .into_iter()
            .map(|p| {
                Account::minimal(
                    p.data.did.to_string(),
                    p.data.handle.to_string(),
                    p.data.display_name.clone(),
                )
            })
            .collect();

        Ok((follows, output.data.cursor))
    }
}
