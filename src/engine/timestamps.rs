// SPDX-License-Identifier: MPL-2.0

//! Sort-timestamp derivation for fetched items.
//!
//! The remote feed guarantees nothing about authored-time ordering inside a
//! batch: records carry client-supplied `createdAt` values that can be
//! missing, garbage, or in the future. The rule here is deliberate policy:
//! take the authored time when it is sane, fall back to the fetch
//! wall-clock otherwise, then force each entry in a batch to sort strictly
//! older than its predecessor (batches arrive newest first).

use crate::source::{FeedEntry, FeedItem, ItemKind};
use chrono::DateTime;

fn parse_rfc3339_ms(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Derive the sort timestamp for one item. Reposts sort by the repost's
/// own indexed time, not the original post's authored time.
pub fn derive_timestamp(item: &FeedItem, fetched_at_ms: i64) -> i64 {
    let raw = match &item.kind {
        ItemKind::Repost { .. } => parse_rfc3339_ms(&item.indexed_at),
        _ => item
            .created_at
            .as_deref()
            .and_then(parse_rfc3339_ms)
            .or_else(|| parse_rfc3339_ms(&item.indexed_at)),
    };

    match raw {
        // Future-dated records sort at their appearance time instead.
        Some(ts) if ts <= fetched_at_ms => ts,
        _ => fetched_at_ms,
    }
}

/// Turn one fetched batch (newest first) into entries with strictly
/// decreasing timestamps, so interleaved fetches always merge into a
/// stable order.
pub fn sequence_batch(
    items: Vec<FeedItem>,
    fetched_at_ms: i64,
    cursor: Option<&str>,
) -> Vec<FeedEntry> {
    let mut previous: Option<i64> = None;

    items
        .into_iter()
        .map(|item| {
            let derived = derive_timestamp(&item, fetched_at_ms);
            let ts = match previous {
                Some(prev) if derived >= prev => prev - 1,
                _ => derived,
            };
            previous = Some(ts);

            FeedEntry {
                unique_id: item.unique_id(),
                post_timestamp_ms: ts,
                author_id: item.curated_account().did.clone(),
                item,
                fetch_cursor: cursor.map(String::from),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Account;

    const FETCHED_AT: i64 = 1_760_000_000_000;

    fn item(id: &str, created_at: Option<&str>) -> FeedItem {
        FeedItem {
            uri: format!("at://did:plc:a/app.bsky.feed.post/{id}"),
            cid: format!("cid-{id}"),
            author: Account::minimal("did:plc:a".into(), "a.test".into(), None),
            text: String::new(),
            created_at: created_at.map(String::from),
            indexed_at: "2025-10-09T06:00:00Z".to_string(),
            like_count: 0,
            repost_count: 0,
            reply_count: 0,
            reply_parent: None,
            kind: ItemKind::Original,
        }
    }

    #[test]
    fn authored_time_wins_when_sane() {
        let it = item("1", Some("2025-10-09T05:00:00Z"));
        let expected = parse_rfc3339_ms("2025-10-09T05:00:00Z").unwrap();
        assert_eq!(derive_timestamp(&it, FETCHED_AT), expected);
    }

    #[test]
    fn garbage_authored_time_falls_back_to_indexed() {
        let it = item("1", Some("not a timestamp"));
        let expected = parse_rfc3339_ms("2025-10-09T06:00:00Z").unwrap();
        assert_eq!(derive_timestamp(&it, FETCHED_AT), expected);
    }

    #[test]
    fn future_dated_record_uses_fetch_time() {
        let it = item("1", Some("2099-01-01T00:00:00Z"));
        assert_eq!(derive_timestamp(&it, FETCHED_AT), FETCHED_AT);
    }

    #[test]
    fn repost_sorts_by_repost_time() {
        let mut it = item("1", Some("2025-10-01T00:00:00Z"));
        it.kind = ItemKind::Repost {
            by: Account::minimal("did:plc:b".into(), "b.test".into(), None),
        };
        // indexed_at carries the repost's own time
        let expected = parse_rfc3339_ms("2025-10-09T06:00:00Z").unwrap();
        assert_eq!(derive_timestamp(&it, FETCHED_AT), expected);
    }

    #[test]
    fn batch_timestamps_strictly_decrease() {
        // Three items where the middle one has no parseable time and the
        // last one is out of order relative to the first.
        let items = vec![
            item("1", Some("2025-10-09T05:00:00Z")),
            item("2", Some("garbage")),
            item("3", Some("2025-10-09T05:30:00Z")),
        ];
        let entries = sequence_batch(items, FETCHED_AT, Some("cur"));

        assert_eq!(entries.len(), 3);
        for pair in entries.windows(2) {
            assert!(pair[0].post_timestamp_ms > pair[1].post_timestamp_ms);
        }
        assert!(entries.iter().all(|e| e.fetch_cursor.as_deref() == Some("cur")));
    }

    #[test]
    fn sequencing_is_stable_across_refetch() {
        let items = vec![
            item("1", Some("2025-10-09T05:00:00Z")),
            item("2", Some("2025-10-09T04:00:00Z")),
        ];
        let a = sequence_batch(items.clone(), FETCHED_AT, None);
        let b = sequence_batch(items, FETCHED_AT, None);
        assert_eq!(
            a.iter().map(|e| e.post_timestamp_ms).collect::<Vec<_>>(),
            b.iter().map(|e| e.post_timestamp_ms).collect::<Vec<_>>()
        );
    }
}
