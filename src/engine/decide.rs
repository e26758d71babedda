// SPDX-License-Identifier: MPL-2.0

//! The decision engine: one pure function from a fetched item, its
//! followee's state, and the global statistics snapshot to a keep/drop
//! outcome. No I/O, no clock reads; determinism across devices and
//! reloads comes from a keyed hash instead of a stored random draw.

use crate::config::EngineConfig;
use crate::engine::stats::GlobalStats;
use crate::source::FeedItem;
use crate::store::{Decision, FollowState};
use sha2::{Digest, Sha256};

/// Deterministic pseudo-random value in [0, 1) from the post identity and
/// the per-user secret seed. Same post + seed always yields the same draw,
/// so curation reproduces without persisting the draw itself.
pub fn deterministic_draw(unique_id: &str, secret_seed: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(secret_seed.as_bytes());
    // Separator keeps ("ab","c") and ("a","bc") distinct
    hasher.update([0u8]);
    hasher.update(unique_id.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) as f64 / (u64::MAX as f64 + 1.0)
}

/// Target keep-probability for a followee posting `rate` times per day at
/// multiplier `amp`, against a daily budget. Linear in the budget and
/// inversely linear in the effective rate; unknown or idle followees pass
/// unrestricted (fail-open), while a zero budget keeps nothing from a
/// followee with a known rate.
pub fn keep_probability(target_views_per_day: f64, rate: Option<f64>, amp: f64) -> f64 {
    match rate {
        Some(rate) if rate > 0.0 => (target_views_per_day / (rate * amp)).clamp(0.0, 1.0),
        _ => 1.0,
    }
}

/// Compute the curation outcome for one item. When curation is disabled
/// the rationale and statistics still flow, but nothing is ever dropped.
pub fn decide(
    item: &FeedItem,
    follow: Option<&FollowState>,
    stats: &GlobalStats,
    config: &EngineConfig,
    computed_at_ms: i64,
) -> Decision {
    let unique_id = item.unique_id();

    if item.is_edition() {
        return Decision {
            unique_id,
            dropped: false,
            message: "edition marker".to_string(),
            high_boost: false,
            computed_at_ms,
        };
    }

    if config.amplify_high_boosts && item.engagement() >= config.high_boost_threshold {
        return Decision {
            unique_id,
            dropped: false,
            message: format!("high engagement ({}), boosted past the filter", item.engagement()),
            high_boost: true,
            computed_at_ms,
        };
    }

    let rate = follow.and_then(|f| f.observed_post_rate);
    let amp = follow.map(|f| f.amp_factor).unwrap_or(1.0);
    let p = keep_probability(stats.target_views_per_day, rate, amp);

    let message = if p < 1.0 {
        let handle = follow.map(|f| f.handle.as_str()).unwrap_or("unknown");
        format!(
            "@{handle}: keeping {:.0}% ({:.1}/day at amp {amp})",
            p * 100.0,
            rate.unwrap_or(0.0),
        )
    } else {
        String::new()
    };

    let draw = deterministic_draw(&unique_id, &config.secret_seed);
    let dropped = !config.disabled && draw > p;

    Decision {
        unique_id,
        dropped,
        message,
        high_boost: false,
        computed_at_ms,
    }
}
