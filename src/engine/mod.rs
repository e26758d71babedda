// SPDX-License-Identifier: MPL-2.0

mod decide;
mod stats;
mod timestamps;

pub use decide::{decide, deterministic_draw, keep_probability};
pub use stats::{GlobalStats, StatsAggregator};
pub use timestamps::{derive_timestamp, sequence_batch};
