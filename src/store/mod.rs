// SPDX-License-Identifier: MPL-2.0

mod db;
mod decisions;
mod entries;
mod follows;
mod schema;

pub use db::StoreDb;
pub use decisions::{Decision, DecisionCacheStats, DecisionStore};
pub use entries::{EntryStore, FetchMetadata};
pub use follows::{AmpDirection, FollowState, FollowStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found")]
    NotFound,
    #[error("database path error: {0}")]
    Path(String),
}
