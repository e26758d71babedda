// SPDX-License-Identifier: MPL-2.0

/// SQL schema for the engine database
pub const SCHEMA: &str = r#"
-- Database version for migrations
PRAGMA user_version = 1;

-- entries: timestamp-ordered log of fetched feed entries
CREATE TABLE IF NOT EXISTS entries (
    unique_id TEXT PRIMARY KEY,
    post_timestamp_ms INTEGER NOT NULL,
    author_id TEXT NOT NULL,
    item_json TEXT NOT NULL,
    fetch_cursor TEXT,
    fetched_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON entries(post_timestamp_ms DESC);
CREATE INDEX IF NOT EXISTS idx_entries_author ON entries(author_id);
CREATE INDEX IF NOT EXISTS idx_entries_fetched_at ON entries(fetched_at);

-- decisions: curation outcome per unique_id, authoritative once written
CREATE TABLE IF NOT EXISTS decisions (
    unique_id TEXT PRIMARY KEY,
    dropped INTEGER NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    high_boost INTEGER NOT NULL DEFAULT 0,
    computed_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decisions_computed ON decisions(computed_at_ms);

-- follows: per-followee amp factor and observed post rate
CREATE TABLE IF NOT EXISTS follows (
    did TEXT PRIMARY KEY,
    handle TEXT NOT NULL,
    amp_factor REAL NOT NULL DEFAULT 1.0,
    observed_post_rate REAL,
    fetched_at INTEGER NOT NULL
);

-- fetch_meta: singleton row of cursor and cached-window boundaries
CREATE TABLE IF NOT EXISTS fetch_meta (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    last_cursor TEXT,
    newest_ms INTEGER,
    oldest_ms INTEGER,
    last_lookback_ms INTEGER
);
"#;
