// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const APP_NAME: &str = "skylimit";

/// Configuration shared across the engine's components. Writers must call
/// `FeedAssembler::refilter` after changing a filtering-relevant option.
pub type SharedConfig = std::sync::Arc<std::sync::RwLock<EngineConfig>>;

/// Engine configuration. Owned by the embedding client; the engine only
/// consumes it. Any change to a filtering-relevant option must be followed
/// by a refilter pass (see `FeedAssembler::refilter`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Daily exposure budget across all followees.
    pub target_views_per_day: f64,
    /// Per-user secret keying the deterministic decision draw. Devices
    /// sharing a seed reproduce the same curation.
    pub secret_seed: String,
    /// Statistics window in days.
    pub days_of_data: u32,
    /// Force-keep posts whose engagement exceeds the high-boost threshold.
    #[serde(default)]
    pub amplify_high_boosts: bool,
    /// Engagement (likes + reposts) at which a post counts as high-boost.
    #[serde(default = "default_high_boost_threshold")]
    pub high_boost_threshold: u32,
    /// Display dropped posts anyway (decisions are still computed and
    /// persisted).
    #[serde(default)]
    pub show_all: bool,
    /// Disable curation entirely: decisions record rationale but never drop.
    #[serde(default)]
    pub disabled: bool,
    /// Posts per display page.
    pub page_length: usize,
    /// Hard cap on the rendered window; excess is trimmed into the
    /// prefetch buffer.
    pub max_displayed_window: usize,
    /// How far back lookback backfill reaches, in days.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// Oversampling factor for probe sizing.
    #[serde(default = "default_variance_factor")]
    pub variance_factor: f64,
    /// How long the probe waits on a partial page before delivering anyway.
    #[serde(default = "default_max_wait_minutes")]
    pub max_wait_minutes: u32,
}

fn default_high_boost_threshold() -> u32 {
    100
}

fn default_lookback_days() -> u32 {
    1
}

fn default_variance_factor() -> f64 {
    1.5
}

fn default_max_wait_minutes() -> u32 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_views_per_day: 200.0,
            secret_seed: String::new(),
            days_of_data: 7,
            amplify_high_boosts: false,
            high_boost_threshold: default_high_boost_threshold(),
            show_all: false,
            disabled: false,
            page_length: 25,
            max_displayed_window: 200,
            lookback_days: default_lookback_days(),
            variance_factor: default_variance_factor(),
            max_wait_minutes: default_max_wait_minutes(),
        }
    }
}

impl EngineConfig {
    /// Get the config file path (~/.config/skylimit/config.json)
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push(APP_NAME);
            p.push("config.json");
            p
        })
    }

    /// Load from disk, or return defaults if not found
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Save to disk
    pub fn save(&self) -> Result<(), String> {
        let path = Self::config_path().ok_or("Could not determine config directory")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {e}"))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;

        std::fs::write(&path, json).map_err(|e| format!("Failed to write config: {e}"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.page_length, config.page_length);
        assert_eq!(back.variance_factor, config.variance_factor);
    }

    #[test]
    fn missing_optional_fields_use_defaults() {
        let json = r#"{
            "target_views_per_day": 100.0,
            "secret_seed": "s3cret",
            "days_of_data": 3,
            "page_length": 10,
            "max_displayed_window": 50
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.high_boost_threshold, 100);
        assert!(!config.disabled);
        assert_eq!(config.max_wait_minutes, 10);
    }
}
