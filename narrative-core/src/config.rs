//! Configuration for a narrative context.

use crate::persist::debounce::{DebounceOptions, DEFAULT_CLEANUP_PREFIXES, DEFAULT_DEBOUNCE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors from building or checking a config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store key '{key}' starts with cleanup prefix '{prefix}'")]
    DisposableStoreKey { key: String, prefix: String },
}

/// Configuration for creating a [`NarrativeContext`](crate::NarrativeContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrativeConfig {
    /// Milliseconds of quiet before queued saves are written.
    pub debounce_ms: u64,

    /// Storage key for the narrative store.
    pub narrative_key: String,

    /// Storage key for the social store.
    pub social_key: String,

    /// Storage key for the core game store.
    pub core_game_key: String,

    /// Key prefixes that may be deleted when storage is full.
    pub cleanup_prefixes: Vec<String>,

    /// Concern history entries kept by a prune.
    pub concern_history_limit: usize,

    /// Mutations between automatic prunes.
    pub prune_threshold: u32,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
            narrative_key: "narrative-store".to_string(),
            social_key: "social-store".to_string(),
            core_game_key: "core-game-store".to_string(),
            cleanup_prefixes: DEFAULT_CLEANUP_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            concern_history_limit: 100,
            prune_threshold: 100,
        }
    }
}

impl NarrativeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config, filling anything omitted with defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that no store key could be swept up by quota cleanup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for key in self.store_keys() {
            if let Some(prefix) = self
                .cleanup_prefixes
                .iter()
                .find(|prefix| key.starts_with(prefix.as_str()))
            {
                return Err(ConfigError::DisposableStoreKey {
                    key: key.to_string(),
                    prefix: prefix.clone(),
                });
            }
        }
        Ok(())
    }

    /// The narrative, social and core game keys.
    pub fn store_keys(&self) -> [&str; 3] {
        [
            self.narrative_key.as_str(),
            self.social_key.as_str(),
            self.core_game_key.as_str(),
        ]
    }

    /// Set the debounce delay.
    pub fn with_debounce(mut self, delay: Duration) -> Self {
        self.debounce_ms = delay.as_millis() as u64;
        self
    }

    /// Prefix every storage key, e.g. to keep save slots apart.
    ///
    /// A prefix that matches a cleanup prefix fails [`validate`](Self::validate).
    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.narrative_key = format!("{prefix}{}", self.narrative_key);
        self.social_key = format!("{prefix}{}", self.social_key);
        self.core_game_key = format!("{prefix}{}", self.core_game_key);
        self
    }

    pub fn with_cleanup_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cleanup_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_concern_history_limit(mut self, limit: usize) -> Self {
        self.concern_history_limit = limit;
        self
    }

    pub fn with_prune_threshold(mut self, threshold: u32) -> Self {
        self.prune_threshold = threshold;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Options for the debounced storage adapter.
    pub fn debounce_options(&self) -> DebounceOptions {
        DebounceOptions {
            delay: self.debounce(),
            cleanup_prefixes: self.cleanup_prefixes.clone(),
            protected_keys: self.store_keys().map(String::from).to_vec(),
        }
    }
}
