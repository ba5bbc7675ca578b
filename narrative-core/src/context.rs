//! NarrativeContext - owns the stores and their persistence.
//!
//! A context holds the narrative, social and core game stores for one
//! playthrough together with the debounced storage they are saved through.
//! Stores are plain values; nothing is saved until [`NarrativeContext::commit`]
//! queues them, and nothing reaches the backend until the debounce timer
//! fires or [`NarrativeContext::flush`] is called.

use crate::config::NarrativeConfig;
use crate::effects::{self, ChoiceOutcome, EffectError, MinigameLaunch};
use crate::manager::StoryArcManager;
use crate::persist::debounce::{DebouncedStorage, SaveSubscription, StorageStats};
use crate::persist::migrate::{self, HydrationSource, PersistError};
use crate::persist::storage::StorageBackend;
use crate::stores::narrative::PruneReport;
use crate::stores::{CoreGameStore, NarrativeStore, SocialStore};
use crate::storylet::Storylet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// How each store was hydrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub narrative: HydrationSource,
    pub social: HydrationSource,
    pub core_game: HydrationSource,
}

impl LoadReport {
    fn fresh() -> Self {
        Self {
            narrative: HydrationSource::Missing,
            social: HydrationSource::Missing,
            core_game: HydrationSource::Missing,
        }
    }

    /// Whether any store was rebuilt from an older or damaged save.
    pub fn needs_resave(&self) -> bool {
        [self.narrative, self.social, self.core_game]
            .iter()
            .any(|source| {
                matches!(
                    source,
                    HydrationSource::Migrated { .. }
                        | HydrationSource::Recovered
                        | HydrationSource::Corrupt
                )
            })
    }
}

/// The stores for one playthrough and the storage behind them.
pub struct NarrativeContext {
    config: NarrativeConfig,
    storage: DebouncedStorage,
    narrative: NarrativeStore,
    social: SocialStore,
    core_game: CoreGameStore,
    load_report: LoadReport,
}

impl NarrativeContext {
    /// Start a fresh playthrough without reading existing saves.
    ///
    /// Store keys are never removed by quota cleanup, even when the config
    /// fails [`NarrativeConfig::validate`].
    pub fn new(config: NarrativeConfig, backend: Arc<dyn StorageBackend>) -> Self {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Store keys overlap cleanup prefixes");
        }
        let storage = DebouncedStorage::new(backend, config.debounce_options());
        Self {
            config,
            storage,
            narrative: NarrativeStore::default(),
            social: SocialStore::default(),
            core_game: CoreGameStore::default(),
            load_report: LoadReport::fresh(),
        }
    }

    /// Hydrate every store from `backend`, migrating older saves.
    ///
    /// Stores that had to be migrated or recovered are queued for saving
    /// straight away so the backend catches up with the current format.
    pub fn load(config: NarrativeConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let mut context = Self::new(config, backend);

        let config = &context.config;
        let narrative = migrate::load::<NarrativeStore>(&context.storage, &config.narrative_key);
        let social = migrate::load::<SocialStore>(&context.storage, &config.social_key);
        let core_game = migrate::load::<CoreGameStore>(&context.storage, &config.core_game_key);

        context.load_report = LoadReport {
            narrative: narrative.source,
            social: social.source,
            core_game: core_game.source,
        };
        context.narrative = narrative.state;
        context.social = social.state;
        context.core_game = core_game.state;

        info!(report = ?context.load_report, "Loaded narrative context");
        if context.load_report.needs_resave() {
            if let Err(e) = context.commit() {
                error!(error = %e, "Could not queue migrated stores");
            }
        }
        context
    }

    pub fn config(&self) -> &NarrativeConfig {
        &self.config
    }

    pub fn load_report(&self) -> LoadReport {
        self.load_report
    }

    pub fn narrative(&self) -> &NarrativeStore {
        &self.narrative
    }

    pub fn narrative_mut(&mut self) -> &mut NarrativeStore {
        &mut self.narrative
    }

    pub fn social(&self) -> &SocialStore {
        &self.social
    }

    pub fn social_mut(&mut self) -> &mut SocialStore {
        &mut self.social
    }

    pub fn core_game(&self) -> &CoreGameStore {
        &self.core_game
    }

    pub fn core_game_mut(&mut self) -> &mut CoreGameStore {
        &mut self.core_game
    }

    /// Arc operations across the narrative and social stores.
    pub fn arcs(&mut self) -> StoryArcManager<'_> {
        StoryArcManager::new(&mut self.narrative, &mut self.social)
    }

    /// Resolve a storylet choice and queue the changed stores.
    pub fn resolve_choice(
        &mut self,
        storylet: &Storylet,
        choice_id: &str,
    ) -> Result<ChoiceOutcome, EffectError> {
        let outcome =
            effects::resolve_choice(storylet, choice_id, &mut self.narrative, &mut self.core_game)?;
        self.maybe_prune();
        self.commit_logged();
        Ok(outcome)
    }

    /// Apply a finished minigame and queue the changed stores.
    pub fn resolve_minigame(&mut self, launch: &MinigameLaunch, succeeded: bool) -> ChoiceOutcome {
        let outcome =
            effects::resolve_minigame(launch, succeeded, &mut self.narrative, &mut self.core_game);
        self.commit_logged();
        outcome
    }

    /// Queue every store for saving.
    pub fn commit(&self) -> Result<(), PersistError> {
        let narrative = migrate::encode(&self.narrative)?;
        let social = migrate::encode(&self.social)?;
        let core_game = migrate::encode(&self.core_game)?;

        self.storage.set(self.config.narrative_key.as_str(), narrative);
        self.storage.set(self.config.social_key.as_str(), social);
        self.storage.set(self.config.core_game_key.as_str(), core_game);
        Ok(())
    }

    fn commit_logged(&self) {
        if let Err(e) = self.commit() {
            error!(error = %e, "Could not queue stores for saving");
        }
    }

    /// Write queued saves now.
    pub fn flush(&self) -> usize {
        self.storage.flush()
    }

    /// Be told about each save as it reaches the backend.
    pub fn on_save<F>(&self, listener: F) -> SaveSubscription
    where
        F: Fn(bool, &str) + Send + Sync + 'static,
    {
        self.storage.on_save(listener)
    }

    pub fn storage_stats(&self) -> StorageStats {
        self.storage.stats()
    }

    /// Prune the narrative store once enough has changed since the last prune.
    pub fn maybe_prune(&mut self) -> Option<PruneReport> {
        self.narrative.maybe_prune(
            self.config.prune_threshold,
            self.config.concern_history_limit,
        )
    }

    /// Start over: every store returns to its initial state together.
    pub fn reset(&mut self) {
        self.narrative.reset();
        self.social.reset();
        self.core_game.reset();
        info!("Reset all narrative stores");
        self.commit_logged();
    }
}
