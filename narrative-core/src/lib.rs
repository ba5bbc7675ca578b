//! Narrative state engine for storylet-driven games.
//!
//! This crate provides:
//! - Storylet activation, completion and cooldown tracking
//! - Namespaced narrative flags
//! - Story arcs with storylet progress and clue discovery
//! - Versioned, debounced persistence with migration of older saves
//!
//! # Quick Start
//!
//! ```ignore
//! use narrative_core::{FileStorage, NarrativeConfig, NarrativeContext, NewArc};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(FileStorage::new("saves")?);
//!     let mut context = NarrativeContext::load(NarrativeConfig::default(), backend);
//!
//!     let mut arcs = context.arcs();
//!     let arc = arcs.create_arc(NewArc::new("Emma's Secret", "A mystery"));
//!     arcs.assign_clue_to_arc("emma_diary", &arc, 1)?;
//!     arcs.initialize_arc_progress(&arc, 1)?;
//!     arcs.start_arc(&arc)?;
//!
//!     context.commit()?;
//!     context.flush();
//!     Ok(())
//! }
//! ```

pub mod arc;
pub mod clue;
pub mod config;
pub mod context;
pub mod effects;
pub mod flags;
pub mod ids;
pub mod manager;
pub mod persist;
pub mod stores;
pub mod storylet;
pub mod testing;
pub mod time;

// Primary public API
pub use arc::{ArcProgress, ArcUpdate, NewArc, StoryArc};
pub use clue::{Clue, ClueCatalog, InMemoryClueCatalog};
pub use config::{ConfigError, NarrativeConfig};
pub use context::{LoadReport, NarrativeContext};
pub use effects::{ChoiceOutcome, EffectError, MinigameLaunch};
pub use flags::{FlagNamespace, FlagValue, Flags};
pub use ids::{ArcId, ClueId, NpcId, StoryletId};
pub use manager::{ArcError, StoryArcManager};
pub use persist::{
    DebouncedStorage, FileStorage, HydrationSource, MemoryStorage, PersistError, PersistedStore,
    StorageBackend, StorageError,
};
pub use stores::{CoreGameStore, NarrativeError, NarrativeStore, SocialStore};
pub use storylet::{InMemoryStoryletCatalog, Storylet, StoryletCatalog, StoryletProgress};
pub use testing::TestHarness;
