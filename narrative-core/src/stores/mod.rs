//! The three persisted stores.

pub mod core_game;
pub mod narrative;
pub mod social;

pub use core_game::CoreGameStore;
pub use narrative::{NarrativeError, NarrativeStore};
pub use social::SocialStore;
