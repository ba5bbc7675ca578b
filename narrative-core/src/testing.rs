//! Testing utilities for narrative state.
//!
//! Provides a storage backend that records every write and a harness that
//! wraps a [`NarrativeContext`] seeded with a small story arc, so tests can
//! drive arcs, clues and saves without building the world by hand.

use crate::arc::NewArc;
use crate::clue::Clue;
use crate::config::NarrativeConfig;
use crate::context::NarrativeContext;
use crate::ids::{ArcId, ClueId, StoryletId};
use crate::manager::StoryArcManager;
use crate::persist::storage::{MemoryStorage, StorageBackend, StorageError};
use crate::stores::social::ClueArcRelationship;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Recording Storage
// ============================================================================

/// In-memory backend that keeps a log of every successful write.
#[derive(Debug, Default)]
pub struct RecordingStorage {
    inner: MemoryStorage,
    writes: Mutex<Vec<(String, String)>>,
    attempts: AtomicUsize,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recording storage that refuses writes past `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            inner: MemoryStorage::with_quota(bytes),
            ..Self::default()
        }
    }

    /// Every successful write as `(key, value)`, oldest first.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Values written to `key`, oldest first.
    pub fn writes_for(&self, key: &str) -> Vec<String> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Writes attempted, including ones the backend refused.
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl StorageBackend for RecordingStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value)?;
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys()
    }
}

// ============================================================================
// Test Harness
// ============================================================================

/// Test harness with a context seeded with one arc.
///
/// The seeded arc, "Emma's Secret", has three storylets and three clues:
/// `emma_diary` (order 1) unlocks `emma_letter` (order 2), which is a
/// prerequisite of `emma_photo` (order 3). Discovery tracking is initialized
/// for all three.
pub struct TestHarness {
    /// Backend the context saves through.
    pub storage: Arc<RecordingStorage>,
    /// The context under test.
    pub context: NarrativeContext,
    /// Id of the seeded arc.
    pub arc: ArcId,
}

impl TestHarness {
    /// Create a harness with default config and the seeded arc.
    pub fn new() -> Self {
        Self::with_config(NarrativeConfig::default())
    }

    /// Create a harness with a custom config.
    pub fn with_config(config: NarrativeConfig) -> Self {
        let storage = Arc::new(RecordingStorage::new());
        let mut context = NarrativeContext::new(config, storage.clone());
        let arc = seed_emma_arc(&mut context.arcs());
        Self {
            storage,
            context,
            arc,
        }
    }

    /// Arc operations on the context.
    pub fn arcs(&mut self) -> StoryArcManager<'_> {
        self.context.arcs()
    }

    /// Discover a clue of the seeded arc by id.
    pub fn discover(&mut self, clue: &str) -> bool {
        let clue = Clue::new(clue, clue).in_arc(self.arc.clone(), 0);
        self.context.arcs().discover_clue(clue)
    }

    /// Complete one of the seeded arc's storylets.
    pub fn play(&mut self, storylet: &str) {
        let arc = self.arc.clone();
        if let Err(e) = self.context.arcs().progress_arc_storylet(&arc, storylet) {
            panic!("Seeded arc vanished: {e}");
        }
    }

    /// The next clue of the seeded arc.
    pub fn next_clue(&mut self) -> Option<ClueId> {
        let arc = self.arc.clone();
        self.context.arcs().next_arc_clue(&arc)
    }

    /// Clue completion of the seeded arc, 0 to 100.
    pub fn clue_completion(&mut self) -> f64 {
        let arc = self.arc.clone();
        self.context.arcs().arc_completion_percentage(&arc)
    }

    /// Storylet progress of the seeded arc, 0 to 1.
    pub fn arc_progress(&self) -> f64 {
        self.context
            .narrative()
            .arc(&self.arc)
            .map_or(0.0, |arc| arc.progress)
    }

    /// Commit and flush, returning how many keys were written.
    pub fn save(&self) -> usize {
        if let Err(e) = self.context.commit() {
            panic!("Could not encode stores: {e}");
        }
        self.context.flush()
    }

    /// Load a second context from the harness's backend.
    pub fn reload(&self) -> NarrativeContext {
        NarrativeContext::load(self.context.config().clone(), self.storage.clone())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn seed_emma_arc(arcs: &mut StoryArcManager<'_>) -> ArcId {
    let arc = arcs.create_arc(NewArc::new(
        "Emma's Secret",
        "Find out what Emma has been hiding",
    ));
    let storylets = ["coffee_with_emma", "library_encounter", "the_confession"]
        .map(StoryletId::from);
    let clues = ["emma_diary", "emma_letter", "emma_photo"].map(ClueId::from);

    let seeded = arcs.seed_arc(&arc, &storylets, &clues).and_then(|_| {
        arcs.link_clue(
            "emma_diary",
            ClueArcRelationship::new(arc.clone(), 1).unlocks("emma_letter"),
        )?;
        arcs.link_clue("emma_letter", ClueArcRelationship::new(arc.clone(), 2))?;
        arcs.link_clue(
            "emma_photo",
            ClueArcRelationship::new(arc.clone(), 3).requires("emma_letter"),
        )
    });
    if let Err(e) = seeded {
        panic!("Could not seed test arc: {e}");
    }
    arc
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the seeded arc's next clue.
#[track_caller]
pub fn assert_next_clue(harness: &mut TestHarness, expected: Option<&str>) {
    let actual = harness.next_clue();
    assert_eq!(
        actual.as_ref().map(ClueId::as_str),
        expected,
        "Expected next clue {expected:?}, got {actual:?}"
    );
}

/// Assert the seeded arc's clue completion percentage.
#[track_caller]
pub fn assert_clue_completion(harness: &mut TestHarness, expected: f64) {
    let actual = harness.clue_completion();
    assert!(
        (actual - expected).abs() < 1e-9,
        "Expected clue completion {expected}%, got {actual}%"
    );
}

/// Assert the seeded arc's storylet progress.
#[track_caller]
pub fn assert_arc_progress(harness: &TestHarness, expected: f64) {
    let actual = harness.arc_progress();
    assert!(
        (actual - expected).abs() < 1e-9,
        "Expected arc progress {expected}, got {actual}"
    );
}

/// Assert the seeded arc has been marked completed.
#[track_caller]
pub fn assert_arc_completed(harness: &TestHarness) {
    let completed = harness
        .context
        .narrative()
        .arc(&harness.arc)
        .is_some_and(|arc| arc.is_completed);
    assert!(completed, "Expected arc '{}' to be completed", harness.arc);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_seeds_arc() {
        let mut harness = TestHarness::new();
        let arc = harness.arc.clone();

        assert_eq!(harness.arcs().arc_storylets(&arc).len(), 3);
        assert_eq!(
            harness.arcs().arc_clues(&arc),
            vec![
                ClueId::from("emma_diary"),
                ClueId::from("emma_letter"),
                ClueId::from("emma_photo"),
            ]
        );
        assert!(harness.arcs().validate_arc(&arc).is_valid);
        assert_next_clue(&mut harness, Some("emma_diary"));
        assert_clue_completion(&mut harness, 0.0);
    }

    #[test]
    fn test_discovery_walks_prerequisites() {
        let mut harness = TestHarness::new();

        assert!(harness.discover("emma_diary"));
        assert!(!harness.discover("emma_diary"));
        assert_next_clue(&mut harness, Some("emma_letter"));

        harness.discover("emma_letter");
        assert_next_clue(&mut harness, Some("emma_photo"));

        harness.discover("emma_photo");
        assert_next_clue(&mut harness, None);
        assert_clue_completion(&mut harness, 100.0);
    }

    #[test]
    fn test_playing_storylets_advances_progress() {
        let mut harness = TestHarness::new();
        harness.play("coffee_with_emma");
        assert_arc_progress(&harness, 1.0 / 3.0);

        harness.play("library_encounter");
        harness.play("the_confession");
        assert_arc_progress(&harness, 1.0);

        let arc = harness.arc.clone();
        harness.arcs().complete_arc(&arc).unwrap();
        assert_arc_completed(&harness);
    }

    #[test]
    fn test_recording_storage_counts_refused_writes() {
        let storage = RecordingStorage::with_quota(8);
        storage.set("a", "1").unwrap();
        assert!(storage.set("b", "far too long").is_err());

        assert_eq!(storage.attempt_count(), 2);
        assert_eq!(storage.write_count(), 1);
        assert_eq!(storage.writes(), vec![("a".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_save_and_reload() {
        let mut harness = TestHarness::new();
        harness.discover("emma_diary");
        assert_eq!(harness.save(), 3);

        let mut reloaded = harness.reload();
        let arc = harness.arc.clone();
        let completion = reloaded.arcs().arc_completion_percentage(&arc);
        assert!((completion - 100.0 / 3.0).abs() < 1e-9);
        assert!(reloaded.social().is_discovered(&ClueId::from("emma_diary")));
    }
}
