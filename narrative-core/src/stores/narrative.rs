//! The narrative store: storylet activation, flags, concerns and story arcs.

use crate::arc::{ArcFailure, ArcProgress, ArcUpdate, NewArc, StoryArc};
use crate::flags::{FlagNamespace, FlagValue, Flags};
use crate::ids::{ArcId, StoryletId};
use crate::persist::migrate::{pairs_to_object, PersistedStore};
use crate::storylet::{Storylet, StoryletProgress, StoryletStatus};
use crate::time::{now_millis, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from narrative store mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NarrativeError {
    #[error("Story arc not found: {0}")]
    ArcNotFound(ArcId),
}

/// Character concerns and their recorded history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Concerns {
    #[serde(default)]
    pub current: BTreeMap<String, FlagValue>,
    #[serde(default)]
    pub history: Vec<ConcernHistoryEntry>,
}

/// A snapshot of concerns at some point in play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcernHistoryEntry {
    pub recorded_at: Timestamp,
    #[serde(default)]
    pub concerns: BTreeMap<String, FlagValue>,
}

/// What a prune pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub cooldowns_removed: usize,
    pub history_trimmed: usize,
}

/// Size counters for the narrative store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NarrativeMetrics {
    pub active_storylets: usize,
    pub completed_storylets: usize,
    pub cooldowns: usize,
    pub flags: usize,
    pub story_arcs: usize,
    pub concern_history: usize,
    pub operations_since_prune: u32,
}

/// Narrative state for one playthrough.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NarrativeStore {
    #[serde(default)]
    storylets: StoryletProgress,
    #[serde(default)]
    flags: Flags,
    #[serde(default)]
    story_arcs: BTreeMap<ArcId, StoryArc>,
    #[serde(default)]
    arc_progress: BTreeMap<ArcId, ArcProgress>,
    #[serde(default)]
    concerns: Concerns,
    #[serde(skip)]
    operation_count: u32,
}

impl NarrativeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&mut self) {
        self.operation_count = self.operation_count.saturating_add(1);
    }

    fn arc_mut(&mut self, id: &ArcId) -> Result<&mut StoryArc, NarrativeError> {
        self.story_arcs
            .get_mut(id)
            .ok_or_else(|| NarrativeError::ArcNotFound(id.clone()))
    }

    // =========================================================================
    // Storylet Progress
    // =========================================================================

    /// Activation state for all storylets.
    pub fn storylets(&self) -> &StoryletProgress {
        &self.storylets
    }

    /// Activate a storylet. Returns `false` if it was already active.
    pub fn add_active(&mut self, id: impl Into<StoryletId>) -> bool {
        let id = id.into();
        let added = self.storylets.add_active(id.clone());
        if added {
            debug!(storylet = %id, "Storylet activated");
            self.bump();
        }
        added
    }

    /// Deactivate a storylet without completing it.
    pub fn remove_active(&mut self, id: &StoryletId) -> bool {
        let removed = self.storylets.remove_active(id);
        if removed {
            self.bump();
        }
        removed
    }

    /// Complete a storylet. Returns `false` if it was already completed.
    pub fn complete_storylet(&mut self, id: impl Into<StoryletId>) -> bool {
        let id = id.into();
        let was_active = self.storylets.status(&id) == StoryletStatus::Active;
        let completed = self.storylets.complete(id.clone());
        if completed {
            if !was_active {
                debug!(storylet = %id, "Completed a storylet that was not active");
            }
            self.bump();
        }
        completed
    }

    /// The storylet currently in front of the player.
    pub fn current_storylet(&self) -> Option<&StoryletId> {
        self.storylets.current()
    }

    /// Block a storylet until `until`.
    pub fn set_cooldown(&mut self, id: impl Into<StoryletId>, until: Timestamp) {
        self.storylets.set_cooldown(id.into(), until);
        self.bump();
    }

    /// Whether a storylet may fire now.
    pub fn evaluate_availability(&self, id: &StoryletId) -> bool {
        self.storylets.is_available(id)
    }

    /// Whether a storylet may fire at `now`.
    pub fn evaluate_availability_at(&self, id: &StoryletId, now: Timestamp) -> bool {
        self.storylets.is_available_at(id, now)
    }

    /// Keep an in-game authored storylet with the save.
    pub fn add_user_storylet(&mut self, storylet: Storylet) {
        self.storylets.upsert_user_created(storylet);
        self.bump();
    }

    // =========================================================================
    // Flags
    // =========================================================================

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// Set a flag, returning the value it replaced.
    pub fn set_flag(
        &mut self,
        namespace: FlagNamespace,
        key: impl Into<String>,
        value: impl Into<FlagValue>,
    ) -> Option<FlagValue> {
        self.bump();
        self.flags.set(namespace, key, value)
    }

    pub fn get_flag(&self, namespace: FlagNamespace, key: &str) -> Option<&FlagValue> {
        self.flags.get(namespace, key)
    }

    pub fn remove_flag(&mut self, namespace: FlagNamespace, key: &str) -> Option<FlagValue> {
        self.bump();
        self.flags.remove(namespace, key)
    }

    /// Every flag in one namespace.
    pub fn flags_in(&self, namespace: FlagNamespace) -> &BTreeMap<String, FlagValue> {
        self.flags.namespace(namespace)
    }

    pub fn clear_namespace(&mut self, namespace: FlagNamespace) {
        self.bump();
        self.flags.clear_namespace(namespace);
    }

    // =========================================================================
    // Concerns
    // =========================================================================

    pub fn concerns(&self) -> &Concerns {
        &self.concerns
    }

    /// Merge new concern values over the current ones.
    pub fn update_concerns(&mut self, updates: BTreeMap<String, FlagValue>) {
        self.concerns.current.extend(updates);
        self.bump();
    }

    /// Record a concern snapshot.
    pub fn add_concern_history(&mut self, concerns: BTreeMap<String, FlagValue>) {
        self.concerns.history.push(ConcernHistoryEntry {
            recorded_at: now_millis(),
            concerns,
        });
        self.bump();
    }

    // =========================================================================
    // Story Arcs
    // =========================================================================

    /// Create a story arc and its empty progress record.
    pub fn create_arc(&mut self, input: NewArc) -> ArcId {
        let id = ArcId::generate();
        let arc = StoryArc::new(id.clone(), input, now_millis());
        info!(arc = %id, name = %arc.name, "Created story arc");

        self.story_arcs.insert(id.clone(), arc);
        self.arc_progress.insert(id.clone(), ArcProgress::default());
        self.bump();
        id
    }

    pub fn arc(&self, id: &ArcId) -> Option<&StoryArc> {
        self.story_arcs.get(id)
    }

    /// All arcs, oldest first.
    pub fn all_arcs(&self) -> Vec<&StoryArc> {
        let mut arcs: Vec<_> = self.story_arcs.values().collect();
        arcs.sort_by(|a, b| {
            a.metadata
                .created_at
                .cmp(&b.metadata.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        arcs
    }

    /// Shallow-merge an update into an arc.
    pub fn update_arc(&mut self, id: &ArcId, update: ArcUpdate) -> Result<(), NarrativeError> {
        let arc = self.arc_mut(id)?;
        update.apply(arc, now_millis());
        debug!(arc = %id, "Updated story arc");
        self.bump();
        Ok(())
    }

    /// Remove an arc and its progress record.
    pub fn delete_arc(&mut self, id: &ArcId) -> Result<StoryArc, NarrativeError> {
        let arc = self
            .story_arcs
            .remove(id)
            .ok_or_else(|| NarrativeError::ArcNotFound(id.clone()))?;
        self.arc_progress.remove(id);
        info!(arc = %id, "Deleted story arc");
        self.bump();
        Ok(arc)
    }

    /// Start an arc. Returns `false` if it had already started.
    pub fn start_arc(&mut self, id: &ArcId) -> Result<bool, NarrativeError> {
        let now = now_millis();
        let arc = self.arc_mut(id)?;
        arc.touch(now);
        if arc.started_at.is_some() {
            return Ok(false);
        }
        arc.started_at = Some(now);
        info!(arc = %id, "Started story arc");
        self.bump();
        Ok(true)
    }

    pub fn complete_arc(&mut self, id: &ArcId) -> Result<(), NarrativeError> {
        let arc = self.arc_mut(id)?;
        arc.complete(now_millis());
        info!(arc = %id, "Completed story arc");
        self.bump();
        Ok(())
    }

    /// Count a failure against an arc and log it in the arc's progress.
    /// Returns the new failure count.
    pub fn record_arc_failure(
        &mut self,
        id: &ArcId,
        reason: impl Into<String>,
    ) -> Result<u32, NarrativeError> {
        let now = now_millis();
        let arc = self.arc_mut(id)?;
        arc.failures = arc.failures.saturating_add(1);
        arc.touch(now);
        let failures = arc.failures;
        let failure = ArcFailure {
            storylet_id: arc.current_storylet.clone(),
            timestamp: now,
            reason: reason.into(),
        };
        warn!(arc = %id, reason = %failure.reason, failures, "Story arc failure");

        self.arc_progress
            .entry(id.clone())
            .or_default()
            .failures
            .push(failure);
        self.bump();
        Ok(failures)
    }

    pub fn arc_progress(&self, id: &ArcId) -> Option<&ArcProgress> {
        self.arc_progress.get(id)
    }

    /// Set a flag scoped to one arc's progress.
    pub fn set_arc_progress_flag(
        &mut self,
        id: &ArcId,
        key: impl Into<String>,
        value: impl Into<FlagValue>,
    ) -> Result<(), NarrativeError> {
        if !self.story_arcs.contains_key(id) {
            return Err(NarrativeError::ArcNotFound(id.clone()));
        }
        self.arc_progress
            .entry(id.clone())
            .or_default()
            .flags
            .insert(key.into(), value.into());
        self.bump();
        Ok(())
    }

    /// Add a storylet to an arc. Assigning the same storylet twice is a no-op
    /// that returns `false`.
    pub fn assign_storylet_to_arc(
        &mut self,
        storylet: impl Into<StoryletId>,
        arc_id: &ArcId,
    ) -> Result<bool, NarrativeError> {
        let storylet = storylet.into();
        let now = now_millis();
        let arc = self.arc_mut(arc_id)?;
        arc.touch(now);
        if arc.metadata.available_storylets.contains(&storylet) {
            return Ok(false);
        }
        arc.metadata.available_storylets.push(storylet.clone());
        arc.metadata.total_storylets = arc.metadata.available_storylets.len() as u32;

        let progress = self.arc_progress.entry(arc_id.clone()).or_default();
        if !progress.completed_storylets.contains(&storylet)
            && !progress.available_storylets.contains(&storylet)
        {
            progress.available_storylets.push(storylet.clone());
        }
        debug!(arc = %arc_id, storylet = %storylet, "Assigned storylet to arc");
        self.bump();
        Ok(true)
    }

    /// Storylets assigned to an arc, in assignment order.
    pub fn arc_storylets(&self, id: &ArcId) -> Option<&[StoryletId]> {
        self.story_arcs
            .get(id)
            .map(|arc| arc.metadata.available_storylets.as_slice())
    }

    /// Mark a storylet done within an arc and recompute the arc's progress.
    ///
    /// A storylet that was never assigned is assigned first.
    pub fn progress_arc_storylet(
        &mut self,
        arc_id: &ArcId,
        storylet: impl Into<StoryletId>,
    ) -> Result<(), NarrativeError> {
        let storylet = storylet.into();
        let assigned = self
            .arc(arc_id)
            .ok_or_else(|| NarrativeError::ArcNotFound(arc_id.clone()))?
            .metadata
            .available_storylets
            .contains(&storylet);
        if !assigned {
            self.assign_storylet_to_arc(storylet.clone(), arc_id)?;
        }

        let progress = self.arc_progress.entry(arc_id.clone()).or_default();
        progress.available_storylets.retain(|s| s != &storylet);
        if !progress.completed_storylets.contains(&storylet) {
            progress.completed_storylets.push(storylet.clone());
        }
        progress.current_storylet_id = Some(storylet.clone());
        let completed = progress.completed_storylets.len() as u32;

        let arc = self.arc_mut(arc_id)?;
        let total = arc.metadata.total_storylets;
        arc.metadata.completed_storylets = completed.min(total);
        arc.progress = if total == 0 {
            0.0
        } else {
            f64::from(arc.metadata.completed_storylets) / f64::from(total)
        };
        arc.current_storylet = Some(storylet.clone());
        arc.normalize();
        arc.touch(now_millis());
        debug!(
            arc = %arc_id,
            storylet = %storylet,
            progress = arc.progress,
            "Progressed story arc"
        );
        self.bump();
        Ok(())
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Drop expired cooldowns and cap concern history at `history_limit`
    /// entries, keeping the newest.
    pub fn prune_at(&mut self, now: Timestamp, history_limit: usize) -> PruneReport {
        let cooldowns_removed = self.storylets.prune_cooldowns(now);
        let history = &mut self.concerns.history;
        let history_trimmed = history.len().saturating_sub(history_limit);
        history.drain(..history_trimmed);
        self.operation_count = 0;

        if cooldowns_removed > 0 || history_trimmed > 0 {
            debug!(cooldowns_removed, history_trimmed, "Pruned narrative store");
        }
        PruneReport {
            cooldowns_removed,
            history_trimmed,
        }
    }

    pub fn prune(&mut self, history_limit: usize) -> PruneReport {
        self.prune_at(now_millis(), history_limit)
    }

    /// Prune once `threshold` mutations have happened since the last prune.
    pub fn maybe_prune(&mut self, threshold: u32, history_limit: usize) -> Option<PruneReport> {
        (self.operation_count >= threshold).then(|| self.prune(history_limit))
    }

    pub fn metrics(&self) -> NarrativeMetrics {
        NarrativeMetrics {
            active_storylets: self.storylets.active().len(),
            completed_storylets: self.storylets.completed().len(),
            cooldowns: self.storylets.cooldown_count(),
            flags: self.flags.len(),
            story_arcs: self.story_arcs.len(),
            concern_history: self.concerns.history.len(),
            operations_since_prune: self.operation_count,
        }
    }

    /// Return to a fresh playthrough.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl PersistedStore for NarrativeStore {
    const VERSION: u32 = 1;

    /// Older saves stored maps as arrays of `[key, value]` pairs.
    fn upgrade_legacy(state: &mut Value) {
        if let Some(flags) = state.get_mut("flags").and_then(Value::as_object_mut) {
            for namespace in flags.values_mut() {
                pairs_to_object(namespace);
            }
        }
        for field in ["story_arcs", "arc_progress"] {
            if let Some(value) = state.get_mut(field) {
                pairs_to_object(value);
            }
        }
    }

    fn after_load(&mut self) {
        for arc in self.story_arcs.values_mut() {
            arc.normalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> StoryletId {
        StoryletId::from(s)
    }

    #[test]
    fn test_create_arc_starts_empty() {
        let mut store = NarrativeStore::new();
        let id = store.create_arc(NewArc::new("Emma", "Romance"));

        let arc = store.arc(&id).unwrap();
        assert!(id.as_str().starts_with("arc_"));
        assert_eq!(arc.progress, 0.0);
        assert!(!arc.is_started());
        assert!(store.arc_progress(&id).is_some());
    }

    #[test]
    fn test_unknown_arc_mutations_fail() {
        let mut store = NarrativeStore::new();
        let missing = ArcId::from("nope");

        assert_eq!(
            store.update_arc(&missing, ArcUpdate::new().progress(0.5)),
            Err(NarrativeError::ArcNotFound(missing.clone()))
        );
        assert!(store.start_arc(&missing).is_err());
        assert!(store.complete_arc(&missing).is_err());
        assert!(store.record_arc_failure(&missing, "x").is_err());
        assert!(store.delete_arc(&missing).is_err());
        assert!(store.assign_storylet_to_arc("s1", &missing).is_err());
    }

    #[test]
    fn test_start_arc_only_once() {
        let mut store = NarrativeStore::new();
        let id = store.create_arc(NewArc::new("A", ""));

        assert_eq!(store.start_arc(&id), Ok(true));
        let started = store.arc(&id).unwrap().started_at;
        assert_eq!(store.start_arc(&id), Ok(false));
        assert_eq!(store.arc(&id).unwrap().started_at, started);
    }

    #[test]
    fn test_assign_storylet_deduplicates() {
        let mut store = NarrativeStore::new();
        let id = store.create_arc(NewArc::new("A", ""));

        assert_eq!(store.assign_storylet_to_arc("s1", &id), Ok(true));
        assert_eq!(store.assign_storylet_to_arc("s2", &id), Ok(true));
        assert_eq!(store.assign_storylet_to_arc("s1", &id), Ok(false));

        let arc = store.arc(&id).unwrap();
        assert_eq!(arc.metadata.total_storylets, 2);
        assert_eq!(store.arc_storylets(&id).unwrap(), &[sid("s1"), sid("s2")]);
    }

    #[test]
    fn test_progress_arc_storylet_updates_fraction() {
        let mut store = NarrativeStore::new();
        let id = store.create_arc(NewArc::new("A", ""));
        for s in ["s1", "s2", "s3", "s4"] {
            store.assign_storylet_to_arc(s, &id).unwrap();
        }

        store.progress_arc_storylet(&id, "s1").unwrap();
        store.progress_arc_storylet(&id, "s1").unwrap();
        let arc = store.arc(&id).unwrap();
        assert_eq!(arc.progress, 0.25);
        assert_eq!(arc.metadata.completed_storylets, 1);
        assert_eq!(arc.current_storylet, Some(sid("s1")));

        let progress = store.arc_progress(&id).unwrap();
        assert_eq!(progress.completed_storylets, vec![sid("s1")]);
        assert!(!progress.available_storylets.contains(&sid("s1")));
    }

    #[test]
    fn test_progressing_unassigned_storylet_assigns_it() {
        let mut store = NarrativeStore::new();
        let id = store.create_arc(NewArc::new("A", ""));
        store.progress_arc_storylet(&id, "surprise").unwrap();

        let arc = store.arc(&id).unwrap();
        assert_eq!(arc.metadata.total_storylets, 1);
        assert_eq!(arc.progress, 1.0);
        assert!(arc.metadata.completed_storylets <= arc.metadata.total_storylets);
    }

    #[test]
    fn test_record_failure_captures_current_storylet() {
        let mut store = NarrativeStore::new();
        let id = store.create_arc(NewArc::new("A", ""));
        store.progress_arc_storylet(&id, "s1").unwrap();

        assert_eq!(store.record_arc_failure(&id, "missed the exam"), Ok(1));
        assert_eq!(store.record_arc_failure(&id, "again"), Ok(2));

        let failures = &store.arc_progress(&id).unwrap().failures;
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].storylet_id, Some(sid("s1")));
        assert_eq!(failures[0].reason, "missed the exam");
    }

    #[test]
    fn test_delete_arc_removes_progress() {
        let mut store = NarrativeStore::new();
        let id = store.create_arc(NewArc::new("A", ""));
        store.delete_arc(&id).unwrap();

        assert!(store.arc(&id).is_none());
        assert!(store.arc_progress(&id).is_none());
    }

    #[test]
    fn test_complete_arc() {
        let mut store = NarrativeStore::new();
        let id = store.create_arc(NewArc::new("A", ""));
        store.complete_arc(&id).unwrap();

        let arc = store.arc(&id).unwrap();
        assert!(arc.is_completed);
        assert_eq!(arc.progress, 1.0);
        assert!(arc.completed_at.is_some());
    }

    #[test]
    fn test_prune_caps_history() {
        let mut store = NarrativeStore::new();
        for i in 0..5 {
            let mut snapshot = BTreeMap::new();
            snapshot.insert("stress".to_string(), FlagValue::from(i));
            store.add_concern_history(snapshot);
        }
        store.set_cooldown("a", 10);
        store.set_cooldown("b", 10_000);

        let report = store.prune_at(100, 3);
        assert_eq!(report.cooldowns_removed, 1);
        assert_eq!(report.history_trimmed, 2);

        let history = &store.concerns().history;
        assert_eq!(history.len(), 3);
        assert_eq!(
            history[0].concerns.get("stress"),
            Some(&FlagValue::Number(2.0))
        );
        assert_eq!(store.metrics().operations_since_prune, 0);
    }

    #[test]
    fn test_maybe_prune_waits_for_threshold() {
        let mut store = NarrativeStore::new();
        store.add_active("s1");
        assert!(store.maybe_prune(3, 100).is_none());
        store.add_active("s2");
        store.complete_storylet("s1");
        assert!(store.maybe_prune(3, 100).is_some());
        assert_eq!(store.metrics().operations_since_prune, 0);
    }

    #[test]
    fn test_legacy_pair_arrays_are_upgraded() {
        let mut state = serde_json::json!({
            "flags": {
                "storylet": [["met_emma", true], ["gpa", 3.5]],
                "concerns": {}
            }
        });
        NarrativeStore::upgrade_legacy(&mut state);
        assert_eq!(state["flags"]["storylet"]["met_emma"], true);
        assert_eq!(state["flags"]["storylet"]["gpa"], 3.5);
    }
}
