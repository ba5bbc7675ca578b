//! One API over story arcs, spanning the narrative and social stores.
//!
//! Arcs live in the narrative store while the clues that belong to them are
//! indexed in the social store. [`StoryArcManager`] borrows both and keeps
//! them consistent: deleting an arc also drops its clue relationships, and
//! discovering a clue advances the discovery progress of its arc.

use crate::arc::{ArcProgress, ArcUpdate, NewArc, StoryArc};
use crate::clue::Clue;
use crate::flags::FlagNamespace;
use crate::ids::{ArcId, ClueId, StoryletId};
use crate::stores::narrative::NarrativeError;
use crate::stores::social::{ClueArcRelationship, SocialStore};
use crate::stores::NarrativeStore;
use crate::time::{now_millis, Timestamp};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::info;

/// Errors from arc operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArcError {
    #[error("Story arc not found: {0}")]
    ArcNotFound(ArcId),

    #[error("Clue discovery is not being tracked for arc {0}")]
    DiscoveryNotInitialized(ArcId),
}

impl From<NarrativeError> for ArcError {
    fn from(err: NarrativeError) -> Self {
        match err {
            NarrativeError::ArcNotFound(id) => ArcError::ArcNotFound(id),
        }
    }
}

/// Aggregate numbers for one arc.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArcStatistics {
    pub total_storylets: u32,
    pub completed_storylets: u32,
    pub available_storylets: usize,
    pub total_clues: usize,
    pub discovered_clues: usize,
    /// Arc progress as a percentage.
    pub completion_percentage: f64,
    pub last_accessed: Timestamp,
    pub times_started: u32,
    pub failures: u32,
}

/// What happened to an arc, for the player's journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcHistoryAction {
    Started,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArcHistoryEntry {
    pub arc_id: ArcId,
    pub arc_name: String,
    pub action: ArcHistoryAction,
    pub timestamp: Timestamp,
}

/// A problem found by [`StoryArcManager::validate_arc`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcIssue {
    ArcNotFound,
    NoClues,
    NoStorylets,
    StoryletCountMismatch { recorded: u32, actual: usize },
}

impl fmt::Display for ArcIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArcIssue::ArcNotFound => write!(f, "Arc not found"),
            ArcIssue::NoClues => write!(f, "No clues assigned to arc"),
            ArcIssue::NoStorylets => write!(f, "No storylets assigned to arc"),
            ArcIssue::StoryletCountMismatch { recorded, actual } => write!(
                f,
                "Storylet count mismatch in metadata ({recorded} recorded, {actual} assigned)"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArcValidation {
    pub is_valid: bool,
    pub issues: Vec<ArcIssue>,
}

/// A self-contained snapshot of an arc for backup or sharing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArcExport {
    pub arc: StoryArc,
    pub progress: Option<ArcProgress>,
    pub clues: Vec<ClueId>,
    pub storylets: Vec<StoryletId>,
    pub clue_relationships: BTreeMap<ClueId, ClueArcRelationship>,
    pub exported_at: Timestamp,
}

/// Borrowed view over the narrative and social stores.
pub struct StoryArcManager<'a> {
    narrative: &'a mut NarrativeStore,
    social: &'a mut SocialStore,
}

impl<'a> StoryArcManager<'a> {
    pub fn new(narrative: &'a mut NarrativeStore, social: &'a mut SocialStore) -> Self {
        Self { narrative, social }
    }

    fn existing(&self, id: &ArcId) -> Result<&StoryArc, ArcError> {
        self.narrative
            .arc(id)
            .ok_or_else(|| ArcError::ArcNotFound(id.clone()))
    }

    // =========================================================================
    // Arcs
    // =========================================================================

    pub fn create_arc(&mut self, input: NewArc) -> ArcId {
        self.narrative.create_arc(input)
    }

    pub fn update_arc(&mut self, id: &ArcId, update: ArcUpdate) -> Result<(), ArcError> {
        Ok(self.narrative.update_arc(id, update)?)
    }

    /// Delete an arc, its progress, and every clue relationship pointing at it.
    pub fn delete_arc(&mut self, id: &ArcId) -> Result<StoryArc, ArcError> {
        self.existing(id)?;
        let removed = self.social.remove_arc(id);
        let arc = self.narrative.delete_arc(id)?;
        info!(
            arc = %id,
            name = %arc.name,
            clue_relationships = removed,
            "Deleted story arc and its clue links"
        );
        Ok(arc)
    }

    pub fn arc(&self, id: &ArcId) -> Option<&StoryArc> {
        self.narrative.arc(id)
    }

    pub fn all_arcs(&self) -> Vec<&StoryArc> {
        self.narrative.all_arcs()
    }

    /// Start an arc. Returns `false` if it had already started.
    pub fn start_arc(&mut self, id: &ArcId) -> Result<bool, ArcError> {
        Ok(self.narrative.start_arc(id)?)
    }

    pub fn complete_arc(&mut self, id: &ArcId) -> Result<(), ArcError> {
        Ok(self.narrative.complete_arc(id)?)
    }

    pub fn record_arc_failure(
        &mut self,
        id: &ArcId,
        reason: impl Into<String>,
    ) -> Result<u32, ArcError> {
        Ok(self.narrative.record_arc_failure(id, reason)?)
    }

    pub fn arc_progress(&self, id: &ArcId) -> Option<&ArcProgress> {
        self.narrative.arc_progress(id)
    }

    // =========================================================================
    // Storylets
    // =========================================================================

    pub fn assign_storylet_to_arc(
        &mut self,
        storylet: impl Into<StoryletId>,
        arc: &ArcId,
    ) -> Result<bool, ArcError> {
        Ok(self.narrative.assign_storylet_to_arc(storylet, arc)?)
    }

    /// Every storylet assigned to an arc.
    pub fn arc_storylets(&self, arc: &ArcId) -> &[StoryletId] {
        self.narrative.arc_storylets(arc).unwrap_or_default()
    }

    /// Assigned storylets the player has not yet finished.
    pub fn available_storylets(&self, arc: &ArcId) -> &[StoryletId] {
        self.narrative
            .arc_progress(arc)
            .map(|p| p.available_storylets.as_slice())
            .unwrap_or_default()
    }

    pub fn progress_arc_storylet(
        &mut self,
        arc: &ArcId,
        storylet: impl Into<StoryletId>,
    ) -> Result<(), ArcError> {
        Ok(self.narrative.progress_arc_storylet(arc, storylet)?)
    }

    // =========================================================================
    // Clues
    // =========================================================================

    /// Place a clue in an arc at `order`, replacing any previous link.
    pub fn assign_clue_to_arc(
        &mut self,
        clue: impl Into<ClueId>,
        arc: &ArcId,
        order: i32,
    ) -> Result<(), ArcError> {
        self.existing(arc)?;
        let estimate = f64::from(order) / 10.0 * 100.0;
        self.social.set_clue_arc_relationship(
            clue,
            ClueArcRelationship::new(arc.clone(), order).with_arc_progress(estimate),
        );
        Ok(())
    }

    /// Link a clue with a full relationship (prerequisites, unlocks).
    pub fn link_clue(
        &mut self,
        clue: impl Into<ClueId>,
        relationship: ClueArcRelationship,
    ) -> Result<(), ArcError> {
        self.existing(&relationship.story_arc)?;
        self.social.set_clue_arc_relationship(clue, relationship);
        Ok(())
    }

    /// Clues in an arc, in order.
    pub fn arc_clues(&self, arc: &ArcId) -> Vec<ClueId> {
        self.social.clues_by_arc(arc)
    }

    /// Count a clue as found within an arc.
    pub fn progress_arc_clue(&mut self, arc: &ArcId, clue: &ClueId) -> Result<(), ArcError> {
        self.existing(arc)?;
        if self.social.update_arc_discovery_progress(arc, clue) {
            Ok(())
        } else {
            Err(ArcError::DiscoveryNotInitialized(arc.clone()))
        }
    }

    pub fn next_arc_clue(&self, arc: &ArcId) -> Option<ClueId> {
        self.social.next_clue_in_arc(arc)
    }

    pub fn initialize_arc_progress(
        &mut self,
        arc: &ArcId,
        total_clues: u32,
    ) -> Result<(), ArcError> {
        self.existing(arc)?;
        self.social.initialize_arc_progress(arc.clone(), total_clues);
        Ok(())
    }

    pub fn arc_completion_percentage(&self, arc: &ArcId) -> f64 {
        self.social.arc_completion_percentage(arc)
    }

    /// Record a discovered clue and advance its arc, if it has one that is
    /// being tracked. Returns `false` if the clue was already discovered.
    pub fn discover_clue(&mut self, clue: Clue) -> bool {
        let id = clue.id.clone();
        if !self.social.discover_clue(clue) {
            return false;
        }
        let arc = self
            .social
            .clue_arc_relationship(&id)
            .map(|rel| rel.story_arc.clone());
        if let Some(arc) = arc {
            self.social.update_arc_discovery_progress(&arc, &id);
        }
        true
    }

    // =========================================================================
    // Cross-Arc
    // =========================================================================

    /// Branch from one arc into another, starting the target if needed.
    ///
    /// The jump flags are set before the target is started; there is no
    /// rollback if anything after them fails.
    pub fn jump_to_arc(&mut self, from: &ArcId, to: &ArcId) -> Result<(), ArcError> {
        let from_name = self.existing(from)?.name.clone();
        let to_name = self.existing(to)?.name.clone();

        self.narrative
            .set_flag(FlagNamespace::StoryArc, format!("jumped_from_{from}"), true);
        self.narrative
            .set_flag(FlagNamespace::StoryArc, format!("jumped_to_{to}"), now_millis());
        self.narrative.start_arc(to)?;

        info!(from = %from_name, to = %to_name, "Jumped between story arcs");
        Ok(())
    }

    /// Arcs whose clues have prerequisites in `arc`, i.e. arcs that wait on it.
    pub fn arc_dependencies(&self, arc: &ArcId) -> Vec<ArcId> {
        let own: BTreeSet<_> = self.social.clues_by_arc(arc).into_iter().collect();
        let dependents: BTreeSet<_> = self
            .social
            .arc_relationships()
            .values()
            .filter(|rel| &rel.story_arc != arc)
            .filter(|rel| rel.prerequisites.iter().any(|p| own.contains(p)))
            .map(|rel| rel.story_arc.clone())
            .collect();
        dependents.into_iter().collect()
    }

    /// Arcs whose clues need clues from other arcs.
    fn prerequisite_arcs(&self, arc: &ArcId) -> BTreeSet<ArcId> {
        let relationships = self.social.arc_relationships();
        relationships
            .values()
            .filter(|rel| &rel.story_arc == arc)
            .flat_map(|rel| rel.prerequisites.iter())
            .filter_map(|p| relationships.get(p))
            .map(|rel| rel.story_arc.clone())
            .filter(|owner| owner != arc)
            .collect()
    }

    /// Arcs with no unfinished prerequisite arc.
    pub fn unlocked_arcs(&self) -> Vec<ArcId> {
        self.all_arcs()
            .into_iter()
            .filter(|arc| {
                self.prerequisite_arcs(&arc.id)
                    .iter()
                    .all(|dep| self.narrative.arc(dep).map_or(true, |a| a.is_completed))
            })
            .map(|arc| arc.id.clone())
            .collect()
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    pub fn arc_statistics(&self, id: &ArcId) -> Result<ArcStatistics, ArcError> {
        let arc = self.existing(id)?;
        let clues = self.social.clues_by_arc(id);
        let discovered = clues
            .iter()
            .filter(|clue| self.social.is_discovered(clue))
            .count();

        Ok(ArcStatistics {
            total_storylets: arc.metadata.total_storylets,
            completed_storylets: arc.metadata.completed_storylets,
            available_storylets: self.available_storylets(id).len(),
            total_clues: clues.len(),
            discovered_clues: discovered,
            completion_percentage: arc.progress * 100.0,
            last_accessed: arc.metadata.last_accessed,
            times_started: u32::from(arc.is_started()),
            failures: arc.failures,
        })
    }

    /// Started arcs, most recent event first.
    pub fn player_arc_history(&self) -> Vec<ArcHistoryEntry> {
        let mut history: Vec<_> = self
            .all_arcs()
            .into_iter()
            .filter(|arc| arc.is_started())
            .map(|arc| ArcHistoryEntry {
                arc_id: arc.id.clone(),
                arc_name: arc.name.clone(),
                action: if arc.is_completed {
                    ArcHistoryAction::Completed
                } else {
                    ArcHistoryAction::Started
                },
                timestamp: arc
                    .completed_at
                    .or(arc.started_at)
                    .unwrap_or(arc.metadata.created_at),
            })
            .collect();
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        history
    }

    /// Percentage of arcs completed, 0 when there are none.
    pub fn arc_completion_rate(&self) -> f64 {
        let arcs = self.all_arcs();
        if arcs.is_empty() {
            return 0.0;
        }
        let completed = arcs.iter().filter(|arc| arc.is_completed).count();
        completed as f64 / arcs.len() as f64 * 100.0
    }

    /// Set up discovery tracking for `clues` and assign `storylets` in one go.
    pub fn seed_arc(
        &mut self,
        arc: &ArcId,
        storylets: &[StoryletId],
        clues: &[ClueId],
    ) -> Result<(), ArcError> {
        self.initialize_arc_progress(arc, clues.len() as u32)?;
        for storylet in storylets {
            self.assign_storylet_to_arc(storylet.clone(), arc)?;
        }
        info!(arc = %arc, storylets = storylets.len(), clues = clues.len(), "Seeded story arc");
        Ok(())
    }

    pub fn validate_arc(&self, id: &ArcId) -> ArcValidation {
        let Some(arc) = self.narrative.arc(id) else {
            return ArcValidation {
                is_valid: false,
                issues: vec![ArcIssue::ArcNotFound],
            };
        };

        let mut issues = Vec::new();
        if self.social.clues_by_arc(id).is_empty() {
            issues.push(ArcIssue::NoClues);
        }
        let storylets = self.arc_storylets(id);
        if storylets.is_empty() {
            issues.push(ArcIssue::NoStorylets);
        }
        if arc.metadata.total_storylets as usize != storylets.len() {
            issues.push(ArcIssue::StoryletCountMismatch {
                recorded: arc.metadata.total_storylets,
                actual: storylets.len(),
            });
        }

        ArcValidation {
            is_valid: issues.is_empty(),
            issues,
        }
    }

    pub fn export_arc(&self, id: &ArcId) -> Result<ArcExport, ArcError> {
        let arc = self.existing(id)?.clone();
        let clues = self.social.clues_by_arc(id);
        let clue_relationships = clues
            .iter()
            .filter_map(|clue| {
                self.social
                    .clue_arc_relationship(clue)
                    .map(|rel| (clue.clone(), rel.clone()))
            })
            .collect();

        Ok(ArcExport {
            arc,
            progress: self.narrative.arc_progress(id).cloned(),
            storylets: self.arc_storylets(id).to_vec(),
            clues,
            clue_relationships,
            exported_at: now_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> (NarrativeStore, SocialStore) {
        (NarrativeStore::new(), SocialStore::new())
    }

    #[test]
    fn test_assign_clue_estimates_progress() {
        let (mut narrative, mut social) = stores();
        let mut arcs = StoryArcManager::new(&mut narrative, &mut social);
        let arc = arcs.create_arc(NewArc::new("Mystery", ""));

        arcs.assign_clue_to_arc("c3", &arc, 3).unwrap();
        arcs.assign_clue_to_arc("c12", &arc, 12).unwrap();

        let rel = social.clue_arc_relationship(&ClueId::from("c3")).unwrap();
        assert_eq!(rel.arc_progress, 30.0);
        let rel = social.clue_arc_relationship(&ClueId::from("c12")).unwrap();
        assert_eq!(rel.arc_progress, 100.0);
    }

    #[test]
    fn test_clue_ops_require_arc() {
        let (mut narrative, mut social) = stores();
        let mut arcs = StoryArcManager::new(&mut narrative, &mut social);
        let missing = ArcId::from("missing");

        assert_eq!(
            arcs.assign_clue_to_arc("c1", &missing, 1),
            Err(ArcError::ArcNotFound(missing.clone()))
        );
        assert!(arcs.initialize_arc_progress(&missing, 3).is_err());
        assert!(arcs.export_arc(&missing).is_err());
        assert!(arcs.arc_statistics(&missing).is_err());
    }

    #[test]
    fn test_progress_clue_needs_tracking() {
        let (mut narrative, mut social) = stores();
        let mut arcs = StoryArcManager::new(&mut narrative, &mut social);
        let arc = arcs.create_arc(NewArc::new("Mystery", ""));

        assert_eq!(
            arcs.progress_arc_clue(&arc, &ClueId::from("c1")),
            Err(ArcError::DiscoveryNotInitialized(arc.clone()))
        );
        arcs.initialize_arc_progress(&arc, 4).unwrap();
        arcs.progress_arc_clue(&arc, &ClueId::from("c1")).unwrap();
        assert_eq!(arcs.arc_completion_percentage(&arc), 25.0);
    }

    #[test]
    fn test_jump_sets_flags_and_starts_target() {
        let (mut narrative, mut social) = stores();
        let mut arcs = StoryArcManager::new(&mut narrative, &mut social);
        let from = arcs.create_arc(NewArc::new("Freshman year", ""));
        let to = arcs.create_arc(NewArc::new("Study abroad", ""));

        arcs.jump_to_arc(&from, &to).unwrap();
        assert!(arcs.arc(&to).unwrap().is_started());
        assert!(!arcs.arc(&from).unwrap().is_started());

        let flags = narrative.flags_in(FlagNamespace::StoryArc);
        assert_eq!(
            flags.get(&format!("jumped_from_{from}")),
            Some(&crate::flags::FlagValue::Bool(true))
        );
        assert!(flags
            .get(&format!("jumped_to_{to}"))
            .and_then(|v| v.as_number())
            .is_some());
    }

    #[test]
    fn test_jump_to_missing_arc_sets_nothing() {
        let (mut narrative, mut social) = stores();
        let mut arcs = StoryArcManager::new(&mut narrative, &mut social);
        let from = arcs.create_arc(NewArc::new("A", ""));

        assert!(arcs.jump_to_arc(&from, &ArcId::from("gone")).is_err());
        assert!(narrative.flags_in(FlagNamespace::StoryArc).is_empty());
    }

    #[test]
    fn test_dependencies_follow_clue_prerequisites() {
        let (mut narrative, mut social) = stores();
        let mut arcs = StoryArcManager::new(&mut narrative, &mut social);
        let first = arcs.create_arc(NewArc::new("First", ""));
        let second = arcs.create_arc(NewArc::new("Second", ""));

        arcs.link_clue("a1", ClueArcRelationship::new(first.clone(), 1))
            .unwrap();
        arcs.link_clue(
            "b1",
            ClueArcRelationship::new(second.clone(), 1).requires("a1"),
        )
        .unwrap();

        assert_eq!(arcs.arc_dependencies(&first), vec![second.clone()]);
        assert!(arcs.arc_dependencies(&second).is_empty());
        assert_eq!(arcs.unlocked_arcs(), vec![first.clone()]);

        arcs.complete_arc(&first).unwrap();
        let unlocked = arcs.unlocked_arcs();
        assert!(unlocked.contains(&second));
    }

    #[test]
    fn test_statistics_and_completion_rate() {
        let (mut narrative, mut social) = stores();
        let mut arcs = StoryArcManager::new(&mut narrative, &mut social);
        let arc = arcs.create_arc(NewArc::new("Romance", ""));
        let other = arcs.create_arc(NewArc::new("Career", ""));
        arcs.seed_arc(
            &arc,
            &[StoryletId::from("s1"), StoryletId::from("s2")],
            &[ClueId::from("c1")],
        )
        .unwrap();
        arcs.assign_clue_to_arc("c1", &arc, 1).unwrap();
        arcs.discover_clue(Clue::new("c1", "Love letter"));
        arcs.progress_arc_storylet(&arc, "s1").unwrap();
        arcs.complete_arc(&other).unwrap();

        let stats = arcs.arc_statistics(&arc).unwrap();
        assert_eq!(stats.total_storylets, 2);
        assert_eq!(stats.completed_storylets, 1);
        assert_eq!(stats.available_storylets, 1);
        assert_eq!(stats.total_clues, 1);
        assert_eq!(stats.discovered_clues, 1);
        assert_eq!(stats.completion_percentage, 50.0);
        assert_eq!(stats.times_started, 0);
        assert_eq!(arcs.arc_completion_percentage(&arc), 100.0);
        assert_eq!(arcs.arc_completion_rate(), 50.0);
    }

    #[test]
    fn test_history_lists_started_arcs() {
        let (mut narrative, mut social) = stores();
        let mut arcs = StoryArcManager::new(&mut narrative, &mut social);
        let started = arcs.create_arc(NewArc::new("Started", ""));
        let done = arcs.create_arc(NewArc::new("Done", ""));
        arcs.create_arc(NewArc::new("Untouched", ""));
        arcs.start_arc(&started).unwrap();
        arcs.start_arc(&done).unwrap();
        arcs.complete_arc(&done).unwrap();

        let history = arcs.player_arc_history();
        assert_eq!(history.len(), 2);
        let done_entry = history.iter().find(|e| e.arc_id == done).unwrap();
        assert_eq!(done_entry.action, ArcHistoryAction::Completed);
    }

    #[test]
    fn test_validate_arc_reports_issues() {
        let (mut narrative, mut social) = stores();
        let mut arcs = StoryArcManager::new(&mut narrative, &mut social);
        let arc = arcs.create_arc(NewArc::new("Empty", ""));

        let validation = arcs.validate_arc(&arc);
        assert!(!validation.is_valid);
        assert_eq!(validation.issues, vec![ArcIssue::NoClues, ArcIssue::NoStorylets]);

        arcs.assign_storylet_to_arc("s1", &arc).unwrap();
        arcs.assign_clue_to_arc("c1", &arc, 1).unwrap();
        assert!(arcs.validate_arc(&arc).is_valid);

        let missing = arcs.validate_arc(&ArcId::from("nope"));
        assert_eq!(missing.issues, vec![ArcIssue::ArcNotFound]);
        assert_eq!(missing.issues[0].to_string(), "Arc not found");
    }

    #[test]
    fn test_export_serializes() {
        let (mut narrative, mut social) = stores();
        let mut arcs = StoryArcManager::new(&mut narrative, &mut social);
        let arc = arcs.create_arc(NewArc::new("Mystery", "Who took the trophy?"));
        arcs.assign_storylet_to_arc("s1", &arc).unwrap();
        arcs.assign_clue_to_arc("c1", &arc, 1).unwrap();

        let export = arcs.export_arc(&arc).unwrap();
        assert_eq!(export.clues, vec![ClueId::from("c1")]);
        assert_eq!(export.storylets, vec![StoryletId::from("s1")]);
        assert!(export.clue_relationships.contains_key(&ClueId::from("c1")));

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["arc"]["name"], "Mystery");
        assert_eq!(json["clue_relationships"]["c1"]["arc_order"], 1);
    }
}
