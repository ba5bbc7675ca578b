//! The social store: NPC relationships, discovered clues, and the clue/arc
//! relationship index.
//!
//! The relationship index answers "which clue comes next in this arc" by
//! ordering the arc's clues and checking each one's prerequisites against
//! everything the player has found so far.

use crate::clue::Clue;
use crate::flags::FlagValue;
use crate::ids::{ArcId, ClueId, NpcId};
use crate::persist::migrate::{pairs_to_object, PersistedStore};
use crate::time::{now_millis, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// ============================================================================
// Clue/arc relationships
// ============================================================================

/// Where a clue sits within a story arc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClueArcRelationship {
    pub story_arc: ArcId,
    pub arc_order: i32,
    /// Clues that must be discovered before this one is offered.
    #[serde(default)]
    pub prerequisites: Vec<ClueId>,
    /// Clues that become reachable once this one is discovered.
    #[serde(default)]
    pub unlocks: Vec<ClueId>,
    /// Rough progress through the arc this clue represents, 0 to 100.
    #[serde(default)]
    pub arc_progress: f64,
}

impl ClueArcRelationship {
    pub fn new(story_arc: impl Into<ArcId>, arc_order: i32) -> Self {
        Self {
            story_arc: story_arc.into(),
            arc_order,
            prerequisites: Vec::new(),
            unlocks: Vec::new(),
            arc_progress: 0.0,
        }
    }

    /// Require another clue first.
    pub fn requires(mut self, clue: impl Into<ClueId>) -> Self {
        self.prerequisites.push(clue.into());
        self
    }

    /// Unlock another clue on discovery.
    pub fn unlocks(mut self, clue: impl Into<ClueId>) -> Self {
        self.unlocks.push(clue.into());
        self
    }

    pub fn with_arc_progress(mut self, arc_progress: f64) -> Self {
        self.arc_progress = arc_progress.clamp(0.0, 100.0);
        self
    }
}

/// Clue discovery progress for one arc.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArcDiscoveryProgress {
    #[serde(default)]
    pub discovered_clues: Vec<ClueId>,
    #[serde(default)]
    pub total_clues: u32,
    #[serde(default)]
    pub completion_percentage: f64,
    /// Clues unlocked by discoveries so far and not yet found.
    #[serde(default)]
    pub next_clues: Vec<ClueId>,
}

impl ArcDiscoveryProgress {
    pub fn new(total_clues: u32) -> Self {
        Self {
            total_clues,
            ..Self::default()
        }
    }
}

/// A record of a clue being found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    pub clue_id: ClueId,
    pub clue_title: String,
    pub method: String,
    pub timestamp: Timestamp,
}

// ============================================================================
// NPCs
// ============================================================================

/// Something that happened between the player and an NPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcInteraction {
    pub kind: String,
    #[serde(default)]
    pub change: Option<i32>,
    #[serde(default)]
    pub new_level: Option<i32>,
    #[serde(default)]
    pub details: Value,
    pub timestamp: Timestamp,
}

/// Everything tracked about one NPC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NpcState {
    #[serde(default)]
    pub relationship: i32,
    #[serde(default)]
    pub interactions: Vec<NpcInteraction>,
    #[serde(default)]
    pub memory: Option<Value>,
    #[serde(default)]
    pub flags: BTreeMap<String, FlagValue>,
}

// ============================================================================
// Store
// ============================================================================

/// Social state for one playthrough.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SocialStore {
    #[serde(default)]
    npcs: BTreeMap<NpcId, NpcState>,
    #[serde(default)]
    discovered: Vec<Clue>,
    #[serde(default)]
    connections: BTreeMap<ClueId, Vec<ClueId>>,
    #[serde(default)]
    discovery_events: Vec<DiscoveryEvent>,
    #[serde(default)]
    arc_relationships: BTreeMap<ClueId, ClueArcRelationship>,
    #[serde(default)]
    arc_discovery: BTreeMap<ArcId, ArcDiscoveryProgress>,
}

impl SocialStore {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Relationship Index
    // =========================================================================

    /// Insert or wholesale replace a clue's arc relationship.
    pub fn set_clue_arc_relationship(
        &mut self,
        clue: impl Into<ClueId>,
        relationship: ClueArcRelationship,
    ) -> Option<ClueArcRelationship> {
        let clue = clue.into();
        debug!(
            clue = %clue,
            arc = %relationship.story_arc,
            order = relationship.arc_order,
            "Linked clue to arc"
        );
        self.arc_relationships.insert(clue, relationship)
    }

    pub fn remove_clue_arc_relationship(&mut self, clue: &ClueId) -> Option<ClueArcRelationship> {
        self.arc_relationships.remove(clue)
    }

    pub fn clue_arc_relationship(&self, clue: &ClueId) -> Option<&ClueArcRelationship> {
        self.arc_relationships.get(clue)
    }

    /// Every clue/arc relationship.
    pub fn arc_relationships(&self) -> &BTreeMap<ClueId, ClueArcRelationship> {
        &self.arc_relationships
    }

    /// Clues in an arc, ascending by order with ties broken by id.
    pub fn clues_by_arc(&self, arc: &ArcId) -> Vec<ClueId> {
        let mut clues: Vec<_> = self
            .arc_relationships
            .iter()
            .filter(|(_, rel)| &rel.story_arc == arc)
            .map(|(id, rel)| (rel.arc_order, id))
            .collect();
        clues.sort();
        clues.into_iter().map(|(_, id)| id.clone()).collect()
    }

    fn discovered_in(&self, arc: &ArcId) -> BTreeSet<&ClueId> {
        let mut found: BTreeSet<&ClueId> = self.discovered.iter().map(|c| &c.id).collect();
        if let Some(progress) = self.arc_discovery.get(arc) {
            found.extend(progress.discovered_clues.iter());
        }
        found
    }

    /// The first undiscovered clue in an arc whose prerequisites are all
    /// discovered.
    pub fn next_clue_in_arc(&self, arc: &ArcId) -> Option<ClueId> {
        let found = self.discovered_in(arc);
        self.clues_by_arc(arc).into_iter().find(|clue| {
            if found.contains(clue) {
                return false;
            }
            self.arc_relationships
                .get(clue)
                .map_or(true, |rel| rel.prerequisites.iter().all(|p| found.contains(p)))
        })
    }

    /// Drop every relationship pointing at an arc along with its discovery
    /// progress. Returns how many relationships were removed.
    pub fn remove_arc(&mut self, arc: &ArcId) -> usize {
        let before = self.arc_relationships.len();
        self.arc_relationships.retain(|_, rel| &rel.story_arc != arc);
        self.arc_discovery.remove(arc);
        before - self.arc_relationships.len()
    }

    // =========================================================================
    // Arc Discovery Progress
    // =========================================================================

    /// Start (or restart) discovery tracking for an arc.
    pub fn initialize_arc_progress(&mut self, arc: impl Into<ArcId>, total_clues: u32) {
        let arc = arc.into();
        debug!(arc = %arc, total_clues, "Initialized arc discovery progress");
        self.arc_discovery
            .insert(arc, ArcDiscoveryProgress::new(total_clues));
    }

    /// Record a clue as found within an arc.
    ///
    /// Does nothing and returns `false` when the arc's tracking was never
    /// initialized.
    pub fn update_arc_discovery_progress(&mut self, arc: &ArcId, clue: &ClueId) -> bool {
        let unlocks = self
            .arc_relationships
            .get(clue)
            .map(|rel| rel.unlocks.clone())
            .unwrap_or_default();
        let Some(progress) = self.arc_discovery.get_mut(arc) else {
            debug!(arc = %arc, clue = %clue, "Arc discovery progress not initialized");
            return false;
        };

        if !progress.discovered_clues.contains(clue) {
            progress.discovered_clues.push(clue.clone());
        }
        progress.completion_percentage = if progress.total_clues == 0 {
            0.0
        } else {
            let ratio = progress.discovered_clues.len() as f64 / f64::from(progress.total_clues);
            (ratio * 100.0).min(100.0)
        };

        progress.next_clues.retain(|c| c != clue);
        for unlocked in unlocks {
            if &unlocked != clue
                && !progress.next_clues.contains(&unlocked)
                && !progress.discovered_clues.contains(&unlocked)
            {
                progress.next_clues.push(unlocked);
            }
        }
        true
    }

    pub fn arc_discovery_progress(&self, arc: &ArcId) -> Option<&ArcDiscoveryProgress> {
        self.arc_discovery.get(arc)
    }

    /// Percentage of an arc's clues found, 0 when untracked.
    pub fn arc_completion_percentage(&self, arc: &ArcId) -> f64 {
        self.arc_discovery
            .get(arc)
            .map_or(0.0, |p| p.completion_percentage)
    }

    /// Clues unlocked in an arc and not yet found.
    pub fn available_clues_for_arc(&self, arc: &ArcId) -> &[ClueId] {
        self.arc_discovery
            .get(arc)
            .map(|p| p.next_clues.as_slice())
            .unwrap_or_default()
    }

    // =========================================================================
    // Discovered Clues
    // =========================================================================

    pub fn discovered_clues(&self) -> &[Clue] {
        &self.discovered
    }

    pub fn is_discovered(&self, clue: &ClueId) -> bool {
        self.discovered.iter().any(|c| &c.id == clue)
    }

    pub fn discovery_events(&self) -> &[DiscoveryEvent] {
        &self.discovery_events
    }

    /// Record a clue as found. Returns `false` if it already was.
    pub fn discover_clue(&mut self, clue: Clue) -> bool {
        self.discover_clue_via(clue, "unknown")
    }

    /// Record a clue as found by a named method (minigame, storylet, ...).
    pub fn discover_clue_via(&mut self, mut clue: Clue, method: impl Into<String>) -> bool {
        if self.is_discovered(&clue.id) {
            return false;
        }
        let now = now_millis();
        clue.discovered_at.get_or_insert(now);
        self.discovery_events.push(DiscoveryEvent {
            clue_id: clue.id.clone(),
            clue_title: clue.title.clone(),
            method: method.into(),
            timestamp: now,
        });
        debug!(clue = %clue.id, "Clue discovered");
        self.discovered.push(clue);
        true
    }

    /// Connect two clues both ways. Returns `false` if already connected.
    pub fn connect_clues(&mut self, a: &ClueId, b: &ClueId) -> bool {
        let forward = self.connections.entry(a.clone()).or_default();
        if forward.contains(b) {
            return false;
        }
        forward.push(b.clone());
        let backward = self.connections.entry(b.clone()).or_default();
        if !backward.contains(a) {
            backward.push(a.clone());
        }
        true
    }

    pub fn connections(&self, clue: &ClueId) -> &[ClueId] {
        self.connections
            .get(clue)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    // =========================================================================
    // NPCs
    // =========================================================================

    pub fn npc(&self, npc: &NpcId) -> Option<&NpcState> {
        self.npcs.get(npc)
    }

    /// Relationship level with an NPC, 0 for strangers.
    pub fn relationship(&self, npc: &NpcId) -> i32 {
        self.npcs.get(npc).map_or(0, |n| n.relationship)
    }

    /// Shift a relationship and log the change. Returns the new level.
    pub fn update_relationship(&mut self, npc: impl Into<NpcId>, change: i32) -> i32 {
        let state = self.npcs.entry(npc.into()).or_default();
        state.relationship = state.relationship.saturating_add(change);
        state.interactions.push(NpcInteraction {
            kind: "relationship_change".to_string(),
            change: Some(change),
            new_level: Some(state.relationship),
            details: Value::Null,
            timestamp: now_millis(),
        });
        state.relationship
    }

    pub fn record_npc_interaction(
        &mut self,
        npc: impl Into<NpcId>,
        kind: impl Into<String>,
        details: Value,
    ) {
        self.npcs
            .entry(npc.into())
            .or_default()
            .interactions
            .push(NpcInteraction {
                kind: kind.into(),
                change: None,
                new_level: None,
                details,
                timestamp: now_millis(),
            });
    }

    pub fn set_npc_memory(&mut self, npc: impl Into<NpcId>, memory: Value) {
        self.npcs.entry(npc.into()).or_default().memory = Some(memory);
    }

    pub fn set_npc_flag(
        &mut self,
        npc: impl Into<NpcId>,
        flag: impl Into<String>,
        value: impl Into<FlagValue>,
    ) -> Option<FlagValue> {
        self.npcs
            .entry(npc.into())
            .or_default()
            .flags
            .insert(flag.into(), value.into())
    }

    pub fn npc_flag(&self, npc: &NpcId, flag: &str) -> Option<&FlagValue> {
        self.npcs.get(npc).and_then(|n| n.flags.get(flag))
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl PersistedStore for SocialStore {
    const VERSION: u32 = 1;

    fn upgrade_legacy(state: &mut Value) {
        for field in ["npcs", "connections", "arc_relationships", "arc_discovery"] {
            if let Some(value) = state.get_mut(field) {
                pairs_to_object(value);
            }
        }
    }

    fn after_load(&mut self) {
        for progress in self.arc_discovery.values_mut() {
            let percentage = progress.completion_percentage;
            progress.completion_percentage = if percentage.is_nan() {
                0.0
            } else {
                percentage.clamp(0.0, 100.0)
            };
        }
    }
}
