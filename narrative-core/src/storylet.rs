//! Storylet content and activation tracking.
//!
//! Storylet *content* (text, choices, effects) belongs to a catalog; this
//! crate only consumes it. What the narrative core owns is activation state:
//! which storylets are active, which are completed, and which are cooling
//! down before they may fire again.

use crate::flags::FlagValue;
use crate::ids::StoryletId;
use crate::time::{now_millis, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Catalog content
// ============================================================================

/// A discrete narrative event with branching choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Storylet {
    pub id: StoryletId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub choices: Vec<Choice>,
}

impl Storylet {
    /// Create a storylet with no choices and an always-available trigger.
    pub fn new(id: impl Into<StoryletId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            trigger: Trigger::default(),
            choices: Vec::new(),
        }
    }

    /// Set the narrative text.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the trigger.
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Add a choice.
    pub fn with_choice(mut self, choice: Choice) -> Self {
        self.choices.push(choice);
        self
    }

    /// Find a choice by id.
    pub fn choice(&self, choice_id: &str) -> Option<&Choice> {
        self.choices.iter().find(|c| c.id == choice_id)
    }
}

/// What makes a storylet available. Conditions are interpreted by the
/// catalog's owner, not by this crate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default)]
    pub kind: TriggerKind,
    #[serde(default)]
    pub conditions: BTreeMap<String, serde_json::Value>,
}

/// Trigger category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    #[default]
    Time,
    Flag,
    Resource,
}

/// One option the player can pick inside a storylet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub effects: Vec<Effect>,
    #[serde(default)]
    pub next_storylet_id: Option<StoryletId>,
}

impl Choice {
    /// Create a choice with no effects.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            effects: Vec::new(),
            next_storylet_id: None,
        }
    }

    /// Add an effect.
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    /// Branch to another storylet when chosen.
    pub fn leads_to(mut self, storylet: impl Into<StoryletId>) -> Self {
        self.next_storylet_id = Some(storylet.into());
        self
    }
}

/// A single consequence of picking a choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Effect {
    /// Adjust a character resource (energy, stress, money, ...).
    Resource { key: String, delta: f64 },
    /// Set a storylet flag.
    Flag { key: String, value: FlagValue },
    /// Award experience to a skill.
    SkillXp { key: String, amount: u64 },
    /// Activate another storylet immediately.
    Unlock { storylet_id: StoryletId },
    /// Launch a minigame; the nested effects apply on its outcome.
    Minigame {
        game_id: String,
        #[serde(default)]
        on_success: Vec<Effect>,
        #[serde(default)]
        on_failure: Vec<Effect>,
    },
}

/// Source of storylet content.
pub trait StoryletCatalog {
    /// Look up a storylet.
    fn storylet(&self, id: &StoryletId) -> Option<&Storylet>;

    /// Add or replace a storylet, returning the one it replaced.
    fn upsert(&mut self, storylet: Storylet) -> Option<Storylet>;
}

/// A catalog held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStoryletCatalog {
    storylets: BTreeMap<StoryletId, Storylet>,
}

impl InMemoryStoryletCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of storylets in the catalog.
    pub fn len(&self) -> usize {
        self.storylets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storylets.is_empty()
    }
}

impl FromIterator<Storylet> for InMemoryStoryletCatalog {
    fn from_iter<I: IntoIterator<Item = Storylet>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for storylet in iter {
            catalog.upsert(storylet);
        }
        catalog
    }
}

impl StoryletCatalog for InMemoryStoryletCatalog {
    fn storylet(&self, id: &StoryletId) -> Option<&Storylet> {
        self.storylets.get(id)
    }

    fn upsert(&mut self, storylet: Storylet) -> Option<Storylet> {
        self.storylets.insert(storylet.id.clone(), storylet)
    }
}

// ============================================================================
// Activation tracking
// ============================================================================

/// Where a storylet sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryletStatus {
    Inactive,
    Active,
    Completed,
}

/// Active/completed/cooldown state for every storylet the player has seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryletProgress {
    #[serde(default)]
    active: Vec<StoryletId>,
    #[serde(default)]
    completed: Vec<StoryletId>,
    #[serde(default)]
    cooldowns: BTreeMap<StoryletId, Timestamp>,
    /// Storylets authored in-game, kept with the save.
    #[serde(default)]
    user_created: Vec<Storylet>,
}

impl StoryletProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active storylets, in activation order.
    pub fn active(&self) -> &[StoryletId] {
        &self.active
    }

    /// Completed storylets, in completion order.
    pub fn completed(&self) -> &[StoryletId] {
        &self.completed
    }

    /// The storylet currently in front of the player, if any.
    pub fn current(&self) -> Option<&StoryletId> {
        self.active.first()
    }

    /// Lifecycle state of a storylet. Active wins over completed for
    /// repeatable storylets that have been re-activated.
    pub fn status(&self, id: &StoryletId) -> StoryletStatus {
        if self.active.contains(id) {
            StoryletStatus::Active
        } else if self.completed.contains(id) {
            StoryletStatus::Completed
        } else {
            StoryletStatus::Inactive
        }
    }

    /// Activate a storylet. Returns `false` if it was already active.
    pub fn add_active(&mut self, id: StoryletId) -> bool {
        if self.active.contains(&id) {
            return false;
        }
        self.active.push(id);
        true
    }

    /// Deactivate a storylet without completing it.
    pub fn remove_active(&mut self, id: &StoryletId) -> bool {
        let before = self.active.len();
        self.active.retain(|a| a != id);
        self.active.len() != before
    }

    /// Complete a storylet.
    ///
    /// Completing a storylet that was never activated is allowed and simply
    /// records it as completed. Returns `false` if it was already completed.
    pub fn complete(&mut self, id: StoryletId) -> bool {
        self.active.retain(|a| a != &id);
        if self.completed.contains(&id) {
            return false;
        }
        self.completed.push(id);
        true
    }

    /// Block a storylet until `until`.
    pub fn set_cooldown(&mut self, id: StoryletId, until: Timestamp) {
        self.cooldowns.insert(id, until);
    }

    /// Lift a cooldown early.
    pub fn clear_cooldown(&mut self, id: &StoryletId) -> Option<Timestamp> {
        self.cooldowns.remove(id)
    }

    /// When a storylet's cooldown ends, if it has one.
    pub fn cooldown_until(&self, id: &StoryletId) -> Option<Timestamp> {
        self.cooldowns.get(id).copied()
    }

    /// Whether a storylet may fire now.
    pub fn is_available(&self, id: &StoryletId) -> bool {
        self.is_available_at(id, now_millis())
    }

    /// Whether a storylet may fire at `now`: not cooling down and not
    /// already completed. Repeat rules are layered on by callers.
    pub fn is_available_at(&self, id: &StoryletId, now: Timestamp) -> bool {
        if let Some(until) = self.cooldowns.get(id) {
            if now < *until {
                return false;
            }
        }
        !self.completed.contains(id)
    }

    /// Drop cooldowns that ended at or before `now`. Returns how many.
    pub fn prune_cooldowns(&mut self, now: Timestamp) -> usize {
        let before = self.cooldowns.len();
        self.cooldowns.retain(|_, until| *until > now);
        before - self.cooldowns.len()
    }

    /// Number of tracked cooldowns.
    pub fn cooldown_count(&self) -> usize {
        self.cooldowns.len()
    }

    /// Storylets authored in-game.
    pub fn user_created(&self) -> &[Storylet] {
        &self.user_created
    }

    /// Add or replace an in-game authored storylet.
    pub fn upsert_user_created(&mut self, storylet: Storylet) {
        match self.user_created.iter_mut().find(|s| s.id == storylet.id) {
            Some(existing) => *existing = storylet,
            None => self.user_created.push(storylet),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> StoryletId {
        StoryletId::from(s)
    }

    #[test]
    fn test_activation_is_idempotent() {
        let mut progress = StoryletProgress::new();
        assert!(progress.add_active(id("s1")));
        assert!(!progress.add_active(id("s1")));
        assert_eq!(progress.active().len(), 1);
        assert_eq!(progress.status(&id("s1")), StoryletStatus::Active);
    }

    #[test]
    fn test_complete_moves_out_of_active_once() {
        let mut progress = StoryletProgress::new();
        progress.add_active(id("s1"));

        assert!(progress.complete(id("s1")));
        assert!(!progress.complete(id("s1")));

        assert!(progress.active().is_empty());
        assert_eq!(progress.completed(), &[id("s1")]);
        assert_eq!(progress.status(&id("s1")), StoryletStatus::Completed);
    }

    #[test]
    fn test_completing_inactive_storylet_is_tolerated() {
        let mut progress = StoryletProgress::new();
        assert!(progress.complete(id("never_started")));
        assert_eq!(progress.completed().len(), 1);
    }

    #[test]
    fn test_cooldown_blocks_until_expiry() {
        let mut progress = StoryletProgress::new();
        progress.set_cooldown(id("party"), 1_000);

        assert!(!progress.is_available_at(&id("party"), 999));
        assert!(progress.is_available_at(&id("party"), 1_000));
    }

    #[test]
    fn test_completed_storylet_is_unavailable() {
        let mut progress = StoryletProgress::new();
        progress.complete(id("orientation"));
        assert!(!progress.is_available_at(&id("orientation"), 0));
        assert!(progress.is_available_at(&id("unseen"), 0));
    }

    #[test]
    fn test_prune_cooldowns() {
        let mut progress = StoryletProgress::new();
        progress.set_cooldown(id("a"), 100);
        progress.set_cooldown(id("b"), 500);

        assert_eq!(progress.prune_cooldowns(200), 1);
        assert_eq!(progress.cooldown_until(&id("b")), Some(500));
        assert_eq!(progress.cooldown_count(), 1);
    }

    #[test]
    fn test_effect_wire_format() {
        let json = r#"{"type": "skill_xp", "key": "coding", "amount": 15}"#;
        let effect: Effect = serde_json::from_str(json).unwrap();
        assert_eq!(
            effect,
            Effect::SkillXp {
                key: "coding".to_string(),
                amount: 15
            }
        );
    }

    #[test]
    fn test_catalog_upsert_replaces() {
        let mut catalog = InMemoryStoryletCatalog::new();
        assert!(catalog.upsert(Storylet::new("intro", "Intro")).is_none());
        let replaced = catalog.upsert(Storylet::new("intro", "Intro (revised)"));

        assert_eq!(replaced.map(|s| s.name), Some("Intro".to_string()));
        assert_eq!(catalog.len(), 1);
    }
}
