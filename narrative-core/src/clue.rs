//! Clue content.

use crate::ids::{ArcId, ClueId, StoryletId};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Broad grouping for clues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClueCategory {
    #[default]
    General,
    Academic,
    Social,
    Personal,
    Mystery,
    Achievement,
}

/// How hard a clue is to uncover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

/// How often a clue turns up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rarity {
    #[default]
    Common,
    Uncommon,
    Rare,
    Legendary,
}

/// A discoverable narrative artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clue {
    pub id: ClueId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub category: ClueCategory,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub rarity: Rarity,
    /// Arc this clue belongs to, as authored.
    #[serde(default)]
    pub story_arc: Option<ArcId>,
    /// Position within the arc (1, 2, 3, ...).
    #[serde(default)]
    pub arc_order: Option<i32>,
    /// Minigame types that can surface this clue.
    #[serde(default)]
    pub minigame_types: Vec<String>,
    /// Storylets that can trigger this clue.
    #[serde(default)]
    pub associated_storylets: Vec<StoryletId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub discovered_at: Option<Timestamp>,
}

impl Clue {
    /// Create a general, easy, common clue.
    pub fn new(id: impl Into<ClueId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            content: String::new(),
            category: ClueCategory::default(),
            difficulty: Difficulty::default(),
            rarity: Rarity::default(),
            story_arc: None,
            arc_order: None,
            minigame_types: Vec::new(),
            associated_storylets: Vec::new(),
            tags: Vec::new(),
            discovered_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_category(mut self, category: ClueCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_rarity(mut self, rarity: Rarity) -> Self {
        self.rarity = rarity;
        self
    }

    /// Place the clue in an arc at the given order.
    pub fn in_arc(mut self, arc: impl Into<ArcId>, order: i32) -> Self {
        self.story_arc = Some(arc.into());
        self.arc_order = Some(order);
        self
    }

    /// Tie the clue to a storylet that can reveal it.
    pub fn revealed_by(mut self, storylet: impl Into<StoryletId>) -> Self {
        self.associated_storylets.push(storylet.into());
        self
    }
}

/// Source of clue content.
pub trait ClueCatalog {
    /// Look up a clue.
    fn clue(&self, id: &ClueId) -> Option<&Clue>;

    /// Add a clue, replacing any clue with the same id. Returns its id.
    fn create(&mut self, clue: Clue) -> ClueId;
}

/// A clue catalog held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryClueCatalog {
    clues: BTreeMap<ClueId, Clue>,
}

impl InMemoryClueCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clues authored into an arc, ordered by their arc position.
    pub fn clues_for_arc(&self, arc: &ArcId) -> Vec<&Clue> {
        let mut clues: Vec<_> = self
            .clues
            .values()
            .filter(|c| c.story_arc.as_ref() == Some(arc))
            .collect();
        clues.sort_by_key(|c| (c.arc_order.unwrap_or(i32::MAX), c.id.clone()));
        clues
    }

    /// Clues a storylet can reveal.
    pub fn clues_for_storylet(&self, storylet: &StoryletId) -> Vec<&Clue> {
        self.clues
            .values()
            .filter(|c| c.associated_storylets.contains(storylet))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clues.is_empty()
    }
}

impl ClueCatalog for InMemoryClueCatalog {
    fn clue(&self, id: &ClueId) -> Option<&Clue> {
        self.clues.get(id)
    }

    fn create(&mut self, clue: Clue) -> ClueId {
        let id = clue.id.clone();
        self.clues.insert(id.clone(), clue);
        id
    }
}
