//! The core game store: player stats, character profile, skills and world time.

use crate::persist::migrate::{pairs_to_object, PersistedStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Player progression and spendable resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(default)]
    pub experience: u64,
    #[serde(default)]
    pub skill_points: u32,
    /// Energy, stress, money and the like.
    #[serde(default)]
    pub resources: BTreeMap<String, f64>,
}

fn default_level() -> u32 {
    1
}

impl Default for PlayerStats {
    fn default() -> Self {
        Self {
            level: default_level(),
            experience: 0,
            skill_points: 0,
            resources: BTreeMap::new(),
        }
    }
}

/// Who the player is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// Experience earned per skill.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillLedger {
    #[serde(default)]
    pub experience: BTreeMap<String, u64>,
    #[serde(default)]
    pub total_experience: u64,
}

/// In-game calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldClock {
    #[serde(default = "default_day")]
    pub day: u32,
    #[serde(default)]
    pub is_time_paused: bool,
}

fn default_day() -> u32 {
    1
}

impl Default for WorldClock {
    fn default() -> Self {
        Self {
            day: default_day(),
            is_time_paused: false,
        }
    }
}

/// Core game state for one playthrough.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreGameStore {
    #[serde(default)]
    pub player: PlayerStats,
    #[serde(default)]
    pub character: CharacterProfile,
    #[serde(default)]
    pub skills: SkillLedger,
    #[serde(default)]
    pub world: WorldClock,
}

impl CoreGameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to a resource, starting from zero. Returns the new amount.
    pub fn apply_resource_delta(&mut self, key: impl Into<String>, delta: f64) -> f64 {
        let key = key.into();
        let amount = self.player.resources.entry(key.clone()).or_insert(0.0);
        *amount += delta;
        debug!(resource = %key, delta, amount = *amount, "Resource changed");
        *amount
    }

    pub fn resource(&self, key: &str) -> f64 {
        self.player.resources.get(key).copied().unwrap_or(0.0)
    }

    /// Award skill experience. Returns the skill's new total.
    pub fn grant_skill_xp(&mut self, skill: impl Into<String>, amount: u64) -> u64 {
        let xp = self.skills.experience.entry(skill.into()).or_insert(0);
        *xp = xp.saturating_add(amount);
        self.skills.total_experience = self.skills.total_experience.saturating_add(amount);
        self.player.experience = self.player.experience.saturating_add(amount);
        *xp
    }

    pub fn skill_xp(&self, skill: &str) -> u64 {
        self.skills.experience.get(skill).copied().unwrap_or(0)
    }

    /// Move to the next day unless time is paused. Returns the current day.
    pub fn advance_day(&mut self) -> u32 {
        if !self.world.is_time_paused {
            self.world.day = self.world.day.saturating_add(1);
        }
        self.world.day
    }

    pub fn day(&self) -> u32 {
        self.world.day
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl PersistedStore for CoreGameStore {
    const VERSION: u32 = 1;

    fn upgrade_legacy(state: &mut Value) {
        if let Some(resources) = state.pointer_mut("/player/resources") {
            pairs_to_object(resources);
        }
        if let Some(experience) = state.pointer_mut("/skills/experience") {
            pairs_to_object(experience);
        }
    }
}
