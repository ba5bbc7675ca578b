//! Story arc records.

use crate::flags::FlagValue;
use crate::ids::{ArcId, StoryletId};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named narrative thread with progress and completion state.
///
/// Invariants maintained by every mutation in this crate:
/// `progress` is within `[0, 1]`, `is_completed` implies `progress == 1.0`,
/// and `metadata.completed_storylets <= metadata.total_storylets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryArc {
    pub id: ArcId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub current_storylet: Option<StoryletId>,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub metadata: ArcMetadata,
}

/// Bookkeeping about an arc's storylets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArcMetadata {
    #[serde(default)]
    pub total_storylets: u32,
    #[serde(default)]
    pub completed_storylets: u32,
    /// Every storylet assigned to the arc, in assignment order.
    #[serde(default)]
    pub available_storylets: Vec<StoryletId>,
    #[serde(default)]
    pub entry_points: Vec<StoryletId>,
    #[serde(default)]
    pub dead_ends: Vec<StoryletId>,
    #[serde(default)]
    pub last_accessed: Timestamp,
    #[serde(default)]
    pub created_at: Timestamp,
}

/// Input for creating an arc.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArc {
    pub name: String,
    pub description: String,
    pub progress: f64,
    pub is_completed: bool,
    pub failures: u32,
}

impl NewArc {
    /// An unstarted arc with no progress.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            progress: 0.0,
            is_completed: false,
            failures: 0,
        }
    }

    /// Start with some progress already made.
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }

    /// Create the arc already completed.
    pub fn completed(mut self) -> Self {
        self.is_completed = true;
        self
    }

    /// Carry over a failure count.
    pub fn with_failures(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }
}

impl StoryArc {
    /// Build a fresh arc from creation input.
    pub fn new(id: ArcId, input: NewArc, now: Timestamp) -> Self {
        let mut arc = Self {
            id,
            name: input.name,
            description: input.description,
            progress: clamp_progress(input.progress),
            is_completed: input.is_completed,
            current_storylet: None,
            started_at: None,
            completed_at: None,
            failures: input.failures,
            metadata: ArcMetadata {
                last_accessed: now,
                created_at: now,
                ..ArcMetadata::default()
            },
        };
        if arc.is_completed {
            arc.progress = 1.0;
            arc.completed_at = Some(now);
        }
        arc
    }

    /// Whether the arc has been started.
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Mark the arc as accessed.
    pub fn touch(&mut self, now: Timestamp) {
        self.metadata.last_accessed = now;
    }

    /// Mark the arc completed.
    pub fn complete(&mut self, now: Timestamp) {
        self.is_completed = true;
        self.completed_at = Some(now);
        self.progress = 1.0;
        self.touch(now);
    }

    /// Re-establish the arc invariants after a field-level change.
    pub(crate) fn normalize(&mut self) {
        self.progress = clamp_progress(self.progress);
        if self.is_completed {
            self.progress = 1.0;
        }
        let meta = &mut self.metadata;
        meta.total_storylets = meta.total_storylets.max(meta.available_storylets.len() as u32);
        meta.completed_storylets = meta.completed_storylets.min(meta.total_storylets);
    }
}

fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

/// A partial update to an arc. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArcUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub progress: Option<f64>,
    pub is_completed: Option<bool>,
    /// `Some(None)` clears the current storylet.
    pub current_storylet: Option<Option<StoryletId>>,
    pub started_at: Option<Option<Timestamp>>,
    pub completed_at: Option<Option<Timestamp>>,
    pub failures: Option<u32>,
}

impl ArcUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn completed(mut self, is_completed: bool) -> Self {
        self.is_completed = Some(is_completed);
        self
    }

    pub fn current_storylet(mut self, storylet: Option<StoryletId>) -> Self {
        self.current_storylet = Some(storylet);
        self
    }

    pub fn failures(mut self, failures: u32) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Shallow-merge into an arc and refresh its access time.
    pub fn apply(self, arc: &mut StoryArc, now: Timestamp) {
        if let Some(name) = self.name {
            arc.name = name;
        }
        if let Some(description) = self.description {
            arc.description = description;
        }
        if let Some(progress) = self.progress {
            arc.progress = progress;
        }
        if let Some(is_completed) = self.is_completed {
            if is_completed && !arc.is_completed && arc.completed_at.is_none() {
                arc.completed_at = Some(now);
            }
            arc.is_completed = is_completed;
        }
        if let Some(current) = self.current_storylet {
            arc.current_storylet = current;
        }
        if let Some(started_at) = self.started_at {
            arc.started_at = started_at;
        }
        if let Some(completed_at) = self.completed_at {
            arc.completed_at = completed_at;
        }
        if let Some(failures) = self.failures {
            arc.failures = failures;
        }
        arc.normalize();
        arc.touch(now);
    }
}

/// Per-arc storylet traversal state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArcProgress {
    #[serde(default)]
    pub current_storylet_id: Option<StoryletId>,
    #[serde(default)]
    pub completed_storylets: Vec<StoryletId>,
    #[serde(default)]
    pub available_storylets: Vec<StoryletId>,
    #[serde(default)]
    pub flags: BTreeMap<String, FlagValue>,
    #[serde(default)]
    pub failures: Vec<ArcFailure>,
}

/// A recorded failure within an arc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcFailure {
    /// The storylet the arc was on when it failed.
    pub storylet_id: Option<StoryletId>,
    pub timestamp: Timestamp,
    pub reason: String,
}
