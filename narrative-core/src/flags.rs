//! Namespaced narrative flags.
//!
//! Flags used to live in four separate stores that evolved independently,
//! which let the same key mean different things depending on who wrote it.
//! They are now held together but in disjoint namespaces: a key set in one
//! namespace is never visible from another.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A flag value.
///
/// Serialized untagged, so persisted flags are plain JSON scalars and arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<FlagValue>),
}

impl FlagValue {
    /// The boolean value, if this is a boolean flag.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The numeric value, if this is a number flag.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FlagValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The text value, if this is a text flag.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Loose truthiness used by storylet gating: `false`, `0`, `""` and `[]`
    /// are falsy, everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            FlagValue::Bool(b) => *b,
            FlagValue::Number(n) => *n != 0.0 && !n.is_nan(),
            FlagValue::Text(s) => !s.is_empty(),
            FlagValue::List(items) => !items.is_empty(),
        }
    }
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        FlagValue::Bool(value)
    }
}

impl From<f64> for FlagValue {
    fn from(value: f64) -> Self {
        FlagValue::Number(value)
    }
}

impl From<i32> for FlagValue {
    fn from(value: i32) -> Self {
        FlagValue::Number(value as f64)
    }
}

impl From<i64> for FlagValue {
    fn from(value: i64) -> Self {
        FlagValue::Number(value as f64)
    }
}

impl From<u64> for FlagValue {
    fn from(value: u64) -> Self {
        FlagValue::Number(value as f64)
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::Text(value.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        FlagValue::Text(value)
    }
}

impl From<Vec<FlagValue>> for FlagValue {
    fn from(value: Vec<FlagValue>) -> Self {
        FlagValue::List(value)
    }
}

/// Which subsystem a flag belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagNamespace {
    /// Flags set by storylet choice effects.
    Storylet,
    /// Flags derived from storylet availability rules.
    StoryletFlag,
    /// Flags tracking character concerns.
    Concerns,
    /// Flags set by story arc transitions.
    StoryArc,
}

impl FlagNamespace {
    /// All namespaces, in storage order.
    pub const ALL: [FlagNamespace; 4] = [
        FlagNamespace::Storylet,
        FlagNamespace::StoryletFlag,
        FlagNamespace::Concerns,
        FlagNamespace::StoryArc,
    ];

    /// The field name this namespace is persisted under.
    pub fn name(&self) -> &'static str {
        match self {
            FlagNamespace::Storylet => "storylet",
            FlagNamespace::StoryletFlag => "storylet_flag",
            FlagNamespace::Concerns => "concerns",
            FlagNamespace::StoryArc => "story_arc",
        }
    }
}

impl fmt::Display for FlagNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The four flag namespaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default)]
    storylet: BTreeMap<String, FlagValue>,
    #[serde(default)]
    storylet_flag: BTreeMap<String, FlagValue>,
    #[serde(default)]
    concerns: BTreeMap<String, FlagValue>,
    #[serde(default)]
    story_arc: BTreeMap<String, FlagValue>,
}

impl Flags {
    /// Create an empty flag set.
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, namespace: FlagNamespace) -> &BTreeMap<String, FlagValue> {
        match namespace {
            FlagNamespace::Storylet => &self.storylet,
            FlagNamespace::StoryletFlag => &self.storylet_flag,
            FlagNamespace::Concerns => &self.concerns,
            FlagNamespace::StoryArc => &self.story_arc,
        }
    }

    fn map_mut(&mut self, namespace: FlagNamespace) -> &mut BTreeMap<String, FlagValue> {
        match namespace {
            FlagNamespace::Storylet => &mut self.storylet,
            FlagNamespace::StoryletFlag => &mut self.storylet_flag,
            FlagNamespace::Concerns => &mut self.concerns,
            FlagNamespace::StoryArc => &mut self.story_arc,
        }
    }

    /// Set a flag, returning the value it replaced.
    pub fn set(
        &mut self,
        namespace: FlagNamespace,
        key: impl Into<String>,
        value: impl Into<FlagValue>,
    ) -> Option<FlagValue> {
        self.map_mut(namespace).insert(key.into(), value.into())
    }

    /// Get a flag.
    pub fn get(&self, namespace: FlagNamespace, key: &str) -> Option<&FlagValue> {
        self.map(namespace).get(key)
    }

    /// Remove a flag, returning its value.
    pub fn remove(&mut self, namespace: FlagNamespace, key: &str) -> Option<FlagValue> {
        self.map_mut(namespace).remove(key)
    }

    /// Whether a flag is set and truthy.
    pub fn is_set(&self, namespace: FlagNamespace, key: &str) -> bool {
        self.get(namespace, key).is_some_and(FlagValue::is_truthy)
    }

    /// All flags in one namespace.
    pub fn namespace(&self, namespace: FlagNamespace) -> &BTreeMap<String, FlagValue> {
        self.map(namespace)
    }

    /// Remove every flag in one namespace.
    pub fn clear_namespace(&mut self, namespace: FlagNamespace) {
        self.map_mut(namespace).clear();
    }

    /// Total number of flags across all namespaces.
    pub fn len(&self) -> usize {
        FlagNamespace::ALL.iter().map(|ns| self.map(*ns).len()).sum()
    }

    /// Whether no flags are set in any namespace.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
