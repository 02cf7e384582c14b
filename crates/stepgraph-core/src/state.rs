use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NodeError, Result, StepgraphError};

/// Immutable state snapshot threaded through a run.
///
/// Every merge produces a new snapshot with a bumped `version`; earlier
/// snapshots stay valid and can be retained for debugging or replay. Cloning
/// a `State` is a pointer copy.
#[derive(Debug, Clone, Default)]
pub struct State {
    data: Arc<BTreeMap<String, Value>>,
    version: u64,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a snapshot from initial data (version 0).
    pub fn from_map<I>(data: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Self {
            data: Arc::new(data.into_iter().collect()),
            version: 0,
        }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Get a value as a bool, if it's a bool.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(|v| v.as_bool())
    }

    /// Read a field the calling node cannot proceed without.
    ///
    /// A missing key is a fatal node error rather than a silent default.
    pub fn require(&self, key: &str) -> std::result::Result<&Value, NodeError> {
        self.data
            .get(key)
            .ok_or_else(|| NodeError::fatal(format!("missing required state field '{}'", key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of merges applied since the run was seeded.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    /// True if both handles point at the same snapshot.
    pub fn ptr_eq(&self, other: &State) -> bool {
        Arc::ptr_eq(&self.data, &other.data) && self.version == other.version
    }

    /// Shallow-merge a partial update into a new snapshot.
    ///
    /// Fields absent from `update` are carried forward unchanged; `self` is
    /// left untouched.
    pub fn merge(&self, update: &StateUpdate) -> State {
        let mut data = (*self.data).clone();
        for (k, v) in update.iter() {
            data.insert(k.clone(), v.clone());
        }
        State {
            data: Arc::new(data),
            version: self.version + 1,
        }
    }

    /// Merge updates from parallel branches in declaration order.
    ///
    /// Two branches writing different values to the same field is a
    /// `MergeConflict`; identical writes are accepted.
    pub fn merge_branches(&self, branches: &[(String, StateUpdate)]) -> Result<State> {
        let mut combined = StateUpdate::new();
        let mut writers: BTreeMap<&str, &str> = BTreeMap::new();

        for (branch, update) in branches {
            for (key, value) in update.iter() {
                if let Some(previous) = writers.get(key.as_str()) {
                    if combined.get(key) != Some(value) {
                        return Err(StepgraphError::MergeConflict {
                            field: key.clone(),
                            branches: vec![previous.to_string(), branch.clone()],
                        });
                    }
                    continue;
                }
                writers.insert(key.as_str(), branch.as_str());
                combined.set(key.clone(), value.clone());
            }
        }

        Ok(self.merge(&combined))
    }
}

impl Serialize for State {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for State {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let data = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Ok(State::from_map(data))
    }
}

/// Partial update returned by a node: only the fields it changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateUpdate {
    fields: serde_json::Map<String, Value>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), Value::String(value.into()));
    }

    /// Builder-style `set`.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }
}

impl From<serde_json::Map<String, Value>> for StateUpdate {
    fn from(fields: serde_json::Map<String, Value>) -> Self {
        Self { fields }
    }
}
