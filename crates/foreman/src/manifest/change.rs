use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::item::ManifestItem;

/// Per-rollout record of which objects need to be (re)applied.
///
/// Keys are `"kind-name"`. Absent keys default to "apply".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    entries: BTreeMap<String, bool>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records whether the object under `key` changed.
    pub fn record(&mut self, key: impl Into<String>, changed: bool) {
        self.entries.insert(key.into(), changed);
    }

    /// Forces the object under `key` to be applied.
    pub fn mark_changed(&mut self, key: impl Into<String>) {
        self.record(key, true);
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        self.entries.get(key).copied()
    }

    /// Only an explicit `false` entry skips the apply.
    pub fn should_apply(&self, key: &str) -> bool {
        self.get(key) != Some(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An object slated for deletion once the new manifest is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovalEntry {
    pub kind: String,
    pub name: String,
    /// The last known description of the object, kept for rollback tooling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<ManifestItem>,
}

impl RemovalEntry {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, item: Option<ManifestItem>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            item,
        }
    }
}
