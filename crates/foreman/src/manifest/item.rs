//! K8s-style object descriptions as produced by the templater.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const KIND_STATEFUL_SET: &str = "StatefulSet";
pub const KIND_DEPLOYMENT: &str = "Deployment";
pub const KIND_HPA: &str = "HorizontalPodAutoscaler";

/// Label carrying the application-level name of a workload.
pub const NAME_LABEL: &str = "app.kubernetes.io/name";

/// Label carrying the concrete (possibly rotated) name of a workload.
pub const REAL_NAME_LABEL: &str = "app.kubernetes.io/realname";

/// An ordered list of objects. Order carries no meaning but is kept stable.
pub type Manifest = Vec<ManifestItem>;

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Metadata for an object, following K8s conventions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub annotations: BTreeMap<String, String>,

    /// Metadata fields the operator does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single cluster object. Identity for matching is `(kind, metadata.name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    pub kind: String,

    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub spec: Value,

    /// Top-level fields other than the ones above (`data`, `rules`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ManifestItem {
    /// Creates an item with just a kind, a name and a spec.
    pub fn new(kind: impl Into<String>, name: impl Into<String>, spec: Value) -> Self {
        Self {
            api_version: None,
            kind: kind.into(),
            metadata: ObjectMeta {
                name: name.into(),
                ..ObjectMeta::default()
            },
            spec,
            extra: Map::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Returns true if both items describe the same `(kind, name)`.
    pub fn same_identity(&self, other: &ManifestItem) -> bool {
        self.kind == other.kind && self.metadata.name == other.metadata.name
    }

    /// The `"kind-name"` key used by the change set.
    pub fn change_key(&self) -> String {
        change_key(&self.kind, &self.metadata.name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(String::as_str)
    }

    /// `spec.replicas`, if set to a non-negative integer.
    pub fn replicas(&self) -> Option<u64> {
        self.spec.get("replicas").and_then(Value::as_u64)
    }

    /// Images of every container in the pod template.
    pub fn container_images(&self) -> Vec<&str> {
        self.spec
            .pointer("/template/spec/containers")
            .and_then(Value::as_array)
            .map(|containers| {
                containers
                    .iter()
                    .filter_map(|c| c.get("image").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `spec.scaleTargetRef` as `(kind, name)`, for autoscalers.
    pub fn scale_target(&self) -> Option<(&str, &str)> {
        let target = self.spec.get("scaleTargetRef")?;
        let kind = target.get("kind").and_then(Value::as_str)?;
        let name = target.get("name").and_then(Value::as_str)?;
        Some((kind, name))
    }
}

/// Builds the change-set key for an object.
pub fn change_key(kind: &str, name: &str) -> String {
    format!("{}-{}", kind, name)
}

/// Finds the item matching `(kind, name)`.
pub fn find<'a>(manifest: &'a [ManifestItem], kind: &str, name: &str) -> Option<&'a ManifestItem> {
    manifest
        .iter()
        .find(|item| item.kind == kind && item.metadata.name == name)
}

/// Returns the object at `path` inside `value`, creating empty objects along
/// the way. Non-object values on the path are replaced.
pub(crate) fn object_at<'a>(value: &'a mut Value, path: &[&str]) -> &'a mut Map<String, Value> {
    let mut current = value;
    for segment in path {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => unreachable!("value was just replaced with an object"),
        };
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}
