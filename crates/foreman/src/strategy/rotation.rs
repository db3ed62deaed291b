//! StatefulSet rotation: eligibility, change classification, rotation groups
//! and the renames that follow from them.
//!
//! A rotation group is the family `base`, `base---0`, `base---1`, ... of
//! concrete StatefulSets sharing one base name. The newest instance is the
//! one dependents point at.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::backend::ClusterGateway;
use crate::error::Result;
use crate::manifest::{
    self, item::object_at, ChangeSet, Manifest, ManifestItem, KIND_HPA, KIND_STATEFUL_SET,
    REAL_NAME_LABEL,
};

/// `enabled` or `disabled`; overrides the image-based default.
pub const ROTATION_ANNOTATION: &str = "foreman/rotation";
pub const ROTATION_SEPARATOR: &str = "---";

const ROTATION_ENABLED: &str = "enabled";

/// Top-level spec keys that can change in place when replicas > 1.
const IN_PLACE_SPEC_KEYS: [&str; 3] = ["template", "replicas", "updateStrategy"];

/// Images whose data must never be moved to a fresh identity implicitly.
static ROTATION_DENYLIST: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"^(docker\.io/)*redis").unwrap(),
        Regex::new(r"^(docker\.io/)*postgres").unwrap(),
    ]
});

pub fn is_denylisted_image(image: &str) -> bool {
    ROTATION_DENYLIST.iter().any(|re| re.is_match(image))
}

/// Whether a StatefulSet may be rotated. Other kinds never are.
pub fn is_rotation_eligible(item: &ManifestItem) -> bool {
    if !item.is_kind(KIND_STATEFUL_SET) {
        return false;
    }
    match item.annotation(ROTATION_ANNOTATION) {
        Some(flag) if !flag.is_empty() => flag == ROTATION_ENABLED,
        _ => !item
            .container_images()
            .into_iter()
            .any(is_denylisted_image),
    }
}

/// Whether `diff` (old vs. new StatefulSet) can only be applied by rotating.
///
/// `item` is the previously applied StatefulSet.
pub fn requires_rotation(diff: Option<&Value>, item: &ManifestItem) -> bool {
    let Some(spec_diff) = diff.and_then(|d| d.get("spec")).and_then(Value::as_object) else {
        return false;
    };
    if spec_diff.is_empty() || !is_rotation_eligible(item) {
        return false;
    }

    if item.replicas() == Some(1) {
        return !(spec_diff.len() == 1 && spec_diff.contains_key("replicas"));
    }
    if spec_diff
        .keys()
        .any(|key| !IN_PLACE_SPEC_KEYS.contains(&key.as_str()))
    {
        return true;
    }
    diff.and_then(|d| d.pointer("/spec/template/metadata/labels"))
        .is_some()
}

/// Splits `base---N` into `(base, Some(N))`; other names yield `(name, None)`.
pub fn split_rotation(name: &str) -> (&str, Option<u64>) {
    if let Some((base, suffix)) = name.rsplit_once(ROTATION_SEPARATOR) {
        if !base.is_empty() && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = suffix.parse() {
                return (base, Some(n));
            }
        }
    }
    (name, None)
}

pub fn qualified_name(base: &str, rotation: u64) -> String {
    format!("{}{}{}", base, ROTATION_SEPARATOR, rotation)
}

/// Renames a StatefulSet to a concrete instance name, rewriting its identity
/// labels and collapsing topology spread selectors onto the identity label.
pub fn rename_instance(mut item: ManifestItem, name: &str) -> ManifestItem {
    item.metadata.name = name.to_string();
    item.metadata
        .labels
        .insert(REAL_NAME_LABEL.to_string(), name.to_string());
    object_at(&mut item.spec, &["template", "metadata", "labels"])
        .insert(REAL_NAME_LABEL.to_string(), json!(name));

    if let Some(constraints) = item
        .spec
        .pointer_mut("/template/spec/topologySpreadConstraints")
        .and_then(Value::as_array_mut)
    {
        for constraint in constraints {
            if let Some(Value::Object(selector)) = constraint.get_mut("labelSelector") {
                if selector.contains_key("matchLabels") {
                    selector.insert("matchLabels".to_string(), json!({ REAL_NAME_LABEL: name }));
                }
            }
        }
    }
    item
}

/// One live member of a rotation group.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationInstance {
    pub name: String,
    /// `None` for the unqualified base name.
    pub rotation: Option<u64>,
    /// The live object, when it could be read.
    pub item: Option<ManifestItem>,
}

/// Live state of a StatefulSet rotation group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RotationGroup {
    pub base: String,
    /// Ordered oldest first: the unqualified base, then by rotation number.
    pub instances: Vec<RotationInstance>,
    /// Largest rotation number in use, 0 when none.
    pub rotation: u64,
    /// Whether at least one qualified instance exists.
    pub exists: bool,
}

impl RotationGroup {
    /// Builds a group from candidate names; names outside the group are
    /// ignored.
    pub fn from_names<S: AsRef<str>>(base: &str, names: &[S]) -> Self {
        let mut members: Vec<(Option<u64>, String)> = names
            .iter()
            .map(AsRef::as_ref)
            .filter_map(|name| {
                if name == base {
                    return Some((None, name.to_string()));
                }
                match split_rotation(name) {
                    (b, Some(n)) if b == base => Some((Some(n), name.to_string())),
                    _ => None,
                }
            })
            .collect();
        members.sort();
        members.dedup();

        let rotation = members.iter().filter_map(|(n, _)| *n).max();
        Self {
            base: base.to_string(),
            instances: members
                .into_iter()
                .map(|(rotation, name)| RotationInstance {
                    name,
                    rotation,
                    item: None,
                })
                .collect(),
            rotation: rotation.unwrap_or(0),
            exists: rotation.is_some(),
        }
    }

    /// Reads the group of `base` from the cluster. Instance objects are read
    /// best-effort.
    pub fn read(cluster: &dyn ClusterGateway, namespace: &str, base: &str) -> Result<Self> {
        let names = cluster.list_names_by_prefix(namespace, KIND_STATEFUL_SET, base)?;
        let mut group = Self::from_names(base, &names);
        for instance in &mut group.instances {
            instance.item = match cluster.get_object_yaml(namespace, KIND_STATEFUL_SET, &instance.name) {
                Ok(Some(yaml)) => manifest::decode_item(&yaml)
                    .map_err(|e| tracing::warn!("failed to parse {}: {}", instance.name, e))
                    .ok(),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("failed to read {}: {}", instance.name, e);
                    None
                }
            };
        }
        tracing::debug!(
            "rotation group {}: rotation={} exists={} instances={:?}",
            base,
            group.rotation,
            group.exists,
            group.names()
        );
        Ok(group)
    }

    pub fn names(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.name.as_str()).collect()
    }

    pub fn newest(&self) -> Option<&RotationInstance> {
        self.instances.last()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Name of the instance currently backing traffic.
    pub fn current_name(&self) -> String {
        if self.exists {
            qualified_name(&self.base, self.rotation)
        } else {
            self.base.clone()
        }
    }

    /// Name the next rotation creates.
    pub fn next_name(&self) -> String {
        qualified_name(&self.base, self.rotation + 1)
    }
}

/// Points dependents at the concrete StatefulSet names.
///
/// A rotation-eligible StatefulSet without a rotation suffix becomes
/// `base---0`. Autoscalers targeting a StatefulSet are retargeted and always
/// marked changed, since their target may have moved.
pub fn resolve_dependents(manifest: Manifest, mut changes: ChangeSet) -> (Manifest, ChangeSet) {
    let mut real_names: HashMap<String, String> = HashMap::new();

    let manifest: Manifest = manifest
        .into_iter()
        .map(|item| {
            if !item.is_kind(KIND_STATEFUL_SET) {
                return item;
            }
            let (base, rotation) = split_rotation(item.name());
            let base = base.to_string();
            if rotation.is_none() && is_rotation_eligible(&item) {
                let name = qualified_name(&base, 0);
                real_names.insert(base, name.clone());
                rename_instance(item, &name)
            } else {
                real_names.insert(base, item.name().to_string());
                item
            }
        })
        .collect();

    let manifest = manifest
        .into_iter()
        .map(|mut item| {
            let target = item
                .scale_target()
                .filter(|(kind, _)| *kind == KIND_STATEFUL_SET)
                .map(|(_, name)| name.to_string());
            if let (true, Some(target)) = (item.is_kind(KIND_HPA), target) {
                changes.mark_changed(item.change_key());
                if let Some(real) = real_names.get(&target) {
                    object_at(&mut item.spec, &["scaleTargetRef"])
                        .insert("name".to_string(), json!(real));
                }
            }
            item
        })
        .collect();

    (manifest, changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sts(name: &str, image: &str, replicas: u64) -> ManifestItem {
        ManifestItem::new(
            KIND_STATEFUL_SET,
            name,
            json!({
                "replicas": replicas,
                "template": {
                    "metadata": {"labels": {"app.kubernetes.io/name": name}},
                    "spec": {"containers": [{"name": "main", "image": image}]}
                }
            }),
        )
    }

    fn annotated(mut item: ManifestItem, flag: &str) -> ManifestItem {
        item.metadata
            .annotations
            .insert(ROTATION_ANNOTATION.to_string(), flag.to_string());
        item
    }

    #[test]
    fn test_denylisted_images_are_not_eligible() {
        assert!(is_rotation_eligible(&sts("api", "myapp:1", 1)));
        assert!(!is_rotation_eligible(&sts("cache", "redis:7", 1)));
        assert!(!is_rotation_eligible(&sts("cache", "docker.io/redis:7", 1)));
        assert!(!is_rotation_eligible(&sts("db", "postgres:16", 1)));
        assert!(is_rotation_eligible(&sts("db", "ghcr.io/acme/postgres:16", 1)));
    }

    #[test]
    fn test_annotation_wins_over_image() {
        assert!(is_rotation_eligible(&annotated(sts("cache", "redis:7", 1), "enabled")));
        assert!(!is_rotation_eligible(&annotated(sts("api", "myapp:1", 1), "disabled")));
        let deploy = ManifestItem::new("Deployment", "web", json!({}));
        assert!(!is_rotation_eligible(&annotated(deploy, "enabled")));
    }

    #[test]
    fn test_single_replica_rotates_unless_only_replicas_changed() {
        let item = sts("api", "myapp:1", 1);
        assert!(!requires_rotation(None, &item));
        assert!(!requires_rotation(Some(&json!({"metadata": {"labels": {}}})), &item));
        assert!(!requires_rotation(Some(&json!({"spec": {"replicas": 2}})), &item));
        assert!(requires_rotation(
            Some(&json!({"spec": {"template": {"spec": {"containers": {"0": {"image": "myapp:2"}}}}}})),
            &item
        ));
    }

    #[test]
    fn test_multi_replica_rotates_on_structural_changes() {
        let item = sts("api", "myapp:1", 3);
        let image_only = json!({"spec": {"template": {"spec": {"containers": {"0": {"image": "x"}}}}}});
        assert!(!requires_rotation(Some(&image_only), &item));
        assert!(!requires_rotation(Some(&json!({"spec": {"updateStrategy": {"type": "OnDelete"}}})), &item));
        assert!(requires_rotation(Some(&json!({"spec": {"volumeClaimTemplates": {}}})), &item));
        assert!(requires_rotation(
            Some(&json!({"spec": {"template": {"metadata": {"labels": {"tier": "db"}}}}})),
            &item
        ));
        assert!(!requires_rotation(
            Some(&json!({"spec": {"volumeClaimTemplates": {}}})),
            &sts("db", "postgres:16", 3)
        ));
    }

    #[test]
    fn test_split_rotation() {
        assert_eq!(split_rotation("db---12"), ("db", Some(12)));
        assert_eq!(split_rotation("db"), ("db", None));
        assert_eq!(split_rotation("db---x"), ("db---x", None));
        assert_eq!(split_rotation("---3"), ("---3", None));
        assert_eq!(split_rotation("a---b---2"), ("a---b", Some(2)));
    }

    #[test]
    fn test_group_orders_numerically() {
        let names = ["db---10", "db---9", "db", "dbx---1", "db---2", "db-other"];
        let group = RotationGroup::from_names("db", &names);
        assert_eq!(group.names(), vec!["db", "db---2", "db---9", "db---10"]);
        assert_eq!(group.rotation, 10);
        assert!(group.exists);
        assert_eq!(group.current_name(), "db---10");
        assert_eq!(group.next_name(), "db---11");

        let legacy = RotationGroup::from_names("db", &["db"]);
        assert!(!legacy.exists);
        assert_eq!(legacy.rotation, 0);
        assert_eq!(legacy.current_name(), "db");
        assert_eq!(legacy.next_name(), "db---1");
    }

    #[test]
    fn test_rename_rewrites_identity_and_topology() {
        let mut item = sts("api", "myapp:1", 2);
        object_at(&mut item.spec, &["template", "spec"]).insert(
            "topologySpreadConstraints".to_string(),
            json!([
                {"maxSkew": 1, "labelSelector": {"matchLabels": {"app.kubernetes.io/name": "api"}}},
                {"maxSkew": 1}
            ]),
        );

        let renamed = rename_instance(item, "api---4");
        assert_eq!(renamed.name(), "api---4");
        assert_eq!(renamed.label(REAL_NAME_LABEL), Some("api---4"));
        assert_eq!(
            renamed.spec.pointer("/template/metadata/labels/app.kubernetes.io~1realname"),
            Some(&json!("api---4"))
        );
        assert_eq!(
            renamed.spec.pointer("/template/spec/topologySpreadConstraints/0/labelSelector/matchLabels"),
            Some(&json!({"app.kubernetes.io/realname": "api---4"}))
        );
        assert_eq!(
            renamed.spec.pointer("/template/spec/topologySpreadConstraints/1"),
            Some(&json!({"maxSkew": 1}))
        );
    }

    #[test]
    fn test_resolve_dependents_keeps_ineligible_names() {
        let hpa = ManifestItem::new(
            KIND_HPA,
            "cache",
            json!({"scaleTargetRef": {"kind": "StatefulSet", "name": "cache"}}),
        );
        let mut changes = ChangeSet::new();
        changes.record("HorizontalPodAutoscaler-cache", false);

        let (manifest, changes) =
            resolve_dependents(vec![sts("cache", "redis:7", 1), hpa], changes);
        assert_eq!(manifest[0].name(), "cache");
        assert_eq!(manifest[1].scale_target(), Some(("StatefulSet", "cache")));
        assert!(changes.should_apply("HorizontalPodAutoscaler-cache"));
    }
}
