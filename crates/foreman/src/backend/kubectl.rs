//! `kubectl`-backed cluster gateway and ConfigMap release store.

use std::time::Duration;

use serde_json::{json, Map, Value};

use super::command::Invocation;
use super::{ClusterGateway, ReleaseStore, DEFAULT_POLL_INTERVAL};
use crate::error::{ForemanError, Result};
use crate::manifest::{self, Manifest, ManifestItem, KIND_STATEFUL_SET};

/// ConfigMap data key holding the encoded release.
pub const RELEASE_KEY: &str = "manifest";

fn release_config_map(name: &str) -> String {
    format!("{}-manifest", name)
}

/// Turns kubectl's "not found" failures into `ForemanError::NotFound`.
fn classify(err: ForemanError, what: impl FnOnce() -> String) -> ForemanError {
    match &err {
        ForemanError::Command { message, .. }
            if message.contains("NotFound") || message.contains("not found") =>
        {
            ForemanError::NotFound { what: what() }
        }
        _ => err,
    }
}

/// `min(readyReplicas, updatedReplicas)`. The API server omits either count
/// while it is zero.
fn current_ready(object: &Value) -> u64 {
    let count = |path: &str| object.pointer(path).and_then(Value::as_u64).unwrap_or(0);
    count("/status/readyReplicas").min(count("/status/updatedReplicas"))
}

pub struct KubectlGateway {
    kubectl: String,
    poll_interval: Duration,
}

impl KubectlGateway {
    pub fn new(kubectl: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn kubectl(&self) -> Invocation<'_> {
        Invocation::new(&self.kubectl)
    }

    /// PVCs created from the volume claim templates of StatefulSet `name`.
    fn claims_of(&self, namespace: &str, name: &str) -> Result<Vec<String>> {
        let Some(yaml) = self.get_object_yaml(namespace, KIND_STATEFUL_SET, name)? else {
            return Ok(Vec::new());
        };
        let sts: Value = serde_yaml::from_str(&yaml)?;
        let templates: Vec<String> = sts
            .pointer("/spec/volumeClaimTemplates")
            .and_then(Value::as_array)
            .map(|templates| {
                templates
                    .iter()
                    .filter_map(|t| t.pointer("/metadata/name").and_then(Value::as_str))
                    .map(|t| format!("{}-{}-", t, name))
                    .collect()
            })
            .unwrap_or_default();
        if templates.is_empty() {
            return Ok(Vec::new());
        }

        let claims = self.list_names(namespace, "pvc")?;
        Ok(claims
            .into_iter()
            .filter(|claim| templates.iter().any(|prefix| claim.starts_with(prefix)))
            .collect())
    }

    fn list_names(&self, namespace: &str, resource: &str) -> Result<Vec<String>> {
        let out = self
            .kubectl()
            .args(["get", resource, "-n", namespace, "-o", "name"])
            .run()?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.rsplit('/').next().unwrap_or(line).to_string())
            .collect())
    }

    fn delete_one(&self, namespace: &str, resource: &str) -> Result<()> {
        self.kubectl()
            .args(["delete", resource, "-n", namespace])
            .run()
            .map(|_| ())
            .map_err(|e| classify(e, || format!("{} in {}", resource, namespace)))
    }
}

impl ClusterGateway for KubectlGateway {
    fn apply(&self, namespace: &str, item: &ManifestItem) -> Result<()> {
        let yaml = serde_yaml::to_string(item)?;
        let out = self
            .kubectl()
            .args(["apply", "-n", namespace, "-f", "-"])
            .stdin(&yaml)
            .run()?;
        log::info!("{}", out.trim());
        Ok(())
    }

    /// StatefulSets take their PersistentVolumeClaims with them.
    fn delete(&self, namespace: &str, kind: &str, name: &str) -> Result<()> {
        let claims = if kind == KIND_STATEFUL_SET {
            self.claims_of(namespace, name)?
        } else {
            Vec::new()
        };
        self.delete_one(namespace, &format!("{}/{}", kind, name))?;
        for claim in claims {
            if let Err(e) = self.delete_one(namespace, &format!("pvc/{}", claim)) {
                log::warn!("failed to delete pvc/{} in {}: {}", claim, namespace, e);
            }
        }
        Ok(())
    }

    /// Ready pods that are also on the updated revision.
    fn ready_replicas(&self, namespace: &str, kind: &str, name: &str) -> Result<u64> {
        let resource = format!("{}/{}", kind, name);
        let out = self
            .kubectl()
            .args(["get", resource.as_str(), "-n", namespace, "-o", "json"])
            .run()?;
        let object: Value = serde_json::from_str(&out)?;
        Ok(current_ready(&object))
    }

    fn get_object_yaml(&self, namespace: &str, kind: &str, name: &str) -> Result<Option<String>> {
        let resource = format!("{}/{}", kind, name);
        match self
            .kubectl()
            .args(["get", resource.as_str(), "-n", namespace, "-o", "yaml"])
            .run()
        {
            Ok(yaml) => Ok(Some(yaml)),
            Err(e) => match classify(e, String::new) {
                ForemanError::NotFound { .. } => Ok(None),
                other => Err(other),
            },
        }
    }

    fn list_names_by_prefix(
        &self,
        namespace: &str,
        kind: &str,
        prefix: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .list_names(namespace, kind)?
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Keeps each release in ConfigMap `<name>-manifest` under key `manifest`.
pub struct ConfigMapReleaseStore {
    kubectl: String,
}

impl ConfigMapReleaseStore {
    pub fn new(kubectl: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
        }
    }

    /// The ConfigMap a release is stored in.
    pub fn config_map(namespace: &str, name: &str, manifest: &[ManifestItem]) -> Result<ManifestItem> {
        let mut item = ManifestItem::new("ConfigMap", release_config_map(name), Value::Null);
        item.api_version = Some("v1".to_string());
        item.metadata.namespace = Some(namespace.to_string());
        let mut data = Map::new();
        data.insert(RELEASE_KEY.to_string(), json!(manifest::encode_all(manifest)?));
        item.extra.insert("data".to_string(), Value::Object(data));
        Ok(item)
    }
}

impl ReleaseStore for ConfigMapReleaseStore {
    fn read(&self, namespace: &str, name: &str) -> Result<Manifest> {
        let resource = format!("cm/{}", release_config_map(name));
        let what = || format!("release {}/{}", namespace, name);
        let out = Invocation::new(&self.kubectl)
            .args(["get", resource.as_str(), "-n", namespace, "-o", "json"])
            .run()
            .map_err(|e| classify(e, what))?;
        let config_map: Value = serde_json::from_str(&out)?;
        let encoded = config_map
            .pointer(&format!("/data/{}", RELEASE_KEY))
            .and_then(Value::as_str)
            .ok_or_else(|| ForemanError::NotFound { what: what() })?;
        manifest::decode_all(encoded)
    }

    fn write(&self, namespace: &str, name: &str, manifest: &[ManifestItem]) -> Result<()> {
        let yaml = serde_yaml::to_string(&Self::config_map(namespace, name, manifest)?)?;
        Invocation::new(&self.kubectl)
            .args(["apply", "-n", namespace, "-f", "-"])
            .stdin(&yaml)
            .run()?;
        Ok(())
    }

    fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let resource = format!("cm/{}", release_config_map(name));
        Invocation::new(&self.kubectl)
            .args(["delete", resource.as_str(), "-n", namespace])
            .run()
            .map(|_| ())
            .map_err(|e| classify(e, || format!("release {}/{}", namespace, name)))
    }
}
