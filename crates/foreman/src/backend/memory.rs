//! In-process backends.
//!
//! They keep everything behind a mutex and count the calls the engine makes,
//! which is what the integration tests assert on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::{ClusterGateway, ReleaseStore, RemoteBundleStore, Templater};
use crate::error::{ForemanError, Result};
use crate::manifest::{self, Manifest, ManifestItem};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("memory backend lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

// ============================================================================
// Bundle store
// ============================================================================

#[derive(Default)]
struct BundleState {
    objects: BTreeMap<String, String>,
    assets: HashMap<(String, String), Vec<(String, String)>>,
    locks: HashMap<String, Instant>,
    lock_calls: usize,
    unlock_calls: usize,
    fetch_calls: usize,
}

#[derive(Default)]
pub struct MemoryBundleStore {
    state: Mutex<BundleState>,
}

impl MemoryBundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an asset bundle made of `(relative path, content)` files.
    pub fn add_asset(&self, asset_type: &str, release: &str, files: &[(&str, &str)]) {
        let files = files
            .iter()
            .map(|(name, content)| (name.to_string(), content.to_string()))
            .collect();
        locked(&self.state)
            .assets
            .insert((asset_type.to_string(), release.to_string()), files);
    }

    pub fn put_object(&self, path: &str, content: &str) {
        locked(&self.state)
            .objects
            .insert(path.to_string(), content.to_string());
    }

    pub fn object(&self, path: &str) -> Option<String> {
        locked(&self.state).objects.get(path).cloned()
    }

    /// Takes `key` on behalf of another owner.
    pub fn hold_lock(&self, key: &str, ttl: Duration) {
        locked(&self.state)
            .locks
            .insert(key.to_string(), Instant::now() + ttl);
    }

    pub fn is_locked(&self, key: &str) -> bool {
        locked(&self.state)
            .locks
            .get(key)
            .is_some_and(|expiry| *expiry > Instant::now())
    }

    pub fn lock_calls(&self) -> usize {
        locked(&self.state).lock_calls
    }

    pub fn unlock_calls(&self) -> usize {
        locked(&self.state).unlock_calls
    }

    pub fn fetch_calls(&self) -> usize {
        locked(&self.state).fetch_calls
    }
}

impl RemoteBundleStore for MemoryBundleStore {
    fn fetch(&self, asset_type: &str, release: &str, dest: &Path) -> Result<()> {
        let files = {
            let mut state = locked(&self.state);
            state.fetch_calls += 1;
            state
                .assets
                .get(&(asset_type.to_string(), release.to_string()))
                .cloned()
                .ok_or_else(|| ForemanError::NotFound {
                    what: format!("asset {}/{}", asset_type, release),
                })?
        };
        for (name, content) in files {
            let path = dest.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| ForemanError::io(parent, e))?;
            }
            fs::write(&path, content).map_err(|e| ForemanError::io(&path, e))?;
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(locked(&self.state).objects.contains_key(path))
    }

    fn lock(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut state = locked(&self.state);
        state.lock_calls += 1;
        let now = Instant::now();
        if state.locks.get(key).is_some_and(|expiry| *expiry > now) {
            return Err(ForemanError::LockContention {
                key: key.to_string(),
            });
        }
        state.locks.insert(key.to_string(), now + ttl);
        Ok(())
    }

    fn unlock(&self, key: &str) -> Result<()> {
        let mut state = locked(&self.state);
        state.unlock_calls += 1;
        state.locks.remove(key);
        Ok(())
    }

    fn read(&self, path: &str) -> Result<String> {
        self.object(path).ok_or_else(|| ForemanError::NotFound {
            what: path.to_string(),
        })
    }

    fn upload(&self, local: &Path, path: &str) -> Result<()> {
        let content = fs::read_to_string(local).map_err(|e| ForemanError::io(local, e))?;
        self.put_object(path, &content);
        fs::remove_file(local).map_err(|e| ForemanError::io(local, e))?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        match locked(&self.state).objects.remove(path) {
            Some(_) => Ok(()),
            None => Err(ForemanError::NotFound {
                what: path.to_string(),
            }),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{}/", prefix)
        };
        Ok(locked(&self.state)
            .objects
            .keys()
            .filter(|key| {
                key.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .cloned()
            .collect())
    }
}

// ============================================================================
// Cluster
// ============================================================================

type ObjectKey = (String, String, String);

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<ObjectKey, ManifestItem>,
    applied: Vec<String>,
    deleted: Vec<String>,
    failing_deletes: HashSet<String>,
    ready: HashMap<String, u64>,
}

/// A cluster that applies instantly and reports `spec.replicas` as ready.
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
    poll_interval: Duration,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            poll_interval: Duration::from_millis(1),
        }
    }
}

fn object_key(namespace: &str, kind: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), kind.to_string(), name.to_string())
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a live object without recording an apply.
    pub fn insert(&self, namespace: &str, item: ManifestItem) {
        let key = object_key(namespace, &item.kind, item.name());
        locked(&self.state).objects.insert(key, item);
    }

    pub fn object(&self, namespace: &str, kind: &str, name: &str) -> Option<ManifestItem> {
        locked(&self.state)
            .objects
            .get(&object_key(namespace, kind, name))
            .cloned()
    }

    pub fn contains(&self, namespace: &str, kind: &str, name: &str) -> bool {
        self.object(namespace, kind, name).is_some()
    }

    /// Names of every live `kind` object in `namespace`.
    pub fn names(&self, namespace: &str, kind: &str) -> Vec<String> {
        locked(&self.state)
            .objects
            .keys()
            .filter(|(ns, k, _)| ns == namespace && k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// `kind/name` of every apply, in order.
    pub fn applied(&self) -> Vec<String> {
        locked(&self.state).applied.clone()
    }

    /// `kind/name` of every successful delete, in order.
    pub fn deleted(&self) -> Vec<String> {
        locked(&self.state).deleted.clone()
    }

    /// Makes every delete of `kind/name` fail.
    pub fn fail_delete(&self, kind: &str, name: &str) {
        locked(&self.state)
            .failing_deletes
            .insert(format!("{}/{}", kind, name));
    }

    /// Overrides the ready count reported for `kind/name`.
    pub fn set_ready(&self, kind: &str, name: &str, ready: u64) {
        locked(&self.state)
            .ready
            .insert(format!("{}/{}", kind, name), ready);
    }
}

impl ClusterGateway for MemoryCluster {
    fn apply(&self, namespace: &str, item: &ManifestItem) -> Result<()> {
        let mut state = locked(&self.state);
        state.applied.push(format!("{}/{}", item.kind, item.name()));
        state
            .objects
            .insert(object_key(namespace, &item.kind, item.name()), item.clone());
        Ok(())
    }

    fn delete(&self, namespace: &str, kind: &str, name: &str) -> Result<()> {
        let mut state = locked(&self.state);
        let id = format!("{}/{}", kind, name);
        if state.failing_deletes.contains(&id) {
            return Err(ForemanError::Cluster(format!("refusing to delete {}", id)));
        }
        match state.objects.remove(&object_key(namespace, kind, name)) {
            Some(_) => {
                state.deleted.push(id);
                Ok(())
            }
            None => Err(ForemanError::NotFound {
                what: format!("{} in {}", id, namespace),
            }),
        }
    }

    fn ready_replicas(&self, namespace: &str, kind: &str, name: &str) -> Result<u64> {
        let state = locked(&self.state);
        if let Some(ready) = state.ready.get(&format!("{}/{}", kind, name)) {
            return Ok(*ready);
        }
        Ok(state
            .objects
            .get(&object_key(namespace, kind, name))
            .map(|item| item.replicas().unwrap_or(1))
            .unwrap_or(0))
    }

    fn get_object_yaml(&self, namespace: &str, kind: &str, name: &str) -> Result<Option<String>> {
        self.object(namespace, kind, name)
            .map(|item| serde_yaml::to_string(&item).map_err(ForemanError::from))
            .transpose()
    }

    fn list_names_by_prefix(
        &self,
        namespace: &str,
        kind: &str,
        prefix: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .names(namespace, kind)
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

// ============================================================================
// Release store
// ============================================================================

/// Keeps releases as encoded YAML so reads exercise the codec.
#[derive(Default)]
pub struct MemoryReleaseStore {
    releases: Mutex<HashMap<(String, String), String>>,
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self, namespace: &str, name: &str) -> Option<String> {
        locked(&self.releases)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.raw(namespace, name).is_some()
    }
}

impl ReleaseStore for MemoryReleaseStore {
    fn read(&self, namespace: &str, name: &str) -> Result<Manifest> {
        let raw = self
            .raw(namespace, name)
            .ok_or_else(|| ForemanError::NotFound {
                what: format!("release {}/{}", namespace, name),
            })?;
        manifest::decode_all(&raw)
    }

    fn write(&self, namespace: &str, name: &str, manifest: &[ManifestItem]) -> Result<()> {
        let encoded = manifest::encode_all(manifest)?;
        locked(&self.releases).insert((namespace.to_string(), name.to_string()), encoded);
        Ok(())
    }

    fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match locked(&self.releases).remove(&(namespace.to_string(), name.to_string())) {
            Some(_) => Ok(()),
            None => Err(ForemanError::NotFound {
                what: format!("release {}/{}", namespace, name),
            }),
        }
    }
}

// ============================================================================
// Templater
// ============================================================================

/// Renders a fixed manifest regardless of the chart, recording the values.
#[derive(Default)]
pub struct StaticTemplater {
    manifest: Mutex<Manifest>,
    rendered: Mutex<Vec<Value>>,
}

impl StaticTemplater {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest: Mutex::new(manifest),
            rendered: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the manifest returned by later renders.
    pub fn set(&self, manifest: Manifest) {
        *locked(&self.manifest) = manifest;
    }

    /// Values passed to every render so far.
    pub fn rendered_values(&self) -> Vec<Value> {
        locked(&self.rendered).clone()
    }
}

impl Templater for StaticTemplater {
    fn render(&self, _chart: &Path, values: &Value) -> Result<Manifest> {
        locked(&self.rendered).push(values.clone());
        Ok(locked(&self.manifest).clone())
    }
}
