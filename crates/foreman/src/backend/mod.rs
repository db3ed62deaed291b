//! Collaborator interfaces the rollout engine is written against, plus the
//! implementations shipped with the crate.
//!
//! - `memory` - in-process implementations for tests and dry tooling
//! - `local` - directory-backed bundle store with TTL lock files
//! - `kubectl` - cluster gateway and ConfigMap release store
//! - `helm` - chart templater
//! - `gsg` - object-store transport
//! - `schema` - JSON-schema validator

pub mod command;
pub mod gsg;
pub mod helm;
pub mod kubectl;
pub mod local;
pub mod memory;
pub mod schema;

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::config::{OperatorConfig, StoreKind};
use crate::error::{ForemanError, Result};
use crate::manifest::{Manifest, ManifestItem};
use crate::session::Deadline;

pub use gsg::{GsgBundleStore, LockCapability};
pub use helm::HelmTemplater;
pub use kubectl::{ConfigMapReleaseStore, KubectlGateway};
pub use local::LocalBundleStore;
pub use memory::{MemoryBundleStore, MemoryCluster, MemoryReleaseStore, StaticTemplater};
pub use schema::JsonSchemaValidator;

/// Interval between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Applies, deletes and reads cluster objects within a namespace.
pub trait ClusterGateway: Send + Sync {
    fn apply(&self, namespace: &str, item: &ManifestItem) -> Result<()>;

    fn delete(&self, namespace: &str, kind: &str, name: &str) -> Result<()>;

    /// Number of pods of the current revision of `kind/name` that are ready.
    fn ready_replicas(&self, namespace: &str, kind: &str, name: &str) -> Result<u64>;

    /// The live object as YAML, or `None` if it does not exist.
    fn get_object_yaml(&self, namespace: &str, kind: &str, name: &str) -> Result<Option<String>>;

    /// Names of every `kind` object whose name starts with `prefix`.
    fn list_names_by_prefix(&self, namespace: &str, kind: &str, prefix: &str)
        -> Result<Vec<String>>;

    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    /// Blocks until `target` replicas are ready, checking `deadline` before
    /// every poll.
    fn wait_ready(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        target: u64,
        deadline: &Deadline,
    ) -> Result<()> {
        let mut last_report = None;
        loop {
            deadline.check(|| format!("waiting for {}/{} to become ready", kind, name))?;
            let ready = self.ready_replicas(namespace, kind, name)?;
            if ready >= target {
                tracing::info!("{}/{} reached target ready: {}/{}", kind, name, ready, target);
                return Ok(());
            }
            if last_report != Some(ready) {
                last_report = Some(ready);
                tracing::info!("waiting for {}/{} ready: {}/{}", kind, name, ready, target);
            }
            thread::sleep(self.poll_interval());
        }
    }
}

/// Persists the last successfully applied manifest per `(namespace, name)`.
pub trait ReleaseStore: Send + Sync {
    /// Returns `ForemanError::NotFound` when no release exists.
    fn read(&self, namespace: &str, name: &str) -> Result<Manifest>;

    fn write(&self, namespace: &str, name: &str, manifest: &[ManifestItem]) -> Result<()>;

    fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// The object store holding asset bundles, resource specs and lock objects.
///
/// Paths are relative to the store root.
pub trait RemoteBundleStore: Send + Sync {
    /// Copies the `(asset_type, release)` bundle into `dest`.
    fn fetch(&self, asset_type: &str, release: &str, dest: &Path) -> Result<()>;

    fn exists(&self, path: &str) -> Result<bool>;

    /// Single attempt to take the lock `key`. Fails with
    /// `ForemanError::LockContention` if another owner holds an unexpired lock.
    fn lock(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Releases `key`. Releasing a missing lock is not an error.
    fn unlock(&self, key: &str) -> Result<()>;

    /// Reads an object; `ForemanError::NotFound` when absent.
    fn read(&self, path: &str) -> Result<String>;

    /// Moves a local file into place at `path`.
    fn upload(&self, local: &Path, path: &str) -> Result<()>;

    fn remove(&self, path: &str) -> Result<()>;

    /// Full paths of the objects directly below `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Turns chart values into a raw manifest.
pub trait Templater: Send + Sync {
    fn render(&self, chart: &Path, values: &Value) -> Result<Manifest>;
}

/// Validates values against a JSON schema, returning every violation.
pub trait Validator: Send + Sync {
    fn validate(&self, values: &Value, schema: &Value) -> Result<Vec<String>>;
}

/// The set of collaborators one session runs against.
#[derive(Clone)]
pub struct Backends {
    pub cluster: Arc<dyn ClusterGateway>,
    pub releases: Arc<dyn ReleaseStore>,
    pub bundles: Arc<dyn RemoteBundleStore>,
    pub templater: Arc<dyn Templater>,
    pub validator: Arc<dyn Validator>,
}

impl Backends {
    /// The process-backed collaborators: kubectl, helm, and the store that
    /// `basePath` selects.
    pub fn from_config(config: &OperatorConfig) -> Self {
        let bundles: Arc<dyn RemoteBundleStore> = match config.store_kind() {
            StoreKind::Gsg(base) => Arc::new(GsgBundleStore::new(config.gsg.as_str(), base)),
            StoreKind::Local(root) => Arc::new(LocalBundleStore::new(root)),
        };
        Self {
            cluster: Arc::new(
                KubectlGateway::new(config.kubectl.as_str())
                    .with_poll_interval(config.readiness_poll()),
            ),
            releases: Arc::new(ConfigMapReleaseStore::new(config.kubectl.as_str())),
            bundles,
            templater: Arc::new(HelmTemplater::new(config.helm.as_str())),
            validator: Arc::new(JsonSchemaValidator::new()),
        }
    }
}

/// Fails with `ForemanError::SchemaViolation` if `validator` reports anything.
pub fn ensure_valid(validator: &dyn Validator, values: &Value, schema: &Value) -> Result<()> {
    let violations = validator.validate(values, schema)?;
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ForemanError::SchemaViolation { violations })
    }
}
