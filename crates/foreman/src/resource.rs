//! Persisted desired specs, one per `(cluster, namespace, name)`.
//!
//! Specs live at `resources/<cluster>/<namespace>/<name>.yaml` in the backing
//! store; every mutation happens under `<path>.lock`.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::asset::AssetCache;
use crate::backend::RemoteBundleStore;
use crate::error::{ForemanError, Result};
use crate::lock::ReentrantLock;
use crate::session::ScratchRegistry;

const SPEC_EXTENSION: &str = ".yaml";

/// Names the asset bundle a spec is rendered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    #[serde(rename = "type", default)]
    pub asset_type: String,
    #[serde(default)]
    pub release: String,
}

impl AssetRef {
    pub fn new(asset_type: impl Into<String>, release: impl Into<String>) -> Self {
        Self {
            asset_type: asset_type.into(),
            release: release.into(),
        }
    }
}

impl std::fmt::Display for AssetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.asset_type, self.release)
    }
}

/// The desired state of one application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetRef>,

    /// Application values, validated against the asset schema.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub app: Value,

    /// Overrides merged over the platform `global` values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<Value>,
}

impl ResourceSpec {
    pub fn new(asset: AssetRef, app: Value) -> Self {
        Self {
            asset: Some(asset),
            app,
            global: None,
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let spec: Option<ResourceSpec> = serde_yaml::from_str(text)?;
        Ok(spec.unwrap_or_default())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// The asset reference, or `InvalidSpec` when asset or app is missing.
    pub fn validate(&self) -> Result<&AssetRef> {
        let asset = self
            .asset
            .as_ref()
            .ok_or_else(|| ForemanError::InvalidSpec("missing asset from spec".to_string()))?;
        if asset.asset_type.is_empty() || asset.release.is_empty() {
            return Err(ForemanError::InvalidSpec(
                "asset must name both type and release".to_string(),
            ));
        }
        if self.app.is_null() {
            return Err(ForemanError::InvalidSpec("missing app from spec".to_string()));
        }
        Ok(asset)
    }
}

fn resources_prefix(cluster: &str, namespace: &str) -> Result<String> {
    if cluster.is_empty() || namespace.is_empty() {
        return Err(ForemanError::InvalidResourceId(format!(
            "{}/{}",
            cluster, namespace
        )));
    }
    Ok(format!("resources/{}/{}", cluster, namespace))
}

/// Handle on one persisted spec and its lock.
pub struct ResourceStore {
    cluster: String,
    namespace: String,
    name: String,
    path: String,
    store: Arc<dyn RemoteBundleStore>,
    lock: ReentrantLock,
}

impl ResourceStore {
    pub fn new(
        store: Arc<dyn RemoteBundleStore>,
        cluster: &str,
        namespace: &str,
        name: &str,
        lock_ttl: Duration,
        retry_delay: Duration,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(ForemanError::InvalidResourceId(format!("{}/", namespace)));
        }
        let path = format!("{}/{}{}", resources_prefix(cluster, namespace)?, name, SPEC_EXTENSION);
        let lock = ReentrantLock::new(store.clone(), format!("{}.lock", path), lock_ttl, retry_delay);
        Ok(Self {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            path,
            store,
            lock,
        })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Location of the spec in the backing store.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn lock(&self) -> &ReentrantLock {
        &self.lock
    }

    pub fn exists(&self) -> Result<bool> {
        self.store.exists(&self.path)
    }

    pub fn get(&self) -> Result<ResourceSpec> {
        let raw = self.store.read(&self.path)?;
        ResourceSpec::from_yaml(&raw)
    }

    /// Rejects specs without asset or app, then validates `app` against the
    /// asset schema.
    pub fn schema_check(&self, spec: &ResourceSpec, assets: &mut AssetCache) -> Result<()> {
        let asset = spec.validate()?;
        assets.check(&asset.asset_type, &asset.release, &spec.app)
    }

    /// Validates and replaces the persisted spec.
    ///
    /// The spec is written to a scratch file first and then moved into place.
    pub fn update(
        &self,
        spec: &ResourceSpec,
        assets: &mut AssetCache,
        scratch: &ScratchRegistry,
    ) -> Result<()> {
        let _guard = self.lock.guard()?;
        self.schema_check(spec, assets)?;
        let temp = scratch.temp_file(&format!(
            "{}-{}.yaml",
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4()
        ))?;
        fs::write(&temp, spec.to_yaml()?).map_err(|e| ForemanError::io(&temp, e))?;
        self.store.upload(&temp, &self.path)?;
        tracing::info!("resource {} updated", self.path);
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        let _guard = self.lock.guard()?;
        self.store.remove(&self.path)?;
        tracing::info!("resource {} deleted", self.path);
        Ok(())
    }

    /// Releases the lock regardless of nesting depth.
    pub fn finalize(&self) {
        self.lock.finalize();
    }
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("path", &self.path)
            .field("lock", &self.lock)
            .finish()
    }
}

/// Names of the specs stored for `namespace` in `cluster`.
pub fn list(store: &dyn RemoteBundleStore, cluster: &str, namespace: &str) -> Result<Vec<String>> {
    let prefix = resources_prefix(cluster, namespace)?;
    let mut names: Vec<String> = store
        .list(&prefix)?
        .into_iter()
        .filter_map(|path| {
            let file = path.rsplit('/').next()?;
            let name = file.strip_suffix(SPEC_EXTENSION)?;
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect();
    names.sort();
    Ok(names)
}

/// Copies the spec of `from` over `to`, holding the lock of `to`.
pub fn copy(from: &ResourceStore, to: &ResourceStore, scratch: &ScratchRegistry) -> Result<()> {
    let _guard = to.lock.guard()?;
    let raw = from.store.read(&from.path)?;
    let temp = scratch.temp_file(&format!("copy-{}.yaml", uuid::Uuid::new_v4()))?;
    fs::write(&temp, raw).map_err(|e| ForemanError::io(&temp, e))?;
    to.store.upload(&temp, &to.path)?;
    tracing::info!("resource {} copied to {}", from.path, to.path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{AssetLockSettings, CHART_FILE, SCHEMA_FILE};
    use crate::backend::{JsonSchemaValidator, MemoryBundleStore};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryBundleStore>,
        assets: AssetCache,
        scratch: ScratchRegistry,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryBundleStore::new());
        store.add_asset(
            "web",
            "1.0.0",
            &[
                (CHART_FILE, "chart"),
                (SCHEMA_FILE, r#"{"type": "object", "required": ["image"]}"#),
            ],
        );
        let assets = AssetCache::new(
            store.clone(),
            Arc::new(JsonSchemaValidator::new()),
            dir.path().join("assets"),
            AssetLockSettings::default(),
        );
        let scratch = ScratchRegistry::new(dir.path());
        Fixture {
            _dir: dir,
            store,
            assets,
            scratch,
        }
    }

    fn resource(store: &Arc<MemoryBundleStore>, name: &str) -> ResourceStore {
        ResourceStore::new(
            store.clone(),
            "c1",
            "prod",
            name,
            Duration::from_secs(60),
            Duration::from_millis(1),
        )
        .unwrap()
    }

    #[test]
    fn test_update_then_get() {
        let mut f = fixture();
        let res = resource(&f.store, "api");
        assert_eq!(res.path(), "resources/c1/prod/api.yaml");
        assert!(!res.exists().unwrap());

        let spec = ResourceSpec::new(AssetRef::new("web", "1.0.0"), json!({"image": "api:1"}));
        res.update(&spec, &mut f.assets, &f.scratch).unwrap();

        assert!(res.exists().unwrap());
        assert_eq!(res.get().unwrap(), spec);
        assert!(!res.lock().is_held());
        assert!(!f.store.is_locked("resources/c1/prod/api.yaml.lock"));
        assert_eq!(f.store.lock_calls(), 2);
    }

    #[test]
    fn test_invalid_spec_is_rejected_before_write() {
        let mut f = fixture();
        let res = resource(&f.store, "api");

        let missing_app = ResourceSpec {
            asset: Some(AssetRef::new("web", "1.0.0")),
            ..ResourceSpec::default()
        };
        assert!(matches!(
            res.update(&missing_app, &mut f.assets, &f.scratch),
            Err(ForemanError::InvalidSpec(_))
        ));

        let failing = ResourceSpec::new(AssetRef::new("web", "1.0.0"), json!({"replicas": 1}));
        assert!(matches!(
            res.update(&failing, &mut f.assets, &f.scratch),
            Err(ForemanError::SchemaViolation { .. })
        ));
        assert!(!res.exists().unwrap());
        assert!(!res.lock().is_held());
    }

    #[test]
    fn test_spec_without_asset_is_invalid() {
        let spec = ResourceSpec::from_yaml("app:\n  image: api:1\n").unwrap();
        assert!(matches!(spec.validate(), Err(ForemanError::InvalidSpec(_))));
        assert_eq!(ResourceSpec::from_yaml("").unwrap(), ResourceSpec::default());
    }

    #[test]
    fn test_list_and_copy() {
        let mut f = fixture();
        let api = resource(&f.store, "api");
        let spec = ResourceSpec::new(AssetRef::new("web", "1.0.0"), json!({"image": "api:1"}));
        api.update(&spec, &mut f.assets, &f.scratch).unwrap();

        let worker = resource(&f.store, "worker");
        copy(&api, &worker, &f.scratch).unwrap();
        assert_eq!(worker.get().unwrap(), spec);

        assert_eq!(
            list(f.store.as_ref(), "c1", "prod").unwrap(),
            vec!["api", "worker"]
        );
        assert!(list(f.store.as_ref(), "c1", "staging").unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_spec() {
        let mut f = fixture();
        let res = resource(&f.store, "api");
        let spec = ResourceSpec::new(AssetRef::new("web", "1.0.0"), json!({"image": "api:1"}));
        res.update(&spec, &mut f.assets, &f.scratch).unwrap();
        res.delete().unwrap();
        assert!(!res.exists().unwrap());
        assert!(res.delete().unwrap_err().is_not_found());
    }
}
