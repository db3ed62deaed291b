//! Immutable `(type, release)` bundles: a chart, its values schema and an
//! optional strategy declaration, fetched once into a local cache.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::backend::{ensure_valid, RemoteBundleStore, Validator};
use crate::error::{ForemanError, Result};
use crate::lock;

pub const CHART_FILE: &str = "chart.tgz";
pub const SCHEMA_FILE: &str = "schema.json";
pub const STRATEGY_FILE: &str = "strategy.yaml";

/// How the fetch lock of an asset is taken.
#[derive(Debug, Clone)]
pub struct AssetLockSettings {
    pub ttl: Duration,
    pub retry_delay: Duration,
    /// When set, the lock is scoped to this owner instead of the local host.
    pub owner: Option<String>,
}

impl Default for AssetLockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            retry_delay: lock::DEFAULT_RETRY_DELAY,
            owner: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StrategyDeclaration {
    #[serde(default)]
    strategy: Option<String>,
}

fn check_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('/') || value == "." || value == ".." {
        return Err(ForemanError::InvalidSpec(format!(
            "invalid asset {}: '{}'",
            kind, value
        )));
    }
    Ok(())
}

pub struct Asset {
    asset_type: String,
    release: String,
    local_path: PathBuf,
    loaded: bool,
    store: Arc<dyn RemoteBundleStore>,
    lock: AssetLockSettings,
}

impl Asset {
    pub fn new(
        store: Arc<dyn RemoteBundleStore>,
        cache_root: &Path,
        asset_type: &str,
        release: &str,
        lock: AssetLockSettings,
    ) -> Result<Self> {
        check_segment("type", asset_type)?;
        check_segment("release", release)?;
        Ok(Self {
            asset_type: asset_type.to_string(),
            release: release.to_string(),
            local_path: cache_root.join(asset_type).join(release),
            loaded: false,
            store,
            lock,
        })
    }

    pub fn asset_type(&self) -> &str {
        &self.asset_type
    }

    pub fn release(&self) -> &str {
        &self.release
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Location of the bundle in the backing store.
    pub fn remote_path(&self) -> String {
        format!("assets/{}/releases/{}", self.asset_type, self.release)
    }

    /// Key of the lock serializing fetches of this bundle.
    pub fn lock_key(&self) -> String {
        match &self.lock.owner {
            Some(owner) => format!("{}.foreman.{}.lock", self.remote_path(), owner),
            None => format!("{}.local.lock", self.remote_path()),
        }
    }

    pub fn chart_path(&self) -> PathBuf {
        self.local_path.join(CHART_FILE)
    }

    pub fn schema_path(&self) -> PathBuf {
        self.local_path.join(SCHEMA_FILE)
    }

    fn invalid(&self, reason: impl Into<String>) -> ForemanError {
        ForemanError::InvalidAsset {
            asset_type: self.asset_type.clone(),
            release: self.release.clone(),
            reason: reason.into(),
        }
    }

    /// Fetches the bundle unless this handle already loaded it.
    pub fn load(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        fs::create_dir_all(&self.local_path).map_err(|e| ForemanError::io(&self.local_path, e))?;

        let key = self.lock_key();
        lock::acquire(self.store.as_ref(), &key, self.lock.ttl, self.lock.retry_delay)?;
        let fetched = if self.chart_path().exists() {
            tracing::debug!("asset {} already cached", self.remote_path());
            Ok(())
        } else {
            tracing::info!("fetching asset {}", self.remote_path());
            self.store
                .fetch(&self.asset_type, &self.release, &self.local_path)
        };
        lock::release(self.store.as_ref(), &key);
        fetched?;

        if !self.chart_path().exists() {
            return Err(self.invalid(format!("{} not found", CHART_FILE)));
        }
        if !self.schema_path().exists() {
            return Err(self.invalid(format!("{} not found", SCHEMA_FILE)));
        }
        self.loaded = true;
        Ok(())
    }

    /// The values schema, loading the bundle if needed.
    pub fn schema(&mut self) -> Result<Value> {
        self.load()?;
        let path = self.schema_path();
        let raw = fs::read_to_string(&path).map_err(|e| ForemanError::io(&path, e))?;
        serde_json::from_str(&raw).map_err(|e| self.invalid(format!("{}: {}", SCHEMA_FILE, e)))
    }

    /// Validates `values` against the bundle schema, reporting every violation.
    pub fn check(&mut self, validator: &dyn Validator, values: &Value) -> Result<()> {
        let schema = self.schema()?;
        ensure_valid(validator, values, &schema)
    }

    /// Name of the custom strategy declared in `strategy.yaml`, if any.
    pub fn strategy_ref(&self) -> Result<Option<String>> {
        let path = self.local_path.join(STRATEGY_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| ForemanError::io(&path, e))?;
        let declaration: StrategyDeclaration = if raw.trim().is_empty() {
            StrategyDeclaration::default()
        } else {
            serde_yaml::from_str(&raw)?
        };
        Ok(declaration.strategy.filter(|s| !s.is_empty()))
    }
}

impl std::fmt::Debug for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Asset")
            .field("type", &self.asset_type)
            .field("release", &self.release)
            .field("local_path", &self.local_path)
            .field("loaded", &self.loaded)
            .finish()
    }
}

/// Assets loaded by one session, keyed by `(type, release)`.
pub struct AssetCache {
    store: Arc<dyn RemoteBundleStore>,
    validator: Arc<dyn Validator>,
    cache_root: PathBuf,
    lock: AssetLockSettings,
    assets: HashMap<(String, String), Asset>,
}

impl AssetCache {
    pub fn new(
        store: Arc<dyn RemoteBundleStore>,
        validator: Arc<dyn Validator>,
        cache_root: impl Into<PathBuf>,
        lock: AssetLockSettings,
    ) -> Self {
        Self {
            store,
            validator,
            cache_root: cache_root.into(),
            lock,
            assets: HashMap::new(),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Returns the loaded asset, fetching it on first use.
    pub fn get(&mut self, asset_type: &str, release: &str) -> Result<&Asset> {
        self.get_mut(asset_type, release).map(|asset| &*asset)
    }

    fn get_mut(&mut self, asset_type: &str, release: &str) -> Result<&mut Asset> {
        let key = (asset_type.to_string(), release.to_string());
        if !self.assets.contains_key(&key) {
            let mut asset = Asset::new(
                self.store.clone(),
                &self.cache_root,
                asset_type,
                release,
                self.lock.clone(),
            )?;
            asset.load()?;
            self.assets.insert(key.clone(), asset);
        }
        self.assets
            .get_mut(&key)
            .ok_or_else(|| ForemanError::NotFound {
                what: format!("asset {}/{}", asset_type, release),
            })
    }

    /// Validates `values` against the schema of `(type, release)`.
    pub fn check(&mut self, asset_type: &str, release: &str, values: &Value) -> Result<()> {
        let validator = self.validator.clone();
        self.get_mut(asset_type, release)?
            .check(validator.as_ref(), values)
    }

    /// Releases published for `asset_type` in the backing store.
    pub fn list_releases(&self, asset_type: &str) -> Result<Vec<String>> {
        check_segment("type", asset_type)?;
        let prefix = format!("assets/{}/releases", asset_type);
        let mut releases: Vec<String> = self
            .store
            .list(&prefix)?
            .into_iter()
            .filter_map(|path| {
                let trimmed = path.trim_end_matches('/');
                let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
                (!last.is_empty() && !last.ends_with(".lock")).then(|| last.to_string())
            })
            .collect();
        releases.sort();
        releases.dedup();
        Ok(releases)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}
