use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::global::GlobalSpecPlugin;

/// Environment variable naming the cluster when `inCluster` is not set.
pub const CLUSTER_ENV: &str = "CLUSTER";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    pub cluster: String,
    /// Backing store root: a `gs://` URL or a local directory.
    pub base_path: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub global_spec_plugins: Vec<GlobalSpecPlugin>,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_asset_lock_ttl")]
    pub asset_lock_ttl_secs: u64,
    #[serde(default = "default_readiness_poll")]
    pub readiness_poll_secs: u64,
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    #[serde(default = "default_helm")]
    pub helm: String,
    #[serde(default = "default_gsg")]
    pub gsg: String,
    #[serde(default)]
    pub in_cluster: Option<String>,
}

fn default_lock_ttl() -> u64 {
    60
}

fn default_asset_lock_ttl() -> u64 {
    5
}

fn default_readiness_poll() -> u64 {
    2
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_helm() -> String {
    "helm".to_string()
}

fn default_gsg() -> String {
    "gsg".to_string()
}

/// Which transport `basePath` selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Gsg(String),
    Local(PathBuf),
}

impl OperatorConfig {
    pub fn new(cluster: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            base_path: base_path.into(),
            working_dir: None,
            global_spec_plugins: Vec::new(),
            lock_ttl_secs: default_lock_ttl(),
            asset_lock_ttl_secs: default_asset_lock_ttl(),
            readiness_poll_secs: default_readiness_poll(),
            kubectl: default_kubectl(),
            helm: default_helm(),
            gsg: default_gsg(),
            in_cluster: None,
        }
    }

    /// Local working directory; `~/.foreman` unless configured.
    pub fn working_dir(&self) -> PathBuf {
        match &self.working_dir {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".foreman"),
        }
    }

    /// Owner scoping the asset fetch lock: `inCluster`, else `$CLUSTER`.
    pub fn asset_lock_owner(&self) -> Option<String> {
        self.in_cluster
            .clone()
            .or_else(|| std::env::var(CLUSTER_ENV).ok())
            .filter(|owner| !owner.is_empty())
    }

    pub fn store_kind(&self) -> StoreKind {
        if self.base_path.starts_with("gs://") {
            StoreKind::Gsg(self.base_path.clone())
        } else {
            StoreKind::Local(PathBuf::from(&self.base_path))
        }
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_secs(self.readiness_poll_secs)
    }
}
