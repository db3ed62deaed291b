//! Test harness for isolated operator runs.
//!
//! The `TestHarness` wires the in-memory backends into sessions:
//! - a bundle store seeded with the `web/1.0.0` asset and the cluster's
//!   global spec
//! - an in-memory cluster and release store
//! - a static templater whose output each test sets
//! - a temporary working directory per harness

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use foreman::backend::{
    JsonSchemaValidator, MemoryBundleStore, MemoryCluster, MemoryReleaseStore, StaticTemplater,
};
use foreman::manifest::Manifest;
use foreman::resource::ResourceSpec;
use foreman::strategy::{RolloutOutcome, RolloutReport};
use foreman::{Backends, Orchestrator, ReleaseStore, Result, Session, SessionOptions};

/// Cluster every harness session runs against.
pub const CLUSTER: &str = "test";

/// Values schema of the `web/1.0.0` asset.
pub const WEB_SCHEMA: &str = r#"{
    "type": "object",
    "required": ["image"],
    "properties": {
        "image": {"type": "string"},
        "replicas": {"type": "string", "pattern": "^[0-9]+$"}
    }
}"#;

pub struct TestHarness {
    /// Temporary directory holding the working directory.
    temp_dir: TempDir,
    pub store: Arc<MemoryBundleStore>,
    pub cluster: Arc<MemoryCluster>,
    pub releases: Arc<MemoryReleaseStore>,
    pub templater: Arc<StaticTemplater>,
    pub orchestrator: Orchestrator,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(MemoryBundleStore::new());
        store.add_asset(
            "web",
            "1.0.0",
            &[("chart.tgz", "chart"), ("schema.json", WEB_SCHEMA)],
        );
        store.put_object(
            &format!("assets/global/{}.yaml", CLUSTER),
            "global:\n  domain: example.test\n  tier: standard\n",
        );

        Self {
            temp_dir,
            store,
            cluster: Arc::new(MemoryCluster::new()),
            releases: Arc::new(MemoryReleaseStore::new()),
            templater: Arc::new(StaticTemplater::default()),
            orchestrator: Orchestrator::default(),
        }
    }

    pub fn working_dir(&self) -> PathBuf {
        self.temp_dir.path().join("work")
    }

    pub fn backends(&self) -> Backends {
        Backends {
            cluster: self.cluster.clone(),
            releases: self.releases.clone(),
            bundles: self.store.clone(),
            templater: self.templater.clone(),
            validator: Arc::new(JsonSchemaValidator::new()),
        }
    }

    /// Options with a short lock retry delay.
    pub fn options(&self) -> SessionOptions {
        let mut options = SessionOptions::new(CLUSTER, self.working_dir());
        options.lock_retry_delay = Duration::from_millis(5);
        options
    }

    pub fn session(&self, resource: &str) -> Session {
        self.session_with(resource, self.options())
    }

    pub fn session_with(&self, resource: &str, options: SessionOptions) -> Session {
        Session::new(resource, options, self.backends()).expect("Failed to open session")
    }

    /// Sets what the templater renders next.
    pub fn render(&self, manifest: Manifest) {
        self.templater.set(manifest);
    }

    /// Renders `manifest` and rolls `spec` out with default options.
    pub fn rollout(&self, resource: &str, spec: ResourceSpec, manifest: Manifest) -> Result<RolloutOutcome> {
        self.rollout_with(resource, self.options(), spec, manifest)
    }

    pub fn rollout_with(
        &self,
        resource: &str,
        options: SessionOptions,
        spec: ResourceSpec,
        manifest: Manifest,
    ) -> Result<RolloutOutcome> {
        self.render(manifest);
        let mut session = self.session_with(resource, options);
        self.orchestrator.rollout(&mut session, Some(spec))
    }

    /// Like `rollout`, expecting an applied outcome.
    pub fn apply(&self, resource: &str, spec: ResourceSpec, manifest: Manifest) -> RolloutReport {
        match self.rollout(resource, spec, manifest).expect("rollout failed") {
            RolloutOutcome::Applied(report) => report,
            other => panic!("expected an applied rollout, got {:?}", other),
        }
    }

    pub fn release(&self, namespace: &str, name: &str) -> Manifest {
        self.releases
            .read(namespace, name)
            .expect("Failed to read release")
    }

    /// Sorted names of the live StatefulSets in `namespace`.
    pub fn statefulsets(&self, namespace: &str) -> Vec<String> {
        let mut names = self.cluster.names(namespace, "StatefulSet");
        names.sort();
        names
    }
}
