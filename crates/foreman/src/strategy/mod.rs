//! Reconciliation strategies.
//!
//! Every asset is rolled out by a `Strategy`. Assets that ship no
//! `strategy.yaml` use the default `RotationEngine`; an asset may instead name
//! a custom strategy, which must have been registered with the
//! `StrategyRegistry` by the embedding program.

pub mod default;
pub mod rotation;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::{ForemanError, Result};
use crate::session::Session;

pub use default::{reconcile, Reconciliation, RotationEngine};
pub use rotation::{
    is_rotation_eligible, qualified_name, rename_instance, requires_rotation, resolve_dependents,
    split_rotation, RotationGroup, RotationInstance, ROTATION_ANNOTATION, ROTATION_SEPARATOR,
};

/// Name the default strategy is registered under.
pub const DEFAULT_STRATEGY: &str = "default";

/// Drives one asset type's rollout, uninstall and status.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Renders `chart` with `values` and reconciles the cluster towards it.
    fn rollout(&self, session: &mut Session, chart: &Path, values: &Value)
        -> Result<RolloutOutcome>;

    fn uninstall(&self, session: &mut Session) -> Result<UninstallReport>;

    /// Never fails; a missing release is reported as `Status::NotFound`.
    fn status(&self, session: &Session) -> Status;
}

/// Which strategy an asset asks for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StrategyRef {
    #[default]
    Default,
    Custom(String),
}

impl StrategyRef {
    pub fn from_declared(declared: Option<String>) -> Self {
        match declared {
            Some(name) if name != DEFAULT_STRATEGY => StrategyRef::Custom(name),
            _ => StrategyRef::Default,
        }
    }
}

/// Strategies available to the orchestrator.
#[derive(Clone)]
pub struct StrategyRegistry {
    default: Arc<dyn Strategy>,
    custom: HashMap<String, Arc<dyn Strategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new(Arc::new(RotationEngine::new()))
    }
}

impl StrategyRegistry {
    pub fn new(default: Arc<dyn Strategy>) -> Self {
        Self {
            default,
            custom: HashMap::new(),
        }
    }

    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        self.custom.insert(strategy.name().to_string(), strategy);
    }

    pub fn default_strategy(&self) -> Arc<dyn Strategy> {
        self.default.clone()
    }

    pub fn resolve(&self, reference: &StrategyRef) -> Result<Arc<dyn Strategy>> {
        match reference {
            StrategyRef::Default => Ok(self.default.clone()),
            StrategyRef::Custom(name) => self.custom.get(name).cloned().ok_or_else(|| {
                ForemanError::Strategy(format!("no strategy registered under '{}'", name))
            }),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.custom.keys().cloned().collect();
        names.sort();
        names
    }
}

/// What a rollout did.
#[derive(Debug, Clone, PartialEq)]
pub enum RolloutOutcome {
    Applied(RolloutReport),
    /// Nothing was changed; `diff` is a unified diff of release vs. desired.
    DryRun { diff: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutReport {
    pub rotated: bool,
    /// `kind-name` keys applied, in order.
    pub applied: Vec<String>,
    /// `kind-name` keys left untouched because they did not change.
    pub skipped: Vec<String>,
    /// `kind/name` of removed objects.
    pub removed: Vec<String>,
    /// `kind/name` of objects whose removal failed.
    pub failed_removals: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallReport {
    pub dry_run: bool,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Deployment status of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Status {
    /// Current rotation number per StatefulSet base name.
    Deployed { rotations: BTreeMap<String, u64> },
    NotFound { error: String },
}
