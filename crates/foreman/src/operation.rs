//! Top-level entry points: rollout, uninstall and status.
//!
//! Each resolves the strategy bound to the resource's asset and drives it
//! under the resource lock. Failures are wrapped in a single
//! `ForemanError::Operation` naming the resource; the lock is released on
//! every exit path.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info_span;

use crate::error::{ForemanError, Result};
use crate::global::{self, Target};
use crate::resource::{AssetRef, ResourceSpec};
use crate::session::Session;
use crate::strategy::{
    RolloutOutcome, Status, Strategy, StrategyRef, StrategyRegistry, UninstallReport,
};
use crate::values;

#[derive(Clone, Default)]
pub struct Orchestrator {
    registry: StrategyRegistry,
}

impl Orchestrator {
    pub fn new(registry: StrategyRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Rolls out `spec`, or the persisted spec when `None`.
    ///
    /// An inline spec is validated and persisted first; in dry-run mode it is
    /// only validated.
    pub fn rollout(&self, session: &mut Session, spec: Option<ResourceSpec>) -> Result<RolloutOutcome> {
        let span = info_span!(
            "rollout",
            namespace = %session.namespace(),
            name = %session.name(),
            dry_run = session.is_dry_run()
        );
        let _enter = span.enter();
        let resource = session.resource_id();

        self.rollout_inner(session, spec)
            .map_err(|e| e.during("roll out", resource))
    }

    fn rollout_inner(&self, session: &mut Session, spec: Option<ResourceSpec>) -> Result<RolloutOutcome> {
        let spec = match spec {
            Some(spec) if session.is_dry_run() => {
                session.check_spec(&spec)?;
                spec
            }
            Some(spec) => {
                session.update_spec(&spec)?;
                spec
            }
            None => session.load_spec()?,
        };
        let asset = spec.validate()?.clone();

        let _guard = session.lock()?;
        let values = self.render_values(session, &spec)?;
        let (chart, strategy) = self.strategy_for(session, &asset)?;
        tracing::info!("rolling out {} with strategy {}", asset, strategy.name());
        let outcome = strategy.rollout(session, &chart, &values)?;
        tracing::info!("rollout of {} complete", session.resource_id());
        Ok(outcome)
    }

    pub fn uninstall(&self, session: &mut Session) -> Result<UninstallReport> {
        let span = info_span!(
            "uninstall",
            namespace = %session.namespace(),
            name = %session.name(),
            dry_run = session.is_dry_run()
        );
        let _enter = span.enter();
        let resource = session.resource_id();

        self.uninstall_inner(session)
            .map_err(|e| e.during("uninstall", resource))
    }

    fn uninstall_inner(&self, session: &mut Session) -> Result<UninstallReport> {
        let _guard = session.lock()?;
        let strategy = self.persisted_strategy(session);
        tracing::info!("uninstalling with strategy {}", strategy.name());
        strategy.uninstall(session)
    }

    /// Read-only; takes no lock.
    pub fn status(&self, session: &mut Session) -> Status {
        let span = info_span!(
            "status",
            namespace = %session.namespace(),
            name = %session.name()
        );
        let _enter = span.enter();
        self.persisted_strategy(session).status(session)
    }

    /// `{global, app}` for the templater. App-level `global` overrides win
    /// over platform values.
    fn render_values(&self, session: &Session, spec: &ResourceSpec) -> Result<Value> {
        let target = Target {
            cluster: session.cluster(),
            namespace: session.namespace(),
            name: session.name(),
        };
        let mut global = global::platform_values(
            session.backends().bundles.as_ref(),
            target,
            &session.options().global_spec_plugins,
            &spec.app,
            chrono::Utc::now(),
        )?;
        if let Some(overrides) = &spec.global {
            values::merge(&mut global, overrides.clone());
        }
        Ok(json!({ "global": global, "app": spec.app }))
    }

    fn strategy_for(
        &self,
        session: &mut Session,
        asset: &AssetRef,
    ) -> Result<(std::path::PathBuf, Arc<dyn Strategy>)> {
        let loaded = session.asset(asset).map_err(|e| {
            ForemanError::Strategy(format!("failed to load strategy for asset {}: {}", asset, e))
        })?;
        let chart = loaded.chart_path();
        let reference = StrategyRef::from_declared(loaded.strategy_ref()?);
        Ok((chart, self.registry.resolve(&reference)?))
    }

    /// The strategy of the persisted spec's asset, or the default one.
    fn persisted_strategy(&self, session: &mut Session) -> Arc<dyn Strategy> {
        let asset = match session.load_spec() {
            Ok(spec) => spec.asset.filter(|a| !a.asset_type.is_empty() && !a.release.is_empty()),
            Err(e) => {
                tracing::debug!("no persisted spec ({}), using default strategy", e);
                None
            }
        };
        match asset {
            Some(asset) => match self.strategy_for(session, &asset) {
                Ok((_, strategy)) => strategy,
                Err(e) => {
                    tracing::warn!("{}; falling back to default strategy", e);
                    self.registry.default_strategy()
                }
            },
            None => self.registry.default_strategy(),
        }
    }
}
