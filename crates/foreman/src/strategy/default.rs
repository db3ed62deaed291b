//! The default strategy: diff the rendered manifest against the last release,
//! rotate StatefulSets whose changes cannot be applied live, apply what
//! changed, prune what is obsolete and persist the new release.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde_json::Value;

use super::rotation::{
    is_rotation_eligible, rename_instance, requires_rotation, resolve_dependents, split_rotation,
    RotationGroup,
};
use super::{RolloutOutcome, RolloutReport, Status, Strategy, UninstallReport, DEFAULT_STRATEGY};
use crate::backend::ClusterGateway;
use crate::error::Result;
use crate::manifest::{
    self, change_key, ChangeSet, Manifest, ManifestItem, RemovalEntry, KIND_DEPLOYMENT,
    KIND_STATEFUL_SET,
};
use crate::session::Session;

/// Readiness waits never ask for more than this many ready pods.
pub const READY_TARGET_CAP: u64 = 2;

/// Result of comparing the desired manifest with the prior release.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// The desired manifest with StatefulSets renamed to their instances.
    pub manifest: Manifest,
    pub changes: ChangeSet,
    pub removals: Vec<RemovalEntry>,
    pub rotated: bool,
}

/// Compares `desired` with `prior` and decides names, changes and removals.
pub fn reconcile(
    cluster: &dyn ClusterGateway,
    namespace: &str,
    prior: &[ManifestItem],
    desired: Manifest,
) -> Result<Reconciliation> {
    let mut changes = ChangeSet::new();
    let mut removals: Vec<RemovalEntry> = Vec::new();
    let mut renames: HashMap<usize, String> = HashMap::new();
    let mut rotated = false;

    for old in prior {
        let Some(idx) = desired.iter().position(|item| item.same_identity(old)) else {
            removals.push(removal_for_missing(cluster, namespace, old)?);
            continue;
        };

        let diff = manifest::diff_items(old, &desired[idx])?;
        let changed = diff.is_some();
        if !old.is_kind(KIND_STATEFUL_SET) {
            changes.record(old.change_key(), changed);
            continue;
        }

        let rotate = changed && requires_rotation(diff.as_ref(), old);
        let base = desired[idx].name();
        let group = RotationGroup::read(cluster, namespace, base)?;
        tracing::info!(
            "current rotation for {}/{} is {}",
            namespace,
            base,
            group.rotation
        );

        let name = if rotate {
            rotated = true;
            group.next_name()
        } else {
            group.current_name()
        };

        let keep = if rotate {
            0
        } else {
            group.instances.len().saturating_sub(1)
        };
        let obsolete = if rotate {
            &group.instances[..]
        } else {
            &group.instances[..keep]
        };
        for instance in obsolete.iter().filter(|i| i.name != name) {
            let item = instance
                .item
                .clone()
                .or_else(|| Some(rename_instance(old.clone(), &instance.name)));
            removals.push(RemovalEntry::new(KIND_STATEFUL_SET, &instance.name, item));
        }

        tracing::info!("applying rotation: {}", name);
        changes.record(change_key(KIND_STATEFUL_SET, &name), changed);
        renames.insert(idx, name);
    }

    let mut seen = HashSet::new();
    removals.retain(|r| seen.insert((r.kind.clone(), r.name.clone())));

    let manifest = desired
        .into_iter()
        .enumerate()
        .map(|(idx, item)| match renames.remove(&idx) {
            Some(name) => rename_instance(item, &name),
            None => item,
        })
        .collect();

    Ok(Reconciliation {
        manifest,
        changes,
        removals,
        rotated,
    })
}

/// Schedules removal of an object the desired manifest no longer contains.
fn removal_for_missing(
    cluster: &dyn ClusterGateway,
    namespace: &str,
    old: &ManifestItem,
) -> Result<RemovalEntry> {
    let qualify = old.is_kind(KIND_STATEFUL_SET)
        && is_rotation_eligible(old)
        && split_rotation(old.name()).1.is_none();
    if !qualify {
        return Ok(RemovalEntry::new(&old.kind, old.name(), Some(old.clone())));
    }
    let group = RotationGroup::read(cluster, namespace, old.name())?;
    let name = group.current_name();
    let item = rename_instance(old.clone(), &name);
    Ok(RemovalEntry::new(&old.kind, name, Some(item)))
}

/// Unified diff of the prior release against the desired manifest.
pub fn release_diff(prior: &[ManifestItem], desired: &[ManifestItem]) -> Result<String> {
    let old = manifest::encode_all(prior)?;
    let new = manifest::encode_all(desired)?;
    Ok(similar::TextDiff::from_lines(&old, &new)
        .unified_diff()
        .header("release", "desired")
        .to_string())
}

/// What `apply_manifest` did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedManifest {
    pub manifest: Manifest,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

/// The default reconciliation strategy.
#[derive(Debug, Clone, Default)]
pub struct RotationEngine;

impl RotationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Resolves dependents, then applies every item whose change-set entry is
    /// not an explicit `false`. With a deadline set, StatefulSets and
    /// Deployments block until ready.
    pub fn apply_manifest(
        &self,
        session: &Session,
        manifest: Manifest,
        changes: ChangeSet,
    ) -> Result<AppliedManifest> {
        let (manifest, changes) = resolve_dependents(manifest, changes);
        let cluster = session.backends().cluster.clone();
        let namespace = session.namespace();
        let mut applied = Vec::new();
        let mut skipped = Vec::new();

        for item in &manifest {
            let key = item.change_key();
            if !changes.should_apply(&key) {
                tracing::info!("apply skipped for unchanged {}", key);
                skipped.push(key);
                continue;
            }
            session.check_deadline()?;
            tracing::info!("applying {}/{}", item.kind, item.name());
            cluster.apply(namespace, item)?;
            applied.push(key);

            let waits = item.is_kind(KIND_STATEFUL_SET) || item.is_kind(KIND_DEPLOYMENT);
            if waits && session.deadline().is_set() {
                let target = item.replicas().unwrap_or(1).min(READY_TARGET_CAP);
                cluster.wait_ready(namespace, &item.kind, item.name(), target, session.deadline())?;
            }
        }

        Ok(AppliedManifest {
            manifest,
            applied,
            skipped,
        })
    }

    fn read_prior(&self, session: &Session) -> Result<Manifest> {
        match session
            .backends()
            .releases
            .read(session.namespace(), session.name())
        {
            Ok(prior) => Ok(prior),
            Err(e) if e.is_not_found() => {
                tracing::info!("no release found for {}, treating as fresh install", session.resource_id());
                Ok(Manifest::new())
            }
            Err(e) => Err(e),
        }
    }

    fn rotations(&self, session: &Session) -> Result<BTreeMap<String, u64>> {
        let backends = session.backends();
        let release = backends.releases.read(session.namespace(), session.name())?;
        let mut rotations = BTreeMap::new();
        for item in release.iter().filter(|i| i.is_kind(KIND_STATEFUL_SET)) {
            let (base, _) = split_rotation(item.name());
            if rotations.contains_key(base) {
                continue;
            }
            let group = RotationGroup::read(backends.cluster.as_ref(), session.namespace(), base)?;
            rotations.insert(base.to_string(), group.rotation);
        }
        Ok(rotations)
    }

    fn delete_all(
        cluster: &dyn ClusterGateway,
        namespace: &str,
        targets: impl IntoIterator<Item = (String, String)>,
        deleted: &mut Vec<String>,
        failed: &mut Vec<String>,
    ) {
        for (kind, name) in targets {
            let id = format!("{}/{}", kind, name);
            tracing::info!("deleting {} from {}", id, namespace);
            match cluster.delete(namespace, &kind, &name) {
                Ok(()) => deleted.push(id),
                Err(e) if e.is_not_found() => tracing::info!("{} already gone", id),
                Err(e) => {
                    tracing::error!("failed to delete {} from {}: {}", id, namespace, e);
                    failed.push(id);
                }
            }
        }
    }
}

impl Strategy for RotationEngine {
    fn name(&self) -> &str {
        DEFAULT_STRATEGY
    }

    fn rollout(&self, session: &mut Session, chart: &Path, values: &Value) -> Result<RolloutOutcome> {
        session.set_deadline(session.requested_wait());
        let backends = session.backends().clone();

        let desired = backends.templater.render(chart, values)?;
        let release = desired.clone();
        let prior = self.read_prior(session)?;

        if session.is_dry_run() {
            if prior.is_empty() {
                tracing::info!("no release found, nothing to diff against");
                return Ok(RolloutOutcome::DryRun {
                    diff: String::new(),
                });
            }
            return Ok(RolloutOutcome::DryRun {
                diff: release_diff(&prior, &desired)?,
            });
        }

        let reconciliation = reconcile(backends.cluster.as_ref(), session.namespace(), &prior, desired)?;
        tracing::info!("rolling out manifest");
        if reconciliation.rotated {
            session.mark_rotated();
            session.enable_wait();
        } else {
            tracing::info!("no rotation performed, not waiting for readiness");
            session.disable_wait();
        }

        let applied = self.apply_manifest(session, reconciliation.manifest, reconciliation.changes)?;
        let mut report = RolloutReport {
            rotated: reconciliation.rotated,
            applied: applied.applied,
            skipped: applied.skipped,
            ..RolloutReport::default()
        };

        let mut pending = Vec::new();
        for removal in reconciliation.removals {
            let before = report.failed_removals.len();
            Self::delete_all(
                backends.cluster.as_ref(),
                session.namespace(),
                [(removal.kind.clone(), removal.name.clone())],
                &mut report.removed,
                &mut report.failed_removals,
            );
            if report.failed_removals.len() > before {
                pending.extend(removal.item);
            }
        }

        let mut record = release;
        if session.prune() {
            if !pending.is_empty() {
                tracing::info!("pruning {} failed removals from the release", pending.len());
            }
        } else {
            for item in pending {
                if manifest::find(&record, &item.kind, item.name()).is_none() {
                    record.push(item);
                }
            }
        }
        backends
            .releases
            .write(session.namespace(), session.name(), &record)?;
        tracing::info!("release {} written", session.resource_id());
        Ok(RolloutOutcome::Applied(report))
    }

    fn uninstall(&self, session: &mut Session) -> Result<UninstallReport> {
        if session.is_dry_run() {
            tracing::info!("uninstall dry run");
            return Ok(UninstallReport {
                dry_run: true,
                ..UninstallReport::default()
            });
        }
        session.set_deadline(session.requested_wait());
        let backends = session.backends().clone();
        let namespace = session.namespace();
        let release = backends.releases.read(namespace, session.name())?;

        let mut targets: Vec<(String, String)> = Vec::new();
        for item in &release {
            if item.is_kind(KIND_STATEFUL_SET) && is_rotation_eligible(item) {
                let (base, _) = split_rotation(item.name());
                let group = RotationGroup::read(backends.cluster.as_ref(), namespace, base)?;
                targets.extend(
                    group
                        .names()
                        .into_iter()
                        .map(|name| (item.kind.clone(), name.to_string())),
                );
            } else {
                targets.push((item.kind.clone(), item.name().to_string()));
            }
        }
        let mut seen = HashSet::new();
        targets.retain(|t| seen.insert(t.clone()));

        let mut report = UninstallReport::default();
        Self::delete_all(
            backends.cluster.as_ref(),
            namespace,
            targets,
            &mut report.deleted,
            &mut report.failed,
        );
        backends.releases.delete(namespace, session.name())?;
        tracing::info!("release {} deleted", session.resource_id());
        Ok(report)
    }

    fn status(&self, session: &Session) -> Status {
        match self.rotations(session) {
            Ok(rotations) => Status::Deployed { rotations },
            Err(e) => Status::NotFound {
                error: e.to_string(),
            },
        }
    }
}
