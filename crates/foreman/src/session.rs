//! One rollout or uninstall invocation.
//!
//! A `Session` owns the resource it operates on, the assets it loaded and the
//! scratch files it created. Teardown releases the resource lock and removes
//! scratch files exactly once, whether it is triggered by `Drop`, an explicit
//! call, or a signal handler holding a `TeardownHandle`.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::asset::{Asset, AssetCache, AssetLockSettings};
use crate::backend::Backends;
use crate::config::OperatorConfig;
use crate::error::{ForemanError, Result};
use crate::global::GlobalSpecPlugin;
use crate::lock::{LockGuard, ReentrantLock, DEFAULT_RETRY_DELAY};
use crate::resource::{AssetRef, ResourceSpec, ResourceStore};

/// Deadline applied when waiting is enabled without an explicit duration.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(10 * 60);

/// Longest deadline a session will set; larger requests are clamped.
pub const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How long readiness waits may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wait {
    /// No deadline; applies never block on readiness.
    #[default]
    Disabled,
    /// Wait with the default deadline.
    Enabled,
    /// Wait at most this many minutes. Zero or less disables waiting.
    Minutes(i64),
    /// Wait at most this long. Zero disables waiting.
    Within(Duration),
}

impl Wait {
    /// Resolves the deadline this setting implies, starting now.
    pub fn deadline(self) -> Deadline {
        match self {
            Wait::Disabled => Deadline::none(),
            Wait::Enabled => Deadline::after(DEFAULT_WAIT),
            Wait::Minutes(minutes) if minutes <= 0 => Deadline::none(),
            Wait::Minutes(minutes) => Deadline::after(
                u64::try_from(minutes)
                    .ok()
                    .and_then(|m| m.checked_mul(60))
                    .map_or(MAX_WAIT, Duration::from_secs),
            ),
            Wait::Within(duration) if duration.is_zero() => Deadline::none(),
            Wait::Within(duration) => Deadline::after(duration),
        }
    }
}

impl From<bool> for Wait {
    fn from(wait: bool) -> Self {
        if wait {
            Wait::Enabled
        } else {
            Wait::Disabled
        }
    }
}

impl FromStr for Wait {
    type Err = ForemanError;

    /// Accepts `true`, `false` or a number of minutes.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "true" => Ok(Wait::Enabled),
            "false" => Ok(Wait::Disabled),
            other => other
                .parse::<i64>()
                .map(Wait::Minutes)
                .map_err(|_| ForemanError::InvalidSpec(format!("unsupported wait value: {}", s))),
        }
    }
}

/// An optional wall-clock limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    /// Deadline `duration` from now, clamped to `MAX_WAIT`.
    pub fn after(duration: Duration) -> Self {
        let now = Instant::now();
        Self(Some(now.checked_add(duration.min(MAX_WAIT)).unwrap_or(now)))
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() > at)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Fails with `ForemanError::Timeout` once the deadline has passed.
    /// `what` is only evaluated on failure.
    pub fn check(&self, what: impl FnOnce() -> String) -> Result<()> {
        if self.is_expired() {
            Err(ForemanError::Timeout { what: what() })
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Scratch files
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchEntry {
    /// Relative to the working directory.
    pub path: PathBuf,
    pub kind: ScratchKind,
}

/// Paths created under the working directory during one session.
#[derive(Clone)]
pub struct ScratchRegistry {
    working_dir: PathBuf,
    entries: Arc<Mutex<Vec<ScratchEntry>>>,
}

impl ScratchRegistry {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn entries_guard(&self) -> MutexGuard<'_, Vec<ScratchEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("scratch registry was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn relative(path: &str) -> Result<PathBuf> {
        let relative = PathBuf::from(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(ForemanError::InvalidSpec(format!(
                "scratch path must stay inside the working directory: '{}'",
                path
            )));
        }
        Ok(relative)
    }

    fn register(&self, path: PathBuf, kind: ScratchKind) {
        let mut entries = self.entries_guard();
        if !entries.iter().any(|e| e.path == path) {
            entries.push(ScratchEntry { path, kind });
        }
    }

    /// Creates a directory under the working directory and registers it.
    pub fn temp_dir(&self, path: &str) -> Result<PathBuf> {
        let relative = Self::relative(path)?;
        let full = self.working_dir.join(&relative);
        fs::create_dir_all(&full).map_err(|e| ForemanError::io(&full, e))?;
        self.register(relative, ScratchKind::Dir);
        Ok(full)
    }

    /// Registers a file path under the working directory and returns it.
    ///
    /// A path with a directory part registers that directory instead, so the
    /// whole subtree goes away on teardown.
    pub fn temp_file(&self, path: &str) -> Result<PathBuf> {
        let relative = Self::relative(path)?;
        match path.rfind('/') {
            Some(idx) => {
                self.temp_dir(&path[..idx])?;
            }
            None => {
                fs::create_dir_all(&self.working_dir)
                    .map_err(|e| ForemanError::io(&self.working_dir, e))?;
                self.register(relative.clone(), ScratchKind::File);
            }
        }
        Ok(self.working_dir.join(relative))
    }

    pub fn entries(&self) -> Vec<ScratchEntry> {
        self.entries_guard().clone()
    }

    /// Removes every registered path. Missing paths are ignored.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries_guard());
        for entry in entries {
            let full = self.working_dir.join(&entry.path);
            let result = match entry.kind {
                ScratchKind::File => fs::remove_file(&full),
                ScratchKind::Dir => fs::remove_dir_all(&full),
            };
            match result {
                Ok(()) => tracing::debug!("removed scratch path {}", full.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("failed to remove scratch path {}: {}", full.display(), e),
            }
        }
    }
}

// ============================================================================
// Teardown
// ============================================================================

struct TeardownState {
    done: AtomicBool,
    lock: ReentrantLock,
    scratch: ScratchRegistry,
}

/// Runs a session's teardown from anywhere, e.g. a signal handler.
#[derive(Clone)]
pub struct TeardownHandle {
    inner: Arc<TeardownState>,
}

impl TeardownHandle {
    fn new(lock: ReentrantLock, scratch: ScratchRegistry) -> Self {
        Self {
            inner: Arc::new(TeardownState {
                done: AtomicBool::new(false),
                lock,
                scratch,
            }),
        }
    }

    /// Releases the resource lock and removes scratch paths.
    /// Returns false if teardown already ran.
    pub fn run(&self) -> bool {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.lock.finalize();
        self.inner.scratch.clear();
        tracing::debug!("session teardown complete");
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Session
// ============================================================================

/// Settings shared by every session of one operator process.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub cluster: String,
    pub working_dir: PathBuf,
    pub lock_ttl: Duration,
    pub asset_lock_ttl: Duration,
    pub lock_retry_delay: Duration,
    /// Scopes the asset fetch lock to one operator deployment.
    pub asset_lock_owner: Option<String>,
    pub global_spec_plugins: Vec<GlobalSpecPlugin>,
    pub wait: Wait,
    pub dry_run: bool,
    pub prune: bool,
}

impl SessionOptions {
    pub fn new(cluster: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            cluster: cluster.into(),
            working_dir: working_dir.into(),
            lock_ttl: Duration::from_secs(60),
            asset_lock_ttl: Duration::from_secs(5),
            lock_retry_delay: DEFAULT_RETRY_DELAY,
            asset_lock_owner: None,
            global_spec_plugins: Vec::new(),
            wait: Wait::Disabled,
            dry_run: false,
            prune: false,
        }
    }

    pub fn from_config(config: &OperatorConfig) -> Self {
        Self {
            cluster: config.cluster.clone(),
            working_dir: config.working_dir(),
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            asset_lock_ttl: Duration::from_secs(config.asset_lock_ttl_secs),
            lock_retry_delay: DEFAULT_RETRY_DELAY,
            asset_lock_owner: config.asset_lock_owner(),
            global_spec_plugins: config.global_spec_plugins.clone(),
            wait: Wait::Disabled,
            dry_run: false,
            prune: false,
        }
    }

    pub fn with_wait(mut self, wait: Wait) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }
}

/// Splits `namespace/name`.
pub fn parse_resource_id(id: &str) -> Result<(String, String)> {
    match id.split_once('/') {
        Some((namespace, name))
            if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => Err(ForemanError::InvalidResourceId(id.to_string())),
    }
}

pub struct Session {
    id: String,
    namespace: String,
    name: String,
    options: SessionOptions,
    backends: Backends,
    resource: ResourceStore,
    assets: AssetCache,
    scratch: ScratchRegistry,
    deadline: Deadline,
    rotated: bool,
    teardown: TeardownHandle,
}

impl Session {
    /// Opens a session for `namespace/name`.
    pub fn new(resource_id: &str, options: SessionOptions, backends: Backends) -> Result<Self> {
        let (namespace, name) = parse_resource_id(resource_id)?;
        fs::create_dir_all(&options.working_dir)
            .map_err(|e| ForemanError::io(&options.working_dir, e))?;

        let resource = ResourceStore::new(
            backends.bundles.clone(),
            &options.cluster,
            &namespace,
            &name,
            options.lock_ttl,
            options.lock_retry_delay,
        )?;
        let assets = AssetCache::new(
            backends.bundles.clone(),
            backends.validator.clone(),
            options.working_dir.join("assets"),
            AssetLockSettings {
                ttl: options.asset_lock_ttl,
                retry_delay: options.lock_retry_delay,
                owner: options.asset_lock_owner.clone(),
            },
        );
        let scratch = ScratchRegistry::new(&options.working_dir);
        let teardown = TeardownHandle::new(resource.lock().clone(), scratch.clone());
        let deadline = options.wait.deadline();

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            namespace,
            name,
            options,
            backends,
            resource,
            assets,
            scratch,
            deadline,
            rotated: false,
            teardown,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `namespace/name`.
    pub fn resource_id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn cluster(&self) -> &str {
        &self.options.cluster
    }

    pub fn working_dir(&self) -> &Path {
        &self.options.working_dir
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn is_dry_run(&self) -> bool {
        self.options.dry_run
    }

    pub fn prune(&self) -> bool {
        self.options.prune
    }

    // --- deadline ---------------------------------------------------------

    /// The wait setting the caller asked for.
    pub fn requested_wait(&self) -> Wait {
        self.options.wait
    }

    pub fn set_deadline(&mut self, wait: Wait) {
        self.deadline = wait.deadline();
    }

    /// Enables readiness waits, keeping a positive requested duration.
    pub fn enable_wait(&mut self) {
        let wait = match self.options.wait {
            Wait::Minutes(minutes) if minutes > 0 => Wait::Minutes(minutes),
            Wait::Within(duration) if !duration.is_zero() => Wait::Within(duration),
            _ => Wait::Enabled,
        };
        self.set_deadline(wait);
    }

    pub fn disable_wait(&mut self) {
        self.deadline = Deadline::none();
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub fn check_deadline(&self) -> Result<()> {
        self.deadline
            .check(|| format!("operating on {}", self.resource_id()))
    }

    // --- rotation ---------------------------------------------------------

    pub fn is_rotated(&self) -> bool {
        self.rotated
    }

    pub fn mark_rotated(&mut self) {
        self.rotated = true;
    }

    // --- scratch ----------------------------------------------------------

    pub fn temp_dir(&self, path: &str) -> Result<PathBuf> {
        self.scratch.temp_dir(path)
    }

    pub fn temp_file(&self, path: &str) -> Result<PathBuf> {
        self.scratch.temp_file(path)
    }

    pub fn scratch(&self) -> &ScratchRegistry {
        &self.scratch
    }

    // --- resource & assets ------------------------------------------------

    pub fn resource(&self) -> &ResourceStore {
        &self.resource
    }

    pub fn assets(&self) -> &AssetCache {
        &self.assets
    }

    /// Loads (once per session) and returns the asset `asset`.
    pub fn asset(&mut self, asset: &AssetRef) -> Result<&Asset> {
        self.assets.get(&asset.asset_type, &asset.release)
    }

    pub fn load_spec(&self) -> Result<ResourceSpec> {
        self.resource.get()
    }

    /// Validates `spec` and persists it under the resource lock.
    pub fn update_spec(&mut self, spec: &ResourceSpec) -> Result<()> {
        self.resource.update(spec, &mut self.assets, &self.scratch)
    }

    /// Validates `spec` without persisting it.
    pub fn check_spec(&mut self, spec: &ResourceSpec) -> Result<()> {
        self.resource.schema_check(spec, &mut self.assets)
    }

    /// Takes one level of the resource lock.
    pub fn lock(&self) -> Result<LockGuard> {
        self.resource.lock().guard()
    }

    // --- teardown ---------------------------------------------------------

    pub fn teardown_handle(&self) -> TeardownHandle {
        self.teardown.clone()
    }

    /// Releases the resource lock and removes scratch paths. Runs once.
    pub fn teardown(&self) -> bool {
        self.teardown.run()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown.run();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("resource", &self.resource_id())
            .field("cluster", &self.options.cluster)
            .field("deadline", &self.deadline)
            .field("rotated", &self.rotated)
            .finish()
    }
}
