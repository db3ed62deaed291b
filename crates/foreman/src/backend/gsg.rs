//! Object-store transport over the `gsg` command-line tool.
//!
//! Store paths are relative to a `gs://` base. Lock objects are created with
//! `gsg lock`; older tool versions take no TTL and are released with `gsg rm`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use super::command::Invocation;
use super::RemoteBundleStore;
use crate::error::{ForemanError, Result};

/// What the installed `gsg` supports for lock objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCapability {
    /// `gsg lock <path> <ttl>` and `gsg unlock <path>`.
    Ttl,
    /// `gsg lock <path>` only; locks are removed with `gsg rm`.
    NoTtl,
}

impl LockCapability {
    /// Asks `gsg help lock` whether a TTL argument is accepted.
    pub fn probe(gsg: &str) -> Self {
        match Invocation::new(gsg).args(["help", "lock"]).run() {
            Ok(help) if help.contains("ttl") => LockCapability::Ttl,
            Ok(_) => LockCapability::NoTtl,
            Err(e) => {
                log::warn!("cannot probe {} lock support, assuming no ttl: {}", gsg, e);
                LockCapability::NoTtl
            }
        }
    }
}

fn is_missing(err: &ForemanError) -> bool {
    match err {
        ForemanError::Command { message, .. } => {
            message.contains("No URLs matched")
                || message.contains("NotFound")
                || message.contains("not found")
        }
        _ => false,
    }
}

pub struct GsgBundleStore {
    gsg: String,
    base: String,
    capability: LockCapability,
}

impl GsgBundleStore {
    /// Creates the store, probing the tool's lock capability once.
    pub fn new(gsg: impl Into<String>, base: impl Into<String>) -> Self {
        let gsg = gsg.into();
        let capability = LockCapability::probe(&gsg);
        log::debug!("{} lock capability: {:?}", gsg, capability);
        Self::with_capability(gsg, base, capability)
    }

    pub fn with_capability(
        gsg: impl Into<String>,
        base: impl Into<String>,
        capability: LockCapability,
    ) -> Self {
        Self {
            gsg: gsg.into(),
            base: base.into().trim_end_matches('/').to_string(),
            capability,
        }
    }

    pub fn capability(&self) -> LockCapability {
        self.capability
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Full URL of a store path.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// Store path of a listed URL, or `None` if it lies outside the base.
    fn relative(&self, url: &str) -> Option<String> {
        url.strip_prefix(&self.base)
            .map(|rest| rest.trim_matches('/').to_string())
            .filter(|rest| !rest.is_empty())
    }

    fn gsg(&self) -> Invocation<'_> {
        Invocation::new(&self.gsg)
    }
}

impl RemoteBundleStore for GsgBundleStore {
    fn fetch(&self, asset_type: &str, release: &str, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).map_err(|e| ForemanError::io(dest, e))?;
        let src = self.url(&format!("assets/{}/releases/{}", asset_type, release));
        self.gsg()
            .args(["-m", "rsync", "-r"])
            .arg(src.as_str())
            .arg(dest.to_string_lossy())
            .run()
            .map_err(|e| {
                if is_missing(&e) {
                    ForemanError::NotFound { what: src.clone() }
                } else {
                    e
                }
            })?;
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        match self.gsg().arg("ls").arg(self.url(path)).run() {
            Ok(out) => Ok(!out.trim().is_empty()),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// `gsg lock` fails when the object already exists; that is contention.
    fn lock(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut invocation = self.gsg().arg("lock").arg(self.url(key));
        if self.capability == LockCapability::Ttl {
            invocation = invocation.arg(ttl.as_secs().max(1).to_string());
        }
        invocation.run().map(|_| ()).map_err(|e| {
            log::debug!("lock {} not taken: {}", key, e);
            ForemanError::LockContention {
                key: key.to_string(),
            }
        })
    }

    fn unlock(&self, key: &str) -> Result<()> {
        let verb = match self.capability {
            LockCapability::Ttl => "unlock",
            LockCapability::NoTtl => "rm",
        };
        match self.gsg().arg(verb).arg(self.url(key)).run() {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn read(&self, path: &str) -> Result<String> {
        self.gsg()
            .arg("cat")
            .arg(self.url(path))
            .run()
            .map_err(|e| {
                if is_missing(&e) {
                    ForemanError::NotFound {
                        what: path.to_string(),
                    }
                } else {
                    e
                }
            })
    }

    fn upload(&self, local: &Path, path: &str) -> Result<()> {
        self.gsg()
            .arg("cp")
            .arg(local.to_string_lossy())
            .arg(self.url(path))
            .run()?;
        fs::remove_file(local).map_err(|e| ForemanError::io(local, e))
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.gsg()
            .arg("rm")
            .arg(self.url(path))
            .run()
            .map(|_| ())
            .map_err(|e| {
                if is_missing(&e) {
                    ForemanError::NotFound {
                        what: path.to_string(),
                    }
                } else {
                    e
                }
            })
    }

    /// A failing listing is treated as an empty one.
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let url = format!("{}/", self.url(prefix).trim_end_matches('/'));
        let out = match self.gsg().arg("ls").arg(url.as_str()).run() {
            Ok(out) => out,
            Err(e) => {
                log::debug!("listing {} failed: {}", url, e);
                return Ok(Vec::new());
            }
        };
        let mut paths: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter_map(|line| self.relative(line))
            .collect();
        paths.sort();
        Ok(paths)
    }
}
