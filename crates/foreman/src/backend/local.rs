//! Directory-backed bundle store for local development.
//!
//! Objects are plain files below the root. Locks are files created with
//! `create_new` whose content is their RFC 3339 expiry time.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use super::RemoteBundleStore;
use crate::error::{ForemanError, Result};

/// Move a file from `src` to `dst`. Uses `rename` first and falls back to
/// copy + delete for cross-device moves.
fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).map_err(|e| ForemanError::io(dst, e))?;
    fs::remove_file(src).map_err(|e| ForemanError::io(src, e))?;
    Ok(())
}

pub struct LocalBundleStore {
    root: PathBuf,
}

impl LocalBundleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ForemanError::Store(format!(
                "path escapes the store root: {}",
                path
            )));
        }
        Ok(self.root.join(relative))
    }

    fn create_lock(&self, file: &Path, ttl: Duration) -> std::io::Result<()> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let expiry = Utc::now() + ttl;
        let mut handle = OpenOptions::new().write(true).create_new(true).open(file)?;
        handle.write_all(expiry.to_rfc3339().as_bytes())
    }

    fn lock_expired(file: &Path) -> bool {
        match fs::read_to_string(file) {
            Ok(content) => DateTime::parse_from_rfc3339(content.trim())
                .map(|expiry| expiry.with_timezone(&Utc) <= Utc::now())
                .unwrap_or(true),
            Err(e) => e.kind() == ErrorKind::NotFound,
        }
    }
}

impl RemoteBundleStore for LocalBundleStore {
    fn fetch(&self, asset_type: &str, release: &str, dest: &Path) -> Result<()> {
        let src = self.resolve(&format!("assets/{}/releases/{}", asset_type, release))?;
        if !src.is_dir() {
            return Err(ForemanError::NotFound {
                what: format!("asset {}/{} under {}", asset_type, release, self.root.display()),
            });
        }
        for entry in WalkDir::new(&src) {
            let entry = entry.map_err(|e| ForemanError::Store(e.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(&src)
                .map_err(|e| ForemanError::Store(e.to_string()))?;
            let target = dest.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).map_err(|e| ForemanError::io(&target, e))?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| ForemanError::io(parent, e))?;
                }
                fs::copy(entry.path(), &target).map_err(|e| ForemanError::io(&target, e))?;
            }
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.exists())
    }

    fn lock(&self, key: &str, ttl: Duration) -> Result<()> {
        let file = self.resolve(key)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).map_err(|e| ForemanError::io(parent, e))?;
        }
        match self.create_lock(&file, ttl) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() != ErrorKind::AlreadyExists => {
                return Err(ForemanError::io(&file, e))
            }
            Err(_) => {}
        }
        if !Self::lock_expired(&file) {
            return Err(ForemanError::LockContention {
                key: key.to_string(),
            });
        }
        tracing::debug!("lock {} expired, taking over", key);
        match fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(ForemanError::io(&file, e)),
        }
        match self.create_lock(&file, ttl) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(ForemanError::LockContention {
                key: key.to_string(),
            }),
            Err(e) => Err(ForemanError::io(&file, e)),
        }
    }

    fn unlock(&self, key: &str) -> Result<()> {
        let file = self.resolve(key)?;
        match fs::remove_file(&file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ForemanError::io(&file, e)),
        }
    }

    fn read(&self, path: &str) -> Result<String> {
        let file = self.resolve(path)?;
        fs::read_to_string(&file).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ForemanError::NotFound {
                what: path.to_string(),
            },
            _ => ForemanError::io(&file, e),
        })
    }

    fn upload(&self, local: &Path, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| ForemanError::io(parent, e))?;
        }
        move_file(local, &target)
    }

    fn remove(&self, path: &str) -> Result<()> {
        let file = self.resolve(path)?;
        fs::remove_file(&file).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ForemanError::NotFound {
                what: path.to_string(),
            },
            _ => ForemanError::io(&file, e),
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ForemanError::io(&dir, e)),
        };
        let prefix = prefix.trim_end_matches('/');
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ForemanError::io(&dir, e))?;
            paths.push(format!("{}/{}", prefix, entry.file_name().to_string_lossy()));
        }
        paths.sort();
        Ok(paths)
    }
}
