use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use cadence_error::CadenceError;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::store;

pub type PermissionEntries = BTreeMap<String, BTreeSet<String>>;

/// Persisted map of permission kind to the patterns the user always allows.
///
/// Reads never wait on a write in progress: a merge builds the new map aside,
/// persists it, and only then swaps it in.
#[derive(Debug)]
pub struct PermissionMemory {
    path: PathBuf,
    entries: RwLock<PermissionEntries>,
    write_lock: Mutex<()>,
}

impl PermissionMemory {
    pub fn new(path: impl Into<PathBuf>, entries: PermissionEntries) -> Self {
        Self {
            path: path.into(),
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
        }
    }

    /// Loads the stored map; a missing or malformed file starts empty.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = store::read_json_document(&path)
            .await
            .map(entries_from_value)
            .unwrap_or_default();
        Self::new(path, entries)
    }

    /// Like [`load`](Self::load), but when no memory file exists yet it seeds
    /// one from the `permissionMemory` field of the first settings document
    /// in `legacy` that has a non-empty one.
    pub async fn load_or_import(path: impl Into<PathBuf>, legacy: &[PathBuf]) -> Self {
        let path = path.into();
        if tokio::fs::try_exists(&path).await.unwrap_or(true) {
            return Self::load(path).await;
        }

        for source in legacy {
            let entries = store::read_json_document(source)
                .await
                .and_then(|mut document| document.get_mut("permissionMemory").map(Value::take))
                .map(entries_from_value)
                .unwrap_or_default();
            if entries.is_empty() {
                continue;
            }
            match store::write_json_atomic(&path, &entries).await {
                Ok(()) => tracing::info!(
                    source = %source.display(),
                    permissions = entries.len(),
                    "imported permission memory from settings"
                ),
                Err(err) => tracing::warn!(
                    source = %source.display(),
                    error = %err,
                    "failed to write imported permission memory"
                ),
            }
            return Self::new(path, entries);
        }

        Self::new(path, PermissionEntries::new())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True iff `required` is non-empty and every pattern is remembered for
    /// `permission`.
    pub fn matches(&self, permission: &str, required: &[String]) -> bool {
        if required.is_empty() {
            return false;
        }
        let entries = self.read();
        let Some(stored) = entries.get(permission) else {
            return false;
        };
        required.iter().all(|pattern| stored.contains(pattern))
    }

    /// Unions `patterns` into the set for `permission` and persists before
    /// returning. On error the stored and in-memory maps are unchanged.
    ///
    /// Returns whether anything new was recorded.
    pub async fn merge(&self, permission: &str, patterns: &[String]) -> Result<bool, CadenceError> {
        let _guard = self.write_lock.lock().await;

        let mut next = self.snapshot();
        let entry = next.entry(permission.to_string()).or_default();
        let before = entry.len();
        entry.extend(patterns.iter().cloned());
        if entry.len() == before {
            return Ok(false);
        }

        store::write_json_atomic(&self.path, &next).await?;
        let added = patterns.len();
        *self.write() = next;
        tracing::debug!(permission, added, "permission memory updated");
        Ok(true)
    }

    pub fn snapshot(&self) -> PermissionEntries {
        self.read().clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, PermissionEntries> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, PermissionEntries> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn entries_from_value(value: Value) -> PermissionEntries {
    let Value::Object(map) = value else {
        tracing::warn!("permission memory is not an object; starting empty");
        return PermissionEntries::new();
    };
    map.into_iter()
        .filter_map(|(permission, patterns)| {
            let Value::Array(patterns) = patterns else {
                return None;
            };
            let patterns: BTreeSet<String> = patterns
                .into_iter()
                .filter_map(|pattern| match pattern {
                    Value::String(pattern) => Some(pattern),
                    _ => None,
                })
                .collect();
            Some((permission, patterns))
        })
        .collect()
}
