//! # Foundation Cache
//!
//! Process-wide arena for expensive, read-only resources (pretrained vector
//! tables, character language models, transformer encoders). Entries are keyed
//! by resource kind, canonical path and an optional variant (load options that
//! change the loaded value), loaded at most once, and handed out as
//! shared `Arc` handles that are never invalidated.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::{ArborError, Result};

type Entry = Arc<dyn Any + Send + Sync>;
type Key = (&'static str, PathBuf, String);

/// Shared cache of loaded foundation resources.
#[derive(Default)]
pub struct FoundationCache {
    entries: Mutex<HashMap<Key, Entry>>,
}

impl FoundationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached resource for `(kind, path)`, loading it with `load` on
    /// first use.
    ///
    /// The lock is held while `load` runs, so concurrent requests for any key
    /// wait for the first load to finish instead of loading twice.
    pub fn get_or_load<T, F>(&self, kind: &'static str, path: &Path, load: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce(&Path) -> Result<T>,
    {
        self.get_or_load_variant(kind, path, "", load)
    }

    /// Like [`FoundationCache::get_or_load`], with `variant` as part of the
    /// key. Two loads of one file with different options stay separate.
    pub fn get_or_load_variant<T, F>(&self, kind: &'static str, path: &Path, variant: &str, load: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce(&Path) -> Result<T>,
    {
        let key = (kind, canonical_key(path), variant.to_string());
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ArborError::Model("foundation cache lock poisoned".into()))?;

        if let Some(entry) = entries.get(&key) {
            debug!(kind, path = %key.1.display(), variant, "foundation cache hit");
            return Arc::clone(entry).downcast::<T>().map_err(|_| {
                ArborError::Configuration(format!(
                    "cached {kind} resource at {} has a different type",
                    key.1.display()
                ))
            });
        }

        info!(kind, path = %key.1.display(), variant, "loading foundation resource");
        let value = Arc::new(load(&key.1)?);
        entries.insert(key, value.clone() as Entry);
        Ok(value)
    }

    /// Whether a resource is already loaded.
    pub fn contains(&self, kind: &'static str, path: &Path) -> bool {
        self.entries
            .lock()
            .map(|entries| {
                let path = canonical_key(path);
                entries.keys().any(|(k, p, _)| *k == kind && *p == path)
            })
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for FoundationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FoundationCache")
            .field("entries", &self.len())
            .finish()
    }
}

/// Absolute form of `path`. A path that does not exist (yet, or any more)
/// is normalised lexically and resolved through its deepest existing
/// ancestor, so it maps to the same key once the file appears.
fn canonical_key(path: &Path) -> PathBuf {
    if let Ok(path) = std::fs::canonicalize(path) {
        return path;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let normalized = normalize_lexically(&absolute);
    for ancestor in normalized.ancestors().skip(1) {
        if let (Ok(base), Ok(rest)) = (std::fs::canonicalize(ancestor), normalized.strip_prefix(ancestor)) {
            return base.join(rest);
        }
    }
    normalized
}

/// Drops `.` and folds `..` into its parent without touching the disk.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out
}
