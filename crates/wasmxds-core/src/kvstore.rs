//! External key/value stores referenced by configuration values.

use crate::CoreError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// The two logically distinct stores a reference can point into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKind {
    ConfigMap,
    Secret,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::ConfigMap => "configmap",
            StoreKind::Secret => "secret",
        }
    }

    fn dir_name(self) -> &'static str {
        match self {
            StoreKind::ConfigMap => "configmaps",
            StoreKind::Secret => "secrets",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named object in a key/value store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvObject {
    pub data: BTreeMap<String, Vec<u8>>,
}

impl KvObject {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.to_owned(), value.into());
        self
    }
}

pub trait KeyValueStore: Send + Sync {
    /// Fetch the object `namespace/name` from the store of `kind`.
    ///
    /// A missing object is [`CoreError::LookupFailed`].
    fn get(&self, kind: StoreKind, namespace: &str, name: &str) -> Result<KvObject, CoreError>;
}

fn lookup_failed(kind: StoreKind, namespace: &str, name: &str, reason: impl ToString) -> CoreError {
    CoreError::LookupFailed {
        kind,
        namespace: namespace.to_owned(),
        name: name.to_owned(),
        reason: reason.to_string(),
    }
}

/// In-memory store, seeded programmatically.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<(StoreKind, String, String), KvObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kind: StoreKind, namespace: &str, name: &str, object: KvObject) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, namespace.to_owned(), name.to_owned()), object);
    }

    pub fn remove(&self, kind: StoreKind, namespace: &str, name: &str) -> Option<KvObject> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, namespace.to_owned(), name.to_owned()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, kind: StoreKind, namespace: &str, name: &str) -> Result<KvObject, CoreError> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| lookup_failed(kind, namespace, name, "not found"))
    }
}

/// Directory-backed store: `<root>/{configmaps,secrets}/<namespace>/<name>/<key>`.
///
/// Each regular file in an object directory is one key. Dot-files are
/// skipped, so mounted-volume bookkeeping entries never show up as keys.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_dir(&self, kind: StoreKind, namespace: &str, name: &str) -> PathBuf {
        self.root.join(kind.dir_name()).join(namespace).join(name)
    }
}

fn is_plain_component(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\'])
}

impl KeyValueStore for DirStore {
    fn get(&self, kind: StoreKind, namespace: &str, name: &str) -> Result<KvObject, CoreError> {
        if !is_plain_component(namespace) || !is_plain_component(name) {
            return Err(lookup_failed(kind, namespace, name, "invalid object name"));
        }
        let dir = self.object_dir(kind, namespace, name);
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                lookup_failed(kind, namespace, name, "not found")
            } else {
                lookup_failed(kind, namespace, name, format!("{}: {e}", dir.display()))
            }
        })?;

        let mut object = KvObject::new();
        for entry in entries {
            let entry = entry.map_err(|e| lookup_failed(kind, namespace, name, e))?;
            let key = entry.file_name().to_string_lossy().into_owned();
            if key.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let value = std::fs::read(&path)
                .map_err(|e| lookup_failed(kind, namespace, name, format!("{}: {e}", path.display())))?;
            object.data.insert(key, value);
        }
        Ok(object)
    }
}
