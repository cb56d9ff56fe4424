//! In-process symbol tables served as shared objects.

use super::{ObjectOpener, SharedObject, SymbolAddress};
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// The symbols of one in-memory object.
#[derive(Debug, Clone, Default)]
pub struct MemoryObject {
    symbols: HashMap<String, SymbolAddress>,
}

impl MemoryObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `address` as `symbol`. Null addresses are ignored.
    ///
    /// Callers pass an `extern "C" fn` whose signature matches the symbol's
    /// declaration, cast to a pointer.
    pub fn with_symbol(mut self, symbol: &str, address: *const c_void) -> Self {
        if let Some(address) = SymbolAddress::new(address) {
            self.symbols.insert(symbol.to_string(), address);
        }
        self
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }
}

#[derive(Debug, Default)]
struct Registry {
    objects: HashMap<PathBuf, MemoryObject>,
    open: HashMap<PathBuf, usize>,
}

/// An [`ObjectOpener`] serving [`MemoryObject`]s registered under paths.
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjects {
    inner: Arc<Mutex<Registry>>,
}

impl MemoryObjects {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `object` under `path`, replacing any previous object.
    ///
    /// Handles already open keep the symbols they were opened with.
    pub fn insert(&self, path: impl Into<PathBuf>, object: MemoryObject) {
        self.registry().objects.insert(path.into(), object);
    }

    /// Remove the object at `path`; later opens fail.
    pub fn remove(&self, path: impl AsRef<Path>) -> Option<MemoryObject> {
        self.registry().objects.remove(path.as_ref())
    }

    /// Number of open handles on `path`.
    pub fn open_count(&self, path: impl AsRef<Path>) -> usize {
        self.registry().open.get(path.as_ref()).copied().unwrap_or(0)
    }
}

impl ObjectOpener for MemoryObjects {
    fn open(&self, path: &Path) -> Result<Box<dyn SharedObject>, String> {
        let mut registry = self.registry();
        let object = registry
            .objects
            .get(path)
            .cloned()
            .ok_or_else(|| format!("{}: cannot open shared object file: No such file or directory", path.display()))?;
        *registry.open.entry(path.to_path_buf()).or_insert(0) += 1;

        Ok(Box::new(MemoryHandle {
            path: path.to_path_buf(),
            object,
            owner: self.clone(),
        }))
    }
}

struct MemoryHandle {
    path: PathBuf,
    object: MemoryObject,
    owner: MemoryObjects,
}

impl SharedObject for MemoryHandle {
    fn resolve(&self, symbol: &str) -> Option<SymbolAddress> {
        self.object.symbols.get(symbol).copied()
    }

    fn close(self: Box<Self>) -> Result<(), String> {
        let mut registry = self.owner.registry();
        match registry.open.get_mut(&self.path) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Ok(())
            }
            _ => Err(format!("{}: not open", self.path.display())),
        }
    }
}
