//! Shared objects opened through the platform loader.

use super::{ObjectOpener, SharedObject, SymbolAddress};
use libloading::Library;
use std::ffi::c_void;
use std::path::Path;
use tracing::debug;

/// Opens real shared libraries (`dlopen` / `LoadLibrary`).
///
/// A bare file name is looked up through the platform search path; anything
/// with a directory component is opened as given.
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLibraries;

impl DynamicLibraries {
    pub fn new() -> Self {
        Self
    }
}

impl ObjectOpener for DynamicLibraries {
    fn open(&self, path: &Path) -> Result<Box<dyn SharedObject>, String> {
        debug!("Opening shared object {}", path.display());
        // Initializers of the object run here; plugins are trusted code.
        let library = unsafe { Library::new(path) }.map_err(|e| e.to_string())?;
        Ok(Box::new(DynamicLibrary { library }))
    }
}

struct DynamicLibrary {
    library: Library,
}

impl SharedObject for DynamicLibrary {
    fn resolve(&self, symbol: &str) -> Option<SymbolAddress> {
        let address = unsafe { self.library.get::<*mut c_void>(symbol.as_bytes()) }.ok()?;
        SymbolAddress::new(*address)
    }

    fn close(self: Box<Self>) -> Result<(), String> {
        self.library.close().map_err(|e| e.to_string())
    }
}
