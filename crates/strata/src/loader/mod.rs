//! Dynamic loading of module plugins.
//!
//! A module's generated ABI is a static [`ModuleAbi`] table: one [`Slot`]
//! per function a plugin may export, plus optional init and close hooks.
//! Loading opens a shared object through an [`ObjectOpener`], runs the init
//! hook, and rebinds every slot whose symbol the object exports. Slots of
//! missing symbols keep their stubs, so a partial plugin degrades to
//! "not implemented" errors function by function.
//!
//! Slots are process-wide statics. At most one [`LoadedModule`] per module
//! may be alive at a time; the registry guarantees this for its own loads.
//!
//! Two backends are provided:
//!
//! - [`DynamicLibraries`] opens real shared objects with `libloading`.
//! - [`MemoryObjects`] serves in-process symbol tables, for statically linked
//!   plugins and tests.

mod dynamic;
mod memory;
mod slot;

pub use dynamic::DynamicLibraries;
pub use memory::{MemoryObject, MemoryObjects};
pub use slot::{Slot, SlotBinding, SymbolAddress};

use crate::error::LoadError;
use crate::log::Diagnostics;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Signature of a module initializer.
pub type InitHook = unsafe extern "C" fn() -> bool;

/// Signature of a module finalizer.
pub type CloseHook = unsafe extern "C" fn();

/// An opened shared object.
pub trait SharedObject: Send {
    /// Address of `symbol`, if the object exports it.
    fn resolve(&self, symbol: &str) -> Option<SymbolAddress>;

    /// Close the object. Errors carry the platform loader's diagnostic.
    fn close(self: Box<Self>) -> Result<(), String>;
}

/// Opens shared objects by path.
pub trait ObjectOpener: Send + Sync {
    /// Open `path`. Errors carry the platform loader's diagnostic.
    fn open(&self, path: &Path) -> Result<Box<dyn SharedObject>, String>;
}

/// The generated ABI of one module.
pub struct ModuleAbi {
    pub name: &'static str,

    /// Prefix of every symbol of the module.
    pub prefix: &'static str,

    pub init_symbol: Option<&'static str>,
    pub close_symbol: Option<&'static str>,

    /// One slot per dynamically bound function.
    pub slots: &'static [&'static dyn SlotBinding],
}

impl ModuleAbi {
    /// The slot bound from `symbol`.
    pub fn slot(&self, symbol: &str) -> Option<&'static dyn SlotBinding> {
        self.slots.iter().copied().find(|slot| slot.symbol() == symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.slots.iter().map(|slot| slot.symbol())
    }

    /// Point every slot back at its stub.
    pub fn revert_all(&self) {
        for slot in self.slots {
            slot.revert();
        }
    }

    /// Whether any slot of the module is bound.
    pub fn any_bound(&self) -> bool {
        self.slots.iter().any(|slot| slot.is_bound())
    }
}

impl fmt::Debug for ModuleAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleAbi")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("init_symbol", &self.init_symbol)
            .field("close_symbol", &self.close_symbol)
            .field("slots", &self.symbols().collect::<Vec<_>>())
            .finish()
    }
}

/// Whether a symbol was bound from the object or left on its stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolState {
    Bound,
    Stub,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// A module whose object is open and whose slots are bound.
///
/// Dropping it reverts the slots, runs the close hook and closes the object.
pub struct LoadedModule {
    abi: &'static ModuleAbi,
    path: PathBuf,
    object: Option<Box<dyn SharedObject>>,
    symbols: Vec<(&'static str, SymbolState)>,
    instance: u64,
}

impl LoadedModule {
    pub fn name(&self) -> &'static str {
        self.abi.name
    }

    pub fn abi(&self) -> &'static ModuleAbi {
        self.abi
    }

    /// Path the object was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identifies this load; a reload yields a new instance.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn symbols(&self) -> &[(&'static str, SymbolState)] {
        &self.symbols
    }

    /// Symbols the object does not export.
    pub fn missing_symbols(&self) -> Vec<&'static str> {
        self.symbols
            .iter()
            .filter(|(_, state)| *state == SymbolState::Stub)
            .map(|(symbol, _)| *symbol)
            .collect()
    }

    pub fn symbol_state(&self, symbol: &str) -> Option<SymbolState> {
        self.symbols
            .iter()
            .find(|(name, _)| *name == symbol)
            .map(|(_, state)| *state)
    }

    fn shutdown(&mut self, diagnostics: &Diagnostics) -> bool {
        let Some(object) = self.object.take() else {
            return true;
        };

        self.abi.revert_all();
        run_close_hook(self.abi, object.as_ref(), diagnostics);

        match object.close() {
            Ok(()) => {
                diagnostics.debug(&format!(
                    "Unloaded the '{}' plugin from {}",
                    self.abi.name,
                    self.path.display()
                ));
                true
            }
            Err(reason) => {
                diagnostics.warning(&format!(
                    "Failed to close the '{}' plugin {}: {}",
                    self.abi.name,
                    self.path.display(),
                    reason
                ));
                false
            }
        }
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        self.shutdown(&crate::log::process());
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.abi.name)
            .field("path", &self.path)
            .field("instance", &self.instance)
            .field("symbols", &self.symbols)
            .finish()
    }
}

fn run_close_hook(abi: &ModuleAbi, object: &dyn SharedObject, diagnostics: &Diagnostics) {
    let Some(symbol) = abi.close_symbol else {
        return;
    };
    match object.resolve(symbol) {
        Some(address) => {
            let hook = unsafe { address.cast::<CloseHook>() };
            unsafe { hook() };
        }
        None => diagnostics.debug(&format!(
            "The '{}' plugin has no finalizer '{}'",
            abi.name, symbol
        )),
    }
}

/// Open `path` and bind the module's slots to the symbols it exports.
///
/// A failing init hook closes the object again. Missing symbols are logged
/// and left on their stubs.
pub fn load_module(
    abi: &'static ModuleAbi,
    opener: &dyn ObjectOpener,
    path: &Path,
    diagnostics: &Diagnostics,
) -> Result<LoadedModule, LoadError> {
    let object = opener.open(path).map_err(|reason| {
        diagnostics.debug(&format!(
            "Failed to open {} for the '{}' plugin: {}",
            path.display(),
            abi.name,
            reason
        ));
        LoadError::OpenFailed {
            module: abi.name.to_string(),
            path: path.to_path_buf(),
            reason,
        }
    })?;

    if let Some(symbol) = abi.init_symbol {
        match object.resolve(symbol) {
            Some(address) => {
                let hook = unsafe { address.cast::<InitHook>() };
                if !unsafe { hook() } {
                    if let Err(reason) = object.close() {
                        diagnostics.warning(&format!(
                            "Failed to close {} after its initializer failed: {}",
                            path.display(),
                            reason
                        ));
                    }
                    return Err(LoadError::InitHookFailed {
                        module: abi.name.to_string(),
                        path: path.to_path_buf(),
                    });
                }
            }
            None => diagnostics.debug(&format!(
                "The '{}' plugin has no initializer '{}', skipping",
                abi.name, symbol
            )),
        }
    }

    let mut symbols = Vec::with_capacity(abi.slots.len());
    for slot in abi.slots {
        let symbol = slot.symbol();
        match object.resolve(symbol) {
            Some(address) => {
                slot.bind(address);
                symbols.push((symbol, SymbolState::Bound));
            }
            None => {
                slot.revert();
                let missing = LoadError::SymbolMissing {
                    symbol: symbol.to_string(),
                    path: path.to_path_buf(),
                };
                diagnostics.warning(&format!("{missing}; calls will report 'not implemented'"));
                symbols.push((symbol, SymbolState::Stub));
            }
        }
    }

    let module = LoadedModule {
        abi,
        path: path.to_path_buf(),
        object: Some(object),
        symbols,
        instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
    };
    diagnostics.info(&format!(
        "Loaded the '{}' plugin from {} ({} of {} functions)",
        abi.name,
        path.display(),
        module.symbols.len() - module.missing_symbols().len(),
        module.symbols.len()
    ));
    Ok(module)
}

/// Revert the module's slots, run its close hook and close its object.
///
/// Returns whether the object closed cleanly.
pub fn unload_module(mut module: LoadedModule, diagnostics: &Diagnostics) -> bool {
    module.shutdown(diagnostics)
}
