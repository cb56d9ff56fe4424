//! # strata
//!
//! Plugin runtime for a modular storage library.
//!
//! Each functional area (LVM, filesystems, encryption, MD RAID, swap, loop
//! devices) is implemented by a separately built shared object. strata finds
//! those objects, loads them and binds their functions into a stable API,
//! so a missing plugin, or a plugin missing a few functions, degrades to
//! "not implemented" errors instead of failing to link.
//!
//! ## Architecture
//!
//! ```text
//!  manifests/<module>.h ──► strata-codegen (build.rs) ──► abi::<module>
//!                                                          │ stubs, slots,
//!                                                          │ trampolines
//!  Runtime (registry) ──► loader ──► ObjectOpener ──► libstrata_<module>.so
//!       │                  │
//!       │                  └─ rebinds / reverts slots
//!       └─ config (conf.d/*.toml, $STRATA_PLUGIN_PATH)
//!
//!  caller ──► DispatchProxy ──► abi::<module>::<fn> ──► slot ──► plugin
//!                  └─ translates GenericError into DispatchError
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use strata::{all_plugins, PluginName, Runtime};
//!
//! let runtime = Runtime::from_env()?;
//! if !runtime.try_init(&all_plugins(), None) {
//!     eprintln!("some plugins failed to load");
//! }
//! println!("available: {:?}", runtime.available_plugin_names());
//! if runtime.is_plugin_available(PluginName::Swap) {
//!     println!("swap from {:?}", runtime.plugin_soname(PluginName::Swap));
//! }
//! # Ok::<(), strata::RegistryError>(())
//! ```

pub mod abi;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ffi;
pub mod loader;
pub mod log;
pub mod plugin;
pub mod registry;

pub use config::{RuntimeConfig, SonameSource};
pub use dispatch::{DispatchError, DispatchProxy, ErrorKind, ModuleError};
pub use error::{ConfigError, LoadError, RegistryError, RuntimeResult};
pub use ffi::{ErrorDomain, GenericError, RawError};
pub use log::{LogSink, Severity};
pub use plugin::{all_plugins, PluginName, PluginSpec};
pub use registry::{PluginInfo, PluginState, Runtime};
