//! # strata-codegen
//!
//! Turns a module's symbol manifest into the Rust glue that lets strata call
//! plugin functions which may or may not exist at runtime.
//!
//! For every function a plugin may export, the generated source holds:
//!
//! - a **stub** that reports "not implemented" through the error channel and
//!   returns the type's default value;
//! - a **slot** that starts out pointing at the stub and is rebound when a
//!   shared object exporting the symbol is loaded;
//! - a **trampoline**, the public function callers use, which always goes
//!   through the slot.
//!
//! The module also gets a `MODULE` ABI table, `load`/`unload` functions
//! that hand the table to the strata loader, and a `checked` submodule whose
//! wrappers call each trampoline through a strata `DispatchProxy`.
//!
//! ## Usage
//!
//! From a build script:
//!
//! ```no_run
//! use strata_codegen::{generate, EmitOptions, ModuleManifest};
//! use std::path::Path;
//!
//! let manifest = ModuleManifest::from_file("swap", Path::new("manifests/swap.h")).unwrap();
//! let generated = generate(&manifest, &EmitOptions::default());
//! generated.write(Path::new("out"), "swap").unwrap();
//! ```
//!
//! Or from the command line:
//!
//! ```bash
//! strata-codegen manifests/swap.h --module swap --out-dir src/generated
//! ```

pub mod emit;
pub mod error;
pub mod manifest;
pub mod types;

pub use emit::{generate, EmitOptions, GeneratedModule};
pub use error::{ManifestError, ManifestResult};
pub use manifest::{FunctionDecl, ModuleManifest, Param, SizeConstant};
pub use types::{rust_ident, CType};
