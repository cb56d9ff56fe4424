//! Generated bindings of every module.
//!
//! Each submodule is produced by `strata-codegen` from `manifests/<name>.h`
//! at build time. It exposes the module's public functions (trampolines and
//! fixed helpers), its size constants, the `MODULE` ABI table, a `decls`
//! submodule with the symbol names and `extern "C"` signatures a plugin
//! implements, and a `checked` submodule whose wrappers return translated
//! [`crate::DispatchError`]s.
//!
//! Until a plugin is loaded every function reports "not implemented":
//!
//! ```
//! use strata::abi::swap;
//! use strata::ffi::RawError;
//!
//! let mut error = RawError::new();
//! let device = std::ffi::CString::new("/dev/vdb").unwrap();
//! assert!(!swap::swapon(&device, -1, &mut error));
//! assert!(error.take().unwrap().is_not_implemented());
//! ```

use crate::error::LoadError;
use crate::loader::{LoadedModule, ModuleAbi, ObjectOpener};
use crate::log::Diagnostics;
use crate::plugin::PluginName;
use std::path::Path;

macro_rules! generated_module {
    ($(#[$meta:meta])* $name:ident, $file:literal) => {
        $(#[$meta])*
        pub mod $name {
            /// Symbol names and signatures plugins implement.
            pub mod decls {
                include!(concat!(env!("OUT_DIR"), "/", $file, "_decls.rs"));
            }

            include!(concat!(env!("OUT_DIR"), "/", $file, ".rs"));
        }
    };
}

generated_module!(
    /// Logical volume management.
    lvm,
    "lvm"
);
generated_module!(
    /// Filesystem operations.
    fs,
    "fs"
);
generated_module!(
    /// Block device encryption.
    crypto,
    "crypto"
);
generated_module!(
    /// Software RAID.
    mdraid,
    "mdraid"
);
generated_module!(
    /// Swap space.
    swap,
    "swap"
);
generated_module!(
    /// Loop devices.
    loopdev,
    "loop"
);

/// ABI table of `name`.
pub fn module_abi(name: PluginName) -> &'static ModuleAbi {
    match name {
        PluginName::Lvm => &lvm::MODULE,
        PluginName::Fs => &fs::MODULE,
        PluginName::Crypto => &crypto::MODULE,
        PluginName::Mdraid => &mdraid::MODULE,
        PluginName::Swap => &swap::MODULE,
        PluginName::Loop => &loopdev::MODULE,
    }
}

pub(crate) fn load(
    name: PluginName,
    opener: &dyn ObjectOpener,
    path: &Path,
    diagnostics: &Diagnostics,
) -> Result<LoadedModule, LoadError> {
    match name {
        PluginName::Lvm => lvm::load(opener, path, diagnostics),
        PluginName::Fs => fs::load(opener, path, diagnostics),
        PluginName::Crypto => crypto::load(opener, path, diagnostics),
        PluginName::Mdraid => mdraid::load(opener, path, diagnostics),
        PluginName::Swap => swap::load(opener, path, diagnostics),
        PluginName::Loop => loopdev::load(opener, path, diagnostics),
    }
}

pub(crate) fn unload(name: PluginName, module: LoadedModule, diagnostics: &Diagnostics) -> bool {
    match name {
        PluginName::Lvm => lvm::unload(module, diagnostics),
        PluginName::Fs => fs::unload(module, diagnostics),
        PluginName::Crypto => crypto::unload(module, diagnostics),
        PluginName::Mdraid => mdraid::unload(module, diagnostics),
        PluginName::Swap => swap::unload(module, diagnostics),
        PluginName::Loop => loopdev::unload(module, diagnostics),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_match_manifests() {
        for name in PluginName::ALL {
            let abi = module_abi(name);
            assert_eq!(abi.name, name.as_str());
            assert!(!abi.slots.is_empty());
            for symbol in abi.symbols() {
                assert!(symbol.starts_with(abi.prefix), "{symbol} lacks prefix {}", abi.prefix);
            }
        }
        assert_eq!(swap::MODULE.init_symbol, Some("strata_swap_init"));
        assert_eq!(loopdev::MODULE.init_symbol, None);
        assert_eq!(mdraid::MODULE.prefix, "strata_md_");
    }

    #[test]
    fn test_constants_expanded() {
        assert_eq!(swap::STRATA_SWAP_SIGNATURE_AREA, 4096);
        assert_eq!(lvm::STRATA_LVM_DEFAULT_PE_SIZE, 4 * 1024 * 1024);
        assert_eq!(crypto::STRATA_CRYPTO_LUKS2_METADATA_SIZE, 16 << 20);
        assert_eq!(mdraid::decls::STRATA_MD_DEFAULT_CHUNK_SIZE, 512 * 1024);
    }

    #[test]
    fn test_fixed_helpers_need_no_plugin() {
        assert!(lvm::is_valid_pe_size(4 * 1024 * 1024));
        assert!(!lvm::is_valid_pe_size(3 * 1024 * 1024));
        assert!(!lvm::is_valid_pe_size(512));
        assert_eq!(lvm::clamp_thpool_md_size(1), lvm::STRATA_LVM_MIN_THPOOL_MD_SIZE);
        assert!(swap::fits_device(1 << 20));
        assert!(!swap::fits_device(4096));
        assert!(crypto::can_format(crate::ffi::StrataLuksVersion::Luks2));
        assert!(!crypto::can_format(crate::ffi::StrataLuksVersion::Unknown));
    }

    #[test]
    fn test_keyword_parameters_are_callable() {
        let device = std::ffi::CString::new("/dev/loop0").unwrap();
        let mut error = crate::ffi::RawError::new();
        assert!(!loopdev::teardown(&device, &mut error));
        assert!(error.take().unwrap().is_not_implemented());
    }

    #[test]
    fn test_symbol_constants() {
        assert_eq!(swap::decls::STRATA_SWAP_MKSWAP_SYMBOL, "strata_swap_mkswap");
        assert_eq!(fs::decls::STRATA_FS_TECH_NAME_SYMBOL, "strata_fs_tech_name");
    }
}
