//! Module names and plugin requests.

use crate::ffi::ErrorDomain;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of functional areas a plugin can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginName {
    Lvm,
    Fs,
    Crypto,
    Mdraid,
    Swap,
    Loop,
}

impl PluginName {
    /// Every module, in load order.
    pub const ALL: [PluginName; 6] = [
        PluginName::Lvm,
        PluginName::Fs,
        PluginName::Crypto,
        PluginName::Mdraid,
        PluginName::Swap,
        PluginName::Loop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginName::Lvm => "lvm",
            PluginName::Fs => "fs",
            PluginName::Crypto => "crypto",
            PluginName::Mdraid => "mdraid",
            PluginName::Swap => "swap",
            PluginName::Loop => "loop",
        }
    }

    /// Domain of errors raised by this module's plugins.
    pub fn error_domain(&self) -> ErrorDomain {
        match self {
            PluginName::Lvm => ErrorDomain::LVM,
            PluginName::Fs => ErrorDomain::FS,
            PluginName::Crypto => ErrorDomain::CRYPTO,
            PluginName::Mdraid => ErrorDomain::MDRAID,
            PluginName::Swap => ErrorDomain::SWAP,
            PluginName::Loop => ErrorDomain::LOOP,
        }
    }

    /// Soname tried when neither the request nor configuration names one,
    /// e.g. `libstrata_swap.so` on Linux.
    pub fn default_soname(&self) -> String {
        format!(
            "{}strata_{}{}",
            std::env::consts::DLL_PREFIX,
            self.as_str(),
            std::env::consts::DLL_SUFFIX
        )
    }
}

impl fmt::Display for PluginName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a module name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown plugin name: {0}")]
pub struct UnknownPlugin(pub String);

impl FromStr for PluginName {
    type Err = UnknownPlugin;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PluginName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownPlugin(s.to_string()))
    }
}

/// A request to load one module, optionally from a specific object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: PluginName,

    /// Object to load; `None` (or empty) resolves by priority.
    pub so_name: Option<String>,
}

impl PluginSpec {
    pub fn new(name: PluginName) -> Self {
        Self { name, so_name: None }
    }

    pub fn with_soname(name: PluginName, so_name: impl Into<String>) -> Self {
        Self {
            name,
            so_name: Some(so_name.into()),
        }
    }

    /// The explicit soname, if a non-empty one was given.
    pub fn explicit_soname(&self) -> Option<&str> {
        self.so_name.as_deref().filter(|s| !s.is_empty())
    }
}

impl From<PluginName> for PluginSpec {
    fn from(name: PluginName) -> Self {
        PluginSpec::new(name)
    }
}

/// Specs for every module, resolved by priority.
pub fn all_plugins() -> Vec<PluginSpec> {
    PluginName::ALL.into_iter().map(PluginSpec::new).collect()
}
