//! Error types for the strata runtime.

use crate::plugin::PluginName;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading a single module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The shared object could not be opened.
    #[error("Failed to load the '{module}' plugin from {path}: {reason}")]
    OpenFailed {
        module: String,
        path: PathBuf,
        reason: String,
    },

    /// The module's initializer returned false.
    #[error("Failed to initialize the '{module}' plugin from {path}")]
    InitHookFailed { module: String, path: PathBuf },

    /// A declared symbol is absent from the object. Recorded as a warning,
    /// never returned by the loader.
    #[error("Symbol '{symbol}' missing from {path}")]
    SymbolMissing { symbol: String, path: PathBuf },
}

/// Errors raised by the plugin registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// `init` was called on an initialized runtime.
    #[error("strata is already initialized")]
    AlreadyInitialized,

    /// A requested module could not be loaded; everything this call loaded
    /// has been unloaded again.
    #[error("Failed to load the {module} plugin: {source}")]
    PartialLoadFailure {
        module: PluginName,
        #[source]
        source: LoadError,
    },

    /// Configuration could not be read.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors reading runtime configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error.
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("Invalid configuration in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Result type for registry operations.
pub type RuntimeResult<T> = std::result::Result<T, RegistryError>;
