//! Runtime configuration: where plugins are looked for.
//!
//! Configuration lives in `conf.d` directories of TOML files:
//!
//! ```toml
//! # /etc/strata/conf.d/10-strata.toml
//! library_dirs = ["/usr/lib/strata"]
//!
//! [swap]
//! sonames = ["libstrata_swap.so.3", "libstrata_swap.so"]
//! ```
//!
//! Directories are read in order (first wins):
//!
//! 1. `$STRATA_CONFIG_DIR` when set, alone
//! 2. otherwise the user config directory (`~/.config/strata/conf.d` on Linux)
//! 3. and `/etc/strata/conf.d`
//!
//! Within a directory, files are read in descending name order, so
//! `20-local.toml` takes priority over `10-strata.toml`. Sonames listed for a
//! module are tried in the resulting order.
//!
//! Library directories come from `$STRATA_PLUGIN_PATH` (a platform path
//! list) followed by the `library_dirs` of every file.

use crate::error::ConfigError;
use crate::plugin::{PluginName, PluginSpec};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use tracing::{debug, info, warn};

/// Overrides the configuration directories.
pub const CONFIG_DIR_ENV: &str = "STRATA_CONFIG_DIR";

/// Directories searched for plugin objects before the platform search path.
pub const PLUGIN_PATH_ENV: &str = "STRATA_PLUGIN_PATH";

/// System-wide configuration directory.
pub const SYSTEM_CONFIG_DIR: &str = "/etc/strata/conf.d";

/// Contents of one configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub library_dirs: Vec<PathBuf>,

    /// Tables keyed by module name.
    #[serde(flatten)]
    pub modules: BTreeMap<String, ModuleConfig>,
}

/// Per-module settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleConfig {
    /// Objects to try, highest priority first.
    #[serde(default)]
    pub sonames: Vec<String>,
}

impl ConfigFile {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// Where a candidate soname came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SonameSource {
    /// Named by the caller in a [`PluginSpec`].
    Explicit,
    /// Listed in a configuration file.
    Config(PathBuf),
    /// [`PluginName::default_soname`].
    Default,
}

/// A path to try when loading a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub source: SonameSource,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directories configuration was read from, in priority order.
    pub config_dirs: Vec<PathBuf>,

    /// Directories searched for bare sonames, in order.
    pub library_dirs: Vec<PathBuf>,

    /// Whether bare sonames are also handed to the platform loader search.
    pub system_search: bool,

    sonames: BTreeMap<PluginName, Vec<(String, PathBuf)>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            config_dirs: Vec::new(),
            library_dirs: Vec::new(),
            system_search: true,
            sonames: BTreeMap::new(),
        }
    }
}

/// The user configuration directory.
pub fn user_config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "strata", "strata").map(|dirs| dirs.config_dir().join("conf.d"))
}

impl RuntimeConfig {
    /// Configuration from the environment and the default directories.
    ///
    /// Fails only when `$STRATA_CONFIG_DIR` names a directory that cannot be
    /// read; problems with individual files are logged and skipped.
    pub fn from_env() -> Result<Self, ConfigError> {
        let library_dirs: Vec<PathBuf> = std::env::var_os(PLUGIN_PATH_ENV)
            .map(|paths| std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default();

        match std::env::var_os(CONFIG_DIR_ENV) {
            Some(dir) => {
                let dir = PathBuf::from(dir);
                std::fs::read_dir(&dir).map_err(|source| ConfigError::Io {
                    path: dir.clone(),
                    source,
                })?;
                info!("Using configuration from ${} = {}", CONFIG_DIR_ENV, dir.display());
                Ok(Self::load(vec![dir], library_dirs))
            }
            None => {
                let mut config_dirs = Vec::new();
                if let Some(dir) = user_config_dir() {
                    config_dirs.push(dir);
                }
                config_dirs.push(PathBuf::from(SYSTEM_CONFIG_DIR));
                Ok(Self::load(config_dirs, library_dirs))
            }
        }
    }

    /// Read `config_dirs` and combine them with `library_dirs`.
    pub fn load(config_dirs: Vec<PathBuf>, library_dirs: Vec<PathBuf>) -> Self {
        let mut config = RuntimeConfig {
            config_dirs,
            library_dirs,
            ..Default::default()
        };

        for dir in config.config_dirs.clone() {
            for path in config_files(&dir) {
                match ConfigFile::from_file(&path) {
                    Ok(file) => config.merge(&path, file),
                    Err(e) => warn!("Skipping configuration file: {}", e),
                }
            }
        }

        debug!(
            "Runtime configuration: {} config dirs, {} library dirs, sonames for {} modules",
            config.config_dirs.len(),
            config.library_dirs.len(),
            config.sonames.len()
        );
        config
    }

    /// Disable the platform loader search for bare sonames.
    pub fn without_system_search(mut self) -> Self {
        self.system_search = false;
        self
    }

    fn merge(&mut self, path: &Path, file: ConfigFile) {
        for dir in file.library_dirs {
            if !self.library_dirs.contains(&dir) {
                self.library_dirs.push(dir);
            }
        }

        for (module, settings) in file.modules {
            let name: PluginName = match module.parse() {
                Ok(name) => name,
                Err(e) => {
                    warn!("{}: {}", path.display(), e);
                    continue;
                }
            };
            let sonames = self.sonames.entry(name).or_default();
            for soname in settings.sonames {
                if soname.is_empty() || sonames.iter().any(|(s, _)| *s == soname) {
                    continue;
                }
                sonames.push((soname, path.to_path_buf()));
            }
        }
    }

    /// Sonames configured for `name`, highest priority first.
    pub fn sonames(&self, name: PluginName) -> Vec<&str> {
        self.sonames
            .get(&name)
            .map(|list| list.iter().map(|(s, _)| s.as_str()).collect())
            .unwrap_or_default()
    }

    /// Paths to try for `spec`, in order.
    ///
    /// An explicit soname wins outright; otherwise the configured sonames are
    /// used, and only without them the module's default soname.
    pub fn candidates(&self, spec: &PluginSpec) -> Vec<Candidate> {
        let sonames: Vec<(String, SonameSource)> = match spec.explicit_soname() {
            Some(soname) => vec![(soname.to_string(), SonameSource::Explicit)],
            None => match self.sonames.get(&spec.name) {
                Some(list) if !list.is_empty() => list
                    .iter()
                    .map(|(soname, file)| (soname.clone(), SonameSource::Config(file.clone())))
                    .collect(),
                _ => vec![(spec.name.default_soname(), SonameSource::Default)],
            },
        };

        let mut candidates = Vec::new();
        for (soname, source) in sonames {
            for path in self.expand(&soname) {
                candidates.push(Candidate {
                    path,
                    source: source.clone(),
                });
            }
        }
        candidates
    }

    fn expand(&self, soname: &str) -> Vec<PathBuf> {
        if soname.contains(MAIN_SEPARATOR) || soname.contains('/') {
            return vec![PathBuf::from(soname)];
        }
        let mut paths: Vec<PathBuf> = self.library_dirs.iter().map(|dir| dir.join(soname)).collect();
        if self.system_search || paths.is_empty() {
            paths.push(PathBuf::from(soname));
        }
        paths
    }
}

/// `*.toml` files in `dir`, in descending name order.
fn config_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Not reading configuration from {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    files
}
