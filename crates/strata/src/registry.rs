//! The plugin registry.
//!
//! A [`Runtime`] owns the table of loaded modules and the process-wide
//! initialized flag. Every mutating call takes its internal lock, so callers
//! never observe a half-applied `init`, `reinit` or `ensure_init`.
//!
//! Module slots are process globals: keep one `Runtime` per process (or at
//! least never let two runtimes load the same module at once).

use crate::abi;
use crate::config::{RuntimeConfig, SonameSource};
use crate::error::{LoadError, RegistryError, RuntimeResult};
use crate::loader::{DynamicLibraries, LoadedModule, ObjectOpener};
use crate::log::{install_process_sink, release_process_sink, Diagnostics, LogSink};
use crate::plugin::{PluginName, PluginSpec};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Lifecycle of one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Unloaded,
    Loading,
    Loaded,
    FailedLoad,
}

/// Details of a loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: PluginName,
    pub path: PathBuf,
    pub source: SonameSource,
    /// Changes whenever the module is loaded again.
    pub instance: u64,
    /// Symbols the object does not export; calling them reports
    /// "not implemented".
    pub missing_symbols: Vec<&'static str>,
}

#[derive(Debug)]
struct ModuleEntry {
    state: PluginState,
    loaded: Option<(LoadedModule, SonameSource)>,
}

impl Default for ModuleEntry {
    fn default() -> Self {
        Self {
            state: PluginState::Unloaded,
            loaded: None,
        }
    }
}

#[derive(Default)]
struct RuntimeState {
    initialized: bool,
    requested: Vec<PluginSpec>,
    modules: BTreeMap<PluginName, ModuleEntry>,
    sink: Option<LogSink>,
}

impl RuntimeState {
    /// Record `sink` and make it the process-wide sink.
    fn set_sink(&mut self, sink: Option<LogSink>) {
        install_process_sink(sink.clone());
        self.sink = sink;
    }

    fn is_loaded(&self, name: PluginName) -> bool {
        self.modules
            .get(&name)
            .is_some_and(|entry| entry.state == PluginState::Loaded)
    }

    fn loaded_names(&self) -> Vec<PluginName> {
        self.modules
            .iter()
            .filter(|(_, entry)| entry.state == PluginState::Loaded)
            .map(|(name, _)| *name)
            .collect()
    }
}

/// The plugin runtime.
pub struct Runtime {
    config: RuntimeConfig,
    opener: Arc<dyn ObjectOpener>,
    state: Mutex<RuntimeState>,
}

impl Runtime {
    /// A runtime resolving plugins with `config` and opening them with `opener`.
    pub fn new(config: RuntimeConfig, opener: Arc<dyn ObjectOpener>) -> Self {
        Self {
            config,
            opener,
            state: Mutex::new(RuntimeState::default()),
        }
    }

    /// A runtime loading real shared objects, configured from the environment.
    pub fn from_env() -> RuntimeResult<Self> {
        let config = RuntimeConfig::from_env()?;
        Ok(Self::new(config, Arc::new(DynamicLibraries::new())))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `op` under the lock, then hand its diagnostics to the sink `op`
    /// picked once the lock is released.
    fn locked<T>(&self, op: impl FnOnce(&mut RuntimeState, &Diagnostics) -> (T, Option<LogSink>)) -> T {
        let diagnostics = Diagnostics::deferred();
        let mut state = self.lock();
        let (result, sink) = op(&mut *state, &diagnostics);
        drop(state);
        diagnostics.flush(sink.as_ref());
        result
    }

    /// Load `requested` and mark the runtime initialized.
    ///
    /// Fails without side effects if the runtime is already initialized. If
    /// any module fails to load, every module this call loaded is unloaded
    /// again and the runtime stays uninitialized with its previous log sink.
    ///
    /// The sink receives the call's diagnostics after the runtime's lock is
    /// released, so it may query the runtime. Plugin init and close hooks
    /// run under the lock and must not call back into the runtime.
    pub fn init(&self, requested: &[PluginSpec], log_sink: Option<LogSink>) -> RuntimeResult<()> {
        self.locked(|state, diagnostics| {
            if state.initialized {
                diagnostics.warning("strata is already initialized, not initializing again");
                let sink = log_sink.or_else(|| state.sink.clone());
                return (Err(RegistryError::AlreadyInitialized), sink);
            }
            self.init_locked(state, requested, log_sink, diagnostics)
        })
    }

    fn init_locked(
        &self,
        state: &mut RuntimeState,
        requested: &[PluginSpec],
        log_sink: Option<LogSink>,
        diagnostics: &Diagnostics,
    ) -> (RuntimeResult<()>, Option<LogSink>) {
        let requested = dedup(requested, diagnostics);

        if let Err(e) = self.load_all(state, &requested, true, diagnostics) {
            diagnostics.error(&e.to_string());
            return (Err(e), log_sink);
        }

        state.requested = requested;
        state.initialized = true;
        state.set_sink(log_sink.clone());
        diagnostics.info(&format!(
            "strata initialized with {} of {} requested plugins",
            state.loaded_names().len(),
            state.requested.len()
        ));
        (Ok(()), log_sink)
    }

    /// Re-initialize with a new request set.
    ///
    /// Without `reload`, only the requested set and log sink are updated:
    /// nothing is loaded or unloaded, so plugins keep their in-memory state.
    /// With `reload`, every loaded module is unloaded and the new set is
    /// loaded from scratch. A failure during a reload leaves whatever had
    /// already been swapped in loaded; query [`Runtime::available_plugin_names`]
    /// to see what that is. The log sink is only replaced on success.
    ///
    /// On an uninitialized runtime this is [`Runtime::init`].
    pub fn reinit(&self, requested: &[PluginSpec], reload: bool, log_sink: Option<LogSink>) -> RuntimeResult<()> {
        self.locked(|state, diagnostics| {
            if !state.initialized {
                return self.init_locked(state, requested, log_sink, diagnostics);
            }

            let sink = log_sink.clone().or_else(|| state.sink.clone());
            let requested = dedup(requested, diagnostics);

            if !reload {
                debug!("Refreshing plugin bookkeeping without reloading");
                let not_loaded: Vec<String> = requested
                    .iter()
                    .filter(|spec| !state.is_loaded(spec.name))
                    .map(|spec| spec.name.to_string())
                    .collect();
                if !not_loaded.is_empty() {
                    diagnostics.debug(&format!(
                        "Requested but not loaded (reinit without reload loads nothing): {}",
                        not_loaded.join(", ")
                    ));
                }
                state.requested = requested;
                if log_sink.is_some() {
                    state.set_sink(log_sink);
                }
                return (Ok(()), sink);
            }

            for name in state.loaded_names() {
                self.unload_locked(state, name, diagnostics);
            }
            state.requested = requested.clone();

            if let Err(e) = self.load_all(state, &requested, false, diagnostics) {
                diagnostics.error(&format!(
                    "{}; loaded plugins now: {}",
                    e,
                    join_names(&state.loaded_names())
                ));
                return (Err(e), sink);
            }

            if log_sink.is_some() {
                state.set_sink(log_sink);
            }
            diagnostics.info(&format!(
                "strata reinitialized with plugins: {}",
                join_names(&state.loaded_names())
            ));
            (Ok(()), sink)
        })
    }

    /// Load the modules of `requested` that are not loaded yet.
    ///
    /// Loaded modules are never unloaded or reloaded. If a load fails, the
    /// modules this call loaded are unloaded again and the log sink is left
    /// as it was. On an uninitialized runtime this is [`Runtime::init`].
    pub fn ensure_init(&self, requested: &[PluginSpec], log_sink: Option<LogSink>) -> RuntimeResult<()> {
        self.locked(|state, diagnostics| {
            if !state.initialized {
                return self.init_locked(state, requested, log_sink, diagnostics);
            }

            let sink = log_sink.clone().or_else(|| state.sink.clone());
            let requested = dedup(requested, diagnostics);
            let missing: Vec<PluginSpec> = requested
                .into_iter()
                .filter(|spec| !state.is_loaded(spec.name))
                .collect();

            if !missing.is_empty() {
                if let Err(e) = self.load_all(state, &missing, true, diagnostics) {
                    diagnostics.error(&e.to_string());
                    return (Err(e), sink);
                }
            } else {
                debug!("All requested plugins already loaded");
            }

            for spec in missing {
                if !state.requested.iter().any(|r| r.name == spec.name) {
                    state.requested.push(spec);
                }
            }
            if log_sink.is_some() {
                state.set_sink(log_sink);
            }
            (Ok(()), sink)
        })
    }

    /// [`Runtime::init`], reporting failure as `false`.
    pub fn try_init(&self, requested: &[PluginSpec], log_sink: Option<LogSink>) -> bool {
        self.init(requested, log_sink).is_ok()
    }

    /// [`Runtime::reinit`], reporting failure as `false`.
    pub fn try_reinit(&self, requested: &[PluginSpec], reload: bool, log_sink: Option<LogSink>) -> bool {
        self.reinit(requested, reload, log_sink).is_ok()
    }

    /// [`Runtime::ensure_init`], reporting failure as `false`.
    pub fn try_ensure_init(&self, requested: &[PluginSpec], log_sink: Option<LogSink>) -> bool {
        self.ensure_init(requested, log_sink).is_ok()
    }

    /// Unload every module and mark the runtime uninitialized.
    pub fn unload_all(&self) {
        self.locked(|state, diagnostics| {
            for name in state.loaded_names() {
                self.unload_locked(state, name, diagnostics);
            }
            state.requested.clear();
            state.initialized = false;
            ((), state.sink.clone())
        })
    }

    /// Load `specs` in order. With `rollback`, a failure unloads the modules
    /// loaded by this call before returning.
    fn load_all(
        &self,
        state: &mut RuntimeState,
        specs: &[PluginSpec],
        rollback: bool,
        diagnostics: &Diagnostics,
    ) -> RuntimeResult<()> {
        let mut loaded_now = Vec::new();

        for spec in specs {
            if state.is_loaded(spec.name) {
                continue;
            }
            match self.load_one(state, spec, diagnostics) {
                Ok(()) => loaded_now.push(spec.name),
                Err(source) => {
                    if rollback {
                        for name in loaded_now.into_iter().rev() {
                            self.unload_locked(state, name, diagnostics);
                        }
                    }
                    return Err(RegistryError::PartialLoadFailure {
                        module: spec.name,
                        source,
                    });
                }
            }
        }

        Ok(())
    }

    /// Try each candidate of `spec`; the first that loads wins.
    fn load_one(&self, state: &mut RuntimeState, spec: &PluginSpec, diagnostics: &Diagnostics) -> Result<(), LoadError> {
        state.modules.entry(spec.name).or_default().state = PluginState::Loading;

        let candidates = self.config.candidates(spec);
        let mut failure: Option<LoadError> = None;

        for candidate in candidates {
            match abi::load(spec.name, self.opener.as_ref(), &candidate.path, diagnostics) {
                Ok(module) => {
                    let entry = state.modules.entry(spec.name).or_default();
                    entry.state = PluginState::Loaded;
                    entry.loaded = Some((module, candidate.source));
                    return Ok(());
                }
                Err(e) => {
                    // An object that was found but refused to initialize says
                    // more than one that was never found.
                    let replace = match (&failure, &e) {
                        (None, _) => true,
                        (Some(LoadError::InitHookFailed { .. }), _) => false,
                        (Some(_), LoadError::InitHookFailed { .. }) => true,
                        _ => false,
                    };
                    if replace {
                        failure = Some(e);
                    }
                }
            }
        }

        state.modules.entry(spec.name).or_default().state = PluginState::FailedLoad;
        Err(failure.unwrap_or_else(|| LoadError::OpenFailed {
            module: spec.name.to_string(),
            path: PathBuf::from(spec.name.default_soname()),
            reason: "no candidate objects".to_string(),
        }))
    }

    fn unload_locked(&self, state: &mut RuntimeState, name: PluginName, diagnostics: &Diagnostics) {
        let Some(entry) = state.modules.get_mut(&name) else {
            return;
        };
        entry.state = PluginState::Unloaded;
        if let Some((module, _)) = entry.loaded.take() {
            if !abi::unload(name, module, diagnostics) {
                diagnostics.warning(&format!("The {name} plugin did not close cleanly"));
            }
        }
    }

    /// Names of the loaded modules.
    pub fn available_plugin_names(&self) -> Vec<PluginName> {
        self.lock().loaded_names()
    }

    pub fn is_plugin_available(&self, name: PluginName) -> bool {
        self.lock().is_loaded(name)
    }

    /// Object the module was loaded from, if it is loaded.
    pub fn plugin_soname(&self, name: PluginName) -> Option<String> {
        let state = self.lock();
        state
            .modules
            .get(&name)
            .and_then(|entry| entry.loaded.as_ref())
            .map(|(module, _)| module.path().to_string_lossy().into_owned())
    }

    pub fn plugin_state(&self, name: PluginName) -> PluginState {
        self.lock()
            .modules
            .get(&name)
            .map(|entry| entry.state)
            .unwrap_or(PluginState::Unloaded)
    }

    pub fn plugin_info(&self, name: PluginName) -> Option<PluginInfo> {
        let state = self.lock();
        let (module, source) = state.modules.get(&name)?.loaded.as_ref()?;
        Some(PluginInfo {
            name,
            path: module.path().to_path_buf(),
            source: source.clone(),
            instance: module.instance(),
            missing_symbols: module.missing_symbols(),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// The most recent request set.
    pub fn requested_plugins(&self) -> Vec<PluginSpec> {
        self.lock().requested.clone()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.unload_all();
        if let Some(sink) = &self.lock().sink {
            release_process_sink(sink);
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("loaded", &self.available_plugin_names())
            .finish()
    }
}

/// First spec per module wins.
fn dedup(requested: &[PluginSpec], diagnostics: &Diagnostics) -> Vec<PluginSpec> {
    let mut seen = BTreeSet::new();
    let mut unique = Vec::with_capacity(requested.len());
    for spec in requested {
        if seen.insert(spec.name) {
            unique.push(spec.clone());
        } else {
            diagnostics.debug(&format!("Ignoring repeated request for the {} plugin", spec.name));
        }
    }
    unique
}

fn join_names(names: &[PluginName]) -> String {
    if names.is_empty() {
        return "none".to_string();
    }
    names.iter().map(PluginName::as_str).collect::<Vec<_>>().join(", ")
}
