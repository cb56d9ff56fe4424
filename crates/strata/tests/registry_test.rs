//! Registry behavior against in-memory plugin objects.

use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use strata::abi::{fs, lvm, swap};
use strata::config::RuntimeConfig;
use strata::dispatch::{DispatchError, DispatchProxy, ErrorKind};
use strata::ffi::RawError;
use strata::loader::{MemoryObject, MemoryObjects};
use strata::{LoadError, LogSink, PluginName, PluginSpec, PluginState, RegistryError, Runtime, Severity, SonameSource};

// Module slots are process globals; runtimes in this file must not overlap.
static SERIAL: Mutex<()> = Mutex::new(());

const PLUGIN_DIR: &str = "/usr/lib/strata";

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn plugin_path(name: PluginName) -> PathBuf {
    PathBuf::from(PLUGIN_DIR).join(name.default_soname())
}

fn runtime(objects: &MemoryObjects) -> Runtime {
    let config = RuntimeConfig::load(Vec::new(), vec![PathBuf::from(PLUGIN_DIR)]).without_system_search();
    Runtime::new(config, Arc::new(objects.clone()))
}

fn specs(names: &[PluginName]) -> Vec<PluginSpec> {
    names.iter().copied().map(PluginSpec::new).collect()
}

extern "C" fn init_ok() -> bool {
    true
}

extern "C" fn init_fail() -> bool {
    false
}

extern "C" fn swapstatus_inactive(_device: *const c_char, _error: *mut RawError) -> bool {
    false
}

extern "C" fn swapstatus_active(_device: *const c_char, _error: *mut RawError) -> bool {
    true
}

extern "C" fn round_down(size: u64, pe_size: u64, _roundup: bool, _error: *mut RawError) -> u64 {
    size - size % pe_size
}

fn swap_object(swapstatus: extern "C" fn(*const c_char, *mut RawError) -> bool) -> MemoryObject {
    MemoryObject::new()
        .with_symbol("strata_swap_init", init_ok as *const c_void)
        .with_symbol(swap::decls::STRATA_SWAP_SWAPSTATUS_SYMBOL, swapstatus as *const c_void)
}

fn lvm_object() -> MemoryObject {
    MemoryObject::new().with_symbol(lvm::decls::STRATA_LVM_ROUND_SIZE_TO_PE_SYMBOL, round_down as *const c_void)
}

fn swapstatus(device: &str) -> Result<bool, DispatchError> {
    let device = CString::new(device).unwrap();
    DispatchProxy::new(PluginName::Swap).call("swapstatus", |e| swap::swapstatus(&device, e))
}

fn mkswap(device: &str) -> Result<bool, DispatchError> {
    let device = CString::new(device).unwrap();
    let label = CString::new("").unwrap();
    DispatchProxy::new(PluginName::Swap).call("mkswap", |e| swap::mkswap(&device, &label, e))
}

fn capture() -> (LogSink, Arc<Mutex<Vec<(Severity, String)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    let sink: LogSink = Arc::new(move |severity: Severity, message: &str| {
        captured.lock().unwrap().push((severity, message.to_string()));
    });
    (sink, seen)
}

#[test]
fn test_init_loads_exactly_the_requested_set() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));
    objects.insert(plugin_path(PluginName::Lvm), lvm_object());

    let runtime = runtime(&objects);
    assert!(!runtime.is_initialized());
    runtime
        .init(&specs(&[PluginName::Swap, PluginName::Lvm]), None)
        .unwrap();

    assert!(runtime.is_initialized());
    assert_eq!(runtime.available_plugin_names(), vec![PluginName::Lvm, PluginName::Swap]);
    assert!(runtime.is_plugin_available(PluginName::Swap));
    assert!(!runtime.is_plugin_available(PluginName::Fs));
    assert_eq!(runtime.plugin_state(PluginName::Fs), PluginState::Unloaded);
    assert_eq!(
        runtime.plugin_soname(PluginName::Swap),
        Some(plugin_path(PluginName::Swap).to_string_lossy().into_owned())
    );
    assert_eq!(runtime.requested_plugins().len(), 2);

    let info = runtime.plugin_info(PluginName::Swap).unwrap();
    assert_eq!(info.source, SonameSource::Default);
    assert!(info.missing_symbols.contains(&"strata_swap_mkswap"));
    assert!(!info.missing_symbols.contains(&"strata_swap_swapstatus"));
}

#[test]
fn test_init_twice_is_refused() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));

    let runtime = runtime(&objects);
    runtime.init(&specs(&[PluginName::Swap]), None).unwrap();
    let first = runtime.plugin_info(PluginName::Swap).unwrap().instance;

    let (sink, seen) = capture();
    let err = runtime.init(&specs(&[PluginName::Swap]), Some(sink)).unwrap_err();
    assert!(matches!(err, RegistryError::AlreadyInitialized));
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .any(|(severity, message)| *severity == Severity::Warning && message.contains("already initialized")));
    assert_eq!(runtime.plugin_info(PluginName::Swap).unwrap().instance, first);
    assert!(!runtime.try_init(&specs(&[PluginName::Swap]), None));
}

#[test]
fn test_init_without_object_fails_and_loads_nothing() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));

    let runtime = runtime(&objects);
    let err = runtime
        .init(&specs(&[PluginName::Swap, PluginName::Fs]), None)
        .unwrap_err();

    match err {
        RegistryError::PartialLoadFailure { module, source } => {
            assert_eq!(module, PluginName::Fs);
            assert!(matches!(source, LoadError::OpenFailed { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(runtime.available_plugin_names().is_empty());
    assert!(!runtime.is_initialized());
    assert_eq!(runtime.plugin_state(PluginName::Fs), PluginState::FailedLoad);
    assert!(!swap::MODULE.any_bound());
    assert_eq!(objects.open_count(plugin_path(PluginName::Swap)), 0);
    assert!(swapstatus("/dev/vdb").unwrap_err().is_not_implemented());
}

#[test]
fn test_failing_init_hook_is_a_hard_failure() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(
        plugin_path(PluginName::Swap),
        MemoryObject::new()
            .with_symbol("strata_swap_init", init_fail as *const c_void)
            .with_symbol("strata_swap_swapstatus", swapstatus_active as *const c_void),
    );

    let runtime = runtime(&objects);
    let err = runtime.init(&specs(&[PluginName::Swap]), None).unwrap_err();
    assert!(matches!(
        err,
        RegistryError::PartialLoadFailure {
            source: LoadError::InitHookFailed { .. },
            ..
        }
    ));
    assert!(!swap::MODULE.any_bound());
    assert!(!runtime.try_init(&specs(&[PluginName::Swap]), None));
}

#[test]
fn test_partial_plugin_binds_what_it_exports() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));

    let runtime = runtime(&objects);
    runtime.init(&specs(&[PluginName::Swap]), None).unwrap();

    assert_eq!(swapstatus("/dev/vdb"), Ok(true));

    let err = mkswap("/dev/vdb").unwrap_err();
    assert!(err.is_not_implemented());
    assert_eq!(err.module(), Some(PluginName::Swap));
    assert_eq!(err.kind(), Some(ErrorKind::Base));
    assert!(err.generic().unwrap().is_not_implemented());
    assert!(err.to_string().contains("strata_swap_mkswap"));
}

#[test]
fn test_ensure_init_keeps_loaded_instances() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));
    objects.insert(plugin_path(PluginName::Lvm), lvm_object());

    let runtime = runtime(&objects);
    runtime.init(&specs(&[PluginName::Swap]), None).unwrap();
    let before = runtime.plugin_info(PluginName::Swap).unwrap();

    runtime
        .ensure_init(&specs(&[PluginName::Swap, PluginName::Lvm]), None)
        .unwrap();

    assert_eq!(runtime.available_plugin_names(), vec![PluginName::Lvm, PluginName::Swap]);
    assert_eq!(runtime.plugin_info(PluginName::Swap).unwrap(), before);
    assert_eq!(objects.open_count(plugin_path(PluginName::Swap)), 1);

    let mut error = RawError::new();
    assert_eq!(lvm::round_size_to_pe(10 << 20, 4 << 20, false, &mut error), 8 << 20);
    assert!(!error.is_set());
}

#[test]
fn test_ensure_init_never_unloads_and_rolls_back_its_own_loads() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));
    objects.insert(plugin_path(PluginName::Lvm), lvm_object());

    let runtime = runtime(&objects);
    runtime.init(&specs(&[PluginName::Swap]), None).unwrap();

    // No crypto object: lvm is loaded and then unloaded again, swap stays.
    let err = runtime
        .ensure_init(&specs(&[PluginName::Lvm, PluginName::Crypto]), None)
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::PartialLoadFailure {
            module: PluginName::Crypto,
            ..
        }
    ));
    assert_eq!(runtime.available_plugin_names(), vec![PluginName::Swap]);
    assert!(!lvm::MODULE.any_bound());

    assert!(runtime.try_ensure_init(&specs(&[PluginName::Lvm]), None));
    assert_eq!(runtime.available_plugin_names(), vec![PluginName::Lvm, PluginName::Swap]);
}

#[test]
fn test_ensure_init_on_fresh_runtime_initializes() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Lvm), lvm_object());

    let runtime = runtime(&objects);
    runtime.ensure_init(&specs(&[PluginName::Lvm]), None).unwrap();
    assert!(runtime.is_initialized());
    assert_eq!(runtime.available_plugin_names(), vec![PluginName::Lvm]);
}

#[test]
fn test_reinit_without_reload_is_idempotent() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));

    let runtime = runtime(&objects);
    let requested = specs(&[PluginName::Swap]);
    runtime.init(&requested, None).unwrap();
    let before = runtime.plugin_info(PluginName::Swap).unwrap();
    let stub_error = mkswap("/dev/vdb").unwrap_err();

    for _ in 0..2 {
        runtime.reinit(&requested, false, None).unwrap();
        assert_eq!(runtime.available_plugin_names(), vec![PluginName::Swap]);
        assert_eq!(runtime.plugin_info(PluginName::Swap).unwrap(), before);
        assert_eq!(mkswap("/dev/vdb").unwrap_err(), stub_error);
    }
    assert!(runtime.try_reinit(&requested, false, None));
}

#[test]
fn test_reinit_with_reload_picks_up_new_object() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_inactive));
    objects.insert(plugin_path(PluginName::Lvm), lvm_object());

    let runtime = runtime(&objects);
    runtime
        .init(&specs(&[PluginName::Swap, PluginName::Lvm]), None)
        .unwrap();
    let before = runtime.plugin_info(PluginName::Swap).unwrap();
    assert_eq!(swapstatus("/dev/vdb"), Ok(false));

    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));
    runtime.reinit(&specs(&[PluginName::Swap]), true, None).unwrap();

    assert_eq!(swapstatus("/dev/vdb"), Ok(true));
    assert_ne!(runtime.plugin_info(PluginName::Swap).unwrap().instance, before.instance);
    // Modules left out of the new set stay unloaded.
    assert_eq!(runtime.available_plugin_names(), vec![PluginName::Swap]);
    assert!(!lvm::MODULE.any_bound());
    assert_eq!(objects.open_count(plugin_path(PluginName::Swap)), 1);
}

#[test]
fn test_failed_reload_leaves_swapped_set() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));
    objects.insert(plugin_path(PluginName::Lvm), lvm_object());

    let runtime = runtime(&objects);
    let requested = specs(&[PluginName::Swap, PluginName::Lvm]);
    runtime.init(&requested, None).unwrap();

    objects.remove(plugin_path(PluginName::Lvm));
    let err = runtime.reinit(&requested, true, None).unwrap_err();
    assert!(matches!(
        err,
        RegistryError::PartialLoadFailure {
            module: PluginName::Lvm,
            ..
        }
    ));
    assert!(runtime.is_initialized());
    assert_eq!(runtime.available_plugin_names(), vec![PluginName::Swap]);
    assert_eq!(runtime.plugin_state(PluginName::Lvm), PluginState::FailedLoad);
}

#[test]
fn test_unload_reverts_every_slot() {
    let _guard = serial();
    let before_load = swapstatus("/dev/vdb").unwrap_err();
    assert!(before_load.is_not_implemented());

    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));
    let runtime = runtime(&objects);
    runtime.init(&specs(&[PluginName::Swap]), None).unwrap();
    assert!(swap::MODULE.any_bound());

    runtime.unload_all();
    assert!(!runtime.is_initialized());
    assert!(runtime.available_plugin_names().is_empty());
    assert!(!swap::MODULE.any_bound());
    assert_eq!(swapstatus("/dev/vdb").unwrap_err(), before_load);
    assert_eq!(objects.open_count(plugin_path(PluginName::Swap)), 0);

    // Unloading allows a fresh init.
    runtime.init(&specs(&[PluginName::Swap]), None).unwrap();
}

#[test]
fn test_dropping_runtime_unloads() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));
    {
        let runtime = runtime(&objects);
        runtime.init(&specs(&[PluginName::Swap]), None).unwrap();
        assert_eq!(objects.open_count(plugin_path(PluginName::Swap)), 1);
    }
    assert_eq!(objects.open_count(plugin_path(PluginName::Swap)), 0);
    assert!(!swap::MODULE.any_bound());
}

#[test]
fn test_explicit_soname_wins() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_inactive));
    objects.insert("/opt/custom/libswap.so", swap_object(swapstatus_active));

    let runtime = runtime(&objects);
    runtime
        .init(&[PluginSpec::with_soname(PluginName::Swap, "/opt/custom/libswap.so")], None)
        .unwrap();

    assert_eq!(runtime.plugin_soname(PluginName::Swap).as_deref(), Some("/opt/custom/libswap.so"));
    assert_eq!(runtime.plugin_info(PluginName::Swap).unwrap().source, SonameSource::Explicit);
    assert_eq!(swapstatus("/dev/vdb"), Ok(true));
}

#[test]
fn test_configured_sonames_in_priority_order() {
    let _guard = serial();
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("10-strata.toml"),
        "[swap]\nsonames = [\"libswap-missing.so\", \"libswap-present.so\"]\n",
    )
    .unwrap();

    let objects = MemoryObjects::new();
    objects.insert(format!("{PLUGIN_DIR}/libswap-present.so"), swap_object(swapstatus_active));
    let config = RuntimeConfig::load(vec![dir.path().to_path_buf()], vec![PathBuf::from(PLUGIN_DIR)]).without_system_search();
    let runtime = Runtime::new(config, Arc::new(objects.clone()));

    let (sink, seen) = capture();
    runtime.init(&specs(&[PluginName::Swap]), Some(sink)).unwrap();

    let info = runtime.plugin_info(PluginName::Swap).unwrap();
    assert_eq!(info.path, PathBuf::from(PLUGIN_DIR).join("libswap-present.so"));
    assert_eq!(info.source, SonameSource::Config(dir.path().join("10-strata.toml")));

    // Missing symbols are reported as warnings, not failures.
    let seen = seen.lock().unwrap();
    assert!(seen
        .iter()
        .any(|(severity, message)| *severity == Severity::Warning && message.contains("strata_swap_mkswap")));
}

#[test]
fn test_sink_may_query_the_runtime() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));

    let runtime = Arc::new(runtime(&objects));
    let handle = Arc::downgrade(&runtime);
    let observed = Arc::new(Mutex::new(Vec::new()));
    let recorded = observed.clone();
    let sink: LogSink = Arc::new(move |_severity: Severity, _message: &str| {
        if let Some(runtime) = handle.upgrade() {
            recorded.lock().unwrap().push(runtime.available_plugin_names());
        }
    });

    runtime.init(&specs(&[PluginName::Swap]), Some(sink)).unwrap();
    runtime.reinit(&specs(&[PluginName::Swap]), true, None).unwrap();

    let observed = observed.lock().unwrap();
    assert!(!observed.is_empty());
    assert!(observed.iter().all(|names| names == &vec![PluginName::Swap]));
}

#[test]
fn test_stub_without_error_channel_reports_to_sink() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    let runtime = runtime(&objects);
    let (sink, seen) = capture();
    runtime.init(&[], Some(sink)).unwrap();
    let before = seen.lock().unwrap().len();

    assert!(fs::tech_name(0).is_null());
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), before + 1);
        assert_eq!(seen[before].0, Severity::Warning);
        assert!(seen[before].1.contains("strata_fs_tech_name"));
    }

    let err = fs::checked::tech_name(&DispatchProxy::new(PluginName::Fs), 0).unwrap_err();
    assert!(err.is_not_implemented());
    assert!(seen.lock().unwrap()[before + 1..]
        .iter()
        .any(|(_, message)| message.contains("called, but not implemented")));
}

#[test]
fn test_failed_init_keeps_previous_sink() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Swap), swap_object(swapstatus_active));

    let runtime = runtime(&objects);
    let (first, first_seen) = capture();
    runtime.init(&specs(&[PluginName::Swap]), Some(first)).unwrap();
    runtime.unload_all();

    let (second, second_seen) = capture();
    assert!(runtime.init(&specs(&[PluginName::Fs]), Some(second)).is_err());
    // The failing call still reports to the sink it was given.
    assert!(second_seen
        .lock()
        .unwrap()
        .iter()
        .any(|(severity, message)| *severity == Severity::Error && message.contains("fs")));

    let first_before = first_seen.lock().unwrap().len();
    let second_before = second_seen.lock().unwrap().len();
    assert!(fs::tech_name(0).is_null());
    assert_eq!(first_seen.lock().unwrap().len(), first_before + 1);
    assert_eq!(second_seen.lock().unwrap().len(), second_before);
}

#[test]
fn test_checked_call_returns_plugin_value() {
    let _guard = serial();
    let objects = MemoryObjects::new();
    objects.insert(plugin_path(PluginName::Lvm), lvm_object());

    let runtime = runtime(&objects);
    runtime.init(&specs(&[PluginName::Lvm]), None).unwrap();

    let proxy = DispatchProxy::new(PluginName::Lvm);
    assert_eq!(lvm::checked::round_size_to_pe(&proxy, 10 << 20, 4 << 20, false), Ok(8 << 20));

    runtime.unload_all();
    let err = lvm::checked::round_size_to_pe(&proxy, 10 << 20, 4 << 20, false).unwrap_err();
    assert!(err.is_not_implemented());
}
