//! # strata-swap-dummy
//!
//! A dummy swap plugin for testing and development.
//!
//! It implements part of the swap ABI without touching any device: swap is
//! "active" on every device whose path contains `swap`, and `/dev/busy` is
//! always busy. `mkswap` and `swapoff` are deliberately left out, so calls
//! to them report "not implemented".

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::sync::atomic::{AtomicUsize, Ordering};
use strata::abi::swap::decls;
use strata::ffi::{code, report_error, ErrorDomain, RawError};
use tracing::debug;

static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);

/// Device that every operation reports as busy.
pub const BUSY_DEVICE: &str = "/dev/busy";

fn device_arg(device: *const c_char, error: *mut RawError) -> Option<String> {
    if device.is_null() {
        unsafe { report_error(error, ErrorDomain::SWAP, code::INVALID_ARGUMENT, "No device given") };
        return None;
    }
    Some(unsafe { CStr::from_ptr(device) }.to_string_lossy().into_owned())
}

#[no_mangle]
pub extern "C" fn strata_swap_init() -> bool {
    let calls = INIT_CALLS.fetch_add(1, Ordering::SeqCst) + 1;
    debug!("Dummy swap plugin initialized ({} times)", calls);
    true
}

#[no_mangle]
pub extern "C" fn strata_swap_close() {
    debug!("Dummy swap plugin closed");
}

#[no_mangle]
pub extern "C" fn strata_swap_is_tech_avail(_error: *mut RawError) -> bool {
    true
}

#[no_mangle]
pub extern "C" fn strata_swap_swapon(device: *const c_char, _priority: c_int, error: *mut RawError) -> bool {
    let Some(device) = device_arg(device, error) else {
        return false;
    };
    if device == BUSY_DEVICE {
        let message = format!("Failed to activate swap on {device}: Device or resource busy");
        unsafe { report_error(error, ErrorDomain::SWAP, code::FAILED, &message) };
        return false;
    }
    true
}

#[no_mangle]
pub extern "C" fn strata_swap_swapstatus(device: *const c_char, error: *mut RawError) -> bool {
    device_arg(device, error).is_some_and(|device| device.contains("swap"))
}

// Signatures must match the generated declarations.
const _: decls::StrataSwapIsTechAvailFn = strata_swap_is_tech_avail;
const _: decls::StrataSwapSwaponFn = strata_swap_swapon;
const _: decls::StrataSwapSwapstatusFn = strata_swap_swapstatus;
