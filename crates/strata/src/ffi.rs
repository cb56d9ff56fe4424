//! The error channel shared with plugins.
//!
//! Every plugin function that can fail takes a `StrataError *` as its last
//! parameter. On the Rust side that is a [`RawError`], a fixed-layout record
//! the plugin fills in before returning its failure value. Callers turn it
//! into a [`GenericError`] with [`RawError::take`].

use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_char;
use thiserror::Error;

/// Capacity of the message buffer, including the terminating NUL.
pub const MESSAGE_CAPACITY: usize = 512;

/// Identifies which part of the system produced an error.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorDomain(pub u32);

impl ErrorDomain {
    /// Errors raised by strata itself (stubs, loader).
    pub const RUNTIME: ErrorDomain = ErrorDomain(0);
    /// Errors raised while running external utilities.
    pub const EXEC: ErrorDomain = ErrorDomain(1);
    pub const LVM: ErrorDomain = ErrorDomain(10);
    pub const FS: ErrorDomain = ErrorDomain(11);
    pub const CRYPTO: ErrorDomain = ErrorDomain(12);
    pub const MDRAID: ErrorDomain = ErrorDomain(13);
    pub const SWAP: ErrorDomain = ErrorDomain(14);
    pub const LOOP: ErrorDomain = ErrorDomain(15);

    pub fn name(&self) -> &'static str {
        match *self {
            ErrorDomain::RUNTIME => "runtime",
            ErrorDomain::EXEC => "exec",
            ErrorDomain::LVM => "lvm",
            ErrorDomain::FS => "fs",
            ErrorDomain::CRYPTO => "crypto",
            ErrorDomain::MDRAID => "mdraid",
            ErrorDomain::SWAP => "swap",
            ErrorDomain::LOOP => "loop",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Error codes shared by all domains.
///
/// Modules are free to use their own codes above [`code::MODULE_BASE`].
pub mod code {
    /// A plugin function was called but no loaded plugin implements it.
    pub const NOT_IMPLEMENTED: i32 = 1;
    /// A technology or mode is not available.
    pub const TECH_UNAVAILABLE: i32 = 2;
    /// Generic failure.
    pub const FAILED: i32 = 3;
    pub const INVALID_ARGUMENT: i32 = 4;
    /// Authentication failed (wrong passphrase, key).
    pub const AUTH_FAILED: i32 = 5;
    pub const DEVICE_BUSY: i32 = 6;
    pub const NO_DEVICE: i32 = 7;
    /// An external utility failed.
    pub const PROCESS_FAILED: i32 = 8;
    /// First code free for module-specific use.
    pub const MODULE_BASE: i32 = 100;
}

/// `StrataError` as plugins see it.
#[repr(C)]
pub struct RawError {
    pub domain: u32,
    pub code: i32,
    pub is_set: bool,
    pub message: [c_char; MESSAGE_CAPACITY],
}

impl RawError {
    pub fn new() -> Self {
        Self {
            domain: 0,
            code: 0,
            is_set: false,
            message: [0; MESSAGE_CAPACITY],
        }
    }

    /// Record an error, truncating the message to fit the buffer.
    pub fn set(&mut self, domain: ErrorDomain, code: i32, message: &str) {
        self.domain = domain.0;
        self.code = code;
        self.is_set = true;

        let bytes = message.as_bytes();
        let len = bytes.len().min(MESSAGE_CAPACITY - 1);
        for (dst, src) in self.message.iter_mut().zip(&bytes[..len]) {
            *dst = *src as c_char;
        }
        self.message[len] = 0;
    }

    pub fn is_set(&self) -> bool {
        self.is_set
    }

    /// The recorded message, lossily decoded.
    pub fn message(&self) -> String {
        let bytes: Vec<u8> = self
            .message
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Take the recorded error, leaving the record cleared.
    pub fn take(&mut self) -> Option<GenericError> {
        if !self.is_set {
            return None;
        }
        let error = GenericError {
            domain: ErrorDomain(self.domain),
            code: self.code,
            message: self.message(),
        };
        self.clear();
        Some(error)
    }

    pub fn clear(&mut self) {
        self.domain = 0;
        self.code = 0;
        self.is_set = false;
        self.message[0] = 0;
    }
}

impl Default for RawError {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawError")
            .field("domain", &ErrorDomain(self.domain))
            .field("code", &self.code)
            .field("is_set", &self.is_set)
            .field("message", &self.message())
            .finish()
    }
}

/// An error reported through the error channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({domain}, code {code})")]
pub struct GenericError {
    pub domain: ErrorDomain,
    pub code: i32,
    pub message: String,
}

impl GenericError {
    pub fn is_not_implemented(&self) -> bool {
        self.domain == ErrorDomain::RUNTIME && self.code == code::NOT_IMPLEMENTED
    }
}

/// Record an error in `error`.
///
/// With a null `error` the failure has nowhere to go but the log: it is
/// reported as a warning through [`crate::log::process`].
///
/// # Safety
///
/// `error` must be null or point to a valid, writable [`RawError`].
pub unsafe fn report_error(error: *mut RawError, domain: ErrorDomain, code: i32, message: &str) {
    match unsafe { error.as_mut() } {
        Some(error) => error.set(domain, code, message),
        None => crate::log::process().warning(&format!("{domain} (code {code}): {message}")),
    }
}

/// Report that `symbol` was called while no plugin provides it.
///
/// # Safety
///
/// Same contract as [`report_error`].
pub unsafe fn report_not_implemented(error: *mut RawError, symbol: &str) {
    let message = format!("The function '{symbol}' called, but not implemented!");
    unsafe { report_error(error, ErrorDomain::RUNTIME, code::NOT_IMPLEMENTED, &message) }
}

/// Copy `text` into a plugin-provided buffer of `capacity` bytes.
///
/// Returns false when `text` (plus its NUL) does not fit; the buffer is left
/// untouched in that case.
///
/// # Safety
///
/// `buffer` must be valid for writes of `capacity` bytes.
pub unsafe fn write_c_string(buffer: *mut c_char, capacity: usize, text: &CStr) -> bool {
    let bytes = text.to_bytes_with_nul();
    if buffer.is_null() || bytes.len() > capacity {
        return false;
    }
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, buffer, bytes.len()) };
    true
}

/// LUKS format versions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrataLuksVersion {
    #[default]
    Unknown = 0,
    Luks1 = 1,
    Luks2 = 2,
}
