//! Rebindable function pointers.

use std::ffi::c_void;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// Address of a symbol resolved from a shared object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddress(NonNull<c_void>);

// A code address carries no thread affinity.
unsafe impl Send for SymbolAddress {}
unsafe impl Sync for SymbolAddress {}

impl SymbolAddress {
    /// `None` for a null address.
    pub fn new(address: *const c_void) -> Option<Self> {
        NonNull::new(address as *mut c_void).map(SymbolAddress)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Reinterpret the address as a function pointer.
    ///
    /// # Safety
    ///
    /// `F` must be a pointer-sized function pointer type whose signature
    /// matches the symbol.
    pub(crate) unsafe fn cast<F: Copy>(&self) -> F {
        debug_assert_eq!(size_of::<F>(), size_of::<*mut c_void>());
        let address = self.as_ptr();
        unsafe { std::mem::transmute_copy::<*mut c_void, F>(&address) }
    }
}

/// Type-erased view of a [`Slot`], used by the loader to bind and revert
/// every function of a module without knowing their signatures.
pub trait SlotBinding: Sync {
    /// Symbol the slot is bound from.
    fn symbol(&self) -> &'static str;

    /// Point the slot at `address`.
    fn bind(&self, address: SymbolAddress);

    /// Point the slot back at its stub.
    fn revert(&self);

    fn is_bound(&self) -> bool;
}

/// A function pointer that starts out as a stub and can be rebound to a
/// plugin's implementation.
///
/// Reads are a single atomic load, so calls through a slot never take a lock.
pub struct Slot<F: Copy + Send + Sync + 'static> {
    symbol: &'static str,
    stub: F,
    bound: AtomicPtr<c_void>,
}

impl<F: Copy + Send + Sync + 'static> Slot<F> {
    /// Create an unbound slot.
    ///
    /// # Safety
    ///
    /// `F` must be an `unsafe extern "C" fn` type, and every address later
    /// bound to this slot must point to a function with exactly that
    /// signature.
    pub const unsafe fn new(symbol: &'static str, stub: F) -> Self {
        assert!(
            size_of::<F>() == size_of::<*mut c_void>(),
            "slot type must be a function pointer"
        );
        Self {
            symbol,
            stub,
            bound: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The current target: the bound implementation, or the stub.
    pub fn get(&self) -> F {
        match SymbolAddress::new(self.bound.load(Ordering::Acquire)) {
            Some(address) => unsafe { address.cast::<F>() },
            None => self.stub,
        }
    }

    pub fn stub(&self) -> F {
        self.stub
    }
}

impl<F: Copy + Send + Sync + 'static> SlotBinding for Slot<F> {
    fn symbol(&self) -> &'static str {
        self.symbol
    }

    fn bind(&self, address: SymbolAddress) {
        self.bound.store(address.as_ptr(), Ordering::Release);
    }

    fn revert(&self) {
        self.bound.store(ptr::null_mut(), Ordering::Release);
    }

    fn is_bound(&self) -> bool {
        !self.bound.load(Ordering::Acquire).is_null()
    }
}
