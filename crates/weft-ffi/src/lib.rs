//! # weft-ffi
//!
//! C ABI over the process-wide [`weft_core::Runtime`].
//!
//! Handles cross the boundary as non-zero `u64`s. Every entry point returns a
//! status code (`WEFT_SUCCESS` or one of the negative `WEFT_ERROR_*` values)
//! and writes results through out-pointers; the message for the most recent
//! failure on the calling thread is available from [`weft_last_error`].
//!
//! ```c
//! uint64_t dev, a, k;
//! weft_create_device("Serial", 0, 0, &dev);
//! weft_malloc(dev, WEFT_TYPE_FLOAT, 4, host_a, &a);
//! weft_build_kernel(dev, source, "add", opts, &k);
//! WeftArgList* args = weft_arglist_create();
//! weft_arglist_add_memory(args, 0, a);
//! weft_kernel_run(k, args);
//! weft_device_finish(dev);
//! ```

mod args;
mod device;
mod kernel;
mod memory;

use std::cell::RefCell;
use std::ffi::{c_char, c_int, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use weft_core::{DeviceId, KernelId, MemoryId, Result, Runtime, RuntimeError, StreamId};

pub use args::*;
pub use device::*;
pub use kernel::*;
pub use memory::*;

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

pub const WEFT_SUCCESS: c_int = 0;
pub const WEFT_ERROR_UNSUPPORTED_BACKEND: c_int = -1;
pub const WEFT_ERROR_ALLOCATION_FAILURE: c_int = -2;
pub const WEFT_ERROR_COMPILE: c_int = -3;
pub const WEFT_ERROR_OUT_OF_BOUNDS: c_int = -4;
pub const WEFT_ERROR_CROSS_DEVICE_COPY: c_int = -5;
pub const WEFT_ERROR_UNSUPPORTED_ARGUMENT_TYPE: c_int = -6;
pub const WEFT_ERROR_RESULT_NOT_READY: c_int = -7;
pub const WEFT_ERROR_USE_AFTER_FREE: c_int = -8;
pub const WEFT_ERROR_DEVICE_MISMATCH: c_int = -9;
pub const WEFT_ERROR_INVALID_ARGUMENT: c_int = -10;
pub const WEFT_ERROR_CONFIG: c_int = -11;
pub const WEFT_ERROR_INTERNAL: c_int = -12;
pub const WEFT_ERROR_BACKEND: c_int = -13;

/// Status code for an error.
pub fn status_of(err: &RuntimeError) -> c_int {
    match err {
        RuntimeError::UnsupportedBackend { .. } => WEFT_ERROR_UNSUPPORTED_BACKEND,
        RuntimeError::AllocationFailure { .. } => WEFT_ERROR_ALLOCATION_FAILURE,
        RuntimeError::CompileError { .. } => WEFT_ERROR_COMPILE,
        RuntimeError::OutOfBounds { .. } => WEFT_ERROR_OUT_OF_BOUNDS,
        RuntimeError::CrossDeviceCopy { .. } => WEFT_ERROR_CROSS_DEVICE_COPY,
        RuntimeError::UnsupportedArgumentType { .. } => WEFT_ERROR_UNSUPPORTED_ARGUMENT_TYPE,
        RuntimeError::ResultNotReady(_) => WEFT_ERROR_RESULT_NOT_READY,
        RuntimeError::UseAfterFree(_) => WEFT_ERROR_USE_AFTER_FREE,
        RuntimeError::DeviceMismatch { .. } => WEFT_ERROR_DEVICE_MISMATCH,
        RuntimeError::InvalidArgument(_) => WEFT_ERROR_INVALID_ARGUMENT,
        RuntimeError::Config(_) => WEFT_ERROR_CONFIG,
        RuntimeError::Internal(_) => WEFT_ERROR_INTERNAL,
        RuntimeError::Backend(_) => WEFT_ERROR_BACKEND,
    }
}

// ---------------------------------------------------------------------------
// Thread-local error and string slots
// ---------------------------------------------------------------------------

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
    static LAST_STRING: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn to_cstring(text: String) -> CString {
    CString::new(text).unwrap_or_else(|e| {
        let mut bytes = e.into_vec();
        bytes.retain(|b| *b != 0);
        CString::new(bytes).unwrap_or_default()
    })
}

fn write_error(err: &RuntimeError) -> c_int {
    let message = to_cstring(err.to_string());
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
    status_of(err)
}

fn clear_error() {
    LAST_ERROR.with(|slot| {
        slot.borrow_mut().take();
    });
}

/// Message for the most recent failed call on this thread, or null if the
/// last call succeeded. Valid until the next call on this thread.
#[no_mangle]
pub extern "C" fn weft_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| match slot.borrow().as_ref() {
        Some(s) => s.as_ptr(),
        None => ptr::null(),
    })
}

pub fn last_error_as_str() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map(|s| s.to_string_lossy().into_owned()))
}

/// Park `text` in this thread's string slot. The pointer stays valid until
/// the next string-returning call on the same thread.
fn return_string(text: String) -> *const c_char {
    let s = to_cstring(text);
    LAST_STRING.with(|slot| {
        let mut slot = slot.borrow_mut();
        *slot = Some(s);
        slot.as_ref().map_or(ptr::null(), |s| s.as_ptr())
    })
}

// ---------------------------------------------------------------------------
// Call helpers
// ---------------------------------------------------------------------------

fn rt() -> &'static Runtime {
    weft_backends::runtime()
}

/// Run `f`, translating errors and panics into a status code.
fn call(f: impl FnOnce() -> Result<()>) -> c_int {
    clear_error();
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => WEFT_SUCCESS,
        Ok(Err(e)) => write_error(&e),
        Err(panic) => {
            let what = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            write_error(&RuntimeError::Internal(what))
        }
    }
}

/// Like [`call`] for functions that hand back a string; null on failure.
fn call_string(f: impl FnOnce() -> Result<String>) -> *const c_char {
    let mut out = None;
    let code = call(|| {
        out = Some(f()?);
        Ok(())
    });
    match out {
        Some(text) if code == WEFT_SUCCESS => return_string(text),
        _ => ptr::null(),
    }
}

/// Write a result through an out-pointer; null is rejected.
///
/// # Safety
///
/// `out` must be null or valid for a write of `T`.
unsafe fn write_out<T>(out: *mut T, value: T) -> Result<()> {
    if out.is_null() {
        return Err(RuntimeError::InvalidArgument("output pointer is null".into()));
    }
    out.write(value);
    Ok(())
}

/// Borrow a C string argument.
///
/// # Safety
///
/// `s` must be null or point to a NUL-terminated string that outlives the call.
unsafe fn str_arg<'a>(s: *const c_char, what: &str) -> Result<&'a str> {
    if s.is_null() {
        return Err(RuntimeError::InvalidArgument(format!("{what} is null")));
    }
    CStr::from_ptr(s)
        .to_str()
        .map_err(|_| RuntimeError::InvalidArgument(format!("{what} is not UTF-8")))
}

macro_rules! decode_handle {
    ($fn_name:ident, $ty:ty, $what:literal) => {
        fn $fn_name(bits: u64) -> Result<$ty> {
            <$ty>::from_bits(bits)
                .ok_or_else(|| RuntimeError::InvalidArgument(concat!("null ", $what, " handle").into()))
        }
    };
}

decode_handle!(device_handle, DeviceId, "device");
decode_handle!(stream_handle, StreamId, "stream");
decode_handle!(memory_handle, MemoryId, "memory");
decode_handle!(kernel_handle, KernelId, "kernel");
