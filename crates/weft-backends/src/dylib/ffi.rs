//! Runtime-loaded `weft_rt_*` function pointers.
//!
//! An external device runtime (a CUDA, HIP or OpenCL driver shim, say) is a
//! shared library exporting the symbols below. Every call returns a status
//! code; handles are opaque `u64`s owned by the library.
//!
//! Interop entry points (`weft_rt_malloc_kind`, `weft_rt_mapped_pointer`,
//! `weft_rt_wrap_memory`, `weft_rt_wrap_stream`, `weft_rt_release_tag`,
//! `weft_rt_list_devices`) are optional; a library without them still loads.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::path::Path;

use libloading::Library;

use weft_core::BackendError;

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

pub type RtStatus = c_int;
pub const RT_SUCCESS: RtStatus = 0;
pub const RT_UNAVAILABLE: RtStatus = 1;
pub const RT_UNSUPPORTED_MODE: RtStatus = 2;
pub const RT_OUT_OF_MEMORY: RtStatus = 3;
pub const RT_COMPILE_ERROR: RtStatus = 4;
pub const RT_INVALID_HANDLE: RtStatus = 5;
pub const RT_UNSUPPORTED_ARGUMENT: RtStatus = 6;
pub const RT_NOT_READY: RtStatus = 7;
pub const RT_EXECUTION_ERROR: RtStatus = 8;

// Copy directions
pub const RT_COPY_HOST_TO_DEVICE: c_int = 1;
pub const RT_COPY_DEVICE_TO_HOST: c_int = 2;
pub const RT_COPY_DEVICE_TO_DEVICE: c_int = 3;

// Kernel source kinds
pub const RT_SOURCE_INLINE: c_int = 0;
pub const RT_SOURCE_FILE: c_int = 1;
pub const RT_SOURCE_BINARY: c_int = 2;
pub const RT_SOURCE_DIALECT: c_int = 3;

// Kernel argument kinds
pub const RT_ARG_MEMORY: c_int = 0;
pub const RT_ARG_SCALAR: c_int = 1;
pub const RT_ARG_POINTER: c_int = 2;

// ---------------------------------------------------------------------------
// Shared structs
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtCopy {
    pub direction: c_int,
    pub is_async: c_int,
    pub dst: u64,
    pub dst_offset: u64,
    pub src: u64,
    pub src_offset: u64,
    /// Host side of a host transfer, null for device-to-device.
    pub host: *mut c_void,
    pub bytes: u64,
}

#[repr(C)]
pub struct RtBuild {
    pub source_kind: c_int,
    /// Source text for inline builds, a path otherwise.
    pub source: *const c_char,
    /// Dialect name for `RT_SOURCE_DIALECT`, null otherwise.
    pub dialect: *const c_char,
    pub entry_point: *const c_char,
    /// `#define` lines, one per build define, in order.
    pub defines_header: *const c_char,
    /// `-I<path>` flags separated by spaces.
    pub include_flags: *const c_char,
    pub compiler: *const c_char,
    pub compiler_flags: *const c_char,
    pub env_script: *const c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtDims {
    pub dims: u32,
    pub items: [u64; 3],
    pub groups: [u64; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtArg {
    pub kind: c_int,
    /// Element-type tag for scalars and pointers.
    pub type_tag: c_int,
    /// Memory handle, native-endian scalar bits, or host address.
    pub value: u64,
    pub bytes: u64,
}

// ---------------------------------------------------------------------------
// Function signatures
// ---------------------------------------------------------------------------

type FnModes = unsafe extern "C" fn() -> *const c_char;
type FnLastError = unsafe extern "C" fn() -> *const c_char;
type FnCreateDevice = unsafe extern "C" fn(*const c_char, c_int, c_int, *mut u64) -> RtStatus;
type FnFreeDevice = unsafe extern "C" fn(u64) -> RtStatus;
type FnCreateStream = unsafe extern "C" fn(u64, *mut u64) -> RtStatus;
type FnStreamOp = unsafe extern "C" fn(u64, u64) -> RtStatus;
type FnTagStream = unsafe extern "C" fn(u64, u64, *mut u64) -> RtStatus;
type FnSeconds = unsafe extern "C" fn(u64, u64, u64, *mut f64) -> RtStatus;
type FnMalloc = unsafe extern "C" fn(u64, u64, *const c_void, *mut u64) -> RtStatus;
type FnRelease = unsafe extern "C" fn(u64, u64) -> RtStatus;
type FnCopy = unsafe extern "C" fn(u64, u64, *const RtCopy, *mut u64) -> RtStatus;
type FnTakeRead = unsafe extern "C" fn(u64, u64, *mut c_void, u64) -> RtStatus;
type FnBuildKernel = unsafe extern "C" fn(u64, *const RtBuild, *mut u64) -> RtStatus;
type FnPreferredDimSize = unsafe extern "C" fn(u64, u64, *mut u32) -> RtStatus;
type FnRunKernel = unsafe extern "C" fn(
    u64,          // device
    u64,          // stream
    u64,          // kernel
    *const RtDims,
    *const RtArg,
    usize,        // argument count
    *mut u64,     // run handle, or offending argument index
) -> RtStatus;
type FnRunElapsed = unsafe extern "C" fn(u64, u64, *mut f64) -> RtStatus;
/// Like `FnMalloc` with a `MemoryKind` tag after the byte count.
type FnMallocKind = unsafe extern "C" fn(u64, u64, c_int, *const c_void, *mut u64) -> RtStatus;
type FnMappedPointer = unsafe extern "C" fn(u64, u64, *mut *mut c_void) -> RtStatus;
type FnWrapMemory = unsafe extern "C" fn(u64, u64, u64, *mut u64) -> RtStatus;
type FnWrapStream = unsafe extern "C" fn(u64, u64, *mut u64) -> RtStatus;
/// Newline-separated device descriptions for a mode name.
type FnListDevices = unsafe extern "C" fn(*const c_char) -> *const c_char;

// ---------------------------------------------------------------------------
// Loaded API
// ---------------------------------------------------------------------------

pub struct RtApi {
    /// `None` for tables assembled in-process.
    pub(super) _lib: Option<Library>,
    pub modes: FnModes,
    pub last_error: FnLastError,
    pub create_device: FnCreateDevice,
    pub free_device: FnFreeDevice,
    pub create_stream: FnCreateStream,
    pub free_stream: FnStreamOp,
    pub flush: FnStreamOp,
    pub finish: FnStreamOp,
    pub tag_stream: FnTagStream,
    pub time_between: FnSeconds,
    pub malloc: FnMalloc,
    pub free_memory: FnRelease,
    pub copy: FnCopy,
    pub take_read: FnTakeRead,
    pub build_kernel: FnBuildKernel,
    pub free_kernel: FnRelease,
    pub preferred_dim_size: FnPreferredDimSize,
    pub run_kernel: FnRunKernel,
    pub run_elapsed: FnRunElapsed,
    pub release_run: FnRelease,
    pub malloc_kind: Option<FnMallocKind>,
    pub mapped_pointer: Option<FnMappedPointer>,
    pub wrap_memory: Option<FnWrapMemory>,
    pub wrap_stream: Option<FnWrapStream>,
    pub release_tag: Option<FnRelease>,
    pub list_devices: Option<FnListDevices>,
}

// Safety: the library contract requires every entry point to be callable
// from any thread.
unsafe impl Send for RtApi {}
unsafe impl Sync for RtApi {}

impl RtApi {
    pub fn load(path: &Path) -> Result<Self, BackendError> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| BackendError::Unavailable(format!("{}: {e}", path.display())))?;

        fn sym<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, BackendError> {
            unsafe { lib.get::<T>(name) }.map(|s| *s).map_err(|e| {
                let printable = String::from_utf8_lossy(&name[..name.len().saturating_sub(1)]);
                BackendError::Unavailable(format!("missing symbol {printable}: {e}"))
            })
        }

        fn sym_opt<T: Copy>(lib: &Library, name: &[u8]) -> Option<T> {
            unsafe { lib.get::<T>(name) }.ok().map(|s| *s)
        }

        Ok(RtApi {
            modes: sym(&lib, b"weft_rt_modes\0")?,
            last_error: sym(&lib, b"weft_rt_last_error\0")?,
            create_device: sym(&lib, b"weft_rt_create_device\0")?,
            free_device: sym(&lib, b"weft_rt_free_device\0")?,
            create_stream: sym(&lib, b"weft_rt_create_stream\0")?,
            free_stream: sym(&lib, b"weft_rt_free_stream\0")?,
            flush: sym(&lib, b"weft_rt_flush\0")?,
            finish: sym(&lib, b"weft_rt_finish\0")?,
            tag_stream: sym(&lib, b"weft_rt_tag_stream\0")?,
            time_between: sym(&lib, b"weft_rt_time_between\0")?,
            malloc: sym(&lib, b"weft_rt_malloc\0")?,
            free_memory: sym(&lib, b"weft_rt_free_memory\0")?,
            copy: sym(&lib, b"weft_rt_copy\0")?,
            take_read: sym(&lib, b"weft_rt_take_read\0")?,
            build_kernel: sym(&lib, b"weft_rt_build_kernel\0")?,
            free_kernel: sym(&lib, b"weft_rt_free_kernel\0")?,
            preferred_dim_size: sym(&lib, b"weft_rt_preferred_dim_size\0")?,
            run_kernel: sym(&lib, b"weft_rt_run_kernel\0")?,
            run_elapsed: sym(&lib, b"weft_rt_run_elapsed\0")?,
            release_run: sym(&lib, b"weft_rt_release_run\0")?,
            malloc_kind: sym_opt(&lib, b"weft_rt_malloc_kind\0"),
            mapped_pointer: sym_opt(&lib, b"weft_rt_mapped_pointer\0"),
            wrap_memory: sym_opt(&lib, b"weft_rt_wrap_memory\0"),
            wrap_stream: sym_opt(&lib, b"weft_rt_wrap_stream\0"),
            release_tag: sym_opt(&lib, b"weft_rt_release_tag\0"),
            list_devices: sym_opt(&lib, b"weft_rt_list_devices\0"),
            _lib: Some(lib),
        })
    }

    /// The library's message for its most recent failure on this thread.
    pub fn last_error(&self) -> String {
        let ptr = unsafe { (self.last_error)() };
        if ptr.is_null() {
            return String::new();
        }
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    /// Map a status code onto [`BackendError`]. `out` carries the value some
    /// failures report through the output parameter (requested bytes,
    /// argument index).
    pub fn check(&self, code: RtStatus, context: &str, out: u64) -> Result<(), BackendError> {
        if code == RT_SUCCESS {
            return Ok(());
        }
        Err(status_error(code, context, &self.last_error(), out))
    }

    /// Error for an interop entry point the library does not export.
    pub fn missing(&self, symbol: &str) -> BackendError {
        BackendError::Unavailable(format!("device runtime does not export {symbol}"))
    }
}

/// The [`BackendError`] for a failed call. `message` is the library's last
/// error, possibly empty.
pub fn status_error(code: RtStatus, context: &str, message: &str, out: u64) -> BackendError {
    let detail = || {
        if message.is_empty() {
            context.to_string()
        } else {
            format!("{context}: {message}")
        }
    };
    match code {
        RT_UNAVAILABLE => BackendError::Unavailable(detail()),
        RT_UNSUPPORTED_MODE => BackendError::Other(detail()),
        RT_OUT_OF_MEMORY => BackendError::OutOfMemory { bytes: out },
        RT_COMPILE_ERROR => BackendError::Compile {
            diagnostics: message.to_string(),
        },
        RT_INVALID_HANDLE => BackendError::InvalidHandle(out),
        RT_UNSUPPORTED_ARGUMENT => BackendError::UnsupportedArgument {
            index: out as usize,
            kind: detail(),
        },
        RT_NOT_READY => BackendError::NotReady,
        RT_EXECUTION_ERROR => BackendError::Execution(detail()),
        other => BackendError::Other(format!("{} (status {other})", detail())),
    }
}
