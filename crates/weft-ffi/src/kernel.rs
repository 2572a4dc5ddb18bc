//! Kernel build, launch and introspection.

use std::ffi::{c_char, c_int};

use weft_core::{Dim, KernelBuildOptions, KernelId, KernelSource, Result, RuntimeError, WorkingDims};

use crate::args::{WeftArgList, WeftBuildOptions};
use crate::{call, call_string, device_handle, kernel_handle, rt, str_arg, write_out};

/// Launch geometry as seen from C.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeftDims {
    pub dims: u32,
    pub items_per_group: Dim,
    pub groups: Dim,
}

impl From<WorkingDims> for WeftDims {
    fn from(d: WorkingDims) -> Self {
        Self {
            dims: d.dims() as u32,
            items_per_group: d.items_per_group(),
            groups: d.groups(),
        }
    }
}

impl TryFrom<WeftDims> for WorkingDims {
    type Error = RuntimeError;

    fn try_from(d: WeftDims) -> Result<Self> {
        let dims = u8::try_from(d.dims)
            .map_err(|_| RuntimeError::InvalidArgument(format!("working dims must be 1, 2 or 3, got {}", d.dims)))?;
        WorkingDims::new(dims, d.items_per_group, d.groups)
    }
}

unsafe fn options<'a>(options: *const WeftBuildOptions) -> Option<&'a KernelBuildOptions> {
    options.as_ref().map(|o| &o.inner)
}

unsafe fn build(
    device: u64,
    source: KernelSource,
    entry_point: *const c_char,
    opts: *const WeftBuildOptions,
    out: *mut u64,
) -> c_int {
    call(|| {
        let dev = device_handle(device)?;
        let entry = str_arg(entry_point, "entry point")?;
        let kernel = rt().build_kernel(dev, &source, entry, options(opts))?;
        write_out(out, kernel.to_bits())
    })
}

/// Build from source text. `options` may be null.
///
/// # Safety
///
/// `source` and `entry_point` must be valid C strings, `options` null or
/// live, `out` valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_build_kernel(
    device: u64,
    source: *const c_char,
    entry_point: *const c_char,
    options: *const WeftBuildOptions,
    out: *mut u64,
) -> c_int {
    match str_arg(source, "source") {
        Ok(text) => build(device, KernelSource::inline(text), entry_point, options, out),
        Err(e) => call(|| Err(e)),
    }
}

/// Build from a source file.
///
/// # Safety
///
/// As for [`weft_build_kernel`], with `path` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn weft_build_kernel_from_file(
    device: u64,
    path: *const c_char,
    entry_point: *const c_char,
    options: *const WeftBuildOptions,
    out: *mut u64,
) -> c_int {
    match str_arg(path, "path") {
        Ok(path) => build(device, KernelSource::file(path), entry_point, options, out),
        Err(e) => call(|| Err(e)),
    }
}

/// Load a precompiled binary. Build options do not apply.
///
/// # Safety
///
/// `path` and `entry_point` must be valid C strings, `out` valid for a
/// `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_build_kernel_from_binary(
    device: u64,
    path: *const c_char,
    entry_point: *const c_char,
    out: *mut u64,
) -> c_int {
    match str_arg(path, "path") {
        Ok(path) => build(device, KernelSource::binary(path), entry_point, std::ptr::null(), out),
        Err(e) => call(|| Err(e)),
    }
}

/// Build a kernel written in an alternate dialect (`"loopy"`, ...).
///
/// # Safety
///
/// As for [`weft_build_kernel_from_file`], with `dialect` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn weft_build_kernel_from_dialect(
    device: u64,
    dialect: *const c_char,
    path: *const c_char,
    entry_point: *const c_char,
    options: *const WeftBuildOptions,
    out: *mut u64,
) -> c_int {
    let source = str_arg(dialect, "dialect")
        .and_then(|d| Ok(KernelSource::dialect(d, str_arg(path, "path")?)));
    match source {
        Ok(source) => build(device, source, entry_point, options, out),
        Err(e) => call(|| Err(e)),
    }
}

#[no_mangle]
pub extern "C" fn weft_kernel_free(kernel: u64) -> c_int {
    call(|| rt().free_kernel(kernel_handle(kernel)?))
}

#[no_mangle]
pub extern "C" fn weft_kernel_name(kernel: u64) -> *const c_char {
    call_string(|| rt().kernel_name(kernel_handle(kernel)?))
}

#[no_mangle]
pub extern "C" fn weft_kernel_mode(kernel: u64) -> *const c_char {
    let mut mode = None;
    call(|| {
        mode = Some(rt().kernel_mode(kernel_handle(kernel)?)?);
        Ok(())
    });
    mode.map_or(std::ptr::null(), |m| m.as_c_str().as_ptr())
}

/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_kernel_device(kernel: u64, out: *mut u64) -> c_int {
    call(|| write_out(out, rt().kernel_device(kernel_handle(kernel)?)?.to_bits()))
}

/// # Safety
///
/// `out` must be valid for a `u32` write.
#[no_mangle]
pub unsafe extern "C" fn weft_kernel_preferred_dim_size(kernel: u64, out: *mut u32) -> c_int {
    call(|| write_out(out, rt().preferred_dim_size(kernel_handle(kernel)?)?))
}

/// # Safety
///
/// `dims` must point to a readable [`WeftDims`].
#[no_mangle]
pub unsafe extern "C" fn weft_kernel_set_working_dims(kernel: u64, dims: *const WeftDims) -> c_int {
    call(|| {
        let dims = dims
            .as_ref()
            .ok_or_else(|| RuntimeError::InvalidArgument("dims are null".into()))?;
        rt().set_working_dims(kernel_handle(kernel)?, WorkingDims::try_from(*dims)?)
    })
}

/// # Safety
///
/// `out` must be valid for a [`WeftDims`] write.
#[no_mangle]
pub unsafe extern "C" fn weft_kernel_working_dims(kernel: u64, out: *mut WeftDims) -> c_int {
    call(|| write_out(out, rt().working_dims(kernel_handle(kernel)?)?.into()))
}

/// Enqueue one launch on the device's current stream. Returns as soon as
/// the work is queued; nothing is enqueued if any argument is rejected.
///
/// # Safety
///
/// `args` must be null (no arguments) or a live argument list.
#[no_mangle]
pub unsafe extern "C" fn weft_kernel_run(kernel: u64, args: *const WeftArgList) -> c_int {
    call(|| {
        let id: KernelId = kernel_handle(kernel)?;
        let args = match args.as_ref() {
            Some(list) => list.resolve()?,
            None => Vec::new(),
        };
        rt().run(id, &args)
    })
}

/// Seconds taken by the kernel's most recent completed run.
///
/// # Safety
///
/// `out` must be valid for an `f64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_kernel_time_taken(kernel: u64, out: *mut f64) -> c_int {
    call(|| write_out(out, rt().time_taken(kernel_handle(kernel)?)?.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dims_conversion() {
        let wd = WorkingDims::new(2, Dim::xy(8, 4), Dim::xy(2, 2)).unwrap();
        let c = WeftDims::from(wd);
        assert_eq!(c.dims, 2);
        assert_eq!(WorkingDims::try_from(c).unwrap(), wd);

        let bad = WeftDims { dims: 300, ..c };
        assert!(WorkingDims::try_from(bad).is_err());
        let zero = WeftDims { dims: 0, ..c };
        assert!(WorkingDims::try_from(zero).is_err());
    }
}
