//! Devices, streams, tags and the background device.

use std::ffi::{c_char, c_int};

use weft_core::{RawHandle, Tag};

use crate::memory::{complete_pending, forget_pending};
use crate::{call, call_string, device_handle, rt, str_arg, stream_handle, write_out};

/// Create a device. `mode` is a mode name such as `"Serial"` or `"CUDA"`.
///
/// # Safety
///
/// `mode` must be a valid C string and `out` valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_create_device(
    mode: *const c_char,
    platform_id: c_int,
    device_id: c_int,
    out: *mut u64,
) -> c_int {
    call(|| {
        let mode = str_arg(mode, "mode")?.parse()?;
        let dev = rt().create_device(mode, platform_id, device_id)?;
        write_out(out, dev.to_bits())
    })
}

/// Create a device from an info string: `"mode = OpenMP, deviceID = 1"`.
///
/// # Safety
///
/// `info` must be a valid C string and `out` valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_create_device_from_info(info: *const c_char, out: *mut u64) -> c_int {
    call(|| {
        let dev = rt().create_device_from_info(str_arg(info, "info")?)?;
        write_out(out, dev.to_bits())
    })
}

/// Release a device with all of its streams, buffers and kernels. Freeing an
/// already released device succeeds.
#[no_mangle]
pub extern "C" fn weft_device_free(device: u64) -> c_int {
    call(|| {
        let dev = device_handle(device)?;
        forget_pending(dev);
        rt().free_device(dev)
    })
}

/// The device's mode name, or null on failure. Points at static storage.
#[no_mangle]
pub extern "C" fn weft_device_mode(device: u64) -> *const c_char {
    let mut mode = None;
    call(|| {
        mode = Some(rt().device_mode(device_handle(device)?)?);
        Ok(())
    });
    mode.map_or(std::ptr::null(), |m| m.as_c_str().as_ptr())
}

/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_device_bytes_allocated(device: u64, out: *mut u64) -> c_int {
    call(|| write_out(out, rt().bytes_allocated(device_handle(device)?)?))
}

/// # Safety
///
/// `compiler` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn weft_device_set_compiler(device: u64, compiler: *const c_char) -> c_int {
    call(|| rt().set_compiler(device_handle(device)?, str_arg(compiler, "compiler")?))
}

/// # Safety
///
/// `flags` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn weft_device_set_compiler_flags(device: u64, flags: *const c_char) -> c_int {
    call(|| rt().set_compiler_flags(device_handle(device)?, str_arg(flags, "flags")?))
}

/// # Safety
///
/// `script` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn weft_device_set_compiler_env_script(device: u64, script: *const c_char) -> c_int {
    call(|| rt().set_compiler_env_script(device_handle(device)?, str_arg(script, "script")?))
}

#[no_mangle]
pub extern "C" fn weft_device_compiler(device: u64) -> *const c_char {
    call_string(|| Ok(rt().compiler_settings(device_handle(device)?)?.compiler))
}

#[no_mangle]
pub extern "C" fn weft_device_compiler_flags(device: u64) -> *const c_char {
    call_string(|| Ok(rt().compiler_settings(device_handle(device)?)?.flags))
}

#[no_mangle]
pub extern "C" fn weft_device_compiler_env_script(device: u64) -> *const c_char {
    call_string(|| Ok(rt().compiler_settings(device_handle(device)?)?.env_script))
}

#[no_mangle]
pub extern "C" fn weft_device_flush(device: u64) -> c_int {
    call(|| rt().flush(device_handle(device)?))
}

/// Wait for the device's current stream, then deliver any asynchronous
/// reads into host memory that have completed.
#[no_mangle]
pub extern "C" fn weft_device_finish(device: u64) -> c_int {
    call(|| {
        let dev = device_handle(device)?;
        rt().finish(dev)?;
        complete_pending(dev)
    })
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_device_create_stream(device: u64, out: *mut u64) -> c_int {
    call(|| write_out(out, rt().create_stream(device_handle(device)?)?.to_bits()))
}

/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_device_get_stream(device: u64, out: *mut u64) -> c_int {
    call(|| write_out(out, rt().current_stream(device_handle(device)?)?.to_bits()))
}

#[no_mangle]
pub extern "C" fn weft_device_set_stream(device: u64, stream: u64) -> c_int {
    call(|| rt().set_stream(device_handle(device)?, stream_handle(stream)?))
}

#[no_mangle]
pub extern "C" fn weft_stream_free(stream: u64) -> c_int {
    call(|| rt().free_stream(stream_handle(stream)?))
}

/// Native identity of a stream, for [`weft_device_wrap_stream`].
///
/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_stream_native_handle(stream: u64, out: *mut u64) -> c_int {
    call(|| write_out(out, rt().native_stream_handle(stream_handle(stream)?)?))
}

/// Adopt a native stream. Freeing the result leaves the stream to its owner.
///
/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_device_wrap_stream(device: u64, native: u64, out: *mut u64) -> c_int {
    call(|| write_out(out, rt().wrap_stream(device_handle(device)?, native)?.to_bits()))
}

/// # Safety
///
/// `out` must be valid for a `c_int` write.
#[no_mangle]
pub unsafe extern "C" fn weft_stream_is_wrapped(stream: u64, out: *mut c_int) -> c_int {
    call(|| write_out(out, rt().is_wrapped_stream(stream_handle(stream)?)? as c_int))
}

/// Enqueue a timestamp marker on the device's current stream.
///
/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_device_tag_stream(device: u64, out: *mut u64) -> c_int {
    call(|| write_out(out, rt().tag_stream(device_handle(device)?)?.raw().0))
}

/// Seconds between two tags of `device`.
///
/// # Safety
///
/// `out` must be valid for an `f64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_device_time_between(device: u64, start: u64, end: u64, out: *mut f64) -> c_int {
    call(|| {
        let dev = device_handle(device)?;
        let elapsed = rt().time_between(
            dev,
            Tag::from_raw(dev, RawHandle(start)),
            Tag::from_raw(dev, RawHandle(end)),
        )?;
        write_out(out, elapsed.as_secs_f64())
    })
}

/// Release a tag. Later queries naming it fail; freeing a tag of a released
/// device succeeds.
#[no_mangle]
pub extern "C" fn weft_device_free_tag(device: u64, tag: u64) -> c_int {
    call(|| {
        let dev = device_handle(device)?;
        rt().free_tag(Tag::from_raw(dev, RawHandle(tag)))
    })
}

// ---------------------------------------------------------------------------
// Device listing
// ---------------------------------------------------------------------------

/// Table of every device the registered backends report. Valid until the
/// next string-returning call on this thread.
#[no_mangle]
pub extern "C" fn weft_available_devices() -> *const c_char {
    call_string(|| Ok(rt().available_devices_report()))
}

/// Print [`weft_available_devices`] to standard output.
#[no_mangle]
pub extern "C" fn weft_print_available_devices() -> c_int {
    call(|| {
        print!("{}", rt().available_devices_report());
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Background device and global settings
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn weft_set_device(device: u64) -> c_int {
    call(|| rt().background().set_device(device_handle(device)?))
}

/// # Safety
///
/// `info` must be a valid C string and `out` null or valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_set_device_from_info(info: *const c_char, out: *mut u64) -> c_int {
    call(|| {
        let dev = rt().background().set_device_from_info(str_arg(info, "info")?)?;
        if out.is_null() {
            return Ok(());
        }
        write_out(out, dev.to_bits())
    })
}

/// The background device, created on first use.
///
/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_get_device(out: *mut u64) -> c_int {
    call(|| write_out(out, rt().background().device()?.to_bits()))
}

/// # Safety
///
/// `compiler` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn weft_set_compiler(compiler: *const c_char) -> c_int {
    call(|| rt().background().set_compiler(str_arg(compiler, "compiler")?))
}

/// # Safety
///
/// `flags` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn weft_set_compiler_flags(flags: *const c_char) -> c_int {
    call(|| rt().background().set_compiler_flags(str_arg(flags, "flags")?))
}

/// # Safety
///
/// `script` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn weft_set_compiler_env_script(script: *const c_char) -> c_int {
    call(|| rt().background().set_compiler_env_script(str_arg(script, "script")?))
}

/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_create_stream(out: *mut u64) -> c_int {
    call(|| write_out(out, rt().background().create_stream()?.to_bits()))
}

/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_get_stream(out: *mut u64) -> c_int {
    call(|| write_out(out, rt().background().stream()?.to_bits()))
}

#[no_mangle]
pub extern "C" fn weft_set_stream(stream: u64) -> c_int {
    call(|| rt().background().set_stream(stream_handle(stream)?))
}

#[no_mangle]
pub extern "C" fn weft_set_verbose_compilation(verbose: c_int) {
    rt().set_verbose_compilation(verbose != 0);
}

#[no_mangle]
pub extern "C" fn weft_finish() -> c_int {
    call(|| {
        let bg = rt().background();
        bg.finish()?;
        complete_pending(bg.device()?)
    })
}

#[no_mangle]
pub extern "C" fn weft_flush() -> c_int {
    call(|| rt().background().flush())
}
