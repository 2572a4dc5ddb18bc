//! Allocation, copies in all four directions, and swap.
//!
//! A byte count of `0` means "auto": from the offset to the end of the
//! device buffer involved.

use std::ffi::{c_char, c_int, c_void};

use parking_lot::Mutex;

use weft_core::{DeviceId, ElementType, MemoryId, MemoryKind, Result, RuntimeError, TransferId};

use crate::{call, device_handle, memory_handle, rt, write_out};

/// An asynchronous read whose destination is filled in when its device is
/// finished.
struct PendingRead {
    device: DeviceId,
    transfer: TransferId,
    dst: usize,
}

static PENDING: Mutex<Vec<PendingRead>> = parking_lot::const_mutex(Vec::new());

/// Deliver every completed asynchronous read of `device`. Reads on streams
/// that have not finished stay pending.
pub(crate) fn complete_pending(device: DeviceId) -> Result<()> {
    let mine: Vec<PendingRead> = {
        let mut pending = PENDING.lock();
        let (mine, rest) = pending.drain(..).partition(|p| p.device == device);
        *pending = rest;
        mine
    };
    let mut first_error = None;
    for read in mine {
        match rt().take_transfer(read.transfer) {
            Ok(data) => {
                // Safety: the caller of the async copy guaranteed `dst` stays
                // valid for `data.len()` bytes until the device is finished.
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), read.dst as *mut u8, data.len()) };
            }
            Err(RuntimeError::ResultNotReady(_)) => PENDING.lock().push(read),
            Err(e) => {
                tracing::warn!("dropping asynchronous read {}: {}", read.transfer, e);
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Forget the reads of a device that is being released.
pub(crate) fn forget_pending(device: DeviceId) {
    PENDING.lock().retain(|p| p.device != device);
}

fn element_type(tag: c_int) -> Result<ElementType> {
    ElementType::from_tag(tag)
        .ok_or_else(|| RuntimeError::InvalidArgument(format!("unknown element type tag {tag}")))
}

/// Resolve an "auto" byte count against `mem`.
fn byte_count(mem: MemoryId, bytes: u64, offset: u64) -> Result<u64> {
    if bytes != 0 {
        return Ok(bytes);
    }
    let size = rt().memory_size(mem)?;
    size.checked_sub(offset).ok_or(RuntimeError::OutOfBounds {
        offset,
        bytes: 0,
        size,
    })
}

/// Borrow `len` host bytes at `ptr`.
///
/// # Safety
///
/// `ptr` must be valid for reads of `len` bytes (or `len` must be zero).
unsafe fn host_bytes<'a>(ptr: *const c_void, len: u64) -> Result<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(RuntimeError::InvalidArgument("host pointer is null".into()));
    }
    let len = usize::try_from(len).map_err(|_| RuntimeError::InvalidArgument(format!("{len} bytes")))?;
    Ok(std::slice::from_raw_parts(ptr as *const u8, len))
}

/// # Safety
///
/// Same as [`host_bytes`], for writes.
unsafe fn host_bytes_mut<'a>(ptr: *mut c_void, len: u64) -> Result<&'a mut [u8]> {
    if len == 0 {
        return Ok(&mut []);
    }
    if ptr.is_null() {
        return Err(RuntimeError::InvalidArgument("host pointer is null".into()));
    }
    let len = usize::try_from(len).map_err(|_| RuntimeError::InvalidArgument(format!("{len} bytes")))?;
    Ok(std::slice::from_raw_parts_mut(ptr as *mut u8, len))
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Allocate `count` elements of the type with tag `type_tag`. When `src` is
/// non-null the buffer is initialized from `count` elements read there.
///
/// # Safety
///
/// `src` must be null or valid for reads of the whole buffer; `out` must be
/// valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_malloc(
    device: u64,
    type_tag: c_int,
    count: u64,
    src: *const c_void,
    out: *mut u64,
) -> c_int {
    call(|| write_out(out, allocate(device, type_tag, count, src, MemoryKind::Device)?.to_bits()))
}

/// [`weft_malloc`] with a placement: `0` device, `1` mapped, `2` managed,
/// `3` managed and mapped.
///
/// # Safety
///
/// Same as [`weft_malloc`].
#[no_mangle]
pub unsafe extern "C" fn weft_malloc_kind(
    device: u64,
    type_tag: c_int,
    count: u64,
    src: *const c_void,
    kind: c_int,
    out: *mut u64,
) -> c_int {
    call(|| {
        let kind = MemoryKind::from_tag(kind)
            .ok_or_else(|| RuntimeError::InvalidArgument(format!("unknown memory kind {kind}")))?;
        write_out(out, allocate(device, type_tag, count, src, kind)?.to_bits())
    })
}

/// # Safety
///
/// Same as [`weft_malloc`] for `src`.
unsafe fn allocate(device: u64, type_tag: c_int, count: u64, src: *const c_void, kind: MemoryKind) -> Result<MemoryId> {
    let dev = device_handle(device)?;
    let ty = element_type(type_tag)?;
    if src.is_null() {
        return rt().malloc_kind(dev, ty, count, kind);
    }
    let bytes = count
        .checked_mul(ty.size() as u64)
        .ok_or_else(|| RuntimeError::AllocationFailure {
            bytes: u64::MAX,
            reason: format!("{count} x {ty} overflows"),
        })?;
    rt().malloc_kind_from_bytes(dev, ty, host_bytes(src, bytes)?, kind)
}

/// Host address of a mapped or managed buffer.
///
/// # Safety
///
/// `out` must be valid for a pointer write.
#[no_mangle]
pub unsafe extern "C" fn weft_memory_mapped_pointer(memory: u64, out: *mut *mut c_void) -> c_int {
    call(|| write_out(out, rt().mapped_pointer(memory_handle(memory)?)? as *mut c_void))
}

/// Native identity of a buffer, for [`weft_device_wrap_memory`].
///
/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_memory_native_handle(memory: u64, out: *mut u64) -> c_int {
    call(|| write_out(out, rt().native_memory_handle(memory_handle(memory)?)?))
}

/// Adopt `count` elements of native storage. Freeing the result leaves the
/// storage to its owner.
///
/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_device_wrap_memory(
    device: u64,
    native: u64,
    type_tag: c_int,
    count: u64,
    out: *mut u64,
) -> c_int {
    call(|| {
        let mem = rt().wrap_memory(device_handle(device)?, native, element_type(type_tag)?, count)?;
        write_out(out, mem.to_bits())
    })
}

/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_device_wrap_managed_memory(
    device: u64,
    native: u64,
    type_tag: c_int,
    count: u64,
    out: *mut u64,
) -> c_int {
    call(|| {
        let mem = rt().wrap_managed_memory(device_handle(device)?, native, element_type(type_tag)?, count)?;
        write_out(out, mem.to_bits())
    })
}

/// `1` when the buffer was adopted with a wrap call, `0` otherwise.
///
/// # Safety
///
/// `out` must be valid for a `c_int` write.
#[no_mangle]
pub unsafe extern "C" fn weft_memory_is_wrapped(memory: u64, out: *mut c_int) -> c_int {
    call(|| write_out(out, rt().is_wrapped_memory(memory_handle(memory)?)? as c_int))
}

#[no_mangle]
pub extern "C" fn weft_memory_free(memory: u64) -> c_int {
    call(|| rt().free_memory(memory_handle(memory)?))
}

/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_memory_size(memory: u64, out: *mut u64) -> c_int {
    call(|| write_out(out, rt().memory_size(memory_handle(memory)?)?))
}

/// # Safety
///
/// `out` must be valid for a `u64` write.
#[no_mangle]
pub unsafe extern "C" fn weft_memory_device(memory: u64, out: *mut u64) -> c_int {
    call(|| write_out(out, rt().memory_device(memory_handle(memory)?)?.to_bits()))
}

#[no_mangle]
pub extern "C" fn weft_memory_mode(memory: u64) -> *const c_char {
    let mut mode = None;
    call(|| {
        mode = Some(rt().memory_mode(memory_handle(memory)?)?);
        Ok(())
    });
    mode.map_or(std::ptr::null(), |m| m.as_c_str().as_ptr())
}

/// Exchange the storage behind two handles without moving any bytes.
#[no_mangle]
pub extern "C" fn weft_memory_swap(a: u64, b: u64) -> c_int {
    call(|| rt().swap(memory_handle(a)?, memory_handle(b)?))
}

// ---------------------------------------------------------------------------
// Copies
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn weft_copy_mem_to_mem(dst: u64, src: u64, bytes: u64, dst_offset: u64, src_offset: u64) -> c_int {
    call(|| {
        let bytes = (bytes != 0).then_some(bytes);
        rt().copy_mem(memory_handle(dst)?, memory_handle(src)?, bytes, dst_offset, src_offset)
    })
}

/// # Safety
///
/// `src` must be valid for reads of the copied bytes.
#[no_mangle]
pub unsafe extern "C" fn weft_copy_ptr_to_mem(dst: u64, src: *const c_void, bytes: u64, offset: u64) -> c_int {
    call(|| {
        let dst = memory_handle(dst)?;
        let bytes = byte_count(dst, bytes, offset)?;
        rt().copy_from_host(dst, host_bytes(src, bytes)?, offset)
    })
}

/// # Safety
///
/// `dst` must be valid for writes of the copied bytes.
#[no_mangle]
pub unsafe extern "C" fn weft_copy_mem_to_ptr(dst: *mut c_void, src: u64, bytes: u64, offset: u64) -> c_int {
    call(|| {
        let src = memory_handle(src)?;
        let bytes = byte_count(src, bytes, offset)?;
        rt().copy_to_host(host_bytes_mut(dst, bytes)?, src, offset)
    })
}

/// Host-to-host copy; the regions may overlap.
///
/// # Safety
///
/// `dst` and `src` must be valid for `bytes` bytes.
#[no_mangle]
pub unsafe extern "C" fn weft_memcpy(dst: *mut c_void, src: *const c_void, bytes: u64) -> c_int {
    call(|| {
        if bytes == 0 {
            return Ok(());
        }
        if dst.is_null() || src.is_null() {
            return Err(RuntimeError::InvalidArgument("host pointer is null".into()));
        }
        let len = usize::try_from(bytes).map_err(|_| RuntimeError::InvalidArgument(format!("{bytes} bytes")))?;
        std::ptr::copy(src as *const u8, dst as *mut u8, len);
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn weft_async_copy_mem_to_mem(
    dst: u64,
    src: u64,
    bytes: u64,
    dst_offset: u64,
    src_offset: u64,
) -> c_int {
    call(|| {
        let bytes = (bytes != 0).then_some(bytes);
        rt().async_copy_mem(memory_handle(dst)?, memory_handle(src)?, bytes, dst_offset, src_offset)
    })
}

/// The source bytes are captured before this returns.
///
/// # Safety
///
/// `src` must be valid for reads of the copied bytes.
#[no_mangle]
pub unsafe extern "C" fn weft_async_copy_ptr_to_mem(dst: u64, src: *const c_void, bytes: u64, offset: u64) -> c_int {
    call(|| {
        let dst = memory_handle(dst)?;
        let bytes = byte_count(dst, bytes, offset)?;
        rt().async_copy_from_host(dst, host_bytes(src, bytes)?, offset)
    })
}

/// Enqueue a read into `dst`. The bytes land when the owning device is
/// finished with [`crate::weft_device_finish`].
///
/// # Safety
///
/// `dst` must stay valid for writes of the copied bytes until then.
#[no_mangle]
pub unsafe extern "C" fn weft_async_copy_mem_to_ptr(dst: *mut c_void, src: u64, bytes: u64, offset: u64) -> c_int {
    call(|| {
        let src = memory_handle(src)?;
        let bytes = byte_count(src, bytes, offset)?;
        if bytes != 0 && dst.is_null() {
            return Err(RuntimeError::InvalidArgument("host pointer is null".into()));
        }
        let device = rt().memory_device(src)?;
        let transfer = rt().async_copy_to_host(src, Some(bytes), offset)?;
        PENDING.lock().push(PendingRead {
            device,
            transfer,
            dst: dst as usize,
        });
        Ok(())
    })
}

/// Host-to-host copies complete immediately.
///
/// # Safety
///
/// Same as [`weft_memcpy`].
#[no_mangle]
pub unsafe extern "C" fn weft_async_memcpy(dst: *mut c_void, src: *const c_void, bytes: u64) -> c_int {
    weft_memcpy(dst, src, bytes)
}
