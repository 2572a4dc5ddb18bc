use std::sync::Arc;

use crate::backend::{AsyncCopyOp, Backend, CopyOp, MemoryKind, RawHandle};
use crate::config::CrossDevicePolicy;
use crate::dtype::{Element, ElementType};
use crate::handle::{DeviceId, MemoryId, TransferId};
use crate::mode::Mode;
use crate::{Result, RuntimeError};

use super::{MemoryRecord, Runtime, State, TransferRecord};

/// `offset + bytes <= size`, without overflow.
fn check_bounds(offset: u64, bytes: u64, size: u64) -> Result<()> {
    match offset.checked_add(bytes) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RuntimeError::OutOfBounds {
            offset,
            bytes,
            size,
        }),
    }
}

/// Byte size of `count` elements, rejecting overflow.
fn byte_len(element: ElementType, count: u64) -> Result<u64> {
    count
        .checked_mul(element.size() as u64)
        .ok_or_else(|| RuntimeError::AllocationFailure {
            bytes: u64::MAX,
            reason: format!("{count} x {element} overflows"),
        })
}

/// Bytes from `offset` to the end of a buffer of `size` bytes.
fn remaining(offset: u64, size: u64) -> Result<u64> {
    size.checked_sub(offset).ok_or(RuntimeError::OutOfBounds {
        offset,
        bytes: 0,
        size,
    })
}

struct Resolved {
    backend: Arc<dyn Backend>,
    device: DeviceId,
    raw_device: RawHandle,
    raw_stream: RawHandle,
    raw: RawHandle,
    size: u64,
}

impl State {
    fn resolve_memory(&self, id: MemoryId) -> Result<Resolved> {
        let mem = self.memory(id)?;
        let (backend, raw_device, raw_stream) = self.submit_target(mem.device)?;
        Ok(Resolved {
            backend,
            device: mem.device,
            raw_device,
            raw_stream,
            raw: mem.raw,
            size: mem.size,
        })
    }
}

impl Runtime {
    /// Allocate `count` uninitialized elements of `element`.
    pub fn malloc(&self, device: DeviceId, element: ElementType, count: u64) -> Result<MemoryId> {
        self.malloc_kind(device, element, count, MemoryKind::Device)
    }

    /// Allocate `count` elements with an explicit placement.
    pub fn malloc_kind(
        &self,
        device: DeviceId,
        element: ElementType,
        count: u64,
        kind: MemoryKind,
    ) -> Result<MemoryId> {
        let bytes = byte_len(element, count)?;
        self.allocate(device, element, bytes, None, kind)
    }

    /// Pinned host memory the device reads directly; see
    /// [`Runtime::mapped_pointer`].
    pub fn mapped_malloc(&self, device: DeviceId, element: ElementType, count: u64) -> Result<MemoryId> {
        self.malloc_kind(device, element, count, MemoryKind::Mapped)
    }

    pub fn managed_malloc(&self, device: DeviceId, element: ElementType, count: u64) -> Result<MemoryId> {
        self.malloc_kind(device, element, count, MemoryKind::Managed)
    }

    pub fn managed_mapped_malloc(&self, device: DeviceId, element: ElementType, count: u64) -> Result<MemoryId> {
        self.malloc_kind(device, element, count, MemoryKind::ManagedMapped)
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn malloc_with<T: Element>(&self, device: DeviceId, data: &[T]) -> Result<MemoryId> {
        self.malloc_kind_with(device, data, MemoryKind::Device)
    }

    pub fn malloc_kind_with<T: Element>(&self, device: DeviceId, data: &[T], kind: MemoryKind) -> Result<MemoryId> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.allocate(device, T::TYPE, bytes.len() as u64, Some(bytes), kind)
    }

    /// Allocate a buffer of `element` initialized from raw bytes. The length
    /// must be a whole number of elements.
    pub fn malloc_from_bytes(&self, device: DeviceId, element: ElementType, data: &[u8]) -> Result<MemoryId> {
        self.malloc_kind_from_bytes(device, element, data, MemoryKind::Device)
    }

    pub fn malloc_kind_from_bytes(
        &self,
        device: DeviceId,
        element: ElementType,
        data: &[u8],
        kind: MemoryKind,
    ) -> Result<MemoryId> {
        if data.len() % element.size() as usize != 0 {
            return Err(RuntimeError::InvalidArgument(format!(
                "{} bytes is not a whole number of {element} elements",
                data.len()
            )));
        }
        self.allocate(device, element, data.len() as u64, Some(data), kind)
    }

    fn allocate(
        &self,
        device: DeviceId,
        element: ElementType,
        bytes: u64,
        init: Option<&[u8]>,
        kind: MemoryKind,
    ) -> Result<MemoryId> {
        let (backend, raw_device) = self.backend_of(device)?;
        let raw = backend
            .malloc_kind(raw_device, bytes, init, kind)
            .map_err(|e| match RuntimeError::from_backend(e, &device.to_string()) {
                RuntimeError::AllocationFailure { reason, .. } => {
                    RuntimeError::AllocationFailure { bytes, reason }
                }
                other => other,
            })?;

        let mut st = self.lock();
        match st.devices.get_mut(device.0) {
            Some(dev) => dev.bytes_allocated += bytes,
            None => {
                // Device freed while the allocation was in flight.
                let _ = backend.free_memory(raw_device, raw);
                return Err(RuntimeError::UseAfterFree(device.to_string()));
            }
        }
        let id = MemoryId(st.memories.acquire(MemoryRecord {
            device,
            raw,
            size: bytes,
            element,
            kind,
            wrapped: false,
        }));
        tracing::debug!("allocated {} ({} bytes of {}, {}) on {}", id, bytes, element, kind, device);
        Ok(id)
    }

    /// Adopt `count` elements of native device storage, for example from
    /// [`Runtime::native_memory_handle`] or a vendor library. The wrapper
    /// behaves like any buffer, but freeing it leaves the storage to its
    /// owner and it is not counted in [`Runtime::bytes_allocated`].
    pub fn wrap_memory(&self, device: DeviceId, native: u64, element: ElementType, count: u64) -> Result<MemoryId> {
        self.wrap(device, native, element, count, MemoryKind::Device)
    }

    /// Like [`Runtime::wrap_memory`] for native managed storage.
    pub fn wrap_managed_memory(
        &self,
        device: DeviceId,
        native: u64,
        element: ElementType,
        count: u64,
    ) -> Result<MemoryId> {
        self.wrap(device, native, element, count, MemoryKind::Managed)
    }

    fn wrap(
        &self,
        device: DeviceId,
        native: u64,
        element: ElementType,
        count: u64,
        kind: MemoryKind,
    ) -> Result<MemoryId> {
        let bytes = byte_len(element, count)?;
        let (backend, raw_device) = self.backend_of(device)?;
        let raw = backend
            .wrap_memory(raw_device, native, bytes)
            .map_err(|e| RuntimeError::from_backend(e, &format!("native memory 0x{native:x}")))?;

        let mut st = self.lock();
        if !st.devices.is_live(device.0) {
            drop(st);
            let _ = backend.free_memory(raw_device, raw);
            return Err(RuntimeError::UseAfterFree(device.to_string()));
        }
        let id = MemoryId(st.memories.acquire(MemoryRecord {
            device,
            raw,
            size: bytes,
            element,
            kind,
            wrapped: true,
        }));
        tracing::debug!("wrapped native memory 0x{:x} ({} bytes) as {} on {}", native, bytes, id, device);
        Ok(id)
    }

    /// Free a buffer. Freeing twice is a no-op.
    pub fn free_memory(&self, id: MemoryId) -> Result<()> {
        let mut st = self.lock();
        let Some(mem) = st.memories.release(id.0) else {
            tracing::warn!("{} already freed", id);
            return Ok(());
        };
        let dev = st.device_mut(mem.device)?;
        if !mem.wrapped {
            dev.bytes_allocated = dev.bytes_allocated.saturating_sub(mem.size);
        }
        let (backend, raw_device) = (Arc::clone(&dev.backend), dev.raw);
        drop(st);
        backend
            .free_memory(raw_device, mem.raw)
            .map_err(|e| RuntimeError::from_backend(e, &id.to_string()))
    }

    pub fn memory_size(&self, id: MemoryId) -> Result<u64> {
        Ok(self.lock().memory(id)?.size)
    }

    pub fn memory_element(&self, id: MemoryId) -> Result<ElementType> {
        Ok(self.lock().memory(id)?.element)
    }

    /// Number of whole elements the buffer holds.
    pub fn memory_len(&self, id: MemoryId) -> Result<u64> {
        let st = self.lock();
        let mem = st.memory(id)?;
        Ok(mem.size / mem.element.size() as u64)
    }

    pub fn memory_device(&self, id: MemoryId) -> Result<DeviceId> {
        Ok(self.lock().memory(id)?.device)
    }

    pub fn memory_mode(&self, id: MemoryId) -> Result<Mode> {
        let st = self.lock();
        let device = st.memory(id)?.device;
        Ok(st.device(device)?.spec.mode)
    }

    pub fn memory_kind(&self, id: MemoryId) -> Result<MemoryKind> {
        Ok(self.lock().memory(id)?.kind)
    }

    /// Whether the buffer wraps native storage it does not own.
    pub fn is_wrapped_memory(&self, id: MemoryId) -> Result<bool> {
        Ok(self.lock().memory(id)?.wrapped)
    }

    /// Host address of a mapped or managed buffer.
    ///
    /// The address stays valid until the buffer is freed. Host accesses race
    /// with queued device work; finish the owning device before touching it.
    pub fn mapped_pointer(&self, id: MemoryId) -> Result<*mut u8> {
        let (backend, raw_device, raw) = {
            let st = self.lock();
            let mem = st.memory(id)?;
            if !mem.kind.is_host_visible() {
                return Err(RuntimeError::InvalidArgument(format!(
                    "{id} is {} memory and has no host address",
                    mem.kind
                )));
            }
            let dev = st.device(mem.device)?;
            (Arc::clone(&dev.backend), dev.raw, mem.raw)
        };
        let addr = backend
            .mapped_pointer(raw_device, raw)
            .map_err(|e| RuntimeError::from_backend(e, &id.to_string()))?;
        Ok(addr as *mut u8)
    }

    /// Native identity of a buffer, accepted by [`Runtime::wrap_memory`].
    pub fn native_memory_handle(&self, id: MemoryId) -> Result<u64> {
        let (backend, raw_device, raw) = {
            let st = self.lock();
            let mem = st.memory(id)?;
            let dev = st.device(mem.device)?;
            (Arc::clone(&dev.backend), dev.raw, mem.raw)
        };
        backend
            .native_memory(raw_device, raw)
            .map_err(|e| RuntimeError::from_backend(e, &id.to_string()))
    }

    // ---------------------------------------------------------------------
    // Synchronous copies. The receiving buffer is always the first argument.
    // ---------------------------------------------------------------------

    /// Write `src` into `dst` starting at byte `offset`.
    pub fn copy_from_host(&self, dst: MemoryId, src: &[u8], offset: u64) -> Result<()> {
        let r = self.lock().resolve_memory(dst)?;
        check_bounds(offset, src.len() as u64, r.size)?;
        r.backend
            .copy(
                r.raw_device,
                r.raw_stream,
                CopyOp::HostToDevice {
                    dst: r.raw,
                    dst_offset: offset,
                    src,
                },
            )
            .map_err(|e| RuntimeError::from_backend(e, &dst.to_string()))
    }

    /// Fill `dst` from `src` starting at byte `offset`.
    pub fn copy_to_host(&self, dst: &mut [u8], src: MemoryId, offset: u64) -> Result<()> {
        let r = self.lock().resolve_memory(src)?;
        check_bounds(offset, dst.len() as u64, r.size)?;
        r.backend
            .copy(
                r.raw_device,
                r.raw_stream,
                CopyOp::DeviceToHost {
                    src: r.raw,
                    src_offset: offset,
                    dst,
                },
            )
            .map_err(|e| RuntimeError::from_backend(e, &src.to_string()))
    }

    /// Copy `bytes` from `src` to `dst`. `None` copies from `src_offset` to
    /// the end of `src`.
    pub fn copy_mem(
        &self,
        dst: MemoryId,
        src: MemoryId,
        bytes: Option<u64>,
        dst_offset: u64,
        src_offset: u64,
    ) -> Result<()> {
        self.mem_to_mem(dst, src, bytes, dst_offset, src_offset, false)
    }

    /// Write a typed slice at the start of `dst`.
    pub fn write_slice<T: Element>(&self, dst: MemoryId, data: &[T]) -> Result<()> {
        self.copy_from_host(dst, bytemuck::cast_slice(data), 0)
    }

    /// Read the whole buffer as elements of `T`.
    pub fn read_vec<T: Element>(&self, src: MemoryId) -> Result<Vec<T>> {
        let size = self.memory_size(src)?;
        let elem = std::mem::size_of::<T>() as u64;
        let mut bytes = vec![0u8; (size - size % elem) as usize];
        self.copy_to_host(&mut bytes, src, 0)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    // ---------------------------------------------------------------------
    // Asynchronous copies, enqueued on the owning device's current stream.
    // ---------------------------------------------------------------------

    /// Enqueue a write of `src` into `dst`. The bytes are captured before
    /// this returns.
    pub fn async_copy_from_host(&self, dst: MemoryId, src: &[u8], offset: u64) -> Result<()> {
        let r = self.lock().resolve_memory(dst)?;
        check_bounds(offset, src.len() as u64, r.size)?;
        r.backend
            .copy_async(
                r.raw_device,
                r.raw_stream,
                AsyncCopyOp::HostToDevice {
                    dst: r.raw,
                    dst_offset: offset,
                    data: src.to_vec(),
                },
            )
            .map_err(|e| RuntimeError::from_backend(e, &dst.to_string()))?;
        Ok(())
    }

    /// Enqueue a read of `bytes` from `src` (`None` reads to the end). The
    /// data is collected with [`Runtime::take_transfer`] once the stream has
    /// completed.
    pub fn async_copy_to_host(&self, src: MemoryId, bytes: Option<u64>, offset: u64) -> Result<TransferId> {
        let r = self.lock().resolve_memory(src)?;
        let bytes = match bytes {
            Some(b) => b,
            None => remaining(offset, r.size)?,
        };
        check_bounds(offset, bytes, r.size)?;
        let read = r
            .backend
            .copy_async(
                r.raw_device,
                r.raw_stream,
                AsyncCopyOp::DeviceToHost {
                    src: r.raw,
                    src_offset: offset,
                    bytes,
                },
            )
            .map_err(|e| RuntimeError::from_backend(e, &src.to_string()))?
            .ok_or_else(|| {
                RuntimeError::Internal(format!("backend '{}' returned no pending read", r.backend.name()))
            })?;

        let mut st = self.lock();
        let id = TransferId(st.transfers.acquire(TransferRecord {
            device: r.device,
            raw: read,
            bytes,
        }));
        Ok(id)
    }

    pub fn async_copy_mem(
        &self,
        dst: MemoryId,
        src: MemoryId,
        bytes: Option<u64>,
        dst_offset: u64,
        src_offset: u64,
    ) -> Result<()> {
        self.mem_to_mem(dst, src, bytes, dst_offset, src_offset, true)
    }

    /// Collect a completed asynchronous read. Fails with
    /// [`RuntimeError::ResultNotReady`] while the read is still queued; the
    /// transfer stays valid and can be taken again later.
    pub fn take_transfer(&self, id: TransferId) -> Result<Vec<u8>> {
        let (backend, raw_device, raw) = {
            let st = self.lock();
            let t = st.transfer(id)?;
            let dev = st.device(t.device)?;
            (Arc::clone(&dev.backend), dev.raw, t.raw)
        };
        let data = backend
            .take_read(raw_device, raw)
            .map_err(|e| RuntimeError::from_backend(e, &id.to_string()))?;
        self.lock().transfers.release(id.0);
        Ok(data)
    }

    /// Size in bytes of a pending transfer.
    pub fn transfer_len(&self, id: TransferId) -> Result<u64> {
        Ok(self.lock().transfer(id)?.bytes)
    }

    /// Exchange the storage bound to two handles. No bytes move and no
    /// backend call is made.
    pub fn swap(&self, a: MemoryId, b: MemoryId) -> Result<()> {
        let mut st = self.lock();
        st.memory(a)?;
        st.memory(b)?;
        if a == b {
            return Ok(());
        }
        let (x, y) = st
            .memories
            .get2_mut(a.0, b.0)
            .ok_or_else(|| RuntimeError::Internal(format!("cannot borrow {a} and {b}")))?;
        std::mem::swap(x, y);
        Ok(())
    }

    fn mem_to_mem(
        &self,
        dst: MemoryId,
        src: MemoryId,
        bytes: Option<u64>,
        dst_offset: u64,
        src_offset: u64,
        is_async: bool,
    ) -> Result<()> {
        let (d, s) = {
            let st = self.lock();
            (st.resolve_memory(dst)?, st.resolve_memory(src)?)
        };
        let bytes = match bytes {
            Some(b) => b,
            None => remaining(src_offset, s.size)?,
        };
        check_bounds(src_offset, bytes, s.size)?;
        check_bounds(dst_offset, bytes, d.size)?;

        if d.device != s.device {
            return self.cross_device(dst, src, bytes, dst_offset, src_offset, d.device, s.device);
        }

        let result = if is_async {
            d.backend
                .copy_async(
                    d.raw_device,
                    d.raw_stream,
                    AsyncCopyOp::DeviceToDevice {
                        dst: d.raw,
                        dst_offset,
                        src: s.raw,
                        src_offset,
                        bytes,
                    },
                )
                .map(|_| ())
        } else {
            d.backend.copy(
                d.raw_device,
                d.raw_stream,
                CopyOp::DeviceToDevice {
                    dst: d.raw,
                    dst_offset,
                    src: s.raw,
                    src_offset,
                    bytes,
                },
            )
        };
        result.map_err(|e| RuntimeError::from_backend(e, &format!("{src} -> {dst}")))
    }

    #[allow(clippy::too_many_arguments)]
    fn cross_device(
        &self,
        dst: MemoryId,
        src: MemoryId,
        bytes: u64,
        dst_offset: u64,
        src_offset: u64,
        dst_device: DeviceId,
        src_device: DeviceId,
    ) -> Result<()> {
        match self.config.read().cross_device_policy {
            CrossDevicePolicy::Reject => {
                return Err(RuntimeError::CrossDeviceCopy {
                    src: format!("{src} on {src_device}"),
                    dst: format!("{dst} on {dst_device}"),
                })
            }
            CrossDevicePolicy::StageThroughHost => {}
        }
        tracing::warn!(
            "staging {} bytes through host: {} ({}) -> {} ({})",
            bytes,
            src,
            src_device,
            dst,
            dst_device
        );
        let mut staging = vec![0u8; bytes as usize];
        self.copy_to_host(&mut staging, src, src_offset)?;
        self.copy_from_host(dst, &staging, dst_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        assert!(check_bounds(0, 16, 16).is_ok());
        assert!(check_bounds(16, 0, 16).is_ok());
        assert!(matches!(
            check_bounds(1, 16, 16),
            Err(RuntimeError::OutOfBounds { offset: 1, bytes: 16, size: 16 })
        ));
        assert!(check_bounds(u64::MAX, 2, 16).is_err());
    }

    #[test]
    fn test_remaining() {
        assert_eq!(remaining(4, 16).unwrap(), 12);
        assert_eq!(remaining(16, 16).unwrap(), 0);
        assert!(remaining(17, 16).is_err());
    }
}
