//! The backend collaborator contract.
//!
//! A [`Backend`] owns the real compute resources: thread pools, driver
//! contexts, device allocations, compiled modules. The runtime talks to it
//! only in primitive integers, byte buffers and opaque [`RawHandle`]s; it never
//! shares object graphs with a backend.

use std::fmt;
use std::time::Duration;

use crate::dtype::Scalar;
use crate::error::BackendError;
use crate::kernel::{ArgKind, KernelSource, TaggedPtr, WorkingDims};
use crate::mode::Mode;
use crate::options::KernelBuildOptions;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Backend-issued identity for a device, stream, allocation, kernel, run,
/// tag or pending read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Compiler configuration captured when a kernel is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilerSettings {
    pub compiler: String,
    pub flags: String,
    pub env_script: String,
}

/// Everything a backend needs to build one kernel.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub source: &'a KernelSource,
    pub entry_point: &'a str,
    pub options: &'a KernelBuildOptions,
    pub compiler: &'a CompilerSettings,
}

/// A kernel argument after the runtime has resolved buffer handles.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendArg {
    Memory { raw: RawHandle, bytes: u64 },
    Scalar(Scalar),
    Pointer(TaggedPtr),
    Str(String),
}

impl BackendArg {
    pub fn kind(&self) -> ArgKind {
        match self {
            BackendArg::Memory { .. } => ArgKind::Memory,
            BackendArg::Scalar(s) => ArgKind::Scalar(s.element_type()),
            BackendArg::Pointer(p) => ArgKind::Pointer(p.element),
            BackendArg::Str(_) => ArgKind::Str,
        }
    }
}

/// Where an allocation lives and how the host may reach it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Device storage, reached from the host only through copies.
    #[default]
    Device,
    /// Pinned host storage the device addresses directly.
    Mapped,
    /// One allocation addressable from host and device; the backend migrates
    /// it on demand.
    Managed,
    /// Managed storage that is also pinned.
    ManagedMapped,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 4] = [
        MemoryKind::Device,
        MemoryKind::Mapped,
        MemoryKind::Managed,
        MemoryKind::ManagedMapped,
    ];

    /// Whether the allocation has a host address ([`Backend::mapped_pointer`]).
    pub fn is_host_visible(&self) -> bool {
        !matches!(self, MemoryKind::Device)
    }

    pub fn is_managed(&self) -> bool {
        matches!(self, MemoryKind::Managed | MemoryKind::ManagedMapped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Device => "device",
            MemoryKind::Mapped => "mapped",
            MemoryKind::Managed => "managed",
            MemoryKind::ManagedMapped => "managed-mapped",
        }
    }

    /// Stable numeric tag used at the C ABI.
    pub fn tag(&self) -> i32 {
        match self {
            MemoryKind::Device => 0,
            MemoryKind::Mapped => 1,
            MemoryKind::Managed => 2,
            MemoryKind::ManagedMapped => 3,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A blocking transfer. Offsets and lengths are in bytes and already
/// bounds-checked by the runtime.
#[derive(Debug)]
pub enum CopyOp<'a> {
    HostToDevice {
        dst: RawHandle,
        dst_offset: u64,
        src: &'a [u8],
    },
    DeviceToHost {
        src: RawHandle,
        src_offset: u64,
        dst: &'a mut [u8],
    },
    DeviceToDevice {
        dst: RawHandle,
        dst_offset: u64,
        src: RawHandle,
        src_offset: u64,
        bytes: u64,
    },
}

/// A transfer enqueued on a stream. Host data is owned so the caller may
/// return immediately.
#[derive(Debug)]
pub enum AsyncCopyOp {
    HostToDevice {
        dst: RawHandle,
        dst_offset: u64,
        data: Vec<u8>,
    },
    /// Produces a pending read collected with [`Backend::take_read`].
    DeviceToHost {
        src: RawHandle,
        src_offset: u64,
        bytes: u64,
    },
    DeviceToDevice {
        dst: RawHandle,
        dst_offset: u64,
        src: RawHandle,
        src_offset: u64,
        bytes: u64,
    },
}

/// A compute backend. Implementations must be thread-safe: the runtime may
/// call in from any thread, although never re-entrantly.
pub trait Backend: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Modes this backend can create devices for.
    fn modes(&self) -> &[Mode];

    fn supports(&self, mode: Mode) -> bool {
        self.modes().contains(&mode)
    }

    /// One description per device of `mode`, indexed by device id.
    fn list_devices(&self, mode: Mode) -> Vec<String> {
        if self.supports(mode) {
            vec![format!("{} {mode} device", self.name())]
        } else {
            Vec::new()
        }
    }

    // ---------------------------------------------------------------------
    // Devices and streams
    // ---------------------------------------------------------------------

    fn create_device(&self, mode: Mode, platform_id: i32, device_id: i32) -> BackendResult<RawHandle>;

    /// Release a device and everything the backend still holds for it.
    fn free_device(&self, device: RawHandle) -> BackendResult<()>;

    fn create_stream(&self, device: RawHandle) -> BackendResult<RawHandle>;

    fn free_stream(&self, device: RawHandle, stream: RawHandle) -> BackendResult<()>;

    /// Submit queued work on `stream` without waiting for it.
    fn flush(&self, device: RawHandle, stream: RawHandle) -> BackendResult<()>;

    /// Submit queued work on `stream` and block until it completes.
    fn finish(&self, device: RawHandle, stream: RawHandle) -> BackendResult<()>;

    /// Enqueue a timestamp marker.
    fn tag_stream(&self, device: RawHandle, stream: RawHandle) -> BackendResult<RawHandle>;

    /// Time between two tags. [`BackendError::NotReady`] until both have
    /// been reached.
    fn time_between(&self, device: RawHandle, start: RawHandle, end: RawHandle) -> BackendResult<Duration>;

    /// Drop bookkeeping for a tag that will not be queried again.
    fn release_tag(&self, device: RawHandle, tag: RawHandle) {
        let _ = (device, tag);
    }

    /// Native identity of a stream, for handing to code outside the runtime.
    fn native_stream(&self, device: RawHandle, stream: RawHandle) -> BackendResult<u64> {
        let _ = device;
        Ok(stream.0)
    }

    /// Adopt a native stream created outside the runtime. Freeing the
    /// returned handle must leave the native stream alive.
    fn wrap_stream(&self, device: RawHandle, native: u64) -> BackendResult<RawHandle> {
        let _ = (device, native);
        Err(BackendError::Unavailable(format!("{} cannot wrap native streams", self.name())))
    }

    // ---------------------------------------------------------------------
    // Memory
    // ---------------------------------------------------------------------

    /// Allocate `bytes` bytes, optionally initialized from `init`.
    fn malloc(&self, device: RawHandle, bytes: u64, init: Option<&[u8]>) -> BackendResult<RawHandle>;

    /// Allocate with an explicit placement. Backends without host-visible
    /// allocations keep the default, which serves only [`MemoryKind::Device`].
    fn malloc_kind(
        &self,
        device: RawHandle,
        bytes: u64,
        init: Option<&[u8]>,
        kind: MemoryKind,
    ) -> BackendResult<RawHandle> {
        match kind {
            MemoryKind::Device => self.malloc(device, bytes, init),
            other => Err(BackendError::Unavailable(format!(
                "{} has no {other} allocations",
                self.name()
            ))),
        }
    }

    /// Release an allocation. For a handle from [`Backend::wrap_memory`] only
    /// the wrapper is dropped; the native storage stays with its owner.
    fn free_memory(&self, device: RawHandle, memory: RawHandle) -> BackendResult<()>;

    /// Host address of a host-visible allocation.
    fn mapped_pointer(&self, device: RawHandle, memory: RawHandle) -> BackendResult<usize> {
        let _ = (device, memory);
        Err(BackendError::Unavailable(format!("{} has no mapped memory", self.name())))
    }

    /// Native identity of an allocation, for handing to code outside the
    /// runtime.
    fn native_memory(&self, device: RawHandle, memory: RawHandle) -> BackendResult<u64> {
        let _ = device;
        Ok(memory.0)
    }

    /// Adopt `bytes` bytes of native storage allocated outside the runtime.
    fn wrap_memory(&self, device: RawHandle, native: u64, bytes: u64) -> BackendResult<RawHandle> {
        let _ = (device, native, bytes);
        Err(BackendError::Unavailable(format!("{} cannot wrap native memory", self.name())))
    }

    /// Blocking copy. Work already queued on `stream` is completed first.
    fn copy(&self, device: RawHandle, stream: RawHandle, op: CopyOp<'_>) -> BackendResult<()>;

    /// Enqueue a copy. Returns a pending-read handle for device-to-host
    /// copies and `None` otherwise.
    fn copy_async(&self, device: RawHandle, stream: RawHandle, op: AsyncCopyOp) -> BackendResult<Option<RawHandle>>;

    /// Bytes of a completed pending read. [`BackendError::NotReady`] while the
    /// read is still queued. A successful take releases the read.
    fn take_read(&self, device: RawHandle, read: RawHandle) -> BackendResult<Vec<u8>>;

    // ---------------------------------------------------------------------
    // Kernels
    // ---------------------------------------------------------------------

    fn build_kernel(&self, device: RawHandle, request: &BuildRequest<'_>) -> BackendResult<RawHandle>;

    fn free_kernel(&self, device: RawHandle, kernel: RawHandle) -> BackendResult<()>;

    fn preferred_dim_size(&self, device: RawHandle, kernel: RawHandle) -> BackendResult<u32>;

    /// Launch geometry used when the caller never set one.
    fn default_dims(&self, device: RawHandle, kernel: RawHandle) -> BackendResult<WorkingDims> {
        let _ = (device, kernel);
        Ok(WorkingDims::default())
    }

    /// Whether arguments of `kind` can be marshalled into a native call.
    fn accepts_argument(&self, kind: ArgKind) -> bool {
        !matches!(kind, ArgKind::Str)
    }

    /// Enqueue one launch on `stream`. Returns a run handle whose elapsed time
    /// is queried with [`Backend::run_elapsed`].
    fn run_kernel(
        &self,
        device: RawHandle,
        stream: RawHandle,
        kernel: RawHandle,
        dims: &WorkingDims,
        args: &[BackendArg],
    ) -> BackendResult<RawHandle>;

    /// Elapsed execution time of a run. [`BackendError::NotReady`] until the
    /// run has completed.
    fn run_elapsed(&self, device: RawHandle, run: RawHandle) -> BackendResult<Duration>;

    /// Drop bookkeeping for a run whose timing is no longer needed.
    fn release_run(&self, device: RawHandle, run: RawHandle) {
        let _ = (device, run);
    }
}
