//! The runtime: devices, streams, memory and kernels tracked in handle pools
//! and forwarded to registered [`Backend`]s.
//!
//! All bookkeeping sits behind one mutex. Calls that may block on the backend
//! (finish, synchronous copies, kernel builds) drop the lock first, so one
//! thread waiting on a device never stalls the others.

mod background;
mod kernel;
mod memory;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::backend::{Backend, CompilerSettings, MemoryKind, RawHandle};
use crate::config::{DeviceSpec, RuntimeConfig};
use crate::dtype::ElementType;
use crate::handle::{DeviceId, HandlePool, KernelId, MemoryId, StreamId, TransferId};
use crate::kernel::WorkingDims;
use crate::mode::Mode;
use crate::{Result, RuntimeError};

pub use background::Background;

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

pub(crate) struct DeviceRecord {
    backend: Arc<dyn Backend>,
    raw: RawHandle,
    spec: DeviceSpec,
    compiler: CompilerSettings,
    default_stream: StreamId,
    current_stream: StreamId,
    bytes_allocated: u64,
}

pub(crate) struct StreamRecord {
    device: DeviceId,
    raw: RawHandle,
    /// Adopted from a native stream the runtime does not own.
    wrapped: bool,
}

pub(crate) struct MemoryRecord {
    device: DeviceId,
    raw: RawHandle,
    size: u64,
    element: ElementType,
    kind: MemoryKind,
    /// Adopted native storage; not counted in the device's allocation total.
    wrapped: bool,
}

pub(crate) struct KernelRecord {
    device: DeviceId,
    raw: RawHandle,
    name: String,
    preferred_dim_size: u32,
    dims: Option<WorkingDims>,
    last_run: Option<RawHandle>,
}

pub(crate) struct TransferRecord {
    device: DeviceId,
    raw: RawHandle,
    bytes: u64,
}

#[derive(Default)]
pub(crate) struct State {
    devices: HandlePool<DeviceRecord>,
    streams: HandlePool<StreamRecord>,
    memories: HandlePool<MemoryRecord>,
    kernels: HandlePool<KernelRecord>,
    transfers: HandlePool<TransferRecord>,
    background: Option<DeviceId>,
}

impl State {
    fn device(&self, id: DeviceId) -> Result<&DeviceRecord> {
        self.devices
            .get(id.0)
            .ok_or_else(|| RuntimeError::UseAfterFree(id.to_string()))
    }

    fn device_mut(&mut self, id: DeviceId) -> Result<&mut DeviceRecord> {
        self.devices
            .get_mut(id.0)
            .ok_or_else(|| RuntimeError::UseAfterFree(id.to_string()))
    }

    fn stream(&self, id: StreamId) -> Result<&StreamRecord> {
        self.streams
            .get(id.0)
            .ok_or_else(|| RuntimeError::UseAfterFree(id.to_string()))
    }

    fn memory(&self, id: MemoryId) -> Result<&MemoryRecord> {
        self.memories
            .get(id.0)
            .ok_or_else(|| RuntimeError::UseAfterFree(id.to_string()))
    }

    fn kernel(&self, id: KernelId) -> Result<&KernelRecord> {
        self.kernels
            .get(id.0)
            .ok_or_else(|| RuntimeError::UseAfterFree(id.to_string()))
    }

    fn kernel_mut(&mut self, id: KernelId) -> Result<&mut KernelRecord> {
        self.kernels
            .get_mut(id.0)
            .ok_or_else(|| RuntimeError::UseAfterFree(id.to_string()))
    }

    fn transfer(&self, id: TransferId) -> Result<&TransferRecord> {
        self.transfers
            .get(id.0)
            .ok_or_else(|| RuntimeError::UseAfterFree(id.to_string()))
    }

    /// Backend, raw device and raw current stream of a device.
    fn submit_target(&self, id: DeviceId) -> Result<(Arc<dyn Backend>, RawHandle, RawHandle)> {
        let dev = self.device(id)?;
        let stream = self.stream(dev.current_stream)?;
        Ok((Arc::clone(&dev.backend), dev.raw, stream.raw))
    }
}

/// A snapshot of a device's configuration and usage.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub spec: DeviceSpec,
    pub backend: String,
    pub compiler: CompilerSettings,
    pub bytes_allocated: u64,
    pub current_stream: StreamId,
    pub default_stream: StreamId,
}

/// One device a registered backend can create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableDevice {
    pub mode: Mode,
    pub backend: String,
    pub device_id: i32,
    pub description: String,
}

/// Marker enqueued on a stream by [`Runtime::tag_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    device: DeviceId,
    raw: RawHandle,
}

impl Tag {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Backend identity, for passing across the C ABI.
    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn from_raw(device: DeviceId, raw: RawHandle) -> Self {
        Self { device, raw }
    }
}

/// Device runtime over a set of backends.
pub struct Runtime {
    backends: Vec<Arc<dyn Backend>>,
    config: RwLock<RuntimeConfig>,
    state: Mutex<State>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            backends: Vec::new(),
            config: RwLock::new(config),
            state: Mutex::new(State::default()),
        }
    }

    /// Register a backend. Earlier registrations win when two backends
    /// support the same mode.
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        tracing::debug!("registering backend '{}' for {:?}", backend.name(), backend.modes());
        self.backends.push(backend);
        self
    }

    /// The process-wide runtime, created by `init` on first access.
    pub fn global_or_init(init: impl FnOnce() -> Runtime) -> &'static Runtime {
        GLOBAL.get_or_init(init)
    }

    /// The process-wide runtime if it has been initialized.
    pub fn global() -> Option<&'static Runtime> {
        GLOBAL.get()
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config.read().clone()
    }

    pub fn set_verbose_compilation(&self, verbose: bool) {
        self.config.write().verbose_compilation = verbose;
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Modes some registered backend can serve.
    pub fn available_modes(&self) -> Vec<Mode> {
        Mode::ALL
            .into_iter()
            .filter(|m| self.backends.iter().any(|b| b.supports(*m)))
            .collect()
    }

    /// Every device the registered backends report, grouped by mode. For a
    /// mode served by several backends only the one that would create the
    /// device is listed.
    pub fn available_devices(&self) -> Vec<AvailableDevice> {
        let mut out = Vec::new();
        for mode in self.available_modes() {
            let Some(backend) = self.backends.iter().find(|b| b.supports(mode)) else {
                continue;
            };
            for (index, description) in backend.list_devices(mode).into_iter().enumerate() {
                out.push(AvailableDevice {
                    mode,
                    backend: backend.name().to_string(),
                    device_id: i32::try_from(index).unwrap_or(i32::MAX),
                    description,
                });
            }
        }
        out
    }

    /// [`Runtime::available_devices`] as a printable table.
    pub fn available_devices_report(&self) -> String {
        let devices = self.available_devices();
        if devices.is_empty() {
            return "no devices available\n".to_string();
        }
        let mut report = format!("{:<9} {:<10} {:>3}  {}\n", "mode", "backend", "id", "device");
        for d in &devices {
            report.push_str(&format!(
                "{:<9} {:<10} {:>3}  {}\n",
                d.mode.as_str(),
                d.backend,
                d.device_id,
                d.description
            ));
        }
        report
    }

    /// Total live handles across every resource pool.
    pub fn live_handles(&self) -> usize {
        let st = self.state.lock();
        st.devices.len()
            + st.streams.len()
            + st.memories.len()
            + st.kernels.len()
            + st.transfers.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }

    // ---------------------------------------------------------------------
    // Devices
    // ---------------------------------------------------------------------

    /// Create a device on the first backend that serves `mode`.
    pub fn create_device(&self, mode: Mode, platform_id: i32, device_id: i32) -> Result<DeviceId> {
        let spec = DeviceSpec::new(mode, platform_id, device_id);
        let backend = self
            .backends
            .iter()
            .find(|b| b.supports(mode))
            .cloned()
            .ok_or_else(|| RuntimeError::UnsupportedBackend {
                mode: mode.to_string(),
            })?;

        let raw = backend
            .create_device(mode, platform_id, device_id)
            .map_err(|e| RuntimeError::from_backend(e, &spec.to_string()))?;
        let stream_raw = match backend.create_stream(raw) {
            Ok(s) => s,
            Err(e) => {
                let _ = backend.free_device(raw);
                return Err(RuntimeError::from_backend(e, &spec.to_string()));
            }
        };

        let compiler = {
            let cfg = self.config.read();
            CompilerSettings {
                compiler: cfg.compiler.clone().unwrap_or_default(),
                flags: cfg.compiler_flags.clone().unwrap_or_default(),
                env_script: cfg.compiler_env_script.clone().unwrap_or_default(),
            }
        };

        let mut st = self.lock();
        let State {
            devices, streams, ..
        } = &mut *st;
        let handle = devices.acquire_with(|h| {
            let stream = StreamId(streams.acquire(StreamRecord {
                device: DeviceId(h),
                raw: stream_raw,
                wrapped: false,
            }));
            DeviceRecord {
                backend: Arc::clone(&backend),
                raw,
                spec,
                compiler,
                default_stream: stream,
                current_stream: stream,
                bytes_allocated: 0,
            }
        });
        let id = DeviceId(handle);
        tracing::debug!("created {} ({}) on backend '{}'", id, spec, backend.name());
        Ok(id)
    }

    /// Create a device from an info string such as `"mode = Serial"`.
    pub fn create_device_from_info(&self, info: &str) -> Result<DeviceId> {
        let spec = DeviceSpec::parse(info)?;
        self.create_device(spec.mode, spec.platform_id, spec.device_id)
    }

    /// Free a device together with every stream, buffer, kernel and pending
    /// transfer created from it. Freeing twice is a no-op.
    ///
    /// Records are unlinked under the lock; the backend releases them after
    /// it is dropped.
    pub fn free_device(&self, id: DeviceId) -> Result<()> {
        let mut st = self.lock();
        let Some(dev) = st.devices.release(id.0) else {
            tracing::warn!("{} already freed", id);
            return Ok(());
        };
        if st.background == Some(id) {
            st.background = None;
        }

        let owned_by = |d: &DeviceId| *d == id;
        for h in st.transfers.handles_where(|t| owned_by(&t.device)) {
            if let Some(t) = st.transfers.release(h) {
                tracing::debug!("dropping uncollected transfer of {} bytes", t.bytes);
            }
        }
        let kernels: Vec<KernelRecord> = st
            .kernels
            .handles_where(|k| owned_by(&k.device))
            .into_iter()
            .filter_map(|h| st.kernels.release(h))
            .collect();
        let memories: Vec<MemoryRecord> = st
            .memories
            .handles_where(|m| owned_by(&m.device))
            .into_iter()
            .filter_map(|h| st.memories.release(h))
            .collect();
        let streams: Vec<StreamRecord> = st
            .streams
            .handles_where(|s| owned_by(&s.device))
            .into_iter()
            .filter_map(|h| st.streams.release(h))
            .collect();
        drop(st);

        let backend = dev.backend;
        for k in kernels {
            if let Some(run) = k.last_run {
                backend.release_run(dev.raw, run);
            }
            if let Err(e) = backend.free_kernel(dev.raw, k.raw) {
                tracing::warn!("freeing kernel '{}': {}", k.name, e);
            }
        }
        for m in memories {
            if let Err(e) = backend.free_memory(dev.raw, m.raw) {
                tracing::warn!("freeing {} byte buffer: {}", m.size, e);
            }
        }
        for s in streams {
            if let Err(e) = backend.free_stream(dev.raw, s.raw) {
                tracing::warn!("freeing stream {}: {}", s.raw, e);
            }
        }

        backend
            .free_device(dev.raw)
            .map_err(|e| RuntimeError::from_backend(e, &id.to_string()))?;
        tracing::debug!("freed {} ({})", id, dev.spec);
        Ok(())
    }

    pub fn is_live(&self, id: DeviceId) -> bool {
        self.lock().devices.is_live(id.0)
    }

    pub fn device_mode(&self, id: DeviceId) -> Result<Mode> {
        Ok(self.lock().device(id)?.spec.mode)
    }

    pub fn device_info(&self, id: DeviceId) -> Result<DeviceInfo> {
        let st = self.lock();
        let dev = st.device(id)?;
        Ok(DeviceInfo {
            id,
            spec: dev.spec,
            backend: dev.backend.name().to_string(),
            compiler: dev.compiler.clone(),
            bytes_allocated: dev.bytes_allocated,
            current_stream: dev.current_stream,
            default_stream: dev.default_stream,
        })
    }

    pub fn bytes_allocated(&self, id: DeviceId) -> Result<u64> {
        Ok(self.lock().device(id)?.bytes_allocated)
    }

    /// Compiler used for kernels built after this call.
    pub fn set_compiler(&self, id: DeviceId, compiler: &str) -> Result<()> {
        self.lock().device_mut(id)?.compiler.compiler = compiler.to_string();
        Ok(())
    }

    pub fn set_compiler_flags(&self, id: DeviceId, flags: &str) -> Result<()> {
        self.lock().device_mut(id)?.compiler.flags = flags.to_string();
        Ok(())
    }

    pub fn set_compiler_env_script(&self, id: DeviceId, script: &str) -> Result<()> {
        self.lock().device_mut(id)?.compiler.env_script = script.to_string();
        Ok(())
    }

    pub fn compiler_settings(&self, id: DeviceId) -> Result<CompilerSettings> {
        Ok(self.lock().device(id)?.compiler.clone())
    }

    // ---------------------------------------------------------------------
    // Streams
    // ---------------------------------------------------------------------

    pub fn create_stream(&self, device: DeviceId) -> Result<StreamId> {
        let (backend, raw_device) = self.backend_of(device)?;
        let raw = backend
            .create_stream(raw_device)
            .map_err(|e| RuntimeError::from_backend(e, &device.to_string()))?;
        let id = self.adopt_stream(device, &backend, raw_device, raw, false)?;
        tracing::debug!("created {} on {}", id, device);
        Ok(id)
    }

    /// Adopt a native stream, for example one obtained from
    /// [`Runtime::native_stream_handle`] or created by a vendor library.
    /// Freeing the wrapper leaves the native stream to its owner.
    pub fn wrap_stream(&self, device: DeviceId, native: u64) -> Result<StreamId> {
        let (backend, raw_device) = self.backend_of(device)?;
        let raw = backend
            .wrap_stream(raw_device, native)
            .map_err(|e| RuntimeError::from_backend(e, &format!("native stream 0x{native:x}")))?;
        let id = self.adopt_stream(device, &backend, raw_device, raw, true)?;
        tracing::debug!("wrapped native stream 0x{:x} as {} on {}", native, id, device);
        Ok(id)
    }

    /// Native identity of a stream, accepted by [`Runtime::wrap_stream`].
    pub fn native_stream_handle(&self, stream: StreamId) -> Result<u64> {
        let (backend, raw_device, raw) = {
            let st = self.lock();
            let s = st.stream(stream)?;
            let dev = st.device(s.device)?;
            (Arc::clone(&dev.backend), dev.raw, s.raw)
        };
        backend
            .native_stream(raw_device, raw)
            .map_err(|e| RuntimeError::from_backend(e, &stream.to_string()))
    }

    pub fn is_wrapped_stream(&self, stream: StreamId) -> Result<bool> {
        Ok(self.lock().stream(stream)?.wrapped)
    }

    fn backend_of(&self, device: DeviceId) -> Result<(Arc<dyn Backend>, RawHandle)> {
        let st = self.lock();
        let dev = st.device(device)?;
        Ok((Arc::clone(&dev.backend), dev.raw))
    }

    /// Record a backend stream, releasing it if the device went away while
    /// the backend call was in flight.
    fn adopt_stream(
        &self,
        device: DeviceId,
        backend: &Arc<dyn Backend>,
        raw_device: RawHandle,
        raw: RawHandle,
        wrapped: bool,
    ) -> Result<StreamId> {
        let mut st = self.lock();
        if !st.devices.is_live(device.0) {
            drop(st);
            let _ = backend.free_stream(raw_device, raw);
            return Err(RuntimeError::UseAfterFree(device.to_string()));
        }
        Ok(StreamId(st.streams.acquire(StreamRecord {
            device,
            raw,
            wrapped,
        })))
    }

    /// The stream device-scoped async work is currently submitted to.
    pub fn current_stream(&self, device: DeviceId) -> Result<StreamId> {
        Ok(self.lock().device(device)?.current_stream)
    }

    pub fn set_stream(&self, device: DeviceId, stream: StreamId) -> Result<()> {
        let mut st = self.lock();
        let owner = st.stream(stream)?.device;
        if owner != device {
            return Err(RuntimeError::DeviceMismatch {
                resource: stream.to_string(),
                expected: device.to_string(),
                found: owner.to_string(),
            });
        }
        st.device_mut(device)?.current_stream = stream;
        Ok(())
    }

    pub fn stream_device(&self, stream: StreamId) -> Result<DeviceId> {
        Ok(self.lock().stream(stream)?.device)
    }

    /// Free a stream. If it is its device's current stream the device falls
    /// back to its default stream. The default stream lives as long as its
    /// device. Freeing twice is a no-op.
    pub fn free_stream(&self, stream: StreamId) -> Result<()> {
        let mut st = self.lock();
        let Some(record) = st.streams.get(stream.0) else {
            return Ok(());
        };
        let device = record.device;
        let dev = st.device_mut(device)?;
        if dev.default_stream == stream {
            return Err(RuntimeError::InvalidArgument(format!(
                "{stream} is the default stream of {device} and is freed with it"
            )));
        }
        if dev.current_stream == stream {
            dev.current_stream = dev.default_stream;
        }
        let (backend, raw_device) = (Arc::clone(&dev.backend), dev.raw);
        let Some(record) = st.streams.release(stream.0) else {
            return Ok(());
        };
        drop(st);
        backend
            .free_stream(raw_device, record.raw)
            .map_err(|e| RuntimeError::from_backend(e, &stream.to_string()))
    }

    /// Submit the current stream's queued work without waiting.
    pub fn flush(&self, device: DeviceId) -> Result<()> {
        let (backend, raw, stream) = self.lock().submit_target(device)?;
        backend
            .flush(raw, stream)
            .map_err(|e| RuntimeError::from_backend(e, &device.to_string()))
    }

    /// Block until the current stream's work has completed.
    pub fn finish(&self, device: DeviceId) -> Result<()> {
        let (backend, raw, stream) = self.lock().submit_target(device)?;
        backend
            .finish(raw, stream)
            .map_err(|e| RuntimeError::from_backend(e, &device.to_string()))
    }

    /// Enqueue a timestamp marker on the current stream.
    pub fn tag_stream(&self, device: DeviceId) -> Result<Tag> {
        let (backend, raw, stream) = self.lock().submit_target(device)?;
        let tag = backend
            .tag_stream(raw, stream)
            .map_err(|e| RuntimeError::from_backend(e, &device.to_string()))?;
        Ok(Tag { device, raw: tag })
    }

    /// Time elapsed between two tags of the same device.
    pub fn time_between(&self, device: DeviceId, start: Tag, end: Tag) -> Result<Duration> {
        for tag in [start, end] {
            if tag.device != device {
                return Err(RuntimeError::DeviceMismatch {
                    resource: "tag".to_string(),
                    expected: device.to_string(),
                    found: tag.device.to_string(),
                });
            }
        }
        let (backend, raw) = {
            let st = self.lock();
            let dev = st.device(device)?;
            (Arc::clone(&dev.backend), dev.raw)
        };
        backend
            .time_between(raw, start.raw, end.raw)
            .map_err(|e| RuntimeError::from_backend(e, "stream tags"))
    }

    /// Release a tag. Later queries of it fail with
    /// [`RuntimeError::UseAfterFree`]. Tags of a freed device are released
    /// with it.
    pub fn free_tag(&self, tag: Tag) -> Result<()> {
        let (backend, raw) = {
            let st = self.lock();
            match st.devices.get(tag.device.0) {
                Some(dev) => (Arc::clone(&dev.backend), dev.raw),
                None => return Ok(()),
            }
        };
        backend.release_tag(raw, tag.raw);
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let devices: Vec<DeviceId> = {
            let st = self.state.lock();
            st.devices.iter().map(|(h, _)| DeviceId(h)).collect()
        };
        for id in devices {
            if let Err(e) = self.free_device(id) {
                tracing::warn!("releasing {} at shutdown: {}", id, e);
            }
        }
    }
}
