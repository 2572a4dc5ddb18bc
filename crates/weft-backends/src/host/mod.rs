//! Reference backend executing kernels on the host CPU.
//!
//! Serves the `Serial`, `OpenMP` and `Pthreads` modes. Each stream is a worker
//! thread; kernels are Rust functions looked up by entry-point name in a
//! [`KernelRegistry`].

mod kernels;
mod stream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use weft_core::backend::{AsyncCopyOp, BackendArg, BuildRequest, CopyOp};
use weft_core::{
    Backend, BackendError, BackendResult, KernelBuildOptions, KernelSource, MemoryKind, Mode,
    RawHandle, WorkingDims,
};

pub use kernels::{
    HostKernelError, HostKernelFn, HostManifest, KernelContext, KernelRegistry, KernelResult,
    MANIFEST_FORMAT,
};

use kernels::{Buffer, HostArg};
use stream::{Job, WorkQueue};

const HOST_MODES: [Mode; 3] = [Mode::Serial, Mode::OpenMP, Mode::Pthreads];

/// Value produced by queued work, empty until the work has run.
type Completion<T> = Arc<Mutex<Option<T>>>;

fn completion<T>() -> Completion<T> {
    Arc::new(Mutex::new(None))
}

struct HostKernel {
    name: String,
    func: HostKernelFn,
    options: Arc<KernelBuildOptions>,
}

struct HostDevice {
    mode: Mode,
    threads: u32,
    streams: Mutex<HashMap<u64, Arc<WorkQueue>>>,
    memories: Mutex<HashMap<u64, Buffer>>,
    kernels: Mutex<HashMap<u64, Arc<HostKernel>>>,
    runs: Mutex<HashMap<u64, Completion<Duration>>>,
    tags: Mutex<HashMap<u64, Completion<Instant>>>,
    reads: Mutex<HashMap<u64, Completion<Vec<u8>>>>,
}

/// Worker parallelism a device of `mode` reports.
fn threads_for(mode: Mode) -> u32 {
    match mode {
        Mode::Serial => 1,
        _ => std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
    }
}

impl HostDevice {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            threads: threads_for(mode),
            streams: Mutex::new(HashMap::new()),
            memories: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            tags: Mutex::new(HashMap::new()),
            reads: Mutex::new(HashMap::new()),
        }
    }

    fn stream(&self, stream: RawHandle) -> BackendResult<Arc<WorkQueue>> {
        self.streams
            .lock()
            .get(&stream.0)
            .cloned()
            .ok_or(BackendError::InvalidHandle(stream.0))
    }

    fn buffer(&self, memory: RawHandle) -> BackendResult<Buffer> {
        self.memories
            .lock()
            .get(&memory.0)
            .cloned()
            .ok_or(BackendError::InvalidHandle(memory.0))
    }
}

/// Totals kept by a [`HostBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Bytes moved by transfers and initialized allocations.
    pub bytes_moved: u64,
    pub launches: u64,
}

#[derive(Default)]
struct Counters {
    bytes_moved: AtomicU64,
    launches: AtomicU64,
}

/// The host CPU backend.
pub struct HostBackend {
    next_id: AtomicU64,
    devices: Mutex<HashMap<u64, Arc<HostDevice>>>,
    registry: Arc<KernelRegistry>,
    counters: Arc<Counters>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    /// Backend with the built-in kernels registered.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(KernelRegistry::with_builtins()))
    }

    pub fn with_registry(registry: Arc<KernelRegistry>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            devices: Mutex::new(HashMap::new()),
            registry,
            counters: Arc::new(Counters::default()),
        }
    }

    /// The kernel table; new entries are visible to later builds.
    pub fn registry(&self) -> &Arc<KernelRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            bytes_moved: self.counters.bytes_moved.load(Ordering::Relaxed),
            launches: self.counters.launches.load(Ordering::Relaxed),
        }
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn device(&self, device: RawHandle) -> BackendResult<Arc<HostDevice>> {
        self.devices
            .lock()
            .get(&device.0)
            .cloned()
            .ok_or(BackendError::InvalidHandle(device.0))
    }

    /// Find a live buffer by raw id on any device of this backend.
    fn find_buffer(&self, native: u64) -> Option<Buffer> {
        let devices: Vec<Arc<HostDevice>> = self.devices.lock().values().cloned().collect();
        devices.iter().find_map(|d| d.memories.lock().get(&native).cloned())
    }

    fn find_stream(&self, native: u64) -> Option<Arc<WorkQueue>> {
        let devices: Vec<Arc<HostDevice>> = self.devices.lock().values().cloned().collect();
        devices.iter().find_map(|d| d.streams.lock().get(&native).cloned())
    }

    fn moved(&self, bytes: usize) {
        self.counters.bytes_moved.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn lookup(&self, entry_point: &str) -> BackendResult<HostKernelFn> {
        self.registry.get(entry_point).ok_or_else(|| BackendError::Compile {
            diagnostics: format!("no host kernel registered as '{entry_point}'"),
        })
    }

    /// Check the entry point exists in `text` and in the registry.
    fn resolve_entry(&self, text: &str, entry_point: &str) -> BackendResult<HostKernelFn> {
        if !text.contains(entry_point) {
            return Err(BackendError::Compile {
                diagnostics: format!("entry point '{entry_point}' not found in source"),
            });
        }
        self.lookup(entry_point)
    }

    fn compile(&self, request: &BuildRequest<'_>) -> BackendResult<HostKernelFn> {
        let missing = request.options.missing_includes();
        if request.source.accepts_options() && !missing.is_empty() {
            let listed: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
            return Err(BackendError::Compile {
                diagnostics: format!("include path not found: {}", listed.join(", ")),
            });
        }
        let entry = request.entry_point;
        match request.source {
            KernelSource::Inline(text) => self.resolve_entry(text, entry),
            KernelSource::File(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| BackendError::Compile {
                    diagnostics: format!("{}: {e}", path.display()),
                })?;
                self.resolve_entry(&text, entry)
            }
            KernelSource::Binary(path) => {
                let manifest = HostManifest::read(path)
                    .map_err(|diagnostics| BackendError::Compile { diagnostics })?;
                if !manifest.entries.iter().any(|e| e == entry) {
                    return Err(BackendError::Compile {
                        diagnostics: format!("{} has no entry '{entry}'", path.display()),
                    });
                }
                self.lookup(entry)
            }
            KernelSource::Dialect { dialect, path } => Err(BackendError::Compile {
                diagnostics: format!(
                    "{dialect} kernels ({}) are not supported by the host backend",
                    path.display()
                ),
            }),
        }
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn modes(&self) -> &[Mode] {
        &HOST_MODES
    }

    fn list_devices(&self, mode: Mode) -> Vec<String> {
        if !self.supports(mode) {
            return Vec::new();
        }
        let threads = threads_for(mode);
        let plural = if threads == 1 { "" } else { "s" };
        vec![format!("host CPU, {threads} worker thread{plural}")]
    }

    fn create_device(&self, mode: Mode, platform_id: i32, device_id: i32) -> BackendResult<RawHandle> {
        if !mode.is_host() {
            return Err(BackendError::UnsupportedMode(mode));
        }
        if platform_id != 0 || device_id != 0 {
            tracing::debug!(
                "host backend ignores platformID {} / deviceID {}",
                platform_id,
                device_id
            );
        }
        let id = self.id();
        self.devices.lock().insert(id, Arc::new(HostDevice::new(mode)));
        Ok(RawHandle(id))
    }

    fn free_device(&self, device: RawHandle) -> BackendResult<()> {
        let dev = self
            .devices
            .lock()
            .remove(&device.0)
            .ok_or(BackendError::InvalidHandle(device.0))?;
        // Joining the workers runs whatever they still hold.
        let streams: Vec<_> = dev.streams.lock().drain().collect();
        drop(streams);
        tracing::debug!("host {} device {} released", dev.mode, device);
        Ok(())
    }

    fn create_stream(&self, device: RawHandle) -> BackendResult<RawHandle> {
        let dev = self.device(device)?;
        let id = self.id();
        let queue = WorkQueue::spawn(format!("weft-{}-{}", dev.mode.as_str().to_lowercase(), id))
            .map_err(|e| BackendError::Other(format!("spawning stream worker: {e}")))?;
        dev.streams.lock().insert(id, Arc::new(queue));
        Ok(RawHandle(id))
    }

    /// `native` is the raw id of a stream on any host device. Both ids feed
    /// the same worker, which lives until the last of them is freed.
    fn wrap_stream(&self, device: RawHandle, native: u64) -> BackendResult<RawHandle> {
        let dev = self.device(device)?;
        let queue = self.find_stream(native).ok_or(BackendError::InvalidHandle(native))?;
        let id = self.id();
        dev.streams.lock().insert(id, queue);
        Ok(RawHandle(id))
    }

    fn free_stream(&self, device: RawHandle, stream: RawHandle) -> BackendResult<()> {
        let queue = self
            .device(device)?
            .streams
            .lock()
            .remove(&stream.0)
            .ok_or(BackendError::InvalidHandle(stream.0))?;
        drop(queue);
        Ok(())
    }

    fn flush(&self, device: RawHandle, stream: RawHandle) -> BackendResult<()> {
        self.device(device)?.stream(stream)?.flush();
        Ok(())
    }

    fn finish(&self, device: RawHandle, stream: RawHandle) -> BackendResult<()> {
        self.device(device)?
            .stream(stream)?
            .finish()
            .map_err(BackendError::Execution)
    }

    fn tag_stream(&self, device: RawHandle, stream: RawHandle) -> BackendResult<RawHandle> {
        let dev = self.device(device)?;
        let queue = dev.stream(stream)?;
        let id = self.id();
        let reached = completion();
        dev.tags.lock().insert(id, Arc::clone(&reached));
        queue.submit(Box::new(move || {
            *reached.lock() = Some(Instant::now());
            Ok(())
        }));
        Ok(RawHandle(id))
    }

    fn time_between(&self, device: RawHandle, start: RawHandle, end: RawHandle) -> BackendResult<Duration> {
        let dev = self.device(device)?;
        let tags = dev.tags.lock();
        let instant = |tag: RawHandle| -> BackendResult<Instant> {
            let slot = tags.get(&tag.0).ok_or(BackendError::InvalidHandle(tag.0))?;
            let reached = *slot.lock();
            reached.ok_or(BackendError::NotReady)
        };
        let (start, end) = (instant(start)?, instant(end)?);
        Ok(end.saturating_duration_since(start))
    }

    fn release_tag(&self, device: RawHandle, tag: RawHandle) {
        if let Ok(dev) = self.device(device) {
            dev.tags.lock().remove(&tag.0);
        }
    }

    fn malloc(&self, device: RawHandle, bytes: u64, init: Option<&[u8]>) -> BackendResult<RawHandle> {
        let dev = self.device(device)?;
        let len = usize::try_from(bytes).map_err(|_| BackendError::OutOfMemory { bytes })?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| BackendError::OutOfMemory { bytes })?;
        match init {
            Some(src) => {
                data.extend_from_slice(&src[..len.min(src.len())]);
                data.resize(len, 0);
                self.moved(src.len().min(len));
            }
            None => data.resize(len, 0),
        }
        let id = self.id();
        dev.memories.lock().insert(id, Arc::new(Mutex::new(data)));
        Ok(RawHandle(id))
    }

    /// Host storage is always host-visible, so every kind is a plain
    /// allocation.
    fn malloc_kind(
        &self,
        device: RawHandle,
        bytes: u64,
        init: Option<&[u8]>,
        kind: MemoryKind,
    ) -> BackendResult<RawHandle> {
        tracing::trace!("host {} allocation of {} bytes", kind, bytes);
        self.malloc(device, bytes, init)
    }

    fn mapped_pointer(&self, device: RawHandle, memory: RawHandle) -> BackendResult<usize> {
        // Buffers never reallocate, so the address is stable while the
        // allocation lives.
        let buf = self.device(device)?.buffer(memory)?;
        let addr = buf.lock().as_mut_ptr() as usize;
        Ok(addr)
    }

    /// `native` is the raw id of a buffer on any host device. The wrapper
    /// shares its storage, which outlives whichever handle is freed first.
    fn wrap_memory(&self, device: RawHandle, native: u64, bytes: u64) -> BackendResult<RawHandle> {
        let dev = self.device(device)?;
        let buf = self.find_buffer(native).ok_or(BackendError::InvalidHandle(native))?;
        let held = buf.lock().len() as u64;
        if bytes > held {
            return Err(BackendError::Other(format!(
                "native allocation 0x{native:x} holds {held} bytes, {bytes} requested"
            )));
        }
        let id = self.id();
        dev.memories.lock().insert(id, buf);
        Ok(RawHandle(id))
    }

    fn free_memory(&self, device: RawHandle, memory: RawHandle) -> BackendResult<()> {
        self.device(device)?
            .memories
            .lock()
            .remove(&memory.0)
            .map(|_| ())
            .ok_or(BackendError::InvalidHandle(memory.0))
    }

    fn copy(&self, device: RawHandle, stream: RawHandle, op: CopyOp<'_>) -> BackendResult<()> {
        let dev = self.device(device)?;
        dev.stream(stream)?.finish().map_err(BackendError::Execution)?;
        match op {
            CopyOp::HostToDevice { dst, dst_offset, src } => {
                let buf = dev.buffer(dst)?;
                let o = dst_offset as usize;
                buf.lock()[o..o + src.len()].copy_from_slice(src);
                self.moved(src.len());
            }
            CopyOp::DeviceToHost { src, src_offset, dst } => {
                let buf = dev.buffer(src)?;
                let o = src_offset as usize;
                dst.copy_from_slice(&buf.lock()[o..o + dst.len()]);
                self.moved(dst.len());
            }
            CopyOp::DeviceToDevice {
                dst,
                dst_offset,
                src,
                src_offset,
                bytes,
            } => {
                copy_between(&dev.buffer(src)?, src_offset, &dev.buffer(dst)?, dst_offset, bytes);
                self.moved(bytes as usize);
            }
        }
        Ok(())
    }

    fn copy_async(&self, device: RawHandle, stream: RawHandle, op: AsyncCopyOp) -> BackendResult<Option<RawHandle>> {
        let dev = self.device(device)?;
        let queue = dev.stream(stream)?;
        let counters = Arc::clone(&self.counters);
        let (job, read): (Job, Option<RawHandle>) = match op {
            AsyncCopyOp::HostToDevice { dst, dst_offset, data } => {
                let buf = dev.buffer(dst)?;
                let job: Job = Box::new(move || {
                    let o = dst_offset as usize;
                    buf.lock()[o..o + data.len()].copy_from_slice(&data);
                    counters.bytes_moved.fetch_add(data.len() as u64, Ordering::Relaxed);
                    Ok(())
                });
                (job, None)
            }
            AsyncCopyOp::DeviceToHost { src, src_offset, bytes } => {
                let buf = dev.buffer(src)?;
                let id = self.id();
                let slot = completion();
                dev.reads.lock().insert(id, Arc::clone(&slot));
                let job: Job = Box::new(move || {
                    let o = src_offset as usize;
                    let data = buf.lock()[o..o + bytes as usize].to_vec();
                    counters.bytes_moved.fetch_add(bytes, Ordering::Relaxed);
                    *slot.lock() = Some(data);
                    Ok(())
                });
                (job, Some(RawHandle(id)))
            }
            AsyncCopyOp::DeviceToDevice {
                dst,
                dst_offset,
                src,
                src_offset,
                bytes,
            } => {
                let (s, d) = (dev.buffer(src)?, dev.buffer(dst)?);
                let job: Job = Box::new(move || {
                    copy_between(&s, src_offset, &d, dst_offset, bytes);
                    counters.bytes_moved.fetch_add(bytes, Ordering::Relaxed);
                    Ok(())
                });
                (job, None)
            }
        };
        queue.submit(job);
        Ok(read)
    }

    fn take_read(&self, device: RawHandle, read: RawHandle) -> BackendResult<Vec<u8>> {
        let dev = self.device(device)?;
        let mut reads = dev.reads.lock();
        let slot = reads.get(&read.0).ok_or(BackendError::InvalidHandle(read.0))?;
        let data = slot.lock().take().ok_or(BackendError::NotReady)?;
        reads.remove(&read.0);
        Ok(data)
    }

    fn build_kernel(&self, device: RawHandle, request: &BuildRequest<'_>) -> BackendResult<RawHandle> {
        let dev = self.device(device)?;
        let func = self.compile(request)?;
        if !request.compiler.compiler.is_empty() || !request.compiler.env_script.is_empty() {
            tracing::debug!(
                "host backend ignores compiler '{}' (env script '{}')",
                request.compiler.compiler,
                request.compiler.env_script
            );
        }
        let id = self.id();
        dev.kernels.lock().insert(
            id,
            Arc::new(HostKernel {
                name: request.entry_point.to_string(),
                func,
                options: Arc::new(request.options.clone()),
            }),
        );
        Ok(RawHandle(id))
    }

    fn free_kernel(&self, device: RawHandle, kernel: RawHandle) -> BackendResult<()> {
        self.device(device)?
            .kernels
            .lock()
            .remove(&kernel.0)
            .map(|_| ())
            .ok_or(BackendError::InvalidHandle(kernel.0))
    }

    fn preferred_dim_size(&self, device: RawHandle, kernel: RawHandle) -> BackendResult<u32> {
        let dev = self.device(device)?;
        if !dev.kernels.lock().contains_key(&kernel.0) {
            return Err(BackendError::InvalidHandle(kernel.0));
        }
        Ok(dev.threads)
    }

    fn run_kernel(
        &self,
        device: RawHandle,
        stream: RawHandle,
        kernel: RawHandle,
        dims: &WorkingDims,
        args: &[BackendArg],
    ) -> BackendResult<RawHandle> {
        let dev = self.device(device)?;
        let queue = dev.stream(stream)?;
        let kernel = dev
            .kernels
            .lock()
            .get(&kernel.0)
            .cloned()
            .ok_or(BackendError::InvalidHandle(kernel.0))?;

        let mut host_args = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            host_args.push(match arg {
                BackendArg::Memory { raw, .. } => HostArg::Buffer(dev.buffer(*raw)?),
                BackendArg::Scalar(s) => HostArg::Scalar(*s),
                BackendArg::Pointer(p) => HostArg::Pointer(*p),
                BackendArg::Str(_) => {
                    return Err(BackendError::UnsupportedArgument {
                        index,
                        kind: arg.kind().to_string(),
                    })
                }
            });
        }

        let id = self.id();
        let elapsed = completion();
        dev.runs.lock().insert(id, Arc::clone(&elapsed));
        let dims = *dims;
        self.counters.launches.fetch_add(1, Ordering::Relaxed);
        queue.submit(Box::new(move || {
            let mut ctx = KernelContext {
                options: &kernel.options,
                args: &host_args,
                dims: &dims,
            };
            let start = Instant::now();
            let result = (kernel.func)(&mut ctx);
            *elapsed.lock() = Some(start.elapsed());
            result.map_err(|e| format!("kernel '{}': {e}", kernel.name))
        }));
        Ok(RawHandle(id))
    }

    fn run_elapsed(&self, device: RawHandle, run: RawHandle) -> BackendResult<Duration> {
        let dev = self.device(device)?;
        let runs = dev.runs.lock();
        let slot = runs.get(&run.0).ok_or(BackendError::InvalidHandle(run.0))?;
        let elapsed = *slot.lock();
        elapsed.ok_or(BackendError::NotReady)
    }

    fn release_run(&self, device: RawHandle, run: RawHandle) {
        if let Ok(dev) = self.device(device) {
            dev.runs.lock().remove(&run.0);
        }
    }
}

/// Copy `bytes` between two buffers, which may be the same allocation.
fn copy_between(src: &Buffer, src_offset: u64, dst: &Buffer, dst_offset: u64, bytes: u64) {
    let (s, d, n) = (src_offset as usize, dst_offset as usize, bytes as usize);
    if Arc::ptr_eq(src, dst) {
        src.lock().copy_within(s..s + n, d);
        return;
    }
    let chunk = src.lock()[s..s + n].to_vec();
    dst.lock()[d..d + n].copy_from_slice(&chunk);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_dim_size_by_mode() {
        let backend = HostBackend::new();
        let serial = backend.create_device(Mode::Serial, 0, 0).unwrap();
        let omp = backend.create_device(Mode::OpenMP, 0, 0).unwrap();
        let options = KernelBuildOptions::new();
        let compiler = Default::default();
        let source = KernelSource::inline("add");
        let request = BuildRequest {
            source: &source,
            entry_point: "add",
            options: &options,
            compiler: &compiler,
        };
        let k1 = backend.build_kernel(serial, &request).unwrap();
        let k2 = backend.build_kernel(omp, &request).unwrap();
        assert_eq!(backend.preferred_dim_size(serial, k1).unwrap(), 1);
        assert!(backend.preferred_dim_size(omp, k2).unwrap() >= 1);
        assert!(matches!(
            backend.create_device(Mode::Cuda, 0, 0),
            Err(BackendError::UnsupportedMode(Mode::Cuda))
        ));
    }

    #[test]
    fn test_copy_between_overlapping() {
        let buf: Buffer = Arc::new(Mutex::new(vec![1, 2, 3, 4, 5]));
        copy_between(&buf, 0, &buf, 2, 3);
        assert_eq!(*buf.lock(), vec![1, 2, 1, 2, 3]);
    }

    #[test]
    fn test_released_tags_are_dropped() {
        let backend = HostBackend::new();
        let dev = backend.create_device(Mode::Serial, 0, 0).unwrap();
        let stream = backend.create_stream(dev).unwrap();
        let tags: Vec<RawHandle> = (0..8)
            .map(|_| backend.tag_stream(dev, stream).unwrap())
            .collect();
        backend.finish(dev, stream).unwrap();
        for tag in &tags {
            backend.release_tag(dev, *tag);
        }
        assert!(backend.device(dev).unwrap().tags.lock().is_empty());
        assert!(matches!(
            backend.time_between(dev, tags[0], tags[1]),
            Err(BackendError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_wrapped_buffer_outlives_owner() {
        let backend = HostBackend::new();
        let dev = backend.create_device(Mode::Serial, 0, 0).unwrap();
        let owner = backend.malloc(dev, 4, Some(&[1, 2, 3, 4])).unwrap();
        let wrapper = backend.wrap_memory(dev, owner.0, 4).unwrap();
        assert_eq!(
            backend.mapped_pointer(dev, owner).unwrap(),
            backend.mapped_pointer(dev, wrapper).unwrap()
        );
        assert!(matches!(
            backend.wrap_memory(dev, owner.0, 5),
            Err(BackendError::Other(_))
        ));

        backend.free_memory(dev, owner).unwrap();
        let stream = backend.create_stream(dev).unwrap();
        let mut out = [0u8; 4];
        backend
            .copy(dev, stream, CopyOp::DeviceToHost { src: wrapper, src_offset: 0, dst: &mut out })
            .unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_malloc_init_counts_bytes() {
        let backend = HostBackend::new();
        let dev = backend.create_device(Mode::Serial, 0, 0).unwrap();
        backend.malloc(dev, 8, Some(&[1; 8])).unwrap();
        backend.malloc(dev, 8, None).unwrap();
        assert_eq!(backend.stats().bytes_moved, 8);
        backend.free_device(dev).unwrap();
        assert!(matches!(
            backend.free_device(dev),
            Err(BackendError::InvalidHandle(_))
        ));
    }
}
