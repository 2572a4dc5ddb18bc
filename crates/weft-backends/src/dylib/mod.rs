//! Backend forwarding to an external device runtime loaded at run time.

mod ffi;
#[cfg(test)]
mod fake;

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use weft_core::backend::{AsyncCopyOp, BackendArg, BuildRequest, CopyOp};
use weft_core::{
    Backend, BackendError, BackendResult, KernelSource, MemoryKind, Mode, RawHandle, WorkingDims,
};

use ffi::*;

/// A device runtime shared library speaking the `weft_rt_*` ABI.
pub struct DylibBackend {
    name: String,
    path: PathBuf,
    api: RtApi,
    modes: Vec<Mode>,
    /// Pending async reads and their sizes in bytes.
    reads: Mutex<HashMap<(u64, u64), u64>>,
}

fn c_string(s: &str, what: &str) -> BackendResult<CString> {
    CString::new(s).map_err(|_| BackendError::Other(format!("{what} contains a NUL byte")))
}

fn c_path(path: &Path) -> BackendResult<CString> {
    c_string(&path.to_string_lossy(), "path")
}

fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

/// Borrow a NUL-terminated string returned by the library.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn lib_string(ptr: *const std::ffi::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Parse the library's comma-separated mode list, skipping unknown names.
fn parse_modes(listed: &str, origin: &str) -> Vec<Mode> {
    let mut modes = Vec::new();
    for name in listed.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match name.parse::<Mode>() {
            Ok(mode) if !modes.contains(&mode) => modes.push(mode),
            Ok(_) => {}
            Err(_) => tracing::warn!("{}: ignoring unknown mode '{}'", origin, name),
        }
    }
    modes
}

fn copy_desc(op: CopyOp<'_>) -> RtCopy {
    match op {
        CopyOp::HostToDevice { dst, dst_offset, src } => RtCopy {
            direction: RT_COPY_HOST_TO_DEVICE,
            is_async: 0,
            dst: dst.0,
            dst_offset,
            src: 0,
            src_offset: 0,
            host: src.as_ptr() as *mut c_void,
            bytes: src.len() as u64,
        },
        CopyOp::DeviceToHost { src, src_offset, dst } => RtCopy {
            direction: RT_COPY_DEVICE_TO_HOST,
            is_async: 0,
            dst: 0,
            dst_offset: 0,
            src: src.0,
            src_offset,
            host: dst.as_mut_ptr() as *mut c_void,
            bytes: dst.len() as u64,
        },
        CopyOp::DeviceToDevice {
            dst,
            dst_offset,
            src,
            src_offset,
            bytes,
        } => RtCopy {
            direction: RT_COPY_DEVICE_TO_DEVICE,
            is_async: 0,
            dst: dst.0,
            dst_offset,
            src: src.0,
            src_offset,
            host: std::ptr::null_mut(),
            bytes,
        },
    }
}

/// Descriptor for an enqueued copy. Host data for a host-to-device copy is
/// borrowed from `op`; the library copies it before returning.
fn async_copy_desc(op: &AsyncCopyOp) -> RtCopy {
    match op {
        AsyncCopyOp::HostToDevice { dst, dst_offset, data } => RtCopy {
            direction: RT_COPY_HOST_TO_DEVICE,
            is_async: 1,
            dst: dst.0,
            dst_offset: *dst_offset,
            src: 0,
            src_offset: 0,
            host: data.as_ptr() as *mut c_void,
            bytes: data.len() as u64,
        },
        AsyncCopyOp::DeviceToHost { src, src_offset, bytes } => RtCopy {
            direction: RT_COPY_DEVICE_TO_HOST,
            is_async: 1,
            dst: 0,
            dst_offset: 0,
            src: src.0,
            src_offset: *src_offset,
            host: std::ptr::null_mut(),
            bytes: *bytes,
        },
        AsyncCopyOp::DeviceToDevice {
            dst,
            dst_offset,
            src,
            src_offset,
            bytes,
        } => RtCopy {
            direction: RT_COPY_DEVICE_TO_DEVICE,
            is_async: 1,
            dst: dst.0,
            dst_offset: *dst_offset,
            src: src.0,
            src_offset: *src_offset,
            host: std::ptr::null_mut(),
            bytes: *bytes,
        },
    }
}

/// Marshal one kernel argument. Scalars travel as their native-endian bits
/// in the low bytes of `value`.
fn pack_arg(index: usize, arg: &BackendArg) -> BackendResult<RtArg> {
    Ok(match arg {
        BackendArg::Memory { raw, bytes } => RtArg {
            kind: RT_ARG_MEMORY,
            type_tag: 0,
            value: raw.0,
            bytes: *bytes,
        },
        BackendArg::Scalar(s) => {
            let mut bits = [0u8; 8];
            let raw = s.to_ne_bytes();
            bits[..raw.len()].copy_from_slice(&raw);
            RtArg {
                kind: RT_ARG_SCALAR,
                type_tag: s.element_type().tag(),
                value: u64::from_ne_bytes(bits),
                bytes: raw.len() as u64,
            }
        }
        BackendArg::Pointer(p) => RtArg {
            kind: RT_ARG_POINTER,
            type_tag: p.element.tag(),
            value: p.addr as u64,
            bytes: (p.len as u64).saturating_mul(p.element.size() as u64),
        },
        BackendArg::Str(_) => {
            return Err(BackendError::UnsupportedArgument {
                index,
                kind: arg.kind().to_string(),
            })
        }
    })
}

fn rt_dims(dims: &WorkingDims) -> RtDims {
    let (items, groups) = (dims.items_per_group(), dims.groups());
    RtDims {
        dims: dims.dims() as u32,
        items: [items.x, items.y, items.z],
        groups: [groups.x, groups.y, groups.z],
    }
}

/// Owned C strings behind an [`RtBuild`].
struct BuildStrings {
    kind: std::ffi::c_int,
    source: CString,
    dialect: Option<CString>,
    entry: CString,
    header: CString,
    includes: CString,
    compiler: CString,
    flags: CString,
    env_script: CString,
}

impl BuildStrings {
    fn new(request: &BuildRequest<'_>) -> BackendResult<Self> {
        let (kind, source, dialect) = match request.source {
            KernelSource::Inline(text) => (RT_SOURCE_INLINE, c_string(text, "kernel source")?, None),
            KernelSource::File(path) => (RT_SOURCE_FILE, c_path(path)?, None),
            KernelSource::Binary(path) => (RT_SOURCE_BINARY, c_path(path)?, None),
            KernelSource::Dialect { dialect, path } => (
                RT_SOURCE_DIALECT,
                c_path(path)?,
                Some(c_string(dialect, "dialect")?),
            ),
        };
        Ok(Self {
            kind,
            source,
            dialect,
            entry: c_string(request.entry_point, "entry point")?,
            header: c_string(&request.options.header(), "define")?,
            includes: c_string(&request.options.include_flags().join(" "), "include path")?,
            compiler: c_string(&request.compiler.compiler, "compiler")?,
            flags: c_string(&request.compiler.flags, "compiler flags")?,
            env_script: c_string(&request.compiler.env_script, "compiler env script")?,
        })
    }

    /// Descriptor borrowing from `self`; valid while `self` is.
    fn desc(&self) -> RtBuild {
        RtBuild {
            source_kind: self.kind,
            source: self.source.as_ptr(),
            dialect: self.dialect.as_ref().map_or(std::ptr::null(), |d| d.as_ptr()),
            entry_point: self.entry.as_ptr(),
            defines_header: self.header.as_ptr(),
            include_flags: self.includes.as_ptr(),
            compiler: self.compiler.as_ptr(),
            compiler_flags: self.flags.as_ptr(),
            env_script: self.env_script.as_ptr(),
        }
    }
}

impl DylibBackend {
    /// Load the library at `path`. Fails with [`BackendError::Unavailable`]
    /// when the file or any required symbol is missing.
    pub fn load(path: impl AsRef<Path>) -> BackendResult<Self> {
        let path = path.as_ref();
        let api = RtApi::load(path)?;
        Self::with_api(path, api)
    }

    fn with_api(path: &Path, api: RtApi) -> BackendResult<Self> {
        let listed = unsafe { lib_string((api.modes)()) };
        let modes = parse_modes(&listed, &path.display().to_string());
        if modes.is_empty() {
            return Err(BackendError::Unavailable(format!(
                "{} reports no usable modes",
                path.display()
            )));
        }

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dylib".to_string());
        tracing::debug!("loaded device runtime '{}' for {:?}", name, modes);
        Ok(Self {
            name,
            path: path.to_path_buf(),
            api,
            modes,
            reads: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn host_copy(
        &self,
        device: RawHandle,
        stream: RawHandle,
        desc: RtCopy,
        context: &str,
    ) -> BackendResult<u64> {
        let mut out = 0u64;
        let code = unsafe { (self.api.copy)(device.0, stream.0, &desc, &mut out) };
        self.api.check(code, context, out)?;
        Ok(out)
    }
}

impl Backend for DylibBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn modes(&self) -> &[Mode] {
        &self.modes
    }

    fn list_devices(&self, mode: Mode) -> Vec<String> {
        if !self.supports(mode) {
            return Vec::new();
        }
        match self.api.list_devices {
            Some(list) => {
                let listed = unsafe { lib_string(list(mode.as_c_str().as_ptr())) };
                listed
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            None => vec![format!("{} {mode} device", self.name)],
        }
    }

    fn create_device(&self, mode: Mode, platform_id: i32, device_id: i32) -> BackendResult<RawHandle> {
        let mut out = 0u64;
        let code = unsafe {
            (self.api.create_device)(mode.as_c_str().as_ptr(), platform_id, device_id, &mut out)
        };
        if code == RT_UNSUPPORTED_MODE {
            return Err(BackendError::UnsupportedMode(mode));
        }
        self.api.check(code, "create_device", out)?;
        Ok(RawHandle(out))
    }

    fn free_device(&self, device: RawHandle) -> BackendResult<()> {
        let code = unsafe { (self.api.free_device)(device.0) };
        self.reads.lock().retain(|(d, _), _| *d != device.0);
        self.api.check(code, "free_device", device.0)
    }

    fn create_stream(&self, device: RawHandle) -> BackendResult<RawHandle> {
        let mut out = 0u64;
        let code = unsafe { (self.api.create_stream)(device.0, &mut out) };
        self.api.check(code, "create_stream", device.0)?;
        Ok(RawHandle(out))
    }

    fn free_stream(&self, device: RawHandle, stream: RawHandle) -> BackendResult<()> {
        let code = unsafe { (self.api.free_stream)(device.0, stream.0) };
        self.api.check(code, "free_stream", stream.0)
    }

    fn flush(&self, device: RawHandle, stream: RawHandle) -> BackendResult<()> {
        let code = unsafe { (self.api.flush)(device.0, stream.0) };
        self.api.check(code, "flush", stream.0)
    }

    fn finish(&self, device: RawHandle, stream: RawHandle) -> BackendResult<()> {
        let code = unsafe { (self.api.finish)(device.0, stream.0) };
        self.api.check(code, "finish", stream.0)
    }

    fn tag_stream(&self, device: RawHandle, stream: RawHandle) -> BackendResult<RawHandle> {
        let mut out = 0u64;
        let code = unsafe { (self.api.tag_stream)(device.0, stream.0, &mut out) };
        self.api.check(code, "tag_stream", stream.0)?;
        Ok(RawHandle(out))
    }

    fn time_between(&self, device: RawHandle, start: RawHandle, end: RawHandle) -> BackendResult<Duration> {
        let mut secs = 0f64;
        let code = unsafe { (self.api.time_between)(device.0, start.0, end.0, &mut secs) };
        self.api.check(code, "time_between", start.0)?;
        Ok(seconds(secs))
    }

    fn release_tag(&self, device: RawHandle, tag: RawHandle) {
        let Some(release) = self.api.release_tag else {
            return;
        };
        let code = unsafe { release(device.0, tag.0) };
        if let Err(e) = self.api.check(code, "release_tag", tag.0) {
            tracing::debug!("{}: {}", self.name, e);
        }
    }

    fn wrap_stream(&self, device: RawHandle, native: u64) -> BackendResult<RawHandle> {
        let wrap = self.api.wrap_stream.ok_or_else(|| self.api.missing("weft_rt_wrap_stream"))?;
        let mut out = 0u64;
        let code = unsafe { wrap(device.0, native, &mut out) };
        self.api.check(code, "wrap_stream", native)?;
        Ok(RawHandle(out))
    }

    fn malloc(&self, device: RawHandle, bytes: u64, init: Option<&[u8]>) -> BackendResult<RawHandle> {
        let src = init.map_or(std::ptr::null(), |d| d.as_ptr() as *const c_void);
        let mut out = bytes;
        let code = unsafe { (self.api.malloc)(device.0, bytes, src, &mut out) };
        self.api.check(code, "malloc", bytes)?;
        Ok(RawHandle(out))
    }

    fn malloc_kind(
        &self,
        device: RawHandle,
        bytes: u64,
        init: Option<&[u8]>,
        kind: MemoryKind,
    ) -> BackendResult<RawHandle> {
        if kind == MemoryKind::Device {
            return self.malloc(device, bytes, init);
        }
        let alloc = self.api.malloc_kind.ok_or_else(|| self.api.missing("weft_rt_malloc_kind"))?;
        let src = init.map_or(std::ptr::null(), |d| d.as_ptr() as *const c_void);
        let mut out = bytes;
        let code = unsafe { alloc(device.0, bytes, kind.tag(), src, &mut out) };
        self.api.check(code, "malloc_kind", bytes)?;
        Ok(RawHandle(out))
    }

    fn free_memory(&self, device: RawHandle, memory: RawHandle) -> BackendResult<()> {
        let code = unsafe { (self.api.free_memory)(device.0, memory.0) };
        self.api.check(code, "free_memory", memory.0)
    }

    fn mapped_pointer(&self, device: RawHandle, memory: RawHandle) -> BackendResult<usize> {
        let mapped = self
            .api
            .mapped_pointer
            .ok_or_else(|| self.api.missing("weft_rt_mapped_pointer"))?;
        let mut out = std::ptr::null_mut();
        let code = unsafe { mapped(device.0, memory.0, &mut out) };
        self.api.check(code, "mapped_pointer", memory.0)?;
        Ok(out as usize)
    }

    fn wrap_memory(&self, device: RawHandle, native: u64, bytes: u64) -> BackendResult<RawHandle> {
        let wrap = self.api.wrap_memory.ok_or_else(|| self.api.missing("weft_rt_wrap_memory"))?;
        let mut out = 0u64;
        let code = unsafe { wrap(device.0, native, bytes, &mut out) };
        self.api.check(code, "wrap_memory", native)?;
        Ok(RawHandle(out))
    }

    fn copy(&self, device: RawHandle, stream: RawHandle, op: CopyOp<'_>) -> BackendResult<()> {
        self.host_copy(device, stream, copy_desc(op), "copy").map(|_| ())
    }

    fn copy_async(&self, device: RawHandle, stream: RawHandle, op: AsyncCopyOp) -> BackendResult<Option<RawHandle>> {
        let desc = async_copy_desc(&op);
        match &op {
            AsyncCopyOp::DeviceToHost { bytes, .. } => {
                let read = self.host_copy(device, stream, desc, "async read")?;
                self.reads.lock().insert((device.0, read), *bytes);
                Ok(Some(RawHandle(read)))
            }
            _ => {
                self.host_copy(device, stream, desc, "async copy")?;
                Ok(None)
            }
        }
    }

    fn take_read(&self, device: RawHandle, read: RawHandle) -> BackendResult<Vec<u8>> {
        let bytes = *self
            .reads
            .lock()
            .get(&(device.0, read.0))
            .ok_or(BackendError::InvalidHandle(read.0))?;
        let mut data = vec![0u8; bytes as usize];
        let code = unsafe {
            (self.api.take_read)(device.0, read.0, data.as_mut_ptr() as *mut c_void, bytes)
        };
        self.api.check(code, "take_read", read.0)?;
        self.reads.lock().remove(&(device.0, read.0));
        Ok(data)
    }

    fn build_kernel(&self, device: RawHandle, request: &BuildRequest<'_>) -> BackendResult<RawHandle> {
        let strings = BuildStrings::new(request)?;
        let desc = strings.desc();
        let mut out = 0u64;
        let code = unsafe { (self.api.build_kernel)(device.0, &desc, &mut out) };
        self.api.check(code, request.entry_point, device.0)?;
        Ok(RawHandle(out))
    }

    fn free_kernel(&self, device: RawHandle, kernel: RawHandle) -> BackendResult<()> {
        let code = unsafe { (self.api.free_kernel)(device.0, kernel.0) };
        self.api.check(code, "free_kernel", kernel.0)
    }

    fn preferred_dim_size(&self, device: RawHandle, kernel: RawHandle) -> BackendResult<u32> {
        let mut out = 0u32;
        let code = unsafe { (self.api.preferred_dim_size)(device.0, kernel.0, &mut out) };
        self.api.check(code, "preferred_dim_size", kernel.0)?;
        Ok(out)
    }

    fn run_kernel(
        &self,
        device: RawHandle,
        stream: RawHandle,
        kernel: RawHandle,
        dims: &WorkingDims,
        args: &[BackendArg],
    ) -> BackendResult<RawHandle> {
        let native = args
            .iter()
            .enumerate()
            .map(|(index, arg)| pack_arg(index, arg))
            .collect::<BackendResult<Vec<_>>>()?;
        let geometry = rt_dims(dims);
        let mut out = 0u64;
        let code = unsafe {
            (self.api.run_kernel)(
                device.0,
                stream.0,
                kernel.0,
                &geometry,
                native.as_ptr(),
                native.len(),
                &mut out,
            )
        };
        self.api.check(code, "run_kernel", out)?;
        Ok(RawHandle(out))
    }

    fn run_elapsed(&self, device: RawHandle, run: RawHandle) -> BackendResult<Duration> {
        let mut secs = 0f64;
        let code = unsafe { (self.api.run_elapsed)(device.0, run.0, &mut secs) };
        self.api.check(code, "run_elapsed", run.0)?;
        Ok(seconds(secs))
    }

    fn release_run(&self, device: RawHandle, run: RawHandle) {
        let code = unsafe { (self.api.release_run)(device.0, run.0) };
        if let Err(e) = self.api.check(code, "release_run", run.0) {
            tracing::debug!("{}: {}", self.name, e);
        }
    }
}
