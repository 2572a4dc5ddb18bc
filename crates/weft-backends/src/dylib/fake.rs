//! An in-process device runtime behind the `weft_rt_*` table, so the
//! marshaling in [`super::DylibBackend`] runs without a shared library.
//!
//! State is process-wide and tests run in parallel: every handle is unique
//! and launches are looked up by kernel entry point.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{const_mutex, Mutex};

use super::ffi::*;

type Storage = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Clone)]
pub(super) struct Build {
    pub entry: String,
    pub source_kind: c_int,
    pub dialect: Option<String>,
    pub header: String,
    pub includes: String,
    pub compiler: String,
}

#[derive(Debug, Clone)]
pub(super) struct Launch {
    pub dims: RtDims,
    pub args: Vec<RtArg>,
}

#[derive(Default)]
struct Fake {
    memories: HashMap<u64, Storage>,
    mapped: HashSet<u64>,
    streams: HashSet<u64>,
    tags: HashSet<u64>,
    /// Pending reads: owning stream, ready flag, bytes.
    reads: HashMap<u64, (u64, bool, Vec<u8>)>,
    kernels: HashMap<u64, Build>,
    launches: Vec<(String, Launch)>,
}

static STATE: Mutex<Option<Fake>> = const_mutex(None);
static NEXT: AtomicU64 = AtomicU64::new(0x100);

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

fn with<R>(f: impl FnOnce(&mut Fake) -> R) -> R {
    let mut st = STATE.lock();
    f(st.get_or_insert_with(Fake::default))
}

fn next_id() -> u64 {
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn fail(code: RtStatus, message: &str) -> RtStatus {
    let message = CString::new(message).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = message);
    code
}

unsafe fn text(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Every launch of the kernel built from `entry`, oldest first.
pub(super) fn launches_of(entry: &str) -> Vec<Launch> {
    with(|f| {
        f.launches
            .iter()
            .filter(|(e, _)| e == entry)
            .map(|(_, l)| l.clone())
            .collect()
    })
}

pub(super) fn build_of(entry: &str) -> Option<Build> {
    with(|f| f.kernels.values().find(|b| b.entry == entry).cloned())
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

unsafe extern "C" fn modes() -> *const c_char {
    c"CUDA, Bogus, HIP".as_ptr()
}

unsafe extern "C" fn last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ptr())
}

unsafe extern "C" fn create_device(_mode: *const c_char, _platform: c_int, device: c_int, out: *mut u64) -> RtStatus {
    if device < 0 {
        return fail(RT_UNAVAILABLE, "no such GPU");
    }
    *out = next_id();
    RT_SUCCESS
}

unsafe extern "C" fn free_device(_device: u64) -> RtStatus {
    RT_SUCCESS
}

unsafe extern "C" fn create_stream(_device: u64, out: *mut u64) -> RtStatus {
    let id = next_id();
    with(|f| f.streams.insert(id));
    *out = id;
    RT_SUCCESS
}

unsafe extern "C" fn free_stream(_device: u64, stream: u64) -> RtStatus {
    if with(|f| f.streams.remove(&stream)) {
        RT_SUCCESS
    } else {
        RT_INVALID_HANDLE
    }
}

unsafe extern "C" fn flush(_device: u64, _stream: u64) -> RtStatus {
    RT_SUCCESS
}

unsafe extern "C" fn finish(_device: u64, stream: u64) -> RtStatus {
    with(|f| {
        f.reads
            .values_mut()
            .filter(|(owner, _, _)| *owner == stream)
            .for_each(|(_, ready, _)| *ready = true)
    });
    RT_SUCCESS
}

unsafe extern "C" fn tag_stream(_device: u64, _stream: u64, out: *mut u64) -> RtStatus {
    let id = next_id();
    with(|f| f.tags.insert(id));
    *out = id;
    RT_SUCCESS
}

unsafe extern "C" fn time_between(_device: u64, start: u64, end: u64, out: *mut f64) -> RtStatus {
    if !with(|f| f.tags.contains(&start) && f.tags.contains(&end)) {
        return RT_INVALID_HANDLE;
    }
    *out = 0.25;
    RT_SUCCESS
}

unsafe extern "C" fn release_tag(_device: u64, tag: u64) -> RtStatus {
    with(|f| f.tags.remove(&tag));
    RT_SUCCESS
}

fn allocate(bytes: u64, src: *const c_void, mapped: bool, out: *mut u64) -> RtStatus {
    if bytes > 1 << 30 {
        return fail(RT_OUT_OF_MEMORY, "fake device is full");
    }
    let data = if src.is_null() {
        vec![0u8; bytes as usize]
    } else {
        unsafe { std::slice::from_raw_parts(src as *const u8, bytes as usize) }.to_vec()
    };
    let id = next_id();
    with(|f| {
        f.memories.insert(id, Arc::new(Mutex::new(data)));
        if mapped {
            f.mapped.insert(id);
        }
    });
    unsafe { *out = id };
    RT_SUCCESS
}

unsafe extern "C" fn malloc(_device: u64, bytes: u64, src: *const c_void, out: *mut u64) -> RtStatus {
    allocate(bytes, src, false, out)
}

unsafe extern "C" fn malloc_kind(_device: u64, bytes: u64, _kind: c_int, src: *const c_void, out: *mut u64) -> RtStatus {
    allocate(bytes, src, true, out)
}

unsafe extern "C" fn free_memory(_device: u64, memory: u64) -> RtStatus {
    match with(|f| f.memories.remove(&memory)) {
        Some(_) => RT_SUCCESS,
        None => RT_INVALID_HANDLE,
    }
}

unsafe extern "C" fn mapped_pointer(_device: u64, memory: u64, out: *mut *mut c_void) -> RtStatus {
    let storage = with(|f| f.mapped.contains(&memory).then(|| f.memories.get(&memory).cloned()).flatten());
    match storage {
        Some(data) => {
            *out = data.lock().as_mut_ptr() as *mut c_void;
            RT_SUCCESS
        }
        None => fail(RT_UNAVAILABLE, "allocation is not mapped"),
    }
}

unsafe extern "C" fn wrap_memory(_device: u64, native: u64, bytes: u64, out: *mut u64) -> RtStatus {
    let id = next_id();
    let wrapped = with(|f| match f.memories.get(&native).cloned() {
        Some(data) if data.lock().len() as u64 >= bytes => {
            f.memories.insert(id, data);
            true
        }
        _ => false,
    });
    if !wrapped {
        return RT_INVALID_HANDLE;
    }
    *out = id;
    RT_SUCCESS
}

unsafe extern "C" fn wrap_stream(_device: u64, native: u64, out: *mut u64) -> RtStatus {
    let id = next_id();
    if !with(|f| f.streams.contains(&native) && f.streams.insert(id)) {
        return RT_INVALID_HANDLE;
    }
    *out = id;
    RT_SUCCESS
}

unsafe extern "C" fn copy(_device: u64, stream: u64, desc: *const RtCopy, out: *mut u64) -> RtStatus {
    let d = *desc;
    let n = d.bytes as usize;
    let storage = |h: u64| with(|f| f.memories.get(&h).cloned());
    match d.direction {
        RT_COPY_HOST_TO_DEVICE => {
            let Some(dst) = storage(d.dst) else {
                return RT_INVALID_HANDLE;
            };
            let src = std::slice::from_raw_parts(d.host as *const u8, n);
            let o = d.dst_offset as usize;
            dst.lock()[o..o + n].copy_from_slice(src);
        }
        RT_COPY_DEVICE_TO_HOST => {
            let Some(src) = storage(d.src) else {
                return RT_INVALID_HANDLE;
            };
            let o = d.src_offset as usize;
            let chunk = src.lock()[o..o + n].to_vec();
            if d.is_async != 0 {
                let id = next_id();
                with(|f| f.reads.insert(id, (stream, false, chunk)));
                *out = id;
            } else {
                std::slice::from_raw_parts_mut(d.host as *mut u8, n).copy_from_slice(&chunk);
            }
        }
        RT_COPY_DEVICE_TO_DEVICE => {
            let (Some(src), Some(dst)) = (storage(d.src), storage(d.dst)) else {
                return RT_INVALID_HANDLE;
            };
            let (s, o) = (d.src_offset as usize, d.dst_offset as usize);
            let chunk = src.lock()[s..s + n].to_vec();
            dst.lock()[o..o + n].copy_from_slice(&chunk);
        }
        _ => return fail(RT_EXECUTION_ERROR, "unknown copy direction"),
    }
    RT_SUCCESS
}

unsafe extern "C" fn take_read(_device: u64, read: u64, dst: *mut c_void, bytes: u64) -> RtStatus {
    let taken = with(|f| match f.reads.get(&read).map(|(_, ready, _)| *ready) {
        None => Err(RT_INVALID_HANDLE),
        Some(false) => Err(RT_NOT_READY),
        Some(true) => f.reads.remove(&read).map(|(_, _, data)| data).ok_or(RT_INVALID_HANDLE),
    });
    match taken {
        Ok(data) => {
            let n = data.len().min(bytes as usize);
            std::slice::from_raw_parts_mut(dst as *mut u8, n).copy_from_slice(&data[..n]);
            RT_SUCCESS
        }
        Err(code) => code,
    }
}

unsafe extern "C" fn build_kernel(_device: u64, desc: *const RtBuild, out: *mut u64) -> RtStatus {
    let d = &*desc;
    let build = Build {
        entry: text(d.entry_point),
        source_kind: d.source_kind,
        dialect: (!d.dialect.is_null()).then(|| text(d.dialect)),
        header: text(d.defines_header),
        includes: text(d.include_flags),
        compiler: text(d.compiler),
    };
    if build.entry == "broken" {
        return fail(RT_COMPILE_ERROR, "1:3 expected ';'");
    }
    let id = next_id();
    with(|f| f.kernels.insert(id, build));
    *out = id;
    RT_SUCCESS
}

unsafe extern "C" fn free_kernel(_device: u64, kernel: u64) -> RtStatus {
    with(|f| f.kernels.remove(&kernel));
    RT_SUCCESS
}

unsafe extern "C" fn preferred_dim_size(_device: u64, _kernel: u64, out: *mut u32) -> RtStatus {
    *out = 32;
    RT_SUCCESS
}

unsafe extern "C" fn run_kernel(
    _device: u64,
    _stream: u64,
    kernel: u64,
    dims: *const RtDims,
    args: *const RtArg,
    count: usize,
    out: *mut u64,
) -> RtStatus {
    let args = if count == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(args, count).to_vec()
    };
    if let Some(index) = args
        .iter()
        .position(|a| ![RT_ARG_MEMORY, RT_ARG_SCALAR, RT_ARG_POINTER].contains(&a.kind))
    {
        *out = index as u64;
        return fail(RT_UNSUPPORTED_ARGUMENT, "unknown argument kind");
    }
    let launch = Launch { dims: *dims, args };
    let recorded = with(|f| match f.kernels.get(&kernel) {
        Some(build) => {
            let entry = build.entry.clone();
            f.launches.push((entry, launch));
            true
        }
        None => false,
    });
    if !recorded {
        *out = kernel;
        return RT_INVALID_HANDLE;
    }
    *out = next_id();
    RT_SUCCESS
}

unsafe extern "C" fn run_elapsed(_device: u64, _run: u64, out: *mut f64) -> RtStatus {
    *out = 0.001;
    RT_SUCCESS
}

unsafe extern "C" fn release_run(_device: u64, _run: u64) -> RtStatus {
    RT_SUCCESS
}

unsafe extern "C" fn list_devices(_mode: *const c_char) -> *const c_char {
    c"Fake GPU 0\nFake GPU 1\n".as_ptr()
}

/// The full table, interop entry points included.
pub(super) fn api() -> RtApi {
    RtApi {
        _lib: None,
        modes,
        last_error,
        create_device,
        free_device,
        create_stream,
        free_stream,
        flush,
        finish,
        tag_stream,
        time_between,
        malloc,
        free_memory,
        copy,
        take_read,
        build_kernel,
        free_kernel,
        preferred_dim_size,
        run_kernel,
        run_elapsed,
        release_run,
        malloc_kind: Some(malloc_kind),
        mapped_pointer: Some(mapped_pointer),
        wrap_memory: Some(wrap_memory),
        wrap_stream: Some(wrap_stream),
        release_tag: Some(release_tag),
        list_devices: Some(list_devices),
    }
}

/// A library exporting only the required entry points.
pub(super) fn core_api() -> RtApi {
    RtApi {
        malloc_kind: None,
        mapped_pointer: None,
        wrap_memory: None,
        wrap_stream: None,
        release_tag: None,
        list_devices: None,
        ..api()
    }
}
