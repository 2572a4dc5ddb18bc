//! Drives the C ABI the way a foreign caller would.

use std::ffi::{c_void, CStr, CString};
use std::ptr;

use weft_core::ElementType;
use weft_ffi::*;

fn c(s: &str) -> CString {
    CString::new(s).unwrap()
}

fn serial_device() -> u64 {
    let mut dev = 0u64;
    let code = unsafe { weft_create_device(c("Serial").as_ptr(), 0, 0, &mut dev) };
    assert_eq!(code, WEFT_SUCCESS, "{:?}", last_error_as_str());
    assert_ne!(dev, 0);
    dev
}

fn f32_buffer(dev: u64, data: &[f32]) -> u64 {
    let mut mem = 0u64;
    let code = unsafe {
        weft_malloc(
            dev,
            ElementType::F32.tag(),
            data.len() as u64,
            data.as_ptr() as *const c_void,
            &mut mem,
        )
    };
    assert_eq!(code, WEFT_SUCCESS);
    mem
}

fn read_f32(mem: u64, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; n];
    let code = unsafe { weft_copy_mem_to_ptr(out.as_mut_ptr() as *mut c_void, mem, 0, 0) };
    assert_eq!(code, WEFT_SUCCESS, "{:?}", last_error_as_str());
    out
}

// ============================================================================
// Scenario
// ============================================================================

#[test]
fn test_vector_add_through_c_abi() {
    let dev = serial_device();
    let a = f32_buffer(dev, &[1.0, 2.0, 3.0, 4.0]);
    let b = f32_buffer(dev, &[10.0, 20.0, 30.0, 40.0]);
    let out = f32_buffer(dev, &[0.0; 4]);

    let opts = weft_build_options_create();
    let mut kernel = 0u64;
    unsafe {
        assert_eq!(weft_build_options_add_define(opts, c("N").as_ptr(), c("4").as_ptr()), WEFT_SUCCESS);
        let source = c("@kernel void add(const float *a, const float *b, float *out) {}");
        let code = weft_build_kernel(dev, source.as_ptr(), c("add").as_ptr(), opts, &mut kernel);
        assert_eq!(code, WEFT_SUCCESS, "{:?}", last_error_as_str());
        weft_build_options_free(opts);

        let name = CStr::from_ptr(weft_kernel_name(kernel));
        assert_eq!(name.to_str().unwrap(), "add");
        assert_eq!(CStr::from_ptr(weft_kernel_mode(kernel)).to_str().unwrap(), "Serial");

        let args = weft_arglist_create();
        // Filled out of order
        assert_eq!(weft_arglist_add_memory(args, 2, out), WEFT_SUCCESS);
        assert_eq!(weft_arglist_add_memory(args, 0, a), WEFT_SUCCESS);
        assert_eq!(weft_arglist_add_memory(args, 1, b), WEFT_SUCCESS);
        assert_eq!(weft_kernel_run(kernel, args), WEFT_SUCCESS);
        weft_arglist_free(args);
    }
    assert_eq!(weft_device_finish(dev), WEFT_SUCCESS);
    assert_eq!(read_f32(out, 4), vec![11.0, 22.0, 33.0, 44.0]);

    let mut seconds = -1.0f64;
    assert_eq!(unsafe { weft_kernel_time_taken(kernel, &mut seconds) }, WEFT_SUCCESS);
    assert!(seconds >= 0.0);
    assert_eq!(weft_device_free(dev), WEFT_SUCCESS);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_unknown_mode() {
    let mut dev = 0u64;
    let code = unsafe { weft_create_device(c("Vulkan").as_ptr(), 0, 0, &mut dev) };
    assert_eq!(code, WEFT_ERROR_UNSUPPORTED_BACKEND);
    assert!(last_error_as_str().unwrap().contains("Vulkan"));
    assert_eq!(dev, 0);
}

#[test]
fn test_null_pointers_rejected() {
    let code = unsafe { weft_create_device(ptr::null(), 0, 0, ptr::null_mut()) };
    assert_eq!(code, WEFT_ERROR_INVALID_ARGUMENT);
    let dev = serial_device();
    let code = unsafe { weft_device_bytes_allocated(dev, ptr::null_mut()) };
    assert_eq!(code, WEFT_ERROR_INVALID_ARGUMENT);
    assert_eq!(weft_memory_free(0), WEFT_ERROR_INVALID_ARGUMENT);
    weft_device_free(dev);
}

#[test]
fn test_stale_handles_after_device_free() {
    let dev = serial_device();
    let mem = f32_buffer(dev, &[1.0]);
    assert_eq!(weft_device_free(dev), WEFT_SUCCESS);
    assert_eq!(weft_device_free(dev), WEFT_SUCCESS);
    assert_eq!(weft_memory_free(mem), WEFT_ERROR_USE_AFTER_FREE);
    assert!(weft_device_mode(dev).is_null());
}

#[test]
fn test_gap_in_arguments() {
    let dev = serial_device();
    let out = f32_buffer(dev, &[0.0; 2]);
    let mut kernel = 0u64;
    unsafe {
        assert_eq!(
            weft_build_kernel(dev, c("fill").as_ptr(), c("fill").as_ptr(), ptr::null(), &mut kernel),
            WEFT_SUCCESS
        );
        let args = weft_arglist_create();
        weft_arglist_add_memory(args, 0, out);
        let value = 1.0f32;
        weft_arglist_add_scalar(args, 2, ElementType::F32.tag(), &value as *const f32 as *const c_void);
        assert_eq!(weft_kernel_run(kernel, args), WEFT_ERROR_UNSUPPORTED_ARGUMENT_TYPE);

        weft_arglist_clear(args);
        weft_arglist_add_memory(args, 0, out);
        weft_arglist_add_string(args, 1, c("1.0").as_ptr());
        assert_eq!(weft_kernel_run(kernel, args), WEFT_ERROR_UNSUPPORTED_ARGUMENT_TYPE);

        weft_arglist_clear(args);
        weft_arglist_add_memory(args, 0, out);
        weft_arglist_add_scalar(args, 1, ElementType::F32.tag(), &value as *const f32 as *const c_void);
        assert_eq!(weft_kernel_run(kernel, args), WEFT_SUCCESS);
        weft_arglist_free(args);
    }
    assert_eq!(weft_device_finish(dev), WEFT_SUCCESS);
    assert_eq!(read_f32(out, 2), vec![1.0, 1.0]);
    weft_device_free(dev);
}

#[test]
fn test_argument_position_past_limit() {
    let dev = serial_device();
    let out = f32_buffer(dev, &[0.0]);
    unsafe {
        let args = weft_arglist_create();
        for position in [MAX_KERNEL_ARGS, usize::MAX / 2, usize::MAX] {
            assert_eq!(weft_arglist_add_memory(args, position, out), WEFT_ERROR_INVALID_ARGUMENT);
        }
        let message = CStr::from_ptr(weft_last_error()).to_string_lossy().into_owned();
        assert!(message.contains("argument position"), "{message}");
        assert_eq!(weft_arglist_add_memory(args, 0, out), WEFT_SUCCESS);
        weft_arglist_free(args);
    }
    weft_device_free(dev);
}

#[test]
fn test_compile_error_message() {
    let dev = serial_device();
    let mut kernel = 0u64;
    let code = unsafe {
        weft_build_kernel_from_dialect(
            dev,
            c("loopy").as_ptr(),
            c("/tmp/k.py").as_ptr(),
            c("add").as_ptr(),
            ptr::null(),
            &mut kernel,
        )
    };
    assert_eq!(code, WEFT_ERROR_COMPILE);
    assert!(last_error_as_str().unwrap().contains("loopy"));
    weft_device_free(dev);
}

#[test]
fn test_build_from_file_and_binary() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("fill.okl");
    std::fs::write(&source_path, "@kernel void fill(int *out, int value) {}").unwrap();
    let binary_path = dir.path().join("kernels.bin");
    weft_backends::host::HostManifest::new(["fill"]).write(&binary_path).unwrap();

    let dev = serial_device();
    let mut mem = 0u64;
    let (mut from_file, mut from_binary) = (0u64, 0u64);
    let value = -3i32;
    unsafe {
        let path = c(source_path.to_str().unwrap());
        let code = weft_build_kernel_from_file(dev, path.as_ptr(), c("fill").as_ptr(), ptr::null(), &mut from_file);
        assert_eq!(code, WEFT_SUCCESS, "{:?}", last_error_as_str());
        let path = c(binary_path.to_str().unwrap());
        let code = weft_build_kernel_from_binary(dev, path.as_ptr(), c("fill").as_ptr(), &mut from_binary);
        assert_eq!(code, WEFT_SUCCESS, "{:?}", last_error_as_str());
        assert_eq!(
            weft_build_kernel_from_binary(dev, path.as_ptr(), c("add").as_ptr(), &mut from_binary),
            WEFT_ERROR_COMPILE
        );

        let init: &[u8] = bytemuck::cast_slice(&[1i32, 2, 3]);
        let code = weft_malloc(dev, ElementType::I32.tag(), 3, init.as_ptr() as *const c_void, &mut mem);
        assert_eq!(code, WEFT_SUCCESS);

        let args = weft_arglist_create();
        weft_arglist_add_memory(args, 0, mem);
        weft_arglist_add_scalar(args, 1, ElementType::I32.tag(), &value as *const i32 as *const c_void);
        assert_eq!(weft_kernel_run(from_binary, args), WEFT_SUCCESS);
        weft_arglist_free(args);
    }
    assert_eq!(weft_device_finish(dev), WEFT_SUCCESS);

    let mut bytes = [0u8; 12];
    let code = unsafe { weft_copy_mem_to_ptr(bytes.as_mut_ptr() as *mut c_void, mem, 0, 0) };
    assert_eq!(code, WEFT_SUCCESS);
    assert_eq!(bytemuck::pod_collect_to_vec::<u8, i32>(&bytes), vec![-3, -3, -3]);
    assert_eq!(weft_kernel_free(from_file), WEFT_SUCCESS);
    weft_device_free(dev);
}

// ============================================================================
// Memory
// ============================================================================

#[test]
fn test_copies_and_bounds() {
    let dev = serial_device();
    let a = f32_buffer(dev, &[1.0, 2.0, 3.0, 4.0]);
    let b = f32_buffer(dev, &[0.0; 4]);

    // Auto size from an offset
    assert_eq!(weft_copy_mem_to_mem(b, a, 0, 8, 8), WEFT_SUCCESS);
    assert_eq!(read_f32(b, 4), vec![0.0, 0.0, 3.0, 4.0]);

    let src = [9.0f32];
    let code = unsafe { weft_copy_ptr_to_mem(b, src.as_ptr() as *const c_void, 4, 16) };
    assert_eq!(code, WEFT_ERROR_OUT_OF_BOUNDS);
    let code = unsafe { weft_copy_ptr_to_mem(b, src.as_ptr() as *const c_void, 4, 12) };
    assert_eq!(code, WEFT_SUCCESS);
    assert_eq!(read_f32(b, 4), vec![0.0, 0.0, 3.0, 9.0]);

    let mut host = [0.0f32; 2];
    let code = unsafe {
        weft_memcpy(
            host.as_mut_ptr() as *mut c_void,
            src.as_ptr() as *const c_void,
            4,
        )
    };
    assert_eq!(code, WEFT_SUCCESS);
    assert_eq!(host, [9.0, 0.0]);

    let mut bytes = 0u64;
    unsafe { weft_memory_size(a, &mut bytes) };
    assert_eq!(bytes, 16);
    unsafe { weft_device_bytes_allocated(dev, &mut bytes) };
    assert_eq!(bytes, 32);

    assert_eq!(weft_memory_swap(a, b), WEFT_SUCCESS);
    assert_eq!(read_f32(a, 4), vec![0.0, 0.0, 3.0, 9.0]);
    weft_device_free(dev);
}

#[test]
fn test_async_read_lands_on_finish() {
    let dev = serial_device();
    let mem = f32_buffer(dev, &[0.0; 3]);
    let src = [5.0f32, 6.0, 7.0];
    let mut dst = [0.0f32; 3];
    unsafe {
        assert_eq!(
            weft_async_copy_ptr_to_mem(mem, src.as_ptr() as *const c_void, 0, 0),
            WEFT_SUCCESS
        );
        assert_eq!(
            weft_async_copy_mem_to_ptr(dst.as_mut_ptr() as *mut c_void, mem, 0, 0),
            WEFT_SUCCESS
        );
    }
    assert_eq!(dst, [0.0; 3]);
    assert_eq!(weft_device_finish(dev), WEFT_SUCCESS);
    assert_eq!(dst, [5.0, 6.0, 7.0]);
    weft_device_free(dev);
}

#[test]
fn test_mapped_memory_through_c_abi() {
    let dev = serial_device();
    let mut mem = 0u64;
    let mut host: *mut c_void = ptr::null_mut();
    unsafe {
        let code = weft_malloc_kind(dev, ElementType::F32.tag(), 2, ptr::null(), 1, &mut mem);
        assert_eq!(code, WEFT_SUCCESS, "{:?}", last_error_as_str());
        assert_eq!(weft_memory_mapped_pointer(mem, &mut host), WEFT_SUCCESS);
        assert!(!host.is_null());
        std::slice::from_raw_parts_mut(host as *mut f32, 2).copy_from_slice(&[1.5, 2.5]);
    }
    assert_eq!(read_f32(mem, 2), vec![1.5, 2.5]);

    // Plain device memory has no host address
    let plain = f32_buffer(dev, &[0.0]);
    assert_eq!(
        unsafe { weft_memory_mapped_pointer(plain, &mut host) },
        WEFT_ERROR_INVALID_ARGUMENT
    );
    let code = unsafe { weft_malloc_kind(dev, ElementType::F32.tag(), 1, ptr::null(), 9, &mut mem) };
    assert_eq!(code, WEFT_ERROR_INVALID_ARGUMENT);
    assert!(last_error_as_str().unwrap().contains("memory kind"));
    weft_device_free(dev);
}

#[test]
fn test_wrapped_handles_through_c_abi() {
    let dev = serial_device();
    let owner = f32_buffer(dev, &[1.0, 2.0]);
    let (mut native, mut alias, mut wrapped) = (0u64, 0u64, 0);
    let mut allocated = 0u64;
    unsafe {
        assert_eq!(weft_memory_native_handle(owner, &mut native), WEFT_SUCCESS);
        let code = weft_device_wrap_memory(dev, native, ElementType::F32.tag(), 2, &mut alias);
        assert_eq!(code, WEFT_SUCCESS, "{:?}", last_error_as_str());
        assert_eq!(weft_memory_is_wrapped(alias, &mut wrapped), WEFT_SUCCESS);
        assert_eq!(wrapped, 1);
        weft_device_bytes_allocated(dev, &mut allocated);
    }
    assert_eq!(allocated, 8);
    assert_eq!(read_f32(alias, 2), vec![1.0, 2.0]);
    assert_eq!(weft_memory_free(alias), WEFT_SUCCESS);
    assert_eq!(read_f32(owner, 2), vec![1.0, 2.0]);

    let (mut side, mut native_stream, mut adopted) = (0u64, 0u64, 0u64);
    unsafe {
        weft_device_create_stream(dev, &mut side);
        assert_eq!(weft_stream_native_handle(side, &mut native_stream), WEFT_SUCCESS);
        assert_eq!(weft_device_wrap_stream(dev, native_stream, &mut adopted), WEFT_SUCCESS);
        assert_eq!(weft_stream_is_wrapped(adopted, &mut wrapped), WEFT_SUCCESS);
        assert_eq!(wrapped, 1);
        assert_eq!(weft_stream_is_wrapped(side, &mut wrapped), WEFT_SUCCESS);
        assert_eq!(wrapped, 0);
    }
    assert_eq!(weft_stream_free(adopted), WEFT_SUCCESS);
    assert_eq!(weft_stream_free(side), WEFT_SUCCESS);
    weft_device_free(dev);
}

// ============================================================================
// Streams, tags, configuration
// ============================================================================

#[test]
fn test_available_devices_listing() {
    let report = unsafe { CStr::from_ptr(weft_available_devices()) }.to_str().unwrap().to_string();
    assert!(report.contains("Serial"), "{report}");
    assert!(report.contains("host CPU"), "{report}");
    assert_eq!(weft_print_available_devices(), WEFT_SUCCESS);
}

#[test]
fn test_streams_and_tags() {
    let dev = serial_device();
    let (mut default, mut side, mut current) = (0u64, 0u64, 0u64);
    unsafe {
        weft_device_get_stream(dev, &mut default);
        assert_eq!(weft_device_create_stream(dev, &mut side), WEFT_SUCCESS);
        assert_eq!(weft_device_set_stream(dev, side), WEFT_SUCCESS);
        weft_device_get_stream(dev, &mut current);
        assert_eq!(current, side);

        let (mut start, mut end) = (0u64, 0u64);
        weft_device_tag_stream(dev, &mut start);
        weft_device_tag_stream(dev, &mut end);
        let mut seconds = 0.0f64;
        assert_eq!(
            weft_device_time_between(dev, start, end, &mut seconds),
            WEFT_ERROR_RESULT_NOT_READY
        );
        assert_eq!(weft_device_finish(dev), WEFT_SUCCESS);
        assert_eq!(weft_device_time_between(dev, start, end, &mut seconds), WEFT_SUCCESS);
        assert!(seconds >= 0.0);
        assert_eq!(weft_device_free_tag(dev, start), WEFT_SUCCESS);
        assert_eq!(
            weft_device_time_between(dev, start, end, &mut seconds),
            WEFT_ERROR_USE_AFTER_FREE
        );

        assert_eq!(weft_stream_free(side), WEFT_SUCCESS);
        weft_device_get_stream(dev, &mut current);
        assert_eq!(current, default);
        assert_eq!(weft_stream_free(default), WEFT_ERROR_INVALID_ARGUMENT);
    }
    weft_device_free(dev);
}

#[test]
fn test_compiler_settings_roundtrip() {
    let dev = serial_device();
    unsafe {
        assert_eq!(weft_device_set_compiler(dev, c("clang++").as_ptr()), WEFT_SUCCESS);
        assert_eq!(weft_device_set_compiler_flags(dev, c("-O3").as_ptr()), WEFT_SUCCESS);
        assert_eq!(weft_device_set_compiler_env_script(dev, c("env.sh").as_ptr()), WEFT_SUCCESS);
        assert_eq!(CStr::from_ptr(weft_device_compiler(dev)).to_str().unwrap(), "clang++");
        assert_eq!(CStr::from_ptr(weft_device_compiler_flags(dev)).to_str().unwrap(), "-O3");
        assert_eq!(CStr::from_ptr(weft_device_compiler_env_script(dev)).to_str().unwrap(), "env.sh");
    }
    weft_device_free(dev);
}

#[test]
fn test_device_from_info_and_background() {
    let mut dev = 0u64;
    let info = c("mode = OpenMP, platformID = 0, deviceID = 0");
    assert_eq!(unsafe { weft_create_device_from_info(info.as_ptr(), &mut dev) }, WEFT_SUCCESS);
    assert_eq!(unsafe { CStr::from_ptr(weft_device_mode(dev)) }.to_str().unwrap(), "OpenMP");

    let mut bg = 0u64;
    assert_eq!(unsafe { weft_get_device(&mut bg) }, WEFT_SUCCESS);
    assert_ne!(bg, 0);
    let (mut side, mut current) = (0u64, 0u64);
    unsafe {
        assert_eq!(weft_set_compiler_flags(c("-O2").as_ptr()), WEFT_SUCCESS);
        assert_eq!(CStr::from_ptr(weft_device_compiler_flags(bg)).to_str().unwrap(), "-O2");
        assert_eq!(weft_create_stream(&mut side), WEFT_SUCCESS);
        assert_eq!(weft_set_stream(side), WEFT_SUCCESS);
        assert_eq!(weft_get_stream(&mut current), WEFT_SUCCESS);
    }
    assert_eq!(current, side);
    assert_eq!(weft_finish(), WEFT_SUCCESS);
    assert_eq!(weft_stream_free(side), WEFT_SUCCESS);
    weft_device_free(dev);
}
