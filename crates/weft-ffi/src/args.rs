//! Kernel argument lists and build options, built up one call at a time.

use std::ffi::{c_char, c_int, c_void};

use weft_core::{ElementType, KernelArg, KernelBuildOptions, Result, RuntimeError, Scalar, TaggedPtr};

use crate::{call, memory_handle, str_arg};

/// Highest number of positional arguments a kernel call may carry.
pub const MAX_KERNEL_ARGS: usize = 1024;

/// Positional kernel arguments. Positions may be filled in any order.
#[derive(Debug, Default)]
pub struct WeftArgList {
    args: Vec<Option<KernelArg>>,
}

impl WeftArgList {
    /// Fill `position`, growing the list as needed. Positions at or past
    /// [`MAX_KERNEL_ARGS`] are rejected.
    pub fn set(&mut self, position: usize, arg: KernelArg) -> Result<()> {
        if position >= MAX_KERNEL_ARGS {
            return Err(RuntimeError::InvalidArgument(format!(
                "argument position {position} exceeds the limit of {MAX_KERNEL_ARGS}"
            )));
        }
        if self.args.len() <= position {
            self.args.resize(position + 1, None);
        }
        self.args[position] = Some(arg);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.args.clear();
    }

    /// The arguments in order. A position that was never filled is reported
    /// as an unsupported argument.
    pub fn resolve(&self) -> Result<Vec<KernelArg>> {
        self.args
            .iter()
            .enumerate()
            .map(|(index, arg)| {
                arg.clone().ok_or_else(|| RuntimeError::UnsupportedArgumentType {
                    index,
                    kind: "unset".to_string(),
                })
            })
            .collect()
    }
}

/// Build options passed to `weft_build_kernel*`.
#[derive(Debug, Default)]
pub struct WeftBuildOptions {
    pub(crate) inner: KernelBuildOptions,
}

unsafe fn list_mut<'a>(list: *mut WeftArgList) -> Result<&'a mut WeftArgList> {
    list.as_mut()
        .ok_or_else(|| RuntimeError::InvalidArgument("argument list is null".into()))
}

unsafe fn options_mut<'a>(options: *mut WeftBuildOptions) -> Result<&'a mut WeftBuildOptions> {
    options
        .as_mut()
        .ok_or_else(|| RuntimeError::InvalidArgument("build options are null".into()))
}

fn element_type(tag: c_int) -> Result<ElementType> {
    ElementType::from_tag(tag)
        .ok_or_else(|| RuntimeError::InvalidArgument(format!("unknown element type tag {tag}")))
}

// ---------------------------------------------------------------------------
// Argument lists
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn weft_arglist_create() -> *mut WeftArgList {
    Box::into_raw(Box::default())
}

/// # Safety
///
/// `list` must be null or a pointer returned by [`weft_arglist_create`]
/// that has not been freed.
#[no_mangle]
pub unsafe extern "C" fn weft_arglist_free(list: *mut WeftArgList) {
    if !list.is_null() {
        drop(Box::from_raw(list));
    }
}

/// # Safety
///
/// `list` must be a live argument list.
#[no_mangle]
pub unsafe extern "C" fn weft_arglist_clear(list: *mut WeftArgList) -> c_int {
    call(|| {
        list_mut(list)?.clear();
        Ok(())
    })
}

/// # Safety
///
/// `list` must be a live argument list.
#[no_mangle]
pub unsafe extern "C" fn weft_arglist_add_memory(list: *mut WeftArgList, position: usize, memory: u64) -> c_int {
    call(|| {
        let mem = memory_handle(memory)?;
        list_mut(list)?.set(position, KernelArg::Memory(mem))?;
        Ok(())
    })
}

/// Add a scalar whose native-endian bytes are read from `value`.
///
/// # Safety
///
/// `list` must be a live argument list and `value` valid for reads of one
/// element of the tagged type.
#[no_mangle]
pub unsafe extern "C" fn weft_arglist_add_scalar(
    list: *mut WeftArgList,
    position: usize,
    type_tag: c_int,
    value: *const c_void,
) -> c_int {
    call(|| {
        let ty = element_type(type_tag)?;
        if value.is_null() {
            return Err(RuntimeError::InvalidArgument("scalar value is null".into()));
        }
        let bytes = std::slice::from_raw_parts(value as *const u8, ty.size() as usize);
        let scalar = Scalar::from_ne_bytes(ty, bytes)
            .ok_or_else(|| RuntimeError::Internal(format!("decoding {ty} scalar")))?;
        list_mut(list)?.set(position, KernelArg::Scalar(scalar))?;
        Ok(())
    })
}

/// Add a raw host pointer to `len` elements of the tagged type.
///
/// # Safety
///
/// `list` must be a live argument list. The runtime does not dereference
/// `ptr`; the backend receiving it decides what it may do with it.
#[no_mangle]
pub unsafe extern "C" fn weft_arglist_add_pointer(
    list: *mut WeftArgList,
    position: usize,
    type_tag: c_int,
    ptr: *mut c_void,
    len: usize,
) -> c_int {
    call(|| {
        let element = element_type(type_tag)?;
        let arg = KernelArg::Pointer(TaggedPtr {
            addr: ptr as usize,
            element,
            len,
        });
        list_mut(list)?.set(position, arg)?;
        Ok(())
    })
}

/// # Safety
///
/// `list` must be a live argument list and `value` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn weft_arglist_add_string(list: *mut WeftArgList, position: usize, value: *const c_char) -> c_int {
    call(|| {
        let value = str_arg(value, "value")?.to_string();
        list_mut(list)?.set(position, KernelArg::Str(value))?;
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Build options
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn weft_build_options_create() -> *mut WeftBuildOptions {
    Box::into_raw(Box::default())
}

/// # Safety
///
/// `options` must be null or a pointer returned by
/// [`weft_build_options_create`] that has not been freed.
#[no_mangle]
pub unsafe extern "C" fn weft_build_options_free(options: *mut WeftBuildOptions) {
    if !options.is_null() {
        drop(Box::from_raw(options));
    }
}

/// Append `#define macro value`.
///
/// # Safety
///
/// `options` must be live; `macro_name` and `value` valid C strings.
#[no_mangle]
pub unsafe extern "C" fn weft_build_options_add_define(
    options: *mut WeftBuildOptions,
    macro_name: *const c_char,
    value: *const c_char,
) -> c_int {
    call(|| {
        let name = str_arg(macro_name, "macro")?;
        let value = str_arg(value, "value")?;
        options_mut(options)?.inner.add_define(name, value);
        Ok(())
    })
}

/// # Safety
///
/// `options` must be live and `path` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn weft_build_options_add_include(options: *mut WeftBuildOptions, path: *const c_char) -> c_int {
    call(|| {
        let path = str_arg(path, "path")?;
        options_mut(options)?.inner.add_include(path);
        Ok(())
    })
}
