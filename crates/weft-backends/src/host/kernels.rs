//! Host kernels: plain Rust functions registered by entry-point name.

use std::collections::HashMap;
use std::ops::{Add, Mul};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use weft_core::{Element, ElementType, KernelBuildOptions, Scalar, TaggedPtr, WorkingDims};

/// Storage behind one host allocation.
pub(crate) type Buffer = Arc<Mutex<Vec<u8>>>;

/// Failure raised by a host kernel while it runs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HostKernelError {
    #[error("define '{0}' is required")]
    MissingDefine(String),

    #[error("define '{name}' has unusable value '{value}'")]
    BadDefine { name: String, value: String },

    #[error("argument {index} requested but only {count} were passed")]
    MissingArgument { index: usize, count: usize },

    #[error("argument {index} must be a {expected}")]
    ArgumentKind { index: usize, expected: &'static str },

    #[error("argument {index} holds {have} elements, kernel needs {need}")]
    TooShort { index: usize, need: usize, have: usize },

    #[error("element type {0} is not supported by this kernel")]
    UnsupportedType(ElementType),
}

pub type KernelResult = Result<(), HostKernelError>;

pub type HostKernelFn = Arc<dyn Fn(&mut KernelContext<'_>) -> KernelResult + Send + Sync>;

/// A launch argument after buffer handles have been resolved to storage.
#[derive(Clone)]
pub(crate) enum HostArg {
    Buffer(Buffer),
    Scalar(Scalar),
    Pointer(TaggedPtr),
}

/// What a host kernel sees while it runs: its build defines, arguments and
/// launch geometry.
pub struct KernelContext<'a> {
    pub(crate) options: &'a KernelBuildOptions,
    pub(crate) args: &'a [HostArg],
    pub(crate) dims: &'a WorkingDims,
}

impl<'a> KernelContext<'a> {
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn dims(&self) -> &WorkingDims {
        self.dims
    }

    pub fn options(&self) -> &KernelBuildOptions {
        self.options
    }

    /// Parsed value of a build define. The last definition wins.
    pub fn define<T: FromStr>(&self, name: &str) -> Result<T, HostKernelError> {
        let value = self
            .options
            .define_value(name)
            .ok_or_else(|| HostKernelError::MissingDefine(name.to_string()))?;
        value.trim().parse().map_err(|_| HostKernelError::BadDefine {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Like [`KernelContext::define`], falling back to `default` when unset.
    pub fn define_or<T: FromStr>(&self, name: &str, default: T) -> Result<T, HostKernelError> {
        match self.options.define_value(name) {
            Some(_) => self.define(name),
            None => Ok(default),
        }
    }

    fn arg(&self, index: usize) -> Result<&HostArg, HostKernelError> {
        self.args.get(index).ok_or(HostKernelError::MissingArgument {
            index,
            count: self.args.len(),
        })
    }

    fn buffer(&self, index: usize) -> Result<&Buffer, HostKernelError> {
        match self.arg(index)? {
            HostArg::Buffer(b) => Ok(b),
            _ => Err(HostKernelError::ArgumentKind {
                index,
                expected: "buffer",
            }),
        }
    }

    pub fn scalar(&self, index: usize) -> Result<Scalar, HostKernelError> {
        match self.arg(index)? {
            HostArg::Scalar(s) => Ok(*s),
            _ => Err(HostKernelError::ArgumentKind {
                index,
                expected: "scalar",
            }),
        }
    }

    pub fn pointer(&self, index: usize) -> Result<TaggedPtr, HostKernelError> {
        match self.arg(index)? {
            HostArg::Pointer(p) => Ok(*p),
            _ => Err(HostKernelError::ArgumentKind {
                index,
                expected: "pointer",
            }),
        }
    }

    /// Byte length of a buffer argument.
    pub fn buffer_len(&self, index: usize) -> Result<usize, HostKernelError> {
        Ok(self.buffer(index)?.lock().len())
    }

    /// Copy a buffer argument out as elements of `T`.
    pub fn read<T: Element>(&self, index: usize) -> Result<Vec<T>, HostKernelError> {
        let buf = self.buffer(index)?.lock();
        let whole = buf.len() - buf.len() % std::mem::size_of::<T>();
        Ok(bytemuck::pod_collect_to_vec(&buf[..whole]))
    }

    /// Overwrite the start of a buffer argument with `data`.
    pub fn write<T: Element>(&self, index: usize, data: &[T]) -> Result<(), HostKernelError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buf = self.buffer(index)?.lock();
        if bytes.len() > buf.len() {
            return Err(HostKernelError::TooShort {
                index,
                need: data.len(),
                have: buf.len() / std::mem::size_of::<T>(),
            });
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// Name-to-function table consulted when building kernels.
pub struct KernelRegistry {
    kernels: RwLock<HashMap<String, HostKernelFn>>,
}

impl KernelRegistry {
    pub fn empty() -> Self {
        Self {
            kernels: RwLock::new(HashMap::new()),
        }
    }

    /// Registry holding `add`, `scale` and `fill`.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register("add", kernel_add);
        registry.register("scale", kernel_scale);
        registry.register("fill", kernel_fill);
        registry
    }

    /// Register (or replace) the function behind `name`.
    pub fn register<F>(&self, name: &str, f: F)
    where
        F: Fn(&mut KernelContext<'_>) -> KernelResult + Send + Sync + 'static,
    {
        self.kernels.write().insert(name.to_string(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<HostKernelFn> {
        self.kernels.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kernels.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ---------------------------------------------------------------------------
// Precompiled binaries
// ---------------------------------------------------------------------------

pub const MANIFEST_FORMAT: &str = "weft-host";

/// The "binary" form of host kernels: a JSON list of entry points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostManifest {
    pub format: String,
    pub entries: Vec<String>,
}

impl HostManifest {
    pub fn new<S: Into<String>>(entries: impl IntoIterator<Item = S>) -> Self {
        Self {
            format: MANIFEST_FORMAT.to_string(),
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn read(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
        let manifest: Self =
            serde_json::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))?;
        if manifest.format != MANIFEST_FORMAT {
            return Err(format!(
                "{}: unknown binary format '{}'",
                path.display(),
                manifest.format
            ));
        }
        Ok(manifest)
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, text)
    }
}

// ---------------------------------------------------------------------------
// Built-in kernels
// ---------------------------------------------------------------------------

/// Element type selected with the `T` define (default `float`).
fn element_type(ctx: &KernelContext<'_>) -> Result<ElementType, HostKernelError> {
    ctx.define_or("T", ElementType::F32)
}

/// Element count from the `N` define, or the shortest buffer.
fn element_count(ctx: &KernelContext<'_>, lens: &[usize]) -> Result<usize, HostKernelError> {
    let shortest = lens.iter().copied().min().unwrap_or(0);
    ctx.define_or("N", shortest)
}

fn add_typed<T>(ctx: &mut KernelContext<'_>) -> KernelResult
where
    T: Element + Add<Output = T>,
{
    let a: Vec<T> = ctx.read(0)?;
    let b: Vec<T> = ctx.read(1)?;
    let out_len = ctx.buffer_len(2)? / std::mem::size_of::<T>();
    let n = element_count(ctx, &[a.len(), b.len(), out_len])?;
    for (index, have) in [a.len(), b.len(), out_len].into_iter().enumerate() {
        if have < n {
            return Err(HostKernelError::TooShort { index, need: n, have });
        }
    }
    let out: Vec<T> = a[..n].iter().zip(&b[..n]).map(|(x, y)| *x + *y).collect();
    ctx.write(2, &out)
}

/// `out[i] = a[i] + b[i]` for `i < N`. Arguments: `a`, `b`, `out`.
fn kernel_add(ctx: &mut KernelContext<'_>) -> KernelResult {
    match element_type(ctx)? {
        ElementType::F32 => add_typed::<f32>(ctx),
        ElementType::F64 => add_typed::<f64>(ctx),
        ElementType::I32 => add_typed::<i32>(ctx),
        ElementType::I64 => add_typed::<i64>(ctx),
        ElementType::U32 => add_typed::<u32>(ctx),
        ElementType::U64 => add_typed::<u64>(ctx),
        other => Err(HostKernelError::UnsupportedType(other)),
    }
}

fn scale_typed<T>(ctx: &mut KernelContext<'_>, alpha: T) -> KernelResult
where
    T: Element + Mul<Output = T>,
{
    let x: Vec<T> = ctx.read(0)?;
    let n = element_count(ctx, &[x.len()])?;
    if x.len() < n {
        return Err(HostKernelError::TooShort {
            index: 0,
            need: n,
            have: x.len(),
        });
    }
    let out: Vec<T> = x[..n].iter().map(|v| *v * alpha).collect();
    ctx.write(0, &out)
}

/// `x[i] *= alpha` in place. Arguments: `x`, `alpha`; the buffer is read as
/// the scalar's element type.
fn kernel_scale(ctx: &mut KernelContext<'_>) -> KernelResult {
    match ctx.scalar(1)? {
        Scalar::F32(a) => scale_typed(ctx, a),
        Scalar::F64(a) => scale_typed(ctx, a),
        Scalar::I32(a) => scale_typed(ctx, a),
        Scalar::I64(a) => scale_typed(ctx, a),
        other => Err(HostKernelError::UnsupportedType(other.element_type())),
    }
}

/// Fill a buffer with one value. Arguments: `out`, `value`.
fn kernel_fill(ctx: &mut KernelContext<'_>) -> KernelResult {
    let value = ctx.scalar(1)?;
    let pattern = value.to_ne_bytes();
    let capacity = ctx.buffer_len(0)? / pattern.len();
    let n = element_count(ctx, &[capacity])?;
    if capacity < n {
        return Err(HostKernelError::TooShort {
            index: 0,
            need: n,
            have: capacity,
        });
    }
    let bytes: Vec<u8> = pattern.iter().copied().cycle().take(n * pattern.len()).collect();
    ctx.write::<u8>(0, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer<T: Element>(data: &[T]) -> HostArg {
        HostArg::Buffer(Arc::new(Mutex::new(bytemuck::cast_slice(data).to_vec())))
    }

    fn contents<T: Element>(arg: &HostArg) -> Vec<T> {
        match arg {
            HostArg::Buffer(b) => bytemuck::pod_collect_to_vec(&b.lock()[..]),
            _ => panic!("not a buffer"),
        }
    }

    fn run(name: &str, options: &KernelBuildOptions, args: &[HostArg]) -> KernelResult {
        let registry = KernelRegistry::with_builtins();
        let f = registry.get(name).unwrap();
        let dims = WorkingDims::default();
        let mut ctx = KernelContext {
            options,
            args,
            dims: &dims,
        };
        f(&mut ctx)
    }

    #[test]
    fn test_add_respects_n() {
        let args = [
            buffer(&[1.0f32, 2.0, 3.0, 4.0]),
            buffer(&[10.0f32, 20.0, 30.0, 40.0]),
            buffer(&[0.0f32; 4]),
        ];
        let options = KernelBuildOptions::new().define("N", 3);
        run("add", &options, &args).unwrap();
        assert_eq!(contents::<f32>(&args[2]), vec![11.0, 22.0, 33.0, 0.0]);
    }

    #[test]
    fn test_add_typed_define() {
        let args = [buffer(&[1i64, -2]), buffer(&[5i64, 5]), buffer(&[0i64; 2])];
        let options = KernelBuildOptions::new().define("T", "long");
        run("add", &options, &args).unwrap();
        assert_eq!(contents::<i64>(&args[2]), vec![6, 3]);
    }

    #[test]
    fn test_add_errors() {
        let args = [buffer(&[1.0f32]), buffer(&[1.0f32]), buffer(&[0.0f32])];
        let options = KernelBuildOptions::new().define("N", 2);
        assert!(matches!(
            run("add", &options, &args),
            Err(HostKernelError::TooShort { need: 2, .. })
        ));
        let options = KernelBuildOptions::new().define("N", "four");
        assert!(matches!(
            run("add", &options, &args),
            Err(HostKernelError::BadDefine { .. })
        ));
        assert!(matches!(
            run("add", &KernelBuildOptions::new(), &args[..2]),
            Err(HostKernelError::MissingArgument { index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_scale_and_fill() {
        let args = [buffer(&[1.0f64, 2.0, 3.0]), HostArg::Scalar(Scalar::F64(2.0))];
        run("scale", &KernelBuildOptions::new(), &args).unwrap();
        assert_eq!(contents::<f64>(&args[0]), vec![2.0, 4.0, 6.0]);

        let args = [buffer(&[0u16; 4]), HostArg::Scalar(Scalar::U16(7))];
        run("fill", &KernelBuildOptions::new().define("N", 3), &args).unwrap();
        assert_eq!(contents::<u16>(&args[0]), vec![7, 7, 7, 0]);
    }

    #[test]
    fn test_registry() {
        let registry = KernelRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["add", "fill", "scale"]);
        registry.register("noop", |_ctx| Ok(()));
        assert!(registry.contains("noop"));
        assert!(KernelRegistry::empty().get("add").is_none());
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernels.bin");
        HostManifest::new(["add", "fill"]).write(&path).unwrap();
        let m = HostManifest::read(&path).unwrap();
        assert_eq!(m.entries, vec!["add", "fill"]);

        std::fs::write(&path, r#"{"format":"ptx","entries":[]}"#).unwrap();
        assert!(HostManifest::read(&path).unwrap_err().contains("unknown binary format"));
    }
}
