//! Kernel sources, launch geometry and argument lists.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dtype::{ElementType, Scalar};
use crate::handle::MemoryId;
use crate::{Result, RuntimeError};

/// Where a kernel comes from. The payload is opaque to the runtime and handed
/// to the backend as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSource {
    /// Kernel source text.
    Inline(String),
    /// Path to a kernel source file.
    File(PathBuf),
    /// Path to a precompiled binary produced by the backend.
    Binary(PathBuf),
    /// Source in an alternate kernel-description dialect, passed through to
    /// the backend untouched.
    Dialect { dialect: String, path: PathBuf },
}

impl KernelSource {
    pub fn inline(source: impl Into<String>) -> Self {
        KernelSource::Inline(source.into())
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        KernelSource::File(path.into())
    }

    pub fn binary(path: impl Into<PathBuf>) -> Self {
        KernelSource::Binary(path.into())
    }

    pub fn dialect(dialect: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        KernelSource::Dialect {
            dialect: dialect.into(),
            path: path.into(),
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &str {
        match self {
            KernelSource::Inline(_) => "inline",
            KernelSource::File(_) => "file",
            KernelSource::Binary(_) => "binary",
            KernelSource::Dialect { dialect, .. } => dialect,
        }
    }

    /// Whether build options apply. Precompiled binaries ignore them.
    pub fn accepts_options(&self) -> bool {
        !matches!(self, KernelSource::Binary(_))
    }
}

/// A three-component extent. Unused trailing components are 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(C)]
pub struct Dim {
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

impl Dim {
    pub const ONE: Dim = Dim { x: 1, y: 1, z: 1 };

    pub fn new(x: u64, y: u64, z: u64) -> Self {
        Self { x, y, z }
    }

    pub fn x(x: u64) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub fn xy(x: u64, y: u64) -> Self {
        Self { x, y, z: 1 }
    }

    /// Product of the first `dims` components.
    pub fn volume(&self, dims: u8) -> u64 {
        [self.x, self.y, self.z]
            .iter()
            .take(dims as usize)
            .product()
    }
}

impl Default for Dim {
    fn default() -> Self {
        Dim::ONE
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Launch geometry of a kernel: dimensionality, work items per group and
/// number of groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingDims {
    dims: u8,
    items_per_group: Dim,
    groups: Dim,
}

impl WorkingDims {
    /// Validated constructor. `dims` must be 1, 2 or 3 and every used
    /// component must be non-zero.
    pub fn new(dims: u8, items_per_group: Dim, groups: Dim) -> Result<Self> {
        if !(1..=3).contains(&dims) {
            return Err(RuntimeError::InvalidArgument(format!(
                "working dims must be 1, 2 or 3, got {dims}"
            )));
        }
        if items_per_group.volume(dims) == 0 || groups.volume(dims) == 0 {
            return Err(RuntimeError::InvalidArgument(format!(
                "empty launch geometry: items {items_per_group}, groups {groups}"
            )));
        }
        Ok(Self {
            dims,
            items_per_group,
            groups,
        })
    }

    /// One-dimensional launch covering at least `n` items with groups of
    /// `group_size`.
    pub fn linear(n: u64, group_size: u64) -> Result<Self> {
        let group_size = group_size.max(1);
        let groups = n.div_ceil(group_size).max(1);
        Self::new(1, Dim::x(group_size), Dim::x(groups))
    }

    pub fn dims(&self) -> u8 {
        self.dims
    }

    pub fn items_per_group(&self) -> Dim {
        self.items_per_group
    }

    pub fn groups(&self) -> Dim {
        self.groups
    }

    /// Total work items across all groups.
    pub fn total_items(&self) -> u64 {
        self.items_per_group.volume(self.dims) * self.groups.volume(self.dims)
    }
}

impl Default for WorkingDims {
    fn default() -> Self {
        Self {
            dims: 1,
            items_per_group: Dim::ONE,
            groups: Dim::ONE,
        }
    }
}

/// A host address tagged with the element type it points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedPtr {
    pub addr: usize,
    pub element: ElementType,
    pub len: usize,
}

/// One positional kernel argument.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Memory(MemoryId),
    Scalar(Scalar),
    Pointer(TaggedPtr),
    Str(String),
}

impl KernelArg {
    pub fn kind(&self) -> ArgKind {
        match self {
            KernelArg::Memory(_) => ArgKind::Memory,
            KernelArg::Scalar(s) => ArgKind::Scalar(s.element_type()),
            KernelArg::Pointer(p) => ArgKind::Pointer(p.element),
            KernelArg::Str(_) => ArgKind::Str,
        }
    }
}

impl From<MemoryId> for KernelArg {
    fn from(m: MemoryId) -> Self {
        KernelArg::Memory(m)
    }
}

impl From<Scalar> for KernelArg {
    fn from(s: Scalar) -> Self {
        KernelArg::Scalar(s)
    }
}

macro_rules! impl_arg_from_scalar {
    ($($t:ty),*) => {
        $(impl From<$t> for KernelArg {
            fn from(v: $t) -> Self {
                KernelArg::Scalar(Scalar::from(v))
            }
        })*
    };
}

impl_arg_from_scalar!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// The shape of an argument, without its value. Backends decide which kinds
/// they can marshal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Memory,
    Scalar(ElementType),
    Pointer(ElementType),
    Str,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgKind::Memory => f.write_str("memory"),
            ArgKind::Scalar(t) => write!(f, "scalar<{t}>"),
            ArgKind::Pointer(t) => write!(f, "pointer<{t}>"),
            ArgKind::Str => f.write_str("string"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_dims_validation() {
        assert!(WorkingDims::new(0, Dim::ONE, Dim::ONE).is_err());
        assert!(WorkingDims::new(4, Dim::ONE, Dim::ONE).is_err());
        assert!(WorkingDims::new(1, Dim::x(0), Dim::ONE).is_err());
        // Components beyond `dims` are ignored
        let wd = WorkingDims::new(1, Dim::new(16, 0, 0), Dim::x(4)).unwrap();
        assert_eq!(wd.total_items(), 64);
    }

    #[test]
    fn test_linear() {
        let wd = WorkingDims::linear(1000, 256).unwrap();
        assert_eq!(wd.groups().x, 4);
        assert!(wd.total_items() >= 1000);
        let empty = WorkingDims::linear(0, 0).unwrap();
        assert_eq!(empty.total_items(), 1);
    }

    #[test]
    fn test_arg_kinds() {
        assert_eq!(KernelArg::from(3i32).kind(), ArgKind::Scalar(ElementType::I32));
        assert_eq!(KernelArg::Str("x".into()).kind(), ArgKind::Str);
        assert_eq!(ArgKind::Pointer(ElementType::F64).to_string(), "pointer<f64>");
    }

    #[test]
    fn test_source_kinds() {
        assert_eq!(KernelSource::inline("x").kind(), "inline");
        assert_eq!(KernelSource::dialect("loopy", "k.py").kind(), "loopy");
        assert!(!KernelSource::binary("k.bin").accepts_options());
    }
}
