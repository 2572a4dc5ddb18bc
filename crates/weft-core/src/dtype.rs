use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::RuntimeError;

/// Semantic element types understood by the runtime.
///
/// The element type of an allocation fixes its element stride; the element
/// type of a scalar kernel argument tells the backend how to marshal it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ElementType {
    pub const ALL: [ElementType; 10] = [
        ElementType::I8,
        ElementType::U8,
        ElementType::I16,
        ElementType::U16,
        ElementType::I32,
        ElementType::U32,
        ElementType::I64,
        ElementType::U64,
        ElementType::F32,
        ElementType::F64,
    ];

    /// Size in bytes of one element.
    pub fn size(&self) -> u32 {
        match self {
            ElementType::I8 | ElementType::U8 => 1,
            ElementType::I16 | ElementType::U16 => 2,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::U64 | ElementType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ElementType::I8 => "i8",
            ElementType::U8 => "u8",
            ElementType::I16 => "i16",
            ElementType::U16 => "u16",
            ElementType::I32 => "i32",
            ElementType::U32 => "u32",
            ElementType::I64 => "i64",
            ElementType::U64 => "u64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        }
    }

    /// Stable numeric tag used at the C ABI.
    ///
    /// Order follows the classic C type list: int, uint, char, uchar, short,
    /// ushort, long, ulong, float, double.
    pub fn tag(&self) -> i32 {
        match self {
            ElementType::I32 => 1,
            ElementType::U32 => 2,
            ElementType::I8 => 3,
            ElementType::U8 => 4,
            ElementType::I16 => 5,
            ElementType::U16 => 6,
            ElementType::I64 => 7,
            ElementType::U64 => 8,
            ElementType::F32 => 9,
            ElementType::F64 => 10,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementType {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let ty = match lower.as_str() {
            "i8" | "char" | "int8" => ElementType::I8,
            "u8" | "uchar" | "uint8" => ElementType::U8,
            "i16" | "short" | "int16" => ElementType::I16,
            "u16" | "ushort" | "uint16" => ElementType::U16,
            "i32" | "int" | "int32" => ElementType::I32,
            "u32" | "uint" | "uint32" => ElementType::U32,
            "i64" | "long" | "int64" => ElementType::I64,
            "u64" | "ulong" | "uint64" => ElementType::U64,
            "f32" | "float" | "float32" => ElementType::F32,
            "f64" | "double" | "float64" => ElementType::F64,
            _ => {
                return Err(RuntimeError::InvalidArgument(format!(
                    "unknown element type '{s}'"
                )))
            }
        };
        Ok(ty)
    }
}

/// Rust types that can live in device memory.
pub trait Element: bytemuck::Pod {
    const TYPE: ElementType;
}

macro_rules! impl_element {
    ($($t:ty => $v:ident),* $(,)?) => {
        $(impl Element for $t {
            const TYPE: ElementType = ElementType::$v;
        })*
    };
}

impl_element!(
    i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32,
    u32 => U32, i64 => I64, u64 => U64, f32 => F32, f64 => F64,
);

/// A host scalar tagged with its element type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Scalar {
    pub fn element_type(&self) -> ElementType {
        match self {
            Scalar::I8(_) => ElementType::I8,
            Scalar::U8(_) => ElementType::U8,
            Scalar::I16(_) => ElementType::I16,
            Scalar::U16(_) => ElementType::U16,
            Scalar::I32(_) => ElementType::I32,
            Scalar::U32(_) => ElementType::U32,
            Scalar::I64(_) => ElementType::I64,
            Scalar::U64(_) => ElementType::U64,
            Scalar::F32(_) => ElementType::F32,
            Scalar::F64(_) => ElementType::F64,
        }
    }

    /// Native-endian bytes of the value, as a native call expects them.
    pub fn to_ne_bytes(&self) -> SmallVec<[u8; 8]> {
        match *self {
            Scalar::I8(v) => SmallVec::from_slice(&v.to_ne_bytes()),
            Scalar::U8(v) => SmallVec::from_slice(&v.to_ne_bytes()),
            Scalar::I16(v) => SmallVec::from_slice(&v.to_ne_bytes()),
            Scalar::U16(v) => SmallVec::from_slice(&v.to_ne_bytes()),
            Scalar::I32(v) => SmallVec::from_slice(&v.to_ne_bytes()),
            Scalar::U32(v) => SmallVec::from_slice(&v.to_ne_bytes()),
            Scalar::I64(v) => SmallVec::from_slice(&v.to_ne_bytes()),
            Scalar::U64(v) => SmallVec::from_slice(&v.to_ne_bytes()),
            Scalar::F32(v) => SmallVec::from_slice(&v.to_ne_bytes()),
            Scalar::F64(v) => SmallVec::from_slice(&v.to_ne_bytes()),
        }
    }

    /// Decode a value of type `ty` from native-endian bytes.
    pub fn from_ne_bytes(ty: ElementType, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ty.size() as usize {
            return None;
        }
        let scalar = match ty {
            ElementType::I8 => Scalar::I8(i8::from_ne_bytes(bytes.try_into().ok()?)),
            ElementType::U8 => Scalar::U8(bytes[0]),
            ElementType::I16 => Scalar::I16(i16::from_ne_bytes(bytes.try_into().ok()?)),
            ElementType::U16 => Scalar::U16(u16::from_ne_bytes(bytes.try_into().ok()?)),
            ElementType::I32 => Scalar::I32(i32::from_ne_bytes(bytes.try_into().ok()?)),
            ElementType::U32 => Scalar::U32(u32::from_ne_bytes(bytes.try_into().ok()?)),
            ElementType::I64 => Scalar::I64(i64::from_ne_bytes(bytes.try_into().ok()?)),
            ElementType::U64 => Scalar::U64(u64::from_ne_bytes(bytes.try_into().ok()?)),
            ElementType::F32 => Scalar::F32(f32::from_ne_bytes(bytes.try_into().ok()?)),
            ElementType::F64 => Scalar::F64(f64::from_ne_bytes(bytes.try_into().ok()?)),
        };
        Some(scalar)
    }

    /// Lossy conversion used by kernels that accept any numeric scalar.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Scalar::I8(v) => v as f64,
            Scalar::U8(v) => v as f64,
            Scalar::I16(v) => v as f64,
            Scalar::U16(v) => v as f64,
            Scalar::I32(v) => v as f64,
            Scalar::U32(v) => v as f64,
            Scalar::I64(v) => v as f64,
            Scalar::U64(v) => v as f64,
            Scalar::F32(v) => v as f64,
            Scalar::F64(v) => v,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::I8(v) => write!(f, "{v}"),
            Scalar::U8(v) => write!(f, "{v}"),
            Scalar::I16(v) => write!(f, "{v}"),
            Scalar::U16(v) => write!(f, "{v}"),
            Scalar::I32(v) => write!(f, "{v}"),
            Scalar::U32(v) => write!(f, "{v}"),
            Scalar::I64(v) => write!(f, "{v}"),
            Scalar::U64(v) => write!(f, "{v}"),
            Scalar::F32(v) => write!(f, "{v}"),
            Scalar::F64(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! impl_scalar_from {
    ($($t:ty => $v:ident),* $(,)?) => {
        $(impl From<$t> for Scalar {
            fn from(v: $t) -> Self {
                Scalar::$v(v)
            }
        })*
    };
}

impl_scalar_from!(
    i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32,
    u32 => U32, i64 => I64, u64 => U64, f32 => F32, f64 => F64,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(ElementType::U8.size(), 1);
        assert_eq!(ElementType::I16.size(), 2);
        assert_eq!(ElementType::F32.size(), 4);
        assert_eq!(ElementType::F64.size(), 8);
        assert_eq!(<f32 as Element>::TYPE, ElementType::F32);
        assert_eq!(<u64 as Element>::TYPE, ElementType::U64);
    }

    #[test]
    fn test_tags_are_unique() {
        for ty in ElementType::ALL {
            assert_eq!(ElementType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(ElementType::from_tag(0), None);
        assert_eq!(ElementType::from_tag(99), None);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("float".parse::<ElementType>().unwrap(), ElementType::F32);
        assert_eq!("Double".parse::<ElementType>().unwrap(), ElementType::F64);
        assert_eq!("uchar".parse::<ElementType>().unwrap(), ElementType::U8);
        assert!("quad".parse::<ElementType>().is_err());
    }

    #[test]
    fn test_scalar_bytes() {
        let s = Scalar::from(1.5f32);
        assert_eq!(s.element_type(), ElementType::F32);
        let bytes = s.to_ne_bytes();
        assert_eq!(bytes.len(), 4);
        assert_eq!(Scalar::from_ne_bytes(ElementType::F32, &bytes), Some(s));
        assert_eq!(Scalar::from_ne_bytes(ElementType::F64, &bytes), None);
    }

    #[test]
    fn test_scalar_display() {
        assert_eq!(Scalar::I32(4).to_string(), "4");
        assert_eq!(Scalar::F64(0.5).to_string(), "0.5");
    }
}
