//! Convenience re-exports for common weft-core types.
//!
//! ```rust
//! use weft_core::prelude::*;
//! ```

pub use crate::DeviceId;
pub use crate::ElementType;
pub use crate::KernelArg;
pub use crate::KernelBuildOptions;
pub use crate::KernelId;
pub use crate::KernelSource;
pub use crate::MemoryId;
pub use crate::MemoryKind;
pub use crate::Mode;
pub use crate::Result;
pub use crate::Runtime;
pub use crate::RuntimeError;
pub use crate::WorkingDims;
