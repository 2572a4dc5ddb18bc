//! # weft-core
//!
//! Runtime core for dispatching work to heterogeneous compute backends.
//!
//! Provides:
//! - Generation-tagged handles for devices, streams, buffers and kernels
//! - A [`Backend`] trait that concrete CPU/GPU runtimes implement
//! - [`Runtime`]: device lifecycle, per-device current streams, bounds-checked
//!   transfers, kernel builds and launches
//! - A background device for device-less entry points
//! - JSON/env configuration

pub mod backend;
pub mod config;
pub mod dtype;
pub mod error;
pub mod handle;
pub mod kernel;
pub mod mode;
pub mod options;
pub mod prelude;
pub mod runtime;

pub use backend::{Backend, BackendResult, MemoryKind, RawHandle};
pub use config::{CrossDevicePolicy, DeviceSpec, RuntimeConfig};
pub use dtype::{Element, ElementType, Scalar};
pub use error::{BackendError, RuntimeError};
pub use handle::{DeviceId, Handle, HandlePool, KernelId, MemoryId, StreamId, TransferId};
pub use kernel::{ArgKind, Dim, KernelArg, KernelSource, TaggedPtr, WorkingDims};
pub use mode::Mode;
pub use options::KernelBuildOptions;
pub use runtime::{AvailableDevice, Background, DeviceInfo, Runtime, Tag};

pub type Result<T> = std::result::Result<T, RuntimeError>;
