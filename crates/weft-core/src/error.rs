use crate::mode::Mode;

/// Failures reported by a backend collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("mode {0} is not supported by this backend")]
    UnsupportedMode(Mode),

    #[error("out of device memory allocating {bytes} bytes")]
    OutOfMemory { bytes: u64 },

    #[error("kernel compilation failed:\n{diagnostics}")]
    Compile { diagnostics: String },

    #[error("unknown backend handle {0}")]
    InvalidHandle(u64),

    #[error("argument {index} of kind {kind} is not supported")]
    UnsupportedArgument { index: usize, kind: String },

    #[error("result not ready")]
    NotReady,

    #[error("kernel execution failed: {0}")]
    Execution(String),

    #[error("backend error: {0}")]
    Other(String),
}

/// Errors surfaced by the [`crate::Runtime`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("unsupported backend mode '{mode}'")]
    UnsupportedBackend { mode: String },

    #[error("allocation of {bytes} bytes failed: {reason}")]
    AllocationFailure { bytes: u64, reason: String },

    #[error("kernel build failed:\n{diagnostics}")]
    CompileError { diagnostics: String },

    #[error("transfer out of bounds: offset {offset} + {bytes} bytes exceeds buffer of {size} bytes")]
    OutOfBounds { offset: u64, bytes: u64, size: u64 },

    #[error("copy between buffers on different devices ({src} -> {dst})")]
    CrossDeviceCopy { src: String, dst: String },

    #[error("argument {index} has unsupported type: {kind}")]
    UnsupportedArgumentType { index: usize, kind: String },

    #[error("result not ready: {0}")]
    ResultNotReady(String),

    #[error("use of freed {0}")]
    UseAfterFree(String),

    #[error("{resource} belongs to {found}, expected {expected}")]
    DeviceMismatch {
        resource: String,
        expected: String,
        found: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error(transparent)]
    Backend(BackendError),
}

impl RuntimeError {
    /// Programming errors that callers are not expected to recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::UseAfterFree(_) | RuntimeError::Internal(_))
    }

    /// Map a backend failure onto the runtime taxonomy.
    ///
    /// `context` names the resource involved and is used for messages that
    /// need one (stale handles, allocation sizes).
    pub(crate) fn from_backend(err: BackendError, context: &str) -> Self {
        match err {
            BackendError::UnsupportedMode(mode) => RuntimeError::UnsupportedBackend {
                mode: mode.to_string(),
            },
            BackendError::OutOfMemory { bytes } => RuntimeError::AllocationFailure {
                bytes,
                reason: "backend out of memory".to_string(),
            },
            BackendError::Compile { diagnostics } => RuntimeError::CompileError { diagnostics },
            BackendError::InvalidHandle(_) => RuntimeError::UseAfterFree(context.to_string()),
            BackendError::UnsupportedArgument { index, kind } => {
                RuntimeError::UnsupportedArgumentType { index, kind }
            }
            BackendError::NotReady => RuntimeError::ResultNotReady(context.to_string()),
            other => RuntimeError::Backend(other),
        }
    }
}

impl From<BackendError> for RuntimeError {
    fn from(err: BackendError) -> Self {
        RuntimeError::from_backend(err, "backend resource")
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Config(err.to_string())
    }
}
