use std::ffi::CStr;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// Compute backend a device runs on.
///
/// A device's mode is fixed when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Single host thread.
    #[default]
    Serial,
    /// Host thread pool (OpenMP-style).
    OpenMP,
    /// Host thread pool (pthreads-style).
    Pthreads,
    OpenCL,
    #[serde(rename = "CUDA")]
    Cuda,
    #[serde(rename = "HIP")]
    Hip,
    Metal,
    /// Coprocessor offload.
    #[serde(rename = "COI")]
    Coi,
}

impl Mode {
    pub const ALL: [Mode; 8] = [
        Mode::Serial,
        Mode::OpenMP,
        Mode::Pthreads,
        Mode::OpenCL,
        Mode::Cuda,
        Mode::Hip,
        Mode::Metal,
        Mode::Coi,
    ];

    /// Canonical mode tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Serial => "Serial",
            Mode::OpenMP => "OpenMP",
            Mode::Pthreads => "Pthreads",
            Mode::OpenCL => "OpenCL",
            Mode::Cuda => "CUDA",
            Mode::Hip => "HIP",
            Mode::Metal => "Metal",
            Mode::Coi => "COI",
        }
    }

    /// Mode tag as a NUL-terminated string with static lifetime.
    pub fn as_c_str(&self) -> &'static CStr {
        match self {
            Mode::Serial => c"Serial",
            Mode::OpenMP => c"OpenMP",
            Mode::Pthreads => c"Pthreads",
            Mode::OpenCL => c"OpenCL",
            Mode::Cuda => c"CUDA",
            Mode::Hip => c"HIP",
            Mode::Metal => c"Metal",
            Mode::Coi => c"COI",
        }
    }

    /// Whether kernels of this mode execute on host threads.
    pub fn is_host(&self) -> bool {
        matches!(self, Mode::Serial | Mode::OpenMP | Mode::Pthreads)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| RuntimeError::UnsupportedBackend {
                mode: wanted.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("openmp".parse::<Mode>().unwrap(), Mode::OpenMP);
        assert_eq!(" CUDA ".parse::<Mode>().unwrap(), Mode::Cuda);
        assert_eq!("serial".parse::<Mode>().unwrap(), Mode::Serial);
    }

    #[test]
    fn test_unknown_mode() {
        let err = "Vulkan".parse::<Mode>().unwrap_err();
        assert!(matches!(err, RuntimeError::UnsupportedBackend { ref mode } if mode == "Vulkan"));
    }

    #[test]
    fn test_tags_roundtrip() {
        for mode in Mode::ALL {
            assert_eq!(mode.as_str().parse::<Mode>().unwrap(), mode);
            assert_eq!(mode.as_c_str().to_str().unwrap(), mode.as_str());
        }
    }

    #[test]
    fn test_host_modes() {
        assert!(Mode::Serial.is_host());
        assert!(Mode::Pthreads.is_host());
        assert!(!Mode::Cuda.is_host());
        assert_eq!(Mode::default(), Mode::Serial);
    }
}
