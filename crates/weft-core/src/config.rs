//! Runtime configuration.
//!
//! Loaded from JSON and optionally overridden from the environment:
//!
//! | Variable | Effect |
//! |---|---|
//! | `WEFT_DEVICE` | background device info string |
//! | `WEFT_COMPILER` | default compiler for new devices |
//! | `WEFT_COMPILER_FLAGS` | default compiler flags |
//! | `WEFT_VERBOSE_COMPILATION` | `1`/`true` logs every kernel build |

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::mode::Mode;
use crate::{Result, RuntimeError};

/// What to do when a copy spans buffers on two different devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossDevicePolicy {
    /// Fail with [`RuntimeError::CrossDeviceCopy`].
    #[default]
    Reject,
    /// Read the source to host memory, then write it to the destination.
    StageThroughHost,
}

/// Which backend instance a device is created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub mode: Mode,
    #[serde(default)]
    pub platform_id: i32,
    #[serde(default)]
    pub device_id: i32,
}

impl DeviceSpec {
    pub fn new(mode: Mode, platform_id: i32, device_id: i32) -> Self {
        Self {
            mode,
            platform_id,
            device_id,
        }
    }

    /// Parse a device info string such as
    /// `"mode = OpenMP, platformID = 0, deviceID = 1"`.
    ///
    /// Keys are case-insensitive; `platform`/`device` are accepted as short
    /// forms. Unknown keys are ignored.
    pub fn parse(info: &str) -> Result<Self> {
        let mut mode = None;
        let mut platform_id = 0;
        let mut device_id = 0;

        for part in info.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .or_else(|| part.split_once(':'))
                .ok_or_else(|| {
                    RuntimeError::InvalidArgument(format!("malformed device info entry '{part}'"))
                })?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            match key.as_str() {
                "mode" => mode = Some(value.parse::<Mode>()?),
                "platformid" | "platform" => platform_id = parse_id(&key, value)?,
                "deviceid" | "device" => device_id = parse_id(&key, value)?,
                _ => tracing::debug!("ignoring device info key '{}'", key),
            }
        }

        let mode = mode.ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("device info '{info}' does not name a mode"))
        })?;
        Ok(Self::new(mode, platform_id, device_id))
    }
}

fn parse_id(key: &str, value: &str) -> Result<i32> {
    value
        .parse()
        .map_err(|_| RuntimeError::InvalidArgument(format!("{key} must be an integer, got '{value}'")))
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self::new(Mode::Serial, 0, 0)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mode = {}, platformID = {}, deviceID = {}",
            self.mode, self.platform_id, self.device_id
        )
    }
}

/// Process-level runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Device created on first use of the background context.
    pub default_device: DeviceSpec,
    /// Log every kernel build at info level.
    pub verbose_compilation: bool,
    pub cross_device_policy: CrossDevicePolicy,
    /// Defaults copied into every new device.
    pub compiler: Option<String>,
    pub compiler_flags: Option<String>,
    pub compiler_env_script: Option<String>,
    /// Shared libraries implementing the external runtime ABI.
    pub backend_libraries: Vec<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_device: DeviceSpec::default(),
            verbose_compilation: false,
            cross_device_policy: CrossDevicePolicy::Reject,
            compiler: None,
            compiler_flags: None,
            compiler_env_script: None,
            backend_libraries: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Apply `WEFT_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(info) = get("WEFT_DEVICE") {
            self.default_device = DeviceSpec::parse(&info)?;
        }
        if let Some(compiler) = get("WEFT_COMPILER") {
            self.compiler = Some(compiler);
        }
        if let Some(flags) = get("WEFT_COMPILER_FLAGS") {
            self.compiler_flags = Some(flags);
        }
        if let Some(verbose) = get("WEFT_VERBOSE_COMPILATION") {
            self.verbose_compilation = matches!(
                verbose.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        Ok(())
    }
}
