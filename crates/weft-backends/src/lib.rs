//! # weft-backends
//!
//! Concrete [`weft_core::Backend`] implementations:
//! - [`HostBackend`]: Serial / OpenMP / Pthreads modes on host threads
//! - [`DylibBackend`]: an external device runtime loaded through `libloading`
//!
//! [`default_runtime`] and [`runtime`] wire them into a [`Runtime`].

pub mod dylib;
pub mod host;

use std::sync::Arc;

use weft_core::{Runtime, RuntimeConfig};

pub use dylib::DylibBackend;
pub use host::{HostBackend, HostStats, KernelContext, KernelRegistry};

/// Environment variable naming a JSON [`RuntimeConfig`] file.
pub const CONFIG_ENV: &str = "WEFT_CONFIG";

/// A runtime with the host backend plus every loadable library listed in
/// `config.backend_libraries`. Libraries that fail to load are skipped.
pub fn default_runtime(config: RuntimeConfig) -> Runtime {
    let libraries = config.backend_libraries.clone();
    let mut rt = Runtime::new(config).with_backend(Arc::new(HostBackend::new()));
    for path in libraries {
        match DylibBackend::load(&path) {
            Ok(backend) => rt = rt.with_backend(Arc::new(backend)),
            Err(e) => tracing::warn!("skipping device runtime {}: {}", path.display(), e),
        }
    }
    rt
}

/// Configuration from `WEFT_CONFIG` (if set) with `WEFT_*` overrides applied.
/// Problems are logged and the defaults used instead.
pub fn config_from_env() -> RuntimeConfig {
    let mut config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => RuntimeConfig::from_json_file(std::path::Path::new(&path)).unwrap_or_else(|e| {
            tracing::warn!("ignoring {}: {}", CONFIG_ENV, e);
            RuntimeConfig::default()
        }),
        None => RuntimeConfig::default(),
    };
    if let Err(e) = config.apply_env() {
        tracing::warn!("ignoring environment overrides: {}", e);
    }
    config
}

/// The process-wide runtime, built from [`config_from_env`] on first use.
pub fn runtime() -> &'static Runtime {
    Runtime::global_or_init(|| default_runtime(config_from_env()))
}
