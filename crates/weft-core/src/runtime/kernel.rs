use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendArg, BuildRequest};
use crate::handle::{DeviceId, KernelId};
use crate::kernel::{KernelArg, KernelSource, WorkingDims};
use crate::mode::Mode;
use crate::options::KernelBuildOptions;
use crate::{Result, RuntimeError};

use super::{KernelRecord, Runtime};

impl Runtime {
    /// Compile `entry_point` from `source` for `device`.
    ///
    /// The options are copied before the build starts, so later changes to
    /// `options` never reach an already-built kernel. Compiler settings are
    /// the device's at the time of the call.
    pub fn build_kernel(
        &self,
        device: DeviceId,
        source: &KernelSource,
        entry_point: &str,
        options: Option<&KernelBuildOptions>,
    ) -> Result<KernelId> {
        let options = options.cloned().unwrap_or_default();
        if !source.accepts_options() && !options.is_empty() {
            tracing::debug!("build options ignored for precompiled '{}'", entry_point);
        }
        let (backend, raw_device, compiler, mode) = {
            let st = self.lock();
            let dev = st.device(device)?;
            (Arc::clone(&dev.backend), dev.raw, dev.compiler.clone(), dev.spec.mode)
        };

        if self.config.read().verbose_compilation {
            tracing::info!(
                "building '{}' ({} source) for {} [{}] compiler='{}' flags='{}' {}",
                entry_point,
                source.kind(),
                device,
                mode,
                compiler.compiler,
                compiler.flags,
                options
            );
        }

        let request = BuildRequest {
            source,
            entry_point,
            options: &options,
            compiler: &compiler,
        };
        let raw = backend
            .build_kernel(raw_device, &request)
            .map_err(|e| RuntimeError::from_backend(e, entry_point))?;
        let preferred_dim_size = match backend.preferred_dim_size(raw_device, raw) {
            Ok(n) => n,
            Err(e) => {
                let _ = backend.free_kernel(raw_device, raw);
                return Err(RuntimeError::from_backend(e, entry_point));
            }
        };

        let mut st = self.lock();
        if !st.devices.is_live(device.0) {
            let _ = backend.free_kernel(raw_device, raw);
            return Err(RuntimeError::UseAfterFree(device.to_string()));
        }
        let id = KernelId(st.kernels.acquire(KernelRecord {
            device,
            raw,
            name: entry_point.to_string(),
            preferred_dim_size,
            dims: None,
            last_run: None,
        }));
        tracing::debug!("built {} '{}' on {}", id, entry_point, device);
        Ok(id)
    }

    /// Free a kernel. Freeing twice is a no-op.
    pub fn free_kernel(&self, id: KernelId) -> Result<()> {
        let mut st = self.lock();
        let Some(k) = st.kernels.release(id.0) else {
            return Ok(());
        };
        let dev = st.device(k.device)?;
        let (backend, raw_device) = (Arc::clone(&dev.backend), dev.raw);
        drop(st);
        if let Some(run) = k.last_run {
            backend.release_run(raw_device, run);
        }
        backend
            .free_kernel(raw_device, k.raw)
            .map_err(|e| RuntimeError::from_backend(e, &id.to_string()))
    }

    pub fn kernel_name(&self, id: KernelId) -> Result<String> {
        Ok(self.lock().kernel(id)?.name.clone())
    }

    pub fn kernel_device(&self, id: KernelId) -> Result<DeviceId> {
        Ok(self.lock().kernel(id)?.device)
    }

    pub fn kernel_mode(&self, id: KernelId) -> Result<Mode> {
        let st = self.lock();
        let device = st.kernel(id)?.device;
        Ok(st.device(device)?.spec.mode)
    }

    pub fn preferred_dim_size(&self, id: KernelId) -> Result<u32> {
        Ok(self.lock().kernel(id)?.preferred_dim_size)
    }

    pub fn set_working_dims(&self, id: KernelId, dims: WorkingDims) -> Result<()> {
        self.lock().kernel_mut(id)?.dims = Some(dims);
        Ok(())
    }

    /// The configured launch geometry, or the backend's default when none
    /// was set.
    pub fn working_dims(&self, id: KernelId) -> Result<WorkingDims> {
        let st = self.lock();
        let k = st.kernel(id)?;
        if let Some(dims) = k.dims {
            return Ok(dims);
        }
        let dev = st.device(k.device)?;
        dev.backend
            .default_dims(dev.raw, k.raw)
            .map_err(|e| RuntimeError::from_backend(e, &id.to_string()))
    }

    /// Enqueue one launch on the device's current stream and return without
    /// waiting for it.
    ///
    /// Every argument is resolved and checked before anything is submitted:
    /// a freed buffer, a buffer from another device or a kind the backend
    /// cannot marshal fails the whole call with nothing enqueued.
    pub fn run(&self, id: KernelId, args: &[KernelArg]) -> Result<()> {
        let mut st = self.lock();
        let k = st.kernel(id)?;
        let device = k.device;
        let (raw_kernel, dims) = (k.raw, k.dims);
        let (backend, raw_device, raw_stream) = st.submit_target(device)?;

        let mut resolved = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let kind = arg.kind();
            if !backend.accepts_argument(kind) {
                return Err(RuntimeError::UnsupportedArgumentType {
                    index,
                    kind: kind.to_string(),
                });
            }
            resolved.push(match arg {
                KernelArg::Memory(m) => {
                    let mem = st.memory(*m)?;
                    if mem.device != device {
                        return Err(RuntimeError::DeviceMismatch {
                            resource: format!("argument {index} ({m})"),
                            expected: device.to_string(),
                            found: mem.device.to_string(),
                        });
                    }
                    BackendArg::Memory {
                        raw: mem.raw,
                        bytes: mem.size,
                    }
                }
                KernelArg::Scalar(s) => BackendArg::Scalar(*s),
                KernelArg::Pointer(p) => BackendArg::Pointer(*p),
                KernelArg::Str(s) => BackendArg::Str(s.clone()),
            });
        }

        let dims = match dims {
            Some(d) => d,
            None => backend
                .default_dims(raw_device, raw_kernel)
                .map_err(|e| RuntimeError::from_backend(e, &id.to_string()))?,
        };
        let run = backend
            .run_kernel(raw_device, raw_stream, raw_kernel, &dims, &resolved)
            .map_err(|e| RuntimeError::from_backend(e, &id.to_string()))?;

        if let Some(previous) = st.kernel_mut(id)?.last_run.replace(run) {
            backend.release_run(raw_device, previous);
        }
        Ok(())
    }

    /// Execution time of the most recent run. Fails with
    /// [`RuntimeError::ResultNotReady`] before the run has completed or if the
    /// kernel has never run.
    pub fn time_taken(&self, id: KernelId) -> Result<Duration> {
        let (backend, raw_device, run) = {
            let st = self.lock();
            let k = st.kernel(id)?;
            let run = k
                .last_run
                .ok_or_else(|| RuntimeError::ResultNotReady(format!("{id} has not been run")))?;
            let dev = st.device(k.device)?;
            (Arc::clone(&dev.backend), dev.raw, run)
        };
        backend
            .run_elapsed(raw_device, run)
            .map_err(|e| RuntimeError::from_backend(e, &format!("last run of {id}")))
    }
}
