//! Device-less entry points that act on the runtime's background device.

use crate::dtype::{Element, ElementType};
use crate::handle::{DeviceId, KernelId, MemoryId, StreamId};
use crate::kernel::KernelSource;
use crate::options::KernelBuildOptions;
use crate::Result;

use super::Runtime;

/// A view of the runtime's background device. The device is created from
/// [`crate::RuntimeConfig::default_device`] on first use and can be replaced
/// with [`Background::set_device`].
#[derive(Clone, Copy)]
pub struct Background<'a> {
    rt: &'a Runtime,
}

impl Runtime {
    pub fn background(&self) -> Background<'_> {
        Background { rt: self }
    }
}

impl<'a> Background<'a> {
    /// The background device, created lazily.
    pub fn device(&self) -> Result<DeviceId> {
        if let Some(id) = self.current_device() {
            return Ok(id);
        }
        let spec = self.rt.config.read().default_device;
        let created = self.rt.create_device(spec.mode, spec.platform_id, spec.device_id)?;

        let mut st = self.rt.lock();
        match st.background.filter(|id| st.devices.is_live(id.0)) {
            Some(existing) => {
                // Another thread got there first.
                drop(st);
                self.rt.free_device(created)?;
                Ok(existing)
            }
            None => {
                st.background = Some(created);
                tracing::debug!("background device is {} ({})", created, spec);
                Ok(created)
            }
        }
    }

    /// The background device if one is set and still live.
    pub fn current_device(&self) -> Option<DeviceId> {
        let st = self.rt.lock();
        st.background.filter(|id| st.devices.is_live(id.0))
    }

    pub fn set_device(&self, device: DeviceId) -> Result<()> {
        let mut st = self.rt.lock();
        st.device(device)?;
        st.background = Some(device);
        Ok(())
    }

    /// Create a device from an info string and make it the background device.
    pub fn set_device_from_info(&self, info: &str) -> Result<DeviceId> {
        let device = self.rt.create_device_from_info(info)?;
        self.set_device(device)?;
        Ok(device)
    }

    pub fn set_compiler(&self, compiler: &str) -> Result<()> {
        self.rt.set_compiler(self.device()?, compiler)
    }

    pub fn set_compiler_flags(&self, flags: &str) -> Result<()> {
        self.rt.set_compiler_flags(self.device()?, flags)
    }

    pub fn set_compiler_env_script(&self, script: &str) -> Result<()> {
        self.rt.set_compiler_env_script(self.device()?, script)
    }

    pub fn flush(&self) -> Result<()> {
        self.rt.flush(self.device()?)
    }

    pub fn finish(&self) -> Result<()> {
        self.rt.finish(self.device()?)
    }

    pub fn create_stream(&self) -> Result<StreamId> {
        self.rt.create_stream(self.device()?)
    }

    pub fn stream(&self) -> Result<StreamId> {
        self.rt.current_stream(self.device()?)
    }

    pub fn set_stream(&self, stream: StreamId) -> Result<()> {
        self.rt.set_stream(self.device()?, stream)
    }

    pub fn malloc(&self, element: ElementType, count: u64) -> Result<MemoryId> {
        self.rt.malloc(self.device()?, element, count)
    }

    pub fn malloc_with<T: Element>(&self, data: &[T]) -> Result<MemoryId> {
        self.rt.malloc_with(self.device()?, data)
    }

    pub fn build_kernel(
        &self,
        source: &KernelSource,
        entry_point: &str,
        options: Option<&KernelBuildOptions>,
    ) -> Result<KernelId> {
        self.rt.build_kernel(self.device()?, source, entry_point, options)
    }
}
