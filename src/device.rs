//! Metal device discovery and capability queries.
//!
//! The device is an explicit value threaded through every call; there is no
//! process-wide default hidden behind a singleton.

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_metal::{MTLCreateSystemDefaultDevice, MTLDevice, MTLGPUFamily};

use crate::caps::{DeviceInfo, GpuFamily};
use crate::error::{BridgeError, Result};

/// A GPU execution context plus its static capabilities.
#[derive(Clone)]
pub struct Device {
    device: Retained<ProtocolObject<dyn MTLDevice>>,
    info: DeviceInfo,
}

// SAFETY: MTLDevice is documented by Apple as safe to share across threads.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl Device {
    /// Acquire the system default Metal device.
    pub fn system_default() -> Result<Self> {
        let device = MTLCreateSystemDefaultDevice().ok_or(BridgeError::DeviceUnavailable)?;
        let info = Self::query_info(&device);
        log::debug!(
            "discovered Metal device '{}' (registry {:#x})",
            info.name,
            info.registry_id
        );
        Ok(Self { device, info })
    }

    /// Acquire the system default device or stop the process.
    ///
    /// Nothing downstream is meaningful without a device, so this is the one
    /// unrecoverable path in the bridge.
    ///
    /// # Panics
    /// Panics if no Metal device is available.
    pub fn discover_default() -> Self {
        match Self::system_default() {
            Ok(device) => device,
            Err(e) => panic!("Failed to get default Metal device: {e}"),
        }
    }

    /// Whether any Metal device exists on this machine.
    pub fn is_available() -> bool {
        MTLCreateSystemDefaultDevice().is_some()
    }

    #[allow(unused_unsafe)]
    fn query_info(device: &ProtocolObject<dyn MTLDevice>) -> DeviceInfo {
        let max_threads = device.maxThreadsPerThreadgroup();
        // SAFETY: plain property reads on a live device.
        let (registry_id, is_headless, is_low_power, is_removable) = unsafe {
            (
                device.registryID(),
                device.isHeadless(),
                device.isLowPower(),
                device.isRemovable(),
            )
        };
        DeviceInfo {
            name: device.name().to_string(),
            registry_id,
            is_headless,
            is_low_power,
            is_removable,
            max_buffer_length: device.maxBufferLength() as usize,
            max_threads_per_threadgroup: max_threads.width as usize,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Stable identity used to key pipeline caches.
    pub fn registry_id(&self) -> u64 {
        self.info.registry_id
    }

    pub fn max_buffer_length(&self) -> usize {
        self.info.max_buffer_length
    }

    #[allow(unused_unsafe)]
    pub fn supports_family(&self, family: GpuFamily) -> bool {
        // SAFETY: capability query with a family code Metal defines.
        unsafe {
            self.device
                .supportsFamily(MTLGPUFamily(family.code() as isize))
        }
    }

    /// Bytes currently allocated on this device by the whole process.
    pub fn current_allocated_size(&self) -> usize {
        self.device.currentAllocatedSize() as usize
    }

    pub(crate) fn raw(&self) -> &ProtocolObject<dyn MTLDevice> {
        &self.device
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.info.name)
            .field("registry_id", &self.info.registry_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_discovery() {
        if !Device::is_available() {
            println!("Metal not available, skipping test");
            return;
        }
        let device = Device::system_default().expect("default device");
        assert!(!device.name().is_empty(), "Device name should not be empty");
        assert!(device.max_buffer_length() > 0);
        assert!(device.info().max_threads_per_threadgroup >= 256);
    }

    #[test]
    fn test_registry_id_is_stable() {
        if !Device::is_available() {
            return;
        }
        let a = Device::discover_default();
        let b = Device::discover_default();
        assert_eq!(a.registry_id(), b.registry_id());
    }

    #[test]
    fn test_supports_common_family() {
        if !Device::is_available() {
            return;
        }
        let device = Device::discover_default();
        assert!(
            device.supports_family(GpuFamily::Common1),
            "every Metal device supports Common1"
        );
    }
}
