//! Platform and device enumeration.

use crate::driver::{info_string, DeviceId, DeviceType, Driver, PlatformId};
use crate::error::{Result, StatusExt};
use crate::status::Status;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Most platforms returned by one enumeration.
pub const MAX_PLATFORMS: usize = 10;

/// Most devices returned per platform by one enumeration.
pub const MAX_DEVICES: usize = 16;

/// An enumerated OpenCL platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    id: PlatformId,
    name: String,
}

impl Platform {
    pub fn id(&self) -> PlatformId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An enumerated device and its parent platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    id: DeviceId,
    platform: PlatformId,
    name: String,
    device_type: DeviceType,
}

impl Device {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn platform(&self) -> PlatformId {
        self.platform
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Stateless enumeration queries over a driver.
///
/// Nothing is cached: every call re-queries the driver.
#[derive(Clone)]
pub struct DeviceRegistry {
    driver: Arc<dyn Driver>,
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("backend", &self.driver.backend_name())
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// All platforms, up to [`MAX_PLATFORMS`]. A loader without platforms
    /// yields an empty list.
    pub fn platforms(&self) -> Result<Vec<Platform>> {
        let ids = match self.driver.platform_ids(MAX_PLATFORMS) {
            Ok(ids) => ids,
            Err(Status::PLATFORM_NOT_FOUND_KHR) => {
                debug!("no OpenCL platforms reported");
                return Ok(Vec::new());
            }
            Err(status) => return Err(status).call("clGetPlatformIDs()"),
        };

        ids.into_iter()
            .map(|id| {
                let name = info_string(
                    self.driver
                        .platform_name(id)
                        .call("clGetPlatformInfo()")?,
                );
                debug!(platform = %name, "found platform");
                Ok(Platform { id, name })
            })
            .collect()
    }

    /// First platform whose name equals `name` exactly.
    pub fn find_platform(&self, name: &str) -> Result<Option<Platform>> {
        Ok(self.platforms()?.into_iter().find(|p| p.name == name))
    }

    /// Devices of `platform` matching `device_type`, up to [`MAX_DEVICES`].
    /// No matching device yields an empty list.
    pub fn devices(&self, platform: &Platform, device_type: DeviceType) -> Result<Vec<Device>> {
        let ids = match self.driver.device_ids(platform.id, device_type, MAX_DEVICES) {
            Ok(ids) => ids,
            Err(Status::DEVICE_NOT_FOUND) => {
                debug!(platform = %platform.name, ?device_type, "no matching devices");
                return Ok(Vec::new());
            }
            Err(status) => return Err(status).call("clGetDeviceIDs()"),
        };

        ids.into_iter()
            .map(|id| {
                let name = self.device_name(id)?;
                let device_type = self.driver.device_type(id).call("clGetDeviceInfo()")?;
                info!(platform = %platform.name, device = %name, "found device");
                Ok(Device {
                    id,
                    platform: platform.id,
                    name,
                    device_type,
                })
            })
            .collect()
    }

    /// Display name of `device`, without its trailing terminator.
    pub fn device_name(&self, device: DeviceId) -> Result<String> {
        self.driver
            .device_name(device)
            .call("clGetDeviceInfo()")
            .map(info_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockCall, MockDriver};
    use crate::error::OclError;

    fn registry(mock: MockDriver) -> (Arc<MockDriver>, DeviceRegistry) {
        let mock = Arc::new(mock);
        (mock.clone(), DeviceRegistry::new(mock))
    }

    #[test]
    fn lists_platforms_and_devices() {
        let (_, reg) = registry(
            MockDriver::empty()
                .with_platform("Alpha", &[("alpha-gpu", DeviceType::GPU)])
                .with_platform(
                    "Beta",
                    &[("beta-cpu", DeviceType::CPU), ("beta-gpu", DeviceType::GPU)],
                ),
        );
        let platforms = reg.platforms().unwrap();
        let names: Vec<&str> = platforms.iter().map(Platform::name).collect();
        assert_eq!(names, ["Alpha", "Beta"]);

        let beta = &platforms[1];
        let all = reg.devices(beta, DeviceType::ALL).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|d| d.platform() == beta.id()));

        let gpus = reg.devices(beta, DeviceType::GPU).unwrap();
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].name(), "beta-gpu");
        assert_eq!(gpus[0].device_type(), DeviceType::GPU);
    }

    #[test]
    fn no_platforms_is_empty_not_error() {
        let (_, reg) = registry(MockDriver::empty());
        assert!(reg.platforms().unwrap().is_empty());
        assert_eq!(reg.find_platform("anything").unwrap(), None);
    }

    #[test]
    fn other_enumeration_errors_propagate() {
        let (mock, reg) = registry(MockDriver::new());
        mock.fail_next(MockCall::PlatformIds, Status::OUT_OF_HOST_MEMORY);
        let err = reg.platforms().unwrap_err();
        assert_eq!(
            err.to_string(),
            "clGetPlatformIDs() failed with CL_OUT_OF_HOST_MEMORY"
        );
    }

    #[test]
    fn no_matching_device_is_empty() {
        let (_, reg) = registry(MockDriver::new());
        let platform = &reg.platforms().unwrap()[0];
        assert!(reg.devices(platform, DeviceType::ACCELERATOR).unwrap().is_empty());
    }

    #[test]
    fn device_query_errors_propagate() {
        let (mock, reg) = registry(MockDriver::new());
        let platform = &reg.platforms().unwrap()[0];
        mock.fail_next(MockCall::DeviceIds, Status::INVALID_DEVICE_TYPE);
        let err = reg.devices(platform, DeviceType::GPU).unwrap_err();
        assert!(matches!(
            err,
            OclError::Api {
                call: "clGetDeviceIDs()",
                status: Status::INVALID_DEVICE_TYPE
            }
        ));
    }

    #[test]
    fn find_platform_exact_first_match() {
        let (_, reg) = registry(
            MockDriver::empty()
                .with_platform("Twin", &[("first", DeviceType::GPU)])
                .with_platform("Twin", &[("second", DeviceType::GPU)])
                .with_platform("Twin Peaks", &[("third", DeviceType::GPU)]),
        );
        let found = reg.find_platform("Twin").unwrap().unwrap();
        let devices = reg.devices(&found, DeviceType::ALL).unwrap();
        assert_eq!(devices[0].name(), "first");
        assert_eq!(reg.find_platform("twin").unwrap(), None);
        assert_eq!(reg.find_platform("Twin Peaks").unwrap().unwrap().name(), "Twin Peaks");
    }

    #[test]
    fn enumeration_is_capped() {
        let many: Vec<(String, DeviceType)> = (0..MAX_DEVICES + 4)
            .map(|i| (format!("gpu{i}"), DeviceType::GPU))
            .collect();
        let refs: Vec<(&str, DeviceType)> = many.iter().map(|(n, t)| (n.as_str(), *t)).collect();
        let mut mock = MockDriver::empty();
        for i in 0..MAX_PLATFORMS + 2 {
            mock = mock.with_platform(&format!("p{i}"), &refs);
        }
        let (_, reg) = registry(mock);
        let platforms = reg.platforms().unwrap();
        assert_eq!(platforms.len(), MAX_PLATFORMS);
        assert_eq!(reg.devices(&platforms[0], DeviceType::GPU).unwrap().len(), MAX_DEVICES);
    }

    #[test]
    fn device_name_trims_terminator() {
        let (mock, reg) = registry(MockDriver::new());
        let platform = &reg.platforms().unwrap()[0];
        let device = &reg.devices(platform, DeviceType::GPU).unwrap()[0];
        let raw = mock.device_name(device.id()).unwrap();
        assert_eq!(raw.last(), Some(&0));
        assert_eq!(reg.device_name(device.id()).unwrap(), "Mock GPU");
        assert_eq!(device.to_string(), "Mock GPU");
    }
}
