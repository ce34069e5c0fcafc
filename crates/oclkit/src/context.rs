//! Device contexts.

use crate::config::OclConfig;
use crate::device::{Device, DeviceRegistry, Platform};
use crate::driver::{DeviceId, Driver, QueueProperties, RawContext};
use crate::error::{OclError, Result, StatusExt};
use crate::handle::Owned;
use crate::queue::CommandQueue;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// A live binding of one platform to a non-empty device set.
///
/// Cloning is cheap and shares the binding. Buffers, programs, kernels and
/// queues keep a clone, so the underlying context outlives them unless it
/// is released explicitly with [`Context::release`]; after that every
/// operation needing the context fails with [`OclError::ContextReleased`].
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    driver: Arc<dyn Driver>,
    platform: Platform,
    devices: Vec<Device>,
    queue_properties: QueueProperties,
    handle: Mutex<Option<Owned<RawContext>>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.inner.driver.backend_name())
            .field("platform", &self.inner.platform.name())
            .field("devices", &self.inner.devices.len())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Context {
    /// Create a context over `devices`, all of which must belong to
    /// `platform`.
    pub fn create(driver: Arc<dyn Driver>, platform: &Platform, devices: &[Device]) -> Result<Self> {
        Self::create_with(driver, platform, devices, QueueProperties::empty())
    }

    fn create_with(
        driver: Arc<dyn Driver>,
        platform: &Platform,
        devices: &[Device],
        queue_properties: QueueProperties,
    ) -> Result<Self> {
        if devices.is_empty() {
            return Err(OclError::InvalidArgument(
                "a context needs at least one device".into(),
            ));
        }
        if let Some(stranger) = devices.iter().find(|d| d.platform() != platform.id()) {
            return Err(OclError::InvalidArgument(format!(
                "device '{}' does not belong to platform '{}'",
                stranger.name(),
                platform.name()
            )));
        }

        let ids: Vec<DeviceId> = devices.iter().map(Device::id).collect();
        let raw = driver
            .create_context(platform.id(), &ids)
            .call("clCreateContext()")?;
        info!(
            platform = %platform.name(),
            devices = devices.len(),
            backend = driver.backend_name(),
            "context created"
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                handle: Mutex::new(Some(Owned::new(driver.clone(), raw))),
                driver,
                platform: platform.clone(),
                devices: devices.to_vec(),
                queue_properties,
            }),
        })
    }

    /// Open a context as described by `config`.
    ///
    /// The platform is looked up by name; an empty or unknown name falls
    /// back to the first platform. All devices of the configured type on
    /// that platform join the context.
    pub fn open(driver: Arc<dyn Driver>, config: &OclConfig) -> Result<Self> {
        let registry = DeviceRegistry::new(driver.clone());
        let mut platforms = registry.platforms()?;
        if platforms.is_empty() {
            return Err(OclError::NoPlatform);
        }

        let index = platforms
            .iter()
            .position(|p| p.name() == config.platform_name)
            .unwrap_or_else(|| {
                if !config.platform_name.is_empty() {
                    warn!(
                        requested = %config.platform_name,
                        using = %platforms[0].name(),
                        "platform not found, falling back to the first platform"
                    );
                }
                0
            });
        let platform = platforms.swap_remove(index);

        let devices = registry.devices(&platform, config.device_type.device_type())?;
        if devices.is_empty() {
            return Err(OclError::NoSuchDevice(format!(
                "no {} device on platform '{}'",
                config.device_type,
                platform.name()
            )));
        }

        let queue_properties = if config.queue_profiling {
            QueueProperties::PROFILING
        } else {
            QueueProperties::empty()
        };
        Self::create_with(driver, &platform, &devices, queue_properties)
    }

    /// Release the context now. Releasing twice is a no-op; a failing
    /// release of a live context is returned.
    pub fn release(&self) -> Result<()> {
        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                handle.release()?;
                debug!(platform = %self.inner.platform.name(), "context released");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub(crate) fn raw(&self) -> Result<RawContext> {
        self.inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Owned::get)
            .ok_or(OclError::ContextReleased)
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    pub fn platform(&self) -> &Platform {
        &self.inner.platform
    }

    pub fn devices(&self) -> &[Device] {
        &self.inner.devices
    }

    pub fn device(&self, index: usize) -> Result<&Device> {
        self.inner.devices.get(index).ok_or_else(|| {
            OclError::NoSuchDevice(format!(
                "index {index} out of range ({} devices in context)",
                self.inner.devices.len()
            ))
        })
    }

    pub fn device_name(&self, index: usize) -> Result<&str> {
        self.device(index).map(Device::name)
    }

    pub fn contains_device(&self, device: DeviceId) -> bool {
        self.inner.devices.iter().any(|d| d.id() == device)
    }

    /// Properties applied by [`Context::create_command_queue`].
    pub fn queue_properties(&self) -> QueueProperties {
        self.inner.queue_properties
    }

    /// Whether both handles refer to the same context.
    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn create_command_queue(&self, device: &Device) -> Result<CommandQueue> {
        CommandQueue::create(self, device, self.inner.queue_properties)
    }

    pub fn create_command_queue_with(
        &self,
        device: &Device,
        properties: QueueProperties,
    ) -> Result<CommandQueue> {
        CommandQueue::create(self, device, properties)
    }

    /// Queue on the context's `index`-th device.
    pub fn create_command_queue_at(&self, index: usize) -> Result<CommandQueue> {
        let device = self.device(index)?.clone();
        self.create_command_queue(&device)
    }
}
