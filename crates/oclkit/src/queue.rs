//! In-order command queues.

use crate::context::Context;
use crate::device::Device;
use crate::driver::{Driver, QueueProperties, RawQueue};
use crate::error::{Result, StatusExt};
use crate::handle::Owned;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// An execution stream bound to one device of a context.
///
/// Commands submitted to the same queue run in submission order. There is
/// no ordering between different queues.
pub struct CommandQueue {
    context: Context,
    device: Device,
    properties: QueueProperties,
    handle: Owned<RawQueue>,
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("device", &self.device.name())
            .field("properties", &self.properties)
            .finish()
    }
}

impl CommandQueue {
    /// Open a queue on `device`. A device outside the context is rejected
    /// by the driver.
    pub fn create(context: &Context, device: &Device, properties: QueueProperties) -> Result<Self> {
        let raw = context
            .driver()
            .create_command_queue(context.raw()?, device.id(), properties)
            .call("clCreateCommandQueue()")?;
        debug!(device = %device.name(), ?properties, "command queue created");
        Ok(Self {
            context: context.clone(),
            device: device.clone(),
            properties,
            handle: Owned::new(context.driver().clone(), raw),
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn properties(&self) -> QueueProperties {
        self.properties
    }

    /// Submit all queued commands to the device.
    pub fn flush(&self) -> Result<()> {
        self.driver().flush(self.raw()).call("clFlush()")
    }

    /// Block until every queued command has completed.
    pub fn finish(&self) -> Result<()> {
        self.driver().finish(self.raw()).call("clFinish()")
    }

    pub(crate) fn raw(&self) -> RawQueue {
        self.handle.get()
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        self.handle.driver()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRegistry;
    use crate::driver::mock::{MockCall, MockDriver};
    use crate::driver::DeviceType;
    use crate::error::OclError;
    use crate::status::Status;

    fn context(mock: &Arc<MockDriver>) -> (Context, Vec<Device>) {
        let reg = DeviceRegistry::new(mock.clone());
        let platform = reg.platforms().unwrap().remove(0);
        let devices = reg.devices(&platform, DeviceType::ALL).unwrap();
        let ctx = Context::create(mock.clone(), &platform, &devices[..1]).unwrap();
        (ctx, devices)
    }

    fn two_device_mock() -> Arc<MockDriver> {
        Arc::new(MockDriver::empty().with_platform(
            "P",
            &[("in-context", DeviceType::GPU), ("outside", DeviceType::GPU)],
        ))
    }

    #[test]
    fn queue_lifecycle() {
        let mock = two_device_mock();
        let (ctx, devices) = context(&mock);
        let queue = ctx.create_command_queue(&devices[0]).unwrap();
        assert_eq!(queue.device().name(), "in-context");
        assert!(queue.context().same_as(&ctx));
        queue.flush().unwrap();
        queue.finish().unwrap();
        assert_eq!(mock.stats().queues_created, 1);
        drop(queue);
        assert_eq!(mock.stats().queues_released, 1);
    }

    #[test]
    fn device_outside_context_is_rejected() {
        let mock = two_device_mock();
        let (ctx, devices) = context(&mock);
        let err = ctx.create_command_queue(&devices[1]).unwrap_err();
        assert!(matches!(
            err,
            OclError::Api {
                call: "clCreateCommandQueue()",
                status: Status::INVALID_DEVICE
            }
        ));
    }

    #[test]
    fn released_context_cannot_open_queues() {
        let mock = two_device_mock();
        let (ctx, devices) = context(&mock);
        ctx.release().unwrap();
        let err = ctx.create_command_queue(&devices[0]).unwrap_err();
        assert!(matches!(err, OclError::ContextReleased));
    }

    #[test]
    fn finish_failure_is_reported() {
        let mock = two_device_mock();
        let (ctx, _) = context(&mock);
        let queue = ctx.create_command_queue_at(0).unwrap();
        mock.fail_next(MockCall::Finish, Status::OUT_OF_RESOURCES);
        assert_eq!(
            queue.finish().unwrap_err().to_string(),
            "clFinish() failed with CL_OUT_OF_RESOURCES"
        );
    }

    #[test]
    fn profiling_properties_are_kept() {
        let mock = two_device_mock();
        let (ctx, devices) = context(&mock);
        let queue = ctx
            .create_command_queue_with(&devices[0], QueueProperties::PROFILING)
            .unwrap();
        assert_eq!(queue.properties(), QueueProperties::PROFILING);
    }
}
