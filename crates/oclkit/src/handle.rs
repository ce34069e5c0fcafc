//! Move-only ownership of driver handles.
//!
//! An [`Owned`] handle is released exactly once: either explicitly through
//! [`Owned::release`], which reports the driver status, or on drop, where a
//! failing release can only be logged.

use crate::driver::{Driver, DriverResult, RawContext, RawKernel, RawMem, RawProgram, RawQueue};
use crate::error::{Result, StatusExt};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A handle kind with a matching release call.
pub(crate) trait Release: Copy + fmt::Debug {
    const RELEASE_CALL: &'static str;

    fn release_with(self, driver: &dyn Driver) -> DriverResult<()>;
}

impl Release for RawContext {
    const RELEASE_CALL: &'static str = "clReleaseContext()";

    fn release_with(self, driver: &dyn Driver) -> DriverResult<()> {
        driver.release_context(self)
    }
}

impl Release for RawQueue {
    const RELEASE_CALL: &'static str = "clReleaseCommandQueue()";

    fn release_with(self, driver: &dyn Driver) -> DriverResult<()> {
        driver.release_command_queue(self)
    }
}

impl Release for RawMem {
    const RELEASE_CALL: &'static str = "clReleaseMemObject()";

    fn release_with(self, driver: &dyn Driver) -> DriverResult<()> {
        driver.release_buffer(self)
    }
}

impl Release for RawProgram {
    const RELEASE_CALL: &'static str = "clReleaseProgram()";

    fn release_with(self, driver: &dyn Driver) -> DriverResult<()> {
        driver.release_program(self)
    }
}

impl Release for RawKernel {
    const RELEASE_CALL: &'static str = "clReleaseKernel()";

    fn release_with(self, driver: &dyn Driver) -> DriverResult<()> {
        driver.release_kernel(self)
    }
}

/// Owning wrapper for one driver handle.
pub(crate) struct Owned<H: Release> {
    driver: Arc<dyn Driver>,
    handle: H,
    live: bool,
}

impl<H: Release> Owned<H> {
    pub(crate) fn new(driver: Arc<dyn Driver>, handle: H) -> Self {
        Self {
            driver,
            handle,
            live: true,
        }
    }

    pub(crate) fn get(&self) -> H {
        self.handle
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Release now, propagating a failing status.
    pub(crate) fn release(mut self) -> Result<()> {
        self.live = false;
        self.handle
            .release_with(self.driver.as_ref())
            .call(H::RELEASE_CALL)
    }
}

impl<H: Release> Drop for Owned<H> {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        let h = self.handle;
        match h.release_with(self.driver.as_ref()) {
            Ok(()) => debug!(handle = ?h, "released"),
            Err(status) => warn!(
                handle = ?h,
                call = H::RELEASE_CALL,
                %status,
                "release on drop failed"
            ),
        }
    }
}

impl<H: Release> fmt::Debug for Owned<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&self.handle).field(&self.live).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockCall, MockDriver};
    use crate::driver::MemFlags;
    use crate::status::Status;

    fn driver_with_context() -> (Arc<MockDriver>, RawContext) {
        let mock = Arc::new(MockDriver::new());
        let platform = mock.platform_ids(10).unwrap()[0];
        let devices = mock.device_ids(platform, crate::DeviceType::ALL, 16).unwrap();
        let ctx = mock.create_context(platform, &devices).unwrap();
        (mock, ctx)
    }

    #[test]
    fn drop_releases_exactly_once() {
        let (mock, ctx) = driver_with_context();
        let mem = mock.create_buffer(ctx, MemFlags::empty(), 64).unwrap();
        {
            let _owned = Owned::new(mock.clone() as Arc<dyn Driver>, mem);
            assert_eq!(mock.stats().live_buffers(), 1);
        }
        assert_eq!(mock.stats().buffers_released, 1);
        assert_eq!(mock.stats().live_buffers(), 0);
    }

    #[test]
    fn explicit_release_propagates_failure() {
        let (mock, ctx) = driver_with_context();
        let mem = mock.create_buffer(ctx, MemFlags::empty(), 64).unwrap();
        let owned = Owned::new(mock.clone() as Arc<dyn Driver>, mem);
        mock.fail_next(MockCall::ReleaseBuffer, Status::INVALID_MEM_OBJECT);
        let err = owned.release().unwrap_err();
        assert_eq!(
            err.to_string(),
            "clReleaseMemObject() failed with CL_INVALID_MEM_OBJECT"
        );
    }

    #[test]
    fn failed_release_on_drop_does_not_panic() {
        let (mock, ctx) = driver_with_context();
        let mem = mock.create_buffer(ctx, MemFlags::empty(), 8).unwrap();
        mock.fail_next(MockCall::ReleaseBuffer, Status::OUT_OF_RESOURCES);
        drop(Owned::new(mock.clone() as Arc<dyn Driver>, mem));
        assert_eq!(mock.stats().buffers_released, 0);
    }
}
