//! [`Driver`] over the system OpenCL runtime.
//!
//! Enumeration goes through the `opencl3` wrappers; everything that needs
//! explicit handle ownership uses the `cl3` bindings directly, since the
//! owning layer above already releases each handle exactly once.
//!
//! Handles are the runtime's object pointers carried as integers.

use super::{
    BinaryLoadFailure, BuildStatus, DeviceId, DeviceType, Driver, DriverResult, KernelArg,
    MemFlags, PlatformId, QueueProperties, RawContext, RawKernel, RawMem, RawProgram, RawQueue,
};
use crate::status::Status;
use cl3::command_queue::CL_QUEUE_PROPERTIES;
use cl3::context::CL_CONTEXT_PLATFORM;
use cl3::kernel::{CL_KERNEL_ARG_NAME, CL_KERNEL_FUNCTION_NAME, CL_KERNEL_NUM_ARGS};
use cl3::program::{
    CL_PROGRAM_BINARIES, CL_PROGRAM_BUILD_LOG, CL_PROGRAM_BUILD_STATUS, CL_PROGRAM_DEVICES,
};
use cl3::types::{
    cl_command_queue, cl_context, cl_context_properties, cl_device_id, cl_event, cl_int,
    cl_kernel, cl_mem, cl_program, cl_queue_properties, cl_uint, CL_FALSE, CL_TRUE,
};
use opencl3::device::Device;
use opencl3::error_codes::ClError;
use opencl3::platform::{get_platforms, Platform};
use std::ffi::{c_void, CString};
use std::ptr;
use tracing::{debug, trace};

macro_rules! handle_casts {
    ($($handle:ident <=> $cl:ty;)+) => {
        $(
            impl $handle {
                fn cl(self) -> $cl {
                    self.raw() as usize as $cl
                }

                fn from_cl(raw: $cl) -> Self {
                    Self::from_raw(raw as usize as u64)
                }
            }
        )+
    };
}

handle_casts! {
    DeviceId <=> cl_device_id;
    RawContext <=> cl_context;
    RawQueue <=> cl_command_queue;
    RawMem <=> cl_mem;
    RawProgram <=> cl_program;
    RawKernel <=> cl_kernel;
}

impl PlatformId {
    fn platform(self) -> Platform {
        Platform::new(self.raw() as usize as _)
    }
}

fn status(code: cl_int) -> Status {
    Status::from_raw(code)
}

fn cl_status(err: ClError) -> Status {
    Status::from_raw(err.0)
}

fn cl_bool(value: bool) -> cl_uint {
    if value {
        CL_TRUE
    } else {
        CL_FALSE
    }
}

/// Release the event returned by an enqueue call; completion is tracked
/// through the queue.
fn discard_event(event: cl_event) {
    if event.is_null() {
        return;
    }
    // SAFETY: `event` was just returned by the runtime and is not shared.
    if let Err(code) = unsafe { cl3::event::release_event(event) } {
        trace!(status = %status(code), "clReleaseEvent() failed");
    }
}

/// The system OpenCL runtime reached through the ICD loader.
#[derive(Debug, Default)]
pub struct OpenClDriver {
    _private: (),
}

impl OpenClDriver {
    pub fn new() -> Self {
        debug!("using the system OpenCL runtime");
        Self { _private: () }
    }
}

impl Driver for OpenClDriver {
    fn backend_name(&self) -> &'static str {
        "opencl"
    }

    fn platform_ids(&self, max_entries: usize) -> DriverResult<Vec<PlatformId>> {
        let platforms = get_platforms().map_err(cl_status)?;
        Ok(platforms
            .iter()
            .take(max_entries)
            .map(|p| PlatformId::from_raw(p.id() as usize as u64))
            .collect())
    }

    fn platform_name(&self, platform: PlatformId) -> DriverResult<Vec<u8>> {
        platform
            .platform()
            .name()
            .map(String::into_bytes)
            .map_err(cl_status)
    }

    fn device_ids(
        &self,
        platform: PlatformId,
        device_type: DeviceType,
        max_entries: usize,
    ) -> DriverResult<Vec<DeviceId>> {
        let ids = platform
            .platform()
            .get_devices(device_type.bits())
            .map_err(cl_status)?;
        Ok(ids
            .into_iter()
            .take(max_entries)
            .map(DeviceId::from_cl)
            .collect())
    }

    fn device_name(&self, device: DeviceId) -> DriverResult<Vec<u8>> {
        Device::new(device.cl())
            .name()
            .map(String::into_bytes)
            .map_err(cl_status)
    }

    fn device_type(&self, device: DeviceId) -> DriverResult<DeviceType> {
        Device::new(device.cl())
            .dev_type()
            .map(DeviceType::from_bits)
            .map_err(cl_status)
    }

    fn create_context(&self, platform: PlatformId, devices: &[DeviceId]) -> DriverResult<RawContext> {
        let ids: Vec<cl_device_id> = devices.iter().map(|d| d.cl()).collect();
        let properties: [cl_context_properties; 3] = [
            CL_CONTEXT_PLATFORM as cl_context_properties,
            platform.platform().id() as cl_context_properties,
            0,
        ];
        cl3::context::create_context(&ids, properties.as_ptr(), None, ptr::null_mut())
            .map(RawContext::from_cl)
            .map_err(status)
    }

    fn release_context(&self, context: RawContext) -> DriverResult<()> {
        // SAFETY: the caller owns the reference being released.
        unsafe { cl3::context::release_context(context.cl()) }.map_err(status)
    }

    fn create_command_queue(
        &self,
        context: RawContext,
        device: DeviceId,
        properties: QueueProperties,
    ) -> DriverResult<RawQueue> {
        let list: [cl_queue_properties; 3] = [
            CL_QUEUE_PROPERTIES as cl_queue_properties,
            properties.bits(),
            0,
        ];
        let list_ptr = if properties == QueueProperties::empty() {
            ptr::null()
        } else {
            list.as_ptr()
        };
        // SAFETY: `list_ptr` is null or a zero-terminated property list.
        unsafe {
            cl3::command_queue::create_command_queue_with_properties(
                context.cl(),
                device.cl(),
                list_ptr,
            )
        }
        .map(RawQueue::from_cl)
        .map_err(status)
    }

    fn release_command_queue(&self, queue: RawQueue) -> DriverResult<()> {
        // SAFETY: the caller owns the reference being released.
        unsafe { cl3::command_queue::release_command_queue(queue.cl()) }.map_err(status)
    }

    fn flush(&self, queue: RawQueue) -> DriverResult<()> {
        cl3::command_queue::flush(queue.cl()).map_err(status)
    }

    fn finish(&self, queue: RawQueue) -> DriverResult<()> {
        cl3::command_queue::finish(queue.cl()).map_err(status)
    }

    fn create_buffer(&self, context: RawContext, flags: MemFlags, byte_len: usize) -> DriverResult<RawMem> {
        // SAFETY: no host pointer is passed.
        unsafe {
            cl3::memory::create_buffer(context.cl(), flags.bits(), byte_len, ptr::null_mut())
        }
        .map(RawMem::from_cl)
        .map_err(status)
    }

    fn release_buffer(&self, mem: RawMem) -> DriverResult<()> {
        // SAFETY: the caller owns the reference being released.
        unsafe { cl3::memory::release_mem_object(mem.cl()) }.map_err(status)
    }

    unsafe fn enqueue_write_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        blocking: bool,
        offset: usize,
        src: &[u8],
    ) -> DriverResult<()> {
        let event = cl3::command_queue::enqueue_write_buffer(
            queue.cl(),
            mem.cl(),
            cl_bool(blocking),
            offset,
            src.len(),
            src.as_ptr().cast::<c_void>(),
            0,
            ptr::null(),
        )
        .map_err(status)?;
        discard_event(event);
        Ok(())
    }

    unsafe fn enqueue_read_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        blocking: bool,
        offset: usize,
        dst: &mut [u8],
    ) -> DriverResult<()> {
        let event = cl3::command_queue::enqueue_read_buffer(
            queue.cl(),
            mem.cl(),
            cl_bool(blocking),
            offset,
            dst.len(),
            dst.as_mut_ptr().cast::<c_void>(),
            0,
            ptr::null(),
        )
        .map_err(status)?;
        discard_event(event);
        Ok(())
    }

    fn enqueue_copy_buffer(
        &self,
        queue: RawQueue,
        src: RawMem,
        dst: RawMem,
        byte_len: usize,
    ) -> DriverResult<()> {
        // SAFETY: device-to-device copy, no host memory involved.
        let event = unsafe {
            cl3::command_queue::enqueue_copy_buffer(
                queue.cl(),
                src.cl(),
                dst.cl(),
                0,
                0,
                byte_len,
                0,
                ptr::null(),
            )
        }
        .map_err(status)?;
        discard_event(event);
        Ok(())
    }

    fn enqueue_fill_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        pattern: &[u8],
        byte_len: usize,
    ) -> DriverResult<()> {
        // SAFETY: the runtime copies `pattern` before the call returns.
        let event = unsafe {
            cl3::command_queue::enqueue_fill_buffer(
                queue.cl(),
                mem.cl(),
                pattern.as_ptr().cast::<c_void>(),
                pattern.len(),
                0,
                byte_len,
                0,
                ptr::null(),
            )
        }
        .map_err(status)?;
        discard_event(event);
        Ok(())
    }

    fn create_program_with_source(&self, context: RawContext, sources: &[&str]) -> DriverResult<RawProgram> {
        cl3::program::create_program_with_source(context.cl(), sources)
            .map(RawProgram::from_cl)
            .map_err(status)
    }

    fn create_program_with_binary(
        &self,
        context: RawContext,
        binaries: &[(DeviceId, &[u8])],
    ) -> Result<RawProgram, BinaryLoadFailure> {
        let devices: Vec<cl_device_id> = binaries.iter().map(|(d, _)| d.cl()).collect();
        let blobs: Vec<&[u8]> = binaries.iter().map(|(_, b)| *b).collect();
        // SAFETY: `devices` and `blobs` have equal length and outlive the call.
        unsafe { cl3::program::create_program_with_binary(context.cl(), &devices, &blobs) }
            .map(RawProgram::from_cl)
            .map_err(|code| BinaryLoadFailure::from(status(code)))
    }

    fn release_program(&self, program: RawProgram) -> DriverResult<()> {
        // SAFETY: the caller owns the reference being released.
        unsafe { cl3::program::release_program(program.cl()) }.map_err(status)
    }

    fn build_program(&self, program: RawProgram, devices: &[DeviceId], options: &str) -> DriverResult<()> {
        let ids: Vec<cl_device_id> = devices.iter().map(|d| d.cl()).collect();
        let options = CString::new(options).map_err(|_| Status::INVALID_BUILD_OPTIONS)?;
        cl3::program::build_program(program.cl(), &ids, &options, None, ptr::null_mut())
            .map_err(status)
    }

    fn program_build_status(&self, program: RawProgram, device: DeviceId) -> DriverResult<BuildStatus> {
        let code: cl_int =
            cl3::program::get_program_build_info(program.cl(), device.cl(), CL_PROGRAM_BUILD_STATUS)
                .map_err(status)?
                .into();
        Ok(BuildStatus::from_raw(code))
    }

    fn program_build_log(&self, program: RawProgram, device: DeviceId) -> DriverResult<Vec<u8>> {
        cl3::program::get_program_build_info(program.cl(), device.cl(), CL_PROGRAM_BUILD_LOG)
            .map(Into::into)
            .map_err(status)
    }

    fn program_binaries(&self, program: RawProgram) -> DriverResult<Vec<(DeviceId, Vec<u8>)>> {
        let devices: Vec<isize> = cl3::program::get_program_info(program.cl(), CL_PROGRAM_DEVICES)
            .map_err(status)?
            .into();
        let binaries: Vec<Vec<u8>> = cl3::program::get_program_info(program.cl(), CL_PROGRAM_BINARIES)
            .map_err(status)?
            .into();
        Ok(devices
            .into_iter()
            .map(|d| DeviceId::from_raw(d as usize as u64))
            .zip(binaries)
            .collect())
    }

    fn create_kernel(&self, program: RawProgram, name: &str) -> DriverResult<RawKernel> {
        let name = CString::new(name).map_err(|_| Status::INVALID_KERNEL_NAME)?;
        cl3::kernel::create_kernel(program.cl(), &name)
            .map(RawKernel::from_cl)
            .map_err(status)
    }

    fn release_kernel(&self, kernel: RawKernel) -> DriverResult<()> {
        // SAFETY: the caller owns the reference being released.
        unsafe { cl3::kernel::release_kernel(kernel.cl()) }.map_err(status)
    }

    fn kernel_function_name(&self, kernel: RawKernel) -> DriverResult<Vec<u8>> {
        cl3::kernel::get_kernel_info(kernel.cl(), CL_KERNEL_FUNCTION_NAME)
            .map(Into::into)
            .map_err(status)
    }

    fn kernel_num_args(&self, kernel: RawKernel) -> DriverResult<u32> {
        cl3::kernel::get_kernel_info(kernel.cl(), CL_KERNEL_NUM_ARGS)
            .map(Into::into)
            .map_err(status)
    }

    fn kernel_arg_name(&self, kernel: RawKernel, index: u32) -> DriverResult<Vec<u8>> {
        cl3::kernel::get_kernel_arg_info(kernel.cl(), index, CL_KERNEL_ARG_NAME)
            .map(Into::into)
            .map_err(status)
    }

    fn set_kernel_arg(&self, kernel: RawKernel, index: u32, arg: KernelArg<'_>) -> DriverResult<()> {
        let mem;
        let (size, value) = match arg {
            KernelArg::Bytes(bytes) => (bytes.len(), bytes.as_ptr().cast::<c_void>()),
            KernelArg::Mem(m) => {
                mem = m.cl();
                (
                    std::mem::size_of::<cl_mem>(),
                    (&mem as *const cl_mem).cast::<c_void>(),
                )
            }
            KernelArg::Local(size) => (size, ptr::null()),
        };
        // SAFETY: `value` is null for local memory or points to `size`
        // readable bytes that live until the call returns.
        unsafe { cl3::kernel::set_kernel_arg(kernel.cl(), index, size, value) }.map_err(status)
    }

    fn enqueue_nd_range(
        &self,
        queue: RawQueue,
        kernel: RawKernel,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> DriverResult<()> {
        if local.is_some_and(|l| l.len() != global.len()) {
            return Err(Status::INVALID_WORK_GROUP_SIZE);
        }
        let work_dim = cl_uint::try_from(global.len()).map_err(|_| Status::INVALID_WORK_DIMENSION)?;
        let local_ptr = local.map_or(ptr::null(), <[usize]>::as_ptr);
        // SAFETY: `global` and `local` hold `work_dim` entries each and
        // outlive the call; kernel arguments were bound through the runtime.
        let event = unsafe {
            cl3::command_queue::enqueue_nd_range_kernel(
                queue.cl(),
                kernel.cl(),
                work_dim,
                ptr::null(),
                global.as_ptr(),
                local_ptr,
                0,
                ptr::null(),
            )
        }
        .map_err(status)?;
        discard_event(event);
        Ok(())
    }
}
