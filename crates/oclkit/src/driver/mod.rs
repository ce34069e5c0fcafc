//! Backend seam over the OpenCL C API.
//!
//! Everything above this module talks to the device through [`Driver`]. A
//! driver hands out opaque `Copy` handles and reports failures as raw
//! [`Status`] codes; decoding and naming the failing call is done by the
//! callers. Ownership of handles lives one layer up, in [`crate::handle`].
//!
//! Two implementations exist:
//! - `OpenClDriver` (feature `opencl`) forwards to the system ICD loader
//!   through `opencl3`.
//! - `MockDriver` (tests, or feature `mock`) is a deterministic in-process
//!   double used to exercise the layer without hardware.

use crate::error::Result;
use crate::status::Status;
use std::fmt;
use std::sync::Arc;

#[cfg(any(test, feature = "mock"))]
pub mod mock;
#[cfg(feature = "opencl")]
pub mod opencl;

#[cfg(any(test, feature = "mock"))]
pub use mock::MockDriver;
#[cfg(feature = "opencl")]
pub use opencl::OpenClDriver;

/// Result of a single driver call.
pub type DriverResult<T> = std::result::Result<T, Status>;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

macro_rules! opaque_handle {
    ($($(#[$meta:meta])* $name:ident;)+) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u64);

            impl $name {
                pub const fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                pub const fn raw(self) -> u64 {
                    self.0
                }
            }
        )+
    };
}

opaque_handle! {
    /// Identity of an enumerated platform.
    PlatformId;
    /// Identity of an enumerated device.
    DeviceId;
    RawContext;
    RawQueue;
    RawMem;
    RawProgram;
    RawKernel;
}

// ---------------------------------------------------------------------------
// Bitmasks
// ---------------------------------------------------------------------------

macro_rules! bitmask {
    ($(#[$meta:meta])* $name:ident: $repr:ty { $($konst:ident = $value:expr,)+ }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $konst: Self = Self($value);)+

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> $repr {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

bitmask! {
    /// `cl_device_type` filter.
    DeviceType: u64 {
        DEFAULT = 1 << 0,
        CPU = 1 << 1,
        GPU = 1 << 2,
        ACCELERATOR = 1 << 3,
        CUSTOM = 1 << 4,
        ALL = 0xFFFF_FFFF,
    }
}

bitmask! {
    /// `cl_mem_flags` for buffer allocation. The empty set means read-write.
    MemFlags: u64 {
        READ_WRITE = 1 << 0,
        WRITE_ONLY = 1 << 1,
        READ_ONLY = 1 << 2,
        ALLOC_HOST_PTR = 1 << 4,
        HOST_WRITE_ONLY = 1 << 7,
        HOST_READ_ONLY = 1 << 8,
        HOST_NO_ACCESS = 1 << 9,
    }
}

bitmask! {
    /// `cl_command_queue_properties`.
    QueueProperties: u64 {
        OUT_OF_ORDER_EXEC_MODE = 1 << 0,
        PROFILING = 1 << 1,
    }
}

// ---------------------------------------------------------------------------
// Call payloads
// ---------------------------------------------------------------------------

/// Per-device outcome of a program build (`cl_build_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    None,
    Error,
    InProgress,
}

impl BuildStatus {
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::None,
            -3 => Self::InProgress,
            _ => Self::Error,
        }
    }
}

/// Value bound to a kernel argument slot.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    /// Plain bytes copied into the slot.
    Bytes(&'a [u8]),
    /// A device memory object.
    Mem(RawMem),
    /// Device-local scratch of the given size; no host data.
    Local(usize),
}

/// Failure of `clCreateProgramWithBinary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryLoadFailure {
    /// Index of the device whose binary was rejected, when the failure is
    /// attributable to a single binary.
    pub device_index: Option<usize>,
    pub status: Status,
}

impl From<Status> for BinaryLoadFailure {
    fn from(status: Status) -> Self {
        Self {
            device_index: None,
            status,
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// The device API used by every other layer.
///
/// Info queries (`*_name`, build logs) return the raw bytes the device API
/// reports, which usually include a trailing NUL; see [`info_string`].
pub trait Driver: Send + Sync + fmt::Debug {
    /// Short backend label for logs.
    fn backend_name(&self) -> &'static str;

    /// At most `max_entries` platforms. A loader with no platforms reports
    /// `CL_PLATFORM_NOT_FOUND_KHR`.
    fn platform_ids(&self, max_entries: usize) -> DriverResult<Vec<PlatformId>>;
    fn platform_name(&self, platform: PlatformId) -> DriverResult<Vec<u8>>;
    /// At most `max_entries` devices matching `device_type`. No match reports
    /// `CL_DEVICE_NOT_FOUND`.
    fn device_ids(
        &self,
        platform: PlatformId,
        device_type: DeviceType,
        max_entries: usize,
    ) -> DriverResult<Vec<DeviceId>>;
    fn device_name(&self, device: DeviceId) -> DriverResult<Vec<u8>>;
    fn device_type(&self, device: DeviceId) -> DriverResult<DeviceType>;

    fn create_context(&self, platform: PlatformId, devices: &[DeviceId])
    -> DriverResult<RawContext>;
    fn release_context(&self, context: RawContext) -> DriverResult<()>;

    fn create_command_queue(
        &self,
        context: RawContext,
        device: DeviceId,
        properties: QueueProperties,
    ) -> DriverResult<RawQueue>;
    fn release_command_queue(&self, queue: RawQueue) -> DriverResult<()>;
    fn flush(&self, queue: RawQueue) -> DriverResult<()>;
    fn finish(&self, queue: RawQueue) -> DriverResult<()>;

    fn create_buffer(&self, context: RawContext, flags: MemFlags, byte_len: usize)
    -> DriverResult<RawMem>;
    fn release_buffer(&self, mem: RawMem) -> DriverResult<()>;

    /// Schedule a host-to-device write of `src` at `offset` bytes.
    ///
    /// # Safety
    ///
    /// With `blocking == false` the call returns before the transfer has
    /// read `src`; the caller must keep `src` alive and unmodified until the
    /// queue has completed the command.
    unsafe fn enqueue_write_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        blocking: bool,
        offset: usize,
        src: &[u8],
    ) -> DriverResult<()>;

    /// Schedule a device-to-host read into `dst` from `offset` bytes.
    ///
    /// # Safety
    ///
    /// With `blocking == false` the call returns before `dst` is written; the
    /// caller must keep `dst` alive and must not read or move it until the
    /// queue has completed the command.
    unsafe fn enqueue_read_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        blocking: bool,
        offset: usize,
        dst: &mut [u8],
    ) -> DriverResult<()>;

    fn enqueue_copy_buffer(
        &self,
        queue: RawQueue,
        src: RawMem,
        dst: RawMem,
        byte_len: usize,
    ) -> DriverResult<()>;

    /// Fill `byte_len` bytes from the start of `mem` with `pattern` repeated.
    fn enqueue_fill_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        pattern: &[u8],
        byte_len: usize,
    ) -> DriverResult<()>;

    /// One program from all fragments, in order, as a single translation unit.
    fn create_program_with_source(&self, context: RawContext, sources: &[&str])
    -> DriverResult<RawProgram>;
    fn create_program_with_binary(
        &self,
        context: RawContext,
        binaries: &[(DeviceId, &[u8])],
    ) -> std::result::Result<RawProgram, BinaryLoadFailure>;
    fn release_program(&self, program: RawProgram) -> DriverResult<()>;

    /// Build for exactly `devices`. A compile error reports
    /// `CL_BUILD_PROGRAM_FAILURE`; per-device details come from
    /// [`Driver::program_build_status`] and [`Driver::program_build_log`].
    fn build_program(&self, program: RawProgram, devices: &[DeviceId], options: &str)
    -> DriverResult<()>;
    fn program_build_status(&self, program: RawProgram, device: DeviceId)
    -> DriverResult<BuildStatus>;
    fn program_build_log(&self, program: RawProgram, device: DeviceId) -> DriverResult<Vec<u8>>;
    /// Executable binaries per associated device.
    fn program_binaries(&self, program: RawProgram) -> DriverResult<Vec<(DeviceId, Vec<u8>)>>;

    fn create_kernel(&self, program: RawProgram, name: &str) -> DriverResult<RawKernel>;
    fn release_kernel(&self, kernel: RawKernel) -> DriverResult<()>;
    fn kernel_function_name(&self, kernel: RawKernel) -> DriverResult<Vec<u8>>;
    fn kernel_num_args(&self, kernel: RawKernel) -> DriverResult<u32>;
    /// Declared name of argument `index`; requires the program to have been
    /// built with `-cl-kernel-arg-info`.
    fn kernel_arg_name(&self, kernel: RawKernel, index: u32) -> DriverResult<Vec<u8>>;
    fn set_kernel_arg(&self, kernel: RawKernel, index: u32, arg: KernelArg<'_>)
    -> DriverResult<()>;

    /// Launch over `global` work-items (1 to 3 dimensions), with an optional
    /// work-group shape of the same rank.
    fn enqueue_nd_range(
        &self,
        queue: RawQueue,
        kernel: RawKernel,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> DriverResult<()>;
}

/// Decode an info string, trimming exactly one trailing NUL if present.
pub fn info_string(mut raw: Vec<u8>) -> String {
    if raw.last() == Some(&0) {
        raw.pop();
    }
    match String::from_utf8(raw) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// The driver for the system OpenCL runtime, when compiled in.
pub fn default_driver() -> Result<Arc<dyn Driver>> {
    #[cfg(feature = "opencl")]
    {
        Ok(Arc::new(OpenClDriver::new()))
    }
    #[cfg(not(feature = "opencl"))]
    {
        Err(crate::error::OclError::BackendUnavailable(
            "oclkit was built without the `opencl` feature".into(),
        ))
    }
}
