//! `oclkit`: typed ownership of OpenCL contexts, queues, buffers, programs
//! and kernels.
//!
//! | Layer          | Module       | Owns                                      |
//! |----------------|--------------|-------------------------------------------|
//! | Status catalog | [`status`]   | code → symbolic name, total               |
//! | Enumeration    | [`device`]   | nothing; re-queries the driver            |
//! | Context        | [`context`]  | one platform + device set                 |
//! | Queue          | [`queue`]    | one in-order stream on one device         |
//! | Buffers        | [`buffer`]   | zero or one typed device allocation       |
//! | Programs       | [`program`]  | sources/binaries, build state, build log  |
//! | Kernels        | [`kernel`]   | one entry point, optional arg-name map    |
//! | Registry       | [`registry`] | named shared programs                     |
//!
//! All device calls go through the [`driver::Driver`] trait. The system
//! OpenCL runtime is used with the `opencl` feature; the `mock` feature
//! exposes an in-process driver for tests.
//!
//! # Usage
//!
//! ```rust
//! use oclkit::{ceil_to_multiple, status_name};
//!
//! assert_eq!(ceil_to_multiple(1000, 64), Some(1024));
//! assert_eq!(status_name(-5), "CL_OUT_OF_RESOURCES");
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod device;
pub mod driver;
pub mod error;
mod handle;
pub mod kernel;
pub mod program;
pub mod queue;
pub mod registry;
pub mod status;


pub use buffer::{
    Buffer, Buffer1D, Buffer2D, Buffer3D, Extent, HostImage, HostMatrix, HostSink, HostSource,
    Shape,
};
pub use config::{ConfigError, DeviceKind, OclConfig};
pub use context::Context;
pub use device::{Device, DeviceRegistry, Platform, MAX_DEVICES, MAX_PLATFORMS};
pub use driver::{default_driver, BuildStatus, DeviceType, Driver, MemFlags, QueueProperties};
pub use error::{OclError, Result, StatusExt};
pub use kernel::{ceil_to_multiple, ArgKey, Kernel};
pub use program::{compose_build_options, Program, ProgramState};
pub use queue::CommandQueue;
pub use registry::ProgramRegistry;
pub use status::{status_name, Status, UNKNOWN_STATUS};
