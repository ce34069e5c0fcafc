//! Error types for the OpenCL resource layer.

use crate::config::ConfigError;
use crate::status::Status;
use thiserror::Error;

/// Errors produced by contexts, buffers, programs and kernels.
///
/// A failed kernel compile is not an error: [`crate::Program::build`]
/// reports it as `Ok(false)` together with the captured build log.
#[derive(Debug, Error)]
pub enum OclError {
    /// A driver call returned a non-success status.
    #[error("{call} failed with {status}")]
    Api { call: &'static str, status: Status },

    #[error("clCreateProgramWithBinary() failed at device {device_index} with: {status}")]
    BinaryLoad { device_index: usize, status: Status },

    #[error("clCreateKernel() failed for '{name}' with {status}")]
    KernelCreation { name: String, status: Status },

    #[error("{call} failed for kernel '{kernel}' with {status}")]
    Dispatch {
        kernel: String,
        call: &'static str,
        status: Status,
    },

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("no such argument '{arg}' in kernel '{kernel}'")]
    NoSuchArgument { kernel: String, arg: String },

    #[error("argument names of kernel '{kernel}' were not captured (build with kernel arg info)")]
    ArgNamesUnavailable { kernel: String },

    #[error("argument index {index} out of range for kernel '{kernel}' ({count} arguments)")]
    ArgIndexOutOfRange {
        kernel: String,
        index: u32,
        count: u32,
    },

    #[error("kernel '{kernel}' reported no name for argument {index}")]
    MissingArgName { kernel: String, index: u32 },

    #[error("kernel reported an empty function name")]
    MissingKernelName,

    #[error("program already created")]
    ProgramAlreadyCreated,

    #[error("program not created")]
    ProgramNotCreated,

    #[error("program not built")]
    ProgramNotBuilt,

    #[error("program has no {0} attached")]
    NothingAttached(&'static str),

    #[error("no such file: '{0}'")]
    NoSuchFile(String),

    #[error("no such program: '{0}'")]
    NoSuchProgram(String),

    #[error("no such device: {0}")]
    NoSuchDevice(String),

    #[error("no OpenCL platform found")]
    NoPlatform,

    #[error("context has been released")]
    ContextReleased,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, OclError>;

impl OclError {
    /// The decoded driver status carried by this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Api { status, .. }
            | Self::BinaryLoad { status, .. }
            | Self::KernelCreation { status, .. }
            | Self::Dispatch { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Attach the failing driver entry point to a raw status.
pub trait StatusExt<T> {
    fn call(self, call: &'static str) -> Result<T>;
}

impl<T> StatusExt<T> for std::result::Result<T, Status> {
    fn call(self, call: &'static str) -> Result<T> {
        self.map_err(|status| OclError::Api { call, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_embeds_call_and_status_name() {
        let raw: std::result::Result<(), Status> = Err(Status::from_raw(-4));
        let err = raw.call("clCreateBuffer()").unwrap_err();
        assert_eq!(
            err.to_string(),
            "clCreateBuffer() failed with CL_MEM_OBJECT_ALLOCATION_FAILURE"
        );
        assert_eq!(err.status(), Some(Status::MEM_OBJECT_ALLOCATION_FAILURE));
    }

    #[test]
    fn status_ext_passes_values_through() {
        let raw: std::result::Result<u32, Status> = Ok(7);
        assert_eq!(raw.call("clFinish()").unwrap(), 7);
    }

    #[test]
    fn status_ext_maps_err() {
        let raw: std::result::Result<(), Status> = Err(Status::INVALID_DEVICE);
        let err = raw.call("clCreateCommandQueue()").unwrap_err();
        assert!(matches!(
            err,
            OclError::Api {
                call: "clCreateCommandQueue()",
                status: Status::INVALID_DEVICE
            }
        ));
    }

    #[test]
    fn descriptive_messages_name_the_subject() {
        let e = OclError::NoSuchArgument {
            kernel: "scale".into(),
            arg: "tile".into(),
        };
        assert_eq!(e.to_string(), "no such argument 'tile' in kernel 'scale'");

        let e = OclError::KernelCreation {
            name: "missing".into(),
            status: Status::INVALID_KERNEL_NAME,
        };
        assert_eq!(
            e.to_string(),
            "clCreateKernel() failed for 'missing' with CL_INVALID_KERNEL_NAME"
        );

        let e = OclError::BinaryLoad {
            device_index: 1,
            status: Status::INVALID_BINARY,
        };
        assert!(e.to_string().contains("device 1"));
        assert!(e.to_string().contains("CL_INVALID_BINARY"));

        assert_eq!(
            OclError::NoSuchFile("k.cl".into()).to_string(),
            "no such file: 'k.cl'"
        );
        assert_eq!(OclError::ProgramAlreadyCreated.to_string(), "program already created");
    }

    #[test]
    fn dispatch_error_names_kernel_and_status() {
        let e = OclError::Dispatch {
            kernel: "double_it".into(),
            call: "clEnqueueNDRangeKernel()",
            status: Status::INVALID_WORK_GROUP_SIZE,
        };
        let msg = e.to_string();
        assert!(msg.contains("double_it"));
        assert!(msg.contains("CL_INVALID_WORK_GROUP_SIZE"));
        assert_eq!(e.status(), Some(Status::INVALID_WORK_GROUP_SIZE));
    }

    #[test]
    fn logic_errors_carry_no_status() {
        assert_eq!(OclError::ProgramNotBuilt.status(), None);
        assert_eq!(OclError::DimensionMismatch("x".into()).status(), None);
    }
}
