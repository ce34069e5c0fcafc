//! Program creation and the build state machine.
//!
//! A program collects source fragments or per-device binaries, is created
//! once, and can then be built for a device set. A failed compile is an
//! expected outcome and is reported as `Ok(false)` with the build log.

use crate::config::OclConfig;
use crate::context::Context;
use crate::device::Device;
use crate::driver::{info_string, BuildStatus, DeviceId, RawProgram};
use crate::error::{OclError, Result, StatusExt};
use crate::handle::Owned;
use crate::kernel::Kernel;
use crate::status::Status;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const ARG_INFO_OPTION: &str = "-cl-kernel-arg-info";

/// Where a program is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    /// Nothing attached yet.
    Empty,
    /// Sources or binaries attached, no program object.
    Sourced,
    /// Program object exists but has not been built.
    Compiled,
    /// At least one build was attempted; `success` is the last outcome.
    Built { success: bool },
}

/// Final option string for a build: `base`, then the arg-info flag when
/// requested, then one `-I <path>` per non-empty include path.
pub fn compose_build_options(base: &str, with_arg_names: bool, include_paths: &[PathBuf]) -> String {
    let mut options = base.to_string();
    if with_arg_names {
        options.push(' ');
        options.push_str(ARG_INFO_OPTION);
    }
    for path in include_paths.iter().filter(|p| !p.as_os_str().is_empty()) {
        options.push_str(" -I ");
        options.push_str(&path.to_string_lossy());
    }
    options
}

pub struct Program {
    context: Context,
    handle: Option<Owned<RawProgram>>,
    options: String,
    include_paths: Vec<PathBuf>,
    sources: Vec<String>,
    binaries: BTreeMap<DeviceId, Vec<u8>>,
    build_log: Vec<String>,
    with_arg_names: bool,
    arg_names_by_default: bool,
    last_build: Option<bool>,
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("state", &self.state())
            .field("options", &self.options)
            .field("include_paths", &self.include_paths)
            .field("sources", &self.sources.len())
            .field("binaries", &self.binaries.len())
            .field("build_log", &self.build_log.len())
            .finish()
    }
}

impl Program {
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            handle: None,
            options: String::new(),
            include_paths: Vec::new(),
            sources: Vec::new(),
            binaries: BTreeMap::new(),
            build_log: Vec::new(),
            with_arg_names: false,
            arg_names_by_default: false,
            last_build: None,
        }
    }

    /// A program using the configured build options, include paths and
    /// argument-name capture.
    pub fn with_config(context: &Context, config: &OclConfig) -> Self {
        let mut program = Self::new(context);
        program.options = config.build_options.clone();
        for path in &config.include_paths {
            program.add_include_path(path);
        }
        program.arg_names_by_default = config.kernel_arg_info;
        program
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    pub fn set_options(&mut self, options: impl Into<String>) {
        self.options = options.into();
    }

    /// Register a directory searched by [`Program::add_source`] and passed
    /// to the compiler. Registering a path twice has no effect.
    pub fn add_include_path(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if !self.include_paths.iter().any(|p| p == path) {
            self.include_paths.push(path.to_path_buf());
        }
    }

    pub fn include_paths(&self) -> &[PathBuf] {
        &self.include_paths
    }

    pub fn state(&self) -> ProgramState {
        match (&self.handle, self.last_build) {
            (Some(_), Some(success)) => ProgramState::Built { success },
            (Some(_), None) => ProgramState::Compiled,
            (None, _) if self.sources.is_empty() && self.binaries.is_empty() => ProgramState::Empty,
            (None, _) => ProgramState::Sourced,
        }
    }

    /// Whether the last build requested argument names.
    pub fn with_arg_names(&self) -> bool {
        self.with_arg_names
    }

    fn ensure_not_created(&self) -> Result<()> {
        if self.handle.is_some() {
            return Err(OclError::ProgramAlreadyCreated);
        }
        Ok(())
    }

    fn raw(&self) -> Result<RawProgram> {
        self.handle
            .as_ref()
            .map(Owned::get)
            .ok_or(OclError::ProgramNotCreated)
    }

    /// Contents of the first readable `name`, trying it as given and then
    /// under each include path in registration order.
    fn read_first(&self, name: &str) -> Result<(PathBuf, Vec<u8>)> {
        std::iter::once(PathBuf::from(name))
            .chain(self.include_paths.iter().map(|dir| dir.join(name)))
            .find_map(|path| fs::read(&path).ok().map(|bytes| (path, bytes)))
            .ok_or_else(|| OclError::NoSuchFile(name.to_string()))
    }

    /// Append the contents of source file `name`.
    pub fn add_source(&mut self, name: &str) -> Result<()> {
        self.ensure_not_created()?;
        let (path, bytes) = self.read_first(name)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| OclError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        debug!(path = %path.display(), bytes = text.len(), "source added");
        self.sources.push(text);
        Ok(())
    }

    pub fn add_source_code(&mut self, source: impl Into<String>) -> Result<()> {
        self.ensure_not_created()?;
        self.sources.push(source.into());
        Ok(())
    }

    /// Set the binary for `device` from file `name`, searched like sources.
    pub fn add_binary(&mut self, device: &Device, name: &str) -> Result<()> {
        self.ensure_not_created()?;
        let (path, bytes) = self.read_first(name)?;
        debug!(path = %path.display(), device = %device.name(), "binary added");
        self.binaries.insert(device.id(), bytes);
        Ok(())
    }

    pub fn add_binary_code(&mut self, device: DeviceId, binary: impl Into<Vec<u8>>) -> Result<()> {
        self.ensure_not_created()?;
        self.binaries.insert(device, binary.into());
        Ok(())
    }

    /// Create the program from all source fragments, in order, as one
    /// translation unit.
    pub fn create_from_source(&mut self) -> Result<()> {
        self.ensure_not_created()?;
        if self.sources.is_empty() {
            return Err(OclError::NothingAttached("source"));
        }
        let fragments: Vec<&str> = self.sources.iter().map(String::as_str).collect();
        let raw = self
            .context
            .driver()
            .create_program_with_source(self.context.raw()?, &fragments)
            .call("clCreateProgramWithSource()")?;
        self.handle = Some(Owned::new(self.context.driver().clone(), raw));
        info!(fragments = fragments.len(), "program created from source");
        Ok(())
    }

    /// Create the program from one binary per device.
    pub fn create_from_binary(&mut self) -> Result<()> {
        self.ensure_not_created()?;
        if self.binaries.is_empty() {
            return Err(OclError::NothingAttached("binary"));
        }
        let list: Vec<(DeviceId, &[u8])> = self
            .binaries
            .iter()
            .map(|(device, binary)| (*device, binary.as_slice()))
            .collect();
        let raw = self
            .context
            .driver()
            .create_program_with_binary(self.context.raw()?, &list)
            .map_err(|failure| match failure.device_index {
                Some(device_index) => OclError::BinaryLoad {
                    device_index,
                    status: failure.status,
                },
                None => OclError::Api {
                    call: "clCreateProgramWithBinary()",
                    status: failure.status,
                },
            })?;
        self.handle = Some(Owned::new(self.context.driver().clone(), raw));
        info!(devices = list.len(), "program created from binaries");
        Ok(())
    }

    /// Build for exactly `devices`, which must not be empty.
    ///
    /// Returns `Ok(false)` when any device failed to build. Every device's
    /// non-empty log is appended to [`Program::build_log`], including
    /// warnings from successful builds.
    pub fn build(&mut self, devices: &[Device], with_arg_names: bool) -> Result<bool> {
        let program = self.raw()?;
        if devices.is_empty() {
            return Err(OclError::InvalidArgument(
                "a build needs at least one device".into(),
            ));
        }
        let options = compose_build_options(&self.options, with_arg_names, &self.include_paths);
        let ids: Vec<DeviceId> = devices.iter().map(Device::id).collect();
        let driver = self.context.driver().clone();

        let mut success = match driver.build_program(program, &ids, &options) {
            Ok(()) => true,
            Err(Status::BUILD_PROGRAM_FAILURE) => false,
            Err(status) => return Err(status).call("clBuildProgram()"),
        };

        for device in devices {
            let status = driver
                .program_build_status(program, device.id())
                .call("clGetProgramBuildInfo()")?;
            if status != BuildStatus::Success {
                success = false;
            }
            let log = info_string(
                driver
                    .program_build_log(program, device.id())
                    .call("clGetProgramBuildInfo()")?,
            );
            if !log.is_empty() {
                self.build_log.push(log);
            }
        }

        self.last_build = Some(success);
        self.with_arg_names = with_arg_names;
        if success {
            info!(devices = devices.len(), %options, "program built");
        } else {
            warn!(
                devices = devices.len(),
                %options,
                log_entries = self.build_log.len(),
                "program build failed"
            );
        }
        Ok(success)
    }

    /// [`Program::build`] for every device of the context.
    pub fn build_for_context(&mut self, with_arg_names: bool) -> Result<bool> {
        let devices = self.context.devices().to_vec();
        self.build(&devices, with_arg_names)
    }

    /// [`Program::build_for_context`] with the configured argument-name
    /// capture (see [`Program::with_config`]).
    pub fn build_default(&mut self) -> Result<bool> {
        self.build_for_context(self.arg_names_by_default)
    }

    /// Diagnostics of every build so far, one entry per device with output.
    pub fn build_log(&self) -> &[String] {
        &self.build_log
    }

    pub fn write_build_log<W: Write>(&self, out: &mut W) -> Result<()> {
        for entry in &self.build_log {
            writeln!(out, "{entry}")?;
        }
        Ok(())
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn write_sources<W: Write>(&self, out: &mut W) -> Result<()> {
        for source in &self.sources {
            writeln!(out, "{source}")?;
        }
        Ok(())
    }

    /// Executable binary per device, as accepted by
    /// [`Program::add_binary_code`].
    pub fn binaries(&self) -> Result<BTreeMap<DeviceId, Vec<u8>>> {
        let program = self.raw()?;
        Ok(self
            .context
            .driver()
            .program_binaries(program)
            .call("clGetProgramInfo()")?
            .into_iter()
            .collect())
    }

    /// Extract entry point `name`. Argument names are captured when the
    /// last build requested them.
    pub fn create_kernel(&self, name: &str) -> Result<Kernel> {
        if self.last_build.is_none() {
            return Err(OclError::ProgramNotBuilt);
        }
        let program = self.raw()?;
        let raw = self
            .context
            .driver()
            .create_kernel(program, name)
            .map_err(|status| OclError::KernelCreation {
                name: name.to_string(),
                status,
            })?;
        Kernel::from_raw(&self.context, raw, self.with_arg_names)
    }
}
