//! Deterministic in-process [`Driver`] for tests.
//!
//! Buffers live in host memory and every enqueued command completes before
//! the call returns, so queue ordering holds trivially. Programs go through
//! a small OpenCL C front end (see `clc`), which yields per-device build
//! status, logs, kernel signatures and argument names. Kernel bodies are
//! host closures registered by entry-point name; an entry point without a
//! registered body still validates its launch and is recorded, but does
//! nothing.
//!
//! Counters ([`MockStats`]) and one-shot failure injection
//! ([`MockDriver::fail_next`]) let tests observe allocations and force
//! error paths.

mod clc;

use self::clc::{BuildOptions, Compiled, KernelDecl};
use super::{
    BinaryLoadFailure, BuildStatus, DeviceId, DeviceType, Driver, DriverResult, KernelArg,
    MemFlags, PlatformId, QueueProperties, RawContext, RawKernel, RawMem, RawProgram, RawQueue,
};
use crate::status::Status;
use bytemuck::Pod;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::trace;

/// Prefix of every binary produced by [`MockDriver::program_binaries`].
pub const MOCK_BINARY_MAGIC: &[u8] = b"OCLKIT-MOCK-BINARY\n";

/// Largest single allocation the mock accepts.
pub const MOCK_MAX_ALLOC: usize = 1 << 30;

/// Largest work-group the mock devices accept.
pub const MOCK_MAX_WORK_GROUP: usize = 1024;

/// Driver entry points that can be made to fail with [`MockDriver::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    PlatformIds,
    PlatformName,
    DeviceIds,
    DeviceName,
    CreateContext,
    ReleaseContext,
    CreateQueue,
    ReleaseQueue,
    Finish,
    CreateBuffer,
    ReleaseBuffer,
    WriteBuffer,
    ReadBuffer,
    CopyBuffer,
    FillBuffer,
    CreateProgram,
    ReleaseProgram,
    BuildProgram,
    CreateKernel,
    ReleaseKernel,
    SetKernelArg,
    EnqueueKernel,
}

/// Call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    pub contexts_created: u64,
    pub contexts_released: u64,
    pub queues_created: u64,
    pub queues_released: u64,
    pub buffers_created: u64,
    pub buffers_released: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub bytes_copied: u64,
    pub fills: u64,
    pub programs_created: u64,
    pub programs_released: u64,
    pub builds: u64,
    pub kernels_created: u64,
    pub kernels_released: u64,
    pub dispatches: u64,
}

impl MockStats {
    pub fn live_buffers(&self) -> u64 {
        self.buffers_created - self.buffers_released
    }

    pub fn live_kernels(&self) -> u64 {
        self.kernels_created - self.kernels_released
    }

    pub fn live_contexts(&self) -> u64 {
        self.contexts_created - self.contexts_released
    }
}

/// A value bound to a mock kernel argument slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockArg {
    Bytes(Vec<u8>),
    Mem(RawMem),
    Local(usize),
}

/// One recorded kernel launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub kernel: String,
    pub device: DeviceId,
    pub global: Vec<usize>,
    pub local: Option<Vec<usize>>,
    pub args: Vec<MockArg>,
}

type KernelBody = Arc<dyn Fn(&mut Invocation<'_>) -> Result<(), Status> + Send + Sync>;

/// View of a launch handed to a registered kernel body.
///
/// Bodies run while the driver is locked and must not call back into it.
pub struct Invocation<'a> {
    global: &'a [usize],
    local: Option<&'a [usize]>,
    args: &'a [MockArg],
    buffers: &'a mut HashMap<u64, MockBuffer>,
}

impl Invocation<'_> {
    pub fn work_dim(&self) -> usize {
        self.global.len()
    }

    /// Global size along `dim`; 1 beyond the launch rank.
    pub fn global_size(&self, dim: usize) -> usize {
        self.global.get(dim).copied().unwrap_or(1)
    }

    pub fn local_size(&self, dim: usize) -> Option<usize> {
        self.local.and_then(|l| l.get(dim).copied())
    }

    /// Total number of work-items.
    pub fn work_items(&self) -> usize {
        self.global.iter().product()
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// A by-value argument decoded as `T`; `None` when the slot holds
    /// something else or the size differs.
    pub fn scalar<T: Pod>(&self, index: usize) -> Option<T> {
        match self.args.get(index)? {
            MockArg::Bytes(bytes) if bytes.len() == std::mem::size_of::<T>() => {
                Some(bytemuck::pod_read_unaligned(bytes))
            }
            _ => None,
        }
    }

    pub fn local_bytes(&self, index: usize) -> Option<usize> {
        match self.args.get(index)? {
            MockArg::Local(size) => Some(*size),
            _ => None,
        }
    }

    /// Contents of a buffer argument as elements of `T`.
    pub fn read<T: Pod>(&self, index: usize) -> Option<Vec<T>> {
        let MockArg::Mem(mem) = self.args.get(index)? else {
            return None;
        };
        let data = &self.buffers.get(&mem.raw())?.data;
        Some(
            data.chunks_exact(std::mem::size_of::<T>())
                .map(bytemuck::pod_read_unaligned)
                .collect(),
        )
    }

    /// Overwrite the start of a buffer argument with `values`.
    pub fn write<T: Pod>(&mut self, index: usize, values: &[T]) -> Result<(), Status> {
        let Some(MockArg::Mem(mem)) = self.args.get(index) else {
            return Err(Status::INVALID_MEM_OBJECT);
        };
        let buffer = self
            .buffers
            .get_mut(&mem.raw())
            .ok_or(Status::INVALID_MEM_OBJECT)?;
        let bytes: &[u8] = bytemuck::cast_slice(values);
        if bytes.len() > buffer.data.len() {
            return Err(Status::OUT_OF_RESOURCES);
        }
        buffer.data[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct MockPlatform {
    id: PlatformId,
    name: String,
}

struct MockDevice {
    id: DeviceId,
    platform: PlatformId,
    name: String,
    device_type: DeviceType,
}

struct MockContext {
    devices: Vec<DeviceId>,
}

struct MockQueue {
    context: u64,
    device: DeviceId,
}

struct MockBuffer {
    context: u64,
    data: Vec<u8>,
}

enum Origin {
    Source(String),
    Binary(HashMap<DeviceId, String>),
}

struct DeviceBuild {
    status: BuildStatus,
    log: String,
    unit: Option<Compiled>,
}

struct MockProgram {
    origin: Origin,
    devices: Vec<DeviceId>,
    builds: HashMap<DeviceId, DeviceBuild>,
}

struct MockKernel {
    decl: KernelDecl,
    arg_info: bool,
    args: Vec<Option<MockArg>>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    platforms: Vec<MockPlatform>,
    devices: Vec<MockDevice>,
    contexts: HashMap<u64, MockContext>,
    queues: HashMap<u64, MockQueue>,
    buffers: HashMap<u64, MockBuffer>,
    programs: HashMap<u64, MockProgram>,
    kernels: HashMap<u64, MockKernel>,
    failures: HashMap<MockCall, VecDeque<Status>>,
    stats: MockStats,
    dispatches: Vec<DispatchRecord>,
}

impl MockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn inject(&mut self, call: MockCall) -> DriverResult<()> {
        match self.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(status) => {
                trace!(?call, %status, "injected failure");
                Err(status)
            }
            None => Ok(()),
        }
    }

    fn device(&self, id: DeviceId) -> DriverResult<&MockDevice> {
        self.devices
            .iter()
            .find(|d| d.id == id)
            .ok_or(Status::INVALID_DEVICE)
    }

    fn queue(&self, queue: RawQueue) -> DriverResult<&MockQueue> {
        self.queues
            .get(&queue.raw())
            .ok_or(Status::INVALID_COMMAND_QUEUE)
    }

    fn buffer_in(&self, mem: RawMem, context: u64) -> DriverResult<&MockBuffer> {
        let buffer = self
            .buffers
            .get(&mem.raw())
            .ok_or(Status::INVALID_MEM_OBJECT)?;
        if buffer.context != context {
            return Err(Status::INVALID_CONTEXT);
        }
        Ok(buffer)
    }
}

/// In-process driver double. See the module documentation.
pub struct MockDriver {
    state: Mutex<MockState>,
    bodies: RwLock<HashMap<String, KernelBody>>,
}

impl fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("MockDriver")
            .field("platforms", &state.platforms.len())
            .field("devices", &state.devices.len())
            .field("stats", &state.stats)
            .finish()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// One platform (`"oclkit Mock Platform"`) with one GPU (`"Mock GPU"`).
    pub fn new() -> Self {
        Self::empty().with_platform("oclkit Mock Platform", &[("Mock GPU", DeviceType::GPU)])
    }

    /// No platforms at all.
    pub fn empty() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            bodies: RwLock::new(HashMap::new()),
        }
    }

    /// Add a platform with the given `(name, type)` devices.
    pub fn with_platform(self, name: &str, devices: &[(&str, DeviceType)]) -> Self {
        {
            let mut state = self.state();
            let platform = PlatformId::from_raw(state.next_id());
            state.platforms.push(MockPlatform {
                id: platform,
                name: name.to_string(),
            });
            for (device_name, device_type) in devices {
                let id = DeviceId::from_raw(state.next_id());
                state.devices.push(MockDevice {
                    id,
                    platform,
                    name: device_name.to_string(),
                    device_type: *device_type,
                });
            }
        }
        self
    }

    /// Register the host body executed for kernels named `name`.
    pub fn register_kernel<F>(&self, name: &str, body: F)
    where
        F: Fn(&mut Invocation<'_>) -> Result<(), Status> + Send + Sync + 'static,
    {
        self.bodies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(body));
    }

    /// Make the next call of kind `call` fail with `status`. Queued
    /// failures are consumed in order.
    pub fn fail_next(&self, call: MockCall, status: Status) {
        self.state()
            .failures
            .entry(call)
            .or_default()
            .push_back(status);
    }

    pub fn stats(&self) -> MockStats {
        self.state().stats.clone()
    }

    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.state().dispatches.clone()
    }

    /// Raw bytes of a live buffer.
    pub fn buffer_contents(&self, mem: RawMem) -> Option<Vec<u8>> {
        self.state().buffers.get(&mem.raw()).map(|b| b.data.clone())
    }

    /// Current argument bindings of a live kernel.
    pub fn kernel_args(&self, kernel: RawKernel) -> Option<Vec<Option<MockArg>>> {
        self.state()
            .kernels
            .get(&kernel.raw())
            .map(|k| k.args.clone())
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn body(&self, name: &str) -> Option<KernelBody> {
        self.bodies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

fn with_terminator(s: &str) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn check_range(offset: usize, len: usize, size: usize) -> DriverResult<()> {
    if len == 0 {
        return Err(Status::INVALID_VALUE);
    }
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Status::INVALID_VALUE),
    }
}

impl Driver for MockDriver {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn platform_ids(&self, max_entries: usize) -> DriverResult<Vec<PlatformId>> {
        let mut state = self.state();
        state.inject(MockCall::PlatformIds)?;
        if state.platforms.is_empty() {
            return Err(Status::PLATFORM_NOT_FOUND_KHR);
        }
        Ok(state
            .platforms
            .iter()
            .take(max_entries)
            .map(|p| p.id)
            .collect())
    }

    fn platform_name(&self, platform: PlatformId) -> DriverResult<Vec<u8>> {
        let mut state = self.state();
        state.inject(MockCall::PlatformName)?;
        state
            .platforms
            .iter()
            .find(|p| p.id == platform)
            .map(|p| with_terminator(&p.name))
            .ok_or(Status::INVALID_PLATFORM)
    }

    fn device_ids(
        &self,
        platform: PlatformId,
        device_type: DeviceType,
        max_entries: usize,
    ) -> DriverResult<Vec<DeviceId>> {
        let mut state = self.state();
        state.inject(MockCall::DeviceIds)?;
        if !state.platforms.iter().any(|p| p.id == platform) {
            return Err(Status::INVALID_PLATFORM);
        }
        let on_platform = state.devices.iter().filter(|d| d.platform == platform);
        let matching: Vec<DeviceId> = if device_type == DeviceType::DEFAULT {
            on_platform.take(1).map(|d| d.id).collect()
        } else {
            on_platform
                .filter(|d| d.device_type.intersects(device_type))
                .map(|d| d.id)
                .collect()
        };
        if matching.is_empty() {
            return Err(Status::DEVICE_NOT_FOUND);
        }
        Ok(matching.into_iter().take(max_entries).collect())
    }

    fn device_name(&self, device: DeviceId) -> DriverResult<Vec<u8>> {
        let mut state = self.state();
        state.inject(MockCall::DeviceName)?;
        Ok(with_terminator(&state.device(device)?.name))
    }

    fn device_type(&self, device: DeviceId) -> DriverResult<DeviceType> {
        Ok(self.state().device(device)?.device_type)
    }

    fn create_context(&self, platform: PlatformId, devices: &[DeviceId]) -> DriverResult<RawContext> {
        let mut state = self.state();
        state.inject(MockCall::CreateContext)?;
        if !state.platforms.iter().any(|p| p.id == platform) {
            return Err(Status::INVALID_PLATFORM);
        }
        if devices.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        for &device in devices {
            if state.device(device)?.platform != platform {
                return Err(Status::INVALID_DEVICE);
            }
        }
        let id = state.next_id();
        state.contexts.insert(
            id,
            MockContext {
                devices: devices.to_vec(),
            },
        );
        state.stats.contexts_created += 1;
        Ok(RawContext::from_raw(id))
    }

    fn release_context(&self, context: RawContext) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::ReleaseContext)?;
        state
            .contexts
            .remove(&context.raw())
            .ok_or(Status::INVALID_CONTEXT)?;
        state.stats.contexts_released += 1;
        Ok(())
    }

    fn create_command_queue(
        &self,
        context: RawContext,
        device: DeviceId,
        properties: QueueProperties,
    ) -> DriverResult<RawQueue> {
        let mut state = self.state();
        state.inject(MockCall::CreateQueue)?;
        let ctx = state
            .contexts
            .get(&context.raw())
            .ok_or(Status::INVALID_CONTEXT)?;
        if !ctx.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        let known = QueueProperties::OUT_OF_ORDER_EXEC_MODE | QueueProperties::PROFILING;
        if !known.contains(properties) {
            return Err(Status::INVALID_QUEUE_PROPERTIES);
        }
        let id = state.next_id();
        state.queues.insert(
            id,
            MockQueue {
                context: context.raw(),
                device,
            },
        );
        state.stats.queues_created += 1;
        Ok(RawQueue::from_raw(id))
    }

    fn release_command_queue(&self, queue: RawQueue) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::ReleaseQueue)?;
        state
            .queues
            .remove(&queue.raw())
            .ok_or(Status::INVALID_COMMAND_QUEUE)?;
        state.stats.queues_released += 1;
        Ok(())
    }

    fn flush(&self, queue: RawQueue) -> DriverResult<()> {
        self.state().queue(queue).map(|_| ())
    }

    fn finish(&self, queue: RawQueue) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::Finish)?;
        state.queue(queue).map(|_| ())
    }

    fn create_buffer(&self, context: RawContext, flags: MemFlags, byte_len: usize) -> DriverResult<RawMem> {
        let mut state = self.state();
        state.inject(MockCall::CreateBuffer)?;
        if !state.contexts.contains_key(&context.raw()) {
            return Err(Status::INVALID_CONTEXT);
        }
        if byte_len == 0 || byte_len > MOCK_MAX_ALLOC {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        let access = [MemFlags::READ_WRITE, MemFlags::WRITE_ONLY, MemFlags::READ_ONLY];
        if access.iter().filter(|f| flags.contains(**f)).count() > 1 {
            return Err(Status::INVALID_VALUE);
        }
        let id = state.next_id();
        state.buffers.insert(
            id,
            MockBuffer {
                context: context.raw(),
                data: vec![0; byte_len],
            },
        );
        state.stats.buffers_created += 1;
        Ok(RawMem::from_raw(id))
    }

    fn release_buffer(&self, mem: RawMem) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::ReleaseBuffer)?;
        state
            .buffers
            .remove(&mem.raw())
            .ok_or(Status::INVALID_MEM_OBJECT)?;
        state.stats.buffers_released += 1;
        Ok(())
    }

    unsafe fn enqueue_write_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        _blocking: bool,
        offset: usize,
        src: &[u8],
    ) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::WriteBuffer)?;
        let context = state.queue(queue)?.context;
        check_range(offset, src.len(), state.buffer_in(mem, context)?.data.len())?;
        if let Some(buffer) = state.buffers.get_mut(&mem.raw()) {
            buffer.data[offset..offset + src.len()].copy_from_slice(src);
        }
        state.stats.bytes_written += src.len() as u64;
        Ok(())
    }

    unsafe fn enqueue_read_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        _blocking: bool,
        offset: usize,
        dst: &mut [u8],
    ) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::ReadBuffer)?;
        let context = state.queue(queue)?.context;
        let buffer = state.buffer_in(mem, context)?;
        check_range(offset, dst.len(), buffer.data.len())?;
        dst.copy_from_slice(&buffer.data[offset..offset + dst.len()]);
        state.stats.bytes_read += dst.len() as u64;
        Ok(())
    }

    fn enqueue_copy_buffer(
        &self,
        queue: RawQueue,
        src: RawMem,
        dst: RawMem,
        byte_len: usize,
    ) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::CopyBuffer)?;
        let context = state.queue(queue)?.context;
        if src == dst {
            return Err(Status::MEM_COPY_OVERLAP);
        }
        check_range(0, byte_len, state.buffer_in(dst, context)?.data.len())?;
        let bytes = {
            let source = state.buffer_in(src, context)?;
            check_range(0, byte_len, source.data.len())?;
            source.data[..byte_len].to_vec()
        };
        if let Some(target) = state.buffers.get_mut(&dst.raw()) {
            target.data[..byte_len].copy_from_slice(&bytes);
        }
        state.stats.bytes_copied += byte_len as u64;
        Ok(())
    }

    fn enqueue_fill_buffer(
        &self,
        queue: RawQueue,
        mem: RawMem,
        pattern: &[u8],
        byte_len: usize,
    ) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::FillBuffer)?;
        let context = state.queue(queue)?.context;
        if pattern.is_empty() || byte_len % pattern.len() != 0 {
            return Err(Status::INVALID_VALUE);
        }
        check_range(0, byte_len, state.buffer_in(mem, context)?.data.len())?;
        if let Some(buffer) = state.buffers.get_mut(&mem.raw()) {
            for chunk in buffer.data[..byte_len].chunks_exact_mut(pattern.len()) {
                chunk.copy_from_slice(pattern);
            }
        }
        state.stats.fills += 1;
        Ok(())
    }

    fn create_program_with_source(&self, context: RawContext, sources: &[&str]) -> DriverResult<RawProgram> {
        let mut state = self.state();
        state.inject(MockCall::CreateProgram)?;
        let devices = state
            .contexts
            .get(&context.raw())
            .ok_or(Status::INVALID_CONTEXT)?
            .devices
            .clone();
        if sources.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        let id = state.next_id();
        state.programs.insert(
            id,
            MockProgram {
                origin: Origin::Source(sources.concat()),
                devices,
                builds: HashMap::new(),
            },
        );
        state.stats.programs_created += 1;
        Ok(RawProgram::from_raw(id))
    }

    fn create_program_with_binary(
        &self,
        context: RawContext,
        binaries: &[(DeviceId, &[u8])],
    ) -> Result<RawProgram, BinaryLoadFailure> {
        let mut state = self.state();
        state.inject(MockCall::CreateProgram)?;
        let ctx_devices = state
            .contexts
            .get(&context.raw())
            .ok_or(Status::INVALID_CONTEXT)?
            .devices
            .clone();
        if binaries.is_empty() {
            return Err(Status::INVALID_VALUE.into());
        }
        let mut texts = HashMap::new();
        for (index, (device, binary)) in binaries.iter().enumerate() {
            if !ctx_devices.contains(device) {
                return Err(Status::INVALID_DEVICE.into());
            }
            let text = binary
                .strip_prefix(MOCK_BINARY_MAGIC)
                .and_then(|body| std::str::from_utf8(body).ok())
                .ok_or(BinaryLoadFailure {
                    device_index: Some(index),
                    status: Status::INVALID_BINARY,
                })?;
            texts.insert(*device, text.to_string());
        }
        let id = state.next_id();
        state.programs.insert(
            id,
            MockProgram {
                origin: Origin::Binary(texts),
                devices: binaries.iter().map(|(d, _)| *d).collect(),
                builds: HashMap::new(),
            },
        );
        state.stats.programs_created += 1;
        Ok(RawProgram::from_raw(id))
    }

    fn release_program(&self, program: RawProgram) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::ReleaseProgram)?;
        state
            .programs
            .remove(&program.raw())
            .ok_or(Status::INVALID_PROGRAM)?;
        state.stats.programs_released += 1;
        Ok(())
    }

    fn build_program(&self, program: RawProgram, devices: &[DeviceId], options: &str) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::BuildProgram)?;
        let options = BuildOptions::parse(options).map_err(|_| Status::INVALID_BUILD_OPTIONS)?;
        let prog = state
            .programs
            .get_mut(&program.raw())
            .ok_or(Status::INVALID_PROGRAM)?;
        if devices.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        if let Some(stranger) = devices.iter().find(|d| !prog.devices.contains(d)) {
            trace!(device = ?stranger, "device not associated with program");
            return Err(Status::INVALID_DEVICE);
        }

        let mut failed = false;
        for &device in devices {
            let source = match &prog.origin {
                Origin::Source(text) => text.as_str(),
                Origin::Binary(texts) => texts.get(&device).map_or("", String::as_str),
            };
            let outcome = clc::compile(source, &options);
            let status = if outcome.unit.is_some() {
                BuildStatus::Success
            } else {
                failed = true;
                BuildStatus::Error
            };
            prog.builds.insert(
                device,
                DeviceBuild {
                    status,
                    log: outcome.log,
                    unit: outcome.unit,
                },
            );
        }
        state.stats.builds += 1;
        if failed {
            Err(Status::BUILD_PROGRAM_FAILURE)
        } else {
            Ok(())
        }
    }

    fn program_build_status(&self, program: RawProgram, device: DeviceId) -> DriverResult<BuildStatus> {
        let state = self.state();
        let prog = state
            .programs
            .get(&program.raw())
            .ok_or(Status::INVALID_PROGRAM)?;
        if !prog.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        Ok(prog
            .builds
            .get(&device)
            .map_or(BuildStatus::None, |b| b.status))
    }

    fn program_build_log(&self, program: RawProgram, device: DeviceId) -> DriverResult<Vec<u8>> {
        let state = self.state();
        let prog = state
            .programs
            .get(&program.raw())
            .ok_or(Status::INVALID_PROGRAM)?;
        if !prog.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        Ok(with_terminator(
            prog.builds.get(&device).map_or("", |b| b.log.as_str()),
        ))
    }

    fn program_binaries(&self, program: RawProgram) -> DriverResult<Vec<(DeviceId, Vec<u8>)>> {
        let state = self.state();
        let prog = state
            .programs
            .get(&program.raw())
            .ok_or(Status::INVALID_PROGRAM)?;
        Ok(prog
            .devices
            .iter()
            .map(|device| {
                let binary = match prog.builds.get(device).and_then(|b| b.unit.as_ref()) {
                    Some(unit) => [MOCK_BINARY_MAGIC, unit.text.as_bytes()].concat(),
                    None => Vec::new(),
                };
                (*device, binary)
            })
            .collect())
    }

    fn create_kernel(&self, program: RawProgram, name: &str) -> DriverResult<RawKernel> {
        let mut state = self.state();
        state.inject(MockCall::CreateKernel)?;
        let prog = state
            .programs
            .get(&program.raw())
            .ok_or(Status::INVALID_PROGRAM)?;
        let mut units = prog.builds.values().filter_map(|b| b.unit.as_ref()).peekable();
        if units.peek().is_none() {
            return Err(Status::INVALID_PROGRAM_EXECUTABLE);
        }
        let (decl, arg_info) = units
            .find_map(|u| {
                u.kernels
                    .iter()
                    .find(|k| k.name == name)
                    .map(|k| (k.clone(), u.arg_info))
            })
            .ok_or(Status::INVALID_KERNEL_NAME)?;
        let id = state.next_id();
        let args = vec![None; decl.params.len()];
        state.kernels.insert(
            id,
            MockKernel {
                decl,
                arg_info,
                args,
            },
        );
        state.stats.kernels_created += 1;
        Ok(RawKernel::from_raw(id))
    }

    fn release_kernel(&self, kernel: RawKernel) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::ReleaseKernel)?;
        state
            .kernels
            .remove(&kernel.raw())
            .ok_or(Status::INVALID_KERNEL)?;
        state.stats.kernels_released += 1;
        Ok(())
    }

    fn kernel_function_name(&self, kernel: RawKernel) -> DriverResult<Vec<u8>> {
        let state = self.state();
        let k = state.kernels.get(&kernel.raw()).ok_or(Status::INVALID_KERNEL)?;
        Ok(with_terminator(&k.decl.name))
    }

    fn kernel_num_args(&self, kernel: RawKernel) -> DriverResult<u32> {
        let state = self.state();
        let k = state.kernels.get(&kernel.raw()).ok_or(Status::INVALID_KERNEL)?;
        u32::try_from(k.decl.params.len()).map_err(|_| Status::OUT_OF_RESOURCES)
    }

    fn kernel_arg_name(&self, kernel: RawKernel, index: u32) -> DriverResult<Vec<u8>> {
        let state = self.state();
        let k = state.kernels.get(&kernel.raw()).ok_or(Status::INVALID_KERNEL)?;
        if !k.arg_info {
            return Err(Status::KERNEL_ARG_INFO_NOT_AVAILABLE);
        }
        k.decl
            .params
            .get(index as usize)
            .map(|name| with_terminator(name))
            .ok_or(Status::INVALID_ARG_INDEX)
    }

    fn set_kernel_arg(&self, kernel: RawKernel, index: u32, arg: KernelArg<'_>) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::SetKernelArg)?;
        let value = match arg {
            KernelArg::Bytes(bytes) if bytes.is_empty() => return Err(Status::INVALID_ARG_SIZE),
            KernelArg::Bytes(bytes) => MockArg::Bytes(bytes.to_vec()),
            KernelArg::Mem(mem) => {
                if !state.buffers.contains_key(&mem.raw()) {
                    return Err(Status::INVALID_MEM_OBJECT);
                }
                MockArg::Mem(mem)
            }
            KernelArg::Local(0) => return Err(Status::INVALID_ARG_SIZE),
            KernelArg::Local(size) => MockArg::Local(size),
        };
        let k = state
            .kernels
            .get_mut(&kernel.raw())
            .ok_or(Status::INVALID_KERNEL)?;
        let slot = k
            .args
            .get_mut(index as usize)
            .ok_or(Status::INVALID_ARG_INDEX)?;
        *slot = Some(value);
        Ok(())
    }

    fn enqueue_nd_range(
        &self,
        queue: RawQueue,
        kernel: RawKernel,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> DriverResult<()> {
        let mut state = self.state();
        state.inject(MockCall::EnqueueKernel)?;
        let device = state.queue(queue)?.device;
        let k = state.kernels.get(&kernel.raw()).ok_or(Status::INVALID_KERNEL)?;
        if global.is_empty() || global.len() > 3 {
            return Err(Status::INVALID_WORK_DIMENSION);
        }
        if global.contains(&0) {
            return Err(Status::INVALID_GLOBAL_WORK_SIZE);
        }
        if let Some(local) = local {
            if local.len() != global.len()
                || local.contains(&0)
                || global.iter().zip(local).any(|(g, l)| g % l != 0)
                || local.iter().product::<usize>() > MOCK_MAX_WORK_GROUP
            {
                return Err(Status::INVALID_WORK_GROUP_SIZE);
            }
        }
        let args: Vec<MockArg> = k
            .args
            .iter()
            .cloned()
            .collect::<Option<_>>()
            .ok_or(Status::INVALID_KERNEL_ARGS)?;
        let name = k.decl.name.clone();

        state.stats.dispatches += 1;
        state.dispatches.push(DispatchRecord {
            kernel: name.clone(),
            device,
            global: global.to_vec(),
            local: local.map(<[usize]>::to_vec),
            args: args.clone(),
        });

        match self.body(&name) {
            Some(body) => {
                let mut invocation = Invocation {
                    global,
                    local,
                    args: &args,
                    buffers: &mut state.buffers,
                };
                body(&mut invocation)
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOUBLER: &str = "__kernel void double_it(__global uint* data, const uint n) {\n\
        size_t i = get_global_id(0);\n\
        if (i < n) data[i] *= 2;\n\
    }\n";

    fn setup(mock: &MockDriver) -> (RawContext, DeviceId, RawQueue) {
        let platform = mock.platform_ids(10).unwrap()[0];
        let device = mock.device_ids(platform, DeviceType::ALL, 16).unwrap()[0];
        let ctx = mock.create_context(platform, &[device]).unwrap();
        let queue = mock
            .create_command_queue(ctx, device, QueueProperties::empty())
            .unwrap();
        (ctx, device, queue)
    }

    #[test]
    fn empty_driver_reports_platform_not_found() {
        let mock = MockDriver::empty();
        assert_eq!(mock.platform_ids(10), Err(Status::PLATFORM_NOT_FOUND_KHR));
    }

    #[test]
    fn enumeration_respects_caps_and_types() {
        let mock = MockDriver::empty().with_platform(
            "P",
            &[
                ("gpu0", DeviceType::GPU),
                ("cpu0", DeviceType::CPU),
                ("gpu1", DeviceType::GPU),
            ],
        );
        let platform = mock.platform_ids(1).unwrap()[0];
        assert_eq!(mock.device_ids(platform, DeviceType::GPU, 16).unwrap().len(), 2);
        assert_eq!(mock.device_ids(platform, DeviceType::GPU, 1).unwrap().len(), 1);
        assert_eq!(mock.device_ids(platform, DeviceType::DEFAULT, 16).unwrap().len(), 1);
        assert_eq!(
            mock.device_ids(platform, DeviceType::ACCELERATOR, 16),
            Err(Status::DEVICE_NOT_FOUND)
        );
    }

    #[test]
    fn transfers_copy_and_fill() {
        let mock = MockDriver::new();
        let (ctx, _, queue) = setup(&mock);
        let a = mock.create_buffer(ctx, MemFlags::empty(), 8).unwrap();
        let b = mock.create_buffer(ctx, MemFlags::empty(), 8).unwrap();
        unsafe {
            mock.enqueue_write_buffer(queue, a, true, 0, &[1, 2, 3, 4, 5, 6, 7, 8])
                .unwrap();
        }
        mock.enqueue_copy_buffer(queue, a, b, 8).unwrap();
        assert_eq!(mock.buffer_contents(b).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        mock.enqueue_fill_buffer(queue, b, &[9, 0], 8).unwrap();
        let mut out = [0u8; 8];
        unsafe {
            mock.enqueue_read_buffer(queue, b, true, 0, &mut out).unwrap();
        }
        assert_eq!(out, [9, 0, 9, 0, 9, 0, 9, 0]);
        assert_eq!(
            unsafe { mock.enqueue_write_buffer(queue, a, true, 4, &[0; 8]) },
            Err(Status::INVALID_VALUE)
        );
        assert_eq!(mock.enqueue_copy_buffer(queue, a, a, 8), Err(Status::MEM_COPY_OVERLAP));
    }

    #[test]
    fn zero_length_transfers_are_invalid() {
        let mock = MockDriver::new();
        let (ctx, _, queue) = setup(&mock);
        let a = mock.create_buffer(ctx, MemFlags::empty(), 8).unwrap();
        assert_eq!(
            unsafe { mock.enqueue_write_buffer(queue, a, true, 0, &[]) },
            Err(Status::INVALID_VALUE)
        );
        assert_eq!(
            unsafe { mock.enqueue_read_buffer(queue, a, true, 0, &mut []) },
            Err(Status::INVALID_VALUE)
        );
        assert_eq!(mock.stats().bytes_written, 0);
    }

    #[test]
    fn build_and_run_registered_body() {
        let mock = MockDriver::new();
        mock.register_kernel("double_it", |inv| {
            let n = inv.scalar::<u32>(1).ok_or(Status::INVALID_ARG_VALUE)? as usize;
            let mut data = inv.read::<u32>(0).ok_or(Status::INVALID_MEM_OBJECT)?;
            for (i, v) in data.iter_mut().enumerate().take(n.min(inv.work_items())) {
                *v = 2 * (i as u32);
            }
            inv.write(0, &data)
        });
        let (ctx, device, queue) = setup(&mock);
        let program = mock.create_program_with_source(ctx, &[DOUBLER]).unwrap();
        mock.build_program(program, &[device], "").unwrap();
        assert_eq!(mock.program_build_status(program, device), Ok(BuildStatus::Success));
        let kernel = mock.create_kernel(program, "double_it").unwrap();
        assert_eq!(mock.kernel_num_args(kernel), Ok(2));
        assert_eq!(
            mock.kernel_arg_name(kernel, 0),
            Err(Status::KERNEL_ARG_INFO_NOT_AVAILABLE)
        );

        let mem = mock.create_buffer(ctx, MemFlags::empty(), 16).unwrap();
        mock.set_kernel_arg(kernel, 0, KernelArg::Mem(mem)).unwrap();
        assert_eq!(
            mock.enqueue_nd_range(queue, kernel, &[4], None),
            Err(Status::INVALID_KERNEL_ARGS)
        );
        mock.set_kernel_arg(kernel, 1, KernelArg::Bytes(&4u32.to_ne_bytes()))
            .unwrap();
        mock.enqueue_nd_range(queue, kernel, &[4], Some(&[2])).unwrap();
        let out: Vec<u32> = mock
            .buffer_contents(mem)
            .unwrap()
            .chunks_exact(4)
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(out, vec![0, 2, 4, 6]);
        assert_eq!(
            mock.enqueue_nd_range(queue, kernel, &[5], Some(&[2])),
            Err(Status::INVALID_WORK_GROUP_SIZE)
        );
        assert_eq!(mock.dispatches().len(), 1);
    }

    #[test]
    fn binaries_round_trip_and_bad_binary_names_device() {
        let mock = MockDriver::new();
        let (ctx, device, _) = setup(&mock);
        let program = mock.create_program_with_source(ctx, &[DOUBLER]).unwrap();
        mock.build_program(program, &[device], "-cl-kernel-arg-info").unwrap();
        let binaries = mock.program_binaries(program).unwrap();
        assert!(binaries[0].1.starts_with(MOCK_BINARY_MAGIC));

        let reloaded = mock
            .create_program_with_binary(ctx, &[(device, binaries[0].1.as_slice())])
            .unwrap();
        mock.build_program(reloaded, &[device], "-cl-kernel-arg-info").unwrap();
        let kernel = mock.create_kernel(reloaded, "double_it").unwrap();
        assert_eq!(mock.kernel_arg_name(kernel, 1), Ok(b"n\0".to_vec()));

        let err = mock
            .create_program_with_binary(ctx, &[(device, b"garbage".as_slice())])
            .unwrap_err();
        assert_eq!(err.device_index, Some(0));
        assert_eq!(err.status, Status::INVALID_BINARY);
    }

    #[test]
    fn injected_failures_are_one_shot() {
        let mock = MockDriver::new();
        let (ctx, _, _) = setup(&mock);
        mock.fail_next(MockCall::CreateBuffer, Status::MEM_OBJECT_ALLOCATION_FAILURE);
        assert_eq!(
            mock.create_buffer(ctx, MemFlags::empty(), 4),
            Err(Status::MEM_OBJECT_ALLOCATION_FAILURE)
        );
        assert!(mock.create_buffer(ctx, MemFlags::empty(), 4).is_ok());
    }
}
