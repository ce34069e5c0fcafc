//! Kernel argument binding and dispatch.

use crate::buffer::{Buffer, Extent};
use crate::context::Context;
use crate::driver::{info_string, KernelArg, RawKernel};
use crate::error::{OclError, Result, StatusExt};
use crate::handle::Owned;
use crate::queue::CommandQueue;
use crate::status::Status;
use bytemuck::Pod;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace};

/// Round `global` up to the next multiple of `local`.
///
/// `None` when `local` is zero or the result does not fit in `usize`.
pub fn ceil_to_multiple(global: usize, local: usize) -> Option<usize> {
    if local == 0 {
        return None;
    }
    global.checked_add((local - global % local) % local)
}

fn ceil_each<const N: usize>(global: [usize; N], local: [usize; N]) -> Result<[usize; N]> {
    let mut rounded = global;
    for (g, &l) in rounded.iter_mut().zip(&local) {
        let size = *g;
        *g = ceil_to_multiple(size, l).ok_or_else(|| {
            OclError::InvalidArgument(format!(
                "cannot round global size {size} up to a multiple of local size {l}"
            ))
        })?;
    }
    Ok(rounded)
}

/// Something that selects a kernel argument slot: an index or, when the
/// program was built with argument names, a name.
pub trait ArgKey {
    fn resolve(&self, kernel: &Kernel) -> Result<u32>;
}

impl ArgKey for u32 {
    fn resolve(&self, kernel: &Kernel) -> Result<u32> {
        kernel.check_index(*self)
    }
}

impl ArgKey for usize {
    fn resolve(&self, kernel: &Kernel) -> Result<u32> {
        let index = u32::try_from(*self).unwrap_or(u32::MAX);
        kernel.check_index(index)
    }
}

impl ArgKey for &str {
    fn resolve(&self, kernel: &Kernel) -> Result<u32> {
        kernel.arg_index(self)
    }
}

impl ArgKey for &String {
    fn resolve(&self, kernel: &Kernel) -> Result<u32> {
        kernel.arg_index(self)
    }
}

#[derive(Debug)]
struct ArgTable {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

/// One entry point extracted from a built [`crate::Program`].
pub struct Kernel {
    context: Context,
    handle: Owned<RawKernel>,
    name: String,
    num_args: u32,
    args: Option<ArgTable>,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("num_args", &self.num_args)
            .field("arg_names", &self.arg_names())
            .finish()
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.arg_names().unwrap_or_default().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(arg)?;
        }
        f.write_str(")")
    }
}

impl Kernel {
    pub(crate) fn from_raw(context: &Context, raw: RawKernel, with_arg_names: bool) -> Result<Self> {
        let driver = context.driver().clone();
        let handle = Owned::new(driver.clone(), raw);

        let name = info_string(
            driver
                .kernel_function_name(raw)
                .call("clGetKernelInfo()")?,
        );
        if name.is_empty() {
            return Err(OclError::MissingKernelName);
        }
        let num_args = driver.kernel_num_args(raw).call("clGetKernelInfo()")?;

        let args = if with_arg_names {
            let mut names = Vec::with_capacity(num_args as usize);
            let mut index = HashMap::with_capacity(num_args as usize);
            for i in 0..num_args {
                let arg = info_string(
                    driver
                        .kernel_arg_name(raw, i)
                        .call("clGetKernelArgInfo()")?,
                );
                if arg.is_empty() {
                    return Err(OclError::MissingArgName {
                        kernel: name,
                        index: i,
                    });
                }
                index.entry(arg.clone()).or_insert(i);
                names.push(arg);
            }
            Some(ArgTable { names, index })
        } else {
            None
        };

        debug!(kernel = %name, num_args, arg_names = args.is_some(), "kernel created");
        Ok(Self {
            context: context.clone(),
            handle,
            name,
            num_args,
            args,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_args(&self) -> u32 {
        self.num_args
    }

    /// Declared argument names, if they were captured.
    pub fn arg_names(&self) -> Option<&[String]> {
        self.args.as_ref().map(|t| t.names.as_slice())
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Slot of the argument declared as `arg`.
    pub fn arg_index(&self, arg: &str) -> Result<u32> {
        let table = self
            .args
            .as_ref()
            .ok_or_else(|| OclError::ArgNamesUnavailable {
                kernel: self.name.clone(),
            })?;
        table
            .index
            .get(arg)
            .copied()
            .ok_or_else(|| OclError::NoSuchArgument {
                kernel: self.name.clone(),
                arg: arg.to_string(),
            })
    }

    fn check_index(&self, index: u32) -> Result<u32> {
        if index >= self.num_args {
            return Err(OclError::ArgIndexOutOfRange {
                kernel: self.name.clone(),
                index,
                count: self.num_args,
            });
        }
        Ok(index)
    }

    /// `name(arg0, arg1, …)`; the list is empty without captured names.
    pub fn signature(&self) -> String {
        self.to_string()
    }

    fn bind(&mut self, index: u32, arg: KernelArg<'_>) -> Result<()> {
        trace!(kernel = %self.name, index, ?arg, "set kernel arg");
        self.handle
            .driver()
            .set_kernel_arg(self.handle.get(), index, arg)
            .map_err(|status| self.dispatch_error("clSetKernelArg()", status))
    }

    /// Bind a by-value argument.
    pub fn set_arg<K: ArgKey, T: Pod>(&mut self, key: K, value: &T) -> Result<()> {
        let index = key.resolve(self)?;
        self.bind(index, KernelArg::Bytes(bytemuck::bytes_of(value)))
    }

    /// Bind a device buffer. The buffer must be allocated.
    pub fn set_buffer<K: ArgKey, T: Pod, D: Extent>(&mut self, key: K, buffer: &Buffer<T, D>) -> Result<()> {
        let index = key.resolve(self)?;
        let mem = buffer.raw_mem().ok_or_else(|| {
            OclError::InvalidArgument(format!(
                "unallocated buffer bound to argument {index} of kernel '{}'",
                self.name
            ))
        })?;
        self.bind(index, KernelArg::Mem(mem))
    }

    /// Bind `bytes` of work-group local memory; no host data is passed.
    pub fn set_local<K: ArgKey>(&mut self, key: K, bytes: usize) -> Result<()> {
        let index = key.resolve(self)?;
        self.bind(index, KernelArg::Local(bytes))
    }

    fn dispatch_error(&self, call: &'static str, status: Status) -> OclError {
        OclError::Dispatch {
            kernel: self.name.clone(),
            call,
            status,
        }
    }

    fn launch(&self, queue: &CommandQueue, global: &[usize], local: Option<&[usize]>) -> Result<()> {
        queue
            .driver()
            .enqueue_nd_range(queue.raw(), self.handle.get(), global, local)
            .map_err(|status| self.dispatch_error("clEnqueueNDRangeKernel()", status))?;
        trace!(kernel = %self.name, ?global, ?local, "kernel enqueued");
        Ok(())
    }

    /// 1D launch; the device picks the work-group size.
    pub fn enqueue(&self, queue: &CommandQueue, global: usize) -> Result<()> {
        self.launch(queue, &[global], None)
    }

    pub fn enqueue_with_local(&self, queue: &CommandQueue, global: usize, local: usize) -> Result<()> {
        self.launch(queue, &[global], Some(&[local]))
    }

    pub fn enqueue_2d(&self, queue: &CommandQueue, global: [usize; 2], local: Option<[usize; 2]>) -> Result<()> {
        self.launch(queue, &global, local.as_ref().map(|l| l.as_slice()))
    }

    pub fn enqueue_3d(&self, queue: &CommandQueue, global: [usize; 3], local: Option<[usize; 3]>) -> Result<()> {
        self.launch(queue, &global, local.as_ref().map(|l| l.as_slice()))
    }

    /// 1D launch with `global` rounded up to a multiple of `local`. The
    /// kernel must ignore work-items past the logical extent.
    pub fn enqueue_ceiled(&self, queue: &CommandQueue, global: usize, local: usize) -> Result<()> {
        let [rounded] = ceil_each([global], [local])?;
        self.enqueue_with_local(queue, rounded, local)
    }

    pub fn enqueue_ceiled_2d(&self, queue: &CommandQueue, global: [usize; 2], local: [usize; 2]) -> Result<()> {
        let rounded = ceil_each(global, local)?;
        self.enqueue_2d(queue, rounded, Some(local))
    }

    pub fn enqueue_ceiled_3d(&self, queue: &CommandQueue, global: [usize; 3], local: [usize; 3]) -> Result<()> {
        let rounded = ceil_each(global, local)?;
        self.enqueue_3d(queue, rounded, Some(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer1D;
    use crate::config::OclConfig;
    use crate::driver::mock::{MockArg, MockCall, MockDriver};
    use crate::driver::MemFlags;
    use crate::program::Program;
    use std::sync::Arc;

    const SCALE: &str = "__kernel void scale(__global float* data, const float factor, __local float* tile) {\n\
        data[get_global_id(0)] *= factor;\n\
    }\n";

    fn kernel(with_arg_names: bool) -> (Arc<MockDriver>, Context, CommandQueue, Kernel) {
        let mock = Arc::new(MockDriver::new());
        let ctx = Context::open(mock.clone(), &OclConfig::default()).unwrap();
        let queue = ctx.create_command_queue_at(0).unwrap();
        let mut program = Program::new(&ctx);
        program.add_source_code(SCALE).unwrap();
        program.create_from_source().unwrap();
        assert!(program.build_for_context(with_arg_names).unwrap());
        let kernel = program.create_kernel("scale").unwrap();
        (mock, ctx, queue, kernel)
    }

    #[test]
    fn ceil_values() {
        assert_eq!(ceil_to_multiple(1000, 64), Some(1024));
        assert_eq!(ceil_to_multiple(1024, 64), Some(1024));
        assert_eq!(ceil_to_multiple(0, 8), Some(0));
        assert_eq!(ceil_to_multiple(1, 1), Some(1));
        assert_eq!(ceil_to_multiple(5, 0), None);
        assert_eq!(ceil_to_multiple(usize::MAX, 2), None);
    }

    #[test]
    fn captures_argument_names() {
        let (_mock, _ctx, _queue, kernel) = kernel(true);
        assert_eq!(kernel.num_args(), 3);
        assert_eq!(kernel.arg_index("factor").unwrap(), 1);
        assert_eq!(kernel.signature(), "scale(data, factor, tile)");
        assert_eq!(kernel.to_string(), "scale(data, factor, tile)");
    }

    #[test]
    fn name_binding_requires_captured_names() {
        let (_mock, _ctx, _queue, mut kernel) = kernel(false);
        assert_eq!(kernel.arg_names(), None);
        assert_eq!(kernel.signature(), "scale()");
        let err = kernel.set_local("tile", 256).unwrap_err();
        assert!(matches!(err, OclError::ArgNamesUnavailable { ref kernel } if kernel == "scale"));
        kernel.set_local(2u32, 256).unwrap();
    }

    #[test]
    fn set_local_by_name() {
        let (mock, ctx, _queue, mut kernel) = kernel(true);
        let data = Buffer1D::<f32>::with_dims(&ctx, [4], MemFlags::empty()).unwrap();
        kernel.set_buffer("data", &data).unwrap();
        kernel.set_arg("factor", &2.0f32).unwrap();

        let err = kernel.set_local("scratch", 64).unwrap_err();
        assert_eq!(err.to_string(), "no such argument 'scratch' in kernel 'scale'");

        let before = mock.kernel_args(kernel.handle.get()).unwrap();
        kernel.set_local("tile", 64).unwrap();
        let after = mock.kernel_args(kernel.handle.get()).unwrap();
        assert_eq!(before[..2], after[..2]);
        assert_eq!(after[2], Some(MockArg::Local(64)));
    }

    #[test]
    fn index_keys_are_bounds_checked() {
        let (_mock, _ctx, _queue, mut kernel) = kernel(false);
        let err = kernel.set_arg(3u32, &1i32).unwrap_err();
        assert!(matches!(
            err,
            OclError::ArgIndexOutOfRange { index: 3, count: 3, .. }
        ));
        assert!(kernel.set_arg(usize::MAX, &1i32).is_err());
    }

    #[test]
    fn unallocated_buffer_cannot_be_bound() {
        let (_mock, ctx, _queue, mut kernel) = kernel(true);
        let empty = Buffer1D::<f32>::new(&ctx);
        let err = kernel.set_buffer(0u32, &empty).unwrap_err();
        assert!(matches!(err, OclError::InvalidArgument(_)));
    }

    #[test]
    fn ceiled_dispatch_rounds_each_dimension() {
        let (mock, ctx, queue, mut kernel) = kernel(true);
        let data = Buffer1D::<f32>::with_dims(&ctx, [1024], MemFlags::empty()).unwrap();
        kernel.set_buffer("data", &data).unwrap();
        kernel.set_arg("factor", &1.0f32).unwrap();
        kernel.set_local("tile", 256).unwrap();

        kernel.enqueue_ceiled(&queue, 1000, 64).unwrap();
        kernel.enqueue_ceiled_2d(&queue, [30, 17], [8, 4]).unwrap();
        kernel.enqueue_ceiled_3d(&queue, [5, 5, 5], [2, 2, 2]).unwrap();
        kernel.enqueue(&queue, 7).unwrap();

        let records = mock.dispatches();
        assert_eq!(records[0].global, vec![1024]);
        assert_eq!(records[0].local, Some(vec![64]));
        assert_eq!(records[1].global, vec![32, 20]);
        assert_eq!(records[2].global, vec![6, 6, 6]);
        assert_eq!(records[3].local, None);
        assert!(records.iter().all(|r| r.kernel == "scale"));

        let err = kernel.enqueue_ceiled(&queue, 10, 0).unwrap_err();
        assert!(matches!(err, OclError::InvalidArgument(_)));
    }

    #[test]
    fn dispatch_errors_name_the_kernel() {
        let (mock, _ctx, queue, kernel) = kernel(false);
        let err = kernel.enqueue(&queue, 16).unwrap_err();
        assert_eq!(
            err.to_string(),
            "clEnqueueNDRangeKernel() failed for kernel 'scale' with CL_INVALID_KERNEL_ARGS"
        );

        mock.fail_next(MockCall::EnqueueKernel, Status::OUT_OF_RESOURCES);
        let err = kernel.enqueue_2d(&queue, [4, 4], None).unwrap_err();
        assert_eq!(err.status(), Some(Status::OUT_OF_RESOURCES));
    }

    #[test]
    fn drop_releases_kernel() {
        let (mock, _ctx, _queue, kernel) = kernel(false);
        assert_eq!(mock.stats().live_kernels(), 1);
        drop(kernel);
        assert_eq!(mock.stats().live_kernels(), 0);
    }
}
