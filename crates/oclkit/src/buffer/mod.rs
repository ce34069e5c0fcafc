//! Typed device buffers of rank 1, 2 and 3.
//!
//! A [`Buffer`] owns zero or one device allocation of `len() * size_of::<T>()`
//! bytes. Every operation treats an unallocated buffer the same way:
//! transfers, copies and fills do nothing, and binding it to a kernel is an
//! error.

mod host;

pub use host::{HostImage, HostMatrix, HostSink, HostSource, Shape};

use crate::context::Context;
use crate::driver::{MemFlags, RawMem};
use crate::error::{OclError, Result, StatusExt};
use crate::handle::Owned;
use crate::queue::CommandQueue;
use bytemuck::Pod;
use std::fmt;
use std::marker::PhantomData;
use tracing::debug;

mod sealed {
    pub trait Sealed {}

    impl Sealed for [usize; 1] {}
    impl Sealed for [usize; 2] {}
    impl Sealed for [usize; 3] {}
}

/// Dimensions of a buffer: `[len]`, `[width, height]` or
/// `[width, height, depth]`.
pub trait Extent: sealed::Sealed + Copy + Eq + fmt::Debug + Send + Sync + 'static {
    const RANK: usize;

    fn zero() -> Self;

    /// Product of the dimensions, `None` on overflow.
    fn element_count(&self) -> Option<usize> {
        host::element_count(self.to_shape())
    }

    /// Dimensions holding a host payload of `shape`.
    fn from_shape(shape: Shape) -> Result<Self>;

    fn to_shape(&self) -> Shape;
}

impl Extent for [usize; 1] {
    const RANK: usize = 1;

    fn zero() -> Self {
        [0]
    }

    fn from_shape(shape: Shape) -> Result<Self> {
        Ok([host::checked_count(shape)?])
    }

    fn to_shape(&self) -> Shape {
        [self[0], 1, 1]
    }
}

impl Extent for [usize; 2] {
    const RANK: usize = 2;

    fn zero() -> Self {
        [0, 0]
    }

    fn from_shape([width, height, depth]: Shape) -> Result<Self> {
        if depth != 1 {
            return Err(OclError::DimensionMismatch(format!(
                "a 2D buffer cannot hold depth {depth}"
            )));
        }
        Ok([width, height])
    }

    fn to_shape(&self) -> Shape {
        [self[0], self[1], 1]
    }
}

impl Extent for [usize; 3] {
    const RANK: usize = 3;

    fn zero() -> Self {
        [0, 0, 0]
    }

    fn from_shape(shape: Shape) -> Result<Self> {
        Ok(shape)
    }

    fn to_shape(&self) -> Shape {
        *self
    }
}

/// A device allocation of `T` elements with rank-`D` dimensions.
pub struct Buffer<T: Pod, D: Extent> {
    context: Context,
    mem: Option<Owned<RawMem>>,
    dims: D,
    flags: MemFlags,
    _marker: PhantomData<T>,
}

pub type Buffer1D<T> = Buffer<T, [usize; 1]>;
pub type Buffer2D<T> = Buffer<T, [usize; 2]>;
pub type Buffer3D<T> = Buffer<T, [usize; 3]>;

impl<T: Pod, D: Extent> fmt::Debug for Buffer<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("element", &std::any::type_name::<T>())
            .field("dims", &self.dims)
            .field("flags", &self.flags)
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

impl<T: Pod, D: Extent> Buffer<T, D> {
    /// An unallocated buffer.
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            mem: None,
            dims: D::zero(),
            flags: MemFlags::empty(),
            _marker: PhantomData,
        }
    }

    pub fn with_dims(context: &Context, dims: D, flags: MemFlags) -> Result<Self> {
        let mut buffer = Self::new(context);
        buffer.resize(dims, flags)?;
        Ok(buffer)
    }

    /// Give the buffer `dims` and `flags`.
    ///
    /// The allocation is replaced only when the element count or the flags
    /// change; otherwise only the recorded dimensions are updated. On a
    /// failed allocation the buffer is left empty.
    pub fn resize(&mut self, dims: D, flags: MemFlags) -> Result<()> {
        let len = host::checked_count(dims.to_shape())?;
        if len == self.len() && flags == self.flags {
            self.dims = dims;
            return Ok(());
        }

        let previous = self.mem.take();
        self.dims = D::zero();
        self.flags = flags;
        if let Some(previous) = previous {
            previous.release()?;
        }

        let byte_len = len.checked_mul(std::mem::size_of::<T>()).ok_or_else(|| {
            OclError::InvalidArgument(format!("{dims:?} elements overflow the address space"))
        })?;
        if byte_len > 0 {
            let raw = self
                .context
                .driver()
                .create_buffer(self.context.raw()?, flags, byte_len)
                .call("clCreateBuffer()")?;
            self.mem = Some(Owned::new(self.context.driver().clone(), raw));
            debug!(?dims, byte_len, ?flags, "buffer allocated");
        }
        self.dims = dims;
        Ok(())
    }

    /// [`Buffer::resize`] keeping the current flags.
    pub fn alloc(&mut self, dims: D) -> Result<()> {
        self.resize(dims, self.flags)
    }

    /// Grow to hold at least the elements of `dims`. A buffer that is
    /// already large enough, with the same flags, is left untouched.
    pub fn alloc_min(&mut self, dims: D, flags: MemFlags) -> Result<()> {
        if dims.element_count().map_or(true, |n| n > self.len()) || flags != self.flags {
            self.resize(dims, flags)?;
        }
        Ok(())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        // Recorded dimensions were checked by `resize`.
        self.dims.element_count().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }

    pub fn dims(&self) -> D {
        self.dims
    }

    pub fn shape(&self) -> Shape {
        self.dims.to_shape()
    }

    pub fn width(&self) -> usize {
        self.shape()[0]
    }

    pub fn height(&self) -> usize {
        self.shape()[1]
    }

    pub fn depth(&self) -> usize {
        self.shape()[2]
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    pub fn is_allocated(&self) -> bool {
        self.mem.is_some()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub(crate) fn raw_mem(&self) -> Option<RawMem> {
        self.mem.as_ref().map(Owned::get)
    }

    fn check_len(&self, len: usize, what: &str) -> Result<()> {
        if len != self.len() {
            return Err(OclError::DimensionMismatch(format!(
                "{what} holds {len} elements, buffer holds {}",
                self.len()
            )));
        }
        Ok(())
    }

    /// Blocking write of exactly `len()` elements.
    pub fn write(&mut self, queue: &CommandQueue, src: &[T]) -> Result<()> {
        // SAFETY: blocking transfer, `src` is not referenced after return.
        unsafe { self.enqueue_write(queue, src, true) }
    }

    /// Write exactly `len()` elements.
    ///
    /// # Safety
    ///
    /// With `blocking == false`, `src` must stay alive and unmodified until
    /// the queue has completed the transfer.
    pub unsafe fn enqueue_write(&mut self, queue: &CommandQueue, src: &[T], blocking: bool) -> Result<()> {
        let Some(mem) = self.raw_mem() else {
            return Ok(());
        };
        self.check_len(src.len(), "source")?;
        queue
            .driver()
            .enqueue_write_buffer(queue.raw(), mem, blocking, 0, bytemuck::cast_slice(src))
            .call("clEnqueueWriteBuffer()")
    }

    /// Blocking read of exactly `len()` elements.
    pub fn read(&self, queue: &CommandQueue, dst: &mut [T]) -> Result<()> {
        // SAFETY: blocking transfer, `dst` is filled before return.
        unsafe { self.enqueue_read(queue, dst, true) }
    }

    /// Read exactly `len()` elements.
    ///
    /// # Safety
    ///
    /// With `blocking == false`, `dst` must stay alive and must not be read
    /// or moved until the queue has completed the transfer.
    pub unsafe fn enqueue_read(&self, queue: &CommandQueue, dst: &mut [T], blocking: bool) -> Result<()> {
        let Some(mem) = self.raw_mem() else {
            return Ok(());
        };
        self.check_len(dst.len(), "destination")?;
        queue
            .driver()
            .enqueue_read_buffer(queue.raw(), mem, blocking, 0, bytemuck::cast_slice_mut(dst))
            .call("clEnqueueReadBuffer()")
    }

    /// Fit the buffer to `src` and write it.
    ///
    /// A 1D buffer only grows (see [`Buffer::alloc_min`]) and receives
    /// `src` at its start; 2D and 3D buffers take the exact shape of `src`.
    pub fn upload<S>(&mut self, queue: &CommandQueue, src: &S) -> Result<()>
    where
        S: HostSource<T> + ?Sized,
    {
        // SAFETY: blocking transfer.
        unsafe { self.upload_with(queue, src, true) }
    }

    /// Non-blocking [`Buffer::upload`].
    ///
    /// # Safety
    ///
    /// `src` must stay alive and unmodified until the queue has completed the
    /// transfer.
    pub unsafe fn upload_nonblocking<S>(&mut self, queue: &CommandQueue, src: &S) -> Result<()>
    where
        S: HostSource<T> + ?Sized,
    {
        self.upload_with(queue, src, false)
    }

    unsafe fn upload_with<S>(&mut self, queue: &CommandQueue, src: &S, blocking: bool) -> Result<()>
    where
        S: HostSource<T> + ?Sized,
    {
        let dims = D::from_shape(src.shape())?;
        if D::RANK == 1 {
            self.alloc_min(dims, self.flags)?;
        } else {
            self.resize(dims, self.flags)?;
        }
        let Some(mem) = self.raw_mem() else {
            return Ok(());
        };
        let data = src.as_slice();
        if data.is_empty() {
            return Ok(());
        }
        queue
            .driver()
            .enqueue_write_buffer(queue.raw(), mem, blocking, 0, bytemuck::cast_slice(data))
            .call("clEnqueueWriteBuffer()")
    }

    /// Reshape `dst` to this buffer's dimensions and read into it.
    pub fn download<S>(&self, queue: &CommandQueue, dst: &mut S) -> Result<()>
    where
        S: HostSink<T> + ?Sized,
    {
        dst.reshape(self.shape())?;
        self.read(queue, dst.as_mut_slice())
    }

    /// Non-blocking [`Buffer::download`].
    ///
    /// # Safety
    ///
    /// `dst` must stay alive and must not be read or moved until the queue
    /// has completed the transfer.
    pub unsafe fn download_nonblocking<S>(&self, queue: &CommandQueue, dst: &mut S) -> Result<()>
    where
        S: HostSink<T> + ?Sized,
    {
        dst.reshape(self.shape())?;
        self.enqueue_read(queue, dst.as_mut_slice(), false)
    }

    /// Take `other`'s dimensions and copy its contents on the device.
    pub fn copy_from(&mut self, queue: &CommandQueue, other: &Buffer<T, D>) -> Result<()> {
        self.resize(other.dims, self.flags)?;
        let (Some(src), Some(dst)) = (other.raw_mem(), self.raw_mem()) else {
            return Ok(());
        };
        queue
            .driver()
            .enqueue_copy_buffer(queue.raw(), src, dst, self.byte_len())
            .call("clEnqueueCopyBuffer()")
    }

    /// Set every element to `value` on the device.
    pub fn fill(&mut self, queue: &CommandQueue, value: T) -> Result<()> {
        let Some(mem) = self.raw_mem() else {
            return Ok(());
        };
        queue
            .driver()
            .enqueue_fill_buffer(queue.raw(), mem, bytemuck::bytes_of(&value), self.byte_len())
            .call("clEnqueueFillBuffer()")
    }

    pub fn set_zero(&mut self, queue: &CommandQueue) -> Result<()> {
        self.fill(queue, T::zeroed())
    }
}

impl<T: Pod> Buffer<T, [usize; 3]> {
    /// Upload equally shaped matrices as the depth slices of this buffer.
    pub fn upload_stack(&mut self, queue: &CommandQueue, layers: &[HostMatrix<T>]) -> Result<()> {
        let (rows, cols) = layers.first().map_or((0, 0), |m| (m.rows(), m.cols()));
        if let Some(odd) = layers.iter().find(|m| m.rows() != rows || m.cols() != cols) {
            return Err(OclError::DimensionMismatch(format!(
                "stack mixes {rows}x{cols} and {}x{} matrices",
                odd.rows(),
                odd.cols()
            )));
        }
        self.resize([cols, rows, layers.len()], self.flags)?;
        let data: Vec<T> = layers.iter().flat_map(|m| m.data().iter().copied()).collect();
        self.write(queue, &data)
    }

    /// Read the depth slices of this buffer back as matrices.
    pub fn download_stack(&self, queue: &CommandQueue, layers: &mut Vec<HostMatrix<T>>) -> Result<()> {
        let [cols, rows, depth] = self.dims;
        let mut data = vec![T::zeroed(); self.len()];
        self.read(queue, &mut data)?;
        layers.clear();
        if rows * cols == 0 {
            layers.extend((0..depth).map(|_| HostMatrix::new(rows, cols)));
            return Ok(());
        }
        for slice in data.chunks_exact(rows * cols) {
            layers.push(HostMatrix::from_vec(rows, cols, slice.to_vec())?);
        }
        Ok(())
    }
}
