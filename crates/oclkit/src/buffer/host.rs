//! Host-side payload shapes for buffer transfers.
//!
//! Every shape is described as `[width, height, depth]`. Plain slices and
//! vectors are one-dimensional (`[len, 1, 1]`); a [`HostMatrix`] is
//! `[cols, rows, 1]` and can never hold a third dimension.

use crate::error::{OclError, Result};
use bytemuck::Pod;

/// Shape of a host payload, `[width, height, depth]`.
pub type Shape = [usize; 3];

/// A host payload that can be uploaded.
pub trait HostSource<T> {
    fn shape(&self) -> Shape;
    fn as_slice(&self) -> &[T];
}

/// A host payload that can receive a download.
pub trait HostSink<T> {
    /// Resize to `shape`, or fail if the payload cannot take that shape.
    fn reshape(&mut self, shape: Shape) -> Result<()>;
    fn as_mut_slice(&mut self) -> &mut [T];
}

/// Number of elements in `shape`, `None` on overflow.
pub(crate) fn element_count(shape: Shape) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

pub(crate) fn checked_count(shape: Shape) -> Result<usize> {
    element_count(shape).ok_or_else(|| {
        OclError::InvalidArgument(format!("{shape:?} elements overflow the address space"))
    })
}

impl<T: Pod> HostSource<T> for [T] {
    fn shape(&self) -> Shape {
        [self.len(), 1, 1]
    }

    fn as_slice(&self) -> &[T] {
        self
    }
}

/// A slice cannot grow, so the shape must already hold the same number of
/// elements.
impl<T: Pod> HostSink<T> for [T] {
    fn reshape(&mut self, shape: Shape) -> Result<()> {
        let needed = checked_count(shape)?;
        if needed != self.len() {
            return Err(OclError::DimensionMismatch(format!(
                "destination slice holds {} elements, buffer holds {needed}",
                self.len()
            )));
        }
        Ok(())
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
}

impl<T: Pod> HostSource<T> for Vec<T> {
    fn shape(&self) -> Shape {
        [self.len(), 1, 1]
    }

    fn as_slice(&self) -> &[T] {
        self
    }
}

impl<T: Pod> HostSink<T> for Vec<T> {
    fn reshape(&mut self, shape: Shape) -> Result<()> {
        self.resize(checked_count(shape)?, T::zeroed());
        Ok(())
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
}

/// A dense `width × height × depth` volume, x fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct HostImage<T> {
    width: usize,
    height: usize,
    depth: usize,
    data: Vec<T>,
}

impl<T: Pod> HostImage<T> {
    /// A zero-filled image.
    ///
    /// # Panics
    ///
    /// Like `vec!`, when the element count does not fit in memory.
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        let count = element_count([width, height, depth]).unwrap_or(usize::MAX);
        Self {
            width,
            height,
            depth,
            data: vec![T::zeroed(); count],
        }
    }

    pub fn from_vec(width: usize, height: usize, depth: usize, data: Vec<T>) -> Result<Self> {
        if element_count([width, height, depth]) != Some(data.len()) {
            return Err(OclError::DimensionMismatch(format!(
                "{} elements do not fill a {width}x{height}x{depth} image",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            depth,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<&T> {
        if x >= self.width || y >= self.height || z >= self.depth {
            return None;
        }
        self.data.get((z * self.height + y) * self.width + x)
    }
}

impl<T: Pod> HostSource<T> for HostImage<T> {
    fn shape(&self) -> Shape {
        [self.width, self.height, self.depth]
    }

    fn as_slice(&self) -> &[T] {
        &self.data
    }
}

impl<T: Pod> HostSink<T> for HostImage<T> {
    fn reshape(&mut self, shape: Shape) -> Result<()> {
        let count = checked_count(shape)?;
        [self.width, self.height, self.depth] = shape;
        self.data.resize(count, T::zeroed());
        Ok(())
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

/// A dense row-major `rows × cols` matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct HostMatrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Pod> HostMatrix<T> {
    /// A zero-filled matrix.
    ///
    /// # Panics
    ///
    /// Like `vec!`, when the element count does not fit in memory.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![T::zeroed(); rows.checked_mul(cols).unwrap_or(usize::MAX)],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(OclError::DimensionMismatch(format!(
                "{} elements do not fill a {rows}x{cols} matrix",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.data.get(row * self.cols + col)
    }
}

impl<T: Pod> HostSource<T> for HostMatrix<T> {
    fn shape(&self) -> Shape {
        [self.cols, self.rows, 1]
    }

    fn as_slice(&self) -> &[T] {
        &self.data
    }
}

impl<T: Pod> HostSink<T> for HostMatrix<T> {
    fn reshape(&mut self, [width, height, depth]: Shape) -> Result<()> {
        if depth != 1 {
            return Err(OclError::DimensionMismatch(format!(
                "a matrix has no third dimension (buffer depth is {depth})"
            )));
        }
        let count = checked_count([width, height, depth])?;
        self.rows = height;
        self.cols = width;
        self.data.resize(count, T::zeroed());
        Ok(())
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes() {
        let v = vec![1u32, 2, 3];
        assert_eq!(v.shape(), [3, 1, 1]);
        assert_eq!(v.as_slice().shape(), [3, 1, 1]);
        let m = HostMatrix::<f32>::new(2, 5);
        assert_eq!(m.shape(), [5, 2, 1]);
        let img = HostImage::<u8>::new(4, 3, 2);
        assert_eq!(img.shape(), [4, 3, 2]);
        assert_eq!(img.data().len(), 24);
    }

    #[test]
    fn matrix_rejects_depth() {
        let mut m = HostMatrix::<f32>::new(1, 1);
        let err = m.reshape([4, 4, 2]).unwrap_err();
        assert!(matches!(err, OclError::DimensionMismatch(_)));
        m.reshape([3, 2, 1]).unwrap();
        assert_eq!((m.rows(), m.cols(), m.data().len()), (2, 3, 6));
    }

    #[test]
    fn slice_sink_needs_exact_length() {
        let mut storage = [0i32; 4];
        let slice: &mut [i32] = &mut storage;
        assert!(slice.reshape([2, 2, 1]).is_ok());
        assert!(slice.reshape([5, 1, 1]).is_err());
    }

    #[test]
    fn vec_sink_resizes() {
        let mut v: Vec<u16> = vec![7; 2];
        v.reshape([2, 3, 1]).unwrap();
        assert_eq!(v, vec![7, 7, 0, 0, 0, 0]);
    }

    #[test]
    fn overflowing_shapes_are_errors() {
        assert_eq!(element_count([usize::MAX, 2, 1]), None);
        assert_eq!(element_count([usize::MAX, 1, 1]), Some(usize::MAX));

        let mut v: Vec<u8> = Vec::new();
        assert!(matches!(v.reshape([usize::MAX, 2, 1]), Err(OclError::InvalidArgument(_))));
        let mut img = HostImage::<u8>::new(1, 1, 1);
        assert!(img.reshape([usize::MAX, usize::MAX, 1]).is_err());
        assert_eq!(img.shape(), [1, 1, 1]);
        let mut m = HostMatrix::<u8>::new(1, 1);
        assert!(m.reshape([usize::MAX, 3, 1]).is_err());
        assert!(HostMatrix::from_vec(usize::MAX, 2, vec![0u8; 2]).is_err());
        assert!(HostImage::from_vec(usize::MAX, 2, 1, vec![0u8; 2]).is_err());
    }

    #[test]
    fn indexing() {
        let m = HostMatrix::from_vec(2, 3, vec![0, 1, 2, 10, 11, 12]).unwrap();
        assert_eq!(m.get(1, 2), Some(&12));
        assert_eq!(m.get(2, 0), None);
        let img = HostImage::from_vec(2, 2, 2, (0u8..8).collect()).unwrap();
        assert_eq!(img.get(1, 0, 1), Some(&5));
        assert!(HostImage::from_vec(2, 2, 2, vec![0u8; 7]).is_err());
    }
}
