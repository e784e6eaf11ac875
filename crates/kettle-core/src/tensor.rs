// HostTensor — a flat f32 buffer that either owns its storage or borrows it
//
// Networks are executed as a fixed chain of operators over flat buffers. A
// tensor is nothing more than a count plus storage, but the storage comes in
// two flavours:
//
//   Owned     the tensor allocated the buffer and frees it on drop
//   Borrowed  the tensor is a window onto someone else's buffer
//
// Views (`sub_view`, `chunked_tensors`) borrow the parent mutably, so the
// parent cannot be read, written or dropped while a view is alive. Writes
// through a view land in the parent's storage and become visible once the
// view goes out of scope.
//
// Arithmetic comes in two forms: in-place methods that mutate `self` and
// return `&mut Self` for chaining, and functional forms (`&a + &b`,
// `unary`) that allocate a fresh owned tensor.

use std::fmt;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Sub, SubAssign};

use crate::error::{Error, Result};
use crate::op::{BinaryOp, UnaryOp};
use crate::stats::ChannelStats;

enum Buffer<'a> {
    Owned(Vec<f32>),
    Borrowed(&'a mut [f32]),
}

/// A flat host buffer of `f32` values.
pub struct HostTensor<'a> {
    buf: Buffer<'a>,
}

impl HostTensor<'static> {
    /// Allocate `count` elements set to `value`.
    pub fn full(count: usize, value: f32) -> Self {
        Self::from_vec(vec![value; count])
    }

    pub fn zeros(count: usize) -> Self {
        Self::full(count, 0.0)
    }

    /// Take ownership of an existing vector.
    pub fn from_vec(data: Vec<f32>) -> Self {
        HostTensor {
            buf: Buffer::Owned(data),
        }
    }

    /// Copy `data` into a new owned tensor.
    pub fn from_slice(data: &[f32]) -> Self {
        Self::from_vec(data.to_vec())
    }
}

impl<'a> HostTensor<'a> {
    /// Wrap caller-owned memory without copying it.
    pub fn borrowed(data: &'a mut [f32]) -> Self {
        HostTensor {
            buf: Buffer::Borrowed(data),
        }
    }

    pub fn count(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.buf, Buffer::Owned(_))
    }

    pub fn as_slice(&self) -> &[f32] {
        match &self.buf {
            Buffer::Owned(v) => v,
            Buffer::Borrowed(s) => s,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        match &mut self.buf {
            Buffer::Owned(v) => v,
            Buffer::Borrowed(s) => s,
        }
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.as_slice().to_vec()
    }

    /// Consume the tensor; borrowed storage is copied out.
    pub fn into_vec(self) -> Vec<f32> {
        match self.buf {
            Buffer::Owned(v) => v,
            Buffer::Borrowed(s) => s.to_vec(),
        }
    }

    /// Deep copy into a new owned tensor, regardless of how `self` is stored.
    pub fn duplicate(&self) -> HostTensor<'static> {
        HostTensor::from_slice(self.as_slice())
    }

    // View methods

    /// Non-owning window of `len` elements starting at `offset`.
    pub fn sub_view(&mut self, offset: usize, len: usize) -> Result<HostTensor<'_>> {
        let count = self.count();
        let end = offset.checked_add(len).filter(|&e| e <= count);
        match end {
            Some(end) => Ok(HostTensor::borrowed(&mut self.as_mut_slice()[offset..end])),
            None => Err(Error::msg(format!(
                "sub_view [{offset}, {offset}+{len}) out of range for {count} elements"
            ))),
        }
    }

    /// Split into `pieces` equal, contiguous, non-owning views.
    pub fn chunked_tensors(&mut self, pieces: usize) -> Result<Vec<HostTensor<'_>>> {
        let count = self.count();
        if pieces == 0 || count % pieces != 0 {
            return Err(Error::ChunkMismatch { count, pieces });
        }
        let step = count / pieces;
        if step == 0 {
            return Ok((0..pieces).map(|_| HostTensor::borrowed(&mut [])).collect());
        }
        Ok(self
            .as_mut_slice()
            .chunks_exact_mut(step)
            .map(HostTensor::borrowed)
            .collect())
    }

    // Data movement

    /// Overwrite this tensor's contents with `other`'s.
    pub fn copy_data(&mut self, other: &HostTensor<'_>) -> Result<()> {
        crate::ensure_count!(self.count(), other.count());
        self.as_mut_slice().copy_from_slice(other.as_slice());
        Ok(())
    }

    /// Fill every element with `value`.
    pub fn set(&mut self, value: f32) -> &mut Self {
        self.as_mut_slice().fill(value);
        self
    }

    // Element-wise arithmetic

    pub fn unary_inplace(&mut self, op: UnaryOp) -> &mut Self {
        for x in self.as_mut_slice() {
            *x = op.apply(*x);
        }
        self
    }

    pub fn unary(&self, op: UnaryOp) -> HostTensor<'static> {
        HostTensor::from_vec(self.as_slice().iter().map(|&x| op.apply(x)).collect())
    }

    /// `self = self (op) other`. Both tensors must hold the same count.
    pub fn binary_inplace(&mut self, op: BinaryOp, other: &HostTensor<'_>) -> &mut Self {
        assert_eq!(self.count(), other.count(), "binary {op:?} on unequal counts");
        for (a, &b) in self.as_mut_slice().iter_mut().zip(other.as_slice()) {
            *a = op.apply(*a, b);
        }
        self
    }

    pub fn binary(&self, op: BinaryOp, other: &HostTensor<'_>) -> HostTensor<'static> {
        let mut out = self.duplicate();
        out.binary_inplace(op, other);
        out
    }

    pub fn add_scalar(&mut self, s: f32) -> &mut Self {
        self.unary_inplace(UnaryOp::AddScalar(s))
    }

    pub fn mul_scalar(&mut self, s: f32) -> &mut Self {
        self.unary_inplace(UnaryOp::MulScalar(s))
    }

    pub fn sqr(&mut self) -> &mut Self {
        self.unary_inplace(UnaryOp::Sqr)
    }

    pub fn sqrt(&mut self) -> &mut Self {
        self.unary_inplace(UnaryOp::Sqrt)
    }

    pub fn abs(&mut self) -> &mut Self {
        self.unary_inplace(UnaryOp::Abs)
    }

    pub fn exp(&mut self) -> &mut Self {
        self.unary_inplace(UnaryOp::Exp)
    }

    pub fn log(&mut self) -> &mut Self {
        self.unary_inplace(UnaryOp::Log)
    }

    pub fn powx(&mut self, p: f32) -> &mut Self {
        self.unary_inplace(UnaryOp::Powx(p))
    }

    pub fn tanh(&mut self) -> &mut Self {
        self.unary_inplace(UnaryOp::Tanh)
    }

    pub fn sigmoid(&mut self) -> &mut Self {
        self.unary_inplace(UnaryOp::Sigmoid)
    }

    pub fn elu(&mut self, alpha: f32) -> &mut Self {
        self.unary_inplace(UnaryOp::Elu(alpha))
    }

    pub fn relu(&mut self, negative_slope: f32) -> &mut Self {
        self.unary_inplace(UnaryOp::Relu(negative_slope))
    }

    /// Replace every element with its reciprocal.
    pub fn inv(&mut self) -> &mut Self {
        self.unary_inplace(UnaryOp::Inv)
    }

    // Per-channel helpers
    //
    // The buffer is read as `[outer, channels, spatial]`; `outer` is whatever
    // is left after dividing the count by `channels * spatial`.

    /// Subtract `per_channel[c]` from every element of channel `c`.
    pub fn channeled_sub(&mut self, per_channel: &[f32], spatial: usize) -> &mut Self {
        self.for_each_channel(per_channel.len(), spatial, |c, plane| {
            let m = per_channel[c];
            plane.iter_mut().for_each(|x| *x -= m);
        })
    }

    /// Multiply every element of channel `c` by `scale[c]`.
    pub fn channeled_scale(&mut self, scale: &[f32], spatial: usize) -> &mut Self {
        self.for_each_channel(scale.len(), spatial, |c, plane| {
            let s = scale[c];
            plane.iter_mut().for_each(|x| *x *= s);
        })
    }

    /// `x = x * scale[c] + bias[c]` over channel `c`.
    pub fn channeled_scale_add(&mut self, scale: &[f32], bias: &[f32], spatial: usize) -> &mut Self {
        debug_assert_eq!(scale.len(), bias.len());
        self.for_each_channel(scale.len(), spatial, |c, plane| {
            let (s, b) = (scale[c], bias[c]);
            plane.iter_mut().for_each(|x| *x = *x * s + b);
        })
    }

    fn for_each_channel(
        &mut self,
        channels: usize,
        spatial: usize,
        mut f: impl FnMut(usize, &mut [f32]),
    ) -> &mut Self {
        if channels == 0 || spatial == 0 {
            return self;
        }
        for (i, plane) in self.as_mut_slice().chunks_exact_mut(spatial).enumerate() {
            f(i % channels, plane);
        }
        self
    }

    /// Per-channel mean and (biased) variance of a `[num, channels, spatial]`
    /// buffer, computed by two-stage mat-vec reduction.
    pub fn mean_var(&self, num: usize, channels: usize, spatial: usize) -> Result<(Vec<f32>, Vec<f32>)> {
        crate::ensure_count!(num * channels * spatial, self.count());
        let mut stats = ChannelStats::new(num, channels, spatial);
        let mut mean = vec![0.0; channels];
        let mut var = vec![0.0; channels];
        stats.mean_var(self.as_slice(), &mut mean, &mut var);
        Ok((mean, var))
    }
}

impl fmt::Debug for HostTensor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTensor")
            .field("count", &self.count())
            .field("owned", &self.is_owned())
            .finish()
    }
}

impl Clone for HostTensor<'static> {
    fn clone(&self) -> Self {
        self.duplicate()
    }
}

macro_rules! binary_traits {
    ($trait:ident, $method:ident, $assign:ident, $assign_method:ident, $op:expr) => {
        impl $assign<&HostTensor<'_>> for HostTensor<'_> {
            fn $assign_method(&mut self, rhs: &HostTensor<'_>) {
                self.binary_inplace($op, rhs);
            }
        }

        impl $trait<&HostTensor<'_>> for &HostTensor<'_> {
            type Output = HostTensor<'static>;

            fn $method(self, rhs: &HostTensor<'_>) -> HostTensor<'static> {
                self.binary($op, rhs)
            }
        }
    };
}

binary_traits!(Add, add, AddAssign, add_assign, BinaryOp::Add);
binary_traits!(Sub, sub, SubAssign, sub_assign, BinaryOp::Sub);
binary_traits!(Mul, mul, MulAssign, mul_assign, BinaryOp::Mul);
binary_traits!(Div, div, DivAssign, div_assign, BinaryOp::Div);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_writes_reach_parent() {
        let mut parent = HostTensor::from_vec(vec![0.0; 6]);
        {
            let mut view = parent.sub_view(2, 3).unwrap();
            assert!(!view.is_owned());
            view.set(7.0);
        }
        assert_eq!(parent.to_vec(), vec![0.0, 0.0, 7.0, 7.0, 7.0, 0.0]);
    }

    #[test]
    fn sub_view_out_of_range() {
        let mut t = HostTensor::zeros(4);
        assert!(t.sub_view(3, 2).is_err());
        assert!(t.sub_view(usize::MAX, 2).is_err());
        assert_eq!(t.sub_view(4, 0).unwrap().count(), 0);
    }

    #[test]
    fn chunks_must_divide() {
        let mut t = HostTensor::zeros(10);
        assert!(matches!(
            t.chunked_tensors(3),
            Err(Error::ChunkMismatch { count: 10, pieces: 3 })
        ));
        assert!(t.chunked_tensors(0).is_err());
    }

    #[test]
    fn chunks_of_empty_tensor() {
        let mut t = HostTensor::zeros(0);
        let chunks = t.chunked_tensors(4).unwrap();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.count() == 0));
    }

    #[test]
    fn duplicate_is_deep() {
        let mut storage = vec![1.0, 2.0];
        let view = HostTensor::borrowed(&mut storage);
        let mut copy = view.duplicate();
        copy.set(9.0);
        assert!(copy.is_owned());
        assert_eq!(view.to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn channeled_scale_add_wraps_channels() {
        // outer = 2, channels = 2, spatial = 2
        let mut t = HostTensor::from_vec(vec![1.0; 8]);
        t.channeled_scale_add(&[2.0, 3.0], &[0.5, -1.0], 2);
        assert_eq!(t.to_vec(), vec![2.5, 2.5, 2.0, 2.0, 2.5, 2.5, 2.0, 2.0]);
    }

    #[test]
    fn mean_var_rejects_bad_geometry() {
        let t = HostTensor::zeros(7);
        assert!(t.mean_var(1, 2, 3).is_err());
    }
}
