// DeviceTensor — flat f32 device buffer, owned or borrowed
//
// Mirrors kettle_core::HostTensor on the GPU. An owned tensor holds a
// `CudaSlice<f32>` and releases it on drop. A borrowed tensor is a device
// address plus a count; its lifetime ties it to the buffer it was carved
// from, so the borrow checker keeps the parent alive and untouched while the
// view exists.
//
// Every operation enqueues kernels on the context's in-order queue and
// returns immediately; `to_vec` is the synchronization point.

use std::marker::PhantomData;

use cudarc::driver::{CudaSlice, DevicePtr, DeviceSlice};

use kettle_core::{BinaryOp, Error, Result, UnaryOp};

use crate::context::DeviceContext;
use crate::launch::{KernelArg, KernelLaunch, MathKernel};

const F32_BYTES: u64 = std::mem::size_of::<f32>() as u64;

enum DeviceBuffer<'a> {
    Owned(CudaSlice<f32>),
    Borrowed {
        ptr: u64,
        _parent: PhantomData<&'a mut CudaSlice<f32>>,
    },
}

/// A flat device buffer of `f32` values.
pub struct DeviceTensor<'a> {
    buf: DeviceBuffer<'a>,
    count: usize,
}

impl DeviceTensor<'static> {
    pub fn zeros(ctx: &DeviceContext, count: usize) -> Result<Self> {
        Ok(DeviceTensor {
            buf: DeviceBuffer::Owned(ctx.alloc_zeros(count)?),
            count,
        })
    }

    pub fn full(ctx: &DeviceContext, count: usize, value: f32) -> Result<Self> {
        let mut t = Self::zeros(ctx, count)?;
        t.set(ctx, value)?;
        Ok(t)
    }

    /// Upload host data into a new owned tensor.
    pub fn from_host(ctx: &DeviceContext, data: &[f32]) -> Result<Self> {
        Ok(DeviceTensor {
            buf: DeviceBuffer::Owned(ctx.upload(data)?),
            count: data.len(),
        })
    }
}

impl<'a> DeviceTensor<'a> {
    /// Borrow an existing device allocation without copying it.
    pub fn borrowed(slice: &'a mut CudaSlice<f32>, count: usize) -> Result<Self> {
        if count > slice.len() {
            return Err(Error::CountMismatch {
                expected: slice.len(),
                got: count,
            });
        }
        Ok(DeviceTensor {
            buf: DeviceBuffer::Borrowed {
                ptr: *slice.device_ptr(),
                _parent: PhantomData,
            },
            count,
        })
    }

    /// Wrap a raw device address.
    ///
    /// # Safety
    /// `ptr` must address at least `count` floats of device memory on the
    /// context this tensor is used with, valid and not otherwise accessed
    /// for `'a`.
    pub unsafe fn from_raw(ptr: u64, count: usize) -> Self {
        DeviceTensor {
            buf: DeviceBuffer::Borrowed {
                ptr,
                _parent: PhantomData,
            },
            count,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.buf, DeviceBuffer::Owned(_))
    }

    /// Device address of the first element.
    pub fn device_ptr(&self) -> u64 {
        match &self.buf {
            DeviceBuffer::Owned(s) => *s.device_ptr(),
            DeviceBuffer::Borrowed { ptr, .. } => *ptr,
        }
    }

    /// Device address of element `offset`.
    pub fn ptr_at(&self, offset: usize) -> u64 {
        self.device_ptr() + offset as u64 * F32_BYTES
    }

    // View methods

    /// Non-owning window of `len` elements starting at `offset`.
    pub fn sub_view(&mut self, offset: usize, len: usize) -> Result<DeviceTensor<'_>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.count => {
                // SAFETY: the range lies inside `self`, which stays mutably
                // borrowed for the view's lifetime.
                Ok(unsafe { DeviceTensor::from_raw(self.ptr_at(offset), len) })
            }
            _ => Err(Error::msg(format!(
                "sub_view [{offset}, {offset}+{len}) out of range for {} elements",
                self.count
            ))),
        }
    }

    /// Split into `pieces` equal, contiguous, non-owning views.
    pub fn chunked_tensors(&mut self, pieces: usize) -> Result<Vec<DeviceTensor<'_>>> {
        if pieces == 0 || self.count % pieces != 0 {
            return Err(Error::ChunkMismatch {
                count: self.count,
                pieces,
            });
        }
        let step = self.count / pieces;
        let base = self.device_ptr();
        // SAFETY: the pieces are disjoint and all inside `self`, which stays
        // mutably borrowed while they live.
        Ok((0..pieces)
            .map(|i| unsafe {
                DeviceTensor::from_raw(base + (i * step) as u64 * F32_BYTES, step)
            })
            .collect())
    }

    // Data movement

    /// Copy the contents back to the host. Blocks until queued work is done.
    pub fn to_vec(&self, ctx: &DeviceContext) -> Result<Vec<f32>> {
        match &self.buf {
            DeviceBuffer::Owned(s) => ctx.download(s, self.count),
            DeviceBuffer::Borrowed { .. } => {
                let owned = self.duplicate(ctx)?;
                owned.to_vec(ctx)
            }
        }
    }

    /// Deep copy into a new owned tensor.
    pub fn duplicate(&self, ctx: &DeviceContext) -> Result<DeviceTensor<'static>> {
        let mut out = DeviceTensor::zeros(ctx, self.count)?;
        out.copy_data(ctx, self)?;
        Ok(out)
    }

    /// Overwrite this tensor's contents with `other`'s.
    pub fn copy_data(&mut self, ctx: &DeviceContext, other: &DeviceTensor<'_>) -> Result<()> {
        kettle_core::ensure_count!(self.count, other.count);
        let launch = KernelLaunch::math(
            MathKernel::Copy,
            self.count,
            vec![
                KernelArg::Buffer(other.device_ptr()),
                KernelArg::Buffer(self.device_ptr()),
                KernelArg::count(self.count)?,
            ],
        )?;
        ctx.enqueue(&launch)
    }

    /// Fill every element with `value`.
    pub fn set(&mut self, ctx: &DeviceContext, value: f32) -> Result<()> {
        let launch = KernelLaunch::math(
            MathKernel::Fill,
            self.count,
            vec![
                KernelArg::Buffer(self.device_ptr()),
                KernelArg::F32(value),
                KernelArg::count(self.count)?,
            ],
        )?;
        ctx.enqueue(&launch)
    }

    // Element-wise arithmetic

    fn unary_into(&self, ctx: &DeviceContext, op: UnaryOp, dst: u64) -> Result<()> {
        let (code, param) = op.code();
        let launch = KernelLaunch::math(
            MathKernel::Unary,
            self.count,
            vec![
                KernelArg::Buffer(self.device_ptr()),
                KernelArg::Buffer(dst),
                KernelArg::count(self.count)?,
                KernelArg::I32(code),
                KernelArg::F32(param),
            ],
        )?;
        ctx.enqueue(&launch)
    }

    pub fn unary_inplace(&mut self, ctx: &DeviceContext, op: UnaryOp) -> Result<()> {
        self.unary_into(ctx, op, self.device_ptr())
    }

    pub fn unary(&self, ctx: &DeviceContext, op: UnaryOp) -> Result<DeviceTensor<'static>> {
        let out = DeviceTensor::zeros(ctx, self.count)?;
        self.unary_into(ctx, op, out.device_ptr())?;
        Ok(out)
    }

    fn binary_into(
        &self,
        ctx: &DeviceContext,
        op: BinaryOp,
        other: &DeviceTensor<'_>,
        dst: u64,
    ) -> Result<()> {
        kettle_core::ensure_count!(self.count, other.count);
        let launch = KernelLaunch::math(
            MathKernel::Binary,
            self.count,
            vec![
                KernelArg::Buffer(self.device_ptr()),
                KernelArg::Buffer(other.device_ptr()),
                KernelArg::Buffer(dst),
                KernelArg::count(self.count)?,
                KernelArg::I32(op.code()),
            ],
        )?;
        ctx.enqueue(&launch)
    }

    /// `self = self (op) other`.
    pub fn binary_inplace(
        &mut self,
        ctx: &DeviceContext,
        op: BinaryOp,
        other: &DeviceTensor<'_>,
    ) -> Result<()> {
        self.binary_into(ctx, op, other, self.device_ptr())
    }

    pub fn binary(
        &self,
        ctx: &DeviceContext,
        op: BinaryOp,
        other: &DeviceTensor<'_>,
    ) -> Result<DeviceTensor<'static>> {
        let out = DeviceTensor::zeros(ctx, self.count)?;
        self.binary_into(ctx, op, other, out.device_ptr())?;
        Ok(out)
    }

    pub fn add_scalar(&mut self, ctx: &DeviceContext, s: f32) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::AddScalar(s))
    }

    pub fn mul_scalar(&mut self, ctx: &DeviceContext, s: f32) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::MulScalar(s))
    }

    pub fn sqr(&mut self, ctx: &DeviceContext) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::Sqr)
    }

    pub fn sqrt(&mut self, ctx: &DeviceContext) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::Sqrt)
    }

    pub fn abs(&mut self, ctx: &DeviceContext) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::Abs)
    }

    pub fn exp(&mut self, ctx: &DeviceContext) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::Exp)
    }

    pub fn log(&mut self, ctx: &DeviceContext) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::Log)
    }

    pub fn powx(&mut self, ctx: &DeviceContext, p: f32) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::Powx(p))
    }

    pub fn tanh(&mut self, ctx: &DeviceContext) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::Tanh)
    }

    pub fn sigmoid(&mut self, ctx: &DeviceContext) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::Sigmoid)
    }

    pub fn elu(&mut self, ctx: &DeviceContext, alpha: f32) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::Elu(alpha))
    }

    pub fn relu(&mut self, ctx: &DeviceContext, negative_slope: f32) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::Relu(negative_slope))
    }

    pub fn inv(&mut self, ctx: &DeviceContext) -> Result<()> {
        self.unary_inplace(ctx, UnaryOp::Inv)
    }

    // Per-channel helpers over [outer, channels, spatial]

    pub fn channeled_sub(
        &mut self,
        ctx: &DeviceContext,
        per_channel: &DeviceTensor<'_>,
        spatial: usize,
    ) -> Result<()> {
        let launch = KernelLaunch::math(
            MathKernel::ChanneledSub,
            self.count,
            vec![
                KernelArg::Buffer(self.device_ptr()),
                KernelArg::Buffer(per_channel.device_ptr()),
                KernelArg::count(self.count)?,
                KernelArg::count(per_channel.count.max(1))?,
                KernelArg::count(spatial.max(1))?,
            ],
        )?;
        ctx.enqueue(&launch)
    }

    /// `x = x * scale[c] (+ bias[c])`.
    pub fn channeled_scale_add(
        &mut self,
        ctx: &DeviceContext,
        scale: &DeviceTensor<'_>,
        bias: Option<u64>,
        spatial: usize,
    ) -> Result<()> {
        let launch = KernelLaunch::math(
            MathKernel::ChanneledScaleAdd,
            self.count,
            vec![
                KernelArg::Buffer(self.device_ptr()),
                KernelArg::Buffer(scale.device_ptr()),
                KernelArg::Buffer(bias.unwrap_or(0)),
                KernelArg::count(self.count)?,
                KernelArg::count(scale.count.max(1))?,
                KernelArg::count(spatial.max(1))?,
                KernelArg::flag(bias.is_some()),
            ],
        )?;
        ctx.enqueue(&launch)
    }

    /// Per-channel mean of a `[num, channels, spatial]` buffer (of its
    /// squares when `squared`), by the same two-stage reduction as the host.
    pub fn channel_mean(
        &self,
        ctx: &DeviceContext,
        num: usize,
        channels: usize,
        spatial: usize,
        squared: bool,
    ) -> Result<DeviceTensor<'static>> {
        kettle_core::ensure_count!(num * channels * spatial, self.count);
        let rows = DeviceTensor::zeros(ctx, num * channels)?;
        let out = DeviceTensor::zeros(ctx, channels)?;
        let scale = if num * spatial == 0 {
            0.0
        } else {
            1.0 / (num * spatial) as f32
        };
        ctx.enqueue(&KernelLaunch::math(
            MathKernel::ChannelMean,
            num * channels,
            vec![
                KernelArg::Buffer(self.device_ptr()),
                KernelArg::Buffer(rows.device_ptr()),
                KernelArg::count(num * channels)?,
                KernelArg::count(spatial)?,
                KernelArg::F32(scale),
                KernelArg::flag(squared),
            ],
        )?)?;
        ctx.enqueue(&KernelLaunch::math(
            MathKernel::BatchSum,
            channels,
            vec![
                KernelArg::Buffer(rows.device_ptr()),
                KernelArg::Buffer(out.device_ptr()),
                KernelArg::count(num)?,
                KernelArg::count(channels)?,
            ],
        )?)?;
        Ok(out)
    }

    /// Per-channel mean and biased variance.
    pub fn mean_var(
        &self,
        ctx: &DeviceContext,
        num: usize,
        channels: usize,
        spatial: usize,
    ) -> Result<(DeviceTensor<'static>, DeviceTensor<'static>)> {
        let mean = self.channel_mean(ctx, num, channels, spatial, false)?;
        let mut centered = self.duplicate(ctx)?;
        centered.channeled_sub(ctx, &mean, spatial)?;
        let var = centered.channel_mean(ctx, num, channels, spatial, true)?;
        Ok((mean, var))
    }
}

impl std::fmt::Debug for DeviceTensor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("count", &self.count)
            .field("owned", &self.is_owned())
            .finish()
    }
}
