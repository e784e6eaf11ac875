// Scale — per-channel affine transform over [outer, scale_dim, inner]
//
//   y[o, s, i] = x[o, s, i] * scale[s] + bias[s]
//
// Either parameter may be absent. Typically follows a BatchNorm without its
// own affine parameters.

use kettle_core::{Error, HostTensor, Result, WeightBlob, WeightRef};

#[cfg(feature = "cuda")]
use kettle_cuda::{DeviceContext, DeviceTensor, DeviceWeights, KernelArg, KernelLaunch, MathKernel};

use crate::module::{check_param, unary_buffers, Forward};

const OP: &str = "scale";

#[derive(Debug, Clone)]
pub struct Scale {
    outer: usize,
    scale_dim: usize,
    inner: usize,
    scale: Option<WeightRef>,
    bias: Option<WeightRef>,
    inplace: bool,
}

impl Scale {
    pub fn new(
        outer: usize,
        scale_dim: usize,
        inner: usize,
        scale: Option<WeightRef>,
        bias: Option<WeightRef>,
        inplace: bool,
    ) -> Result<Self> {
        if scale_dim == 0 || inner == 0 {
            return Err(Error::invalid(OP, "scale_dim and inner_dim must be non-zero"));
        }
        check_param(OP, "scale", scale, scale_dim)?;
        check_param(OP, "bias", bias, scale_dim)?;
        tracing::debug!(outer, scale_dim, inner, inplace, "scale");
        Ok(Scale {
            outer,
            scale_dim,
            inner,
            scale,
            bias,
            inplace,
        })
    }

    fn apply(&self, weights: &WeightBlob, data: &mut [f32]) -> Result<()> {
        kettle_core::ensure_count!(self.output_count(), data.len());
        let scale = weights.get_opt(self.scale)?;
        let bias = weights.get_opt(self.bias)?;
        for (i, plane) in data.chunks_exact_mut(self.inner).enumerate() {
            let s = i % self.scale_dim;
            let (m, b) = (scale.map_or(1.0, |v| v[s]), bias.map_or(0.0, |v| v[s]));
            plane.iter_mut().for_each(|x| *x = *x * m + b);
        }
        Ok(())
    }
}

impl Forward for Scale {
    fn name(&self) -> &'static str {
        OP
    }

    fn output_count(&self) -> usize {
        self.outer * self.scale_dim * self.inner
    }

    fn forward<'a>(&self, weights: &WeightBlob, input: HostTensor<'a>) -> Result<HostTensor<'a>> {
        let mut out = if self.inplace {
            input
        } else {
            input.duplicate()
        };
        self.apply(weights, out.as_mut_slice())?;
        Ok(out)
    }

    fn forward_buffers(
        &self,
        weights: &WeightBlob,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<()> {
        let (input, output) = unary_buffers(OP, inputs, outputs)?;
        kettle_core::ensure_count!(input.len(), output.len());
        output.copy_from_slice(input);
        self.apply(weights, output)
    }

    #[cfg(feature = "cuda")]
    fn forward_device<'a>(
        &self,
        ctx: &DeviceContext,
        weights: &DeviceWeights,
        input: DeviceTensor<'a>,
    ) -> Result<DeviceTensor<'a>> {
        kettle_core::ensure_count!(self.output_count(), input.count());
        let out = if self.inplace {
            input
        } else {
            input.duplicate(ctx)?
        };
        let scale = weights.ptr_opt(self.scale)?;
        let bias = weights.ptr_opt(self.bias)?;
        let n = out.count();
        ctx.enqueue(&KernelLaunch::math(
            MathKernel::Scale,
            n,
            vec![
                KernelArg::Buffer(out.device_ptr()),
                KernelArg::Buffer(scale.unwrap_or(0)),
                KernelArg::Buffer(bias.unwrap_or(0)),
                KernelArg::count(n)?,
                KernelArg::count(self.scale_dim)?,
                KernelArg::count(self.inner)?,
                KernelArg::flag(scale.is_some()),
                KernelArg::flag(bias.is_some()),
            ],
        )?)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kettle_core::WeightBlobBuilder;

    #[test]
    fn scale_and_bias_per_channel() {
        let mut b = WeightBlobBuilder::new();
        let s = b.push(&[2.0, -1.0]);
        let bias = b.push(&[0.5, 0.0]);
        let blob = b.finish();
        // outer 2, scale_dim 2, inner 2
        let op = Scale::new(2, 2, 2, Some(s), Some(bias), false).unwrap();
        let y = op.forward(&blob, HostTensor::full(8, 1.0)).unwrap();
        assert_eq!(y.to_vec(), vec![2.5, 2.5, -1.0, -1.0, 2.5, 2.5, -1.0, -1.0]);
    }

    #[test]
    fn bias_only() {
        let mut b = WeightBlobBuilder::new();
        let bias = b.push(&[1.0, 2.0, 3.0]);
        let blob = b.finish();
        let op = Scale::new(1, 3, 1, None, Some(bias), true).unwrap();
        let y = op.forward(&blob, HostTensor::zeros(3)).unwrap();
        assert_eq!(y.to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn rejects_mismatched_parameters() {
        let r = WeightRef::new(0, 2);
        assert!(Scale::new(1, 3, 1, Some(r), None, false).is_err());
        assert!(Scale::new(1, 0, 1, None, None, false).is_err());
    }
}
