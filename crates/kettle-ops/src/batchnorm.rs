// BatchNorm — per-channel normalization for [num, channels, spatial] data
//
// FORMULA:
//   centered = x - mean[c]
//   y        = centered * weight[c] / sqrt(var[c] + eps) + bias[c]
//
// `weight` and `bias` are optional; without a weight the factor is just the
// reciprocal standard deviation. The factor `weight / std` is computed once
// per call (one value per channel), so the per-element work is one multiply
// and one add.
//
// STATISTICS:
//   Without global statistics, mean and variance come from the input itself,
//   reduced over (num, spatial) by two mat-vec passes. With global
//   statistics, the stored mean / variance are used after multiplying by
//   `1 / scale_factor` (the moving-average normaliser saved with them; a zero
//   normaliser yields zero statistics).

use std::cell::RefCell;

use kettle_core::{ChannelStats, Error, HostTensor, Result, WeightBlob, WeightRef};

#[cfg(feature = "cuda")]
use kettle_cuda::{DeviceContext, DeviceTensor, DeviceWeights, KernelArg, KernelLaunch, MathKernel};

use crate::module::{check_param, unary_buffers, Forward};

const OP: &str = "batchnorm";

/// Stored running statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalStats {
    pub mean: WeightRef,
    pub variance: WeightRef,
    /// Moving-average normaliser the stored statistics are divided by.
    pub scale_factor: f32,
}

impl GlobalStats {
    fn multiplier(&self) -> f32 {
        if self.scale_factor == 0.0 {
            0.0
        } else {
            1.0 / self.scale_factor
        }
    }
}

#[derive(Debug)]
struct Scratch {
    stats: ChannelStats,
    mean: Vec<f32>,
    var: Vec<f32>,
    factor: Vec<f32>,
}

/// Batch normalization at inference time.
#[derive(Debug)]
pub struct BatchNorm {
    num: usize,
    channels: usize,
    spatial: usize,
    eps: f32,
    inplace: bool,
    global: Option<GlobalStats>,
    weight: Option<WeightRef>,
    bias: Option<WeightRef>,
    scratch: RefCell<Scratch>,
}

impl BatchNorm {
    /// Normalize `num` samples of `channels` planes of `spatial` values.
    pub fn new(num: usize, channels: usize, spatial: usize, eps: f32) -> Result<Self> {
        if channels == 0 {
            return Err(Error::invalid(OP, "channels must be non-zero"));
        }
        if eps.is_nan() || eps < 0.0 {
            return Err(Error::invalid(OP, format!("eps must be non-negative, got {eps}")));
        }
        tracing::debug!(num, channels, spatial, eps, "batchnorm");
        Ok(BatchNorm {
            num,
            channels,
            spatial,
            eps,
            inplace: false,
            global: None,
            weight: None,
            bias: None,
            scratch: RefCell::new(Scratch {
                stats: ChannelStats::new(num, channels, spatial),
                mean: vec![0.0; channels],
                var: vec![0.0; channels],
                factor: vec![0.0; channels],
            }),
        })
    }

    /// Use stored statistics instead of computing them from the input.
    pub fn with_global_stats(mut self, stats: GlobalStats) -> Result<Self> {
        check_param(OP, "mean", Some(stats.mean), self.channels)?;
        check_param(OP, "variance", Some(stats.variance), self.channels)?;
        self.global = Some(stats);
        Ok(self)
    }

    /// Per-channel affine transform applied after normalizing.
    pub fn with_affine(mut self, weight: Option<WeightRef>, bias: Option<WeightRef>) -> Result<Self> {
        check_param(OP, "weight", weight, self.channels)?;
        check_param(OP, "bias", bias, self.channels)?;
        self.weight = weight;
        self.bias = bias;
        Ok(self)
    }

    pub fn inplace(mut self, inplace: bool) -> Self {
        self.inplace = inplace;
        self
    }

    pub fn uses_global_stats(&self) -> bool {
        self.global.is_some()
    }

    /// Normalize `data` in place.
    fn normalize(&self, weights: &WeightBlob, data: &mut [f32]) -> Result<()> {
        kettle_core::ensure_count!(self.output_count(), data.len());
        let mut guard = self.scratch.borrow_mut();
        let Scratch {
            stats,
            mean,
            var,
            factor,
        } = &mut *guard;

        match &self.global {
            Some(g) => {
                let m = g.multiplier();
                for (dst, &src) in mean.iter_mut().zip(weights.get(g.mean)?) {
                    *dst = src * m;
                }
            }
            None => stats.mean(data, mean),
        }

        let mut t = HostTensor::borrowed(data);
        t.channeled_sub(mean, self.spatial);

        match &self.global {
            Some(g) => {
                let m = g.multiplier();
                for (dst, &src) in var.iter_mut().zip(weights.get(g.variance)?) {
                    *dst = src * m;
                }
            }
            None => stats.mean_of_squares(t.as_slice(), var),
        }

        let weight = weights.get_opt(self.weight)?;
        for (c, f) in factor.iter_mut().enumerate() {
            let w = weight.map_or(1.0, |w| w[c]);
            *f = w / (var[c] + self.eps).sqrt();
        }

        match weights.get_opt(self.bias)? {
            Some(bias) => t.channeled_scale_add(factor, bias, self.spatial),
            None => t.channeled_scale(factor, self.spatial),
        };
        Ok(())
    }
}

impl Forward for BatchNorm {
    fn name(&self) -> &'static str {
        OP
    }

    fn output_count(&self) -> usize {
        self.num * self.channels * self.spatial
    }

    fn forward<'a>(&self, weights: &WeightBlob, input: HostTensor<'a>) -> Result<HostTensor<'a>> {
        let mut out = if self.inplace {
            input
        } else {
            input.duplicate()
        };
        self.normalize(weights, out.as_mut_slice())?;
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
        self.normalize(weights, output)
    }

    #[cfg(feature = "cuda")]
    fn forward_device<'a>(
        &self,
        ctx: &DeviceContext,
        weights: &DeviceWeights,
        input: DeviceTensor<'a>,
    ) -> Result<DeviceTensor<'a>> {
        kettle_core::ensure_count!(self.output_count(), input.count());
        let mut out = if self.inplace {
            input
        } else {
            input.duplicate(ctx)?
        };
        let (num, channels, spatial) = (self.num, self.channels, self.spatial);

        let mean = match &self.global {
            Some(g) => scaled_stats(ctx, weights, g.mean, channels, g.multiplier())?,
            None => out.channel_mean(ctx, num, channels, spatial, false)?,
        };
        out.channeled_sub(ctx, &mean, spatial)?;
        let var = match &self.global {
            Some(g) => scaled_stats(ctx, weights, g.variance, channels, g.multiplier())?,
            None => out.channel_mean(ctx, num, channels, spatial, true)?,
        };

        let factor = DeviceTensor::zeros(ctx, channels)?;
        let weight = weights.ptr_opt(self.weight)?;
        ctx.enqueue(&KernelLaunch::math(
            MathKernel::BnFactor,
            channels,
            vec![
                KernelArg::Buffer(var.device_ptr()),
                KernelArg::Buffer(weight.unwrap_or(0)),
                KernelArg::Buffer(factor.device_ptr()),
                KernelArg::count(channels)?,
                KernelArg::F32(self.eps),
                KernelArg::flag(weight.is_some()),
            ],
        )?)?;
        out.channeled_scale_add(ctx, &factor, weights.ptr_opt(self.bias)?, spatial)?;
        Ok(out)
    }
}

/// Stored statistics times `multiplier`, in a fresh device buffer.
#[cfg(feature = "cuda")]
fn scaled_stats(
    ctx: &DeviceContext,
    weights: &DeviceWeights,
    r: WeightRef,
    channels: usize,
    multiplier: f32,
) -> Result<DeviceTensor<'static>> {
    let src = weights.ptr(r)?;
    // SAFETY: `ptr` bounds-checked `r` against the uploaded blob, which
    // outlives this call; the view is only read.
    let stored = unsafe { DeviceTensor::from_raw(src, channels) };
    stored.unary(ctx, kettle_core::UnaryOp::MulScalar(multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kettle_core::WeightBlobBuilder;

    fn approx(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn batch_statistics_normalize_each_channel() {
        let blob = WeightBlob::default();
        // num = 2, channels = 2, spatial = 2
        let x = vec![1.0, 3.0, 10.0, 10.0, 5.0, 7.0, 20.0, 20.0];
        let bn = BatchNorm::new(2, 2, 2, 0.0).unwrap();
        let y = bn.forward(&blob, HostTensor::from_vec(x)).unwrap().to_vec();
        // channel 0: mean 4, var 5 ; channel 1: mean 15, var 25
        let s0 = 5.0f32.sqrt();
        let want = [-3.0 / s0, -1.0 / s0, -1.0, -1.0, 1.0 / s0, 3.0 / s0, 1.0, 1.0];
        for (g, w) in y.iter().zip(&want) {
            assert!(approx(*g, *w, 1e-5), "{g} vs {w}");
        }
    }

    #[test]
    fn global_stats_use_scale_factor() {
        let mut b = WeightBlobBuilder::new();
        let mean = b.push(&[4.0]);
        let var = b.push(&[8.0]);
        let weight = b.push(&[3.0]);
        let bias = b.push(&[1.0]);
        let blob = b.finish();
        let bn = BatchNorm::new(1, 1, 2, 0.0)
            .unwrap()
            .with_global_stats(GlobalStats {
                mean,
                variance: var,
                scale_factor: 2.0,
            })
            .unwrap()
            .with_affine(Some(weight), Some(bias))
            .unwrap();
        // effective mean 2, variance 4 -> std 2
        let y = bn.forward(&blob, HostTensor::from_vec(vec![2.0, 6.0])).unwrap();
        assert_eq!(y.to_vec(), vec![1.0, 7.0]);
    }

    #[test]
    fn zero_scale_factor_zeroes_statistics() {
        let mut b = WeightBlobBuilder::new();
        let mean = b.push(&[4.0]);
        let var = b.push(&[8.0]);
        let blob = b.finish();
        let bn = BatchNorm::new(1, 1, 1, 1.0)
            .unwrap()
            .with_global_stats(GlobalStats {
                mean,
                variance: var,
                scale_factor: 0.0,
            })
            .unwrap();
        let y = bn.forward(&blob, HostTensor::from_vec(vec![3.0])).unwrap();
        assert_eq!(y.to_vec(), vec![3.0]);
    }

    #[test]
    fn parameter_lengths_are_validated() {
        let mut b = WeightBlobBuilder::new();
        let short = b.push(&[1.0]);
        let bn = BatchNorm::new(1, 2, 1, 1e-5).unwrap();
        assert!(bn.with_affine(Some(short), None).is_err());
        assert!(BatchNorm::new(1, 0, 1, 1e-5).is_err());
        assert!(BatchNorm::new(1, 1, 1, -1.0).is_err());
    }

    #[test]
    fn inplace_writes_through_borrowed_input() {
        let blob = WeightBlob::default();
        let mut storage = vec![1.0, 3.0];
        let bn = BatchNorm::new(1, 1, 2, 0.0).unwrap().inplace(true);
        let out = bn.forward(&blob, HostTensor::borrowed(&mut storage)).unwrap();
        assert!(!out.is_owned());
        drop(out);
        assert_eq!(storage, vec![-1.0, 1.0]);
    }
}
