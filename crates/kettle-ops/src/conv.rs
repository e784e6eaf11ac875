// Convolution & Deconvolution — 2-D (transposed) convolution over NCHW data
//
// HOST PATH (per sample):
//
//   Convolution    col = im2col(x)                      [C_in*kh*kw, H_out*W_out]
//                  y_g = W_g * col_g       for each group
//                  y  += bias * ones^T
//
//   Deconvolution  col_g = W_g^T * x_g     for each group
//                  y     = col2im(col)
//                  y    += bias * ones^T
//
// A 1x1 kernel with unit stride and no padding skips the lowering: the image
// already is the column matrix.
//
// DEVICE PATH:
//   One generated program per configuration with every shape constant baked
//   in; one thread per output pixel on a 3-D grid (columns, rows,
//   sample * channel).
//
// PARAMETER SHAPES:
//   Convolution    weight [C_out, C_in / group, kh, kw]
//   Deconvolution  weight [C_in, C_out / group, kh, kw]
//   bias           [C_out]                           (optional)
//
// OUTPUT SIZE:
//   Convolution    H_out = (H + 2*pad - dilation*(k-1) - 1) / stride + 1
//   Deconvolution  H_out = (H - 1)*stride - 2*pad + dilation*(k-1) + 1

use std::cell::RefCell;

use kettle_core::blas::{gemm, Transpose};
use kettle_core::{ConvGeometry, Error, HostTensor, Result, WeightBlob, WeightRef};

#[cfg(feature = "cuda")]
use kettle_cuda::{
    ConvKernelConfig, DeviceContext, DeviceTensor, DeviceWeights, KernelArg, KernelKind,
    KernelLaunch,
};

use crate::module::{check_param, unary_buffers, Forward};

/// Hyperparameters shared by convolution and deconvolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParams {
    /// Batch size.
    pub num: usize,
    pub in_channels: usize,
    /// Input height and width.
    pub input_hw: [usize; 2],
    pub out_channels: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub dilation: [usize; 2],
    pub group: usize,
}

impl ConvParams {
    /// Unit stride, no padding, no dilation, one group.
    pub fn new(
        num: usize,
        in_channels: usize,
        input_hw: [usize; 2],
        out_channels: usize,
        kernel: [usize; 2],
    ) -> Self {
        ConvParams {
            num,
            in_channels,
            input_hw,
            out_channels,
            kernel,
            stride: [1, 1],
            pad: [0, 0],
            dilation: [1, 1],
            group: 1,
        }
    }

    pub fn with_stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_pad(mut self, pad: [usize; 2]) -> Self {
        self.pad = pad;
        self
    }

    pub fn with_dilation(mut self, dilation: [usize; 2]) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    /// Kernel 1x1, unit stride, no padding.
    pub fn is_1x1(&self) -> bool {
        self.kernel == [1, 1] && self.stride == [1, 1] && self.pad == [0, 0]
    }

    /// Weight elements for a layer with these parameters.
    pub fn weight_len(&self) -> usize {
        self.out_channels * (self.in_channels / self.group.max(1)) * self.kernel[0] * self.kernel[1]
    }

    fn validate(&self, op: &'static str) -> Result<()> {
        if self.num == 0 {
            return Err(Error::invalid(op, "batch size must be non-zero"));
        }
        if self.group == 0 {
            return Err(Error::invalid(op, "group must be non-zero"));
        }
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(Error::invalid(op, "channel counts must be non-zero"));
        }
        if self.in_channels % self.group != 0 || self.out_channels % self.group != 0 {
            return Err(Error::invalid(
                op,
                format!(
                    "channels {} -> {} not divisible by group {}",
                    self.in_channels, self.out_channels, self.group
                ),
            ));
        }
        if self.input_hw.contains(&0) {
            return Err(Error::invalid(op, "input height and width must be non-zero"));
        }
        if self.kernel.contains(&0) || self.stride.contains(&0) || self.dilation.contains(&0) {
            return Err(Error::invalid(op, "kernel, stride and dilation must be non-zero"));
        }
        Ok(())
    }

    fn validate_parameters(
        &self,
        op: &'static str,
        weight: WeightRef,
        bias: Option<WeightRef>,
    ) -> Result<()> {
        check_param(op, "weight", Some(weight), self.weight_len())?;
        check_param(op, "bias", bias, self.out_channels)
    }
}

/// Forward convolution.
#[derive(Debug)]
pub struct Convolution {
    params: ConvParams,
    weight: WeightRef,
    bias: Option<WeightRef>,
    geometry: ConvGeometry,
    output_hw: [usize; 2],
    col_buffer: RefCell<Vec<f32>>,
    bias_multiplier: Vec<f32>,
    #[cfg(feature = "cuda")]
    kernel: ConvKernelConfig,
}

impl Convolution {
    pub fn new(params: ConvParams, weight: WeightRef, bias: Option<WeightRef>) -> Result<Self> {
        const OP: &str = "convolution";
        params.validate(OP)?;
        params.validate_parameters(OP, weight, bias)?;
        let geometry = ConvGeometry {
            channels: params.in_channels,
            height: params.input_hw[0],
            width: params.input_hw[1],
            kernel: params.kernel,
            stride: params.stride,
            pad: params.pad,
            dilation: params.dilation,
        };
        geometry.validate()?;
        let (oh, ow) = geometry.output_hw();
        let col_len = if params.is_1x1() { 0 } else { geometry.col_len() };
        tracing::debug!(
            in_c = params.in_channels,
            out_c = params.out_channels,
            kernel = ?params.kernel,
            stride = ?params.stride,
            group = params.group,
            out_hw = ?(oh, ow),
            "convolution"
        );
        Ok(Convolution {
            params,
            weight,
            bias,
            geometry,
            output_hw: [oh, ow],
            col_buffer: RefCell::new(vec![0.0; col_len]),
            bias_multiplier: vec![1.0; oh * ow],
            #[cfg(feature = "cuda")]
            kernel: ConvKernelConfig {
                transposed: false,
                num: params.num,
                in_c: params.in_channels,
                in_h: params.input_hw[0],
                in_w: params.input_hw[1],
                out_c: params.out_channels,
                out_h: oh,
                out_w: ow,
                kernel: params.kernel,
                stride: params.stride,
                pad: params.pad,
                dilation: params.dilation,
                group: params.group,
                has_bias: bias.is_some(),
            },
        })
    }

    pub fn params(&self) -> &ConvParams {
        &self.params
    }

    /// `[N, C_out, H_out, W_out]`
    pub fn output_shape(&self) -> [usize; 4] {
        [
            self.params.num,
            self.params.out_channels,
            self.output_hw[0],
            self.output_hw[1],
        ]
    }

    fn run(&self, weights: &WeightBlob, input: &[f32], output: &mut [f32]) -> Result<()> {
        let p = &self.params;
        kettle_core::ensure_count!(p.num * self.geometry.image_len(), input.len());
        kettle_core::ensure_count!(self.output_count(), output.len());
        let w = weights.get(self.weight)?;
        let bias = weights.get_opt(self.bias)?;

        let out_spatial = self.output_hw[0] * self.output_hw[1];
        let kernel_dim = (p.in_channels / p.group) * p.kernel[0] * p.kernel[1];
        let out_per_group = p.out_channels / p.group;
        let weight_offset = out_per_group * kernel_dim;
        let col_offset = kernel_dim * out_spatial;
        let output_offset = out_per_group * out_spatial;

        let mut col_buffer = self.col_buffer.borrow_mut();
        let in_len = self.geometry.image_len();
        let out_len = p.out_channels * out_spatial;
        for (x, y) in input.chunks_exact(in_len).zip(output.chunks_exact_mut(out_len)) {
            let col: &[f32] = if p.is_1x1() {
                x
            } else {
                self.geometry.im2col(x, &mut col_buffer[..]);
                &col_buffer[..]
            };
            for g in 0..p.group {
                gemm(
                    Transpose::No,
                    Transpose::No,
                    out_per_group,
                    out_spatial,
                    kernel_dim,
                    1.0,
                    &w[g * weight_offset..],
                    &col[g * col_offset..],
                    0.0,
                    &mut y[g * output_offset..],
                );
            }
            if let Some(b) = bias {
                gemm(
                    Transpose::No,
                    Transpose::No,
                    p.out_channels,
                    out_spatial,
                    1,
                    1.0,
                    b,
                    &self.bias_multiplier,
                    1.0,
                    y,
                );
            }
        }
        Ok(())
    }
}

impl Forward for Convolution {
    fn name(&self) -> &'static str {
        "convolution"
    }

    fn output_count(&self) -> usize {
        self.output_shape().iter().product()
    }

    fn forward<'a>(&self, weights: &WeightBlob, input: HostTensor<'a>) -> Result<HostTensor<'a>> {
        let mut out = HostTensor::zeros(self.output_count());
        self.run(weights, input.as_slice(), out.as_mut_slice())?;
        Ok(out)
    }

    fn forward_buffers(
        &self,
        weights: &WeightBlob,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<()> {
        let (input, output) = unary_buffers(self.name(), inputs, outputs)?;
        self.run(weights, input, output)
    }

    #[cfg(feature = "cuda")]
    fn forward_device<'a>(
        &self,
        ctx: &DeviceContext,
        weights: &DeviceWeights,
        input: DeviceTensor<'a>,
    ) -> Result<DeviceTensor<'a>> {
        launch_conv(ctx, weights, &self.kernel, self.weight, self.bias, &input, self.output_count())
    }
}

/// Transposed convolution.
#[derive(Debug)]
pub struct Deconvolution {
    params: ConvParams,
    weight: WeightRef,
    bias: Option<WeightRef>,
    /// Geometry of the *output* image; im2col of it yields the input grid.
    geometry: ConvGeometry,
    output_hw: [usize; 2],
    col_buffer: RefCell<Vec<f32>>,
    bias_multiplier: Vec<f32>,
    #[cfg(feature = "cuda")]
    kernel: ConvKernelConfig,
}

impl Deconvolution {
    pub fn new(params: ConvParams, weight: WeightRef, bias: Option<WeightRef>) -> Result<Self> {
        const OP: &str = "deconvolution";
        params.validate(OP)?;
        // Weight is [C_in, C_out / group, kh, kw]; same element count as the
        // forward layout with in/out swapped.
        let swapped = ConvParams {
            in_channels: params.out_channels,
            out_channels: params.in_channels,
            ..params
        };
        check_param(OP, "weight", Some(weight), swapped.weight_len())?;
        check_param(OP, "bias", bias, params.out_channels)?;

        let mut output_hw = [0; 2];
        for axis in 0..2 {
            let grown = (params.input_hw[axis] - 1) * params.stride[axis]
                + params.dilation[axis] * (params.kernel[axis] - 1)
                + 1;
            if grown <= 2 * params.pad[axis] {
                return Err(Error::invalid(
                    OP,
                    format!("padding {} leaves no output along axis {axis}", params.pad[axis]),
                ));
            }
            output_hw[axis] = grown - 2 * params.pad[axis];
        }
        let geometry = ConvGeometry {
            channels: params.out_channels,
            height: output_hw[0],
            width: output_hw[1],
            kernel: params.kernel,
            stride: params.stride,
            pad: params.pad,
            dilation: params.dilation,
        };
        let col_len = if params.is_1x1() { 0 } else { geometry.col_len() };
        tracing::debug!(
            in_c = params.in_channels,
            out_c = params.out_channels,
            kernel = ?params.kernel,
            stride = ?params.stride,
            group = params.group,
            out_hw = ?output_hw,
            "deconvolution"
        );
        Ok(Deconvolution {
            params,
            weight,
            bias,
            geometry,
            output_hw,
            col_buffer: RefCell::new(vec![0.0; col_len]),
            bias_multiplier: vec![1.0; output_hw[0] * output_hw[1]],
            #[cfg(feature = "cuda")]
            kernel: ConvKernelConfig {
                transposed: true,
                num: params.num,
                in_c: params.in_channels,
                in_h: params.input_hw[0],
                in_w: params.input_hw[1],
                out_c: params.out_channels,
                out_h: output_hw[0],
                out_w: output_hw[1],
                kernel: params.kernel,
                stride: params.stride,
                pad: params.pad,
                dilation: params.dilation,
                group: params.group,
                has_bias: bias.is_some(),
            },
        })
    }

    pub fn params(&self) -> &ConvParams {
        &self.params
    }

    /// `[N, C_out, H_out, W_out]`
    pub fn output_shape(&self) -> [usize; 4] {
        [
            self.params.num,
            self.params.out_channels,
            self.output_hw[0],
            self.output_hw[1],
        ]
    }

    fn run(&self, weights: &WeightBlob, input: &[f32], output: &mut [f32]) -> Result<()> {
        let p = &self.params;
        let in_spatial = p.input_hw[0] * p.input_hw[1];
        let in_len = p.in_channels * in_spatial;
        let out_len = self.geometry.image_len();
        kettle_core::ensure_count!(p.num * in_len, input.len());
        kettle_core::ensure_count!(self.output_count(), output.len());
        let w = weights.get(self.weight)?;
        let bias = weights.get_opt(self.bias)?;

        let kernel_dim = (p.out_channels / p.group) * p.kernel[0] * p.kernel[1];
        let in_per_group = p.in_channels / p.group;
        let weight_offset = in_per_group * kernel_dim;
        let col_offset = kernel_dim * in_spatial;
        let input_offset = in_per_group * in_spatial;
        let out_spatial = self.output_hw[0] * self.output_hw[1];

        let mut col_buffer = self.col_buffer.borrow_mut();
        for (x, y) in input.chunks_exact(in_len).zip(output.chunks_exact_mut(out_len)) {
            {
                let col: &mut [f32] = if p.is_1x1() { &mut y[..] } else { &mut col_buffer[..] };
                for g in 0..p.group {
                    gemm(
                        Transpose::Yes,
                        Transpose::No,
                        kernel_dim,
                        in_spatial,
                        in_per_group,
                        1.0,
                        &w[g * weight_offset..],
                        &x[g * input_offset..],
                        0.0,
                        &mut col[g * col_offset..],
                    );
                }
            }
            if !p.is_1x1() {
                self.geometry.col2im(&col_buffer[..], y);
            }
            if let Some(b) = bias {
                gemm(
                    Transpose::No,
                    Transpose::No,
                    p.out_channels,
                    out_spatial,
                    1,
                    1.0,
                    b,
                    &self.bias_multiplier,
                    1.0,
                    y,
                );
            }
        }
        Ok(())
    }
}

impl Forward for Deconvolution {
    fn name(&self) -> &'static str {
        "deconvolution"
    }

    fn output_count(&self) -> usize {
        self.output_shape().iter().product()
    }

    fn forward<'a>(&self, weights: &WeightBlob, input: HostTensor<'a>) -> Result<HostTensor<'a>> {
        let mut out = HostTensor::zeros(self.output_count());
        self.run(weights, input.as_slice(), out.as_mut_slice())?;
        Ok(out)
    }

    fn forward_buffers(
        &self,
        weights: &WeightBlob,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<()> {
        let (input, output) = unary_buffers(self.name(), inputs, outputs)?;
        self.run(weights, input, output)
    }

    #[cfg(feature = "cuda")]
    fn forward_device<'a>(
        &self,
        ctx: &DeviceContext,
        weights: &DeviceWeights,
        input: DeviceTensor<'a>,
    ) -> Result<DeviceTensor<'a>> {
        launch_conv(ctx, weights, &self.kernel, self.weight, self.bias, &input, self.output_count())
    }
}

#[cfg(feature = "cuda")]
fn launch_conv<'a>(
    ctx: &DeviceContext,
    weights: &DeviceWeights,
    cfg: &ConvKernelConfig,
    weight: WeightRef,
    bias: Option<WeightRef>,
    input: &DeviceTensor<'_>,
    output_count: usize,
) -> Result<DeviceTensor<'a>> {
    kettle_core::ensure_count!(cfg.num * cfg.in_c * cfg.in_h * cfg.in_w, input.count());
    let out = DeviceTensor::zeros(ctx, output_count)?;
    let launch = KernelLaunch::new(
        KernelKind::Conv(*cfg),
        vec![
            KernelArg::Buffer(input.device_ptr()),
            KernelArg::Buffer(weights.ptr(weight)?),
            KernelArg::Buffer(out.device_ptr()),
            KernelArg::Buffer(weights.ptr_opt(bias)?.unwrap_or(0)),
        ],
        cfg.launch_config()?,
    )?;
    ctx.enqueue(&launch)?;
    Ok(out)
}
