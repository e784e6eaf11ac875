// CUDA kernel sources, compiled to PTX at runtime via NVRTC
//
// Two kinds of programs live here:
//
//   MATH_SOURCE   element-wise math, per-channel reductions and the RNN gate
//                 kernels. Compiled once when a DeviceContext is created.
//   conv sources  one program per convolution configuration. Every shape
//                 parameter is baked in as a #define so the inner loops have
//                 constant trip counts. Generated and compiled lazily.
//
// All kernels take plain device pointers and flat indices; buffers are
// always contiguous. Optional buffers (bias, scale) are passed as a null
// pointer plus a `has_*` flag.

use cudarc::driver::LaunchConfig;
use kettle_core::{Error, Result};

/// Module name the math program is loaded under.
pub const MATH_MODULE: &str = "kettle_math";

pub const MATH_SOURCE: &str = r#"
//  UNARY / BINARY
//
// Op codes mirror kettle_core::UnaryOp::code and BinaryOp::code.

__device__ __forceinline__ float apply_unary(int op, float x, float p) {
    switch (op) {
        case 0:  return x + p;
        case 1:  return x * p;
        case 2:  return x * x;
        case 3:  return sqrtf(x);
        case 4:  return fabsf(x);
        case 5:  return expf(x);
        case 6:  return logf(x);
        case 7:  return powf(x, p);
        case 8:  return tanhf(x);
        case 9:  return 1.0f / (1.0f + expf(-x));
        case 10: return fmaxf(x, 0.0f) + p * (expf(fminf(x, 0.0f)) - 1.0f);
        case 11: return x > 0.0f ? x : x * p;
        case 12: return 1.0f / x;
        default: return x;
    }
}

extern "C" __global__ void fill_f32(float* x, float v, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) x[idx] = v;
}

extern "C" __global__ void copy_f32(const float* src, float* dst, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) dst[idx] = src[idx];
}

// `x` and `y` may alias for in-place application.
extern "C" __global__ void unary_f32(const float* x, float* y, unsigned int n, int op, float p) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) y[idx] = apply_unary(op, x[idx], p);
}

extern "C" __global__ void binary_f32(
    const float* a, const float* b, float* y, unsigned int n, int op
) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= n) return;
    float l = a[idx], r = b[idx];
    float v;
    switch (op) {
        case 0:  v = l + r; break;
        case 1:  v = l - r; break;
        case 2:  v = l * r; break;
        default: v = l / r; break;
    }
    y[idx] = v;
}

// Accumulate one eltwise input into the running output.
// op 0: y += coeff * x    op 1: y *= x    op 2: y = max(y, x)
extern "C" __global__ void eltwise_f32(
    const float* x, float* y, unsigned int n, int op, float coeff
) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= n) return;
    if (op == 0)      y[idx] += coeff * x[idx];
    else if (op == 1) y[idx] *= x[idx];
    else              y[idx] = fmaxf(y[idx], x[idx]);
}

//  PER-CHANNEL
//
// Buffers are [outer, channels, spatial]; channel of flat index i is
// (i / spatial) % channels.

extern "C" __global__ void scale_f32(
    float* x, const float* scale, const float* bias,
    unsigned int n, unsigned int scale_dim, unsigned int inner,
    int has_scale, int has_bias
) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= n) return;
    unsigned int s = (idx / inner) % scale_dim;
    float v = x[idx];
    if (has_scale) v *= scale[s];
    if (has_bias) v += bias[s];
    x[idx] = v;
}

// Stage one of the mean: out[row] = scale * sum(x[row, :]) (of x^2 when
// `squared` is set). One thread per (sample, channel) row.
extern "C" __global__ void channel_mean_f32(
    const float* x, float* out, unsigned int rows, unsigned int spatial,
    float scale, int squared
) {
    unsigned int row = blockIdx.x * blockDim.x + threadIdx.x;
    if (row >= rows) return;
    const float* p = x + (unsigned long long)row * spatial;
    float acc = 0.0f;
    for (unsigned int i = 0; i < spatial; i++) {
        float v = p[i];
        acc += squared ? v * v : v;
    }
    out[row] = acc * scale;
}

// Stage two: out[c] = sum over samples of rows[n, c].
extern "C" __global__ void batch_sum_f32(
    const float* rows, float* out, unsigned int num, unsigned int channels
) {
    unsigned int c = blockIdx.x * blockDim.x + threadIdx.x;
    if (c >= channels) return;
    float acc = 0.0f;
    for (unsigned int i = 0; i < num; i++) acc += rows[i * channels + c];
    out[c] = acc;
}

extern "C" __global__ void channeled_sub_f32(
    float* x, const float* m, unsigned int n, unsigned int channels, unsigned int spatial
) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) x[idx] -= m[(idx / spatial) % channels];
}

// out[c] = weight[c] / sqrt(var[c] + eps), weight defaulting to one.
extern "C" __global__ void bn_factor_f32(
    const float* var, const float* weight, float* out,
    unsigned int channels, float eps, int has_weight
) {
    unsigned int c = blockIdx.x * blockDim.x + threadIdx.x;
    if (c >= channels) return;
    float w = has_weight ? weight[c] : 1.0f;
    out[c] = w / sqrtf(var[c] + eps);
}

extern "C" __global__ void channeled_scale_add_f32(
    float* x, const float* scale, const float* bias,
    unsigned int n, unsigned int channels, unsigned int spatial, int has_bias
) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= n) return;
    unsigned int c = (idx / spatial) % channels;
    float v = x[idx] * scale[c];
    if (has_bias) v += bias[c];
    x[idx] = v;
}

//  RECURRENT

// y[b, r] = sum_c w[r, c] * x[b * x_stride + c] + bias[r]
extern "C" __global__ void matvec_f32(
    const float* w, const float* x, const float* bias, float* y,
    unsigned int rows, unsigned int cols, unsigned int batch, unsigned int x_stride,
    int has_bias
) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= rows * batch) return;
    unsigned int b = idx / rows, r = idx % rows;
    const float* wr = w + (unsigned long long)r * cols;
    const float* xb = x + (unsigned long long)b * x_stride;
    float acc = has_bias ? bias[r] : 0.0f;
    for (unsigned int c = 0; c < cols; c++) acc += wr[c] * xb[c];
    y[idx] = acc;
}

__device__ __forceinline__ float sigmoidf(float x) { return 1.0f / (1.0f + expf(-x)); }

// gi, gh: [batch, 3H] pre-activations ordered (reset, update, new).
// h: [batch, H] updated in place. The new state is also written to
// out[b * out_stride + j] so bidirectional layers can interleave directions.
extern "C" __global__ void gru_gates_f32(
    const float* gi, const float* gh, float* h, float* out,
    unsigned int hidden, unsigned int batch, unsigned int out_stride
) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= hidden * batch) return;
    unsigned int b = idx / hidden, j = idx % hidden;
    const float* i3 = gi + (unsigned long long)b * 3 * hidden;
    const float* h3 = gh + (unsigned long long)b * 3 * hidden;
    float r = sigmoidf(i3[j] + h3[j]);
    float z = sigmoidf(i3[hidden + j] + h3[hidden + j]);
    float nn = tanhf(i3[2 * hidden + j] + r * h3[2 * hidden + j]);
    float v = (1.0f - z) * nn + z * h[idx];
    h[idx] = v;
    out[(unsigned long long)b * out_stride + j] = v;
}

// gi, gh: [batch, 4H] ordered (input, forget, cell, output).
// state: [batch, 2H] holding h then c, updated in place.
extern "C" __global__ void lstm_gates_f32(
    const float* gi, const float* gh, float* state, float* out,
    unsigned int hidden, unsigned int batch, unsigned int out_stride
) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= hidden * batch) return;
    unsigned int b = idx / hidden, j = idx % hidden;
    const float* i4 = gi + (unsigned long long)b * 4 * hidden;
    const float* h4 = gh + (unsigned long long)b * 4 * hidden;
    float ig = sigmoidf(i4[j] + h4[j]);
    float fg = sigmoidf(i4[hidden + j] + h4[hidden + j]);
    float gg = tanhf(i4[2 * hidden + j] + h4[2 * hidden + j]);
    float og = sigmoidf(i4[3 * hidden + j] + h4[3 * hidden + j]);
    float* hs = state + (unsigned long long)b * 2 * hidden;
    float c = fg * hs[hidden + j] + ig * gg;
    float hn = og * tanhf(c);
    hs[hidden + j] = c;
    hs[j] = hn;
    out[(unsigned long long)b * out_stride + j] = hn;
}
"#;

//  CONVOLUTION PROGRAMS

/// Entry point of a generated forward-convolution program.
pub const CONV_KERNEL: &str = "conv2d_f32";
/// Entry point of a generated transposed-convolution program.
pub const DECONV_KERNEL: &str = "deconv2d_f32";

const TILE: u32 = 16;
/// Hardware limit on `gridDim.y` and `gridDim.z`.
pub const MAX_GRID_YZ: u32 = 65_535;

/// Every shape parameter of one convolution, baked into its program.
///
/// For a transposed convolution `in_*` describe the deconvolution input and
/// `out_*` its (larger) output; the weight is laid out as
/// `[in_c, out_c / group, kh, kw]`. For a forward convolution the weight is
/// `[out_c, in_c / group, kh, kw]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvKernelConfig {
    pub transposed: bool,
    pub num: usize,
    pub in_c: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_c: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub dilation: [usize; 2],
    pub group: usize,
    pub has_bias: bool,
}

impl ConvKernelConfig {
    pub fn entry_point(&self) -> &'static str {
        if self.transposed {
            DECONV_KERNEL
        } else {
            CONV_KERNEL
        }
    }

    /// Unique module name; identical configurations share one program.
    pub fn module_name(&self) -> String {
        format!(
            "{}_n{}_c{}x{}x{}_o{}x{}x{}_k{}x{}_s{}x{}_p{}x{}_d{}x{}_g{}_b{}",
            if self.transposed { "deconv" } else { "conv" },
            self.num,
            self.in_c,
            self.in_h,
            self.in_w,
            self.out_c,
            self.out_h,
            self.out_w,
            self.kernel[0],
            self.kernel[1],
            self.stride[0],
            self.stride[1],
            self.pad[0],
            self.pad[1],
            self.dilation[0],
            self.dilation[1],
            self.group,
            u8::from(self.has_bias),
        )
    }

    /// 3-D launch grid: output columns, output rows, (sample, channel)
    /// planes. The z extent is capped at [`MAX_GRID_YZ`]; the kernels stride
    /// over any remaining planes.
    pub fn launch_config(&self) -> Result<LaunchConfig> {
        let op = if self.transposed { "deconvolution" } else { "convolution" };
        if self.num == 0 || self.out_c == 0 || self.out_h == 0 || self.out_w == 0 {
            return Err(Error::invalid(op, "empty output has no launch grid"));
        }
        let planes = self
            .num
            .checked_mul(self.out_c)
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| {
                Error::invalid(
                    op,
                    format!("{} samples x {} channels overflows the grid", self.num, self.out_c),
                )
            })?;
        let tiles = |n: usize, axis: &str| {
            u32::try_from(n)
                .map(|n| n.div_ceil(TILE))
                .map_err(|_| Error::invalid(op, format!("output {axis} {n} overflows the grid")))
        };
        let rows = tiles(self.out_h, "height")?;
        if rows > MAX_GRID_YZ {
            return Err(Error::invalid(
                op,
                format!("output height {} overflows the grid", self.out_h),
            ));
        }
        Ok(LaunchConfig {
            block_dim: (TILE, TILE, 1),
            grid_dim: (tiles(self.out_w, "width")?, rows, planes.min(MAX_GRID_YZ)),
            shared_mem_bytes: 0,
        })
    }

    /// CUDA source of the program for this configuration.
    pub fn source(&self) -> String {
        let defines = format!(
            "#define NUM {}\n#define IN_C {}\n#define IN_H {}\n#define IN_W {}\n\
             #define OUT_C {}\n#define OUT_H {}\n#define OUT_W {}\n\
             #define KH {}\n#define KW {}\n#define SH {}\n#define SW {}\n\
             #define PH {}\n#define PW {}\n#define DH {}\n#define DW {}\n\
             #define GROUP {}\n#define HAS_BIAS {}\n",
            self.num,
            self.in_c,
            self.in_h,
            self.in_w,
            self.out_c,
            self.out_h,
            self.out_w,
            self.kernel[0],
            self.kernel[1],
            self.stride[0],
            self.stride[1],
            self.pad[0],
            self.pad[1],
            self.dilation[0],
            self.dilation[1],
            self.group,
            u8::from(self.has_bias),
        );
        let body = if self.transposed {
            DECONV_TEMPLATE
        } else {
            CONV_TEMPLATE
        };
        format!("{defines}{body}")
    }
}

const CONV_TEMPLATE: &str = r#"
extern "C" __global__ void conv2d_f32(
    const float* input, const float* weight, float* output, const float* bias
) {
    const int ow = blockIdx.x * blockDim.x + threadIdx.x;
    const int oh = blockIdx.y * blockDim.y + threadIdx.y;
    if (ow >= OUT_W || oh >= OUT_H) return;
    const int in_per_group = IN_C / GROUP;
    // gridDim.z is capped; stride over the remaining (sample, channel) planes.
    for (unsigned long long z = blockIdx.z; z < (unsigned long long)NUM * OUT_C; z += gridDim.z) {
        const int n = z / OUT_C;
        const int oc = z % OUT_C;
        const int g = oc / (OUT_C / GROUP);

        float acc = HAS_BIAS ? bias[oc] : 0.0f;
        for (int ic = 0; ic < in_per_group; ic++) {
            const int c = g * in_per_group + ic;
            const float* in_plane = input + ((unsigned long long)n * IN_C + c) * IN_H * IN_W;
            const float* w = weight + ((unsigned long long)oc * in_per_group + ic) * KH * KW;
            #pragma unroll
            for (int kh = 0; kh < KH; kh++) {
                const int ih = oh * SH - PH + kh * DH;
                if (ih < 0 || ih >= IN_H) continue;
                #pragma unroll
                for (int kw = 0; kw < KW; kw++) {
                    const int iw = ow * SW - PW + kw * DW;
                    if (iw < 0 || iw >= IN_W) continue;
                    acc += in_plane[ih * IN_W + iw] * w[kh * KW + kw];
                }
            }
        }
        output[(((unsigned long long)n * OUT_C + oc) * OUT_H + oh) * OUT_W + ow] = acc;
    }
}
"#;

// Gather form of the transposed convolution: each output pixel collects the
// input pixels whose scattered footprint covers it.
const DECONV_TEMPLATE: &str = r#"
extern "C" __global__ void deconv2d_f32(
    const float* input, const float* weight, float* output, const float* bias
) {
    const int ow = blockIdx.x * blockDim.x + threadIdx.x;
    const int oh = blockIdx.y * blockDim.y + threadIdx.y;
    if (ow >= OUT_W || oh >= OUT_H) return;
    const int out_per_group = OUT_C / GROUP;
    const int in_per_group = IN_C / GROUP;
    // gridDim.z is capped; stride over the remaining (sample, channel) planes.
    for (unsigned long long z = blockIdx.z; z < (unsigned long long)NUM * OUT_C; z += gridDim.z) {
        const int n = z / OUT_C;
        const int oc = z % OUT_C;
        const int g = oc / out_per_group;
        const int ocg = oc % out_per_group;

        float acc = HAS_BIAS ? bias[oc] : 0.0f;
        for (int icg = 0; icg < in_per_group; icg++) {
            const int c = g * in_per_group + icg;
            const float* in_plane = input + ((unsigned long long)n * IN_C + c) * IN_H * IN_W;
            const float* w = weight + ((unsigned long long)c * out_per_group + ocg) * KH * KW;
            #pragma unroll
            for (int kh = 0; kh < KH; kh++) {
                const int th = oh + PH - kh * DH;
                if (th < 0 || th % SH != 0) continue;
                const int ih = th / SH;
                if (ih >= IN_H) continue;
                #pragma unroll
                for (int kw = 0; kw < KW; kw++) {
                    const int tw = ow + PW - kw * DW;
                    if (tw < 0 || tw % SW != 0) continue;
                    const int iw = tw / SW;
                    if (iw >= IN_W) continue;
                    acc += in_plane[ih * IN_W + iw] * w[kh * KW + kw];
                }
            }
        }
        output[(((unsigned long long)n * OUT_C + oc) * OUT_H + oh) * OUT_W + ow] = acc;
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ConvKernelConfig {
        ConvKernelConfig {
            transposed: false,
            num: 2,
            in_c: 3,
            in_h: 8,
            in_w: 8,
            out_c: 4,
            out_h: 8,
            out_w: 8,
            kernel: [3, 3],
            stride: [1, 1],
            pad: [1, 1],
            dilation: [1, 1],
            group: 1,
            has_bias: true,
        }
    }

    #[test]
    fn module_names_separate_configurations() {
        let a = cfg();
        let mut b = cfg();
        b.has_bias = false;
        let mut c = cfg();
        c.transposed = true;
        assert_ne!(a.module_name(), b.module_name());
        assert_ne!(a.module_name(), c.module_name());
        assert_eq!(a.module_name(), cfg().module_name());
    }

    #[test]
    fn source_bakes_in_shape() {
        let src = cfg().source();
        assert!(src.contains("#define IN_C 3"));
        assert!(src.contains("#define HAS_BIAS 1"));
        assert!(src.contains(CONV_KERNEL));
        let mut t = cfg();
        t.transposed = true;
        assert!(t.source().contains(DECONV_KERNEL));
    }

    #[test]
    fn launch_grid_covers_output() {
        let lc = cfg().launch_config().unwrap();
        assert_eq!(lc.block_dim, (16, 16, 1));
        assert_eq!(lc.grid_dim, (1, 1, 8));
    }

    #[test]
    fn large_batches_stride_over_planes() {
        let mut c = cfg();
        c.num = 128;
        c.out_c = 512;
        let lc = c.launch_config().unwrap();
        assert_eq!(lc.grid_dim.2, MAX_GRID_YZ);
        let src = c.source();
        assert!(src.contains("#define NUM 128"));
        assert!(src.contains("z += gridDim.z"));
    }

    #[test]
    fn launch_grid_rejects_empty_and_oversized_shapes() {
        let mut empty = cfg();
        empty.num = 0;
        assert!(empty.launch_config().is_err());

        let mut wide = cfg();
        wide.num = 1 << 20;
        wide.out_c = 1 << 13;
        assert!(wide.launch_config().is_err());

        let mut tall = cfg();
        tall.out_h = (MAX_GRID_YZ as usize + 1) * 16;
        assert!(tall.launch_config().is_err());
    }
}
