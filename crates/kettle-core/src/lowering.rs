// im2col / col2im — lowering 2-D convolution onto GEMM
//
// im2col unrolls every receptive field of a [channels, height, width] image
// into a column of a [channels * kh * kw, out_h * out_w] matrix, so a
// convolution becomes `weights[out_c x (c*kh*kw)] * columns`. Positions that
// fall into the padding read as zero.
//
// col2im is the adjoint: it scatters the same columns back onto the image,
// summing overlapping contributions. Transposed convolution is exactly
// `W^T * input` followed by col2im.

use crate::error::{Error, Result};

/// Spatial geometry of one image plane stack and the kernel sliding over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub dilation: [usize; 2],
}

impl ConvGeometry {
    /// Check that the geometry yields at least one output position.
    pub fn validate(&self) -> Result<()> {
        let op = "convolution";
        if self.kernel.contains(&0) {
            return Err(Error::invalid(op, "kernel size must be non-zero"));
        }
        if self.stride.contains(&0) {
            return Err(Error::invalid(op, "stride must be non-zero"));
        }
        if self.dilation.contains(&0) {
            return Err(Error::invalid(op, "dilation must be non-zero"));
        }
        for axis in 0..2 {
            let extent = [self.height, self.width][axis] + 2 * self.pad[axis];
            if extent < self.effective_kernel(axis) {
                return Err(Error::invalid(
                    op,
                    format!(
                        "padded input extent {extent} smaller than dilated kernel {}",
                        self.effective_kernel(axis)
                    ),
                ));
            }
        }
        Ok(())
    }

    fn effective_kernel(&self, axis: usize) -> usize {
        self.dilation[axis] * (self.kernel[axis] - 1) + 1
    }

    /// `(out_h, out_w)` of a convolution over this geometry.
    pub fn output_hw(&self) -> (usize, usize) {
        let out = |axis: usize, size: usize| {
            (size + 2 * self.pad[axis] - self.effective_kernel(axis)) / self.stride[axis] + 1
        };
        (out(0, self.height), out(1, self.width))
    }

    pub fn image_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Rows of the column matrix: `channels * kh * kw`.
    pub fn col_rows(&self) -> usize {
        self.channels * self.kernel[0] * self.kernel[1]
    }

    pub fn col_len(&self) -> usize {
        let (oh, ow) = self.output_hw();
        self.col_rows() * oh * ow
    }

    /// Kernel 1x1, unit stride, no padding: the image already is the column
    /// matrix.
    pub fn is_pointwise(&self) -> bool {
        self.kernel == [1, 1] && self.stride == [1, 1] && self.pad == [0, 0]
    }

    /// Walk every (column row, output position) pair with its image index.
    #[inline]
    fn for_each_tap(&self, mut f: impl FnMut(usize, Option<usize>)) {
        let (out_h, out_w) = self.output_hw();
        let (h, w) = (self.height as isize, self.width as isize);
        let mut col = 0;
        for c in 0..self.channels {
            let plane = c * self.height * self.width;
            for kh in 0..self.kernel[0] {
                for kw in 0..self.kernel[1] {
                    let mut in_row = (kh * self.dilation[0]) as isize - self.pad[0] as isize;
                    for _ in 0..out_h {
                        let row_ok = in_row >= 0 && in_row < h;
                        let mut in_col = (kw * self.dilation[1]) as isize - self.pad[1] as isize;
                        for _ in 0..out_w {
                            let idx = (row_ok && in_col >= 0 && in_col < w)
                                .then(|| plane + (in_row * w + in_col) as usize);
                            f(col, idx);
                            col += 1;
                            in_col += self.stride[1] as isize;
                        }
                        in_row += self.stride[0] as isize;
                    }
                }
            }
        }
    }

    /// Unroll `image[channels, h, w]` into `col[channels*kh*kw, out_h*out_w]`.
    pub fn im2col(&self, image: &[f32], col: &mut [f32]) {
        assert!(image.len() >= self.image_len());
        assert!(col.len() >= self.col_len());
        self.for_each_tap(|i, idx| {
            col[i] = idx.map_or(0.0, |j| image[j]);
        });
    }

    /// Scatter-add `col` back onto `image`, which is zeroed first.
    pub fn col2im(&self, col: &[f32], image: &mut [f32]) {
        assert!(image.len() >= self.image_len());
        assert!(col.len() >= self.col_len());
        image[..self.image_len()].fill(0.0);
        self.for_each_tap(|i, idx| {
            if let Some(j) = idx {
                image[j] += col[i];
            }
        });
    }
}
