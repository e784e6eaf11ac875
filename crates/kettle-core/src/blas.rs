// Host BLAS — the two level-3/level-2 routines the operators are lowered onto
//
// Both functions follow the row-major cblas conventions:
//
//   gemm: C[m x n] = alpha * op(A)[m x k] * op(B)[k x n] + beta * C
//   gemv: y = alpha * op(A) * x + beta * y,  A stored as [m x n]
//
// `Transpose::Yes` means the operand is stored transposed (A as [k x m],
// B as [n x k]). The heavy lifting is done by `matrixmultiply::sgemm`,
// which takes explicit row/column strides, so transposition is just a
// stride swap.

/// Whether a matrix operand is read as stored or transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    No,
    Yes,
}

impl Transpose {
    /// (row stride, column stride) of a logical `[rows x cols]` operand.
    fn strides(self, rows: usize, cols: usize) -> (isize, isize) {
        match self {
            Transpose::No => (cols as isize, 1),
            Transpose::Yes => (1, rows as isize),
        }
    }
}

/// General matrix-matrix product. Panics if a slice is too short for the
/// requested dimensions.
#[allow(clippy::too_many_arguments)]
pub fn gemm(
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: f32,
    c: &mut [f32],
) {
    assert!(a.len() >= m * k, "gemm: A has {} elements, need {}", a.len(), m * k);
    assert!(b.len() >= k * n, "gemm: B has {} elements, need {}", b.len(), k * n);
    assert!(c.len() >= m * n, "gemm: C has {} elements, need {}", c.len(), m * n);
    if m == 0 || n == 0 {
        return;
    }
    if k == 0 {
        // matrixmultiply leaves C untouched for an empty inner dimension.
        for x in &mut c[..m * n] {
            *x = if beta == 0.0 { 0.0 } else { *x * beta };
        }
        return;
    }
    let (rsa, csa) = trans_a.strides(m, k);
    let (rsb, csb) = trans_b.strides(k, n);
    // SAFETY: the asserts above guarantee every index sgemm touches
    // (at most (m-1)*rs + (k-1)*cs for each operand) lies inside the slice.
    unsafe {
        matrixmultiply::sgemm(
            m,
            k,
            n,
            alpha,
            a.as_ptr(),
            rsa,
            csa,
            b.as_ptr(),
            rsb,
            csb,
            beta,
            c.as_mut_ptr(),
            n as isize,
            1,
        );
    }
}

/// Matrix-vector product over an `[m x n]` row-major matrix.
#[allow(clippy::too_many_arguments)]
pub fn gemv(
    trans_a: Transpose,
    m: usize,
    n: usize,
    alpha: f32,
    a: &[f32],
    x: &[f32],
    beta: f32,
    y: &mut [f32],
) {
    match trans_a {
        // y[m] = A[m x n] * x[n]
        Transpose::No => gemm(Transpose::No, Transpose::No, m, 1, n, alpha, a, x, beta, y),
        // y[n] = A^T[n x m] * x[m]
        Transpose::Yes => gemm(Transpose::Yes, Transpose::No, n, 1, m, alpha, a, x, beta, y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(ta: Transpose, tb: Transpose, m: usize, n: usize, k: usize, a: &[f32], b: &[f32]) -> Vec<f32> {
        let at = |i: usize, p: usize| match ta {
            Transpose::No => a[i * k + p],
            Transpose::Yes => a[p * m + i],
        };
        let bt = |p: usize, j: usize| match tb {
            Transpose::No => b[p * n + j],
            Transpose::Yes => b[j * k + p],
        };
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                c[i * n + j] = (0..k).map(|p| at(i, p) * bt(p, j)).sum();
            }
        }
        c
    }

    #[test]
    fn gemm_all_transpose_combinations() {
        let (m, n, k) = (3, 4, 5);
        let a: Vec<f32> = (0..m * k).map(|i| i as f32 * 0.5 - 2.0).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i % 7) as f32 - 3.0).collect();
        for ta in [Transpose::No, Transpose::Yes] {
            for tb in [Transpose::No, Transpose::Yes] {
                let mut c = vec![0.0; m * n];
                gemm(ta, tb, m, n, k, 1.0, &a, &b, 0.0, &mut c);
                let want = naive(ta, tb, m, n, k, &a, &b);
                for (g, w) in c.iter().zip(&want) {
                    assert!((g - w).abs() < 1e-4, "{ta:?}/{tb:?}: {g} vs {w}");
                }
            }
        }
    }

    #[test]
    fn gemm_accumulates_with_beta() {
        let a = [1.0, 2.0];
        let b = [3.0, 4.0];
        let mut c = [10.0];
        gemm(Transpose::No, Transpose::No, 1, 1, 2, 2.0, &a, &b, 1.0, &mut c);
        assert_eq!(c, [10.0 + 2.0 * 11.0]);
    }

    #[test]
    fn gemv_both_orientations() {
        // A = [[1, 2, 3], [4, 5, 6]]
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut y = [0.0; 2];
        gemv(Transpose::No, 2, 3, 1.0, &a, &[1.0, 1.0, 1.0], 0.0, &mut y);
        assert_eq!(y, [6.0, 15.0]);
        let mut y = [0.0; 3];
        gemv(Transpose::Yes, 2, 3, 1.0, &a, &[1.0, 1.0], 0.0, &mut y);
        assert_eq!(y, [5.0, 7.0, 9.0]);
    }

    #[test]
    fn empty_inner_dimension_scales_c() {
        let mut c = [2.0, 4.0];
        gemm(Transpose::No, Transpose::No, 1, 2, 0, 1.0, &[], &[], 0.5, &mut c);
        assert_eq!(c, [1.0, 2.0]);
    }
}
