// Eltwise — combine equally shaped inputs position by position
//
//   Sum   y = sum_k coeff[k] * x_k      (coefficients default to 1)
//   Prod  y = prod_k x_k
//   Max   y = max_k x_k
//
// The fan-in half of a residual connection. Inputs are read only; the result
// is always a fresh buffer.

use kettle_core::{Error, HostTensor, Result};

#[cfg(feature = "cuda")]
use kettle_cuda::{DeviceContext, DeviceTensor, KernelArg, KernelLaunch, MathKernel};

use crate::module::check_arity;

const OP: &str = "eltwise";

#[derive(Debug, Clone, PartialEq)]
pub enum EltwiseOp {
    Sum { coeffs: Vec<f32> },
    Prod,
    Max,
}

impl EltwiseOp {
    /// Kernel op code.
    #[cfg(feature = "cuda")]
    fn code(&self) -> i32 {
        match self {
            EltwiseOp::Sum { .. } => 0,
            EltwiseOp::Prod => 1,
            EltwiseOp::Max => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Eltwise {
    op: EltwiseOp,
    count: usize,
    inputs: usize,
}

impl Eltwise {
    pub fn new(op: EltwiseOp, count: usize, inputs: usize) -> Result<Self> {
        if inputs < 2 {
            return Err(Error::invalid(OP, format!("needs at least two inputs, got {inputs}")));
        }
        if let EltwiseOp::Sum { coeffs } = &op {
            if coeffs.len() != inputs {
                return Err(Error::invalid(
                    OP,
                    format!("{} coefficients for {inputs} inputs", coeffs.len()),
                ));
            }
        }
        tracing::debug!(?op, count, inputs, "eltwise");
        Ok(Eltwise { op, count, inputs })
    }

    /// Plain sum: every coefficient is 1.
    pub fn sum(count: usize, inputs: usize) -> Result<Self> {
        Self::new(
            EltwiseOp::Sum {
                coeffs: vec![1.0; inputs],
            },
            count,
            inputs,
        )
    }

    pub fn prod(count: usize, inputs: usize) -> Result<Self> {
        Self::new(EltwiseOp::Prod, count, inputs)
    }

    pub fn max(count: usize, inputs: usize) -> Result<Self> {
        Self::new(EltwiseOp::Max, count, inputs)
    }

    pub fn op(&self) -> &EltwiseOp {
        &self.op
    }

    pub fn inputs(&self) -> usize {
        self.inputs
    }

    pub fn output_count(&self) -> usize {
        self.count
    }

    fn combine(&self, inputs: &[&[f32]], out: &mut [f32]) -> Result<()> {
        check_arity(OP, self.inputs, inputs.len())?;
        kettle_core::ensure_count!(self.count, out.len());
        for x in inputs {
            kettle_core::ensure_count!(self.count, x.len());
        }
        match &self.op {
            EltwiseOp::Sum { coeffs } => {
                out.iter_mut().for_each(|y| *y = 0.0);
                for (x, &k) in inputs.iter().zip(coeffs) {
                    for (y, &v) in out.iter_mut().zip(*x) {
                        *y += k * v;
                    }
                }
            }
            EltwiseOp::Prod => {
                out.copy_from_slice(inputs[0]);
                for x in &inputs[1..] {
                    out.iter_mut().zip(*x).for_each(|(y, &v)| *y *= v);
                }
            }
            EltwiseOp::Max => {
                out.copy_from_slice(inputs[0]);
                for x in &inputs[1..] {
                    out.iter_mut().zip(*x).for_each(|(y, &v)| *y = y.max(v));
                }
            }
        }
        Ok(())
    }

    /// Combine host tensors into a new owned tensor.
    pub fn forward(&self, inputs: &[&HostTensor<'_>]) -> Result<HostTensor<'static>> {
        let slices: Vec<&[f32]> = inputs.iter().map(|t| t.as_slice()).collect();
        let mut out = HostTensor::zeros(self.count);
        self.combine(&slices, out.as_mut_slice())?;
        Ok(out)
    }

    /// N input buffers, one output buffer.
    pub fn forward_buffers(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        check_arity(OP, 1, outputs.len())?;
        self.combine(inputs, &mut *outputs[0])
    }

    #[cfg(feature = "cuda")]
    pub fn forward_device(
        &self,
        ctx: &DeviceContext,
        inputs: &[&DeviceTensor<'_>],
    ) -> Result<DeviceTensor<'static>> {
        check_arity(OP, self.inputs, inputs.len())?;
        for x in inputs {
            kettle_core::ensure_count!(self.count, x.count());
        }
        let mut out = inputs[0].duplicate(ctx)?;
        if let EltwiseOp::Sum { coeffs } = &self.op {
            out.mul_scalar(ctx, coeffs[0])?;
        }
        for (k, x) in inputs.iter().enumerate().skip(1) {
            let coeff = match &self.op {
                EltwiseOp::Sum { coeffs } => coeffs[k],
                _ => 1.0,
            };
            ctx.enqueue(&KernelLaunch::math(
                MathKernel::Eltwise,
                self.count,
                vec![
                    KernelArg::Buffer(x.device_ptr()),
                    KernelArg::Buffer(out.device_ptr()),
                    KernelArg::count(self.count)?,
                    KernelArg::I32(self.op.code()),
                    KernelArg::F32(coeff),
                ],
            )?)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_sum() {
        let op = Eltwise::new(EltwiseOp::Sum { coeffs: vec![1.0, -0.5] }, 3, 2).unwrap();
        let a = HostTensor::from_vec(vec![1.0, 2.0, 3.0]);
        let b = HostTensor::from_vec(vec![2.0, 2.0, 2.0]);
        assert_eq!(op.forward(&[&a, &b]).unwrap().to_vec(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn prod_and_max() {
        let a = [1.0f32, -2.0, 3.0];
        let b = [4.0f32, 5.0, -6.0];
        let mut out = [0.0f32; 3];
        Eltwise::prod(3, 2)
            .unwrap()
            .forward_buffers(&[&a[..], &b[..]], &mut [&mut out[..]])
            .unwrap();
        assert_eq!(out, [4.0, -10.0, -18.0]);
        Eltwise::max(3, 2)
            .unwrap()
            .forward_buffers(&[&a[..], &b[..]], &mut [&mut out[..]])
            .unwrap();
        assert_eq!(out, [4.0, 5.0, 3.0]);
    }

    #[test]
    fn construction_checks() {
        assert!(Eltwise::sum(3, 1).is_err());
        assert!(Eltwise::new(EltwiseOp::Sum { coeffs: vec![1.0] }, 3, 2).is_err());
        let op = Eltwise::sum(2, 2).unwrap();
        let a = HostTensor::zeros(2);
        let short = HostTensor::zeros(1);
        assert!(op.forward(&[&a, &short]).is_err());
        assert!(op.forward(&[&a]).is_err());
    }
}
