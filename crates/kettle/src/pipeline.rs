// Pipeline — a chain of single-input operators run back to back
//
// The simplest network driver: each operator's output is the next one's
// input. Graphs with fan-out (Split) or fan-in (Eltwise) are wired by hand
// with `Operator::execute`; a pipeline only holds operators with a
// single-input form.
//
//   let net = Pipeline::new()
//       .push(Convolution::new(..)?)?
//       .push(Activation::relu(0.0, n, true))?;
//   let y = net.forward(&weights, x)?;

use kettle_core::{Error, HostTensor, Result, WeightBlob};
use kettle_ops::{execute, Operator};

#[cfg(feature = "cuda")]
use kettle_cuda::{DeviceContext, DeviceTensor, DeviceWeights};

/// Operators applied in order.
#[derive(Debug, Default)]
pub struct Pipeline {
    ops: Vec<Operator>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline { ops: Vec::new() }
    }

    /// Append an operator. Eltwise has no single-input form and is rejected.
    pub fn push(mut self, op: impl Into<Operator>) -> Result<Self> {
        let op = op.into();
        if op.input_arity() != 1 || op.output_arity() != 1 {
            return Err(Error::invalid(
                "pipeline",
                format!("{} does not map one tensor to one tensor", op.name()),
            ));
        }
        self.ops.push(op);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn operators(&self) -> &[Operator] {
        &self.ops
    }

    pub fn forward<'a>(&self, weights: &WeightBlob, input: HostTensor<'a>) -> Result<HostTensor<'a>> {
        let mut x = input;
        for op in &self.ops {
            x = execute(op, weights, x)?;
        }
        Ok(x)
    }

    /// Copy `input` in, run, copy the result out.
    pub fn infer(&self, weights: &WeightBlob, input: &[f32]) -> Result<Vec<f32>> {
        Ok(self.forward(weights, HostTensor::from_slice(input))?.into_vec())
    }

    /// Queue the whole chain on a device.
    #[cfg(feature = "cuda")]
    pub fn forward_device<'a>(
        &self,
        ctx: &DeviceContext,
        weights: &DeviceWeights,
        input: DeviceTensor<'a>,
    ) -> Result<DeviceTensor<'a>> {
        let mut x = input;
        for op in &self.ops {
            x = kettle_ops::execute_device(op, ctx, weights, x)?;
        }
        Ok(x)
    }

    /// Upload `input`, run, and read the result back (blocking).
    #[cfg(feature = "cuda")]
    pub fn infer_device(
        &self,
        ctx: &DeviceContext,
        weights: &DeviceWeights,
        input: &[f32],
    ) -> Result<Vec<f32>> {
        let x = DeviceTensor::from_host(ctx, input)?;
        self.forward_device(ctx, weights, x)?.to_vec(ctx)
    }
}
