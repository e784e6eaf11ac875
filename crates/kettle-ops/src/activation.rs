// Activation operators — ReLU, ELU, TanH, Sigmoid
//
// Element-wise nonlinearities with no parameters beyond a scalar:
//
//   ReLU     x > 0 ? x : x * negative_slope
//   ELU      max(x, 0) + alpha * (exp(min(x, 0)) - 1)
//   TanH     tanh(x)
//   Sigmoid  1 / (1 + exp(-x))
//
// With `inplace` the input buffer is overwritten and handed back; otherwise
// the result lands in a new owned tensor and the input is left alone.

use kettle_core::{HostTensor, Result, UnaryOp, WeightBlob};

#[cfg(feature = "cuda")]
use kettle_cuda::{DeviceContext, DeviceTensor, DeviceWeights};

use crate::module::{unary_buffers, Forward};

/// Which nonlinearity an [`Activation`] applies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationKind {
    Relu { negative_slope: f32 },
    Elu { alpha: f32 },
    TanH,
    Sigmoid,
}

impl ActivationKind {
    /// The element-wise op both backends execute.
    pub fn op(self) -> UnaryOp {
        match self {
            ActivationKind::Relu { negative_slope } => UnaryOp::Relu(negative_slope),
            ActivationKind::Elu { alpha } => UnaryOp::Elu(alpha),
            ActivationKind::TanH => UnaryOp::Tanh,
            ActivationKind::Sigmoid => UnaryOp::Sigmoid,
        }
    }
}

/// Element-wise activation over `count` values.
#[derive(Debug, Clone)]
pub struct Activation {
    kind: ActivationKind,
    count: usize,
    inplace: bool,
}

impl Activation {
    pub fn new(kind: ActivationKind, count: usize, inplace: bool) -> Self {
        tracing::debug!(?kind, count, inplace, "activation");
        Activation {
            kind,
            count,
            inplace,
        }
    }

    pub fn relu(negative_slope: f32, count: usize, inplace: bool) -> Self {
        Self::new(ActivationKind::Relu { negative_slope }, count, inplace)
    }

    pub fn elu(alpha: f32, count: usize, inplace: bool) -> Self {
        Self::new(ActivationKind::Elu { alpha }, count, inplace)
    }

    pub fn tanh(count: usize, inplace: bool) -> Self {
        Self::new(ActivationKind::TanH, count, inplace)
    }

    pub fn sigmoid(count: usize, inplace: bool) -> Self {
        Self::new(ActivationKind::Sigmoid, count, inplace)
    }

    pub fn kind(&self) -> ActivationKind {
        self.kind
    }

    pub fn is_inplace(&self) -> bool {
        self.inplace
    }
}

impl Forward for Activation {
    fn name(&self) -> &'static str {
        match self.kind {
            ActivationKind::Relu { .. } => "relu",
            ActivationKind::Elu { .. } => "elu",
            ActivationKind::TanH => "tanh",
            ActivationKind::Sigmoid => "sigmoid",
        }
    }

    fn output_count(&self) -> usize {
        self.count
    }

    fn forward<'a>(&self, _weights: &WeightBlob, mut input: HostTensor<'a>) -> Result<HostTensor<'a>> {
        if self.inplace {
            input.unary_inplace(self.kind.op());
            Ok(input)
        } else {
            Ok(input.unary(self.kind.op()))
        }
    }

    fn forward_buffers(
        &self,
        _weights: &WeightBlob,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<()> {
        let (input, output) = unary_buffers(self.name(), inputs, outputs)?;
        kettle_core::ensure_count!(input.len(), output.len());
        let op = self.kind.op();
        for (o, &x) in output.iter_mut().zip(input) {
            *o = op.apply(x);
        }
        Ok(())
    }

    #[cfg(feature = "cuda")]
    fn forward_device<'a>(
        &self,
        ctx: &DeviceContext,
        _weights: &DeviceWeights,
        mut input: DeviceTensor<'a>,
    ) -> Result<DeviceTensor<'a>> {
        if self.inplace {
            input.unary_inplace(ctx, self.kind.op())?;
            Ok(input)
        } else {
            input.unary(ctx, self.kind.op())
        }
    }
}
