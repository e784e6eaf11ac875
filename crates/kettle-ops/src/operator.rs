// Operator — the closed set of operator kinds and backend dispatch
//
// A generated network driver holds a list of `Operator`s and calls them in
// topological order. Each call is routed explicitly:
//
//   Operator::execute         host tensors in, host tensors out
//   Operator::execute_buffers caller-owned host buffers
//   Operator::execute_device  device tensors (feature `cuda`)
//   Backend::run              picks one of the above from the tensor kind
//
// Single-input operators take exactly one tensor. Split yields `outputs`
// tensors; Eltwise consumes `inputs` tensors.

use kettle_core::{Error, HostTensor, Result, WeightBlob};

#[cfg(feature = "cuda")]
use kettle_cuda::{DeviceContext, DeviceTensor, DeviceWeights};

use crate::activation::Activation;
use crate::batchnorm::BatchNorm;
use crate::conv::{Convolution, Deconvolution};
use crate::eltwise::Eltwise;
use crate::module::{check_arity, Forward};
use crate::rnn::StackedRnn;
use crate::scale::Scale;
use crate::split::Split;

#[derive(Debug)]
pub enum Operator {
    Activation(Activation),
    BatchNorm(BatchNorm),
    Scale(Scale),
    Convolution(Convolution),
    Deconvolution(Deconvolution),
    Rnn(StackedRnn),
    Split(Split),
    Eltwise(Eltwise),
}

impl Operator {
    pub fn name(&self) -> &'static str {
        self.single().map_or("eltwise", |f| f.name())
    }

    /// The single-input view of every operator except Eltwise.
    fn single(&self) -> Option<&dyn Forward> {
        let f: &dyn Forward = match self {
            Operator::Activation(op) => op,
            Operator::BatchNorm(op) => op,
            Operator::Scale(op) => op,
            Operator::Convolution(op) => op,
            Operator::Deconvolution(op) => op,
            Operator::Rnn(op) => op,
            Operator::Split(op) => op,
            Operator::Eltwise(_) => return None,
        };
        Some(f)
    }

    /// Number of tensors `execute` expects.
    pub fn input_arity(&self) -> usize {
        match self {
            Operator::Eltwise(e) => e.inputs(),
            _ => 1,
        }
    }

    /// Number of tensors `execute` returns.
    pub fn output_arity(&self) -> usize {
        match self {
            Operator::Split(s) => s.outputs(),
            _ => 1,
        }
    }

    pub fn execute<'a>(
        &self,
        weights: &WeightBlob,
        inputs: Vec<HostTensor<'a>>,
    ) -> Result<Vec<HostTensor<'a>>> {
        let _span = tracing::trace_span!("execute", op = self.name()).entered();
        check_arity(self.name(), self.input_arity(), inputs.len())?;
        match self {
            Operator::Eltwise(e) => {
                let refs: Vec<&HostTensor<'a>> = inputs.iter().collect();
                Ok(vec![e.forward(&refs)?])
            }
            Operator::Split(s) => {
                let x = only(inputs)?;
                Ok(s.split(&x)?)
            }
            other => {
                let f = forward_of(other)?;
                Ok(vec![f.forward(weights, only(inputs)?)?])
            }
        }
    }

    pub fn execute_buffers(
        &self,
        weights: &WeightBlob,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<()> {
        let _span = tracing::trace_span!("execute_buffers", op = self.name()).entered();
        match self {
            Operator::Eltwise(e) => e.forward_buffers(inputs, outputs),
            other => forward_of(other)?.forward_buffers(weights, inputs, outputs),
        }
    }

    #[cfg(feature = "cuda")]
    pub fn execute_device<'a>(
        &self,
        ctx: &DeviceContext,
        weights: &DeviceWeights,
        inputs: Vec<DeviceTensor<'a>>,
    ) -> Result<Vec<DeviceTensor<'a>>> {
        let _span = tracing::trace_span!("execute_device", op = self.name()).entered();
        check_arity(self.name(), self.input_arity(), inputs.len())?;
        match self {
            Operator::Eltwise(e) => {
                let refs: Vec<&DeviceTensor<'a>> = inputs.iter().collect();
                Ok(vec![e.forward_device(ctx, &refs)?])
            }
            Operator::Split(s) => {
                let x = only(inputs)?;
                Ok(s.split_device(ctx, &x)?)
            }
            other => {
                let f = forward_of(other)?;
                Ok(vec![f.forward_device(ctx, weights, only(inputs)?)?])
            }
        }
    }
}

fn forward_of(op: &Operator) -> Result<&dyn Forward> {
    op.single()
        .ok_or_else(|| Error::msg(format!("{} has no single-input form", op.name())))
}

fn only<T>(mut inputs: Vec<T>) -> Result<T> {
    let got = inputs.len();
    match (inputs.pop(), got) {
        (Some(x), 1) => Ok(x),
        _ => Err(Error::ArityMismatch {
            op: "operator",
            expected: 1,
            got,
        }),
    }
}

macro_rules! operator_from {
    ($($ty:ident),*) => {
        $(impl From<$ty> for Operator {
            fn from(op: $ty) -> Self {
                Operator::$ty(op)
            }
        })*
    };
}

operator_from!(Activation, BatchNorm, Scale, Convolution, Deconvolution, Split, Eltwise);

impl From<StackedRnn> for Operator {
    fn from(op: StackedRnn) -> Self {
        Operator::Rnn(op)
    }
}

/// Run one operator on the host.
pub fn execute<'a>(op: &Operator, weights: &WeightBlob, input: HostTensor<'a>) -> Result<HostTensor<'a>> {
    only(op.execute(weights, vec![input])?)
}

/// Run one operator on a device. Work is queued, not awaited.
#[cfg(feature = "cuda")]
pub fn execute_device<'a>(
    op: &Operator,
    ctx: &DeviceContext,
    weights: &DeviceWeights,
    input: DeviceTensor<'a>,
) -> Result<DeviceTensor<'a>> {
    only(op.execute_device(ctx, weights, vec![input])?)
}

/// A tensor on either backend.
#[derive(Debug)]
pub enum Tensor<'a> {
    Host(HostTensor<'a>),
    #[cfg(feature = "cuda")]
    Device(DeviceTensor<'a>),
}

impl<'a> From<HostTensor<'a>> for Tensor<'a> {
    fn from(t: HostTensor<'a>) -> Self {
        Tensor::Host(t)
    }
}

#[cfg(feature = "cuda")]
impl<'a> From<DeviceTensor<'a>> for Tensor<'a> {
    fn from(t: DeviceTensor<'a>) -> Self {
        Tensor::Device(t)
    }
}

impl<'a> Tensor<'a> {
    pub fn count(&self) -> usize {
        match self {
            Tensor::Host(t) => t.count(),
            #[cfg(feature = "cuda")]
            Tensor::Device(t) => t.count(),
        }
    }

    pub fn into_host(self) -> Result<HostTensor<'a>> {
        match self {
            Tensor::Host(t) => Ok(t),
            #[cfg(feature = "cuda")]
            Tensor::Device(_) => Err(Error::BackendMismatch(
                "expected a host tensor, found a device tensor".into(),
            )),
        }
    }

    #[cfg(feature = "cuda")]
    pub fn into_device(self) -> Result<DeviceTensor<'a>> {
        match self {
            Tensor::Device(t) => Ok(t),
            Tensor::Host(_) => Err(Error::BackendMismatch(
                "expected a device tensor, found a host tensor".into(),
            )),
        }
    }
}

/// Where operators run, with the weights resolved for that backend.
#[derive(Debug, Clone, Copy)]
pub enum Backend<'b> {
    Host {
        weights: &'b WeightBlob,
    },
    #[cfg(feature = "cuda")]
    Device {
        ctx: &'b DeviceContext,
        weights: &'b DeviceWeights,
    },
}

impl<'b> Backend<'b> {
    /// Execute `op` on this backend. Every input must live on it.
    pub fn run<'a>(&self, op: &Operator, inputs: Vec<Tensor<'a>>) -> Result<Vec<Tensor<'a>>> {
        match *self {
            Backend::Host { weights } => {
                let host = inputs
                    .into_iter()
                    .map(Tensor::into_host)
                    .collect::<Result<Vec<_>>>()?;
                Ok(op.execute(weights, host)?.into_iter().map(Tensor::Host).collect())
            }
            #[cfg(feature = "cuda")]
            Backend::Device { ctx, weights } => {
                let dev = inputs
                    .into_iter()
                    .map(Tensor::into_device)
                    .collect::<Result<Vec<_>>>()?;
                Ok(op
                    .execute_device(ctx, weights, dev)?
                    .into_iter()
                    .map(Tensor::Device)
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_then_eltwise_doubles() {
        let blob = WeightBlob::default();
        let split = Operator::from(Split::new(3, 2).unwrap());
        let sum = Operator::from(Eltwise::sum(3, 2).unwrap());
        let x = HostTensor::from_vec(vec![1.0, -2.0, 0.5]);
        let branches = split.execute(&blob, vec![x]).unwrap();
        assert_eq!(branches.len(), 2);
        let y = sum.execute(&blob, branches).unwrap();
        assert_eq!(y[0].to_vec(), vec![2.0, -4.0, 1.0]);
    }

    #[test]
    fn arity_is_checked() {
        let blob = WeightBlob::default();
        let relu = Operator::from(Activation::relu(0.0, 2, false));
        let two = vec![HostTensor::zeros(2), HostTensor::zeros(2)];
        assert!(matches!(
            relu.execute(&blob, two),
            Err(Error::ArityMismatch { expected: 1, got: 2, .. })
        ));
        assert!(execute(&Operator::from(Eltwise::sum(2, 2).unwrap()), &blob, HostTensor::zeros(2)).is_err());
    }

    #[test]
    fn host_backend_routes_host_tensors() {
        let blob = WeightBlob::default();
        let backend = Backend::Host { weights: &blob };
        let op = Operator::from(Activation::tanh(1, true));
        let out = backend
            .run(&op, vec![HostTensor::from_vec(vec![0.0]).into()])
            .unwrap();
        assert_eq!(out.len(), 1);
        let t = out.into_iter().next().unwrap().into_host().unwrap();
        assert_eq!(t.to_vec(), vec![0.0]);
    }

    #[test]
    fn names() {
        assert_eq!(Operator::from(Activation::elu(1.0, 1, false)).name(), "elu");
        assert_eq!(Operator::from(Split::new(1, 1).unwrap()).name(), "split");
        assert_eq!(Operator::from(Eltwise::max(1, 2).unwrap()).name(), "eltwise");
    }
}
