// Forward trait — the interface every single-input operator implements
//
// An operator is an immutable parameter struct built once at network
// construction. It never owns parameters; it holds `WeightRef`s and is handed
// the weight blob on every call.
//
// Two call forms exist:
//
//   forward          tensor in, tensor out. In-place operators hand the input
//                    tensor back with its contents replaced; everything else
//                    returns a fresh owned tensor.
//   forward_buffers  caller-provided input and output buffers, for generated
//                    drivers that manage every allocation themselves.
//
// With the `cuda` feature each operator also runs on a DeviceContext.

use kettle_core::{Error, HostTensor, Result, WeightBlob, WeightRef};

#[cfg(feature = "cuda")]
use kettle_cuda::{DeviceContext, DeviceTensor, DeviceWeights};

/// An operator mapping one tensor to one tensor.
pub trait Forward {
    /// Short operator name for logs and errors.
    fn name(&self) -> &'static str;

    /// Element count of the output for a well-formed input.
    fn output_count(&self) -> usize;

    /// Run on the host.
    fn forward<'a>(&self, weights: &WeightBlob, input: HostTensor<'a>) -> Result<HostTensor<'a>>;

    /// Run on the host over caller-provided buffers: one input, one output.
    fn forward_buffers(
        &self,
        weights: &WeightBlob,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<()>;

    /// Run on a device; the work is queued, not awaited.
    #[cfg(feature = "cuda")]
    fn forward_device<'a>(
        &self,
        ctx: &DeviceContext,
        weights: &DeviceWeights,
        input: DeviceTensor<'a>,
    ) -> Result<DeviceTensor<'a>>;
}

/// Fail unless `got` buffers were supplied where `expected` are needed.
pub(crate) fn check_arity(op: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::ArityMismatch { op, expected, got });
    }
    Ok(())
}

/// Split the single-input / single-output buffer form.
pub(crate) fn unary_buffers<'b, 'c, 'd>(
    op: &'static str,
    inputs: &[&'b [f32]],
    outputs: &'c mut [&'d mut [f32]],
) -> Result<(&'b [f32], &'c mut [f32])> {
    check_arity(op, 1, inputs.len())?;
    check_arity(op, 1, outputs.len())?;
    match (inputs.first(), outputs.first_mut()) {
        (Some(i), Some(o)) => Ok((*i, &mut **o)),
        _ => Err(Error::ArityMismatch {
            op,
            expected: 1,
            got: 0,
        }),
    }
}

/// Validate that an optional parameter tensor holds `len` values.
pub(crate) fn check_param(op: &'static str, what: &str, r: Option<WeightRef>, len: usize) -> Result<()> {
    match r {
        Some(r) if r.len != len => Err(Error::invalid(
            op,
            format!("{what} has {} values, expected {len}", r.len),
        )),
        _ => Ok(()),
    }
}
