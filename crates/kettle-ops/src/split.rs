// Split — fan one value out to several independent consumers

use kettle_core::{HostTensor, Result, WeightBlob};

#[cfg(feature = "cuda")]
use kettle_cuda::{DeviceContext, DeviceTensor, DeviceWeights};

use crate::module::{check_arity, Forward};

const OP: &str = "split";

/// Copies an input of `count` elements into `outputs` separate buffers.
#[derive(Debug, Clone)]
pub struct Split {
    count: usize,
    outputs: usize,
}

impl Split {
    pub fn new(count: usize, outputs: usize) -> Result<Self> {
        if outputs == 0 {
            return Err(kettle_core::Error::invalid(OP, "at least one output is required"));
        }
        tracing::debug!(count, outputs, "split");
        Ok(Split { count, outputs })
    }

    pub fn outputs(&self) -> usize {
        self.outputs
    }

    /// One owned copy of `input` per output.
    pub fn split(&self, input: &HostTensor<'_>) -> Result<Vec<HostTensor<'static>>> {
        kettle_core::ensure_count!(self.count, input.count());
        Ok((0..self.outputs).map(|_| input.duplicate()).collect())
    }

    #[cfg(feature = "cuda")]
    pub fn split_device(
        &self,
        ctx: &DeviceContext,
        input: &DeviceTensor<'_>,
    ) -> Result<Vec<DeviceTensor<'static>>> {
        kettle_core::ensure_count!(self.count, input.count());
        (0..self.outputs).map(|_| input.duplicate(ctx)).collect()
    }
}

impl Forward for Split {
    fn name(&self) -> &'static str {
        OP
    }

    fn output_count(&self) -> usize {
        self.count
    }

    /// Single-output form: a plain copy.
    fn forward<'a>(&self, _weights: &WeightBlob, input: HostTensor<'a>) -> Result<HostTensor<'a>> {
        kettle_core::ensure_count!(self.count, input.count());
        Ok(input.duplicate())
    }

    fn forward_buffers(
        &self,
        _weights: &WeightBlob,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<()> {
        check_arity(OP, 1, inputs.len())?;
        check_arity(OP, self.outputs, outputs.len())?;
        let input = inputs[0];
        kettle_core::ensure_count!(self.count, input.len());
        for out in outputs.iter_mut() {
            kettle_core::ensure_count!(self.count, out.len());
            out.copy_from_slice(input);
        }
        Ok(())
    }

    #[cfg(feature = "cuda")]
    fn forward_device<'a>(
        &self,
        ctx: &DeviceContext,
        _weights: &DeviceWeights,
        input: DeviceTensor<'a>,
    ) -> Result<DeviceTensor<'a>> {
        kettle_core::ensure_count!(self.count, input.count());
        input.duplicate(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_are_independent() {
        let split = Split::new(3, 2).unwrap();
        let mut outs = split.split(&HostTensor::from_vec(vec![1.0, 2.0, 3.0])).unwrap();
        outs[0].mul_scalar(10.0);
        assert_eq!(outs[1].to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(outs[0].to_vec(), vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn buffer_form_fills_every_output() {
        let split = Split::new(2, 3).unwrap();
        let blob = WeightBlob::default();
        let input = [4.0f32, 5.0];
        let (mut a, mut b, mut c) = ([0.0f32; 2], [0.0f32; 2], [0.0f32; 2]);
        split
            .forward_buffers(&blob, &[&input[..]], &mut [&mut a[..], &mut b[..], &mut c[..]])
            .unwrap();
        assert_eq!((a, b, c), (input, input, input));
        let mut short = [0.0f32; 2];
        assert!(split
            .forward_buffers(&blob, &[&input[..]], &mut [&mut short[..]])
            .is_err());
    }

    #[test]
    fn zero_outputs_rejected() {
        assert!(Split::new(4, 0).is_err());
    }
}
