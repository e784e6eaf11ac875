// Device copy of the weight blob
//
// The whole blob is uploaded once; operators resolve their `WeightRef`s to
// device addresses inside it, with the same bounds check as on the host.

use cudarc::driver::{CudaSlice, DevicePtr};

use kettle_core::{Result, WeightBlob, WeightRef};

use crate::context::DeviceContext;

/// All network parameters resident on one device.
pub struct DeviceWeights {
    data: CudaSlice<f32>,
    len: usize,
}

impl DeviceWeights {
    pub fn upload(ctx: &DeviceContext, blob: &WeightBlob) -> Result<Self> {
        let data = ctx.upload(blob.as_slice())?;
        tracing::info!(floats = blob.len(), ordinal = ctx.ordinal(), "uploaded weights");
        Ok(DeviceWeights {
            data,
            len: blob.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Device address of the parameter tensor `r`.
    pub fn ptr(&self, r: WeightRef) -> Result<u64> {
        r.check(self.len)?;
        Ok(*self.data.device_ptr() + (r.offset * std::mem::size_of::<f32>()) as u64)
    }

    /// Address of an optional parameter; absent ones map to null.
    pub fn ptr_opt(&self, r: Option<WeightRef>) -> Result<Option<u64>> {
        r.map(|r| self.ptr(r)).transpose()
    }
}

impl std::fmt::Debug for DeviceWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceWeights({} floats)", self.len)
    }
}
