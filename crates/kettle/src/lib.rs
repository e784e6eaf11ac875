//! # Kettle
//!
//! Forward-only runtime for pre-trained, fixed-topology networks.
//!
//! This is the facade crate that re-exports everything a generated network
//! driver needs.
//!
//! ```rust
//! use kettle::prelude::*;
//!
//! let mut b = WeightBlobBuilder::new();
//! let w = b.push(&[2.0]);
//! let weights = b.finish();
//!
//! let net = Pipeline::new()
//!     .push(Convolution::new(ConvParams::new(1, 1, [2, 2], 1, [1, 1]), w, None)?)?
//!     .push(Activation::relu(0.0, 4, true))?;
//! let y = net.infer(&weights, &[1.0, -1.0, 2.0, -2.0])?;
//! assert_eq!(y, vec![2.0, 0.0, 4.0, 0.0]);
//! # Ok::<(), kettle::Error>(())
//! ```
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `kettle-core` | HostTensor, errors, host GEMM, im2col, weight blob |
//! | `kettle-ops` | Operators and backend dispatch |
//! | `kettle-cuda` | CUDA backend (feature `cuda`) |

pub mod config;
pub mod pipeline;

pub use kettle_core::{
    blas, BinaryOp, ConvGeometry, Error, HostTensor, Result, UnaryOp, WeightBlob,
    WeightBlobBuilder, WeightRef,
};

#[cfg(feature = "cuda")]
pub use kettle_cuda::{DeviceContext, DeviceTensor, DeviceWeights};

/// Re-export the operators.
pub mod ops {
    pub use kettle_ops::*;
}

pub use config::{BackendKind, RuntimeConfig};
pub use pipeline::Pipeline;

/// Install a `tracing` subscriber writing to stderr, filtered by `RUST_LOG`
/// (default `warn`). Calling it again is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub mod prelude {
    pub use crate::config::{BackendKind, RuntimeConfig};
    pub use crate::pipeline::Pipeline;
    pub use kettle_core::{Error, HostTensor, Result, WeightBlob, WeightBlobBuilder, WeightRef};
    pub use kettle_ops::{
        Activation, ActivationKind, Backend, BatchNorm, CellKind, CellWeights, ConvParams,
        Convolution, Deconvolution, Eltwise, EltwiseOp, Forward, GlobalStats, Operator, RnnCell,
        RnnLayer, Scale, Split, StackedRnn, Tensor,
    };

    #[cfg(feature = "cuda")]
    pub use kettle_cuda::{DeviceContext, DeviceTensor, DeviceWeights};
}
