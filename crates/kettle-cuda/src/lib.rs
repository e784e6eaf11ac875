//! # kettle-cuda
//!
//! CUDA backend of the kettle inference runtime, built on cudarc.
//!
//! - [`DeviceContext`] — device selection, in-order queue, NVRTC-compiled programs
//! - [`DeviceTensor`] — owned or borrowed device buffer with the host tensor's API
//! - [`DeviceWeights`] — the weight blob resident on the device
//! - [`KernelLaunch`] — signature-checked kernel launch descriptor
//! - [`ConvKernelConfig`] — per-configuration convolution program generator

mod context;
pub mod kernels;
pub mod launch;
mod tensor;
mod weights;

pub use context::DeviceContext;
pub use kernels::ConvKernelConfig;
pub use launch::{launch_cfg, ArgKind, KernelArg, KernelKind, KernelLaunch, MathKernel};
pub use tensor::DeviceTensor;
pub use weights::DeviceWeights;
