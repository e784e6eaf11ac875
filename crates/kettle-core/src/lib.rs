//! # kettle-core
//!
//! Host-side building blocks of the kettle inference runtime.
//!
//! This crate provides:
//! - [`HostTensor`] — flat f32 buffer that owns or borrows its storage
//! - [`UnaryOp`] / [`BinaryOp`] — element-wise op vocabulary shared with the device backend
//! - [`blas`] — row-major `gemm` / `gemv` on top of `matrixmultiply`
//! - [`ConvGeometry`] — im2col / col2im lowering for convolutions
//! - [`ChannelStats`] — two-stage per-channel mean / variance
//! - [`WeightBlob`] / [`WeightRef`] — the parameter file and offsets into it

pub mod blas;
pub mod error;
pub mod lowering;
pub mod op;
pub mod stats;
pub mod tensor;
pub mod weights;

pub use error::{Error, Result};
pub use lowering::ConvGeometry;
pub use op::{BinaryOp, UnaryOp};
pub use stats::ChannelStats;
pub use tensor::HostTensor;
pub use weights::{WeightBlob, WeightBlobBuilder, WeightRef};
