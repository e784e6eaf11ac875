//! # kettle-ops
//!
//! Inference operators for the kettle runtime.
//!
//! Every operator is an immutable parameter struct built once from static
//! shapes and [`WeightRef`](kettle_core::WeightRef)s into the weight blob.
//! Single-input operators implement [`Forward`]; [`Operator`] is the closed
//! set a network driver dispatches over.
//!
//! - [`Activation`] — ReLU, ELU, TanH, Sigmoid
//! - [`BatchNorm`], [`Scale`] — per-channel normalization and affine transform
//! - [`Convolution`], [`Deconvolution`] — im2col / col2im lowering onto GEMM
//! - [`RnnCell`], [`RnnLayer`], [`StackedRnn`] — GRU and LSTM recurrence
//! - [`Split`], [`Eltwise`] — graph fan-out and fan-in
//!
//! With the `cuda` feature every operator also runs on a
//! [`DeviceContext`](kettle_cuda::DeviceContext).

pub mod activation;
pub mod batchnorm;
pub mod conv;
pub mod eltwise;
mod module;
pub mod operator;
pub mod rnn;
pub mod scale;
pub mod split;

pub use activation::{Activation, ActivationKind};
pub use batchnorm::{BatchNorm, GlobalStats};
pub use conv::{ConvParams, Convolution, Deconvolution};
pub use eltwise::{Eltwise, EltwiseOp};
pub use module::Forward;
pub use operator::{execute, Backend, Operator, Tensor};
#[cfg(feature = "cuda")]
pub use operator::execute_device;
pub use rnn::{CellKind, CellWeights, RnnCell, RnnLayer, StackedRnn};
pub use scale::Scale;
pub use split::Split;
