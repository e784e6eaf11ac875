/// All errors that can occur within kettle.
///
/// A single error type is shared by the host runtime, the device backend and
/// the operators so that `?` works across crate boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The weight file does not have the size the network was generated for.
    #[error("weight blob size mismatch: expected {expected} bytes, got {got}")]
    WeightSizeMismatch { expected: usize, got: usize },

    /// A weight reference points past the end of the blob.
    #[error("weight ref [{offset}, {offset}+{len}) out of range for blob of {blob_len} floats")]
    WeightOutOfRange {
        offset: usize,
        len: usize,
        blob_len: usize,
    },

    /// A byte offset into the weight blob is not float aligned.
    #[error("weight byte offset {offset} is not aligned to 4 bytes")]
    MisalignedWeightOffset { offset: usize },

    /// Operator parameters that can never describe a valid computation.
    #[error("invalid {op} parameters: {reason}")]
    InvalidParams { op: &'static str, reason: String },

    /// A tensor was split into pieces that do not divide its length.
    #[error("cannot chunk {count} elements into {pieces} equal pieces")]
    ChunkMismatch { count: usize, pieces: usize },

    /// Two buffers that must have the same element count do not.
    #[error("element count mismatch: expected {expected}, got {got}")]
    CountMismatch { expected: usize, got: usize },

    /// An operator was handed the wrong number of inputs.
    #[error("{op} expects {expected} inputs, got {got}")]
    ArityMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// Tensors from a backend other than the one the call was routed to.
    #[error("backend mismatch: {0}")]
    BackendMismatch(String),

    /// Failure reported by the device driver or the kernel compiler.
    #[error("device error: {0}")]
    Device(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create an invalid-parameter error for operator `op`.
    pub fn invalid(op: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParams {
            op,
            reason: reason.into(),
        }
    }

    /// Wrap a driver / compiler error.
    pub fn device(e: impl std::fmt::Display) -> Self {
        Error::Device(e.to_string())
    }
}

/// Convenience Result type used throughout kettle.
pub type Result<T> = std::result::Result<T, Error>;

/// Bail out of a function with an error message.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

/// Bail out unless two element counts agree.
#[macro_export]
macro_rules! ensure_count {
    ($expected:expr, $got:expr) => {{
        let (expected, got) = ($expected, $got);
        if expected != got {
            return Err($crate::Error::CountMismatch { expected, got });
        }
    }};
}
