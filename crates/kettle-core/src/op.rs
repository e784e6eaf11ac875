// Element-wise operation vocabulary shared by both backends.
//
// The host tensor applies these with a plain loop; the device backend ships
// the op code and its parameter to a single switch-based kernel. Keeping one
// enum guarantees both sides agree on what e.g. `Elu(1.0)` means.

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[inline]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }

    /// Op code understood by the device math kernels.
    pub fn code(self) -> i32 {
        match self {
            BinaryOp::Add => 0,
            BinaryOp::Sub => 1,
            BinaryOp::Mul => 2,
            BinaryOp::Div => 3,
        }
    }
}

/// Element-wise unary operations, some carrying a scalar parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    AddScalar(f32),
    MulScalar(f32),
    Sqr,
    Sqrt,
    Abs,
    Exp,
    Log,
    Powx(f32),
    Tanh,
    Sigmoid,
    /// `max(x, 0) + alpha * (exp(min(x, 0)) - 1)`
    Elu(f32),
    /// Leaky ReLU; a slope of `0.0` is the plain rectifier.
    Relu(f32),
    /// Reciprocal.
    Inv,
}

impl UnaryOp {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::AddScalar(s) => x + s,
            UnaryOp::MulScalar(s) => x * s,
            UnaryOp::Sqr => x * x,
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Abs => x.abs(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Powx(p) => x.powf(p),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Elu(alpha) => x.max(0.0) + alpha * (x.min(0.0).exp() - 1.0),
            UnaryOp::Relu(slope) => {
                if x > 0.0 {
                    x
                } else {
                    x * slope
                }
            }
            UnaryOp::Inv => 1.0 / x,
        }
    }

    /// Op code and scalar parameter understood by the device math kernels.
    pub fn code(self) -> (i32, f32) {
        match self {
            UnaryOp::AddScalar(s) => (0, s),
            UnaryOp::MulScalar(s) => (1, s),
            UnaryOp::Sqr => (2, 0.0),
            UnaryOp::Sqrt => (3, 0.0),
            UnaryOp::Abs => (4, 0.0),
            UnaryOp::Exp => (5, 0.0),
            UnaryOp::Log => (6, 0.0),
            UnaryOp::Powx(p) => (7, p),
            UnaryOp::Tanh => (8, 0.0),
            UnaryOp::Sigmoid => (9, 0.0),
            UnaryOp::Elu(a) => (10, a),
            UnaryOp::Relu(s) => (11, s),
            UnaryOp::Inv => (12, 0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elu_matches_closed_form() {
        let elu = UnaryOp::Elu(1.0);
        assert_eq!(elu.apply(2.0), 2.0);
        assert!((elu.apply(-1.0) - ((-1.0f32).exp() - 1.0)).abs() < 1e-7);
        assert_eq!(elu.apply(0.0), 0.0);
    }

    #[test]
    fn leaky_relu_slope() {
        assert_eq!(UnaryOp::Relu(0.0).apply(-3.0), 0.0);
        assert!((UnaryOp::Relu(0.1).apply(-3.0) + 0.3).abs() < 1e-6);
        assert_eq!(UnaryOp::Relu(0.1).apply(3.0), 3.0);
    }

    #[test]
    fn op_codes_are_distinct() {
        let ops = [
            UnaryOp::AddScalar(0.0),
            UnaryOp::MulScalar(0.0),
            UnaryOp::Sqr,
            UnaryOp::Sqrt,
            UnaryOp::Abs,
            UnaryOp::Exp,
            UnaryOp::Log,
            UnaryOp::Powx(0.0),
            UnaryOp::Tanh,
            UnaryOp::Sigmoid,
            UnaryOp::Elu(0.0),
            UnaryOp::Relu(0.0),
            UnaryOp::Inv,
        ];
        let mut codes: Vec<i32> = ops.iter().map(|o| o.code().0).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), ops.len());
    }
}
