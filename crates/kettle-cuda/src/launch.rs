// Typed kernel launches
//
// Every kernel has a fixed parameter list. Instead of passing loose tuples at
// each call site, operators build a `KernelLaunch`: which kernel, its
// arguments as typed values, and the launch grid. The argument list is
// checked against the kernel's signature when the launch is built, so a
// missing or mistyped argument is an error before anything reaches the
// driver.

use cudarc::driver::LaunchConfig;

use kettle_core::{Error, Result};

use crate::kernels::ConvKernelConfig;

/// Threads per block for one-dimensional launches.
pub const BLOCK: u32 = 256;

/// Standard launch configuration for `n` independent work items.
pub fn launch_cfg(n: usize) -> LaunchConfig {
    let grid = (n as u32).div_ceil(BLOCK);
    LaunchConfig {
        block_dim: (BLOCK, 1, 1),
        grid_dim: (grid.max(1), 1, 1),
        shared_mem_bytes: 0,
    }
}

/// Type of one kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Device pointer (may be null for optional buffers).
    Buffer,
    U32,
    I32,
    F32,
}

/// One kernel argument value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(u64),
    U32(u32),
    I32(i32),
    F32(f32),
}

impl KernelArg {
    pub fn kind(&self) -> ArgKind {
        match self {
            KernelArg::Buffer(_) => ArgKind::Buffer,
            KernelArg::U32(_) => ArgKind::U32,
            KernelArg::I32(_) => ArgKind::I32,
            KernelArg::F32(_) => ArgKind::F32,
        }
    }

    /// Element count argument; counts past `u32::MAX` are rejected.
    pub fn count(n: usize) -> Result<Self> {
        u32::try_from(n)
            .map(KernelArg::U32)
            .map_err(|_| Error::msg(format!("count {n} does not fit a kernel u32 argument")))
    }

    pub fn flag(b: bool) -> Self {
        KernelArg::I32(i32::from(b))
    }
}

/// Kernels in the math program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathKernel {
    Fill,
    Copy,
    Unary,
    Binary,
    Eltwise,
    Scale,
    ChannelMean,
    BatchSum,
    ChanneledSub,
    BnFactor,
    ChanneledScaleAdd,
    Matvec,
    GruGates,
    LstmGates,
}

impl MathKernel {
    pub const ALL: [MathKernel; 14] = [
        MathKernel::Fill,
        MathKernel::Copy,
        MathKernel::Unary,
        MathKernel::Binary,
        MathKernel::Eltwise,
        MathKernel::Scale,
        MathKernel::ChannelMean,
        MathKernel::BatchSum,
        MathKernel::ChanneledSub,
        MathKernel::BnFactor,
        MathKernel::ChanneledScaleAdd,
        MathKernel::Matvec,
        MathKernel::GruGates,
        MathKernel::LstmGates,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MathKernel::Fill => "fill_f32",
            MathKernel::Copy => "copy_f32",
            MathKernel::Unary => "unary_f32",
            MathKernel::Binary => "binary_f32",
            MathKernel::Eltwise => "eltwise_f32",
            MathKernel::Scale => "scale_f32",
            MathKernel::ChannelMean => "channel_mean_f32",
            MathKernel::BatchSum => "batch_sum_f32",
            MathKernel::ChanneledSub => "channeled_sub_f32",
            MathKernel::BnFactor => "bn_factor_f32",
            MathKernel::ChanneledScaleAdd => "channeled_scale_add_f32",
            MathKernel::Matvec => "matvec_f32",
            MathKernel::GruGates => "gru_gates_f32",
            MathKernel::LstmGates => "lstm_gates_f32",
        }
    }

    pub fn signature(self) -> &'static [ArgKind] {
        use ArgKind::*;
        match self {
            MathKernel::Fill => &[Buffer, F32, U32],
            MathKernel::Copy => &[Buffer, Buffer, U32],
            MathKernel::Unary => &[Buffer, Buffer, U32, I32, F32],
            MathKernel::Binary => &[Buffer, Buffer, Buffer, U32, I32],
            MathKernel::Eltwise => &[Buffer, Buffer, U32, I32, F32],
            MathKernel::Scale => &[Buffer, Buffer, Buffer, U32, U32, U32, I32, I32],
            MathKernel::ChannelMean => &[Buffer, Buffer, U32, U32, F32, I32],
            MathKernel::BatchSum => &[Buffer, Buffer, U32, U32],
            MathKernel::ChanneledSub => &[Buffer, Buffer, U32, U32, U32],
            MathKernel::BnFactor => &[Buffer, Buffer, Buffer, U32, F32, I32],
            MathKernel::ChanneledScaleAdd => &[Buffer, Buffer, Buffer, U32, U32, U32, I32],
            MathKernel::Matvec => &[Buffer, Buffer, Buffer, Buffer, U32, U32, U32, U32, I32],
            MathKernel::GruGates | MathKernel::LstmGates => {
                &[Buffer, Buffer, Buffer, Buffer, U32, U32, U32]
            }
        }
    }

    /// All entry-point names, in the form `load_ptx` wants them.
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|k| k.name()).collect()
    }
}

/// Which program and entry point a launch targets.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelKind {
    Math(MathKernel),
    Conv(ConvKernelConfig),
}

impl KernelKind {
    pub fn name(&self) -> &'static str {
        match self {
            KernelKind::Math(k) => k.name(),
            KernelKind::Conv(cfg) => cfg.entry_point(),
        }
    }

    pub fn signature(&self) -> &'static [ArgKind] {
        use ArgKind::*;
        match self {
            KernelKind::Math(k) => k.signature(),
            // input, weight, output, bias
            KernelKind::Conv(_) => &[Buffer, Buffer, Buffer, Buffer],
        }
    }
}

/// A fully specified, signature-checked kernel launch.
#[derive(Debug, Clone)]
pub struct KernelLaunch {
    kind: KernelKind,
    args: Vec<KernelArg>,
    cfg: LaunchConfig,
}

impl KernelLaunch {
    pub fn new(kind: KernelKind, args: Vec<KernelArg>, cfg: LaunchConfig) -> Result<Self> {
        let sig = kind.signature();
        if sig.len() != args.len() {
            return Err(Error::msg(format!(
                "kernel {} takes {} arguments, got {}",
                kind.name(),
                sig.len(),
                args.len()
            )));
        }
        for (i, (want, got)) in sig.iter().zip(&args).enumerate() {
            if *want != got.kind() {
                return Err(Error::msg(format!(
                    "kernel {} argument {i}: expected {want:?}, got {:?}",
                    kind.name(),
                    got.kind()
                )));
            }
        }
        Ok(KernelLaunch { kind, args, cfg })
    }

    /// A math kernel over `n` independent work items.
    pub fn math(kernel: MathKernel, n: usize, args: Vec<KernelArg>) -> Result<Self> {
        Self::new(KernelKind::Math(kernel), args, launch_cfg(n))
    }

    pub fn kind(&self) -> &KernelKind {
        &self.kind
    }

    pub fn args(&self) -> &[KernelArg] {
        &self.args
    }

    pub fn config(&self) -> LaunchConfig {
        self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_checked() {
        let ok = KernelLaunch::math(
            MathKernel::Fill,
            4,
            vec![KernelArg::Buffer(0), KernelArg::F32(1.0), KernelArg::U32(4)],
        );
        assert!(ok.is_ok());

        let short = KernelLaunch::math(MathKernel::Fill, 4, vec![KernelArg::Buffer(0)]);
        assert!(short.is_err());

        let mistyped = KernelLaunch::math(
            MathKernel::Fill,
            4,
            vec![KernelArg::Buffer(0), KernelArg::U32(1), KernelArg::U32(4)],
        );
        assert!(mistyped.is_err());
    }

    #[test]
    fn names_are_unique() {
        let mut names = MathKernel::names();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), MathKernel::ALL.len());
    }

    #[test]
    fn every_math_kernel_is_in_the_source() {
        for k in MathKernel::ALL {
            let needle = format!("void {}(", k.name());
            assert!(
                crate::kernels::MATH_SOURCE.contains(&needle),
                "{} missing from MATH_SOURCE",
                k.name()
            );
        }
    }

    #[test]
    fn launch_cfg_rounds_up() {
        assert_eq!(launch_cfg(1).grid_dim, (1, 1, 1));
        assert_eq!(launch_cfg(256).grid_dim, (1, 1, 1));
        assert_eq!(launch_cfg(257).grid_dim, (2, 1, 1));
        assert_eq!(launch_cfg(0).grid_dim, (1, 1, 1));
    }
}
