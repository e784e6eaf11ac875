// DeviceContext — one GPU, its in-order queue and its compiled programs
//
// A context is created explicitly and passed to whatever needs the device;
// there is no process-wide singleton. Creating it selects the device,
// compiles the math program for the device's architecture and loads it.
// Convolution programs are generated per configuration and compiled the
// first time a launch needs them; identical configurations reuse the same
// module.
//
// All launches go to the device's default stream, so work executes in
// submission order. Reading results back (`download`) synchronizes.
//
// The context is `!Sync` (the launch counter is a `Cell`); one thread drives
// one queue.

use std::cell::Cell;
use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::{CudaFunction, CudaSlice, LaunchAsync};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};

use kettle_core::{Error, Result};

use crate::kernels::{ConvKernelConfig, MATH_MODULE, MATH_SOURCE};
use crate::launch::{KernelArg, KernelKind, KernelLaunch, MathKernel};

/// Handle to one CUDA device plus its loaded kernel programs.
pub struct DeviceContext {
    dev: Arc<cudarc::driver::CudaDevice>,
    ordinal: usize,
    arch: &'static str,
    launches: Cell<u64>,
}

impl DeviceContext {
    /// Open GPU `ordinal` and build the math program for it.
    pub fn new(ordinal: usize) -> Result<Self> {
        let dev = cudarc::driver::CudaDevice::new(ordinal)
            .map_err(|e| Error::Device(format!("device {ordinal} creation failed: {e}")))?;

        // Target the device's own architecture (sm_XX) so the driver never
        // has to JIT a PTX version it does not understand.
        let major = dev
            .attribute(cudarc::driver::sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .unwrap_or(7);
        let minor = dev
            .attribute(cudarc::driver::sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .unwrap_or(0);
        let arch: &'static str = Box::leak(format!("sm_{major}{minor}").into_boxed_str());

        let ctx = DeviceContext {
            dev,
            ordinal,
            arch,
            launches: Cell::new(0),
        };
        let names = MathKernel::names();
        ctx.compile(MATH_SOURCE, MATH_MODULE, &names)?;
        tracing::info!(ordinal, arch, "device context ready");
        Ok(ctx)
    }

    /// The underlying cudarc device handle.
    pub fn device(&self) -> &Arc<cudarc::driver::CudaDevice> {
        &self.dev
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Number of kernels submitted through this context so far.
    pub fn launch_count(&self) -> u64 {
        self.launches.get()
    }

    fn compile(&self, source: &str, module: &str, names: &[&'static str]) -> Result<()> {
        let opts = CompileOptions {
            arch: Some(self.arch),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(source, opts)
            .map_err(|e| Error::Device(format!("NVRTC compilation of {module} failed: {e}")))?;
        self.dev
            .load_ptx(ptx, module, names)
            .map_err(|e| Error::Device(format!("PTX load of {module} failed: {e}")))?;
        tracing::debug!(module, "compiled device program");
        Ok(())
    }

    /// Compile the program for a convolution configuration unless an
    /// identical one is already loaded.
    pub fn ensure_conv_program(&self, cfg: &ConvKernelConfig) -> Result<()> {
        let module = cfg.module_name();
        if self.dev.has_func(&module, cfg.entry_point()) {
            return Ok(());
        }
        self.compile(&cfg.source(), &module, &[cfg.entry_point()])
    }

    fn function(&self, kind: &KernelKind) -> Result<CudaFunction> {
        let (module, name) = match kind {
            KernelKind::Math(k) => (MATH_MODULE.to_string(), k.name()),
            KernelKind::Conv(cfg) => {
                self.ensure_conv_program(cfg)?;
                (cfg.module_name(), cfg.entry_point())
            }
        };
        self.dev
            .get_func(&module, name)
            .ok_or_else(|| Error::Device(format!("kernel '{name}' not found in {module}")))
    }

    /// Submit a launch to the in-order queue.
    pub fn enqueue(&self, launch: &KernelLaunch) -> Result<()> {
        let func = self.function(launch.kind())?;
        let mut values = launch.args().to_vec();
        let mut params: Vec<*mut c_void> = values
            .iter_mut()
            .map(|arg| match arg {
                KernelArg::Buffer(p) => p as *mut u64 as *mut c_void,
                KernelArg::U32(v) => v as *mut u32 as *mut c_void,
                KernelArg::I32(v) => v as *mut i32 as *mut c_void,
                KernelArg::F32(v) => v as *mut f32 as *mut c_void,
            })
            .collect();
        tracing::trace!(kernel = launch.kind().name(), "launch");
        // SAFETY: the argument list was checked against the kernel signature
        // when the launch was built, and `values` outlives the call.
        unsafe { func.launch(launch.config(), &mut params[..]) }
            .map_err(|e| Error::Device(format!("launch {}: {e}", launch.kind().name())))?;
        self.launches.set(self.launches.get() + 1);
        Ok(())
    }

    /// Block until every submitted launch has finished.
    pub fn synchronize(&self) -> Result<()> {
        self.dev
            .synchronize()
            .map_err(|e| Error::Device(format!("synchronize: {e}")))
    }

    // Memory

    /// Allocate `n` zeroed floats. Zero-length requests get one element so
    /// every buffer has a valid address.
    pub fn alloc_zeros(&self, n: usize) -> Result<CudaSlice<f32>> {
        self.dev
            .alloc_zeros::<f32>(n.max(1))
            .map_err(|e| Error::Device(format!("alloc {n} floats: {e}")))
    }

    pub fn upload(&self, data: &[f32]) -> Result<CudaSlice<f32>> {
        if data.is_empty() {
            return self.alloc_zeros(0);
        }
        self.dev
            .htod_sync_copy(data)
            .map_err(|e| Error::Device(format!("upload {} floats: {e}", data.len())))
    }

    /// Copy the first `len` floats of `slice` back to the host.
    pub fn download(&self, slice: &CudaSlice<f32>, len: usize) -> Result<Vec<f32>> {
        let mut v = self
            .dev
            .dtoh_sync_copy(slice)
            .map_err(|e| Error::Device(format!("download: {e}")))?;
        v.truncate(len);
        Ok(v)
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceContext(cuda:{}, {})", self.ordinal, self.arch)
    }
}
