// RuntimeConfig — where a network runs and where its weights come from
//
// Built with chained setters, or read from the environment:
//
//   KETTLE_BACKEND   `host` (default) or `cuda:<ordinal>` (`cuda` alone is 0)
//   KETTLE_WEIGHTS   path to the weight blob
//
// Shapes and hyperparameters are not configured here; they are fixed when
// the operators are built.

use std::path::{Path, PathBuf};

use kettle_core::{Error, Result, WeightBlob};

pub const BACKEND_VAR: &str = "KETTLE_BACKEND";
pub const WEIGHTS_VAR: &str = "KETTLE_WEIGHTS";

/// Execution backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Host,
    Device {
        ordinal: usize,
    },
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("host") || s.eq_ignore_ascii_case("cpu") {
            return Ok(BackendKind::Host);
        }
        let rest = s
            .strip_prefix("cuda")
            .ok_or_else(|| Error::msg(format!("unknown backend '{s}', expected host or cuda:N")))?;
        let ordinal = match rest.strip_prefix(':') {
            Some(n) => n
                .parse()
                .map_err(|e| Error::msg(format!("bad device ordinal '{n}': {e}")))?,
            None if rest.is_empty() => 0,
            None => return Err(Error::msg(format!("unknown backend '{s}', expected host or cuda:N"))),
        };
        Ok(BackendKind::Device { ordinal })
    }
}

/// Runtime settings for one network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeConfig {
    pub backend: BackendKind,
    pub weights_path: Option<PathBuf>,
    /// Byte length the weight file must have.
    pub expected_weight_bytes: Option<usize>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_weights(mut self, path: impl Into<PathBuf>) -> Self {
        self.weights_path = Some(path.into());
        self
    }

    pub fn with_expected_weight_bytes(mut self, bytes: usize) -> Self {
        self.expected_weight_bytes = Some(bytes);
        self
    }

    /// Read `KETTLE_BACKEND` and `KETTLE_WEIGHTS`; unset or empty variables
    /// keep the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = RuntimeConfig::default();
        if let Some(b) = lookup(BACKEND_VAR).filter(|b| !b.is_empty()) {
            cfg.backend = b.parse()?;
        }
        if let Some(p) = lookup(WEIGHTS_VAR).filter(|p| !p.is_empty()) {
            cfg.weights_path = Some(PathBuf::from(p));
        }
        Ok(cfg)
    }

    pub fn weights_path(&self) -> Option<&Path> {
        self.weights_path.as_deref()
    }

    /// Load the configured weight blob, checking its size when an expected
    /// size is set.
    pub fn load_weights(&self) -> Result<WeightBlob> {
        let path = self
            .weights_path()
            .ok_or_else(|| Error::msg(format!("no weight file configured (set {WEIGHTS_VAR})")))?;
        WeightBlob::load(path, self.expected_weight_bytes)
    }
}
