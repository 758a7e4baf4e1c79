//! Configuration for the synth host.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HostError, Result};

/// Frames rendered per call into the module unless configured otherwise.
pub const DEFAULT_BLOCK_FRAMES: usize = 128;

/// WASI capability grants for hosted modules.
///
/// Following the deny-by-default security model, WASI is not linked at all
/// unless `enabled` is set, and even then only stdio and explicitly listed
/// env vars/args are exposed. There are no filesystem or network grants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasiCapabilities {
    /// Link WASI preview1 imports
    pub enabled: bool,

    /// Allow access to stdout
    pub stdout: bool,

    /// Allow access to stderr
    pub stderr: bool,

    /// Environment variables to expose
    pub env_vars: Vec<(String, String)>,

    /// Command-line arguments to pass
    pub args: Vec<String>,
}

impl WasiCapabilities {
    /// WASI not linked (maximum isolation)
    pub fn none() -> Self {
        Self::default()
    }

    /// WASI linked with stdout/stderr, useful for modules that print diagnostics
    pub fn with_stdio() -> Self {
        Self {
            enabled: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }

    /// Builder: add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.enabled = true;
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Builder: add command-line argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.enabled = true;
        self.args.push(arg.into());
        self
    }
}

/// Names of the exports the host resolves and the environment it publishes.
///
/// The defaults match the convention synth modules are written against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportNames {
    /// Global holding the byte offset of the sample buffer
    pub sample_buffer: String,
    /// Exported linear memory
    pub memory: String,
    /// `fn(frames: i32)`
    pub render: String,
    /// `fn(status: i32, data1: i32, data2: i32)`
    pub event: String,
    /// Import module the environment globals are registered under
    pub environment_module: String,
    /// Name of the sample rate global inside the environment module
    pub sample_rate_global: String,
}

impl Default for ExportNames {
    fn default() -> Self {
        Self {
            sample_buffer: "samplebuffer".to_string(),
            memory: "memory".to_string(),
            render: "fillSampleBufferWithNumSamples".to_string(),
            event: "shortmessage".to_string(),
            environment_module: "environment".to_string(),
            sample_rate_global: "SAMPLERATE".to_string(),
        }
    }
}

/// Configuration for the synth host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Frames per render call; both host and module must agree on it
    pub block_frames: usize,

    /// Sample rate bound when a module is loaded before the first `prepare`
    pub default_sample_rate: f64,

    /// Maximum linear memory per instance in bytes
    pub max_memory: usize,

    /// Cranelift optimization level (0-3)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,

    /// Fuel granted to every call made on the render thread
    pub fuel_per_block: Option<u64>,

    /// Directory compiled artifacts are written to
    pub scratch_dir: Option<PathBuf>,

    /// How long teardown waits for the render thread to let go of an instance
    pub retire_timeout_ms: u64,

    /// Export/import naming convention
    pub export_names: ExportNames,

    /// WASI capability configuration
    pub wasi: WasiCapabilities,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            block_frames: DEFAULT_BLOCK_FRAMES,
            default_sample_rate: 48_000.0,
            max_memory: 64 * 1024 * 1024, // 64 MB
            optimization_level: 2,
            enable_simd: true,
            fuel_per_block: None,
            scratch_dir: None,
            retire_timeout_ms: 500,
            export_names: ExportNames::default(),
            wasi: WasiCapabilities::none(),
        }
    }
}

impl HostConfig {
    /// Config for live use: metered calls so a runaway module cannot stall audio
    pub fn realtime() -> Self {
        Self {
            optimization_level: 3,
            fuel_per_block: Some(50_000_000),
            ..Default::default()
        }
    }

    /// Create config for development/debugging
    pub fn development() -> Self {
        Self {
            optimization_level: 0, // Faster compilation
            wasi: WasiCapabilities::with_stdio(),
            ..Default::default()
        }
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| HostError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the rest of the host relies on.
    pub fn validate(&self) -> Result<()> {
        if self.block_frames == 0 {
            return Err(HostError::Config("block_frames must be > 0".to_string()));
        }
        validate_sample_rate(self.default_sample_rate)?;
        if self.optimization_level > 3 {
            return Err(HostError::Config(format!(
                "optimization_level must be 0-3, got {}",
                self.optimization_level
            )));
        }
        Ok(())
    }

    /// Bytes the sample buffer occupies in module memory (two f32 channel blocks).
    pub fn sample_buffer_bytes(&self) -> usize {
        2 * self.block_frames * std::mem::size_of::<f32>()
    }

    /// Teardown wait bound.
    pub fn retire_timeout(&self) -> Duration {
        Duration::from_millis(self.retire_timeout_ms)
    }

    /// Builder: set block size
    pub fn block_frames(mut self, frames: usize) -> Self {
        self.block_frames = frames;
        self
    }

    /// Builder: set the sample rate used before `prepare`
    pub fn default_sample_rate(mut self, rate: f64) -> Self {
        self.default_sample_rate = rate;
        self
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set per-call fuel budget
    pub fn fuel_per_block(mut self, fuel: u64) -> Self {
        self.fuel_per_block = Some(fuel);
        self
    }

    /// Builder: enable SIMD
    pub fn simd(mut self, enable: bool) -> Self {
        self.enable_simd = enable;
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(3);
        self
    }

    /// Builder: set scratch directory for compiled artifacts
    pub fn scratch_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(path.into());
        self
    }

    /// Builder: set WASI capabilities
    pub fn wasi(mut self, caps: WasiCapabilities) -> Self {
        self.wasi = caps;
        self
    }
}

pub(crate) fn validate_sample_rate(rate: f64) -> Result<()> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(HostError::Config(format!(
            "sample rate must be positive and finite, got {}",
            rate
        )));
    }
    Ok(())
}
