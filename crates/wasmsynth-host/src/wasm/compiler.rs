//! Module compiler: portable module image to compiled artifact.
//!
//! Compilation runs on the control thread only. It never touches the
//! currently active instance, so a failed compile leaves rendering as it was.

use std::path::{Path, PathBuf};
use std::time::Instant;

use wasmtime::{Config, Engine, ExternType, Module, OptLevel};

use crate::config::HostConfig;
use crate::error::{HostError, Result};

/// A portable module image as supplied by the caller.
#[derive(Debug, Clone)]
pub struct ModuleImage {
    name: String,
    bytes: Vec<u8>,
}

impl ModuleImage {
    /// Wrap raw bytes (binary or text format).
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// Read an image from disk, named after the file stem.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        let bytes = std::fs::read(path)?;
        Ok(Self { name, bytes })
    }

    /// Image name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw image bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A compiled, validated module ready to be instantiated.
///
/// Cloning is cheap; the compiled code is shared.
#[derive(Clone)]
pub struct CompiledArtifact {
    module: Module,
    name: String,
    artifact_path: Option<PathBuf>,
}

impl std::fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("name", &self.name)
            .field("artifact_path", &self.artifact_path)
            .finish_non_exhaustive()
    }
}

impl CompiledArtifact {
    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the serialized artifact was written, if a scratch dir is configured.
    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact_path.as_deref()
    }

    /// Get exported function names.
    pub fn exported_functions(&self) -> impl Iterator<Item = &str> {
        self.module.exports().filter_map(|e| {
            if matches!(e.ty(), ExternType::Func(_)) {
                Some(e.name())
            } else {
                None
            }
        })
    }

    /// All exports as `(name, kind)`.
    pub fn exports(&self) -> Vec<(String, &'static str)> {
        self.module
            .exports()
            .map(|e| (e.name().to_string(), extern_kind(&e.ty())))
            .collect()
    }

    /// All imports as `(module, name, kind)`.
    pub fn imports(&self) -> Vec<(String, String, &'static str)> {
        self.module
            .imports()
            .map(|i| (i.module().to_string(), i.name().to_string(), extern_kind(&i.ty())))
            .collect()
    }

    pub(crate) fn module(&self) -> &Module {
        &self.module
    }
}

fn extern_kind(ty: &ExternType) -> &'static str {
    match ty {
        ExternType::Func(_) => "func",
        ExternType::Global(_) => "global",
        ExternType::Memory(_) => "memory",
        ExternType::Table(_) => "table",
    }
}

/// Ahead-of-time compiler wrapping the wasmtime engine.
///
/// Instances created from its artifacts must share its engine, so the
/// compiler is also what the rest of the host instantiates against.
pub struct ModuleCompiler {
    engine: Engine,
    scratch_dir: Option<PathBuf>,
}

impl ModuleCompiler {
    /// Create the engine from host configuration.
    pub fn new(config: &HostConfig) -> Result<Self> {
        let mut engine_config = Config::new();

        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            _ => OptLevel::Speed,
        });

        engine_config.wasm_simd(config.enable_simd);

        // Fuel is how render calls are bounded
        if config.fuel_per_block.is_some() {
            engine_config.consume_fuel(true);
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| HostError::Config(format!("engine creation failed: {}", e)))?;

        Ok(Self {
            engine,
            scratch_dir: config.scratch_dir.clone(),
        })
    }

    /// Compile and validate an image. The image is consumed.
    pub fn compile(&self, image: ModuleImage) -> Result<CompiledArtifact> {
        let ModuleImage { name, bytes } = image;
        let start = Instant::now();
        tracing::info!(module = %name, bytes = bytes.len(), "compiling module");

        let module = Module::new(&self.engine, &bytes)
            .map_err(|e| HostError::Compile(format!("{}: {:#}", name, e)))?;

        let artifact_path = match &self.scratch_dir {
            Some(dir) => Some(self.write_artifact(dir, &name, &module)?),
            None => None,
        };

        tracing::info!(
            module = %name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "module compiled"
        );

        Ok(CompiledArtifact {
            module,
            name,
            artifact_path,
        })
    }

    /// Read and compile a file.
    pub fn compile_file(&self, path: impl AsRef<Path>) -> Result<CompiledArtifact> {
        self.compile(ModuleImage::from_file(path)?)
    }

    fn write_artifact(&self, dir: &Path, name: &str, module: &Module) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let serialized = module
            .serialize()
            .map_err(|e| HostError::Compile(format!("{}: serialization failed: {}", name, e)))?;

        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{}.cwasm", file_name));
        std::fs::write(&path, serialized)?;
        tracing::debug!(path = %path.display(), "compiled artifact written");
        Ok(path)
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"(module (func (export "noop")))"#;

    #[test]
    fn test_compile_text_module() {
        let compiler = ModuleCompiler::new(&HostConfig::default()).expect("engine");
        let artifact = compiler
            .compile(ModuleImage::from_bytes("minimal", MINIMAL))
            .expect("compile");
        assert_eq!(artifact.name(), "minimal");
        assert_eq!(artifact.exported_functions().collect::<Vec<_>>(), vec!["noop"]);
        assert!(artifact.artifact_path().is_none());
    }

    #[test]
    fn test_compile_rejects_garbage() {
        let compiler = ModuleCompiler::new(&HostConfig::default()).expect("engine");
        let err = compiler
            .compile(ModuleImage::from_bytes("garbage", vec![0x00, 0x61, 0x73, 0x6d, 0x01]))
            .expect_err("truncated header must not compile");
        assert!(matches!(err, HostError::Compile(_)));
        assert!(err.is_load_error());
    }

    #[test]
    fn test_compile_writes_scratch_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = HostConfig::default().scratch_dir(dir.path());
        let compiler = ModuleCompiler::new(&config).expect("engine");
        let artifact = compiler
            .compile(ModuleImage::from_bytes("my synth.v2", MINIMAL))
            .expect("compile");

        let path = artifact.artifact_path().expect("artifact path");
        assert_eq!(path, dir.path().join("my_synth_v2.cwasm"));
        assert!(path.metadata().expect("artifact exists").len() > 0);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let compiler = ModuleCompiler::new(&HostConfig::default()).expect("engine");
        let err = compiler
            .compile_file("/nonexistent/synth.wasm")
            .expect_err("missing file");
        assert!(matches!(err, HostError::Io(_)));
    }
}
