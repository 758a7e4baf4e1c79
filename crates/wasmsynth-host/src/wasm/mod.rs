//! WebAssembly side of the host: compile, bind, instantiate, resolve.
//!
//! Uses wasmtime as the sandbox runtime. Everything in here runs on the
//! control thread except the `InstanceGuard` calls made while rendering.
//!
//! ## Security Model
//!
//! - **Memory isolation**: each module runs in its own linear memory, capped by `max_memory`
//! - **Deny-by-default**: the only import offered is the environment module
//!   (plus `env.abort`, and WASI stdio when explicitly enabled)
//! - **Bounded calls**: with `fuel_per_block` set, every render/event call is metered

mod compiler;
mod environment;
mod exports;
mod instance;

pub use compiler::{CompiledArtifact, ModuleCompiler, ModuleImage};
pub use environment::Environment;
pub use exports::SampleBufferView;
pub use instance::ActiveInstance;

pub(crate) use instance::InstanceGuard;
