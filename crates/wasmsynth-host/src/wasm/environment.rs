//! Environment binder: host-provided values published into a new instance.
//!
//! The module sees exactly one environment value, the sample rate, as an
//! immutable `f32` global imported from the environment module:
//!
//! ```wat
//! (import "environment" "SAMPLERATE" (global $samplerate f32))
//! ```
//!
//! Imports are resolved at instantiation, so the environment has to be
//! registered in the linker before the module is instantiated. Changing the
//! sample rate therefore means a fresh instance.
//!
//! Modules compiled from AssemblyScript additionally import `env.abort`;
//! it is provided as a trapping host function when the module asks for it.

use wasmtime::{
    Caller, Engine, Global, GlobalType, Linker, Memory, Module, Mutability, Store, StoreLimits,
    StoreLimitsBuilder, Val, ValType,
};

use crate::config::HostConfig;
use crate::error::{HostError, Result};

/// Import module for the AssemblyScript runtime hooks.
const ASSEMBLYSCRIPT_ENV: &str = "env";

/// Fuel multiplier for the module's start sequence relative to one block.
const INIT_FUEL_BLOCKS: u64 = 64;

/// Store data for a hosted instance.
pub struct HostState {
    limits: StoreLimits,
    #[cfg(feature = "wasi")]
    wasi: wasmtime_wasi::preview1::WasiP1Ctx,
}

/// Values bound into an instance at instantiation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Environment {
    sample_rate: f32,
}

impl Environment {
    /// Environment for the given host sample rate.
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate: sample_rate as f32,
        }
    }

    /// The sample rate as the module observes it.
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }
}

/// Builds stores and linkers carrying the environment for one instantiation.
pub(crate) struct EnvironmentBinder<'a> {
    config: &'a HostConfig,
}

impl<'a> EnvironmentBinder<'a> {
    pub(crate) fn new(config: &'a HostConfig) -> Self {
        Self { config }
    }

    /// Create a store with memory limits and the start-sequence fuel budget.
    pub(crate) fn new_store(&self, engine: &Engine) -> Result<Store<HostState>> {
        let state = HostState {
            limits: StoreLimitsBuilder::new()
                .memory_size(self.config.max_memory)
                .build(),
            #[cfg(feature = "wasi")]
            wasi: self.build_wasi(),
        };

        let mut store = Store::new(engine, state);
        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = self.config.fuel_per_block {
            store
                .set_fuel(fuel.saturating_mul(INIT_FUEL_BLOCKS))
                .map_err(|e| HostError::Instantiation(format!("fuel setup failed: {}", e)))?;
        }

        Ok(store)
    }

    /// Register the environment module (and optional runtime imports) in a fresh linker.
    pub(crate) fn bind(
        &self,
        engine: &Engine,
        store: &mut Store<HostState>,
        module: &Module,
        env: Environment,
    ) -> Result<Linker<HostState>> {
        let names = &self.config.export_names;
        let mut linker: Linker<HostState> = Linker::new(engine);

        let sample_rate = Global::new(
            &mut *store,
            GlobalType::new(ValType::F32, Mutability::Const),
            Val::F32(env.sample_rate.to_bits()),
        )
        .map_err(|e| HostError::Instantiation(format!("sample rate global: {}", e)))?;

        linker
            .define(
                &*store,
                &names.environment_module,
                &names.sample_rate_global,
                sample_rate,
            )
            .map_err(|e| HostError::Instantiation(format!("environment link failed: {}", e)))?;

        if imports(module, ASSEMBLYSCRIPT_ENV, "abort") {
            register_abort(&mut linker)?;
        }

        #[cfg(feature = "wasi")]
        if self.config.wasi.enabled {
            wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| {
                &mut state.wasi
            })
            .map_err(|e| HostError::Instantiation(format!("WASI link failed: {}", e)))?;
        }

        tracing::debug!(
            sample_rate = env.sample_rate,
            module = %names.environment_module,
            "environment bound"
        );

        Ok(linker)
    }

    #[cfg(feature = "wasi")]
    fn build_wasi(&self) -> wasmtime_wasi::preview1::WasiP1Ctx {
        let caps = &self.config.wasi;
        let mut builder = wasmtime_wasi::WasiCtxBuilder::new();

        if caps.stdout {
            builder.inherit_stdout();
        }
        if caps.stderr {
            builder.inherit_stderr();
        }
        for (key, value) in &caps.env_vars {
            builder.env(key, value);
        }
        builder.args(&caps.args);

        builder.build_p1()
    }
}

fn imports(module: &Module, import_module: &str, name: &str) -> bool {
    module
        .imports()
        .any(|i| i.module() == import_module && i.name() == name)
}

/// `env.abort(message, file, line, column)` traps with the decoded message.
fn register_abort(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            ASSEMBLYSCRIPT_ENV,
            "abort",
            |mut caller: Caller<'_, HostState>,
             message: i32,
             file: i32,
             line: i32,
             column: i32|
             -> wasmtime::Result<()> {
                let memory = caller.get_export("memory").and_then(|e| e.into_memory());
                let (message, file) = match memory {
                    Some(memory) => (
                        read_utf16_string(&memory, &caller, message),
                        read_utf16_string(&memory, &caller, file),
                    ),
                    None => (None, None),
                };
                Err(wasmtime::Error::msg(format!(
                    "module aborted: {} ({}:{}:{})",
                    message.as_deref().unwrap_or("<no message>"),
                    file.as_deref().unwrap_or("<unknown>"),
                    line,
                    column
                )))
            },
        )
        .map_err(|e| HostError::Instantiation(format!("failed to register abort: {}", e)))?;
    Ok(())
}

/// Read a length-prefixed UTF-16 string (byte length stored just before `ptr`).
fn read_utf16_string(memory: &Memory, caller: &Caller<'_, HostState>, ptr: i32) -> Option<String> {
    let data = memory.data(caller);
    let ptr = usize::try_from(ptr).ok()?;
    let len_bytes = data.get(ptr.checked_sub(4)?..ptr)?;
    let byte_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    let bytes = data.get(ptr..ptr.checked_add(byte_len)?)?;

    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Some(String::from_utf16_lossy(&units))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_rate_is_f32() {
        assert_eq!(Environment::new(44_100.0).sample_rate(), 44_100.0f32);
        assert_eq!(Environment::new(96_000.0).sample_rate(), 96_000.0f32);
    }

    #[test]
    fn test_bound_global_is_readable() {
        let config = HostConfig::default();
        let engine = Engine::default();
        let module = Module::new(
            &engine,
            r#"(module
                (import "environment" "SAMPLERATE" (global $sr f32))
                (func (export "rate") (result f32) global.get $sr))"#,
        )
        .expect("module");

        let binder = EnvironmentBinder::new(&config);
        let mut store = binder.new_store(&engine).expect("store");
        let linker = binder
            .bind(&engine, &mut store, &module, Environment::new(22_050.0))
            .expect("bind");
        let instance = linker.instantiate(&mut store, &module).expect("instantiate");
        let rate = instance
            .get_typed_func::<(), f32>(&mut store, "rate")
            .expect("rate export")
            .call(&mut store, ())
            .expect("call");
        assert_eq!(rate, 22_050.0);
    }

    #[test]
    fn test_abort_traps_with_message() {
        let config = HostConfig::default();
        let engine = Engine::default();
        // "hi" as UTF-16 with its byte length (4) stored at offset 16
        let module = Module::new(
            &engine,
            r#"(module
                (import "env" "abort" (func $abort (param i32 i32 i32 i32)))
                (memory (export "memory") 1)
                (data (i32.const 16) "\04\00\00\00h\00i\00")
                (func (export "boom") (call $abort (i32.const 20) (i32.const 0) (i32.const 7) (i32.const 3))))"#,
        )
        .expect("module");

        let binder = EnvironmentBinder::new(&config);
        let mut store = binder.new_store(&engine).expect("store");
        let linker = binder
            .bind(&engine, &mut store, &module, Environment::new(48_000.0))
            .expect("bind");
        let instance = linker.instantiate(&mut store, &module).expect("instantiate");
        let err = instance
            .get_typed_func::<(), ()>(&mut store, "boom")
            .expect("boom export")
            .call(&mut store, ())
            .expect_err("abort must trap");
        let text = format!("{:#}", err);
        assert!(text.contains("module aborted: hi"), "{}", text);
        assert!(text.contains(":7:3"), "{}", text);
    }
}
