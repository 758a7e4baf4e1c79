//! Fully resolved instance: the unit the render thread operates on.

use std::sync::{Mutex, MutexGuard, TryLockError};

use wasmtime::Store;

use super::compiler::{CompiledArtifact, ModuleCompiler};
use super::environment::{Environment, EnvironmentBinder, HostState};
use super::exports::{self, ResolvedExports, SampleBufferView};
use crate::config::HostConfig;
use crate::error::{HostError, Result};

/// An instantiated module with its environment bound and exports resolved.
///
/// There is no partially built `ActiveInstance`: construction either returns
/// one with every export resolved or fails. The store sits behind a mutex
/// that only the render thread takes, and only with `try_lock`.
pub struct ActiveInstance {
    name: String,
    generation: u64,
    environment: Environment,
    view: SampleBufferView,
    fuel_per_block: Option<u64>,
    core: Mutex<InstanceCore>,
}

struct InstanceCore {
    store: Store<HostState>,
    exports: ResolvedExports,
}

impl std::fmt::Debug for ActiveInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveInstance")
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("environment", &self.environment)
            .field("view", &self.view)
            .finish_non_exhaustive()
    }
}

impl ActiveInstance {
    /// Instantiate `artifact` with `environment` bound, then resolve its exports.
    pub(crate) fn build(
        compiler: &ModuleCompiler,
        artifact: &CompiledArtifact,
        environment: Environment,
        config: &HostConfig,
        generation: u64,
    ) -> Result<Self> {
        let engine = compiler.engine();
        let binder = EnvironmentBinder::new(config);

        let mut store = binder.new_store(engine)?;
        let linker = binder.bind(engine, &mut store, artifact.module(), environment)?;

        let instance = linker
            .instantiate(&mut store, artifact.module())
            .map_err(|e| HostError::Instantiation(format!("{}: {:#}", artifact.name(), e)))?;

        let exports = exports::resolve(&mut store, &instance, config)
            .map_err(|e| match e {
                HostError::Resolution(msg) => {
                    HostError::Resolution(format!("{}: {}", artifact.name(), msg))
                }
                other => other,
            })?;

        tracing::info!(
            module = %artifact.name(),
            generation,
            sample_rate = environment.sample_rate(),
            buffer_offset = exports.view.offset(),
            "instance ready"
        );

        Ok(Self {
            name: artifact.name().to_string(),
            generation,
            environment,
            view: exports.view,
            fuel_per_block: config.fuel_per_block,
            core: Mutex::new(InstanceCore { store, exports }),
        })
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Monotonic id assigned by the lifecycle manager.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Environment bound at instantiation.
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Resolved sample buffer location.
    pub fn buffer_view(&self) -> SampleBufferView {
        self.view
    }

    /// Non-blocking access for the render thread.
    ///
    /// Returns `None` if the store is busy or a previous call panicked.
    pub(crate) fn try_enter(&self) -> Option<InstanceGuard<'_>> {
        match self.core.try_lock() {
            Ok(core) => Some(InstanceGuard {
                core,
                view: self.view,
                fuel: self.fuel_per_block,
            }),
            Err(TryLockError::WouldBlock) | Err(TryLockError::Poisoned(_)) => None,
        }
    }
}

/// Exclusive access to an instance's store for one render cycle.
pub(crate) struct InstanceGuard<'a> {
    core: MutexGuard<'a, InstanceCore>,
    view: SampleBufferView,
    fuel: Option<u64>,
}

impl InstanceGuard<'_> {
    /// Forward one channel-voice message to the event entry point.
    pub(crate) fn send_event(&mut self, status: u8, data1: u8, data2: u8) -> wasmtime::Result<()> {
        self.refuel()?;
        let InstanceCore { store, exports } = &mut *self.core;
        exports
            .event
            .call(&mut *store, (status as i32, data1 as i32, data2 as i32))
    }

    /// Ask the module to fill `frames` frames of its sample buffer.
    pub(crate) fn render(&mut self, frames: usize) -> wasmtime::Result<()> {
        self.refuel()?;
        let InstanceCore { store, exports } = &mut *self.core;
        exports.render.call(&mut *store, frames as i32)
    }

    /// Raw little-endian bytes of the first `frames` samples of a channel block.
    pub(crate) fn channel_bytes(&self, channel: usize, frames: usize) -> Option<&[u8]> {
        let core = &*self.core;
        core.exports
            .memory
            .data(&core.store)
            .get(self.view.channel_range(channel, frames))
    }

    fn refuel(&mut self) -> wasmtime::Result<()> {
        match self.fuel {
            Some(fuel) => self.core.store.set_fuel(fuel),
            None => Ok(()),
        }
    }
}
