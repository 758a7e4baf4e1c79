//! Lifecycle manager: the single active-module slot.
//!
//! The controller owns every load path step (compile, bind, instantiate,
//! resolve) and publishes the finished instance with one atomic swap. The
//! render thread only ever sees "no instance" or a fully resolved one.
//!
//! ## Retirement
//!
//! A superseded instance may still be in use by a render cycle that loaded
//! it just before the swap. The render thread bumps an epoch counter on
//! entry and exit of every cycle (odd = cycle in flight). At swap time the
//! controller records the epoch; the old instance is destroyed, on the
//! control thread, only once the epoch shows that cycle has finished.
//!
//! ```text
//! state:   Empty --load--> Loading --ok--> Active --load--> Loading --ok--> Active
//!                             \--err--> Empty          \--err--> Active (unchanged)
//! ```

use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use serde::Serialize;
use wasmtime::Engine;

use crate::config::{validate_sample_rate, HostConfig};
use crate::error::{HostError, Result};
use crate::events::ChannelSelector;
use crate::render::{RenderHandle, RenderStats, RenderStatsSnapshot};
use crate::wasm::{ActiveInstance, CompiledArtifact, Environment, ModuleCompiler, ModuleImage};

/// Observable state of the module slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum SlotState {
    /// No instance; render is a no-op and events are discarded
    Empty = 0,
    /// A load is in progress; the previous instance (if any) keeps rendering
    Loading = 1,
    /// A fully resolved instance is current
    Active = 2,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SlotState::Loading,
            2 => SlotState::Active,
            _ => SlotState::Empty,
        }
    }
}

/// Cycle counter written by the render thread; odd while a cycle runs.
#[derive(Debug, Default)]
pub(crate) struct RenderEpoch(AtomicU64);

impl RenderEpoch {
    pub(crate) fn enter(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
        // Order the increment before the slot load that follows
        fence(Ordering::SeqCst);
    }

    pub(crate) fn exit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// No cycle that was running at `mark` is still running.
    fn passed(&self, mark: u64) -> bool {
        mark % 2 == 0 || self.current() > mark
    }
}

/// State shared between the controller and the render handle.
#[derive(Default)]
pub(crate) struct Shared {
    pub(crate) slot: ArcSwapOption<ActiveInstance>,
    pub(crate) epoch: RenderEpoch,
    pub(crate) channel: ChannelSelector,
    pub(crate) stats: RenderStats,
    state: AtomicU8,
}

impl Shared {
    fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Snapshot returned by [`HostController::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostStatus {
    /// Slot state
    pub state: SlotState,
    /// Name of the current module
    pub module: Option<String>,
    /// Generation of the current instance
    pub generation: Option<u64>,
    /// Sample rate bound into the current instance
    pub sample_rate: Option<f32>,
    /// Sample buffer length (both channels) of the current instance
    pub buffer_samples: Option<usize>,
    /// Selected target channel (1-16)
    pub channel: u8,
    /// Superseded instances not yet reclaimed
    pub retiring: usize,
    /// Render thread counters
    pub render: RenderStatsSnapshot,
}

struct Retired {
    // Held only to defer the drop until `reclaim`
    #[allow(dead_code)]
    instance: Arc<ActiveInstance>,
    mark: u64,
}

/// Control end of the host: loads modules, applies sample rate and channel changes.
///
/// Every method may block, allocate and take arbitrary time; none of it
/// runs on the render thread.
pub struct HostController {
    config: HostConfig,
    compiler: ModuleCompiler,
    shared: Arc<Shared>,
    artifact: Option<CompiledArtifact>,
    sample_rate: Option<f64>,
    retired: Vec<Retired>,
    next_generation: u64,
}

impl HostController {
    /// Create a host with an empty slot and its render handle.
    pub fn new(config: HostConfig) -> Result<(Self, RenderHandle)> {
        config.validate()?;
        let compiler = ModuleCompiler::new(&config)?;
        let shared = Arc::new(Shared::default());
        let render = RenderHandle::new(Arc::clone(&shared), config.block_frames);

        let controller = Self {
            config,
            compiler,
            shared,
            artifact: None,
            sample_rate: None,
            retired: Vec::new(),
            next_generation: 1,
        };
        Ok((controller, render))
    }

    /// Host configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Compile an image without touching the slot.
    pub fn compile(&self, image: ModuleImage) -> Result<CompiledArtifact> {
        self.compiler.compile(image)
    }

    /// Compile, instantiate and publish a module from disk.
    pub fn load_file(&mut self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let image = ModuleImage::from_file(path)?;
        self.load(image)
    }

    /// Compile, instantiate and publish a module from bytes.
    pub fn load_bytes(&mut self, name: &str, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.load(ModuleImage::from_bytes(name, bytes))
    }

    /// Compile, instantiate and publish `image`.
    ///
    /// On failure the previously active instance stays current.
    pub fn load(&mut self, image: ModuleImage) -> Result<()> {
        self.loading(|this| {
            let artifact = this.compiler.compile(image)?;
            this.activate(artifact)
        })
    }

    /// Instantiate and publish an already compiled artifact.
    ///
    /// The artifact must come from this controller's [`compile`](Self::compile).
    pub fn install(&mut self, artifact: CompiledArtifact) -> Result<()> {
        self.loading(|this| {
            if !Engine::same(this.compiler.engine(), artifact.module().engine()) {
                return Err(HostError::Instantiation(format!(
                    "{}: artifact was compiled by a different compiler; use HostController::compile",
                    artifact.name()
                )));
            }
            this.activate(artifact)
        })
    }

    /// Set the host sample rate.
    ///
    /// If it differs from the one bound into the active instance, the same
    /// artifact is instantiated again with the new rate (no recompile).
    pub fn prepare(&mut self, sample_rate: f64) -> Result<()> {
        validate_sample_rate(sample_rate)?;
        let changed = self.sample_rate != Some(sample_rate);
        self.sample_rate = Some(sample_rate);
        tracing::info!(sample_rate, changed, "prepare");

        let wanted = Environment::new(sample_rate);
        let rebind = self
            .current()
            .is_some_and(|instance| instance.environment() != wanted);
        match self.artifact.clone() {
            Some(artifact) if rebind => self.install(artifact),
            _ => Ok(()),
        }
    }

    /// Select the target channel (1-16) events are re-addressed to.
    pub fn select_channel(&self, channel: u8) -> Result<()> {
        self.shared.channel.select(channel)?;
        tracing::debug!(channel, "channel selected");
        Ok(())
    }

    /// Selected target channel.
    pub fn channel(&self) -> u8 {
        self.shared.channel.get()
    }

    /// Unpublish the active instance. Rendering goes silent-by-omission.
    pub fn unload(&mut self) {
        self.artifact = None;
        self.publish(None);
        self.shared.set_state(SlotState::Empty);
        tracing::info!("module unloaded");
    }

    /// The instance the render thread currently sees.
    pub fn current(&self) -> Option<Arc<ActiveInstance>> {
        self.shared.slot.load_full()
    }

    /// Whether a fully resolved instance is published.
    pub fn is_ready(&self) -> bool {
        self.shared.slot.load().is_some()
    }

    /// Snapshot for diagnostics.
    pub fn status(&self) -> HostStatus {
        let current = self.current();
        HostStatus {
            state: self.shared.state(),
            module: current.as_ref().map(|i| i.name().to_string()),
            generation: current.as_ref().map(|i| i.generation()),
            sample_rate: current.as_ref().map(|i| i.environment().sample_rate()),
            buffer_samples: current.as_ref().map(|i| i.buffer_view().len_samples()),
            channel: self.shared.channel.get(),
            retiring: self.retired.len(),
            render: self.shared.stats.snapshot(),
        }
    }

    /// Destroy retired instances no render cycle can still be using.
    ///
    /// Returns how many were destroyed. Runs after every swap; call it from
    /// a periodic control-thread tick to finish retirements promptly.
    pub fn reclaim(&mut self) -> usize {
        let before = self.retired.len();
        let epoch = &self.shared.epoch;
        self.retired.retain(|r| !epoch.passed(r.mark));
        let reclaimed = before - self.retired.len();
        if reclaimed > 0 {
            tracing::debug!(reclaimed, pending = self.retired.len(), "retired instances reclaimed");
        }
        reclaimed
    }

    /// Reclaim until nothing is pending or `timeout` elapses. Returns true when drained.
    pub fn wait_for_retirement(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.reclaim();
            if self.retired.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn loading<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let previous = self.shared.state();
        self.shared.set_state(SlotState::Loading);

        match f(self) {
            Ok(()) => {
                self.shared.set_state(SlotState::Active);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(previous);
                tracing::warn!(error = %e, "load failed; keeping previous instance");
                Err(e)
            }
        }
    }

    fn activate(&mut self, artifact: CompiledArtifact) -> Result<()> {
        let rate = self.sample_rate.unwrap_or(self.config.default_sample_rate);
        let generation = self.next_generation;

        let instance = ActiveInstance::build(
            &self.compiler,
            &artifact,
            Environment::new(rate),
            &self.config,
            generation,
        )?;

        self.next_generation += 1;
        self.artifact = Some(artifact);
        self.publish(Some(Arc::new(instance)));
        Ok(())
    }

    fn publish(&mut self, next: Option<Arc<ActiveInstance>>) {
        let generation = next.as_ref().map(|i| i.generation());
        let previous = self.shared.slot.swap(next);
        // Order the swap before reading the epoch
        fence(Ordering::SeqCst);

        if let Some(instance) = previous {
            let mark = self.shared.epoch.current();
            tracing::debug!(
                retired = instance.generation(),
                published = ?generation,
                mark,
                "instance retired"
            );
            self.retired.push(Retired { instance, mark });
        } else {
            tracing::debug!(published = ?generation, "instance published");
        }

        self.reclaim();
    }
}

impl Drop for HostController {
    fn drop(&mut self) {
        self.publish(None);
        let timeout = self.config.retire_timeout();
        if !self.wait_for_retirement(timeout) {
            tracing::warn!(
                pending = self.retired.len(),
                "render thread still busy at teardown; releasing instances anyway"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYNTH: &str = r#"(module
        (import "environment" "SAMPLERATE" (global $sr f32))
        (memory (export "memory") 1)
        (global (export "samplebuffer") i32 (i32.const 1024))
        (func (export "fillSampleBufferWithNumSamples") (param i32))
        (func (export "shortmessage") (param i32 i32 i32)))"#;

    fn controller() -> HostController {
        let (controller, _render) = HostController::new(HostConfig::default()).expect("host");
        controller
    }

    #[test]
    fn test_initial_state_is_empty() {
        let controller = controller();
        let status = controller.status();
        assert_eq!(status.state, SlotState::Empty);
        assert!(status.module.is_none());
        assert_eq!(status.channel, 1);
        assert!(!controller.is_ready());
    }

    #[test]
    fn test_load_publishes_generations() {
        let mut controller = controller();
        controller.load_bytes("a", SYNTH).expect("load a");
        assert_eq!(controller.status().generation, Some(1));
        controller.load_bytes("b", SYNTH).expect("load b");

        let status = controller.status();
        assert_eq!(status.state, SlotState::Active);
        assert_eq!(status.module.as_deref(), Some("b"));
        assert_eq!(status.generation, Some(2));
        // No render cycle was in flight, so the first instance is already gone
        assert_eq!(status.retiring, 0);
    }

    #[test]
    fn test_retirement_waits_for_in_flight_cycle() {
        let mut controller = controller();
        controller.load_bytes("a", SYNTH).expect("load a");

        // Pretend the render thread is mid-cycle while the swap happens
        controller.shared.epoch.enter();
        controller.load_bytes("b", SYNTH).expect("load b");
        assert_eq!(controller.status().retiring, 1);
        assert_eq!(controller.reclaim(), 0);

        controller.shared.epoch.exit();
        assert_eq!(controller.reclaim(), 1);
        assert_eq!(controller.status().retiring, 0);
    }

    #[test]
    fn test_failed_load_restores_state() {
        let mut controller = controller();
        assert!(controller.load_bytes("bad", "(module").is_err());
        assert_eq!(controller.status().state, SlotState::Empty);

        controller.load_bytes("good", SYNTH).expect("load");
        assert!(controller.load_bytes("bad", vec![0u8, 1, 2]).is_err());
        let status = controller.status();
        assert_eq!(status.state, SlotState::Active);
        assert_eq!(status.module.as_deref(), Some("good"));
    }

    #[test]
    fn test_prepare_rebinds_without_recompile() {
        let mut controller = controller();
        controller.load_bytes("synth", SYNTH).expect("load");
        assert_eq!(controller.status().sample_rate, Some(48_000.0));

        controller.prepare(44_100.0).expect("prepare");
        let status = controller.status();
        assert_eq!(status.sample_rate, Some(44_100.0));
        assert_eq!(status.generation, Some(2));

        // Same rate again: nothing to rebind
        controller.prepare(44_100.0).expect("prepare");
        assert_eq!(controller.status().generation, Some(2));
    }

    #[test]
    fn test_prepare_rejects_bad_rates() {
        let mut controller = controller();
        assert!(controller.prepare(0.0).is_err());
        assert!(controller.prepare(-44_100.0).is_err());
        assert!(controller.prepare(f64::INFINITY).is_err());
    }

    #[test]
    fn test_unload_empties_slot() {
        let mut controller = controller();
        controller.load_bytes("synth", SYNTH).expect("load");
        controller.unload();
        let status = controller.status();
        assert_eq!(status.state, SlotState::Empty);
        assert!(status.module.is_none());
        assert!(!controller.is_ready());
    }

    #[test]
    fn test_install_rejects_foreign_artifact() {
        let mut controller = controller();
        let foreign = ModuleCompiler::new(&HostConfig::default())
            .expect("engine")
            .compile(ModuleImage::from_bytes("foreign", SYNTH))
            .expect("compile");

        let err = controller.install(foreign).expect_err("other engine");
        assert!(matches!(err, HostError::Instantiation(_)), "{}", err);
        assert!(err.to_string().contains("different compiler"), "{}", err);
        assert_eq!(controller.status().state, SlotState::Empty);

        let own = controller
            .compile(ModuleImage::from_bytes("own", SYNTH))
            .expect("compile");
        controller.install(own).expect("same engine");
        assert_eq!(controller.status().module.as_deref(), Some("own"));
    }

    #[test]
    fn test_epoch_parity() {
        let epoch = RenderEpoch::default();
        assert!(epoch.passed(epoch.current()));
        epoch.enter();
        let mark = epoch.current();
        assert!(!epoch.passed(mark));
        epoch.exit();
        assert!(epoch.passed(mark));
    }
}
