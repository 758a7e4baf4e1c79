//! # WasmSynth Host
//!
//! Real-time host for sandboxed WebAssembly synthesizer modules.
//!
//! A module is compiled ahead of time, instantiated with the host sample
//! rate bound as an import, and then driven from the audio callback: note
//! events go in through one export, rendered stereo blocks come back through
//! a buffer in the module's own linear memory.
//!
//! | Component | Where | Context |
//! |-----------|-------|---------|
//! | Module compiler | [`wasm::ModuleCompiler`] | control |
//! | Environment binder | `wasm::environment` | control |
//! | Export resolver | `wasm::exports` | control |
//! | Lifecycle manager | [`HostController`] | control |
//! | Event dispatcher | [`events`] | render |
//! | Render engine | [`RenderHandle`] | render |
//!
//! ## Module Contract
//!
//! ```wat
//! (import "environment" "SAMPLERATE" (global f32))
//! (export "memory" (memory ...))
//! (export "samplebuffer" (global i32))           ;; byte offset, 2 x 128 f32
//! (export "fillSampleBufferWithNumSamples" (func (param i32)))
//! (export "shortmessage" (func (param i32 i32 i32)))
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wasmsynth_host::{HostConfig, HostController, NoteEvent};
//!
//! let (mut controller, mut render) = HostController::new(HostConfig::default())?;
//! controller.prepare(48_000.0)?;
//! controller.load_file("synth.wasm")?;
//! controller.select_channel(1)?;
//!
//! // In the audio callback:
//! render.process(&mut left, &mut right, &[NoteEvent::note_on(1, 60, 100)]);
//! ```
//!
//! ## Features
//!
//! - `wasi` (default) - allow linking WASI preview1 for modules that need it;
//!   still off unless [`WasiCapabilities::enabled`] is set

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod render;
pub mod wasm;

// Re-export main types
pub use config::{ExportNames, HostConfig, WasiCapabilities, DEFAULT_BLOCK_FRAMES};
pub use error::{HostError, Result};
pub use events::{remap_status, ChannelSelector, NoteEvent, CHANNEL_COUNT};
pub use lifecycle::{HostController, HostStatus, SlotState};
pub use render::{RenderHandle, RenderStats, RenderStatsSnapshot, OUTPUT_ATTENUATION};
pub use wasm::{
    ActiveInstance, CompiledArtifact, Environment, ModuleCompiler, ModuleImage, SampleBufferView,
};
