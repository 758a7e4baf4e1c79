//! Render engine: the real-time side of the host.
//!
//! `RenderHandle::process` is called once per audio cycle. It never blocks,
//! never takes a lock the control thread can hold, and never logs. It loads
//! the published instance once per cycle, so a whole cycle renders from a
//! single instance even if a swap lands mid-cycle.
//!
//! Per cycle:
//! 1. all events for the cycle are forwarded (see [`crate::events`]),
//! 2. the output is rendered in chunks of at most `block_frames` frames;
//!    each chunk is one call into the module followed by a copy of both
//!    channel blocks into the output, scaled by [`OUTPUT_ATTENUATION`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{HostError, Result};
use crate::events::{self, NoteEvent};
use crate::lifecycle::Shared;
use crate::wasm::InstanceGuard;

/// Fixed output scale applied to every rendered sample.
pub const OUTPUT_ATTENUATION: f32 = 0.3;

/// Lock-free counters updated by the render thread.
#[derive(Debug, Default)]
pub struct RenderStats {
    cycles: AtomicU64,
    idle_cycles: AtomicU64,
    chunks: AtomicU64,
    events: AtomicU64,
    dropped_events: AtomicU64,
    faults: AtomicU64,
}

/// Point-in-time copy of [`RenderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenderStatsSnapshot {
    /// Cycles processed, including idle ones
    pub cycles: u64,
    /// Cycles with no instance to render from
    pub idle_cycles: u64,
    /// Render calls that completed and were copied out
    pub chunks: u64,
    /// Events forwarded to the module
    pub events: u64,
    /// Events discarded because no instance was active
    pub dropped_events: u64,
    /// Render or event calls that trapped
    pub faults: u64,
}

impl RenderStats {
    fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    fn record_idle(&self, dropped_events: usize) {
        self.idle_cycles.fetch_add(1, Ordering::Relaxed);
        self.dropped_events
            .fetch_add(dropped_events as u64, Ordering::Relaxed);
    }

    fn record_chunk(&self) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> RenderStatsSnapshot {
        RenderStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            idle_cycles: self.idle_cycles.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// What a single cycle did.
enum Cycle {
    /// No instance: output untouched, events discarded
    Idle,
    Rendered,
    Faulted(wasmtime::Error),
}

/// Real-time end of the host. Move it into the audio callback.
///
/// There is exactly one per host; it is deliberately not `Clone`.
pub struct RenderHandle {
    shared: Arc<Shared>,
    block_frames: usize,
}

impl RenderHandle {
    pub(crate) fn new(shared: Arc<Shared>, block_frames: usize) -> Self {
        Self {
            shared,
            block_frames,
        }
    }

    /// Process one cycle: forward `events`, then render `min(left.len(), right.len())` frames.
    ///
    /// With no active instance the buffers are left exactly as given. A
    /// trapping call silences the rest of the cycle and is counted in
    /// [`RenderStats`]; the next cycle starts normally.
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32], events: &[NoteEvent]) {
        // The outcome (and any trap it carries) is dropped here; faults are counted.
        let _ = self.cycle(left, right, events);
    }

    /// Like [`process`](Self::process) but reports a trap as [`HostError::RenderFault`].
    ///
    /// Formatting the error allocates, so this is for offline rendering and tests.
    pub fn process_checked(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        events: &[NoteEvent],
    ) -> Result<bool> {
        match self.cycle(left, right, events) {
            Cycle::Idle => Ok(false),
            Cycle::Rendered => Ok(true),
            Cycle::Faulted(e) => Err(HostError::RenderFault(format!("{:#}", e))),
        }
    }

    /// Block size this handle renders in.
    pub fn block_frames(&self) -> usize {
        self.block_frames
    }

    /// Counters shared with the controller.
    pub fn stats(&self) -> RenderStatsSnapshot {
        self.shared.stats.snapshot()
    }

    fn cycle(&mut self, left: &mut [f32], right: &mut [f32], events: &[NoteEvent]) -> Cycle {
        let shared = &*self.shared;
        shared.epoch.enter();
        shared.stats.record_cycle();

        let outcome = {
            let slot = shared.slot.load();
            let entered = slot.as_deref().and_then(|instance| instance.try_enter());
            let outcome = match entered {
                None => {
                    shared.stats.record_idle(events.len());
                    Cycle::Idle
                }
                Some(mut guard) => {
                    let channel = shared.channel.get();
                    let event_fault = events::dispatch(&mut guard, events, channel, &shared.stats);
                    let render_fault =
                        render_chunks(&mut guard, self.block_frames, left, right, &shared.stats);
                    match event_fault.or(render_fault) {
                        Some(e) => Cycle::Faulted(e),
                        None => Cycle::Rendered,
                    }
                }
            };
            outcome
        };

        // Everything borrowed from the instance is released before the epoch moves on.
        shared.epoch.exit();
        outcome
    }
}

/// Render `min(left.len(), right.len())` frames in chunks of at most `block_frames`.
fn render_chunks(
    guard: &mut InstanceGuard<'_>,
    block_frames: usize,
    left: &mut [f32],
    right: &mut [f32],
    stats: &RenderStats,
) -> Option<wasmtime::Error> {
    let frames = left.len().min(right.len());
    let mut offset = 0;

    while offset < frames {
        let chunk = (frames - offset).min(block_frames);

        if let Err(e) = guard.render(chunk) {
            stats.record_fault();
            left[offset..frames].fill(0.0);
            right[offset..frames].fill(0.0);
            return Some(e);
        }

        let end = offset + chunk;
        match (guard.channel_bytes(0, chunk), guard.channel_bytes(1, chunk)) {
            (Some(l), Some(r)) => {
                copy_scaled(l, &mut left[offset..end]);
                copy_scaled(r, &mut right[offset..end]);
            }
            // Linear memory never shrinks, so a view valid at resolution stays valid.
            _ => {
                stats.record_fault();
                left[offset..frames].fill(0.0);
                right[offset..frames].fill(0.0);
                return Some(wasmtime::Error::msg("sample buffer outside linear memory"));
            }
        }

        stats.record_chunk();
        offset = end;
    }

    None
}

/// Decode little-endian f32 samples from module memory into `dst`, attenuated.
fn copy_scaled(src: &[u8], dst: &mut [f32]) {
    for (out, bytes) in dst.iter_mut().zip(src.chunks_exact(4)) {
        *out = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) * OUTPUT_ATTENUATION;
    }
}
