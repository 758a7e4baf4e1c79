//! Event dispatcher: device note/control messages into the module.
//!
//! Every message is re-addressed to the user-selected channel before it is
//! forwarded, whatever channel it arrived on. Only the low nibble of the
//! status byte changes; the message type is kept:
//!
//! ```text
//! status 0x93 (note on, ch 4), selected channel 1  ->  0x90
//! status 0xB0 (CC, ch 1),      selected channel 16 ->  0xBF
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{HostError, Result};
use crate::render::RenderStats;
use crate::wasm::InstanceGuard;

/// Number of logical channels a module can be addressed on.
pub const CHANNEL_COUNT: u8 = 16;

/// A 3-byte channel-voice message delivered in one processing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoteEvent {
    /// Status byte (message type in the high nibble, channel in the low)
    pub status: u8,
    /// First data byte
    pub data1: u8,
    /// Second data byte
    pub data2: u8,
    /// Frame offset of the event within the cycle
    pub frame: u32,
}

impl NoteEvent {
    /// Raw message at frame 0.
    pub fn new(status: u8, data1: u8, data2: u8) -> Self {
        Self {
            status,
            data1,
            data2,
            frame: 0,
        }
    }

    /// Build from raw message bytes; missing data bytes are zero.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (&status, rest) = bytes.split_first()?;
        Some(Self::new(
            status,
            rest.first().copied().unwrap_or(0),
            rest.get(1).copied().unwrap_or(0),
        ))
    }

    /// Note on. `channel` is 1-based.
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(0x90 | channel_nibble(channel), note, velocity)
    }

    /// Note off. `channel` is 1-based.
    pub fn note_off(channel: u8, note: u8) -> Self {
        Self::new(0x80 | channel_nibble(channel), note, 0)
    }

    /// Control change. `channel` is 1-based.
    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self::new(0xB0 | channel_nibble(channel), controller, value)
    }

    /// Builder: set the frame offset
    pub fn at(mut self, frame: u32) -> Self {
        self.frame = frame;
        self
    }

    /// Message type nibble.
    pub fn kind(&self) -> u8 {
        self.status & 0xF0
    }
}

fn channel_nibble(channel: u8) -> u8 {
    channel.wrapping_sub(1) & 0x0F
}

/// Rewrite the channel nibble of `status` to the 1-based `channel`.
pub fn remap_status(status: u8, channel: u8) -> u8 {
    (status & 0xF0) | channel_nibble(channel)
}

/// Selected target channel, written by the control thread and read while rendering.
#[derive(Debug)]
pub struct ChannelSelector(AtomicU8);

impl Default for ChannelSelector {
    fn default() -> Self {
        Self(AtomicU8::new(1))
    }
}

impl ChannelSelector {
    /// Select channel 1-16.
    pub fn select(&self, channel: u8) -> Result<()> {
        if !(1..=CHANNEL_COUNT).contains(&channel) {
            return Err(HostError::Config(format!(
                "channel must be 1-{}, got {}",
                CHANNEL_COUNT, channel
            )));
        }
        self.0.store(channel, Ordering::Relaxed);
        Ok(())
    }

    /// Currently selected channel.
    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Forward `events` in arrival order. Returns the first fault, if any;
/// a faulting event does not stop the ones after it.
pub(crate) fn dispatch(
    guard: &mut InstanceGuard<'_>,
    events: &[NoteEvent],
    channel: u8,
    stats: &RenderStats,
) -> Option<wasmtime::Error> {
    let mut first_fault = None;
    for event in events {
        let status = remap_status(event.status, channel);
        match guard.send_event(status, event.data1, event.data2) {
            Ok(()) => stats.record_event(),
            Err(e) => {
                stats.record_fault();
                first_fault.get_or_insert(e);
            }
        }
    }
    first_fault
}
