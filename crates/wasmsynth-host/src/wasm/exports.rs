//! Export resolver: locate the render contract inside a fresh instance.
//!
//! ## Memory Convention
//!
//! The module exports an `i32` global holding the byte offset of its sample
//! buffer. The buffer is two consecutive channel blocks of `block_frames`
//! little-endian f32 samples each:
//!
//! ```text
//! offset                      offset + 4*block_frames
//! [L0, L1, ..., L(block-1)]   [R0, R1, ..., R(block-1)]
//! ```

use std::ops::Range;

use wasmtime::{Func, Instance, Memory, Store, TypedFunc, Val, WasmParams, WasmResults};

use super::environment::HostState;
use crate::config::HostConfig;
use crate::error::{HostError, Result};

const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// Location of the shared sample buffer inside module memory.
///
/// Stored as an offset/length pair and only ever dereferenced through the
/// owning instance's memory, so it cannot outlive that instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleBufferView {
    offset: usize,
    frames: usize,
}

impl SampleBufferView {
    /// Byte offset of the left block in linear memory.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Frames per channel block.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Total samples across both blocks.
    pub fn len_samples(&self) -> usize {
        2 * self.frames
    }

    /// Total bytes across both blocks.
    pub fn byte_len(&self) -> usize {
        self.len_samples() * SAMPLE_BYTES
    }

    /// Byte range of the first `frames` samples of `channel` (0 = left, 1 = right).
    pub(crate) fn channel_range(&self, channel: usize, frames: usize) -> Range<usize> {
        let start = self.offset + channel * self.frames * SAMPLE_BYTES;
        start..start + frames.min(self.frames) * SAMPLE_BYTES
    }
}

/// Everything the render and event paths need from an instance.
pub(crate) struct ResolvedExports {
    pub(crate) memory: Memory,
    pub(crate) render: TypedFunc<i32, ()>,
    pub(crate) event: TypedFunc<(i32, i32, i32), ()>,
    pub(crate) view: SampleBufferView,
}

/// Resolve all required exports or fail describing the first one missing.
pub(crate) fn resolve(
    store: &mut Store<HostState>,
    instance: &Instance,
    config: &HostConfig,
) -> Result<ResolvedExports> {
    let names = &config.export_names;
    if config.block_frames == 0 {
        return Err(HostError::Resolution("block_frames must be > 0".to_string()));
    }

    let memory = instance
        .get_memory(&mut *store, &names.memory)
        .ok_or_else(|| {
            HostError::Resolution(format!("no memory export named '{}'", names.memory))
        })?;

    let offset = buffer_offset(store, instance, &names.sample_buffer)?;

    let view = SampleBufferView {
        offset,
        frames: config.block_frames,
    };
    let memory_len = memory.data_size(&*store);
    let end = offset
        .checked_add(view.byte_len())
        .ok_or_else(|| HostError::Resolution("sample buffer offset overflows".to_string()))?;
    if end > memory_len {
        return Err(HostError::Resolution(format!(
            "sample buffer [{}, {}) exceeds memory size {}",
            offset, end, memory_len
        )));
    }

    let render = typed_func::<i32, ()>(store, instance, &names.render, "(i32) -> ()")?;
    let event =
        typed_func::<(i32, i32, i32), ()>(store, instance, &names.event, "(i32, i32, i32) -> ()")?;

    tracing::debug!(
        offset,
        frames = view.frames,
        memory_len,
        "exports resolved"
    );

    Ok(ResolvedExports {
        memory,
        render,
        event,
        view,
    })
}

fn buffer_offset(store: &mut Store<HostState>, instance: &Instance, name: &str) -> Result<usize> {
    let global = instance
        .get_global(&mut *store, name)
        .ok_or_else(|| HostError::Resolution(format!("no global export named '{}'", name)))?;

    let ty = global.ty(&*store);
    match global.get(&mut *store) {
        Val::I32(offset) => usize::try_from(offset).map_err(|_| {
            HostError::Resolution(format!("global '{}' holds negative offset {}", name, offset))
        }),
        _ => Err(HostError::Resolution(format!(
            "global '{}' must be i32, found {}",
            name,
            ty.content()
        ))),
    }
}

fn typed_func<P, R>(
    store: &mut Store<HostState>,
    instance: &Instance,
    name: &str,
    signature: &str,
) -> Result<TypedFunc<P, R>>
where
    P: WasmParams,
    R: WasmResults,
{
    let func: Func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| HostError::Resolution(format!("no function export named '{}'", name)))?;

    func.typed::<P, R>(&*store).map_err(|e| {
        HostError::Resolution(format!("function '{}' must be {}: {}", name, signature, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ranges() {
        let view = SampleBufferView {
            offset: 1024,
            frames: 128,
        };
        assert_eq!(view.len_samples(), 256);
        assert_eq!(view.byte_len(), 1024);
        assert_eq!(view.channel_range(0, 128), 1024..1536);
        assert_eq!(view.channel_range(1, 44), 1536..1536 + 44 * 4);
        // Never reads past a block
        assert_eq!(view.channel_range(0, 500), 1024..1536);
    }
}
