//! Shared helpers for the host integration tests.

#![allow(dead_code)]

use wasmsynth_host::{HostConfig, HostController, RenderHandle, OUTPUT_ATTENUATION};

pub const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Sentinel the tests pre-fill output buffers with.
pub const UNTOUCHED: f32 = 12.5;

pub fn fixture(name: &str) -> String {
    format!("{}/{}", FIXTURES, name)
}

pub fn host() -> (HostController, RenderHandle) {
    HostController::new(HostConfig::default()).expect("failed to create host")
}

pub fn host_with(config: HostConfig) -> (HostController, RenderHandle) {
    HostController::new(config).expect("failed to create host")
}

/// `value` as it comes out of the render engine.
pub fn attenuated(value: f32) -> f32 {
    value * OUTPUT_ATTENUATION
}

pub fn buffers(frames: usize) -> (Vec<f32>, Vec<f32>) {
    (vec![UNTOUCHED; frames], vec![UNTOUCHED; frames])
}

/// A synth rendering `value` on the left and `-value` on the right, for a given block size.
pub fn constant_synth(value: f32, block_frames: usize) -> String {
    format!(
        r#"(module
  (import "environment" "SAMPLERATE" (global $samplerate f32))
  (memory (export "memory") 1)
  (global (export "samplebuffer") i32 (i32.const 1024))
  (func (export "fillSampleBufferWithNumSamples") (param $frames i32)
    (local $i i32)
    (block $done
      (loop $next
        (br_if $done (i32.ge_u (local.get $i) (local.get $frames)))
        (f32.store (i32.add (i32.const 1024) (i32.shl (local.get $i) (i32.const 2))) (f32.const {value}))
        (f32.store (i32.add (i32.const {right}) (i32.shl (local.get $i) (i32.const 2))) (f32.const {negated}))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $next))))
  (func (export "shortmessage") (param i32 i32 i32)))"#,
        value = value,
        negated = -value,
        right = 1024 + block_frames * 4,
    )
}
