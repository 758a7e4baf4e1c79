//! WasmSynth Command-Line Interface
//!
//! This CLI provides tools for:
//! - Inspecting a synth module against the host contract
//! - Rendering a module offline to a WAV file through the real-time path

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use wasmsynth_host::{
    HostConfig, HostController, ModuleImage, NoteEvent, RenderHandle,
};

#[derive(Parser)]
#[command(name = "wasmsynth")]
#[command(author, version, about = "Sandboxed WebAssembly synth host", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a module and report what it exports and imports
    Inspect {
        /// Module file (.wasm or .wat)
        module: PathBuf,

        /// Host configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print host status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Render a module offline to a stereo WAV file
    Render {
        /// Module file (.wasm or .wat)
        module: PathBuf,

        /// Output WAV file
        #[arg(short, long)]
        out: PathBuf,

        /// Sample rate in Hz
        #[arg(long, default_value = "48000")]
        sample_rate: u32,

        /// Target channel (1-16)
        #[arg(long, default_value = "1")]
        channel: u8,

        /// Duration in seconds
        #[arg(long, default_value = "2.0")]
        seconds: f64,

        /// Note numbers to play (repeatable)
        #[arg(long = "note", default_values_t = vec![60u8])]
        notes: Vec<u8>,

        /// Note-on velocity (1-127)
        #[arg(long, default_value = "100")]
        velocity: u8,

        /// Host configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Frames per processing cycle (defaults to the host block size)
        #[arg(long)]
        block: Option<usize>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<HostConfig> {
    match path {
        Some(path) => HostConfig::from_file(path)
            .with_context(|| format!("Failed to read host config {:?}", path)),
        None => Ok(HostConfig::default()),
    }
}

fn cmd_inspect(module: PathBuf, config: Option<PathBuf>, json: bool) -> Result<()> {
    let config = load_config(config.as_ref())?;
    let (mut controller, _render) = HostController::new(config)?;

    // Artifacts must come from the controller's own engine
    let image = ModuleImage::from_file(&module)
        .with_context(|| format!("Failed to read {:?}", module))?;
    let artifact = controller
        .compile(image)
        .with_context(|| format!("Failed to compile {:?}", module))?;
    controller
        .install(artifact.clone())
        .with_context(|| format!("Failed to load {:?}", module))?;
    let status = controller.status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("=== Module: {} ===", artifact.name());
    println!();
    println!("Exports:");
    for (name, kind) in artifact.exports() {
        println!("  {:<32} {}", name, kind);
    }
    println!();
    println!("Imports:");
    for (namespace, name, kind) in artifact.imports() {
        println!("  {:<32} {}", format!("{}.{}", namespace, name), kind);
    }
    println!();

    if let Some(instance) = controller.current() {
        let view = instance.buffer_view();
        println!("Sample Buffer:");
        println!("  Offset:            {} bytes", view.offset());
        println!("  Frames per block:  {}", view.frames());
        println!("  Length:            {} samples ({} bytes)", view.len_samples(), view.byte_len());
        println!(
            "  Sample rate:       {} Hz",
            instance.environment().sample_rate()
        );
    }
    if let Some(path) = artifact.artifact_path() {
        println!("  Artifact:          {:?}", path);
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_render(
    module: PathBuf,
    out: PathBuf,
    sample_rate: u32,
    channel: u8,
    seconds: f64,
    notes: Vec<u8>,
    velocity: u8,
    config: Option<PathBuf>,
    block: Option<usize>,
) -> Result<()> {
    if seconds.is_nan() || seconds <= 0.0 {
        bail!("Duration must be positive, got {}", seconds);
    }
    if let Some(note) = notes.iter().find(|&&n| n > 127) {
        bail!("Note must be 0-127, got {}", note);
    }
    if !(1..=127).contains(&velocity) {
        bail!("Velocity must be 1-127, got {}", velocity);
    }

    let config = load_config(config.as_ref())?;
    let (mut controller, mut render) = HostController::new(config)?;
    controller.prepare(sample_rate as f64)?;
    controller.select_channel(channel)?;
    controller
        .load_file(&module)
        .with_context(|| format!("Failed to load {:?}", module))?;

    let cycle_frames = block.unwrap_or_else(|| render.block_frames());
    if cycle_frames == 0 {
        bail!("Block size must be non-zero");
    }

    let total_frames = (seconds * sample_rate as f64).round() as usize;
    let release_at = total_frames * 3 / 4;

    info!(
        "Rendering {:?}: {} frames at {} Hz, channel {}, notes {:?}",
        module, total_frames, sample_rate, channel, notes
    );

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&out, spec)
        .with_context(|| format!("Failed to create {:?}", out))?;

    let start = Instant::now();
    let faults = render_frames(
        &mut render,
        &mut writer,
        total_frames,
        cycle_frames,
        release_at,
        &notes,
        velocity,
    )?;
    writer.finalize().context("Failed to finalize WAV file")?;

    let elapsed = start.elapsed().as_secs_f64();
    let stats = controller.status().render;
    info!(
        "Rendered {:.2}s of audio in {:.3}s ({:.1}x real time)",
        seconds,
        elapsed,
        seconds / elapsed.max(f64::EPSILON)
    );
    info!(
        "Cycles: {}, render calls: {}, events: {}",
        stats.cycles, stats.chunks, stats.events
    );
    if faults > 0 {
        warn!("{} cycles faulted and were silenced", faults);
    }
    info!("Wrote {:?}", out);

    Ok(())
}

/// Drive the render handle cycle by cycle and interleave the output into `writer`.
/// Returns the number of faulted cycles.
#[allow(clippy::too_many_arguments)]
fn render_frames<W: std::io::Write + std::io::Seek>(
    render: &mut RenderHandle,
    writer: &mut hound::WavWriter<W>,
    total_frames: usize,
    cycle_frames: usize,
    release_at: usize,
    notes: &[u8],
    velocity: u8,
) -> Result<usize> {
    let mut left = vec![0.0f32; cycle_frames];
    let mut right = vec![0.0f32; cycle_frames];
    let mut events = Vec::with_capacity(notes.len());
    let mut faults = 0;
    let mut position = 0;

    while position < total_frames {
        let frames = cycle_frames.min(total_frames - position);
        let end = position + frames;

        events.clear();
        if position == 0 {
            events.extend(notes.iter().map(|&n| NoteEvent::note_on(1, n, velocity)));
        }
        if (position..end).contains(&release_at) {
            let offset = (release_at - position) as u32;
            events.extend(notes.iter().map(|&n| NoteEvent::note_off(1, n).at(offset)));
        }

        left[..frames].fill(0.0);
        right[..frames].fill(0.0);
        if let Err(e) = render.process_checked(&mut left[..frames], &mut right[..frames], &events) {
            warn!("Cycle at frame {} faulted: {}", position, e);
            faults += 1;
        }

        for (&l, &r) in left[..frames].iter().zip(&right[..frames]) {
            writer.write_sample(l)?;
            writer.write_sample(r)?;
        }
        position = end;
    }

    Ok(faults)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Inspect {
            module,
            config,
            json,
        } => cmd_inspect(module, config, json),

        Commands::Render {
            module,
            out,
            sample_rate,
            channel,
            seconds,
            notes,
            velocity,
            config,
            block,
        } => cmd_render(
            module,
            out,
            sample_rate,
            channel,
            seconds,
            notes,
            velocity,
            config,
            block,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYNTH: &str = r#"(module
  (import "environment" "SAMPLERATE" (global f32))
  (memory (export "memory") 1)
  (global (export "samplebuffer") i32 (i32.const 0))
  (global $on (mut f32) (f32.const 0))
  (func (export "fillSampleBufferWithNumSamples") (param $n i32)
    (local $i i32)
    (block $done
      (loop $next
        (br_if $done (i32.ge_u (local.get $i) (local.get $n)))
        (f32.store (i32.shl (local.get $i) (i32.const 2)) (global.get $on))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $next))))
  (func (export "shortmessage") (param $s i32) (param i32) (param i32)
    (if (i32.eq (i32.and (local.get $s) (i32.const 0xF0)) (i32.const 0x90))
      (then (global.set $on (f32.const 1)))
      (else (global.set $on (f32.const 0))))))"#;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../wasmsynth-host/tests/fixtures")
            .join(name)
    }

    #[test]
    fn test_inspect_loads_fixture() {
        cmd_inspect(fixture("triangle.wat"), None, false).expect("inspect text report");
        cmd_inspect(fixture("triangle.wat"), None, true).expect("inspect json report");
    }

    #[test]
    fn test_inspect_reports_missing_module() {
        assert!(cmd_inspect(fixture("missing.wat"), None, false).is_err());
    }

    #[test]
    fn test_cli_parses_render() {
        let cli = Cli::try_parse_from([
            "wasmsynth", "-vv", "render", "synth.wasm", "--out", "out.wav", "--note", "60",
            "--note", "64", "--block", "256",
        ])
        .expect("valid arguments");
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Render { notes, block, sample_rate, .. } => {
                assert_eq!(notes, vec![60, 64]);
                assert_eq!(block, Some(256));
                assert_eq!(sample_rate, 48000);
            }
            _ => panic!("expected render"),
        }
    }

    #[test]
    fn test_render_frames_releases_at_three_quarters() {
        let (mut controller, mut render) =
            HostController::new(HostConfig::default()).expect("host");
        controller.load_bytes("gate", SYNTH).expect("load");

        let mut cursor = std::io::Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("writer");
        let faults = render_frames(&mut render, &mut writer, 1000, 100, 750, &[60], 100)
            .expect("render");
        writer.finalize().expect("finalize");
        assert_eq!(faults, 0);

        cursor.set_position(0);
        let mut reader = hound::WavReader::new(cursor).expect("reader");
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.expect("sample")).collect();
        let left: Vec<f32> = samples.iter().step_by(2).copied().collect();
        assert_eq!(left.len(), 1000);

        // Events land at the start of the cycle containing the release frame
        assert!(left[..700].iter().all(|&s| s > 0.0));
        assert!(left[700..].iter().all(|&s| s == 0.0));
    }
}
