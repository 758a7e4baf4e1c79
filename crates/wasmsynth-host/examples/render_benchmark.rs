//! Render Path Benchmarks
//!
//! Run with: cargo run -p wasmsynth-host --example render_benchmark --release

use std::time::{Duration, Instant};
use wasmsynth_host::{HostConfig, HostController, ModuleImage, NoteEvent};

const SYNTH_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/triangle.wat");

fn main() {
    println!("=== Render Path Benchmarks ===\n");

    bench_compile();
    bench_load();
    bench_rebind();
    bench_cycles(HostConfig::default(), "default");
    bench_cycles(HostConfig::realtime(), "realtime (fuel metered)");
    bench_swap_under_render();

    println!("\n=== Benchmark Complete ===");
}

fn bench_compile() {
    println!("## Compile");

    let (controller, _render) = HostController::new(HostConfig::default()).unwrap();
    let image = ModuleImage::from_file(SYNTH_PATH).unwrap();

    let mut times = Vec::new();
    for _ in 0..20 {
        let start = Instant::now();
        let _ = controller.compile(image.clone()).unwrap();
        times.push(start.elapsed().as_micros() as u64);
    }

    print_stats("compile", &times);
    println!();
}

fn bench_load() {
    println!("## Instantiate + Resolve");

    let (mut controller, _render) = HostController::new(HostConfig::default()).unwrap();
    let artifact = controller
        .compile(ModuleImage::from_file(SYNTH_PATH).unwrap())
        .unwrap();

    let mut times = Vec::new();
    for _ in 0..100 {
        let start = Instant::now();
        controller.install(artifact.clone()).unwrap();
        times.push(start.elapsed().as_micros() as u64);
    }

    print_stats("install", &times);
    println!();
}

fn bench_rebind() {
    println!("## Sample Rate Change");

    let (mut controller, _render) = HostController::new(HostConfig::default()).unwrap();
    controller.load_file(SYNTH_PATH).unwrap();

    let mut times = Vec::new();
    for i in 0..100 {
        let rate = if i % 2 == 0 { 44_100.0 } else { 48_000.0 };
        let start = Instant::now();
        controller.prepare(rate).unwrap();
        times.push(start.elapsed().as_micros() as u64);
    }

    print_stats("prepare", &times);
    println!();
}

fn bench_cycles(config: HostConfig, label: &str) {
    println!("## Cycle Latency: {}", label);

    let (mut controller, mut render) = HostController::new(config).unwrap();
    controller.prepare(48_000.0).unwrap();
    controller.load_file(SYNTH_PATH).unwrap();

    for frames in [64usize, 128, 512, 2048] {
        let mut left = vec![0.0f32; frames];
        let mut right = vec![0.0f32; frames];
        let note = [NoteEvent::note_on(1, 69, 100)];

        // Warm up
        for _ in 0..100 {
            render.process(&mut left, &mut right, &note);
        }

        let mut times = Vec::new();
        for i in 0..2_000 {
            let events: &[NoteEvent] = if i % 100 == 0 { &note } else { &[] };
            let start = Instant::now();
            render.process(&mut left, &mut right, events);
            times.push(start.elapsed().as_nanos() as u64 / 1000);
        }

        let budget = Duration::from_secs_f64(frames as f64 / 48_000.0);
        print_stats(&format!("{} frames (budget {}us)", frames, budget.as_micros()), &times);
    }

    let stats = controller.status().render;
    println!("  faults={} chunks={}", stats.faults, stats.chunks);
    println!();
}

fn bench_swap_under_render() {
    println!("## Swap While Rendering");

    let (mut controller, mut render) = HostController::new(HostConfig::default()).unwrap();
    let artifact = controller
        .compile(ModuleImage::from_file(SYNTH_PATH).unwrap())
        .unwrap();
    controller.install(artifact.clone()).unwrap();

    let mut times = Vec::new();
    std::thread::scope(|s| {
        let renderer = s.spawn(|| {
            let mut left = vec![0.0f32; 128];
            let mut right = vec![0.0f32; 128];
            let mut cycle_times = Vec::new();
            for _ in 0..20_000 {
                let start = Instant::now();
                render.process(&mut left, &mut right, &[]);
                cycle_times.push(start.elapsed().as_nanos() as u64 / 1000);
            }
            cycle_times
        });

        for _ in 0..50 {
            let start = Instant::now();
            controller.install(artifact.clone()).unwrap();
            times.push(start.elapsed().as_micros() as u64);
        }

        print_stats("process (during swaps)", &renderer.join().unwrap());
    });

    print_stats("install (during render)", &times);
    println!("  retiring={}", controller.status().retiring);
    controller.wait_for_retirement(Duration::from_secs(1));
    println!("  retiring after wait={}", controller.status().retiring);
}

fn print_stats(name: &str, times: &[u64]) {
    if times.is_empty() {
        println!("  {}: no samples", name);
        return;
    }

    let mut sorted = times.to_vec();
    sorted.sort();

    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    let mean = times.iter().sum::<u64>() as f64 / times.len() as f64;
    let p50 = sorted[sorted.len() / 2];
    let p99 = sorted[(sorted.len() * 99) / 100];

    println!("  {}: n={} min={}us mean={:.1}us p50={}us p99={}us max={}us",
             name, times.len(), min, mean, p50, p99, max);
}
