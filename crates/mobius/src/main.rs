//! # MOBIUS Drift Demo
//!
//! Runs a particle drift scene through the feedback loop without a GPU:
//!
//! ```text
//! drift.toml → FeedbackConfig → FeedbackShader<HeadlessDevice>
//!     seed (ChaCha8, fixed) → step × N → attach → reload(recall) → report
//! ```
//!
//! Run with: cargo run --bin mobius_drift -- [scene.toml] [steps]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use mobius_core::{FeedbackConfig, FeedbackError, FeedbackResult};
use mobius_feedback::{AttachTarget, FeedbackShader, GpuDevice, HeadlessDevice, ShaderStage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Seed for the initial particle cloud.
const SEED: u64 = 42;

/// Steps when none are given on the command line.
const DEFAULT_STEPS: u32 = 240;

/// Report interval, in steps.
const REPORT_EVERY: u32 = 60;

/// Fixed timestep the drift kernel integrates with.
const DT: f32 = 1.0 / 60.0;

const GRAVITY: [f32; 3] = [0.0, -9.81, 0.0];
const DRAG: f32 = 0.98;

fn assets() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("assets")
}

/// CPU twin of `drift.vert`.
fn register_drift(device: &HeadlessDevice, source: &Path) {
    device.register_kernel(source, |input, output| {
        let p = input.attribute("position");
        let v = input.attribute("velocity");
        let age = input.attribute("age");

        let v: [f32; 3] = std::array::from_fn(|i| (v[i] + GRAVITY[i] * DT) * DRAG);
        let p: [f32; 3] = std::array::from_fn(|i| p[i] + v[i] * DT);
        output.set("out_velocity", &v);
        output.set("out_position", &p);
        output.set("out_age", &[age[0] + DT]);
    });
}

/// Seeds every stream and keeps the seed as initial data.
fn seed(shader: &mut FeedbackShader<HeadlessDevice>) -> FeedbackResult<()> {
    let count = shader.count();
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);

    let positions: Vec<[f32; 3]> = (0..count)
        .map(|_| [rng.gen_range(-1.0..1.0), rng.gen_range(0.0..2.0), rng.gen_range(-1.0..1.0)])
        .collect();
    let velocities: Vec<[f32; 3]> = (0..count)
        .map(|_| [rng.gen_range(-0.5..0.5), rng.gen_range(2.0..6.0), rng.gen_range(-0.5..0.5)])
        .collect();
    let ages = vec![0.0f32; count];

    shader.set_initial_data("position", &positions)?;
    shader.set_initial_data("velocity", &velocities)?;
    shader.set_initial_data("age", &ages)?;
    Ok(())
}

fn centroid(points: &[[f32; 3]]) -> [f32; 3] {
    let n = points.len().max(1) as f32;
    let sum = points.iter().fold([0.0f32; 3], |acc, p| {
        [acc[0] + p[0], acc[1] + p[1], acc[2] + p[2]]
    });
    [sum[0] / n, sum[1] / n, sum[2] / n]
}

fn run(config_path: &Path, steps: u32) -> FeedbackResult<()> {
    let config = FeedbackConfig::from_toml_file(config_path)?;
    let device = HeadlessDevice::new();
    register_drift(&device, &config.vertex_source);

    let mut shader = FeedbackShader::from_config(device.clone(), &config)?;
    if !shader.is_loaded() {
        return Err(FeedbackError::NotLoaded);
    }
    seed(&mut shader)?;

    // Render side: a points program reading the live streams per instance.
    let render = device.create_program("points");
    device.compile_stage(render, ShaderStage::Vertex, &assets().join("shaders/points.vert"))?;
    device.link_program(render)?;
    let binding = device.create_vertex_binding("points");

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                 MOBIUS DRIFT - FEEDBACK LOOP                 ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!("  scene      : {}", config_path.display());
    println!("  particles  : {}", shader.count());
    println!("  streams    : {}", shader.streams().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", "));
    println!();

    let start = Instant::now();
    for _ in 0..steps {
        let report = shader.step()?;
        shader.attach("position", &AttachTarget::new(render, binding, "instance_position").with_divisor(1))?;
        shader.attach("age", &AttachTarget::new(render, binding, "instance_age").with_divisor(1))?;

        let done = u32::try_from(shader.steps()).unwrap_or(u32::MAX);
        if done % REPORT_EVERY == 0 {
            let positions: Vec<[f32; 3]> = shader.data("position")?;
            let ages: Vec<f32> = shader.data("age")?;
            let c = centroid(&positions);
            println!(
                "  step {:>5} | role {} | centroid ({:>7.3}, {:>7.3}, {:>7.3}) | age {:.2}s",
                done,
                report.role.current(),
                c[0],
                c[1],
                c[2],
                ages.first().copied().unwrap_or_default()
            );
        }
    }
    let elapsed = start.elapsed();

    let drifted = centroid(&shader.data::<[f32; 3]>("position")?);
    shader.reload(true);
    let recalled = centroid(&shader.data::<[f32; 3]>("position")?);

    println!();
    println!("  ── REPORT ─────────────────────────────────────────────────────");
    println!("  steps            : {}", shader.steps());
    println!("  time             : {:.2} ms ({:.1} µs/step)",
        elapsed.as_secs_f64() * 1e3,
        elapsed.as_secs_f64() * 1e6 / f64::from(steps.max(1)));
    println!("  skipped binds    : {}", shader.skipped_input_binds());
    println!("  final centroid   : ({:.3}, {:.3}, {:.3})", drifted[0], drifted[1], drifted[2]);
    println!("  recalled centroid: ({:.3}, {:.3}, {:.3})", recalled[0], recalled[1], recalled[2]);
    if let Some(source) = device.vertex_binding_source(binding, 1) {
        println!("  attached         : {} → location {} (divisor {})", source.buffer, source.location, source.divisor);
    }

    tracing::info!(target: mobius_core::LOG_TARGET, "drift demo finished after {} steps", shader.steps());
    Ok(())
}

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().map_or_else(|| assets().join("drift.toml"), PathBuf::from);
    let steps = match args.next().map(|s| s.parse::<u32>()) {
        None => DEFAULT_STEPS,
        Some(Ok(steps)) => steps,
        Some(Err(e)) => {
            eprintln!("invalid step count: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(&config_path, steps) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mobius_drift: {e}");
            ExitCode::FAILURE
        }
    }
}
