//! wgpu back-end smoke test.
//!
//! Needs an adapter; machines without one skip the body.
//!
//! Run with: cargo test -p mobius_feedback --features wgpu --test wgpu_backend

#![cfg(feature = "wgpu")]

use std::path::Path;

use mobius_feedback::{FeedbackShader, StreamDescriptor, WgpuDevice};

#[test]
fn test_advect_on_gpu() {
    let Ok(device) = WgpuDevice::new() else {
        eprintln!("no wgpu adapter, skipping");
        return;
    };
    let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/shaders/advect.wgsl");
    let mut shader = FeedbackShader::new(device);
    assert!(shader.setup(
        source,
        vec![
            StreamDescriptor::new("position", "out_position", 3),
            StreamDescriptor::new("velocity", "out_velocity", 3),
        ],
        2,
    ));

    shader.set_data("position", &[[0.0f32, 0.0, 0.0], [1.0, 1.0, 1.0]]).unwrap();
    shader.set_data("velocity", &[[1.0f32, 2.0, 3.0], [0.5, 0.5, 0.5]]).unwrap();
    let before = shader.buffer("position").unwrap();

    shader.step().unwrap();
    assert_ne!(shader.buffer("position").unwrap(), before);
    let p: Vec<[f32; 3]> = shader.data("position").unwrap();
    assert_eq!(p, [[1.0, 2.0, 3.0], [1.5, 1.5, 1.5]]);
    let v: Vec<[f32; 3]> = shader.data("velocity").unwrap();
    assert_eq!(v, [[1.0, 2.0, 3.0], [0.5, 0.5, 0.5]]);
}
