//! # Feedback Shader Properties
//!
//! End-to-end behaviour of `FeedbackShader` on the headless device:
//!
//! 1. **Data I/O**: round trips, validation, unknown names
//! 2. **Stepping**: ping-pong isolation, double-step symmetry, input policies
//! 3. **Lifecycle**: snapshots, reload, link failures, drop
//! 4. **External binding**: attach, divisor, error isolation
//!
//! Run with: cargo test -p mobius_feedback --test feedback_properties

use std::path::{Path, PathBuf};

use mobius_feedback::{
    AttachTarget, DeviceError, FeedbackConfig, FeedbackError, FeedbackShader, GpuDevice, HeadlessDevice,
    MissingInputPolicy, RoleIndex, ShaderStage, StreamDescriptor,
};

const COUNT: usize = 4;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/shaders").join(name)
}

/// A scratch copy of `fixture` that a test may rewrite.
fn scratch_copy(fixture_name: &str, tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mobius_{}_{tag}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(fixture_name);
    std::fs::copy(fixture(fixture_name), &path).unwrap();
    path
}

fn register_advect(device: &HeadlessDevice, source: &Path) {
    device.register_kernel(source, |input, output| {
        let p = input.attribute("position");
        let v = input.attribute("velocity");
        output.set("out_position", &[p[0] + v[0], p[1] + v[1], p[2] + v[2]]);
        output.set("out_velocity", v);
    });
}

fn streams() -> Vec<StreamDescriptor> {
    vec![
        StreamDescriptor::new("position", "out_position", 3),
        StreamDescriptor::new("velocity", "out_velocity", 3),
    ]
}

fn positions() -> Vec<[f32; 3]> {
    (0..COUNT).map(|i| [i as f32, 0.0, -(i as f32)]).collect()
}

fn velocities() -> Vec<[f32; 3]> {
    (0..COUNT).map(|i| [1.0, 0.5 * i as f32, 0.0]).collect()
}

fn advect_shader(device: &HeadlessDevice, source: &Path) -> FeedbackShader<HeadlessDevice> {
    register_advect(device, source);
    let mut shader = FeedbackShader::new(device.clone());
    assert!(shader.setup(source, streams(), COUNT));
    shader.set_data("position", &positions()).unwrap();
    shader.set_data("velocity", &velocities()).unwrap();
    shader
}

// ============================================================================
// DATA I/O
// ============================================================================

#[test]
fn test_round_trip_without_step() {
    let device = HeadlessDevice::new();
    let shader = advect_shader(&device, &fixture("advect.vert"));

    let data: Vec<[f32; 3]> = shader.data("position").unwrap();
    assert_eq!(data, positions());

    let raw = shader.read_raw("velocity", 12).unwrap();
    assert_eq!(raw.len(), COUNT * 12);
}

#[test]
fn test_mismatched_writes_leave_contents() {
    let device = HeadlessDevice::new();
    let shader = advect_shader(&device, &fixture("advect.vert"));

    let short = vec![[9.0f32; 3]; COUNT - 1];
    assert!(matches!(
        shader.set_data("position", &short),
        Err(FeedbackError::ElementCount { expected: COUNT, actual, .. }) if actual == COUNT - 1
    ));

    let wide = vec![[9.0f32; 4]; COUNT];
    assert!(matches!(
        shader.set_data("position", &wide),
        Err(FeedbackError::ElementWidth { expected: 12, actual: 16, .. })
    ));

    let data: Vec<[f32; 3]> = shader.data("position").unwrap();
    assert_eq!(data, positions());
}

#[test]
fn test_unknown_name_is_isolated() {
    let device = HeadlessDevice::new();
    let mut shader = advect_shader(&device, &fixture("advect.vert"));
    let unknown = || FeedbackError::UnknownStream("ghost".into());
    let junk = vec![[7.0f32; 3]; COUNT];

    assert_eq!(shader.buffer("ghost"), Err(unknown()));
    assert_eq!(shader.data::<[f32; 3]>("ghost"), Err(unknown()));
    assert_eq!(shader.read_raw("ghost", 12), Err(unknown()));
    assert_eq!(shader.set_data("ghost", &junk), Err(unknown()));
    assert_eq!(shader.set_initial_data("ghost", &junk), Err(unknown()));
    assert_eq!(shader.recall_initial_data("ghost"), Err(unknown()));
    assert_eq!(shader.clear_initial_data("ghost"), Err(unknown()));
    assert!(!shader.has_initial_data("ghost"));
    assert!(shader.stream("ghost").is_none());

    let p: Vec<[f32; 3]> = shader.data("position").unwrap();
    let v: Vec<[f32; 3]> = shader.data("velocity").unwrap();
    assert_eq!(p, positions());
    assert_eq!(v, velocities());
}

// ============================================================================
// STEPPING
// ============================================================================

#[test]
fn test_step_swaps_buffers_and_writes_pass_output() {
    let device = HeadlessDevice::new();
    let mut shader = advect_shader(&device, &fixture("advect.vert"));
    let before = shader.buffer("position").unwrap();

    let report = shader.step().unwrap();
    assert_eq!(report.points, COUNT as u32);
    assert_eq!(report.role, shader.role());

    let after = shader.buffer("position").unwrap();
    assert_ne!(before, after);

    let expected: Vec<[f32; 3]> = positions()
        .iter()
        .zip(velocities())
        .map(|(p, v)| [p[0] + v[0], p[1] + v[1], p[2] + v[2]])
        .collect();
    let data: Vec<[f32; 3]> = shader.data("position").unwrap();
    assert_eq!(data, expected);

    assert!(!device.rasterizer_discard());
    assert_eq!(device.bound_vertex_inputs(), 0);
    assert_eq!(device.pass_count(), 1);
}

#[test]
fn test_two_steps_restore_role_and_buffer() {
    let device = HeadlessDevice::new();
    let mut shader = advect_shader(&device, &fixture("advect.vert"));
    let role = shader.role();
    let buffers: Vec<_> = ["position", "velocity"]
        .iter()
        .map(|name| shader.buffer(name).unwrap())
        .collect();

    shader.step().unwrap();
    assert_ne!(shader.role(), role);
    shader.step().unwrap();

    assert_eq!(shader.role(), role);
    for (name, buffer) in ["position", "velocity"].iter().zip(buffers) {
        assert_eq!(shader.buffer(name).unwrap(), buffer);
    }
    assert_eq!(shader.steps(), 2);
}

#[test]
fn test_input_policies() {
    let device = HeadlessDevice::new();
    let source = fixture("advect.vert");
    register_advect(&device, &source);

    let mut shader = FeedbackShader::new(device.clone());
    let mut descriptors = streams();
    descriptors[1] = StreamDescriptor::new("speed", "out_velocity", 3);
    assert!(shader.setup(&source, descriptors, COUNT));
    assert_eq!(shader.missing_input_policy(), MissingInputPolicy::Skip);

    let report = shader.step().unwrap();
    assert_eq!(report.skipped_inputs, 1);
    assert_eq!(shader.skipped_input_binds(), 1);

    shader.set_missing_input_policy(MissingInputPolicy::Reject);
    let role = shader.role();
    assert!(matches!(
        shader.step(),
        Err(FeedbackError::UnresolvedAttribute { ref stream, .. }) if stream == "speed"
    ));
    assert_eq!(shader.role(), role);
    assert_eq!(device.pass_count(), 1);
}

#[test]
fn test_device_failure_unwinds_pass() {
    let device = HeadlessDevice::new();
    let mut shader = advect_shader(&device, &fixture("advect.vert"));
    let velocity = shader.buffer("velocity").unwrap();
    device.destroy_buffer(velocity);

    assert!(matches!(
        shader.step(),
        Err(FeedbackError::Device(DeviceError::UnknownBuffer(id))) if id == velocity
    ));
    assert_eq!(shader.role(), RoleIndex::INITIAL);
    assert_eq!(shader.steps(), 0);
    assert!(!device.rasterizer_discard());
    assert_eq!(device.bound_vertex_inputs(), 0);
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn test_snapshot_recall() {
    let device = HeadlessDevice::new();
    let mut shader = advect_shader(&device, &fixture("advect.vert"));
    let x = positions();
    let y = vec![[5.0f32; 3]; COUNT];

    shader.set_initial_data("position", &x).unwrap();
    shader.set_data("position", &y).unwrap();
    shader.recall_initial_data("position").unwrap();

    let data: Vec<[f32; 3]> = shader.data("position").unwrap();
    assert_eq!(data, x);
    assert_eq!(
        shader.recall_initial_data("velocity"),
        Err(FeedbackError::NoSnapshot("velocity".into()))
    );
}

#[test]
fn test_initial_data_replaced_and_kept_on_error() {
    let device = HeadlessDevice::new();
    let mut shader = advect_shader(&device, &fixture("advect.vert"));
    let first = vec![[2.0f32; 3]; COUNT];
    let second = vec![[1.0f32; 3]; COUNT];

    shader.set_initial_data("position", &first).unwrap();
    shader.set_initial_data("position", &second).unwrap();
    assert!(shader.set_initial_data("position", &second[1..]).is_err());
    assert!(shader.write_initial_raw("position", 16, &[0; COUNT * 16]).is_err());

    shader.set_data("position", &positions()).unwrap();
    shader.recall_initial_data("position").unwrap();
    let data: Vec<[f32; 3]> = shader.data("position").unwrap();
    assert_eq!(data, second);
}

#[test]
fn test_reload_preserves_or_recalls() {
    let device = HeadlessDevice::new();
    let mut shader = advect_shader(&device, &fixture("advect.vert"));
    shader.set_initial_data("position", &positions()).unwrap();

    for _ in 0..3 {
        shader.step().unwrap();
    }
    let stepped: Vec<[f32; 3]> = shader.data("position").unwrap();
    let velocity: Vec<[f32; 3]> = shader.data("velocity").unwrap();
    let live = device.live_buffer_count();

    assert!(shader.reload(false));
    let data: Vec<[f32; 3]> = shader.data("position").unwrap();
    assert_eq!(data, stepped);
    assert_eq!(device.live_buffer_count(), live);

    assert!(shader.reload(true));
    let data: Vec<[f32; 3]> = shader.data("position").unwrap();
    assert_eq!(data, positions());
    let data: Vec<[f32; 3]> = shader.data("velocity").unwrap();
    assert_eq!(data, velocity);
    assert_eq!(device.live_buffer_count(), live);
}

#[test]
fn test_cleared_snapshot_not_recalled() {
    let device = HeadlessDevice::new();
    let mut shader = advect_shader(&device, &fixture("advect.vert"));
    shader.set_initial_data("position", &positions()).unwrap();
    assert!(shader.clear_initial_data("position").unwrap());

    shader.step().unwrap();
    let stepped: Vec<[f32; 3]> = shader.data("position").unwrap();
    assert!(shader.reload(true));
    let data: Vec<[f32; 3]> = shader.data("position").unwrap();
    assert_eq!(data, stepped);
}

#[test]
fn test_reload_after_broken_edit() {
    let device = HeadlessDevice::new();
    let source = scratch_copy("advect.vert", "reload");
    let mut shader = advect_shader(&device, &source);
    shader.step().unwrap();
    let stepped: Vec<[f32; 3]> = shader.data("position").unwrap();

    let original = std::fs::read_to_string(&source).unwrap();
    std::fs::write(&source, original.replace("out vec3 out_velocity;", "")).unwrap();
    assert!(!shader.reload(false));
    assert!(!shader.is_loaded());
    let role = shader.role();
    assert_eq!(shader.step(), Err(FeedbackError::NotLoaded));
    assert_eq!(shader.role(), role);

    std::fs::write(&source, original).unwrap();
    assert!(shader.reload(false));
    let data: Vec<[f32; 3]> = shader.data("position").unwrap();
    assert_eq!(data, stepped);
}

#[test]
fn test_undeclared_capture_fails_link() {
    let device = HeadlessDevice::new();
    let source = fixture("advect.vert");
    register_advect(&device, &source);

    let mut shader = FeedbackShader::new(device.clone());
    let loaded = shader.setup(
        &source,
        vec![StreamDescriptor::new("position", "out_missing", 3)],
        COUNT,
    );
    assert!(!loaded);
    assert!(!shader.is_loaded());
    assert_eq!(shader.step(), Err(FeedbackError::NotLoaded));
    assert_eq!(shader.role(), RoleIndex::INITIAL);

    // Buffers still exist for data I/O.
    shader.set_data("position", &positions()).unwrap();
}

#[test]
fn test_step_before_setup() {
    let mut shader = FeedbackShader::new(HeadlessDevice::new());
    assert_eq!(shader.step(), Err(FeedbackError::NotLoaded));
    assert!(!shader.reload(true));
    assert_eq!(shader.count(), 0);
}

#[test]
fn test_setup_again_releases_old_buffers() {
    let device = HeadlessDevice::new();
    let source = fixture("advect.vert");
    let mut shader = advect_shader(&device, &source);
    shader.step().unwrap();

    assert!(shader.setup(&source, streams(), COUNT * 2));
    assert_eq!(device.live_buffer_count(), 4);
    assert_eq!(shader.role(), RoleIndex::INITIAL);
    assert_eq!(shader.count(), COUNT * 2);
    assert_eq!(shader.steps(), 0);
}

#[test]
fn test_drop_destroys_buffers() {
    let device = HeadlessDevice::new();
    {
        let _shader = advect_shader(&device, &fixture("advect.vert"));
        assert_eq!(device.live_buffer_count(), 4);
    }
    assert_eq!(device.live_buffer_count(), 0);
}

#[test]
fn test_from_config_file() {
    let device = HeadlessDevice::new();
    let source = scratch_copy("advect.vert", "config");
    let config_path = source.with_file_name("scene.toml");
    std::fs::write(
        &config_path,
        r#"
            vertex_source = "advect.vert"
            particle_count = 4
            missing_input = "reject"

            [[streams]]
            name = "position"
            capture = "out_position"
            components = 3

            [[streams]]
            name = "velocity"
            capture = "out_velocity"
            components = 3
        "#,
    )
    .unwrap();

    let config = FeedbackConfig::from_toml_file(&config_path).unwrap();
    assert_eq!(config.vertex_source, source);
    register_advect(&device, &config.vertex_source);

    let mut shader = FeedbackShader::from_config(device, &config).unwrap();
    assert!(shader.is_loaded());
    assert_eq!(shader.missing_input_policy(), MissingInputPolicy::Reject);
    assert_eq!(shader.count(), 4);
    shader.step().unwrap();
}

#[test]
fn test_from_config_rejects_invalid() {
    let config = FeedbackConfig {
        vertex_source: fixture("advect.vert"),
        particle_count: 0,
        missing_input: MissingInputPolicy::Skip,
        streams: streams(),
    };
    assert!(matches!(
        FeedbackShader::from_config(HeadlessDevice::new(), &config),
        Err(FeedbackError::Config(_))
    ));
}

// ============================================================================
// EXTERNAL BINDING
// ============================================================================

#[test]
fn test_attach_forwards_current_buffer_and_divisor() {
    let device = HeadlessDevice::new();
    let mut shader = advect_shader(&device, &fixture("advect.vert"));

    let render = device.create_program("points");
    device
        .compile_stage(render, ShaderStage::Vertex, &fixture("points.vert"))
        .unwrap();
    device.link_program(render).unwrap();
    let binding = device.create_vertex_binding("points");
    let target = AttachTarget::new(render, binding, "instance_position").with_divisor(1);

    let bound = shader.attach("position", &target).unwrap();
    assert_eq!(bound.location, 3);
    assert_eq!(bound.divisor, 1);
    assert_eq!(bound.components, 3);
    assert_eq!(bound.buffer, shader.buffer("position").unwrap());
    assert_eq!(device.vertex_binding_source(binding, 3), Some(bound));

    shader.step().unwrap();
    let rebound = shader.attach("position", &target).unwrap();
    assert_ne!(rebound.buffer, bound.buffer);
    assert_eq!(rebound.buffer, shader.buffer("position").unwrap());
}

#[test]
fn test_attach_errors_leave_binding() {
    let device = HeadlessDevice::new();
    let shader = advect_shader(&device, &fixture("advect.vert"));

    let render = device.create_program("points");
    device
        .compile_stage(render, ShaderStage::Vertex, &fixture("points.vert"))
        .unwrap();
    device.link_program(render).unwrap();
    let binding = device.create_vertex_binding("points");
    let target = AttachTarget::new(render, binding, "instance_position");
    let bound = shader.attach("position", &target).unwrap();
    assert_eq!(bound.divisor, 0);

    assert_eq!(
        shader.attach("ghost", &target),
        Err(FeedbackError::UnknownStream("ghost".into()))
    );
    assert_eq!(
        shader.attach("velocity", &AttachTarget::new(render, binding, "nothing")),
        Err(FeedbackError::UnknownTargetAttribute("nothing".into()))
    );
    assert_eq!(device.vertex_binding_source(binding, 3), Some(bound));
}
