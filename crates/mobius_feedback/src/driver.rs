//! # Feedback Driver
//!
//! Runs one double-buffered update per [`FeedbackDriver::step`].
//!
//! ## One Step
//!
//! ```text
//!        role r                         role r ^ 1
//!   ┌─────────────┐   capture pass   ┌─────────────┐
//!   │ buffer[r]   │ ───────────────▶ │ buffer[r^1] │   (for every stream)
//!   │ (current)   │   N points,      │ (next)      │
//!   └─────────────┘   no raster      └─────────────┘
//! ```
//!
//! All streams share one role bit, so every stream produced by the same pass flips in
//! lockstep and stays time-synchronized.

use mobius_core::{
    BufferId, DeviceResult, FeedbackError, FeedbackResult, GpuDevice, MissingInputPolicy,
    RoleIndex, LOG_TARGET,
};

use crate::program::FeedbackProgram;
use crate::registry::AttributeRegistry;

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    /// Role after the flip; `buffer(name)` now returns this role's current buffer.
    pub role: RoleIndex,
    /// Points drawn.
    pub points: u32,
    /// Streams whose current buffer was bound as a vertex input.
    pub bound_inputs: u32,
    /// Streams skipped because the program has no input location for them.
    pub skipped_inputs: u32,
}

/// A vertex input resolved for this pass.
#[derive(Debug, Clone, Copy)]
struct InputBind {
    location: u32,
    buffer: BufferId,
    components: u32,
}

/// Owner of the shared role bit.
#[derive(Debug, Clone)]
pub struct FeedbackDriver {
    role: RoleIndex,
    policy: MissingInputPolicy,
    steps: u64,
    skipped_total: u64,
}

impl FeedbackDriver {
    /// Creates a driver in the initial role.
    #[must_use]
    pub fn new(policy: MissingInputPolicy) -> Self {
        Self {
            role: RoleIndex::INITIAL,
            policy,
            steps: 0,
            skipped_total: 0,
        }
    }

    /// Current role.
    #[inline]
    #[must_use]
    pub fn role(&self) -> RoleIndex {
        self.role
    }

    /// Policy for unresolved input locations.
    #[inline]
    #[must_use]
    pub fn policy(&self) -> MissingInputPolicy {
        self.policy
    }

    /// Changes the policy for subsequent steps.
    pub fn set_policy(&mut self, policy: MissingInputPolicy) {
        self.policy = policy;
    }

    /// Completed steps.
    #[inline]
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Input binds skipped over the driver's lifetime.
    #[inline]
    #[must_use]
    pub fn skipped_total(&self) -> u64 {
        self.skipped_total
    }

    /// Runs one capture pass and flips the role.
    ///
    /// # Errors
    ///
    /// - [`FeedbackError::NotLoaded`] when the program did not link.
    /// - [`FeedbackError::UnresolvedAttribute`] under [`MissingInputPolicy::Reject`].
    /// - [`FeedbackError::Device`] when the pass fails.
    ///
    /// The role is only flipped when the pass succeeds.
    pub fn step<D: GpuDevice>(
        &mut self,
        device: &D,
        program: &FeedbackProgram,
        registry: &AttributeRegistry,
    ) -> FeedbackResult<StepReport> {
        if !program.is_loaded() {
            return Err(FeedbackError::NotLoaded.logged());
        }

        let mut inputs = Vec::with_capacity(registry.len());
        let mut captures = Vec::with_capacity(registry.len());
        let mut skipped = 0u32;
        for binding in registry.bindings() {
            let name = &binding.descriptor.name;
            match program.input_location(device, name) {
                Some(location) => inputs.push(InputBind {
                    location,
                    buffer: binding.pair.current(self.role),
                    components: binding.descriptor.components,
                }),
                None if self.policy == MissingInputPolicy::Skip => {
                    tracing::warn!(target: LOG_TARGET, "no input location for stream '{}', bind skipped", name);
                    skipped += 1;
                }
                None => {
                    return Err(FeedbackError::UnresolvedAttribute {
                        stream: name.clone(),
                        attribute: name.clone(),
                    }
                    .logged());
                }
            }
            captures.push((binding.ordinal, binding.pair.next(self.role)));
        }

        // `AttributeRegistry::build` rejects counts beyond u32.
        let points = u32::try_from(registry.count()).unwrap_or(u32::MAX);

        device.set_rasterizer_discard(true);
        let pass = Self::run_pass(device, program, &inputs, &captures, points);
        for input in &inputs {
            device.unbind_vertex_input(input.location);
        }
        device.set_rasterizer_discard(false);
        pass.map_err(|e| FeedbackError::from(e).logged())?;

        self.role = self.role.flipped();
        self.steps += 1;
        self.skipped_total += u64::from(skipped);

        let report = StepReport {
            role: self.role,
            points,
            bound_inputs: u32::try_from(inputs.len()).unwrap_or(u32::MAX),
            skipped_inputs: skipped,
        };
        tracing::debug!(target: LOG_TARGET, "step {} done: {:?}", self.steps, report);
        Ok(report)
    }

    fn run_pass<D: GpuDevice>(
        device: &D,
        program: &FeedbackProgram,
        inputs: &[InputBind],
        captures: &[(u32, BufferId)],
        points: u32,
    ) -> DeviceResult<()> {
        for input in inputs {
            device.bind_vertex_input(input.location, input.buffer, input.components)?;
        }
        for &(index, buffer) in captures {
            device.bind_capture_target(index, buffer)?;
        }
        device.begin_capture(program.id())?;
        let drawn = device.draw_points(points);
        let ended = device.end_capture();
        drawn.and(ended)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::headless::HeadlessDevice;
    use mobius_core::StreamDescriptor;

    fn setup(device: &HeadlessDevice, streams: &[StreamDescriptor]) -> (FeedbackProgram, AttributeRegistry) {
        let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/shaders/advect.vert");
        device.register_kernel(&source, |input, output| {
            let p = input.attribute("position");
            let v = input.attribute("velocity");
            output.set("out_position", &[p[0] + v[0], p[1] + v[1], p[2] + v[2]]);
            output.set("out_velocity", v);
        });
        let varyings = streams.iter().map(|s| s.capture.clone()).collect();
        let mut program = FeedbackProgram::create(device, source, varyings);
        program.build(device);
        let registry = AttributeRegistry::build(device, streams, 2);
        registry.allocate(device).unwrap();
        (program, registry)
    }

    fn streams() -> Vec<StreamDescriptor> {
        vec![
            StreamDescriptor::new("position", "out_position", 3),
            StreamDescriptor::new("velocity", "out_velocity", 3),
        ]
    }

    #[test]
    fn test_step_advects_and_flips() {
        let device = HeadlessDevice::new();
        let (program, registry) = setup(&device, &streams());
        let mut driver = FeedbackDriver::new(MissingInputPolicy::Skip);

        registry
            .write_raw(&device, "position", 12, bytemuck::cast_slice(&[0.0f32, 0.0, 0.0, 1.0, 1.0, 1.0]))
            .unwrap();
        registry
            .write_raw(&device, "velocity", 12, bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 0.5, 0.5, 0.5]))
            .unwrap();

        let report = driver.step(&device, &program, &registry).unwrap();
        assert_eq!(report.role, RoleIndex::INITIAL.flipped());
        assert_eq!(report.points, 2);
        assert_eq!(report.bound_inputs, 2);
        assert_eq!(report.skipped_inputs, 0);
        assert_eq!(driver.role(), report.role);
        assert!(!device.rasterizer_discard());

        let p: Vec<[f32; 3]> = registry.data(&device, driver.role(), "position").unwrap();
        assert_eq!(p, [[1.0, 2.0, 3.0], [1.5, 1.5, 1.5]]);
    }

    #[test]
    fn test_not_loaded_refuses() {
        let device = HeadlessDevice::new();
        let mut program = FeedbackProgram::create(&device, "nowhere.vert".into(), vec![]);
        program.build(&device);
        let registry = AttributeRegistry::build(&device, &streams(), 2);
        let mut driver = FeedbackDriver::new(MissingInputPolicy::Skip);
        assert_eq!(driver.step(&device, &program, &registry), Err(FeedbackError::NotLoaded));
        assert_eq!(driver.role(), RoleIndex::INITIAL);
        assert_eq!(device.pass_count(), 0);
    }

    #[test]
    fn test_skip_policy_counts() {
        let device = HeadlessDevice::new();
        let mut descriptors = streams();
        descriptors[1] = StreamDescriptor::new("speed", "out_velocity", 3);
        let (program, registry) = setup(&device, &descriptors);
        let mut driver = FeedbackDriver::new(MissingInputPolicy::Skip);

        let report = driver.step(&device, &program, &registry).unwrap();
        assert_eq!(report.skipped_inputs, 1);
        assert_eq!(report.bound_inputs, 1);
        driver.step(&device, &program, &registry).unwrap();
        assert_eq!(driver.skipped_total(), 2);
        assert_eq!(driver.steps(), 2);
    }

    #[test]
    fn test_reject_policy_keeps_role() {
        let device = HeadlessDevice::new();
        let mut descriptors = streams();
        descriptors[1] = StreamDescriptor::new("speed", "out_velocity", 3);
        let (program, registry) = setup(&device, &descriptors);
        let mut driver = FeedbackDriver::new(MissingInputPolicy::Reject);

        let err = driver.step(&device, &program, &registry).unwrap_err();
        assert!(matches!(err, FeedbackError::UnresolvedAttribute { ref stream, .. } if stream == "speed"));
        assert_eq!(driver.role(), RoleIndex::INITIAL);
        assert_eq!(device.pass_count(), 0);
        assert!(!device.rasterizer_discard());
    }
}
