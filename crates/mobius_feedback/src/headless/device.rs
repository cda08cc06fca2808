//! # Headless Device
//!
//! A CPU reference implementation of [`GpuDevice`].
//!
//! Buffers are byte vectors. A compiled vertex stage is its scanned `in`/`out`
//! interface plus a [`Kernel`] registered for the source path, and a capture draw
//! runs that kernel once per point.
//!
//! ## Draw Execution
//!
//! ```text
//! draw_points(n)
//!   ├─ lock: snapshot bound inputs, resolve capture targets
//!   ├─ unlock: run kernel for points 0..n
//!   └─ lock: write every capture target
//! ```
//!
//! The kernel runs without the lock held, so it may freely call back into the device.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mobius_core::{
    AttributeSource, BufferId, DeviceError, DeviceResult, GpuDevice, ProgramId, ShaderStage,
    VertexBindingId, FLOAT_BYTES, LOG_TARGET,
};
use parking_lot::RwLock;

use super::kernel::{self, Kernel, PointInput, PointOutput, DEFAULT_INPUT};
use super::source::{self, StageInterface};

#[derive(Debug)]
struct BufferSlot {
    label: String,
    data: Option<Vec<u8>>,
}

/// Result of a successful link.
struct Linked {
    /// `(name, location, components)` of every vertex input.
    inputs: Vec<(String, u32, u32)>,
    /// `(name, components)` of every captured output, in capture-index order.
    captures: Vec<(String, u32)>,
    kernel: Option<Arc<Kernel>>,
}

#[derive(Default)]
struct ProgramSlot {
    label: String,
    vertex: Option<(PathBuf, StageInterface)>,
    fragment: Option<PathBuf>,
    varyings: Vec<String>,
    linked: Option<Linked>,
}

#[derive(Default)]
struct State {
    next_id: u32,
    buffers: HashMap<BufferId, BufferSlot>,
    programs: HashMap<ProgramId, ProgramSlot>,
    bindings: HashMap<VertexBindingId, BTreeMap<u32, AttributeSource>>,
    kernels: HashMap<PathBuf, Arc<Kernel>>,
    vertex_inputs: BTreeMap<u32, (BufferId, u32)>,
    capture_targets: BTreeMap<u32, BufferId>,
    capture: Option<ProgramId>,
    rasterizer_discard: bool,
    passes: u64,
}

impl State {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn storage(&self, buffer: BufferId) -> DeviceResult<&Vec<u8>> {
        self.buffers
            .get(&buffer)
            .ok_or(DeviceError::UnknownBuffer(buffer))?
            .data
            .as_ref()
            .ok_or(DeviceError::NotAllocated(buffer))
    }

    fn storage_mut(&mut self, buffer: BufferId) -> DeviceResult<&mut Vec<u8>> {
        self.buffers
            .get_mut(&buffer)
            .ok_or(DeviceError::UnknownBuffer(buffer))?
            .data
            .as_mut()
            .ok_or(DeviceError::NotAllocated(buffer))
    }
}

/// Everything a draw needs, gathered under the lock.
struct PassPlan {
    kernel: Arc<Kernel>,
    input_slots: Vec<kernel::Slot>,
    input_width: usize,
    /// Per input: bound floats and their element width, or `None` for the default.
    columns: Vec<Option<(Vec<f32>, usize)>>,
    output_slots: Vec<kernel::Slot>,
    output_width: usize,
    targets: Vec<BufferId>,
}

/// CPU reference device.
///
/// Cloning is cheap; clones share one context.
#[derive(Clone, Default)]
pub struct HeadlessDevice {
    state: Arc<RwLock<State>>,
}

impl fmt::Debug for HeadlessDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("HeadlessDevice")
            .field("buffers", &state.buffers.len())
            .field("programs", &state.programs.len())
            .field("kernels", &state.kernels.len())
            .field("passes", &state.passes)
            .finish()
    }
}

impl HeadlessDevice {
    /// Creates an empty device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the kernel that executes vertex stages compiled from `path`.
    ///
    /// Programs already linked keep the kernel they linked with; relink to pick up a
    /// replacement.
    pub fn register_kernel<F>(&self, path: impl AsRef<Path>, kernel: F)
    where
        F: Fn(&PointInput<'_>, &mut PointOutput<'_>) + Send + Sync + 'static,
    {
        self.state
            .write()
            .kernels
            .insert(path.as_ref().to_path_buf(), Arc::new(kernel));
    }

    /// Buffers created and not yet destroyed.
    #[must_use]
    pub fn live_buffer_count(&self) -> usize {
        self.state.read().buffers.len()
    }

    /// Capture blocks completed.
    #[must_use]
    pub fn pass_count(&self) -> u64 {
        self.state.read().passes
    }

    /// Whether rasterization is currently suspended.
    #[must_use]
    pub fn rasterizer_discard(&self) -> bool {
        self.state.read().rasterizer_discard
    }

    /// Vertex inputs currently enabled.
    #[must_use]
    pub fn bound_vertex_inputs(&self) -> usize {
        self.state.read().vertex_inputs.len()
    }

    /// Source wired at `location` of `binding`.
    #[must_use]
    pub fn vertex_binding_source(&self, binding: VertexBindingId, location: u32) -> Option<AttributeSource> {
        self.state
            .read()
            .bindings
            .get(&binding)
            .and_then(|sources| sources.get(&location))
            .copied()
    }

    fn link(slot: &ProgramSlot, kernels: &HashMap<PathBuf, Arc<Kernel>>) -> Result<Linked, String> {
        let Some((path, interface)) = slot.vertex.as_ref() else {
            return Err(format!("'{}' has no compiled vertex stage", slot.label));
        };

        let mut captures = Vec::with_capacity(slot.varyings.len());
        for varying in &slot.varyings {
            let declared = interface
                .output(varying)
                .ok_or_else(|| format!("feedback varying '{varying}' is not a vertex output"))?;
            captures.push((varying.clone(), declared.components));
        }

        let mut taken: Vec<u32> = Vec::new();
        for declared in &interface.inputs {
            if let Some(location) = declared.location {
                if taken.contains(&location) {
                    return Err(format!("input location {location} assigned twice"));
                }
                taken.push(location);
            }
        }
        let mut next = 0u32;
        let mut inputs = Vec::with_capacity(interface.inputs.len());
        for declared in &interface.inputs {
            let location = match declared.location {
                Some(location) => location,
                None => {
                    while taken.contains(&next) {
                        next += 1;
                    }
                    taken.push(next);
                    next
                }
            };
            inputs.push((declared.name.clone(), location, declared.components));
        }

        let kernel = kernels.get(path).cloned();
        if !captures.is_empty() && kernel.is_none() {
            return Err(format!("no kernel registered for {}", path.display()));
        }

        Ok(Linked {
            inputs,
            captures,
            kernel,
        })
    }

    fn plan(&self, count: u32) -> DeviceResult<PassPlan> {
        let state = self.state.read();
        let program = state
            .capture
            .ok_or(DeviceError::CaptureState("draw outside a capture block"))?;
        let linked = state
            .programs
            .get(&program)
            .and_then(|slot| slot.linked.as_ref())
            .ok_or(DeviceError::UnknownProgram(program))?;
        let kernel = linked
            .kernel
            .clone()
            .ok_or(DeviceError::CaptureState("program has no capture kernel"))?;

        let points = count as usize;
        let mut columns = Vec::with_capacity(linked.inputs.len());
        for (_, location, _) in &linked.inputs {
            let column = match state.vertex_inputs.get(location) {
                Some(&(buffer, components)) => {
                    let floats = state
                        .storage(buffer)?
                        .chunks_exact(FLOAT_BYTES)
                        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                        .collect();
                    Some((floats, components as usize))
                }
                None => None,
            };
            columns.push(column);
        }

        let mut targets = Vec::with_capacity(linked.captures.len());
        for (index, (name, components)) in linked.captures.iter().enumerate() {
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            let buffer = *state
                .capture_targets
                .get(&index)
                .ok_or(DeviceError::CaptureState("capture target not bound"))?;
            let capacity = state.storage(buffer)?.len();
            let required = points * *components as usize * FLOAT_BYTES;
            if capacity < required {
                tracing::debug!(target: LOG_TARGET, "capture of '{}' overflows {}", name, buffer);
                return Err(DeviceError::OutOfRange {
                    buffer,
                    capacity,
                    required,
                });
            }
            targets.push(buffer);
        }

        let (input_slots, input_width) =
            kernel::layout(linked.inputs.iter().map(|(n, _, c)| (n.as_str(), *c as usize)));
        let (output_slots, output_width) =
            kernel::layout(linked.captures.iter().map(|(n, c)| (n.as_str(), *c as usize)));

        Ok(PassPlan {
            kernel,
            input_slots,
            input_width,
            columns,
            output_slots,
            output_width,
            targets,
        })
    }
}

/// Runs the kernel over `count` points and returns one float vector per capture.
fn execute(plan: &PassPlan, count: u32) -> Vec<Vec<f32>> {
    let mut captured: Vec<Vec<f32>> = plan
        .output_slots
        .iter()
        .map(|slot| Vec::with_capacity(count as usize * slot.components))
        .collect();
    let mut inputs = vec![0.0f32; plan.input_width];
    let mut outputs = vec![0.0f32; plan.output_width];

    for index in 0..count {
        let point = index as usize;
        for (slot, column) in plan.input_slots.iter().zip(&plan.columns) {
            let dst = &mut inputs[slot.offset..slot.offset + slot.components];
            dst.copy_from_slice(&DEFAULT_INPUT[..slot.components]);
            if let Some((floats, stride)) = column {
                let start = point * stride;
                if let Some(element) = floats.get(start..start + stride) {
                    let n = slot.components.min(*stride);
                    dst[..n].copy_from_slice(&element[..n]);
                }
            }
        }
        outputs.fill(0.0);

        let input = PointInput {
            index,
            slots: &plan.input_slots,
            values: &inputs,
        };
        let mut output = PointOutput {
            slots: &plan.output_slots,
            values: &mut outputs,
        };
        (plan.kernel)(&input, &mut output);

        for (slot, dst) in plan.output_slots.iter().zip(captured.iter_mut()) {
            dst.extend_from_slice(&outputs[slot.offset..slot.offset + slot.components]);
        }
    }
    captured
}

impl GpuDevice for HeadlessDevice {
    fn create_buffer(&self, label: &str) -> BufferId {
        let mut state = self.state.write();
        let id = BufferId(state.next_id());
        state.buffers.insert(
            id,
            BufferSlot {
                label: label.to_owned(),
                data: None,
            },
        );
        id
    }

    fn is_allocated(&self, buffer: BufferId) -> bool {
        self.state
            .read()
            .buffers
            .get(&buffer)
            .is_some_and(|slot| slot.data.is_some())
    }

    fn buffer_size(&self, buffer: BufferId) -> usize {
        self.state
            .read()
            .buffers
            .get(&buffer)
            .and_then(|slot| slot.data.as_ref())
            .map_or(0, Vec::len)
    }

    fn allocate_buffer(&self, buffer: BufferId, size: usize) -> DeviceResult<()> {
        let mut state = self.state.write();
        let slot = state
            .buffers
            .get_mut(&buffer)
            .ok_or(DeviceError::UnknownBuffer(buffer))?;
        tracing::trace!(target: LOG_TARGET, "allocate {} '{}' ({} bytes)", buffer, slot.label, size);
        slot.data = Some(vec![0; size]);
        Ok(())
    }

    fn write_buffer(&self, buffer: BufferId, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.state.write();
        let storage = state.storage_mut(buffer)?;
        if storage.len() < data.len() {
            return Err(DeviceError::OutOfRange {
                buffer,
                capacity: storage.len(),
                required: data.len(),
            });
        }
        storage[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId) -> DeviceResult<Vec<u8>> {
        self.state.read().storage(buffer).cloned()
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        self.state.write().buffers.remove(&buffer);
    }

    fn create_program(&self, label: &str) -> ProgramId {
        let mut state = self.state.write();
        let id = ProgramId(state.next_id());
        state.programs.insert(
            id,
            ProgramSlot {
                label: label.to_owned(),
                ..ProgramSlot::default()
            },
        );
        id
    }

    fn compile_stage(&self, program: ProgramId, stage: ShaderStage, path: &Path) -> DeviceResult<()> {
        let text = std::fs::read_to_string(path).map_err(|e| DeviceError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let interface = source::scan(&text).map_err(|message| DeviceError::Compile {
            path: path.to_path_buf(),
            message,
        })?;

        let mut state = self.state.write();
        let slot = state
            .programs
            .get_mut(&program)
            .ok_or(DeviceError::UnknownProgram(program))?;
        match stage {
            ShaderStage::Vertex => slot.vertex = Some((path.to_path_buf(), interface)),
            ShaderStage::Fragment => slot.fragment = Some(path.to_path_buf()),
        }
        tracing::trace!(target: LOG_TARGET, "compiled {} stage of {}", stage.name(), program);
        Ok(())
    }

    fn set_feedback_varyings(&self, program: ProgramId, varyings: &[String]) -> DeviceResult<()> {
        let mut state = self.state.write();
        let slot = state
            .programs
            .get_mut(&program)
            .ok_or(DeviceError::UnknownProgram(program))?;
        slot.varyings = varyings.to_vec();
        Ok(())
    }

    fn link_program(&self, program: ProgramId) -> DeviceResult<()> {
        let mut state = self.state.write();
        let State {
            programs, kernels, ..
        } = &mut *state;
        let slot = programs
            .get_mut(&program)
            .ok_or(DeviceError::UnknownProgram(program))?;
        slot.linked = None;
        let linked = Self::link(slot, kernels).map_err(DeviceError::Link)?;
        tracing::trace!(
            target: LOG_TARGET,
            "linked {} ({} inputs, {} captures, fragment stage: {})",
            program,
            linked.inputs.len(),
            linked.captures.len(),
            slot.fragment.is_some()
        );
        slot.linked = Some(linked);
        Ok(())
    }

    fn is_linked(&self, program: ProgramId) -> bool {
        self.state
            .read()
            .programs
            .get(&program)
            .is_some_and(|slot| slot.linked.is_some())
    }

    fn attribute_location(&self, program: ProgramId, name: &str) -> Option<u32> {
        let state = self.state.read();
        let linked = state.programs.get(&program)?.linked.as_ref()?;
        linked
            .inputs
            .iter()
            .find(|(input, _, _)| input == name)
            .map(|&(_, location, _)| location)
    }

    fn unload_program(&self, program: ProgramId) {
        if let Some(slot) = self.state.write().programs.get_mut(&program) {
            let label = std::mem::take(&mut slot.label);
            *slot = ProgramSlot {
                label,
                ..ProgramSlot::default()
            };
        }
    }

    fn destroy_program(&self, program: ProgramId) {
        let mut state = self.state.write();
        state.programs.remove(&program);
        if state.capture == Some(program) {
            state.capture = None;
        }
    }

    fn set_rasterizer_discard(&self, enabled: bool) {
        self.state.write().rasterizer_discard = enabled;
    }

    fn bind_vertex_input(&self, location: u32, buffer: BufferId, components: u32) -> DeviceResult<()> {
        let mut state = self.state.write();
        state.storage(buffer)?;
        state.vertex_inputs.insert(location, (buffer, components));
        Ok(())
    }

    fn unbind_vertex_input(&self, location: u32) {
        self.state.write().vertex_inputs.remove(&location);
    }

    fn bind_capture_target(&self, index: u32, buffer: BufferId) -> DeviceResult<()> {
        let mut state = self.state.write();
        state.storage(buffer)?;
        state.capture_targets.insert(index, buffer);
        Ok(())
    }

    fn begin_capture(&self, program: ProgramId) -> DeviceResult<()> {
        let mut state = self.state.write();
        if state.capture.is_some() {
            return Err(DeviceError::CaptureState("capture block already open"));
        }
        let slot = state
            .programs
            .get(&program)
            .ok_or(DeviceError::UnknownProgram(program))?;
        if slot.linked.is_none() {
            return Err(DeviceError::Link(format!("{program} is not linked")));
        }
        state.capture = Some(program);
        Ok(())
    }

    fn draw_points(&self, count: u32) -> DeviceResult<()> {
        let plan = self.plan(count)?;
        let captured = execute(&plan, count);

        let mut state = self.state.write();
        for (buffer, floats) in plan.targets.iter().zip(&captured) {
            let bytes: &[u8] = bytemuck::cast_slice(floats);
            let storage = state.storage_mut(*buffer)?;
            storage[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }

    fn end_capture(&self) -> DeviceResult<()> {
        let mut state = self.state.write();
        if state.capture.take().is_none() {
            return Err(DeviceError::CaptureState("no capture block open"));
        }
        state.passes += 1;
        Ok(())
    }

    fn create_vertex_binding(&self, _label: &str) -> VertexBindingId {
        let mut state = self.state.write();
        let id = VertexBindingId(state.next_id());
        state.bindings.insert(id, BTreeMap::new());
        id
    }

    fn set_attribute_source(&self, binding: VertexBindingId, source: AttributeSource) -> DeviceResult<()> {
        let mut state = self.state.write();
        if !state.buffers.contains_key(&source.buffer) {
            return Err(DeviceError::UnknownBuffer(source.buffer));
        }
        state
            .bindings
            .get_mut(&binding)
            .ok_or(DeviceError::UnknownBinding(binding))?
            .insert(source.location, source);
        Ok(())
    }

    fn destroy_vertex_binding(&self, binding: VertexBindingId) {
        self.state.write().bindings.remove(&binding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shader(name: &str, text: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("mobius_headless_{}_{name}", std::process::id()));
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_buffer_lifecycle() {
        let device = HeadlessDevice::new();
        let buffer = device.create_buffer("a");
        assert!(!device.is_allocated(buffer));
        assert_eq!(device.write_buffer(buffer, &[1]), Err(DeviceError::NotAllocated(buffer)));

        device.allocate_buffer(buffer, 4).unwrap();
        assert_eq!(device.read_buffer(buffer).unwrap(), [0, 0, 0, 0]);
        assert!(matches!(
            device.write_buffer(buffer, &[0; 8]),
            Err(DeviceError::OutOfRange { capacity: 4, required: 8, .. })
        ));

        device.destroy_buffer(buffer);
        assert_eq!(device.read_buffer(buffer), Err(DeviceError::UnknownBuffer(buffer)));
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_sequential_and_explicit_locations() {
        let path = shader("locations.vert", "layout(location = 0) in float a;\nin vec2 b;\nin vec3 c;\n");
        let device = HeadlessDevice::new();
        let program = device.create_program("render");
        device.compile_stage(program, ShaderStage::Vertex, &path).unwrap();
        device.link_program(program).unwrap();
        assert_eq!(device.attribute_location(program, "a"), Some(0));
        assert_eq!(device.attribute_location(program, "b"), Some(1));
        assert_eq!(device.attribute_location(program, "c"), Some(2));
    }

    #[test]
    fn test_capture_needs_kernel() {
        let path = shader("nokernel.vert", "in float a;\nout float b;\n");
        let device = HeadlessDevice::new();
        let program = device.create_program("feedback");
        device.compile_stage(program, ShaderStage::Vertex, &path).unwrap();
        device.set_feedback_varyings(program, &["b".into()]).unwrap();
        assert!(matches!(device.link_program(program), Err(DeviceError::Link(_))));
        assert!(!device.is_linked(program));
    }

    #[test]
    fn test_unbound_input_reads_default() {
        let path = shader("default.vert", "in vec4 color;\nout vec4 copy;\n");
        let device = HeadlessDevice::new();
        device.register_kernel(&path, |input, output| output.set("copy", input.attribute("color")));
        let program = device.create_program("feedback");
        device.compile_stage(program, ShaderStage::Vertex, &path).unwrap();
        device.set_feedback_varyings(program, &["copy".into()]).unwrap();
        device.link_program(program).unwrap();

        let target = device.create_buffer("copy");
        device.allocate_buffer(target, 16).unwrap();
        device.bind_capture_target(0, target).unwrap();
        device.begin_capture(program).unwrap();
        device.draw_points(1).unwrap();
        device.end_capture().unwrap();

        let floats: Vec<f32> = device
            .read_buffer(target)
            .unwrap()
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(floats, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(device.pass_count(), 1);
    }

    #[test]
    fn test_small_capture_target_rejected() {
        let path = shader("small.vert", "out vec2 v;\n");
        let device = HeadlessDevice::new();
        device.register_kernel(&path, |_, _| {});
        let program = device.create_program("feedback");
        device.compile_stage(program, ShaderStage::Vertex, &path).unwrap();
        device.set_feedback_varyings(program, &["v".into()]).unwrap();
        device.link_program(program).unwrap();

        let target = device.create_buffer("v");
        device.allocate_buffer(target, 8).unwrap();
        device.bind_capture_target(0, target).unwrap();
        device.begin_capture(program).unwrap();
        assert!(matches!(
            device.draw_points(2),
            Err(DeviceError::OutOfRange { capacity: 8, required: 16, .. })
        ));
        device.end_capture().unwrap();
    }

    #[test]
    fn test_capture_state_checked() {
        let device = HeadlessDevice::new();
        assert!(matches!(device.draw_points(1), Err(DeviceError::CaptureState(_))));
        assert!(matches!(device.end_capture(), Err(DeviceError::CaptureState(_))));
    }

    #[test]
    fn test_attribute_source_replaced() {
        let device = HeadlessDevice::new();
        let binding = device.create_vertex_binding("vao");
        let a = device.create_buffer("a");
        let b = device.create_buffer("b");
        let source = AttributeSource {
            location: 2,
            buffer: a,
            components: 3,
            divisor: 1,
        };
        device.set_attribute_source(binding, source).unwrap();
        device
            .set_attribute_source(binding, AttributeSource { buffer: b, ..source })
            .unwrap();
        assert_eq!(device.vertex_binding_source(binding, 2).unwrap().buffer, b);
        assert!(device.vertex_binding_source(binding, 0).is_none());
    }
}
