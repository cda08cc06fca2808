//! # wgpu Device
//!
//! Maps the device contract onto wgpu. There is no transform feedback in wgpu, so a
//! feedback program is a WGSL compute shader: stream inputs are read-only storage
//! buffers in group 0 (binding = input location) and captures are read-write storage
//! buffers in group 1. A capture block becomes one compute dispatch.
//!
//! ## Buffer Usage
//!
//! Every buffer is `STORAGE | VERTEX | COPY_SRC | COPY_DST`, so the same buffer a pass
//! writes can be bound as a vertex buffer by a render pipeline without a copy.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use mobius_core::{
    AttributeSource, BufferId, DeviceError, DeviceResult, GpuDevice, ProgramId, ShaderStage,
    VertexBindingId, LOG_TARGET,
};
use parking_lot::Mutex;

use super::wgsl::{self, WgslInterface};

const BUFFER_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::VERTEX)
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

/// Rounds `size` up to wgpu's copy alignment, never below one word.
fn aligned(size: usize) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
    (size.max(1).div_ceil(align) * align) as u64
}

fn bind_entries(buffers: &[(u32, Arc<wgpu::Buffer>)]) -> Vec<wgpu::BindGroupEntry<'_>> {
    buffers
        .iter()
        .map(|(binding, buffer)| wgpu::BindGroupEntry {
            binding: *binding,
            resource: buffer.as_entire_binding(),
        })
        .collect()
}

struct GpuBuffer {
    label: String,
    /// Requested size; the wgpu buffer may be padded.
    size: usize,
    buffer: Option<Arc<wgpu::Buffer>>,
}

struct CompiledStage {
    path: PathBuf,
    module: wgpu::ShaderModule,
    interface: WgslInterface,
}

struct ComputeKernel {
    pipeline: wgpu::ComputePipeline,
    input_layout: wgpu::BindGroupLayout,
    capture_layout: wgpu::BindGroupLayout,
    /// `(name, binding)` of every group-0 input.
    inputs: Vec<(String, u32)>,
    /// Group-1 binding of each capture index.
    capture_bindings: Vec<u32>,
    workgroup_size: u32,
}

struct LinkedProgram {
    attributes: HashMap<String, u32>,
    kernel: Option<ComputeKernel>,
}

#[derive(Default)]
struct GpuProgram {
    label: String,
    vertex: Option<CompiledStage>,
    fragment: Option<CompiledStage>,
    varyings: Vec<String>,
    linked: Option<LinkedProgram>,
}

struct OpenCapture {
    program: ProgramId,
    points: Option<u32>,
}

#[derive(Default)]
struct State {
    next_id: u32,
    buffers: HashMap<BufferId, GpuBuffer>,
    programs: HashMap<ProgramId, GpuProgram>,
    bindings: HashMap<VertexBindingId, BTreeMap<u32, AttributeSource>>,
    vertex_inputs: BTreeMap<u32, (BufferId, u32)>,
    capture_targets: BTreeMap<u32, BufferId>,
    capture: Option<OpenCapture>,
    rasterizer_discard: bool,
}

impl State {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn storage(&self, buffer: BufferId) -> DeviceResult<(&Arc<wgpu::Buffer>, usize)> {
        let slot = self
            .buffers
            .get(&buffer)
            .ok_or(DeviceError::UnknownBuffer(buffer))?;
        let storage = slot.buffer.as_ref().ok_or(DeviceError::NotAllocated(buffer))?;
        Ok((storage, slot.size))
    }
}

struct Inner {
    device: wgpu::Device,
    queue: wgpu::Queue,
    state: Mutex<State>,
}

/// A stream buffer wired into a vertex binding, ready for a render pipeline.
#[derive(Debug, Clone)]
pub struct BoundVertexSource {
    /// What was attached.
    pub source: AttributeSource,
    /// The buffer to pass to `set_vertex_buffer`.
    pub buffer: Arc<wgpu::Buffer>,
    /// Per instance when the divisor is non-zero.
    pub step_mode: wgpu::VertexStepMode,
}

impl BoundVertexSource {
    /// Vertex format of one element.
    #[must_use]
    pub fn format(&self) -> wgpu::VertexFormat {
        match self.source.components {
            1 => wgpu::VertexFormat::Float32,
            2 => wgpu::VertexFormat::Float32x2,
            3 => wgpu::VertexFormat::Float32x3,
            _ => wgpu::VertexFormat::Float32x4,
        }
    }

    /// Byte stride of one element.
    #[must_use]
    pub fn stride(&self) -> u64 {
        self.format().size()
    }
}

/// wgpu back-end. Cloning is cheap; clones share one device and queue.
#[derive(Clone)]
pub struct WgpuDevice {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WgpuDevice")
            .field("buffers", &state.buffers.len())
            .field("programs", &state.programs.len())
            .finish_non_exhaustive()
    }
}

impl WgpuDevice {
    /// Opens the default adapter with no surface.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Backend`] when no adapter or device is available.
    pub fn new() -> DeviceResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or_else(|| DeviceError::Backend("no compatible adapter".into()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("mobius_feedback"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
            },
            None,
        ))
        .map_err(|e| DeviceError::Backend(e.to_string()))?;

        tracing::info!(target: LOG_TARGET, "using adapter {}", adapter.get_info().name);
        Ok(Self::from_parts(device, queue))
    }

    /// Wraps a device and queue the host already owns.
    #[must_use]
    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            inner: Arc::new(Inner {
                device,
                queue,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// The wrapped device.
    #[must_use]
    pub fn wgpu_device(&self) -> &wgpu::Device {
        &self.inner.device
    }

    /// The wrapped queue.
    #[must_use]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.inner.queue
    }

    /// The wgpu buffer behind `buffer`, once allocated.
    #[must_use]
    pub fn wgpu_buffer(&self, buffer: BufferId) -> Option<Arc<wgpu::Buffer>> {
        self.inner
            .state
            .lock()
            .buffers
            .get(&buffer)
            .and_then(|slot| slot.buffer.clone())
    }

    /// Whether rasterization is currently suspended. Compute passes ignore it.
    #[must_use]
    pub fn rasterizer_discard(&self) -> bool {
        self.inner.state.lock().rasterizer_discard
    }

    /// Sources attached to `binding`, ordered by location.
    #[must_use]
    pub fn vertex_sources(&self, binding: VertexBindingId) -> Vec<BoundVertexSource> {
        let state = self.inner.state.lock();
        let Some(sources) = state.bindings.get(&binding) else {
            return Vec::new();
        };
        sources
            .values()
            .filter_map(|source| {
                let buffer = state.buffers.get(&source.buffer)?.buffer.clone()?;
                Some(BoundVertexSource {
                    source: *source,
                    buffer,
                    step_mode: if source.divisor > 0 {
                        wgpu::VertexStepMode::Instance
                    } else {
                        wgpu::VertexStepMode::Vertex
                    },
                })
            })
            .collect()
    }

    fn scoped<T>(&self, f: impl FnOnce() -> T) -> Result<T, String> {
        self.inner.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        match pollster::block_on(self.inner.device.pop_error_scope()) {
            Some(error) => Err(error.to_string()),
            None => Ok(value),
        }
    }

    fn storage_layout(&self, label: &str, bindings: &[u32], read_only: bool) -> wgpu::BindGroupLayout {
        let entries: Vec<_> = bindings
            .iter()
            .map(|&binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        self.inner
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &entries,
            })
    }

    fn link(&self, program: &GpuProgram) -> Result<LinkedProgram, String> {
        let Some(stage) = program.vertex.as_ref() else {
            return Err(format!("'{}' has no compiled stage", program.label));
        };
        let interface = &stage.interface;

        if !interface.is_compute {
            if !program.varyings.is_empty() {
                return Err(format!("{} has no @compute entry point to capture from", stage.path.display()));
            }
            return Ok(LinkedProgram {
                attributes: interface.vertex_inputs.iter().cloned().collect(),
                kernel: None,
            });
        }

        let inputs: Vec<(String, u32)> = interface
            .group(0)
            .map(|var| (var.name.clone(), var.binding))
            .collect();
        let mut capture_bindings = Vec::with_capacity(program.varyings.len());
        for varying in &program.varyings {
            let var = interface
                .storage_var(varying)
                .filter(|var| var.group == 1 && !var.read_only)
                .ok_or_else(|| format!("feedback varying '{varying}' is not a read_write storage buffer in group 1"))?;
            capture_bindings.push(var.binding);
        }

        let input_bindings: Vec<u32> = inputs.iter().map(|(_, binding)| *binding).collect();
        let capture_all: Vec<u32> = interface.group(1).map(|var| var.binding).collect();

        let kernel = self.scoped(|| {
            let input_layout = self.storage_layout("feedback inputs", &input_bindings, true);
            let capture_layout = self.storage_layout("feedback captures", &capture_all, false);
            let layout = self
                .inner
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(program.label.as_str()),
                    bind_group_layouts: &[&input_layout, &capture_layout],
                    push_constant_ranges: &[],
                });
            let pipeline = self
                .inner
                .device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(program.label.as_str()),
                    layout: Some(&layout),
                    module: &stage.module,
                    entry_point: "main",
                });
            ComputeKernel {
                pipeline,
                input_layout,
                capture_layout,
                inputs: inputs.clone(),
                capture_bindings,
                workgroup_size: interface.workgroup_size.max(1),
            }
        })?;

        Ok(LinkedProgram {
            attributes: inputs.into_iter().collect(),
            kernel: Some(kernel),
        })
    }

    /// Records and submits the dispatch for the closed capture block.
    fn dispatch(&self, state: &State, capture: &OpenCapture) -> DeviceResult<()> {
        let Some(points) = capture.points else {
            return Ok(());
        };
        let kernel = state
            .programs
            .get(&capture.program)
            .and_then(|program| program.linked.as_ref())
            .and_then(|linked| linked.kernel.as_ref())
            .ok_or(DeviceError::CaptureState("program has no compute kernel"))?;

        let device = &self.inner.device;
        let mut placeholders = Vec::new();
        let mut input_buffers = Vec::with_capacity(kernel.inputs.len());
        for (name, binding) in &kernel.inputs {
            match state.vertex_inputs.get(binding) {
                Some(&(buffer, _)) => input_buffers.push((*binding, Arc::clone(state.storage(buffer)?.0))),
                None => {
                    tracing::trace!(target: LOG_TARGET, "input '{}' unbound, reading zeros", name);
                    let zeros = Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some(name.as_str()),
                        size: aligned(points as usize * 16),
                        usage: BUFFER_USAGE,
                        mapped_at_creation: false,
                    }));
                    placeholders.push(Arc::clone(&zeros));
                    input_buffers.push((*binding, zeros));
                }
            }
        }
        let mut capture_buffers = Vec::with_capacity(kernel.capture_bindings.len());
        for (index, binding) in kernel.capture_bindings.iter().enumerate() {
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            let buffer = state
                .capture_targets
                .get(&index)
                .ok_or(DeviceError::CaptureState("capture target not bound"))?;
            capture_buffers.push((*binding, Arc::clone(state.storage(*buffer)?.0)));
        }

        self.scoped(|| {
            let inputs = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("feedback inputs"),
                layout: &kernel.input_layout,
                entries: &bind_entries(&input_buffers),
            });
            let captures = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("feedback captures"),
                layout: &kernel.capture_layout,
                entries: &bind_entries(&capture_buffers),
            });

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("feedback pass"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("feedback pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&kernel.pipeline);
                pass.set_bind_group(0, &inputs, &[]);
                pass.set_bind_group(1, &captures, &[]);
                pass.dispatch_workgroups(points.div_ceil(kernel.workgroup_size), 1, 1);
            }
            self.inner.queue.submit(Some(encoder.finish()));
        })
        .map_err(DeviceError::Backend)?;

        for placeholder in placeholders {
            placeholder.destroy();
        }
        Ok(())
    }
}

impl GpuDevice for WgpuDevice {
    fn create_buffer(&self, label: &str) -> BufferId {
        let mut state = self.inner.state.lock();
        let id = BufferId(state.next_id());
        state.buffers.insert(
            id,
            GpuBuffer {
                label: label.to_owned(),
                size: 0,
                buffer: None,
            },
        );
        id
    }

    fn is_allocated(&self, buffer: BufferId) -> bool {
        self.inner
            .state
            .lock()
            .buffers
            .get(&buffer)
            .is_some_and(|slot| slot.buffer.is_some())
    }

    fn buffer_size(&self, buffer: BufferId) -> usize {
        self.inner
            .state
            .lock()
            .buffers
            .get(&buffer)
            .filter(|slot| slot.buffer.is_some())
            .map_or(0, |slot| slot.size)
    }

    fn allocate_buffer(&self, buffer: BufferId, size: usize) -> DeviceResult<()> {
        let mut state = self.inner.state.lock();
        let slot = state
            .buffers
            .get_mut(&buffer)
            .ok_or(DeviceError::UnknownBuffer(buffer))?;
        let storage = self.inner.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(slot.label.as_str()),
            size: aligned(size),
            usage: BUFFER_USAGE,
            mapped_at_creation: false,
        });
        if let Some(old) = slot.buffer.replace(Arc::new(storage)) {
            old.destroy();
        }
        slot.size = size;
        Ok(())
    }

    fn write_buffer(&self, buffer: BufferId, data: &[u8]) -> DeviceResult<()> {
        let state = self.inner.state.lock();
        let (storage, capacity) = state.storage(buffer)?;
        if data.len() > capacity {
            return Err(DeviceError::OutOfRange {
                buffer,
                capacity,
                required: data.len(),
            });
        }
        if data.len() % wgpu::COPY_BUFFER_ALIGNMENT as usize == 0 {
            self.inner.queue.write_buffer(storage, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(aligned(data.len()) as usize, 0);
            self.inner.queue.write_buffer(storage, 0, &padded);
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId) -> DeviceResult<Vec<u8>> {
        let (storage, size) = {
            let state = self.inner.state.lock();
            let (storage, size) = state.storage(buffer)?;
            (Arc::clone(storage), size)
        };
        let device = &self.inner.device;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: storage.size(),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
        encoder.copy_buffer_to_buffer(&storage, 0, &staging, 0, storage.size());
        self.inner.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| DeviceError::Map(e.to_string()))?
            .map_err(|e| DeviceError::Map(e.to_string()))?;

        let bytes = slice.get_mapped_range()[..size].to_vec();
        staging.unmap();
        staging.destroy();
        Ok(bytes)
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let removed = self.inner.state.lock().buffers.remove(&buffer);
        if let Some(storage) = removed.and_then(|slot| slot.buffer) {
            storage.destroy();
        }
    }

    fn create_program(&self, label: &str) -> ProgramId {
        let mut state = self.inner.state.lock();
        let id = ProgramId(state.next_id());
        state.programs.insert(
            id,
            GpuProgram {
                label: label.to_owned(),
                ..GpuProgram::default()
            },
        );
        id
    }

    fn compile_stage(&self, program: ProgramId, stage: ShaderStage, path: &Path) -> DeviceResult<()> {
        let text = std::fs::read_to_string(path).map_err(|e| DeviceError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let compile_error = |message| DeviceError::Compile {
            path: path.to_path_buf(),
            message,
        };
        let interface = wgsl::scan(&text).map_err(compile_error)?;
        let module = self
            .scoped(|| {
                self.inner
                    .device
                    .create_shader_module(wgpu::ShaderModuleDescriptor {
                        label: path.to_str(),
                        source: wgpu::ShaderSource::Wgsl(Cow::Owned(text)),
                    })
            })
            .map_err(compile_error)?;

        let mut state = self.inner.state.lock();
        let slot = state
            .programs
            .get_mut(&program)
            .ok_or(DeviceError::UnknownProgram(program))?;
        let compiled = Some(CompiledStage {
            path: path.to_path_buf(),
            module,
            interface,
        });
        match stage {
            ShaderStage::Vertex => slot.vertex = compiled,
            ShaderStage::Fragment => slot.fragment = compiled,
        }
        Ok(())
    }

    fn set_feedback_varyings(&self, program: ProgramId, varyings: &[String]) -> DeviceResult<()> {
        let mut state = self.inner.state.lock();
        let slot = state
            .programs
            .get_mut(&program)
            .ok_or(DeviceError::UnknownProgram(program))?;
        slot.varyings = varyings.to_vec();
        Ok(())
    }

    fn link_program(&self, program: ProgramId) -> DeviceResult<()> {
        let mut state = self.inner.state.lock();
        let slot = state
            .programs
            .get_mut(&program)
            .ok_or(DeviceError::UnknownProgram(program))?;
        slot.linked = None;
        let linked = self.link(slot).map_err(DeviceError::Link)?;
        tracing::trace!(
            target: LOG_TARGET,
            "linked {} ({} attributes, fragment stage: {})",
            program,
            linked.attributes.len(),
            slot.fragment.is_some()
        );
        slot.linked = Some(linked);
        Ok(())
    }

    fn is_linked(&self, program: ProgramId) -> bool {
        self.inner
            .state
            .lock()
            .programs
            .get(&program)
            .is_some_and(|slot| slot.linked.is_some())
    }

    fn attribute_location(&self, program: ProgramId, name: &str) -> Option<u32> {
        let state = self.inner.state.lock();
        state
            .programs
            .get(&program)?
            .linked
            .as_ref()?
            .attributes
            .get(name)
            .copied()
    }

    fn unload_program(&self, program: ProgramId) {
        if let Some(slot) = self.inner.state.lock().programs.get_mut(&program) {
            let label = std::mem::take(&mut slot.label);
            *slot = GpuProgram {
                label,
                ..GpuProgram::default()
            };
        }
    }

    fn destroy_program(&self, program: ProgramId) {
        let mut state = self.inner.state.lock();
        state.programs.remove(&program);
        if state.capture.as_ref().is_some_and(|c| c.program == program) {
            state.capture = None;
        }
    }

    fn set_rasterizer_discard(&self, enabled: bool) {
        self.inner.state.lock().rasterizer_discard = enabled;
    }

    fn bind_vertex_input(&self, location: u32, buffer: BufferId, components: u32) -> DeviceResult<()> {
        let mut state = self.inner.state.lock();
        state.storage(buffer)?;
        state.vertex_inputs.insert(location, (buffer, components));
        Ok(())
    }

    fn unbind_vertex_input(&self, location: u32) {
        self.inner.state.lock().vertex_inputs.remove(&location);
    }

    fn bind_capture_target(&self, index: u32, buffer: BufferId) -> DeviceResult<()> {
        let mut state = self.inner.state.lock();
        state.storage(buffer)?;
        state.capture_targets.insert(index, buffer);
        Ok(())
    }

    fn begin_capture(&self, program: ProgramId) -> DeviceResult<()> {
        let mut state = self.inner.state.lock();
        if state.capture.is_some() {
            return Err(DeviceError::CaptureState("capture block already open"));
        }
        let linked = state
            .programs
            .get(&program)
            .ok_or(DeviceError::UnknownProgram(program))?
            .linked
            .as_ref();
        if !linked.is_some_and(|linked| linked.kernel.is_some()) {
            return Err(DeviceError::Link(format!("{program} is not a linked compute program")));
        }
        state.capture = Some(OpenCapture {
            program,
            points: None,
        });
        Ok(())
    }

    fn draw_points(&self, count: u32) -> DeviceResult<()> {
        let mut state = self.inner.state.lock();
        let capture = state
            .capture
            .as_mut()
            .ok_or(DeviceError::CaptureState("draw outside a capture block"))?;
        if capture.points.is_some() {
            return Err(DeviceError::CaptureState("one draw per capture block"));
        }
        capture.points = Some(count);
        Ok(())
    }

    fn end_capture(&self) -> DeviceResult<()> {
        let mut state = self.inner.state.lock();
        let capture = state
            .capture
            .take()
            .ok_or(DeviceError::CaptureState("no capture block open"))?;
        self.dispatch(&state, &capture)
    }

    fn create_vertex_binding(&self, _label: &str) -> VertexBindingId {
        let mut state = self.inner.state.lock();
        let id = VertexBindingId(state.next_id());
        state.bindings.insert(id, BTreeMap::new());
        id
    }

    fn set_attribute_source(&self, binding: VertexBindingId, source: AttributeSource) -> DeviceResult<()> {
        let mut state = self.inner.state.lock();
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
        self.inner.state.lock().bindings.remove(&binding);
    }
}
