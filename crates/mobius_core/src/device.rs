//! # GPU Device Contract
//!
//! The capability the feedback layer consumes. Shader loading, program linking and the
//! actual command stream all live behind this trait.
//!
//! ## Handle Model
//!
//! Devices hand out plain `Copy` ids. A device handle is cheap to clone and every clone
//! talks to the same context, so the host can keep one clone for its own render
//! programs while a `FeedbackShader` owns another.
//!
//! ## Capture Pass Shape
//!
//! ```text
//! set_rasterizer_discard(true)
//!   bind_vertex_input(loc, current, n)   ─┐
//!   bind_capture_target(i, next)          ├─ per stream
//!   begin_capture(program)               ─┘
//!   draw_points(count)
//!   end_capture()
//!   unbind_vertex_input(loc)
//! set_rasterizer_discard(false)
//! ```

use std::fmt;
use std::path::Path;

use crate::error::DeviceResult;

/// Handle to a GPU buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// Handle to a GPU program object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u32);

/// Handle to a vertex binding (the geometry state of a third-party draw call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexBindingId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "program#{}", self.0)
    }
}

impl fmt::Display for VertexBindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding#{}", self.0)
    }
}

/// Programmable pipeline stage a source file is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Per-element processing stage. The only stage a feedback program uses.
    Vertex,
    /// Per-fragment stage, used by render programs that consume attached streams.
    Fragment,
}

impl ShaderStage {
    /// Human-readable stage name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Fragment => "fragment",
        }
    }
}

/// A buffer wired as the attribute source of a vertex binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSource {
    /// Attribute location in the consuming program.
    pub location: u32,
    /// Buffer holding tightly packed 32-bit floats.
    pub buffer: BufferId,
    /// Floats per element (1-4).
    pub components: u32,
    /// Instancing divisor. Zero steps per vertex, N steps once every N instances.
    pub divisor: u32,
}

/// The generic shader/program and buffer capability.
///
/// Every method takes `&self`; implementations synchronize internally and must be
/// driven from the thread that owns the GPU context.
pub trait GpuDevice: Clone {
    // ---------------------------------------------------------------- buffers

    /// Creates an unallocated buffer object.
    fn create_buffer(&self, label: &str) -> BufferId;

    /// Returns whether storage has been allocated for `buffer`.
    fn is_allocated(&self, buffer: BufferId) -> bool;

    /// Returns the allocated size in bytes, or zero when unallocated or unknown.
    fn buffer_size(&self, buffer: BufferId) -> usize;

    /// Allocates zero-initialized storage of `size` bytes.
    ///
    /// # Errors
    ///
    /// Fails when the buffer is unknown.
    fn allocate_buffer(&self, buffer: BufferId, size: usize) -> DeviceResult<()>;

    /// Uploads `data` at offset zero as a static (non-streaming) write.
    ///
    /// # Errors
    ///
    /// Fails when the buffer is unknown, unallocated, or too small.
    fn write_buffer(&self, buffer: BufferId, data: &[u8]) -> DeviceResult<()>;

    /// Maps the whole buffer for reading, copies it out and unmaps it.
    ///
    /// # Errors
    ///
    /// Fails when the buffer is unknown or unallocated, or the map fails.
    fn read_buffer(&self, buffer: BufferId) -> DeviceResult<Vec<u8>>;

    /// Releases the buffer and its storage. Unknown ids are ignored.
    fn destroy_buffer(&self, buffer: BufferId);

    // --------------------------------------------------------------- programs

    /// Creates an empty program object.
    fn create_program(&self, label: &str) -> ProgramId;

    /// Loads `path` and compiles it as `stage` of `program`.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or does not compile.
    fn compile_stage(&self, program: ProgramId, stage: ShaderStage, path: &Path) -> DeviceResult<()>;

    /// Declares the outputs to capture, in capture-index order (separate attributes).
    ///
    /// # Errors
    ///
    /// Fails when the program is unknown.
    fn set_feedback_varyings(&self, program: ProgramId, varyings: &[String]) -> DeviceResult<()>;

    /// Links the compiled stages.
    ///
    /// # Errors
    ///
    /// Fails with [`DeviceError::Link`](crate::DeviceError::Link) on link failure.
    fn link_program(&self, program: ProgramId) -> DeviceResult<()>;

    /// Returns whether the program is linked and usable.
    fn is_linked(&self, program: ProgramId) -> bool;

    /// Returns the input slot the linked program assigns to `name`.
    fn attribute_location(&self, program: ProgramId, name: &str) -> Option<u32>;

    /// Drops compiled stages and link state but keeps the program id.
    fn unload_program(&self, program: ProgramId);

    /// Releases the program entirely. Unknown ids are ignored.
    fn destroy_program(&self, program: ProgramId);

    // ----------------------------------------------------------- capture pass

    /// Suspends (`true`) or restores (`false`) rasterization.
    fn set_rasterizer_discard(&self, enabled: bool);

    /// Sources vertex input `location` from `buffer`, `components` floats per element.
    ///
    /// # Errors
    ///
    /// Fails when the buffer is unknown or unallocated.
    fn bind_vertex_input(&self, location: u32, buffer: BufferId, components: u32) -> DeviceResult<()>;

    /// Disables vertex input `location`.
    fn unbind_vertex_input(&self, location: u32);

    /// Binds `buffer` as capture target `index`.
    ///
    /// # Errors
    ///
    /// Fails when the buffer is unknown or unallocated.
    fn bind_capture_target(&self, index: u32, buffer: BufferId) -> DeviceResult<()>;

    /// Opens a point-topology capture block with `program` active.
    ///
    /// # Errors
    ///
    /// Fails when the program is not linked or a block is already open.
    fn begin_capture(&self, program: ProgramId) -> DeviceResult<()>;

    /// Draws `count` points inside the open capture block.
    ///
    /// # Errors
    ///
    /// Fails when no block is open or a capture target is too small.
    fn draw_points(&self, count: u32) -> DeviceResult<()>;

    /// Closes the capture block.
    ///
    /// # Errors
    ///
    /// Fails when no block is open or the pass cannot be executed.
    fn end_capture(&self) -> DeviceResult<()>;

    // ------------------------------------------------------- external binding

    /// Creates an empty vertex binding for a third-party draw call.
    fn create_vertex_binding(&self, label: &str) -> VertexBindingId;

    /// Wires `source` into `binding`, replacing any previous source at that location.
    ///
    /// # Errors
    ///
    /// Fails when the binding or buffer is unknown.
    fn set_attribute_source(&self, binding: VertexBindingId, source: AttributeSource) -> DeviceResult<()>;

    /// Releases the vertex binding. Unknown ids are ignored.
    fn destroy_vertex_binding(&self, binding: VertexBindingId);
}
