//! Feedback program: one vertex-stage source linked with its capture outputs declared as
//! feedback varyings.

use std::path::{Path, PathBuf};

use mobius_core::{DeviceResult, GpuDevice, ProgramId, ShaderStage, LOG_TARGET};

/// A program linked for feedback capture instead of rasterization.
#[derive(Debug)]
pub struct FeedbackProgram {
    id: ProgramId,
    source: PathBuf,
    varyings: Vec<String>,
    loaded: bool,
}

impl FeedbackProgram {
    /// Creates the program object. Nothing is compiled until [`build`](Self::build).
    #[must_use]
    pub fn create<D: GpuDevice>(device: &D, source: PathBuf, varyings: Vec<String>) -> Self {
        Self {
            id: device.create_program("feedback"),
            source,
            varyings,
            loaded: false,
        }
    }

    /// Compiles the source, declares the varyings in order and links.
    ///
    /// Failure is logged and leaves the program not-loaded; it never panics.
    pub fn build<D: GpuDevice>(&mut self, device: &D) -> bool {
        self.loaded = match self.link(device) {
            Ok(()) => device.is_linked(self.id),
            Err(err) => {
                tracing::error!(
                    target: LOG_TARGET,
                    "{} from {}: {}",
                    self.id,
                    self.source.display(),
                    err
                );
                false
            }
        };
        self.loaded
    }

    /// Drops the compiled stages and builds again from the stored source and varyings.
    pub fn rebuild<D: GpuDevice>(&mut self, device: &D) -> bool {
        device.unload_program(self.id);
        self.loaded = false;
        self.build(device)
    }

    /// Device handle of the program.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ProgramId {
        self.id
    }

    /// Vertex-stage source path.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Captured output names, in capture-index order.
    #[must_use]
    pub fn varyings(&self) -> &[String] {
        &self.varyings
    }

    /// Whether the last build linked.
    #[inline]
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Input location the program assigns to `name`.
    #[must_use]
    pub fn input_location<D: GpuDevice>(&self, device: &D, name: &str) -> Option<u32> {
        device.attribute_location(self.id, name)
    }

    /// Releases the program object.
    pub fn destroy<D: GpuDevice>(&mut self, device: &D) {
        device.destroy_program(self.id);
        self.loaded = false;
    }

    fn link<D: GpuDevice>(&self, device: &D) -> DeviceResult<()> {
        device.compile_stage(self.id, ShaderStage::Vertex, &self.source)?;
        if !self.varyings.is_empty() {
            device.set_feedback_varyings(self.id, &self.varyings)?;
        }
        device.link_program(self.id)
    }
}
