//! # Feedback Shader
//!
//! The facade a host talks to: setup, reload, step, attach and stream data I/O.
//!
//! ## State Machine
//!
//! ```text
//!                setup / reload
//!  Uninitialized ──────────────▶ Linked   (is_loaded() == true)
//!                        └─────▶ Unlinked (is_loaded() == false, step() refused)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut shader = FeedbackShader::new(device.clone());
//! shader.setup("shaders/drift.vert", streams, 4096);
//! shader.set_initial_data("position", &seed)?;
//!
//! loop {
//!     shader.step()?;
//!     shader.attach("position", &AttachTarget::new(render, vao, "instance_pos").with_divisor(1))?;
//!     // host draws...
//! }
//! ```

use std::path::{Path, PathBuf};

use bytemuck::Pod;
use mobius_core::{
    AttributeSource, BufferId, FeedbackConfig, FeedbackError, FeedbackResult, GpuDevice,
    MissingInputPolicy, ProgramId, RoleIndex, StreamDescriptor, LOG_TARGET,
};

use crate::binder::{self, AttachTarget};
use crate::driver::{FeedbackDriver, StepReport};
use crate::program::FeedbackProgram;
use crate::registry::AttributeRegistry;

/// Double-buffered simulation state updated by feedback-capture passes.
///
/// Owns every buffer it allocates; dropping it destroys them.
pub struct FeedbackShader<D: GpuDevice> {
    device: D,
    program: Option<FeedbackProgram>,
    registry: AttributeRegistry,
    driver: FeedbackDriver,
}

impl<D: GpuDevice> FeedbackShader<D> {
    /// Creates an uninitialized shader on `device`.
    #[must_use]
    pub fn new(device: D) -> Self {
        Self {
            device,
            program: None,
            registry: AttributeRegistry::default(),
            driver: FeedbackDriver::new(MissingInputPolicy::default()),
        }
    }

    /// Validates `config` and runs [`setup`](Self::setup) from it.
    ///
    /// A link failure is not an error here; check [`is_loaded`](Self::is_loaded).
    ///
    /// # Errors
    ///
    /// [`FeedbackError::Config`] when the config breaks a setup invariant.
    pub fn from_config(device: D, config: &FeedbackConfig) -> FeedbackResult<Self> {
        config.validate().map_err(FeedbackError::logged)?;
        let mut shader = Self::new(device);
        shader.driver.set_policy(config.missing_input);
        shader.setup(
            config.vertex_source.clone(),
            config.streams.clone(),
            config.particle_count,
        );
        Ok(shader)
    }

    /// Compiles `source`, declares every stream's capture output as a feedback varying
    /// (in the given order), links, and allocates all buffer pairs. Returns whether the
    /// program linked.
    ///
    /// Calling it again releases the previous program and buffers and starts over in
    /// the initial role.
    ///
    /// # Panics
    ///
    /// Panics if `streams` is empty, `count` is zero or beyond `u32::MAX`, a stream has
    /// fewer than 1 or more than 4 components, or two streams share a name.
    pub fn setup(
        &mut self,
        source: impl Into<PathBuf>,
        streams: Vec<StreamDescriptor>,
        count: usize,
    ) -> bool {
        self.release();

        let registry = AttributeRegistry::build(&self.device, &streams, count);
        let varyings = streams.into_iter().map(|s| s.capture).collect();
        let mut program = FeedbackProgram::create(&self.device, source.into(), varyings);
        program.build(&self.device);

        if let Err(err) = registry.allocate(&self.device) {
            tracing::error!(target: LOG_TARGET, "buffer allocation failed: {}", err);
        }

        tracing::info!(
            target: LOG_TARGET,
            "setup {} with {} streams x {} elements: {}",
            program.source().display(),
            registry.len(),
            count,
            if program.is_loaded() { "linked" } else { "not loaded" }
        );

        self.registry = registry;
        self.program = Some(program);
        self.driver = FeedbackDriver::new(self.driver.policy());
        self.is_loaded()
    }

    /// Recompiles and relinks from the stored source and streams, keeping every buffer
    /// and its contents. With `recall_initial`, streams that have initial data are reset
    /// to it; the others are left alone. Returns whether the program linked.
    pub fn reload(&mut self, recall_initial: bool) -> bool {
        let Some(program) = self.program.as_mut() else {
            tracing::warn!(target: LOG_TARGET, "reload before setup ignored");
            return false;
        };
        let loaded = program.rebuild(&self.device);

        if let Err(err) = self.registry.allocate(&self.device) {
            tracing::error!(target: LOG_TARGET, "buffer allocation failed: {}", err);
        }

        if recall_initial {
            match self.registry.recall_all_initial(&self.device) {
                Ok(restored) => {
                    tracing::debug!(target: LOG_TARGET, "recalled initial data for {} streams", restored);
                }
                Err(err) => {
                    tracing::error!(target: LOG_TARGET, "recall after reload failed: {}", err);
                }
            }
        }

        tracing::info!(
            target: LOG_TARGET,
            "reload {}: {}",
            program.source().display(),
            if loaded { "linked" } else { "not loaded" }
        );
        loaded
    }

    /// Runs one capture pass and flips every stream's role.
    ///
    /// # Errors
    ///
    /// See [`FeedbackDriver::step`]. Before setup this is [`FeedbackError::NotLoaded`].
    pub fn step(&mut self) -> FeedbackResult<StepReport> {
        let Some(program) = self.program.as_ref() else {
            return Err(FeedbackError::NotLoaded.logged());
        };
        self.driver.step(&self.device, program, &self.registry)
    }

    /// Binds `source`'s current buffer into another draw call's vertex binding.
    ///
    /// # Errors
    ///
    /// Unknown stream or target attribute; the target binding is left untouched.
    pub fn attach(&self, source: &str, target: &AttachTarget<'_>) -> FeedbackResult<AttributeSource> {
        binder::attach(&self.device, &self.registry, self.driver.role(), source, target)
    }

    /// Buffer currently holding `name`'s state. Valid until the next step.
    ///
    /// # Errors
    ///
    /// [`FeedbackError::UnknownStream`].
    pub fn buffer(&self, name: &str) -> FeedbackResult<BufferId> {
        self.registry.buffer(name, self.driver.role())
    }

    /// Reads `name`'s current state back as `T` elements.
    ///
    /// # Errors
    ///
    /// Unknown name, `size_of::<T>()` not equal to `components × 4`, or a map failure.
    pub fn data<T: Pod>(&self, name: &str) -> FeedbackResult<Vec<T>> {
        self.registry.data(&self.device, self.driver.role(), name)
    }

    /// Reads `name`'s current state back as raw bytes of `element_bytes`-wide elements.
    ///
    /// # Errors
    ///
    /// Same as [`data`](Self::data).
    pub fn read_raw(&self, name: &str, element_bytes: usize) -> FeedbackResult<Vec<u8>> {
        self.registry
            .read_raw(&self.device, self.driver.role(), name, element_bytes)
    }

    /// Uploads `data` into both buffers of `name`.
    ///
    /// # Errors
    ///
    /// Unknown name, `data.len() != count`, or a width mismatch. Nothing is written on
    /// error.
    pub fn set_data<T: Pod>(&self, name: &str, data: &[T]) -> FeedbackResult<()> {
        self.registry
            .write_raw(&self.device, name, std::mem::size_of::<T>(), bytemuck::cast_slice(data))
    }

    /// Raw form of [`set_data`](Self::set_data).
    ///
    /// # Errors
    ///
    /// Same as [`set_data`](Self::set_data).
    pub fn write_raw(&self, name: &str, element_bytes: usize, bytes: &[u8]) -> FeedbackResult<()> {
        self.registry.write_raw(&self.device, name, element_bytes, bytes)
    }

    /// [`set_data`](Self::set_data) that also keeps `data` as `name`'s initial snapshot.
    ///
    /// # Errors
    ///
    /// Same as [`set_data`](Self::set_data).
    pub fn set_initial_data<T: Pod>(&mut self, name: &str, data: &[T]) -> FeedbackResult<()> {
        self.registry.write_initial_raw(
            &self.device,
            name,
            std::mem::size_of::<T>(),
            bytemuck::cast_slice(data),
        )
    }

    /// Raw form of [`set_initial_data`](Self::set_initial_data).
    ///
    /// # Errors
    ///
    /// Same as [`set_data`](Self::set_data).
    pub fn write_initial_raw(&mut self, name: &str, element_bytes: usize, bytes: &[u8]) -> FeedbackResult<()> {
        self.registry
            .write_initial_raw(&self.device, name, element_bytes, bytes)
    }

    /// Restores both buffers of `name` from its initial snapshot.
    ///
    /// # Errors
    ///
    /// Unknown name or no snapshot.
    pub fn recall_initial_data(&self, name: &str) -> FeedbackResult<()> {
        self.registry.recall_initial(&self.device, name)
    }

    /// Forgets `name`'s initial snapshot. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// [`FeedbackError::UnknownStream`].
    pub fn clear_initial_data(&mut self, name: &str) -> FeedbackResult<bool> {
        self.registry.clear_initial(name)
    }

    /// Whether `name` has an initial snapshot.
    #[must_use]
    pub fn has_initial_data(&self, name: &str) -> bool {
        self.registry.has_initial(name)
    }

    /// Whether the program is linked and stepping is allowed.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.program.as_ref().is_some_and(FeedbackProgram::is_loaded)
    }

    /// Role shared by every stream.
    #[inline]
    #[must_use]
    pub fn role(&self) -> RoleIndex {
        self.driver.role()
    }

    /// Elements per stream (zero before setup).
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.registry.count()
    }

    /// Descriptor of `name`.
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&StreamDescriptor> {
        self.registry.stream(name)
    }

    /// Descriptors in capture order.
    pub fn streams(&self) -> impl Iterator<Item = &StreamDescriptor> + '_ {
        self.registry.descriptors()
    }

    /// Program handle, once set up.
    #[must_use]
    pub fn program(&self) -> Option<ProgramId> {
        self.program.as_ref().map(FeedbackProgram::id)
    }

    /// Vertex-stage source path, once set up.
    #[must_use]
    pub fn source_path(&self) -> Option<&Path> {
        self.program.as_ref().map(FeedbackProgram::source)
    }

    /// Completed steps since setup.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.driver.steps()
    }

    /// Input binds skipped since setup.
    #[must_use]
    pub fn skipped_input_binds(&self) -> u64 {
        self.driver.skipped_total()
    }

    /// Policy for streams the program does not read.
    #[must_use]
    pub fn missing_input_policy(&self) -> MissingInputPolicy {
        self.driver.policy()
    }

    /// Changes the policy for subsequent steps.
    pub fn set_missing_input_policy(&mut self, policy: MissingInputPolicy) {
        self.driver.set_policy(policy);
    }

    /// The device this shader draws on.
    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    fn release(&mut self) {
        self.registry.destroy(&self.device);
        if let Some(mut program) = self.program.take() {
            program.destroy(&self.device);
        }
    }
}

impl<D: GpuDevice> Drop for FeedbackShader<D> {
    fn drop(&mut self) {
        self.release();
    }
}
