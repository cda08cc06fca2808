//! # MOBIUS Feedback
//!
//! Double-buffered simulation state advanced by feedback-capture passes.
//!
//! Every stream (position, velocity, age, ...) lives in a pair of equally sized GPU
//! buffers. A step reads all streams from their current buffers, runs one vertex-stage
//! program over every element, and captures the outputs into the other buffers. Then a
//! single shared role bit flips and the freshly written buffers become current.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      FeedbackShader                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  AttributeRegistry ── PingPongPair × N      (buffers)       │
//! │  FeedbackProgram   ── vertex stage + varyings               │
//! │  FeedbackDriver    ── RoleIndex, one pass per step          │
//! │  binder::attach    ── current buffer → foreign binding      │
//! └───────────────────────────┬─────────────────────────────────┘
//!                             ▼
//!               GpuDevice: HeadlessDevice | WgpuDevice
//! ```
//!
//! ## Rules
//!
//! - No data ever leaves the GPU on the step path.
//! - All streams flip together; never flip one stream on its own.
//! - Reload keeps every buffer and its contents.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod binder;
pub mod driver;
pub mod headless;
pub mod pair;
pub mod program;
pub mod registry;
pub mod shader;

#[cfg(feature = "wgpu")]
pub mod gpu;

pub use binder::{attach, AttachTarget};
pub use driver::{FeedbackDriver, StepReport};
pub use headless::{HeadlessDevice, PointInput, PointOutput};
pub use pair::PingPongPair;
pub use program::FeedbackProgram;
pub use registry::{AttributeRegistry, StreamBinding};
pub use shader::FeedbackShader;

#[cfg(feature = "wgpu")]
pub use gpu::WgpuDevice;

pub use mobius_core::{
    AttributeSource, BufferId, DeviceError, FeedbackConfig, FeedbackError, FeedbackResult,
    GpuDevice, MissingInputPolicy, ProgramId, RoleIndex, ShaderStage, StreamDescriptor,
    VertexBindingId, LOG_TARGET,
};
