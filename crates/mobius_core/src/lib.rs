//! # MOBIUS Core
//!
//! Contract types shared by every MOBIUS back-end.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────┐     ┌──────────────────┐
//!   │ StreamDescriptor │     │  FeedbackConfig  │
//!   └────────┬─────────┘     └────────┬─────────┘
//!            │                        │
//!            ▼                        ▼
//!   ┌─────────────────────────────────────────┐
//!   │          GpuDevice (the contract)       │
//!   │  buffers · programs · capture · binds   │
//!   └─────────────────────────────────────────┘
//!            ▲                        ▲
//!   HeadlessDevice             WgpuDevice
//!   (mobius_feedback)          (mobius_feedback, feature "wgpu")
//! ```
//!
//! ## CRITICAL RULE
//!
//! This crate must NEVER depend on `wgpu`. Back-ends live in `mobius_feedback`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod device;
pub mod error;
pub mod role;
pub mod stream;

pub use config::{FeedbackConfig, MissingInputPolicy};
pub use device::{
    AttributeSource, BufferId, GpuDevice, ProgramId, ShaderStage, VertexBindingId,
};
pub use error::{DeviceError, DeviceResult, FeedbackError, FeedbackResult};
pub use role::RoleIndex;
pub use stream::{StreamDescriptor, FLOAT_BYTES, MAX_COMPONENTS};

/// Log target shared by every diagnostic the feedback layer emits.
pub const LOG_TARGET: &str = "feedback_shader";
