//! wgpu back-end (feature `wgpu`).
//!
//! Feedback programs are WGSL compute shaders; see [`wgsl`] for the binding layout they
//! must follow.

mod device;
pub mod wgsl;

pub use device::{BoundVertexSource, WgpuDevice};
