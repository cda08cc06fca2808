//! Headless CPU device.
//!
//! Runs feedback passes on the CPU so the whole stack can be exercised without a GPU
//! context. Used by every test in the workspace and by the demo binary.

mod device;
mod kernel;
mod source;

pub use device::HeadlessDevice;
pub use kernel::{Kernel, PointInput, PointOutput};
pub use source::{scan, Declaration, StageInterface};

#[cfg(feature = "wgpu")]
pub(crate) use source::strip_comments;
