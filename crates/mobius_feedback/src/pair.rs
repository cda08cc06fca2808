//! Ping-pong buffer pair.
//!
//! Two equally sized buffers per stream. Which one is "current" is decided by the
//! driver's shared [`RoleIndex`], never by the pair itself.

use mobius_core::{BufferId, DeviceResult, GpuDevice, RoleIndex, LOG_TARGET};

/// The two buffers of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingPongPair {
    buffers: [BufferId; 2],
}

impl PingPongPair {
    /// Creates both buffer objects without storage.
    #[must_use]
    pub fn create<D: GpuDevice>(device: &D, name: &str) -> Self {
        Self {
            buffers: [
                device.create_buffer(&format!("{name}[0]")),
                device.create_buffer(&format!("{name}[1]")),
            ],
        }
    }

    /// Allocates `size` bytes for each buffer that has no storage yet.
    ///
    /// Returns `true` when anything was allocated. Calling it again is a no-op, which is
    /// what lets a reload rebuild the program without touching buffer storage.
    ///
    /// # Errors
    ///
    /// Propagates the device error if allocation fails.
    pub fn ensure_allocated<D: GpuDevice>(&self, device: &D, size: usize) -> DeviceResult<bool> {
        let mut allocated = false;
        for &buffer in &self.buffers {
            if !device.is_allocated(buffer) {
                device.allocate_buffer(buffer, size)?;
                allocated = true;
            }
        }
        if allocated {
            tracing::debug!(target: LOG_TARGET, "allocated pair {:?}, {} bytes each", self.buffers, size);
        }
        Ok(allocated)
    }

    /// Whether both buffers have storage.
    #[must_use]
    pub fn is_allocated<D: GpuDevice>(&self, device: &D) -> bool {
        self.buffers.iter().all(|&b| device.is_allocated(b))
    }

    /// Buffer holding the current state under `role`.
    #[inline]
    #[must_use]
    pub fn current(&self, role: RoleIndex) -> BufferId {
        self.buffers[role.current()]
    }

    /// Buffer the next pass captures into under `role`.
    #[inline]
    #[must_use]
    pub fn next(&self, role: RoleIndex) -> BufferId {
        self.buffers[role.next()]
    }

    /// Both buffer ids, in slot order.
    #[inline]
    #[must_use]
    pub fn buffers(&self) -> [BufferId; 2] {
        self.buffers
    }

    /// Uploads `bytes` into both buffers so the content is visible under either role.
    ///
    /// # Errors
    ///
    /// Propagates the device error from either upload.
    pub fn write_both<D: GpuDevice>(&self, device: &D, bytes: &[u8]) -> DeviceResult<()> {
        for &buffer in &self.buffers {
            device.write_buffer(buffer, bytes)?;
        }
        Ok(())
    }

    /// Releases both buffers.
    pub fn destroy<D: GpuDevice>(&self, device: &D) {
        for &buffer in &self.buffers {
            device.destroy_buffer(buffer);
        }
    }
}
