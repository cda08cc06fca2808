//! # Ping-Pong Role Index
//!
//! One bit, shared by every stream of a driver, selecting which buffer of each pair is
//! "current" (read by the next pass) and which is "next" (captured into).
//!
//! ```text
//!   role 0:  buffer[0] = current   buffer[1] = next
//!   role 1:  buffer[1] = current   buffer[0] = next
//! ```

/// Role bit of a ping-pong driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RoleIndex(u8);

impl RoleIndex {
    /// Role every driver starts in.
    pub const INITIAL: Self = Self(0);

    /// Index of the buffer holding the current state.
    #[inline]
    #[must_use]
    pub const fn current(self) -> usize {
        self.0 as usize
    }

    /// Index of the buffer the next pass captures into.
    #[inline]
    #[must_use]
    pub const fn next(self) -> usize {
        (self.0 ^ 1) as usize
    }

    /// The role after one step.
    #[inline]
    #[must_use]
    pub const fn flipped(self) -> Self {
        Self(self.0 ^ 1)
    }
}
