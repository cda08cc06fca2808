//! Stream descriptors.

use serde::{Deserialize, Serialize};

/// Bytes per float component.
pub const FLOAT_BYTES: usize = std::mem::size_of::<f32>();

/// Widest element a stream may carry (a `vec4`).
pub const MAX_COMPONENTS: u32 = 4;

/// A named attribute stream produced and consumed by the feedback pass.
///
/// Declared once at setup; reload never changes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Logical name, also the vertex input the program reads it from.
    pub name: String,
    /// Output variable the pass captures the next state from.
    pub capture: String,
    /// Floats per element, 1 to 4.
    pub components: u32,
}

impl StreamDescriptor {
    /// Creates a descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, capture: impl Into<String>, components: u32) -> Self {
        Self {
            name: name.into(),
            capture: capture.into(),
            components,
        }
    }

    /// Bytes per element.
    #[inline]
    #[must_use]
    pub fn element_bytes(&self) -> usize {
        self.components as usize * FLOAT_BYTES
    }

    /// Bytes for one buffer of `count` elements.
    #[inline]
    #[must_use]
    pub fn buffer_bytes(&self, count: usize) -> usize {
        self.element_bytes() * count
    }

    /// Whether `components` is in `1..=4`.
    #[inline]
    #[must_use]
    pub fn has_valid_width(&self) -> bool {
        (1..=MAX_COMPONENTS).contains(&self.components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        let d = StreamDescriptor::new("velocity", "out_velocity", 3);
        assert_eq!(d.element_bytes(), 12);
        assert_eq!(d.buffer_bytes(100), 1200);
    }

    #[test]
    fn test_width_bounds() {
        assert!(!StreamDescriptor::new("a", "b", 0).has_valid_width());
        assert!(StreamDescriptor::new("a", "b", 1).has_valid_width());
        assert!(StreamDescriptor::new("a", "b", 4).has_valid_width());
        assert!(!StreamDescriptor::new("a", "b", 5).has_valid_width());
    }
}
