//! External binder.
//!
//! Wires a stream's current-role buffer into somebody else's vertex binding, with no
//! copy. The binding is only valid until the next step flips roles; consumers that want
//! the latest state re-attach every frame.

use mobius_core::{
    AttributeSource, FeedbackError, FeedbackResult, GpuDevice, ProgramId, RoleIndex,
    VertexBindingId, LOG_TARGET,
};

use crate::registry::AttributeRegistry;

/// Where an attached stream goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachTarget<'a> {
    /// Program of the consuming draw call.
    pub program: ProgramId,
    /// Vertex binding of the consuming draw call.
    pub binding: VertexBindingId,
    /// Attribute name in `program`.
    pub attribute: &'a str,
    /// Instancing divisor, forwarded verbatim. Zero means per vertex.
    pub divisor: u32,
}

impl<'a> AttachTarget<'a> {
    /// A per-vertex target.
    #[must_use]
    pub fn new(program: ProgramId, binding: VertexBindingId, attribute: &'a str) -> Self {
        Self {
            program,
            binding,
            attribute,
            divisor: 0,
        }
    }

    /// Same target, stepping once every `divisor` instances.
    #[must_use]
    pub fn with_divisor(mut self, divisor: u32) -> Self {
        self.divisor = divisor;
        self
    }
}

/// Binds `source`'s current buffer under `role` as `target.attribute`.
///
/// # Errors
///
/// Unknown source stream, a target program without that attribute, or a device
/// failure. Every check runs before the binding is touched, so a failed attach leaves
/// it as it was.
pub fn attach<D: GpuDevice>(
    device: &D,
    registry: &AttributeRegistry,
    role: RoleIndex,
    source: &str,
    target: &AttachTarget<'_>,
) -> FeedbackResult<AttributeSource> {
    let buffer = registry.buffer(source, role)?;
    let components = registry
        .stream(source)
        .map(|stream| stream.components)
        .ok_or_else(|| FeedbackError::UnknownStream(source.to_owned()).logged())?;
    let location = device
        .attribute_location(target.program, target.attribute)
        .ok_or_else(|| FeedbackError::UnknownTargetAttribute(target.attribute.to_owned()).logged())?;

    let bound = AttributeSource {
        location,
        buffer,
        components,
        divisor: target.divisor,
    };
    device
        .set_attribute_source(target.binding, bound)
        .map_err(|e| FeedbackError::from(e).logged())?;

    tracing::debug!(
        target: LOG_TARGET,
        "attached '{}' ({}) to {} location {} divisor {}",
        source,
        buffer,
        target.binding,
        location,
        target.divisor
    );
    Ok(bound)
}
