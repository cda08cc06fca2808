//! # Attribute Registry
//!
//! Maps logical stream names to their ping-pong pairs and owns every buffer.
//!
//! ## Invariants
//!
//! - The name map is built once by [`AttributeRegistry::build`] and never restructured;
//!   only buffer contents change afterwards.
//! - Every pair is sized `components × count × 4` bytes for both of its buffers.
//! - Data I/O is all-or-nothing: validation runs before the first byte is written.

use std::collections::HashMap;

use bytemuck::Pod;
use mobius_core::{
    BufferId, FeedbackError, FeedbackResult, GpuDevice, RoleIndex, StreamDescriptor,
};

use crate::pair::PingPongPair;

/// One registered stream.
#[derive(Debug)]
struct StreamSlot {
    descriptor: StreamDescriptor,
    ordinal: u32,
    pair: PingPongPair,
    snapshot: Option<Vec<u8>>,
}

/// A stream as seen by the capture pass.
#[derive(Debug, Clone, Copy)]
pub struct StreamBinding<'a> {
    /// The stream's descriptor.
    pub descriptor: &'a StreamDescriptor,
    /// Capture index (position in the declared stream list).
    pub ordinal: u32,
    /// The stream's buffers.
    pub pair: &'a PingPongPair,
}

/// Owner of every stream buffer of one feedback shader.
#[derive(Debug, Default)]
pub struct AttributeRegistry {
    slots: HashMap<String, StreamSlot>,
    order: Vec<String>,
    count: usize,
}

impl AttributeRegistry {
    /// Registers `streams` (in capture order) and creates their buffer objects.
    ///
    /// Storage is not allocated here; call [`allocate`](Self::allocate).
    ///
    /// # Panics
    ///
    /// Panics if `streams` is empty, `count` is zero or does not fit a `u32` draw, a
    /// stream has fewer than 1 or more than 4 components, or two streams share a name.
    /// These are programmer errors, not runtime states.
    #[must_use]
    pub fn build<D: GpuDevice>(device: &D, streams: &[StreamDescriptor], count: usize) -> Self {
        assert!(!streams.is_empty(), "at least one stream is required");
        assert!(count > 0, "particle count must be > 0");
        assert!(u32::try_from(count).is_ok(), "particle count {count} exceeds u32::MAX");

        let mut slots = HashMap::with_capacity(streams.len());
        let mut order = Vec::with_capacity(streams.len());
        for (ordinal, descriptor) in streams.iter().enumerate() {
            assert!(
                descriptor.has_valid_width(),
                "stream '{}' has {} components, expected 1-4",
                descriptor.name,
                descriptor.components
            );
            let slot = StreamSlot {
                descriptor: descriptor.clone(),
                ordinal: u32::try_from(ordinal).expect("stream count exceeds u32"),
                pair: PingPongPair::create(device, &descriptor.name),
                snapshot: None,
            };
            let previous = slots.insert(descriptor.name.clone(), slot);
            assert!(previous.is_none(), "duplicate stream name '{}'", descriptor.name);
            order.push(descriptor.name.clone());
        }

        Self { slots, order, count }
    }

    /// Allocates storage for every pair that has none. Returns how many pairs were
    /// allocated; zero on every call after the first.
    ///
    /// # Errors
    ///
    /// Propagates the first device failure.
    pub fn allocate<D: GpuDevice>(&self, device: &D) -> FeedbackResult<usize> {
        let mut allocated = 0;
        for name in &self.order {
            let slot = &self.slots[name];
            let size = slot.descriptor.buffer_bytes(self.count);
            if slot.pair.ensure_allocated(device, size)? {
                allocated += 1;
            }
        }
        Ok(allocated)
    }

    /// Elements per stream.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of streams.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no streams are registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Descriptor of `name`, if registered.
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&StreamDescriptor> {
        self.slots.get(name).map(|slot| &slot.descriptor)
    }

    /// Descriptors in capture order.
    pub fn descriptors(&self) -> impl Iterator<Item = &StreamDescriptor> + '_ {
        self.order.iter().map(|name| &self.slots[name].descriptor)
    }

    /// Streams in capture order, with their pairs.
    pub fn bindings(&self) -> impl Iterator<Item = StreamBinding<'_>> + '_ {
        self.order.iter().map(|name| {
            let slot = &self.slots[name];
            StreamBinding {
                descriptor: &slot.descriptor,
                ordinal: slot.ordinal,
                pair: &slot.pair,
            }
        })
    }

    /// Whether `name` has a stored initial snapshot.
    #[must_use]
    pub fn has_initial(&self, name: &str) -> bool {
        self.slots.get(name).is_some_and(|slot| slot.snapshot.is_some())
    }

    /// The buffer holding `name`'s current state under `role`.
    ///
    /// # Errors
    ///
    /// [`FeedbackError::UnknownStream`] when `name` is not registered.
    pub fn buffer(&self, name: &str, role: RoleIndex) -> FeedbackResult<BufferId> {
        Ok(self.slot(name)?.pair.current(role))
    }

    /// Reads `name`'s current buffer back, checked against `element_bytes`.
    ///
    /// # Errors
    ///
    /// Unknown name, element width mismatch, or a failed map.
    pub fn read_raw<D: GpuDevice>(
        &self,
        device: &D,
        role: RoleIndex,
        name: &str,
        element_bytes: usize,
    ) -> FeedbackResult<Vec<u8>> {
        let slot = self.slot(name)?;
        Self::check_width(slot, element_bytes)?;
        device
            .read_buffer(slot.pair.current(role))
            .map_err(|e| FeedbackError::from(e).logged())
    }

    /// Typed form of [`read_raw`](Self::read_raw).
    ///
    /// # Errors
    ///
    /// Same as [`read_raw`](Self::read_raw).
    pub fn data<T: Pod, D: GpuDevice>(
        &self,
        device: &D,
        role: RoleIndex,
        name: &str,
    ) -> FeedbackResult<Vec<T>> {
        let bytes = self.read_raw(device, role, name, std::mem::size_of::<T>())?;
        let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); bytes.len() / std::mem::size_of::<T>()];
        let dst = bytemuck::cast_slice_mut::<T, u8>(&mut out);
        let filled = dst.len();
        dst.copy_from_slice(&bytes[..filled]);
        Ok(out)
    }

    /// Writes `bytes` into both buffers of `name`.
    ///
    /// # Errors
    ///
    /// Unknown name, element count or width mismatch, or a device failure. Nothing is
    /// written unless validation passes.
    pub fn write_raw<D: GpuDevice>(
        &self,
        device: &D,
        name: &str,
        element_bytes: usize,
        bytes: &[u8],
    ) -> FeedbackResult<()> {
        let slot = self.checked_slot(name, element_bytes, bytes.len())?;
        slot.pair
            .write_both(device, bytes)
            .map_err(|e| FeedbackError::from(e).logged())
    }

    /// Like [`write_raw`](Self::write_raw), and also keeps `bytes` as the stream's
    /// initial snapshot.
    ///
    /// # Errors
    ///
    /// Same as [`write_raw`](Self::write_raw). The snapshot is only replaced once the
    /// upload succeeded.
    pub fn write_initial_raw<D: GpuDevice>(
        &mut self,
        device: &D,
        name: &str,
        element_bytes: usize,
        bytes: &[u8],
    ) -> FeedbackResult<()> {
        self.write_raw(device, name, element_bytes, bytes)?;
        if let Some(slot) = self.slots.get_mut(name) {
            slot.snapshot = Some(bytes.to_vec());
        }
        Ok(())
    }

    /// Restores both buffers of `name` from its snapshot.
    ///
    /// # Errors
    ///
    /// Unknown name, no snapshot, or a device failure.
    pub fn recall_initial<D: GpuDevice>(&self, device: &D, name: &str) -> FeedbackResult<()> {
        let slot = self.slot(name)?;
        let snapshot = slot
            .snapshot
            .as_deref()
            .ok_or_else(|| FeedbackError::NoSnapshot(name.to_owned()).logged())?;
        slot.pair
            .write_both(device, snapshot)
            .map_err(|e| FeedbackError::from(e).logged())
    }

    /// Restores every stream that has a snapshot and leaves the rest untouched.
    /// Returns how many streams were restored.
    ///
    /// # Errors
    ///
    /// Stops at the first device failure.
    pub fn recall_all_initial<D: GpuDevice>(&self, device: &D) -> FeedbackResult<usize> {
        let mut restored = 0;
        for name in &self.order {
            if self.slots[name].snapshot.is_some() {
                self.recall_initial(device, name)?;
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Drops `name`'s snapshot. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// [`FeedbackError::UnknownStream`] when `name` is not registered.
    pub fn clear_initial(&mut self, name: &str) -> FeedbackResult<bool> {
        match self.slots.get_mut(name) {
            Some(slot) => Ok(slot.snapshot.take().is_some()),
            None => Err(FeedbackError::UnknownStream(name.to_owned()).logged()),
        }
    }

    /// Releases every buffer and empties the registry.
    pub fn destroy<D: GpuDevice>(&mut self, device: &D) {
        for slot in self.slots.values() {
            slot.pair.destroy(device);
        }
        self.slots.clear();
        self.order.clear();
    }

    fn slot(&self, name: &str) -> FeedbackResult<&StreamSlot> {
        self.slots
            .get(name)
            .ok_or_else(|| FeedbackError::UnknownStream(name.to_owned()).logged())
    }

    fn check_width(slot: &StreamSlot, element_bytes: usize) -> FeedbackResult<()> {
        let expected = slot.descriptor.element_bytes();
        if element_bytes == expected {
            Ok(())
        } else {
            Err(FeedbackError::ElementWidth {
                stream: slot.descriptor.name.clone(),
                expected,
                actual: element_bytes,
            }
            .logged())
        }
    }

    /// Name, then element count, then element width.
    fn checked_slot(&self, name: &str, element_bytes: usize, byte_len: usize) -> FeedbackResult<&StreamSlot> {
        let slot = self.slot(name)?;
        if element_bytes == 0 || self.count.checked_mul(element_bytes) != Some(byte_len) {
            let actual = byte_len.checked_div(element_bytes).unwrap_or(0);
            return Err(FeedbackError::ElementCount {
                stream: name.to_owned(),
                expected: self.count,
                actual,
            }
            .logged());
        }
        Self::check_width(slot, element_bytes)?;
        Ok(slot)
    }
}
