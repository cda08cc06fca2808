//! Per-point kernels.
//!
//! A kernel stands in for the compiled vertex stage: it sees one point's inputs by name
//! and writes that point's outputs by name.

/// Signature of a registered kernel.
pub type Kernel = dyn Fn(&PointInput<'_>, &mut PointOutput<'_>) + Send + Sync;

/// Value of an input with no bound buffer, truncated to the input's width.
pub(crate) const DEFAULT_INPUT: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Name, offset and width of one variable inside a point's value block.
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub name: String,
    pub offset: usize,
    pub components: usize,
}

/// Lays out `(name, components)` pairs back to back.
pub(crate) fn layout<'a>(vars: impl Iterator<Item = (&'a str, usize)>) -> (Vec<Slot>, usize) {
    let mut offset = 0;
    let slots = vars
        .map(|(name, components)| {
            let slot = Slot {
                name: name.to_owned(),
                offset,
                components,
            };
            offset += components;
            slot
        })
        .collect();
    (slots, offset)
}

fn find<'s>(slots: &'s [Slot], name: &str) -> Option<&'s Slot> {
    slots.iter().find(|slot| slot.name == name)
}

/// Inputs of the point being processed.
#[derive(Debug)]
pub struct PointInput<'a> {
    pub(crate) index: u32,
    pub(crate) slots: &'a [Slot],
    pub(crate) values: &'a [f32],
}

impl PointInput<'_> {
    /// Index of the point within the draw.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Value of input `name`, as wide as its declaration. Undeclared names read as empty.
    #[must_use]
    pub fn attribute(&self, name: &str) -> &[f32] {
        find(self.slots, name).map_or(&[], |slot| {
            &self.values[slot.offset..slot.offset + slot.components]
        })
    }
}

/// Outputs of the point being processed. Every output starts at zero.
#[derive(Debug)]
pub struct PointOutput<'a> {
    pub(crate) slots: &'a [Slot],
    pub(crate) values: &'a mut [f32],
}

impl PointOutput<'_> {
    /// Writes output `name`. Extra values are dropped; undeclared names are ignored.
    pub fn set(&mut self, name: &str, values: &[f32]) {
        if let Some(slot) = find(self.slots, name) {
            let n = slot.components.min(values.len());
            self.values[slot.offset..slot.offset + n].copy_from_slice(&values[..n]);
        }
    }
}
