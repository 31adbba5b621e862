//! Slot identifiers.
//!
//! Each registry owns its own [`IdPool`]. Indices are recycled through a
//! free-list, and every release bumps the index's generation, so a token that
//! still carries an old id can never address the slot that reused its index.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Default)]
pub(crate) struct IdPool {
    generations: Vec<u32>,
    free: Vec<u32>,
}

impl IdPool {
    pub(crate) fn acquire(&mut self) -> SlotId {
        if let Some(index) = self.free.pop() {
            return SlotId::new(index, self.generations[index as usize]);
        }
        let index = self.generations.len() as u32;
        self.generations.push(0);
        SlotId::new(index, 0)
    }

    /// Returns `false` for ids that are stale or were already released.
    pub(crate) fn release(&mut self, id: SlotId) -> bool {
        match self.generations.get_mut(id.index as usize) {
            Some(generation) if *generation == id.generation => {
                *generation = generation.wrapping_add(1);
                self.free.push(id.index);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.generations.len() - self.free.len()
    }
}
