//! Fixed capacity arena addressed by generation checked handles.

/// Stable reference to a pool slot. A handle goes stale once its slot is freed, even if
/// the slot is handed out again later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: usize,
    generation: u32,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

pub struct AllocationPool<T> {
    slots: Vec<T>,
    generations: Vec<u32>,
    occupied: Vec<bool>,
}

impl<T: Default> AllocationPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| T::default()).collect(),
            generations: vec![0; capacity],
            occupied: vec![false; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.occupied.iter().filter(|o| **o).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims the first free slot. The slot content is left as the previous user reset it.
    pub fn acquire(&mut self) -> Option<SlotHandle> {
        let index = self.occupied.iter().position(|o| !*o)?;
        self.occupied[index] = true;
        Some(SlotHandle {
            index,
            generation: self.generations[index],
        })
    }

    /// Frees the slot and invalidates every handle to it. Returns false for stale handles.
    pub fn release(&mut self, handle: SlotHandle) -> bool {
        if !self.is_live(handle) {
            return false;
        }
        self.occupied[handle.index] = false;
        self.generations[handle.index] = self.generations[handle.index].wrapping_add(1);
        true
    }

    pub fn is_live(&self, handle: SlotHandle) -> bool {
        handle.index < self.slots.len()
            && self.occupied[handle.index]
            && self.generations[handle.index] == handle.generation
    }

    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        if self.is_live(handle) {
            self.slots.get(handle.index)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        if self.is_live(handle) {
            self.slots.get_mut(handle.index)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, _)| self.occupied[*i])
            .map(|(index, slot)| {
                (
                    SlotHandle {
                        index,
                        generation: self.generations[index],
                    },
                    slot,
                )
            })
    }
}
