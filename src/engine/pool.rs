// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
//! Fixed-size arenas for notes and voices.
//!
//! All slots are built up front. Allocation pops a free index and never grows the
//! pool; exhaustion shows up as `None`.

/// Refers to a pool slot. A stale handle (its slot freed and reused) resolves to nothing.
/// The default handle never resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

struct Slot<T> {
    value: T,
    generation: u32,
    occupied: bool,
}

pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    /// Free indices; the last one is handed out next.
    free: Vec<u32>,
}

impl<T> Pool<T> {
    /// Builds `capacity` slots with `init`.
    pub fn new(capacity: usize, mut init: impl FnMut() -> T) -> Pool<T> {
        let slots = (0..capacity)
            .map(|_| Slot {
                value: init(),
                generation: 0,
                occupied: false,
            })
            .collect();
        Pool {
            slots,
            free: (0..capacity as u32).rev().collect(),
        }
    }

    /// Takes a free slot. The value still holds whatever its previous user left.
    pub fn alloc(&mut self) -> Option<(Handle, &mut T)> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.occupied = true;
        Some((
            Handle {
                index,
                generation: slot.generation,
            },
            &mut slot.value,
        ))
    }

    /// Returns a slot to the pool. Returns false for stale handles.
    pub fn free(&mut self, handle: Handle) -> bool {
        match self.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.occupied && slot.generation == handle.generation => {
                slot.occupied = false;
                self.free.push(handle.index);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
            .map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
            .map(|slot| &mut slot.value)
    }

    /// Iterates over allocated slots.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.occupied.then_some((
                Handle {
                    index: index as u32,
                    generation: slot.generation,
                },
                &slot.value,
            ))
        })
    }

    /// Number of allocated slots.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
