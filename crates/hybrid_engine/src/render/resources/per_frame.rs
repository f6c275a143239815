//! N-way replication of per-frame state
//!
//! Every mutable resource the device may read while the CPU prepares the next
//! frame is stored once per frame-in-flight slot. Slot selection is always
//! `frame % N`, so two frames that differ modulo N never share an instance.

use std::ops::{Index, IndexMut};

/// One value per frame-in-flight slot
#[derive(Debug, Clone, PartialEq)]
pub struct PerFrame<T> {
    items: Vec<T>,
}

impl<T> PerFrame<T> {
    /// Build `frames_in_flight` values with `make(slot)`
    pub fn new(frames_in_flight: usize, make: impl FnMut(usize) -> T) -> Self {
        Self {
            items: (0..frames_in_flight.max(1)).map(make).collect(),
        }
    }

    /// Fallible variant of [`PerFrame::new`]; stops at the first error
    pub fn try_new<E>(
        frames_in_flight: usize,
        make: impl FnMut(usize) -> Result<T, E>,
    ) -> Result<Self, E> {
        Ok(Self {
            items: (0..frames_in_flight.max(1)).map(make).collect::<Result<_, _>>()?,
        })
    }

    /// Number of slots (N)
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always false; a `PerFrame` holds at least one slot
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Slot index used for `frame`
    pub fn slot(&self, frame: usize) -> usize {
        frame % self.items.len()
    }

    /// Value for `frame`
    pub fn get(&self, frame: usize) -> &T {
        &self.items[self.slot(frame)]
    }

    /// Mutable value for `frame`
    pub fn get_mut(&mut self, frame: usize) -> &mut T {
        let slot = self.slot(frame);
        &mut self.items[slot]
    }

    /// Iterate over all slots
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Iterate mutably over all slots
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    /// Consume into the per-slot values
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> Index<usize> for PerFrame<T> {
    type Output = T;

    fn index(&self, frame: usize) -> &T {
        self.get(frame)
    }
}

impl<T> IndexMut<usize> for PerFrame<T> {
    fn index_mut(&mut self, frame: usize) -> &mut T {
        self.get_mut(frame)
    }
}

impl<'a, T> IntoIterator for &'a PerFrame<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_frames_modulo_n_select_distinct_slots() {
        let frames = PerFrame::new(2, |slot| slot * 10);
        for i in 0..8 {
            for j in 0..8 {
                if i % 2 != j % 2 {
                    assert!(!std::ptr::eq(frames.get(i), frames.get(j)));
                } else {
                    assert_eq!(frames[i], frames[j]);
                }
            }
        }
    }

    #[test]
    fn test_try_new_propagates_error() {
        let result: Result<PerFrame<u32>, &str> =
            PerFrame::try_new(3, |slot| if slot == 2 { Err("boom") } else { Ok(slot as u32) });
        assert_eq!(result.unwrap_err(), "boom");
    }

    #[test]
    fn test_zero_slots_rounds_up_to_one() {
        let frames = PerFrame::new(0, |_| ());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames.slot(5), 0);
    }
}
