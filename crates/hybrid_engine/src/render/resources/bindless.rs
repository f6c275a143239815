//! Generation-tagged bookkeeping for bindless descriptor arrays
//!
//! Live resources always occupy the dense prefix `[0, live)` of the array.
//! When the live set shrinks, the elements past the new end are not padded
//! with duplicates; they become `Retiring` and are reclaimed once
//! `frames_in_flight` further refreshes have happened, i.e. once every frame
//! slot that could still index them has been re-prepared. The bound length
//! only shrinks after reclamation.
//!
//! Resources dropped from the live set are handed to the table with
//! [`BindlessTable::retire`] and come back out of [`BindlessTable::refresh`]
//! in the generation that reclaims the slots retired alongside them. Only
//! then may the owner free them.

use crate::render::api::{DeviceError, DeviceResult};

/// State of one element of a bindless array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not referenced by any frame
    Free,
    /// Holds a live resource in the current generation
    Live,
    /// Dropped out of the live range; reclaimable from generation `until`
    Retiring {
        /// First generation at which the slot becomes free
        until: u64,
    },
}

/// Summary of one refresh
#[derive(Debug)]
pub struct BindlessRefresh<R> {
    /// Generation produced by this refresh
    pub generation: u64,
    /// Elements holding live resources, always `[0, live)`
    pub live: usize,
    /// Array length still considered bound (live plus retiring)
    pub bound_len: usize,
    /// Slots reclaimed by this refresh
    pub reclaimed: usize,
    /// Retired resources no frame slot can reference any more
    pub released: Vec<R>,
}

/// Bindless slot table for one descriptor array
#[derive(Debug, Clone)]
pub struct BindlessTable<R = ()> {
    slots: Vec<SlotState>,
    generation: u64,
    frames_in_flight: u64,
    capacity: usize,
    retired: Vec<(u64, R)>,
}

impl<R> BindlessTable<R> {
    /// Table for an array of `capacity` descriptors
    pub fn new(capacity: usize, frames_in_flight: usize) -> Self {
        Self {
            slots: Vec::new(),
            generation: 0,
            frames_in_flight: frames_in_flight.max(1) as u64,
            capacity,
            retired: Vec::new(),
        }
    }

    /// Hand over a resource that just left the live set.
    ///
    /// It is returned by the refresh that reclaims the slots the next refresh
    /// retires, `frames_in_flight + 1` generations from now.
    pub fn retire(&mut self, resource: R) {
        let until = self.generation + 1 + self.frames_in_flight;
        self.retired.push((until, resource));
    }

    /// Resources retired but not yet released
    pub fn pending_release(&self) -> usize {
        self.retired.len()
    }

    /// Release every retired resource regardless of generation. Only valid
    /// once the device is idle and the descriptor sets are being destroyed.
    pub fn drain_retired(&mut self) -> Vec<R> {
        self.retired.drain(..).map(|(_, resource)| resource).collect()
    }

    /// Advance one generation with `live` resources bound densely.
    pub fn refresh(&mut self, live: usize) -> DeviceResult<BindlessRefresh<R>> {
        if live > self.capacity {
            return Err(DeviceError::invalid(format!(
                "{live} resources exceed bindless capacity {}",
                self.capacity
            )));
        }
        self.generation += 1;
        let generation = self.generation;
        let until = generation + self.frames_in_flight;
        let mut reclaimed = 0;

        if self.slots.len() < live {
            self.slots.resize(live, SlotState::Free);
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            *slot = match *slot {
                _ if index < live => SlotState::Live,
                SlotState::Live => SlotState::Retiring { until },
                SlotState::Retiring { until: expiry } if expiry <= generation => {
                    reclaimed += 1;
                    SlotState::Free
                }
                other => other,
            };
        }
        while self.slots.last() == Some(&SlotState::Free) {
            self.slots.pop();
        }

        let (due, waiting): (Vec<_>, Vec<_>) = self.retired.drain(..).partition(|(until, _)| *until <= generation);
        self.retired = waiting;

        Ok(BindlessRefresh {
            generation,
            live,
            bound_len: self.slots.len(),
            reclaimed,
            released: due.into_iter().map(|(_, resource)| resource).collect(),
        })
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Array length still considered bound
    pub fn bound_len(&self) -> usize {
        self.slots.len()
    }

    /// Number of live elements
    pub fn live_len(&self) -> usize {
        self.slots.iter().filter(|s| **s == SlotState::Live).count()
    }

    /// Number of elements waiting for reclamation
    pub fn retiring_len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, SlotState::Retiring { .. }))
            .count()
    }

    /// State of one element
    pub fn state(&self, index: usize) -> SlotState {
        self.slots.get(index).copied().unwrap_or(SlotState::Free)
    }

    /// Array capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_binds_dense_prefix() {
        let mut table = BindlessTable::<()>::new(16, 2);
        let refresh = table.refresh(3).unwrap();
        assert_eq!(refresh.live, 3);
        assert_eq!(refresh.bound_len, 3);
        assert!((0..3).all(|i| table.state(i) == SlotState::Live));
    }

    #[test]
    fn test_shrink_retires_for_n_generations() {
        let mut table = BindlessTable::<()>::new(16, 2);
        table.refresh(4).unwrap();

        let refresh = table.refresh(2).unwrap();
        assert_eq!(refresh.bound_len, 4);
        assert_eq!(table.retiring_len(), 2);
        assert_eq!(table.state(3), SlotState::Retiring { until: 4 });

        // One more generation: still retiring.
        assert_eq!(table.refresh(2).unwrap().bound_len, 4);

        // Second generation after the shrink reclaims and truncates.
        let refresh = table.refresh(2).unwrap();
        assert_eq!(refresh.reclaimed, 2);
        assert_eq!(refresh.bound_len, 2);
        assert_eq!(table.retiring_len(), 0);
    }

    #[test]
    fn test_regrowth_reuses_retiring_slots() {
        let mut table = BindlessTable::<()>::new(16, 2);
        table.refresh(3).unwrap();
        table.refresh(1).unwrap();
        table.refresh(3).unwrap();
        assert_eq!(table.live_len(), 3);
        assert_eq!(table.retiring_len(), 0);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut table = BindlessTable::<()>::new(2, 2);
        assert!(table.refresh(3).is_err());
        assert_eq!(table.generation(), 0);
    }

    #[test]
    fn test_retired_resources_release_with_their_slots() {
        let mut table = BindlessTable::new(8, 2);
        table.refresh(3).unwrap();
        table.retire("dropped");

        let first = table.refresh(2).unwrap();
        assert!(first.released.is_empty());
        assert_eq!(table.state(2), SlotState::Retiring { until: 4 });

        let second = table.refresh(2).unwrap();
        assert!(second.released.is_empty());
        assert_eq!(table.pending_release(), 1);

        let third = table.refresh(2).unwrap();
        assert_eq!(third.reclaimed, 1);
        assert_eq!(third.released, vec!["dropped"]);
        assert_eq!(table.pending_release(), 0);
    }

    #[test]
    fn test_retired_resources_wait_even_without_shrink() {
        // Destroy followed by a load keeps the live count unchanged.
        let mut table = BindlessTable::new(8, 2);
        table.refresh(2).unwrap();
        table.retire(7_u32);
        for _ in 0..2 {
            assert!(table.refresh(2).unwrap().released.is_empty());
        }
        assert_eq!(table.refresh(2).unwrap().released, vec![7]);
    }

    #[test]
    fn test_drain_returns_everything_pending() {
        let mut table = BindlessTable::new(4, 3);
        table.retire(1_u8);
        table.retire(2_u8);
        assert_eq!(table.drain_retired(), vec![1, 2]);
        assert_eq!(table.pending_release(), 0);
    }

    #[test]
    fn test_never_pads_with_duplicates() {
        let mut table = BindlessTable::<()>::new(8, 3);
        table.refresh(5).unwrap();
        table.refresh(1).unwrap();
        assert_eq!(table.live_len(), 1);
        assert!((1..5).all(|i| matches!(table.state(i), SlotState::Retiring { .. })));
    }
}
