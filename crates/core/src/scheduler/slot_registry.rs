use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::frame_slot::FrameSlot;
use super::lock_unpoisoned;

/// Index-keyed set of live slots.
///
/// A slot is present from the moment its request is issued until the
/// consumer has taken its frame (or the scheduler is torn down). Slots are
/// shared as `Arc`s so a producer callback can finish writing into a slot
/// even if the registry has already dropped it.
pub struct SlotRegistry<F> {
    slots: Mutex<HashMap<usize, Arc<FrameSlot<F>>>>,
}

impl<F> SlotRegistry<F> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates the slot for `index`. Returns `None` if one already exists.
    pub fn allocate(&self, index: usize) -> Option<Arc<FrameSlot<F>>> {
        let mut slots = lock_unpoisoned(&self.slots);
        if slots.contains_key(&index) {
            return None;
        }
        let slot = Arc::new(FrameSlot::new(index));
        slots.insert(index, Arc::clone(&slot));
        Some(slot)
    }

    pub fn get(&self, index: usize) -> Option<Arc<FrameSlot<F>>> {
        lock_unpoisoned(&self.slots).get(&index).cloned()
    }

    pub fn remove(&self, index: usize) -> Option<Arc<FrameSlot<F>>> {
        lock_unpoisoned(&self.slots).remove(&index)
    }

    /// Every live slot, without removing them.
    pub fn snapshot(&self) -> Vec<Arc<FrameSlot<F>>> {
        lock_unpoisoned(&self.slots).values().cloned().collect()
    }

    /// Removes and returns every live slot.
    pub fn drain(&self) -> Vec<Arc<FrameSlot<F>>> {
        lock_unpoisoned(&self.slots)
            .drain()
            .map(|(_, slot)| slot)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F> Default for SlotRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::frame_slot::SlotPayload;

    #[test]
    fn test_allocate_and_get() {
        let registry: SlotRegistry<u32> = SlotRegistry::new();
        let slot = registry.allocate(4).unwrap();
        assert_eq!(slot.index(), 4);
        assert_eq!(registry.get(4).unwrap().index(), 4);
        assert!(registry.get(5).is_none());
    }

    #[test]
    fn test_duplicate_allocation_is_rejected() {
        let registry: SlotRegistry<u32> = SlotRegistry::new();
        assert!(registry.allocate(0).is_some());
        assert!(registry.allocate(0).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_reclaims_slot() {
        let registry: SlotRegistry<u32> = SlotRegistry::new();
        registry.allocate(0);
        assert!(registry.remove(0).is_some());
        assert!(registry.remove(0).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry: SlotRegistry<u32> = SlotRegistry::new();
        for i in 0..3 {
            registry.allocate(i);
        }
        assert_eq!(registry.snapshot().len(), 3);
        assert_eq!(registry.len(), 3);

        let mut drained: Vec<usize> = registry.drain().iter().map(|s| s.index()).collect();
        drained.sort_unstable();
        assert_eq!(drained, vec![0, 1, 2]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_slot_outlives_removal() {
        let registry = SlotRegistry::new();
        let held = registry.allocate(7).unwrap();
        registry.drain();
        held.gate().open(SlotPayload::Ready(1u8)).unwrap();
        assert!(!held.is_pending());
    }
}
