//! Memory references held by in-flight command buffers.
//!
//! Every allocation recorded into a command buffer is stamped with that
//! buffer's id.  The ring declares newly referenced allocations resident
//! before submitting, and once the retired id passes an allocation's stamp
//! the reference is dropped and residency withdrawn.

use crate::hal::{Allocation, AllocationId};
use std::collections::HashMap;

/// An allocation and the newest buffer that uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReference {
    pub allocation: Allocation,
    /// Newest command buffer id that uses the allocation.
    pub last_buffer_id: u64,
}

/// Allocations referenced by a ring's in-flight buffers.
#[derive(Debug, Default)]
pub struct MemoryReferences {
    entries: HashMap<AllocationId, MemoryReference>,
    pending: Vec<Allocation>,
    resident_bytes: u64,
}

impl MemoryReferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp `allocation` with `buffer_id`; returns `true` if it was not
    /// referenced before.
    pub fn add(&mut self, allocation: &Allocation, buffer_id: u64) -> bool {
        match self.entries.get_mut(&allocation.id) {
            Some(entry) => {
                entry.last_buffer_id = entry.last_buffer_id.max(buffer_id);
                false
            }
            None => {
                self.entries.insert(
                    allocation.id,
                    MemoryReference { allocation: *allocation, last_buffer_id: buffer_id },
                );
                self.pending.push(*allocation);
                self.resident_bytes += allocation.size;
                true
            }
        }
    }

    /// Allocations not yet declared resident.
    pub fn take_pending(&mut self) -> Vec<Allocation> {
        std::mem::take(&mut self.pending)
    }

    /// Drop every reference whose last use is at or below `retired_id`.
    pub fn retire(&mut self, retired_id: u64) -> Vec<AllocationId> {
        let done: Vec<AllocationId> = self
            .entries
            .values()
            .filter(|r| r.last_buffer_id <= retired_id)
            .map(|r| r.allocation.id)
            .collect();
        for id in &done {
            self.forget(*id);
        }
        done
    }

    /// Remove one reference regardless of its stamp.
    pub fn remove(&mut self, id: AllocationId) -> Option<MemoryReference> {
        self.forget(id)
    }

    /// Drop everything, returning the ids that were referenced.
    pub fn drain(&mut self) -> Vec<AllocationId> {
        self.pending.clear();
        self.resident_bytes = 0;
        self.entries.drain().map(|(id, _)| id).collect()
    }

    /// Reference held for `id`.
    pub fn get(&self, id: AllocationId) -> Option<&MemoryReference> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total size of referenced allocations.
    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    /// References sorted by stamp, oldest first.
    pub fn sorted(&self) -> Vec<MemoryReference> {
        let mut refs: Vec<_> = self.entries.values().copied().collect();
        refs.sort_by_key(|r| (r.last_buffer_id, r.allocation.id));
        refs
    }

    fn forget(&mut self, id: AllocationId) -> Option<MemoryReference> {
        let removed = self.entries.remove(&id)?;
        self.pending.retain(|a| a.id != id);
        self.resident_bytes = self.resident_bytes.saturating_sub(removed.allocation.size);
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restamp_extends_lifetime() {
        let mut refs = MemoryReferences::new();
        let a = Allocation::new(1, 0x1000, 64);
        assert!(refs.add(&a, 3));
        assert!(!refs.add(&a, 5));
        assert_eq!(refs.take_pending(), vec![a]);
        assert!(refs.retire(4).is_empty());
        assert_eq!(refs.retire(5), vec![a.id]);
        assert!(refs.is_empty());
        assert_eq!(refs.resident_bytes(), 0);
    }

    #[test]
    fn remove_before_flush_clears_pending() {
        let mut refs = MemoryReferences::new();
        let a = Allocation::new(1, 0, 16);
        let b = Allocation::new(2, 16, 16);
        refs.add(&a, 1);
        refs.add(&b, 1);
        assert_eq!(refs.resident_bytes(), 32);
        refs.remove(a.id);
        assert_eq!(refs.take_pending(), vec![b]);
        assert_eq!(refs.resident_bytes(), 16);
    }
}
