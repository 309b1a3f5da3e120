//! Read/write hazard tracking between dispatches.
//!
//! The tracker keeps the address ranges touched since the last barrier,
//! split into two groups: ranges from kernels already dispatched
//! (`entries[..dispatched]`) and ranges of the kernel being validated
//! (`entries[dispatched..]`).  A new range conflicts with a dispatched one
//! when they overlap and at least one side writes; the caller then inserts
//! a barrier, after which the dispatched group is dropped.  Two argument
//! ranges of the same kernel never conflict with each other.
//!
//! A capacity of zero disables tracking: every validation reports a
//! hazard.  A kernel with more arguments than slots loses its earliest
//! ranges; the kernel after it is then barriered unconditionally.

use crate::hal::MemoryRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryState {
    pub range: MemoryRange,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct MemoryDependency {
    entries: Vec<MemoryState>,
    capacity: usize,
    dispatched: usize,
    /// The current kernel overflowed the tracker.
    overflowed: bool,
    /// Barrier the next validation regardless of overlap.
    force_barrier: bool,
}

impl MemoryDependency {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            dispatched: 0,
            overflowed: false,
            force_barrier: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Start validating a new kernel: everything tracked so far belongs to
    /// dispatched kernels.
    pub fn new_kernel(&mut self) {
        self.dispatched = self.entries.len();
        if std::mem::take(&mut self.overflowed) {
            self.force_barrier = true;
        }
    }

    /// Record `range` for the current kernel; `true` means a barrier is
    /// required before the kernel runs.
    pub fn validate(&mut self, range: MemoryRange, read_only: bool) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let conflict = self.entries[..self.dispatched]
            .iter()
            .any(|e| e.range.overlaps(&range) && (!e.read_only || !read_only));
        let hazard = conflict || self.force_barrier || self.entries.len() >= self.capacity;

        if hazard {
            self.clear(false);
            if self.entries.len() >= self.capacity {
                self.entries.clear();
                self.overflowed = true;
            }
        }
        self.entries.push(MemoryState { range, read_only });
        hazard
    }

    /// Drop tracked state after a barrier.
    ///
    /// `all == false` keeps the current kernel's ranges.
    pub fn clear(&mut self, all: bool) {
        if all {
            self.entries.clear();
            self.overflowed = false;
        } else {
            self.entries.drain(..self.dispatched);
        }
        self.dispatched = 0;
        self.force_barrier = false;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ranges of already-dispatched kernels.
    pub fn dispatched(&self) -> &[MemoryState] {
        &self.entries[..self.dispatched]
    }

    /// Ranges of the kernel being validated.
    pub fn current(&self) -> &[MemoryState] {
        &self.entries[self.dispatched..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, size: u64) -> MemoryRange {
        MemoryRange::new(start, size)
    }

    #[test]
    fn write_after_write_is_a_hazard() {
        let mut dep = MemoryDependency::new(16);
        dep.new_kernel();
        assert!(!dep.validate(r(0x1000, 0x100), false));
        dep.new_kernel();
        assert!(dep.validate(r(0x1080, 0x100), false));
        // The barrier dropped the first kernel's range.
        assert_eq!(dep.len(), 1);
        assert!(dep.dispatched().is_empty());
    }

    #[test]
    fn read_after_read_is_not() {
        let mut dep = MemoryDependency::new(16);
        dep.new_kernel();
        assert!(!dep.validate(r(0x1000, 0x100), true));
        dep.new_kernel();
        assert!(!dep.validate(r(0x1000, 0x100), true));
        assert_eq!(dep.len(), 2);
    }

    #[test]
    fn read_after_write_and_write_after_read() {
        let mut dep = MemoryDependency::new(16);
        dep.new_kernel();
        dep.validate(r(0, 64), false);
        dep.new_kernel();
        assert!(dep.validate(r(32, 8), true));

        let mut dep = MemoryDependency::new(16);
        dep.new_kernel();
        dep.validate(r(0, 64), true);
        dep.new_kernel();
        assert!(dep.validate(r(0, 64), false));
    }

    #[test]
    fn arguments_of_one_kernel_do_not_conflict() {
        let mut dep = MemoryDependency::new(16);
        dep.new_kernel();
        assert!(!dep.validate(r(0, 64), false));
        assert!(!dep.validate(r(0, 64), false));
        assert_eq!(dep.current().len(), 2);
    }

    #[test]
    fn disjoint_writes_are_independent() {
        let mut dep = MemoryDependency::new(16);
        dep.new_kernel();
        dep.validate(r(0, 64), false);
        dep.new_kernel();
        assert!(!dep.validate(r(64, 64), false));
    }

    #[test]
    fn partial_clear_keeps_current_kernel() {
        let mut dep = MemoryDependency::new(16);
        dep.new_kernel();
        dep.validate(r(0, 8), true);
        dep.validate(r(8, 8), true);
        dep.new_kernel();
        dep.validate(r(100, 8), false);
        dep.clear(false);
        assert_eq!(dep.len(), 1);
        assert_eq!(dep.current()[0].range, r(100, 8));
        dep.clear(true);
        assert!(dep.is_empty());
    }

    #[test]
    fn full_tracker_forces_barrier() {
        let mut dep = MemoryDependency::new(2);
        dep.new_kernel();
        assert!(!dep.validate(r(0, 8), true));
        dep.new_kernel();
        assert!(!dep.validate(r(8, 8), true));
        dep.new_kernel();
        assert!(dep.validate(r(16, 8), true));
        assert_eq!(dep.len(), 1);
    }

    #[test]
    fn oversized_kernel_restarts_tracking() {
        let mut dep = MemoryDependency::new(2);
        dep.new_kernel();
        assert!(!dep.validate(r(0, 8), true));
        assert!(!dep.validate(r(8, 8), true));
        assert!(dep.validate(r(16, 8), true));
        assert_eq!(dep.len(), 1);
        // The dropped ranges can't be checked any more.
        dep.new_kernel();
        assert!(dep.validate(r(0, 8), false));
        dep.new_kernel();
        assert!(!dep.validate(r(64, 8), false));
    }

    #[test]
    fn zero_capacity_always_hazards() {
        let mut dep = MemoryDependency::new(0);
        dep.new_kernel();
        assert!(dep.validate(r(0, 8), true));
        assert!(dep.is_empty());
    }
}
