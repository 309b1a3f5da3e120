//! Completion batches.
//!
//! Each host-side flush records a [`CommandBatch`]: the host command list
//! it covers plus a copy of every engine's latest event at that moment.
//! Batches retire in order once all of their events are done; spent
//! batches go to a free list for reuse.

use crate::event::GpuEvent;
use crate::hal::{TimestampId, ALL_ENGINES};
use crate::profiling::ProfiledDispatch;
use std::collections::VecDeque;

/// Identifies the host command list a batch completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandListHead(pub u64);

#[derive(Debug, Default)]
pub struct CommandBatch {
    head: Option<CommandListHead>,
    events: [GpuEvent; ALL_ENGINES],
    last_timestamp: Option<TimestampId>,
    pub(crate) profiles: Vec<ProfiledDispatch>,
}

impl CommandBatch {
    /// The events are copied; later changes to `events` don't affect the
    /// batch.
    pub fn new(
        head: Option<CommandListHead>,
        events: &[GpuEvent; ALL_ENGINES],
        last_timestamp: Option<TimestampId>,
    ) -> Self {
        Self { head, events: *events, last_timestamp, profiles: Vec::new() }
    }

    /// Reinitialize a recycled batch.
    pub fn init(
        &mut self,
        head: Option<CommandListHead>,
        events: &[GpuEvent; ALL_ENGINES],
        last_timestamp: Option<TimestampId>,
    ) {
        self.head = head;
        self.events = *events;
        self.last_timestamp = last_timestamp;
        self.profiles.clear();
    }

    pub fn head(&self) -> Option<CommandListHead> {
        self.head
    }

    pub fn events(&self) -> &[GpuEvent; ALL_ENGINES] {
        &self.events
    }

    pub fn last_timestamp(&self) -> Option<TimestampId> {
        self.last_timestamp
    }
}

/// What the caller gets back when a batch retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedBatch {
    pub head: Option<CommandListHead>,
    pub events: [GpuEvent; ALL_ENGINES],
}

/// Pending batches (oldest first) plus the free list.
#[derive(Debug, Default)]
pub struct BatchQueue {
    pending: VecDeque<CommandBatch>,
    free: Vec<CommandBatch>,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a batch from the free list (or allocate one) and initialize it.
    pub fn acquire(
        &mut self,
        head: Option<CommandListHead>,
        events: &[GpuEvent; ALL_ENGINES],
        last_timestamp: Option<TimestampId>,
    ) -> CommandBatch {
        match self.free.pop() {
            Some(mut batch) => {
                batch.init(head, events, last_timestamp);
                batch
            }
            None => CommandBatch::new(head, events, last_timestamp),
        }
    }

    pub fn push(&mut self, batch: CommandBatch) {
        self.pending.push_back(batch);
    }

    pub fn front(&self) -> Option<&CommandBatch> {
        self.pending.front()
    }

    pub fn pop_front(&mut self) -> Option<CommandBatch> {
        self.pending.pop_front()
    }

    pub fn recycle(&mut self, mut batch: CommandBatch) {
        batch.profiles.clear();
        self.free.push(batch);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}
