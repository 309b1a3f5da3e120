//! Per-engine ring of command buffers.
//!
//! Buffer ids grow monotonically from [`START_BUFFER_ID`]; id `n` always
//! lives in slot `n % capacity`.  Submitting the current buffer advances to
//! the next slot and blocks until that slot's previous submission has
//! retired, which bounds in-flight work to `capacity` buffers.  The retired
//! id is a conservative lower bound: every id at or below it has completed.
//!
//! A failed reuse wait leaves the new current slot holding its previous
//! submission.  The ring never records into or resubmits such a slot; the
//! next `record` or `flush` waits for it again and only then recycles it.

use crate::command_buffer::{CommandBuffer, CommandBufferState};
use crate::error::{check_fence, QueueError, Result};
use crate::fence::{wait_for_fence, FenceWaitPolicy, WaitMode};
use crate::hal::{
    Allocation, AllocationId, EngineType, FenceStatus, HardwareQueue, Packet, TimestampId,
};
use crate::residency::MemoryReferences;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use vgpu_config::QueueConfig;

/// First id handed out by a fresh ring.
pub const START_BUFFER_ID: u64 = 1;

/// Fixed ring of command buffers, one fence per slot, for one engine.
pub struct CommandRing {
    engine: EngineType,
    queue: Box<dyn HardwareQueue>,
    buffers: Vec<CommandBuffer>,
    current_id: u64,
    retired_id: u64,
    cmd_count: u32,
    max_commands: u32,
    residency_limit: u64,
    wait_policy: FenceWaitPolicy,
    analyze_hang: bool,
    references: MemoryReferences,
    last_kernel: Option<Arc<str>>,
    closed: bool,
}

impl CommandRing {
    /// Build a ring on `queue`, acquiring one fence per slot.
    pub fn new(queue: Box<dyn HardwareQueue>, cfg: &QueueConfig) -> Result<Self> {
        let capacity = cfg.max_cmd_buffers as usize;
        if capacity < 2 {
            return Err(QueueError::InvalidArgument(format!(
                "a command ring needs at least 2 buffers, got {capacity}"
            )));
        }
        let mut ring = Self {
            engine: queue.engine(),
            queue,
            buffers: Vec::with_capacity(capacity),
            current_id: START_BUFFER_ID,
            retired_id: 0,
            cmd_count: 0,
            max_commands: cfg.max_commands,
            residency_limit: cfg.residency_limit,
            wait_policy: FenceWaitPolicy::from(cfg),
            analyze_hang: cfg.analyze_hang,
            references: MemoryReferences::new(),
            last_kernel: None,
            closed: false,
        };
        for slot in 0..capacity {
            let fence = ring.queue.acquire_fence()?;
            ring.buffers.push(CommandBuffer::new(slot, fence));
        }
        debug!(engine = ?ring.engine, capacity, max_commands = ring.max_commands, "command ring ready");
        Ok(ring)
    }

    /// Engine this ring submits to.
    pub fn engine(&self) -> EngineType {
        self.engine
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    /// Id of the buffer currently recording.
    pub fn buffer_id(&self) -> u64 {
        self.current_id
    }

    /// Newest id known to have completed.
    pub fn retired_id(&self) -> u64 {
        self.retired_id
    }

    /// Commands submitted into the current buffer.
    pub fn command_count(&self) -> u32 {
        self.cmd_count
    }

    /// Allocations referenced by buffers not yet retired.
    pub fn references(&self) -> &MemoryReferences {
        &self.references
    }

    /// Name of the last kernel recorded, for hang reports.
    pub fn last_kernel(&self) -> Option<&str> {
        self.last_kernel.as_deref()
    }

    /// `true` after [`shutdown`](Self::shutdown).
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// `true` if the current buffer holds anything worth submitting.
    pub fn has_pending_work(&self) -> bool {
        if self.closed || self.buffers.is_empty() {
            return false;
        }
        let buffer = &self.buffers[self.slot_of(self.current_id)];
        buffer.state() == CommandBufferState::Recording && (self.cmd_count > 0 || !buffer.is_empty())
    }

    /// Append `packet` to the current buffer.
    pub fn record(&mut self, packet: Packet) -> Result<()> {
        self.ensure_open()?;
        self.reclaim_current()?;
        let slot = self.slot_of(self.current_id);
        self.buffers[slot].record(packet)
    }

    /// Count one command; flush when over budget or `force_flush`.
    ///
    /// Returns the id of the buffer the command landed in.
    pub fn submit(&mut self, force_flush: bool) -> Result<u64> {
        self.ensure_open()?;
        let id = self.current_id;
        self.cmd_count += 1;
        let over_residency = self.residency_limit > 0
            && self.references.resident_bytes() > self.residency_limit;
        if self.cmd_count > self.max_commands || force_flush || over_residency {
            trace!(
                engine = ?self.engine,
                commands = self.cmd_count,
                force_flush,
                over_residency,
                "flush on submit"
            );
            self.flush()?;
        }
        Ok(id)
    }

    /// Count a barrier command; never flushes.
    pub fn submit_barrier(&mut self) -> u64 {
        self.cmd_count += 1;
        self.current_id
    }

    /// Submit the current buffer and move to the next slot, waiting for
    /// that slot's previous submission to retire first.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.reclaim_current()? && !self.has_pending_work() {
            return Ok(());
        }
        let id = self.current_id;
        let slot = self.slot_of(id);

        let pending = self.references.take_pending();
        if !pending.is_empty() {
            self.queue.make_resident(&pending)?;
        }

        let buffer = &mut self.buffers[slot];
        self.queue.submit(buffer.packets(), buffer.fence()).map_err(|source| {
            QueueError::Submit { engine: self.engine, buffer_id: id, source }
        })?;
        buffer.mark_submitted(id)?;
        debug!(
            engine = ?self.engine,
            buffer_id = id,
            slot,
            packets = buffer.packets().len(),
            commands = self.cmd_count,
            "submitted command buffer"
        );

        self.current_id += 1;
        self.cmd_count = 0;
        self.recycle_slot(self.slot_of(self.current_id))
    }

    /// Non-blocking completion check for buffer `id`.
    ///
    /// Ids at or below the retired id, and ids not handed out yet, are
    /// done.  Asking about the buffer still recording submits it first when
    /// it holds commands.
    pub fn is_done(&mut self, id: u64) -> Result<bool> {
        if id <= self.retired_id || id > self.current_id || self.closed {
            return Ok(true);
        }
        if id == self.current_id {
            if !self.has_pending_work() {
                // Nothing recorded under this id.
                return Ok(true);
            }
            self.flush()?;
        }
        let fence = self.buffers[self.slot_of(id)].fence();
        match self.queue.query_status(fence) {
            s if s.is_complete() => {
                self.retire_to(id);
                Ok(true)
            }
            status @ FenceStatus::Error(_) => {
                Err(QueueError::FenceFailed { engine: self.engine, buffer_id: id, status })
            }
            _ => Ok(false),
        }
    }

    /// Block until buffer `id` has retired.
    pub fn wait_for_event(&mut self, id: u64) -> Result<()> {
        if self.is_done(id)? {
            return Ok(());
        }
        self.wait_slot(self.slot_of(id), WaitMode::Poll)?;
        self.retire_to(id);
        Ok(())
    }

    /// Reference `allocation` from the current buffer.
    pub fn add_mem_ref(&mut self, allocation: &Allocation) {
        if self.closed {
            return;
        }
        self.references.add(allocation, self.current_id);
        let slot = self.slot_of(self.current_id);
        self.buffers[slot].add_reference(allocation.id);
    }

    /// Forget `id` immediately and withdraw its residency.
    pub fn remove_mem_ref(&mut self, id: AllocationId) -> bool {
        if self.references.remove(id).is_some() {
            self.queue.evict(&[id]);
            true
        } else {
            false
        }
    }

    /// Remember the kernel being recorded.
    pub fn set_last_kernel(&mut self, name: Arc<str>) {
        self.last_kernel = Some(name);
    }

    /// Timestamp pair written by this engine, once both halves landed.
    pub fn read_timestamp(&self, ts: TimestampId) -> Option<(u64, u64)> {
        self.queue.read_timestamp(ts)
    }

    /// Log every outstanding reference; used when a fence hangs.
    pub fn dump_memory_references(&self) {
        warn!(
            engine = ?self.engine,
            last_kernel = self.last_kernel.as_deref().unwrap_or("<none>"),
            current = self.current_id,
            retired = self.retired_id,
            references = self.references.len(),
            "outstanding memory references"
        );
        for r in self.references.sorted() {
            warn!(
                allocation = r.allocation.id.0,
                address = format_args!("{:#x}", r.allocation.address),
                size = r.allocation.size,
                last_buffer_id = r.last_buffer_id,
                "  referenced"
            );
        }
    }

    /// Submit what's left, drain every fence and release them.
    ///
    /// Idempotent.  The first failure is returned but draining continues.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut result = if self.has_pending_work() { self.flush() } else { Ok(()) };
        for slot in 0..self.buffers.len() {
            let drained = self.wait_slot(slot, WaitMode::Reuse);
            if result.is_ok() {
                result = drained;
            }
        }
        if result.is_ok() {
            self.retired_id = self.current_id.saturating_sub(1);
        }

        let evicted = self.references.drain();
        if !evicted.is_empty() {
            self.queue.evict(&evicted);
        }
        for buffer in self.buffers.drain(..) {
            self.queue.release_fence(buffer.fence());
        }
        self.closed = true;
        debug!(engine = ?self.engine, retired = self.retired_id, ok = result.is_ok(), "command ring shut down");
        result
    }

    // ── internals ───────────────────────────────────────────────────

    fn slot_of(&self, id: u64) -> usize {
        (id % self.buffers.len() as u64) as usize
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(QueueError::CommandBuffer(format!(
                "{:?} ring is shut down",
                self.engine
            )));
        }
        Ok(())
    }

    /// Wait for `slot`'s previous submission, advance the retired id and
    /// make the slot recordable.
    fn recycle_slot(&mut self, slot: usize) -> Result<()> {
        self.wait_slot(slot, WaitMode::Reuse)?;
        let capacity = self.capacity() as u64;
        if self.current_id > capacity && self.retired_id < self.current_id - capacity {
            self.retired_id = self.current_id - capacity;
        }
        self.buffers[slot].reset();
        self.release_retired();
        Ok(())
    }

    /// Recycle the current slot if an earlier reuse wait on it failed.
    /// `true` when a stale submission was cleared.
    fn reclaim_current(&mut self) -> Result<bool> {
        let slot = self.slot_of(self.current_id);
        if self.buffers[slot].state() == CommandBufferState::Recording {
            return Ok(false);
        }
        debug!(engine = ?self.engine, buffer_id = self.current_id, slot, "retrying reuse wait");
        self.recycle_slot(slot)?;
        self.cmd_count = 0;
        Ok(true)
    }

    fn retire_to(&mut self, id: u64) {
        if id > self.retired_id {
            self.retired_id = id;
            self.release_retired();
        }
    }

    fn release_retired(&mut self) {
        let evicted = self.references.retire(self.retired_id);
        if !evicted.is_empty() {
            trace!(engine = ?self.engine, count = evicted.len(), retired = self.retired_id, "evict");
            self.queue.evict(&evicted);
        }
    }

    fn wait_slot(&self, slot: usize, mode: WaitMode) -> Result<()> {
        let buffer = &self.buffers[slot];
        let buffer_id = buffer.submitted_id().unwrap_or(0);
        let status = wait_for_fence(self.queue.as_ref(), buffer.fence(), mode, &self.wait_policy);
        if status.is_complete() {
            return Ok(());
        }
        match status {
            FenceStatus::Error(code) => {
                error!(engine = ?self.engine, buffer_id, code, "fence wait failed");
            }
            _ => {
                warn!(
                    engine = ?self.engine,
                    buffer_id,
                    ?status,
                    timeout = ?self.wait_policy.timeout,
                    "command buffer fence isn't ready"
                );
                if self.analyze_hang {
                    self.dump_memory_references();
                }
            }
        }
        check_fence(status, self.engine, buffer_id, self.wait_policy.timeout)
    }
}

impl Drop for CommandRing {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(engine = ?self.engine, error = %e, "command ring shutdown failed");
        }
    }
}

impl std::fmt::Debug for CommandRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRing")
            .field("engine", &self.engine)
            .field("capacity", &self.buffers.len())
            .field("current_id", &self.current_id)
            .field("retired_id", &self.retired_id)
            .field("cmd_count", &self.cmd_count)
            .field("references", &self.references.len())
            .finish()
    }
}
