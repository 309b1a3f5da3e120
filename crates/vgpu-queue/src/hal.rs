//! Hardware abstraction consumed by the submission engine.
//!
//! A [`HardwareDevice`] hands out one [`HardwareQueue`] per engine.  Queues
//! own the driver-side fences and command submission entry points; the
//! engine above never talks to a driver directly.  [`crate::sim`] provides a
//! deterministic in-process implementation.

use crate::error::HalError;
use std::sync::Arc;
use std::time::Duration;

// ── Engines ─────────────────────────────────────────────────────────

/// Hardware engine a command ring submits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineType {
    /// Compute / graphics engine.
    Main = 0,
    /// DMA copy engine.
    Sdma = 1,
}

/// Number of engines per virtual GPU.
pub const ALL_ENGINES: usize = 2;

impl EngineType {
    pub const ALL: [EngineType; ALL_ENGINES] = [EngineType::Main, EngineType::Sdma];

    pub const fn index(self) -> usize {
        self as usize
    }
}

// ── Handles ─────────────────────────────────────────────────────────

/// Opaque driver fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u64);

/// Driver-level identifier of a completed `submit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionId(pub u64);

/// Identifier of a device memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

/// Slot in the device timestamp buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimestampId(pub u64);

/// Result of querying or waiting on a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    Signaled,
    /// The fence was never attached to a submission.
    NeverSubmitted,
    NotReady,
    Timeout,
    Error(i32),
}

impl FenceStatus {
    /// `true` when the work guarded by the fence has retired (or never
    /// existed).
    pub fn is_complete(self) -> bool {
        matches!(self, FenceStatus::Signaled | FenceStatus::NeverSubmitted)
    }
}

// ── Memory ──────────────────────────────────────────────────────────

/// Half-open GPU virtual address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, end: start.saturating_add(size) }
    }

    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Half-open interval intersection; empty ranges overlap nothing.
    pub fn overlaps(&self, other: &MemoryRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A device allocation referenced by recorded commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub id: AllocationId,
    pub address: u64,
    pub size: u64,
}

impl Allocation {
    pub const fn new(id: u64, address: u64, size: u64) -> Self {
        Self { id: AllocationId(id), address, size }
    }

    pub const fn range(&self) -> MemoryRange {
        MemoryRange::new(self.address, self.size)
    }
}

// ── Packets ─────────────────────────────────────────────────────────

/// A command recorded into a command buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Dispatch {
        kernel: Arc<str>,
        /// Work-item offset of this dispatch within the logical grid.
        offset: [u32; 3],
        grid: [u32; 3],
        /// Occupancy limit in waves per shader array; `None` = hardware max.
        waves_per_sh: Option<u32>,
    },
    Barrier {
        flush_l2: bool,
    },
    Copy {
        src: MemoryRange,
        dst: MemoryRange,
    },
    TimestampBegin(TimestampId),
    TimestampEnd(TimestampId),
}

impl Packet {
    pub fn is_barrier(&self) -> bool {
        matches!(self, Packet::Barrier { .. })
    }
}

// ── Traits ──────────────────────────────────────────────────────────

/// One hardware queue (engine instance).
///
/// `query_status`, `wait` and `read_timestamp` take `&self`; drivers allow
/// those from any thread.
pub trait HardwareQueue: Send {
    fn engine(&self) -> EngineType;

    fn acquire_fence(&mut self) -> Result<FenceHandle, HalError>;

    fn release_fence(&mut self, fence: FenceHandle);

    /// Submit `packets`; the fence is reset and signals when they retire.
    fn submit(&mut self, packets: &[Packet], fence: FenceHandle)
        -> Result<SubmissionId, HalError>;

    /// Non-blocking status query.
    fn query_status(&self, fence: FenceHandle) -> FenceStatus;

    /// Blocking wait bounded by `timeout`.
    fn wait(&self, fence: FenceHandle, timeout: Duration) -> FenceStatus;

    /// Declare allocations resident for upcoming submissions.
    fn make_resident(&mut self, allocations: &[Allocation]) -> Result<(), HalError>;

    /// Withdraw residency.
    fn evict(&mut self, allocations: &[AllocationId]);

    /// `(begin, end)` ticks once both timestamps of `ts` have been written.
    fn read_timestamp(&self, ts: TimestampId) -> Option<(u64, u64)>;
}

/// Device-level factory for hardware queues.
pub trait HardwareDevice {
    fn create_queue(&self, engine: EngineType) -> Result<Box<dyn HardwareQueue>, HalError>;
}
