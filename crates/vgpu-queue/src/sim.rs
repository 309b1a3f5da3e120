//! Simulated hardware.
//!
//! A deterministic in-process [`HardwareDevice`] used by tests and by
//! hosts without a driver.  Submissions on each engine retire in order;
//! when they retire their packets "execute" against a nanosecond clock so
//! timestamp pairs around a dispatch measure the latency model's answer
//! for that kernel and occupancy.

use crate::error::HalError;
use crate::hal::{
    Allocation, AllocationId, EngineType, FenceHandle, FenceStatus, HardwareDevice,
    HardwareQueue, Packet, SubmissionId, TimestampId, ALL_ENGINES,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

/// `(kernel, waves_per_sh) -> nanoseconds`.
pub type LatencyModel = Arc<dyn Fn(&str, Option<u32>) -> u64 + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Work retires as soon as it is submitted.
    Immediate,
    /// Work retires when a blocking wait targets it (or on `complete_*`).
    OnWait,
    /// Work retires only through `complete_*`; blocking waits time out.
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub submits: u64,
    pub waits: u64,
    pub status_queries: u64,
    /// Submissions that reused a fence still in flight (rejected).
    pub reuse_violations: u64,
    pub resident_calls: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedBuffer {
    pub engine: EngineType,
    pub submission: SubmissionId,
    pub packets: Vec<Packet>,
}

struct InFlight {
    fence: FenceHandle,
    log_index: usize,
}

struct SimState {
    mode: CompletionMode,
    latency: LatencyModel,
    next_fence: u64,
    next_submission: u64,
    fences: HashMap<FenceHandle, FenceStatus>,
    in_flight: [VecDeque<InFlight>; ALL_ENGINES],
    log: Vec<SubmittedBuffer>,
    resident: HashMap<AllocationId, Allocation>,
    timestamps: HashMap<TimestampId, (Option<u64>, Option<u64>)>,
    clock_ns: u64,
    fence_error: Option<i32>,
    unavailable: [bool; ALL_ENGINES],
    stats: SimStats,
}

impl SimState {
    fn complete_next(&mut self, engine: EngineType) -> bool {
        let Some(job) = self.in_flight[engine.index()].pop_front() else {
            return false;
        };
        let packets = std::mem::take(&mut self.log[job.log_index].packets);
        for packet in &packets {
            self.execute(packet);
        }
        self.log[job.log_index].packets = packets;
        if let Some(status) = self.fences.get_mut(&job.fence) {
            *status = FenceStatus::Signaled;
        }
        trace!(?engine, fence = job.fence.0, "sim retired submission");
        true
    }

    fn complete_through(&mut self, engine: EngineType, fence: FenceHandle) {
        while self.in_flight[engine.index()].iter().any(|j| j.fence == fence) {
            self.complete_next(engine);
        }
    }

    fn execute(&mut self, packet: &Packet) {
        match packet {
            Packet::TimestampBegin(ts) => {
                self.timestamps.entry(*ts).or_default().0 = Some(self.clock_ns);
            }
            Packet::TimestampEnd(ts) => {
                self.timestamps.entry(*ts).or_default().1 = Some(self.clock_ns);
            }
            Packet::Dispatch { kernel, waves_per_sh, .. } => {
                let ns = (self.latency)(&**kernel, *waves_per_sh);
                self.clock_ns += ns;
            }
            Packet::Copy { src, .. } => {
                self.clock_ns += src.len() / 64 + 1;
            }
            Packet::Barrier { .. } => {
                self.clock_ns += 1;
            }
        }
    }

    fn status(&self, fence: FenceHandle) -> FenceStatus {
        match self.fences.get(&fence) {
            None => FenceStatus::Error(-1),
            Some(FenceStatus::Pending) => match self.fence_error {
                Some(code) => FenceStatus::Error(code),
                None => FenceStatus::Pending,
            },
            Some(status) => *status,
        }
    }
}

/// Simulated device; clones share the same hardware state.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    /// Immediate completion, 1 µs per dispatch.
    pub fn new() -> Self {
        Self::with_mode(CompletionMode::Immediate)
    }

    pub fn with_mode(mode: CompletionMode) -> Self {
        let state = SimState {
            mode,
            latency: Arc::new(|_: &str, _: Option<u32>| 1_000),
            next_fence: 1,
            next_submission: 1,
            fences: HashMap::new(),
            in_flight: Default::default(),
            log: Vec::new(),
            resident: HashMap::new(),
            timestamps: HashMap::new(),
            clock_ns: 0,
            fence_error: None,
            unavailable: [false; ALL_ENGINES],
            stats: SimStats::default(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn with_latency<F>(self, f: F) -> Self
    where
        F: Fn(&str, Option<u32>) -> u64 + Send + Sync + 'static,
    {
        self.lock().latency = Arc::new(f);
        self
    }

    pub fn set_mode(&self, mode: CompletionMode) {
        self.lock().mode = mode;
    }

    /// Make every pending fence report `Error(code)`; `None` clears it.
    pub fn inject_fence_error(&self, code: Option<i32>) {
        self.lock().fence_error = code;
    }

    pub fn disable_engine(&self, engine: EngineType) {
        self.lock().unavailable[engine.index()] = true;
    }

    /// Retire the oldest in-flight submission on `engine`.
    pub fn complete_next(&self, engine: EngineType) -> bool {
        self.lock().complete_next(engine)
    }

    /// Retire everything in flight on every engine.
    pub fn complete_all(&self) {
        let mut state = self.lock();
        for engine in EngineType::ALL {
            while state.complete_next(engine) {}
        }
    }

    pub fn in_flight(&self, engine: EngineType) -> usize {
        self.lock().in_flight[engine.index()].len()
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats.clone()
    }

    pub fn submissions(&self, engine: EngineType) -> Vec<SubmittedBuffer> {
        self.lock().log.iter().filter(|s| s.engine == engine).cloned().collect()
    }

    pub fn is_resident(&self, id: AllocationId) -> bool {
        self.lock().resident.contains_key(&id)
    }

    pub fn resident_count(&self) -> usize {
        self.lock().resident.len()
    }

    pub fn live_fences(&self) -> usize {
        self.lock().fences.len()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimulatedDevice")
            .field("mode", &state.mode)
            .field("live_fences", &state.fences.len())
            .field("submissions", &state.log.len())
            .field("stats", &state.stats)
            .finish()
    }
}

impl HardwareDevice for SimulatedDevice {
    fn create_queue(&self, engine: EngineType) -> Result<Box<dyn HardwareQueue>, HalError> {
        if self.lock().unavailable[engine.index()] {
            return Err(HalError::EngineUnavailable(engine));
        }
        Ok(Box::new(SimulatedQueue { engine, device: self.clone() }))
    }
}

/// One engine of a [`SimulatedDevice`].
pub struct SimulatedQueue {
    engine: EngineType,
    device: SimulatedDevice,
}

impl HardwareQueue for SimulatedQueue {
    fn engine(&self) -> EngineType {
        self.engine
    }

    fn acquire_fence(&mut self) -> Result<FenceHandle, HalError> {
        let mut state = self.device.lock();
        let fence = FenceHandle(state.next_fence);
        state.next_fence += 1;
        state.fences.insert(fence, FenceStatus::NeverSubmitted);
        Ok(fence)
    }

    fn release_fence(&mut self, fence: FenceHandle) {
        self.device.lock().fences.remove(&fence);
    }

    fn submit(&mut self, packets: &[Packet], fence: FenceHandle) -> Result<SubmissionId, HalError> {
        let mut state = self.device.lock();
        match state.fences.get(&fence) {
            None => return Err(HalError::UnknownFence(fence)),
            Some(FenceStatus::Pending) => {
                state.stats.reuse_violations += 1;
                return Err(HalError::Rejected(format!("fence {} is still in flight", fence.0)));
            }
            Some(_) => {}
        }
        let submission = SubmissionId(state.next_submission);
        state.next_submission += 1;
        state.stats.submits += 1;
        state.log.push(SubmittedBuffer { engine: self.engine, submission, packets: packets.to_vec() });
        let log_index = state.log.len() - 1;
        state.fences.insert(fence, FenceStatus::Pending);
        state.in_flight[self.engine.index()].push_back(InFlight { fence, log_index });
        if state.mode == CompletionMode::Immediate {
            state.complete_through(self.engine, fence);
        }
        Ok(submission)
    }

    fn query_status(&self, fence: FenceHandle) -> FenceStatus {
        let mut state = self.device.lock();
        state.stats.status_queries += 1;
        state.status(fence)
    }

    fn wait(&self, fence: FenceHandle, _timeout: Duration) -> FenceStatus {
        let mut state = self.device.lock();
        state.stats.waits += 1;
        match state.status(fence) {
            FenceStatus::Pending => match state.mode {
                CompletionMode::Manual => FenceStatus::Timeout,
                CompletionMode::Immediate | CompletionMode::OnWait => {
                    state.complete_through(self.engine, fence);
                    state.status(fence)
                }
            },
            other => other,
        }
    }

    fn make_resident(&mut self, allocations: &[Allocation]) -> Result<(), HalError> {
        let mut state = self.device.lock();
        state.stats.resident_calls += 1;
        for a in allocations {
            state.resident.insert(a.id, *a);
        }
        Ok(())
    }

    fn evict(&mut self, allocations: &[AllocationId]) {
        let mut state = self.device.lock();
        for id in allocations {
            if state.resident.remove(id).is_some() {
                state.stats.evictions += 1;
            }
        }
    }

    fn read_timestamp(&self, ts: TimestampId) -> Option<(u64, u64)> {
        match self.device.lock().timestamps.get(&ts) {
            Some((Some(begin), Some(end))) => Some((*begin, *end)),
            _ => None,
        }
    }
}
