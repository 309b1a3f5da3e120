//! Virtual GPU execution context.
//!
//! A [`VirtualGpu`] owns one [`CommandRing`] per engine, the memory hazard
//! tracker for the main engine, the list of pending completion batches and
//! the dispatches waiting for profiling data.  All of it sits behind a
//! single execution lock; every public operation takes the lock for its
//! whole duration.

use crate::batch::{BatchQueue, CommandListHead, CompletedBatch};
use crate::error::{QueueError, Result};
use crate::event::GpuEvent;
use crate::hal::{
    Allocation, AllocationId, EngineType, HardwareDevice, MemoryRange, Packet, TimestampId,
    ALL_ENGINES,
};
use crate::memory_dependency::MemoryDependency;
use crate::profiling::{lock_controller, ProfiledDispatch, SharedController};
use crate::ring::CommandRing;
use crate::workload::{split_grid, WorkloadFlush};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace};
use vgpu_config::QueueConfig;

// ── Dispatch description ────────────────────────────────────────────

/// A kernel argument that touches device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelArg {
    pub allocation: Allocation,
    pub read_only: bool,
}

/// One kernel launch.
#[derive(Clone)]
pub struct KernelDispatch {
    pub kernel: Arc<str>,
    pub grid: [u32; 3],
    /// Estimated instructions per thread, for workload accounting.
    pub instructions: u32,
    pub args: Vec<KernelArg>,
    pub controller: Option<SharedController>,
}

impl KernelDispatch {
    /// Dispatch with no arguments and one instruction per thread.
    pub fn new(kernel: impl Into<Arc<str>>, grid: [u32; 3]) -> Self {
        Self { kernel: kernel.into(), grid, instructions: 1, args: Vec::new(), controller: None }
    }

    /// Add a memory argument.
    pub fn arg(mut self, allocation: Allocation, read_only: bool) -> Self {
        self.args.push(KernelArg { allocation, read_only });
        self
    }

    /// Set the per-thread instruction estimate.
    pub fn instructions(mut self, instructions: u32) -> Self {
        self.instructions = instructions;
        self
    }

    /// Attach an occupancy controller for this kernel.
    pub fn controller(mut self, controller: SharedController) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Total threads in the grid.
    pub fn threads(&self) -> u64 {
        self.grid.iter().map(|&d| d as u64).product()
    }
}

impl std::fmt::Debug for KernelDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelDispatch")
            .field("kernel", &self.kernel)
            .field("grid", &self.grid)
            .field("instructions", &self.instructions)
            .field("args", &self.args)
            .field("controlled", &self.controller.is_some())
            .finish()
    }
}

// ── VirtualGpu ──────────────────────────────────────────────────────

/// A device queue: one command ring per engine behind a single lock.
pub struct VirtualGpu {
    index: u32,
    state: Mutex<ExecutionState>,
}

impl VirtualGpu {
    /// Create a queue on `device` with one ring per engine.
    pub fn new(device: &dyn HardwareDevice, cfg: &QueueConfig, index: u32) -> Result<Self> {
        let mut rings = Vec::with_capacity(ALL_ENGINES);
        for engine in EngineType::ALL {
            rings.push(CommandRing::new(device.create_queue(engine)?, cfg)?);
        }
        info!(
            index,
            buffers = cfg.max_cmd_buffers,
            dependency_slots = cfg.mem_dependency_slots,
            "virtual GPU created"
        );
        let state = ExecutionState {
            index,
            rings,
            events: [GpuEvent::invalid(); ALL_ENGINES],
            dependency: MemoryDependency::new(cfg.mem_dependency_slots),
            batches: BatchQueue::new(),
            profiles: Vec::new(),
            busy: HashMap::new(),
            sdma_range: None,
            workload: WorkloadFlush::new(cfg),
            next_timestamp: 1,
            open_timestamp: [None; ALL_ENGINES],
            last_timestamp: None,
            flush_on_execution: cfg.flush_on_execution,
            shut_down: false,
        };
        Ok(Self { index, state: Mutex::new(state) })
    }

    /// Queue index on the device.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Validate arguments, record the dispatch and return its event.
    pub fn submit_kernel(&self, dispatch: &KernelDispatch) -> Result<GpuEvent> {
        let mut s = self.lock_live()?;
        s.submit_kernel(dispatch)
    }

    /// Copy `src` into the start of `dst` on the DMA engine.
    pub fn submit_copy(&self, src: &Allocation, dst: &Allocation) -> Result<GpuEvent> {
        let mut s = self.lock_live()?;
        s.submit_copy(src, dst)
    }

    /// Record a barrier on the main engine.
    pub fn add_barrier(&self, flush_l2: bool) -> Result<()> {
        let mut s = self.lock_live()?;
        s.add_barrier(EngineType::Main, flush_l2)
    }

    /// Open a timestamp around the next command on `engine`.
    pub fn event_begin(&self, engine: EngineType) -> Result<TimestampId> {
        let mut s = self.lock_live()?;
        s.event_begin(engine)
    }

    /// Close the command on `engine` and return its event.
    pub fn event_end(&self, engine: EngineType, force_flush: bool) -> Result<GpuEvent> {
        let mut s = self.lock_live()?;
        s.event_end(engine, force_flush)
    }

    /// Block until `event` retires; invalidates it.
    pub fn wait_for_event(&self, event: &mut GpuEvent) -> Result<()> {
        let mut s = self.lock_live()?;
        s.wait_event(event)
    }

    /// Non-blocking check; invalidates `event` once it has retired.
    pub fn is_done(&self, event: &mut GpuEvent) -> Result<bool> {
        let mut s = self.lock_live()?;
        s.is_done_event(event)
    }

    /// Make `event` the latest on its engine, optionally flushing.
    pub fn set_gpu_event(&self, event: GpuEvent, flush: bool) -> Result<()> {
        let mut s = self.lock_live()?;
        s.set_gpu_event(event, flush)
    }

    /// Submit whatever `engine` has recorded.
    pub fn flush_dma(&self, engine: EngineType) -> Result<()> {
        let mut s = self.lock_live()?;
        s.flush_engine(engine)
    }

    /// Submit all engines and queue a completion batch for `head`.
    ///
    /// With `wait` the call blocks until every engine is idle.  Returns the
    /// batches that retired during the call, oldest first.
    pub fn flush(&self, head: Option<CommandListHead>, wait: bool) -> Result<Vec<CompletedBatch>> {
        let mut s = self.lock_live()?;
        s.flush(head, wait)
    }

    /// Block until every engine is idle and retire all batches.
    pub fn wait_all_engines(&self) -> Result<Vec<CompletedBatch>> {
        let mut s = self.lock_live()?;
        s.wait_all_engines()
    }

    /// Retire batches that have completed, without blocking.
    pub fn harvest(&self) -> Result<Vec<CompletedBatch>> {
        let mut s = self.lock_live()?;
        s.harvest()
    }

    /// Wait for the last use of `id` and drop every reference to it.
    pub fn release_memory(&self, id: AllocationId) -> Result<()> {
        let mut s = self.lock_live()?;
        s.release_memory(id)
    }

    /// Track DMA destinations; `true` when this copy touches memory an
    /// earlier copy since the last sync wrote.
    pub fn validate_sdma_overlap(&self, src: &Allocation, dst: &Allocation) -> bool {
        self.lock().validate_sdma_overlap(src.range(), dst.range())
    }

    /// Drain every engine and release the rings.  Later calls fail with
    /// [`QueueError::Shutdown`].
    pub fn shutdown(&self) -> Result<()> {
        self.lock().shutdown()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    // ── inspection ──────────────────────────────────────────────────

    /// Most recent event submitted on `engine`.
    pub fn last_event(&self, engine: EngineType) -> GpuEvent {
        self.lock().events[engine.index()]
    }

    /// Event after which `id` is no longer in use by the GPU.
    pub fn busy_event(&self, id: AllocationId) -> Option<GpuEvent> {
        self.lock().busy.get(&id).copied()
    }

    /// Id of the buffer `engine` is recording into.
    pub fn buffer_id(&self, engine: EngineType) -> u64 {
        self.lock().rings[engine.index()].buffer_id()
    }

    /// Highest id known complete on `engine`.
    pub fn retired_id(&self, engine: EngineType) -> u64 {
        self.lock().rings[engine.index()].retired_id()
    }

    pub fn referenced_allocations(&self, engine: EngineType) -> usize {
        self.lock().rings[engine.index()].references().len()
    }

    /// Batches waiting for their events to retire.
    pub fn pending_batches(&self) -> usize {
        self.lock().batches.pending_len()
    }

    pub fn free_batches(&self) -> usize {
        self.lock().batches.free_len()
    }

    /// Profiled dispatches not yet handed to a batch.
    pub fn pending_profiles(&self) -> usize {
        self.lock().profiles.len()
    }

    /// Ranges the hazard tracker currently holds.
    pub fn tracked_ranges(&self) -> usize {
        self.lock().dependency.len()
    }

    fn lock(&self) -> MutexGuard<'_, ExecutionState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_live(&self) -> Result<MutexGuard<'_, ExecutionState>> {
        let guard = self.lock();
        if guard.shut_down {
            return Err(QueueError::Shutdown(self.index));
        }
        Ok(guard)
    }
}

impl std::fmt::Debug for VirtualGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.lock();
        f.debug_struct("VirtualGpu")
            .field("index", &self.index)
            .field("rings", &s.rings)
            .field("events", &s.events)
            .field("pending_batches", &s.batches.pending_len())
            .field("shut_down", &s.shut_down)
            .finish()
    }
}

// ── Execution state ─────────────────────────────────────────────────

struct ExecutionState {
    index: u32,
    rings: Vec<CommandRing>,
    /// Latest event per engine.
    events: [GpuEvent; ALL_ENGINES],
    dependency: MemoryDependency,
    batches: BatchQueue,
    /// Profiled dispatches not yet attached to a batch.
    profiles: Vec<ProfiledDispatch>,
    /// Latest event that uses each allocation.
    busy: HashMap<AllocationId, GpuEvent>,
    /// Union of DMA destinations since the last DMA sync.
    sdma_range: Option<MemoryRange>,
    workload: WorkloadFlush,
    next_timestamp: u64,
    open_timestamp: [Option<TimestampId>; ALL_ENGINES],
    last_timestamp: Option<TimestampId>,
    flush_on_execution: bool,
    shut_down: bool,
}

impl ExecutionState {
    fn ring(&mut self, engine: EngineType) -> &mut CommandRing {
        &mut self.rings[engine.index()]
    }

    fn submit_kernel(&mut self, d: &KernelDispatch) -> Result<GpuEvent> {
        if d.threads() == 0 {
            return Err(QueueError::InvalidArgument(format!(
                "kernel {} launched with empty grid {:?}",
                d.kernel, d.grid
            )));
        }
        let main = EngineType::Main;

        for arg in &d.args {
            self.wait_cross_engine(arg.allocation.id, main)?;
        }

        self.dependency.new_kernel();
        let mut hazard = false;
        for arg in &d.args {
            hazard |= self.dependency.validate(arg.allocation.range(), arg.read_only);
        }
        if hazard {
            trace!(kernel = %d.kernel, "memory hazard, inserting barrier");
            self.add_barrier(main, false)?;
        }
        for arg in &d.args {
            self.ring(main).add_mem_ref(&arg.allocation);
        }

        let (waves_per_sh, profile) = match &d.controller {
            Some(c) => {
                let mut controller = lock_controller(c);
                (controller.waves_per_sh(), controller.wants_profiling())
            }
            None => (None, false),
        };
        let timestamp = if profile { Some(self.event_begin(main)?) } else { None };

        self.ring(main).set_last_kernel(Arc::clone(&d.kernel));
        let threads = d.threads();
        match self.workload.split_size(threads, d.instructions) {
            Some(max_threads) => {
                for (offset, grid) in split_grid(d.grid, max_threads) {
                    self.ring(main).record(Packet::Dispatch {
                        kernel: Arc::clone(&d.kernel),
                        offset,
                        grid,
                        waves_per_sh,
                    })?;
                }
            }
            None => {
                self.ring(main).record(Packet::Dispatch {
                    kernel: Arc::clone(&d.kernel),
                    offset: [0; 3],
                    grid: d.grid,
                    waves_per_sh,
                })?;
            }
        }

        let force = self.workload.is_cb_ready(threads, d.instructions);
        let event = self.event_end(main, force)?;

        if let (Some(timestamp), Some(c)) = (timestamp, &d.controller) {
            self.profiles.push(ProfiledDispatch { timestamp, controller: Arc::clone(c) });
        }
        for arg in &d.args {
            self.busy.insert(arg.allocation.id, event);
        }
        self.events[main.index()] = event;
        debug!(kernel = %d.kernel, grid = ?d.grid, ?waves_per_sh, hazard, buffer_id = event.id, "dispatch");
        Ok(event)
    }

    fn submit_copy(&mut self, src: &Allocation, dst: &Allocation) -> Result<GpuEvent> {
        if src.size > dst.size {
            return Err(QueueError::InvalidArgument(format!(
                "copy of {} bytes into a {}-byte allocation",
                src.size, dst.size
            )));
        }
        let sdma = EngineType::Sdma;
        self.wait_cross_engine(src.id, sdma)?;
        self.wait_cross_engine(dst.id, sdma)?;

        let dst_range = MemoryRange::new(dst.address, src.size);
        if self.validate_sdma_overlap(src.range(), dst_range) {
            self.add_barrier(sdma, false)?;
        }
        self.ring(sdma).add_mem_ref(src);
        self.ring(sdma).add_mem_ref(dst);
        self.ring(sdma).record(Packet::Copy { src: src.range(), dst: dst_range })?;
        let event = self.event_end(sdma, false)?;

        self.busy.insert(src.id, event);
        self.busy.insert(dst.id, event);
        self.events[sdma.index()] = event;
        Ok(event)
    }

    fn add_barrier(&mut self, engine: EngineType, flush_l2: bool) -> Result<()> {
        let ring = self.ring(engine);
        ring.record(Packet::Barrier { flush_l2 })?;
        ring.submit_barrier();
        Ok(())
    }

    fn event_begin(&mut self, engine: EngineType) -> Result<TimestampId> {
        let ts = TimestampId(self.next_timestamp);
        self.next_timestamp += 1;
        self.ring(engine).record(Packet::TimestampBegin(ts))?;
        self.open_timestamp[engine.index()] = Some(ts);
        Ok(ts)
    }

    fn event_end(&mut self, engine: EngineType, force_flush: bool) -> Result<GpuEvent> {
        if let Some(ts) = self.open_timestamp[engine.index()].take() {
            self.ring(engine).record(Packet::TimestampEnd(ts))?;
            self.last_timestamp = Some(ts);
        }
        let flush = force_flush || self.flush_on_execution;
        let id = self.ring(engine).submit(flush)?;
        if flush && engine == EngineType::Main {
            self.workload.reset();
        }
        Ok(GpuEvent::new(engine, id))
    }

    fn wait_event(&mut self, event: &mut GpuEvent) -> Result<()> {
        if !event.is_valid() {
            return Ok(());
        }
        self.ring(event.engine).wait_for_event(event.id)?;
        event.invalidate();
        Ok(())
    }

    fn is_done_event(&mut self, event: &mut GpuEvent) -> Result<bool> {
        if !event.is_valid() {
            return Ok(true);
        }
        if self.ring(event.engine).is_done(event.id)? {
            event.invalidate();
            return Ok(true);
        }
        Ok(false)
    }

    /// Cross-engine ordering goes through fences: wait for the last use
    /// of `id` if it happened on another engine.
    fn wait_cross_engine(&mut self, id: AllocationId, engine: EngineType) -> Result<()> {
        let Some(mut event) = self.busy.get(&id).copied() else {
            return Ok(());
        };
        if event.is_valid() && event.engine != engine {
            trace!(allocation = id.0, from = ?event.engine, to = ?engine, "cross-engine wait");
            self.wait_event(&mut event)?;
            self.busy.remove(&id);
        }
        Ok(())
    }

    fn validate_sdma_overlap(&mut self, src: MemoryRange, dst: MemoryRange) -> bool {
        let hit = self.sdma_range.is_some_and(|r| src.overlaps(&r) || dst.overlaps(&r));
        self.sdma_range = Some(match self.sdma_range {
            Some(r) if !hit => MemoryRange { start: r.start.min(dst.start), end: r.end.max(dst.end) },
            _ => dst,
        });
        hit
    }

    fn set_gpu_event(&mut self, event: GpuEvent, flush: bool) -> Result<()> {
        self.events[event.engine.index()] = event;
        if flush {
            self.ring(event.engine).flush()?;
        }
        Ok(())
    }

    fn flush_engine(&mut self, engine: EngineType) -> Result<()> {
        if self.ring(engine).has_pending_work() {
            let id = self.ring(engine).submit(true)?;
            self.events[engine.index()] = GpuEvent::new(engine, id);
            if engine == EngineType::Main {
                self.workload.reset();
            }
        }
        Ok(())
    }

    fn flush(&mut self, head: Option<CommandListHead>, wait: bool) -> Result<Vec<CompletedBatch>> {
        for engine in EngineType::ALL {
            self.flush_engine(engine)?;
        }
        let mut batch = self.batches.acquire(head, &self.events, self.last_timestamp);
        batch.profiles.append(&mut self.profiles);
        self.batches.push(batch);
        trace!(?head, pending = self.batches.pending_len(), wait, "batch queued");
        if wait {
            self.wait_all_engines()
        } else {
            self.harvest()
        }
    }

    fn wait_all_engines(&mut self) -> Result<Vec<CompletedBatch>> {
        for engine in EngineType::ALL {
            let mut event = self.events[engine.index()];
            self.wait_event(&mut event)?;
            self.events[engine.index()] = event;
        }
        self.harvest()
    }

    fn harvest(&mut self) -> Result<Vec<CompletedBatch>> {
        let mut completed = Vec::new();
        while let Some(events) = self.batches.front().map(|b| *b.events()) {
            for mut event in events {
                if !self.is_done_event(&mut event)? {
                    return Ok(completed);
                }
            }
            let Some(mut batch) = self.batches.pop_front() else {
                break;
            };
            self.report_profiles(&mut batch.profiles);
            completed.push(CompletedBatch { head: batch.head(), events });
            self.batches.recycle(batch);
        }
        Ok(completed)
    }

    fn report_profiles(&self, profiles: &mut Vec<ProfiledDispatch>) {
        let main = &self.rings[EngineType::Main.index()];
        for p in profiles.drain(..) {
            match main.read_timestamp(p.timestamp) {
                Some((begin, end)) => lock_controller(&p.controller).on_complete(end.saturating_sub(begin)),
                None => debug!(timestamp = p.timestamp.0, "timestamp not written, dropping sample"),
            }
        }
    }

    fn release_memory(&mut self, id: AllocationId) -> Result<()> {
        if let Some(mut event) = self.busy.remove(&id) {
            self.wait_event(&mut event)?;
        }
        for ring in &mut self.rings {
            ring.remove_mem_ref(id);
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        let mut result = self.flush(None, true).map(|_| ());
        for ring in &mut self.rings {
            let closed = ring.shutdown();
            if result.is_ok() {
                result = closed;
            }
        }
        self.profiles.clear();
        self.shut_down = true;
        info!(index = self.index, ok = result.is_ok(), "virtual GPU shut down");
        result
    }
}
