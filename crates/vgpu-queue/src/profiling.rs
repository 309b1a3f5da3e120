//! Occupancy controller seam and per-dispatch profiling records.

use crate::hal::TimestampId;
use std::sync::{Arc, Mutex, MutexGuard};

/// Per-kernel occupancy controller driven by the submission engine.
///
/// The engine asks for the occupancy limit once per dispatch and, when
/// [`wants_profiling`](Self::wants_profiling) is set, reports the measured
/// execution time back after the dispatch retires.
pub trait OccupancyController: Send {
    fn kernel_name(&self) -> &str;

    /// Waves per shader array for the next dispatch (`None` = hardware
    /// maximum).  Marks the value as applied.
    fn waves_per_sh(&mut self) -> Option<u32>;

    fn wants_profiling(&self) -> bool;

    /// Execution time of a dispatch issued with the last returned limit.
    fn on_complete(&mut self, duration_ns: u64);
}

pub type SharedController = Arc<Mutex<dyn OccupancyController>>;

/// Lock a controller, recovering from poison.
pub fn lock_controller(c: &SharedController) -> MutexGuard<'_, dyn OccupancyController + 'static> {
    match c.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A profiled dispatch waiting for its timestamps.
#[derive(Clone)]
pub struct ProfiledDispatch {
    pub timestamp: TimestampId,
    pub controller: SharedController,
}

impl std::fmt::Debug for ProfiledDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfiledDispatch").field("timestamp", &self.timestamp).finish_non_exhaustive()
    }
}
