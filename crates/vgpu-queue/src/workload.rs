//! Workload-based flushing and dispatch splitting.
//!
//! Work is measured as `threads * instructions`.  Once a command buffer has
//! accumulated `max_cb_workload` it is submitted early so the hardware can
//! start on it; a single dispatch larger than `max_dispatch_workload` is
//! split along X into chunks that each fit.

use vgpu_config::QueueConfig;

#[derive(Debug, Clone, Default)]
pub struct WorkloadFlush {
    max_cb_workload: u64,
    max_dispatch_workload: u64,
    cb_workload: u64,
}

impl WorkloadFlush {
    pub fn new(cfg: &QueueConfig) -> Self {
        Self {
            max_cb_workload: cfg.max_cb_workload,
            max_dispatch_workload: cfg.max_dispatch_workload,
            cb_workload: 0,
        }
    }

    /// Account one dispatch; `true` when the buffer should be flushed.
    pub fn is_cb_ready(&mut self, threads: u64, instructions: u32) -> bool {
        if self.max_cb_workload == 0 {
            return false;
        }
        self.cb_workload = self.cb_workload.saturating_add(threads.saturating_mul(instructions as u64));
        if self.cb_workload >= self.max_cb_workload {
            self.cb_workload = 0;
            true
        } else {
            false
        }
    }

    /// Forget accumulated work (the buffer was flushed for another reason).
    pub fn reset(&mut self) {
        self.cb_workload = 0;
    }

    /// Threads per split chunk, or `None` when the dispatch fits.
    pub fn split_size(&self, threads: u64, instructions: u32) -> Option<u64> {
        if self.max_dispatch_workload == 0 || instructions == 0 {
            return None;
        }
        let work = threads.saturating_mul(instructions as u64);
        if work <= self.max_dispatch_workload {
            return None;
        }
        Some((self.max_dispatch_workload / instructions as u64).max(1))
    }
}

/// Split `grid` along X so each piece carries at most `max_threads`
/// threads.  Returns `(offset, size)` pairs covering the grid exactly.
pub fn split_grid(grid: [u32; 3], max_threads: u64) -> Vec<([u32; 3], [u32; 3])> {
    let plane = grid[1] as u64 * grid[2] as u64;
    if plane == 0 || grid[0] == 0 {
        return vec![([0, 0, 0], grid)];
    }
    let chunk_x = (max_threads / plane).clamp(1, grid[0] as u64) as u32;
    let mut pieces = Vec::with_capacity(grid[0].div_ceil(chunk_x) as usize);
    let mut x = 0u32;
    while x < grid[0] {
        let width = chunk_x.min(grid[0] - x);
        pieces.push(([x, 0, 0], [width, grid[1], grid[2]]));
        x += width;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(cb: u64, dispatch: u64) -> QueueConfig {
        QueueConfig { max_cb_workload: cb, max_dispatch_workload: dispatch, ..Default::default() }
    }

    #[test]
    fn disabled_by_default() {
        let mut w = WorkloadFlush::new(&QueueConfig::default());
        assert!(!w.is_cb_ready(u64::MAX, u32::MAX));
        assert_eq!(w.split_size(1 << 40, 100), None);
    }

    #[test]
    fn accumulates_until_ready() {
        let mut w = WorkloadFlush::new(&cfg(1000, 0));
        assert!(!w.is_cb_ready(10, 40));
        assert!(!w.is_cb_ready(10, 40));
        assert!(w.is_cb_ready(10, 40));
        assert!(!w.is_cb_ready(10, 40));
    }

    #[test]
    fn split_covers_grid() {
        let w = WorkloadFlush::new(&cfg(0, 1000));
        let size = w.split_size(64 * 4, 10).unwrap();
        assert_eq!(size, 100);
        let pieces = split_grid([64, 4, 1], size);
        // 100 threads / 4 rows = 25 columns per piece.
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0], ([0, 0, 0], [25, 4, 1]));
        assert_eq!(pieces[2], ([50, 0, 0], [14, 4, 1]));
        let total: u32 = pieces.iter().map(|(_, g)| g[0]).sum();
        assert_eq!(total, 64);
    }

    #[test]
    fn split_never_goes_below_one_column() {
        let pieces = split_grid([3, 1024, 1], 16);
        assert_eq!(pieces.len(), 3);
    }
}
