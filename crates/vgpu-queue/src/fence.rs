//! Fence waiting.
//!
//! Two modes: [`WaitMode::Poll`] polls the status for a short interval,
//! yielding the thread between checks, before falling back to a blocking wait (latency-sensitive callers), while
//! [`WaitMode::Reuse`] goes straight to the blocking wait (slot recycling,
//! where the work is almost always long finished).

use crate::hal::{FenceHandle, FenceStatus, HardwareQueue};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Poll,
    Reuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceWaitPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl From<&vgpu_config::QueueConfig> for FenceWaitPolicy {
    fn from(cfg: &vgpu_config::QueueConfig) -> Self {
        Self { poll_interval: cfg.poll_interval(), timeout: cfg.wait_timeout() }
    }
}

/// Wait until `fence` retires.
///
/// Returns the terminal status: `Signaled`/`NeverSubmitted` on success,
/// anything else is a failure the caller reports.
pub fn wait_for_fence(
    queue: &dyn HardwareQueue,
    fence: FenceHandle,
    mode: WaitMode,
    policy: &FenceWaitPolicy,
) -> FenceStatus {
    let status = queue.query_status(fence);
    match (mode, status) {
        (_, FenceStatus::NeverSubmitted) => return FenceStatus::NeverSubmitted,
        (_, FenceStatus::Error(_)) => return status,
        (WaitMode::Poll, FenceStatus::Signaled) => return status,
        _ => {}
    }

    if mode == WaitMode::Poll {
        let start = Instant::now();
        while start.elapsed() < policy.poll_interval {
            match queue.query_status(fence) {
                s if s.is_complete() => return s,
                FenceStatus::Error(code) => return FenceStatus::Error(code),
                _ => std::thread::yield_now(),
            }
        }
    }

    queue.wait(fence, policy.timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HalError;
    use crate::hal::{Allocation, AllocationId, EngineType, Packet, SubmissionId, TimestampId};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports `Pending` for the first `pending_polls` queries.
    struct Countdown {
        pending_polls: u32,
        polls: AtomicU32,
        waits: AtomicU32,
    }

    impl Countdown {
        fn new(pending_polls: u32) -> Self {
            Self { pending_polls, polls: AtomicU32::new(0), waits: AtomicU32::new(0) }
        }
    }

    impl HardwareQueue for Countdown {
        fn engine(&self) -> EngineType {
            EngineType::Main
        }
        fn acquire_fence(&mut self) -> Result<FenceHandle, HalError> {
            Ok(FenceHandle(0))
        }
        fn release_fence(&mut self, _: FenceHandle) {}
        fn submit(&mut self, _: &[Packet], _: FenceHandle) -> Result<SubmissionId, HalError> {
            Ok(SubmissionId(0))
        }
        fn query_status(&self, _: FenceHandle) -> FenceStatus {
            if self.polls.fetch_add(1, Ordering::SeqCst) < self.pending_polls {
                FenceStatus::Pending
            } else {
                FenceStatus::Signaled
            }
        }
        fn wait(&self, _: FenceHandle, _: Duration) -> FenceStatus {
            self.waits.fetch_add(1, Ordering::SeqCst);
            FenceStatus::Signaled
        }
        fn make_resident(&mut self, _: &[Allocation]) -> Result<(), HalError> {
            Ok(())
        }
        fn evict(&mut self, _: &[AllocationId]) {}
        fn read_timestamp(&self, _: TimestampId) -> Option<(u64, u64)> {
            None
        }
    }

    fn policy() -> FenceWaitPolicy {
        FenceWaitPolicy { poll_interval: Duration::from_secs(5), timeout: Duration::from_secs(1) }
    }

    #[test]
    fn poll_mode_sees_completion_without_blocking() {
        let q = Countdown::new(3);
        assert_eq!(wait_for_fence(&q, FenceHandle(0), WaitMode::Poll, &policy()), FenceStatus::Signaled);
        assert_eq!(q.waits.load(Ordering::SeqCst), 0);
        assert_eq!(q.polls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn reuse_mode_blocks_immediately() {
        let q = Countdown::new(3);
        assert_eq!(wait_for_fence(&q, FenceHandle(0), WaitMode::Reuse, &policy()), FenceStatus::Signaled);
        assert_eq!(q.waits.load(Ordering::SeqCst), 1);
        assert_eq!(q.polls.load(Ordering::SeqCst), 1);
    }
}
