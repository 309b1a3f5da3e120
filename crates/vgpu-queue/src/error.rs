//! Queue and hardware-layer error types.

use crate::hal::{EngineType, FenceHandle, FenceStatus};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a [`HardwareQueue`](crate::hal::HardwareQueue)
/// implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    #[error("driver call {call} failed with status {code}")]
    Driver { call: &'static str, code: i32 },

    #[error("no fences left to acquire")]
    FenceExhausted,

    #[error("unknown fence handle {0:?}")]
    UnknownFence(FenceHandle),

    #[error("no hardware queue for engine {0:?}")]
    EngineUnavailable(EngineType),

    #[error("submission rejected: {0}")]
    Rejected(String),
}

/// Errors produced by the submission engine.
///
/// Synchronization failures are fatal for the submission that hit them;
/// whether to retry the higher-level command or tear the queue down is the
/// caller's decision.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("hardware layer error: {0}")]
    Hal(#[from] HalError),

    #[error("{engine:?} command buffer {buffer_id} did not retire within {timeout:?}")]
    FenceTimeout { engine: EngineType, buffer_id: u64, timeout: Duration },

    #[error("{engine:?} fence wait for command buffer {buffer_id} failed: {status:?}")]
    FenceFailed { engine: EngineType, buffer_id: u64, status: FenceStatus },

    #[error("{engine:?} submission of command buffer {buffer_id} failed: {source}")]
    Submit {
        engine: EngineType,
        buffer_id: u64,
        #[source]
        source: HalError,
    },

    #[error("command buffer error: {0}")]
    CommandBuffer(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("virtual GPU {0} has been shut down")]
    Shutdown(u32),
}

impl QueueError {
    /// `true` for failures that indicate a hung device or lost submission.
    pub fn is_sync_failure(&self) -> bool {
        matches!(self, Self::FenceTimeout { .. } | Self::FenceFailed { .. } | Self::Submit { .. })
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Map a terminal fence status to `Ok(())` or the matching error.
pub fn check_fence(
    status: FenceStatus,
    engine: EngineType,
    buffer_id: u64,
    timeout: Duration,
) -> Result<()> {
    match status {
        FenceStatus::Signaled | FenceStatus::NeverSubmitted => Ok(()),
        FenceStatus::Pending | FenceStatus::NotReady | FenceStatus::Timeout => {
            Err(QueueError::FenceTimeout { engine, buffer_id, timeout })
        }
        FenceStatus::Error(_) => Err(QueueError::FenceFailed { engine, buffer_id, status }),
    }
}
