//! GPU completion events.

use crate::hal::EngineType;

/// Completion handle: "command buffer `id` on `engine`".
///
/// Plain value; copying it never aliases another event's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuEvent {
    pub engine: EngineType,
    pub id: u64,
}

impl GpuEvent {
    pub const INVALID_ID: u64 = u64::MAX;

    pub const fn new(engine: EngineType, id: u64) -> Self {
        Self { engine, id }
    }

    /// An event that refers to no work.
    pub const fn invalid() -> Self {
        Self { engine: EngineType::Main, id: Self::INVALID_ID }
    }

    pub const fn is_valid(&self) -> bool {
        self.id != Self::INVALID_ID
    }

    /// Mark as observed-complete.
    pub fn invalidate(&mut self) {
        self.id = Self::INVALID_ID;
    }
}

impl Default for GpuEvent {
    fn default() -> Self {
        Self::invalid()
    }
}
