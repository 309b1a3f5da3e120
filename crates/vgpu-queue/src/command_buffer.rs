//! Command buffer slot lifecycle.
//!
//! Each ring slot owns one [`CommandBuffer`] and one fence for the life of
//! the ring.  The buffer cycles Recording → Submitted → (fence retired,
//! reset) → Recording.

use crate::error::{QueueError, Result};
use crate::hal::{AllocationId, FenceHandle, Packet};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Accepting packets.
    Recording,
    /// Handed to the hardware queue; immutable until reset.
    Submitted,
}

#[derive(Debug)]
pub struct CommandBuffer {
    slot: usize,
    fence: FenceHandle,
    state: CommandBufferState,
    packets: Vec<Packet>,
    references: Vec<AllocationId>,
    submitted_id: Option<u64>,
}

impl CommandBuffer {
    pub fn new(slot: usize, fence: FenceHandle) -> Self {
        Self {
            slot,
            fence,
            state: CommandBufferState::Recording,
            packets: Vec::new(),
            references: Vec::new(),
            submitted_id: None,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn fence(&self) -> FenceHandle {
        self.fence
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Allocations recorded against this buffer since its last reset.
    pub fn references(&self) -> &[AllocationId] {
        &self.references
    }

    /// Ring id of the most recent submission from this slot.
    pub fn submitted_id(&self) -> Option<u64> {
        self.submitted_id
    }

    pub fn record(&mut self, packet: Packet) -> Result<()> {
        if self.state != CommandBufferState::Recording {
            return Err(QueueError::CommandBuffer(format!(
                "slot {} cannot record in state {:?}",
                self.slot, self.state
            )));
        }
        trace!(slot = self.slot, ?packet, "record");
        self.packets.push(packet);
        Ok(())
    }

    pub fn add_reference(&mut self, id: AllocationId) {
        if !self.references.contains(&id) {
            self.references.push(id);
        }
    }

    pub fn mark_submitted(&mut self, id: u64) -> Result<()> {
        if self.state != CommandBufferState::Recording {
            return Err(QueueError::CommandBuffer(format!(
                "slot {} submitted twice (previous id {:?})",
                self.slot, self.submitted_id
            )));
        }
        self.state = CommandBufferState::Submitted;
        self.submitted_id = Some(id);
        Ok(())
    }

    /// Return to Recording once the slot's fence has retired.
    pub fn reset(&mut self) {
        self.packets.clear();
        self.references.clear();
        self.state = CommandBufferState::Recording;
    }
}
