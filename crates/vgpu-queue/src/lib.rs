//! Command submission engine for a virtual GPU.
//!
//! Layers, bottom up:
//!
//! - [`hal`]: the hardware queue/device traits the engine drives.
//! - [`ring::CommandRing`]: a fixed ring of command buffers per engine,
//!   each guarded by one fence, with monotonically increasing buffer ids
//!   and a retired-id watermark.
//! - [`memory_dependency::MemoryDependency`]: read/write hazard detection
//!   between successive dispatches.
//! - [`virtual_gpu::VirtualGpu`]: the execution context that ties the
//!   rings together, tracks per-engine events and completion batches, and
//!   feeds dispatch timings back to per-kernel
//!   [`profiling::OccupancyController`]s.
//!
//! [`sim`] implements the hardware traits in-process for tests and
//! driverless hosts.

pub mod batch;
pub mod command_buffer;
pub mod error;
pub mod event;
pub mod fence;
pub mod hal;
pub mod memory_dependency;
pub mod profiling;
pub mod residency;
pub mod ring;
pub mod sim;
pub mod virtual_gpu;
pub mod workload;

pub use batch::{CommandBatch, CommandListHead, CompletedBatch};
pub use error::{HalError, QueueError, Result};
pub use event::GpuEvent;
pub use hal::{
    Allocation, AllocationId, EngineType, FenceHandle, FenceStatus, HardwareDevice,
    HardwareQueue, MemoryRange, Packet, SubmissionId, TimestampId, ALL_ENGINES,
};
pub use memory_dependency::MemoryDependency;
pub use profiling::{OccupancyController, SharedController};
pub use ring::{CommandRing, START_BUFFER_ID};
pub use virtual_gpu::{KernelArg, KernelDispatch, VirtualGpu};
