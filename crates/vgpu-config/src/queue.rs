//! Command ring and execution-context settings.

use crate::{env_flag, env_parse, ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-queue settings shared by every engine ring of a virtual GPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Command buffers per engine ring.
    /// Override: `VGPU_MAX_CMD_BUFFERS`
    pub max_cmd_buffers: u32,

    /// Commands recorded before `submit` flushes on its own.
    /// Override: `VGPU_MAX_COMMANDS`
    pub max_commands: u32,

    /// Spin interval of the latency-tolerant fence wait, in microseconds.
    pub poll_interval_us: u64,

    /// Blocking fence wait timeout, in milliseconds.
    pub wait_timeout_ms: u64,

    /// Flush on every `event_end` instead of batching.
    /// Override: `VGPU_FLUSH_ON_EXECUTION`
    pub flush_on_execution: bool,

    /// Dump outstanding memory references when a fence isn't ready.
    /// Override: `VGPU_ANALYZE_HANG`
    pub analyze_hang: bool,

    /// Residency budget in bytes (0 = unlimited).
    /// Override: `VGPU_RESIDENCY_LIMIT`
    pub residency_limit: u64,

    /// Capacity of the memory dependency tracker (0 = barrier on every dispatch).
    /// Override: `VGPU_MEM_DEPENDENCY_SLOTS`
    pub mem_dependency_slots: usize,

    /// Accumulated threads x instructions per command buffer before a
    /// workload flush (0 = disabled).
    pub max_cb_workload: u64,

    /// Threads x instructions a single dispatch may carry before it is split
    /// (0 = never split).
    pub max_dispatch_workload: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_cmd_buffers: 8,
            max_commands: 256,
            poll_interval_us: 200,
            wait_timeout_ms: 6_000,
            flush_on_execution: false,
            analyze_hang: false,
            residency_limit: 0,
            mem_dependency_slots: 256,
            max_cb_workload: 0,
            max_dispatch_workload: 0,
        }
    }
}

impl QueueConfig {
    /// Spin interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    /// Blocking wait timeout as a [`Duration`].
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_cmd_buffers < 2 {
            return Err(ConfigError::Validation(format!(
                "max_cmd_buffers must be >= 2, got {}",
                self.max_cmd_buffers
            )));
        }
        if self.max_commands == 0 {
            return Err(ConfigError::Validation("max_commands must be > 0".into()));
        }
        if self.wait_timeout_ms == 0 {
            return Err(ConfigError::Validation("wait_timeout_ms must be > 0".into()));
        }
        if self.poll_interval() > self.wait_timeout() {
            return Err(ConfigError::Validation(format!(
                "poll_interval_us ({}) must not exceed wait_timeout_ms ({})",
                self.poll_interval_us, self.wait_timeout_ms
            )));
        }
        Ok(())
    }

    /// Apply `VGPU_*` queue overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_parse("VGPU_MAX_CMD_BUFFERS")? {
            self.max_cmd_buffers = v;
        }
        if let Some(v) = env_parse("VGPU_MAX_COMMANDS")? {
            self.max_commands = v;
        }
        if let Some(v) = env_flag("VGPU_FLUSH_ON_EXECUTION")? {
            self.flush_on_execution = v;
        }
        if let Some(v) = env_flag("VGPU_ANALYZE_HANG")? {
            self.analyze_hang = v;
        }
        if let Some(v) = env_parse("VGPU_RESIDENCY_LIMIT")? {
            self.residency_limit = v;
        }
        if let Some(v) = env_parse("VGPU_MEM_DEPENDENCY_SLOTS")? {
            self.mem_dependency_slots = v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timings_match_hardware_queue_expectations() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.poll_interval(), Duration::from_micros(200));
        assert_eq!(cfg.wait_timeout(), Duration::from_secs(6));
        assert_eq!(cfg.max_commands, 256);
    }

    #[test]
    fn rejects_single_buffer_ring() {
        let cfg = QueueConfig { max_cmd_buffers: 1, ..Default::default() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_cmd_buffers"));
    }

    #[test]
    fn rejects_poll_longer_than_timeout() {
        let cfg = QueueConfig { poll_interval_us: 2_000, wait_timeout_ms: 1, ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
