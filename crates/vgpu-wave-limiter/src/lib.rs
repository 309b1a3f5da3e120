//! Adaptive wave-occupancy controller.
//!
//! One [`WaveLimiter`] per kernel searches for the occupancy limit (waves
//! per SIMD) with the lowest execution time, using the dispatch timings
//! the submission engine feeds back through
//! [`vgpu_queue::OccupancyController`].  All controllers created by one
//! [`WaveLimiterFactory`] share the same read-only tunables.
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use vgpu_config::WaveLimitConfig;
//! use vgpu_queue::SharedController;
//! use vgpu_wave_limiter::{HardwareInfo, WaveLimiterFactory};
//!
//! let hw = HardwareInfo { supports_wave_limit: true, cus_per_shader_array: 8, simds_per_cu: 4 };
//! let factory = WaveLimiterFactory::new(WaveLimitConfig::default().tunables(), hw);
//! let limiter = factory.create_shared("gemm", true);
//! let controller: SharedController = limiter.clone();
//! assert_eq!(limiter.lock().unwrap().waves_per_simd(), Some(8));
//! # drop(controller);
//! ```

mod dumper;
mod limiter;
mod trace;

pub use dumper::DataDumper;
pub use limiter::{Phase, WaveLimiter};

use std::sync::{Arc, Mutex};
use vgpu_config::{WaveLimitConfig, WaveLimitTunables};

/// Shader-array geometry of the device the controllers run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareInfo {
    /// The device honours a per-dispatch wave limit.
    pub supports_wave_limit: bool,
    pub cus_per_shader_array: u32,
    pub simds_per_cu: u32,
}

impl HardwareInfo {
    pub fn simds_per_shader_array(&self) -> u32 {
        self.cus_per_shader_array * self.simds_per_cu
    }
}

/// Creates per-kernel controllers that share one set of tunables.
#[derive(Debug, Clone)]
pub struct WaveLimiterFactory {
    tunables: Arc<WaveLimitTunables>,
    hardware: HardwareInfo,
}

impl WaveLimiterFactory {
    pub fn new(tunables: WaveLimitTunables, hardware: HardwareInfo) -> Self {
        Self { tunables: Arc::new(tunables), hardware }
    }

    /// Validate `cfg` and derive the shared tunables from it.
    pub fn from_config(cfg: &WaveLimitConfig, hardware: HardwareInfo) -> vgpu_config::Result<Self> {
        cfg.validate()?;
        Ok(Self::new(cfg.tunables(), hardware))
    }

    pub fn tunables(&self) -> &WaveLimitTunables {
        &self.tunables
    }

    pub fn hardware(&self) -> HardwareInfo {
        self.hardware
    }

    /// Controller for `kernel`, enabled according to `limit_hint`.
    pub fn create(&self, kernel: &str, limit_hint: bool) -> WaveLimiter {
        let mut limiter = WaveLimiter::new(kernel, Arc::clone(&self.tunables), &self.hardware);
        limiter.enable(limit_hint);
        limiter
    }

    /// Same as [`create`](Self::create), wrapped for attaching to
    /// dispatches.
    pub fn create_shared(&self, kernel: &str, limit_hint: bool) -> Arc<Mutex<WaveLimiter>> {
        Arc::new(Mutex::new(self.create(kernel, limit_hint)))
    }
}
