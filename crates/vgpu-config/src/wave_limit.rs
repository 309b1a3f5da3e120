//! Adaptive occupancy (wave limiter) settings.

use crate::{env_flag, env_parse, env_string, ConfigError, Result};
use serde::{Deserialize, Serialize};

/// Wave limiter settings as read from TOML and the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveLimitConfig {
    /// Force the controller on or off regardless of the hardware default.
    /// Override: `VGPU_WAVE_LIMIT_ENABLE`
    pub enable: Option<bool>,

    /// Occupancy search ceiling (waves per SIMD).
    /// Override: `VGPU_WAVE_LIMIT_MAX_WAVE`
    pub max_wave: u32,

    /// Invocations pinned at `max_wave` before the first sweep.
    /// Override: `VGPU_WAVE_LIMIT_WARMUP`
    pub warmup: u32,

    /// RUN phase length after a full sweep, in multiples of `max_wave`.
    /// Override: `VGPU_WAVE_LIMIT_RUN`
    pub run_multiplier: u32,

    /// Trial/reference ratio (percent) above which a sweep is abandoned.
    /// Override: `VGPU_WAVE_LIMIT_ABANDON`
    pub abandon_thresh: u32,

    /// Difference between adjacent baselines (percent) treated as a
    /// disturbance.
    /// Override: `VGPU_WAVE_LIMIT_DSC_THRESH`
    pub dsc_thresh: u32,

    /// Per-kernel trace file prefix (`<prefix><kernel>.txt`).
    /// Override: `VGPU_WAVE_LIMIT_TRACE`
    pub trace_prefix: Option<String>,

    /// Per-kernel CSV dump prefix (`<prefix><kernel>.csv`).
    /// Override: `VGPU_WAVE_LIMIT_DUMP`
    pub dump_prefix: Option<String>,

    /// SIMDs per shader array, replacing the hardware-derived value.
    /// Override: `VGPU_WAVE_LIMIT_CU_PER_SH`
    pub cu_per_sh: Option<u32>,

    /// Fixed waves per SIMD; disables adaptation entirely.
    /// Override: `VGPU_WAVES_PER_SIMD`
    pub waves_per_simd: Option<u32>,

    /// Seed for the RUN phase offset.
    /// Override: `VGPU_WAVE_LIMIT_SEED`
    pub seed: Option<u64>,
}

impl Default for WaveLimitConfig {
    fn default() -> Self {
        Self {
            enable: None,
            max_wave: 8,
            warmup: 10,
            run_multiplier: 20,
            abandon_thresh: 110,
            dsc_thresh: 10,
            trace_prefix: None,
            dump_prefix: None,
            cu_per_sh: None,
            waves_per_simd: None,
            seed: None,
        }
    }
}

impl WaveLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_wave == 0 || self.max_wave > 64 {
            return Err(ConfigError::Validation(format!(
                "max_wave must be in 1..=64, got {}",
                self.max_wave
            )));
        }
        if self.run_multiplier == 0 {
            return Err(ConfigError::Validation("run_multiplier must be > 0".into()));
        }
        if self.run_multiplier.checked_mul(self.max_wave).is_none() {
            return Err(ConfigError::Validation(format!(
                "run_multiplier {} x max_wave {} overflows the RUN length",
                self.run_multiplier, self.max_wave
            )));
        }
        if self.abandon_thresh == 0 {
            return Err(ConfigError::Validation("abandon_thresh must be > 0".into()));
        }
        if self.waves_per_simd == Some(0) {
            return Err(ConfigError::Validation(
                "waves_per_simd must be > 0 when set (leave unset for no limit)".into(),
            ));
        }
        if self.cu_per_sh == Some(0) {
            return Err(ConfigError::Validation("cu_per_sh must be > 0 when set".into()));
        }
        Ok(())
    }

    /// Apply `VGPU_WAVE_LIMIT_*` / `VGPU_WAVES_PER_SIMD` overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_flag("VGPU_WAVE_LIMIT_ENABLE")? {
            self.enable = Some(v);
        }
        if let Some(v) = env_parse("VGPU_WAVE_LIMIT_MAX_WAVE")? {
            self.max_wave = v;
        }
        if let Some(v) = env_parse("VGPU_WAVE_LIMIT_WARMUP")? {
            self.warmup = v;
        }
        if let Some(v) = env_parse("VGPU_WAVE_LIMIT_RUN")? {
            self.run_multiplier = v;
        }
        if let Some(v) = env_parse("VGPU_WAVE_LIMIT_ABANDON")? {
            self.abandon_thresh = v;
        }
        if let Some(v) = env_parse("VGPU_WAVE_LIMIT_DSC_THRESH")? {
            self.dsc_thresh = v;
        }
        if let Some(v) = env_string("VGPU_WAVE_LIMIT_TRACE") {
            self.trace_prefix = Some(v);
        }
        if let Some(v) = env_string("VGPU_WAVE_LIMIT_DUMP") {
            self.dump_prefix = Some(v);
        }
        if let Some(v) = env_parse("VGPU_WAVE_LIMIT_CU_PER_SH")? {
            self.cu_per_sh = Some(v);
        }
        if let Some(v) = env_parse("VGPU_WAVES_PER_SIMD")? {
            self.waves_per_simd = Some(v);
        }
        if let Some(v) = env_parse("VGPU_WAVE_LIMIT_SEED")? {
            self.seed = Some(v);
        }
        Ok(())
    }

    /// Derive the immutable tunables shared by every controller.
    pub fn tunables(&self) -> WaveLimitTunables {
        WaveLimitTunables {
            max_wave: self.max_wave,
            warmup_count: self.warmup,
            adapt_count: 2 * self.max_wave + 1,
            run_count: self.run_multiplier.saturating_mul(self.max_wave),
            abandon_thresh: self.abandon_thresh,
            dsc_thresh: self.dsc_thresh,
            enable: self.enable,
            trace_prefix: self.trace_prefix.clone(),
            dump_prefix: self.dump_prefix.clone(),
            cu_per_sh: self.cu_per_sh,
            waves_per_simd: self.waves_per_simd,
            seed: self.seed,
        }
    }
}

/// Read-only controller tunables, computed once per device.
///
/// Owned by the device object (usually behind an `Arc`) and passed by
/// reference into every kernel's controller; nothing mutates it after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveLimitTunables {
    pub max_wave: u32,
    pub warmup_count: u32,
    /// Trials in a full sweep: `2 * max_wave + 1`.
    pub adapt_count: u32,
    /// RUN length after a full sweep: `run_multiplier * max_wave`.
    pub run_count: u32,
    pub abandon_thresh: u32,
    pub dsc_thresh: u32,
    pub enable: Option<bool>,
    pub trace_prefix: Option<String>,
    pub dump_prefix: Option<String>,
    pub cu_per_sh: Option<u32>,
    pub waves_per_simd: Option<u32>,
    pub seed: Option<u64>,
}

impl Default for WaveLimitTunables {
    fn default() -> Self {
        WaveLimitConfig::default().tunables()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_counts_follow_max_wave() {
        let cfg = WaveLimitConfig { max_wave: 10, run_multiplier: 5, ..Default::default() };
        let t = cfg.tunables();
        assert_eq!(t.adapt_count, 21);
        assert_eq!(t.run_count, 50);
    }

    #[test]
    fn rejects_zero_max_wave() {
        let cfg = WaveLimitConfig { max_wave: 0, ..Default::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("max_wave"));
    }

    #[test]
    fn rejects_overflowing_run_length() {
        let cfg = WaveLimitConfig { run_multiplier: 1_000_000_000, ..Default::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("run_multiplier"));
        assert_eq!(cfg.tunables().run_count, u32::MAX);

        let cfg = WaveLimitConfig { run_multiplier: u32::MAX / 64, max_wave: 64, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_fixed_waves() {
        let cfg = WaveLimitConfig { waves_per_simd: Some(0), ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
