//! Runtime configuration for the virtual GPU submission engine.
//!
//! Loads [`RuntimeConfig`] from a TOML file (`vgpu.toml`) with environment
//! variable overrides via `VGPU_*` prefixed variables.  The wave-limiter
//! section is turned into an immutable [`WaveLimitTunables`] once, by the
//! owning device object, and shared read-only by every kernel controller.
//!
//! ```
//! use vgpu_config::RuntimeConfig;
//!
//! let cfg = RuntimeConfig::from_toml("[queue]\nmax_cmd_buffers = 4\n").unwrap();
//! assert_eq!(cfg.queue.max_cmd_buffers, 4);
//! assert_eq!(cfg.wave_limit.tunables().adapt_count, 2 * cfg.wave_limit.max_wave + 1);
//! ```

mod queue;
mod wave_limit;

pub use queue::QueueConfig;
pub use wave_limit::{WaveLimitConfig, WaveLimitTunables};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Errors that can occur when loading or validating a [`RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Complete configuration: per-queue ring settings plus the adaptive
/// occupancy controller settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub queue: QueueConfig,
    pub wave_limit: WaveLimitConfig,
}

impl RuntimeConfig {
    /// Generate a default configuration TOML string.
    pub fn default_toml() -> String {
        // Plain integers, bools and tables only; serialization cannot fail.
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string (useful for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut cfg: RuntimeConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate both sections.
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        self.wave_limit.validate()
    }

    /// Apply `VGPU_*` environment variable overrides to both sections.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.queue.apply_env_overrides()?;
        self.wave_limit.apply_env_overrides()
    }
}

// ── env helpers ─────────────────────────────────────────────────────

/// Parse `key` from the environment, `Ok(None)` when unset.
pub(crate) fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<T>().map(Some).map_err(|e| ConfigError::EnvOverride {
            key: key.into(),
            value: val.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

/// Parse a boolean flag (`1/true/yes/on`, `0/false/no/off`).
pub(crate) fn env_flag(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::EnvOverride {
                key: key.into(),
                value: val,
                reason: "expected a boolean (1/0, true/false, yes/no)".into(),
            }),
        },
        Err(_) => Ok(None),
    }
}

/// Non-empty string override.
pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_VARS: &[&str] = &[
        "VGPU_MAX_CMD_BUFFERS",
        "VGPU_MAX_COMMANDS",
        "VGPU_FLUSH_ON_EXECUTION",
        "VGPU_ANALYZE_HANG",
        "VGPU_RESIDENCY_LIMIT",
        "VGPU_MEM_DEPENDENCY_SLOTS",
        "VGPU_WAVE_LIMIT_ENABLE",
        "VGPU_WAVE_LIMIT_MAX_WAVE",
        "VGPU_WAVE_LIMIT_WARMUP",
        "VGPU_WAVE_LIMIT_RUN",
        "VGPU_WAVE_LIMIT_ABANDON",
        "VGPU_WAVE_LIMIT_DSC_THRESH",
        "VGPU_WAVE_LIMIT_TRACE",
        "VGPU_WAVE_LIMIT_DUMP",
        "VGPU_WAVE_LIMIT_CU_PER_SH",
        "VGPU_WAVES_PER_SIMD",
        "VGPU_WAVE_LIMIT_SEED",
    ];

    /// Run `f` with every known override cleared except `set`.
    fn with_env<F: FnOnce()>(set: &[(&str, &str)], f: F) {
        let vars: Vec<(&str, Option<&str>)> = ALL_VARS
            .iter()
            .map(|k| (*k, set.iter().find(|(sk, _)| sk == k).map(|(_, v)| *v)))
            .collect();
        temp_env::with_vars(vars, f);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    #[serial(vgpu_env)]
    fn test_default_toml_round_trips() {
        with_env(&[], || {
            let cfg = RuntimeConfig::from_toml(&RuntimeConfig::default_toml()).unwrap();
            assert_eq!(cfg, RuntimeConfig::default());
        });
    }

    #[test]
    #[serial(vgpu_env)]
    fn test_partial_toml_keeps_defaults() {
        with_env(&[], || {
            let cfg = RuntimeConfig::from_toml(
                r#"
[queue]
max_commands = 64
analyze_hang = true

[wave_limit]
enable = true
max_wave = 4
dump_prefix = "/tmp/wl_"
"#,
            )
            .unwrap();
            assert_eq!(cfg.queue.max_commands, 64);
            assert!(cfg.queue.analyze_hang);
            assert_eq!(cfg.queue.max_cmd_buffers, QueueConfig::default().max_cmd_buffers);
            assert_eq!(cfg.wave_limit.enable, Some(true));
            assert_eq!(cfg.wave_limit.max_wave, 4);
            assert_eq!(cfg.wave_limit.dump_prefix.as_deref(), Some("/tmp/wl_"));
            assert_eq!(cfg.wave_limit.trace_prefix, None);
        });
    }

    #[test]
    #[serial(vgpu_env)]
    fn test_env_override_multiple_fields() {
        with_env(
            &[
                ("VGPU_MAX_CMD_BUFFERS", "4"),
                ("VGPU_RESIDENCY_LIMIT", "1048576"),
                ("VGPU_WAVE_LIMIT_ENABLE", "yes"),
                ("VGPU_WAVE_LIMIT_MAX_WAVE", "6"),
                ("VGPU_WAVE_LIMIT_RUN", "3"),
                ("VGPU_WAVE_LIMIT_TRACE", "/tmp/trace_"),
            ],
            || {
                let cfg = RuntimeConfig::from_env().unwrap();
                assert_eq!(cfg.queue.max_cmd_buffers, 4);
                assert_eq!(cfg.queue.residency_limit, 1_048_576);
                assert_eq!(cfg.wave_limit.enable, Some(true));
                assert_eq!(cfg.wave_limit.max_wave, 6);
                let t = cfg.wave_limit.tunables();
                assert_eq!(t.adapt_count, 13);
                assert_eq!(t.run_count, 18);
                assert_eq!(t.trace_prefix.as_deref(), Some("/tmp/trace_"));
            },
        );
    }

    #[test]
    #[serial(vgpu_env)]
    fn test_env_override_invalid_number() {
        with_env(&[("VGPU_WAVE_LIMIT_MAX_WAVE", "many")], || {
            match RuntimeConfig::from_env().unwrap_err() {
                ConfigError::EnvOverride { key, .. } => {
                    assert_eq!(key, "VGPU_WAVE_LIMIT_MAX_WAVE");
                }
                other => panic!("expected EnvOverride, got: {other}"),
            }
        });
    }

    #[test]
    #[serial(vgpu_env)]
    fn test_env_override_invalid_flag() {
        with_env(&[("VGPU_ANALYZE_HANG", "maybe")], || {
            let err = RuntimeConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("VGPU_ANALYZE_HANG"));
        });
    }

    #[test]
    #[serial(vgpu_env)]
    fn test_env_override_fails_validation() {
        with_env(&[("VGPU_MAX_CMD_BUFFERS", "1")], || {
            let err = RuntimeConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)));
        });
    }

    #[test]
    #[serial(vgpu_env)]
    fn test_env_run_multiplier_overflow_rejected() {
        with_env(&[("VGPU_WAVE_LIMIT_RUN", "1000000000")], || {
            let err = RuntimeConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::Validation(ref m) if m.contains("run_multiplier")));
        });
    }

    #[test]
    #[serial(vgpu_env)]
    fn test_load_from_tempfile() {
        with_env(&[], || {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("vgpu.toml");
            std::fs::write(&path, RuntimeConfig::default_toml()).unwrap();
            assert_eq!(RuntimeConfig::load(&path).unwrap(), RuntimeConfig::default());
        });
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = RuntimeConfig::load(Path::new("/nonexistent/vgpu.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_malformed_toml() {
        let result = RuntimeConfig::from_toml("[queue\nmax_commands = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
