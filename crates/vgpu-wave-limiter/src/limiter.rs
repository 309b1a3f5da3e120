//! Per-kernel adaptive wave limiter.
//!
//! Lifecycle: WARMUP (pinned at `max_wave`) → ADAPT (sweep) → RUN (commit)
//! → ADAPT → RUN ...
//!
//! A sweep alternates baseline samples at `max_wave` with trial samples at
//! a decreasing candidate occupancy:
//!
//! ```text
//! sample: 1    2     3    4       5    ...  2*max+1
//! waves:  max  max   max  max-1   max  ...  max
//!         base trial base trial   base      base
//! ```
//!
//! Every trial is compared against the average of the two baselines around
//! it, giving `ratio = trial * 100 / reference`.  The lowest ratio wins.  A
//! jump between adjacent baselines larger than `dsc_thresh` percent marks
//! the sweep discontinuous: nothing becomes best after that and the sweep
//! ends.  A ratio above `abandon_thresh` ends the sweep as well.  A full
//! sweep earns a RUN phase of `run_count` invocations, an aborted one only
//! `adapt_count`, and RUN starts at a random offset in `0..max_wave`.

use crate::dumper::DataDumper;
use crate::trace::{TraceSink, TraceSnapshot};
use crate::HardwareInfo;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use vgpu_config::WaveLimitTunables;
use vgpu_queue::OccupancyController;

/// Controller phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Phase {
    Warmup = 0,
    Adapt = 1,
    Run = 2,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Warmup => write!(f, "warmup"),
            Phase::Adapt => write!(f, "adapt"),
            Phase::Run => write!(f, "run"),
        }
    }
}

/// Adaptive occupancy controller for one kernel.
pub struct WaveLimiter {
    kernel: Arc<str>,
    tunables: Arc<WaveLimitTunables>,
    supports_wave_limit: bool,
    simd_per_sh: u32,
    enabled: bool,
    phase: Phase,
    /// Waves per SIMD for the next dispatch; `None` = no limit.
    waves: Option<u32>,
    best_wave: u32,
    count_all: u32,
    data_count: u32,
    run_budget: u32,
    discontinuous: bool,
    /// The current `waves` was handed to a dispatch since the last sample.
    wave_set: bool,
    measure: Vec<u64>,
    reference: Vec<u64>,
    trial: Vec<u64>,
    ratio: Vec<u64>,
    rng: ChaCha8Rng,
    dumper: DataDumper,
    trace: TraceSink,
}

impl WaveLimiter {
    /// New, disabled controller.  Call [`enable`](Self::enable) to start
    /// adapting.
    pub fn new(kernel: &str, tunables: Arc<WaveLimitTunables>, hw: &HardwareInfo) -> Self {
        let slots = tunables.max_wave as usize + 1;
        let rng = match tunables.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let mut limiter = Self {
            kernel: kernel.into(),
            supports_wave_limit: hw.supports_wave_limit,
            simd_per_sh: tunables.cu_per_sh.unwrap_or_else(|| hw.simds_per_shader_array()),
            enabled: false,
            phase: Phase::Warmup,
            waves: None,
            best_wave: tunables.max_wave,
            count_all: 0,
            data_count: 0,
            run_budget: tunables.run_count,
            discontinuous: false,
            wave_set: false,
            measure: vec![0; slots],
            reference: vec![0; slots],
            trial: vec![0; slots],
            ratio: vec![0; slots],
            rng,
            dumper: DataDumper::new(tunables.dump_prefix.as_deref(), kernel),
            trace: TraceSink::open(tunables.trace_prefix.as_deref(), kernel),
            tunables,
        };
        limiter.clear_data();
        limiter.waves = limiter.tunables.waves_per_simd;
        limiter
    }

    /// Turn adaptation on for a kernel that asked for it.
    ///
    /// No-op when a fixed waves-per-SIMD value is configured or the
    /// controller is already enabled.
    pub fn enable(&mut self, limit_hint: bool) {
        if self.enabled || self.tunables.waves_per_simd.is_some() {
            return;
        }
        self.enabled = self.tunables.enable.unwrap_or(limit_hint && self.supports_wave_limit);
        if self.enabled {
            self.waves = Some(self.tunables.max_wave);
            debug!(kernel = %self.kernel, max_wave = self.tunables.max_wave, "wave limiter enabled");
        }
    }

    /// Kernel this controller tunes.
    pub fn kernel(&self) -> &str {
        &self.kernel
    }

    /// Whether samples still drive the limit.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Current limit in waves per SIMD, without marking it applied.
    pub fn waves_per_simd(&self) -> Option<u32> {
        self.waves
    }

    /// Limit in waves per shader array for the next dispatch.  Marks the
    /// setting applied.
    pub fn waves_per_sh(&mut self) -> Option<u32> {
        self.wave_set = true;
        self.waves.map(|w| w * self.simd_per_sh)
    }

    /// SIMDs per shader array used to scale the limit.
    pub fn simd_per_sh(&self) -> u32 {
        self.simd_per_sh
    }

    /// Best occupancy of the current or last sweep.
    pub fn best_wave(&self) -> u32 {
        self.best_wave
    }

    /// Invocations the current RUN phase lasts.
    pub fn run_budget(&self) -> u32 {
        self.run_budget
    }

    /// Invocations counted in the current phase.
    pub fn count_all(&self) -> u32 {
        self.count_all
    }

    /// Samples taken in the current sweep.
    pub fn data_count(&self) -> u32 {
        self.data_count
    }

    /// A baseline jump was seen in this sweep.
    pub fn is_discontinuous(&self) -> bool {
        self.discontinuous
    }

    /// Ratio recorded for `wave` in the current sweep.
    pub fn ratio(&self, wave: u32) -> Option<u64> {
        self.ratio.get(wave as usize).copied()
    }

    /// Dispatches need timestamps, for adaptation or for the dump.
    pub fn wants_profiling(&self) -> bool {
        self.enabled || self.dumper.is_enabled()
    }

    /// Sample dump written when the controller is dropped.
    pub fn dumper(&self) -> &DataDumper {
        &self.dumper
    }

    /// Feed back the execution time of the last dispatch.
    pub fn on_complete(&mut self, duration_ns: u64) {
        self.dumper.record(duration_ns, self.waves.unwrap_or(0), self.phase);
        if !self.enabled {
            return;
        }
        self.count_all += 1;
        match self.phase {
            Phase::Warmup => {
                if self.count_all >= self.tunables.warmup_count {
                    self.enter_adapt();
                }
            }
            Phase::Adapt => self.adapt(duration_ns),
            Phase::Run => {
                if self.count_all >= self.run_budget {
                    self.enter_adapt();
                }
            }
        }
    }

    // ── ADAPT ───────────────────────────────────────────────────────

    fn adapt(&mut self, duration_ns: u64) {
        if self.wave_set {
            if duration_ns == 0 {
                self.disable("zero-length sample");
                return;
            }
            self.data_count += 1;
            if let Err(reason) = self.update_data(duration_ns) {
                self.disable(reason);
                return;
            }

            let max = self.tunables.max_wave;
            let next = max + 1 - self.data_count / 2;
            let keep_going = self.data_count == 1
                || (self.data_count < self.tunables.adapt_count
                    && !self.discontinuous
                    && (self.data_count % 2 == 0
                        || self.ratio[next as usize] <= self.tunables.abandon_thresh as u64));
            if keep_going {
                self.waves = Some(if self.data_count % 2 == 1 { next - 1 } else { max });
                self.wave_set = false;
                return;
            }
        }
        self.commit();
    }

    /// Store one sample.  Odd `data_count` is a baseline, even a trial.
    fn update_data(&mut self, time: u64) -> Result<(), &'static str> {
        let count = self.data_count - 1;
        if count >= self.tunables.adapt_count {
            return Err("sample index past the end of the sweep");
        }
        let max = self.tunables.max_wave as usize;

        if count % 2 == 0 {
            let pos = (count / 2) as usize;
            self.measure[pos] = time;
            if pos > 0 {
                let wave = max + 1 - pos;
                let prev = self.measure[pos - 1];
                if prev.abs_diff(time) * 100 / time > self.tunables.dsc_thresh as u64 {
                    self.discontinuous = true;
                }
                self.reference[wave] = (time + prev) / 2;
                self.ratio[wave] = self.trial[wave] * 100 / self.reference[wave];
                if self.ratio[self.best_wave as usize] > self.ratio[wave] && !self.discontinuous {
                    self.best_wave = wave as u32;
                }
            }
        } else {
            let wave = self.waves.unwrap_or(0) as usize;
            if wave == 0 || wave > max {
                return Err("trial occupancy out of range");
            }
            self.trial[wave] = time;
        }
        self.output_trace();
        Ok(())
    }

    fn commit(&mut self) {
        let max = self.tunables.max_wave;
        let full_sweep = self.data_count >= self.tunables.adapt_count;
        self.waves = Some(self.best_wave);
        self.wave_set = false;
        self.run_budget =
            if full_sweep { self.tunables.run_count } else { self.tunables.adapt_count };
        self.count_all = self.rng.gen_range(0..max);
        self.phase = Phase::Run;
        debug!(
            kernel = %self.kernel,
            best_wave = self.best_wave,
            samples = self.data_count,
            full_sweep,
            discontinuous = self.discontinuous,
            run_budget = self.run_budget,
            offset = self.count_all,
            "wave limiter committed"
        );
    }

    fn enter_adapt(&mut self) {
        debug!(kernel = %self.kernel, from = %self.phase, "wave limiter sweep start");
        self.phase = Phase::Adapt;
        self.best_wave = self.tunables.max_wave;
        self.clear_data();
    }

    fn clear_data(&mut self) {
        self.waves = Some(self.tunables.max_wave);
        self.count_all = 0;
        self.data_count = 0;
        self.discontinuous = false;
        self.wave_set = false;
        for buf in [&mut self.measure, &mut self.reference, &mut self.trial, &mut self.ratio] {
            buf.fill(0);
        }
    }

    fn disable(&mut self, reason: &str) {
        warn!(
            kernel = %self.kernel,
            reason,
            samples = self.data_count,
            "wave limiter disabled, falling back to maximum occupancy"
        );
        self.enabled = false;
        self.waves = None;
    }

    fn output_trace(&mut self) {
        if !self.trace.is_enabled() {
            return;
        }
        self.trace.write(&TraceSnapshot {
            kernel: &self.kernel,
            phase: self.phase as u8,
            waves: self.waves.unwrap_or(0),
            best_wave: self.best_wave,
            measure: &self.measure,
            reference: &self.reference,
            ratio: &self.ratio,
        });
    }
}

impl OccupancyController for WaveLimiter {
    fn kernel_name(&self) -> &str {
        &self.kernel
    }

    fn waves_per_sh(&mut self) -> Option<u32> {
        WaveLimiter::waves_per_sh(self)
    }

    fn wants_profiling(&self) -> bool {
        WaveLimiter::wants_profiling(self)
    }

    fn on_complete(&mut self, duration_ns: u64) {
        WaveLimiter::on_complete(self, duration_ns)
    }
}

impl fmt::Debug for WaveLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaveLimiter")
            .field("kernel", &self.kernel)
            .field("enabled", &self.enabled)
            .field("phase", &self.phase)
            .field("waves", &self.waves)
            .field("best_wave", &self.best_wave)
            .field("data_count", &self.data_count)
            .field("run_budget", &self.run_budget)
            .finish_non_exhaustive()
    }
}
