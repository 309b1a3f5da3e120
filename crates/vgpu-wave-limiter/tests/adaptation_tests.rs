//! Sweep, commit and re-adaptation behaviour of the wave limiter.

use std::collections::VecDeque;
use std::sync::Arc;
use vgpu_config::WaveLimitConfig;
use vgpu_wave_limiter::{HardwareInfo, Phase, WaveLimiter};

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

/// One SIMD per shader array, so waves per SH equal waves per SIMD.
const FLAT: HardwareInfo =
    HardwareInfo { supports_wave_limit: true, cus_per_shader_array: 1, simds_per_cu: 1 };

fn limiter(cfg: WaveLimitConfig) -> WaveLimiter {
    let mut wl = WaveLimiter::new("gemm", Arc::new(cfg.tunables()), &FLAT);
    wl.enable(true);
    wl
}

/// Dispatch then complete once, timing the dispatch with `latency`.
fn step(wl: &mut WaveLimiter, latency: impl Fn(u32) -> u64) {
    let waves = wl.waves_per_sh().expect("limiter enabled");
    wl.on_complete(latency(waves));
}

fn run_warmup(wl: &mut WaveLimiter, latency: impl Fn(u32) -> u64 + Copy) {
    while wl.phase() == Phase::Warmup {
        step(wl, latency);
    }
}

fn valley(w: u32) -> u64 {
    100 + 10 * (w as i64 - 3).unsigned_abs()
}

#[test]
fn warmup_lasts_warmup_count_invocations() {
    let mut wl = limiter(WaveLimitConfig { seed: Some(1), ..Default::default() });
    for _ in 0..9 {
        step(&mut wl, |_| 500);
        assert_eq!(wl.phase(), Phase::Warmup);
        assert_eq!(wl.waves_per_simd(), Some(8));
    }
    step(&mut wl, |_| 500);
    assert_eq!(wl.phase(), Phase::Adapt);
}

#[test]
fn full_sweep_converges_to_fastest_occupancy() {
    init_tracing();
    let cfg = WaveLimitConfig { max_wave: 8, seed: Some(42), ..Default::default() };
    let t = cfg.tunables();
    let mut wl = limiter(cfg);
    run_warmup(&mut wl, valley);

    // Baselines at max, trials at 8, 7, ..., 1.
    let mut seen = Vec::new();
    for _ in 0..t.adapt_count {
        assert_eq!(wl.phase(), Phase::Adapt);
        seen.push(wl.waves_per_simd().unwrap());
        step(&mut wl, valley);
    }
    let trials: Vec<u32> = seen.iter().skip(1).step_by(2).copied().collect();
    assert_eq!(trials, (1..=8).rev().collect::<Vec<_>>());
    assert!(seen.iter().step_by(2).all(|&w| w == 8));

    assert_eq!(wl.phase(), Phase::Run);
    assert_eq!(wl.best_wave(), 3);
    assert_eq!(wl.waves_per_simd(), Some(3));
    assert_eq!(wl.run_budget(), t.run_count);
    assert!(wl.count_all() < t.max_wave);
    assert_eq!(wl.ratio(3), Some(100 * 100 / 150));
}

#[test]
fn run_phase_returns_to_adapt_after_budget() {
    let cfg = WaveLimitConfig { max_wave: 4, warmup: 1, run_multiplier: 5, seed: Some(3), ..Default::default() };
    let t = cfg.tunables();
    let mut wl = limiter(cfg);
    run_warmup(&mut wl, valley);
    while wl.phase() == Phase::Adapt {
        step(&mut wl, valley);
    }
    assert_eq!(wl.phase(), Phase::Run);
    let offset = wl.count_all();

    let mut run_steps = 0;
    while wl.phase() == Phase::Run {
        assert_eq!(wl.waves_per_simd(), Some(3));
        step(&mut wl, valley);
        run_steps += 1;
    }
    assert_eq!(run_steps, t.run_count - offset);
    assert_eq!(wl.phase(), Phase::Adapt);
    assert_eq!(wl.waves_per_simd(), Some(4));
    assert_eq!(wl.best_wave(), 4);
    assert_eq!(wl.data_count(), 0);
}

#[test]
fn ratio_above_abandon_threshold_ends_sweep_early() {
    let cfg = WaveLimitConfig { max_wave: 8, warmup: 1, seed: Some(9), ..Default::default() };
    let t = cfg.tunables();
    let mut wl = limiter(cfg);
    let latency = |w: u32| match w {
        8 => 100,
        7 => 90,
        6 => 95,
        5 => 120,
        _ => 100,
    };
    run_warmup(&mut wl, latency);
    while wl.phase() == Phase::Adapt {
        step(&mut wl, latency);
    }
    // Trials at 8, 7, 6, 5 with their baselines.
    assert_eq!(wl.data_count(), 9);
    assert_eq!(wl.ratio(5), Some(120));
    assert_eq!(wl.best_wave(), 7);
    assert_eq!(wl.waves_per_simd(), Some(7));
    assert_eq!(wl.run_budget(), t.adapt_count);
}

#[test]
fn baseline_jump_keeps_prior_best() {
    let cfg = WaveLimitConfig { max_wave: 4, warmup: 1, seed: Some(5), ..Default::default() };
    let mut wl = limiter(cfg);
    run_warmup(&mut wl, |_| 100);

    // base, trial@4, base, trial@3, base, trial@2, disturbed base
    let mut script: VecDeque<u64> = [100, 100, 100, 80, 100, 50, 200].into();
    while wl.phase() == Phase::Adapt {
        let d = script.pop_front().expect("sweep should have ended");
        step(&mut wl, |_| d);
    }
    assert!(script.is_empty());
    assert!(wl.is_discontinuous());
    assert_eq!(wl.ratio(2), Some(50 * 100 / 150));
    assert_eq!(wl.best_wave(), 3);
    assert_eq!(wl.waves_per_simd(), Some(3));
}

#[test]
fn equal_ratios_keep_higher_occupancy() {
    let cfg = WaveLimitConfig { max_wave: 4, warmup: 1, seed: Some(5), ..Default::default() };
    let mut wl = limiter(cfg);
    run_warmup(&mut wl, |_| 100);
    while wl.phase() == Phase::Adapt {
        step(&mut wl, |_| 100);
    }
    assert_eq!(wl.best_wave(), 4);
    assert_eq!(wl.data_count(), 9);
}

#[test]
fn zero_duration_sample_disables_controller() {
    let mut wl = limiter(WaveLimitConfig { warmup: 1, ..Default::default() });
    run_warmup(&mut wl, |_| 100);
    step(&mut wl, |_| 100);
    step(&mut wl, |_| 0);
    assert!(!wl.is_enabled());
    assert_eq!(wl.waves_per_sh(), None);
    // Further samples are ignored.
    wl.on_complete(100);
    assert_eq!(wl.phase(), Phase::Adapt);
}

#[test]
fn disabled_controller_reports_no_limit() {
    let mut wl = WaveLimiter::new("k", Arc::new(WaveLimitConfig::default().tunables()), &FLAT);
    wl.enable(false);
    for _ in 0..50 {
        assert_eq!(wl.waves_per_sh(), None);
        wl.on_complete(1_000);
    }
    assert_eq!(wl.phase(), Phase::Warmup);
}

#[test]
fn enable_override_off_wins_over_hint() {
    let cfg = WaveLimitConfig { enable: Some(false), ..Default::default() };
    let mut wl = WaveLimiter::new("k", Arc::new(cfg.tunables()), &FLAT);
    wl.enable(true);
    assert!(!wl.is_enabled());
    assert!(!wl.wants_profiling());
}

#[test]
fn waves_scale_by_simds_per_shader_array() {
    let hw = HardwareInfo { supports_wave_limit: true, cus_per_shader_array: 10, simds_per_cu: 2 };
    let mut wl = WaveLimiter::new("k", Arc::new(WaveLimitConfig::default().tunables()), &hw);
    wl.enable(true);
    assert_eq!(wl.waves_per_sh(), Some(8 * 20));

    let cfg = WaveLimitConfig { cu_per_sh: Some(3), ..Default::default() };
    let mut wl = WaveLimiter::new("k", Arc::new(cfg.tunables()), &hw);
    wl.enable(true);
    assert_eq!(wl.waves_per_sh(), Some(8 * 3));
}

#[test]
fn same_seed_same_run_offset() {
    let offsets: Vec<u32> = (0..2)
        .map(|_| {
            let mut wl = limiter(WaveLimitConfig { warmup: 1, seed: Some(77), ..Default::default() });
            while wl.phase() != Phase::Run {
                step(&mut wl, valley);
            }
            wl.count_all()
        })
        .collect();
    assert_eq!(offsets[0], offsets[1]);
}

#[test]
fn late_sample_after_run_does_not_become_a_baseline() {
    let cfg = WaveLimitConfig { max_wave: 4, warmup: 1, run_multiplier: 1, seed: Some(2), ..Default::default() };
    let t = cfg.tunables();
    let mut wl = limiter(cfg);
    run_warmup(&mut wl, valley);
    while wl.phase() == Phase::Adapt {
        step(&mut wl, valley);
    }
    assert_eq!(wl.waves_per_simd(), Some(3));
    while wl.phase() == Phase::Run {
        step(&mut wl, valley);
    }
    assert_eq!(wl.phase(), Phase::Adapt);

    // A completion from a dispatch issued at the committed occupancy,
    // arriving before any dispatch of the new sweep.
    wl.on_complete(valley(3));
    assert_eq!(wl.data_count(), 0);
    assert_eq!((1..=4).filter_map(|w| wl.ratio(w)).sum::<u64>(), 0);
    assert_eq!(wl.phase(), Phase::Run);
    assert_eq!(wl.waves_per_simd(), Some(4));
    assert_eq!(wl.run_budget(), t.adapt_count);
}
