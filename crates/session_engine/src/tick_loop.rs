use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::metrics::{MetricsAccumulator, MetricsHandle, SessionGauges};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub tick_rate_hz: u32,
    pub max_ticks_per_step: u32,
    pub max_step_delta: Duration,
    pub metrics_log_interval: Duration,
    pub max_ticks: Option<u64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 30,
            max_ticks_per_step: 5,
            max_step_delta: Duration::from_millis(250),
            metrics_log_interval: Duration::from_secs(1),
            max_ticks: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub control: LoopControl,
    pub gauges: SessionGauges,
}

impl StepOutcome {
    pub fn proceed(gauges: SessionGauges) -> Self {
        Self {
            control: LoopControl::Continue,
            gauges,
        }
    }

    pub fn stop(gauges: SessionGauges) -> Self {
        Self {
            control: LoopControl::Stop,
            gauges,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub ticks: u64,
    pub dropped_backlog: Duration,
}

/// Fixed-step server loop. `step` receives the fixed tick delta and runs one
/// whole session tick; the loop sleeps off whatever time is left.
pub fn run_headless<F>(
    config: &LoopConfig,
    metrics: &MetricsHandle,
    stop: &AtomicBool,
    mut step: F,
) -> LoopSummary
where
    F: FnMut(Duration) -> StepOutcome,
{
    let tick_rate = config.tick_rate_hz.max(1);
    let fixed_dt = Duration::from_secs_f64(1.0 / tick_rate as f64);
    let max_step_delta =
        normalize_non_zero_duration(config.max_step_delta, Duration::from_millis(250));
    let max_ticks_per_step = config.max_ticks_per_step.max(1);
    let metrics_log_interval =
        normalize_non_zero_duration(config.metrics_log_interval, Duration::from_secs(1));
    let mut accumulator_metrics = MetricsAccumulator::new(metrics_log_interval);
    let mut summary = LoopSummary::default();
    let mut accumulator = Duration::ZERO;
    let mut last = Instant::now();

    info!(
        tick_rate_hz = tick_rate,
        max_ticks_per_step,
        max_ticks = ?config.max_ticks,
        "tick_loop_started"
    );

    'outer: loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let now = Instant::now();
        let frame_dt = clamp_frame_delta(now.saturating_duration_since(last), max_step_delta);
        last = now;
        accumulator = accumulator.saturating_add(frame_dt);

        let plan = plan_sim_steps(accumulator, fixed_dt, max_ticks_per_step);
        accumulator = plan.remaining_accumulator;
        if !plan.dropped_backlog.is_zero() {
            summary.dropped_backlog = summary.dropped_backlog.saturating_add(plan.dropped_backlog);
            warn!(
                dropped_ms = plan.dropped_backlog.as_millis() as u64,
                "tick_backlog_dropped"
            );
        }

        for _ in 0..plan.ticks_to_run {
            let tick_start = Instant::now();
            let outcome = step(fixed_dt);
            accumulator_metrics.record_tick(tick_start.elapsed(), outcome.gauges);
            summary.ticks = summary.ticks.saturating_add(1);

            let limit_hit = config
                .max_ticks
                .is_some_and(|limit| summary.ticks >= limit);
            if outcome.control == LoopControl::Stop || limit_hit {
                publish_metrics(&mut accumulator_metrics, metrics, Instant::now());
                break 'outer;
            }
        }

        publish_metrics(&mut accumulator_metrics, metrics, Instant::now());
        let sleep = fixed_dt.saturating_sub(accumulator);
        if !sleep.is_zero() {
            thread::sleep(sleep);
        }
    }

    info!(ticks = summary.ticks, "tick_loop_stopped");
    summary
}

fn publish_metrics(accumulator: &mut MetricsAccumulator, handle: &MetricsHandle, now: Instant) {
    if let Some(snapshot) = accumulator.maybe_snapshot(now) {
        handle.publish(snapshot);
        info!(
            tps = snapshot.tps,
            tick_time_ms = snapshot.tick_time_ms,
            participants = snapshot.participants,
            spawn_queue_len = snapshot.spawn_queue_len,
            pending_group_ops = snapshot.pending_group_ops,
            busy_loading = snapshot.busy_loading,
            "tick_metrics"
        );
    }
}

struct StepPlan {
    ticks_to_run: u32,
    remaining_accumulator: Duration,
    dropped_backlog: Duration,
}

fn plan_sim_steps(mut accumulator: Duration, fixed_dt: Duration, max_ticks_per_step: u32) -> StepPlan {
    let mut ticks_to_run = 0u32;

    while accumulator >= fixed_dt && ticks_to_run < max_ticks_per_step {
        accumulator = accumulator.saturating_sub(fixed_dt);
        ticks_to_run = ticks_to_run.saturating_add(1);
    }

    if accumulator >= fixed_dt {
        StepPlan {
            ticks_to_run,
            remaining_accumulator: Duration::ZERO,
            dropped_backlog: accumulator,
        }
    } else {
        StepPlan {
            ticks_to_run,
            remaining_accumulator: accumulator,
            dropped_backlog: Duration::ZERO,
        }
    }
}

fn clamp_frame_delta(frame_dt: Duration, max_frame_delta: Duration) -> Duration {
    frame_dt.min(max_frame_delta)
}

fn normalize_non_zero_duration(value: Duration, fallback: Duration) -> Duration {
    if value.is_zero() {
        fallback
    } else {
        value
    }
}
