use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

static METRICS_LOCK_POISON_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_metrics_lock_poison_once(operation: &'static str) {
    if METRICS_LOCK_POISON_WARNED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        warn!(operation, "metrics lock poisoned; recovered inner value");
    }
}

/// Point-in-time session state sampled after a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionGauges {
    pub participants: usize,
    pub spawn_queue_len: usize,
    pub pending_group_ops: usize,
    pub busy_loading: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickMetricsSnapshot {
    pub tps: f32,
    pub tick_time_ms: f32,
    pub participants: usize,
    pub spawn_queue_len: usize,
    pub pending_group_ops: usize,
    pub busy_loading: bool,
}

#[derive(Clone, Debug)]
pub struct MetricsHandle {
    snapshot: Arc<RwLock<TickMetricsSnapshot>>,
}

impl Default for MetricsHandle {
    fn default() -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(TickMetricsSnapshot::default())),
        }
    }
}

impl MetricsHandle {
    pub fn snapshot(&self) -> TickMetricsSnapshot {
        match self.snapshot.read() {
            Ok(guard) => *guard,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("read");
                *poisoned.into_inner()
            }
        }
    }

    pub(crate) fn publish(&self, snapshot: TickMetricsSnapshot) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("write");
                let mut guard = poisoned.into_inner();
                *guard = snapshot;
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct MetricsAccumulator {
    interval_start: Instant,
    interval: Duration,
    ticks: u32,
    tick_time_sum: Duration,
    gauges: SessionGauges,
}

impl MetricsAccumulator {
    pub(crate) fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    pub(crate) fn starting_at(interval: Duration, start: Instant) -> Self {
        Self {
            interval_start: start,
            interval,
            ticks: 0,
            tick_time_sum: Duration::ZERO,
            gauges: SessionGauges::default(),
        }
    }

    pub(crate) fn record_tick(&mut self, tick_time: Duration, gauges: SessionGauges) {
        self.ticks = self.ticks.saturating_add(1);
        self.tick_time_sum = self.tick_time_sum.saturating_add(tick_time);
        self.gauges = gauges;
    }

    pub(crate) fn maybe_snapshot(&mut self, now: Instant) -> Option<TickMetricsSnapshot> {
        let elapsed = now.saturating_duration_since(self.interval_start);
        if elapsed < self.interval {
            return None;
        }

        let elapsed_seconds = elapsed.as_secs_f32().max(f32::EPSILON);
        let tick_time_ms = if self.ticks == 0 {
            0.0
        } else {
            (self.tick_time_sum.as_secs_f32() / self.ticks as f32) * 1000.0
        };

        let snapshot = TickMetricsSnapshot {
            tps: self.ticks as f32 / elapsed_seconds,
            tick_time_ms,
            participants: self.gauges.participants,
            spawn_queue_len: self.gauges.spawn_queue_len,
            pending_group_ops: self.gauges.pending_group_ops,
            busy_loading: self.gauges.busy_loading,
        };

        self.interval_start = now;
        self.ticks = 0;
        self.tick_time_sum = Duration::ZERO;

        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;
    use std::thread;

    use super::*;

    fn poison_lock(lock: &RwLock<TickMetricsSnapshot>) {
        thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = lock.write().expect("write guard");
                    panic!("poison metrics lock");
                })
                .join();
        });
    }

    #[test]
    fn snapshot_averages_tick_time_and_keeps_latest_gauges() {
        let base = Instant::now();
        let mut accumulator = MetricsAccumulator::starting_at(Duration::from_secs(1), base);

        accumulator.record_tick(Duration::from_millis(2), SessionGauges::default());
        accumulator.record_tick(
            Duration::from_millis(4),
            SessionGauges {
                participants: 3,
                spawn_queue_len: 1,
                pending_group_ops: 2,
                busy_loading: true,
            },
        );

        let snapshot = accumulator
            .maybe_snapshot(base + Duration::from_secs(1))
            .expect("snapshot should be emitted");

        assert!((snapshot.tps - 2.0).abs() < 0.05);
        assert!((snapshot.tick_time_ms - 3.0).abs() < 0.001);
        assert_eq!(snapshot.participants, 3);
        assert_eq!(snapshot.pending_group_ops, 2);
        assert!(snapshot.busy_loading);
    }

    #[test]
    fn snapshot_not_emitted_before_interval() {
        let base = Instant::now();
        let mut accumulator = MetricsAccumulator::starting_at(Duration::from_secs(1), base);
        accumulator.record_tick(Duration::from_millis(1), SessionGauges::default());

        assert!(accumulator
            .maybe_snapshot(base + Duration::from_millis(500))
            .is_none());
    }

    #[test]
    fn publish_and_read_recover_after_poison() {
        let handle = MetricsHandle::default();
        poison_lock(handle.snapshot.as_ref());
        assert_eq!(handle.snapshot(), TickMetricsSnapshot::default());

        let expected = TickMetricsSnapshot {
            tps: 30.0,
            tick_time_ms: 1.5,
            participants: 4,
            spawn_queue_len: 0,
            pending_group_ops: 0,
            busy_loading: false,
        };
        handle.publish(expected);
        assert_eq!(handle.snapshot(), expected);
    }
}
