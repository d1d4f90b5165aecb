//! Node health monitor.
//!
//! A single-owner periodic loop classifies the local node as HEALTHY,
//! OVERLOADED, or UNHEALTHY from per-worker stall histories. Report sinks
//! may be called from any thread; they enqueue onto the monitor's queue and
//! the loop task applies them, so no internal state is shared.
//!
//! Overload is a direct signal (too many workers with congested request
//! queues). Unhealthiness is hysteretic: negative signals (stalled workers,
//! watchdog delays, the monitor's own loop overrunning) grow an adaptive
//! timer, and the node reads as unhealthy until the timer decays back under
//! the loop period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};

use crate::backoff::AdaptiveBackoff;
use crate::config::HealthMonitorSettings;
use crate::stats::Stats;
use crate::timeseries::BucketedStallSeries;

/// Buckets per stall series.
const NUM_BUCKETS: usize = 12;
/// Sleep periods of history each stall series retains.
const NUM_PERIODS: u32 = 6;
/// Sliding-window evaluation looks back `2 * PERIOD_RANGE` half-periods.
const PERIOD_RANGE: u32 = 3;
/// Loop lateness beyond the nominal period that counts as an overrun.
const MAX_LOOP_STALL: Duration = Duration::from_millis(50);
/// Ceiling of the state timer.
const MAX_TIMER_VALUE: Duration = Duration::from_secs(10);
const TIMER_MULTIPLIER: f64 = 2.0;
const TIMER_DECREASE_RATE: f64 = 1.0;
const TIMER_FUZZ_FACTOR: f64 = 0.1;

/// Node health classification, published after every loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum NodeHealthState {
    Healthy,
    Overloaded,
    Unhealthy,
}

enum Report {
    WatchdogHealth { delayed: bool },
    StalledWorkers { count: usize },
    WorkerStall { idx: usize, at: Instant, duration: Duration },
    WorkerQueueStall { idx: usize, at: Instant, duration: Duration },
}

struct LoopParts {
    report_rx: mpsc::UnboundedReceiver<Report>,
    done_tx: oneshot::Sender<()>,
}

pub struct HealthMonitor {
    settings: HealthMonitorSettings,
    stats: Arc<Stats>,
    report_tx: mpsc::UnboundedSender<Report>,
    state_rx: watch::Receiver<NodeHealthState>,
    state_tx: watch::Sender<NodeHealthState>,
    shutdown: Arc<AtomicBool>,
    shutdown_done: Shared<BoxFuture<'static, ()>>,
    /// Receiver half and completion sender, consumed by `start_up`.
    loop_parts: Mutex<Option<LoopParts>>,
}

impl HealthMonitor {
    pub fn new(settings: HealthMonitorSettings, stats: Arc<Stats>) -> Self {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NodeHealthState::Healthy);
        let (done_tx, done_rx) = oneshot::channel();
        let shutdown_done: BoxFuture<'static, ()> = Box::pin(async move {
            let _ = done_rx.await;
        });
        Self {
            settings,
            stats,
            report_tx,
            state_rx,
            state_tx,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_done: shutdown_done.shared(),
            loop_parts: Mutex::new(Some(LoopParts { report_rx, done_tx })),
        }
    }

    /// Spawn the monitor loop. Calling more than once is a no-op.
    pub fn start_up(&self) {
        let Some(parts) = self.loop_parts.lock().unwrap().take() else {
            return;
        };
        let core = MonitorCore::new(self.settings, Arc::clone(&self.stats), Instant::now());
        let state_tx = self.state_tx.clone();
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(monitor_loop(
            core,
            parts.report_rx,
            state_tx,
            shutdown,
            parts.done_tx,
        ));
    }

    /// Request shutdown. The returned future resolves once the loop exits;
    /// repeated calls return the same future.
    pub fn shutdown(&self) -> Shared<BoxFuture<'static, ()>> {
        self.shutdown.store(true, Ordering::Relaxed);
        // Never started: fulfil the promise ourselves.
        if let Some(parts) = self.loop_parts.lock().unwrap().take() {
            let _ = parts.done_tx.send(());
        }
        self.shutdown_done.clone()
    }

    /// Snapshot of the last published classification.
    pub fn node_state(&self) -> NodeHealthState {
        *self.state_rx.borrow()
    }

    /// Watch handle for callers that want to await transitions.
    pub fn subscribe(&self) -> watch::Receiver<NodeHealthState> {
        self.state_rx.clone()
    }

    pub fn report_watchdog_health(&self, delayed: bool) {
        self.report(Report::WatchdogHealth { delayed });
    }

    pub fn report_stalled_workers(&self, count: usize) {
        self.report(Report::StalledWorkers { count });
    }

    pub fn report_worker_stall(&self, idx: usize, duration: Duration) {
        self.report(Report::WorkerStall {
            idx,
            at: Instant::now(),
            duration,
        });
    }

    pub fn report_worker_queue_stall(&self, idx: usize, duration: Duration) {
        self.report(Report::WorkerQueueStall {
            idx,
            at: Instant::now(),
            duration,
        });
    }

    fn report(&self, report: Report) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.report_tx.send(report);
    }
}

async fn monitor_loop(
    mut core: MonitorCore,
    mut report_rx: mpsc::UnboundedReceiver<Report>,
    state_tx: watch::Sender<NodeHealthState>,
    shutdown: Arc<AtomicBool>,
    done_tx: oneshot::Sender<()>,
) {
    let sleep_period = core.settings.sleep_period;
    let mut last_entry = Instant::now();
    loop {
        tokio::time::sleep(sleep_period).await;
        core.stats
            .health_monitor_num_loops
            .fetch_add(1, Ordering::Relaxed);
        if shutdown.load(Ordering::Relaxed) {
            let _ = done_tx.send(());
            return;
        }

        let now = Instant::now();
        let loop_interval = now.saturating_duration_since(last_entry);
        last_entry = now;
        core.monitor_delay = loop_interval > sleep_period + MAX_LOOP_STALL;

        while let Ok(report) = report_rx.try_recv() {
            core.apply_report(report);
        }
        let state = core.evaluate(now);
        state_tx.send_if_modified(|current| {
            if *current != state {
                tracing::info!(state = ?state, "node health transition");
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

struct StallInfo {
    stalled: bool,
    critically_stalled: usize,
}

/// All mutable monitor state. Owned by the loop task; unit tests drive it
/// directly with synthetic clocks.
struct MonitorCore {
    settings: HealthMonitorSettings,
    stats: Arc<Stats>,
    worker_stalls: Vec<BucketedStallSeries>,
    worker_queue_stalls: Vec<BucketedStallSeries>,
    state_timer: AdaptiveBackoff,
    watchdog_delay: bool,
    monitor_delay: bool,
    total_stalled_workers: usize,
    overloaded: bool,
}

impl MonitorCore {
    fn new(settings: HealthMonitorSettings, stats: Arc<Stats>, origin: Instant) -> Self {
        let window = settings.sleep_period * NUM_PERIODS;
        let series = |_: usize| BucketedStallSeries::new(NUM_BUCKETS, window, origin);
        Self {
            worker_stalls: (0..settings.num_workers).map(series).collect(),
            worker_queue_stalls: (0..settings.num_workers).map(series).collect(),
            state_timer: AdaptiveBackoff::new(
                // Cannot be unhealthy for less than one loop.
                settings.sleep_period,
                settings.sleep_period,
                MAX_TIMER_VALUE,
                TIMER_MULTIPLIER,
                TIMER_DECREASE_RATE,
                TIMER_FUZZ_FACTOR,
            ),
            settings,
            stats,
            watchdog_delay: false,
            monitor_delay: false,
            total_stalled_workers: 0,
            overloaded: false,
        }
    }

    fn apply_report(&mut self, report: Report) {
        match report {
            Report::WatchdogHealth { delayed } => self.watchdog_delay = delayed,
            Report::StalledWorkers { count } => self.total_stalled_workers = count,
            Report::WorkerStall { idx, at, duration } => {
                if let Some(series) = self.worker_stalls.get_mut(idx) {
                    series.add(at, duration);
                }
            }
            Report::WorkerQueueStall { idx, at, duration } => {
                if let Some(series) = self.worker_queue_stalls.get_mut(idx) {
                    series.add(at, duration);
                }
            }
        }
    }

    /// Run one classification pass at `now`.
    fn evaluate(&mut self, now: Instant) -> NodeHealthState {
        self.update_variables(now);
        self.calculate_negative_signal(now);
        let state = if self.state_timer.current() > self.settings.sleep_period {
            NodeHealthState::Unhealthy
        } else if self.overloaded {
            NodeHealthState::Overloaded
        } else {
            NodeHealthState::Healthy
        };
        if state == NodeHealthState::Healthy {
            self.stats
                .health_monitor_state_indicator
                .fetch_add(1, Ordering::Relaxed);
        }
        state
    }

    fn update_variables(&mut self, now: Instant) {
        for series in &mut self.worker_stalls {
            series.advance(now);
        }
        for series in &mut self.worker_queue_stalls {
            series.advance(now);
        }
        // Timekeeping: decay the state timer by the elapsed interval.
        self.state_timer.positive_feedback(now);
    }

    fn calculate_negative_signal(&mut self, now: Instant) {
        let half_period = self.settings.sleep_period / 2;
        let stall_info = self.is_stalled(now, half_period);
        self.overloaded = self.is_overloaded(now, half_period);
        self.stats
            .health_monitor_stall_indicator
            .fetch_add(u64::from(stall_info.stalled), Ordering::Relaxed);
        self.stats
            .health_monitor_overload_indicator
            .fetch_add(u64::from(self.overloaded), Ordering::Relaxed);

        if self.monitor_delay
            || self.watchdog_delay
            || self.total_stalled_workers > 0
            || stall_info.stalled
        {
            self.state_timer.negative_feedback();
            self.state_timer.positive_feedback(now);
        }
        if stall_info.critically_stalled > 0 {
            self.state_timer.negative_feedback();
            self.state_timer.positive_feedback(now);
        }
    }

    /// The node is overloaded when too many workers have a recent window of
    /// congested request queues.
    fn is_overloaded(&self, now: Instant, half_period: Duration) -> bool {
        let max_avg_us = self.settings.max_queue_stalls_avg.as_micros() as u64;
        let threshold = self.settings.max_queue_stall_duration;
        let congested = self
            .worker_queue_stalls
            .iter()
            .filter(|series| {
                any_window(now, half_period, |from, to| {
                    let sum = series.sum(from, to);
                    let count = series.count(from, to);
                    sum >= threshold && count > 0 && sum.as_micros() as u64 / count >= max_avg_us
                })
            })
            .count();
        congested as f64
            >= self.settings.max_overloaded_worker_percentage * self.settings.num_workers as f64
    }

    /// The node is stalled when too many workers have a recent window of
    /// slow requests. Workers whose window averages a full loop period are
    /// counted separately as critically stalled.
    fn is_stalled(&self, now: Instant, half_period: Duration) -> StallInfo {
        let max_avg_us = self.settings.max_stalls_avg.as_micros() as u64;
        let critical_us = self.settings.sleep_period.as_micros() as u64;
        let mut critically_stalled = 0;
        let stalled_workers = self
            .worker_stalls
            .iter()
            .filter(|series| {
                let mut avg_of_match = None;
                let hit = any_window(now, half_period, |from, to| {
                    let count = series.count(from, to);
                    if count == 0 {
                        return false;
                    }
                    let avg = series.sum(from, to).as_micros() as u64 / count;
                    if avg >= max_avg_us {
                        avg_of_match = Some(avg);
                        true
                    } else {
                        false
                    }
                });
                if let Some(avg) = avg_of_match {
                    if avg >= critical_us {
                        critically_stalled += 1;
                    }
                }
                hit
            })
            .count();
        StallInfo {
            stalled: stalled_workers as f64
                >= self.settings.max_stalled_worker_percentage * self.settings.num_workers as f64,
            critically_stalled,
        }
    }
}

/// Evaluate `pred` over sliding windows of two half-periods, stepped by one
/// half-period across the last `2 * PERIOD_RANGE` half-periods.
fn any_window(
    now: Instant,
    half_period: Duration,
    mut pred: impl FnMut(Instant, Instant) -> bool,
) -> bool {
    for p in 2..=2 * PERIOD_RANGE {
        let Some(from) = now.checked_sub(half_period * p) else {
            continue;
        };
        let Some(to) = now.checked_sub(half_period * (p - 2)) else {
            continue;
        };
        if pred(from, to) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn settings() -> HealthMonitorSettings {
        HealthMonitorSettings {
            sleep_period: 100 * MS,
            num_workers: 8,
            max_queue_stalls_avg: 40 * MS,
            max_queue_stall_duration: 300 * MS,
            max_overloaded_worker_percentage: 0.5,
            max_stalls_avg: 45 * MS,
            max_stalled_worker_percentage: 0.1,
        }
    }

    fn core() -> (MonitorCore, Instant) {
        let core = MonitorCore::new(settings(), Arc::new(Stats::default()), Instant::now());
        let now = Instant::now() + Duration::from_secs(60);
        (core, now)
    }

    #[test]
    fn healthy_with_no_reports() {
        let (mut core, now) = core();
        assert_eq!(core.evaluate(now), NodeHealthState::Healthy);
        assert_eq!(core.stats.health_monitor_state_indicator.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn queue_congestion_reads_overloaded() {
        let (mut core, now) = core();
        // Five of eight workers each accumulate 500ms of queue stalls at an
        // average of 50ms within the last loop.
        for idx in 0..5 {
            for i in 0..10u32 {
                core.apply_report(Report::WorkerQueueStall {
                    idx,
                    at: now - 80 * MS + Duration::from_millis(u64::from(i) * 8),
                    duration: 50 * MS,
                });
            }
        }
        assert_eq!(core.evaluate(now), NodeHealthState::Overloaded);

        // Overload alone never touches the state timer.
        assert!(core.state_timer.current() <= core.settings.sleep_period);

        // Once the samples slide out of every window, the node recovers.
        let later = now + Duration::from_secs(2);
        assert_eq!(core.evaluate(later), NodeHealthState::Healthy);
    }

    #[test]
    fn too_few_congested_workers_is_not_overload() {
        let (mut core, now) = core();
        for idx in 0..3 {
            for i in 0..10u32 {
                core.apply_report(Report::WorkerQueueStall {
                    idx,
                    at: now - 80 * MS + Duration::from_millis(u64::from(i) * 8),
                    duration: 50 * MS,
                });
            }
        }
        assert_eq!(core.evaluate(now), NodeHealthState::Healthy);
    }

    #[test]
    fn critically_stalled_worker_escalates_to_unhealthy() {
        let (mut core, now) = core();
        core.apply_report(Report::WorkerStall {
            idx: 2,
            at: now - 50 * MS,
            duration: 200 * MS,
        });
        // One worker over the stall average (10% bar) plus a critical stall:
        // two growth steps in a single pass, 100ms -> ~400ms.
        assert_eq!(core.evaluate(now), NodeHealthState::Unhealthy);
        assert!(core.state_timer.current() > core.settings.sleep_period);
    }

    #[test]
    fn unhealthy_decays_back_to_healthy() {
        let (mut core, now) = core();
        core.apply_report(Report::WorkerStall {
            idx: 0,
            at: now - 50 * MS,
            duration: 200 * MS,
        });
        assert_eq!(core.evaluate(now), NodeHealthState::Unhealthy);

        // Once the stall has slid out of every window the timer only decays;
        // even from its 10s ceiling it is back under the loop period within
        // 20s of elapsed time.
        let mut state = NodeHealthState::Unhealthy;
        for step in 1..=30u32 {
            state = core.evaluate(now + step * Duration::from_secs(1));
            if state == NodeHealthState::Healthy {
                break;
            }
        }
        assert_eq!(state, NodeHealthState::Healthy);
    }

    #[test]
    fn watchdog_and_loop_delays_feed_the_timer() {
        let (mut core1, now1) = core();
        core1.apply_report(Report::WatchdogHealth { delayed: true });
        assert_eq!(core1.evaluate(now1), NodeHealthState::Unhealthy);

        let (mut core2, now2) = core();
        core2.monitor_delay = true;
        assert_eq!(core2.evaluate(now2), NodeHealthState::Unhealthy);

        let (mut core3, now3) = core();
        core3.apply_report(Report::StalledWorkers { count: 3 });
        assert_eq!(core3.evaluate(now3), NodeHealthState::Unhealthy);
    }
}
