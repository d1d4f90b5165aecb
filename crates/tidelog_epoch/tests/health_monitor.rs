//! Health monitor transition scenarios.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tidelog_epoch::{HealthMonitor, HealthMonitorSettings, NodeHealthState, Stats};

const MS: Duration = Duration::from_millis(1);

fn settings() -> HealthMonitorSettings {
    HealthMonitorSettings {
        sleep_period: 50 * MS,
        num_workers: 8,
        max_queue_stalls_avg: 40 * MS,
        max_queue_stall_duration: 300 * MS,
        max_overloaded_worker_percentage: 0.5,
        max_stalls_avg: 45 * MS,
        max_stalled_worker_percentage: 0.1,
    }
}

async fn wait_for_state(
    monitor: &HealthMonitor,
    target: NodeHealthState,
    deadline: Duration,
) -> bool {
    let until = Instant::now() + deadline;
    let mut rx = monitor.subscribe();
    loop {
        if *rx.borrow() == target {
            return true;
        }
        if Instant::now() >= until {
            return false;
        }
        let _ = tokio::time::timeout(100 * MS, rx.changed()).await;
    }
}

#[tokio::test]
async fn queue_congestion_drives_overloaded_and_recovers() {
    let stats = Arc::new(Stats::default());
    let monitor = HealthMonitor::new(settings(), Arc::clone(&stats));
    monitor.start_up();
    assert_eq!(monitor.node_state(), NodeHealthState::Healthy);

    // Five of eight workers report sustained queue congestion.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut overloaded = false;
    while Instant::now() < deadline {
        for idx in 0..5 {
            monitor.report_worker_queue_stall(idx, 50 * MS);
        }
        if monitor.node_state() == NodeHealthState::Overloaded {
            overloaded = true;
            break;
        }
        tokio::time::sleep(10 * MS).await;
    }
    assert!(overloaded, "node never classified as overloaded");

    // Queue congestion alone is not unhealthiness, and once the reports
    // stop, the windows drain and the node recovers.
    assert!(
        wait_for_state(&monitor, NodeHealthState::Healthy, Duration::from_secs(10)).await,
        "node did not recover from overload"
    );

    assert!(stats.snapshot().health_monitor_overload_indicator >= 1);
    monitor.shutdown().await;
}

#[tokio::test]
async fn critically_stalled_worker_escalates_and_decays() {
    let stats = Arc::new(Stats::default());
    let monitor = HealthMonitor::new(settings(), Arc::clone(&stats));
    monitor.start_up();

    // A single stall of two loop periods: stalled (10% bar) plus critically
    // stalled, so the state timer grows twice in one loop.
    monitor.report_worker_stall(3, 100 * MS);
    assert!(
        wait_for_state(&monitor, NodeHealthState::Unhealthy, Duration::from_secs(5)).await,
        "node never classified as unhealthy"
    );
    assert!(stats.snapshot().health_monitor_stall_indicator >= 1);

    // Unhealthiness is hysteretic: it outlives the stall windows.
    tokio::time::sleep(150 * MS).await;
    assert_eq!(monitor.node_state(), NodeHealthState::Unhealthy);

    // With no further negative signals the timer decays back below the
    // loop period. Worst case is the 10s ceiling at unit decay rate.
    assert!(
        wait_for_state(&monitor, NodeHealthState::Healthy, Duration::from_secs(30)).await,
        "node did not recover from unhealthiness"
    );
    monitor.shutdown().await;
}

#[tokio::test]
async fn watchdog_delay_feeds_the_timer() {
    let stats = Arc::new(Stats::default());
    let monitor = HealthMonitor::new(settings(), stats);
    monitor.start_up();

    monitor.report_watchdog_health(true);
    assert!(
        wait_for_state(&monitor, NodeHealthState::Unhealthy, Duration::from_secs(5)).await
    );

    // The watchdog clearing its report lets the node decay back.
    monitor.report_watchdog_health(false);
    assert!(
        wait_for_state(&monitor, NodeHealthState::Healthy, Duration::from_secs(30)).await
    );
    monitor.shutdown().await;
}

#[tokio::test]
async fn loop_counter_advances() {
    let stats = Arc::new(Stats::default());
    let monitor = HealthMonitor::new(settings(), Arc::clone(&stats));
    monitor.start_up();

    common::wait_until("monitor loops", || {
        stats.health_monitor_num_loops.load(Ordering::Relaxed) >= 3
    })
    .await;
    assert!(stats.snapshot().health_monitor_state_indicator >= 1);
    monitor.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_shared() {
    let monitor = HealthMonitor::new(settings(), Arc::new(Stats::default()));
    monitor.start_up();

    let first = monitor.shutdown();
    let second = monitor.shutdown();
    tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .expect("first shutdown future resolves");
    tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .expect("second shutdown future resolves");

    // Late reports are dropped without effect.
    monitor.report_worker_stall(0, 500 * MS);
    monitor.report_stalled_workers(4);
}

#[tokio::test]
async fn shutdown_without_startup_resolves_immediately() {
    let monitor = HealthMonitor::new(settings(), Arc::new(Stats::default()));
    tokio::time::timeout(Duration::from_secs(1), monitor.shutdown())
        .await
        .expect("unstarted monitor shutdown resolves");
}
