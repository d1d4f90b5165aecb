//! Process-wide counter sink.
//!
//! Injected as an `Arc<Stats>` rather than reached through a global so the
//! store and monitor stay testable in isolation.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Stats {
    pub health_monitor_num_loops: AtomicU64,
    pub health_monitor_stall_indicator: AtomicU64,
    pub health_monitor_overload_indicator: AtomicU64,
    pub health_monitor_state_indicator: AtomicU64,
    pub epoch_store_internal_inconsistency_error: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct StatsSnapshot {
    pub health_monitor_num_loops: u64,
    pub health_monitor_stall_indicator: u64,
    pub health_monitor_overload_indicator: u64,
    pub health_monitor_state_indicator: u64,
    pub epoch_store_internal_inconsistency_error: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            health_monitor_num_loops: self.health_monitor_num_loops.load(Ordering::Relaxed),
            health_monitor_stall_indicator: self
                .health_monitor_stall_indicator
                .load(Ordering::Relaxed),
            health_monitor_overload_indicator: self
                .health_monitor_overload_indicator
                .load(Ordering::Relaxed),
            health_monitor_state_indicator: self
                .health_monitor_state_indicator
                .load(Ordering::Relaxed),
            epoch_store_internal_inconsistency_error: self
                .epoch_store_internal_inconsistency_error
                .load(Ordering::Relaxed),
        }
    }
}
