//! Settings for the epoch store and the health monitor.

use std::time::Duration;

use crate::records::NodeIndex;

/// Longest accepted cluster name.
pub const MAX_CLUSTER_NAME: usize = 127;

/// Configuration for the epoch store.
#[derive(Clone, Debug)]
pub struct EpochStoreSettings {
    /// Cluster name; the log root path is derived from it.
    pub cluster_name: String,
    /// Initial coordination-ensemble quorum string.
    pub quorum: String,
    /// Create missing root znodes on first provisioning attempt. When false,
    /// the roots must be created by external tooling and a missing root
    /// surfaces as NOTFOUND.
    pub create_root_znodes: bool,
    /// This node's index, stamped into epoch metadata when the caller asks
    /// for it.
    pub node_index: Option<NodeIndex>,
}

impl EpochStoreSettings {
    /// Root path under which every log's znode subtree lives.
    pub fn root_path(&self) -> String {
        format!("/tidelog/{}/logs", self.cluster_name)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cluster_name.is_empty() || self.cluster_name.len() >= MAX_CLUSTER_NAME {
            anyhow::bail!(
                "cluster name must be non-empty and shorter than {MAX_CLUSTER_NAME} characters"
            );
        }
        if self.cluster_name.contains('/') {
            anyhow::bail!("cluster name must not contain '/'");
        }
        if self.quorum.is_empty() {
            anyhow::bail!("quorum string must be non-empty");
        }
        Ok(())
    }
}

impl Default for EpochStoreSettings {
    fn default() -> Self {
        Self {
            cluster_name: "local".to_string(),
            quorum: "127.0.0.1:2181".to_string(),
            create_root_znodes: false,
            node_index: None,
        }
    }
}

/// Thresholds and cadence for the health monitor.
#[derive(Clone, Copy, Debug)]
pub struct HealthMonitorSettings {
    /// Monitor loop period.
    pub sleep_period: Duration,
    /// Number of workers whose stall reports are tracked.
    pub num_workers: usize,
    /// Average queue-stall duration above which a window counts as
    /// overloaded.
    pub max_queue_stalls_avg: Duration,
    /// Total queue-stall duration a window must reach before it can count as
    /// overloaded.
    pub max_queue_stall_duration: Duration,
    /// Fraction of workers with overloaded queues at which the node is
    /// overloaded.
    pub max_overloaded_worker_percentage: f64,
    /// Average request-stall duration above which a window counts as
    /// stalled.
    pub max_stalls_avg: Duration,
    /// Fraction of workers with stalled requests at which the node is
    /// stalled.
    pub max_stalled_worker_percentage: f64,
}

impl Default for HealthMonitorSettings {
    fn default() -> Self {
        Self {
            sleep_period: Duration::from_millis(100),
            num_workers: 16,
            max_queue_stalls_avg: Duration::from_millis(60),
            max_queue_stall_duration: Duration::from_millis(200),
            max_overloaded_worker_percentage: 0.3,
            max_stalls_avg: Duration::from_millis(45),
            max_stalled_worker_percentage: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_path_from_cluster_name() {
        let settings = EpochStoreSettings {
            cluster_name: "c1".into(),
            ..Default::default()
        };
        assert_eq!(settings.root_path(), "/tidelog/c1/logs");
    }

    #[test]
    fn rejects_bad_cluster_names() {
        let mut settings = EpochStoreSettings::default();
        settings.cluster_name = String::new();
        assert!(settings.validate().is_err());
        settings.cluster_name = "a/b".into();
        assert!(settings.validate().is_err());
        settings.cluster_name = "ok".into();
        assert!(settings.validate().is_ok());
    }
}
