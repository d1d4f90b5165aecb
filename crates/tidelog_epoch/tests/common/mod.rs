//! Shared helpers for epoch store integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tidelog_coord::coord::{MemEnsemble, MemEnsembleFactory, Status};
use tidelog_epoch::records::{Epoch, EpochMetaData, LogId, ReplicationProperty, TailRecord};
use tidelog_epoch::{
    EpochStore, EpochStoreSettings, LceResponse, MetaDataResponse, MetaDataUpdater, SpawnPoster,
    Stats, UpdateOutcome, WriteNodeIdPolicy,
};

pub const CLUSTER: &str = "c1";
pub const ROOT: &str = "/tidelog/c1/logs";

/// Deadline for asynchronous state transitions.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn build_store(create_roots: bool) -> (EpochStore, Arc<MemEnsemble>, Arc<Stats>) {
    let ensemble = MemEnsemble::new();
    let factory = Arc::new(MemEnsembleFactory::new(Arc::clone(&ensemble)));
    let stats = Arc::new(Stats::default());
    let settings = EpochStoreSettings {
        cluster_name: CLUSTER.into(),
        quorum: "mem:1".into(),
        create_root_znodes: create_roots,
        node_index: Some(1),
    };
    let store = EpochStore::new(settings, factory, Arc::new(SpawnPoster), Arc::clone(&stats))
        .expect("build epoch store");
    (store, ensemble, stats)
}

/// Updater that bumps the stored epoch to a fixed target, provisioning the
/// log on first use.
pub struct BumpTo {
    pub epoch: Epoch,
}

impl MetaDataUpdater for BumpTo {
    fn update(&self, _log_id: LogId, current: Option<&EpochMetaData>) -> UpdateOutcome {
        match current {
            None => UpdateOutcome::Created(EpochMetaData::new(
                self.epoch,
                self.epoch,
                ReplicationProperty::new(1),
                vec![0],
            )),
            Some(cur) if cur.epoch >= self.epoch => UpdateOutcome::Unchanged,
            Some(cur) => {
                let mut next = cur.clone();
                next.epoch = self.epoch;
                UpdateOutcome::Updated(next)
            }
        }
    }
}

/// Drive `create_or_update_metadata` to completion.
pub async fn update_meta(
    store: &EpochStore,
    log_id: LogId,
    updater: impl MetaDataUpdater + 'static,
) -> Result<MetaDataResponse, Status> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    store.create_or_update_metadata(
        log_id,
        Box::new(updater),
        WriteNodeIdPolicy::Write,
        Box::new(move |resp| {
            let _ = tx.send(resp);
        }),
        tracing::Span::none(),
    )?;
    Ok(rx.await.expect("metadata completion delivered"))
}

/// Drive `get_last_clean_epoch` to completion.
pub async fn get_lce(store: &EpochStore, log_id: LogId) -> Result<LceResponse, Status> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    store.get_last_clean_epoch(
        log_id,
        Box::new(move |resp| {
            let _ = tx.send(resp);
        }),
    )?;
    Ok(rx.await.expect("lce completion delivered"))
}

/// Drive `set_last_clean_epoch` to completion.
pub async fn set_lce(
    store: &EpochStore,
    log_id: LogId,
    epoch: Epoch,
    tail: TailRecord,
) -> Result<LceResponse, Status> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    store.set_last_clean_epoch(
        log_id,
        epoch,
        tail,
        Box::new(move |resp| {
            let _ = tx.send(resp);
        }),
    )?;
    Ok(rx.await.expect("lce completion delivered"))
}

pub fn tail(epoch: Epoch) -> TailRecord {
    TailRecord {
        lsn: tidelog_epoch::records::lsn(epoch, 1),
        timestamp_ms: 1_700_000_000_000,
        flags: 0,
        payload_hash: None,
    }
}

/// Poll until `pred` holds or the deadline passes.
pub async fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if pred() {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
