//! Contention workload for the epoch store.
//!
//! Spawns concurrent epoch bumpers over a set of logs against the
//! in-process ensemble, counts conditional-write wins and losses, and
//! verifies that every successful bump advanced the stored epoch by exactly
//! one. Prints a JSON summary.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tidelog_coord::coord::{MemEnsemble, MemEnsembleFactory, Status};
use tidelog_epoch::records::{log_root_path, EpochMetaData, LogId, ReplicationProperty};
use tidelog_epoch::{
    EpochStore, EpochStoreSettings, MetaDataUpdater, SpawnPoster, Stats, UpdateOutcome,
    WriteNodeIdPolicy,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "epoch-workload")]
struct Args {
    /// Number of logs the writers contend over.
    #[arg(long, default_value_t = 4)]
    logs: u64,

    /// Number of concurrent writers.
    #[arg(long, default_value_t = 8)]
    writers: usize,

    /// Total runtime of the workload.
    #[arg(long, default_value = "5s")]
    duration: humantime::Duration,

    /// Cluster name; determines the root path.
    #[arg(long, default_value = "bench")]
    cluster: String,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Swap the quorum string halfway through the run.
    #[arg(long, default_value_t = false)]
    swap_quorum: bool,
}

/// Advance the stored epoch by one, provisioning on first use.
struct BumpOne;

impl MetaDataUpdater for BumpOne {
    fn update(&self, _log_id: LogId, current: Option<&EpochMetaData>) -> UpdateOutcome {
        match current {
            None => UpdateOutcome::Created(EpochMetaData::new(
                1,
                1,
                ReplicationProperty::new(1),
                vec![0],
            )),
            Some(cur) if cur.is_disabled() => UpdateOutcome::Failed(Status::Disabled),
            Some(cur) => {
                let mut next = cur.clone();
                next.epoch = cur.epoch + 1;
                UpdateOutcome::Updated(next)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
struct Tally {
    ok: u64,
    again: u64,
    uptodate: u64,
    other: u64,
}

#[derive(Debug, Serialize)]
struct Summary {
    logs: u64,
    writers: usize,
    duration_ms: u128,
    tally: Tally,
    final_epochs: Vec<(LogId, u32)>,
    epochs_match_wins: bool,
    identify: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    tracing::info!(?args, seed, "starting epoch workload");

    let ensemble = MemEnsemble::new();
    let factory = Arc::new(MemEnsembleFactory::new(Arc::clone(&ensemble)));
    let stats = Arc::new(Stats::default());
    let settings = EpochStoreSettings {
        cluster_name: args.cluster.clone(),
        quorum: "mem:1".into(),
        create_root_znodes: true,
        node_index: Some(0),
    };
    let root_path = settings.root_path();
    let store = EpochStore::new(settings, factory, Arc::new(SpawnPoster), stats)?;

    let started = Instant::now();
    let deadline = started + *args.duration;

    if args.swap_quorum {
        let store = store.clone();
        let halfway = *args.duration / 2;
        tokio::spawn(async move {
            tokio::time::sleep(halfway).await;
            store.on_config_update("mem:2");
            tracing::info!(identify = %store.identify(), "swapped quorum");
        });
    }

    let mut tasks = Vec::with_capacity(args.writers);
    for writer in 0..args.writers {
        let store = store.clone();
        let logs = args.logs.max(1);
        let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(writer as u64));
        tasks.push(tokio::spawn(async move {
            let mut tally = Tally::default();
            while Instant::now() < deadline {
                let log_id = rng.gen_range(1..=logs);
                let (tx, rx) = tokio::sync::oneshot::channel();
                let submitted = store.create_or_update_metadata(
                    log_id,
                    Box::new(BumpOne),
                    WriteNodeIdPolicy::Write,
                    Box::new(move |resp| {
                        let _ = tx.send(resp.status);
                    }),
                    tracing::Span::current(),
                );
                if submitted.is_err() {
                    tally.other += 1;
                    continue;
                }
                match rx.await {
                    Ok(Status::Ok) => tally.ok += 1,
                    Ok(Status::Again) => tally.again += 1,
                    Ok(Status::Uptodate) => tally.uptodate += 1,
                    Ok(status) => {
                        tracing::warn!(log_id, status = ?status, "unexpected outcome");
                        tally.other += 1;
                    }
                    Err(_) => tally.other += 1,
                }
            }
            tally
        }));
    }

    let mut tally = Tally::default();
    for task in tasks {
        let t = task.await?;
        tally.ok += t.ok;
        tally.again += t.again;
        tally.uptodate += t.uptodate;
        tally.other += t.other;
    }

    // Every successful outcome advanced exactly one log's epoch by exactly
    // one (provisioning counts as the advance to epoch 1), so the stored
    // epochs must sum to the number of wins.
    let mut final_epochs = Vec::new();
    let mut total: u64 = 0;
    for log_id in 1..=args.logs.max(1) {
        let path = format!("{}/sequencer", log_root_path(&root_path, log_id));
        let epoch = match ensemble.node(&path) {
            Some((value, _)) => EpochMetaData::decode(&value)?.epoch,
            None => 0,
        };
        total += u64::from(epoch);
        final_epochs.push((log_id, epoch));
    }

    let summary = Summary {
        logs: args.logs,
        writers: args.writers,
        duration_ms: started.elapsed().as_millis(),
        tally,
        final_epochs,
        epochs_match_wins: total == tally.ok,
        identify: store.identify(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    anyhow::ensure!(
        summary.epochs_match_wins,
        "stored epochs ({total}) do not match successful writes ({})",
        tally.ok
    );
    Ok(())
}
