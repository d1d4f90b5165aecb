//! Epoch store core.
//!
//! Runs the read-modify-conditional-write protocol over the coordination
//! ensemble. Each public operation spawns a drive task that pins the current
//! client, reads the znode, hands the value to the request handler, and then
//! either conditionally writes at the observed version, provisions the log's
//! subtree atomically, or completes. Linearizability comes entirely from the
//! ensemble's versioned conditional sets: at most one writer wins any given
//! version.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tidelog_coord::coord::{CoordClient, CoordClientFactory, Op, Rc, SessionState, Stat, Status};
use tracing::Instrument;

use crate::config::EpochStoreSettings;
use crate::records::{
    data_log_id, log_root_path, Epoch, LogId, TailRecord, LCE_ZNODE, LOGID_INVALID, LOGID_MAX,
    METADATA_LCE_ZNODE, SEQUENCER_ZNODE,
};
use crate::request::{
    valid_lce_log_id, GetLceRequest, LceCompletion, MetaDataCompletion, MetaDataRequest,
    MetaDataUpdater, NextStep, SetLceRequest, StoreRequest, WriteNodeIdPolicy,
};
use crate::stats::Stats;

/// Delivers completions back to the originating worker. Injected so the
/// store never assumes a particular threading model for its callers.
pub trait RequestPoster: Send + Sync + 'static {
    fn post(&self, work: Box<dyn FnOnce() + Send>);
}

/// Poster that hands completions to the runtime as fresh tasks.
pub struct SpawnPoster;

impl RequestPoster for SpawnPoster {
    fn post(&self, work: Box<dyn FnOnce() + Send>) {
        tokio::spawn(async move { work() });
    }
}

/// Poster that runs completions on the delivering task. Useful in tools and
/// tests that want synchronous observation.
pub struct InlinePoster;

impl RequestPoster for InlinePoster {
    fn post(&self, work: Box<dyn FnOnce() + Send>) {
        work();
    }
}

struct StoreInner {
    settings: EpochStoreSettings,
    root_path: String,
    client: RwLock<Arc<dyn CoordClient>>,
    factory: Arc<dyn CoordClientFactory>,
    poster: Arc<dyn RequestPoster>,
    stats: Arc<Stats>,
    shutting_down: AtomicBool,
    log_throttle: Mutex<HashMap<&'static str, Instant>>,
}

/// Strongly consistent per-log metadata store.
#[derive(Clone)]
pub struct EpochStore {
    inner: Arc<StoreInner>,
}

impl EpochStore {
    pub fn new(
        settings: EpochStoreSettings,
        factory: Arc<dyn CoordClientFactory>,
        poster: Arc<dyn RequestPoster>,
        stats: Arc<Stats>,
    ) -> anyhow::Result<Self> {
        settings.validate()?;
        let client = factory.connect(&settings.quorum)?;
        let root_path = settings.root_path();
        Ok(Self {
            inner: Arc::new(StoreInner {
                settings,
                root_path,
                client: RwLock::new(client),
                factory,
                poster,
                stats,
                shutting_down: AtomicBool::new(false),
                log_throttle: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Read the last clean epoch and tail record of a log (data log, or its
    /// companion metadata log via `records::metadata_log_id`).
    pub fn get_last_clean_epoch(
        &self,
        log_id: LogId,
        completion: LceCompletion,
    ) -> Result<(), Status> {
        if !valid_lce_log_id(log_id) {
            return Err(Status::InvalidParam);
        }
        self.run(StoreRequest::GetLce(GetLceRequest::new(log_id, completion)));
        Ok(())
    }

    /// Conditionally advance the last clean epoch of a log. Tail records
    /// that are invalid or still carry a per-epoch offset are rejected here,
    /// before any ensemble traffic.
    pub fn set_last_clean_epoch(
        &self,
        log_id: LogId,
        epoch: Epoch,
        tail: TailRecord,
        completion: LceCompletion,
    ) -> Result<(), Status> {
        if !tail.is_valid() || tail.offset_within_epoch() {
            tracing::error!(
                log_id,
                epoch,
                tail_flags = tail.flags,
                "attempt to update the last clean epoch with an unusable tail record"
            );
            return Err(Status::InvalidParam);
        }
        if !valid_lce_log_id(log_id) {
            return Err(Status::InvalidParam);
        }
        self.run(StoreRequest::SetLce(SetLceRequest::new(
            log_id, epoch, tail, completion,
        )));
        Ok(())
    }

    /// Run the caller's updater against the stored epoch metadata and apply
    /// its decision. Metadata logids are not accepted here.
    pub fn create_or_update_metadata(
        &self,
        log_id: LogId,
        updater: Box<dyn MetaDataUpdater>,
        policy: WriteNodeIdPolicy,
        completion: MetaDataCompletion,
        span: tracing::Span,
    ) -> Result<(), Status> {
        if log_id == LOGID_INVALID || log_id > LOGID_MAX {
            return Err(Status::InvalidParam);
        }
        self.run(StoreRequest::MetaData(MetaDataRequest::new(
            log_id,
            updater,
            policy,
            self.inner.settings.node_index,
            completion,
            span,
        )));
        Ok(())
    }

    /// Identity string of the backing store.
    pub fn identify(&self) -> String {
        format!(
            "coordination://{}{}",
            self.inner.current_client().quorum(),
            self.inner.root_path
        )
    }

    /// Mark the store as shutting down. Completions that would report
    /// `Shutdown` after this point are dropped instead of posted.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Relaxed);
    }

    /// Cluster-configuration subscription callback. Swaps in a fresh client
    /// when the quorum string changed; in-flight requests finish on the
    /// client they started with.
    pub fn on_config_update(&self, quorum: &str) {
        let current = self.inner.current_client();
        if current.quorum() == quorum {
            return;
        }
        tracing::info!(quorum, "coordination quorum changed, reconnecting");
        match self.inner.factory.connect(quorum) {
            Ok(client) => *self.inner.client.write().unwrap() = client,
            Err(err) => {
                tracing::error!(error = %err, "coordination reconnect failed, keeping old client")
            }
        }
    }

    fn run(&self, request: StoreRequest) {
        let inner = Arc::clone(&self.inner);
        let client = inner.current_client();
        let span = request.span();
        tokio::spawn(drive_request(inner, client, request).instrument(span));
    }
}

impl StoreInner {
    fn current_client(&self) -> Arc<dyn CoordClient> {
        Arc::clone(&self.client.read().unwrap())
    }

    /// Map a completion return code into the internal taxonomy.
    fn completion_status(&self, rc: Rc, client: &dyn CoordClient, log_id: LogId) -> Status {
        match rc {
            Rc::RuntimeInconsistency => {
                self.stats
                    .epoch_store_internal_inconsistency_error
                    .fetch_add(1, Ordering::Relaxed);
                if self.should_log("runtime-inconsistency", Duration::from_secs(10)) {
                    tracing::error!(
                        log_id,
                        "ensemble reported a runtime inconsistency; treating as failed"
                    );
                }
                Status::Failed
            }
            Rc::BadArguments => {
                if self.should_log("bad-arguments", Duration::from_secs(1)) {
                    tracing::error!(log_id, "ensemble rejected our arguments");
                }
                debug_assert!(false, "malformed ensemble request for log {log_id}");
                Status::Internal
            }
            // The session state is read at mapping time and does not
            // necessarily reflect the state at the time of the error.
            Rc::InvalidState => match client.session_state() {
                SessionState::Expired => Status::NotConn,
                SessionState::AuthFailed => Status::Access,
                state => {
                    if self.should_log("invalid-state", Duration::from_secs(10)) {
                        tracing::warn!(
                            log_id,
                            session_state = ?state,
                            "session state at the time of the error is unrecoverable, \
                             possibly expired or auth-failed"
                        );
                    }
                    Status::Failed
                }
            },
            rc => match rc.to_status() {
                Status::VersionMismatch => Status::Again,
                Status::Unknown => {
                    if self.should_log("unknown-code", Duration::from_secs(1)) {
                        tracing::error!(log_id, rc = ?rc, "unexpected ensemble return code");
                    }
                    Status::Failed
                }
                status => status,
            },
        }
    }

    /// Keyed log throttle so repeated ensemble failures do not flood the
    /// log.
    fn should_log(&self, key: &'static str, interval: Duration) -> bool {
        let mut throttle = self.log_throttle.lock().unwrap();
        let now = Instant::now();
        match throttle.get(key) {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                throttle.insert(key, now);
                true
            }
        }
    }

    /// Deliver the final status, unless the store itself is going away and
    /// the status is `Shutdown`. A client shutting down because the quorum
    /// changed still reports to the caller.
    fn finish(self: &Arc<Self>, request: StoreRequest, status: Status) {
        if status == Status::Shutdown && self.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        self.poster.post(Box::new(move || request.complete(status)));
    }
}

async fn drive_request(
    inner: Arc<StoreInner>,
    client: Arc<dyn CoordClient>,
    mut request: StoreRequest,
) {
    let path = request.znode_path(&inner.root_path);
    let log_id = request.log_id();

    let (value, stat) = match client.get_data(&path).await {
        Ok((value, stat)) => (Some(value), stat),
        Err(rc) => {
            let status = inner.completion_status(rc, &*client, log_id);
            if status != Status::NotFound {
                inner.finish(request, status);
                return;
            }
            (None, Stat::default())
        }
    };

    match request.on_znode_value(value.as_deref()) {
        NextStep::Stop(status) | NextStep::Failed(status) => inner.finish(request, status),
        NextStep::Modify => {
            let encoded = match request.compose_value() {
                Ok(encoded) => encoded,
                Err(status) => {
                    tracing::error!(log_id, "could not compose a znode value");
                    inner.finish(request, status);
                    return;
                }
            };
            // Succeeds only if the version is still the one we read, which
            // makes the whole read-modify-write atomic.
            let status = match client.set_data(&path, encoded, stat.version).await {
                Ok(_) => Status::Ok,
                Err(rc) => inner.completion_status(rc, &*client, log_id),
            };
            inner.finish(request, status);
        }
        NextStep::Provision => {
            let encoded = match request.compose_value() {
                Ok(encoded) => encoded,
                Err(status) => {
                    tracing::error!(log_id, "could not compose a znode value");
                    inner.finish(request, status);
                    return;
                }
            };
            provision_log_znodes(inner, client, request, encoded).await;
        }
    }
}

/// The four creates that lazily allocate a log's subtree, dispatched as one
/// atomic batch.
fn provision_ops(root: &str, log_id: LogId, sequencer_value: &[u8]) -> Vec<Op> {
    let log_root = log_root_path(root, data_log_id(log_id));
    vec![
        Op::Create {
            path: log_root.clone(),
            value: Vec::new(),
        },
        Op::Create {
            path: format!("{log_root}/{SEQUENCER_ZNODE}"),
            value: sequencer_value.to_vec(),
        },
        Op::Create {
            path: format!("{log_root}/{LCE_ZNODE}"),
            value: Vec::new(),
        },
        Op::Create {
            path: format!("{log_root}/{METADATA_LCE_ZNODE}"),
            value: Vec::new(),
        },
    ]
}

async fn provision_log_znodes(
    inner: Arc<StoreInner>,
    client: Arc<dyn CoordClient>,
    request: StoreRequest,
    sequencer_value: Vec<u8>,
) {
    let log_id = request.log_id();
    let ops = provision_ops(&inner.root_path, log_id, &sequencer_value);

    let response = client.multi(ops.clone()).await;
    let status = inner.completion_status(response.rc, &*client, log_id);
    if status == Status::Ok {
        debug_assert!(response.results.iter().all(|r| r.rc == Rc::Ok));
        inner.finish(request, status);
        return;
    }

    if status != Status::NotFound {
        inner.finish(request, status);
        return;
    }

    // The log root itself is missing.
    if !inner.settings.create_root_znodes {
        if inner.should_log("missing-root", Duration::from_secs(1)) {
            tracing::error!(
                root = %inner.root_path,
                "root znode does not exist; it has to be created by external tooling \
                 when create-root-znodes is disabled"
            );
        }
        inner.finish(request, status);
        return;
    }

    if inner.should_log("creating-root", Duration::from_secs(1)) {
        tracing::info!(root = %inner.root_path, "root znode does not exist, creating it");
    }
    if let Err(rc) = create_root_znodes(&inner, &client).await {
        let status = inner.completion_status(rc, &*client, log_id);
        inner.finish(request, status);
        return;
    }

    // Roots are in place; retry the deferred multi-op once.
    let response = client.multi(ops).await;
    let status = inner.completion_status(response.rc, &*client, log_id);
    if status == Status::Ok {
        debug_assert!(response.results.iter().all(|r| r.rc == Rc::Ok));
    }
    inner.finish(request, status);
}

/// Create every ancestor of the root path, shallowest first. Each create is
/// issued as a one-element multi to stay on the same API surface as log
/// provisioning. `Exists` means somebody else got there first and is fine.
async fn create_root_znodes(
    inner: &Arc<StoreInner>,
    client: &Arc<dyn CoordClient>,
) -> Result<(), Rc> {
    for path in ancestor_chain(&inner.root_path) {
        let response = client
            .multi(vec![Op::Create {
                path: path.clone(),
                value: Vec::new(),
            }])
            .await;
        match response.rc {
            Rc::Ok => tracing::info!(path = %path, "created root znode"),
            Rc::NodeExists => tracing::debug!(path = %path, "root znode already present"),
            rc => {
                tracing::error!(path = %path, rc = ?rc, "unable to create root znode");
                return Err(rc);
            }
        }
    }
    Ok(())
}

/// `path` and every strict ancestor below `/`, shallowest first.
fn ancestor_chain(path: &str) -> Vec<String> {
    let mut chain = Vec::new();
    for (idx, ch) in path.char_indices().skip(1) {
        if ch == '/' {
            chain.push(path[..idx].to_string());
        }
    }
    if path.len() > 1 {
        chain.push(path.to_string());
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_chain_is_shallowest_first() {
        assert_eq!(
            ancestor_chain("/tidelog/c1/logs"),
            vec!["/tidelog", "/tidelog/c1", "/tidelog/c1/logs"]
        );
        assert_eq!(ancestor_chain("/logs"), vec!["/logs"]);
    }

    #[test]
    fn provision_ops_cover_the_subtree() {
        let ops = provision_ops("/tidelog/c1/logs", 42, b"meta");
        let paths: Vec<&str> = ops.iter().map(|op| op.path()).collect();
        assert_eq!(
            paths,
            vec![
                "/tidelog/c1/logs/42",
                "/tidelog/c1/logs/42/sequencer",
                "/tidelog/c1/logs/42/lce",
                "/tidelog/c1/logs/42/metadata_lce",
            ]
        );
    }
}
