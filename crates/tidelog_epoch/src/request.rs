//! Per-request-kind handlers for the epoch store.
//!
//! The handler set is closed: one variant per request kind, dispatched by
//! match. Each handler interprets the current znode value, decides the next
//! step of the read-modify-write, composes the replacement value, and
//! delivers its completion.

use tidelog_coord::coord::Status;

use crate::records::{
    self, data_log_id, is_metadata_log, log_root_path, EpochMetaData, Epoch, LogId, NodeIndex,
    TailRecord, LCE_ZNODE, METADATA_LCE_ZNODE, SEQUENCER_ZNODE, ZNODE_VALUE_MAX,
};

/// What the core should do after a handler has seen the znode value.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum NextStep {
    /// Znode absent: allocate the log's subtree with the composed value.
    Provision,
    /// Proceed with a conditional set at the observed version.
    Modify,
    /// The read alone produced the final answer.
    Stop(Status),
    /// Validation failed; the status is terminal.
    Failed(Status),
}

/// Decision returned by a metadata updater.
pub enum UpdateOutcome {
    /// Stored metadata already reflects the desired state.
    Unchanged,
    /// Advance to the given metadata via conditional write.
    Updated(EpochMetaData),
    /// First-time provision with the given metadata.
    Created(EpochMetaData),
    /// Refuse the update with the given terminal status.
    Failed(Status),
}

/// Caller-supplied decision function for `create_or_update_metadata`.
///
/// Runs against the stored metadata (or `None` when the log has never been
/// provisioned) on the read side of every attempt; a caller retrying an
/// `Again` outcome re-runs the updater against fresh state.
pub trait MetaDataUpdater: Send + Sync {
    fn update(&self, log_id: LogId, current: Option<&EpochMetaData>) -> UpdateOutcome;
}

/// How the `written_by` field of composed metadata is filled in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteNodeIdPolicy {
    DontWrite,
    KeepLastWritten,
    Write,
}

/// Outcome of a last-clean-epoch operation.
#[derive(Clone, Debug)]
pub struct LceResponse {
    pub status: Status,
    pub log_id: LogId,
    pub epoch: Epoch,
    pub tail: TailRecord,
}

pub type LceCompletion = Box<dyn FnOnce(LceResponse) + Send>;

/// Outcome of a metadata operation.
#[derive(Clone, Debug)]
pub struct MetaDataResponse {
    pub status: Status,
    pub log_id: LogId,
    pub metadata: Option<EpochMetaData>,
}

pub type MetaDataCompletion = Box<dyn FnOnce(MetaDataResponse) + Send>;

pub(crate) struct GetLceRequest {
    pub log_id: LogId,
    completion: LceCompletion,
    epoch: Epoch,
    tail: TailRecord,
}

impl GetLceRequest {
    pub fn new(log_id: LogId, completion: LceCompletion) -> Self {
        Self {
            log_id,
            completion,
            epoch: records::EPOCH_INVALID,
            tail: TailRecord::default(),
        }
    }
}

pub(crate) struct SetLceRequest {
    pub log_id: LogId,
    pub epoch: Epoch,
    pub tail: TailRecord,
    completion: LceCompletion,
}

impl SetLceRequest {
    pub fn new(log_id: LogId, epoch: Epoch, tail: TailRecord, completion: LceCompletion) -> Self {
        Self {
            log_id,
            epoch,
            tail,
            completion,
        }
    }
}

pub(crate) struct MetaDataRequest {
    pub log_id: LogId,
    updater: Box<dyn MetaDataUpdater>,
    policy: WriteNodeIdPolicy,
    own_node: Option<NodeIndex>,
    completion: MetaDataCompletion,
    pub span: tracing::Span,
    current: Option<EpochMetaData>,
    next: Option<EpochMetaData>,
}

impl MetaDataRequest {
    pub fn new(
        log_id: LogId,
        updater: Box<dyn MetaDataUpdater>,
        policy: WriteNodeIdPolicy,
        own_node: Option<NodeIndex>,
        completion: MetaDataCompletion,
        span: tracing::Span,
    ) -> Self {
        Self {
            log_id,
            updater,
            policy,
            own_node,
            completion,
            span,
            current: None,
            next: None,
        }
    }

    fn apply_write_node_id(&self, mut meta: EpochMetaData) -> EpochMetaData {
        meta.written_by = match self.policy {
            WriteNodeIdPolicy::DontWrite => None,
            WriteNodeIdPolicy::KeepLastWritten => {
                self.current.as_ref().and_then(|cur| cur.written_by)
            }
            WriteNodeIdPolicy::Write => self.own_node,
        };
        meta
    }
}

pub(crate) enum StoreRequest {
    GetLce(GetLceRequest),
    SetLce(SetLceRequest),
    MetaData(MetaDataRequest),
}

impl StoreRequest {
    pub fn log_id(&self) -> LogId {
        match self {
            StoreRequest::GetLce(rq) => rq.log_id,
            StoreRequest::SetLce(rq) => rq.log_id,
            StoreRequest::MetaData(rq) => rq.log_id,
        }
    }

    /// Full path of the znode this request reads and writes.
    pub fn znode_path(&self, root: &str) -> String {
        let log_root = log_root_path(root, self.log_id());
        let child = match self {
            StoreRequest::MetaData(_) => SEQUENCER_ZNODE,
            StoreRequest::GetLce(_) | StoreRequest::SetLce(_) => {
                if is_metadata_log(self.log_id()) {
                    METADATA_LCE_ZNODE
                } else {
                    LCE_ZNODE
                }
            }
        };
        format!("{log_root}/{child}")
    }

    /// Interpret the current znode value (`None` when the znode is absent)
    /// and pick the next step.
    pub fn on_znode_value(&mut self, value: Option<&[u8]>) -> NextStep {
        match self {
            StoreRequest::GetLce(rq) => match value {
                None => NextStep::Failed(Status::NotFound),
                Some(bytes) => match records::decode_lce(bytes) {
                    Err(err) => {
                        tracing::error!(
                            log_id = rq.log_id,
                            error = %err,
                            "malformed last-clean-epoch znode value"
                        );
                        NextStep::Failed(Status::BadMsg)
                    }
                    Ok((epoch, tail)) => {
                        rq.epoch = epoch;
                        rq.tail = tail;
                        NextStep::Stop(Status::Ok)
                    }
                },
            },
            StoreRequest::SetLce(rq) => match value {
                None => NextStep::Failed(Status::NotFound),
                Some(bytes) => match records::decode_lce(bytes) {
                    Err(err) => {
                        tracing::error!(
                            log_id = rq.log_id,
                            error = %err,
                            "malformed last-clean-epoch znode value"
                        );
                        NextStep::Failed(Status::BadMsg)
                    }
                    Ok((current, _)) if rq.epoch <= current => NextStep::Failed(Status::Stale),
                    Ok(_) => NextStep::Modify,
                },
            },
            StoreRequest::MetaData(rq) => {
                match value {
                    None => rq.current = None,
                    Some([]) => return NextStep::Failed(Status::Empty),
                    Some(bytes) => match EpochMetaData::decode(bytes) {
                        Err(err) => {
                            tracing::error!(
                                log_id = rq.log_id,
                                error = %err,
                                "malformed sequencer znode value"
                            );
                            return NextStep::Failed(Status::BadMsg);
                        }
                        Ok(meta) => rq.current = Some(meta),
                    },
                }

                match rq.updater.update(rq.log_id, rq.current.as_ref()) {
                    UpdateOutcome::Unchanged => NextStep::Stop(Status::Uptodate),
                    UpdateOutcome::Failed(status) => NextStep::Failed(status),
                    UpdateOutcome::Created(_) if rq.current.is_some() => {
                        NextStep::Failed(Status::Exists)
                    }
                    UpdateOutcome::Created(meta) => {
                        if let Err(err) = meta.validate() {
                            tracing::error!(
                                log_id = rq.log_id,
                                error = %err,
                                "updater produced invalid metadata"
                            );
                            return NextStep::Failed(Status::InvalidParam);
                        }
                        rq.next = Some(rq.apply_write_node_id(meta));
                        NextStep::Provision
                    }
                    UpdateOutcome::Updated(meta) => {
                        if let Err(err) = meta.validate() {
                            tracing::error!(
                                log_id = rq.log_id,
                                error = %err,
                                "updater produced invalid metadata"
                            );
                            return NextStep::Failed(Status::InvalidParam);
                        }
                        if let Some(cur) = &rq.current {
                            if (meta.epoch, meta.effective_since)
                                < (cur.epoch, cur.effective_since)
                            {
                                return NextStep::Failed(Status::Stale);
                            }
                        }
                        rq.next = Some(rq.apply_write_node_id(meta));
                        NextStep::Modify
                    }
                }
            }
        }
    }

    /// Serialize the value for the conditional set or provisioning create.
    /// Values above `ZNODE_VALUE_MAX` are a programmer error.
    pub fn compose_value(&self) -> Result<Vec<u8>, Status> {
        let encoded = match self {
            StoreRequest::GetLce(_) => return Err(Status::Internal),
            StoreRequest::SetLce(rq) => records::encode_lce(rq.epoch, &rq.tail),
            StoreRequest::MetaData(rq) => match &rq.next {
                None => return Err(Status::Internal),
                Some(meta) => meta.encode(),
            },
        };
        if encoded.is_empty() || encoded.len() > ZNODE_VALUE_MAX {
            return Err(Status::Internal);
        }
        Ok(encoded)
    }

    /// Deliver the final status to the caller, consuming the request.
    pub fn complete(self, status: Status) {
        match self {
            StoreRequest::GetLce(rq) => (rq.completion)(LceResponse {
                status,
                log_id: rq.log_id,
                epoch: rq.epoch,
                tail: rq.tail,
            }),
            StoreRequest::SetLce(rq) => (rq.completion)(LceResponse {
                status,
                log_id: rq.log_id,
                epoch: rq.epoch,
                tail: rq.tail,
            }),
            StoreRequest::MetaData(rq) => {
                let metadata = if status == Status::Ok {
                    rq.next.or(rq.current)
                } else {
                    rq.current
                };
                (rq.completion)(MetaDataResponse {
                    status,
                    log_id: rq.log_id,
                    metadata,
                })
            }
        }
    }

    pub fn span(&self) -> tracing::Span {
        match self {
            StoreRequest::MetaData(rq) => rq.span.clone(),
            _ => tracing::Span::none(),
        }
    }
}

/// Helper: `data_log_id` is in range and nonzero.
pub(crate) fn valid_lce_log_id(log_id: LogId) -> bool {
    let data = data_log_id(log_id);
    data != records::LOGID_INVALID && data <= records::LOGID_MAX
}
