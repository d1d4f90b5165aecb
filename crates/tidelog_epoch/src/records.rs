//! Per-log metadata records and their znode value codecs.
//!
//! Every log's znode subtree holds three children: `sequencer` (epoch
//! metadata), `lce` (last clean epoch of the data log), and `metadata_lce`
//! (last clean epoch of the companion metadata log). Each value is a
//! fixed-layout little-endian encoding with a format byte up front, a
//! reserved tail for forward compatibility, and a trailing CRC32 over
//! everything preceding it.

use anyhow::{bail, ensure};
use bytes::{Buf, BufMut};
use serde::Serialize;

pub type LogId = u64;
pub const LOGID_INVALID: LogId = 0;
/// Highest valid data-log id.
pub const LOGID_MAX: LogId = (1 << 62) - 1;
/// Bit marking the companion metadata log of a data log.
pub const METADATA_LOG_BIT: u64 = 1 << 62;

pub type Epoch = u32;
pub const EPOCH_INVALID: Epoch = 0;

pub type NodeIndex = u16;

/// Upper bound on any composed znode value.
pub const ZNODE_VALUE_MAX: usize = 4096;
/// Upper bound on nodeset size; keeps the sequencer value well under
/// `ZNODE_VALUE_MAX`.
pub const NODESET_SIZE_MAX: usize = 512;
pub const MAX_REPLICATION_FACTOR: u8 = 127;

pub const SEQUENCER_ZNODE: &str = "sequencer";
pub const LCE_ZNODE: &str = "lce";
pub const METADATA_LCE_ZNODE: &str = "metadata_lce";

const FORMAT_VERSION: u8 = 1;
const RESERVED_LEN: usize = 8;

/// The companion metadata log id of a data log.
pub fn metadata_log_id(log_id: LogId) -> LogId {
    log_id | METADATA_LOG_BIT
}

pub fn is_metadata_log(log_id: LogId) -> bool {
    log_id & METADATA_LOG_BIT != 0
}

/// Strip the metadata-log bit, yielding the owning data log.
pub fn data_log_id(log_id: LogId) -> LogId {
    log_id & !METADATA_LOG_BIT
}

/// Root znode path of one log's subtree.
pub fn log_root_path(root: &str, log_id: LogId) -> String {
    format!("{root}/{}", data_log_id(log_id))
}

/// Sequence number composed of an epoch and an offset within it.
pub fn lsn(epoch: Epoch, esn: u32) -> u64 {
    (u64::from(epoch) << 32) | u64::from(esn)
}

/// Replication requirements of a log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ReplicationProperty {
    pub replication_factor: u8,
}

impl ReplicationProperty {
    pub fn new(replication_factor: u8) -> Self {
        Self { replication_factor }
    }

    pub fn is_valid(&self) -> bool {
        self.replication_factor >= 1 && self.replication_factor <= MAX_REPLICATION_FACTOR
    }
}

pub const METADATA_FLAG_DISABLED: u16 = 1 << 0;
pub const METADATA_FLAG_WRITTEN_IN_METADATA_LOG: u16 = 1 << 1;

/// Epoch metadata stored in a log's `sequencer` znode: which epoch is
/// current, since when the placement has been effective, and where copies
/// go.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EpochMetaData {
    pub epoch: Epoch,
    pub effective_since: Epoch,
    pub replication: ReplicationProperty,
    pub nodeset: Vec<NodeIndex>,
    pub flags: u16,
    /// Node that produced the last write, when the writing policy asked for
    /// it to be recorded.
    pub written_by: Option<NodeIndex>,
}

impl EpochMetaData {
    pub fn new(
        epoch: Epoch,
        effective_since: Epoch,
        replication: ReplicationProperty,
        nodeset: Vec<NodeIndex>,
    ) -> Self {
        Self {
            epoch,
            effective_since,
            replication,
            nodeset,
            flags: 0,
            written_by: None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.flags & METADATA_FLAG_DISABLED != 0
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.epoch != EPOCH_INVALID, "invalid epoch");
        ensure!(
            self.effective_since <= self.epoch,
            "effective_since {} above epoch {}",
            self.effective_since,
            self.epoch
        );
        ensure!(!self.nodeset.is_empty(), "empty nodeset");
        ensure!(
            self.nodeset.len() <= NODESET_SIZE_MAX,
            "nodeset of {} exceeds the maximum of {}",
            self.nodeset.len(),
            NODESET_SIZE_MAX
        );
        ensure!(self.replication.is_valid(), "invalid replication property");
        ensure!(
            usize::from(self.replication.replication_factor) <= self.nodeset.len(),
            "replication factor {} above nodeset size {}",
            self.replication.replication_factor,
            self.nodeset.len()
        );
        Ok(())
    }

    /// Serialize into the `sequencer` znode layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            32 + self.nodeset.len() * 2 + RESERVED_LEN + 4,
        );
        buf.put_u8(FORMAT_VERSION);
        buf.put_u16_le(self.flags);
        buf.put_u32_le(self.epoch);
        buf.put_u32_le(self.effective_since);
        buf.put_u8(self.replication.replication_factor);
        buf.put_u8(u8::from(self.written_by.is_some()));
        buf.put_u16_le(self.written_by.unwrap_or(0));
        buf.put_u16_le(self.nodeset.len() as u16);
        for node in &self.nodeset {
            buf.put_u16_le(*node);
        }
        buf.put_bytes(0, RESERVED_LEN);
        let crc = crc32(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Parse a `sequencer` znode value.
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut body = checked_body(bytes)?;
        ensure!(body.remaining() >= 15, "truncated epoch metadata");
        let format = body.get_u8();
        ensure!(format == FORMAT_VERSION, "unknown format version {format}");
        let flags = body.get_u16_le();
        let epoch = body.get_u32_le();
        let effective_since = body.get_u32_le();
        let replication = ReplicationProperty::new(body.get_u8());
        let has_written_by = body.get_u8() != 0;
        let written_by_raw = body.get_u16_le();
        ensure!(body.remaining() >= 2, "truncated epoch metadata");
        let nodeset_len = usize::from(body.get_u16_le());
        ensure!(nodeset_len <= NODESET_SIZE_MAX, "oversize nodeset");
        ensure!(
            body.remaining() >= nodeset_len * 2 + RESERVED_LEN,
            "truncated nodeset"
        );
        let mut nodeset = Vec::with_capacity(nodeset_len);
        for _ in 0..nodeset_len {
            nodeset.push(body.get_u16_le());
        }
        body.advance(RESERVED_LEN);
        Ok(Self {
            epoch,
            effective_since,
            replication,
            nodeset,
            flags,
            written_by: has_written_by.then_some(written_by_raw),
        })
    }
}

pub const TAIL_FLAG_OFFSET_WITHIN_EPOCH: u32 = 1 << 0;
const TAIL_FLAG_HAS_PAYLOAD_HASH: u32 = 1 << 1;

/// Compact summary of the last record of an epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TailRecord {
    pub lsn: u64,
    pub timestamp_ms: u64,
    pub flags: u32,
    pub payload_hash: Option<u64>,
}

impl TailRecord {
    pub fn is_valid(&self) -> bool {
        self.lsn != 0
    }

    /// Whether the record carries a per-epoch offset. Such records summarize
    /// in-flight epochs and must not be stored as a clean tail.
    pub fn offset_within_epoch(&self) -> bool {
        self.flags & TAIL_FLAG_OFFSET_WITHIN_EPOCH != 0
    }
}

/// Serialize an `lce` / `metadata_lce` znode value.
pub fn encode_lce(epoch: Epoch, tail: &TailRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(34 + RESERVED_LEN + 4);
    let mut flags = tail.flags & !TAIL_FLAG_HAS_PAYLOAD_HASH;
    if tail.payload_hash.is_some() {
        flags |= TAIL_FLAG_HAS_PAYLOAD_HASH;
    }
    buf.put_u8(FORMAT_VERSION);
    buf.put_u32_le(epoch);
    buf.put_u64_le(tail.lsn);
    buf.put_u64_le(tail.timestamp_ms);
    buf.put_u32_le(flags);
    buf.put_u64_le(tail.payload_hash.unwrap_or(0));
    buf.put_bytes(0, RESERVED_LEN);
    let crc = crc32(&buf);
    buf.put_u32_le(crc);
    buf
}

/// Parse an `lce` / `metadata_lce` znode value.
///
/// An empty value is what provisioning writes for a log that has never
/// completed recovery; it decodes as `(EPOCH_INVALID, default tail)`.
pub fn decode_lce(bytes: &[u8]) -> anyhow::Result<(Epoch, TailRecord)> {
    if bytes.is_empty() {
        return Ok((EPOCH_INVALID, TailRecord::default()));
    }
    let mut body = checked_body(bytes)?;
    ensure!(
        body.remaining() == 33 + RESERVED_LEN,
        "bad last-clean-epoch value length {}",
        bytes.len()
    );
    let format = body.get_u8();
    ensure!(format == FORMAT_VERSION, "unknown format version {format}");
    let epoch = body.get_u32_le();
    let lsn = body.get_u64_le();
    let timestamp_ms = body.get_u64_le();
    let wire_flags = body.get_u32_le();
    let payload_hash_raw = body.get_u64_le();
    let payload_hash = (wire_flags & TAIL_FLAG_HAS_PAYLOAD_HASH != 0).then_some(payload_hash_raw);
    Ok((
        epoch,
        TailRecord {
            lsn,
            timestamp_ms,
            flags: wire_flags & !TAIL_FLAG_HAS_PAYLOAD_HASH,
            payload_hash,
        },
    ))
}

/// Split off and verify the trailing checksum, returning the covered body.
fn checked_body(bytes: &[u8]) -> anyhow::Result<&[u8]> {
    if bytes.len() < 4 {
        bail!("value of {} bytes is shorter than its checksum", bytes.len());
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    let actual = crc32(body);
    ensure!(
        stored == actual,
        "checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
    );
    Ok(body)
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
