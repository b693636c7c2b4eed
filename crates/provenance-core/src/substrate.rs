use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::{ProvenanceError, TraceabilityCode, TxId, UserId};

/// `prev_hash` of the first commit-log entry of every key.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Key in the substrate's world state. Fruit and User records live in
/// separate namespaces so their identifiers can never collide.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct LedgerKey(String);

impl LedgerKey {
    #[must_use]
    pub fn fruit(code: &TraceabilityCode) -> Self {
        Self(format!("fruit:{code}"))
    }

    #[must_use]
    pub fn user(user_id: &UserId) -> Self {
        Self(format!("user:{user_id}"))
    }

    /// The traceability code behind a `fruit:` key, if this is one.
    #[must_use]
    pub fn fruit_code(&self) -> Option<TraceabilityCode> {
        self.0.strip_prefix("fruit:").and_then(|raw| TraceabilityCode::parse(raw).ok())
    }

    /// Rehydrate a key read back from storage.
    #[must_use]
    pub fn from_raw(raw: String) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LedgerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction id and commit timestamp issued by the substrate before a write
/// set is assembled, so stage sub-records are stamped with values the caller
/// never chooses.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TxContext {
    pub tx_id: TxId,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommitMeta {
    pub tx_id: TxId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub version: TxId,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WriteOp {
    Put(Vec<u8>),
    Delete,
}

/// Read set plus writes of one transaction. The substrate validates every
/// recorded read against the current world state and applies the writes
/// all-or-nothing.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct WriteSet {
    reads: Vec<(LedgerKey, Option<TxId>)>,
    writes: Vec<(LedgerKey, WriteOp)>,
}

impl WriteSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the version observed for `key` (`None` when it was absent).
    pub fn record_read(&mut self, key: LedgerKey, version: Option<TxId>) {
        if !self.reads.iter().any(|(existing, _)| existing == &key) {
            self.reads.push((key, version));
        }
    }

    pub fn put(&mut self, key: LedgerKey, value: Vec<u8>) {
        self.writes.retain(|(existing, _)| existing != &key);
        self.writes.push((key, WriteOp::Put(value)));
    }

    pub fn delete(&mut self, key: LedgerKey) {
        self.writes.retain(|(existing, _)| existing != &key);
        self.writes.push((key, WriteOp::Delete));
    }

    #[must_use]
    pub fn reads(&self) -> &[(LedgerKey, Option<TxId>)] {
        &self.reads
    }

    #[must_use]
    pub fn writes(&self) -> &[(LedgerKey, WriteOp)] {
        &self.writes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// One entry of the append-only commit log of a key.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LogEntry {
    pub sequence: u64,
    pub key: LedgerKey,
    pub tx_id: TxId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(with = "hex_value")]
    pub value: Option<Vec<u8>>,
    pub is_delete: bool,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl LogEntry {
    /// Recompute this entry's hash from its contents and the given predecessor.
    #[must_use]
    pub fn expected_hash(&self, prev_hash: &str) -> String {
        chain_hash(
            prev_hash,
            &self.key,
            self.tx_id,
            self.timestamp,
            self.is_delete,
            self.value.as_deref(),
        )
    }
}

/// Hash linking one commit-log entry to its predecessor for the same key.
#[must_use]
pub fn chain_hash(
    prev_hash: &str,
    key: &LedgerKey,
    tx_id: TxId,
    timestamp: OffsetDateTime,
    is_delete: bool,
    value: Option<&[u8]>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update([0x1f]);
    hasher.update(key.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(tx_id.to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(timestamp.unix_timestamp_nanos().to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update([u8::from(is_delete)]);
    if let Some(value) = value {
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChainSummary {
    pub entries: usize,
    pub head_hash: String,
}

/// Check the hash chain, sequence order, and timestamp order of one key's log.
///
/// # Errors
/// Returns [`ProvenanceError::Tampered`] at the first entry that breaks the chain.
pub fn verify_chain<I>(key: &LedgerKey, entries: I) -> Result<ChainSummary, ProvenanceError>
where
    I: IntoIterator<Item = LogEntry>,
{
    let mut head_hash = GENESIS_HASH.to_string();
    let mut last: Option<(u64, OffsetDateTime)> = None;
    let mut count = 0_usize;

    for entry in entries {
        let tampered = |reason: String| ProvenanceError::Tampered {
            key: key.to_string(),
            sequence: entry.sequence,
            reason,
        };

        if &entry.key != key {
            return Err(tampered(format!("entry belongs to {}", entry.key)));
        }
        if let Some((sequence, timestamp)) = last {
            if entry.sequence <= sequence {
                return Err(tampered(format!("sequence does not increase after {sequence}")));
            }
            if entry.timestamp < timestamp {
                return Err(tampered("timestamp precedes the previous commit".to_string()));
            }
        }
        if entry.prev_hash != head_hash {
            return Err(tampered("prev_hash does not match the preceding entry".to_string()));
        }
        if entry.is_delete != entry.value.is_none() {
            return Err(tampered("tombstone flag disagrees with stored value".to_string()));
        }
        let expected = entry.expected_hash(&head_hash);
        if entry.entry_hash != expected {
            return Err(tampered("entry_hash does not match entry contents".to_string()));
        }

        head_hash = entry.entry_hash;
        last = Some((entry.sequence, entry.timestamp));
        count += 1;
    }

    Ok(ChainSummary { entries: count, head_hash })
}

/// The shared ledger: a key-value world state with per-key serializable
/// transactions and an append-only commit log.
pub trait LedgerSubstrate: Send + Sync {
    /// Open a transaction and issue its id and commit timestamp.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Storage`] when the substrate is unavailable.
    fn begin(&self) -> Result<TxContext, ProvenanceError>;

    /// # Errors
    /// Returns [`ProvenanceError::Storage`] when the substrate is unavailable.
    fn read(&self, key: &LedgerKey) -> Result<Option<VersionedValue>, ProvenanceError>;

    /// Apply a write set atomically.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Conflict`] when any recorded read is stale or the
    /// transaction is older than the current head of a written key; nothing is
    /// written in that case.
    fn commit(&self, ctx: TxContext, write_set: WriteSet) -> Result<CommitMeta, ProvenanceError>;

    /// One page of the commit log for `key`, in commit order, strictly after
    /// `after_sequence`.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Storage`] when the log cannot be read.
    fn log_entries(
        &self,
        key: &LedgerKey,
        after_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, ProvenanceError>;

    /// Whether `key` was ever written, including keys since tombstoned.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Storage`] when the log cannot be read.
    fn has_history(&self, key: &LedgerKey) -> Result<bool, ProvenanceError> {
        Ok(!self.log_entries(key, None, 1)?.is_empty())
    }
}

impl<T: LedgerSubstrate + ?Sized> LedgerSubstrate for Arc<T> {
    fn begin(&self) -> Result<TxContext, ProvenanceError> {
        (**self).begin()
    }

    fn read(&self, key: &LedgerKey) -> Result<Option<VersionedValue>, ProvenanceError> {
        (**self).read(key)
    }

    fn commit(&self, ctx: TxContext, write_set: WriteSet) -> Result<CommitMeta, ProvenanceError> {
        (**self).commit(ctx, write_set)
    }

    fn log_entries(
        &self,
        key: &LedgerKey,
        after_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, ProvenanceError> {
        (**self).log_entries(key, after_sequence, limit)
    }

    fn has_history(&self, key: &LedgerKey) -> Result<bool, ProvenanceError> {
        (**self).has_history(key)
    }
}

/// In-process substrate for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    world: BTreeMap<LedgerKey, VersionedValue>,
    log: BTreeMap<LedgerKey, Vec<LogEntry>>,
    committed: BTreeSet<TxId>,
    next_sequence: u64,
    last_issued: Option<OffsetDateTime>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, ProvenanceError> {
        self.state
            .lock()
            .map_err(|_| ProvenanceError::Storage("memory ledger lock poisoned".to_string()))
    }
}

impl LedgerSubstrate for MemoryLedger {
    fn begin(&self) -> Result<TxContext, ProvenanceError> {
        let mut state = self.lock()?;
        let now = OffsetDateTime::now_utc();
        let timestamp = match state.last_issued {
            Some(last) if last > now => last,
            _ => now,
        };
        state.last_issued = Some(timestamp);
        Ok(TxContext { tx_id: TxId::new(), timestamp })
    }

    fn read(&self, key: &LedgerKey) -> Result<Option<VersionedValue>, ProvenanceError> {
        Ok(self.lock()?.world.get(key).cloned())
    }

    fn commit(&self, ctx: TxContext, write_set: WriteSet) -> Result<CommitMeta, ProvenanceError> {
        let mut state = self.lock()?;

        if state.committed.contains(&ctx.tx_id) {
            return Err(ProvenanceError::Validation(format!(
                "transaction {} was already committed",
                ctx.tx_id
            )));
        }
        for (key, observed) in write_set.reads() {
            let current = state.world.get(key).map(|value| value.version);
            if current != *observed {
                return Err(ProvenanceError::Conflict { key: key.to_string() });
            }
        }
        for (key, _) in write_set.writes() {
            let head = state.log.get(key).and_then(|entries| entries.last());
            if head.is_some_and(|head| head.timestamp > ctx.timestamp) {
                return Err(ProvenanceError::Conflict { key: key.to_string() });
            }
        }

        for (key, op) in write_set.writes {
            state.next_sequence += 1;
            let sequence = state.next_sequence;
            let prev_hash = state
                .log
                .get(&key)
                .and_then(|entries| entries.last())
                .map_or_else(|| GENESIS_HASH.to_string(), |head| head.entry_hash.clone());
            let value = match op {
                WriteOp::Put(value) => Some(value),
                WriteOp::Delete => None,
            };
            let is_delete = value.is_none();
            let entry_hash = chain_hash(
                &prev_hash,
                &key,
                ctx.tx_id,
                ctx.timestamp,
                is_delete,
                value.as_deref(),
            );

            match &value {
                Some(bytes) => {
                    state.world.insert(
                        key.clone(),
                        VersionedValue { value: bytes.clone(), version: ctx.tx_id },
                    );
                }
                None => {
                    state.world.remove(&key);
                }
            }
            state.log.entry(key.clone()).or_default().push(LogEntry {
                sequence,
                key,
                tx_id: ctx.tx_id,
                timestamp: ctx.timestamp,
                value,
                is_delete,
                prev_hash,
                entry_hash,
            });
        }
        state.committed.insert(ctx.tx_id);

        Ok(CommitMeta { tx_id: ctx.tx_id, timestamp: ctx.timestamp })
    }

    fn log_entries(
        &self,
        key: &LedgerKey,
        after_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, ProvenanceError> {
        let state = self.lock()?;
        let Some(entries) = state.log.get(key) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .filter(|entry| !after_sequence.is_some_and(|after| entry.sequence <= after))
            .take(limit)
            .cloned()
            .collect())
    }
}

mod hex_value {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|raw| hex::decode(raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}
