use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::substrate::{verify_chain, ChainSummary, LedgerKey, LedgerSubstrate, LogEntry};
use crate::{decode_json, Fruit, HistoryQueryResult, ProvenanceError, Stage, TraceabilityCode};

const DEFAULT_PAGE_SIZE: usize = 64;

/// Read-only replay of a Fruit's commit log.
pub struct HistoryReconstructor<'a, L: ?Sized> {
    substrate: &'a L,
    page_size: usize,
}

/// Result of a successful history verification.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryVerification {
    pub code: TraceabilityCode,
    pub entries: usize,
    pub head_hash: String,
}

impl<'a, L: LedgerSubstrate + ?Sized> HistoryReconstructor<'a, L> {
    pub fn new(substrate: &'a L) -> Self {
        Self { substrate, page_size: DEFAULT_PAGE_SIZE }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Lazy sequence of snapshots from the earliest commit to the latest.
    /// Every call starts over from the beginning of the log.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::NotFound`] when the code was never created.
    pub fn history(&self, code: &TraceabilityCode) -> Result<HistoryIter<'a, L>, ProvenanceError> {
        let key = LedgerKey::fruit(code);
        let first_page = self.substrate.log_entries(&key, None, self.page_size)?;
        if first_page.is_empty() {
            return Err(ProvenanceError::NotFound { key: key.to_string() });
        }
        Ok(HistoryIter {
            substrate: self.substrate,
            key,
            page_size: self.page_size,
            buffer: first_page.into(),
            last_sequence: None,
            exhausted: false,
        })
    }

    /// Collect the whole history eagerly.
    ///
    /// # Errors
    /// As [`Self::history`], plus decoding errors of individual snapshots.
    pub fn collect(&self, code: &TraceabilityCode) -> Result<Vec<HistoryQueryResult>, ProvenanceError> {
        self.history(code)?.collect()
    }

    /// Recompute the hash chain and check stage semantics across every snapshot.
    ///
    /// # Errors
    /// [`ProvenanceError::NotFound`] for an unknown code, [`ProvenanceError::Tampered`]
    /// at the first entry that fails a check.
    pub fn verify(&self, code: &TraceabilityCode) -> Result<HistoryVerification, ProvenanceError> {
        let key = LedgerKey::fruit(code);
        let entries = self.read_all(&key)?;
        if entries.is_empty() {
            return Err(ProvenanceError::NotFound { key: key.to_string() });
        }

        match verify_fruit_log(code, &entries) {
            Ok(summary) => Ok(HistoryVerification {
                code: code.clone(),
                entries: summary.entries,
                head_hash: summary.head_hash,
            }),
            Err(err) => {
                warn!(code = %code, error = %err, "history verification failed");
                Err(err)
            }
        }
    }

    fn read_all(&self, key: &LedgerKey) -> Result<Vec<LogEntry>, ProvenanceError> {
        let mut entries = Vec::new();
        let mut after = None;
        loop {
            let page = self.substrate.log_entries(key, after, self.page_size)?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.sequence);
            let full = page.len() == self.page_size;
            entries.extend(page);
            if !full {
                break;
            }
        }
        Ok(entries)
    }
}

/// Verify one fruit's full commit log: the hash chain first, then the stage
/// semantics of every snapshot. Used by imports and integrity checks, which
/// see raw log rows rather than a live substrate.
///
/// # Errors
/// Returns [`ProvenanceError::Tampered`] naming the first offending entry.
pub fn verify_fruit_log(
    code: &TraceabilityCode,
    entries: &[LogEntry],
) -> Result<ChainSummary, ProvenanceError> {
    let key = LedgerKey::fruit(code);
    let summary = verify_chain(&key, entries.iter().cloned())?;
    check_snapshots(code, &key, entries)?;
    Ok(summary)
}

/// Stage sub-records only ever appear in order, one per commit, stamped with
/// that commit's id and time, and never change afterwards.
fn check_snapshots(
    code: &TraceabilityCode,
    key: &LedgerKey,
    entries: &[LogEntry],
) -> Result<(), ProvenanceError> {
    let mut previous: Option<Fruit> = None;
    let mut deleted = false;

    for entry in entries {
        let tampered = |reason: String| ProvenanceError::Tampered {
            key: key.to_string(),
            sequence: entry.sequence,
            reason,
        };

        if deleted {
            return Err(tampered("entry recorded after tombstone".to_string()));
        }
        let Some(value) = &entry.value else {
            deleted = true;
            continue;
        };
        let fruit: Fruit =
            decode_json(value).map_err(|err| tampered(format!("snapshot does not decode: {err}")))?;

        if &fruit.traceability_code != code {
            return Err(tampered(format!(
                "snapshot carries traceability code {}",
                fruit.traceability_code
            )));
        }
        if fruit.populated_state() != Some(fruit.state) {
            return Err(tampered(format!("state {} disagrees with stage records", fruit.state)));
        }

        let mut added = 0_usize;
        for stage in Stage::ALL {
            let before = previous.as_ref().map(|prior| stage_json(prior, stage)).transpose()?;
            let now = stage_json(&fruit, stage)?;
            match before.flatten() {
                Some(prior) if Some(&prior) != now.as_ref() => {
                    return Err(tampered(format!("{stage} record changed after it was written")));
                }
                Some(_) => {}
                None if now.is_some() => {
                    added += 1;
                    if fruit.stage_stamp(stage) != Some((entry.tx_id, entry.timestamp)) {
                        return Err(tampered(format!(
                            "{stage} record is not stamped with its commit"
                        )));
                    }
                }
                None => {}
            }
        }
        if added != 1 {
            return Err(tampered(format!("commit added {added} stage records")));
        }
        previous = Some(fruit);
    }
    Ok(())
}

fn stage_json(fruit: &Fruit, stage: Stage) -> Result<Option<serde_json::Value>, ProvenanceError> {
    let value = match stage {
        Stage::Farmer => fruit.farmer_input.as_ref().map(serde_json::to_value),
        Stage::Factory => fruit.factory_input.as_ref().map(serde_json::to_value),
        Stage::Driver => fruit.driver_input.as_ref().map(serde_json::to_value),
        Stage::Shop => fruit.shop_input.as_ref().map(serde_json::to_value),
    };
    value.transpose().map_err(|err| ProvenanceError::Encoding(err.to_string()))
}

/// Paged iterator over a Fruit's commit log. Fuses after the first error.
pub struct HistoryIter<'a, L: ?Sized> {
    substrate: &'a L,
    key: LedgerKey,
    page_size: usize,
    buffer: VecDeque<LogEntry>,
    last_sequence: Option<u64>,
    exhausted: bool,
}

impl<L: LedgerSubstrate + ?Sized> Iterator for HistoryIter<'_, L> {
    type Item = Result<HistoryQueryResult, ProvenanceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.substrate.log_entries(&self.key, self.last_sequence, self.page_size) {
                Ok(page) => {
                    self.exhausted = page.len() < self.page_size;
                    self.buffer = page.into();
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }

        let entry = self.buffer.pop_front()?;
        self.last_sequence = Some(entry.sequence);
        let record = match entry.value.as_deref().map(decode_json::<Fruit>).transpose() {
            Ok(record) => record,
            Err(err) => {
                self.exhausted = true;
                self.buffer.clear();
                return Some(Err(err));
            }
        };
        Some(Ok(HistoryQueryResult {
            record,
            tx_id: entry.tx_id,
            timestamp: entry.timestamp,
            is_delete: entry.is_delete,
        }))
    }
}
