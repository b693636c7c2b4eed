use crate::substrate::{LedgerKey, LedgerSubstrate, WriteSet};
use crate::{decode_json, encode_json, Fruit, ProvenanceError, TraceabilityCode, TxId};

/// Current-state view of Fruit records over the ledger substrate.
///
/// Mutations are staged into a [`WriteSet`]; the caller commits them together
/// with any index updates so the whole submission lands in one transaction.
pub struct RecordStore<'a, L: ?Sized> {
    substrate: &'a L,
}

impl<'a, L: LedgerSubstrate + ?Sized> RecordStore<'a, L> {
    pub fn new(substrate: &'a L) -> Self {
        Self { substrate }
    }

    /// Load the current record and the version it was read at.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Encoding`] when the stored bytes do not decode, or
    /// a substrate error.
    pub fn load(&self, code: &TraceabilityCode) -> Result<Option<(Fruit, TxId)>, ProvenanceError> {
        let Some(stored) = self.substrate.read(&LedgerKey::fruit(code))? else {
            return Ok(None);
        };
        let fruit: Fruit = decode_json(&stored.value)?;
        Ok(Some((fruit, stored.version)))
    }

    /// # Errors
    /// Returns [`ProvenanceError::NotFound`] when no live record exists for `code`.
    pub fn get(&self, code: &TraceabilityCode) -> Result<Fruit, ProvenanceError> {
        self.load(code)?
            .map(|(fruit, _)| fruit)
            .ok_or_else(|| ProvenanceError::NotFound { key: LedgerKey::fruit(code).to_string() })
    }

    /// Whether `code` is live.
    ///
    /// # Errors
    /// Propagates substrate errors.
    pub fn exists(&self, code: &TraceabilityCode) -> Result<bool, ProvenanceError> {
        Ok(self.substrate.read(&LedgerKey::fruit(code))?.is_some())
    }

    /// Whether `code` was ever minted, tombstoned records included.
    ///
    /// # Errors
    /// Propagates substrate errors.
    pub fn was_minted(&self, code: &TraceabilityCode) -> Result<bool, ProvenanceError> {
        self.substrate.has_history(&LedgerKey::fruit(code))
    }

    /// Stage a put of `fruit` guarded by the version it was read at.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Encoding`] when the record cannot be serialized.
    pub fn stage_put(
        &self,
        write_set: &mut WriteSet,
        fruit: &Fruit,
        observed: Option<TxId>,
    ) -> Result<(), ProvenanceError> {
        let key = LedgerKey::fruit(&fruit.traceability_code);
        write_set.record_read(key.clone(), observed);
        write_set.put(key, encode_json(fruit)?);
        Ok(())
    }

    pub fn stage_delete(&self, write_set: &mut WriteSet, code: &TraceabilityCode, observed: TxId) {
        let key = LedgerKey::fruit(code);
        write_set.record_read(key.clone(), Some(observed));
        write_set.delete(key);
    }
}
