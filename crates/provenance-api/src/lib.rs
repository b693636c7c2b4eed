use std::path::{Path, PathBuf};

use anyhow::Result;
use provenance_core::{
    Caller, DriverInput, FactoryInput, FarmerInput, Fruit, HistoryQueryResult,
    HistoryVerification, ProvenanceLedger, ShopInput, StageReceipt, StageSubmission,
    TraceabilityCode, TxId, User, UserId, UserType,
};
use provenance_store_sqlite::{
    ExportManifest, ImportSummary, IntegrityReport, LedgerOptions, SchemaStatus, SqliteLedger,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterUserRequest {
    #[serde(alias = "userID")]
    pub user_id: UserId,
    #[serde(alias = "userType")]
    pub user_type: UserType,
    #[serde(alias = "realInfoHash")]
    pub real_info_hash: String,
}

/// A stage submission as received from a front-end. `caller` stands in for the
/// identity the transport has already authenticated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitStageRequest<T> {
    pub caller: Caller,
    pub traceability_code: TraceabilityCode,
    pub input: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FruitHistory {
    pub traceability_code: TraceabilityCode,
    pub entries: Vec<HistoryQueryResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserFruits {
    #[serde(rename = "userID")]
    pub user_id: UserId,
    #[serde(rename = "fruitList")]
    pub fruit_list: Vec<TraceabilityCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TombstoneResult {
    pub traceability_code: TraceabilityCode,
    pub tx_id: TxId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ProvenanceApi {
    db_path: PathBuf,
    options: LedgerOptions,
}

impl ProvenanceApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, options: LedgerOptions::default() }
    }

    #[must_use]
    pub fn with_options(db_path: PathBuf, options: LedgerOptions) -> Self {
        Self { db_path, options }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteLedger> {
        SqliteLedger::open_with(&self.db_path, self.options)
    }

    fn open_ledger(&self) -> Result<ProvenanceLedger<SqliteLedger>> {
        let store = self.open_store()?;
        store.migrate()?;
        Ok(ProvenanceLedger::new(store))
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error wrapping `DuplicateUser`/`Validation`, or a storage failure.
    pub fn register_user(&self, input: RegisterUserRequest) -> Result<User> {
        let ledger = self.open_ledger()?;
        Ok(ledger.register_user(input.user_id, input.user_type, input.real_info_hash)?)
    }

    /// # Errors
    /// See [`Self::submit_stage`].
    pub fn submit_farmer_stage(&self, input: SubmitStageRequest<FarmerInput>) -> Result<StageReceipt> {
        self.submit_stage(&input.caller, &input.traceability_code, StageSubmission::Farmer(input.input))
    }

    /// # Errors
    /// See [`Self::submit_stage`].
    pub fn submit_factory_stage(
        &self,
        input: SubmitStageRequest<FactoryInput>,
    ) -> Result<StageReceipt> {
        self.submit_stage(&input.caller, &input.traceability_code, StageSubmission::Factory(input.input))
    }

    /// # Errors
    /// See [`Self::submit_stage`].
    pub fn submit_driver_stage(&self, input: SubmitStageRequest<DriverInput>) -> Result<StageReceipt> {
        self.submit_stage(&input.caller, &input.traceability_code, StageSubmission::Driver(input.input))
    }

    /// # Errors
    /// See [`Self::submit_stage`].
    pub fn submit_shop_stage(&self, input: SubmitStageRequest<ShopInput>) -> Result<StageReceipt> {
        self.submit_stage(&input.caller, &input.traceability_code, StageSubmission::Shop(input.input))
    }

    /// Submit one stage. Ledger errors travel as `ProvenanceError` inside the
    /// returned `anyhow::Error`.
    ///
    /// # Errors
    /// Returns an error when validation, the state machine, or the commit fails.
    pub fn submit_stage(
        &self,
        caller: &Caller,
        code: &TraceabilityCode,
        submission: StageSubmission,
    ) -> Result<StageReceipt> {
        debug!(code = %code, stage = %submission.stage(), user_id = %caller.user_id, "stage submitted");
        let ledger = self.open_ledger()?;
        Ok(ledger.submit_stage(caller, code, submission)?)
    }

    /// # Errors
    /// Returns an error wrapping `NotFound` when the code is not live.
    pub fn get_fruit(&self, code: &TraceabilityCode) -> Result<Fruit> {
        Ok(self.open_ledger()?.get_fruit(code)?)
    }

    /// # Errors
    /// Returns an error wrapping `NotFound` when the code was never created.
    pub fn get_fruit_history(&self, code: &TraceabilityCode) -> Result<FruitHistory> {
        let entries = self.open_ledger()?.collect_fruit_history(code)?;
        Ok(FruitHistory { traceability_code: code.clone(), entries })
    }

    /// # Errors
    /// Returns an error wrapping `NotFound` for an unregistered user.
    pub fn get_user_fruits(&self, user_id: &UserId) -> Result<UserFruits> {
        let fruit_list = self.open_ledger()?.get_user_fruits(user_id)?;
        Ok(UserFruits { user_id: user_id.clone(), fruit_list })
    }

    /// # Errors
    /// Returns an error wrapping `NotFound` for an unregistered user.
    pub fn get_user(&self, user_id: &UserId) -> Result<User> {
        Ok(self.open_ledger()?.get_user(user_id)?)
    }

    /// # Errors
    /// Returns an error wrapping `Tampered` when verification fails.
    pub fn verify_history(&self, code: &TraceabilityCode) -> Result<HistoryVerification> {
        Ok(self.open_ledger()?.verify_history(code)?)
    }

    /// # Errors
    /// Returns an error wrapping `NotFound` when the code is not live.
    pub fn tombstone_fruit(&self, code: &TraceabilityCode) -> Result<TombstoneResult> {
        let meta = self.open_ledger()?.tombstone_fruit(code)?;
        Ok(TombstoneResult {
            traceability_code: code.clone(),
            tx_id: meta.tx_id,
            timestamp: meta.timestamp,
        })
    }

    /// # Errors
    /// Returns an error when an integrity check fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_ledger()?.substrate().integrity_check()
    }

    /// # Errors
    /// Returns an error when the snapshot cannot be written.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        self.open_ledger()?.substrate().export_snapshot(out_dir)
    }

    /// # Errors
    /// Returns an error when the snapshot fails verification or the ledger is not empty.
    pub fn import_snapshot(&self, in_dir: &Path) -> Result<ImportSummary> {
        self.open_store()?.import_snapshot(in_dir)
    }

    /// Import against manifest bytes the caller already holds (and has
    /// typically checked a signature over) instead of re-reading `manifest.json`.
    ///
    /// # Errors
    /// Returns an error when the snapshot fails verification or the ledger is not empty.
    pub fn import_snapshot_with_manifest(
        &self,
        in_dir: &Path,
        manifest_bytes: &[u8],
    ) -> Result<ImportSummary> {
        self.open_store()?.import_snapshot_with_manifest(in_dir, manifest_bytes)
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        self.open_ledger()?.substrate().backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the backup is missing or the restore fails.
    pub fn restore_database(&self, in_file: &Path) -> Result<()> {
        self.open_store()?.restore_database(in_file)
    }
}
