use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use provenance_core::{
    chain_hash, verify_chain, verify_fruit_log, ChainSummary, CommitMeta, LedgerKey,
    LedgerSubstrate, LogEntry, ProvenanceError, TxContext, TxId, VersionedValue, WriteOp,
    WriteSet, GENESIS_HASH,
};
use rusqlite::{
    params, Connection, DatabaseName, ErrorCode, OptionalExtension, TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const LATEST_SCHEMA_VERSION: i64 = 1;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const COMMIT_LOG_FILE: &str = "commit_log.ndjson";
const WORLD_STATE_FILE: &str = "world_state.ndjson";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ledger_transactions (
  tx_id TEXT PRIMARY KEY,
  committed_at_ns INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS commit_log (
  sequence INTEGER PRIMARY KEY AUTOINCREMENT,
  ledger_key TEXT NOT NULL,
  tx_id TEXT NOT NULL,
  committed_at_ns INTEGER NOT NULL,
  value BLOB,
  is_delete INTEGER NOT NULL CHECK (is_delete IN (0, 1)),
  prev_hash TEXT NOT NULL,
  entry_hash TEXT NOT NULL,
  CHECK ((is_delete = 1 AND value IS NULL) OR (is_delete = 0 AND value IS NOT NULL)),
  UNIQUE(ledger_key, tx_id),
  FOREIGN KEY (tx_id) REFERENCES ledger_transactions(tx_id)
);

CREATE TABLE IF NOT EXISTS world_state (
  ledger_key TEXT PRIMARY KEY,
  value BLOB NOT NULL,
  version TEXT NOT NULL,
  updated_at_ns INTEGER NOT NULL,
  FOREIGN KEY (version) REFERENCES ledger_transactions(tx_id)
);

CREATE INDEX IF NOT EXISTS idx_commit_log_key_sequence ON commit_log(ledger_key, sequence);

CREATE TRIGGER IF NOT EXISTS commit_log_no_update
BEFORE UPDATE ON commit_log
BEGIN
  SELECT RAISE(ABORT, 'commit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS commit_log_no_delete
BEFORE DELETE ON commit_log
BEGIN
  SELECT RAISE(ABORT, 'commit_log is append-only');
END;
";

const LOG_COLUMNS: &str =
    "sequence, ledger_key, tx_id, committed_at_ns, value, is_delete, prev_hash, entry_hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerOptions {
    pub busy_timeout_ms: u64,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self { busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS }
    }
}

/// Durable ledger substrate: world state plus an append-only, hash-chained
/// commit log in one `SQLite` database.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_entries: usize,
    pub imported_transactions: usize,
    pub imported_keys: usize,
    pub live_keys: usize,
}

/// One world-state row as written to a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorldStateRow {
    pub key: LedgerKey,
    pub version: TxId,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainViolation {
    pub key: String,
    pub sequence: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub checked_keys: usize,
    pub chain_violations: Vec<ChainViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteLedger {
    /// Open a ledger database with default options.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, LedgerOptions::default())
    }

    /// Open a ledger database and configure the runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with(path: &Path, options: LedgerOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))
            .context("failed to configure sqlite busy timeout")?;

        debug!(path = %path.display(), busy_timeout_ms = options.busy_timeout_ms, "opened ledger database");
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.conn()?;
        schema_status(&conn)
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the database is newer
    /// than this build understands.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        migrate(&conn)
    }

    /// Run quick-check, foreign-key-check, schema status, and a hash-chain
    /// walk of every key's commit log.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let conn = self.conn()?;
        let quick_check_message: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let keys = distinct_keys(&conn)?;
        let mut chain_violations = Vec::new();
        for key in &keys {
            let entries = query_log(&conn, key, None, None)?;
            let head = entries.last().cloned();
            match verify_key_log(key, &entries) {
                Ok(_) => {}
                Err(ProvenanceError::Tampered { key, sequence, reason }) => {
                    chain_violations.push(ChainViolation { key, sequence, reason });
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            if let Some(head) = head {
                let world = query_world(&conn, key)?;
                let consistent = match (&head.value, world) {
                    (None, None) => true,
                    (Some(value), Some(world)) => {
                        *value == world.value && head.tx_id == world.version
                    }
                    _ => false,
                };
                if !consistent {
                    chain_violations.push(ChainViolation {
                        key: key.to_string(),
                        sequence: head.sequence,
                        reason: "world state diverges from commit log head".to_string(),
                    });
                }
            }
        }
        if !chain_violations.is_empty() {
            warn!(violations = chain_violations.len(), "integrity check found chain violations");
        }

        let schema_status = schema_status(&conn)?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            checked_keys: keys.len(),
            chain_violations,
            schema_status,
        })
    }

    /// Write the commit log and world state as NDJSON plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let (entries, world) = {
            let conn = self.conn()?;
            (query_all_log(&conn)?, query_all_world(&conn)?)
        };

        let log_digest = write_ndjson_file(&out_dir.join(COMMIT_LOG_FILE), &entries)?;
        let world_digest = write_ndjson_file(&out_dir.join(WORLD_STATE_FILE), &world)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: COMMIT_LOG_FILE.to_string(),
                    sha256: log_digest.0,
                    records: log_digest.1,
                },
                ExportFileDigest {
                    path: WORLD_STATE_FILE.to_string(),
                    sha256: world_digest.0,
                    records: world_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        info!(dir = %out_dir.display(), entries = entries.len(), "exported ledger snapshot");
        Ok(manifest)
    }

    /// Replay an exported snapshot into this (empty) ledger. The manifest
    /// digests, every key's hash chain, the stage history of every fruit, and
    /// the exported world state are all checked before anything is written.
    ///
    /// # Errors
    /// Returns an error when the ledger is not empty or any check fails.
    pub fn import_snapshot(&self, in_dir: &Path) -> Result<ImportSummary> {
        let manifest_path = in_dir.join("manifest.json");
        let manifest_bytes = fs::read(&manifest_path)
            .with_context(|| format!("failed to read manifest file {}", manifest_path.display()))?;
        self.import_snapshot_with_manifest(in_dir, &manifest_bytes)
    }

    /// Like [`Self::import_snapshot`], but trusts only the given manifest
    /// bytes, so a caller that checked a signature over them imports exactly
    /// what it verified. `manifest.json` on disk is not read again. Each data
    /// file is read once and parsed from the same bytes its digest covered.
    ///
    /// # Errors
    /// Returns an error when the ledger is not empty or any check fails.
    pub fn import_snapshot_with_manifest(
        &self,
        in_dir: &Path,
        manifest_bytes: &[u8],
    ) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest: ExportManifest =
            serde_json::from_slice(manifest_bytes).context("failed to parse manifest JSON")?;
        let files = validate_import_manifest(in_dir, &manifest)?;

        let mut entries = parse_ndjson::<LogEntry>(COMMIT_LOG_FILE, &files.commit_log)?;
        let world = parse_ndjson::<WorldStateRow>(WORLD_STATE_FILE, &files.world_state)?;
        entries.sort_by_key(|entry| entry.sequence);
        if entries.windows(2).any(|pair| pair[0].sequence == pair[1].sequence) {
            return Err(anyhow!("snapshot commit log repeats a sequence number"));
        }

        let mut by_key: BTreeMap<LedgerKey, Vec<LogEntry>> = BTreeMap::new();
        for entry in &entries {
            by_key.entry(entry.key.clone()).or_default().push(entry.clone());
        }
        let mut expected_world = BTreeMap::new();
        for (key, key_entries) in &by_key {
            let head = key_entries.last().cloned();
            verify_key_log(key, key_entries).with_context(|| {
                format!("snapshot commit log failed verification for {key}")
            })?;
            if let Some(LogEntry { value: Some(value), tx_id, .. }) = head {
                expected_world.insert(key.clone(), (tx_id, hex::encode(value)));
            }
        }
        let exported_world = world
            .iter()
            .map(|row| (row.key.clone(), (row.version, row.value.clone())))
            .collect::<BTreeMap<_, _>>();
        if exported_world != expected_world {
            return Err(anyhow!("snapshot world state does not match its commit log"));
        }

        let mut transactions: BTreeMap<TxId, OffsetDateTime> = BTreeMap::new();
        for entry in &entries {
            if let Some(existing) = transactions.insert(entry.tx_id, entry.timestamp) {
                if existing != entry.timestamp {
                    return Err(anyhow!(
                        "snapshot transaction {} carries two commit timestamps",
                        entry.tx_id
                    ));
                }
            }
        }

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start import transaction")?;
        let existing: i64 = tx
            .query_row("SELECT COUNT(*) FROM commit_log", [], |row| row.get(0))
            .context("failed to count existing commit log entries")?;
        if existing > 0 {
            return Err(anyhow!("snapshot import requires an empty ledger; found {existing} entries"));
        }

        for (tx_id, timestamp) in &transactions {
            tx.execute(
                "INSERT INTO ledger_transactions(tx_id, committed_at_ns) VALUES (?1, ?2)",
                params![tx_id.to_string(), to_nanos(*timestamp)?],
            )
            .context("failed to insert imported transaction")?;
        }
        for entry in &entries {
            tx.execute(
                "INSERT INTO commit_log(
                    sequence, ledger_key, tx_id, committed_at_ns, value, is_delete, prev_hash, entry_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    i64::try_from(entry.sequence).context("sequence out of range")?,
                    entry.key.as_str(),
                    entry.tx_id.to_string(),
                    to_nanos(entry.timestamp)?,
                    entry.value.as_deref(),
                    entry.is_delete,
                    entry.prev_hash,
                    entry.entry_hash,
                ],
            )
            .context("failed to insert imported commit log entry")?;
        }
        for (key, key_entries) in &by_key {
            let Some(LogEntry { value: Some(value), tx_id, timestamp, .. }) = key_entries.last()
            else {
                continue;
            };
            tx.execute(
                "INSERT INTO world_state(ledger_key, value, version, updated_at_ns)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key.as_str(), value, tx_id.to_string(), to_nanos(*timestamp)?],
            )
            .context("failed to insert imported world state")?;
        }
        tx.commit().context("failed to commit import transaction")?;

        let summary = ImportSummary {
            imported_entries: entries.len(),
            imported_transactions: transactions.len(),
            imported_keys: by_key.len(),
            live_keys: expected_world.len(),
        };
        info!(
            dir = %in_dir.display(),
            entries = summary.imported_entries,
            keys = summary.imported_keys,
            "imported ledger snapshot"
        );
        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn()?
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn()?
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()
    }

    fn begin_tx(&self) -> Result<TxContext> {
        let conn = self.conn()?;
        let latest: Option<i64> = conn
            .query_row("SELECT MAX(committed_at_ns) FROM ledger_transactions", [], |row| row.get(0))
            .context("failed to read latest commit timestamp")?;
        let now = OffsetDateTime::now_utc();
        let timestamp = match latest.map(from_nanos).transpose()? {
            Some(latest) if latest > now => latest,
            _ => now,
        };
        Ok(TxContext { tx_id: TxId::new(), timestamp })
    }

    fn commit_tx(&self, ctx: TxContext, write_set: &WriteSet) -> Result<CommitMeta> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start commit transaction")?;
        let tx_id = ctx.tx_id.to_string();
        let committed_at_ns = to_nanos(ctx.timestamp)?;

        let already_committed: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM ledger_transactions WHERE tx_id = ?1)",
                params![tx_id],
                |row| row.get(0),
            )
            .context("failed to check transaction id")?;
        if already_committed {
            return Err(ProvenanceError::Validation(format!(
                "transaction {tx_id} was already committed"
            ))
            .into());
        }

        for (key, observed) in write_set.reads() {
            let current = query_world(&tx, key)?.map(|value| value.version);
            if current != *observed {
                return Err(ProvenanceError::Conflict { key: key.to_string() }.into());
            }
        }

        let mut prev_hashes = Vec::with_capacity(write_set.writes().len());
        for (key, _) in write_set.writes() {
            let head: Option<(i64, String)> = tx
                .query_row(
                    "SELECT committed_at_ns, entry_hash FROM commit_log
                     WHERE ledger_key = ?1 ORDER BY sequence DESC LIMIT 1",
                    params![key.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .with_context(|| format!("failed to read commit log head for {key}"))?;
            match head {
                Some((head_ns, _)) if head_ns > committed_at_ns => {
                    return Err(ProvenanceError::Conflict { key: key.to_string() }.into());
                }
                Some((_, entry_hash)) => prev_hashes.push(entry_hash),
                None => prev_hashes.push(GENESIS_HASH.to_string()),
            }
        }

        tx.execute(
            "INSERT INTO ledger_transactions(tx_id, committed_at_ns) VALUES (?1, ?2)",
            params![tx_id, committed_at_ns],
        )
        .context("failed to record transaction")?;

        for ((key, op), prev_hash) in write_set.writes().iter().zip(prev_hashes) {
            let value = match op {
                WriteOp::Put(bytes) => Some(bytes.as_slice()),
                WriteOp::Delete => None,
            };
            let is_delete = value.is_none();
            let entry_hash =
                chain_hash(&prev_hash, key, ctx.tx_id, ctx.timestamp, is_delete, value);
            tx.execute(
                "INSERT INTO commit_log(
                    ledger_key, tx_id, committed_at_ns, value, is_delete, prev_hash, entry_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![key.as_str(), tx_id, committed_at_ns, value, is_delete, prev_hash, entry_hash],
            )
            .with_context(|| format!("failed to append commit log entry for {key}"))?;

            match value {
                Some(bytes) => {
                    tx.execute(
                        "INSERT INTO world_state(ledger_key, value, version, updated_at_ns)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(ledger_key) DO UPDATE SET
                           value = excluded.value,
                           version = excluded.version,
                           updated_at_ns = excluded.updated_at_ns",
                        params![key.as_str(), bytes, tx_id, committed_at_ns],
                    )
                    .with_context(|| format!("failed to update world state for {key}"))?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM world_state WHERE ledger_key = ?1",
                        params![key.as_str()],
                    )
                    .with_context(|| format!("failed to remove world state for {key}"))?;
                }
            }
        }

        tx.commit().context("failed to commit ledger transaction")?;
        Ok(CommitMeta { tx_id: ctx.tx_id, timestamp: ctx.timestamp })
    }
}

impl LedgerSubstrate for SqliteLedger {
    fn begin(&self) -> Result<TxContext, ProvenanceError> {
        self.begin_tx().map_err(|err| into_ledger_error(&err, None))
    }

    fn read(&self, key: &LedgerKey) -> Result<Option<VersionedValue>, ProvenanceError> {
        self.conn()
            .and_then(|conn| query_world(&conn, key))
            .map_err(|err| into_ledger_error(&err, Some(key)))
    }

    fn commit(&self, ctx: TxContext, write_set: WriteSet) -> Result<CommitMeta, ProvenanceError> {
        let first_key = write_set.writes().first().map(|(key, _)| key.clone());
        self.commit_tx(ctx, &write_set)
            .map_err(|err| into_ledger_error(&err, first_key.as_ref()))
    }

    fn log_entries(
        &self,
        key: &LedgerKey,
        after_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, ProvenanceError> {
        self.conn()
            .and_then(|conn| query_log(&conn, key, after_sequence, Some(limit)))
            .map_err(|err| into_ledger_error(&err, Some(key)))
    }

    fn has_history(&self, key: &LedgerKey) -> Result<bool, ProvenanceError> {
        self.conn()
            .and_then(|conn| {
                conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM commit_log WHERE ledger_key = ?1)",
                    params![key.as_str()],
                    |row| row.get::<_, bool>(0),
                )
                .with_context(|| format!("failed to check history for {key}"))
            })
            .map_err(|err| into_ledger_error(&err, Some(key)))
    }
}

/// Recover typed ledger errors carried through `anyhow`; a busy database is a
/// lost race like any other.
fn into_ledger_error(err: &anyhow::Error, key: Option<&LedgerKey>) -> ProvenanceError {
    if let Some(ledger_err) = err.downcast_ref::<ProvenanceError>() {
        return ledger_err.clone();
    }
    let busy = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    });
    if busy {
        let key = key.map_or_else(|| "database".to_string(), ToString::to_string);
        warn!(key = %key, "sqlite database busy");
        return ProvenanceError::Conflict { key };
    }
    ProvenanceError::Storage(format!("{err:#}"))
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    if current_schema_version(conn)? == 0 {
        apply_migration_1(conn)?;
        info!(version = 1, "applied ledger schema migration");
    }

    let version = current_schema_version(conn)?;
    if version != LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
        ));
    }
    Ok(())
}

fn schema_status(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction().context("failed to start migration v1")?;
    tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(&tx, 1)?;
    tx.commit().context("failed to commit migration v1")?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

struct LogRow {
    sequence: i64,
    key: String,
    tx_id: String,
    committed_at_ns: i64,
    value: Option<Vec<u8>>,
    is_delete: bool,
    prev_hash: String,
    entry_hash: String,
}

impl LogRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            key: row.get(1)?,
            tx_id: row.get(2)?,
            committed_at_ns: row.get(3)?,
            value: row.get(4)?,
            is_delete: row.get(5)?,
            prev_hash: row.get(6)?,
            entry_hash: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<LogEntry> {
        Ok(LogEntry {
            sequence: u64::try_from(self.sequence)
                .with_context(|| format!("negative commit log sequence {}", self.sequence))?,
            key: LedgerKey::from_raw(self.key),
            tx_id: parse_tx_id(&self.tx_id)?,
            timestamp: from_nanos(self.committed_at_ns)?,
            value: self.value,
            is_delete: self.is_delete,
            prev_hash: self.prev_hash,
            entry_hash: self.entry_hash,
        })
    }
}

fn query_log(
    conn: &Connection,
    key: &LedgerKey,
    after_sequence: Option<u64>,
    limit: Option<usize>,
) -> Result<Vec<LogEntry>> {
    let after = i64::try_from(after_sequence.unwrap_or(0)).context("sequence out of range")?;
    let limit = match limit {
        Some(limit) => i64::try_from(limit).context("page limit out of range")?,
        None => -1,
    };
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM commit_log
             WHERE ledger_key = ?1 AND sequence > ?2
             ORDER BY sequence ASC LIMIT ?3"
        ))
        .context("failed to prepare commit log query")?;
    let rows = stmt.query_map(params![key.as_str(), after, limit], LogRow::from_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?.into_entry()?);
    }
    Ok(entries)
}

fn query_all_log(conn: &Connection) -> Result<Vec<LogEntry>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {LOG_COLUMNS} FROM commit_log ORDER BY sequence ASC"))
        .context("failed to prepare commit log export query")?;
    let rows = stmt.query_map([], LogRow::from_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?.into_entry()?);
    }
    Ok(entries)
}

fn query_world(conn: &Connection, key: &LedgerKey) -> Result<Option<VersionedValue>> {
    let row: Option<(Vec<u8>, String)> = conn
        .query_row(
            "SELECT value, version FROM world_state WHERE ledger_key = ?1",
            params![key.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .with_context(|| format!("failed to read world state for {key}"))?;

    row.map(|(value, version)| Ok(VersionedValue { value, version: parse_tx_id(&version)? }))
        .transpose()
}

fn query_all_world(conn: &Connection) -> Result<Vec<WorldStateRow>> {
    let mut stmt = conn
        .prepare("SELECT ledger_key, value, version FROM world_state ORDER BY ledger_key ASC")
        .context("failed to prepare world state export query")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?, row.get::<_, String>(2)?))
    })?;

    let mut world = Vec::new();
    for row in rows {
        let (key, value, version) = row?;
        world.push(WorldStateRow {
            key: LedgerKey::from_raw(key),
            version: parse_tx_id(&version)?,
            value: hex::encode(value),
        });
    }
    Ok(world)
}

fn distinct_keys(conn: &Connection) -> Result<Vec<LedgerKey>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT ledger_key FROM commit_log ORDER BY ledger_key ASC")
        .context("failed to prepare ledger key query")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut keys = Vec::new();
    for row in rows {
        keys.push(LedgerKey::from_raw(row?));
    }
    Ok(keys)
}

fn parse_tx_id(raw: &str) -> Result<TxId> {
    TxId::parse(raw).with_context(|| format!("invalid stored transaction id: {raw}"))
}

fn to_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of storable range: {value}"))
}

fn from_nanos(value: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .with_context(|| format!("invalid stored timestamp: {value}"))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

/// Hash-chain check for any key, plus the stage history rules for `fruit:` keys.
fn verify_key_log(
    key: &LedgerKey,
    entries: &[LogEntry],
) -> Result<ChainSummary, ProvenanceError> {
    if !key.as_str().starts_with("fruit:") {
        return verify_chain(key, entries.iter().cloned());
    }
    match key.fruit_code() {
        Some(code) => verify_fruit_log(&code, entries),
        None => Err(ProvenanceError::Tampered {
            key: key.to_string(),
            sequence: entries.first().map_or(0, |entry| entry.sequence),
            reason: "fruit key carries an invalid traceability code".to_string(),
        }),
    }
}

/// Snapshot data files, held exactly as read when their digests were checked.
struct VerifiedSnapshotFiles {
    commit_log: String,
    world_state: String,
}

fn parse_ndjson<T: DeserializeOwned>(name: &str, contents: &str) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed)
            .with_context(|| format!("failed to parse NDJSON row {} from {name}", index + 1))?;
        values.push(value);
    }
    Ok(values)
}

fn ndjson_digest_and_records(contents: &str) -> (String, usize) {
    let mut hasher = Sha256::new();
    let mut records = 0_usize;
    for line in contents.lines() {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }
    (format!("{:x}", hasher.finalize()), records)
}

fn validate_import_manifest(
    in_dir: &Path,
    manifest: &ExportManifest,
) -> Result<VerifiedSnapshotFiles> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    Ok(VerifiedSnapshotFiles {
        commit_log: read_verified_file(in_dir, &by_path, COMMIT_LOG_FILE)?,
        world_state: read_verified_file(in_dir, &by_path, WORLD_STATE_FILE)?,
    })
}

fn read_verified_file(
    in_dir: &Path,
    by_path: &BTreeMap<&str, &ExportFileDigest>,
    required: &str,
) -> Result<String> {
    let Some(expected) = by_path.get(required) else {
        return Err(anyhow!("manifest is missing required file entry: {required}"));
    };
    let file_path = in_dir.join(required);
    if !file_path.exists() {
        return Err(anyhow!("manifest references missing file {}", file_path.display()));
    }
    let contents = fs::read_to_string(&file_path)
        .with_context(|| format!("failed to read NDJSON file {}", file_path.display()))?;

    let (actual_sha256, actual_records) = ndjson_digest_and_records(&contents);
    if actual_sha256 != expected.sha256 {
        warn!(file = required, "snapshot digest mismatch");
        return Err(anyhow!(
            "manifest digest mismatch for {required}: expected {}, got {}",
            expected.sha256,
            actual_sha256
        ));
    }
    if actual_records != expected.records {
        return Err(anyhow!(
            "manifest record count mismatch for {required}: expected {}, got {}",
            expected.records,
            actual_records
        ));
    }
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use provenance_core::{
        Caller, DriverInput, FactoryInput, FarmerInput, Fruit, ProvenanceLedger, Stage,
        StageState, TraceabilityCode, UserId, UserType,
    };
    use ulid::Ulid;

    use super::*;

    fn hash(seed: char) -> String {
        format!("sha256:{}", seed.to_string().repeat(64))
    }

    fn code(value: &str) -> Result<TraceabilityCode> {
        Ok(TraceabilityCode::parse(value)?)
    }

    fn caller(id: &str, user_type: UserType) -> Result<Caller> {
        Ok(Caller::new(UserId::parse(id)?, user_type))
    }

    fn farmer_input() -> FarmerInput {
        FarmerInput {
            fruit_name: "Navel orange".to_string(),
            origin: "Ganzhou, Jiangxi".to_string(),
            plant_time: "2019-03-01".to_string(),
            picking_time: "2025-11-20".to_string(),
            farmer_name: "Li Wei".to_string(),
            img_hash: hash('a'),
        }
    }

    fn factory_input() -> FactoryInput {
        FactoryInput {
            product_name: "Sorted navel oranges".to_string(),
            production_batch: "B-2025-1121".to_string(),
            production_time: "2025-11-21T08:00:00Z".to_string(),
            factory_name: "Ganzhou Packing Co.".to_string(),
            contact_number: "+86-797-555-0101".to_string(),
            img_hash: hash('b'),
        }
    }

    fn driver_input() -> DriverInput {
        DriverInput {
            name: "Zhang Min".to_string(),
            age: "41".to_string(),
            phone: "+86-139-5550-0102".to_string(),
            car_number: "JX-B12345".to_string(),
            transport: "Cold chain".to_string(),
            img_hash: hash('c'),
        }
    }

    fn migrated_memory_ledger() -> Result<ProvenanceLedger<SqliteLedger>> {
        let store = SqliteLedger::open(Path::new(":memory:"))?;
        store.migrate()?;
        let ledger = ProvenanceLedger::new(store);
        for (id, user_type) in [
            ("p1", UserType::Producer),
            ("f1", UserType::Processor),
            ("d1", UserType::Carrier),
        ] {
            ledger.register_user(UserId::parse(id)?, user_type, hash('e'))?;
        }
        Ok(ledger)
    }

    fn seed_lot(ledger: &ProvenanceLedger<SqliteLedger>, value: &str) -> Result<()> {
        let lot = code(value)?;
        ledger.submit_farmer_stage(&caller("p1", UserType::Producer)?, &lot, farmer_input())?;
        ledger.submit_factory_stage(&caller("f1", UserType::Processor)?, &lot, factory_input())?;
        Ok(())
    }

    fn temp_path(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("provenance-{prefix}-{}", Ulid::new()))
    }

    fn remove_sqlite_files(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    #[test]
    fn migrate_creates_schema_and_reports_status() -> Result<()> {
        let store = SqliteLedger::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn stage_scenario_persists_through_sqlite() -> Result<()> {
        let ledger = migrated_memory_ledger()?;
        let lot = code("T-001")?;
        ledger.submit_farmer_stage(&caller("p1", UserType::Producer)?, &lot, farmer_input())?;

        let skipped =
            ledger.submit_driver_stage(&caller("d1", UserType::Carrier)?, &lot, driver_input());
        assert!(matches!(
            skipped,
            Err(ProvenanceError::InvalidTransition {
                stage: Stage::Driver,
                expected: StageState::FactorySet,
                actual: StageState::FarmerSet,
            })
        ));

        let receipt =
            ledger.submit_factory_stage(&caller("f1", UserType::Processor)?, &lot, factory_input())?;
        let fruit = ledger.get_fruit(&lot)?;
        assert_eq!(fruit.state, StageState::FactorySet);
        assert_eq!(fruit.stage_stamp(Stage::Factory), Some((receipt.tx_id, receipt.timestamp)));

        let history = ledger.collect_fruit_history(&lot)?;
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp <= history[1].timestamp);
        assert_ne!(history[0].tx_id, history[1].tx_id);
        assert_eq!(ledger.verify_history(&lot)?.entries, 2);
        assert_eq!(ledger.get_user_fruits(&UserId::parse("f1")?)?, vec![lot]);
        Ok(())
    }

    #[test]
    fn stale_read_set_is_a_conflict() -> Result<()> {
        let store = SqliteLedger::open(Path::new(":memory:"))?;
        store.migrate()?;
        let key = LedgerKey::from_raw("fruit:T-001".to_string());

        let ctx = store.begin()?;
        let mut first = WriteSet::new();
        first.record_read(key.clone(), None);
        first.put(key.clone(), b"{}".to_vec());
        store.commit(ctx, first)?;

        let ctx = store.begin()?;
        let mut stale = WriteSet::new();
        stale.record_read(key.clone(), None);
        stale.put(key.clone(), b"{\"x\":1}".to_vec());
        let result = store.commit(ctx, stale);
        assert_eq!(result, Err(ProvenanceError::Conflict { key: key.to_string() }));
        assert_eq!(store.log_entries(&key, None, 10)?.len(), 1);
        Ok(())
    }

    #[test]
    fn commit_log_rejects_updates_and_deletes() -> Result<()> {
        let ledger = migrated_memory_ledger()?;
        seed_lot(&ledger, "T-001")?;
        let conn = ledger.substrate().conn()?;

        let update = conn.execute("UPDATE commit_log SET prev_hash = 'x' WHERE sequence = 1", []);
        assert!(update.is_err());
        let delete = conn.execute("DELETE FROM commit_log", []);
        assert!(delete.is_err());
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let ledger = migrated_memory_ledger()?;
        seed_lot(&ledger, "T-001")?;

        let report = ledger.substrate().integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert!(report.chain_violations.is_empty());
        assert_eq!(report.checked_keys, 4);
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn tampered_commit_log_is_detected() -> Result<()> {
        let ledger = migrated_memory_ledger()?;
        seed_lot(&ledger, "T-001")?;
        {
            let conn = ledger.substrate().conn()?;
            conn.execute_batch("DROP TRIGGER commit_log_no_update;")?;
            let forged = br#"{"traceability_code":"T-001","state":"UNCREATED"}"#.to_vec();
            conn.execute(
                "UPDATE commit_log SET value = ?1
                 WHERE ledger_key = 'fruit:T-001'
                   AND sequence = (SELECT MIN(sequence) FROM commit_log WHERE ledger_key = 'fruit:T-001')",
                params![forged],
            )?;
        }

        let report = ledger.substrate().integrity_check()?;
        assert_eq!(report.chain_violations.len(), 1);
        assert_eq!(report.chain_violations[0].key, "fruit:T-001");

        let verification = ledger.verify_history(&code("T-001")?);
        assert!(matches!(verification, Err(ProvenanceError::Tampered { .. })));
        Ok(())
    }

    #[test]
    fn export_and_import_snapshot_round_trip() -> Result<()> {
        let source = migrated_memory_ledger()?;
        seed_lot(&source, "T-001")?;
        seed_lot(&source, "T-002")?;
        source.tombstone_fruit(&code("T-002")?)?;

        let export_dir = temp_path("export");
        let manifest = source.substrate().export_snapshot(&export_dir)?;
        assert_eq!(manifest.files.len(), 2);
        assert!(export_dir.join(COMMIT_LOG_FILE).exists());
        assert!(export_dir.join(WORLD_STATE_FILE).exists());
        assert!(export_dir.join("manifest.json").exists());

        let target = SqliteLedger::open(Path::new(":memory:"))?;
        let summary = target.import_snapshot(&export_dir)?;
        assert_eq!(summary.imported_keys, 5);
        assert_eq!(summary.live_keys, 4);

        let target = ProvenanceLedger::new(target);
        assert_eq!(target.get_fruit(&code("T-001")?)?, source.get_fruit(&code("T-001")?)?);
        assert_eq!(
            target.collect_fruit_history(&code("T-002")?)?,
            source.collect_fruit_history(&code("T-002")?)?
        );
        assert_eq!(
            target.verify_history(&code("T-001")?)?.head_hash,
            source.verify_history(&code("T-001")?)?.head_hash
        );
        assert!(target.substrate().integrity_check()?.chain_violations.is_empty());

        let again = target.substrate().import_snapshot(&export_dir);
        assert!(again.is_err());

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    #[test]
    fn import_rejects_manifest_digest_mismatch() -> Result<()> {
        use std::io::Write as _;

        let source = migrated_memory_ledger()?;
        seed_lot(&source, "T-001")?;
        let export_dir = temp_path("export");
        source.substrate().export_snapshot(&export_dir)?;

        let log_path = export_dir.join(COMMIT_LOG_FILE);
        let mut tampered = fs::OpenOptions::new().append(true).open(&log_path)?;
        writeln!(tampered, "{{\"tampered\":true}}")?;

        let target = SqliteLedger::open(Path::new(":memory:"))?;
        let Err(err) = target.import_snapshot(&export_dir) else {
            return Err(anyhow!("expected import failure for mismatched manifest digest"));
        };
        assert!(err.to_string().contains("manifest digest mismatch for commit_log.ndjson"));

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    #[test]
    fn forged_stage_history_fails_integrity_check_and_import() -> Result<()> {
        let source = migrated_memory_ledger()?;
        seed_lot(&source, "T-001")?;

        // Well-chained, but claims the shop stage with no stage records.
        let mut forged = Fruit::new(code("T-666")?);
        forged.state = StageState::ShopSet;
        let key = LedgerKey::fruit(&code("T-666")?);
        let store = source.substrate();
        let ctx = store.begin()?;
        let mut write_set = WriteSet::new();
        write_set.record_read(key.clone(), None);
        write_set.put(key.clone(), serde_json::to_vec(&forged)?);
        store.commit(ctx, write_set)?;

        let report = store.integrity_check()?;
        assert_eq!(report.chain_violations.len(), 1);
        assert_eq!(report.chain_violations[0].key, "fruit:T-666");
        assert!(report.chain_violations[0].reason.contains("disagrees with stage records"));

        let export_dir = temp_path("export");
        store.export_snapshot(&export_dir)?;
        let target = SqliteLedger::open(Path::new(":memory:"))?;
        let Err(err) = target.import_snapshot(&export_dir) else {
            return Err(anyhow!("expected import failure for forged stage history"));
        };
        assert!(format!("{err:#}").contains("failed verification for fruit:T-666"));
        let count: i64 =
            target.conn()?.query_row("SELECT COUNT(*) FROM commit_log", [], |row| row.get(0))?;
        assert_eq!(count, 0);

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    #[test]
    fn import_with_manifest_ignores_manifest_on_disk() -> Result<()> {
        let source = migrated_memory_ledger()?;
        seed_lot(&source, "T-001")?;
        let export_dir = temp_path("export");
        source.substrate().export_snapshot(&export_dir)?;
        let manifest_bytes = fs::read(export_dir.join("manifest.json"))?;
        fs::write(export_dir.join("manifest.json"), b"not a manifest")?;

        let target = SqliteLedger::open(Path::new(":memory:"))?;
        let summary = target.import_snapshot_with_manifest(&export_dir, &manifest_bytes)?;
        assert_eq!(summary.imported_keys, 4);

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    #[test]
    fn import_with_manifest_rejects_swapped_snapshot() -> Result<()> {
        let source = migrated_memory_ledger()?;
        seed_lot(&source, "T-001")?;
        let export_dir = temp_path("export");
        source.substrate().export_snapshot(&export_dir)?;
        let verified_manifest = fs::read(export_dir.join("manifest.json"))?;

        // A different, self-consistent snapshot replaces the verified one.
        seed_lot(&source, "T-002")?;
        source.substrate().export_snapshot(&export_dir)?;

        let target = SqliteLedger::open(Path::new(":memory:"))?;
        let Err(err) = target.import_snapshot_with_manifest(&export_dir, &verified_manifest) else {
            return Err(anyhow!("expected import failure for swapped snapshot files"));
        };
        assert!(err.to_string().contains("manifest digest mismatch"));

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let source = migrated_memory_ledger()?;
        seed_lot(&source, "T-001")?;

        let backup_file = temp_path("backup").with_extension("sqlite3");
        source.substrate().backup_database(&backup_file)?;

        let target = SqliteLedger::open(Path::new(":memory:"))?;
        target.restore_database(&backup_file)?;
        let target = ProvenanceLedger::new(target);
        assert_eq!(target.get_fruit(&code("T-001")?)?.state, StageState::FactorySet);
        assert_eq!(target.verify_history(&code("T-001")?)?.entries, 2);

        fs::remove_file(&backup_file).with_context(|| {
            format!("failed to cleanup temp backup file {}", backup_file.display())
        })?;
        Ok(())
    }

    #[test]
    fn concurrent_writers_produce_one_winner_per_stage() -> Result<()> {
        let db_path = temp_path("concurrency").with_extension("sqlite3");
        {
            let init = SqliteLedger::open(&db_path)?;
            init.migrate()?;
            let ledger = ProvenanceLedger::new(init);
            ledger.register_user(UserId::parse("p1")?, UserType::Producer, hash('e'))?;
            for index in 0..4 {
                ledger.register_user(
                    UserId::parse(&format!("f{index}"))?,
                    UserType::Processor,
                    hash('e'),
                )?;
            }
            ledger.submit_farmer_stage(
                &caller("p1", UserType::Producer)?,
                &code("T-001")?,
                farmer_input(),
            )?;
        }

        let writers = 4;
        let barrier = Arc::new(Barrier::new(writers));
        let mut handles = Vec::new();
        for index in 0..writers {
            let path = db_path.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || -> Result<bool> {
                let ledger = ProvenanceLedger::new(SqliteLedger::open(&path)?);
                let who = caller(&format!("f{index}"), UserType::Processor)?;
                barrier.wait();
                match ledger.submit_factory_stage(&who, &code("T-001")?, factory_input()) {
                    Ok(_) => Ok(true),
                    Err(ProvenanceError::Conflict { .. } | ProvenanceError::InvalidTransition { .. }) => {
                        Ok(false)
                    }
                    Err(err) => Err(err.into()),
                }
            }));
        }

        let mut winners = 0;
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            if thread_result? {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let store = SqliteLedger::open(&db_path)?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.chain_violations.is_empty());
        let ledger = ProvenanceLedger::new(store);
        assert_eq!(ledger.collect_fruit_history(&code("T-001")?)?.len(), 2);
        drop(ledger);

        remove_sqlite_files(&db_path)?;
        Ok(())
    }
}
