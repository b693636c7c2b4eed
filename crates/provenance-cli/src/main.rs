use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hmac::{Hmac, Mac};
use provenance_api::{
    ProvenanceApi, RegisterUserRequest, SubmitStageRequest, API_CONTRACT_VERSION,
};
use provenance_core::{
    Caller, DriverInput, FactoryInput, FarmerInput, ShopInput, TraceabilityCode, UserId, UserType,
};
use provenance_store_sqlite::LedgerOptions;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_SIG_FILE: &str = "manifest.sig";
const SIGNATURE_ALGORITHM: &str = "hmac-sha256";
const DEFAULT_LOG_FILTER: &str =
    "warn,provenance_core=info,provenance_store_sqlite=info,provenance_api=info,provenance_cli=info";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Parser)]
#[command(name = "pv")]
#[command(about = "Fruit provenance ledger CLI")]
struct Cli {
    #[arg(long, env = "PROVENANCE_DB", default_value = "./provenance.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "PROVENANCE_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    busy_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Stage {
        #[command(subcommand)]
        command: Box<StageCommand>,
    },
    Fruit {
        #[command(subcommand)]
        command: Box<FruitCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    signing_key_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long)]
    verify_key_file: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    allow_unsigned: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Register(UserRegisterArgs),
    Show(UserLookupArgs),
    Fruits(UserLookupArgs),
}

#[derive(Debug, Args)]
struct UserRegisterArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    user_type: UserTypeArg,
    #[arg(long)]
    real_info_hash: String,
}

#[derive(Debug, Args)]
struct UserLookupArgs {
    #[arg(long)]
    user_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum UserTypeArg {
    Producer,
    Processor,
    Carrier,
    Retailer,
    Consumer,
}

impl From<UserTypeArg> for UserType {
    fn from(value: UserTypeArg) -> Self {
        match value {
            UserTypeArg::Producer => Self::Producer,
            UserTypeArg::Processor => Self::Processor,
            UserTypeArg::Carrier => Self::Carrier,
            UserTypeArg::Retailer => Self::Retailer,
            UserTypeArg::Consumer => Self::Consumer,
        }
    }
}

/// Identity of the participant submitting a stage.
#[derive(Debug, Args)]
struct CallerArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    user_type: UserTypeArg,
    #[arg(long)]
    code: String,
}

#[derive(Debug, Subcommand)]
enum StageCommand {
    Farmer(FarmerArgs),
    Factory(FactoryArgs),
    Driver(DriverArgs),
    Shop(ShopArgs),
}

#[derive(Debug, Args)]
struct FarmerArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    fruit_name: String,
    #[arg(long)]
    origin: String,
    #[arg(long)]
    plant_time: String,
    #[arg(long)]
    picking_time: String,
    #[arg(long)]
    farmer_name: String,
    #[arg(long)]
    img_hash: String,
}

#[derive(Debug, Args)]
struct FactoryArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    product_name: String,
    #[arg(long)]
    production_batch: String,
    #[arg(long)]
    production_time: String,
    #[arg(long)]
    factory_name: String,
    #[arg(long)]
    contact_number: String,
    #[arg(long)]
    img_hash: String,
}

#[derive(Debug, Args)]
struct DriverArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    name: String,
    #[arg(long)]
    age: String,
    #[arg(long)]
    phone: String,
    #[arg(long)]
    car_number: String,
    #[arg(long)]
    transport: String,
    #[arg(long)]
    img_hash: String,
}

#[derive(Debug, Args)]
struct ShopArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    store_time: String,
    #[arg(long)]
    sell_time: String,
    #[arg(long)]
    shop_name: String,
    #[arg(long)]
    shop_address: String,
    #[arg(long)]
    shop_phone: String,
    #[arg(long)]
    img_hash: String,
}

#[derive(Debug, Subcommand)]
enum FruitCommand {
    Show(FruitLookupArgs),
    History(FruitLookupArgs),
    Verify(FruitLookupArgs),
    Tombstone(FruitLookupArgs),
}

#[derive(Debug, Args)]
struct FruitLookupArgs {
    #[arg(long)]
    code: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = ProvenanceApi::with_options(
        cli.db.clone(),
        LedgerOptions { busy_timeout_ms: cli.busy_timeout_ms },
    );
    debug!(db = %cli.db.display(), "opening ledger");
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::User { command } => run_user(*command, &api),
        Command::Stage { command } => run_stage(*command, &api),
        Command::Fruit { command } => run_fruit(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &ProvenanceApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::Export(args) => run_db_export(&args, api),
        DbCommand::Import(args) => run_db_import(&args, api),
        DbCommand::Backup(args) => {
            api.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            api.restore_database(&args.input)?;
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

fn run_db_export(args: &DbExportArgs, api: &ProvenanceApi) -> Result<()> {
    let manifest = api.export_snapshot(&args.out)?;
    let signature_path = args.out.join(MANIFEST_SIG_FILE);

    let signature_algorithm = if let Some(key_path) = args.signing_key_file.as_ref() {
        let signing_key = read_hex_key_file(key_path)?;
        let manifest_path = args.out.join(MANIFEST_FILE);
        let manifest_bytes = fs::read(&manifest_path)
            .with_context(|| format!("failed to read manifest file {}", manifest_path.display()))?;
        write_manifest_signature(&args.out, &manifest_bytes, &signing_key)?;
        Some(SIGNATURE_ALGORITHM)
    } else {
        if signature_path.exists() {
            fs::remove_file(&signature_path).with_context(|| {
                format!("failed to remove stale signature {}", signature_path.display())
            })?;
        }
        None
    };

    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest,
        "signature_algorithm": signature_algorithm
    }))
}

fn run_db_import(args: &DbImportArgs, api: &ProvenanceApi) -> Result<()> {
    let verify_key =
        args.verify_key_file.as_ref().map(|path| read_hex_key_file(path)).transpose()?;

    let manifest_path = args.input.join(MANIFEST_FILE);
    let manifest_bytes = fs::read(&manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;
    let signature_path = args.input.join(MANIFEST_SIG_FILE);
    let signed = signature_path.exists();
    if signed {
        let key = verify_key.as_ref().ok_or_else(|| {
            anyhow!(
                "snapshot is signed; provide --verify-key-file to verify {}",
                signature_path.display()
            )
        })?;
        verify_manifest_signature(&args.input, &manifest_bytes, key)?;
    } else if !args.allow_unsigned {
        return Err(anyhow!(
            "snapshot is unsigned; rerun with --allow-unsigned for explicit override"
        ));
    }

    let summary = api.import_snapshot_with_manifest(&args.input, &manifest_bytes)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "signature_verified": signed,
        "summary": summary
    }))
}

fn run_user(command: UserCommand, api: &ProvenanceApi) -> Result<()> {
    match command {
        UserCommand::Register(args) => {
            let user = api.register_user(RegisterUserRequest {
                user_id: UserId::parse(&args.user_id)?,
                user_type: args.user_type.into(),
                real_info_hash: args.real_info_hash,
            })?;
            emit(&user)
        }
        UserCommand::Show(args) => emit(&api.get_user(&UserId::parse(&args.user_id)?)?),
        UserCommand::Fruits(args) => emit(&api.get_user_fruits(&UserId::parse(&args.user_id)?)?),
    }
}

fn stage_request<T>(caller: &CallerArgs, input: T) -> Result<SubmitStageRequest<T>> {
    Ok(SubmitStageRequest {
        caller: Caller::new(UserId::parse(&caller.user_id)?, caller.user_type.into()),
        traceability_code: TraceabilityCode::parse(&caller.code)?,
        input,
    })
}

fn run_stage(command: StageCommand, api: &ProvenanceApi) -> Result<()> {
    let receipt = match command {
        StageCommand::Farmer(args) => api.submit_farmer_stage(stage_request(
            &args.caller,
            FarmerInput {
                fruit_name: args.fruit_name,
                origin: args.origin,
                plant_time: args.plant_time,
                picking_time: args.picking_time,
                farmer_name: args.farmer_name,
                img_hash: args.img_hash,
            },
        )?)?,
        StageCommand::Factory(args) => api.submit_factory_stage(stage_request(
            &args.caller,
            FactoryInput {
                product_name: args.product_name,
                production_batch: args.production_batch,
                production_time: args.production_time,
                factory_name: args.factory_name,
                contact_number: args.contact_number,
                img_hash: args.img_hash,
            },
        )?)?,
        StageCommand::Driver(args) => api.submit_driver_stage(stage_request(
            &args.caller,
            DriverInput {
                name: args.name,
                age: args.age,
                phone: args.phone,
                car_number: args.car_number,
                transport: args.transport,
                img_hash: args.img_hash,
            },
        )?)?,
        StageCommand::Shop(args) => api.submit_shop_stage(stage_request(
            &args.caller,
            ShopInput {
                store_time: args.store_time,
                sell_time: args.sell_time,
                shop_name: args.shop_name,
                shop_address: args.shop_address,
                shop_phone: args.shop_phone,
                img_hash: args.img_hash,
            },
        )?)?,
    };
    emit(&receipt)
}

fn run_fruit(command: FruitCommand, api: &ProvenanceApi) -> Result<()> {
    match command {
        FruitCommand::Show(args) => emit(&api.get_fruit(&TraceabilityCode::parse(&args.code)?)?),
        FruitCommand::History(args) => {
            emit(&api.get_fruit_history(&TraceabilityCode::parse(&args.code)?)?)
        }
        FruitCommand::Verify(args) => {
            emit(&api.verify_history(&TraceabilityCode::parse(&args.code)?)?)
        }
        FruitCommand::Tombstone(args) => {
            emit(&api.tombstone_fruit(&TraceabilityCode::parse(&args.code)?)?)
        }
    }
}

fn read_hex_key_file(path: &Path) -> Result<[u8; 32]> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let bytes = hex::decode(body.trim())
        .with_context(|| format!("key file must contain hex bytes: {}", path.display()))?;
    if bytes.len() != 32 {
        return Err(anyhow!(
            "key file {} must decode to exactly 32 bytes (got {})",
            path.display(),
            bytes.len()
        ));
    }

    let mut key = [0_u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn write_manifest_signature(out_dir: &Path, manifest_bytes: &[u8], key: &[u8; 32]) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| anyhow!("failed to initialize signature key: {err}"))?;
    mac.update(manifest_bytes);
    let signature_hex = hex::encode(mac.finalize().into_bytes());
    let signature_path = out_dir.join(MANIFEST_SIG_FILE);
    fs::write(&signature_path, signature_hex)
        .with_context(|| format!("failed to write manifest signature {}", signature_path.display()))
}

fn verify_manifest_signature(in_dir: &Path, manifest_bytes: &[u8], key: &[u8; 32]) -> Result<()> {
    let signature_path = in_dir.join(MANIFEST_SIG_FILE);
    let signature_body = fs::read_to_string(&signature_path).with_context(|| {
        format!("failed to read manifest signature file {}", signature_path.display())
    })?;
    let signature = hex::decode(signature_body.trim()).with_context(|| {
        format!("manifest signature file is not valid hex: {}", signature_path.display())
    })?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| anyhow!("failed to initialize signature verification key: {err}"))?;
    mac.update(manifest_bytes);
    mac.verify_slice(&signature).map_err(|_| {
        anyhow!("manifest signature verification failed for {}", signature_path.display())
    })
}
