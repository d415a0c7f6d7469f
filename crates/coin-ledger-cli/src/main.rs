use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use coin_ledger_api::{AdjustRequest, LedgerSession, StoreConfig};
use coin_ledger_store_sheets::{
    SheetsConfig, DEFAULT_API_BASE, DEFAULT_KEY_FILE, DEFAULT_SECRET_NAME,
};
use coin_ledger_store_sqlite::SqliteLedgerStore;
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_FILTER: &str = "coin_ledger_api=info,coin_ledger_cli=info";

#[derive(Debug, Parser)]
#[command(name = "coin")]
#[command(about = "Club coin ledger CLI")]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct StoreArgs {
    #[arg(long, default_value = "./coin_ledger.sqlite3")]
    db: PathBuf,
    /// Use a spreadsheet as the ledger store instead of `SQLite`.
    #[arg(long)]
    sheet_id: Option<String>,
    /// Worksheet title or A1 range starting at `A1`; defaults to the first
    /// worksheet.
    #[arg(long)]
    range: Option<String>,
    #[arg(long, default_value = DEFAULT_SECRET_NAME)]
    secret_name: String,
    #[arg(long, default_value = DEFAULT_KEY_FILE)]
    key_file: PathBuf,
    #[arg(long, default_value = DEFAULT_API_BASE, hide = true)]
    sheets_api_base: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Member {
        #[command(subcommand)]
        command: Box<MemberCommand>,
    },
    Leaderboard,
    Adjust(AdjustArgs),
    Redeem(NameArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
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
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum MemberCommand {
    List,
    Show(NameArgs),
}

#[derive(Debug, Args)]
struct NameArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct AdjustArgs {
    #[arg(long)]
    name: String,
    #[arg(long, allow_negative_numbers = true)]
    delta: i64,
    #[arg(long)]
    reason: String,
}

impl StoreArgs {
    fn store_config(&self) -> StoreConfig {
        match &self.sheet_id {
            Some(spreadsheet_id) => StoreConfig::Sheets {
                sheets: SheetsConfig {
                    api_base: self.sheets_api_base.clone(),
                    spreadsheet_id: spreadsheet_id.clone(),
                    range: self.range.clone(),
                },
                secret_name: self.secret_name.clone(),
                key_file: self.key_file.clone(),
            },
            None => StoreConfig::Sqlite { db_path: self.db.clone() },
        }
    }

    fn sqlite_path(&self) -> Result<&Path> {
        if self.sheet_id.is_some() {
            return Err(anyhow!("db commands operate on the SQLite store; drop --sheet-id"));
        }
        Ok(&self.db)
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteLedgerStore::open(cli.store.sqlite_path()?)?;
            run_db(*command, &mut store)
        }
        Command::Member { command } => {
            let session = open_session(&cli.store)?;
            run_member(*command, &session)
        }
        Command::Leaderboard => {
            let session = open_session(&cli.store)?;
            emit_json(serde_json::to_value(session.leaderboard())?)
        }
        Command::Adjust(args) => {
            let mut session = open_session(&cli.store)?;
            run_adjust(args, &mut session)
        }
        Command::Redeem(args) => {
            let mut session = open_session(&cli.store)?;
            let result = session
                .redeem(&args.name)
                .with_context(|| format!("redemption for {} failed", args.name))?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}

fn open_session(store: &StoreArgs) -> Result<LedgerSession> {
    let config = store.store_config();
    config
        .open_session()
        .with_context(|| format!("failed to open ledger store {}", config.describe()))
}

fn run_db(command: DbCommand, store: &mut SqliteLedgerStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => {
            let digest = store.export_table(&args.out)?;
            emit_json(serde_json::to_value(digest)?)
        }
        DbCommand::Import(args) => {
            let digest = store.import_table(&args.input)?;
            tracing::info!(rows = digest.rows, path = %digest.path, "imported ledger table");
            emit_json(serde_json::to_value(digest)?)
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(report)?)
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteLedgerStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_member(command: MemberCommand, session: &LedgerSession) -> Result<()> {
    match command {
        MemberCommand::List => {
            let roster = session.roster();
            emit_json(serde_json::json!({
                "snapshot_digest": roster.snapshot_digest,
                "members": roster.members,
                "status_corrections": session.status_corrections()
            }))
        }
        MemberCommand::Show(args) => {
            let view = session.member(&args.name)?;
            emit_json(serde_json::to_value(view)?)
        }
    }
}

fn run_adjust(args: AdjustArgs, session: &mut LedgerSession) -> Result<()> {
    let name = args.name.clone();
    let result = session
        .adjust(AdjustRequest { name: args.name, delta: args.delta, reason: args.reason })
        .with_context(|| format!("adjustment for {name} failed"))?;
    emit_json(serde_json::to_value(result)?)
}
