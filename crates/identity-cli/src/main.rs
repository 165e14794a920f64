use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use identity_api::{IdentifyRequest, IdentityApi, PhoneNumberInput};
use identity_core::ContactId;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "idr")]
#[command(about = "Identity reconciliation CLI")]
struct Cli {
    #[arg(long, env = "IDENTITY_DB", default_value = "./identity.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "IDENTITY_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    busy_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Reconcile one email/phone submission.
    Identify(IdentifyArgs),
    Contact {
        #[command(subcommand)]
        command: ContactCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ContactCommand {
    /// Show the cluster containing a contact.
    Show(ContactShowArgs),
    List,
}

#[derive(Debug, Args)]
struct ContactShowArgs {
    #[arg(long)]
    id: i64,
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

fn init_logging() {
    // stdout carries JSON only.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let api = IdentityApi::new(cli.db).with_busy_timeout(Duration::from_millis(cli.busy_timeout_ms));
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Identify(args) => run_identify(args, &api),
        Command::Contact { command } => run_contact(command, &api),
    }
}

fn run_db(command: DbCommand, api: &IdentityApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let ok = report.quick_check_ok
                && report.foreign_key_violations.is_empty()
                && report.linkage_violations.is_empty();
            let mut value = serde_json::to_value(&report)?;
            if let Value::Object(object) = &mut value {
                object.insert("ok".to_string(), Value::Bool(ok));
            }
            emit_json(value)
        }
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            tracing::info!(out = %args.out.display(), "database backup written");
            emit_json(serde_json::json!({
                "backup_path": args.out.display().to_string(),
                "source_path": api.db_path().display().to_string()
            }))
        }
    }
}

fn run_identify(args: IdentifyArgs, api: &IdentityApi) -> Result<()> {
    let response = api.identify(IdentifyRequest {
        email: args.email,
        phone_number: args.phone.map(PhoneNumberInput::Text),
    })?;
    emit_json(serde_json::to_value(response)?)
}

fn run_contact(command: ContactCommand, api: &IdentityApi) -> Result<()> {
    match command {
        ContactCommand::Show(args) => {
            if args.id <= 0 {
                return Err(anyhow!("contact id must be positive, got {}", args.id));
            }
            let summary = api.contact_show(ContactId(args.id))?;
            emit_json(serde_json::json!({ "contact": summary }))
        }
        ContactCommand::List => {
            let contacts = api.list_contacts()?;
            emit_json(serde_json::json!({
                "count": contacts.len(),
                "contacts": contacts
            }))
        }
    }
}
