use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use audit_trail_core::{
    verify_chain, AuditError, AuditFields, EngineConfig, Filter, Patch, Record, RowId, Timestamp,
    Value as ColumnValue, VersioningEngine, WritePipeline,
};
use audit_trail_store_sqlite::SqliteHost;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const ENTRIES_TABLE: &str = "entries";

#[derive(Debug, Parser)]
#[command(name = "audit-trail")]
#[command(about = "Versioned entries over an append-only audit trail")]
struct Cli {
    #[arg(long, default_value = "./audit_trail.sqlite3")]
    db: PathBuf,

    /// JSON engine config (`parent_link`, `require_actor`, `savepoint_prefix`).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the `entries` table and its current-row unique index.
    Init,
    Create(CreateArgs),
    Update(UpdateArgs),
    Delete(DeleteArgs),
    Show(IdArgs),
    History(KeyArgs),
    Verify(KeyArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(long)]
    key: String,
    #[arg(long)]
    body: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    body: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
struct IdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct KeyArgs {
    #[arg(long)]
    key: String,
}

#[derive(Debug, Clone, Default)]
struct Entry {
    audit: AuditFields,
    key: String,
    body: String,
}

impl Record for Entry {
    fn table(&self) -> &str {
        ENTRIES_TABLE
    }

    fn values(&self) -> Patch {
        Patch::new().set("key", self.key.clone()).set("body", self.body.clone())
    }

    fn assign(&mut self, column: &str, value: &ColumnValue) -> Result<(), AuditError> {
        let text = value.as_str().ok_or_else(|| {
            AuditError::Validation(format!("entries.{column} expects text, got {}", value.type_name()))
        })?;
        match column {
            "key" => self.key = text.to_string(),
            "body" => self.body = text.to_string(),
            _ => return Err(AuditError::Validation(format!("unknown entries column {column}"))),
        }
        Ok(())
    }

    fn audit_fields(&self) -> Option<&AuditFields> {
        Some(&self.audit)
    }

    fn audit_fields_mut(&mut self) -> Option<&mut AuditFields> {
        Some(&mut self.audit)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    contract_version: &'static str,
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

type Pipeline = WritePipeline<SqliteHost>;

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert("contract_version".to_string(), Value::String(CLI_CONTRACT_VERSION.to_string()));
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

fn emit_error(err: &anyhow::Error) {
    let kind = err.downcast_ref::<AuditError>().map_or("internal", |audit| audit.kind().as_str());
    let body = ErrorBody {
        contract_version: CLI_CONTRACT_VERSION,
        error: ErrorDetail { kind, message: format!("{err:#}") },
    };
    match serde_json::to_string_pretty(&body) {
        Ok(rendered) => eprintln!("{rendered}"),
        Err(_) => eprintln!("error: {err:#}"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            emit_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let host = SqliteHost::open(&cli.db)?;
    match cli.command {
        Command::Init => run_init(&host),
        Command::IntegrityCheck => run_integrity_check(&host),
        Command::Create(args) => run_create(&args, &mut open_pipeline(host, cli.config)?),
        Command::Update(args) => run_update(&args, &mut open_pipeline(host, cli.config)?),
        Command::Delete(args) => run_delete(&args, &mut open_pipeline(host, cli.config)?),
        Command::Show(args) => run_show(&args, &open_pipeline(host, cli.config)?),
        Command::History(args) => run_history(&args, &open_pipeline(host, cli.config)?),
        Command::Verify(args) => run_verify(&args, &open_pipeline(host, cli.config)?),
    }
}

fn open_pipeline(host: SqliteHost, config_path: Option<PathBuf>) -> Result<Pipeline> {
    if !host.table_exists(ENTRIES_TABLE)? {
        return Err(anyhow!("table {ENTRIES_TABLE} does not exist; run `audit-trail init` first"));
    }
    let config = match config_path {
        Some(path) => EngineConfig::from_json_file(&path)?,
        None => EngineConfig::default(),
    };
    let engine = VersioningEngine::new(config)?;
    Ok(WritePipeline::new(host).with_callbacks(Arc::new(engine)))
}

fn run_init(host: &SqliteHost) -> Result<()> {
    let existed = host.table_exists(ENTRIES_TABLE)?;
    host.ensure_versioned_table(
        ENTRIES_TABLE,
        &[("key", "TEXT NOT NULL"), ("body", "TEXT NOT NULL")],
        &["key"],
    )?;
    emit_json(serde_json::json!({
        "table": ENTRIES_TABLE,
        "created": !existed
    }))
}

fn run_integrity_check(host: &SqliteHost) -> Result<()> {
    let report = host.integrity_check()?;
    emit_json(serde_json::to_value(report)?)
}

fn run_create(args: &CreateArgs, pipeline: &mut Pipeline) -> Result<()> {
    let mut entry = Entry {
        audit: AuditFields::new(args.actor.clone()),
        key: args.key.clone(),
        body: args.body.clone(),
    };
    pipeline.create(&mut entry)?;
    emit_json(serde_json::json!({ "entry": entry_json(&entry)? }))
}

fn run_update(args: &UpdateArgs, pipeline: &mut Pipeline) -> Result<()> {
    let mut entry = load_entry(pipeline, args.id)?;
    entry.audit.last_changed_user.clone_from(&args.actor);
    let outcome = pipeline.update(&mut entry, &Patch::new().set("body", args.body.clone()))?;
    emit_json(serde_json::json!({
        "outcome": outcome,
        "entry": entry_json(&entry)?
    }))
}

fn run_delete(args: &DeleteArgs, pipeline: &mut Pipeline) -> Result<()> {
    let mut entry = load_entry(pipeline, args.id)?;
    entry.audit.last_changed_user.clone_from(&args.actor);
    let outcome = pipeline.delete(&mut entry)?;
    emit_json(serde_json::json!({
        "outcome": outcome,
        "entry": entry_json(&entry)?
    }))
}

fn run_show(args: &IdArgs, pipeline: &Pipeline) -> Result<()> {
    let entry = load_entry(pipeline, args.id)?;
    emit_json(serde_json::json!({ "entry": entry_json(&entry)? }))
}

fn run_history(args: &KeyArgs, pipeline: &Pipeline) -> Result<()> {
    let versions = pipeline.host().versions(ENTRIES_TABLE, &Filter::new().eq("key", args.key.clone()))?;
    let mut entries = Vec::with_capacity(versions.len());
    for version in &versions {
        entries.push(entry_json(&load_entry(pipeline, version.id.0)?)?);
    }
    emit_json(serde_json::json!({
        "key": args.key,
        "versions": entries
    }))
}

fn run_verify(args: &KeyArgs, pipeline: &Pipeline) -> Result<()> {
    let versions = pipeline.host().versions(ENTRIES_TABLE, &Filter::new().eq("key", args.key.clone()))?;
    if versions.is_empty() {
        return Err(anyhow!("no versions stored for key {}", args.key));
    }
    let report = verify_chain(&versions);
    emit_json(serde_json::json!({
        "key": args.key,
        "valid": report.is_valid(),
        "report": report
    }))
}

fn load_entry(pipeline: &Pipeline, id: i64) -> Result<Entry> {
    let mut entry = Entry::default();
    entry.audit.id = Some(RowId(id));
    pipeline
        .reload(&mut entry)
        .with_context(|| format!("failed to load {ENTRIES_TABLE} row {id}"))?;
    Ok(entry)
}

fn rfc3339(value: Option<Timestamp>) -> Result<Value> {
    match value {
        Some(at) => Ok(Value::String(at.to_rfc3339()?)),
        None => Ok(Value::Null),
    }
}

fn entry_json(entry: &Entry) -> Result<Value> {
    Ok(serde_json::json!({
        "id": entry.audit.id,
        "key": entry.key,
        "body": entry.body,
        "parent_version_id": entry.audit.parent_version_id,
        "current": entry.audit.is_current(),
        "created_at": rfc3339(entry.audit.created_at)?,
        "updated_at": rfc3339(entry.audit.updated_at)?,
        "deleted_at": rfc3339(entry.audit.deleted_at.closed_at())?,
        "last_changed_user": entry.audit.last_changed_user
    }))
}
