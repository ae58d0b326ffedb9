use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use croptrace_api::{
    CropTraceApi, HarvestSubmission, LabSubmission, ManufacturingSubmission,
};
use croptrace_core::{HtmlRenderer, TrackingCode};
use croptrace_store_sqlite::SqliteStore;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ct")]
#[command(about = "CropTrace CLI")]
struct Cli {
    #[arg(long, default_value = "./croptrace.sqlite3")]
    db: PathBuf,

    /// Base URL embedded in verification links.
    #[arg(long, default_value = "https://trace.example.org")]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Harvest {
        #[command(subcommand)]
        command: HarvestCommand,
    },
    Manufacturing {
        #[command(subcommand)]
        command: ManufacturingCommand,
    },
    Lab {
        #[command(subcommand)]
        command: LabCommand,
    },
    Track {
        #[command(subcommand)]
        command: TrackCommand,
    },
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum HarvestCommand {
    Add(HarvestAddArgs),
}

#[derive(Debug, Args)]
struct HarvestAddArgs {
    #[arg(long)]
    harvest_id: String,
    #[arg(long)]
    species: String,
    #[arg(long)]
    weight_kg: f64,
    #[arg(long)]
    season: String,
    #[arg(long)]
    location: String,
    #[arg(long)]
    farmer: String,
    #[arg(long)]
    proof_uri: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ManufacturingCommand {
    Add(ManufacturingAddArgs),
}

#[derive(Debug, Args)]
struct ManufacturingAddArgs {
    #[arg(long)]
    harvest_id: String,
    #[arg(long)]
    manufacturer: String,
    #[arg(long)]
    batch_id: String,
    #[arg(long)]
    product_name: Option<String>,
    #[arg(long)]
    process_description: Option<String>,
    #[arg(long)]
    location: Option<String>,
    /// Extra stage metadata as key=value pairs.
    #[arg(long = "meta")]
    metadata: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum LabCommand {
    Add(LabAddArgs),
}

#[derive(Debug, Args)]
struct LabAddArgs {
    #[arg(long)]
    harvest_id: String,
    #[arg(long)]
    lab: String,
    #[arg(long)]
    test_type: String,
    #[arg(long)]
    result: String,
    #[arg(long)]
    report_uri: Option<String>,
    /// Extra stage metadata as key=value pairs.
    #[arg(long = "meta")]
    metadata: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum TrackCommand {
    Show(TrackShowArgs),
    Promote(TrackPromoteArgs),
    Regenerate(TrackRegenerateArgs),
}

#[derive(Debug, Args)]
struct TrackShowArgs {
    #[arg(long, conflicts_with = "harvest_id")]
    code: Option<String>,
    #[arg(long)]
    harvest_id: Option<String>,
    #[arg(long, default_value_t = false)]
    require_public: bool,
}

#[derive(Debug, Args)]
struct TrackPromoteArgs {
    #[arg(long)]
    code: String,
}

#[derive(Debug, Args)]
struct TrackRegenerateArgs {
    #[arg(long)]
    harvest_id: String,
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    Snapshot(ReportSnapshotArgs),
    Generate(ReportGenerateArgs),
}

#[derive(Debug, Args)]
struct ReportSnapshotArgs {
    #[arg(long)]
    code: String,
}

#[derive(Debug, Args)]
struct ReportGenerateArgs {
    #[arg(long)]
    code: String,
    /// Write the rendered document here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
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
        other => other,
    }
}

fn print_payload<T>(payload: &T) -> Result<()>
where
    T: serde::Serialize,
{
    let value = serde_json::to_value(payload).context("failed to serialize payload")?;
    let output = serde_json::to_string_pretty(&with_contract_version(value))
        .context("failed to render payload")?;
    println!("{output}");
    Ok(())
}

fn parse_metadata(pairs: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut metadata = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("metadata entries MUST be key=value, got: {pair}"))?;
        metadata.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(metadata)
}

fn parse_code(raw: &str) -> Result<TrackingCode> {
    TrackingCode::parse(raw).ok_or_else(|| anyhow!("malformed tracking code: {raw}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = CropTraceApi::new(cli.db.clone(), cli.base_url.clone());

    match cli.command {
        Command::Db { command } => match command {
            DbCommand::SchemaVersion => {
                let status = api.schema_status()?;
                print_payload(&status)
            }
            DbCommand::Migrate(args) => {
                let result = api.migrate(args.dry_run)?;
                print_payload(&result)
            }
            DbCommand::IntegrityCheck => {
                let store = SqliteStore::open(&cli.db)?;
                let report = store.integrity_check()?;
                print_payload(&report)
            }
        },
        Command::Harvest { command } => match command {
            HarvestCommand::Add(args) => {
                let tracker = api.record_harvest(HarvestSubmission {
                    harvest_id: args.harvest_id,
                    species: args.species,
                    weight_kg: args.weight_kg,
                    season: args.season,
                    location: args.location,
                    farmer: args.farmer,
                    proof_uri: args.proof_uri,
                })?;
                print_payload(&tracker)
            }
        },
        Command::Manufacturing { command } => match command {
            ManufacturingCommand::Add(args) => {
                let (_, tracker) = api.record_manufacturing(ManufacturingSubmission {
                    harvest_id: args.harvest_id,
                    manufacturer: args.manufacturer,
                    batch_id: args.batch_id,
                    product_name: args.product_name,
                    process_description: args.process_description,
                    location: args.location,
                    started_at: None,
                    completed_at: None,
                    metadata: parse_metadata(&args.metadata)?,
                })?;
                print_payload(&tracker)
            }
        },
        Command::Lab { command } => match command {
            LabCommand::Add(args) => {
                let (_, tracker) = api.record_lab(LabSubmission {
                    harvest_id: args.harvest_id,
                    lab: args.lab,
                    test_type: args.test_type,
                    result: args.result,
                    report_uri: args.report_uri,
                    tested_at: None,
                    metadata: parse_metadata(&args.metadata)?,
                })?;
                print_payload(&tracker)
            }
        },
        Command::Track { command } => match command {
            TrackCommand::Show(args) => {
                let record = match (args.code, args.harvest_id) {
                    (Some(code), _) => api.lookup_by_code(&parse_code(&code)?, args.require_public)?,
                    (None, Some(harvest_id)) => {
                        api.lookup_by_harvest(&harvest_id, args.require_public)?
                    }
                    (None, None) => {
                        return Err(anyhow!("either --code or --harvest-id MUST be provided"));
                    }
                };
                print_payload(&record)
            }
            TrackCommand::Promote(args) => {
                let record = api.promote_to_public(&parse_code(&args.code)?)?;
                print_payload(&record)
            }
            TrackCommand::Regenerate(args) => {
                let record = api.regenerate(&args.harvest_id)?;
                print_payload(&record)
            }
        },
        Command::Report { command } => match command {
            ReportCommand::Snapshot(args) => {
                let snapshot = api.build_snapshot(&parse_code(&args.code)?)?;
                print_payload(&snapshot)
            }
            ReportCommand::Generate(args) => {
                let document = api.generate_document(&parse_code(&args.code)?, &HtmlRenderer)?;
                match args.out {
                    Some(out) => {
                        fs::write(&out, &document).with_context(|| {
                            format!("failed to write document to {}", out.display())
                        })?;
                        print_payload(&serde_json::json!({
                            "written": out.display().to_string(),
                            "bytes": document.len(),
                        }))
                    }
                    None => {
                        println!("{}", String::from_utf8_lossy(&document));
                        Ok(())
                    }
                }
            }
        },
    }
}
