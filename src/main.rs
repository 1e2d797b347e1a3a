use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

use roster_reconcile::{
    insert_staging_batch, upsert_employees, verify_count, AssignmentResolver, ApplyRules,
    ApplyScope, EmployeeRecord, EngineConfig, Feed, ReconcileService, Row, SqliteStore,
    StaticSource,
};

/// Roster reconciliation: stage, preview and gate directory updates
#[derive(Parser, Debug)]
#[command(name = "roster-reconcile", version, subcommand_required = true, arg_required_else_help = true)]
struct Cli {
    /// SQLite directory database
    #[arg(long, global = true, value_name = "FILE", default_value = "roster.db")]
    db: PathBuf,

    /// Engine configuration (TOML); built-in defaults otherwise
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database, optionally seeding employees from a JSON array
    Init {
        #[arg(long, value_name = "FILE")]
        seed: Option<PathBuf>,
    },
    /// Store a JSON array of staged rows as a new batch
    Stage { rows: PathBuf },
    /// Diff a staged batch against the directory
    Preview {
        batch: String,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Preview a staged batch and apply it if the gate allows
    Apply(ApplyArgs),
    /// Canonicalize a vendor / employer name
    Canonicalize { name: String },
    /// Resolve the current assignment for one employee from JSON feeds
    Resolve {
        code: String,
        #[arg(long, value_name = "FILE")]
        feeds: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ApplyArgs {
    batch: String,

    #[arg(long)]
    allow_fallback: bool,
    #[arg(long)]
    ack_deactivations: bool,
    #[arg(long)]
    ack_terminations: bool,
    #[arg(long)]
    ack_wage_decreases: bool,
    #[arg(long)]
    ack_mapping: bool,

    #[arg(long)]
    skip_deactivations: bool,
    #[arg(long)]
    skip_terminations: bool,
    #[arg(long)]
    skip_reactivations: bool,
    #[arg(long)]
    skip_updates: bool,
}

impl ApplyArgs {
    fn rules(&self) -> ApplyRules {
        ApplyRules {
            allow_fallback_match: self.allow_fallback,
            ack_deactivations: self.ack_deactivations,
            ack_terminations: self.ack_terminations,
            ack_wage_decreases: self.ack_wage_decreases,
            ack_mapping: self.ack_mapping,
        }
    }

    fn scope(&self) -> ApplyScope {
        ApplyScope {
            deactivations: !self.skip_deactivations,
            terminations: !self.skip_terminations,
            reactivations: !self.skip_reactivations,
            other_updates: !self.skip_updates,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    match &cli.command {
        Command::Init { seed } => run_init(&cli.db, seed.as_deref()),
        Command::Stage { rows } => run_stage(&cli.db, rows),
        Command::Preview { batch, json } => run_preview(&cli.db, &config, batch, *json),
        Command::Apply(args) => run_apply(&cli.db, &config, args),
        Command::Canonicalize { name } => {
            let canonicalizer = config.build_canonicalizer()?;
            println!("{}", canonicalizer.normalize(name));
            Ok(())
        }
        Command::Resolve { code, feeds } => run_resolve(code, feeds),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse JSON in {:?}", path))
}

fn open_service(db: &Path, config: &EngineConfig) -> Result<ReconcileService<SqliteStore>> {
    if !db.exists() {
        bail!("Database {:?} not found. Run `roster-reconcile init` first.", db);
    }
    let store = SqliteStore::open(db)?;
    Ok(ReconcileService::new(store, config)?)
}

fn run_init(db: &Path, seed: Option<&Path>) -> Result<()> {
    let store = SqliteStore::open(db)?;
    println!("✓ Database initialized with WAL mode: {:?}", db);

    if let Some(seed) = seed {
        let employees: Vec<EmployeeRecord> = read_json(seed)?;
        let written = upsert_employees(store.connection(), &employees)?;
        println!("✓ Seeded {} employees", written);
    }

    println!("✓ Directory contains {} employees", verify_count(store.connection())?);
    Ok(())
}

fn run_stage(db: &Path, rows_path: &Path) -> Result<()> {
    let rows: Vec<Row> = read_json(rows_path)?;
    let store = SqliteStore::open(db)?;
    let batch_id = insert_staging_batch(store.connection(), &rows)?;

    tracing::info!(batch = %batch_id, rows = rows.len(), "batch staged");
    println!("{}", batch_id);
    Ok(())
}

fn run_preview(db: &Path, config: &EngineConfig, batch: &str, json: bool) -> Result<()> {
    let service = open_service(db, config)?;
    let report = service.preview_batch(batch)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("🔍 {}", report.summary());
    for change in &report.changes {
        let fields: Vec<&str> = change.field_diffs.iter().map(|d| d.field.column()).collect();
        println!(
            "  #{:<4} {:<12} {:<12} {}{}",
            change.row_index,
            change.key,
            format!("{:?}", change.reason).to_lowercase(),
            fields.join(", "),
            if change.wage_decrease { "  ⚠️ wage decrease" } else { "" }
        );
    }
    if !report.anomalies.duplicate_codes.is_empty() {
        println!("⚠️  Duplicate codes: {}", report.anomalies.duplicate_codes.join(", "));
    }
    if !report.anomalies.fallback_keys.is_empty() {
        println!("⚠️  Matched by fallback id: {}", report.anomalies.fallback_keys.join(", "));
    }
    if !report.anomalies.unmatched_keys.is_empty() {
        println!("•  Unmatched: {}", report.anomalies.unmatched_keys.join(", "));
    }
    for error in &report.anomalies.row_errors {
        println!("❌ Row {}: {}", error.row_index, error.message);
    }
    println!("digest {}", report.digest);
    Ok(())
}

fn run_apply(db: &Path, config: &EngineConfig, args: &ApplyArgs) -> Result<()> {
    let service = open_service(db, config)?;
    let preview = service.preview_batch(&args.batch)?;
    println!("🔍 {}", preview.summary());

    let report = service.apply(&args.rules(), &args.scope())?;
    if !report.allowed {
        bail!(
            "Apply blocked: {}",
            report.reason.unwrap_or_else(|| "unknown reason".to_string())
        );
    }

    println!(
        "✅ Applied {} of {} rows ({} out of scope, {} failed)",
        report.written, report.attempted, report.skipped_out_of_scope, report.failed
    );
    for failure in &report.failures {
        println!("❌ {} (row {}): {}", failure.key, failure.row_index, failure.message);
    }
    Ok(())
}

fn run_resolve(code: &str, feeds_path: &Path) -> Result<()> {
    let feeds: Vec<Feed> = read_json(feeds_path)?;
    let resolver = AssignmentResolver::new()
        .with_layer(Box::new(StaticSource::new("feeds", feeds)), None);

    match resolver.resolve_assignment(code) {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("null"),
    }
    Ok(())
}
