use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use scd_merge::config::{parse_as_of, MergeConfig};
use scd_merge::query;
use scd_merge::temporal::format_ts;
use scd_merge::{
    load_csv, Attributes, DimensionRow, DimensionSpec, DimensionStore, EntityId,
    MergeOrchestrator, RunReport, SqliteStore, StagingArea,
};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "scd-merge",
    about = "Slowly-changing-dimension (type 2) merge engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML config file
    #[arg(short, long, global = true, env = "SCD_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database (overrides config)
    #[arg(long, global = true, env = "SCD_DATABASE")]
    database: Option<PathBuf>,

    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Create dimension and staging tables
    Init(InitArgs),
    /// Load an extract CSV into the staging table
    Stage(StageArgs),
    /// Merge an extract (CSV or staged batch) into a dimension
    Merge(MergeArgs),
    /// Show the current snapshot
    Current(DimensionArgs),
    /// Show the snapshot valid at an instant
    AsOf(AsOfArgs),
    /// Show every version of one identifier
    History(HistoryArgs),
    /// Check the SCD2 invariants of a dimension
    Verify(DimensionArgs),
    /// Show the run log
    Runs(RunsArgs),
}

#[derive(Args)]
struct DimensionArgs {
    /// Dimension name (default from config)
    #[arg(short, long)]
    dimension: Option<String>,
}

#[derive(Args)]
struct InitArgs {
    /// Dimensions to create (default: all registered)
    dimensions: Vec<String>,
}

#[derive(Args)]
struct StageArgs {
    #[command(flatten)]
    target: DimensionArgs,
    /// Extract CSV file
    csv: PathBuf,
    /// Batch marker (default: the extract_date column)
    #[arg(long)]
    batch: Option<String>,
}

#[derive(Args)]
struct MergeArgs {
    #[command(flatten)]
    target: DimensionArgs,
    /// Extract CSV file to merge directly
    #[arg(long, conflicts_with = "batch")]
    csv: Option<PathBuf>,
    /// Staged batch to merge
    #[arg(long)]
    batch: Option<String>,
    /// as_of override (RFC3339 or YYYY-MM-DD)
    #[arg(long, env = "SCD_AS_OF")]
    as_of: Option<String>,
    /// Tracked attributes override (comma separated)
    #[arg(long, value_delimiter = ',')]
    tracked: Option<Vec<String>>,
}

#[derive(Args)]
struct AsOfArgs {
    #[command(flatten)]
    target: DimensionArgs,
    /// Instant (RFC3339 or YYYY-MM-DD)
    at: String,
}

#[derive(Args)]
struct HistoryArgs {
    #[command(flatten)]
    target: DimensionArgs,
    id: String,
}

#[derive(Args)]
struct RunsArgs {
    #[arg(short, long)]
    dimension: Option<String>,
    #[arg(short = 'n', long, default_value = "20")]
    limit: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = MergeConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(database) = cli.database.clone() {
        config.database = database;
    }
    config.log.init();

    let mut store = SqliteStore::open(&config.database, config.busy_timeout())
        .with_context(|| format!("Failed to open {}", config.database.display()))?;

    match cli.command {
        Command::Init(args) => run_init(&config, &mut store, &args),
        Command::Stage(args) => run_stage(&config, &mut store, &args),
        Command::Merge(args) => run_merge(config, &mut store, args, cli.format),
        Command::Current(args) => {
            let spec = config.resolve_dimension(args.dimension.as_deref())?;
            let rows = query::current_snapshot(&store, &spec)?;
            print_rows(&spec, &rows, cli.format)
        }
        Command::AsOf(args) => {
            let spec = config.resolve_dimension(args.target.dimension.as_deref())?;
            let at = parse_as_of(&args.at)?;
            let rows = query::snapshot_at(&store, &spec, at)?;
            print_rows(&spec, &rows, cli.format)
        }
        Command::History(args) => {
            let spec = config.resolve_dimension(args.target.dimension.as_deref())?;
            let timeline = query::entity_history(&store, &spec, &EntityId::new(args.id))?;
            print_rows(&spec, timeline.history(), cli.format)
        }
        Command::Verify(args) => {
            let spec = config.resolve_dimension(args.dimension.as_deref())?;
            let report = query::verify_dimension(&store, &spec)?;
            match cli.format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Text => {
                    println!(
                        "🔍 {}: {} identifiers, {} rows",
                        spec.table, report.identifiers, report.rows
                    );
                    for v in &report.violations {
                        println!("   ❌ {} {:?}: {}", v.id, v.kind, v.detail);
                    }
                }
            }
            if !report.is_clean() {
                bail!("{} invariant violations in {}", report.violations.len(), spec.table);
            }
            if matches!(cli.format, OutputFormat::Text) {
                println!("✅ one current row per identifier, contiguous non-overlapping windows");
            }
            Ok(())
        }
        Command::Runs(args) => {
            let runs: Vec<RunReport> = store
                .runs(args.dimension.as_deref())?
                .into_iter()
                .take(args.limit)
                .collect();
            match cli.format {
                OutputFormat::Json => print_json(&runs),
                OutputFormat::Text => {
                    for run in &runs {
                        print_run(run);
                    }
                    Ok(())
                }
            }
        }
    }
}

fn run_init(config: &MergeConfig, store: &mut SqliteStore, args: &InitArgs) -> Result<()> {
    let registry = config.registry()?;
    let names: Vec<String> = if args.dimensions.is_empty() {
        registry.names().into_iter().map(String::from).collect()
    } else {
        args.dimensions.clone()
    };

    for name in &names {
        let spec = registry.get(name)?;
        store.ensure_dimension(spec)?;
        println!("✓ {} ({} + {})", spec.name, spec.table, spec.staging_table());
    }
    println!("✓ Database initialized with WAL mode: {}", config.database.display());
    Ok(())
}

fn run_stage(config: &MergeConfig, store: &mut SqliteStore, args: &StageArgs) -> Result<()> {
    let spec = config.resolve_dimension(args.target.dimension.as_deref())?;
    store.ensure_dimension(&spec)?;

    let extract = load_csv(&spec, &args.csv)?;
    let batch = match (&args.batch, &extract.batch) {
        (Some(batch), _) => batch.clone(),
        (None, Some(batch)) if !batch.is_empty() => batch.clone(),
        _ => bail!(
            "{} has no extract_date column; pass --batch",
            args.csv.display()
        ),
    };

    let count = store.stage_batch(&spec, &batch, &extract.records)?;
    println!("✓ Staged {} records into {} (batch {})", count, spec.staging_table(), batch);
    Ok(())
}

fn run_merge(
    mut config: MergeConfig,
    store: &mut SqliteStore,
    args: MergeArgs,
    format: OutputFormat,
) -> Result<()> {
    if args.as_of.is_some() {
        config.as_of = args.as_of;
    }
    if args.tracked.is_some() {
        config.tracked = args.tracked;
    }

    let spec = config.resolve_dimension(args.target.dimension.as_deref())?;
    let mut orchestrator = MergeOrchestrator::new(store, spec);
    if let Some(as_of) = config.as_of()? {
        orchestrator = orchestrator.with_as_of(as_of);
    }

    let outcome = match (&args.csv, &args.batch) {
        (Some(csv), _) => {
            let extract = load_csv(orchestrator.spec(), csv)?;
            orchestrator.run(extract.records, extract.batch)
        }
        (None, Some(batch)) => orchestrator.run_staged(batch),
        (None, None) => bail!("pass --csv FILE or --batch BATCH"),
    };

    let report = match &outcome {
        Ok(report) => report,
        Err(failure) => &failure.report,
    };
    match format {
        OutputFormat::Json => print_json(report)?,
        OutputFormat::Text => print_run(report),
    }

    outcome.map(|_| ()).map_err(anyhow::Error::from)
}

// ============================================================================
// Output
// ============================================================================

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_run(run: &RunReport) {
    let icon = if run.is_complete() { "✅" } else { "❌" };
    println!(
        "{} {} {} as_of={} state={}",
        icon,
        run.run_id,
        run.dimension,
        format_ts(&run.as_of),
        run.state.as_str()
    );
    println!(
        "   new={} changed={} unchanged={} failed={} | closed={} inserted={} skipped={}",
        run.counts.new,
        run.counts.changed,
        run.counts.unchanged,
        run.counts.failed,
        run.counts.closed,
        run.counts.inserted,
        run.counts.skipped
    );
    if run.resumed {
        println!("   ↻ resumed an earlier attempt at the same as_of");
    }
    if let Some(error) = &run.error {
        println!(
            "   last state {} (retryable: {}): {}",
            run.last_state.as_str(),
            run.retryable,
            error
        );
    }
}

fn print_rows(spec: &DimensionSpec, rows: &[DimensionRow], format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        return print_json(rows);
    }

    println!("📊 {} ({} rows)", spec.table, rows.len());
    for row in rows {
        println!(
            "{:>10}  {}  →  {:<27}  {}  {}",
            row.id.as_str(),
            format_ts(&row.valid_from),
            row.valid_to.as_ref().map(format_ts).unwrap_or_else(|| "current".to_string()),
            render(&row.tracked),
            render(&row.passthrough)
        );
    }
    Ok(())
}

fn render(attrs: &Attributes) -> String {
    attrs
        .iter()
        .map(|(name, value)| match value {
            scd_merge::AttributeValue::Null => format!("{}=∅", name),
            scd_merge::AttributeValue::Text(s) => format!("{}={:?}", name, s),
            other => format!("{}={}", name, serde_json::to_string(other).unwrap_or_default()),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
