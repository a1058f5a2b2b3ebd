use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fcd_core::Authority;
use fcd_detect::{ComparisonField, DetectionConfig, DetectionPipeline, RunOptions};
use fcd_storage::JsonlAuditSink;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fcd")]
#[command(about = "Facilities change detection command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the reference dataset against the education authority.
    Schools(DetectArgs),
    /// Reconcile the reference dataset against the health authority.
    Hospitals(DetectArgs),
}

#[derive(Debug, Args)]
struct DetectArgs {
    /// Reference facilities dataset (GeoJSON FeatureCollection).
    #[arg(long)]
    facilities: PathBuf,
    /// Directory change reports are written under, one subdirectory per run.
    #[arg(long, default_value = "reports")]
    output: PathBuf,
    /// Replay a saved authority capture instead of fetching.
    #[arg(long)]
    capture: Option<PathBuf>,
    /// Save the fetched capture for later replay.
    #[arg(long)]
    save_capture: Option<PathBuf>,
    /// YAML file with detection tunables.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Comparison fields, comma separated; overrides the config file.
    #[arg(long, value_delimiter = ',')]
    compare: Vec<String>,
    /// Directory the append-only audit log lives in.
    #[arg(long, default_value = "audit")]
    audit_dir: PathBuf,
    /// User recorded against audit entries.
    #[arg(long, default_value = "fcd")]
    user: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let (authority, args) = match cli.command {
        Commands::Schools(args) => (Authority::Education, args),
        Commands::Hospitals(args) => (Authority::Health, args),
    };

    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            DetectionConfig::from_yaml(&text)?
        }
        None => DetectionConfig::default(),
    };
    if !args.compare.is_empty() {
        config.comparison_fields = args
            .compare
            .iter()
            .map(|name| name.parse::<ComparisonField>())
            .collect::<Result<Vec<_>, _>>()?;
        config.validate()?;
    }

    let mut options = RunOptions::new(&args.facilities, &args.output);
    options.capture_path = args.capture;
    options.save_capture_path = args.save_capture;
    options.user = args.user;

    let audit = JsonlAuditSink::in_dir(&args.audit_dir);
    let pipeline = DetectionPipeline::new(config, options, Box::new(audit))?;
    let summary = pipeline.run_once(authority).await?;

    println!(
        "run complete: run_id={} added={} removed={} geom_updated={} attr_updated={} geom_attr_updated={} unchanged={} skipped={}+{} rows {} -> {}",
        summary.run_id,
        summary.added,
        summary.removed,
        summary.geom_updated,
        summary.attr_updated,
        summary.geom_attr_updated,
        summary.unchanged,
        summary.skipped_sources,
        summary.skipped_references,
        summary.row_count_before,
        summary.row_count_after
    );
    Ok(())
}
