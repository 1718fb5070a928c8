use clap::{Parser, Subcommand};
use ndr_pipeline::runner::{
    ResumePolicy, RoutingAlgorithm, RunArgs, default_worker_count, run_pipeline, status,
};
use std::path::PathBuf;

#[derive(Parser, Clone)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Schedule, run and stitch every remaining watershed for each scenario
    Run {
        /// Scenario bundle JSON files; later bundles override earlier ones
        #[arg(required = true)]
        bundles: Vec<PathBuf>,

        /// Workspace directory holding the status store, unit workspaces and mosaics
        #[arg(short = 'o', long)]
        workspace_dir: PathBuf,

        /// Global DEM raster
        #[arg(short, long)]
        dem: PathBuf,

        /// Directory of watershed GeoJSON files
        #[arg(long)]
        watershed_dir: PathBuf,

        /// Nutrient model executable, called with the request file as its last argument
        #[arg(short, long)]
        model_command: PathBuf,

        /// Extra arguments passed to the model before the request file
        #[arg(long, allow_hyphen_values = true)]
        model_arg: Vec<String>,

        /// Routing algorithm (D8, MFD)
        #[arg(long, default_value = "D8")]
        routing: String,

        /// Number of concurrent model runs (default: number of CPUs)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Units stitched per mosaic flush
        #[arg(short, long, default_value = "100")]
        batch_size: usize,

        /// Comma separated `<basename>_<fid>` ids to run instead of the remaining work
        #[arg(long)]
        watersheds: Option<String>,

        /// Comma separated scenario ids to run
        #[arg(long)]
        limit_to_scenarios: Option<String>,

        /// What to do with COMPUTED units on resume (recompute, restitch)
        #[arg(long, default_value = "recompute")]
        resume_policy: String,

        /// Quiet mode - minimal output, only show summary
        #[arg(short, long)]
        quiet: bool,
    },
    /// Show unit counts and recorded failures for a workspace
    Status {
        /// Workspace directory of a previous run
        #[arg(short = 'o', long)]
        workspace_dir: PathBuf,

        /// Only show this scenario
        #[arg(short, long)]
        scenario: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            bundles,
            workspace_dir,
            dem,
            watershed_dir,
            model_command,
            model_arg,
            routing,
            workers,
            batch_size,
            watersheds,
            limit_to_scenarios,
            resume_policy,
            quiet,
        } => {
            run_run(
                bundles,
                workspace_dir,
                dem,
                watershed_dir,
                model_command,
                model_arg,
                routing,
                workers,
                batch_size,
                watersheds,
                limit_to_scenarios,
                resume_policy,
                quiet,
            )
            .await?;
        }
        Command::Status {
            workspace_dir,
            scenario,
            json,
        } => {
            run_status(workspace_dir, scenario, json).await?;
        }
    }
    Ok(())
}

fn init_tracing(quiet: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let default_directives = if quiet {
        "ndr_pipeline=warn,sqlx=off"
    } else {
        "ndr_pipeline=info,sqlx=off"
    };
    // RUST_LOG wins when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[allow(clippy::too_many_arguments)]
async fn run_run(
    bundles: Vec<PathBuf>,
    workspace_dir: PathBuf,
    dem: PathBuf,
    watershed_dir: PathBuf,
    model_command: PathBuf,
    model_args: Vec<String>,
    routing: String,
    workers: Option<usize>,
    batch_size: usize,
    watersheds: Option<String>,
    limit_to_scenarios: Option<String>,
    resume_policy: String,
    quiet: bool,
) -> anyhow::Result<()> {
    init_tracing(quiet);

    let routing_algorithm = RoutingAlgorithm::parse(&routing)?;
    let resume_policy = ResumePolicy::parse(&resume_policy)?;
    let worker_count = workers.unwrap_or_else(default_worker_count);

    let watersheds = watersheds.as_deref().map(cli::parse_id_list).transpose().map_err(|e| {
        anyhow::anyhow!(
            "Failed to parse --watersheds: {}\n\
             Example: --watersheds \"hybas_af_lev05_0,hybas_af_lev05_17\"",
            e
        )
    })?;
    let limit_to_scenarios = limit_to_scenarios
        .as_deref()
        .map(cli::parse_id_list)
        .transpose()
        .map_err(|e| anyhow::anyhow!("Failed to parse --limit-to-scenarios: {}", e))?;

    if !quiet {
        println!("NDR Pipeline");
        println!("============");
        println!("Workspace: {}", workspace_dir.display());
        println!("DEM: {}", dem.display());
        println!("Watersheds: {}", watershed_dir.display());
        println!("Model: {}", model_command.display());
        println!("Routing: {}", routing_algorithm);
        println!("Workers: {}", worker_count);
        println!();
    }

    let run_args = RunArgs {
        bundle_paths: bundles,
        workspace_dir: workspace_dir.clone(),
        dem_path: dem,
        watershed_dir,
        model_command,
        model_args,
        routing_algorithm,
        worker_count,
        batch_size,
        watersheds,
        limit_to_scenarios,
        resume_policy,
        quiet,
    };

    let result = run_pipeline(run_args).await?;

    println!();
    println!("Run Summary");
    println!("===========");
    println!("Run ID: {}", result.run_id);
    println!("Rasters scrubbed: {}", result.rasters_scrubbed);
    println!("Rasters validated: {}", result.rasters_validated);
    println!("Watersheds scheduled: {}", result.watersheds_scheduled);
    for scenario in &result.scenarios {
        println!();
        println!("Scenario {}", scenario.scenario_id);
        println!("  Units submitted: {}", scenario.units_submitted);
        println!("  Units computed: {}", scenario.units_computed);
        println!("  Units restitched: {}", scenario.units_restitched);
        println!("  Units failed: {}", scenario.units_failed);
        println!("  Units completed: {}", scenario.units_completed);
        println!("  Mosaic flushes: {}", scenario.flushes);
        for mosaic in &scenario.finalized {
            println!(
                "  Output: {} ({} overview levels, aggregated store {})",
                mosaic.compressed.display(),
                mosaic.overview_levels,
                mosaic.aggregated.display()
            );
        }
    }
    println!();
    println!("Duration: {:.2}s", result.duration.as_secs_f64());

    let failed: usize = result.scenarios.iter().map(|s| s.units_failed).sum();
    if failed > 0 {
        println!();
        println!("{} units failed and will be retried on the next run.", failed);
        println!("To inspect the failures:");
        println!("  ndr-pipeline status --workspace-dir {}", workspace_dir.display());
    }

    Ok(())
}

async fn run_status(
    workspace_dir: PathBuf,
    scenario: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    init_tracing(true);
    let report = status(&workspace_dir, scenario.as_deref()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Work Status");
    println!("===========");
    println!("Database: {}", report.database.display());
    for count in &report.counts {
        println!("  {:<24} {:<10} {}", count.scenario_id, count.status.as_str(), count.count);
    }
    if !report.failures.is_empty() {
        println!();
        println!("Failures");
        println!("========");
        for failure in &report.failures {
            println!(
                "  {} {} at {}: {}",
                failure.scenario_id, failure.watershed_id, failure.failed_at, failure.reason
            );
        }
    }
    Ok(())
}

/// CLI utility functions for parsing command-line arguments
mod cli {
    use std::collections::HashSet;

    /// Parse a comma separated id list, rejecting empty and duplicate entries
    pub fn parse_id_list(list: &str) -> anyhow::Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for id in list.split(',') {
            let id = id.trim();
            if id.is_empty() {
                return Err(anyhow::anyhow!("Empty id in list '{}'", list));
            }
            if !seen.insert(id) {
                return Err(anyhow::anyhow!("Duplicate id '{}' in list", id));
            }
            ids.push(id.to_string());
        }
        Ok(ids)
    }

}
