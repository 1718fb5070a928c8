//! High-level runner API for the NDR pipeline.
//!
//! This module provides a simplified public interface that encapsulates the
//! setup of the status store, the model adapter, the watershed catalog and the
//! coordinator.
//!
//! This is the primary API for external users and for the CLI.

use anyhow::{Result, bail};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::WORK_STATUS_DATABASE;
use crate::coordination::{Coordinator, PipelineConfigBuilder};
use crate::db::{FailureRecord, RetryPolicy, StatusCount, StatusDb, WorkStatusStore};
use crate::formats::GeoJsonCatalog;
use crate::model::{CommandModel, ModelParameters, NutrientModel};
use crate::scenario::{ScenarioBundle, ScenarioSet};

pub use crate::config::default_worker_count;
pub use crate::coordination::{ResumePolicy, RunResult, ScenarioSummary};
pub use crate::db::WorkStatus;
pub use crate::model::RoutingAlgorithm;

/// Arguments for running the pipeline
#[derive(Debug, Clone)]
pub struct RunArgs {
    // Inputs
    pub bundle_paths: Vec<PathBuf>,
    pub workspace_dir: PathBuf,
    pub dem_path: PathBuf,
    pub watershed_dir: PathBuf,

    // Model
    pub model_command: PathBuf,
    pub model_args: Vec<String>,
    pub routing_algorithm: RoutingAlgorithm,

    // Scheduling
    pub worker_count: usize,
    pub batch_size: usize,
    /// Explicit `<basename>_<fid>` ids to run instead of the remaining work
    pub watersheds: Option<Vec<String>>,
    pub limit_to_scenarios: Option<Vec<String>>,
    pub resume_policy: ResumePolicy,

    // Options
    pub quiet: bool,
}

/// Location of the work status database inside a workspace
pub fn work_status_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(WORK_STATUS_DATABASE)
}

/// Run the pipeline with the specified arguments
///
/// This is the main entry point. It handles all the internal setup including:
/// - Loading and merging the scenario bundles
/// - Opening the work status store in the workspace
/// - Wrapping the model executable
/// - Discovering watersheds and running the coordinator
///
/// # Example
///
/// ```no_run
/// use ndr_pipeline::runner::{ResumePolicy, RoutingAlgorithm, RunArgs, run_pipeline};
/// use std::path::PathBuf;
///
/// # async fn example() -> anyhow::Result<()> {
/// let args = RunArgs {
///     bundle_paths: vec![PathBuf::from("scenarios/baseline.json")],
///     workspace_dir: PathBuf::from("ndr_workspace"),
///     dem_path: PathBuf::from("data/global_dem_3s.tif"),
///     watershed_dir: PathBuf::from("data/watersheds"),
///     model_command: PathBuf::from("/usr/local/bin/ndr-plus"),
///     model_args: vec![],
///     routing_algorithm: RoutingAlgorithm::D8,
///     worker_count: 8,
///     batch_size: 100,
///     watersheds: None,
///     limit_to_scenarios: None,
///     resume_policy: ResumePolicy::Recompute,
///     quiet: true,
/// };
///
/// let result = run_pipeline(args).await?;
/// println!("Finished {} scenarios in {:?}", result.scenarios.len(), result.duration);
/// # Ok(())
/// # }
/// ```
pub async fn run_pipeline(args: RunArgs) -> Result<RunResult> {
    let model: Arc<dyn NutrientModel> = Arc::new(CommandModel::new(
        args.model_command.clone(),
        args.model_args.clone(),
    ));
    run_pipeline_with_model(args, model).await
}

pub(crate) async fn run_pipeline_with_model(
    args: RunArgs,
    model: Arc<dyn NutrientModel>,
) -> Result<RunResult> {
    if args.bundle_paths.is_empty() {
        bail!("At least one scenario bundle is required");
    }
    let bundles = args
        .bundle_paths
        .iter()
        .map(|path| ScenarioBundle::load(path))
        .collect::<Result<Vec<_>>>()?;
    let scenarios = ScenarioSet::merge(bundles, args.limit_to_scenarios.as_deref())?;
    if scenarios.is_empty() {
        bail!("The scenario bundles define no scenarios");
    }
    info!("Running scenarios: {}", scenarios.scenario_ids().join(", "));

    let config = PipelineConfigBuilder::default()
        .scenarios(scenarios)
        .workspace_dir(&args.workspace_dir)
        .dem_path(&args.dem_path)
        .parameters(ModelParameters {
            routing_algorithm: args.routing_algorithm,
            ..ModelParameters::default()
        })
        .worker_count(args.worker_count.max(1))
        .batch_size(args.batch_size.max(1))
        .watershed_subset(args.watersheds)
        .resume_policy(args.resume_policy)
        .quiet(args.quiet)
        .build()?;

    let store = Arc::new(StatusDb::new(
        work_status_path(&args.workspace_dir),
        RetryPolicy::default(),
    ));
    let catalog = Arc::new(GeoJsonCatalog::new(args.watershed_dir));

    let coordinator = Coordinator::new(Arc::new(config), store, model, catalog);
    coordinator.run().await
}

/// Read-only summary of a workspace's work status store
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub database: PathBuf,
    pub counts: Vec<StatusCount>,
    pub failures: Vec<FailureRecord>,
}

/// Summarize the store in `workspace_dir`, optionally for one scenario
pub async fn status(workspace_dir: &Path, scenario: Option<&str>) -> Result<StatusReport> {
    let database = work_status_path(workspace_dir);
    let store = StatusDb::new(&database, RetryPolicy::default());
    if !store.exists() {
        bail!("No work status database at {}", database.display());
    }
    let counts = store.status_counts(scenario).await?;
    let failures = store.failures(scenario).await?;
    Ok(StatusReport {
        database,
        counts,
        failures,
    })
}
