use anyhow::{Context, Result, anyhow, bail};
use derive_builder::Builder;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::aggregator::{AggregatorReport, AggregatorSettings, MosaicPair, StitchAggregator, StitchPayload};
use super::worker::{UnitOutcome, UnitRunner};
use crate::config::{
    AGGREGATION_FACTOR, AREA_DEG_THRESHOLD, DEFAULT_BATCH_SIZE, DEFAULT_MAX_ABS,
    DEFAULT_RELATIVE_TOLERANCE, MOSAIC_CELL_SIZE_DEG, MOSAIC_NODATA, MOSAIC_TILE_SIZE,
    REPORT_INTERVAL, default_worker_count,
};
use crate::error::PipelineError;
use crate::db::{ScheduledUnit, UnitKey, WorkStatus, WorkStatusStore, WorkUnit};
use crate::formats::{LookupTables, Watershed, WatershedCatalog};
use crate::model::{ModelInputs, ModelRequest, NutrientModel};
use crate::quality::{RasterInput, scrub_raster, validate_inputs};
use crate::raster::{FinalizedMosaic, MosaicGrid};
use crate::scenario::{ScenarioDefinition, ScenarioSet};
use crate::telemetry::ProgressReporter;

/// Directory under the workspace holding scrubbed copies of inputs
const SCRUBBED_DIR: &str = "scrubbed";

/// Directory under the workspace holding the running mosaics
const MOSAIC_DIR: &str = "mosaics";

/// What to do on resume with units that were computed but never stitched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumePolicy {
    /// Rerun the model for every unit that is not COMPLETE
    #[default]
    Recompute,
    /// Stitch COMPUTED units whose outputs still exist without rerunning them
    Restitch,
}

impl ResumePolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "recompute" => Ok(ResumePolicy::Recompute),
            "restitch" => Ok(ResumePolicy::Restitch),
            _ => bail!(
                "Unsupported resume policy: {}. Supported policies: recompute, restitch",
                s
            ),
        }
    }
}

/// Configuration for a pipeline run
///
/// Assembled once before scheduling and shared read-only by every component.
#[derive(Debug, Clone, Builder)]
pub struct PipelineConfig {
    pub scenarios: ScenarioSet,
    #[builder(setter(into))]
    pub workspace_dir: PathBuf,
    #[builder(setter(into))]
    pub dem_path: PathBuf,
    #[builder(default)]
    pub parameters: crate::model::ModelParameters,
    #[builder(default = "default_worker_count()")]
    pub worker_count: usize,
    #[builder(default = "DEFAULT_BATCH_SIZE")]
    pub batch_size: usize,
    /// Explicit watershed ids; bypasses the resume query and keeps workspaces
    #[builder(default)]
    pub watershed_subset: Option<Vec<String>>,
    #[builder(default)]
    pub resume_policy: ResumePolicy,
    #[builder(default = "REPORT_INTERVAL")]
    pub report_interval: Duration,
    #[builder(default = "MosaicGrid::global(MOSAIC_CELL_SIZE_DEG, MOSAIC_NODATA, MOSAIC_TILE_SIZE)")]
    pub mosaic_grid: MosaicGrid,
    #[builder(default = "AGGREGATION_FACTOR")]
    pub aggregation_factor: u32,
    #[builder(default = "AREA_DEG_THRESHOLD")]
    pub area_threshold: f64,
    #[builder(default = "DEFAULT_RELATIVE_TOLERANCE")]
    pub relative_tolerance: f64,
    #[builder(default = "DEFAULT_MAX_ABS")]
    pub max_abs: f64,
    #[builder(default)]
    pub quiet: bool,
}

impl PipelineConfig {
    pub fn scrubbed_dir(&self) -> PathBuf {
        self.workspace_dir.join(SCRUBBED_DIR)
    }

    pub fn mosaic_dir(&self) -> PathBuf {
        self.workspace_dir.join(MOSAIC_DIR)
    }

    pub fn unit_workspace(&self, scenario_id: &str, watershed_id: &str) -> PathBuf {
        self.workspace_dir.join(scenario_id).join(watershed_id)
    }

    fn remove_workspaces(&self) -> bool {
        self.watershed_subset.is_none()
    }
}

/// Per-scenario counts for a finished run
#[derive(Debug, Clone, Default)]
pub struct ScenarioSummary {
    pub scenario_id: String,
    pub units_submitted: usize,
    pub units_computed: usize,
    pub units_failed: usize,
    /// COMPUTED units stitched without rerunning the model
    pub units_restitched: usize,
    pub units_completed: usize,
    pub flushes: usize,
    pub finalized: Vec<FinalizedMosaic>,
}

/// Result of a completed pipeline run
#[derive(Debug)]
pub struct RunResult {
    pub run_id: String,
    pub rasters_scrubbed: usize,
    pub rasters_validated: usize,
    pub watersheds_scheduled: usize,
    pub scenarios: Vec<ScenarioSummary>,
    pub duration: Duration,
}

/// The Coordinator drives a run from input checks to finalized mosaics
pub struct Coordinator {
    config: Arc<PipelineConfig>,
    store: Arc<dyn WorkStatusStore>,
    model: Arc<dyn NutrientModel>,
    catalog: Arc<dyn WatershedCatalog>,
}

impl Coordinator {
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<dyn WorkStatusStore>,
        model: Arc<dyn NutrientModel>,
        catalog: Arc<dyn WatershedCatalog>,
    ) -> Self {
        Self {
            config,
            store,
            model,
            catalog,
        }
    }

    /// Run the pipeline
    ///
    /// This method orchestrates the entire run:
    /// 1. Generate a unique run ID and make sure the store schema exists
    /// 2. Scrub the configured inputs into the workspace
    /// 3. Validate every distinct input raster; any failure aborts here
    /// 4. Schedule every large-enough watershed for every scenario
    /// 5. Start the progress reporter
    /// 6. For each scenario, run its units and stitch the results
    /// 7. Stop the reporter and summarize
    pub async fn run(&self) -> Result<RunResult> {
        let start_time = Instant::now();

        // 1. Generate run ID
        let run_id = Uuid::new_v4().to_string();
        info!("Starting run: {}", run_id);
        tokio::fs::create_dir_all(&self.config.workspace_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create workspace {}",
                    self.config.workspace_dir.display()
                )
            })?;
        self.store.create_schema_if_absent().await?;

        // 2. Scrub
        let (scenarios, rasters_scrubbed) = self.scrub_inputs().await?;

        // 3. Validate
        let rasters_validated = self.validate(&scenarios).await?;

        // 4. Schedule
        let watersheds = self.schedule(&scenarios).await?;
        let watersheds_scheduled = watersheds.len();

        // 5. Progress reporter
        let token = CancellationToken::new();
        let reporter = ProgressReporter::new(
            Arc::clone(&self.store),
            scenarios.scenario_ids(),
            self.config.report_interval,
            self.config.quiet,
        );
        let reporter_handle = tokio::spawn(reporter.run(token.clone()));

        // 6. Scenarios run one after another
        let mut summaries = Vec::new();
        let mut outcome = Ok(());
        for (scenario_id, definition) in scenarios.scenarios() {
            match self
                .run_scenario(scenario_id, definition, &scenarios, &watersheds)
                .await
            {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        // 7. Stop reporting
        token.cancel();
        match reporter_handle.await {
            Ok(stats) => debug!(
                "Progress reporter stopped after {} reports and {} read errors",
                stats.reports, stats.errors
            ),
            Err(e) => warn!("Progress reporter panicked: {}", e),
        }
        outcome?;

        Ok(RunResult {
            run_id,
            rasters_scrubbed,
            rasters_validated,
            watersheds_scheduled,
            scenarios: summaries,
            duration: start_time.elapsed(),
        })
    }

    /// Scrub configured rasters and return the scenario set pointing at the copies
    async fn scrub_inputs(&self) -> Result<(ScenarioSet, usize)> {
        let scenarios = &self.config.scenarios;
        if scenarios.scrub_ids().is_empty() {
            return Ok((scenarios.clone(), 0));
        }

        let scrubbed_dir = self.config.scrubbed_dir();
        tokio::fs::create_dir_all(&scrubbed_dir)
            .await
            .with_context(|| format!("Failed to create {}", scrubbed_dir.display()))?;

        let mut replacements = BTreeMap::new();
        let mut scrubbed = 0;
        for id in scenarios.scrub_ids() {
            let base = scenarios.raster_path(id)?.to_path_buf();
            let file_name = base
                .file_name()
                .with_context(|| format!("Raster '{}' has no file name", id))?;
            // ids are unique, basenames need not be
            let target = scrubbed_dir.join(format!("{}_{}", id, file_name.to_string_lossy()));

            if tokio::fs::try_exists(&target).await? {
                debug!("{} already scrubbed to {}", id, target.display());
            } else {
                info!("Scrubbing {} ({})", id, base.display());
                let (rtol, max_abs) = (self.config.relative_tolerance, self.config.max_abs);
                let target_clone = target.clone();
                tokio::task::spawn_blocking(move || scrub_raster(&base, &target_clone, None, rtol, max_abs))
                    .await
                    .context("Scrub task panicked")??;
                scrubbed += 1;
            }
            replacements.insert(id.clone(), target);
        }
        Ok((scenarios.with_raster_paths(&replacements), scrubbed))
    }

    /// Validate the DEM and every raster of the bundles, used or not
    async fn validate(&self, scenarios: &ScenarioSet) -> Result<usize> {
        let mut inputs = vec![RasterInput::new("dem", &self.config.dem_path)];
        for (id, path) in scenarios.rasters() {
            inputs.push(RasterInput::new(id, path));
        }
        validate_inputs(
            &inputs,
            self.config.relative_tolerance,
            self.config.max_abs,
        )
        .await
    }

    /// Insert a row for every schedulable (scenario, watershed) pair
    ///
    /// Existing rows keep their status, which is what makes a rerun resume.
    /// Returns the scheduled watersheds by id.
    async fn schedule(&self, scenarios: &ScenarioSet) -> Result<HashMap<String, Watershed>> {
        let all = self.catalog.watersheds().await?;
        let total = all.len();
        let mut selected: Vec<Watershed> = all
            .into_iter()
            .filter(|w| w.area_deg2 > self.config.area_threshold)
            .collect();
        info!(
            "Scheduling {} of {} watersheds above {} square degrees",
            selected.len(),
            total,
            self.config.area_threshold
        );

        if let Some(ids) = &self.config.watershed_subset {
            for watershed in self.catalog.resolve(ids).await? {
                if !selected.iter().any(|w| w.watershed_id() == watershed.watershed_id()) {
                    selected.push(watershed);
                }
            }
        }

        for scenario_id in scenarios.scenario_ids() {
            let units: Vec<ScheduledUnit> = selected
                .iter()
                .map(|w| ScheduledUnit {
                    key: UnitKey::new(&scenario_id, w.watershed_id()),
                    watershed_area: w.area_deg2,
                })
                .collect();
            self.store
                .insert_scheduled(&units)
                .await
                .with_context(|| format!("Failed to schedule scenario {}", scenario_id))?;
        }

        Ok(selected
            .into_iter()
            .map(|w| (w.watershed_id(), w))
            .collect())
    }

    /// Units to run for a scenario, largest first
    ///
    /// An explicit subset runs every named unit whatever its status.
    async fn work_list(
        &self,
        scenario_id: &str,
        watersheds: &HashMap<String, Watershed>,
    ) -> Result<Vec<WorkUnit>> {
        match &self.config.watershed_subset {
            Some(ids) => {
                let mut units = Vec::with_capacity(ids.len());
                for id in ids {
                    let watershed = watersheds
                        .get(id)
                        .ok_or_else(|| PipelineError::WatershedNotFound(id.clone()))?;
                    let key = UnitKey::new(scenario_id, id);
                    let status = self
                        .store
                        .status_of(&key)
                        .await?
                        .unwrap_or(WorkStatus::Scheduled);
                    units.push(WorkUnit {
                        key,
                        watershed_area: watershed.area_deg2,
                        status,
                    });
                }
                units.sort_by(|a, b| b.watershed_area.total_cmp(&a.watershed_area));
                Ok(units)
            }
            None => self.store.select_remaining(scenario_id).await,
        }
    }

    async fn run_scenario(
        &self,
        scenario_id: &str,
        definition: &ScenarioDefinition,
        scenarios: &ScenarioSet,
        watersheds: &HashMap<String, Watershed>,
    ) -> Result<ScenarioSummary> {
        info!("Starting scenario {}", scenario_id);
        let config = &self.config;

        let table = scenarios.biophysical_table(&definition.biophysical_table_id)?.clone();
        let lookup_tables = tokio::task::spawn_blocking(move || LookupTables::load(&table.path, &table.lulc_field))
            .await
            .context("Biophysical table task panicked")??;
        let inputs = ModelInputs {
            dem: config.dem_path.clone(),
            lulc: scenarios.raster_path(&definition.lulc_id)?.to_path_buf(),
            precip: scenarios.raster_path(&definition.precip_id)?.to_path_buf(),
            fertilizer: scenarios.raster_path(&definition.fertilizer_id)?.to_path_buf(),
        };

        let mosaics =
            MosaicPair::create_if_absent(&config.mosaic_dir(), scenario_id, &config.parameters, config.mosaic_grid)?;
        let (stitch_tx, stitch_rx) = mpsc::unbounded_channel::<StitchPayload>();
        let aggregator = StitchAggregator::new(
            scenario_id,
            Arc::clone(&self.store),
            mosaics,
            AggregatorSettings {
                batch_size: config.batch_size,
                remove_workspaces: config.remove_workspaces(),
                output_dir: config.workspace_dir.clone(),
                aggregation_factor: config.aggregation_factor,
            },
        );
        let aggregator_handle = tokio::spawn(aggregator.run(stitch_rx));

        let mut summary = ScenarioSummary {
            scenario_id: scenario_id.to_string(),
            ..Default::default()
        };

        let dispatched = self
            .dispatch_units(
                scenario_id,
                inputs,
                lookup_tables,
                watersheds,
                stitch_tx,
                &mut summary,
            )
            .await;

        if let Err(e) = dispatched {
            let queue_closed = matches!(
                e.downcast_ref::<PipelineError>(),
                Some(PipelineError::StitchQueueClosed { .. })
            );
            if queue_closed {
                // Only an exiting aggregator drops the receiver; report its error
                if let Ok(Err(aggregator_error)) = aggregator_handle.await {
                    return Err(aggregator_error.context(format!("Scenario {} failed", scenario_id)));
                }
            } else {
                aggregator_handle.abort();
            }
            return Err(e.context(format!("Scenario {} failed", scenario_id)));
        }

        info!("Waiting for scenario {} to finish stitching", scenario_id);
        let report: AggregatorReport = aggregator_handle
            .await
            .map_err(|e| anyhow!("Stitch aggregator for {} panicked: {}", scenario_id, e))??;

        summary.units_completed = report.units_completed;
        summary.flushes = report.flush_sizes.len();
        summary.finalized = report.finalized;
        Ok(summary)
    }

    /// Run every remaining unit with at most `worker_count` in flight
    ///
    /// Consumes the scenario's queue sender; the queue closes once every unit
    /// task has finished.
    async fn dispatch_units(
        &self,
        scenario_id: &str,
        inputs: ModelInputs,
        lookup_tables: LookupTables,
        watersheds: &HashMap<String, Watershed>,
        stitch_tx: mpsc::UnboundedSender<StitchPayload>,
        summary: &mut ScenarioSummary,
    ) -> Result<()> {
        let config = &self.config;
        let work = self.work_list(scenario_id, watersheds).await?;
        info!("{} units to process for scenario {}", work.len(), scenario_id);

        let runner = Arc::new(UnitRunner::new(
            Arc::clone(&self.store),
            Arc::clone(&self.model),
            stitch_tx.clone(),
        ));

        let mut join_set: JoinSet<Result<UnitOutcome>> = JoinSet::new();
        for unit in work {
            let watershed = watersheds
                .get(&unit.key.watershed_id)
                .ok_or_else(|| PipelineError::WatershedNotFound(unit.key.watershed_id.clone()))?;
            let request = ModelRequest::new(
                scenario_id,
                watershed,
                config.parameters,
                inputs.clone(),
                lookup_tables.clone(),
                config.unit_workspace(scenario_id, &unit.key.watershed_id),
            );

            if config.resume_policy == ResumePolicy::Restitch
                && unit.status == WorkStatus::Computed
                && outputs_exist(&request).await?
            {
                debug!("{} already computed, queueing for stitching", unit.key);
                stitch_tx
                    .send(StitchPayload {
                        key: unit.key,
                        watershed_basename: watershed.basename.clone(),
                        export_path: request.export_path,
                        modified_load_path: request.modified_load_path,
                        workspace_dir: request.workspace_dir,
                    })
                    .map_err(|e| PipelineError::StitchQueueClosed {
                        scenario_id: scenario_id.to_string(),
                        watershed_id: e.0.key.watershed_id,
                    })?;
                summary.units_restitched += 1;
                continue;
            }

            while join_set.len() >= config.worker_count.max(1) {
                if let Some(joined) = join_set.join_next().await {
                    Self::record_outcome(joined, summary, &mut join_set).await?;
                }
            }

            let runner = Arc::clone(&runner);
            join_set.spawn(async move { runner.run(&request).await });
            summary.units_submitted += 1;
        }

        // Drop our senders so the queue closes when the last unit finishes
        drop(stitch_tx);
        drop(runner);

        while let Some(joined) = join_set.join_next().await {
            Self::record_outcome(joined, summary, &mut join_set).await?;
        }
        Ok(())
    }

    async fn record_outcome(
        joined: std::result::Result<Result<UnitOutcome>, tokio::task::JoinError>,
        summary: &mut ScenarioSummary,
        join_set: &mut JoinSet<Result<UnitOutcome>>,
    ) -> Result<()> {
        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                join_set.shutdown().await;
                return Err(e);
            }
            Err(e) => {
                join_set.shutdown().await;
                return Err(anyhow!("Unit task panicked: {}", e));
            }
        };
        match outcome {
            UnitOutcome::Computed => summary.units_computed += 1,
            UnitOutcome::Failed => summary.units_failed += 1,
        }
        Ok(())
    }
}

async fn outputs_exist(request: &ModelRequest) -> Result<bool> {
    for path in [&request.export_path, &request.modified_load_path] {
        if !tokio::fs::try_exists(path).await? {
            return Ok(false);
        }
    }
    Ok(true)
}
