//! Single-consumer batched merge of unit outputs into a scenario's mosaics
//!
//! The aggregator is the only writer of a scenario's two mosaics and the only
//! source of COMPLETE transitions. A unit is marked COMPLETE only after both
//! of its rasters have been stitched and flushed.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::{StatusUpdate, UnitKey, WorkStatus, WorkStatusStore};
use crate::error::PipelineError;
use crate::model::{ModelParameters, OutputKind};
use crate::raster::{FinalizedMosaic, GlobalMosaic, MosaicGrid, StitchStats, finalize_mosaic};

/// Completion message for one computed unit
#[derive(Debug, Clone, PartialEq)]
pub struct StitchPayload {
    pub key: UnitKey,
    pub watershed_basename: String,
    pub export_path: PathBuf,
    pub modified_load_path: PathBuf,
    pub workspace_dir: PathBuf,
}

/// The export and modified-load mosaics of one scenario
#[derive(Debug, Clone)]
pub struct MosaicPair {
    pub export: GlobalMosaic,
    pub modified_load: GlobalMosaic,
}

impl MosaicPair {
    /// Open or create the pair under `mosaic_dir`
    pub fn create_if_absent(
        mosaic_dir: &Path,
        scenario_id: &str,
        parameters: &ModelParameters,
        grid: MosaicGrid,
    ) -> Result<Self> {
        let open = |kind| {
            let dir = mosaic_dir.join(parameters.output_name(scenario_id, kind));
            GlobalMosaic::create_if_absent(&dir, grid)
        };
        Ok(Self {
            export: open(OutputKind::Export)?,
            modified_load: open(OutputKind::ModifiedLoad)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Payloads merged per flush
    pub batch_size: usize,
    /// Delete unit workspaces once their batch is COMPLETE
    pub remove_workspaces: bool,
    /// Where finalized outputs are written
    pub output_dir: PathBuf,
    pub aggregation_factor: u32,
}

#[derive(Debug, Default)]
pub struct AggregatorReport {
    /// Number of units merged by each flush, in order
    pub flush_sizes: Vec<usize>,
    pub units_completed: usize,
    pub finalized: Vec<FinalizedMosaic>,
}

/// Buffers for the pending batch, kept in parallel
#[derive(Default)]
struct Batch {
    export_paths: Vec<PathBuf>,
    modified_load_paths: Vec<PathBuf>,
    workspace_dirs: Vec<PathBuf>,
    updates: Vec<StatusUpdate>,
}

impl Batch {
    fn push(&mut self, payload: StitchPayload) {
        self.export_paths.push(payload.export_path);
        self.modified_load_paths.push(payload.modified_load_path);
        self.workspace_dirs.push(payload.workspace_dir);
        self.updates.push(StatusUpdate {
            status: WorkStatus::Complete,
            key: payload.key,
        });
    }

    fn len(&self) -> usize {
        self.updates.len()
    }

    fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

pub struct StitchAggregator {
    scenario_id: String,
    store: Arc<dyn WorkStatusStore>,
    mosaics: MosaicPair,
    settings: AggregatorSettings,
}

impl StitchAggregator {
    pub fn new(
        scenario_id: impl Into<String>,
        store: Arc<dyn WorkStatusStore>,
        mosaics: MosaicPair,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            store,
            mosaics,
            settings,
        }
    }

    /// Drain `rx` until every sender is dropped, then finalize both mosaics
    ///
    /// A payload naming a missing output file fails immediately, before
    /// anything from its batch is merged.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<StitchPayload>) -> Result<AggregatorReport> {
        let mut report = AggregatorReport::default();
        let mut batch = Batch::default();

        while let Some(payload) = rx.recv().await {
            Self::verify_artifacts(&payload).await?;
            batch.push(payload);
            if batch.len() >= self.settings.batch_size {
                self.flush(&mut batch, &mut report).await?;
            }
        }

        // Channel closed: no more producers
        if !batch.is_empty() {
            self.flush(&mut batch, &mut report).await?;
        }
        report.finalized = self.finalize().await?;
        info!(
            "All done stitching for {}: {} units in {} flushes",
            self.scenario_id,
            report.units_completed,
            report.flush_sizes.len()
        );
        Ok(report)
    }

    async fn verify_artifacts(payload: &StitchPayload) -> Result<()> {
        for path in [&payload.export_path, &payload.modified_load_path] {
            let exists = tokio::fs::try_exists(path)
                .await
                .with_context(|| format!("Failed to check {}", path.display()))?;
            if !exists {
                return Err(PipelineError::MissingArtifact {
                    watershed_id: payload.key.watershed_id.clone(),
                    path: path.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    async fn flush(&self, batch: &mut Batch, report: &mut AggregatorReport) -> Result<()> {
        let size = batch.len();
        debug!("Stitching {} units into {} mosaics", size, self.scenario_id);

        let export = Self::stitch_task(self.mosaics.export.clone(), std::mem::take(&mut batch.export_paths));
        let modified_load = Self::stitch_task(
            self.mosaics.modified_load.clone(),
            std::mem::take(&mut batch.modified_load_paths),
        );
        let (export_stats, modified_load_stats) = tokio::join!(export, modified_load);
        let export_stats = export_stats?;
        let modified_load_stats = modified_load_stats?;
        debug!(
            "Flushed {} export and {} modified load tiles",
            export_stats.tiles_written, modified_load_stats.tiles_written
        );

        self.store
            .update_status_batch(&batch.updates)
            .await
            .with_context(|| format!("Failed to mark {} units of {} complete", size, self.scenario_id))?;

        if self.settings.remove_workspaces {
            debug!("Removing {} workspaces", batch.workspace_dirs.len());
            for dir in &batch.workspace_dirs {
                if let Err(e) = tokio::fs::remove_dir_all(dir).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("Failed to remove workspace {}: {}", dir.display(), e);
                }
            }
        }

        *batch = Batch::default();
        report.flush_sizes.push(size);
        report.units_completed += size;
        Ok(())
    }

    async fn stitch_task(mosaic: GlobalMosaic, sources: Vec<PathBuf>) -> Result<StitchStats> {
        let name = mosaic.name();
        tokio::task::spawn_blocking(move || mosaic.stitch(&sources))
            .await
            .with_context(|| format!("Stitch task for {} panicked", name))?
            .with_context(|| format!("Failed to stitch into {}", name))
    }

    /// Runs once, after the last flush
    async fn finalize(&self) -> Result<Vec<FinalizedMosaic>> {
        info!(
            "Building overviews and compressing results for {}",
            self.scenario_id
        );
        let tasks = [&self.mosaics.export, &self.mosaics.modified_load].map(|mosaic| {
            let mosaic = mosaic.clone();
            let output_dir = self.settings.output_dir.clone();
            let factor = self.settings.aggregation_factor;
            tokio::task::spawn_blocking(move || finalize_mosaic(&mosaic, &output_dir, factor))
        });
        let mut finalized = Vec::with_capacity(tasks.len());
        for joined in futures::future::join_all(tasks).await {
            finalized.push(joined.context("Finalize task panicked")??);
        }
        Ok(finalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RetryPolicy, ScheduledUnit, StatusDb};
    use crate::raster::mosaic::tests::{coarse_grid, write_wgs84};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<StatusDb>,
        mosaics: MosaicPair,
        settings: AggregatorSettings,
        export: PathBuf,
        load: PathBuf,
    }

    async fn fixture(units: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StatusDb::new(
            dir.path().join("work_status.sqlite"),
            RetryPolicy::default(),
        ));
        store.create_schema_if_absent().await.unwrap();
        let scheduled: Vec<ScheduledUnit> = (0..units)
            .map(|i| ScheduledUnit {
                key: UnitKey::new("s1", format!("basin_{i}")),
                watershed_area: 1.0,
            })
            .collect();
        store.insert_scheduled(&scheduled).await.unwrap();

        let mosaics = MosaicPair::create_if_absent(
            &dir.path().join("mosaics"),
            "s1",
            &ModelParameters::default(),
            coarse_grid(),
        )
        .unwrap();
        let export = dir.path().join("export.tif");
        let load = dir.path().join("load.tif");
        write_wgs84(&export, 10.0, 10.0, 1, 1, &[1.0]);
        write_wgs84(&load, 10.0, 10.0, 1, 1, &[2.0]);
        let settings = AggregatorSettings {
            batch_size: 100,
            remove_workspaces: false,
            output_dir: dir.path().to_path_buf(),
            aggregation_factor: 2,
        };
        Fixture {
            _dir: dir,
            store,
            mosaics,
            settings,
            export,
            load,
        }
    }

    fn payload(f: &Fixture, i: usize) -> StitchPayload {
        StitchPayload {
            key: UnitKey::new("s1", format!("basin_{i}")),
            watershed_basename: "basin".to_string(),
            export_path: f.export.clone(),
            modified_load_path: f.load.clone(),
            workspace_dir: f.export.with_file_name(format!("ws_{i}")),
        }
    }

    #[tokio::test]
    async fn test_flushes_in_batches_and_finalizes_once() {
        let f = fixture(250).await;
        let (tx, rx) = mpsc::unbounded_channel();
        for i in 0..250 {
            tx.send(payload(&f, i)).unwrap();
        }
        drop(tx);

        let aggregator = StitchAggregator::new("s1", f.store.clone(), f.mosaics.clone(), f.settings.clone());
        let report = aggregator.run(rx).await.unwrap();
        assert_eq!(report.flush_sizes, vec![100, 100, 50]);
        assert_eq!(report.units_completed, 250);
        assert_eq!(report.finalized.len(), 2);
        assert!(report.finalized.iter().all(|m| m.compressed.exists()));

        assert_eq!(f.store.count_remaining("s1").await.unwrap(), 0);
        // cell (190, 80) on the 1 degree grid
        assert!((f.mosaics.modified_load.value_at(190, 80).unwrap() - 2.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_fatal_before_merge() {
        let f = fixture(2).await;
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(payload(&f, 0)).unwrap();
        let mut missing = payload(&f, 1);
        missing.export_path = f.export.with_file_name("never_written.tif");
        tx.send(missing).unwrap();
        drop(tx);

        let aggregator = StitchAggregator::new("s1", f.store.clone(), f.mosaics.clone(), f.settings.clone());
        let err = aggregator.run(rx).await.unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::MissingArtifact { watershed_id, .. }) => {
                assert_eq!(watershed_id, "basin_1")
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(f.mosaics.export.existing_tiles().unwrap().is_empty());
        assert_eq!(f.store.count_remaining("s1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_workspaces_removed_after_completion() {
        let mut f = fixture(1).await;
        f.settings.remove_workspaces = true;
        let p = payload(&f, 0);
        std::fs::create_dir_all(&p.workspace_dir).unwrap();
        let workspace = p.workspace_dir.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(p).unwrap();
        drop(tx);
        StitchAggregator::new("s1", f.store.clone(), f.mosaics.clone(), f.settings.clone())
            .run(rx)
            .await
            .unwrap();
        assert!(!workspace.exists());
        assert_eq!(
            f.store.status_of(&UnitKey::new("s1", "basin_0")).await.unwrap(),
            Some(WorkStatus::Complete)
        );
    }
}
