use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::aggregator::StitchPayload;
use crate::error::PipelineError;
use crate::db::{UnitKey, WorkStatus, WorkStatusStore};
use crate::model::{ModelRequest, NutrientModel};

/// How a single unit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Outputs written, status COMPUTED and payload queued for stitching
    Computed,
    /// Model failed; the failure is recorded and siblings carry on
    Failed,
}

/// Runs the model for one (scenario, watershed) unit and reports the result
///
/// Only store and queue errors are returned as `Err`. A model failure is
/// recorded against the unit and reported as [`UnitOutcome::Failed`].
pub struct UnitRunner {
    store: Arc<dyn WorkStatusStore>,
    model: Arc<dyn NutrientModel>,
    stitch_tx: mpsc::UnboundedSender<StitchPayload>,
}

impl UnitRunner {
    pub fn new(
        store: Arc<dyn WorkStatusStore>,
        model: Arc<dyn NutrientModel>,
        stitch_tx: mpsc::UnboundedSender<StitchPayload>,
    ) -> Self {
        Self {
            store,
            model,
            stitch_tx,
        }
    }

    pub async fn run(&self, request: &ModelRequest) -> Result<UnitOutcome> {
        let key = UnitKey::new(&request.scenario_id, &request.watershed_id);
        debug!("{} about to be run", key);

        let outputs = match self.model.run(request).await {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!("{} failed, recording the error and skipping: {:#}", key, e);
                self.store.record_failure(&key, &format!("{e:#}")).await?;
                return Ok(UnitOutcome::Failed);
            }
        };

        debug!("{} is done", key);
        self.store.set_status(&key, WorkStatus::Computed).await?;

        let payload = StitchPayload {
            watershed_basename: request.watershed_basename.clone(),
            export_path: outputs.export_path,
            modified_load_path: outputs.modified_load_path,
            workspace_dir: request.workspace_dir.clone(),
            key,
        };
        self.stitch_tx
            .send(payload)
            .map_err(|e| PipelineError::StitchQueueClosed {
                scenario_id: request.scenario_id.clone(),
                watershed_id: e.0.key.watershed_id,
            })?;
        Ok(UnitOutcome::Computed)
    }
}
