//! Boundary to the external nutrient delivery model
//!
//! The pipeline treats the model as a black box: given a watershed, the
//! parameters, input rasters and lookup tables it either writes the two
//! output rasters named in the request or fails.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::debug;

use crate::config::{FLOW_THRESHOLD, K_VAL, MAX_PIXEL_FILL_COUNT, RETENTION_LENGTH_M, TARGET_CELL_LENGTH_M};
use crate::formats::{LookupTables, Watershed};

/// File the command adapter writes the request to, inside the unit workspace
pub const REQUEST_FILE_NAME: &str = "ndr_request.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoutingAlgorithm {
    #[default]
    D8,
    #[serde(rename = "MFD")]
    Mfd,
}

impl RoutingAlgorithm {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "D8" => Ok(RoutingAlgorithm::D8),
            "MFD" => Ok(RoutingAlgorithm::Mfd),
            _ => bail!("Unsupported routing algorithm: {}. Supported: D8, MFD", s),
        }
    }
}

impl fmt::Display for RoutingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingAlgorithm::D8 => f.write_str("D8"),
            RoutingAlgorithm::Mfd => f.write_str("MFD"),
        }
    }
}

/// Global simulation parameters shared by every unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub retention_length_m: f64,
    pub k_val: f64,
    pub target_cell_length_m: f64,
    pub flow_threshold: u32,
    pub max_pixel_fill_count: u32,
    pub routing_algorithm: RoutingAlgorithm,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            retention_length_m: RETENTION_LENGTH_M,
            k_val: K_VAL,
            target_cell_length_m: TARGET_CELL_LENGTH_M,
            flow_threshold: FLOW_THRESHOLD,
            max_pixel_fill_count: MAX_PIXEL_FILL_COUNT,
            routing_algorithm: RoutingAlgorithm::D8,
        }
    }
}

impl ModelParameters {
    /// Name of a scenario's output mosaic, e.g. `baseline_300.0_D8_export`
    pub fn output_name(&self, scenario_id: &str, kind: OutputKind) -> String {
        format!(
            "{}_{:.1}_{}_{}",
            scenario_id,
            self.target_cell_length_m,
            self.routing_algorithm,
            kind.suffix()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Export,
    ModifiedLoad,
}

impl OutputKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            OutputKind::Export => "export",
            OutputKind::ModifiedLoad => "modified_load",
        }
    }
}

/// Input rasters for one scenario
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInputs {
    pub dem: PathBuf,
    pub lulc: PathBuf,
    pub precip: PathBuf,
    pub fertilizer: PathBuf,
}

/// Everything the model needs to simulate one (scenario, watershed) unit
#[derive(Debug, Clone, Serialize)]
pub struct ModelRequest {
    pub scenario_id: String,
    pub watershed_id: String,
    pub watershed_basename: String,
    pub watershed_fid: u64,
    pub watershed_vector: PathBuf,
    pub parameters: ModelParameters,
    pub inputs: ModelInputs,
    pub lookup_tables: LookupTables,
    pub export_path: PathBuf,
    pub modified_load_path: PathBuf,
    pub workspace_dir: PathBuf,
}

impl ModelRequest {
    /// Build the request for `watershed`, placing outputs in `workspace_dir`
    pub fn new(
        scenario_id: &str,
        watershed: &Watershed,
        parameters: ModelParameters,
        inputs: ModelInputs,
        lookup_tables: LookupTables,
        workspace_dir: PathBuf,
    ) -> Self {
        let export_path =
            workspace_dir.join(format!("{}.tif", parameters.output_name(scenario_id, OutputKind::Export)));
        let modified_load_path = workspace_dir.join(format!(
            "{}.tif",
            parameters.output_name(scenario_id, OutputKind::ModifiedLoad)
        ));
        Self {
            scenario_id: scenario_id.to_string(),
            watershed_id: watershed.watershed_id(),
            watershed_basename: watershed.basename.clone(),
            watershed_fid: watershed.fid,
            watershed_vector: watershed.vector_path.clone(),
            parameters,
            inputs,
            lookup_tables,
            export_path,
            modified_load_path,
            workspace_dir,
        }
    }
}

/// The two rasters a successful model run leaves behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelOutputs {
    pub export_path: PathBuf,
    pub modified_load_path: PathBuf,
}

#[async_trait]
pub trait NutrientModel: Send + Sync {
    async fn run(&self, request: &ModelRequest) -> Result<ModelOutputs>;
}

/// Runs an external executable per unit
///
/// The request is written as JSON to `<workspace>/ndr_request.json` and its
/// path is passed as the last argument. A non-zero exit fails the unit with
/// the process's stderr.
#[derive(Debug, Clone)]
pub struct CommandModel {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandModel {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl NutrientModel for CommandModel {
    async fn run(&self, request: &ModelRequest) -> Result<ModelOutputs> {
        tokio::fs::create_dir_all(&request.workspace_dir)
            .await
            .with_context(|| format!("Failed to create workspace {}", request.workspace_dir.display()))?;
        let request_path = request.workspace_dir.join(REQUEST_FILE_NAME);
        let body = serde_json::to_vec_pretty(request).context("Failed to serialize model request")?;
        tokio::fs::write(&request_path, body)
            .await
            .with_context(|| format!("Failed to write {}", request_path.display()))?;

        debug!("{} running {}", request.watershed_id, self.program.display());
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&request_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to start model command {}", self.program.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "model command exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        Ok(ModelOutputs {
            export_path: request.export_path.clone(),
            modified_load_path: request.modified_load_path.clone(),
        })
    }
}
