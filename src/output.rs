//! Forecast artifacts of finished runs.
//!
//! Production runs feed the warehouse table; development and backward runs
//! write one file per succeeded model run plus a `manifest.json` describing
//! the run into `<output-location>/run_<id>/`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::RuntimeConfig;
use crate::db::{ForecastDataRow, ModelRunRecord, RunRecordStore, WarehouseRow};
use crate::error::{Error, Result};
use crate::model::{ModelRunStatus, OutputFormat, RunMode};
use crate::types::{AccountName, EntityKey, ModelName, Month, RunId};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Description of the artifacts of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: RunId,
    pub mode: RunMode,
    pub forecast_periods: u32,
    pub prediction_month: Month,
    pub forecast_start: Month,
    pub forecast_end: Month,
    pub output_format: OutputFormat,
    pub models: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub model_name: ModelName,
    pub account: AccountName,
    pub status: ModelRunStatus,
    /// File name inside the run directory, for succeeded model runs.
    pub file: Option<String>,
    pub rows: usize,
}

/// Where the artifacts of a run went.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSummary {
    Warehouse { rows: usize },
    Files { directory: PathBuf, files: usize },
}

/// Directory holding the artifacts of `run_id`.
pub fn run_directory(output_location: &Path, run_id: RunId) -> PathBuf {
    output_location.join(format!("run_{run_id}"))
}

#[derive(Clone)]
pub struct OutputWriter {
    store: RunRecordStore,
}

impl OutputWriter {
    pub fn new(store: RunRecordStore) -> Self {
        Self { store }
    }

    /// Export the aggregated forecast of a run.
    ///
    /// `rows` must only hold data of succeeded model runs.
    pub async fn write(
        &self,
        run_id: RunId,
        config: &RuntimeConfig,
        model_runs: &[ModelRunRecord],
        rows: Vec<ForecastDataRow>,
    ) -> Result<OutputSummary> {
        match config.mode {
            RunMode::Production => {
                let aggregated = aggregate(run_id, &rows);
                let count = self.store.write_warehouse_output(aggregated).await?;
                info!(run_id = %run_id, rows = count, "Wrote forecast to warehouse");
                Ok(OutputSummary::Warehouse { rows: count })
            }
            RunMode::Development | RunMode::Backward => {
                let directory = run_directory(&config.output_location, run_id);
                let manifest = Manifest {
                    run_id,
                    mode: config.mode,
                    forecast_periods: config.forecast_periods,
                    prediction_month: config.prediction_month,
                    forecast_start: config.horizon.start,
                    forecast_end: config.horizon.end(),
                    output_format: config.output_format,
                    models: Vec::new(),
                };
                let model_runs = model_runs.to_vec();
                let dir = directory.clone();
                let files = tokio::task::spawn_blocking(move || {
                    write_files(&dir, manifest, &model_runs, rows)
                })
                .await
                .map_err(|e| Error::Output(format!("output writer stopped: {e}")))??;
                info!(run_id = %run_id, files, "Wrote forecast files to {}", directory.display());
                Ok(OutputSummary::Files { directory, files })
            }
        }
    }
}

/// Sum predictions per account, entity and period.
fn aggregate(run_id: RunId, rows: &[ForecastDataRow]) -> Vec<WarehouseRow> {
    let mut totals: BTreeMap<(AccountName, EntityKey, Month), f64> = BTreeMap::new();
    for row in rows {
        *totals
            .entry((row.account.clone(), row.entity.clone(), row.period))
            .or_insert(0.0) += row.prediction;
    }
    totals
        .into_iter()
        .map(|((account, entity, period), value)| WarehouseRow {
            run_id,
            account,
            entity,
            period,
            value,
        })
        .collect()
}

fn write_files(
    directory: &Path,
    mut manifest: Manifest,
    model_runs: &[ModelRunRecord],
    rows: Vec<ForecastDataRow>,
) -> Result<usize> {
    fs::create_dir_all(directory)?;

    let mut by_model: BTreeMap<ModelName, Vec<ForecastDataRow>> = BTreeMap::new();
    for row in rows {
        by_model.entry(row.model_name.clone()).or_default().push(row);
    }

    let mut files = 0;
    for model_run in model_runs {
        let mut entry = ManifestEntry {
            model_name: model_run.model_name.clone(),
            account: model_run.account.clone(),
            status: model_run.status,
            file: None,
            rows: 0,
        };
        if model_run.status == ModelRunStatus::Succeeded {
            let data = by_model.remove(&model_run.model_name).unwrap_or_default();
            let name = format!("{}.{}", model_run.model_name, manifest.output_format.extension());
            write_artifact(&directory.join(&name), manifest.output_format, &data)?;
            entry.file = Some(name);
            entry.rows = data.len();
            files += 1;
        }
        manifest.models.push(entry);
    }

    let raw = serde_json::to_string_pretty(&manifest)
        .map_err(|e| Error::Output(format!("cannot serialize manifest: {e}")))?;
    fs::write(directory.join(MANIFEST_FILE), raw)?;
    Ok(files)
}

fn write_artifact(path: &Path, format: OutputFormat, rows: &[ForecastDataRow]) -> Result<()> {
    match format {
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_path(path)
                .map_err(|e| Error::Output(format!("{}: {e}", path.display())))?;
            for row in rows {
                writer
                    .serialize(row)
                    .map_err(|e| Error::Output(format!("{}: {e}", path.display())))?;
            }
            writer.flush()?;
        }
        OutputFormat::Json => {
            let raw = serde_json::to_string_pretty(rows)
                .map_err(|e| Error::Output(format!("{}: {e}", path.display())))?;
            fs::write(path, raw)?;
        }
    }
    Ok(())
}

/// Read the forecast rows of an artifact written by [`OutputWriter`].
pub fn read_artifact(path: &Path, format: OutputFormat) -> Result<Vec<ForecastDataRow>> {
    match format {
        OutputFormat::Csv => {
            let mut reader = csv::Reader::from_path(path)
                .map_err(|e| Error::Output(format!("{}: {e}", path.display())))?;
            reader
                .deserialize()
                .collect::<std::result::Result<Vec<ForecastDataRow>, _>>()
                .map_err(|e| Error::Output(format!("{}: {e}", path.display())))
        }
        OutputFormat::Json => {
            let raw = fs::read_to_string(path)?;
            serde_json::from_str(&raw).map_err(|e| Error::Output(format!("{}: {e}", path.display())))
        }
    }
}

pub fn read_manifest(directory: &Path) -> Result<Manifest> {
    let path = directory.join(MANIFEST_FILE);
    let raw = fs::read_to_string(&path)?;
    serde_json::from_str(&raw).map_err(|e| Error::Output(format!("{}: {e}", path.display())))
}
