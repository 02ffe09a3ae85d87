use serde::{Deserialize, Serialize};
use surrealdb::sql::Datetime;

use crate::error::ExecutionCause;
use crate::model::{ModelRunStatus, OutputFormat, RunMode, RunStatus};
use crate::types::{AccountName, EntityKey, ModelName, ModelRunId, Month, RunId};

/// Persisted representation of a forecast run (table: `forecast_run`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Sequence-allocated run identifier.
    pub run_id: RunId,
    pub mode: RunMode,
    pub status: RunStatus,
    /// Whether this run imported and cleaned the input extract.
    pub includes_cleaning: bool,
    pub forecast_periods: u32,
    /// Prediction start month (forward) or end month (backward).
    pub prediction_month: Month,
    /// First month of the forecast horizon.
    pub forecast_start: Month,
    /// Last month of the forecast horizon.
    pub forecast_end: Month,
    /// Terminal failure cause, if any.
    #[serde(default)]
    pub cause: Option<String>,
    /// Set by `abort` from any process; honoured at model loop boundaries.
    #[serde(default)]
    pub abort_requested: bool,
    pub created_at: Option<Datetime>,
    #[serde(default)]
    pub ended_at: Option<Datetime>,
}

/// Payload used when claiming a new run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCreate {
    pub mode: RunMode,
    pub includes_cleaning: bool,
    pub forecast_periods: u32,
    pub prediction_month: Month,
    pub forecast_start: Month,
    pub forecast_end: Month,
}

/// Persisted per-account model run (table: `forecast_model_run`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRunRecord {
    pub model_run_id: ModelRunId,
    pub run_id: RunId,
    pub model_name: ModelName,
    pub account: AccountName,
    /// Position in registry order; model runs are dispatched by ascending order.
    pub dispatch_order: u32,
    pub status: ModelRunStatus,
    #[serde(default)]
    pub attempts: u32,
    /// Number of distinct entities forecast, set when the model run succeeds.
    #[serde(default)]
    pub entity_count: Option<u32>,
    /// Error summary, only present for failed model runs.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_cause: Option<ExecutionCause>,
    pub created_at: Option<Datetime>,
    #[serde(default)]
    pub started_at: Option<Datetime>,
    #[serde(default)]
    pub ended_at: Option<Datetime>,
}

/// Payload used when registering the model runs of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRunCreate {
    pub model_name: ModelName,
    pub account: AccountName,
    pub dispatch_order: u32,
    /// `Pending` for selected configs, `Skipped` for filtered ones.
    pub status: ModelRunStatus,
}

/// One predicted value of a succeeded model run (table: `forecast_data`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDataRow {
    pub model_run_id: ModelRunId,
    pub model_name: ModelName,
    pub account: AccountName,
    pub entity: EntityKey,
    pub prediction_start_month: Month,
    /// Predicted month.
    pub period: Month,
    /// Months between the prediction start and the predicted month.
    pub months_delta: i32,
    /// Value as returned by the modeling engine.
    pub prediction_raw: f64,
    /// Post-processed value (never negative).
    pub prediction: f64,
    /// Recorded sales for the period, when known.
    #[serde(default)]
    pub actual: Option<f64>,
    pub output_format: OutputFormat,
}

/// Validated and cleaned input extract row (table: `cleaned_data`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedDataRow {
    pub run_id: RunId,
    pub account: AccountName,
    pub entity: EntityKey,
    pub month: Month,
    pub sales: f64,
}

/// Aggregated production forecast (table: `dsx_output`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseRow {
    pub run_id: RunId,
    pub account: AccountName,
    pub entity: EntityKey,
    pub period: Month,
    pub value: f64,
}
