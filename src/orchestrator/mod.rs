//! Run orchestration - drives one forecast run from request to a terminal
//! status while keeping run and model run bookkeeping consistent.
//!
//! Phases: claim (`start`), prepare data, dispatch every selected model config
//! in registry order, then aggregate and hand off to the output writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{PlatformConfig, RetrySettings, RunParameters, RuntimeConfig};
use crate::core::engine::ForecastEngine;
use crate::core::executor::{ExecutionScope, ModelExecutor};
use crate::db::{ModelRunCreate, ModelRunRecord, RunCreate, RunRecordStore};
use crate::error::{Error, ExecutionCause, ModelExecutionError, Result};
use crate::model::{ModelRunStatus, RunMode, RunStatus};
use crate::output::{OutputSummary, OutputWriter};
use crate::preparation::{DataLoader, DataPreparation, Dataset};
use crate::registry::{ModelConfig, ModelConfigRegistry};
use crate::types::{ModelName, RunId};


/// Cancellation flag of one run. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    requested: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop dispatching after the in-flight model run.
    pub fn abort(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// How often a model config is dispatched when the engine fails transiently.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff: settings.backoff(),
        }
    }
}

/// Outcome of a driven run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub mode: RunMode,
    pub status: RunStatus,
    pub cause: Option<String>,
    /// All model runs in dispatch order.
    pub model_runs: Vec<ModelRunRecord>,
    pub output: Option<OutputSummary>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Model runs that failed, to be reported even when the run completed.
    pub fn failed_models(&self) -> Vec<&ModelRunRecord> {
        self.model_runs
            .iter()
            .filter(|m| m.status == ModelRunStatus::Failed)
            .collect()
    }

    pub fn count(&self, status: ModelRunStatus) -> usize {
        self.model_runs.iter().filter(|m| m.status == status).count()
    }
}

/// A claimed run waiting to be driven.
struct RunPlan {
    config: RuntimeConfig,
    abort: AbortHandle,
}

/// The run state machine.
pub struct Orchestrator {
    store: RunRecordStore,
    platform: PlatformConfig,
    registry: ModelConfigRegistry,
    preparation: DataPreparation,
    executor: ModelExecutor,
    output: OutputWriter,
    retry: RetryPolicy,
    plans: Mutex<HashMap<RunId, RunPlan>>,
}

impl Orchestrator {
    pub fn new(
        store: RunRecordStore,
        platform: PlatformConfig,
        registry: ModelConfigRegistry,
        engine: Arc<dyn ForecastEngine>,
    ) -> Self {
        let loader = DataLoader::new(platform.input_path.clone())
            .with_delimiter(platform.input_delimiter as u8);
        Self {
            preparation: DataPreparation::new(store.clone(), loader),
            executor: ModelExecutor::new(engine),
            output: OutputWriter::new(store.clone()),
            retry: platform.model_retries.into(),
            registry,
            platform,
            store,
            plans: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &RunRecordStore {
        &self.store
    }

    pub fn registry(&self) -> &ModelConfigRegistry {
        &self.registry
    }

    /// Validate the parameters and claim a new run.
    ///
    /// Fails with [`Error::Configuration`] for invalid parameters and with
    /// [`Error::Conflict`] while another run is active; no run is created in
    /// either case.
    pub async fn start(&self, mode: RunMode, params: RunParameters) -> Result<RunId> {
        let config = RuntimeConfig::new(mode, params, &self.platform)?;
        self.registry.check_filter(&config.filter)?;

        let run_id = self
            .store
            .try_begin_run(&RunCreate {
                mode,
                includes_cleaning: config.cleaning_policy().import_extract,
                forecast_periods: config.forecast_periods,
                prediction_month: config.prediction_month,
                forecast_start: config.horizon.start,
                forecast_end: config.horizon.end(),
            })
            .await?;

        config.log_config();
        self.plans.lock().await.insert(
            run_id,
            RunPlan {
                config,
                abort: AbortHandle::new(),
            },
        );
        Ok(run_id)
    }

    /// Cancellation handle of a started run that has not finished yet.
    pub async fn abort_handle(&self, run_id: RunId) -> Option<AbortHandle> {
        self.plans.lock().await.get(&run_id).map(|p| p.abort.clone())
    }

    /// Request cancellation of `run_id`.
    ///
    /// Takes effect before the next model config is dispatched. Also works for
    /// runs driven by another process. Returns `false` if the run is not active.
    pub async fn abort(&self, run_id: RunId) -> Result<bool> {
        if let Some(handle) = self.abort_handle(run_id).await {
            handle.abort();
        }
        self.store.request_abort(run_id).await
    }

    /// Start and drive a run to its terminal status.
    pub async fn run(&self, mode: RunMode, params: RunParameters) -> Result<RunReport> {
        let run_id = self.start(mode, params).await?;
        self.execute(run_id).await
    }

    /// Drive a started run to its terminal status.
    ///
    /// Run-level errors are recorded as the run's failure cause before they are
    /// returned. If the store itself is unreachable the run keeps its last
    /// committed status.
    pub async fn execute(&self, run_id: RunId) -> Result<RunReport> {
        let plan = self.plans.lock().await.remove(&run_id).ok_or_else(|| {
            Error::Configuration(format!("run {run_id} was not started by this orchestrator"))
        })?;

        match self.drive(run_id, &plan).await {
            Ok(report) => Ok(report),
            Err(Error::RunClosed(reason)) => {
                warn!(run_id = %run_id, "Forecast run closed elsewhere: {reason}");
                self.finish_aborted(run_id, plan.config.mode).await
            }
            Err(err) => {
                error!(run_id = %run_id, kind = err.kind(), "Forecast run failed: {err}");
                if err.store_reachable() {
                    let cause = format!("{}: {err}", err.kind());
                    if let Err(e) = self.store.transition_run(run_id, RunStatus::Failed, Some(cause)).await {
                        warn!(run_id = %run_id, "Could not record run failure: {e}");
                    }
                } else {
                    warn!(run_id = %run_id, "Run store unreachable, run keeps its last committed status");
                }
                Err(err)
            }
        }
    }

    async fn drive(&self, run_id: RunId, plan: &RunPlan) -> Result<RunReport> {
        let config = &plan.config;

        // Phase 1: prepare
        self.store.transition_run(run_id, RunStatus::Preparing, None).await?;
        let dataset = self.preparation.prepare(run_id, config.cleaning_policy()).await?;

        // Phase 2: execute
        self.store.transition_run(run_id, RunStatus::Running, None).await?;
        let selection = self.registry.select(&config.filter);
        let entries = selection
            .iter()
            .enumerate()
            .map(|(order, s)| ModelRunCreate {
                model_name: s.config.name().clone(),
                account: s.config.account().clone(),
                dispatch_order: order as u32,
                status: if s.selected {
                    ModelRunStatus::Pending
                } else {
                    ModelRunStatus::Skipped
                },
            })
            .collect();
        let model_runs = self.store.create_model_runs(run_id, entries).await?;
        let configs: HashMap<ModelName, Arc<dyn ModelConfig>> = selection
            .into_iter()
            .map(|s| (s.config.name().clone(), s.config))
            .collect();

        for model_run in model_runs.iter().filter(|m| m.status == ModelRunStatus::Pending) {
            if self.abort_requested(run_id, &plan.abort).await? {
                return self.finish_aborted(run_id, config.mode).await;
            }
            let Some(model_config) = configs.get(&model_run.model_name) else {
                return Err(Error::InvariantViolation(format!(
                    "model run {} has no registry entry",
                    model_run.model_name
                )));
            };
            self.dispatch(run_id, model_run, model_config.as_ref(), &dataset, config)
                .await?;
        }

        // An abort during the last dispatch (or during preparation, with
        // nothing selected) still wins over finalization.
        if self.abort_requested(run_id, &plan.abort).await? {
            return self.finish_aborted(run_id, config.mode).await;
        }

        // Phase 3: finalize
        self.finalize(run_id, config).await
    }

    async fn abort_requested(&self, run_id: RunId, handle: &AbortHandle) -> Result<bool> {
        Ok(handle.is_aborted() || self.store.abort_requested(run_id).await?)
    }

    /// Run one model config to a terminal model run status.
    async fn dispatch(
        &self,
        run_id: RunId,
        model_run: &ModelRunRecord,
        model_config: &dyn ModelConfig,
        dataset: &Dataset,
        config: &RuntimeConfig,
    ) -> Result<ModelRunStatus> {
        let name = &model_run.model_name;
        self.store
            .transition_model_run(run_id, name, ModelRunStatus::Running, None)
            .await?;

        let scope = ExecutionScope {
            model_run_id: model_run.model_run_id,
            horizon: config.horizon,
            output_format: config.output_format,
        };

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            self.store.record_attempt(model_run.model_run_id).await?;
            match self.executor.execute(model_config, dataset, scope).await {
                Ok(rows) => break Ok(rows),
                Err(err) if err.cause.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(
                        run_id = %run_id,
                        model = %name,
                        attempt,
                        "Model execution failed ({}), retrying",
                        err.cause
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(err) => break Err(err),
            }
        };

        let failure = match outcome {
            Ok(rows) => match self.store.write_forecast_data(model_run.model_run_id, rows).await {
                Ok(count) => {
                    info!(run_id = %run_id, model = %name, rows = count, "Model run succeeded");
                    return Ok(ModelRunStatus::Succeeded);
                }
                // Rejected rows stay with this model run; other errors end the run.
                Err(Error::InvariantViolation(reason)) => {
                    ModelExecutionError::new(ExecutionCause::MalformedInput, reason)
                }
                Err(err) => return Err(err),
            },
            Err(err) => err,
        };

        warn!(run_id = %run_id, model = %name, cause = %failure.cause, "Model run failed: {}", failure.message);
        self.store
            .transition_model_run(run_id, name, ModelRunStatus::Failed, Some(&failure))
            .await?;
        Ok(ModelRunStatus::Failed)
    }

    /// Close an aborted run. A run already ended elsewhere keeps that end state.
    async fn finish_aborted(&self, run_id: RunId, mode: RunMode) -> Result<RunReport> {
        let (status, cause) = match self.store.get_run(run_id).await? {
            Some(run) if run.status.is_terminal() => {
                warn!(run_id = %run_id, status = %run.status, "Forecast run already ended elsewhere");
                (run.status, run.cause)
            }
            _ => {
                let cause = "aborted by request".to_string();
                self.store
                    .transition_run(run_id, RunStatus::Aborted, Some(cause.clone()))
                    .await?;
                warn!(run_id = %run_id, "Forecast run aborted");
                (RunStatus::Aborted, Some(cause))
            }
        };
        Ok(RunReport {
            run_id,
            mode,
            status,
            cause,
            model_runs: self.store.list_model_runs(run_id).await?,
            output: None,
        })
    }

    async fn finalize(&self, run_id: RunId, config: &RuntimeConfig) -> Result<RunReport> {
        let model_runs = self.store.list_model_runs(run_id).await?;
        if let Some(open) = model_runs.iter().find(|m| !m.status.is_terminal()) {
            return Err(Error::InvariantViolation(format!(
                "model run {} is still {} at finalization",
                open.model_name, open.status
            )));
        }

        let succeeded = model_runs
            .iter()
            .filter(|m| m.status == ModelRunStatus::Succeeded)
            .count();
        if succeeded == 0 {
            let cause = "no model run succeeded".to_string();
            self.store
                .transition_run(run_id, RunStatus::Failed, Some(cause.clone()))
                .await?;
            warn!(run_id = %run_id, "Forecast run failed: {cause}");
            return Ok(RunReport {
                run_id,
                mode: config.mode,
                status: RunStatus::Failed,
                cause: Some(cause),
                model_runs,
                output: None,
            });
        }

        let rows = self.store.forecast_data_for_run(run_id).await?;
        let output = self.output.write(run_id, config, &model_runs, rows).await?;
        self.store.transition_run(run_id, RunStatus::Completed, None).await?;

        let failed = model_runs.len()
            - succeeded
            - model_runs
                .iter()
                .filter(|m| m.status == ModelRunStatus::Skipped)
                .count();
        info!(run_id = %run_id, succeeded, failed, "Forecast run completed");

        Ok(RunReport {
            run_id,
            mode: config.mode,
            status: RunStatus::Completed,
            cause: None,
            model_runs,
            output: Some(output),
        })
    }
}
