// Model execution against the forecasting engine

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::core::engine::{ForecastEngine, Horizon};
use crate::db::ForecastDataRow;
use crate::error::{ExecutionCause, ModelExecutionError};
use crate::model::OutputFormat;
use crate::preparation::Dataset;
use crate::registry::ModelConfig;
use crate::types::ModelRunId;

/// Model run a dispatch belongs to, and how its rows are tagged.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionScope {
    pub model_run_id: ModelRunId,
    pub horizon: Horizon,
    pub output_format: OutputFormat,
}

/// Turns one model config and the run dataset into forecast rows.
///
/// Never retries; every failure is reported as a [`ModelExecutionError`].
#[derive(Clone)]
pub struct ModelExecutor {
    engine: Arc<dyn ForecastEngine>,
}

impl ModelExecutor {
    pub fn new(engine: Arc<dyn ForecastEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<dyn ForecastEngine> {
        &self.engine
    }

    pub async fn execute(
        &self,
        config: &dyn ModelConfig,
        dataset: &Dataset,
        scope: ExecutionScope,
    ) -> Result<Vec<ForecastDataRow>, ModelExecutionError> {
        config.validate(dataset)?;
        let request = config.build_request(dataset, scope.horizon)?;
        let result = self.engine.forecast(&request).await?;

        // Every requested entity needs a forecast, and nothing else.
        let requested: BTreeSet<_> = request.series.iter().map(|s| &s.entity).collect();
        let returned: BTreeSet<_> = result.series.iter().map(|s| &s.entity).collect();
        if returned.is_empty() || requested != returned {
            let missing: Vec<&str> = requested.difference(&returned).map(|e| e.as_str()).collect();
            let unexpected: Vec<&str> = returned.difference(&requested).map(|e| e.as_str()).collect();
            return Err(ModelExecutionError::new(
                ExecutionCause::NonConvergence,
                format!(
                    "engine returned {} of {} series (missing [{}], unexpected [{}])",
                    returned.len(),
                    requested.len(),
                    missing.join(", "),
                    unexpected.join(", ")
                ),
            ));
        }

        let periods = scope.horizon.periods as usize;
        let start = scope.horizon.start;
        let mut rows = Vec::with_capacity(result.series.len() * periods);
        for series in result.series {
            if series.values.len() != periods {
                return Err(ModelExecutionError::new(
                    ExecutionCause::NonConvergence,
                    format!(
                        "engine returned {} values for {}, expected {periods}",
                        series.values.len(),
                        series.entity
                    ),
                ));
            }
            for (period, raw) in scope.horizon.months().zip(series.values) {
                if !raw.is_finite() {
                    return Err(ModelExecutionError::new(
                        ExecutionCause::NonConvergence,
                        format!("non-finite prediction for {} in {period}", series.entity),
                    ));
                }
                rows.push(ForecastDataRow {
                    model_run_id: scope.model_run_id,
                    model_name: config.name().clone(),
                    account: config.account().clone(),
                    entity: series.entity.clone(),
                    prediction_start_month: start,
                    period,
                    months_delta: start.months_until(period),
                    prediction_raw: raw,
                    prediction: raw.max(0.0),
                    actual: dataset.actual(config.account(), &series.entity, period),
                    output_format: scope.output_format,
                });
            }
        }

        debug!(model = %config.name(), rows = rows.len(), "Model execution finished");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{ForecastMethod, ForecastRequest, ForecastResult, LocalEngine, SeriesForecast};
    use crate::db::CleanedDataRow;
    use crate::registry::{AccountModelConfig, ModelConfigSpec};
    use crate::types::{AccountName, EntityKey, ModelName, Month, RunId};
    use async_trait::async_trait;

    struct NegativeEngine;

    /// Engine that answers without any series.
    struct SilentEngine;

    #[async_trait]
    impl ForecastEngine for SilentEngine {
        fn name(&self) -> &str {
            "silent"
        }

        async fn forecast(&self, _: &ForecastRequest) -> Result<ForecastResult, ModelExecutionError> {
            Ok(ForecastResult::default())
        }

        async fn health(&self) -> anyhow::Result<String> {
            Ok("ok".to_string())
        }
    }

    #[async_trait]
    impl ForecastEngine for NegativeEngine {
        fn name(&self) -> &str {
            "negative"
        }

        async fn forecast(
            &self,
            request: &ForecastRequest,
        ) -> Result<ForecastResult, ModelExecutionError> {
            Ok(ForecastResult {
                series: request
                    .series
                    .iter()
                    .map(|s| SeriesForecast {
                        entity: s.entity.clone(),
                        values: vec![-2.5; request.horizon.periods as usize],
                    })
                    .collect(),
            })
        }

        async fn health(&self) -> anyhow::Result<String> {
            Ok("ok".to_string())
        }
    }

    fn config() -> AccountModelConfig {
        AccountModelConfig::new(ModelConfigSpec {
            name: ModelName::new("ModelConfigAccount1"),
            account: AccountName::new("Account1"),
            method: ForecastMethod::MovingAverage { window: 2 },
            min_history: None,
        })
    }

    fn dataset() -> Dataset {
        let row = |month: &str, sales: f64| CleanedDataRow {
            run_id: RunId(1),
            account: AccountName::new("Account1"),
            entity: EntityKey::new("C1:1"),
            month: Month::parse(month).unwrap(),
            sales,
        };
        Dataset::from_rows(&[row("201911", 2.0), row("201912", 4.0), row("202001", 7.0)])
    }

    fn scope(start: &str, periods: u32) -> ExecutionScope {
        ExecutionScope {
            model_run_id: ModelRunId(11),
            horizon: Horizon::new(Month::parse(start).unwrap(), periods),
            output_format: OutputFormat::Csv,
        }
    }

    #[tokio::test]
    async fn test_execute_produces_row_per_entity_and_period() {
        let executor = ModelExecutor::new(Arc::new(LocalEngine::new()));
        let rows = executor
            .execute(&config(), &dataset(), scope("202001", 2))
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].prediction, 3.0);
        assert_eq!(rows[0].months_delta, 0);
        assert_eq!(rows[1].months_delta, 1);
        assert_eq!(rows[0].actual, Some(7.0));
        assert_eq!(rows[1].actual, None);
        assert!(rows.iter().all(|r| r.model_run_id == ModelRunId(11)));
    }

    #[tokio::test]
    async fn test_negative_predictions_are_clamped() {
        let executor = ModelExecutor::new(Arc::new(NegativeEngine));
        let rows = executor
            .execute(&config(), &dataset(), scope("202001", 1))
            .await
            .unwrap();
        assert_eq!(rows[0].prediction_raw, -2.5);
        assert_eq!(rows[0].prediction, 0.0);
    }

    #[tokio::test]
    async fn test_insufficient_history_is_reported() {
        let executor = ModelExecutor::new(Arc::new(LocalEngine::new()));
        let err = executor
            .execute(&config(), &dataset(), scope("201912", 1))
            .await
            .unwrap_err();
        assert_eq!(err.cause, ExecutionCause::InsufficientHistory);
    }

    #[tokio::test]
    async fn test_missing_series_is_non_convergence() {
        let executor = ModelExecutor::new(Arc::new(SilentEngine));
        let err = executor
            .execute(&config(), &dataset(), scope("202001", 1))
            .await
            .unwrap_err();
        assert_eq!(err.cause, ExecutionCause::NonConvergence);
        assert!(err.message.contains("C1:1"));
    }
}
