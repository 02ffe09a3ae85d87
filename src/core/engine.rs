//! Modeling engine seam.
//!
//! The orchestrator only talks to a [`ForecastEngine`]. [`LocalEngine`] is the
//! in-process implementation shipped with the platform; remote engines plug in
//! behind the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ExecutionCause, ModelExecutionError};
use crate::types::{AccountName, EntityKey, ModelName, Month};

/// Months predicted by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizon {
    pub start: Month,
    pub periods: u32,
}

impl Horizon {
    pub fn new(start: Month, periods: u32) -> Self {
        Self { start, periods }
    }

    /// Last predicted month.
    pub fn end(&self) -> Month {
        self.start.add_months(self.periods as i32 - 1)
    }

    pub fn months(&self) -> impl Iterator<Item = Month> + '_ {
        (0..self.periods as i32).map(|offset| self.start.add_months(offset))
    }

    pub fn contains(&self, month: Month) -> bool {
        month >= self.start && month <= self.end()
    }
}

/// Forecasting method of a model config, tagged by `method` in the platform config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ForecastMethod {
    /// Mean of the last `window` observations, repeated over the horizon.
    MovingAverage { window: usize },
    /// Simple exponential smoothing with smoothing factor `alpha`.
    ExponentialSmoothing { alpha: f64 },
    /// Value of the same month one season earlier.
    SeasonalNaive {
        #[serde(default = "default_season_length")]
        season_length: usize,
    },
}

fn default_season_length() -> usize {
    12
}

impl ForecastMethod {
    /// Observations required before the method can produce a forecast.
    pub fn min_history(&self) -> usize {
        match self {
            Self::MovingAverage { window } => *window,
            Self::ExponentialSmoothing { .. } => 1,
            Self::SeasonalNaive { season_length } => *season_length,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::MovingAverage { window } if *window == 0 => {
                Err("moving average window must be positive".to_string())
            }
            Self::ExponentialSmoothing { alpha } if !(*alpha > 0.0 && *alpha < 1.0) => {
                Err(format!("smoothing factor must be between 0 and 1, got {alpha}"))
            }
            Self::SeasonalNaive { season_length } if *season_length == 0 => {
                Err("season length must be positive".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Monthly history of one entity, oldest first, ending the month before the horizon.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesInput {
    pub entity: EntityKey,
    pub history: Vec<f64>,
}

/// Everything the engine needs to forecast one account.
#[derive(Debug, Clone)]
pub struct ForecastRequest {
    pub model_name: ModelName,
    pub account: AccountName,
    pub method: ForecastMethod,
    pub horizon: Horizon,
    pub series: Vec<SeriesInput>,
}

/// Predicted values of one entity, one per horizon month.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesForecast {
    pub entity: EntityKey,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ForecastResult {
    pub series: Vec<SeriesForecast>,
}

#[async_trait]
pub trait ForecastEngine: Send + Sync {
    /// Engine name shown by `info`.
    fn name(&self) -> &str;

    async fn forecast(&self, request: &ForecastRequest)
    -> Result<ForecastResult, ModelExecutionError>;

    /// Connectivity probe. Returns a short status description.
    async fn health(&self) -> anyhow::Result<String>;
}

/// In-process statistical engine.
#[derive(Debug, Default, Clone)]
pub struct LocalEngine;

impl LocalEngine {
    pub fn new() -> Self {
        Self
    }

    fn forecast_series(
        method: &ForecastMethod,
        history: &[f64],
        periods: usize,
    ) -> Result<Vec<f64>, ModelExecutionError> {
        let required = method.min_history();
        if history.len() < required {
            return Err(ModelExecutionError::new(
                ExecutionCause::InsufficientHistory,
                format!(
                    "need at least {required} observations, got {}",
                    history.len()
                ),
            ));
        }

        let values = match method {
            ForecastMethod::MovingAverage { window } => {
                let average = history[history.len() - window..].iter().sum::<f64>() / *window as f64;
                vec![average; periods]
            }
            ForecastMethod::ExponentialSmoothing { alpha } => {
                let mut level = history[0];
                for &value in &history[1..] {
                    level = alpha * value + (1.0 - alpha) * level;
                }
                vec![level; periods]
            }
            ForecastMethod::SeasonalNaive { season_length } => {
                let season = &history[history.len() - season_length..];
                (0..periods).map(|i| season[i % season_length]).collect()
            }
        };

        if values.iter().any(|v| !v.is_finite()) {
            return Err(ModelExecutionError::new(
                ExecutionCause::NonConvergence,
                "forecast contains non-finite values",
            ));
        }
        Ok(values)
    }
}

#[async_trait]
impl ForecastEngine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    async fn forecast(
        &self,
        request: &ForecastRequest,
    ) -> Result<ForecastResult, ModelExecutionError> {
        request
            .method
            .validate()
            .map_err(|reason| ModelExecutionError::new(ExecutionCause::MalformedInput, reason))?;

        let periods = request.horizon.periods as usize;
        let mut series = Vec::with_capacity(request.series.len());
        for input in &request.series {
            let values = Self::forecast_series(&request.method, &input.history, periods).map_err(
                |err| ModelExecutionError::new(err.cause, format!("{}: {}", input.entity, err.message)),
            )?;
            series.push(SeriesForecast {
                entity: input.entity.clone(),
                values,
            });
        }

        debug!(
            model = %request.model_name,
            entities = series.len(),
            periods,
            "Local engine produced forecast"
        );
        Ok(ForecastResult { series })
    }

    async fn health(&self) -> anyhow::Result<String> {
        Ok("local engine ready".to_string())
    }
}
