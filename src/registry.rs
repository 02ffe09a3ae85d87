//! Model config registry.
//!
//! Provides a `ModelConfig` trait for per-account forecasting configurations
//! and a `ModelConfigRegistry` holding them in dispatch order.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::core::engine::{ForecastMethod, ForecastRequest, Horizon, SeriesInput};
use crate::error::{Error, ExecutionCause, ModelExecutionError, Result};
use crate::preparation::Dataset;
use crate::types::{AccountName, ModelName};

/// Forecasting configuration of one account.
pub trait ModelConfig: Send + Sync {
    /// Registry name (e.g., "ModelConfigAccount1").
    fn name(&self) -> &ModelName;

    /// Account forecast by this config.
    fn account(&self) -> &AccountName;

    /// Check that the dataset can be forecast with this config.
    fn validate(&self, dataset: &Dataset) -> std::result::Result<(), ModelExecutionError>;

    /// Build the engine request for `horizon`.
    fn build_request(
        &self,
        dataset: &Dataset,
        horizon: Horizon,
    ) -> std::result::Result<ForecastRequest, ModelExecutionError>;
}

/// Registry entry as written in the platform config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigSpec {
    pub name: ModelName,
    pub account: AccountName,
    #[serde(flatten)]
    pub method: ForecastMethod,
    /// Overrides the history length the method needs.
    #[serde(default)]
    pub min_history: Option<usize>,
}

/// Model config driven entirely by its [`ModelConfigSpec`].
#[derive(Debug, Clone)]
pub struct AccountModelConfig {
    spec: ModelConfigSpec,
}

impl AccountModelConfig {
    pub fn new(spec: ModelConfigSpec) -> Self {
        Self { spec }
    }

    fn min_history(&self) -> usize {
        self.spec
            .min_history
            .unwrap_or_else(|| self.spec.method.min_history())
            .max(1)
    }
}

impl ModelConfig for AccountModelConfig {
    fn name(&self) -> &ModelName {
        &self.spec.name
    }

    fn account(&self) -> &AccountName {
        &self.spec.account
    }

    fn validate(&self, dataset: &Dataset) -> std::result::Result<(), ModelExecutionError> {
        self.spec
            .method
            .validate()
            .map_err(|reason| ModelExecutionError::new(ExecutionCause::MalformedInput, reason))?;
        if dataset.account(&self.spec.account).is_none() {
            return Err(ModelExecutionError::new(
                ExecutionCause::MalformedInput,
                format!("no sales history for account {}", self.spec.account),
            ));
        }
        Ok(())
    }

    fn build_request(
        &self,
        dataset: &Dataset,
        horizon: Horizon,
    ) -> std::result::Result<ForecastRequest, ModelExecutionError> {
        let entities = dataset.account(&self.spec.account).ok_or_else(|| {
            ModelExecutionError::new(
                ExecutionCause::MalformedInput,
                format!("no sales history for account {}", self.spec.account),
            )
        })?;

        let required = self.min_history();
        let mut series = Vec::new();
        for (entity, observations) in entities {
            // History runs from the first observation to the month before the
            // horizon; months without sales count as zero demand.
            let Some((&first, _)) = observations.range(..horizon.start).next() else {
                continue;
            };
            let length = first.months_until(horizon.start);
            let history: Vec<f64> = (0..length)
                .map(|offset| {
                    observations
                        .get(&first.add_months(offset))
                        .copied()
                        .unwrap_or(0.0)
                })
                .collect();
            if history.len() < required {
                debug!(model = %self.spec.name, entity = %entity, "Skipping entity with short history");
                continue;
            }
            series.push(SeriesInput {
                entity: entity.clone(),
                history,
            });
        }

        if series.is_empty() {
            return Err(ModelExecutionError::new(
                ExecutionCause::InsufficientHistory,
                format!(
                    "no entity of account {} has {required} months of history before {}",
                    self.spec.account, horizon.start
                ),
            ));
        }

        Ok(ForecastRequest {
            model_name: self.spec.name.clone(),
            account: self.spec.account.clone(),
            method: self.spec.method.clone(),
            horizon,
            series,
        })
    }
}

/// Include/exclude selection of model configs for one run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ModelFilter {
    #[default]
    All,
    Only(Vec<ModelName>),
    Exclude(Vec<ModelName>),
}

impl ModelFilter {
    /// Build a filter from CLI options. Both lists may not be given together.
    pub fn new(only: Vec<ModelName>, exclude: Vec<ModelName>) -> Result<Self> {
        match (only.is_empty(), exclude.is_empty()) {
            (true, true) => Ok(Self::All),
            (false, true) => Ok(Self::Only(only)),
            (true, false) => Ok(Self::Exclude(exclude)),
            (false, false) => Err(Error::Configuration(
                "--only-model-config and --exclude-model-config cannot be used together".to_string(),
            )),
        }
    }

    pub fn includes(&self, name: &ModelName) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(name),
            Self::Exclude(names) => !names.contains(name),
        }
    }

    fn names(&self) -> &[ModelName] {
        match self {
            Self::All => &[],
            Self::Only(names) | Self::Exclude(names) => names,
        }
    }
}

/// One registry entry and whether the current run dispatches it.
#[derive(Clone)]
pub struct Selection {
    pub config: Arc<dyn ModelConfig>,
    pub selected: bool,
}

/// Ordered registry of model configs.
#[derive(Clone, Default)]
pub struct ModelConfigRegistry {
    configs: Vec<Arc<dyn ModelConfig>>,
}

impl ModelConfigRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from platform config entries, keeping their order.
    pub fn from_specs(specs: Vec<ModelConfigSpec>) -> Result<Self> {
        specs.into_iter().try_fold(Self::new(), |registry, spec| {
            registry.register(Arc::new(AccountModelConfig::new(spec)))
        })
    }

    /// Append a model config. Names must be unique.
    pub fn register(mut self, config: Arc<dyn ModelConfig>) -> Result<Self> {
        if self.get(config.name()).is_some() {
            return Err(Error::Configuration(format!(
                "model config {} is registered twice",
                config.name()
            )));
        }
        self.configs.push(config);
        Ok(self)
    }

    pub fn get(&self, name: &ModelName) -> Option<Arc<dyn ModelConfig>> {
        self.configs.iter().find(|c| c.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<ModelName> {
        self.configs.iter().map(|c| c.name().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Reject filters naming configs that are not registered.
    pub fn check_filter(&self, filter: &ModelFilter) -> Result<()> {
        for name in filter.names() {
            if self.get(name).is_none() {
                return Err(Error::Configuration(format!(
                    "unknown model config {name}, registered configs: {}",
                    self.names()
                        .iter()
                        .map(ModelName::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
        }
        Ok(())
    }

    /// All entries in registry order, marked with whether `filter` selects them.
    pub fn select(&self, filter: &ModelFilter) -> Vec<Selection> {
        self.configs
            .iter()
            .map(|config| Selection {
                config: config.clone(),
                selected: filter.includes(config.name()),
            })
            .collect()
    }
}
