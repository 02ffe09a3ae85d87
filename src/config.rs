use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};
use tracing::info;

use crate::core::engine::Horizon;
use crate::error::{Error, Result};
use crate::model::{CleaningPolicy, OutputFormat, RunMode};
use crate::registry::{ModelConfigSpec, ModelFilter};
use crate::types::{ModelName, Month};

/// Default number of months to predict.
pub const DEFAULT_FORECAST_PERIODS: u32 = 13;
/// Longest horizon a run may request.
pub const MAX_FORECAST_PERIODS: u32 = 50;
/// Earliest month a run may refer to.
pub const EARLIEST_MONTH: u32 = 200001;

/// Static platform configuration (`platform.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Input extract imported by cleaning runs.
    pub input_path: PathBuf,
    /// Field delimiter of the input extract.
    #[serde(default = "default_delimiter")]
    pub input_delimiter: char,
    /// Default location for forecast artifacts.
    #[serde(default = "default_output_location")]
    pub output_location: PathBuf,
    #[serde(default)]
    pub model_retries: RetrySettings,
    /// Model config registry, in dispatch order.
    pub model_configs: Vec<ModelConfigSpec>,
}

fn default_delimiter() -> char {
    ','
}

fn default_output_location() -> PathBuf {
    PathBuf::from(".")
}

/// Dispatch attempts per model config.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
        }
    }
}

impl RetrySettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl PlatformConfig {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let mut cfg: PlatformConfig = serde_json::from_str(raw)?;
        cfg.input_path = PathBuf::from(expand_env_vars(&cfg.input_path.to_string_lossy()));
        cfg.output_location = PathBuf::from(expand_env_vars(&cfg.output_location.to_string_lossy()));
        if cfg.model_retries.max_attempts == 0 {
            return Err(anyhow::anyhow!("model_retries.max_attempts must be at least 1"));
        }
        Ok(cfg)
    }
}

pub fn resolve_platform_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(p) = env::var("FORECAST_CONFIG") {
        return Ok(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("forecast").join("platform.json");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = PathBuf::from("platform.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow::anyhow!(
        "Could not find platform.json (set FORECAST_CONFIG or create ./platform.json)"
    ))
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

pub fn load_platform_config() -> anyhow::Result<PlatformConfig> {
    let path = resolve_platform_config_path()?;
    let raw = fs::read_to_string(&path)?;
    let cfg = PlatformConfig::from_json(&raw)?;
    info!(
        "Loaded platform config from {} ({} model configs)",
        path.display(),
        cfg.model_configs.len()
    );
    Ok(cfg)
}

/// Run options as given on the command line. Unset values fall back to defaults.
#[derive(Debug, Clone, Default)]
pub struct RunParameters {
    pub forecast_periods: Option<u32>,
    /// Prediction start month (forward modes) or end month (backward).
    pub prediction_month: Option<Month>,
    pub output_location: Option<PathBuf>,
    pub output_format: OutputFormat,
    pub only_model_configs: Vec<ModelName>,
    pub exclude_model_configs: Vec<ModelName>,
    /// Backward runs only: import the extract again instead of reusing cleaned data.
    pub force_reload: bool,
}

/// Definitive configuration of one run.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mode: RunMode,
    pub forecast_periods: u32,
    pub prediction_month: Month,
    pub horizon: Horizon,
    pub output_location: PathBuf,
    pub output_format: OutputFormat,
    pub filter: ModelFilter,
    pub force_reload: bool,
}

impl RuntimeConfig {
    /// Validate `params` for `mode` against the current month.
    pub fn new(mode: RunMode, params: RunParameters, platform: &PlatformConfig) -> Result<Self> {
        Self::at(mode, params, platform, Month::current())
    }

    /// Like [`RuntimeConfig::new`] with an explicit current month.
    pub fn at(
        mode: RunMode,
        params: RunParameters,
        platform: &PlatformConfig,
        today: Month,
    ) -> Result<Self> {
        let forecast_periods = params.forecast_periods.unwrap_or(DEFAULT_FORECAST_PERIODS);
        if !(1..=MAX_FORECAST_PERIODS).contains(&forecast_periods) {
            return Err(Error::Configuration(format!(
                "forecast periods must be in range 1 - {MAX_FORECAST_PERIODS}, got {forecast_periods}"
            )));
        }

        if params.force_reload && mode != RunMode::Backward {
            return Err(Error::Configuration(
                "--force-reload is only supported for backward runs".to_string(),
            ));
        }

        let earliest = Month::try_from(EARLIEST_MONTH)?;
        let prediction_month = params.prediction_month.unwrap_or(today);
        let (latest, label) = match mode {
            RunMode::Backward => (today, "prediction end month"),
            RunMode::Production | RunMode::Development => {
                (today.add_months(1), "prediction start month")
            }
        };
        if prediction_month < earliest || prediction_month > latest {
            return Err(Error::Configuration(format!(
                "{label} {prediction_month} must be between {earliest} and {latest}"
            )));
        }

        let horizon = match mode {
            RunMode::Backward => Horizon::new(
                prediction_month.add_months(-(forecast_periods as i32 - 1)),
                forecast_periods,
            ),
            RunMode::Production | RunMode::Development => {
                Horizon::new(prediction_month, forecast_periods)
            }
        };

        let filter = ModelFilter::new(params.only_model_configs, params.exclude_model_configs)?;

        Ok(Self {
            mode,
            forecast_periods,
            prediction_month,
            horizon,
            output_location: params
                .output_location
                .unwrap_or_else(|| platform.output_location.clone()),
            output_format: params.output_format,
            filter,
            force_reload: params.force_reload,
        })
    }

    pub fn cleaning_policy(&self) -> CleaningPolicy {
        self.mode.cleaning_policy(self.force_reload)
    }

    pub fn log_config(&self) {
        info!(
            mode = %self.mode,
            forecast_periods = self.forecast_periods,
            prediction_month = %self.prediction_month,
            forecast_start = %self.horizon.start,
            forecast_end = %self.horizon.end(),
            output_location = %self.output_location.display(),
            output_format = %self.output_format,
            filter = ?self.filter,
            "Runtime config"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform() -> PlatformConfig {
        PlatformConfig::from_json(
            r#"{
                "input_path": "extract.csv",
                "model_configs": [
                    {"name": "ModelConfigAccount1", "account": "Account1", "method": "moving_average", "window": 3}
                ]
            }"#,
        )
        .unwrap()
    }

    fn month(value: &str) -> Month {
        Month::parse(value).unwrap()
    }

    fn params(periods: u32, prediction_month: &str) -> RunParameters {
        RunParameters {
            forecast_periods: Some(periods),
            prediction_month: Some(month(prediction_month)),
            ..Default::default()
        }
    }

    #[test]
    fn test_platform_config_defaults() {
        let cfg = platform();
        assert_eq!(cfg.model_retries.max_attempts, 1);
        assert_eq!(cfg.input_delimiter, ',');
        assert_eq!(cfg.output_location, PathBuf::from("."));
        assert_eq!(cfg.model_configs.len(), 1);
    }

    #[test]
    fn test_platform_config_rejects_zero_attempts() {
        let raw = r#"{"input_path": "x.csv", "model_retries": {"max_attempts": 0}, "model_configs": []}"#;
        assert!(PlatformConfig::from_json(raw).is_err());
    }

    #[test]
    fn test_expand_env_vars_keeps_unknown() {
        assert_eq!(
            expand_env_vars("${FORECAST_SURELY_UNSET_VAR}/data.csv"),
            "${FORECAST_SURELY_UNSET_VAR}/data.csv"
        );
    }

    #[test]
    fn test_forward_horizon() {
        let cfg = RuntimeConfig::at(
            RunMode::Production,
            params(1, "202001"),
            &platform(),
            month("202006"),
        )
        .unwrap();
        assert_eq!(cfg.horizon.start, month("202001"));
        assert_eq!(cfg.horizon.end(), month("202001"));
        assert!(!cfg.cleaning_policy().supersede_prior_actuals);
    }

    #[test]
    fn test_backward_horizon_ends_at_prediction_month() {
        let cfg = RuntimeConfig::at(
            RunMode::Backward,
            params(9, "202003"),
            &platform(),
            month("202006"),
        )
        .unwrap();
        assert_eq!(cfg.horizon.start, month("201907"));
        assert_eq!(cfg.horizon.end(), month("202003"));
    }

    #[test]
    fn test_periods_out_of_range() {
        for periods in [0, 51] {
            let err = RuntimeConfig::at(
                RunMode::Development,
                params(periods, "202001"),
                &platform(),
                month("202006"),
            )
            .unwrap_err();
            assert!(matches!(err, Error::Configuration(_)));
        }
    }

    #[test]
    fn test_month_bounds_depend_on_mode() {
        let today = month("202006");
        assert!(
            RuntimeConfig::at(RunMode::Production, params(1, "202007"), &platform(), today).is_ok()
        );
        assert!(
            RuntimeConfig::at(RunMode::Production, params(1, "202008"), &platform(), today).is_err()
        );
        assert!(
            RuntimeConfig::at(RunMode::Backward, params(1, "202007"), &platform(), today).is_err()
        );
        assert!(
            RuntimeConfig::at(RunMode::Backward, params(1, "199912"), &platform(), today).is_err()
        );
    }

    #[test]
    fn test_include_and_exclude_conflict() {
        let mut p = params(1, "202001");
        p.only_model_configs = vec![ModelName::new("ModelConfigAccount1")];
        p.exclude_model_configs = vec![ModelName::new("ModelConfigAccount2")];
        let err = RuntimeConfig::at(RunMode::Development, p, &platform(), month("202006"))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_force_reload_only_for_backward() {
        let mut p = params(1, "202001");
        p.force_reload = true;
        assert!(RuntimeConfig::at(RunMode::Production, p.clone(), &platform(), month("202006")).is_err());
        let cfg = RuntimeConfig::at(RunMode::Backward, p, &platform(), month("202006")).unwrap();
        assert!(cfg.cleaning_policy().import_extract);
    }
}
