use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// Kind of forecast run executed by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Forward-looking forecast stored internally and in the warehouse.
    Production,
    /// Forward-looking forecast stored internally and as files.
    Development,
    /// Historical replay validated against recorded actuals.
    Backward,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
            Self::Backward => "backward",
        }
    }

    /// Data cleaning policy for this mode.
    ///
    /// `force_reload` only matters for backward runs, which otherwise reuse the
    /// newest cleaned import.
    pub fn cleaning_policy(&self, force_reload: bool) -> CleaningPolicy {
        match self {
            Self::Production => CleaningPolicy {
                import_extract: true,
                supersede_prior_actuals: false,
            },
            Self::Development => CleaningPolicy {
                import_extract: true,
                supersede_prior_actuals: true,
            },
            Self::Backward => CleaningPolicy {
                import_extract: force_reload,
                supersede_prior_actuals: true,
            },
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What data preparation does before models are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleaningPolicy {
    /// Load, validate and clean the input extract, replacing older imports.
    pub import_extract: bool,
    /// Overwrite actuals of earlier forecasts with the cleaned values.
    pub supersede_prior_actuals: bool,
}

/// Status of a forecast run.
///
/// `Pending -> Preparing -> Running -> {Completed | Failed | Aborted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Preparing,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub const TERMINAL: [RunStatus; 3] = [Self::Completed, Self::Failed, Self::Aborted];
    pub const ACTIVE: [RunStatus; 3] = [Self::Pending, Self::Preparing, Self::Running];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Statuses a run may be in right before moving to `self`.
    pub fn allowed_predecessors(&self) -> &'static [RunStatus] {
        match self {
            Self::Pending => &[],
            Self::Preparing => &[Self::Pending],
            Self::Running => &[Self::Preparing],
            Self::Completed => &[Self::Running],
            Self::Failed | Self::Aborted => &Self::ACTIVE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a per-account model run.
///
/// `Pending -> Running -> {Succeeded | Failed}`, or `Pending -> Skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl ModelRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn allowed_predecessors(&self) -> &'static [ModelRunStatus] {
        match self {
            Self::Pending => &[],
            Self::Running | Self::Skipped => &[Self::Pending],
            Self::Succeeded | Self::Failed => &[Self::Running],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ModelRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File format for forecast artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Csv,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn parse(value: &str) -> Result<Self, Error> {
        match value.to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(Error::Configuration(format!(
                "Unsupported output format: {other}. Value must be 'csv' or 'json'"
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical databases used by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    /// Run records, model runs, forecast data and cleaned data.
    Internal,
    /// Warehouse table receiving production forecasts.
    DsxWrite,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::DsxWrite => "dsx_write",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleaning_policy_per_mode() {
        let production = RunMode::Production.cleaning_policy(false);
        assert!(production.import_extract);
        assert!(!production.supersede_prior_actuals);

        let development = RunMode::Development.cleaning_policy(false);
        assert!(development.import_extract);
        assert!(development.supersede_prior_actuals);

        assert!(!RunMode::Backward.cleaning_policy(false).import_extract);
        assert!(RunMode::Backward.cleaning_policy(true).import_extract);
        assert!(RunMode::Backward.cleaning_policy(true).supersede_prior_actuals);
    }

    #[test]
    fn test_terminal_run_statuses_have_no_successors() {
        for terminal in RunStatus::TERMINAL {
            for target in [
                RunStatus::Pending,
                RunStatus::Preparing,
                RunStatus::Running,
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::Aborted,
            ] {
                assert!(!target.allowed_predecessors().contains(&terminal));
            }
        }
    }

    #[test]
    fn test_model_run_status_is_forward_only() {
        assert_eq!(
            ModelRunStatus::Succeeded.allowed_predecessors(),
            &[ModelRunStatus::Running]
        );
        assert!(!ModelRunStatus::Running
            .allowed_predecessors()
            .contains(&ModelRunStatus::Failed));
        assert_eq!(
            ModelRunStatus::Skipped.allowed_predecessors(),
            &[ModelRunStatus::Pending]
        );
    }

    #[test]
    fn test_status_serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(
            serde_json::to_string(&ModelRunStatus::Skipped).unwrap(),
            "\"skipped\""
        );
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("CSV").unwrap(), OutputFormat::Csv);
        assert_eq!(OutputFormat::parse("json").unwrap(), OutputFormat::Json);
        assert!(OutputFormat::parse("xlsx").is_err());
    }
}
