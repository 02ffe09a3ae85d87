// Core modules
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod types;

// Run orchestration
pub mod compare;
pub mod core;
pub mod orchestrator;
pub mod output;
pub mod preparation;
pub mod registry;
pub mod services;

// Re-export key types and functions
pub use config::{PlatformConfig, RunParameters, RuntimeConfig, load_platform_config};
pub use db::{DatabaseConfig, RunRecordStore, create_connection, drop_tables, ensure_schema};
pub use error::{DataException, Error, ExecutionCause, ModelExecutionError, Result};
pub use model::{DatabaseKind, ModelRunStatus, OutputFormat, RunMode, RunStatus};
pub use types::{AccountName, EntityKey, ModelName, ModelRunId, Month, RunId};

pub use compare::{ComparisonReport, compare_results, compare_structure, compare_structure_database};
pub use core::{ForecastEngine, LocalEngine, ModelExecutor};
pub use orchestrator::{AbortHandle, Orchestrator, RetryPolicy, RunReport};
pub use output::{OutputSummary, OutputWriter};
pub use registry::{ModelConfig, ModelConfigRegistry, ModelFilter};
pub use services::Services;
