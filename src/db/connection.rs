use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use tracing::info;

use crate::error::Result;
use crate::model::DatabaseKind;

pub type Db = Surreal<Any>;

/// Entry for each CLI run.
pub const FORECAST_RUN_TABLE: &str = "forecast_run";
/// Account model config run (within a CLI run).
pub const FORECAST_MODEL_RUN_TABLE: &str = "forecast_model_run";
/// Prediction data for all accounts and runs.
pub const FORECAST_DATA_TABLE: &str = "forecast_data";
/// Cleaned input data, replaced by every importing run.
pub const CLEANED_DATA_TABLE: &str = "cleaned_data";
/// Single-row claim held by the active run.
pub const RUN_LOCK_TABLE: &str = "run_lock";
/// Id sequences for runs and model runs.
pub const RUN_SEQUENCE_TABLE: &str = "run_sequence";
/// Warehouse output of production runs.
pub const DSX_OUTPUT_TABLE: &str = "dsx_output";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("FORECAST_DB_URL")
                .unwrap_or_else(|_| "surrealkv://forecast_store".to_string()),
            namespace: env::var("FORECAST_DB_NAMESPACE")
                .unwrap_or_else(|_| "forecasting".to_string()),
            database: env::var("FORECAST_DB_DATABASE")
                .unwrap_or_else(|_| "platform".to_string()),
            username: env::var("FORECAST_DB_USERNAME").ok(),
            password: env::var("FORECAST_DB_PASSWORD").ok(),
        }
    }
}

impl DatabaseConfig {
    /// In-memory database, used by tests and dry runs.
    pub fn memory() -> Self {
        Self {
            url: "memory".to_string(),
            ..Default::default()
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

fn schema_queries(kind: DatabaseKind) -> Vec<&'static str> {
    match kind {
        DatabaseKind::Internal => vec![
            "DEFINE TABLE IF NOT EXISTS forecast_run SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS forecast_run_id ON TABLE forecast_run COLUMNS run_id UNIQUE;
             DEFINE INDEX IF NOT EXISTS forecast_run_status ON TABLE forecast_run COLUMNS status;",
            "DEFINE TABLE IF NOT EXISTS forecast_model_run SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS forecast_model_run_id ON TABLE forecast_model_run COLUMNS model_run_id UNIQUE;
             DEFINE INDEX IF NOT EXISTS forecast_model_run_key ON TABLE forecast_model_run COLUMNS run_id, model_name UNIQUE;",
            // One row per (model run, entity, period); duplicates abort the whole insert.
            "DEFINE TABLE IF NOT EXISTS forecast_data SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS forecast_data_key ON TABLE forecast_data COLUMNS model_run_id, entity, period UNIQUE;
             DEFINE INDEX IF NOT EXISTS forecast_data_series ON TABLE forecast_data COLUMNS account, entity, period;",
            "DEFINE TABLE IF NOT EXISTS cleaned_data SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS cleaned_data_run ON TABLE cleaned_data COLUMNS run_id;",
            // At most one row may ever exist: the claim of the active run.
            "DEFINE TABLE IF NOT EXISTS run_lock SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS run_lock_slot ON TABLE run_lock COLUMNS slot UNIQUE;",
            "DEFINE TABLE IF NOT EXISTS run_sequence SCHEMALESS;",
        ],
        DatabaseKind::DsxWrite => vec![
            "DEFINE TABLE IF NOT EXISTS dsx_output SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS dsx_output_key ON TABLE dsx_output COLUMNS run_id, account, entity, period UNIQUE;",
        ],
    }
}

fn tables(kind: DatabaseKind) -> &'static [&'static str] {
    match kind {
        DatabaseKind::Internal => &[
            FORECAST_RUN_TABLE,
            FORECAST_MODEL_RUN_TABLE,
            FORECAST_DATA_TABLE,
            CLEANED_DATA_TABLE,
            RUN_LOCK_TABLE,
            RUN_SEQUENCE_TABLE,
        ],
        DatabaseKind::DsxWrite => &[DSX_OUTPUT_TABLE],
    }
}

/// Ensure all tables of `kind` exist. Existing tables and rows are kept.
pub async fn ensure_schema(db: &Db, kind: DatabaseKind) -> Result<()> {
    for query in schema_queries(kind) {
        db.query(query).await?.check()?;
    }
    Ok(())
}

/// Permanently delete the tables of `kind` and all their rows.
pub async fn drop_tables(db: &Db, kind: DatabaseKind) -> Result<()> {
    for table in tables(kind) {
        info!("Dropping table {} ({} database)", table, kind.as_str());
        db.query(format!("REMOVE TABLE IF EXISTS {table};"))
            .await?
            .check()?;
    }
    Ok(())
}

/// Names of the tables of `kind` that currently exist.
pub async fn existing_tables(db: &Db, kind: DatabaseKind) -> Result<Vec<String>> {
    let mut res = db.query("INFO FOR DB;").await?;
    let info: Option<serde_json::Value> = res.take(0)?;
    let defined = info
        .as_ref()
        .and_then(|v| v.get("tables"))
        .and_then(|v| v.as_object())
        .map(|tables| tables.keys().cloned().collect::<Vec<_>>())
        .unwrap_or_default();

    Ok(tables(kind)
        .iter()
        .filter(|t| defined.iter().any(|d| d == *t))
        .map(|t| t.to_string())
        .collect())
}
