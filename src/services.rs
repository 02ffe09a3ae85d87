//! Process-wide resources of one CLI invocation.

use std::sync::Arc;
use tracing::info;

use crate::config::PlatformConfig;
use crate::core::engine::{ForecastEngine, LocalEngine};
use crate::db::{DatabaseConfig, Db, RunRecord, RunRecordStore, create_connection, ensure_schema, existing_tables};
use crate::model::DatabaseKind;
use crate::orchestrator::Orchestrator;
use crate::registry::ModelConfigRegistry;

/// Database connection, modeling engine and registry shared by all commands.
///
/// The connection closes when the last clone of the store handle is dropped.
pub struct Services {
    db_config: DatabaseConfig,
    store: RunRecordStore,
    platform: PlatformConfig,
    registry: ModelConfigRegistry,
    engine: Arc<dyn ForecastEngine>,
}

/// Environment report shown by `info`.
#[derive(Debug, Clone)]
pub struct EnvironmentInfo {
    pub database_url: String,
    pub namespace: String,
    pub database: String,
    pub internal_tables: Vec<String>,
    pub dsx_write_tables: Vec<String>,
    pub active_run: Option<RunRecord>,
    pub model_configs: usize,
    pub engine: String,
    pub engine_health: std::result::Result<String, String>,
}

impl Services {
    /// Connect to the store and make sure both databases have their tables.
    pub async fn init(db_config: DatabaseConfig, platform: PlatformConfig) -> anyhow::Result<Self> {
        Self::with_engine(db_config, platform, Arc::new(LocalEngine::new())).await
    }

    pub async fn with_engine(
        db_config: DatabaseConfig,
        platform: PlatformConfig,
        engine: Arc<dyn ForecastEngine>,
    ) -> anyhow::Result<Self> {
        let db = create_connection(db_config.clone()).await?;
        ensure_schema(&db, DatabaseKind::Internal).await?;
        ensure_schema(&db, DatabaseKind::DsxWrite).await?;
        let registry = ModelConfigRegistry::from_specs(platform.model_configs.clone())?;

        info!(
            "Services ready: database {} ({}/{}), engine {}, {} model configs",
            db_config.url,
            db_config.namespace,
            db_config.database,
            engine.name(),
            registry.len()
        );

        Ok(Self {
            db_config,
            store: RunRecordStore::new(db),
            platform,
            registry,
            engine,
        })
    }

    pub fn db(&self) -> &Db {
        self.store.db()
    }

    pub fn store(&self) -> &RunRecordStore {
        &self.store
    }

    pub fn registry(&self) -> &ModelConfigRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.platform.clone(),
            self.registry.clone(),
            self.engine.clone(),
        )
    }

    pub async fn environment_info(&self) -> anyhow::Result<EnvironmentInfo> {
        Ok(EnvironmentInfo {
            database_url: self.db_config.url.clone(),
            namespace: self.db_config.namespace.clone(),
            database: self.db_config.database.clone(),
            internal_tables: existing_tables(self.db(), DatabaseKind::Internal).await?,
            dsx_write_tables: existing_tables(self.db(), DatabaseKind::DsxWrite).await?,
            active_run: self.store.active_run().await?,
            model_configs: self.registry.len(),
            engine: self.engine.name().to_string(),
            engine_health: self.engine.health().await.map_err(|e| e.to_string()),
        })
    }
}
