//! Data preparation: import, clean and snapshot the sales history of a run.

pub mod cleaning;
pub mod loader;

pub use loader::{DataLoader, ExtractRecord};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::db::{CleanedDataRow, RunRecordStore};
use crate::error::{DataException, Result};
use crate::model::CleaningPolicy;
use crate::types::{AccountName, EntityKey, Month, RunId};

/// Monthly sales of one entity.
pub type Series = BTreeMap<Month, f64>;

/// Immutable snapshot of cleaned sales history used by one run.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    source_run: Option<RunId>,
    accounts: BTreeMap<AccountName, BTreeMap<EntityKey, Series>>,
    rows: usize,
}

impl Dataset {
    pub fn from_rows(rows: &[CleanedDataRow]) -> Self {
        let mut accounts: BTreeMap<AccountName, BTreeMap<EntityKey, Series>> = BTreeMap::new();
        for row in rows {
            accounts
                .entry(row.account.clone())
                .or_default()
                .entry(row.entity.clone())
                .or_default()
                .insert(row.month, row.sales);
        }
        Self {
            source_run: rows.first().map(|r| r.run_id),
            accounts,
            rows: rows.len(),
        }
    }

    /// Run whose import this snapshot was taken from.
    pub fn source_run(&self) -> Option<RunId> {
        self.source_run
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn accounts(&self) -> impl Iterator<Item = &AccountName> {
        self.accounts.keys()
    }

    /// All entity series of `account`, ordered by entity.
    pub fn account(&self, account: &AccountName) -> Option<&BTreeMap<EntityKey, Series>> {
        self.accounts.get(account)
    }

    /// Recorded sales of one entity in `month`.
    pub fn actual(&self, account: &AccountName, entity: &EntityKey, month: Month) -> Option<f64> {
        self.accounts
            .get(account)
            .and_then(|entities| entities.get(entity))
            .and_then(|series| series.get(&month))
            .copied()
    }
}

/// Produces the dataset of a run according to its cleaning policy.
#[derive(Clone)]
pub struct DataPreparation {
    store: RunRecordStore,
    loader: DataLoader,
}

impl DataPreparation {
    pub fn new(store: RunRecordStore, loader: DataLoader) -> Self {
        Self { store, loader }
    }

    pub async fn prepare(&self, run_id: RunId, policy: CleaningPolicy) -> Result<Arc<Dataset>> {
        let rows = if policy.import_extract {
            let loader = self.loader.clone();
            let records = tokio::task::spawn_blocking(move || loader.load())
                .await
                .map_err(|e| DataException::MissingExtract(format!("extract loader stopped: {e}")))??;
            let cleaned = cleaning::clean(run_id, records);
            self.store.replace_cleaned_data(run_id, cleaned.clone()).await?;
            info!(run_id = %run_id, rows = cleaned.len(), "Imported and cleaned input extract");
            cleaned
        } else {
            let source = self.reusable_cleaning_run().await?;
            let rows = self.store.load_cleaned_data(source).await?;
            info!(run_id = %run_id, source_run = %source, rows = rows.len(), "Reusing cleaned data");
            rows
        };

        if policy.supersede_prior_actuals {
            self.store.supersede_prior_actuals(&rows).await?;
        }

        Ok(Arc::new(Dataset::from_rows(&rows)))
    }

    /// The stored cleaned data may only be reused if it belongs to the newest
    /// completed cleaning run and to nothing else.
    async fn reusable_cleaning_run(&self) -> Result<RunId> {
        let Some(last) = self.store.last_successful_cleaning_run().await? else {
            return Err(DataException::NoCleanedData(
                "no completed run imported data, re-run cleaning with --force-reload".to_string(),
            )
            .into());
        };
        let stored = self.store.cleaned_data_runs().await?;
        if stored != [last] {
            let stored: Vec<String> = stored.iter().map(|r| r.to_string()).collect();
            return Err(DataException::NoCleanedData(format!(
                "stored cleaned data belongs to run(s) [{}], last completed cleaning run is {last}; \
                 re-run cleaning with --force-reload",
                stored.join(", ")
            ))
            .into());
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseConfig, RunCreate, create_connection, ensure_schema};
    use crate::error::Error;
    use crate::model::{DatabaseKind, RunMode, RunStatus};
    use std::io::Write;

    async fn setup_test_store() -> RunRecordStore {
        let db = create_connection(DatabaseConfig::memory()).await.unwrap();
        ensure_schema(&db, DatabaseKind::Internal).await.unwrap();
        RunRecordStore::new(db)
    }

    fn extract() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"account,entity,month,sales\nAccount1,C1:1,201912,4\nAccount1,C1:1,202001,6\nAccount2,C2:1,202001,1\n",
        )
        .unwrap();
        file
    }

    /// Claim a run of `mode` and move it to `Preparing`.
    async fn preparing_run(store: &RunRecordStore, mode: RunMode, force_reload: bool) -> RunId {
        let month = Month::parse("202001").unwrap();
        let run_id = store
            .try_begin_run(&RunCreate {
                mode,
                includes_cleaning: mode.cleaning_policy(force_reload).import_extract,
                forecast_periods: 1,
                prediction_month: month,
                forecast_start: month,
                forecast_end: month,
            })
            .await
            .unwrap();
        store.transition_run(run_id, RunStatus::Preparing, None).await.unwrap();
        run_id
    }

    async fn close_run(store: &RunRecordStore, run_id: RunId, status: RunStatus) {
        if status == RunStatus::Completed {
            store.transition_run(run_id, RunStatus::Running, None).await.unwrap();
        }
        store.transition_run(run_id, status, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_import_builds_dataset() {
        let store = setup_test_store().await;
        let file = extract();
        let preparation = DataPreparation::new(store.clone(), DataLoader::new(file.path()));

        let dataset = preparation
            .prepare(RunId(1), RunMode::Production.cleaning_policy(false))
            .await
            .unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.source_run(), Some(RunId(1)));
        let account = AccountName::new("Account1");
        assert_eq!(
            dataset.actual(&account, &EntityKey::new("C1:1"), Month::parse("202001").unwrap()),
            Some(6.0)
        );
        assert_eq!(store.cleaned_data_runs().await.unwrap(), vec![RunId(1)]);
    }

    #[tokio::test]
    async fn test_backward_without_import_reuses_completed_cleaning() {
        let store = setup_test_store().await;
        let file = extract();
        let preparation = DataPreparation::new(store.clone(), DataLoader::new(file.path()));
        let cleaning = preparing_run(&store, RunMode::Development, false).await;
        preparation
            .prepare(cleaning, RunMode::Development.cleaning_policy(false))
            .await
            .unwrap();
        close_run(&store, cleaning, RunStatus::Completed).await;

        let missing = DataPreparation::new(store.clone(), DataLoader::new("/nonexistent.csv"));
        let backward = preparing_run(&store, RunMode::Backward, false).await;
        let dataset = missing
            .prepare(backward, RunMode::Backward.cleaning_policy(false))
            .await
            .unwrap();
        assert_eq!(dataset.source_run(), Some(cleaning));
    }

    #[tokio::test]
    async fn test_cleaning_of_failed_run_is_not_reused() {
        let store = setup_test_store().await;
        let file = extract();
        let preparation = DataPreparation::new(store.clone(), DataLoader::new(file.path()));

        let completed = preparing_run(&store, RunMode::Production, false).await;
        preparation
            .prepare(completed, RunMode::Production.cleaning_policy(false))
            .await
            .unwrap();
        close_run(&store, completed, RunStatus::Completed).await;

        // A later import replaces the completed run's rows, then its run fails.
        let failed = preparing_run(&store, RunMode::Production, false).await;
        preparation
            .prepare(failed, RunMode::Production.cleaning_policy(false))
            .await
            .unwrap();
        close_run(&store, failed, RunStatus::Failed).await;

        let backward = preparing_run(&store, RunMode::Backward, false).await;
        let err = preparation
            .prepare(backward, RunMode::Backward.cleaning_policy(false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Data(DataException::NoCleanedData(_))), "{err:?}");
    }

    #[tokio::test]
    async fn test_no_cleaned_data_fails() {
        let store = setup_test_store().await;
        let preparation = DataPreparation::new(store, DataLoader::new("/nonexistent.csv"));

        let err = preparation
            .prepare(RunId(1), RunMode::Backward.cleaning_policy(false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Data(DataException::NoCleanedData(_))));
    }

    #[tokio::test]
    async fn test_missing_extract_fails_import() {
        let store = setup_test_store().await;
        let preparation = DataPreparation::new(store, DataLoader::new("/nonexistent.csv"));

        let err = preparation
            .prepare(RunId(1), RunMode::Production.cleaning_policy(false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Data(DataException::MissingExtract(_))));
    }
}
