//! Run record store on top of SurrealDB.
//!
//! Every write that has to be consistent with another write (claiming a run,
//! status guards, forecast data plus the succeeded status) is issued as one
//! SurrealQL transaction. Guards raise `THROW` with a marker string which is
//! mapped back to the crate error taxonomy here.

use serde::Deserialize;
use std::collections::BTreeSet;
use surrealdb::Response;
use tracing::{debug, info, warn};

use crate::db::connection::Db;
use crate::db::schema::*;
use crate::error::{Error, ModelExecutionError, Result};
use crate::model::{ModelRunStatus, RunMode, RunStatus};
use crate::types::{ModelName, ModelRunId, RunId};

const RUN_CONFLICT: &str = "run_conflict";
const RUN_MISSING: &str = "run_missing";
const RUN_TERMINAL: &str = "run_terminal";
const RUN_TRANSITION: &str = "run_transition";
const MODEL_RUN_MISSING: &str = "model_run_missing";
const MODEL_RUN_TRANSITION: &str = "model_run_transition";
const MODEL_RUN_NOT_RUNNING: &str = "model_run_not_running";
const FORECAST_DATA_KEY: &str = "forecast_data_key";
const RUN_CLOSED: &str = "run_closed";

#[derive(Deserialize)]
struct CountRow {
    count: u64,
}

#[derive(Deserialize)]
struct RunIdRow {
    run_id: RunId,
}

#[derive(Deserialize)]
struct AbortRow {
    status: RunStatus,
    abort_requested: Option<bool>,
}

/// Collect statement errors of a response, ordered by statement index.
fn statement_errors(res: &mut Response) -> Vec<String> {
    let mut errors: Vec<(usize, String)> = res
        .take_errors()
        .into_iter()
        .map(|(index, err)| (index, err.to_string()))
        .collect();
    errors.sort_by_key(|(index, _)| *index);
    errors.into_iter().map(|(_, err)| err).collect()
}

fn find_marker<'a>(errors: &'a [String], marker: &str) -> Option<&'a String> {
    errors.iter().find(|err| err.contains(marker))
}

/// Statement errors without a marker: the store answered, so it is reachable.
fn unexpected(errors: Vec<String>) -> Error {
    Error::Store(errors.join("; "))
}

/// Durable record of runs, model runs and forecast data.
#[derive(Clone)]
pub struct RunRecordStore {
    db: Db,
}

impl RunRecordStore {
    /// Create a store on an already initialised connection.
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Get reference to the database.
    pub fn db(&self) -> &Db {
        &self.db
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Atomically claim the single active-run slot and create a `Pending` run.
    ///
    /// Fails with [`Error::Conflict`] while any other run is non-terminal. The
    /// check and the insert happen in one transaction, and the claim row is
    /// additionally protected by a unique index, so two processes racing for
    /// the slot cannot both win.
    pub async fn try_begin_run(&self, run: &RunCreate) -> Result<RunId> {
        let query = r#"
            BEGIN TRANSACTION;
            LET $active = (SELECT VALUE run_id FROM run_lock WHERE slot = "active")[0];
            IF $active != NONE { THROW "run_conflict"; };
            UPSERT run_sequence:forecast_run SET current = (current OR 0) + 1;
            LET $next = (SELECT VALUE current FROM run_sequence:forecast_run)[0];
            CREATE forecast_run CONTENT {
                run_id: $next,
                mode: $mode,
                status: "pending",
                includes_cleaning: $includes_cleaning,
                forecast_periods: $forecast_periods,
                prediction_month: $prediction_month,
                forecast_start: $forecast_start,
                forecast_end: $forecast_end,
                abort_requested: false,
                created_at: time::now()
            };
            CREATE run_lock:active CONTENT { slot: "active", run_id: $next, claimed_at: time::now() };
            COMMIT TRANSACTION;
        "#;

        let response = self
            .db
            .query(query)
            .bind(("mode", run.mode))
            .bind(("includes_cleaning", run.includes_cleaning))
            .bind(("forecast_periods", run.forecast_periods))
            .bind(("prediction_month", run.prediction_month))
            .bind(("forecast_start", run.forecast_start))
            .bind(("forecast_end", run.forecast_end))
            .await;
        let mut res = match response {
            Ok(res) => res,
            Err(err) => {
                if let Some(active) = self.active_run_id().await? {
                    debug!(error = %err, "Run claim rejected");
                    return Err(Error::Conflict { active });
                }
                return Err(err.into());
            }
        };

        let errors = statement_errors(&mut res);
        if !errors.is_empty() {
            // A lost race surfaces as a unique index or transaction conflict
            // rather than the explicit marker.
            if let Some(active) = self.active_run_id().await? {
                debug!(?errors, "Run claim rejected");
                return Err(Error::Conflict { active });
            }
            if find_marker(&errors, RUN_CONFLICT).is_some() {
                return Err(Error::InvariantViolation(
                    "active run claim vanished during conflict check".to_string(),
                ));
            }
            return Err(unexpected(errors));
        }

        let run_id = self.active_run_id().await?.ok_or_else(|| {
            Error::InvariantViolation("run claim missing after commit".to_string())
        })?;

        info!(run_id = %run_id, mode = %run.mode, "Claimed forecast run");
        Ok(run_id)
    }

    /// Move a run to `status`, refusing regressions and changes to terminal runs.
    ///
    /// Entering a terminal status releases the active-run claim in the same
    /// transaction.
    pub async fn transition_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        cause: Option<String>,
    ) -> Result<()> {
        let terminal = status.is_terminal();
        let mut query = String::from(
            r#"
            BEGIN TRANSACTION;
            LET $current = (SELECT VALUE status FROM forecast_run WHERE run_id = $run_id)[0];
            IF $current = NONE { THROW "run_missing"; };
            IF $current INSIDE $terminal { THROW "run_terminal:" + $current; };
            IF $current NOTINSIDE $allowed { THROW "run_transition:" + $current; };
            "#,
        );
        if terminal {
            query.push_str(
                "UPDATE forecast_run SET status = $status, cause = $cause, ended_at = time::now() WHERE run_id = $run_id;
                 DELETE run_lock WHERE run_id = $run_id;",
            );
        } else {
            query.push_str("UPDATE forecast_run SET status = $status WHERE run_id = $run_id;");
        }
        query.push_str("COMMIT TRANSACTION;");

        let mut res = self
            .db
            .query(query)
            .bind(("run_id", run_id))
            .bind(("status", status))
            .bind(("cause", cause))
            .bind(("terminal", RunStatus::TERMINAL.to_vec()))
            .bind(("allowed", status.allowed_predecessors().to_vec()))
            .await?;

        let errors = statement_errors(&mut res);
        if errors.is_empty() {
            info!(run_id = %run_id, status = %status, "Updated forecast run status");
            return Ok(());
        }
        if find_marker(&errors, RUN_MISSING).is_some() {
            return Err(Error::InvariantViolation(format!(
                "forecast run {run_id} does not exist"
            )));
        }
        if let Some(err) = find_marker(&errors, RUN_TERMINAL) {
            warn!(run_id = %run_id, status = %status, "Attempted transition out of end state");
            return Err(Error::InvariantViolation(format!(
                "forecast run {run_id} is already terminal, cannot move to {status} ({err})"
            )));
        }
        if let Some(err) = find_marker(&errors, RUN_TRANSITION) {
            return Err(Error::InvariantViolation(format!(
                "forecast run {run_id} cannot move to {status} ({err})"
            )));
        }
        Err(unexpected(errors))
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        let mut res = self
            .db
            .query("SELECT * OMIT id FROM forecast_run WHERE run_id = $run_id LIMIT 1")
            .bind(("run_id", run_id))
            .await?;
        let runs: Vec<RunRecord> = res.take(0)?;
        Ok(runs.into_iter().next())
    }

    /// Run currently holding the active-run claim, if any.
    pub async fn active_run_id(&self) -> Result<Option<RunId>> {
        let mut res = self
            .db
            .query(r#"SELECT VALUE run_id FROM run_lock WHERE slot = "active""#)
            .await?;
        let ids: Vec<RunId> = res.take(0)?;
        Ok(ids.into_iter().next())
    }

    pub async fn active_run(&self) -> Result<Option<RunRecord>> {
        match self.active_run_id().await? {
            Some(run_id) => self.get_run(run_id).await,
            None => Ok(None),
        }
    }

    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut res = self
            .db
            .query("SELECT * OMIT id FROM forecast_run ORDER BY run_id ASC")
            .await?;
        Ok(res.take(0)?)
    }

    /// Newest run of `mode` that ended in `status`.
    pub async fn last_run(&self, mode: RunMode, status: RunStatus) -> Result<Option<RunRecord>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT * OMIT id FROM forecast_run
                WHERE mode = $mode AND status = $status
                ORDER BY run_id DESC
                LIMIT 1
                "#,
            )
            .bind(("mode", mode))
            .bind(("status", status))
            .await?;
        let runs: Vec<RunRecord> = res.take(0)?;
        Ok(runs.into_iter().next())
    }

    /// Ask the process driving `run_id` to stop after its current model run.
    ///
    /// Returns `false` if the run is unknown or already terminal.
    pub async fn request_abort(&self, run_id: RunId) -> Result<bool> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(false);
        };
        if run.status.is_terminal() {
            return Ok(false);
        }
        self.db
            .query("UPDATE forecast_run SET abort_requested = true WHERE run_id = $run_id RETURN NONE")
            .bind(("run_id", run_id))
            .await?
            .check()?;
        info!(run_id = %run_id, "Abort requested for forecast run");
        Ok(true)
    }

    /// Whether the driver of `run_id` has to stop: an abort was requested, or
    /// the run already reached an end state elsewhere (`abort --force`).
    pub async fn abort_requested(&self, run_id: RunId) -> Result<bool> {
        let mut res = self
            .db
            .query("SELECT status, abort_requested FROM forecast_run WHERE run_id = $run_id")
            .bind(("run_id", run_id))
            .await?;
        let rows: Vec<AbortRow> = res.take(0)?;
        Ok(rows
            .first()
            .is_some_and(|row| row.abort_requested.unwrap_or(false) || row.status.is_terminal()))
    }

    // ------------------------------------------------------------------
    // Model runs
    // ------------------------------------------------------------------

    /// Register the model runs of `run_id` in one transaction.
    pub async fn create_model_runs(
        &self,
        run_id: RunId,
        entries: Vec<ModelRunCreate>,
    ) -> Result<Vec<ModelRunRecord>> {
        let query = r#"
            BEGIN TRANSACTION;
            FOR $entry IN $entries {
                UPSERT run_sequence:forecast_model_run SET current = (current OR 0) + 1;
                LET $next = (SELECT VALUE current FROM run_sequence:forecast_model_run)[0];
                CREATE forecast_model_run CONTENT {
                    model_run_id: $next,
                    run_id: $run_id,
                    model_name: $entry.model_name,
                    account: $entry.account,
                    dispatch_order: $entry.dispatch_order,
                    status: $entry.status,
                    attempts: 0,
                    created_at: time::now()
                };
            };
            UPDATE forecast_model_run SET ended_at = time::now()
                WHERE run_id = $run_id AND status = "skipped" RETURN NONE;
            COMMIT TRANSACTION;
        "#;

        let count = entries.len();
        let mut res = self
            .db
            .query(query)
            .bind(("run_id", run_id))
            .bind(("entries", entries))
            .await?;
        let errors = statement_errors(&mut res);
        if !errors.is_empty() {
            return Err(unexpected(errors));
        }

        let model_runs = self.list_model_runs(run_id).await?;
        debug!(run_id = %run_id, count, "Registered forecast model runs");
        Ok(model_runs)
    }

    /// Model runs of `run_id` in dispatch order.
    pub async fn list_model_runs(&self, run_id: RunId) -> Result<Vec<ModelRunRecord>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT * OMIT id FROM forecast_model_run
                WHERE run_id = $run_id
                ORDER BY dispatch_order ASC
                "#,
            )
            .bind(("run_id", run_id))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn get_model_run(
        &self,
        run_id: RunId,
        model_name: &ModelName,
    ) -> Result<Option<ModelRunRecord>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT * OMIT id FROM forecast_model_run
                WHERE run_id = $run_id AND model_name = $model_name
                LIMIT 1
                "#,
            )
            .bind(("run_id", run_id))
            .bind(("model_name", model_name.clone()))
            .await?;
        let runs: Vec<ModelRunRecord> = res.take(0)?;
        Ok(runs.into_iter().next())
    }

    /// Move a model run forward. Failed model runs record the error summary.
    ///
    /// Fails with [`Error::RunClosed`] once the parent run is terminal.
    pub async fn transition_model_run(
        &self,
        run_id: RunId,
        model_name: &ModelName,
        status: ModelRunStatus,
        error: Option<&ModelExecutionError>,
    ) -> Result<()> {
        let mut set = String::from("status = $status");
        if status == ModelRunStatus::Running {
            set.push_str(", started_at = time::now()");
        }
        if status.is_terminal() {
            set.push_str(", ended_at = time::now()");
        }
        if error.is_some() {
            set.push_str(", error = $error, error_cause = $error_cause");
        }

        let query = format!(
            r#"
            BEGIN TRANSACTION;
            LET $run_status = (SELECT VALUE status FROM forecast_run WHERE run_id = $run_id)[0];
            IF $run_status INSIDE $run_terminal {{ THROW "run_closed:" + $run_status; }};
            LET $current = (SELECT VALUE status FROM forecast_model_run
                WHERE run_id = $run_id AND model_name = $model_name)[0];
            IF $current = NONE {{ THROW "model_run_missing"; }};
            IF $current NOTINSIDE $allowed {{ THROW "model_run_transition:" + $current; }};
            UPDATE forecast_model_run SET {set}
                WHERE run_id = $run_id AND model_name = $model_name RETURN NONE;
            COMMIT TRANSACTION;
            "#
        );

        let mut res = self
            .db
            .query(query)
            .bind(("run_id", run_id))
            .bind(("model_name", model_name.clone()))
            .bind(("status", status))
            .bind(("allowed", status.allowed_predecessors().to_vec()))
            .bind(("run_terminal", RunStatus::TERMINAL.to_vec()))
            .bind(("error", error.map(|e| e.message.clone())))
            .bind(("error_cause", error.map(|e| e.cause)))
            .await?;

        let errors = statement_errors(&mut res);
        if errors.is_empty() {
            info!(run_id = %run_id, model = %model_name, status = %status, "Updated forecast model run status");
            return Ok(());
        }
        if let Some(err) = find_marker(&errors, RUN_CLOSED) {
            warn!(run_id = %run_id, model = %model_name, status = %status, "Run closed, model run left unchanged");
            return Err(Error::RunClosed(format!(
                "run {run_id} is terminal, model run {model_name} cannot move to {status} ({err})"
            )));
        }
        if find_marker(&errors, MODEL_RUN_MISSING).is_some() {
            return Err(Error::InvariantViolation(format!(
                "model run {model_name} of run {run_id} does not exist"
            )));
        }
        if let Some(err) = find_marker(&errors, MODEL_RUN_TRANSITION) {
            warn!(run_id = %run_id, model = %model_name, status = %status, "Rejected model run transition");
            return Err(Error::InvariantViolation(format!(
                "model run {model_name} of run {run_id} cannot move to {status} ({err})"
            )));
        }
        Err(unexpected(errors))
    }

    /// Count one more dispatch attempt of a model run.
    pub async fn record_attempt(&self, model_run_id: ModelRunId) -> Result<()> {
        self.db
            .query("UPDATE forecast_model_run SET attempts += 1 WHERE model_run_id = $id RETURN NONE")
            .bind(("id", model_run_id))
            .await?
            .check()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Forecast data
    // ------------------------------------------------------------------

    /// Persist all rows of a running model run and mark it `Succeeded`.
    ///
    /// Rows and status are committed together: if any row is rejected (for
    /// instance a duplicate entity/period), nothing is written and the model
    /// run stays `Running`. Nothing is written once the parent run is terminal.
    pub async fn write_forecast_data(
        &self,
        model_run_id: ModelRunId,
        rows: Vec<ForecastDataRow>,
    ) -> Result<usize> {
        if let Some(row) = rows.iter().find(|row| row.model_run_id != model_run_id) {
            return Err(Error::InvariantViolation(format!(
                "forecast row for model run {} passed to model run {model_run_id}",
                row.model_run_id
            )));
        }

        let entity_count = rows
            .iter()
            .map(|row| row.entity.as_str())
            .collect::<BTreeSet<_>>()
            .len() as u32;
        let count = rows.len();

        let mut query = String::from(
            r#"
            BEGIN TRANSACTION;
            LET $owner = (SELECT VALUE run_id FROM forecast_model_run WHERE model_run_id = $model_run_id)[0];
            LET $run_status = (SELECT VALUE status FROM forecast_run WHERE run_id = $owner)[0];
            IF $run_status INSIDE $run_terminal { THROW "run_closed:" + $run_status; };
            LET $current = (SELECT VALUE status FROM forecast_model_run WHERE model_run_id = $model_run_id)[0];
            IF $current != "running" { THROW "model_run_not_running"; };
            "#,
        );
        if !rows.is_empty() {
            query.push_str("INSERT INTO forecast_data $rows RETURN NONE;");
        }
        query.push_str(
            r#"
            UPDATE forecast_model_run
                SET status = "succeeded", entity_count = $entity_count, ended_at = time::now()
                WHERE model_run_id = $model_run_id RETURN NONE;
            COMMIT TRANSACTION;
            "#,
        );

        let mut res = self
            .db
            .query(query)
            .bind(("model_run_id", model_run_id))
            .bind(("rows", rows))
            .bind(("entity_count", entity_count))
            .bind(("run_terminal", RunStatus::TERMINAL.to_vec()))
            .await?;

        let errors = statement_errors(&mut res);
        if errors.is_empty() {
            debug!(model_run_id = %model_run_id, count, "Stored forecast data");
            return Ok(count);
        }
        if let Some(err) = find_marker(&errors, RUN_CLOSED) {
            return Err(Error::RunClosed(format!(
                "refusing forecast data of model run {model_run_id} ({err})"
            )));
        }
        if find_marker(&errors, MODEL_RUN_NOT_RUNNING).is_some() {
            return Err(Error::InvariantViolation(format!(
                "model run {model_run_id} is not running, refusing forecast data"
            )));
        }
        if find_marker(&errors, FORECAST_DATA_KEY).is_some() {
            return Err(Error::InvariantViolation(format!(
                "duplicate forecast rows for model run {model_run_id}"
            )));
        }
        Err(unexpected(errors))
    }

    pub async fn forecast_data_for_model_run(
        &self,
        model_run_id: ModelRunId,
    ) -> Result<Vec<ForecastDataRow>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT * OMIT id FROM forecast_data
                WHERE model_run_id = $model_run_id
                ORDER BY entity ASC, period ASC
                "#,
            )
            .bind(("model_run_id", model_run_id))
            .await?;
        Ok(res.take(0)?)
    }

    pub async fn count_forecast_data(&self, model_run_id: ModelRunId) -> Result<u64> {
        let mut res = self
            .db
            .query("SELECT count() AS count FROM forecast_data WHERE model_run_id = $model_run_id GROUP ALL")
            .bind(("model_run_id", model_run_id))
            .await?;
        let rows: Vec<CountRow> = res.take(0)?;
        Ok(rows.first().map(|r| r.count).unwrap_or(0))
    }

    /// Forecast data of all succeeded model runs of `run_id`.
    pub async fn forecast_data_for_run(&self, run_id: RunId) -> Result<Vec<ForecastDataRow>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT * OMIT id FROM forecast_data
                WHERE model_run_id INSIDE (SELECT VALUE model_run_id FROM forecast_model_run
                    WHERE run_id = $run_id AND status = "succeeded")
                ORDER BY model_name ASC, entity ASC, period ASC
                "#,
            )
            .bind(("run_id", run_id))
            .await?;
        Ok(res.take(0)?)
    }

    // ------------------------------------------------------------------
    // Cleaned data
    // ------------------------------------------------------------------

    /// Store the cleaned import of `run_id` and drop imports of older runs.
    ///
    /// Returns the number of outdated rows deleted.
    pub async fn replace_cleaned_data(
        &self,
        run_id: RunId,
        rows: Vec<CleanedDataRow>,
    ) -> Result<u64> {
        let mut res = self
            .db
            .query("SELECT count() AS count FROM cleaned_data WHERE run_id < $run_id GROUP ALL")
            .bind(("run_id", run_id))
            .await?;
        let outdated: Vec<CountRow> = res.take(0)?;
        let outdated = outdated.first().map(|r| r.count).unwrap_or(0);

        let mut res = self
            .db
            .query(
                r#"
                BEGIN TRANSACTION;
                INSERT INTO cleaned_data $rows RETURN NONE;
                DELETE cleaned_data WHERE run_id < $run_id RETURN NONE;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("run_id", run_id))
            .bind(("rows", rows))
            .await?;

        let errors = statement_errors(&mut res);
        if !errors.is_empty() {
            return Err(unexpected(errors));
        }
        info!(run_id = %run_id, deleted = outdated, "Replaced cleaned data");
        Ok(outdated)
    }

    /// Runs that own stored cleaned data, ascending.
    pub async fn cleaned_data_runs(&self) -> Result<Vec<RunId>> {
        let mut res = self
            .db
            .query("SELECT run_id FROM cleaned_data GROUP BY run_id")
            .await?;
        let rows: Vec<RunIdRow> = res.take(0)?;
        let mut runs: Vec<RunId> = rows.into_iter().map(|r| r.run_id).collect();
        runs.sort();
        Ok(runs)
    }

    /// Newest completed run that imported and cleaned the extract.
    pub async fn last_successful_cleaning_run(&self) -> Result<Option<RunId>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT run_id FROM forecast_run
                WHERE status = $status AND includes_cleaning = true
                ORDER BY run_id DESC
                LIMIT 1
                "#,
            )
            .bind(("status", RunStatus::Completed))
            .await?;
        let rows: Vec<RunIdRow> = res.take(0)?;
        Ok(rows.into_iter().next().map(|r| r.run_id))
    }

    pub async fn load_cleaned_data(&self, run_id: RunId) -> Result<Vec<CleanedDataRow>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT * OMIT id FROM cleaned_data
                WHERE run_id = $run_id
                ORDER BY account ASC, entity ASC, month ASC
                "#,
            )
            .bind(("run_id", run_id))
            .await?;
        Ok(res.take(0)?)
    }

    /// Overwrite actuals of earlier forecasts with freshly cleaned sales.
    pub async fn supersede_prior_actuals(&self, rows: &[CleanedDataRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut res = self
            .db
            .query(
                r#"
                BEGIN TRANSACTION;
                FOR $row IN $rows {
                    UPDATE forecast_data SET actual = $row.sales
                        WHERE account = $row.account AND entity = $row.entity AND period = $row.month
                        RETURN NONE;
                };
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("rows", rows.to_vec()))
            .await?;
        let errors = statement_errors(&mut res);
        if !errors.is_empty() {
            return Err(unexpected(errors));
        }
        info!(rows = rows.len(), "Updated actuals of previous forecasts");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Warehouse output
    // ------------------------------------------------------------------

    pub async fn write_warehouse_output(&self, rows: Vec<WarehouseRow>) -> Result<usize> {
        let count = rows.len();
        if rows.is_empty() {
            return Ok(0);
        }
        let mut res = self
            .db
            .query(
                r#"
                BEGIN TRANSACTION;
                INSERT INTO dsx_output $rows RETURN NONE;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("rows", rows))
            .await?;
        let errors = statement_errors(&mut res);
        if !errors.is_empty() {
            return Err(Error::Output(errors.join("; ")));
        }
        Ok(count)
    }

    pub async fn warehouse_output(&self, run_id: RunId) -> Result<Vec<WarehouseRow>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT * OMIT id FROM dsx_output
                WHERE run_id = $run_id
                ORDER BY account ASC, entity ASC, period ASC
                "#,
            )
            .bind(("run_id", run_id))
            .await?;
        Ok(res.take(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseConfig, create_connection, ensure_schema};
    use crate::error::ExecutionCause;
    use crate::model::{DatabaseKind, OutputFormat};
    use crate::types::{AccountName, EntityKey, Month};

    async fn setup_test_store() -> RunRecordStore {
        let db = create_connection(DatabaseConfig::memory()).await.unwrap();
        ensure_schema(&db, DatabaseKind::Internal).await.unwrap();
        ensure_schema(&db, DatabaseKind::DsxWrite).await.unwrap();
        RunRecordStore::new(db)
    }

    fn run_create(mode: RunMode) -> RunCreate {
        let month = Month::parse("202001").unwrap();
        RunCreate {
            mode,
            includes_cleaning: true,
            forecast_periods: 1,
            prediction_month: month,
            forecast_start: month,
            forecast_end: month,
        }
    }

    fn model_run(name: &str, order: u32, status: ModelRunStatus) -> ModelRunCreate {
        ModelRunCreate {
            model_name: ModelName::new(name),
            account: AccountName::new(name.trim_start_matches("ModelConfig")),
            dispatch_order: order,
            status,
        }
    }

    fn data_row(model_run_id: ModelRunId, entity: &str, period: &str) -> ForecastDataRow {
        let start = Month::parse("202001").unwrap();
        let period = Month::parse(period).unwrap();
        ForecastDataRow {
            model_run_id,
            model_name: ModelName::new("ModelConfigAccount1"),
            account: AccountName::new("Account1"),
            entity: EntityKey::new(entity),
            prediction_start_month: start,
            period,
            months_delta: start.months_until(period),
            prediction_raw: 10.0,
            prediction: 10.0,
            actual: None,
            output_format: OutputFormat::Csv,
        }
    }

    async fn running_model_run(store: &RunRecordStore) -> (RunId, ModelRunRecord) {
        let run_id = store.try_begin_run(&run_create(RunMode::Development)).await.unwrap();
        let model_runs = store
            .create_model_runs(run_id, vec![model_run("ModelConfigAccount1", 0, ModelRunStatus::Pending)])
            .await
            .unwrap();
        let model_run = model_runs[0].clone();
        store
            .transition_model_run(run_id, &model_run.model_name, ModelRunStatus::Running, None)
            .await
            .unwrap();
        (run_id, model_run)
    }

    #[tokio::test]
    async fn test_begin_run_creates_pending_run() {
        let store = setup_test_store().await;
        let run_id = store.try_begin_run(&run_create(RunMode::Production)).await.unwrap();

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.mode, RunMode::Production);
        assert!(!run.abort_requested);
        assert_eq!(store.active_run_id().await.unwrap(), Some(run_id));
    }

    #[tokio::test]
    async fn test_second_begin_conflicts_while_first_active() {
        let store = setup_test_store().await;
        let first = store.try_begin_run(&run_create(RunMode::Production)).await.unwrap();
        store.transition_run(first, RunStatus::Preparing, None).await.unwrap();
        store.transition_run(first, RunStatus::Running, None).await.unwrap();

        let err = store.try_begin_run(&run_create(RunMode::Backward)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { active } if active == first));
        assert_eq!(store.list_runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_begin_admits_one_run() {
        let store = setup_test_store().await;
        let other = store.clone();
        let first_run = run_create(RunMode::Production);
        let second_run = run_create(RunMode::Development);

        let (first, second) = tokio::join!(
            store.try_begin_run(&first_run),
            other.try_begin_run(&second_run)
        );

        let (winner, loser) = match (first, second) {
            (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
            (first, second) => panic!("expected one claim to win: {first:?} / {second:?}"),
        };
        assert!(matches!(loser, Error::Conflict { active } if active == winner));
        assert_eq!(store.list_runs().await.unwrap().len(), 1);
        assert_eq!(store.active_run_id().await.unwrap(), Some(winner));
    }

    #[tokio::test]
    async fn test_terminal_transition_releases_claim_and_ids_increase() {
        let store = setup_test_store().await;
        let first = store.try_begin_run(&run_create(RunMode::Production)).await.unwrap();
        store
            .transition_run(first, RunStatus::Failed, Some("data".into()))
            .await
            .unwrap();
        assert_eq!(store.active_run_id().await.unwrap(), None);

        let second = store.try_begin_run(&run_create(RunMode::Production)).await.unwrap();
        assert!(second > first);

        let failed = store.get_run(first).await.unwrap().unwrap();
        assert_eq!(failed.cause.as_deref(), Some("data"));
        assert!(failed.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_run_is_immutable() {
        let store = setup_test_store().await;
        let run_id = store.try_begin_run(&run_create(RunMode::Production)).await.unwrap();
        store.transition_run(run_id, RunStatus::Aborted, None).await.unwrap();

        let err = store
            .transition_run(run_id, RunStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));

        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn test_run_status_cannot_regress() {
        let store = setup_test_store().await;
        let run_id = store.try_begin_run(&run_create(RunMode::Production)).await.unwrap();
        store.transition_run(run_id, RunStatus::Preparing, None).await.unwrap();
        store.transition_run(run_id, RunStatus::Running, None).await.unwrap();

        let err = store
            .transition_run(run_id, RunStatus::Preparing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));

        // Completed requires Running first.
        let other = setup_test_store().await;
        let run_id = other.try_begin_run(&run_create(RunMode::Production)).await.unwrap();
        assert!(other.transition_run(run_id, RunStatus::Completed, None).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_run_transition_fails() {
        let store = setup_test_store().await;
        let err = store
            .transition_run(RunId(42), RunStatus::Preparing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_model_runs_keep_dispatch_order_and_skips() {
        let store = setup_test_store().await;
        let run_id = store.try_begin_run(&run_create(RunMode::Backward)).await.unwrap();
        let model_runs = store
            .create_model_runs(
                run_id,
                vec![
                    model_run("ModelConfigAccount1", 0, ModelRunStatus::Pending),
                    model_run("ModelConfigAccountX", 1, ModelRunStatus::Skipped),
                    model_run("ModelConfigAccount2", 2, ModelRunStatus::Pending),
                ],
            )
            .await
            .unwrap();

        let names: Vec<_> = model_runs.iter().map(|m| m.model_name.as_str()).collect();
        assert_eq!(names, ["ModelConfigAccount1", "ModelConfigAccountX", "ModelConfigAccount2"]);
        assert_eq!(model_runs[1].status, ModelRunStatus::Skipped);
        assert!(model_runs[1].ended_at.is_some());
        assert!(model_runs[0].model_run_id < model_runs[2].model_run_id);
    }

    #[tokio::test]
    async fn test_rejected_statement_is_reachable_store_error() {
        let store = setup_test_store().await;
        let run_id = store.try_begin_run(&run_create(RunMode::Development)).await.unwrap();

        let err = store
            .create_model_runs(
                run_id,
                vec![
                    model_run("ModelConfigAccount1", 0, ModelRunStatus::Pending),
                    model_run("ModelConfigAccount1", 1, ModelRunStatus::Pending),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Store(_)), "{err:?}");
        assert!(err.store_reachable());
        assert!(store.list_model_runs(run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_run_rejects_model_run_writes() {
        let store = setup_test_store().await;
        let run_id = store.try_begin_run(&run_create(RunMode::Development)).await.unwrap();
        let model_runs = store
            .create_model_runs(
                run_id,
                vec![
                    model_run("ModelConfigAccount1", 0, ModelRunStatus::Pending),
                    model_run("ModelConfigAccount2", 1, ModelRunStatus::Pending),
                ],
            )
            .await
            .unwrap();
        store
            .transition_model_run(run_id, &model_runs[0].model_name, ModelRunStatus::Running, None)
            .await
            .unwrap();

        // Forced abort from another process.
        store
            .transition_run(run_id, RunStatus::Aborted, Some("forced abort".into()))
            .await
            .unwrap();
        assert!(store.abort_requested(run_id).await.unwrap());

        let id = model_runs[0].model_run_id;
        let err = store
            .write_forecast_data(id, vec![data_row(id, "C1:1", "202001")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RunClosed(_)), "{err:?}");
        assert_eq!(store.count_forecast_data(id).await.unwrap(), 0);

        let err = store
            .transition_model_run(run_id, &model_runs[1].model_name, ModelRunStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RunClosed(_)), "{err:?}");
        let pending = store.get_model_run(run_id, &model_runs[1].model_name).await.unwrap().unwrap();
        assert_eq!(pending.status, ModelRunStatus::Pending);
    }

    #[tokio::test]
    async fn test_last_successful_cleaning_run_ignores_failed_imports() {
        let store = setup_test_store().await;
        assert_eq!(store.last_successful_cleaning_run().await.unwrap(), None);

        let completed = store.try_begin_run(&run_create(RunMode::Production)).await.unwrap();
        store.transition_run(completed, RunStatus::Preparing, None).await.unwrap();
        store.transition_run(completed, RunStatus::Running, None).await.unwrap();
        store.transition_run(completed, RunStatus::Completed, None).await.unwrap();

        let failed = store.try_begin_run(&run_create(RunMode::Production)).await.unwrap();
        store
            .transition_run(failed, RunStatus::Failed, Some("no model run succeeded".into()))
            .await
            .unwrap();

        let mut without_import = run_create(RunMode::Backward);
        without_import.includes_cleaning = false;
        let backward = store.try_begin_run(&without_import).await.unwrap();
        store.transition_run(backward, RunStatus::Preparing, None).await.unwrap();
        store.transition_run(backward, RunStatus::Running, None).await.unwrap();
        store.transition_run(backward, RunStatus::Completed, None).await.unwrap();

        assert_eq!(store.last_successful_cleaning_run().await.unwrap(), Some(completed));
    }

    #[tokio::test]
    async fn test_model_run_failure_records_error() {
        let store = setup_test_store().await;
        let (run_id, model_run) = running_model_run(&store).await;
        let error = ModelExecutionError::new(ExecutionCause::NonConvergence, "diverged");

        store
            .transition_model_run(run_id, &model_run.model_name, ModelRunStatus::Failed, Some(&error))
            .await
            .unwrap();

        let failed = store.get_model_run(run_id, &model_run.model_name).await.unwrap().unwrap();
        assert_eq!(failed.status, ModelRunStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("diverged"));
        assert_eq!(failed.error_cause, Some(ExecutionCause::NonConvergence));

        // Failed is terminal: no way back to Running.
        let err = store
            .transition_model_run(run_id, &model_run.model_name, ModelRunStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_write_forecast_data_marks_succeeded() {
        let store = setup_test_store().await;
        let (run_id, model_run) = running_model_run(&store).await;
        let id = model_run.model_run_id;

        let written = store
            .write_forecast_data(
                id,
                vec![data_row(id, "C1:1", "202001"), data_row(id, "C2:1", "202001")],
            )
            .await
            .unwrap();
        assert_eq!(written, 2);

        let stored = store.get_model_run(run_id, &model_run.model_name).await.unwrap().unwrap();
        assert_eq!(stored.status, ModelRunStatus::Succeeded);
        assert_eq!(stored.entity_count, Some(2));
        assert_eq!(store.count_forecast_data(id).await.unwrap(), 2);
        assert_eq!(store.forecast_data_for_run(run_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_forecast_rows_persist_nothing() {
        let store = setup_test_store().await;
        let (run_id, model_run) = running_model_run(&store).await;
        let id = model_run.model_run_id;

        let err = store
            .write_forecast_data(
                id,
                vec![data_row(id, "C1:1", "202001"), data_row(id, "C1:1", "202001")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));

        assert_eq!(store.count_forecast_data(id).await.unwrap(), 0);
        let stored = store.get_model_run(run_id, &model_run.model_name).await.unwrap().unwrap();
        assert_eq!(stored.status, ModelRunStatus::Running);
    }

    #[tokio::test]
    async fn test_forecast_data_requires_running_model_run() {
        let store = setup_test_store().await;
        let run_id = store.try_begin_run(&run_create(RunMode::Development)).await.unwrap();
        let model_runs = store
            .create_model_runs(run_id, vec![model_run("ModelConfigAccount1", 0, ModelRunStatus::Pending)])
            .await
            .unwrap();
        let id = model_runs[0].model_run_id;

        let err = store
            .write_forecast_data(id, vec![data_row(id, "C1:1", "202001")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(store.count_forecast_data(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replace_cleaned_data_drops_older_imports() {
        let store = setup_test_store().await;
        let row = |run: u64, month: &str| CleanedDataRow {
            run_id: RunId(run),
            account: AccountName::new("Account1"),
            entity: EntityKey::new("C1:1"),
            month: Month::parse(month).unwrap(),
            sales: 5.0,
        };

        store
            .replace_cleaned_data(RunId(1), vec![row(1, "201912"), row(1, "202001")])
            .await
            .unwrap();
        let deleted = store
            .replace_cleaned_data(RunId(2), vec![row(2, "202001")])
            .await
            .unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(store.cleaned_data_runs().await.unwrap(), vec![RunId(2)]);
        assert!(store.load_cleaned_data(RunId(1)).await.unwrap().is_empty());
        assert_eq!(store.load_cleaned_data(RunId(2)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_supersede_prior_actuals() {
        let store = setup_test_store().await;
        let (run_id, model_run) = running_model_run(&store).await;
        let id = model_run.model_run_id;
        store
            .write_forecast_data(id, vec![data_row(id, "C1:1", "202001")])
            .await
            .unwrap();

        store
            .supersede_prior_actuals(&[CleanedDataRow {
                run_id: RunId(run_id.get() + 1),
                account: AccountName::new("Account1"),
                entity: EntityKey::new("C1:1"),
                month: Month::parse("202001").unwrap(),
                sales: 12.0,
            }])
            .await
            .unwrap();

        let rows = store.forecast_data_for_model_run(id).await.unwrap();
        assert_eq!(rows[0].actual, Some(12.0));
    }

    #[tokio::test]
    async fn test_request_abort_only_for_active_runs() {
        let store = setup_test_store().await;
        let run_id = store.try_begin_run(&run_create(RunMode::Production)).await.unwrap();

        assert!(!store.abort_requested(run_id).await.unwrap());
        assert!(store.request_abort(run_id).await.unwrap());
        assert!(store.abort_requested(run_id).await.unwrap());

        store.transition_run(run_id, RunStatus::Aborted, None).await.unwrap();
        assert!(!store.request_abort(run_id).await.unwrap());
        assert!(!store.request_abort(RunId(99)).await.unwrap());
    }
}
