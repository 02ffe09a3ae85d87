use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::compare::ComparisonReport;
use crate::db::RunRecordStore;
use crate::error::{Error, Result};
use crate::model::RunStatus;
use crate::types::{EntityKey, ModelName, Month, RunId};

/// Absolute difference tolerated between persisted and reference predictions.
pub const DEFAULT_TOLERANCE: f64 = 1e-6;

/// Mismatches listed in a check detail before the rest is summarised.
const MAX_LISTED: usize = 5;

#[derive(Debug, Deserialize)]
struct ReferenceRow {
    model_name: ModelName,
    entity: EntityKey,
    period: Month,
    prediction: f64,
}

fn load_reference(path: &Path) -> Result<Vec<ReferenceRow>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?;
    reader
        .deserialize()
        .collect::<std::result::Result<Vec<ReferenceRow>, _>>()
        .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))
}

fn summarize(items: &[String]) -> String {
    let mut listed = items.iter().take(MAX_LISTED).cloned().collect::<Vec<_>>().join("; ");
    if items.len() > MAX_LISTED {
        listed.push_str(&format!("; and {} more", items.len() - MAX_LISTED));
    }
    listed
}

/// Compare persisted forecast values of a run with a reference CSV
/// (`model_name,entity,period,prediction`).
///
/// Without `run_id` the newest completed run is used.
pub async fn compare_results(
    store: &RunRecordStore,
    reference: &Path,
    run_id: Option<RunId>,
    tolerance: f64,
) -> Result<ComparisonReport> {
    let expected = load_reference(reference)?;
    let mut report = ComparisonReport::new("compare-results");

    let run = match run_id {
        Some(run_id) => store.get_run(run_id).await?,
        None => store
            .list_runs()
            .await?
            .into_iter()
            .filter(|r| r.status == RunStatus::Completed)
            .max_by_key(|r| r.run_id),
    };
    let Some(run) = run else {
        report.check_with("run to compare exists", false, "no matching completed run");
        return Ok(report);
    };
    report.check_with(
        format!("run {} completed", run.run_id),
        run.status == RunStatus::Completed,
        run.status.as_str(),
    );

    let persisted: HashMap<(ModelName, EntityKey, Month), f64> = store
        .forecast_data_for_run(run.run_id)
        .await?
        .into_iter()
        .map(|row| ((row.model_name, row.entity, row.period), row.prediction))
        .collect();

    let mut missing = Vec::new();
    let mut mismatched = Vec::new();
    for row in &expected {
        let key = (row.model_name.clone(), row.entity.clone(), row.period);
        match persisted.get(&key) {
            None => missing.push(format!("{} {} {}", row.model_name, row.entity, row.period)),
            Some(actual) if (actual - row.prediction).abs() > tolerance => mismatched.push(format!(
                "{} {} {}: expected {}, found {actual}",
                row.model_name, row.entity, row.period, row.prediction
            )),
            Some(_) => {}
        }
    }

    report.check_with(
        "row count matches reference",
        persisted.len() == expected.len(),
        format!("reference {}, persisted {}", expected.len(), persisted.len()),
    );
    report.check_with(
        "all reference rows persisted",
        missing.is_empty(),
        summarize(&missing),
    );
    report.check_with(
        format!("predictions within tolerance {tolerance}"),
        mismatched.is_empty(),
        summarize(&mismatched),
    );

    Ok(report)
}
