use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::compare::ComparisonReport;
use crate::db::RunRecordStore;
use crate::error::Result;
use crate::model::{ModelRunStatus, RunMode, RunStatus};
use crate::output::{MANIFEST_FILE, read_artifact, read_manifest};
use crate::registry::ModelConfigRegistry;
use crate::types::{EntityKey, ModelName};

/// Check the artifacts in a run directory against its manifest.
pub fn compare_structure(directory: &Path) -> Result<ComparisonReport> {
    let mut report = ComparisonReport::new("compare-structure");

    let manifest = match read_manifest(directory) {
        Ok(manifest) => manifest,
        Err(err) => {
            report.check_with(format!("{MANIFEST_FILE} readable"), false, err.to_string());
            return Ok(report);
        }
    };
    report.check(format!("{MANIFEST_FILE} of run {} readable", manifest.run_id), true);

    let expected_months = manifest.forecast_start.months_until(manifest.forecast_end) + 1;
    report.check_with(
        "horizon matches forecast periods",
        expected_months == manifest.forecast_periods as i32,
        format!(
            "{} - {}, {} periods",
            manifest.forecast_start, manifest.forecast_end, manifest.forecast_periods
        ),
    );

    let mut listed = BTreeSet::from([MANIFEST_FILE.to_string()]);
    for entry in &manifest.models {
        let expected_name = format!("{}.{}", entry.model_name, manifest.output_format.extension());
        if entry.status != ModelRunStatus::Succeeded {
            report.check_with(
                format!("{} has no artifact", entry.model_name),
                entry.file.is_none() && !directory.join(&expected_name).exists(),
                entry.status.as_str(),
            );
            continue;
        }

        let Some(file) = &entry.file else {
            report.check_with(
                format!("{} has an artifact", entry.model_name),
                false,
                "missing from manifest",
            );
            continue;
        };
        listed.insert(file.clone());

        let rows = match read_artifact(&directory.join(file), manifest.output_format) {
            Ok(rows) => rows,
            Err(err) => {
                report.check_with(format!("{file} readable"), false, err.to_string());
                continue;
            }
        };

        report.check_with(
            format!("{file} row count"),
            rows.len() == entry.rows,
            format!("manifest {}, file {}", entry.rows, rows.len()),
        );
        report.check(
            format!("{file} only holds {}", entry.model_name),
            rows.iter().all(|r| r.model_name == entry.model_name),
        );
        report.check(
            format!("{file} periods within horizon"),
            rows.iter()
                .all(|r| r.period >= manifest.forecast_start && r.period <= manifest.forecast_end),
        );

        let mut per_entity: BTreeMap<&EntityKey, u32> = BTreeMap::new();
        for row in &rows {
            *per_entity.entry(&row.entity).or_default() += 1;
        }
        let incomplete: Vec<&str> = per_entity
            .iter()
            .filter(|(_, count)| **count != manifest.forecast_periods)
            .map(|(entity, _)| entity.as_str())
            .collect();
        report.check_with(
            format!("{file} has every period per entity"),
            incomplete.is_empty(),
            format!("{} entities, incomplete: [{}]", per_entity.len(), incomplete.join(", ")),
        );
    }

    let mut unexpected = Vec::new();
    for dir_entry in fs::read_dir(directory)? {
        let name = dir_entry?.file_name().to_string_lossy().into_owned();
        if !listed.contains(&name) {
            unexpected.push(name);
        }
    }
    unexpected.sort();
    report.check_with(
        "no unexpected files",
        unexpected.is_empty(),
        format!("[{}]", unexpected.join(", ")),
    );

    debug!(checks = report.checks.len(), "Compared run directory structure");
    Ok(report)
}

/// Check the newest completed production run in the store.
///
/// Expects one model run per registry entry, in registry order, all succeeded,
/// each with `entity_count * forecast_periods` forecast rows.
pub async fn compare_structure_database(
    store: &RunRecordStore,
    registry: &ModelConfigRegistry,
) -> Result<ComparisonReport> {
    let mut report = ComparisonReport::new("compare-structure-database");

    let Some(run) = store.last_run(RunMode::Production, RunStatus::Completed).await? else {
        report.check_with(
            "completed production run exists",
            false,
            "no completed production run found",
        );
        return Ok(report);
    };
    report.check(format!("production run {} completed", run.run_id), true);

    let model_runs = store.list_model_runs(run.run_id).await?;
    let found: Vec<&ModelName> = model_runs.iter().map(|m| &m.model_name).collect();
    let expected = registry.names();
    report.check_with(
        "one model run per registry entry",
        found.len() == expected.len() && found.iter().zip(&expected).all(|(a, b)| *a == b),
        format!("expected {}, found {}", expected.len(), found.len()),
    );

    for model_run in &model_runs {
        let succeeded = model_run.status == ModelRunStatus::Succeeded;
        report.check_with(
            format!("{} succeeded", model_run.model_name),
            succeeded,
            model_run.status.as_str(),
        );
        if !succeeded {
            continue;
        }

        let rows = store.count_forecast_data(model_run.model_run_id).await?;
        let expected =
            model_run.entity_count.unwrap_or(0) as u64 * run.forecast_periods as u64;
        report.check_with(
            format!("{} forecast rows", model_run.model_name),
            rows == expected && rows > 0,
            format!("expected {expected}, found {rows}"),
        );
    }

    Ok(report)
}
