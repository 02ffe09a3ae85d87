use std::collections::BTreeMap;

use crate::db::CleanedDataRow;
use crate::preparation::loader::ExtractRecord;
use crate::types::{AccountName, EntityKey, Month, RunId};

/// Clean validated extract rows for storage under `run_id`.
///
/// Rows with the same account, entity and month are summed; negative totals
/// (returns exceeding sales) are clamped to zero. Output is sorted by key.
pub fn clean(run_id: RunId, records: Vec<ExtractRecord>) -> Vec<CleanedDataRow> {
    let mut totals: BTreeMap<(AccountName, EntityKey, Month), f64> = BTreeMap::new();
    for record in records {
        *totals
            .entry((record.account, record.entity, record.month))
            .or_insert(0.0) += record.sales;
    }

    totals
        .into_iter()
        .map(|((account, entity, month), sales)| CleanedDataRow {
            run_id,
            account,
            entity,
            month,
            sales: sales.max(0.0),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(entity: &str, month: &str, sales: f64) -> ExtractRecord {
        ExtractRecord {
            account: AccountName::new("Account1"),
            entity: EntityKey::new(entity),
            month: Month::parse(month).unwrap(),
            sales,
        }
    }

    #[test]
    fn test_duplicates_are_summed() {
        let cleaned = clean(
            RunId(3),
            vec![
                record("C1:1", "202001", 2.0),
                record("C1:1", "202001", 5.0),
                record("C2:1", "202001", 1.0),
            ],
        );
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].sales, 7.0);
        assert_eq!(cleaned[0].run_id, RunId(3));
    }

    #[test]
    fn test_negative_totals_clamped() {
        let cleaned = clean(
            RunId(1),
            vec![record("C1:1", "202001", 2.0), record("C1:1", "202001", -5.0)],
        );
        assert_eq!(cleaned[0].sales, 0.0);
    }

    #[test]
    fn test_output_sorted_by_month() {
        let cleaned = clean(
            RunId(1),
            vec![record("C1:1", "202002", 1.0), record("C1:1", "201912", 1.0)],
        );
        assert_eq!(cleaned[0].month.to_string(), "201912");
    }
}
