//! In-memory store, for tests and dry runs.

use crate::attributes::EntityId;
use crate::dimension::DimensionSpec;
use crate::error::{MergeError, Result};
use crate::extract::EntityRecord;
use crate::orchestrator::RunReport;
use crate::store::{DimensionStore, StagingArea, VersionWrite};
use crate::temporal::DimensionRow;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: HashMap<String, Vec<DimensionRow>>,
    columns: HashMap<String, Vec<String>>,
    staging: HashMap<String, BTreeMap<String, Vec<EntityRecord>>>,
    runs: Vec<RunReport>,
    commits: usize,
    fail_after: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `commit_version` after the first `n` fail with
    /// `StoreUnavailable`.
    pub fn fail_writes_after(&mut self, n: usize) {
        self.fail_after = Some(n);
        self.commits = 0;
    }

    pub fn heal(&mut self) {
        self.fail_after = None;
    }

    fn table(&self, spec: &DimensionSpec) -> Result<&Vec<DimensionRow>> {
        self.tables
            .get(&spec.table)
            .ok_or_else(|| MergeError::StoreUnavailable(format!("no such table: {}", spec.table)))
    }

    fn select(
        &self,
        spec: &DimensionSpec,
        filter: impl Fn(&DimensionRow) -> bool,
    ) -> Result<Vec<DimensionRow>> {
        let mut rows: Vec<DimensionRow> = self
            .table(spec)?
            .iter()
            .filter(|r| filter(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id).then(a.valid_from.cmp(&b.valid_from)));
        Ok(rows)
    }
}

impl DimensionStore for MemoryStore {
    fn ensure_dimension(&mut self, spec: &DimensionSpec) -> Result<()> {
        spec.validate()?;

        let wanted: Vec<String> = spec.all_attributes().map(|a| a.name.clone()).collect();
        if let Some(existing) = self.columns.get(&spec.table) {
            if let Some(missing) = wanted.iter().find(|c| !existing.contains(c)) {
                return Err(MergeError::Config(format!(
                    "table {} has no column '{}' (schema evolution is not supported)",
                    spec.table, missing
                )));
            }
            return Ok(());
        }

        self.columns.insert(spec.table.clone(), wanted);
        self.tables.entry(spec.table.clone()).or_default();
        self.staging.entry(spec.staging_table()).or_default();
        Ok(())
    }

    fn current_rows(&self, spec: &DimensionSpec) -> Result<Vec<DimensionRow>> {
        self.select(spec, |r| r.is_current)
    }

    fn current_row(&self, spec: &DimensionSpec, id: &EntityId) -> Result<Option<DimensionRow>> {
        Ok(self
            .select(spec, |r| r.is_current && &r.id == id)?
            .pop())
    }

    fn history(&self, spec: &DimensionSpec, id: &EntityId) -> Result<Vec<DimensionRow>> {
        self.select(spec, |r| &r.id == id)
    }

    fn rows_at(&self, spec: &DimensionSpec, at: DateTime<Utc>) -> Result<Vec<DimensionRow>> {
        self.select(spec, |r| r.was_valid_at(at))
    }

    fn all_rows(&self, spec: &DimensionSpec) -> Result<Vec<DimensionRow>> {
        self.select(spec, |_| true)
    }

    fn count_valid_from(&self, spec: &DimensionSpec, as_of: DateTime<Utc>) -> Result<usize> {
        Ok(self.table(spec)?.iter().filter(|r| r.valid_from == as_of).count())
    }

    fn latest_valid_from(&self, spec: &DimensionSpec) -> Result<Option<DateTime<Utc>>> {
        Ok(self.table(spec)?.iter().map(|r| r.valid_from).max())
    }

    fn commit_version(&mut self, spec: &DimensionSpec, write: &VersionWrite) -> Result<()> {
        if let Some(limit) = self.fail_after {
            if self.commits >= limit {
                return Err(MergeError::StoreUnavailable("injected write failure".into()));
            }
        }

        let rows = self
            .tables
            .get_mut(&spec.table)
            .ok_or_else(|| MergeError::StoreUnavailable(format!("no such table: {}", spec.table)))?;

        // Validate everything before touching anything
        let current_idx = rows.iter().position(|r| r.id == write.id && r.is_current);
        let close_idx = match (&write.close, current_idx) {
            (Some(close), Some(idx)) if rows[idx].valid_from == close.valid_from => {
                if close.valid_to <= close.valid_from {
                    return Err(MergeError::conflict(&write.id, "close would leave an empty window"));
                }
                Some(idx)
            }
            (Some(close), _) => {
                return Err(MergeError::conflict(
                    &write.id,
                    format!("no current row from {}", crate::temporal::format_ts(&close.valid_from)),
                ));
            }
            (None, Some(_)) => {
                return Err(MergeError::conflict(&write.id, "identifier already has a current row"));
            }
            (None, None) => None,
        };
        if rows
            .iter()
            .any(|r| r.id == write.id && r.valid_from == write.insert.valid_from)
        {
            return Err(MergeError::conflict(
                &write.id,
                "a version with this valid_from already exists",
            ));
        }

        if let (Some(idx), Some(close)) = (close_idx, &write.close) {
            rows[idx].valid_to = Some(close.valid_to);
            rows[idx].is_current = false;
        }
        rows.push(write.insert.clone());
        self.commits += 1;
        Ok(())
    }

    fn record_run(&mut self, report: &RunReport) -> Result<()> {
        match self.runs.iter_mut().find(|r| r.run_id == report.run_id) {
            Some(existing) => *existing = report.clone(),
            None => self.runs.push(report.clone()),
        }
        Ok(())
    }

    fn runs(&self, dimension: Option<&str>) -> Result<Vec<RunReport>> {
        Ok(self
            .runs
            .iter()
            .rev()
            .filter(|r| dimension.map_or(true, |d| r.dimension == d))
            .cloned()
            .collect())
    }
}

impl StagingArea for MemoryStore {
    fn stage_batch(
        &mut self,
        spec: &DimensionSpec,
        batch: &str,
        records: &[EntityRecord],
    ) -> Result<usize> {
        self.staging
            .entry(spec.staging_table())
            .or_default()
            .insert(batch.to_string(), records.to_vec());
        Ok(records.len())
    }

    fn staged_batch(&self, spec: &DimensionSpec, batch: &str) -> Result<Vec<EntityRecord>> {
        Ok(self
            .staging
            .get(&spec.staging_table())
            .and_then(|batches| batches.get(batch))
            .cloned()
            .unwrap_or_default())
    }

    fn staged_batches(&self, spec: &DimensionSpec) -> Result<Vec<(String, usize)>> {
        Ok(self
            .staging
            .get(&spec.staging_table())
            .map(|batches| {
                batches
                    .iter()
                    .map(|(batch, records)| (batch.clone(), records.len()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AttributeDefinition, AttributeType, Attributes};
    use crate::store::CloseVersion;
    use chrono::TimeZone;

    fn spec() -> DimensionSpec {
        DimensionSpec::new("product", "dim_product", "product_id")
            .track(AttributeDefinition::new("price", AttributeType::Decimal))
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, day, 0, 0, 0).unwrap()
    }

    fn row(id: i64, price: f64, from: DateTime<Utc>) -> DimensionRow {
        let mut tracked = Attributes::new();
        tracked.insert("price".into(), price.into());
        DimensionRow::current(EntityId::from(id), tracked, Attributes::new(), from)
    }

    fn insert(id: i64, price: f64, from: DateTime<Utc>) -> VersionWrite {
        VersionWrite {
            id: EntityId::from(id),
            close: None,
            insert: row(id, price, from),
        }
    }

    #[test]
    fn test_close_then_insert() {
        let mut store = MemoryStore::new();
        let spec = spec();
        store.ensure_dimension(&spec).unwrap();

        store.commit_version(&spec, &insert(1000, 1200.0, at(1))).unwrap();
        store
            .commit_version(
                &spec,
                &VersionWrite {
                    close: Some(CloseVersion { valid_from: at(1), valid_to: at(2) }),
                    ..insert(1000, 1150.0, at(2))
                },
            )
            .unwrap();

        let history = store.history(&spec, &EntityId::from(1000)).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].valid_to, Some(at(2)));
        assert_eq!(store.current_rows(&spec).unwrap().len(), 1);
        assert_eq!(store.latest_valid_from(&spec).unwrap(), Some(at(2)));
    }

    #[test]
    fn test_rejected_write_changes_nothing() {
        let mut store = MemoryStore::new();
        let spec = spec();
        store.ensure_dimension(&spec).unwrap();
        store.commit_version(&spec, &insert(1000, 1200.0, at(1))).unwrap();

        let err = store.commit_version(&spec, &insert(1000, 999.0, at(3))).unwrap_err();
        assert!(matches!(err, MergeError::WriteConflict { .. }));

        let stale = VersionWrite {
            close: Some(CloseVersion { valid_from: at(2), valid_to: at(3) }),
            ..insert(1000, 999.0, at(3))
        };
        assert!(store.commit_version(&spec, &stale).is_err());
        assert_eq!(store.all_rows(&spec).unwrap().len(), 1);
    }

    #[test]
    fn test_injected_failure() {
        let mut store = MemoryStore::new();
        let spec = spec();
        store.ensure_dimension(&spec).unwrap();
        store.fail_writes_after(1);

        store.commit_version(&spec, &insert(1, 1.0, at(1))).unwrap();
        let err = store.commit_version(&spec, &insert(2, 2.0, at(1))).unwrap_err();
        assert!(matches!(err, MergeError::StoreUnavailable(_)));

        store.heal();
        store.commit_version(&spec, &insert(2, 2.0, at(1))).unwrap();
        assert_eq!(store.count_valid_from(&spec, at(1)).unwrap(), 2);
    }

    #[test]
    fn test_staging_replaces_batch() {
        let mut store = MemoryStore::new();
        let spec = spec();
        store.ensure_dimension(&spec).unwrap();
        let records = vec![EntityRecord::new(1000).with("price", 1200.0)];

        store.stage_batch(&spec, "2025-06-30", &records).unwrap();
        store.stage_batch(&spec, "2025-06-30", &records).unwrap();

        assert_eq!(store.staged_batch(&spec, "2025-06-30").unwrap(), records);
        assert_eq!(
            store.staged_batches(&spec).unwrap(),
            vec![("2025-06-30".to_string(), 1)]
        );
        assert!(store.staged_batch(&spec, "2025-07-01").unwrap().is_empty());
    }
}
