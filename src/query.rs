// 🔎 Queries - what downstream consumers read from a dimension
//
//   current snapshot:   is_current = 1
//   point in time t:    valid_from <= t AND (valid_to IS NULL OR valid_to > t)
//   history:            every version of one identifier
//   verify:             current-row and window invariants over the whole table

use crate::attributes::EntityId;
use crate::dimension::DimensionSpec;
use crate::error::Result;
use crate::store::DimensionStore;
use crate::temporal::{verify_history, DimensionRow, EntityTimeline, InvariantReport};
use chrono::{DateTime, Utc};
use tracing::warn;

pub fn current_snapshot<S: DimensionStore + ?Sized>(
    store: &S,
    spec: &DimensionSpec,
) -> Result<Vec<DimensionRow>> {
    store.current_rows(spec)
}

pub fn snapshot_at<S: DimensionStore + ?Sized>(
    store: &S,
    spec: &DimensionSpec,
    at: DateTime<Utc>,
) -> Result<Vec<DimensionRow>> {
    store.rows_at(spec, at)
}

pub fn entity_history<S: DimensionStore + ?Sized>(
    store: &S,
    spec: &DimensionSpec,
    id: &EntityId,
) -> Result<EntityTimeline> {
    Ok(EntityTimeline::new(id.clone(), store.history(spec, id)?))
}

/// Scan a dimension for invariant violations.
pub fn verify_dimension<S: DimensionStore + ?Sized>(
    store: &S,
    spec: &DimensionSpec,
) -> Result<InvariantReport> {
    let report = verify_history(store.all_rows(spec)?);
    if !report.is_clean() {
        warn!(
            dimension = %spec.name,
            violations = report.violations.len(),
            "dimension violates SCD2 invariants"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AttributeDefinition, AttributeType, AttributeValue};
    use crate::extract::EntityRecord;
    use crate::orchestrator::MergeOrchestrator;
    use crate::store::SqliteStore;
    use crate::temporal::VersionState;
    use chrono::TimeZone;

    fn spec() -> DimensionSpec {
        DimensionSpec::new("store", "dim_store", "store_id")
            .track(AttributeDefinition::new("manager", AttributeType::Text))
    }

    fn at(month: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, month, 1, 0, 0, 0).unwrap()
    }

    fn merge(store: &mut SqliteStore, month: u32, managers: &[(i64, &str)]) {
        let records = managers
            .iter()
            .map(|(id, manager)| EntityRecord::new(*id).with("manager", *manager))
            .collect();
        MergeOrchestrator::new(store, spec())
            .with_as_of(at(month))
            .run(records, None)
            .unwrap();
    }

    #[test]
    fn test_queries_over_sqlite() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        merge(&mut store, 1, &[(1, "Jo Bloggs"), (2, "Kim Lee")]);
        merge(&mut store, 3, &[(1, "Sam Smith")]);
        merge(&mut store, 5, &[(1, "Ana Diaz"), (3, "Raj Patel")]);

        let current = current_snapshot(&store, &spec()).unwrap();
        assert_eq!(current.len(), 3);

        let february = snapshot_at(&store, &spec(), at(2)).unwrap();
        assert_eq!(february.len(), 2);
        assert_eq!(february[0].tracked["manager"], AttributeValue::text("Jo Bloggs"));

        let timeline = entity_history(&store, &spec(), &EntityId::from(1)).unwrap();
        assert_eq!(timeline.version_count(), 3);
        assert_eq!(timeline.state(), VersionState::Current);
        assert_eq!(
            timeline.as_of(at(4)).unwrap().tracked["manager"],
            AttributeValue::text("Sam Smith")
        );

        let report = verify_dimension(&store, &spec()).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.identifiers, 3);
        assert_eq!(report.rows, 5);
    }
}
