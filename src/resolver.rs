// 🔍 Version Resolver - NEW / CHANGED / UNCHANGED per staged identifier
//
// Staged identifier not current in the dimension      → NEW
// Current, fingerprint differs                         → CHANGED
// Current, fingerprint equal                           → UNCHANGED
// Current in the dimension but absent from the extract → untouched
//
// Absence is not treated as deletion: one extract is not proof that an
// entity is gone. Expiry would need its own classification driven by a
// full-population comparison.

use crate::attributes::EntityId;
use crate::dimension::DimensionSpec;
use crate::error::{MergeError, Result};
use crate::extract::EntityRecord;
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::temporal::DimensionRow;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Classification {
    New,
    Changed,
    Unchanged,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::New => "NEW",
            Classification::Changed => "CHANGED",
            Classification::Unchanged => "UNCHANGED",
        }
    }

    /// Whether the Temporal Writer has anything to do.
    pub fn needs_write(&self) -> bool {
        !matches!(self, Classification::Unchanged)
    }
}

/// A staged record with its fingerprint.
#[derive(Debug, Clone)]
pub struct Fingerprinted {
    pub record: EntityRecord,
    pub fingerprint: Fingerprint,
}

/// Classification of one staged identifier.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub record: EntityRecord,
    pub class: Classification,
    pub staged: Fingerprint,
    pub current: Option<Fingerprint>,
}

impl Resolved {
    pub fn id(&self) -> &EntityId {
        &self.record.id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
}

/// Total classification of a staged set, ordered by identifier.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    entries: Vec<Resolved>,
}

impl Resolution {
    pub fn entries(&self) -> &[Resolved] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &EntityId) -> Option<&Resolved> {
        self.entries
            .binary_search_by(|e| e.record.id.cmp(id))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn class_of(&self, id: &EntityId) -> Option<Classification> {
        self.get(id).map(|r| r.class)
    }

    /// NEW and CHANGED entries, in identifier order.
    pub fn pending_writes(&self) -> impl Iterator<Item = &Resolved> {
        self.entries.iter().filter(|e| e.class.needs_write())
    }

    pub fn counts(&self) -> ClassCounts {
        let mut counts = ClassCounts::default();
        for entry in &self.entries {
            match entry.class {
                Classification::New => counts.new += 1,
                Classification::Changed => counts.changed += 1,
                Classification::Unchanged => counts.unchanged += 1,
            }
        }
        counts
    }
}

/// Reject extracts that carry an identifier more than once.
///
/// Reports the smallest offending identifier so the error is deterministic.
pub fn check_duplicates(staged: &[EntityRecord]) -> Result<()> {
    let mut seen: BTreeMap<&EntityId, usize> = BTreeMap::new();
    for record in staged {
        *seen.entry(&record.id).or_default() += 1;
    }

    match seen.into_iter().find(|(_, count)| *count > 1) {
        Some((id, count)) => Err(MergeError::DuplicateIdentifier {
            id: id.clone(),
            count,
        }),
        None => Ok(()),
    }
}

// ============================================================================
// VERSION RESOLVER
// ============================================================================

pub struct VersionResolver {
    fingerprinter: Fingerprinter,
}

impl VersionResolver {
    pub fn new(spec: &DimensionSpec) -> Self {
        VersionResolver {
            fingerprinter: Fingerprinter::for_dimension(spec),
        }
    }

    pub fn fingerprinter(&self) -> &Fingerprinter {
        &self.fingerprinter
    }

    /// Fingerprint every staged record. Fails on the first TypeMismatch.
    pub fn fingerprint_staged(&self, staged: Vec<EntityRecord>) -> Result<Vec<Fingerprinted>> {
        staged
            .into_iter()
            .map(|record| {
                let fingerprint = self.fingerprinter.fingerprint(&record.tracked)?;
                Ok(Fingerprinted { record, fingerprint })
            })
            .collect()
    }

    /// Fingerprint the current version of every identifier.
    ///
    /// Two current rows for one identifier means the table is already
    /// corrupt; that is reported as a conflict rather than guessed around.
    pub fn fingerprint_current(
        &self,
        current: &[DimensionRow],
    ) -> Result<HashMap<EntityId, Fingerprint>> {
        let mut fingerprints = HashMap::with_capacity(current.len());
        for row in current.iter().filter(|r| r.is_current) {
            let fingerprint = self.fingerprinter.fingerprint(&row.tracked)?;
            if fingerprints.insert(row.id.clone(), fingerprint).is_some() {
                return Err(MergeError::conflict(
                    &row.id,
                    "dimension holds more than one current row",
                ));
            }
        }
        Ok(fingerprints)
    }

    /// Classify fingerprinted records against current fingerprints.
    pub fn classify(
        &self,
        staged: Vec<Fingerprinted>,
        current: &HashMap<EntityId, Fingerprint>,
    ) -> Result<Resolution> {
        let mut entries: Vec<Resolved> = staged
            .into_iter()
            .map(|f| {
                let existing = current.get(&f.record.id).copied();
                let class = match existing {
                    None => Classification::New,
                    Some(fp) if fp != f.fingerprint => Classification::Changed,
                    Some(_) => Classification::Unchanged,
                };
                Resolved {
                    record: f.record,
                    class,
                    staged: f.fingerprint,
                    current: existing,
                }
            })
            .collect();

        entries.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        if let Some(pair) = entries.windows(2).find(|w| w[0].record.id == w[1].record.id) {
            let id = pair[0].record.id.clone();
            let count = entries.iter().filter(|e| e.record.id == id).count();
            return Err(MergeError::DuplicateIdentifier { id, count });
        }

        Ok(Resolution { entries })
    }

    /// Full contract: staged set × current rows → classification.
    pub fn resolve(&self, staged: Vec<EntityRecord>, current: &[DimensionRow]) -> Result<Resolution> {
        check_duplicates(&staged)?;
        let staged = self.fingerprint_staged(staged)?;
        let current = self.fingerprint_current(current)?;
        self.classify(staged, &current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AttributeDefinition, AttributeType, Attributes};
    use chrono::{TimeZone, Utc};

    fn spec() -> DimensionSpec {
        DimensionSpec::new("customer", "dim_customer", "customer_id")
            .track(AttributeDefinition::new("profession", AttributeType::Text))
            .pass_through(AttributeDefinition::new("postcode", AttributeType::Text))
    }

    fn staged(id: i64, profession: &str) -> EntityRecord {
        EntityRecord::new(id).with("profession", profession)
    }

    fn current(id: i64, profession: &str) -> DimensionRow {
        let mut tracked = Attributes::new();
        tracked.insert("profession".into(), profession.into());
        DimensionRow::current(
            EntityId::from(id),
            tracked,
            Attributes::new(),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_classifies_new_changed_unchanged() {
        let resolver = VersionResolver::new(&spec());

        let resolution = resolver
            .resolve(
                vec![
                    staged(1001, "Teacher"),
                    staged(1002, "Engineer"),
                    staged(1003, "Chef"),
                ],
                &[current(1001, "Engineer"), current(1002, "Engineer")],
            )
            .unwrap();

        assert_eq!(resolution.class_of(&EntityId::from(1001)), Some(Classification::Changed));
        assert_eq!(resolution.class_of(&EntityId::from(1002)), Some(Classification::Unchanged));
        assert_eq!(resolution.class_of(&EntityId::from(1003)), Some(Classification::New));
        assert_eq!(
            resolution.counts(),
            ClassCounts {
                new: 1,
                changed: 1,
                unchanged: 1
            }
        );
        assert_eq!(resolution.pending_writes().count(), 2);
    }

    #[test]
    fn test_absent_identifiers_are_not_classified() {
        let resolver = VersionResolver::new(&spec());

        let resolution = resolver
            .resolve(vec![staged(1001, "Engineer")], &[current(1001, "Engineer"), current(9999, "Nurse")])
            .unwrap();

        assert_eq!(resolution.len(), 1);
        assert_eq!(resolution.class_of(&EntityId::from(9999)), None);
    }

    #[test]
    fn test_passthrough_change_is_unchanged() {
        let resolver = VersionResolver::new(&spec());
        let moved = staged(1001, "Engineer").with_passthrough("postcode", "LS1 4AP");

        let resolution = resolver.resolve(vec![moved], &[current(1001, "Engineer")]).unwrap();

        assert_eq!(resolution.class_of(&EntityId::from(1001)), Some(Classification::Unchanged));
    }

    #[test]
    fn test_duplicate_identifier_is_rejected() {
        let resolver = VersionResolver::new(&spec());

        let err = resolver
            .resolve(vec![staged(2002, "Nurse"), staged(2002, "Chef")], &[])
            .unwrap_err();

        match err {
            MergeError::DuplicateIdentifier { id, count } => {
                assert_eq!(id, EntityId::from(2002));
                assert_eq!(count, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_classify_also_guards_duplicates() {
        let resolver = VersionResolver::new(&spec());
        let staged = resolver
            .fingerprint_staged(vec![staged(5, "a"), staged(5, "a"), staged(5, "b")])
            .unwrap();

        let err = resolver.classify(staged, &HashMap::new()).unwrap_err();
        assert!(matches!(err, MergeError::DuplicateIdentifier { count: 3, .. }));
    }

    #[test]
    fn test_two_current_rows_is_a_conflict() {
        let resolver = VersionResolver::new(&spec());

        let err = resolver
            .resolve(vec![staged(1, "a")], &[current(1, "a"), current(1, "b")])
            .unwrap_err();
        assert!(matches!(err, MergeError::WriteConflict { .. }));
    }

    #[test]
    fn test_resolution_is_total_and_sorted() {
        let resolver = VersionResolver::new(&spec());
        let ids = [30, 4, 17, 1];

        let resolution = resolver
            .resolve(ids.iter().map(|i| staged(*i, "x")).collect(), &[])
            .unwrap();

        assert_eq!(resolution.len(), ids.len());
        let ordered: Vec<&str> = resolution.entries().iter().map(|e| e.id().as_str()).collect();
        let mut expected: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        expected.sort();
        assert_eq!(ordered, expected.iter().map(|s| s.as_str()).collect::<Vec<_>>());
    }
}
