// ⏰ Temporal Model - validity windows, timelines and the run clock
//
// Every dimension row is a VALUE of an identity over a window:
//   valid_from (inclusive) → valid_to (exclusive, None while current)
//
// Per identifier the lifecycle is:
//   NONE → CURRENT → CURRENT (new version, previous one closed) → ...
// A closed row is never reopened, and valid_to is written exactly once.

use crate::attributes::{Attributes, EntityId};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// Truncate to microseconds so the value round-trips through the store.
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// Fixed-width RFC3339 (microseconds, `Z`), so text order equals time order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// CLOCK
// ============================================================================

/// Source of the as-of instant for a run.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant (as_of overrides, tests).
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// ============================================================================
// DIMENSION ROW
// ============================================================================

/// One persisted version of an entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionRow {
    pub id: EntityId,

    /// Tracked attribute snapshot at insert time
    pub tracked: Attributes,

    /// Pass-through attribute snapshot at insert time
    pub passthrough: Attributes,

    /// Inclusive start of validity
    pub valid_from: DateTime<Utc>,

    /// Exclusive end of validity (None = still current)
    pub valid_to: Option<DateTime<Utc>>,

    pub is_current: bool,
}

impl DimensionRow {
    /// New current version starting at `as_of`.
    pub fn current(
        id: EntityId,
        tracked: Attributes,
        passthrough: Attributes,
        as_of: DateTime<Utc>,
    ) -> Self {
        DimensionRow {
            id,
            tracked,
            passthrough,
            valid_from: as_of,
            valid_to: None,
            is_current: true,
        }
    }

    /// Check if this version was valid at a specific time
    pub fn was_valid_at(&self, time: DateTime<Utc>) -> bool {
        self.valid_from <= time && self.valid_to.map_or(true, |until| until > time)
    }

    pub fn is_closed(&self) -> bool {
        self.valid_to.is_some()
    }
}

// ============================================================================
// ENTITY TIMELINE
// ============================================================================

/// Where an identifier is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionState {
    /// Never observed
    None,
    /// Has exactly one current version
    Current,
    /// Has history but no current version (only reachable through corruption
    /// or an explicit expiry, which this engine does not perform)
    Closed,
}

/// All versions of one identifier, ordered by valid_from.
#[derive(Debug, Clone)]
pub struct EntityTimeline {
    pub id: EntityId,
    versions: Vec<DimensionRow>,
}

impl EntityTimeline {
    pub fn new(id: EntityId, mut versions: Vec<DimensionRow>) -> Self {
        versions.sort_by(|a, b| a.valid_from.cmp(&b.valid_from));
        EntityTimeline { id, versions }
    }

    /// Group rows of many identifiers into timelines.
    pub fn group(rows: Vec<DimensionRow>) -> Vec<EntityTimeline> {
        let mut by_id: BTreeMap<EntityId, Vec<DimensionRow>> = BTreeMap::new();
        for row in rows {
            by_id.entry(row.id.clone()).or_default().push(row);
        }
        by_id
            .into_iter()
            .map(|(id, versions)| EntityTimeline::new(id, versions))
            .collect()
    }

    pub fn state(&self) -> VersionState {
        if self.versions.is_empty() {
            VersionState::None
        } else if self.versions.iter().any(|v| v.is_current) {
            VersionState::Current
        } else {
            VersionState::Closed
        }
    }

    pub fn current(&self) -> Option<&DimensionRow> {
        self.versions.iter().find(|v| v.is_current)
    }

    /// Version valid at time `t`, if any.
    pub fn as_of(&self, t: DateTime<Utc>) -> Option<&DimensionRow> {
        self.versions.iter().find(|v| v.was_valid_at(t))
    }

    pub fn history(&self) -> &[DimensionRow] {
        &self.versions
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Current-row count, window shape, overlaps and gaps for this identifier.
    pub fn violations(&self) -> Vec<Violation> {
        let mut found = Vec::new();
        let violation = |kind: ViolationKind, detail: String| Violation {
            id: self.id.clone(),
            kind,
            detail,
        };

        let current_count = self.versions.iter().filter(|v| v.is_current).count();
        if current_count != 1 && !self.versions.is_empty() {
            found.push(violation(
                ViolationKind::CurrentCount,
                format!("{} current rows", current_count),
            ));
        }

        for row in &self.versions {
            match (row.is_current, row.valid_to) {
                (true, Some(to)) => found.push(violation(
                    ViolationKind::Window,
                    format!("current row has valid_to {}", format_ts(&to)),
                )),
                (false, None) => found.push(violation(
                    ViolationKind::Window,
                    format!("closed row from {} has no valid_to", format_ts(&row.valid_from)),
                )),
                (_, Some(to)) if to <= row.valid_from => found.push(violation(
                    ViolationKind::Window,
                    format!(
                        "empty window {} → {}",
                        format_ts(&row.valid_from),
                        format_ts(&to)
                    ),
                )),
                _ => {}
            }
        }

        for pair in self.versions.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            match prev.valid_to {
                Some(to) if to == next.valid_from => {}
                Some(to) if to > next.valid_from => found.push(violation(
                    ViolationKind::Overlap,
                    format!(
                        "window ending {} overlaps version starting {}",
                        format_ts(&to),
                        format_ts(&next.valid_from)
                    ),
                )),
                Some(to) => found.push(violation(
                    ViolationKind::Gap,
                    format!(
                        "gap between {} and {}",
                        format_ts(&to),
                        format_ts(&next.valid_from)
                    ),
                )),
                None => found.push(violation(
                    ViolationKind::Overlap,
                    format!(
                        "open version from {} is followed by {}",
                        format_ts(&prev.valid_from),
                        format_ts(&next.valid_from)
                    ),
                )),
            }
        }

        found
    }
}

// ============================================================================
// INVARIANT REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationKind {
    /// Not exactly one current row
    CurrentCount,
    /// is_current / valid_to disagree, or empty window
    Window,
    /// Two windows overlap
    Overlap,
    /// A version does not start where its predecessor ended
    Gap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub id: EntityId,
    pub kind: ViolationKind,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InvariantReport {
    pub identifiers: usize,
    pub rows: usize,
    pub violations: Vec<Violation>,
}

impl InvariantReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Scan every version of a dimension.
pub fn verify_history(rows: Vec<DimensionRow>) -> InvariantReport {
    let row_count = rows.len();
    let timelines = EntityTimeline::group(rows);

    InvariantReport {
        identifiers: timelines.len(),
        rows: row_count,
        violations: timelines.iter().flat_map(|t| t.violations()).collect(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeValue;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 6, 0, 0).unwrap()
    }

    fn version(id: i64, profession: &str, from: u32, to: Option<u32>) -> DimensionRow {
        let mut tracked = Attributes::new();
        tracked.insert("profession".into(), AttributeValue::text(profession));
        DimensionRow {
            id: EntityId::from(id),
            tracked,
            passthrough: Attributes::new(),
            valid_from: at(from),
            valid_to: to.map(at),
            is_current: to.is_none(),
        }
    }

    #[test]
    fn test_timestamp_format_round_trip() {
        let ts = truncate_micros(Utc::now());
        let text = format_ts(&ts);

        assert!(text.ends_with('Z'));
        assert_eq!(parse_ts(&text), Some(ts));
    }

    #[test]
    fn test_formatted_timestamps_sort_chronologically() {
        let earlier = format_ts(&at(2));
        let later = format_ts(&at(10));
        assert!(earlier < later);
    }

    #[test]
    fn test_row_validity_window() {
        let row = version(1001, "Engineer", 1, Some(5));

        assert!(row.was_valid_at(at(1)));
        assert!(row.was_valid_at(at(4)));
        assert!(!row.was_valid_at(at(5)));
        assert!(row.is_closed());
    }

    #[test]
    fn test_timeline_as_of() {
        let timeline = EntityTimeline::new(
            EntityId::from(1001),
            vec![
                version(1001, "Teacher", 5, None),
                version(1001, "Engineer", 1, Some(5)),
            ],
        );

        assert_eq!(timeline.state(), VersionState::Current);
        assert_eq!(timeline.history()[0].valid_from, at(1));
        assert_eq!(
            timeline.as_of(at(3)).unwrap().tracked["profession"],
            AttributeValue::text("Engineer")
        );
        assert_eq!(
            timeline.as_of(at(5)).unwrap().tracked["profession"],
            AttributeValue::text("Teacher")
        );
        assert!(timeline.as_of(at(1) - chrono::Duration::seconds(1)).is_none());
        assert!(timeline.violations().is_empty());
    }

    #[test]
    fn test_empty_timeline_state() {
        let timeline = EntityTimeline::new(EntityId::from(7), Vec::new());
        assert_eq!(timeline.state(), VersionState::None);
        assert!(timeline.violations().is_empty());
    }

    #[test]
    fn test_detects_two_current_rows() {
        let report = verify_history(vec![
            version(1001, "Engineer", 1, None),
            version(1001, "Teacher", 5, None),
        ]);

        assert!(!report.is_clean());
        assert!(report
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::CurrentCount));
    }

    #[test]
    fn test_detects_gap_and_overlap() {
        let gap = verify_history(vec![
            version(1, "a", 1, Some(3)),
            version(1, "b", 4, None),
        ]);
        assert_eq!(gap.violations.len(), 1);
        assert_eq!(gap.violations[0].kind, ViolationKind::Gap);

        let overlap = verify_history(vec![
            version(2, "a", 1, Some(6)),
            version(2, "b", 4, None),
        ]);
        assert_eq!(overlap.violations[0].kind, ViolationKind::Overlap);
    }

    #[test]
    fn test_report_counts() {
        let report = verify_history(vec![
            version(1, "a", 1, Some(3)),
            version(1, "b", 3, None),
            version(2, "c", 2, None),
        ]);

        assert!(report.is_clean());
        assert_eq!(report.identifiers, 2);
        assert_eq!(report.rows, 3);
    }
}
