//! Durable store backends for dimension tables.
//!
//! The store is the only shared mutable resource of a merge. Everything the
//! engine writes goes through [`DimensionStore::commit_version`], which must
//! apply the close + insert of one identifier atomically.

pub mod memory;
pub mod sqlite;

use crate::attributes::EntityId;
use crate::dimension::DimensionSpec;
use crate::error::Result;
use crate::extract::EntityRecord;
use crate::orchestrator::RunReport;
use crate::temporal::DimensionRow;
use chrono::{DateTime, Utc};

/// Close of the current version of an identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseVersion {
    /// valid_from of the row being closed, as read before the write
    pub valid_from: DateTime<Utc>,
    /// New valid_to (the run's as_of)
    pub valid_to: DateTime<Utc>,
}

/// One atomic unit of work for the Temporal Writer.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionWrite {
    pub id: EntityId,
    pub close: Option<CloseVersion>,
    pub insert: DimensionRow,
}

/// Trait for dimension storage backends.
///
/// Row-returning methods order results by identifier, then valid_from.
pub trait DimensionStore {
    /// Create the dimension (and its staging table) if missing.
    fn ensure_dimension(&mut self, spec: &DimensionSpec) -> Result<()>;

    /// Every row with is_current = true.
    fn current_rows(&self, spec: &DimensionSpec) -> Result<Vec<DimensionRow>>;

    /// Current row of one identifier.
    fn current_row(&self, spec: &DimensionSpec, id: &EntityId) -> Result<Option<DimensionRow>>;

    /// All versions of one identifier.
    fn history(&self, spec: &DimensionSpec, id: &EntityId) -> Result<Vec<DimensionRow>>;

    /// Point-in-time snapshot: valid_from <= t AND (valid_to IS NULL OR valid_to > t).
    fn rows_at(&self, spec: &DimensionSpec, at: DateTime<Utc>) -> Result<Vec<DimensionRow>>;

    /// Every version of every identifier.
    fn all_rows(&self, spec: &DimensionSpec) -> Result<Vec<DimensionRow>>;

    /// Number of rows whose valid_from equals `as_of`.
    fn count_valid_from(&self, spec: &DimensionSpec, as_of: DateTime<Utc>) -> Result<usize>;

    /// Most recent valid_from in the table.
    fn latest_valid_from(&self, spec: &DimensionSpec) -> Result<Option<DateTime<Utc>>>;

    /// Apply the optional close and the insert in one transaction.
    ///
    /// Fails with `WriteConflict` (and writes nothing) if the close does not
    /// hit exactly the expected current row, or if the insert would leave two
    /// current rows.
    fn commit_version(&mut self, spec: &DimensionSpec, write: &VersionWrite) -> Result<()>;

    /// Persist the outcome of a run (complete or failed).
    fn record_run(&mut self, report: &RunReport) -> Result<()>;

    /// Run log, newest first.
    fn runs(&self, dimension: Option<&str>) -> Result<Vec<RunReport>>;
}

/// Raw extract batches waiting to be merged (the bronze layer).
pub trait StagingArea {
    /// Replace batch `batch` with `records`. Re-staging a batch is idempotent.
    fn stage_batch(&mut self, spec: &DimensionSpec, batch: &str, records: &[EntityRecord])
        -> Result<usize>;

    /// Records of one batch, in load order.
    fn staged_batch(&self, spec: &DimensionSpec, batch: &str) -> Result<Vec<EntityRecord>>;

    /// (batch, record count) for every staged batch, oldest first.
    fn staged_batches(&self, spec: &DimensionSpec) -> Result<Vec<(String, usize)>>;
}

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
