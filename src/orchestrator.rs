// 🎼 Merge Orchestrator - one merge run, end to end
//
// STARTED → FINGERPRINTED → CLASSIFIED → WRITTEN → COMPLETE
//    └──────────────┴─────────────┴───────────┴──→ FAILED
//
// as_of is taken once per run and shared by every row the run writes.
// Committed per-identifier writes are never rolled back; a failed run is
// retried by re-invoking it with the same extract and the same as_of.

use crate::attributes::EntityId;
use crate::dimension::DimensionSpec;
use crate::error::MergeError;
use crate::extract::EntityRecord;
use crate::resolver::{check_duplicates, VersionResolver};
use crate::store::{DimensionStore, StagingArea};
use crate::temporal::{format_ts, truncate_micros, Clock, FixedClock, SystemClock};
use crate::writer::{CancelFlag, TemporalWriter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Started,
    Fingerprinted,
    Classified,
    Written,
    Complete,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Started => "STARTED",
            RunState::Fingerprinted => "FINGERPRINTED",
            RunState::Classified => "CLASSIFIED",
            RunState::Written => "WRITTEN",
            RunState::Complete => "COMPLETE",
            RunState::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    /// Identifiers not processed because the run failed
    pub failed: usize,
    pub closed: usize,
    pub inserted: usize,
    pub skipped: usize,
}

/// Outcome of one run, persisted in the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub dimension: String,
    pub batch: Option<String>,
    pub as_of: DateTime<Utc>,
    pub state: RunState,
    /// Last state reached before FAILED (equals `state` otherwise)
    pub last_state: RunState,
    pub counts: RunCounts,
    /// Rows from an earlier attempt at the same as_of were found
    pub resumed: bool,
    #[serde(default)]
    pub written: Vec<EntityId>,
    #[serde(default)]
    pub pending: Vec<EntityId>,
    pub error: Option<String>,
    pub retryable: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    fn started(dimension: &str, batch: Option<String>, as_of: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        RunReport {
            run_id: Uuid::new_v4().to_string(),
            dimension: dimension.to_string(),
            batch,
            as_of,
            state: RunState::Started,
            last_state: RunState::Started,
            counts: RunCounts::default(),
            resumed: false,
            written: Vec::new(),
            pending: Vec::new(),
            error: None,
            retryable: false,
            started_at: now,
            finished_at: None,
        }
    }

    fn advance(&mut self, state: RunState) {
        info!(run_id = %self.run_id, dimension = %self.dimension, state = state.as_str(), "run state");
        self.state = state;
        self.last_state = state;
    }

    pub fn is_complete(&self) -> bool {
        self.state == RunState::Complete
    }
}

/// A FAILED run: its report plus the error that stopped it.
#[derive(Debug, thiserror::Error)]
#[error("merge run {} failed after {}: {error}", .report.run_id, .report.last_state.as_str())]
pub struct RunFailure {
    pub report: RunReport,
    #[source]
    pub error: MergeError,
}

// ============================================================================
// MERGE ORCHESTRATOR
// ============================================================================

pub struct MergeOrchestrator<'a, S: DimensionStore + ?Sized> {
    store: &'a mut S,
    spec: DimensionSpec,
    clock: Box<dyn Clock>,
    cancel: CancelFlag,
}

impl<'a, S: DimensionStore + ?Sized> MergeOrchestrator<'a, S> {
    pub fn new(store: &'a mut S, spec: DimensionSpec) -> Self {
        MergeOrchestrator {
            store,
            spec,
            clock: Box::new(SystemClock),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Pin the run's as_of instead of reading the clock.
    pub fn with_as_of(self, as_of: DateTime<Utc>) -> Self {
        self.with_clock(FixedClock(as_of))
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn spec(&self) -> &DimensionSpec {
        &self.spec
    }

    /// Merge one extract into the dimension.
    pub fn run(
        &mut self,
        records: Vec<EntityRecord>,
        batch: Option<String>,
    ) -> Result<RunReport, RunFailure> {
        let as_of = truncate_micros(self.clock.now());
        let mut report = RunReport::started(&self.spec.name, batch, as_of, Utc::now());
        info!(
            run_id = %report.run_id,
            dimension = %self.spec.name,
            as_of = %format_ts(&as_of),
            records = records.len(),
            "merge run started"
        );

        let staged = records.len();
        match self.execute(records, &mut report) {
            Ok(()) => {
                report.advance(RunState::Complete);
                report.finished_at = Some(Utc::now());
                if let Err(error) = self.store.record_run(&report) {
                    return Err(self.fail(report, error, 0));
                }
                info!(
                    run_id = %report.run_id,
                    new = report.counts.new,
                    changed = report.counts.changed,
                    unchanged = report.counts.unchanged,
                    "merge run complete"
                );
                Ok(report)
            }
            Err(error) => {
                let unprocessed = if report.last_state == RunState::Classified {
                    0
                } else {
                    staged
                };
                Err(self.fail(report, error, unprocessed))
            }
        }
    }

    fn execute(&mut self, records: Vec<EntityRecord>, report: &mut RunReport) -> crate::error::Result<()> {
        let as_of = report.as_of;
        self.store.ensure_dimension(&self.spec)?;
        self.store.record_run(report)?;

        // Versions newer than as_of would make the new windows overlap them
        if let Some(latest) = self.store.latest_valid_from(&self.spec)? {
            if latest > as_of {
                return Err(MergeError::conflict(
                    &self.spec.name,
                    format!(
                        "dimension already holds versions from {}, after as_of {}",
                        format_ts(&latest),
                        format_ts(&as_of)
                    ),
                ));
            }
        }

        let already = self.store.count_valid_from(&self.spec, as_of)?;
        if already > 0 {
            warn!(
                run_id = %report.run_id,
                rows = already,
                as_of = %format_ts(&as_of),
                "rows already written at this as_of, resuming"
            );
            report.resumed = true;
        }

        let resolver = VersionResolver::new(&self.spec);
        check_duplicates(&records)?;
        let staged = resolver.fingerprint_staged(records)?;
        let current_rows = self.store.current_rows(&self.spec)?;
        let current = resolver.fingerprint_current(&current_rows)?;
        report.advance(RunState::Fingerprinted);

        let resolution = resolver.classify(staged, &current)?;
        let counts = resolution.counts();
        report.counts.new = counts.new;
        report.counts.changed = counts.changed;
        report.counts.unchanged = counts.unchanged;
        report.advance(RunState::Classified);

        if self.cancel.is_cancelled() {
            report.counts.failed = resolution.pending_writes().count();
            return Err(MergeError::Cancelled);
        }

        let mut writer =
            TemporalWriter::new(&mut *self.store, &self.spec).with_cancel(self.cancel.clone());
        match writer.apply(&resolution, as_of) {
            Ok(summary) => {
                report.counts.closed = summary.closed;
                report.counts.inserted = summary.inserted;
                report.counts.skipped = summary.skipped;
                report.written = summary.written;
                report.advance(RunState::Written);
                Ok(())
            }
            Err(failure) => {
                report.counts.closed = failure.summary.closed;
                report.counts.inserted = failure.summary.inserted;
                report.counts.skipped = failure.summary.skipped;
                report.counts.failed = failure.pending.len();
                report.written = failure.summary.written.clone();
                report.pending = failure.pending.clone();

                if failure.summary.written.is_empty() {
                    Err(failure.error)
                } else {
                    Err(MergeError::PartialRunFailure {
                        written: failure.summary.written,
                        pending: failure.pending,
                        source: Box::new(failure.error),
                    })
                }
            }
        }
    }

    fn fail(&mut self, mut report: RunReport, error: MergeError, unprocessed: usize) -> RunFailure {
        if unprocessed > 0 {
            report.counts.failed = unprocessed;
        }
        report.state = RunState::Failed;
        report.error = Some(error.to_string());
        report.retryable = error.is_retryable();
        report.finished_at = Some(Utc::now());

        warn!(
            run_id = %report.run_id,
            last_state = report.last_state.as_str(),
            retryable = report.retryable,
            error = %error,
            "merge run failed"
        );

        // The run log is best effort once the run has already failed
        if let Err(log_error) = self.store.record_run(&report) {
            warn!(run_id = %report.run_id, error = %log_error, "could not record failed run");
        }

        RunFailure { report, error }
    }
}

impl<'a, S: DimensionStore + StagingArea + ?Sized> MergeOrchestrator<'a, S> {
    /// Merge a batch previously loaded into the staging table.
    pub fn run_staged(&mut self, batch: &str) -> Result<RunReport, RunFailure> {
        match self.store.staged_batch(&self.spec, batch) {
            Ok(records) if records.is_empty() => {
                let error = MergeError::Extract(format!("no staged records for batch '{}'", batch));
                let report = RunReport::started(
                    &self.spec.name,
                    Some(batch.to_string()),
                    truncate_micros(self.clock.now()),
                    Utc::now(),
                );
                Err(self.fail(report, error, 0))
            }
            Ok(records) => self.run(records, Some(batch.to_string())),
            Err(error) => {
                let report = RunReport::started(
                    &self.spec.name,
                    Some(batch.to_string()),
                    truncate_micros(self.clock.now()),
                    Utc::now(),
                );
                Err(self.fail(report, error, 0))
            }
        }
    }
}
