// ✍️ Temporal Writer - applies a Resolution to the store
//
// Per identifier (NEW / CHANGED only):
//   CHANGED: close current row (valid_to = as_of) + insert new current row
//   NEW:     insert new current row
// Each pair is one store transaction (DimensionStore::commit_version), so a
// reader never sees zero or two current rows for the identifier.
//
// The writer re-reads the current row before every write. That is what makes
// re-applying the same Resolution with the same as_of safe: an identifier
// whose current row already starts at as_of with the staged fingerprint was
// written by an earlier attempt and is skipped. A different fingerprint there
// is a conflict, never a skip.

use crate::attributes::{AttributeDefinition, Attributes, EntityId};
use crate::dimension::DimensionSpec;
use crate::error::{MergeError, Result};
use crate::fingerprint::Fingerprinter;
use crate::resolver::{Classification, Resolution, Resolved};
use crate::store::{CloseVersion, DimensionStore, VersionWrite};
use crate::temporal::{format_ts, DimensionRow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Cooperative cancellation, checked between identifier writes.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteSummary {
    /// Rows closed (valid_to set)
    pub closed: usize,
    /// Rows inserted
    pub inserted: usize,
    /// Identifiers already written at this as_of
    pub skipped: usize,
    /// Identifiers committed by this call, in write order
    pub written: Vec<EntityId>,
}

/// A write pass that stopped early. Everything in `summary` is committed;
/// nothing in `pending` is.
#[derive(Debug)]
pub struct WriteFailure {
    pub summary: WriteSummary,
    pub pending: Vec<EntityId>,
    pub error: MergeError,
}

/// What one identifier needs.
#[derive(Debug, Clone, PartialEq)]
enum WritePlan {
    Skip,
    Commit(VersionWrite),
}

pub struct TemporalWriter<'a, S: DimensionStore + ?Sized> {
    store: &'a mut S,
    spec: &'a DimensionSpec,
    fingerprinter: Fingerprinter,
    cancel: CancelFlag,
}

impl<'a, S: DimensionStore + ?Sized> TemporalWriter<'a, S> {
    pub fn new(store: &'a mut S, spec: &'a DimensionSpec) -> Self {
        TemporalWriter {
            store,
            spec,
            fingerprinter: Fingerprinter::for_dimension(spec),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Apply every NEW / CHANGED entry of `resolution` at `as_of`.
    pub fn apply(
        &mut self,
        resolution: &Resolution,
        as_of: DateTime<Utc>,
    ) -> std::result::Result<WriteSummary, WriteFailure> {
        let pending: Vec<&Resolved> = resolution.pending_writes().collect();
        let mut summary = WriteSummary::default();

        for (idx, entry) in pending.iter().enumerate() {
            let outcome = if self.cancel.is_cancelled() {
                Err(MergeError::Cancelled)
            } else {
                self.write_one(entry, as_of, &mut summary)
            };

            if let Err(error) = outcome {
                return Err(WriteFailure {
                    summary,
                    pending: pending[idx..].iter().map(|e| e.id().clone()).collect(),
                    error,
                });
            }
        }

        Ok(summary)
    }

    fn write_one(
        &mut self,
        entry: &Resolved,
        as_of: DateTime<Utc>,
        summary: &mut WriteSummary,
    ) -> Result<()> {
        match self.plan(entry, as_of)? {
            WritePlan::Skip => {
                debug!(id = %entry.id(), "already written at as_of, skipping");
                summary.skipped += 1;
            }
            WritePlan::Commit(write) => {
                self.store.commit_version(self.spec, &write)?;
                debug!(
                    id = %entry.id(),
                    class = entry.class.as_str(),
                    closed = write.close.is_some(),
                    fingerprint = %entry.staged.short(),
                    "version committed"
                );
                if write.close.is_some() {
                    summary.closed += 1;
                }
                summary.inserted += 1;
                summary.written.push(write.id);
            }
        }
        Ok(())
    }

    fn plan(&self, entry: &Resolved, as_of: DateTime<Utc>) -> Result<WritePlan> {
        let id = entry.id();
        let current = self.store.current_row(self.spec, id)?;

        let close = match (entry.class, current) {
            (Classification::Unchanged, _) => return Ok(WritePlan::Skip),

            (_, Some(row)) if row.valid_from == as_of => {
                if self.fingerprinter.fingerprint(&row.tracked)? == entry.staged {
                    return Ok(WritePlan::Skip);
                }
                return Err(MergeError::conflict(
                    id,
                    "current version already written at as_of with different attributes",
                ));
            }
            (_, Some(row)) if row.valid_from > as_of => {
                return Err(MergeError::conflict(
                    id,
                    format!(
                        "current version starts at {}, after as_of {}",
                        format_ts(&row.valid_from),
                        format_ts(&as_of)
                    ),
                ));
            }

            (Classification::New, Some(_)) => {
                return Err(MergeError::conflict(
                    id,
                    "classified NEW but a current row exists",
                ));
            }
            (Classification::New, None) => None,

            (Classification::Changed, Some(row)) => Some(CloseVersion {
                valid_from: row.valid_from,
                valid_to: as_of,
            }),
            (Classification::Changed, None) => {
                return Err(MergeError::conflict(
                    id,
                    "classified CHANGED but no current row exists",
                ));
            }
        };

        let insert = DimensionRow::current(
            id.clone(),
            canonical(&self.spec.tracked, &entry.record.tracked)?,
            canonical(&self.spec.passthrough, &entry.record.passthrough)?,
            as_of,
        );

        Ok(WritePlan::Commit(VersionWrite {
            id: id.clone(),
            close,
            insert,
        }))
    }
}

/// Declared attributes of `defs`, normalized to their declared types.
/// Missing attributes are stored as NULL.
fn canonical(defs: &[AttributeDefinition], values: &Attributes) -> Result<Attributes> {
    defs.iter()
        .map(|def| {
            let value = match values.get(&def.name) {
                Some(v) => v.canonicalize(def)?,
                None => crate::attributes::AttributeValue::Null,
            };
            Ok((def.name.clone(), value))
        })
        .collect()
}
