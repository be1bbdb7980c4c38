// 🗄️ SQLite Dimension Store - typed columns + WAL
//
// Table layout for a dimension (e.g., dim_customer):
//   row_id, <key>, <tracked...>, <passthrough...>, valid_from, valid_to, is_current
//
// valid_from / valid_to are fixed-width RFC3339 text (microseconds, Z), so
// string comparison is time comparison and `valid_from = ?` is exact.
// A partial unique index on (<key>) WHERE is_current = 1 makes "one current
// row per identifier" a constraint the database enforces.

use crate::attributes::{AttributeDefinition, AttributeType, AttributeValue, Attributes, EntityId};
use crate::dimension::DimensionSpec;
use crate::error::{MergeError, Result};
use crate::extract::EntityRecord;
use crate::orchestrator::RunReport;
use crate::store::{DimensionStore, StagingArea, VersionWrite};
use crate::temporal::{format_ts, parse_ts, DimensionRow};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default busy timeout (ms).
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        let store = SqliteStore { conn };
        store.setup()?;
        Ok(store)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn setup(&self) -> Result<()> {
        // Enable WAL mode for crash recovery
        self.conn.pragma_update(None, "journal_mode", "WAL")?;

        // ==========================================================================
        // Run log (one row per merge run, complete or failed)
        // ==========================================================================
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS merge_runs (
                run_id TEXT PRIMARY KEY,
                dimension TEXT NOT NULL,
                batch TEXT,
                as_of TEXT NOT NULL,
                state TEXT NOT NULL,
                started_at TEXT NOT NULL,
                report TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_merge_runs_dimension ON merge_runs(dimension, started_at)",
            [],
        )?;

        Ok(())
    }

    fn existing_columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    fn query_rows(
        &self,
        spec: &DimensionSpec,
        filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<DimensionRow>> {
        let sql = format!(
            "SELECT {} FROM \"{}\" {} ORDER BY \"{}\", valid_from",
            select_columns(spec),
            spec.table,
            filter,
            spec.key
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, |row| map_row(spec, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ============================================================================
// COLUMN CODEC
// ============================================================================

fn to_sql(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Null => Value::Null,
        AttributeValue::Boolean(b) => Value::Integer(*b as i64),
        AttributeValue::Integer(i) => Value::Integer(*i),
        AttributeValue::Decimal(f) => Value::Real(*f),
        AttributeValue::Text(s) => Value::Text(s.clone()),
        AttributeValue::Date(d) => Value::Text(d.format(DATE_FORMAT).to_string()),
        AttributeValue::Timestamp(ts) => Value::Text(ts.format(TIMESTAMP_FORMAT).to_string()),
    }
}

fn from_sql(def: &AttributeDefinition, value: ValueRef<'_>) -> Result<AttributeValue> {
    let mismatch = |found: &str| {
        MergeError::type_mismatch(
            &def.name,
            format!("stored {} is not a {}", found, def.type_.as_str()),
        )
    };
    let text = |bytes: &[u8]| {
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| mismatch("invalid utf-8"))
    };

    match (def.type_, value) {
        (_, ValueRef::Null) => Ok(AttributeValue::Null),
        (AttributeType::Text, ValueRef::Text(b)) => Ok(AttributeValue::Text(text(b)?)),
        (AttributeType::Integer, ValueRef::Integer(i)) => Ok(AttributeValue::Integer(i)),
        (AttributeType::Decimal, ValueRef::Real(f)) => Ok(AttributeValue::Decimal(f)),
        (AttributeType::Decimal, ValueRef::Integer(i)) => Ok(AttributeValue::Decimal(i as f64)),
        (AttributeType::Boolean, ValueRef::Integer(i)) => Ok(AttributeValue::Boolean(i != 0)),
        (AttributeType::Date, ValueRef::Text(b)) => NaiveDate::parse_from_str(&text(b)?, DATE_FORMAT)
            .map(AttributeValue::Date)
            .map_err(|_| mismatch("text")),
        (AttributeType::Timestamp, ValueRef::Text(b)) => {
            NaiveDateTime::parse_from_str(&text(b)?, "%Y-%m-%d %H:%M:%S%.f")
                .map(AttributeValue::Timestamp)
                .map_err(|_| mismatch("text"))
        }
        (_, other) => Err(mismatch(other.data_type().to_string().as_str())),
    }
}

fn conversion_error(idx: usize, err: MergeError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn read_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(raw) => parse_ts(&raw).map(Some).ok_or_else(|| {
            conversion_error(
                idx,
                MergeError::StoreUnavailable(format!("corrupt timestamp {:?}", raw)),
            )
        }),
    }
}

fn select_columns(spec: &DimensionSpec) -> String {
    let mut columns = vec![format!("\"{}\"", spec.key)];
    columns.extend(spec.all_attributes().map(|a| format!("\"{}\"", a.name)));
    columns.extend(["valid_from", "valid_to", "is_current"].map(String::from));
    columns.join(", ")
}

fn map_row(spec: &DimensionSpec, row: &rusqlite::Row<'_>) -> rusqlite::Result<DimensionRow> {
    let id: String = row.get(0)?;
    let mut idx = 1;

    let mut read_attrs = |defs: &[AttributeDefinition]| -> rusqlite::Result<Attributes> {
        let mut attrs = Attributes::new();
        for def in defs {
            let value = from_sql(def, row.get_ref(idx)?).map_err(|e| conversion_error(idx, e))?;
            attrs.insert(def.name.clone(), value);
            idx += 1;
        }
        Ok(attrs)
    };

    let tracked = read_attrs(&spec.tracked)?;
    let passthrough = read_attrs(&spec.passthrough)?;

    let valid_from = read_ts(row, idx)?.ok_or_else(|| {
        conversion_error(idx, MergeError::StoreUnavailable("NULL valid_from".into()))
    })?;
    let valid_to = read_ts(row, idx + 1)?;
    let is_current: bool = row.get(idx + 2)?;

    Ok(DimensionRow {
        id: EntityId::new(id),
        tracked,
        passthrough,
        valid_from,
        valid_to,
        is_current,
    })
}

/// Constraint violations on a write are conflicts for that identifier.
fn write_error(id: &EntityId, err: rusqlite::Error) -> MergeError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            MergeError::conflict(id, err.to_string())
        }
        _ => MergeError::StoreUnavailable(err.to_string()),
    }
}

fn insert_row(conn: &Connection, spec: &DimensionSpec, row: &DimensionRow) -> rusqlite::Result<usize> {
    let mut columns = vec![format!("\"{}\"", spec.key)];
    let mut values = vec![Value::Text(row.id.as_str().to_string())];

    for (def, attrs) in spec
        .tracked
        .iter()
        .map(|d| (d, &row.tracked))
        .chain(spec.passthrough.iter().map(|d| (d, &row.passthrough)))
    {
        columns.push(format!("\"{}\"", def.name));
        values.push(attrs.get(&def.name).map(to_sql).unwrap_or(Value::Null));
    }

    columns.extend(["valid_from", "valid_to", "is_current"].map(String::from));
    values.push(Value::Text(format_ts(&row.valid_from)));
    values.push(row.valid_to.as_ref().map_or(Value::Null, |t| Value::Text(format_ts(t))));
    values.push(Value::Integer(row.is_current as i64));

    let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();
    conn.execute(
        &format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            spec.table,
            columns.join(", "),
            placeholders.join(", ")
        ),
        params_from_iter(values),
    )
}

// ============================================================================
// DIMENSION STORE
// ============================================================================

impl DimensionStore for SqliteStore {
    fn ensure_dimension(&mut self, spec: &DimensionSpec) -> Result<()> {
        spec.validate()?;

        let existing = self.existing_columns(&spec.table)?;
        if !existing.is_empty() {
            if let Some(missing) = spec.all_attributes().find(|a| !existing.contains(&a.name)) {
                return Err(MergeError::Config(format!(
                    "table {} has no column '{}' (schema evolution is not supported)",
                    spec.table, missing.name
                )));
            }
        }

        let attribute_columns: Vec<String> = spec
            .all_attributes()
            .map(|a| format!("\"{}\" {}", a.name, a.type_.sql_type()))
            .collect();
        let attribute_ddl = attribute_columns
            .iter()
            .map(|c| format!("{},\n", c))
            .collect::<String>();

        // ==========================================================================
        // Dimension table (full history)
        // ==========================================================================
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (
                    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    \"{key}\" TEXT NOT NULL,
                    {attribute_ddl}
                    valid_from TEXT NOT NULL,
                    valid_to TEXT,
                    is_current INTEGER NOT NULL DEFAULT 1,
                    CHECK (valid_to IS NULL OR valid_to > valid_from),
                    CHECK ((is_current = 1) = (valid_to IS NULL))
                )",
                table = spec.table,
                key = spec.key,
            ),
            [],
        )?;

        // One current row per identifier
        self.conn.execute(
            &format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS \"ux_{table}_current\" ON \"{table}\"(\"{key}\") WHERE is_current = 1",
                table = spec.table,
                key = spec.key
            ),
            [],
        )?;

        // One version per (identifier, valid_from)
        self.conn.execute(
            &format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS \"ux_{table}_window\" ON \"{table}\"(\"{key}\", valid_from)",
                table = spec.table,
                key = spec.key
            ),
            [],
        )?;

        self.conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS \"idx_{table}_validity\" ON \"{table}\"(valid_from, valid_to)",
                table = spec.table
            ),
            [],
        )?;

        // ==========================================================================
        // Staging table (raw extract batches)
        // ==========================================================================
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{staging}\" (
                    extract_batch TEXT NOT NULL,
                    \"{key}\" TEXT NOT NULL,
                    {attribute_ddl}
                    loaded_at TEXT NOT NULL
                )",
                staging = spec.staging_table(),
                key = spec.key,
            ),
            [],
        )?;

        self.conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS \"idx_{staging}_batch\" ON \"{staging}\"(extract_batch)",
                staging = spec.staging_table()
            ),
            [],
        )?;

        debug!(table = %spec.table, "dimension table ready");
        Ok(())
    }

    fn current_rows(&self, spec: &DimensionSpec) -> Result<Vec<DimensionRow>> {
        self.query_rows(spec, "WHERE is_current = 1", &[])
    }

    fn current_row(&self, spec: &DimensionSpec, id: &EntityId) -> Result<Option<DimensionRow>> {
        let filter = format!("WHERE \"{}\" = ?1 AND is_current = 1", spec.key);
        let mut rows = self.query_rows(spec, &filter, &[&id.as_str()])?;
        Ok(rows.pop())
    }

    fn history(&self, spec: &DimensionSpec, id: &EntityId) -> Result<Vec<DimensionRow>> {
        let filter = format!("WHERE \"{}\" = ?1", spec.key);
        self.query_rows(spec, &filter, &[&id.as_str()])
    }

    fn rows_at(&self, spec: &DimensionSpec, at: DateTime<Utc>) -> Result<Vec<DimensionRow>> {
        let t = format_ts(&at);
        self.query_rows(
            spec,
            "WHERE valid_from <= ?1 AND (valid_to IS NULL OR valid_to > ?1)",
            &[&t],
        )
    }

    fn all_rows(&self, spec: &DimensionSpec) -> Result<Vec<DimensionRow>> {
        self.query_rows(spec, "", &[])
    }

    fn count_valid_from(&self, spec: &DimensionSpec, as_of: DateTime<Utc>) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\" WHERE valid_from = ?1", spec.table),
            params![format_ts(&as_of)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn latest_valid_from(&self, spec: &DimensionSpec) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<String> = self.conn.query_row(
            &format!("SELECT MAX(valid_from) FROM \"{}\"", spec.table),
            [],
            |row| row.get(0),
        )?;
        Ok(latest.as_deref().and_then(parse_ts))
    }

    fn commit_version(&mut self, spec: &DimensionSpec, write: &VersionWrite) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| write_error(&write.id, e))?;

        if let Some(close) = &write.close {
            let closed = tx
                .execute(
                    &format!(
                        "UPDATE \"{}\" SET valid_to = ?1, is_current = 0
                         WHERE \"{}\" = ?2 AND is_current = 1 AND valid_from = ?3",
                        spec.table, spec.key
                    ),
                    params![
                        format_ts(&close.valid_to),
                        write.id.as_str(),
                        format_ts(&close.valid_from)
                    ],
                )
                .map_err(|e| write_error(&write.id, e))?;

            if closed != 1 {
                // Dropping `tx` rolls back
                return Err(MergeError::conflict(
                    &write.id,
                    format!("expected one current row from {}, found {}", format_ts(&close.valid_from), closed),
                ));
            }
        }

        insert_row(&tx, spec, &write.insert).map_err(|e| write_error(&write.id, e))?;
        tx.commit().map_err(|e| write_error(&write.id, e))?;
        Ok(())
    }

    fn record_run(&mut self, report: &RunReport) -> Result<()> {
        let report_json = serde_json::to_string(report)
            .map_err(|e| MergeError::StoreUnavailable(e.to_string()))?;

        self.conn.execute(
            "INSERT OR REPLACE INTO merge_runs (
                run_id, dimension, batch, as_of, state, started_at, report
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                report.run_id,
                report.dimension,
                report.batch,
                format_ts(&report.as_of),
                report.state.as_str(),
                format_ts(&report.started_at),
                report_json,
            ],
        )?;

        Ok(())
    }

    fn runs(&self, dimension: Option<&str>) -> Result<Vec<RunReport>> {
        let mut stmt = self.conn.prepare(
            "SELECT report FROM merge_runs
             WHERE ?1 IS NULL OR dimension = ?1
             ORDER BY started_at DESC, rowid DESC",
        )?;

        let reports = stmt
            .query_map(params![dimension], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        reports
            .iter()
            .map(|json| {
                serde_json::from_str(json)
                    .map_err(|e| MergeError::StoreUnavailable(format!("corrupt run log: {}", e)))
            })
            .collect()
    }
}

// ============================================================================
// STAGING AREA
// ============================================================================

impl StagingArea for SqliteStore {
    fn stage_batch(
        &mut self,
        spec: &DimensionSpec,
        batch: &str,
        records: &[EntityRecord],
    ) -> Result<usize> {
        let staging = spec.staging_table();
        let loaded_at = format_ts(&Utc::now());

        let mut columns = vec!["extract_batch".to_string(), format!("\"{}\"", spec.key)];
        columns.extend(spec.all_attributes().map(|a| format!("\"{}\"", a.name)));
        columns.push("loaded_at".to_string());
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let insert_sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            staging,
            columns.join(", "),
            placeholders.join(", ")
        );

        let tx = self.conn.transaction()?;
        tx.execute(
            &format!("DELETE FROM \"{}\" WHERE extract_batch = ?1", staging),
            params![batch],
        )?;

        {
            let mut stmt = tx.prepare(&insert_sql)?;
            for record in records {
                let mut values = vec![
                    Value::Text(batch.to_string()),
                    Value::Text(record.id.as_str().to_string()),
                ];
                for def in &spec.tracked {
                    values.push(record.tracked.get(&def.name).map(to_sql).unwrap_or(Value::Null));
                }
                for def in &spec.passthrough {
                    values.push(
                        record
                            .passthrough
                            .get(&def.name)
                            .map(to_sql)
                            .unwrap_or(Value::Null),
                    );
                }
                values.push(Value::Text(loaded_at.clone()));
                stmt.execute(params_from_iter(values))?;
            }
        }

        tx.commit()?;
        Ok(records.len())
    }

    fn staged_batch(&self, spec: &DimensionSpec, batch: &str) -> Result<Vec<EntityRecord>> {
        let mut columns = vec![format!("\"{}\"", spec.key)];
        columns.extend(spec.all_attributes().map(|a| format!("\"{}\"", a.name)));

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM \"{}\" WHERE extract_batch = ?1 ORDER BY rowid",
            columns.join(", "),
            spec.staging_table()
        ))?;

        let records = stmt
            .query_map(params![batch], |row| {
                let id: String = row.get(0)?;
                let mut record = EntityRecord::new(EntityId::new(id));
                let mut idx = 1;
                for def in &spec.tracked {
                    let value =
                        from_sql(def, row.get_ref(idx)?).map_err(|e| conversion_error(idx, e))?;
                    record.tracked.insert(def.name.clone(), value);
                    idx += 1;
                }
                for def in &spec.passthrough {
                    let value =
                        from_sql(def, row.get_ref(idx)?).map_err(|e| conversion_error(idx, e))?;
                    record.passthrough.insert(def.name.clone(), value);
                    idx += 1;
                }
                Ok(record)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn staged_batches(&self, spec: &DimensionSpec) -> Result<Vec<(String, usize)>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT extract_batch, COUNT(*) FROM \"{}\" GROUP BY extract_batch ORDER BY extract_batch",
            spec.staging_table()
        ))?;

        let batches = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(batches)
    }
}
