// 📥 Extracts - current observed state, one record per entity per run
//
// The extract producer guarantees at most one row per identifier; the engine
// does NOT deduplicate, it rejects (see resolver::check_duplicates).

use crate::attributes::{AttributeDefinition, AttributeValue, Attributes, EntityId};
use crate::dimension::DimensionSpec;
use crate::error::{MergeError, Result};
use anyhow::Context;
use serde::Serialize;
use std::io::Read;
use std::path::Path;

/// Column carrying the extract batch marker (the bronze layer's extract date).
pub const BATCH_COLUMN: &str = "extract_date";

/// One staged entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub tracked: Attributes,
    pub passthrough: Attributes,
}

impl EntityRecord {
    pub fn new(id: impl Into<EntityId>) -> Self {
        EntityRecord {
            id: id.into(),
            tracked: Attributes::new(),
            passthrough: Attributes::new(),
        }
    }

    /// Builder: set a tracked attribute
    pub fn with(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.tracked.insert(name.to_string(), value.into());
        self
    }

    /// Builder: set a pass-through attribute
    pub fn with_passthrough(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.passthrough.insert(name.to_string(), value.into());
        self
    }
}

/// A full extract for one as-of batch.
#[derive(Debug, Clone, Default)]
pub struct Extract {
    /// Batch marker (e.g., "2025-06-30"), if the producer supplied one
    pub batch: Option<String>,
    pub records: Vec<EntityRecord>,
}

impl Extract {
    pub fn new(batch: Option<String>, records: Vec<EntityRecord>) -> Self {
        Extract { batch, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Load an extract CSV file for `spec`.
pub fn load_csv(spec: &DimensionSpec, path: &Path) -> anyhow::Result<Extract> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open extract {}", path.display()))?;
    let extract = read_csv(spec, file)
        .with_context(|| format!("Failed to read extract {}", path.display()))?;
    Ok(extract)
}

/// Parse an extract from any CSV source.
///
/// The header must contain the key column and every declared attribute
/// column (source aliases and concatenated sources honored). Other columns
/// are ignored. An `extract_date` column, when present, must hold a single
/// value.
pub fn read_csv<R: Read>(spec: &DimensionSpec, reader: R) -> Result<Extract> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();

    let position = |column: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h.trim() == column)
            .ok_or_else(|| MergeError::Extract(format!("missing column '{}'", column)))
    };

    let key_idx = position(spec.key_column())?;
    let tracked_cols = locate(&spec.tracked, &position)?;
    let passthrough_cols = locate(&spec.passthrough, &position)?;
    let batch_idx = headers.iter().position(|h| h.trim() == BATCH_COLUMN);

    let mut batch: Option<String> = None;
    let mut records = Vec::new();

    for (line, row) in rdr.records().enumerate() {
        let row = row?;
        let cell = |idx: usize| row.get(idx).unwrap_or("");

        let key = cell(key_idx).trim();
        if key.is_empty() {
            return Err(MergeError::Extract(format!(
                "row {}: empty {}",
                line + 2,
                spec.key_column()
            )));
        }

        if let Some(idx) = batch_idx {
            let marker = cell(idx).trim().to_string();
            match &batch {
                None => batch = Some(marker),
                Some(existing) if *existing != marker => {
                    return Err(MergeError::Extract(format!(
                        "row {}: extract mixes batches '{}' and '{}'",
                        line + 2,
                        existing,
                        marker
                    )));
                }
                Some(_) => {}
            }
        }

        let value_of = |def: &AttributeDefinition, idxs: &[usize]| -> Result<AttributeValue> {
            match &def.concat {
                Some(concat) => {
                    let joined = concat.join(idxs.iter().map(|idx| cell(*idx)));
                    def.type_.parse_text(&def.name, &joined)
                }
                None => def.type_.parse_text(&def.name, cell(idxs[0])),
            }
        };

        let mut record = EntityRecord::new(EntityId::new(key));
        for (def, idxs) in &tracked_cols {
            record.tracked.insert(def.name.clone(), value_of(def, idxs)?);
        }
        for (def, idxs) in &passthrough_cols {
            record.passthrough.insert(def.name.clone(), value_of(def, idxs)?);
        }
        records.push(record);
    }

    Ok(Extract { batch, records })
}

/// Header positions of every source column of each definition.
fn locate<'a>(
    defs: &'a [AttributeDefinition],
    position: &impl Fn(&str) -> Result<usize>,
) -> Result<Vec<(&'a AttributeDefinition, Vec<usize>)>> {
    defs.iter()
        .map(|def| {
            let idxs = def
                .source_columns()
                .into_iter()
                .map(position)
                .collect::<Result<Vec<_>>>()?;
            Ok((def, idxs))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionRegistry;
    use chrono::NaiveDate;

    const CUSTOMERS: &str = "\
customerID,firstName,lastName,rewardsMember,emailAddress,postcode,profession,dob,customerJoined,extract_date
1001,Ada,Lovelace,True,ada@example.com,SW1A 1AA,Engineer,1985-12-10,2019-07-01 08:15:00,2025-06-30
1002,Alan,Turing,False,,CB2 1TN,Teacher,1990-06-23,2020-01-15 12:00:00,2025-06-30
";

    #[test]
    fn test_read_customer_extract() {
        let registry = DimensionRegistry::new();
        let spec = registry.get("customer").unwrap();

        let extract = read_csv(spec, CUSTOMERS.as_bytes()).unwrap();

        assert_eq!(extract.len(), 2);
        assert_eq!(extract.batch.as_deref(), Some("2025-06-30"));

        let ada = &extract.records[0];
        assert_eq!(ada.id, EntityId::from(1001));
        assert_eq!(ada.tracked["name"], AttributeValue::text("Ada Lovelace"));
        assert_eq!(ada.tracked["profession"], AttributeValue::text("Engineer"));
        assert_eq!(ada.tracked["email"], AttributeValue::text("ada@example.com"));
        assert_eq!(ada.tracked["rewards_programme_member"], AttributeValue::Boolean(true));
        assert_eq!(
            ada.tracked["dob"],
            AttributeValue::Date(NaiveDate::from_ymd_opt(1985, 12, 10).unwrap())
        );
        assert!(ada.passthrough.contains_key("customer_joined"));
        assert!(!ada.tracked.contains_key("postcode"));

        assert!(extract.records[1].tracked["email"].is_null());
    }

    #[test]
    fn test_customer_extract_needs_both_name_parts() {
        let registry = DimensionRegistry::new();
        let spec = registry.get("customer").unwrap();
        let csv = "\
customerID,firstName,rewardsMember,emailAddress,profession,dob,customerJoined
1001,Ada,True,ada@example.com,Engineer,1985-12-10,2019-07-01 08:15:00
";

        let err = read_csv(spec, csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("missing column 'lastName'"));
    }

    #[test]
    fn test_missing_column_is_rejected() {
        let registry = DimensionRegistry::new();
        let spec = registry.get("store").unwrap();

        let err = read_csv(spec, "store_id,store_name\n1,London Store\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("missing column 'manager'"));
    }

    #[test]
    fn test_unparseable_cell_is_type_mismatch() {
        let registry = DimensionRegistry::new();
        let spec = registry.get("product").unwrap();

        let err = read_csv(
            spec,
            "product_id,product_name,category,price\n1000,Laptop,Electronics,cheap\n".as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::TypeMismatch { ref attribute, .. } if attribute == "price"));
    }

    #[test]
    fn test_mixed_batches_are_rejected() {
        let registry = DimensionRegistry::new();
        let spec = registry.get("store").unwrap();
        let csv = "\
store_id,store_name,manager,opened_date,extract_date
1,London Store,Jo Bloggs,2018-03-01,2025-06-30
2,Leeds Store,Sam Smith,2019-04-11,2025-07-01
";

        assert!(matches!(read_csv(spec, csv.as_bytes()), Err(MergeError::Extract(_))));
    }

    #[test]
    fn test_duplicate_rows_are_kept_for_the_resolver() {
        let registry = DimensionRegistry::new();
        let spec = registry.get("store").unwrap();
        let csv = "\
store_id,store_name,manager,opened_date
2002,Leeds Store,Sam Smith,2019-04-11
2002,Leeds Store,Kim Lee,2019-04-11
";

        let extract = read_csv(spec, csv.as_bytes()).unwrap();
        assert_eq!(extract.len(), 2);
    }
}
