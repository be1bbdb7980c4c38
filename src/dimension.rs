// 📐 Dimension Specs - which table, which key, which attributes are versioned
//
// A DimensionSpec is the run parameter set that does not change between runs:
// the table to maintain, its business key, the TRACKED attributes that drive
// versioning and the PASS-THROUGH attributes copied alongside.

use crate::attributes::{AttributeDefinition, AttributeType};
use crate::error::{MergeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSpec {
    /// Dimension identifier used on the command line (e.g., "customer")
    pub name: String,

    /// Dimension table (e.g., "dim_customer")
    pub table: String,

    /// Business key column (e.g., "customer_id")
    pub key: String,

    /// Extract column holding the key when it differs (e.g., "customerID")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_source: Option<String>,

    /// Attributes that participate in change detection
    #[serde(default)]
    pub tracked: Vec<AttributeDefinition>,

    /// Attributes stored on each version but never fingerprinted
    #[serde(default)]
    pub passthrough: Vec<AttributeDefinition>,
}

impl DimensionSpec {
    pub fn new(name: impl Into<String>, table: impl Into<String>, key: impl Into<String>) -> Self {
        DimensionSpec {
            name: name.into(),
            table: table.into(),
            key: key.into(),
            key_source: None,
            tracked: Vec::new(),
            passthrough: Vec::new(),
        }
    }

    pub fn with_key_source(mut self, source: impl Into<String>) -> Self {
        self.key_source = Some(source.into());
        self
    }

    pub fn track(mut self, attr: AttributeDefinition) -> Self {
        self.tracked.push(attr);
        self
    }

    pub fn pass_through(mut self, attr: AttributeDefinition) -> Self {
        self.passthrough.push(attr);
        self
    }

    pub fn key_column(&self) -> &str {
        self.key_source.as_deref().unwrap_or(&self.key)
    }

    /// Staging table holding raw extract batches for this dimension.
    pub fn staging_table(&self) -> String {
        format!("stg_{}", self.table)
    }

    /// Tracked attributes first, then pass-through, in declaration order.
    pub fn all_attributes(&self) -> impl Iterator<Item = &AttributeDefinition> {
        self.tracked.iter().chain(self.passthrough.iter())
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDefinition> {
        self.all_attributes().find(|a| a.name == name)
    }

    /// Re-partition attributes so that exactly `names` are tracked.
    ///
    /// Attributes not listed move to pass-through. Unknown names are rejected.
    pub fn with_tracked(&self, names: &[String]) -> Result<DimensionSpec> {
        for name in names {
            if self.attribute(name).is_none() {
                return Err(MergeError::Config(format!(
                    "dimension '{}' has no attribute '{}'",
                    self.name, name
                )));
            }
        }

        let mut next = self.clone();
        let all: Vec<AttributeDefinition> = self.all_attributes().cloned().collect();
        let (tracked, passthrough): (Vec<_>, Vec<_>) =
            all.into_iter().partition(|a| names.contains(&a.name));
        next.tracked = tracked;
        next.passthrough = passthrough;
        next.validate()?;
        Ok(next)
    }

    /// Validate names before they are spliced into SQL.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.table)?;
        validate_identifier(&self.key)?;

        if self.tracked.is_empty() {
            return Err(MergeError::Config(format!(
                "dimension '{}' has no tracked attributes",
                self.name
            )));
        }

        let mut seen = BTreeMap::new();
        for attr in self.all_attributes() {
            validate_identifier(&attr.name)?;
            if RESERVED_COLUMNS.contains(&attr.name.as_str()) || attr.name == self.key {
                return Err(MergeError::Config(format!(
                    "attribute '{}' collides with a reserved column",
                    attr.name
                )));
            }
            if attr.concat.as_ref().is_some_and(|c| c.columns.is_empty()) {
                return Err(MergeError::Config(format!(
                    "attribute '{}' concatenates no columns",
                    attr.name
                )));
            }
            if seen.insert(attr.name.as_str(), ()).is_some() {
                return Err(MergeError::Config(format!(
                    "attribute '{}' declared twice",
                    attr.name
                )));
            }
        }

        Ok(())
    }
}

/// Columns the engine adds to every dimension table.
pub const RESERVED_COLUMNS: &[&str] = &[
    "row_id",
    "valid_from",
    "valid_to",
    "is_current",
    "extract_batch",
    "loaded_at",
];

/// `[A-Za-z_][A-Za-z0-9_]*`, at most 63 characters.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && name.len() <= 63
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(MergeError::Config(format!("invalid SQL identifier: {:?}", name)))
    }
}

// ============================================================================
// DIMENSION REGISTRY
// ============================================================================

/// Catalog of known dimensions.
///
/// Starts with the retail dimensions (customer, product, store); more can be
/// registered from configuration.
pub struct DimensionRegistry {
    dimensions: BTreeMap<String, DimensionSpec>,
}

impl DimensionRegistry {
    /// Registry with the built-in retail dimensions.
    pub fn new() -> Self {
        let mut registry = DimensionRegistry::empty();
        registry.register_retail_dimensions();
        registry
    }

    pub fn empty() -> Self {
        DimensionRegistry {
            dimensions: BTreeMap::new(),
        }
    }

    fn register_retail_dimensions(&mut self) {
        use AttributeType::*;

        // Customers: profession / email change over time, join date does not
        let customer = DimensionSpec::new("customer", "dim_customer", "customer_id")
            .with_key_source("customerID")
            .track(
                AttributeDefinition::new("name", Text)
                    .with_concat(["firstName", "lastName"], " "),
            )
            .track(AttributeDefinition::new("dob", Date))
            .track(AttributeDefinition::new("profession", Text))
            .track(AttributeDefinition::new("email", Text).with_source("emailAddress"))
            .track(
                AttributeDefinition::new("rewards_programme_member", Boolean)
                    .with_source("rewardsMember"),
            )
            .pass_through(
                AttributeDefinition::new("customer_joined", Timestamp)
                    .with_source("customerJoined")
                    .with_description("When the customer first joined"),
            );

        let product = DimensionSpec::new("product", "dim_product", "product_id")
            .track(AttributeDefinition::new("product_name", Text))
            .track(AttributeDefinition::new("category", Text))
            .track(AttributeDefinition::new("price", Decimal));

        let store = DimensionSpec::new("store", "dim_store", "store_id")
            .track(AttributeDefinition::new("store_name", Text))
            .track(AttributeDefinition::new("manager", Text))
            .pass_through(AttributeDefinition::new("opened_date", Date));

        for spec in [customer, product, store] {
            self.dimensions.insert(spec.name.clone(), spec);
        }
    }

    /// Register (or replace) a dimension after validating it.
    pub fn register(&mut self, spec: DimensionSpec) -> Result<()> {
        spec.validate()?;
        self.dimensions.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&DimensionSpec> {
        self.dimensions
            .get(name)
            .ok_or_else(|| MergeError::UnknownDimension(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.dimensions.keys().map(|k| k.as_str()).collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &DimensionSpec> {
        self.dimensions.values()
    }

    pub fn count(&self) -> usize {
        self.dimensions.len()
    }
}

impl Default for DimensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_dimensions_are_valid() {
        let registry = DimensionRegistry::new();

        assert_eq!(registry.count(), 3);
        for spec in registry.all() {
            spec.validate().unwrap();
        }

        let customer = registry.get("customer").unwrap();
        assert_eq!(customer.table, "dim_customer");
        assert_eq!(customer.key_column(), "customerID");
        assert_eq!(customer.tracked.len(), 5);
        assert_eq!(customer.passthrough[0].name, "customer_joined");
    }

    #[test]
    fn test_unknown_dimension() {
        let registry = DimensionRegistry::new();
        assert!(matches!(
            registry.get("transaction"),
            Err(MergeError::UnknownDimension(_))
        ));
    }

    #[test]
    fn test_tracked_override_moves_attributes() {
        let registry = DimensionRegistry::new();
        let customer = registry.get("customer").unwrap();

        let narrowed = customer
            .with_tracked(&["profession".to_string(), "customer_joined".to_string()])
            .unwrap();

        let tracked: Vec<&str> = narrowed.tracked.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(tracked, vec!["profession", "customer_joined"]);
        assert_eq!(narrowed.passthrough.len(), 4);

        assert!(customer.with_tracked(&["shoe_size".to_string()]).is_err());
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        assert!(validate_identifier("dim_customer").is_ok());
        assert!(validate_identifier("_x1").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("dim; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());

        let spec = DimensionSpec::new("bad", "dim_bad", "id")
            .track(AttributeDefinition::new("valid_from", AttributeType::Text));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_register_requires_tracked_attribute() {
        let mut registry = DimensionRegistry::empty();
        let spec = DimensionSpec::new("empty", "dim_empty", "id");

        assert!(registry.register(spec).is_err());
        assert_eq!(registry.count(), 0);
    }
}
