// 🔏 Change Fingerprint - content hash over tracked attributes
//
// fingerprint(attributes) is a pure function of the TRACKED values:
// - attribute order never matters (canonical order = sorted by name)
// - values are normalized to their declared type first (date == midnight ts)
// - pass-through attributes are ignored
//
// Digest: SHA-256 (256 bits). Two different attribute sets hashing equal is
// an accepted residual risk, not something the merge defends against; at 256
// bits the accidental collision probability is negligible for any table size.

use crate::attributes::{AttributeDefinition, AttributeValue, Attributes};
use crate::dimension::DimensionSpec;
use crate::error::{MergeError, Result};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Format tag mixed into every digest. Bump when the encoding changes.
const FINGERPRINT_DOMAIN: &[u8] = b"scd2-fingerprint-v1";

/// Opaque 256-bit digest of an entity's tracked attributes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

// ============================================================================
// FINGERPRINTER
// ============================================================================

/// Computes fingerprints for one dimension's tracked attribute set.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    /// Tracked attributes sorted by name
    tracked: Vec<AttributeDefinition>,
}

impl Fingerprinter {
    pub fn new(tracked: &[AttributeDefinition]) -> Self {
        let mut tracked = tracked.to_vec();
        tracked.sort_by(|a, b| a.name.cmp(&b.name));
        Fingerprinter { tracked }
    }

    pub fn for_dimension(spec: &DimensionSpec) -> Self {
        Self::new(&spec.tracked)
    }

    /// Fingerprint the tracked subset of `attributes`.
    ///
    /// Every tracked attribute must be present (NULL is a value; absence is
    /// not). Extra keys are ignored.
    pub fn fingerprint(&self, attributes: &Attributes) -> Result<Fingerprint> {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);

        for def in &self.tracked {
            let raw = attributes
                .get(&def.name)
                .ok_or_else(|| MergeError::type_mismatch(&def.name, "tracked attribute missing"))?;
            let value = raw.canonicalize(def)?;

            write_bytes(&mut hasher, def.name.as_bytes());
            write_value(&mut hasher, &value);
        }

        Ok(Fingerprint(hasher.finalize().into()))
    }
}

/// Convenience wrapper: fingerprint `attributes` against `tracked`.
pub fn fingerprint(tracked: &[AttributeDefinition], attributes: &Attributes) -> Result<Fingerprint> {
    Fingerprinter::new(tracked).fingerprint(attributes)
}

/// Length-prefixed so that ("ab","c") and ("a","bc") never collide.
fn write_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn write_value(hasher: &mut Sha256, value: &AttributeValue) {
    match value {
        AttributeValue::Null => hasher.update([0u8]),
        AttributeValue::Boolean(b) => {
            hasher.update([1u8]);
            hasher.update([*b as u8]);
        }
        AttributeValue::Integer(i) => {
            hasher.update([2u8]);
            hasher.update(i.to_be_bytes());
        }
        AttributeValue::Decimal(f) => {
            hasher.update([3u8]);
            hasher.update(f.to_bits().to_be_bytes());
        }
        AttributeValue::Text(s) => {
            hasher.update([4u8]);
            write_bytes(hasher, s.as_bytes());
        }
        AttributeValue::Date(d) => {
            hasher.update([5u8]);
            hasher.update(chrono::Datelike::num_days_from_ce(d).to_be_bytes());
        }
        AttributeValue::Timestamp(ts) => {
            hasher.update([6u8]);
            hasher.update(ts.and_utc().timestamp_micros().to_be_bytes());
        }
    }
}
