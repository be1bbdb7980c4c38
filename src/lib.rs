// SCD Merge - Core Library
// Slowly-changing-dimension (type 2) merge engine, used by the CLI, the API server and tests

pub mod error;
pub mod attributes;   // Typed attribute values + definitions
pub mod dimension;    // Dimension specs + registry
pub mod temporal;     // Validity windows, timelines, clock
pub mod fingerprint;  // Change Fingerprint
pub mod extract;      // CSV extracts
pub mod resolver;     // Version Resolver
pub mod store;        // DimensionStore: SQLite + in-memory
pub mod writer;       // Temporal Writer
pub mod orchestrator; // Merge Orchestrator
pub mod query;        // Current / as-of / history / verify
pub mod config;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use error::{MergeError, Result};
pub use attributes::{
    AttributeDefinition, AttributeType, AttributeValue, Attributes, ConcatSource, EntityId,
};
pub use dimension::{DimensionRegistry, DimensionSpec};
pub use temporal::{
    Clock, DimensionRow, EntityTimeline, FixedClock, InvariantReport, SystemClock,
    Violation, ViolationKind,
};
pub use fingerprint::{fingerprint, Fingerprint, Fingerprinter};
pub use extract::{load_csv, read_csv, EntityRecord, Extract};
pub use resolver::{Classification, Resolution, VersionResolver};
pub use store::{DimensionStore, MemoryStore, SqliteStore, StagingArea};
pub use writer::{CancelFlag, TemporalWriter, WriteSummary};
pub use orchestrator::{MergeOrchestrator, RunCounts, RunFailure, RunReport, RunState};
pub use config::MergeConfig;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
