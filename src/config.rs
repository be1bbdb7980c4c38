// ⚙️ Merge Configuration - TOML file, then CLI / env overrides
//
// Example scd.toml:
//
//   database = "retail.db"
//   busy_timeout_ms = 5000
//   dimension = "customer"
//   tracked = ["profession", "email"]
//
//   [log]
//   format = "json"
//
//   [[dimensions]]
//   name = "supplier"
//   table = "dim_supplier"
//   key = "supplier_id"
//   tracked = [{ name = "supplier_name", type = "text" }]

use crate::dimension::{DimensionRegistry, DimensionSpec};
use crate::error::{MergeError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DATABASE: &str = "scd.db";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// EnvFilter directive used when RUST_LOG is unset
    pub level: String,
}

impl LogConfig {
    /// Install the global tracing subscriber. RUST_LOG wins over `level`.
    pub fn init(&self) {
        use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()));

        // Logs go to stderr; stdout carries command output
        let registry = tracing_subscriber::registry().with(filter);
        let installed = match self.format {
            LogFormat::Text => registry
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .try_init(),
            LogFormat::Json => registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .flatten_event(true)
                        .with_writer(std::io::stderr),
                )
                .try_init(),
        };
        if installed.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub database: PathBuf,
    pub busy_timeout_ms: u64,

    /// Dimension used when a command does not name one
    pub dimension: Option<String>,

    /// Run as_of override (RFC3339 or YYYY-MM-DD); default is now
    pub as_of: Option<String>,

    /// Tracked attribute override for the selected dimension
    pub tracked: Option<Vec<String>>,

    pub log: LogConfig,

    /// Extra dimensions, added to (or replacing) the built-ins
    pub dimensions: Vec<DimensionSpec>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            database: PathBuf::from(DEFAULT_DATABASE),
            busy_timeout_ms: crate::store::sqlite::DEFAULT_BUSY_TIMEOUT_MS,
            dimension: None,
            as_of: None,
            tracked: None,
            log: LogConfig::default(),
            dimensions: Vec::new(),
        }
    }
}

impl MergeConfig {
    /// Read a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MergeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Load `path` if given, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| MergeError::Config(e.to_string()))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Built-in dimensions plus the configured ones.
    pub fn registry(&self) -> Result<DimensionRegistry> {
        let mut registry = DimensionRegistry::new();
        for spec in &self.dimensions {
            registry.register(spec.clone())?;
        }
        Ok(registry)
    }

    /// Spec for `name` (or the configured default), with the tracked
    /// override applied.
    pub fn resolve_dimension(&self, name: Option<&str>) -> Result<DimensionSpec> {
        let name = name.or(self.dimension.as_deref()).ok_or_else(|| {
            MergeError::Config("no dimension given and no default configured".to_string())
        })?;

        let registry = self.registry()?;
        let spec = registry.get(name)?;
        match &self.tracked {
            Some(tracked) => spec.with_tracked(tracked),
            None => Ok(spec.clone()),
        }
    }

    /// Parsed as_of override.
    pub fn as_of(&self) -> Result<Option<DateTime<Utc>>> {
        self.as_of.as_deref().map(parse_as_of).transpose()
    }
}

/// RFC3339 instant, or a plain date meaning midnight UTC.
pub fn parse_as_of(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| MergeError::Config(format!("invalid as_of {:?}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_defaults() {
        let config = MergeConfig::from_toml("").unwrap();

        assert_eq!(config, MergeConfig::default());
        assert_eq!(config.database, PathBuf::from("scd.db"));
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.as_of().unwrap(), None);
    }

    #[test]
    fn test_full_config() {
        let config = MergeConfig::from_toml(
            r#"
            database = "retail.db"
            dimension = "customer"
            as_of = "2025-06-30"
            tracked = ["profession", "email"]

            [log]
            format = "json"

            [[dimensions]]
            name = "supplier"
            table = "dim_supplier"
            key = "supplier_id"
            tracked = [
                { name = "supplier_name", type = "text" },
                { name = "contact", type = "text", concat = { columns = ["contactFirst", "contactLast"] } },
            ]
            passthrough = [{ name = "onboarded", type = "date" }]
            "#,
        )
        .unwrap();

        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(
            config.as_of().unwrap(),
            Some(Utc.with_ymd_and_hms(2025, 6, 30, 0, 0, 0).unwrap())
        );

        let customer = config.resolve_dimension(None).unwrap();
        let tracked: Vec<&str> = customer.tracked.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(tracked, vec!["profession", "email"]);

        let registry = config.registry().unwrap();
        assert_eq!(registry.count(), 4);
        let supplier = registry.get("supplier").unwrap();
        assert_eq!(supplier.passthrough.len(), 1);
        let contact = supplier.tracked[1].concat.as_ref().unwrap();
        assert_eq!(contact.columns, vec!["contactFirst", "contactLast"]);
        assert_eq!(contact.separator, " ");
    }

    #[test]
    fn test_missing_dimension_is_a_config_error() {
        let config = MergeConfig::default();
        assert!(matches!(config.resolve_dimension(None), Err(MergeError::Config(_))));
        assert!(matches!(
            config.resolve_dimension(Some("transaction")),
            Err(MergeError::UnknownDimension(_))
        ));
    }

    #[test]
    fn test_bad_dimension_is_rejected() {
        let config = MergeConfig::from_toml(
            r#"
            [[dimensions]]
            name = "bad"
            table = "dim bad"
            key = "id"
            tracked = [{ name = "x", type = "text" }]
            "#,
        )
        .unwrap();

        assert!(config.registry().is_err());
    }

    #[test]
    fn test_parse_as_of() {
        assert_eq!(
            parse_as_of("2025-06-30T12:30:00+01:00").unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 30, 11, 30, 0).unwrap()
        );
        assert!(parse_as_of("yesterday").is_err());
    }
}
