//! Configuration for the migration pipeline.
//!
//! Configuration can be constructed programmatically, loaded from a TOML file,
//! and is then overridden by command-line flags. Every field has a default,
//! so an empty file is a valid configuration.
//!
//! # Quick Start
//!
//! ```rust
//! use changestream_migration::config::MigrationConfig;
//!
//! let config = MigrationConfig {
//!     database: "shop".into(),
//!     collection: "orders".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MigrationConfig
//! ├── source_uri / destination_uri / database / collection
//! ├── staging: StagingConfig        # shared `_cdc` collection
//! ├── checkpoint: CheckpointConfig  # file or SQLite resume positions
//! ├── capture: CaptureConfig        # change feed options
//! ├── replay: ReplayConfig          # batch size, idle backoff, rate limit
//! ├── priming: PrimingConfig
//! ├── retry: RetrySettings          # backoff budget for store failures
//! ├── connect: ConnectConfig
//! └── logging: LoggingConfig
//! ```
//!
//! # TOML Example
//!
//! ```toml
//! source_uri = "mongodb://src-1:27017/?replicaSet=rs0"
//! destination_uri = "mongodb://dst-1:27017/?replicaSet=rs0"
//! database = "shop"
//! collection = "orders"
//!
//! [checkpoint]
//! backend = "sqlite"
//! sqlite_path = "/var/lib/migration/checkpoints.db"
//!
//! [replay]
//! batch_size = 500
//! idle_backoff = "250ms"
//! max_idle_backoff = "5s"
//! ```

use crate::error::{MigrationError, Result};
use crate::event::Namespace;
use crate::resilience::{RateLimitConfig, RetryConfig};
use crate::staging::DEFAULT_STAGING_COLLECTION;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level configuration of one migration process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Connection string of the source store.
    pub source_uri: String,

    /// Connection string of the destination store (holds the staging log).
    pub destination_uri: String,

    /// Database of the collection being migrated.
    pub database: String,

    /// Collection being migrated.
    pub collection: String,

    pub staging: StagingConfig,
    pub checkpoint: CheckpointConfig,
    pub capture: CaptureConfig,
    pub replay: ReplayConfig,
    pub priming: PrimingConfig,
    pub retry: RetrySettings,
    pub connect: ConnectConfig,
    pub logging: LoggingConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source_uri: "mongodb://localhost:27017".to_string(),
            destination_uri: "mongodb://localhost:27018".to_string(),
            database: String::new(),
            collection: String::new(),
            staging: StagingConfig::default(),
            checkpoint: CheckpointConfig::default(),
            capture: CaptureConfig::default(),
            replay: ReplayConfig::default(),
            priming: PrimingConfig::default(),
            retry: RetrySettings::default(),
            connect: ConnectConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl MigrationConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| MigrationError::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Create a minimal config for testing.
    pub fn for_testing(database: &str, collection: &str) -> Self {
        Self {
            database: database.to_string(),
            collection: collection.to_string(),
            replay: ReplayConfig::for_testing(),
            retry: RetrySettings::for_testing(),
            ..Default::default()
        }
    }

    /// The namespace being migrated.
    pub fn namespace(&self) -> Namespace {
        Namespace::new(&self.database, &self.collection)
    }

    /// The staging collection, in the destination database.
    pub fn staging_namespace(&self) -> Namespace {
        Namespace::new(&self.database, &self.staging.collection)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_name("database", &self.database)?;
        validate_name("collection", &self.collection)?;
        validate_name("staging collection", &self.staging.collection)?;

        if self.replay.batch_size == 0 {
            return Err(MigrationError::Configuration(
                "replay.batch_size cannot be 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(MigrationError::Configuration(
                "retry.max_attempts cannot be 0".to_string(),
            ));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(MigrationError::Configuration(
                "retry.backoff_factor must be >= 1.0".to_string(),
            ));
        }

        for (field, value) in [
            ("replay.idle_backoff", &self.replay.idle_backoff),
            ("replay.max_idle_backoff", &self.replay.max_idle_backoff),
            ("priming.trigger_delay", &self.priming.trigger_delay),
            ("retry.initial_delay", &self.retry.initial_delay),
            ("retry.max_delay", &self.retry.max_delay),
            ("connect.timeout", &self.connect.timeout),
        ] {
            parse_duration(field, value)?;
        }

        if self.replay.idle_backoff_duration() > self.replay.max_idle_backoff_duration() {
            return Err(MigrationError::Configuration(
                "replay.idle_backoff cannot exceed replay.max_idle_backoff".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(MigrationError::Configuration(format!(
            "{} name cannot be empty",
            field
        )));
    }
    if value.contains('/') || value.contains('\\') || value.contains('\0') {
        return Err(MigrationError::Configuration(format!(
            "{} name {:?} contains an invalid character",
            field, value
        )));
    }
    Ok(())
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| {
        MigrationError::Configuration(format!("{}: invalid duration {:?}: {}", field, value, e))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// StagingConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Where captured events are staged on the destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Name of the staging collection, in the migrated database.
    pub collection: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            collection: DEFAULT_STAGING_COLLECTION.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// One `<db>.<coll>.token` file per namespace.
    File,
    /// One row per namespace in a SQLite file.
    Sqlite,
}

/// Resume position persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub backend: CheckpointBackend,

    /// Directory holding token files (file backend).
    pub dir: PathBuf,

    /// Database file (SQLite backend).
    pub sqlite_path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::File,
            dir: PathBuf::from("./tokens"),
            sqlite_path: PathBuf::from("./tokens/checkpoints.db"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CaptureConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Change feed options for the capture engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Ask the source for the post-image of updates.
    pub full_document_lookup: bool,

    /// Extra aggregation stages applied to the feed, as JSON documents.
    /// Empty captures every change.
    pub pipeline: Vec<serde_json::Value>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            full_document_lookup: true,
            pipeline: Vec::new(),
        }
    }
}

impl CaptureConfig {
    /// Convert the configured pipeline stages to BSON.
    pub fn pipeline_documents(&self) -> Result<Vec<bson::Document>> {
        self.pipeline
            .iter()
            .map(|stage| {
                let bson = bson::Bson::try_from(stage.clone()).map_err(|e| {
                    MigrationError::Configuration(format!("capture.pipeline: {}", e))
                })?;
                match bson {
                    bson::Bson::Document(doc) => Ok(doc),
                    other => Err(MigrationError::Configuration(format!(
                        "capture.pipeline stages must be documents, got {}",
                        other
                    ))),
                }
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplayConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Replay engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Maximum pending records fetched per staging query.
    pub batch_size: usize,

    /// First sleep after an empty staging query (e.g. "250ms").
    pub idle_backoff: String,

    /// Ceiling for the doubling idle sleep.
    pub max_idle_backoff: String,

    /// Create the document on replace/update when it is missing on the
    /// destination.
    pub upsert_on_replace: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (destination protection during catch-up)
    // ─────────────────────────────────────────────────────────────────────────
    pub rate_limit_enabled: bool,
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_backoff: "250ms".to_string(),
            max_idle_backoff: "5s".to_string(),
            upsert_on_replace: true,
            rate_limit_enabled: false,
            rate_limit_per_sec: 1000,
            rate_limit_burst: 100,
        }
    }
}

impl ReplayConfig {
    /// Short sleeps so tests observe idle behaviour quickly.
    pub fn for_testing() -> Self {
        Self {
            batch_size: 10,
            idle_backoff: "5ms".to_string(),
            max_idle_backoff: "20ms".to_string(),
            ..Default::default()
        }
    }

    pub fn idle_backoff_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_backoff).unwrap_or(Duration::from_millis(250))
    }

    pub fn max_idle_backoff_duration(&self) -> Duration {
        humantime::parse_duration(&self.max_idle_backoff).unwrap_or(Duration::from_secs(5))
    }

    /// Rate limit configuration, `None` when disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PrimingConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimingConfig {
    /// Pause before the trigger-only mutation, giving a separately started
    /// waiter time to subscribe.
    pub trigger_delay: String,
}

impl Default for PrimingConfig {
    fn default() -> Self {
        Self {
            trigger_delay: "2s".to_string(),
        }
    }
}

impl PrimingConfig {
    pub fn trigger_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.trigger_delay).unwrap_or(Duration::from_secs(2))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Backoff budget for steady-state store failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub initial_delay: String,
    pub max_delay: String,
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: "100ms".to_string(),
            max_delay: "30s".to_string(),
            backoff_factor: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: "1ms".to_string(),
            max_delay: "10ms".to_string(),
            backoff_factor: 2.0,
        }
    }

    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: humantime::parse_duration(&self.initial_delay)
                .unwrap_or(Duration::from_millis(100)),
            max_delay: humantime::parse_duration(&self.max_delay)
                .unwrap_or(Duration::from_secs(30)),
            backoff_factor: self.backoff_factor,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConnectConfig / LoggingConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Server selection and socket timeout (e.g. "5s").
    pub timeout: String,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout: "5s".to_string(),
        }
    }
}

impl ConnectConfig {
    pub fn timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(5))
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
