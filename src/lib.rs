//! # Change Stream Migration
//!
//! Live migration of a document collection between two deployments while the
//! source keeps taking writes.
//!
//! ## Architecture
//!
//! Changes are captured from the source's change feed into a staging log
//! (`_cdc`) on the destination, and replayed onto the destination collection
//! once the bulk copy has landed:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         changestream-migration                           │
//! │                                                                          │
//! │  ┌──────────────┐    ┌───────────────┐    ┌────────────┐    ┌─────────┐  │
//! │  │ ChangeFeed   │───►│ CaptureEngine │───►│ StagingLog │───►│ Replay  │  │
//! │  │ (source)     │    │ (sequence)    │    │ (_cdc)     │    │ Engine  │  │
//! │  └──────────────┘    └───────────────┘    └────────────┘    └─────────┘  │
//! │         ▲                    │                                   │       │
//! │         │                    ▼                                   ▼       │
//! │  ┌──────────────┐    ┌─────────────────┐              ┌──────────────┐   │
//! │  │ Priming      │───►│ CheckpointStore │              │ Destination  │   │
//! │  │ Controller   │    │ (file / SQLite) │              │ collection   │   │
//! │  └──────────────┘    └─────────────────┘              └──────────────┘   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Migration Steps
//!
//! 1. `check-for-docs`: the source has a document to anchor priming on
//! 2. `prime-and-wait` (or `trigger-only` + `await-prime`): save a resume position
//! 3. `check-token-file`: the position is on disk
//! 4. `cdc`: capture from the saved position into `_cdc`
//! 5. Bulk copy (external tool)
//! 6. `cdr`: replay `_cdc` onto the destination
//!
//! ## Usage
//!
//! ```rust,no_run
//! use changestream_migration::{
//!     mongo, CaptureEngine, FileCheckpointStore, MigrationConfig, MongoSource, MongoStagingLog,
//! };
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> changestream_migration::Result<()> {
//!     let config = MigrationConfig::default();
//!     let source = mongo::connect(&config.source_uri, config.connect.timeout_duration()).await?;
//!     let dest = mongo::connect(&config.destination_uri, config.connect.timeout_duration()).await?;
//!
//!     let ns = config.namespace();
//!     let feed = MongoSource::new(&source, ns.clone());
//!     let log = MongoStagingLog::new(&dest, &ns.db, &config.staging.collection);
//!     let checkpoint = FileCheckpointStore::new(&config.checkpoint.dir, ns);
//!
//!     let (_tx, rx) = watch::channel(false);
//!     CaptureEngine::from_config(&config)?
//!         .run(&feed, &checkpoint, &log, rx)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod metrics;
pub mod mongo;
pub mod preflight;
pub mod priming;
pub mod replay;
pub mod resilience;
pub mod staging;
pub mod store;

// Re-exports for convenience
pub use capture::{CaptureEngine, CaptureSummary, SequenceClock};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, SqliteCheckpointStore};
pub use config::{CheckpointBackend, LogFormat, MigrationConfig};
pub use error::{MigrationError, Result};
pub use event::{ChangeEvent, Namespace, OperationType, ResumePosition};
pub use memory::{MemoryCollection, MemoryStagingLog, MemoryStore};
pub use mongo::{MongoDestination, MongoSource, MongoStagingLog};
pub use priming::PrimingController;
pub use replay::{ApplyOutcome, ReplayEngine, ReplaySummary};
pub use staging::{PendingEntry, ReplayStatus, StagedRecord, StagingLog, StagingStats};
pub use store::{ChangeFeedSource, DestinationStore, SourceCollection};
