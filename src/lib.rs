//! # chronosink - Change-event replication into a temporal database
//!
//! Consumes log-based change-data-capture events from an upstream OLTP
//! database and replays them as temporal writes, turning a conventional
//! current-state database into a fully historized, time-travel-queryable
//! replica.
//!
//! ## Features
//!
//! - `postgres` - target connectivity over the PostgreSQL wire protocol
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐    ┌────────────────────────────────────────────┐
//! │ Capture engine │    │                 chronosink                 │
//! │ (live log tail │    │                                            │
//! │  or recorded   │───▶│  EventSource ─▶ EnvelopeParser             │
//! │  event file)   │    │       │              │                     │
//! └────────────────┘    │       │        ChangeRecord                │
//!                       │       │              │                     │
//!                       │       │         Translator                 │
//!                       │       │              │                     │
//!                       │       ▼              ▼                     │
//!                       │  BatchController ─▶ TemporalTarget ───────▶│──▶ temporal DB
//!                       │       │                                    │
//!                       │       ├─▶ CheckpointStore  (resume point)  │
//!                       │       └─▶ SchemaHistory    (table shapes)  │
//!                       └────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> anyhow::Result<()> {
//! use chronosink::batch::{BatchController, BatchOptions};
//! use chronosink::checkpoint::MemoryCheckpointStore;
//! use chronosink::envelope::EnvelopeParser;
//! use chronosink::pipeline::Pipeline;
//! use chronosink::schema_history::SchemaHistory;
//! use chronosink::source::FileEventSource;
//! use chronosink::target::MemoryTarget;
//! use chronosink::translate::Translator;
//! use std::sync::Arc;
//!
//! let source = FileEventSource::open("./events.jsonl").await?;
//! let controller = BatchController::new(
//!     Arc::new(MemoryTarget::new()),
//!     EnvelopeParser::default(),
//!     Translator::default(),
//!     BatchOptions::default(),
//! );
//! let pipeline = Pipeline::new(
//!     "orders",
//!     500,
//!     Box::new(source),
//!     controller,
//!     Arc::new(MemoryCheckpointStore::new()),
//!     SchemaHistory::open("./schema_history.jsonl").await?,
//! );
//!
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! let report = pipeline.run(shutdown).await;
//! println!("{}", report.summary);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod envelope;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod schema_history;
pub mod source;
pub mod target;
pub mod translate;

// Core types most callers need.
pub use batch::{ApplyCounts, BatchController, BatchOptions, BatchResult};
pub use envelope::{Envelope, EnvelopeParser};
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, RunReport, RunSummary};
pub use record::{ChangeOp, ChangeRecord};
pub use translate::{Translator, WriteIntent};

// Durability and delivery.
pub use checkpoint::{Checkpoint, CheckpointBackend, CheckpointStore, StreamPosition};
pub use schema_history::SchemaHistory;
pub use source::{EventSource, FileEventSource, QueueEventSource};
pub use target::{MemoryTarget, TemporalTarget};

// Configuration.
pub use config::PipelineConfig;
