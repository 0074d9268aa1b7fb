//! # Batch transaction controller
//!
//! Groups a run of raw envelopes into one transactional unit, applies them
//! strictly in arrival order against the target, and decides commit vs.
//! rollback.
//!
//! Failure semantics are deliberately coarse-grained: one bad record rolls
//! back the whole batch, counts one batch-level error, and the pipeline
//! moves on to the next batch. In-batch order matters because later records
//! for the same id may depend on earlier ones (an Update immediately after
//! its Create); nothing is reordered or parallelized.
//!
//! Every target call is wrapped with a per-call timeout and bounded
//! retry-with-backoff; retriable errors that survive the retries are
//! returned as fatal, stopping the pipeline.

use crate::envelope::EnvelopeParser;
use crate::error::{PipelineError, Result};
use crate::record::ChangeOp;
use crate::retry::{retry, RetryConfig};
use crate::target::SharedTarget;
use crate::translate::Translator;
use bytes::Bytes;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Counts of applied records by operation, plus silently discarded events.
///
/// An explicit value threaded through and returned, never shared mutable
/// state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyCounts {
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub snapshots: u64,
    /// Events the parser or include-filter dropped; not errors
    pub discarded: u64,
}

impl ApplyCounts {
    pub fn bump(&mut self, op: ChangeOp) {
        match op {
            ChangeOp::Create => self.creates += 1,
            ChangeOp::Update => self.updates += 1,
            ChangeOp::Delete => self.deletes += 1,
            ChangeOp::Snapshot => self.snapshots += 1,
        }
    }

    /// Total records applied (excludes discarded).
    pub fn total_applied(&self) -> u64 {
        self.creates + self.updates + self.deletes + self.snapshots
    }

    pub fn merge(&mut self, other: &ApplyCounts) {
        self.creates += other.creates;
        self.updates += other.updates;
        self.deletes += other.deletes;
        self.snapshots += other.snapshots;
        self.discarded += other.discarded;
    }
}

/// Outcome of applying one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// Records committed (0 when the batch rolled back)
    pub committed: usize,
    /// Whether the batch's transactional scope was rolled back
    pub rolled_back: bool,
    /// Batch-level error count (0 or 1)
    pub errors: u64,
    /// Per-operation counts for the committed records
    pub counts: ApplyCounts,
    /// Table -> field names observed on committed records, payload order
    pub observed_fields: Vec<(String, Vec<String>)>,
}

/// Tuning for the controller's target boundary.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Timeout for each individual target call
    pub call_timeout: Duration,
    /// Retry policy for retriable target failures
    pub retry: RetryConfig,
    /// Tables to replicate; empty means all
    pub include_tables: HashSet<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            include_tables: HashSet::new(),
        }
    }
}

/// Applies batches of raw envelopes as single transactional units.
pub struct BatchController {
    target: SharedTarget,
    parser: EnvelopeParser,
    translator: Translator,
    options: BatchOptions,
}

impl BatchController {
    pub fn new(
        target: SharedTarget,
        parser: EnvelopeParser,
        translator: Translator,
        options: BatchOptions,
    ) -> Self {
        Self {
            target,
            parser,
            translator,
            options,
        }
    }

    /// Apply one batch of raw envelopes as a single transactional unit.
    ///
    /// Returns `Ok` with a rolled-back result for contained per-record
    /// failures; returns `Err` only for fatal conditions (connectivity
    /// exhausted retries, broken transaction scope) that must stop the
    /// pipeline.
    pub async fn apply(&self, envelopes: &[Bytes]) -> Result<BatchResult> {
        if envelopes.is_empty() {
            return Ok(BatchResult::default());
        }

        let mut counts = ApplyCounts::default();
        let mut observed_fields = Vec::new();
        let mut applied = 0usize;

        self.guarded("begin", || self.target.begin()).await?;

        for raw in envelopes {
            let Some(record) = self.parser.parse(raw) else {
                counts.discarded += 1;
                continue;
            };

            if !self.included(&record.table) {
                debug!(table = %record.table, "skipping record for excluded table");
                counts.discarded += 1;
                continue;
            }

            let intent = self.translator.translate(&record);
            match self.guarded("execute", || self.target.execute(&intent)).await {
                Ok(()) => {
                    observed_fields.push((record.table.clone(), record.field_names()));
                    counts.bump(record.op);
                    applied += 1;
                }
                Err(e) if e.is_retriable() => {
                    // Retries already exhausted: connectivity is gone.
                    warn!(error = %e, "target unreachable mid-batch; abandoning");
                    if let Err(rb) = self.target.rollback().await {
                        warn!(error = %rb, "rollback after connectivity loss failed");
                    }
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        table = %record.table,
                        op = %record.op,
                        error = %e,
                        raw = %preview(raw),
                        "record failed; rolling back batch"
                    );
                    self.guarded("rollback", || self.target.rollback()).await?;
                    return Ok(BatchResult {
                        committed: 0,
                        rolled_back: true,
                        errors: 1,
                        counts: ApplyCounts {
                            discarded: counts.discarded,
                            ..ApplyCounts::default()
                        },
                        observed_fields: Vec::new(),
                    });
                }
            }
        }

        self.guarded("commit", || self.target.commit()).await?;

        debug!(
            committed = applied,
            discarded = counts.discarded,
            "batch committed"
        );
        Ok(BatchResult {
            committed: applied,
            rolled_back: false,
            errors: 0,
            counts,
            observed_fields,
        })
    }

    fn included(&self, table: &str) -> bool {
        self.options.include_tables.is_empty() || self.options.include_tables.contains(table)
    }

    /// Wrap a target call with the per-call timeout and retry policy.
    async fn guarded<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.options.call_timeout;
        retry(&self.options.retry, || {
            let fut = call();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::timeout(format!("target {what} call"))),
                }
            }
        })
        .await
    }
}

/// Truncated representation of a raw envelope for logging.
fn preview(raw: &Bytes) -> String {
    const LIMIT: usize = 240;
    let text = String::from_utf8_lossy(raw);
    if text.len() > LIMIT {
        let mut end = LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    } else {
        text.into_owned()
    }
}
