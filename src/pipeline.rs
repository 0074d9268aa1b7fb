//! # Replication pipeline
//!
//! Single-consumer loop tying the pieces together: pull a batch from the
//! event source, apply it through the batch controller, record observed
//! schemas, then checkpoint the consumed position.
//!
//! Ordering guarantees live here: batches are processed strictly in arrival
//! order, one at a time, and the checkpoint for a batch is written only
//! after the batch's data commit has succeeded. A rolled-back batch leaves
//! the checkpoint untouched: the run continues past it, but if the process
//! stops before a later commit the failed batch is redelivered on restart.
//!
//! Fatal conditions (source failure, connectivity retries exhausted,
//! checkpoint or schema-history write failure) end the run; everything else
//! is absorbed into the summary and the loop continues.

use crate::batch::{ApplyCounts, BatchController, BatchResult};
use crate::checkpoint::{Checkpoint, SharedCheckpointBackend};
use crate::error::PipelineError;
use crate::schema_history::SchemaHistory;
use crate::source::EventSource;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Accumulated totals for a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Batches consumed (committed and rolled back)
    pub batches: u64,
    /// Per-operation record counts across committed batches
    pub counts: ApplyCounts,
    /// Batch-level error count
    pub errors: u64,
}

impl RunSummary {
    fn absorb(&mut self, result: &BatchResult) {
        self.batches += 1;
        self.counts.merge(&result.counts);
        self.errors += result.errors;
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "batches={} creates={} updates={} deletes={} snapshots={} discarded={} errors={}",
            self.batches,
            self.counts.creates,
            self.counts.updates,
            self.counts.deletes,
            self.counts.snapshots,
            self.counts.discarded,
            self.errors
        )
    }
}

/// What a finished (or aborted) run looked like.
///
/// The summary covers everything consumed before the run ended, whether the
/// end was clean (end of stream, shutdown) or a fatal error.
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub error: Option<PipelineError>,
}

impl RunReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// The replication pipeline.
pub struct Pipeline {
    stream: String,
    max_events: usize,
    source: Box<dyn EventSource>,
    controller: BatchController,
    checkpoints: SharedCheckpointBackend,
    history: SchemaHistory,
}

impl Pipeline {
    pub fn new(
        stream: impl Into<String>,
        max_events: usize,
        source: Box<dyn EventSource>,
        controller: BatchController,
        checkpoints: SharedCheckpointBackend,
        history: SchemaHistory,
    ) -> Self {
        Self {
            stream: stream.into(),
            max_events: max_events.max(1),
            source,
            controller,
            checkpoints,
            history,
        }
    }

    /// Run until end of stream, shutdown signal, or fatal error.
    ///
    /// The summary in the returned report is complete either way and is also
    /// logged before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RunReport {
        let mut summary = RunSummary::default();

        if let Err(e) = self.resume().await {
            error!(error = %e, "failed to resume from checkpoint");
            return self.finish(summary, Some(e));
        }

        loop {
            let batch = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => {
                    info!(stream = %self.stream, "shutdown requested; stopping at batch boundary");
                    break;
                }
                batch = self.source.next_batch(self.max_events) => batch,
            };

            let envelopes = match batch {
                Ok(Some(envelopes)) => envelopes,
                Ok(None) => {
                    info!(stream = %self.stream, "end of stream");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "event source failed");
                    return self.finish(summary, Some(e));
                }
            };

            let result = match self.controller.apply(&envelopes).await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "batch application failed fatally");
                    return self.finish(summary, Some(e));
                }
            };

            if result.rolled_back {
                warn!(
                    stream = %self.stream,
                    envelopes = envelopes.len(),
                    "batch rolled back; continuing with next batch"
                );
            } else {
                for (table, fields) in &result.observed_fields {
                    match self.history.observe(table, fields.iter().cloned()).await {
                        Ok(true) => debug!(table, "recorded new table shape"),
                        Ok(false) => {}
                        Err(e) => {
                            error!(table, error = %e, "schema history write failed");
                            summary.absorb(&result);
                            return self.finish(summary, Some(e));
                        }
                    }
                }
            }

            summary.absorb(&result);

            // Checkpoint only after the data commit; a rolled-back batch
            // stays replayable until something after it commits.
            if !result.rolled_back {
                let checkpoint = Checkpoint::at(self.stream.clone(), self.source.position());
                if let Err(e) = self.checkpoints.save(&self.stream, checkpoint).await {
                    error!(error = %e, "checkpoint write failed");
                    return self.finish(summary, Some(e));
                }
            }
        }

        self.finish(summary, None)
    }

    /// Seek the source past everything a previous run already consumed.
    async fn resume(&mut self) -> crate::error::Result<()> {
        if let Some(checkpoint) = self.checkpoints.load(&self.stream).await? {
            info!(
                stream = %self.stream,
                position = %checkpoint.position,
                age_secs = checkpoint.age_secs(),
                "resuming from checkpoint"
            );
            self.source.seek(&checkpoint.position).await?;
        } else {
            info!(stream = %self.stream, "no checkpoint; starting from the beginning");
        }
        Ok(())
    }

    fn finish(&self, summary: RunSummary, error: Option<PipelineError>) -> RunReport {
        info!(stream = %self.stream, %summary, "pipeline run finished");
        RunReport { summary, error }
    }
}

/// Resolve when the shutdown flag flips to true.
///
/// A dropped sender means shutdown can never be requested; park forever
/// instead of spinning on the closed channel.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
