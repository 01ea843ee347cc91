//! The worker loop: claim, resolve, identify, dedup, submit, record.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, warn};

use crate::backlog::Backlog;
use crate::config::PipelineConfig;
use crate::dedup::{DedupIndex, Verdict};
use crate::error::{Error, Result};
use crate::identify::{ContentId, identify};
use crate::model::{Outcome, WorkItem};
use crate::resolver::{ArtifactResolver, Resolved};
use crate::submit::Submitter;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_item_span};

use super::recorder::OutcomeRecorder;

/// One worker: owns its id, its sleep and its shutdown signal.
pub struct Pipeline {
    backlog: Arc<dyn Backlog>,
    submitter: Arc<dyn Submitter>,
    resolver: ArtifactResolver,
    dedup: DedupIndex,
    recorder: OutcomeRecorder,
    config: PipelineConfig,
    worker_id: String,
    shutdown: Notify,
    stopping: AtomicBool,
}

impl Pipeline {
    pub fn new(
        backlog: Arc<dyn Backlog>,
        submitter: Arc<dyn Submitter>,
        uploads_dir: impl Into<PathBuf>,
        config: PipelineConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            backlog,
            submitter,
            resolver: ArtifactResolver::new(uploads_dir, config.scan_recent),
            dedup: DedupIndex::new(config.dedup_window),
            recorder: OutcomeRecorder::from_config(&config),
            config,
            worker_id: worker_id.into(),
            shutdown: Notify::new(),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Ask the loop to stop. The item in hand is finished first; an idle
    /// sleep ends immediately.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Run cycles until shutdown. Sleeps `poll_interval` after any cycle in
    /// which no item reached a terminal state.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker = %self.worker_id,
            dir = %self.resolver.dir().display(),
            batch = self.config.batch,
            dedup_window = %self.dedup.describe_window(),
            "pipeline started"
        );

        while !self.is_stopping() {
            let processed = match self.run_cycle().await {
                Ok(n) => n,
                Err(e) => {
                    error!(worker = %self.worker_id, error = %e, "cycle failed");
                    0
                }
            };

            if processed == 0 && !self.is_stopping() {
                tokio::select! {
                    _ = self.shutdown.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker = %self.worker_id, "pipeline stopped");
        Ok(())
    }

    /// Claim and process up to `batch` items, one at a time. Returns how
    /// many ended forwarded or dead. The cycle ends early on a retry.
    pub async fn run_cycle(&self) -> Result<usize> {
        let mut terminal = 0;

        for _ in 0..self.config.batch {
            if self.is_stopping() {
                break;
            }

            let now = chrono::Utc::now();
            let Some(item) = self
                .backlog
                .claim_next(&self.worker_id, now, self.config.lease)
                .await?
            else {
                break;
            };
            metrics::artifacts_claimed().add(1, &[KeyValue::new("worker", self.worker_id.clone())]);

            // A retried item is immediately claimable again, so a failure
            // ends the cycle instead of burning its attempts in one batch.
            if self.handle(item).await?.target_status().is_terminal() {
                terminal += 1;
            } else {
                break;
            }
        }

        Ok(terminal)
    }

    /// Process a claimed item and record its outcome.
    ///
    /// A lost lease is not an error for the loop: the item belongs to
    /// whoever took it over (or already finished it), and the outcome is
    /// reported as a retry.
    async fn handle(&self, item: WorkItem) -> Result<Outcome> {
        let span = start_item_span(&self.worker_id, item.id, item.attempts);

        async {
            info!(
                id = %item.id,
                attempt = item.attempts,
                filename = item.display_name(),
                "claimed"
            );

            let outcome = self.process(&item).await;

            match self
                .recorder
                .record(self.backlog.as_ref(), &self.worker_id, &item, outcome)
                .await
            {
                Ok((outcome, updated)) => {
                    span.record("work.outcome", outcome.label());
                    metrics::artifact_outcomes()
                        .add(1, &[KeyValue::new("outcome", outcome.label())]);
                    record_state_transition(
                        &span,
                        item.status.as_str(),
                        updated.status.as_str(),
                        updated.last_error.as_deref(),
                    );
                    log_outcome(&updated, &outcome);
                    Ok(outcome)
                }
                Err(Error::LeaseLost { id, worker }) => {
                    warn!(%id, %worker, "lease lost before outcome was written, discarding");
                    Ok(Outcome::Retry {
                        reason: "lease lost".to_string(),
                    })
                }
                Err(Error::InvalidTransition { from, to }) => {
                    warn!(id = %item.id, %from, %to, "item finished by another worker, discarding");
                    Ok(Outcome::Retry {
                        reason: "lease lost".to_string(),
                    })
                }
                Err(e) => Err(e),
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Decide what happens to a claimed item. Writes nothing except the
    /// content hash registration done by the dedup check.
    pub async fn process(&self, item: &WorkItem) -> Outcome {
        let (resolved, content) = match self.locate(item).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                return Outcome::Dead {
                    reason: format!("artifact not found in {}", self.resolver.dir().display()),
                    duplicate_of: None,
                };
            }
            Err(e) => {
                return Outcome::Retry {
                    reason: format!("artifact lookup failed: {e}"),
                };
            }
        };
        debug!(
            id = %item.id,
            path = %resolved.path.display(),
            strategy = ?resolved.strategy,
            content = %content,
            "artifact resolved"
        );

        if let Verdict::Duplicate { hash } = self
            .dedup
            .check(self.backlog.as_ref(), item, &content)
            .await
        {
            return Outcome::Dead {
                reason: format!(
                    "duplicate content {hash} within {}",
                    self.dedup.describe_window()
                ),
                duplicate_of: Some(hash),
            };
        }

        let started = Instant::now();
        let result = self
            .submitter
            .submit(&resolved.path, item.display_name())
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::submission_duration_ms().record(
            elapsed_ms,
            &[KeyValue::new(
                "result",
                if result.is_ok() { "ok" } else { "error" },
            )],
        );

        match result {
            Ok(ack) => Outcome::Forwarded {
                task_ref: ack.task_ref,
                raw_response: ack.raw,
                content_hash: content.hash().map(str::to_string),
            },
            Err(e) => Outcome::Retry {
                reason: e.to_string(),
            },
        }
    }

    /// Resolve and hash on the blocking pool.
    async fn locate(&self, item: &WorkItem) -> Result<Option<(Resolved, ContentId)>> {
        let resolver = self.resolver.clone();
        let item = item.clone();
        tokio::task::spawn_blocking(move || {
            let resolved = resolver.resolve(&item)?;
            let content = identify(&resolved.path, &item);
            Some((resolved, content))
        })
        .await
        .map_err(|e| Error::Other(format!("blocking task failed: {e}")))
    }
}

fn log_outcome(item: &WorkItem, outcome: &Outcome) {
    match outcome {
        Outcome::Forwarded { task_ref, .. } => info!(
            id = %item.id,
            task_ref = ?task_ref.map(|t| t.0),
            hash = item.content_hash.as_deref().unwrap_or("unknown"),
            "forwarded"
        ),
        Outcome::Dead {
            reason,
            duplicate_of: Some(hash),
        } => info!(id = %item.id, %hash, %reason, "dropped duplicate"),
        Outcome::Dead { reason, .. } => warn!(id = %item.id, %reason, "dead"),
        Outcome::Retry { reason } => warn!(
            id = %item.id,
            attempt = item.attempts,
            %reason,
            retry_after = ?item.retry_after,
            "returned for retry"
        ),
    }
}
