// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool.
//!
//! A fixed number of tasks claim jobs from the durable queue and hand them to
//! the [`JobHandler`] registered for the job's kind. Delivery is at-least-once:
//! a claim holds a lease, and a job whose worker dies is claimed again once
//! the lease runs out.
//!
//! Outcomes:
//! - `Ok(())` deletes the job.
//! - A skip-retry error, or any error on the last allowed attempt, archives
//!   the job and calls [`JobHandler::on_exhausted`].
//! - Any other error reschedules the job with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gantry_core::models::JobRecord;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{JobQueue, Tier, TierScheduler, retry};
use crate::config::Config;
use crate::error::Result;

/// Per-delivery context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job id.
    pub job_id: String,
    /// Handler routing key.
    pub kind: String,
    /// 1-based delivery number.
    pub attempt: u32,
    /// Retries allowed after the first attempt.
    pub max_retry: u32,
    /// When the worker will give up on this attempt.
    pub deadline: Instant,
    /// Fires on timeout or shutdown.
    pub cancel: CancellationToken,
}

impl JobContext {
    /// Whether a retryable failure now would archive the job.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt > self.max_retry
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Handler failure.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct JobError {
    message: String,
    skip_retry: bool,
}

impl JobError {
    /// A failure worth another attempt.
    pub fn retry(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            skip_retry: false,
        }
    }

    /// A failure that archives the job immediately.
    pub fn skip_retry(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            skip_retry: true,
        }
    }

    /// Failure description.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the skip-retry marker is set.
    pub fn is_skip_retry(&self) -> bool {
        self.skip_retry
    }
}

impl From<crate::error::Error> for JobError {
    fn from(err: crate::error::Error) -> Self {
        Self {
            skip_retry: !err.is_retryable(),
            message: err.to_string(),
        }
    }
}

/// Processes jobs of one kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Kind this handler is registered for.
    fn kind(&self) -> &'static str;

    /// Process one delivery. Must tolerate redelivery of the same job.
    async fn handle(&self, ctx: &JobContext, payload: &[u8]) -> std::result::Result<(), JobError>;

    /// Called once when the job is archived.
    async fn on_exhausted(&self, _ctx: &JobContext, _payload: &[u8], _error: &str) {}
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded; the job was deleted.
    Completed,
    /// Rescheduled after a retryable failure.
    Retried {
        /// Next eligible run time.
        run_at: DateTime<Utc>,
    },
    /// Moved to the archive.
    Archived,
    /// Handed back unfinished because the pool is shutting down.
    Released,
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks.
    pub concurrency: usize,
    /// Idle wait between queue polls.
    pub poll_interval: Duration,
    /// Upper bound on a single attempt; longer job timeouts are clamped.
    pub max_job_timeout: Duration,
    /// Lease slack on top of the attempt timeout.
    pub lease_grace: Duration,
    /// Delay before the next attempt, by failed attempt number.
    pub retry_delay: fn(u32) -> Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval: Duration::from_secs(1),
            max_job_timeout: Duration::from_secs(600),
            lease_grace: Duration::from_secs(30),
            retry_delay: retry::backoff,
        }
    }
}

impl WorkerPoolConfig {
    /// Derive pool settings from the pipeline config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.worker_concurrency,
            poll_interval: config.queue_poll_interval,
            max_job_timeout: config.job_timeout,
            ..Self::default()
        }
    }
}

struct PoolInner {
    queue: JobQueue,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    config: WorkerPoolConfig,
    scheduler: Mutex<TierScheduler>,
    in_flight: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
}

/// Bounded pool of queue workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool serving `handlers`.
    pub fn new(
        queue: JobQueue,
        config: WorkerPoolConfig,
        handlers: impl IntoIterator<Item = Arc<dyn JobHandler>>,
    ) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|handler| (handler.kind(), handler))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                queue,
                handlers,
                config,
                scheduler: Mutex::new(TierScheduler::new()),
                in_flight: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Token that stops the pool when cancelled. In-flight jobs are
    /// cancelled and handed back to the queue.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Number of jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Run all worker tasks until shutdown.
    pub async fn run(self) {
        let concurrency = self.inner.config.concurrency.max(1);
        info!(
            concurrency = concurrency,
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            kinds = ?self.inner.handlers.keys().collect::<Vec<_>>(),
            "Worker pool started"
        );

        let mut tasks = JoinSet::new();
        for worker_id in 0..concurrency {
            let pool = self.clone();
            tasks.spawn(async move { pool.worker_loop(worker_id).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }

        info!("Worker pool stopped");
    }

    async fn worker_loop(&self, worker_id: usize) {
        let shutdown = &self.inner.shutdown;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = worker_id, error = %e, "Failed to process job");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.inner.queue.notified() => {}
                _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
            }
        }
        debug!(worker_id = worker_id, "Worker stopped");
    }

    /// Claim and execute at most one job. Returns `None` when every tier is
    /// empty.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        let order = self.inner.scheduler.lock().await.poll_order();
        for tier in order {
            if let Some(job) = self.claim(tier).await? {
                return self.execute(job).await.map(Some);
            }
        }
        Ok(None)
    }

    async fn claim(&self, tier: Tier) -> Result<Option<JobRecord>> {
        let lease = self.inner.config.max_job_timeout + self.inner.config.lease_grace;
        let now = Utc::now();
        let lease_until = now + millis(lease);
        Ok(self
            .inner
            .queue
            .persistence()
            .claim_job(tier.as_str(), now, lease_until)
            .await?)
    }

    async fn execute(&self, job: JobRecord) -> Result<JobOutcome> {
        let persistence = self.inner.queue.persistence();
        let job_id = job.job_id.clone();
        let attempt = u32::try_from(job.attempts).unwrap_or(0);
        let max_retry = u32::try_from(job.max_retry).unwrap_or(0);

        let max_timeout = self.inner.config.max_job_timeout;
        let requested = Duration::from_secs(u64::try_from(job.timeout_secs).unwrap_or(0));
        let timeout = if requested.is_zero() {
            max_timeout
        } else {
            requested.min(max_timeout)
        };

        let cancel = self.inner.shutdown.child_token();
        let ctx = JobContext {
            job_id: job_id.clone(),
            kind: job.kind.clone(),
            attempt,
            max_retry,
            deadline: Instant::now() + timeout,
            cancel: cancel.clone(),
        };

        let Some(handler) = self.inner.handlers.get(job.kind.as_str()).cloned() else {
            let message = format!("no handler registered for job kind '{}'", job.kind);
            error!(job_id = %job_id, kind = %job.kind, "No handler for job, archiving");
            persistence.archive_job(&job_id, &message).await?;
            return Ok(JobOutcome::Archived);
        };

        let payload = match self.inner.queue.open_payload(&job) {
            Ok(payload) => payload,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Job payload cannot be opened, archiving");
                persistence
                    .archive_job(&job_id, &format!("payload cannot be opened: {}", e))
                    .await?;
                return Ok(JobOutcome::Archived);
            }
        };

        // Claimed again after its worker died on the last allowed attempt.
        if attempt > max_retry + 1 {
            let message = format!(
                "job abandoned after {} deliveries without an outcome",
                attempt - 1
            );
            warn!(job_id = %job_id, attempt = attempt, "Lease expired on last attempt, archiving");
            persistence.archive_job(&job_id, &message).await?;
            handler.on_exhausted(&ctx, &payload, &message).await;
            return Ok(JobOutcome::Archived);
        }

        debug!(job_id = %job_id, kind = %job.kind, attempt = attempt, "Job started");
        self.inner.in_flight.insert(job_id.clone(), cancel.clone());
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, handler.handle(&ctx, &payload)).await;
        self.inner.in_flight.remove(&job_id);

        let result = result.unwrap_or_else(|_| {
            cancel.cancel();
            Err(JobError::retry(format!(
                "job exceeded its {}s execution timeout",
                timeout.as_secs()
            )))
        });

        match result {
            Ok(()) => {
                persistence.complete_job(&job_id).await?;
                info!(
                    job_id = %job_id,
                    kind = %job.kind,
                    attempt = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
                Ok(JobOutcome::Completed)
            }
            Err(e) if self.inner.shutdown.is_cancelled() => {
                persistence
                    .retry_job(&job_id, Utc::now(), &format!("interrupted by shutdown: {}", e))
                    .await?;
                info!(job_id = %job_id, "Job released on shutdown");
                Ok(JobOutcome::Released)
            }
            Err(e) if e.is_skip_retry() || job.retries_exhausted() => {
                persistence.archive_job(&job_id, e.message()).await?;
                warn!(
                    job_id = %job_id,
                    kind = %job.kind,
                    attempt = attempt,
                    skip_retry = e.is_skip_retry(),
                    error = %e,
                    "Job archived"
                );
                handler.on_exhausted(&ctx, &payload, e.message()).await;
                Ok(JobOutcome::Archived)
            }
            Err(e) => {
                let delay = (self.inner.config.retry_delay)(attempt);
                let run_at = Utc::now() + millis(delay);
                persistence.retry_job(&job_id, run_at, e.message()).await?;
                warn!(
                    job_id = %job_id,
                    kind = %job.kind,
                    attempt = attempt,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "Job failed, retry scheduled"
                );
                Ok(JobOutcome::Retried { run_at })
            }
        }
    }
}

fn millis(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}
