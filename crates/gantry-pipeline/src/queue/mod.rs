// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable job queue.
//!
//! Jobs live in the `jobs` table behind [`Persistence`]. Payloads are sealed
//! with the [`SecretCipher`] before they are written because they carry
//! cleartext gateway secrets.
//!
//! Three tiers share the table. Workers pick which tier to poll first with a
//! smooth weighted round-robin ([`tiers::TierScheduler`]), so higher tiers are
//! favoured without starving lower ones.

pub mod retry;
pub mod tiers;
pub mod worker;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gantry_core::Persistence;
use gantry_core::models::{JobRecord, JobState, NewJob};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::info;
use zeroize::Zeroizing;

use crate::crypto::{CryptoError, SecretCipher};
use crate::error::{Error, Result};

pub use tiers::TierScheduler;
pub use worker::{JobContext, JobError, JobHandler, WorkerPool, WorkerPoolConfig};

/// Priority tier a job is queued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Weight 6.
    Critical,
    /// Weight 3.
    Default,
    /// Weight 1.
    Low,
}

impl Tier {
    /// All tiers, highest weight first.
    pub const ALL: [Tier; 3] = [Tier::Critical, Tier::Default, Tier::Low];

    /// Queue name stored with the job.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Default => "default",
            Self::Low => "low",
        }
    }

    /// Scheduling weight.
    pub fn weight(&self) -> i64 {
        match self {
            Self::Critical => 6,
            Self::Default => 3,
            Self::Low => 1,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "critical" => Ok(Self::Critical),
            "default" => Ok(Self::Default),
            "low" => Ok(Self::Low),
            other => Err(Error::invalid("queue", format!("unknown queue '{}'", other))),
        }
    }
}

/// Per-job enqueue options.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Tier to queue on.
    pub queue: Tier,
    /// Retries allowed after the first attempt.
    pub max_retry: u32,
    /// Execution timeout per attempt.
    pub timeout: Duration,
    /// At most one live job per key.
    pub unique_key: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            queue: Tier::Default,
            max_retry: 2,
            timeout: Duration::from_secs(300),
            unique_key: None,
        }
    }
}

/// Job counts for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Waiting to run, including scheduled retries.
    pub pending: i64,
    /// Claimed by a worker.
    pub active: i64,
    /// Dead.
    pub archived: i64,
}

/// Handle for putting work on the durable queue.
#[derive(Clone)]
pub struct JobQueue {
    persistence: Arc<dyn Persistence>,
    cipher: SecretCipher,
    notify: Arc<Notify>,
}

impl JobQueue {
    /// Create a queue over `persistence`.
    pub fn new(persistence: Arc<dyn Persistence>, cipher: SecretCipher) -> Self {
        Self {
            persistence,
            cipher,
            notify: Arc::new(Notify::new()),
        }
    }

    /// The persistence layer jobs are stored in.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Seal `payload` and store it as a pending job. Returns the job id.
    ///
    /// Fails with `JobAlreadyExists` while a live job holds the same
    /// `unique_key`.
    pub async fn enqueue(&self, kind: &str, payload: &[u8], options: JobOptions) -> Result<String> {
        let job = self
            .persistence
            .enqueue_job(&NewJob {
                job_id: uuid::Uuid::new_v4().to_string(),
                kind: kind.to_string(),
                queue: options.queue.as_str().to_string(),
                unique_key: options.unique_key,
                payload: self.cipher.seal(payload)?,
                max_retry: i32::try_from(options.max_retry).unwrap_or(i32::MAX),
                timeout_secs: i64::try_from(options.timeout.as_secs()).unwrap_or(i64::MAX),
                run_at: Utc::now(),
            })
            .await?;

        // Wake an idle in-process worker; remote workers pick it up on their next poll.
        self.notify.notify_one();

        info!(
            job_id = %job.job_id,
            kind = %kind,
            queue = %job.queue,
            max_retry = job.max_retry,
            "Job enqueued"
        );
        Ok(job.job_id)
    }

    /// Serialize `payload` as JSON and enqueue it.
    pub async fn enqueue_json<T: Serialize>(
        &self,
        kind: &str,
        payload: &T,
        options: JobOptions,
    ) -> Result<String> {
        let bytes = Zeroizing::new(serde_json::to_vec(payload)?);
        self.enqueue(kind, &bytes, options).await
    }

    /// Decrypt a claimed job's payload.
    pub fn open_payload(&self, job: &JobRecord) -> std::result::Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.cipher.open(&job.payload)
    }

    /// Job counts for `tier`.
    pub async fn stats(&self, tier: Tier) -> Result<TierStats> {
        let queue = Some(tier.as_str());
        Ok(TierStats {
            pending: self.persistence.count_jobs(queue, JobState::Pending).await?,
            active: self.persistence.count_jobs(queue, JobState::Active).await?,
            archived: self.persistence.count_jobs(queue, JobState::Archived).await?,
        })
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }
}
