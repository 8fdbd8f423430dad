// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for pruning the job archive.
//!
//! Archived jobs are kept for inspection, then deleted once they are older
//! than the retention window. Their payloads are sealed, but there is no
//! reason to keep them forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gantry_core::Persistence;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{Error, Result};

/// Configuration for the job cleanup worker.
#[derive(Debug, Clone)]
pub struct JobCleanupWorkerConfig {
    /// Whether cleanup runs at all.
    pub enabled: bool,
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// How long archived jobs are kept.
    pub retention: Duration,
}

impl Default for JobCleanupWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl JobCleanupWorkerConfig {
    /// Use the configured retention window.
    pub fn from_config(config: &Config) -> Self {
        Self {
            retention: config.job_retention,
            ..Self::default()
        }
    }
}

/// Background worker that deletes old archived jobs.
pub struct JobCleanupWorker {
    persistence: Arc<dyn Persistence>,
    config: JobCleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl JobCleanupWorker {
    /// Create a new cleanup worker.
    pub fn new(persistence: Arc<dyn Persistence>, config: JobCleanupWorkerConfig) -> Self {
        Self {
            persistence,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until the shutdown signal arrives.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Job cleanup worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_hours = self.config.retention.as_secs() / 3600,
            "Job cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.cleanup_archived_jobs().await {
                        error!(error = %e, "Failed to clean up archived jobs");
                    }
                }
            }
        }

        info!("Job cleanup worker stopped");
    }

    /// Delete archived jobs older than the retention window. Returns how many
    /// were removed.
    pub async fn cleanup_archived_jobs(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;

        let deleted = self
            .persistence
            .delete_archived_jobs_older_than(cutoff)
            .await?;

        if deleted > 0 {
            info!(deleted = deleted, cutoff = %cutoff, "Job cleanup cycle completed");
        } else {
            debug!("Job cleanup cycle completed, nothing to delete");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::models::{JobState, NewJob};
    use gantry_core::persistence::SqlitePersistence;

    async fn persistence() -> Arc<dyn Persistence> {
        Arc::new(
            SqlitePersistence::from_url("sqlite::memory:", 1)
                .await
                .unwrap(),
        )
    }

    async fn archived_job(persistence: &Arc<dyn Persistence>) -> String {
        let job = persistence
            .enqueue_job(&NewJob {
                job_id: uuid::Uuid::new_v4().to_string(),
                kind: "gateway:deploy".to_string(),
                queue: "default".to_string(),
                unique_key: None,
                payload: vec![1, 2, 3],
                max_retry: 0,
                timeout_secs: 60,
                run_at: Utc::now(),
            })
            .await
            .unwrap();
        persistence.archive_job(&job.job_id, "boom").await.unwrap();
        job.job_id
    }

    #[test]
    fn test_default_config() {
        let config = JobCleanupWorkerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.poll_interval, Duration::from_secs(3600));
        assert_eq!(config.retention, Duration::from_secs(7 * 24 * 3600));
    }

    #[tokio::test]
    async fn test_recent_archive_is_kept() {
        let persistence = persistence().await;
        archived_job(&persistence).await;

        let worker = JobCleanupWorker::new(persistence.clone(), JobCleanupWorkerConfig::default());
        assert_eq!(worker.cleanup_archived_jobs().await.unwrap(), 0);
        assert_eq!(
            persistence.count_jobs(None, JobState::Archived).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_zero_retention_deletes_archive_only() {
        let persistence = persistence().await;
        let archived = archived_job(&persistence).await;
        persistence
            .enqueue_job(&NewJob {
                job_id: "live".to_string(),
                kind: "gateway:deploy".to_string(),
                queue: "default".to_string(),
                unique_key: None,
                payload: vec![],
                max_retry: 0,
                timeout_secs: 60,
                run_at: Utc::now(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let worker = JobCleanupWorker::new(
            persistence.clone(),
            JobCleanupWorkerConfig {
                retention: Duration::ZERO,
                ..JobCleanupWorkerConfig::default()
            },
        );
        assert_eq!(worker.cleanup_archived_jobs().await.unwrap(), 1);
        assert!(persistence.get_job(&archived).await.unwrap().is_none());
        assert!(persistence.get_job("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let worker = Arc::new(JobCleanupWorker::new(
            persistence().await,
            JobCleanupWorkerConfig::default(),
        ));
        let shutdown = worker.shutdown_handle();

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
