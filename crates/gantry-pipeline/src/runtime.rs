// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for gantry-pipeline.
//!
//! [`PipelineRuntime`] wires the pipeline components together and runs the
//! background tasks, so the pipeline can live inside an existing tokio
//! application (typically next to the HTTP front door that calls
//! [`GatewayService`]).
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gantry_core::persistence::PostgresPersistence;
//! use gantry_pipeline::config::Config;
//! use gantry_pipeline::provider::HttpComputeProvider;
//! use gantry_pipeline::runtime::PipelineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let persistence = Arc::new(PostgresPersistence::connect(&config.database_url, 10).await?);
//!     let provider = Arc::new(HttpComputeProvider::new("https://provider.internal")?);
//!
//!     let runtime = PipelineRuntime::builder()
//!         .config(config)
//!         .persistence(persistence)
//!         .provider(provider)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let view = runtime.gateways().gateway_status("...").await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gantry_core::Persistence;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::InstanceCatalog;
use crate::catalog_sync_worker::{CatalogSyncWorker, CatalogSyncWorkerConfig};
use crate::command::CommandExecutor;
use crate::config::Config;
use crate::credentials::{CredentialResolver, DecryptedCredential};
use crate::crypto::SecretCipher;
use crate::deploy::{DeployHandler, DeploySettings};
use crate::gateway::{GatewayService, GatewaySettings};
use crate::job_cleanup_worker::{JobCleanupWorker, JobCleanupWorkerConfig};
use crate::provider::ComputeProvider;
use crate::provisioner::Provisioner;
use crate::queue::{JobHandler, JobQueue, WorkerPool, WorkerPoolConfig};
use crate::readiness::ReadinessWaiter;

/// Builder for creating a [`PipelineRuntime`].
#[derive(Default)]
pub struct PipelineRuntimeBuilder {
    config: Option<Config>,
    persistence: Option<Arc<dyn Persistence>>,
    provider: Option<Arc<dyn ComputeProvider>>,
    worker_config: Option<WorkerPoolConfig>,
    cleanup_config: Option<JobCleanupWorkerConfig>,
    catalog_config: Option<CatalogSyncWorkerConfig>,
    readiness_intervals: Option<(Duration, Duration)>,
}

impl PipelineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pipeline configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the compute provider (required).
    pub fn provider(mut self, provider: Arc<dyn ComputeProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Override the worker pool settings.
    ///
    /// Default: derived from the config via [`WorkerPoolConfig::from_config`].
    pub fn worker_config(mut self, config: WorkerPoolConfig) -> Self {
        self.worker_config = Some(config);
        self
    }

    /// Override the job cleanup worker settings.
    ///
    /// Default: hourly, keeping archived jobs for the configured retention.
    pub fn cleanup_config(mut self, config: JobCleanupWorkerConfig) -> Self {
        self.cleanup_config = Some(config);
        self
    }

    /// Override the catalog sync worker settings.
    ///
    /// Default: daily, reading the configured catalog region.
    pub fn catalog_config(mut self, config: CatalogSyncWorkerConfig) -> Self {
        self.catalog_config = Some(config);
        self
    }

    /// Override the readiness poll interval bounds.
    ///
    /// Default: 2 seconds, backing off to 15 seconds.
    pub fn readiness_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.readiness_intervals = Some((initial, max));
        self
    }

    /// Assemble the components.
    ///
    /// Fails if a required field is missing, the settings contradict each
    /// other or the encryption key is unusable.
    pub fn build(self) -> Result<PipelineRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        config.validate()?;
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let provider = self
            .provider
            .ok_or_else(|| anyhow::anyhow!("provider is required"))?;

        let cipher = SecretCipher::new(&config.encryption_key)?;
        let resolver = CredentialResolver::new(persistence.clone(), provider.clone(), cipher.clone());
        let queue = JobQueue::new(persistence.clone(), cipher);
        let catalog = InstanceCatalog::new(persistence.clone(), provider.clone());

        let mut readiness = ReadinessWaiter::new(provider.clone());
        if let Some((initial, max)) = self.readiness_intervals {
            readiness = readiness.with_intervals(initial, max);
        }
        let executor = CommandExecutor::new(provider.clone(), config.command_poll_interval);

        let deploy: Arc<dyn JobHandler> = Arc::new(DeployHandler::new(
            persistence.clone(),
            resolver.clone(),
            readiness,
            executor,
            DeploySettings::from_config(&config),
        ));

        let gateways = GatewayService::new(
            persistence.clone(),
            resolver.clone(),
            catalog.clone(),
            Provisioner::new(provider.clone()),
            queue.clone(),
            GatewaySettings::from_config(&config),
        );

        let workers = WorkerPool::new(
            queue.clone(),
            self.worker_config
                .unwrap_or_else(|| WorkerPoolConfig::from_config(&config)),
            [deploy],
        );

        let cleanup_worker = JobCleanupWorker::new(
            persistence,
            self.cleanup_config
                .unwrap_or_else(|| JobCleanupWorkerConfig::from_config(&config)),
        );

        let catalog_credential = config.catalog_credentials.as_ref().map(|keys| {
            DecryptedCredential::new(
                "catalog",
                "system",
                keys.access_key_id.clone(),
                keys.secret_access_key.as_str(),
            )
        });
        let catalog_worker = CatalogSyncWorker::new(
            catalog.clone(),
            catalog_credential,
            self.catalog_config
                .unwrap_or_else(|| CatalogSyncWorkerConfig::from_config(&config)),
        );

        Ok(PipelineRuntimeConfig {
            gateways,
            credentials: resolver,
            catalog,
            queue,
            workers,
            cleanup_worker,
            catalog_worker,
            provider_type: provider.provider_type(),
        })
    }
}

/// Assembled components, ready to [`start`](Self::start).
pub struct PipelineRuntimeConfig {
    gateways: GatewayService,
    credentials: CredentialResolver,
    catalog: InstanceCatalog,
    queue: JobQueue,
    workers: WorkerPool,
    cleanup_worker: JobCleanupWorker,
    catalog_worker: CatalogSyncWorker,
    provider_type: &'static str,
}

impl PipelineRuntimeConfig {
    /// Refresh the instance catalog, then spawn the worker pool and the
    /// background workers.
    ///
    /// A failed initial refresh is logged; gateways can still be created
    /// with classes stored by an earlier run.
    pub async fn start(self) -> Result<PipelineRuntime> {
        self.queue.persistence().health_check_db().await?;

        if let Err(e) = self.catalog_worker.sync_once().await {
            error!(error = %e, "Initial instance catalog sync failed");
        }
        if self.catalog.count().await? == 0 {
            warn!("Instance catalog is empty, gateway creation will be rejected");
        }

        let worker_shutdown = self.workers.shutdown_handle();
        let workers = self.workers.clone();
        let worker_handle = tokio::spawn(workers.run());

        let cleanup_shutdown = self.cleanup_worker.shutdown_handle();
        let cleanup_worker = self.cleanup_worker;
        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        let catalog_shutdown = self.catalog_worker.shutdown_handle();
        let catalog_worker = self.catalog_worker;
        let catalog_handle = tokio::spawn(async move {
            catalog_worker.run().await;
        });

        info!(provider = self.provider_type, "PipelineRuntime started");

        Ok(PipelineRuntime {
            gateways: self.gateways,
            credentials: self.credentials,
            catalog: self.catalog,
            queue: self.queue,
            workers: self.workers,
            worker_handle,
            cleanup_handle,
            catalog_handle,
            worker_shutdown,
            cleanup_shutdown,
            catalog_shutdown,
        })
    }
}

/// A running pipeline that can be embedded in an application.
///
/// The runtime manages:
/// - The worker pool executing deployment jobs
/// - The job cleanup worker pruning the archive
/// - The catalog sync worker refreshing instance classes
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct PipelineRuntime {
    gateways: GatewayService,
    credentials: CredentialResolver,
    catalog: InstanceCatalog,
    queue: JobQueue,
    workers: WorkerPool,
    worker_handle: JoinHandle<()>,
    cleanup_handle: JoinHandle<()>,
    catalog_handle: JoinHandle<()>,
    worker_shutdown: CancellationToken,
    cleanup_shutdown: Arc<Notify>,
    catalog_shutdown: Arc<Notify>,
}

impl PipelineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> PipelineRuntimeBuilder {
        PipelineRuntimeBuilder::new()
    }

    /// Gateway creation and status.
    pub fn gateways(&self) -> &GatewayService {
        &self.gateways
    }

    /// Credential registration and resolution.
    pub fn credentials(&self) -> &CredentialResolver {
        &self.credentials
    }

    /// The instance class catalog.
    pub fn catalog(&self) -> &InstanceCatalog {
        &self.catalog
    }

    /// The durable job queue.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.workers.in_flight()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops claiming new jobs, cancels in-flight ones (they go back to the
    /// queue) and waits for the background tasks.
    pub async fn shutdown(self) -> Result<()> {
        info!("PipelineRuntime shutting down...");

        self.worker_shutdown.cancel();
        self.cleanup_shutdown.notify_one();
        self.catalog_shutdown.notify_one();

        if let Err(e) = self.worker_handle.await {
            error!("Worker pool task panicked: {}", e);
        }

        if let Err(e) = self.cleanup_handle.await {
            error!("Job cleanup worker task panicked: {}", e);
        }

        if let Err(e) = self.catalog_handle.await {
            error!("Catalog sync worker task panicked: {}", e);
        }

        info!("PipelineRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished() && !self.cleanup_handle.is_finished()
    }
}
