// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for refreshing the instance catalog.
//!
//! Reads the provider's class listing with the system credential on a fixed
//! interval. A failed refresh is retried sooner than the regular interval;
//! the stored catalog stays usable in the meantime.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::catalog::InstanceCatalog;
use crate::config::Config;
use crate::credentials::DecryptedCredential;
use crate::error::Result;

/// Configuration for the catalog sync worker.
#[derive(Debug, Clone)]
pub struct CatalogSyncWorkerConfig {
    /// Whether the worker runs at all.
    pub enabled: bool,
    /// How often to refresh after a successful sync.
    pub poll_interval: Duration,
    /// How soon to try again after a failed sync.
    pub retry_interval: Duration,
    /// Region whose listing is read.
    pub region: String,
    /// CPU architecture gateways run on.
    pub architecture: String,
}

impl Default for CatalogSyncWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(24 * 3600),
            retry_interval: Duration::from_secs(300),
            region: crate::config::DEFAULT_CATALOG_REGION.to_string(),
            architecture: "x86_64".to_string(),
        }
    }
}

impl CatalogSyncWorkerConfig {
    /// Use the configured region and interval.
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.catalog_sync_interval,
            region: config.catalog_region.clone(),
            ..Self::default()
        }
    }
}

/// Background worker that keeps the instance catalog current.
pub struct CatalogSyncWorker {
    catalog: InstanceCatalog,
    credential: Option<DecryptedCredential>,
    config: CatalogSyncWorkerConfig,
    shutdown: Arc<Notify>,
}

impl CatalogSyncWorker {
    /// Create a new sync worker. Without a credential the worker idles.
    pub fn new(
        catalog: InstanceCatalog,
        credential: Option<DecryptedCredential>,
        config: CatalogSyncWorkerConfig,
    ) -> Self {
        Self {
            catalog,
            credential,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sync loop until the shutdown signal arrives.
    pub async fn run(&self) {
        if !self.config.enabled || self.credential.is_none() {
            info!("Catalog sync worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            region = %self.config.region,
            "Catalog sync worker started"
        );

        let mut wait = self.config.poll_interval;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Catalog sync worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(wait) => {
                    wait = match self.sync_once().await {
                        Ok(_) => self.config.poll_interval,
                        Err(e) => {
                            error!(error = %e, "Failed to sync instance catalog");
                            self.config.retry_interval
                        }
                    };
                }
            }
        }

        info!("Catalog sync worker stopped");
    }

    /// Refresh the catalog once. Returns how many classes were written.
    pub async fn sync_once(&self) -> Result<u64> {
        let Some(credential) = &self.credential else {
            warn!("No catalog credential configured, skipping sync");
            return Ok(0);
        };
        self.catalog
            .sync(credential, &self.config.region, &self.config.architecture)
            .await
    }
}
