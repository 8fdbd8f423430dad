// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gantry Pipeline - Deployment Worker
//!
//! Runs the worker pool that deploys queued gateways, the job cleanup
//! worker and the instance catalog refresh. Gateways are created by the front door through the library API;
//! this process only drains the queue.

use std::sync::Arc;

use anyhow::Context;
use gantry_core::Persistence;
use gantry_core::persistence::{PostgresPersistence, SqlitePersistence};
use tracing::{info, warn};

use gantry_pipeline::config::Config;
use gantry_pipeline::provider::{ComputeProvider, HttpComputeProvider};
use gantry_pipeline::runtime::PipelineRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_pipeline=info,gantry_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        worker_concurrency = config.worker_concurrency,
        job_max_retry = config.job_max_retry,
        job_timeout_secs = config.job_timeout.as_secs(),
        catalog_sync = config.catalog_credentials.is_some(),
        "Starting Gantry Pipeline"
    );

    let persistence: Arc<dyn Persistence> = if config.database_url.starts_with("sqlite:") {
        Arc::new(SqlitePersistence::from_url(&config.database_url, 5).await?)
    } else {
        Arc::new(PostgresPersistence::connect(&config.database_url, 10).await?)
    };

    info!("Connected to database");

    let endpoint = config
        .provider_endpoint
        .as_deref()
        .context("GANTRY_PROVIDER_ENDPOINT is required")?;
    let provider: Arc<dyn ComputeProvider> = Arc::new(HttpComputeProvider::new(endpoint)?);
    info!(provider_type = provider.provider_type(), "Provider initialized");

    let runtime = PipelineRuntime::builder()
        .config(config)
        .persistence(persistence)
        .provider(provider)
        .build()?
        .start()
        .await?;

    info!("Gantry Pipeline ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Gantry Pipeline shut down");

    Ok(())
}
