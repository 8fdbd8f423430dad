// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end test of the embeddable runtime: create a gateway through the
//! runtime and let the background workers deploy it.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ENCRYPTION_KEY, REGION, USER_ID, create_request, fast_worker_config};
use gantry_core::persistence::SqlitePersistence;
use gantry_core::{GatewayStatus, Persistence};
use gantry_pipeline::config::{CatalogCredentials, Config};
use gantry_pipeline::error::ErrorClass;
use gantry_pipeline::provider::{ComputeProvider, MockProvider};
use gantry_pipeline::runtime::PipelineRuntime;

fn test_config(database_url: &str) -> Config {
    let mut config = Config::new(database_url, ENCRYPTION_KEY.to_vec());
    config.secret_hash_cost = 4;
    config.command_poll_interval = Duration::from_millis(10);
    config.readiness_timeout = Duration::from_secs(5);
    config.command_timeout = Duration::from_secs(5);
    config.catalog_credentials = Some(CatalogCredentials {
        access_key_id: "AKIACATALOG".to_string(),
        secret_access_key: "catalog-secret".to_string().into(),
    });
    config
}

#[tokio::test]
async fn test_runtime_deploys_gateway() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db_path = temp_dir.path().join("gantry.db");
    let persistence: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::from_path(&db_path).await.unwrap());
    let provider = Arc::new(MockProvider::new());
    let compute: Arc<dyn ComputeProvider> = provider.clone();

    let runtime = PipelineRuntime::builder()
        .config(test_config(&format!("sqlite:{}", db_path.display())))
        .persistence(persistence)
        .provider(compute)
        .worker_config(fast_worker_config())
        .readiness_intervals(Duration::from_millis(10), Duration::from_millis(50))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.is_running());
    assert_eq!(runtime.catalog().count().await.unwrap(), 3);

    let credential = runtime
        .credentials()
        .register(USER_ID, "AKIATESTEXAMPLE", "wJalrXUtnFEMI/K7MDENG", REGION)
        .await
        .unwrap();
    let view = runtime
        .gateways()
        .create_gateway(create_request(&credential.credential_id, "Edge One"))
        .await
        .unwrap();
    assert_eq!(view.status, GatewayStatus::Initializing);

    let status = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = runtime
                .gateways()
                .gateway_status(&view.gateway_id)
                .await
                .unwrap();
            if status.status.is_terminal() {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(status.status, GatewayStatus::Running);
    assert_eq!(provider.sent_commands().await.len(), 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_build_requires_components() {
    let err = PipelineRuntime::builder()
        .provider(Arc::new(MockProvider::new()))
        .build()
        .err()
        .unwrap();
    assert!(err.to_string().contains("config is required"));
}

#[tokio::test]
async fn test_build_rejects_bad_key() {
    let persistence: Arc<dyn Persistence> = Arc::new(
        SqlitePersistence::from_url("sqlite::memory:", 1)
            .await
            .unwrap(),
    );
    let result = PipelineRuntime::builder()
        .config(Config::new("sqlite::memory:", b"short".to_vec()))
        .persistence(persistence)
        .provider(Arc::new(MockProvider::new()))
        .build();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_build_rejects_short_job_timeout() {
    let persistence: Arc<dyn Persistence> = Arc::new(
        SqlitePersistence::from_url("sqlite::memory:", 1)
            .await
            .unwrap(),
    );
    let mut config = test_config("sqlite::memory:");
    config.job_timeout = Duration::from_secs(8);

    let err = PipelineRuntime::builder()
        .config(config)
        .persistence(persistence)
        .provider(Arc::new(MockProvider::new()))
        .build()
        .err()
        .unwrap();
    assert!(err.to_string().contains("GANTRY_JOB_TIMEOUT_SECS"));
}

#[tokio::test]
async fn test_runtime_without_catalog_keys_rejects_creation() {
    let persistence: Arc<dyn Persistence> = Arc::new(
        SqlitePersistence::from_url("sqlite::memory:", 1)
            .await
            .unwrap(),
    );
    let mut config = test_config("sqlite::memory:");
    config.catalog_credentials = None;

    let runtime = PipelineRuntime::builder()
        .config(config)
        .persistence(persistence)
        .provider(Arc::new(MockProvider::new()))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert_eq!(runtime.catalog().count().await.unwrap(), 0);

    let credential = runtime
        .credentials()
        .register(USER_ID, "AKIATESTEXAMPLE", "wJalrXUtnFEMI/K7MDENG", REGION)
        .await
        .unwrap();
    let err = runtime
        .gateways()
        .create_gateway(create_request(&credential.credential_id, "Edge One"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);

    runtime.shutdown().await.unwrap();
}
