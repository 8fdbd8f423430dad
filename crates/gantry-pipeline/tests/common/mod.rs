// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for gantry-pipeline integration tests.
//!
//! Provides TestContext wiring a file-backed SQLite database, the mock
//! provider and every pipeline component with short intervals.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gantry_core::Persistence;
use gantry_core::persistence::SqlitePersistence;

use gantry_pipeline::catalog::InstanceCatalog;
use gantry_pipeline::command::CommandExecutor;
use gantry_pipeline::credentials::{CredentialResolver, DecryptedCredential};
use gantry_pipeline::crypto::SecretCipher;
use gantry_pipeline::deploy::{BootstrapTemplate, DeployHandler, DeploySettings};
use gantry_pipeline::gateway::{CreateGatewayRequest, GatewayService, GatewaySettings};
use gantry_pipeline::provider::{ComputeProvider, MockProvider};
use gantry_pipeline::provisioner::Provisioner;
use gantry_pipeline::queue::{JobHandler, JobQueue, WorkerPool, WorkerPoolConfig};
use gantry_pipeline::readiness::ReadinessWaiter;

pub const ENCRYPTION_KEY: &[u8; 32] = b"0123456789abcdef0123456789abcdef";
pub const USER_ID: &str = "user-1";
pub const REGION: &str = "us-east-1";

/// Deploy settings sized for tests.
pub fn fast_deploy_settings() -> DeploySettings {
    DeploySettings {
        readiness_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(5),
        bootstrap: BootstrapTemplate::default(),
    }
}

/// Worker settings sized for tests: retries run immediately.
pub fn fast_worker_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        concurrency: 2,
        poll_interval: Duration::from_millis(20),
        max_job_timeout: Duration::from_secs(10),
        lease_grace: Duration::from_secs(1),
        retry_delay: |_| Duration::ZERO,
    }
}

/// Gateway settings with the cheapest bcrypt cost.
pub fn fast_gateway_settings() -> GatewaySettings {
    GatewaySettings {
        secret_hash_cost: 4,
        ..GatewaySettings::default()
    }
}

/// Test context holding every pipeline component.
pub struct TestContext {
    pub persistence: Arc<dyn Persistence>,
    pub provider: Arc<MockProvider>,
    pub resolver: CredentialResolver,
    pub catalog: InstanceCatalog,
    pub queue: JobQueue,
    pub gateways: GatewayService,
    pub deploy: Arc<DeployHandler>,
    pub workers: WorkerPool,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create a context around `provider` with default test settings.
    pub async fn new(provider: MockProvider) -> Result<Self, String> {
        Self::with_deploy_settings(provider, fast_deploy_settings()).await
    }

    /// Create a context with custom deploy settings.
    pub async fn with_deploy_settings(
        provider: MockProvider,
        deploy_settings: DeploySettings,
    ) -> Result<Self, String> {
        let temp_dir =
            tempfile::TempDir::new().map_err(|e| format!("Failed to create temp dir: {}", e))?;
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::from_path(temp_dir.path().join("gantry.db"))
                .await
                .map_err(|e| format!("Failed to open database: {}", e))?,
        );

        let provider = Arc::new(provider);
        let compute: Arc<dyn ComputeProvider> = provider.clone();
        let cipher = SecretCipher::new(ENCRYPTION_KEY)
            .map_err(|e| format!("Failed to create cipher: {}", e))?;

        let resolver = CredentialResolver::new(persistence.clone(), compute.clone(), cipher.clone());
        let queue = JobQueue::new(persistence.clone(), cipher);

        // Seed the catalog from the mock's class listing.
        let catalog = InstanceCatalog::new(persistence.clone(), compute.clone());
        catalog
            .sync(
                &DecryptedCredential::new("catalog", "system", "AKIACATALOG", "secret"),
                REGION,
                "x86_64",
            )
            .await
            .map_err(|e| format!("Failed to seed catalog: {}", e))?;

        let deploy = Arc::new(DeployHandler::new(
            persistence.clone(),
            resolver.clone(),
            ReadinessWaiter::new(compute.clone())
                .with_intervals(Duration::from_millis(10), Duration::from_millis(50)),
            CommandExecutor::new(compute.clone(), Duration::from_millis(10)),
            deploy_settings,
        ));

        let gateways = GatewayService::new(
            persistence.clone(),
            resolver.clone(),
            catalog.clone(),
            Provisioner::new(compute),
            queue.clone(),
            fast_gateway_settings(),
        );

        let handler: Arc<dyn JobHandler> = deploy.clone();
        let workers = WorkerPool::new(queue.clone(), fast_worker_config(), [handler]);

        Ok(Self {
            persistence,
            provider,
            resolver,
            catalog,
            queue,
            gateways,
            deploy,
            workers,
            _temp_dir: temp_dir,
        })
    }

    /// Register a credential for [`USER_ID`] and return its id.
    pub async fn register_credential(&self) -> String {
        self.resolver
            .register(USER_ID, "AKIATESTEXAMPLE", "wJalrXUtnFEMI/K7MDENG", REGION)
            .await
            .expect("Failed to register credential")
            .credential_id
    }
}

/// A valid creation request.
pub fn create_request(credential_id: &str, name: &str) -> CreateGatewayRequest {
    CreateGatewayRequest {
        user_id: USER_ID.to_string(),
        credential_id: credential_id.to_string(),
        provider: "aws".to_string(),
        region: REGION.to_string(),
        name: name.to_string(),
        gateway_type: "transcoding".to_string(),
        rpc_url: "https://rpc.example.org".to_string(),
        secret: "correct horse battery".to_string(),
        profile: "1080p".to_string(),
        instance_class: None,
    }
}
