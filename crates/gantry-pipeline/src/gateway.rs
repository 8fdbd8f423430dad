// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gateway service: the creation flow and the status surface.
//!
//! Creation is synchronous up to the queue: validate, check the instance
//! class against the catalog, resolve credentials, claim the canonical name,
//! allocate an instance and enqueue the deployment. Nothing is written until
//! the request, its class and its credential all check out. Any failure
//! after the record exists marks the gateway `failed` before the error is
//! returned, so a failed request never leaves an `initializing` gateway
//! behind.

use std::sync::Arc;
use std::time::Duration;

use gantry_core::models::{GatewayRecord, NewGateway};
use gantry_core::slug::slugify;
use gantry_core::{CoreError, GatewayStatus, Persistence, Transition};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::catalog::InstanceCatalog;
use crate::config::{Config, DEFAULT_INSTANCE_CLASS};
use crate::credentials::{CredentialResolver, DecryptedCredential};
use crate::deploy::{DEPLOY_JOB_KIND, DeploymentJob};
use crate::error::{Error, Result};
use crate::provisioner::{Provisioner, idempotency_token};
use crate::queue::{JobOptions, JobQueue, Tier};

/// Providers gateways can be created on.
pub const SUPPORTED_PROVIDERS: &[&str] = &["aws"];

/// Accepted gateway types.
pub const GATEWAY_TYPES: &[&str] = &["ai", "transcoding"];

/// Accepted output profiles.
pub const PROFILES: &[&str] = &["480p", "720p", "1080p"];

const MIN_SECRET_LEN: usize = 8;
const MIN_NAME_LEN: usize = 3;

/// A request to stand up a gateway.
#[derive(Clone, Deserialize)]
pub struct CreateGatewayRequest {
    /// Requesting user.
    pub user_id: String,
    /// Credential owned by the user.
    pub credential_id: String,
    /// Provider name.
    pub provider: String,
    /// Provider region.
    pub region: String,
    /// Display name; stored as its slug.
    pub name: String,
    /// `ai` or `transcoding`.
    pub gateway_type: String,
    /// Connection URL.
    pub rpc_url: String,
    /// Cleartext secret. Hashed for storage, passed to bootstrap.
    pub secret: String,
    /// `480p`, `720p` or `1080p`.
    pub profile: String,
    /// Instance class; the configured default when absent.
    #[serde(default)]
    pub instance_class: Option<String>,
}

impl std::fmt::Debug for CreateGatewayRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateGatewayRequest")
            .field("user_id", &self.user_id)
            .field("credential_id", &self.credential_id)
            .field("provider", &self.provider)
            .field("region", &self.region)
            .field("name", &self.name)
            .field("gateway_type", &self.gateway_type)
            .field("rpc_url", &self.rpc_url)
            .field("secret", &"<redacted>")
            .field("profile", &self.profile)
            .field("instance_class", &self.instance_class)
            .finish()
    }
}

impl CreateGatewayRequest {
    /// Check field rules before anything is written.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(Error::invalid("user_id", "must not be empty"));
        }
        if self.credential_id.trim().is_empty() {
            return Err(Error::invalid("credential_id", "must not be empty"));
        }
        if !SUPPORTED_PROVIDERS.contains(&self.provider.as_str()) {
            return Err(Error::invalid(
                "provider",
                format!("must be one of {}", SUPPORTED_PROVIDERS.join(", ")),
            ));
        }
        if self.region.trim().is_empty() {
            return Err(Error::invalid("region", "must not be empty"));
        }
        if self.name.trim().chars().count() < MIN_NAME_LEN {
            return Err(Error::invalid(
                "name",
                format!("must be at least {} characters", MIN_NAME_LEN),
            ));
        }
        if slugify(&self.name).is_empty() {
            return Err(Error::invalid("name", "must contain letters or digits"));
        }
        if !GATEWAY_TYPES.contains(&self.gateway_type.as_str()) {
            return Err(Error::invalid(
                "gateway_type",
                format!("must be one of {}", GATEWAY_TYPES.join(", ")),
            ));
        }
        let rpc_url = url::Url::parse(&self.rpc_url)
            .map_err(|e| Error::invalid("rpc_url", format!("not a valid URL: {}", e)))?;
        if !rpc_url.has_host() {
            return Err(Error::invalid("rpc_url", "must include a host"));
        }
        if self.secret.chars().count() < MIN_SECRET_LEN {
            return Err(Error::invalid(
                "secret",
                format!("must be at least {} characters", MIN_SECRET_LEN),
            ));
        }
        if !PROFILES.contains(&self.profile.as_str()) {
            return Err(Error::invalid(
                "profile",
                format!("must be one of {}", PROFILES.join(", ")),
            ));
        }
        if let Some(class) = &self.instance_class
            && class.trim().is_empty()
        {
            return Err(Error::invalid("instance_class", "must not be empty"));
        }
        Ok(())
    }
}

/// Externally visible gateway state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayStatusView {
    /// Gateway id.
    pub gateway_id: String,
    /// Canonical name.
    pub name: String,
    /// Lifecycle status.
    pub status: GatewayStatus,
    /// Diagnostic when `failed`.
    pub error_status: Option<String>,
    /// Provider instance, once allocated.
    pub instance_id: Option<String>,
    /// Deployment job, once enqueued.
    pub job_id: Option<String>,
}

impl GatewayStatusView {
    fn from_record(record: GatewayRecord) -> Result<Self> {
        Ok(Self {
            status: record.lifecycle()?,
            gateway_id: record.gateway_id,
            name: record.name,
            error_status: record.error_status,
            instance_id: record.instance_id,
            job_id: record.job_id,
        })
    }
}

/// Settings for the creation flow.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// bcrypt cost for the stored secret hash.
    pub secret_hash_cost: u32,
    /// Instance class when the request names none.
    pub default_instance_class: String,
    /// Retries for the deployment job.
    pub job_max_retry: u32,
    /// Per-attempt deployment timeout.
    pub job_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            secret_hash_cost: bcrypt::DEFAULT_COST,
            default_instance_class: DEFAULT_INSTANCE_CLASS.to_string(),
            job_max_retry: 2,
            job_timeout: Duration::from_secs(600),
        }
    }
}

impl GatewaySettings {
    /// Take settings from the pipeline config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            secret_hash_cost: config.secret_hash_cost,
            default_instance_class: config.default_instance_class.clone(),
            job_max_retry: config.job_max_retry,
            job_timeout: config.job_timeout,
        }
    }
}

/// Entry point for the front door.
#[derive(Clone)]
pub struct GatewayService {
    persistence: Arc<dyn Persistence>,
    resolver: CredentialResolver,
    catalog: InstanceCatalog,
    provisioner: Provisioner,
    queue: JobQueue,
    settings: GatewaySettings,
}

impl GatewayService {
    /// Create the service.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        resolver: CredentialResolver,
        catalog: InstanceCatalog,
        provisioner: Provisioner,
        queue: JobQueue,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            persistence,
            resolver,
            catalog,
            provisioner,
            queue,
            settings,
        }
    }

    /// Create a gateway and queue its deployment.
    ///
    /// Returns the gateway in `initializing` with its job id, or fails
    /// without leaving an `initializing` record behind.
    pub async fn create_gateway(&self, request: CreateGatewayRequest) -> Result<GatewayStatusView> {
        request.validate()?;

        let instance_class = request
            .instance_class
            .clone()
            .unwrap_or_else(|| self.settings.default_instance_class.clone());
        self.catalog.require(&instance_class).await?;

        // An unknown or foreign credential is the caller's mistake; report it
        // before a gateway record exists.
        let credential = self
            .resolver
            .resolve(&request.credential_id, &request.user_id)
            .await?;

        let name = slugify(&request.name);
        if self.persistence.get_gateway_by_name(&name).await?.is_some() {
            return Err(CoreError::GatewayAlreadyExists { name }.into());
        }

        let secret_hash = self.hash_secret(&request.secret).await?;

        let record = self
            .persistence
            .insert_gateway(&NewGateway {
                gateway_id: uuid::Uuid::new_v4().to_string(),
                user_id: request.user_id.clone(),
                credential_id: request.credential_id.clone(),
                provider: request.provider.clone(),
                region: request.region.clone(),
                name,
                gateway_type: request.gateway_type.clone(),
                rpc_url: request.rpc_url.clone(),
                secret_hash,
                profile: request.profile.clone(),
                instance_class,
            })
            .await?;

        info!(
            gateway_id = %record.gateway_id,
            name = %record.name,
            user_id = %record.user_id,
            region = %record.region,
            "Gateway created"
        );

        match self.allocate(&record, &request, &credential).await {
            Ok((instance_id, job_id)) => Ok(GatewayStatusView {
                gateway_id: record.gateway_id,
                name: record.name,
                status: GatewayStatus::Initializing,
                error_status: None,
                instance_id: Some(instance_id),
                job_id: Some(job_id),
            }),
            Err(e) => {
                self.fail_creation(&record.gateway_id, &e).await;
                Err(e)
            }
        }
    }

    /// Current state of a gateway.
    pub async fn gateway_status(&self, gateway_id: &str) -> Result<GatewayStatusView> {
        let record = self
            .persistence
            .get_gateway(gateway_id)
            .await?
            .ok_or_else(|| CoreError::GatewayNotFound {
                gateway_id: gateway_id.to_string(),
            })?;
        GatewayStatusView::from_record(record)
    }

    async fn hash_secret(&self, secret: &str) -> Result<String> {
        let secret = zeroize::Zeroizing::new(secret.to_string());
        let cost = self.settings.secret_hash_cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(secret.as_str(), cost))
            .await
            .map_err(|e| Error::Other(format!("secret hashing task failed: {}", e)))?
            .map_err(Error::from)
    }

    /// Instance, then job. Returns `(instance_id, job_id)`.
    async fn allocate(
        &self,
        record: &GatewayRecord,
        request: &CreateGatewayRequest,
        credential: &DecryptedCredential,
    ) -> Result<(String, String)> {
        let instance_id = self
            .provisioner
            .provision(
                credential,
                &record.region,
                &record.instance_class,
                &record.name,
                &idempotency_token(&record.gateway_id),
            )
            .await?;
        self.persistence
            .set_gateway_instance(&record.gateway_id, &instance_id)
            .await?;

        let job = DeploymentJob {
            gateway_id: record.gateway_id.clone(),
            credential_id: record.credential_id.clone(),
            instance_id: instance_id.clone(),
            user_id: record.user_id.clone(),
            region: record.region.clone(),
            secret: request.secret.clone(),
        };
        let job_id = self
            .queue
            .enqueue_json(
                DEPLOY_JOB_KIND,
                &job,
                JobOptions {
                    queue: Tier::Default,
                    max_retry: self.settings.job_max_retry,
                    timeout: self.settings.job_timeout,
                    unique_key: Some(record.gateway_id.clone()),
                },
            )
            .await?;
        self.persistence
            .set_gateway_job(&record.gateway_id, &job_id)
            .await?;

        info!(
            gateway_id = %record.gateway_id,
            instance_id = %instance_id,
            job_id = %job_id,
            "Gateway deployment queued"
        );
        Ok((instance_id, job_id))
    }

    async fn fail_creation(&self, gateway_id: &str, cause: &Error) {
        warn!(gateway_id = %gateway_id, error = %cause, "Gateway creation failed");
        if let Err(e) = self
            .persistence
            .apply_transition(gateway_id, &Transition::failed(cause.to_string()))
            .await
        {
            error!(
                gateway_id = %gateway_id,
                error = %e,
                "Failed to record gateway creation failure"
            );
        }
    }
}
