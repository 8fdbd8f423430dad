// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP compute provider.
//!
//! Talks JSON to a provider gateway service that fronts the actual cloud.
//! Every request carries the user's access keys as HTTP basic auth and the
//! target region as a query parameter.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | `prepare_access` | `POST /v1/access` |
//! | `list_images` | `GET /v1/images?owner=&architecture=` |
//! | `list_instance_classes` | `GET /v1/instance-classes?architecture=` |
//! | `create_instance` | `POST /v1/instances` |
//! | `describe_instance` | `GET /v1/instances/{id}` |
//! | `send_command` | `POST /v1/instances/{id}/commands` |
//! | `get_command_invocation` | `GET /v1/commands/{command_id}/invocations/{instance_id}` |
//!
//! Status mapping: 401/403 are invalid credentials, 404 is not found, 408/429
//! and 5xx are transient, any other non-success is a rejection.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::traits::*;
use crate::credentials::DecryptedCredential;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Compute provider backed by a JSON HTTP API.
#[derive(Clone)]
pub struct HttpComputeProvider {
    client: reqwest::Client,
    base_url: Url,
}

#[derive(Deserialize)]
struct ImagesResponse {
    images: Vec<MachineImage>,
}

#[derive(Deserialize)]
struct InstanceClassesResponse {
    instance_classes: Vec<InstanceClassSpec>,
}

#[derive(Deserialize)]
struct InstanceCreated {
    instance_id: String,
}

#[derive(Deserialize)]
struct CommandSent {
    command_id: String,
}

impl HttpComputeProvider {
    /// Create a provider for `base_url` with the default request timeout.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a provider with an explicit per-request timeout.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| ProviderError::Rejected(format!("invalid provider endpoint: {}", e)))?;
        // Url::join drops the last segment unless the path ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Rejected(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        credential: &DecryptedCredential,
        region: &str,
    ) -> Result<RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ProviderError::Rejected(format!("invalid request path {}: {}", path, e)))?;

        Ok(self
            .client
            .request(method, url)
            .basic_auth(
                &credential.access_key_id,
                Some(credential.secret_access_key()),
            )
            .query(&[("region", region)]))
    }

    async fn send<T: DeserializeOwned>(&self, operation: &str, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(|e| {
            ProviderError::Transient(format!("{} request failed: {}", operation, e))
        })?;
        let response = check_status(operation, response).await?;
        response.json::<T>().await.map_err(|e| {
            ProviderError::Rejected(format!("{} returned an unreadable body: {}", operation, e))
        })
    }
}

async fn check_status(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    debug!(operation = operation, status = %status, "Provider call failed");
    let message = format!("{} returned {}: {}", operation, status.as_u16(), body.trim());

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::InvalidCredentials(message)
        }
        StatusCode::NOT_FOUND => ProviderError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::Transient(message)
        }
        s if s.is_server_error() => ProviderError::Transient(message),
        _ => ProviderError::Rejected(message),
    })
}

#[async_trait]
impl ComputeProvider for HttpComputeProvider {
    fn provider_type(&self) -> &'static str {
        "http"
    }

    async fn prepare_access(
        &self,
        credential: &DecryptedCredential,
        region: &str,
    ) -> Result<AccessProfile> {
        let request = self.request(Method::POST, "v1/access", credential, region)?;
        self.send("prepare_access", request).await
    }

    async fn list_images(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        filter: &ImageFilter,
    ) -> Result<Vec<MachineImage>> {
        let request = self
            .request(Method::GET, "v1/images", credential, region)?
            .query(&[
                ("owner", filter.owner.as_str()),
                ("architecture", filter.architecture.as_str()),
            ]);
        let response: ImagesResponse = self.send("list_images", request).await?;
        Ok(response.images)
    }

    async fn list_instance_classes(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        architecture: &str,
    ) -> Result<Vec<InstanceClassSpec>> {
        let request = self
            .request(Method::GET, "v1/instance-classes", credential, region)?
            .query(&[("architecture", architecture)]);
        let response: InstanceClassesResponse =
            self.send("list_instance_classes", request).await?;
        Ok(response.instance_classes)
    }

    async fn create_instance(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        create: &CreateInstanceRequest,
    ) -> Result<String> {
        let request = self
            .request(Method::POST, "v1/instances", credential, region)?
            .json(create);
        let response: InstanceCreated = self.send("create_instance", request).await?;
        Ok(response.instance_id)
    }

    async fn describe_instance(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        instance_id: &str,
    ) -> Result<InstanceDescription> {
        let path = format!("v1/instances/{}", instance_id);
        let request = self.request(Method::GET, &path, credential, region)?;
        self.send("describe_instance", request).await
    }

    async fn send_command(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        instance_id: &str,
        command: &str,
        idempotency_token: &str,
    ) -> Result<String> {
        let path = format!("v1/instances/{}/commands", instance_id);
        let request = self
            .request(Method::POST, &path, credential, region)?
            .json(&serde_json::json!({
                "commands": [command],
                "idempotency_token": idempotency_token,
            }));
        let response: CommandSent = self.send("send_command", request).await?;
        Ok(response.command_id)
    }

    async fn get_command_invocation(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        command_id: &str,
        instance_id: &str,
    ) -> Result<CommandInvocation> {
        let path = format!("v1/commands/{}/invocations/{}", command_id, instance_id);
        let request = self.request(Method::GET, &path, credential, region)?;
        self.send("get_command_invocation", request).await
    }
}
