// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute provisioner.
//!
//! Picks the newest matching machine image and creates one instance per
//! gateway. The create carries an idempotency token derived from the gateway
//! id, so repeating it after a lost response yields the same instance.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::credentials::DecryptedCredential;
use crate::error::{Error, Result};
use crate::provider::{ComputeProvider, CreateInstanceRequest, ImageFilter, MachineImage};

/// Deterministic idempotency token for a gateway's instance.
pub fn idempotency_token(gateway_id: &str) -> String {
    let digest = Sha256::digest(gateway_id.as_bytes());
    format!("gw-{}", &hex::encode(digest)[..32])
}

/// Newest image by creation time.
pub fn select_image(images: &[MachineImage]) -> Option<&MachineImage> {
    images.iter().max_by_key(|image| image.created_at)
}

/// Creates compute instances for gateways.
#[derive(Clone)]
pub struct Provisioner {
    provider: Arc<dyn ComputeProvider>,
    image_filter: ImageFilter,
}

impl Provisioner {
    /// Create a provisioner using the default image filter.
    pub fn new(provider: Arc<dyn ComputeProvider>) -> Self {
        Self {
            provider,
            image_filter: ImageFilter::default(),
        }
    }

    /// Override the image filter.
    pub fn with_image_filter(mut self, filter: ImageFilter) -> Self {
        self.image_filter = filter;
        self
    }

    /// Create an instance and return its provider id.
    pub async fn provision(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        instance_class: &str,
        name: &str,
        idempotency_token: &str,
    ) -> Result<String> {
        let images = self
            .provider
            .list_images(credential, region, &self.image_filter)
            .await?;
        let image = select_image(&images).ok_or_else(|| Error::NoImageAvailable {
            region: region.to_string(),
        })?;

        let instance_id = self
            .provider
            .create_instance(
                credential,
                region,
                &CreateInstanceRequest {
                    image_id: image.image_id.clone(),
                    instance_class: instance_class.to_string(),
                    name: name.to_string(),
                    idempotency_token: idempotency_token.to_string(),
                    access_profile: credential.instance_profile.clone(),
                },
            )
            .await?;

        info!(
            instance_id = %instance_id,
            image_id = %image.image_id,
            instance_class = %instance_class,
            region = %region,
            name = %name,
            "Instance created"
        );
        Ok(instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use chrono::{TimeZone, Utc};

    fn image(id: &str, year: i32) -> MachineImage {
        MachineImage {
            image_id: id.to_string(),
            name: id.to_string(),
            created_at: Utc.with_ymd_and_hms(year, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    fn cred() -> DecryptedCredential {
        DecryptedCredential::new("c-1", "u-1", "AKIA1", "secret")
            .with_instance_profile(Some("gantry-agent-profile".to_string()))
    }

    #[test]
    fn test_token_is_deterministic() {
        let a = idempotency_token("4f0c5c1e-0000-4000-8000-000000000001");
        let b = idempotency_token("4f0c5c1e-0000-4000-8000-000000000001");
        let c = idempotency_token("4f0c5c1e-0000-4000-8000-000000000002");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("gw-"));
        assert_eq!(a.len(), 35);
    }

    #[test]
    fn test_newest_image_wins() {
        let images = vec![image("a", 2022), image("c", 2025), image("b", 2024)];
        assert_eq!(select_image(&images).unwrap().image_id, "c");
        assert!(select_image(&[]).is_none());
    }

    #[tokio::test]
    async fn test_no_images_is_fatal() {
        let provider = Arc::new(MockProvider::new());
        provider.set_images(Vec::new()).await;
        let provisioner = Provisioner::new(provider.clone());

        let err = provisioner
            .provision(&cred(), "us-east-1", "t3.medium", "edge", "tok")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoImageAvailable { .. }));
        assert!(!err.is_retryable());
        assert_eq!(provider.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_retried_provision_returns_same_instance() {
        let provider = Arc::new(MockProvider::new());
        let provisioner = Provisioner::new(provider.clone());
        let token = idempotency_token("gw-1");

        let first = provisioner
            .provision(&cred(), "us-east-1", "t3.medium", "edge", &token)
            .await
            .unwrap();
        let second = provisioner
            .provision(&cred(), "us-east-1", "t3.medium", "edge", &token)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.instance_count(), 1);
    }
}
