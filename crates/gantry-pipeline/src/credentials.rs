// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Credential resolver.
//!
//! The only place a stored secret is decrypted. Lookups are scoped to the
//! owning user in the query itself, so another user's credential id behaves
//! exactly like a missing one.

use std::fmt;
use std::sync::Arc;

use gantry_core::CoreError;
use gantry_core::Persistence;
use gantry_core::models::{CredentialRecord, NewCredential};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::SecretCipher;
use crate::error::{Error, Result};
use crate::provider::{ComputeProvider, ProviderError};

/// Cloud access keys in cleartext. Lives only in memory.
#[derive(Clone)]
pub struct DecryptedCredential {
    /// Credential record id.
    pub credential_id: String,
    /// Owning user.
    pub user_id: String,
    /// Access key identifier.
    pub access_key_id: String,
    secret_access_key: Zeroizing<String>,
    /// Instance profile attached to provisioned instances.
    pub instance_profile: Option<String>,
}

impl DecryptedCredential {
    /// Build a credential from cleartext parts.
    pub fn new(
        credential_id: impl Into<String>,
        user_id: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self {
            credential_id: credential_id.into(),
            user_id: user_id.into(),
            access_key_id: access_key_id.into(),
            secret_access_key: Zeroizing::new(secret_access_key.into()),
            instance_profile: None,
        }
    }

    /// Attach the instance profile name.
    pub fn with_instance_profile(mut self, profile: Option<String>) -> Self {
        self.instance_profile = profile;
        self
    }

    /// The secret access key.
    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }
}

impl fmt::Debug for DecryptedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedCredential")
            .field("credential_id", &self.credential_id)
            .field("user_id", &self.user_id)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("instance_profile", &self.instance_profile)
            .finish()
    }
}

/// Fetches and decrypts user credentials; registers new ones.
#[derive(Clone)]
pub struct CredentialResolver {
    persistence: Arc<dyn Persistence>,
    provider: Arc<dyn ComputeProvider>,
    cipher: SecretCipher,
}

impl CredentialResolver {
    /// Create a resolver.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        provider: Arc<dyn ComputeProvider>,
        cipher: SecretCipher,
    ) -> Self {
        Self {
            persistence,
            provider,
            cipher,
        }
    }

    /// Fetch the credential owned by `user_id` and decrypt its secret.
    ///
    /// Fails closed: missing or foreign credentials are `NotFound`, an
    /// undecryptable secret is a crypto error. Neither is retried.
    pub async fn resolve(&self, credential_id: &str, user_id: &str) -> Result<DecryptedCredential> {
        let record = self
            .persistence
            .get_credential(credential_id, user_id)
            .await?
            .ok_or_else(|| CoreError::CredentialNotFound {
                credential_id: credential_id.to_string(),
            })?;

        let secret = self.cipher.open_str(&record.encrypted_secret)?;
        debug!(credential_id = %credential_id, "Credential resolved");

        Ok(DecryptedCredential {
            credential_id: record.credential_id,
            user_id: record.user_id,
            access_key_id: record.access_key_id,
            secret_access_key: secret,
            instance_profile: record.profile_name,
        })
    }

    /// Validate new access keys with the provider and store them encrypted.
    ///
    /// Validation creates the access role and instance profile; their
    /// identifiers are stored next to the sealed secret.
    pub async fn register(
        &self,
        user_id: &str,
        access_key_id: &str,
        secret_access_key: &str,
        region: &str,
    ) -> Result<CredentialRecord> {
        if access_key_id.trim().is_empty() {
            return Err(Error::invalid("access_key_id", "must not be empty"));
        }
        if secret_access_key.is_empty() {
            return Err(Error::invalid("secret_access_key", "must not be empty"));
        }

        if self
            .persistence
            .get_credential_by_access_key(access_key_id)
            .await?
            .is_some()
        {
            return Err(CoreError::CredentialAlreadyExists {
                access_key_id: access_key_id.to_string(),
            }
            .into());
        }

        let credential_id = uuid::Uuid::new_v4().to_string();
        let candidate =
            DecryptedCredential::new(&credential_id, user_id, access_key_id, secret_access_key);

        let access = self
            .provider
            .prepare_access(&candidate, region)
            .await
            .map_err(|e| match e {
                ProviderError::NotFound(msg) => ProviderError::InvalidCredentials(msg),
                other => other,
            })?;

        let record = self
            .persistence
            .insert_credential(&NewCredential {
                credential_id,
                user_id: user_id.to_string(),
                access_key_id: access_key_id.to_string(),
                encrypted_secret: self.cipher.seal_str(secret_access_key)?,
                role_name: Some(access.role_name),
                role_ref: Some(access.role_ref),
                profile_name: Some(access.profile_name),
                profile_ref: Some(access.profile_ref),
            })
            .await?;

        info!(
            credential_id = %record.credential_id,
            user_id = %user_id,
            "Credential registered"
        );
        Ok(record)
    }
}
