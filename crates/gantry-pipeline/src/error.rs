// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gantry-pipeline.

use std::time::Duration;

use gantry_core::CoreError;
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::provider::ProviderError;

/// Coarse error classes used for retry decisions and HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Missing or malformed configuration, unusable keys.
    Configuration,
    /// A referenced record does not exist or is not visible to the caller.
    NotFound,
    /// Request or state validation failed.
    Validation,
    /// A uniqueness rule was violated.
    AlreadyExists,
    /// The provider rejected the user's access keys.
    InvalidCredentials,
    /// Throttling, 5xx or network trouble at the provider.
    TransientProvider,
    /// A bounded wait ran out.
    Timeout,
    /// The provider gave a definitive negative answer.
    Provider,
    /// Database, serialization and other internal failures.
    Internal,
}

/// Pipeline errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Secret cipher failure.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Core persistence operation failed.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Compute provider call failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Secret hashing failed.
    #[error("Hash error: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    /// Request validation failed.
    #[error("Invalid request: {field}: {message}")]
    InvalidRequest {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// No machine image matched the filter.
    #[error("No machine image available in region '{region}'")]
    NoImageAvailable {
        /// Region that was searched.
        region: String,
    },

    /// The instance entered a state it will not recover from.
    #[error("Instance '{instance_id}' lost: state {state}")]
    InstanceLost {
        /// Provider instance id.
        instance_id: String,
        /// Observed power state.
        state: String,
    },

    /// The instance did not become operable in time.
    #[error("Instance '{instance_id}' not ready after {waited:?}")]
    ReadinessTimeout {
        /// Provider instance id.
        instance_id: String,
        /// How long we waited.
        waited: Duration,
    },

    /// The bootstrap command did not finish in time.
    #[error("Command '{command_id}' did not complete within {waited:?}")]
    CommandTimeout {
        /// Provider command id.
        command_id: String,
        /// How long we waited.
        waited: Duration,
    },

    /// The surrounding job was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) => ErrorClass::Configuration,
            // Bad key size, tampered ciphertext or a rotated key.
            Self::Crypto(_) => ErrorClass::Configuration,
            Self::Core(err) => match err {
                CoreError::GatewayNotFound { .. }
                | CoreError::CredentialNotFound { .. }
                | CoreError::JobNotFound { .. } => ErrorClass::NotFound,
                CoreError::GatewayAlreadyExists { .. }
                | CoreError::CredentialAlreadyExists { .. }
                | CoreError::JobAlreadyExists { .. } => ErrorClass::AlreadyExists,
                CoreError::InvalidTransition { .. } | CoreError::ValidationError { .. } => {
                    ErrorClass::Validation
                }
                _ => ErrorClass::Internal,
            },
            Self::Provider(err) => match err {
                ProviderError::InvalidCredentials(_) => ErrorClass::InvalidCredentials,
                ProviderError::Transient(_) => ErrorClass::TransientProvider,
                _ => ErrorClass::Provider,
            },
            Self::Json(_) | Self::Hash(_) | Self::Other(_) | Self::Cancelled => {
                ErrorClass::Internal
            }
            Self::InvalidRequest { .. } => ErrorClass::Validation,
            Self::NoImageAvailable { .. } | Self::InstanceLost { .. } => ErrorClass::Provider,
            Self::ReadinessTimeout { .. } | Self::CommandTimeout { .. } => ErrorClass::Timeout,
        }
    }

    /// Whether a queued job failing with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::TransientProvider | ErrorClass::Internal
        )
    }

    /// HTTP status for the front door.
    pub fn status_code(&self) -> u16 {
        match self.class() {
            ErrorClass::Validation | ErrorClass::InvalidCredentials => 400,
            ErrorClass::NotFound => 404,
            ErrorClass::AlreadyExists => 409,
            ErrorClass::TransientProvider | ErrorClass::Provider => 502,
            ErrorClass::Timeout => 504,
            ErrorClass::Configuration | ErrorClass::Internal => 500,
        }
    }

    /// Shorthand for [`Error::InvalidRequest`].
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            field,
            message: message.into(),
        }
    }
}

/// Result type using pipeline Error.
pub type Result<T> = std::result::Result<T, Error>;
