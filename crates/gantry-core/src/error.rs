// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gantry-core.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors raised by persistence and state transitions.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Gateway was not found.
    #[error("Gateway '{gateway_id}' not found")]
    GatewayNotFound {
        /// The gateway ID that was not found.
        gateway_id: String,
    },

    /// A gateway with the same canonical name already exists.
    #[error("Gateway '{name}' already exists")]
    GatewayAlreadyExists {
        /// The canonical (slugified) name.
        name: String,
    },

    /// Credential was not found or is not owned by the caller.
    #[error("Credential '{credential_id}' not found")]
    CredentialNotFound {
        /// The credential ID that was not found.
        credential_id: String,
    },

    /// A credential with the same access key already exists.
    #[error("Credential with access key '{access_key_id}' already exists")]
    CredentialAlreadyExists {
        /// The duplicated access key identifier.
        access_key_id: String,
    },

    /// Gateway status change is not allowed by the state machine.
    #[error("Gateway '{gateway_id}' cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        /// The gateway ID.
        gateway_id: String,
        /// The current status.
        from: String,
        /// The requested status.
        to: String,
    },

    /// A live job with the same unique key is already queued or running.
    #[error("A job for '{unique_key}' is already queued")]
    JobAlreadyExists {
        /// The unique key (gateway ID for deployment jobs).
        unique_key: String,
    },

    /// Job was not found.
    #[error("Job '{job_id}' not found")]
    JobNotFound {
        /// The job ID that was not found.
        job_id: String,
    },

    /// Input validation failed.
    #[error("Validation error on '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during {operation}: {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::GatewayNotFound { .. } => "GATEWAY_NOT_FOUND",
            Self::GatewayAlreadyExists { .. } => "GATEWAY_ALREADY_EXISTS",
            Self::CredentialNotFound { .. } => "CREDENTIAL_NOT_FOUND",
            Self::CredentialAlreadyExists { .. } => "CREDENTIAL_ALREADY_EXISTS",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::JobAlreadyExists { .. } => "JOB_ALREADY_EXISTS",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the error means the referenced record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::GatewayNotFound { .. } | Self::CredentialNotFound { .. } | Self::JobNotFound { .. }
        )
    }

    pub(crate) fn database(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::DatabaseError {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::database("query", err)
    }
}

/// Whether a sqlx error is a unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

/// Whether a sqlx error is a foreign-key violation.
pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_foreign_key_violation(),
        _ => false,
    }
}
