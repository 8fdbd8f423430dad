// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record types stored by the persistence layer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{CoreError, Result};
use crate::state::GatewayStatus;

/// Gateway record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GatewayRecord {
    /// Unique identifier for the gateway.
    pub gateway_id: String,
    /// Owning user.
    pub user_id: String,
    /// Credential used to provision the instance.
    pub credential_id: String,
    /// Cloud provider name (e.g. `aws`).
    pub provider: String,
    /// Provider region.
    pub region: String,
    /// Canonical (slugified) name, globally unique.
    pub name: String,
    /// Workload type (`ai`, `transcoding`).
    pub gateway_type: String,
    /// Connection URL handed to the workload.
    pub rpc_url: String,
    /// One-way hash of the gateway secret.
    pub secret_hash: String,
    /// Workload profile tag (`480p`, `720p`, `1080p`).
    pub profile: String,
    /// Provider instance class.
    pub instance_class: String,
    /// Current status (initializing, running, failed).
    pub status: String,
    /// Diagnostic text for failed gateways.
    pub error_status: Option<String>,
    /// Provider instance identifier once provisioned.
    pub instance_id: Option<String>,
    /// Deployment job identifier once enqueued.
    pub job_id: Option<String>,
    /// Bootstrap command identifier once dispatched.
    pub command_id: Option<String>,
    /// Captured stdout of a successful bootstrap.
    pub bootstrap_output: Option<String>,
    /// When the gateway was created.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl GatewayRecord {
    /// Parsed lifecycle status.
    pub fn lifecycle(&self) -> Result<GatewayStatus> {
        self.status.parse()
    }
}

/// Fields needed to insert a new gateway.
#[derive(Debug, Clone)]
pub struct NewGateway {
    /// Unique identifier for the gateway.
    pub gateway_id: String,
    /// Owning user.
    pub user_id: String,
    /// Credential used to provision the instance.
    pub credential_id: String,
    /// Cloud provider name.
    pub provider: String,
    /// Provider region.
    pub region: String,
    /// Canonical (slugified) name.
    pub name: String,
    /// Workload type.
    pub gateway_type: String,
    /// Connection URL.
    pub rpc_url: String,
    /// One-way hash of the gateway secret. Never the cleartext.
    pub secret_hash: String,
    /// Workload profile tag.
    pub profile: String,
    /// Provider instance class.
    pub instance_class: String,
}

/// Credential record. The secret stays encrypted here.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CredentialRecord {
    /// Unique identifier for the credential.
    pub credential_id: String,
    /// Owning user.
    pub user_id: String,
    /// Access key identifier, unique across users.
    pub access_key_id: String,
    /// Sealed secret (nonce-prefixed AES-GCM, base64).
    pub encrypted_secret: String,
    /// Provider role created during validation.
    pub role_name: Option<String>,
    /// Provider reference of the role.
    pub role_ref: Option<String>,
    /// Instance profile created during validation.
    pub profile_name: Option<String>,
    /// Provider reference of the instance profile.
    pub profile_ref: Option<String>,
    /// When the credential was stored.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to insert a credential.
#[derive(Debug, Clone)]
pub struct NewCredential {
    /// Unique identifier for the credential.
    pub credential_id: String,
    /// Owning user.
    pub user_id: String,
    /// Access key identifier.
    pub access_key_id: String,
    /// Sealed secret.
    pub encrypted_secret: String,
    /// Provider role created during validation.
    pub role_name: Option<String>,
    /// Provider reference of the role.
    pub role_ref: Option<String>,
    /// Instance profile created during validation.
    pub profile_name: Option<String>,
    /// Provider reference of the instance profile.
    pub profile_ref: Option<String>,
}

/// State of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Waiting for `run_at`.
    Pending,
    /// Claimed by a worker, protected by a lease.
    Active,
    /// Dead: retries exhausted or failed with a do-not-retry error.
    Archived,
}

impl JobState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(CoreError::ValidationError {
                field: "state".to_string(),
                message: format!("unknown job state '{}'", other),
            }),
        }
    }
}

/// Job row from the durable queue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    /// Unique identifier for the job.
    pub job_id: String,
    /// Handler routing key (e.g. `gateway:deploy`).
    pub kind: String,
    /// Queue (priority tier) name.
    pub queue: String,
    /// Deduplication key; at most one live job per key.
    pub unique_key: Option<String>,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Current state (pending, active, archived).
    pub state: String,
    /// Number of times the job has been claimed.
    pub attempts: i32,
    /// Retries allowed after the first attempt.
    pub max_retry: i32,
    /// Execution timeout in seconds.
    pub timeout_secs: i64,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    /// Lease expiry while active; expired leases are re-claimable.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Last failure message.
    pub last_error: Option<String>,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Parsed job state.
    pub fn job_state(&self) -> Result<JobState> {
        self.state.parse()
    }

    /// Whether the retry budget is used up after the current attempt.
    pub fn retries_exhausted(&self) -> bool {
        self.attempts > self.max_retry
    }
}

/// Fields needed to enqueue a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Unique identifier for the job.
    pub job_id: String,
    /// Handler routing key.
    pub kind: String,
    /// Queue (priority tier) name.
    pub queue: String,
    /// Deduplication key.
    pub unique_key: Option<String>,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Retries allowed after the first attempt.
    pub max_retry: i32,
    /// Execution timeout in seconds.
    pub timeout_secs: i64,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
}

/// An instance class from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct InstanceClassRecord {
    /// Provider name of the class (e.g. `m5.xlarge`).
    pub instance_class: String,
    /// Default virtual CPU count.
    pub vcpus: i32,
    /// Memory in MiB.
    pub memory_mib: i64,
    /// CPU architecture.
    pub architecture: String,
    /// When the provider last reported the class.
    pub synced_at: DateTime<Utc>,
}

/// Fields written when the catalog is refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstanceClass {
    /// Provider name of the class.
    pub instance_class: String,
    /// Default virtual CPU count.
    pub vcpus: i32,
    /// Memory in MiB.
    pub memory_mib: i64,
    /// CPU architecture.
    pub architecture: String,
}
