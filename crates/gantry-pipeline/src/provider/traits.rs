// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute provider trait definitions.
//!
//! The pipeline only ever talks to a cloud through [`ComputeProvider`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::DecryptedCredential;

/// Errors from provider operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The provider rejected the access keys.
    #[error("Provider rejected credentials: {0}")]
    InvalidCredentials(String),

    /// Throttling, 5xx, network failure. Worth retrying.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// The referenced resource does not exist (yet).
    #[error("Provider resource not found: {0}")]
    NotFound(String),

    /// The provider understood the request and refused it.
    #[error("Provider rejected request: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Whether the call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Access role and instance profile created when a credential is registered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessProfile {
    /// Role name.
    pub role_name: String,
    /// Provider reference of the role.
    pub role_ref: String,
    /// Instance profile name, attached to every instance.
    pub profile_name: String,
    /// Provider reference of the instance profile.
    pub profile_ref: String,
}

/// Filter applied when looking up machine images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFilter {
    /// Image publisher account.
    pub owner: String,
    /// CPU architecture.
    pub architecture: String,
}

impl Default for ImageFilter {
    fn default() -> Self {
        Self {
            owner: "099720109477".to_string(),
            architecture: "x86_64".to_string(),
        }
    }
}

/// A machine image offered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineImage {
    /// Provider image identifier.
    pub image_id: String,
    /// Human-readable name.
    pub name: String,
    /// Publication time; the newest image wins.
    pub created_at: DateTime<Utc>,
}

/// An instance class offered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceClassSpec {
    /// Provider name of the class (e.g. `m5.xlarge`).
    pub name: String,
    /// Default virtual CPU count.
    pub vcpus: u32,
    /// Memory in MiB.
    pub memory_mib: u64,
    /// CPU architecture.
    pub architecture: String,
}

/// Parameters for creating an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    /// Image to boot.
    pub image_id: String,
    /// Instance class (size).
    pub instance_class: String,
    /// Name tag, the gateway slug.
    pub name: String,
    /// Token that makes the create idempotent across retries.
    pub idempotency_token: String,
    /// Instance profile granting the management agent access.
    pub access_profile: Option<String>,
}

/// Power state reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerState {
    /// Booting.
    Pending,
    /// Up.
    Running,
    /// On the way to `stopped`.
    Stopping,
    /// Halted.
    Stopped,
    /// On the way to `terminated`.
    ShuttingDown,
    /// Gone.
    Terminated,
}

impl PowerState {
    /// States from which an instance never comes back on its own.
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Stopped | Self::ShuttingDown | Self::Terminated)
    }
}

/// Result of describing an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    /// Provider instance identifier.
    pub instance_id: String,
    /// Current power state.
    pub state: PowerState,
    /// Whether the remote management agent is reachable.
    pub agent_attached: bool,
}

impl InstanceDescription {
    /// Running and reachable by the command channel.
    pub fn is_operable(&self) -> bool {
        self.state == PowerState::Running && self.agent_attached
    }
}

/// Remote command status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Accepted, not started.
    Pending,
    /// Running on the instance.
    InProgress,
    /// Waiting for the instance to become reachable.
    Delayed,
    /// Finished.
    Success,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// The provider gave up on it.
    TimedOut,
}

impl CommandStatus {
    /// Whether the command has finished one way or another.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress | Self::Delayed)
    }

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Delayed => "delayed",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One poll of a command's invocation on an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInvocation {
    /// Current status.
    pub status: CommandStatus,
    /// Process exit code once known.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Captured standard output (possibly empty).
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error (possibly empty).
    #[serde(default)]
    pub stderr: String,
}

/// Capability interface over a cloud compute API.
///
/// Providers are pure API clients: they never touch the database. Every call
/// is scoped to one credential and region.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Provider type identifier (e.g. "http", "mock").
    fn provider_type(&self) -> &'static str;

    /// Validate the access keys and create the role and instance profile
    /// instances will run under.
    async fn prepare_access(
        &self,
        credential: &DecryptedCredential,
        region: &str,
    ) -> Result<AccessProfile>;

    /// List machine images matching `filter`.
    async fn list_images(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        filter: &ImageFilter,
    ) -> Result<Vec<MachineImage>>;

    /// List instance classes available for `architecture`.
    async fn list_instance_classes(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        architecture: &str,
    ) -> Result<Vec<InstanceClassSpec>>;

    /// Create an instance and return its identifier.
    ///
    /// Repeating a call with the same idempotency token returns the instance
    /// created by the first call.
    async fn create_instance(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        request: &CreateInstanceRequest,
    ) -> Result<String>;

    /// Describe an instance's power and agent state.
    async fn describe_instance(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        instance_id: &str,
    ) -> Result<InstanceDescription>;

    /// Dispatch a shell command to an instance. Returns the command id
    /// without waiting for it to run.
    ///
    /// Repeating a call with the same idempotency token returns the command
    /// id of the first call and does not run the command again.
    async fn send_command(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        instance_id: &str,
        command: &str,
        idempotency_token: &str,
    ) -> Result<String>;

    /// Fetch the current invocation state of a dispatched command.
    async fn get_command_invocation(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        command_id: &str,
        instance_id: &str,
    ) -> Result<CommandInvocation>;
}
