// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock compute provider for testing.
//!
//! Simulates a cloud without any network access. Instance readiness and
//! command invocation answers can be scripted step by step; once a script is
//! exhausted the provider falls back to a healthy default.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::traits::*;
use crate::credentials::DecryptedCredential;

/// One scripted answer to `describe_instance`.
#[derive(Debug, Clone)]
pub enum DescribeStep {
    /// Report this state.
    State {
        /// Power state.
        state: PowerState,
        /// Whether the agent is attached.
        agent_attached: bool,
    },
    /// Fail with a transient error.
    Transient,
}

/// One scripted answer to `get_command_invocation`.
#[derive(Debug, Clone)]
pub enum InvocationStep {
    /// Report this invocation.
    Status(CommandInvocation),
    /// The invocation is not visible yet.
    NotFound,
    /// Fail with a transient error.
    Transient,
}

impl InvocationStep {
    /// Shorthand for a non-terminal status with no output.
    pub fn status(status: CommandStatus) -> Self {
        Self::Status(CommandInvocation {
            status,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    /// Shorthand for a finished command.
    pub fn finished(status: CommandStatus, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        Self::Status(CommandInvocation {
            status,
            exit_code: Some(exit_code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        })
    }
}

/// A command the mock accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    /// Returned command id.
    pub command_id: String,
    /// Target instance.
    pub instance_id: String,
    /// Full command text.
    pub command: String,
}

fn class(name: &str, vcpus: u32, memory_mib: u64) -> InstanceClassSpec {
    InstanceClassSpec {
        name: name.to_string(),
        vcpus,
        memory_mib,
        architecture: "x86_64".to_string(),
    }
}

/// Mock provider for testing.
pub struct MockProvider {
    images: Mutex<Vec<MachineImage>>,
    instance_classes: Mutex<Vec<InstanceClassSpec>>,
    instances_by_token: DashMap<String, String>,
    commands_by_token: DashMap<String, String>,
    describe_script: Mutex<VecDeque<DescribeStep>>,
    invocation_script: Mutex<VecDeque<InvocationStep>>,
    sent: Mutex<Vec<SentCommand>>,
    create_calls: AtomicUsize,
    describe_calls: AtomicUsize,
    invocation_calls: AtomicUsize,
    /// If true, `prepare_access` rejects the keys.
    pub reject_credentials: bool,
    /// If set, `create_instance` fails with this message.
    pub create_failure: Option<String>,
    /// If false, instances never become ready once the script runs out.
    pub ready_by_default: bool,
    /// Stdout reported for commands once the script runs out.
    pub default_output: String,
    /// Latency added to every describe and invocation poll.
    pub poll_latency: Duration,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Create a healthy mock provider with one image.
    pub fn new() -> Self {
        Self {
            images: Mutex::new(vec![MachineImage {
                image_id: "img-ubuntu-2404".to_string(),
                name: "ubuntu-24.04-amd64-server".to_string(),
                created_at: DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default(),
            }]),
            instance_classes: Mutex::new(vec![
                class("t3.medium", 2, 4096),
                class("t3.xlarge", 4, 16384),
                class("m5.xlarge", 4, 16384),
                class("c5.2xlarge", 8, 16384),
            ]),
            instances_by_token: DashMap::new(),
            commands_by_token: DashMap::new(),
            describe_script: Mutex::new(VecDeque::new()),
            invocation_script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
            describe_calls: AtomicUsize::new(0),
            invocation_calls: AtomicUsize::new(0),
            reject_credentials: false,
            create_failure: None,
            ready_by_default: true,
            default_output: "{\"success\":true}".to_string(),
            poll_latency: Duration::ZERO,
        }
    }

    /// Create a mock whose instances never become ready.
    pub fn never_ready() -> Self {
        Self {
            ready_by_default: false,
            ..Self::new()
        }
    }

    /// Create a mock whose `create_instance` always fails.
    pub fn failing_create(message: &str) -> Self {
        Self {
            create_failure: Some(message.to_string()),
            ..Self::new()
        }
    }

    /// Replace the image catalogue.
    pub async fn set_images(&self, images: Vec<MachineImage>) {
        *self.images.lock().await = images;
    }

    /// Replace the instance class listing.
    pub async fn set_instance_classes(&self, classes: Vec<InstanceClassSpec>) {
        *self.instance_classes.lock().await = classes;
    }

    /// Queue answers for `describe_instance`.
    pub async fn script_describe(&self, steps: impl IntoIterator<Item = DescribeStep>) {
        self.describe_script.lock().await.extend(steps);
    }

    /// Queue answers for `get_command_invocation`.
    pub async fn script_invocations(&self, steps: impl IntoIterator<Item = InvocationStep>) {
        self.invocation_script.lock().await.extend(steps);
    }

    /// Commands accepted so far. A resend with a known token is not listed
    /// again.
    pub async fn sent_commands(&self) -> Vec<SentCommand> {
        self.sent.lock().await.clone()
    }

    /// Number of `create_instance` calls, including deduplicated ones.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of distinct instances created.
    pub fn instance_count(&self) -> usize {
        self.instances_by_token.len()
    }

    /// Number of `describe_instance` calls.
    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_command_invocation` calls.
    pub fn invocation_calls(&self) -> usize {
        self.invocation_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeProvider for MockProvider {
    fn provider_type(&self) -> &'static str {
        "mock"
    }

    async fn prepare_access(
        &self,
        credential: &DecryptedCredential,
        _region: &str,
    ) -> Result<AccessProfile> {
        if self.reject_credentials {
            return Err(ProviderError::InvalidCredentials(format!(
                "access key {} is not valid",
                credential.access_key_id
            )));
        }
        Ok(AccessProfile {
            role_name: "gantry-agent-role".to_string(),
            role_ref: format!("role/{}", credential.credential_id),
            profile_name: "gantry-agent-profile".to_string(),
            profile_ref: format!("instance-profile/{}", credential.credential_id),
        })
    }

    async fn list_images(
        &self,
        _credential: &DecryptedCredential,
        _region: &str,
        _filter: &ImageFilter,
    ) -> Result<Vec<MachineImage>> {
        Ok(self.images.lock().await.clone())
    }

    async fn list_instance_classes(
        &self,
        _credential: &DecryptedCredential,
        _region: &str,
        architecture: &str,
    ) -> Result<Vec<InstanceClassSpec>> {
        Ok(self
            .instance_classes
            .lock()
            .await
            .iter()
            .filter(|c| c.architecture == architecture)
            .cloned()
            .collect())
    }

    async fn create_instance(
        &self,
        _credential: &DecryptedCredential,
        _region: &str,
        request: &CreateInstanceRequest,
    ) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = &self.create_failure {
            return Err(ProviderError::Rejected(message.clone()));
        }

        let instance_id = self
            .instances_by_token
            .entry(request.idempotency_token.clone())
            .or_insert_with(|| format!("i-{}", uuid::Uuid::new_v4().simple()))
            .clone();
        Ok(instance_id)
    }

    async fn describe_instance(
        &self,
        _credential: &DecryptedCredential,
        _region: &str,
        instance_id: &str,
    ) -> Result<InstanceDescription> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        if !self.poll_latency.is_zero() {
            tokio::time::sleep(self.poll_latency).await;
        }

        let step = self.describe_script.lock().await.pop_front();
        let (state, agent_attached) = match step {
            Some(DescribeStep::State {
                state,
                agent_attached,
            }) => (state, agent_attached),
            Some(DescribeStep::Transient) => {
                return Err(ProviderError::Transient("describe throttled".to_string()));
            }
            None if self.ready_by_default => (PowerState::Running, true),
            None => (PowerState::Pending, false),
        };

        Ok(InstanceDescription {
            instance_id: instance_id.to_string(),
            state,
            agent_attached,
        })
    }

    async fn send_command(
        &self,
        _credential: &DecryptedCredential,
        _region: &str,
        instance_id: &str,
        command: &str,
        idempotency_token: &str,
    ) -> Result<String> {
        let mut sent = self.sent.lock().await;
        if let Some(command_id) = self.commands_by_token.get(idempotency_token) {
            return Ok(command_id.clone());
        }

        let command_id = format!("cmd-{}", uuid::Uuid::new_v4().simple());
        self.commands_by_token
            .insert(idempotency_token.to_string(), command_id.clone());
        sent.push(SentCommand {
            command_id: command_id.clone(),
            instance_id: instance_id.to_string(),
            command: command.to_string(),
        });
        Ok(command_id)
    }

    async fn get_command_invocation(
        &self,
        _credential: &DecryptedCredential,
        _region: &str,
        command_id: &str,
        _instance_id: &str,
    ) -> Result<CommandInvocation> {
        self.invocation_calls.fetch_add(1, Ordering::SeqCst);
        if !self.poll_latency.is_zero() {
            tokio::time::sleep(self.poll_latency).await;
        }

        match self.invocation_script.lock().await.pop_front() {
            Some(InvocationStep::Status(invocation)) => Ok(invocation),
            Some(InvocationStep::NotFound) => Err(ProviderError::NotFound(format!(
                "invocation {} not visible yet",
                command_id
            ))),
            Some(InvocationStep::Transient) => {
                Err(ProviderError::Transient("invocation throttled".to_string()))
            }
            None => Ok(CommandInvocation {
                status: CommandStatus::Success,
                exit_code: Some(0),
                stdout: self.default_output.clone(),
                stderr: String::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred() -> DecryptedCredential {
        DecryptedCredential::new("c-1", "u-1", "AKIA1", "secret")
    }

    fn request(token: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            image_id: "img".to_string(),
            instance_class: "t3.medium".to_string(),
            name: "edge".to_string(),
            idempotency_token: token.to_string(),
            access_profile: None,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_token() {
        let provider = MockProvider::new();
        let a = provider
            .create_instance(&cred(), "us-east-1", &request("tok-1"))
            .await
            .unwrap();
        let b = provider
            .create_instance(&cred(), "us-east-1", &request("tok-1"))
            .await
            .unwrap();
        let c = provider
            .create_instance(&cred(), "us-east-1", &request("tok-2"))
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(provider.create_calls(), 3);
        assert_eq!(provider.instance_count(), 2);
    }

    #[tokio::test]
    async fn test_describe_script_then_default() {
        let provider = MockProvider::new();
        provider
            .script_describe([
                DescribeStep::Transient,
                DescribeStep::State {
                    state: PowerState::Pending,
                    agent_attached: false,
                },
            ])
            .await;

        assert!(
            provider
                .describe_instance(&cred(), "r", "i-1")
                .await
                .unwrap_err()
                .is_transient()
        );
        let d = provider.describe_instance(&cred(), "r", "i-1").await.unwrap();
        assert!(!d.is_operable());
        let d = provider.describe_instance(&cred(), "r", "i-1").await.unwrap();
        assert!(d.is_operable());
        assert_eq!(provider.describe_calls(), 3);
    }

    #[tokio::test]
    async fn test_send_is_idempotent_per_token() {
        let provider = MockProvider::new();
        let a = provider
            .send_command(&cred(), "r", "i-1", "echo one", "tok-1")
            .await
            .unwrap();
        let b = provider
            .send_command(&cred(), "r", "i-1", "echo one", "tok-1")
            .await
            .unwrap();
        let c = provider
            .send_command(&cred(), "r", "i-1", "echo two", "tok-2")
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(provider.sent_commands().await.len(), 2);
    }

    #[tokio::test]
    async fn test_instance_classes_filtered_by_architecture() {
        let provider = MockProvider::new();
        let x86 = provider
            .list_instance_classes(&cred(), "r", "x86_64")
            .await
            .unwrap();
        assert!(x86.iter().any(|c| c.name == "m5.xlarge"));
        assert!(
            provider
                .list_instance_classes(&cred(), "r", "arm64")
                .await
                .unwrap()
                .is_empty()
        );
    }
}
