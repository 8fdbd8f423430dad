// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote command executor.
//!
//! Sending is fire-and-forget; completion is observed by polling the
//! invocation at a fixed interval until it leaves the non-terminal states.
//! Each poll is cut off at the deadline, so a slow provider call cannot
//! stretch the wait past its bound.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::DecryptedCredential;
use crate::error::{Error, Result};
use crate::provider::{ComputeProvider, ProviderError};

pub use crate::provider::CommandStatus;

/// Outcome of a finished remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Provider command id.
    pub command_id: String,
    /// Terminal status.
    pub status: CommandStatus,
    /// Exit code, `-1` when the provider did not report one.
    pub exit_code: i32,
    /// Standard output, verbatim.
    pub stdout: String,
    /// Standard error, verbatim.
    pub stderr: String,
    /// Time spent waiting for completion.
    pub elapsed: Duration,
}

impl CommandResult {
    /// Finished with `success` and exit code 0.
    pub fn succeeded(&self) -> bool {
        self.status == CommandStatus::Success && self.exit_code == 0
    }

    /// Operator-facing description of a failed run.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!(
                "bootstrap command {} ended {} with exit code {}",
                self.command_id, self.status, self.exit_code
            )
        } else {
            format!(
                "bootstrap command {} ended {} with exit code {}: {}",
                self.command_id, self.status, self.exit_code, stderr
            )
        }
    }
}

/// Sends commands to instances and waits for them.
#[derive(Clone)]
pub struct CommandExecutor {
    provider: Arc<dyn ComputeProvider>,
    poll_interval: Duration,
}

impl CommandExecutor {
    /// Create an executor polling every `poll_interval`.
    pub fn new(provider: Arc<dyn ComputeProvider>, poll_interval: Duration) -> Self {
        Self {
            provider,
            poll_interval,
        }
    }

    /// Dispatch `command` and return its id without waiting.
    ///
    /// Sending again with the same `idempotency_token` yields the original
    /// command id.
    pub async fn send(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        instance_id: &str,
        command: &str,
        idempotency_token: &str,
    ) -> Result<String> {
        let command_id = self
            .provider
            .send_command(credential, region, instance_id, command, idempotency_token)
            .await?;
        info!(instance_id = %instance_id, command_id = %command_id, "Command sent");
        Ok(command_id)
    }

    /// Poll until the command reaches a terminal status.
    ///
    /// Transient polling errors, including an invocation that is not visible
    /// yet, are swallowed. Fails with [`Error::CommandTimeout`] once `timeout`
    /// has elapsed.
    pub async fn await_completion(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        instance_id: &str,
        command_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let poll = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = tokio::time::timeout(
                    remaining,
                    self.provider.get_command_invocation(credential, region, command_id, instance_id),
                ) => result,
            };
            let Ok(poll) = poll else {
                warn!(command_id = %command_id, "Invocation poll still pending at the deadline");
                return Err(Error::CommandTimeout {
                    command_id: command_id.to_string(),
                    waited: timeout,
                });
            };

            match poll {
                Ok(invocation) if invocation.status.is_terminal() => {
                    let result = CommandResult {
                        command_id: command_id.to_string(),
                        status: invocation.status,
                        exit_code: invocation.exit_code.unwrap_or(-1),
                        stdout: invocation.stdout,
                        stderr: invocation.stderr,
                        elapsed: started.elapsed(),
                    };
                    info!(
                        command_id = %command_id,
                        status = %result.status,
                        exit_code = result.exit_code,
                        elapsed_ms = result.elapsed.as_millis() as u64,
                        "Command finished"
                    );
                    return Ok(result);
                }
                Ok(invocation) => {
                    debug!(command_id = %command_id, status = %invocation.status, "Command still running");
                }
                Err(e @ (ProviderError::Transient(_) | ProviderError::NotFound(_))) => {
                    warn!(command_id = %command_id, error = %e, "Invocation poll failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::CommandTimeout {
                    command_id: command_id.to_string(),
                    waited: timeout,
                });
            }

            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use crate::provider::mock::InvocationStep;

    fn cred() -> DecryptedCredential {
        DecryptedCredential::new("c-1", "u-1", "AKIA1", "secret")
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_three_times_then_success() {
        let provider = Arc::new(MockProvider::new());
        provider
            .script_invocations([
                InvocationStep::status(CommandStatus::Pending),
                InvocationStep::status(CommandStatus::Pending),
                InvocationStep::status(CommandStatus::Pending),
                InvocationStep::finished(CommandStatus::Success, 0, "{\"ok\":true}", ""),
            ])
            .await;
        let executor = CommandExecutor::new(provider.clone(), Duration::from_secs(2));

        let result = executor
            .await_completion(
                &cred(),
                "us-east-1",
                "i-1",
                "cmd-1",
                Duration::from_secs(300),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert!(result.succeeded());
        assert_eq!(result.stdout, "{\"ok\":true}");
        // Three sleeps between four polls.
        assert_eq!(result.elapsed, Duration::from_secs(6));
        assert_eq!(provider.invocation_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_errors_are_swallowed() {
        let provider = Arc::new(MockProvider::new());
        provider
            .script_invocations([
                InvocationStep::NotFound,
                InvocationStep::Transient,
                InvocationStep::status(CommandStatus::InProgress),
                InvocationStep::finished(CommandStatus::Failed, 2, "", "no such file\n"),
            ])
            .await;
        let executor = CommandExecutor::new(provider, Duration::from_secs(2));

        let result = executor
            .await_completion(
                &cred(),
                "us-east-1",
                "i-1",
                "cmd-1",
                Duration::from_secs(300),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stderr, "no such file\n");
        assert!(!result.succeeded());
        assert!(result.diagnostic().contains("exit code 2: no such file"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout() {
        let provider = Arc::new(MockProvider::new());
        provider
            .script_invocations(
                std::iter::repeat_n(InvocationStep::status(CommandStatus::InProgress), 1000),
            )
            .await;
        let executor = CommandExecutor::new(provider, Duration::from_secs(2));

        let err = executor
            .await_completion(
                &cred(),
                "us-east-1",
                "i-1",
                "cmd-1",
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_poll_is_cut_off_at_deadline() {
        let provider = Arc::new({
            let mut provider = MockProvider::new();
            provider.poll_latency = Duration::from_secs(60);
            provider
        });
        let executor = CommandExecutor::new(provider, Duration::from_secs(2));
        let started = Instant::now();

        let err = executor
            .await_completion(
                &cred(),
                "us-east-1",
                "i-1",
                "cmd-1",
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert!(started.elapsed() <= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_send_records_command() {
        let provider = Arc::new(MockProvider::new());
        let executor = CommandExecutor::new(provider.clone(), Duration::from_millis(10));

        let id = executor
            .send(&cred(), "us-east-1", "i-7", "echo ready", "tok-7")
            .await
            .unwrap();

        let sent = provider.sent_commands().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command_id, id);
        assert_eq!(sent[0].instance_id, "i-7");
    }

    #[test]
    fn test_missing_exit_code_is_not_success() {
        let result = CommandResult {
            command_id: "cmd".to_string(),
            status: CommandStatus::Success,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
        };
        assert!(!result.succeeded());
    }
}
