// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment job handler.
//!
//! Drives a provisioned instance to a running gateway: resolve credentials,
//! wait for readiness, run the bootstrap command, and record the outcome on
//! the gateway record.
//!
//! Every step is safe to repeat. A redelivered job for a gateway that already
//! reached a terminal status is acknowledged without touching the instance,
//! and a bootstrap command that was already dispatched is resumed by id
//! rather than sent again. The send itself carries a token derived from the
//! gateway id, so a delivery that dies between sending and recording the
//! command id gets the same command back from the provider.
//!
//! A provider that ignores the token may still run the command twice, so
//! bootstrap scripts must tolerate being run again on the same instance.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::models::GatewayRecord;
use gantry_core::{CoreError, Persistence, Transition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::command::CommandExecutor;
use crate::config::{Config, DEFAULT_BOOTSTRAP_COMMAND};
use crate::credentials::{CredentialResolver, DecryptedCredential};
use crate::error::Result;
use crate::queue::{JobContext, JobError, JobHandler};
use crate::readiness::ReadinessWaiter;

/// Job kind for gateway deployments.
pub const DEPLOY_JOB_KIND: &str = "gateway:deploy";

/// Longest command output or diagnostic stored on a gateway, in bytes.
pub const MAX_RECORDED_OUTPUT: usize = 16 * 1024;

const TRUNCATED_MARKER: &str = "\n[output truncated]";

/// Deterministic idempotency token for a gateway's bootstrap command.
pub fn bootstrap_token(gateway_id: &str) -> String {
    let digest = Sha256::digest(format!("bootstrap:{}", gateway_id).as_bytes());
    format!("bs-{}", &hex::encode(digest)[..32])
}

/// Cut `text` to at most `max` bytes on a character boundary, marking the cut.
pub fn clip_output(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max.saturating_sub(TRUNCATED_MARKER.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], TRUNCATED_MARKER)
}

/// Payload of a deployment job.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeploymentJob {
    /// Gateway being deployed.
    pub gateway_id: String,
    /// Credential used to reach the provider.
    pub credential_id: String,
    /// Instance allocated during creation.
    pub instance_id: String,
    /// Owner of the gateway and credential.
    pub user_id: String,
    /// Provider region.
    pub region: String,
    /// Cleartext gateway secret for the bootstrap command.
    pub secret: String,
}

impl fmt::Debug for DeploymentJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentJob")
            .field("gateway_id", &self.gateway_id)
            .field("credential_id", &self.credential_id)
            .field("instance_id", &self.instance_id)
            .field("user_id", &self.user_id)
            .field("region", &self.region)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Wrap `value` in single quotes for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Values substituted into the bootstrap command.
#[derive(Clone, Copy)]
pub struct BootstrapParams<'a> {
    /// Gateway slug.
    pub name: &'a str,
    /// `ai` or `transcoding`.
    pub gateway_type: &'a str,
    /// Connection URL.
    pub rpc_url: &'a str,
    /// Output profile.
    pub profile: &'a str,
    /// Cleartext secret.
    pub secret: &'a str,
}

/// Bootstrap command template.
///
/// Placeholders are `{name}`, `{gateway_type}`, `{rpc_url}`, `{profile}` and
/// `{secret}`. Substitution is a single pass, so text inside a value is never
/// expanded again. Unknown placeholders are left as written.
#[derive(Debug, Clone)]
pub struct BootstrapTemplate {
    template: String,
}

impl Default for BootstrapTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_BOOTSTRAP_COMMAND)
    }
}

impl BootstrapTemplate {
    /// Wrap a template string.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Render with every value shell-quoted. The result holds the secret.
    pub fn render(&self, params: &BootstrapParams<'_>) -> Zeroizing<String> {
        let mut out = Zeroizing::new(String::with_capacity(self.template.len() + 128));
        let mut rest = self.template.as_str();

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let value = after.find('}').and_then(|close| {
                let value = match &after[..close] {
                    "name" => params.name,
                    "gateway_type" => params.gateway_type,
                    "rpc_url" => params.rpc_url,
                    "profile" => params.profile,
                    "secret" => params.secret,
                    _ => return None,
                };
                Some((value, close))
            });

            match value {
                Some((value, close)) => {
                    out.push_str(&shell_quote(value));
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Bounds and template for deployments.
#[derive(Debug, Clone)]
pub struct DeploySettings {
    /// How long to wait for the instance.
    pub readiness_timeout: Duration,
    /// How long to wait for the bootstrap command.
    pub command_timeout: Duration,
    /// Bootstrap command template.
    pub bootstrap: BootstrapTemplate,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(240),
            command_timeout: Duration::from_secs(300),
            bootstrap: BootstrapTemplate::default(),
        }
    }
}

impl DeploySettings {
    /// Take bounds and template from the pipeline config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            readiness_timeout: config.readiness_timeout,
            command_timeout: config.command_timeout,
            bootstrap: BootstrapTemplate::new(config.bootstrap_command.clone()),
        }
    }
}

/// Handles [`DEPLOY_JOB_KIND`] jobs.
pub struct DeployHandler {
    persistence: Arc<dyn Persistence>,
    resolver: CredentialResolver,
    readiness: ReadinessWaiter,
    executor: CommandExecutor,
    settings: DeploySettings,
}

impl DeployHandler {
    /// Create a handler from its collaborators.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        resolver: CredentialResolver,
        readiness: ReadinessWaiter,
        executor: CommandExecutor,
        settings: DeploySettings,
    ) -> Self {
        Self {
            persistence,
            resolver,
            readiness,
            executor,
            settings,
        }
    }

    /// Run one deployment attempt.
    pub async fn deploy(&self, ctx: &JobContext, job: &DeploymentJob) -> Result<()> {
        let gateway = self
            .persistence
            .get_gateway(&job.gateway_id)
            .await?
            .ok_or_else(|| CoreError::GatewayNotFound {
                gateway_id: job.gateway_id.clone(),
            })?;

        let status = gateway.lifecycle()?;
        if status.is_terminal() {
            info!(
                gateway_id = %job.gateway_id,
                status = %status,
                "Gateway already settled, acknowledging redelivery"
            );
            return Ok(());
        }

        let credential = self
            .resolver
            .resolve(&job.credential_id, &job.user_id)
            .await?;

        self.readiness
            .await_ready(
                &credential,
                &job.region,
                &job.instance_id,
                self.settings.readiness_timeout,
                &ctx.cancel,
            )
            .await?;

        let command_id = self.dispatch(&gateway, &credential, job).await?;

        let result = self
            .executor
            .await_completion(
                &credential,
                &job.region,
                &job.instance_id,
                &command_id,
                self.settings.command_timeout,
                &ctx.cancel,
            )
            .await?;

        let transition = if result.succeeded() {
            Transition::Running {
                bootstrap_output: Some(clip_output(&result.stdout, MAX_RECORDED_OUTPUT)),
            }
        } else {
            Transition::failed(clip_output(&result.diagnostic(), MAX_RECORDED_OUTPUT))
        };

        match self
            .persistence
            .apply_transition(&job.gateway_id, &transition)
            .await
        {
            Ok(status) => {
                info!(
                    gateway_id = %job.gateway_id,
                    status = %status,
                    command_id = %command_id,
                    exit_code = result.exit_code,
                    "Gateway deployment finished"
                );
                Ok(())
            }
            Err(CoreError::InvalidTransition { from, .. }) => {
                info!(
                    gateway_id = %job.gateway_id,
                    status = %from,
                    "Gateway settled concurrently, keeping recorded status"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send the bootstrap command, or pick up the one sent by an earlier
    /// delivery.
    async fn dispatch(
        &self,
        gateway: &GatewayRecord,
        credential: &DecryptedCredential,
        job: &DeploymentJob,
    ) -> Result<String> {
        if let Some(command_id) = &gateway.command_id {
            info!(
                gateway_id = %gateway.gateway_id,
                command_id = %command_id,
                "Resuming bootstrap command from earlier delivery"
            );
            return Ok(command_id.clone());
        }

        let command = self.settings.bootstrap.render(&BootstrapParams {
            name: &gateway.name,
            gateway_type: &gateway.gateway_type,
            rpc_url: &gateway.rpc_url,
            profile: &gateway.profile,
            secret: &job.secret,
        });

        let command_id = self
            .executor
            .send(
                credential,
                &job.region,
                &job.instance_id,
                &command,
                &bootstrap_token(&gateway.gateway_id),
            )
            .await?;
        self.persistence
            .set_gateway_command(&gateway.gateway_id, &command_id)
            .await?;
        Ok(command_id)
    }

    async fn mark_failed(&self, gateway_id: &str, message: &str) {
        match self
            .persistence
            .apply_transition(gateway_id, &Transition::failed(message))
            .await
        {
            Ok(_) => {
                warn!(gateway_id = %gateway_id, error = %message, "Gateway marked failed");
            }
            Err(CoreError::InvalidTransition { from, .. }) => {
                debug!(gateway_id = %gateway_id, status = %from, "Gateway already settled");
            }
            Err(CoreError::GatewayNotFound { .. }) => {
                warn!(gateway_id = %gateway_id, "Gateway vanished before failure was recorded");
            }
            Err(e) => {
                error!(gateway_id = %gateway_id, error = %e, "Failed to record gateway failure");
            }
        }
    }
}

fn decode(payload: &[u8]) -> std::result::Result<DeploymentJob, JobError> {
    serde_json::from_slice(payload)
        .map_err(|e| JobError::skip_retry(format!("malformed deployment payload: {}", e)))
}

#[async_trait]
impl JobHandler for DeployHandler {
    fn kind(&self) -> &'static str {
        DEPLOY_JOB_KIND
    }

    async fn handle(&self, ctx: &JobContext, payload: &[u8]) -> std::result::Result<(), JobError> {
        let job = decode(payload)?;
        debug!(
            gateway_id = %job.gateway_id,
            instance_id = %job.instance_id,
            attempt = ctx.attempt,
            "Deployment attempt started"
        );
        self.deploy(ctx, &job).await.map_err(JobError::from)
    }

    async fn on_exhausted(&self, ctx: &JobContext, payload: &[u8], error: &str) {
        let Ok(job) = decode(payload) else {
            error!(job_id = %ctx.job_id, "Archived deployment has an unreadable payload");
            return;
        };
        self.mark_failed(&job.gateway_id, error).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params<'a>(name: &'a str, secret: &'a str) -> BootstrapParams<'a> {
        BootstrapParams {
            name,
            gateway_type: "ai",
            rpc_url: "https://rpc.example.org",
            profile: "720p",
            secret,
        }
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_render_default_template() {
        let rendered = BootstrapTemplate::default().render(&params("my-gateway", "s3cr3t pass"));
        assert_eq!(
            rendered.as_str(),
            "gantry-gateway install --name 'my-gateway' --type 'ai' \
             --rpc-url 'https://rpc.example.org' --profile '720p' --secret 's3cr3t pass'"
        );
    }

    #[test]
    fn test_render_is_single_pass() {
        let template = BootstrapTemplate::new("run {name} {secret} {unknown} {");
        let rendered = template.render(&params("{secret}", "x'y"));
        assert_eq!(rendered.as_str(), r"run '{secret}' 'x'\''y' {unknown} {");
    }

    #[test]
    fn test_bootstrap_token_is_per_gateway() {
        let a = bootstrap_token("gw-1");
        assert_eq!(a, bootstrap_token("gw-1"));
        assert_ne!(a, bootstrap_token("gw-2"));
        assert_ne!(a, crate::provisioner::idempotency_token("gw-1"));
        assert!(a.starts_with("bs-"));
    }

    #[test]
    fn test_clip_output() {
        assert_eq!(clip_output("short", 64), "short");

        let clipped = clip_output(&"x".repeat(1000), 64);
        assert_eq!(clipped.len(), 64);
        assert!(clipped.ends_with("[output truncated]"));

        // Never splits a multi-byte character.
        let clipped = clip_output(&"é".repeat(100), 41);
        assert!(clipped.len() <= 41);
        assert!(clipped.starts_with("éé"));
    }

    #[test]
    fn test_payload_debug_redacts_secret() {
        let job = DeploymentJob {
            gateway_id: "gw".into(),
            credential_id: "c".into(),
            instance_id: "i".into(),
            user_id: "u".into(),
            region: "us-east-1".into(),
            secret: "hunter22".into(),
        };
        assert!(!format!("{:?}", job).contains("hunter22"));
    }

    #[test]
    fn test_malformed_payload_skips_retry() {
        let err = decode(b"not json").unwrap_err();
        assert!(err.is_skip_retry());
    }
}
