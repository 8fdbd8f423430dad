// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Readiness waiter.
//!
//! Polls the provider until an instance is running with its management agent
//! attached. The wait is bounded by wall-clock time, including the provider
//! calls themselves; the poll interval grows by half each round up to a cap.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::DecryptedCredential;
use crate::error::{Error, Result};
use crate::provider::{ComputeProvider, ProviderError};

/// Polls instance state until it is operable.
#[derive(Clone)]
pub struct ReadinessWaiter {
    provider: Arc<dyn ComputeProvider>,
    initial_interval: Duration,
    max_interval: Duration,
}

impl ReadinessWaiter {
    /// Create a waiter polling every 2s, backing off to 15s.
    pub fn new(provider: Arc<dyn ComputeProvider>) -> Self {
        Self {
            provider,
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(15),
        }
    }

    /// Override the poll interval bounds.
    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max.max(initial);
        self
    }

    /// Wait until `instance_id` is running and remotely reachable.
    ///
    /// Transient provider errors inside the window are logged and retried.
    /// Terminal power states fail fast with [`Error::InstanceLost`].
    pub async fn await_ready(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        instance_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut interval = self.initial_interval;
        let mut polls = 0u32;

        loop {
            polls += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let describe = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = tokio::time::timeout(
                    remaining,
                    self.provider.describe_instance(credential, region, instance_id),
                ) => result,
            };
            let Ok(describe) = describe else {
                warn!(instance_id = %instance_id, "Describe still pending at the deadline");
                return Err(Error::ReadinessTimeout {
                    instance_id: instance_id.to_string(),
                    waited: timeout,
                });
            };

            match describe {
                Ok(description) if description.is_operable() => {
                    info!(
                        instance_id = %instance_id,
                        polls = polls,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Instance ready"
                    );
                    return Ok(());
                }
                Ok(description) if description.state.is_lost() => {
                    return Err(Error::InstanceLost {
                        instance_id: instance_id.to_string(),
                        state: format!("{:?}", description.state),
                    });
                }
                Ok(description) => {
                    debug!(
                        instance_id = %instance_id,
                        state = ?description.state,
                        agent_attached = description.agent_attached,
                        "Instance not ready yet"
                    );
                }
                // Freshly created instances can be invisible for a while.
                Err(e @ (ProviderError::Transient(_) | ProviderError::NotFound(_))) => {
                    warn!(instance_id = %instance_id, error = %e, "Describe failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ReadinessTimeout {
                    instance_id: instance_id.to_string(),
                    waited: timeout,
                });
            }

            let nap = interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
            interval = interval.mul_f64(1.5).min(self.max_interval);
        }
    }
}
