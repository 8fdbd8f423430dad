// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gateway lifecycle state machine.
//!
//! A gateway starts in [`GatewayStatus::Initializing`] and moves exactly once
//! to either [`GatewayStatus::Running`] or [`GatewayStatus::Failed`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Lifecycle status of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    /// Record created; instance provisioning or bootstrap still in progress.
    Initializing,
    /// Bootstrap command completed successfully.
    Running,
    /// Provisioning, readiness or bootstrap failed.
    Failed,
}

impl GatewayStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Running | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(&self, next: GatewayStatus) -> bool {
        matches!(
            (self, next),
            (Self::Initializing, Self::Running) | (Self::Initializing, Self::Failed)
        )
    }

    /// Validate a transition and return the resulting status.
    ///
    /// This is the only place that decides whether a status change is legal;
    /// [`Persistence::apply_transition`](crate::persistence::Persistence::apply_transition)
    /// calls it before writing.
    pub fn apply(self, gateway_id: &str, transition: &Transition) -> Result<GatewayStatus> {
        let target = transition.target();
        if !self.can_transition_to(target) {
            return Err(CoreError::InvalidTransition {
                gateway_id: gateway_id.to_string(),
                from: self.to_string(),
                to: target.to_string(),
            });
        }

        if let Transition::Failed { error } = transition
            && error.trim().is_empty()
        {
            return Err(CoreError::ValidationError {
                field: "error_status".to_string(),
                message: "failed transition requires a diagnostic message".to_string(),
            });
        }

        Ok(target)
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("unknown gateway status '{}'", other),
            }),
        }
    }
}

/// A requested status change together with its side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Bootstrap succeeded.
    Running {
        /// Captured stdout of the bootstrap command.
        bootstrap_output: Option<String>,
    },
    /// A terminal provisioning or execution failure.
    Failed {
        /// Operator-facing diagnostic, stored in `error_status`.
        error: String,
    },
}

impl Transition {
    /// Shorthand for a failure transition.
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    /// Status this transition moves the gateway to.
    pub fn target(&self) -> GatewayStatus {
        match self {
            Self::Running { .. } => GatewayStatus::Running,
            Self::Failed { .. } => GatewayStatus::Failed,
        }
    }

    /// Value written to `error_status`.
    pub fn error_status(&self) -> Option<&str> {
        match self {
            Self::Failed { error } => Some(error.as_str()),
            Self::Running { .. } => None,
        }
    }

    /// Value written to `bootstrap_output`.
    pub fn bootstrap_output(&self) -> Option<&str> {
        match self {
            Self::Running { bootstrap_output } => bootstrap_output.as_deref(),
            Self::Failed { .. } => None,
        }
    }
}
