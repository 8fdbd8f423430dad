// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gantry Core - durable state for the gateway provisioning pipeline.
//!
//! This crate owns everything that has to survive a process restart:
//!
//! - **Gateway records**: the source of truth for a gateway's lifecycle
//! - **Credential records**: cloud access keys, encrypted at rest by the caller
//! - **Job rows**: the durable queue substrate used by `gantry-pipeline` workers
//! - **Instance catalog**: the instance classes gateways may be created on
//!
//! # Gateway Status State Machine
//!
//! ```text
//!                ┌──────────────┐
//!                │ INITIALIZING │
//!                └──────┬───────┘
//!                       │
//!            ┌──────────┴──────────┐
//!   bootstrap│succeeded            │provisioning, readiness
//!            │                     │or bootstrap failed
//!            ▼                     ▼
//!      ┌──────────┐          ┌──────────┐
//!      │ RUNNING  │          │  FAILED  │
//!      └──────────┘          └──────────┘
//! ```
//!
//! Terminal states are never left. All writes go through
//! [`persistence::Persistence::apply_transition`], which validates the move
//! with [`state::GatewayStatus::apply`] and persists it as a compare-and-set
//! on the current status.
//!
//! # Backends
//!
//! | Backend | Type | Notes |
//! |---------|------|-------|
//! | PostgreSQL | [`persistence::PostgresPersistence`] | `FOR UPDATE SKIP LOCKED` job claims |
//! | SQLite | [`persistence::SqlitePersistence`] | single-statement job claims, used by tests |
//!
//! # Modules
//!
//! - [`error`]: Error types for persistence and state transitions
//! - [`migrations`]: Embedded schema migrations for both backends
//! - [`models`]: Gateway, credential, job and instance class records
//! - [`persistence`]: The [`Persistence`](persistence::Persistence) trait and backends
//! - [`slug`]: Canonical gateway name normalization
//! - [`state`]: Gateway lifecycle states and transitions

#![deny(missing_docs)]

/// Error types for core operations.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Persistent record types.
pub mod models;

/// Persistence trait and database backends.
pub mod persistence;

/// Gateway name slugification.
pub mod slug;

/// Gateway lifecycle state machine.
pub mod state;

pub use error::CoreError;
pub use persistence::Persistence;
pub use state::{GatewayStatus, Transition};
