// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gantry Pipeline - Gateway Provisioning
//!
//! This crate takes a request to stand up a gateway (a virtual machine
//! running a configured workload) and drives it to a running state:
//! credentials are resolved, an instance is allocated, a deployment job is
//! queued durably, and a worker waits for the instance, runs the bootstrap
//! command and records the outcome on the gateway.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     HTTP front door (external)                        │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │ create_gateway / gateway_status
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         GatewayService                                │
//! │ validate → catalog → credentials → slug → insert → provision → enqueue│
//! └──────────────────────────────────────────────────────────────────────┘
//!           │                                      │
//!           │ sealed DeploymentJob                 │ create_instance
//!           ▼                                      ▼
//! ┌───────────────────┐   claim/lease   ┌───────────────────────────────┐
//! │  jobs (durable)   │◄────────────────│          WorkerPool           │
//! │ critical/default/ │                 │  DeployHandler:               │
//! │       low         │                 │   readiness → bootstrap →     │
//! └───────────────────┘                 │   running | failed            │
//!                                       └───────────────────────────────┘
//!                                                      │
//!                                                      ▼
//!                                        ┌───────────────────────────┐
//!                                        │     ComputeProvider       │
//!                                        │  (HTTP backend or mock)   │
//!                                        └───────────────────────────┘
//! ```
//!
//! # Failure Handling
//!
//! | Failure | Where | Outcome |
//! |---------|-------|---------|
//! | Validation, unknown instance class, duplicate name | creation | error, nothing written |
//! | Unknown or foreign credential | creation | not found, nothing written |
//! | No image, provider rejection | creation | gateway `failed`, error returned, no job |
//! | Throttling, 5xx, database hiccups | worker | retried with backoff |
//! | Readiness or command timeout, lost instance | worker | gateway `failed`, job archived |
//! | Retries exhausted | worker | gateway `failed`, job archived |
//! | Bootstrap exits non-zero | worker | gateway `failed` with stderr |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `GANTRY_DATABASE_URL` | Yes | - | `postgres://...` or `sqlite:...` |
//! | `GANTRY_ENCRYPTION_KEY` | Yes | - | 32-byte key for secrets and job payloads |
//! | `GANTRY_PROVIDER_ENDPOINT` | Yes (binary) | - | Compute provider API base URL |
//! | `GANTRY_WORKER_CONCURRENCY` | No | `10` | Worker tasks |
//! | `GANTRY_JOB_MAX_RETRY` | No | `2` | Retries after the first attempt |
//! | `GANTRY_JOB_TIMEOUT_SECS` | No | `600` | Per-attempt job timeout, at least readiness plus command |
//! | `GANTRY_READINESS_TIMEOUT_SECS` | No | `240` | Instance readiness bound |
//! | `GANTRY_COMMAND_TIMEOUT_SECS` | No | `300` | Bootstrap command bound |
//! | `GANTRY_COMMAND_POLL_INTERVAL_MS` | No | `2000` | Command status poll interval |
//! | `GANTRY_QUEUE_POLL_INTERVAL_MS` | No | `1000` | Idle queue poll interval |
//! | `GANTRY_BOOTSTRAP_COMMAND` | No | built-in | Bootstrap command template |
//! | `GANTRY_SECRET_HASH_COST` | No | `12` | bcrypt cost |
//! | `GANTRY_JOB_RETENTION_HOURS` | No | `168` | Archived job retention |
//! | `GANTRY_DEFAULT_INSTANCE_CLASS` | No | `t3.xlarge` | Instance class fallback |
//! | `GANTRY_CATALOG_ACCESS_KEY_ID` | No | - | Keys for the catalog refresh, set with the secret |
//! | `GANTRY_CATALOG_SECRET_ACCESS_KEY` | No | - | Secret for the catalog refresh |
//! | `GANTRY_CATALOG_REGION` | No | `us-east-1` | Region the catalog is read from |
//! | `GANTRY_CATALOG_SYNC_HOURS` | No | `24` | Catalog refresh interval |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`crypto`]: AES-256-GCM secret cipher
//! - [`credentials`]: Credential resolution and registration
//! - [`provider`]: Compute provider trait with HTTP and mock backends
//! - [`catalog`]: Instance class catalog and creation-time lookup
//! - [`provisioner`]: Image selection and idempotent instance creation
//! - [`readiness`]: Instance readiness polling
//! - [`command`]: Remote command execution
//! - [`queue`]: Durable job queue and worker pool
//! - [`deploy`]: Deployment job handler
//! - [`gateway`]: Gateway creation flow and status surface
//! - [`job_cleanup_worker`]: Archived job pruning
//! - [`catalog_sync_worker`]: Periodic instance catalog refresh
//! - [`runtime`]: Embeddable runtime

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Symmetric encryption for stored secrets.
pub mod crypto;

/// Error types for pipeline operations.
pub mod error;

/// Credential resolution and registration.
pub mod credentials;

/// Compute provider capability trait and backends.
pub mod provider;

/// Instance class catalog.
pub mod catalog;

/// Instance provisioning.
pub mod provisioner;

/// Instance readiness polling.
pub mod readiness;

/// Remote command execution.
pub mod command;

/// Durable job queue and worker pool.
pub mod queue;

/// Deployment job handler.
pub mod deploy;

/// Gateway creation and status.
pub mod gateway;

/// Background worker for pruning archived jobs.
pub mod job_cleanup_worker;

/// Background worker for refreshing the instance catalog.
pub mod catalog_sync_worker;

/// Embeddable runtime.
pub mod runtime;

pub use error::{Error, ErrorClass, Result};
