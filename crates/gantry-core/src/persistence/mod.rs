// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for gantry-core.
//!
//! This module defines the persistence abstraction and backend implementations.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::models::{
    CredentialRecord, GatewayRecord, InstanceClassRecord, JobRecord, JobState, NewCredential,
    NewGateway, NewInstanceClass, NewJob,
};
use crate::state::{GatewayStatus, Transition};

// Column lists shared by both backends. Macros so they can be `concat!`ed
// into static query strings.
macro_rules! gateway_columns {
    () => {
        "gateway_id, user_id, credential_id, provider, region, name, gateway_type, rpc_url, \
         secret_hash, profile, instance_class, status, error_status, instance_id, job_id, \
         command_id, bootstrap_output, created_at, updated_at"
    };
}

macro_rules! credential_columns {
    () => {
        "credential_id, user_id, access_key_id, encrypted_secret, role_name, role_ref, \
         profile_name, profile_ref, created_at, updated_at"
    };
}

macro_rules! job_columns {
    () => {
        "job_id, kind, queue, unique_key, payload, state, attempts, max_retry, timeout_secs, \
         run_at, lease_expires_at, last_error, created_at, updated_at"
    };
}

macro_rules! instance_class_columns {
    () => {
        "instance_class, vcpus, memory_mib, architecture, synced_at"
    };
}

pub(crate) use {credential_columns, gateway_columns, instance_class_columns, job_columns};

/// Durable storage for gateways, credentials and queued jobs.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Gateways
    // ------------------------------------------------------------------

    /// Insert a gateway in `initializing`.
    ///
    /// Fails with [`CoreError::GatewayAlreadyExists`] when the canonical name
    /// is taken.
    async fn insert_gateway(&self, gateway: &NewGateway) -> Result<GatewayRecord, CoreError>;

    async fn get_gateway(&self, gateway_id: &str) -> Result<Option<GatewayRecord>, CoreError>;

    async fn get_gateway_by_name(&self, name: &str) -> Result<Option<GatewayRecord>, CoreError>;

    async fn set_gateway_instance(
        &self,
        gateway_id: &str,
        instance_id: &str,
    ) -> Result<(), CoreError>;

    async fn set_gateway_job(&self, gateway_id: &str, job_id: &str) -> Result<(), CoreError>;

    /// Record the bootstrap command id so a redelivered job can resume it.
    async fn set_gateway_command(
        &self,
        gateway_id: &str,
        command_id: &str,
    ) -> Result<(), CoreError>;

    /// Write `transition` only if the stored status still equals `expected`.
    ///
    /// Returns `false` when another writer got there first. Does not validate
    /// the transition; use [`Persistence::apply_transition`].
    async fn compare_and_set_gateway_status(
        &self,
        gateway_id: &str,
        expected: GatewayStatus,
        transition: &Transition,
    ) -> Result<bool, CoreError>;

    /// Validate and persist a status transition.
    ///
    /// Two concurrent writers cannot both leave `initializing`: the loser sees
    /// [`CoreError::InvalidTransition`] carrying the status the winner wrote.
    async fn apply_transition(
        &self,
        gateway_id: &str,
        transition: &Transition,
    ) -> Result<GatewayStatus, CoreError> {
        let current = self
            .get_gateway(gateway_id)
            .await?
            .ok_or_else(|| CoreError::GatewayNotFound {
                gateway_id: gateway_id.to_string(),
            })?;
        let from = current.lifecycle()?;
        let to = from.apply(gateway_id, transition)?;

        if self
            .compare_and_set_gateway_status(gateway_id, from, transition)
            .await?
        {
            return Ok(to);
        }

        let latest = self
            .get_gateway(gateway_id)
            .await?
            .ok_or_else(|| CoreError::GatewayNotFound {
                gateway_id: gateway_id.to_string(),
            })?;
        tracing::debug!(
            gateway_id = %gateway_id,
            expected = %from,
            actual = %latest.status,
            "Status changed concurrently, transition rejected"
        );
        Err(CoreError::InvalidTransition {
            gateway_id: gateway_id.to_string(),
            from: latest.status,
            to: to.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    /// Store a credential. Access keys are unique across all users.
    async fn insert_credential(
        &self,
        credential: &NewCredential,
    ) -> Result<CredentialRecord, CoreError>;

    /// Fetch a credential owned by `user_id`. Other users' credentials are
    /// invisible.
    async fn get_credential(
        &self,
        credential_id: &str,
        user_id: &str,
    ) -> Result<Option<CredentialRecord>, CoreError>;

    async fn get_credential_by_access_key(
        &self,
        access_key_id: &str,
    ) -> Result<Option<CredentialRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Instance catalog
    // ------------------------------------------------------------------

    /// Insert or refresh catalog entries in one transaction. Returns the
    /// number of rows written.
    async fn upsert_instance_classes(
        &self,
        classes: &[NewInstanceClass],
    ) -> Result<u64, CoreError>;

    async fn get_instance_class(
        &self,
        instance_class: &str,
    ) -> Result<Option<InstanceClassRecord>, CoreError>;

    async fn count_instance_classes(&self) -> Result<i64, CoreError>;

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Enqueue a job in `pending`.
    ///
    /// Fails with [`CoreError::JobAlreadyExists`] while a pending or active
    /// job holds the same unique key.
    async fn enqueue_job(&self, job: &NewJob) -> Result<JobRecord, CoreError>;

    /// Atomically claim the oldest runnable job on `queue`.
    ///
    /// Runnable means pending with `run_at <= now`, or active with an expired
    /// lease (the previous worker died). Claiming bumps `attempts` and sets the
    /// lease to `lease_until`.
    async fn claim_job(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, CoreError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, CoreError>;

    /// Acknowledge success. The row is removed.
    async fn complete_job(&self, job_id: &str) -> Result<(), CoreError>;

    /// Put an active job back to pending until `run_at`.
    async fn retry_job(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), CoreError>;

    /// Move a job to the archive. It is never claimed again.
    async fn archive_job(&self, job_id: &str, error: &str) -> Result<(), CoreError>;

    /// Delete archived jobs last touched before `cutoff`. Returns the number
    /// removed.
    async fn delete_archived_jobs_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CoreError>;

    /// Count jobs in `state`, optionally limited to one queue.
    async fn count_jobs(&self, queue: Option<&str>, state: JobState) -> Result<i64, CoreError>;

    async fn health_check_db(&self) -> Result<(), CoreError>;
}

/// Map a unique violation to `on_conflict`, everything else to a database error.
pub(crate) fn map_insert_error(
    operation: &str,
    err: sqlx::Error,
    on_conflict: impl FnOnce() -> CoreError,
) -> CoreError {
    if crate::error::is_unique_violation(&err) {
        on_conflict()
    } else {
        CoreError::database(operation, err)
    }
}

/// Map a gateway insert failure. A taken name is `GatewayAlreadyExists`; a
/// credential id with no stored credential is `CredentialNotFound`.
pub(crate) fn map_gateway_insert_error(err: sqlx::Error, gateway: &NewGateway) -> CoreError {
    if crate::error::is_foreign_key_violation(&err) {
        return CoreError::CredentialNotFound {
            credential_id: gateway.credential_id.clone(),
        };
    }
    map_insert_error("insert_gateway", err, || CoreError::GatewayAlreadyExists {
        name: gateway.name.clone(),
    })
}
