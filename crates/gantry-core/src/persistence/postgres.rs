// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Job claims use `FOR UPDATE SKIP LOCKED` so any number of worker processes
//! can poll the same queue without handing one job to two workers.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::CoreError;
use crate::models::{
    CredentialRecord, GatewayRecord, InstanceClassRecord, JobRecord, JobState, NewCredential,
    NewGateway, NewInstanceClass, NewJob,
};
use crate::state::{GatewayStatus, Transition};

use super::{
    Persistence, credential_columns, gateway_columns, instance_class_columns, job_columns,
    map_gateway_insert_error, map_insert_error,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and run migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::database("connect", e))?;

        crate::migrations::run_postgres(&pool)
            .await
            .map_err(|e| CoreError::database("migrate", e))?;

        Ok(Self { pool })
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Gateway Operations
// ============================================================================

/// Insert a new gateway in `initializing`.
pub async fn insert_gateway(pool: &PgPool, g: &NewGateway) -> Result<GatewayRecord, CoreError> {
    let now = Utc::now();
    sqlx::query_as::<_, GatewayRecord>(concat!(
        r#"
        INSERT INTO gateways (gateway_id, user_id, credential_id, provider, region, name,
                              gateway_type, rpc_url, secret_hash, profile, instance_class,
                              status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'initializing', $12, $12)
        RETURNING "#,
        gateway_columns!()
    ))
    .bind(&g.gateway_id)
    .bind(&g.user_id)
    .bind(&g.credential_id)
    .bind(&g.provider)
    .bind(&g.region)
    .bind(&g.name)
    .bind(&g.gateway_type)
    .bind(&g.rpc_url)
    .bind(&g.secret_hash)
    .bind(&g.profile)
    .bind(&g.instance_class)
    .bind(now)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        map_gateway_insert_error(e, g)
    })
}

/// Get a gateway by ID.
pub async fn get_gateway(
    pool: &PgPool,
    gateway_id: &str,
) -> Result<Option<GatewayRecord>, CoreError> {
    let record = sqlx::query_as::<_, GatewayRecord>(concat!(
        "SELECT ",
        gateway_columns!(),
        " FROM gateways WHERE gateway_id = $1"
    ))
    .bind(gateway_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Get a gateway by canonical name.
pub async fn get_gateway_by_name(
    pool: &PgPool,
    name: &str,
) -> Result<Option<GatewayRecord>, CoreError> {
    let record = sqlx::query_as::<_, GatewayRecord>(concat!(
        "SELECT ",
        gateway_columns!(),
        " FROM gateways WHERE name = $1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Set one nullable reference column on a gateway.
async fn set_gateway_column(
    pool: &PgPool,
    sql: &'static str,
    gateway_id: &str,
    value: &str,
) -> Result<(), CoreError> {
    let result = sqlx::query(sql)
        .bind(value)
        .bind(Utc::now())
        .bind(gateway_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::GatewayNotFound {
            gateway_id: gateway_id.to_string(),
        });
    }
    Ok(())
}

/// Compare-and-set the gateway status.
pub async fn compare_and_set_gateway_status(
    pool: &PgPool,
    gateway_id: &str,
    expected: GatewayStatus,
    transition: &Transition,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE gateways
        SET status = $1,
            error_status = COALESCE($2, error_status),
            bootstrap_output = COALESCE($3, bootstrap_output),
            updated_at = $4
        WHERE gateway_id = $5 AND status = $6
        "#,
    )
    .bind(transition.target().as_str())
    .bind(transition.error_status())
    .bind(transition.bootstrap_output())
    .bind(Utc::now())
    .bind(gateway_id)
    .bind(expected.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

// ============================================================================
// Credential Operations
// ============================================================================

/// Insert a credential.
pub async fn insert_credential(
    pool: &PgPool,
    c: &NewCredential,
) -> Result<CredentialRecord, CoreError> {
    let now = Utc::now();
    sqlx::query_as::<_, CredentialRecord>(concat!(
        r#"
        INSERT INTO credentials (credential_id, user_id, access_key_id, encrypted_secret,
                                 role_name, role_ref, profile_name, profile_ref,
                                 created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
        RETURNING "#,
        credential_columns!()
    ))
    .bind(&c.credential_id)
    .bind(&c.user_id)
    .bind(&c.access_key_id)
    .bind(&c.encrypted_secret)
    .bind(&c.role_name)
    .bind(&c.role_ref)
    .bind(&c.profile_name)
    .bind(&c.profile_ref)
    .bind(now)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        map_insert_error("insert_credential", e, || {
            CoreError::CredentialAlreadyExists {
                access_key_id: c.access_key_id.clone(),
            }
        })
    })
}

/// Get a credential scoped to its owner.
pub async fn get_credential(
    pool: &PgPool,
    credential_id: &str,
    user_id: &str,
) -> Result<Option<CredentialRecord>, CoreError> {
    let record = sqlx::query_as::<_, CredentialRecord>(concat!(
        "SELECT ",
        credential_columns!(),
        " FROM credentials WHERE credential_id = $1 AND user_id = $2"
    ))
    .bind(credential_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Get a credential by access key.
pub async fn get_credential_by_access_key(
    pool: &PgPool,
    access_key_id: &str,
) -> Result<Option<CredentialRecord>, CoreError> {
    let record = sqlx::query_as::<_, CredentialRecord>(concat!(
        "SELECT ",
        credential_columns!(),
        " FROM credentials WHERE access_key_id = $1"
    ))
    .bind(access_key_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

// ============================================================================
// Instance Catalog Operations
// ============================================================================

/// Insert or refresh catalog entries in one transaction.
pub async fn upsert_instance_classes(
    pool: &PgPool,
    classes: &[NewInstanceClass],
) -> Result<u64, CoreError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let mut written = 0;
    for class in classes {
        let result = sqlx::query(
            r#"
            INSERT INTO instance_classes (instance_class, vcpus, memory_mib, architecture,
                                          synced_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (instance_class) DO UPDATE
            SET vcpus = EXCLUDED.vcpus, memory_mib = EXCLUDED.memory_mib,
                architecture = EXCLUDED.architecture, synced_at = EXCLUDED.synced_at
            "#,
        )
        .bind(&class.instance_class)
        .bind(class.vcpus)
        .bind(class.memory_mib)
        .bind(&class.architecture)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        written += result.rows_affected();
    }
    tx.commit().await?;
    Ok(written)
}

/// Look up one catalog entry.
pub async fn get_instance_class(
    pool: &PgPool,
    instance_class: &str,
) -> Result<Option<InstanceClassRecord>, CoreError> {
    let record = sqlx::query_as::<_, InstanceClassRecord>(concat!(
        "SELECT ",
        instance_class_columns!(),
        " FROM instance_classes WHERE instance_class = $1"
    ))
    .bind(instance_class)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Number of catalog entries.
pub async fn count_instance_classes(pool: &PgPool) -> Result<i64, CoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instance_classes")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ============================================================================
// Job Operations
// ============================================================================

/// Enqueue a job.
pub async fn enqueue_job(pool: &PgPool, job: &NewJob) -> Result<JobRecord, CoreError> {
    let now = Utc::now();
    sqlx::query_as::<_, JobRecord>(concat!(
        r#"
        INSERT INTO jobs (job_id, kind, queue, unique_key, payload, state, attempts,
                          max_retry, timeout_secs, run_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $8, $9, $9)
        RETURNING "#,
        job_columns!()
    ))
    .bind(&job.job_id)
    .bind(&job.kind)
    .bind(&job.queue)
    .bind(&job.unique_key)
    .bind(&job.payload)
    .bind(job.max_retry)
    .bind(job.timeout_secs)
    .bind(job.run_at)
    .bind(now)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        map_insert_error("enqueue_job", e, || CoreError::JobAlreadyExists {
            unique_key: job.unique_key.clone().unwrap_or_else(|| job.job_id.clone()),
        })
    })
}

/// Claim the oldest runnable job on a queue.
pub async fn claim_job(
    pool: &PgPool,
    queue: &str,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
) -> Result<Option<JobRecord>, CoreError> {
    let record = sqlx::query_as::<_, JobRecord>(concat!(
        r#"
        UPDATE jobs
        SET state = 'active',
            attempts = attempts + 1,
            lease_expires_at = $2,
            updated_at = $3
        WHERE job_id = (
            SELECT job_id FROM jobs
            WHERE queue = $1
              AND ((state = 'pending' AND run_at <= $3)
                OR (state = 'active' AND lease_expires_at <= $3))
            ORDER BY run_at, created_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING "#,
        job_columns!()
    ))
    .bind(queue)
    .bind(lease_until)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Get a job by ID.
pub async fn get_job(pool: &PgPool, job_id: &str) -> Result<Option<JobRecord>, CoreError> {
    let record = sqlx::query_as::<_, JobRecord>(concat!(
        "SELECT ",
        job_columns!(),
        " FROM jobs WHERE job_id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Delete a finished job.
pub async fn complete_job(pool: &PgPool, job_id: &str) -> Result<(), CoreError> {
    sqlx::query("DELETE FROM jobs WHERE job_id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Reschedule a job.
pub async fn retry_job(
    pool: &PgPool,
    job_id: &str,
    run_at: DateTime<Utc>,
    error: &str,
) -> Result<(), CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET state = 'pending', run_at = $2, lease_expires_at = NULL,
            last_error = $3, updated_at = $4
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(run_at)
    .bind(error)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::JobNotFound {
            job_id: job_id.to_string(),
        });
    }
    Ok(())
}

/// Archive a job.
pub async fn archive_job(pool: &PgPool, job_id: &str, error: &str) -> Result<(), CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET state = 'archived', lease_expires_at = NULL, last_error = $2, updated_at = $3
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(error)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::JobNotFound {
            job_id: job_id.to_string(),
        });
    }
    Ok(())
}

/// Delete archived jobs older than a cutoff.
pub async fn delete_archived_jobs_older_than(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, CoreError> {
    let result = sqlx::query("DELETE FROM jobs WHERE state = 'archived' AND updated_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Count jobs by state.
pub async fn count_jobs(
    pool: &PgPool,
    queue: Option<&str>,
    state: JobState,
) -> Result<i64, CoreError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE state = $1 AND ($2::text IS NULL OR queue = $2)",
    )
    .bind(state.as_str())
    .bind(queue)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_gateway(&self, gateway: &NewGateway) -> Result<GatewayRecord, CoreError> {
        insert_gateway(&self.pool, gateway).await
    }

    async fn get_gateway(&self, gateway_id: &str) -> Result<Option<GatewayRecord>, CoreError> {
        get_gateway(&self.pool, gateway_id).await
    }

    async fn get_gateway_by_name(&self, name: &str) -> Result<Option<GatewayRecord>, CoreError> {
        get_gateway_by_name(&self.pool, name).await
    }

    async fn set_gateway_instance(
        &self,
        gateway_id: &str,
        instance_id: &str,
    ) -> Result<(), CoreError> {
        set_gateway_column(
            &self.pool,
            "UPDATE gateways SET instance_id = $1, updated_at = $2 WHERE gateway_id = $3",
            gateway_id,
            instance_id,
        )
        .await
    }

    async fn set_gateway_job(&self, gateway_id: &str, job_id: &str) -> Result<(), CoreError> {
        set_gateway_column(
            &self.pool,
            "UPDATE gateways SET job_id = $1, updated_at = $2 WHERE gateway_id = $3",
            gateway_id,
            job_id,
        )
        .await
    }

    async fn set_gateway_command(
        &self,
        gateway_id: &str,
        command_id: &str,
    ) -> Result<(), CoreError> {
        set_gateway_column(
            &self.pool,
            "UPDATE gateways SET command_id = $1, updated_at = $2 WHERE gateway_id = $3",
            gateway_id,
            command_id,
        )
        .await
    }

    async fn compare_and_set_gateway_status(
        &self,
        gateway_id: &str,
        expected: GatewayStatus,
        transition: &Transition,
    ) -> Result<bool, CoreError> {
        compare_and_set_gateway_status(&self.pool, gateway_id, expected, transition).await
    }

    async fn insert_credential(
        &self,
        credential: &NewCredential,
    ) -> Result<CredentialRecord, CoreError> {
        insert_credential(&self.pool, credential).await
    }

    async fn get_credential(
        &self,
        credential_id: &str,
        user_id: &str,
    ) -> Result<Option<CredentialRecord>, CoreError> {
        get_credential(&self.pool, credential_id, user_id).await
    }

    async fn get_credential_by_access_key(
        &self,
        access_key_id: &str,
    ) -> Result<Option<CredentialRecord>, CoreError> {
        get_credential_by_access_key(&self.pool, access_key_id).await
    }

    async fn upsert_instance_classes(
        &self,
        classes: &[NewInstanceClass],
    ) -> Result<u64, CoreError> {
        upsert_instance_classes(&self.pool, classes).await
    }

    async fn get_instance_class(
        &self,
        instance_class: &str,
    ) -> Result<Option<InstanceClassRecord>, CoreError> {
        get_instance_class(&self.pool, instance_class).await
    }

    async fn count_instance_classes(&self) -> Result<i64, CoreError> {
        count_instance_classes(&self.pool).await
    }

    async fn enqueue_job(&self, job: &NewJob) -> Result<JobRecord, CoreError> {
        enqueue_job(&self.pool, job).await
    }

    async fn claim_job(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, CoreError> {
        claim_job(&self.pool, queue, now, lease_until).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, CoreError> {
        get_job(&self.pool, job_id).await
    }

    async fn complete_job(&self, job_id: &str) -> Result<(), CoreError> {
        complete_job(&self.pool, job_id).await
    }

    async fn retry_job(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), CoreError> {
        retry_job(&self.pool, job_id, run_at, error).await
    }

    async fn archive_job(&self, job_id: &str, error: &str) -> Result<(), CoreError> {
        archive_job(&self.pool, job_id, error).await
    }

    async fn delete_archived_jobs_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        delete_archived_jobs_older_than(&self.pool, cutoff).await
    }

    async fn count_jobs(&self, queue: Option<&str>, state: JobState) -> Result<i64, CoreError> {
        count_jobs(&self.pool, queue, state).await
    }

    async fn health_check_db(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
