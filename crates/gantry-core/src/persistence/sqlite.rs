// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

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

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The caller is responsible for running [`crate::migrations::run_sqlite`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::from_url(&url, 5).await
    }

    /// Connect to a `sqlite:` URL and run migrations.
    ///
    /// In-memory databases are per-connection, so `sqlite::memory:` should be
    /// opened with a single connection.
    pub async fn from_url(url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let mut options = SqlitePoolOptions::new().max_connections(max_connections);
        if url.contains(":memory:") {
            // Closing the last connection drops the database.
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn set_gateway_column(
        &self,
        sql: &'static str,
        gateway_id: &str,
        value: &str,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(sql)
            .bind(value)
            .bind(Utc::now())
            .bind(gateway_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::GatewayNotFound {
                gateway_id: gateway_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_gateway(&self, g: &NewGateway) -> Result<GatewayRecord, CoreError> {
        let now = Utc::now();
        sqlx::query_as::<_, GatewayRecord>(concat!(
            r#"
            INSERT INTO gateways (gateway_id, user_id, credential_id, provider, region, name,
                                  gateway_type, rpc_url, secret_hash, profile, instance_class,
                                  status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'initializing', ?, ?)
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
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            map_gateway_insert_error(e, g)
        })
    }

    async fn get_gateway(&self, gateway_id: &str) -> Result<Option<GatewayRecord>, CoreError> {
        let record = sqlx::query_as::<_, GatewayRecord>(concat!(
            "SELECT ",
            gateway_columns!(),
            " FROM gateways WHERE gateway_id = ?"
        ))
        .bind(gateway_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_gateway_by_name(&self, name: &str) -> Result<Option<GatewayRecord>, CoreError> {
        let record = sqlx::query_as::<_, GatewayRecord>(concat!(
            "SELECT ",
            gateway_columns!(),
            " FROM gateways WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn set_gateway_instance(
        &self,
        gateway_id: &str,
        instance_id: &str,
    ) -> Result<(), CoreError> {
        self.set_gateway_column(
            "UPDATE gateways SET instance_id = ?, updated_at = ? WHERE gateway_id = ?",
            gateway_id,
            instance_id,
        )
        .await
    }

    async fn set_gateway_job(&self, gateway_id: &str, job_id: &str) -> Result<(), CoreError> {
        self.set_gateway_column(
            "UPDATE gateways SET job_id = ?, updated_at = ? WHERE gateway_id = ?",
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
        self.set_gateway_column(
            "UPDATE gateways SET command_id = ?, updated_at = ? WHERE gateway_id = ?",
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
        let result = sqlx::query(
            r#"
            UPDATE gateways
            SET status = ?,
                error_status = COALESCE(?, error_status),
                bootstrap_output = COALESCE(?, bootstrap_output),
                updated_at = ?
            WHERE gateway_id = ? AND status = ?
            "#,
        )
        .bind(transition.target().as_str())
        .bind(transition.error_status())
        .bind(transition.bootstrap_output())
        .bind(Utc::now())
        .bind(gateway_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_credential(
        &self,
        c: &NewCredential,
    ) -> Result<CredentialRecord, CoreError> {
        let now = Utc::now();
        sqlx::query_as::<_, CredentialRecord>(concat!(
            r#"
            INSERT INTO credentials (credential_id, user_id, access_key_id, encrypted_secret,
                                     role_name, role_ref, profile_name, profile_ref,
                                     created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            map_insert_error("insert_credential", e, || {
                CoreError::CredentialAlreadyExists {
                    access_key_id: c.access_key_id.clone(),
                }
            })
        })
    }

    async fn get_credential(
        &self,
        credential_id: &str,
        user_id: &str,
    ) -> Result<Option<CredentialRecord>, CoreError> {
        let record = sqlx::query_as::<_, CredentialRecord>(concat!(
            "SELECT ",
            credential_columns!(),
            " FROM credentials WHERE credential_id = ? AND user_id = ?"
        ))
        .bind(credential_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_credential_by_access_key(
        &self,
        access_key_id: &str,
    ) -> Result<Option<CredentialRecord>, CoreError> {
        let record = sqlx::query_as::<_, CredentialRecord>(concat!(
            "SELECT ",
            credential_columns!(),
            " FROM credentials WHERE access_key_id = ?"
        ))
        .bind(access_key_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn upsert_instance_classes(
        &self,
        classes: &[NewInstanceClass],
    ) -> Result<u64, CoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for class in classes {
            let result = sqlx::query(
                r#"
                INSERT INTO instance_classes (instance_class, vcpus, memory_mib, architecture,
                                              synced_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (instance_class) DO UPDATE
                SET vcpus = excluded.vcpus, memory_mib = excluded.memory_mib,
                    architecture = excluded.architecture, synced_at = excluded.synced_at
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

    async fn get_instance_class(
        &self,
        instance_class: &str,
    ) -> Result<Option<InstanceClassRecord>, CoreError> {
        let record = sqlx::query_as::<_, InstanceClassRecord>(concat!(
            "SELECT ",
            instance_class_columns!(),
            " FROM instance_classes WHERE instance_class = ?"
        ))
        .bind(instance_class)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn count_instance_classes(&self) -> Result<i64, CoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instance_classes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn enqueue_job(&self, job: &NewJob) -> Result<JobRecord, CoreError> {
        let now = Utc::now();
        sqlx::query_as::<_, JobRecord>(concat!(
            r#"
            INSERT INTO jobs (job_id, kind, queue, unique_key, payload, state, attempts,
                              max_retry, timeout_secs, run_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?, ?)
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
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            map_insert_error("enqueue_job", e, || CoreError::JobAlreadyExists {
                unique_key: job.unique_key.clone().unwrap_or_else(|| job.job_id.clone()),
            })
        })
    }

    async fn claim_job(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, CoreError> {
        // SQLite serializes writers, so a single UPDATE ... RETURNING is atomic.
        let record = sqlx::query_as::<_, JobRecord>(concat!(
            r#"
            UPDATE jobs
            SET state = 'active',
                attempts = attempts + 1,
                lease_expires_at = ?,
                updated_at = ?
            WHERE job_id = (
                SELECT job_id FROM jobs
                WHERE queue = ?
                  AND ((state = 'pending' AND run_at <= ?)
                    OR (state = 'active' AND lease_expires_at <= ?))
                ORDER BY run_at, created_at
                LIMIT 1
            )
            RETURNING "#,
            job_columns!()
        ))
        .bind(lease_until)
        .bind(now)
        .bind(queue)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, CoreError> {
        let record = sqlx::query_as::<_, JobRecord>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE job_id = ?"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn complete_job(&self, job_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry_job(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', run_at = ?, lease_expires_at = NULL,
                last_error = ?, updated_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(run_at)
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::JobNotFound {
                job_id: job_id.to_string(),
            });
        }
        Ok(())
    }

    async fn archive_job(&self, job_id: &str, error: &str) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'archived', lease_expires_at = NULL, last_error = ?, updated_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::JobNotFound {
                job_id: job_id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_archived_jobs_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE state = 'archived' AND updated_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_jobs(&self, queue: Option<&str>, state: JobState) -> Result<i64, CoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = ? AND (? IS NULL OR queue = ?)")
                .bind(state.as_str())
                .bind(queue)
                .bind(queue)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn health_check_db(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
