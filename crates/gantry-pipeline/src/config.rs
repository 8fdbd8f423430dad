// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for gantry-pipeline.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::crypto::KEY_LEN;

/// Bootstrap command used when `GANTRY_BOOTSTRAP_COMMAND` is unset.
pub const DEFAULT_BOOTSTRAP_COMMAND: &str = "gantry-gateway install --name {name} \
     --type {gateway_type} --rpc-url {rpc_url} --profile {profile} --secret {secret}";

/// Instance class used when a creation request does not pick one.
pub const DEFAULT_INSTANCE_CLASS: &str = "t3.xlarge";

/// Region the instance catalog is read from by default.
pub const DEFAULT_CATALOG_REGION: &str = "us-east-1";

/// Access keys used to read the provider's instance class listing.
#[derive(Clone)]
pub struct CatalogCredentials {
    /// Access key identifier.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: Zeroizing<String>,
}

impl fmt::Debug for CatalogCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Pipeline configuration loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Database URL (`postgres://...` or `sqlite:...`)
    pub database_url: String,
    /// Symmetric key for credential secrets and job payloads. Exactly 32 bytes.
    pub encryption_key: Zeroizing<Vec<u8>>,
    /// Base URL of the compute provider API
    pub provider_endpoint: Option<String>,
    /// Number of worker tasks pulling jobs
    pub worker_concurrency: usize,
    /// Retries allowed after the first attempt
    pub job_max_retry: u32,
    /// Per-job execution timeout
    pub job_timeout: Duration,
    /// How long to wait for an instance to become operable
    pub readiness_timeout: Duration,
    /// How long to wait for the bootstrap command
    pub command_timeout: Duration,
    /// Interval between command status polls
    pub command_poll_interval: Duration,
    /// Idle wait between queue polls
    pub queue_poll_interval: Duration,
    /// Bootstrap command template
    pub bootstrap_command: String,
    /// Cost factor for hashing gateway secrets
    pub secret_hash_cost: u32,
    /// How long archived jobs are kept
    pub job_retention: Duration,
    /// Instance class used when the request leaves it empty
    pub default_instance_class: String,
    /// Keys for refreshing the instance catalog; no refresh when unset
    pub catalog_credentials: Option<CatalogCredentials>,
    /// Region the instance catalog is read from
    pub catalog_region: String,
    /// How often the instance catalog is refreshed
    pub catalog_sync_interval: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("encryption_key", &"<redacted>")
            .field("provider_endpoint", &self.provider_endpoint)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("job_max_retry", &self.job_max_retry)
            .field("job_timeout", &self.job_timeout)
            .field("readiness_timeout", &self.readiness_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("command_poll_interval", &self.command_poll_interval)
            .field("queue_poll_interval", &self.queue_poll_interval)
            .field("secret_hash_cost", &self.secret_hash_cost)
            .field("job_retention", &self.job_retention)
            .field("default_instance_class", &self.default_instance_class)
            .field("catalog_credentials", &self.catalog_credentials)
            .field("catalog_region", &self.catalog_region)
            .field("catalog_sync_interval", &self.catalog_sync_interval)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Configuration with every optional setting at its default.
    ///
    /// The key is not checked here; [`SecretCipher::new`](crate::crypto::SecretCipher::new)
    /// rejects a wrong-size key when the runtime is built.
    pub fn new(database_url: impl Into<String>, encryption_key: impl Into<Vec<u8>>) -> Self {
        Self {
            database_url: database_url.into(),
            encryption_key: Zeroizing::new(encryption_key.into()),
            provider_endpoint: None,
            worker_concurrency: 10,
            job_max_retry: 2,
            job_timeout: Duration::from_secs(600),
            readiness_timeout: Duration::from_secs(240),
            command_timeout: Duration::from_secs(300),
            command_poll_interval: Duration::from_secs(2),
            queue_poll_interval: Duration::from_secs(1),
            bootstrap_command: DEFAULT_BOOTSTRAP_COMMAND.to_string(),
            secret_hash_cost: bcrypt::DEFAULT_COST,
            job_retention: Duration::from_secs(168 * 3600),
            default_instance_class: DEFAULT_INSTANCE_CLASS.to_string(),
            catalog_credentials: None,
            catalog_region: DEFAULT_CATALOG_REGION.to_string(),
            catalog_sync_interval: Duration::from_secs(24 * 3600),
        }
    }

    /// Check rules that span several settings.
    ///
    /// A deployment attempt has to fit both bounded waits, otherwise a slow
    /// but healthy bootstrap always runs into the job timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "GANTRY_WORKER_CONCURRENCY",
                reason: "must be at least 1".to_string(),
            });
        }
        let needed = self.readiness_timeout + self.command_timeout;
        if self.job_timeout < needed {
            return Err(ConfigError::InvalidValue {
                name: "GANTRY_JOB_TIMEOUT_SECS",
                reason: format!(
                    "{}s is shorter than readiness plus command timeouts ({}s)",
                    self.job_timeout.as_secs(),
                    needed.as_secs()
                ),
            });
        }
        Ok(())
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("GANTRY_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("GANTRY_DATABASE_URL"))?;

        let encryption_key = std::env::var("GANTRY_ENCRYPTION_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("GANTRY_ENCRYPTION_KEY"))?;
        let encryption_key = Zeroizing::new(encryption_key.into_bytes());
        if encryption_key.len() != KEY_LEN {
            return Err(ConfigError::InvalidEncryptionKey {
                len: encryption_key.len(),
            });
        }

        let provider_endpoint = std::env::var("GANTRY_PROVIDER_ENDPOINT").ok();
        if let Some(endpoint) = &provider_endpoint {
            url::Url::parse(endpoint).map_err(|e| ConfigError::InvalidValue {
                name: "GANTRY_PROVIDER_ENDPOINT",
                reason: e.to_string(),
            })?;
        }

        let worker_concurrency: usize = parse_var("GANTRY_WORKER_CONCURRENCY", 10)?;

        let secret_hash_cost: u32 = parse_var("GANTRY_SECRET_HASH_COST", bcrypt::DEFAULT_COST)?;
        if !(4..=31).contains(&secret_hash_cost) {
            return Err(ConfigError::InvalidValue {
                name: "GANTRY_SECRET_HASH_COST",
                reason: "must be between 4 and 31".to_string(),
            });
        }

        let catalog_credentials = match (
            std::env::var("GANTRY_CATALOG_ACCESS_KEY_ID").ok(),
            std::env::var("GANTRY_CATALOG_SECRET_ACCESS_KEY").ok(),
        ) {
            (Some(access_key_id), Some(secret)) => Some(CatalogCredentials {
                access_key_id,
                secret_access_key: Zeroizing::new(secret),
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::InvalidValue {
                    name: "GANTRY_CATALOG_ACCESS_KEY_ID",
                    reason: "must be set together with GANTRY_CATALOG_SECRET_ACCESS_KEY"
                        .to_string(),
                });
            }
        };

        let config = Self {
            database_url,
            encryption_key,
            provider_endpoint,
            worker_concurrency,
            job_max_retry: parse_var("GANTRY_JOB_MAX_RETRY", 2)?,
            job_timeout: Duration::from_secs(parse_var("GANTRY_JOB_TIMEOUT_SECS", 600)?),
            readiness_timeout: Duration::from_secs(parse_var(
                "GANTRY_READINESS_TIMEOUT_SECS",
                240,
            )?),
            command_timeout: Duration::from_secs(parse_var("GANTRY_COMMAND_TIMEOUT_SECS", 300)?),
            command_poll_interval: Duration::from_millis(parse_var(
                "GANTRY_COMMAND_POLL_INTERVAL_MS",
                2000,
            )?),
            queue_poll_interval: Duration::from_millis(parse_var(
                "GANTRY_QUEUE_POLL_INTERVAL_MS",
                1000,
            )?),
            bootstrap_command: std::env::var("GANTRY_BOOTSTRAP_COMMAND")
                .unwrap_or_else(|_| DEFAULT_BOOTSTRAP_COMMAND.to_string()),
            secret_hash_cost,
            job_retention: parse_hours("GANTRY_JOB_RETENTION_HOURS", 168)?,
            default_instance_class: std::env::var("GANTRY_DEFAULT_INSTANCE_CLASS")
                .unwrap_or_else(|_| DEFAULT_INSTANCE_CLASS.to_string()),
            catalog_credentials,
            catalog_region: std::env::var("GANTRY_CATALOG_REGION")
                .unwrap_or_else(|_| DEFAULT_CATALOG_REGION.to_string()),
            catalog_sync_interval: parse_hours("GANTRY_CATALOG_SYNC_HOURS", 24)?,
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_hours(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let hours: u64 = parse_var(name, default)?;
    hours
        .checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            name,
            reason: format!("{} hours is out of range", hours),
        })
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The encryption key has the wrong length.
    #[error("GANTRY_ENCRYPTION_KEY must be exactly 32 bytes, got {len}")]
    InvalidEncryptionKey {
        /// Length of the supplied key in bytes.
        len: usize,
    },
    /// A variable is set but cannot be used.
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    const OPTIONAL_VARS: &[&str] = &[
        "GANTRY_PROVIDER_ENDPOINT",
        "GANTRY_WORKER_CONCURRENCY",
        "GANTRY_JOB_MAX_RETRY",
        "GANTRY_JOB_TIMEOUT_SECS",
        "GANTRY_READINESS_TIMEOUT_SECS",
        "GANTRY_COMMAND_TIMEOUT_SECS",
        "GANTRY_COMMAND_POLL_INTERVAL_MS",
        "GANTRY_QUEUE_POLL_INTERVAL_MS",
        "GANTRY_BOOTSTRAP_COMMAND",
        "GANTRY_SECRET_HASH_COST",
        "GANTRY_JOB_RETENTION_HOURS",
        "GANTRY_DEFAULT_INSTANCE_CLASS",
        "GANTRY_CATALOG_ACCESS_KEY_ID",
        "GANTRY_CATALOG_SECRET_ACCESS_KEY",
        "GANTRY_CATALOG_REGION",
        "GANTRY_CATALOG_SYNC_HOURS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn baseline(&mut self) {
            self.set("GANTRY_DATABASE_URL", "sqlite::memory:");
            self.set("GANTRY_ENCRYPTION_KEY", KEY);
            for var in OPTIONAL_VARS {
                self.remove(var);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.baseline();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.encryption_key.as_slice(), KEY.as_bytes());
        assert!(config.provider_endpoint.is_none());
        assert_eq!(config.worker_concurrency, 10);
        assert_eq!(config.job_max_retry, 2);
        assert_eq!(config.job_timeout, Duration::from_secs(600));
        assert_eq!(config.readiness_timeout, Duration::from_secs(240));
        assert_eq!(config.command_timeout, Duration::from_secs(300));
        assert_eq!(config.command_poll_interval, Duration::from_secs(2));
        assert_eq!(config.queue_poll_interval, Duration::from_secs(1));
        assert_eq!(config.bootstrap_command, DEFAULT_BOOTSTRAP_COMMAND);
        assert_eq!(config.secret_hash_cost, bcrypt::DEFAULT_COST);
        assert_eq!(config.job_retention, Duration::from_secs(168 * 3600));
        assert_eq!(config.default_instance_class, DEFAULT_INSTANCE_CLASS);
        assert!(config.catalog_credentials.is_none());
        assert_eq!(config.catalog_region, DEFAULT_CATALOG_REGION);
        assert_eq!(config.catalog_sync_interval, Duration::from_secs(24 * 3600));
        assert!(config.job_timeout >= config.readiness_timeout + config.command_timeout);
    }

    #[test]
    fn test_config_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.baseline();
        guard.set("GANTRY_PROVIDER_ENDPOINT", "https://provider.internal");
        guard.set("GANTRY_WORKER_CONCURRENCY", "4");
        guard.set("GANTRY_JOB_MAX_RETRY", "0");
        guard.set("GANTRY_COMMAND_POLL_INTERVAL_MS", "250");
        guard.set("GANTRY_BOOTSTRAP_COMMAND", "setup {name}");

        let config = Config::from_env().unwrap();

        assert_eq!(
            config.provider_endpoint.as_deref(),
            Some("https://provider.internal")
        );
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.job_max_retry, 0);
        assert_eq!(config.command_poll_interval, Duration::from_millis(250));
        assert_eq!(config.bootstrap_command, "setup {name}");
    }

    #[test]
    fn test_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.baseline();
        guard.remove("GANTRY_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingEnvVar("GANTRY_DATABASE_URL")
        ));
    }

    #[test]
    fn test_short_encryption_key_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.baseline();
        guard.set("GANTRY_ENCRYPTION_KEY", "too-short");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEncryptionKey { len: 9 }));
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.baseline();
        guard.set("GANTRY_JOB_TIMEOUT_SECS", "five minutes");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "GANTRY_JOB_TIMEOUT_SECS",
                ..
            }
        ));

        guard.set("GANTRY_JOB_TIMEOUT_SECS", "600");
        guard.set("GANTRY_WORKER_CONCURRENCY", "0");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_job_timeout_must_cover_both_waits() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.baseline();
        guard.set("GANTRY_JOB_TIMEOUT_SECS", "300");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "GANTRY_JOB_TIMEOUT_SECS",
                ..
            }
        ));
        assert!(err.to_string().contains("540s"));

        guard.set("GANTRY_READINESS_TIMEOUT_SECS", "60");
        guard.set("GANTRY_COMMAND_TIMEOUT_SECS", "120");
        let config = Config::from_env().unwrap();
        assert_eq!(config.job_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_huge_retention_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.baseline();
        guard.set("GANTRY_JOB_RETENTION_HOURS", &u64::MAX.to_string());

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "GANTRY_JOB_RETENTION_HOURS",
                ..
            }
        ));
    }

    #[test]
    fn test_catalog_credentials_come_in_pairs() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.baseline();
        guard.set("GANTRY_CATALOG_ACCESS_KEY_ID", "AKIACATALOG");

        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::InvalidValue {
                name: "GANTRY_CATALOG_ACCESS_KEY_ID",
                ..
            }
        ));

        guard.set("GANTRY_CATALOG_SECRET_ACCESS_KEY", "catalog-secret");
        guard.set("GANTRY_CATALOG_REGION", "eu-central-1");
        let config = Config::from_env().unwrap();
        let credentials = config.catalog_credentials.clone().unwrap();
        assert_eq!(credentials.access_key_id, "AKIACATALOG");
        assert_eq!(config.catalog_region, "eu-central-1");
        assert!(!format!("{:?}", config).contains("catalog-secret"));
    }

    #[test]
    fn test_new_uses_defaults() {
        let config = Config::new("sqlite::memory:", KEY);
        assert_eq!(config.encryption_key.as_slice(), KEY.as_bytes());
        assert_eq!(config.worker_concurrency, 10);
        assert_eq!(config.job_max_retry, 2);
        assert_eq!(config.readiness_timeout, Duration::from_secs(240));
        assert_eq!(config.default_instance_class, DEFAULT_INSTANCE_CLASS);
        assert!(config.provider_endpoint.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_debug_redacts_key() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.baseline();

        let config = Config::from_env().unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(KEY));
    }
}
