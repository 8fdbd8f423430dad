// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance class catalog.
//!
//! The provider's class listing is mirrored into the `instance_classes`
//! table, keeping only classes large enough to run a gateway workload.
//! Creation requests naming a class outside the catalog are rejected before
//! anything is written.

use std::sync::Arc;

use gantry_core::Persistence;
use gantry_core::models::{InstanceClassRecord, NewInstanceClass};
use tracing::{debug, info};

use crate::credentials::DecryptedCredential;
use crate::error::{Error, Result};
use crate::provider::{ComputeProvider, InstanceClassSpec};

/// Fewest virtual CPUs a catalog class may have.
pub const MIN_VCPUS: u32 = 4;

/// Least memory a catalog class may have, in MiB.
pub const MIN_MEMORY_MIB: u64 = 8 * 1024;

/// Whether a provider class is large enough for a gateway.
pub fn qualifies(spec: &InstanceClassSpec) -> bool {
    spec.vcpus >= MIN_VCPUS && spec.memory_mib >= MIN_MEMORY_MIB
}

/// Stored catalog of instance classes gateways may use.
#[derive(Clone)]
pub struct InstanceCatalog {
    persistence: Arc<dyn Persistence>,
    provider: Arc<dyn ComputeProvider>,
}

impl InstanceCatalog {
    /// Create the catalog.
    pub fn new(persistence: Arc<dyn Persistence>, provider: Arc<dyn ComputeProvider>) -> Self {
        Self {
            persistence,
            provider,
        }
    }

    /// Refresh the catalog from the provider listing.
    ///
    /// Returns the number of qualifying classes written. Classes the provider
    /// stops listing are kept; their `synced_at` simply stops moving.
    pub async fn sync(
        &self,
        credential: &DecryptedCredential,
        region: &str,
        architecture: &str,
    ) -> Result<u64> {
        let listed = self
            .provider
            .list_instance_classes(credential, region, architecture)
            .await?;
        let total = listed.len();

        let classes: Vec<NewInstanceClass> = listed
            .into_iter()
            .filter(qualifies)
            .filter_map(|spec| {
                Some(NewInstanceClass {
                    vcpus: i32::try_from(spec.vcpus).ok()?,
                    memory_mib: i64::try_from(spec.memory_mib).ok()?,
                    instance_class: spec.name,
                    architecture: spec.architecture,
                })
            })
            .collect();

        if classes.is_empty() {
            debug!(listed = total, region = %region, "No qualifying instance classes listed");
            return Ok(0);
        }

        let written = self.persistence.upsert_instance_classes(&classes).await?;
        info!(
            listed = total,
            kept = written,
            region = %region,
            architecture = %architecture,
            "Instance catalog synced"
        );
        Ok(written)
    }

    /// Look up a class, rejecting names outside the catalog.
    pub async fn require(&self, instance_class: &str) -> Result<InstanceClassRecord> {
        self.persistence
            .get_instance_class(instance_class)
            .await?
            .ok_or_else(|| {
                Error::invalid(
                    "instance_class",
                    format!("unknown instance class '{}'", instance_class),
                )
            })
    }

    /// Number of classes currently in the catalog.
    pub async fn count(&self) -> Result<i64> {
        Ok(self.persistence.count_instance_classes().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::provider::MockProvider;
    use gantry_core::persistence::SqlitePersistence;

    fn cred() -> DecryptedCredential {
        DecryptedCredential::new("system", "system", "AKIACATALOG", "secret")
    }

    fn spec(name: &str, vcpus: u32, memory_mib: u64) -> InstanceClassSpec {
        InstanceClassSpec {
            name: name.to_string(),
            vcpus,
            memory_mib,
            architecture: "x86_64".to_string(),
        }
    }

    async fn catalog(provider: Arc<MockProvider>) -> InstanceCatalog {
        let persistence = SqlitePersistence::from_url("sqlite::memory:", 1)
            .await
            .unwrap();
        InstanceCatalog::new(Arc::new(persistence), provider)
    }

    #[test]
    fn test_qualifies_needs_both_cpu_and_memory() {
        assert!(qualifies(&spec("m5.xlarge", 4, 16384)));
        assert!(qualifies(&spec("c5.xlarge", 4, 8192)));
        assert!(!qualifies(&spec("t3.medium", 2, 4096)));
        assert!(!qualifies(&spec("c5.large", 2, 16384)));
        assert!(!qualifies(&spec("c6g.xlarge", 4, 8191)));
    }

    #[tokio::test]
    async fn test_sync_keeps_only_qualifying_classes() {
        let provider = Arc::new(MockProvider::new());
        provider
            .set_instance_classes(vec![
                spec("t3.medium", 2, 4096),
                spec("t3.xlarge", 4, 16384),
                spec("c5.2xlarge", 8, 16384),
                spec("r5.large", 2, 16384),
            ])
            .await;
        let catalog = catalog(provider).await;

        assert_eq!(catalog.sync(&cred(), "us-east-1", "x86_64").await.unwrap(), 2);
        assert_eq!(catalog.count().await.unwrap(), 2);

        let record = catalog.require("c5.2xlarge").await.unwrap();
        assert_eq!(record.vcpus, 8);
        assert_eq!(record.memory_mib, 16384);

        let err = catalog.require("t3.medium").await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidRequest {
                field: "instance_class",
                ..
            }
        ));
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[tokio::test]
    async fn test_sync_with_nothing_qualifying_writes_nothing() {
        let provider = Arc::new(MockProvider::new());
        provider
            .set_instance_classes(vec![spec("t3.micro", 2, 1024)])
            .await;
        let catalog = catalog(provider).await;

        assert_eq!(catalog.sync(&cred(), "us-east-1", "x86_64").await.unwrap(), 0);
        assert_eq!(catalog.count().await.unwrap(), 0);
    }
}
