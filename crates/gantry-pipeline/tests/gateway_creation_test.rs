// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the gateway creation flow against SQLite and the mock provider.

mod common;

use common::{TestContext, create_request};
use gantry_core::GatewayStatus;
use gantry_core::models::JobState;
use gantry_pipeline::deploy::DeploymentJob;
use gantry_pipeline::error::{Error, ErrorClass};
use gantry_pipeline::provider::MockProvider;
use gantry_pipeline::queue::Tier;

#[tokio::test]
async fn test_create_gateway_queues_deployment() {
    let ctx = TestContext::new(MockProvider::new()).await.unwrap();
    let credential_id = ctx.register_credential().await;

    let view = ctx
        .gateways
        .create_gateway(create_request(&credential_id, "My Cool Gateway"))
        .await
        .unwrap();

    assert_eq!(view.status, GatewayStatus::Initializing);
    assert_eq!(view.name, "my-cool-gateway");
    assert!(view.error_status.is_none());
    let instance_id = view.instance_id.clone().unwrap();
    let job_id = view.job_id.clone().unwrap();

    let record = ctx
        .persistence
        .get_gateway(&view.gateway_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.instance_id.as_deref(), Some(instance_id.as_str()));
    assert_eq!(record.job_id.as_deref(), Some(job_id.as_str()));
    assert_eq!(record.instance_class, "t3.xlarge");
    assert!(record.command_id.is_none());
    assert!(bcrypt::verify("correct horse battery", &record.secret_hash).unwrap());

    let job = ctx.persistence.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.kind, "gateway:deploy");
    assert_eq!(job.queue, "default");
    assert_eq!(job.unique_key.as_deref(), Some(view.gateway_id.as_str()));

    let payload = ctx.queue.open_payload(&job).unwrap();
    let deployment: DeploymentJob = serde_json::from_slice(&payload).unwrap();
    assert_eq!(deployment.gateway_id, view.gateway_id);
    assert_eq!(deployment.instance_id, instance_id);
    assert_eq!(deployment.secret, "correct horse battery");

    assert_eq!(ctx.provider.instance_count(), 1);
    let stats = ctx.queue.stats(Tier::Default).await.unwrap();
    assert_eq!(stats.pending, 1);

    let status = ctx.gateways.gateway_status(&view.gateway_id).await.unwrap();
    assert_eq!(status, view);
}

#[tokio::test]
async fn test_slug_collision_is_rejected() {
    let ctx = TestContext::new(MockProvider::new()).await.unwrap();
    let credential_id = ctx.register_credential().await;

    ctx.gateways
        .create_gateway(create_request(&credential_id, "My Cool Gateway"))
        .await
        .unwrap();

    let err = ctx
        .gateways
        .create_gateway(create_request(&credential_id, "my_cool_gateway"))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::AlreadyExists);
    assert_eq!(err.status_code(), 409);
    assert_eq!(ctx.provider.instance_count(), 1);
    assert_eq!(
        ctx.persistence
            .count_jobs(None, JobState::Pending)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_invalid_request_writes_nothing() {
    let ctx = TestContext::new(MockProvider::new()).await.unwrap();
    let credential_id = ctx.register_credential().await;

    let mut request = create_request(&credential_id, "Edge One");
    request.profile = "4k".to_string();

    let err = ctx.gateways.create_gateway(request).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest { field: "profile", .. }));
    assert!(
        ctx.persistence
            .get_gateway_by_name("edge-one")
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(ctx.provider.create_calls(), 0);
}

#[tokio::test]
async fn test_provisioning_failure_marks_gateway_failed() {
    let ctx = TestContext::new(MockProvider::failing_create("InsufficientInstanceCapacity"))
        .await
        .unwrap();
    let credential_id = ctx.register_credential().await;

    let err = ctx
        .gateways
        .create_gateway(create_request(&credential_id, "Edge One"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Provider);

    let record = ctx
        .persistence
        .get_gateway_by_name("edge-one")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.lifecycle().unwrap(), GatewayStatus::Failed);
    let error_status = record.error_status.unwrap();
    assert!(error_status.contains("InsufficientInstanceCapacity"));
    assert!(record.job_id.is_none());
    assert_eq!(
        ctx.persistence
            .count_jobs(None, JobState::Pending)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_unknown_credential_is_not_found() {
    let ctx = TestContext::new(MockProvider::new()).await.unwrap();

    let err = ctx
        .gateways
        .create_gateway(create_request("no-such-credential", "Edge One"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotFound);
    assert_eq!(err.status_code(), 404);

    assert!(
        ctx.persistence
            .get_gateway_by_name("edge-one")
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(ctx.provider.create_calls(), 0);
    assert_eq!(
        ctx.persistence
            .count_jobs(None, JobState::Pending)
            .await
            .unwrap(),
        0
    );

    // The name stays free for a request with a real credential.
    let credential_id = ctx.register_credential().await;
    ctx.gateways
        .create_gateway(create_request(&credential_id, "Edge One"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unknown_instance_class_writes_nothing() {
    let ctx = TestContext::new(MockProvider::new()).await.unwrap();
    let credential_id = ctx.register_credential().await;

    for class in ["t3.medium", "x9.nonexistent"] {
        let mut request = create_request(&credential_id, "Edge One");
        request.instance_class = Some(class.to_string());

        let err = ctx.gateways.create_gateway(request).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidRequest {
                field: "instance_class",
                ..
            }
        ));
        assert_eq!(err.status_code(), 400);
    }

    assert!(
        ctx.persistence
            .get_gateway_by_name("edge-one")
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(ctx.provider.create_calls(), 0);
}

#[tokio::test]
async fn test_catalog_class_is_accepted() {
    let ctx = TestContext::new(MockProvider::new()).await.unwrap();
    let credential_id = ctx.register_credential().await;

    let mut request = create_request(&credential_id, "Edge One");
    request.instance_class = Some("c5.2xlarge".to_string());
    let view = ctx.gateways.create_gateway(request).await.unwrap();

    let record = ctx
        .persistence
        .get_gateway(&view.gateway_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.instance_class, "c5.2xlarge");
}

#[tokio::test]
async fn test_foreign_credential_is_not_visible() {
    let ctx = TestContext::new(MockProvider::new()).await.unwrap();
    let credential_id = ctx.register_credential().await;

    let mut request = create_request(&credential_id, "Edge One");
    request.user_id = "someone-else".to_string();

    let err = ctx.gateways.create_gateway(request).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotFound);
    assert_eq!(ctx.provider.create_calls(), 0);
    assert!(
        ctx.persistence
            .get_gateway_by_name("edge-one")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_unknown_gateway_status() {
    let ctx = TestContext::new(MockProvider::new()).await.unwrap();
    let err = ctx.gateways.gateway_status("missing").await.unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_concurrent_creations_get_distinct_instances() {
    let ctx = TestContext::new(MockProvider::new()).await.unwrap();
    let credential_id = ctx.register_credential().await;

    let results = futures::future::join_all(
        ["Edge One", "Edge Two", "Edge Three"]
            .into_iter()
            .map(|name| ctx.gateways.create_gateway(create_request(&credential_id, name))),
    )
    .await;

    let mut instances: Vec<String> = results
        .into_iter()
        .map(|r| r.unwrap().instance_id.unwrap())
        .collect();
    instances.sort();
    instances.dedup();
    assert_eq!(instances.len(), 3);
    assert_eq!(
        ctx.persistence
            .count_jobs(None, JobState::Pending)
            .await
            .unwrap(),
        3
    );
}
