// ABOUTME: HTTP handler tests for the Boxyard API router
// ABOUTME: Box create, status, progress, redeploy and delete through tower oneshot requests

use crate::api::{self, AppState};
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use boxyard_compute::{
    ComputeProvider, ExecOutput, InstanceHealth, InstanceSpec, ProviderError, ProviderRegistry,
    ProvisionedInstance,
};
use boxyard_config::{Backoff, PipelineConfig, PolicyTable, StepKind, StepPolicy};
use boxyard_deploy::{BoxManager, DeployOrchestrator, LocalQueue};
use boxyard_storage::connect_in_memory;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Provider that provisions instantly and reports every instance healthy
struct InstantProvider;

#[async_trait]
impl ComputeProvider for InstantProvider {
    async fn create_instance(
        &self,
        spec: &InstanceSpec,
    ) -> Result<ProvisionedInstance, ProviderError> {
        Ok(ProvisionedInstance {
            instance_id: format!("{}-instance", spec.name),
            url: None,
        })
    }

    async fn inspect(&self, _instance_id: &str) -> Result<InstanceHealth, ProviderError> {
        Ok(InstanceHealth {
            running: true,
            healthy: true,
        })
    }

    async fn destroy(&self, _instance_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn exec_command(
        &self,
        _instance_id: &str,
        _command: &[String],
    ) -> Result<ExecOutput, ProviderError> {
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

async fn test_app() -> Router {
    let pool = connect_in_memory().await.unwrap();
    let providers = ProviderRegistry::new().with("instant", Arc::new(InstantProvider));
    let policies = PolicyTable::default().scaled(0.01).with_policy(
        StepKind::Orchestrator,
        StepPolicy::new(Duration::from_secs(30), 1, Backoff::None, 5),
    );
    let pipeline = PipelineConfig {
        attempt_poll_interval_ms: 5,
        ..PipelineConfig::default()
    };

    let orchestrator = Arc::new(DeployOrchestrator::new(
        pool,
        Arc::new(LocalQueue::new()),
        providers,
        policies,
        pipeline,
    ));
    orchestrator.start_workers().await.unwrap();

    api::create_router(AppState {
        manager: Arc::new(BoxManager::new(orchestrator, "instant")),
    })
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create(app: &Router, subdomain: &str) -> (StatusCode, Value) {
    send(
        app,
        Method::POST,
        "/api/boxes",
        Some(json!({ "name": format!("Box {}", subdomain), "subdomain": subdomain })),
    )
    .await
}

async fn wait_for_status(app: &Router, id: &str, expected: &str) {
    for _ in 0..500 {
        let (_, body) = send(app, Method::GET, &format!("/api/boxes/{}/status", id), None).await;
        if body["data"]["status"] == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("box {} never reached {}", id, expected);
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;
    let (status, body) = send(&app, Method::GET, "/api/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["service"], "boxyard");
}

#[tokio::test]
async fn test_create_box_deploys_to_running() {
    let app = test_app().await;
    let (status, body) = create(&app, "alpha").await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["subdomain"], "alpha");
    assert_eq!(body["data"]["current_attempt"], 1);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    wait_for_status(&app, &id, "running").await;

    let (status, body) = send(&app, Method::GET, &format!("/api/boxes/{}/status", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["routable"], true);

    let (status, body) =
        send(&app, Method::GET, &format!("/api/boxes/{}/progress", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["attempt"], 1);
    let steps = body["data"]["steps"].as_array().unwrap();
    assert_eq!(steps[0]["step_key"], "create-instance");
    assert_eq!(steps.last().unwrap()["step_key"], "finalize");
    assert_eq!(steps.last().unwrap()["status"], "completed");

    let (status, body) =
        send(&app, Method::GET, &format!("/api/boxes/{}/attempts/1", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), steps.len());

    let (_, body) = send(&app, Method::GET, "/api/boxes", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_subdomain_is_bad_request() {
    let app = test_app().await;
    let (status, body) = create(&app, "Not_A_Label").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("subdomain"));
}

#[tokio::test]
async fn test_duplicate_subdomain_conflicts() {
    let app = test_app().await;
    let (status, _) = create(&app, "taken").await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = create(&app, "taken").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_unknown_box_is_not_found() {
    let app = test_app().await;
    let (status, body) = send(&app, Method::GET, "/api/boxes/box_missing/status", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_redeploy_running_box_conflicts() {
    let app = test_app().await;
    let (_, body) = create(&app, "steady").await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    wait_for_status(&app, &id, "running").await;

    let (status, body) =
        send(&app, Method::POST, &format!("/api/boxes/{}/redeploy", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_delete_box() {
    let app = test_app().await;
    let (_, body) = create(&app, "doomed").await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    wait_for_status(&app, &id, "running").await;

    let (status, _) = send(&app, Method::DELETE, &format!("/api/boxes/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app, Method::GET, &format!("/api/boxes/{}/status", id), None).await;
    assert_eq!(body["data"]["status"], "deleted");
    assert_eq!(body["data"]["routable"], false);

    // A deleted box cannot be brought back
    let (status, _) =
        send(&app, Method::POST, &format!("/api/boxes/{}/redeploy", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}
