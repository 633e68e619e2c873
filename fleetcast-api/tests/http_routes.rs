// HTTP route tests
//
// Exercises the router end to end against a fake module caller:
// - unary status policy (200/201, 502 when every instance failed)
// - request validation (400 before any instance is contacted)
// - SSE framing of the streaming operations

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::Engine as _;
use fleetcast_api::create_router;
use fleetcast_cluster::gateway::{
    default_selector, BroadcastConfig, BroadcastGateway, ModuleCaller, ModuleGateway,
    RemoteStream, TargetSource, CONTROL_ROLE_LABEL,
};
use fleetcast_cluster::{Error, InstanceKey, InstanceRecord, InstanceRegistry, Result};
use fleetcast_proto::{
    ApplyRequest, ApplyResponse, DeleteRequest, DeleteResponse, GetRequest, GetResponse,
    ListRequest, Module, ModuleCore, WatchDataRequest, WatchDataResponse, WatchLogRequest,
    WatchLogResponse,
};
use futures::{stream, StreamExt};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

#[derive(Default)]
struct FakeCaller {
    fail_all: bool,
    calls: AtomicUsize,
}

impl FakeCaller {
    fn check(&self, endpoint: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all {
            return Err(Error::Rpc(format!("{endpoint}: connection refused")));
        }
        Ok(())
    }
}

fn module(name: &str) -> Module {
    Module {
        core: Some(ModuleCore {
            name: name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ModuleCaller for FakeCaller {
    async fn apply(&self, endpoint: &str, _request: ApplyRequest) -> Result<ApplyResponse> {
        self.check(endpoint)?;
        Ok(ApplyResponse {
            message: "applied".to_string(),
        })
    }

    async fn delete(&self, endpoint: &str, _request: DeleteRequest) -> Result<DeleteResponse> {
        self.check(endpoint)?;
        Ok(DeleteResponse {
            message: "deleted".to_string(),
        })
    }

    async fn get(&self, endpoint: &str, request: GetRequest) -> Result<GetResponse> {
        self.check(endpoint)?;
        let name = request.core.map(|c| c.name).unwrap_or_default();
        Ok(GetResponse {
            data: Some(module(&name)),
        })
    }

    async fn list(&self, endpoint: &str, _request: ListRequest) -> Result<RemoteStream<GetResponse>> {
        self.check(endpoint)?;
        let items = vec![Ok(GetResponse {
            data: Some(module("probe")),
        })];
        Ok(stream::iter(items).boxed())
    }

    async fn watch_data(
        &self,
        endpoint: &str,
        _request: WatchDataRequest,
    ) -> Result<RemoteStream<WatchDataResponse>> {
        self.check(endpoint)?;
        Ok(stream::empty().boxed())
    }

    async fn watch_log(
        &self,
        endpoint: &str,
        _request: WatchLogRequest,
    ) -> Result<RemoteStream<WatchLogResponse>> {
        self.check(endpoint)?;
        let line = base64::engine::general_purpose::STANDARD.encode("hello");
        let items = vec![Ok(WatchLogResponse {
            data: line.into_bytes(),
        })];
        Ok(stream::iter(items).boxed())
    }
}

fn registry(instances: usize) -> Arc<InstanceRegistry> {
    let registry = Arc::new(InstanceRegistry::new());
    for i in 0..instances {
        registry.upsert(
            InstanceRecord::new(InstanceKey::new("hyperion", format!("probe-{i}")))
                .with_address(format!("10.2.0.{i}"))
                .with_ports([50051])
                .with_label(CONTROL_ROLE_LABEL, "true"),
        );
    }
    registry
}

fn router(instances: usize, caller: Arc<FakeCaller>) -> Router {
    let broadcast = BroadcastGateway::new(
        TargetSource::registry(registry(instances), default_selector()),
        BroadcastConfig::default(),
    );
    create_router(Arc::new(ModuleGateway::new(broadcast, caller)))
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(router(0, Arc::default()), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");

    let (status, body) = send(router(2, Arc::default()), get("/health/ready")).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["instances"], 2);
}

#[tokio::test]
async fn test_get_returns_every_response() {
    let (status, body) = send(router(2, Arc::default()), get("/api/v1/module/probe")).await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["responses"].as_array().unwrap().len(), 2);
    assert!(json["failures"].as_array().unwrap().is_empty());
    assert_eq!(json["responses"][0]["response"]["data"]["core"]["name"], "probe");
}

#[tokio::test]
async fn test_all_failed_is_bad_gateway() {
    let caller = Arc::new(FakeCaller {
        fail_all: true,
        ..Default::default()
    });
    let request = Request::builder()
        .method("DELETE")
        .uri("/api/v1/module/probe")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(router(2, caller), request).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let json: Value = serde_json::from_slice(&body).unwrap();
    let failures = json["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0]["kind"], "transport");
}

#[tokio::test]
async fn test_no_targets_is_empty_success() {
    let (status, body) = send(router(0, Arc::default()), get("/api/v1/module/probe")).await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["responses"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_apply_created() {
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/module/probe")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"spec":{"image":"probe:1.0"}}"#))
        .unwrap();

    let (status, body) = send(router(1, Arc::default()), request).await;
    assert_eq!(status, StatusCode::CREATED);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["responses"][0]["response"]["message"], "applied");
}

#[tokio::test]
async fn test_malformed_requests_contact_nobody() {
    let caller = Arc::new(FakeCaller::default());

    let bad_json = Request::builder()
        .method("POST")
        .uri("/api/v1/module/probe")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(router(2, caller.clone()), bad_json).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], 400);

    let (status, _) = send(router(2, caller.clone()), get("/api/v1/module/%20")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(router(2, caller.clone()), get("/api/v1/module")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(caller.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_list_streams_module_events() {
    let (status, body) = send(
        router(2, Arc::default()),
        get("/api/v1/module?labels%5Bapp%5D=probe"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).unwrap();
    assert_eq!(text.matches("event: module").count(), 2);
    assert!(text.contains(r#""name":"probe""#));
}

#[tokio::test]
async fn test_watch_log_streams_decoded_lines() {
    let (status, body) = send(router(1, Arc::default()), get("/api/v1/module/probe/log")).await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("event: log"));
    assert!(text.contains("data: hello"));
}
