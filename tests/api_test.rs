//! HTTP API Integration Tests
//!
//! Drives the fully layered router (origin gate, CORS, limiters, handlers)
//! against file-backed stores in a temp directory.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use flow_guard::api::AppState;
use flow_guard::automation::{AutoCredentialsRequest, CredentialRetriever, RetrievalOutcome};
use flow_guard::errors::codes;
use flow_guard::{
    CipherVault, Config, CredentialStore, FileSlotStorage, FlowServer, JsonFileOriginStore,
    SlotStorage, TokenProxy,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// Retriever that succeeds unless the username is "locked"
#[derive(Default)]
struct MockRetriever {
    calls: AtomicUsize,
}

#[async_trait]
impl CredentialRetriever for MockRetriever {
    async fn retrieve(&self, request: &AutoCredentialsRequest) -> RetrievalOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.username == "locked" {
            return RetrievalOutcome::failure(codes::MFA_REQUIRED, "MFA prompt detected");
        }
        RetrievalOutcome::Success {
            client_id: format!("cid-{}", request.app_name.len()),
            client_secret: "secret-from-portal".into(),
            organization_id: Some("org-42".into()),
        }
    }
}

struct TestApp {
    router: Router,
    retriever: Arc<MockRetriever>,
    dir: TempDir,
}

fn create_test_app() -> TestApp {
    create_test_app_with(|_| {})
}

fn create_test_app_with(configure: impl FnOnce(&mut Config)) -> TestApp {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data_dir = dir.path().join("data");
    let origins_file = dir.path().join("config").join("allowed-origins.json");

    let storage: Arc<dyn SlotStorage> = Arc::new(FileSlotStorage::new(&data_dir));
    let vault = CipherVault::with_stored_key(storage.clone());
    let retriever = Arc::new(MockRetriever::default());

    let state = AppState::new(
        Arc::new(JsonFileOriginStore::new(&origins_file)),
        Arc::new(CredentialStore::new(storage, vault)),
        retriever.clone(),
        Arc::new(TokenProxy::new().unwrap()),
    );

    let mut config = Config {
        data_dir,
        origins_file,
        log_requests: false,
        ..Config::default()
    };
    configure(&mut config);

    TestApp {
        router: FlowServer::new(config, state).build_router(),
        retriever,
        dir,
    }
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    origin: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(origin) = origin {
        builder = builder.header("origin", origin);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, json)
}

#[tokio::test]
async fn test_origin_lifecycle() {
    let app = create_test_app();
    let r = &app.router;

    let (status, _, json) = send(r, "GET", "/api/security/origins", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({"success": true, "origins": []}));

    let (status, _, json) = send(
        r,
        "POST",
        "/api/security/origins",
        None,
        Some(json!({"origin": "https://flow.example.com", "description": "Office"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["origin"]["origin"], "https://flow.example.com");
    assert_eq!(json["origin"]["description"], "Office");
    let id = json["origin"]["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("origin-"));

    let (status, _, json) = send(r, "GET", "/api/security/origins", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["origins"].as_array().unwrap().len(), 1);

    let (status, _, json) =
        send(r, "DELETE", &format!("/api/security/origins/{}", id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let (status, _, json) =
        send(r, "DELETE", &format!("/api/security/origins/{}", id), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["errorCode"], codes::VALIDATION_ERROR);
}

#[tokio::test]
async fn test_origin_validation_errors() {
    let app = create_test_app();
    let r = &app.router;

    let (status, _, json) =
        send(r, "POST", "/api/security/origins", None, Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["errorCode"], codes::MISSING_PARAMETERS);
    assert_eq!(json["success"], false);

    let (status, _, json) = send(
        r,
        "POST",
        "/api/security/origins",
        None,
        Some(json!({"origin": "not a url"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["errorCode"], codes::INVALID_URL);

    let body = json!({"origin": "https://dup.example.com"});
    let (status, _, _) = send(r, "POST", "/api/security/origins", None, Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, json) = send(r, "POST", "/api/security/origins", None, Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["errorCode"], codes::VALIDATION_ERROR);

    let (_, _, json) = send(r, "GET", "/api/security/origins", None, None).await;
    assert_eq!(json["origins"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_gate_decisions() {
    let app = create_test_app();
    let r = &app.router;

    let (status, headers, _) = send(r, "GET", "/health", Some("http://192.168.1.50:2727"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["access-control-allow-origin"], "http://192.168.1.50:2727");

    let (status, _, json) = send(r, "GET", "/health", Some("https://evil.example.com"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["errorCode"], codes::ORIGIN_NOT_ALLOWED);

    let (status, _, json) = send(r, "GET", "/health", Some("not-a-url"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["errorCode"], codes::INVALID_ORIGIN);

    let (status, _, _) = send(r, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_registered_origin_takes_effect_immediately() {
    let app = create_test_app();
    let r = &app.router;
    let partner = "https://partner.example.com";

    let (status, _, _) = send(r, "GET", "/health", Some(partner), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, json) = send(
        r,
        "POST",
        "/api/security/origins",
        Some("http://localhost:2727"),
        Some(json!({"origin": partner})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = json["origin"]["id"].as_str().unwrap().to_string();

    let (status, headers, _) = send(r, "GET", "/health", Some(partner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["access-control-allow-origin"], partner);

    // A registered origin can manage the registry, including removing itself
    let (status, _, _) = send(
        r,
        "DELETE",
        &format!("/api/security/origins/{}", id),
        Some(partner),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(r, "GET", "/health", Some(partner), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_origins_file_on_disk() {
    let app = create_test_app();
    send(
        &app.router,
        "POST",
        "/api/security/origins",
        None,
        Some(json!({"origin": "https://disk.example.com"})),
    )
    .await;

    let path = app.dir.path().join("config").join("allowed-origins.json");
    let raw = std::fs::read_to_string(path).unwrap();
    let parsed: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed[0]["origin"], "https://disk.example.com");
    assert!(parsed[0]["createdAt"].is_string());
}

#[tokio::test]
async fn test_auto_credentials_success() {
    let app = create_test_app();

    let (status, _, json) = send(
        &app.router,
        "POST",
        "/api/auto-credentials",
        None,
        Some(json!({
            "url": "https://incontrol2.peplink.com",
            "username": "admin@example.com",
            "password": "pw",
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    // Default app name "Flow - Device Monitor" has 21 characters
    assert_eq!(json["clientId"], "cid-21");
    assert_eq!(json["clientSecret"], "secret-from-portal");
    assert_eq!(json["organizationId"], "org-42");
}

#[tokio::test]
async fn test_auto_credentials_failures() {
    let app = create_test_app();
    let r = &app.router;

    let (status, _, json) = send(
        r,
        "POST",
        "/api/auto-credentials",
        None,
        Some(json!({"url": "nope", "username": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["errorCode"], codes::VALIDATION_ERROR);
    let fields: Vec<&str> = json["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, ["url", "username", "password"]);
    assert_eq!(app.retriever.calls.load(Ordering::SeqCst), 0);

    let (status, _, json) = send(
        r,
        "POST",
        "/api/auto-credentials",
        None,
        Some(json!({"url": "https://ic.example.com", "username": "locked", "password": "pw"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert_eq!(json["errorCode"], codes::MFA_REQUIRED);
    assert_eq!(json["details"], "MFA prompt detected");
}

#[tokio::test]
async fn test_auto_credentials_rate_limited() {
    let app = create_test_app();
    let body = json!({"url": "https://ic.example.com", "username": "u", "password": "p"});

    for i in 0..10 {
        let (status, headers, _) = send(
            &app.router,
            "POST",
            "/api/auto-credentials",
            None,
            Some(body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "Request {} should be admitted", i);
        // The route's own quota, not the general one
        assert_eq!(headers["ratelimit-limit"], "10");
        assert_eq!(headers["ratelimit-remaining"], (9 - i).to_string().as_str());
    }

    let (status, headers, json) =
        send(&app.router, "POST", "/api/auto-credentials", None, Some(body)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["errorCode"], codes::RATE_LIMITED);
    assert_eq!(headers["ratelimit-limit"], "10");
    assert_eq!(headers["ratelimit-remaining"], "0");
    let retry: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((89..=90).contains(&retry), "retry-after was {}", retry);
    assert_eq!(app.retriever.calls.load(Ordering::SeqCst), 10);

    // Other routes only see the general limit: 12 of 100 used
    let (status, headers, _) = send(&app.router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["ratelimit-limit"], "100");
    assert_eq!(headers["ratelimit-remaining"], "88");
}

/// Request from `peer`, optionally claiming another address via `X-Forwarded-For`
fn request_from(
    peer: [u8; 4],
    forwarded_for: Option<&str>,
    uri: &str,
    body: Option<&Value>,
) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(ip) = forwarded_for {
        builder = builder.header("x-forwarded-for", ip);
    }
    let mut request = match body {
        Some(body) => builder
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((peer, 40000))));
    request
}

#[tokio::test]
async fn test_general_limit_per_caller() {
    let app = create_test_app();

    for _ in 0..100 {
        let response = app
            .router
            .clone()
            .oneshot(request_from([10, 0, 0, 1], None, "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .router
        .clone()
        .oneshot(request_from([10, 0, 0, 1], None, "/health", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = app
        .router
        .clone()
        .oneshot(request_from([10, 0, 0, 2], None, "/health", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_spoofed_forwarded_for_does_not_reset_quota() {
    let app = create_test_app();
    let body = json!({"url": "https://ic.example.com", "username": "u", "password": "p"});

    let mut limited = 0;
    for i in 0..50 {
        let spoofed = format!("203.0.113.{}", i);
        let response = app
            .router
            .clone()
            .oneshot(request_from(
                [198, 51, 100, 7],
                Some(&spoofed),
                "/api/auto-credentials",
                Some(&body),
            ))
            .await
            .unwrap();
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            limited += 1;
        }
    }

    assert_eq!(limited, 40);
    assert_eq!(app.retriever.calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_trusted_proxy_keys_on_forwarded_for() {
    let app = create_test_app_with(|config| config.trust_proxy = true);
    let body = json!({"url": "https://ic.example.com", "username": "u", "password": "p"});
    let proxy = [127, 0, 0, 1];

    for _ in 0..10 {
        let response = app
            .router
            .clone()
            .oneshot(request_from(proxy, Some("203.0.113.1"), "/api/auto-credentials", Some(&body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .router
        .clone()
        .oneshot(request_from(proxy, Some("203.0.113.1"), "/api/auto-credentials", Some(&body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // A different client behind the same proxy has its own quota
    let response = app
        .router
        .clone()
        .oneshot(request_from(proxy, Some("203.0.113.2"), "/api/auto-credentials", Some(&body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_credentials_slot() {
    let app = create_test_app();
    let r = &app.router;

    let (status, _, json) = send(r, "GET", "/api/credentials", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stored"], false);

    let (status, _, json) = send(
        r,
        "PUT",
        "/api/credentials",
        None,
        Some(json!({"clientId": "abc123", "clientSecret": "very-secret-value"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stored"], true);
    assert_eq!(json["isCustomEndpoint"], false);

    let (_, _, json) = send(r, "GET", "/api/credentials", None, None).await;
    assert_eq!(json["stored"], true);
    assert_eq!(json["apiUrl"], "https://incontrol2.peplink.com");
    assert_eq!(json["clientId"], "••••••");
    assert!(!json.to_string().contains("very-secret-value"));

    let on_disk = std::fs::read_to_string(app.dir.path().join("data").join("flow_credentials"))
        .unwrap();
    assert!(!on_disk.contains("very-secret-value"));
    assert!(!on_disk.contains("abc123"));

    let (status, _, _) = send(r, "DELETE", "/api/credentials", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(r, "DELETE", "/api/credentials", None, None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, _, json) = send(r, "GET", "/api/credentials", None, None).await;
    assert_eq!(json["stored"], false);
}

#[tokio::test]
async fn test_corrupt_vault_key_is_not_fatal() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data_dir = dir.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::write(data_dir.join("flow_encryption_key"), "garbage!!").unwrap();

    let config = Config {
        origins_file: dir.path().join("config").join("allowed-origins.json"),
        data_dir,
        log_requests: false,
        ..Config::default()
    };
    let server = FlowServer::from_config(config).await.expect("startup should survive a bad key");
    let r = &server.build_router();
    let bundle = json!({"clientId": "abc123", "clientSecret": "very-secret-value"});

    let (status, _, json) = send(r, "GET", "/api/credentials", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stored"], false);

    let (status, _, json) = send(r, "PUT", "/api/credentials", None, Some(bundle.clone())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["success"], false);

    // Clearing discards the unusable key; the next save generates a fresh one
    let (status, _, _) = send(r, "DELETE", "/api/credentials", None, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(r, "PUT", "/api/credentials", None, Some(bundle)).await;
    assert_eq!(status, StatusCode::OK);
    let (_, _, json) = send(r, "GET", "/api/credentials", None, None).await;
    assert_eq!(json["stored"], true);
}

#[tokio::test]
async fn test_credentials_validation() {
    let app = create_test_app();

    let (status, _, json) = send(
        &app.router,
        "PUT",
        "/api/credentials",
        None,
        Some(json!({"clientId": "abc"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["errorCode"], codes::MISSING_PARAMETERS);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/credentials")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_token_proxy_missing_parameters() {
    let app = create_test_app();

    let (status, _, json) = send(
        &app.router,
        "POST",
        "/api/auth/token",
        None,
        Some(json!({"apiUrl": "https://incontrol2.peplink.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["errorCode"], codes::MISSING_PARAMETERS);
}
