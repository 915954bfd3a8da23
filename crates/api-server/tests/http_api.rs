//! Router-level tests over in-memory stores and the paper broker.

use api_server::{create_router, AppState, Stores};
use auth::{hash_phrase, OperatorRole};
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use signal_core::config::Config;
use std::sync::Arc;
use tower::ServiceExt;
use trading_engine::{BrokerRegistry, PaperBroker};

const PHRASE: &str = "correct horse battery staple";

struct TestApp {
    router: Router,
    state: Arc<AppState>,
}

impl TestApp {
    fn new() -> Self {
        let mut config = Config::test_config();
        config.mode.secret_phrase_hash = hash_phrase(PHRASE).unwrap();
        config.mode.totp_secret = auth::totp::generate_secret();

        let paper = Arc::new(PaperBroker::new(
            config.risk.starting_capital,
            config.risk.fee_rate,
        ));
        let brokers = BrokerRegistry::new(paper).unwrap();
        let state = Arc::new(AppState::assemble(config, Stores::memory(), brokers, Vec::new()).unwrap());

        Self {
            router: create_router(state.clone()),
            state,
        }
    }

    fn token(&self, actor: &str, role: OperatorRole) -> String {
        self.state.jwt_auth.create_token(actor, role).unwrap()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }
}

fn webhook_payload(token: &str) -> Value {
    json!({
        "token": token,
        "symbol": "AAPL",
        "action": "BUY",
        "price": 150.50,
        "strategy": "Test"
    })
}

#[tokio::test]
async fn test_webhook_signal_executes_on_paper() {
    let app = TestApp::new();

    let (status, body) = app.post("/webhook/signal", None, webhook_payload("T1")).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["decision"], "executed");
    assert_eq!(body["order"]["broker_id"], "paper");
    assert_eq!(body["order"]["trading_mode"], "paper");

    let order_id = body["order_id"].as_str().unwrap().to_string();
    let viewer = app.token("viewer-1", OperatorRole::Viewer);
    let (status, order) = app
        .get(&format!("/api/v1/orders/{}", order_id), Some(&viewer))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["id"], order_id.as_str());

    let (_, audit) = app
        .get("/api/v1/audit?action=risk_evaluation&decision=approved", Some(&viewer))
        .await;
    assert_eq!(audit["total"], 1);
}

#[tokio::test]
async fn test_webhook_with_bad_token_is_rejected_and_audited() {
    let app = TestApp::new();

    let (status, body) = app
        .post("/webhook/signal", None, webhook_payload("wrong"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AuthFailure");

    let viewer = app.token("viewer-1", OperatorRole::Viewer);
    let (_, audit) = app
        .get("/api/v1/audit?action=signal_ingest&decision=rejected", Some(&viewer))
        .await;
    assert_eq!(audit["total"], 1);
    assert_eq!(audit["entries"][0]["reason"], "AuthFailure");

    let (_, orders) = app.get("/api/v1/orders", Some(&viewer)).await;
    assert_eq!(orders.as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn test_redelivered_webhook_is_duplicate() {
    let app = TestApp::new();

    let (first, _) = app.post("/webhook/signal", None, webhook_payload("T1")).await;
    let (second, body) = app.post("/webhook/signal", None, webhook_payload("T1")).await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(body["decision"], "duplicate");
}

#[tokio::test]
async fn test_malformed_payloads() {
    let app = TestApp::new();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhook/signal")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_JSON");

    let mut payload = webhook_payload("T1");
    payload["action"] = json!("HODL");
    let (status, body) = app.post("/webhook/signal", None, payload).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "Malformed");
}

#[tokio::test]
async fn test_operator_commands_require_role() {
    let app = TestApp::new();
    let viewer = app.token("viewer-1", OperatorRole::Viewer);
    let operator = app.token("ops-1", OperatorRole::Operator);

    let (status, _) = app.post("/api/v1/mode/pause", None, json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.post("/api/v1/mode/pause", Some(&viewer), json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, mode) = app.post("/api/v1/mode/pause", Some(&operator), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mode["paused"], true);
    assert_eq!(mode["updated_by"], "ops-1");

    let (status, body) = app.post("/webhook/signal", None, webhook_payload("T1")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["decision"], "denied");
    assert_eq!(body["stage"], "mode");
}

#[tokio::test]
async fn test_unlock_is_admin_only_and_wrong_phrase_keeps_tier() {
    let app = TestApp::new();
    let operator = app.token("ops-1", OperatorRole::Operator);
    let admin = app.token("admin-1", OperatorRole::Admin);
    let request = json!({
        "secret_phrase": "not the phrase",
        "totp_code": "000000",
        "capital_pct": 5
    });

    let (status, _) = app
        .post("/api/v1/mode/unlock-advanced", Some(&operator), request.clone())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .post("/api/v1/mode/unlock-advanced", Some(&admin), request)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (_, mode) = app.get("/api/v1/mode", Some(&admin)).await;
    assert_eq!(mode["tier"], "conservative");
    assert_eq!(mode["advanced_status"], "locked");
}

#[tokio::test]
async fn test_switch_live_needs_confirmation_token() {
    let app = TestApp::new();
    let admin = app.token("admin-1", OperatorRole::Admin);

    let (status, _) = app
        .post(
            "/api/v1/mode/switch-live",
            Some(&admin),
            json!({ "confirmation_token": "nope" }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, mode) = app.get("/api/v1/mode", Some(&admin)).await;
    assert_eq!(mode["trading_mode"], "paper");
}

#[tokio::test]
async fn test_cancel_unknown_order_is_not_found() {
    let app = TestApp::new();
    let operator = app.token("ops-1", OperatorRole::Operator);

    let (status, _) = app
        .post(
            &format!("/api/v1/orders/{}/cancel", uuid::Uuid::new_v4()),
            Some(&operator),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_market_prices_feed_the_price_book() {
    let app = TestApp::new();
    let operator = app.token("ops-1", OperatorRole::Operator);

    let (status, book) = app
        .post(
            "/api/v1/market/prices",
            Some(&operator),
            json!({ "prices": [{ "symbol": "aapl", "price": 150.5 }] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(book[0]["symbol"], "AAPL");
    assert_eq!(
        app.state.risk.latest_price("AAPL"),
        Some(Decimal::new(1505, 1))
    );

    let (status, _) = app
        .post(
            "/api/v1/market/prices",
            Some(&operator),
            json!({ "prices": [{ "symbol": "AAPL", "price": -1 }] }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_health_and_openapi_are_public() {
    let app = TestApp::new();

    let (status, health) = app.get("/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");

    let (status, ready) = app.get("/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ready["database"], "memory");

    let (status, doc) = app.get("/api-docs/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/webhook/signal"].is_object());
}

#[tokio::test]
async fn test_metrics_and_risk_views() {
    let app = TestApp::new();
    let viewer = app.token("viewer-1", OperatorRole::Viewer);
    app.post("/webhook/signal", None, webhook_payload("T1")).await;

    let (status, metrics) = app.get("/api/v1/metrics", Some(&viewer)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["signals_executed"], 1);

    let (status, risk) = app.get("/api/v1/risk", Some(&viewer)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(risk["limits"]["max_consecutive_losses"], 5);
}
