//! REST surface integration: stats/queue documents, the shared-secret
//! broadcast endpoint, and liveness probes.

use hub::config::HubConfig;
use hub::state::AppState;
use pulse_protocol::ServerEvent;
use pulse_test_utils::TestClient;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;

async fn start_hub(config: HubConfig) -> (AppState, String) {
    let state = AppState::new(config);
    let router = hub::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind hub");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("hub server error");
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (state, format!("http://{addr}"))
}

fn secured_config() -> HubConfig {
    let mut config = HubConfig::default();
    config.server.admin_token = Some("secret".to_owned());
    config
}

#[tokio::test]
async fn liveness_probes_answer_ok() {
    let (_state, base) = start_hub(HubConfig::default()).await;
    let http = reqwest::Client::new();
    for path in ["/healthz", "/readyz"] {
        let response = http.get(format!("{base}{path}")).send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "ok");
    }
}

#[tokio::test]
async fn stats_document_reflects_live_connections() {
    let (_state, base) = start_hub(HubConfig::default()).await;
    let ws_url = format!("{}/ws", base.replace("http://", "ws://"));

    let mut client = TestClient::connect(&format!("{ws_url}?identity=alice"))
        .await
        .expect("connect");
    client.expect_event(ServerEvent::Connected).await;
    client
        .send_frame(&TestClient::subscribe_frame(&["status", "stats"]))
        .await;
    client.expect_event(ServerEvent::Subscribed).await;

    let http = reqwest::Client::new();
    let stats: serde_json::Value = http
        .get(format!("{base}/api/v1/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["totalConnections"], 1);
    assert_eq!(stats["uniqueUsers"], 1);
    assert!((stats["averageSubscriptions"].as_f64().unwrap() - 2.0).abs() < f64::EPSILON);

    let queue: serde_json::Value = http
        .get(format!("{base}/api/v1/queue"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queue["length"], 0);
    assert_eq!(queue["isProcessing"], false);
}

#[tokio::test]
async fn broadcast_endpoint_requires_the_shared_secret() {
    let (_state, base) = start_hub(secured_config()).await;
    let http = reqwest::Client::new();
    let body = json!({ "type": "status", "event": "status_update", "data": {}, "priority": "normal" });

    let unauthenticated = http
        .post(format!("{base}/api/v1/broadcast"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(unauthenticated.status(), 401);
    let envelope: serde_json::Value = unauthenticated.json().await.unwrap();
    assert_eq!(envelope["code"], "UNAUTHORIZED");

    let wrong = http
        .post(format!("{base}/api/v1/broadcast"))
        .bearer_auth("nope")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);
}

#[tokio::test]
async fn broadcast_endpoint_enqueues_and_fans_out() {
    let (state, base) = start_hub(secured_config()).await;
    let ws_url = format!("{}/ws", base.replace("http://", "ws://"));

    let mut subscriber = TestClient::connect(&ws_url).await.expect("connect");
    subscriber.expect_event(ServerEvent::Connected).await;
    subscriber
        .send_frame(&TestClient::subscribe_frame(&["system"]))
        .await;
    subscriber.expect_event(ServerEvent::Subscribed).await;

    let http = reqwest::Client::new();
    let response = http
        .post(format!("{base}/api/v1/broadcast"))
        .bearer_auth("secret")
        .json(&json!({
            "type": "system",
            "event": "status_update",
            "data": { "note": "maintenance window" },
            "priority": "high"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["accepted"], true);

    state.scheduler.flush().await;
    let frame = subscriber.expect_event(ServerEvent::StatusUpdate).await;
    assert_eq!(frame.data["note"], "maintenance window");
}

#[tokio::test]
async fn broadcast_endpoint_rejects_unbroadcastable_types() {
    let (_state, base) = start_hub(secured_config()).await;
    let http = reqwest::Client::new();

    for kind in ["error", "all"] {
        let response = http
            .post(format!("{base}/api/v1/broadcast"))
            .bearer_auth("secret")
            .json(&json!({ "type": kind, "event": "status_update", "data": {} }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let envelope: serde_json::Value = response.json().await.unwrap();
        assert_eq!(envelope["code"], "INVALID_TYPE");
    }
}

#[tokio::test]
async fn unconfigured_admin_token_disables_the_endpoint() {
    let (_state, base) = start_hub(HubConfig::default()).await;
    let http = reqwest::Client::new();
    let response = http
        .post(format!("{base}/api/v1/broadcast"))
        .bearer_auth("anything")
        .json(&json!({ "type": "status", "event": "status_update", "data": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}
