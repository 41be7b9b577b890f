use axum::body::Body;
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use oncall_config::{Cache, Config, Identity, Opsgenie, Server, Store};
use oncall_contracts::TeamMentionConfig;
use oncall_server::build_app;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tower::util::ServiceExt;

fn test_config(api_url: &str) -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        opsgenie: Opsgenie {
            api_url: api_url.to_string(),
            api_key: Some("test-key".to_string()),
            api_key_env: None,
            timeout_ms: 2_000,
            retry_max_attempts: 1,
            retry_backoff_ms: 0,
        },
        identity: Identity {
            mode: "opsgenie".to_string(),
            attribute: "mattermost_username".to_string(),
        },
        cache: Cache { ttl_ms: 3_600_000 },
        store: Store {
            kind: "memory".to_string(),
            sqlite_path: None,
            retention_secs: 0,
        },
        teams: vec![TeamMentionConfig {
            team: "SRE".to_string(),
            mention_token: "sre".to_string(),
            schedule_names: vec!["s1".to_string()],
            escalation_identity: "mgr".to_string(),
        }],
    }
}

fn test_config_sqlite(api_url: &str, db_path: &str) -> Config {
    let mut cfg = test_config(api_url);
    cfg.store.kind = "sqlite".to_string();
    cfg.store.sqlite_path = Some(db_path.to_string());
    cfg
}

fn temp_db() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    std::env::temp_dir()
        .join(format!("oncall-api-{nanos}.db"))
        .to_string_lossy()
        .to_string()
}

fn mock_alice_on_call(server: &MockServer) -> (httpmock::Mock<'_>, httpmock::Mock<'_>) {
    let schedule = server.mock(|when, then| {
        when.method(GET)
            .path("/v2/schedules/s1/on-calls")
            .header("Authorization", "GenieKey test-key");
        then.status(200)
            .json_body(json!({"data": {"onCallRecipients": ["a@x.com"]}}));
    });
    let user = server.mock(|when, then| {
        when.method(GET).path("/v2/users/a@x.com");
        then.status(200).json_body(json!({
            "data": {"fullName": "Alice", "details": {"mattermost_username": ["alice"]}}
        }));
    });
    (schedule, user)
}

fn rewrite_request(message: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/rewrite")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "message": message }).to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn healthz_ok() {
    let app = build_app(test_config("http://127.0.0.1:9")).unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rewrite_tags_on_call_person() {
    let server = MockServer::start_async().await;
    let (schedule, user) = mock_alice_on_call(&server);
    let app = build_app(test_config(&server.base_url())).unwrap();

    let response = app.oneshot(rewrite_request("ping @sre now")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = json_body(response).await;
    assert_eq!(payload["message"], "ping [@sre]( * @alice * ) now");
    schedule.assert();
    user.assert();
}

#[tokio::test]
async fn rewrite_falls_back_to_escalation_identity() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/v2/schedules/s1/on-calls");
        then.status(200)
            .json_body(json!({"data": {"onCallRecipients": []}}));
    });
    let app = build_app(test_config(&server.base_url())).unwrap();

    let response = app.oneshot(rewrite_request("ping @sre now")).await.unwrap();
    let payload = json_body(response).await;
    assert_eq!(payload["message"], "ping [@sre]( * @mgr * ) now");
}

#[tokio::test]
async fn rewrite_leaves_token_when_service_is_down() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/v2/schedules/s1/on-calls");
        then.status(503).body("maintenance");
    });
    let app = build_app(test_config(&server.base_url())).unwrap();

    let response = app.oneshot(rewrite_request("ping @sre now")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = json_body(response).await;
    assert_eq!(payload["message"], "ping @sre now");
}

#[tokio::test]
async fn repeated_rewrites_hit_the_cache() {
    let server = MockServer::start_async().await;
    let (schedule, _user) = mock_alice_on_call(&server);
    let app = build_app(test_config(&server.base_url())).unwrap();

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(rewrite_request("@sre please look"))
            .await
            .unwrap();
        let payload = json_body(response).await;
        assert_eq!(payload["message"], "[@sre]( * @alice * ) please look");
    }
    assert_eq!(schedule.calls(), 1);
}

#[tokio::test]
async fn on_call_endpoint_reports_identities() {
    let server = MockServer::start_async().await;
    mock_alice_on_call(&server);
    let app = build_app(test_config(&server.base_url())).unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/oncall/sre")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = json_body(response).await;
    assert_eq!(payload["mention"], "sre");
    assert_eq!(payload["identities"], json!(["alice"]));
    assert!(payload["fetchedAt"].is_string());
}

#[tokio::test]
async fn on_call_endpoint_rejects_unknown_mention() {
    let app = build_app(test_config("http://127.0.0.1:9")).unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/oncall/dba")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let payload = json_body(response).await;
    assert_eq!(payload["error"]["code"], "unknown_mention");
}

#[tokio::test]
async fn on_call_endpoint_surfaces_bad_credential() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/v2/schedules/s1/on-calls");
        then.status(401).json_body(json!({"message": "Key is not valid"}));
    });
    let app = build_app(test_config(&server.base_url())).unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/oncall/sre")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let payload = json_body(response).await;
    assert_eq!(payload["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn replacing_teams_takes_effect_for_next_message() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/v2/schedules/d1/on-calls");
        then.status(200)
            .json_body(json!({"data": {"onCallRecipients": []}}));
    });
    let app = build_app(test_config(&server.base_url())).unwrap();

    let put = Request::builder()
        .method("PUT")
        .uri("/v1/teams")
        .header("content-type", "application/json")
        .body(Body::from(
            json!([{
                "team": "Databases",
                "mention": "dba",
                "schedules": ["d1"],
                "escalation_manager": "dba-lead"
            }])
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(put).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["teams"], 1);

    let response = app
        .clone()
        .oneshot(rewrite_request("@sre and @dba"))
        .await
        .unwrap();
    let payload = json_body(response).await;
    assert_eq!(payload["message"], "@sre and [@dba]( * @dba-lead * )");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/teams")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let payload = json_body(response).await;
    assert_eq!(payload[0]["mention"], "dba");
}

#[tokio::test]
async fn invalid_team_set_is_rejected() {
    let app = build_app(test_config("http://127.0.0.1:9")).unwrap();
    let put = Request::builder()
        .method("PUT")
        .uri("/v1/teams")
        .header("content-type", "application/json")
        .body(Body::from(
            json!([
                {"mention": "sre", "schedules": ["s1"], "escalation_manager": "mgr"},
                {"mention": "sre", "schedules": ["s2"], "escalation_manager": "mgr"}
            ])
            .to_string(),
        ))
        .unwrap();
    let response = app.oneshot(put).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let payload = json_body(response).await;
    assert_eq!(payload["error"]["code"], "invalid_teams");
}

#[tokio::test]
async fn cache_clear_forces_new_lookup() {
    let server = MockServer::start_async().await;
    let (schedule, _user) = mock_alice_on_call(&server);
    let app = build_app(test_config(&server.base_url())).unwrap();

    app.clone().oneshot(rewrite_request("@sre")).await.unwrap();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/cache/clear")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    app.oneshot(rewrite_request("@sre")).await.unwrap();
    assert_eq!(schedule.calls(), 2);
}

#[tokio::test]
async fn sqlite_store_serves_stale_after_restart_when_service_is_down() {
    let db_path = temp_db();
    {
        let server = MockServer::start_async().await;
        mock_alice_on_call(&server);
        let app = build_app(test_config_sqlite(&server.base_url(), &db_path)).unwrap();
        let response = app.oneshot(rewrite_request("@sre")).await.unwrap();
        assert_eq!(json_body(response).await["message"], "[@sre]( * @alice * )");
    }

    let server = MockServer::start_async().await;
    let down = server.mock(|when, then| {
        when.method(GET).path("/v2/schedules/s1/on-calls");
        then.status(503).body("maintenance");
    });
    let mut cfg = test_config_sqlite(&server.base_url(), &db_path);
    cfg.cache.ttl_ms = 1;
    std::thread::sleep(std::time::Duration::from_millis(5));
    let app = build_app(cfg).unwrap();
    let response = app.oneshot(rewrite_request("@sre")).await.unwrap();
    assert_eq!(json_body(response).await["message"], "[@sre]( * @alice * )");
    assert_eq!(down.calls(), 1);
}
