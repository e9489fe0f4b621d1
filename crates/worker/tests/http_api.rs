//! Router-level tests: CORS policy, the loopback guard, body coercion, and
//! the health/readiness contract.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;
use tokio_util::sync::CancellationToken;

use cm_domain::error::Result;
use cm_domain::paths::DataDir;
use cm_domain::settings::Settings;
use cm_process::ProcessRegistry;
use cm_providers::{AgentReply, CompletionRequest, MemoryAgent};
use cm_storage::{PendingQueue, Store};
use cm_vector::{VectorClient, VectorEndpoint, VectorSync};
use cm_worker::api;
use cm_worker::runtime::events::EventBroadcaster;
use cm_worker::runtime::session_manager::SessionManager;
use cm_worker::runtime::Runtime;
use cm_worker::state::AppState;

struct SilentAgent;

#[async_trait::async_trait]
impl MemoryAgent for SilentAgent {
    fn provider_id(&self) -> &'static str {
        "claude"
    }

    async fn complete(&self, _req: CompletionRequest<'_>) -> Result<AgentReply> {
        Ok(AgentReply {
            text: String::new(),
            provider_session_id: Some("stub-mem".into()),
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}

fn test_state(settings_json: &str) -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = DataDir::new(tmp.path().to_path_buf());
    std::fs::write(data_dir.settings_path(), settings_json).unwrap();
    let settings = Arc::new(Settings::load_from(data_dir).unwrap());

    let store = Arc::new(Store::open_in_memory().unwrap());
    let queue = Arc::new(PendingQueue::new(store.clone()));
    let vector = Arc::new(VectorSync::new(
        Arc::new(VectorClient::new(VectorEndpoint::Remote {
            host: "127.0.0.1".into(),
            port: 1,
            api_key: None,
        })),
        false,
    ));
    let runtime = Arc::new(Runtime {
        settings,
        store,
        queue,
        vector,
        registry: Arc::new(ProcessRegistry::new(2)),
        events: EventBroadcaster::new(),
        primary: Arc::new(SilentAgent),
        fallback: None,
    });
    let sessions = Arc::new(SessionManager::new(runtime.clone()));
    let state = AppState {
        runtime,
        sessions,
        initialized: Arc::new(AtomicBool::new(true)),
        shutdown: CancellationToken::new(),
        restart_requested: Arc::new(AtomicBool::new(false)),
    };
    (state, tmp)
}

fn local_app(state: AppState) -> axum::Router {
    api::router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 51000))))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Health / readiness / version
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn health_is_always_ok() {
    let (state, _tmp) = test_state("{}");
    let response = local_app(state)
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["initialized"], true);
    assert!(json["pid"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn readiness_gates_on_initialization() {
    let (state, _tmp) = test_state("{}");
    state
        .initialized
        .store(false, std::sync::atomic::Ordering::Release);
    let app = local_app(state.clone());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/readiness")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.mark_initialized();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/readiness")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn version_reports_the_crate_version() {
    let (state, _tmp) = test_state("{}");
    let response = local_app(state)
        .oneshot(
            Request::builder()
                .uri("/api/version")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CORS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn localhost_origin_is_allowed() {
    let (state, _tmp) = test_state("{}");
    let response = local_app(state)
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .header(header::ORIGIN, "http://localhost:37777")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some("http://localhost:37777")
    );
}

#[tokio::test]
async fn foreign_origin_gets_no_cors_headers() {
    let (state, _tmp) = test_state("{}");
    let response = local_app(state)
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .header(header::ORIGIN, "http://evil.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .is_none());
}

#[tokio::test]
async fn port_suffix_spoof_is_rejected() {
    let (state, _tmp) = test_state("{}");
    let response = local_app(state)
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .header(header::ORIGIN, "http://localhost:3000.evil.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .is_none());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loopback guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn non_loopback_peer_is_forbidden() {
    let (state, _tmp) = test_state("{}");
    let app = api::router(state)
        .layer(MockConnectInfo(SocketAddr::from(([10, 1, 2, 3], 51000))));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session + retrieval surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn excluded_projects_are_skipped_on_init() {
    let (state, _tmp) = test_state(r#"{"CLAUDE_MEM_EXCLUDED_PROJECTS": "secret-stuff"}"#);
    let response = local_app(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/sessions/init")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"contentSessionId":"cs-1","project":"secret-stuff","userPrompt":"hi","platform":"test"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["skipped"], true);
    assert!(json["sessionDbId"].is_null());
}

#[tokio::test]
async fn observation_event_returns_202_and_enqueues() {
    let (state, _tmp) = test_state("{}");
    let app = local_app(state.clone());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/sessions/observations")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"contentSessionId":"cs-1","tool_name":"Bash",
                        "tool_input":{"command":"ls"},"tool_response":"file.txt",
                        "cwd":"/work/my-proj"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["queued"], true);

    // The session row was derived from the cwd basename.
    let row = state
        .runtime
        .store
        .get_session_by_content_id("cs-1")
        .unwrap()
        .unwrap();
    assert_eq!(row.project, "my-proj");
}

#[tokio::test]
async fn batch_ids_accept_string_encoded_arrays() {
    let (state, _tmp) = test_state("{}");
    // Seed two observations directly through the transaction layer.
    let drafts = vec![
        cm_domain::types::ObservationDraft {
            title: Some("a".into()),
            narrative: Some("na".into()),
            ..Default::default()
        },
        cm_domain::types::ObservationDraft {
            title: Some("b".into()),
            narrative: Some("nb".into()),
            ..Default::default()
        },
    ];
    let batch = cm_storage::transactions::store_observations(
        &state.runtime.store,
        "mem-1",
        "proj",
        &drafts,
        None,
        None,
        0,
        None,
    )
    .unwrap();

    let ids = format!(
        "\"[{},{}]\"",
        batch.observation_ids[0], batch.observation_ids[1]
    );
    let response = local_app(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/observations/batch")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(format!(r#"{{"ids":{ids}}}"#)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["observations"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_observation_is_404() {
    let (state, _tmp) = test_state("{}");
    let response = local_app(state)
        .oneshot(
            Request::builder()
                .uri("/api/observation/999")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn queue_view_and_clear_endpoints() {
    let (state, _tmp) = test_state("{}");
    let app = local_app(state.clone());

    // Enqueue through the store directly to avoid spinning a generator.
    let (sid, _) = state
        .runtime
        .store
        .create_or_get_session("cs-q", "proj", "u", None)
        .unwrap();
    state
        .runtime
        .queue
        .enqueue(
            sid,
            "cs-q",
            &cm_domain::types::NewPendingMessage {
                kind: cm_domain::types::MessageKind::Observation,
                tool_name: Some("Bash".into()),
                tool_input: None,
                tool_response: None,
                last_assistant_message: None,
                cwd: None,
            },
        )
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/pending-queue")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["hasPendingWork"], true);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/pending-queue/all")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["removed"], 1);
}
