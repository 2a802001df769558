#![cfg(feature = "deep-research")]

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use notion_archive::archive::NotionArchive;
use notion_archive::config::{Config, ResearchConfig};
use notion_archive::research::{
    deep_research, research_with_client, OpenAiResponsesClient, ResearchError, ResearchOptions,
};

#[derive(Clone, Default)]
struct Recorded {
    bodies: Arc<Mutex<Vec<Value>>>,
    auth: Arc<Mutex<Vec<String>>>,
}

/// Serve `POST /v1/responses` with a fixed status and body, recording requests.
async fn spawn_stub(status: StatusCode, reply: Value) -> (String, Recorded) {
    let recorded = Recorded::default();
    let state = (recorded.clone(), status, reply);

    let app = Router::new()
        .route(
            "/v1/responses",
            post(
                |State((rec, status, reply)): State<(Recorded, StatusCode, Value)>,
                 headers: HeaderMap,
                 Json(body): Json<Value>| async move {
                    rec.bodies.lock().unwrap().push(body);
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    rec.auth.lock().unwrap().push(auth);
                    (status, Json(reply))
                },
            ),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/v1", addr), recorded)
}

async fn archive_with_pages() -> (TempDir, NotionArchive) {
    let tmp = TempDir::new().unwrap();
    let export = tmp.path().join("export");
    fs::create_dir_all(&export).unwrap();
    fs::write(
        export.join("Pricing 0123456789abcdef0123456789abcdef.html"),
        r#"<html><head><title>Pricing</title></head><body>
<h1 class="page-title">Pricing</h1>
<div class="page-body"><p>Enterprise seats are priced per quarter.</p></div>
</body></html>"#,
    )
    .unwrap();

    let mut config = Config::default();
    config.db.path = tmp.path().join("archive.sqlite");
    let archive = NotionArchive::open(config).await.unwrap();
    archive.add_export(&export).await.unwrap();
    archive.build_index().await.unwrap();
    (tmp, archive)
}

fn research_config(base_url: &str) -> ResearchConfig {
    ResearchConfig {
        base_url: base_url.to_string(),
        api_key_env: "NOTION_ARCHIVE_RESEARCH_IT_KEY_NEVER_SET".to_string(),
        ..ResearchConfig::default()
    }
}

fn with_key() -> ResearchOptions {
    ResearchOptions {
        api_key: Some("sk-stub".to_string()),
        ..ResearchOptions::default()
    }
}

#[tokio::test]
async fn test_report_from_stub_endpoint() {
    let reply = json!({
        "id": "resp_1",
        "output": [
            {"type": "web_search_call", "status": "completed"},
            {"type": "message", "content": [{"type": "output_text", "text": "Seats are priced quarterly [Doc 1]."}]}
        ]
    });
    let (base_url, recorded) = spawn_stub(StatusCode::OK, reply).await;
    let (_tmp, archive) = archive_with_pages().await;

    let report = deep_research(&archive, "How are enterprise seats priced?", &with_key(), &research_config(&base_url))
        .await
        .unwrap();
    assert_eq!(report, "Seats are priced quarterly [Doc 1].");

    let bodies = recorded.bodies.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert_eq!(body["model"], "o4-mini-deep-research-2025-06-26");
    assert_eq!(body["tools"][0]["type"], "web_search_preview");
    let context = body["input"][0]["content"][1]["text"].as_str().unwrap();
    assert!(context.starts_with("INTERNAL NOTION DOCUMENTS:\n### Doc 1: Pricing\n"));
    assert!(context.contains("Enterprise seats are priced per quarter."));
    assert_eq!(body["input"][1]["content"][0]["text"], "How are enterprise seats priced?");

    assert_eq!(recorded.auth.lock().unwrap()[0], "Bearer sk-stub");
}

#[tokio::test]
async fn test_no_matches_still_calls_endpoint() {
    let reply = json!({"output": [{"content": [{"text": "public sources only"}]}]});
    let (base_url, recorded) = spawn_stub(StatusCode::OK, reply).await;
    let (_tmp, archive) = archive_with_pages().await;

    let report = deep_research(&archive, "xyzzyplugh", &with_key(), &research_config(&base_url))
        .await
        .unwrap();
    assert_eq!(report, "public sources only");

    let bodies = recorded.bodies.lock().unwrap();
    assert_eq!(
        bodies[0]["input"][0]["content"][1]["text"],
        "INTERNAL NOTION DOCUMENTS:\nNo relevant documents found."
    );
}

#[tokio::test]
async fn test_api_error_surfaces_status() {
    let reply = json!({"error": {"message": "Incorrect API key provided"}});
    let (base_url, recorded) = spawn_stub(StatusCode::UNAUTHORIZED, reply).await;
    let (_tmp, archive) = archive_with_pages().await;

    let err = deep_research(&archive, "pricing", &with_key(), &research_config(&base_url))
        .await
        .unwrap_err();
    match err {
        ResearchError::Api { status, body } => {
            assert_eq!(status, 401);
            assert!(body.contains("Incorrect API key"));
        }
        other => panic!("expected API error, got {:?}", other),
    }
    assert_eq!(recorded.bodies.lock().unwrap().len(), 1, "no retries");
}

#[tokio::test]
async fn test_unexpected_shape_is_protocol_error() {
    let (base_url, _recorded) = spawn_stub(StatusCode::OK, json!({"output": []})).await;
    let (_tmp, archive) = archive_with_pages().await;

    let client = OpenAiResponsesClient::new(base_url.clone());
    let err = research_with_client(&archive, &client, "pricing", &with_key(), &research_config(&base_url))
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::Protocol { .. }), "got {:?}", err);
    assert!(std::error::Error::source(&err).is_some());
}

#[tokio::test]
async fn test_missing_key_never_contacts_endpoint() {
    let reply = json!({"output": [{"content": [{"text": "unreachable"}]}]});
    let (base_url, recorded) = spawn_stub(StatusCode::OK, reply).await;
    let (_tmp, archive) = archive_with_pages().await;

    let err = deep_research(&archive, "pricing", &ResearchOptions::default(), &research_config(&base_url))
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::Configuration(_)));
    assert!(recorded.bodies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transport_error() {
    let (_tmp, archive) = archive_with_pages().await;

    // Bind then drop to get a port nothing listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = deep_research(
        &archive,
        "pricing",
        &with_key(),
        &research_config(&format!("http://{}/v1", addr)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ResearchError::Transport(_)), "got {:?}", err);
}
