//! Deep research grounded in the archive.
//!
//! One research run is a straight pipeline:
//!
//! ```text
//! query ──► Archive::search(query, top_k) ──► "### Doc n: heading" context
//!                                                     │
//!   report ◄── output[-1].content[0].text ◄── POST /responses (web search on)
//! ```
//!
//! The hosted endpoint is reached through [`ResearchClient`], so the call can
//! be replaced in tests. Exactly one request is made per run: no retries, no
//! streaming, and no timeout beyond the transport default. Deep research
//! runs can take minutes.
//!
//! Nothing is persisted: the context block and the report live only for the
//! duration of the call.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::archive::Archive;
use crate::config::ResearchConfig;
use crate::models::SearchResult;

/// Context sent when the archive has nothing relevant.
pub const NO_DOCUMENTS: &str = "No relevant documents found.";

/// Grounding instructions placed ahead of the document context.
pub const GROUNDING_INSTRUCTIONS: &str = "You are a professional researcher. \
Use the *internal Notion documents* supplied by the developer message when relevant. \
Cite them by the heading given (e.g. 'Doc 3'). \
If you also need public information, you may call the web_search_preview tool.";

const DOCUMENTS_PREFIX: &str = "INTERNAL NOTION DOCUMENTS:\n";

/// Characters of content used as a heading for untitled records.
const HEADING_FALLBACK_CHARS: usize = 32;

#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("{0}")]
    Configuration(String),

    #[error("invalid research request: {0}")]
    InvalidRequest(String),

    #[error("deep research is not available in this build: {0}")]
    DependencyMissing(String),

    #[error("unexpected deep research response: {source}")]
    Protocol {
        #[source]
        source: ResponseShapeError,
    },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("deep research API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("archive search failed: {0:#}")]
    Retrieval(#[source] anyhow::Error),
}

impl From<ResponseShapeError> for ResearchError {
    fn from(source: ResponseShapeError) -> Self {
        ResearchError::Protocol { source }
    }
}

/// Why a response body could not be read as a report.
#[derive(Debug, Error)]
pub enum ResponseShapeError {
    #[error("response body is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing `{0}`")]
    Missing(&'static str),

    #[error("`{0}` is not an array")]
    NotArray(&'static str),

    #[error("`{0}` is empty")]
    Empty(&'static str),

    #[error("`{0}` is not a string")]
    NotString(&'static str),
}

/// Request body for the responses endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchRequest {
    pub model: String,
    pub input: Vec<InputMessage>,
    pub reasoning: Reasoning,
    pub tools: Vec<Tool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputMessage {
    pub role: String,
    pub content: Vec<InputText>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputText {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reasoning {
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: String,
}

impl InputText {
    fn new(text: impl Into<String>) -> Self {
        Self {
            kind: "input_text".to_string(),
            text: text.into(),
        }
    }
}

impl ResearchRequest {
    /// Developer message (instructions + context) followed by the user query.
    pub fn new(model: &str, context: &str, query: &str) -> Self {
        Self {
            model: model.to_string(),
            input: vec![
                InputMessage {
                    role: "developer".to_string(),
                    content: vec![
                        InputText::new(GROUNDING_INSTRUCTIONS),
                        InputText::new(format!("{}{}", DOCUMENTS_PREFIX, context)),
                    ],
                },
                InputMessage {
                    role: "user".to_string(),
                    content: vec![InputText::new(query)],
                },
            ],
            reasoning: Reasoning {
                summary: "auto".to_string(),
            },
            tools: vec![Tool {
                kind: "web_search_preview".to_string(),
            }],
        }
    }
}

/// The hosted deep-research endpoint.
#[async_trait]
pub trait ResearchClient: Send + Sync {
    /// Send one request and return the decoded response body.
    async fn create_response(
        &self,
        api_key: &str,
        request: &ResearchRequest,
    ) -> Result<Value, ResearchError>;
}

/// Client for an OpenAI-compatible `POST {base_url}/responses`.
#[cfg(feature = "deep-research")]
pub struct OpenAiResponsesClient {
    base_url: String,
    http: reqwest::Client,
}

#[cfg(feature = "deep-research")]
impl OpenAiResponsesClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/responses", self.base_url.trim_end_matches('/'))
    }
}

#[cfg(feature = "deep-research")]
#[async_trait]
impl ResearchClient for OpenAiResponsesClient {
    async fn create_response(
        &self,
        api_key: &str,
        request: &ResearchRequest,
    ) -> Result<Value, ResearchError> {
        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ResearchError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = serde_json::from_str(&body).map_err(ResponseShapeError::from)?;
        Ok(value)
    }
}

/// The client this build ships with.
#[cfg(feature = "deep-research")]
pub fn default_client(config: &ResearchConfig) -> Result<Box<dyn ResearchClient>, ResearchError> {
    Ok(Box::new(OpenAiResponsesClient::new(config.base_url.clone())))
}

#[cfg(not(feature = "deep-research"))]
pub fn default_client(_config: &ResearchConfig) -> Result<Box<dyn ResearchClient>, ResearchError> {
    Err(ResearchError::DependencyMissing(
        "rebuild with the `deep-research` feature enabled".to_string(),
    ))
}

/// Per-call overrides. Unset fields fall back to [`ResearchConfig`].
#[derive(Debug, Clone, Default)]
pub struct ResearchOptions {
    pub top_k: Option<usize>,
    pub model: Option<String>,
    /// Explicit credential; otherwise read from `ResearchConfig::api_key_env`.
    pub api_key: Option<String>,
}

/// Run a deep-research query with the default client.
pub async fn deep_research(
    archive: &dyn Archive,
    query: &str,
    options: &ResearchOptions,
    config: &ResearchConfig,
) -> Result<String, ResearchError> {
    let top_k = validate_request(query, options, config)?;
    let client = default_client(config)?;
    run_research(archive, client.as_ref(), query, top_k, options, config).await
}

/// Run a deep-research query through `client`.
pub async fn research_with_client(
    archive: &dyn Archive,
    client: &dyn ResearchClient,
    query: &str,
    options: &ResearchOptions,
    config: &ResearchConfig,
) -> Result<String, ResearchError> {
    let top_k = validate_request(query, options, config)?;
    run_research(archive, client, query, top_k, options, config).await
}

async fn run_research(
    archive: &dyn Archive,
    client: &dyn ResearchClient,
    query: &str,
    top_k: usize,
    options: &ResearchOptions,
    config: &ResearchConfig,
) -> Result<String, ResearchError> {
    let api_key = resolve_api_key(options.api_key.as_deref(), &config.api_key_env)?;
    let model = options.model.as_deref().unwrap_or(&config.model);

    let results = archive
        .search(query, top_k)
        .await
        .map_err(ResearchError::Retrieval)?;
    let used = results.len().min(top_k);
    let context = format_documents(&results[..used]);

    info!(model, top_k, documents = used, "sending deep research request");
    let request = ResearchRequest::new(model, &context, query);
    let response = client.create_response(&api_key, &request).await?;

    let report = extract_report(&response)?;
    debug!(chars = report.len(), "deep research report received");
    Ok(report)
}

fn validate_request(
    query: &str,
    options: &ResearchOptions,
    config: &ResearchConfig,
) -> Result<usize, ResearchError> {
    if query.trim().is_empty() {
        return Err(ResearchError::InvalidRequest(
            "query must not be empty".to_string(),
        ));
    }
    let top_k = options.top_k.unwrap_or(config.top_k);
    if top_k == 0 {
        return Err(ResearchError::InvalidRequest(
            "top_k must be at least 1".to_string(),
        ));
    }
    Ok(top_k)
}

/// Explicit key if non-empty, else the environment variable `env_var`.
pub fn resolve_api_key(explicit: Option<&str>, env_var: &str) -> Result<String, ResearchError> {
    if let Some(key) = explicit.filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }
    match std::env::var(env_var) {
        Ok(key) if !key.is_empty() => Ok(key),
        _ => Err(ResearchError::Configuration(format!(
            "No API key for deep research. Pass one explicitly or set {}.",
            env_var
        ))),
    }
}

/// Render results as the markdown context block, in the order given.
pub fn format_documents(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return NO_DOCUMENTS.to_string();
    }
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("### Doc {}: {}\n{}\n", i + 1, heading(r), r.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The title, or the first characters of the content for untitled records.
pub fn heading(result: &SearchResult) -> String {
    match result.title.as_deref() {
        Some(title) if !title.is_empty() => title.to_string(),
        _ => result
            .content
            .chars()
            .take(HEADING_FALLBACK_CHARS)
            .collect::<String>()
            .replace('\n', " "),
    }
}

/// Pull `output[-1].content[0].text` out of a response body.
pub fn extract_report(response: &Value) -> Result<String, ResponseShapeError> {
    let output = response
        .get("output")
        .ok_or(ResponseShapeError::Missing("output"))?
        .as_array()
        .ok_or(ResponseShapeError::NotArray("output"))?;
    let last = output.last().ok_or(ResponseShapeError::Empty("output"))?;

    let content = last
        .get("content")
        .ok_or(ResponseShapeError::Missing("output[-1].content"))?
        .as_array()
        .ok_or(ResponseShapeError::NotArray("output[-1].content"))?;
    let first = content
        .first()
        .ok_or(ResponseShapeError::Empty("output[-1].content"))?;

    let text = first
        .get("text")
        .ok_or(ResponseShapeError::Missing("output[-1].content[0].text"))?
        .as_str()
        .ok_or(ResponseShapeError::NotString("output[-1].content[0].text"))?;
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // Never set by any test, so credential lookup through it always fails.
    const UNSET_KEY_ENV: &str = "NOTION_ARCHIVE_TEST_KEY_THAT_IS_NEVER_SET";

    struct StubArchive {
        results: Vec<SearchResult>,
        fail: bool,
        calls: Mutex<Vec<(String, usize)>>,
    }

    impl StubArchive {
        fn new(results: Vec<SearchResult>) -> Self {
            Self {
                results,
                fail: false,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Archive for StubArchive {
        async fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<SearchResult>> {
            self.calls.lock().unwrap().push((query.to_string(), limit));
            if self.fail {
                anyhow::bail!("index is locked");
            }
            Ok(self.results.clone())
        }
    }

    struct StubClient {
        response: Value,
        calls: AtomicUsize,
        last_request: Mutex<Option<ResearchRequest>>,
        last_key: Mutex<Option<String>>,
    }

    impl StubClient {
        fn returning(response: Value) -> Self {
            Self {
                response,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
                last_key: Mutex::new(None),
            }
        }

        fn with_report(text: &str) -> Self {
            Self::returning(json!({
                "output": [
                    {"type": "reasoning", "summary": []},
                    {"type": "message", "content": [{"type": "output_text", "text": text}]}
                ]
            }))
        }

        fn context(&self) -> String {
            let req = self.last_request.lock().unwrap();
            let req = req.as_ref().expect("no request recorded");
            let text = &req.input[0].content[1].text;
            text.strip_prefix(DOCUMENTS_PREFIX).unwrap().to_string()
        }
    }

    #[async_trait]
    impl ResearchClient for StubClient {
        async fn create_response(
            &self,
            api_key: &str,
            request: &ResearchRequest,
        ) -> Result<Value, ResearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            *self.last_key.lock().unwrap() = Some(api_key.to_string());
            Ok(self.response.clone())
        }
    }

    struct FailingClient;

    #[async_trait]
    impl ResearchClient for FailingClient {
        async fn create_response(
            &self,
            _api_key: &str,
            _request: &ResearchRequest,
        ) -> Result<Value, ResearchError> {
            Err(ResearchError::Api {
                status: 401,
                body: "invalid api key".into(),
            })
        }
    }

    fn config() -> ResearchConfig {
        ResearchConfig {
            api_key_env: UNSET_KEY_ENV.to_string(),
            ..ResearchConfig::default()
        }
    }

    fn with_key() -> ResearchOptions {
        ResearchOptions {
            api_key: Some("sk-test".into()),
            ..ResearchOptions::default()
        }
    }

    fn docs(n: usize) -> Vec<SearchResult> {
        (1..=n)
            .map(|i| SearchResult::new(format!("body {}", i), Some(&format!("Title {}", i))))
            .collect()
    }

    #[tokio::test]
    async fn test_returns_report_text_verbatim() {
        let archive = StubArchive::new(docs(2));
        let client = StubClient::with_report("X");

        let report = research_with_client(&archive, &client, "q", &with_key(), &config())
            .await
            .unwrap();
        assert_eq!(report, "X");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.last_key.lock().unwrap().as_deref(), Some("sk-test"));
    }

    #[tokio::test]
    async fn test_context_has_one_heading_per_result() {
        let archive = StubArchive::new(docs(3));
        let client = StubClient::with_report("ok");

        research_with_client(&archive, &client, "q", &with_key(), &config())
            .await
            .unwrap();

        let context = client.context();
        assert_eq!(context.matches("### Doc ").count(), 3);
        assert_eq!(
            context,
            "### Doc 1: Title 1\nbody 1\n\n### Doc 2: Title 2\nbody 2\n\n### Doc 3: Title 3\nbody 3\n"
        );
    }

    #[tokio::test]
    async fn test_empty_results_send_sentinel_and_still_call() {
        let archive = StubArchive::new(Vec::new());
        let client = StubClient::with_report("nothing internal");

        let report = research_with_client(&archive, &client, "q", &with_key(), &config())
            .await
            .unwrap();
        assert_eq!(report, "nothing internal");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.context(), NO_DOCUMENTS);
    }

    #[tokio::test]
    async fn test_missing_credential_makes_no_call() {
        let archive = StubArchive::new(docs(1));
        let client = StubClient::with_report("X");

        let err = research_with_client(&archive, &client, "q", &ResearchOptions::default(), &config())
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::Configuration(_)));
        assert!(err.to_string().contains(UNSET_KEY_ENV));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert!(archive.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_credential_from_environment() {
        let env_var = "NOTION_ARCHIVE_TEST_KEY_FROM_ENV";
        std::env::set_var(env_var, "sk-env");
        let config = ResearchConfig {
            api_key_env: env_var.to_string(),
            ..ResearchConfig::default()
        };
        let archive = StubArchive::new(docs(1));
        let client = StubClient::with_report("X");

        research_with_client(&archive, &client, "q", &ResearchOptions::default(), &config)
            .await
            .unwrap();
        assert_eq!(client.last_key.lock().unwrap().as_deref(), Some("sk-env"));
    }

    #[tokio::test]
    async fn test_malformed_response_is_protocol_error() {
        let archive = StubArchive::new(docs(1));
        for body in [
            json!({}),
            json!({"output": []}),
            json!({"output": [{"content": []}]}),
            json!({"output": [{"content": [{"type": "output_text"}]}]}),
            json!({"output": [{"content": [{"text": 42}]}]}),
        ] {
            let client = StubClient::returning(body);
            let err = research_with_client(&archive, &client, "q", &with_key(), &config())
                .await
                .unwrap_err();
            match &err {
                ResearchError::Protocol { .. } => {
                    assert!(std::error::Error::source(&err).is_some());
                }
                other => panic!("expected protocol error, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_request_shape() {
        let archive = StubArchive::new(vec![SearchResult {
            workspace: "Finance".into(),
            tags: vec!["confidential-tag".into()],
            score: 0.987654,
            ..SearchResult::new("Q3 revenue grew.", Some("Board Notes"))
        }]);
        let client = StubClient::with_report("X");

        research_with_client(&archive, &client, "How did Q3 go?", &with_key(), &config())
            .await
            .unwrap();

        let req = client.last_request.lock().unwrap().clone().unwrap();
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["model"], "o4-mini-deep-research-2025-06-26");
        assert_eq!(body["reasoning"], json!({"summary": "auto"}));
        assert_eq!(body["tools"], json!([{"type": "web_search_preview"}]));
        assert_eq!(body["input"][0]["role"], "developer");
        assert_eq!(body["input"][0]["content"][0]["type"], "input_text");
        assert_eq!(body["input"][0]["content"][0]["text"], GROUNDING_INSTRUCTIONS);
        assert_eq!(body["input"][1]["role"], "user");
        assert_eq!(body["input"][1]["content"][0]["text"], "How did Q3 go?");

        let serialized = body.to_string();
        assert!(!serialized.contains("Finance"));
        assert!(!serialized.contains("confidential-tag"));
        assert!(!serialized.contains("0.987654"));
    }

    #[tokio::test]
    async fn test_options_override_model_and_top_k() {
        let archive = StubArchive::new(docs(5));
        let client = StubClient::with_report("X");
        let options = ResearchOptions {
            top_k: Some(2),
            model: Some("o3-deep-research".into()),
            api_key: Some("sk-test".into()),
        };

        research_with_client(&archive, &client, "q", &options, &config())
            .await
            .unwrap();

        assert_eq!(archive.calls.lock().unwrap()[0], ("q".to_string(), 2));
        let req = client.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(req.model, "o3-deep-research");
        // The stub ignores the limit; only top_k records reach the context.
        assert_eq!(client.context().matches("### Doc ").count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let archive = StubArchive::new(docs(1));
        let client = StubClient::with_report("X");

        let err = research_with_client(&archive, &client, "  ", &with_key(), &config())
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::InvalidRequest(_)));

        let options = ResearchOptions {
            top_k: Some(0),
            ..with_key()
        };
        let err = research_with_client(&archive, &client, "q", &options, &config())
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::InvalidRequest(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_api_and_retrieval_errors_propagate() {
        let archive = StubArchive::new(docs(1));
        let err = research_with_client(&archive, &FailingClient, "q", &with_key(), &config())
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::Api { status: 401, .. }));

        let archive = StubArchive {
            fail: true,
            ..StubArchive::new(Vec::new())
        };
        let client = StubClient::with_report("X");
        let err = research_with_client(&archive, &client, "q", &with_key(), &config())
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::Retrieval(_)));
        assert!(err.to_string().contains("index is locked"));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_heading_falls_back_to_content_prefix() {
        let untitled = SearchResult::new("line one\nline two is quite a bit longer", None);
        assert_eq!(heading(&untitled), "line one line two is quite a bit");
        assert_eq!(heading(&untitled).chars().count(), 32);

        let empty_title = SearchResult::new("short\ntext", Some(""));
        assert_eq!(heading(&empty_title), "short text");

        let titled = SearchResult::new("body", Some("Roadmap"));
        assert_eq!(heading(&titled), "Roadmap");
    }

    #[test]
    fn test_format_documents_preserves_content() {
        let results = vec![SearchResult::new("  indented\n\nkept as is  ", Some("A"))];
        assert_eq!(
            format_documents(&results),
            "### Doc 1: A\n  indented\n\nkept as is  \n"
        );
        assert_eq!(format_documents(&[]), NO_DOCUMENTS);
    }

    #[test]
    fn test_extract_report() {
        let body = json!({"output": [{"content": [{"text": "first"}]}, {"content": [{"text": "last"}, {"text": "ignored"}]}]});
        assert_eq!(extract_report(&body).unwrap(), "last");
        assert!(matches!(
            extract_report(&json!({"output": "nope"})),
            Err(ResponseShapeError::NotArray("output"))
        ));
    }

    #[test]
    fn test_resolve_api_key_prefers_explicit() {
        assert_eq!(resolve_api_key(Some("sk-1"), UNSET_KEY_ENV).unwrap(), "sk-1");
        assert!(resolve_api_key(Some(""), UNSET_KEY_ENV).is_err());
        assert!(resolve_api_key(None, UNSET_KEY_ENV).is_err());
    }

    #[tokio::test]
    async fn test_deep_research_validates_before_client_lookup() {
        let archive = StubArchive::new(Vec::new());
        let config = ResearchConfig::default();
        let err = deep_research(&archive, "   ", &ResearchOptions::default(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::InvalidRequest(_)));
        assert!(archive.calls.lock().unwrap().is_empty());
    }

    #[cfg(not(feature = "deep-research"))]
    #[tokio::test]
    async fn test_without_client_archive_still_works() {
        use crate::archive::NotionArchive;
        use crate::config::Config;
        use tempfile::TempDir;

        let tmp = TempDir::new().unwrap();
        let export = tmp.path().join("export").join("Wiki");
        std::fs::create_dir_all(&export).unwrap();
        std::fs::write(
            export.join("Holidays 0123456789abcdef0123456789abcdef.html"),
            r#"<html><head><title>Holidays</title></head><body>
<h1 class="page-title">Holidays</h1>
<div class="page-body"><p>The office closes for the winter break.</p></div>
</body></html>"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.db.path = tmp.path().join("archive.sqlite");
        let archive = NotionArchive::open(config).await.unwrap();
        archive.add_export(&tmp.path().join("export")).await.unwrap();
        let report = archive.build_index().await.unwrap();
        assert_eq!(report.pages_updated, 1);

        let hits = Archive::search(&archive, "winter", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title.as_deref(), Some("Holidays"));

        let options = ResearchOptions {
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let err = deep_research(
            &archive,
            "When is the office closed?",
            &options,
            &archive.config().research,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ResearchError::DependencyMissing(_)));
    }
}
