//! Pluggable code-understanding analyzer
//!
//! The resolver hands an [`AnalysisRequest`] to an [`Analyzer`] and gets back
//! a loosely-typed JSON object; validation against the response contract
//! happens in the resolver, never here.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::AnalyzerConfig;

const PROGRAM_INSTRUCTIONS: &str = "You inspect a single-program student submission and describe how to build and run it in a Docker container. \
Answer with one JSON object and nothing else, with the keys: \
\"language\" (string), \"buildCommand\" (string, empty if nothing needs building), \
\"runCommand\" (string), \"baseImage\" (Docker image reference), \
\"setupCommands\" (array of strings, optional). Commands run with /app as working directory.";

const PROJECT_INSTRUCTIONS: &str = "You inspect a student web project and describe how to run it locally. \
Answer with one JSON object and nothing else, with the keys: \
\"projectType\" (string), \"hasFrontend\" (boolean), \"hasBackend\" (boolean), \
\"frontendDir\", \"backendDir\" (paths relative to the project root), \
\"frontendInstallCommand\", \"frontendStartCommand\", \"backendInstallCommand\", \"backendStartCommand\" (strings), \
\"frontendPort\", \"backendPort\" (numbers, optional).";

/// Errors from a single analyzer call
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer request failed: {0}")]
    Transport(String),

    #[error("analyzer returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("analyzer response is not a JSON object: {0}")]
    Malformed(String),

    #[error("analyzer response is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("analyzer response field '{field}' is invalid: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

impl AnalyzerError {
    /// Whether reissuing the same request may succeed
    ///
    /// Answers are sampled, so one that breaks the response contract can be
    /// followed by one that honors it. A rejected request (bad credentials,
    /// unknown model) fails the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            AnalyzerError::Status { status, .. } => matches!(*status, 408 | 429 | 500..=u16::MAX),
            AnalyzerError::Transport(_)
            | AnalyzerError::Malformed(_)
            | AnalyzerError::MissingField(_)
            | AnalyzerError::InvalidField { .. } => true,
        }
    }
}

/// A file excerpt sent to the analyzer
#[derive(Debug, Clone, Serialize)]
pub struct SourceExcerpt {
    pub path: String,
    pub content: String,
}

/// What the analyzer is asked to describe
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AnalysisRequest {
    Program {
        tree: String,
        sources: Vec<SourceExcerpt>,
        hint: Option<String>,
    },
    Project {
        tree: String,
        manifests: Vec<SourceExcerpt>,
    },
}

impl AnalysisRequest {
    fn instructions(&self) -> &'static str {
        match self {
            AnalysisRequest::Program { .. } => PROGRAM_INSTRUCTIONS,
            AnalysisRequest::Project { .. } => PROJECT_INSTRUCTIONS,
        }
    }

    /// User-message body describing the submission
    pub fn render(&self) -> String {
        let mut out = String::new();
        let (tree, excerpts, heading) = match self {
            AnalysisRequest::Program { tree, sources, hint } => {
                if let Some(hint) = hint {
                    out.push_str(&format!("Declared category: {hint}\n\n"));
                }
                (tree, sources, "Source files")
            }
            AnalysisRequest::Project { tree, manifests } => (tree, manifests, "Manifest files"),
        };
        out.push_str("Folder tree:\n");
        out.push_str(tree);
        out.push_str(&format!("\n{heading}:\n"));
        for excerpt in excerpts {
            out.push_str(&format!("\n--- {} ---\n{}\n", excerpt.path, excerpt.content));
        }
        out
    }
}

/// Something that can turn a submission description into a structured answer
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Value, AnalyzerError>;
}

/// Analyzer backed by an OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone)]
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpAnalyzer {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
            timeout: Duration::from_secs(60),
        }
    }

    /// Build from configuration; `None` when no endpoint is configured
    pub fn from_config(client: reqwest::Client, config: &AnalyzerConfig) -> Option<Self> {
        let endpoint = config.endpoint.as_deref()?.trim();
        if endpoint.is_empty() {
            return None;
        }
        let mut analyzer = Self::new(client, endpoint, &config.model)
            .timeout(Duration::from_secs(config.request_timeout_secs));
        if let Ok(key) = std::env::var(&config.api_key_env) {
            analyzer = analyzer.api_key(key);
        }
        Some(analyzer)
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn body(&self, request: &AnalysisRequest) -> Value {
        json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": request.instructions() },
                { "role": "user", "content": request.render() },
            ],
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Value, AnalyzerError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&self.body(request));
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AnalyzerError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyzerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| AnalyzerError::Malformed(e.to_string()))?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| AnalyzerError::Malformed("no message content".to_owned()))?;

        debug!(len = content.len(), "analyzer answered");
        parse_object(content)
    }
}

/// Parse the first JSON object embedded in `text` (tolerates code fences and prose)
pub fn parse_object(text: &str) -> Result<Value, AnalyzerError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let slice = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => return Err(AnalyzerError::Malformed("no JSON object found".to_owned())),
    };
    let value: Value =
        serde_json::from_str(slice).map_err(|e| AnalyzerError::Malformed(e.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(AnalyzerError::Malformed("top-level value is not an object".to_owned()))
    }
}

/// Ensure every key in `fields` is present and non-null
pub fn require_fields(value: &Value, fields: &[&'static str]) -> Result<(), AnalyzerError> {
    for &field in fields {
        match value.get(field) {
            None | Some(Value::Null) => return Err(AnalyzerError::MissingField(field)),
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_object_plain() {
        let value = parse_object(r#"{"language":"Java"}"#).unwrap();
        assert_eq!(value["language"], "Java");
    }

    #[test]
    fn parse_object_inside_code_fence() {
        let text = "Here you go:\n```json\n{\"hasFrontend\": true}\n```\n";
        let value = parse_object(text).unwrap();
        assert_eq!(value["hasFrontend"], true);
    }

    #[test]
    fn parse_object_rejects_garbage() {
        assert!(matches!(parse_object("sorry, no"), Err(AnalyzerError::Malformed(_))));
        assert!(matches!(parse_object("} {"), Err(AnalyzerError::Malformed(_))));
        assert!(matches!(parse_object("{not json}"), Err(AnalyzerError::Malformed(_))));
    }

    #[test]
    fn require_fields_reports_first_missing() {
        let value = json!({"language": "Go", "runCommand": null});
        match require_fields(&value, &["language", "runCommand"]) {
            Err(AnalyzerError::MissingField(field)) => assert_eq!(field, "runCommand"),
            other => panic!("expected MissingField, got {other:?}"),
        }
        assert!(require_fields(&value, &["language"]).is_ok());
    }

    #[test]
    fn rejected_requests_are_not_transient() {
        let status = |status| AnalyzerError::Status {
            status,
            body: String::new(),
        };
        assert!(!status(400).is_transient());
        assert!(!status(401).is_transient());
        assert!(!status(404).is_transient());
        assert!(status(429).is_transient());
        assert!(status(503).is_transient());
        assert!(AnalyzerError::Transport("reset".into()).is_transient());
        assert!(AnalyzerError::MissingField("projectType").is_transient());
    }

    #[test]
    fn from_config_without_endpoint_is_none() {
        let config = AnalyzerConfig::default();
        assert!(HttpAnalyzer::from_config(reqwest::Client::new(), &config).is_none());
    }

    #[test]
    fn request_render_includes_tree_and_excerpts() {
        let request = AnalysisRequest::Project {
            tree: "client/\n  package.json\n".to_owned(),
            manifests: vec![SourceExcerpt {
                path: "client/package.json".to_owned(),
                content: "{\"name\":\"web\"}".to_owned(),
            }],
        };
        let text = request.render();
        assert!(text.contains("client/\n  package.json"));
        assert!(text.contains("--- client/package.json ---"));
        assert_eq!(request.instructions(), PROJECT_INSTRUCTIONS);
    }

    #[test]
    fn body_asks_for_json_object() {
        let analyzer = HttpAnalyzer::new(reqwest::Client::new(), "http://x", "m");
        let request = AnalysisRequest::Program {
            tree: String::new(),
            sources: vec![],
            hint: Some("java".to_owned()),
        };
        let body = analyzer.body(&request);
        assert_eq!(body["model"], "m");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert!(body["messages"][1]["content"]
            .as_str()
            .unwrap()
            .contains("Declared category: java"));
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn parse_object_never_panics(s in ".*") {
            let _ = parse_object(&s);
        }
    }
}
