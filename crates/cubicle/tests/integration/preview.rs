use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use cubicle::plan::{AnalysisRequest, Analyzer, AnalyzerError};
use cubicle::{Config, ErrorKind, Runner, SessionState, SubmissionRef, server};
use serde_json::{Value, json};
use tower::ServiceExt;

use super::{offline_runner, serve_archive, zip_archive};

/// Analyzer that always gives the same answer
struct Fixed(Value);

#[async_trait]
impl Analyzer for Fixed {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<Value, AnalyzerError> {
        Ok(self.0.clone())
    }
}

fn free_base(span: u16) -> u16 {
    let mut base = 40_000 + (std::process::id() % 10_000) as u16;
    loop {
        if (base..base + span).all(|p| std::net::TcpListener::bind(("0.0.0.0", p)).is_ok()) {
            return base;
        }
        base += span;
    }
}

fn preview_runner(answer: Value) -> Runner {
    let mut config = Config::default();
    config.app.toolchain = vec!["sh".to_owned()];
    config.app.install_timeout_secs = 10;
    config.app.backend_start_timeout_secs = 10;
    config.app.frontend_start_timeout_secs = 10;
    config.app.stop_grace_secs = 1;
    config.app.port_window = 10;
    config.app.backend_port_base = free_base(20);
    config.app.frontend_port_base = config.app.backend_port_base + 10;
    config.analyzer.max_attempts = 1;
    offline_runner(config).with_analyzer(Arc::new(Fixed(answer)))
}

fn fullstack() -> Value {
    json!({
        "projectType": "fullstack",
        "hasFrontend": true,
        "hasBackend": true,
        "backendDir": "api",
        "backendInstallCommand": "echo deps ready",
        "backendStartCommand": "echo \"Server running on port $PORT\"; sleep 60",
        "frontendDir": "web",
        "frontendInstallCommand": "true",
        "frontendStartCommand": "echo \"api at $REACT_APP_API_URL\"; echo 'webpack compiled'; sleep 60",
    })
}

async fn project_url() -> String {
    serve_archive(zip_archive(&[
        ("api/README.md", "backend"),
        ("web/README.md", "frontend"),
    ]))
    .await
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    serde_json::from_slice(&bytes).expect("Body is not JSON")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("Failed to build request")
}

#[tokio::test]
async fn test_preview_from_downloaded_archive() {
    let runner = preview_runner(fullstack());
    let url = project_url().await;

    let preview = runner
        .start_preview(&SubmissionRef::new(url))
        .await
        .expect("Preview failed to start");
    assert_eq!(preview.status, SessionState::Running);
    assert_eq!(preview.analysis.project_type, "fullstack");

    let backend = preview.backend_url.clone().expect("backend url");
    let frontend = preview.frontend_url.clone().expect("frontend url");
    assert_eq!(preview.open_browser_url, frontend);
    assert!(backend.starts_with("http://localhost:"));

    let status = runner.app().status(&preview.session_id).expect("status");
    assert_eq!(status.status, SessionState::Running);
    assert!(status.ports.backend.is_some());
    assert!(status.ports.frontend.is_some());

    let logs = runner.app().logs(&preview.session_id).expect("logs");
    let frontend_out = logs
        .iter()
        .filter(|(stream, _)| stream.starts_with("frontend"))
        .flat_map(|(_, lines)| lines.iter())
        .any(|line| line == &format!("api at {backend}"));
    assert!(frontend_out, "frontend should see the backend url: {logs:?}");

    let outcome = runner.app().stop(&preview.session_id).await;
    assert!(outcome.success);
    assert!(runner.app().status(&preview.session_id).is_none());
    assert!(runner.registry().is_empty());
}

#[tokio::test]
async fn test_preview_install_failure_over_http() {
    let mut answer = fullstack();
    answer["backendInstallCommand"] = json!("echo 'npm ERR! missing script' >&2; exit 1");
    let runner = preview_runner(answer);
    let url = project_url().await;

    let response = server::router(runner.clone())
        .oneshot(post_json("/api/preview", json!({ "archiveUrl": url })))
        .await
        .expect("Request failed");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let body = body_json(response).await;
    assert_eq!(body["kind"], json!(ErrorKind::BuildError));
    assert!(body["rawOutput"]
        .as_str()
        .is_some_and(|raw| raw.contains("npm ERR! missing script")));
    assert!(runner.registry().is_empty());
}

#[tokio::test]
async fn test_preview_lifecycle_over_http() {
    let runner = preview_runner(fullstack());
    let app = server::router(runner.clone());
    let url = project_url().await;

    let response = app
        .clone()
        .oneshot(post_json("/api/preview", json!({ "archiveUrl": url })))
        .await
        .expect("Request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let started = body_json(response).await;
    let id = started["sessionId"].as_str().expect("sessionId").to_owned();
    assert_eq!(started["status"], "running");

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/sessions")
                .body(Body::empty())
                .expect("Failed to build request"),
        )
        .await
        .expect("Request failed");
    let sessions = body_json(response).await;
    assert_eq!(sessions.as_array().map(Vec::len), Some(1));

    let response = app
        .clone()
        .oneshot(post_json(&format!("/api/sessions/{id}/touch"), json!({})))
        .await
        .expect("Request failed");
    assert_eq!(body_json(response).await["success"], true);

    let response = app
        .clone()
        .oneshot(post_json(&format!("/api/preview/{id}/stop"), json!({})))
        .await
        .expect("Request failed");
    assert_eq!(body_json(response).await["success"], true);

    let response = app
        .oneshot(
            Request::get(format!("/api/preview/{id}/status"))
                .body(Body::empty())
                .expect("Failed to build request"),
        )
        .await
        .expect("Request failed");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_crashed_preview_is_torn_down() {
    let mut answer = fullstack();
    answer["backendStartCommand"] = json!("echo 'listening'; sleep 5; exit 7");
    let runner = preview_runner(answer);
    let url = project_url().await;

    let preview = runner
        .start_preview(&SubmissionRef::new(url))
        .await
        .expect("Preview failed to start");

    let mut gone = false;
    for _ in 0..100 {
        if runner.app().status(&preview.session_id).is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(gone, "crashed preview should be removed");
}

#[tokio::test]
async fn test_backend_only_preview_uses_scanned_port() {
    let runner = preview_runner(json!({
        "projectType": "api",
        "hasFrontend": false,
        "hasBackend": true,
        "backendDir": "server",
        "backendStartCommand": "echo \"listening on $PORT\"; sleep 60",
    }));
    let base = runner.config().app.backend_port_base;
    let literal = base + 3;
    let url = serve_archive(zip_archive(&[
        ("server/package.json", r#"{"main": "server.js"}"#),
        (
            "server/server.js",
            &format!("const app = require('express')();\napp.listen({literal});\n"),
        ),
    ]))
    .await;

    let preview = runner
        .start_preview(&SubmissionRef::new(url))
        .await
        .expect("Preview failed to start");
    assert!(preview.frontend_url.is_none());
    assert_eq!(
        preview.backend_url.as_deref(),
        Some(format!("http://localhost:{literal}").as_str())
    );
    assert_eq!(preview.open_browser_url, format!("http://localhost:{literal}"));

    assert!(runner.app().stop(&preview.session_id).await.success);
}
