//! Integration tests for cubicle
//!
//! Run with: cargo test -p cubicle --features integration-tests
//!
//! Tests that need a reachable Docker daemon are marked `#[ignore]`. To
//! include them:
//!    cargo test -p cubicle --features integration-tests -- --include-ignored

#![cfg(feature = "integration-tests")]

use std::io::{Cursor, Write};

use axum::Router;
use axum::routing::get;
use bytes::Bytes;
use cubicle::{Config, DockerEngine, Runner};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

mod batch;
mod config_loading;
mod interactive;
mod preview;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Build an in-memory zip from `(path, content)` pairs
pub(crate) fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("Failed to start zip entry");
        writer
            .write_all(content.as_bytes())
            .expect("Failed to write zip entry");
    }
    writer.finish().expect("Failed to finish zip").into_inner()
}

/// Serve `archive` over HTTP and return its URL
pub(crate) async fn serve_archive(archive: Vec<u8>) -> String {
    let archive = Bytes::from(archive);
    let app = Router::new().route(
        "/bundle.zip",
        get(move || {
            let archive = archive.clone();
            async move { archive }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind archive server");
    let addr = listener.local_addr().expect("Failed to read archive server address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/bundle.zip")
}

/// Runner backed by the local Docker daemon
pub(crate) fn docker_runner(config: Config) -> Runner {
    let engine = DockerEngine::connect().expect("Failed to create Docker client");
    Runner::new(config, engine)
}

/// Runner whose container engine never answers
pub(crate) fn offline_runner(config: Config) -> Runner {
    let docker = bollard::Docker::connect_with_http("127.0.0.1:9", 1, bollard::API_DEFAULT_VERSION)
        .expect("Failed to create Docker client");
    Runner::new(config, DockerEngine::from_client(docker))
}
