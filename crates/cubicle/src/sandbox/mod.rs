//! Container sandbox
//!
//! Wraps the Docker engine for building per-submission images and running
//! resource-capped containers from them.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use thiserror::Error;

pub use crate::sandbox::engine::{ContainerStatus, DockerEngine, MANAGED_LABEL, SESSION_LABEL};
pub use crate::sandbox::recipe::{DOCKERFILE_NAME, Recipe, build_context, is_image_reference};
use crate::types::{ErrorKind, ResourceLimits, TRUNCATION_NOTICE};

mod engine;
mod recipe;

/// Errors that occur while talking to the container engine
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("image build failed")]
    BuildFailed { output: String },

    #[error("image build exceeded the {}s time limit", .0.as_secs_f64())]
    BuildTimeout(Duration),

    #[error("failed to assemble build context: {0}")]
    Context(#[source] std::io::Error),

    #[error("container {0} not found")]
    NotFound(String),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::BuildFailed { .. } => ErrorKind::BuildError,
            SandboxError::BuildTimeout(_) => ErrorKind::RuntimeTimeout,
            _ => ErrorKind::Internal,
        }
    }
}

/// Description of a container to create
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    image: String,
    name: String,
    limits: ResourceLimits,
    labels: HashMap<String, String>,
    interactive: bool,
    auto_remove: bool,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_owned(), "true".to_owned());
        Self {
            image: image.into(),
            name: name.into(),
            limits: ResourceLimits::default(),
            labels,
            interactive: false,
            auto_remove: false,
        }
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Keep stdin open for an attached client
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Have the engine remove the container once it stops
    pub fn auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the engine's create-container body
    pub fn build(&self) -> ContainerCreateBody {
        let network = self.limits.network_enabled();
        let memory = self.limits.memory_bytes();

        ContainerCreateBody {
            image: Some(self.image.clone()),
            labels: Some(self.labels.clone()),
            attach_stdin: Some(self.interactive),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(self.interactive),
            stdin_once: Some(false),
            tty: Some(false),
            network_disabled: Some(!network),
            host_config: Some(HostConfig {
                memory,
                memory_swap: memory,
                nano_cpus: self.limits.nano_cpus(),
                pids_limit: self.limits.max_processes,
                network_mode: Some(if network { "bridge" } else { "none" }.to_owned()),
                auto_remove: Some(self.auto_remove),
                cap_drop: Some(vec!["ALL".to_owned()]),
                security_opt: Some(vec!["no-new-privileges".to_owned()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Demultiplexed container output
#[derive(Debug, Default, Clone)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: bool,
}

/// Splits an attach stream into stdout and stderr, each capped at `limit` bytes
#[derive(Debug)]
pub struct OutputCollector {
    limit: usize,
    output: CapturedOutput,
}

impl OutputCollector {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            output: CapturedOutput::default(),
        }
    }

    pub fn push(&mut self, chunk: LogOutput) {
        let (buf, message) = match chunk {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                (&mut self.output.stdout, message)
            }
            LogOutput::StdErr { message } => (&mut self.output.stderr, message),
            LogOutput::StdIn { .. } => return,
        };
        if append_capped(buf, &message, self.limit) {
            self.output.truncated = true;
        }
    }

    pub fn finish(self) -> CapturedOutput {
        self.output
    }
}

/// Append up to `limit` bytes in total; returns whether anything was cut
fn append_capped(buf: &mut Vec<u8>, bytes: &[u8], limit: usize) -> bool {
    let notice = TRUNCATION_NOTICE.as_bytes();
    if buf.ends_with(notice) && buf.len() >= limit {
        return true;
    }
    let room = limit.saturating_sub(buf.len());
    if bytes.len() <= room {
        buf.extend_from_slice(bytes);
        return false;
    }
    buf.extend_from_slice(&bytes[..room]);
    buf.extend_from_slice(notice);
    true
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn spec_defaults_to_no_network() {
        let body = ContainerSpec::new("img", "name").build();
        let host = body.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(body.network_disabled, Some(true));
        assert_eq!(host.auto_remove, Some(false));
        assert_eq!(body.open_stdin, Some(false));
    }

    #[test]
    fn spec_applies_limits() {
        let limits = ResourceLimits::new()
            .with_memory_mb(128)
            .with_cpus(1.0)
            .with_max_processes(32);
        let body = ContainerSpec::new("img", "name").limits(limits).build();
        let host = body.host_config.unwrap();
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(1_000_000_000));
        assert_eq!(host.pids_limit, Some(32));
    }

    #[test]
    fn spec_interactive_keeps_stdin_open() {
        let body = ContainerSpec::new("img", "name")
            .interactive(true)
            .auto_remove(true)
            .build();
        assert_eq!(body.open_stdin, Some(true));
        assert_eq!(body.attach_stdin, Some(true));
        assert_eq!(body.stdin_once, Some(false));
        assert_eq!(body.host_config.unwrap().auto_remove, Some(true));
    }

    #[test]
    fn spec_network_when_declared() {
        let body = ContainerSpec::new("img", "name")
            .limits(ResourceLimits::new().with_network(true))
            .build();
        assert_eq!(body.network_disabled, Some(false));
        assert_eq!(body.host_config.unwrap().network_mode.as_deref(), Some("bridge"));
    }

    #[test]
    fn spec_labels_include_managed_marker() {
        let body = ContainerSpec::new("img", "n").label(SESSION_LABEL, "abc").build();
        let labels = body.labels.unwrap();
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.get(SESSION_LABEL).map(String::as_str), Some("abc"));
    }

    #[test]
    fn collector_demultiplexes_streams() {
        let mut collector = OutputCollector::new(1024);
        collector.push(LogOutput::StdOut { message: Bytes::from_static(b"out1 ") });
        collector.push(LogOutput::StdErr { message: Bytes::from_static(b"err") });
        collector.push(LogOutput::StdOut { message: Bytes::from_static(b"out2") });
        collector.push(LogOutput::StdIn { message: Bytes::from_static(b"ignored") });
        let output = collector.finish();
        assert_eq!(output.stdout, b"out1 out2");
        assert_eq!(output.stderr, b"err");
        assert!(!output.truncated);
    }

    #[test]
    fn collector_caps_each_stream() {
        let mut collector = OutputCollector::new(4);
        collector.push(LogOutput::StdOut { message: Bytes::from_static(b"abcdef") });
        collector.push(LogOutput::StdOut { message: Bytes::from_static(b"more") });
        collector.push(LogOutput::StdErr { message: Bytes::from_static(b"ok") });
        let output = collector.finish();
        let expected = [b"abcd".as_slice(), TRUNCATION_NOTICE.as_bytes()].concat();
        assert_eq!(output.stdout, expected);
        assert_eq!(output.stderr, b"ok");
        assert!(output.truncated);
    }
}
