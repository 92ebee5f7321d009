//! Interactive sessions
//!
//! A session container is started with stdin open and no command timeout.
//! Clients attach later through [`connect`], which bridges the container's
//! streams to an [`InteractiveEventStream`] and an [`InteractiveSessionHandle`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::plan::PlanResolver;
use crate::runner::{InteractiveError, RunError, discard_workspace};
use crate::sandbox::{
    ContainerSpec, DOCKERFILE_NAME, DockerEngine, Recipe, SESSION_LABEL, SandboxError,
    build_context,
};
use crate::session::{
    Session, SessionKind, SessionRegistry, SessionResources, SessionState, new_session_id,
};
use crate::workspace::Workspace;

/// Seconds a session container gets to exit after SIGTERM
const STOP_GRACE_SECS: i32 = 2;

/// Returned to the caller as soon as the session container is running
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveStart {
    pub session_id: String,
    pub language: String,
    /// Path the duplex channel is reachable at
    pub websocket_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Stopped,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveStatus {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_secs: Option<u64>,
}

/// Event from an attached session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractiveEvent {
    /// Data received on stdout
    Stdout(Bytes),

    /// Data received on stderr
    Stderr(Bytes),

    /// The program exited; the code is unknown once the container is gone
    Exited(Option<i64>),
}

/// Container and image owned by an interactive session
struct ContainerResources {
    engine: DockerEngine,
    container: String,
    image: String,
}

#[async_trait]
impl SessionResources for ContainerResources {
    async fn release(&mut self) {
        self.engine
            .discard_container(&self.container, STOP_GRACE_SECS)
            .await;
        self.engine.discard_image(&self.image).await;
    }
}

/// Build the session image and start its container
#[instrument(skip_all)]
pub(crate) async fn start(
    engine: &DockerEngine,
    config: &Config,
    resolver: &PlanResolver,
    registry: &Arc<SessionRegistry>,
    mut workspace: Workspace,
    hint: Option<&str>,
) -> Result<InteractiveStart, RunError> {
    let session_id = new_session_id();
    let tag = format!("cubicle-session-{session_id}");

    let built = async {
        let plan = resolver.resolve_program(workspace.files(), hint).await?;
        let recipe = Recipe::from_plan(&plan);
        let context = build_context(&recipe, &plan, workspace.path(), workspace.files())
            .map_err(SandboxError::Context)?;
        let build_timeout = config.effective_limits(plan.limits.as_ref()).build_timeout();
        engine
            .build_image(&tag, DOCKERFILE_NAME, context, build_timeout)
            .await?;
        Ok::<_, RunError>(plan)
    }
    .await;
    discard_workspace(&mut workspace);

    let plan = match built {
        Ok(plan) => plan,
        Err(e) => {
            engine.discard_image(&tag).await;
            return Err(e);
        }
    };

    let limits = config.effective_limits(plan.limits.as_ref());
    let spec = ContainerSpec::new(&tag, &tag)
        .limits(limits)
        .label(SESSION_LABEL, &session_id)
        .interactive(true)
        .auto_remove(true);

    let container = match engine.create(&spec).await {
        Ok(id) => id,
        Err(e) => {
            engine.discard_image(&tag).await;
            return Err(e.into());
        }
    };
    if let Err(e) = engine.start(&container).await {
        engine.discard_container(&container, 0).await;
        engine.discard_image(&tag).await;
        return Err(e.into());
    }

    let session = Arc::new(
        Session::new(&session_id, SessionKind::Interactive, &plan.language)
            .with_container(&container)
            .with_resources(Box::new(ContainerResources {
                engine: engine.clone(),
                container: container.clone(),
                image: tag,
            })),
    );
    if let Err(e) = registry.insert(session.clone()) {
        session.close(SessionState::Failed).await;
        return Err(e.into());
    }
    watch_exit(engine.clone(), registry.clone(), session_id.clone(), container);

    info!(session = %session_id, language = %plan.language, "interactive session started");
    Ok(InteractiveStart {
        websocket_path: format!(
            "{}/{session_id}",
            config.server.ws_prefix.trim_end_matches('/')
        ),
        session_id,
        language: plan.language,
    })
}

/// Mark the session stopped and release it once its container exits
fn watch_exit(
    engine: DockerEngine,
    registry: Arc<SessionRegistry>,
    session_id: String,
    container: String,
) {
    tokio::spawn(async move {
        let code = engine.wait(&container).await.ok();
        if let Some(session) = registry.get(&session_id) {
            if session.container() == Some(container.as_str()) {
                info!(session = %session_id, ?code, "interactive program exited");
                session.close(SessionState::Stopped).await;
            }
        }
    });
}

pub(crate) fn status(registry: &SessionRegistry, session_id: &str) -> InteractiveStatus {
    match registry.get(session_id) {
        Some(session) if session.kind() == SessionKind::Interactive => InteractiveStatus {
            session_id: session_id.to_owned(),
            status: if session.state().is_terminal() {
                SessionStatus::Stopped
            } else {
                SessionStatus::Running
            },
            language: Some(session.label().to_owned()),
            idle_secs: Some(session.idle_for(tokio::time::Instant::now()).as_secs()),
        },
        _ => InteractiveStatus {
            session_id: session_id.to_owned(),
            status: SessionStatus::NotFound,
            language: None,
            idle_secs: None,
        },
    }
}

/// Attach to a live session's container
pub(crate) async fn connect(
    engine: &DockerEngine,
    registry: &SessionRegistry,
    session_id: &str,
) -> Result<(InteractiveEventStream, InteractiveSessionHandle), InteractiveError> {
    let session = registry
        .get(session_id)
        .filter(|s| s.kind() == SessionKind::Interactive)
        .ok_or_else(|| InteractiveError::NotFound(session_id.to_owned()))?;
    if session.state().is_terminal() {
        return Err(InteractiveError::Terminated);
    }
    let container = session
        .container()
        .ok_or(InteractiveError::Terminated)?
        .to_owned();

    let attached = engine.attach(&container, true).await?;
    session.touch();
    debug!(session = %session_id, "client attached");

    Ok(InteractiveEventStream::new(
        attached.output,
        attached.input,
        engine.clone(),
        container,
        session,
    ))
}

type OutputStream = std::pin::Pin<
    Box<dyn futures_util::Stream<Item = Result<bollard::container::LogOutput, bollard::errors::Error>> + Send>,
>;
type InputSink = std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>;

/// Stream events from an attached session
pub struct InteractiveEventStream {
    rx: mpsc::Receiver<InteractiveEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl InteractiveEventStream {
    /// Pump the attach streams in a background task
    ///
    /// Writes sent through the returned handle are forwarded to the container's
    /// stdin; output arrives as events. Every transfer counts as activity.
    fn new(
        mut output: OutputStream,
        mut input: InputSink,
        engine: DockerEngine,
        container: String,
        session: Arc<Session>,
    ) -> (Self, InteractiveSessionHandle) {
        let (event_tx, event_rx) = mpsc::channel(100);
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(100);

        let handle = tokio::spawn(async move {
            let mut stdin_open = true;
            loop {
                tokio::select! {
                    biased;

                    data = stdin_rx.recv(), if stdin_open => {
                        let Some(data) = data else {
                            stdin_open = false;
                            continue;
                        };
                        session.touch();
                        let written = async {
                            input.write_all(&data).await?;
                            input.flush().await
                        };
                        if let Err(e) = written.await {
                            warn!(error = %e, "failed to write to stdin");
                            stdin_open = false;
                        }
                    }

                    chunk = output.next() => {
                        let event = match chunk {
                            Some(Ok(bollard::container::LogOutput::StdErr { message })) => {
                                InteractiveEvent::Stderr(message)
                            }
                            Some(Ok(bollard::container::LogOutput::StdOut { message }))
                            | Some(Ok(bollard::container::LogOutput::Console { message })) => {
                                InteractiveEvent::Stdout(message)
                            }
                            Some(Ok(bollard::container::LogOutput::StdIn { .. })) => continue,
                            Some(Err(e)) => {
                                warn!(error = %e, "output stream error");
                                break;
                            }
                            None => {
                                let code = match engine.status(&container).await {
                                    Ok(Some(status)) if !status.running => status.exit_code,
                                    _ => None,
                                };
                                let _ = event_tx.send(InteractiveEvent::Exited(code)).await;
                                break;
                            }
                        };
                        session.touch();
                        if event_tx.send(event).await.is_err() {
                            debug!("event receiver dropped");
                            break;
                        }
                    }
                }
            }
        });

        let stream = Self {
            rx: event_rx,
            task: handle,
        };
        (stream, InteractiveSessionHandle { stdin_tx })
    }

    /// Receive the next event
    pub async fn recv(&mut self) -> Option<InteractiveEvent> {
        self.rx.recv().await
    }
}

impl Drop for InteractiveEventStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Handle for writing to an attached session
#[derive(Clone)]
pub struct InteractiveSessionHandle {
    stdin_tx: mpsc::Sender<Vec<u8>>,
}

impl InteractiveSessionHandle {
    /// Write data to stdin
    pub async fn write(&self, data: &[u8]) -> Result<(), InteractiveError> {
        self.stdin_tx
            .send(data.to_vec())
            .await
            .map_err(|_| InteractiveError::Terminated)
    }

    /// Write a line to stdin
    pub async fn write_line(&self, line: &str) -> Result<(), InteractiveError> {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.write(&data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_session_is_not_found() {
        let registry = SessionRegistry::new();
        let status = status(&registry, "nope");
        assert_eq!(status.status, SessionStatus::NotFound);
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "not_found");
        assert!(value.get("language").is_none());
    }

    #[tokio::test]
    async fn status_follows_session_state() {
        let registry = SessionRegistry::new();
        let session = Arc::new(Session::new("s", SessionKind::Interactive, "Python 3"));
        registry.insert(session.clone()).unwrap();
        assert_eq!(status(&registry, "s").status, SessionStatus::Running);
        assert_eq!(status(&registry, "s").language.as_deref(), Some("Python 3"));

        session.close(SessionState::Stopped).await;
        assert_eq!(status(&registry, "s").status, SessionStatus::Stopped);

        assert!(registry.stop("s").await);
        assert_eq!(status(&registry, "s").status, SessionStatus::NotFound);
    }

    #[tokio::test]
    async fn app_sessions_are_not_interactive() {
        let registry = SessionRegistry::new();
        registry
            .insert(Arc::new(Session::new("a", SessionKind::App, "fullstack")))
            .unwrap();
        assert_eq!(status(&registry, "a").status, SessionStatus::NotFound);
    }
}
