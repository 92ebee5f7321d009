//! Process-based app previews
//!
//! A preview runs the submission's own frontend and backend as host
//! processes. Booting walks `Created → InstallingDependencies → Starting →
//! Running`; the session is registered only once every component is ready,
//! and any failure on the way tears down whatever was already started.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::select_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub use crate::app::process::{AppProcess, Completion, Exit, ExitWatch, OutputLine, ProcessSpec};

pub mod process;
pub mod readiness;

use crate::app::process::{OUTPUT_DRAIN, drain, run_to_completion};
use crate::app::readiness::{is_ready, reported_port};
use crate::config::Config;
use crate::plan::{ComponentPlan, PlanError, PlanResolver, ProjectPlan, scan};
use crate::runner::discard_workspace;
use crate::session::{
    LogBuffer, PortAllocator, PortError, PortLease, PortPurpose, Session, SessionError,
    SessionKind, SessionPorts, SessionRegistry, SessionResources, SessionState, new_session_id,
};
use crate::types::{ErrorKind, StopOutcome};
use crate::workspace::{Workspace, WorkspaceError};

/// How long a ready frontend may take to print the URL it actually bound
const PORT_SETTLE: Duration = Duration::from_secs(2);

/// Errors that abort an app preview
#[derive(Debug, Error)]
pub enum AppError {
    #[error("required toolchain binary '{0}' is not installed")]
    ToolchainMissing(String),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("failed to start {role} process: {source}")]
    Spawn {
        role: PortPurpose,
        #[source]
        source: io::Error,
    },

    #[error("{role} dependency install failed ({exit})")]
    InstallFailed {
        role: PortPurpose,
        exit: Exit,
        output: String,
    },

    #[error("{role} dependency install exceeded {}s", .timeout.as_secs())]
    InstallTimeout {
        role: PortPurpose,
        timeout: Duration,
        output: String,
    },

    #[error("{role} exited before becoming ready ({exit})")]
    Crashed {
        role: PortPurpose,
        exit: Exit,
        output: String,
    },

    #[error("{role} did not become ready within {}s", .timeout.as_secs())]
    StartupTimeout {
        role: PortPurpose,
        timeout: Duration,
        output: String,
    },
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::ToolchainMissing(_) => ErrorKind::ResourceError,
            AppError::Workspace(e) => e.kind(),
            AppError::Plan(e) => e.kind(),
            AppError::Port(e) => e.kind(),
            AppError::Session(e) => e.kind(),
            AppError::Spawn { .. } => ErrorKind::Internal,
            AppError::InstallFailed { .. } => ErrorKind::BuildError,
            AppError::Crashed { .. } => ErrorKind::RuntimeError,
            AppError::InstallTimeout { .. } | AppError::StartupTimeout { .. } => {
                ErrorKind::StartupTimeout
            }
        }
    }

    /// State the boot ended in
    pub fn state(&self) -> SessionState {
        match self {
            AppError::InstallTimeout { .. } | AppError::StartupTimeout { .. } => {
                SessionState::TimedOut
            }
            _ => SessionState::Failed,
        }
    }

    /// Captured process output, when there is any
    pub fn raw_output(&self) -> Option<String> {
        match self {
            AppError::InstallFailed { output, .. }
            | AppError::InstallTimeout { output, .. }
            | AppError::Crashed { output, .. }
            | AppError::StartupTimeout { output, .. }
                if !output.trim().is_empty() =>
            {
                Some(output.trim().to_owned())
            }
            _ => None,
        }
    }
}

/// Returned once every component is ready
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppPreview {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,
    pub open_browser_url: String,
    pub status: SessionState,
    pub analysis: ProjectPlan,
}

/// Live view of a preview session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    pub session_id: String,
    pub status: SessionState,
    pub ports: SessionPorts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// Processes and port leases acquired while booting
#[derive(Debug, Default)]
struct Components {
    processes: Vec<AppProcess>,
    leases: Vec<PortLease>,
}

impl Components {
    async fn release(&mut self, grace: Duration) {
        for process in self.processes.drain(..) {
            process.terminate(grace).await;
        }
        self.leases.clear();
    }

    fn exit_watches(&self) -> Vec<(String, ExitWatch)> {
        self.processes
            .iter()
            .map(|p| (p.label().to_owned(), p.exit_watch()))
            .collect()
    }
}

/// Everything a running preview owns
struct AppResources {
    components: Components,
    workspace: Workspace,
    grace: Duration,
}

#[async_trait]
impl SessionResources for AppResources {
    async fn release(&mut self) {
        self.components.release(self.grace).await;
        discard_workspace(&mut self.workspace);
    }
}

/// Outcome of waiting for a component to come up
#[derive(Debug, PartialEq, Eq)]
enum Readiness {
    /// Ready, with the port the process reported binding if any
    Ready(Option<u16>),
    Exited(Exit),
    TimedOut,
}

/// Boots and supervises app previews
#[derive(Clone)]
pub struct AppOrchestrator {
    config: Arc<Config>,
    resolver: PlanResolver,
    registry: Arc<SessionRegistry>,
    ports: PortAllocator,
}

impl std::fmt::Debug for AppOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppOrchestrator")
            .field("leased_ports", &self.ports.leased_count())
            .finish_non_exhaustive()
    }
}

impl AppOrchestrator {
    pub fn new(
        config: Arc<Config>,
        resolver: PlanResolver,
        registry: Arc<SessionRegistry>,
        ports: PortAllocator,
    ) -> Self {
        Self {
            config,
            resolver,
            registry,
            ports,
        }
    }

    pub fn with_resolver(mut self, resolver: PlanResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Install, start and register every component of `workspace`
    ///
    /// The workspace is owned by the session on success and removed on
    /// failure.
    #[instrument(skip_all, fields(session = tracing::field::Empty))]
    pub async fn start(&self, mut workspace: Workspace) -> Result<AppPreview, AppError> {
        let session_id = new_session_id();
        tracing::Span::current().record("session", session_id.as_str());
        let logs = Arc::new(LogBuffer::new(self.config.app.log_max_lines));
        let grace = self.config.app.stop_grace();

        let mut components = Components::default();
        let booted = self
            .boot(&session_id, &workspace, &logs, &mut components)
            .await;
        let (plan, ports) = match booted {
            Ok(booted) => booted,
            Err(e) => {
                info!(state = ?e.state(), error = %e, "app preview failed");
                components.release(grace).await;
                discard_workspace(&mut workspace);
                return Err(e);
            }
        };

        let watches = components.exit_watches();
        let session = Arc::new(
            Session::new(&session_id, SessionKind::App, &plan.project_type)
                .with_ports(ports)
                .with_logs(logs)
                .with_resources(Box::new(AppResources {
                    components,
                    workspace,
                    grace,
                })),
        );
        if let Err(e) = self.registry.insert(session.clone()) {
            session.close(SessionState::Failed).await;
            return Err(e.into());
        }
        monitor(self.registry.clone(), session, watches);

        let frontend_url = ports.frontend.map(|p| self.url(p));
        let backend_url = ports.backend.map(|p| self.url(p));
        let open_browser_url = frontend_url
            .clone()
            .or_else(|| backend_url.clone())
            .unwrap_or_default();
        info!(?frontend_url, ?backend_url, "app preview running");

        Ok(AppPreview {
            session_id,
            frontend_url,
            backend_url,
            open_browser_url,
            status: SessionState::Running,
            analysis: plan,
        })
    }

    async fn boot(
        &self,
        session_id: &str,
        workspace: &Workspace,
        logs: &Arc<LogBuffer>,
        components: &mut Components,
    ) -> Result<(ProjectPlan, SessionPorts), AppError> {
        let app = &self.config.app;
        let mut state = SessionState::Created;

        let plan = self.resolver.resolve_project(workspace).await?;
        info!(project_type = %plan.project_type, source = ?plan.source, "project plan resolved");

        advance(session_id, &mut state, SessionState::InstallingDependencies);
        check_toolchain(&app.toolchain)?;
        for (role, component) in roles(&plan) {
            if let Some(ref install) = component.install_command {
                self.install(role, component, install, workspace, logs)
                    .await?;
            }
        }

        advance(session_id, &mut state, SessionState::Starting);
        let mut ports = SessionPorts::default();
        let mut backend_url = None;

        if let Some(ref backend) = plan.backend {
            let backend_dir = workspace.resolve_dir(&backend.dir)?;
            let preferred = match scan::backend_port(workspace.files(), &backend.dir) {
                Some(port) => Some(port),
                None => env_file_port(&backend_dir).await,
            }
            .or(backend.preferred_port);
            debug!(?preferred, "backend port preference");
            let lease = self.ports.lease(
                PortPurpose::Backend,
                app.backend_port_base,
                app.port_window,
                preferred,
            )?;
            let port = lease.port();
            components.leases.push(lease);

            let spec = ProcessSpec::new("backend", &backend.start_command, backend_dir)
            .env("PORT", port.to_string());
            self.launch(
                spec,
                PortPurpose::Backend,
                app.backend_start_timeout(),
                None,
                logs,
                components,
            )
            .await?;

            ports.backend = Some(port);
            backend_url = Some(self.url(port));
        }

        if let Some(ref frontend) = plan.frontend {
            let lease = self.ports.lease(
                PortPurpose::Frontend,
                app.frontend_port_base,
                app.port_window,
                frontend.preferred_port,
            )?;
            let port = lease.port();
            components.leases.push(lease);

            let mut spec = ProcessSpec::new(
                "frontend",
                &frontend.start_command,
                workspace.resolve_dir(&frontend.dir)?,
            )
            .env("PORT", port.to_string())
            .env("BROWSER", "none");
            if let Some(ref url) = backend_url {
                for var in &app.backend_url_vars {
                    spec = spec.env(var, url);
                }
            }
            let reported = self
                .launch(
                    spec,
                    PortPurpose::Frontend,
                    app.frontend_start_timeout(),
                    ports.backend,
                    logs,
                    components,
                )
                .await?;

            let actual = reported.unwrap_or(port);
            if actual != port {
                info!(requested = port, actual, "frontend bound a different port");
            }
            ports.frontend = Some(actual);
        }

        advance(session_id, &mut state, SessionState::Running);
        Ok((plan, ports))
    }

    async fn install(
        &self,
        role: PortPurpose,
        component: &ComponentPlan,
        command: &str,
        workspace: &Workspace,
        logs: &Arc<LogBuffer>,
    ) -> Result<(), AppError> {
        let timeout = self.config.app.install_timeout();
        let spec = ProcessSpec::new(
            format!("{role}-install"),
            command,
            workspace.resolve_dir(&component.dir)?,
        );
        debug!(%role, %command, "installing dependencies");

        let completion = run_to_completion(&spec, timeout, logs.clone())
            .await
            .map_err(|source| AppError::Spawn { role, source })?;
        match completion {
            Completion::Exited(exit) if exit.success() => Ok(()),
            Completion::Exited(exit) => Err(AppError::InstallFailed {
                role,
                exit,
                output: spec.tail(logs),
            }),
            Completion::TimedOut => Err(AppError::InstallTimeout {
                role,
                timeout,
                output: spec.tail(logs),
            }),
        }
    }

    /// Spawn a component and wait until it is ready
    ///
    /// The process is kept in `components` whatever happens so that the
    /// caller can tear it down.
    async fn launch(
        &self,
        spec: ProcessSpec,
        role: PortPurpose,
        timeout: Duration,
        ignore_port: Option<u16>,
        logs: &Arc<LogBuffer>,
        components: &mut Components,
    ) -> Result<Option<u16>, AppError> {
        let mut process = AppProcess::spawn(&spec, logs.clone())
            .map_err(|source| AppError::Spawn { role, source })?;
        let lines = process.take_lines();
        let readiness = match lines {
            Some(lines) => wait_ready(&process, lines, role, timeout, ignore_port).await,
            None => Readiness::Ready(None),
        };
        components.processes.push(process);

        match readiness {
            Readiness::Ready(reported) => {
                info!(%role, "component ready");
                Ok(reported)
            }
            Readiness::Exited(exit) => Err(AppError::Crashed {
                role,
                exit,
                output: spec.tail(logs),
            }),
            Readiness::TimedOut => Err(AppError::StartupTimeout {
                role,
                timeout,
                output: spec.tail(logs),
            }),
        }
    }

    fn url(&self, port: u16) -> String {
        format!("http://{}:{port}", self.config.app.public_host)
    }

    /// Stop a preview session
    pub async fn stop(&self, session_id: &str) -> StopOutcome {
        let known = self
            .registry
            .get(session_id)
            .is_some_and(|s| s.kind() == SessionKind::App);
        if known && self.registry.stop(session_id).await {
            StopOutcome::stopped(session_id)
        } else {
            StopOutcome::not_found(session_id)
        }
    }

    pub fn status(&self, session_id: &str) -> Option<AppStatus> {
        let session = self.app_session(session_id)?;
        let now = Instant::now();
        let ports = session.ports();
        Some(AppStatus {
            session_id: session_id.to_owned(),
            status: session.state(),
            ports,
            frontend_url: ports.frontend.map(|p| self.url(p)),
            backend_url: ports.backend.map(|p| self.url(p)),
            age_secs: session.age(now).as_secs(),
            idle_secs: session.idle_for(now).as_secs(),
        })
    }

    /// Buffered output lines keyed by stream
    pub fn logs(&self, session_id: &str) -> Option<BTreeMap<String, Vec<String>>> {
        self.app_session(session_id)
            .map(|session| session.logs().snapshot())
    }

    fn app_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.registry
            .get(session_id)
            .filter(|s| s.kind() == SessionKind::App)
    }
}

fn roles(plan: &ProjectPlan) -> impl Iterator<Item = (PortPurpose, &ComponentPlan)> {
    [
        (PortPurpose::Backend, plan.backend.as_ref()),
        (PortPurpose::Frontend, plan.frontend.as_ref()),
    ]
    .into_iter()
    .filter_map(|(role, component)| component.map(|c| (role, c)))
}

fn advance(session_id: &str, state: &mut SessionState, next: SessionState) {
    info!(session = %session_id, from = ?*state, to = ?next, "app state transition");
    *state = next;
}

fn check_toolchain(binaries: &[String]) -> Result<(), AppError> {
    for binary in binaries {
        match which::which(binary) {
            Ok(path) => debug!(%binary, path = %path.display(), "toolchain binary found"),
            Err(_) => return Err(AppError::ToolchainMissing(binary.clone())),
        }
    }
    Ok(())
}

/// `PORT=` declared in a component's `.env`
async fn env_file_port(dir: &Path) -> Option<u16> {
    let text = tokio::fs::read_to_string(dir.join(".env")).await.ok()?;
    scan::dotenv_port(&text)
}

/// Watch output until a readiness line, an exit or the deadline
async fn wait_ready(
    process: &AppProcess,
    mut lines: mpsc::UnboundedReceiver<OutputLine>,
    role: PortPurpose,
    timeout: Duration,
    ignore_port: Option<u16>,
) -> Readiness {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut reported = None;
    let mut open = true;
    let port_of = |text: &str| reported_port(text).filter(|p| Some(*p) != ignore_port);

    loop {
        tokio::select! {
            line = lines.recv(), if open => match line {
                Some(line) => {
                    if let Some(port) = port_of(&line.text) {
                        reported = Some(port);
                    }
                    if is_ready(role, &line.text) {
                        break;
                    }
                }
                None => open = false,
            },
            exit = process.wait() => {
                drain(lines, OUTPUT_DRAIN).await;
                return Readiness::Exited(exit);
            }
            _ = &mut deadline => return Readiness::TimedOut,
        }
    }

    if role == PortPurpose::Frontend && reported.is_none() {
        reported = tokio::time::timeout(PORT_SETTLE, async {
            while let Some(line) = lines.recv().await {
                if let Some(port) = port_of(&line.text) {
                    return Some(port);
                }
            }
            None
        })
        .await
        .ok()
        .flatten();
    }
    Readiness::Ready(reported)
}

/// Fail the session when any of its processes exits while it is live
fn monitor(registry: Arc<SessionRegistry>, session: Arc<Session>, watches: Vec<(String, ExitWatch)>) {
    if watches.is_empty() {
        return;
    }
    tokio::spawn(async move {
        let exits = watches
            .into_iter()
            .map(|(label, watch)| Box::pin(async move { (label, watch.wait().await) }));
        let ((label, exit), _, _) = select_all(exits).await;

        let live = registry
            .get(session.id())
            .is_some_and(|s| Arc::ptr_eq(&s, &session));
        if !live || session.state() != SessionState::Running {
            return;
        }
        if registry.remove(session.id()).is_some() {
            warn!(session = %session.id(), %label, %exit, "app component crashed");
            session.close(SessionState::Failed).await;
        }
    });
}
