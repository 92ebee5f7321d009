//! Code runner for Cubicle
//!
//! The [`Runner`] ties every execution mode together: it materializes the
//! submission, resolves a plan and routes it to the batch executor, the
//! interactive session manager or the app orchestrator.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument};

pub use crate::runner::interactive::{
    InteractiveEvent, InteractiveEventStream, InteractiveSessionHandle, InteractiveStart,
    InteractiveStatus, SessionStatus,
};

mod batch;
mod interactive;

use crate::app::{AppError, AppOrchestrator, AppPreview};
use crate::config::Config;
use crate::plan::{Analyzer, HttpAnalyzer, PlanError, PlanResolver};
use crate::sandbox::{DockerEngine, SandboxError};
use crate::session::{PortAllocator, Reaper, SessionError, SessionRegistry};
use crate::types::{BatchOutput, ErrorKind, ErrorReport, StopOutcome, SubmissionRef};
use crate::workspace::{Workspace, WorkspaceError};

/// Errors that occur while running a submission
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid submission: {0}")]
    Input(String),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("build failed")]
    Build { output: String },

    #[error("build exceeded the {}s time limit", .0.as_secs_f64())]
    BuildTimeout(Duration),

    #[error("program exceeded the {}s time limit", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("runtime error: {message}")]
    Runtime { message: String, stderr: String },

    #[error(transparent)]
    App(#[from] AppError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("sandbox error: {0}")]
    Sandbox(SandboxError),
}

impl From<SandboxError> for RunError {
    fn from(error: SandboxError) -> Self {
        match error {
            SandboxError::BuildFailed { output } => RunError::Build { output },
            SandboxError::BuildTimeout(limit) => RunError::BuildTimeout(limit),
            other => RunError::Sandbox(other),
        }
    }
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Input(_) => ErrorKind::InputError,
            RunError::Workspace(e) => e.kind(),
            RunError::Plan(e) => e.kind(),
            RunError::Build { .. } => ErrorKind::BuildError,
            RunError::BuildTimeout(_) | RunError::Timeout(_) => ErrorKind::RuntimeTimeout,
            RunError::Runtime { .. } => ErrorKind::RuntimeError,
            RunError::App(e) => e.kind(),
            RunError::Session(e) => e.kind(),
            RunError::Sandbox(e) => e.kind(),
        }
    }

    /// Structured form handed back to callers
    pub fn report(&self) -> ErrorReport {
        let report = ErrorReport::new(self.kind(), self.to_string());
        match self {
            RunError::Build { output } => report.with_raw_output(output.trim()),
            RunError::Runtime { stderr, .. } if !stderr.trim().is_empty() => {
                report.with_raw_output(stderr.trim())
            }
            RunError::App(e) => match e.raw_output() {
                Some(output) => report.with_raw_output(output),
                None => report,
            },
            _ => report,
        }
    }
}

/// Errors from interactive attach and I/O
#[derive(Debug, Error)]
pub enum InteractiveError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session already terminated")]
    Terminated,

    #[error("failed to attach: {0}")]
    Attach(#[from] SandboxError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// High-level entry point for every execution mode
#[derive(Clone)]
pub struct Runner {
    config: Arc<Config>,
    engine: DockerEngine,
    http: reqwest::Client,
    resolver: PlanResolver,
    registry: Arc<SessionRegistry>,
    app: AppOrchestrator,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("resolver", &self.resolver)
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Create a runner; an HTTP analyzer is attached when one is configured
    pub fn new(config: Config, engine: DockerEngine) -> Self {
        let config = Arc::new(config);
        let http = reqwest::Client::new();
        let mut resolver = PlanResolver::new(config.clone());
        if let Some(analyzer) = HttpAnalyzer::from_config(http.clone(), &config.analyzer) {
            resolver = resolver.with_analyzer(Arc::new(analyzer));
        }
        let registry = Arc::new(SessionRegistry::new());
        let app = AppOrchestrator::new(
            config.clone(),
            resolver.clone(),
            registry.clone(),
            PortAllocator::new(),
        );
        Self {
            config,
            engine,
            http,
            resolver,
            registry,
            app,
        }
    }

    /// Replace the plan analyzer
    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.resolver = PlanResolver::new(self.config.clone()).with_analyzer(analyzer);
        self.app = self.app.with_resolver(self.resolver.clone());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &DockerEngine {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn app(&self) -> &AppOrchestrator {
        &self.app
    }

    /// Reaper bound to this runner's registry
    pub fn reaper(&self) -> Reaper {
        Reaper::new(self.registry.clone(), &self.config.sessions)
    }

    /// Validate the reference and download its archive
    #[instrument(skip(self, submission), fields(submission = submission.submission_id.as_deref()))]
    pub async fn materialize(&self, submission: &SubmissionRef) -> Result<Workspace, RunError> {
        submission.validate().map_err(RunError::Input)?;
        let workspace =
            Workspace::download(&self.http, submission.archive_url.trim(), &self.config.workspace)
                .await?;
        info!(files = workspace.files().len(), "submission materialized");
        Ok(workspace)
    }

    /// Build and run a submission to completion
    pub async fn execute(&self, submission: &SubmissionRef) -> Result<BatchOutput, RunError> {
        let workspace = self.materialize(submission).await?;
        self.execute_workspace(workspace, submission.hint()).await
    }

    /// Build and run an already materialized workspace; the workspace is
    /// removed before this returns
    pub async fn execute_workspace(
        &self,
        mut workspace: Workspace,
        hint: Option<&str>,
    ) -> Result<BatchOutput, RunError> {
        let plan = match self.resolver.resolve_program(workspace.files(), hint).await {
            Ok(plan) => plan,
            Err(e) => {
                discard_workspace(&mut workspace);
                return Err(e.into());
            }
        };
        batch::execute(&self.engine, &self.config, workspace, &plan).await
    }

    /// Start an interactive session and return its handle immediately
    pub async fn start_interactive(
        &self,
        submission: &SubmissionRef,
    ) -> Result<InteractiveStart, RunError> {
        let workspace = self.materialize(submission).await?;
        self.start_interactive_workspace(workspace, submission.hint())
            .await
    }

    pub async fn start_interactive_workspace(
        &self,
        workspace: Workspace,
        hint: Option<&str>,
    ) -> Result<InteractiveStart, RunError> {
        interactive::start(
            &self.engine,
            &self.config,
            &self.resolver,
            &self.registry,
            workspace,
            hint,
        )
        .await
    }

    /// Attach to a running interactive session
    pub async fn connect(
        &self,
        session_id: &str,
    ) -> Result<(InteractiveEventStream, InteractiveSessionHandle), InteractiveError> {
        interactive::connect(&self.engine, &self.registry, session_id).await
    }

    pub async fn stop_interactive(&self, session_id: &str) -> StopOutcome {
        if self.registry.stop(session_id).await {
            StopOutcome::stopped(session_id)
        } else {
            StopOutcome::not_found(session_id)
        }
    }

    pub fn interactive_status(&self, session_id: &str) -> InteractiveStatus {
        interactive::status(&self.registry, session_id)
    }

    /// Boot a multi-component app for live preview
    pub async fn start_preview(&self, submission: &SubmissionRef) -> Result<AppPreview, RunError> {
        let workspace = self.materialize(submission).await?;
        Ok(self.app.start(workspace).await?)
    }

    /// Stop every live session
    pub async fn shutdown(&self) -> usize {
        self.registry.shutdown().await
    }
}

pub(crate) fn discard_workspace(workspace: &mut Workspace) {
    if let Err(e) = workspace.cleanup() {
        tracing::warn!(path = %workspace.path().display(), error = %e, "failed to remove workspace");
    }
}
