//! Orchestration for running untrusted classroom submissions.
//!
//! Cubicle takes a zipped submission and either grades it in a throwaway
//! container, keeps it alive in a container behind a websocket for manual
//! testing, or boots it as a frontend/backend app for live preview.
//!
//! # Features
//!
//! - **Batch runs**: build an image from a derived recipe, run it under resource caps, classify the exit.
//! - **Interactive sessions**: long-lived containers with stdin attached, relayed over a websocket.
//! - **App previews**: dependency install, port leasing, readiness detection and crash monitoring for host processes.
//! - **Plan resolution**: static scanning with an optional pluggable analyzer.
//! - **Session reaping**: idle and lifetime caps enforced by a background sweep.

pub use app::{AppError, AppOrchestrator, AppPreview, AppStatus};
pub use config::{Config, ConfigError, EXAMPLE_CONFIG, Language};
pub use plan::{ExecutionPlan, PlanError, PlanResolver, ProgramPlan, ProjectPlan};
pub use runner::{
    InteractiveError, InteractiveEvent, InteractiveEventStream, InteractiveSessionHandle,
    InteractiveStart, InteractiveStatus, RunError, Runner, SessionStatus,
};
pub use sandbox::{DockerEngine, SandboxError};
pub use session::{Reaper, SessionRegistry, SessionState};
pub use types::{
    BatchOutput, ErrorKind, ErrorReport, ExitClassification, ResourceLimits, StopOutcome,
    SubmissionRef,
};
pub use workspace::{Workspace, WorkspaceError};

pub mod app;
pub mod config;
pub mod plan;
pub mod runner;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod types;
pub mod workspace;
