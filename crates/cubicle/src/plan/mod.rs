//! Execution plan resolution
//!
//! Turns an extracted workspace into either a single-program plan (batch and
//! interactive runs) or a multi-component project plan (app previews). Static
//! scanning always provides the answer of last resort; a configured
//! [`Analyzer`] may refine it.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub use crate::plan::analyzer::{
    AnalysisRequest, Analyzer, AnalyzerError, HttpAnalyzer, SourceExcerpt,
};
pub use crate::plan::scan::EntryMatch;
use crate::config::{Config, EntrySubstitution, Language, SourceLayout};
use crate::sandbox::is_image_reference;
use crate::types::{ErrorKind, ResourceLimits};
use crate::workspace::{Workspace, WorkspaceFile};

pub mod analyzer;
pub mod scan;

const PROGRAM_REQUIRED: &[&str] = &["language", "buildCommand", "runCommand", "baseImage"];
const PROJECT_REQUIRED: &[&str] = &["projectType", "hasFrontend", "hasBackend"];

const FRONTEND_DEPENDENCIES: &[&str] = &[
    "react",
    "react-scripts",
    "vue",
    "svelte",
    "@angular/core",
    "vite",
    "next",
    "nuxt",
];
const BACKEND_DEPENDENCIES: &[&str] = &[
    "express",
    "fastify",
    "koa",
    "@nestjs/core",
    "@hapi/hapi",
    "socket.io",
];
const FRONTEND_DIR_NAMES: &[&str] = &["client", "frontend", "web", "ui"];
const BACKEND_DIR_NAMES: &[&str] = &["server", "backend", "api"];
const PYTHON_BACKEND_ENTRIES: &[&str] = &["app.py", "main.py", "server.py"];
const NODE_BACKEND_ENTRIES: &[&str] = &["server.js", "index.js", "app.js"];

/// Errors that occur during plan resolution
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no entry point found in the submission (searched: {searched})")]
    NoEntryPoint { searched: String },

    #[error("project analysis failed after {attempts} attempts: {last}")]
    AnalyzerExhausted { attempts: u32, last: String },

    #[error("project analysis rejected: {0}")]
    AnalyzerRejected(AnalyzerError),

    #[error("inconsistent plan: {0}")]
    Inconsistent(String),
}

impl PlanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlanError::NoEntryPoint { .. } => ErrorKind::NoEntryPointFound,
            PlanError::AnalyzerExhausted { .. }
            | PlanError::AnalyzerRejected(_)
            | PlanError::Inconsistent(_) => ErrorKind::ResolutionError,
        }
    }
}

/// Where a plan's details came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    StaticScan,
    Analyzer,
}

/// A validated execution plan
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionPlan {
    Program(ProgramPlan),
    Project(ProjectPlan),
}

/// The program's entry point
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPoint {
    /// Path in the submission
    pub file: String,
    pub package: Option<String>,
    pub qualified_name: String,
    /// Path relative to the image workdir after layout
    pub source: String,
}

/// Plan for a single program
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramPlan {
    /// Language display name
    pub language: String,
    pub entry_point: EntryPoint,
    pub build_command: Option<String>,
    pub run_command: String,
    pub base_image: String,
    pub setup_commands: Vec<String>,
    pub source_root: String,
    pub layout: SourceLayout,
    /// Extension of files subject to layout
    pub extension: String,
    /// Compiled once per plan; consulted for every laid-out source file
    #[serde(skip)]
    pub package_pattern: Option<Regex>,
    #[serde(skip)]
    pub limits: Option<ResourceLimits>,
    pub source: PlanSource,
}

impl ProgramPlan {
    /// Check the fields every downstream step relies on
    pub fn validate(&self) -> Result<(), PlanError> {
        for (name, value) in [
            ("language", &self.language),
            ("run command", &self.run_command),
            ("base image", &self.base_image),
            ("entry file", &self.entry_point.file),
        ] {
            if value.trim().is_empty() {
                return Err(PlanError::Inconsistent(format!("{name} is empty")));
            }
        }
        if !is_image_reference(&self.base_image) {
            return Err(PlanError::Inconsistent(format!(
                "base image {:?} is not an image reference",
                self.base_image
            )));
        }
        Ok(())
    }

    /// Where `file` is placed relative to the image workdir
    ///
    /// Source files move under the source root, into their package directory
    /// when the layout is package-qualified. Everything else keeps its path.
    pub fn layout_path(&self, file: &WorkspaceFile) -> String {
        let is_source = file
            .path
            .rsplit_once('.')
            .is_some_and(|(_, ext)| ext == self.extension);
        if !is_source {
            return file.path.clone();
        }

        let relative = match self.layout {
            SourceLayout::Flat => file.path.clone(),
            SourceLayout::Package => {
                let package = self
                    .package_pattern
                    .as_ref()
                    .zip(file.text())
                    .and_then(|(re, text)| scan::package_of(text, re));
                match package {
                    Some(pkg) => format!("{}/{}", pkg.replace('.', "/"), file.file_name()),
                    None => file.file_name().to_owned(),
                }
            }
        };
        join_root(&self.source_root, &relative)
    }
}

/// Plan for one component of a multi-component app
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentPlan {
    /// Directory relative to the workspace root
    pub dir: String,
    pub install_command: Option<String>,
    pub start_command: String,
    pub preferred_port: Option<u16>,
}

/// Plan for a multi-component app
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPlan {
    pub project_type: String,
    pub frontend: Option<ComponentPlan>,
    pub backend: Option<ComponentPlan>,
    pub source: PlanSource,
}

impl ProjectPlan {
    pub fn has_frontend(&self) -> bool {
        self.frontend.is_some()
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }
}

/// Resolves workspaces into execution plans
#[derive(Clone)]
pub struct PlanResolver {
    config: Arc<Config>,
    analyzer: Option<Arc<dyn Analyzer>>,
}

impl std::fmt::Debug for PlanResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanResolver")
            .field("analyzer", &self.analyzer.is_some())
            .finish()
    }
}

impl PlanResolver {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            analyzer: None,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Resolve a single-program plan
    ///
    /// The entry point always comes from static scanning, so a submission
    /// without one fails before any analyzer call or environment start.
    #[instrument(skip(self, files), fields(files = files.len()))]
    pub async fn resolve_program(
        &self,
        files: &[WorkspaceFile],
        hint: Option<&str>,
    ) -> Result<ProgramPlan, PlanError> {
        let candidates = match hint.and_then(|h| self.config.find_language(h)) {
            Some(found) => vec![found],
            None => {
                if let Some(hint) = hint {
                    debug!(hint, "hint matches no configured language, scanning all");
                }
                self.config.sorted_languages()
            }
        };

        let entry = scan::find_entry_point(files, &candidates).ok_or_else(|| {
            PlanError::NoEntryPoint {
                searched: candidates
                    .iter()
                    .map(|(id, _)| *id)
                    .collect::<Vec<_>>()
                    .join(", "),
            }
        })?;
        let language = self
            .config
            .languages
            .get(&entry.language)
            .ok_or_else(|| PlanError::Inconsistent(format!("unknown language {}", entry.language)))?;

        let plan = static_program_plan(&entry, language, files);
        plan.validate()?;
        debug!(entry = %entry.qualified_name, file = %entry.file, "entry point located");

        let Some(ref analyzer) = self.analyzer else {
            return Ok(plan);
        };

        let request = AnalysisRequest::Program {
            tree: scan::render_tree(files),
            sources: excerpts(
                files.iter().filter(|f| language.extension.matches(&f.path)),
                self.config.analyzer.max_file_bytes,
            ),
            hint: hint.map(str::to_owned),
        };
        match analyzer.analyze(&request).await {
            Ok(value) => match refine_program(&plan, &value) {
                Ok(refined) => Ok(refined),
                Err(e) => {
                    warn!(error = %e, "analyzer answer rejected, using static plan");
                    Ok(plan)
                }
            },
            Err(e) => {
                warn!(error = %e, "analyzer unavailable, using static plan");
                Ok(plan)
            }
        }
    }

    /// Resolve a multi-component project plan
    ///
    /// With an analyzer configured its answer is required: transient failures
    /// (including answers that break the response contract) are retried with
    /// linear backoff, and exhausting the attempts is fatal. A rejected request
    /// fails at once. Without an analyzer, the static heuristics decide.
    #[instrument(skip(self, workspace))]
    pub async fn resolve_project(&self, workspace: &Workspace) -> Result<ProjectPlan, PlanError> {
        let files = workspace.files();
        let fallback = static_project_plan(files);

        let Some(ref analyzer) = self.analyzer else {
            let plan = fallback.ok_or_else(|| {
                PlanError::Inconsistent("no runnable frontend or backend found".to_owned())
            })?;
            return repair_project(plan, workspace, None);
        };

        let request = AnalysisRequest::Project {
            tree: scan::render_tree(files),
            manifests: excerpts(
                scan::manifests(files).into_iter(),
                self.config.analyzer.max_file_bytes,
            ),
        };

        let attempts = self.config.analyzer.max_attempts.max(1);
        let backoff = Duration::from_millis(self.config.analyzer.backoff_ms);
        let mut last = String::new();

        for attempt in 1..=attempts {
            let outcome = match analyzer.analyze(&request).await {
                Ok(value) => parse_project(&value)
                    .and_then(|plan| {
                        repair_project(plan, workspace, fallback.as_ref())
                            .map_err(|e| AnalyzerError::InvalidField {
                                field: "plan",
                                message: e.to_string(),
                            })
                    }),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(plan) => {
                    info!(attempt, project_type = %plan.project_type, "project analyzed");
                    return Ok(plan);
                }
                Err(e) if !e.is_transient() => {
                    warn!(attempt, error = %e, "project analysis rejected, not retrying");
                    return Err(PlanError::AnalyzerRejected(e));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "project analysis attempt failed");
                    last = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(backoff * attempt).await;
                    }
                }
            }
        }

        Err(PlanError::AnalyzerExhausted { attempts, last })
    }
}

fn join_root(root: &str, relative: &str) -> String {
    let root = root.trim().trim_matches('/');
    if root.is_empty() || root == "." {
        relative.to_owned()
    } else {
        format!("{root}/{relative}")
    }
}

fn excerpts<'a>(
    files: impl Iterator<Item = &'a WorkspaceFile>,
    max_bytes: usize,
) -> Vec<SourceExcerpt> {
    files
        .filter_map(|f| {
            let text = f.text()?;
            let mut end = text.len().min(max_bytes);
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            Some(SourceExcerpt {
                path: f.path.clone(),
                content: text[..end].to_owned(),
            })
        })
        .collect()
}

fn static_program_plan(entry: &EntryMatch, language: &Language, files: &[WorkspaceFile]) -> ProgramPlan {
    let mut plan = ProgramPlan {
        language: language.name.clone(),
        entry_point: EntryPoint {
            file: entry.file.clone(),
            package: entry.package.clone(),
            qualified_name: entry.qualified_name.clone(),
            source: String::new(),
        },
        build_command: None,
        run_command: String::new(),
        base_image: language.base_image.clone(),
        setup_commands: language.setup.clone(),
        source_root: language.source_root.clone(),
        layout: language.layout,
        extension: language.extension.to_string(),
        package_pattern: language
            .package_pattern
            .as_deref()
            .and_then(|p| Regex::new(p).ok()),
        limits: language.limits.clone(),
        source: PlanSource::StaticScan,
    };

    if let Some(file) = files.iter().find(|f| f.path == entry.file) {
        plan.entry_point.source = plan.layout_path(file);
    }
    plan.build_command = language
        .build
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .map(|b| expand(&plan, b));
    plan.run_command = expand(&plan, &language.run);
    plan
}

fn expand(plan: &ProgramPlan, command: &str) -> String {
    let stem = plan
        .entry_point
        .file
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.').map(|(s, _)| s))
        .unwrap_or(&plan.entry_point.qualified_name);
    Language::expand_command(
        command,
        &EntrySubstitution {
            qualified_name: &plan.entry_point.qualified_name,
            source: &plan.entry_point.source,
            stem,
            source_root: &plan.source_root,
        },
    )
}

/// Overlay a validated analyzer answer on the static plan
fn refine_program(base: &ProgramPlan, value: &Value) -> Result<ProgramPlan, AnalyzerError> {
    analyzer::require_fields(value, PROGRAM_REQUIRED)?;

    let language = non_empty_str(value, "language")?;
    let run_command = non_empty_str(value, "runCommand")?;
    let base_image = non_empty_str(value, "baseImage")?;
    let build_command = match value.get("buildCommand") {
        Some(Value::String(s)) => Some(s.trim().to_owned()).filter(|s| !s.is_empty()),
        _ => {
            return Err(AnalyzerError::InvalidField {
                field: "buildCommand",
                message: "expected a string".to_owned(),
            });
        }
    };
    let setup_commands = match value.get("setupCommands") {
        None | Some(Value::Null) => base.setup_commands.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        Some(_) => {
            return Err(AnalyzerError::InvalidField {
                field: "setupCommands",
                message: "expected an array of strings".to_owned(),
            });
        }
    };

    let mut plan = base.clone();
    plan.language = language;
    plan.base_image = base_image;
    plan.setup_commands = setup_commands;
    plan.build_command = build_command.map(|b| expand(&plan, &b));
    plan.run_command = expand(&plan, &run_command);
    plan.source = PlanSource::Analyzer;
    plan.validate().map_err(|e| AnalyzerError::InvalidField {
        field: "plan",
        message: e.to_string(),
    })?;
    Ok(plan)
}

fn non_empty_str(value: &Value, field: &'static str) -> Result<String, AnalyzerError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or(AnalyzerError::InvalidField {
            field,
            message: "expected a non-empty string".to_owned(),
        })
}

fn optional_str(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn optional_port(value: &Value, field: &str) -> Option<u16> {
    match value.get(field)? {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|p| *p > 0)
}

/// Check the project response contract and build an unrepaired plan
fn parse_project(value: &Value) -> Result<ProjectPlan, AnalyzerError> {
    analyzer::require_fields(value, PROJECT_REQUIRED)?;

    let project_type = non_empty_str(value, "projectType")?;
    let flag = |field: &'static str| {
        value
            .get(field)
            .and_then(Value::as_bool)
            .ok_or(AnalyzerError::InvalidField {
                field,
                message: "expected a boolean".to_owned(),
            })
    };
    let has_frontend = flag("hasFrontend")?;
    let has_backend = flag("hasBackend")?;

    let component = |prefix: &str| ComponentPlan {
        dir: optional_str(value, &format!("{prefix}Dir")).unwrap_or_default(),
        install_command: optional_str(value, &format!("{prefix}InstallCommand")),
        start_command: optional_str(value, &format!("{prefix}StartCommand")).unwrap_or_default(),
        preferred_port: optional_port(value, &format!("{prefix}Port")),
    };

    Ok(ProjectPlan {
        project_type,
        frontend: has_frontend.then(|| component("frontend")),
        backend: has_backend.then(|| component("backend")),
        source: PlanSource::Analyzer,
    })
}

/// Make every present component point at a real directory with a start command
///
/// Missing directories and start commands are filled from the static
/// heuristics; whatever cannot be repaired is rejected.
fn repair_project(
    mut plan: ProjectPlan,
    workspace: &Workspace,
    fallback: Option<&ProjectPlan>,
) -> Result<ProjectPlan, PlanError> {
    let files = workspace.files();
    plan.frontend = plan
        .frontend
        .take()
        .map(|c| {
            repair_component(c, "frontend", workspace, files, fallback.and_then(|f| f.frontend.as_ref()))
        })
        .transpose()?;
    plan.backend = plan
        .backend
        .take()
        .map(|c| {
            repair_component(c, "backend", workspace, files, fallback.and_then(|f| f.backend.as_ref()))
        })
        .transpose()?;

    if plan.frontend.is_none() && plan.backend.is_none() {
        return Err(PlanError::Inconsistent(
            "plan declares neither a frontend nor a backend".to_owned(),
        ));
    }
    Ok(plan)
}

fn repair_component(
    mut component: ComponentPlan,
    role: &str,
    workspace: &Workspace,
    files: &[WorkspaceFile],
    fallback: Option<&ComponentPlan>,
) -> Result<ComponentPlan, PlanError> {
    let mut dir = normalize_dir(&component.dir);
    if dir.is_empty() {
        dir = fallback
            .map(|f| f.dir.clone())
            .unwrap_or_else(|| ".".to_owned());
    }
    workspace
        .resolve_dir(&dir)
        .map_err(|e| PlanError::Inconsistent(format!("{role} directory: {e}")))?;
    component.dir = dir;

    if component.start_command.trim().is_empty() {
        component.start_command = fallback
            .filter(|f| f.dir == component.dir)
            .map(|f| f.start_command.clone())
            .or_else(|| derive_start_command(files, &component.dir))
            .ok_or_else(|| {
                PlanError::Inconsistent(format!(
                    "{role} in '{}' has no start command",
                    component.dir
                ))
            })?;
    }
    if component.install_command.is_none() {
        component.install_command = derive_install_command(files, &component.dir);
    }

    Ok(component)
}

fn normalize_dir(dir: &str) -> String {
    let dir = dir.trim().trim_start_matches("./").trim_end_matches('/');
    if dir.is_empty() { String::new() } else { dir.to_owned() }
}

fn file_in<'a>(files: &'a [WorkspaceFile], dir: &str, name: &str) -> Option<&'a WorkspaceFile> {
    let path = if dir == "." || dir.is_empty() {
        name.to_owned()
    } else {
        format!("{dir}/{name}")
    };
    files.iter().find(|f| f.path == path)
}

fn package_json(files: &[WorkspaceFile], dir: &str) -> Option<Value> {
    file_in(files, dir, "package.json")
        .and_then(WorkspaceFile::text)
        .and_then(|text| serde_json::from_str(text).ok())
}

fn derive_install_command(files: &[WorkspaceFile], dir: &str) -> Option<String> {
    if file_in(files, dir, "package.json").is_some() {
        Some("npm install".to_owned())
    } else if file_in(files, dir, "requirements.txt").is_some() {
        Some("pip install -r requirements.txt".to_owned())
    } else {
        None
    }
}

fn derive_start_command(files: &[WorkspaceFile], dir: &str) -> Option<String> {
    if let Some(manifest) = package_json(files, dir) {
        let scripts = manifest.get("scripts");
        let has_script = |name: &str| scripts.and_then(|s| s.get(name)).is_some();
        if has_script("start") {
            return Some("npm start".to_owned());
        }
        if has_script("dev") {
            return Some("npm run dev".to_owned());
        }
        if let Some(main) = manifest.get("main").and_then(Value::as_str) {
            return Some(format!("node {main}"));
        }
    }
    NODE_BACKEND_ENTRIES
        .iter()
        .find(|name| file_in(files, dir, name).is_some())
        .map(|name| format!("node {name}"))
        .or_else(|| {
            PYTHON_BACKEND_ENTRIES
                .iter()
                .find(|name| file_in(files, dir, name).is_some())
                .map(|name| format!("python3 {name}"))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Frontend,
    Backend,
}

fn classify_dir(files: &[WorkspaceFile], dir: &str) -> Option<Role> {
    let dir_name = dir.rsplit('/').next().unwrap_or(dir).to_ascii_lowercase();

    if let Some(manifest) = package_json(files, dir) {
        let depends_on = |names: &[&str]| {
            ["dependencies", "devDependencies"].iter().any(|section| {
                manifest
                    .get(*section)
                    .and_then(Value::as_object)
                    .is_some_and(|deps| names.iter().any(|n| deps.contains_key(*n)))
            })
        };
        if depends_on(FRONTEND_DEPENDENCIES) || FRONTEND_DIR_NAMES.contains(&dir_name.as_str()) {
            return Some(Role::Frontend);
        }
        if depends_on(BACKEND_DEPENDENCIES) || BACKEND_DIR_NAMES.contains(&dir_name.as_str()) {
            return Some(Role::Backend);
        }
        return derive_start_command(files, dir).map(|_| Role::Backend);
    }

    let requirements = file_in(files, dir, "requirements.txt")?;
    let text = requirements.text()?.to_ascii_lowercase();
    ["flask", "fastapi", "django", "uvicorn"]
        .iter()
        .any(|f| text.contains(f))
        .then_some(Role::Backend)
}

/// Deterministic project plan from manifests and directory names
fn static_project_plan(files: &[WorkspaceFile]) -> Option<ProjectPlan> {
    let mut frontend = None;
    let mut backend = None;

    for manifest in scan::manifests(files) {
        let name = manifest.file_name();
        if name != "package.json" && name != "requirements.txt" {
            continue;
        }
        let dir = match manifest.dir() {
            "" => ".",
            d => d,
        };
        if dir.split('/').count() > 2 {
            continue;
        }

        let Some(role) = classify_dir(files, dir) else {
            continue;
        };
        let slot = match role {
            Role::Frontend => &mut frontend,
            Role::Backend => &mut backend,
        };
        if slot.is_some() {
            continue;
        }
        let Some(start_command) = derive_start_command(files, dir) else {
            continue;
        };
        let preferred_port = match role {
            Role::Backend => scan::backend_port(files, dir),
            Role::Frontend => None,
        };
        *slot = Some(ComponentPlan {
            dir: dir.to_owned(),
            install_command: derive_install_command(files, dir),
            start_command,
            preferred_port,
        });
    }

    let project_type = match (&frontend, &backend) {
        (Some(_), Some(_)) => "fullstack",
        (Some(_), None) => "frontend",
        (None, Some(_)) => "backend",
        (None, None) => return None,
    };

    Some(ProjectPlan {
        project_type: project_type.to_owned(),
        frontend,
        backend,
        source: PlanSource::StaticScan,
    })
}
