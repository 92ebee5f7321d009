//! Image recipes and build contexts

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::plan::ProgramPlan;
use crate::workspace::WorkspaceFile;

/// File name of the generated Dockerfile inside the build context
pub const DOCKERFILE_NAME: &str = ".cubicle.Dockerfile";

const WORKDIR: &str = "/app";

/// `[registry[:port]/]name[/name...][:tag][@digest]`
static IMAGE_REFERENCE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?:[A-Za-z0-9][A-Za-z0-9.-]*(?::[0-9]+)?/)?",
        r"[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*",
        r"(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*",
        r"(?::[A-Za-z0-9_][A-Za-z0-9_.-]{0,127})?",
        r"(?:@sha256:[a-f0-9]{64})?$",
    ))
    .ok()
});

/// Whether `image` is a plain image reference usable after `FROM`
pub fn is_image_reference(image: &str) -> bool {
    image.len() <= 255
        && IMAGE_REFERENCE
            .as_ref()
            .is_some_and(|re| re.is_match(image))
}

/// Declarative image recipe rendered into a Dockerfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    base_image: String,
    setup: Vec<String>,
    build: Option<String>,
    run: String,
}

impl Recipe {
    pub fn new(base_image: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            base_image: base_image.into(),
            setup: Vec::new(),
            build: None,
            run: run.into(),
        }
    }

    pub fn from_plan(plan: &ProgramPlan) -> Self {
        Self::new(&plan.base_image, &plan.run_command)
            .setup(plan.setup_commands.iter().cloned())
            .build(plan.build_command.clone())
    }

    /// Commands run before the sources are copied in
    pub fn setup(mut self, commands: impl IntoIterator<Item = String>) -> Self {
        self.setup
            .extend(commands.into_iter().filter(|c| !c.trim().is_empty()));
        self
    }

    pub fn build(mut self, command: Option<String>) -> Self {
        self.build = command.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn render(&self) -> String {
        let mut out = format!("FROM {}\nWORKDIR {WORKDIR}\n", self.base_image);
        for command in &self.setup {
            out.push_str(&format!("RUN {}\n", single_line(command)));
        }
        out.push_str(&format!("COPY . {WORKDIR}\n"));
        if let Some(ref build) = self.build {
            out.push_str(&format!("RUN {}\n", single_line(build)));
        }
        let cmd = serde_json::json!(["sh", "-c", single_line(&self.run)]);
        out.push_str(&format!("CMD {cmd}\n"));
        out
    }
}

fn single_line(command: &str) -> String {
    command
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Assemble a tar build context: the rendered Dockerfile plus every file at
/// its laid-out path
///
/// When two files land on the same path the first one in traversal order wins.
/// Files enumerated without content are read from `root`.
pub fn build_context(
    recipe: &Recipe,
    plan: &ProgramPlan,
    root: &Path,
    files: &[WorkspaceFile],
) -> io::Result<Vec<u8>> {
    if !is_image_reference(&recipe.base_image) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid base image {:?}", recipe.base_image),
        ));
    }

    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, DOCKERFILE_NAME, recipe.render().as_bytes())?;

    let mut seen = HashSet::new();
    for file in files {
        let path = plan.layout_path(file);
        if !seen.insert(path.clone()) {
            warn!(file = %file.path, target = %path, "layout collision, file skipped");
            continue;
        }
        if file.is_unloaded() {
            let mut source = std::fs::File::open(root.join(&file.path))?;
            let mut header = tar::Header::new_gnu();
            header.set_size(source.metadata()?.len());
            header.set_mode(0o644);
            header.set_mtime(0);
            builder.append_data(&mut header, &path, &mut source)?;
        } else {
            append(&mut builder, &path, &file.content)?;
        }
    }

    builder.into_inner()
}

fn append(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, path, data)
}
