//! Docker engine client

use std::collections::HashMap;
use std::time::Duration;

use bollard::Docker;
use bollard::container::AttachContainerResults;
use bollard::errors::Error as DockerError;
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, BuildImageOptionsBuilder, CreateContainerOptionsBuilder,
    InspectContainerOptions, KillContainerOptionsBuilder, ListContainersOptionsBuilder,
    RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder, WaitContainerOptions,
};
use futures_util::StreamExt;
use tracing::{debug, instrument, warn};

use crate::sandbox::{ContainerSpec, SandboxError};

/// Label carried by every container and image this service creates
pub const MANAGED_LABEL: &str = "cubicle.managed";
/// Label binding a container to an interactive session
pub const SESSION_LABEL: &str = "cubicle.session";

/// Observed container state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    pub oom_killed: bool,
    pub exit_code: Option<i64>,
}

/// Handle to the local Docker engine
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket)
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check that the engine answers
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Build `tag` from a tar context; the build log is returned on success and
    /// carried in [`SandboxError::BuildFailed`] otherwise
    ///
    /// A build still streaming after `timeout` is abandoned: the connection is
    /// dropped, which cancels it on the daemon, and whatever was tagged is removed.
    #[instrument(skip(self, context), fields(context_bytes = context.len()))]
    pub async fn build_image(
        &self,
        tag: &str,
        dockerfile: &str,
        context: Vec<u8>,
        timeout: Duration,
    ) -> Result<String, SandboxError> {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL, "true");
        let options = BuildImageOptionsBuilder::new()
            .dockerfile(dockerfile)
            .t(tag)
            .rm(true)
            .forcerm(true)
            .labels(&labels)
            .build();

        let mut stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(context.into())));
        let build = async move {
            let mut log = String::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(info) => {
                        if let Some(line) = info.stream {
                            log.push_str(&line);
                        }
                        if let Some(error) = info.error {
                            log.push_str(&error);
                            return Err(SandboxError::BuildFailed { output: log });
                        }
                    }
                    Err(DockerError::DockerStreamError { error }) => {
                        log.push_str(&error);
                        return Err(SandboxError::BuildFailed { output: log });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(log)
        };

        match tokio::time::timeout(timeout, build).await {
            Ok(log) => {
                let log = log?;
                debug!(tag, "image built");
                Ok(log)
            }
            Err(_) => {
                warn!(tag, timeout_secs = timeout.as_secs_f64(), "image build timed out");
                self.discard_image(tag).await;
                Err(SandboxError::BuildTimeout(timeout))
            }
        }
    }

    /// Create a container; returns its id
    pub async fn create(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let options = CreateContainerOptionsBuilder::new().name(spec.name()).build();
        let response = self
            .docker
            .create_container(Some(options), spec.build())
            .await?;
        for warning in response.warnings {
            warn!(container = spec.name(), %warning, "engine warning");
        }
        Ok(response.id)
    }

    /// Attach to the container's streams; call before [`Self::start`] so no
    /// output is missed
    pub async fn attach(&self, id: &str, stdin: bool) -> Result<AttachContainerResults, SandboxError> {
        let options = AttachContainerOptionsBuilder::new()
            .stdin(stdin)
            .stdout(true)
            .stderr(true)
            .stream(true)
            .logs(true)
            .build();
        Ok(self.docker.attach_container(id, Some(options)).await?)
    }

    pub async fn start(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    /// Wait for the container to exit; returns its exit code
    pub async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        let mut stream = self.docker.wait_container(id, None::<WaitContainerOptions>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) if is_not_found(&e) => Err(SandboxError::NotFound(id.to_owned())),
            Some(Err(e)) => Err(e.into()),
            None => Err(SandboxError::NotFound(id.to_owned())),
        }
    }

    /// Inspect a container; `None` once it no longer exists
    pub async fn status(&self, id: &str) -> Result<Option<ContainerStatus>, SandboxError> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => {
                let state = response.state.unwrap_or_default();
                Ok(Some(ContainerStatus {
                    running: state.running.unwrap_or(false),
                    oom_killed: state.oom_killed.unwrap_or(false),
                    exit_code: state.exit_code,
                }))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        let options = KillContainerOptionsBuilder::new().signal("SIGKILL").build();
        match self.docker.kill_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop with a grace period in seconds; missing or stopped containers are fine
    pub async fn stop(&self, id: &str, grace_secs: i32) -> Result<(), SandboxError> {
        let options = StopContainerOptionsBuilder::new().t(grace_secs).build();
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Force-remove a container and its anonymous volumes
    pub async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_image(&self, tag: &str) -> Result<(), SandboxError> {
        let options = RemoveImageOptionsBuilder::new().force(true).build();
        match self.docker.remove_image(tag, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop and remove a container, logging rather than failing
    pub async fn discard_container(&self, id: &str, grace_secs: i32) {
        if let Err(e) = self.stop(id, grace_secs).await {
            warn!(container = id, error = %e, "failed to stop container");
        }
        if let Err(e) = self.remove_container(id).await {
            warn!(container = id, error = %e, "failed to remove container");
        }
    }

    /// Remove an image, logging rather than failing
    pub async fn discard_image(&self, tag: &str) {
        if let Err(e) = self.remove_image(tag).await {
            warn!(image = tag, error = %e, "failed to remove image");
        }
    }

    /// Ids of managed containers, optionally limited to one session
    pub async fn list_managed(&self, session: Option<&str>) -> Result<Vec<String>, SandboxError> {
        let mut label_filters = vec![format!("{MANAGED_LABEL}=true")];
        if let Some(session) = session {
            label_filters.push(format!("{SESSION_LABEL}={session}"));
        }
        let mut filters = HashMap::new();
        filters.insert("label", label_filters);
        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

fn is_not_found(error: &DockerError) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Not found, already stopped, or removal already in progress
fn is_gone(error: &DockerError) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError {
            status_code: 304 | 404 | 409,
            ..
        }
    )
}
