//! Batch execution: build, run to completion, tear down

use std::time::Instant;

use futures_util::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::plan::ProgramPlan;
use crate::runner::{RunError, discard_workspace};
use crate::sandbox::{
    ContainerSpec, DOCKERFILE_NAME, DockerEngine, OutputCollector, Recipe, SandboxError,
    build_context,
};
use crate::types::{BatchOutput, ExitClassification, ResourceLimits, render_stream};
use crate::workspace::Workspace;

/// Exit codes above this are reported by the shell for signal deaths
const SIGNAL_EXIT_BASE: i64 = 128;

/// Run `plan` against `workspace` in a fresh container
///
/// The container, the image and the workspace are all released before this
/// returns, whatever the outcome; release failures are only logged.
#[instrument(skip_all, fields(language = %plan.language, entry = %plan.entry_point.qualified_name))]
pub(crate) async fn execute(
    engine: &DockerEngine,
    config: &Config,
    mut workspace: Workspace,
    plan: &ProgramPlan,
) -> Result<BatchOutput, RunError> {
    let tag = format!("cubicle-batch-{}", uuid::Uuid::new_v4().simple());
    let limits = config.effective_limits(plan.limits.as_ref());
    let mut container = None;

    let outcome = build_and_run(engine, &workspace, plan, &limits, &tag, &mut container).await;

    if let Some(ref id) = container {
        engine.discard_container(id, 0).await;
    }
    engine.discard_image(&tag).await;
    discard_workspace(&mut workspace);

    match outcome {
        Ok(ref output) => info!(
            elapsed_ms = output.execution_time,
            exit = ?output.exit_classification,
            "batch run finished"
        ),
        Err(ref e) => info!(kind = ?e.kind(), error = %e, "batch run failed"),
    }
    outcome
}

async fn build_and_run(
    engine: &DockerEngine,
    workspace: &Workspace,
    plan: &ProgramPlan,
    limits: &ResourceLimits,
    tag: &str,
    container: &mut Option<String>,
) -> Result<BatchOutput, RunError> {
    let recipe = Recipe::from_plan(plan);
    let context = build_context(&recipe, plan, workspace.path(), workspace.files())
        .map_err(SandboxError::Context)?;
    engine
        .build_image(tag, DOCKERFILE_NAME, context, limits.build_timeout())
        .await?;

    let spec = ContainerSpec::new(tag, tag).limits(limits.clone());
    let id = engine.create(&spec).await?;
    *container = Some(id.clone());

    let attached = engine.attach(&id, false).await?;
    engine.start(&id).await?;
    let started = Instant::now();
    debug!(container = %id, "container started");

    let mut collector = OutputCollector::new(limits.max_output_bytes());
    let mut output = attached.output;
    let run = async {
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(chunk) => collector.push(chunk),
                Err(e) => {
                    warn!(error = %e, "output stream interrupted");
                    break;
                }
            }
        }
        engine.wait(&id).await
    };

    let timeout = limits.timeout();
    let code = match tokio::time::timeout(timeout, run).await {
        Ok(code) => code?,
        Err(_) => {
            if let Err(e) = engine.kill(&id).await {
                warn!(container = %id, error = %e, "failed to kill timed out container");
            }
            return Err(RunError::Timeout(timeout));
        }
    };
    let elapsed = started.elapsed();
    let captured = collector.finish();

    let oom_killed = match engine.status(&id).await {
        Ok(status) => status.is_some_and(|s| s.oom_killed),
        Err(e) => {
            warn!(container = %id, error = %e, "failed to inspect finished container");
            false
        }
    };

    classify(code, oom_killed, limits, &captured.stderr)?;

    Ok(BatchOutput {
        stdout: render_stream(&captured.stdout),
        stderr: render_stream(&captured.stderr),
        language: plan.language.clone(),
        execution_time: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        exit_classification: ExitClassification::from_exit_code(code),
    })
}

/// Separate abnormal terminations from ordinary exits
fn classify(
    code: i64,
    oom_killed: bool,
    limits: &ResourceLimits,
    stderr: &[u8],
) -> Result<(), RunError> {
    let stderr = String::from_utf8_lossy(stderr).into_owned();
    if oom_killed {
        let message = match limits.memory_mb {
            Some(mb) => format!("program exceeded the {mb} MB memory limit"),
            None => "program ran out of memory".to_owned(),
        };
        return Err(RunError::Runtime { message, stderr });
    }
    if code > SIGNAL_EXIT_BASE {
        let signal = code - SIGNAL_EXIT_BASE;
        return Err(RunError::Runtime {
            message: format!("program was terminated by signal {signal}"),
            stderr,
        });
    }
    if code < 0 {
        return Err(RunError::Runtime {
            message: format!("container exited abnormally ({code})"),
            stderr,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    #[test]
    fn ordinary_exits_are_outputs() {
        let limits = ResourceLimits::default();
        assert!(classify(0, false, &limits, b"").is_ok());
        assert!(classify(1, false, &limits, b"boom").is_ok());
        assert!(classify(128, false, &limits, b"").is_ok());
    }

    #[test]
    fn oom_is_runtime_error() {
        let limits = ResourceLimits::new().with_memory_mb(64);
        let err = classify(137, true, &limits, b"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeError);
        assert!(err.to_string().contains("64 MB"));
    }

    #[test]
    fn signal_death_is_runtime_error() {
        let err = classify(139, false, &ResourceLimits::default(), b"segfault").unwrap_err();
        match err {
            RunError::Runtime { message, stderr } => {
                assert!(message.contains("signal 11"));
                assert_eq!(stderr, "segfault");
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
    }
}
