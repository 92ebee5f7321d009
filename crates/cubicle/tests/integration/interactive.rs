use std::time::Duration;

use cubicle::workspace::Workspace;
use cubicle::{Config, InteractiveEvent, InteractiveEventStream, Runner, SessionStatus};

use super::{docker_runner, offline_runner, zip_archive};

const GREETER_PY: &str = r#"
def main():
    name = input("name? ")
    print(f"hello {name}")

if __name__ == "__main__":
    main()
"#;

async fn start(runner: &Runner, entries: &[(&str, &str)]) -> String {
    let ws = Workspace::from_archive_bytes(zip_archive(entries), &runner.config().workspace)
        .await
        .expect("Failed to extract archive");
    let started = runner
        .start_interactive_workspace(ws, Some("python"))
        .await
        .expect("Failed to start session");
    assert_eq!(
        started.websocket_path,
        format!("{}/{}", runner.config().server.ws_prefix, started.session_id)
    );
    started.session_id
}

/// Read events until stdout contains `needle` or the program exits
async fn read_until(events: &mut InteractiveEventStream, needle: &str) -> (String, bool) {
    let mut stdout = String::new();
    let collect = async {
        while let Some(event) = events.recv().await {
            match event {
                InteractiveEvent::Stdout(data) => {
                    stdout.push_str(&String::from_utf8_lossy(&data));
                    if stdout.contains(needle) {
                        return false;
                    }
                }
                InteractiveEvent::Stderr(_) => {}
                InteractiveEvent::Exited(_) => return true,
            }
        }
        true
    };
    let exited = tokio::time::timeout(Duration::from_secs(120), collect)
        .await
        .expect("Timed out waiting for output");
    (stdout, exited)
}

async fn wait_exit(events: &mut InteractiveEventStream) {
    let exit = async {
        while let Some(event) = events.recv().await {
            if matches!(event, InteractiveEvent::Exited(_)) {
                return;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), exit)
        .await
        .expect("Timed out waiting for exit");
}

#[tokio::test]
async fn test_connect_unknown_session_fails() {
    let runner = offline_runner(Config::default());
    assert!(runner.connect("nope").await.is_err());
    assert_eq!(
        runner.interactive_status("nope").status,
        SessionStatus::NotFound
    );
    assert!(!runner.stop_interactive("nope").await.success);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_prompt_and_reply() {
    let runner = docker_runner(Config::default());
    let id = start(&runner, &[("main.py", GREETER_PY)]).await;
    assert_eq!(runner.interactive_status(&id).status, SessionStatus::Running);

    let (mut events, handle) = runner.connect(&id).await.expect("Failed to attach");
    let (prompt, exited) = read_until(&mut events, "name? ").await;
    assert!(!exited, "program exited before prompting: {prompt}");

    handle.write_line("Ada").await.expect("Failed to write stdin");
    let (reply, _) = read_until(&mut events, "hello Ada").await;
    assert!(reply.contains("hello Ada"));

    wait_exit(&mut events).await;

    let mut stopped = false;
    for _ in 0..50 {
        if runner.interactive_status(&id).status == SessionStatus::Stopped {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(stopped, "session should be marked stopped after exit");

    assert!(runner.stop_interactive(&id).await.success);
    assert_eq!(runner.interactive_status(&id).status, SessionStatus::NotFound);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_stop_running_session() {
    let runner = docker_runner(Config::default());
    let id = start(
        &runner,
        &[(
            "main.py",
            "import time\n\nif __name__ == \"__main__\":\n    time.sleep(600)\n",
        )],
    )
    .await;

    let before = runner
        .engine()
        .list_managed(Some(&id))
        .await
        .expect("Failed to list containers");
    assert_eq!(before.len(), 1);

    let outcome = runner.stop_interactive(&id).await;
    assert!(outcome.success, "{}", outcome.message);
    let after = runner
        .engine()
        .list_managed(Some(&id))
        .await
        .expect("Failed to list containers");
    assert!(after.is_empty(), "containers left behind: {after:?}");
    assert_eq!(runner.interactive_status(&id).status, SessionStatus::NotFound);
    assert!(runner.connect(&id).await.is_err());
    assert!(runner.registry().is_empty());
}
