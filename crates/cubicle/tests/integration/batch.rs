use cubicle::workspace::Workspace;
use cubicle::{Config, ErrorKind, ExitClassification, SubmissionRef};

use super::{docker_runner, offline_runner, serve_archive, zip_archive};

const HELLO_PY: &str = r#"
def main():
    print("Hello, World!")

if __name__ == "__main__":
    main()
"#;

async fn workspace(config: &Config, entries: &[(&str, &str)]) -> Workspace {
    Workspace::from_archive_bytes(zip_archive(entries), &config.workspace)
        .await
        .expect("Failed to extract archive")
}

#[tokio::test]
async fn test_missing_archive_url_is_input_error() {
    let runner = offline_runner(Config::default());
    let err = runner
        .execute(&SubmissionRef::new("   "))
        .await
        .expect_err("blank url must be rejected");
    assert_eq!(err.kind(), ErrorKind::InputError);
}

#[tokio::test]
async fn test_unreachable_archive_is_download_failure() {
    let runner = offline_runner(Config::default());
    let url = serve_archive(zip_archive(&[("main.py", HELLO_PY)])).await;
    let missing = url.replace("bundle.zip", "missing.zip");

    let err = runner
        .execute(&SubmissionRef::new(missing))
        .await
        .expect_err("missing archive must fail");
    assert_eq!(err.kind(), ErrorKind::DownloadFailed);
}

#[tokio::test]
async fn test_no_entry_point_fails_before_engine() {
    let config = Config::default();
    let runner = offline_runner(config.clone());
    let ws = workspace(&config, &[("util.py", "def helper():\n    return 1\n")]).await;

    let err = runner
        .execute_workspace(ws, Some("python"))
        .await
        .expect_err("no entry point must fail");
    assert_eq!(err.kind(), ErrorKind::NoEntryPointFound);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_run_hello_world_python() {
    let runner = docker_runner(Config::default());
    let url = serve_archive(zip_archive(&[("app/main.py", HELLO_PY)])).await;

    let output = runner
        .execute(&SubmissionRef::new(url).with_hint("python"))
        .await
        .expect("Execution failed");

    assert_eq!(output.stdout, "Hello, World!");
    assert_eq!(output.stderr, cubicle::types::NO_OUTPUT);
    assert_eq!(output.exit_classification, ExitClassification::Success);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_run_java_package_layout() {
    let config = Config::default();
    let runner = docker_runner(config.clone());
    let ws = workspace(
        &config,
        &[
            (
                "Main.java",
                "package com.example;\n\npublic class Main {\n    public static void main(String[] args) {\n        System.out.println(Greeter.greet(\"Java\"));\n    }\n}\n",
            ),
            (
                "Greeter.java",
                "package com.example;\n\nclass Greeter {\n    static String greet(String who) { return \"Hello, \" + who; }\n}\n",
            ),
        ],
    )
    .await;

    let output = runner
        .execute_workspace(ws, Some("java"))
        .await
        .expect("Execution failed");
    assert_eq!(output.stdout, "Hello, Java");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_run_nonzero_exit() {
    let config = Config::default();
    let runner = docker_runner(config.clone());
    let ws = workspace(
        &config,
        &[(
            "main.py",
            "import sys\n\nif __name__ == \"__main__\":\n    print(\"bad input\", file=sys.stderr)\n    sys.exit(3)\n",
        )],
    )
    .await;

    let output = runner
        .execute_workspace(ws, Some("python"))
        .await
        .expect("Execution call failed");
    assert_eq!(output.stderr, "bad input");
    assert_eq!(
        output.exit_classification,
        ExitClassification::NonZeroExit { code: 3 }
    );
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_build_error_reports_compiler_output() {
    let config = Config::default();
    let runner = docker_runner(config.clone());
    let ws = workspace(
        &config,
        &[(
            "Main.java",
            "public class Main {\n    public static void main(String[] args) {\n        System.out.println(\"missing semicolon\")\n    }\n}\n",
        )],
    )
    .await;

    let err = runner
        .execute_workspace(ws, Some("java"))
        .await
        .expect_err("build must fail");
    assert_eq!(err.kind(), ErrorKind::BuildError);
    let report = err.report();
    assert!(report.raw_output.is_some_and(|raw| raw.contains("';' expected")));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_run_timeout() {
    let mut config = Config::default();
    config.default_limits.timeout_secs = Some(2.0);
    let runner = docker_runner(config.clone());
    let ws = workspace(
        &config,
        &[(
            "main.py",
            "if __name__ == \"__main__\":\n    while True:\n        pass\n",
        )],
    )
    .await;

    let err = runner
        .execute_workspace(ws, Some("python"))
        .await
        .expect_err("infinite loop must time out");
    assert_eq!(err.kind(), ErrorKind::RuntimeTimeout);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_build_timeout() {
    let mut config = Config::default();
    config.default_limits.build_timeout_secs = Some(3.0);
    if let Some(python) = config.languages.get_mut("python") {
        python.build = Some("sleep 60".to_owned());
    }
    let runner = docker_runner(config.clone());
    let ws = workspace(&config, &[("main.py", HELLO_PY)]).await;

    let started = std::time::Instant::now();
    let err = runner
        .execute_workspace(ws, Some("python"))
        .await
        .expect_err("hanging build must time out");
    assert_eq!(err.kind(), ErrorKind::RuntimeTimeout);
    assert!(err.to_string().starts_with("build exceeded"));
    assert!(started.elapsed() < std::time::Duration::from_secs(30));
}
