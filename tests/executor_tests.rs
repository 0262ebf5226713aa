use jobwarden::scheduler::{run_command, JobCommand};
use jobwarden::JobError;

async fn run_shell(line: &str) -> jobwarden::scheduler::CommandOutput {
    run_command(&JobCommand::shell(line), None, &[])
        .await
        .expect("sh should spawn")
}

#[tokio::test]
async fn test_run_simple_command() {
    let output = run_shell("echo hello").await;

    assert_eq!(output.exit_code, 0);
    assert!(output.success());
    assert_eq!(output.stdout, "hello\n");
    assert!(output.stderr.is_empty());
}

#[tokio::test]
async fn test_run_empty_output() {
    let output = run_shell("true").await;

    assert!(output.success());
    assert!(output.stdout.is_empty());
}

#[tokio::test]
async fn test_run_large_output() {
    let output = run_shell("seq 1 1000").await;

    assert!(output.success());
    let lines: Vec<&str> = output.stdout.lines().collect();
    assert_eq!(lines.len(), 1000);
    assert_eq!(lines[0], "1");
    assert_eq!(lines[999], "1000");
}

#[tokio::test]
async fn test_run_command_failure() {
    let output = run_shell("exit 1").await;

    assert_eq!(output.exit_code, 1);
    assert!(!output.success());
}

#[tokio::test]
async fn test_run_command_with_stderr() {
    let output = run_shell("echo 'error message' >&2 && exit 2").await;

    assert_eq!(output.exit_code, 2);
    assert!(output.stdout.is_empty());
    assert_eq!(output.stderr, "error message\n");
}

#[tokio::test]
async fn test_run_invalid_shell_command() {
    let output = run_shell("nonexistent_command_12345").await;

    assert_eq!(output.exit_code, 127);
    assert!(!output.stderr.is_empty());
}

#[tokio::test]
async fn test_run_piped_commands() {
    let output = run_shell("echo 'hello world' | wc -w").await;

    assert!(output.success());
    assert_eq!(output.stdout.trim(), "2");
}

#[tokio::test]
async fn test_run_argv_without_shell_expansion() {
    let command = JobCommand::exec(["echo", "$HOME", "a b"]);
    let output = run_command(&command, None, &[]).await.unwrap();

    assert!(output.success());
    assert_eq!(output.stdout, "$HOME a b\n");
}

#[tokio::test]
async fn test_run_missing_binary_is_spawn_error() {
    let command = JobCommand::exec(["/nonexistent/binary-12345"]);
    let err = run_command(&command, None, &[]).await.unwrap_err();

    assert!(matches!(err, JobError::Spawn(_)));
}

#[tokio::test]
async fn test_run_empty_argv_is_spawn_error() {
    let command = JobCommand::Exec(Vec::new());
    let err = run_command(&command, None, &[]).await.unwrap_err();

    assert!(matches!(err, JobError::Spawn(_)));
}

#[tokio::test]
async fn test_run_in_working_directory_with_env() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "present").unwrap();

    let env = vec![("HOME".to_string(), "/root".to_string())];
    let output = run_command(
        &JobCommand::shell("cat marker.txt; echo \" $HOME\""),
        Some(dir.path()),
        &env,
    )
    .await
    .unwrap();

    assert!(output.success());
    assert_eq!(output.stdout, "present /root\n");
}
