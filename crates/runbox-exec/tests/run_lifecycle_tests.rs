//! Lifecycle tests for the execution controller, using the direct-process
//! backend with `sh` so no container runtime is required.

use std::sync::Arc;
use std::time::{Duration, Instant};

use runbox_exec::{run, Backend, ProcessBackend, RunEvent, RunHandle, RunSpec, WorkspaceStore};
use runbox_proto::{EXIT_STOPPED, EXIT_TIMEOUT};

const DEADLINE: Duration = Duration::from_secs(20);

fn sh_backend() -> Arc<dyn Backend> {
    Arc::new(ProcessBackend {
        program: "sh".to_string(),
        args: Vec::new(),
    })
}

async fn start_script(
    store: &WorkspaceStore,
    session: &str,
    script: &str,
    timeout: Duration,
) -> RunHandle {
    let workspace = store.create(session).await.unwrap();
    store
        .write_source(&workspace, "main.sh", script)
        .await
        .unwrap();
    let spec = RunSpec {
        instance: format!("runbox-{session}-1"),
        workspace: workspace.clone(),
        host_workspace: workspace,
        source_file: "main.sh".to_string(),
    };
    run::start(sh_backend(), spec, timeout).unwrap()
}

/// Drain a run to completion, concatenating the two streams.
async fn drain(handle: &mut RunHandle) -> (String, String, i32) {
    let mut stdout = String::new();
    let mut stderr = String::new();
    loop {
        let event = tokio::time::timeout(DEADLINE, handle.recv())
            .await
            .expect("timed out waiting for run event")
            .expect("event channel closed before the exit event");
        match event {
            RunEvent::Stdout(chunk) => stdout.push_str(&chunk),
            RunEvent::Stderr(chunk) => stderr.push_str(&chunk),
            RunEvent::Exited { code } => return (stdout, stderr, code),
        }
    }
}

#[tokio::test]
async fn test_natural_exit_reports_output_then_code() {
    let root = tempfile::tempdir().unwrap();
    let store = WorkspaceStore::new(root.path());

    let mut handle = start_script(
        &store,
        "nat",
        "printf 'hi\\n'\nexit 3\n",
        Duration::from_secs(30),
    )
    .await;

    let (stdout, stderr, code) = drain(&mut handle).await;
    assert_eq!(stdout, "hi\n");
    assert_eq!(stderr, "");
    assert_eq!(code, 3);

    // nothing after the exit event
    assert_eq!(handle.recv().await, None);
}

#[tokio::test]
async fn test_stderr_is_a_distinct_stream() {
    let root = tempfile::tempdir().unwrap();
    let store = WorkspaceStore::new(root.path());

    let mut handle = start_script(
        &store,
        "err",
        "echo out\necho err 1>&2\n",
        Duration::from_secs(30),
    )
    .await;

    let (stdout, stderr, code) = drain(&mut handle).await;
    assert_eq!(stdout, "out\n");
    assert_eq!(stderr, "err\n");
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_timeout_terminates_the_run() {
    let root = tempfile::tempdir().unwrap();
    let store = WorkspaceStore::new(root.path());

    let started = Instant::now();
    let mut handle = start_script(&store, "slow", "sleep 30\n", Duration::from_millis(500)).await;

    let (_, _, code) = drain(&mut handle).await;
    assert_eq!(code, EXIT_TIMEOUT);
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "timeout did not fire in time"
    );
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let root = tempfile::tempdir().unwrap();
    let store = WorkspaceStore::new(root.path());

    let mut handle = start_script(&store, "stop", "sleep 30\n", Duration::from_secs(60)).await;
    handle.stop();
    handle.stop();

    let (_, _, code) = drain(&mut handle).await;
    assert_eq!(code, EXIT_STOPPED);

    // a second exit must never appear
    assert_eq!(handle.recv().await, None);

    // stopping after exit is a no-op
    handle.stop();
}

#[tokio::test]
async fn test_input_reaches_stdin() {
    let root = tempfile::tempdir().unwrap();
    let store = WorkspaceStore::new(root.path());

    let mut handle = start_script(
        &store,
        "echoer",
        "read name\necho \"got $name\"\n",
        Duration::from_secs(30),
    )
    .await;
    handle.send_input("Ann".to_string()).await;

    let (stdout, _, code) = drain(&mut handle).await;
    assert_eq!(stdout, "got Ann\n");
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_spawn_failure_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    let store = WorkspaceStore::new(root.path());
    let workspace = store.create("missing").await.unwrap();
    store
        .write_source(&workspace, "main.sh", "echo unreachable\n")
        .await
        .unwrap();

    let backend: Arc<dyn Backend> = Arc::new(ProcessBackend {
        program: "definitely-not-an-interpreter".to_string(),
        args: Vec::new(),
    });
    let spec = RunSpec {
        instance: "runbox-missing-1".to_string(),
        workspace: workspace.clone(),
        host_workspace: workspace,
        source_file: "main.sh".to_string(),
    };

    let result = run::start(backend, spec, Duration::from_secs(30));
    assert!(matches!(result, Err(runbox_exec::Error::Spawn(_))));
}
