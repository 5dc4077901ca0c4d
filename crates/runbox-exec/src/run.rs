//! Execution controller: spawns one isolated process per run, supervises
//! it, and relays its stdio as typed events.
//!
//! All run activity is delivered over a single event channel so the
//! consumer can reason about ordering: chunks from one stream arrive in
//! the order they were produced, and exactly one `Exited` event closes the
//! stream. The supervision task is the only sender of `Exited`, which is
//! what makes exit reporting exactly-once regardless of whether the
//! process exited on its own, hit the deadline, or was stopped.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use runbox_proto::{EXIT_STOPPED, EXIT_TIMEOUT};

use crate::backend::{Backend, RunSpec};
use crate::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const OUTPUT_CHUNK_BYTES: usize = 8192;

/// How long a force-killed run's output pumps get to reach EOF. A child of
/// the killed process can inherit the output pipes and keep them open
/// indefinitely; its chunks are forfeit once the exit is reported.
const FORCED_PUMP_GRACE: Duration = Duration::from_secs(2);

/// Event emitted by a running execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Chunk from the process's standard output.
    Stdout(String),
    /// Chunk from the process's standard error.
    Stderr(String),
    /// The run terminated; emitted exactly once per run.
    Exited { code: i32 },
}

/// Owning handle for one live run.
pub struct RunHandle {
    instance: String,
    events: mpsc::Receiver<RunEvent>,
    input: mpsc::Sender<String>,
    stop: watch::Sender<bool>,
}

impl RunHandle {
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Next event from the run. `None` only after the channel is fully
    /// drained past the `Exited` event.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// Request termination. Idempotent, and safe to call concurrently with
    /// the deadline firing or the process exiting on its own.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Forward one line to the process's standard input; a newline
    /// terminator is appended by the writer.
    pub async fn send_input(&self, line: String) {
        if self.input.send(line).await.is_err() {
            debug!("input for {} dropped, process already gone", self.instance);
        }
    }
}

/// Spawn the isolated process for a run and start its supervision
/// machinery. The returned handle is the only way to observe or influence
/// the run.
pub fn start(backend: Arc<dyn Backend>, spec: RunSpec, timeout: Duration) -> Result<RunHandle> {
    let mut command = backend.launch(&spec);
    let mut child = command.spawn().map_err(Error::Spawn)?;
    let deadline = Instant::now() + timeout;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Spawn(std::io::Error::other("missing child stdout pipe")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Spawn(std::io::Error::other("missing child stderr pipe")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Spawn(std::io::Error::other("missing child stdin pipe")))?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (input_tx, input_rx) = mpsc::channel::<String>(EVENT_CHANNEL_CAPACITY);
    let (stop_tx, stop_rx) = watch::channel(false);

    let stdout_pump = pump_output(stdout, events_tx.clone(), RunEvent::Stdout);
    let stderr_pump = pump_output(stderr, events_tx.clone(), RunEvent::Stderr);
    let _ = feed_input(stdin, input_rx);

    tokio::spawn(supervise(
        backend,
        spec.instance.clone(),
        child,
        deadline,
        stop_rx,
        [stdout_pump, stderr_pump],
        events_tx,
    ));

    Ok(RunHandle {
        instance: spec.instance,
        events: events_rx,
        input: input_tx,
        stop: stop_tx,
    })
}

/// Relay chunks from one output stream into the event channel. Chunk
/// boundaries are arbitrary; per-stream ordering is preserved because one
/// task is the only reader of the stream.
fn pump_output<R>(
    mut reader: R,
    events: mpsc::Sender<RunEvent>,
    wrap: fn(String) -> RunEvent,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; OUTPUT_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if events.send(wrap(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!("output pump ended: {}", err);
                    break;
                }
            }
        }
    })
}

/// Write submitted lines to the process's standard input, appending the
/// newline terminator. The task ends when the run's handle goes away or
/// the pipe breaks.
fn feed_input(
    mut stdin: tokio::process::ChildStdin,
    mut input: mpsc::Receiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = input.recv().await {
            if stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdin.write_all(b"\n").await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    })
}

/// Own the child for the lifetime of the run and resolve the race between
/// natural exit, the deadline, and an explicit stop. Whichever fires
/// first decides the reported code; the other termination sources become
/// no-ops against an already-dead process.
async fn supervise(
    backend: Arc<dyn Backend>,
    instance: String,
    mut child: Child,
    deadline: Instant,
    mut stop_rx: watch::Receiver<bool>,
    pumps: [JoinHandle<()>; 2],
    events: mpsc::Sender<RunEvent>,
) {
    let (code, forced) = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                // no code means the process died to a signal
                let code = status.code().unwrap_or(EXIT_STOPPED);
                debug!("process {} exited with code {}", instance, code);
                (code, false)
            }
            Err(err) => {
                warn!("failed to await process {}: {}", instance, err);
                terminate(backend.as_ref(), &instance, &mut child).await;
                (EXIT_STOPPED, true)
            }
        },
        _ = tokio::time::sleep_until(deadline) => {
            warn!("run {} exceeded its time limit, terminating", instance);
            terminate(backend.as_ref(), &instance, &mut child).await;
            (EXIT_TIMEOUT, true)
        }
        _ = stop_requested(&mut stop_rx) => {
            debug!("stop requested for {}, terminating", instance);
            terminate(backend.as_ref(), &instance, &mut child).await;
            (EXIT_STOPPED, true)
        }
    };

    // let the pumps drain the pipes to EOF so every produced chunk is
    // delivered before the exit event; on a forced kill the wait is
    // bounded, because an inherited pipe can outlive the process
    let drain_pumps = async {
        for pump in pumps {
            let _ = pump.await;
        }
    };
    if forced {
        let _ = tokio::time::timeout(FORCED_PUMP_GRACE, drain_pumps).await;
    } else {
        drain_pumps.await;
    }

    if events.send(RunEvent::Exited { code }).await.is_err() {
        debug!("exit event for {} dropped, session already gone", instance);
    }
}

/// Both termination paths, each attempted regardless of the other: the
/// out-of-band kill by instance name reaches the isolation backend's own
/// process tree, the direct kill reaps the handle we own. Either one
/// hitting an already-dead process is a no-op.
async fn terminate(backend: &dyn Backend, instance: &str, child: &mut Child) {
    backend.kill_instance(instance).await;
    if let Err(err) = child.kill().await {
        debug!("direct kill of {} skipped: {}", instance, err);
        let _ = child.wait().await;
    }
}

/// Resolves when a stop is requested. A dropped handle counts as a stop,
/// so an abandoned run is torn down rather than leaked.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}
