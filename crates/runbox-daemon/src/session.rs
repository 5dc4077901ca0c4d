//! Per-connection session coordinator.
//!
//! One task owns one session: it reads protocol messages off the
//! connection, drives the execution layer, and forwards run events back to
//! the client. Inbound messages and run events are serialized through a
//! single `select!` loop, so a `stop` arriving concurrently with a natural
//! exit can never race into a double-cleanup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use runbox_exec::{run, RunEvent, RunHandle, RunSpec};
use runbox_proto::{ClientMessage, ServerMessage, EXIT_LAUNCH_FAILED};

use crate::server::SessionContext;

/// How long a terminating run gets to confirm its exit before teardown
/// proceeds without it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Running,
    Closed,
}

struct Session {
    id: String,
    ctx: Arc<SessionContext>,
    workspace: PathBuf,
    state: SessionState,
    active: Option<RunHandle>,
    run_seq: u64,
}

/// What the serve loop woke up for.
enum Step {
    Inbound(std::io::Result<Option<String>>),
    Run(Option<RunEvent>),
}

/// Run one session to completion. The workspace is created up front and
/// torn down on every exit path, normal or not.
pub async fn run_session(
    ctx: Arc<SessionContext>,
    id: String,
    socket: TcpStream,
) -> Result<()> {
    let workspace = ctx
        .store
        .create(&id)
        .await
        .context("failed to create session workspace")?;
    info!("session {} started (workspace {})", id, workspace.display());

    let (reader, writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut writer = writer;

    let mut session = Session {
        id,
        ctx,
        workspace,
        state: SessionState::Idle,
        active: None,
        run_seq: 0,
    };

    let result = session.serve(&mut lines, &mut writer).await;
    session.close().await;
    result
}

impl Session {
    async fn serve(
        &mut self,
        lines: &mut Lines<BufReader<OwnedReadHalf>>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        loop {
            let step = tokio::select! {
                line = lines.next_line() => Step::Inbound(line),
                event = next_event(&mut self.active) => Step::Run(event),
            };

            match step {
                Step::Inbound(Ok(Some(line))) => {
                    self.handle_line(line.trim(), writer).await?;
                }
                Step::Inbound(Ok(None)) => {
                    debug!("session {}: client disconnected", self.id);
                    return Ok(());
                }
                Step::Inbound(Err(err)) => {
                    warn!("session {}: connection read failed: {}", self.id, err);
                    return Ok(());
                }
                Step::Run(Some(event)) => {
                    self.handle_event(event, writer).await?;
                }
                Step::Run(None) => {
                    // should not happen: the controller always closes the
                    // channel after the exit event
                    warn!(
                        "session {}: run event channel closed without an exit event",
                        self.id
                    );
                    self.active = None;
                    self.state = SessionState::Idle;
                }
            }
        }
    }

    /// Dispatch one inbound protocol line. A malformed message is dropped
    /// and logged; only connection-level write failures propagate.
    async fn handle_line(&mut self, line: &str, writer: &mut OwnedWriteHalf) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }

        let message = match serde_json::from_str::<ClientMessage>(line) {
            Ok(message) => message,
            Err(err) => {
                warn!("session {}: dropping malformed message: {}", self.id, err);
                return Ok(());
            }
        };

        match message {
            ClientMessage::Code { user_id, code } => self.handle_code(&user_id, &code, writer).await,
            ClientMessage::Input { data } => {
                self.handle_input(data).await;
                Ok(())
            }
            ClientMessage::Stop { user_id } => {
                self.handle_stop(&user_id);
                Ok(())
            }
        }
    }

    /// Start a run for freshly submitted source, superseding any run that
    /// is still active (latest wins, no queuing).
    async fn handle_code(
        &mut self,
        user_id: &str,
        code: &str,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        self.supersede_active().await;

        info!(
            "session {}: starting run for user '{}' ({} bytes of source)",
            self.id,
            user_id,
            code.len()
        );

        if let Err(err) = self
            .ctx
            .store
            .write_source(&self.workspace, &self.ctx.settings.source_file, code)
            .await
        {
            warn!("session {}: failed to stage source: {}", self.id, err);
            send(writer, &ServerMessage::error(format!("could not stage source: {err}"))).await?;
            return Ok(());
        }

        let host_workspace = match self.ctx.settings.translator.to_host_path(&self.workspace) {
            Ok(path) => path,
            Err(err) => {
                warn!(
                    "session {}: failed to resolve workspace mount: {}",
                    self.id, err
                );
                send(
                    writer,
                    &ServerMessage::error(format!("could not resolve workspace mount: {err}")),
                )
                .await?;
                send(writer, &ServerMessage::exit(EXIT_LAUNCH_FAILED)).await?;
                return Ok(());
            }
        };

        self.run_seq += 1;
        let spec = RunSpec {
            instance: format!("runbox-{}-{}", self.id, self.run_seq),
            workspace: self.workspace.clone(),
            host_workspace,
            source_file: self.ctx.settings.source_file.clone(),
        };

        match run::start(
            self.ctx.backend.clone(),
            spec,
            self.ctx.settings.run_timeout,
        ) {
            Ok(handle) => {
                debug!("session {}: run {} started", self.id, handle.instance());
                self.active = Some(handle);
                self.state = SessionState::Running;
            }
            Err(err) => {
                warn!("session {}: failed to launch run: {}", self.id, err);
                send(
                    writer,
                    &ServerMessage::error(format!("could not start execution: {err}")),
                )
                .await?;
                send(writer, &ServerMessage::exit(EXIT_LAUNCH_FAILED)).await?;
                self.state = SessionState::Idle;
            }
        }

        Ok(())
    }

    /// Forward one input line to the active run; without one the line is
    /// discarded (no buffering across runs).
    async fn handle_input(&mut self, data: String) {
        match (&self.state, &self.active) {
            (SessionState::Running, Some(active)) => active.send_input(data).await,
            _ => debug!("session {}: ignoring input with no active run", self.id),
        }
    }

    /// Request termination of the active run. The session stays in
    /// `Running` until the exit event confirms the termination; a stop
    /// with no active run is a no-op.
    fn handle_stop(&mut self, user_id: &str) {
        match &self.active {
            Some(active) => {
                info!(
                    "session {}: stop requested by user '{}' for run {}",
                    self.id,
                    user_id,
                    active.instance()
                );
                active.stop();
            }
            None => debug!("session {}: stop with no active run", self.id),
        }
    }

    /// Forward one run event to the client. The exit event is what moves
    /// the session back to `Idle`.
    async fn handle_event(
        &mut self,
        event: RunEvent,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        match event {
            RunEvent::Stdout(data) => send(writer, &ServerMessage::output(data)).await,
            RunEvent::Stderr(data) => send(writer, &ServerMessage::error(data)).await,
            RunEvent::Exited { code } => {
                info!("session {}: run exited with code {}", self.id, code);
                self.active = None;
                self.state = SessionState::Idle;
                send(writer, &ServerMessage::exit(code)).await
            }
        }
    }

    /// Stop and drain a run that is being replaced. Nothing further from
    /// it reaches the client, including its exit.
    async fn supersede_active(&mut self) {
        let Some(run) = self.active.take() else {
            return;
        };
        debug!("session {}: superseding run {}", self.id, run.instance());
        stop_and_drain(&self.id, run).await;
        self.state = SessionState::Idle;
    }

    /// Tear the session down. Idempotent; each cleanup step is attempted
    /// and logged independently, so a failure in one never skips the
    /// other.
    async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        if let Some(run) = self.active.take() {
            stop_and_drain(&self.id, run).await;
        }
        self.ctx.store.destroy(&self.workspace).await;

        self.state = SessionState::Closed;
        info!("session {} closed", self.id);
    }
}

/// Stop a run and wait for its exit confirmation, bounded so teardown can
/// never hang on an unresponsive backend.
async fn stop_and_drain(session_id: &str, mut run: RunHandle) {
    run.stop();
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(event) = run.recv().await {
            if matches!(event, RunEvent::Exited { .. }) {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            "session {}: run {} did not confirm exit in time",
            session_id,
            run.instance()
        );
    }
}

/// Next event from the active run, or pending forever while no run is
/// active so the select loop only wakes for inbound messages.
async fn next_event(active: &mut Option<RunHandle>) -> Option<RunEvent> {
    match active {
        Some(run) => run.recv().await,
        None => std::future::pending().await,
    }
}

/// Write one server message as a JSON line.
async fn send(writer: &mut OwnedWriteHalf, message: &ServerMessage) -> Result<()> {
    let mut payload = serde_json::to_string(message).context("failed to encode server message")?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .context("failed to write to connection")?;
    Ok(())
}
