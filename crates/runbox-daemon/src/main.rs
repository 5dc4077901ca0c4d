use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use runbox_daemon::config::{SessionSettings, DEFAULT_RUN_TIMEOUT};
use runbox_daemon::server::{RunboxServer, SessionContext};
use runbox_exec::{Backend, DockerBackend, PathTranslator, ProcessBackend, WorkspaceStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on for session connections
    #[arg(long, default_value = "127.0.0.1:4001")]
    listen: SocketAddr,

    /// Directory holding the per-session workspaces
    #[arg(long, default_value = "/tmp/runbox/sessions")]
    workspace_root: PathBuf,

    /// Isolation backend: docker or process
    #[arg(long, default_value = "docker")]
    backend: String,

    /// Container image used by the docker backend
    #[arg(long, default_value = "docker.io/library/python:3.12-alpine")]
    image: String,

    /// Memory ceiling per run (docker --memory syntax)
    #[arg(long, default_value = "100m")]
    memory: String,

    /// CPU share per run (docker --cpus syntax)
    #[arg(long, default_value = "0.5")]
    cpus: String,

    /// Mount point of the workspace inside the container
    #[arg(long, default_value = "/workspace")]
    container_workdir: String,

    /// Interpreter invoked on the staged source file
    #[arg(long, default_value = "python3", value_delimiter = ' ')]
    interpreter: Vec<String>,

    /// File name the submitted source is staged under
    #[arg(long, default_value = "main.py")]
    source_file: String,

    /// Wall-clock limit for a single run, in seconds
    #[arg(long, default_value_t = DEFAULT_RUN_TIMEOUT.as_secs())]
    timeout_secs: u64,

    /// Workspace root as this process sees it, for a daemon that itself
    /// runs inside a container (must be paired with --mount-host-root)
    #[arg(long)]
    mount_internal_root: Option<PathBuf>,

    /// Host-side path the isolation backend resolves workspace mounts
    /// against
    #[arg(long)]
    mount_host_root: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting runbox daemon");

    let translator = match (args.mount_internal_root, args.mount_host_root) {
        (None, None) => PathTranslator::identity(),
        (Some(internal), Some(host)) => PathTranslator::rebased(internal, host),
        _ => bail!("--mount-internal-root and --mount-host-root must be set together"),
    };

    let backend: Arc<dyn Backend> = match args.backend.as_str() {
        "docker" => Arc::new(DockerBackend {
            image: args.image,
            memory: args.memory,
            cpus: args.cpus,
            workdir: args.container_workdir,
            interpreter: args.interpreter,
        }),
        "process" => {
            let (program, rest) = args
                .interpreter
                .split_first()
                .context("--interpreter must not be empty")?;
            Arc::new(ProcessBackend {
                program: program.clone(),
                args: rest.to_vec(),
            })
        }
        other => bail!("unknown backend '{other}' (expected docker or process)"),
    };

    let ctx = SessionContext {
        store: WorkspaceStore::new(args.workspace_root),
        backend,
        settings: SessionSettings {
            source_file: args.source_file,
            run_timeout: Duration::from_secs(args.timeout_secs),
            translator,
        },
    };

    let mut server = RunboxServer::bind(args.listen, ctx).await?;

    // Set up signal handlers for graceful shutdown
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = server.run() => {
            if let Err(err) = result {
                error!("server error: {}", err);
                return Err(err);
            }
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
            server.shutdown().await;
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            server.shutdown().await;
        }
    }

    Ok(())
}
