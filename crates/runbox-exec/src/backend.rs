//! Isolation backends for launching one resource-bounded process per run.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Everything a backend needs to launch one run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Unique, session-derived instance name, so the run can be targeted
    /// for termination independently of the process handle.
    pub instance: String,
    /// Workspace directory as the daemon sees it.
    pub workspace: PathBuf,
    /// Workspace directory as the backend must mount it (host-resolved).
    pub host_workspace: PathBuf,
    /// File name of the staged source inside the workspace.
    pub source_file: String,
}

/// A facility that launches isolated, resource-bounded processes.
///
/// Implementations configure the command; spawning and ownership of the
/// child handle stay with the execution controller.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Build the fully configured launch command for a run: resource
    /// ceilings, workspace mount, instance name, entry argument, piped
    /// stdio.
    fn launch(&self, spec: &RunSpec) -> Command;

    /// Terminate a run by its instance name, out-of-band of the process
    /// handle. Killing an instance that is already gone is a no-op.
    async fn kill_instance(&self, instance: &str);
}

/// Docker-based isolation: one `docker run` per run, bounded by a memory
/// ceiling and a CPU share, with the workspace as the only mount.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    /// Image the interpreter lives in.
    pub image: String,
    /// Memory ceiling, `docker run --memory` syntax (e.g. "100m").
    pub memory: String,
    /// CPU share, `docker run --cpus` syntax (e.g. "0.5").
    pub cpus: String,
    /// Mount point of the workspace inside the container.
    pub workdir: String,
    /// Interpreter argv invoked on the staged source file.
    pub interpreter: Vec<String>,
}

#[async_trait]
impl Backend for DockerBackend {
    fn launch(&self, spec: &RunSpec) -> Command {
        let mut volume = spec.host_workspace.clone().into_os_string();
        volume.push(":");
        volume.push(&self.workdir);

        let mut command = Command::new("docker");
        command
            .arg("run")
            .arg("--rm")
            .arg("-i")
            .arg("--name")
            .arg(&spec.instance)
            .arg("--memory")
            .arg(&self.memory)
            .arg("--cpus")
            .arg(&self.cpus)
            .arg("-v")
            .arg(volume)
            .arg(&self.image)
            .args(&self.interpreter)
            .arg(container_source_path(&self.workdir, &spec.source_file))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn kill_instance(&self, instance: &str) {
        match Command::new("docker").args(["kill", instance]).output().await {
            Ok(output) if output.status.success() => {
                debug!("killed container {}", instance);
            }
            Ok(output) => {
                // an already-exited container reports an error here; that
                // is the no-op case, not a failure
                debug!(
                    "docker kill {}: {}",
                    instance,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(err) => warn!("failed to run docker kill for {}: {}", instance, err),
        }
    }
}

/// Direct process execution with no isolation layer. Used by tests and by
/// deployments where the daemon already runs inside a locked-down
/// environment.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    /// Interpreter binary invoked on the staged source file.
    pub program: String,
    /// Arguments placed before the source path.
    pub args: Vec<String>,
}

#[async_trait]
impl Backend for ProcessBackend {
    fn launch(&self, spec: &RunSpec) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(spec.workspace.join(&spec.source_file))
            .current_dir(&spec.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn kill_instance(&self, instance: &str) {
        // direct processes have no out-of-band identity; the handle kill
        // is the only termination path
        debug!("no out-of-band kill for direct process {}", instance);
    }
}

fn container_source_path(workdir: &str, source_file: &str) -> String {
    format!("{}/{}", workdir.trim_end_matches('/'), source_file)
}
