//! Runtime configuration shared by the listener and its sessions.

use std::time::Duration;

use runbox_exec::PathTranslator;

/// Default hard wall-clock limit for a single run.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-session knobs handed to every coordinator.
#[derive(Clone)]
pub struct SessionSettings {
    /// File name the submitted source is staged under inside the
    /// workspace.
    pub source_file: String,
    /// Hard wall-clock limit for a single run.
    pub run_timeout: Duration,
    /// Maps workspace paths to the paths the isolation backend mounts.
    pub translator: PathTranslator,
}
