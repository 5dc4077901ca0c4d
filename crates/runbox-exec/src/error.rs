//! Error types for the execution layer.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while preparing or launching a run
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn isolated process: {0}")]
    Spawn(std::io::Error),

    #[error("path {path} is outside the configured root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },
}
