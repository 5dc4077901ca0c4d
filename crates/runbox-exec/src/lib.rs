//! Isolated execution layer for runbox.
//!
//! This crate owns everything between "source code arrived" and "the run
//! reported its exit": the ephemeral per-session workspace, the path
//! translation needed when the daemon itself is containerized, the
//! isolation backend that launches resource-bounded processes, and the
//! controller that supervises one run and relays its stdio as events.

pub mod backend;
pub mod error;
pub mod mount;
pub mod run;
pub mod workspace;

pub use backend::{Backend, DockerBackend, ProcessBackend, RunSpec};
pub use error::Error;
pub use mount::PathTranslator;
pub use run::{RunEvent, RunHandle};
pub use workspace::WorkspaceStore;

pub type Result<T> = std::result::Result<T, Error>;
