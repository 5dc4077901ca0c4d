//! Workspace path translation for nested isolation.
//!
//! The isolation backend resolves volume-mount sources against the host
//! filesystem. When the daemon itself runs inside a container, the
//! workspace path it sees is not the path the backend can mount, so the
//! path must be rebased from the daemon's root onto the host-visible root.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Maps workspace paths as the daemon sees them to the paths the isolation
/// backend must use to mount them. Pure path computation, no filesystem
/// access.
#[derive(Debug, Clone, Default)]
pub struct PathTranslator {
    rebase: Option<Rebase>,
}

#[derive(Debug, Clone)]
struct Rebase {
    internal_root: PathBuf,
    host_root: PathBuf,
}

impl PathTranslator {
    /// Identity translation, for a daemon running directly on the host.
    pub fn identity() -> Self {
        Self { rebase: None }
    }

    /// Rebase paths under `internal_root` onto `host_root`.
    pub fn rebased(internal_root: impl Into<PathBuf>, host_root: impl Into<PathBuf>) -> Self {
        Self {
            rebase: Some(Rebase {
                internal_root: internal_root.into(),
                host_root: host_root.into(),
            }),
        }
    }

    /// Translate a daemon-visible path into the host path the backend can
    /// mount. A path outside the configured root is an error, never a
    /// silently truncated mount source.
    pub fn to_host_path(&self, internal: &Path) -> Result<PathBuf> {
        let Some(rebase) = &self.rebase else {
            return Ok(internal.to_path_buf());
        };

        let relative = internal
            .strip_prefix(&rebase.internal_root)
            .map_err(|_| Error::OutsideRoot {
                path: internal.to_path_buf(),
                root: rebase.internal_root.clone(),
            })?;
        Ok(rebase.host_root.join(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_translation() {
        let translator = PathTranslator::identity();
        let path = Path::new("/tmp/runbox/sessions/abc");
        assert_eq!(translator.to_host_path(path).unwrap(), path);
    }

    #[test]
    fn test_rebase_onto_host_root() {
        let translator = PathTranslator::rebased("/data/sessions", "/srv/runbox/sessions");
        let host = translator
            .to_host_path(Path::new("/data/sessions/abc"))
            .unwrap();
        assert_eq!(host, PathBuf::from("/srv/runbox/sessions/abc"));
    }

    #[test]
    fn test_path_outside_root_is_an_error() {
        let translator = PathTranslator::rebased("/data/sessions", "/srv/runbox/sessions");
        let err = translator.to_host_path(Path::new("/etc/passwd")).unwrap_err();
        assert!(matches!(err, Error::OutsideRoot { .. }));
    }
}
