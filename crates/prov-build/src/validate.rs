use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::pattern::{PatternError, PatternMatcher};
use crate::walk::walk_context;

/// Checks that every file the archive would contain can be read.
///
/// Excluded paths are skipped with the same matcher the packager uses.
/// Symlinks and special files are never opened: dangling links are
/// legitimate context content and opening a FIFO would block. A file that
/// disappears between listing and opening is not an error.
pub fn validate_context(context_dir: &Path, excludes: &[String]) -> Result<(), ValidationError> {
    let matcher = PatternMatcher::new(excludes)?;
    let mut checked = 0usize;

    walk_context(context_dir, context_dir, &matcher, |entry| {
        if entry.file_type.is_dir() || entry.file_type.is_symlink() || entry.is_special() {
            return Ok(());
        }

        match std::fs::File::open(entry.path) {
            Ok(_) => {
                checked += 1;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                Err(ValidationError::PermissionDenied {
                    path: entry.path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %entry.path.display(), "file removed during validation");
                Ok(())
            }
            Err(e) => Err(ValidationError::Io {
                path: entry.path.to_path_buf(),
                source: e,
            }),
        }
    })?;

    tracing::debug!(dir = %context_dir.display(), files = checked, "context validated");
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("no permission to read from '{}'", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("can't stat '{}'", path.display())]
    CannotStat { path: PathBuf },

    #[error("failed to read '{}'", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to walk context directory")]
    Walk { source: walkdir::Error },

    #[error(transparent)]
    Pattern(#[from] PatternError),
}

impl From<walkdir::Error> for ValidationError {
    fn from(e: walkdir::Error) -> Self {
        let permission = e.io_error().map(|io| io.kind()) == Some(ErrorKind::PermissionDenied);
        match (permission, e.path()) {
            (true, Some(path)) => Self::CannotStat {
                path: path.to_path_buf(),
            },
            _ => Self::Walk { source: e },
        }
    }
}
