//! The one traversal of a context directory.
//!
//! Validation and packaging both go through [`walk_context`], so a path
//! the validator skips is exactly a path the archive omits.

use std::fs::FileType;
use std::io::ErrorKind;
use std::path::Path;

use walkdir::WalkDir;

use crate::pattern::PatternMatcher;

/// A non-excluded entry under the context root.
pub struct ContextEntry<'a> {
    /// Absolute path on disk
    pub path: &'a Path,
    /// Path relative to the context root, `/`-separated
    pub relative: &'a str,
    pub file_type: FileType,
}

impl ContextEntry<'_> {
    /// Sockets, FIFOs and devices: never opened, never archived.
    pub fn is_special(&self) -> bool {
        if self.file_type.is_dir() || self.file_type.is_file() || self.file_type.is_symlink() {
            return false;
        }
        true
    }
}

/// Walk `start` (the context root or a path inside it), calling `visit` for
/// every entry the matcher does not exclude. Symlinks are not followed.
/// Entries that vanish mid-walk are skipped.
pub fn walk_context<E, F>(
    root: &Path,
    start: &Path,
    matcher: &PatternMatcher,
    mut visit: F,
) -> Result<(), E>
where
    E: From<walkdir::Error>,
    F: FnMut(&ContextEntry<'_>) -> Result<(), E>,
{
    let mut entries = WalkDir::new(start)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = entries.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) => {
                tracing::debug!(error = %e, "entry vanished during walk");
                continue;
            }
            Err(e) => return Err(E::from(e)),
        };

        let relative = relative_slash_path(root, entry.path());
        if relative == "." {
            continue;
        }

        let file_type = entry.file_type();
        if matcher.matches(&relative) {
            if file_type.is_dir() && matcher.can_skip_dir(&relative) {
                tracing::debug!(path = %relative, "excluded directory");
                entries.skip_current_dir();
            } else {
                tracing::debug!(path = %relative, "excluded");
            }
            continue;
        }

        visit(&ContextEntry {
            path: entry.path(),
            relative: &relative,
            file_type,
        })?;
    }

    Ok(())
}

fn relative_slash_path(root: &Path, path: &Path) -> String {
    let Ok(relative) = path.strip_prefix(root) else {
        return path.to_string_lossy().into_owned();
    };
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    if parts.is_empty() {
        ".".to_owned()
    } else {
        parts.join("/")
    }
}
