//! From a resolved context to the archive that gets uploaded.

use std::path::{Path, PathBuf};

use prov_core::IGNORE_FILE_NAME;

use crate::archive::{ArchiveError, ArchivePacker, ArchiveStream, Compression, PackOptions};
use crate::context::{ContextError, ResolvedContext};
use crate::ignore::{self, IgnoreError};
use crate::pattern::{PatternError, PatternMatcher};
use crate::validate::{ValidationError, validate_context};

/// An archive ready to be sent, plus the Enginefile's path inside it.
#[derive(Debug)]
pub struct PreparedContext {
    pub archive: ArchiveStream,
    pub relative_specfile: PathBuf,
}

/// Package a resolved context.
///
/// Directories go through ignore loading, build-file protection,
/// validation and packing; a cloned checkout is removed when the archive
/// is closed. Archive contexts pass through unchanged.
pub fn prepare_context<P: ArchivePacker>(
    packer: &P,
    resolved: ResolvedContext,
    compression: Compression,
) -> Result<PreparedContext, PrepareError> {
    let context = match resolved {
        ResolvedContext::Archive(archive) => {
            return Ok(PreparedContext {
                archive: archive.stream,
                relative_specfile: archive.specfile,
            });
        }
        ResolvedContext::Directory(context) => context,
    };

    let dir = context.dir().to_path_buf();
    let relative_specfile = context.relative_specfile().to_path_buf();

    let mut excludes = ignore::load(&dir)?;
    protect_build_files(&mut excludes, &relative_specfile)?;
    tracing::debug!(patterns = excludes.len(), "exclusion patterns loaded");

    validate_context(&dir, &excludes)?;

    let options = PackOptions {
        compression,
        excludes,
        ..PackOptions::default()
    };
    let mut archive = packer.pack(&dir, &options)?;
    if let Some(checkout) = context.into_checkout() {
        archive = archive.with_cleanup(move || checkout.close());
    }

    tracing::info!(
        dir = %dir.display(),
        specfile = %relative_specfile.display(),
        compression = ?compression,
        "build context packaged"
    );
    Ok(PreparedContext {
        archive,
        relative_specfile,
    })
}

/// Re-include the Enginefile and `.provignore` if the patterns exclude them.
///
/// The server needs the Enginefile and may want to see the ignore rules
/// that shaped the context.
pub fn protect_build_files(
    excludes: &mut Vec<String>,
    relative_specfile: &Path,
) -> Result<(), PatternError> {
    if excludes.is_empty() {
        return Ok(());
    }
    let matcher = PatternMatcher::new(excludes.as_slice())?;
    let specfile = slash_path(relative_specfile);

    let mut exceptions = Vec::new();
    for keep in [specfile.as_str(), IGNORE_FILE_NAME] {
        if matcher.matches(keep) {
            exceptions.push(format!("!{keep}"));
        }
    }
    if !exceptions.is_empty() {
        tracing::debug!(exceptions = ?exceptions, "keeping build files excluded by patterns");
        excludes.extend(exceptions);
    }
    Ok(())
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Anything that can go wrong between a context source and its archive.
#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Ignore(#[from] IgnoreError),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to package context")]
    Archive(#[from] ArchiveError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn no_patterns_no_exceptions() {
        let mut excludes = Vec::new();
        protect_build_files(&mut excludes, Path::new("Enginefile")).unwrap();
        assert!(excludes.is_empty());
    }

    #[test]
    fn excluded_specfile_is_re_included() {
        let mut excludes = strings(&["*"]);
        protect_build_files(&mut excludes, Path::new("Enginefile")).unwrap();
        assert_eq!(excludes, strings(&["*", "!Enginefile", "!.provignore"]));
    }

    #[test]
    fn nested_specfile_is_re_included() {
        let mut excludes = strings(&["engines"]);
        protect_build_files(&mut excludes, Path::new("engines/api/Enginefile")).unwrap();
        assert_eq!(excludes, strings(&["engines", "!engines/api/Enginefile"]));
    }

    #[test]
    fn untouched_when_build_files_survive() {
        let mut excludes = strings(&["target", "*.log"]);
        protect_build_files(&mut excludes, Path::new("Enginefile")).unwrap();
        assert_eq!(excludes, strings(&["target", "*.log"]));
    }
}
