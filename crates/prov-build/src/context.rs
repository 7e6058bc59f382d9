//! Resolution of a build context from its origin.
//!
//! Every origin ends in one of two shapes: a local directory plus the
//! Enginefile's path inside it ([`BuildContext`]), or a stream that already
//! is an archive ([`ArchiveContext`]). Directories still need ignore
//! loading, validation and packaging (see [`crate::prepare`]); archives are
//! passed to the server as-is.

use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};

use prov_core::{DEFAULT_ENGINEFILE_NAME, ProgressReader, ProgressSink};

use crate::archive::{
    ArchivePacker, ArchiveStream, Compression, HEADER_SIZE, PackOptions, is_archive,
};
use crate::git::{ClonedRepo, GitCloner, GitError, is_git_url};
use crate::prepare::{PrepareError, PreparedContext, prepare_context};
use crate::remote::{DownloadError, Downloader, is_url};

/// Where the build context comes from. Exactly one per invocation.
pub enum ContextSource {
    LocalDirectory(PathBuf),
    GitRepository(String),
    RemoteResource(String),
    InlineStream(Box<dyn Read + Send>),
}

impl std::fmt::Debug for ContextSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalDirectory(path) => f.debug_tuple("LocalDirectory").field(path).finish(),
            Self::GitRepository(url) => f.debug_tuple("GitRepository").field(url).finish(),
            Self::RemoteResource(url) => f.debug_tuple("RemoteResource").field(url).finish(),
            Self::InlineStream(_) => f.write_str("InlineStream(..)"),
        }
    }
}

impl ContextSource {
    /// Classify the positional `PATH | URL | -` argument.
    ///
    /// `stdin` is only invoked for `-`.
    pub fn from_arg(
        arg: &str,
        stdin: impl FnOnce() -> Box<dyn Read + Send>,
    ) -> Result<Self, ContextError> {
        if arg == "-" {
            return Ok(Self::InlineStream(stdin()));
        }
        if Path::new(arg).is_dir() {
            return Ok(Self::LocalDirectory(PathBuf::from(arg)));
        }
        if is_git_url(arg) {
            return Ok(Self::GitRepository(arg.to_owned()));
        }
        if is_url(arg) {
            return Ok(Self::RemoteResource(arg.to_owned()));
        }
        Err(ContextError::PathNotFound(arg.to_owned()))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::GitRepository(_) | Self::RemoteResource(_))
    }
}

/// A resolved context directory.
///
/// Invariant: `relative_specfile` never starts with a `..` component.
#[derive(Debug)]
pub struct BuildContext {
    dir: PathBuf,
    relative_specfile: PathBuf,
    checkout: Option<ClonedRepo>,
}

impl BuildContext {
    /// Absolute, symlink-resolved context directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Enginefile path relative to [`dir`](Self::dir).
    pub fn relative_specfile(&self) -> &Path {
        &self.relative_specfile
    }

    /// Temporary checkout backing this context, if it was cloned.
    pub(crate) fn into_checkout(self) -> Option<ClonedRepo> {
        self.checkout
    }
}

/// A stream that already is an archive, with the Enginefile name inside it.
#[derive(Debug)]
pub struct ArchiveContext {
    pub stream: ArchiveStream,
    pub specfile: PathBuf,
}

#[derive(Debug)]
pub enum ResolvedContext {
    Directory(BuildContext),
    Archive(ArchiveContext),
}

/// Per-call resolution inputs.
pub struct ResolveOptions {
    /// `-f/--file` as given on the command line
    pub specfile: Option<PathBuf>,
    /// Receives download progress for remote contexts
    pub progress: Box<dyn ProgressSink>,
}

/// Resolves any [`ContextSource`] using pluggable git, download and
/// packaging collaborators.
pub struct ContextResolver<G, D, P> {
    git: G,
    downloader: D,
    packer: P,
}

impl<G: GitCloner, D: Downloader, P: ArchivePacker> ContextResolver<G, D, P> {
    pub fn new(git: G, downloader: D, packer: P) -> Self {
        Self {
            git,
            downloader,
            packer,
        }
    }

    /// Package a resolved context with this resolver's packer.
    pub fn prepare(
        &self,
        resolved: ResolvedContext,
        compression: Compression,
    ) -> Result<PreparedContext, PrepareError> {
        prepare_context(&self.packer, resolved, compression)
    }

    pub fn resolve(
        &self,
        source: ContextSource,
        options: ResolveOptions,
    ) -> Result<ResolvedContext, ContextError> {
        let specfile = options.specfile.as_deref();
        match source {
            ContextSource::LocalDirectory(dir) => {
                from_local_dir(&dir, specfile).map(ResolvedContext::Directory)
            }
            ContextSource::GitRepository(url) => {
                self.from_git_url(&url, specfile).map(ResolvedContext::Directory)
            }
            ContextSource::RemoteResource(url) => {
                self.from_url(&url, specfile, options.progress)
            }
            ContextSource::InlineStream(reader) => self.from_reader(reader, specfile),
        }
    }

    /// Clone `url` and resolve the Enginefile inside the checkout.
    ///
    /// An explicit Enginefile path is relative to the checkout.
    pub fn from_git_url(
        &self,
        url: &str,
        specfile: Option<&Path>,
    ) -> Result<BuildContext, ContextError> {
        let checkout = self.git.clone_repo(url)?;
        let (dir, relative_specfile) = specfile_rel_path(checkout.context_dir(), specfile)?;
        Ok(BuildContext {
            dir,
            relative_specfile,
            checkout: Some(checkout),
        })
    }

    /// Download `url` and treat the body as an inline stream.
    pub fn from_url(
        &self,
        url: &str,
        specfile: Option<&Path>,
        progress: Box<dyn ProgressSink>,
    ) -> Result<ResolvedContext, ContextError> {
        let download = self.downloader.download(url)?;
        let reader = ProgressReader::new(
            download.body,
            progress,
            download.content_length,
            format!("Downloading build context from remote url: {url}"),
        );
        self.from_reader(Box::new(reader), specfile)
    }

    /// Read a stream as either an archive or the Enginefile itself.
    ///
    /// Archives pass through untouched. Anything else becomes the sole
    /// file of a temporary context, packaged uncompressed; the temporary
    /// directory lives until the returned stream is closed or dropped.
    pub fn from_reader(
        &self,
        mut reader: Box<dyn Read + Send>,
        specfile: Option<&Path>,
    ) -> Result<ResolvedContext, ContextError> {
        let mut header = Vec::with_capacity(HEADER_SIZE);
        reader
            .by_ref()
            .take(HEADER_SIZE as u64)
            .read_to_end(&mut header)
            .map_err(|e| ContextError::Peek { source: e })?;

        let archive = is_archive(&header);
        let mut stream = Cursor::new(header).chain(reader);

        if archive {
            let specfile = match specfile {
                Some(path) => path.to_path_buf(),
                None => PathBuf::from(DEFAULT_ENGINEFILE_NAME),
            };
            tracing::debug!(specfile = %specfile.display(), "context stream is an archive");
            return Ok(ResolvedContext::Archive(ArchiveContext {
                stream: ArchiveStream::new(stream),
                specfile,
            }));
        }

        let tmp = tempfile::Builder::new()
            .prefix("prov-build-context-")
            .tempdir()
            .map_err(|e| ContextError::TempDir { source: e })?;
        let path = tmp.path().join(DEFAULT_ENGINEFILE_NAME);
        let mut file = std::fs::File::create(&path).map_err(|e| ContextError::WriteSpecFile {
            path: path.clone(),
            source: e,
        })?;
        let written = io::copy(&mut stream, &mut file).map_err(|e| ContextError::WriteSpecFile {
            path: path.clone(),
            source: e,
        })?;
        file.sync_all().map_err(|e| ContextError::WriteSpecFile {
            path: path.clone(),
            source: e,
        })?;
        drop(file);
        drop(stream);
        tracing::debug!(bytes = written, dir = %tmp.path().display(), "context stream written as Enginefile");

        let options = PackOptions::default();
        let packed = self.packer.pack(tmp.path(), &options)?;
        Ok(ResolvedContext::Archive(ArchiveContext {
            stream: packed.with_cleanup(move || tmp.close()),
            specfile: PathBuf::from(DEFAULT_ENGINEFILE_NAME),
        }))
    }
}

/// Resolve a local context directory. An explicit Enginefile path is
/// relative to the working directory, not to the context.
pub fn from_local_dir(dir: &Path, specfile: Option<&Path>) -> Result<BuildContext, ContextError> {
    let specfile = specfile
        .map(|f| {
            std::path::absolute(f).map_err(|e| ContextError::AbsolutePath {
                path: f.to_path_buf(),
                source: e,
            })
        })
        .transpose()?;

    let (dir, relative_specfile) = specfile_rel_path(dir, specfile.as_deref())?;
    Ok(BuildContext {
        dir,
        relative_specfile,
        checkout: None,
    })
}

/// Returns the absolute context directory and the Enginefile's path
/// relative to it.
fn specfile_rel_path(
    given_dir: &Path,
    given_specfile: Option<&Path>,
) -> Result<(PathBuf, PathBuf), ContextError> {
    let mut abs_dir = std::path::absolute(given_dir).map_err(|e| ContextError::AbsolutePath {
        path: given_dir.to_path_buf(),
        source: e,
    })?;

    if !is_unc(&abs_dir) {
        abs_dir = abs_dir
            .canonicalize()
            .map_err(|e| ContextError::EvalSymlinks {
                path: abs_dir.clone(),
                source: e,
            })?;
    }

    let meta = std::fs::symlink_metadata(&abs_dir).map_err(|e| ContextError::Stat {
        path: abs_dir.clone(),
        source: e,
    })?;
    if !meta.is_dir() {
        return Err(ContextError::NotADirectory(abs_dir));
    }

    let mut abs_specfile = match given_specfile {
        Some(specfile) => specfile.to_path_buf(),
        None => default_specfile(&abs_dir),
    };
    if !abs_specfile.is_absolute() {
        abs_specfile = abs_dir.join(abs_specfile);
    }

    if !is_unc(&abs_specfile) {
        abs_specfile = abs_specfile.canonicalize().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ContextError::SpecFileNotFound(abs_specfile.clone())
            } else {
                ContextError::EvalSymlinks {
                    path: abs_specfile.clone(),
                    source: e,
                }
            }
        })?;
    }

    if let Err(e) = std::fs::symlink_metadata(&abs_specfile) {
        return Err(if e.kind() == io::ErrorKind::NotFound {
            ContextError::SpecFileNotFound(abs_specfile)
        } else {
            ContextError::Stat {
                path: abs_specfile,
                source: e,
            }
        });
    }

    let relative = relative_path(&abs_dir, &abs_specfile);
    if matches!(relative.components().next(), Some(Component::ParentDir)) {
        return Err(ContextError::SpecFileOutsideContext {
            specfile: match given_specfile {
                Some(path) => path.to_path_buf(),
                None => abs_specfile,
            },
            context: given_dir.to_path_buf(),
        });
    }

    tracing::debug!(
        dir = %abs_dir.display(),
        specfile = %relative.display(),
        "context directory resolved"
    );
    Ok((abs_dir, relative))
}

/// `<dir>/Enginefile`, or `<dir>/enginefile` if only the lowercase one exists.
fn default_specfile(dir: &Path) -> PathBuf {
    let default = dir.join(DEFAULT_ENGINEFILE_NAME);
    if let Err(e) = std::fs::symlink_metadata(&default)
        && e.kind() == io::ErrorKind::NotFound
    {
        let lowercase = dir.join(DEFAULT_ENGINEFILE_NAME.to_lowercase());
        // arch-lint: allow(no-silent-result-drop) reason="a missing fallback keeps the default name, which fails later with a clear error"
        if std::fs::symlink_metadata(&lowercase).is_ok() {
            return lowercase;
        }
    }
    default
}

/// Lexical path from `base` to `target`; both must be absolute.
fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component<'_>> = base.components().collect();
    let target: Vec<Component<'_>> = target.components().collect();
    let common = base
        .iter()
        .zip(&target)
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &target[common..] {
        relative.push(component.as_os_str());
    }
    relative
}

/// UNC paths (`\\server\share`) cannot have their links resolved on Windows.
fn is_unc(path: &Path) -> bool {
    cfg!(windows) && path.to_string_lossy().starts_with(r"\\")
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("unable to prepare context: path {0:?} not found")]
    PathNotFound(String),

    #[error("unable to get absolute path of {path}")]
    AbsolutePath { path: PathBuf, source: io::Error },

    #[error("unable to evaluate symlinks in {path}")]
    EvalSymlinks { path: PathBuf, source: io::Error },

    #[error("unable to stat {path}")]
    Stat { path: PathBuf, source: io::Error },

    #[error("context must be a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("cannot locate Enginefile: {0}")]
    SpecFileNotFound(PathBuf),

    #[error("the Enginefile ({specfile}) must be within the build context ({context})")]
    SpecFileOutsideContext { specfile: PathBuf, context: PathBuf },

    #[error("failed to peek context header")]
    Peek { source: io::Error },

    #[error("unable to create temporary context directory")]
    TempDir { source: io::Error },

    #[error("failed to write {path}")]
    WriteSpecFile { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("failed to package context")]
    Archive(#[from] crate::archive::ArchiveError),
}
