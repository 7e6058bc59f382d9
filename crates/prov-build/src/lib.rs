//! Build context resolution, validation, and packaging for prov.
//!
//! # Context pipeline
//!
//! ```text
//! prov engine build <PATH|URL|->
//!   1. Classify   ── ContextSource::from_arg()
//!   2. Resolve    ── ContextResolver::resolve()
//!                    local dir │ git clone │ download │ stdin
//!                    └─▶ BuildContext (dir + Enginefile) or ArchiveContext
//!   3. Ignore     ── .provignore → ordered exclusion patterns
//!   4. Protect    ── re-include Enginefile and .provignore if excluded
//!   5. Validate   ── every non-excluded file must be readable
//!   6. Pack       ── TarPacker → ArchiveStream (tar, optionally gzip)
//! ```
//!
//! # Exclusion
//!
//! Validation and packing share one matcher ([`pattern::PatternMatcher`])
//! and one traversal ([`walk::walk_context`]):
//! - `*`, `?`, `**` and `[...]` globs over `/`-separated relative paths
//! - a pattern matching a parent directory excludes everything beneath it
//! - `!pattern` re-includes; the last matching pattern wins
//!
//! # Cleanup
//!
//! Temporary directories (inline Enginefiles, git checkouts) are owned by
//! the [`ArchiveStream`] built from them and removed exactly once when that
//! stream is closed or dropped.

pub mod archive;
pub mod context;
pub mod git;
pub mod ignore;
pub mod pattern;
pub mod prepare;
pub mod remote;
pub mod validate;
pub mod walk;

pub use archive::{
    ArchiveError, ArchivePacker, ArchiveStream, Compression, PackOptions, SharedArchive, TarPacker,
    is_archive,
};
pub use context::{
    ArchiveContext, BuildContext, ContextError, ContextResolver, ContextSource, ResolveOptions,
    ResolvedContext, from_local_dir,
};
pub use git::{ClonedRepo, GitCli, GitCloner, GitError};
pub use ignore::IgnoreError;
pub use pattern::{PatternError, PatternMatcher};
pub use prepare::{PrepareError, PreparedContext, prepare_context};
pub use remote::{Download, DownloadError, Downloader, HttpDownloader};
pub use validate::{ValidationError, validate_context};
