use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// Clones a git repository into a fresh local directory.
pub trait GitCloner {
    fn clone_repo(&self, url: &str) -> Result<ClonedRepo, GitError>;
}

/// A checkout in a temporary directory, removed when dropped or closed.
#[derive(Debug)]
pub struct ClonedRepo {
    checkout: TempDir,
    context_dir: PathBuf,
}

impl ClonedRepo {
    /// Wrap a checkout whose build context is the checkout root itself.
    pub fn new(checkout: TempDir) -> Self {
        let context_dir = checkout.path().to_path_buf();
        Self {
            checkout,
            context_dir,
        }
    }

    /// Directory to use as the build context (the checkout root or a
    /// sub-directory selected by the URL fragment).
    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    /// Remove the checkout.
    pub fn close(self) -> std::io::Result<()> {
        self.checkout.close()
    }
}

/// Whether `s` looks like a git repository reference.
pub fn is_git_url(s: &str) -> bool {
    let without_fragment = match s.split_once('#') {
        Some((url, _)) => url,
        None => s,
    };
    (crate::remote::is_url(s) && without_fragment.ends_with(".git"))
        || ["git://", "git@", "github.com/"]
            .iter()
            .any(|prefix| s.starts_with(prefix))
}

/// A git URL split into remote, ref and context sub-directory.
///
/// `https://host/repo.git#v1.2:engines/api` checks out `v1.2` and uses
/// `engines/api` as the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRef {
    pub remote: String,
    pub reference: Option<String>,
    pub subdir: Option<String>,
}

impl GitRef {
    pub fn parse(url: &str) -> Self {
        let url = if url.starts_with("github.com/") {
            format!("https://{url}")
        } else {
            url.to_owned()
        };

        let (remote, fragment) = match url.split_once('#') {
            Some((remote, fragment)) => (remote.to_owned(), fragment),
            None => (url.clone(), ""),
        };
        let (reference, subdir) = match fragment.split_once(':') {
            Some((reference, subdir)) => (reference, subdir),
            None => (fragment, ""),
        };

        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_owned());
        Self {
            remote,
            reference: non_empty(reference),
            subdir: non_empty(subdir),
        }
    }
}

/// [`GitCloner`] that shells out to the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::with_program("git")
    }

    /// Use a specific git executable.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn ensure_installed(&self) -> Result<(), GitError> {
        match Command::new(&self.program).arg("--version").output() {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GitError::NotInstalled { source: e })
            }
            Err(e) => Err(GitError::Command {
                detail: format!("failed to execute {} --version", self.program),
                source: e,
            }),
        }
    }

    fn git(&self, args: &[&str], dir: Option<&Path>) -> Result<(), GitError> {
        let mut command = Command::new(&self.program);
        command.args(args);
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        tracing::debug!(args = ?args, "running git");

        let output = command.output().map_err(|e| GitError::Command {
            detail: format!("failed to execute git {}", args.join(" ")),
            source: e,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::Failed {
                detail: format!(
                    "git {} exited with {}: {}",
                    args.join(" "),
                    output.status,
                    stderr.trim()
                ),
            });
        }
        Ok(())
    }

    /// Check out `reference` into an empty `root`.
    ///
    /// Fetching the ref by name reaches refs a clone never copies, such as
    /// `refs/pull/<n>/head`, and commits no branch points at any more.
    fn fetch_ref(&self, root: &Path, remote: &str, reference: &str) -> Result<(), GitError> {
        self.git(&["init", "-q"], Some(root))?;
        self.git(&["remote", "add", "origin", remote], Some(root))?;
        match self.git(&["fetch", "-q", "--depth", "1", "origin", reference], Some(root)) {
            Ok(()) => {}
            Err(e) => {
                tracing::debug!(error = %e, "shallow fetch refused, fetching full history");
                self.git(&["fetch", "-q", "origin", reference], Some(root))?;
            }
        }
        self.git(&["checkout", "-q", "FETCH_HEAD"], Some(root))?;
        self.git(
            &["submodule", "update", "-q", "--init", "--recursive", "--depth", "1"],
            Some(root),
        )
    }
}

impl GitCloner for GitCli {
    fn clone_repo(&self, url: &str) -> Result<ClonedRepo, GitError> {
        self.ensure_installed()?;
        let git_ref = GitRef::parse(url);

        let checkout = tempfile::Builder::new()
            .prefix("prov-build-git-")
            .tempdir()
            .map_err(|e| GitError::TempDir { source: e })?;
        let root = checkout.path();
        let root_str = root.to_string_lossy();

        match &git_ref.reference {
            None => self.git(
                &[
                    "clone",
                    "-q",
                    "--recursive",
                    "--depth",
                    "1",
                    "--shallow-submodules",
                    git_ref.remote.as_str(),
                    &*root_str,
                ],
                None,
            )?,
            Some(reference) => self.fetch_ref(root, &git_ref.remote, reference)?,
        }

        let context_dir = match &git_ref.subdir {
            None => root.to_path_buf(),
            Some(subdir) => resolve_subdir(root, subdir)?,
        };

        tracing::info!(
            remote = %git_ref.remote,
            reference = ?git_ref.reference,
            context = %context_dir.display(),
            "git repository cloned"
        );
        Ok(ClonedRepo {
            checkout,
            context_dir,
        })
    }
}

/// Resolve `subdir` inside `root`, refusing anything that escapes it.
fn resolve_subdir(root: &Path, subdir: &str) -> Result<PathBuf, GitError> {
    let root = root
        .canonicalize()
        .map_err(|e| GitError::SubdirNotFound {
            path: root.to_path_buf(),
            source: e,
        })?;
    let candidate = root.join(subdir);
    let resolved = candidate
        .canonicalize()
        .map_err(|e| GitError::SubdirNotFound {
            path: candidate.clone(),
            source: e,
        })?;

    if !resolved.starts_with(&root) {
        return Err(GitError::SubdirOutside {
            subdir: subdir.to_owned(),
        });
    }
    if !resolved.is_dir() {
        return Err(GitError::SubdirNotDirectory(resolved));
    }
    Ok(resolved)
}

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("unable to find 'git'")]
    NotInstalled { source: std::io::Error },
    #[error("unable to create temporary directory for git checkout")]
    TempDir { source: std::io::Error },
    #[error("git command failed: {detail}")]
    Command {
        detail: String,
        source: std::io::Error,
    },
    #[error("git failed: {detail}")]
    Failed { detail: String },
    #[error("error setting git context, path {path} not found")]
    SubdirNotFound {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("error setting git context, {subdir} is outside the repository")]
    SubdirOutside { subdir: String },
    #[error("error setting git context, not a directory: {0}")]
    SubdirNotDirectory(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_git_urls() {
        assert!(is_git_url("https://example.com/repo.git"));
        assert!(is_git_url("https://example.com/repo.git#main:sub"));
        assert!(is_git_url("git://example.com/repo"));
        assert!(is_git_url("git@github.com:org/repo.git"));
        assert!(is_git_url("github.com/org/repo"));
        assert!(!is_git_url("https://example.com/context.tar.gz"));
        assert!(!is_git_url("./local/dir"));
    }

    #[test]
    fn parses_fragment_into_ref_and_subdir() {
        let parsed = GitRef::parse("https://example.com/repo.git#v1.2:engines/api");
        assert_eq!(parsed.remote, "https://example.com/repo.git");
        assert_eq!(parsed.reference.as_deref(), Some("v1.2"));
        assert_eq!(parsed.subdir.as_deref(), Some("engines/api"));

        let parsed = GitRef::parse("https://example.com/repo.git#:docs");
        assert_eq!(parsed.reference, None);
        assert_eq!(parsed.subdir.as_deref(), Some("docs"));
    }

    #[test]
    fn github_shorthand_gets_https() {
        let parsed = GitRef::parse("github.com/org/repo");
        assert_eq!(parsed.remote, "https://github.com/org/repo");
        assert_eq!(parsed.reference, None);
    }

    #[test]
    fn missing_git_binary_is_distinct() {
        let git = GitCli::with_program("prov-definitely-not-git");
        let err = git.clone_repo("https://example.com/repo.git").unwrap_err();
        assert!(matches!(err, GitError::NotInstalled { .. }), "got: {err}");
    }

    fn has_git() -> bool {
        Command::new("git").arg("--version").output().is_ok()
    }

    fn run_git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(["-c", "user.name=prov", "-c", "user.email=prov@example.com"])
            .args(["-c", "commit.gpgsign=false"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// Upstream whose only route to `feature.txt` is `refs/pull/1/head`.
    fn upstream_with_pull_ref() -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path();
        run_git(dir, &["init", "-q"]);
        std::fs::write(dir.join("Enginefile"), "FROM scratch\n").unwrap();
        run_git(dir, &["add", "."]);
        run_git(dir, &["commit", "-q", "-m", "base"]);

        run_git(dir, &["checkout", "-q", "-b", "feature"]);
        std::fs::create_dir(dir.join("engines")).unwrap();
        std::fs::write(dir.join("engines/feature.txt"), "pr\n").unwrap();
        run_git(dir, &["add", "."]);
        run_git(dir, &["commit", "-q", "-m", "feature"]);
        run_git(dir, &["update-ref", "refs/pull/1/head", "HEAD"]);
        run_git(dir, &["checkout", "-q", "-"]);
        run_git(dir, &["branch", "-q", "-D", "feature"]);

        std::fs::write(dir.join("README"), "second\n").unwrap();
        run_git(dir, &["add", "."]);
        run_git(dir, &["commit", "-q", "-m", "second"]);
        tmp
    }

    fn file_url(dir: &Path) -> String {
        format!("file://{}", dir.display())
    }

    #[test]
    fn clone_without_ref_is_shallow() {
        if !has_git() {
            return;
        }
        let upstream = upstream_with_pull_ref();
        let cloned = GitCli::new().clone_repo(&file_url(upstream.path())).unwrap();

        let dir = cloned.context_dir();
        assert!(dir.join("Enginefile").is_file());
        assert!(!dir.join("engines").exists());
        assert!(dir.join(".git/shallow").is_file());
    }

    #[test]
    fn pull_request_ref_is_fetched_after_branch_deletion() {
        if !has_git() {
            return;
        }
        let upstream = upstream_with_pull_ref();
        let url = format!("{}#refs/pull/1/head", file_url(upstream.path()));
        let cloned = GitCli::new().clone_repo(&url).unwrap();

        let dir = cloned.context_dir();
        assert!(dir.join("Enginefile").is_file());
        assert_eq!(
            std::fs::read_to_string(dir.join("engines/feature.txt")).unwrap(),
            "pr\n"
        );
    }

    #[test]
    fn ref_and_subdir_together() {
        if !has_git() {
            return;
        }
        let upstream = upstream_with_pull_ref();
        let url = format!("{}#refs/pull/1/head:engines", file_url(upstream.path()));
        let cloned = GitCli::new().clone_repo(&url).unwrap();

        assert!(cloned.context_dir().ends_with("engines"));
        assert!(cloned.context_dir().join("feature.txt").is_file());
        cloned.close().unwrap();
    }

    #[test]
    fn unknown_ref_fails() {
        if !has_git() {
            return;
        }
        let upstream = upstream_with_pull_ref();
        let url = format!("{}#refs/pull/2/head", file_url(upstream.path()));
        let err = GitCli::new().clone_repo(&url).unwrap_err();
        assert!(matches!(err, GitError::Failed { .. }), "got: {err}");
    }

    #[test]
    fn subdir_escape_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("inner")).unwrap();
        let root = tmp.path().join("inner");
        let err = resolve_subdir(&root, "..").unwrap_err();
        assert!(matches!(err, GitError::SubdirOutside { .. }));
    }
}
