use std::io::{IsTerminal, Write};
use std::path::PathBuf;

use anyhow::Context;
use prov_build::{
    Compression, ContextResolver, ContextSource, GitCli, HttpDownloader, PrepareError,
    ResolveOptions, SharedArchive, TarPacker,
};
use prov_client::{ClientError, EngineClient, display_messages};
use prov_core::{
    BarProgress, ClientConfig, LastOnly, ProgressSink, SharedBuffer, TextProgress,
};

use super::StatusError;

pub struct BuildArgs {
    pub file: Option<PathBuf>,
    pub quiet: bool,
    pub compress: bool,
    pub context: String,
}

/// Where progress and server output go.
///
/// Quiet mode buffers both; the caller decides afterwards which stream, if
/// any, receives them.
struct Output {
    quiet: bool,
    terminal: bool,
    progress: SharedBuffer,
    build: SharedBuffer,
}

impl Output {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            terminal: std::io::stdout().is_terminal(),
            progress: SharedBuffer::new(),
            build: SharedBuffer::new(),
        }
    }

    fn progress_sink(&self) -> Box<dyn ProgressSink> {
        if self.quiet {
            Box::new(LastOnly(TextProgress::new(self.progress.clone())))
        } else if self.terminal {
            Box::new(BarProgress::stdout())
        } else {
            Box::new(TextProgress::new(std::io::stdout()))
        }
    }

    fn build_writer(&self) -> Box<dyn Write> {
        if self.quiet {
            Box::new(self.build.clone())
        } else {
            Box::new(std::io::stdout())
        }
    }

    /// Buffered text for stderr after a failure: progress, then `with_build`
    /// server output.
    fn flush_to_stderr(&self, with_build: bool) -> anyhow::Result<()> {
        if !self.quiet {
            return Ok(());
        }
        let mut stderr = std::io::stderr().lock();
        stderr.write_all(&self.progress.contents())?;
        if with_build {
            stderr.write_all(&self.build.contents())?;
        }
        stderr.flush()?;
        Ok(())
    }
}

pub fn build(config: &ClientConfig, args: BuildArgs) -> anyhow::Result<()> {
    let output = Output::new(args.quiet);

    let source = ContextSource::from_arg(&args.context, || Box::new(std::io::stdin()))?;
    let remote = source.is_remote();

    let resolver = ContextResolver::new(GitCli::new(), HttpDownloader::new()?, TarPacker);
    let resolved = match resolver.resolve(
        source,
        ResolveOptions {
            specfile: args.file,
            progress: output.progress_sink(),
        },
    ) {
        Ok(resolved) => resolved,
        Err(e) => {
            if remote {
                output.flush_to_stderr(false)?;
            }
            return Err(anyhow::Error::new(e).context("unable to prepare context"));
        }
    };

    let compression = if args.compress {
        Compression::Gzip
    } else {
        Compression::None
    };
    let prepared = resolver
        .prepare(resolved, compression)
        .map_err(|e| match e {
            PrepareError::Validation(_) => anyhow::Error::new(e).context("error checking context"),
            other => other.into(),
        })?;

    let archive = SharedArchive::new(prepared.archive);
    let client = EngineClient::new(config.clone())?;

    let messages = match client.upload(
        archive.clone(),
        &prepared.relative_specfile,
        output.progress_sink(),
    ) {
        Ok(messages) => messages,
        Err(e) => {
            close_archive(&archive);
            output.flush_to_stderr(false)?;
            return Err(e.into());
        }
    };

    let mut out = output.build_writer();
    let result = display_messages(messages, &mut out, output.terminal && !output.quiet);
    drop(out);
    close_archive(&archive);

    match result {
        Ok(count) => {
            tracing::info!(messages = count, "build finished");
        }
        Err(ClientError::Server(server)) => {
            output.flush_to_stderr(true)?;
            return Err(StatusError {
                status: server.message.clone(),
                code: server.exit_code(),
            }
            .into());
        }
        Err(e) => {
            output.flush_to_stderr(true)?;
            return Err(e).context("failed to read build output");
        }
    }

    if output.quiet {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&output.build.contents())?;
        stdout.flush()?;
    }
    Ok(())
}

/// Release the archive and whatever temporary directories back it.
fn close_archive(archive: &SharedArchive) {
    match archive.close() {
        Ok(()) => tracing::debug!("build context released"),
        // arch-lint: allow(no-error-swallowing) reason="the build result is already decided; a leftover temp dir only warrants a warning"
        Err(e) => tracing::warn!(error = %e, "failed to clean up build context"),
    }
}
