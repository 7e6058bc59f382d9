//! Streaming tar packaging of a context directory.
//!
//! ```text
//! producer thread                         consumer (upload body)
//! walk_context ─▶ tar::Builder ─▶ [gzip] ─▶ ChunkWriter ═╗
//!                                                        ║ sync_channel(CHANNEL_DEPTH)
//!                                  ArchiveStream ◀─ ChunkReader ◀═╝
//! ```
//!
//! The bounded channel is the backpressure: the encoder only runs ahead of
//! the consumer by a few chunks, and dropping the reader stops it.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvError, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use flate2::Compression as GzLevel;
use flate2::write::GzEncoder;

use crate::pattern::{PatternError, PatternMatcher};
use crate::walk::walk_context;

/// Size of one tar header block, and of the peeked stream prefix.
pub const HEADER_SIZE: usize = 512;

const CHUNK_SIZE: usize = 32 * 1024;
const CHANNEL_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

#[derive(Debug, Clone)]
pub struct PackOptions {
    pub compression: Compression,
    /// Exclusion patterns, in `.provignore` order
    pub excludes: Vec<String>,
    /// Paths (relative to the root) to include; `.` is the whole tree
    pub includes: Vec<String>,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            excludes: Vec::new(),
            includes: vec![".".to_owned()],
        }
    }
}

/// Turns a directory into a read-once archive stream.
pub trait ArchivePacker {
    fn pack(&self, root: &Path, options: &PackOptions) -> Result<ArchiveStream, ArchiveError>;
}

type Cleanup = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// A read-once archive with an attached cleanup action.
///
/// The cleanup runs exactly once: on [`close`](Self::close) or, failing
/// that, when the stream is dropped. The underlying reader is released
/// first so nothing is still reading from a directory being removed.
pub struct ArchiveStream {
    reader: Option<Box<dyn Read + Send>>,
    cleanup: Option<Cleanup>,
}

impl ArchiveStream {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Some(Box::new(reader)),
            cleanup: None,
        }
    }

    /// Attach a cleanup action. An existing one runs first.
    pub fn with_cleanup(mut self, cleanup: impl FnOnce() -> io::Result<()> + Send + 'static) -> Self {
        self.cleanup = Some(match self.cleanup.take() {
            None => Box::new(cleanup),
            Some(previous) => Box::new(move || {
                let first = previous();
                let second = cleanup();
                first.and(second)
            }),
        });
        self
    }

    /// Release the reader and run the cleanup action.
    pub fn close(mut self) -> io::Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        drop(self.reader.take());
        match self.cleanup.take() {
            Some(cleanup) => cleanup(),
            None => Ok(()),
        }
    }
}

impl Read for ArchiveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for ArchiveStream {
    fn drop(&mut self) {
        // arch-lint: allow(no-error-swallowing) reason="drop cannot return errors; callers that care use close()"
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "archive cleanup failed");
        }
    }
}

impl std::fmt::Debug for ArchiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStream")
            .field("open", &self.reader.is_some())
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// An [`ArchiveStream`] readable from one place and closable from another.
///
/// Transports may hold on to a request body after the response arrives;
/// the caller keeps a clone and closes the stream deterministically once
/// the request is over. Reads after close return end-of-stream.
#[derive(Debug, Clone)]
pub struct SharedArchive(Arc<Mutex<Option<ArchiveStream>>>);

impl SharedArchive {
    pub fn new(stream: ArchiveStream) -> Self {
        Self(Arc::new(Mutex::new(Some(stream))))
    }

    fn lock(&self) -> MutexGuard<'_, Option<ArchiveStream>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("archive lock poisoned, recovering the stream");
                poisoned.into_inner()
            }
        }
    }

    /// Close the stream if no clone has closed it yet.
    pub fn close(&self) -> io::Result<()> {
        let stream = self.lock().take();
        match stream {
            Some(stream) => stream.close(),
            None => Ok(()),
        }
    }
}

impl Read for SharedArchive {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.lock().as_mut() {
            Some(stream) => stream.read(buf),
            None => Ok(0),
        }
    }
}

/// Whether `header` starts a tar archive, compressed or not.
pub fn is_archive(header: &[u8]) -> bool {
    const SIGNATURES: &[&[u8]] = &[
        &[0x1F, 0x8B, 0x08],                   // gzip
        b"BZh",                                // bzip2
        &[0xFD, b'7', b'z', b'X', b'Z', 0x00], // xz
        &[0x28, 0xB5, 0x2F, 0xFD],             // zstd
    ];
    if SIGNATURES.iter().any(|magic| header.starts_with(magic)) {
        return true;
    }
    is_tar_header(header)
}

fn is_tar_header(header: &[u8]) -> bool {
    if header.len() < HEADER_SIZE {
        return false;
    }
    let block = &header[..HEADER_SIZE];
    if block.iter().all(|&b| b == 0) {
        return false;
    }
    let Ok(stored) = tar::Header::from_byte_slice(block).cksum() else {
        return false;
    };
    let computed: u32 = block
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { u32::from(b' ') } else { u32::from(b) })
        .sum();
    stored == computed
}

/// [`ArchivePacker`] backed by the `tar` and `flate2` crates.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarPacker;

impl ArchivePacker for TarPacker {
    fn pack(&self, root: &Path, options: &PackOptions) -> Result<ArchiveStream, ArchiveError> {
        if !root.is_dir() {
            return Err(ArchiveError::NotADirectory(root.to_path_buf()));
        }
        let matcher = PatternMatcher::new(&options.excludes)?;
        let root = root.to_path_buf();
        let includes = options.includes.clone();
        let compression = options.compression;

        tracing::debug!(
            root = %root.display(),
            compression = ?compression,
            excludes = options.excludes.len(),
            "packing context"
        );

        let (tx, rx) = sync_channel(CHANNEL_DEPTH);
        let handle = std::thread::Builder::new()
            .name("prov-archive".to_owned())
            .spawn(move || {
                let writer = ChunkWriter::new(tx.clone());
                if let Err(e) = write_archive(writer, &root, &includes, &matcher, compression) {
                    if tx.send(Err(e)).is_err() {
                        tracing::debug!("archive reader closed before the error was delivered");
                    }
                }
            })
            .map_err(|e| ArchiveError::Spawn { source: e })?;

        Ok(ArchiveStream::new(ChunkReader {
            rx: Some(rx),
            chunk: Vec::new(),
            pos: 0,
            producer: Some(handle),
        }))
    }
}

fn write_archive(
    writer: ChunkWriter,
    root: &Path,
    includes: &[String],
    matcher: &PatternMatcher,
    compression: Compression,
) -> io::Result<()> {
    match compression {
        Compression::None => {
            let mut builder = tar::Builder::new(writer);
            append_tree(&mut builder, root, includes, matcher)?;
            builder.into_inner()?.flush()
        }
        Compression::Gzip => {
            let mut builder = tar::Builder::new(GzEncoder::new(writer, GzLevel::default()));
            append_tree(&mut builder, root, includes, matcher)?;
            builder.into_inner()?.finish()?.flush()
        }
    }
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    includes: &[String],
    matcher: &PatternMatcher,
) -> io::Result<()> {
    builder.follow_symlinks(false);

    for include in includes {
        let start = if include == "." {
            root.to_path_buf()
        } else {
            root.join(include)
        };
        walk_context::<io::Error, _>(root, &start, matcher, |entry| {
            if entry.is_special() {
                tracing::debug!(path = %entry.relative, "skipping special file");
                return Ok(());
            }
            match builder.append_path_with_name(entry.path, entry.relative) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(path = %entry.relative, "file removed while packing");
                    Ok(())
                }
                other => other,
            }
        })?;
    }
    Ok(())
}

/// Buffers encoder output into chunks sent over the channel.
struct ChunkWriter {
    tx: SyncSender<io::Result<Vec<u8>>>,
    buf: Vec<u8>,
}

impl ChunkWriter {
    fn new(tx: SyncSender<io::Result<Vec<u8>>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn send(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.tx
            .send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive reader closed"))
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = CHUNK_SIZE - self.buf.len();
        let n = data.len().min(room);
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= CHUNK_SIZE {
            self.send()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send()
    }
}

/// Consumer end of the producer channel.
struct ChunkReader {
    rx: Option<Receiver<io::Result<Vec<u8>>>>,
    chunk: Vec<u8>,
    pos: usize,
    producer: Option<JoinHandle<()>>,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.chunk.len() {
                let n = buf.len().min(self.chunk.len() - self.pos);
                buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            let Some(rx) = self.rx.as_ref() else {
                return Ok(0);
            };
            match rx.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => {
                    self.rx = None;
                    return Err(e);
                }
                // producer finished and hung up
                Err(RecvError) => {
                    self.rx = None;
                    return Ok(0);
                }
            }
        }
    }
}

impl Drop for ChunkReader {
    fn drop(&mut self) {
        drop(self.rx.take());
        if let Some(handle) = self.producer.take()
            && handle.join().is_err()
        {
            tracing::warn!("archive producer thread panicked");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("cannot archive {0}: not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to start archive producer")]
    Spawn { source: io::Error },
    #[error(transparent)]
    Pattern(#[from] PatternError),
}
