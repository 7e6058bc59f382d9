//! Byte-count progress for streamed transfers.
//!
//! A [`ProgressReader`] sits between a producer and whoever pulls from it
//! (the upload transport, or the stdin/remote context sniffer) and reports
//! [`ProgressEvent`]s to a [`ProgressSink`]. The sink decides what is shown:
//! [`BarProgress`] draws a live byte counter on a terminal, [`TextProgress`]
//! writes one line per event, and [`LastOnly`] drops all but the final one
//! so quiet mode keeps a single summary line.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};

const EMIT_EVERY_BYTES: u64 = 512 * 1024;
const EMIT_EVERY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// What is being transferred, e.g. "Sending build context to server"
    pub action: String,
    pub bytes_transferred: u64,
    /// Known total, if the producer advertised one
    pub total_bytes: Option<u64>,
    /// Set on exactly one event: the last one a reader emits
    pub is_final: bool,
}

impl ProgressEvent {
    /// Human-readable one-line rendering.
    pub fn render(&self) -> String {
        match self.total_bytes {
            Some(total) => format!(
                "{action}  {done}/{total}",
                action = self.action,
                done = HumanBytes(self.bytes_transferred),
                total = HumanBytes(total),
            ),
            None => format!(
                "{action}  {done}",
                action = self.action,
                done = HumanBytes(self.bytes_transferred),
            ),
        }
    }
}

/// Receiver of progress events.
pub trait ProgressSink: Send {
    fn emit(&mut self, event: &ProgressEvent);
}

impl<S: ProgressSink + ?Sized> ProgressSink for Box<S> {
    fn emit(&mut self, event: &ProgressEvent) {
        (**self).emit(event);
    }
}

/// Wraps a reader and reports how many bytes have been pulled through it.
pub struct ProgressReader<R, S: ProgressSink> {
    inner: R,
    sink: S,
    action: String,
    total: Option<u64>,
    transferred: u64,
    last_bytes: u64,
    last_at: Instant,
    finished: bool,
}

impl<R: Read, S: ProgressSink> ProgressReader<R, S> {
    pub fn new(inner: R, sink: S, total: Option<u64>, action: impl Into<String>) -> Self {
        Self {
            inner,
            sink,
            action: action.into(),
            total,
            transferred: 0,
            last_bytes: 0,
            last_at: Instant::now(),
            finished: false,
        }
    }

    /// Bytes read so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    fn emit(&mut self, is_final: bool) {
        let event = ProgressEvent {
            action: self.action.clone(),
            bytes_transferred: self.transferred,
            total_bytes: self.total,
            is_final,
        };
        self.sink.emit(&event);
        self.last_bytes = self.transferred;
        self.last_at = Instant::now();
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.emit(true);
        }
    }
}

impl<R: Read, S: ProgressSink> Read for ProgressReader<R, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            if !buf.is_empty() {
                self.finish();
            }
            return Ok(0);
        }

        self.transferred += n as u64;
        if self.transferred - self.last_bytes >= EMIT_EVERY_BYTES
            || self.last_at.elapsed() >= EMIT_EVERY
        {
            self.emit(false);
        }
        Ok(n)
    }
}

impl<R, S: ProgressSink> Drop for ProgressReader<R, S> {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            let event = ProgressEvent {
                action: self.action.clone(),
                bytes_transferred: self.transferred,
                total_bytes: self.total,
                is_final: true,
            };
            self.sink.emit(&event);
        }
    }
}

const COUNT_TEMPLATE: &str = "{msg}  {bytes}";
const TOTAL_TEMPLATE: &str = "{msg}  {bytes}/{total_bytes}";

/// Live byte counter on an indicatif draw target.
///
/// The bar is sized from the first event; the final event finishes it and
/// leaves the last rendering in place.
pub struct BarProgress {
    bar: ProgressBar,
    started: bool,
}

impl BarProgress {
    pub fn new(target: ProgressDrawTarget) -> Self {
        Self {
            bar: ProgressBar::with_draw_target(None, target),
            started: false,
        }
    }

    /// Counter drawn on stdout; hidden when stdout is not a terminal.
    pub fn stdout() -> Self {
        Self::new(ProgressDrawTarget::stdout())
    }

    fn start(&mut self, event: &ProgressEvent) {
        let template = match event.total_bytes {
            Some(total) => {
                self.bar.set_length(total);
                TOTAL_TEMPLATE
            }
            None => COUNT_TEMPLATE,
        };
        let style = match ProgressStyle::with_template(template) {
            Ok(style) => style,
            Err(e) => {
                tracing::debug!(error = %e, "invalid progress template");
                ProgressStyle::default_spinner()
            }
        };
        self.bar.set_style(style);
        self.bar.set_message(event.action.clone());
        self.started = true;
    }
}

impl ProgressSink for BarProgress {
    fn emit(&mut self, event: &ProgressEvent) {
        if !self.started {
            self.start(event);
        }
        self.bar.set_position(event.bytes_transferred);
        if event.is_final {
            self.bar.finish();
        }
    }
}

/// Writes every event as its own text line.
pub struct TextProgress<W> {
    out: W,
}

impl<W: Write + Send> TextProgress<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> ProgressSink for TextProgress<W> {
    fn emit(&mut self, event: &ProgressEvent) {
        let result = writeln!(self.out, "{}", event.render()).and_then(|()| self.out.flush());
        // arch-lint: allow(no-error-swallowing) reason="a closed progress stream must not abort the transfer it reports on"
        if let Err(e) = result {
            tracing::debug!(error = %e, "failed to write progress");
        }
    }
}

/// Forwards only the final event.
pub struct LastOnly<S>(pub S);

impl<S: ProgressSink> ProgressSink for LastOnly<S> {
    fn emit(&mut self, event: &ProgressEvent) {
        if event.is_final {
            self.0.emit(event);
        }
    }
}

/// Cloneable in-memory writer.
///
/// Quiet mode points progress and server output at one of these and
/// decides after the request which stream, if any, receives the contents.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("output buffer lock poisoned, keeping partial contents");
                poisoned.into_inner()
            }
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
