//! Host log capture.
//!
//! Everything the harness logs through `tracing` is written to stderr and,
//! without ANSI styling, into the open [`HostLog`] captures. Each
//! invocation opens a capture when it starts, runs inside its
//! [`scope`](HostLog::scope), and closes the capture to report its
//! consolidated `host_log`.
//!
//! Lines logged from inside a scope only reach that scope's capture, so
//! concurrent shards do not see each other's output. Lines logged outside
//! any scope reach every open capture. With no capture open, nothing is
//! retained.

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

tokio::task_local! {
    static ACTIVE_CAPTURE: CaptureId;
}

/// Identifies one open capture of a [`HostLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureId(u64);

#[derive(Default)]
struct Captures {
    next_id: u64,
    open: Vec<(CaptureId, Vec<u8>)>,
}

impl Captures {
    fn append(&mut self, target: Option<CaptureId>, bytes: &[u8]) {
        if let Some(id) = target {
            if let Some((_, buffer)) = self.open.iter_mut().find(|(open, _)| *open == id) {
                buffer.extend_from_slice(bytes);
                return;
            }
        }
        for (_, buffer) in &mut self.open {
            buffer.extend_from_slice(bytes);
        }
    }
}

/// In-memory sink for host log output.
///
/// Clones share the same captures.
#[derive(Clone, Default)]
pub struct HostLog {
    captures: Arc<Mutex<Captures>>,
}

impl HostLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts collecting log output into a new capture.
    pub fn open_capture(&self) -> CaptureId {
        let mut captures = self.captures.lock().unwrap_or_else(PoisonError::into_inner);
        let id = CaptureId(captures.next_id);
        captures.next_id += 1;
        captures.open.push((id, Vec::new()));
        id
    }

    /// Stops `id` and returns everything it collected.
    ///
    /// Closing an unknown or already closed capture returns nothing.
    pub fn close_capture(&self, id: CaptureId) -> Vec<u8> {
        let mut captures = self.captures.lock().unwrap_or_else(PoisonError::into_inner);
        match captures.open.iter().position(|(open, _)| *open == id) {
            Some(index) => captures.open.remove(index).1,
            None => Vec::new(),
        }
    }

    /// Runs `future` with its log output routed to capture `id` only.
    pub async fn scope<F: Future>(&self, id: CaptureId, future: F) -> F::Output {
        ACTIVE_CAPTURE.scope(id, future).await
    }

    /// Number of captures still open.
    pub fn open_captures(&self) -> usize {
        self.captures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .len()
    }

    /// Appends a raw line, bypassing the subscriber.
    pub fn append_line(&self, line: &str) {
        let mut writer = self.make_writer();
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        writer.append(&bytes);
    }
}

/// Writer handed out by [`HostLog`] to the fmt layer.
pub struct HostLogWriter {
    captures: Arc<Mutex<Captures>>,
    target: Option<CaptureId>,
}

impl HostLogWriter {
    fn append(&mut self, bytes: &[u8]) {
        self.captures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(self.target, bytes);
    }
}

impl io::Write for HostLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for HostLog {
    type Writer = HostLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        HostLogWriter {
            captures: self.captures.clone(),
            target: ACTIVE_CAPTURE.try_with(|id| *id).ok(),
        }
    }
}

/// Installs the global subscriber: stderr plus the host log.
///
/// `RUST_LOG` overrides the default level.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(verbose: bool, host_log: &HostLog) -> anyhow::Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(host_log.clone()),
        )
        .try_init()?;
    Ok(())
}
