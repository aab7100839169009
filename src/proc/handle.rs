use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Error, Result};

/// Default for waits that were given no timeout.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

const READ_CHUNK: usize = 4096;

/// Identifies one of the two output streams of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    Stdout,
    Stderr,
}

impl StreamId {
    fn index(self) -> usize {
        match self {
            StreamId::Stdout => 0,
            StreamId::Stderr => 1,
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamId::Stdout => f.write_str("stdout"),
            StreamId::Stderr => f.write_str("stderr"),
        }
    }
}

/// Output collected by one [`CommandHandle::wait`] call.
///
/// `exit_code` is `None` while the process is still running. A process killed by a signal
/// reports the negated signal number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug)]
enum Chunk {
    Data(StreamId, String),
    End(StreamId),
}

/// Live processes of a connection, keyed by handle id, valued by the controller-side PID.
pub(super) type Registry = Arc<DashMap<u64, u32>>;

/// One spawned external process and its two output streams.
///
/// Both streams are drained by background tasks into a single queue as soon as the
/// process starts, so the process never blocks on a full pipe regardless of how often
/// [`CommandHandle::wait`] is called.
#[derive(Debug)]
pub struct CommandHandle {
    id: u64,
    cmd: String,
    host: Arc<str>,
    pid: Option<u32>,
    child: Child,
    rx: mpsc::UnboundedReceiver<Chunk>,
    pending: [String; 2],
    eof: [bool; 2],
    exit_code: Option<i32>,
    timeout: Duration,
    registry: Registry,
}

impl CommandHandle {
    pub(super) fn new(
        id: u64,
        cmd: String,
        host: Arc<str>,
        mut child: Child,
        by_line: bool,
        registry: Registry,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut eof = [true, true];
        if let Some(stdout) = child.stdout.take() {
            eof[StreamId::Stdout.index()] = false;
            tokio::spawn(drain_stream(stdout, StreamId::Stdout, by_line, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            eof[StreamId::Stderr.index()] = false;
            tokio::spawn(drain_stream(stderr, StreamId::Stderr, by_line, tx));
        }
        if let Some(pid) = child.id() {
            registry.insert(id, pid);
        }

        Self {
            id,
            pid: child.id(),
            cmd,
            host,
            child,
            rx,
            pending: [String::new(), String::new()],
            eof,
            exit_code: None,
            timeout: DEFAULT_WAIT_TIMEOUT,
            registry,
        }
    }

    /// The command line as given by the caller.
    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The PID of the process on the host it runs on, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Forgets the controller-side PID; used for remote commands run without a PID lookup.
    pub(super) fn clear_pid(&mut self) {
        self.pid = None;
    }

    /// The exit code, once the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the timeout used by [`CommandHandle::wait`] when called without one.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Reads the first line of stdout and parses it as the remote PID.
    ///
    /// The remote wrapper prints its shell PID before exec'ing the real command; anything
    /// after that line stays queued for the next [`CommandHandle::wait`].
    pub(super) async fn read_remote_pid(&mut self, timeout: Duration) -> Result<u32> {
        let deadline = Instant::now() + timeout;
        let idx = StreamId::Stdout.index();
        loop {
            if let Some(pos) = self.pending[idx].find('\n') {
                let line: String = self.pending[idx].drain(..=pos).collect();
                let pid = line.trim().parse::<u32>().map_err(|_| Error::Pid {
                    cmd: self.cmd.clone(),
                    host: self.host.to_string(),
                    reason: format!("expected a PID as the first output line, got `{}`", line.trim()),
                })?;
                self.pid = Some(pid);
                return Ok(pid);
            }
            if self.eof[idx] {
                let stderr = std::mem::take(&mut self.pending[StreamId::Stderr.index()]);
                return Err(Error::Pid {
                    cmd: self.cmd.clone(),
                    host: self.host.to_string(),
                    reason: format!("stdout closed before the PID was printed: {}", stderr.trim()),
                });
            }
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(chunk)) => self.accept(chunk, true),
                Ok(None) => self.eof = [true, true],
                Err(_) => {
                    return Err(Error::Pid {
                        cmd: self.cmd.clone(),
                        host: self.host.to_string(),
                        reason: format!("no PID printed within {timeout:?}"),
                    });
                }
            }
        }
    }

    fn accept(&mut self, chunk: Chunk, capture: bool) {
        match chunk {
            Chunk::Data(stream, text) => {
                if capture {
                    self.pending[stream.index()].push_str(&text);
                }
            }
            Chunk::End(stream) => self.eof[stream.index()] = true,
        }
    }

    /// Collects output for up to `timeout` (the handle's timeout when `None`) and reports
    /// the exit code if the process has finished by then.
    ///
    /// A zero timeout only drains what is already queued. The process is never killed here,
    /// and each call returns only output that no earlier call has returned. With
    /// `capture == false` output is still drained, but discarded.
    pub async fn wait(&mut self, timeout: Option<Duration>, capture: bool) -> CmdOutput {
        let timeout = timeout.unwrap_or(self.timeout);
        let deadline = Instant::now() + timeout;

        loop {
            if self.eof.iter().all(|eof| *eof) {
                if self.exit_code.is_none() {
                    match tokio::time::timeout_at(deadline, self.child.wait()).await {
                        Ok(Ok(status)) => {
                            self.exit_code = status.code().or_else(|| status.signal().map(|s| -s));
                            self.registry.remove(&self.id);
                            log::trace!(
                                "`{}` on {} exited with {:?}",
                                self.cmd,
                                self.host,
                                self.exit_code
                            );
                        }
                        Ok(Err(err)) => {
                            log::error!("failed to reap `{}` on {}: {}", self.cmd, self.host, err);
                        }
                        Err(_) => {}
                    }
                }
                break;
            }

            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(chunk)) => self.accept(chunk, capture),
                Ok(None) => self.eof = [true, true],
                Err(_) => break,
            }
        }

        let [stdout, stderr] = std::mem::take(&mut self.pending);
        if capture {
            CmdOutput {
                stdout,
                stderr,
                exit_code: self.exit_code,
            }
        } else {
            CmdOutput {
                exit_code: self.exit_code,
                ..CmdOutput::default()
            }
        }
    }

    /// Returns `true` while the process has not been reaped.
    pub fn is_running(&mut self) -> bool {
        if self.exit_code.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = status.code().or_else(|| status.signal().map(|s| -s));
                self.registry.remove(&self.id);
                false
            }
            Ok(None) => true,
            Err(err) => {
                log::error!("failed to poll `{}` on {}: {}", self.cmd, self.host, err);
                false
            }
        }
    }

    /// Kills the controller-side process and reaps it.
    pub async fn kill(&mut self) {
        if self.exit_code.is_some() {
            return;
        }
        if let Err(err) = self.child.kill().await {
            log::debug!("failed to kill `{}` on {}: {}", self.cmd, self.host, err);
        }
        self.is_running();
        self.registry.remove(&self.id);
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Incremental UTF-8 decoder that never splits a multi-byte character across reads.
#[derive(Debug, Default)]
struct Utf8Decoder {
    tail: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> std::result::Result<String, std::str::Utf8Error> {
        self.tail.extend_from_slice(bytes);
        match std::str::from_utf8(&self.tail) {
            Ok(text) => {
                let text = text.to_owned();
                self.tail.clear();
                Ok(text)
            }
            Err(err) if err.error_len().is_none() => {
                let valid = err.valid_up_to();
                let text = String::from_utf8_lossy(&self.tail[..valid]).into_owned();
                self.tail.drain(..valid);
                Ok(text)
            }
            Err(err) => Err(err),
        }
    }

    fn finish(&mut self) -> std::result::Result<(), std::str::Utf8Error> {
        let tail = std::mem::take(&mut self.tail);
        std::str::from_utf8(&tail).map(|_| ())
    }
}

/// Splits decoded text into complete lines, holding back a trailing partial line.
#[derive(Debug, Default)]
struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            lines.push(self.partial.drain(..=pos).collect());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        (!self.partial.is_empty()).then(|| std::mem::take(&mut self.partial))
    }
}

async fn drain_stream<R>(mut reader: R, stream: StreamId, by_line: bool, tx: mpsc::UnboundedSender<Chunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    let mut decoder = Utf8Decoder::default();
    let mut lines = LineBuffer::default();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                log::error!("failed to read {stream}: {err}");
                break;
            }
        };
        let text = match decoder.decode(&buf[..n]) {
            Ok(text) => text,
            Err(err) => {
                log::error!("failed to decode {stream}: {err}");
                break;
            }
        };
        if text.is_empty() {
            continue;
        }
        if by_line {
            for line in lines.push(&text) {
                let _ = tx.send(Chunk::Data(stream, line));
            }
        } else {
            let _ = tx.send(Chunk::Data(stream, text));
        }
    }

    if let Err(err) = decoder.finish() {
        log::error!("{stream} ended with a truncated UTF-8 sequence: {err}");
    }
    if let Some(line) = lines.finish() {
        let _ = tx.send(Chunk::Data(stream, line));
    }
    let _ = tx.send(Chunk::End(stream));
}
