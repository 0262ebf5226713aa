//! Output relay: drains a job's stdout/stderr without stalling the loop.
//!
//! Each scheduler tick runs one [`OutputRelay::drain_pass`]: a short
//! cooperative pause, then at most one bounded read per stream that completes
//! immediately when no data is ready. Bytes are buffered per stream so lines
//! split across reads are emitted whole. When a job is reaped,
//! [`OutputRelay::drain_to_end`] reads both streams to EOF so nothing written
//! before exit is lost.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{ChildStderr, ChildStdout};

use crate::error::Result;
use crate::scheduler::job::{guarded, JobId, OutputCallback};
use crate::store::{ColorHint, ConsoleLine, ConsoleSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A decoded output line and the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedLine {
    pub stream: StreamKind,
    pub text: String,
}

impl RelayedLine {
    pub fn color(&self) -> ColorHint {
        match self.stream {
            StreamKind::Stderr => ColorHint::Red,
            StreamKind::Stdout => ColorHint::classify(&self.text),
        }
    }
}

#[derive(Debug, Default)]
pub struct DrainPass {
    pub lines: Vec<RelayedLine>,
    /// Both streams have returned EOF.
    pub at_eof: bool,
}

#[derive(Debug)]
struct StreamState<R> {
    reader: Option<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> StreamState<R> {
    fn new(reader: Option<R>) -> Self {
        Self {
            reader,
            pending: Vec::new(),
        }
    }

    fn is_eof(&self) -> bool {
        self.reader.is_none()
    }

    /// Read whatever is ready right now, up to `buf.len()` bytes.
    async fn read_ready(&mut self, buf: &mut [u8]) -> std::io::Result<Vec<String>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Vec::new());
        };

        // A zero timeout still polls the read once before giving up.
        match tokio::time::timeout(Duration::ZERO, reader.read(buf)).await {
            Err(_) => Ok(Vec::new()),
            Ok(result) => self.absorb(result, buf),
        }
    }

    /// Wait for the next chunk.
    async fn read_next(&mut self, buf: &mut [u8]) -> std::io::Result<Vec<String>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Vec::new());
        };
        let result = reader.read(buf).await;
        self.absorb(result, buf)
    }

    fn absorb(&mut self, result: std::io::Result<usize>, buf: &[u8]) -> std::io::Result<Vec<String>> {
        match result {
            Ok(0) => {
                self.reader = None;
                Ok(self.flush())
            }
            Ok(n) => Ok(self.push(&buf[..n])),
            Err(e)
                if e.kind() == std::io::ErrorKind::Interrupted
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    fn flush(&mut self) -> Vec<String> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let raw = std::mem::take(&mut self.pending);
        vec![decode_line(&raw)]
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn tag(stream: StreamKind, texts: Vec<String>) -> impl Iterator<Item = RelayedLine> {
    texts.into_iter().map(move |text| RelayedLine { stream, text })
}

#[derive(Debug)]
pub struct OutputRelay {
    stdout: StreamState<ChildStdout>,
    stderr: StreamState<ChildStderr>,
    chunk_size: usize,
    pause: Duration,
}

impl OutputRelay {
    pub fn new(
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        chunk_size: usize,
        pause: Duration,
    ) -> Self {
        Self {
            stdout: StreamState::new(stdout),
            stderr: StreamState::new(stderr),
            chunk_size: chunk_size.max(1),
            pause,
        }
    }

    pub fn at_eof(&self) -> bool {
        self.stdout.is_eof() && self.stderr.is_eof()
    }

    /// One cooperative, non-blocking pass over both streams.
    pub async fn drain_pass(&mut self) -> std::io::Result<DrainPass> {
        tokio::time::sleep(self.pause).await;

        let mut buf = vec![0u8; self.chunk_size];
        let mut lines: Vec<RelayedLine> = Vec::new();

        let out = self.stdout.read_ready(&mut buf).await?;
        lines.extend(tag(StreamKind::Stdout, out));
        let err = self.stderr.read_ready(&mut buf).await?;
        lines.extend(tag(StreamKind::Stderr, err));

        Ok(DrainPass {
            lines,
            at_eof: self.at_eof(),
        })
    }

    /// Read both streams until EOF, including any unterminated last line.
    pub async fn drain_to_end(&mut self) -> std::io::Result<Vec<RelayedLine>> {
        let mut out_buf = vec![0u8; self.chunk_size];
        let mut err_buf = vec![0u8; self.chunk_size];
        let mut lines: Vec<RelayedLine> = Vec::new();

        while !self.at_eof() {
            let stdout_open = !self.stdout.is_eof();
            let stderr_open = !self.stderr.is_eof();
            tokio::select! {
                out = self.stdout.read_next(&mut out_buf), if stdout_open => {
                    lines.extend(tag(StreamKind::Stdout, out?));
                }
                err = self.stderr.read_next(&mut err_buf), if stderr_open => {
                    lines.extend(tag(StreamKind::Stderr, err?));
                }
            }
        }

        Ok(lines)
    }
}

/// Hand relayed lines to the console sink and the job's output callback.
///
/// Every line reaches the console even if the callback panics; the first
/// callback failure is returned once the batch is done.
pub async fn forward(
    job_name: &str,
    job_id: JobId,
    callback: Option<&OutputCallback>,
    console: &ConsoleSink,
    lines: Vec<RelayedLine>,
) -> Result<()> {
    let mut callback_err = None;

    for line in lines {
        let entry = ConsoleLine {
            job_name: job_name.to_string(),
            job_id,
            color: line.color(),
            text: line.text,
        };

        console.publish(entry.clone()).await?;
        if let Some(callback) = callback {
            if let Err(e) = guarded(|| callback(&entry)) {
                callback_err.get_or_insert(e);
            }
        }
    }

    callback_err.map_or(Ok(()), Err)
}
