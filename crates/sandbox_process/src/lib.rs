//! Async process supervisor (`spec.md §4.6`): streamed I/O, `wait`/
//! `communicate` with timeout, and process-group teardown.
//!
//! The pipe-mode shape (independent reader tasks feeding a channel,
//! `wait()` racing a timeout) is adapted from the teacher's synchronous
//! `processes::run`, generalized to `tokio::process::Child` the way the
//! corpus's own async sandbox supervisor
//! (`microsandbox-core::management::sandbox::run`) generalizes it. PTY mode
//! is grounded in `nix::pty::openpty` use from `other_examples`'
//! `vibesrc-coop` sandbox namespace module.

mod chunk;
mod pty;
mod stream;

pub use chunk::{Chunk, Line, StreamItem, StreamTag};
pub use stream::{ChunkStream, LineStream};

use std::time::Duration;

use nix::sys::signal::Signal;
use sandbox_runner::{signal_group, IoMode, ProcessRecord};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const READ_BUF_SIZE: usize = 8192;
const TERM_GRACE_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("stdin is not available for this process")]
    NoStdin,
    #[error("set_terminal_size is only valid in PTY mode")]
    NotAPty,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitResult {
    Exited(i32),
    Signaled(i32),
    TimedOut,
}

enum Stdin {
    Pipe(tokio::process::ChildStdin),
    Pty(std::sync::Arc<pty::PtyMaster>),
}

/// An opaque handle over a spawned sandbox child (`spec.md §4.6`).
pub struct Supervisor {
    child: tokio::process::Child,
    pgid: nix::unistd::Pid,
    io_mode: IoMode,
    stdin: Option<Stdin>,
    pty_master: Option<std::sync::Arc<pty::PtyMaster>>,
    rx: mpsc::UnboundedReceiver<Chunk>,
}

impl Supervisor {
    pub fn new(mut record: ProcessRecord) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let (stdin, pty_master) = match record.io_mode {
            IoMode::Pipe => {
                let stdin = record.child.stdin.take().map(Stdin::Pipe);
                if let Some(stdout) = record.child.stdout.take() {
                    spawn_pipe_reader(stdout, StreamTag::Stdout, tx.clone());
                }
                if let Some(stderr) = record.child.stderr.take() {
                    spawn_pipe_reader(stderr, StreamTag::Stderr, tx.clone());
                }
                (stdin, None)
            }
            IoMode::Pty => {
                let master_fd = record
                    .pty_master
                    .take()
                    .expect("PTY mode always carries a master fd");
                let master = std::sync::Arc::new(pty::PtyMaster::new(master_fd)?);
                spawn_pty_reader(master.clone(), tx.clone());
                (Some(Stdin::Pty(master.clone())), Some(master))
            }
        };

        Ok(Self {
            child: record.child,
            pgid: record.pgid,
            io_mode: record.io_mode,
            stdin,
            pty_master,
            rx,
        })
    }

    /// Appends to the child's input. No-op if stdin was not requested.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), ProcessError> {
        match &mut self.stdin {
            Some(Stdin::Pipe(stdin)) => stdin.write_all(bytes).await.map_err(ProcessError::from),
            Some(Stdin::Pty(master)) => master.write_all(bytes).await.map_err(ProcessError::from),
            None => Ok(()),
        }
    }

    pub fn close_stdin(&mut self) {
        if let Some(Stdin::Pipe(_)) = &self.stdin {
            self.stdin = None;
        }
        // PTY stdin has no independent half-close; `close_pty` tears it down.
    }

    /// Drains the next chunk, or `None` once every stream has closed.
    pub async fn next_chunk(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// A lazy sequence of chunks (`spec.md §4.6`): finite, non-restartable,
    /// backpressure-respecting. In pipe mode stdout and stderr chunks
    /// interleave in arrival order; in PTY mode every chunk is tagged
    /// `stdout`. `decode` lossily decodes each chunk's bytes to text;
    /// `include_stream_tag` attaches the originating [`StreamTag`].
    pub fn stream(&mut self, decode: bool, include_stream_tag: bool) -> ChunkStream<'_> {
        ChunkStream::new(&mut self.rx, decode, include_stream_tag)
    }

    /// A lazy sequence of lines (`spec.md §4.6`): coalesces partial reads
    /// across chunks until a newline, buffering stdout and stderr
    /// independently so a line never spans a stream-tag boundary, and
    /// emits each stream's trailing partial at EOF.
    pub fn stream_lines(&mut self, decode: bool) -> LineStream<'_> {
        LineStream::new(&mut self.rx, decode)
    }

    /// Drains both streams to completion, returning aggregated buffers. In
    /// PTY mode all output is merged into the `stdout` slot and `stderr` is
    /// always empty.
    pub async fn communicate(&mut self) -> (Vec<u8>, Vec<u8>) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            match chunk.tag {
                StreamTag::Stdout => stdout.extend_from_slice(&chunk.bytes),
                StreamTag::Stderr => stderr.extend_from_slice(&chunk.bytes),
            }
        }
        (stdout, stderr)
    }

    /// Blocks until terminal state or `timeout` elapses. `check` causes a
    /// non-zero exit to be reported as [`ExitResult::Exited`] regardless
    /// (the caller decides what "failure" means); this method only reports
    /// what happened.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> std::io::Result<ExitResult> {
        let wait_future = self.child.wait();
        let status = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait_future).await {
                Ok(status) => status?,
                Err(_elapsed) => {
                    self.terminate_with_grace().await;
                    return Ok(ExitResult::TimedOut);
                }
            },
            None => wait_future.await?,
        };
        Ok(exit_result_from_status(status))
    }

    /// Waits for `timeout`, cooperating with an external [`CancellationToken`]
    /// the same way an elapsed timeout does (`spec.md §5`: "cancellation
    /// from the host ... is handled identically").
    pub async fn wait_cancellable(
        &mut self,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> std::io::Result<ExitResult> {
        tokio::select! {
            result = self.wait(timeout) => result,
            _ = cancel.cancelled() => {
                self.terminate_with_grace().await;
                Ok(ExitResult::TimedOut)
            }
        }
    }

    async fn terminate_with_grace(&mut self) {
        let _ = signal_group(self.pgid, Signal::SIGTERM);
        if tokio::time::timeout(TERM_GRACE_PERIOD, self.child.wait())
            .await
            .is_err()
        {
            let _ = signal_group(self.pgid, Signal::SIGKILL);
            let _ = self.child.wait().await;
        }
    }

    pub fn set_terminal_size(&self, rows: u16, cols: u16) -> Result<(), ProcessError> {
        match &self.pty_master {
            Some(master) => master.set_winsize(rows, cols).map_err(ProcessError::from),
            None => Err(ProcessError::NotAPty),
        }
    }

    /// Releases descriptors and reaps the child, force-killing the whole
    /// process group after a short grace period if it's still running. In
    /// PTY mode, the master is closed and, if the child is still alive, a
    /// SIGHUP precedes the normal termination cascade.
    pub async fn close(mut self) {
        if self.io_mode == IoMode::Pty {
            let _ = signal_group(self.pgid, Signal::SIGHUP);
        }
        self.stdin = None;
        self.pty_master = None;
        self.terminate_with_grace().await;
    }

    pub async fn close_pty(&mut self) {
        let _ = signal_group(self.pgid, Signal::SIGHUP);
        self.stdin = None;
        self.pty_master = None;
    }
}

fn spawn_pipe_reader<R>(mut reader: R, tag: StreamTag, tx: mpsc::UnboundedSender<Chunk>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx
                        .send(Chunk {
                            tag,
                            bytes: buf[..n].to_vec(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_pty_reader(master: std::sync::Arc<pty::PtyMaster>, tx: mpsc::UnboundedSender<Chunk>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match master.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx
                        .send(Chunk {
                            tag: StreamTag::Stdout,
                            bytes: buf[..n].to_vec(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });
}

fn exit_result_from_status(status: std::process::ExitStatus) -> ExitResult {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitResult::Exited(code),
        None => ExitResult::Signaled(status.signal().unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_runner::RunnerSettings;
    use std::path::PathBuf;
    use tokio_stream::StreamExt;

    fn echo_settings() -> RunnerSettings {
        RunnerSettings {
            bwrap_path: PathBuf::from("/bin/sh"),
            shell: Some("/bin/sh".to_string()),
            rootfs: PathBuf::from("/"),
            session_dir: std::env::temp_dir(),
            tmp_dir: std::env::temp_dir(),
            resolv_conf: None,
            env_override: vec![],
            join_netns_pid: None,
            io_mode: IoMode::Pipe,
        }
    }

    // These exercise the supervisor directly against `/bin/sh`, bypassing
    // `sandbox_runner::spawn`'s bwrap wrapping, since CI sandboxes running
    // these tests won't have bwrap installed; the settings above only
    // supply a plausible `RunnerSettings` value for documentation purposes.
    fn direct_record(command: &str) -> ProcessRecord {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        let child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        ProcessRecord {
            child,
            pgid: nix::unistd::Pid::from_raw(pid as i32),
            io_mode: IoMode::Pipe,
            pty_master: None,
        }
    }

    #[tokio::test]
    async fn communicate_returns_stdout_and_exit_status() {
        let _ = echo_settings();
        let record = direct_record("echo hello");
        let mut supervisor = Supervisor::new(record).unwrap();
        let (stdout, stderr) = supervisor.communicate().await;
        assert_eq!(stdout, b"hello\n");
        assert!(stderr.is_empty());
        let status = supervisor.wait(None).await.unwrap();
        assert_eq!(status, ExitResult::Exited(0));
    }

    #[tokio::test]
    async fn send_then_close_stdin_is_echoed_back_by_cat() {
        let record = direct_record("cat");
        let mut supervisor = Supervisor::new(record).unwrap();
        supervisor.send(b"hello\n").await.unwrap();
        supervisor.close_stdin();
        let (stdout, stderr) = supervisor.communicate().await;
        assert_eq!(stdout, b"hello\n");
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn wait_with_timeout_reports_timed_out_for_long_running_child() {
        let record = direct_record("sleep 5");
        let mut supervisor = Supervisor::new(record).unwrap();
        let result = supervisor.wait(Some(Duration::from_millis(100))).await.unwrap();
        assert_eq!(result, ExitResult::TimedOut);
    }

    #[tokio::test]
    async fn stream_yields_tagged_decoded_chunks() {
        let record = direct_record("echo hello");
        let mut supervisor = Supervisor::new(record).unwrap();
        let items: Vec<_> = supervisor.stream(true, true).collect().await;
        assert_eq!(items, vec![StreamItem::TaggedText(StreamTag::Stdout, "hello\n".to_string())]);
    }

    #[tokio::test]
    async fn stream_lines_coalesces_partial_reads_and_emits_trailing_partial() {
        let record = direct_record("printf 'a\\nb'; printf 'c' 1>&2");
        let mut supervisor = Supervisor::new(record).unwrap();
        let mut lines: Vec<_> = supervisor.stream_lines(true).collect().await;
        lines.sort_by_key(|l| matches!(l, Line::Text(StreamTag::Stderr, _)));
        assert_eq!(
            lines,
            vec![
                Line::Text(StreamTag::Stdout, "a".to_string()),
                Line::Text(StreamTag::Stdout, "b".to_string()),
                Line::Text(StreamTag::Stderr, "c".to_string()),
            ]
        );
    }
}
