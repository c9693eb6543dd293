//! Supervised execution of external tools.
//!
//! [`ToolCommand`] is a builder describing one invocation. [`ToolCommand::execute`]
//! runs it to completion and captures its output; [`ToolCommand::supervise`]
//! additionally reports the live process and every output chunk to a
//! [`ProcessObserver`], and accepts signal/abort/priority requests while the
//! process runs.
//!
//! A run completes exactly once, after the process has exited *and* every
//! captured stream has closed, whichever order those happen in.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::control::{self, ControlHandle, ControlRequest, KillSignal, LiveProcess, ProcessSlot};
use crate::interpret::extract_error;
use crate::tools::{Tool, ToolLocator};

const READ_CHUNK: usize = 8 * 1024;

/// Output captured from a successful tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exit status.
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// The single terminal outcome of a supervised run.
#[derive(Debug)]
pub struct Completion {
    /// Exit status on success, otherwise the first recorded failure.
    pub result: fp_core::Result<ExitStatus>,
    /// Accumulated stdout, when stdout was captured.
    pub stdout: Option<String>,
    /// Accumulated stderr, when stderr was captured.
    pub stderr: Option<String>,
}

impl Completion {
    fn failed(error: fp_core::Error) -> Self {
        Self {
            result: Err(error),
            stdout: None,
            stderr: None,
        }
    }

    /// Convert into a [`ToolOutput`], attaching the extracted stderr
    /// diagnostic to a non-zero exit error.
    pub fn into_output(self) -> fp_core::Result<ToolOutput> {
        let stdout = self.stdout.unwrap_or_default();
        let stderr = self.stderr.unwrap_or_default();
        match self.result {
            Ok(status) => Ok(ToolOutput {
                status,
                stdout,
                stderr,
            }),
            Err(e @ fp_core::Error::Exited { .. }) => Err(e.with_diagnostic(extract_error(&stderr))),
            Err(e) => Err(e),
        }
    }
}

/// Receives the events of a supervised run.
///
/// Every method has an empty default so observers only implement what they
/// care about. Chunks are reported with the whole text accumulated so far on
/// that stream, the chunk included.
pub trait ProcessObserver: Send {
    /// Called once, right after the process was spawned.
    fn started(&mut self, _process: &mut StartedProcess) {}

    fn stdout_chunk(&mut self, _chunk: &str, _accumulated: &str) {}

    fn stderr_chunk(&mut self, _chunk: &str, _accumulated: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl ProcessObserver for NoopObserver {}

/// A freshly spawned process, as handed to [`ProcessObserver::started`].
#[derive(Debug)]
pub struct StartedProcess {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    control: ControlHandle,
}

impl StartedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The process's stdin, when it was piped. Dropping it closes the pipe.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// The process's stdout, when it is piped but not captured.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Handle for signalling or aborting the run.
    pub fn control(&self) -> &ControlHandle {
        &self.control
    }
}

// ---------------------------------------------------------------------------
// CompletionLatch
// ---------------------------------------------------------------------------

/// Joins the exit of a process with the closure of its captured streams.
///
/// [`CompletionLatch::take`] yields the exit status once, after every
/// awaited signal has arrived. It never yields again.
#[derive(Debug)]
pub struct CompletionLatch<S> {
    exit: Option<S>,
    stdout_open: bool,
    stderr_open: bool,
    fired: bool,
}

impl<S> CompletionLatch<S> {
    /// Create a latch that also waits for the given streams to close.
    pub fn new(await_stdout: bool, await_stderr: bool) -> Self {
        Self {
            exit: None,
            stdout_open: await_stdout,
            stderr_open: await_stderr,
            fired: false,
        }
    }

    pub fn exited(&mut self, status: S) {
        if !self.fired && self.exit.is_none() {
            self.exit = Some(status);
        }
    }

    pub fn stdout_closed(&mut self) {
        self.stdout_open = false;
    }

    pub fn stderr_closed(&mut self) {
        self.stderr_open = false;
    }

    pub fn has_exited(&self) -> bool {
        self.fired || self.exit.is_some()
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Fire the latch if every signal is in.
    pub fn take(&mut self) -> Option<S> {
        if self.fired || self.stdout_open || self.stderr_open {
            return None;
        }
        let status = self.exit.take()?;
        self.fired = true;
        Some(status)
    }
}

// ---------------------------------------------------------------------------
// OutputBuffer
// ---------------------------------------------------------------------------

/// Append-only text accumulator fed with raw bytes.
///
/// Multi-byte UTF-8 sequences split across reads are held back until they
/// complete; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    text: String,
    pending: Vec<u8>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return the offset at which the new text starts.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let start = self.text.len();
        self.pending.extend_from_slice(bytes);

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    self.text.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        start
    }

    /// Flush a trailing incomplete sequence.
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            self.text.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(mut self) -> String {
        self.finish();
        self.text
    }
}

// ---------------------------------------------------------------------------
// ToolCommand
// ---------------------------------------------------------------------------

/// A builder for constructing and executing external tool invocations.
///
/// # Example
///
/// ```no_run
/// use fp_av::{Tool, ToolCommand, ToolLocator};
///
/// # async fn example() -> fp_core::Result<()> {
/// let output = ToolCommand::new(Tool::Ffprobe)
///     .arg("-v").arg("error")
///     .arg("-print_format").arg("json")
///     .arg("-show_format")
///     .arg("/path/to/video.mkv")
///     .execute(&ToolLocator::default())
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    tool: Tool,
    args: Vec<String>,
    timeout: Option<Duration>,
    niceness: i32,
    capture_stdout: bool,
    capture_stderr: bool,
    pipe_stdin: bool,
    stdin_data: Option<Vec<u8>>,
}

impl ToolCommand {
    /// Create a new command for the given tool. Both output streams are
    /// captured; stdin is not piped.
    pub fn new(tool: Tool) -> Self {
        Self {
            tool,
            args: Vec::new(),
            timeout: None,
            niceness: 0,
            capture_stdout: true,
            capture_stderr: true,
            pipe_stdin: false,
            stdin_data: None,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Kill the process and fail with [`fp_core::Error::Timeout`] after `d`.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = Some(d);
        self
    }

    /// Replace the deadline, `None` disabling it.
    pub fn deadline(&mut self, d: Option<Duration>) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Run through `nice -n <value>` when non-zero (unix only).
    pub fn niceness(&mut self, value: i32) -> &mut Self {
        self.niceness = value;
        self
    }

    /// Accumulate stdout. When off, stdout stays piped and is handed to the
    /// observer through [`StartedProcess::take_stdout`].
    pub fn capture_stdout(&mut self, capture: bool) -> &mut Self {
        self.capture_stdout = capture;
        self
    }

    pub fn capture_stderr(&mut self, capture: bool) -> &mut Self {
        self.capture_stderr = capture;
        self
    }

    /// Pipe stdin so the observer can write to it.
    pub fn pipe_stdin(&mut self, pipe: bool) -> &mut Self {
        self.pipe_stdin = pipe;
        self
    }

    /// Provide data to be written to the process's stdin by [`execute`](Self::execute).
    pub fn stdin(&mut self, data: Vec<u8>) -> &mut Self {
        self.pipe_stdin = true;
        self.stdin_data = Some(data);
        self
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Execute the command, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// - [`fp_core::Error::ToolNotFound`] if the binary cannot be resolved.
    /// - [`fp_core::Error::Spawn`] if the process cannot be started.
    /// - [`fp_core::Error::Exited`] with the stderr diagnostic on a non-zero
    ///   exit, [`fp_core::Error::Killed`] if a signal ended it.
    /// - [`fp_core::Error::Timeout`] if the deadline passed first.
    pub async fn execute(&self, locator: &ToolLocator) -> fp_core::Result<ToolOutput> {
        let mut feeder = StdinFeeder {
            data: self.stdin_data.clone(),
        };
        self.supervise(locator, &mut feeder, None)
            .await
            .into_output()
    }

    /// Spawn the tool and supervise it until it completes.
    ///
    /// While the process runs it is published to `slot` (if given) so other
    /// tasks can signal it; it is retired from the slot before this returns.
    pub async fn supervise(
        &self,
        locator: &ToolLocator,
        observer: &mut dyn ProcessObserver,
        slot: Option<&ProcessSlot>,
    ) -> Completion {
        let tool = self.tool.name();

        let mut cmd = match self.build(locator) {
            Ok(cmd) => cmd,
            Err(e) => return Completion::failed(e),
        };

        tracing::debug!("Spawning {tool} {}", self.args.join(" "));
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                return Completion::failed(fp_core::Error::Spawn {
                    tool: tool.to_string(),
                    source,
                })
            }
        };

        let pid = child.id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let control = ControlHandle::new(tx);
        if let Some(slot) = slot {
            slot.publish(LiveProcess {
                pid,
                control: control.clone(),
            });
        }

        let mut stdout_pipe = if self.capture_stdout {
            child.stdout.take()
        } else {
            None
        };
        let mut stderr_pipe = if self.capture_stderr {
            child.stderr.take()
        } else {
            None
        };

        let mut started = StartedProcess {
            pid,
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            control,
        };
        observer.started(&mut started);
        drop(started);

        let mut latch = CompletionLatch::new(stdout_pipe.is_some(), stderr_pipe.is_some());
        let mut stdout_buf = OutputBuffer::new();
        let mut stderr_buf = OutputBuffer::new();
        let mut stdout_chunk = vec![0u8; READ_CHUNK];
        let mut stderr_chunk = vec![0u8; READ_CHUNK];
        let mut abort_error: Option<fp_core::Error> = None;
        let mut control_open = true;
        let mut timer_armed = self.timeout.is_some();

        let deadline = self.timeout;
        let timer = async move {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        let status = loop {
            if let Some(status) = latch.take() {
                break status;
            }

            tokio::select! {
                read = read_some(&mut stdout_pipe, &mut stdout_chunk) => match read {
                    Ok(0) => {
                        stdout_pipe = None;
                        stdout_buf.finish();
                        latch.stdout_closed();
                    }
                    Ok(n) => {
                        let start = stdout_buf.push(&stdout_chunk[..n]);
                        let text = stdout_buf.as_str();
                        observer.stdout_chunk(&text[start..], text);
                    }
                    Err(e) => {
                        tracing::debug!("Reading {tool} stdout failed: {e}");
                        stdout_pipe = None;
                        latch.stdout_closed();
                    }
                },
                read = read_some(&mut stderr_pipe, &mut stderr_chunk) => match read {
                    Ok(0) => {
                        stderr_pipe = None;
                        stderr_buf.finish();
                        latch.stderr_closed();
                    }
                    Ok(n) => {
                        let start = stderr_buf.push(&stderr_chunk[..n]);
                        let text = stderr_buf.as_str();
                        observer.stderr_chunk(&text[start..], text);
                    }
                    Err(e) => {
                        tracing::debug!("Reading {tool} stderr failed: {e}");
                        stderr_pipe = None;
                        latch.stderr_closed();
                    }
                },
                waited = child.wait(), if !latch.has_exited() => match waited {
                    Ok(status) => {
                        tracing::debug!("{tool} exited: {status}");
                        latch.exited(status);
                    }
                    Err(e) => {
                        tracing::warn!("Waiting for {tool} failed: {e}");
                        if let Some(slot) = slot {
                            slot.retire();
                        }
                        return Completion {
                            result: Err(abort_error.unwrap_or(fp_core::Error::from(e))),
                            stdout: self.capture_stdout.then(|| stdout_buf.into_string()),
                            stderr: self.capture_stderr.then(|| stderr_buf.into_string()),
                        };
                    }
                },
                request = rx.recv(), if control_open => match request {
                    Some(ControlRequest::Signal(signal)) => {
                        if !latch.has_exited() {
                            deliver(&mut child, tool, signal);
                        }
                    }
                    Some(ControlRequest::Abort { error, signal }) => {
                        if abort_error.is_none() {
                            tracing::debug!("Aborting {tool}: {error}");
                            abort_error = Some(error);
                        }
                        if !latch.has_exited() {
                            deliver(&mut child, tool, signal);
                        }
                    }
                    Some(ControlRequest::Renice(value)) => {
                        control::spawn_renice(locator, pid, value);
                    }
                    None => control_open = false,
                },
                _ = &mut timer, if timer_armed && !latch.has_exited() => {
                    timer_armed = false;
                    if let Some(after) = deadline {
                        tracing::warn!("{tool} exceeded its {after:?} deadline; killing");
                        if abort_error.is_none() {
                            abort_error = Some(fp_core::Error::Timeout {
                                tool: tool.to_string(),
                                after,
                            });
                        }
                        deliver(&mut child, tool, KillSignal::Kill);
                    }
                },
            }
        };

        if let Some(slot) = slot {
            slot.retire();
        }

        let result = match abort_error {
            Some(e) => Err(e),
            None => status_to_result(tool, status),
        };

        Completion {
            result,
            stdout: self.capture_stdout.then(|| stdout_buf.into_string()),
            stderr: self.capture_stderr.then(|| stderr_buf.into_string()),
        }
    }

    fn build(&self, locator: &ToolLocator) -> fp_core::Result<Command> {
        let binary = locator.resolve(self.tool)?;
        let mut cmd = self.base_command(locator, binary)?;

        cmd.stdin(if self.pipe_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(if self.capture_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    #[cfg(unix)]
    fn base_command(&self, locator: &ToolLocator, binary: PathBuf) -> fp_core::Result<Command> {
        if self.niceness == 0 {
            let mut cmd = Command::new(binary);
            cmd.args(&self.args);
            return Ok(cmd);
        }

        let nice = locator.resolve(Tool::Nice)?;
        let mut cmd = Command::new(nice);
        cmd.arg("-n")
            .arg(self.niceness.to_string())
            .arg(binary)
            .args(&self.args);
        Ok(cmd)
    }

    #[cfg(not(unix))]
    fn base_command(&self, _locator: &ToolLocator, binary: PathBuf) -> fp_core::Result<Command> {
        if self.niceness != 0 {
            tracing::debug!("Niceness is not supported on this platform; ignoring");
        }
        let mut cmd = Command::new(binary);
        cmd.args(&self.args);
        Ok(cmd)
    }
}

/// Writes fixed data to stdin, then closes it.
struct StdinFeeder {
    data: Option<Vec<u8>>,
}

impl ProcessObserver for StdinFeeder {
    fn started(&mut self, process: &mut StartedProcess) {
        let Some(mut stdin) = process.take_stdin() else {
            return;
        };
        let data = self.data.take().unwrap_or_default();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&data).await {
                tracing::debug!("Writing stdin failed: {e}");
            }
        });
    }
}

/// Read from an optional pipe; a missing pipe never becomes ready.
async fn read_some<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match pipe {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Map an exit status onto the crate's error model.
pub(crate) fn status_to_result(tool: &str, status: ExitStatus) -> fp_core::Result<ExitStatus> {
    if status.success() {
        return Ok(status);
    }
    if let Some(code) = status.code() {
        return Err(fp_core::Error::exited(tool, code));
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(raw) = status.signal() {
            return Err(fp_core::Error::killed(tool, control::signal_name(raw)));
        }
    }

    Err(fp_core::Error::killed(tool, "unknown"))
}

/// Send `signal` to the child, logging failures.
fn deliver(child: &mut Child, tool: &str, signal: KillSignal) {
    tracing::debug!("Sending {signal} to {tool}");
    if let Err(e) = send_signal(child, signal) {
        tracing::warn!("Failed to send {signal} to {tool}: {e}");
    }
}

#[cfg(unix)]
fn send_signal(child: &mut Child, signal: KillSignal) -> io::Result<()> {
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => nix::sys::signal::kill(Pid::from_raw(pid as i32), Signal::from(signal))
            .map_err(io::Error::from),
        // Already reaped.
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, _signal: KillSignal) -> io::Result<()> {
    child.start_kill()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_waits_for_every_signal() {
        let mut latch = CompletionLatch::new(true, true);
        latch.exited(0);
        assert_eq!(latch.take(), None);
        latch.stdout_closed();
        assert_eq!(latch.take(), None);
        latch.stderr_closed();
        assert_eq!(latch.take(), Some(0));
        assert_eq!(latch.take(), None);
        assert!(latch.has_fired());
    }

    #[test]
    fn latch_ignores_order() {
        let mut latch = CompletionLatch::new(true, false);
        latch.stdout_closed();
        assert_eq!(latch.take(), None);
        latch.exited(3);
        latch.exited(4);
        assert_eq!(latch.take(), Some(3));
    }

    #[test]
    fn latch_without_streams_fires_on_exit() {
        let mut latch = CompletionLatch::new(false, false);
        assert_eq!(latch.take(), None);
        latch.exited("done");
        assert_eq!(latch.take(), Some("done"));
    }

    #[test]
    fn buffer_joins_split_utf8() {
        let mut buf = OutputBuffer::new();
        let bytes = "héllo".as_bytes();
        assert_eq!(buf.push(&bytes[..2]), 0);
        assert_eq!(buf.as_str(), "h");
        assert_eq!(buf.push(&bytes[2..]), 1);
        assert_eq!(buf.as_str(), "héllo");
    }

    #[test]
    fn buffer_replaces_invalid_bytes() {
        let mut buf = OutputBuffer::new();
        buf.push(b"a\xffb");
        assert_eq!(buf.as_str(), "a\u{FFFD}b");
        buf.push(b"\xe2\x82");
        assert_eq!(buf.into_string(), "a\u{FFFD}b\u{FFFD}");
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use assert_matches::assert_matches;
        use fp_core::config::ToolsConfig;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        fn script(dir: &Path, body: &str) -> ToolLocator {
            let path = dir.join("fake-ffmpeg");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            ToolLocator::new(ToolsConfig {
                ffmpeg_path: Some(path),
                ..Default::default()
            })
        }

        #[derive(Default)]
        struct Recorder {
            started: usize,
            stdout_chunks: Vec<String>,
            stderr_seen: String,
        }

        impl ProcessObserver for Recorder {
            fn started(&mut self, _process: &mut StartedProcess) {
                self.started += 1;
            }
            fn stdout_chunk(&mut self, chunk: &str, _accumulated: &str) {
                self.stdout_chunks.push(chunk.to_string());
            }
            fn stderr_chunk(&mut self, _chunk: &str, accumulated: &str) {
                self.stderr_seen = accumulated.to_string();
            }
        }

        #[tokio::test]
        async fn execute_captures_output() {
            let dir = tempfile::tempdir().unwrap();
            let locator = script(dir.path(), "echo \"$@\"; echo oops >&2");
            let out = ToolCommand::new(Tool::Ffmpeg)
                .args(["-i", "in.mp4"])
                .execute(&locator)
                .await
                .unwrap();
            assert!(out.status.success());
            assert_eq!(out.stdout.trim(), "-i in.mp4");
            assert_eq!(out.stderr.trim(), "oops");
        }

        #[tokio::test]
        async fn execute_feeds_stdin() {
            let dir = tempfile::tempdir().unwrap();
            let locator = script(dir.path(), "exec cat");
            let out = ToolCommand::new(Tool::Ffmpeg)
                .stdin(b"piped bytes".to_vec())
                .execute(&locator)
                .await
                .unwrap();
            assert_eq!(out.stdout, "piped bytes");
        }

        #[tokio::test]
        async fn nonzero_exit_carries_diagnostic() {
            let dir = tempfile::tempdir().unwrap();
            let locator = script(
                dir.path(),
                "echo '  context' >&2; echo 'Unknown encoder foo' >&2; exit 3",
            );
            let err = ToolCommand::new(Tool::Ffmpeg)
                .execute(&locator)
                .await
                .unwrap_err();
            assert_matches!(
                err,
                fp_core::Error::Exited { code: 3, ref diagnostic, .. } if diagnostic == "Unknown encoder foo"
            );
        }

        #[tokio::test]
        async fn unexecutable_binary_is_spawn_error() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("not-executable");
            std::fs::write(&path, b"").unwrap();
            let locator = ToolLocator::new(ToolsConfig {
                ffmpeg_path: Some(path),
                ..Default::default()
            });

            let mut recorder = Recorder::default();
            let completion = ToolCommand::new(Tool::Ffmpeg)
                .supervise(&locator, &mut recorder, None)
                .await;
            assert_matches!(completion.result, Err(fp_core::Error::Spawn { .. }));
            assert_eq!(recorder.started, 0);
            assert!(completion.stdout.is_none());
        }

        #[tokio::test]
        async fn timeout_kills_process() {
            let dir = tempfile::tempdir().unwrap();
            let locator = script(dir.path(), "exec sleep 10");
            let started = std::time::Instant::now();
            let err = ToolCommand::new(Tool::Ffmpeg)
                .timeout(Duration::from_millis(100))
                .execute(&locator)
                .await
                .unwrap_err();
            assert_matches!(err, fp_core::Error::Timeout { .. });
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn observer_sees_chunks_and_start_once() {
            let dir = tempfile::tempdir().unwrap();
            let locator = script(dir.path(), "echo one; echo two >&2");
            let mut recorder = Recorder::default();
            let completion = ToolCommand::new(Tool::Ffmpeg)
                .supervise(&locator, &mut recorder, None)
                .await;
            assert!(completion.result.is_ok());
            assert_eq!(recorder.started, 1);
            assert_eq!(recorder.stdout_chunks.concat(), "one\n");
            assert_eq!(recorder.stderr_seen, "two\n");
            assert_eq!(completion.stdout.as_deref(), Some("one\n"));
        }

        #[tokio::test]
        async fn abort_error_wins_over_signal() {
            struct AbortOnStart;
            impl ProcessObserver for AbortOnStart {
                fn started(&mut self, process: &mut StartedProcess) {
                    process
                        .control()
                        .abort(fp_core::Error::InputStream("source failed".into()));
                }
            }

            let dir = tempfile::tempdir().unwrap();
            let locator = script(dir.path(), "exec sleep 10");
            let completion = ToolCommand::new(Tool::Ffmpeg)
                .supervise(&locator, &mut AbortOnStart, None)
                .await;
            assert_matches!(completion.result, Err(fp_core::Error::InputStream(_)));
        }

        #[tokio::test]
        async fn slot_is_published_then_retired() {
            struct CheckSlot<'a>(&'a ProcessSlot, bool);
            impl ProcessObserver for CheckSlot<'_> {
                fn started(&mut self, _process: &mut StartedProcess) {
                    self.1 = self.0.live().is_some();
                }
            }

            let dir = tempfile::tempdir().unwrap();
            let locator = script(dir.path(), "exit 0");
            let slot = ProcessSlot::new();
            let _reservation = slot.reserve().unwrap();
            let mut check = CheckSlot(&slot, false);
            let completion = ToolCommand::new(Tool::Ffmpeg)
                .supervise(&locator, &mut check, Some(&slot))
                .await;
            assert!(completion.result.is_ok());
            assert!(check.1);
            assert!(slot.live().is_none());
        }

        #[tokio::test]
        async fn signalled_exit_is_killed_error() {
            struct TermOnStart;
            impl ProcessObserver for TermOnStart {
                fn started(&mut self, process: &mut StartedProcess) {
                    process.control().signal(KillSignal::Term);
                }
            }

            let dir = tempfile::tempdir().unwrap();
            let locator = script(dir.path(), "exec sleep 10");
            let completion = ToolCommand::new(Tool::Ffmpeg)
                .supervise(&locator, &mut TermOnStart, None)
                .await;
            assert_matches!(
                completion.result,
                Err(fp_core::Error::Killed { ref signal, .. }) if signal == "SIGTERM"
            );
        }

        #[tokio::test]
        async fn niceness_runs_through_nice() {
            let locator = ToolLocator::default();
            if !locator.is_available(Tool::Nice) {
                return;
            }
            let dir = tempfile::tempdir().unwrap();
            let locator = script(dir.path(), "exec nice");
            let out = ToolCommand::new(Tool::Ffmpeg)
                .niceness(5)
                .execute(&locator)
                .await
                .unwrap();
            let reported: i32 = out.stdout.trim().parse().unwrap();
            assert!(reported >= 5, "niceness was {reported}");
        }
    }
}
