//! Builder for executing external tool commands.
//!
//! Two execution modes:
//! - [`ToolCommand::execute`] captures stdout/stderr for short-lived probes.
//! - [`ToolCommand::supervise`] streams both pipes line by line to a callback
//!   while watching for cancellation and a wall-clock timeout. Exit is only
//!   reported after both pipes have been drained, so trailing progress and
//!   error lines are never lost.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use ef_core::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Lines kept from stderr for error messages when supervising.
const DEFAULT_TAIL_LINES: usize = 40;

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// Which pipe a streamed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Result of a supervised run that exited successfully.
#[derive(Debug, Clone)]
pub struct SupervisedRun {
    pub elapsed: Duration,
    /// Last stderr lines, oldest first.
    pub stderr_tail: Vec<String>,
    pub lines_seen: u64,
}

/// A builder for constructing and executing external tool invocations.
///
/// ```no_run
/// use ef_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> ef_core::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .args(["-v", "quiet", "-print_format", "json", "-show_format"])
///     .arg("/path/to/video.mkv")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    current_dir: Option<PathBuf>,
    tail_lines: usize,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            current_dir: None,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append a path argument.
    pub fn path_arg(&mut self, p: &Path) -> &mut Self {
        self.args.push(p.to_string_lossy().into_owned());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Number of stderr lines retained for error reporting.
    pub fn tail_lines(&mut self, n: usize) -> &mut Self {
        self.tail_lines = n.max(1);
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn(&self) -> Result<Child> {
        self.command()
            .spawn()
            .map_err(|e| Error::tool(self.program_name(), format!("failed to spawn: {e}")))
    }

    /// Execute the command, capturing stdout and stderr.
    ///
    /// Fails with [`Error::Tool`] on spawn failure, timeout, or non-zero exit
    /// (the message includes stderr).
    pub async fn execute(&self) -> Result<ToolOutput> {
        let name = self.program_name();
        let child = self.spawn()?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let out = ToolOutput {
                    status: output.status,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };
                if !output.status.success() {
                    return Err(Error::tool(
                        name,
                        format!("exited with {}: {}", output.status, out.stderr.trim()),
                    ));
                }
                Ok(out)
            }
            Ok(Err(e)) => Err(Error::tool(name, format!("I/O error waiting for process: {e}"))),
            // The child future is dropped here; kill_on_drop reaps it.
            Err(_) => Err(Error::tool(name, format!("timed out after {:?}", self.timeout))),
        }
    }

    /// Run the command, streaming every output line to `on_line`.
    ///
    /// Cancelling `cancel` kills the child and yields [`Error::Cancelled`].
    /// A non-zero exit yields [`Error::Tool`] whose message is the captured
    /// stderr tail.
    pub async fn supervise<F>(&self, cancel: &CancellationToken, mut on_line: F) -> Result<SupervisedRun>
    where
        F: FnMut(Stream, &str) + Send,
    {
        let name = self.program_name();
        let started = Instant::now();
        tracing::debug!(tool = %name, command = %self, "Spawning supervised process");

        let mut child = self.spawn()?;
        let (tx, mut rx) = mpsc::channel::<(Stream, String)>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut tail: VecDeque<String> = VecDeque::with_capacity(self.tail_lines);
        let mut lines_seen = 0u64;
        let mut status: Option<ExitStatus> = None;
        let mut streams_open = true;

        while status.is_none() || streams_open {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(tool = %name, "Cancellation requested, killing process");
                    kill(&mut child).await;
                    return Err(Error::Cancelled);
                }
                _ = &mut deadline => {
                    kill(&mut child).await;
                    return Err(Error::tool(name, format!("timed out after {:?}", self.timeout)));
                }
                line = rx.recv(), if streams_open => match line {
                    Some((stream, text)) => {
                        lines_seen += 1;
                        on_line(stream, &text);
                        if stream == Stream::Stderr && !text.trim().is_empty() {
                            if tail.len() == self.tail_lines {
                                tail.pop_front();
                            }
                            tail.push_back(text);
                        }
                    }
                    None => streams_open = false,
                },
                res = child.wait(), if status.is_none() => {
                    let exit = res.map_err(|e| Error::tool(name.clone(), format!("I/O error waiting for process: {e}")))?;
                    status = Some(exit);
                }
            }
        }

        let stderr_tail: Vec<String> = tail.into_iter().collect();
        let elapsed = started.elapsed();
        match status {
            Some(s) if s.success() => {
                tracing::debug!(tool = %name, elapsed_ms = elapsed.as_millis() as u64, lines_seen, "Process exited cleanly");
                Ok(SupervisedRun {
                    elapsed,
                    stderr_tail,
                    lines_seen,
                })
            }
            Some(s) => {
                let diagnostics = if stderr_tail.is_empty() {
                    "no diagnostic output".to_string()
                } else {
                    stderr_tail.join("\n")
                };
                Err(Error::tool(name, format!("exited with {s}: {diagnostics}")))
            }
            None => Err(Error::Internal("supervised process finished without exit status".into())),
        }
    }
}

async fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    // ffmpeg terminates stats lines with '\r'; split on both.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                for part in text.split('\r') {
                    let part = part.trim_end_matches('\n');
                    if part.is_empty() {
                        continue;
                    }
                    if tx.send((stream, part.to_string())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill child process");
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}
