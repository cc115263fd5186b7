//! Inner process orchestration
//!
//! A [`ProcessOrchestrator`] starts the inner process and runs four tasks
//! alongside a single control loop:
//!
//! - stdout forwarder: process stdout to the client output sink
//! - stderr forwarder: process stderr to the client error sink
//! - stdin forwarder: splits client input into lines for the control loop
//! - exit watcher: reaps the process and publishes its [`ExitStatus`]
//!
//! The control loop waits for whichever comes first of process exit, the
//! next input line, a task failure or cancellation. Lines are written to the
//! process's stdin by the loop itself, so lines from the client stream and
//! from [`LineSender`]s are never interleaved mid-line.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use replmux_stream::{BUF_SIZE, BoxReader, MuxError, SharedSink};
use replmux_util::{Logger, SessionId};

use crate::{CommandLine, ExitStatus, HostError, HostResult, ManagedProcess, ProcessGroup, StopMode};

/// Lines queued for stdin before the stdin forwarder waits
const LINE_QUEUE_DEPTH: usize = 64;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Chunk size for the output forwarders and the input line reader
    pub buffer_size: usize,
    /// Grace period between stdin close, SIGTERM and SIGKILL
    pub stop_timeout: Duration,
    /// Time granted to the output forwarders once the process is gone
    pub drain_timeout: Duration,
    /// Added to the inherited environment
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub logger: Logger,
    pub cancel: CancellationToken,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            buffer_size: BUF_SIZE,
            stop_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_millis(500),
            env: HashMap::new(),
            cwd: None,
            logger: Logger::discard(),
            cancel: CancellationToken::new(),
        }
    }
}

/// The client side of a session
pub struct ClientStreams {
    /// Line-oriented input forwarded to the process's stdin
    pub input: BoxReader,
    /// Receives the process's stdout
    pub output: SharedSink,
    /// Receives the process's stderr
    pub error: SharedSink,
}

/// How a session ended without failing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The process exited on its own
    Exited(ExitStatus),
    /// Client input reached EOF and the process was stopped.
    /// `None` if it could not be reaped within the stop timeouts.
    InputClosed(Option<ExitStatus>),
    /// The session was cancelled and the process was stopped
    Cancelled(Option<ExitStatus>),
}

impl SessionOutcome {
    pub fn exit_status(&self) -> Option<&ExitStatus> {
        match self {
            SessionOutcome::Exited(status) => Some(status),
            SessionOutcome::InputClosed(status) | SessionOutcome::Cancelled(status) => {
                status.as_ref()
            }
        }
    }
}

enum Input {
    Line(Vec<u8>),
    Closed,
}

/// Queues lines for the session's stdin.
///
/// Cloneable; every clone feeds the same control loop.
#[derive(Debug, Clone)]
pub struct LineSender {
    tx: mpsc::Sender<Input>,
}

impl LineSender {
    /// Queue one line. A single trailing newline is dropped; the line is
    /// written to stdin with exactly one newline appended. A line with an
    /// embedded newline is rejected with `InvalidInput`.
    pub async fn send_line(&self, line: impl Into<Vec<u8>>) -> HostResult<()> {
        let mut line = line.into();
        trim_line_ending(&mut line);
        if line.contains(&b'\n') {
            return Err(HostError::InvalidInput("line contains an embedded newline".into()));
        }
        self.send(Input::Line(line)).await
    }

    /// End client input, as if the client stream reached EOF
    pub async fn close_input(&self) -> HostResult<()> {
        self.send(Input::Closed).await
    }

    async fn send(&self, input: Input) -> HostResult<()> {
        self.tx
            .send(input)
            .await
            .map_err(|_| HostError::Mux(MuxError::Closed))
    }
}

/// Spawns and supervises one inner process (state: created)
#[derive(Debug)]
pub struct ProcessOrchestrator {
    command: CommandLine,
    options: OrchestratorOptions,
    session_id: SessionId,
}

impl ProcessOrchestrator {
    /// Tokenize `command`; fails with `InvalidCommand` before anything runs
    pub fn new(command: &str) -> HostResult<Self> {
        Self::with_options(command, OrchestratorOptions::default())
    }

    pub fn with_options(command: &str, options: OrchestratorOptions) -> HostResult<Self> {
        Ok(Self {
            command: CommandLine::parse(command)?,
            options,
            session_id: SessionId::new(),
        })
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Spawn the process and every session task, then return (state: running)
    pub fn start(self, client: ClientStreams) -> HostResult<RunningSession> {
        let Self {
            command,
            options,
            session_id,
        } = self;

        let mut process = ManagedProcess::spawn(&command, &options.env, options.cwd.as_deref())?;
        let pid = process.pid();
        let group = process.group();

        let stdio = match process.take_stdio() {
            Ok(stdio) => stdio,
            Err(e) => {
                if let Err(stop_err) = group.kill() {
                    warn!(error = %stop_err, "Failed to kill process after setup failure");
                }
                return Err(e);
            }
        };

        info!(
            session_id = %session_id,
            pid = pid,
            command = %command,
            "Session started"
        );
        let logger = options.logger.child(&format!("session-{}", session_id.short()));
        logger.log(format!("started {} (pid {})", command, pid));

        let cancel = options.cancel.child_token();
        let input_stop = cancel.child_token();
        let output_stop = CancellationToken::new();
        let buffer_size = options.buffer_size.max(1);

        let (line_tx, line_rx) = mpsc::channel(LINE_QUEUE_DEPTH);
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let forwarders = vec![
            tokio::spawn(forward_output(
                stdio.stdout,
                client.output,
                buffer_size,
                logger.child("stdout"),
                output_stop.clone(),
                failure_tx.clone(),
            )),
            tokio::spawn(forward_output(
                stdio.stderr,
                client.error,
                buffer_size,
                logger.child("stderr"),
                output_stop.clone(),
                failure_tx.clone(),
            )),
        ];

        tokio::spawn(read_lines(
            client.input,
            LineSender {
                tx: line_tx.clone(),
            },
            buffer_size,
            logger.child("stdin"),
            input_stop.clone(),
            failure_tx.clone(),
        ));

        tokio::spawn(watch_exit(process, exit_tx, failure_tx, logger.clone()));

        let supervisor = Supervisor {
            session_id: session_id.clone(),
            group,
            stdin: Some(stdio.stdin),
            lines: line_rx,
            failures: failure_rx,
            exit: exit_rx,
            forwarders,
            cancel: cancel.clone(),
            input_stop,
            output_stop,
            stop_timeout: options.stop_timeout,
            drain_timeout: options.drain_timeout,
            logger,
        };

        Ok(RunningSession {
            session_id,
            pid,
            lines: LineSender { tx: line_tx },
            task: tokio::spawn(supervisor.run()),
            _guard: cancel.clone().drop_guard(),
            cancel,
        })
    }

    /// `start` then `wait`
    pub async fn run(self, client: ClientStreams) -> HostResult<SessionOutcome> {
        self.start(client)?.wait().await
    }
}

/// A started session.
///
/// Dropping it cancels the session, which stops the process group.
pub struct RunningSession {
    session_id: SessionId,
    pid: u32,
    lines: LineSender,
    cancel: CancellationToken,
    task: JoinHandle<HostResult<SessionOutcome>>,
    _guard: DropGuard,
}

impl RunningSession {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Entry point for delivering lines from outside the client input stream
    pub fn line_sender(&self) -> LineSender {
        self.lines.clone()
    }

    /// Request shutdown: SIGTERM, then SIGKILL after the stop timeout
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session to end (state: terminated, cancelled or failed)
    pub async fn wait(self) -> HostResult<SessionOutcome> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(HostError::Internal(format!("session task failed: {}", e))),
        }
    }
}

impl std::fmt::Debug for RunningSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningSession")
            .field("session_id", &self.session_id)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Why the control loop stopped
enum Stop {
    Exited(ExitStatus),
    InputClosed,
    Cancelled,
    Failed(HostError),
}

struct Supervisor {
    session_id: SessionId,
    group: ProcessGroup,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<Input>,
    failures: mpsc::UnboundedReceiver<HostError>,
    exit: watch::Receiver<Option<ExitStatus>>,
    forwarders: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    input_stop: CancellationToken,
    output_stop: CancellationToken,
    stop_timeout: Duration,
    drain_timeout: Duration,
    logger: Logger,
}

impl Supervisor {
    async fn run(mut self) -> HostResult<SessionOutcome> {
        let stop = self.control_loop().await;
        self.input_stop.cancel();

        let result = match stop {
            Stop::Exited(status) => {
                info!(session_id = %self.session_id, status = %status, "Process exited");
                Ok(SessionOutcome::Exited(status))
            }
            Stop::InputClosed => {
                debug!(session_id = %self.session_id, "Client input closed, stopping process");
                self.logger.log("input closed, stopping process");
                // Closing stdin is the polite way to end most REPLs
                self.stdin = None;
                let status = match self.await_exit(self.stop_timeout).await {
                    Some(status) => Some(status),
                    None => {
                        self.stop(StopMode::Graceful {
                            timeout: self.stop_timeout,
                        })
                        .await
                    }
                };
                Ok(SessionOutcome::InputClosed(status))
            }
            Stop::Cancelled => {
                info!(session_id = %self.session_id, "Session cancelled");
                self.logger.log("cancelled");
                self.stdin = None;
                let status = self
                    .stop(StopMode::Graceful {
                        timeout: self.stop_timeout,
                    })
                    .await;
                Ok(SessionOutcome::Cancelled(status))
            }
            Stop::Failed(err) => {
                warn!(session_id = %self.session_id, error = %err, "Session failed");
                self.logger.log(format!("failed: {}", err));
                self.stdin = None;
                self.stop(StopMode::Graceful {
                    timeout: self.stop_timeout,
                })
                .await;
                Err(err)
            }
        };

        self.drain().await;
        self.logger.log("session ended");
        result
    }

    async fn control_loop(&mut self) -> Stop {
        loop {
            let input = tokio::select! {
                biased;
                Some(err) = self.failures.recv() => return Stop::Failed(err),
                status = wait_for_exit(&mut self.exit) => return exited(status),
                _ = self.cancel.cancelled() => return Stop::Cancelled,
                input = self.lines.recv() => input,
            };

            let line = match input {
                Some(Input::Line(line)) => line,
                Some(Input::Closed) | None => return Stop::InputClosed,
            };

            let Some(stdin) = self.stdin.as_mut() else {
                continue;
            };

            let written = tokio::select! {
                biased;
                status = wait_for_exit(&mut self.exit) => return exited(status),
                _ = self.cancel.cancelled() => return Stop::Cancelled,
                written = write_line(stdin, &line) => written,
            };

            match written {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    // The process closed its stdin; the exit watcher reports the rest
                    debug!(session_id = %self.session_id, "Process stdin closed, dropping input");
                    self.logger.log("process stdin closed");
                    self.stdin = None;
                }
                Err(e) => return Stop::Failed(HostError::Stream(e)),
            }
        }
    }

    /// Signal the process group per `mode` and wait for the exit status
    async fn stop(&mut self, mode: StopMode) -> Option<ExitStatus> {
        if let StopMode::Graceful { timeout } = mode {
            if let Err(e) = self.group.terminate() {
                warn!(session_id = %self.session_id, error = %e, "SIGTERM failed");
            }
            if let Some(status) = self.await_exit(timeout).await {
                return Some(status);
            }
            debug!(session_id = %self.session_id, "Process ignored SIGTERM, killing");
        }

        if let Err(e) = self.group.kill() {
            warn!(session_id = %self.session_id, error = %e, "SIGKILL failed");
        }
        let status = self.await_exit(self.stop_timeout).await;
        if status.is_none() {
            warn!(session_id = %self.session_id, pgid = self.group.id(), "Process was not reaped");
        }
        status
    }

    async fn await_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        tokio::time::timeout(timeout, wait_for_exit(&mut self.exit))
            .await
            .ok()
            .flatten()
    }

    /// Give the output forwarders `drain_timeout` to deliver what the
    /// process wrote before exiting, then stop them.
    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        let mut pending = Vec::new();
        for mut handle in self.forwarders.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Output forwarder failed"),
                Err(_) => pending.push(handle),
            }
        }

        self.output_stop.cancel();
        if !pending.is_empty() {
            debug!(session_id = %self.session_id, "Output still open after drain timeout");
        }
        for handle in pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "Output forwarder failed");
            }
        }

        while let Ok(err) = self.failures.try_recv() {
            debug!(session_id = %self.session_id, error = %err, "Stream error after session end");
        }
    }
}

fn exited(status: Option<ExitStatus>) -> Stop {
    match status {
        Some(status) => Stop::Exited(status),
        None => Stop::Failed(HostError::Internal("exit watcher stopped".into())),
    }
}

/// Resolves once the watcher published a status; `None` if it never will
async fn wait_for_exit(exit: &mut watch::Receiver<Option<ExitStatus>>) -> Option<ExitStatus> {
    match exit.wait_for(Option::is_some).await {
        Ok(status) => status.clone(),
        Err(_) => None,
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &[u8]) -> io::Result<()> {
    stdin.write_all(line).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

fn trim_line_ending(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
}

async fn watch_exit(
    mut process: ManagedProcess,
    exit: watch::Sender<Option<ExitStatus>>,
    failures: mpsc::UnboundedSender<HostError>,
    logger: Logger,
) {
    match process.wait().await {
        Ok(status) => {
            logger.log(format!("process exited with {}", status));
            exit.send_replace(Some(status));
        }
        Err(e) => {
            logger.log(format!("wait failed: {}", e));
            let _ = failures.send(e);
        }
    }
}

async fn forward_output(
    mut source: impl AsyncRead + Unpin,
    sink: SharedSink,
    buffer_size: usize,
    logger: Logger,
    stop: CancellationToken,
    failures: mpsc::UnboundedSender<HostError>,
) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        let read = tokio::select! {
            _ = stop.cancelled() => return,
            read = source.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                logger.log("closed");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                logger.log(format!("read failed: {}", e));
                let _ = failures.send(HostError::Stream(e));
                return;
            }
        };

        let written = tokio::select! {
            _ = stop.cancelled() => return,
            written = sink.write(&buf[..n]) => written,
        };
        if let Err(e) = written {
            logger.log(format!("write failed: {}", e));
            let _ = failures.send(HostError::Stream(e));
            return;
        }
    }
}

async fn read_lines(
    input: BoxReader,
    lines: LineSender,
    buffer_size: usize,
    logger: Logger,
    stop: CancellationToken,
    failures: mpsc::UnboundedSender<HostError>,
) {
    let mut reader = BufReader::with_capacity(buffer_size, input);

    loop {
        let mut line = Vec::new();
        let read = tokio::select! {
            _ = stop.cancelled() => return,
            read = reader.read_until(b'\n', &mut line) => read,
        };

        let input = match read {
            Ok(0) => {
                logger.log("client input reached EOF");
                Input::Closed
            }
            Ok(_) => {
                trim_line_ending(&mut line);
                Input::Line(line)
            }
            Err(e) => {
                logger.log(format!("read failed: {}", e));
                let _ = failures.send(HostError::Stream(e));
                return;
            }
        };

        let closed = matches!(input, Input::Closed);
        let sent = tokio::select! {
            _ = stop.cancelled() => return,
            sent = lines.send(input) => sent,
        };
        if sent.is_err() || closed {
            return;
        }
    }
}
