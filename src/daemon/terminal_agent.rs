//! One CLI session in a PTY, observed into a structured state signal.
//!
//! The child always gets reaped and the PTY released before the terminal
//! event goes out, so a dead agent can never leave a zombie behind.

use crate::config::DaemonConfig;
use crate::daemon::observer::{Classification, ObserverClient};
use crate::llm::LlmError;
use crate::protocol::ObservedStatus;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, PtySize};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Observer retries per classification before counting an outage.
const OBSERVER_ATTEMPTS: u32 = 3;

/// Continuous classifier outage that fails the agent.
const OBSERVER_OUTAGE: Duration = Duration::from_secs(30);

/// Wire-visible cap on streamed log lines.
const MAX_LOG_LINES_PER_SEC: u32 = 50;

/// Per-agent session knobs.
#[derive(Debug, Clone)]
pub struct TerminalAgentConfig {
    pub cli_binary: String,
    pub cli_args: Vec<String>,
    pub rows: u16,
    pub cols: u16,
    /// Rolling window handed to the observer.
    pub window_bytes: usize,
    /// Newline quiescence before classifying fresh output.
    pub quiescence: Duration,
    /// New-output volume that forces a classification.
    pub burst_bytes: usize,
    /// Idle reclassification period.
    pub idle_tick: Duration,
    /// Natural-exit wait after the polite interrupt.
    pub kill_wait: Duration,
}

impl Default for TerminalAgentConfig {
    fn default() -> Self {
        Self {
            cli_binary: "claude".to_string(),
            cli_args: vec!["--dangerously-skip-permissions".to_string()],
            rows: 40,
            cols: 120,
            window_bytes: 8 * 1024,
            quiescence: Duration::from_millis(500),
            burst_bytes: 2 * 1024,
            idle_tick: Duration::from_secs(2),
            kill_wait: Duration::from_secs(3),
        }
    }
}

impl TerminalAgentConfig {
    pub fn from_daemon(config: &DaemonConfig) -> Self {
        Self {
            cli_binary: config.cli_binary.clone(),
            cli_args: config.cli_args.clone(),
            ..Self::default()
        }
    }
}

/// Upstream reporting seam. Production forwards to the server link; tests
/// capture.
pub trait AgentReporter: Send + Sync {
    fn status(&self, agent_id: &str, status: ObservedStatus, observation: Option<String>);
    fn log(&self, agent_id: &str, line: String);
    fn complete(&self, agent_id: &str, result: Option<String>, error: Option<String>);
}

pub struct TerminalAgent {
    config: TerminalAgentConfig,
    observer: Arc<dyn ObserverClient>,
    reporter: Arc<dyn AgentReporter>,
}

impl TerminalAgent {
    pub fn new(
        config: TerminalAgentConfig,
        observer: Arc<dyn ObserverClient>,
        reporter: Arc<dyn AgentReporter>,
    ) -> Self {
        Self {
            config,
            observer,
            reporter,
        }
    }

    /// Execute one session to completion. Exactly one `complete` is reported,
    /// after the child is reaped and the PTY handles are gone.
    pub async fn run(
        &self,
        agent_id: &str,
        goal: &str,
        working_directory: Option<&str>,
        stream_logs: bool,
        cancel: CancellationToken,
    ) {
        if let Some(wd) = working_directory {
            if !Path::new(wd).is_dir() {
                self.reporter.complete(
                    agent_id,
                    None,
                    Some(format!("spawn_failed: working directory '{wd}' does not exist")),
                );
                return;
            }
        }

        let pty_system = native_pty_system();
        let pair = match pty_system.openpty(PtySize {
            rows: self.config.rows,
            cols: self.config.cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            Ok(pair) => pair,
            Err(e) => {
                self.reporter
                    .complete(agent_id, None, Some(format!("spawn_failed: {e}")));
                return;
            }
        };

        let mut cmd = CommandBuilder::new(&self.config.cli_binary);
        cmd.args(&self.config.cli_args);
        cmd.arg(goal);
        cmd.env("TERM", "xterm-256color");
        cmd.env("NO_COLOR", "1");
        if let Some(wd) = working_directory {
            cmd.cwd(wd);
        }

        let child = match pair.slave.spawn_command(cmd) {
            Ok(child) => child,
            Err(e) => {
                self.reporter
                    .complete(agent_id, None, Some(format!("spawn_failed: {e}")));
                return;
            }
        };
        drop(pair.slave);

        let child_pid = child.process_id();
        let killer = child.clone_killer();
        let master = pair.master;

        let reader = match master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                teardown(child, killer, child_pid, master, self.config.kill_wait).await;
                self.reporter
                    .complete(agent_id, None, Some(format!("spawn_failed: {e}")));
                return;
            }
        };

        tracing::info!(agent_id = %agent_id, binary = %self.config.cli_binary, "Terminal agent started");

        // Blocking reader thread feeding the async loop. Dies on EOF.
        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(64);
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let session = self
            .observe_session(agent_id, chunk_rx, stream_logs, &cancel)
            .await;

        let exit_status = teardown(child, killer, child_pid, master, self.config.kill_wait).await;

        let (result, error) = match session.outcome {
            SessionOutcome::Classified(Classification::Success { summary }) => (Some(summary), None),
            SessionOutcome::Classified(Classification::Failure { summary }) => (None, Some(summary)),
            SessionOutcome::Classified(_) => unreachable!("non-terminal classification as outcome"),
            SessionOutcome::Killed => (None, Some("killed".to_string())),
            SessionOutcome::ObserverOutage(e) => {
                (None, Some(format!("observer_unavailable: {e}")))
            }
            SessionOutcome::Eof => self.classify_after_eof(&session.window, exit_status).await,
        };

        tracing::info!(
            agent_id = %agent_id,
            success = error.is_none(),
            "Terminal agent finished"
        );
        self.reporter.complete(agent_id, result, error);
    }

    /// Core observation loop. Returns with the window contents and the reason
    /// it ended.
    async fn observe_session(
        &self,
        agent_id: &str,
        mut chunks: mpsc::Receiver<Vec<u8>>,
        stream_logs: bool,
        cancel: &CancellationToken,
    ) -> Session {
        let mut window = String::new();
        let mut carry: Vec<u8> = Vec::new();
        let mut pending_bytes = 0usize;
        let mut last_chunk_at = Instant::now();
        let mut last_classified_at = Instant::now();
        let mut last_working: Option<String> = None;
        let mut observer_down_since: Option<Instant> = None;
        let mut log_second = Instant::now();
        let mut log_lines = 0u32;

        loop {
            let mut should_classify = false;

            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(bytes) => {
                        let text = decode_chunk(&mut carry, &bytes);
                        if !text.is_empty() {
                            if stream_logs {
                                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                                    if log_second.elapsed() >= Duration::from_secs(1) {
                                        log_second = Instant::now();
                                        log_lines = 0;
                                    }
                                    if log_lines < MAX_LOG_LINES_PER_SEC {
                                        log_lines += 1;
                                        self.reporter.log(agent_id, line.to_string());
                                    }
                                }
                            }
                            pending_bytes += text.len();
                            window.push_str(&text);
                            trim_window(&mut window, self.config.window_bytes);
                        }
                        last_chunk_at = Instant::now();
                        if pending_bytes >= self.config.burst_bytes {
                            should_classify = true;
                        }
                    }
                    None => {
                        return Session { window, outcome: SessionOutcome::Eof };
                    }
                },
                () = tokio::time::sleep(Duration::from_millis(100)) => {
                    let quiesced = pending_bytes > 0
                        && last_chunk_at.elapsed() >= self.config.quiescence;
                    let idle = !window.is_empty()
                        && last_classified_at.elapsed() >= self.config.idle_tick;
                    should_classify = quiesced || idle;
                }
                () = cancel.cancelled() => {
                    return Session { window, outcome: SessionOutcome::Killed };
                }
            }

            if !should_classify {
                continue;
            }

            match self.classify_with_retries(&window).await {
                Ok(classification) => {
                    observer_down_since = None;
                    pending_bytes = 0;
                    last_classified_at = Instant::now();
                    match classification {
                        Classification::Working { observation } => {
                            // Successive identical observations coalesce.
                            if last_working.as_deref() != Some(observation.as_str()) {
                                self.reporter.status(
                                    agent_id,
                                    ObservedStatus::Running,
                                    Some(observation.clone()),
                                );
                                last_working = Some(observation);
                            }
                        }
                        Classification::AwaitingInput { prompt } => {
                            last_working = None;
                            self.reporter.status(
                                agent_id,
                                ObservedStatus::AwaitingInput,
                                Some(prompt),
                            );
                        }
                        terminal => {
                            return Session {
                                window,
                                outcome: SessionOutcome::Classified(terminal),
                            };
                        }
                    }
                }
                Err(e) => {
                    let down_since = *observer_down_since.get_or_insert_with(Instant::now);
                    if down_since.elapsed() >= OBSERVER_OUTAGE {
                        return Session {
                            window,
                            outcome: SessionOutcome::ObserverOutage(e),
                        };
                    }
                    tracing::warn!(agent_id = %agent_id, error = %e, "Observer call failed, will retry");
                    last_classified_at = Instant::now();
                }
            }
        }
    }

    async fn classify_with_retries(&self, window: &str) -> Result<Classification, LlmError> {
        let mut attempt = 0;
        loop {
            match self.observer.classify(window).await {
                Ok(classification) => return Ok(classification),
                Err(_) if attempt + 1 < OBSERVER_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(200 * (1 << attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The child exited on its own: one final classification over the full
    /// window, with the exit status as arbiter when the observer is unsure.
    async fn classify_after_eof(
        &self,
        window: &str,
        exit_status: Option<ExitStatus>,
    ) -> (Option<String>, Option<String>) {
        if !window.trim().is_empty() {
            match self.classify_with_retries(window).await {
                Ok(Classification::Success { summary }) => return (Some(summary), None),
                Ok(Classification::Failure { summary }) => return (None, Some(summary)),
                Ok(_) | Err(_) => {}
            }
        }

        match exit_status {
            Some(status) if status.success() => {
                (Some(tail(window, 2000).to_string()), None)
            }
            Some(status) => (
                None,
                Some(format!("process exited unsuccessfully ({status:?})")),
            ),
            None => (None, Some("process exited before it could be reaped".to_string())),
        }
    }
}

struct Session {
    window: String,
    outcome: SessionOutcome,
}

enum SessionOutcome {
    Classified(Classification),
    Killed,
    ObserverOutage(LlmError),
    Eof,
}

/// Polite interrupt, bounded natural-exit wait, force kill, reap, release.
async fn teardown(
    child: Box<dyn Child + Send + Sync>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    child_pid: Option<u32>,
    master: Box<dyn portable_pty::MasterPty + Send>,
    kill_wait: Duration,
) -> Option<ExitStatus> {
    tokio::task::spawn_blocking(move || {
        let mut child = child;
        let mut killer = killer;

        if child.try_wait().ok().flatten().is_none() {
            #[cfg(unix)]
            if let Some(pid) = child_pid {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
            }

            let deadline = std::time::Instant::now() + kill_wait;
            while std::time::Instant::now() < deadline {
                if child.try_wait().ok().flatten().is_some() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            if child.try_wait().ok().flatten().is_none() {
                let _ = killer.kill();
            }
        }

        // Reap the child and release the PTY before anything is reported.
        let status = child.wait().ok();
        drop(master);
        status
    })
    .await
    .ok()
    .flatten()
}

/// Decode a raw PTY chunk: carry incomplete UTF-8 across reads and strip
/// ANSI escape sequences.
fn decode_chunk(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    let mut buf = std::mem::take(carry);
    buf.extend_from_slice(bytes);

    let valid_up_to = match std::str::from_utf8(&buf) {
        Ok(_) => buf.len(),
        Err(e) => e.valid_up_to(),
    };
    *carry = buf[valid_up_to..].to_vec();
    let text = String::from_utf8_lossy(&buf[..valid_up_to]).to_string();
    strip_ansi(&text)
}

/// Strip CSI and OSC escape sequences.
fn strip_ansi(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\x1b' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                for next in chars.by_ref() {
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(next) = chars.next() {
                    if next == '\x07' {
                        break;
                    }
                    if next == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    result
}

/// Keep the last `max` bytes, respecting char boundaries.
fn trim_window(window: &mut String, max: usize) {
    if window.len() <= max {
        return;
    }
    let mut cut = window.len() - max;
    while !window.is_char_boundary(cut) {
        cut += 1;
    }
    window.drain(..cut);
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut cut = s.len() - max;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    &s[cut..]
}
