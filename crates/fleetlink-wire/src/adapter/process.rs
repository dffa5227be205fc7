//! Process-injection adapter: the hub owns the engine process.
//!
//! Commands are written to the child's stdin. Output lines from stdout and
//! stderr are prefix-stripped, scanned for known log patterns (which become
//! events) and otherwise collected as command output.
//!
//! Completion is detected by silence: a command is done once no output has
//! arrived for the settle window. Unrelated log lines printed inside that
//! window are attributed to the command; lines that match an event pattern
//! are kept out of the output, nothing else is. A command whose output has
//! gaps longer than the settle window is cut short.

use super::log_patterns::LogPatterns;
use super::shared::AdapterCore;
use super::{AdapterContext, AdapterEvent, ConnectionAdapter, ConnectionState};
use async_trait::async_trait;
use fleetlink_types::capability::{Capability, CapabilitySet};
use fleetlink_types::command::CommandResult;
use fleetlink_types::config::TransportKind;
use fleetlink_types::error::{FleetError, FleetResult};
use fleetlink_types::message::{ops, Message, MessageType};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cap on lines collected for a single command.
const MAX_CAPTURE_LINES: usize = 1000;

/// How long to wait for exit after a kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Launch parameters for the engine process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub stop_command: String,
    pub settle: Duration,
    pub shutdown_grace: Duration,
}

/// I/O state shared with the reader and exit-watcher tasks.
struct ProcessIo {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    capture: Mutex<Option<Vec<String>>>,
    last_output: Mutex<Instant>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessIo {
    fn new() -> Self {
        Self {
            stdin: tokio::sync::Mutex::new(None),
            capture: Mutex::new(None),
            last_output: Mutex::new(Instant::now()),
            kill: Mutex::new(None),
        }
    }

    fn touch_output(&self) {
        *self.last_output.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last_output(&self) -> Instant {
        *self.last_output.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin_capture(&self) {
        *self.capture.lock().unwrap_or_else(|e| e.into_inner()) = Some(Vec::new());
    }

    fn end_capture(&self) -> Vec<String> {
        self.capture
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_default()
    }

    fn capture_line(&self, line: &str) {
        let mut guard = self.capture.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lines) = guard.as_mut() {
            if lines.len() < MAX_CAPTURE_LINES {
                lines.push(line.to_string());
            }
        }
    }

    fn request_kill(&self) {
        if let Some(tx) = self.kill.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }

    async fn write_line(&self, line: &str) -> FleetResult<()> {
        if line.contains(['\r', '\n']) {
            return Err(FleetError::InvalidCommand(
                "console input must be a single line".to_string(),
            ));
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(FleetError::ConnectionClosed)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Drives an engine process through its console.
pub struct ProcessAdapter {
    spec: ProcessSpec,
    core: Arc<AdapterCore>,
    io: Arc<ProcessIo>,
    patterns: Arc<LogPatterns>,
    command_gate: tokio::sync::Mutex<()>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ProcessAdapter {
    pub fn new(ctx: AdapterContext, spec: ProcessSpec) -> Self {
        Self {
            spec,
            core: Arc::new(AdapterCore::new(ctx.server_id, ctx.events)),
            io: Arc::new(ProcessIo::new()),
            patterns: Arc::new(LogPatterns::new()),
            command_gate: tokio::sync::Mutex::new(()),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn spawn_reader<R>(&self, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        let io = Arc::clone(&self.io);
        let patterns = Arc::clone(&self.patterns);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(server_id = %core.server_id, error = %e, "Console read failed");
                        break;
                    }
                }
                core.touch();
                io.touch_output();
                // Engines print Latin-1 player names; decode lossily.
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                let body = patterns.strip_prefix(line);
                match patterns.scan(body) {
                    Some(ev) => {
                        debug!(server_id = %core.server_id, op = ev.op, "log event");
                        let msg = Message::event(ev.op, ev.data).with_server_id(core.server_id.clone());
                        core.emit(AdapterEvent::Message(msg));
                    }
                    None => io.capture_line(body),
                }
            }
        });
    }
}

#[async_trait]
impl ConnectionAdapter for ProcessAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    fn capabilities(&self) -> CapabilitySet {
        [
            Capability::CommandExecution,
            Capability::ConsoleAccess,
            Capability::ProcessControl,
            Capability::LogMonitoring,
        ]
        .into()
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    async fn connect(&self) -> FleetResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.core.set_state(ConnectionState::Connecting);

        let mut cmd = tokio::process::Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                self.core.set_state(ConnectionState::Disconnected);
                return Err(FleetError::Connection(format!(
                    "failed to start '{}': {e}",
                    self.spec.command
                )));
            }
        };
        info!(
            server_id = %self.core.server_id,
            command = %self.spec.command,
            pid = child.id().unwrap_or_default(),
            "Started engine process"
        );

        let generation = self.core.begin();
        *self.io.stdin.lock().await = child.stdin.take();
        self.io.touch_output();
        let (kill_tx, kill_rx) = oneshot::channel();
        *self.io.kill.lock().unwrap_or_else(|e| e.into_inner()) = Some(kill_tx);

        self.core.mark_connected();

        if let Some(out) = child.stdout.take() {
            self.spawn_reader(out);
        }
        if let Some(err) = child.stderr.take() {
            self.spawn_reader(err);
        }

        let core = Arc::clone(&self.core);
        let io = Arc::clone(&self.io);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            io.stdin.lock().await.take();
            let reason = match status {
                Ok(s) => format!("process exited ({s})"),
                Err(e) => format!("process wait failed: {e}"),
            };
            core.closed(generation, &reason);
        });

        Ok(())
    }

    async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        let generation = self.core.generation();
        self.core.mark_closing();

        if let Err(e) = self.io.write_line(&self.spec.stop_command).await {
            debug!(server_id = %self.core.server_id, error = %e, "stop command not delivered");
        }
        if self.core.wait_disconnected(self.spec.shutdown_grace).await {
            return;
        }

        warn!(
            server_id = %self.core.server_id,
            grace_ms = self.spec.shutdown_grace.as_millis() as u64,
            "Engine did not stop in time, killing"
        );
        self.io.request_kill();
        if !self.core.wait_disconnected(KILL_GRACE).await {
            self.core.closed(generation, "killed");
        }
    }

    async fn send_message(&self, msg: Message) -> FleetResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(FleetError::ConnectionClosed);
        }
        match (msg.kind, msg.op.as_str(), msg.data_str("command")) {
            (MessageType::Request, ops::SERVER_COMMAND, Some(command)) => {
                self.io.write_line(command).await
            }
            _ => Err(FleetError::CapabilityDenied(Capability::RealtimeEvents)),
        }
    }

    async fn send_command(&self, command: &str, timeout: Duration) -> CommandResult {
        let started = Instant::now();
        if self.state() != ConnectionState::Connected {
            return CommandResult::failed(FleetError::ConnectionClosed.to_string(), started.elapsed());
        }
        let deadline = started + timeout;
        let _gate = match tokio::time::timeout_at(deadline, self.command_gate.lock()).await {
            Ok(g) => g,
            Err(_) => {
                return CommandResult::failed(
                    FleetError::CommandTimeout {
                        command: command.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .to_string(),
                    started.elapsed(),
                )
            }
        };

        self.io.begin_capture();
        if let Err(e) = self.io.write_line(command).await {
            self.io.end_capture();
            return CommandResult::failed(e.to_string(), started.elapsed());
        }
        let submitted = Instant::now();
        debug!(server_id = %self.core.server_id, command, "command written to console");

        loop {
            let settle_at = self.io.last_output().max(submitted) + self.spec.settle;
            let now = Instant::now();
            if now >= settle_at {
                break;
            }
            if now >= deadline {
                let partial = self.io.end_capture();
                return CommandResult::failed(
                    FleetError::CommandTimeout {
                        command: command.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .to_string(),
                    started.elapsed(),
                )
                .with_output(partial);
            }
            tokio::time::sleep_until(settle_at.min(deadline)).await;
        }

        CommandResult::ok(self.io.end_capture(), started.elapsed())
    }

    fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}
