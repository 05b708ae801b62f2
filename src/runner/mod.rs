// Simulation Runner
//
// Owns exactly one child process per simulation and its four work units:
// stdout pump, stderr pump, stdin writer, timeout timer.
//
// Event Contract Guarantees:
// 1. start → simulation_status running; exactly ONE stopped terminal event
// 2. stderr-derived events reach the session in child write order
// 3. stop() is idempotent; resources are released even if the child
//    already exited
// 4. timeout: soft signal at deadline, hard kill after the grace period,
//    with a synthetic "--- Simulation timeout ---" serial line

use crate::pins::{PinMode, PinRecord};
use crate::protocol::{parse_line, HostCommand, ParsedLine, Sideband};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Wait after the soft termination signal before the hard kill
pub const SOFT_KILL_GRACE: Duration = Duration::from_millis(500);

/// Depth of the host-command queue feeding the stdin writer
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Simulation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimStatus {
    Stopped,
    Compiling,
    Running,
    Paused,
}

/// Events a runner feeds to its owning session
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Status(SimStatus),
    /// Structured serial bytes from the child, with its write timestamp
    Serial { ts_write: u64, payload: Vec<u8> },
    /// Legacy raw stdout line (and synthetic system messages)
    RawSerial(String),
    PinMode { pin: String, mode: PinMode },
    PinValue { pin: String, value: i32 },
    PinPwm { pin: String, value: u8 },
    /// A complete IO_REGISTRY_START..END snapshot
    IoRegistry(Vec<PinRecord>),
    /// The child could not be spawned at all
    SpawnFailed(String),
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub binary: PathBuf,
    /// Lines above the user's code in the compiled unit; exported to the
    /// child so registry line numbers come back user-facing
    pub line_offset: u32,
    /// Zero means run until stopped
    pub timeout: Duration,
}

/// Handle to a running simulation. Dropping it does not stop the child;
/// call `stop()`.
pub struct SimRunner {
    cmd_tx: mpsc::Sender<HostCommand>,
    cancel: CancellationToken,
    terminal_sent: Arc<AtomicBool>,
}

impl SimRunner {
    /// Spawn the child and all pumps. Events flow into `events`; the
    /// channel's bound is the backpressure limit for the whole runner.
    pub fn start(cfg: RunnerConfig, events: mpsc::Sender<RunnerEvent>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let terminal_sent = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_simulation(
            cfg,
            events,
            cmd_rx,
            cancel.clone(),
            terminal_sent.clone(),
        ));

        Self {
            cmd_tx,
            cancel,
            terminal_sent,
        }
    }

    /// Request termination: soft signal, hard kill after the grace period.
    /// Safe to call any number of times.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }

    pub async fn pause(&self) {
        self.send(HostCommand::PauseTime).await;
    }

    pub async fn resume(&self, duration_ms: u64) {
        self.send(HostCommand::ResumeTime { duration_ms }).await;
    }

    pub async fn set_pin(&self, pin: String, value: i32) {
        self.send(HostCommand::SetPin { pin, value }).await;
    }

    pub async fn send_serial(&self, bytes: Vec<u8>) {
        self.send(HostCommand::Serial(bytes)).await;
    }

    async fn send(&self, command: HostCommand) {
        // Commands for a torn-down runner are discarded
        if self.cmd_tx.send(command).await.is_err() {
            log::debug!("runner command dropped: stdin writer gone");
        }
    }
}

// ==================== Child Supervision ====================

async fn run_simulation(
    cfg: RunnerConfig,
    events: mpsc::Sender<RunnerEvent>,
    cmd_rx: mpsc::Receiver<HostCommand>,
    cancel: CancellationToken,
    terminal_sent: Arc<AtomicBool>,
) {
    let mut child = match Command::new(&cfg.binary)
        .env("SKETCH_LINE_OFFSET", cfg.line_offset.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            log::warn!("simulation spawn failed: {}", e);
            let _ = events
                .send(RunnerEvent::SpawnFailed(format!(
                    "Failed to start simulation: {}",
                    e
                )))
                .await;
            emit_stopped(&events, &terminal_sent).await;
            return;
        }
    };

    let _ = events.send(RunnerEvent::Status(SimStatus::Running)).await;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // stdin writer: serializes commands, never interleaves half-lines.
    // write_all keeps retrying partial writes until done or broken pipe.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        let mut stdin = match stdin {
            Some(stdin) => stdin,
            None => return,
        };
        let mut cmd_rx = cmd_rx;
        loop {
            let command = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
                _ = writer_cancel.cancelled() => break,
            };
            if let Err(e) = stdin.write_all(&command.encode()).await {
                log::debug!("child stdin closed: {}", e);
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });

    // stderr pump: line-buffer, decode sideband events, forward in order
    let stderr_pump = {
        let events = events.clone();
        tokio::spawn(async move {
            if let Some(stderr) = stderr {
                pump_lines(BufReader::new(stderr), events, true).await;
            }
        })
    };

    // stdout pump: raw serial unless the codec says a line is framed
    let stdout_pump = {
        let events = events.clone();
        tokio::spawn(async move {
            if let Some(stdout) = stdout {
                pump_lines(BufReader::new(stdout), events, false).await;
            }
        })
    };

    // Supervisor: natural exit, user timeout, or cancellation
    let has_timeout = !cfg.timeout.is_zero();
    let mut timed_out = false;
    let mut cancelled = false;
    let mut exit_success = true;

    tokio::select! {
        status = child.wait() => {
            exit_success = status.map(|s| s.success()).unwrap_or(false);
        }
        _ = tokio::time::sleep(cfg.timeout), if has_timeout => {
            timed_out = true;
        }
        _ = cancel.cancelled() => {
            cancelled = true;
        }
    }

    if timed_out {
        let _ = events
            .send(RunnerEvent::RawSerial("--- Simulation timeout ---".to_string()))
            .await;
    }
    if timed_out || cancelled {
        terminate(&mut child).await;
    }

    // Pumps drain to EOF once the child is gone
    let _ = stderr_pump.await;
    let _ = stdout_pump.await;
    cancel.cancel();
    let _ = writer.await;

    if !timed_out && !cancelled && !exit_success {
        let _ = events
            .send(RunnerEvent::RawSerial("--- Simulation crashed ---".to_string()))
            .await;
    }

    emit_stopped(&events, &terminal_sent).await;
}

/// Emit the terminal status exactly once
async fn emit_stopped(events: &mpsc::Sender<RunnerEvent>, terminal_sent: &AtomicBool) {
    if !terminal_sent.swap(true, Ordering::SeqCst) {
        let _ = events.send(RunnerEvent::Status(SimStatus::Stopped)).await;
    }
}

/// Soft signal first, hard kill after the grace period, then reap
async fn terminate(child: &mut Child) {
    soft_kill(child);
    let deadline = tokio::time::sleep(SOFT_KILL_GRACE);
    tokio::pin!(deadline);
    tokio::select! {
        _ = child.wait() => {}
        _ = &mut deadline => {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(unix)]
fn soft_kill(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn soft_kill(_child: &Child) {
    // No soft phase without POSIX signals; the hard kill follows the grace
}

// ==================== Output Pumps ====================

/// Shared line pump for stdout and stderr. `sideband_channel` marks the
/// stream the child uses for protocol events; unframed lines on it are
/// process log, which still surfaces as raw serial.
async fn pump_lines<R>(reader: BufReader<R>, events: mpsc::Sender<RunnerEvent>, sideband_channel: bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    let mut last_pin_values: HashMap<String, i32> = HashMap::new();
    let mut registry_buffer: Option<Vec<PinRecord>> = None;

    while let Ok(Some(line)) = lines.next_line().await {
        match parse_line(&line) {
            ParsedLine::Event(event) => {
                if !forward_sideband(event, &events, &mut last_pin_values, &mut registry_buffer)
                    .await
                {
                    break;
                }
            }
            ParsedLine::Ignored => {
                log::debug!("ignored sideband line: {}", line);
            }
            ParsedLine::Log(text) => {
                if sideband_channel {
                    log::debug!("child log: {}", text);
                }
                if events.send(RunnerEvent::RawSerial(text)).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Map one decoded sideband event onto runner events. Returns false when
/// the session side is gone.
async fn forward_sideband(
    event: Sideband,
    events: &mpsc::Sender<RunnerEvent>,
    last_pin_values: &mut HashMap<String, i32>,
    registry_buffer: &mut Option<Vec<PinRecord>>,
) -> bool {
    let forwarded = match event {
        Sideband::PinMode { pin, mode } => events.send(RunnerEvent::PinMode { pin, mode }).await,
        Sideband::PinValue { pin, value } => {
            // Coalesce repeats: identical consecutive values are noise
            if last_pin_values.get(&pin) == Some(&value) {
                return true;
            }
            last_pin_values.insert(pin.clone(), value);
            events.send(RunnerEvent::PinValue { pin, value }).await
        }
        Sideband::PinPwm { pin, value } => events.send(RunnerEvent::PinPwm { pin, value }).await,
        Sideband::SerialEvent { ts_write, payload } => {
            events.send(RunnerEvent::Serial { ts_write, payload }).await
        }
        Sideband::IoRegistryStart => {
            *registry_buffer = Some(Vec::new());
            return true;
        }
        Sideband::IoPin(record) => {
            if let Some(buffer) = registry_buffer.as_mut() {
                buffer.push(record);
            }
            return true;
        }
        Sideband::IoRegistryEnd => match registry_buffer.take() {
            Some(pins) => events.send(RunnerEvent::IoRegistry(pins)).await,
            None => return true,
        },
        Sideband::TimeFrozen { ms } => {
            log::debug!("child froze virtual clock at {} ms", ms);
            events.send(RunnerEvent::Status(SimStatus::Paused)).await
        }
        Sideband::TimeResumed { offset_ms } => {
            log::debug!("child resumed, pause offset {} ms", offset_ms);
            events.send(RunnerEvent::Status(SimStatus::Running)).await
        }
    };
    forwarded.is_ok()
}
