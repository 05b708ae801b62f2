// Session Multiplexer
//
// One session per WebSocket peer. Each session owns at most one runner,
// and a runner's events fan out to its owning peer only. Compilation
// status is the single broadcast channel; everything else is unicast.
//
// The session table is the only process-wide mutable state. Lookups clone
// the Arc and all I/O happens outside the map.

pub mod messages;

use crate::analyzer::{self, AnalysisReport};
use crate::config::ServerConfig;
use crate::pins::IoRegistry;
use crate::protocol::encode_serial_payload;
use crate::runner::{RunnerConfig, RunnerEvent, SimRunner, SimStatus};
use crate::sketch::{self, HeaderTab, SourceBundle};
use crate::toolchain::{Artifact, Toolchain, ToolchainError};
use dashmap::DashMap;
use self::messages::{CompilePhase, Inbound, Outbound};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bound of the per-session outbound queue. When it fills, the runner's
/// pumps block, which throttles the child.
pub const OUTBOUND_QUEUE_DEPTH: usize = 1024;

const BROADCAST_QUEUE_DEPTH: usize = 256;

// ==================== Session ====================

/// Per-peer state. Identity is the socket; the id exists for the table
/// and the logs.
pub struct Session {
    pub id: Uuid,
    outbound: mpsc::Sender<Outbound>,
    runner: Mutex<Option<SimRunner>>,
    artifact: Mutex<Option<Arc<Artifact>>>,
    status: Mutex<SimStatus>,
    paused_at: Mutex<Option<Instant>>,
    compile_cancel: Mutex<Option<CancellationToken>>,
}

impl Session {
    fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            runner: Mutex::new(None),
            artifact: Mutex::new(None),
            status: Mutex::new(SimStatus::Stopped),
            paused_at: Mutex::new(None),
            compile_cancel: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> SimStatus {
        *self.status.lock().await
    }

    /// Unicast to this peer. Blocking on a full queue is the backpressure
    /// path, not an error.
    async fn send(&self, frame: Outbound) {
        if self.outbound.send(frame).await.is_err() {
            log::debug!("session {} outbound closed, frame dropped", self.id);
        }
    }
}

// ==================== Session Manager ====================

pub struct SessionManager {
    config: ServerConfig,
    toolchain: Arc<dyn Toolchain>,
    runtime_source: String,
    sessions: DashMap<Uuid, Arc<Session>>,
    broadcast_tx: broadcast::Sender<Outbound>,
}

impl SessionManager {
    pub fn new(
        config: ServerConfig,
        toolchain: Arc<dyn Toolchain>,
        runtime_source: String,
    ) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_QUEUE_DEPTH);
        Self {
            config,
            toolchain,
            runtime_source,
            sessions: DashMap::new(),
            broadcast_tx,
        }
    }

    /// Allocate a session for a new connection. Returns the unicast
    /// receiver and a subscription to the compile-status broadcast.
    pub fn register(
        &self,
    ) -> (
        Arc<Session>,
        mpsc::Receiver<Outbound>,
        broadcast::Receiver<Outbound>,
    ) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let session = Arc::new(Session::new(tx));
        self.sessions.insert(session.id, session.clone());
        log::info!(
            "session {} connected ({} active)",
            session.id,
            self.sessions.len()
        );
        (session, rx, self.broadcast_tx.subscribe())
    }

    /// Tear down a disconnected session: force-stop its runner, cancel any
    /// in-flight compile, and drop the table entry.
    pub async fn remove(&self, id: Uuid) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            if let Some(token) = session.compile_cancel.lock().await.take() {
                token.cancel();
            }
            self.stop_runner(&session).await;
            log::info!(
                "session {} disconnected ({} active)",
                id,
                self.sessions.len()
            );
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn broadcast(&self, frame: Outbound) {
        // Err only means nobody is connected
        let _ = self.broadcast_tx.send(frame);
    }

    // ==================== Dispatch ====================

    pub async fn dispatch(self: &Arc<Self>, session: &Arc<Session>, frame: Inbound) {
        match frame {
            Inbound::Compile { code, headers } => {
                self.handle_compile(session, code, headers).await;
            }
            Inbound::StartSimulation { timeout } => {
                self.start_simulation(session, timeout).await;
            }
            Inbound::StopSimulation => {
                self.stop_runner(session).await;
            }
            Inbound::PauseSimulation => {
                if session.status().await == SimStatus::Running {
                    let guard = session.runner.lock().await;
                    if let Some(runner) = guard.as_ref() {
                        runner.pause().await;
                        *session.paused_at.lock().await = Some(Instant::now());
                    }
                }
            }
            Inbound::ResumeSimulation => {
                if session.status().await == SimStatus::Paused {
                    let paused_for = session
                        .paused_at
                        .lock()
                        .await
                        .take()
                        .map(|t| t.elapsed())
                        .unwrap_or_default();
                    let guard = session.runner.lock().await;
                    if let Some(runner) = guard.as_ref() {
                        runner.resume(paused_for.as_millis() as u64).await;
                    }
                }
            }
            Inbound::SerialInput { payload } => {
                // Rejected while paused: time is frozen, input would pile up
                if session.status().await == SimStatus::Running {
                    let guard = session.runner.lock().await;
                    if let Some(runner) = guard.as_ref() {
                        runner.send_serial(payload.into_bytes()).await;
                    }
                }
            }
            Inbound::SetPinValue { pin, value } => {
                // Pin writes are state, not time: allowed while paused
                let status = session.status().await;
                if status == SimStatus::Running || status == SimStatus::Paused {
                    let guard = session.runner.lock().await;
                    if let Some(runner) = guard.as_ref() {
                        runner.set_pin(pin, value).await;
                    }
                }
            }
            Inbound::CodeChanged => {
                session.artifact.lock().await.take();
                self.stop_runner(session).await;
            }
        }
    }

    async fn stop_runner(&self, session: &Arc<Session>) {
        if let Some(runner) = session.runner.lock().await.as_ref() {
            runner.stop();
        }
        session.paused_at.lock().await.take();
    }

    // ==================== Compile ====================

    async fn handle_compile(self: &Arc<Self>, session: &Arc<Session>, code: String, headers: Vec<HeaderTab>) {
        // Supersede any in-flight compile for this session
        let token = CancellationToken::new();
        if let Some(old) = session
            .compile_cancel
            .lock()
            .await
            .replace(token.clone())
        {
            old.cancel();
        }

        self.stop_runner(session).await;
        *session.status.lock().await = SimStatus::Compiling;
        self.broadcast(compile_phase(CompilePhase::Compiling));

        let manager = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            manager.run_compile(session, code, headers, token).await;
        });
    }

    async fn run_compile(
        &self,
        session: Arc<Session>,
        code: String,
        headers: Vec<HeaderTab>,
        token: CancellationToken,
    ) {
        let bundle = SourceBundle::new(code.clone(), headers);

        // Static analysis runs in parallel with the toolchain
        let analysis_source = code.clone();
        let analysis = tokio::task::spawn_blocking(move || {
            (
                analyzer::analyze(&analysis_source),
                analyzer::static_registry(&analysis_source),
            )
        });

        let unit = match sketch::merge(&bundle, &self.runtime_source) {
            Ok(unit) => unit,
            Err(e) => {
                let (report, registry) = analysis.await.unwrap_or_default();
                session
                    .send(compile_result(
                        CompilePhase::Error,
                        None,
                        Some(e.to_string()),
                        report,
                        registry,
                        code,
                    ))
                    .await;
                self.broadcast(compile_phase(CompilePhase::Error));
                *session.status.lock().await = SimStatus::Stopped;
                return;
            }
        };

        let (outcome, analysis) =
            tokio::join!(self.toolchain.compile(&unit, &bundle), analysis);

        if token.is_cancelled() {
            log::debug!("compile for session {} superseded, result discarded", session.id);
            return;
        }

        let (report, registry) = analysis.unwrap_or_default();
        let processed = unit.processed_code.clone();

        let frame = match outcome {
            Ok(outcome) if outcome.success => {
                if let Some(artifact) = outcome.artifact {
                    session.artifact.lock().await.replace(Arc::new(artifact));
                }
                let warnings = if outcome.diagnostics.trim().is_empty() {
                    None
                } else {
                    Some(outcome.diagnostics)
                };
                self.broadcast(compile_phase(CompilePhase::Success));
                compile_result(
                    CompilePhase::Success,
                    Some(outcome.output),
                    warnings,
                    report,
                    registry,
                    processed,
                )
            }
            Ok(outcome) => {
                self.broadcast(compile_phase(CompilePhase::Error));
                compile_result(
                    CompilePhase::Error,
                    Some(outcome.output),
                    Some(outcome.diagnostics),
                    report,
                    registry,
                    processed,
                )
            }
            Err(ToolchainError::Unavailable(msg)) => {
                log::error!("toolchain unavailable: {}", msg);
                self.broadcast(compile_phase(CompilePhase::Error));
                compile_result(
                    CompilePhase::Error,
                    None,
                    Some(format!("Toolchain unavailable: {}", msg)),
                    report,
                    registry,
                    processed,
                )
            }
            Err(e) => {
                log::error!("compile failed: {}", e);
                self.broadcast(compile_phase(CompilePhase::Error));
                compile_result(
                    CompilePhase::Error,
                    None,
                    Some(format!("Compilation failed: {}", e)),
                    report,
                    registry,
                    processed,
                )
            }
        };

        session.send(frame).await;
        *session.status.lock().await = SimStatus::Stopped;
    }

    // ==================== Simulation ====================

    async fn start_simulation(&self, session: &Arc<Session>, timeout: Option<u64>) {
        let artifact = session.artifact.lock().await.clone();
        let artifact = match artifact {
            Some(artifact) => artifact,
            None => {
                session
                    .send(Outbound::CompilationError {
                        message: "No compiled sketch; compile before starting the simulation"
                            .to_string(),
                        errors: None,
                    })
                    .await;
                return;
            }
        };

        let mut runner_guard = session.runner.lock().await;
        if let Some(existing) = runner_guard.as_ref() {
            if !existing.is_stopped() {
                return;
            }
        }

        let timeout_secs = timeout.unwrap_or(self.config.default_timeout_secs);
        let (events_tx, events_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let runner = SimRunner::start(
            RunnerConfig {
                binary: artifact.binary.clone(),
                line_offset: artifact.line_offset,
                timeout: Duration::from_secs(timeout_secs),
            },
            events_tx,
        );
        *runner_guard = Some(runner);
        drop(runner_guard);

        // Fan-out bound to this session only
        let session = session.clone();
        tokio::spawn(async move {
            forward_runner_events(session, events_rx).await;
        });
    }
}

/// Translate runner events into outbound frames for the owning peer.
async fn forward_runner_events(session: Arc<Session>, mut events: mpsc::Receiver<RunnerEvent>) {
    while let Some(event) = events.recv().await {
        let frame = match event {
            RunnerEvent::Status(status) => {
                *session.status.lock().await = status;
                if status == SimStatus::Stopped {
                    session.paused_at.lock().await.take();
                }
                Outbound::SimulationStatus { status }
            }
            RunnerEvent::Serial { ts_write, payload } => Outbound::SerialEvent {
                ts_write,
                payload: encode_serial_payload(&payload),
            },
            RunnerEvent::RawSerial(text) => Outbound::SerialOutput { text },
            RunnerEvent::PinMode { pin, mode } => Outbound::PinState {
                pin,
                mode: Some(mode),
                value: None,
                pwm: None,
            },
            RunnerEvent::PinValue { pin, value } => Outbound::PinState {
                pin,
                mode: None,
                value: Some(value),
                pwm: None,
            },
            RunnerEvent::PinPwm { pin, value } => Outbound::PinState {
                pin,
                mode: None,
                value: None,
                pwm: Some(value),
            },
            RunnerEvent::IoRegistry(records) => Outbound::IoRegistry {
                pins: IoRegistry::from_records(records).pins,
            },
            RunnerEvent::SpawnFailed(message) => {
                Outbound::CompilationError {
                    message,
                    errors: None,
                }
            }
        };
        session.send(frame).await;
    }
}

fn compile_phase(status: CompilePhase) -> Outbound {
    Outbound::CompilationStatus {
        status,
        output: None,
        errors: None,
        parser_messages: None,
        io_registry: None,
        processed_code: None,
    }
}

fn compile_result(
    status: CompilePhase,
    output: Option<String>,
    errors: Option<String>,
    report: AnalysisReport,
    registry: IoRegistry,
    processed_code: String,
) -> Outbound {
    Outbound::CompilationStatus {
        status,
        output,
        errors,
        parser_messages: Some(report.advisories),
        io_registry: Some(registry.pins),
        processed_code: Some(processed_code),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::sketch::MergedUnit;
    use crate::toolchain::CompileOutcome;
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use tokio::time::timeout;

    /// Toolchain double: "links" a shell script so the runner has a real
    /// process to supervise.
    struct FakeToolchain {
        script: String,
    }

    impl FakeToolchain {
        fn new(script: &str) -> Self {
            Self {
                script: script.to_string(),
            }
        }
    }

    #[async_trait]
    impl Toolchain for FakeToolchain {
        async fn compile(
            &self,
            unit: &MergedUnit,
            _bundle: &SourceBundle,
        ) -> Result<CompileOutcome, ToolchainError> {
            let dir = tempfile::tempdir()?;
            let binary = dir.path().join("sketch");
            std::fs::write(&binary, format!("#!/bin/sh\n{}\n", self.script))?;
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))?;
            Ok(CompileOutcome {
                success: true,
                output: "Program size: 100 bytes (text 90 + data 10)\n".to_string(),
                diagnostics: String::new(),
                artifact: Some(Artifact {
                    dir,
                    binary: binary.clone(),
                    processed_code: unit.processed_code.clone(),
                    line_offset: unit.line_offset,
                }),
            })
        }
    }

    fn test_manager(script: &str) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            ServerConfig::default(),
            Arc::new(FakeToolchain::new(script)),
            "// rt\n".to_string(),
        ))
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame timeout")
            .expect("channel closed")
    }

    async fn wait_for(
        rx: &mut mpsc::Receiver<Outbound>,
        mut pred: impl FnMut(&Outbound) -> bool,
    ) -> Outbound {
        loop {
            let frame = next_frame(rx).await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    const SKETCH: &str = "void setup() {}\nvoid loop() {}\n";

    #[tokio::test]
    async fn test_session_table_tracks_connections() {
        let manager = test_manager("exit 0");
        let (a, _rx_a, _bc_a) = manager.register();
        let (b, _rx_b, _bc_b) = manager.register();
        assert_eq!(manager.session_count(), 2);

        manager.remove(a.id).await;
        assert_eq!(manager.session_count(), 1);
        manager.remove(b.id).await;
        assert_eq!(manager.session_count(), 0);

        // Removing twice must not underflow or panic
        manager.remove(b.id).await;
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_compile_unicasts_result_and_broadcasts_phases() {
        let manager = test_manager("exit 0");
        let (session, mut rx, mut bc) = manager.register();

        manager
            .dispatch(
                &session,
                Inbound::Compile {
                    code: SKETCH.to_string(),
                    headers: vec![],
                },
            )
            .await;

        let result = wait_for(&mut rx, |f| {
            matches!(
                f,
                Outbound::CompilationStatus {
                    status: CompilePhase::Success,
                    ..
                }
            )
        })
        .await;
        match result {
            Outbound::CompilationStatus {
                output,
                parser_messages,
                io_registry,
                processed_code,
                ..
            } => {
                assert!(output.unwrap().contains("Program size"));
                assert!(parser_messages.is_some());
                assert_eq!(io_registry.unwrap().len(), crate::pins::PIN_COUNT);
                assert!(processed_code.unwrap().contains("void setup"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        // Broadcast saw compiling then success
        let first = bc.recv().await.unwrap();
        assert!(matches!(
            first,
            Outbound::CompilationStatus {
                status: CompilePhase::Compiling,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_entry_points_still_returns_advisories() {
        let manager = test_manager("exit 0");
        let (session, mut rx, _bc) = manager.register();

        manager
            .dispatch(
                &session,
                Inbound::Compile {
                    code: "void loop_only() { Serial.print(1); }".to_string(),
                    headers: vec![],
                },
            )
            .await;

        let frame = wait_for(&mut rx, |f| {
            matches!(
                f,
                Outbound::CompilationStatus {
                    status: CompilePhase::Error,
                    ..
                }
            )
        })
        .await;
        match frame {
            Outbound::CompilationStatus {
                errors,
                parser_messages,
                io_registry,
                ..
            } => {
                assert!(errors.unwrap().contains("entry points"));
                assert!(!parser_messages.unwrap().is_empty());
                assert_eq!(io_registry.unwrap().len(), crate::pins::PIN_COUNT);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_without_artifact_is_an_error_frame() {
        let manager = test_manager("exit 0");
        let (session, mut rx, _bc) = manager.register();

        manager
            .dispatch(&session, Inbound::StartSimulation { timeout: None })
            .await;

        let frame = next_frame(&mut rx).await;
        assert!(matches!(frame, Outbound::CompilationError { .. }));
    }

    #[tokio::test]
    async fn test_simulation_lifecycle_events() {
        let manager = test_manager("echo '[[PIN_MODE:13:1]]' 1>&2");
        let (session, mut rx, _bc) = manager.register();

        manager
            .dispatch(
                &session,
                Inbound::Compile {
                    code: SKETCH.to_string(),
                    headers: vec![],
                },
            )
            .await;
        wait_for(&mut rx, |f| {
            matches!(
                f,
                Outbound::CompilationStatus {
                    status: CompilePhase::Success,
                    ..
                }
            )
        })
        .await;

        manager
            .dispatch(&session, Inbound::StartSimulation { timeout: Some(5) })
            .await;

        wait_for(&mut rx, |f| {
            matches!(
                f,
                Outbound::SimulationStatus {
                    status: SimStatus::Running
                }
            )
        })
        .await;
        wait_for(&mut rx, |f| matches!(f, Outbound::PinState { pin, .. } if pin == "13")).await;
        wait_for(&mut rx, |f| {
            matches!(
                f,
                Outbound::SimulationStatus {
                    status: SimStatus::Stopped
                }
            )
        })
        .await;
        assert_eq!(session.status().await, SimStatus::Stopped);
    }

    #[tokio::test]
    async fn test_two_sessions_do_not_observe_each_other() {
        let manager = test_manager("echo '[[PIN_VALUE:2:1]]' 1>&2\nsleep 0.2");
        let (a, mut rx_a, _bc_a) = manager.register();
        let (b, mut rx_b, _bc_b) = manager.register();

        manager
            .dispatch(
                &a,
                Inbound::Compile {
                    code: SKETCH.to_string(),
                    headers: vec![],
                },
            )
            .await;
        wait_for(&mut rx_a, |f| {
            matches!(
                f,
                Outbound::CompilationStatus {
                    status: CompilePhase::Success,
                    ..
                }
            )
        })
        .await;

        manager
            .dispatch(&a, Inbound::StartSimulation { timeout: Some(5) })
            .await;
        wait_for(&mut rx_a, |f| matches!(f, Outbound::PinState { pin, .. } if pin == "2")).await;

        // B must see compile phases (broadcast) but never A's runtime events
        while let Ok(Some(frame)) = timeout(Duration::from_millis(300), rx_b.recv()).await {
            assert!(
                matches!(frame, Outbound::CompilationStatus { .. }),
                "session B observed A's runtime event: {:?}",
                frame
            );
        }
        let _ = b;
    }

    #[tokio::test]
    async fn test_serial_input_rejected_unless_running() {
        let manager = test_manager("exit 0");
        let (session, _rx, _bc) = manager.register();

        // No runner and status stopped: dispatch must be a quiet no-op
        manager
            .dispatch(
                &session,
                Inbound::SerialInput {
                    payload: "hello".to_string(),
                },
            )
            .await;

        *session.status.lock().await = SimStatus::Paused;
        manager
            .dispatch(
                &session,
                Inbound::SerialInput {
                    payload: "hello".to_string(),
                },
            )
            .await;
        assert_eq!(session.status().await, SimStatus::Paused);
    }

    #[tokio::test]
    async fn test_code_changed_marks_artifact_stale() {
        let manager = test_manager("exit 0");
        let (session, mut rx, _bc) = manager.register();

        manager
            .dispatch(
                &session,
                Inbound::Compile {
                    code: SKETCH.to_string(),
                    headers: vec![],
                },
            )
            .await;
        wait_for(&mut rx, |f| {
            matches!(
                f,
                Outbound::CompilationStatus {
                    status: CompilePhase::Success,
                    ..
                }
            )
        })
        .await;
        assert!(session.artifact.lock().await.is_some());

        manager.dispatch(&session, Inbound::CodeChanged).await;
        assert!(session.artifact.lock().await.is_none());

        // Starting now fails: the artifact is stale
        manager
            .dispatch(&session, Inbound::StartSimulation { timeout: None })
            .await;
        let frame = next_frame(&mut rx).await;
        assert!(matches!(frame, Outbound::CompilationError { .. }));
    }
}
