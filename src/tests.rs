// End-to-End Scenario Tests
// Drive the session multiplexer with scripted children and fold the
// outbound frames through the client reducer, the way a connected board
// view would.

#![cfg(unix)]

use crate::config::ServerConfig;
use crate::protocol::{decode_serial_payload, encode_serial_payload};
use crate::reducer::{reduce, ViewEvent, ViewState};
use crate::runner::SimStatus;
use crate::session::messages::{CompilePhase, Inbound, Outbound};
use crate::session::{Session, SessionManager};
use crate::sketch::{MergedUnit, SourceBundle};
use crate::toolchain::{Artifact, CompileOutcome, Toolchain, ToolchainError};
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const SKETCH: &str = "void setup() {}\nvoid loop() {}\n";

#[test]
fn test_bundled_runtime_declares_entry_hooks() {
    // The asset must call into the sketch's entry points and speak the
    // sideband protocol
    assert!(crate::ARDUINO_RUNTIME.contains("setup()"));
    assert!(crate::ARDUINO_RUNTIME.contains("loop()"));
    assert!(crate::ARDUINO_RUNTIME.contains("[[SERIAL_EVENT:"));
    assert!(crate::ARDUINO_RUNTIME.contains("[[TIME_FROZEN:"));
}

#[test]
fn test_default_runtime_is_bundled() {
    let config = ServerConfig::default();
    let source = crate::load_runtime_source(&config).unwrap();
    assert_eq!(source, crate::ARDUINO_RUNTIME);
}

/// Toolchain double that "links" a shell script, so the full runner and
/// protocol paths run against a real process.
struct ScriptToolchain {
    script: String,
}

#[async_trait]
impl Toolchain for ScriptToolchain {
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
            output: String::new(),
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

fn manager_for(script: &str) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(
        ServerConfig::default(),
        Arc::new(ScriptToolchain {
            script: script.to_string(),
        }),
        "// rt\n".to_string(),
    ))
}

async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("frame timeout")
        .expect("channel closed")
}

async fn compile_and_start(
    manager: &Arc<SessionManager>,
    session: &Arc<Session>,
    rx: &mut mpsc::Receiver<Outbound>,
    timeout_secs: u64,
) {
    manager
        .dispatch(
            session,
            Inbound::Compile {
                code: SKETCH.to_string(),
                headers: vec![],
            },
        )
        .await;
    loop {
        if let Outbound::CompilationStatus {
            status: CompilePhase::Success,
            ..
        } = next_frame(rx).await
        {
            break;
        }
    }
    manager
        .dispatch(
            session,
            Inbound::StartSimulation {
                timeout: Some(timeout_secs),
            },
        )
        .await;
}

/// Collect frames until the simulation reports stopped
async fn collect_run(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(rx).await;
        let stopped = matches!(
            frame,
            Outbound::SimulationStatus {
                status: SimStatus::Stopped
            }
        );
        frames.push(frame);
        if stopped {
            return frames;
        }
    }
}

/// What a client does with a frame before reducing it
fn view_event(frame: &Outbound, arrived_ms: u64) -> Option<ViewEvent> {
    match frame {
        Outbound::SerialEvent { ts_write, payload } => Some(ViewEvent::SerialEvent {
            ts_write: *ts_write,
            payload: decode_serial_payload(payload).expect("valid base64"),
            arrived_ms,
        }),
        Outbound::SerialOutput { text } => Some(ViewEvent::SerialOutput {
            text: text.clone(),
            arrived_ms,
        }),
        Outbound::SimulationStatus { status } => Some(ViewEvent::Status(*status)),
        Outbound::PinState {
            pin, mode, value, pwm
        } => {
            if let Some(mode) = mode {
                Some(ViewEvent::PinMode {
                    pin: pin.clone(),
                    mode: *mode,
                })
            } else if let Some(pwm) = pwm {
                Some(ViewEvent::PinPwm {
                    pin: pin.clone(),
                    value: *pwm,
                })
            } else {
                (*value).map(|value| ViewEvent::PinValue {
                    pin: pin.clone(),
                    value,
                })
            }
        }
        Outbound::IoRegistry { pins } => Some(ViewEvent::IoRegistry(pins.clone())),
        _ => None,
    }
}

fn fold_frames(frames: &[Outbound]) -> ViewState {
    frames
        .iter()
        .enumerate()
        .filter_map(|(i, frame)| view_event(frame, i as u64 * 10))
        .fold(ViewState::default(), |state, ev| reduce(state, &ev))
}

#[tokio::test]
async fn scenario_counter_print() {
    let mut script = String::new();
    for n in 0..10 {
        let payload = encode_serial_payload(format!("{}\n", n).as_bytes());
        script.push_str(&format!(
            "echo '[[SERIAL_EVENT:{}:{}]]' 1>&2\n",
            n * 100,
            payload
        ));
    }
    let manager = manager_for(&script);
    let (session, mut rx, _bc) = manager.register();
    compile_and_start(&manager, &session, &mut rx, 10).await;

    let frames = collect_run(&mut rx).await;
    let state = fold_frames(&frames);

    let complete: Vec<i64> = state
        .serial
        .iter()
        .filter(|l| l.complete)
        .map(|l| l.text.parse().unwrap())
        .collect();
    assert!(complete.len() >= 9, "got {} lines", complete.len());
    assert_eq!(complete[0], 0);
    assert!(complete.windows(2).all(|w| w[1] > w[0]));
}

#[tokio::test]
async fn scenario_timeout_enforcement() {
    let manager = manager_for("exec sleep 30");
    let (session, mut rx, _bc) = manager.register();
    compile_and_start(&manager, &session, &mut rx, 1).await;

    let started = std::time::Instant::now();
    let frames = collect_run(&mut rx).await;
    assert!(started.elapsed() < Duration::from_millis(2500));

    let state = fold_frames(&frames);
    assert_eq!(state.status, SimStatus::Stopped);
    let last_complete = state
        .serial
        .iter()
        .rev()
        .find(|l| l.complete)
        .expect("a serial line");
    assert_eq!(last_complete.text, "--- Simulation timeout ---");
}

#[tokio::test]
async fn scenario_carriage_return_overwrite() {
    let first = encode_serial_payload(b"\rValue: 0   ");
    let second = encode_serial_payload(b"\rValue: 1   ");
    let script = format!(
        "echo '[[SERIAL_EVENT:0:{}]]' 1>&2\necho '[[SERIAL_EVENT:100:{}]]' 1>&2",
        first, second
    );
    let manager = manager_for(&script);
    let (session, mut rx, _bc) = manager.register();
    compile_and_start(&manager, &session, &mut rx, 10).await;

    let frames = collect_run(&mut rx).await;
    let state = fold_frames(&frames);

    let incomplete: Vec<_> = state.serial.iter().filter(|l| !l.complete).collect();
    assert_eq!(incomplete.len(), 1);
    assert!(incomplete[0].text.ends_with("Value: 1   "));
}

#[tokio::test]
async fn scenario_two_sessions_pin_isolation() {
    // The child answers any SET_PIN by reporting pin 2 high
    let script = concat!(
        "while read line; do\n",
        "  case \"$line\" in\n",
        "    '[[SET_PIN:'*) echo '[[PIN_VALUE:2:1]]' 1>&2 ;;\n",
        "  esac\n",
        "done",
    );
    let manager = manager_for(script);
    let (a, mut rx_a, _bc_a) = manager.register();
    let (b, mut rx_b, _bc_b) = manager.register();

    compile_and_start(&manager, &a, &mut rx_a, 10).await;
    compile_and_start(&manager, &b, &mut rx_b, 10).await;

    // Wait until both report running, then poke pin 2 from A only
    loop {
        if let Outbound::SimulationStatus {
            status: SimStatus::Running,
        } = next_frame(&mut rx_a).await
        {
            break;
        }
    }
    loop {
        if let Outbound::SimulationStatus {
            status: SimStatus::Running,
        } = next_frame(&mut rx_b).await
        {
            break;
        }
    }

    manager
        .dispatch(
            &a,
            Inbound::SetPinValue {
                pin: "2".to_string(),
                value: 1,
            },
        )
        .await;

    // A observes the pin change
    loop {
        match next_frame(&mut rx_a).await {
            Outbound::PinState { pin, value, .. } if pin == "2" => {
                assert_eq!(value, Some(1));
                break;
            }
            _ => {}
        }
    }

    // B sees nothing but (at most) broadcast compile phases in the window
    while let Ok(Some(frame)) = timeout(Duration::from_millis(300), rx_b.recv()).await {
        assert!(
            !matches!(frame, Outbound::PinState { .. }),
            "B observed A's pin event"
        );
    }

    manager.remove(a.id).await;
    manager.remove(b.id).await;
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test]
async fn scenario_pause_resume_reports_wall_duration() {
    let script = concat!(
        "while read line; do\n",
        "  case \"$line\" in\n",
        "    '[[PAUSE_TIME]]') echo '[[TIME_FROZEN:1000]]' 1>&2 ;;\n",
        "    '[[RESUME_TIME:'*) echo \"ack:$line\"; echo '[[TIME_RESUMED:500]]' 1>&2 ;;\n",
        "  esac\n",
        "done",
    );
    let manager = manager_for(script);
    let (session, mut rx, _bc) = manager.register();
    compile_and_start(&manager, &session, &mut rx, 10).await;

    loop {
        if let Outbound::SimulationStatus {
            status: SimStatus::Running,
        } = next_frame(&mut rx).await
        {
            break;
        }
    }

    manager.dispatch(&session, Inbound::PauseSimulation).await;
    loop {
        if let Outbound::SimulationStatus {
            status: SimStatus::Paused,
        } = next_frame(&mut rx).await
        {
            break;
        }
    }
    assert_eq!(session.status().await, SimStatus::Paused);

    tokio::time::sleep(Duration::from_millis(80)).await;
    manager.dispatch(&session, Inbound::ResumeSimulation).await;

    // The resume command must carry the wall time spent paused
    let mut reported: Option<u64> = None;
    loop {
        match next_frame(&mut rx).await {
            Outbound::SerialOutput { text } if text.starts_with("ack:[[RESUME_TIME:") => {
                let ms = text
                    .trim_start_matches("ack:[[RESUME_TIME:")
                    .trim_end_matches("]]")
                    .parse()
                    .unwrap();
                reported = Some(ms);
            }
            Outbound::SimulationStatus {
                status: SimStatus::Running,
            } => break,
            _ => {}
        }
    }
    let reported = match reported {
        Some(ms) => ms,
        None => loop {
            if let Outbound::SerialOutput { text } = next_frame(&mut rx).await {
                if text.starts_with("ack:[[RESUME_TIME:") {
                    break text
                        .trim_start_matches("ack:[[RESUME_TIME:")
                        .trim_end_matches("]]")
                        .parse()
                        .unwrap();
                }
            }
        },
    };
    assert!(reported >= 60, "paused for only {} ms", reported);

    manager.dispatch(&session, Inbound::StopSimulation).await;
    collect_run(&mut rx).await;
}
