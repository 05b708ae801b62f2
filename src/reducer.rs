// Client State Reducer
// Pure view-model fold over session events: serial line assembly, the
// raw-stdout deduplication window, the pin panel, and the I/O registry
// panel. Mirrors what the board UI renders, and pins down the contract
// the runner and codec must emit.

use crate::analyzer::{Advisory, AdvisoryCategory, AdvisoryKind};
use crate::pins::{self, IoRegistry, PinMode, PinRecord};
use crate::runner::SimStatus;
use serde::Serialize;
use std::collections::BTreeMap;

/// Raw-stdout serial is dropped this long after a structured event
pub const DEDUP_WINDOW_MS: u64 = 1_000;

// ==================== View Model ====================

/// One rendered serial line; `complete` is false only for the trailing
/// line still being typed by the sketch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialLine {
    pub text: String,
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PinKind {
    Digital,
    Pwm,
    Analog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinView {
    pub kind: PinKind,
    pub mode: Option<PinMode>,
    pub value: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewState {
    pub status: SimStatus,
    pub serial: Vec<SerialLine>,
    pub pins: BTreeMap<String, PinView>,
    pub registry: Vec<PinRecord>,
    pub registry_advisories: Vec<Advisory>,
    last_serial_event_ms: Option<u64>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            status: SimStatus::Stopped,
            serial: Vec::new(),
            pins: BTreeMap::new(),
            registry: IoRegistry::empty().pins,
            registry_advisories: Vec::new(),
            last_serial_event_ms: None,
        }
    }
}

/// Events the reducer folds, stamped with arrival time where the dedup
/// window needs it.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    SerialEvent {
        ts_write: u64,
        payload: Vec<u8>,
        arrived_ms: u64,
    },
    SerialOutput {
        text: String,
        arrived_ms: u64,
    },
    PinMode {
        pin: String,
        mode: PinMode,
    },
    PinValue {
        pin: String,
        value: i32,
    },
    PinPwm {
        pin: String,
        value: u8,
    },
    Status(SimStatus),
    IoRegistry(Vec<PinRecord>),
}

// ==================== Reduce ====================

pub fn reduce(mut state: ViewState, event: &ViewEvent) -> ViewState {
    match event {
        ViewEvent::SerialEvent {
            payload,
            arrived_ms,
            ..
        } => {
            state.last_serial_event_ms = Some(*arrived_ms);
            append_serial_payload(&mut state.serial, payload);
        }
        ViewEvent::SerialOutput { text, arrived_ms } => {
            if !dropped_by_dedup(&state, text, *arrived_ms) {
                append_complete_line(&mut state.serial, text.clone());
            }
        }
        ViewEvent::PinMode { pin, mode } => {
            let entry = state.pins.entry(pin.clone()).or_insert(PinView {
                kind: PinKind::Digital,
                mode: None,
                value: 0,
            });
            // An analog pin touched by pinMode is being used digitally
            if entry.kind == PinKind::Analog {
                entry.kind = PinKind::Digital;
            }
            entry.mode = Some(*mode);
        }
        ViewEvent::PinValue { pin, value } => {
            let entry = state.pins.entry(pin.clone()).or_insert(PinView {
                kind: default_kind(pin),
                mode: None,
                value: 0,
            });
            // Value only; the kind never flips on a plain value change
            entry.value = *value;
        }
        ViewEvent::PinPwm { pin, value } => {
            let entry = state.pins.entry(pin.clone()).or_insert(PinView {
                kind: PinKind::Pwm,
                mode: None,
                value: 0,
            });
            entry.kind = PinKind::Pwm;
            entry.value = *value as i32;
        }
        ViewEvent::Status(status) => {
            state.status = *status;
            if *status == SimStatus::Running {
                // Analog pins join the panel only once the sketch runs
                for n in 0..6 {
                    state
                        .pins
                        .entry(format!("A{}", n))
                        .or_insert(PinView {
                            kind: PinKind::Analog,
                            mode: None,
                            value: 0,
                        });
                }
            }
        }
        ViewEvent::IoRegistry(records) => {
            let registry = IoRegistry::from_records(records.clone());
            state.registry_advisories = derive_registry_advisories(&registry.pins);
            state.registry = registry.pins;
        }
    }
    state
}

fn default_kind(pin: &str) -> PinKind {
    if pins::is_analog_label(pin) {
        PinKind::Analog
    } else {
        PinKind::Digital
    }
}

/// System messages always pass the window
fn is_system_line(text: &str) -> bool {
    text.starts_with("---") || text.starts_with("Simulation ")
}

fn dropped_by_dedup(state: &ViewState, text: &str, arrived_ms: u64) -> bool {
    if is_system_line(text) {
        return false;
    }
    match state.last_serial_event_ms {
        Some(last) => arrived_ms.saturating_sub(last) < DEDUP_WINDOW_MS,
        None => false,
    }
}

// ==================== Serial Assembly ====================

/// Fold an opaque payload into the line list. `\n` completes the trailing
/// line, a leading `\r` flushes it for overwrite, `\b` erases one
/// character. Bytes are otherwise kept as-is.
fn append_serial_payload(serial: &mut Vec<SerialLine>, payload: &[u8]) {
    let text = String::from_utf8_lossy(payload).into_owned();
    let mut chars = text.chars().peekable();

    if chars.peek() == Some(&'\r') {
        chars.next();
        if let Some(line) = trailing_incomplete(serial) {
            line.text.clear();
        }
    }

    for c in chars {
        match c {
            '\n' => match trailing_incomplete(serial) {
                Some(line) => line.complete = true,
                None => serial.push(SerialLine {
                    text: String::new(),
                    complete: true,
                }),
            },
            '\u{8}' => {
                if let Some(line) = trailing_incomplete(serial) {
                    line.text.pop();
                }
            }
            c => match trailing_incomplete(serial) {
                Some(line) => line.text.push(c),
                None => serial.push(SerialLine {
                    text: c.to_string(),
                    complete: false,
                }),
            },
        }
    }
}

fn trailing_incomplete(serial: &mut [SerialLine]) -> Option<&mut SerialLine> {
    serial.last_mut().filter(|line| !line.complete)
}

/// Raw stdout arrives line-framed and lands as a complete line, kept
/// behind any still-incomplete structured line so that one stays trailing.
fn append_complete_line(serial: &mut Vec<SerialLine>, text: String) {
    let line = SerialLine {
        text,
        complete: true,
    };
    match serial.last() {
        Some(last) if !last.complete => {
            let at = serial.len() - 1;
            serial.insert(at, line);
        }
        _ => serial.push(line),
    }
}

// ==================== Ordering ====================

/// Sort each run of consecutive serial events by the child's write
/// timestamp; arrival order breaks ties and everything else keeps its
/// position.
pub fn order_serial_runs(events: Vec<ViewEvent>) -> Vec<ViewEvent> {
    let mut out: Vec<ViewEvent> = Vec::with_capacity(events.len());
    let mut run: Vec<ViewEvent> = Vec::new();

    for event in events {
        if matches!(event, ViewEvent::SerialEvent { .. }) {
            run.push(event);
        } else {
            flush_run(&mut run, &mut out);
            out.push(event);
        }
    }
    flush_run(&mut run, &mut out);
    out
}

fn flush_run(run: &mut Vec<ViewEvent>, out: &mut Vec<ViewEvent>) {
    run.sort_by_key(|event| match event {
        ViewEvent::SerialEvent { ts_write, .. } => *ts_write,
        _ => 0,
    });
    out.append(run);
}

// ==================== Registry Advisories ====================

/// Multiple distinct modes on one pin is a likely bug; repeating the same
/// mode is only wasteful.
pub fn derive_registry_advisories(registry: &[PinRecord]) -> Vec<Advisory> {
    let mut advisories = Vec::new();

    for record in registry {
        let modes: Vec<&str> = record
            .ops
            .iter()
            .filter(|op| op.op.starts_with("pinMode:"))
            .map(|op| op.op.as_str())
            .collect();
        if modes.len() < 2 {
            continue;
        }

        let mut distinct = modes.clone();
        distinct.sort();
        distinct.dedup();

        if distinct.len() > 1 {
            advisories.push(Advisory::new(
                AdvisoryKind::Warning,
                AdvisoryCategory::Pins,
                2,
                Some(record.defined_line),
                format!(
                    "Pin {} is reconfigured with {} different modes",
                    record.pin,
                    distinct.len()
                ),
            ));
        } else {
            advisories.push(Advisory::new(
                AdvisoryKind::Info,
                AdvisoryCategory::Pins,
                1,
                Some(record.defined_line),
                format!(
                    "Pin {} calls pinMode {} times with the same mode",
                    record.pin,
                    modes.len()
                ),
            ));
        }
    }

    advisories
}
