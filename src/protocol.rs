// Sideband Event Protocol
// Line-delimited codec for the child process channel: `[[TAG:field:...]]`
// events on stderr, host commands on stdin. Anything that is not a framed
// event is raw process log.

use crate::pins::{parse_op_token, PinMode, PinRecord};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// One decoded sideband event from the child
#[derive(Debug, Clone, PartialEq)]
pub enum Sideband {
    PinMode { pin: String, mode: PinMode },
    PinValue { pin: String, value: i32 },
    PinPwm { pin: String, value: u8 },
    SerialEvent { ts_write: u64, payload: Vec<u8> },
    IoRegistryStart,
    IoPin(PinRecord),
    IoRegistryEnd,
    TimeFrozen { ms: u64 },
    TimeResumed { offset_ms: u64 },
}

/// Outcome of decoding a single child output line
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// A well-formed event with a known tag
    Event(Sideband),
    /// Framed but unknown or malformed; forward-compatible consumers skip it
    Ignored,
    /// Not framed at all: raw process output
    Log(String),
}

/// Decode one line of child output.
///
/// Framing is strict: the whole line must be wrapped in `[[` / `]]` with
/// `:`-separated fields inside. Unframed lines come back as `Log`.
pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let body = match trimmed
        .strip_prefix("[[")
        .and_then(|rest| rest.strip_suffix("]]"))
    {
        Some(body) => body,
        None => return ParsedLine::Log(trimmed.to_string()),
    };

    let (tag, fields) = match body.split_once(':') {
        Some((tag, rest)) => (tag, rest),
        None => (body, ""),
    };

    match tag {
        "PIN_MODE" => parse_pin_mode(fields),
        "PIN_VALUE" => parse_pin_value(fields),
        "PIN_PWM" => parse_pin_pwm(fields),
        "SERIAL_EVENT" => parse_serial_event(fields),
        "IO_REGISTRY_START" => ParsedLine::Event(Sideband::IoRegistryStart),
        "IO_REGISTRY_END" => ParsedLine::Event(Sideband::IoRegistryEnd),
        "IO_PIN" => parse_io_pin(fields),
        "TIME_FROZEN" => match fields.parse() {
            Ok(ms) => ParsedLine::Event(Sideband::TimeFrozen { ms }),
            Err(_) => ParsedLine::Ignored,
        },
        "TIME_RESUMED" => match fields.parse() {
            Ok(offset_ms) => ParsedLine::Event(Sideband::TimeResumed { offset_ms }),
            Err(_) => ParsedLine::Ignored,
        },
        _ => ParsedLine::Ignored,
    }
}

fn parse_pin_mode(fields: &str) -> ParsedLine {
    let parts: Vec<&str> = fields.split(':').collect();
    if parts.len() != 2 {
        return ParsedLine::Ignored;
    }
    let mode = parts[1].parse().ok().and_then(PinMode::from_code);
    match mode {
        Some(mode) => ParsedLine::Event(Sideband::PinMode {
            pin: parts[0].to_string(),
            mode,
        }),
        None => ParsedLine::Ignored,
    }
}

fn parse_pin_value(fields: &str) -> ParsedLine {
    let parts: Vec<&str> = fields.split(':').collect();
    if parts.len() != 2 {
        return ParsedLine::Ignored;
    }
    match parts[1].parse() {
        Ok(value) => ParsedLine::Event(Sideband::PinValue {
            pin: parts[0].to_string(),
            value,
        }),
        Err(_) => ParsedLine::Ignored,
    }
}

fn parse_pin_pwm(fields: &str) -> ParsedLine {
    let parts: Vec<&str> = fields.split(':').collect();
    if parts.len() != 2 {
        return ParsedLine::Ignored;
    }
    match parts[1].parse() {
        Ok(value) => ParsedLine::Event(Sideband::PinPwm {
            pin: parts[0].to_string(),
            value,
        }),
        Err(_) => ParsedLine::Ignored,
    }
}

fn parse_serial_event(fields: &str) -> ParsedLine {
    // ts_write:base64Payload - payload may legitimately be empty
    let (ts, b64) = match fields.split_once(':') {
        Some(pair) => pair,
        None => return ParsedLine::Ignored,
    };
    let ts_write: u64 = match ts.parse() {
        Ok(ts) => ts,
        Err(_) => return ParsedLine::Ignored,
    };
    match BASE64.decode(b64) {
        Ok(payload) => ParsedLine::Event(Sideband::SerialEvent { ts_write, payload }),
        Err(_) => ParsedLine::Ignored,
    }
}

/// `IO_PIN` body: `label:definedFlag:definedLine:modeCode(:op@line)*(:_count@N)?`
fn parse_io_pin(fields: &str) -> ParsedLine {
    let parts: Vec<&str> = fields.split(':').collect();
    if parts.len() < 4 {
        return ParsedLine::Ignored;
    }

    let defined = match parts[1] {
        "1" => true,
        "0" => false,
        _ => return ParsedLine::Ignored,
    };
    let defined_line: u32 = match parts[2].parse() {
        Ok(n) => n,
        Err(_) => return ParsedLine::Ignored,
    };
    // modeCode 255 means "never set"; anything else must be a valid code
    let mode = match parts[3].parse::<u8>() {
        Ok(255) => None,
        Ok(code) => match PinMode::from_code(code) {
            Some(mode) => Some(mode),
            None => return ParsedLine::Ignored,
        },
        Err(_) => return ParsedLine::Ignored,
    };

    let mut record = PinRecord {
        pin: parts[0].to_string(),
        defined,
        defined_line,
        mode,
        ops: Vec::new(),
        op_count: None,
    };

    // "pinMode:N@line" op tokens carry an internal colon, so the field
    // split leaves them as two adjacent parts that must be rejoined.
    let mut i = 4;
    while i < parts.len() {
        let token = if parts[i] == "pinMode" && i + 1 < parts.len() {
            i += 1;
            format!("pinMode:{}", parts[i])
        } else {
            parts[i].to_string()
        };
        i += 1;

        if let Some(count) = token.strip_prefix("_count@") {
            match count.parse() {
                Ok(n) => record.op_count = Some(n),
                Err(_) => return ParsedLine::Ignored,
            }
        } else if let Some(op) = parse_op_token(&token) {
            record.ops.push(op);
        } else {
            return ParsedLine::Ignored;
        }
    }

    ParsedLine::Event(Sideband::IoPin(record))
}

// ==================== Host Commands ====================

/// Commands written to the child's stdin, one line each
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    SetPin { pin: String, value: i32 },
    PauseTime,
    ResumeTime { duration_ms: u64 },
    /// Raw serial input; a terminating newline is re-appended on encode
    Serial(Vec<u8>),
}

impl HostCommand {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            HostCommand::SetPin { pin, value } => {
                format!("[[SET_PIN:{}:{}]]\n", pin, value).into_bytes()
            }
            HostCommand::PauseTime => b"[[PAUSE_TIME]]\n".to_vec(),
            HostCommand::ResumeTime { duration_ms } => {
                format!("[[RESUME_TIME:{}]]\n", duration_ms).into_bytes()
            }
            HostCommand::Serial(bytes) => {
                let mut out = bytes.clone();
                out.push(b'\n');
                out
            }
        }
    }
}

/// Encode a serial payload the way the child runtime does, for tests and
/// for re-emitting serial_event frames to the peer.
pub fn encode_serial_payload(payload: &[u8]) -> String {
    BASE64.encode(payload)
}

/// Inverse of [`encode_serial_payload`]; what a consumer of serial_event
/// frames applies before line assembly.
pub fn decode_serial_payload(payload: &str) -> Option<Vec<u8>> {
    BASE64.decode(payload).ok()
}
