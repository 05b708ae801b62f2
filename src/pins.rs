// UNO Pin Domain Model
// Pin labels, modes, and the runtime I/O registry shared by the analyzer,
// the sideband codec, and the client-state reducer.

use serde::{Deserialize, Serialize};

/// Digital pins 0..=13 plus analog pins A0..=A5
pub const PIN_COUNT: usize = 20;

/// First numeric alias for the analog pins (A0 == 14 on the UNO)
pub const ANALOG_PIN_BASE: u8 = 14;

/// Pins with hardware PWM on the UNO
pub const PWM_PINS: [u8; 6] = [3, 5, 6, 9, 10, 11];

/// All 20 pin labels in board order: "0".."13", "A0".."A5"
pub fn all_pin_labels() -> Vec<String> {
    let mut labels: Vec<String> = (0..14).map(|n| n.to_string()).collect();
    labels.extend((0..6).map(|n| format!("A{}", n)));
    labels
}

/// Normalize a pin reference to its registry label.
/// Accepts "0".."13", the numeric analog aliases "14".."19", and "A0".."A5".
pub fn canonical_label(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix('A') {
        let n: u8 = rest.parse().ok()?;
        if n < 6 {
            return Some(format!("A{}", n));
        }
        return None;
    }
    let n: u8 = raw.parse().ok()?;
    match n {
        0..=13 => Some(n.to_string()),
        14..=19 => Some(format!("A{}", n - ANALOG_PIN_BASE)),
        _ => None,
    }
}

/// True for pins that can drive analogWrite PWM output
pub fn is_pwm_pin(label: &str) -> bool {
    label
        .parse::<u8>()
        .map(|n| PWM_PINS.contains(&n))
        .unwrap_or(false)
}

/// True for the analog pin labels A0..A5 (or their 14..19 aliases)
pub fn is_analog_label(label: &str) -> bool {
    canonical_label(label)
        .map(|l| l.starts_with('A'))
        .unwrap_or(false)
}

// ==================== Pin Mode ====================

/// Wire codes: 0 = INPUT, 1 = OUTPUT, 2 = INPUT_PULLUP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PinMode {
    Input,
    Output,
    InputPullup,
}

impl PinMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PinMode::Input),
            1 => Some(PinMode::Output),
            2 => Some(PinMode::InputPullup),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            PinMode::Input => 0,
            PinMode::Output => 1,
            PinMode::InputPullup => 2,
        }
    }
}

// ==================== Pin Operations ====================

/// A single recorded operation against a pin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinOp {
    pub line: u32,
    pub op: String,
}

impl PinOp {
    pub fn new(line: u32, op: impl Into<String>) -> Self {
        Self {
            line,
            op: op.into(),
        }
    }
}

/// Parse an `op@line` token from an IO_PIN event body
pub fn parse_op_token(token: &str) -> Option<PinOp> {
    let (op, line) = token.rsplit_once('@')?;
    let line: u32 = line.parse().ok()?;
    if op.is_empty() {
        return None;
    }
    Some(PinOp::new(line, op))
}

// ==================== Pin Record ====================

/// Registry entry for one pin. `ops` holds at most OP_CAP entries; the
/// total including the overflow is in `op_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinRecord {
    pub pin: String,
    pub defined: bool,
    pub defined_line: u32,
    pub mode: Option<PinMode>,
    pub ops: Vec<PinOp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub op_count: Option<u32>,
}

/// Visible operations kept per pin before the `_count@N` overflow kicks in
pub const OP_CAP: usize = 5;

impl PinRecord {
    pub fn empty(pin: impl Into<String>) -> Self {
        Self {
            pin: pin.into(),
            defined: false,
            defined_line: 0,
            mode: None,
            ops: Vec::new(),
            op_count: None,
        }
    }

    /// Record an operation, keeping the visible list capped
    pub fn push_op(&mut self, op: PinOp) {
        let total = self.op_count.unwrap_or(self.ops.len() as u32) + 1;
        if self.ops.len() < OP_CAP {
            self.ops.push(op);
        }
        if total as usize > OP_CAP {
            self.op_count = Some(total);
        }
    }

    /// Apply a pinMode call: first one defines the pin, last one wins the mode
    pub fn apply_pin_mode(&mut self, mode: PinMode, line: u32) {
        if !self.defined {
            self.defined = true;
            self.defined_line = line;
        }
        self.mode = Some(mode);
        self.push_op(PinOp::new(line, format!("pinMode:{}", mode.code())));
    }
}

// ==================== I/O Registry ====================

/// Snapshot of all 20 pins. Always complete: pins with no recorded
/// activity are present as empty records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoRegistry {
    pub pins: Vec<PinRecord>,
}

impl IoRegistry {
    /// A registry with all 20 pins and no activity
    pub fn empty() -> Self {
        Self {
            pins: all_pin_labels().into_iter().map(PinRecord::empty).collect(),
        }
    }

    pub fn get(&self, label: &str) -> Option<&PinRecord> {
        self.pins.iter().find(|p| p.pin == label)
    }

    pub fn get_mut(&mut self, label: &str) -> Option<&mut PinRecord> {
        self.pins.iter_mut().find(|p| p.pin == label)
    }

    /// Merge a partial set of records (e.g. an IO_PIN snapshot) into a
    /// complete 20-entry registry.
    pub fn from_records(records: Vec<PinRecord>) -> Self {
        let mut registry = Self::empty();
        for rec in records {
            if let Some(label) = canonical_label(&rec.pin) {
                if let Some(slot) = registry.get_mut(&label) {
                    *slot = PinRecord { pin: label, ..rec };
                }
            }
        }
        registry
    }
}

impl Default for IoRegistry {
    fn default() -> Self {
        Self::empty()
    }
}
