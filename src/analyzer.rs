// Static Sketch Analyzer
// Best-effort advisory pass over raw sketch source: serial, hardware, pin
// and performance checks, analog-pin discovery, and a static I/O registry.
// Pure and deterministic; failures here must never block a compile.

use crate::pins::{self, IoRegistry, PinMode, PinOp};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

/// Baud rates accepted without comment
const STANDARD_BAUDS: [u32; 14] = [
    300, 1200, 2400, 4800, 9600, 19200, 31250, 38400, 57600, 74880, 115200, 230400, 250000,
    500000,
];

/// A delay this long inside loop() makes the simulation look hung
const LONG_DELAY_MS: u64 = 10_000;

// ==================== Advisory Messages ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisoryKind {
    Parser,
    Info,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisoryCategory {
    Serial,
    Hardware,
    Pins,
    Performance,
}

/// Structured advisory surfaced to the editor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advisory {
    pub id: String,
    pub kind: AdvisoryKind,
    pub category: AdvisoryCategory,
    pub severity: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Advisory {
    pub fn new(
        kind: AdvisoryKind,
        category: AdvisoryCategory,
        severity: u8,
        line: Option<u32>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let id = stable_id(&category, line, &message);
        Self {
            id,
            kind,
            category,
            severity,
            line,
            column: None,
            message,
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Stable identity from the fields that make an advisory "the same one"
/// across repeated analyses of the same source.
fn stable_id(category: &AdvisoryCategory, line: Option<u32>, message: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    format!("{:?}", category).hash(&mut hasher);
    line.hash(&mut hasher);
    message.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

/// Result of the advisory pass
#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub advisories: Vec<Advisory>,
    /// Analog pins referenced directly or through aliases, as registry labels
    pub analog_pins: BTreeSet<String>,
}

// ==================== Comment Stripping ====================

/// Blank out comments while preserving every newline, so commented-out
/// calls stop matching but reported line numbers stay true.
pub fn strip_comments(source: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        LineComment,
        BlockComment,
        StringLit,
        CharLit,
    }

    let mut out = String::with_capacity(source.len());
    let mut state = State::Code;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    out.push_str("  ");
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push_str("  ");
                    state = State::BlockComment;
                }
                '"' => {
                    out.push(c);
                    state = State::StringLit;
                }
                '\'' => {
                    out.push(c);
                    state = State::CharLit;
                }
                _ => out.push(c),
            },
            State::LineComment => {
                if c == '\n' {
                    out.push('\n');
                    state = State::Code;
                } else {
                    out.push(' ');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("  ");
                    state = State::Code;
                } else if c == '\n' {
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::StringLit => {
                out.push(c);
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else if c == '"' {
                    state = State::Code;
                }
            }
            State::CharLit => {
                out.push(c);
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else if c == '\'' {
                    state = State::Code;
                }
            }
        }
    }
    out
}

// ==================== Alias Resolution ====================

lazy_static! {
    static ref DEFINE_RE: Regex =
        Regex::new(r"(?m)^\s*#define\s+([A-Za-z_]\w*)\s+(A?\d+)\b").unwrap();
    static ref BINDING_RE: Regex = Regex::new(
        r"(?m)\b(?:const\s+)?(?:int|long|byte|uint8_t|unsigned\s+int)\s+([A-Za-z_]\w*)\s*=\s*(A?\d+)\b"
    )
    .unwrap();
    static ref FOR_RANGE_RE: Regex = Regex::new(
        r"for\s*\(\s*(?:int|byte|uint8_t)?\s*([A-Za-z_]\w*)\s*=\s*(A?\d+)\s*;\s*([A-Za-z_]\w*)\s*(<=|<)\s*(A?\d+)\s*;\s*([A-Za-z_]\w*)\s*(?:\+\+|\+=\s*1)"
    )
    .unwrap();
    static ref SERIAL_BEGIN_RE: Regex = Regex::new(r"Serial\.begin\s*\(\s*(\d+)").unwrap();
    static ref SERIAL_PRINT_RE: Regex =
        Regex::new(r"Serial\.(?:print|println|write)\s*\(").unwrap();
    static ref PIN_MODE_RE: Regex = Regex::new(
        r"pinMode\s*\(\s*([A-Za-z_]\w*|\d+)\s*,\s*(INPUT_PULLUP|INPUT|OUTPUT|[012])\s*\)"
    )
    .unwrap();
    static ref PIN_CALL_RE: Regex = Regex::new(
        r"\b(digitalWrite|digitalRead|analogWrite|analogRead)\s*\(\s*([A-Za-z_]\w*|\d+)"
    )
    .unwrap();
    static ref DELAY_RE: Regex = Regex::new(r"\bdelay\s*\(\s*(\d+)\s*\)").unwrap();
    static ref LOOP_FN_RE: Regex = Regex::new(r"void\s+loop\s*\(").unwrap();
}

/// Simple alias table: #define names and literal variable bindings
fn collect_aliases(stripped: &str) -> HashMap<String, String> {
    let mut aliases = HashMap::new();
    for cap in DEFINE_RE.captures_iter(stripped) {
        aliases.insert(cap[1].to_string(), cap[2].to_string());
    }
    for cap in BINDING_RE.captures_iter(stripped) {
        aliases.insert(cap[1].to_string(), cap[2].to_string());
    }
    aliases
}

/// Resolve a pin argument (literal or alias) to a numeric pin 0..=19
fn resolve_pin(token: &str, aliases: &HashMap<String, String>) -> Option<u8> {
    let value = aliases.get(token).map(String::as_str).unwrap_or(token);
    let label = pins::canonical_label(value)?;
    if let Some(analog) = label.strip_prefix('A') {
        analog.parse::<u8>().ok().map(|n| n + pins::ANALOG_PIN_BASE)
    } else {
        label.parse().ok()
    }
}

// ==================== Advisory Pass ====================

/// Run every advisory check plus analog-pin discovery over raw source.
pub fn analyze(source: &str) -> AnalysisReport {
    let stripped = strip_comments(source);
    let aliases = collect_aliases(&stripped);
    let mut report = AnalysisReport::default();

    let has_begin = SERIAL_BEGIN_RE.is_match(&stripped);
    let mut pin_mode_lines: HashMap<u8, u32> = HashMap::new();
    let mut reported_conflicts: BTreeSet<u8> = BTreeSet::new();
    let mut in_loop_depth: Option<i32> = None;

    for (idx, line) in stripped.lines().enumerate() {
        let line_no = idx as u32 + 1;

        for cap in SERIAL_BEGIN_RE.captures_iter(line) {
            let baud: u32 = cap[1].parse().unwrap_or(0);
            if !STANDARD_BAUDS.contains(&baud) {
                report.advisories.push(
                    Advisory::new(
                        AdvisoryKind::Parser,
                        AdvisoryCategory::Serial,
                        2,
                        Some(line_no),
                        format!("Serial.begin({}) uses a non-standard baud rate", baud),
                    )
                    .with_suggestion("Use a common rate such as 9600 or 115200"),
                );
            }
        }

        if !has_begin && SERIAL_PRINT_RE.is_match(line) {
            report.advisories.push(
                Advisory::new(
                    AdvisoryKind::Parser,
                    AdvisoryCategory::Serial,
                    2,
                    Some(line_no),
                    "Serial output used without Serial.begin()",
                )
                .with_suggestion("Call Serial.begin(9600) in setup()"),
            );
        }

        for cap in PIN_MODE_RE.captures_iter(line) {
            if let Some(pin) = resolve_pin(&cap[1], &aliases) {
                pin_mode_lines.entry(pin).or_insert(line_no);
            }
        }

        for cap in PIN_CALL_RE.captures_iter(line) {
            let call = &cap[1];
            let pin = resolve_pin(&cap[2], &aliases);
            if call == "analogWrite" {
                if let Some(pin) = pin {
                    if !pins::PWM_PINS.contains(&pin) {
                        report.advisories.push(
                            Advisory::new(
                                AdvisoryKind::Parser,
                                AdvisoryCategory::Hardware,
                                3,
                                Some(line_no),
                                format!("analogWrite on pin {} which has no PWM output", pin),
                            )
                            .with_suggestion("Use one of the PWM pins: 3, 5, 6, 9, 10, 11"),
                        );
                    }
                }
            }
        }

        // Long blocking delay inside loop(); tracked with a brace counter
        // because the check is line oriented.
        let loop_starts_here = LOOP_FN_RE.is_match(line);
        if loop_starts_here {
            in_loop_depth = Some(0);
        }
        if let Some(depth) = in_loop_depth.as_mut() {
            *depth += line.matches('{').count() as i32;
            *depth -= line.matches('}').count() as i32;
            let inside = *depth > 0 || loop_starts_here;
            if inside {
                for cap in DELAY_RE.captures_iter(line) {
                    let ms: u64 = cap[1].parse().unwrap_or(0);
                    if ms >= LONG_DELAY_MS {
                        report.advisories.push(Advisory::new(
                            AdvisoryKind::Info,
                            AdvisoryCategory::Performance,
                            1,
                            Some(line_no),
                            format!("delay({}) blocks loop() for {} seconds", ms, ms / 1000),
                        ));
                    }
                }
            }
            if *depth <= 0 && line.contains('}') {
                in_loop_depth = None;
            }
        }
    }

    // Second pass for pinMode/analogRead conflicts: needs the full pinMode
    // table before judging any analogRead.
    for (idx, line) in stripped.lines().enumerate() {
        let line_no = idx as u32 + 1;
        for cap in PIN_CALL_RE.captures_iter(line) {
            if &cap[1] != "analogRead" {
                continue;
            }
            if let Some(pin) = resolve_pin(&cap[2], &aliases) {
                if pin_mode_lines.contains_key(&pin) && reported_conflicts.insert(pin) {
                    report.advisories.push(
                        Advisory::new(
                            AdvisoryKind::Parser,
                            AdvisoryCategory::Pins,
                            2,
                            Some(line_no),
                            format!(
                                "Pin {} is configured with pinMode but also read with analogRead",
                                pin
                            ),
                        )
                        .with_suggestion("analogRead does not need pinMode; drop one of the two"),
                    );
                }
            }
        }
    }

    report.analog_pins = enumerate_analog_pins(&stripped, &aliases);
    report
}

/// Analog pins referenced directly, through aliases, or via short literal
/// for-loops over contiguous ranges. Returned as registry labels.
fn enumerate_analog_pins(stripped: &str, aliases: &HashMap<String, String>) -> BTreeSet<String> {
    let mut found = BTreeSet::new();

    lazy_static! {
        static ref DIRECT_A_RE: Regex = Regex::new(r"\bA([0-5])\b").unwrap();
    }
    for cap in DIRECT_A_RE.captures_iter(stripped) {
        found.insert(format!("A{}", &cap[1]));
    }

    // Aliased A-form values count from the definition alone; numeric 14..19
    // values only count when the alias actually reaches a pin call.
    for (name, value) in aliases {
        if let Some(label) = pins::canonical_label(value) {
            if !label.starts_with('A') {
                continue;
            }
            if value.starts_with('A') {
                found.insert(label);
            } else {
                let used = PIN_CALL_RE
                    .captures_iter(stripped)
                    .any(|cap| &cap[2] == name.as_str())
                    || PIN_MODE_RE
                        .captures_iter(stripped)
                        .any(|cap| &cap[1] == name.as_str());
                if used {
                    found.insert(label);
                }
            }
        }
    }

    // Numeric aliases used directly in pin calls
    for cap in PIN_CALL_RE.captures_iter(stripped) {
        if let Ok(n) = cap[2].parse::<u8>() {
            if let Some(label) = pins::canonical_label(&n.to_string()) {
                if label.starts_with('A') {
                    found.insert(label);
                }
            }
        }
    }

    for cap in FOR_RANGE_RE.captures_iter(stripped) {
        // All three occurrences must be the same loop variable
        if cap[1] != cap[3] || cap[1] != cap[6] {
            continue;
        }
        let start = resolve_pin(&cap[2], aliases);
        let end = resolve_pin(&cap[5], aliases);
        if let (Some(start), Some(end)) = (start, end) {
            let end = if &cap[4] == "<" { end.saturating_sub(1) } else { end };
            if end >= start && (end - start) < pins::PIN_COUNT as u8 {
                for pin in start..=end {
                    if let Some(label) = pins::canonical_label(&pin.to_string()) {
                        if label.starts_with('A') {
                            found.insert(label);
                        }
                    }
                }
            }
        }
    }

    found
}

// ==================== Static I/O Registry ====================

/// Build the compile-time view of the I/O registry by scanning for pin
/// operations. Always returns all 20 pins.
pub fn static_registry(source: &str) -> IoRegistry {
    let stripped = strip_comments(source);
    let aliases = collect_aliases(&stripped);
    let mut registry = IoRegistry::empty();

    for (idx, line) in stripped.lines().enumerate() {
        let line_no = idx as u32 + 1;

        for cap in PIN_MODE_RE.captures_iter(line) {
            let mode = match &cap[2] {
                "INPUT" | "0" => PinMode::Input,
                "OUTPUT" | "1" => PinMode::Output,
                _ => PinMode::InputPullup,
            };
            if let Some(pin) = resolve_pin(&cap[1], &aliases) {
                if let Some(label) = pins::canonical_label(&pin.to_string()) {
                    if let Some(rec) = registry.get_mut(&label) {
                        rec.apply_pin_mode(mode, line_no);
                    }
                }
            }
        }

        for cap in PIN_CALL_RE.captures_iter(line) {
            if let Some(pin) = resolve_pin(&cap[2], &aliases) {
                if let Some(label) = pins::canonical_label(&pin.to_string()) {
                    if let Some(rec) = registry.get_mut(&label) {
                        rec.push_op(PinOp::new(line_no, cap[1].to_string()));
                    }
                }
            }
        }
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comments_preserves_lines() {
        let src = "a // one\n/* two\nthree */ b\n\"// not a comment\"\n";
        let stripped = strip_comments(src);
        assert_eq!(stripped.lines().count(), src.lines().count());
        assert!(!stripped.contains("one"));
        assert!(!stripped.contains("three"));
        assert!(stripped.contains("\"// not a comment\""));
        assert!(stripped.contains('b'));
    }

    #[test]
    fn test_nonstandard_baud_flagged() {
        let report = analyze("void setup() { Serial.begin(12345); }");
        let adv = report
            .advisories
            .iter()
            .find(|a| a.category == AdvisoryCategory::Serial)
            .unwrap();
        assert_eq!(adv.severity, 2);
        assert_eq!(adv.line, Some(1));
        assert!(adv.message.contains("12345"));
    }

    #[test]
    fn test_standard_baud_clean() {
        let report = analyze("void setup() { Serial.begin(115200); }");
        assert!(report.advisories.is_empty());
    }

    #[test]
    fn test_print_without_begin() {
        let src = "void setup() {}\nvoid loop() { Serial.println(1); }";
        let report = analyze(src);
        let adv = report
            .advisories
            .iter()
            .find(|a| a.message.contains("Serial.begin"))
            .unwrap();
        assert_eq!(adv.category, AdvisoryCategory::Serial);
        assert_eq!(adv.line, Some(2));
    }

    #[test]
    fn test_commented_begin_does_not_count() {
        let src = "void setup() { /* Serial.begin(9600); */ }\nvoid loop() { Serial.print(1); }";
        let report = analyze(src);
        assert!(report
            .advisories
            .iter()
            .any(|a| a.message.contains("Serial.begin")));
    }

    #[test]
    fn test_analog_write_on_non_pwm_pin() {
        let report = analyze("void loop() { analogWrite(7, 128); }");
        let adv = report
            .advisories
            .iter()
            .find(|a| a.category == AdvisoryCategory::Hardware)
            .unwrap();
        assert_eq!(adv.severity, 3);
        assert!(adv.message.contains("pin 7"));
    }

    #[test]
    fn test_analog_write_on_pwm_pin_clean() {
        let report = analyze("void loop() { analogWrite(9, 128); }");
        assert!(report.advisories.is_empty());
    }

    #[test]
    fn test_pin_mode_analog_read_conflict() {
        let src = "void setup() { pinMode(A0, INPUT); }\nvoid loop() { analogRead(A0); }";
        let report = analyze(src);
        let adv = report
            .advisories
            .iter()
            .find(|a| a.category == AdvisoryCategory::Pins)
            .unwrap();
        assert_eq!(adv.severity, 2);
        assert_eq!(adv.line, Some(2));
    }

    #[test]
    fn test_long_delay_in_loop() {
        let src = "void loop() {\n  delay(60000);\n}";
        let report = analyze(src);
        let adv = report
            .advisories
            .iter()
            .find(|a| a.category == AdvisoryCategory::Performance)
            .unwrap();
        assert_eq!(adv.kind, AdvisoryKind::Info);
        assert_eq!(adv.line, Some(2));
    }

    #[test]
    fn test_analog_enumeration_direct_and_define() {
        let src = "#define SENSOR A3\nint other = A1;\nvoid loop() { analogRead(SENSOR); analogRead(A0); }";
        let report = analyze(src);
        assert!(report.analog_pins.contains("A0"));
        assert!(report.analog_pins.contains("A1"));
        assert!(report.analog_pins.contains("A3"));
    }

    #[test]
    fn test_analog_enumeration_numeric_alias() {
        let src = "const int probe = 17;\nvoid loop() { analogRead(probe); }";
        let report = analyze(src);
        assert!(report.analog_pins.contains("A3"));
    }

    #[test]
    fn test_analog_enumeration_for_loop() {
        let src = "void setup() { for (int i = A0; i <= A2; i++) { pinMode(i, INPUT); } }";
        let report = analyze(src);
        assert_eq!(
            report.analog_pins.iter().cloned().collect::<Vec<_>>(),
            vec!["A0", "A1", "A2"]
        );
    }

    #[test]
    fn test_static_registry_tracks_modes_and_ops() {
        let src = "void setup() {\n  pinMode(13, OUTPUT);\n}\nvoid loop() {\n  digitalWrite(13, HIGH);\n}";
        let registry = static_registry(src);
        let rec = registry.get("13").unwrap();
        assert!(rec.defined);
        assert_eq!(rec.defined_line, 2);
        assert_eq!(rec.mode, Some(PinMode::Output));
        assert_eq!(rec.ops.len(), 2);
        assert_eq!(rec.ops[1].op, "digitalWrite");
        assert_eq!(rec.ops[1].line, 5);
    }

    #[test]
    fn test_registry_complete_even_when_empty() {
        let registry = static_registry("void setup() {}\nvoid loop() {}");
        assert_eq!(registry.pins.len(), crate::pins::PIN_COUNT);
        assert!(registry.pins.iter().all(|p| !p.defined));
    }

    #[test]
    fn test_advisory_ids_stable() {
        let a = analyze("void loop() { analogWrite(7, 1); }");
        let b = analyze("void loop() { analogWrite(7, 1); }");
        assert_eq!(a.advisories[0].id, b.advisories[0].id);
    }

    #[test]
    fn test_analyzer_is_best_effort_on_garbage() {
        // Arbitrary non-C input must not panic
        let report = analyze("\u{0}\u{1} ]] [[ ::: pinMode(");
        assert!(report.advisories.len() < 10);
    }
}
