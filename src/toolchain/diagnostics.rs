// Diagnostic Rewriting
// Scrubs build-directory paths out of compiler output, maps merged-source
// line numbers back to the user's sketch, and extracts the program-size /
// RAM-usage summary lines.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::Path;

lazy_static! {
    static ref SKETCH_LOC_RE: Regex = Regex::new(r"sketch\.ino:(\d+):").unwrap();
    // Any absolute path ending in sketch.ino that survived the direct
    // build-dir scrub (symlinked temp roots, /private on macOS)
    static ref ABS_SKETCH_RE: Regex = Regex::new(r"(?:/[^\s:]+/)+sketch\.ino").unwrap();
    static ref SIZE_LINE_RE: Regex = Regex::new(r"(?m)^(?:Program size|RAM usage):.*$").unwrap();
    static ref ERROR_LINE_RE: Regex =
        Regex::new(r"^sketch\.ino:(\d+):(?:\d+:)?\s*(?:fatal )?error:\s*(.+)$").unwrap();
    static ref DIAGNOSTIC_RE: Regex = Regex::new(
        r"(?m)^(.+?):(\d+):(?:(\d+):)?\s*(error|warning|note|fatal error):\s*(.+)$"
    )
    .unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Note,
}

/// One parsed compiler diagnostic, post-rewrite: the file is the
/// user-facing name and the line the user-facing line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
    pub severity: DiagnosticSeverity,
    pub message: String,
}

/// Parse rewritten diagnostic text into structured entries
pub fn parse_diagnostics(text: &str) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    for cap in DIAGNOSTIC_RE.captures_iter(text) {
        let severity = match &cap[4] {
            "error" | "fatal error" => DiagnosticSeverity::Error,
            "warning" => DiagnosticSeverity::Warning,
            _ => DiagnosticSeverity::Note,
        };
        out.push(Diagnostic {
            file: cap[1].to_string(),
            line: cap[2].parse().unwrap_or(0),
            column: cap.get(3).and_then(|m| m.as_str().parse().ok()),
            severity,
            message: cap[5].to_string(),
        });
    }
    out
}

/// (errors, warnings) in a rewritten diagnostic stream
pub fn severity_counts(text: &str) -> (usize, usize) {
    let diagnostics = parse_diagnostics(text);
    let errors = diagnostics
        .iter()
        .filter(|d| d.severity == DiagnosticSeverity::Error)
        .count();
    let warnings = diagnostics
        .iter()
        .filter(|d| d.severity == DiagnosticSeverity::Warning)
        .count();
    (errors, warnings)
}

/// Rewrite raw compiler stderr into the user-facing diagnostic stream:
/// temp paths become `sketch.ino`, merged line numbers shift back by
/// `line_offset` (floored at 1), and recognized errors gain a hint line.
pub fn rewrite(raw: &str, build_dir: &Path, line_offset: u32) -> String {
    let dir_prefix = format!("{}/", build_dir.display());
    let scrubbed = raw.replace(&dir_prefix, "");
    let scrubbed = ABS_SKETCH_RE.replace_all(&scrubbed, "sketch.ino");

    let shifted = SKETCH_LOC_RE.replace_all(&scrubbed, |caps: &Captures| {
        let n: u32 = caps[1].parse().unwrap_or(1);
        format!("sketch.ino:{}:", n.saturating_sub(line_offset).max(1))
    });

    let mut out = String::with_capacity(shifted.len());
    for line in shifted.lines() {
        out.push_str(line);
        out.push('\n');
        if let Some(caps) = ERROR_LINE_RE.captures(line) {
            if let Some(hint) = suggest_fix(&caps[2]) {
                out.push_str("   hint: ");
                out.push_str(&hint);
                out.push('\n');
            }
        }
    }
    out
}

/// Pull the program-size and RAM-usage lines out of compile output,
/// verbatim and in order.
pub fn extract_size_lines(output: &str) -> Vec<String> {
    SIZE_LINE_RE
        .find_iter(output)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Build the summary lines from `size`-style section numbers
pub fn format_size_lines(text: u64, data: u64, bss: u64) -> (String, String) {
    (
        format!("Program size: {} bytes (text {} + data {})", text + data, text, data),
        format!("RAM usage: {} bytes (data {} + bss {})", data + bss, data, bss),
    )
}

/// Parse `size` output: `text data bss dec hex filename` under a header row
pub fn parse_size_output(output: &str) -> Option<(u64, u64, u64)> {
    let data_line = output.lines().nth(1)?;
    let parts: Vec<&str> = data_line.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }
    Some((
        parts[0].parse().ok()?,
        parts[1].parse().ok()?,
        parts[2].parse().ok()?,
    ))
}

/// One-line hints for the compile errors sketch authors hit most
pub fn suggest_fix(message: &str) -> Option<String> {
    let msg = message.to_lowercase();

    if msg.contains("was not declared in this scope") {
        return Some("Check the spelling, or declare the function above setup()".to_string());
    }
    if msg.contains("expected ';'") {
        return Some("Add the missing semicolon at the end of the previous statement".to_string());
    }
    if msg.contains("expected '}'") || msg.contains("expected declaration before '}'") {
        return Some("Check for unbalanced braces".to_string());
    }
    if msg.contains("no matching function for call") {
        return Some("Check the argument types against the function's signature".to_string());
    }
    if msg.contains("undefined reference to") {
        return Some("The function is declared but never defined".to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_path_scrub_and_line_shift() {
        let build = PathBuf::from("/tmp/unobench-build-x1");
        let raw = "/tmp/unobench-build-x1/sketch.ino:210:5: error: 'foo' was not declared in this scope\n";
        let out = rewrite(raw, &build, 200);
        assert!(out.starts_with("sketch.ino:10:5: error:"));
        assert!(!out.contains("/tmp/"));
    }

    #[test]
    fn test_line_floor_at_one() {
        let build = PathBuf::from("/tmp/b");
        let out = rewrite("/tmp/b/sketch.ino:3:1: error: x\n", &build, 50);
        assert!(out.starts_with("sketch.ino:1:"));
    }

    #[test]
    fn test_header_diagnostics_untouched() {
        let build = PathBuf::from("/tmp/b");
        let raw = "/tmp/b/util.h:4:2: warning: unused variable 'v'\n";
        let out = rewrite(raw, &build, 100);
        assert!(out.starts_with("util.h:4:2: warning:"));
    }

    #[test]
    fn test_error_gains_hint() {
        let build = PathBuf::from("/tmp/b");
        let raw = "/tmp/b/sketch.ino:9:3: error: 'blonk' was not declared in this scope\n";
        let out = rewrite(raw, &build, 0);
        assert!(out.contains("hint: Check the spelling"));
    }

    #[test]
    fn test_extract_size_lines_verbatim() {
        let (program, ram) = format_size_lines(1200, 64, 300);
        let output = format!("something else\n{}\n{}\ntrailing\n", program, ram);
        let lines = extract_size_lines(&output);
        assert_eq!(lines, vec![program, ram]);
    }

    #[test]
    fn test_parse_size_output() {
        let out = "   text    data     bss     dec     hex filename\n  12345    1234     567   14146    374a sketch\n";
        assert_eq!(parse_size_output(out), Some((12345, 1234, 567)));
        assert_eq!(parse_size_output("garbage"), None);
    }

    #[test]
    fn test_parse_diagnostics_structured() {
        let text = concat!(
            "sketch.ino:4:10: error: 'foo' was not declared in this scope\n",
            "util.h:2:1: warning: unused variable 'v'\n",
            "sketch.ino:9: note: in expansion of macro\n",
            "unrelated output line\n",
        );
        let diagnostics = parse_diagnostics(text);
        assert_eq!(diagnostics.len(), 3);
        assert_eq!(diagnostics[0].severity, DiagnosticSeverity::Error);
        assert_eq!(diagnostics[0].file, "sketch.ino");
        assert_eq!(diagnostics[0].line, 4);
        assert_eq!(diagnostics[0].column, Some(10));
        assert_eq!(diagnostics[1].severity, DiagnosticSeverity::Warning);
        assert_eq!(diagnostics[2].column, None);
        assert_eq!(severity_counts(text), (1, 1));
    }
}
