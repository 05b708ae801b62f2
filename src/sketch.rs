// Sketch Merging
// Turns a source bundle (main sketch + header tabs) into the single
// translation unit handed to the toolchain: quoted includes are inlined
// with framed bodies, the Arduino mock runtime is prepended, and the
// accumulated line offset is remembered for diagnostic rewriting.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A user header file included by quoted `#include`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderTab {
    pub name: String,
    pub content: String,
}

/// The compile input: exactly one main sketch plus any header tabs
#[derive(Debug, Clone, Default)]
pub struct SourceBundle {
    pub sketch: String,
    pub headers: Vec<HeaderTab>,
}

impl SourceBundle {
    pub fn new(sketch: impl Into<String>, headers: Vec<HeaderTab>) -> Self {
        Self {
            sketch: sketch.into(),
            headers,
        }
    }
}

/// Output of the merge step
#[derive(Debug, Clone)]
pub struct MergedUnit {
    /// Mock runtime + processed user code; what the toolchain compiles
    pub merged_source: String,
    /// User-visible merged view: sketch with header bodies inlined
    pub processed_code: String,
    /// Newlines sitting above the user's first line in merged_source
    /// (runtime lines + growth from header inlining)
    pub line_offset: u32,
}

#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("Sketch is missing required entry points: {0}")]
    MissingEntryPoints(String),
}

lazy_static! {
    static ref INCLUDE_RE: Regex = Regex::new(r#"^\s*#include\s*"([^"]+)"\s*$"#).unwrap();
    static ref SETUP_RE: Regex = Regex::new(r"void\s+setup\s*\(\s*(?:void)?\s*\)").unwrap();
    static ref LOOP_RE: Regex = Regex::new(r"void\s+loop\s*\(\s*(?:void)?\s*\)").unwrap();
}

fn strip_extension(name: &str) -> &str {
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

/// Header tab lookup: exact name, tab name without extension, or include
/// name without extension.
fn find_header<'a>(headers: &'a [HeaderTab], wanted: &str) -> Option<&'a HeaderTab> {
    headers.iter().find(|h| {
        h.name == wanted
            || strip_extension(&h.name) == wanted
            || h.name == strip_extension(wanted)
    })
}

/// Inline quoted includes and prepend the mock runtime.
///
/// Includes with no matching tab are left as-is for the compiler to
/// resolve against the headers written to the build directory.
pub fn merge(bundle: &SourceBundle, runtime: &str) -> Result<MergedUnit, MergeError> {
    let mut processed = String::with_capacity(bundle.sketch.len());
    let mut header_growth: u32 = 0;

    for line in bundle.sketch.lines() {
        let replaced = INCLUDE_RE
            .captures(line)
            .and_then(|cap| find_header(&bundle.headers, &cap[1]).map(|h| (cap, h)));

        match replaced {
            Some((cap, header)) => {
                let name = &cap[1];
                let body = header.content.trim_end_matches('\n');
                let replacement = format!(
                    "// --- Start of {} ---\n{}\n// --- End of {} ---",
                    name, body, name
                );
                header_growth += replacement.lines().count() as u32 - 1;
                processed.push_str(&replacement);
            }
            None => processed.push_str(line),
        }
        processed.push('\n');
    }

    let mut missing = Vec::new();
    if !SETUP_RE.is_match(&processed) {
        missing.push("void setup()");
    }
    if !LOOP_RE.is_match(&processed) {
        missing.push("void loop()");
    }
    if !missing.is_empty() {
        return Err(MergeError::MissingEntryPoints(missing.join(" and ")));
    }

    let mut merged_source = String::with_capacity(runtime.len() + processed.len() + 1);
    merged_source.push_str(runtime);
    if !merged_source.ends_with('\n') {
        merged_source.push('\n');
    }
    let runtime_lines = merged_source.matches('\n').count() as u32;
    merged_source.push_str(&processed);

    Ok(MergedUnit {
        merged_source,
        processed_code: processed,
        line_offset: runtime_lines + header_growth,
    })
}
