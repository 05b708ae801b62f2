// Toolchain Module
// Pluggable compile seam: the host hands a merged translation unit to a
// Toolchain implementation and gets back diagnostics with user-facing line
// numbers plus, on success, a session-scoped artifact.

pub mod diagnostics;
pub mod gcc;

use crate::sketch::{MergedUnit, SourceBundle};
use async_trait::async_trait;
use std::path::PathBuf;
use tempfile::TempDir;
use thiserror::Error;

/// Toolchain errors. `Unavailable` is deliberately distinct from a compile
/// failure: the latter is a normal outcome with diagnostics.
#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("Toolchain unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A successfully linked simulation binary. The temp dir owns the file's
/// lifetime; dropping the artifact removes it.
pub struct Artifact {
    pub dir: TempDir,
    pub binary: PathBuf,
    pub processed_code: String,
    pub line_offset: u32,
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("binary", &self.binary)
            .field("line_offset", &self.line_offset)
            .finish()
    }
}

/// Result of one compile call
#[derive(Debug)]
pub struct CompileOutcome {
    pub success: bool,
    /// Compiler stdout with synthesized program-size / RAM-usage lines
    pub output: String,
    /// Compiler stderr after path scrubbing and line-offset rewriting
    pub diagnostics: String,
    pub artifact: Option<Artifact>,
}

/// The pluggable compile-and-link seam. Implementations must be stateless
/// between calls and must remove their working directory on return.
#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn compile(
        &self,
        unit: &MergedUnit,
        bundle: &SourceBundle,
    ) -> Result<CompileOutcome, ToolchainError>;
}
