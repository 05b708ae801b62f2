// GCC Toolchain Driver
// Compiles the merged translation unit with the host C++ compiler in an
// isolated per-call temp directory. The directory is removed on return;
// a successful binary is moved into its own artifact dir first.

use super::{diagnostics, Artifact, CompileOutcome, Toolchain, ToolchainError};
use crate::sketch::{MergedUnit, SourceBundle};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

pub struct GccToolchain {
    compiler: String,
}

impl GccToolchain {
    pub fn new(compiler: impl Into<String>) -> Self {
        Self {
            compiler: compiler.into(),
        }
    }

    fn locate(&self) -> Result<PathBuf, ToolchainError> {
        which::which(&self.compiler).map_err(|_| {
            ToolchainError::Unavailable(format!(
                "compiler '{}' not found on PATH",
                self.compiler
            ))
        })
    }
}

#[async_trait]
impl Toolchain for GccToolchain {
    async fn compile(
        &self,
        unit: &MergedUnit,
        bundle: &SourceBundle,
    ) -> Result<CompileOutcome, ToolchainError> {
        let compiler = self.locate()?;

        // Fresh working directory per call, removed when this guard drops
        let build_dir = tempfile::Builder::new()
            .prefix("unobench-build-")
            .tempdir()?;

        let source_path = build_dir.path().join("sketch.ino");
        tokio::fs::write(&source_path, &unit.merged_source).await?;

        // Headers land next to the sketch so the compiler can resolve any
        // includes the merge step did not inline
        for header in &bundle.headers {
            if header.name.contains('/') || header.name.contains("..") {
                continue;
            }
            tokio::fs::write(build_dir.path().join(&header.name), &header.content).await?;
        }

        let binary_path = build_dir.path().join("sketch");
        let output = Command::new(&compiler)
            .arg("-x")
            .arg("c++")
            .arg("-std=gnu++17")
            .arg("-O1")
            .arg("-fno-diagnostics-color")
            .arg("-I")
            .arg(build_dir.path())
            .arg(&source_path)
            .arg("-o")
            .arg(&binary_path)
            .arg("-lpthread")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let success = output.status.success() && binary_path.exists();
        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let artifact = if success {
            if let Some((text, data, bss)) = size_report(&binary_path).await {
                let (program, ram) = diagnostics::format_size_lines(text, data, bss);
                stdout.push_str(&program);
                stdout.push('\n');
                stdout.push_str(&ram);
                stdout.push('\n');
            }
            for line in diagnostics::extract_size_lines(&stdout) {
                log::info!("{}", line);
            }

            // Move the binary out before the build dir is removed
            let artifact_dir = tempfile::Builder::new()
                .prefix("unobench-artifact-")
                .tempdir()?;
            let final_binary = artifact_dir.path().join("sketch");
            tokio::fs::copy(&binary_path, &final_binary).await?;

            Some(Artifact {
                dir: artifact_dir,
                binary: final_binary,
                processed_code: unit.processed_code.clone(),
                line_offset: unit.line_offset,
            })
        } else {
            None
        };

        let rewritten = diagnostics::rewrite(&stderr, build_dir.path(), unit.line_offset);
        let (errors, warnings) = diagnostics::severity_counts(&rewritten);
        log::info!(
            "compile finished: success={} ({} errors, {} warnings)",
            success,
            errors,
            warnings
        );

        Ok(CompileOutcome {
            success,
            output: stdout,
            diagnostics: rewritten,
            artifact,
        })
    }
}

/// text/data/bss of the linked binary, via the binutils `size` tool
async fn size_report(binary: &Path) -> Option<(u64, u64, u64)> {
    let size_tool = which::which("size").ok()?;
    let output = Command::new(size_tool)
        .arg(binary)
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;
    diagnostics::parse_size_output(&String::from_utf8_lossy(&output.stdout))
}
