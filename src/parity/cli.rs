//! PAR2 handler backed by the external par2 binary

use super::parser::{ProgressLine, accumulate_repair, accumulate_verify, parse_line, parse_line_all};
use super::traits::{
    ParityCapabilities, ParityHandler, ProgressSink, RepairReport, VerifyReport,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Runs `par2 v`/`par2 r` and parses stdout line-by-line, streaming the
/// recognized progress lines into the caller's sink as they appear.
pub struct CliParityHandler {
    binary_path: PathBuf,
}

impl CliParityHandler {
    /// Create a handler with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Find `par2` in PATH; None when it is not installed
    pub fn from_path() -> Option<Self> {
        which::which("par2").ok().map(Self::new)
    }

    /// Run one par2 subcommand, collecting parsed lines and the exit status
    async fn run(
        &self,
        mode: &str,
        par2_file: &Path,
        progress: Option<ProgressSink>,
    ) -> Result<(Vec<ProgressLine>, bool)> {
        let mut child = Command::new(&self.binary_path)
            .arg(mode)
            .arg(par2_file)
            .current_dir(par2_file.parent().unwrap_or_else(|| Path::new(".")))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ExternalTool(format!("failed to execute par2: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ExternalTool("par2 stdout unavailable".to_string()))?;

        let mut collected = Vec::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| Error::ExternalTool(format!("reading par2 output: {e}")))?
        {
            // The sink gets the primary fact rendered for humans; the
            // accumulator gets every fact on the line
            if let (Some(sink), Some(parsed)) = (&progress, parse_line(&line)) {
                sink.send(render_progress(&parsed)).ok();
            }
            collected.extend(parse_line_all(&line));
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::ExternalTool(format!("waiting for par2: {e}")))?;

        if status.code().is_none() {
            // Killed by a signal: the tool died rather than failing
            return Err(Error::PostProcess(
                crate::error::PostProcessError::ToolCrashed {
                    tool: "par2".to_string(),
                    reason: "terminated by signal".to_string(),
                },
            ));
        }

        Ok((collected, status.success()))
    }
}

/// Render a parsed line back into the canonical display form
fn render_progress(line: &ProgressLine) -> String {
    match line {
        ProgressLine::Loading(file) => format!("Loading \"{file}\""),
        ProgressLine::Verifying { done, total } => format!("Verifying {done}/{total}"),
        ProgressLine::Repairing(pct) => format!("Repairing {pct:.0}%"),
        ProgressLine::NeedBlocks(blocks) => format!("Need {blocks} more recovery blocks"),
        ProgressLine::TargetMissing(file) => format!("Missing: {file}"),
        ProgressLine::TargetDamaged(file) => format!("Damaged: {file}"),
        ProgressLine::TargetFound(file) => format!("Verified: {file}"),
        ProgressLine::BlockCounts { found, total } => {
            format!("Found {found} of {total} data blocks")
        }
        ProgressLine::RecoveryBlocks(blocks) => format!("{blocks} recovery blocks available"),
        ProgressLine::RepairRequired => "Repair is required".to_string(),
        ProgressLine::RepairComplete => "Repair complete".to_string(),
        ProgressLine::RepairNotPossible => "Repair is not possible".to_string(),
        ProgressLine::AllCorrect => "All files are correct".to_string(),
    }
}

#[async_trait]
impl ParityHandler for CliParityHandler {
    async fn verify(
        &self,
        par2_file: &Path,
        progress: Option<ProgressSink>,
    ) -> Result<VerifyReport> {
        let (lines, exit_ok) = self.run("v", par2_file, progress).await?;
        Ok(accumulate_verify(&lines, exit_ok))
    }

    async fn repair(
        &self,
        par2_file: &Path,
        progress: Option<ProgressSink>,
    ) -> Result<RepairReport> {
        let (lines, exit_ok) = self.run("r", par2_file, progress).await?;
        Ok(accumulate_repair(&lines, exit_ok))
    }

    fn capabilities(&self) -> ParityCapabilities {
        ParityCapabilities {
            can_verify: true,
            can_repair: true,
        }
    }

    fn name(&self) -> &'static str {
        "cli-par2"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_path_agrees_with_which() {
        let which_result = which::which("par2");
        let from_path_result = CliParityHandler::from_path();
        assert_eq!(
            which_result.is_ok(),
            from_path_result.is_some(),
            "from_path() must mirror which::which()"
        );
    }

    #[tokio::test]
    async fn invalid_binary_path_reports_external_tool_error() {
        let handler = CliParityHandler::new(PathBuf::from("/nonexistent/path/to/par2"));
        let result = handler.verify(Path::new("/tmp/test.par2"), None).await;
        match result {
            Err(Error::ExternalTool(msg)) => {
                assert!(msg.contains("failed to execute par2"), "got: {msg}");
            }
            other => panic!("expected ExternalTool error, got {other:?}"),
        }
    }

    #[test]
    fn progress_rendering_matches_ui_contract() {
        assert_eq!(
            render_progress(&ProgressLine::Verifying { done: 12, total: 40 }),
            "Verifying 12/40"
        );
        assert_eq!(render_progress(&ProgressLine::Repairing(37.5)), "Repairing 38%");
        assert_eq!(
            render_progress(&ProgressLine::NeedBlocks(7)),
            "Need 7 more recovery blocks"
        );
    }

    // Integration tests that require an actual par2 binary.
    // Run with: cargo test --lib parity::cli -- --ignored

    #[tokio::test]
    #[ignore] // Requires par2 binary in PATH
    async fn integration_repair_round_trip() {
        use std::io::Write;

        let Some(handler) = CliParityHandler::from_path() else {
            return;
        };

        let temp = tempfile::tempdir().unwrap();
        let data_path = temp.path().join("payload.bin");
        let par2_path = temp.path().join("payload.bin.par2");
        let original = b"some payload that par2 will protect and repair\n".repeat(64);
        std::fs::write(&data_path, &original).unwrap();

        let create = Command::new(&handler.binary_path)
            .arg("c")
            .arg("-r30")
            .arg(&data_path)
            .current_dir(temp.path())
            .output()
            .await
            .unwrap();
        assert!(create.status.success());

        // Corrupt the payload
        {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .open(&data_path)
                .unwrap();
            f.write_all(b"CORRUPTED!").unwrap();
        }

        let verify = handler.verify(&par2_path, None).await.unwrap();
        assert!(!verify.all_intact);
        assert!(verify.repairable);

        let repair = handler.repair(&par2_path, None).await.unwrap();
        assert_eq!(repair.outcome, super::super::RepairOutcome::Ok);
        assert_eq!(std::fs::read(&data_path).unwrap(), original);
    }
}
