//! Script stage: run the user post-processing script
//!
//! The script receives the documented `SAB_*` environment and the job's
//! final directory as its working directory. Its stdout is captured for the
//! history record; a non-zero exit is informational or fatal depending on
//! `script_can_fail`.

use crate::error::{Error, PostProcessError, Result};
use crate::nzb::NzbObject;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Crate version exported to scripts
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What the script run produced
#[derive(Debug, Clone)]
pub struct ScriptResult {
    /// The script's exit code
    pub exit_code: i32,
    /// Captured stdout+stderr
    pub output: String,
    /// Last non-empty output line, shown in the UI
    pub last_line: String,
}

/// Inputs assembled by the pipeline for the script environment
pub struct ScriptEnv<'a> {
    /// The job being finished
    pub job: &'a NzbObject,
    /// Final output directory
    pub final_dir: &'a Path,
    /// 0 on success so far, 1 after a failed stage
    pub pp_status: i32,
    /// Path to the stored `.nzb.gz` copy
    pub orig_nzb_gz: &'a Path,
    /// Seconds spent downloading
    pub download_seconds: u64,
}

/// Run the user script with the documented environment.
///
/// A script that dies on a signal or cannot be spawned surfaces
/// [`PostProcessError::ToolCrashed`] so the stage-level retry applies.
pub async fn run_script(
    script: &Path,
    env: &ScriptEnv<'_>,
    timeout: Duration,
) -> Result<ScriptResult> {
    let job = env.job;
    let mut command = Command::new(script);
    command
        .current_dir(env.final_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env("SAB_VERSION", VERSION)
        .env(
            "SAB_PROGRAM_DIR",
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(Path::to_path_buf))
                .unwrap_or_default(),
        )
        .env("SAB_PP_STATUS", env.pp_status.to_string())
        .env("SAB_FINAL_NAME", &job.name)
        .env("SAB_ORIG_NZB_GZ", env.orig_nzb_gz)
        .env("SAB_COMPLETE_DIR", env.final_dir)
        .env("SAB_NZO_ID", job.id.as_str())
        .env("SAB_FILENAME", &job.original_name)
        .env("SAB_CAT", job.category.as_deref().unwrap_or(""))
        .env("SAB_PP", (job.post_proc as i32).to_string())
        .env("SAB_SCRIPT", script)
        .env("SAB_GROUP", "")
        .env("SAB_FAIL_MSG", &job.fail_message)
        .env("SAB_URL", job.url.as_deref().unwrap_or(""))
        .env("SAB_BYTES_DOWNLOADED", job.bytes_downloaded.to_string())
        .env("SAB_BYTES", job.total_bytes.to_string())
        .env("SAB_DURATION", env.download_seconds.to_string());

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| {
            Error::PostProcess(PostProcessError::ToolCrashed {
                tool: script.display().to_string(),
                reason: format!("timed out after {timeout:?}"),
            })
        })?
        .map_err(|e| {
            Error::PostProcess(PostProcessError::ToolCrashed {
                tool: script.display().to_string(),
                reason: format!("failed to spawn: {e}"),
            })
        })?;

    let Some(exit_code) = output.status.code() else {
        return Err(Error::PostProcess(PostProcessError::ToolCrashed {
            tool: script.display().to_string(),
            reason: "terminated by signal".to_string(),
        }));
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    let last_line = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .to_string();

    Ok(ScriptResult {
        exit_code,
        output: text,
        last_line,
    })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::nzb::tests::make_file;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("pp.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn make_job() -> NzbObject {
        let mut job = NzbObject::from_parts(
            "Script Job",
            vec![make_file(0, 1, 1000)],
            Path::new("/tmp/admin"),
            None,
        );
        job.category = Some("tv".into());
        job.bytes_downloaded = 1000;
        job
    }

    #[tokio::test]
    async fn script_receives_documented_environment() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"echo "$SAB_FINAL_NAME|$SAB_CAT|$SAB_NZO_ID|$SAB_BYTES|$SAB_PP_STATUS""#,
        );
        let job = make_job();
        let env = ScriptEnv {
            job: &job,
            final_dir: dir.path(),
            pp_status: 0,
            orig_nzb_gz: Path::new("/admin/job.nzb.gz"),
            download_seconds: 42,
        };

        let result = run_script(&script, &env, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        let expected = format!("Script Job|tv|{}|1000|0", job.id);
        assert_eq!(result.last_line, expected);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo oops; exit 3");
        let job = make_job();
        let env = ScriptEnv {
            job: &job,
            final_dir: dir.path(),
            pp_status: 1,
            orig_nzb_gz: Path::new("/x.nzb.gz"),
            download_seconds: 0,
        };

        let result = run_script(&script, &env, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.last_line, "oops");
    }

    #[tokio::test]
    async fn hung_script_times_out_as_tool_crash() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 30");
        let job = make_job();
        let env = ScriptEnv {
            job: &job,
            final_dir: dir.path(),
            pp_status: 0,
            orig_nzb_gz: Path::new("/x.nzb.gz"),
            download_seconds: 0,
        };

        let result = run_script(&script, &env, Duration::from_millis(200)).await;
        assert!(matches!(
            result,
            Err(Error::PostProcess(PostProcessError::ToolCrashed { .. }))
        ));
    }

    #[tokio::test]
    async fn missing_script_is_a_tool_crash() {
        let dir = tempfile::tempdir().unwrap();
        let job = make_job();
        let env = ScriptEnv {
            job: &job,
            final_dir: dir.path(),
            pp_status: 0,
            orig_nzb_gz: Path::new("/x.nzb.gz"),
            download_seconds: 0,
        };

        let result = run_script(
            Path::new("/no/such/script.sh"),
            &env,
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(
            result,
            Err(Error::PostProcess(PostProcessError::ToolCrashed { .. }))
        ));
    }
}
