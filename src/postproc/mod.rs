//! Post-processing pipeline for completed jobs
//!
//! A staged FSM runs each finished job through Repair → Join → Unpack →
//! Deobfuscate → Cleanup → Move → Script → Finalize. One job is processed
//! at a time (the external tools are heavy); waiting jobs queue in a
//! separately-persisted secondary queue. A user-level pause suspends
//! transitions between stages at the next safe point without killing a
//! running tool. A failed stage skips everything except Finalize, and with
//! `safe_postproc` the Move stage never ships broken output.

mod join;
mod repair;
mod script;
mod unpack;

pub use join::{JoinedSet, join_split_sets};
pub use repair::{RepairStageResult, find_base_par2, run_repair_stage};
pub use script::{ScriptEnv, ScriptResult, run_script};
pub use unpack::{EXTRACT_SUBDIR, UnpackStageResult, run_unpack_stage};

use crate::config::Config;
use crate::downloader::Downloader;
use crate::error::{Error, PostProcessError, Result};
use crate::history::History;
use crate::nzb::NzbObject;
use crate::nzb::admin::{JobAdmin, JobAttributes};
use crate::parity::ParityHandler;
use crate::queue::{Queue, persistence};
use crate::supervisor::PauseState;
use crate::types::{Event, HistoryStatus, JobState, Stage};
use crate::utils::format_hms;
use chrono::Utc;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// How one trip through the pipeline ended
#[derive(Debug, PartialEq, Eq)]
enum Processed {
    /// The job reached Finalize and left the system
    Finished,
    /// The job went back to the download queue (extra PAR2 round, or an
    /// encrypted pause) and will come through again
    Requeued,
}

/// The post-processing pipeline executor
pub struct PostProcessor {
    config: Arc<Config>,
    queue: Arc<Queue>,
    downloader: Arc<Downloader>,
    history: Arc<History>,
    parity: Arc<dyn ParityHandler>,
    event_tx: broadcast::Sender<Event>,
    pause: Arc<PauseState>,
}

impl PostProcessor {
    /// Wire the pipeline to its collaborators
    pub fn new(
        config: Arc<Config>,
        queue: Arc<Queue>,
        downloader: Arc<Downloader>,
        history: Arc<History>,
        parity: Arc<dyn ParityHandler>,
        event_tx: broadcast::Sender<Event>,
        pause: Arc<PauseState>,
    ) -> Self {
        Self {
            config,
            queue,
            downloader,
            history,
            parity,
            event_tx,
            pause,
        }
    }

    /// Main loop: drain the persisted backlog, then process arrivals one at
    /// a time until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut job_rx: mpsc::UnboundedReceiver<NzbObject>,
        cancel: CancellationToken,
    ) {
        let admin_dir = self.config.folders.admin_dir.clone();
        let mut pending: VecDeque<NzbObject> = persistence::restore_postproc(&admin_dir)
            .unwrap_or_default()
            .into();
        tracing::info!(backlog = pending.len(), "post-processor started");

        loop {
            // Absorb everything already waiting in the channel
            while let Ok(job) = job_rx.try_recv() {
                pending.push_back(job);
            }
            self.persist_pending(&admin_dir, &pending);

            let job = match pending.pop_front() {
                Some(job) => job,
                None => {
                    tokio::select! {
                        received = job_rx.recv() => match received {
                            Some(job) => job,
                            None => break,
                        },
                        _ = cancel.cancelled() => break,
                    }
                }
            };
            self.persist_pending(&admin_dir, &pending);

            let id = job.id.clone();
            match self.process_job(job).await {
                Ok(outcome) => {
                    tracing::debug!(job = %id, ?outcome, "post-processing pass done");
                }
                Err(e) => {
                    // Component boundary: a pipeline error never kills the task
                    tracing::error!(job = %id, error = %e, "post-processing error");
                }
            }

            if cancel.is_cancelled() {
                break;
            }
        }
        tracing::info!("post-processor stopped");
    }

    fn persist_pending(&self, admin_dir: &Path, pending: &VecDeque<NzbObject>) {
        let jobs: Vec<NzbObject> = pending.iter().cloned().collect();
        if let Err(e) = persistence::persist_postproc(admin_dir, &jobs) {
            tracing::warn!(error = %e, "failed to persist post-processing queue");
        }
    }

    /// Suspend between stages while post-processing is paused
    async fn stage_boundary(&self) {
        while self.pause.postproc_paused() {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    fn stage_started(&self, job: &mut NzbObject, stage: Stage, state: JobState) -> Instant {
        job.state = state;
        self.emit(Event::StageStarted {
            id: job.id.clone(),
            stage,
        });
        Instant::now()
    }

    fn stage_finished(&self, job: &mut NzbObject, stage: Stage, started: Instant, ok: bool) {
        let elapsed = format_hms(started.elapsed());
        self.emit(Event::StageFinished {
            id: job.id.clone(),
            stage,
            ok,
            elapsed,
        });
    }

    /// Run one job through every stage
    async fn process_job(&self, mut job: NzbObject) -> Result<Processed> {
        let pp_started = Instant::now();
        let download_time = (Utc::now() - job.added_at)
            .to_std()
            .unwrap_or_default();
        let job_dir = self.config.folders.incomplete_dir.join(&job.name);
        let mut failed: Option<String> = None;
        let mut warnings: Vec<String> = Vec::new();

        tracing::info!(job = %job.id, dir = %job_dir.display(), "post-processing started");

        // Quick check: compare what's on disk against the descriptors.
        // Differences are what PAR2 is for, so only log them.
        job.state = JobState::QuickCheck;
        for file in &job.files {
            let path = job_dir.join(&file.filename);
            if crate::assembler::is_partial(&path, file.total_size, file.failed_bytes) {
                tracing::debug!(job = %job.id, file = %file.filename, "quick check: file short on disk");
            }
        }

        // --- Repair ---
        if job.post_proc >= crate::types::PostProcLevel::Repair {
            self.stage_boundary().await;
            // Repair hammers the same disk the assembler writes to; hold the
            // downloader until the stage ends
            self.pause.pause_by_postproc();
            let started = self.stage_started(&mut job, Stage::Repair, JobState::Verifying);
            let repair_result = self.repair_with_retry(&mut job, &job_dir).await;
            self.pause.resume_by_postproc();
            match repair_result {
                Ok(RepairStageResult::Ok) => {
                    let lines = job
                        .stage_log
                        .iter()
                        .find(|e| e.stage == "Repair")
                        .map(|e| e.lines.clone())
                        .unwrap_or_default();
                    let line = if lines.iter().any(|l| l.starts_with("Repairing")) {
                        format!("Repaired in {}", format_hms(started.elapsed()))
                    } else {
                        format!("Verified in {}", format_hms(started.elapsed()))
                    };
                    job.log_stage_line("Repair", line);
                    self.stage_finished(&mut job, Stage::Repair, started, true);
                }
                Ok(RepairStageResult::Skipped) => {
                    self.stage_finished(&mut job, Stage::Repair, started, true);
                }
                Ok(RepairStageResult::NeedsMoreBlocks(blocks)) => {
                    if !job.extra_par2.is_empty() {
                        job.repair_rounds += 1;
                        job.log_stage_line(
                            "Repair",
                            format!("Need {blocks} more recovery blocks, fetching extra PAR2"),
                        );
                        self.stage_finished(&mut job, Stage::Repair, started, true);
                        self.downloader.fetch_extra_par2(job, blocks)?;
                        return Ok(Processed::Requeued);
                    }
                    let reason = format!("need {blocks} more recovery blocks, none left to fetch");
                    self.apply_damage(&mut job, reason, &mut failed, &mut warnings);
                    self.stage_finished(&mut job, Stage::Repair, started, failed.is_none());
                }
                Ok(RepairStageResult::Damaged(reason)) => {
                    self.apply_damage(&mut job, reason, &mut failed, &mut warnings);
                    self.stage_finished(&mut job, Stage::Repair, started, failed.is_none());
                }
                Err(e) => {
                    failed = Some(e.to_string());
                    job.log_stage_line("Repair", e.to_string());
                    self.stage_finished(&mut job, Stage::Repair, started, false);
                }
            }
        }

        // --- Join ---
        if failed.is_none() && job.post_proc >= crate::types::PostProcLevel::Repair {
            self.stage_boundary().await;
            let started = self.stage_started(&mut job, Stage::Join, JobState::Repairing);
            match join_split_sets(&job_dir) {
                Ok(joined) => {
                    for set in &joined {
                        job.log_stage_line(
                            "Join",
                            format!(
                                "Joined {} parts into {}",
                                set.parts,
                                set.output
                                    .file_name()
                                    .map(|n| n.to_string_lossy().into_owned())
                                    .unwrap_or_default()
                            ),
                        );
                    }
                    self.stage_finished(&mut job, Stage::Join, started, true);
                }
                Err(e) => {
                    warnings.push(format!("join failed: {e}"));
                    job.log_stage_line("Join", format!("Join failed: {e}"));
                    self.stage_finished(&mut job, Stage::Join, started, false);
                }
            }
        }

        // --- Unpack ---
        let mut cleanup_sources: Vec<PathBuf> = Vec::new();
        if failed.is_none() && job.post_proc >= crate::types::PostProcLevel::Unpack {
            self.stage_boundary().await;
            self.pause.pause_by_postproc();
            let started = self.stage_started(&mut job, Stage::Unpack, JobState::Extracting);
            let unpack_result = run_unpack_stage(&job, &job_dir, &self.config.processing).await;
            self.pause.resume_by_postproc();
            match unpack_result {
                Ok(UnpackStageResult::Ok {
                    files,
                    sources,
                    used_password,
                }) => {
                    job.log_stage_line("Unpack", format!("Extracted {} files", files.len()));
                    if let Some(password) = used_password {
                        self.remember_password(&job, password);
                    }
                    cleanup_sources = sources;
                    self.stage_finished(&mut job, Stage::Unpack, started, true);
                }
                Ok(UnpackStageResult::Skipped) => {
                    self.stage_finished(&mut job, Stage::Unpack, started, true);
                }
                Ok(UnpackStageResult::Encrypted) => {
                    job.fail_message = "Encrypted".to_string();
                    job.log_stage_line("Unpack", "Archive requires a password".to_string());
                    self.emit(Event::Encrypted { id: job.id.clone() });
                    self.stage_finished(&mut job, Stage::Unpack, started, false);

                    if self.config.processing.pause_on_pwrar {
                        // Park the job paused in the queue; a resume with the
                        // password set brings it back through the pipeline
                        job.state = JobState::Paused;
                        job.paused_by_user = true;
                        self.pause.pause_postproc_flag();
                        self.queue.add(
                            job,
                            crate::queue::AddPosition::Bottom,
                            crate::config::DuplicateAction::Ignore,
                            None,
                        )?;
                        return Ok(Processed::Requeued);
                    }
                    warnings.push("Encrypted".to_string());
                }
                Err(e) => {
                    failed = Some(e.to_string());
                    job.log_stage_line("Unpack", e.to_string());
                    self.stage_finished(&mut job, Stage::Unpack, started, false);
                }
            }
        }

        // --- Deobfuscate ---
        if failed.is_none() && self.config.processing.deobfuscation.enabled {
            self.stage_boundary().await;
            let started = self.stage_started(&mut job, Stage::Deobfuscate, JobState::Extracting);
            let target = {
                let extracted = job_dir.join(EXTRACT_SUBDIR);
                if extracted.is_dir() { extracted } else { job_dir.clone() }
            };
            match crate::deobfuscation::deobfuscate_files(
                &target,
                &job.name,
                self.config.processing.deobfuscation.min_file_size,
            ) {
                Ok(renames) => {
                    for r in &renames {
                        job.log_stage_line(
                            "Deobfuscate",
                            format!(
                                "{} -> {}",
                                r.from.file_name().unwrap_or_default().to_string_lossy(),
                                r.to.file_name().unwrap_or_default().to_string_lossy()
                            ),
                        );
                    }
                    self.stage_finished(&mut job, Stage::Deobfuscate, started, true);
                }
                Err(e) => {
                    warnings.push(format!("deobfuscation failed: {e}"));
                    self.stage_finished(&mut job, Stage::Deobfuscate, started, false);
                }
            }
        }

        // --- Cleanup ---
        if failed.is_none() {
            self.stage_boundary().await;
            let started = self.stage_started(&mut job, Stage::Cleanup, JobState::Extracting);
            if let Err(e) = self.run_cleanup(&job, &job_dir, &cleanup_sources) {
                warnings.push(format!("cleanup failed: {e}"));
            }
            self.stage_finished(&mut job, Stage::Cleanup, started, true);
        }

        // --- Move ---
        let mut final_dir: Option<PathBuf> = None;
        let skip_move = self.config.processing.safe_postproc && failed.is_some();
        if !skip_move && failed.is_none() {
            self.stage_boundary().await;
            let started = self.stage_started(&mut job, Stage::Move, JobState::Moving);
            match self.run_move(&job, &job_dir) {
                Ok(dest) => {
                    self.emit(Event::StageProgress {
                        id: job.id.clone(),
                        stage: Stage::Move,
                        line: format!("Moved to {}", dest.display()),
                    });
                    final_dir = Some(dest);
                    self.stage_finished(&mut job, Stage::Move, started, true);
                }
                Err(e) => {
                    failed = Some(e.to_string());
                    job.log_stage_line("Move", e.to_string());
                    self.stage_finished(&mut job, Stage::Move, started, false);
                }
            }
        } else if skip_move {
            tracing::info!(job = %job.id, "safe-postproc: skipping move after failed stage");
            job.log_stage_line("Move", "Skipped: earlier stage failed".to_string());
        }

        // --- Script ---
        if let Some(script) = self.config.processing.script.clone() {
            self.stage_boundary().await;
            let started = self.stage_started(&mut job, Stage::Script, JobState::RunningScript);
            let work_dir = final_dir.clone().unwrap_or_else(|| job_dir.clone());
            let admin = JobAdmin::create(&job.admin_dir)?;
            let nzb_gz = admin.nzb_gz_path(&job.name);
            let env = ScriptEnv {
                job: &job,
                final_dir: &work_dir,
                pp_status: i32::from(failed.is_some()),
                orig_nzb_gz: &nzb_gz,
                download_seconds: download_time.as_secs(),
            };

            let mut attempt = 0;
            let outcome = loop {
                match run_script(&script, &env, self.config.processing.script_timeout).await {
                    Ok(result) => break Ok(result),
                    Err(Error::PostProcess(PostProcessError::ToolCrashed { .. })) if attempt == 0 => {
                        attempt += 1;
                        tracing::warn!(job = %job.id, "script crashed, retrying once");
                    }
                    Err(e) => break Err(e),
                }
            };

            match outcome {
                Ok(result) => {
                    if !result.last_line.is_empty() {
                        job.log_stage_line("Script", result.last_line.clone());
                    }
                    let script_failed =
                        result.exit_code != 0 && self.config.processing.script_can_fail;
                    if script_failed && failed.is_none() {
                        failed = Some(format!("script exited with code {}", result.exit_code));
                    } else if result.exit_code != 0 {
                        warnings.push(format!("script exited with code {}", result.exit_code));
                    }
                    self.stage_finished(&mut job, Stage::Script, started, result.exit_code == 0);
                }
                Err(e) => {
                    if self.config.processing.script_can_fail && failed.is_none() {
                        failed = Some(e.to_string());
                    } else {
                        warnings.push(e.to_string());
                    }
                    self.stage_finished(&mut job, Stage::Script, started, false);
                }
            }
        }

        // --- Finalize ---
        self.finalize(
            job,
            failed,
            warnings,
            final_dir,
            download_time,
            pp_started.elapsed(),
        )
        .await?;
        Ok(Processed::Finished)
    }

    /// Damaged set: continue with a warning iff `allow_incomplete`
    fn apply_damage(
        &self,
        job: &mut NzbObject,
        reason: String,
        failed: &mut Option<String>,
        warnings: &mut Vec<String>,
    ) {
        job.log_stage_line("Repair", format!("Repair is not possible: {reason}"));
        if self.config.processing.allow_incomplete {
            warnings.push(reason);
        } else {
            *failed = Some(format!("Repair is not possible: {reason}"));
        }
    }

    /// Repair with a single retry when the tool itself crashes
    async fn repair_with_retry(
        &self,
        job: &mut NzbObject,
        job_dir: &Path,
    ) -> Result<RepairStageResult> {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let mut attempt = 0;
        let result = loop {
            match run_repair_stage(&job.id, job_dir, self.parity.as_ref(), &self.event_tx, &lines)
                .await
            {
                Ok(result) => break Ok(result),
                Err(Error::PostProcess(PostProcessError::ToolCrashed { .. })) if attempt == 0 => {
                    attempt += 1;
                    tracing::warn!(job = %job.id, "par2 crashed, retrying once");
                }
                Err(e) => break Err(e),
            }
        };
        #[allow(clippy::expect_used)]
        for line in lines.lock().expect("stage log poisoned").drain(..) {
            job.log_stage_line("Repair", line);
        }
        result
    }

    /// Record the working password in the job admin attributes
    fn remember_password(&self, job: &NzbObject, password: String) {
        if let Ok(admin) = JobAdmin::create(&job.admin_dir) {
            let mut attrs = admin.load_attributes().unwrap_or_default();
            attrs.password = Some(password);
            attrs.category = job.category.clone();
            attrs.priority = Some(job.priority);
            attrs.url = job.url.clone();
            if let Err(e) = admin.save_attributes(&attrs) {
                tracing::warn!(job = %job.id, error = %e, "failed to record password");
            }
        }
    }

    /// Cleanup stage body: source archives, PAR2 files, unwanted extensions
    fn run_cleanup(&self, job: &NzbObject, job_dir: &Path, sources: &[PathBuf]) -> Result<()> {
        if self.config.processing.delete_sources
            && job.post_proc >= crate::types::PostProcLevel::Delete
        {
            for source in sources {
                if source.exists() {
                    std::fs::remove_file(source)?;
                }
            }
            // Trailing RAR volumes and the PAR2 set itself
            for entry in std::fs::read_dir(job_dir)? {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                let ext = path
                    .extension()
                    .map(|e| e.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                let is_rar_volume =
                    ext == "rar" || (ext.len() == 3 && ext.starts_with('r') && ext[1..].parse::<u32>().is_ok());
                if ext == "par2" || is_rar_volume {
                    std::fs::remove_file(&path)?;
                }
            }
        }

        for entry in std::fs::read_dir(job_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if self
                .config
                .processing
                .cleanup_extensions
                .iter()
                .any(|c| c.to_lowercase() == ext)
            {
                tracing::debug!(job = %job.id, file = %path.display(), "cleanup: removing");
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Move stage body: ship the result tree to the completion directory
    fn run_move(&self, job: &NzbObject, job_dir: &Path) -> Result<PathBuf> {
        let mut dest_root = self.config.folders.complete_dir.clone();
        if let Some(category) = &job.category {
            let sub = self
                .config
                .categories
                .get(category)
                .and_then(|c| c.destination.clone())
                .unwrap_or_else(|| PathBuf::from(category));
            dest_root = dest_root.join(sub);
        }
        let dest = crate::utils::get_unique_path(&dest_root.join(&job.name))?;
        std::fs::create_dir_all(&dest)?;

        // Prefer the extracted tree; fall back to the raw job files
        let extracted = job_dir.join(EXTRACT_SUBDIR);
        let source = if extracted.is_dir() { extracted } else { job_dir.to_path_buf() };
        move_tree(&source, &dest)?;

        // Whatever remains outside the extracted tree (when it existed)
        if source != *job_dir {
            move_remaining_files(job_dir, &dest)?;
        }
        Ok(dest)
    }

    /// Write history, drop the admin directory, clean the incomplete tree
    async fn finalize(
        &self,
        mut job: NzbObject,
        failed: Option<String>,
        warnings: Vec<String>,
        final_dir: Option<PathBuf>,
        download_time: std::time::Duration,
        postproc_time: std::time::Duration,
    ) -> Result<()> {
        let status = if failed.is_none() {
            job.state = JobState::Completed;
            HistoryStatus::Completed
        } else {
            job.state = JobState::Failed;
            HistoryStatus::Failed
        };
        if let Some(reason) = failed {
            job.fail_message = reason;
        }
        for warning in warnings {
            job.log_stage_line("Finalize", format!("Warning: {warning}"));
        }

        // The history write is durable before anything else is torn down
        self.history
            .append(
                &job,
                status,
                final_dir.as_deref(),
                download_time,
                postproc_time,
            )
            .await?;

        let admin = JobAdmin::create(&job.admin_dir)?;
        admin.delete()?;

        let job_dir = self.config.folders.incomplete_dir.join(&job.name);
        if final_dir.is_some() && job_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&job_dir) {
                tracing::warn!(job = %job.id, error = %e, "failed to remove incomplete directory");
            }
        }

        match status {
            HistoryStatus::Completed => {
                tracing::info!(job = %job.id, "job completed");
                self.emit(Event::Complete {
                    id: job.id.clone(),
                    path: final_dir.unwrap_or_default(),
                });
            }
            HistoryStatus::Failed => {
                tracing::warn!(job = %job.id, reason = %job.fail_message, "job failed");
                self.emit(Event::JobFailed {
                    id: job.id.clone(),
                    reason: job.fail_message.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Move a directory tree into `dest`, entry by entry. Rename first; fall
/// back to copy+remove for cross-device moves. The `__ADMIN__` subtree
/// stays behind (it is deleted by Finalize, after the history write).
fn move_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == "__ADMIN__" {
            continue;
        }
        let from = entry.path();
        let to = dest.join(&name);
        move_entry(&from, &to)?;
    }
    Ok(())
}

/// Move every remaining regular file (not directories) of the job root
fn move_remaining_files(job_dir: &Path, dest: &Path) -> Result<()> {
    for entry in std::fs::read_dir(job_dir)? {
        let entry = entry?;
        let from = entry.path();
        if !from.is_file() {
            continue;
        }
        let to = dest.join(entry.file_name());
        if !to.exists() {
            move_entry(&from, &to)?;
        }
    }
    Ok(())
}

fn move_entry(from: &Path, to: &Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) if from.is_dir() => {
            std::fs::create_dir_all(to)?;
            for entry in std::fs::read_dir(from)? {
                let entry = entry?;
                move_entry(&entry.path(), &to.join(entry.file_name()))?;
            }
            std::fs::remove_dir(from)?;
            Ok(())
        }
        Err(_) => {
            std::fs::copy(from, to).map_err(|e| {
                Error::PostProcess(PostProcessError::MoveFailed {
                    source_path: from.to_path_buf(),
                    dest_path: to.to_path_buf(),
                    reason: e.to_string(),
                })
            })?;
            std::fs::remove_file(from)?;
            Ok(())
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ArticleCache;
    use crate::nzb::tests::make_file;
    use zip::unstable::write::FileOptionsExt;
    use crate::parity::{
        NoOpParityHandler, ParityCapabilities, ProgressSink, RepairOutcome, RepairReport,
        VerifyReport,
    };
    use crate::pool::ServerPool;
    use crate::types::{JobId, PostProcLevel, Priority};
    use async_trait::async_trait;

    struct Rig {
        pp: PostProcessor,
        queue: Arc<Queue>,
        history: Arc<History>,
        dirs: tempfile::TempDir,
    }

    /// Handler that reports a shortfall on the first verify, intact after
    struct NeedsBlocksOnce {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl ParityHandler for NeedsBlocksOnce {
        async fn verify(
            &self,
            _par2: &Path,
            _progress: Option<ProgressSink>,
        ) -> Result<VerifyReport> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call == 0 {
                Ok(VerifyReport {
                    needed_blocks: 4,
                    damaged_blocks: 10,
                    recovery_blocks: 6,
                    ..Default::default()
                })
            } else {
                Ok(VerifyReport {
                    all_intact: true,
                    ..Default::default()
                })
            }
        }

        async fn repair(
            &self,
            _par2: &Path,
            _progress: Option<ProgressSink>,
        ) -> Result<RepairReport> {
            Ok(RepairReport {
                outcome: RepairOutcome::Ok,
                repaired_files: vec![],
            })
        }

        fn capabilities(&self) -> ParityCapabilities {
            ParityCapabilities {
                can_verify: true,
                can_repair: true,
            }
        }

        fn name(&self) -> &'static str {
            "needs-blocks-once"
        }
    }

    async fn rig_with(parity: Arc<dyn ParityHandler>, configure: impl FnOnce(&mut Config)) -> Rig {
        let dirs = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.folders.admin_dir = dirs.path().join("admin");
        config.folders.incomplete_dir = dirs.path().join("incomplete");
        config.folders.complete_dir = dirs.path().join("complete");
        config.processing.par2_path = None;
        configure(&mut config);
        let config = Arc::new(config);

        let queue = Arc::new(Queue::open(config.folders.admin_dir.clone()).unwrap());
        let pool = Arc::new(ServerPool::new(vec![], config.download.network_timeout));
        let cache = Arc::new(ArticleCache::new(1024));
        let (event_tx, _) = broadcast::channel(256);
        let (kick_tx, _kick_rx) = mpsc::unbounded_channel();
        let (complete_tx, _complete_rx) = mpsc::unbounded_channel();
        let (failed_tx, _failed_rx) = mpsc::unbounded_channel();
        let pause = Arc::new(PauseState::new());

        let downloader = Arc::new(Downloader::new(
            queue.clone(),
            pool,
            cache,
            config.clone(),
            event_tx.clone(),
            kick_tx,
            complete_tx,
            failed_tx,
            pause.clone(),
        ));
        let history = Arc::new(History::open(&config.folders.admin_dir).await.unwrap());

        let pp = PostProcessor::new(
            config,
            queue.clone(),
            downloader,
            history.clone(),
            parity,
            event_tx,
            pause,
        );
        Rig {
            pp,
            queue,
            history,
            dirs,
        }
    }

    fn seed_job(rig: &Rig, name: &str, post_proc: PostProcLevel) -> NzbObject {
        let mut job = NzbObject::from_parts(
            name,
            vec![make_file(0, 2, 500)],
            rig.pp.config.folders.admin_dir.as_path(),
            None,
        );
        job.post_proc = post_proc;
        job.bytes_downloaded = 1000;
        job.state = JobState::Checking;

        // Materialize the downloaded file on disk
        let job_dir = rig.pp.config.folders.incomplete_dir.join(&job.name);
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("file0.bin"), vec![0u8; 1000]).unwrap();
        JobAdmin::create(&job.admin_dir).unwrap();
        job
    }

    #[tokio::test]
    async fn skip_level_job_moves_straight_to_complete() {
        let rig = rig_with(Arc::new(NoOpParityHandler), |_| {}).await;
        let job = seed_job(&rig, "Plain Job", PostProcLevel::Skip);
        let id = job.id.clone();

        let outcome = rig.pp.process_job(job).await.unwrap();
        assert_eq!(outcome, Processed::Finished);

        let final_file = rig
            .pp
            .config
            .folders
            .complete_dir
            .join("Plain Job")
            .join("file0.bin");
        assert!(final_file.exists(), "payload must land in complete_dir");
        assert_eq!(std::fs::metadata(&final_file).unwrap().len(), 1000);

        let record = rig.history.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, "Completed");
        assert_eq!(record.fail_message, "");
        // Admin directory is gone after the durable history write
        assert!(!rig
            .pp
            .config
            .folders
            .admin_dir
            .join("Plain Job")
            .join("__ADMIN__")
            .exists());
    }

    #[tokio::test]
    async fn category_nests_the_destination() {
        let rig = rig_with(Arc::new(NoOpParityHandler), |_| {}).await;
        let mut job = seed_job(&rig, "Categorized", PostProcLevel::Skip);
        job.category = Some("tv".into());

        rig.pp.process_job(job).await.unwrap();

        assert!(rig
            .pp
            .config
            .folders
            .complete_dir
            .join("tv")
            .join("Categorized")
            .join("file0.bin")
            .exists());
    }

    #[tokio::test]
    async fn name_collision_gets_unique_suffix() {
        let rig = rig_with(Arc::new(NoOpParityHandler), |_| {}).await;
        let occupied = rig.pp.config.folders.complete_dir.join("Taken");
        std::fs::create_dir_all(&occupied).unwrap();

        let job = seed_job(&rig, "Taken", PostProcLevel::Skip);
        rig.pp.process_job(job).await.unwrap();

        assert!(rig
            .pp
            .config
            .folders
            .complete_dir
            .join("Taken (1)")
            .join("file0.bin")
            .exists());
    }

    #[tokio::test]
    async fn needs_more_blocks_requeues_at_repair_priority() {
        let parity = Arc::new(NeedsBlocksOnce {
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let rig = rig_with(parity, |_| {}).await;

        let mut job = seed_job(&rig, "Shortfall", PostProcLevel::Repair);
        // Give the job a PAR2 set on disk and withheld volumes
        let job_dir = rig.pp.config.folders.incomplete_dir.join(&job.name);
        std::fs::write(job_dir.join("set.par2"), b"par2 index").unwrap();
        let mut vol = make_file(1, 1, 400);
        vol.filename = "set.vol000+08.par2".into();
        vol.is_par2 = true;
        vol.par2_blocks = 8;
        job.extra_par2.push(vol);
        let id = job.id.clone();

        let outcome = rig.pp.process_job(job).await.unwrap();
        assert_eq!(outcome, Processed::Requeued);

        // The job went back to the download queue at Repair priority
        let (priority, state, extra_left) = rig
            .queue
            .with_job(&id, |j| (j.priority, j.state, j.extra_par2.len()))
            .unwrap();
        assert_eq!(priority, Priority::Repair);
        assert_eq!(state, JobState::FetchingExtraPar2);
        assert_eq!(extra_left, 0, "the volume was promoted for fetching");
        assert!(rig.history.get(&id).await.unwrap().is_none(), "not finished yet");
    }

    #[tokio::test]
    async fn unrepairable_without_allow_incomplete_fails_job() {
        struct AlwaysDamaged;
        #[async_trait]
        impl ParityHandler for AlwaysDamaged {
            async fn verify(&self, _: &Path, _: Option<ProgressSink>) -> Result<VerifyReport> {
                Ok(VerifyReport {
                    damaged_blocks: 100,
                    recovery_blocks: 0,
                    ..Default::default()
                })
            }
            async fn repair(&self, _: &Path, _: Option<ProgressSink>) -> Result<RepairReport> {
                Ok(RepairReport {
                    outcome: RepairOutcome::Damaged("hopeless".into()),
                    repaired_files: vec![],
                })
            }
            fn capabilities(&self) -> ParityCapabilities {
                ParityCapabilities {
                    can_verify: true,
                    can_repair: true,
                }
            }
            fn name(&self) -> &'static str {
                "always-damaged"
            }
        }

        let rig = rig_with(Arc::new(AlwaysDamaged), |_| {}).await;
        let job = seed_job(&rig, "Doomed", PostProcLevel::Repair);
        let job_dir = rig.pp.config.folders.incomplete_dir.join(&job.name);
        std::fs::write(job_dir.join("set.par2"), b"par2 index").unwrap();
        let id = job.id.clone();

        rig.pp.process_job(job).await.unwrap();

        let record = rig.history.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, "Failed");
        assert!(record.fail_message.contains("Repair is not possible"));
        // safe_postproc: nothing may land in complete_dir
        assert!(!rig.pp.config.folders.complete_dir.join("Doomed").exists());
    }

    #[tokio::test]
    async fn allow_incomplete_turns_damage_into_warning() {
        struct AlwaysDamaged;
        #[async_trait]
        impl ParityHandler for AlwaysDamaged {
            async fn verify(&self, _: &Path, _: Option<ProgressSink>) -> Result<VerifyReport> {
                Ok(VerifyReport {
                    damaged_blocks: 5,
                    recovery_blocks: 0,
                    ..Default::default()
                })
            }
            async fn repair(&self, _: &Path, _: Option<ProgressSink>) -> Result<RepairReport> {
                Ok(RepairReport {
                    outcome: RepairOutcome::Damaged("x".into()),
                    repaired_files: vec![],
                })
            }
            fn capabilities(&self) -> ParityCapabilities {
                ParityCapabilities {
                    can_verify: true,
                    can_repair: true,
                }
            }
            fn name(&self) -> &'static str {
                "always-damaged"
            }
        }

        let rig = rig_with(Arc::new(AlwaysDamaged), |c| {
            c.processing.allow_incomplete = true;
        })
        .await;
        let job = seed_job(&rig, "Tolerated", PostProcLevel::Repair);
        let job_dir = rig.pp.config.folders.incomplete_dir.join(&job.name);
        std::fs::write(job_dir.join("set.par2"), b"par2 index").unwrap();
        let id = job.id.clone();

        rig.pp.process_job(job).await.unwrap();

        let record = rig.history.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, "Completed", "damage tolerated by config");
        assert!(rig
            .pp
            .config
            .folders
            .complete_dir
            .join("Tolerated")
            .join("file0.bin")
            .exists());
    }

    #[tokio::test]
    async fn encrypted_archive_pauses_job_with_reason() {
        let rig = rig_with(Arc::new(NoOpParityHandler), |c| {
            c.processing.pause_on_pwrar = true;
        })
        .await;

        let mut job = seed_job(&rig, "Locked", PostProcLevel::Unpack);
        job.password = None;
        let job_dir = rig.pp.config.folders.incomplete_dir.join(&job.name);
        // A password-protected zip with no candidate password anywhere
        let file = std::fs::File::create(job_dir.join("secret.zip")).unwrap();
        let mut writer = ::zip::ZipWriter::new(file);
        let options = ::zip::write::FileOptions::default()
            .compression_method(::zip::CompressionMethod::Stored)
            .with_deprecated_encryption(b"topsecret");
        use std::io::Write as _;
        writer.start_file("payload.bin", options).unwrap();
        writer.write_all(b"hidden").unwrap();
        writer.finish().unwrap();

        let id = job.id.clone();
        let outcome = rig.pp.process_job(job).await.unwrap();
        assert_eq!(outcome, Processed::Requeued);

        let (state, fail_message) = rig
            .queue
            .with_job(&id, |j| (j.state, j.fail_message.clone()))
            .unwrap();
        assert_eq!(state, JobState::Paused);
        assert_eq!(fail_message, "Encrypted");
        assert!(rig.pp.pause.postproc_paused(), "PP pause flag must be set");
    }

    #[tokio::test]
    async fn cleanup_removes_configured_extensions() {
        let rig = rig_with(Arc::new(NoOpParityHandler), |c| {
            c.processing.cleanup_extensions = vec!["nfo".into(), "sfv".into()];
        })
        .await;
        let job = seed_job(&rig, "Cleaned", PostProcLevel::Skip);
        let job_dir = rig.pp.config.folders.incomplete_dir.join(&job.name);
        std::fs::write(job_dir.join("release.nfo"), b"x").unwrap();
        std::fs::write(job_dir.join("checks.sfv"), b"x").unwrap();

        rig.pp.process_job(job).await.unwrap();

        let dest = rig.pp.config.folders.complete_dir.join("Cleaned");
        assert!(dest.join("file0.bin").exists());
        assert!(!dest.join("release.nfo").exists());
        assert!(!dest.join("checks.sfv").exists());
    }

    #[tokio::test]
    async fn stage_log_is_ordered_by_execution() {
        let rig = rig_with(Arc::new(NoOpParityHandler), |_| {}).await;
        let mut job = seed_job(&rig, "Ordered", PostProcLevel::Skip);
        job.log_stage_line("Download", "100 articles".into());
        let id = job.id.clone();

        rig.pp.process_job(job).await.unwrap();

        let record = rig.history.get(&id).await.unwrap().unwrap();
        let stage_log: Vec<crate::nzb::StageLogEntry> =
            serde_json::from_str(record.stage_log.as_deref().unwrap()).unwrap();
        assert_eq!(stage_log[0].stage, "Download");
    }
}
