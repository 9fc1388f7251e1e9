//! In-memory job model: jobs, files, and articles
//!
//! A job ([`NzbObject`]) owns a vector of files, each file owns a vector of
//! articles, and articles refer back by index, with no ownership cycles. The NZB
//! parser (external) produces these descriptors; everything downstream of
//! admission works against this model.

pub mod admin;

use crate::types::{JobId, JobState, PostProcLevel, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;

/// Transfer state of a single article
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    /// Not yet dispatched
    #[default]
    Pending,
    /// Handed to a connection; reset to Pending on restore
    InFlight,
    /// Fetched, decoded and handed to the assembler
    Done,
    /// Permanently failed: every fit server returned missing
    Failed,
}

/// The unit of transfer: one yEnc segment of a file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Article {
    /// Globally unique message id, without angle brackets
    pub message_id: String,
    /// Declared byte length of the decoded segment
    pub bytes: u64,
    /// Index of the owning file within the job
    pub file_index: usize,
    /// Ordinal within the file (0-based)
    pub index: usize,
    /// Servers that already tried and failed this article
    #[serde(default)]
    pub tried: HashSet<crate::types::ServerId>,
    /// Priority of the last server that tried this article. Failover never
    /// hands the article to a strictly worse-priority server than this.
    #[serde(default)]
    pub fetcher_priority: Option<i32>,
    /// Current transfer state
    #[serde(default)]
    pub status: ArticleStatus,
}

impl Article {
    /// Message id in the angle-bracket form NNTP expects
    pub fn bracketed_id(&self) -> String {
        if self.message_id.starts_with('<') {
            self.message_id.clone()
        } else {
            format!("<{}>", self.message_id)
        }
    }
}

/// A target output file inside a job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NzbFile {
    /// Stable id used for the on-disk descriptor (`SABnzbd_nzf_<id>`)
    pub nzf_id: String,
    /// Declared filename; refined once the first article's yEnc header decodes
    pub filename: String,
    /// Original subject line, kept for deobfuscation heuristics
    #[serde(default)]
    pub subject: String,
    /// Posting date
    pub date: DateTime<Utc>,
    /// Declared total size in bytes
    pub total_size: u64,
    /// `total_size` minus bytes either downloaded or permanently failed
    pub bytes_remaining: u64,
    /// Bytes lost to permanently failed articles
    #[serde(default)]
    pub failed_bytes: u64,
    /// Set when the first article decoded and confirmed the real filename
    #[serde(default)]
    pub first_article_decoded: bool,
    /// Set by the assembler once the file is fully on disk
    #[serde(default)]
    pub assembled: bool,
    /// Whether this is a PAR2 file
    #[serde(default)]
    pub is_par2: bool,
    /// Recovery blocks this PAR2 volume contributes (0 for data files)
    #[serde(default)]
    pub par2_blocks: u32,
    /// Ordered articles making up the file
    pub articles: Vec<Article>,
}

impl NzbFile {
    /// Byte offset of an article within the file, from the declared sizes of
    /// its predecessors
    pub fn article_offset(&self, index: usize) -> u64 {
        self.articles[..index].iter().map(|a| a.bytes).sum()
    }

    /// Whether every article has reached a terminal state
    pub fn exhausted(&self) -> bool {
        self.bytes_remaining == 0
    }

    /// Whether the file counts as finished for the download-complete check:
    /// fully assembled, or exhausted with failures (beyond recovery at the
    /// download layer; PAR2 may still rescue it)
    pub fn finished(&self) -> bool {
        self.assembled || self.exhausted()
    }
}

/// One entry of a job's ordered stage log
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageLogEntry {
    /// Stage name as shown to the user
    pub stage: String,
    /// Lines reported by the stage, in order
    pub lines: Vec<String>,
}

/// In-memory job descriptor and owner of per-job invariants.
///
/// State-mutating methods only touch memory; the queue persists the admin
/// record and publishes change events after each guarded operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NzbObject {
    /// Stable job id
    pub id: JobId,
    /// Name as delivered by the parser
    pub original_name: String,
    /// Sanitized display name; also the job's directory name
    pub name: String,
    /// Password carried by the job (operator input or NZB metadata)
    #[serde(default)]
    pub password: Option<String>,
    /// Password embedded in the NZB metadata, if any
    #[serde(default)]
    pub meta_password: Option<String>,
    /// Category tag
    #[serde(default)]
    pub category: Option<String>,
    /// Priority tier
    pub priority: Priority,
    /// Post-processing level
    pub post_proc: PostProcLevel,
    /// Lifecycle state
    pub state: JobState,
    /// Data and inline PAR2 files
    pub files: Vec<NzbFile>,
    /// Extra PAR2 volumes withheld until repair requests them
    #[serde(default)]
    pub extra_par2: Vec<NzbFile>,
    /// Admin directory of this job
    pub admin_dir: PathBuf,
    /// Failure reason; empty on success
    #[serde(default)]
    pub fail_message: String,
    /// Bytes successfully downloaded
    #[serde(default)]
    pub bytes_downloaded: u64,
    /// Declared total bytes across active files
    pub total_bytes: u64,
    /// When the job was admitted
    pub added_at: DateTime<Utc>,
    /// Average posting date across files, for the propagation delay
    pub avg_date: DateTime<Utc>,
    /// Duplicate-detection key
    pub duplicate_key: String,
    /// Source URL, when the job arrived by URL
    #[serde(default)]
    pub url: Option<String>,
    /// Ordered per-stage log for the control surface
    #[serde(default)]
    pub stage_log: Vec<StageLogEntry>,
    /// Whether the paused state came from user action (vs. policy)
    #[serde(default)]
    pub paused_by_user: bool,
    /// Repair escalations performed (extra-PAR2 rounds); capped by the
    /// repair stage
    #[serde(default)]
    pub repair_rounds: u32,
}

impl NzbObject {
    /// Build a job from parser output.
    ///
    /// Splits PAR2 volumes beyond the base `.par2` into the withheld
    /// extra-PAR2 list and computes the totals and the duplicate key.
    pub fn from_parts(
        name: &str,
        files: Vec<NzbFile>,
        admin_root: &std::path::Path,
        password: Option<String>,
    ) -> Self {
        let id = JobId::generate();
        let sanitized = crate::utils::sanitize_filename(name);

        // Extra PAR2 volumes (vol*+*.par2 style, carrying recovery blocks)
        // are withheld; the base .par2 index stays with the data files.
        let (extra_par2, active): (Vec<NzbFile>, Vec<NzbFile>) = files
            .into_iter()
            .partition(|f| f.is_par2 && f.par2_blocks > 0);

        let total_bytes = active.iter().map(|f| f.total_size).sum();
        let avg_date = average_date(&active);
        let duplicate_key = duplicate_key(&sanitized, total_bytes);

        Self {
            id: id.clone(),
            original_name: name.to_string(),
            name: sanitized.clone(),
            password,
            meta_password: None,
            category: None,
            priority: Priority::Normal,
            post_proc: PostProcLevel::default(),
            state: JobState::Queued,
            files: active,
            extra_par2,
            admin_dir: admin_root.join(&sanitized).join("__ADMIN__"),
            fail_message: String::new(),
            bytes_downloaded: 0,
            total_bytes,
            added_at: Utc::now(),
            avg_date,
            duplicate_key,
            url: None,
            stage_log: Vec::new(),
            paused_by_user: false,
            repair_rounds: 0,
        }
    }

    /// Pause the job. Paused-by-user survives policy resumes.
    pub fn pause(&mut self, by_user: bool) {
        if self.state.accepts_dispatch() {
            self.state = JobState::Paused;
        }
        if by_user {
            self.paused_by_user = true;
        }
    }

    /// Resume the job into the queue
    pub fn resume(&mut self) {
        if self.state == JobState::Paused {
            self.state = JobState::Queued;
            self.paused_by_user = false;
        }
    }

    /// Change the priority tier
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
        match priority {
            Priority::Paused => self.pause(true),
            Priority::Stop => self.state = JobState::Paused,
            _ => {}
        }
    }

    /// Change the category tag
    pub fn set_category(&mut self, category: Option<String>) {
        self.category = category;
    }

    /// The next article to dispatch, or None.
    ///
    /// Data files first, PAR2 files last; within a file articles go out in
    /// any order the caller likes, but we hand them out sequentially. The
    /// article is marked in-flight.
    pub fn next_article(&mut self) -> Option<(usize, usize)> {
        if !self.state.accepts_dispatch() {
            return None;
        }

        let mut candidate: Option<(usize, usize)> = None;
        for (fi, file) in self.files.iter().enumerate() {
            if file.assembled {
                continue;
            }
            if let Some(ai) = file
                .articles
                .iter()
                .position(|a| a.status == ArticleStatus::Pending)
            {
                if !file.is_par2 {
                    candidate = Some((fi, ai));
                    break;
                }
                // PAR2 fetched last: remember the first match but keep
                // looking for a data file
                if candidate.is_none() {
                    candidate = Some((fi, ai));
                }
            }
        }

        if let Some((fi, ai)) = candidate {
            self.files[fi].articles[ai].status = ArticleStatus::InFlight;
            if self.state == JobState::Queued {
                self.state = JobState::Downloading;
            }
        }
        candidate
    }

    /// Put an in-flight article back after a recoverable dispatch failure
    pub fn requeue_article(&mut self, file: usize, article: usize) {
        let a = &mut self.files[file].articles[article];
        if a.status == ArticleStatus::InFlight {
            a.status = ArticleStatus::Pending;
        }
    }

    /// Record a successfully fetched article
    pub fn article_done(&mut self, file: usize, article: usize) {
        let f = &mut self.files[file];
        let a = &mut f.articles[article];
        if a.status == ArticleStatus::Done {
            return;
        }
        a.status = ArticleStatus::Done;
        f.bytes_remaining = f.bytes_remaining.saturating_sub(a.bytes);
        self.bytes_downloaded += a.bytes;
    }

    /// Record a permanently failed article.
    ///
    /// Idempotent: a second call for the same article changes nothing, so
    /// `bytes_remaining` drops by exactly the declared size, once.
    pub fn add_failed_article(&mut self, file: usize, article: usize) {
        let f = &mut self.files[file];
        let a = &mut f.articles[article];
        if a.status == ArticleStatus::Failed || a.status == ArticleStatus::Done {
            return;
        }
        a.status = ArticleStatus::Failed;
        f.bytes_remaining = f.bytes_remaining.saturating_sub(a.bytes);
        f.failed_bytes += a.bytes;
    }

    /// Mark a file fully assembled on disk
    pub fn mark_file_complete(&mut self, file: usize) {
        self.files[file].assembled = true;
    }

    /// Whether every file is assembled or failed beyond recovery
    pub fn download_complete(&self) -> bool {
        !self.files.is_empty() && self.files.iter().all(NzbFile::finished)
    }

    /// Fraction of article bytes permanently failed, for the abort heuristic
    pub fn failure_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let failed: u64 = self.files.iter().map(|f| f.failed_bytes).sum();
        failed as f64 / self.total_bytes as f64
    }

    /// Promote withheld PAR2 volumes covering at least `blocks` recovery
    /// blocks into the active file list. Returns how many files moved.
    ///
    /// Whole volumes are promoted, so the covered block count rounds up.
    pub fn promote_extra_par2(&mut self, blocks: u32) -> usize {
        let mut covered = 0u32;
        let mut moved = 0;
        while covered < blocks {
            // Smallest volume that still helps keeps the download short
            let next = self
                .extra_par2
                .iter()
                .enumerate()
                .min_by_key(|(_, f)| f.par2_blocks)
                .map(|(i, _)| i);
            let Some(i) = next else { break };
            let mut file = self.extra_par2.remove(i);
            covered += file.par2_blocks;
            file.bytes_remaining = file.total_size;
            let new_index = self.files.len();
            for a in &mut file.articles {
                a.file_index = new_index;
            }
            self.total_bytes += file.total_size;
            self.files.push(file);
            moved += 1;
        }
        if moved > 0 {
            self.state = JobState::FetchingExtraPar2;
        }
        moved
    }

    /// Append a line to the named stage's log, creating the stage entry in
    /// execution order on first use
    pub fn log_stage_line(&mut self, stage: &str, line: String) {
        if let Some(entry) = self.stage_log.iter_mut().find(|e| e.stage == stage) {
            entry.lines.push(line);
        } else {
            self.stage_log.push(StageLogEntry {
                stage: stage.to_string(),
                lines: vec![line],
            });
        }
    }

    /// Candidate passwords in precedence order: job-level, NZB metadata
    pub fn passwords(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(p) = &self.password {
            out.push(p.clone());
        }
        if let Some(p) = &self.meta_password {
            if !out.contains(p) {
                out.push(p.clone());
            }
        }
        out
    }

    /// Reset runtime-only state after a restore from disk
    pub fn reset_after_restore(&mut self) {
        for file in &mut self.files {
            for a in &mut file.articles {
                if a.status == ArticleStatus::InFlight {
                    a.status = ArticleStatus::Pending;
                }
            }
        }
        if self.state == JobState::Downloading {
            self.state = JobState::Queued;
        }
    }
}

/// Average posting date across files, weighted per file
fn average_date(files: &[NzbFile]) -> DateTime<Utc> {
    if files.is_empty() {
        return Utc::now();
    }
    let sum: i64 = files.iter().map(|f| f.date.timestamp()).sum();
    let avg = sum / files.len() as i64;
    DateTime::<Utc>::from_timestamp(avg, 0).unwrap_or_else(Utc::now)
}

/// Duplicate-detection key: hash over the sanitized name and total size
pub fn duplicate_key(name: &str, total_bytes: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.to_lowercase().as_bytes());
    hasher.update(total_bytes.to_le_bytes());
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
}
