//! Repair stage: PAR2 verify and repair
//!
//! Runs the external PAR2 tool over the job's recovery set, forwarding
//! progress lines (`Verifying X/Y`, `Repairing P%`) as structured events.
//! Outcomes map to the pipeline contract: Ok, NeedsMoreBlocks (request
//! extra PAR2 volumes and come back), or Damaged. A successful verify also
//! drives renames of obfuscated files from the PAR2 metadata.

use crate::error::Result;
use crate::nzb::admin::JobAdmin;
use crate::parity::{ParityHandler, RepairOutcome, compute_16k_md5, parse_par2_file_entries};
use crate::types::{Event, JobId, Stage};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// What the repair stage decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairStageResult {
    /// Set verified (and repaired if needed)
    Ok,
    /// PAR2 wants this many more recovery blocks
    NeedsMoreBlocks(u32),
    /// Unrepairable with everything the set can offer
    Damaged(String),
    /// No PAR2 set present or no handler capability; nothing to do
    Skipped,
}

/// The base `.par2` index of a set: the shortest name without a `vol`
/// infix, falling back to any `.par2`.
pub fn find_base_par2(dir: &Path) -> Result<Option<PathBuf>> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("par2"))
        })
        .collect();
    candidates.sort_by_key(|p| p.as_os_str().len());

    let base = candidates
        .iter()
        .find(|p| {
            !p.file_name()
                .map(|n| n.to_string_lossy().to_lowercase().contains(".vol"))
                .unwrap_or(false)
        })
        .or_else(|| candidates.first())
        .cloned();
    Ok(base)
}

/// Run verify (and repair when needed) for the job directory.
///
/// Progress lines stream into `lines` (the stage log) and onto the event
/// channel while the tool runs.
pub async fn run_repair_stage(
    job_id: &JobId,
    dir: &Path,
    parity: &dyn ParityHandler,
    event_tx: &broadcast::Sender<Event>,
    lines: &Arc<Mutex<Vec<String>>>,
) -> Result<RepairStageResult> {
    if !parity.capabilities().can_verify {
        tracing::info!(job = %job_id, "no parity handler available, skipping repair stage");
        return Ok(RepairStageResult::Skipped);
    }
    let Some(par2) = find_base_par2(dir)? else {
        tracing::debug!(job = %job_id, "no PAR2 set in job directory");
        return Ok(RepairStageResult::Skipped);
    };

    let forward = |phase: &'static str| {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let event_tx = event_tx.clone();
        let job = job_id.clone();
        let lines = Arc::clone(lines);
        let handle = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                #[allow(clippy::expect_used)]
                lines.lock().expect("stage log poisoned").push(line.clone());
                event_tx
                    .send(Event::StageProgress {
                        id: job.clone(),
                        stage: Stage::Repair,
                        line,
                    })
                    .ok();
            }
            tracing::trace!(phase, "progress stream closed");
        });
        (tx, handle)
    };

    let (verify_tx, verify_fwd) = forward("verify");
    let report = parity.verify(&par2, Some(verify_tx)).await?;
    let _ = verify_fwd.await;

    if report.all_intact {
        apply_par2_renames(job_id, dir, &par2)?;
        return Ok(RepairStageResult::Ok);
    }
    if report.needed_blocks > 0 {
        return Ok(RepairStageResult::NeedsMoreBlocks(report.needed_blocks));
    }
    if !report.repairable {
        return Ok(RepairStageResult::Damaged(format!(
            "{} damaged blocks, {} recovery blocks available",
            report.damaged_blocks, report.recovery_blocks
        )));
    }

    let (repair_tx, repair_fwd) = forward("repair");
    let repair = parity.repair(&par2, Some(repair_tx)).await?;
    let _ = repair_fwd.await;

    match repair.outcome {
        RepairOutcome::Ok => {
            apply_par2_renames(job_id, dir, &par2)?;
            Ok(RepairStageResult::Ok)
        }
        RepairOutcome::NeedsMoreBlocks(blocks) => Ok(RepairStageResult::NeedsMoreBlocks(blocks)),
        RepairOutcome::Damaged(reason) => Ok(RepairStageResult::Damaged(reason)),
    }
}

/// Rename obfuscated files to the names carried by the PAR2 set.
///
/// Files are matched by the MD5 of their first 16 KB; successful renames
/// land in the admin `__renames__` map and the `__verified__` map gains the
/// real names.
pub fn apply_par2_renames(job_id: &JobId, dir: &Path, par2: &Path) -> Result<Vec<(String, String)>> {
    let entries = parse_par2_file_entries(par2)?;
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let by_hash: BTreeMap<[u8; 16], &str> = entries
        .iter()
        .map(|e| (e.hash_16k, e.filename.as_str()))
        .collect();

    let admin_dir = dir.join("__ADMIN__");
    let admin = JobAdmin::create(&admin_dir).ok();

    let mut renamed = Vec::new();
    let mut verified = admin
        .as_ref()
        .and_then(|a| a.load_verified().ok())
        .unwrap_or_default();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(current) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        let Ok(hash) = compute_16k_md5(&path) else {
            continue;
        };
        let Some(real_name) = by_hash.get(&hash) else {
            continue;
        };
        verified.insert((*real_name).to_string(), true);
        if current == *real_name {
            continue;
        }

        let target = dir.join(real_name);
        if target.exists() {
            continue;
        }
        std::fs::rename(&path, &target)?;
        tracing::info!(job = %job_id, from = %current, to = %real_name, "renamed from PAR2 metadata");
        if let Some(admin) = &admin {
            admin.record_rename(&current, real_name).ok();
        }
        renamed.push((current, (*real_name).to_string()));
    }

    if let Some(admin) = &admin {
        admin.save_verified(&verified).ok();
    }
    Ok(renamed)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::parity::{ParityCapabilities, ProgressSink, RepairReport, VerifyReport};
    use async_trait::async_trait;

    /// Scripted handler standing in for the external tool
    struct Scripted {
        verify: VerifyReport,
        repair_outcome: RepairOutcome,
        progress: Vec<String>,
    }

    #[async_trait]
    impl ParityHandler for Scripted {
        async fn verify(
            &self,
            _par2: &Path,
            progress: Option<ProgressSink>,
        ) -> crate::error::Result<VerifyReport> {
            if let Some(sink) = progress {
                for line in &self.progress {
                    sink.send(line.clone()).ok();
                }
            }
            Ok(self.verify.clone())
        }

        async fn repair(
            &self,
            _par2: &Path,
            _progress: Option<ProgressSink>,
        ) -> crate::error::Result<RepairReport> {
            Ok(RepairReport {
                outcome: self.repair_outcome.clone(),
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
            "scripted"
        }
    }

    fn setup(par2_names: &[&str]) -> (tempfile::TempDir, JobId) {
        let dir = tempfile::tempdir().unwrap();
        for name in par2_names {
            std::fs::write(dir.path().join(name), b"not a real par2").unwrap();
        }
        (dir, JobId("nzg_repair".into()))
    }

    #[test]
    fn base_par2_prefers_the_index_file() {
        let (dir, _) = setup(&["set.vol000+20.par2", "set.par2", "set.vol020+40.par2"]);
        let base = find_base_par2(dir.path()).unwrap().unwrap();
        assert_eq!(base.file_name().unwrap(), "set.par2");
    }

    #[test]
    fn base_par2_none_when_no_set() {
        let (dir, _) = setup(&[]);
        assert!(find_base_par2(dir.path()).unwrap().is_none());
    }

    #[tokio::test]
    async fn intact_set_passes_without_repair() {
        let (dir, job) = setup(&["set.par2"]);
        let handler = Scripted {
            verify: VerifyReport {
                all_intact: true,
                ..Default::default()
            },
            repair_outcome: RepairOutcome::Damaged("unused".into()),
            progress: vec!["Verifying 5/5".into()],
        };
        let (event_tx, _) = broadcast::channel(16);
        let lines = Arc::new(Mutex::new(Vec::new()));

        let result = run_repair_stage(&job, dir.path(), &handler, &event_tx, &lines)
            .await
            .unwrap();

        assert_eq!(result, RepairStageResult::Ok);
        assert_eq!(*lines.lock().unwrap(), vec!["Verifying 5/5"]);
    }

    #[tokio::test]
    async fn damaged_but_repairable_set_repairs() {
        let (dir, job) = setup(&["set.par2"]);
        let handler = Scripted {
            verify: VerifyReport {
                all_intact: false,
                damaged_blocks: 3,
                recovery_blocks: 10,
                repairable: true,
                ..Default::default()
            },
            repair_outcome: RepairOutcome::Ok,
            progress: vec![],
        };
        let (event_tx, _) = broadcast::channel(16);
        let lines = Arc::new(Mutex::new(Vec::new()));

        let result = run_repair_stage(&job, dir.path(), &handler, &event_tx, &lines)
            .await
            .unwrap();
        assert_eq!(result, RepairStageResult::Ok);
    }

    #[tokio::test]
    async fn block_shortfall_requests_more_volumes() {
        let (dir, job) = setup(&["set.par2"]);
        let handler = Scripted {
            verify: VerifyReport {
                all_intact: false,
                damaged_blocks: 50,
                recovery_blocks: 10,
                needed_blocks: 40,
                repairable: false,
                ..Default::default()
            },
            repair_outcome: RepairOutcome::Damaged("unused".into()),
            progress: vec![],
        };
        let (event_tx, _) = broadcast::channel(16);
        let lines = Arc::new(Mutex::new(Vec::new()));

        let result = run_repair_stage(&job, dir.path(), &handler, &event_tx, &lines)
            .await
            .unwrap();
        assert_eq!(result, RepairStageResult::NeedsMoreBlocks(40));
    }

    #[tokio::test]
    async fn unrepairable_without_shortfall_is_damaged() {
        let (dir, job) = setup(&["set.par2"]);
        let handler = Scripted {
            verify: VerifyReport {
                all_intact: false,
                damaged_blocks: 50,
                recovery_blocks: 0,
                repairable: false,
                ..Default::default()
            },
            repair_outcome: RepairOutcome::Damaged("unused".into()),
            progress: vec![],
        };
        let (event_tx, _) = broadcast::channel(16);
        let lines = Arc::new(Mutex::new(Vec::new()));

        let result = run_repair_stage(&job, dir.path(), &handler, &event_tx, &lines)
            .await
            .unwrap();
        assert!(matches!(result, RepairStageResult::Damaged(_)));
    }

    #[tokio::test]
    async fn missing_par2_skips_the_stage() {
        let (dir, job) = setup(&[]);
        let handler = Scripted {
            verify: VerifyReport::default(),
            repair_outcome: RepairOutcome::Ok,
            progress: vec![],
        };
        let (event_tx, _) = broadcast::channel(16);
        let lines = Arc::new(Mutex::new(Vec::new()));

        let result = run_repair_stage(&job, dir.path(), &handler, &event_tx, &lines)
            .await
            .unwrap();
        assert_eq!(result, RepairStageResult::Skipped);
    }

    #[test]
    fn par2_renames_match_by_16k_hash() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobId("nzg_rename".into());

        // A real payload under an obfuscated name
        let payload = b"the actual file contents".to_vec();
        std::fs::write(dir.path().join("d41d8cd98f00b204e9800998ecf8427e"), &payload).unwrap();

        // Build a PAR2 FileDesc packet whose 16k hash matches the payload
        let hash = md5::compute(&payload).0;
        let par2_path = dir.path().join("set.par2");
        std::fs::write(&par2_path, build_file_desc("episode.mkv", hash)).unwrap();

        let renames = apply_par2_renames(&job, dir.path(), &par2_path).unwrap();

        assert_eq!(renames.len(), 1);
        assert_eq!(renames[0].1, "episode.mkv");
        assert!(dir.path().join("episode.mkv").exists());

        let admin = JobAdmin::create(&dir.path().join("__ADMIN__")).unwrap();
        let map = admin.load_renames().unwrap();
        assert_eq!(map.get("d41d8cd98f00b204e9800998ecf8427e").unwrap(), "episode.mkv");
        assert_eq!(admin.load_verified().unwrap().get("episode.mkv"), Some(&true));
    }

    /// Minimal FileDesc packet builder for the rename test
    fn build_file_desc(filename: &str, hash_16k: [u8; 16]) -> Vec<u8> {
        let name = filename.as_bytes();
        let padded_len = (name.len() + 3) & !3;
        let packet_len = (64 + 56 + padded_len) as u64;

        let mut packet = Vec::new();
        packet.extend_from_slice(b"PAR2\0PKT");
        packet.extend_from_slice(&packet_len.to_le_bytes());
        packet.extend_from_slice(&[0u8; 16]);
        packet.extend_from_slice(&[0u8; 16]);
        packet.extend_from_slice(b"PAR 2.0\0FileDesc");
        packet.extend_from_slice(&[0u8; 16]);
        packet.extend_from_slice(&[0u8; 16]);
        packet.extend_from_slice(&hash_16k);
        packet.extend_from_slice(&1024u64.to_le_bytes());
        packet.extend_from_slice(name);
        packet.extend_from_slice(&vec![0u8; padded_len - name.len()]);
        packet
    }
}
