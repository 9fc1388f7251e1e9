//! The assembler: streams reconstructed files to the incomplete directory
//!
//! A single writer consumes cached articles per file in offset order and
//! writes them into `incomplete_dir/<job>/<filename>`. The first in-order
//! chunk of a file triggers filename sanitization, recorded in the job's
//! `__renames__` admin map. Files are fsync'd when they complete, not per
//! article. ENOSPC pauses downloading via the supervisor and installs the
//! scheduler's free-space watcher.

use crate::cache::ArticleCache;
use crate::error::is_disk_full;
use crate::nzb::ArticleStatus;
use crate::nzb::admin::JobAdmin;
use crate::queue::Queue;
use crate::types::{Event, JobId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// A nudge telling the assembler a file may have drainable articles
pub type AssemblyKick = (JobId, usize);

/// Snapshot of the file metadata a drain pass needs, read under the queue
/// lock and used outside it
struct FileView {
    job_name: String,
    declared_name: String,
    first_article_decoded: bool,
    offset: u64,
    total_size: u64,
    failed_bytes: u64,
    articles_total: usize,
    articles_terminal: usize,
    admin_dir: PathBuf,
}

/// The single assembler task
pub struct Assembler {
    cache: Arc<ArticleCache>,
    queue: Arc<Queue>,
    incomplete_dir: PathBuf,
    event_tx: broadcast::Sender<Event>,
    /// Jobs whose last file just finished; the engine hands them to
    /// post-processing
    complete_tx: mpsc::UnboundedSender<JobId>,
    /// Disk-full signal with the bytes still required by the current job
    disk_full_tx: mpsc::UnboundedSender<u64>,
    /// Bytes written so far per (job, file)
    written: HashMap<(JobId, usize), u64>,
}

impl Assembler {
    /// Create the assembler
    pub fn new(
        cache: Arc<ArticleCache>,
        queue: Arc<Queue>,
        incomplete_dir: PathBuf,
        event_tx: broadcast::Sender<Event>,
        complete_tx: mpsc::UnboundedSender<JobId>,
        disk_full_tx: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            cache,
            queue,
            incomplete_dir,
            event_tx,
            complete_tx,
            disk_full_tx,
            written: HashMap::new(),
        }
    }

    /// Main loop: drain whatever each kick points at until cancelled
    pub async fn run(
        mut self,
        mut kick_rx: mpsc::UnboundedReceiver<AssemblyKick>,
        cancel: CancellationToken,
    ) {
        tracing::info!("assembler started");
        loop {
            tokio::select! {
                kick = kick_rx.recv() => {
                    let Some((job, file)) = kick else { break };
                    self.drain(&job, file).await;
                }
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("assembler stopped");
    }

    /// Drain every in-order article currently cached for one file
    pub(crate) async fn drain(&mut self, job_id: &JobId, file: usize) {
        while let Some((index, bytes)) = self.cache.take_for_assembly(job_id, file) {
            let view = self.queue.with_job(job_id, |j| {
                let f = &j.files[file];
                FileView {
                    job_name: j.name.clone(),
                    declared_name: f.filename.clone(),
                    first_article_decoded: f.first_article_decoded,
                    offset: f.article_offset(index),
                    total_size: f.total_size,
                    failed_bytes: f.failed_bytes,
                    articles_total: f.articles.len(),
                    articles_terminal: f
                        .articles
                        .iter()
                        .filter(|a| {
                            matches!(a.status, ArticleStatus::Done | ArticleStatus::Failed)
                        })
                        .count(),
                    admin_dir: j.admin_dir.clone(),
                }
            });

            // Deleted mid-flight: discard the bytes and purge the rest
            let Some(view) = view else {
                tracing::debug!(job = %job_id, "job gone, discarding assembled bytes");
                self.cache.drop_job(job_id);
                self.written.retain(|(j, _), _| j != job_id);
                return;
            };

            let filename = self
                .confirm_filename(job_id, file, &view)
                .unwrap_or_else(|| view.declared_name.clone());

            let dir = self.incomplete_dir.join(&view.job_name);
            let path = dir.join(&filename);
            let len = bytes.len() as u64;

            if let Err(e) = write_at(&dir, &path, view.offset, &bytes) {
                if is_disk_full(&e) {
                    tracing::warn!(job = %job_id, path = %path.display(), "disk full during assembly");
                    let required = view.total_size.saturating_sub(view.offset);
                    // Hand the bytes back so nothing is lost across the pause
                    self.cache.put(job_id, file, index, bytes).await;
                    self.disk_full_tx.send(required).ok();
                    return;
                }
                tracing::error!(job = %job_id, path = %path.display(), error = %e, "assembly write failed");
                return;
            }

            let written = self
                .written
                .entry((job_id.clone(), file))
                .and_modify(|w| *w += len)
                .or_insert(len);

            // Terminal check under the numbers we saw before this write
            let done = *written == view.total_size.saturating_sub(view.failed_bytes)
                && view.articles_terminal >= view.articles_total;

            if done {
                if let Err(e) = sync_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "fsync on close failed");
                }
                self.written.remove(&(job_id.clone(), file));
                self.finish_file(job_id, file, &filename);
            }
        }
    }

    /// First in-order chunk: sanitize the declared filename, record the
    /// rename, and remember the confirmation on the file.
    fn confirm_filename(&self, job_id: &JobId, file: usize, view: &FileView) -> Option<String> {
        let sanitized = crate::utils::sanitize_filename(&view.declared_name);
        if !view.first_article_decoded {
            if sanitized != view.declared_name {
                if let Ok(admin) = JobAdmin::create(&view.admin_dir) {
                    if let Err(e) = admin.record_rename(&view.declared_name, &sanitized) {
                        tracing::warn!(job = %job_id, error = %e, "failed to record rename");
                    }
                }
            }
            let sanitized_for_update = sanitized.clone();
            let _ = self.queue.with_job_mut(job_id, |j| {
                let f = &mut j.files[file];
                f.first_article_decoded = true;
                f.filename = sanitized_for_update;
            });
        }
        Some(sanitized)
    }

    /// Mark the file assembled and hand the job over when it was the last one
    fn finish_file(&self, job_id: &JobId, file: usize, filename: &str) {
        let job_complete = self
            .queue
            .with_job_mut(job_id, |j| {
                j.mark_file_complete(file);
                j.download_complete()
            })
            .unwrap_or(false);

        self.event_tx
            .send(Event::FileAssembled {
                id: job_id.clone(),
                file_index: file,
                filename: filename.to_string(),
            })
            .ok();

        if job_complete {
            tracing::info!(job = %job_id, "all files assembled, download complete");
            self.complete_tx.send(job_id.clone()).ok();
        }
    }
}

/// Write `bytes` into `path` at `offset`, creating the directory and file as
/// needed. Positional writes keep on-disk order strictly increasing per file
/// because the cache only releases articles in order.
fn write_at(dir: &Path, path: &Path, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(bytes, offset)
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut written = 0;
        while written < bytes.len() {
            let n = file.seek_write(&bytes[written..], offset + written as u64)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            written += n;
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)
    }
}

/// fsync on close, once per completed file
fn sync_file(path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.sync_all()
}

/// Whether an on-disk file is shorter than its descriptor declares,
/// indicating a crash mid-assembly.
pub fn is_partial(path: &Path, declared_size: u64, failed_bytes: u64) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.len() < declared_size.saturating_sub(failed_bytes),
        Err(_) => true,
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicateAction;
    use crate::nzb::NzbObject;
    use crate::nzb::tests::make_file;
    use crate::queue::AddPosition;

    struct Rig {
        assembler: Assembler,
        queue: Arc<Queue>,
        cache: Arc<ArticleCache>,
        complete_rx: mpsc::UnboundedReceiver<JobId>,
        _dir: tempfile::TempDir,
        incomplete: PathBuf,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let incomplete = dir.path().join("incomplete");
        let queue = Arc::new(Queue::open(dir.path().join("admin")).unwrap());
        let cache = Arc::new(ArticleCache::new(10 * 1024 * 1024));
        let (event_tx, _) = broadcast::channel(64);
        let (complete_tx, complete_rx) = mpsc::unbounded_channel();
        let (disk_full_tx, _) = mpsc::unbounded_channel();

        let assembler = Assembler::new(
            cache.clone(),
            queue.clone(),
            incomplete.clone(),
            event_tx,
            complete_tx,
            disk_full_tx,
        );
        Rig {
            assembler,
            queue,
            cache,
            complete_rx,
            _dir: dir,
            incomplete,
        }
    }

    fn add_job(rig: &Rig, mut job: NzbObject) -> JobId {
        job.admin_dir = rig._dir.path().join("admin").join(&job.name).join("__ADMIN__");
        let (id, _) = rig
            .queue
            .add(job, AddPosition::Bottom, DuplicateAction::Ignore, None)
            .unwrap();
        id
    }

    fn job_with_one_file(articles: usize, bytes: u64) -> NzbObject {
        NzbObject::from_parts(
            "Assembly Job",
            vec![make_file(0, articles, bytes)],
            Path::new("/ignored"),
            None,
        )
    }

    /// Simulate the downloader having fetched an article
    fn fetched(rig: &Rig, id: &JobId, file: usize, article: usize) {
        rig.queue
            .with_job_mut(id, |j| {
                j.files[file].articles[article].status = ArticleStatus::InFlight;
                j.article_done(file, article);
            })
            .unwrap();
    }

    #[tokio::test]
    async fn assembles_in_order_articles_into_one_file() {
        let mut rig = rig();
        let id = add_job(&rig, job_with_one_file(3, 4));

        for i in 0..3 {
            fetched(&rig, &id, 0, i);
        }
        // Arrive out of order: 2, 0, 1
        rig.cache.put(&id, 0, 2, b"CCCC".to_vec()).await;
        rig.cache.put(&id, 0, 0, b"AAAA".to_vec()).await;
        rig.cache.put(&id, 0, 1, b"BBBB".to_vec()).await;

        rig.assembler.drain(&id, 0).await;

        let path = rig.incomplete.join("Assembly Job").join("file0.bin");
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"AAAABBBBCCCC", "offset order must hold");

        let complete = rig.complete_rx.try_recv().unwrap();
        assert_eq!(complete, id, "last article completes the job");
        assert!(rig.queue.with_job(&id, |j| j.files[0].assembled).unwrap());
    }

    #[tokio::test]
    async fn file_not_marked_assembled_while_articles_outstanding() {
        let mut rig = rig();
        let id = add_job(&rig, job_with_one_file(2, 4));

        fetched(&rig, &id, 0, 0);
        rig.cache.put(&id, 0, 0, b"AAAA".to_vec()).await;
        rig.assembler.drain(&id, 0).await;

        assert!(
            !rig.queue.with_job(&id, |j| j.files[0].assembled).unwrap(),
            "half a file is not assembled"
        );
        assert!(rig.complete_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_article_leaves_a_hole_and_file_still_finishes() {
        let mut rig = rig();
        let id = add_job(&rig, job_with_one_file(3, 4));

        fetched(&rig, &id, 0, 0);
        fetched(&rig, &id, 0, 2);
        rig.queue
            .with_job_mut(&id, |j| j.add_failed_article(0, 1))
            .unwrap();
        rig.cache.mark_failed(&id, 0, 1);

        rig.cache.put(&id, 0, 0, b"AAAA".to_vec()).await;
        rig.cache.put(&id, 0, 2, b"CCCC".to_vec()).await;
        rig.assembler.drain(&id, 0).await;

        // written == declared - failed, every article terminal
        assert!(rig.queue.with_job(&id, |j| j.files[0].assembled).unwrap());
        let path = rig.incomplete.join("Assembly Job").join("file0.bin");
        let contents = std::fs::read(&path).unwrap();
        // Article 2 landed at its declared offset 8, leaving a hole at 4..8
        assert_eq!(contents.len(), 12);
        assert_eq!(&contents[..4], b"AAAA");
        assert_eq!(&contents[8..], b"CCCC");
    }

    #[tokio::test]
    async fn first_chunk_sanitizes_filename_and_records_rename() {
        let mut rig = rig();
        let mut job = job_with_one_file(1, 4);
        job.files[0].filename = "we:ird*name?.bin".into();
        let admin_dir = rig
            ._dir
            .path()
            .join("admin")
            .join(&job.name)
            .join("__ADMIN__");
        let id = add_job(&rig, job);

        fetched(&rig, &id, 0, 0);
        rig.cache.put(&id, 0, 0, b"DATA".to_vec()).await;
        rig.assembler.drain(&id, 0).await;

        let sanitized = "we_ird_name_.bin";
        let path = rig.incomplete.join("Assembly Job").join(sanitized);
        assert!(path.exists(), "file must land under the sanitized name");

        let admin = JobAdmin::create(&admin_dir).unwrap();
        let renames = admin.load_renames().unwrap();
        assert_eq!(renames.get("we:ird*name?.bin").unwrap(), sanitized);
        assert_eq!(
            rig.queue
                .with_job(&id, |j| j.files[0].filename.clone())
                .unwrap(),
            sanitized
        );
    }

    #[tokio::test]
    async fn deleted_job_discards_bytes_and_purges_cache() {
        let mut rig = rig();
        let id = add_job(&rig, job_with_one_file(2, 4));

        fetched(&rig, &id, 0, 0);
        rig.cache.put(&id, 0, 0, b"AAAA".to_vec()).await;
        rig.cache.put(&id, 0, 1, b"BBBB".to_vec()).await;
        rig.queue.remove(&id).unwrap();

        rig.assembler.drain(&id, 0).await;

        assert_eq!(rig.cache.tracked_bytes(), 0, "cache purged for deleted job");
        assert!(
            !rig.incomplete.join("Assembly Job").join("file0.bin").exists(),
            "no bytes may land after deletion"
        );
    }

    #[test]
    fn partial_detection_compares_disk_size_to_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"12345").unwrap();

        assert!(is_partial(&path, 10, 0));
        assert!(!is_partial(&path, 5, 0));
        assert!(!is_partial(&path, 9, 4), "failed bytes reduce the target");
        assert!(is_partial(dir.path().join("missing").as_path(), 1, 0));
    }
}
