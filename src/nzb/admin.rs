//! Per-job admin directory
//!
//! Every job owns an admin directory for the whole of its life in the
//! system. It holds a versioned snapshot of the job, one descriptor per
//! file, a gzip'd copy of the source NZB, the `__verified__` and
//! `__renames__` maps, and the `SABnzbd_attrib` key/value file of
//! recoverable attributes. All writes are atomic: write to a temp file,
//! fsync, rename.

use crate::error::{Error, Result};
use crate::nzb::{NzbFile, NzbObject};
use crate::types::Priority;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Version tag of the job snapshot format
pub const JOB_SNAPSHOT_VERSION: u32 = 1;

/// Relative name of the verified-state map
const VERIFIED_FILE: &str = "__verified__";
/// Relative name of the rename map
const RENAMES_FILE: &str = "__renames__";
/// Relative name of the attribute file
const ATTRIB_FILE: &str = "SABnzbd_attrib";

/// Versioned wrapper around the serialized job
#[derive(Serialize, Deserialize)]
struct JobSnapshot {
    version: u32,
    job: NzbObject,
}

/// Write `data` to `path` atomically: temp file, fsync, rename.
pub fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");

    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        // Persist the rename itself
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Attributes recoverable from a job's admin directory even when the queue
/// snapshot is lost.
///
/// Unknown keys survive a load/save round-trip.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobAttributes {
    /// Category tag
    pub category: Option<String>,
    /// Priority tier
    pub priority: Option<Priority>,
    /// Password
    pub password: Option<String>,
    /// Source URL
    pub url: Option<String>,
    /// Unrecognized keys, preserved verbatim in order
    pub extra: Vec<(String, String)>,
}

impl JobAttributes {
    /// Render the `key = value` line format of `SABnzbd_attrib`
    fn to_text(&self) -> String {
        let mut out = String::new();
        if let Some(cat) = &self.category {
            out.push_str(&format!("category = {cat}\n"));
        }
        if let Some(p) = self.priority {
            out.push_str(&format!("priority = {}\n", p as i32));
        }
        if let Some(pw) = &self.password {
            out.push_str(&format!("password = {pw}\n"));
        }
        if let Some(url) = &self.url {
            out.push_str(&format!("url = {url}\n"));
        }
        for (k, v) in &self.extra {
            out.push_str(&format!("{k} = {v}\n"));
        }
        out
    }

    /// Parse the `key = value` line format
    fn from_text(text: &str) -> Self {
        let mut attrs = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "category" => attrs.category = Some(value.to_string()),
                "priority" => {
                    attrs.priority = value.parse::<i32>().ok().map(Priority::from_i32);
                }
                "password" => attrs.password = Some(value.to_string()),
                "url" => attrs.url = Some(value.to_string()),
                _ => attrs.extra.push((key.to_string(), value.to_string())),
            }
        }
        attrs
    }
}

/// Handle on one job's admin directory.
///
/// Only the owning job's tasks write through this handle; cross-task
/// serialization is the caller's per-job lock.
#[derive(Clone, Debug)]
pub struct JobAdmin {
    dir: PathBuf,
}

impl JobAdmin {
    /// Open (creating if needed) the admin directory at `dir`
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// The admin directory path
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist the versioned job snapshot
    pub fn save_job(&self, job: &NzbObject) -> Result<()> {
        let snapshot = JobSnapshot {
            version: JOB_SNAPSHOT_VERSION,
            job: job.clone(),
        };
        let data = serde_json::to_vec(&snapshot)?;
        atomic_write(&self.dir.join(job.id.as_str()), &data)?;
        Ok(())
    }

    /// Load the job snapshot back, refusing newer versions
    pub fn load_job(&self, id: &crate::types::JobId) -> Result<NzbObject> {
        let data = std::fs::read(self.dir.join(id.as_str()))?;
        let snapshot: JobSnapshot = serde_json::from_slice(&data)?;
        if snapshot.version > JOB_SNAPSHOT_VERSION {
            return Err(Error::Internal(format!(
                "job snapshot version {} is newer than supported {}",
                snapshot.version, JOB_SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot.job)
    }

    /// Persist a single file descriptor as `SABnzbd_nzf_<id>`
    pub fn save_nzf(&self, file: &NzbFile) -> Result<()> {
        let data = serde_json::to_vec(file)?;
        atomic_write(&self.dir.join(format!("SABnzbd_nzf_{}", file.nzf_id)), &data)?;
        Ok(())
    }

    /// Load a file descriptor back by its id
    pub fn load_nzf(&self, nzf_id: &str) -> Result<NzbFile> {
        let data = std::fs::read(self.dir.join(format!("SABnzbd_nzf_{nzf_id}")))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Store the gzip'd copy of the source NZB as `<name>.nzb.gz`
    pub fn save_nzb_gz(&self, job_name: &str, nzb_xml: &[u8]) -> Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(nzb_xml)?;
        let compressed = encoder.finish()?;
        atomic_write(&self.dir.join(format!("{job_name}.nzb.gz")), &compressed)?;
        Ok(())
    }

    /// Read the stored NZB back, decompressed
    pub fn load_nzb(&self, job_name: &str) -> Result<Vec<u8>> {
        let compressed = std::fs::read(self.dir.join(format!("{job_name}.nzb.gz")))?;
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Path of the stored NZB copy, for the script environment
    pub fn nzb_gz_path(&self, job_name: &str) -> PathBuf {
        self.dir.join(format!("{job_name}.nzb.gz"))
    }

    /// Persist the filename → verification-state map
    pub fn save_verified(&self, verified: &BTreeMap<String, bool>) -> Result<()> {
        let data = serde_json::to_vec(verified)?;
        atomic_write(&self.dir.join(VERIFIED_FILE), &data)?;
        Ok(())
    }

    /// Load the verification map, empty when absent
    pub fn load_verified(&self) -> Result<BTreeMap<String, bool>> {
        match std::fs::read(self.dir.join(VERIFIED_FILE)) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a rename in the original → final map
    pub fn record_rename(&self, original: &str, renamed: &str) -> Result<()> {
        let mut renames = self.load_renames()?;
        renames.insert(original.to_string(), renamed.to_string());
        let data = serde_json::to_vec(&renames)?;
        atomic_write(&self.dir.join(RENAMES_FILE), &data)?;
        Ok(())
    }

    /// Load the rename map, empty when absent
    pub fn load_renames(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read(self.dir.join(RENAMES_FILE)) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the recoverable attribute file
    pub fn save_attributes(&self, attrs: &JobAttributes) -> Result<()> {
        atomic_write(&self.dir.join(ATTRIB_FILE), attrs.to_text().as_bytes())?;
        Ok(())
    }

    /// Load the attribute file, default when absent
    pub fn load_attributes(&self) -> Result<JobAttributes> {
        match std::fs::read_to_string(self.dir.join(ATTRIB_FILE)) {
            Ok(text) => Ok(JobAttributes::from_text(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JobAttributes::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the admin directory and everything in it.
    ///
    /// Called by Finalize only after the history write is durable.
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::nzb::tests::make_file;
    use crate::types::JobId;

    fn make_admin() -> (JobAdmin, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let admin = JobAdmin::create(&dir.path().join("__ADMIN__")).unwrap();
        (admin, dir)
    }

    fn make_job() -> NzbObject {
        NzbObject::from_parts(
            "Admin Test",
            vec![make_file(0, 2, 500)],
            Path::new("/tmp/admin"),
            Some("hunter2".into()),
        )
    }

    #[test]
    fn job_snapshot_round_trips() {
        let (admin, _dir) = make_admin();
        let job = make_job();

        admin.save_job(&job).unwrap();
        let restored = admin.load_job(&job.id).unwrap();

        assert_eq!(restored.id, job.id);
        assert_eq!(restored.name, job.name);
        assert_eq!(restored.total_bytes, job.total_bytes);
        assert_eq!(restored.password.as_deref(), Some("hunter2"));
        assert_eq!(restored.files.len(), 1);
        assert_eq!(restored.files[0].articles.len(), 2);
    }

    #[test]
    fn newer_snapshot_version_is_refused() {
        let (admin, _dir) = make_admin();
        let job = make_job();
        let id = JobId(job.id.as_str().to_string());

        // Hand-write a snapshot claiming a future version
        let mut value = serde_json::to_value(JobSnapshot {
            version: JOB_SNAPSHOT_VERSION,
            job,
        })
        .unwrap();
        value["version"] = serde_json::json!(JOB_SNAPSHOT_VERSION + 1);
        std::fs::write(
            admin.dir().join(id.as_str()),
            serde_json::to_vec(&value).unwrap(),
        )
        .unwrap();

        let err = admin.load_job(&id).unwrap_err();
        assert!(
            err.to_string().contains("newer"),
            "error must name the version problem: {err}"
        );
    }

    #[test]
    fn nzf_descriptor_round_trips() {
        let (admin, _dir) = make_admin();
        let file = make_file(3, 4, 250);

        admin.save_nzf(&file).unwrap();
        let restored = admin.load_nzf(&file.nzf_id).unwrap();

        assert_eq!(restored.filename, file.filename);
        assert_eq!(restored.total_size, 1000);
        assert_eq!(restored.articles.len(), 4);
    }

    #[test]
    fn nzb_gz_round_trips_through_compression() {
        let (admin, _dir) = make_admin();
        let xml = b"<?xml version=\"1.0\"?><nzb><file subject=\"test\"/></nzb>";

        admin.save_nzb_gz("myjob", xml).unwrap();
        let restored = admin.load_nzb("myjob").unwrap();
        assert_eq!(restored, xml);

        // The stored copy is actually gzip (magic bytes)
        let raw = std::fs::read(admin.nzb_gz_path("myjob")).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn verified_and_renames_maps_round_trip() {
        let (admin, _dir) = make_admin();

        let mut verified = BTreeMap::new();
        verified.insert("file1.bin".to_string(), true);
        verified.insert("file2.bin".to_string(), false);
        admin.save_verified(&verified).unwrap();
        assert_eq!(admin.load_verified().unwrap(), verified);

        admin.record_rename("aGVsbG8.bin", "episode.mkv").unwrap();
        admin.record_rename("b2s.bin", "extras.mkv").unwrap();
        let renames = admin.load_renames().unwrap();
        assert_eq!(renames.get("aGVsbG8.bin").unwrap(), "episode.mkv");
        assert_eq!(renames.len(), 2);
    }

    #[test]
    fn missing_maps_load_as_empty() {
        let (admin, _dir) = make_admin();
        assert!(admin.load_verified().unwrap().is_empty());
        assert!(admin.load_renames().unwrap().is_empty());
        assert_eq!(admin.load_attributes().unwrap(), JobAttributes::default());
    }

    #[test]
    fn attributes_round_trip_every_recognized_key() {
        let (admin, _dir) = make_admin();
        let attrs = JobAttributes {
            category: Some("tv".into()),
            priority: Some(Priority::High),
            password: Some("secret word".into()),
            url: Some("https://indexer.example/get/42".into()),
            extra: Vec::new(),
        };

        admin.save_attributes(&attrs).unwrap();
        assert_eq!(admin.load_attributes().unwrap(), attrs);
    }

    #[test]
    fn attributes_preserve_unknown_keys() {
        let (admin, _dir) = make_admin();
        let text = "category = movies\nfuture_key = some value\npriority = 1\n";
        std::fs::write(admin.dir().join(ATTRIB_FILE), text).unwrap();

        let attrs = admin.load_attributes().unwrap();
        assert_eq!(attrs.category.as_deref(), Some("movies"));
        assert_eq!(attrs.priority, Some(Priority::High));
        assert_eq!(
            attrs.extra,
            vec![("future_key".to_string(), "some value".to_string())]
        );

        // Round-trip keeps the unknown key
        admin.save_attributes(&attrs).unwrap();
        let again = admin.load_attributes().unwrap();
        assert_eq!(again, attrs);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let (admin, _dir) = make_admin();
        let job = make_job();
        admin.save_job(&job).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(admin.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files must be renamed away");
    }

    #[test]
    fn delete_removes_directory_and_is_idempotent() {
        let (admin, _dir) = make_admin();
        admin.save_job(&make_job()).unwrap();

        admin.delete().unwrap();
        assert!(!admin.dir().exists());
        admin.delete().unwrap();
    }
}
