//! Append-only history of finished jobs
//!
//! A single-file SQLite store (`history<VERSION>.db`) holding one immutable
//! record per finished job. Records are written durably before the job's
//! admin directory is removed, so a job can never vanish from both worlds.

use crate::error::{Error, Result};
use crate::nzb::NzbObject;
use crate::types::{HistoryStatus, JobId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::{FromRow, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Version of the history database schema, part of the file name
pub const HISTORY_DB_VERSION: u32 = 1;

/// File name of the history database inside the admin directory
pub fn history_file(dir: &Path) -> PathBuf {
    dir.join(format!("history{HISTORY_DB_VERSION}.db"))
}

/// An immutable snapshot of one finished job
#[derive(Clone, Debug, FromRow)]
pub struct HistoryRecord {
    /// Row id
    pub id: i64,
    /// Display name
    pub name: String,
    /// Category tag
    pub category: Option<String>,
    /// Post-processing level applied
    pub pp: i64,
    /// Script that ran, if any
    pub script: Option<String>,
    /// Free-form report line
    pub report: Option<String>,
    /// Source URL, if the job arrived by URL
    pub url: Option<String>,
    /// Final status string ("Completed" / "Failed")
    pub status: String,
    /// The job id the record was derived from
    pub nzo_id: String,
    /// Final storage path
    pub storage: Option<String>,
    /// Working path while the job ran
    pub path: Option<String>,
    /// Captured script output
    pub script_log: Option<String>,
    /// Last line of script output
    pub script_line: Option<String>,
    /// Seconds spent downloading
    pub download_time: i64,
    /// Seconds spent in post-processing
    pub postproc_time: i64,
    /// Serialized ordered stage log
    pub stage_log: Option<String>,
    /// Bytes actually downloaded
    pub downloaded: i64,
    /// Completeness percentage at the end of downloading
    pub completeness: i64,
    /// Failure reason; empty on success
    pub fail_message: String,
    /// Extra URL metadata
    pub url_info: Option<String>,
    /// Declared job bytes
    pub bytes: i64,
    /// Serialized NZB metadata
    pub meta: Option<String>,
    /// Series tag for duplicate detection
    pub series: Option<String>,
    /// Digest over the job identity
    pub md5sum: Option<String>,
    /// Password used, if any
    pub password: Option<String>,
    /// Last UI action line
    pub action_line: Option<String>,
    /// Human-readable size
    pub size: Option<String>,
    /// Lowercased name for case-insensitive lookups
    pub name_lower: String,
    /// Retry counter
    pub retry: i64,
    /// Whether the record was archived in the UI
    pub archive: i64,
    /// Duplicate-detection key
    pub duplicate_key: String,
    /// Unix timestamp of completion
    pub completed_at: i64,
}

/// Filter for history listings
#[derive(Clone, Debug, Default)]
pub struct HistoryFilter {
    /// Only records with this final status
    pub status: Option<HistoryStatus>,
    /// Only records in this category
    pub category: Option<String>,
}

/// The history store
pub struct History {
    pool: SqlitePool,
}

impl History {
    /// Open (creating if needed) the history database in `admin_dir`
    pub async fn open(admin_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(admin_dir).await?;
        let path = history_file(admin_dir);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(Error::History)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await?;
        let history = Self { pool };
        history.migrate().await?;
        Ok(history)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                category TEXT,
                pp INTEGER NOT NULL DEFAULT 0,
                script TEXT,
                report TEXT,
                url TEXT,
                status TEXT NOT NULL,
                nzo_id TEXT NOT NULL UNIQUE,
                storage TEXT,
                path TEXT,
                script_log TEXT,
                script_line TEXT,
                download_time INTEGER NOT NULL DEFAULT 0,
                postproc_time INTEGER NOT NULL DEFAULT 0,
                stage_log TEXT,
                downloaded INTEGER NOT NULL DEFAULT 0,
                completeness INTEGER NOT NULL DEFAULT 0,
                fail_message TEXT NOT NULL DEFAULT '',
                url_info TEXT,
                bytes INTEGER NOT NULL DEFAULT 0,
                meta TEXT,
                series TEXT,
                md5sum TEXT,
                password TEXT,
                action_line TEXT,
                size TEXT,
                name_lower TEXT NOT NULL,
                retry INTEGER NOT NULL DEFAULT 0,
                archive INTEGER NOT NULL DEFAULT 0,
                duplicate_key TEXT NOT NULL,
                completed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_status ON history (status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_duplicate_key ON history (duplicate_key)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append the record for a finished job.
    ///
    /// Totally ordered and durable on return; the caller may only delete the
    /// job's admin directory afterwards.
    pub async fn append(
        &self,
        job: &NzbObject,
        status: HistoryStatus,
        storage: Option<&Path>,
        download_time: Duration,
        postproc_time: Duration,
    ) -> Result<i64> {
        let stage_log = serde_json::to_string(&job.stage_log)?;
        let completeness = if job.total_bytes > 0 {
            (job.bytes_downloaded * 100 / job.total_bytes) as i64
        } else {
            100
        };
        let md5sum = format!("{:x}", md5::compute(job.duplicate_key.as_bytes()));

        let result = sqlx::query(
            r#"
            INSERT INTO history (
                name, category, pp, script, report, url, status, nzo_id,
                storage, path, script_log, script_line, download_time,
                postproc_time, stage_log, downloaded, completeness,
                fail_message, url_info, bytes, meta, series, md5sum,
                password, action_line, size, name_lower, retry, archive,
                duplicate_key, completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                    ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.name)
        .bind(&job.category)
        .bind(job.post_proc as i64)
        .bind(Option::<String>::None)
        .bind(Option::<String>::None)
        .bind(&job.url)
        .bind(status.as_str())
        .bind(job.id.as_str())
        .bind(storage.and_then(|p| p.to_str()))
        .bind(job.admin_dir.to_str())
        .bind(Option::<String>::None)
        .bind(Option::<String>::None)
        .bind(download_time.as_secs() as i64)
        .bind(postproc_time.as_secs() as i64)
        .bind(stage_log)
        .bind(job.bytes_downloaded as i64)
        .bind(completeness)
        .bind(&job.fail_message)
        .bind(Option::<String>::None)
        .bind(job.total_bytes as i64)
        .bind(Option::<String>::None)
        .bind(Option::<String>::None)
        .bind(md5sum)
        .bind(&job.password)
        .bind(Option::<String>::None)
        .bind(human_size(job.total_bytes))
        .bind(job.name.to_lowercase())
        .bind(0i64)
        .bind(0i64)
        .bind(&job.duplicate_key)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// List records, most recent first, with paging and filters
    pub async fn list(
        &self,
        filter: &HistoryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HistoryRecord>> {
        let mut sql = String::from("SELECT * FROM history WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.category.is_some() {
            sql.push_str(" AND category = ?");
        }
        sql.push_str(" ORDER BY completed_at DESC, id DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, HistoryRecord>(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(category) = &filter.category {
            query = query.bind(category.clone());
        }
        query = query.bind(limit as i64).bind(offset as i64);

        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Look a record up by its job id
    pub async fn get(&self, id: &JobId) -> Result<Option<HistoryRecord>> {
        Ok(
            sqlx::query_as::<_, HistoryRecord>("SELECT * FROM history WHERE nzo_id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Delete one record by job id; returns whether a row went away
    pub async fn delete(&self, id: &JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM history WHERE nzo_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every failed record; returns how many went away
    pub async fn delete_failed(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM history WHERE status = ?")
            .bind(HistoryStatus::Failed.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete every completed record; returns how many went away
    pub async fn delete_completed(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM history WHERE status = ?")
            .bind(HistoryStatus::Completed.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Purge records older than `days`; the scheduler's midnight task
    pub async fn purge_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - i64::from(days) * 86_400;
        let result = sqlx::query("DELETE FROM history WHERE completed_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Keep only the newest `count` records
    pub async fn trim_to_count(&self, count: u64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM history WHERE id NOT IN (SELECT id FROM history ORDER BY completed_at DESC, id DESC LIMIT ?)",
        )
        .bind(count as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Find a duplicate by key, for admission checks
    pub async fn find_duplicate(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT nzo_id FROM history WHERE duplicate_key = ? LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Number of records in the store
    pub async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM history")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

/// Render a byte count the way the control surface shows sizes
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
