//! Password candidates for archive extraction

use tracing::debug;

/// Ordered, de-duplicated list of candidate passwords.
///
/// Precedence: job-carried passwords (operator input before NZB metadata),
/// then the global password file line by line, then optionally the empty
/// password as a last resort.
#[derive(Debug, Clone, Default)]
pub struct PasswordList {
    passwords: Vec<String>,
}

impl PasswordList {
    /// Collect candidates from every source
    pub async fn collect(
        job_passwords: &[String],
        global_file: Option<&std::path::Path>,
        try_empty: bool,
    ) -> Self {
        let mut passwords: Vec<String> = Vec::new();

        for pw in job_passwords {
            if !pw.is_empty() && !passwords.contains(pw) {
                passwords.push(pw.clone());
            }
        }

        if let Some(path) = global_file {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    for line in content.lines() {
                        let pw = line.trim();
                        if !pw.is_empty() && !passwords.iter().any(|p| p == pw) {
                            passwords.push(pw.to_string());
                        }
                    }
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "password file unreadable");
                }
            }
        }

        if try_empty {
            passwords.push(String::new());
        }

        debug!(count = passwords.len(), "collected extraction passwords");
        Self { passwords }
    }

    /// Build from explicit candidates, for tests and re-extraction
    pub fn from_vec(passwords: Vec<String>) -> Self {
        Self { passwords }
    }

    /// Iterate candidates in precedence order
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.passwords.iter()
    }

    /// Whether there is nothing to try
    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }

    /// Number of candidates
    pub fn len(&self) -> usize {
        self.passwords.len()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_passwords_come_first_and_deduplicate() {
        let list = PasswordList::collect(
            &["operator".to_string(), "meta".to_string(), "operator".to_string()],
            None,
            false,
        )
        .await;
        let collected: Vec<_> = list.iter().cloned().collect();
        assert_eq!(collected, vec!["operator", "meta"]);
    }

    #[tokio::test]
    async fn global_file_lines_append_after_job_passwords() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("passwords.txt");
        std::fs::write(&file, "filepw1\n\n  filepw2  \nmeta\n").unwrap();

        let list = PasswordList::collect(&["meta".to_string()], Some(&file), false).await;
        let collected: Vec<_> = list.iter().cloned().collect();
        assert_eq!(
            collected,
            vec!["meta", "filepw1", "filepw2"],
            "blank lines skipped, duplicates of job passwords skipped"
        );
    }

    #[tokio::test]
    async fn empty_password_is_last_resort() {
        let list = PasswordList::collect(&["pw".to_string()], None, true).await;
        let collected: Vec<_> = list.iter().cloned().collect();
        assert_eq!(collected, vec!["pw".to_string(), String::new()]);
    }

    #[tokio::test]
    async fn missing_global_file_is_ignored() {
        let list = PasswordList::collect(
            &[],
            Some(std::path::Path::new("/no/such/file")),
            false,
        )
        .await;
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }
}
