//! Destination layout of downloaded datasets
//!
//! `<download directory, strftime-expanded>/<entry id components>/<file name>`

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Suffix of in-progress temporary files
pub(crate) const PARTIAL_SUFFIX: &str = ".part";

/// Expand strftime placeholders in `template` with the dataset's time coverage start
///
/// A template without `%` is returned as is. A template with placeholders but no
/// time to expand them with is an error, as is an invalid placeholder.
pub(crate) fn expand_directory(template: &str, time: Option<DateTime<Utc>>) -> Result<PathBuf> {
    if !template.contains('%') {
        return Ok(PathBuf::from(template));
    }
    let Some(time) = time else {
        return Err(Error::Other(format!(
            "download directory '{template}' has date placeholders but the dataset has no time coverage"
        )));
    };

    // chrono reports bad specifiers through fmt::Error instead of panicking here
    let mut expanded = String::new();
    write!(expanded, "{}", time.format(template)).map_err(|_| {
        Error::config(
            format!("invalid date placeholder in download directory '{template}'"),
            "download_directory",
        )
    })?;
    Ok(PathBuf::from(expanded))
}

/// Relative directory of a dataset, built from its entry id
///
/// Both `/` and `\` separate components; empty and `.` components are dropped.
pub(crate) fn dataset_directory(entry_id: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for part in entry_id.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                return Err(Error::Other(format!(
                    "entry id '{entry_id}' escapes the download directory"
                )));
            }
            part => relative.push(part),
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(Error::Other(format!("entry id '{entry_id}' is empty")));
    }
    Ok(relative)
}

/// Whether `name` is a temporary file written by an in-progress download
pub(crate) fn is_partial(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)
}

/// The file of an already downloaded dataset: the directory holds exactly one entry
/// (ignoring temporary files) and it is a regular file
pub(crate) async fn find_existing_file(directory: &Path) -> Result<Option<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if is_partial(&entry.file_name().to_string_lossy()) {
            continue;
        }
        found.push(entry);
        if found.len() > 1 {
            return Ok(None);
        }
    }

    match found.pop() {
        Some(entry) if entry.file_type().await?.is_file() => Ok(Some(entry.path())),
        _ => Ok(None),
    }
}

/// Remove `directory` and its empty parents, stopping at `root`
///
/// Only empty directories are removed; anything still holding files is left alone.
pub(crate) async fn remove_empty_dirs(directory: &Path, root: &Path) {
    let mut current = Some(directory);
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if tokio::fs::remove_dir(dir).await.is_err() {
            break;
        }
        tracing::debug!(path = %dir.display(), "removed empty dataset directory");
        current = dir.parent();
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn directory_template_is_expanded_with_coverage_start() {
        let time = Utc.with_ymd_and_hms(2024, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(
            expand_directory("/data/%Y/%m/%d", Some(time)).unwrap(),
            PathBuf::from("/data/2024/03/07")
        );
        assert_eq!(
            expand_directory("/data/plain", None).unwrap(),
            PathBuf::from("/data/plain")
        );
    }

    #[test]
    fn directory_template_without_time_fails() {
        assert!(matches!(
            expand_directory("/data/%Y", None),
            Err(Error::Other(_))
        ));
    }

    #[test]
    fn invalid_placeholder_is_a_config_error() {
        let time = Utc.with_ymd_and_hms(2024, 3, 7, 0, 0, 0).unwrap();
        assert!(matches!(
            expand_directory("/data/%Q", Some(time)),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn entry_id_splits_on_both_separators() {
        assert_eq!(
            dataset_directory("cmems/sst\\2024/file").unwrap(),
            PathBuf::from("cmems/sst/2024/file")
        );
        assert_eq!(dataset_directory("/./a//b/").unwrap(), PathBuf::from("a/b"));
        assert!(dataset_directory("a/../../etc").is_err());
        assert!(dataset_directory("//").is_err());
    }

    #[tokio::test]
    async fn existing_file_requires_exactly_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("ds");
        assert_eq!(find_existing_file(&dataset).await.unwrap(), None);

        std::fs::create_dir(&dataset).unwrap();
        assert_eq!(find_existing_file(&dataset).await.unwrap(), None);

        std::fs::write(dataset.join(".tmpab12.part"), b"partial").unwrap();
        std::fs::write(dataset.join("a.nc"), b"data").unwrap();
        assert_eq!(
            find_existing_file(&dataset).await.unwrap(),
            Some(dataset.join("a.nc"))
        );

        std::fs::write(dataset.join("b.nc"), b"data").unwrap();
        assert_eq!(find_existing_file(&dataset).await.unwrap(), None);
    }

    #[tokio::test]
    async fn only_empty_directories_up_to_root_are_removed() {
        let root = tempfile::tempdir().unwrap();
        let kept = root.path().join("a");
        let leaf = kept.join("b/c");
        std::fs::create_dir_all(&leaf).unwrap();
        std::fs::write(kept.join("other.nc"), b"x").unwrap();

        remove_empty_dirs(&leaf, root.path()).await;
        assert!(!kept.join("b").exists());
        assert!(kept.exists());
        assert!(root.path().exists());
    }
}
