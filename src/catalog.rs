//! Dataset catalog interface
//!
//! The catalog resolves a [`Selection`] to dataset records. The download manager only
//! reads from it, except for recording the local path of a finished download when
//! asked to.
//!
//! Two implementations ship with the crate: [`FileCatalog`] (a JSON document on disk,
//! used by the command-line tool) and [`MemoryCatalog`].

use crate::error::{Error, Result};
use crate::types::DatasetId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// One dataset as known to the catalog
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// Catalog identifier
    pub id: DatasetId,
    /// Display identifier; also names the dataset's download directory
    pub entry_id: String,
    /// Candidate resource URIs, in preference order
    #[serde(default)]
    pub uris: Vec<String>,
    /// Start of the time coverage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_coverage_start: Option<DateTime<Utc>>,
    /// End of the time coverage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_coverage_end: Option<DateTime<Utc>>,
}

impl DatasetRecord {
    /// Record with a single URI and no time coverage
    pub fn new(id: i64, entry_id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: DatasetId(id),
            entry_id: entry_id.into(),
            uris: vec![uri.into()],
            time_coverage_start: None,
            time_coverage_end: None,
        }
    }

    /// Set the time coverage
    #[must_use]
    pub fn with_time_coverage(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time_coverage_start = Some(start);
        self.time_coverage_end = Some(end);
        self
    }

    /// Add another candidate URI
    #[must_use]
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uris.push(uri.into());
        self
    }
}

/// Filter expression over dataset attributes
///
/// A flat mapping of lookups to values, combined with AND. The manager passes it to
/// the catalog untouched. The built-in catalogs understand:
///
/// | key | value |
/// |-----|-------|
/// | `id` | integer |
/// | `id__in` | array of integers |
/// | `entry_id` | string, exact match |
/// | `entry_id__contains` | string |
/// | `uri__contains` | string, matched against every URI |
/// | `time_coverage_start__gte` | RFC 3339 timestamp |
/// | `time_coverage_end__lte` | RFC 3339 timestamp |
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selection {
    criteria: Map<String, Value>,
}

impl Selection {
    /// Selection matching every dataset
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a criterion
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.criteria.insert(key.into(), value.into());
        self
    }

    /// Selection of the given datasets
    pub fn ids(ids: impl IntoIterator<Item = DatasetId>) -> Self {
        let ids: Vec<Value> = ids.into_iter().map(|id| Value::from(id.get())).collect();
        Self::new().with("id__in", ids)
    }

    /// Merge the criteria of `other` into this selection (other wins on conflicts)
    #[must_use]
    pub fn merge(mut self, other: Selection) -> Self {
        self.criteria.extend(other.criteria);
        self
    }

    /// The raw criteria
    pub fn criteria(&self) -> &Map<String, Value> {
        &self.criteria
    }

    /// True if the selection has no criteria
    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }
}

/// Source of dataset records
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Resolve a selection to dataset records
    async fn find_datasets(&self, selection: &Selection) -> Result<Vec<DatasetRecord>>;

    /// Record that a dataset is available locally at `path`
    async fn add_local_uri(&self, dataset_id: DatasetId, path: &Path) -> Result<()> {
        let _ = (dataset_id, path);
        Ok(())
    }
}

enum Criterion {
    Id(i64),
    IdIn(Vec<i64>),
    EntryId(String),
    EntryIdContains(String),
    UriContains(String),
    StartGte(DateTime<Utc>),
    EndLte(DateTime<Utc>),
}

impl Criterion {
    fn parse(key: &str, value: &Value) -> Result<Self> {
        let bad = |expected: &str| Error::Catalog(format!("'{key}' expects {expected}, got {value}"));
        let string = || value.as_str().map(str::to_string).ok_or_else(|| bad("a string"));
        let timestamp = || {
            value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| bad("an RFC 3339 timestamp"))
        };

        Ok(match key {
            "id" => Criterion::Id(value.as_i64().ok_or_else(|| bad("an integer"))?),
            "id__in" => Criterion::IdIn(
                value
                    .as_array()
                    .and_then(|ids| ids.iter().map(Value::as_i64).collect::<Option<Vec<_>>>())
                    .ok_or_else(|| bad("an array of integers"))?,
            ),
            "entry_id" => Criterion::EntryId(string()?),
            "entry_id__contains" => Criterion::EntryIdContains(string()?),
            "uri__contains" => Criterion::UriContains(string()?),
            "time_coverage_start__gte" => Criterion::StartGte(timestamp()?),
            "time_coverage_end__lte" => Criterion::EndLte(timestamp()?),
            other => return Err(Error::Catalog(format!("unsupported selection key '{other}'"))),
        })
    }

    fn matches(&self, record: &DatasetRecord) -> bool {
        match self {
            Criterion::Id(id) => record.id.get() == *id,
            Criterion::IdIn(ids) => ids.contains(&record.id.get()),
            Criterion::EntryId(entry_id) => &record.entry_id == entry_id,
            Criterion::EntryIdContains(part) => record.entry_id.contains(part.as_str()),
            Criterion::UriContains(part) => record.uris.iter().any(|uri| uri.contains(part.as_str())),
            Criterion::StartGte(t) => record.time_coverage_start.is_some_and(|start| start >= *t),
            Criterion::EndLte(t) => record.time_coverage_end.is_some_and(|end| end <= *t),
        }
    }
}

/// Apply a selection to records, keeping their order
pub fn filter_records<'a>(
    records: impl IntoIterator<Item = &'a DatasetRecord>,
    selection: &Selection,
) -> Result<Vec<DatasetRecord>> {
    let criteria = selection
        .criteria()
        .iter()
        .map(|(key, value)| Criterion::parse(key, value))
        .collect::<Result<Vec<_>>>()?;
    Ok(records
        .into_iter()
        .filter(|record| criteria.iter().all(|c| c.matches(record)))
        .cloned()
        .collect())
}

fn record_local_uri(records: &mut [DatasetRecord], dataset_id: DatasetId, path: &Path) -> Result<bool> {
    let record = records
        .iter_mut()
        .find(|record| record.id == dataset_id)
        .ok_or_else(|| Error::Catalog(format!("dataset {dataset_id} not found")))?;
    let uri = path.display().to_string();
    if record.uris.contains(&uri) {
        return Ok(false);
    }
    record.uris.push(uri);
    Ok(true)
}

/// Catalog held in memory
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    records: RwLock<Vec<DatasetRecord>>,
}

impl MemoryCatalog {
    /// Create a catalog from records
    pub fn new(records: Vec<DatasetRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Snapshot of all records
    pub async fn records(&self) -> Vec<DatasetRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn find_datasets(&self, selection: &Selection) -> Result<Vec<DatasetRecord>> {
        filter_records(self.records.read().await.iter(), selection)
    }

    async fn add_local_uri(&self, dataset_id: DatasetId, path: &Path) -> Result<()> {
        record_local_uri(&mut self.records.write().await, dataset_id, path)?;
        Ok(())
    }
}

/// Catalog stored as a JSON array of records
///
/// The file is read once by [`open`](Self::open). Recorded local paths are written
/// back by replacing the file.
#[derive(Debug)]
pub struct FileCatalog {
    path: PathBuf,
    records: RwLock<Vec<DatasetRecord>>,
}

impl FileCatalog {
    /// Load the catalog file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Catalog(format!("cannot read {}: {e}", path.display())))?;
        let records: Vec<DatasetRecord> = serde_json::from_slice(&content)
            .map_err(|e| Error::Catalog(format!("invalid catalog {}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), datasets = records.len(), "catalog loaded");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    /// Location of the catalog file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, records: &[DatasetRecord]) -> Result<()> {
        let content = serde_json::to_vec_pretty(records)?;
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn find_datasets(&self, selection: &Selection) -> Result<Vec<DatasetRecord>> {
        filter_records(self.records.read().await.iter(), selection)
    }

    async fn add_local_uri(&self, dataset_id: DatasetId, path: &Path) -> Result<()> {
        let mut records = self.records.write().await;
        if record_local_uri(&mut records, dataset_id, path)? {
            self.save(&records).await?;
        }
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn records() -> Vec<DatasetRecord> {
        let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap();
        vec![
            DatasetRecord::new(1, "S1A_IW_0001", "https://scihub/a")
                .with_time_coverage(day(1), day(2)),
            DatasetRecord::new(2, "S1B_IW_0002", "ftp://ftp.x/b").with_time_coverage(day(3), day(4)),
            DatasetRecord::new(3, "S1A_EW_0003", "https://scihub/c")
                .with_uri("ftp://ftp.x/c")
                .with_time_coverage(day(5), day(6)),
        ]
    }

    fn ids(found: &[DatasetRecord]) -> Vec<i64> {
        found.iter().map(|r| r.id.get()).collect()
    }

    #[tokio::test]
    async fn empty_selection_matches_everything_in_order() {
        let catalog = MemoryCatalog::new(records());
        let found = catalog.find_datasets(&Selection::new()).await.unwrap();
        assert_eq!(ids(&found), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn criteria_combine_with_and() {
        let catalog = MemoryCatalog::new(records());
        let selection = Selection::new()
            .with("entry_id__contains", "S1A")
            .with("uri__contains", "ftp://");
        assert_eq!(ids(&catalog.find_datasets(&selection).await.unwrap()), vec![3]);

        let selection = Selection::new()
            .with("time_coverage_start__gte", "2024-01-03T00:00:00Z")
            .with("time_coverage_end__lte", "2024-01-04T00:00:00Z");
        assert_eq!(ids(&catalog.find_datasets(&selection).await.unwrap()), vec![2]);

        let selection = Selection::ids([DatasetId(3), DatasetId(1)]);
        assert_eq!(ids(&catalog.find_datasets(&selection).await.unwrap()), vec![1, 3]);
    }

    #[tokio::test]
    async fn unknown_or_malformed_criteria_are_catalog_errors() {
        let catalog = MemoryCatalog::new(records());
        let err = catalog
            .find_datasets(&Selection::new().with("source__platform", "S1A"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Catalog(_)));

        let err = catalog
            .find_datasets(&Selection::new().with("time_coverage_start__gte", "yesterday"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("RFC 3339"));
    }

    #[tokio::test]
    async fn file_catalog_persists_local_uris() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, serde_json::to_vec(&records()).unwrap()).unwrap();

        let catalog = FileCatalog::open(&path).await.unwrap();
        catalog
            .add_local_uri(DatasetId(2), Path::new("/data/S1B_IW_0002/b.nc"))
            .await
            .unwrap();
        // recording twice is a no-op
        catalog
            .add_local_uri(DatasetId(2), Path::new("/data/S1B_IW_0002/b.nc"))
            .await
            .unwrap();

        let reopened = FileCatalog::open(&path).await.unwrap();
        let found = reopened
            .find_datasets(&Selection::new().with("id", 2))
            .await
            .unwrap();
        assert_eq!(
            found[0].uris,
            vec!["ftp://ftp.x/b".to_string(), "/data/S1B_IW_0002/b.nc".to_string()]
        );

        let err = catalog
            .add_local_uri(DatasetId(99), Path::new("/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Catalog(_)));
    }

    #[tokio::test]
    async fn file_catalog_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(FileCatalog::open(&path).await, Err(Error::Catalog(_))));
    }
}
