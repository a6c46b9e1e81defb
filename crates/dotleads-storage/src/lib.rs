//! CSV artifact storage, HTTP client setup and the partitioned destination store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use dotleads_core::{format_date, header_row, stored_keys, NormalizedRecord};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub mod sheets;

pub use sheets::{GoogleSheetsDestination, ServiceAccountKey, TokenSource};

pub const CRATE_NAME: &str = "dotleads-storage";

/// Default file name prefix for CSV artifacts: `dot_leads_<date>.csv`.
pub const DEFAULT_CSV_PREFIX: &str = "dot_leads";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: Some(format!("dotleads/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Clone)]
pub struct StoredCsv {
    pub path: PathBuf,
    pub rows: usize,
    pub byte_size: usize,
}

/// Writes per-day CSV artifacts under a single output directory.
#[derive(Debug, Clone)]
pub struct CsvArtifactStore {
    root: PathBuf,
    prefix: String,
}

impl CsvArtifactStore {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<prefix>_<date>.csv`, or `<prefix>_<date>_<suffix>.csv` when a suffix is given.
    pub fn artifact_path(&self, date: NaiveDate, suffix: Option<&str>) -> PathBuf {
        let stem = match suffix.map(str::trim).filter(|s| !s.is_empty()) {
            Some(suffix) => format!("{}_{}_{}", self.prefix, format_date(date), suffix),
            None => format!("{}_{}", self.prefix, format_date(date)),
        };
        self.root.join(format!("{stem}.csv"))
    }

    /// Header row followed by one row per record.
    pub fn encode_records(records: &[NormalizedRecord]) -> anyhow::Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        writer
            .write_record(header_row())
            .context("writing csv header")?;
        for record in records {
            writer
                .write_record(record.to_row())
                .with_context(|| format!("writing csv row for {}", record.dot_number))?;
        }
        writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flushing csv buffer: {}", err.error()))
    }

    /// Replace the artifact for `date` atomically via temp file + rename.
    pub async fn write_records(
        &self,
        date: NaiveDate,
        suffix: Option<&str>,
        records: &[NormalizedRecord],
    ) -> anyhow::Result<StoredCsv> {
        let bytes = Self::encode_records(records)?;
        let path = self.artifact_path(date, suffix);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating output directory {}", self.root.display()))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp csv file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp csv file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp csv file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp csv {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        tracing::info!(path = %path.display(), rows = records.len(), "wrote csv artifact");
        Ok(StoredCsv {
            path,
            rows: records.len(),
            byte_size: bytes.len(),
        })
    }
}

/// One per-day partition (a spreadsheet tab) in a destination store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHandle {
    pub name: String,
    pub id: i64,
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("reading service account credentials {path}: {reason}")]
    Credentials { path: String, reason: String },
    #[error("obtaining access token: {0}")]
    Token(String),
    #[error("unexpected response: {0}")]
    Malformed(String),
}

/// Append-only store organised in named per-day partitions.
///
/// Implementations never rewrite or delete rows already present.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn find_partition(&self, name: &str) -> Result<Option<PartitionHandle>, DestinationError>;

    /// Create the partition and write `header` as its first row.
    async fn create_partition(
        &self,
        name: &str,
        header: &[String],
        expected_rows: usize,
    ) -> Result<PartitionHandle, DestinationError>;

    /// Natural keys (first column) of every stored data row, header excluded.
    async fn read_keys(&self, partition: &PartitionHandle) -> Result<Vec<String>, DestinationError>;

    async fn append_rows(
        &self,
        partition: &PartitionHandle,
        rows: &[Vec<String>],
    ) -> Result<(), DestinationError>;

    fn partition_reference(&self, partition: &PartitionHandle) -> String;
}

#[async_trait]
impl<T: Destination + ?Sized> Destination for Arc<T> {
    async fn find_partition(&self, name: &str) -> Result<Option<PartitionHandle>, DestinationError> {
        (**self).find_partition(name).await
    }

    async fn create_partition(
        &self,
        name: &str,
        header: &[String],
        expected_rows: usize,
    ) -> Result<PartitionHandle, DestinationError> {
        (**self).create_partition(name, header, expected_rows).await
    }

    async fn read_keys(&self, partition: &PartitionHandle) -> Result<Vec<String>, DestinationError> {
        (**self).read_keys(partition).await
    }

    async fn append_rows(
        &self,
        partition: &PartitionHandle,
        rows: &[Vec<String>],
    ) -> Result<(), DestinationError> {
        (**self).append_rows(partition, rows).await
    }

    fn partition_reference(&self, partition: &PartitionHandle) -> String {
        (**self).partition_reference(partition)
    }
}

#[derive(Debug, Clone)]
struct MemoryPartition {
    handle: PartitionHandle,
    rows: Vec<Vec<String>>,
}

/// In-process destination used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    partitions: Mutex<Vec<MemoryPartition>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows of a partition, header included.
    pub async fn rows(&self, name: &str) -> Option<Vec<Vec<String>>> {
        self.partitions
            .lock()
            .await
            .iter()
            .find(|p| p.handle.name == name)
            .map(|p| p.rows.clone())
    }

    /// Add a partition holding exactly `rows`, with no header row written for it.
    pub async fn seed_partition(&self, name: &str, rows: Vec<Vec<String>>) -> PartitionHandle {
        let mut partitions = self.partitions.lock().await;
        let handle = PartitionHandle {
            name: name.to_string(),
            id: partitions.len() as i64,
        };
        partitions.push(MemoryPartition {
            handle: handle.clone(),
            rows,
        });
        handle
    }

    pub async fn partition_names(&self) -> Vec<String> {
        self.partitions
            .lock()
            .await
            .iter()
            .map(|p| p.handle.name.clone())
            .collect()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn find_partition(&self, name: &str) -> Result<Option<PartitionHandle>, DestinationError> {
        Ok(self
            .partitions
            .lock()
            .await
            .iter()
            .find(|p| p.handle.name == name)
            .map(|p| p.handle.clone()))
    }

    async fn create_partition(
        &self,
        name: &str,
        header: &[String],
        _expected_rows: usize,
    ) -> Result<PartitionHandle, DestinationError> {
        let mut partitions = self.partitions.lock().await;
        if let Some(existing) = partitions.iter().find(|p| p.handle.name == name) {
            return Ok(existing.handle.clone());
        }
        let handle = PartitionHandle {
            name: name.to_string(),
            id: partitions.len() as i64,
        };
        partitions.push(MemoryPartition {
            handle: handle.clone(),
            rows: vec![header.to_vec()],
        });
        Ok(handle)
    }

    async fn read_keys(&self, partition: &PartitionHandle) -> Result<Vec<String>, DestinationError> {
        let partitions = self.partitions.lock().await;
        let stored = partitions
            .iter()
            .find(|p| p.handle == *partition)
            .ok_or_else(|| DestinationError::Malformed(format!("unknown partition {}", partition.name)))?;
        Ok(stored_keys(
            stored.rows.iter().filter_map(|row| row.first()).map(String::as_str),
        ))
    }

    async fn append_rows(
        &self,
        partition: &PartitionHandle,
        rows: &[Vec<String>],
    ) -> Result<(), DestinationError> {
        let mut partitions = self.partitions.lock().await;
        let stored = partitions
            .iter_mut()
            .find(|p| p.handle == *partition)
            .ok_or_else(|| DestinationError::Malformed(format!("unknown partition {}", partition.name)))?;
        stored.rows.extend(rows.iter().cloned());
        Ok(())
    }

    fn partition_reference(&self, partition: &PartitionHandle) -> String {
        format!("memory://{}", partition.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(dot: &str) -> NormalizedRecord {
        NormalizedRecord {
            dot_number: dot.to_string(),
            legal_name: format!("CARRIER {dot}, INC"),
            dba_name: String::new(),
            city: "DALLAS".into(),
            state: "TX".into(),
            zip: "75201".into(),
            phone: "2145550100".into(),
            add_date: "2024-03-01".into(),
            date_pulled: "2024-03-02".into(),
        }
    }

    #[test]
    fn artifact_paths_follow_prefix_date_convention() {
        let store = CsvArtifactStore::new("/tmp/out", DEFAULT_CSV_PREFIX);
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            store.artifact_path(date, None),
            PathBuf::from("/tmp/out/dot_leads_2024-03-01.csv")
        );
        assert_eq!(
            store.artifact_path(date, Some("new")),
            PathBuf::from("/tmp/out/dot_leads_2024-03-01_new.csv")
        );
    }

    #[test]
    fn encoded_csv_quotes_embedded_commas() {
        let bytes = CsvArtifactStore::encode_records(&[record("42")]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "DOT Number,Legal Company Name,DBA Name,City,State,ZIP Code,Phone,ADD_DATE,Date Pulled"
        );
        assert_eq!(
            lines.next().unwrap(),
            "42,\"CARRIER 42, INC\",,DALLAS,TX,75201,2145550100,2024-03-01,2024-03-02"
        );
        assert!(lines.next().is_none());
    }

    #[tokio::test]
    async fn write_records_replaces_previous_artifact() {
        let dir = tempdir().expect("tempdir");
        let store = CsvArtifactStore::new(dir.path().join("csv"), DEFAULT_CSV_PREFIX);
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let first = store
            .write_records(date, None, &[record("1"), record("2")])
            .await
            .expect("first write");
        let second = store
            .write_records(date, None, &[record("3")])
            .await
            .expect("second write");

        assert_eq!(first.path, second.path);
        assert_eq!(second.rows, 1);
        let text = std::fs::read_to_string(&second.path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("\n3,"));

        let leftovers = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn memory_destination_reads_keys_without_header() {
        let dest = MemoryDestination::new();
        let handle = dest
            .create_partition("DOT Leads 2024-03-01", &header_row(), 2)
            .await
            .unwrap();
        dest.append_rows(&handle, &[record("7").to_row(), record("8").to_row()])
            .await
            .unwrap();

        assert_eq!(dest.read_keys(&handle).await.unwrap(), vec!["7", "8"]);
        assert_eq!(
            dest.find_partition("DOT Leads 2024-03-01").await.unwrap(),
            Some(handle.clone())
        );
        assert_eq!(dest.find_partition("DOT Leads 2024-03-02").await.unwrap(), None);
        assert_eq!(dest.partition_reference(&handle), "memory://DOT Leads 2024-03-01");
    }

    #[tokio::test]
    async fn memory_destination_reads_every_key_of_a_headerless_partition() {
        let dest = MemoryDestination::new();
        let handle = dest
            .seed_partition("DOT Leads 2024-03-01", vec![record("111").to_row(), record("222").to_row()])
            .await;

        assert_eq!(dest.read_keys(&handle).await.unwrap(), vec!["111", "222"]);
    }
}
