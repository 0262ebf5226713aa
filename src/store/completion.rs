use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

/// Outcome of the most recent run of a named job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub job_name: String,
    pub return_code: i32,
    pub completed_at: DateTime<Utc>,
    pub message: String,
}

impl CompletionRecord {
    pub fn new(job_name: impl Into<String>, return_code: i32, message: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            return_code,
            completed_at: Utc::now(),
            message: message.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.return_code == 0
    }
}

#[async_trait]
pub trait CompletionStore: Send + Sync {
    /// Insert or replace the record for `record.job_name`.
    async fn record(&self, record: CompletionRecord) -> Result<()>;

    async fn get(&self, job_name: &str) -> Result<Option<CompletionRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryCompletionStore {
    records: RwLock<HashMap<String, CompletionRecord>>,
}

impl MemoryCompletionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CompletionStore for MemoryCompletionStore {
    async fn record(&self, record: CompletionRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.job_name.clone(), record);
        Ok(())
    }

    async fn get(&self, job_name: &str) -> Result<Option<CompletionRecord>> {
        Ok(self.records.read().await.get(job_name).cloned())
    }
}

/// Completion records kept in a JSON document on disk.
///
/// The whole map is rewritten on every record through a temporary file and a
/// rename, so a crash mid-write leaves the previous document intact.
#[derive(Debug)]
pub struct JsonFileCompletionStore {
    path: PathBuf,
    records: RwLock<BTreeMap<String, CompletionRecord>>,
}

impl JsonFileCompletionStore {
    /// Open the store at `path`, loading existing records if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            path = %path.display(),
            records = records.len(),
            "Opened completion store"
        );

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    async fn persist(&self, records: &BTreeMap<String, CompletionRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CompletionStore for JsonFileCompletionStore {
    async fn record(&self, record: CompletionRecord) -> Result<()> {
        // Hold the write lock across the rewrite so concurrent records serialize.
        let mut records = self.records.write().await;
        records.insert(record.job_name.clone(), record);
        self.persist(&records).await
    }

    async fn get(&self, job_name: &str) -> Result<Option<CompletionRecord>> {
        Ok(self.records.read().await.get(job_name).cloned())
    }
}
