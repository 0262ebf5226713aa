use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::error::Result;
use crate::scheduler::JobId;

const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Display color attached to a console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorHint {
    White,
    Red,
    LightGreen,
    Orange,
}

impl ColorHint {
    /// Default color for a standard-output line, keyed on playbook status prefixes.
    pub fn classify(text: &str) -> Self {
        if text.starts_with("fatal") {
            ColorHint::Red
        } else if text.starts_with("skipping") || text.starts_with("ok") {
            ColorHint::LightGreen
        } else if text.starts_with("changed") {
            ColorHint::Orange
        } else {
            ColorHint::White
        }
    }
}

impl std::fmt::Display for ColorHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColorHint::White => write!(f, "white"),
            ColorHint::Red => write!(f, "red"),
            ColorHint::LightGreen => write!(f, "lightgreen"),
            ColorHint::Orange => write!(f, "orange"),
        }
    }
}

/// One line of captured process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub job_name: String,
    pub job_id: JobId,
    pub text: String,
    pub color: ColorHint,
}

#[async_trait]
pub trait ConsoleStore: Send + Sync {
    async fn append(&self, line: ConsoleLine) -> Result<()>;

    /// Lines recorded for `job_name`, in insertion order.
    async fn query(&self, job_name: &str) -> Result<Vec<ConsoleLine>>;

    /// Delete every line recorded for `job_name`. Returns how many were removed.
    async fn clear(&self, job_name: &str) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct MemoryConsoleStore {
    lines: RwLock<Vec<ConsoleLine>>,
}

impl MemoryConsoleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsoleStore for MemoryConsoleStore {
    async fn append(&self, line: ConsoleLine) -> Result<()> {
        self.lines.write().await.push(line);
        Ok(())
    }

    async fn query(&self, job_name: &str) -> Result<Vec<ConsoleLine>> {
        Ok(self
            .lines
            .read()
            .await
            .iter()
            .filter(|l| l.job_name == job_name)
            .cloned()
            .collect())
    }

    async fn clear(&self, job_name: &str) -> Result<usize> {
        let mut lines = self.lines.write().await;
        let before = lines.len();
        lines.retain(|l| l.job_name != job_name);
        Ok(before - lines.len())
    }
}

/// Append-only console log that also fans lines out to live subscribers.
#[derive(Clone)]
pub struct ConsoleSink {
    store: Arc<dyn ConsoleStore>,
    live: broadcast::Sender<ConsoleLine>,
}

impl ConsoleSink {
    pub fn new(store: Arc<dyn ConsoleStore>) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self { store, live }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryConsoleStore::new()))
    }

    /// Persist `line`, then broadcast it. Having no live subscribers is fine.
    pub async fn publish(&self, line: ConsoleLine) -> Result<()> {
        self.store.append(line.clone()).await?;
        let _ = self.live.send(line);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleLine> {
        self.live.subscribe()
    }

    pub async fn query(&self, job_name: &str) -> Result<Vec<ConsoleLine>> {
        self.store.query(job_name).await
    }

    pub async fn clear(&self, job_name: &str) -> Result<usize> {
        self.store.clear(job_name).await
    }
}

impl std::fmt::Debug for ConsoleSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleSink")
            .field("subscribers", &self.live.receiver_count())
            .finish()
    }
}
