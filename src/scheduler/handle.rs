use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{JobError, Result};
use crate::scheduler::job::{Job, JobId, JobRequest, RunningJob};
use crate::store::{CompletionRecord, CompletionStore, ConsoleLine, ConsoleSink};

/// Requests handed from callers to the scheduler loop.
#[derive(Debug)]
pub enum SchedulerCommand {
    Submit(Job),
    Kill {
        name: String,
    },
    ListRunning {
        response_tx: oneshot::Sender<Vec<RunningJob>>,
    },
}

/// Cloneable entry point to a running [`Scheduler`](crate::scheduler::Scheduler).
///
/// Queue mutations go through the loop's channel; console and completion
/// reads go straight to the stores.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
    completions: Arc<dyn CompletionStore>,
    console: ConsoleSink,
}

impl SchedulerHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<SchedulerCommand>,
        completions: Arc<dyn CompletionStore>,
        console: ConsoleSink,
    ) -> Self {
        Self {
            tx,
            completions,
            console,
        }
    }

    /// Enqueue a job. Launch problems surface later as a failed completion
    /// record, never here.
    pub fn submit(&self, request: JobRequest) -> Result<JobId> {
        let job = Job::new(request);
        let id = job.id();
        tracing::info!(
            job_id = %id,
            job_name = job.name(),
            command = %job.command(),
            lock_keys = ?job.lock_keys(),
            "Submitting job"
        );
        self.tx
            .send(SchedulerCommand::Submit(job))
            .map_err(|_| JobError::SchedulerStopped)?;
        Ok(id)
    }

    /// Best-effort kill of the first job named `name`. Unknown names are ignored.
    pub fn kill(&self, name: impl Into<String>) -> Result<()> {
        self.tx
            .send(SchedulerCommand::Kill { name: name.into() })
            .map_err(|_| JobError::SchedulerStopped)
    }

    /// Jobs in the queue that relay output to a callback.
    pub async fn list_running(&self) -> Result<Vec<RunningJob>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::ListRunning { response_tx })
            .map_err(|_| JobError::SchedulerStopped)?;
        response_rx.await.map_err(|_| JobError::SchedulerStopped)
    }

    pub async fn console_lines(&self, job_name: &str) -> Result<Vec<ConsoleLine>> {
        self.console.query(job_name).await
    }

    pub async fn clear_console(&self, job_name: &str) -> Result<usize> {
        self.console.clear(job_name).await
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<ConsoleLine> {
        self.console.subscribe()
    }

    pub async fn completion(&self, job_name: &str) -> Result<Option<CompletionRecord>> {
        self.completions.get(job_name).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}
