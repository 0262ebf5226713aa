use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{JobError, Result};
use crate::scheduler::handle::{SchedulerCommand, SchedulerHandle};
use crate::scheduler::job::{Job, JobState, RunningJob};
use crate::scheduler::lock::LockTable;
use crate::scheduler::probe::ProcessPoll;
use crate::scheduler::relay::forward;
use crate::store::{CompletionRecord, CompletionStore, ConsoleSink, MemoryCompletionStore};

/// Return code recorded when the scheduler itself fails while servicing a job.
pub const INTERNAL_ERROR_RETURN_CODE: i32 = 500;

/// Return code recorded when a process leaves no collectable exit status.
pub const ZOMBIE_RETURN_CODE: i32 = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Outcome {
    state: JobState,
    return_code: i32,
    message: String,
}

impl Outcome {
    fn exited(code: i32) -> Self {
        if code == 0 {
            Self {
                state: JobState::Completed,
                return_code: 0,
                message: "Job completed successfully".to_string(),
            }
        } else {
            Self {
                state: JobState::Failed,
                return_code: code,
                message: format!("Job exited with return code {}", code),
            }
        }
    }

    fn zombie() -> Self {
        Self {
            state: JobState::Zombie,
            return_code: ZOMBIE_RETURN_CODE,
            message: "Process became a zombie without a collectable exit status".to_string(),
        }
    }

    fn vanished() -> Self {
        Self {
            state: JobState::Zombie,
            return_code: ZOMBIE_RETURN_CODE,
            message: "Process is no longer alive and left no exit status".to_string(),
        }
    }

    fn internal(err: &JobError) -> Self {
        Self {
            state: JobState::Failed,
            return_code: INTERNAL_ERROR_RETURN_CODE,
            message: err.to_string(),
        }
    }

    /// Terminal outcome for a poll result, or `None` while the process runs.
    fn from_poll(poll: ProcessPoll) -> Option<Self> {
        match poll {
            ProcessPoll::Running => None,
            ProcessPoll::Exited(code) => Some(Self::exited(code)),
            ProcessPoll::Zombie => Some(Self::zombie()),
            ProcessPoll::Vanished => Some(Self::vanished()),
        }
    }
}

/// Single-writer job scheduler.
///
/// Owns the queue and the lock table. Each tick scans the queue in insertion
/// order: queued jobs whose lock keys are free get launched, running jobs get
/// one output drain pass and an exit poll, and finished jobs are reaped.
/// Everything else talks to it through a [`SchedulerHandle`].
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Vec<Job>,
    locks: LockTable,
    commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    accepting: bool,
    completions: Arc<dyn CompletionStore>,
    console: ConsoleSink,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        completions: Arc<dyn CompletionStore>,
        console: ConsoleSink,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle::new(tx, completions.clone(), console.clone());

        let scheduler = Self {
            config,
            queue: Vec::new(),
            locks: LockTable::new(),
            commands: rx,
            accepting: true,
            completions,
            console,
        };

        (scheduler, handle)
    }

    /// Scheduler backed by in-memory completion and console stores.
    pub fn in_memory(config: SchedulerConfig) -> (Self, SchedulerHandle) {
        Self::new(
            config,
            Arc::new(MemoryCompletionStore::new()),
            ConsoleSink::in_memory(),
        )
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Run until `shutdown` is cancelled, or until every handle is dropped and
    /// the queue has emptied.
    ///
    /// On shutdown, launched jobs are killed and reaped; jobs still waiting
    /// for their locks are discarded.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Starting job queue");
        let mut next_report = Instant::now() + self.config.first_report_delay();

        loop {
            self.receive_commands();

            if self.queue.is_empty() {
                if !self.accepting {
                    break;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    command = self.commands.recv() => match command {
                        Some(command) => self.handle_command(command),
                        None => self.accepting = false,
                    },
                    _ = tokio::time::sleep(self.config.idle_sleep()) => {}
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            if Instant::now() >= next_report {
                next_report = Instant::now() + self.config.report_interval();
                self.log_queue();
            }

            let paused = self.tick().await;
            self.pace(&shutdown, paused).await;
        }

        self.stop_jobs().await;
        tracing::info!("Job queue stopped");
    }

    /// Wait one read pause after a pass that never paused on job output, so
    /// silent or lock-blocked jobs are polled at that rate instead of
    /// continuously. An incoming command ends the wait early.
    async fn pace(&mut self, shutdown: &CancellationToken, paused: bool) {
        if paused || self.queue.is_empty() {
            return;
        }

        let accepting = self.accepting;
        tokio::select! {
            _ = shutdown.cancelled() => {}
            command = self.commands.recv(), if accepting => match command {
                Some(command) => self.handle_command(command),
                None => self.accepting = false,
            },
            _ = tokio::time::sleep(self.config.read_pause()) => {}
        }
    }

    fn receive_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.accepting {
                        tracing::debug!("All scheduler handles dropped");
                    }
                    self.accepting = false;
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Submit(job) => {
                tracing::debug!(job_id = %job.id(), job_name = job.name(), "Job queued");
                self.queue.push(job);
                tracing::debug!(queue_size = self.queue.len(), "Queue size after add");
            }
            SchedulerCommand::Kill { name } => self.kill_by_name(&name),
            SchedulerCommand::ListRunning { response_tx } => {
                let _ = response_tx.send(self.running_jobs());
            }
        }
    }

    /// Signal every launched job named `name`. Jobs still waiting for their
    /// locks are left queued.
    fn kill_by_name(&mut self, name: &str) {
        let mut signalled = 0;
        for job in self
            .queue
            .iter_mut()
            .filter(|j| j.name() == name && j.is_launched())
        {
            match job.kill() {
                Ok(_) => {
                    signalled += 1;
                    tracing::info!(job_id = %job.id(), job_name = name, pid = ?job.pid(), "Kill signal sent");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id(), job_name = name, error = %e, "Failed to kill job");
                }
            }
        }

        if signalled == 0 {
            tracing::debug!(job_name = name, "No launched job to kill");
        }
    }

    fn running_jobs(&self) -> Vec<RunningJob> {
        self.queue
            .iter()
            .filter(|j| !j.is_silent() && j.output_callback().is_some())
            .map(Job::snapshot)
            .collect()
    }

    fn log_queue(&self) {
        if self.queue.is_empty() {
            tracing::debug!(lock_table_size = self.locks.len(), "Job queue idle");
            return;
        }

        tracing::info!(
            queue_size = self.queue.len(),
            lock_table_size = self.locks.len(),
            "Job queue status"
        );
        for job in &self.queue {
            tracing::debug!(job = ?job, "Queued job");
        }
    }

    /// One pass over the queue. Reaped jobs are removed in place, so the
    /// index only advances past jobs that stay.
    ///
    /// Returns whether the pass paused to read job output.
    pub async fn tick(&mut self) -> bool {
        let mut paused = false;
        let mut index = 0;
        while index < self.queue.len() {
            match self.service(index, &mut paused).await {
                Ok(None) => index += 1,
                Ok(Some(outcome)) => self.reap(index, outcome).await,
                Err(e) => {
                    let job = &self.queue[index];
                    tracing::error!(
                        job_id = %job.id(),
                        job_name = job.name(),
                        error = %e,
                        "Error while servicing job"
                    );
                    self.reap(index, Outcome::internal(&e)).await;
                }
            }
        }
        paused
    }

    /// Advance one job. Returns the outcome once it reached a terminal state.
    async fn service(&mut self, index: usize, paused: &mut bool) -> Result<Option<Outcome>> {
        let job = &mut self.queue[index];

        if job.state() == JobState::Queued {
            if !self.locks.try_acquire(job.lock_keys()) {
                tracing::trace!(job_id = %job.id(), "Lock keys held, job stays queued");
                return Ok(None);
            }
            job.set_state(JobState::Running);
            tracing::debug!(
                job_id = %job.id(),
                lock_table_size = self.locks.len(),
                "Lock keys acquired"
            );

            job.fire_before_hooks()?;
            job.launch(&self.config)?;
            tracing::info!(
                job_id = %job.id(),
                job_name = job.name(),
                pid = ?job.pid(),
                "Job launched"
            );
        }

        if let Some(relay) = job.relay_mut() {
            *paused = true;
            let pass = relay.drain_pass().await?;
            if !pass.lines.is_empty() {
                let name = job.name().to_string();
                let callback = job.output_callback().cloned();
                forward(&name, job.id(), callback.as_ref(), &self.console, pass.lines).await?;
            }
            if pass.at_eof {
                // Output is closed; the exit poll below stays authoritative.
                tracing::trace!(job_id = %job.id(), "Output streams at EOF");
            }
        }

        Ok(Outcome::from_poll(job.poll()?))
    }

    /// Finalize a job: after-hooks, completion record, final drain, removal,
    /// lock release, always in that order.
    async fn reap(&mut self, index: usize, outcome: Outcome) {
        let job = &mut self.queue[index];
        job.set_state(outcome.state);

        // A forced reap can reach here with the process still running.
        if let Err(e) = job.terminate().await {
            tracing::warn!(job_id = %job.id(), error = %e, "Failed to collect exit status");
        }

        if outcome.state == JobState::Completed {
            tracing::info!(
                job_id = %job.id(),
                job_name = job.name(),
                return_code = outcome.return_code,
                "Job completed"
            );
        } else {
            tracing::warn!(
                job_id = %job.id(),
                job_name = job.name(),
                state = %outcome.state,
                return_code = outcome.return_code,
                message = %outcome.message,
                "Job did not complete successfully"
            );
        }

        if let Err(e) = job.fire_after_hooks() {
            tracing::error!(job_id = %job.id(), error = %e, "After-hook failed");
        }

        let record = CompletionRecord::new(job.name(), outcome.return_code, outcome.message);
        if let Err(e) = self.completions.record(record).await {
            tracing::error!(job_id = %job.id(), error = %e, "Failed to record completion");
        }

        if let Some(relay) = job.relay_mut() {
            match relay.drain_to_end().await {
                Ok(lines) => {
                    let name = job.name().to_string();
                    let callback = job.output_callback().cloned();
                    if let Err(e) =
                        forward(&name, job.id(), callback.as_ref(), &self.console, lines).await
                    {
                        tracing::error!(job_id = %job.id(), error = %e, "Failed to relay final output");
                    }
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id(), error = %e, "Failed to drain final output");
                }
            }
        }

        let job = self.queue.remove(index);
        self.locks.release(job.lock_keys());
        tracing::debug!(
            job_id = %job.id(),
            queue_size = self.queue.len(),
            lock_table_size = self.locks.len(),
            "Job removed from queue"
        );
    }

    async fn stop_jobs(&mut self) {
        for job in self.queue.iter_mut().filter(|j| j.is_launched()) {
            if let Err(e) = job.kill() {
                tracing::warn!(job_id = %job.id(), error = %e, "Failed to kill job on shutdown");
            }
        }

        let mut index = 0;
        while index < self.queue.len() {
            if !self.queue[index].is_launched() {
                let job = self.queue.remove(index);
                tracing::warn!(
                    job_id = %job.id(),
                    job_name = job.name(),
                    "Discarding queued job on shutdown"
                );
                continue;
            }

            let outcome = match self.queue[index].wait_exit().await {
                Ok(Some(code)) => Outcome::exited(code),
                Ok(None) => Outcome::internal(&JobError::Internal(
                    "launched job has no process".to_string(),
                )),
                Err(e) => Outcome::internal(&e),
            };
            self.reap(index, outcome).await;
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue", &self.queue)
            .field("locks", &self.locks)
            .field("accepting", &self.accepting)
            .finish_non_exhaustive()
    }
}
