use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{JobError, Result};
use crate::scheduler::exec::{build_command, JobCommand};
use crate::scheduler::probe::{exit_code, poll_child, ProcessPoll};
use crate::scheduler::relay::OutputRelay;
use crate::store::ConsoleLine;

/// Callback run once, immediately before launch or immediately after exit.
pub type Hook = Box<dyn FnOnce() + Send + 'static>;

/// Callback run for every relayed output line.
pub type OutputCallback = Arc<dyn Fn(&ConsoleLine) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Zombie,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Zombie
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Zombie => write!(f, "zombie"),
        }
    }
}

/// Everything needed to enqueue one job.
///
/// Built fresh per submission; none of its collections are shared between
/// requests.
pub struct JobRequest {
    name: String,
    command: JobCommand,
    lock_keys: Vec<String>,
    output_callback: Option<OutputCallback>,
    before_hooks: Vec<Hook>,
    after_hooks: Vec<Hook>,
    silent: bool,
    working_directory: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl JobRequest {
    pub fn new(name: impl Into<String>, command: JobCommand) -> Self {
        Self {
            name: name.into(),
            command,
            lock_keys: Vec::new(),
            output_callback: None,
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            silent: false,
            working_directory: None,
            env: Vec::new(),
        }
    }

    pub fn shell(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, JobCommand::shell(command))
    }

    pub fn exec<I, S>(name: impl Into<String>, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, JobCommand::exec(argv))
    }

    pub fn lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_keys.push(key.into());
        self
    }

    pub fn lock_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn on_output<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ConsoleLine) + Send + Sync + 'static,
    {
        self.output_callback = Some(Arc::new(callback));
        self
    }

    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.before_hooks.push(Box::new(hook));
        self
    }

    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.after_hooks.push(Box::new(hook));
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl std::fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRequest")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("lock_keys", &self.lock_keys)
            .field("silent", &self.silent)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a queued job for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningJob {
    pub id: JobId,
    pub name: String,
    pub command: String,
    pub state: JobState,
}

/// One supervised command execution, owned by the scheduler loop.
pub struct Job {
    id: JobId,
    name: String,
    command: JobCommand,
    lock_keys: Vec<String>,
    output_callback: Option<OutputCallback>,
    before_hooks: Vec<Hook>,
    after_hooks: Vec<Hook>,
    silent: bool,
    working_directory: Option<PathBuf>,
    env: Vec<(String, String)>,
    state: JobState,
    process: Option<Child>,
    relay: Option<OutputRelay>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        let mut lock_keys: Vec<String> = Vec::with_capacity(request.lock_keys.len());
        for key in request.lock_keys {
            if !lock_keys.contains(&key) {
                lock_keys.push(key);
            }
        }

        Self {
            id: JobId::new(),
            name: request.name,
            command: request.command,
            lock_keys,
            output_callback: request.output_callback,
            before_hooks: request.before_hooks,
            after_hooks: request.after_hooks,
            silent: request.silent,
            working_directory: request.working_directory,
            env: request.env,
            state: JobState::Queued,
            process: None,
            relay: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &JobCommand {
        &self.command
    }

    pub fn lock_keys(&self) -> &[String] {
        &self.lock_keys
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    pub fn output_callback(&self) -> Option<&OutputCallback> {
        self.output_callback.as_ref()
    }

    pub fn is_launched(&self) -> bool {
        self.process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(Child::id)
    }

    pub fn snapshot(&self) -> RunningJob {
        RunningJob {
            id: self.id,
            name: self.name.clone(),
            command: self.command.to_string(),
            state: self.state,
        }
    }

    pub(crate) fn set_state(&mut self, state: JobState) {
        self.state = state;
    }

    pub(crate) fn relay_mut(&mut self) -> Option<&mut OutputRelay> {
        self.relay.as_mut()
    }

    /// Run every before-hook. Each runs at most once; a panic in one does not
    /// stop the rest, and the first panic is reported.
    pub(crate) fn fire_before_hooks(&mut self) -> Result<()> {
        run_hooks(std::mem::take(&mut self.before_hooks))
    }

    pub(crate) fn fire_after_hooks(&mut self) -> Result<()> {
        run_hooks(std::mem::take(&mut self.after_hooks))
    }

    /// Spawn the process in its own process group so a kill reaches its
    /// descendants and their copies of the output pipes.
    pub(crate) fn launch(&mut self, config: &SchedulerConfig) -> Result<()> {
        if self.process.is_some() {
            return Err(JobError::Internal(format!(
                "job {} launched twice",
                self.id
            )));
        }

        let env: Vec<(String, String)> = config
            .env
            .iter()
            .chain(self.env.iter())
            .cloned()
            .collect();
        let mut cmd = build_command(&self.command, self.working_directory.as_deref(), &env)?;
        cmd.process_group(0).kill_on_drop(true);
        if self.silent {
            cmd.stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null());
        }

        let mut child = cmd.spawn().map_err(JobError::Spawn)?;

        if !self.silent {
            self.relay = Some(OutputRelay::new(
                child.stdout.take(),
                child.stderr.take(),
                config.chunk_size,
                config.read_pause(),
            ));
        }
        self.process = Some(child);
        Ok(())
    }

    pub(crate) fn poll(&mut self) -> Result<ProcessPoll> {
        match self.process.as_mut() {
            Some(child) => Ok(poll_child(child)?),
            None => Err(JobError::Internal(format!(
                "job {} polled before launch",
                self.id
            ))),
        }
    }

    /// Send SIGKILL to the job's process group.
    ///
    /// Returns false if the job has no process yet.
    pub(crate) fn kill(&mut self) -> Result<bool> {
        let Some(child) = self.process.as_mut() else {
            return Ok(false);
        };
        let Some(pid) = child.id() else {
            // Already reaped.
            return Ok(true);
        };

        if killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).is_err() {
            child.start_kill()?;
        }
        Ok(true)
    }

    /// Kill the process if it is still running and wait for its exit status.
    pub(crate) async fn terminate(&mut self) -> Result<Option<i32>> {
        let Some(child) = self.process.as_mut() else {
            return Ok(None);
        };
        if let Some(status) = child.try_wait()? {
            return Ok(Some(exit_code(status)));
        }
        self.kill()?;
        self.wait_exit().await
    }

    pub(crate) async fn wait_exit(&mut self) -> Result<Option<i32>> {
        match self.process.as_mut() {
            Some(child) => Ok(Some(exit_code(child.wait().await?))),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("command", &self.command)
            .field("lock_keys", &self.lock_keys)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .field("silent", &self.silent)
            .finish_non_exhaustive()
    }
}

fn run_hooks(hooks: Vec<Hook>) -> Result<()> {
    let mut first_err = None;
    for hook in hooks {
        if let Err(e) = guarded(hook) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Run caller-supplied code, turning a panic into an error.
pub(crate) fn guarded(f: impl FnOnce()) -> Result<()> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| JobError::Panicked(panic_message(&*payload)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn new_job_is_queued() {
        let job = Job::new(JobRequest::shell("Kit", "make kit").lock_key("kit"));
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.name(), "Kit");
        assert_eq!(job.lock_keys(), ["kit".to_string()]);
        assert!(!job.is_launched());
        assert!(job.pid().is_none());
        assert!(job.output_callback().is_none());
    }

    #[test]
    fn job_ids_are_unique() {
        let a = Job::new(JobRequest::shell("same", "true"));
        let b = Job::new(JobRequest::shell("same", "true"));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn lock_keys_deduplicated_in_order() {
        let job = Job::new(
            JobRequest::shell("Add node", "true")
                .lock_keys(["10.0.0.2", "10.0.0.1"])
                .lock_key("10.0.0.2"),
        );
        assert_eq!(
            job.lock_keys(),
            ["10.0.0.2".to_string(), "10.0.0.1".to_string()]
        );
    }

    #[test]
    fn snapshot_renders_command() {
        let job = Job::new(JobRequest::exec("Join", ["kubeadm", "join", "10.0.0.1:6443"]));
        let snap = job.snapshot();
        assert_eq!(snap.name, "Join");
        assert_eq!(snap.command, "kubeadm join 10.0.0.1:6443");
        assert_eq!(snap.state, JobState::Queued);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Zombie.is_terminal());
    }

    #[test]
    fn hooks_fire_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        let mut job = Job::new(
            JobRequest::shell("hooks", "true")
                .before(move || {
                    c1.fetch_add(1, Ordering::SeqCst);
                })
                .before(move || {
                    c2.fetch_add(10, Ordering::SeqCst);
                }),
        );

        job.fire_before_hooks().unwrap();
        job.fire_before_hooks().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn panicking_hook_reported_and_rest_still_run() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let mut job = Job::new(
            JobRequest::shell("hooks", "true")
                .after(|| panic!("hook exploded"))
                .after(move || {
                    ran_clone.fetch_add(1, Ordering::SeqCst);
                }),
        );

        let err = job.fire_after_hooks().unwrap_err();
        assert!(matches!(err, JobError::Panicked(ref msg) if msg == "hook exploded"));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn launch_missing_binary_fails() {
        let mut job = Job::new(JobRequest::exec("missing", ["/nonexistent/binary-12345"]));
        let err = job.launch(&SchedulerConfig::default()).unwrap_err();
        assert!(matches!(err, JobError::Spawn(_)));
        assert!(!job.is_launched());
    }

    #[tokio::test]
    async fn kill_before_launch_is_noop() {
        let mut job = Job::new(JobRequest::shell("idle", "sleep 5"));
        assert!(!job.kill().unwrap());
    }

    #[tokio::test]
    async fn terminate_running_process() {
        let mut job = Job::new(JobRequest::shell("sleeper", "sleep 30").silent(true));
        job.launch(&SchedulerConfig::default()).unwrap();
        assert!(job.pid().is_some());

        let code = job.terminate().await.unwrap();
        assert_eq!(code, Some(-9));
    }
}
