//! The operations front ends call: job CRUD with scheduler resync, execution,
//! stop and liveness queries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{CoreError, CoreResult};
use crate::job::{new_job_id, Event, ExecPrefs, ExecutionResult, JobDescriptor, JobTarget};
use crate::launch::{resolve, Host, LaunchPlan, SCRIPT_EXTENSIONS};
use crate::scheduler::Scheduler;
use crate::store::{open_default, FsKv, JobStore, Kv};

/// File chooser supplied by the front end.
pub trait FilePicker {
    /// Let the user pick a file, offering `extensions` as the default filter.
    /// `None` means the dialog was cancelled.
    fn pick(&self, extensions: &[&str]) -> Option<PathBuf>;
}

/// A persisted job and the outcome of installing its timer.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedJob {
    /// The descriptor as stored, with its id filled in.
    pub job: JobDescriptor,
    /// Set when the schedule did not parse; the job then has no timer.
    pub schedule_error: Option<CoreError>,
}

/// Job store, scheduler and engine behind one handle.
pub struct Deck<K: Kv = FsKv> {
    store: JobStore<K>,
    // Serializes job mutations with their timer resync.
    scheduler: Mutex<Scheduler>,
    engine: Engine,
    events: mpsc::UnboundedSender<Event>,
    host: Host,
}

impl Deck<FsKv> {
    /// Deck keeping its records under `data_dir`.
    pub fn open(data_dir: &Path, grace: Duration) -> Result<(Self, mpsc::UnboundedReceiver<Event>)> {
        let kv = open_default(data_dir)?;
        Ok(Self::new(kv, grace))
    }
}

impl<K: Kv> Deck<K> {
    /// Deck over `kv` for the running host. Events arrive on the receiver.
    pub fn new(kv: K, grace: Duration) -> (Self, mpsc::UnboundedReceiver<Event>) {
        Self::with_host(kv, grace, Host::current())
    }

    /// Deck with an explicit host description.
    pub fn with_host(kv: K, grace: Duration, host: Host) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let deck = Self {
            store: JobStore::new(kv),
            scheduler: Mutex::new(Scheduler::new(tx.clone())),
            engine: Engine::new(tx.clone(), grace),
            events: tx,
            host,
        };
        (deck, rx)
    }

    /// Install timers for every persisted job. Safe to call again.
    ///
    /// Jobs whose schedule does not parse are returned with their error.
    pub fn start(&self) -> CoreResult<Vec<(String, CoreError)>> {
        let jobs = self.store.list()?;
        Ok(self.scheduler.lock().rebuild(&jobs))
    }

    /// Ask the front end for a script file.
    pub fn select_script_file(&self, picker: &dyn FilePicker) -> Option<PathBuf> {
        picker.pick(SCRIPT_EXTENSIONS)
    }

    /// All jobs in stored order.
    pub fn list_jobs(&self) -> CoreResult<Vec<JobDescriptor>> {
        self.store.list()
    }

    /// One job by id.
    pub fn get_job(&self, id: &str) -> CoreResult<JobDescriptor> {
        self.store.get(id)?.ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    /// Create or replace a job, then resync its timer.
    ///
    /// An unparsable schedule still saves the job. It gets no timer and the
    /// parse error is reported in [`SavedJob::schedule_error`].
    pub fn save_job(&self, mut job: JobDescriptor) -> CoreResult<SavedJob> {
        validate(&job)?;
        if job.id.trim().is_empty() {
            job.id = new_job_id();
        }

        let mut scheduler = self.scheduler.lock();
        self.store.upsert(&job)?;
        info!(job = %job.id, name = %job.name, "job saved");
        let schedule_error = scheduler.sync(&job).err();
        if let Some(e) = &schedule_error {
            warn!(job = %job.id, error = %e, "saved without a timer");
        }
        Ok(SavedJob { job, schedule_error })
    }

    /// Delete a job and its timer.
    pub fn delete_job(&self, id: &str) -> CoreResult<()> {
        let mut scheduler = self.scheduler.lock();
        let existed = self.store.remove(id)?;
        scheduler.remove(id);
        if !existed {
            return Err(CoreError::NotFound(id.to_string()));
        }
        info!(job = id, "job deleted");
        Ok(())
    }

    /// Launch plan for `job` under the stored preferences.
    pub fn plan(&self, job: &JobDescriptor) -> CoreResult<LaunchPlan> {
        let prefs = self.store.exec_prefs()?;
        resolve(job, &prefs, &self.host)
    }

    /// Run `job` and wait for it. Failures come back as a failed result.
    pub async fn execute(&self, job: &JobDescriptor) -> ExecutionResult {
        match self.plan(job) {
            Ok(plan) => self.engine.execute(&job.id, &plan).await,
            Err(e) => self.report_unrunnable(job, e),
        }
    }

    /// Start `job` without waiting; the handle resolves with its result.
    pub fn launch(&self, job: &JobDescriptor) -> CoreResult<JoinHandle<ExecutionResult>> {
        let plan = self.plan(job).inspect_err(|e| {
            self.report_unrunnable(job, e.clone());
        })?;
        self.engine.start(&job.id, &plan)
    }

    fn report_unrunnable(&self, job: &JobDescriptor, e: CoreError) -> ExecutionResult {
        warn!(job = %job.id, error = %e, "job not run");
        let result = ExecutionResult::failed(e.to_string());
        let _ = self.events.send(Event::RunFinished { job_id: job.id.clone(), result: result.clone() });
        result
    }

    /// Request termination of a running job.
    pub fn stop(&self, job_id: &str) -> CoreResult<()> {
        self.engine.stop(job_id)
    }

    /// Ids of jobs with a live process.
    pub fn list_running(&self) -> Vec<String> {
        self.engine.list_running()
    }

    /// Stored execution preferences.
    pub fn exec_prefs(&self) -> CoreResult<ExecPrefs> {
        self.store.exec_prefs()
    }

    /// Replace the execution preferences; applies to the next run.
    pub fn save_exec_prefs(&self, prefs: &ExecPrefs) -> CoreResult<()> {
        self.store.save_exec_prefs(prefs)
    }

    /// Enabled jobs flagged to run at startup.
    pub fn auto_start_jobs(&self) -> CoreResult<Vec<JobDescriptor>> {
        Ok(self.store.list()?.into_iter().filter(|j| j.enabled && j.auto_start).collect())
    }

    /// Whether `job_id` has an active timer.
    pub fn is_scheduled(&self, job_id: &str) -> bool {
        self.scheduler.lock().is_active(job_id)
    }

    /// Number of active timers.
    pub fn scheduled_count(&self) -> usize {
        self.scheduler.lock().active_count()
    }

    /// Next fire time of `job_id`'s timer.
    pub fn next_fire(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.scheduler.lock().next_fire(job_id)
    }

    /// Drop all timers and ask running jobs to terminate.
    pub fn shutdown(&self) {
        self.scheduler.lock().shutdown();
        self.engine.stop_all();
    }
}

fn validate(job: &JobDescriptor) -> CoreResult<()> {
    match &job.target {
        JobTarget::FileScript { path } if path.as_os_str().is_empty() => {
            Err(CoreError::InvalidJobConfiguration("script path is empty".to_string()))
        }
        JobTarget::InlineCommand { command } if command.trim().is_empty() => {
            Err(CoreError::InvalidJobConfiguration("command is empty".to_string()))
        }
        _ => Ok(()),
    }
}
