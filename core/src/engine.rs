//! Process registry and execution engine.
//!
//! Every run gets a supervisor task that owns the OS child. The registry only
//! keeps a control channel to that task, so stopping a job never needs access
//! to the child itself.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::job::{Event, ExecutionResult, OutputChunk, Stream};
use crate::launch::LaunchPlan;

/// Time between the graceful and the forced termination signal.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

const CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Terminate,
    Kill,
}

struct RunEntry {
    run_id: u64,
    pid: Option<u32>,
    ctl: mpsc::UnboundedSender<StopSignal>,
    exited: bool,
}

struct Inner {
    registry: Mutex<HashMap<String, RunEntry>>,
    events: mpsc::UnboundedSender<Event>,
    grace: Duration,
    next_run: AtomicU64,
}

/// Spawns jobs, tracks them by job id and stops them on request.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Engine pushing output and completion events to `events`.
    pub fn new(events: mpsc::UnboundedSender<Event>, grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(HashMap::new()),
                events,
                grace,
                next_run: AtomicU64::new(1),
            }),
        }
    }

    /// Run `plan` to completion under `job_id`.
    ///
    /// Never fails: spawn errors and rejected overlapping runs come back as a
    /// failed [`ExecutionResult`].
    pub async fn execute(&self, job_id: &str, plan: &LaunchPlan) -> ExecutionResult {
        match self.start(job_id, plan) {
            Ok(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => ExecutionResult::failed(format!("run supervisor failed: {e}")),
            },
            Err(e) => ExecutionResult::failed(e.to_string()),
        }
    }

    /// Spawn `plan` and return the supervisor's handle.
    ///
    /// The job is registered before this returns and before any output is
    /// forwarded. A job that is still running is rejected with
    /// [`CoreError::AlreadyRunning`] and an [`Event::RunRejected`].
    pub fn start(&self, job_id: &str, plan: &LaunchPlan) -> CoreResult<JoinHandle<ExecutionResult>> {
        let (ctl, ctl_rx) = mpsc::unbounded_channel();
        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        {
            let mut reg = self.inner.registry.lock();
            if reg.get(job_id).is_some_and(|e| !e.exited) {
                let e = CoreError::AlreadyRunning(job_id.to_string());
                debug!(job = job_id, "run rejected; previous run still live");
                let _ = self.inner.events.send(Event::RunRejected { job_id: job_id.to_string(), error: e.to_string() });
                return Err(e);
            }
            reg.insert(job_id.to_string(), RunEntry { run_id, pid: None, ctl, exited: false });
        }

        let mut child = match spawn_with_fallback(plan) {
            Ok(child) => child,
            Err(e) => {
                self.inner.remove(job_id, run_id);
                warn!(job = job_id, error = %e, "spawn failed");
                let _ = self.inner.events.send(Event::RunFinished {
                    job_id: job_id.to_string(),
                    result: ExecutionResult::failed(e.to_string()),
                });
                return Err(e);
            }
        };

        let pid = child.id();
        if let Some(entry) = self.inner.registry.lock().get_mut(job_id) {
            if entry.run_id == run_id {
                entry.pid = pid;
            }
        }
        info!(job = job_id, pid = ?pid, program = %plan.program, "process spawned");

        let out = tokio::spawn(pump(child.stdout.take(), job_id.to_string(), Stream::Stdout, self.inner.events.clone()));
        let err = tokio::spawn(pump(child.stderr.take(), job_id.to_string(), Stream::Stderr, self.inner.events.clone()));

        let inner = self.inner.clone();
        let job_id = job_id.to_string();
        Ok(tokio::spawn(async move {
            let status = supervise(&mut child, ctl_rx).await;
            inner.mark_exited(&job_id, run_id);

            let output = out.await.unwrap_or_default();
            let error = err.await.unwrap_or_default();
            inner.remove(&job_id, run_id);

            let result = match status {
                Ok(status) => ExecutionResult {
                    success: status.success(),
                    output: String::from_utf8_lossy(&output).into_owned(),
                    error: String::from_utf8_lossy(&error).into_owned(),
                    exit_code: status.code(),
                },
                Err(e) => ExecutionResult {
                    success: false,
                    output: String::from_utf8_lossy(&output).into_owned(),
                    error: format!("waiting for process failed: {e}"),
                    exit_code: None,
                },
            };
            info!(job = %job_id, success = result.success, code = ?result.exit_code, "process exited");
            let _ = inner.events.send(Event::RunFinished { job_id, result: result.clone() });
            result
        }))
    }

    /// Ask a running job to terminate.
    ///
    /// Returns right after the graceful signal is sent; if the run is still
    /// alive once the grace window passes it is killed.
    pub fn stop(&self, job_id: &str) -> CoreResult<()> {
        let (run_id, ctl) = {
            let reg = self.inner.registry.lock();
            match reg.get(job_id) {
                Some(e) if !e.exited => (e.run_id, e.ctl.clone()),
                _ => return Err(CoreError::NotRunning(job_id.to_string())),
            }
        };
        if ctl.send(StopSignal::Terminate).is_err() {
            return Err(CoreError::NotRunning(job_id.to_string()));
        }
        info!(job = job_id, "termination requested");

        let inner = self.inner.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(inner.grace).await;
            let reg = inner.registry.lock();
            if let Some(e) = reg.get(&job_id) {
                if e.run_id == run_id && !e.exited {
                    warn!(job = %job_id, pid = ?e.pid, "grace window elapsed; killing");
                    let _ = e.ctl.send(StopSignal::Kill);
                }
            }
        });
        Ok(())
    }

    /// Ids of jobs whose process has not exited, sorted.
    pub fn list_running(&self) -> Vec<String> {
        let reg = self.inner.registry.lock();
        let mut ids: Vec<String> = reg.iter().filter(|(_, e)| !e.exited).map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids
    }

    /// Whether `job_id` has a live process.
    pub fn is_running(&self, job_id: &str) -> bool {
        self.inner.registry.lock().get(job_id).is_some_and(|e| !e.exited)
    }

    /// Request termination of every live run.
    pub fn stop_all(&self) {
        for id in self.list_running() {
            let _ = self.stop(&id);
        }
    }
}

impl Inner {
    fn mark_exited(&self, job_id: &str, run_id: u64) {
        if let Some(e) = self.registry.lock().get_mut(job_id) {
            if e.run_id == run_id {
                e.exited = true;
            }
        }
    }

    fn remove(&self, job_id: &str, run_id: u64) {
        let mut reg = self.registry.lock();
        if reg.get(job_id).is_some_and(|e| e.run_id == run_id) {
            reg.remove(job_id);
        }
    }
}

fn spawn(plan: &LaunchPlan) -> CoreResult<Child> {
    let (program, args) = plan.invocation();
    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .envs(plan.env.iter().cloned())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Own process group so termination reaches the whole tree.
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.spawn().map_err(|e| CoreError::SpawnFailure(format!("{program}: {e}")))
}

fn spawn_with_fallback(plan: &LaunchPlan) -> CoreResult<Child> {
    match spawn(plan) {
        Ok(child) => Ok(child),
        Err(e) => match plan.fallback() {
            Some(fb) => {
                warn!(error = %e, "preferred shell failed to start; using generic shell");
                spawn(&fb)
            }
            None => Err(e),
        },
    }
}

async fn supervise(
    child: &mut Child,
    mut ctl: mpsc::UnboundedReceiver<StopSignal>,
) -> std::io::Result<std::process::ExitStatus> {
    loop {
        let sig = tokio::select! {
            status = child.wait() => return status,
            Some(sig) = ctl.recv() => sig,
        };
        deliver(child, sig);
    }
}

#[cfg(unix)]
fn deliver(child: &mut Child, sig: StopSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else { return };
    let signal = match sig {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        warn!(pid, error = %e, "signal delivery failed");
        if sig == StopSignal::Kill {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn deliver(child: &mut Child, _sig: StopSignal) {
    let _ = child.start_kill();
}

async fn pump<R: AsyncRead + Unpin>(
    reader: Option<R>,
    job_id: String,
    stream: Stream,
    events: mpsc::UnboundedSender<Event>,
) -> Vec<u8> {
    let mut acc = Vec::new();
    let Some(mut reader) = reader else { return acc };
    let mut buf = vec![0u8; CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                acc.extend_from_slice(&buf[..n]);
                debug!(job = %job_id, ?stream, bytes = n, "output chunk");
                let _ = events.send(Event::ScriptOutput(OutputChunk {
                    job_id: job_id.clone(),
                    stream,
                    chunk: String::from_utf8_lossy(&buf[..n]).into_owned(),
                }));
            }
            Err(e) => {
                warn!(job = %job_id, ?stream, error = %e, "read failed");
                break;
            }
        }
    }
    acc
}
