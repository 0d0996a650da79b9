use std::io::Write;

use deck_core::{CoreError, Deck, Event, JobDescriptor};
use deck_core::job::{OutputChunk, Stream};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::module::{Module, ModuleCtx};

/// Consumes core events: echoes output and turns timer fires into runs.
pub struct Dispatcher {
    events: UnboundedReceiver<Event>,
    echo: bool,
}

impl Dispatcher {
    pub fn new(events: UnboundedReceiver<Event>, echo: bool) -> Self {
        Self { events, echo }
    }
}

impl Module for Dispatcher {
    fn name(&self) -> &'static str { "dispatcher" }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        let Dispatcher { mut events, echo } = *self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = events.recv() => match ev {
                        Some(ev) => handle(&ctx.deck, ev, echo),
                        None => break,
                    },
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() || *ctx.shutdown.borrow() {
                            info!("dispatcher stopping");
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

fn handle(deck: &Deck, ev: Event, echo: bool) {
    match ev {
        Event::ScriptOutput(chunk) => {
            if echo {
                write_chunk(&chunk);
            }
        }
        Event::ScheduledRunRequested { job } => {
            let Some(job) = current(deck, &job.id) else {
                return;
            };
            match deck.launch(&job) {
                Ok(_) => info!(job = %job.id, name = %job.name, "scheduled run started"),
                Err(CoreError::AlreadyRunning(_)) => {
                    warn!(job = %job.id, "previous run still active; skipping this tick")
                }
                Err(e) => warn!(job = %job.id, error = %e, "scheduled run failed to start"),
            }
        }
        Event::RunRejected { job_id, error } => debug!(job = %job_id, %error, "run rejected"),
        Event::RunFinished { job_id, result } => {
            if result.success {
                info!(job = %job_id, "run succeeded");
            } else {
                warn!(job = %job_id, code = ?result.exit_code, "run failed");
            }
        }
    }
}

/// Stored descriptor for a timer tick, if the job still exists and is enabled.
///
/// Ticks can sit in the queue while the job is edited or deleted, so the
/// descriptor carried by the event is not trusted.
fn current(deck: &Deck, id: &str) -> Option<JobDescriptor> {
    match deck.get_job(id) {
        Ok(job) if job.enabled => Some(job),
        Ok(_) => {
            debug!(job = id, "tick for disabled job dropped");
            None
        }
        Err(CoreError::NotFound(_)) => {
            debug!(job = id, "tick for deleted job dropped");
            None
        }
        Err(e) => {
            warn!(job = id, error = %e, "could not reload job for tick");
            None
        }
    }
}

/// Copy a raw chunk to the matching local stream.
pub fn write_chunk(chunk: &OutputChunk) {
    let res = match chunk.stream {
        Stream::Stdout => {
            let mut out = std::io::stdout().lock();
            out.write_all(chunk.chunk.as_bytes()).and_then(|_| out.flush())
        }
        Stream::Stderr => {
            let mut err = std::io::stderr().lock();
            err.write_all(chunk.chunk.as_bytes()).and_then(|_| err.flush())
        }
    };
    if let Err(e) = res {
        warn!(error = %e, "echo failed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use deck_core::job::PreferredShell;
    use deck_core::{ExecPrefs, JobTarget};

    use super::*;

    fn sh_deck(dir: &std::path::Path) -> Deck {
        let (deck, _rx) = Deck::open(dir, Duration::from_millis(200)).unwrap();
        deck.save_exec_prefs(&ExecPrefs {
            preferred_shell: PreferredShell::Sh,
            custom_shell_path: None,
            load_shell_config: false,
        })
        .unwrap();
        deck
    }

    fn nap(id: &str) -> JobDescriptor {
        JobDescriptor {
            id: id.to_string(),
            ..JobDescriptor::new("nap", JobTarget::InlineCommand { command: "sleep 5".into() })
        }
    }

    #[tokio::test]
    async fn stale_ticks_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let deck = sh_deck(dir.path());

        handle(&deck, Event::ScheduledRunRequested { job: nap("gone") }, false);
        assert!(deck.list_running().is_empty());

        deck.save_job(JobDescriptor { enabled: false, ..nap("off") }).unwrap();
        handle(&deck, Event::ScheduledRunRequested { job: nap("off") }, false);
        assert!(deck.list_running().is_empty());
    }

    #[tokio::test]
    async fn tick_runs_the_stored_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let deck = sh_deck(dir.path());
        deck.save_job(nap("live")).unwrap();

        let stale = JobDescriptor { target: JobTarget::InlineCommand { command: String::new() }, ..nap("live") };
        handle(&deck, Event::ScheduledRunRequested { job: stale }, false);
        assert_eq!(deck.list_running(), vec!["live".to_string()]);

        deck.stop("live").unwrap();
    }
}
