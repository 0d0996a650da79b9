use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::job::{Event, JobDescriptor};

/// Parse a cron expression.
///
/// Classic five-field expressions (minute first) get a `0` seconds field
/// prepended. Five and six field forms use crontab day-of-week numbers,
/// where 0 and 7 are Sunday and 1 is Monday. Seven field forms (with a year)
/// are handed to the parser unchanged.
pub fn parse_schedule(expr: &str) -> CoreResult<Schedule> {
    let mut fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    if fields.len() == 5 {
        fields.insert(0, "0".to_string());
    }
    if fields.len() == 6 {
        fields[5] = crontab_day_of_week(&fields[5]);
    }
    Schedule::from_str(&fields.join(" ")).map_err(|e| CoreError::InvalidSchedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Rewrite a crontab day-of-week field (0-7, Sunday = 0 or 7) into the
/// parser's numbering (1-7, Sunday = 1).
///
/// Numeric items are expanded to explicit day lists. Names and anything
/// malformed pass through untouched so the parser reports them.
fn crontab_day_of_week(field: &str) -> String {
    if field == "*" || field == "?" {
        return field.to_string();
    }
    field.split(',').map(translate_day_item).collect::<Vec<_>>().join(",")
}

fn translate_day_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    let step = match step.map(str::parse::<u32>) {
        None => 1,
        Some(Ok(n)) if n > 0 => n,
        Some(_) => return item.to_string(),
    };
    let bounds = if range == "*" {
        Some((0, 6))
    } else if let Some((lo, hi)) = range.split_once('-') {
        lo.parse::<u32>().ok().zip(hi.parse::<u32>().ok())
    } else {
        // `n/step` runs from n to the end of the week.
        range.parse::<u32>().ok().map(|n| if item.contains('/') { (n, n.max(6)) } else { (n, n) })
    };
    let Some((lo, hi)) = bounds.filter(|&(lo, hi)| lo <= hi && hi <= 7) else {
        return item.to_string();
    };
    let days: BTreeSet<u32> = (lo..=hi).step_by(step as usize).map(|d| d % 7 + 1).collect();
    days.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

/// One recurring trigger. Dropping it stops the timer task.
struct Timer {
    job: JobDescriptor,
    expr: String,
    schedule: Schedule,
    _stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Cron timers keyed by job id; at most one per job.
pub struct Scheduler {
    timers: HashMap<String, Timer>,
    events: mpsc::UnboundedSender<Event>,
}

impl Scheduler {
    /// Scheduler sending `ScheduledRunRequested` events to `events`.
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self { timers: HashMap::new(), events }
    }

    /// Bring the timer for `job` in line with its descriptor.
    ///
    /// Any existing timer is discarded first. Returns whether a timer is now
    /// active. A malformed expression leaves the job without a timer.
    pub fn sync(&mut self, job: &JobDescriptor) -> CoreResult<bool> {
        self.remove(&job.id);
        let Some(expr) = job.active_schedule() else {
            return Ok(false);
        };
        let schedule = parse_schedule(expr)?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_timer(job.clone(), schedule.clone(), stop_rx, self.events.clone()));
        info!(job = %job.id, name = %job.name, expr, "timer installed");
        self.timers.insert(
            job.id.clone(),
            Timer { job: job.clone(), expr: expr.to_string(), schedule, _stop: stop_tx, task },
        );
        Ok(true)
    }

    /// Stop and discard the timer for `job_id`; returns whether one existed.
    pub fn remove(&mut self, job_id: &str) -> bool {
        match self.timers.remove(job_id) {
            Some(timer) => {
                debug!(job = job_id, expr = %timer.expr, "timer discarded");
                true
            }
            None => false,
        }
    }

    /// Rebuild from the full job set.
    ///
    /// Timers of jobs no longer present are dropped and timers whose job is
    /// unchanged are kept, so running this twice changes nothing. Jobs with
    /// bad schedules are returned alongside their error.
    pub fn rebuild(&mut self, jobs: &[JobDescriptor]) -> Vec<(String, CoreError)> {
        self.timers.retain(|id, _| jobs.iter().any(|j| &j.id == id));
        let mut failures = Vec::new();
        for job in jobs {
            if self.timers.get(&job.id).is_some_and(|t| t.job == *job && !t.task.is_finished()) {
                continue;
            }
            if let Err(e) = self.sync(job) {
                warn!(job = %job.id, error = %e, "schedule skipped");
                failures.push((job.id.clone(), e));
            }
        }
        info!(active = self.timers.len(), "scheduler rebuilt");
        failures
    }

    /// Whether `job_id` has a timer.
    pub fn is_active(&self, job_id: &str) -> bool {
        self.timers.contains_key(job_id)
    }

    /// Number of installed timers.
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }

    /// Expression the timer of `job_id` was installed with.
    pub fn expression(&self, job_id: &str) -> Option<&str> {
        self.timers.get(job_id).map(|t| t.expr.as_str())
    }

    /// Next time the timer of `job_id` fires.
    pub fn next_fire(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.timers.get(job_id).and_then(|t| t.schedule.upcoming(Utc).next())
    }

    /// Ids with an installed timer, sorted.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.timers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Discard every timer.
    pub fn shutdown(&mut self) {
        let n = self.timers.len();
        self.timers.clear();
        info!(discarded = n, "scheduler stopped");
    }
}

async fn run_timer(
    job: JobDescriptor,
    schedule: Schedule,
    mut stop: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut last: Option<DateTime<Utc>> = None;
    loop {
        let now = Utc::now();
        let from = last.map_or(now, |l| l.max(now));
        let Some(next) = schedule.after(&from).next() else {
            info!(job = %job.id, "schedule has no upcoming times");
            break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = &mut stop => break,
            _ = tokio::time::sleep(wait) => {
                last = Some(next);
                info!(job = %job.id, name = %job.name, "scheduled run requested");
                if events.send(Event::ScheduledRunRequested { job: job.clone() }).is_err() {
                    break;
                }
            }
        }
    }
}
