use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A user-defined unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// Opaque id, assigned on first save.
    #[serde(default)]
    pub id: String,
    /// Display label.
    pub name: String,
    /// What to run.
    #[serde(flatten)]
    pub target: JobTarget,
    /// Cron expression; `None` means manual trigger only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// When false no timer exists even if `schedule` is set.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Advisory: front ends run these once at startup.
    #[serde(default)]
    pub auto_start: bool,
}

fn default_true() -> bool { true }

/// The runnable part of a job, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobTarget {
    /// A script file run through the interpreter picked by its extension.
    #[serde(rename_all = "camelCase")]
    FileScript {
        /// Script location.
        path: PathBuf,
    },
    /// A raw command line.
    #[serde(rename_all = "camelCase")]
    InlineCommand {
        /// Command text, split on whitespace at launch.
        command: String,
    },
}

impl JobDescriptor {
    /// New enabled, unscheduled job with a fresh id.
    pub fn new(name: impl Into<String>, target: JobTarget) -> Self {
        Self {
            id: new_job_id(),
            name: name.into(),
            target,
            schedule: None,
            enabled: true,
            auto_start: false,
        }
    }

    /// Builder-style schedule setter.
    pub fn with_schedule(mut self, expr: impl Into<String>) -> Self {
        self.schedule = Some(expr.into());
        self
    }

    /// Schedule if it should drive a timer right now.
    pub fn active_schedule(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.schedule.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// Generate an id for a new job.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Shell picked for running jobs on non-Windows hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredShell {
    /// zsh.
    #[default]
    Auto,
    /// zsh, explicitly.
    Zsh,
    /// GNU bash.
    Bash,
    /// POSIX sh.
    Sh,
    /// `customShellPath`.
    Custom,
}

/// Persisted execution preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecPrefs {
    /// Shell used to wrap commands.
    #[serde(default)]
    pub preferred_shell: PreferredShell,
    /// Only read when `preferred_shell` is `custom`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_shell_path: Option<String>,
    /// Source the shell's startup file before running the job.
    #[serde(default = "default_true")]
    pub load_shell_config: bool,
}

impl Default for ExecPrefs {
    fn default() -> Self {
        Self { preferred_shell: PreferredShell::Auto, custom_shell_path: None, load_shell_config: true }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// True only for exit code 0.
    pub success: bool,
    /// Accumulated stdout.
    #[serde(default)]
    pub output: String,
    /// Accumulated stderr, or the failure message when nothing ran.
    #[serde(default)]
    pub error: String,
    /// `None` when the process never started or died from a signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ExecutionResult {
    /// Failed result for a run that never produced a process.
    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, output: String::new(), error: message.into(), exit_code: None }
    }
}

/// Which pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Raw output chunk; not aligned to lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChunk {
    /// Job that produced it.
    pub job_id: String,
    /// Source pipe.
    pub stream: Stream,
    /// Text, lossily decoded.
    pub chunk: String,
}

/// Everything the core pushes to its consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    /// Live output of a running job.
    ScriptOutput(OutputChunk),
    /// A cron timer fired; the consumer decides whether to execute.
    ScheduledRunRequested {
        /// Descriptor as it was when the timer was installed.
        job: JobDescriptor,
    },
    /// A run ended (including spawn failures and jobs that could not be
    /// resolved to a launch plan).
    #[serde(rename_all = "camelCase")]
    RunFinished {
        /// Job that ran.
        job_id: String,
        /// Its outcome.
        result: ExecutionResult,
    },
    /// A run was refused because the job still has a live process. That
    /// process is untouched and reports its own `RunFinished` later.
    #[serde(rename_all = "camelCase")]
    RunRejected {
        /// Job that was asked to run.
        job_id: String,
        /// Why it did not start.
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_serializes_flat_kind() {
        let job = JobDescriptor {
            id: "j1".into(),
            name: "build".into(),
            target: JobTarget::FileScript { path: "build.sh".into() },
            schedule: Some("*/5 * * * *".into()),
            enabled: true,
            auto_start: false,
        };
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["kind"], "fileScript");
        assert_eq!(v["path"], "build.sh");
        assert_eq!(v["autoStart"], false);

        let back: JobDescriptor = serde_json::from_value(v).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn missing_flags_take_defaults() {
        let job: JobDescriptor =
            serde_json::from_str(r#"{"name":"x","kind":"inlineCommand","command":"echo hi"}"#).unwrap();
        assert!(job.id.is_empty());
        assert!(job.enabled);
        assert!(!job.auto_start);
        assert_eq!(job.schedule, None);
    }

    #[test]
    fn active_schedule_needs_enabled_and_text() {
        let mut job = JobDescriptor::new("x", JobTarget::InlineCommand { command: "true".into() })
            .with_schedule("0 * * * *");
        assert_eq!(job.active_schedule(), Some("0 * * * *"));
        job.enabled = false;
        assert_eq!(job.active_schedule(), None);
        job.enabled = true;
        job.schedule = Some("   ".into());
        assert_eq!(job.active_schedule(), None);
    }

    #[test]
    fn prefs_parse_lowercase_shell() {
        let p: ExecPrefs = serde_json::from_str(r#"{"preferredShell":"custom","customShellPath":"/usr/bin/fish"}"#).unwrap();
        assert_eq!(p.preferred_shell, PreferredShell::Custom);
        assert!(p.load_shell_config);
    }
}
