//! Launch resolution: turns a [`JobDescriptor`] into the concrete program,
//! arguments, shell wrapping and environment used to start it.

use std::path::{Path, PathBuf};

use directories::BaseDirs;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::job::{ExecPrefs, JobDescriptor, JobTarget, PreferredShell};

/// Extensions offered by script pickers.
pub const SCRIPT_EXTENSIONS: &[&str] = &["bat", "cmd", "sh", "py", "js", "ps1"];

/// Host flavour; decides interpreters, PATH layout and shell wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Windows: `cmd /C`, `;`-separated PATH.
    Windows,
    /// macOS: like Unix plus Homebrew's bin dir.
    MacOs,
    /// Linux and other Unix-likes.
    Unix,
}

impl Platform {
    /// Platform this binary was built for.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Unix
        }
    }

    fn path_separator(self) -> &'static str {
        match self {
            Platform::Windows => ";",
            _ => ":",
        }
    }

    fn standard_bin_dirs(self) -> &'static [&'static str] {
        match self {
            Platform::Windows => &[r"C:\Windows\System32", r"C:\Windows"],
            Platform::MacOs => &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin", "/usr/sbin", "/sbin"],
            Platform::Unix => &["/usr/local/bin", "/usr/bin", "/bin", "/usr/sbin", "/sbin"],
        }
    }
}

/// Facts about the host the resolver reads; injectable for tests.
#[derive(Debug, Clone)]
pub struct Host {
    /// Target platform.
    pub platform: Platform,
    /// User home, for shell startup files.
    pub home: Option<PathBuf>,
    /// Inherited `PATH`.
    pub path: Option<String>,
}

impl Host {
    /// The running host.
    pub fn current() -> Self {
        Self {
            platform: Platform::current(),
            home: BaseDirs::new().map(|d| d.home_dir().to_path_buf()),
            path: std::env::var("PATH").ok(),
        }
    }
}

/// Shell used to wrap commands on non-Windows hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellProfile {
    /// `/bin/zsh`, sources `~/.zshrc`.
    Zsh,
    /// `/bin/bash`, sources `~/.bashrc`.
    Bash,
    /// `/bin/sh`, sources `~/.profile`.
    Sh,
    /// User-supplied shell binary.
    Custom(PathBuf),
}

impl ShellProfile {
    /// Profile chosen by the user's preferences.
    pub fn from_prefs(prefs: &ExecPrefs) -> Self {
        match prefs.preferred_shell {
            PreferredShell::Auto | PreferredShell::Zsh => ShellProfile::Zsh,
            PreferredShell::Bash => ShellProfile::Bash,
            PreferredShell::Sh => ShellProfile::Sh,
            PreferredShell::Custom => match prefs.custom_shell_path.as_deref().map(str::trim) {
                Some(p) if !p.is_empty() => ShellProfile::Custom(PathBuf::from(p)),
                _ => {
                    warn!("custom shell selected without a path; using zsh");
                    ShellProfile::Zsh
                }
            },
        }
    }

    /// Shell binary.
    pub fn program(&self) -> PathBuf {
        match self {
            ShellProfile::Zsh => PathBuf::from("/bin/zsh"),
            ShellProfile::Bash => PathBuf::from("/bin/bash"),
            ShellProfile::Sh => PathBuf::from("/bin/sh"),
            ShellProfile::Custom(p) => p.clone(),
        }
    }

    /// Interactive startup file under `home`.
    pub fn startup_file(&self, home: &Path) -> PathBuf {
        let name = match self {
            ShellProfile::Zsh => ".zshrc",
            ShellProfile::Bash => ".bashrc",
            ShellProfile::Sh => ".profile",
            ShellProfile::Custom(p) => {
                let file = p.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
                if file.contains("zsh") {
                    ".zshrc"
                } else if file.contains("bash") {
                    ".bashrc"
                } else {
                    ".profile"
                }
            }
        };
        home.join(name)
    }
}

/// How the resolved command is handed to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    /// Exec `program` with `args`, no shell involved.
    Direct,
    /// `sh -c <line>` or `cmd /C <line>`.
    GenericShell,
    /// `<shell> -c <script>` where the script optionally sources a startup file.
    Profile {
        /// Shell binary.
        shell: PathBuf,
        /// Sourced before the command when set.
        startup_file: Option<PathBuf>,
    },
}

/// Resolved executable, arguments and environment for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Interpreter or executable.
    pub program: String,
    /// Arguments after `program`.
    pub args: Vec<String>,
    /// Wrapping strategy.
    pub launcher: Launcher,
    /// Variables set on the child on top of the inherited environment.
    pub env: Vec<(String, String)>,
    platform: Platform,
}

impl LaunchPlan {
    /// Unwrapped plan running `program` directly on the current platform.
    pub fn direct(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            launcher: Launcher::Direct,
            env: Vec::new(),
            platform: Platform::current(),
        }
    }

    /// Program and arguments joined back into one line.
    ///
    /// Tokens with whitespace are quoted; inline command tokens never have any.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|t| quote(t, self.platform))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// What actually gets passed to the OS: `(program, args)`.
    pub fn invocation(&self) -> (String, Vec<String>) {
        match &self.launcher {
            Launcher::Direct => (self.program.clone(), self.args.clone()),
            Launcher::GenericShell => match self.platform {
                Platform::Windows => ("cmd".to_string(), vec!["/C".to_string(), self.command_line()]),
                _ => ("sh".to_string(), vec!["-c".to_string(), self.command_line()]),
            },
            Launcher::Profile { shell, startup_file } => {
                let line = self.command_line();
                let script = match startup_file {
                    Some(rc) => {
                        let rc = quote_always(&rc.to_string_lossy());
                        format!("[ -f {rc} ] && . {rc} >/dev/null 2>&1; {line}")
                    }
                    None => line,
                };
                (shell.to_string_lossy().into_owned(), vec!["-c".to_string(), script])
            }
        }
    }

    /// Plan to retry with when the preferred shell itself cannot start.
    pub fn fallback(&self) -> Option<LaunchPlan> {
        match self.launcher {
            Launcher::Profile { .. } => Some(LaunchPlan { launcher: Launcher::GenericShell, ..self.clone() }),
            _ => None,
        }
    }
}

fn quote(token: &str, platform: Platform) -> String {
    if !token.is_empty() && !token.chars().any(char::is_whitespace) {
        return token.to_string();
    }
    match platform {
        Platform::Windows => format!("\"{token}\""),
        _ => quote_always(token),
    }
}

fn quote_always(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// `PATH` with the platform's standard bin dirs prepended when missing.
pub fn augment_path(current: Option<&str>, platform: Platform) -> String {
    let sep = platform.path_separator();
    let existing: Vec<&str> = current.unwrap_or_default().split(sep).filter(|s| !s.is_empty()).collect();
    let mut parts: Vec<&str> = Vec::new();
    for dir in platform.standard_bin_dirs() {
        if !existing.contains(dir) {
            parts.push(dir);
        }
    }
    parts.extend(existing.iter().copied());
    parts.join(sep)
}

/// Interpreter and arguments for a script file, by extension.
pub fn interpreter_for(path: &Path) -> CoreResult<(String, Vec<String>)> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let p = path.to_string_lossy().into_owned();
    let (program, args) = match ext.as_str() {
        "bat" | "cmd" => ("cmd", vec!["/c".to_string(), p]),
        "sh" => ("bash", vec![p]),
        "py" => ("python", vec![p]),
        "js" => ("node", vec![p]),
        "ps1" => (
            "powershell",
            vec!["-ExecutionPolicy".to_string(), "Bypass".to_string(), "-File".to_string(), p],
        ),
        _ => return Err(CoreError::UnsupportedFileType(path.display().to_string())),
    };
    Ok((program.to_string(), args))
}

/// Program and arguments from a command line, split on whitespace.
pub fn split_command(command: &str) -> CoreResult<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts
        .next()
        .ok_or_else(|| CoreError::InvalidJobConfiguration("command is empty".to_string()))?;
    Ok((program, parts.collect()))
}

/// Build the launch plan for `job`.
pub fn resolve(job: &JobDescriptor, prefs: &ExecPrefs, host: &Host) -> CoreResult<LaunchPlan> {
    let (program, args) = match &job.target {
        JobTarget::FileScript { path } => {
            if path.as_os_str().is_empty() {
                return Err(CoreError::InvalidJobConfiguration("script path is empty".to_string()));
            }
            interpreter_for(path)?
        }
        JobTarget::InlineCommand { command } => split_command(command)?,
    };

    let launcher = match host.platform {
        Platform::Windows => Launcher::GenericShell,
        _ => {
            let profile = ShellProfile::from_prefs(prefs);
            let startup_file = match (&host.home, prefs.load_shell_config) {
                (Some(home), true) => Some(profile.startup_file(home)),
                _ => None,
            };
            Launcher::Profile { shell: profile.program(), startup_file }
        }
    };

    let env = vec![("PATH".to_string(), augment_path(host.path.as_deref(), host.platform))];
    Ok(LaunchPlan { program, args, launcher, env, platform: host.platform })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix_host() -> Host {
        Host {
            platform: Platform::Unix,
            home: Some(PathBuf::from("/home/u")),
            path: Some("/usr/bin:/home/u/bin".to_string()),
        }
    }

    fn file_job(path: &str) -> JobDescriptor {
        JobDescriptor::new("f", JobTarget::FileScript { path: path.into() })
    }

    fn cmd_job(command: &str) -> JobDescriptor {
        JobDescriptor::new("c", JobTarget::InlineCommand { command: command.into() })
    }

    #[test]
    fn extension_table_is_exact() {
        let cases: &[(&str, &str, &[&str])] = &[
            ("a.bat", "cmd", &["/c", "a.bat"]),
            ("a.cmd", "cmd", &["/c", "a.cmd"]),
            ("a.sh", "bash", &["a.sh"]),
            ("a.py", "python", &["a.py"]),
            ("a.js", "node", &["a.js"]),
            ("a.ps1", "powershell", &["-ExecutionPolicy", "Bypass", "-File", "a.ps1"]),
        ];
        for (path, program, args) in cases {
            let plan = resolve(&file_job(path), &ExecPrefs::default(), &unix_host()).unwrap();
            assert_eq!(&plan.program, program, "{path}");
            assert_eq!(plan.args, args.iter().map(|s| s.to_string()).collect::<Vec<_>>(), "{path}");
        }
    }

    #[test]
    fn extension_match_ignores_case() {
        let plan = resolve(&file_job("/tmp/Deploy.PS1"), &ExecPrefs::default(), &unix_host()).unwrap();
        assert_eq!(plan.program, "powershell");
        let (program, _) = interpreter_for(Path::new("RUN.Sh")).unwrap();
        assert_eq!(program, "bash");
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        for path in ["notes.txt", "Makefile", "archive.tar.gz"] {
            let err = resolve(&file_job(path), &ExecPrefs::default(), &unix_host()).unwrap_err();
            assert!(matches!(err, CoreError::UnsupportedFileType(_)), "{path}: {err}");
        }
    }

    #[test]
    fn inline_command_is_split_on_whitespace() {
        let plan = resolve(&cmd_job("echo hi"), &ExecPrefs::default(), &unix_host()).unwrap();
        assert_eq!(plan.program, "echo");
        assert_eq!(plan.args, vec!["hi".to_string()]);

        let plan = resolve(&cmd_job("  ls   -la\t/tmp "), &ExecPrefs::default(), &unix_host()).unwrap();
        assert_eq!(plan.program, "ls");
        assert_eq!(plan.args, vec!["-la".to_string(), "/tmp".to_string()]);
    }

    #[test]
    fn empty_targets_are_invalid() {
        for job in [file_job(""), cmd_job(""), cmd_job("   ")] {
            let err = resolve(&job, &ExecPrefs::default(), &unix_host()).unwrap_err();
            assert!(matches!(err, CoreError::InvalidJobConfiguration(_)), "{err}");
        }
    }

    #[test]
    fn path_gets_missing_standard_dirs_prepended() {
        let p = augment_path(Some("/usr/bin:/home/u/bin"), Platform::Unix);
        assert_eq!(p, "/usr/local/bin:/bin:/usr/sbin:/sbin:/usr/bin:/home/u/bin");

        let p = augment_path(None, Platform::Windows);
        assert_eq!(p, r"C:\Windows\System32;C:\Windows");

        let full = augment_path(Some("/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin"), Platform::Unix);
        assert_eq!(full, "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin");
    }

    #[test]
    fn unix_plan_sources_startup_file() {
        let prefs = ExecPrefs { preferred_shell: PreferredShell::Bash, ..ExecPrefs::default() };
        let plan = resolve(&cmd_job("echo hi"), &prefs, &unix_host()).unwrap();
        let (program, args) = plan.invocation();
        assert_eq!(program, "/bin/bash");
        assert_eq!(args[0], "-c");
        assert_eq!(args[1], "[ -f '/home/u/.bashrc' ] && . '/home/u/.bashrc' >/dev/null 2>&1; echo hi");
        assert_eq!(plan.env[0].0, "PATH");
    }

    #[test]
    fn disabled_config_loading_only_exports_path() {
        let prefs = ExecPrefs { load_shell_config: false, ..ExecPrefs::default() };
        let plan = resolve(&cmd_job("echo hi"), &prefs, &unix_host()).unwrap();
        assert_eq!(plan.launcher, Launcher::Profile { shell: "/bin/zsh".into(), startup_file: None });
        assert_eq!(plan.invocation().1, vec!["-c".to_string(), "echo hi".to_string()]);
        assert!(plan.env[0].1.starts_with("/usr/local/bin:"));
    }

    #[test]
    fn custom_shell_infers_startup_file() {
        let prefs = ExecPrefs {
            preferred_shell: PreferredShell::Custom,
            custom_shell_path: Some("/opt/bin/bash5".into()),
            load_shell_config: true,
        };
        let profile = ShellProfile::from_prefs(&prefs);
        assert_eq!(profile.program(), PathBuf::from("/opt/bin/bash5"));
        assert_eq!(profile.startup_file(Path::new("/h")), PathBuf::from("/h/.bashrc"));

        let fish = ShellProfile::Custom("/usr/bin/fish".into());
        assert_eq!(fish.startup_file(Path::new("/h")), PathBuf::from("/h/.profile"));

        let blank = ExecPrefs { custom_shell_path: Some(" ".into()), ..prefs };
        assert_eq!(ShellProfile::from_prefs(&blank), ShellProfile::Zsh);
    }

    #[test]
    fn paths_with_spaces_are_quoted_in_the_shell_line() {
        let prefs = ExecPrefs { load_shell_config: false, ..ExecPrefs::default() };
        let plan = resolve(&file_job("/home/u/my jobs/it's.sh"), &prefs, &unix_host()).unwrap();
        assert_eq!(plan.command_line(), r"bash '/home/u/my jobs/it'\''s.sh'");
    }

    #[test]
    fn profile_plan_falls_back_to_generic_shell() {
        let plan = resolve(&cmd_job("echo hi"), &ExecPrefs::default(), &unix_host()).unwrap();
        let fb = plan.fallback().unwrap();
        assert_eq!(fb.invocation(), ("sh".to_string(), vec!["-c".to_string(), "echo hi".to_string()]));
        assert!(fb.fallback().is_none());
        assert_eq!(fb.env, plan.env);
    }

    #[test]
    fn windows_runs_through_cmd() {
        let host = Host { platform: Platform::Windows, home: None, path: None };
        let plan = resolve(&file_job(r"C:\jobs\nightly.bat"), &ExecPrefs::default(), &host).unwrap();
        assert_eq!(plan.launcher, Launcher::GenericShell);
        let (program, args) = plan.invocation();
        assert_eq!(program, "cmd");
        assert_eq!(args, vec!["/C".to_string(), r"cmd /c C:\jobs\nightly.bat".to_string()]);
        assert!(plan.fallback().is_none());
    }
}
