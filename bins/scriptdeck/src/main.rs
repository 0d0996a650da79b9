mod dispatch;
mod module;
#[cfg(feature = "web-api")]
mod web;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use deck_core::cfg::{self, AppId, Dirs};
use deck_core::job::PreferredShell;
use deck_core::{logx, Deck, Event, ExecPrefs, JobDescriptor, JobTarget};
use tracing::{info, warn};

use crate::dispatch::{write_chunk, Dispatcher};
use crate::module::{Module, ModuleCtx};

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Run and schedule local scripts")]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Keep config and records under this directory instead of the platform dirs.
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage job descriptors.
    #[command(subcommand)]
    Jobs(JobsCmd),
    /// Run one job now and stream its output.
    Run { id: String },
    /// Show or change execution preferences.
    #[command(subcommand)]
    Prefs(PrefsCmd),
    /// Keep running: fire schedules, start auto-start jobs.
    Serve(ServeArgs),
}

#[derive(Subcommand)]
enum JobsCmd {
    List {
        #[arg(long)]
        json: bool,
    },
    Show { id: String },
    Add(AddArgs),
    Rm { id: String },
}

#[derive(Args)]
struct AddArgs {
    #[arg(long)]
    name: String,
    #[command(flatten)]
    target: TargetArgs,
    /// Cron expression, five or six fields.
    #[arg(long)]
    cron: Option<String>,
    #[arg(long)]
    disabled: bool,
    #[arg(long)]
    auto_start: bool,
    /// Replace the job with this id instead of creating one.
    #[arg(long)]
    id: Option<String>,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    #[arg(long)]
    file: Option<PathBuf>,
    #[arg(long)]
    command: Option<String>,
}

#[derive(Subcommand)]
enum PrefsCmd {
    Show,
    Set {
        #[arg(long, value_enum)]
        shell: Option<ShellArg>,
        #[arg(long)]
        custom_shell: Option<String>,
        #[arg(long)]
        load_shell_config: Option<bool>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ShellArg { Auto, Zsh, Bash, Sh, Custom }

impl From<ShellArg> for PreferredShell {
    fn from(s: ShellArg) -> Self {
        match s {
            ShellArg::Auto => PreferredShell::Auto,
            ShellArg::Zsh => PreferredShell::Zsh,
            ShellArg::Bash => PreferredShell::Bash,
            ShellArg::Sh => PreferredShell::Sh,
            ShellArg::Custom => PreferredShell::Custom,
        }
    }
}

#[derive(Args)]
struct ServeArgs {
    /// HTTP control plane address (web-api builds only).
    #[arg(long)]
    http: Option<std::net::SocketAddr>,
    #[arg(long)]
    https: Option<std::net::SocketAddr>,
    #[arg(long)]
    cert: Option<String>,
    #[arg(long)]
    key: Option<String>,
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    #[cfg(feature = "rt-single")]
    let mut builder = tokio::runtime::Builder::new_current_thread();
    #[cfg(not(feature = "rt-single"))]
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().build()
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = match &cli.home {
        Some(home) => Dirs::under(home)?,
        None => Dirs::for_app(&APP)?,
    };
    let cfg = cfg::load_or_init(&dirs).context("config")?;
    let level = match cli.verbose {
        0 => cfg.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    logx::init(level);

    let rt = runtime().context("tokio runtime")?;
    let code = rt.block_on(run_command(cli.cmd, dirs.data_dir(&cfg), cfg.grace()))?;
    std::process::exit(code);
}

async fn run_command(cmd: Command, data_dir: PathBuf, grace: Duration) -> Result<i32> {
    let (deck, events) = Deck::open(&data_dir, grace)?;
    info!("{} data dir {}", APP.application, data_dir.display());
    match cmd {
        Command::Jobs(cmd) => jobs(&deck, cmd).map(|_| 0),
        Command::Run { id } => run(&deck, events, &id).await,
        Command::Prefs(cmd) => prefs(&deck, cmd).map(|_| 0),
        Command::Serve(args) => serve(deck, events, args, grace).await.map(|_| 0),
    }
}

fn jobs(deck: &Deck, cmd: JobsCmd) -> Result<()> {
    match cmd {
        JobsCmd::List { json } => {
            let jobs = deck.list_jobs()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                for j in jobs {
                    println!("{}", describe(&j));
                }
            }
        }
        JobsCmd::Show { id } => {
            let job = deck.get_job(&id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobsCmd::Add(args) => {
            let target = match (args.target.file, args.target.command) {
                (Some(path), _) => JobTarget::FileScript { path },
                (None, Some(command)) => JobTarget::InlineCommand { command },
                (None, None) => bail!("one of --file or --command is required"),
            };
            let mut job = JobDescriptor::new(args.name, target);
            if let Some(id) = args.id {
                job.id = id;
            }
            job.schedule = args.cron;
            job.enabled = !args.disabled;
            job.auto_start = args.auto_start;
            let saved = deck.save_job(job)?;
            println!("{}", saved.job.id);
            if let Some(e) = saved.schedule_error {
                eprintln!("warning: saved without a timer: {e}");
            }
        }
        JobsCmd::Rm { id } => deck.delete_job(&id)?,
    }
    Ok(())
}

fn describe(j: &JobDescriptor) -> String {
    let (kind, target) = match &j.target {
        JobTarget::FileScript { path } => ("file", path.display().to_string()),
        JobTarget::InlineCommand { command } => ("command", command.clone()),
    };
    let state = if j.enabled { "enabled" } else { "disabled" };
    format!("{}\t{}\t{}\t{}\t{}\t{}", j.id, j.name, kind, target, j.schedule.as_deref().unwrap_or("-"), state)
}

fn prefs(deck: &Deck, cmd: PrefsCmd) -> Result<()> {
    match cmd {
        PrefsCmd::Show => println!("{}", serde_json::to_string_pretty(&deck.exec_prefs()?)?),
        PrefsCmd::Set { shell, custom_shell, load_shell_config } => {
            let mut p: ExecPrefs = deck.exec_prefs()?;
            if let Some(s) = shell {
                p.preferred_shell = s.into();
            }
            if custom_shell.is_some() {
                p.custom_shell_path = custom_shell;
            }
            if let Some(load) = load_shell_config {
                p.load_shell_config = load;
            }
            deck.save_exec_prefs(&p)?;
            println!("{}", serde_json::to_string_pretty(&p)?);
        }
    }
    Ok(())
}

async fn run(deck: &Deck, mut events: tokio::sync::mpsc::UnboundedReceiver<Event>, id: &str) -> Result<i32> {
    let job = deck.get_job(id)?;
    let job_id = job.id.clone();
    let printer = tokio::spawn(async move {
        while let Some(ev) = events.recv().await {
            match ev {
                Event::ScriptOutput(chunk) => write_chunk(&chunk),
                Event::RunFinished { job_id: done, .. } | Event::RunRejected { job_id: done, .. }
                    if done == job_id =>
                {
                    break
                }
                _ => {}
            }
        }
    });

    let result = deck.execute(&job).await;
    let _ = printer.await;
    if !result.success && result.exit_code.is_none() {
        eprintln!("{}: {}", job.name, result.error.trim_end());
    }
    Ok(result.exit_code.unwrap_or(1))
}

async fn serve(
    deck: Deck,
    events: tokio::sync::mpsc::UnboundedReceiver<Event>,
    args: ServeArgs,
    grace: Duration,
) -> Result<()> {
    let deck = Arc::new(deck);
    for (id, e) in deck.start()? {
        warn!(job = %id, error = %e, "not scheduled");
    }
    for job in deck.auto_start_jobs()? {
        if let Err(e) = deck.launch(&job) {
            warn!(job = %job.id, error = %e, "auto-start failed");
        }
    }

    let (sd_tx, sd_rx) = tokio::sync::watch::channel(false);
    let ctx = ModuleCtx { deck: deck.clone(), shutdown: sd_rx };

    #[cfg_attr(not(feature = "web-api"), allow(unused_mut))]
    let mut modules: Vec<Box<dyn Module>> = vec![Box::new(Dispatcher::new(events, true))];
    #[cfg(feature = "web-api")]
    {
        if args.http.is_some() || args.https.is_some() {
            modules.push(Box::new(web::WebServer::new(args.http, args.https, args.cert, args.key)));
        }
    }
    #[cfg(not(feature = "web-api"))]
    {
        if args.http.is_some() || args.https.is_some() || args.cert.is_some() || args.key.is_some() {
            warn!("built without web-api; ignoring --http/--https");
        }
    }

    let handles: Vec<_> = modules
        .into_iter()
        .map(|m| {
            let name = m.name();
            info!("starting module {name}");
            (name, m.spawn(ctx.clone()))
        })
        .collect();

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    deck.shutdown();

    let deadline = Instant::now() + grace + Duration::from_secs(1);
    while !deck.list_running().is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let _ = sd_tx.send(true);
    for (name, h) in handles {
        match h.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("module {name} failed: {e:#}"),
            Err(e) => warn!("module {name} panicked: {e}"),
        }
    }
    Ok(())
}
