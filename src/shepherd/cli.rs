use crate::shepherd::bootstrap;
use crate::shepherd::config::{DaemonSpec, RosterSource, StdoutMode};
use crate::shepherd::daemon::{self, ShepherdConfig};
use crate::shepherd::log::Logger;
use crate::shepherd::restart::RestartStrategy;
use crate::shepherd::rpc;
use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "shepherd", version, about = "daemon supervisor")]
pub struct Args {
    /// Roster configuration YAML
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Control socket path
    #[arg(long = "socket", default_value = rpc::DEFAULT_CONTROL_SOCKET)]
    pub socket: PathBuf,

    /// Supervise a command without a config file: NAME=COMMAND (repeatable)
    #[arg(long = "exec", value_name = "NAME=COMMAND")]
    pub exec: Vec<String>,

    /// Detach from the terminal and run in the background
    #[arg(long = "daemonize")]
    pub daemonize: bool,

    /// Write the supervisor pid to this file (after detaching)
    #[arg(long = "pid-file")]
    pub pid_file: Option<PathBuf>,

    /// Drop privileges to this user before starting any daemon
    #[arg(long = "user")]
    pub user: Option<String>,

    /// Drop privileges to this group (defaults to the user's primary group)
    #[arg(long = "group")]
    pub group: Option<String>,

    /// Working directory for --exec daemons
    #[arg(long = "cwd")]
    pub cwd: Option<PathBuf>,

    /// Output mode for --exec daemons: console, /dev/null, or log
    #[arg(long = "stdout", value_parser = parse_stdout_mode)]
    pub stdout: Option<StdoutMode>,

    /// Restart delays for --exec daemons, in seconds, comma separated
    #[arg(long = "restart")]
    pub restart: Option<String>,

    /// Start priority for --exec daemons (lower starts first)
    #[arg(long = "priority")]
    pub priority: Option<i32>,
}

fn parse_stdout_mode(s: &str) -> Result<StdoutMode, String> {
    match s {
        "console" => Ok(StdoutMode::Console),
        "/dev/null" => Ok(StdoutMode::DevNull),
        "log" => Ok(StdoutMode::Log),
        other => Err(format!(
            "invalid stdout mode {other:?} (use console, /dev/null, or log)"
        )),
    }
}

fn parse_restart(s: &str) -> anyhow::Result<RestartStrategy> {
    let delays = s
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u64>()
                .map_err(|e| anyhow::anyhow!("invalid restart delay {part:?}: {e}"))
        })
        .collect::<anyhow::Result<Vec<u64>>>()?;
    RestartStrategy::new(delays)
}

/// Build the roster source from either a config file or the simplified
/// `--exec` roster merged with the command-line defaults.
fn roster_source(args: &Args) -> anyhow::Result<RosterSource> {
    match (&args.config, args.exec.is_empty()) {
        (Some(_), false) => anyhow::bail!("--config and --exec are mutually exclusive"),
        (None, true) => anyhow::bail!("either --config or at least one --exec is required"),
        (Some(path), true) => Ok(RosterSource::File(path.clone())),
        (None, false) => {
            let mut specs: Vec<DaemonSpec> = Vec::with_capacity(args.exec.len());
            for entry in &args.exec {
                let (name, command) = entry
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("--exec expects NAME=COMMAND, got {entry:?}"))?;
                anyhow::ensure!(!name.is_empty(), "--exec daemon name must not be empty");
                anyhow::ensure!(
                    !command.trim().is_empty(),
                    "--exec command must not be empty"
                );
                anyhow::ensure!(
                    !specs.iter().any(|s| s.name == name),
                    "duplicate --exec daemon name: {name}"
                );
                let mut spec = DaemonSpec::from_exec(name, command);
                spec.cwd = args.cwd.clone();
                if let Some(mode) = args.stdout {
                    spec.stdout = mode;
                }
                if let Some(restart) = &args.restart {
                    spec.restart = parse_restart(restart)?;
                }
                if let Some(priority) = args.priority {
                    spec.start_priority = priority;
                }
                specs.push(spec);
            }
            Ok(RosterSource::Static(specs))
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let source = roster_source(&args)?;
    // Surface configuration errors on the terminal, before detaching.
    source.load()?;

    bootstrap::switch_user_group(args.user.as_deref(), args.group.as_deref())?;
    if args.daemonize {
        bootstrap::daemonize()?;
    }
    if let Some(path) = &args.pid_file {
        bootstrap::write_pid_file(path)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let result = runtime.block_on(daemon::run(ShepherdConfig {
        socket: args.socket.clone(),
        source,
        logger: Logger::stderr(),
    }));

    if let Some(path) = &args.pid_file {
        bootstrap::remove_pid_file(path);
    }
    result
}
