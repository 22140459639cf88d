use crate::shepherd::rpc::{self, client_call, PsEntry, Reply, ReplyResult, Request};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "shepctl", version, about = "shepherd control client")]
pub struct Args {
    /// Shepherd control socket
    #[arg(short = 's', long = "socket", default_value = rpc::DEFAULT_CONTROL_SOCKET)]
    pub socket: PathBuf,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Reload the daemon roster from configuration
    Reload,
    /// Show all daemons and their states
    Ps {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Start a daemon
    Start { daemon: String },
    /// Stop a daemon and wait for it to exit
    Stop { daemon: String },
    /// Restart a daemon
    Restart { daemon: String },
    /// Cancel a scheduled restart; the daemon stays stopped
    CancelRestart { daemon: String },
    /// List admin commands declared for a daemon
    ListCommands { daemon: String },
    /// Run a declared admin command and print its captured output
    AdminCommand { daemon: String, command: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Returns the process exit code. `stop`, `restart` and `admin_command`
/// mirror the target's exit (code, or 255+signal); informational commands
/// return 0. Protocol and transport failures become errors, exit 1 upstream.
pub fn run() -> anyhow::Result<i32> {
    let args = Args::parse();
    let (request, mirrors_exit) = match &args.cmd {
        Cmd::Reload => (Request::Reload, false),
        Cmd::Ps { .. } => (Request::Ps, false),
        Cmd::Start { daemon } => (
            Request::Start {
                daemon: daemon.clone(),
            },
            false,
        ),
        Cmd::Stop { daemon } => (
            Request::Stop {
                daemon: daemon.clone(),
            },
            true,
        ),
        Cmd::Restart { daemon } => (
            Request::Restart {
                daemon: daemon.clone(),
            },
            true,
        ),
        Cmd::CancelRestart { daemon } => (
            Request::CancelRestart {
                daemon: daemon.clone(),
            },
            false,
        ),
        Cmd::ListCommands { daemon } => (
            Request::ListCommands {
                daemon: daemon.clone(),
            },
            false,
        ),
        Cmd::AdminCommand { daemon, command } => (
            Request::AdminCommand {
                daemon: daemon.clone(),
                admin_command: command.clone(),
            },
            true,
        ),
    };

    let result = match client_call(&args.socket, &request)? {
        Reply::Error { message } => {
            eprintln!("error: {message}");
            return Ok(1);
        }
        Reply::Ok { result } => result,
    };

    match (&args.cmd, result) {
        (Cmd::Ps { format }, Some(ReplyResult::Ps(rows))) => {
            match format {
                OutputFormat::Text => print!("{}", render_ps(&rows)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
            Ok(0)
        }
        (Cmd::ListCommands { .. }, Some(ReplyResult::Commands(names))) => {
            for name in names {
                println!("{name}");
            }
            Ok(0)
        }
        (_, Some(ReplyResult::Outcome(outcome))) => {
            if !outcome.output.is_empty() {
                print!("{}", outcome.output);
                if !outcome.output.ends_with('\n') {
                    println!();
                }
            }
            if mirrors_exit {
                if let Some(code) = outcome.exit {
                    return Ok(code);
                }
                if let Some(sig) = outcome.signal {
                    return Ok(255 + sig);
                }
            }
            Ok(0)
        }
        _ => Ok(0),
    }
}

fn fmt_ts(ts: i64) -> String {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn render_ps(rows: &[PsEntry]) -> String {
    let headers = ["daemon", "state", "pid", "since", "cursor", "next_wake"];
    let table: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            vec![
                r.name.clone(),
                r.state.clone(),
                r.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                fmt_ts(r.since_ts),
                r.restart_cursor.to_string(),
                r.next_wake.map(fmt_ts).unwrap_or_else(|| "-".into()),
            ]
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &table {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let border = {
        let mut out = String::from("+");
        for w in &widths {
            out.push_str(&"-".repeat(w + 2));
            out.push('+');
        }
        out
    };
    let line = |cells: &[String]| {
        let mut out = String::from("|");
        for (i, w) in widths.iter().enumerate() {
            let cell = cells.get(i).map(|s| s.as_str()).unwrap_or("");
            out.push(' ');
            out.push_str(cell);
            out.push_str(&" ".repeat(w - cell.len()));
            out.push_str(" |");
        }
        out
    };

    let mut out = String::new();
    out.push_str(&border);
    out.push('\n');
    out.push_str(&line(
        &headers.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
    ));
    out.push('\n');
    out.push_str(&border);
    out.push('\n');
    for row in &table {
        out.push_str(&line(row));
        out.push('\n');
    }
    out.push_str(&border);
    out.push('\n');
    out
}
