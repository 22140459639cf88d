use crate::shepherd::config::{CommandSpec, DaemonSpec, StdoutMode};
use crate::shepherd::log::Logger;
use anyhow::Context as _;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, Stdio};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

/// Cap on captured admin-command stdout; anything past this is dropped and
/// the output ends with a truncation marker.
pub const ADMIN_OUTPUT_LIMIT: usize = 64 * 1024;

const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// How a process finished: normal exit code or terminating signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    Code(i32),
    Signal(i32),
}

impl ExitDisposition {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            ExitDisposition::Code(code)
        } else if let Some(sig) = status.signal() {
            ExitDisposition::Signal(sig)
        } else {
            ExitDisposition::Code(-1)
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ExitDisposition::Code(c) => format!("code={c}"),
            ExitDisposition::Signal(s) => format!("signal={s}"),
        }
    }
}

/// Exit observation delivered to the reactor by a waiter thread, exactly once
/// per spawned child. The epoch lets the reactor discard stale observations
/// after a record has moved on.
#[derive(Debug)]
pub struct ExitNotice {
    pub name: String,
    pub epoch: u64,
    pub exit: ExitDisposition,
}

/// A running managed child. The process itself is owned by its waiter thread;
/// the handle keeps what the reactor needs to observe and signal it.
#[derive(Debug)]
pub struct ChildHandle {
    pid: Pid,
    started_at: Instant,
}

impl ChildHandle {
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Deliver a signal to the child's process group. Children run in their
    /// own session, so a shell-wrapped command dies together with whatever it
    /// spawned. No error if the group is already gone.
    pub fn signal(&self, sig: Signal) {
        let _ = killpg(self.pid, sig);
    }
}

pub fn parse_signal(s: &str) -> anyhow::Result<Signal> {
    let raw = s.trim().to_uppercase();
    let name = raw.strip_prefix("SIG").unwrap_or(&raw);
    let sig = match name {
        "TERM" => Signal::SIGTERM,
        "KILL" => Signal::SIGKILL,
        "INT" => Signal::SIGINT,
        "HUP" => Signal::SIGHUP,
        "QUIT" => Signal::SIGQUIT,
        "ABRT" => Signal::SIGABRT,
        "ALRM" => Signal::SIGALRM,
        "USR1" => Signal::SIGUSR1,
        "USR2" => Signal::SIGUSR2,
        _ => anyhow::bail!("unsupported signal: {s}"),
    };
    Ok(sig)
}

/// Signal used to stop this daemon when it has no stop_command.
pub fn stop_signal(spec: &DaemonSpec) -> Signal {
    spec.stop_signal
        .as_deref()
        .and_then(|s| parse_signal(s).ok())
        .unwrap_or(Signal::SIGTERM)
}

fn resolve_identity(spec: &DaemonSpec) -> anyhow::Result<(Option<u32>, Option<u32>)> {
    let mut uid = None;
    let mut gid = None;
    if let Some(name) = &spec.user {
        let u = users::get_user_by_name(name)
            .ok_or_else(|| anyhow::anyhow!("user not found: {name}"))?;
        uid = Some(u.uid());
        // Group defaults to the user's primary group unless set explicitly.
        gid = Some(u.primary_group_id());
    }
    if let Some(name) = &spec.group {
        let g = users::get_group_by_name(name)
            .ok_or_else(|| anyhow::anyhow!("group not found: {name}"))?;
        gid = Some(g.gid());
    }
    Ok((uid, gid))
}

/// Assemble a `Command` with the daemon's composed run context: argv shape,
/// cwd, environment overlay, and a `pre_exec` that detaches the child into
/// its own session and drops privileges.
///
/// Used for the start command, the stop command, and admin commands alike, so
/// all three see the same identity and environment.
fn build_command(
    spec: &DaemonSpec,
    command: &CommandSpec,
    argv0: Option<&str>,
) -> anyhow::Result<Command> {
    let argv = command.argv();
    anyhow::ensure!(!argv.is_empty(), "command argv must not be empty");

    let mut cmd = Command::new(&argv[0]);
    if argv.len() > 1 {
        cmd.args(&argv[1..]);
    }
    if let Some(a0) = argv0 {
        cmd.arg0(a0);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    cmd.envs(&spec.environment);
    cmd.stdin(Stdio::null());

    let (uid, gid) = resolve_identity(spec)?;

    // Child-side setup order: new session first (so ^C at shepherd's terminal
    // never reaches the children), then gid before uid.
    unsafe {
        cmd.pre_exec(move || {
            let _ = nix::unistd::setsid();
            if let Some(gid) = gid {
                nix::unistd::setgid(nix::unistd::Gid::from_raw(gid)).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        format!("setgid({gid}) failed: {e}"),
                    )
                })?;
            }
            if let Some(uid) = uid {
                nix::unistd::setuid(nix::unistd::Uid::from_raw(uid)).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        format!("setuid({uid}) failed: {e}"),
                    )
                })?;
            }
            Ok(())
        });
    }

    Ok(cmd)
}

/// Spawn the daemon's start command. On success the exit observation will
/// arrive on `exits` exactly once, from a detached waiter thread.
pub fn spawn_daemon(
    spec: &DaemonSpec,
    epoch: u64,
    logger: &Logger,
    exits: &UnboundedSender<ExitNotice>,
) -> anyhow::Result<ChildHandle> {
    let mut cmd = build_command(spec, &spec.start_command, spec.argv0.as_deref())?;
    match spec.stdout {
        StdoutMode::Console => {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
        StdoutMode::DevNull => {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
        StdoutMode::Log => {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn daemon={}", spec.name))?;
    let pid = Pid::from_raw(child.id() as i32);

    if let Some(pipe) = child.stdout.take() {
        spawn_line_pump(spec.name.clone(), pipe, *logger);
    }
    if let Some(pipe) = child.stderr.take() {
        spawn_line_pump(spec.name.clone(), pipe, *logger);
    }

    let name = spec.name.clone();
    let tx = exits.clone();
    std::thread::spawn(move || {
        let exit = match child.wait() {
            Ok(status) => ExitDisposition::from_status(status),
            Err(_) => ExitDisposition::Code(-1),
        };
        let _ = tx.send(ExitNotice { name, epoch, exit });
    });

    Ok(ChildHandle {
        pid,
        started_at: Instant::now(),
    })
}

/// Forward captured output line by line into the logging sink, tagged with
/// the daemon name. Runs until the pipe closes; pipe closure says nothing
/// about the child's liveness.
fn spawn_line_pump<R: Read + Send + 'static>(name: String, pipe: R, logger: Logger) {
    std::thread::spawn(move || {
        let reader = BufReader::new(pipe);
        for line in reader.lines() {
            match line {
                Ok(line) => logger.event("output", Some(&name), line),
                Err(_) => break,
            }
        }
    });
}

/// Run the daemon's stop command as a fire-and-forget helper. It gets the
/// managed child's pid in `DAEMON_PID`; its own output is discarded and its
/// exit only logged. The reply to the operator mirrors the managed child's
/// exit, not this helper's.
pub fn run_stop_command(spec: &DaemonSpec, child_pid: i32, logger: &Logger) -> anyhow::Result<()> {
    let stop = spec
        .stop_command
        .as_ref()
        .context("daemon has no stop_command")?;
    let mut cmd = build_command(spec, stop, None)?;
    cmd.env("DAEMON_PID", child_pid.to_string());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());

    let mut helper = cmd
        .spawn()
        .with_context(|| format!("spawn stop_command daemon={}", spec.name))?;

    let name = spec.name.clone();
    let logger = *logger;
    std::thread::spawn(move || match helper.wait() {
        Ok(status) => {
            let exit = ExitDisposition::from_status(status);
            logger.event("stop", Some(&name), format!("stop_command {}", exit.describe()));
        }
        Err(e) => {
            logger.event("stop", Some(&name), format!("stop_command wait failed: {e}"));
        }
    });
    Ok(())
}

/// Run an admin command to completion, capturing up to [`ADMIN_OUTPUT_LIMIT`]
/// bytes of stdout. Blocking; callers run this on a dedicated thread.
pub fn run_admin_command(
    spec: &DaemonSpec,
    command: &CommandSpec,
) -> anyhow::Result<(String, ExitDisposition)> {
    let mut cmd = build_command(spec, command, None)?;
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn admin command daemon={}", spec.name))?;
    let mut pipe = child
        .stdout
        .take()
        .context("admin command stdout pipe missing")?;
    let output = read_capped(&mut pipe)?;
    let status = child.wait().context("wait for admin command")?;
    Ok((output, ExitDisposition::from_status(status)))
}

fn read_capped<R: Read>(pipe: &mut R) -> anyhow::Result<String> {
    let mut captured: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).context("read admin command output")?;
        if n == 0 {
            break;
        }
        if captured.len() < ADMIN_OUTPUT_LIMIT {
            let take = n.min(ADMIN_OUTPUT_LIMIT - captured.len());
            captured.extend_from_slice(&chunk[..take]);
            if take < n {
                truncated = true;
            }
        } else {
            // Keep draining so the child never blocks on a full pipe.
            truncated = true;
        }
    }
    let mut output = String::from_utf8_lossy(&captured).into_owned();
    if truncated {
        output.push_str(TRUNCATION_MARKER);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shepherd::config::DaemonSpec;
    use tokio::sync::mpsc::unbounded_channel;

    fn spec(name: &str, command: CommandSpec) -> DaemonSpec {
        let mut s = DaemonSpec::from_exec(name, "unused");
        s.start_command = command;
        s
    }

    #[test]
    fn parse_signal_accepts_bare_and_prefixed_names() {
        assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("sigusr1").unwrap(), Signal::SIGUSR1);
        assert_eq!(parse_signal("SIGKILL").unwrap(), Signal::SIGKILL);
        assert!(parse_signal("WINCH").is_err());
    }

    #[test]
    fn admin_command_captures_stdout_and_exit() {
        let s = spec("t", CommandSpec::Shell("echo hello".into()));
        let (out, exit) =
            run_admin_command(&s, &CommandSpec::Exec(vec!["echo".into(), "hi".into()])).unwrap();
        assert_eq!(out, "hi\n");
        assert_eq!(exit, ExitDisposition::Code(0));
    }

    #[test]
    fn admin_command_reports_nonzero_exit() {
        let s = spec("t", CommandSpec::Shell("true".into()));
        let (_, exit) = run_admin_command(&s, &CommandSpec::Shell("exit 3".into())).unwrap();
        assert_eq!(exit, ExitDisposition::Code(3));
    }

    #[test]
    fn admin_output_is_truncated_with_marker() {
        let s = spec("t", CommandSpec::Shell("true".into()));
        let big = CommandSpec::Shell("yes x | head -c 100000".into());
        let (out, exit) = run_admin_command(&s, &big).unwrap();
        assert_eq!(exit, ExitDisposition::Code(0));
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(out.len(), ADMIN_OUTPUT_LIMIT + TRUNCATION_MARKER.len());
    }

    #[test]
    fn spawn_failure_is_an_error_not_a_child() {
        let s = spec(
            "t",
            CommandSpec::Exec(vec!["/nonexistent/surely-not-here".into()]),
        );
        let (tx, _rx) = unbounded_channel();
        assert!(spawn_daemon(&s, 1, &Logger::quiet(), &tx).is_err());
    }

    #[test]
    fn waiter_delivers_exactly_one_exit_notice() {
        let s = spec("t", CommandSpec::Shell("exit 7".into()));
        let (tx, mut rx) = unbounded_channel();
        let handle = spawn_daemon(&s, 42, &Logger::quiet(), &tx).unwrap();
        assert!(handle.pid() > 0);
        let notice = rx.blocking_recv().expect("exit notice");
        assert_eq!(notice.name, "t");
        assert_eq!(notice.epoch, 42);
        assert_eq!(notice.exit, ExitDisposition::Code(7));
        assert!(rx.try_recv().is_err());
    }
}
