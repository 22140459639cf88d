use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

pub const DEFAULT_CONTROL_SOCKET: &str = "/var/run/daemonshepherd/control";

/// One control request: a single JSON object on a single line, dispatched by
/// its `command` field. One request per connection, one reply, then close.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Reload,
    Ps,
    Start { daemon: String },
    Stop { daemon: String },
    Restart { daemon: String },
    CancelRestart { daemon: String },
    ListCommands { daemon: String },
    AdminCommand { daemon: String, admin_command: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<ReplyResult>,
    },
    Error {
        message: String,
    },
}

impl Reply {
    pub fn ok(result: Option<ReplyResult>) -> Self {
        Reply::Ok { result }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyResult {
    Ps(Vec<PsEntry>),
    Commands(Vec<String>),
    Outcome(CommandOutcome),
}

/// One `ps` row. `since_ts` is when the daemon entered its current state;
/// `next_wake` is the scheduled restart, both as unix timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsEntry {
    pub name: String,
    pub state: String,
    pub pid: Option<i32>,
    pub since_ts: i64,
    pub restart_cursor: usize,
    pub next_wake: Option<i64>,
}

/// Exit disposition of a finished process, plus whatever stdout was captured.
/// Exactly one of `exit` and `signal` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl CommandOutcome {
    pub fn from_exit(output: String, exit: crate::shepherd::child::ExitDisposition) -> Self {
        use crate::shepherd::child::ExitDisposition;
        match exit {
            ExitDisposition::Code(c) => CommandOutcome {
                output,
                exit: Some(c),
                signal: None,
            },
            ExitDisposition::Signal(s) => CommandOutcome {
                output,
                exit: None,
                signal: Some(s),
            },
        }
    }
}

/// Send one request over the control socket and read back the reply line.
/// Transport and framing problems are errors; an `error` reply is not, the
/// caller decides what it means.
pub fn client_call(sock: &Path, req: &Request) -> anyhow::Result<Reply> {
    let mut stream = UnixStream::connect(sock).map_err(|e| {
        anyhow::anyhow!("failed to connect to shepherd socket {}: {e}", sock.display())
    })?;

    let line = serde_json::to_string(req)? + "\n";
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut reply_line = String::new();
    reader.read_line(&mut reply_line)?;
    if reply_line.trim().is_empty() {
        anyhow::bail!("empty reply from shepherd");
    }
    let reply: Reply = serde_json::from_str(reply_line.trim_end())?;
    Ok(reply)
}
