use crate::shepherd::child::{self, ChildHandle, ExitDisposition, ExitNotice};
use crate::shepherd::config::{DaemonSpec, RosterSource};
use crate::shepherd::log::Logger;
use crate::shepherd::rpc::{CommandOutcome, PsEntry, Reply, ReplyResult, Request};
use anyhow::Context as _;
use nix::sys::signal::Signal;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Grace between the stop signal (or stop_command) and SIGKILL.
pub const STOP_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard ceiling on shutdown: after this, remaining children get SIGKILL and
/// shepherd exits without waiting further.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    CoolingDown,
    Stopping,
    Dead,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::CoolingDown => "cooling_down",
            DaemonState::Stopping => "stopping",
            DaemonState::Dead => "dead",
        }
    }
}

/// Runtime state bundle for one named daemon. Owned by the roster; owns its
/// child handle. All mutation happens on the reactor task.
struct DaemonRecord {
    spec: DaemonSpec,
    /// Declaration position within the roster generation; breaks priority ties.
    index: usize,
    generation: u64,
    state: DaemonState,
    child: Option<ChildHandle>,
    /// Bumped on every spawn; exit notices and kill deadlines carrying an
    /// older epoch are stale and ignored.
    epoch: u64,
    restart_cursor: usize,
    last_exit: Option<ExitDisposition>,
    /// Scheduled restart: reactor deadline plus the unix timestamp shown in `ps`.
    next_wake: Option<(Instant, i64)>,
    since: SystemTime,
    restart_intent: bool,
    /// Removed by reload; evicted once the child is gone.
    doomed: bool,
    /// Operators blocked in `stop`/`restart`, answered when the child exits.
    stop_replies: Vec<oneshot::Sender<Reply>>,
}

impl DaemonRecord {
    fn new(spec: DaemonSpec, index: usize, generation: u64) -> Self {
        DaemonRecord {
            spec,
            index,
            generation,
            state: DaemonState::Stopped,
            child: None,
            epoch: 0,
            restart_cursor: 0,
            last_exit: None,
            next_wake: None,
            since: SystemTime::now(),
            restart_intent: false,
            doomed: false,
            stop_replies: Vec::new(),
        }
    }

    fn set_state(&mut self, state: DaemonState) {
        self.state = state;
        self.since = SystemTime::now();
    }

    fn sort_key(&self) -> (i32, usize) {
        (self.spec.start_priority, self.index)
    }
}

/// A parsed control request plus the channel its reply goes back on. The
/// reply may be deferred (stop/restart block until the child exits; admin
/// commands answer from their runner thread).
struct CtlRequest {
    request: Request,
    reply: oneshot::Sender<Reply>,
}

#[derive(Debug)]
enum TimerKind {
    RestartWake { name: String },
    KillDeadline { name: String, epoch: u64 },
    ShutdownKill,
}

#[derive(Debug)]
struct Timer {
    at: Instant,
    seq: u64,
    kind: TimerKind,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

pub struct ShepherdConfig {
    pub socket: PathBuf,
    pub source: RosterSource,
    pub logger: Logger,
}

struct Shepherd {
    logger: Logger,
    source: RosterSource,
    records: Vec<DaemonRecord>,
    generation: u64,
    epoch_counter: u64,
    timer_seq: u64,
    timers: BinaryHeap<Reverse<Timer>>,
    draining: bool,
    force_exit: bool,
    exits_tx: UnboundedSender<ExitNotice>,
}

/// Run the supervisor until shutdown. Config or socket failures here are
/// boot-fatal; the caller turns them into exit code 1.
pub async fn run(cfg: ShepherdConfig) -> anyhow::Result<()> {
    let specs = cfg.source.load()?;
    prepare_socket(&cfg.socket)?;
    let listener = UnixListener::bind(&cfg.socket).map_err(|e| {
        anyhow::anyhow!(
            "failed to bind control socket {}: {e}",
            cfg.socket.display()
        )
    })?;

    let (exits_tx, mut exits_rx) = unbounded_channel();
    let (ctl_tx, mut ctl_rx) = unbounded_channel();
    let mut shepherd = Shepherd::new(cfg.logger, cfg.source, exits_tx);
    shepherd.install_roster(specs);

    let mut sighup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    shepherd.logger.event(
        "boot",
        None,
        format!(
            "{} daemons, control socket {}",
            shepherd.records.len(),
            cfg.socket.display()
        ),
    );
    shepherd.start_all();

    loop {
        tokio::select! {
            biased;
            Some(notice) = exits_rx.recv() => shepherd.on_child_exit(notice),
            Some(ctl) = ctl_rx.recv() => shepherd.on_control(ctl),
            _ = sighup.recv() => shepherd.on_sighup(),
            _ = sigint.recv() => shepherd.begin_shutdown("SIGINT"),
            _ = sigterm.recv() => shepherd.begin_shutdown("SIGTERM"),
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => spawn_connection(stream, ctl_tx.clone(), shepherd.logger),
                Err(e) => shepherd.logger.event("control", None, format!("accept error: {e}")),
            },
            _ = wake_at(shepherd.next_deadline()) => shepherd.fire_timers(),
        }
        if shepherd.force_exit || (shepherd.draining && shepherd.no_live_children()) {
            break;
        }
    }

    shepherd
        .logger
        .event("shutdown", None, "all daemons stopped, exiting");
    let _ = std::fs::remove_file(&cfg.socket);
    Ok(())
}

async fn wake_at(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if let Some(parent) = sock.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "failed to create socket directory {}: {e}",
                    parent.display()
                )
            })?;
        }
    }
    if sock.exists() {
        // If something is already listening, fail. Otherwise remove the stale socket.
        match std::os::unix::net::UnixStream::connect(sock) {
            Ok(_) => anyhow::bail!(
                "shepherd already running (socket {} is accepting connections)",
                sock.display()
            ),
            Err(_) => {
                std::fs::remove_file(sock).map_err(|e| {
                    anyhow::anyhow!("failed to remove stale socket {}: {e}", sock.display())
                })?;
            }
        }
    }
    Ok(())
}

fn spawn_connection(stream: UnixStream, ctl: UnboundedSender<CtlRequest>, logger: Logger) {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, ctl).await {
            logger.event("control", None, format!("connection error: {e:#}"));
        }
    });
}

async fn handle_connection(
    stream: UnixStream,
    ctl: UnboundedSender<CtlRequest>,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || line.trim().is_empty() {
        return Ok(());
    }
    let mut stream = reader.into_inner();

    let reply = match serde_json::from_str::<Request>(line.trim_end()) {
        Ok(request) => {
            let (tx, rx) = oneshot::channel();
            if ctl.send(CtlRequest { request, reply: tx }).is_err() {
                Reply::error("shepherd is shutting down")
            } else {
                // The reactor (or an admin runner thread) answers when the
                // request has fully committed.
                match rx.await {
                    Ok(reply) => reply,
                    Err(_) => Reply::error("request dropped during shutdown"),
                }
            }
        }
        Err(e) => Reply::error(format!("bad request: {e}")),
    };

    let line = serde_json::to_string(&reply)? + "\n";
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn unix_ts(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

fn unix_ts_in(delay: Duration) -> i64 {
    unix_ts(SystemTime::now() + delay)
}

/// Start the stop sequence for one record: run its stop_command if it has
/// one, otherwise deliver the stop signal to the child's process group.
/// Returns the (name, epoch) pair the caller arms a kill deadline for.
fn deliver_stop(logger: &Logger, rec: &mut DaemonRecord) -> Option<(String, u64)> {
    let Some(handle) = rec.child.as_ref() else {
        rec.set_state(DaemonState::Stopped);
        return None;
    };
    let pid = handle.pid();
    if rec.spec.stop_command.is_some() {
        logger.event("stop", Some(&rec.spec.name), "running stop_command");
        if let Err(e) = child::run_stop_command(&rec.spec, pid, logger) {
            let sig = child::stop_signal(&rec.spec);
            logger.event(
                "stop",
                Some(&rec.spec.name),
                format!("stop_command failed ({e:#}), falling back to {sig:?}"),
            );
            handle.signal(sig);
        }
    } else {
        let sig = child::stop_signal(&rec.spec);
        logger.event("stop", Some(&rec.spec.name), format!("sending {sig:?}"));
        handle.signal(sig);
    }
    rec.next_wake = None;
    rec.set_state(DaemonState::Stopping);
    Some((rec.spec.name.clone(), rec.epoch))
}

enum AfterExit {
    Nothing,
    Evict,
    SpawnNow,
    Schedule,
}

impl Shepherd {
    fn new(logger: Logger, source: RosterSource, exits_tx: UnboundedSender<ExitNotice>) -> Self {
        Shepherd {
            logger,
            source,
            records: Vec::new(),
            generation: 0,
            epoch_counter: 0,
            timer_seq: 0,
            timers: BinaryHeap::new(),
            draining: false,
            force_exit: false,
            exits_tx,
        }
    }

    fn install_roster(&mut self, specs: Vec<DaemonSpec>) {
        let generation = self.generation;
        self.records = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| DaemonRecord::new(spec, index, generation))
            .collect();
    }

    fn live_index_of(&self, name: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.spec.name == name && !r.doomed)
    }

    fn no_live_children(&self) -> bool {
        self.records.iter().all(|r| r.child.is_none())
    }

    fn arm_timer(&mut self, at: Instant, kind: TimerKind) {
        self.timer_seq += 1;
        self.timers.push(Reverse(Timer {
            at,
            seq: self.timer_seq,
            kind,
        }));
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse(t)| t.at)
    }

    fn sort_key_of(&self, name: &str) -> (i32, usize) {
        self.live_index_of(name)
            .map(|i| self.records[i].sort_key())
            .unwrap_or((i32::MAX, usize::MAX))
    }

    /// Initial boot: spawn everything in ascending (priority, declaration)
    /// order. Ordering only; nothing waits for anything to become ready.
    fn start_all(&mut self) {
        let mut order: Vec<usize> = (0..self.records.len()).collect();
        order.sort_by_key(|&i| self.records[i].sort_key());
        for idx in order {
            let _ = self.spawn_at(idx);
        }
    }

    /// Spawn the record's start command. On failure the restart policy takes
    /// over (synthetic exit code -1) and the error is also returned so a
    /// direct `start` request can report it.
    fn spawn_at(&mut self, idx: usize) -> anyhow::Result<()> {
        self.epoch_counter += 1;
        let epoch = self.epoch_counter;
        let logger = self.logger;
        let tx = self.exits_tx.clone();
        let rec = &mut self.records[idx];
        rec.epoch = epoch;
        rec.set_state(DaemonState::Starting);
        match child::spawn_daemon(&rec.spec, epoch, &logger, &tx) {
            Ok(handle) => {
                logger.event(
                    "daemon",
                    Some(&rec.spec.name),
                    format!("started pid={}", handle.pid()),
                );
                rec.child = Some(handle);
                rec.next_wake = None;
                rec.set_state(DaemonState::Running);
                Ok(())
            }
            Err(e) => {
                logger.event(
                    "daemon",
                    Some(&rec.spec.name),
                    format!("spawn failed: {e:#}"),
                );
                rec.last_exit = Some(ExitDisposition::Code(-1));
                self.schedule_restart(idx);
                Err(e)
            }
        }
    }

    /// Move the record into cooling_down with a wake per its strategy, then
    /// advance the cursor.
    fn schedule_restart(&mut self, idx: usize) {
        let logger = self.logger;
        let (name, at) = {
            let rec = &mut self.records[idx];
            let delay = rec.spec.restart.delay(rec.restart_cursor);
            rec.restart_cursor = rec.spec.restart.advance(rec.restart_cursor);
            let at = Instant::now() + delay;
            rec.next_wake = Some((at, unix_ts_in(delay)));
            rec.set_state(DaemonState::CoolingDown);
            logger.event(
                "daemon",
                Some(&rec.spec.name),
                format!("next start in {}s", delay.as_secs()),
            );
            (rec.spec.name.clone(), at)
        };
        self.arm_timer(at, TimerKind::RestartWake { name });
    }

    fn begin_stop(&mut self, idx: usize) {
        let logger = self.logger;
        if let Some((name, epoch)) = deliver_stop(&logger, &mut self.records[idx]) {
            self.arm_timer(
                Instant::now() + STOP_KILL_TIMEOUT,
                TimerKind::KillDeadline { name, epoch },
            );
        }
    }

    fn on_child_exit(&mut self, notice: ExitNotice) {
        let Some(idx) = self
            .records
            .iter()
            .position(|r| r.spec.name == notice.name && r.epoch == notice.epoch)
        else {
            return;
        };
        let logger = self.logger;
        let draining = self.draining;
        let after = {
            let rec = &mut self.records[idx];
            let Some(handle) = rec.child.take() else {
                return;
            };
            rec.last_exit = Some(notice.exit);
            let ran_for = handle.started_at().elapsed();
            logger.event(
                "daemon",
                Some(&rec.spec.name),
                format!("exited {}", notice.exit.describe()),
            );

            // Operators blocked in stop/restart get the child's disposition.
            let outcome = CommandOutcome::from_exit(String::new(), notice.exit);
            for reply in rec.stop_replies.drain(..) {
                let _ = reply.send(Reply::ok(Some(ReplyResult::Outcome(outcome.clone()))));
            }

            if rec.doomed {
                rec.set_state(DaemonState::Dead);
                logger.event("daemon", Some(&rec.spec.name), "removed from roster");
                AfterExit::Evict
            } else if rec.state == DaemonState::Stopping {
                if rec.restart_intent && !draining {
                    rec.restart_intent = false;
                    rec.restart_cursor = 0;
                    AfterExit::SpawnNow
                } else {
                    rec.restart_intent = false;
                    rec.set_state(DaemonState::Stopped);
                    AfterExit::Nothing
                }
            } else if draining {
                rec.set_state(DaemonState::Stopped);
                AfterExit::Nothing
            } else {
                // Unplanned exit. A long enough run settles the cursor back
                // to the head of the strategy.
                if ran_for >= rec.spec.restart.stability_window() {
                    rec.restart_cursor = 0;
                }
                AfterExit::Schedule
            }
        };
        match after {
            AfterExit::Nothing => {}
            AfterExit::Evict => {
                self.records.remove(idx);
            }
            AfterExit::SpawnNow => {
                let _ = self.spawn_at(idx);
            }
            AfterExit::Schedule => self.schedule_restart(idx),
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        let mut wakes: Vec<String> = Vec::new();
        loop {
            let due = matches!(self.timers.peek(), Some(Reverse(t)) if t.at <= now);
            if !due {
                break;
            }
            let Some(Reverse(timer)) = self.timers.pop() else {
                break;
            };
            match timer.kind {
                TimerKind::RestartWake { name } => wakes.push(name),
                TimerKind::KillDeadline { name, epoch } => self.fire_kill_deadline(&name, epoch),
                TimerKind::ShutdownKill => self.fire_shutdown_kill(),
            }
        }
        // Same-tick wakes spawn in ascending (priority, declaration) order.
        if wakes.len() > 1 {
            wakes.sort_by_key(|name| self.sort_key_of(name));
        }
        for name in wakes {
            let Some(idx) = self.live_index_of(&name) else {
                continue;
            };
            let due = {
                let rec = &self.records[idx];
                rec.state == DaemonState::CoolingDown
                    && rec.next_wake.map(|(at, _)| at <= now).unwrap_or(false)
            };
            if due {
                let rec = &mut self.records[idx];
                rec.next_wake = None;
                if let Some(exit) = rec.last_exit {
                    self.logger.event(
                        "daemon",
                        Some(&name),
                        format!("restart wake (last exit {})", exit.describe()),
                    );
                }
                let _ = self.spawn_at(idx);
            }
        }
    }

    fn fire_kill_deadline(&mut self, name: &str, epoch: u64) {
        let Some(rec) = self
            .records
            .iter()
            .find(|r| r.spec.name == name && r.epoch == epoch)
        else {
            return;
        };
        if rec.state != DaemonState::Stopping {
            return;
        }
        if let Some(handle) = &rec.child {
            self.logger.event(
                "stop",
                Some(&rec.spec.name),
                "still running past stop deadline, sending SIGKILL",
            );
            handle.signal(Signal::SIGKILL);
        }
    }

    fn fire_shutdown_kill(&mut self) {
        self.logger.event(
            "shutdown",
            None,
            "shutdown deadline reached, killing remaining children",
        );
        for rec in &self.records {
            if let Some(handle) = &rec.child {
                handle.signal(Signal::SIGKILL);
            }
        }
        self.force_exit = true;
    }

    fn begin_shutdown(&mut self, why: &str) {
        if self.draining {
            return;
        }
        self.draining = true;
        self.logger
            .event("shutdown", None, format!("{why} received, stopping all daemons"));

        for rec in &mut self.records {
            rec.restart_intent = false;
            if rec.state == DaemonState::CoolingDown {
                rec.next_wake = None;
                rec.set_state(DaemonState::Stopped);
            }
        }

        // Descending (priority, declaration) order; the reverse of boot.
        let mut order: Vec<usize> = (0..self.records.len())
            .filter(|&i| self.records[i].child.is_some() && self.records[i].state != DaemonState::Stopping)
            .collect();
        order.sort_by_key(|&i| self.records[i].sort_key());
        order.reverse();
        for idx in order {
            self.begin_stop(idx);
        }
        self.arm_timer(
            Instant::now() + SHUTDOWN_DEADLINE,
            TimerKind::ShutdownKill,
        );
    }

    fn on_sighup(&mut self) {
        if self.draining {
            return;
        }
        self.logger.event("reload", None, "SIGHUP received");
        match self.reload() {
            Ok(()) => self.logger.event(
                "reload",
                None,
                format!("roster reloaded (generation {})", self.generation),
            ),
            Err(e) => self.logger.event(
                "reload",
                None,
                format!("reload failed, keeping old roster: {e:#}"),
            ),
        }
    }

    /// Reload the roster and reconcile. A load error leaves the old roster
    /// untouched and is reported to the requester.
    fn reload(&mut self) -> anyhow::Result<()> {
        let specs = self.source.load()?;
        self.generation += 1;
        let generation = self.generation;
        let logger = self.logger;

        let mut old = std::mem::take(&mut self.records);
        let mut next: Vec<DaemonRecord> = Vec::with_capacity(specs.len());
        let mut queued: Vec<String> = Vec::new();
        let mut kill_deadlines: Vec<(String, u64)> = Vec::new();

        for (index, spec) in specs.into_iter().enumerate() {
            match old.iter().position(|r| r.spec.name == spec.name) {
                Some(pos) => {
                    let mut rec = old.remove(pos);
                    rec.index = index;
                    if rec.doomed {
                        // Re-declared before the old child finished stopping:
                        // keep stopping it, start the new spec once it exits.
                        rec.doomed = false;
                        rec.restart_intent = true;
                        rec.restart_cursor = 0;
                        rec.generation = generation;
                        rec.spec = spec;
                        logger.event(
                            "reload",
                            Some(&rec.spec.name),
                            "re-added while stopping, will start with new definition",
                        );
                        next.push(rec);
                    } else if rec.spec == spec {
                        // Unchanged: record keeps state, cursor and child.
                        next.push(rec);
                    } else if rec.child.is_some() {
                        logger.event("reload", Some(&spec.name), "definition changed, restarting");
                        if rec.state != DaemonState::Stopping {
                            // Stop under the old definition (its stop_command).
                            if let Some(k) = deliver_stop(&logger, &mut rec) {
                                kill_deadlines.push(k);
                            }
                        }
                        rec.restart_intent = true;
                        rec.restart_cursor = 0;
                        rec.generation = generation;
                        rec.spec = spec;
                        next.push(rec);
                    } else {
                        logger.event("reload", Some(&spec.name), "definition changed");
                        rec.restart_cursor = 0;
                        rec.next_wake = None;
                        rec.generation = generation;
                        rec.spec = spec;
                        if rec.state == DaemonState::CoolingDown {
                            rec.set_state(DaemonState::Stopped);
                        }
                        queued.push(rec.spec.name.clone());
                        next.push(rec);
                    }
                }
                None => {
                    logger.event("reload", Some(&spec.name), "added");
                    queued.push(spec.name.clone());
                    next.push(DaemonRecord::new(spec, index, generation));
                }
            }
        }

        // Whatever is left was removed from the configuration.
        for mut rec in old {
            if rec.child.is_some() {
                logger.event("reload", Some(&rec.spec.name), "removed, stopping");
                rec.doomed = true;
                rec.restart_intent = false;
                rec.next_wake = None;
                if rec.state != DaemonState::Stopping {
                    if let Some(k) = deliver_stop(&logger, &mut rec) {
                        kill_deadlines.push(k);
                    }
                }
                rec.index = next.len();
                next.push(rec);
            } else {
                logger.event("reload", Some(&rec.spec.name), "removed");
            }
        }

        self.records = next;
        for (name, epoch) in kill_deadlines {
            self.arm_timer(
                Instant::now() + STOP_KILL_TIMEOUT,
                TimerKind::KillDeadline { name, epoch },
            );
        }

        // Added (and replaced-while-idle) daemons start like a boot group.
        queued.sort_by_key(|name| self.sort_key_of(name));
        for name in queued {
            if let Some(idx) = self.live_index_of(&name) {
                if self.records[idx].state == DaemonState::Stopped {
                    let _ = self.spawn_at(idx);
                }
            }
        }
        Ok(())
    }

    fn ps_entries(&self) -> Vec<PsEntry> {
        self.records
            .iter()
            .map(|rec| PsEntry {
                name: rec.spec.name.clone(),
                state: rec.state.as_str().to_string(),
                pid: rec.child.as_ref().map(|c| c.pid()),
                since_ts: unix_ts(rec.since),
                restart_cursor: rec.restart_cursor,
                next_wake: rec.next_wake.map(|(_, ts)| ts),
            })
            .collect()
    }

    fn on_control(&mut self, ctl: CtlRequest) {
        let CtlRequest { request, reply } = ctl;
        if self.draining && !matches!(request, Request::Ps) {
            let _ = reply.send(Reply::error("shepherd is shutting down"));
            return;
        }
        match request {
            Request::Reload => {
                let r = match self.reload() {
                    Ok(()) => Reply::ok(None),
                    Err(e) => Reply::error(format!("{e:#}")),
                };
                let _ = reply.send(r);
            }
            Request::Ps => {
                let _ = reply.send(Reply::ok(Some(ReplyResult::Ps(self.ps_entries()))));
            }
            Request::Start { daemon } => self.ctl_start(&daemon, reply),
            Request::Stop { daemon } => self.ctl_stop(&daemon, false, reply),
            Request::Restart { daemon } => self.ctl_stop(&daemon, true, reply),
            Request::CancelRestart { daemon } => self.ctl_cancel_restart(&daemon, reply),
            Request::ListCommands { daemon } => self.ctl_list_commands(&daemon, reply),
            Request::AdminCommand {
                daemon,
                admin_command,
            } => self.ctl_admin(&daemon, &admin_command, reply),
        }
    }

    fn ctl_start(&mut self, name: &str, reply: oneshot::Sender<Reply>) {
        let Some(idx) = self.live_index_of(name) else {
            let _ = reply.send(unknown_daemon(name));
            return;
        };
        let r = match self.records[idx].state {
            DaemonState::Starting | DaemonState::Running | DaemonState::Stopping => Reply::ok(None),
            DaemonState::Stopped | DaemonState::CoolingDown | DaemonState::Dead => {
                {
                    let rec = &mut self.records[idx];
                    rec.restart_cursor = 0;
                    rec.next_wake = None;
                    rec.restart_intent = false;
                }
                match self.spawn_at(idx) {
                    Ok(()) => Reply::ok(None),
                    // A direct start reports its spawn failure; the restart
                    // policy is already scheduling the retry.
                    Err(e) => Reply::error(format!("{e:#}")),
                }
            }
        };
        let _ = reply.send(r);
    }

    fn ctl_stop(&mut self, name: &str, restart: bool, reply: oneshot::Sender<Reply>) {
        let Some(idx) = self.live_index_of(name) else {
            let _ = reply.send(unknown_daemon(name));
            return;
        };
        match self.records[idx].state {
            DaemonState::Stopped | DaemonState::Dead | DaemonState::CoolingDown => {
                if restart {
                    {
                        let rec = &mut self.records[idx];
                        rec.restart_cursor = 0;
                        rec.next_wake = None;
                    }
                    let r = match self.spawn_at(idx) {
                        Ok(()) => Reply::ok(None),
                        Err(e) => Reply::error(format!("{e:#}")),
                    };
                    let _ = reply.send(r);
                } else {
                    // Idempotent stop; cancels a pending restart if any.
                    let rec = &mut self.records[idx];
                    rec.next_wake = None;
                    if rec.state == DaemonState::CoolingDown {
                        rec.set_state(DaemonState::Stopped);
                    }
                    let _ = reply.send(Reply::ok(None));
                }
            }
            DaemonState::Stopping => {
                // Join the stop already in flight.
                let rec = &mut self.records[idx];
                rec.restart_intent = rec.restart_intent || restart;
                rec.stop_replies.push(reply);
            }
            DaemonState::Starting | DaemonState::Running => {
                {
                    let rec = &mut self.records[idx];
                    rec.restart_intent = restart;
                    rec.stop_replies.push(reply);
                }
                self.begin_stop(idx);
            }
        }
    }

    fn ctl_cancel_restart(&mut self, name: &str, reply: oneshot::Sender<Reply>) {
        let Some(idx) = self.live_index_of(name) else {
            let _ = reply.send(unknown_daemon(name));
            return;
        };
        let rec = &mut self.records[idx];
        if rec.state == DaemonState::CoolingDown {
            rec.next_wake = None;
            rec.set_state(DaemonState::Stopped);
            self.logger
                .event("daemon", Some(name), "scheduled restart cancelled");
        }
        let _ = reply.send(Reply::ok(None));
    }

    fn ctl_list_commands(&mut self, name: &str, reply: oneshot::Sender<Reply>) {
        let Some(idx) = self.live_index_of(name) else {
            let _ = reply.send(unknown_daemon(name));
            return;
        };
        let names: Vec<String> = self.records[idx]
            .spec
            .commands
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        let _ = reply.send(Reply::ok(Some(ReplyResult::Commands(names))));
    }

    fn ctl_admin(&mut self, name: &str, command: &str, reply: oneshot::Sender<Reply>) {
        let Some(idx) = self.live_index_of(name) else {
            let _ = reply.send(unknown_daemon(name));
            return;
        };
        let rec = &self.records[idx];
        let Some(cmd) = rec.spec.admin_command(command) else {
            let _ = reply.send(Reply::error(format!(
                "daemon {name} has no admin command {command}"
            )));
            return;
        };
        let spec = rec.spec.clone();
        let cmd = cmd.clone();
        let logger = self.logger;
        let command = command.to_string();
        // The runner owns the reply channel. If the client disconnects, the
        // run still completes and the reply is simply dropped.
        std::thread::spawn(move || {
            let r = match child::run_admin_command(&spec, &cmd) {
                Ok((output, exit)) => {
                    logger.event(
                        "admin",
                        Some(&spec.name),
                        format!("{command} finished {}", exit.describe()),
                    );
                    Reply::ok(Some(ReplyResult::Outcome(CommandOutcome::from_exit(
                        output, exit,
                    ))))
                }
                Err(e) => Reply::error(format!("{e:#}")),
            };
            let _ = reply.send(r);
        });
    }
}

fn unknown_daemon(name: &str) -> Reply {
    Reply::error(format!("no such daemon: {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shepherd::config::{CommandSpec, DaemonSpec};

    fn spec(name: &str, command: &str) -> DaemonSpec {
        DaemonSpec::from_exec(name, command)
    }

    fn quiet_shepherd(specs: Vec<DaemonSpec>) -> Shepherd {
        let (tx, _rx) = unbounded_channel();
        let mut s = Shepherd::new(
            Logger::quiet(),
            RosterSource::Static(specs.clone()),
            tx,
        );
        s.install_roster(specs);
        s
    }

    #[test]
    fn ps_lists_records_in_declaration_order() {
        let s = quiet_shepherd(vec![spec("b", "sleep 1"), spec("a", "sleep 1")]);
        let rows = s.ps_entries();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "b");
        assert_eq!(rows[1].name, "a");
        assert_eq!(rows[0].state, "stopped");
        assert_eq!(rows[0].pid, None);
        assert_eq!(rows[0].next_wake, None);
    }

    #[test]
    fn reload_identical_roster_keeps_cursor() {
        let mut s = quiet_shepherd(vec![spec("a", "sleep 1")]);
        s.records[0].restart_cursor = 3;
        s.reload().unwrap();
        assert_eq!(s.records[0].restart_cursor, 3);
        assert_eq!(s.records[0].generation, 0);
    }

    #[test]
    fn reload_changed_idle_spec_resets_cursor_and_starts() {
        let mut s = quiet_shepherd(vec![spec("a", "sleep 1")]);
        s.records[0].restart_cursor = 2;
        s.source = RosterSource::Static(vec![spec("a", "true")]);
        s.reload().unwrap();
        assert_eq!(s.records[0].restart_cursor, 0);
        assert_eq!(s.records[0].generation, 1);
        assert_eq!(
            s.records[0].spec.start_command,
            CommandSpec::Shell("true".into())
        );
        // Replaced-while-idle records start immediately, like added ones.
        assert!(s.records[0].child.is_some());
    }

    #[test]
    fn reload_removes_idle_records_immediately() {
        let mut s = quiet_shepherd(vec![spec("a", "sleep 1"), spec("b", "sleep 1")]);
        s.source = RosterSource::Static(vec![spec("b", "sleep 1")]);
        s.reload().unwrap();
        assert_eq!(s.records.len(), 1);
        assert_eq!(s.records[0].spec.name, "b");
        assert_eq!(s.records[0].index, 0);
    }

    #[test]
    fn reload_failure_keeps_old_roster() {
        let mut s = quiet_shepherd(vec![spec("a", "sleep 1")]);
        s.records[0].restart_cursor = 1;
        s.source = RosterSource::File(PathBuf::from("/nonexistent/shepherd.yaml"));
        assert!(s.reload().is_err());
        assert_eq!(s.records.len(), 1);
        assert_eq!(s.records[0].restart_cursor, 1);
    }

    #[test]
    fn boot_and_wake_ordering_is_priority_then_declaration() {
        let mut a = spec("a", "true");
        a.start_priority = 20;
        let mut b = spec("b", "true");
        b.start_priority = 10;
        let mut c = spec("c", "true");
        c.start_priority = 10;
        let s = quiet_shepherd(vec![a, b, c]);

        let mut order: Vec<usize> = (0..s.records.len()).collect();
        order.sort_by_key(|&i| s.records[i].sort_key());
        let names: Vec<&str> = order.iter().map(|&i| s.records[i].spec.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);
    }

    #[test]
    fn timers_pop_in_deadline_order() {
        let mut s = quiet_shepherd(vec![]);
        let now = Instant::now();
        s.arm_timer(now + Duration::from_secs(5), TimerKind::ShutdownKill);
        s.arm_timer(
            now + Duration::from_secs(1),
            TimerKind::RestartWake { name: "a".into() },
        );
        s.arm_timer(
            now + Duration::from_secs(3),
            TimerKind::KillDeadline {
                name: "b".into(),
                epoch: 1,
            },
        );
        assert_eq!(s.next_deadline(), Some(now + Duration::from_secs(1)));
        let Some(Reverse(first)) = s.timers.pop() else {
            panic!("heap empty")
        };
        assert!(matches!(first.kind, TimerKind::RestartWake { .. }));
    }
}
