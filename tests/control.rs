//! End-to-end tests: a real reactor on a scratch Unix socket, driven through
//! the control protocol exactly like shepctl drives it.

use daemonshepherd::shepherd::config::{CommandSpec, DaemonSpec, RosterSource};
use daemonshepherd::shepherd::daemon::{self, ShepherdConfig};
use daemonshepherd::shepherd::log::Logger;
use daemonshepherd::shepherd::restart::RestartStrategy;
use daemonshepherd::shepherd::rpc::{client_call, PsEntry, Reply, ReplyResult, Request};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

struct Harness {
    socket: PathBuf,
    _dir: tempfile::TempDir,
}

fn start_shepherd(source: RosterSource) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control");
    let cfg = ShepherdConfig {
        socket: socket.clone(),
        source,
        logger: Logger::quiet(),
    };
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let _ = rt.block_on(daemon::run(cfg));
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if client_call(&socket, &Request::Ps).is_ok() {
            break;
        }
        assert!(Instant::now() < deadline, "control socket never came up");
        std::thread::sleep(Duration::from_millis(25));
    }
    Harness { socket, _dir: dir }
}

fn ps(socket: &Path) -> Vec<PsEntry> {
    match client_call(socket, &Request::Ps).unwrap() {
        Reply::Ok {
            result: Some(ReplyResult::Ps(rows)),
        } => rows,
        other => panic!("unexpected ps reply: {other:?}"),
    }
}

fn ps_entry(socket: &Path, name: &str) -> Option<PsEntry> {
    ps(socket).into_iter().find(|r| r.name == name)
}

fn wait_for(mut cond: impl FnMut() -> bool, secs: u64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(secs);
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn spec(name: &str, command: &str) -> DaemonSpec {
    DaemonSpec::from_exec(name, command)
}

#[test]
fn ps_shows_running_daemon_and_stop_mirrors_signal() {
    let mut a = spec("a", "unused");
    a.start_command = CommandSpec::Exec(vec!["sleep".into(), "300".into()]);
    let h = start_shepherd(RosterSource::Static(vec![a]));

    assert!(wait_for(
        || ps_entry(&h.socket, "a").is_some_and(|r| r.state == "running" && r.pid.is_some()),
        5
    ));
    let row = ps_entry(&h.socket, "a").unwrap();
    assert!(row.pid.unwrap() > 0);
    assert_eq!(row.next_wake, None);
    assert_eq!(row.restart_cursor, 0);

    // sleep does not handle SIGTERM, so the reply mirrors a signal death.
    let reply = client_call(&h.socket, &Request::Stop { daemon: "a".into() }).unwrap();
    match reply {
        Reply::Ok {
            result: Some(ReplyResult::Outcome(outcome)),
        } => {
            assert_eq!(outcome.output, "");
            assert_eq!(outcome.signal, Some(15));
            assert_eq!(outcome.exit, None);
        }
        other => panic!("unexpected stop reply: {other:?}"),
    }

    let row = ps_entry(&h.socket, "a").unwrap();
    assert_eq!(row.state, "stopped");
    assert_eq!(row.pid, None);

    // Stopping a stopped daemon is a no-op: ok, result absent.
    let reply = client_call(&h.socket, &Request::Stop { daemon: "a".into() }).unwrap();
    assert!(matches!(reply, Reply::Ok { result: None }));
}

#[test]
fn crashing_daemon_cools_down_with_capped_cursor() {
    let mut b = spec("b", "exit 1");
    b.restart = RestartStrategy::new(vec![0, 0, 60]).unwrap();
    let h = start_shepherd(RosterSource::Static(vec![b]));

    // Two immediate restarts burn through the zeros, then the tail delay
    // holds the daemon in cooling_down with the cursor capped at the end.
    assert!(wait_for(
        || ps_entry(&h.socket, "b")
            .is_some_and(|r| r.state == "cooling_down" && r.restart_cursor == 2),
        10
    ));
    let row = ps_entry(&h.socket, "b").unwrap();
    let wake = row.next_wake.expect("cooling_down must carry next_wake");
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    assert!(wake <= now + 61, "wake {wake} too far from now {now}");

    let reply = client_call(
        &h.socket,
        &Request::CancelRestart { daemon: "b".into() },
    )
    .unwrap();
    assert!(matches!(reply, Reply::Ok { result: None }));
    let row = ps_entry(&h.socket, "b").unwrap();
    assert_eq!(row.state, "stopped");
    assert_eq!(row.next_wake, None);

    // No spawn happens while parked.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(ps_entry(&h.socket, "b").unwrap().state, "stopped");

    // An operator start begins a fresh run (and the crash loop resumes).
    let reply = client_call(&h.socket, &Request::Start { daemon: "b".into() }).unwrap();
    assert!(matches!(reply, Reply::Ok { result: None }));
    assert!(wait_for(
        || ps_entry(&h.socket, "b").is_some_and(|r| r.state == "cooling_down"),
        10
    ));

    let _ = client_call(
        &h.socket,
        &Request::CancelRestart { daemon: "b".into() },
    );
}

#[test]
fn stop_command_runs_in_daemon_context() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("stopped.marker");
    let mut svc = spec("svc", "unused");
    svc.start_command = CommandSpec::Exec(vec!["sleep".into(), "300".into()]);
    svc.stop_command = Some(CommandSpec::Shell(format!(
        "touch {} && kill -TERM $DAEMON_PID",
        marker.display()
    )));
    let h = start_shepherd(RosterSource::Static(vec![svc]));

    assert!(wait_for(
        || ps_entry(&h.socket, "svc").is_some_and(|r| r.state == "running"),
        5
    ));

    // The reply mirrors the managed child's exit, not the stop helper's.
    let reply = client_call(&h.socket, &Request::Stop { daemon: "svc".into() }).unwrap();
    match reply {
        Reply::Ok {
            result: Some(ReplyResult::Outcome(outcome)),
        } => {
            assert_eq!(outcome.output, "");
            assert_eq!(outcome.signal, Some(15));
        }
        other => panic!("unexpected stop reply: {other:?}"),
    }
    assert!(marker.exists(), "stop_command did not run");
    assert_eq!(ps_entry(&h.socket, "svc").unwrap().state, "stopped");
}

#[test]
fn admin_commands_list_run_and_reject_unknowns() {
    let mut d = spec("d", "unused");
    d.start_command = CommandSpec::Exec(vec!["sleep".into(), "300".into()]);
    // Deliberately not alphabetical: the listing must follow declaration order.
    d.commands.push((
        "zeta".into(),
        CommandSpec::Exec(vec!["echo".into(), "hello world".into()]),
    ));
    d.commands
        .push(("alpha".into(), CommandSpec::Shell("exit 3".into())));
    let h = start_shepherd(RosterSource::Static(vec![d]));

    match client_call(
        &h.socket,
        &Request::ListCommands { daemon: "d".into() },
    )
    .unwrap()
    {
        Reply::Ok {
            result: Some(ReplyResult::Commands(names)),
        } => assert_eq!(names, vec!["zeta", "alpha"]),
        other => panic!("unexpected list reply: {other:?}"),
    }

    match client_call(
        &h.socket,
        &Request::AdminCommand {
            daemon: "d".into(),
            admin_command: "zeta".into(),
        },
    )
    .unwrap()
    {
        Reply::Ok {
            result: Some(ReplyResult::Outcome(outcome)),
        } => {
            assert_eq!(outcome.output, "hello world\n");
            assert_eq!(outcome.exit, Some(0));
        }
        other => panic!("unexpected admin reply: {other:?}"),
    }

    match client_call(
        &h.socket,
        &Request::AdminCommand {
            daemon: "d".into(),
            admin_command: "alpha".into(),
        },
    )
    .unwrap()
    {
        Reply::Ok {
            result: Some(ReplyResult::Outcome(outcome)),
        } => assert_eq!(outcome.exit, Some(3)),
        other => panic!("unexpected admin reply: {other:?}"),
    }

    assert!(matches!(
        client_call(
            &h.socket,
            &Request::AdminCommand {
                daemon: "d".into(),
                admin_command: "bogus".into(),
            },
        )
        .unwrap(),
        Reply::Error { .. }
    ));
    assert!(matches!(
        client_call(&h.socket, &Request::Start { daemon: "ghost".into() }).unwrap(),
        Reply::Error { .. }
    ));

    let _ = client_call(&h.socket, &Request::Stop { daemon: "d".into() });
}

#[test]
fn reload_keeps_unchanged_replaces_changed_and_evicts_removed() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("shepherd.yaml");
    let v1 = "daemons:\n  a:\n    start_command: [\"sleep\", \"300\"]\n    restart: [1]\n";
    std::fs::write(&config, v1).unwrap();
    let h = start_shepherd(RosterSource::File(config.clone()));

    assert!(wait_for(
        || ps_entry(&h.socket, "a").is_some_and(|r| r.state == "running"),
        5
    ));
    let pid1 = ps_entry(&h.socket, "a").unwrap().pid.unwrap();

    // Identical roster: the record, its child and its pid survive.
    std::fs::write(&config, v1).unwrap();
    let reply = client_call(&h.socket, &Request::Reload).unwrap();
    assert!(matches!(reply, Reply::Ok { result: None }));
    assert_eq!(ps_entry(&h.socket, "a").unwrap().pid, Some(pid1));

    // Changed definition: old child is stopped, new one starts on its exit.
    let v2 = "daemons:\n  a:\n    start_command: [\"sleep\", \"301\"]\n    restart: [1]\n";
    std::fs::write(&config, v2).unwrap();
    let reply = client_call(&h.socket, &Request::Reload).unwrap();
    assert!(matches!(reply, Reply::Ok { result: None }));
    assert!(wait_for(
        || ps_entry(&h.socket, "a")
            .is_some_and(|r| r.state == "running" && r.pid.is_some() && r.pid != Some(pid1)),
        10
    ));
    assert_eq!(ps_entry(&h.socket, "a").unwrap().restart_cursor, 0);

    // Unparsable config: reload fails, the roster stays as it was.
    std::fs::write(&config, "daemons: [this is not a mapping\n").unwrap();
    let reply = client_call(&h.socket, &Request::Reload).unwrap();
    assert!(matches!(reply, Reply::Error { .. }));
    assert!(ps_entry(&h.socket, "a").is_some_and(|r| r.state == "running"));

    // Removed from the roster: stopped, then evicted.
    std::fs::write(&config, "daemons: {}\n").unwrap();
    let reply = client_call(&h.socket, &Request::Reload).unwrap();
    assert!(matches!(reply, Reply::Ok { result: None }));
    assert!(wait_for(|| ps(&h.socket).is_empty(), 10));
}

#[test]
fn malformed_and_unknown_requests_get_error_replies() {
    let h = start_shepherd(RosterSource::Static(vec![]));

    for raw in ["not json\n", "{\"command\":\"explode\"}\n", "{}\n"] {
        let mut stream = std::os::unix::net::UnixStream::connect(&h.socket).unwrap();
        stream.write_all(raw.as_bytes()).unwrap();
        stream.flush().unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let reply: Reply = serde_json::from_str(line.trim_end()).unwrap();
        assert!(matches!(reply, Reply::Error { .. }), "raw {raw:?}");

        // One request per connection: the server closes after the reply.
        line.clear();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
    }
}
