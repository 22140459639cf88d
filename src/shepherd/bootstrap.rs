use anyhow::Context as _;
use nix::unistd::{fork, setsid, ForkResult, Gid, Uid};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

/// Drop the supervisor's own privileges before any child is spawned. Group
/// defaults to the user's primary group. gid must change before uid does.
pub fn switch_user_group(user: Option<&str>, group: Option<&str>) -> anyhow::Result<()> {
    let mut gid = None;
    if let Some(name) = group {
        let g = users::get_group_by_name(name)
            .ok_or_else(|| anyhow::anyhow!("group not found: {name}"))?;
        gid = Some(g.gid());
    }
    let mut uid = None;
    if let Some(name) = user {
        let u = users::get_user_by_name(name)
            .ok_or_else(|| anyhow::anyhow!("user not found: {name}"))?;
        uid = Some(u.uid());
        if gid.is_none() {
            gid = Some(u.primary_group_id());
        }
    }
    if let Some(gid) = gid {
        nix::unistd::setgid(Gid::from_raw(gid)).with_context(|| format!("setgid({gid})"))?;
    }
    if let Some(uid) = uid {
        nix::unistd::setuid(Uid::from_raw(uid)).with_context(|| format!("setuid({uid})"))?;
    }
    Ok(())
}

/// Fork into the background: the parent exits, the child becomes a session
/// leader with stdio on /dev/null. Must run before the async runtime starts.
pub fn daemonize() -> anyhow::Result<()> {
    // SAFETY: the process is still single-threaded here.
    match unsafe { fork() }.context("fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid")?;

    let stdin = File::open("/dev/null").context("open /dev/null")?;
    nix::unistd::dup2(stdin.as_raw_fd(), 0).context("redirect stdin")?;
    let sink = OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .context("open /dev/null for writing")?;
    nix::unistd::dup2(sink.as_raw_fd(), 1).context("redirect stdout")?;
    nix::unistd::dup2(sink.as_raw_fd(), 2).context("redirect stderr")?;
    Ok(())
}

pub fn write_pid_file(path: &Path) -> anyhow::Result<()> {
    let pid = std::process::id();
    std::fs::write(path, format!("{pid}\n"))
        .map_err(|e| anyhow::anyhow!("failed to write pid file {}: {e}", path.display()))
}

pub fn remove_pid_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}
