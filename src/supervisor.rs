//! Signal delivery and termination checks for processes on a [`Connection`]'s host.
//!
//! Locally signals are sent with `kill(2)`; remotely with a single `kill` command. Liveness
//! is checked with signal 0, and zombies count as dead since they only wait to be reaped.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use regex::Regex;

use crate::proc::{self, Connection};

/// Interval between liveness checks.
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long to wait for processes to disappear after each signal.
const KILL_GRACE: Duration = Duration::from_secs(4);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to send {signal} to PID(s) {pids} on {host}: {reason}")]
    Signal {
        signal: Signal,
        pids: String,
        host: String,
        reason: String,
    },
    #[error("PID(s) {pids} on {host} survived {signal} and SIGKILL")]
    Survived {
        signal: Signal,
        pids: String,
        host: String,
    },
    #[error("invalid process search pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unexpected `ps` output line on {host}: `{line}`")]
    PsOutput { host: String, line: String },
    #[error(transparent)]
    Proc(#[from] proc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How hard [`kill`] tries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillOptions {
    /// Also signal all descendants of the given PIDs.
    pub kill_children: bool,
    /// Fail with [`Error::Survived`] if anything is still alive after SIGKILL.
    pub must_die: bool,
}

/// A process found by [`find_by_pattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub cmdline: String,
}

/// Sends `signal` to `pids` on the connection's host.
///
/// For SIGTERM and SIGKILL, children can be included and termination is verified: the
/// processes get [`KILL_GRACE`] to disappear, SIGTERM survivors are escalated to SIGKILL and
/// get another grace period. Survivors are an error only with `must_die`.
///
/// # Errors
///
/// - [`Error::Signal`] if the signal could not be delivered to any of the PIDs.
/// - [`Error::Survived`] with `must_die` if processes outlived SIGKILL.
pub async fn kill(
    conn: &Connection,
    pids: &[u32],
    signal: Signal,
    opts: KillOptions,
) -> Result<()> {
    if pids.is_empty() {
        return Ok(());
    }
    let verifiable = matches!(signal, Signal::SIGTERM | Signal::SIGKILL);

    let mut targets: BTreeSet<u32> = pids.iter().copied().collect();
    if verifiable && opts.kill_children {
        targets.extend(descendants(conn, &targets).await?);
    }
    let targets: Vec<u32> = targets.into_iter().collect();
    log::debug!(
        "sending {} to PID(s) {} on {}",
        signal,
        join_pids(&targets),
        conn.hostname()
    );

    send_signal(conn, &targets, signal).await?;
    if !verifiable {
        return Ok(());
    }

    let mut survivors = wait_for_exit(conn, &targets, KILL_GRACE).await?;
    if !survivors.is_empty() && signal == Signal::SIGTERM {
        log::warn!(
            "PID(s) {} on {} survived SIGTERM, sending SIGKILL",
            join_pids(&survivors),
            conn.hostname()
        );
        send_signal(conn, &survivors, Signal::SIGKILL).await?;
        survivors = wait_for_exit(conn, &survivors, KILL_GRACE).await?;
    }

    if survivors.is_empty() {
        return Ok(());
    }
    if opts.must_die {
        return Err(Error::Survived {
            signal,
            pids: join_pids(&survivors),
            host: conn.hostname().to_owned(),
        });
    }
    log::debug!(
        "PID(s) {} on {} are still alive after {}",
        join_pids(&survivors),
        conn.hostname(),
        signal
    );
    Ok(())
}

/// Lists processes whose full command line matches `pattern`.
///
/// On the controller the calling process itself is never reported.
pub async fn find_by_pattern(conn: &Connection, pattern: &str) -> Result<Vec<ProcessEntry>> {
    let regex = Regex::new(pattern).map_err(|source| Error::Pattern {
        pattern: pattern.to_owned(),
        source,
    })?;
    let output = conn.run_verify("ps -e -o pid= -o args=", None).await?;
    let own_pid = (!conn.is_remote()).then(std::process::id);

    let mut found = Vec::new();
    for line in output.stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (pid, cmdline) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let pid = pid.parse::<u32>().map_err(|_| Error::PsOutput {
            host: conn.hostname().to_owned(),
            line: line.to_owned(),
        })?;
        let cmdline = cmdline.trim();
        if Some(pid) == own_pid || !regex.is_match(cmdline) {
            continue;
        }
        found.push(ProcessEntry {
            pid,
            cmdline: cmdline.to_owned(),
        });
    }
    Ok(found)
}

/// Kills every process matching `pattern` and returns what was found.
pub async fn kill_by_pattern(
    conn: &Connection,
    pattern: &str,
    signal: Signal,
    opts: KillOptions,
) -> Result<Vec<ProcessEntry>> {
    let found = find_by_pattern(conn, pattern).await?;
    if found.is_empty() {
        return Ok(found);
    }
    for entry in &found {
        log::debug!(
            "killing PID {} on {}: {}",
            entry.pid,
            conn.hostname(),
            entry.cmdline
        );
    }
    let pids: Vec<u32> = found.iter().map(|e| e.pid).collect();
    kill(conn, &pids, signal, opts).await?;
    Ok(found)
}

/// Returns the subset of `pids` that is still alive.
pub async fn alive(conn: &Connection, pids: &[u32]) -> Result<Vec<u32>> {
    if pids.is_empty() {
        return Ok(Vec::new());
    }
    if !conn.is_remote() {
        return Ok(pids.iter().copied().filter(|pid| local_alive(*pid)).collect());
    }

    let cmd = format!("ps -o pid= -o stat= -p {}", pids_csv(pids));
    // `ps -p` exits non-zero when none of the PIDs exist.
    let output = conn.run(&cmd, None).await?;
    let mut live = Vec::new();
    for line in output.stdout.lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(stat)) = (fields.next(), fields.next()) else {
            continue;
        };
        if stat.starts_with('Z') {
            continue;
        }
        if let Ok(pid) = pid.parse::<u32>() {
            live.push(pid);
        }
    }
    Ok(live)
}

async fn wait_for_exit(conn: &Connection, pids: &[u32], grace: Duration) -> Result<Vec<u32>> {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let live = alive(conn, pids).await?;
        if live.is_empty() || tokio::time::Instant::now() >= deadline {
            return Ok(live);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn send_signal(conn: &Connection, pids: &[u32], signal: Signal) -> Result<()> {
    if !conn.is_remote() {
        let mut failures = Vec::new();
        for pid in pids {
            match nix::sys::signal::kill(Pid::from_raw(*pid as i32), signal) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(err) => failures.push(format!("{pid}: {err}")),
            }
        }
        if !failures.is_empty() && failures.len() == pids.len() {
            return Err(Error::Signal {
                signal,
                pids: join_pids(pids),
                host: conn.hostname().to_owned(),
                reason: failures.join(", "),
            });
        }
        return Ok(());
    }

    let name = signal.as_str().trim_start_matches("SIG");
    let cmd = format!("kill -s {} -- {}", name, join_pids(pids));
    let output = conn.run(&cmd, None).await?;
    if output.success() {
        return Ok(());
    }
    // Partial failures are expected, e.g. a PID that exited because another one was killed.
    let live = alive(conn, pids).await?;
    if live.len() == pids.len() {
        return Err(Error::Signal {
            signal,
            pids: join_pids(pids),
            host: conn.hostname().to_owned(),
            reason: output.stderr.trim().to_owned(),
        });
    }
    Ok(())
}

/// Collects all descendants of `roots` from a single process table snapshot.
async fn descendants(conn: &Connection, roots: &BTreeSet<u32>) -> Result<BTreeSet<u32>> {
    let output = conn.run_verify("ps -e -o ppid= -o pid=", None).await?;
    let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for line in output.stdout.lines() {
        let mut fields = line.split_whitespace();
        if let (Some(Ok(ppid)), Some(Ok(pid))) = (
            fields.next().map(str::parse::<u32>),
            fields.next().map(str::parse::<u32>),
        ) {
            children.entry(ppid).or_default().push(pid);
        }
    }
    Ok(collect_descendants(&children, roots))
}

fn collect_descendants(children: &BTreeMap<u32, Vec<u32>>, roots: &BTreeSet<u32>) -> BTreeSet<u32> {
    let mut found = BTreeSet::new();
    let mut stack: Vec<u32> = roots.iter().copied().collect();
    while let Some(pid) = stack.pop() {
        for child in children.get(&pid).into_iter().flatten() {
            if !roots.contains(child) && found.insert(*child) {
                stack.push(*child);
            }
        }
    }
    found
}

fn local_alive(pid: u32) -> bool {
    if nix::sys::signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    // State is the first field after the parenthesized command name.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_none_or(|state| state != "Z"),
        Err(_) => true,
    }
}

fn join_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn pids_csv(pids: &[u32]) -> String {
    pids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
